//! Liveness and update scheduling: heartbeat cadence, game-info change detection and
//! resend policy, icon gating per connection.

use std::collections::HashSet;
use std::time::Duration;

use crate::config::EngineConfig;
use crate::protocol::GameInfo;

/// Peer-side liveness contract: a session is dead after this many missed heartbeats.
pub const LIVENESS_FACTOR: u32 = 3;

#[derive(Debug)]
pub struct UpdateScheduler {
    heartbeat_ms: u64,
    resend_ms: Option<u64>,
    poll_ms: u64,
    send_icons: bool,
    last_heartbeat: Option<u64>,
    last_game_send: Option<u64>,
    last_game_check: Option<u64>,
    last_sent: Option<GameInfo>,
    current: GameInfo,
    changed: bool,
    last_icon_id: Option<String>,
    icons_sent: HashSet<String>,
}

impl UpdateScheduler {
    pub fn new(cfg: &EngineConfig) -> Self {
        Self {
            heartbeat_ms: cfg.heartbeat_interval().as_millis() as u64,
            resend_ms: cfg.game_update_interval().map(|d| d.as_millis() as u64),
            poll_ms: cfg.poll_interval().as_millis() as u64,
            send_icons: cfg.send_icons,
            last_heartbeat: None,
            last_game_send: None,
            last_game_check: None,
            last_sent: None,
            current: GameInfo::browser(),
            changed: true,
            last_icon_id: None,
            icons_sent: HashSet::new(),
        }
    }

    /// What the peer should currently see.
    pub fn current(&self) -> &GameInfo {
        &self.current
    }

    /// How long the peer waits without a heartbeat before dropping the session.
    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms) * LIVENESS_FACTOR
    }

    pub fn heartbeat_due(&self, now_ms: u64) -> bool {
        elapsed(self.last_heartbeat, now_ms, self.heartbeat_ms)
    }

    pub fn mark_heartbeat(&mut self, now_ms: u64) {
        self.last_heartbeat = Some(now_ms);
    }

    pub fn game_check_due(&self, now_ms: u64) -> bool {
        elapsed(self.last_game_check, now_ms, self.poll_ms)
    }

    pub fn mark_game_checked(&mut self, now_ms: u64) {
        self.last_game_check = Some(now_ms);
    }

    /// Record the detector's latest view. Returns true when `(id, state)` differs from what
    /// was last sent. A pending send stays pending until `mark_game_sent`.
    pub fn observe(&mut self, info: GameInfo) -> bool {
        let info = info.normalized();
        let changed = !self
            .last_sent
            .as_ref()
            .is_some_and(|sent| sent.same_activity(&info));
        if changed && !self.changed {
            tracing::debug!(id = %info.id, state = ?info.state, "game changed");
        }
        self.current = info;
        self.changed |= changed;
        changed
    }

    /// A change is pending, or the periodic resend interval elapsed.
    pub fn game_send_due(&self, now_ms: u64) -> bool {
        if self.changed {
            return true;
        }
        match self.resend_ms {
            Some(interval) => elapsed(self.last_game_send, now_ms, interval),
            None => false,
        }
    }

    pub fn mark_game_sent(&mut self, now_ms: u64) {
        self.last_sent = Some(self.current.clone());
        self.last_game_send = Some(now_ms);
        self.changed = false;
    }

    /// Id of the icon to push now, if any.
    pub fn icon_wanted(&self) -> Option<&str> {
        let id = self.current.id.as_str();
        if !self.send_icons || !self.current.has_icon {
            return None;
        }
        if self.last_icon_id.as_deref() == Some(id) || self.icons_sent.contains(id) {
            return None;
        }
        Some(id)
    }

    /// Record an icon send attempt; the id is not retried in this connection.
    pub fn mark_icon_sent(&mut self, id: &str) {
        self.last_icon_id = Some(id.to_string());
        self.icons_sent.insert(id.to_string());
    }

    /// New connection: the peer has seen nothing yet.
    pub fn on_connected(&mut self) {
        self.changed = true;
        self.last_heartbeat = None;
        self.last_icon_id = None;
        self.icons_sent.clear();
    }

    pub fn on_disconnected(&mut self) {
        self.icons_sent.clear();
    }
}

fn elapsed(last: Option<u64>, now_ms: u64, interval_ms: u64) -> bool {
    last.map_or(true, |t| now_ms.saturating_sub(t) >= interval_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::GameState;

    fn game(id: &str, state: GameState) -> GameInfo {
        GameInfo {
            id: id.into(),
            title: "T".into(),
            state,
            has_icon: true,
            ..GameInfo::default()
        }
    }

    #[test]
    fn unchanged_game_is_sent_once_then_on_resend_interval() {
        let cfg = EngineConfig {
            game_update_interval_ms: 60_000,
            ..EngineConfig::default()
        };
        let mut s = UpdateScheduler::new(&cfg);
        assert!(s.observe(game("ULUS10001", GameState::Playing)));
        assert!(s.game_send_due(0));
        s.mark_game_sent(0);

        assert!(!s.observe(game("ULUS10001", GameState::Playing)));
        assert!(!s.game_send_due(30_000));
        assert!(s.game_send_due(60_000));
    }

    #[test]
    fn resend_disabled_by_zero() {
        let mut s = UpdateScheduler::new(&EngineConfig::default());
        s.observe(game("ULUS10001", GameState::Playing));
        s.mark_game_sent(0);
        s.observe(game("ULUS10001", GameState::Playing));
        assert!(!s.game_send_due(10_000_000));
    }

    #[test]
    fn state_change_is_a_change() {
        let mut s = UpdateScheduler::new(&EngineConfig::default());
        s.observe(game("ULUS10001", GameState::Playing));
        s.mark_game_sent(0);
        let mut g = game("ULUS10001", GameState::Playing);
        g.title = "renamed".into();
        assert!(!s.observe(g));
        assert!(s.observe(game("ULUS10001", GameState::Homebrew)));
        assert!(s.game_send_due(1));
    }

    #[test]
    fn icon_gating() {
        let mut s = UpdateScheduler::new(&EngineConfig::default());
        s.observe(game("ULUS10001", GameState::Playing));
        assert_eq!(s.icon_wanted(), Some("ULUS10001"));
        s.mark_icon_sent("ULUS10001");
        assert_eq!(s.icon_wanted(), None);

        s.observe(game("NPUH10117", GameState::Playing));
        assert_eq!(s.icon_wanted(), Some("NPUH10117"));
        s.mark_icon_sent("NPUH10117");

        // Back to the first title: already sent in this connection.
        s.observe(game("ULUS10001", GameState::Playing));
        assert_eq!(s.icon_wanted(), None);

        s.on_connected();
        assert_eq!(s.icon_wanted(), Some("ULUS10001"));

        let mut no_icon = game("UCUS98632", GameState::Playing);
        no_icon.has_icon = false;
        s.observe(no_icon);
        assert_eq!(s.icon_wanted(), None);
    }

    #[test]
    fn icons_disabled_by_config() {
        let cfg = EngineConfig {
            send_icons: false,
            ..EngineConfig::default()
        };
        let mut s = UpdateScheduler::new(&cfg);
        s.observe(game("ULUS10001", GameState::Playing));
        assert_eq!(s.icon_wanted(), None);
    }

    #[test]
    fn heartbeat_cadence_and_liveness() {
        let mut s = UpdateScheduler::new(&EngineConfig::default());
        assert!(s.heartbeat_due(0));
        s.mark_heartbeat(0);
        assert!(!s.heartbeat_due(29_999));
        assert!(s.heartbeat_due(30_000));
        assert_eq!(s.liveness_timeout(), Duration::from_secs(90));
    }

    #[test]
    fn reconnect_forces_game_send() {
        let mut s = UpdateScheduler::new(&EngineConfig::default());
        s.observe(game("ULUS10001", GameState::Playing));
        s.mark_game_sent(0);
        assert!(!s.game_send_due(1));
        s.on_connected();
        assert!(s.game_send_due(2));
    }

    #[test]
    fn reconnect_send_survives_an_unchanged_poll() {
        let mut s = UpdateScheduler::new(&EngineConfig::default());
        s.observe(game("ULUS10001", GameState::Playing));
        s.mark_game_sent(0);
        s.on_connected();
        assert!(!s.observe(game("ULUS10001", GameState::Playing)));
        assert!(s.game_send_due(1));
        s.mark_game_sent(1);
        assert!(!s.game_send_due(2));
    }

    #[test]
    fn shell_modules_count_as_browser() {
        let mut s = UpdateScheduler::new(&EngineConfig::default());
        s.observe(GameInfo::browser());
        s.mark_game_sent(0);
        assert!(!s.observe(game("XmbControl", GameState::Playing)));
        assert_eq!(s.current().id, "XMB");
    }
}
