//! Game detection from a JSON status file written by the launcher, icons from a directory.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use drp_core::{GameInfo, GameSource};

/// Reads `status_file` when it changes. A missing file means the shell is in front.
pub struct StatusFileSource {
    status_file: PathBuf,
    icon_dir: Option<PathBuf>,
    modified: Option<SystemTime>,
    last: Option<GameInfo>,
}

impl StatusFileSource {
    pub fn new(status_file: PathBuf, icon_dir: Option<PathBuf>) -> Self {
        Self {
            status_file,
            icon_dir,
            modified: None,
            last: None,
        }
    }

    fn icon_path(&self, id: &str) -> Option<PathBuf> {
        // Ids come from the launcher; refuse anything that could leave the icon dir.
        if id.is_empty() || id.contains(['/', '\\']) || id.starts_with('.') {
            return None;
        }
        self.icon_dir.as_ref().map(|d| d.join(format!("{id}.png")))
    }

    fn read(&self, path: &Path) -> Option<GameInfo> {
        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "status file unreadable");
                return None;
            }
        };
        match serde_json::from_slice::<GameInfo>(&bytes) {
            Ok(mut info) => {
                if !info.has_icon {
                    info.has_icon = self.icon_path(&info.id).is_some_and(|p| p.is_file());
                }
                Some(info)
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "bad status file");
                None
            }
        }
    }
}

impl GameSource for StatusFileSource {
    fn detect(&mut self) -> Option<GameInfo> {
        let modified = match std::fs::metadata(&self.status_file) {
            Ok(m) => m.modified().ok(),
            Err(_) => {
                self.modified = None;
                self.last = Some(GameInfo::browser());
                return self.last.clone();
            }
        };
        if modified.is_none() || modified != self.modified || self.last.is_none() {
            if let Some(info) = self.read(&self.status_file) {
                self.last = Some(info);
                self.modified = modified;
            }
        }
        self.last.clone()
    }

    fn icon(&mut self, id: &str) -> Option<Vec<u8>> {
        let path = self.icon_path(id)?;
        match std::fs::read(&path) {
            Ok(bytes) if !bytes.is_empty() => Some(bytes),
            Ok(_) => None,
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "no icon");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drp_core::GameState;

    fn scratch(name: &str) -> PathBuf {
        let d = std::env::temp_dir().join(format!("drp-game-{}-{}", std::process::id(), name));
        let _ = std::fs::remove_dir_all(&d);
        std::fs::create_dir_all(&d).unwrap();
        d
    }

    #[test]
    fn missing_file_reports_browser() {
        let d = scratch("missing");
        let mut src = StatusFileSource::new(d.join("status.json"), None);
        assert_eq!(src.detect(), Some(GameInfo::browser()));
    }

    #[test]
    fn status_file_and_icon() {
        let d = scratch("icon");
        std::fs::write(d.join("ULUS10041.png"), [0x89, b'P', b'N', b'G']).unwrap();
        std::fs::write(
            d.join("status.json"),
            r#"{"id":"ULUS10041","title":"Lumines","state":"playing","start_time":1700000000}"#,
        )
        .unwrap();
        let mut src = StatusFileSource::new(d.join("status.json"), Some(d.clone()));
        let info = src.detect().unwrap();
        assert_eq!(info.id, "ULUS10041");
        assert_eq!(info.state, GameState::Playing);
        assert!(info.has_icon);
        assert_eq!(src.icon("ULUS10041").unwrap().len(), 4);
        assert_eq!(src.icon("../etc/passwd"), None);
        assert_eq!(src.icon("NPUH00000"), None);
    }

    #[test]
    fn bad_json_keeps_previous_view() {
        let d = scratch("bad");
        let path = d.join("status.json");
        std::fs::write(&path, r#"{"id":"NPUG80318","state":"homebrew"}"#).unwrap();
        let mut src = StatusFileSource::new(path.clone(), None);
        assert_eq!(src.detect().unwrap().id, "NPUG80318");
        std::fs::write(&path, "{not json").unwrap();
        src.modified = None;
        assert_eq!(src.detect().unwrap().id, "NPUG80318");
    }
}
