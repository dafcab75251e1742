//! Usage statistics: the usage document and its high-water-mark merge, the client-side
//! sync coordinator, and the peer-side responder that streams the record back.

use std::io;

use serde::{Deserialize, Serialize};

use crate::chunk::{
    ByteSink, ChunkError, ChunkHeader, ChunkOutcome, ChunkReceiver, ChunkedSendSession,
    MemorySink,
};
use crate::protocol::{GameInfo, Message, StatsChunk, STATS_CHUNK_SIZE};
use crate::wire::Verification;

/// Play time recorded for one calendar day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyPlaytime {
    pub date: String,
    #[serde(default)]
    pub secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameUsage {
    #[serde(alias = "id")]
    pub game_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, alias = "seconds")]
    pub total_seconds: u64,
    #[serde(default, alias = "sessions")]
    pub session_count: u32,
    #[serde(default)]
    pub daily: Vec<DailyPlaytime>,
}

/// The usage record exchanged during stats sync. Unknown fields are carried through.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageDocument {
    #[serde(default)]
    pub games: Vec<GameUsage>,
    #[serde(default)]
    pub last_updated: Option<u64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl UsageDocument {
    pub fn from_slice(blob: &[u8]) -> Option<Self> {
        serde_json::from_slice(blob).ok()
    }

    pub fn timestamp(&self) -> u64 {
        self.last_updated.unwrap_or(0)
    }

    /// Fold `other` in, keeping the larger value of every counter. Returns true when
    /// `other` contributed anything `self` did not already have.
    pub fn absorb(&mut self, other: &UsageDocument) -> bool {
        let mut contributed = false;
        for theirs in &other.games {
            if theirs.game_id.is_empty() {
                continue;
            }
            let Some(ours) = self.games.iter_mut().find(|g| g.game_id == theirs.game_id) else {
                self.games.push(theirs.clone());
                contributed = true;
                continue;
            };
            if theirs.total_seconds > ours.total_seconds {
                ours.total_seconds = theirs.total_seconds;
                contributed = true;
            }
            if theirs.session_count > ours.session_count {
                ours.session_count = theirs.session_count;
                contributed = true;
            }
            if ours.title.is_empty() && !theirs.title.is_empty() {
                ours.title = theirs.title.clone();
                contributed = true;
            }
            for day in &theirs.daily {
                if day.date.is_empty() {
                    continue;
                }
                match ours.daily.iter_mut().find(|d| d.date == day.date) {
                    Some(d) if day.secs > d.secs => {
                        d.secs = day.secs;
                        contributed = true;
                    }
                    Some(_) => {}
                    None => {
                        ours.daily.push(day.clone());
                        contributed = true;
                    }
                }
            }
        }
        contributed
    }

    /// Add a finished play session and move `last_updated` past its previous value.
    pub fn record_session(&mut self, session: &PlaySession) {
        let idx = match self.games.iter().position(|g| g.game_id == session.game_id) {
            Some(i) => i,
            None => {
                self.games.push(GameUsage {
                    game_id: session.game_id.clone(),
                    title: String::new(),
                    total_seconds: 0,
                    session_count: 0,
                    daily: Vec::new(),
                });
                self.games.len() - 1
            }
        };
        let game = &mut self.games[idx];
        if !session.title.is_empty() {
            game.title = session.title.clone();
        }
        game.total_seconds += session.seconds;
        game.session_count += 1;
        match game.daily.iter_mut().find(|d| d.date == session.date) {
            Some(day) => day.secs += session.seconds,
            None => game.daily.push(DailyPlaytime {
                date: session.date.clone(),
                secs: session.seconds,
            }),
        }
        self.last_updated = Some(self.timestamp() + 1);
    }
}

/// Logical timestamp of a stored blob; 0 when missing or unreadable.
pub fn blob_timestamp(blob: &[u8]) -> u64 {
    UsageDocument::from_slice(blob).map_or(0, |d| d.timestamp())
}

/// Result of merging the pre-sync local record into the record received from the peer.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    /// Record to keep locally.
    pub blob: Vec<u8>,
    pub timestamp: u64,
    /// The local side had data the peer lacks; the merged record should be uploaded.
    pub upload: bool,
}

/// High-water-mark merge. The remote record wins outright when either side cannot be
/// parsed or there was no local record.
pub fn merge_blobs(local: Option<&[u8]>, remote: &[u8]) -> MergeOutcome {
    let keep_remote = || MergeOutcome {
        blob: remote.to_vec(),
        timestamp: blob_timestamp(remote),
        upload: false,
    };
    let Some(mut merged) = UsageDocument::from_slice(remote) else {
        return keep_remote();
    };
    let Some(local) = local.and_then(UsageDocument::from_slice) else {
        return keep_remote();
    };
    let remote_ts = merged.timestamp();
    if !merged.absorb(&local) {
        return keep_remote();
    }
    // Strictly newer than either side so the peer accepts the upload.
    let timestamp = remote_ts.max(local.timestamp()) + 1;
    merged.last_updated = Some(timestamp);
    match serde_json::to_vec_pretty(&merged) {
        Ok(blob) => MergeOutcome {
            blob,
            timestamp,
            upload: true,
        },
        Err(e) => {
            tracing::warn!(error = %e, "could not serialize merged usage record");
            keep_remote()
        }
    }
}

/// One finished stretch of play, ready to be added to the usage record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaySession {
    pub game_id: String,
    pub title: String,
    pub seconds: u64,
    /// Calendar day the session started on, `YYYY-MM-DD` (UTC).
    pub date: String,
}

#[derive(Debug, Clone)]
struct ActiveSession {
    game_id: String,
    title: String,
    started_ms: u64,
    started_unix: u64,
}

/// Turns the stream of detected games into play sessions. Sessions under a second are
/// not counted.
#[derive(Debug, Default)]
pub struct UsageTracker {
    active: Option<ActiveSession>,
}

impl UsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active_game(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.game_id.as_str())
    }

    /// Feed the current game. A different id closes the running session (returned when it
    /// counts) and opens a new one; an empty id only closes.
    pub fn observe(&mut self, info: &GameInfo, now_ms: u64, unix_secs: u64) -> Option<PlaySession> {
        if self.active_game() == Some(info.id.as_str()) {
            return None;
        }
        let finished = self.finish(now_ms);
        if !info.id.is_empty() {
            let title = if info.title.is_empty() { &info.id } else { &info.title };
            self.active = Some(ActiveSession {
                game_id: info.id.clone(),
                title: title.clone(),
                started_ms: now_ms,
                started_unix: unix_secs,
            });
        }
        finished
    }

    /// Close the running session.
    pub fn finish(&mut self, now_ms: u64) -> Option<PlaySession> {
        let a = self.active.take()?;
        let seconds = now_ms.saturating_sub(a.started_ms) / 1000;
        if seconds == 0 {
            return None;
        }
        Some(PlaySession {
            game_id: a.game_id,
            title: a.title,
            seconds,
            date: civil_date(a.started_unix),
        })
    }
}

/// `YYYY-MM-DD` for a Unix timestamp, proleptic Gregorian, UTC.
pub fn civil_date(unix_secs: u64) -> String {
    let days = (unix_secs / 86_400) as i64;
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = yoe + era * 400 + i64::from(m <= 2);
    format!("{y:04}-{m:02}-{d:02}")
}

/// Persistent home of the local usage record.
pub trait StatsStore {
    fn load(&mut self) -> io::Result<Option<Vec<u8>>>;
    fn save(&mut self, blob: &[u8]) -> io::Result<()>;
    /// Sink that streams an inbound record; `commit` replaces the local record.
    fn sink(&mut self) -> &mut dyn ByteSink;
}

/// Store kept in memory.
#[derive(Debug, Default)]
pub struct MemoryStatsStore {
    record: Option<Vec<u8>>,
    sink: MemorySink,
}

impl MemoryStatsStore {
    pub fn with_record(blob: impl Into<Vec<u8>>) -> Self {
        Self {
            record: Some(blob.into()),
            sink: MemorySink::new(),
        }
    }

    /// Current record, including a just-committed inbound one.
    pub fn record(&mut self) -> Option<&[u8]> {
        if let Some(c) = self.sink.take_committed() {
            self.record = Some(c);
        }
        self.record.as_deref()
    }
}

impl StatsStore for MemoryStatsStore {
    fn load(&mut self) -> io::Result<Option<Vec<u8>>> {
        Ok(self.record().map(<[u8]>::to_vec))
    }

    fn save(&mut self, blob: &[u8]) -> io::Result<()> {
        self.record = Some(blob.to_vec());
        Ok(())
    }

    fn sink(&mut self) -> &mut dyn ByteSink {
        &mut self.sink
    }
}

/// Progress of an inbound StatsResponse stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncProgress {
    Receiving { received: u32, total: u32 },
    /// Not part of the exchange in flight.
    Ignored,
    Synced { remote_timestamp: u64, bytes: u32 },
    Failed { expected: u32, written: u32 },
}

/// Client side of the exchange: request, receive, verify.
#[derive(Debug)]
pub struct StatsSync {
    interval_ms: u64,
    pending: bool,
    synced: bool,
    last_attempt: Option<u64>,
    receiver: ChunkReceiver,
    local_snapshot: Option<Vec<u8>>,
}

impl StatsSync {
    pub fn new(interval_ms: u64) -> Self {
        Self {
            interval_ms,
            pending: false,
            synced: false,
            last_attempt: None,
            receiver: ChunkReceiver::new(Verification::ByteCount),
            local_snapshot: None,
        }
    }

    /// First sync of a connection is immediate; later ones (and retries after a failure
    /// or an unanswered request) wait for the interval.
    pub fn due(&self, now_ms: u64) -> bool {
        self.last_attempt
            .map_or(true, |t| now_ms.saturating_sub(t) >= self.interval_ms)
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    /// Response data is streaming into the store right now.
    pub fn is_receiving(&self) -> bool {
        self.pending && self.receiver.is_active()
    }

    /// The local record changed after the request went out but before any response data
    /// landed; merge against the newer copy.
    pub fn refresh_snapshot(&mut self, local: Vec<u8>) {
        if self.pending && !self.receiver.is_active() {
            self.local_snapshot = Some(local);
        }
    }

    /// At least one sync completed in this connection.
    pub fn is_synced(&self) -> bool {
        self.synced
    }

    /// Begin an exchange. `local` is the record as it is before the peer's copy lands.
    pub fn start(&mut self, now_ms: u64, local: Option<Vec<u8>>) -> Message {
        let local_timestamp = local.as_deref().map_or(0, blob_timestamp);
        self.pending = true;
        self.last_attempt = Some(now_ms);
        self.local_snapshot = local;
        tracing::debug!(local_timestamp, "requesting stats");
        Message::StatsRequest { local_timestamp }
    }

    pub fn on_response_chunk(
        &mut self,
        chunk: &StatsChunk,
        sink: &mut dyn ByteSink,
    ) -> Result<SyncProgress, ChunkError> {
        if !self.pending {
            return Ok(SyncProgress::Ignored);
        }
        let header = ChunkHeader {
            context: chunk.timestamp.to_string(),
            index: chunk.chunk_index as u32,
            total_chunks: chunk.total_chunks as u32,
            expected_total: chunk.total_bytes,
        };
        let outcome = match self.receiver.accept(&header, &chunk.data, sink) {
            Ok(o) => o,
            Err(e) => {
                self.pending = false;
                return Err(e);
            }
        };
        Ok(match outcome {
            ChunkOutcome::InProgress { received, total } => {
                SyncProgress::Receiving { received, total }
            }
            ChunkOutcome::Ignored | ChunkOutcome::AwaitingDigest => SyncProgress::Ignored,
            ChunkOutcome::Complete { total_size, .. } => {
                self.pending = false;
                self.synced = true;
                tracing::info!(
                    remote_timestamp = chunk.timestamp,
                    bytes = total_size,
                    "stats synced"
                );
                SyncProgress::Synced {
                    remote_timestamp: chunk.timestamp,
                    bytes: total_size,
                }
            }
            ChunkOutcome::Truncated { expected, written } => {
                self.pending = false;
                tracing::warn!(expected, written, "stats transfer failed verification");
                SyncProgress::Failed { expected, written }
            }
        })
    }

    /// Local record captured when the exchange started.
    pub fn take_local_snapshot(&mut self) -> Option<Vec<u8>> {
        self.local_snapshot.take()
    }

    pub fn on_connected(&mut self) {
        self.last_attempt = None;
        self.synced = false;
    }

    pub fn on_disconnected(&mut self, sink: &mut dyn ByteSink) {
        self.pending = false;
        self.receiver.abort(sink);
        self.local_snapshot = None;
    }
}

/// Build the StatsUpload transfer of a merged record.
pub fn upload_session(blob: Vec<u8>) -> Result<ChunkedSendSession, ChunkError> {
    ChunkedSendSession::new(
        blob,
        STATS_CHUNK_SIZE,
        u16::MAX as u32,
        u32::MAX,
        Verification::ByteCount,
    )
}

/// Peer side of the exchange: answers requests with the full record, one chunk per Ack,
/// and accepts uploads.
#[derive(Debug)]
pub struct StatsResponder {
    outbound: Option<(u64, ChunkedSendSession)>,
    uploads: ChunkReceiver,
}

impl Default for StatsResponder {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsResponder {
    pub fn new() -> Self {
        Self {
            outbound: None,
            uploads: ChunkReceiver::new(Verification::ByteCount),
        }
    }

    pub fn is_sending(&self) -> bool {
        self.outbound.is_some()
    }

    /// Answer a StatsRequest. The requester's timestamp is logged only: the full record
    /// is always sent. An empty record is sent as `{}`.
    pub fn on_request(
        &mut self,
        requester_timestamp: u64,
        blob: Vec<u8>,
    ) -> Result<Option<Message>, ChunkError> {
        let blob = if blob.is_empty() { b"{}".to_vec() } else { blob };
        let timestamp = blob_timestamp(&blob);
        tracing::debug!(
            requester_timestamp,
            timestamp,
            bytes = blob.len(),
            "answering stats request"
        );
        let session = ChunkedSendSession::new(
            blob,
            STATS_CHUNK_SIZE,
            u16::MAX as u32,
            u32::MAX,
            Verification::ByteCount,
        )?;
        self.outbound = Some((timestamp, session));
        Ok(self.next_chunk())
    }

    /// The requester acknowledged the previous chunk.
    pub fn on_ack(&mut self) -> Option<Message> {
        self.next_chunk()
    }

    fn next_chunk(&mut self) -> Option<Message> {
        let (timestamp, session) = self.outbound.as_mut()?;
        let msg = session.next_piece().map(|p| {
            Message::StatsResponse(StatsChunk {
                timestamp: *timestamp,
                total_bytes: Some(p.total_size),
                chunk_index: p.index as u16,
                total_chunks: p.total_chunks as u16,
                data: p.data.to_vec(),
            })
        });
        if msg.is_none() {
            self.outbound = None;
        }
        msg
    }

    /// Accumulate an uploaded record.
    pub fn on_upload_chunk(
        &mut self,
        chunk: &StatsChunk,
        sink: &mut dyn ByteSink,
    ) -> Result<ChunkOutcome, ChunkError> {
        let header = ChunkHeader {
            context: chunk.timestamp.to_string(),
            index: chunk.chunk_index as u32,
            total_chunks: chunk.total_chunks as u32,
            expected_total: None,
        };
        self.uploads.accept(&header, &chunk.data, sink)
    }
}
