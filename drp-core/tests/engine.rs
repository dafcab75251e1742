//! Whole-engine runs against a scripted desktop on the other end of a memory transport.

use std::cell::RefCell;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;

use drp_core::chunk::{ByteSink, ChunkOutcome, MemorySink};
use drp_core::protocol::FrameType;
use drp_core::stats::{MemoryStatsStore, StatsResponder, StatsStore, UsageDocument};
use drp_core::transport::{MemoryTransport, NoPacer};
use drp_core::wire::{BULK_MAX_FRAME, NET_MAX_FRAME};
use drp_core::{
    decode_message, encode_message, BulkProfile, EngineConfig, EngineContext, EngineEvent,
    Endpoint, GameInfo, GameSource, GameState, Message, NetProfile, PeerStore, PeerTarget,
    StopReason, TransportProfile, PROTOCOL_VERSION,
};

struct Playing;

impl GameSource for Playing {
    fn detect(&mut self) -> Option<GameInfo> {
        Some(GameInfo {
            id: "ULES00151".into(),
            title: "Wipeout Pure".into(),
            state: GameState::Playing,
            ..GameInfo::default()
        })
    }

    fn icon(&mut self, _id: &str) -> Option<Vec<u8>> {
        None
    }
}

fn game(id: &str, title: &str) -> GameInfo {
    GameInfo {
        id: id.into(),
        title: title.into(),
        state: GameState::Playing,
        ..GameInfo::default()
    }
}

/// Game source the test can switch while the engine owns it.
#[derive(Clone)]
struct Switchable(Rc<RefCell<GameInfo>>);

impl Switchable {
    fn new(info: GameInfo) -> Self {
        Self(Rc::new(RefCell::new(info)))
    }

    fn set(&self, info: GameInfo) {
        *self.0.borrow_mut() = info;
    }
}

impl GameSource for Switchable {
    fn detect(&mut self) -> Option<GameInfo> {
        Some(self.0.borrow().clone())
    }

    fn icon(&mut self, _id: &str) -> Option<Vec<u8>> {
        None
    }
}

/// Local usage record the test can still read after handing the store to the engine.
#[derive(Clone, Default)]
struct SharedRecord(Rc<RefCell<Option<Vec<u8>>>>);

impl SharedRecord {
    fn document(&self) -> Option<UsageDocument> {
        self.0.borrow().as_deref().and_then(UsageDocument::from_slice)
    }
}

struct SharedStore {
    record: SharedRecord,
    sink: MemorySink,
}

impl StatsStore for SharedStore {
    fn load(&mut self) -> io::Result<Option<Vec<u8>>> {
        Ok(self.record.0.borrow().clone())
    }

    fn save(&mut self, blob: &[u8]) -> io::Result<()> {
        *self.record.0.borrow_mut() = Some(blob.to_vec());
        Ok(())
    }

    fn sink(&mut self) -> &mut dyn ByteSink {
        &mut self.sink
    }
}

#[derive(Clone, Default)]
struct RecordedPeers(Rc<RefCell<Vec<SocketAddr>>>);

impl PeerStore for RecordedPeers {
    fn persist_peer(&mut self, addr: SocketAddr) -> std::io::Result<()> {
        self.0.borrow_mut().push(addr);
        Ok(())
    }
}

/// Desktop side of the bulk link: answers stats requests chunk by chunk and collects uploads.
struct Desktop {
    record: Vec<u8>,
    responder: StatsResponder,
    uploads: MemorySink,
    upload_done: bool,
}

impl Desktop {
    fn new(record: Vec<u8>) -> Self {
        Self {
            record,
            responder: StatsResponder::new(),
            uploads: MemorySink::new(),
            upload_done: false,
        }
    }

    /// React to everything the handheld sent; returns the replies.
    fn handle(&mut self, sent: Vec<Message>) -> Vec<Message> {
        let mut replies = Vec::new();
        for msg in sent {
            match msg {
                Message::StatsRequest { local_timestamp } => {
                    let first = self
                        .responder
                        .on_request(local_timestamp, self.record.clone())
                        .unwrap();
                    replies.extend(first);
                }
                Message::Ack => replies.extend(self.responder.on_ack()),
                Message::StatsUpload(chunk) => {
                    let outcome = self
                        .responder
                        .on_upload_chunk(&chunk, &mut self.uploads)
                        .unwrap();
                    if matches!(outcome, ChunkOutcome::Complete { .. }) {
                        self.upload_done = true;
                    }
                }
                _ => {}
            }
        }
        replies
    }
}

fn desktop_record() -> Vec<u8> {
    let games: Vec<serde_json::Value> = (0..12)
        .map(|i| {
            serde_json::json!({
                "game_id": format!("ULUS1{i:04}"),
                "title": format!("Title number {i}"),
                "total_seconds": 200 + i,
                "session_count": 1,
                "daily": [{"date": "2024-03-01", "secs": 200 + i}],
            })
        })
        .collect();
    serde_json::to_vec(&serde_json::json!({ "games": games, "last_updated": 40 })).unwrap()
}

fn bulk_engine(store: MemoryStatsStore) -> EngineContext<BulkProfile, MemoryTransport> {
    EngineContext::new(
        BulkProfile,
        MemoryTransport::new(BULK_MAX_FRAME),
        EngineConfig::default(),
        PeerTarget::Link,
        Box::new(Playing),
    )
    .with_stats_store(Box::new(store))
    .with_pacer(Box::new(NoPacer::default()))
}

fn drain<P: TransportProfile>(
    profile: &P,
    engine: &mut EngineContext<P, MemoryTransport>,
) -> Vec<(Endpoint, Message)> {
    engine
        .transport_mut()
        .take_sent()
        .into_iter()
        .map(|(to, bytes)| (to, decode_message(profile, &bytes).unwrap()))
        .collect()
}

/// Run the bulk link until it goes quiet; returns every event seen.
fn converse(
    engine: &mut EngineContext<BulkProfile, MemoryTransport>,
    desktop: &mut Desktop,
) -> Vec<EngineEvent> {
    let mut events = Vec::new();
    for step in 0..200u64 {
        events.extend(engine.poll(step * 100));
        let sent: Vec<Message> = drain(&BulkProfile, engine)
            .into_iter()
            .map(|(_, m)| m)
            .collect();
        let quiet = sent.is_empty();
        for reply in desktop.handle(sent) {
            let bytes = encode_message(&BulkProfile, &reply).unwrap();
            engine.transport_mut().push_inbound(bytes, None);
        }
        if quiet && step > 0 && !desktop.responder.is_sending() {
            break;
        }
    }
    events
}

#[test]
fn bulk_sync_merges_and_uploads_local_progress() {
    let local = serde_json::to_vec(&serde_json::json!({
        "games": [{"game_id": "ULUS10003", "total_seconds": 9000, "session_count": 30}],
        "last_updated": 12,
    }))
    .unwrap();
    let remote = desktop_record();
    assert!(remote.len() > 480, "record must span several chunks");

    let mut engine = bulk_engine(MemoryStatsStore::with_record(local));
    let mut desktop = Desktop::new(remote.clone());
    let events = converse(&mut engine, &mut desktop);

    assert!(events.contains(&EngineEvent::Connected(Endpoint::Link)));
    assert!(events.contains(&EngineEvent::StatsSynced {
        remote_timestamp: 40,
        bytes: remote.len() as u32,
    }));
    assert!(events
        .iter()
        .any(|e| matches!(e, EngineEvent::StatsUploaded { .. })));
    assert!(desktop.upload_done);

    let uploaded = desktop.uploads.take_committed().unwrap();
    let merged = UsageDocument::from_slice(&uploaded).unwrap();
    assert_eq!(merged.last_updated, Some(41));
    assert_eq!(merged.games.len(), 12);
    let g3 = merged.games.iter().find(|g| g.game_id == "ULUS10003").unwrap();
    assert_eq!(g3.total_seconds, 9000);
    assert_eq!(g3.session_count, 30);
    assert_eq!(g3.title, "Title number 3");
}

#[test]
fn bulk_sync_without_local_record_takes_remote() {
    let remote = desktop_record();
    let mut engine = bulk_engine(MemoryStatsStore::default());
    let mut desktop = Desktop::new(remote.clone());
    let events = converse(&mut engine, &mut desktop);

    assert!(events.iter().any(|e| matches!(
        e,
        EngineEvent::StatsSynced { bytes, .. } if *bytes as usize == remote.len()
    )));
    assert!(!events
        .iter()
        .any(|e| matches!(e, EngineEvent::StatsUploaded { .. })));
    assert!(!desktop.upload_done);
}

#[test]
fn bulk_link_sends_presence_first() {
    let mut engine = bulk_engine(MemoryStatsStore::default());
    engine.poll(0);
    let kinds: Vec<FrameType> = drain(&BulkProfile, &mut engine)
        .iter()
        .map(|(to, m)| {
            assert_eq!(*to, Endpoint::Link);
            m.frame_type()
        })
        .collect();
    assert_eq!(
        kinds,
        vec![FrameType::Heartbeat, FrameType::GameInfo, FrameType::StatsRequest]
    );
}

#[test]
fn net_discovery_persists_the_peer() {
    let desktop: SocketAddr = "192.168.1.30:9276".parse().unwrap();
    let peers = RecordedPeers::default();
    let cfg = EngineConfig::default();
    let target = PeerTarget::from_config(&cfg);
    let mut engine = EngineContext::new(
        NetProfile,
        MemoryTransport::new(NET_MAX_FRAME),
        cfg,
        target,
        Box::new(Playing),
    )
    .with_peer_store(Box::new(peers.clone()))
    .with_pacer(Box::new(NoPacer::default()));

    engine.poll(0);
    let sent = drain(&NetProfile, &mut engine);
    assert!(matches!(
        sent.as_slice(),
        [(Endpoint::Broadcast(9277), Message::DiscoveryRequest { .. })]
    ));

    let resp = Message::DiscoveryResponse {
        peer_name: "desk".into(),
        version: PROTOCOL_VERSION.into(),
        battery_percent: 0,
    };
    engine
        .transport_mut()
        .push_inbound(encode_message(&NetProfile, &resp).unwrap(), Some(desktop));
    let events = engine.poll(100);
    assert!(events.contains(&EngineEvent::Connected(Endpoint::Unicast(desktop))));
    assert!(events.contains(&EngineEvent::PeerPersisted(desktop)));
    assert_eq!(*peers.0.borrow(), vec![desktop]);

    let sent = drain(&NetProfile, &mut engine);
    assert!(sent
        .iter()
        .all(|(to, _)| *to == Endpoint::Unicast(desktop)));
    assert!(sent.iter().any(|(_, m)| matches!(
        m,
        Message::GameInfo(g) if g.id == "ULES00151" && g.peer_name == "handheld"
    )));
}

#[test]
fn send_once_game_info_is_persistent_and_named_from_config() {
    let desktop: SocketAddr = "192.168.1.30:9276".parse().unwrap();
    let cfg = EngineConfig {
        send_once: true,
        peer_name: "vita-room".into(),
        ..EngineConfig::default()
    };
    let target = PeerTarget::from_config(&cfg);
    let source = Switchable::new(GameInfo {
        peer_name: "launcher".into(),
        ..game("ULES00151", "Wipeout Pure")
    });
    let mut engine = EngineContext::new(
        NetProfile,
        MemoryTransport::new(NET_MAX_FRAME),
        cfg,
        target,
        Box::new(source),
    )
    .with_pacer(Box::new(NoPacer::default()));

    engine.poll(0);
    drain(&NetProfile, &mut engine);
    let resp = Message::DiscoveryResponse {
        peer_name: "desk".into(),
        version: PROTOCOL_VERSION.into(),
        battery_percent: 0,
    };
    engine
        .transport_mut()
        .push_inbound(encode_message(&NetProfile, &resp).unwrap(), Some(desktop));
    let events = engine.poll(100);
    assert_eq!(events.last(), Some(&EngineEvent::Stopped(StopReason::SendOnce)));

    let infos: Vec<GameInfo> = drain(&NetProfile, &mut engine)
        .into_iter()
        .filter_map(|(_, m)| match m {
            Message::GameInfo(g) => Some(g),
            _ => None,
        })
        .collect();
    assert_eq!(infos.len(), 1);
    assert!(infos[0].persistent);
    assert_eq!(infos[0].peer_name, "vita-room");
    assert!(events.contains(&EngineEvent::GameSent(infos[0].clone())));
}

#[test]
fn play_sessions_are_written_to_the_local_record() {
    let record = SharedRecord::default();
    let source = Switchable::new(game("ULES00151", "Wipeout Pure"));
    let store = SharedStore {
        record: record.clone(),
        sink: MemorySink::new(),
    };
    let mut engine = EngineContext::new(
        BulkProfile,
        MemoryTransport::new(BULK_MAX_FRAME),
        EngineConfig::default(),
        PeerTarget::Link,
        Box::new(source.clone()),
    )
    .with_stats_store(Box::new(store))
    .with_pacer(Box::new(NoPacer::default()));

    engine.poll(0);
    engine.poll(60_000);
    assert!(record.document().is_none());

    source.set(game("ULUS10041", "Daxter"));
    engine.poll(90_000);
    let doc = record.document().unwrap();
    assert_eq!(doc.games.len(), 1);
    assert_eq!(doc.games[0].game_id, "ULES00151");
    assert_eq!((doc.games[0].total_seconds, doc.games[0].session_count), (90, 1));
    assert_eq!(doc.games[0].daily.len(), 1);
    assert_eq!(doc.last_updated, Some(1));

    engine.poll(100_000);
    engine.shutdown();
    let doc = record.document().unwrap();
    let daxter = doc.games.iter().find(|g| g.game_id == "ULUS10041").unwrap();
    assert_eq!(daxter.title, "Daxter");
    assert_eq!((daxter.total_seconds, daxter.session_count), (10, 1));
    assert_eq!(doc.last_updated, Some(2));
}

#[test]
fn connect_timeout_stops_the_engine() {
    let cfg = EngineConfig {
        connect_timeout_s: 5,
        shutdown_on_timeout: true,
        ..EngineConfig::default()
    };
    let target = PeerTarget::from_config(&cfg);
    let mut engine = EngineContext::new(
        NetProfile,
        MemoryTransport::new(NET_MAX_FRAME),
        cfg,
        target,
        Box::new(Playing),
    )
    .with_pacer(Box::new(NoPacer::default()));

    engine.poll(0);
    engine.poll(4_000);
    assert_eq!(engine.stopped(), None);
    let events = engine.poll(6_000);
    assert!(events.contains(&EngineEvent::Stopped(StopReason::ConnectTimeout)));
    assert_eq!(engine.stopped(), Some(StopReason::ConnectTimeout));
    assert!(engine.poll(7_000).is_empty());
}
