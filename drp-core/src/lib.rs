//! DRP link: the handheld-to-desktop presence and sync protocol.
//! Host-driven: the host supplies a transport and collaborators; the engine owns all
//! protocol state and reports events back.

pub mod chunk;
pub mod config;
pub mod core;
pub mod ffi;
pub mod integrity;
pub mod protocol;
pub mod scheduler;
pub mod session;
pub mod stats;
pub mod transport;
pub mod wire;

pub use crate::config::EngineConfig;
pub use crate::core::{
    DeviceStatus, EngineContext, EngineError, EngineEvent, GameSource, PeerStore, StopReason,
};
pub use crate::protocol::{GameInfo, GameState, Message, PROTOCOL_VERSION};
pub use crate::session::{ConnectionState, PeerTarget};
pub use crate::transport::{Datagram, Endpoint, Transport, TransportError};
pub use crate::wire::{
    decode_frame, decode_message, encode_frame, encode_message, BulkProfile, FrameDecodeError,
    FrameEncodeError, NetProfile, TransportProfile,
};
