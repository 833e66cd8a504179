//! # atelier-collab: Real-time collaboration layer for Atelier
//!
//! Keeps a [`SharedDocument`](atelier_core::collab::SharedDocument) in sync
//! across peers, mirrors it on-device, and relays frames between peers.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────┐   varint frames   ┌──────────────────────┐
//! │ TransportProvider │ ◄───────────────► │ RealtimeClient       │
//! │ (per doc + room)  │                   │  RealtimeHub (local) │
//! └─────────┬─────────┘                   │  WsRealtimeClient ───┼──► RelayServer
//!           │                             └──────────────────────┘
//!           ▼
//! ┌───────────────────┐                   ┌──────────────────────┐
//! │ SharedDocument    │ ────────────────► │ PersistenceAdapter   │
//! │ (Yrs)             │                   │  RocksMirror / Memory│
//! └───────────────────┘                   └──────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Yjs sync/awareness envelope over `yrs::sync`
//! - [`awareness`]: ephemeral per-client state on `yrs` awareness
//! - [`channel`]: realtime primitives (room broadcast, presence, change feed)
//! - [`broadcast`]: room-based fan-out with backpressure
//! - [`hub`]: in-process implementation of the realtime primitives
//! - [`provider`]: document-to-room sync with offline queue
//! - [`storage`]: on-device mirror and persistence adapter
//! - [`server`]: WebSocket relay
//! - [`ws`]: WebSocket realtime client

pub mod awareness;
pub mod broadcast;
pub mod channel;
pub mod hub;
pub mod protocol;
pub mod provider;
pub mod server;
pub mod storage;
pub mod ws;

// Re-exports for convenience
pub use awareness::{Awareness, AwarenessChange, ClientId, OUTDATED_TIMEOUT};
pub use broadcast::{BroadcastGroup, BroadcastStats, RoomManager};
pub use channel::{
    ChangeEvent, ChangeFeed, ChangeKind, PresenceChannel, PresenceEvent, PresenceRecord,
    RealtimeClient, RoomFrame, RoomHandle, TransportError,
};
pub use hub::RealtimeHub;
pub use protocol::{AwarenessUpdate, DecodeError, Message, SyncMessage};
pub use provider::{
    ConnectionStatus, OfflineQueue, ProviderConfig, ProviderEvent, TransportProvider,
};
pub use server::{RelayError, RelayFrame, RelayServer, ServerConfig, ServerStats};
pub use storage::{
    MemoryMirror, MirrorBackend, MirrorMetadata, PersistenceAdapter, PersistenceError,
    RocksMirror, StoreConfig,
};
pub use ws::WsRealtimeClient;
