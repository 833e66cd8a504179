//! # atelier-client: Canvas session core for Atelier
//!
//! Owns the client-side state of one open canvas and keeps it in step with
//! the two persistence paths: the realtime CRDT document
//! ([`atelier_collab`]) and the authoritative REST item store ([`rest`]).
//!
//! ## Architecture
//!
//! ```text
//!            ┌──────────────┐  set_items / upsert   ┌─────────────┐
//!  REST ────►│ SyncEngine   │──────────────────────►│             │
//!  feed ────►│ (optimistic) │                       │ CanvasStore │──► render
//!            └──────────────┘                       │             │
//!            ┌──────────────┐  reconcile by id      │             │
//!  peers ───►│ Transport-   │──────────────────────►│             │
//!            │ Provider     │                       └─────────────┘
//!            └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`store`]: items, camera, selection, sync flags, presence
//! - [`rest`]: item API, auth, optimistic sync engine
//! - [`presence`]: presence channel → store bridge
//! - [`session`]: startup order and teardown of one canvas
//! - [`config`]: session tuning and environment overlay

pub mod config;
pub mod presence;
pub mod rest;
pub mod session;
pub mod store;

pub use config::SessionConfig;
pub use presence::PresenceTracker;
pub use rest::{
    AuthError, HttpItemApi, ItemApi, LocalEdits, MemoryItemApi, StaticToken, SyncEngine,
    SyncError, TokenProvider,
};
pub use session::{CanvasSession, SessionServices};
pub use store::{CanvasSettings, CanvasStore, InteractionMode, SyncPhase, SyncStatus};
