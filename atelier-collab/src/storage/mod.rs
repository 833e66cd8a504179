//! On-device mirror of shared documents.
//!
//! Architecture:
//! ```text
//! ┌──────────────┐  updates (non-persistence origin)  ┌────────────────┐
//! │SharedDocument│ ─────────────────────────────────► │PersistenceAdapter│
//! └──────▲───────┘                                    └───────┬────────┘
//!        │ open(): snapshot + log replayed                    │ append / replace
//!        │ with Persistence origin                            ▼
//!        │                                           ┌──────────────────┐
//!        └────────────────────────────────────────── │ MirrorBackend    │
//!                                                    │  RocksMirror     │
//!                                                    │  MemoryMirror    │
//!                                                    └──────────────────┘
//! ```
//!
//! A room's mirror is one compressed snapshot plus an append log of updates.
//! The adapter folds the log into a fresh snapshot once it reaches the trim
//! size, and always on close.

pub mod persistence;
pub mod rocks;

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use thiserror::Error;

pub use persistence::{PersistenceAdapter, DEFAULT_TRIM_SIZE};
pub use rocks::{MirrorMetadata, RocksMirror, StoreConfig};

/// Local mirror failures. Logged by the adapter, never fatal to the document.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("corrupted record: {0}")]
    Corrupted(String),
    #[error("background task failed: {0}")]
    Background(String),
}

/// Key-value storage for per-room document mirrors.
pub trait MirrorBackend: Send + Sync {
    /// Snapshot (if any) followed by logged updates, in write order.
    /// A room never written yields an empty list.
    fn load(&self, room: &str) -> Result<Vec<Vec<u8>>, PersistenceError>;

    /// Append one update. Returns the number of updates now in the log.
    fn append(&self, room: &str, update: &[u8]) -> Result<usize, PersistenceError>;

    /// Atomically replace snapshot and log with `snapshot`.
    fn replace(&self, room: &str, snapshot: &[u8]) -> Result<(), PersistenceError>;

    /// Forget the room entirely.
    fn remove(&self, room: &str) -> Result<(), PersistenceError>;
}

#[derive(Default)]
struct MemoryRoom {
    snapshot: Option<Vec<u8>>,
    log: Vec<Vec<u8>>,
}

/// Volatile mirror for tests and for sessions without a mirror path.
#[derive(Default)]
pub struct MemoryMirror {
    rooms: Mutex<HashMap<String, MemoryRoom>>,
}

impl MemoryMirror {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of updates in the room's log.
    pub fn log_len(&self, room: &str) -> usize {
        self.rooms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(room)
            .map_or(0, |r| r.log.len())
    }

    pub fn has_snapshot(&self, room: &str) -> bool {
        self.rooms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(room)
            .is_some_and(|r| r.snapshot.is_some())
    }
}

impl MirrorBackend for MemoryMirror {
    fn load(&self, room: &str) -> Result<Vec<Vec<u8>>, PersistenceError> {
        let rooms = self.rooms.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(rooms
            .get(room)
            .map(|r| r.snapshot.iter().chain(r.log.iter()).cloned().collect())
            .unwrap_or_default())
    }

    fn append(&self, room: &str, update: &[u8]) -> Result<usize, PersistenceError> {
        let mut rooms = self.rooms.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = rooms.entry(room.to_string()).or_default();
        entry.log.push(update.to_vec());
        Ok(entry.log.len())
    }

    fn replace(&self, room: &str, snapshot: &[u8]) -> Result<(), PersistenceError> {
        let mut rooms = self.rooms.lock().unwrap_or_else(PoisonError::into_inner);
        rooms.insert(
            room.to_string(),
            MemoryRoom {
                snapshot: Some(snapshot.to_vec()),
                log: Vec::new(),
            },
        );
        Ok(())
    }

    fn remove(&self, room: &str) -> Result<(), PersistenceError> {
        self.rooms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(room);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_mirror_lifecycle() {
        let mirror = MemoryMirror::new();
        assert!(mirror.load("r").unwrap().is_empty());

        assert_eq!(mirror.append("r", b"u1").unwrap(), 1);
        assert_eq!(mirror.append("r", b"u2").unwrap(), 2);
        assert_eq!(mirror.load("r").unwrap(), vec![b"u1".to_vec(), b"u2".to_vec()]);

        mirror.replace("r", b"snap").unwrap();
        assert_eq!(mirror.log_len("r"), 0);
        mirror.append("r", b"u3").unwrap();
        assert_eq!(
            mirror.load("r").unwrap(),
            vec![b"snap".to_vec(), b"u3".to_vec()]
        );

        mirror.remove("r").unwrap();
        assert!(mirror.load("r").unwrap().is_empty());
        assert!(!mirror.has_snapshot("r"));
    }
}
