//! Keeps a [`SharedDocument`] mirrored in a [`MirrorBackend`].
//!
//! `open` replays the mirror into the document with the persistence origin,
//! then forwards every other update to a background flusher. Failures are
//! logged and never surface to the document: it keeps working in memory.

use std::sync::Arc;

use atelier_core::collab::{SharedDocument, UpdateOrigin};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use yrs::Subscription;

use super::{MirrorBackend, PersistenceError};

/// Log length at which the mirror is folded into a snapshot.
pub const DEFAULT_TRIM_SIZE: usize = 500;

pub struct PersistenceAdapter {
    room: String,
    doc: SharedDocument,
    backend: Arc<dyn MirrorBackend>,
    subscription: Option<Subscription>,
    flusher: Option<JoinHandle<()>>,
    synced: watch::Sender<bool>,
}

impl PersistenceAdapter {
    /// Load the room's mirror into `doc` and start mirroring its updates.
    ///
    /// A missing mirror is a first run, not an error.
    pub async fn open(
        doc: SharedDocument,
        backend: Arc<dyn MirrorBackend>,
        room: &str,
        trim_size: usize,
    ) -> Self {
        let (synced, _) = watch::channel(false);

        let loader = backend.clone();
        let key = room.to_string();
        let loaded = tokio::task::spawn_blocking(move || loader.load(&key))
            .await
            .unwrap_or_else(|e| Err(PersistenceError::Background(e.to_string())));

        match loaded {
            Ok(updates) => {
                let total = updates.len();
                let mut applied = 0;
                for update in updates {
                    match doc.apply_update(&update, UpdateOrigin::Persistence) {
                        Ok(()) => applied += 1,
                        Err(e) => log::error!("Skipping unreadable mirror record of room {room}: {e}"),
                    }
                }
                log::debug!("Loaded {applied}/{total} mirror records for room {room}");
            }
            Err(e) => log::error!("Failed to load mirror of room {room}: {e}"),
        }

        let (tx, rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let subscription = match doc.observe_updates(move |origin, update| {
            if origin != UpdateOrigin::Persistence {
                let _ = tx.send(update.to_vec());
            }
        }) {
            Ok(sub) => Some(sub),
            Err(e) => {
                log::error!("Mirror of room {room} cannot observe the document: {e}");
                None
            }
        };

        let flusher = tokio::spawn(flush_loop(
            rx,
            backend.clone(),
            doc.clone(),
            room.to_string(),
            trim_size.max(1),
        ));

        synced.send_replace(true);

        Self {
            room: room.to_string(),
            doc,
            backend,
            subscription,
            flusher: Some(flusher),
            synced,
        }
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    /// Resolves to `true` once the initial load has been applied.
    pub fn synced(&self) -> watch::Receiver<bool> {
        self.synced.subscribe()
    }

    pub fn is_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Fold the current document state into a fresh snapshot.
    pub fn compact(&self) -> Result<(), PersistenceError> {
        compact(&self.doc, self.backend.as_ref(), &self.room)
    }

    /// Flush pending updates, compact, and stop mirroring.
    pub async fn close(mut self) -> Result<(), PersistenceError> {
        // Dropping the subscription drops the only sender; the flusher
        // drains what is queued and exits.
        self.subscription.take();
        if let Some(flusher) = self.flusher.take() {
            flusher
                .await
                .map_err(|e| PersistenceError::Background(e.to_string()))?;
        }
        let result = self.compact();
        if let Err(e) = &result {
            log::error!("Final compaction of room {} failed: {e}", self.room);
        }
        self.synced.send_replace(false);
        result
    }
}

async fn flush_loop(
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    backend: Arc<dyn MirrorBackend>,
    doc: SharedDocument,
    room: String,
    trim_size: usize,
) {
    while let Some(first) = rx.recv().await {
        let mut batch = vec![first];
        while let Ok(more) = rx.try_recv() {
            batch.push(more);
        }

        for update in batch {
            match backend.append(&room, &update) {
                Ok(len) if len >= trim_size => {
                    if let Err(e) = compact(&doc, backend.as_ref(), &room) {
                        log::error!("Compaction of room {room} failed: {e}");
                    }
                }
                Ok(_) => {}
                Err(e) => log::error!("Failed to mirror update of room {room}: {e}"),
            }
        }
    }
}

fn compact(
    doc: &SharedDocument,
    backend: &dyn MirrorBackend,
    room: &str,
) -> Result<(), PersistenceError> {
    backend.replace(room, &doc.encode_state_as_update())
}
