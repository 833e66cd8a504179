//! Transport provider: bridges one [`SharedDocument`] and one [`Awareness`]
//! to one named realtime room.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect) with a status state machine
//!   `Disconnected → Connecting → Connected → Disconnected`
//! - Sync step-1/step-2 handshake and incremental update broadcast
//! - Awareness broadcast, merge and query replies
//! - Periodic resync (step-1 re-broadcast + outdated-peer sweep)
//! - Offline queue for updates produced while not connected
//!
//! Updates applied from the room are tagged [`UpdateOrigin::Remote`] and are
//! never re-broadcast; every other origin is.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use yrs::Subscription;

use atelier_core::collab::{SharedDocument, UpdateOrigin};

use crate::awareness::{Awareness, AwarenessChange, ClientId, OUTDATED_TIMEOUT};
use crate::channel::{RealtimeClient, RoomFrame, RoomHandle, TransportError};
use crate::protocol::{self, Message, SyncMessage};

/// Provider tuning.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Interval of the step-1 re-broadcast while connected.
    pub resync_interval: Duration,
    /// Silence after which remote awareness states are dropped.
    pub awareness_timeout: Duration,
    /// Maximum number of updates held while not connected.
    pub offline_queue_capacity: usize,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            resync_interval: Duration::from_secs(5),
            awareness_timeout: OUTDATED_TIMEOUT,
            offline_queue_capacity: 10_000,
        }
    }
}

/// Connection state of the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the provider.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    Status(ConnectionStatus),
    /// The first sync step-2 of this connection was applied.
    Synced,
    /// A remote document update was applied.
    RemoteUpdate,
    /// Awareness states changed (remote merge, local edit or timeout sweep).
    Awareness(AwarenessChange),
}

// ───────────────────────────────────────────────────────────────────
// Offline queue
// ───────────────────────────────────────────────────────────────────

/// Bounded FIFO of encoded update envelopes awaiting a connection.
///
/// When full, the oldest entry is evicted; the periodic step-1 exchange
/// recovers whatever an evicted update carried.
pub struct OfflineQueue {
    queue: VecDeque<Vec<u8>>,
    max_size: usize,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size: max_size.max(1),
        }
    }

    /// Queue a frame. Returns the evicted frame if the queue was full.
    pub fn enqueue(&mut self, frame: Vec<u8>) -> Option<Vec<u8>> {
        let evicted = if self.queue.len() >= self.max_size {
            self.queue.pop_front()
        } else {
            None
        };
        self.queue.push_back(frame);
        evicted
    }

    pub fn pop_front(&mut self) -> Option<Vec<u8>> {
        self.queue.pop_front()
    }

    /// Put a frame back at the head (send failed).
    pub fn push_front(&mut self, frame: Vec<u8>) {
        self.queue.push_front(frame);
    }

    pub fn drain(&mut self) -> Vec<Vec<u8>> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Total bytes queued.
    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(Vec::len).sum()
    }
}

// ───────────────────────────────────────────────────────────────────
// Shared state
// ───────────────────────────────────────────────────────────────────

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Outbound half of the connection, shared by the document observer, the
/// reader task and the resync task. Never held across a document transaction.
struct Link {
    status: ConnectionStatus,
    sink: Option<mpsc::Sender<Vec<u8>>>,
    queue: OfflineQueue,
}

impl Link {
    /// Send if connected; otherwise drop the frame.
    fn send(&self, frame: Vec<u8>) -> bool {
        match (&self.sink, self.status) {
            (Some(sink), ConnectionStatus::Connected) => match sink.try_send(frame) {
                Ok(()) => true,
                Err(e) => {
                    log::debug!("Dropping outbound frame: {e}");
                    false
                }
            },
            _ => false,
        }
    }

    /// Send a document update, or hold it until the next flush.
    fn send_or_queue(&mut self, frame: Vec<u8>) {
        let frame = match (&self.sink, self.status) {
            (Some(sink), ConnectionStatus::Connected) if self.queue.is_empty() => {
                match sink.try_send(frame) {
                    Ok(()) => return,
                    Err(mpsc::error::TrySendError::Full(f))
                    | Err(mpsc::error::TrySendError::Closed(f)) => f,
                }
            }
            _ => frame,
        };
        if self.queue.enqueue(frame).is_some() {
            log::warn!("Offline queue full; dropped oldest queued update");
        }
    }

    /// Push queued updates, in order, until the sink pushes back.
    fn flush(&mut self) -> usize {
        if self.status != ConnectionStatus::Connected {
            return 0;
        }
        let Some(sink) = self.sink.as_ref() else {
            return 0;
        };
        let mut sent = 0;
        while let Some(frame) = self.queue.pop_front() {
            match sink.try_send(frame) {
                Ok(()) => sent += 1,
                Err(mpsc::error::TrySendError::Full(f))
                | Err(mpsc::error::TrySendError::Closed(f)) => {
                    self.queue.push_front(f);
                    break;
                }
            }
        }
        sent
    }
}

#[derive(Clone)]
struct Inner {
    doc: SharedDocument,
    awareness: Arc<Mutex<Awareness>>,
    link: Arc<Mutex<Link>>,
    events: broadcast::Sender<ProviderEvent>,
}

impl Inner {
    fn emit(&self, event: ProviderEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn set_status(&self, status: ConnectionStatus) {
        lock(&self.link).status = status;
        self.emit(ProviderEvent::Status(status));
    }

    fn handle_frame(&self, room: &str, frame: &RoomFrame, synced: &mut bool) {
        let message = match protocol::decode(&frame.payload) {
            Ok(m) => m,
            Err(e) => {
                log::warn!("Dropping frame from {} in room {room}: {e}", frame.from);
                return;
            }
        };

        match message {
            Message::Sync(SyncMessage::SyncStep1(state_vector)) => {
                let diff = self.doc.diff_since(&state_vector);
                lock(&self.link).send(protocol::encode_sync_step2(diff));
            }
            Message::Sync(SyncMessage::SyncStep2(update)) => {
                if self.apply_remote(&update, frame) && !*synced {
                    *synced = true;
                    self.emit(ProviderEvent::Synced);
                }
            }
            Message::Sync(SyncMessage::Update(update)) => {
                self.apply_remote(&update, frame);
            }
            Message::Awareness(update) => {
                let result = lock(&self.awareness).apply_update(update);
                match result {
                    Ok(change) if !change.is_empty() => {
                        self.emit(ProviderEvent::Awareness(change));
                    }
                    Ok(_) => {}
                    Err(e) => log::warn!("Dropping awareness from {}: {e}", frame.from),
                }
            }
            Message::AwarenessQuery => {
                let reply = protocol::encode_awareness(lock(&self.awareness).encode_full());
                lock(&self.link).send(reply);
            }
            other => {
                log::debug!("Ignoring {other:?} from {} in room {room}", frame.from);
            }
        }
    }

    fn apply_remote(&self, update: &[u8], frame: &RoomFrame) -> bool {
        match self.doc.apply_update(update, UpdateOrigin::Remote) {
            Ok(()) => {
                self.emit(ProviderEvent::RemoteUpdate);
                true
            }
            Err(e) => {
                log::warn!("Dropping update from {}: {e}", frame.from);
                false
            }
        }
    }
}

async fn read_loop(inner: Inner, room: String, mut incoming: mpsc::Receiver<RoomFrame>) {
    let mut synced = false;
    while let Some(frame) = incoming.recv().await {
        inner.handle_frame(&room, &frame, &mut synced);
    }

    let dropped = {
        let mut link = lock(&inner.link);
        let was_connected = link.status == ConnectionStatus::Connected;
        link.status = ConnectionStatus::Disconnected;
        link.sink = None;
        was_connected
    };
    if dropped {
        log::warn!("Realtime channel for room {room} closed");
        inner.emit(ProviderEvent::Status(ConnectionStatus::Disconnected));
    }
}

async fn resync_loop(inner: Inner, room: String, every: Duration, awareness_timeout: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        log::trace!("Resync tick for room {room}");

        let step1 = protocol::encode_sync_step1(inner.doc.current_state_vector());
        let (change, awareness_frame) = {
            let mut awareness = lock(&inner.awareness);
            let change = awareness.remove_outdated(awareness_timeout);
            let frame = (!change.is_empty())
                .then(|| protocol::encode_awareness(awareness.encode_update(&change.clients())));
            (change, frame)
        };

        {
            let mut link = lock(&inner.link);
            if link.status == ConnectionStatus::Connected {
                link.send(step1);
                link.flush();
                if let Some(frame) = awareness_frame {
                    link.send(frame);
                }
            }
        }
        if !change.is_empty() {
            inner.emit(ProviderEvent::Awareness(change));
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Provider
// ───────────────────────────────────────────────────────────────────

/// Keeps one document and its awareness in sync with one realtime room.
pub struct TransportProvider {
    inner: Inner,
    client: Arc<dyn RealtimeClient>,
    config: ProviderConfig,
    room: Option<String>,
    subscription: Option<Subscription>,
    tasks: Vec<JoinHandle<()>>,
}

impl TransportProvider {
    pub fn new(doc: SharedDocument, client: Arc<dyn RealtimeClient>, config: ProviderConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        let awareness = Awareness::new(doc.client_id());
        Self {
            inner: Inner {
                doc,
                awareness: Arc::new(Mutex::new(awareness)),
                link: Arc::new(Mutex::new(Link {
                    status: ConnectionStatus::Disconnected,
                    sink: None,
                    queue: OfflineQueue::new(config.offline_queue_capacity),
                })),
                events,
            },
            client,
            config,
            room: None,
            subscription: None,
            tasks: Vec::new(),
        }
    }

    /// Subscribe to `room`. A no-op unless currently disconnected.
    ///
    /// On a confirmed subscription the provider becomes `Connected`,
    /// broadcasts a sync step-1, flushes the offline queue and announces the
    /// local awareness state if there is one.
    pub async fn connect(&mut self, room: &str) -> Result<(), TransportError> {
        if self.status() != ConnectionStatus::Disconnected {
            return Ok(());
        }
        self.abort_tasks();
        self.inner.set_status(ConnectionStatus::Connecting);
        log::info!("Connecting to room {room}");

        if self.subscription.is_none() {
            match self.observe_document() {
                Ok(sub) => self.subscription = Some(sub),
                Err(e) => {
                    self.inner.set_status(ConnectionStatus::Disconnected);
                    return Err(TransportError::SubscribeFailed {
                        room: room.to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        let RoomHandle {
            outgoing, incoming, ..
        } = match self.client.join(room).await {
            Ok(handle) => handle,
            Err(e) => {
                log::warn!("Subscribe to room {room} failed: {e}");
                self.inner.set_status(ConnectionStatus::Disconnected);
                return Err(e);
            }
        };

        let step1 = protocol::encode_sync_step1(self.inner.doc.current_state_vector());
        let announce = {
            let awareness = lock(&self.inner.awareness);
            awareness.local_state().is_some().then(|| {
                protocol::encode_awareness(awareness.encode_update(&[awareness.client_id()]))
            })
        };
        let flushed = {
            let mut link = lock(&self.inner.link);
            link.status = ConnectionStatus::Connected;
            link.sink = Some(outgoing);
            link.send(step1);
            let flushed = link.flush();
            if let Some(frame) = announce {
                link.send(frame);
            }
            flushed
        };
        if flushed > 0 {
            log::info!("Replayed {flushed} queued updates to room {room}");
        }
        log::info!("Connected to room {room}");
        self.inner.emit(ProviderEvent::Status(ConnectionStatus::Connected));

        self.room = Some(room.to_string());
        self.tasks.push(tokio::spawn(read_loop(
            self.inner.clone(),
            room.to_string(),
            incoming,
        )));
        self.tasks.push(tokio::spawn(resync_loop(
            self.inner.clone(),
            room.to_string(),
            self.config.resync_interval,
            self.config.awareness_timeout,
        )));
        Ok(())
    }

    /// Leave the room: announce awareness removal, stop timers, detach the
    /// document listener. Idempotent.
    pub fn disconnect(&mut self) {
        let leave = {
            let awareness = lock(&self.inner.awareness);
            awareness
                .local_state()
                .is_some()
                .then(|| protocol::encode_awareness(awareness.encode_leave()))
        };
        let previous = {
            let mut link = lock(&self.inner.link);
            let previous = link.status;
            if previous == ConnectionStatus::Connected {
                if let Some(frame) = leave {
                    link.send(frame);
                }
            }
            link.status = ConnectionStatus::Disconnected;
            link.sink = None;
            previous
        };

        self.abort_tasks();
        self.subscription = None;

        if previous != ConnectionStatus::Disconnected {
            log::info!(
                "Disconnected from room {}",
                self.room.as_deref().unwrap_or("?")
            );
            self.inner
                .emit(ProviderEvent::Status(ConnectionStatus::Disconnected));
        }
    }

    /// Replace the local awareness state and broadcast the delta.
    pub fn set_local_awareness(&self, state: Option<Value>) -> AwarenessChange {
        let (change, frame) = {
            let mut awareness = lock(&self.inner.awareness);
            let change = awareness.set_local_state(state);
            let frame = protocol::encode_awareness(awareness.encode_update(&change.clients()));
            (change, frame)
        };
        if !change.is_empty() {
            lock(&self.inner.link).send(frame);
            self.inner.emit(ProviderEvent::Awareness(change.clone()));
        }
        change
    }

    /// Ask every peer in the room to announce its awareness state.
    pub fn query_awareness(&self) -> bool {
        lock(&self.inner.link).send(protocol::encode_query_awareness())
    }

    /// Snapshot of every live awareness state, local included.
    pub fn awareness_states(&self) -> HashMap<ClientId, Value> {
        lock(&self.inner.awareness).states()
    }

    pub fn local_client_id(&self) -> ClientId {
        lock(&self.inner.awareness).client_id()
    }

    pub fn status(&self) -> ConnectionStatus {
        lock(&self.inner.link).status
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProviderEvent> {
        self.inner.events.subscribe()
    }

    pub fn document(&self) -> &SharedDocument {
        &self.inner.doc
    }

    pub fn room(&self) -> Option<&str> {
        self.room.as_deref()
    }

    /// Number of updates waiting for a connection.
    pub fn queued_updates(&self) -> usize {
        lock(&self.inner.link).queue.len()
    }

    fn observe_document(&self) -> Result<Subscription, atelier_core::collab::CollabError> {
        let link = self.inner.link.clone();
        self.inner.doc.observe_updates(move |origin, update| {
            if origin == UpdateOrigin::Remote {
                return;
            }
            lock(&link).send_or_queue(protocol::encode_sync(update));
        })
    }

    fn abort_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for TransportProvider {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}
