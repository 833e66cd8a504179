//! One open canvas: every subsystem wired around a shared store.
//!
//! ## Startup order
//!
//! ```text
//!  1. open the on-device mirror  ──► SharedDocument has local content
//!  2. reconcile document → store ──► UI renders immediately
//!  3. SyncEngine::load_canvas    ──► authoritative items + viewport
//!  4. viewport saver, change feed
//!  5. TransportProvider::connect ──► peers converge via step-1/step-2
//!  6. presence tracking
//! ```
//!
//! Nothing here is fatal: a failing mirror falls back to memory, a failing
//! load or subscription is logged and reflected in the store's flags.
//!
//! The document and the REST store are independent. Local edits are sent
//! over REST first and written to the document once confirmed; remote
//! document updates are reconciled into the store by id.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use atelier_collab::{
    ChangeFeed, ConnectionStatus, MemoryMirror, MirrorBackend, PersistenceAdapter,
    PresenceChannel, PresenceRecord, ProviderEvent, RealtimeClient, RealtimeHub, RocksMirror,
    StoreConfig, TransportError, TransportProvider,
};
use atelier_core::collab::{SharedDocument, UpdateOrigin};
use atelier_core::{CanvasItem, ItemPatch, NewItem};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::SessionConfig;
use crate::presence::PresenceTracker;
use crate::rest::{ItemApi, LocalEdits, SyncEngine, SyncError};
use crate::store::CanvasStore;

/// External collaborators of a session.
#[derive(Clone)]
pub struct SessionServices {
    pub realtime: Arc<dyn RealtimeClient>,
    pub presence: Arc<dyn PresenceChannel>,
    pub changes: Arc<dyn ChangeFeed>,
    pub api: Arc<dyn ItemApi>,
    /// Mirror storage; `None` opens one from the session config.
    pub mirror: Option<Arc<dyn MirrorBackend>>,
}

impl SessionServices {
    /// Every realtime primitive served by one in-process hub.
    pub fn in_process(hub: RealtimeHub, api: Arc<dyn ItemApi>) -> Self {
        let hub = Arc::new(hub);
        Self {
            realtime: hub.clone(),
            presence: hub.clone(),
            changes: hub,
            api,
            mirror: None,
        }
    }

    pub fn with_mirror(mut self, mirror: Arc<dyn MirrorBackend>) -> Self {
        self.mirror = Some(mirror);
        self
    }
}

/// Open `config.mirror_path` with RocksDB, or keep the mirror in memory.
fn open_mirror(config: &SessionConfig) -> Arc<dyn MirrorBackend> {
    let Some(path) = &config.mirror_path else {
        return Arc::new(MemoryMirror::new());
    };
    match RocksMirror::open(StoreConfig::at(path)) {
        Ok(mirror) => Arc::new(mirror),
        Err(e) => {
            log::error!(
                "Cannot open mirror at {}: {e}; keeping it in memory",
                path.display()
            );
            Arc::new(MemoryMirror::new())
        }
    }
}

/// Mirrors document items into the store.
///
/// An item is written only when its document value changed since the
/// previous pass, so a document lagging behind an optimistic edit cannot
/// undo it. Ids shielded by [`LocalEdits`] are skipped and re-examined on a
/// later pass. Only ids the document has previously reported are ever
/// removed, so items known only to the REST path survive.
struct Reconciler {
    seen: HashMap<String, CanvasItem>,
    edits: LocalEdits,
}

impl Reconciler {
    fn new(edits: LocalEdits) -> Self {
        Self {
            seen: HashMap::new(),
            edits,
        }
    }

    /// Returns the number of store changes.
    fn reconcile(&mut self, doc: &SharedDocument, store: &CanvasStore) -> usize {
        let mut current = HashMap::new();
        let mut changes = 0;

        for item in doc.items() {
            if self.edits.shields(&item.id) {
                if let Some(previous) = self.seen.get(&item.id) {
                    current.insert(item.id.clone(), previous.clone());
                }
                continue;
            }
            if self.seen.get(&item.id) != Some(&item)
                && store.item(&item.id).as_ref() != Some(&item)
            {
                store.upsert_item(item.clone());
                changes += 1;
            }
            current.insert(item.id.clone(), item);
        }
        for gone in self.seen.keys().filter(|id| !current.contains_key(*id)) {
            if !self.edits.is_in_flight(gone) && store.delete_item(gone).is_some() {
                changes += 1;
            }
        }
        self.seen = current;
        changes
    }
}

type SharedReconciler = Arc<Mutex<Reconciler>>;

fn reconcile(reconciler: &SharedReconciler, doc: &SharedDocument, store: &CanvasStore) -> usize {
    reconciler
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .reconcile(doc, store)
}

async fn follow_provider(
    mut events: broadcast::Receiver<ProviderEvent>,
    reconciler: SharedReconciler,
    doc: SharedDocument,
    store: CanvasStore,
) {
    loop {
        match events.recv().await {
            Ok(ProviderEvent::RemoteUpdate) | Ok(ProviderEvent::Synced) => {
                let changes = reconcile(&reconciler, &doc, &store);
                if changes > 0 {
                    log::debug!("Reconciled {changes} items from the shared document");
                }
            }
            Ok(ProviderEvent::Status(status)) => {
                store.set_connected(status == ConnectionStatus::Connected);
            }
            Ok(ProviderEvent::Awareness(_)) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => {
                log::warn!("Missed {n} provider events, reconciling");
                reconcile(&reconciler, &doc, &store);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

pub struct CanvasSession {
    project_id: String,
    actor_id: String,
    store: CanvasStore,
    doc: SharedDocument,
    engine: SyncEngine,
    reconciler: SharedReconciler,
    provider: TransportProvider,
    persistence: Option<PersistenceAdapter>,
    presence: Option<PresenceTracker>,
    follower: JoinHandle<()>,
}

impl CanvasSession {
    pub async fn start(
        project_id: &str,
        actor: PresenceRecord,
        config: &SessionConfig,
        services: SessionServices,
    ) -> Self {
        let actor_id = actor.actor_id.clone();
        let store = CanvasStore::new();
        let doc = SharedDocument::new();
        let engine = SyncEngine::new(services.api, store.clone(), project_id, actor_id.as_str());
        let reconciler = Arc::new(Mutex::new(Reconciler::new(engine.local_edits().clone())));

        let mirror = services.mirror.unwrap_or_else(|| open_mirror(config));
        let persistence =
            PersistenceAdapter::open(doc.clone(), mirror, project_id, config.mirror_trim_size)
                .await;
        reconcile(&reconciler, &doc, &store);

        // REST rows replace the mirrored content when the store is reachable.
        if let Err(e) = engine.load_canvas().await {
            log::warn!("Continuing {project_id} with local content only: {e}");
        }

        engine.start_viewport_saver(config.viewport_save_debounce);
        if let Err(e) = engine.start_change_feed(services.changes.as_ref()).await {
            log::warn!("Change feed for {project_id} unavailable: {e}");
        }

        let mut provider =
            TransportProvider::new(doc.clone(), services.realtime, config.provider_config());
        let events = provider.subscribe();
        if let Err(e) = provider.connect(project_id).await {
            log::warn!("Realtime room {project_id} unavailable: {e}");
        }
        store.set_connected(provider.is_connected());
        let follower = tokio::spawn(follow_provider(
            events,
            reconciler.clone(),
            doc.clone(),
            store.clone(),
        ));

        let presence =
            match PresenceTracker::start(services.presence, project_id, actor, store.clone()).await
            {
                Ok(tracker) => Some(tracker),
                Err(e) => {
                    log::warn!("Presence for {project_id} unavailable: {e}");
                    None
                }
            };

        log::info!("Session for {project_id} started as {actor_id}");
        Self {
            project_id: project_id.to_string(),
            actor_id,
            store,
            doc,
            engine,
            reconciler,
            provider,
            persistence: Some(persistence),
            presence,
            follower,
        }
    }

    pub fn store(&self) -> &CanvasStore {
        &self.store
    }

    pub fn document(&self) -> &SharedDocument {
        &self.doc
    }

    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    pub fn provider(&self) -> &TransportProvider {
        &self.provider
    }

    pub fn presence(&self) -> Option<&PresenceTracker> {
        self.presence.as_ref()
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn actor_id(&self) -> &str {
        &self.actor_id
    }

    /// Re-subscribe to the realtime room after a disconnect.
    pub async fn reconnect(&mut self) -> Result<(), TransportError> {
        let result = self.provider.connect(&self.project_id).await;
        self.store.set_connected(self.provider.is_connected());
        result
    }

    /// Publish the local awareness state (cursor, name, ...).
    pub fn set_awareness(&self, state: Option<Value>) {
        self.provider.set_local_awareness(state);
    }

    // ─── Edits ────────────────────────────────────────────────────────

    /// Write the confirmed state of `id` into the document.
    fn publish(&self, id: &str, patch: &ItemPatch) {
        if self.doc.update_item(id, patch, UpdateOrigin::Local) {
            return;
        }
        if let Some(item) = self.store.item(id) {
            self.doc.push_item(&item, UpdateOrigin::Local);
        }
    }

    /// Fold remote document changes held back during a local edit into the
    /// store. Local writes raise no provider event of their own.
    fn settle_document(&self) {
        reconcile(&self.reconciler, &self.doc, &self.store);
    }

    pub async fn create_item(&self, data: NewItem) -> Result<CanvasItem, SyncError> {
        let item = self.engine.create_item(data).await?;
        if self.doc.item(&item.id).is_none() {
            self.doc.push_item(&item, UpdateOrigin::Local);
        }
        self.settle_document();
        Ok(item)
    }

    pub async fn update_item(&self, id: &str, patch: ItemPatch) -> Result<(), SyncError> {
        self.engine.update_item(id, patch.clone()).await?;
        self.publish(id, &patch);
        self.settle_document();
        Ok(())
    }

    pub async fn delete_item(&self, id: &str) -> Result<(), SyncError> {
        self.engine.delete_item(id).await?;
        self.doc.remove_item(id, UpdateOrigin::Local);
        self.settle_document();
        Ok(())
    }

    pub async fn delete_selected(&self) -> Result<usize, SyncError> {
        let selected = self.store.selection();
        let result = self.engine.delete_selected().await;
        let edits = self.engine.local_edits();
        for id in selected.iter().filter(|id| edits.is_deleted(id)) {
            self.doc.remove_item(id, UpdateOrigin::Local);
        }
        self.settle_document();
        result
    }

    pub async fn move_selected(&self, dx: f64, dy: f64) -> Result<(), SyncError> {
        let result = self.engine.move_selected(dx, dy).await;
        for id in self.store.selection() {
            if let Some(item) = self.store.item(&id) {
                self.publish(&id, &ItemPatch::position(item.x, item.y));
            }
        }
        self.settle_document();
        result
    }

    pub async fn bring_to_front(&self, id: &str) -> Result<(), SyncError> {
        self.engine.bring_to_front(id).await?;
        self.publish_z(id);
        self.settle_document();
        Ok(())
    }

    pub async fn send_to_back(&self, id: &str) -> Result<(), SyncError> {
        self.engine.send_to_back(id).await?;
        self.publish_z(id);
        self.settle_document();
        Ok(())
    }

    fn publish_z(&self, id: &str) {
        if let Some(item) = self.store.item(id) {
            self.publish(id, &ItemPatch::z_index(item.z_index));
        }
    }

    /// Tear down every subscription and timer, then flush the mirror.
    pub async fn shutdown(mut self) {
        self.provider.disconnect();
        self.follower.abort();
        self.engine.shutdown();
        if let Some(presence) = self.presence.take() {
            presence.stop().await;
        }
        if let Some(persistence) = self.persistence.take() {
            if let Err(e) = persistence.close().await {
                log::error!("Closing mirror of {} failed: {e}", self.project_id);
            }
        }
        self.store.set_connected(false);
        log::info!("Session for {} closed", self.project_id);
    }
}
