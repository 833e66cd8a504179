//! Awareness: ephemeral per-peer metadata (cursor, name, selection)
//! layered alongside the shared document.
//!
//! Clocks, merging and the update wire format are those of
//! [`yrs::sync::Awareness`]: a receiver keeps an entry only if its clock is
//! newer than what it has, a `null` state means "client left", and a peer
//! removing *our* live state is outbid by bumping our clock.
//!
//! This wrapper adds what the room needs on top:
//! - an [`AwarenessChange`] for every mutation, so callers can broadcast
//!   exactly the touched clients
//! - silence tracking on the tokio clock; peers that stay silent for the
//!   outdated timeout are dropped by [`Awareness::remove_outdated`], the
//!   local state is renewed instead
//! - a leave announcement that keeps the local state for the next connect

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use yrs::sync::awareness::{Awareness as YAwareness, AwarenessUpdate};
use yrs::Doc;

use crate::protocol::DecodeError;

pub type ClientId = u64;

/// Default silence after which a remote peer is considered gone.
pub const OUTDATED_TIMEOUT: Duration = Duration::from_secs(30);

const NULL_STATE: &str = "null";

/// Client ids touched by one awareness mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwarenessChange {
    pub added: Vec<ClientId>,
    pub updated: Vec<ClientId>,
    pub removed: Vec<ClientId>,
}

impl AwarenessChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    /// Every touched client, in added / updated / removed order.
    pub fn clients(&self) -> Vec<ClientId> {
        self.added
            .iter()
            .chain(&self.updated)
            .chain(&self.removed)
            .copied()
            .collect()
    }

    fn merge(&mut self, other: AwarenessChange) {
        self.added.extend(other.added);
        self.updated.extend(other.updated);
        self.removed.extend(other.removed);
    }
}

/// `(clock, json)` of every client with a live state.
type LiveStates = HashMap<ClientId, (u32, String)>;

/// Awareness state of one room as seen by one peer.
pub struct Awareness {
    inner: YAwareness,
    client_id: ClientId,
    /// Last time each client's entry was accepted. Entries are kept after
    /// removal so the removal itself can still be encoded.
    seen: HashMap<ClientId, Instant>,
}

impl std::fmt::Debug for Awareness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Awareness")
            .field("client_id", &self.client_id)
            .field("clients", &self.seen.len())
            .finish()
    }
}

impl Awareness {
    /// Create with the local client id (the document's client id).
    pub fn new(client_id: ClientId) -> Self {
        Self {
            inner: YAwareness::new(Doc::with_client_id(client_id)),
            client_id,
            seen: HashMap::new(),
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    fn live(&self) -> LiveStates {
        match self.inner.update() {
            Ok(update) => update
                .clients
                .iter()
                .map(|(client, entry)| (*client, (entry.clock, entry.json.to_string())))
                .filter(|(_, (_, json))| json != NULL_STATE)
                .collect(),
            Err(e) => {
                log::warn!("Cannot read awareness states: {e}");
                LiveStates::new()
            }
        }
    }

    /// Classify the clients in `touched` by comparing two snapshots.
    fn diff(
        &mut self,
        before: &LiveStates,
        touched: impl IntoIterator<Item = ClientId>,
        now: Instant,
    ) -> AwarenessChange {
        let after = self.live();
        let mut change = AwarenessChange::default();
        for client in touched {
            match (before.get(&client), after.get(&client)) {
                (None, Some(_)) => change.added.push(client),
                (Some(old), Some(new)) if old != new => change.updated.push(client),
                (Some(_), None) => change.removed.push(client),
                _ => continue,
            }
            self.seen.insert(client, now);
        }
        change
    }

    pub fn local_state(&self) -> Option<Value> {
        self.state(self.client_id)
    }

    pub fn state(&self, client: ClientId) -> Option<Value> {
        let (_, json) = self.live().remove(&client)?;
        serde_json::from_str(&json).ok()
    }

    /// All clients with a live state, local included.
    pub fn states(&self) -> HashMap<ClientId, Value> {
        self.live()
            .into_iter()
            .filter_map(|(client, (_, json))| {
                serde_json::from_str(&json).ok().map(|state| (client, state))
            })
            .collect()
    }

    /// Every client we hold a clock for, removed ones included.
    pub fn known_clients(&self) -> Vec<ClientId> {
        self.seen.keys().copied().collect()
    }

    /// Replace the local state. `None` announces that we are leaving.
    pub fn set_local_state(&mut self, state: Option<Value>) -> AwarenessChange {
        self.set_local_state_at(state, Instant::now())
    }

    fn set_local_state_at(&mut self, state: Option<Value>, now: Instant) -> AwarenessChange {
        let before = self.live();
        match state {
            Some(state) => {
                if let Err(e) = self.inner.set_local_state(state) {
                    log::warn!("Cannot set local awareness state: {e}");
                    return AwarenessChange::default();
                }
            }
            None => self.inner.clean_local_state(),
        }
        let id = self.client_id;
        self.seen.insert(id, now);
        self.diff(&before, [id], now)
    }

    /// Merge a remote update. States that are not valid JSON reject the
    /// whole update.
    pub fn apply_update(&mut self, update: AwarenessUpdate) -> Result<AwarenessChange, DecodeError> {
        for (client, entry) in &update.clients {
            serde_json::from_str::<Value>(&entry.json).map_err(|e| {
                DecodeError::InvalidAwareness(format!("client {client}: {e}"))
            })?;
        }
        let touched: Vec<ClientId> = update.clients.keys().copied().collect();
        let before = self.live();
        self.inner
            .apply_update(update)
            .map_err(|e| DecodeError::InvalidAwareness(e.to_string()))?;
        Ok(self.diff(&before, touched, Instant::now()))
    }

    /// The current `(clock, state)` of the given clients. Clients we never
    /// heard of are skipped.
    pub fn encode_update(&self, clients: &[ClientId]) -> AwarenessUpdate {
        let known: Vec<ClientId> = clients
            .iter()
            .copied()
            .filter(|client| self.seen.contains_key(client))
            .collect();
        match self.inner.update_with_clients(known) {
            Ok(update) => update,
            Err(e) => {
                log::warn!("Cannot encode awareness of {clients:?}: {e}");
                AwarenessUpdate {
                    clients: Default::default(),
                }
            }
        }
    }

    /// The local client as removed at its current clock. The local state is
    /// kept so it can be re-announced on the next connect.
    pub fn encode_leave(&self) -> AwarenessUpdate {
        let mut update = self.encode_update(&[self.client_id]);
        for entry in update.clients.values_mut() {
            entry.json = NULL_STATE.into();
        }
        update
    }

    /// Every client with a live state.
    pub fn encode_full(&self) -> AwarenessUpdate {
        let clients: Vec<ClientId> = self.live().into_keys().collect();
        self.encode_update(&clients)
    }

    /// Forget the given clients locally. Their clocks move on, so the
    /// removal wins when it is re-broadcast.
    pub fn remove_states(&mut self, clients: &[ClientId]) -> AwarenessChange {
        let before = self.live();
        for client in clients.iter().filter(|c| before.contains_key(c)) {
            self.inner.remove_state(*client);
        }
        self.diff(&before, clients.iter().copied(), Instant::now())
    }

    /// Drop remote clients silent for longer than `timeout`, and renew the
    /// local state once half the timeout has elapsed.
    pub fn remove_outdated(&mut self, timeout: Duration) -> AwarenessChange {
        let now = Instant::now();
        let mut change = AwarenessChange::default();

        let local_renew_due = self
            .seen
            .get(&self.client_id)
            .is_some_and(|at| now.duration_since(*at) >= timeout / 2);
        if local_renew_due {
            if let Some(state) = self.local_state() {
                change = self.set_local_state_at(Some(state), now);
            }
        }

        let live = self.live();
        let outdated: Vec<ClientId> = self
            .seen
            .iter()
            .filter(|(client, at)| {
                **client != self.client_id
                    && live.contains_key(client)
                    && now.duration_since(**at) >= timeout
            })
            .map(|(client, _)| *client)
            .collect();
        if !outdated.is_empty() {
            change.merge(self.remove_states(&outdated));
        }
        change
    }
}
