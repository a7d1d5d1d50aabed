//! Awareness: ephemeral presence shared between replicas.
//!
//! Each replica instance owns one `ClientId` and publishes a small JSON
//! payload (cursor, user name, online flag) under it. Nothing here is
//! persisted. Every entry carries a logical clock; a remote entry only
//! replaces what we hold when its clock is newer, so stale and duplicate
//! diffs are dropped here rather than by the sync layer.
//!
//! Mutations are tagged with an [`Origin`]. Change observers receive it so
//! the bridge can tell diffs it applied on behalf of the server apart from
//! genuinely local edits and never echo them back.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

use super::ClientId;

/// How long a remote entry may go without an update before it is considered gone
pub const OUTDATED_TIMEOUT: Duration = Duration::from_secs(30);

/// Where a mutation of the awareness map came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    /// Made by this replica
    Local,
    /// Applied from a server broadcast
    Server,
}

/// One transition of the awareness map
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

    /// Added, updated and removed ids flattened into one set
    pub fn changed_clients(&self) -> Vec<ClientId> {
        let mut clients: Vec<ClientId> = self
            .added
            .iter()
            .chain(&self.updated)
            .chain(&self.removed)
            .copied()
            .collect();
        clients.sort_unstable();
        clients.dedup();
        clients
    }
}

/// Errors from encoding or applying awareness diffs
#[derive(Debug, Clone, thiserror::Error)]
pub enum AwarenessError {
    #[error("Failed to encode awareness update: {0}")]
    Encode(String),

    #[error("Failed to decode awareness update: {0}")]
    Decode(String),
}

/// Identifier of a registered change observer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// Change observer callback
pub type ChangeHandler = Arc<dyn Fn(&AwarenessChange, Origin) + Send + Sync>;

/// Encoded diff: one entry per client, `state: None` meaning "gone"
#[derive(Debug, Serialize, Deserialize)]
struct AwarenessUpdate {
    entries: Vec<AwarenessEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct AwarenessEntry {
    client_id: ClientId,
    clock: u32,
    /// JSON text of the state
    state: Option<String>,
}

#[derive(Debug, Clone, Copy)]
struct ClientMeta {
    clock: u32,
    last_updated: Instant,
}

#[derive(Debug, Default)]
struct AwarenessInner {
    states: HashMap<ClientId, Value>,
    meta: HashMap<ClientId, ClientMeta>,
}

/// In-memory awareness replica
pub struct Awareness {
    client_id: ClientId,
    inner: RwLock<AwarenessInner>,
    observers: RwLock<Vec<(ObserverId, ChangeHandler)>>,
    next_observer: AtomicU64,
}

impl Awareness {
    pub fn new(client_id: ClientId) -> Self {
        Self {
            client_id,
            inner: RwLock::new(AwarenessInner::default()),
            observers: RwLock::new(Vec::new()),
            next_observer: AtomicU64::new(1),
        }
    }

    /// Create a replica with a random client id
    pub fn with_random_id() -> Self {
        Self::new(rand::random::<u32>() as ClientId)
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn local_state(&self) -> Option<Value> {
        self.state(self.client_id)
    }

    pub fn state(&self, client_id: ClientId) -> Option<Value> {
        self.inner.read().states.get(&client_id).cloned()
    }

    /// Snapshot of every known client's state
    pub fn states(&self) -> HashMap<ClientId, Value> {
        self.inner.read().states.clone()
    }

    /// Logical clock of a client, if it was ever seen
    pub fn clock(&self, client_id: ClientId) -> Option<u32> {
        self.inner.read().meta.get(&client_id).map(|m| m.clock)
    }

    /// Replace the local client's state
    pub fn set_local_state(&self, state: Value) {
        if state.is_null() {
            self.clear_local_state();
            return;
        }

        let change = {
            let mut inner = self.inner.write();
            let clock = inner
                .meta
                .get(&self.client_id)
                .map_or(0, |m| m.clock.saturating_add(1));
            inner.meta.insert(
                self.client_id,
                ClientMeta {
                    clock,
                    last_updated: Instant::now(),
                },
            );
            let previous = inner.states.insert(self.client_id, state);

            let mut change = AwarenessChange::default();
            if previous.is_some() {
                change.updated.push(self.client_id);
            } else {
                change.added.push(self.client_id);
            }
            change
        };

        self.notify(&change, Origin::Local);
    }

    /// Set one field of the local state object, creating the object if needed
    pub fn set_local_state_field(&self, key: &str, value: Value) {
        let mut state = match self.local_state() {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        state.insert(key.to_string(), value);
        self.set_local_state(Value::Object(state));
    }

    /// Mark the local client as gone
    pub fn clear_local_state(&self) {
        let change = {
            let mut inner = self.inner.write();
            let clock = inner
                .meta
                .get(&self.client_id)
                .map_or(0, |m| m.clock.saturating_add(1));
            inner.meta.insert(
                self.client_id,
                ClientMeta {
                    clock,
                    last_updated: Instant::now(),
                },
            );

            let mut change = AwarenessChange::default();
            if inner.states.remove(&self.client_id).is_some() {
                change.removed.push(self.client_id);
            }
            change
        };

        if !change.is_empty() {
            self.notify(&change, Origin::Local);
        }
    }

    /// Encode the entries of `clients` as a diff. Unknown ids are skipped.
    pub fn encode_update(&self, clients: &[ClientId]) -> Result<Vec<u8>, AwarenessError> {
        let inner = self.inner.read();
        let mut entries = Vec::with_capacity(clients.len());

        for client_id in clients {
            let Some(meta) = inner.meta.get(client_id) else {
                continue;
            };
            let state = match inner.states.get(client_id) {
                Some(value) => Some(
                    serde_json::to_string(value)
                        .map_err(|e| AwarenessError::Encode(e.to_string()))?,
                ),
                None => None,
            };
            entries.push(AwarenessEntry {
                client_id: *client_id,
                clock: meta.clock,
                state,
            });
        }

        bincode::serialize(&AwarenessUpdate { entries })
            .map_err(|e| AwarenessError::Encode(e.to_string()))
    }

    /// Apply a diff produced by `encode_update` on another replica.
    ///
    /// The whole diff is decoded before anything is written, so a malformed
    /// entry rejects the diff without touching the map.
    pub fn apply_update(&self, update: &[u8], origin: Origin) -> Result<AwarenessChange, AwarenessError> {
        let decoded: AwarenessUpdate =
            bincode::deserialize(update).map_err(|e| AwarenessError::Decode(e.to_string()))?;

        let mut entries = Vec::with_capacity(decoded.entries.len());
        for entry in decoded.entries {
            let state = match entry.state {
                Some(text) => {
                    let value: Value = serde_json::from_str(&text)
                        .map_err(|e| AwarenessError::Decode(e.to_string()))?;
                    (!value.is_null()).then_some(value)
                }
                None => None,
            };
            entries.push((entry.client_id, entry.clock, state));
        }

        let now = Instant::now();
        let mut change = AwarenessChange::default();

        {
            let mut inner = self.inner.write();

            for (client_id, clock, state) in entries {
                // Nothing could ever supersede an entry at the last clock value
                if clock == u32::MAX {
                    warn!("Dropping awareness entry for {} at exhausted clock", client_id);
                    continue;
                }

                let current_clock = inner.meta.get(&client_id).map_or(0, |m| m.clock);
                let current_state = inner.states.get(&client_id).cloned();
                let known = inner.meta.contains_key(&client_id);

                let newer = !known || current_clock < clock;
                let removal_at_same_clock =
                    current_clock == clock && state.is_none() && current_state.is_some();
                if !newer && !removal_at_same_clock {
                    continue;
                }

                let own_state_kept =
                    client_id == self.client_id && state.is_none() && current_state.is_some();
                let clock = if own_state_kept {
                    // Someone declared us gone while we are still here: outbid them
                    clock + 1
                } else {
                    clock
                };
                match state {
                    None if own_state_kept => {}
                    None => {
                        inner.states.remove(&client_id);
                    }
                    Some(ref value) => {
                        inner.states.insert(client_id, value.clone());
                    }
                }
                inner.meta.insert(
                    client_id,
                    ClientMeta {
                        clock,
                        last_updated: now,
                    },
                );

                match (current_state, state) {
                    (None, Some(_)) => change.added.push(client_id),
                    (Some(_), None) if !own_state_kept => change.removed.push(client_id),
                    (Some(old), Some(new)) if old != new => change.updated.push(client_id),
                    _ => {}
                }
            }
        }

        if !change.is_empty() {
            self.notify(&change, origin);
        }
        Ok(change)
    }

    /// Drop the states of `clients`. The local client is only marked gone.
    pub fn remove_states(&self, clients: &[ClientId], origin: Origin) -> AwarenessChange {
        let mut change = AwarenessChange::default();
        {
            let mut inner = self.inner.write();
            for client_id in clients {
                if inner.states.remove(client_id).is_none() {
                    continue;
                }
                if *client_id == self.client_id {
                    if let Some(meta) = inner.meta.get_mut(client_id) {
                        meta.clock = meta.clock.saturating_add(1);
                        meta.last_updated = Instant::now();
                    }
                }
                change.removed.push(*client_id);
            }
        }

        if !change.is_empty() {
            self.notify(&change, origin);
        }
        change
    }

    /// Remove remote clients not heard from within `timeout`
    pub fn remove_outdated(&self, timeout: Duration) -> AwarenessChange {
        let stale: Vec<ClientId> = {
            let inner = self.inner.read();
            inner
                .meta
                .iter()
                .filter(|(id, meta)| {
                    **id != self.client_id
                        && inner.states.contains_key(id)
                        && meta.last_updated.elapsed() >= timeout
                })
                .map(|(id, _)| *id)
                .collect()
        };

        if stale.is_empty() {
            return AwarenessChange::default();
        }
        self.remove_states(&stale, Origin::Local)
    }

    /// Register a change observer
    pub fn on_change<F>(&self, handler: F) -> ObserverId
    where
        F: Fn(&AwarenessChange, Origin) + Send + Sync + 'static,
    {
        let id = ObserverId(self.next_observer.fetch_add(1, Ordering::Relaxed));
        self.observers.write().push((id, Arc::new(handler)));
        id
    }

    /// Remove a change observer; returns whether it was registered
    pub fn off_change(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.write();
        let before = observers.len();
        observers.retain(|(observer, _)| *observer != id);
        observers.len() != before
    }

    pub fn observer_count(&self) -> usize {
        self.observers.read().len()
    }

    fn notify(&self, change: &AwarenessChange, origin: Origin) {
        // Observers may (un)register while being called
        let observers: Vec<ChangeHandler> = self
            .observers
            .read()
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect();
        for handler in observers {
            handler(change, origin);
        }
    }
}

/// Encode a single entry verbatim, bypassing the clock bookkeeping
#[cfg(test)]
pub(crate) fn encode_raw_entry(client_id: ClientId, clock: u32, state: Option<&str>) -> Vec<u8> {
    let entries = vec![AwarenessEntry {
        client_id,
        clock,
        state: state.map(str::to_string),
    }];
    bincode::serialize(&AwarenessUpdate { entries }).unwrap()
}

impl std::fmt::Debug for Awareness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Awareness")
            .field("client_id", &self.client_id)
            .field("clients", &self.inner.read().states.len())
            .field("observers", &self.observer_count())
            .finish()
    }
}
