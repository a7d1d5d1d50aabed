//! Document sync adapter: the client entry point of the sync protocol.
//!
//! The adapter owns the channel handle for one workspace room. It answers
//! three needs of a local document replica:
//! - bootstrap: ask the peer for whatever a state vector is missing
//! - push: send local updates to the room
//! - receive: deliver updates other room members produced
//!
//! Activation (`on_doc_update`) joins the room and wires the awareness bridge
//! on the same channel; the returned `DocSubscription` undoes all of it.

use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::awareness::Awareness;
use super::bridge::{self, AwarenessBridge, AwarenessSubscription};
use super::document::DocReplica;
use super::protocol::{
    decode_binary, encode_binary, from_payload, to_payload, DocLoadAck, DocLoadRequest,
    DocUpdateMessage, Event,
};
use super::subscriptions::Subscriptions;
use super::{SyncError, SyncResult, WorkspaceId};
use crate::transport::{Channel, ChannelFactory, RECONNECT};

/// Options for `query_doc_state`
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// What the requester already has; `None` asks for the full state
    pub state_vector: Option<Vec<u8>>,
}

impl QueryOptions {
    pub fn with_state_vector(state_vector: Vec<u8>) -> Self {
        Self {
            state_vector: Some(state_vector),
        }
    }
}

/// Bridges local document replicas of one workspace to the relay
pub struct DocSyncAdapter {
    workspace_id: WorkspaceId,
    channel: Arc<dyn Channel>,
    root_doc: Arc<dyn DocReplica>,
    awareness: Arc<Awareness>,
}

impl DocSyncAdapter {
    pub fn new(
        workspace_id: impl Into<WorkspaceId>,
        channel: Arc<dyn Channel>,
        root_doc: Arc<dyn DocReplica>,
        awareness: Arc<Awareness>,
    ) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            channel,
            root_doc,
            awareness,
        }
    }

    /// Create an adapter on a fresh channel from `factory`
    pub fn from_factory(
        factory: &dyn ChannelFactory,
        workspace_id: impl Into<WorkspaceId>,
        root_doc: Arc<dyn DocReplica>,
        awareness: Arc<Awareness>,
    ) -> Self {
        Self::new(workspace_id, factory.open(), root_doc, awareness)
    }

    pub fn workspace_id(&self) -> &str {
        &self.workspace_id
    }

    /// The raw channel, for observing connection lifecycle events
    pub fn channel(&self) -> &Arc<dyn Channel> {
        &self.channel
    }

    pub fn root_doc(&self) -> &Arc<dyn DocReplica> {
        &self.root_doc
    }

    pub fn awareness(&self) -> &Arc<Awareness> {
        &self.awareness
    }

    /// Ask the peer for the state of `guid` missing from `options.state_vector`.
    ///
    /// Returns `None` when the peer has nothing newer.
    pub async fn query_doc_state(
        &self,
        guid: &str,
        options: QueryOptions,
    ) -> SyncResult<Option<Vec<u8>>> {
        let request = DocLoadRequest {
            workspace_id: self.workspace_id.clone(),
            guid: guid.to_string(),
            state_vector: options.state_vector.as_deref().map(encode_binary),
        };

        let answer = self
            .channel
            .emit_with_ack(Event::DocLoad.as_str(), to_payload(&request)?)
            .await?;

        match DocLoadAck::from_value(answer)? {
            DocLoadAck::Update(update) => Ok(Some(decode_binary(&update)?)),
            DocLoadAck::UpToDate => Ok(None),
            DocLoadAck::Error(message) => Err(SyncError::Remote(message)),
        }
    }

    /// Push a local update of `guid` to the room.
    ///
    /// Completes once the update is queued; delivery is not confirmed.
    pub async fn send_doc_update(&self, guid: &str, update: &[u8]) -> SyncResult<()> {
        let msg = DocUpdateMessage {
            workspace_id: self.workspace_id.clone(),
            guid: guid.to_string(),
            update: encode_binary(update),
        };
        self.channel
            .emit(Event::ClientUpdate.as_str(), to_payload(&msg)?)?;
        Ok(())
    }

    /// Fetch and apply whatever `doc` is missing. Returns whether anything was applied.
    pub async fn pull(&self, doc: &dyn DocReplica) -> SyncResult<bool> {
        let options = QueryOptions::with_state_vector(doc.state_vector());
        match self.query_doc_state(doc.guid(), options).await? {
            Some(update) => {
                doc.apply_update(&update)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// `pull` for the workspace root document
    pub async fn pull_root(&self) -> SyncResult<bool> {
        self.pull(self.root_doc.as_ref()).await
    }

    /// Join the room and start delivering remote updates to `callback`.
    ///
    /// `callback` receives the guid of the updated document and the decoded
    /// update. Rejoins the room automatically after every reconnect.
    ///
    /// # Panics
    ///
    /// Connects the channel, so with a socket-backed channel this must run
    /// inside a tokio runtime.
    pub fn on_doc_update<F>(&self, callback: F) -> SyncResult<DocSubscription>
    where
        F: Fn(&str, Vec<u8>) + Send + Sync + 'static,
    {
        self.channel.connect();

        match self.activate(Arc::new(callback)) {
            Ok((subscriptions, awareness)) => {
                info!("Joined workspace {}", self.workspace_id);
                Ok(DocSubscription {
                    workspace_id: self.workspace_id.clone(),
                    channel: self.channel.clone(),
                    subscriptions,
                    awareness,
                    torn_down: AtomicBool::new(false),
                })
            }
            Err(e) => {
                warn!("Failed to join workspace {}: {}", self.workspace_id, e);
                self.channel.disconnect();
                Err(e)
            }
        }
    }

    fn activate(
        &self,
        callback: Arc<dyn Fn(&str, Vec<u8>) + Send + Sync>,
    ) -> SyncResult<(Subscriptions, AwarenessSubscription)> {
        let room = Value::String(self.workspace_id.clone());
        self.channel
            .emit(Event::ClientHandshake.as_str(), room.clone())?;

        let subscriptions = Subscriptions::new();

        let handler = {
            let workspace_id = self.workspace_id.clone();
            self.channel.on(
                Event::ServerUpdate.as_str(),
                Arc::new(move |payload| deliver_update(&workspace_id, callback.as_ref(), payload)),
            )
        };
        subscriptions.push("server-update", {
            let channel = self.channel.clone();
            move || {
                channel.off(handler);
            }
        });

        let handler = {
            let workspace_id = self.workspace_id.clone();
            let awareness = self.awareness.clone();
            let weak_channel = Arc::downgrade(&self.channel);
            self.channel.on(
                RECONNECT,
                Arc::new(move |_| {
                    let Some(channel) = weak_channel.upgrade() else {
                        return;
                    };
                    debug!("Rejoining workspace {} after reconnect", workspace_id);
                    let rejoined = channel
                        .emit(Event::ClientHandshake.as_str(), Value::String(workspace_id.clone()))
                        .map_err(SyncError::from)
                        .and_then(|()| bridge::announce(channel.as_ref(), &workspace_id, &awareness));
                    if let Err(e) = rejoined {
                        warn!("Failed to rejoin workspace {}: {}", workspace_id, e);
                    }
                }),
            )
        };
        subscriptions.push("reconnect", {
            let channel = self.channel.clone();
            move || {
                channel.off(handler);
            }
        });

        let awareness = AwarenessBridge::setup(
            self.channel.clone(),
            self.workspace_id.clone(),
            self.awareness.clone(),
        )?;

        Ok((subscriptions, awareness))
    }
}

fn deliver_update(workspace_id: &str, callback: &(dyn Fn(&str, Vec<u8>) + Send + Sync), payload: Value) {
    let msg: DocUpdateMessage = match from_payload(payload) {
        Ok(msg) => msg,
        Err(e) => {
            debug!("Dropping malformed server-update: {}", e);
            return;
        }
    };
    if msg.workspace_id != workspace_id {
        debug!("Ignoring server-update for {}", msg.workspace_id);
        return;
    }
    match decode_binary(&msg.update) {
        Ok(update) => callback(&msg.guid, update),
        Err(e) => warn!("Dropping undecodable update for {}: {}", msg.guid, e),
    }
}

/// Active room membership returned by `DocSyncAdapter::on_doc_update`
#[must_use = "dropping the subscription leaves the workspace"]
pub struct DocSubscription {
    workspace_id: WorkspaceId,
    channel: Arc<dyn Channel>,
    subscriptions: Subscriptions,
    awareness: AwarenessSubscription,
    torn_down: AtomicBool,
}

impl DocSubscription {
    /// Leave the room, detach every handler and close the channel.
    ///
    /// Only the first call has an effect.
    pub fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }

        let room = Value::String(self.workspace_id.clone());
        if let Err(e) = self.channel.emit(Event::ClientLeave.as_str(), room) {
            debug!("Could not send leave for {}: {}", self.workspace_id, e);
        }
        self.subscriptions.release();
        self.awareness.teardown();
        self.channel.disconnect();

        info!("Left workspace {}", self.workspace_id);
    }

    pub fn is_active(&self) -> bool {
        !self.torn_down.load(Ordering::Acquire)
    }

    pub fn workspace_id(&self) -> &str {
        &self.workspace_id
    }
}

impl Drop for DocSubscription {
    fn drop(&mut self) {
        self.teardown();
    }
}
