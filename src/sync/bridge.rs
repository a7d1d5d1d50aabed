//! Awareness bridge: keeps a local `Awareness` replica in step with the peers
//! in the same workspace room.
//!
//! Outbound, every local change is flattened to the set of touched clients,
//! encoded and sent as `awareness-update`. Inbound, relayed diffs are applied
//! with `Origin::Server`, which the outbound listener skips so a remote diff
//! is never echoed back. When a new peer joins, the relay asks everyone to
//! re-announce and the bridge answers with its own entry only.

use serde_json::Value;
use std::sync::{Arc, Weak};
use tracing::{debug, error, warn};

use super::awareness::{Awareness, Origin};
use super::protocol::{decode_binary, encode_binary, from_payload, to_payload, AwarenessMessage, Event};
use super::subscriptions::Subscriptions;
use super::{ClientId, SyncResult, WorkspaceId};
use crate::transport::Channel;

/// Wires an awareness replica to a channel
pub struct AwarenessBridge;

impl AwarenessBridge {
    /// Attach the awareness handlers and announce the local client.
    ///
    /// The channel is expected to be connected (or connecting) already. The
    /// returned subscription detaches everything on teardown or drop; it
    /// sends nothing itself.
    pub fn setup(
        channel: Arc<dyn Channel>,
        workspace_id: impl Into<WorkspaceId>,
        awareness: Arc<Awareness>,
    ) -> SyncResult<AwarenessSubscription> {
        let workspace_id = workspace_id.into();
        let subscriptions = Subscriptions::new();

        let handler = {
            let workspace_id = workspace_id.clone();
            let awareness = awareness.clone();
            channel.on(
                Event::ServerAwarenessBroadcast.as_str(),
                Arc::new(move |payload| apply_remote(&workspace_id, &awareness, payload)),
            )
        };
        subscriptions.push("server-awareness-broadcast", {
            let channel = channel.clone();
            move || {
                channel.off(handler);
            }
        });

        let handler = {
            let workspace_id = workspace_id.clone();
            let awareness = awareness.clone();
            let weak_channel = Arc::downgrade(&channel);
            channel.on(
                Event::NewClientAwarenessInit.as_str(),
                Arc::new(move |_| {
                    let Some(channel) = weak_channel.upgrade() else {
                        return;
                    };
                    let own = [awareness.client_id()];
                    if let Err(e) = emit_update(channel.as_ref(), &workspace_id, &awareness, &own) {
                        error!("Failed to re-announce awareness in {}: {}", workspace_id, e);
                    }
                }),
            )
        };
        subscriptions.push("new-client-awareness-init", {
            let channel = channel.clone();
            move || {
                channel.off(handler);
            }
        });

        let observer = {
            let workspace_id = workspace_id.clone();
            let weak_awareness: Weak<Awareness> = Arc::downgrade(&awareness);
            let channel = channel.clone();
            awareness.on_change(move |change, origin| {
                if origin == Origin::Server {
                    return;
                }
                let Some(awareness) = weak_awareness.upgrade() else {
                    return;
                };
                let clients = change.changed_clients();
                if let Err(e) = emit_update(channel.as_ref(), &workspace_id, &awareness, &clients) {
                    error!("Failed to send awareness update in {}: {}", workspace_id, e);
                }
            })
        };
        subscriptions.push("awareness-observer", {
            let awareness = awareness.clone();
            move || {
                awareness.off_change(observer);
            }
        });

        announce(channel.as_ref(), &workspace_id, &awareness)?;

        debug!("Awareness bridge attached to {}", workspace_id);
        Ok(AwarenessSubscription {
            workspace_id,
            subscriptions,
        })
    }
}

/// Handle on an attached awareness bridge
#[must_use = "dropping the subscription detaches the awareness bridge"]
pub struct AwarenessSubscription {
    workspace_id: WorkspaceId,
    subscriptions: Subscriptions,
}

impl AwarenessSubscription {
    /// Detach all handlers in reverse order. Safe to call more than once.
    pub fn teardown(&self) {
        if self.subscriptions.release() {
            debug!("Awareness bridge detached from {}", self.workspace_id);
        }
    }

    pub fn is_active(&self) -> bool {
        !self.subscriptions.is_released()
    }

    pub fn workspace_id(&self) -> &str {
        &self.workspace_id
    }
}

/// Publish the local entry (if any) and ask present peers to re-announce
pub(crate) fn announce(channel: &dyn Channel, workspace_id: &str, awareness: &Awareness) -> SyncResult<()> {
    if awareness.local_state().is_some() {
        emit_update(channel, workspace_id, awareness, &[awareness.client_id()])?;
    }
    channel.emit(Event::AwarenessInit.as_str(), Value::String(workspace_id.to_string()))?;
    Ok(())
}

fn emit_update(
    channel: &dyn Channel,
    workspace_id: &str,
    awareness: &Awareness,
    clients: &[ClientId],
) -> SyncResult<()> {
    let update = awareness.encode_update(clients)?;
    let msg = AwarenessMessage {
        workspace_id: workspace_id.to_string(),
        awareness_update: encode_binary(&update),
    };
    channel.emit(Event::AwarenessUpdate.as_str(), to_payload(&msg)?)?;
    Ok(())
}

fn apply_remote(workspace_id: &str, awareness: &Awareness, payload: Value) {
    let msg: AwarenessMessage = match from_payload(payload) {
        Ok(msg) => msg,
        Err(e) => {
            warn!("Dropping awareness broadcast: {}", e);
            return;
        }
    };
    if msg.workspace_id != workspace_id {
        debug!("Ignoring awareness broadcast for {}", msg.workspace_id);
        return;
    }

    let result = decode_binary(&msg.awareness_update)
        .map_err(|e| e.to_string())
        .and_then(|update| {
            awareness
                .apply_update(&update, Origin::Server)
                .map_err(|e| e.to_string())
        });
    if let Err(e) = result {
        error!("Failed to apply awareness broadcast in {}: {}", workspace_id, e);
    }
}
