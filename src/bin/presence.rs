//! collab-presence - joins a workspace on a relay and reports who is there
//!
//! Reads the channel settings from the environment (`SYNC_URL`,
//! `SYNC_RECONNECT`, `SYNC_ACK_TIMEOUT_MS`, `SYNC_MAX_RECONNECT_ATTEMPTS`)
//! plus `SYNC_WORKSPACE`, `SYNC_DOC` and `SYNC_USER`. Runs until Ctrl-C.

use anyhow::Context;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

use collab_sync::sync::awareness::OUTDATED_TIMEOUT;
use collab_sync::{Awareness, ChannelConfig, CollabDocument, DocReplica, DocSyncAdapter, WebSocketFactory};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "collab_sync=info,collab_presence=info".into()),
        )
        .init();

    dotenvy::dotenv().ok();

    let config = ChannelConfig::from_env();
    let workspace = std::env::var("SYNC_WORKSPACE").unwrap_or_else(|_| "default".to_string());
    let guid = std::env::var("SYNC_DOC").unwrap_or_else(|_| workspace.clone());
    let user = std::env::var("SYNC_USER").unwrap_or_else(|_| "anonymous".to_string());

    info!("Connecting to {} as {}", config.url, user);
    let factory = WebSocketFactory::new(config);
    let doc = Arc::new(CollabDocument::new(guid));
    let awareness = Arc::new(Awareness::with_random_id());
    let adapter = DocSyncAdapter::from_factory(&factory, workspace.clone(), doc.clone(), awareness.clone());

    awareness.on_change({
        let awareness = Arc::downgrade(&awareness);
        move |change, origin| {
            let Some(awareness) = awareness.upgrade() else {
                return;
            };
            info!(
                "Presence {:?}: +{:?} ~{:?} -{:?}, {} online",
                origin,
                change.added,
                change.updated,
                change.removed,
                awareness.states().len()
            );
        }
    });

    let subscription = adapter
        .on_doc_update({
            let doc = doc.clone();
            move |guid, update| {
                if guid != doc.guid() {
                    return;
                }
                if let Err(e) = doc.apply_update(&update) {
                    warn!("Failed to apply update to {}: {}", guid, e);
                }
            }
        })
        .with_context(|| format!("failed to join {workspace}"))?;

    awareness.set_local_state(json!({ "user": user, "online": true }));

    match adapter.pull_root().await {
        Ok(true) => info!("Loaded {} from relay", doc.guid()),
        Ok(false) => info!("{} is empty on the relay", doc.guid()),
        Err(e) => warn!("Initial load of {} failed: {}", doc.guid(), e),
    }

    // Re-announce well inside the timeout so peers keep us, and drop peers gone silent
    let mut renew = tokio::time::interval(OUTDATED_TIMEOUT / 2);
    let mut sweep = tokio::time::interval(OUTDATED_TIMEOUT / 10);
    loop {
        tokio::select! {
            _ = renew.tick() => {
                if let Some(state) = awareness.local_state() {
                    awareness.set_local_state(state);
                }
            }
            _ = sweep.tick() => {
                let change = awareness.remove_outdated(OUTDATED_TIMEOUT);
                if !change.removed.is_empty() {
                    info!("Timed out peers {:?}", change.removed);
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    awareness.clear_local_state();
    subscription.teardown();
    info!("Left {}", workspace);
    Ok(())
}
