//! End-to-end sync between clients through an in-process relay.

use collab_sync::sync::protocol::encode_binary;
use collab_sync::sync::{Awareness, CollabDocument, DocReplica, DocSyncAdapter, QueryOptions};
use collab_sync::transport::{ChannelFactory, MemoryFactory};
use collab_sync::{ChannelConfig, RelayServer};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const WORKSPACE: &str = "ws-1";

struct Client {
    doc: Arc<CollabDocument>,
    awareness: Arc<Awareness>,
    adapter: DocSyncAdapter,
}

fn factory(relay: &Arc<RelayServer>) -> MemoryFactory {
    let config = ChannelConfig::new("memory://relay")
        .with_reconnect_delay(Duration::from_millis(5), Duration::from_millis(20))
        .with_ack_timeout(Some(Duration::from_secs(2)));
    MemoryFactory::new(relay.clone(), config)
}

fn client(factory: &MemoryFactory, client_id: u64, actor: u8) -> Client {
    let doc = Arc::new(CollabDocument::with_actor("doc-1", &[actor; 16]));
    let awareness = Arc::new(Awareness::new(client_id));
    let adapter = DocSyncAdapter::from_factory(factory, WORKSPACE, doc.clone(), awareness.clone());
    Client {
        doc,
        awareness,
        adapter,
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(3), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn joined(relay: &RelayServer, members: usize) -> bool {
    relay
        .room(WORKSPACE)
        .is_some_and(|room| room.member_count() == members)
}

#[tokio::test]
async fn test_update_reaches_peer_and_converges() {
    let relay = Arc::new(RelayServer::new());
    let factory = factory(&relay);
    let alice = client(&factory, 1, 1);
    let bob = client(&factory, 2, 2);

    let _alice_sub = alice.adapter.on_doc_update(|_, _| {}).unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let bob_doc = bob.doc.clone();
    let _bob_sub = bob
        .adapter
        .on_doc_update(move |guid, update| {
            if guid == bob_doc.guid() {
                bob_doc.apply_update(&update).unwrap();
            }
            let _ = tx.send(update);
        })
        .unwrap();
    wait_until(|| joined(&relay, 2)).await;

    let update = alice.doc.splice_text("body", 0, 0, "Hello World").unwrap();
    alice.adapter.send_doc_update("doc-1", &update).await.unwrap();

    let received = tokio::time::timeout(Duration::from_secs(3), rx.recv())
        .await
        .expect("update not relayed")
        .unwrap();
    assert_eq!(encode_binary(&received), encode_binary(&update));
    assert_eq!(bob.doc.text("body").unwrap(), Some("Hello World".to_string()));

    // Bob edits back; both replicas end up identical
    let update = bob.doc.splice_text("body", 5, 0, ",").unwrap();
    bob.adapter.send_doc_update("doc-1", &update).await.unwrap();

    let relay_doc = relay.room(WORKSPACE).unwrap().document("doc-1").unwrap();
    wait_until(|| relay_doc.text("body").ok().flatten().as_deref() == Some("Hello, World")).await;

    let missing = alice
        .adapter
        .query_doc_state("doc-1", QueryOptions::with_state_vector(alice.doc.state_vector()))
        .await
        .unwrap()
        .expect("alice is behind");
    alice.doc.apply_update(&missing).unwrap();

    assert_eq!(alice.doc.text("body").unwrap(), bob.doc.text("body").unwrap());
    assert_eq!(alice.doc.heads(), bob.doc.heads());
}

#[tokio::test]
async fn test_bootstrap_from_relay() {
    let relay = Arc::new(RelayServer::new());
    let factory = factory(&relay);
    let alice = client(&factory, 1, 1);

    let _sub = alice.adapter.on_doc_update(|_, _| {}).unwrap();
    let update = alice.doc.put_field("title", "Plan").unwrap();
    alice.adapter.send_doc_update("doc-1", &update).await.unwrap();
    wait_until(|| relay.stats().documents == 1).await;

    // A brand-new replica pulls the full state
    let carol = client(&factory, 3, 3);
    let _carol_sub = carol.adapter.on_doc_update(|_, _| {}).unwrap();
    assert!(carol.adapter.pull_root().await.unwrap());
    assert_eq!(carol.doc.get_field("title").unwrap(), Some("Plan".to_string()));

    // Already current: nothing to send
    assert!(!carol.adapter.pull_root().await.unwrap());

    // Ahead of the relay with an unpushed edit: still nothing to send
    carol.doc.put_field("draft", "local only").unwrap();
    assert!(!carol.adapter.pull_root().await.unwrap());

    // Unknown document
    let state = carol
        .adapter
        .query_doc_state("nope", QueryOptions::default())
        .await
        .unwrap();
    assert!(state.is_none());
}

#[tokio::test]
async fn test_awareness_propagates_between_peers() {
    let relay = Arc::new(RelayServer::new());
    let factory = factory(&relay);
    let alice = client(&factory, 1, 1);
    let bob = client(&factory, 2, 2);

    alice.awareness.set_local_state(json!({ "user": "alice" }));
    let _alice_sub = alice.adapter.on_doc_update(|_, _| {}).unwrap();
    wait_until(|| joined(&relay, 1)).await;

    // Bob joins later and learns about Alice through the re-announce
    let _bob_sub = bob.adapter.on_doc_update(|_, _| {}).unwrap();
    wait_until(|| bob.awareness.state(1).is_some()).await;
    assert_eq!(bob.awareness.state(1), Some(json!({ "user": "alice" })));

    bob.awareness.set_local_state_field("cursor", json!(4));
    wait_until(|| alice.awareness.state(2).is_some()).await;
    assert_eq!(alice.awareness.state(2), Some(json!({ "cursor": 4 })));

    alice.awareness.clear_local_state();
    wait_until(|| bob.awareness.state(1).is_none()).await;
}

#[tokio::test]
async fn test_teardown_leaves_room() {
    let relay = Arc::new(RelayServer::new());
    let factory = factory(&relay);
    let alice = client(&factory, 1, 1);

    let sub = alice.adapter.on_doc_update(|_, _| {}).unwrap();
    wait_until(|| joined(&relay, 1)).await;

    sub.teardown();
    sub.teardown();

    wait_until(|| relay.stats().connections == 0).await;
    assert!(joined(&relay, 0));
    assert_eq!(alice.adapter.channel().handler_count(), 0);
    assert_eq!(alice.awareness.observer_count(), 0);
}

#[tokio::test]
async fn test_rejoins_after_connection_loss() {
    let relay = Arc::new(RelayServer::new());
    let factory = factory(&relay);
    let alice = client(&factory, 1, 1);
    let bob = client(&factory, 2, 2);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let alice_doc = alice.doc.clone();
    let _alice_sub = alice
        .adapter
        .on_doc_update(move |_, update| {
            alice_doc.apply_update(&update).unwrap();
            let _ = tx.send(());
        })
        .unwrap();
    wait_until(|| joined(&relay, 1)).await;

    // Drop Alice's connection on the relay side; the channel reconnects
    // and the adapter joins the room again on its own
    let room = relay.room(WORKSPACE).unwrap();
    let conn = room.members_except(Default::default())[0];
    assert!(relay.disconnect(conn));
    wait_until(|| room.member_count() == 1 && !room.is_member(conn)).await;

    let _bob_sub = bob.adapter.on_doc_update(|_, _| {}).unwrap();
    wait_until(|| joined(&relay, 2)).await;

    let update = bob.doc.put_field("title", "after reconnect").unwrap();
    bob.adapter.send_doc_update("doc-1", &update).await.unwrap();
    tokio::time::timeout(Duration::from_secs(3), rx.recv())
        .await
        .expect("update not delivered")
        .unwrap();
    assert_eq!(
        alice.doc.get_field("title").unwrap(),
        Some("after reconnect".to_string())
    );
}

#[tokio::test]
async fn test_reactivation_joins_once() {
    let relay = Arc::new(RelayServer::new());
    let factory = factory(&relay);
    let alice = client(&factory, 1, 1);
    let bob = client(&factory, 2, 2);

    let _bob_sub = bob.adapter.on_doc_update(|_, _| {}).unwrap();
    wait_until(|| joined(&relay, 1)).await;

    let inits = Arc::new(AtomicUsize::new(0));
    let counter = inits.clone();
    bob.adapter.channel().on(
        "new-client-awareness-init",
        Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
    );

    let sub = alice.adapter.on_doc_update(|_, _| {}).unwrap();
    wait_until(|| inits.load(Ordering::SeqCst) == 1).await;

    sub.teardown();
    wait_until(|| joined(&relay, 1) && relay.stats().connections == 1).await;

    // Same adapter, same channel: a second join, not a reconnect
    let _sub = alice.adapter.on_doc_update(|_, _| {}).unwrap();
    wait_until(|| joined(&relay, 2)).await;
    wait_until(|| inits.load(Ordering::SeqCst) >= 2).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(inits.load(Ordering::SeqCst), 2);
    assert_eq!(relay.room(WORKSPACE).unwrap().member_count(), 2);
}

#[test]
fn test_factory_opens_independent_channels() {
    let relay = Arc::new(RelayServer::new());
    let factory = factory(&relay);
    let first = factory.open();
    let second = factory.open();
    assert!(!Arc::ptr_eq(&first, &second));
    assert!(!first.is_connected());
}
