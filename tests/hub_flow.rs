//! End-to-end hub behavior: cold start, the permission decision table,
//! live permission upgrades, reap-and-reload.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use dochub::crdt::{BroadcastKind, PermissionBroadcast, Replica};
use dochub::db::Store;
use dochub::hub::DocumentId;
use dochub::permissions::PermissionLevel;
use dochub::protocol::{
    self, awareness_frame, decode_sync_payload, AwarenessEntry, SyncPayload, MSG_AWARENESS,
    MSG_BROADCAST_STATELESS, MSG_SYNC,
};
use dochub::registry::HubRegistry;

fn doc_id() -> DocumentId {
    DocumentId::parse("alice/welcome").unwrap()
}

/// Rebuild a replica from the Step2 payload of a sync frame.
fn replica_from_sync(frame: &[u8]) -> Replica {
    assert_eq!(frame[0], MSG_SYNC);
    let SyncPayload::Step2(update) = decode_sync_payload(&frame[1..]).unwrap() else {
        panic!("expected a step2 sync payload");
    };
    Replica::from_bytes(&update).unwrap()
}

#[tokio::test]
async fn cold_document_sends_empty_state_with_seeded_permissions() {
    let registry = HubRegistry::new();
    let store = Arc::new(Store::open_memory().unwrap());
    let config = test_config();
    let id = doc_id();

    let hub = registry.get_or_create(&id, &store, &config).await.unwrap();
    let mut alice = attach_peer(&hub, &store, &id, "alice").await;

    let frame = recv_frame(&mut alice).await;
    let replica = replica_from_sync(&frame);
    assert_eq!(replica.text_string(), "");
    assert_eq!(replica.permission_entry("alice").as_deref(), Some("owner"));
    // created carries an ISO timestamp
    assert!(replica.permission_entry("created").unwrap().contains('T'));
}

#[tokio::test]
async fn readonly_edit_is_rejected_without_disconnecting() {
    let registry = HubRegistry::new();
    let store = Arc::new(Store::open_memory().unwrap());
    let config = test_config();
    let id = doc_id();
    store
        .upsert_permission("alice", "welcome", "bob", PermissionLevel::Readonly, "alice")
        .unwrap();

    let hub = registry.get_or_create(&id, &store, &config).await.unwrap();
    let mut alice = attach_peer(&hub, &store, &id, "alice").await;
    let mut bob = attach_peer(&hub, &store, &id, "bob").await;
    recv_frame(&mut alice).await; // initial sync
    recv_frame(&mut bob).await;

    hub.frame(bob.conn_id, unframed_content_update("hi"));

    // Bob gets a structured error frame and stays attached.
    let frame = recv_frame(&mut bob).await;
    assert_eq!(frame[0], MSG_BROADCAST_STATELESS);
    let mut pos = 1;
    let payload = protocol::read_var_string(&frame, &mut pos).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&payload).unwrap();
    assert_eq!(parsed["code"], "permission_denied");
    assert_eq!(parsed["message"], "User bob has readonly access");

    // Alice sees nothing; the audit trail records the block.
    expect_silence(&mut alice).await;
    assert!(wait_for_activity(&store, &id, "bob", "blocked_document_edit").await);

    // The replica text never changed: a fresh peer still gets empty text.
    let mut carol_conn = attach_peer(&hub, &store, &id, "alice").await;
    let replica = replica_from_sync(&recv_frame(&mut carol_conn).await);
    assert_eq!(replica.text_string(), "");

    // Bob's connection is still usable for presence.
    hub.frame(
        bob.conn_id,
        awareness_frame(&[AwarenessEntry {
            client_id: 71,
            clock: 1,
            state: r#"{"cursor":7}"#.to_string(),
        }]),
    );
    let frame = recv_frame(&mut alice).await;
    assert_eq!(frame[0], MSG_AWARENESS);
}

#[tokio::test]
async fn awareness_from_readonly_reaches_peers_without_audit_rows() {
    let registry = HubRegistry::new();
    let store = Arc::new(Store::open_memory().unwrap());
    let config = test_config();
    let id = doc_id();
    store
        .upsert_permission("alice", "welcome", "bob", PermissionLevel::Readonly, "alice")
        .unwrap();

    let hub = registry.get_or_create(&id, &store, &config).await.unwrap();
    let mut alice = attach_peer(&hub, &store, &id, "alice").await;
    let mut bob = attach_peer(&hub, &store, &id, "bob").await;
    recv_frame(&mut alice).await;
    recv_frame(&mut bob).await;

    let frame = awareness_frame(&[AwarenessEntry {
        client_id: 42,
        clock: 1,
        state: r#"{"cursor":42,"user":{"name":"bob"}}"#.to_string(),
    }]);
    hub.frame(bob.conn_id, frame.clone());

    let received = recv_frame(&mut alice).await;
    assert_eq!(received, frame);

    // No rejection, no audit entry.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let rows = store.recent_activity("alice", "welcome", 50).unwrap();
    assert!(!rows.iter().any(|r| r.kind == "blocked_document_edit"));
}

#[tokio::test]
async fn live_permission_upgrade_reaches_peers_and_unblocks_edits() {
    let registry = HubRegistry::new();
    let store = Arc::new(Store::open_memory().unwrap());
    let config = test_config();
    let id = doc_id();
    store
        .upsert_permission("alice", "welcome", "bob", PermissionLevel::Readonly, "alice")
        .unwrap();

    let hub = registry.get_or_create(&id, &store, &config).await.unwrap();
    let mut alice = attach_peer(&hub, &store, &id, "alice").await;
    let mut bob = attach_peer(&hub, &store, &id, "bob").await;
    let mut alice_replica = replica_from_sync(&recv_frame(&mut alice).await);
    recv_frame(&mut bob).await;

    let applied = hub
        .ingest_permission_update(PermissionBroadcast {
            target_account: "bob".to_string(),
            new_level: PermissionLevel::Editable,
            granted_by: "alice".to_string(),
            timestamp_ms: 1_700_000_000_000,
            event_kind: BroadcastKind::Granted,
        })
        .await;
    assert!(applied);

    // Every peer receives the change as a single sync update.
    let frame = recv_frame(&mut alice).await;
    assert_eq!(frame[0], MSG_SYNC);
    let SyncPayload::Update(update) = decode_sync_payload(&frame[1..]).unwrap() else {
        panic!("expected an update payload");
    };
    alice_replica.apply_update(&update).unwrap();
    assert_eq!(
        alice_replica.permission_entry("bob").as_deref(),
        Some("editable")
    );
    assert_eq!(alice_replica.broadcast_entries("bob").len(), 1);

    // Drain bob's copy of the update, plus the hub's awareness announce
    // (the observer's short-lived broadcast field), in any order.
    recv_frame(&mut bob).await;

    // Bob can edit now; alice receives the applied update verbatim.
    let edit = unframed_content_update("hi");
    hub.frame(bob.conn_id, edit.clone());
    let mut saw_edit = false;
    for _ in 0..4 {
        let frame = recv_frame(&mut alice).await;
        if frame == edit {
            saw_edit = true;
            break;
        }
        // Awareness announcements may interleave.
        assert_eq!(frame[0], MSG_AWARENESS);
    }
    assert!(saw_edit, "alice never received bob's applied edit");
    assert!(wait_for_activity(&store, &id, "bob", "document_edit").await);
}

#[tokio::test]
async fn hub_reaps_after_flush_and_reloads_persisted_state() {
    let registry = HubRegistry::new();
    let store = Arc::new(Store::open_memory().unwrap());
    let config = test_config();
    let id = doc_id();

    let hub = registry.get_or_create(&id, &store, &config).await.unwrap();
    let mut alice = attach_peer(&hub, &store, &id, "alice").await;
    recv_frame(&mut alice).await;

    hub.frame(alice.conn_id, unframed_content_update("x"));
    tokio::time::sleep(Duration::from_millis(50)).await;
    hub.detach(alice.conn_id);

    // Debounce fires, the state is stored, the hub reaps itself.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(registry.get(&id).is_none(), "hub should have been reaped");

    let row = store.load_document("alice", "welcome").unwrap().unwrap();
    let persisted = Replica::from_bytes(&row.bytes.unwrap()).unwrap();
    assert!(!persisted.text_string().is_empty());

    // A new connection cold-starts from the persisted bytes.
    let hub = registry.get_or_create(&id, &store, &config).await.unwrap();
    let mut alice = attach_peer(&hub, &store, &id, "alice").await;
    let replica = replica_from_sync(&recv_frame(&mut alice).await);
    assert_eq!(replica.text_string(), persisted.text_string());
}

#[tokio::test]
async fn document_deletion_closes_every_connection_with_reason() {
    let registry = HubRegistry::new();
    let store = Arc::new(Store::open_memory().unwrap());
    let config = test_config();
    let id = doc_id();

    let hub = registry.get_or_create(&id, &store, &config).await.unwrap();
    let mut alice = attach_peer(&hub, &store, &id, "alice").await;
    recv_frame(&mut alice).await;

    assert!(hub.close_all(1000, "document deleted", true));
    let (code, reason) = alice.close.await.unwrap();
    assert_eq!(code, 1000);
    assert_eq!(reason, "document deleted");
}

#[tokio::test]
async fn shutdown_flushes_before_closing() {
    let registry = HubRegistry::new();
    let store = Arc::new(Store::open_memory().unwrap());
    let config = test_config();
    let id = doc_id();

    let hub = registry.get_or_create(&id, &store, &config).await.unwrap();
    let mut alice = attach_peer(&hub, &store, &id, "alice").await;
    recv_frame(&mut alice).await;
    hub.frame(alice.conn_id, unframed_content_update("durable"));
    tokio::time::sleep(Duration::from_millis(30)).await;

    registry.shutdown_all().await;

    let (code, reason) = alice.close.await.unwrap();
    assert_eq!(code, 1000);
    assert_eq!(reason, "server shutdown");

    // The edit made it to the store even though the debounce never fired.
    let row = store.load_document("alice", "welcome").unwrap().unwrap();
    let persisted = Replica::from_bytes(&row.bytes.unwrap()).unwrap();
    assert!(!persisted.text_string().is_empty());
}

#[tokio::test]
async fn disconnect_broadcasts_awareness_removal() {
    let registry = HubRegistry::new();
    let store = Arc::new(Store::open_memory().unwrap());
    let config = test_config();
    let id = doc_id();

    let hub = registry.get_or_create(&id, &store, &config).await.unwrap();
    let mut alice = attach_peer(&hub, &store, &id, "alice").await;
    let mut bob = attach_peer(&hub, &store, &id, "alice").await;
    recv_frame(&mut alice).await;
    recv_frame(&mut bob).await;

    hub.frame(
        bob.conn_id,
        awareness_frame(&[AwarenessEntry {
            client_id: 55,
            clock: 3,
            state: r#"{"cursor":1}"#.to_string(),
        }]),
    );
    recv_frame(&mut alice).await;

    hub.detach(bob.conn_id);
    let frame = recv_frame(&mut alice).await;
    assert_eq!(frame[0], MSG_AWARENESS);
    let entries = protocol::decode_awareness_payload(&frame[1..]).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].client_id, 55);
    assert!(entries[0].is_removal());
    assert_eq!(entries[0].clock, 4);
}
