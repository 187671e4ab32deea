//! Shared helpers for the integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use yrs::updates::decoder::Decode;
use yrs::{Doc, ReadTxn, StateVector, Text, Transact, Update};

use dochub::config::ServerConfig;
use dochub::db::Store;
use dochub::hub::{Connection, DocumentId, HubHandle, SessionContext};
use dochub::permissions::user_color;

static CONN_IDS: AtomicU64 = AtomicU64::new(10_000);

/// A fake client attached straight to a hub, without a socket.
pub struct TestPeer {
    pub conn_id: u64,
    pub frames: mpsc::Receiver<Vec<u8>>,
    pub close: oneshot::Receiver<(u16, String)>,
}

/// Config with test-sized windows: no grace period, fast debounce.
pub fn test_config() -> Arc<ServerConfig> {
    let mut config = ServerConfig::for_tests();
    config.grace_period_secs = 0;
    config.debounce_ms = 40;
    config.max_debounce_ms = 200;
    Arc::new(config)
}

pub async fn attach_peer(
    hub: &HubHandle,
    store: &Arc<Store>,
    id: &DocumentId,
    account: &str,
) -> TestPeer {
    let permission = store
        .resolve_permission(account, &id.owner, &id.permlink)
        .unwrap();
    let ctx = SessionContext {
        account: account.to_string(),
        document: id.clone(),
        permission,
        color: user_color(account, permission.level),
        connected_at: chrono::Utc::now(),
    };
    let conn_id = CONN_IDS.fetch_add(1, Ordering::Relaxed);
    let (frames_tx, frames_rx) = mpsc::channel(64);
    let (close_tx, close_rx) = oneshot::channel();
    hub.attach(Connection { id: conn_id, ctx, frames: frames_tx, close: close_tx })
        .await
        .unwrap();
    TestPeer { conn_id, frames: frames_rx, close: close_rx }
}

pub async fn recv_frame(peer: &mut TestPeer) -> Vec<u8> {
    tokio::time::timeout(Duration::from_secs(2), peer.frames.recv())
        .await
        .expect("timed out waiting for a frame")
        .expect("frame channel closed")
}

pub async fn expect_silence(peer: &mut TestPeer) {
    let got = tokio::time::timeout(Duration::from_millis(200), peer.frames.recv()).await;
    assert!(got.is_err(), "expected no frame, got {:?}", got);
}

/// A merged content update whose leading varint (its client count) is too
/// large to collide with the protocol tag table — the shape of a bare
/// update sent without frame framing.
pub fn unframed_content_update(chunk: &str) -> Vec<u8> {
    let acc = Doc::with_client_id(999);
    acc.get_or_insert_text("content");
    acc.get_or_insert_map("permissions");
    for i in 0..10u64 {
        let doc = Doc::with_client_id(50_000 + i);
        let text = doc.get_or_insert_text("content");
        let mut txn = doc.transact_mut();
        text.insert(&mut txn, 0, chunk);
        drop(txn);
        let update = doc
            .transact()
            .encode_state_as_update_v1(&StateVector::default());
        let mut txn = acc.transact_mut();
        txn.apply_update(Update::decode_v1(&update).unwrap()).unwrap();
    }
    let update = acc
        .transact()
        .encode_state_as_update_v1(&StateVector::default());
    assert!(update[0] > 8, "update leading byte must dodge the tag table");
    update
}

// ── Signed-token helpers for gateway tests ─────────────────────────

use k256::ecdsa::signature::hazmat::PrehashSigner;
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use sha2::{Digest, Sha256};

use dochub::auth::{AccountKeys, KeyDirectory};

/// Serialize a verifying key the way the identity provider does:
/// prefix + base58(compressed point + 4-byte checksum slot).
pub fn encode_public_key(key: &VerifyingKey) -> String {
    let point = key.to_encoded_point(true);
    let mut raw = point.as_bytes().to_vec();
    raw.extend_from_slice(&[0u8; 4]);
    format!("STM{}", bs58::encode(raw).into_string())
}

/// The JSON auth token a client would present, signed over `challenge`.
pub fn signed_token_json(account: &str, challenge: u64, signer: &SigningKey) -> String {
    let challenge_text = challenge.to_string();
    let digest = Sha256::digest(challenge_text.as_bytes());
    let sig: Signature = signer.sign_prehash(digest.as_slice()).unwrap();
    let mut wire = vec![0x20u8];
    wire.extend_from_slice(&sig.to_bytes());
    serde_json::json!({
        "account": account,
        "challenge": challenge_text,
        "pubkey": encode_public_key(&signer.verifying_key()),
        "signature": hex::encode(wire),
    })
    .to_string()
}

/// Key directory resolving every listed account to the same signing key.
pub fn fixed_directory(accounts: &[&str], signer: &SigningKey) -> KeyDirectory {
    let pubkey = encode_public_key(&signer.verifying_key());
    let mut map = HashMap::new();
    for account in accounts {
        map.insert(
            account.to_string(),
            AccountKeys { posting: vec![pubkey.clone()], ..Default::default() },
        );
    }
    KeyDirectory::fixed(map)
}

/// Wait for an activity row of `kind` for `account`, with retries (audit
/// writes land on the blocking pool).
pub async fn wait_for_activity(
    store: &Arc<Store>,
    id: &DocumentId,
    account: &str,
    kind: &str,
) -> bool {
    for _ in 0..50 {
        let rows = store.recent_activity(&id.owner, &id.permlink, 50).unwrap();
        if rows.iter().any(|r| r.account == account && r.kind == kind) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
