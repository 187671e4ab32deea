//! CRDT replica owned by a document hub.
//!
//! Each document is one Yrs doc with two root objects:
//!
//! ```text
//! "content"      → shared text body
//! "permissions"  → map mirroring the authoritative permission store:
//!     "<account>"                 → level string (owner/editable/…)
//!     "update_<account>_<seq>"    → JSON PermissionBroadcast
//!     "created", "lastUpdated"    → reserved metadata (ISO timestamps)
//! ```
//!
//! Permission changes land as a single transaction so peers observe one
//! update with no partial state. At most 10 broadcast entries per account
//! are retained; duplicates of the same change are pruned in the same
//! transaction that writes the replacement.

use serde::{Deserialize, Serialize};
use yrs::updates::decoder::Decode;
use yrs::{
    Any, Doc, GetString, Map, MapRef, Observable, Out, ReadTxn, StateVector, Subscription, Text,
    TextRef, Transact, Update,
};

use crate::error::ReplicaError;
use crate::permissions::PermissionLevel;

pub const CONTENT_KEY: &str = "content";
pub const PERMISSIONS_KEY: &str = "permissions";
pub const META_CREATED: &str = "created";
pub const META_LAST_UPDATED: &str = "lastUpdated";

/// Broadcast entries retained per account.
const MAX_BROADCASTS_PER_ACCOUNT: usize = 10;

/// One permission-change entry written into the permissions sub-object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionBroadcast {
    pub target_account: String,
    pub new_level: PermissionLevel,
    pub granted_by: String,
    pub timestamp_ms: u64,
    pub event_kind: BroadcastKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BroadcastKind {
    Granted,
    Revoked,
}

impl PermissionBroadcast {
    /// Same logical change, regardless of when it was sent.
    fn same_change(&self, other: &Self) -> bool {
        self.target_account == other.target_account
            && self.new_level == other.new_level
            && self.granted_by == other.granted_by
            && self.event_kind == other.event_kind
    }
}

/// What a dry-applied update touched on a scratch replica.
#[derive(Debug, Clone, Copy, Default)]
pub struct UpdateProbe {
    pub text_changed: bool,
    pub permissions_changed: bool,
    /// Something outside the two named roots changed.
    pub other_changed: bool,
}

/// Dry-apply `bytes` to a throwaway replica and report what changed.
pub fn probe_update(bytes: &[u8]) -> Result<UpdateProbe, ReplicaError> {
    let doc = Doc::new();
    let text = doc.get_or_insert_text(CONTENT_KEY);
    let permissions = doc.get_or_insert_map(PERMISSIONS_KEY);
    let update = Update::decode_v1(bytes).map_err(|e| ReplicaError::Decode(e.to_string()))?;
    let mut txn = doc.transact_mut();
    txn.apply_update(update)
        .map_err(|e| ReplicaError::Apply(e.to_string()))?;
    let text_changed = text.len(&txn) > 0;
    let permissions_changed = permissions.len(&txn) > 0;
    let anything_changed = txn.state_vector() != StateVector::default();
    Ok(UpdateProbe {
        text_changed,
        permissions_changed,
        other_changed: anything_changed && !text_changed && !permissions_changed,
    })
}

/// The live CRDT state for one document. Exactly one replica exists per
/// `(owner, permlink)` across the process; the owning hub serializes all
/// access.
pub struct Replica {
    doc: Doc,
    text: TextRef,
    permissions: MapRef,
}

impl Replica {
    pub fn new() -> Self {
        let doc = Doc::new();
        let text = doc.get_or_insert_text(CONTENT_KEY);
        let permissions = doc.get_or_insert_map(PERMISSIONS_KEY);
        Self { doc, text, permissions }
    }

    /// Rebuild a replica from a persisted encoding.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ReplicaError> {
        let replica = Self::new();
        let update = Update::decode_v1(bytes).map_err(|e| ReplicaError::Decode(e.to_string()))?;
        let mut txn = replica.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| ReplicaError::Apply(e.to_string()))?;
        drop(txn);
        Ok(replica)
    }

    /// Synthesize a replica from raw initial text (legacy rows that never
    /// held a CRDT encoding).
    pub fn from_initial_text(text: &str) -> Self {
        let replica = Self::new();
        let mut txn = replica.doc.transact_mut();
        replica.text.insert(&mut txn, 0, text);
        drop(txn);
        replica
    }

    /// Encode the full state as one update.
    pub fn encode_full(&self) -> Vec<u8> {
        self.doc
            .transact()
            .encode_state_as_update_v1(&StateVector::default())
    }

    /// Encode the diff a peer with `state_vector` is missing.
    pub fn encode_diff(&self, state_vector: &[u8]) -> Result<Vec<u8>, ReplicaError> {
        let sv = StateVector::decode_v1(state_vector)
            .map_err(|e| ReplicaError::Decode(e.to_string()))?;
        Ok(self.doc.transact().encode_diff_v1(&sv))
    }

    /// Current state vector, encoded for [`Self::encode_diff`].
    pub fn state_vector_bytes(&self) -> Vec<u8> {
        use yrs::updates::encoder::Encode;
        self.doc.transact().state_vector().encode_v1()
    }

    /// Apply one binary update. Returns true if the replica state advanced.
    pub fn apply_update(&mut self, bytes: &[u8]) -> Result<bool, ReplicaError> {
        let update = Update::decode_v1(bytes).map_err(|e| ReplicaError::Decode(e.to_string()))?;
        let mut txn = self.doc.transact_mut();
        let before = txn.state_vector();
        txn.apply_update(update)
            .map_err(|e| ReplicaError::Apply(e.to_string()))?;
        let changed = txn.state_vector() != before;
        Ok(changed)
    }

    pub fn text_len(&self) -> u32 {
        self.text.len(&self.doc.transact())
    }

    pub fn text_string(&self) -> String {
        self.text.get_string(&self.doc.transact())
    }

    /// Local edit helper (initial text synthesis and tests).
    pub fn insert_text(&mut self, index: u32, chunk: &str) {
        let mut txn = self.doc.transact_mut();
        self.text.insert(&mut txn, index, chunk);
    }

    // ── Permissions sub-object ─────────────────────────────────────

    /// True if the permissions map has never been populated.
    pub fn permissions_empty(&self) -> bool {
        self.permissions.len(&self.doc.transact()) == 0
    }

    /// Seed the permissions map for a fresh document: the owner's level
    /// plus the creation timestamp.
    pub fn seed_permissions(&mut self, owner: &str) {
        let mut txn = self.doc.transact_mut();
        self.permissions
            .insert(&mut txn, owner, PermissionLevel::Owner.as_str());
        self.permissions
            .insert(&mut txn, META_CREATED, chrono::Utc::now().to_rfc3339());
    }

    /// Level string mirrored for `account`, if present.
    pub fn permission_entry(&self, account: &str) -> Option<String> {
        let txn = self.doc.transact();
        self.permissions
            .get(&txn, account)
            .and_then(|out| out_as_string(&out))
    }

    /// Apply one permission change as a single transaction: mirror the
    /// level, append the broadcast entry, stamp `lastUpdated`, prune
    /// duplicates and anything past the per-account retention cap.
    pub fn ingest_permission_update(
        &mut self,
        broadcast: &PermissionBroadcast,
        seq: u64,
    ) -> Result<(), ReplicaError> {
        let encoded =
            serde_json::to_string(broadcast).map_err(|e| ReplicaError::Apply(e.to_string()))?;
        let mut txn = self.doc.transact_mut();

        self.permissions.insert(
            &mut txn,
            broadcast.target_account.as_str(),
            broadcast.new_level.as_str(),
        );
        let key = format!("update_{}_{seq}", broadcast.target_account);
        self.permissions.insert(&mut txn, key, encoded);
        self.permissions
            .insert(&mut txn, META_LAST_UPDATED, chrono::Utc::now().to_rfc3339());

        // Prune inside the same transaction so peers never see the
        // intermediate shape.
        let prefix = format!("update_{}_", broadcast.target_account);
        let mut entries: Vec<(u64, String, Option<PermissionBroadcast>)> = Vec::new();
        for (entry_key, value) in self.permissions.iter(&txn) {
            if !entry_key.starts_with(prefix.as_str()) {
                continue;
            }
            let Ok(entry_seq) = entry_key[prefix.len()..].parse::<u64>() else {
                continue;
            };
            let parsed = out_as_string(&value).and_then(|s| serde_json::from_str(&s).ok());
            entries.push((entry_seq, entry_key.to_string(), parsed));
        }
        entries.sort_by(|a, b| b.0.cmp(&a.0));

        let mut kept = 0usize;
        let mut remove = Vec::new();
        for (entry_seq, entry_key, parsed) in entries {
            if entry_seq == seq {
                kept += 1;
                continue;
            }
            let duplicate = parsed
                .as_ref()
                .is_some_and(|p| p.same_change(broadcast));
            if duplicate || kept >= MAX_BROADCASTS_PER_ACCOUNT {
                remove.push(entry_key);
            } else {
                kept += 1;
            }
        }
        for entry_key in remove {
            self.permissions.remove(&mut txn, entry_key.as_str());
        }
        Ok(())
    }

    /// Broadcast entries currently retained for `account`, newest first.
    pub fn broadcast_entries(&self, account: &str) -> Vec<PermissionBroadcast> {
        let txn = self.doc.transact();
        let prefix = format!("update_{account}_");
        let mut entries: Vec<(u64, PermissionBroadcast)> = Vec::new();
        for (key, value) in self.permissions.iter(&txn) {
            if !key.starts_with(prefix.as_str()) {
                continue;
            }
            let Ok(seq) = key[prefix.len()..].parse::<u64>() else {
                continue;
            };
            if let Some(parsed) = out_as_string(&value).and_then(|s| serde_json::from_str(&s).ok())
            {
                entries.push((seq, parsed));
            }
        }
        entries.sort_by(|a, b| b.0.cmp(&a.0));
        entries.into_iter().map(|(_, b)| b).collect()
    }

    /// Subscribe to changes of the permissions map. Reserved metadata keys
    /// are filtered out; the changed key names are sent on `tx`. Dropping
    /// the returned subscription cancels the observer.
    pub fn observe_permissions(
        &self,
        tx: tokio::sync::mpsc::UnboundedSender<Vec<String>>,
    ) -> Subscription {
        self.permissions.observe(move |txn, event| {
            let keys: Vec<String> = event
                .keys(txn)
                .iter()
                .filter(|(key, _)| {
                    key.as_ref() != META_CREATED && key.as_ref() != META_LAST_UPDATED
                })
                .map(|(key, _)| key.to_string())
                .collect();
            if !keys.is_empty() {
                let _ = tx.send(keys);
            }
        })
    }
}

impl Default for Replica {
    fn default() -> Self {
        Self::new()
    }
}

/// Extract a plain string from a map value.
fn out_as_string(out: &Out) -> Option<String> {
    match out {
        Out::Any(Any::String(s)) => Some(s.to_string()),
        _ => None,
    }
}
