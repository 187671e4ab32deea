//! Process-wide registry of live document hubs.
//!
//! One hub per `(owner, permlink)` across the process. Creation is
//! mutually exclusive per id: concurrent callers for the same document
//! observe exactly one construction (and one store load). Hubs remove
//! themselves after their loop exits; a handle found closed is treated
//! as absent and a retry re-creates the hub.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::OnceCell;

use crate::config::ServerConfig;
use crate::crdt::Replica;
use crate::db::Store;
use crate::error::{HubError, StoreError};
use crate::hub::{DocumentId, Hub, HubConfig, HubHandle};

#[derive(Default)]
pub struct HubRegistry {
    hubs: Mutex<HashMap<DocumentId, Arc<OnceCell<HubHandle>>>>,
}

impl HubRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Live hub for `id`, if one exists.
    pub fn get(&self, id: &DocumentId) -> Option<HubHandle> {
        self.hubs
            .lock()
            .get(id)
            .and_then(|cell| cell.get())
            .filter(|handle| !handle.is_closed())
            .cloned()
    }

    /// Number of live hubs.
    pub fn len(&self) -> usize {
        self.hubs
            .lock()
            .values()
            .filter(|cell| cell.get().is_some_and(|h| !h.is_closed()))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get the hub for `id`, cold-starting it from the store if needed.
    pub async fn get_or_create(
        self: &Arc<Self>,
        id: &DocumentId,
        store: &Arc<Store>,
        config: &Arc<ServerConfig>,
    ) -> Result<HubHandle, HubError> {
        loop {
            let cell = self
                .hubs
                .lock()
                .entry(id.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone();

            let created = cell
                .get_or_try_init(|| async {
                    let replica = load_replica(id, store, config).await?;
                    Ok::<_, HubError>(Hub::spawn(
                        id.clone(),
                        replica,
                        store.clone(),
                        self.clone(),
                        HubConfig::from(config.as_ref()),
                    ))
                })
                .await;

            match created {
                Ok(handle) if !handle.is_closed() => return Ok(handle.clone()),
                Ok(_) => {
                    // The hub died between creation and this lookup.
                    self.remove_cell(id, &cell);
                }
                Err(e) => {
                    self.remove_cell(id, &cell);
                    return Err(e);
                }
            }
        }
    }

    /// Called by a hub after its loop exits.
    pub fn remove(&self, id: &DocumentId) {
        self.hubs.lock().remove(id);
    }

    fn remove_cell(&self, id: &DocumentId, cell: &Arc<OnceCell<HubHandle>>) {
        let mut map = self.hubs.lock();
        if let Some(current) = map.get(id) {
            if Arc::ptr_eq(current, cell) {
                map.remove(id);
            }
        }
    }

    /// Flush and stop every live hub (process shutdown).
    pub async fn shutdown_all(&self) {
        let handles: Vec<HubHandle> = {
            self.hubs
                .lock()
                .values()
                .filter_map(|cell| cell.get().cloned())
                .collect()
        };
        for handle in handles {
            handle.shutdown().await;
        }
    }
}

/// Load (or initialize) the replica for a document, within the configured
/// deadline. Stored bytes that fail to decode as CRDT state are treated
/// as raw initial text; the synthesized encoding is written back
/// transparently.
async fn load_replica(
    id: &DocumentId,
    store: &Arc<Store>,
    config: &Arc<ServerConfig>,
) -> Result<Replica, HubError> {
    let row = {
        let store = store.clone();
        let id = id.clone();
        let load = tokio::task::spawn_blocking(move || store.load_document(&id.owner, &id.permlink));
        tokio::time::timeout(Duration::from_secs(config.load_timeout_secs), load)
            .await
            .map_err(|_| HubError::Store(StoreError::Task("document load timed out".into())))?
            .map_err(|e| HubError::Store(StoreError::Task(e.to_string())))?
            .map_err(StoreError::Db)?
    };

    let mut imported = false;
    let mut replica = match row.and_then(|r| r.bytes) {
        None => Replica::new(),
        Some(bytes) => match Replica::from_bytes(&bytes) {
            Ok(replica) => replica,
            Err(e) => {
                tracing::warn!(
                    document = %id,
                    error = %e,
                    "stored bytes are not CRDT state; importing as plain text"
                );
                imported = true;
                Replica::from_initial_text(&String::from_utf8_lossy(&bytes))
            }
        },
    };
    if replica.permissions_empty() {
        replica.seed_permissions(&id.owner);
    }
    if imported {
        // Persist the synthesized encoding so the next load decodes clean.
        let synthesized = replica.encode_full();
        let store = store.clone();
        let id2 = id.clone();
        let write_back = tokio::task::spawn_blocking(move || {
            store.store_document(&id2.owner, &id2.permlink, &synthesized)
        })
        .await;
        if !matches!(write_back, Ok(Ok(()))) {
            tracing::error!(document = %id, "failed to write back synthesized state");
        }
    }
    Ok(replica)
}
