//! Per-document collaboration hub.
//!
//! One hub owns one live CRDT replica. All mutations of the replica, the
//! awareness registry, and the connection set are serialized through the
//! hub's message loop; gateway read loops and the broadcast API post into
//! the inbox and never touch hub state directly. Store and socket I/O is
//! dispatched to worker tasks so the loop never blocks on it.
//!
//! Lifecycle: created on the first authenticated attach (via the registry),
//! reaped once the last connection detaches and the debounced persistence
//! has flushed.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::config::ServerConfig;
use crate::crdt::{PermissionBroadcast, Replica};
use crate::db::Store;
use crate::error::{HubError, CLOSE_INTERNAL};
use crate::permissions::{EffectivePermission, PermissionLevel};
use crate::protocol::{self, AwarenessEntry, FrameKind, SyncPayload};
use crate::registry::HubRegistry;

/// Document identity: `(owner, permlink)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocumentId {
    pub owner: String,
    pub permlink: String,
}

impl DocumentId {
    /// Parse an `owner/permlink` path. Both segments required, non-empty.
    pub fn parse(path: &str) -> Option<Self> {
        let mut parts = path.trim_matches('/').splitn(2, '/');
        let owner = parts.next()?.trim();
        let permlink = parts.next()?.trim();
        if owner.is_empty() || permlink.is_empty() || permlink.contains('/') {
            return None;
        }
        Some(Self { owner: owner.to_string(), permlink: permlink.to_string() })
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.permlink)
    }
}

/// Per-connection session state established during the handshake.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub account: String,
    pub document: DocumentId,
    pub permission: EffectivePermission,
    pub color: String,
    pub connected_at: chrono::DateTime<chrono::Utc>,
}

/// Close instruction delivered out-of-band so it can never be stuck
/// behind a full frame queue.
pub type CloseReason = (u16, String);

/// What the gateway hands to the hub at attach time.
pub struct Connection {
    pub id: u64,
    pub ctx: SessionContext,
    pub frames: mpsc::Sender<Vec<u8>>,
    pub close: oneshot::Sender<CloseReason>,
}

/// Timing and limits for one hub, lifted out of [`ServerConfig`] so tests
/// can shrink the windows.
#[derive(Debug, Clone, Copy)]
pub struct HubConfig {
    pub debounce: Duration,
    pub max_debounce: Duration,
    pub grace: Duration,
    pub slow_grace: Duration,
    pub max_probe_bytes: usize,
}

impl From<&ServerConfig> for HubConfig {
    fn from(cfg: &ServerConfig) -> Self {
        Self {
            debounce: Duration::from_millis(cfg.debounce_ms),
            max_debounce: Duration::from_millis(cfg.max_debounce_ms),
            grace: Duration::from_secs(cfg.grace_period_secs),
            slow_grace: Duration::from_secs(cfg.slow_consumer_grace_secs),
            max_probe_bytes: cfg.max_probe_bytes,
        }
    }
}

enum HubMsg {
    Attach { conn: Connection, reply: oneshot::Sender<()> },
    Detach { conn_id: u64 },
    Frame { conn_id: u64, data: Vec<u8> },
    PermissionChange { broadcast: PermissionBroadcast, reply: oneshot::Sender<bool> },
    CloseAll { code: u16, reason: String, discard: bool },
    Shutdown { reply: oneshot::Sender<()> },
    StoreDone { ok: bool, epoch: u64 },
    ClearBroadcastField { at_clock: u64 },
}

/// Cheap cloneable handle posting into a hub's inbox.
#[derive(Clone)]
pub struct HubHandle {
    id: DocumentId,
    tx: mpsc::UnboundedSender<HubMsg>,
}

impl HubHandle {
    pub fn document(&self) -> &DocumentId {
        &self.id
    }

    /// True once the hub's loop has exited; the registry retries creation.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub async fn attach(&self, conn: Connection) -> Result<(), HubError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(HubMsg::Attach { conn, reply })
            .map_err(|_| HubError::Gone)?;
        rx.await.map_err(|_| HubError::Gone)
    }

    pub fn detach(&self, conn_id: u64) {
        let _ = self.tx.send(HubMsg::Detach { conn_id });
    }

    pub fn frame(&self, conn_id: u64, data: Vec<u8>) {
        let _ = self.tx.send(HubMsg::Frame { conn_id, data });
    }

    /// Apply a permission change to the live replica; peers receive it as
    /// a single CRDT update. Returns false if the hub is gone or the
    /// change could not be applied.
    pub async fn ingest_permission_update(&self, broadcast: PermissionBroadcast) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(HubMsg::PermissionChange { broadcast, reply })
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Force-close every connection (document deletion). `discard` skips
    /// the final persistence flush.
    pub fn close_all(&self, code: u16, reason: &str, discard: bool) -> bool {
        self.tx
            .send(HubMsg::CloseAll { code, reason: reason.to_string(), discard })
            .is_ok()
    }

    /// Flush the replica and close remaining connections.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(HubMsg::Shutdown { reply }).is_ok() {
            let _ = rx.await;
        }
    }
}

struct ConnState {
    ctx: SessionContext,
    frames: mpsc::Sender<Vec<u8>>,
    close: Option<oneshot::Sender<CloseReason>>,
    attached_at: Instant,
    /// Frames that must not be dropped, parked while the outbound queue
    /// is at its watermark.
    overflow: VecDeque<Vec<u8>>,
    slow_since: Option<Instant>,
    /// Awareness client ids observed from this connection.
    awareness_ids: HashSet<u64>,
}

struct AwarenessSlot {
    clock: u64,
    state: String,
}

/// The hub actor. Owns the replica; runs until the last connection is gone
/// and the replica is flushed.
pub struct Hub {
    id: DocumentId,
    replica: Replica,
    store: Arc<Store>,
    registry: Arc<HubRegistry>,
    config: HubConfig,
    inbox: mpsc::UnboundedSender<HubMsg>,

    conns: HashMap<u64, ConnState>,
    ever_attached: bool,
    awareness: HashMap<u64, AwarenessSlot>,
    /// Permission snapshot: authoritative resolution at attach, updated
    /// live by ingested permission changes.
    perm_levels: HashMap<String, PermissionLevel>,

    // Debounced persistence
    dirty_since: Option<Instant>,
    last_change: Option<Instant>,
    changes: u64,
    store_in_flight: bool,
    store_failures: u32,
    discard_state: bool,

    // Permission broadcast bookkeeping
    broadcast_seq: u64,
    /// CRDT client id the hub uses for its own awareness field.
    local_client_id: u64,
    local_clock: u64,

    observer: Option<yrs::Subscription>,
}

impl Hub {
    /// Spawn the hub loop for a loaded replica and return its handle.
    pub fn spawn(
        id: DocumentId,
        replica: Replica,
        store: Arc<Store>,
        registry: Arc<HubRegistry>,
        config: HubConfig,
    ) -> HubHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let (obs_tx, obs_rx) = mpsc::unbounded_channel();
        let observer = replica.observe_permissions(obs_tx);
        let hub = Hub {
            id: id.clone(),
            replica,
            store,
            registry,
            config,
            inbox: tx.clone(),
            conns: HashMap::new(),
            ever_attached: false,
            awareness: HashMap::new(),
            perm_levels: HashMap::new(),
            dirty_since: None,
            last_change: None,
            changes: 0,
            store_in_flight: false,
            store_failures: 0,
            discard_state: false,
            broadcast_seq: 0,
            local_client_id: u64::from(rand::random::<u32>()) | (1u64 << 53),
            local_clock: 0,
            observer: Some(observer),
        };
        tokio::spawn(hub.run(rx, obs_rx));
        HubHandle { id, tx }
    }

    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<HubMsg>,
        mut obs_rx: mpsc::UnboundedReceiver<Vec<String>>,
    ) {
        tracing::info!(document = %self.id, "hub started");
        loop {
            let flush_at = self.next_flush_deadline();
            // Connections with parked frames need periodic service even if
            // no new messages arrive.
            let service_at = self.next_service_deadline();
            let wake_at = match (flush_at, service_at) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (deadline, None) => deadline,
                (None, deadline) => deadline,
            };
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(msg) => {
                        let exit = self.handle(msg).await;
                        if exit {
                            break;
                        }
                    }
                    None => break,
                },
                keys = obs_rx.recv() => {
                    if let Some(keys) = keys {
                        self.announce_permission_change(keys);
                    }
                },
                _ = sleep_until_or_forever(wake_at) => {
                    if flush_at.is_some_and(|deadline| Instant::now() >= deadline) {
                        self.begin_flush();
                    }
                },
            }
            self.drain_overflow();
            self.enforce_slow_consumers();
            if self.should_exit() {
                break;
            }
        }
        self.observer.take();
        self.registry.remove(&self.id);
        tracing::info!(document = %self.id, "hub stopped");
    }

    /// Returns true when the hub should exit immediately.
    async fn handle(&mut self, msg: HubMsg) -> bool {
        match msg {
            HubMsg::Attach { conn, reply } => {
                self.attach(conn);
                let _ = reply.send(());
            }
            HubMsg::Detach { conn_id } => self.remove_conn(conn_id, None),
            HubMsg::Frame { conn_id, data } => self.handle_frame(conn_id, data),
            HubMsg::PermissionChange { broadcast, reply } => {
                let ok = self.ingest_permission_change(broadcast);
                let _ = reply.send(ok);
            }
            HubMsg::CloseAll { code, reason, discard } => {
                if discard {
                    self.discard_state = true;
                    self.dirty_since = None;
                    self.last_change = None;
                }
                let ids: Vec<u64> = self.conns.keys().copied().collect();
                for conn_id in ids {
                    self.remove_conn(conn_id, Some((code, reason.clone())));
                }
            }
            HubMsg::Shutdown { reply } => {
                self.flush_blocking().await;
                let ids: Vec<u64> = self.conns.keys().copied().collect();
                for conn_id in ids {
                    self.remove_conn(conn_id, Some((1000, "server shutdown".to_string())));
                }
                let _ = reply.send(());
                return true;
            }
            HubMsg::StoreDone { ok, epoch } => self.finish_flush(ok, epoch),
            HubMsg::ClearBroadcastField { at_clock } => {
                // Only clear if no newer broadcast field was written since.
                if self.local_clock == at_clock {
                    self.local_clock += 1;
                    let frame = protocol::awareness_frame(&[AwarenessEntry {
                        client_id: self.local_client_id,
                        clock: self.local_clock,
                        state: "null".to_string(),
                    }]);
                    self.fan_out(&frame, None);
                }
            }
        }
        false
    }

    // ── Attach / detach ────────────────────────────────────────────

    fn attach(&mut self, conn: Connection) {
        self.ever_attached = true;
        let account = conn.ctx.account.clone();
        self.perm_levels
            .insert(account.clone(), conn.ctx.permission.level);
        if self.replica.permissions_empty() {
            self.replica.seed_permissions(&self.id.owner);
        }

        let state = ConnState {
            ctx: conn.ctx,
            frames: conn.frames,
            close: Some(conn.close),
            attached_at: Instant::now(),
            overflow: VecDeque::new(),
            slow_since: None,
            awareness_ids: HashSet::new(),
        };
        self.conns.insert(conn.id, state);

        // Full state first, then the presence of everyone already here.
        let sync = protocol::sync_step2_frame(&self.replica.encode_full());
        self.send_to(conn.id, sync, false);
        let snapshot = self.awareness_snapshot();
        if !snapshot.is_empty() {
            let frame = protocol::awareness_frame(&snapshot);
            self.send_to(conn.id, frame, true);
        }

        tracing::info!(
            document = %self.id,
            account = %account,
            conn_id = conn.id,
            active = self.conns.len(),
            "attached"
        );
    }

    fn remove_conn(&mut self, conn_id: u64, close: Option<CloseReason>) {
        let Some(mut conn) = self.conns.remove(&conn_id) else {
            return;
        };
        if let (Some(tx), Some(reason)) = (conn.close.take(), close) {
            let _ = tx.send(reason);
        }

        // Clear the departed client's awareness and tell the others.
        let mut removals = Vec::new();
        for client_id in conn.awareness_ids {
            let clock = self
                .awareness
                .remove(&client_id)
                .map(|slot| slot.clock + 1)
                .unwrap_or(1);
            removals.push(AwarenessEntry { client_id, clock, state: "null".to_string() });
        }
        if !removals.is_empty() && !self.conns.is_empty() {
            let frame = protocol::awareness_frame(&removals);
            self.fan_out(&frame, None);
        }

        tracing::info!(
            document = %self.id,
            account = %conn.ctx.account,
            conn_id,
            active = self.conns.len(),
            "detached"
        );
    }

    // ── Frame handling (decision table) ────────────────────────────

    fn handle_frame(&mut self, conn_id: u64, data: Vec<u8>) {
        if !self.conns.contains_key(&conn_id) {
            return;
        }
        let kind = protocol::classify(&data, self.config.max_probe_bytes);
        match kind {
            FrameKind::Sync | FrameKind::SyncReply => self.handle_sync(conn_id, &data),
            FrameKind::SyncStatus => self.fan_out(&data, Some(conn_id)),
            FrameKind::Awareness => self.handle_awareness(conn_id, &data),
            FrameKind::QueryAwareness => {
                let snapshot = self.awareness_snapshot();
                let frame = protocol::awareness_frame(&snapshot);
                self.send_to(conn_id, frame, true);
                self.fan_out(&data, Some(conn_id));
            }
            FrameKind::Auth => self.fan_out(&data, Some(conn_id)),
            FrameKind::ContentUpdate => self.handle_content_update(conn_id, &data),
            FrameKind::Unknown => {
                tracing::debug!(
                    document = %self.id,
                    conn_id,
                    len = data.len(),
                    first = data.first().copied().unwrap_or_default(),
                    "dropping unclassifiable frame"
                );
            }
        }
    }

    fn handle_sync(&mut self, conn_id: u64, frame: &[u8]) {
        let payload = match protocol::decode_sync_payload(&frame[1..]) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::debug!(document = %self.id, conn_id, error = %e, "bad sync frame");
                return;
            }
        };
        match payload {
            // A state vector is addressed to us: answer with the diff.
            SyncPayload::Step1(sv) => match self.replica.encode_diff(&sv) {
                Ok(diff) => {
                    let reply = protocol::sync_step2_frame(&diff);
                    self.send_to(conn_id, reply, false);
                }
                Err(e) => {
                    tracing::debug!(document = %self.id, conn_id, error = %e, "bad state vector");
                }
            },
            SyncPayload::Step2(update) | SyncPayload::Update(update) => {
                match self.replica.apply_update(&update) {
                    Ok(changed) => {
                        if changed {
                            self.mark_dirty();
                        }
                        self.fan_out(frame, Some(conn_id));
                    }
                    Err(e) => {
                        tracing::debug!(
                            document = %self.id,
                            conn_id,
                            error = %e,
                            "sync update failed to apply"
                        );
                    }
                }
            }
        }
    }

    fn handle_awareness(&mut self, conn_id: u64, frame: &[u8]) {
        let entries = match protocol::decode_awareness_payload(&frame[1..]) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::debug!(document = %self.id, conn_id, error = %e, "bad awareness frame");
                return;
            }
        };
        for entry in &entries {
            if let Some(slot) = self.awareness.get(&entry.client_id) {
                if entry.clock < slot.clock {
                    continue;
                }
            }
            if let Some(conn) = self.conns.get_mut(&conn_id) {
                if entry.is_removal() {
                    conn.awareness_ids.remove(&entry.client_id);
                } else {
                    conn.awareness_ids.insert(entry.client_id);
                }
            }
            if entry.is_removal() {
                self.awareness.remove(&entry.client_id);
            } else {
                self.awareness.insert(
                    entry.client_id,
                    AwarenessSlot { clock: entry.clock, state: entry.state.clone() },
                );
            }
        }
        self.fan_out(frame, Some(conn_id));
    }

    fn handle_content_update(&mut self, conn_id: u64, data: &[u8]) {
        let conn = match self.conns.get(&conn_id) {
            Some(conn) => conn,
            None => return,
        };
        let account = conn.ctx.account.clone();
        let level = self.effective_level(&account, conn.ctx.permission.level);
        let in_grace = conn.attached_at.elapsed() < self.config.grace;

        if !level.can_edit() && !in_grace {
            tracing::info!(
                document = %self.id,
                account = %account,
                level = level.as_str(),
                "blocked content update"
            );
            let frame = protocol::error_frame(
                "permission_denied",
                &format!("User {account} has {} access", level.as_str()),
            );
            self.send_to(conn_id, frame, true);
            self.log_activity(
                &account,
                "blocked_document_edit",
                Some(format!("{{\"level\":\"{}\"}}", level.as_str())),
            );
            return;
        }

        match self.replica.apply_update(data) {
            Ok(changed) => {
                self.fan_out(data, Some(conn_id));
                if changed {
                    self.mark_dirty();
                    self.record_edit();
                    self.log_activity(&account, "document_edit", None);
                }
            }
            Err(e) => {
                tracing::debug!(
                    document = %self.id,
                    conn_id,
                    error = %e,
                    "content update failed to apply"
                );
            }
        }
    }

    /// Snapshot level, falling back to what the handshake resolved.
    fn effective_level(&self, account: &str, fallback: PermissionLevel) -> PermissionLevel {
        self.perm_levels.get(account).copied().unwrap_or(fallback)
    }

    // ── Permission broadcast pipeline ──────────────────────────────

    fn ingest_permission_change(&mut self, broadcast: PermissionBroadcast) -> bool {
        self.broadcast_seq += 1;
        let seq = self.broadcast_seq;
        let before = self.replica.state_vector_bytes();
        if let Err(e) = self.replica.ingest_permission_update(&broadcast, seq) {
            tracing::error!(document = %self.id, error = %e, "permission ingest failed");
            return false;
        }
        self.perm_levels
            .insert(broadcast.target_account.clone(), broadcast.new_level);

        // One update carrying the whole transaction, to every peer.
        match self.replica.encode_diff(&before) {
            Ok(diff) => {
                let frame = protocol::sync_update_frame(&diff);
                self.fan_out(&frame, None);
            }
            Err(e) => {
                tracing::error!(document = %self.id, error = %e, "permission diff failed");
            }
        }
        self.mark_dirty();
        tracing::info!(
            document = %self.id,
            account = %broadcast.target_account,
            level = broadcast.new_level.as_str(),
            granted_by = %broadcast.granted_by,
            "permission change applied"
        );
        true
    }

    /// Observer callback: describe the change in the hub's own awareness
    /// state, cleared again five seconds later.
    fn announce_permission_change(&mut self, keys: Vec<String>) {
        self.local_clock += 1;
        let state = serde_json::json!({
            "user": { "name": "__system" },
            "permissionUpdate": {
                "keys": keys,
                "timestampMs": chrono::Utc::now().timestamp_millis(),
            },
        })
        .to_string();
        let frame = protocol::awareness_frame(&[AwarenessEntry {
            client_id: self.local_client_id,
            clock: self.local_clock,
            state,
        }]);
        self.fan_out(&frame, None);

        let inbox = self.inbox.clone();
        let at_clock = self.local_clock;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            let _ = inbox.send(HubMsg::ClearBroadcastField { at_clock });
        });
    }

    // ── Awareness helpers ──────────────────────────────────────────

    fn awareness_snapshot(&self) -> Vec<AwarenessEntry> {
        self.awareness
            .iter()
            .map(|(client_id, slot)| AwarenessEntry {
                client_id: *client_id,
                clock: slot.clock,
                state: slot.state.clone(),
            })
            .collect()
    }

    // ── Outbound fan-out and backpressure ──────────────────────────

    /// Send `frame` to every attached connection except `except`. This is
    /// fan-out to the set attached right now; the originator never gets
    /// its own frame back.
    fn fan_out(&mut self, frame: &[u8], except: Option<u64>) {
        let ids: Vec<u64> = self
            .conns
            .keys()
            .copied()
            .filter(|id| Some(*id) != except)
            .collect();
        for conn_id in ids {
            self.send_to(conn_id, frame.to_vec(), is_droppable(frame));
        }
    }

    /// Queue one frame. Droppable frames (awareness and friends) are shed
    /// when the connection is over its watermark; sync frames park in the
    /// overflow queue instead.
    fn send_to(&mut self, conn_id: u64, frame: Vec<u8>, droppable: bool) {
        let Some(conn) = self.conns.get_mut(&conn_id) else {
            return;
        };
        if !conn.overflow.is_empty() && !droppable {
            conn.overflow.push_back(frame);
            return;
        }
        match conn.frames.try_send(frame) {
            Ok(()) => {
                if conn.overflow.is_empty() {
                    conn.slow_since = None;
                }
            }
            Err(mpsc::error::TrySendError::Full(frame)) => {
                conn.slow_since.get_or_insert_with(Instant::now);
                if !droppable {
                    conn.overflow.push_back(frame);
                } else {
                    tracing::debug!(document = %self.id, conn_id, "shedding awareness frame");
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                // Writer is gone; the gateway will detach shortly.
            }
        }
    }

    fn drain_overflow(&mut self) {
        for conn in self.conns.values_mut() {
            while let Some(frame) = conn.overflow.pop_front() {
                match conn.frames.try_send(frame) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(frame)) => {
                        conn.overflow.push_front(frame);
                        break;
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        conn.overflow.clear();
                        break;
                    }
                }
            }
            if conn.overflow.is_empty() && conn.slow_since.is_some() {
                conn.slow_since = None;
            }
        }
    }

    fn enforce_slow_consumers(&mut self) {
        let slow: Vec<u64> = self
            .conns
            .iter()
            .filter(|(_, conn)| {
                conn.slow_since
                    .is_some_and(|since| since.elapsed() > self.config.slow_grace)
            })
            .map(|(id, _)| *id)
            .collect();
        for conn_id in slow {
            tracing::warn!(document = %self.id, conn_id, "closing slow consumer");
            self.remove_conn(conn_id, Some((CLOSE_INTERNAL, "slow consumer".to_string())));
        }
    }

    // ── Debounced persistence ──────────────────────────────────────

    fn mark_dirty(&mut self) {
        self.changes += 1;
        let now = Instant::now();
        self.last_change = Some(now);
        self.dirty_since.get_or_insert(now);
    }

    fn next_service_deadline(&self) -> Option<Instant> {
        let needs_service = self
            .conns
            .values()
            .any(|conn| !conn.overflow.is_empty() || conn.slow_since.is_some());
        needs_service.then(|| Instant::now() + Duration::from_millis(250))
    }

    fn next_flush_deadline(&self) -> Option<Instant> {
        if self.store_in_flight || self.discard_state {
            return None;
        }
        let dirty_since = self.dirty_since?;
        let last_change = self.last_change?;
        // Repeated failures widen the ceiling so a struggling store is not
        // hammered on every tick.
        let ceiling = if self.store_failures >= 3 {
            self.config.max_debounce * 2
        } else {
            self.config.max_debounce
        };
        Some((last_change + self.config.debounce).min(dirty_since + ceiling))
    }

    fn begin_flush(&mut self) {
        if self.store_in_flight || self.dirty_since.is_none() || self.discard_state {
            return;
        }
        self.store_in_flight = true;
        let epoch = self.changes;
        let bytes = self.replica.encode_full();
        let store = self.store.clone();
        let id = self.id.clone();
        let inbox = self.inbox.clone();
        tokio::spawn(async move {
            let result = tokio::task::spawn_blocking(move || {
                store.store_document(&id.owner, &id.permlink, &bytes)
            })
            .await;
            let ok = matches!(result, Ok(Ok(())));
            let _ = inbox.send(HubMsg::StoreDone { ok, epoch });
        });
    }

    fn finish_flush(&mut self, ok: bool, epoch: u64) {
        self.store_in_flight = false;
        if ok {
            self.store_failures = 0;
            if self.changes == epoch {
                self.dirty_since = None;
                self.last_change = None;
            }
            // Anything newer stays dirty and re-arms via the deadline.
        } else {
            self.store_failures += 1;
            self.last_change = Some(Instant::now());
            tracing::error!(
                document = %self.id,
                failures = self.store_failures,
                "persistence failed; will retry"
            );
            if self.store_failures == 3 {
                let frame = protocol::warning_frame(
                    "persistence_degraded",
                    "document changes are not being persisted; retrying",
                );
                self.fan_out(&frame, None);
            }
        }
    }

    /// Blocking flush used on shutdown, where nothing else runs anyway.
    async fn flush_blocking(&mut self) {
        if self.dirty_since.is_none() || self.discard_state {
            return;
        }
        let bytes = self.replica.encode_full();
        let store = self.store.clone();
        let id = self.id.clone();
        let result = tokio::task::spawn_blocking(move || {
            store.store_document(&id.owner, &id.permlink, &bytes)
        })
        .await;
        match result {
            Ok(Ok(())) => {
                self.dirty_since = None;
                self.last_change = None;
            }
            _ => tracing::error!(document = %self.id, "final flush failed"),
        }
    }

    fn should_exit(&self) -> bool {
        self.ever_attached
            && self.conns.is_empty()
            && self.dirty_since.is_none()
            && !self.store_in_flight
    }

    // ── Activity log ───────────────────────────────────────────────

    fn log_activity(&self, account: &str, kind: &'static str, payload: Option<String>) {
        let store = self.store.clone();
        let id = self.id.clone();
        let account = account.to_string();
        tokio::task::spawn_blocking(move || {
            if let Err(e) =
                store.log_activity(&id.owner, &id.permlink, &account, kind, payload.as_deref())
            {
                tracing::error!(document = %id, error = %e, "activity log write failed");
            }
        });
    }

    fn record_edit(&self) {
        let store = self.store.clone();
        let id = self.id.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = store.record_edit(&id.owner, &id.permlink) {
                tracing::error!(document = %id, error = %e, "edit counter write failed");
            }
        });
    }
}

/// Awareness-class frames may be shed under backpressure; sync frames
/// never are.
fn is_droppable(frame: &[u8]) -> bool {
    !matches!(
        frame.first().copied(),
        Some(protocol::MSG_SYNC) | Some(protocol::MSG_SYNC_REPLY)
    )
}

async fn sleep_until_or_forever(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
