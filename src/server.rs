//! Server assembly: shared state, listeners, lifecycle.

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::atomic::AtomicI64;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::auth::KeyDirectory;
use crate::broadcast;
use crate::config::ServerConfig;
use crate::db::Store;
use crate::hub::DocumentId;
use crate::registry::HubRegistry;
use crate::web;

/// Process-wide state shared by the gateway, the broadcast API, and the
/// hub registry.
pub struct SharedState {
    pub config: Arc<ServerConfig>,
    pub store: Arc<Store>,
    pub keys: Arc<KeyDirectory>,
    pub registry: Arc<HubRegistry>,
    pub active_connections: AtomicI64,
    pub started_at: Instant,
}

impl SharedState {
    pub fn new(config: ServerConfig, store: Store, keys: KeyDirectory) -> Arc<Self> {
        Arc::new(Self {
            config: Arc::new(config),
            store: Arc::new(store),
            keys: Arc::new(keys),
            registry: HubRegistry::new(),
            active_connections: AtomicI64::new(0),
            started_at: Instant::now(),
        })
    }

    /// Append an audit entry off the async path. Failures are logged, not
    /// propagated; auditing must not break live sessions.
    pub fn log_activity(&self, document: &DocumentId, account: &str, kind: &'static str) {
        let store = self.store.clone();
        let document = document.clone();
        let account = account.to_string();
        tokio::task::spawn_blocking(move || {
            if let Err(e) =
                store.log_activity(&document.owner, &document.permlink, &account, kind, None)
            {
                tracing::error!(document = %document, error = %e, "activity log write failed");
            }
        });
    }
}

/// The collaboration server: one client-facing WebSocket listener plus
/// the internal broadcast API.
pub struct Server {
    config: ServerConfig,
    keys: Option<KeyDirectory>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self { config, keys: None }
    }

    /// Replace the identity-provider client (tests use a fixed directory).
    pub fn with_key_directory(mut self, keys: KeyDirectory) -> Self {
        self.keys = Some(keys);
        self
    }

    fn build_state(mut self) -> Result<Arc<SharedState>> {
        let store = if self.config.db_path == ":memory:" {
            Store::open_memory()
        } else {
            Store::open(&self.config.db_path)
        }
        .with_context(|| format!("opening database at {}", self.config.db_path))?;
        let keys = self
            .keys
            .take()
            .unwrap_or_else(|| KeyDirectory::http(&self.config.key_endpoint));
        Ok(SharedState::new(self.config, store, keys))
    }

    /// Run until interrupted. On SIGINT every hub flushes and closes its
    /// connections before the process exits.
    pub async fn run(self) -> Result<()> {
        let state = self.build_state()?;
        let main_listener = TcpListener::bind(&state.config.listen_addr)
            .await
            .with_context(|| format!("binding {}", state.config.listen_addr))?;
        let internal_listener = TcpListener::bind(&state.config.internal_listen_addr)
            .await
            .with_context(|| format!("binding {}", state.config.internal_listen_addr))?;

        let main_srv = axum::serve(main_listener, web::router(state.clone())).into_future();
        let internal_srv =
            axum::serve(internal_listener, broadcast::router(state.clone())).into_future();

        tokio::select! {
            result = main_srv => result.context("client listener failed")?,
            result = internal_srv => result.context("internal listener failed")?,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown signal received; flushing hubs");
                state.registry.shutdown_all().await;
            }
        }
        Ok(())
    }

    /// Bind ephemeral listeners and serve in the background. Returns the
    /// bound addresses, the shared state, and the serve task.
    pub async fn start(
        self,
    ) -> Result<(SocketAddr, SocketAddr, Arc<SharedState>, JoinHandle<Result<()>>)> {
        let state = self.build_state()?;
        let main_listener = TcpListener::bind(&state.config.listen_addr).await?;
        let internal_listener = TcpListener::bind(&state.config.internal_listen_addr).await?;
        let main_addr = main_listener.local_addr()?;
        let internal_addr = internal_listener.local_addr()?;

        let main_srv = axum::serve(main_listener, web::router(state.clone())).into_future();
        let internal_srv =
            axum::serve(internal_listener, broadcast::router(state.clone())).into_future();
        let handle = tokio::spawn(async move {
            tokio::select! {
                result = main_srv => result.context("client listener failed"),
                result = internal_srv => result.context("internal listener failed"),
            }
        });
        Ok((main_addr, internal_addr, state, handle))
    }
}
