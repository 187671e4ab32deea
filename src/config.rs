//! Server configuration, parsed from CLI flags and environment variables.

use clap::Parser;

/// Configuration for the collaboration server.
#[derive(Parser, Debug, Clone)]
#[command(name = "dochub", about = "Realtime collaborative-document server")]
pub struct ServerConfig {
    /// Address for the client-facing WebSocket listener.
    #[arg(long, env = "DOCHUB_LISTEN", default_value = "0.0.0.0:1234")]
    pub listen_addr: String,

    /// Address for the internal broadcast API. Keep this on loopback or a
    /// private interface; it is protected only by the shared secret.
    #[arg(long, env = "DOCHUB_INTERNAL_LISTEN", default_value = "127.0.0.1:1235")]
    pub internal_listen_addr: String,

    /// Path to the SQLite database. ":memory:" for an ephemeral store.
    #[arg(long, env = "DOCHUB_DB", default_value = "dochub.db")]
    pub db_path: String,

    /// Shared secret for the internal broadcast API (x-internal-auth header).
    /// If unset, the broadcast API rejects all requests.
    #[arg(long, env = "DOCHUB_INTERNAL_SECRET")]
    pub internal_secret: Option<String>,

    /// JSON-RPC endpoint of the identity provider used to resolve account keys.
    #[arg(long, env = "DOCHUB_KEY_ENDPOINT", default_value = "https://api.hive.blog")]
    pub key_endpoint: String,

    /// Prefix carried by the provider's serialized public keys.
    #[arg(long, env = "DOCHUB_KEY_PREFIX", default_value = "STM")]
    pub key_prefix: String,

    /// Allowed CORS origins, comma-separated. Empty allows any origin.
    #[arg(long, env = "DOCHUB_ALLOWED_ORIGINS", value_delimiter = ',')]
    pub allowed_origins: Vec<String>,

    /// Maximum age of an authentication challenge, in seconds.
    #[arg(long, env = "DOCHUB_CHALLENGE_MAX_AGE", default_value_t = 86_400)]
    pub challenge_max_age_secs: u64,

    /// Clock-skew tolerance for challenges dated in the future, in seconds.
    #[arg(long, env = "DOCHUB_CHALLENGE_MAX_SKEW", default_value_t = 300)]
    pub challenge_max_skew_secs: u64,

    /// Deadline for the authentication handshake after upgrade, in seconds.
    #[arg(long, default_value_t = 10)]
    pub handshake_timeout_secs: u64,

    /// Deadline for loading a document during hub cold-start, in seconds.
    #[arg(long, default_value_t = 30)]
    pub load_timeout_secs: u64,

    /// Idle interval before a ping probe, and again before a forced close.
    #[arg(long, default_value_t = 30)]
    pub idle_timeout_secs: u64,

    /// Debounce for persisting applied content updates, in milliseconds.
    #[arg(long, default_value_t = 2_000)]
    pub debounce_ms: u64,

    /// Ceiling on persistence debounce from the first unsaved change.
    #[arg(long, default_value_t = 10_000)]
    pub max_debounce_ms: u64,

    /// Window after attach during which edit-permission checks are suspended.
    #[arg(long, default_value_t = 10)]
    pub grace_period_secs: u64,

    /// Largest frame the classifier will dry-apply to a scratch replica.
    /// Frames over this limit are dropped as unknown.
    #[arg(long, default_value_t = 1_048_576)]
    pub max_probe_bytes: usize,

    /// Outbound frames queued per connection before it counts as slow.
    #[arg(long, default_value_t = 256)]
    pub outbound_queue_frames: usize,

    /// How long a connection may stay over the outbound watermark before
    /// it is closed as a slow consumer.
    #[arg(long, default_value_t = 10)]
    pub slow_consumer_grace_secs: u64,
}

impl ServerConfig {
    /// Defaults suitable for tests: in-memory store, ephemeral ports,
    /// no external identity provider.
    pub fn for_tests() -> Self {
        Self::parse_from([
            "dochub",
            "--listen-addr",
            "127.0.0.1:0",
            "--internal-listen-addr",
            "127.0.0.1:0",
            "--db-path",
            ":memory:",
        ])
    }
}
