//! Error taxonomy.
//!
//! Authentication failures close the socket with code 1008 and the failure
//! kind as reason; permission rejections are per-frame and never disconnect;
//! store failures are retried on the next debounce tick.

use thiserror::Error;

/// WebSocket close codes used by the server.
pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_POLICY: u16 = 1008;
pub const CLOSE_INTERNAL: u16 = 1011;

/// Authentication handshake failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("MissingFields")]
    MissingFields,
    #[error("BadChallengeFormat")]
    BadChallengeFormat,
    #[error("ChallengeExpired")]
    ChallengeExpired,
    #[error("ChallengeFromFuture")]
    ChallengeFromFuture,
    #[error("UnknownAccount")]
    UnknownAccount,
    #[error("UnknownKey")]
    UnknownKey,
    #[error("BadSignature")]
    BadSignature,
    #[error("AccessDenied")]
    AccessDenied,
    /// Identity provider or store I/O failure during the handshake.
    #[error("Upstream: {0}")]
    Upstream(String),
}

impl AuthError {
    /// Short kind string carried in the close frame reason, so clients can
    /// discriminate an expired challenge from server trouble.
    pub fn kind(&self) -> &'static str {
        match self {
            AuthError::MissingFields => "MissingFields",
            AuthError::BadChallengeFormat => "BadChallengeFormat",
            AuthError::ChallengeExpired => "ChallengeExpired",
            AuthError::ChallengeFromFuture => "ChallengeFromFuture",
            AuthError::UnknownAccount => "UnknownAccount",
            AuthError::UnknownKey => "UnknownKey",
            AuthError::BadSignature => "BadSignature",
            AuthError::AccessDenied => "AccessDenied",
            AuthError::Upstream(_) => "Upstream",
        }
    }
}

/// Malformed frame or wire-level protocol violation. Frames are dropped;
/// five within ten seconds close the connection with 1011.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("truncated frame")]
    Truncated,
    #[error("malformed varint")]
    BadVarint,
    #[error("payload is not valid utf-8")]
    BadString,
    #[error("unknown sync submessage {0}")]
    BadSyncType(u64),
}

/// Document or permission store failure.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
    #[error("store task failed: {0}")]
    Task(String),
}

/// CRDT replica failure.
#[derive(Debug, Error)]
pub enum ReplicaError {
    #[error("undecodable update: {0}")]
    Decode(String),
    #[error("update failed to apply: {0}")]
    Apply(String),
}

/// Failure inside a document hub.
#[derive(Debug, Error)]
pub enum HubError {
    /// The hub has shut down; the caller should retry against the registry.
    #[error("hub is gone")]
    Gone,
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Unrecoverable invariant violation; the hub closes every connection
    /// with 1011 and removes itself from the registry.
    #[error("fatal hub error: {0}")]
    Fatal(String),
}
