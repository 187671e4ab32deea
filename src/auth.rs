//! Authentication against the external signature-based identity provider.
//!
//! The connecting client presents `{account, challenge, pubkey, signature}`.
//! The server resolves the account's published keys from the provider,
//! checks the presented key is among them, validates the challenge window,
//! and verifies the signature over the challenge bytes.
//!
//! Key material is secp256k1: serialized keys carry a short ASCII prefix
//! (default "STM") followed by base58(compressed point + 4-byte checksum);
//! signatures are hex, 65 bytes with a leading recovery byte.

use std::collections::HashMap;
use std::time::Duration;

use k256::ecdsa::signature::hazmat::PrehashVerifier;
use k256::ecdsa::{Signature, VerifyingKey};
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::error::AuthError;

/// Authentication token supplied once per connection, either as the first
/// protocol message or as a `token` query parameter.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthToken {
    #[serde(default)]
    pub account: String,
    /// Integer seconds-since-epoch, as a string or number.
    #[serde(default)]
    pub challenge: serde_json::Value,
    #[serde(default)]
    pub pubkey: String,
    #[serde(default)]
    pub signature: String,
}

impl AuthToken {
    pub fn parse(raw: &str) -> Result<Self, AuthError> {
        let token: AuthToken =
            serde_json::from_str(raw).map_err(|_| AuthError::MissingFields)?;
        if token.account.is_empty()
            || token.pubkey.is_empty()
            || token.signature.is_empty()
            || token.challenge.is_null()
        {
            return Err(AuthError::MissingFields);
        }
        Ok(token)
    }

    /// The challenge as raw bytes (exactly what was signed).
    pub fn challenge_text(&self) -> String {
        match &self.challenge {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// Public keys published for an account, by authority role.
#[derive(Debug, Clone, Default)]
pub struct AccountKeys {
    pub owner: Vec<String>,
    pub active: Vec<String>,
    pub posting: Vec<String>,
    pub memo: Vec<String>,
}

impl AccountKeys {
    /// Union of all roles, checked against the presented key.
    pub fn contains(&self, key: &str) -> bool {
        self.owner
            .iter()
            .chain(&self.active)
            .chain(&self.posting)
            .chain(&self.memo)
            .any(|k| k == key)
    }
}

/// Validity window for authentication challenges.
#[derive(Debug, Clone, Copy)]
pub struct ChallengeWindow {
    pub max_age: Duration,
    pub max_future_skew: Duration,
}

impl Default for ChallengeWindow {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(86_400),
            max_future_skew: Duration::from_secs(300),
        }
    }
}

/// Check a challenge against the window. `now` is seconds since epoch.
pub fn check_challenge(challenge: &str, now: u64, window: ChallengeWindow) -> Result<(), AuthError> {
    let issued: u64 = challenge
        .trim()
        .parse()
        .map_err(|_| AuthError::BadChallengeFormat)?;
    if issued > now + window.max_future_skew.as_secs() {
        return Err(AuthError::ChallengeFromFuture);
    }
    if now.saturating_sub(issued) > window.max_age.as_secs() {
        return Err(AuthError::ChallengeExpired);
    }
    Ok(())
}

/// Verify `signature` is a secp256k1 signature over sha256(`challenge`) by
/// `pubkey`.
pub fn verify_signature(
    challenge: &str,
    signature_hex: &str,
    pubkey: &str,
    key_prefix: &str,
) -> Result<bool, AuthError> {
    let key = decode_public_key(pubkey, key_prefix)?;
    let sig_bytes = hex::decode(signature_hex).map_err(|_| AuthError::BadSignature)?;
    // 65 bytes = recovery byte + r + s; 64 bytes = bare r + s.
    let rs: &[u8] = match sig_bytes.len() {
        65 => &sig_bytes[1..],
        64 => &sig_bytes,
        _ => return Err(AuthError::BadSignature),
    };
    let sig = Signature::from_slice(rs).map_err(|_| AuthError::BadSignature)?;
    let digest = Sha256::digest(challenge.as_bytes());
    Ok(key.verify_prehash(digest.as_slice(), &sig).is_ok())
}

fn decode_public_key(pubkey: &str, key_prefix: &str) -> Result<VerifyingKey, AuthError> {
    let encoded = pubkey.strip_prefix(key_prefix).unwrap_or(pubkey);
    let raw = bs58::decode(encoded)
        .into_vec()
        .map_err(|_| AuthError::UnknownKey)?;
    // compressed point (33) + 4-byte checksum
    if raw.len() < 33 {
        return Err(AuthError::UnknownKey);
    }
    VerifyingKey::from_sec1_bytes(&raw[..33]).map_err(|_| AuthError::UnknownKey)
}

// ── Key directory ──────────────────────────────────────────────────

enum KeySource {
    /// JSON-RPC identity provider (`condenser_api.get_accounts` shape).
    Http { endpoint: String, client: reqwest::Client },
    /// Fixed in-memory directory, for tests and offline runs.
    Fixed(HashMap<String, AccountKeys>),
}

/// Resolves an account name to its published public keys.
pub struct KeyDirectory {
    source: KeySource,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Vec<RpcAccount>,
}

#[derive(Debug, Deserialize)]
struct RpcAccount {
    owner: RpcAuthority,
    active: RpcAuthority,
    posting: RpcAuthority,
    #[serde(default)]
    memo_key: String,
}

#[derive(Debug, Deserialize)]
struct RpcAuthority {
    #[serde(default)]
    key_auths: Vec<(String, serde_json::Value)>,
}

impl RpcAuthority {
    fn keys(&self) -> Vec<String> {
        self.key_auths.iter().map(|(k, _)| k.clone()).collect()
    }
}

impl KeyDirectory {
    /// Directory backed by the identity provider's JSON-RPC endpoint.
    /// Calls carry a 10 second deadline.
    pub fn http(endpoint: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            source: KeySource::Http { endpoint: endpoint.to_string(), client },
        }
    }

    /// Directory answering from a fixed map.
    pub fn fixed(accounts: HashMap<String, AccountKeys>) -> Self {
        Self { source: KeySource::Fixed(accounts) }
    }

    /// Published keys for `account`, or None if the account does not exist.
    pub async fn resolve_keys(&self, account: &str) -> Result<Option<AccountKeys>, AuthError> {
        match &self.source {
            KeySource::Fixed(map) => Ok(map.get(account).cloned()),
            KeySource::Http { endpoint, client } => {
                let body = serde_json::json!({
                    "jsonrpc": "2.0",
                    "method": "condenser_api.get_accounts",
                    "params": [[account]],
                    "id": 1,
                });
                let resp = client
                    .post(endpoint)
                    .json(&body)
                    .send()
                    .await
                    .map_err(|e| AuthError::Upstream(e.to_string()))?;
                let parsed: RpcResponse = resp
                    .json()
                    .await
                    .map_err(|e| AuthError::Upstream(e.to_string()))?;
                Ok(parsed.result.into_iter().next().map(|acct| AccountKeys {
                    owner: acct.owner.keys(),
                    active: acct.active.keys(),
                    posting: acct.posting.keys(),
                    memo: if acct.memo_key.is_empty() {
                        Vec::new()
                    } else {
                        vec![acct.memo_key]
                    },
                }))
            }
        }
    }
}

/// Run the full handshake policy: account exists, key belongs to it,
/// challenge is inside the window, signature verifies.
pub async fn authenticate(
    keys: &KeyDirectory,
    token: &AuthToken,
    now: u64,
    window: ChallengeWindow,
    key_prefix: &str,
) -> Result<(), AuthError> {
    let account_keys = keys
        .resolve_keys(&token.account)
        .await?
        .ok_or(AuthError::UnknownAccount)?;
    if !account_keys.contains(&token.pubkey) {
        return Err(AuthError::UnknownKey);
    }
    let challenge = token.challenge_text();
    check_challenge(&challenge, now, window)?;
    if !verify_signature(&challenge, &token.signature, &token.pubkey, key_prefix)? {
        return Err(AuthError::BadSignature);
    }
    Ok(())
}
