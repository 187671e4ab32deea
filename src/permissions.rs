//! Permission levels and per-document authorization.
//!
//! The effective permission for `(account, owner, permlink)` is derived in
//! order: document owner → explicit permission row → public flag → none.
//! A `none` result refuses the connection.

use serde::{Deserialize, Serialize};

/// Permission level for an account on one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionLevel {
    Owner,
    Postable,
    Editable,
    Readonly,
    Public,
    None,
}

impl PermissionLevel {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "owner" => Some(Self::Owner),
            "postable" => Some(Self::Postable),
            "editable" => Some(Self::Editable),
            "readonly" => Some(Self::Readonly),
            "public" => Some(Self::Public),
            "none" => Some(Self::None),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Owner => "owner",
            Self::Postable => "postable",
            Self::Editable => "editable",
            Self::Readonly => "readonly",
            Self::Public => "public",
            Self::None => "none",
        }
    }

    pub fn can_read(&self) -> bool {
        !matches!(self, Self::None)
    }

    pub fn can_edit(&self) -> bool {
        matches!(self, Self::Owner | Self::Postable | Self::Editable)
    }

    pub fn can_post_externally(&self) -> bool {
        matches!(self, Self::Owner | Self::Postable)
    }
}

/// Capability view of a level, as handed to the gateway and hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EffectivePermission {
    pub level: PermissionLevel,
    pub can_read: bool,
    pub can_edit: bool,
    pub can_post_externally: bool,
}

impl From<PermissionLevel> for EffectivePermission {
    fn from(level: PermissionLevel) -> Self {
        Self {
            level,
            can_read: level.can_read(),
            can_edit: level.can_edit(),
            can_post_externally: level.can_post_externally(),
        }
    }
}

/// Deterministic display color for an account.
///
/// The hue comes from a hash of the account name; read-only levels get a
/// muted saturation so viewers are visually distinct from editors.
pub fn user_color(account: &str, level: PermissionLevel) -> String {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(account.as_bytes());
    let hue = u16::from_be_bytes([digest[0], digest[1]]) % 360;
    let saturation = if level.can_edit() { 70 } else { 35 };
    format!("hsl({hue}, {saturation}%, 55%)")
}
