use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod broker;
pub mod mesh;

pub use broker::{
    declare_outbound_with_retry, declare_with_retry, Broker, BrokerError, Consumer, MemoryBroker,
};
pub use mesh::{MeshBroker, MeshConfig};

pub const ORDERS_QUEUE_PREFIX: &str = "orders";
pub const STATUS_QUEUE_PREFIX: &str = "status";

/// Longest identity accepted for commanders and soldiers.
pub const MAX_IDENTITY_LEN: usize = 64;

// ===================== Identities & Queue Naming =====================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    #[error("identity must not be empty")]
    Empty,
    #[error("identity '{0}' is longer than {} characters", MAX_IDENTITY_LEN)]
    TooLong(String),
    #[error("identity '{identity}' contains invalid character {found:?} (allowed: a-z, A-Z, 0-9, '-', '.')")]
    InvalidChar { identity: String, found: char },
}

/// Check that a commander or soldier identity can be embedded in a queue name.
///
/// `_` is reserved as the queue-name separator, which keeps
/// `orders_{commander}_{soldier}` unambiguous for every valid pair.
pub fn validate_identity(identity: &str) -> Result<(), IdentityError> {
    if identity.is_empty() {
        return Err(IdentityError::Empty);
    }
    if identity.chars().count() > MAX_IDENTITY_LEN {
        return Err(IdentityError::TooLong(identity.to_string()));
    }
    if let Some(found) = identity
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '.'))
    {
        return Err(IdentityError::InvalidChar {
            identity: identity.to_string(),
            found,
        });
    }
    Ok(())
}

/// Queue carrying mission orders from `commander` to one `soldier`.
pub fn orders_queue(commander: &str, soldier: &str) -> String {
    format!("{ORDERS_QUEUE_PREFIX}_{commander}_{soldier}")
}

/// Queue on which every soldier of `commander` reports mission status.
pub fn status_queue(commander: &str) -> String {
    format!("{STATUS_QUEUE_PREFIX}_{commander}")
}

// ===================== Missions =====================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MissionStatus {
    Queued,
    InProgress,
    Completed,
    Failed,
}

impl MissionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MissionStatus::Queued => "QUEUED",
            MissionStatus::InProgress => "IN_PROGRESS",
            MissionStatus::Completed => "COMPLETED",
            MissionStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, MissionStatus::Completed | MissionStatus::Failed)
    }
}

impl fmt::Display for MissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown mission status '{0}'")]
pub struct UnknownStatus(pub String);

impl FromStr for MissionStatus {
    type Err = UnknownStatus;

    /// Exact match only; lowercase or padded spellings are not coerced.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUED" => Ok(MissionStatus::Queued),
            "IN_PROGRESS" => Ok(MissionStatus::InProgress),
            "COMPLETED" => Ok(MissionStatus::Completed),
            "FAILED" => Ok(MissionStatus::Failed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// A unit of work owned by a commander. Also the order message body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Mission {
    pub mission_id: String,
    #[serde(default)]
    pub payload: String,
    pub status: MissionStatus,
    #[serde(alias = "target_soldier")]
    pub target_worker: String,
    #[serde(default, alias = "assigned_soldier")]
    pub assigned_worker: String,
    #[serde(default, alias = "commander_name")]
    pub commander: String,
}

/// Status report published by a soldier on the commander's status queue.
///
/// `status` stays a raw string on the wire so the receiver decides what
/// counts as a recognised status.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusReport {
    pub mission_id: String,
    pub status: String,
    #[serde(default, alias = "target_soldier")]
    pub target_worker: String,
    #[serde(default)]
    pub token: String,
}

impl fmt::Debug for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusReport")
            .field("mission_id", &self.mission_id)
            .field("status", &self.status)
            .field("target_worker", &self.target_worker)
            .field("token", &if self.token.is_empty() { "<none>" } else { "<redacted>" })
            .finish()
    }
}

// ===================== Codec & Digests =====================

pub fn sha256_hex(bytes: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut h = Sha256::new();
    h.update(bytes);
    let out = h.finalize();
    hex::encode(out)
}

pub fn serialize_message<T: Serialize>(value: &T) -> anyhow::Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

pub fn deserialize_message<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> anyhow::Result<T> {
    Ok(serde_json::from_slice(bytes)?)
}
