use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// A registered namespace: a tenant boundary owning one physical storage
/// unit, reachable only through the token whose hash is recorded here.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Namespace {
    pub id: String,
    /// Hex SHA-256 of the namespace's bearer token. The raw token is never
    /// stored.
    pub token_hash: String,
    /// Reference to the physical storage: a directory path for the KV
    /// backend, a database file for the SQL backend.
    pub storage_unit: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// Input for namespace creation.
#[derive(Clone, Debug, Default)]
pub struct NewNamespace {
    pub id: String,
    pub token_hash: String,
    pub description: String,
    pub metadata: Option<Value>,
}

/// Aggregate counters for `ns.info`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct NamespaceStats {
    pub message_count: u64,
    pub stream_count: u64,
    pub last_activity: Option<DateTime<Utc>>,
}

/// Namespace ids double as storage directory and file names, so the
/// accepted alphabet is restricted accordingly.
pub(crate) fn validate_namespace_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id.len() <= 64
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !valid {
        return Err(Error::InvalidNamespaceId { id: id.to_string() });
    }

    Ok(())
}
