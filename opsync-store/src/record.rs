//! Operation records - the unit of durable, not-yet-confirmed work

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of mutation an operation performs.
///
/// A semantic tag interpreted by the caller-supplied executor, never by the
/// engine itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
    Sync,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Create => "create",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
            OperationKind::Sync => "sync",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(OperationKind::Create),
            "update" => Some(OperationKind::Update),
            "delete" => Some(OperationKind::Delete),
            "sync" => Some(OperationKind::Sync),
            _ => None,
        }
    }
}

/// Replay priority. Higher priorities replay first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationPriority {
    Low = 0,
    Medium = 1,
    High = 2,
}

impl OperationPriority {
    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(OperationPriority::Low),
            1 => Some(OperationPriority::Medium),
            2 => Some(OperationPriority::High),
            _ => None,
        }
    }
}

/// A queued mutation awaiting confirmation by the remote side.
///
/// A record is either present in the store (pending) or absent
/// (resolved/abandoned) - there is no partial state. `retry_count` only ever
/// grows over the record's lifetime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub id: String,
    pub kind: OperationKind,
    /// Opaque blob owned by the caller's domain.
    pub payload: serde_json::Value,
    pub priority: OperationPriority,
    pub created_at: DateTime<Utc>,
    pub retry_count: u32,
}

impl OperationRecord {
    /// Create a new record with a generated id and a zeroed retry counter.
    pub fn new(
        kind: OperationKind,
        payload: serde_json::Value,
        priority: OperationPriority,
    ) -> Self {
        Self {
            id: generate_operation_id(),
            kind,
            payload,
            priority,
            created_at: Utc::now(),
            retry_count: 0,
        }
    }

    /// Human-readable descriptor, used for status reporting.
    pub fn label(&self) -> String {
        format!("{} {}", self.kind.as_str(), self.id)
    }
}

/// Helper function to generate operation ids
pub fn generate_operation_id() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let random: u32 = rand::random();
    format!("op_{}_{:08x}", timestamp, random)
}
