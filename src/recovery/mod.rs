// Recovery log and checkpoint-driven replay.
//
// Replication failures are recorded durably in the shards themselves
// (`recovery_log`, stored on the originator plus one cross-backup shard) and
// replayed later by a process-exclusive drain cycle that advances per-shard
// watermarks in `recovery_checkpoints`.

pub mod checkpoint;
pub mod log;
pub mod replay;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Row, ShardId, Value};

pub use checkpoint::CheckpointStore;
pub use log::RecoveryLogStore;
pub use replay::{DrainReport, GlobalRecoveryStatus, ReplayEngine};

/// Life-cycle state of a recovery log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryStatus {
    Pending,
    Completed,
    Failed,
}

impl RecoveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryStatus::Pending => "PENDING",
            RecoveryStatus::Completed => "COMPLETED",
            RecoveryStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(RecoveryStatus::Pending),
            "COMPLETED" => Some(RecoveryStatus::Completed),
            "FAILED" => Some(RecoveryStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for RecoveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One durable record of a replication that did not succeed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryEntry {
    pub log_id: i64,
    pub target: ShardId,
    pub source: ShardId,
    pub sql: String,
    pub hash: String,
    pub timestamp: DateTime<Utc>,
    pub status: RecoveryStatus,
    pub retry_count: u32,
    pub error: Option<String>,
    /// The shard whose `recovery_log` holds this row (primary or backup copy).
    pub found_in: ShardId,
}

impl RecoveryEntry {
    /// Decodes a `recovery_log` result row fetched from `found_in`.
    pub fn from_row(row: &Row, found_in: ShardId) -> Option<Self> {
        Some(Self {
            log_id: row.get("log_id")?.as_int()?,
            target: row.get("target_node")?.as_int()? as ShardId,
            source: row.get("source_node")?.as_int()? as ShardId,
            sql: row.get("sql_statement")?.as_text()?.to_string(),
            hash: row.get("transaction_hash")?.as_text()?.to_string(),
            timestamp: row
                .get("timestamp")
                .and_then(Value::as_timestamp)
                .unwrap_or_else(Utc::now),
            status: RecoveryStatus::parse(row.get("status")?.as_text()?)?,
            retry_count: row.get("retry_count")?.as_int()?.max(0) as u32,
            error: row
                .get("error_message")
                .and_then(Value::as_text)
                .map(str::to_string),
            found_in,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::row;

    #[test]
    fn test_status_roundtrip() {
        for status in [
            RecoveryStatus::Pending,
            RecoveryStatus::Completed,
            RecoveryStatus::Failed,
        ] {
            assert_eq!(RecoveryStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(RecoveryStatus::parse("WEIRD"), None);
    }

    #[test]
    fn test_entry_from_row() {
        let r = row(vec![
            ("log_id", Value::Int(5)),
            ("target_node", Value::Int(3)),
            ("source_node", Value::Int(1)),
            ("sql_statement", Value::from("UPDATE trans SET a = 1 WHERE trans_id = 7")),
            ("transaction_hash", Value::from("deadbeef")),
            ("timestamp", Value::Timestamp(Utc::now())),
            ("status", Value::from("PENDING")),
            ("retry_count", Value::Int(1)),
            ("error_message", Value::Null),
        ]);
        let entry = RecoveryEntry::from_row(&r, 1).unwrap();
        assert_eq!(entry.log_id, 5);
        assert_eq!(entry.target, 3);
        assert_eq!(entry.status, RecoveryStatus::Pending);
        assert_eq!(entry.retry_count, 1);
        assert_eq!(entry.error, None);
        assert_eq!(entry.found_in, 1);
    }
}
