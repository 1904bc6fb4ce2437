// Bounded in-memory journal of coordinator operations.
//
// Observability only: the pipeline and reader append one record per
// operation so an embedder can show what the coordinator has been doing.
// The buffer is capped; old records fall off the front.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::types::{IsolationLevel, ShardId};

const DEFAULT_CAPACITY: usize = 512;
/// SQL is stored truncated; full statements live in the recovery log when
/// they matter.
const SQL_PREFIX_LEN: usize = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    Write,
    Read,
    Drain,
    Rollback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpStatus {
    Success,
    Failure,
}

/// One journal record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpRecord {
    pub kind: OpKind,
    pub shard: Option<ShardId>,
    pub sql_prefix: String,
    pub isolation: Option<IsolationLevel>,
    pub status: OpStatus,
    pub duration_ms: u64,
    pub at: DateTime<Utc>,
}

/// Bounded operation journal.
pub struct OpLog {
    records: Mutex<VecDeque<OpRecord>>,
    capacity: usize,
}

impl OpLog {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_CAPACITY))),
            capacity: capacity.max(1),
        }
    }

    pub fn record(
        &self,
        kind: OpKind,
        shard: Option<ShardId>,
        sql: &str,
        isolation: Option<IsolationLevel>,
        status: OpStatus,
        duration: Duration,
    ) {
        let mut records = self.records.lock();
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(OpRecord {
            kind,
            shard,
            sql_prefix: sql.chars().take(SQL_PREFIX_LEN).collect(),
            isolation,
            status,
            duration_ms: duration.as_millis() as u64,
            at: Utc::now(),
        });
    }

    /// Most recent records first, at most `limit`.
    pub fn recent(&self, limit: usize) -> Vec<OpRecord> {
        self.records
            .lock()
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl Default for OpLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_recent() {
        let log = OpLog::new();
        log.record(
            OpKind::Write,
            Some(1),
            "INSERT INTO trans (trans_id) VALUES (1)",
            Some(IsolationLevel::RepeatableRead),
            OpStatus::Success,
            Duration::from_millis(12),
        );
        log.record(
            OpKind::Read,
            Some(2),
            "SELECT * FROM trans",
            None,
            OpStatus::Success,
            Duration::from_millis(3),
        );

        let recent = log.recent(10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].kind, OpKind::Read);
        assert_eq!(recent[1].kind, OpKind::Write);
    }

    #[test]
    fn test_capacity_bound() {
        let log = OpLog::with_capacity(3);
        for i in 0..10 {
            log.record(
                OpKind::Drain,
                None,
                &format!("op {}", i),
                None,
                OpStatus::Success,
                Duration::ZERO,
            );
        }
        assert_eq!(log.len(), 3);
        let recent = log.recent(10);
        assert_eq!(recent[0].sql_prefix, "op 9");
        assert_eq!(recent[2].sql_prefix, "op 7");
    }

    #[test]
    fn test_sql_truncation() {
        let log = OpLog::new();
        let long_sql = "X".repeat(500);
        log.record(
            OpKind::Write,
            Some(1),
            &long_sql,
            None,
            OpStatus::Failure,
            Duration::ZERO,
        );
        assert_eq!(log.recent(1)[0].sql_prefix.len(), SQL_PREFIX_LEN);
    }
}
