// Recovery log store.
//
// Failed replications are appended to the source shard's `recovery_log` and
// mirrored onto one cross-backup shard so a single shard outage cannot erase
// the only copy. Entries are deduplicated by a SHA-256 hash over target,
// source, statement, and the current day, which bounds the dedup window to
// 24 hours: within it, identical failures collapse into one active entry.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::NaiveDate;
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::recovery::{RecoveryEntry, RecoveryStatus};
use crate::shard::ShardConnector;
use crate::statements as stmt;
use crate::types::{IsolationLevel, ShardId, Topology, Value};

/// Computes the dedup hash for a replication failure.
///
/// Inputs are joined with `_` and suffixed with the day as `yyyymmdd`, so the
/// same failure logged twice on the same day hashes identically.
pub fn transaction_hash(target: ShardId, source: ShardId, sql: &str, day: NaiveDate) -> String {
    let input = format!("{}_{}_{}_{}", target, source, sql, day.format("%Y%m%d"));
    hex::encode(Sha256::digest(input.as_bytes()))
}

/// Append-only store of failed replication attempts.
pub struct RecoveryLogStore {
    connector: Arc<dyn ShardConnector>,
    topology: Topology,
}

impl RecoveryLogStore {
    pub fn new(connector: Arc<dyn ShardConnector>, topology: Topology) -> Self {
        Self {
            connector,
            topology,
        }
    }

    /// The shard that receives the mirror copy: any shard that is neither the
    /// source nor the target.
    fn backup_shard_for(&self, source: ShardId, target: ShardId) -> Option<ShardId> {
        self.topology
            .all_shards()
            .iter()
            .copied()
            .find(|s| *s != source && *s != target)
    }

    /// Records a failed replication of `sql` from `source` to `target`.
    ///
    /// Returns true when the failure is durably logged (or already was,
    /// within the hash window). Cross-backup failures are logged but do not
    /// fail the operation: the primary copy suffices.
    pub async fn log_backup(&self, target: ShardId, source: ShardId, sql: &str) -> bool {
        let hash = transaction_hash(target, source, sql, chrono::Utc::now().date_naive());

        let appended = self.append_primary(source, target, sql, &hash).await;
        match appended {
            Ok(true) => {
                info!(
                    "recovery log created on shard {}: target={} hash={}",
                    source,
                    target,
                    &hash[..8]
                );
                self.store_cross_backup(target, source, sql, &hash).await;
                true
            }
            Ok(false) => {
                debug!("replication failure already logged (hash {})", &hash[..8]);
                true
            }
            Err(e) => {
                error!(
                    "failed to log replication failure on shard {}: {}",
                    source, e
                );
                false
            }
        }
    }

    /// Appends the primary copy; returns false on a dedup hit.
    async fn append_primary(
        &self,
        source: ShardId,
        target: ShardId,
        sql: &str,
        hash: &str,
    ) -> Result<bool> {
        let mut session = self
            .connector
            .connect(source, IsolationLevel::ReadCommitted)
            .await?;
        let rows = session
            .query(stmt::COUNT_RECOVERY_BY_HASH, &[Value::from(hash)])
            .await?;
        let existing = rows
            .first()
            .and_then(|r| r.get("n"))
            .and_then(Value::as_int)
            .unwrap_or(0);
        if existing > 0 {
            let _ = session.close().await;
            return Ok(false);
        }
        session
            .execute(
                stmt::INSERT_RECOVERY,
                &[
                    Value::Int(target as i64),
                    Value::Int(source as i64),
                    Value::from(sql),
                    Value::from(hash),
                ],
            )
            .await?;
        session.commit().await?;
        session.close().await?;
        Ok(true)
    }

    /// Mirrors the entry onto the backup shard. One attempt, never retried.
    async fn store_cross_backup(&self, target: ShardId, source: ShardId, sql: &str, hash: &str) {
        let backup = match self.backup_shard_for(source, target) {
            Some(shard) => shard,
            None => {
                debug!(
                    "no backup shard available (source={}, target={})",
                    source, target
                );
                return;
            }
        };

        let marker = format!("CROSS_BACKUP_FROM_SHARD_{}", source);
        let result = async {
            let mut session = self
                .connector
                .connect(backup, IsolationLevel::ReadCommitted)
                .await?;
            session
                .execute(
                    stmt::INSERT_RECOVERY_BACKUP,
                    &[
                        Value::Int(target as i64),
                        Value::Int(source as i64),
                        Value::from(sql),
                        Value::from(hash),
                        Value::from(marker.as_str()),
                    ],
                )
                .await?;
            session.commit().await?;
            session.close().await
        }
        .await;

        match result {
            Ok(()) => info!("cross-backup stored on shard {}", backup),
            Err(e) => warn!("failed to store cross-backup on shard {}: {}", backup, e),
        }
    }

    /// Sets a terminal status on the row living in `found_in`.
    pub async fn mark_status(
        &self,
        found_in: ShardId,
        log_id: i64,
        status: RecoveryStatus,
        message: Option<&str>,
    ) -> Result<()> {
        let mut session = self
            .connector
            .connect(found_in, IsolationLevel::ReadCommitted)
            .await?;
        session
            .execute(
                stmt::UPDATE_RECOVERY_STATUS,
                &[
                    Value::from(status.as_str()),
                    message.map(Value::from).unwrap_or(Value::Null),
                    Value::Int(log_id),
                ],
            )
            .await?;
        session.commit().await?;
        session.close().await
    }

    /// Bumps the retry counter on the row living in `found_in`.
    pub async fn increment_retry(
        &self,
        found_in: ShardId,
        log_id: i64,
        message: &str,
    ) -> Result<()> {
        let mut session = self
            .connector
            .connect(found_in, IsolationLevel::ReadCommitted)
            .await?;
        session
            .execute(
                stmt::UPDATE_RECOVERY_RETRY,
                &[Value::from(message), Value::Int(log_id)],
            )
            .await?;
        session.commit().await?;
        session.close().await
    }

    /// Pending entries on one shard past the checkpoint, in log-id order.
    pub async fn pending_since(
        &self,
        shard: ShardId,
        checkpoint: i64,
    ) -> Result<Vec<RecoveryEntry>> {
        let mut session = self
            .connector
            .connect(shard, IsolationLevel::ReadCommitted)
            .await?;
        let rows = session
            .query(stmt::SELECT_PENDING_SINCE, &[Value::Int(checkpoint)])
            .await?;
        let _ = session.close().await;
        Ok(rows
            .iter()
            .filter_map(|row| RecoveryEntry::from_row(row, shard))
            .collect())
    }

    /// Count of `PENDING` rows on one shard.
    pub async fn count_pending(&self, shard: ShardId) -> Result<i64> {
        let mut session = self
            .connector
            .connect(shard, IsolationLevel::ReadCommitted)
            .await?;
        let rows = session.query(stmt::COUNT_PENDING, &[]).await?;
        let _ = session.close().await;
        Ok(rows
            .first()
            .and_then(|r| r.get("n"))
            .and_then(Value::as_int)
            .unwrap_or(0))
    }

    /// Per-status row counts on one shard.
    pub async fn status_summary(&self, shard: ShardId) -> Result<BTreeMap<String, i64>> {
        let mut session = self
            .connector
            .connect(shard, IsolationLevel::ReadCommitted)
            .await?;
        let rows = session.query(stmt::STATUS_SUMMARY, &[]).await?;
        let _ = session.close().await;
        Ok(rows
            .iter()
            .filter_map(|row| {
                let status = row.get("status")?.as_text()?.to_string();
                let n = row.get("n")?.as_int()?;
                Some((status, n))
            })
            .collect())
    }

    /// Out-of-band repair: flips every `FAILED` row on `shard` back to
    /// `PENDING` with a fresh retry budget.
    pub async fn reset_failed(&self, shard: ShardId) -> Result<u64> {
        let mut session = self
            .connector
            .connect(shard, IsolationLevel::ReadCommitted)
            .await?;
        let reset = session.execute(stmt::RESET_FAILED, &[]).await?;
        session.commit().await?;
        session.close().await?;
        Ok(reset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::MemoryCluster;
    use chrono::Utc;

    fn store(cluster: &Arc<MemoryCluster>) -> RecoveryLogStore {
        RecoveryLogStore::new(cluster.clone(), Topology::default_three_shard())
    }

    #[test]
    fn test_hash_is_day_scoped_and_input_sensitive() {
        let day = NaiveDate::from_ymd_opt(2026, 8, 1).unwrap();
        let next = NaiveDate::from_ymd_opt(2026, 8, 2).unwrap();
        let a = transaction_hash(3, 1, "UPDATE trans SET x = 1 WHERE trans_id = 7", day);
        let b = transaction_hash(3, 1, "UPDATE trans SET x = 1 WHERE trans_id = 7", day);
        let c = transaction_hash(3, 1, "UPDATE trans SET x = 1 WHERE trans_id = 7", next);
        let d = transaction_hash(2, 1, "UPDATE trans SET x = 1 WHERE trans_id = 7", day);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!(a.len(), 64);
    }

    #[tokio::test]
    async fn test_log_backup_writes_primary_and_cross_backup() {
        let cluster = Arc::new(MemoryCluster::three_shards());
        let log = store(&cluster);

        assert!(
            log.log_backup(3, 1, "UPDATE trans SET amount = 1.0 WHERE trans_id = 7")
                .await
        );

        let primary = cluster.shard(1).unwrap().recovery_rows();
        assert_eq!(primary.len(), 1);
        assert_eq!(primary[0].target, 3);
        assert_eq!(primary[0].source, 1);
        assert_eq!(primary[0].status, "PENDING");
        assert_eq!(primary[0].error, None);

        // backup shard is the one that is neither source nor target
        let backup = cluster.shard(2).unwrap().recovery_rows();
        assert_eq!(backup.len(), 1);
        assert_eq!(backup[0].hash, primary[0].hash);
        assert_eq!(
            backup[0].error.as_deref(),
            Some("CROSS_BACKUP_FROM_SHARD_1")
        );
    }

    #[tokio::test]
    async fn test_log_backup_dedups_within_window() {
        let cluster = Arc::new(MemoryCluster::three_shards());
        let log = store(&cluster);
        let sql = "UPDATE trans SET amount = 2.0 WHERE trans_id = 9";

        assert!(log.log_backup(3, 1, sql).await);
        assert!(log.log_backup(3, 1, sql).await);

        assert_eq!(cluster.shard(1).unwrap().recovery_rows().len(), 1);
        // dedup hit short-circuits before the cross-backup step too
        assert_eq!(cluster.shard(2).unwrap().recovery_rows().len(), 1);
    }

    #[tokio::test]
    async fn test_cross_backup_failure_is_non_fatal() {
        let cluster = Arc::new(MemoryCluster::three_shards());
        let log = store(&cluster);
        cluster.set_down(2, true);

        assert!(
            log.log_backup(3, 1, "DELETE FROM trans WHERE trans_id = 5")
                .await
        );
        assert_eq!(cluster.shard(1).unwrap().recovery_rows().len(), 1);
        assert_eq!(cluster.shard(2).unwrap().recovery_rows().len(), 0);
    }

    #[tokio::test]
    async fn test_log_backup_fails_when_source_down() {
        let cluster = Arc::new(MemoryCluster::three_shards());
        let log = store(&cluster);
        cluster.set_down(1, true);

        assert!(
            !log.log_backup(3, 1, "DELETE FROM trans WHERE trans_id = 5")
                .await
        );
    }

    #[tokio::test]
    async fn test_status_transitions_and_summary() {
        let cluster = Arc::new(MemoryCluster::three_shards());
        let log = store(&cluster);
        log.log_backup(3, 1, "UPDATE trans SET a = 1 WHERE trans_id = 1")
            .await;
        log.log_backup(2, 1, "UPDATE trans SET a = 1 WHERE trans_id = 2")
            .await;

        log.mark_status(1, 1, RecoveryStatus::Completed, Some("Recovery successful"))
            .await
            .unwrap();
        log.increment_retry(1, 2, "Replay attempt 1 failed: shard down")
            .await
            .unwrap();

        let summary = log.status_summary(1).await.unwrap();
        assert_eq!(summary.get("COMPLETED"), Some(&1));
        assert_eq!(summary.get("PENDING"), Some(&1));

        let pending = log.pending_since(1, 0).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].log_id, 2);
        assert_eq!(pending[0].retry_count, 1);
    }

    #[tokio::test]
    async fn test_reset_failed() {
        let cluster = Arc::new(MemoryCluster::three_shards());
        let log = store(&cluster);
        log.log_backup(3, 1, "UPDATE trans SET a = 1 WHERE trans_id = 1")
            .await;
        log.mark_status(1, 1, RecoveryStatus::Failed, Some("Max retries (3) exceeded"))
            .await
            .unwrap();
        assert_eq!(log.count_pending(1).await.unwrap(), 0);

        assert_eq!(log.reset_failed(1).await.unwrap(), 1);
        let pending = log.pending_since(1, 0).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].retry_count, 0);
    }

    #[tokio::test]
    async fn test_hash_today_matches_store() {
        let cluster = Arc::new(MemoryCluster::three_shards());
        let log = store(&cluster);
        let sql = "UPDATE trans SET a = 3 WHERE trans_id = 3";
        log.log_backup(3, 2, sql).await;

        let expected = transaction_hash(3, 2, sql, Utc::now().date_naive());
        let rows = cluster.shard(2).unwrap().recovery_rows();
        assert_eq!(rows[0].hash, expected);
    }
}
