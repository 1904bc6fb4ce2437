// Checkpoint-driven replay engine.
//
// One drain cycle runs at a time globally, guarded by the pid-valued mutex
// row on the central shard. The cycle scans every shard's `recovery_log` past
// its watermark, re-executes pending statements against their target shards,
// and advances each watermark to the highest consecutive log id that was
// terminally processed with no gap. Rows past a failure stay `PENDING` and
// are retried on a later cycle, so no replay is ever skipped.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::recovery::{CheckpointStore, RecoveryEntry, RecoveryLogStore, RecoveryStatus};
use crate::shard::ShardConnector;
use crate::types::{IsolationLevel, ShardId, Topology};

/// Outcome of replaying one recovery entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReplayOutcome {
    Recovered,
    Skipped,
    Failed,
}

/// Summary of one drain cycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DrainReport {
    /// Entries examined this cycle.
    pub total: usize,
    /// Entries re-executed successfully.
    pub recovered: usize,
    /// Entries that failed and remain pending (or were marked FAILED).
    pub failed: usize,
    /// Entries skipped as duplicates or already applied.
    pub skipped: usize,
    /// Whether this process won the drain mutex.
    pub mutex_acquired: bool,
    /// Watermarks advanced this cycle: shard → new value.
    pub checkpoints_advanced: BTreeMap<ShardId, i64>,
}

/// Cluster-wide recovery view for diagnostics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalRecoveryStatus {
    /// Per-shard status → count rollups; unreachable shards are absent.
    pub shards: BTreeMap<ShardId, BTreeMap<String, i64>>,
    /// Current per-shard watermarks.
    pub checkpoints: BTreeMap<ShardId, i64>,
}

/// Re-executes pending recovery entries under a global mutex.
pub struct ReplayEngine {
    topology: Topology,
    log: Arc<RecoveryLogStore>,
    checkpoints: CheckpointStore,
    connector: Arc<dyn ShardConnector>,
    isolation: IsolationLevel,
    max_retries: u32,
    mutex_warn_after: u32,
    skipped_cycles: AtomicU32,
}

impl ReplayEngine {
    pub fn new(
        connector: Arc<dyn ShardConnector>,
        topology: Topology,
        log: Arc<RecoveryLogStore>,
        isolation: IsolationLevel,
        max_retries: u32,
        mutex_warn_after: u32,
    ) -> Self {
        let checkpoints = CheckpointStore::new(
            connector.clone(),
            topology.central(),
            topology.all_shards().to_vec(),
        );
        Self {
            topology,
            log,
            checkpoints,
            connector,
            isolation,
            max_retries,
            mutex_warn_after,
            skipped_cycles: AtomicU32::new(0),
        }
    }

    /// Runs one drain cycle.
    ///
    /// Cheap pre-check first: with no `PENDING` rows on the central shard the
    /// cycle returns without touching the mutex. Losing the mutex skips the
    /// cycle entirely; the winner scans, replays, advances watermarks, and
    /// frees the mutex.
    pub async fn drain(&self) -> DrainReport {
        let mut report = DrainReport::default();

        match self.log.count_pending(self.topology.central()).await {
            Ok(0) => {
                debug!("drain quick-check: no pending recovery entries");
                return report;
            }
            Ok(n) => debug!("drain quick-check: {} pending entries", n),
            Err(e) => debug!("drain quick-check failed, proceeding: {}", e),
        }

        if let Err(e) = self.checkpoints.ensure_rows().await {
            warn!("cannot prepare checkpoint rows: {}", e);
            return report;
        }

        let pid = std::process::id() as i64;
        match self.checkpoints.claim_mutex(pid).await {
            Ok(true) => {}
            Ok(false) => {
                let skipped = self.skipped_cycles.fetch_add(1, Ordering::SeqCst) + 1;
                if skipped >= self.mutex_warn_after {
                    warn!(
                        "drain mutex held by another process for {} consecutive cycles",
                        skipped
                    );
                } else {
                    info!("drain skipped: recovery already running elsewhere");
                }
                return report;
            }
            Err(e) => {
                warn!("cannot claim drain mutex: {}", e);
                return report;
            }
        }
        self.skipped_cycles.store(0, Ordering::SeqCst);
        report.mutex_acquired = true;

        self.run_cycle(&mut report).await;

        if let Err(e) = self.checkpoints.release_mutex(pid).await {
            warn!("failed to release drain mutex: {}", e);
        }
        info!(
            "drain complete: {} total, {} recovered, {} failed, {} skipped, {} checkpoints advanced",
            report.total,
            report.recovered,
            report.failed,
            report.skipped,
            report.checkpoints_advanced.len()
        );
        report
    }

    async fn run_cycle(&self, report: &mut DrainReport) {
        let checkpoints = match self.checkpoints.read_all().await {
            Ok(c) => c,
            Err(e) => {
                warn!("cannot read checkpoints: {}", e);
                return;
            }
        };
        debug!("drain starting from checkpoints {:?}", checkpoints);

        let mut seen_hashes: HashSet<String> = HashSet::new();

        for (shard, checkpoint) in checkpoints {
            let entries = match self.log.pending_since(shard, checkpoint).await {
                Ok(entries) => entries,
                Err(e) => {
                    debug!("shard {} not scannable this cycle: {}", shard, e);
                    continue;
                }
            };
            if entries.is_empty() {
                continue;
            }
            info!(
                "found {} pending entries on shard {} past checkpoint {}",
                entries.len(),
                shard,
                checkpoint
            );

            let mut consecutive = checkpoint;
            for entry in entries {
                report.total += 1;
                let outcome = self.replay_entry(&entry, &mut seen_hashes).await;
                match outcome {
                    ReplayOutcome::Recovered => report.recovered += 1,
                    ReplayOutcome::Skipped => report.skipped += 1,
                    ReplayOutcome::Failed => report.failed += 1,
                }
                // Only a gap-free prefix of terminally processed entries may
                // move the watermark; anything past a failure is retried next
                // cycle.
                if outcome != ReplayOutcome::Failed && entry.log_id == consecutive + 1 {
                    consecutive = entry.log_id;
                }
            }

            if consecutive > checkpoint {
                match self.checkpoints.advance(shard, consecutive).await {
                    Ok(true) => {
                        info!("advanced checkpoint for shard {} to {}", shard, consecutive);
                        report.checkpoints_advanced.insert(shard, consecutive);
                    }
                    Ok(false) => {}
                    Err(e) => warn!("cannot advance checkpoint for shard {}: {}", shard, e),
                }
            }
        }
    }

    async fn replay_entry(
        &self,
        entry: &RecoveryEntry,
        seen_hashes: &mut HashSet<String>,
    ) -> ReplayOutcome {
        if entry.retry_count >= self.max_retries {
            let message = format!("Max retries ({}) exceeded", self.max_retries);
            let _ = self
                .log
                .mark_status(
                    entry.found_in,
                    entry.log_id,
                    RecoveryStatus::Failed,
                    Some(&message),
                )
                .await;
            warn!(
                "recovery entry {} (shard {}) exhausted retries",
                entry.log_id, entry.found_in
            );
            return ReplayOutcome::Failed;
        }

        // A copy of a hash already handled this cycle (primary + cross-backup
        // of the same failure) is marked off without re-executing.
        if seen_hashes.contains(&entry.hash) {
            let _ = self
                .log
                .mark_status(
                    entry.found_in,
                    entry.log_id,
                    RecoveryStatus::Completed,
                    Some("Duplicate transaction - skipped during deduplication"),
                )
                .await;
            debug!(
                "entry {} on shard {} is a duplicate copy (hash {})",
                entry.log_id,
                entry.found_in,
                &entry.hash[..8]
            );
            return ReplayOutcome::Skipped;
        }

        let executed = async {
            let mut session = self.connector.connect(entry.target, self.isolation).await?;
            session.begin().await?;
            session.execute(&entry.sql, &[]).await?;
            session.commit().await?;
            session.close().await
        }
        .await;

        match executed {
            Ok(()) => {
                let _ = self
                    .log
                    .mark_status(
                        entry.found_in,
                        entry.log_id,
                        RecoveryStatus::Completed,
                        Some("Recovery successful"),
                    )
                    .await;
                seen_hashes.insert(entry.hash.clone());
                info!(
                    "recovered entry {} onto shard {}",
                    entry.log_id, entry.target
                );
                ReplayOutcome::Recovered
            }
            Err(e) if e.is_duplicate_key() => {
                // The statement already landed on the target (an earlier
                // partially-observed replay); the desired state holds.
                let _ = self
                    .log
                    .mark_status(
                        entry.found_in,
                        entry.log_id,
                        RecoveryStatus::Completed,
                        Some("Transaction already exists - duplicate detected"),
                    )
                    .await;
                seen_hashes.insert(entry.hash.clone());
                ReplayOutcome::Skipped
            }
            Err(e) => {
                let message = format!("Replay attempt {} failed: {}", entry.retry_count + 1, e);
                let _ = self
                    .log
                    .increment_retry(entry.found_in, entry.log_id, &message)
                    .await;
                warn!(
                    "replay of entry {} onto shard {} failed: {}",
                    entry.log_id, entry.target, e
                );
                ReplayOutcome::Failed
            }
        }
    }

    /// Cluster-wide status rollup plus current watermarks.
    pub async fn global_status(&self) -> GlobalRecoveryStatus {
        let mut status = GlobalRecoveryStatus::default();
        for shard in self.topology.all_shards() {
            if let Ok(summary) = self.log.status_summary(*shard).await {
                status.shards.insert(*shard, summary);
            }
        }
        if let Ok(checkpoints) = self.checkpoints.read_all().await {
            status.checkpoints = checkpoints;
        }
        status
    }

    /// Frees a wedged drain mutex regardless of holder.
    pub async fn force_release_mutex(&self) -> Result<()> {
        self.checkpoints.force_release_mutex().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::MemoryCluster;

    fn engine(cluster: &Arc<MemoryCluster>, max_retries: u32) -> ReplayEngine {
        let topology = Topology::default_three_shard();
        let log = Arc::new(RecoveryLogStore::new(cluster.clone(), topology.clone()));
        ReplayEngine::new(
            cluster.clone(),
            topology,
            log,
            IsolationLevel::RepeatableRead,
            max_retries,
            10,
        )
    }

    fn log_store(cluster: &Arc<MemoryCluster>) -> RecoveryLogStore {
        RecoveryLogStore::new(cluster.clone(), Topology::default_three_shard())
    }

    #[tokio::test]
    async fn test_drain_with_nothing_pending() {
        let cluster = Arc::new(MemoryCluster::three_shards());
        let engine = engine(&cluster, 3);
        let report = engine.drain().await;
        assert_eq!(report.total, 0);
        assert!(!report.mutex_acquired);
        assert!(report.checkpoints_advanced.is_empty());
    }

    #[tokio::test]
    async fn test_drain_recovers_pending_entry() {
        let cluster = Arc::new(MemoryCluster::three_shards());
        let log = log_store(&cluster);
        // shard 3 missed this update; both copies of the failure are logged
        cluster.shard(1).unwrap().seed_trans(crate::types::row(vec![
            ("trans_id", crate::types::Value::Int(7)),
            ("amount", crate::types::Value::Float(1.0)),
        ]));
        log.log_backup(3, 1, "INSERT INTO trans (trans_id, amount) VALUES (7, 1.0)")
            .await;

        let engine = engine(&cluster, 3);
        let report = engine.drain().await;

        assert!(report.mutex_acquired);
        assert_eq!(report.recovered, 1);
        // the cross-backup copy on shard 2 is deduplicated, not re-executed
        assert_eq!(report.skipped, 1);
        assert_eq!(report.failed, 0);
        assert!(cluster.shard(3).unwrap().trans_row(7).is_some());
        assert_eq!(report.checkpoints_advanced.get(&1), Some(&1));
        assert_eq!(report.checkpoints_advanced.get(&2), Some(&1));

        let backup_rows = cluster.shard(2).unwrap().recovery_rows();
        assert_eq!(backup_rows[0].status, "COMPLETED");

        // the mutex is free again
        assert_eq!(cluster.shard(1).unwrap().checkpoint(0), Some(-1));
    }

    #[tokio::test]
    async fn test_drain_is_idempotent() {
        let cluster = Arc::new(MemoryCluster::three_shards());
        let log = log_store(&cluster);
        log.log_backup(3, 1, "INSERT INTO trans (trans_id, amount) VALUES (9, 2.0)")
            .await;

        let engine = engine(&cluster, 3);
        let first = engine.drain().await;
        assert_eq!(first.recovered, 1);

        // everything terminally processed: second cycle quick-skips
        let second = engine.drain().await;
        assert_eq!(second.total, 0);
        assert!(!second.mutex_acquired);
        assert_eq!(cluster.shard(3).unwrap().trans_ids(), vec![9]);
    }

    #[tokio::test]
    async fn test_failed_target_keeps_entry_pending() {
        let cluster = Arc::new(MemoryCluster::three_shards());
        let log = log_store(&cluster);
        log.log_backup(3, 1, "INSERT INTO trans (trans_id, amount) VALUES (5, 1.0)")
            .await;
        cluster.set_down(3, true);

        let engine = engine(&cluster, 3);
        let report = engine.drain().await;
        // both the primary copy and the cross-backup copy fail to execute
        assert_eq!(report.failed, 2);
        assert!(report.checkpoints_advanced.is_empty());

        let rows = cluster.shard(1).unwrap().recovery_rows();
        assert_eq!(rows[0].status, "PENDING");
        assert_eq!(rows[0].retry_count, 1);

        // target returns: next drain completes the work
        cluster.set_down(3, false);
        let report = engine.drain().await;
        assert_eq!(report.recovered + report.skipped, 2);
        assert!(cluster.shard(3).unwrap().trans_row(5).is_some());
    }

    #[tokio::test]
    async fn test_retry_exhaustion_marks_failed() {
        let cluster = Arc::new(MemoryCluster::three_shards());
        let log = log_store(&cluster);
        log.log_backup(3, 1, "INSERT INTO trans (trans_id, amount) VALUES (4, 1.0)")
            .await;
        cluster.set_down(3, true);

        let engine = engine(&cluster, 2);
        engine.drain().await; // retry 1
        engine.drain().await; // retry 2
        let report = engine.drain().await; // budget exhausted

        assert!(report.failed >= 1);
        let rows = cluster.shard(1).unwrap().recovery_rows();
        assert_eq!(rows[0].status, "FAILED");
        assert_eq!(
            rows[0].error.as_deref(),
            Some("Max retries (2) exceeded")
        );

        // FAILED rows are never retried automatically
        cluster.set_down(3, false);
        let report = engine.drain().await;
        assert_eq!(report.recovered, 0);
        assert!(cluster.shard(3).unwrap().trans_row(4).is_none());
    }

    #[tokio::test]
    async fn test_already_applied_statement_completes_without_side_effects() {
        let cluster = Arc::new(MemoryCluster::three_shards());
        let log = log_store(&cluster);
        // the row already made it to shard 3 before the failure was logged
        cluster.shard(3).unwrap().seed_trans(crate::types::row(vec![
            ("trans_id", crate::types::Value::Int(11)),
            ("amount", crate::types::Value::Float(8.0)),
        ]));
        log.log_backup(3, 1, "INSERT INTO trans (trans_id, amount) VALUES (11, 9.0)")
            .await;

        let engine = engine(&cluster, 3);
        let report = engine.drain().await;
        assert_eq!(report.recovered, 0);
        assert_eq!(report.skipped, 2);

        // the pre-existing row is untouched
        let row = cluster.shard(3).unwrap().trans_row(11).unwrap();
        assert_eq!(row.get("amount"), Some(&crate::types::Value::Float(8.0)));
        let statuses: Vec<String> = cluster
            .shard(1)
            .unwrap()
            .recovery_rows()
            .into_iter()
            .map(|r| r.status)
            .collect();
        assert_eq!(statuses, vec!["COMPLETED".to_string()]);
    }

    #[tokio::test]
    async fn test_gap_holds_watermark_back() {
        let cluster = Arc::new(MemoryCluster::three_shards());
        let log = log_store(&cluster);
        // two failures on shard 1: log ids 1 and 2. Entry 1 targets the down
        // shard 2, entry 2 targets the healthy shard 3.
        log.log_backup(2, 1, "INSERT INTO trans (trans_id, amount) VALUES (21, 1.0)")
            .await;
        log.log_backup(3, 1, "INSERT INTO trans (trans_id, amount) VALUES (22, 1.0)")
            .await;
        cluster.set_down(2, true);

        let engine = engine(&cluster, 5);
        let report = engine.drain().await;
        assert_eq!(report.recovered, 1);
        assert!(report.failed >= 1);
        // entry 2 succeeded but entry 1 did not: no gap-free prefix advanced
        assert_eq!(report.checkpoints_advanced.get(&1), None);

        cluster.set_down(2, false);
        let report = engine.drain().await;
        assert_eq!(report.recovered, 1);
        // entry 1 now heads a gap-free prefix; entry 2 is already terminal
        // and no longer fetched, so the watermark lands on 1
        assert_eq!(report.checkpoints_advanced.get(&1), Some(&1));
        assert!(cluster.shard(2).unwrap().trans_row(21).is_some());
    }

    #[tokio::test]
    async fn test_global_status() {
        let cluster = Arc::new(MemoryCluster::three_shards());
        let log = log_store(&cluster);
        log.log_backup(3, 1, "INSERT INTO trans (trans_id, amount) VALUES (31, 1.0)")
            .await;

        let engine = engine(&cluster, 3);
        engine.drain().await;

        let status = engine.global_status().await;
        assert_eq!(
            status.shards.get(&1).and_then(|s| s.get("COMPLETED")),
            Some(&1)
        );
        assert_eq!(status.checkpoints.get(&1), Some(&1));
    }
}
