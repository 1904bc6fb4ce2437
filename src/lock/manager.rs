// Lock manager for cross-shard mutual exclusion.
//
// Per-shard acquisition runs a bounded loop: look the lock row up under
// SELECT ... FOR UPDATE, claim it by insert when absent, honor re-entrancy,
// take over stale rows, and otherwise back off and retry until the deadline.
// Connection errors fail fast rather than retrying blindly — a shard that
// cannot be reached cannot grant a lock.
//
// Multi-shard acquisition degrades gracefully: it succeeds when at least one
// shard granted the lock, and best-effort re-syncs the lock row onto shards
// that failed, so a later release removes it everywhere.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::shard::{ShardConnector, ShardSession};
use crate::statements as stmt;
use crate::types::{IsolationLevel, ShardId, Value};

/// Delay before retrying after losing an insert race.
const INSERT_RETRY_DELAY: Duration = Duration::from_millis(100);
/// Delay before re-checking a lock held by another session.
const HELD_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Holder information for an existing lock row.
#[derive(Debug, Clone)]
pub struct LockInfo {
    pub holder_id: String,
    pub lock_time: DateTime<Utc>,
}

/// Outcome of one pass of the acquisition loop.
enum Attempt {
    Acquired,
    AlreadyHeld,
    Backoff(Duration),
}

/// Distributed lock manager backed by per-shard `distributed_lock` tables.
pub struct DistributedLockManager {
    connector: Arc<dyn ShardConnector>,
    session_id: String,
    /// Locks currently held by this session: resource → shards.
    active: Mutex<HashMap<String, BTreeSet<ShardId>>>,
}

fn lock_name(resource: &str) -> String {
    format!("lock_{}", resource)
}

impl DistributedLockManager {
    pub fn new(connector: Arc<dyn ShardConnector>, session_id: String) -> Self {
        Self {
            connector,
            session_id,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Snapshot of locks this session currently tracks as held.
    pub fn active_locks(&self) -> HashMap<String, BTreeSet<ShardId>> {
        self.active.lock().clone()
    }

    fn track(&self, resource: &str, shard: ShardId) {
        self.active
            .lock()
            .entry(resource.to_string())
            .or_default()
            .insert(shard);
    }

    fn untrack(&self, resource: &str, shard: ShardId) {
        let mut active = self.active.lock();
        if let Some(shards) = active.get_mut(resource) {
            shards.remove(&shard);
            if shards.is_empty() {
                active.remove(resource);
            }
        }
    }

    /// Acquires a lock on `resource` at one shard, waiting up to `timeout`.
    ///
    /// A held row older than `timeout` is treated as stale and taken over.
    /// Returns false on timeout or on any connection error (fail fast).
    pub async fn acquire(&self, resource: &str, shard: ShardId, timeout: Duration) -> bool {
        let name = lock_name(resource);
        let start = Instant::now();

        let mut session = match self
            .connector
            .connect(shard, IsolationLevel::ReadCommitted)
            .await
        {
            Ok(session) => session,
            Err(e) => {
                warn!(
                    "[{}] cannot reach shard {} for lock '{}': {}",
                    self.session_id, shard, resource, e
                );
                return false;
            }
        };

        loop {
            if start.elapsed() >= timeout {
                debug!(
                    "[{}] lock acquisition timeout for '{}' on shard {}",
                    self.session_id, resource, shard
                );
                let _ = session.close().await;
                return false;
            }

            match self.try_acquire_once(&mut session, &name, timeout).await {
                Ok(Attempt::Acquired) => {
                    info!(
                        "[{}] acquired lock '{}' on shard {}",
                        self.session_id, resource, shard
                    );
                    self.track(resource, shard);
                    let _ = session.close().await;
                    return true;
                }
                Ok(Attempt::AlreadyHeld) => {
                    debug!(
                        "[{}] already hold lock '{}' on shard {}",
                        self.session_id, resource, shard
                    );
                    self.track(resource, shard);
                    let _ = session.close().await;
                    return true;
                }
                Ok(Attempt::Backoff(delay)) => {
                    if !delay.is_zero() {
                        sleep(delay).await;
                    }
                }
                Err(e) => {
                    warn!(
                        "[{}] error acquiring lock '{}' on shard {}: {}",
                        self.session_id, resource, shard, e
                    );
                    let _ = session.rollback().await;
                    let _ = session.close().await;
                    return false;
                }
            }
        }
    }

    async fn try_acquire_once(
        &self,
        session: &mut Box<dyn ShardSession>,
        name: &str,
        stale_after: Duration,
    ) -> Result<Attempt> {
        session.begin().await?;
        let rows = session
            .query(stmt::SELECT_LOCK_FOR_UPDATE, &[Value::from(name)])
            .await?;

        let row = match rows.into_iter().next() {
            None => {
                // No row: claim it. Losing the insert race is a retry, not an
                // error.
                return match session
                    .execute(
                        stmt::INSERT_LOCK,
                        &[Value::from(name), Value::from(self.session_id.as_str())],
                    )
                    .await
                {
                    Ok(_) => {
                        session.commit().await?;
                        Ok(Attempt::Acquired)
                    }
                    Err(e) if e.is_duplicate_key() => {
                        session.rollback().await?;
                        Ok(Attempt::Backoff(INSERT_RETRY_DELAY))
                    }
                    Err(e) => {
                        let _ = session.rollback().await;
                        Err(e)
                    }
                };
            }
            Some(row) => row,
        };

        let holder = row
            .get("holder_id")
            .and_then(Value::as_text)
            .unwrap_or_default()
            .to_string();
        if holder == self.session_id {
            session.commit().await?;
            return Ok(Attempt::AlreadyHeld);
        }

        let lock_time = row.get("lock_time").and_then(Value::as_timestamp);
        let age = lock_time
            .map(|t| Utc::now().signed_duration_since(t))
            .and_then(|d| d.to_std().ok());
        if let Some(age) = age {
            if age > stale_after {
                session
                    .execute(stmt::DELETE_LOCK, &[Value::from(name), Value::from(holder.as_str())])
                    .await?;
                session.commit().await?;
                info!(
                    "[{}] removed stale lock '{}' held by {} (age {:?})",
                    self.session_id, name, holder, age
                );
                return Ok(Attempt::Backoff(Duration::ZERO));
            }
        }

        session.rollback().await?;
        debug!(
            "[{}] waiting for lock '{}' (held by {})",
            self.session_id, name, holder
        );
        Ok(Attempt::Backoff(HELD_RETRY_DELAY))
    }

    /// Releases this session's lock on `resource` at one shard. Idempotent:
    /// releasing an unheld lock succeeds with no effect.
    pub async fn release(&self, resource: &str, shard: ShardId) -> bool {
        let name = lock_name(resource);
        let result = async {
            let mut session = self
                .connector
                .connect(shard, IsolationLevel::ReadCommitted)
                .await?;
            session
                .execute(
                    stmt::DELETE_LOCK,
                    &[Value::from(name.as_str()), Value::from(self.session_id.as_str())],
                )
                .await?;
            session.commit().await?;
            session.close().await
        }
        .await;

        match result {
            Ok(()) => {
                self.untrack(resource, shard);
                debug!(
                    "[{}] released lock '{}' on shard {}",
                    self.session_id, resource, shard
                );
                true
            }
            Err(e) => {
                warn!(
                    "[{}] error releasing lock '{}' on shard {}: {}",
                    self.session_id, resource, shard, e
                );
                false
            }
        }
    }

    /// Acquires the lock on every shard in `shards`, in order, under one
    /// global deadline.
    ///
    /// Fault tolerant: succeeds when at least one shard granted the lock.
    /// Shards that failed get a best-effort copy of the lock row afterwards,
    /// so that a later `release_multi` removes it everywhere it landed.
    pub async fn acquire_multi(
        &self,
        resource: &str,
        shards: &[ShardId],
        timeout: Duration,
    ) -> bool {
        let start = Instant::now();
        let mut acquired = Vec::new();
        let mut failed = Vec::new();

        for &shard in shards {
            let remaining = timeout.saturating_sub(start.elapsed());
            if self.acquire(resource, shard, remaining).await {
                acquired.push(shard);
            } else {
                failed.push(shard);
            }
        }

        if acquired.is_empty() {
            warn!(
                "[{}] multi-shard lock failed for '{}': no shard granted",
                self.session_id, resource
            );
            return false;
        }

        for &shard in &failed {
            self.sync_lock_row(resource, shard).await;
        }

        info!(
            "[{}] multi-shard lock on '{}': acquired {:?}, unavailable {:?}",
            self.session_id, resource, acquired, failed
        );
        true
    }

    /// Copies this session's lock row onto a shard that missed the acquire
    /// pass (e.g. it was briefly down). One attempt, errors swallowed.
    async fn sync_lock_row(&self, resource: &str, shard: ShardId) {
        let name = lock_name(resource);
        let result = async {
            let mut session = self
                .connector
                .connect(shard, IsolationLevel::ReadCommitted)
                .await?;
            session
                .execute(
                    stmt::INSERT_LOCK,
                    &[Value::from(name.as_str()), Value::from(self.session_id.as_str())],
                )
                .await?;
            session.commit().await?;
            session.close().await
        }
        .await;

        match result {
            Ok(()) => {
                self.track(resource, shard);
                info!(
                    "[{}] re-synced lock '{}' onto recovered shard {}",
                    self.session_id, resource, shard
                );
            }
            Err(e) => {
                debug!(
                    "[{}] could not sync lock '{}' onto shard {}: {}",
                    self.session_id, resource, shard, e
                );
            }
        }
    }

    /// Releases `resource` on every nominated shard, not just the ones where
    /// acquisition succeeded, to clean up rows created by the sync step.
    /// Returns true when every shard released cleanly.
    pub async fn release_multi(&self, resource: &str, shards: &[ShardId]) -> bool {
        let mut released = 0usize;
        let mut ok = true;
        for &shard in shards {
            if self.release(resource, shard).await {
                released += 1;
            } else {
                ok = false;
            }
        }
        debug!(
            "[{}] multi-shard release of '{}': {}/{} shards",
            self.session_id,
            resource,
            released,
            shards.len()
        );
        ok
    }

    /// Deletes every lock row held by this session on every reachable shard.
    /// Shutdown and startup-cleanup path. Returns the number of rows removed.
    pub async fn release_all(&self) -> usize {
        let mut total = 0usize;
        for shard in self.connector.shard_ids() {
            let result = async {
                let mut session = self
                    .connector
                    .connect(shard, IsolationLevel::ReadCommitted)
                    .await?;
                let removed = session
                    .execute(
                        stmt::DELETE_LOCKS_BY_HOLDER,
                        &[Value::from(self.session_id.as_str())],
                    )
                    .await?;
                session.commit().await?;
                session.close().await?;
                Ok::<u64, crate::error::CoordError>(removed)
            }
            .await;

            match result {
                Ok(removed) => {
                    if removed > 0 {
                        info!(
                            "[{}] released {} locks on shard {}",
                            self.session_id, removed, shard
                        );
                    }
                    total += removed as usize;
                }
                Err(e) => {
                    warn!(
                        "[{}] error releasing locks on shard {}: {}",
                        self.session_id, shard, e
                    );
                }
            }
        }
        self.active.lock().clear();
        total
    }

    /// Looks up the lock row for `resource` on one shard, if any.
    pub async fn check_lock(&self, resource: &str, shard: ShardId) -> Result<Option<LockInfo>> {
        let name = lock_name(resource);
        let mut session = self
            .connector
            .connect(shard, IsolationLevel::ReadCommitted)
            .await?;
        let rows = session
            .query(stmt::SELECT_LOCK, &[Value::from(name.as_str())])
            .await?;
        let _ = session.close().await;
        Ok(rows.into_iter().next().map(|row| LockInfo {
            holder_id: row
                .get("holder_id")
                .and_then(Value::as_text)
                .unwrap_or_default()
                .to_string(),
            lock_time: row
                .get("lock_time")
                .and_then(Value::as_timestamp)
                .unwrap_or_else(Utc::now),
        }))
    }

    /// Administrative sweep: removes any lock row older than `older_than`,
    /// regardless of holder. Never invoked automatically.
    pub async fn sweep_stale(&self, shard: ShardId, older_than: Duration) -> Result<u64> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than)
                .unwrap_or_else(|_| chrono::Duration::seconds(0));
        let mut session = self
            .connector
            .connect(shard, IsolationLevel::ReadCommitted)
            .await?;
        let removed = session
            .execute(stmt::DELETE_LOCKS_OLDER_THAN, &[Value::Timestamp(cutoff)])
            .await?;
        session.commit().await?;
        session.close().await?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::MemoryCluster;

    fn manager(cluster: &Arc<MemoryCluster>, session_id: &str) -> DistributedLockManager {
        DistributedLockManager::new(cluster.clone(), session_id.to_string())
    }

    #[tokio::test]
    async fn test_acquire_release_roundtrip() {
        let cluster = Arc::new(MemoryCluster::three_shards());
        let lm = manager(&cluster, "app-a");

        assert!(lm.acquire("trans_1", 1, Duration::from_secs(5)).await);
        assert!(lm.active_locks().contains_key("trans_1"));
        assert!(lm.release("trans_1", 1).await);
        assert!(lm.active_locks().is_empty());

        // no persistent state left behind
        assert_eq!(cluster.shard(1).unwrap().locks_held_by("app-a"), 0);
    }

    #[tokio::test]
    async fn test_reentrant_acquire() {
        let cluster = Arc::new(MemoryCluster::three_shards());
        let lm = manager(&cluster, "app-a");

        assert!(lm.acquire("trans_1", 1, Duration::from_secs(5)).await);
        assert!(lm.acquire("trans_1", 1, Duration::from_secs(5)).await);
        assert!(lm.release("trans_1", 1).await);
    }

    #[tokio::test]
    async fn test_zero_timeout_against_held_lock() {
        let cluster = Arc::new(MemoryCluster::three_shards());
        let holder = manager(&cluster, "app-a");
        let contender = manager(&cluster, "app-b");

        assert!(holder.acquire("trans_1", 1, Duration::from_secs(5)).await);
        // returns false before any attempt, so it cannot stale-steal
        assert!(!contender.acquire("trans_1", 1, Duration::ZERO).await);
        let (owner, _) = cluster.shard(1).unwrap().lock_row("lock_trans_1").unwrap();
        assert_eq!(owner, "app-a");
    }

    #[tokio::test]
    async fn test_mutual_exclusion() {
        let cluster = Arc::new(MemoryCluster::three_shards());
        let a = manager(&cluster, "app-a");
        let b = manager(&cluster, "app-b");

        assert!(a.acquire("trans_9", 2, Duration::from_secs(5)).await);
        assert!(!b.acquire("trans_9", 2, Duration::from_millis(300)).await);

        assert!(a.release("trans_9", 2).await);
        assert!(b.acquire("trans_9", 2, Duration::from_secs(5)).await);
        assert!(b.release("trans_9", 2).await);
    }

    #[tokio::test]
    async fn test_stale_lock_takeover() {
        let cluster = Arc::new(MemoryCluster::three_shards());
        let crashed = manager(&cluster, "app-crashed");
        let survivor = manager(&cluster, "app-b");

        assert!(crashed.acquire("trans_42", 1, Duration::from_secs(5)).await);
        // the holder "crashes": its row stays, aged past the stale window
        cluster
            .shard(1)
            .unwrap()
            .rewind_lock_time("lock_trans_42", chrono::Duration::seconds(120));

        assert!(survivor.acquire("trans_42", 1, Duration::from_secs(2)).await);
        let (owner, _) = cluster.shard(1).unwrap().lock_row("lock_trans_42").unwrap();
        assert_eq!(owner, "app-b");
        assert!(survivor.release("trans_42", 1).await);
    }

    #[tokio::test]
    async fn test_multi_shard_degrades_and_resyncs() {
        let cluster = Arc::new(MemoryCluster::three_shards());
        let lm = manager(&cluster, "app-a");

        cluster.set_down(3, true);
        assert!(
            lm.acquire_multi("insert_trans", &[1, 2, 3], Duration::from_secs(5))
                .await
        );
        assert_eq!(cluster.shard(1).unwrap().locks_held_by("app-a"), 1);
        assert_eq!(cluster.shard(3).unwrap().locks_held_by("app-a"), 0);

        // release nominates all shards, including the one that never granted
        assert!(!lm.release_multi("insert_trans", &[1, 2, 3]).await);
        assert_eq!(cluster.shard(1).unwrap().locks_held_by("app-a"), 0);
        assert_eq!(cluster.shard(2).unwrap().locks_held_by("app-a"), 0);
    }

    #[tokio::test]
    async fn test_multi_shard_all_down() {
        let cluster = Arc::new(MemoryCluster::three_shards());
        let lm = manager(&cluster, "app-a");
        for shard in [1, 2, 3] {
            cluster.set_down(shard, true);
        }
        assert!(
            !lm.acquire_multi("insert_trans", &[1, 2, 3], Duration::from_secs(1))
                .await
        );
    }

    #[tokio::test]
    async fn test_release_all() {
        let cluster = Arc::new(MemoryCluster::three_shards());
        let lm = manager(&cluster, "app-a");

        assert!(lm.acquire("trans_1", 1, Duration::from_secs(5)).await);
        assert!(lm.acquire("trans_2", 2, Duration::from_secs(5)).await);
        assert!(lm.acquire("trans_3", 3, Duration::from_secs(5)).await);

        let released = lm.release_all().await;
        assert_eq!(released, 3);
        for shard in [1, 2, 3] {
            assert_eq!(cluster.shard(shard).unwrap().locks_held_by("app-a"), 0);
        }
        assert!(lm.active_locks().is_empty());
    }

    #[tokio::test]
    async fn test_check_lock_reports_holder() {
        let cluster = Arc::new(MemoryCluster::three_shards());
        let lm = manager(&cluster, "app-a");

        assert!(lm.check_lock("trans_5", 1).await.unwrap().is_none());
        assert!(lm.acquire("trans_5", 1, Duration::from_secs(5)).await);
        let info = lm.check_lock("trans_5", 1).await.unwrap().unwrap();
        assert_eq!(info.holder_id, "app-a");
        assert!(lm.release("trans_5", 1).await);
    }

    #[tokio::test]
    async fn test_sweep_stale() {
        let cluster = Arc::new(MemoryCluster::three_shards());
        let lm = manager(&cluster, "app-a");
        assert!(lm.acquire("trans_8", 1, Duration::from_secs(5)).await);
        cluster
            .shard(1)
            .unwrap()
            .rewind_lock_time("lock_trans_8", chrono::Duration::seconds(3600));

        let removed = lm.sweep_stale(1, Duration::from_secs(60)).await.unwrap();
        assert_eq!(removed, 1);
    }
}
