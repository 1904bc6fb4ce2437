// Write/commit/replicate pipeline.
//
// A write spans three explicit calls so a caller (or a user sitting behind
// one) can hold the decision open: `begin` drains pending recovery, takes the
// multi-shard lock, elects a primary, allocates an id for inserts, and
// executes the statement inside an open transaction; `commit` commits the
// primary, replicates to the policy-selected secondaries, logs any
// replication failure for deferred recovery, and releases the locks
// (shrinking phase); `rollback` aborts the primary and releases the locks.
//
// The write is durable once the primary commits: replication failures never
// abort it, they only enqueue recovery work.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::{CoordError, Result};
use crate::liveness::LivenessMonitor;
use crate::lock::DistributedLockManager;
use crate::oplog::{OpKind, OpLog, OpStatus};
use crate::recovery::{RecoveryLogStore, ReplayEngine};
use crate::shard::{ShardConnector, ShardSession};
use crate::statements as stmt;
use crate::types::{IsolationLevel, ShardId, Topology, Value};

/// Placeholder in insert templates, replaced with the allocated primary key.
pub const ID_PLACEHOLDER: &str = "{trans_id}";

/// Bounded attempts to re-derive an id after a duplicate-key collision.
const MAX_ID_RETRIES: u32 = 3;

/// The global lock resource serializing insert id allocation.
const INSERT_RESOURCE: &str = "insert_trans";

/// The statement a write executes.
#[derive(Debug, Clone)]
pub enum WriteStatement {
    /// Complete SQL for a row-scoped write (update or delete).
    Statement { sql: String },
    /// Insert template carrying `{trans_id}`, filled in after id allocation.
    Insert { template: String },
}

/// One write to run through the pipeline.
#[derive(Debug, Clone)]
pub struct WriteRequest {
    pub statement: WriteStatement,
    pub routing_key: i64,
    /// Lock resource id: row-scoped (`trans_<pk>`) or global (`insert_trans`).
    pub resource: String,
    pub isolation: Option<IsolationLevel>,
}

impl WriteRequest {
    /// An insert allocating a fresh primary key under the global insert lock.
    pub fn insert(template: impl Into<String>, routing_key: i64) -> Self {
        Self {
            statement: WriteStatement::Insert {
                template: template.into(),
            },
            routing_key,
            resource: INSERT_RESOURCE.to_string(),
            isolation: None,
        }
    }

    /// An update of one row, locked by its primary key.
    pub fn update(sql: impl Into<String>, trans_id: i64, routing_key: i64) -> Self {
        Self {
            statement: WriteStatement::Statement { sql: sql.into() },
            routing_key,
            resource: format!("trans_{}", trans_id),
            isolation: None,
        }
    }

    /// A delete of one row, locked by its primary key.
    pub fn delete(sql: impl Into<String>, trans_id: i64, routing_key: i64) -> Self {
        Self::update(sql, trans_id, routing_key)
    }

    pub fn with_isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = Some(isolation);
        self
    }
}

/// How an insert id was derived: the winning value and what each consulted
/// shard reported as its `MAX(trans_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdAllocation {
    pub next_id: i64,
    pub consulted: BTreeMap<ShardId, Option<i64>>,
}

/// An in-flight write: open primary session plus held locks.
pub struct TxnHandle {
    id: u64,
    primary: ShardId,
    sql: String,
    statement: WriteStatement,
    resource: String,
    routing_key: i64,
    isolation: IsolationLevel,
    session: Box<dyn ShardSession>,
    lock_shards: Vec<ShardId>,
    allocation: Option<IdAllocation>,
    started: Instant,
}

impl TxnHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn primary(&self) -> ShardId {
        self.primary
    }

    /// The exact SQL executed on the primary (id already substituted).
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// The allocated primary key, for inserts.
    pub fn trans_id(&self) -> Option<i64> {
        self.allocation.as_ref().map(|a| a.next_id)
    }

    pub fn allocation(&self) -> Option<&IdAllocation> {
        self.allocation.as_ref()
    }
}

impl std::fmt::Debug for TxnHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxnHandle")
            .field("id", &self.id)
            .field("primary", &self.primary)
            .field("resource", &self.resource)
            .finish()
    }
}

/// Outcome of a committed write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteResult {
    pub primary: ShardId,
    pub trans_id: Option<i64>,
    /// Secondaries the statement reached synchronously.
    pub replicated: Vec<ShardId>,
    /// Secondaries that failed; each has a recovery log entry.
    pub failed_targets: Vec<ShardId>,
    pub duration_ms: u64,
}

/// Metadata about an in-flight write, for observability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveWrite {
    pub handle_id: u64,
    pub resource: String,
    pub primary: ShardId,
    pub started_at: DateTime<Utc>,
}

/// The write/replicate pipeline.
pub struct WritePipeline {
    connector: Arc<dyn ShardConnector>,
    topology: Topology,
    locks: Arc<DistributedLockManager>,
    liveness: Arc<LivenessMonitor>,
    recovery: Arc<RecoveryLogStore>,
    replay: Arc<ReplayEngine>,
    oplog: Arc<OpLog>,
    lock_timeout: Duration,
    isolation_default: IsolationLevel,
    active: Mutex<HashMap<u64, ActiveWrite>>,
    next_handle: AtomicU64,
}

impl WritePipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        connector: Arc<dyn ShardConnector>,
        topology: Topology,
        locks: Arc<DistributedLockManager>,
        liveness: Arc<LivenessMonitor>,
        recovery: Arc<RecoveryLogStore>,
        replay: Arc<ReplayEngine>,
        oplog: Arc<OpLog>,
        lock_timeout: Duration,
        isolation_default: IsolationLevel,
    ) -> Self {
        Self {
            connector,
            topology,
            locks,
            liveness,
            recovery,
            replay,
            oplog,
            lock_timeout,
            isolation_default,
            active: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    /// In-flight writes this process has begun but not yet finished.
    pub fn active_writes(&self) -> Vec<ActiveWrite> {
        self.active.lock().values().cloned().collect()
    }

    /// Opens a write: drain → lock → elect primary → (allocate id) → execute.
    ///
    /// On success the primary session stays open and the multi-shard lock
    /// stays held until `commit` or `rollback`.
    pub async fn begin(&self, request: WriteRequest) -> Result<TxnHandle> {
        // Opportunistic drain: pending recovery is applied before new writes
        // so replicas converge first.
        let _ = self.replay.drain().await;

        let resource = request.resource.clone();
        let lock_shards = self.topology.all_shards().to_vec();
        if !self
            .locks
            .acquire_multi(&resource, &lock_shards, self.lock_timeout)
            .await
        {
            return Err(CoordError::LockUnavailable {
                resource,
                waited_ms: self.lock_timeout.as_millis() as u64,
            });
        }

        match self.begin_locked(request, &lock_shards).await {
            Ok(handle) => Ok(handle),
            Err(e) => {
                self.locks.release_multi(&resource, &lock_shards).await;
                Err(e)
            }
        }
    }

    async fn begin_locked(
        &self,
        request: WriteRequest,
        lock_shards: &[ShardId],
    ) -> Result<TxnHandle> {
        let started = Instant::now();
        let status = self.liveness.status().await;
        let primary = self.elect_primary(request.routing_key, &status)?;

        let (mut sql, mut allocation) = match &request.statement {
            WriteStatement::Statement { sql } => (sql.clone(), None),
            WriteStatement::Insert { template } => {
                let allocation = self.allocate_id().await?;
                (
                    template.replace(ID_PLACEHOLDER, &allocation.next_id.to_string()),
                    Some(allocation),
                )
            }
        };

        let isolation = request.isolation.unwrap_or(self.isolation_default);
        let mut session = self.connector.connect(primary, isolation).await?;
        session.begin().await?;

        // The lock serializes id allocation, but a collision can still appear
        // if a row landed on the primary after the max(pk) scan; re-derive
        // the id a bounded number of times.
        let mut attempts = 0u32;
        loop {
            match session.execute(&sql, &[]).await {
                Ok(_) => break,
                Err(e)
                    if e.is_duplicate_key()
                        && matches!(request.statement, WriteStatement::Insert { .. })
                        && attempts < MAX_ID_RETRIES =>
                {
                    attempts += 1;
                    warn!(
                        "duplicate trans_id on shard {}, re-deriving ({}/{})",
                        primary, attempts, MAX_ID_RETRIES
                    );
                    let _ = session.rollback().await;
                    let fresh = self.allocate_id().await?;
                    if let WriteStatement::Insert { template } = &request.statement {
                        sql = template.replace(ID_PLACEHOLDER, &fresh.next_id.to_string());
                    }
                    allocation = Some(fresh);
                    session.begin().await?;
                }
                Err(e) => {
                    let _ = session.rollback().await;
                    let _ = session.close().await;
                    return Err(e);
                }
            }
        }

        let handle_id = self.next_handle.fetch_add(1, Ordering::SeqCst);
        self.active.lock().insert(
            handle_id,
            ActiveWrite {
                handle_id,
                resource: request.resource.clone(),
                primary,
                started_at: Utc::now(),
            },
        );
        info!(
            "write {} open on primary shard {} (resource '{}', isolation {})",
            handle_id, primary, request.resource, isolation
        );

        Ok(TxnHandle {
            id: handle_id,
            primary,
            sql,
            statement: request.statement,
            resource: request.resource,
            routing_key: request.routing_key,
            isolation,
            session,
            lock_shards: lock_shards.to_vec(),
            allocation,
            started,
        })
    }

    /// Primary election: central first, then the natural partition, then any
    /// live shard as an emergency primary.
    fn elect_primary(
        &self,
        routing_key: i64,
        status: &std::collections::HashMap<ShardId, bool>,
    ) -> Result<ShardId> {
        let central = self.topology.central();
        let natural = self.topology.natural_partition(routing_key);
        let live = |shard: &ShardId| status.get(shard).copied().unwrap_or(false);

        if live(&central) {
            return Ok(central);
        }
        if live(&natural) {
            debug!("central offline, using natural partition {} as primary", natural);
            return Ok(natural);
        }
        match self.topology.all_shards().iter().find(|s| live(s)) {
            Some(shard) => {
                warn!("using shard {} as emergency primary", shard);
                Ok(*shard)
            }
            None => Err(CoordError::Unavailable),
        }
    }

    /// Derives the next primary key as `max(pk) + 1` over every live shard.
    ///
    /// Quorum rule: the result is only trustworthy when the central shard is
    /// live, or both partition shards are — any other combination could miss
    /// the true maximum.
    async fn allocate_id(&self) -> Result<IdAllocation> {
        let status = self.liveness.status().await;
        let live = |shard: &ShardId| status.get(shard).copied().unwrap_or(false);

        let central_live = live(&self.topology.central());
        let partitions = self.topology.partitions();
        let partitions_live = !partitions.is_empty() && partitions.iter().all(live);
        if !central_live && !partitions_live {
            let live_count = self.topology.all_shards().iter().filter(|s| live(s)).count();
            return Err(CoordError::InsufficientQuorum {
                live: live_count,
                total: self.topology.all_shards().len(),
            });
        }

        let mut consulted = BTreeMap::new();
        let mut max_id = 0i64;
        for shard in self.topology.all_shards().iter().filter(|s| live(s)) {
            match self.query_max_id(*shard).await {
                Ok(found) => {
                    if let Some(n) = found {
                        max_id = max_id.max(n);
                    }
                    consulted.insert(*shard, found);
                }
                Err(e) => {
                    debug!("max(pk) scan failed on shard {}: {}", shard, e);
                    consulted.insert(*shard, None);
                }
            }
        }
        Ok(IdAllocation {
            next_id: max_id + 1,
            consulted,
        })
    }

    async fn query_max_id(&self, shard: ShardId) -> Result<Option<i64>> {
        let mut session = self
            .connector
            .connect(shard, IsolationLevel::ReadCommitted)
            .await?;
        let rows = session.query(stmt::SELECT_MAX_TRANS_ID, &[]).await?;
        let _ = session.close().await;
        Ok(rows
            .first()
            .and_then(|r| r.get("max_id"))
            .and_then(Value::as_int))
    }

    /// Commits the primary, replicates, logs failures, releases locks.
    pub async fn commit(&self, mut tx: TxnHandle) -> Result<WriteResult> {
        let mut attempts = 0u32;
        loop {
            match tx.session.commit().await {
                Ok(()) => break,
                Err(e)
                    if e.is_duplicate_key()
                        && matches!(tx.statement, WriteStatement::Insert { .. })
                        && attempts < MAX_ID_RETRIES =>
                {
                    attempts += 1;
                    warn!(
                        "duplicate trans_id at commit on shard {}, re-deriving ({}/{})",
                        tx.primary, attempts, MAX_ID_RETRIES
                    );
                    let _ = tx.session.rollback().await;
                    let fresh = match self.allocate_id().await {
                        Ok(fresh) => fresh,
                        Err(e) => return Err(self.abort(tx, e).await),
                    };
                    if let WriteStatement::Insert { template } = &tx.statement {
                        tx.sql = template.replace(ID_PLACEHOLDER, &fresh.next_id.to_string());
                    }
                    tx.allocation = Some(fresh);
                    let reexecuted = async {
                        tx.session.begin().await?;
                        tx.session.execute(&tx.sql, &[]).await.map(|_| ())
                    }
                    .await;
                    if let Err(e) = reexecuted {
                        return Err(self.abort(tx, e).await);
                    }
                }
                Err(e) => {
                    let failure = CoordError::PrimaryCommitFailed {
                        shard: tx.primary,
                        reason: e.to_string(),
                    };
                    return Err(self.abort(tx, failure).await);
                }
            }
        }

        info!("write {} committed on primary shard {}", tx.id, tx.primary);

        let targets = self.replication_targets(tx.primary, tx.routing_key);
        let mut replicated = Vec::new();
        let mut failed_targets = Vec::new();
        for target in targets {
            match self.replicate_one(target, &tx.sql, tx.isolation).await {
                Ok(()) => {
                    info!("replicated write {} to shard {}", tx.id, target);
                    replicated.push(target);
                }
                Err(e) => {
                    warn!(
                        "replication of write {} to shard {} failed: {}",
                        tx.id, target, e
                    );
                    if !self.recovery.log_backup(target, tx.primary, &tx.sql).await {
                        error!(
                            "could not log replication failure for shard {}; manual repair needed",
                            target
                        );
                    }
                    failed_targets.push(target);
                }
            }
        }

        // Shrinking phase: the write is durable, locks can go.
        self.locks
            .release_multi(&tx.resource, &tx.lock_shards)
            .await;
        self.active.lock().remove(&tx.id);
        let _ = tx.session.close().await;

        let duration = tx.started.elapsed();
        self.oplog.record(
            OpKind::Write,
            Some(tx.primary),
            &tx.sql,
            Some(tx.isolation),
            OpStatus::Success,
            duration,
        );

        Ok(WriteResult {
            primary: tx.primary,
            trans_id: tx.allocation.as_ref().map(|a| a.next_id),
            replicated,
            failed_targets,
            duration_ms: duration.as_millis() as u64,
        })
    }

    /// Aborts the write: rollback on the primary, release every lock, drop
    /// the session. No recovery log is written.
    pub async fn rollback(&self, mut tx: TxnHandle) -> Result<()> {
        let result = tx.session.rollback().await;
        self.locks
            .release_multi(&tx.resource, &tx.lock_shards)
            .await;
        self.active.lock().remove(&tx.id);
        let _ = tx.session.close().await;
        self.oplog.record(
            OpKind::Rollback,
            Some(tx.primary),
            &tx.sql,
            Some(tx.isolation),
            OpStatus::Success,
            tx.started.elapsed(),
        );
        info!("write {} rolled back on shard {}", tx.id, tx.primary);
        result
    }

    async fn abort(&self, mut tx: TxnHandle, error: CoordError) -> CoordError {
        let _ = tx.session.rollback().await;
        let _ = tx.session.close().await;
        self.locks
            .release_multi(&tx.resource, &tx.lock_shards)
            .await;
        self.active.lock().remove(&tx.id);
        self.oplog.record(
            OpKind::Write,
            Some(tx.primary),
            &tx.sql,
            Some(tx.isolation),
            OpStatus::Failure,
            tx.started.elapsed(),
        );
        error
    }

    /// Replication policy:
    /// - central primary → the row's natural partition;
    /// - partition primary → central, plus the natural partition when the
    ///   primary was an emergency stand-in for it.
    fn replication_targets(&self, primary: ShardId, routing_key: i64) -> Vec<ShardId> {
        let central = self.topology.central();
        let natural = self.topology.natural_partition(routing_key);
        if primary == central {
            if natural != central {
                vec![natural]
            } else {
                Vec::new()
            }
        } else {
            let mut targets = vec![central];
            if primary != natural && natural != central {
                targets.push(natural);
            }
            targets
        }
    }

    async fn replicate_one(
        &self,
        target: ShardId,
        sql: &str,
        isolation: IsolationLevel,
    ) -> Result<()> {
        let mut session = self.connector.connect(target, isolation).await?;
        session.begin().await?;
        session.execute(sql, &[]).await?;
        session.commit().await?;
        session.close().await
    }
}
