// In-memory shard backend.
//
// A process-local rendition of one relational shard holding the coordinator
// tables (`distributed_lock`, `recovery_log`, `recovery_checkpoints`) and the
// domain `trans` table. Coordinator-owned statements are dispatched by
// template from `crate::statements`; domain statements go through the
// `dialect` parser. Mutations apply eagerly with an undo log, so an open
// transaction rolls back cleanly and a dropped session aborts rather than
// commits.
//
// Outage simulation: a shard marked down rejects connects and fails any open
// session on its next round-trip. A one-shot commit conflict can be injected
// to exercise the duplicate-id retry path the way a racing writer would
// trigger it.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::error::{CoordError, Result};
use crate::shard::connector::{ShardConnector, ShardSession};
use crate::shard::dialect::{self, SelectSpec, TransStatement};
use crate::statements as stmt;
use crate::types::{IsolationLevel, Row, ShardId, Value};

/// A fixed set of in-memory shards sharing one process.
pub struct MemoryCluster {
    shards: BTreeMap<ShardId, Arc<MemoryShard>>,
}

impl MemoryCluster {
    pub fn new(shard_ids: &[ShardId]) -> Self {
        let shards = shard_ids
            .iter()
            .map(|id| (*id, Arc::new(MemoryShard::new(*id))))
            .collect();
        Self { shards }
    }

    /// Three shards with ids 1..=3.
    pub fn three_shards() -> Self {
        Self::new(&[1, 2, 3])
    }

    pub fn shard(&self, id: ShardId) -> Option<Arc<MemoryShard>> {
        self.shards.get(&id).cloned()
    }

    pub fn set_down(&self, id: ShardId, down: bool) {
        if let Some(shard) = self.shards.get(&id) {
            shard.set_down(down);
        }
    }
}

#[async_trait]
impl ShardConnector for MemoryCluster {
    async fn connect(
        &self,
        shard: ShardId,
        isolation: IsolationLevel,
    ) -> Result<Box<dyn ShardSession>> {
        let shard = self
            .shards
            .get(&shard)
            .ok_or(CoordError::InvalidShard(shard))?;
        if shard.is_down() {
            return Err(CoordError::unreachable(shard.id, "shard is down"));
        }
        Ok(Box::new(MemorySession::new(shard.clone(), isolation)))
    }

    fn shard_ids(&self) -> Vec<ShardId> {
        self.shards.keys().copied().collect()
    }
}

#[derive(Debug, Clone)]
struct LockRow {
    holder_id: String,
    lock_time: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct RecoveryRow {
    log_id: i64,
    target: i64,
    source: i64,
    sql: String,
    hash: String,
    timestamp: DateTime<Utc>,
    status: String,
    retry_count: i64,
    error: Option<String>,
}

/// Read-only view of a recovery row, for assertions and diagnostics.
#[derive(Debug, Clone)]
pub struct RecoveryRowView {
    pub log_id: i64,
    pub target: ShardId,
    pub source: ShardId,
    pub sql: String,
    pub hash: String,
    pub status: String,
    pub retry_count: i64,
    pub error: Option<String>,
}

#[derive(Default)]
struct ShardState {
    trans: BTreeMap<i64, Row>,
    locks: BTreeMap<String, LockRow>,
    recovery: BTreeMap<i64, RecoveryRow>,
    next_log_id: i64,
    checkpoints: BTreeMap<i64, i64>,
}

/// One in-memory shard.
pub struct MemoryShard {
    id: ShardId,
    down: AtomicBool,
    state: Mutex<ShardState>,
    commit_conflict: Mutex<Option<Row>>,
}

impl MemoryShard {
    fn new(id: ShardId) -> Self {
        Self {
            id,
            down: AtomicBool::new(false),
            state: Mutex::new(ShardState {
                next_log_id: 1,
                ..ShardState::default()
            }),
            commit_conflict: Mutex::new(None),
        }
    }

    pub fn id(&self) -> ShardId {
        self.id
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn is_down(&self) -> bool {
        self.down.load(Ordering::SeqCst)
    }

    /// Inserts a `trans` row directly, bypassing any session. Seeding only.
    pub fn seed_trans(&self, row: Row) {
        let id = row
            .get("trans_id")
            .and_then(Value::as_int)
            .expect("seed row needs an integer trans_id");
        self.state.lock().trans.insert(id, row);
    }

    pub fn trans_row(&self, trans_id: i64) -> Option<Row> {
        self.state.lock().trans.get(&trans_id).cloned()
    }

    pub fn trans_ids(&self) -> Vec<i64> {
        self.state.lock().trans.keys().copied().collect()
    }

    pub fn lock_row(&self, lock_name: &str) -> Option<(String, DateTime<Utc>)> {
        self.state
            .lock()
            .locks
            .get(lock_name)
            .map(|l| (l.holder_id.clone(), l.lock_time))
    }

    pub fn locks_held_by(&self, holder_id: &str) -> usize {
        self.state
            .lock()
            .locks
            .values()
            .filter(|l| l.holder_id == holder_id)
            .count()
    }

    /// Ages a lock row backwards in time; used to simulate a crashed holder.
    pub fn rewind_lock_time(&self, lock_name: &str, by: chrono::Duration) -> bool {
        let mut state = self.state.lock();
        match state.locks.get_mut(lock_name) {
            Some(lock) => {
                lock.lock_time = lock.lock_time - by;
                true
            }
            None => false,
        }
    }

    pub fn recovery_rows(&self) -> Vec<RecoveryRowView> {
        self.state
            .lock()
            .recovery
            .values()
            .map(|r| RecoveryRowView {
                log_id: r.log_id,
                target: r.target as ShardId,
                source: r.source as ShardId,
                sql: r.sql.clone(),
                hash: r.hash.clone(),
                status: r.status.clone(),
                retry_count: r.retry_count,
                error: r.error.clone(),
            })
            .collect()
    }

    pub fn checkpoint(&self, node_id: i64) -> Option<i64> {
        self.state.lock().checkpoints.get(&node_id).copied()
    }

    /// Arms a one-shot commit failure: the next commit on this shard fails
    /// with a duplicate-key error, its staged work is discarded, and
    /// `winning_row` lands in `trans` as if a concurrent writer won the race.
    pub fn inject_commit_conflict(&self, winning_row: Row) {
        *self.commit_conflict.lock() = Some(winning_row);
    }

    fn take_commit_conflict(&self) -> Option<Row> {
        self.commit_conflict.lock().take()
    }
}

enum UndoOp {
    TransRemove(i64),
    TransRestore(i64, Row),
    LockRemove(String),
    LockRestore(String, LockRow),
    RecoveryRemove(i64),
    RecoveryRestore(i64, RecoveryRow),
    CheckpointRestore(i64, Option<i64>),
    NextLogIdRestore(i64),
}

/// A session against one in-memory shard.
pub struct MemorySession {
    shard: Arc<MemoryShard>,
    isolation: IsolationLevel,
    in_txn: bool,
    undo: Vec<UndoOp>,
    closed: bool,
}

impl MemorySession {
    fn new(shard: Arc<MemoryShard>, isolation: IsolationLevel) -> Self {
        Self {
            shard,
            isolation,
            in_txn: false,
            undo: Vec::new(),
            closed: false,
        }
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    fn check_usable(&self) -> Result<()> {
        if self.closed {
            return Err(CoordError::Internal("session is closed".to_string()));
        }
        if self.shard.is_down() {
            return Err(CoordError::unreachable(self.shard.id, "shard went down"));
        }
        Ok(())
    }

    fn apply_undo(&mut self) {
        let mut state = self.shard.state.lock();
        while let Some(op) = self.undo.pop() {
            match op {
                UndoOp::TransRemove(id) => {
                    state.trans.remove(&id);
                }
                UndoOp::TransRestore(id, row) => {
                    state.trans.insert(id, row);
                }
                UndoOp::LockRemove(name) => {
                    state.locks.remove(&name);
                }
                UndoOp::LockRestore(name, lock) => {
                    state.locks.insert(name, lock);
                }
                UndoOp::RecoveryRemove(id) => {
                    state.recovery.remove(&id);
                }
                UndoOp::RecoveryRestore(id, row) => {
                    state.recovery.insert(id, row);
                }
                UndoOp::CheckpointRestore(node, value) => match value {
                    Some(v) => {
                        state.checkpoints.insert(node, v);
                    }
                    None => {
                        state.checkpoints.remove(&node);
                    }
                },
                UndoOp::NextLogIdRestore(id) => {
                    state.next_log_id = id;
                }
            }
        }
    }

    fn execute_trans(&mut self, parsed: TransStatement) -> Result<u64> {
        let mut state = self.shard.state.lock();
        match parsed {
            TransStatement::Insert { columns, values } => {
                let mut row = Row::new();
                for (col, value) in columns.into_iter().zip(values) {
                    row.insert(col, value);
                }
                let id = row
                    .get("trans_id")
                    .and_then(Value::as_int)
                    .ok_or_else(|| {
                        CoordError::InvalidInput("INSERT without integer trans_id".to_string())
                    })?;
                if state.trans.contains_key(&id) {
                    return Err(CoordError::DuplicateKey(format!("trans_id {}", id)));
                }
                state.trans.insert(id, row);
                self.undo.push(UndoOp::TransRemove(id));
                Ok(1)
            }
            TransStatement::Update { sets, trans_id } => match state.trans.get_mut(&trans_id) {
                Some(row) => {
                    let old = row.clone();
                    for (col, value) in sets {
                        row.insert(col, value);
                    }
                    self.undo.push(UndoOp::TransRestore(trans_id, old));
                    Ok(1)
                }
                None => Ok(0),
            },
            TransStatement::Delete { trans_id } => match state.trans.remove(&trans_id) {
                Some(old) => {
                    self.undo.push(UndoOp::TransRestore(trans_id, old));
                    Ok(1)
                }
                None => Ok(0),
            },
            TransStatement::Select(_) => Err(CoordError::InvalidInput(
                "SELECT passed to execute".to_string(),
            )),
        }
    }

    fn query_trans(&self, spec: SelectSpec) -> Vec<Row> {
        let state = self.shard.state.lock();
        if spec.max_id {
            let max = state.trans.keys().next_back().copied();
            let value = max.map(Value::Int).unwrap_or(Value::Null);
            let mut row = Row::new();
            row.insert("max_id".to_string(), value);
            return vec![row];
        }
        let rows: Vec<Row> = match spec.trans_id {
            Some(id) => state.trans.get(&id).cloned().into_iter().collect(),
            None => state.trans.values().cloned().collect(),
        };
        match spec.limit {
            Some(limit) => rows.into_iter().take(limit).collect(),
            None => rows,
        }
    }
}

fn param_text(params: &[Value], idx: usize) -> Result<String> {
    match params.get(idx) {
        Some(Value::Text(s)) => Ok(s.clone()),
        other => Err(CoordError::InvalidInput(format!(
            "expected text parameter at {}, got {:?}",
            idx, other
        ))),
    }
}

fn param_int(params: &[Value], idx: usize) -> Result<i64> {
    match params.get(idx) {
        Some(Value::Int(n)) => Ok(*n),
        other => Err(CoordError::InvalidInput(format!(
            "expected integer parameter at {}, got {:?}",
            idx, other
        ))),
    }
}

fn param_text_or_null(params: &[Value], idx: usize) -> Result<Option<String>> {
    match params.get(idx) {
        Some(Value::Text(s)) => Ok(Some(s.clone())),
        Some(Value::Null) => Ok(None),
        other => Err(CoordError::InvalidInput(format!(
            "expected text-or-null parameter at {}, got {:?}",
            idx, other
        ))),
    }
}

fn recovery_row_to_result(row: &RecoveryRow) -> Row {
    let mut out = Row::new();
    out.insert("log_id".to_string(), Value::Int(row.log_id));
    out.insert("target_node".to_string(), Value::Int(row.target));
    out.insert("source_node".to_string(), Value::Int(row.source));
    out.insert("sql_statement".to_string(), Value::Text(row.sql.clone()));
    out.insert(
        "transaction_hash".to_string(),
        Value::Text(row.hash.clone()),
    );
    out.insert("timestamp".to_string(), Value::Timestamp(row.timestamp));
    out.insert("status".to_string(), Value::Text(row.status.clone()));
    out.insert("retry_count".to_string(), Value::Int(row.retry_count));
    out.insert(
        "error_message".to_string(),
        row.error
            .clone()
            .map(Value::Text)
            .unwrap_or(Value::Null),
    );
    out
}

#[async_trait]
impl ShardSession for MemorySession {
    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
        self.check_usable()?;

        match sql {
            stmt::INSERT_LOCK => {
                let name = param_text(params, 0)?;
                let holder = param_text(params, 1)?;
                let mut state = self.shard.state.lock();
                if state.locks.contains_key(&name) {
                    return Err(CoordError::DuplicateKey(format!("lock_name {}", name)));
                }
                state.locks.insert(
                    name.clone(),
                    LockRow {
                        holder_id: holder,
                        lock_time: Utc::now(),
                    },
                );
                self.undo.push(UndoOp::LockRemove(name));
                Ok(1)
            }
            stmt::DELETE_LOCK => {
                let name = param_text(params, 0)?;
                let holder = param_text(params, 1)?;
                let mut state = self.shard.state.lock();
                let held = state
                    .locks
                    .get(&name)
                    .map(|l| l.holder_id == holder)
                    .unwrap_or(false);
                match state.locks.remove(&name) {
                    Some(old) if held => {
                        self.undo.push(UndoOp::LockRestore(name, old));
                        Ok(1)
                    }
                    Some(old) => {
                        // holder mismatch: put it back, delete nothing
                        state.locks.insert(name, old);
                        Ok(0)
                    }
                    None => Ok(0),
                }
            }
            stmt::DELETE_LOCKS_BY_HOLDER => {
                let holder = param_text(params, 0)?;
                let mut state = self.shard.state.lock();
                let names: Vec<String> = state
                    .locks
                    .iter()
                    .filter(|(_, l)| l.holder_id == holder)
                    .map(|(name, _)| name.clone())
                    .collect();
                let mut removed = 0;
                for name in names {
                    if let Some(old) = state.locks.remove(&name) {
                        self.undo.push(UndoOp::LockRestore(name, old));
                        removed += 1;
                    }
                }
                Ok(removed)
            }
            stmt::DELETE_LOCKS_OLDER_THAN => {
                let cutoff = params
                    .first()
                    .and_then(Value::as_timestamp)
                    .ok_or_else(|| {
                        CoordError::InvalidInput("expected timestamp parameter".to_string())
                    })?;
                let mut state = self.shard.state.lock();
                let names: Vec<String> = state
                    .locks
                    .iter()
                    .filter(|(_, l)| l.lock_time < cutoff)
                    .map(|(name, _)| name.clone())
                    .collect();
                let mut removed = 0;
                for name in names {
                    if let Some(old) = state.locks.remove(&name) {
                        self.undo.push(UndoOp::LockRestore(name, old));
                        removed += 1;
                    }
                }
                Ok(removed)
            }
            stmt::INSERT_RECOVERY | stmt::INSERT_RECOVERY_BACKUP => {
                let target = param_int(params, 0)?;
                let source = param_int(params, 1)?;
                let sql_statement = param_text(params, 2)?;
                let hash = param_text(params, 3)?;
                let error = if sql == stmt::INSERT_RECOVERY_BACKUP {
                    param_text_or_null(params, 4)?
                } else {
                    None
                };
                let mut state = self.shard.state.lock();
                let log_id = state.next_log_id;
                self.undo.push(UndoOp::NextLogIdRestore(log_id));
                state.next_log_id += 1;
                state.recovery.insert(
                    log_id,
                    RecoveryRow {
                        log_id,
                        target,
                        source,
                        sql: sql_statement,
                        hash,
                        timestamp: Utc::now(),
                        status: "PENDING".to_string(),
                        retry_count: 0,
                        error,
                    },
                );
                self.undo.push(UndoOp::RecoveryRemove(log_id));
                Ok(1)
            }
            stmt::UPDATE_RECOVERY_STATUS => {
                let status = param_text(params, 0)?;
                let error = param_text_or_null(params, 1)?;
                let log_id = param_int(params, 2)?;
                let mut state = self.shard.state.lock();
                match state.recovery.get_mut(&log_id) {
                    Some(row) => {
                        let old = row.clone();
                        row.status = status;
                        row.error = error;
                        self.undo.push(UndoOp::RecoveryRestore(log_id, old));
                        Ok(1)
                    }
                    None => Ok(0),
                }
            }
            stmt::UPDATE_RECOVERY_RETRY => {
                let error = param_text_or_null(params, 0)?;
                let log_id = param_int(params, 1)?;
                let mut state = self.shard.state.lock();
                match state.recovery.get_mut(&log_id) {
                    Some(row) => {
                        let old = row.clone();
                        row.retry_count += 1;
                        row.error = error;
                        self.undo.push(UndoOp::RecoveryRestore(log_id, old));
                        Ok(1)
                    }
                    None => Ok(0),
                }
            }
            stmt::RESET_FAILED => {
                let mut state = self.shard.state.lock();
                let mut reset = 0u64;
                let ids: Vec<i64> = state
                    .recovery
                    .values()
                    .filter(|r| r.status == "FAILED")
                    .map(|r| r.log_id)
                    .collect();
                for id in ids {
                    if let Some(row) = state.recovery.get_mut(&id) {
                        let old = row.clone();
                        row.status = "PENDING".to_string();
                        row.retry_count = 0;
                        row.error = None;
                        self.undo.push(UndoOp::RecoveryRestore(id, old));
                        reset += 1;
                    }
                }
                Ok(reset)
            }
            stmt::INIT_CHECKPOINT => {
                let node = param_int(params, 0)?;
                let value = param_int(params, 1)?;
                let mut state = self.shard.state.lock();
                if state.checkpoints.contains_key(&node) {
                    Ok(0)
                } else {
                    state.checkpoints.insert(node, value);
                    self.undo.push(UndoOp::CheckpointRestore(node, None));
                    Ok(1)
                }
            }
            stmt::CLAIM_RECOVERY_MUTEX => {
                let pid = param_int(params, 0)?;
                let mut state = self.shard.state.lock();
                if state.checkpoints.get(&0) == Some(&-1) {
                    state.checkpoints.insert(0, pid);
                    self.undo.push(UndoOp::CheckpointRestore(0, Some(-1)));
                    Ok(1)
                } else {
                    Ok(0)
                }
            }
            stmt::RELEASE_RECOVERY_MUTEX => {
                let pid = param_int(params, 0)?;
                let mut state = self.shard.state.lock();
                if state.checkpoints.get(&0) == Some(&pid) {
                    state.checkpoints.insert(0, -1);
                    self.undo.push(UndoOp::CheckpointRestore(0, Some(pid)));
                    Ok(1)
                } else {
                    Ok(0)
                }
            }
            stmt::FORCE_RELEASE_RECOVERY_MUTEX => {
                let mut state = self.shard.state.lock();
                match state.checkpoints.get(&0).copied() {
                    Some(old) => {
                        state.checkpoints.insert(0, -1);
                        self.undo.push(UndoOp::CheckpointRestore(0, Some(old)));
                        Ok(1)
                    }
                    None => Ok(0),
                }
            }
            stmt::ADVANCE_CHECKPOINT => {
                let value = param_int(params, 0)?;
                let node = param_int(params, 1)?;
                let mut state = self.shard.state.lock();
                match state.checkpoints.get(&node).copied() {
                    Some(current) if current < value => {
                        state.checkpoints.insert(node, value);
                        self.undo.push(UndoOp::CheckpointRestore(node, Some(current)));
                        Ok(1)
                    }
                    _ => Ok(0),
                }
            }
            _ => match dialect::parse(sql) {
                Some(parsed) => self.execute_trans(parsed),
                None => Err(CoordError::InvalidInput(format!(
                    "unsupported statement: {}",
                    sql
                ))),
            },
        }
    }

    async fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.check_usable()?;

        match sql {
            stmt::PING => {
                let mut row = Row::new();
                row.insert("1".to_string(), Value::Int(1));
                Ok(vec![row])
            }
            stmt::SELECT_LOCK | stmt::SELECT_LOCK_FOR_UPDATE => {
                let name = param_text(params, 0)?;
                let state = self.shard.state.lock();
                Ok(state
                    .locks
                    .get(&name)
                    .map(|l| {
                        let mut row = Row::new();
                        row.insert("lock_name".to_string(), Value::Text(name.clone()));
                        row.insert("holder_id".to_string(), Value::Text(l.holder_id.clone()));
                        row.insert("lock_time".to_string(), Value::Timestamp(l.lock_time));
                        row
                    })
                    .into_iter()
                    .collect())
            }
            stmt::COUNT_RECOVERY_BY_HASH => {
                let hash = param_text(params, 0)?;
                let state = self.shard.state.lock();
                let n = state
                    .recovery
                    .values()
                    .filter(|r| r.hash == hash && (r.status == "PENDING" || r.status == "COMPLETED"))
                    .count();
                let mut row = Row::new();
                row.insert("n".to_string(), Value::Int(n as i64));
                Ok(vec![row])
            }
            stmt::COUNT_PENDING => {
                let state = self.shard.state.lock();
                let n = state
                    .recovery
                    .values()
                    .filter(|r| r.status == "PENDING")
                    .count();
                let mut row = Row::new();
                row.insert("n".to_string(), Value::Int(n as i64));
                Ok(vec![row])
            }
            stmt::SELECT_PENDING_SINCE => {
                let checkpoint = param_int(params, 0)?;
                let state = self.shard.state.lock();
                Ok(state
                    .recovery
                    .values()
                    .filter(|r| r.log_id > checkpoint && r.status == "PENDING")
                    .map(recovery_row_to_result)
                    .collect())
            }
            stmt::STATUS_SUMMARY => {
                let state = self.shard.state.lock();
                let mut counts: BTreeMap<String, i64> = BTreeMap::new();
                for row in state.recovery.values() {
                    *counts.entry(row.status.clone()).or_insert(0) += 1;
                }
                Ok(counts
                    .into_iter()
                    .map(|(status, n)| {
                        let mut row = Row::new();
                        row.insert("status".to_string(), Value::Text(status));
                        row.insert("n".to_string(), Value::Int(n));
                        row
                    })
                    .collect())
            }
            stmt::SELECT_CHECKPOINTS => {
                let state = self.shard.state.lock();
                Ok(state
                    .checkpoints
                    .iter()
                    .filter(|(node, _)| **node > 0)
                    .map(|(node, value)| {
                        let mut row = Row::new();
                        row.insert("node_id".to_string(), Value::Int(*node));
                        row.insert("last_processed_log_id".to_string(), Value::Int(*value));
                        row
                    })
                    .collect())
            }
            _ => match dialect::parse(sql) {
                Some(TransStatement::Select(spec)) => Ok(self.query_trans(spec)),
                Some(_) => Err(CoordError::InvalidInput(
                    "DML passed to query".to_string(),
                )),
                None => Err(CoordError::InvalidInput(format!(
                    "unsupported query: {}",
                    sql
                ))),
            },
        }
    }

    async fn begin(&mut self) -> Result<()> {
        self.check_usable()?;
        self.undo.clear();
        self.in_txn = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        self.check_usable()?;
        if let Some(winning_row) = self.shard.take_commit_conflict() {
            self.apply_undo();
            self.in_txn = false;
            let id = winning_row.get("trans_id").and_then(Value::as_int);
            self.shard.seed_trans(winning_row);
            return Err(CoordError::DuplicateKey(format!(
                "trans_id {}",
                id.unwrap_or_default()
            )));
        }
        self.undo.clear();
        self.in_txn = false;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        if self.closed {
            return Err(CoordError::Internal("session is closed".to_string()));
        }
        self.apply_undo();
        self.in_txn = false;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.apply_undo();
            self.closed = true;
        }
        Ok(())
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        // A dropped session aborts: uncommitted work never becomes visible.
        if !self.undo.is_empty() {
            self.apply_undo();
        }
    }
}
