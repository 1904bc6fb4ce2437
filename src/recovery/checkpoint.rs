// Checkpoint store.
//
// Watermarks live in `recovery_checkpoints` on the central shard: one row per
// real shard holding the highest log id known to be terminally processed,
// plus the reserved `node_id = 0` row used as a process-exclusive advisory
// mutex. The mutex value is `-1` when free and the holder's pid otherwise;
// claim and release are single guarded UPDATEs, so exactly one process can
// win a cycle.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::Result;
use crate::shard::{ShardConnector, ShardSession};
use crate::statements as stmt;
use crate::types::{IsolationLevel, ShardId, Value};

/// Mutex row value meaning "free".
const MUTEX_FREE: i64 = -1;

pub struct CheckpointStore {
    connector: Arc<dyn ShardConnector>,
    central: ShardId,
    shards: Vec<ShardId>,
}

impl CheckpointStore {
    pub fn new(connector: Arc<dyn ShardConnector>, central: ShardId, shards: Vec<ShardId>) -> Self {
        Self {
            connector,
            central,
            shards,
        }
    }

    async fn session(&self) -> Result<Box<dyn ShardSession>> {
        self.connector
            .connect(self.central, IsolationLevel::ReadCommitted)
            .await
    }

    /// Creates the mutex row and one watermark row per shard if missing.
    /// Idempotent; first use initializes watermarks to 0.
    pub async fn ensure_rows(&self) -> Result<()> {
        let mut session = self.session().await?;
        session
            .execute(
                stmt::INIT_CHECKPOINT,
                &[Value::Int(0), Value::Int(MUTEX_FREE)],
            )
            .await?;
        for shard in &self.shards {
            session
                .execute(
                    stmt::INIT_CHECKPOINT,
                    &[Value::Int(*shard as i64), Value::Int(0)],
                )
                .await?;
        }
        session.commit().await?;
        session.close().await
    }

    /// Attempts to claim the drain mutex for `pid`. Exactly one concurrent
    /// caller observes true.
    pub async fn claim_mutex(&self, pid: i64) -> Result<bool> {
        let mut session = self.session().await?;
        let claimed = session
            .execute(stmt::CLAIM_RECOVERY_MUTEX, &[Value::Int(pid)])
            .await?;
        session.commit().await?;
        session.close().await?;
        Ok(claimed > 0)
    }

    /// Frees the mutex, but only where the value still equals `pid`.
    pub async fn release_mutex(&self, pid: i64) -> Result<()> {
        let mut session = self.session().await?;
        session
            .execute(stmt::RELEASE_RECOVERY_MUTEX, &[Value::Int(pid)])
            .await?;
        session.commit().await?;
        session.close().await
    }

    /// Operator escape hatch: frees the mutex regardless of holder.
    pub async fn force_release_mutex(&self) -> Result<()> {
        let mut session = self.session().await?;
        session
            .execute(stmt::FORCE_RELEASE_RECOVERY_MUTEX, &[])
            .await?;
        session.commit().await?;
        session.close().await
    }

    /// All per-shard watermarks; shards without a row read as 0.
    pub async fn read_all(&self) -> Result<BTreeMap<ShardId, i64>> {
        let mut session = self.session().await?;
        let rows = session.query(stmt::SELECT_CHECKPOINTS, &[]).await?;
        let _ = session.close().await;

        let mut checkpoints: BTreeMap<ShardId, i64> = self
            .shards
            .iter()
            .map(|shard| (*shard, 0))
            .collect();
        for row in rows {
            let node = row.get("node_id").and_then(Value::as_int);
            let value = row.get("last_processed_log_id").and_then(Value::as_int);
            if let (Some(node), Some(value)) = (node, value) {
                checkpoints.insert(node as ShardId, value);
            }
        }
        Ok(checkpoints)
    }

    /// Advances one watermark. The statement's guard makes regressions a
    /// no-op, so watermarks are monotonically non-decreasing for the life of
    /// the system. Returns true when the row moved.
    pub async fn advance(&self, shard: ShardId, value: i64) -> Result<bool> {
        let mut session = self.session().await?;
        let moved = session
            .execute(
                stmt::ADVANCE_CHECKPOINT,
                &[
                    Value::Int(value),
                    Value::Int(shard as i64),
                    Value::Int(value),
                ],
            )
            .await?;
        session.commit().await?;
        session.close().await?;
        Ok(moved > 0)
    }
}
