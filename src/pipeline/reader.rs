// Read reconstruction.
//
// Reads consult the minimum set of live shards. Point reads go to the row's
// natural partition, falling back to central. Scans prefer the central shard
// (authoritative); with central down, the live partition shards are queried,
// their rows unioned, de-duplicated by primary key (first shard wins), sorted
// and truncated. An error from a chosen live shard propagates — there is no
// silent fallback past the authoritative view.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{CoordError, Result};
use crate::liveness::LivenessMonitor;
use crate::oplog::{OpKind, OpLog, OpStatus};
use crate::shard::ShardConnector;
use crate::types::{IsolationLevel, Row, ShardId, Topology, Value};

/// Rows plus the provenance of the answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadResult {
    pub rows: Vec<Row>,
    /// Shards that contributed rows, in consult order.
    pub shards_consulted: Vec<ShardId>,
    /// True when some partition was unreachable and the view may be missing
    /// its rows.
    pub partial: bool,
}

/// Fault-tolerant query answering over the shard set.
pub struct ReadReconstructor {
    connector: Arc<dyn ShardConnector>,
    topology: Topology,
    liveness: Arc<LivenessMonitor>,
    oplog: Arc<OpLog>,
}

impl ReadReconstructor {
    pub fn new(
        connector: Arc<dyn ShardConnector>,
        topology: Topology,
        liveness: Arc<LivenessMonitor>,
        oplog: Arc<OpLog>,
    ) -> Self {
        Self {
            connector,
            topology,
            liveness,
            oplog,
        }
    }

    /// Answers `sql` from the best available shards.
    ///
    /// With a routing key the read is point-style and targets the natural
    /// partition; without one it is scan-style and targets central, or the
    /// partition union when central is down. `limit` caps the returned rows.
    pub async fn fetch(
        &self,
        sql: &str,
        routing_key: Option<i64>,
        limit: usize,
    ) -> Result<ReadResult> {
        let started = Instant::now();
        // Fresh probe, not the cached snapshot: a read issued right after a
        // write must see the shards as they are now.
        let status = self.liveness.status_force().await;
        let live = |shard: &ShardId| status.get(shard).copied().unwrap_or(false);

        let result = match routing_key {
            Some(key) => self.point_read(sql, key, limit, &live).await,
            None => self.scan_read(sql, limit, &live).await,
        };

        self.oplog.record(
            OpKind::Read,
            result
                .as_ref()
                .ok()
                .and_then(|r| r.shards_consulted.first().copied()),
            sql,
            None,
            if result.is_ok() {
                OpStatus::Success
            } else {
                OpStatus::Failure
            },
            started.elapsed(),
        );
        result
    }

    async fn point_read(
        &self,
        sql: &str,
        key: i64,
        limit: usize,
        live: &dyn Fn(&ShardId) -> bool,
    ) -> Result<ReadResult> {
        let natural = self.topology.natural_partition(key);
        let central = self.topology.central();

        let target = if live(&natural) {
            natural
        } else if live(&central) {
            debug!(
                "partition {} offline, answering point read from central",
                natural
            );
            central
        } else {
            return Err(CoordError::Unavailable);
        };

        let mut rows = self.query_shard(target, sql).await?;
        rows.truncate(limit);
        Ok(ReadResult {
            rows,
            shards_consulted: vec![target],
            partial: false,
        })
    }

    async fn scan_read(
        &self,
        sql: &str,
        limit: usize,
        live: &dyn Fn(&ShardId) -> bool,
    ) -> Result<ReadResult> {
        let central = self.topology.central();
        if live(&central) {
            let mut rows = self.query_shard(central, sql).await?;
            rows.truncate(limit);
            return Ok(ReadResult {
                rows,
                shards_consulted: vec![central],
                partial: false,
            });
        }

        let partitions = self.topology.partitions();
        let live_partitions: Vec<ShardId> =
            partitions.iter().copied().filter(|s| live(s)).collect();
        if live_partitions.is_empty() {
            return Err(CoordError::Unavailable);
        }
        info!(
            "central shard offline, reconstructing scan from partitions {:?}",
            live_partitions
        );

        let mut keyed: BTreeMap<i64, Row> = BTreeMap::new();
        let mut unkeyed: Vec<Row> = Vec::new();
        let mut consulted = Vec::new();
        for shard in &live_partitions {
            match self.query_shard(*shard, sql).await {
                Ok(rows) => {
                    consulted.push(*shard);
                    for row in rows {
                        match row.get("trans_id").and_then(Value::as_int) {
                            // first shard to produce a key wins
                            Some(id) => {
                                keyed.entry(id).or_insert(row);
                            }
                            None => unkeyed.push(row),
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        "partition {} failed during scan reconstruction: {}",
                        shard, e
                    );
                }
            }
        }
        if consulted.is_empty() {
            return Err(CoordError::Unavailable);
        }

        let partial = consulted.len() < partitions.len();
        let mut rows: Vec<Row> = keyed.into_values().collect();
        rows.extend(unkeyed);
        rows.truncate(limit);
        Ok(ReadResult {
            rows,
            shards_consulted: consulted,
            partial,
        })
    }

    async fn query_shard(&self, shard: ShardId, sql: &str) -> Result<Vec<Row>> {
        let mut session = self
            .connector
            .connect(shard, IsolationLevel::ReadCommitted)
            .await?;
        let rows = session.query(sql, &[]).await?;
        let _ = session.close().await;
        Ok(rows)
    }
}
