// Shard liveness monitoring.
//
// Keeps a best-effort up/down view of every shard. Probes open a short
// session, run a trivial query, and close; the snapshot is cached briefly so
// hot paths do not stampede the shards. A background task re-probes on a
// fixed interval and logs transitions. Probe failures mark a shard down but
// never interrupt in-flight work, and a shard coming back up only produces an
// advisory log line — recovery is driven from the write path, not from here.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::shard::ShardConnector;
use crate::statements;
use crate::types::{IsolationLevel, ShardId};

/// One shard's cached probe result.
#[derive(Debug, Clone, Copy)]
pub struct ShardStatus {
    pub alive: bool,
    pub checked_at: Instant,
}

/// Periodically probes each shard and publishes an up/down snapshot.
pub struct LivenessMonitor {
    connector: Arc<dyn ShardConnector>,
    shards: Vec<ShardId>,
    cache_ttl: Duration,
    interval: Duration,
    ping_timeout: Duration,
    snapshot: DashMap<ShardId, ShardStatus>,
    last_refresh: Mutex<Option<Instant>>,
    running: AtomicBool,
}

impl LivenessMonitor {
    pub fn new(
        connector: Arc<dyn ShardConnector>,
        cache_ttl: Duration,
        interval: Duration,
    ) -> Self {
        let shards = connector.shard_ids();
        Self {
            connector,
            shards,
            cache_ttl,
            interval,
            ping_timeout: Duration::from_secs(10),
            snapshot: DashMap::new(),
            last_refresh: Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    /// Probes one shard: open a session, `SELECT 1`, close.
    ///
    /// Returns true only if the whole round-trip succeeds within the probe
    /// timeout.
    pub async fn ping(&self, shard: ShardId) -> bool {
        let probe = async {
            let mut session = self
                .connector
                .connect(shard, IsolationLevel::ReadCommitted)
                .await?;
            let result = session.query(statements::PING, &[]).await;
            let _ = session.close().await;
            result.map(|_| ())
        };
        match tokio::time::timeout(self.ping_timeout, probe).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                debug!("liveness probe failed for shard {}: {}", shard, e);
                false
            }
            Err(_) => {
                debug!("liveness probe timed out for shard {}", shard);
                false
            }
        }
    }

    /// Re-probes every shard, updating the snapshot and logging transitions.
    pub async fn refresh(&self) -> std::collections::HashMap<ShardId, bool> {
        let mut result = std::collections::HashMap::new();
        for shard in &self.shards {
            let alive = self.ping(*shard).await;
            let previous = self.snapshot.get(shard).map(|s| s.alive);
            match previous {
                Some(false) if alive => info!("shard {} came back online", shard),
                Some(true) if !alive => warn!("shard {} went offline", shard),
                None if !alive => warn!("shard {} is offline", shard),
                _ => {}
            }
            self.snapshot.insert(
                *shard,
                ShardStatus {
                    alive,
                    checked_at: Instant::now(),
                },
            );
            result.insert(*shard, alive);
        }
        *self.last_refresh.lock() = Some(Instant::now());
        result
    }

    /// Returns the cached snapshot, refreshing first if it is older than the
    /// cache TTL (or has never been taken).
    pub async fn status(&self) -> std::collections::HashMap<ShardId, bool> {
        let stale = {
            let last = self.last_refresh.lock();
            match *last {
                Some(at) => at.elapsed() >= self.cache_ttl,
                None => true,
            }
        };
        if stale {
            return self.refresh().await;
        }
        self.shards
            .iter()
            .map(|s| {
                let alive = self.snapshot.get(s).map(|st| st.alive).unwrap_or(false);
                (*s, alive)
            })
            .collect()
    }

    /// Forces a fresh probe of every shard.
    pub async fn status_force(&self) -> std::collections::HashMap<ShardId, bool> {
        self.refresh().await
    }

    /// Spawns the background probe loop. Call `stop` to end it; the task
    /// exits after at most one more interval.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            info!(
                "liveness monitor started (probing every {:?})",
                monitor.interval
            );
            while monitor.running.load(Ordering::SeqCst) {
                monitor.refresh().await;
                tokio::time::sleep(monitor.interval).await;
            }
            info!("liveness monitor stopped");
        })
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}
