// Process-wide service wiring.
//
// One `Coordinator` per application instance: it owns the session identity,
// constructs every subsystem against a shared connector, and runs the
// lifecycle `init → serve → … → shutdown`. Subsystems are plain fields so
// embedders inject exactly what a handler needs instead of reaching for
// globals.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{generate_session_id, CoordinatorConfig};
use crate::liveness::LivenessMonitor;
use crate::lock::DistributedLockManager;
use crate::oplog::{OpLog, OpRecord};
use crate::pipeline::{ReadReconstructor, WritePipeline};
use crate::recovery::{RecoveryLogStore, ReplayEngine};
use crate::shard::ShardConnector;
use crate::types::{EvenOddRouter, ShardRouter, Topology};

/// The coordinator service bundle for one application instance.
pub struct Coordinator {
    session_id: String,
    topology: Topology,
    oplog: Arc<OpLog>,
    pub liveness: Arc<LivenessMonitor>,
    pub locks: Arc<DistributedLockManager>,
    pub recovery: Arc<RecoveryLogStore>,
    pub replay: Arc<ReplayEngine>,
    pub writer: WritePipeline,
    pub reader: ReadReconstructor,
    liveness_task: Mutex<Option<JoinHandle<()>>>,
}

impl Coordinator {
    /// Builds a coordinator with even/odd routing over the configured
    /// partition shards.
    pub fn new(config: CoordinatorConfig, connector: Arc<dyn ShardConnector>) -> Self {
        let central = config.central_shard;
        let partitions: Vec<_> = config
            .shard_ids()
            .into_iter()
            .filter(|s| *s != central)
            .collect();
        let even = partitions.first().copied().unwrap_or(central);
        let odd = partitions.get(1).copied().unwrap_or(even);
        Self::with_router(config, connector, Arc::new(EvenOddRouter { even, odd }))
    }

    /// Builds a coordinator with a caller-supplied partition router.
    pub fn with_router(
        config: CoordinatorConfig,
        connector: Arc<dyn ShardConnector>,
        router: Arc<dyn ShardRouter>,
    ) -> Self {
        let session_id = generate_session_id("app");
        let topology = Topology::new(config.central_shard, config.shard_ids(), router);
        let oplog = Arc::new(OpLog::new());

        let liveness = Arc::new(LivenessMonitor::new(
            connector.clone(),
            config.liveness_cache_ttl(),
            config.liveness_interval(),
        ));
        let locks = Arc::new(DistributedLockManager::new(
            connector.clone(),
            session_id.clone(),
        ));
        let recovery = Arc::new(RecoveryLogStore::new(connector.clone(), topology.clone()));
        let replay = Arc::new(ReplayEngine::new(
            connector.clone(),
            topology.clone(),
            recovery.clone(),
            config.isolation_default,
            config.max_recovery_retries,
            config.mutex_warn_after,
        ));
        let writer = WritePipeline::new(
            connector.clone(),
            topology.clone(),
            locks.clone(),
            liveness.clone(),
            recovery.clone(),
            replay.clone(),
            oplog.clone(),
            config.lock_timeout(),
            config.isolation_default,
        );
        let reader = ReadReconstructor::new(
            connector,
            topology.clone(),
            liveness.clone(),
            oplog.clone(),
        );

        Self {
            session_id,
            topology,
            oplog,
            liveness,
            locks,
            recovery,
            replay,
            writer,
            reader,
            liveness_task: Mutex::new(None),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Most recent journal records, newest first.
    pub fn recent_ops(&self, limit: usize) -> Vec<OpRecord> {
        self.oplog.recent(limit)
    }

    /// Startup: remove any lock rows a previous incarnation of this session
    /// id left behind, then drain pending recovery once.
    pub async fn init(&self) {
        let released = self.locks.release_all().await;
        if released > 0 {
            warn!(
                "[{}] released {} leftover locks from a previous run",
                self.session_id, released
            );
        }
        let report = self.replay.drain().await;
        if report.total > 0 {
            info!(
                "[{}] startup drain processed {} recovery entries",
                self.session_id, report.total
            );
        }
        info!("[{}] coordinator initialized", self.session_id);
    }

    /// Starts the background liveness loop.
    pub fn serve(&self) {
        let mut task = self.liveness_task.lock();
        if task.is_none() {
            *task = Some(self.liveness.spawn());
        }
    }

    /// Shutdown: stop the liveness loop, roll nothing forward, and delete
    /// every lock row this session still holds anywhere.
    pub async fn shutdown(&self) {
        self.liveness.stop();
        if let Some(task) = self.liveness_task.lock().take() {
            task.abort();
        }
        let open = self.writer.active_writes();
        if !open.is_empty() {
            warn!(
                "[{}] shutting down with {} writes still open; their sessions roll back on drop",
                self.session_id,
                open.len()
            );
        }
        let released = self.locks.release_all().await;
        info!(
            "[{}] coordinator shut down ({} locks released)",
            self.session_id, released
        );
    }
}
