use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use tracing::{error, info, warn, Instrument};

use as_core::config::Config;
use as_core::store::{StateDb, StoreError};
use as_core::types::{AgentRole, AgentSession, SessionId, SessionStatus};
use as_telemetry::metrics::{global_metrics, names};
use as_telemetry::tracing_setup::create_operation_span;

use crate::allocator::{AllocatorError, ConvoyAllocator};
use crate::feature::{FeatureError, FeatureLifecycle, ReconcileReport};
use crate::health::{HealthError, HealthMonitor, HealthReport};
use crate::process::{Assignment, CommandProcessManager, ProcessManager};
use crate::shutdown::ShutdownSignal;

/// Coordinator events handled per sweep; the rest wait for the next one.
const MAX_EVENTS_PER_SWEEP: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error(transparent)]
    Health(#[from] HealthError),
    #[error(transparent)]
    Feature(#[from] FeatureError),
    #[error(transparent)]
    Allocator(#[from] AllocatorError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    pub health: HealthReport,
    pub reconcile: Option<ReconcileReport>,
    pub spawned: Vec<SessionId>,
    pub events_drained: usize,
}

/// The polling loop. Every step it takes is a single-shot call into the
/// core; the daemon owns the only timer.
pub struct Daemon {
    config: Config,
    db: StateDb,
    process: Arc<dyn ProcessManager>,
    health: HealthMonitor,
    features: FeatureLifecycle,
    allocator: ConvoyAllocator,
    shutdown: ShutdownSignal,
}

impl Daemon {
    /// Open the configured database, creating its directory if needed.
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let path = config.database_path();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        let db = StateDb::new(&path)
            .await
            .with_context(|| format!("failed to open state database {}", path.display()))?;
        let process: Arc<dyn ProcessManager> = Arc::new(CommandProcessManager::new(
            config.agents.worker_command.clone(),
            path,
        ));
        Ok(Self::with_db(config, db, process))
    }

    pub fn with_db(config: Config, db: StateDb, process: Arc<dyn ProcessManager>) -> Self {
        Self {
            health: HealthMonitor::from_config(&config),
            features: FeatureLifecycle::from_config(&config),
            allocator: ConvoyAllocator::default(),
            shutdown: ShutdownSignal::new(),
            config,
            db,
            process,
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn db(&self) -> &StateDb {
        &self.db
    }

    /// One sweep: health, completion rollup, worker top-up, coordinator
    /// mailbox.
    pub async fn tick(&self) -> Result<SweepReport, DaemonError> {
        let mut report = SweepReport {
            health: self.health.check(&self.db, &self.process).await?,
            ..SweepReport::default()
        };

        if let Some(feature) = self.db.active_feature().await? {
            let rollup = self.features.reconcile(&self.db, feature.id).await?;
            if !rollup.feature_done {
                report.spawned = self.top_up_developers(feature.id).await?;
            }
            report.reconcile = Some(rollup);
        }

        report.events_drained = self.drain_coordinator_events().await?;
        Ok(report)
    }

    /// Start developers until every claimable convoy has a taker or the
    /// configured maximum is reached. Workers claim convoys themselves.
    async fn top_up_developers(&self, feature_id: uuid::Uuid) -> Result<Vec<SessionId>, DaemonError> {
        if self.config.agents.worker_command.is_empty() {
            return Ok(Vec::new());
        }

        let active = self
            .db
            .list_sessions_by_status(SessionStatus::Active)
            .await?
            .into_iter()
            .filter(|s| s.role == AgentRole::Developer)
            .count();
        let idle_room = (self.config.agents.max_developers as usize).saturating_sub(active);
        let waiting = self.allocator.candidates(&self.db, feature_id).await?.len();

        let mut spawned = Vec::new();
        for _ in 0..idle_room.min(waiting) {
            match self
                .process
                .spawn(AgentRole::Developer, &Assignment::default())
                .await
            {
                Ok(id) => {
                    self.db
                        .upsert_session(&AgentSession::new(id.clone(), AgentRole::Developer))
                        .await?;
                    spawned.push(id);
                }
                Err(e) => {
                    warn!(error = %e, "developer spawn failed");
                    break;
                }
            }
        }
        if !spawned.is_empty() {
            info!(count = spawned.len(), "developers started");
        }
        Ok(spawned)
    }

    async fn drain_coordinator_events(&self) -> Result<usize, DaemonError> {
        let target = &self.config.escalation.coordinator_target;
        let queue = self.db.queue();
        let mut drained = 0;
        while drained < MAX_EVENTS_PER_SWEEP {
            let Some(event) = queue.consume(target).await? else {
                break;
            };
            info!(
                event_id = %event.id,
                event_type = %event.event_type,
                payload = %event.payload,
                "coordinator event"
            );
            queue.ack(event.id).await?;
            drained += 1;
        }
        Ok(drained)
    }

    /// Sweep on the polling interval until shutdown is triggered. A failed
    /// sweep is logged and the next one runs on schedule.
    pub async fn run(&self) {
        let period = Duration::from_secs(self.config.agents.polling_interval_secs.max(1));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            polling_interval_secs = period.as_secs(),
            database = %self.config.database_path().display(),
            "daemon running"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let (span, trace_id) = create_operation_span("sweep");
                    let started = Instant::now();
                    match self.tick().instrument(span).await {
                        Ok(report) => tracing::debug!(
                            trace_id = %trace_id,
                            checked = report.health.checked,
                            replaced = report.health.replaced.len(),
                            spawned = report.spawned.len(),
                            events = report.events_drained,
                            "sweep completed"
                        ),
                        Err(e) => error!(trace_id = %trace_id, error = %e, "sweep failed"),
                    }
                    global_metrics().record_histogram(
                        names::SWEEP_DURATION_SECONDS,
                        started.elapsed().as_secs_f64(),
                    );
                }
                _ = self.shutdown.wait() => {
                    info!("daemon stopping");
                    break;
                }
            }
        }

        info!(metrics = %global_metrics().export_prometheus(), "final metrics");
    }
}
