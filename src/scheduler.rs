//! Timer-driven sweeps that run independently of message traffic: the
//! connectivity reconciliation and the reading retention job.
//!
//! Each run is isolated. A failing row is logged and skipped, a failing run
//! is logged, and the next tick runs as usual.

use crate::connectivity;
use crate::db::StoreError;
use crate::fanout::RealtimeFanout;
use crate::reading_store::ReadingStore;
use crate::sensor_registry::SensorRegistry;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub processed: usize,
    pub changed: usize,
    pub failed: usize,
}

pub struct ReconciliationScheduler {
    registry: Arc<SensorRegistry>,
    fanout: RealtimeFanout,
}

impl ReconciliationScheduler {
    pub fn new(registry: Arc<SensorRegistry>, fanout: RealtimeFanout) -> Self {
        Self { registry, fanout }
    }

    pub fn run_sweep(&self) -> Result<SweepReport, StoreError> {
        self.run_sweep_at(OffsetDateTime::now_utc())
    }

    /// Re-evaluates every active sensor against its type's TTL and writes only
    /// the ones whose state changed.
    pub fn run_sweep_at(&self, now: OffsetDateTime) -> Result<SweepReport, StoreError> {
        let candidates = self.registry.sweep_candidates()?;
        let mut report = SweepReport {
            processed: candidates.len(),
            ..SweepReport::default()
        };

        for candidate in &candidates {
            let Some(target) = connectivity::reconcile(candidate, now) else {
                continue;
            };
            let cutoff = connectivity::cutoff(now, candidate.ttl);
            match self
                .registry
                .apply_reconciled_state(candidate.sensor_id, target, cutoff)
                .and_then(|written| {
                    if written {
                        self.registry.get_sensor(candidate.sensor_id).map(Some)
                    } else {
                        Ok(None)
                    }
                }) {
                Ok(Some(sensor)) => {
                    report.changed += 1;
                    self.fanout.emit_sensor_changed(&sensor);
                }
                Ok(None) => {}
                Err(e) => {
                    report.failed += 1;
                    warn!(sensor_id = candidate.sensor_id, "Reconciliation failed for sensor: {}", e);
                }
            }
        }

        info!(
            processed = report.processed,
            changed = report.changed,
            failed = report.failed,
            "Reconciliation sweep finished."
        );
        Ok(report)
    }
}

/// Runs `job` on the blocking pool every `period` until `shutdown` flips.
/// The first run happens one period after start.
pub fn spawn_periodic<F>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    job: F,
) -> JoinHandle<()>
where
    F: Fn() + Send + Sync + 'static,
{
    let job = Arc::new(job);
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }
            let job = job.clone();
            if let Err(e) = tokio::task::spawn_blocking(move || job()).await {
                error!("{} run panicked: {:?}", name, e);
            }
        }
        info!("{} stopped.", name);
    })
}

pub fn spawn_reconciliation(
    scheduler: Arc<ReconciliationScheduler>,
    period: Duration,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    spawn_periodic("Reconciliation sweep", period, shutdown, move || {
        if let Err(e) = scheduler.run_sweep() {
            error!("Reconciliation sweep failed: {}", e);
        }
    })
}

pub fn spawn_retention(
    readings: Arc<ReadingStore>,
    horizon: time::Duration,
    period: Duration,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    spawn_periodic("Retention sweep", period, shutdown, move || {
        if let Err(e) = readings.sweep_retention(horizon, OffsetDateTime::now_utc()) {
            error!("Retention sweep failed: {}", e);
        }
    })
}
