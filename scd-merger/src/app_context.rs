use std::time::Duration;

use chrono::{DateTime, Utc};
use scd_core::{EngineError, HistoryStore, RunReport, ScdEngine, SnapshotSource, SourceCursor};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::health::{HealthHandle, HealthRegistry};
use crate::metrics_consts::{BATCHES_READ, EMPTY_POLLS, LOOP_ERRORS, SNAPSHOTS_READ, STALE};

pub struct AppContext<S> {
    pub engine: ScdEngine<S>,
    pub source: Box<dyn SnapshotSource>,
    pub health: HealthRegistry,
    pub liveness: HealthHandle,
    pub status: Mutex<MergerStatus>,
    pub max_batch_size: usize,
    pub metrics: bool,
}

// Transient state, shown on /status
#[derive(Debug, Clone, Serialize, Default)]
pub struct MergerStatus {
    pub last_report: Option<RunReport>,
    pub last_error: Option<String>,
    pub last_error_time: Option<DateTime<Utc>>,
    pub last_successful_run: Option<DateTime<Utc>>,
    pub runs_completed: u64,
    // Last staging row read. Batches made only of unchanged snapshots don't move the engine
    // watermark, and a batch can stop partway through rows sharing a timestamp, so reads resume
    // from here rather than from the watermark.
    pub read_cursor: Option<SourceCursor>,
}

impl<S: HistoryStore + 'static> AppContext<S> {
    pub async fn new(
        engine: ScdEngine<S>,
        source: Box<dyn SnapshotSource>,
        max_batch_size: usize,
        run_interval: Duration,
        metrics: bool,
    ) -> Self {
        let health = HealthRegistry::new("liveness");
        let liveness = health.register("merger".to_string(), run_interval * 4).await;

        Self {
            engine,
            source,
            health,
            liveness,
            status: Mutex::new(MergerStatus::default()),
            max_batch_size: max_batch_size.max(1),
            metrics,
        }
    }

    pub async fn get_status(&self) -> MergerStatus {
        self.status.lock().await.clone()
    }

    /// Reads the next batch past the read cursor and merges it. `None` means the source had
    /// nothing new.
    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<Option<RunReport>, EngineError> {
        let cursor = self.status.lock().await.read_cursor;
        // After a restart only the watermark survives
        let after = match cursor {
            Some(cursor) => Some(cursor),
            None => self.engine.watermark().await?.map(SourceCursor::at_watermark),
        };

        let batch = self.source.next_batch(after, self.max_batch_size).await?;
        if batch.is_empty() {
            debug!(?after, "no new snapshots");
            metrics::counter!(EMPTY_POLLS).increment(1);
            return Ok(None);
        }
        metrics::counter!(BATCHES_READ).increment(1);
        metrics::counter!(SNAPSHOTS_READ).increment(batch.snapshots.len() as u64);

        let report = self.engine.run(batch.snapshots, cancel).await?;

        // Only advanced once the batch is merged, failed runs re-read it
        let mut status = self.status.lock().await;
        status.read_cursor = status.read_cursor.max(batch.cursor);
        Ok(Some(report))
    }

    pub async fn run_loop(&self, interval: Duration, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("merge loop shutting down");
                    return;
                }
                _ = interval.tick() => {}
            }

            let result = self.run_once(&cancel).await;
            self.record(result).await;
            self.report_freshness().await;
            // Failed runs still count as alive, the status page shows why they fail
            self.liveness.report_healthy().await;
        }
    }

    async fn record(&self, result: Result<Option<RunReport>, EngineError>) {
        let mut status = self.status.lock().await;
        match result {
            Ok(Some(report)) => {
                info!(
                    run_id = %report.run_id,
                    created = report.versions_created,
                    quarantined = report.records_quarantined,
                    "merge run complete"
                );
                status.runs_completed += 1;
                status.last_successful_run = Some(report.finished_at);
                status.last_report = Some(report);
            }
            Ok(None) => {}
            Err(EngineError::Cancelled) => {
                info!("merge run cancelled");
            }
            Err(e) => {
                error!("merge run failed with: {}", e);
                metrics::counter!(LOOP_ERRORS).increment(1);
                status.last_error = Some(e.to_string());
                status.last_error_time = Some(Utc::now());
            }
        }
    }

    async fn report_freshness(&self) {
        match self.engine.freshness(Utc::now()).await {
            Ok(freshness) => {
                if freshness.stale {
                    warn!(watermark = ?freshness.watermark, "history table is stale");
                }
                metrics::gauge!(STALE).set(if freshness.stale { 1.0 } else { 0.0 });
            }
            Err(e) => warn!("could not compute freshness: {}", e),
        }
    }
}
