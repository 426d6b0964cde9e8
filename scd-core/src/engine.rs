use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::build::{validate, VersionBuilder};
use crate::config::{EngineConfig, IntegrityPolicy};
use crate::error::{EngineError, StoreError, ValidationError};
use crate::integrity::{AuditScope, IntegrityValidator, IntegrityViolation};
use crate::merge::MergeExecutor;
use crate::metrics_consts::{
    timing_guard, ANOMALIES, ENGINE_HALTED, FETCH_TIME, INTEGRITY_VIOLATIONS, PLANNING_TIME,
    RECORDS_FLAGGED, RECORDS_PROCESSED, RECORDS_QUARANTINED, RUNS, RUN_TIME,
    SNAPSHOTS_CLASSIFIED, WATERMARK_SECONDS,
};
use crate::plan::{EntityPlan, Planner};
use crate::quality::{freshness, Coverage, Freshness};
use crate::report::{sample, RunReport};
use crate::store::HistoryStore;
use crate::types::{
    Anomaly, MergePlan, NormalizedSnapshot, QuarantinedRecord, RunRecord, Snapshot, TableStats,
    Version,
};

/// The incremental merge engine for one history table.
///
/// A run validates a bounded batch, reads the history of exactly the entities in it, plans every
/// entity independently, and commits the result as one atomic merge. Nothing outside the batch's
/// entities is read or written.
pub struct ScdEngine<S> {
    config: Arc<EngineConfig>,
    store: Arc<S>,
    executor: MergeExecutor<S>,
    validator: IntegrityValidator,
    initialized: AtomicBool,
    // Violations that halted the engine, zero while runs are allowed
    halted: AtomicU64,
}

// Everything derived from the batch before history is read. Reused across merge attempts.
struct Prepared {
    groups: HashMap<String, Vec<NormalizedSnapshot>>,
    entity_ids: Vec<String>,
    quarantined: Vec<QuarantinedRecord>,
    flagged: Vec<String>,
}

impl<S: HistoryStore + 'static> ScdEngine<S> {
    pub fn new(config: EngineConfig, store: Arc<S>) -> Self {
        let executor = MergeExecutor::new(
            store.clone(),
            config.merge_max_attempts,
            config.merge_retry_delay_ms,
        );
        Self {
            config: Arc::new(config),
            store,
            executor,
            validator: IntegrityValidator,
            initialized: AtomicBool::new(false),
            halted: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Records the tracked attribute set on a fresh table, or checks it against the recorded one.
    pub async fn initialize(&self) -> Result<(), EngineError> {
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }

        let configured = &self.config.tracked_attributes;
        let stored = match self.store.tracked_attributes().await? {
            Some(stored) => stored,
            None => {
                self.store.initialize(configured).await?;
                // Someone else may have initialised it first
                self.store.tracked_attributes().await?.ok_or_else(|| {
                    StoreError::Malformed("attribute set missing after initialise".to_string())
                })?
            }
        };

        if &stored != configured {
            return Err(EngineError::RebuildRequired {
                stored: stored.names().to_vec(),
                configured: configured.names().to_vec(),
            });
        }

        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire) > 0
    }

    /// Allow runs again after integrity violations have been remediated.
    pub fn resume(&self) {
        let previous = self.halted.swap(0, Ordering::AcqRel);
        if previous > 0 {
            info!(violations = previous, "engine resumed");
        }
        metrics::gauge!(ENGINE_HALTED).set(0.0);
    }

    pub async fn run(
        &self,
        batch: Vec<Snapshot>,
        cancel: &CancellationToken,
    ) -> Result<RunReport, EngineError> {
        let halted = self.halted.load(Ordering::Acquire);
        if halted > 0 {
            return Err(EngineError::Halted(halted));
        }
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        self.initialize().await?;

        let run_timer = timing_guard(RUN_TIME, &[]);
        let run_id = Uuid::now_v7();
        let started_at = Utc::now();
        let builder = VersionBuilder::new(run_id, started_at);
        let coverage = Coverage::of(&batch);
        let prepared = self.prepare(run_id, &batch);

        let mut attempt = 0;
        let (plan, entity_plans, outcome) = loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            let fetch_timer = timing_guard(FETCH_TIME, &[]);
            let stored = self.store.fetch_histories(&prepared.entity_ids).await;
            fetch_timer.fin();
            let stored = match stored {
                Ok(stored) => stored,
                Err(e) => {
                    self.retry_or_fail(e, attempt, cancel).await?;
                    continue;
                }
            };

            let entity_plans = self.plan(prepared.groups.clone(), stored, builder).await?;
            let plan = self.assemble(
                run_id,
                started_at,
                &batch,
                &prepared.quarantined,
                &entity_plans,
            );

            // Last point at which a cancellation leaves no trace
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            match self.executor.apply(&plan, attempt).await {
                Ok(outcome) => break (plan, entity_plans, outcome),
                Err(e) => self.retry_or_fail(e, attempt, cancel).await?,
            }
        };

        let anomalies: Vec<Anomaly> = entity_plans
            .iter()
            .flat_map(|p| p.anomalies.iter().cloned())
            .collect();
        let violations = self.audit_touched(&plan.touched_entities()).await;
        let watermark = match self.store.watermark().await {
            Ok(watermark) => watermark,
            Err(e) => {
                warn!(error = %e, "could not read watermark after merge");
                None
            }
        };

        let sample_size = self.config.quarantine_sample_size;
        let report = RunReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            records_processed: batch.len() as u64,
            first: entity_plans.iter().map(|p| p.first).sum(),
            changed: entity_plans.iter().map(|p| p.changed).sum(),
            unchanged: entity_plans.iter().map(|p| p.unchanged).sum(),
            versions_created: outcome.inserted,
            versions_demoted: outcome.demoted,
            versions_promoted: outcome.promoted,
            versions_resequenced: outcome.resequenced,
            records_quarantined: plan.quarantined.len() as u64,
            records_flagged: prepared.flagged.len() as u64,
            anomalies_detected: anomalies.len() as u64,
            integrity_violations: violations.len() as u64,
            merge_attempts: attempt,
            watermark,
            coverage,
            quarantine_sample: sample(&plan.quarantined, sample_size),
            flagged_sample: sample(&prepared.flagged, sample_size),
            anomaly_sample: sample(&anomalies, sample_size),
            violation_sample: sample(&violations, sample_size),
        };

        self.record_metrics(&report, &anomalies);
        self.enforce_integrity(&violations);
        run_timer.fin();

        info!(
            %run_id,
            records = report.records_processed,
            created = report.versions_created,
            demoted = report.versions_demoted,
            quarantined = report.records_quarantined,
            anomalies = report.anomalies_detected,
            violations = report.integrity_violations,
            "run complete"
        );
        Ok(report)
    }

    fn prepare(&self, run_id: Uuid, batch: &[Snapshot]) -> Prepared {
        let mut groups: HashMap<String, Vec<NormalizedSnapshot>> = HashMap::new();
        let mut quarantined = Vec::new();
        let mut flagged = Vec::new();

        for (position, raw) in batch.iter().enumerate() {
            match validate(&self.config, position, raw) {
                Ok(validated) => {
                    if !validated.issues.is_empty() {
                        let issues: Vec<String> =
                            validated.issues.iter().map(|i| i.to_string()).collect();
                        warn!(
                            entity_id = %validated.snapshot.entity_id,
                            issues = ?issues,
                            "record kept despite validation failure"
                        );
                        flagged.push(format!(
                            "{}: {}",
                            validated.snapshot.entity_id,
                            issues.join("; ")
                        ));
                    }
                    groups
                        .entry(validated.snapshot.entity_id.clone())
                        .or_default()
                        .push(validated.snapshot);
                }
                Err(e) => {
                    warn!(position, error = %e, "quarantining record");
                    quarantined.push(quarantine_record(run_id, raw, &e));
                }
            }
        }

        let mut entity_ids: Vec<String> = groups.keys().cloned().collect();
        entity_ids.sort_unstable();

        Prepared {
            groups,
            entity_ids,
            quarantined,
            flagged,
        }
    }

    async fn plan(
        &self,
        groups: HashMap<String, Vec<NormalizedSnapshot>>,
        stored: HashMap<String, Vec<Version>>,
        builder: VersionBuilder,
    ) -> Result<Vec<EntityPlan>, EngineError> {
        let config = self.config.clone();
        let timer = timing_guard(PLANNING_TIME, &[]);
        let plans = tokio::task::spawn_blocking(move || {
            Planner::new(&config, builder).plan_all(groups, stored)
        })
        .await
        .map_err(|e| EngineError::Planning(e.to_string()))?;
        timer.fin();
        Ok(plans)
    }

    fn assemble(
        &self,
        run_id: Uuid,
        started_at: DateTime<Utc>,
        batch: &[Snapshot],
        validation_quarantine: &[QuarantinedRecord],
        entity_plans: &[EntityPlan],
    ) -> MergePlan {
        let mut quarantined = validation_quarantine.to_vec();
        let mut anomalies = 0;
        let mut plan = MergePlan::new(RunRecord {
            run_id,
            started_at,
            records_processed: batch.len() as u64,
            records_quarantined: 0,
            anomalies_detected: 0,
        });

        for entity in entity_plans {
            let r = &entity.reconciliation;
            plan.inserts.extend(r.inserts.iter().cloned());
            plan.demotions.extend(r.demotions.iter().cloned());
            plan.promotions.extend(r.promotions.iter().cloned());
            plan.resequences.extend(r.resequences.iter().cloned());
            anomalies += entity.anomalies.len() as u64;
            for (position, e) in &entity.rejected {
                if let Some(raw) = batch.get(*position) {
                    quarantined.push(quarantine_record(run_id, raw, e));
                }
            }
        }

        plan.inserts.sort_by(|a, b| {
            (&a.entity_id, a.sequence_number).cmp(&(&b.entity_id, b.sequence_number))
        });
        plan.run.records_quarantined = quarantined.len() as u64;
        plan.run.anomalies_detected = anomalies;
        plan.quarantined = quarantined;
        plan
    }

    async fn retry_or_fail(
        &self,
        error: StoreError,
        attempt: u32,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        if !error.is_transient() {
            return Err(EngineError::Store(error));
        }
        if attempt >= self.executor.max_attempts() {
            return Err(EngineError::RetriesExhausted {
                attempts: attempt,
                source: error,
            });
        }

        let delay = self.executor.backoff(attempt);
        tokio::select! {
            _ = cancel.cancelled() => Err(EngineError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    // A failed audit doesn't undo a committed run, so it's logged rather than returned
    async fn audit_touched(&self, entity_ids: &[String]) -> Vec<IntegrityViolation> {
        if entity_ids.is_empty() {
            return Vec::new();
        }
        match self.audit(AuditScope::Entities(entity_ids.to_vec())).await {
            Ok(violations) => violations,
            Err(e) => {
                error!(error = %e, "post-run audit failed");
                Vec::new()
            }
        }
    }

    fn enforce_integrity(&self, violations: &[IntegrityViolation]) {
        if violations.is_empty() {
            return;
        }
        for v in violations.iter().take(self.config.quarantine_sample_size) {
            warn!(
                invariant = %v.invariant,
                entities = ?v.entity_ids,
                "integrity violation: {}",
                v.description
            );
        }
        if self.config.on_integrity_violation == IntegrityPolicy::Fail {
            error!(
                violations = violations.len(),
                "halting runs until integrity violations are resolved"
            );
            self.halted.store(violations.len() as u64, Ordering::Release);
            metrics::gauge!(ENGINE_HALTED).set(1.0);
        }
    }

    fn record_metrics(&self, report: &RunReport, anomalies: &[Anomaly]) {
        metrics::counter!(RUNS).increment(1);
        metrics::counter!(RECORDS_PROCESSED).increment(report.records_processed);
        metrics::counter!(RECORDS_QUARANTINED).increment(report.records_quarantined);
        metrics::counter!(RECORDS_FLAGGED).increment(report.records_flagged);
        metrics::counter!(SNAPSHOTS_CLASSIFIED, &[("classification", "first")])
            .increment(report.first);
        metrics::counter!(SNAPSHOTS_CLASSIFIED, &[("classification", "changed")])
            .increment(report.changed);
        metrics::counter!(SNAPSHOTS_CLASSIFIED, &[("classification", "unchanged")])
            .increment(report.unchanged);
        for anomaly in anomalies {
            metrics::counter!(ANOMALIES, &[("kind", anomaly.kind.to_string())]).increment(1);
        }
        metrics::counter!(INTEGRITY_VIOLATIONS).increment(report.integrity_violations);
        if let Some(watermark) = report.watermark {
            metrics::gauge!(WATERMARK_SECONDS).set(watermark.timestamp() as f64);
        }
    }

    /// Latest effective_from durably merged into a current or deleted version. Snapshot sources
    /// use it as the lower bound of their next batch.
    pub async fn watermark(&self) -> Result<Option<DateTime<Utc>>, EngineError> {
        Ok(self.store.watermark().await?)
    }

    pub async fn current_state(&self) -> Result<Vec<Version>, EngineError> {
        Ok(self.store.current_state().await?)
    }

    pub async fn history(&self, entity_id: &str) -> Result<Vec<Version>, EngineError> {
        Ok(self.store.history(entity_id).await?)
    }

    pub async fn audit(&self, scope: AuditScope) -> Result<Vec<IntegrityViolation>, EngineError> {
        let versions: Vec<Version> = match scope {
            AuditScope::Table => self.store.all_versions().await?,
            AuditScope::Entities(ids) => self
                .store
                .fetch_histories(&ids)
                .await?
                .into_values()
                .flatten()
                .collect(),
        };
        Ok(self.validator.audit(&versions))
    }

    pub async fn stats(&self) -> Result<TableStats, EngineError> {
        Ok(self.store.stats().await?)
    }

    pub async fn freshness(&self, now: DateTime<Utc>) -> Result<Freshness, EngineError> {
        let watermark = self.store.watermark().await?;
        Ok(freshness(watermark, now, self.config.max_staleness_hours))
    }
}

fn quarantine_record(run_id: Uuid, raw: &Snapshot, reason: &ValidationError) -> QuarantinedRecord {
    QuarantinedRecord {
        run_id,
        entity_id: raw.entity_id.clone(),
        effective_from: raw.effective_from,
        reason: reason.to_string(),
        payload: serde_json::to_value(raw).unwrap_or_default(),
    }
}
