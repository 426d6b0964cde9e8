use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::error::StoreError;
use crate::metrics_consts::{
    timing_guard, MERGE_ATTEMPT, MERGE_TIME, VERSIONS_DEMOTED, VERSIONS_INSERTED,
    VERSIONS_RESEQUENCED,
};
use crate::store::HistoryStore;
use crate::types::{MergeOutcome, MergePlan};

const MAX_JITTER_MS: u64 = 50;

/// Applies merge plans to the history store, one atomic apply per attempt. Retrying is left to
/// the caller, which re-reads history and re-plans between attempts.
pub struct MergeExecutor<S> {
    store: Arc<S>,
    max_attempts: u32,
    retry_delay_ms: u64,
}

impl<S: HistoryStore> MergeExecutor<S> {
    pub fn new(store: Arc<S>, max_attempts: u32, retry_delay_ms: u64) -> Self {
        Self {
            store,
            max_attempts: max_attempts.max(1),
            retry_delay_ms,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub async fn apply(&self, plan: &MergePlan, attempt: u32) -> Result<MergeOutcome, StoreError> {
        let labels = [("attempt".to_string(), attempt.to_string())];
        let timer = timing_guard(MERGE_TIME, &labels);
        let result = self.store.apply(plan).await;
        timer.fin();

        match &result {
            Ok(outcome) => {
                metrics::counter!(MERGE_ATTEMPT, &[("result", "success")]).increment(1);
                metrics::counter!(VERSIONS_INSERTED).increment(outcome.inserted);
                metrics::counter!(VERSIONS_DEMOTED).increment(outcome.demoted);
                metrics::counter!(VERSIONS_RESEQUENCED).increment(outcome.resequenced);
                info!(
                    run_id = %plan.run.run_id,
                    attempt,
                    inserted = outcome.inserted,
                    demoted = outcome.demoted,
                    promoted = outcome.promoted,
                    resequenced = outcome.resequenced,
                    "merge committed"
                );
            }
            Err(e) if e.is_transient() && attempt < self.max_attempts => {
                metrics::counter!(MERGE_ATTEMPT, &[("result", "retry")]).increment(1);
                warn!(run_id = %plan.run.run_id, attempt, error = %e, "merge failed, will retry");
            }
            Err(e) => {
                metrics::counter!(MERGE_ATTEMPT, &[("result", "failed")]).increment(1);
                warn!(run_id = %plan.run.run_id, attempt, error = %e, "merge failed");
            }
        }

        result
    }

    // Linear backoff with jitter, so competing writers don't retry in lockstep
    pub fn backoff(&self, attempt: u32) -> Duration {
        let jitter = rand::random::<u64>() % MAX_JITTER_MS;
        Duration::from_millis(u64::from(attempt) * self.retry_delay_ms + jitter)
    }
}
