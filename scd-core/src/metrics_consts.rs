use std::time::Instant;

pub const RUNS: &str = "scd_runs";
pub const RECORDS_PROCESSED: &str = "scd_records_processed";
pub const RECORDS_QUARANTINED: &str = "scd_records_quarantined";
pub const RECORDS_FLAGGED: &str = "scd_records_flagged";
// Labeled by classification: first, changed, unchanged
pub const SNAPSHOTS_CLASSIFIED: &str = "scd_snapshots_classified";
// Labeled by anomaly kind
pub const ANOMALIES: &str = "scd_anomalies";
pub const VERSIONS_INSERTED: &str = "scd_versions_inserted";
pub const VERSIONS_DEMOTED: &str = "scd_versions_demoted";
pub const VERSIONS_RESEQUENCED: &str = "scd_versions_resequenced";
// Labeled with result: success, retry, failed
pub const MERGE_ATTEMPT: &str = "scd_merge_attempt";
pub const MERGE_TIME: &str = "scd_merge_ms";
pub const PLANNING_TIME: &str = "scd_planning_ms";
pub const FETCH_TIME: &str = "scd_fetch_histories_ms";
pub const RUN_TIME: &str = "scd_run_ms";
pub const INTEGRITY_VIOLATIONS: &str = "scd_integrity_violations";
pub const ENGINE_HALTED: &str = "scd_engine_halted";
pub const WATERMARK_SECONDS: &str = "scd_watermark_seconds";

// Records the time between creation and drop as a histogram entry, in milliseconds
pub struct TimingGuard<'a> {
    name: &'static str,
    labels: &'a [(String, String)],
    start: Instant,
}

pub fn timing_guard<'a>(
    name: &'static str,
    labels: &'a [(String, String)],
) -> TimingGuard<'a> {
    TimingGuard {
        name,
        labels,
        start: Instant::now(),
    }
}

impl TimingGuard<'_> {
    // Makes the point where the timing is reported explicit
    pub fn fin(self) {}
}

impl Drop for TimingGuard<'_> {
    fn drop(&mut self) {
        metrics::histogram!(self.name, self.labels).record(self.start.elapsed().as_millis() as f64);
    }
}
