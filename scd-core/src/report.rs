use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::integrity::IntegrityViolation;
use crate::quality::Coverage;
use crate::types::{Anomaly, QuarantinedRecord};

/// What a run did. Counts cover the whole batch; the `*_sample` lists are capped by the
/// configured sample size.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub records_processed: u64,
    pub first: u64,
    pub changed: u64,
    pub unchanged: u64,
    pub versions_created: u64,
    pub versions_demoted: u64,
    pub versions_promoted: u64,
    pub versions_resequenced: u64,
    pub records_quarantined: u64,
    // Kept despite a validation failure, under the warn policy
    pub records_flagged: u64,
    pub anomalies_detected: u64,
    pub integrity_violations: u64,
    pub merge_attempts: u32,
    pub watermark: Option<DateTime<Utc>>,
    pub coverage: Coverage,
    pub quarantine_sample: Vec<QuarantinedRecord>,
    pub flagged_sample: Vec<String>,
    pub anomaly_sample: Vec<Anomaly>,
    pub violation_sample: Vec<IntegrityViolation>,
}

impl RunReport {
    pub fn is_clean(&self) -> bool {
        self.records_quarantined == 0
            && self.records_flagged == 0
            && self.anomalies_detected == 0
            && self.integrity_violations == 0
    }
}

pub(crate) fn sample<T: Clone>(items: &[T], size: usize) -> Vec<T> {
    items.iter().take(size).cloned().collect()
}
