use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::Snapshot;

/// Share of a batch carrying the fields every record needs. Reported per run, never enforced -
/// records missing them are quarantined by validation anyway.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Coverage {
    pub records: u64,
    pub with_entity_id: u64,
    pub with_effective_from: u64,
    pub complete: u64,
}

impl Coverage {
    pub fn of(batch: &[Snapshot]) -> Self {
        let mut coverage = Coverage {
            records: batch.len() as u64,
            ..Default::default()
        };
        for snapshot in batch {
            let has_id = snapshot
                .entity_id
                .as_deref()
                .is_some_and(|id| !id.trim().is_empty());
            let has_ts = snapshot.effective_from.is_some();
            coverage.with_entity_id += u64::from(has_id);
            coverage.with_effective_from += u64::from(has_ts);
            coverage.complete += u64::from(has_id && has_ts);
        }
        coverage
    }

    // An empty batch is fully covered
    pub fn ratio(&self) -> f64 {
        if self.records == 0 {
            return 1.0;
        }
        self.complete as f64 / self.records as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Freshness {
    pub watermark: Option<DateTime<Utc>>,
    pub hours_behind: Option<i64>,
    pub stale: bool,
}

/// How far the table lags behind `now`. A table that has never been merged into is stale.
pub fn freshness(
    watermark: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    max_staleness_hours: i64,
) -> Freshness {
    match watermark {
        Some(watermark) => {
            let hours = (now - watermark).num_hours();
            Freshness {
                watermark: Some(watermark),
                hours_behind: Some(hours),
                stale: hours > max_staleness_hours,
            }
        }
        None => Freshness {
            watermark: None,
            hours_behind: None,
            stale: true,
        },
    }
}
