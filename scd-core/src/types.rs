use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// A point-in-time snapshot of one entity, as handed to us by the snapshot source. Identity and
// timestamp are optional here because the source doesn't guarantee them - records missing either
// are quarantined before they reach change detection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub entity_id: Option<String>,
    #[serde(default)]
    pub tracked_attributes: HashMap<String, Option<String>>,
    pub effective_from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

impl Snapshot {
    pub fn new(entity_id: &str, effective_from: DateTime<Utc>) -> Self {
        Self {
            entity_id: Some(entity_id.to_string()),
            tracked_attributes: HashMap::new(),
            effective_from: Some(effective_from),
            is_deleted: false,
            is_active: true,
        }
    }

    pub fn with_attribute(mut self, name: &str, value: &str) -> Self {
        self.tracked_attributes
            .insert(name.to_string(), Some(value.to_string()));
        self
    }

    pub fn deleted(mut self) -> Self {
        self.is_deleted = true;
        self
    }
}

// A snapshot that passed validation, with its tracked values normalized and laid out in the
// configured attribute order. `position` is the index of the record in the incoming batch, so
// anything we quarantine later on can be traced back to the raw input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedSnapshot {
    pub position: usize,
    pub entity_id: String,
    pub values: Vec<Option<String>>,
    pub effective_from: DateTime<Utc>,
    pub is_deleted: bool,
    pub is_active: bool,
}

pub type OrderKey<'a> = (DateTime<Utc>, bool, &'a str);

/// One row of the history table. Everything except `is_current` and `sequence_number` is fixed
/// at creation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub version_id: String,
    pub entity_id: String,
    pub values: Vec<Option<String>>,
    pub is_active: bool,
    pub effective_from: DateTime<Utc>,
    pub is_current: bool,
    pub is_deleted: bool,
    pub sequence_number: i64,
    // Lineage
    pub processed_at: DateTime<Utc>,
    pub run_id: Uuid,
}

impl Version {
    // Total order within an entity. At an equal timestamp a deletion sorts after live states, so
    // it always closes the entity out; remaining ties go to the greater version id.
    pub fn order_key(&self) -> OrderKey<'_> {
        (self.effective_from, self.is_deleted, self.version_id.as_str())
    }

    // Two versions describe the same state if their tracked values and deletion flag agree
    pub fn same_state(&self, values: &[Option<String>], is_deleted: bool) -> bool {
        self.is_deleted == is_deleted && self.values == values
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    First,
    Changed,
    Unchanged,
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Classification::First => write!(f, "first"),
            Classification::Changed => write!(f, "changed"),
            Classification::Unchanged => write!(f, "unchanged"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Demotion {
    pub entity_id: String,
    pub version_id: String,
}

// Only emitted when a touched entity arrives with no current version even though its newest
// version is live, which can't happen through this engine but can through manual edits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Promotion {
    pub entity_id: String,
    pub version_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resequence {
    pub entity_id: String,
    pub version_id: String,
    pub sequence_number: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    // Inserted as history, never promoted
    LateArrival,
    // Late snapshot equal to the version right after it - inserting it would make that version a no-op
    SupersededBySuccessor,
    // A deletion that predates versions we already hold
    DeletionBeforeHistory,
    // A live snapshot for an entity whose history ends in a deletion
    PostDeletion,
}

impl fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnomalyKind::LateArrival => write!(f, "late_arrival"),
            AnomalyKind::SupersededBySuccessor => write!(f, "superseded_by_successor"),
            AnomalyKind::DeletionBeforeHistory => write!(f, "deletion_before_history"),
            AnomalyKind::PostDeletion => write!(f, "post_deletion"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Anomaly {
    pub entity_id: String,
    pub effective_from: DateTime<Utc>,
    pub kind: AnomalyKind,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuarantinedRecord {
    pub run_id: Uuid,
    pub entity_id: Option<String>,
    pub effective_from: Option<DateTime<Utc>>,
    pub reason: String,
    pub payload: serde_json::Value,
}

// Lineage row written alongside the merge, in the same transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub records_processed: u64,
    pub records_quarantined: u64,
    pub anomalies_detected: u64,
}

// Everything the merge executor needs to apply a run, computed up front so the write itself
// is a single atomic step.
#[derive(Debug, Clone, PartialEq)]
pub struct MergePlan {
    pub run: RunRecord,
    pub inserts: Vec<Version>,
    pub demotions: Vec<Demotion>,
    pub promotions: Vec<Promotion>,
    pub resequences: Vec<Resequence>,
    pub quarantined: Vec<QuarantinedRecord>,
}

impl MergePlan {
    pub fn new(run: RunRecord) -> Self {
        Self {
            run,
            inserts: Vec::new(),
            demotions: Vec::new(),
            promotions: Vec::new(),
            resequences: Vec::new(),
            quarantined: Vec::new(),
        }
    }

    // True if applying this plan can't change the history table
    pub fn is_noop(&self) -> bool {
        self.inserts.is_empty()
            && self.demotions.is_empty()
            && self.promotions.is_empty()
            && self.resequences.is_empty()
    }

    pub fn touched_entities(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inserts
            .iter()
            .map(|v| v.entity_id.clone())
            .chain(self.demotions.iter().map(|d| d.entity_id.clone()))
            .chain(self.promotions.iter().map(|p| p.entity_id.clone()))
            .chain(self.resequences.iter().map(|r| r.entity_id.clone()))
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }
}

// Row counts actually changed by a merge. On a retried or replayed run these can be lower than
// the plan's sizes, since inserts of existing ids and repeated demotions are no-ops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeOutcome {
    pub inserted: u64,
    pub demoted: u64,
    pub promoted: u64,
    pub resequenced: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableStats {
    pub total_versions: u64,
    pub current_versions: u64,
    pub deleted_versions: u64,
    pub entities: u64,
}
