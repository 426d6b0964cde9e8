use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::TrackedAttributes;
use crate::error::StoreError;
use crate::types::{MergeOutcome, MergePlan, TableStats, Version};

/// The history table, plus the lineage and quarantine sinks written alongside it.
///
/// Reads are bounded by the entities of a batch, except for the explicitly table-wide
/// `all_versions`, `current_state` and `stats`. `apply` must be all-or-nothing: a failed apply
/// leaves no trace, and re-applying a plan that already landed changes nothing.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// The attribute set the table was initialised with, if it has been.
    async fn tracked_attributes(&self) -> Result<Option<TrackedAttributes>, StoreError>;

    /// Record the attribute set. A no-op if one is already recorded.
    async fn initialize(&self, attributes: &TrackedAttributes) -> Result<(), StoreError>;

    /// All versions of the given entities, keyed by entity id. Entities with no history are absent.
    async fn fetch_histories(
        &self,
        entity_ids: &[String],
    ) -> Result<HashMap<String, Vec<Version>>, StoreError>;

    async fn apply(&self, plan: &MergePlan) -> Result<MergeOutcome, StoreError>;

    /// The latest effective_from that has been durably merged into a current or deleted version.
    async fn watermark(&self) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Current, non-deleted versions, ordered by entity id.
    async fn current_state(&self) -> Result<Vec<Version>, StoreError>;

    /// One entity's versions ordered by sequence number.
    async fn history(&self, entity_id: &str) -> Result<Vec<Version>, StoreError>;

    async fn all_versions(&self) -> Result<Vec<Version>, StoreError>;

    async fn stats(&self) -> Result<TableStats, StoreError>;
}
