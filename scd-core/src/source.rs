use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::PgPool;
use tracing::warn;

use crate::error::StoreError;
use crate::types::Snapshot;

/// Position of the last staging row read. Rows are read in `(effective_from, id)` order, with
/// rows missing a timestamp first, so rows sharing a timestamp can be split across batches
/// without any being skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceCursor {
    pub effective_from: Option<DateTime<Utc>>,
    pub id: i64,
}

impl SourceCursor {
    /// Resume at the start of the watermark instant. Rows there were merged already and replay
    /// as no-ops, but a previous batch may have stopped partway through them.
    pub fn at_watermark(watermark: DateTime<Utc>) -> Self {
        Self {
            effective_from: Some(watermark),
            id: i64::MIN,
        }
    }
}

#[derive(Debug, Default)]
pub struct StagedBatch {
    pub snapshots: Vec<Snapshot>,
    // Position of the last row in the batch, `None` when empty
    pub cursor: Option<SourceCursor>,
}

impl StagedBatch {
    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

/// Produces bounded batches of snapshots, strictly after the cursor. No cursor means reading from
/// the start of the source.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn next_batch(
        &self,
        after: Option<SourceCursor>,
        limit: usize,
    ) -> Result<StagedBatch, StoreError>;
}

#[derive(Debug, sqlx::FromRow)]
struct StagingRow {
    id: i64,
    entity_id: Option<String>,
    attributes: Value,
    effective_from: Option<DateTime<Utc>>,
    is_deleted: bool,
    is_active: bool,
}

/// Reads the staging table the upstream extraction job lands snapshots in.
#[derive(Clone)]
pub struct PgSnapshotSource {
    pool: PgPool,
}

impl PgSnapshotSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

// Staging attributes are loosely typed. Strings pass through, nulls stay absent and anything else
// keeps its JSON text form.
fn attribute_map(row_id: i64, attributes: Value) -> HashMap<String, Option<String>> {
    match attributes {
        Value::Object(object) => object
            .into_iter()
            .map(|(name, value)| {
                let value = match value {
                    Value::Null => None,
                    Value::String(s) => Some(s),
                    other => Some(other.to_string()),
                };
                (name, value)
            })
            .collect(),
        other => {
            warn!(row_id, attributes = %other, "staging attributes are not an object");
            HashMap::new()
        }
    }
}

#[async_trait]
impl SnapshotSource for PgSnapshotSource {
    async fn next_batch(
        &self,
        after: Option<SourceCursor>,
        limit: usize,
    ) -> Result<StagedBatch, StoreError> {
        // Rows missing a timestamp sort first and end up quarantined. Once the cursor has a
        // timestamp they are behind it for good.
        let rows: Vec<StagingRow> = sqlx::query_as(
            r#"
            SELECT id, entity_id, attributes, effective_from, is_deleted, is_active
            FROM scd_staging_snapshots
            WHERE NOT $1
               OR ($2::timestamptz IS NULL AND (effective_from IS NOT NULL OR id > $3))
               OR (effective_from, id) > ($2, $3)
            ORDER BY effective_from NULLS FIRST, id
            LIMIT $4"#,
        )
        .bind(after.is_some())
        .bind(after.and_then(|c| c.effective_from))
        .bind(after.map_or(i64::MIN, |c| c.id))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::query("read staging snapshots", e))?;

        let cursor = rows.last().map(|row| SourceCursor {
            effective_from: row.effective_from,
            id: row.id,
        });
        let snapshots = rows
            .into_iter()
            .map(|row| Snapshot {
                tracked_attributes: attribute_map(row.id, row.attributes),
                entity_id: row.entity_id,
                effective_from: row.effective_from,
                is_deleted: row.is_deleted,
                is_active: row.is_active,
            })
            .collect();

        Ok(StagedBatch { snapshots, cursor })
    }
}
