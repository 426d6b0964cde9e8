use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::config::TrackedAttributes;
use crate::error::StoreError;
use crate::store::HistoryStore;
use crate::types::{MergeOutcome, MergePlan, TableStats, Version};

// Held for the duration of a merge transaction, so two mergers can never interleave their
// writes to the same table
const MERGE_LOCK_KEY: i64 = 0x5CD2_0001;

const VERSION_COLUMNS: &str = "version_id, entity_id, attributes, is_active, effective_from, \
    is_current, is_deleted, sequence_number, processed_at, run_id";

pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("../migrations").run(pool).await
}

#[derive(Debug, sqlx::FromRow)]
struct VersionRow {
    version_id: String,
    entity_id: String,
    attributes: Value,
    is_active: bool,
    effective_from: DateTime<Utc>,
    is_current: bool,
    is_deleted: bool,
    sequence_number: i64,
    processed_at: DateTime<Utc>,
    run_id: Uuid,
}

/// Postgres-backed history store. Attribute values are stored as a JSONB object keyed by
/// attribute name, and laid back out in tracked order on read.
#[derive(Clone)]
pub struct PgHistoryStore {
    pool: PgPool,
    attributes: TrackedAttributes,
}

impl PgHistoryStore {
    pub fn new(pool: PgPool, attributes: TrackedAttributes) -> Self {
        Self { pool, attributes }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn to_json(&self, values: &[Option<String>]) -> Value {
        let object: Map<String, Value> = self
            .attributes
            .names()
            .iter()
            .zip(values.iter())
            .map(|(name, value)| {
                let value = value.clone().map(Value::String).unwrap_or(Value::Null);
                (name.clone(), value)
            })
            .collect();
        Value::Object(object)
    }

    fn to_version(&self, row: VersionRow) -> Result<Version, StoreError> {
        let Value::Object(object) = row.attributes else {
            return Err(StoreError::Malformed(format!(
                "attributes of version {} are not an object",
                row.version_id
            )));
        };
        let values = self
            .attributes
            .names()
            .iter()
            .map(|name| match object.get(name) {
                Some(Value::String(s)) => Some(s.clone()),
                Some(Value::Null) | None => None,
                // Numbers and booleans written by other tools compare as their text form
                Some(other) => Some(other.to_string()),
            })
            .collect();

        Ok(Version {
            version_id: row.version_id,
            entity_id: row.entity_id,
            values,
            is_active: row.is_active,
            effective_from: row.effective_from,
            is_current: row.is_current,
            is_deleted: row.is_deleted,
            sequence_number: row.sequence_number,
            processed_at: row.processed_at,
            run_id: row.run_id,
        })
    }

    fn to_versions(&self, rows: Vec<VersionRow>) -> Result<Vec<Version>, StoreError> {
        rows.into_iter().map(|r| self.to_version(r)).collect()
    }

    async fn apply_in(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        plan: &MergePlan,
    ) -> Result<MergeOutcome, StoreError> {
        let locked: bool = sqlx::query_scalar("SELECT pg_try_advisory_xact_lock($1)")
            .bind(MERGE_LOCK_KEY)
            .fetch_one(&mut **tx)
            .await
            .map_err(|e| StoreError::query("merge lock", e))?;
        if !locked {
            return Err(StoreError::MergeConflict(
                "another merge holds the history lock".to_string(),
            ));
        }

        let mut outcome = MergeOutcome::default();

        if !plan.inserts.is_empty() {
            let mut version_ids = Vec::with_capacity(plan.inserts.len());
            let mut entity_ids = Vec::with_capacity(plan.inserts.len());
            let mut attributes = Vec::with_capacity(plan.inserts.len());
            let mut is_active = Vec::with_capacity(plan.inserts.len());
            let mut effective_from = Vec::with_capacity(plan.inserts.len());
            let mut is_current = Vec::with_capacity(plan.inserts.len());
            let mut is_deleted = Vec::with_capacity(plan.inserts.len());
            let mut sequence_numbers = Vec::with_capacity(plan.inserts.len());
            let mut processed_at = Vec::with_capacity(plan.inserts.len());
            let mut run_ids = Vec::with_capacity(plan.inserts.len());
            for v in &plan.inserts {
                version_ids.push(v.version_id.clone());
                entity_ids.push(v.entity_id.clone());
                attributes.push(self.to_json(&v.values));
                is_active.push(v.is_active);
                effective_from.push(v.effective_from);
                is_current.push(v.is_current);
                is_deleted.push(v.is_deleted);
                sequence_numbers.push(v.sequence_number);
                processed_at.push(v.processed_at);
                run_ids.push(v.run_id);
            }

            let res = sqlx::query(
                r#"
                INSERT INTO scd_versions (version_id, entity_id, attributes, is_active, effective_from,
                                          is_current, is_deleted, sequence_number, processed_at, run_id)
                    (SELECT * FROM UNNEST(
                        $1::text[],
                        $2::text[],
                        $3::jsonb[],
                        $4::boolean[],
                        $5::timestamptz[],
                        $6::boolean[],
                        $7::boolean[],
                        $8::bigint[],
                        $9::timestamptz[],
                        $10::uuid[])) ON CONFLICT (version_id) DO NOTHING"#,
            )
            .bind(&version_ids)
            .bind(&entity_ids)
            .bind(&attributes)
            .bind(&is_active)
            .bind(&effective_from)
            .bind(&is_current)
            .bind(&is_deleted)
            .bind(&sequence_numbers)
            .bind(&processed_at)
            .bind(&run_ids)
            .execute(&mut **tx)
            .await
            .map_err(|e| StoreError::query("insert versions", e))?;
            outcome.inserted = res.rows_affected();
        }

        if !plan.demotions.is_empty() {
            let ids: Vec<String> = plan.demotions.iter().map(|d| d.version_id.clone()).collect();
            let res = sqlx::query(
                "UPDATE scd_versions SET is_current = FALSE WHERE version_id = ANY($1) AND is_current",
            )
            .bind(&ids)
            .execute(&mut **tx)
            .await
            .map_err(|e| StoreError::query("demote versions", e))?;
            outcome.demoted = res.rows_affected();
        }

        if !plan.promotions.is_empty() {
            let ids: Vec<String> = plan.promotions.iter().map(|p| p.version_id.clone()).collect();
            let res = sqlx::query(
                "UPDATE scd_versions SET is_current = TRUE WHERE version_id = ANY($1) AND NOT is_current",
            )
            .bind(&ids)
            .execute(&mut **tx)
            .await
            .map_err(|e| StoreError::query("promote versions", e))?;
            outcome.promoted = res.rows_affected();
        }

        if !plan.resequences.is_empty() {
            let ids: Vec<String> = plan
                .resequences
                .iter()
                .map(|r| r.version_id.clone())
                .collect();
            let seqs: Vec<i64> = plan.resequences.iter().map(|r| r.sequence_number).collect();
            let res = sqlx::query(
                r#"
                UPDATE scd_versions v SET sequence_number = u.sequence_number
                FROM UNNEST($1::text[], $2::bigint[]) AS u(version_id, sequence_number)
                WHERE v.version_id = u.version_id AND v.sequence_number <> u.sequence_number"#,
            )
            .bind(&ids)
            .bind(&seqs)
            .execute(&mut **tx)
            .await
            .map_err(|e| StoreError::query("resequence versions", e))?;
            outcome.resequenced = res.rows_affected();
        }

        let run = &plan.run;
        let recorded = sqlx::query(
            r#"
            INSERT INTO scd_runs (run_id, started_at, records_processed, records_quarantined, anomalies_detected)
            VALUES ($1, $2, $3, $4, $5) ON CONFLICT (run_id) DO NOTHING"#,
        )
        .bind(run.run_id)
        .bind(run.started_at)
        .bind(run.records_processed as i64)
        .bind(run.records_quarantined as i64)
        .bind(run.anomalies_detected as i64)
        .execute(&mut **tx)
        .await
        .map_err(|e| StoreError::query("record run", e))?
        .rows_affected();

        // Quarantine rows belong to the run, so they're only written the first time it lands
        if recorded > 0 && !plan.quarantined.is_empty() {
            let run_ids: Vec<Uuid> = plan.quarantined.iter().map(|q| q.run_id).collect();
            let entity_ids: Vec<Option<String>> =
                plan.quarantined.iter().map(|q| q.entity_id.clone()).collect();
            let effective_from: Vec<Option<DateTime<Utc>>> =
                plan.quarantined.iter().map(|q| q.effective_from).collect();
            let reasons: Vec<String> = plan.quarantined.iter().map(|q| q.reason.clone()).collect();
            let payloads: Vec<Value> = plan.quarantined.iter().map(|q| q.payload.clone()).collect();

            sqlx::query(
                r#"
                INSERT INTO scd_quarantine (run_id, entity_id, effective_from, reason, payload)
                    (SELECT * FROM UNNEST(
                        $1::uuid[],
                        $2::text[],
                        $3::timestamptz[],
                        $4::text[],
                        $5::jsonb[]))"#,
            )
            .bind(&run_ids)
            .bind(&entity_ids)
            .bind(&effective_from)
            .bind(&reasons)
            .bind(&payloads)
            .execute(&mut **tx)
            .await
            .map_err(|e| StoreError::query("quarantine records", e))?;
        }

        Ok(outcome)
    }
}

#[async_trait]
impl HistoryStore for PgHistoryStore {
    async fn tracked_attributes(&self) -> Result<Option<TrackedAttributes>, StoreError> {
        let stored: Option<Vec<String>> =
            sqlx::query_scalar("SELECT tracked_attributes FROM scd_table_config WHERE id = 1")
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| StoreError::query("read table config", e))?;

        stored
            .map(|names| {
                TrackedAttributes::new(names)
                    .map_err(|e| StoreError::Malformed(format!("stored attribute set: {e}")))
            })
            .transpose()
    }

    async fn initialize(&self, attributes: &TrackedAttributes) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO scd_table_config (id, tracked_attributes) VALUES (1, $1) ON CONFLICT (id) DO NOTHING",
        )
        .bind(attributes.names())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::query("initialize table config", e))?;
        Ok(())
    }

    async fn fetch_histories(
        &self,
        entity_ids: &[String],
    ) -> Result<HashMap<String, Vec<Version>>, StoreError> {
        if entity_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let rows: Vec<VersionRow> = sqlx::query_as(&format!(
            "SELECT {VERSION_COLUMNS} FROM scd_versions WHERE entity_id = ANY($1) \
             ORDER BY entity_id, effective_from, is_deleted, version_id"
        ))
        .bind(entity_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::query("fetch histories", e))?;

        let mut histories: HashMap<String, Vec<Version>> = HashMap::new();
        for row in rows {
            let version = self.to_version(row)?;
            histories
                .entry(version.entity_id.clone())
                .or_default()
                .push(version);
        }
        Ok(histories)
    }

    async fn apply(&self, plan: &MergePlan) -> Result<MergeOutcome, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::query("begin merge", e))?;

        // Dropping the transaction on error rolls it back
        let outcome = self.apply_in(&mut tx, plan).await?;

        tx.commit()
            .await
            .map_err(|e| StoreError::query("commit merge", e))?;
        Ok(outcome)
    }

    async fn watermark(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        sqlx::query_scalar(
            "SELECT MAX(effective_from) FROM scd_versions WHERE is_current OR is_deleted",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::query("watermark", e))
    }

    async fn current_state(&self) -> Result<Vec<Version>, StoreError> {
        let rows: Vec<VersionRow> = sqlx::query_as(&format!(
            "SELECT {VERSION_COLUMNS} FROM scd_versions WHERE is_current AND NOT is_deleted \
             ORDER BY entity_id"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::query("current state", e))?;
        self.to_versions(rows)
    }

    async fn history(&self, entity_id: &str) -> Result<Vec<Version>, StoreError> {
        let rows: Vec<VersionRow> = sqlx::query_as(&format!(
            "SELECT {VERSION_COLUMNS} FROM scd_versions WHERE entity_id = $1 ORDER BY sequence_number"
        ))
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::query("entity history", e))?;
        self.to_versions(rows)
    }

    async fn all_versions(&self) -> Result<Vec<Version>, StoreError> {
        let rows: Vec<VersionRow> = sqlx::query_as(&format!(
            "SELECT {VERSION_COLUMNS} FROM scd_versions ORDER BY entity_id, sequence_number"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::query("scan versions", e))?;
        self.to_versions(rows)
    }

    async fn stats(&self) -> Result<TableStats, StoreError> {
        let (total, current, deleted, entities): (i64, i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT COUNT(*),
                   COUNT(*) FILTER (WHERE is_current),
                   COUNT(*) FILTER (WHERE is_deleted),
                   COUNT(DISTINCT entity_id)
            FROM scd_versions"#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::query("table stats", e))?;

        Ok(TableStats {
            total_versions: total as u64,
            current_versions: current as u64,
            deleted_versions: deleted as u64,
            entities: entities as u64,
        })
    }
}
