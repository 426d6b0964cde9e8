use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use chrono::{DateTime, TimeZone, Utc};
use http_body_util::BodyExt; // for `collect`
use scd_core::{
    EngineConfig, HistoryStore, InMemoryHistoryStore, IntegrityPolicy, ScdEngine, Snapshot,
    SnapshotSource, SourceCursor, StagedBatch, StoreError,
};
use scd_merger::{app_context::AppContext, http::app};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt; // for `oneshot`

// Serves snapshots in staging order past the cursor, with ids in insertion order, like the
// staging table does
struct VecSource {
    rows: Mutex<Vec<(SourceCursor, Snapshot)>>,
}

impl VecSource {
    fn new(snapshots: Vec<Snapshot>) -> Self {
        let mut rows: Vec<_> = snapshots
            .into_iter()
            .enumerate()
            .map(|(i, snapshot)| {
                let cursor = SourceCursor {
                    effective_from: snapshot.effective_from,
                    id: i as i64 + 1,
                };
                (cursor, snapshot)
            })
            .collect();
        rows.sort_by_key(|(cursor, _)| *cursor);
        Self {
            rows: Mutex::new(rows),
        }
    }
}

#[async_trait]
impl SnapshotSource for VecSource {
    async fn next_batch(
        &self,
        after: Option<SourceCursor>,
        limit: usize,
    ) -> Result<StagedBatch, StoreError> {
        let rows: Vec<_> = self
            .rows
            .lock()
            .await
            .iter()
            .filter(|(cursor, _)| after.map_or(true, |after| *cursor > after))
            .take(limit)
            .cloned()
            .collect();
        Ok(StagedBatch {
            cursor: rows.last().map(|(cursor, _)| *cursor),
            snapshots: rows.into_iter().map(|(_, snapshot)| snapshot).collect(),
        })
    }
}

fn at(month: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, month, 1, 0, 0, 0).unwrap()
}

fn user(id: &str, month: u32, division: &str) -> Snapshot {
    Snapshot::new(id, at(month))
        .with_attribute("division", division)
        .with_attribute("audit_phase", "Phase1")
}

fn engine_config() -> EngineConfig {
    EngineConfig::new("division,audit_phase".parse().unwrap())
}

async fn context(
    config: EngineConfig,
    snapshots: Vec<Snapshot>,
    max_batch_size: usize,
) -> Arc<AppContext<InMemoryHistoryStore>> {
    let engine = ScdEngine::new(config, Arc::new(InMemoryHistoryStore::new()));
    let source = Box::new(VecSource::new(snapshots));
    Arc::new(
        AppContext::new(engine, source, max_batch_size, Duration::from_secs(60), false).await,
    )
}

async fn get(context: Arc<AppContext<InMemoryHistoryStore>>, uri: &str) -> (StatusCode, Vec<u8>) {
    let response = app(context)
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, body.to_vec())
}

#[tokio::test]
async fn index() {
    let context = context(engine_config(), vec![], 10).await;
    let (status, body) = get(context, "/").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], b"scd merger");
}

#[tokio::test]
async fn batches_are_read_past_the_watermark() {
    let snapshots = vec![
        user("U1", 1, "North"),
        user("U2", 1, "North"),
        user("U1", 2, "South"),
        user("U2", 3, "North"),
    ];
    let context = context(engine_config(), snapshots, 2).await;
    let cancel = CancellationToken::new();

    let first = context.run_once(&cancel).await.unwrap().unwrap();
    assert_eq!(first.records_processed, 2);
    assert_eq!(first.versions_created, 2);

    let second = context.run_once(&cancel).await.unwrap().unwrap();
    assert_eq!(second.records_processed, 2);
    assert_eq!(second.versions_created, 1);
    assert_eq!(second.unchanged, 1);

    // The last snapshot was a no-op, the read cursor still moves past it
    assert!(context.run_once(&cancel).await.unwrap().is_none());
    let cursor = context.get_status().await.read_cursor.unwrap();
    assert_eq!(cursor.effective_from, Some(at(3)));
    assert_eq!(context.engine.watermark().await.unwrap(), Some(at(2)));
}

#[tokio::test]
async fn batches_can_split_rows_sharing_a_timestamp() {
    let snapshots = vec![
        user("U1", 1, "North"),
        user("U2", 2, "North"),
        user("U3", 2, "South"),
    ];
    let context = context(engine_config(), snapshots, 2).await;
    let cancel = CancellationToken::new();

    let first = context.run_once(&cancel).await.unwrap().unwrap();
    assert_eq!(first.records_processed, 2);
    assert_eq!(context.engine.watermark().await.unwrap(), Some(at(2)));

    let second = context.run_once(&cancel).await.unwrap().unwrap();
    assert_eq!(second.records_processed, 1);
    assert_eq!(second.versions_created, 1);
    assert!(context.run_once(&cancel).await.unwrap().is_none());

    for id in ["U1", "U2", "U3"] {
        let history = context.engine.history(id).await.unwrap();
        assert_eq!(history.len(), 1, "{id}");
        assert!(history[0].is_current);
    }
}

#[tokio::test]
async fn restarts_resume_within_the_watermark_instant() {
    let snapshots = vec![
        user("U1", 1, "North"),
        user("U2", 2, "North"),
        user("U3", 2, "South"),
    ];
    let engine = ScdEngine::new(engine_config(), Arc::new(InMemoryHistoryStore::new()));
    let cancel = CancellationToken::new();
    // A previous process stopped after the first two rows
    engine
        .run(snapshots[..2].to_vec(), &cancel)
        .await
        .unwrap();

    let source = Box::new(VecSource::new(snapshots));
    let context = AppContext::new(engine, source, 10, Duration::from_secs(60), false).await;
    let report = context.run_once(&cancel).await.unwrap().unwrap();
    // U2 replays as a no-op, U3 was never merged
    assert_eq!(report.records_processed, 2);
    assert_eq!(report.versions_created, 1);
    assert_eq!(context.engine.history("U3").await.unwrap().len(), 1);
}

#[tokio::test]
async fn status_reports_the_last_run_and_table_health() {
    let context = context(engine_config(), vec![user("U1", 1, "North")], 10).await;
    let cancel = CancellationToken::new();

    let runner = context.clone();
    let run_cancel = cancel.clone();
    let handle =
        tokio::spawn(async move { runner.run_loop(Duration::from_secs(60), run_cancel).await });

    // The first tick fires immediately
    let deadline = Utc::now() + chrono::Duration::seconds(5);
    while context.get_status().await.runs_completed == 0 && Utc::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cancel.cancel();
    handle.await.unwrap();

    let (status, body) = get(context.clone(), "/status").await;
    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["halted"], Value::Bool(false));
    assert_eq!(body["merger"]["runs_completed"], 1);
    assert_eq!(body["merger"]["last_report"]["versions_created"], 1);
    assert_eq!(body["stats"]["current_versions"], 1);
    // A 2024 watermark is well past the staleness window
    assert_eq!(body["freshness"]["stale"], Value::Bool(true));

    let (status, _) = get(context, "/_readiness").await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn liveness_follows_the_merge_loop() {
    let context = context(engine_config(), vec![], 10).await;
    let (status, _) = get(context.clone(), "/_liveness").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

    context.liveness.report_healthy().await;
    let deadline = Utc::now() + chrono::Duration::seconds(5);
    while !context.health.get_status().healthy && Utc::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let (status, _) = get(context, "/_liveness").await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn halted_engines_are_not_ready() {
    let mut config = engine_config();
    config.on_integrity_violation = IntegrityPolicy::Fail;
    let snapshots = vec![
        user("U1", 1, "North"),
        user("U1", 2, "South"),
        user("U1", 3, "West"),
    ];
    let context = context(config, snapshots, 1).await;
    let cancel = CancellationToken::new();

    context.run_once(&cancel).await.unwrap();
    context.run_once(&cancel).await.unwrap();
    // Make the first version repeat the second, out of band
    let store = context.engine.store().clone();
    let first = store.history("U1").await.unwrap()[0].version_id.clone();
    store
        .tamper("U1", &first, |v| v.values[0] = Some("South".to_string()))
        .await;
    let report = context.run_once(&cancel).await.unwrap().unwrap();
    assert_eq!(report.integrity_violations, 1);
    assert!(context.engine.is_halted());

    let (status, _) = get(context.clone(), "/_readiness").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    let (_, body) = get(context, "/status").await;
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["halted"], Value::Bool(true));
}
