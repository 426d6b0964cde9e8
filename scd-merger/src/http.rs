use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Body,
    extract::{MatchedPath, State},
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use eyre::Result;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use scd_core::{Freshness, HistoryStore, TableStats};
use serde::Serialize;

use crate::app_context::{AppContext, MergerStatus};

pub async fn listen(app: Router, bind: String) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, app).await?;

    Ok(())
}

async fn index() -> &'static str {
    "scd merger"
}

async fn liveness<S: HistoryStore + 'static>(State(context): State<Arc<AppContext<S>>>) -> Response {
    context.health.get_status().into_response()
}

// Not ready while halted on integrity violations
async fn readiness<S: HistoryStore + 'static>(
    State(context): State<Arc<AppContext<S>>>,
) -> Response {
    if context.engine.is_halted() {
        return (StatusCode::SERVICE_UNAVAILABLE, "halted").into_response();
    }
    (StatusCode::OK, "ready").into_response()
}

#[derive(Debug, Serialize)]
pub struct StatusBody {
    pub halted: bool,
    pub merger: MergerStatus,
    pub stats: Option<TableStats>,
    pub freshness: Option<Freshness>,
    pub store_error: Option<String>,
}

async fn status<S: HistoryStore + 'static>(
    State(context): State<Arc<AppContext<S>>>,
) -> Json<StatusBody> {
    let merger = context.get_status().await;
    let mut store_error = None;

    let stats = match context.engine.stats().await {
        Ok(stats) => Some(stats),
        Err(e) => {
            store_error = Some(e.to_string());
            None
        }
    };
    let freshness = match context.engine.freshness(Utc::now()).await {
        Ok(freshness) => Some(freshness),
        Err(e) => {
            store_error = Some(e.to_string());
            None
        }
    };

    Json(StatusBody {
        halted: context.engine.is_halted(),
        merger,
        stats,
        freshness,
        store_error,
    })
}

pub fn app<S: HistoryStore + 'static>(context: Arc<AppContext<S>>) -> Router {
    let metrics_enabled = context.metrics;

    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(readiness::<S>))
        .route("/_liveness", get(liveness::<S>))
        .route("/status", get(status::<S>));

    // The prometheus recorder is global, so tests leave it off
    let router = if metrics_enabled {
        setup_metrics_routes(router)
    } else {
        router
    };

    router.with_state(context)
}

/// Add the prometheus endpoint and middleware to a router, should be called last.
pub fn setup_metrics_routes<T>(router: Router<T>) -> Router<T>
where
    T: Clone + Send + Sync + 'static,
{
    let Some(recorder_handle) = setup_metrics_recorder() else {
        return router;
    };

    router
        .route(
            "/metrics",
            get(move || std::future::ready(recorder_handle.render())),
        )
        .layer(axum::middleware::from_fn(track_metrics))
}

fn setup_metrics_recorder() -> Option<PrometheusHandle> {
    const BUCKETS: &[f64] = &[
        1.0, 5.0, 10.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2000.0, 5000.0, 10000.0,
    ];

    let builder = match PrometheusBuilder::new().set_buckets(BUCKETS) {
        Ok(builder) => builder,
        Err(e) => {
            tracing::error!("invalid histogram buckets: {}", e);
            return None;
        }
    };
    match builder.install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::error!("failed to install prometheus recorder: {}", e);
            None
        }
    }
}

async fn track_metrics(req: Request<Body>, next: Next) -> impl IntoResponse {
    let start = Instant::now();

    let path = if let Some(matched_path) = req.extensions().get::<MatchedPath>() {
        matched_path.as_str().to_owned()
    } else {
        req.uri().path().to_owned()
    };
    let method = req.method().clone();

    let response = next.run(req).await;

    let latency = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();
    let labels = [
        ("method", method.to_string()),
        ("path", path),
        ("status", status),
    ];

    metrics::counter!("http_requests_total", &labels).increment(1);
    metrics::histogram!("http_requests_duration_seconds", &labels).record(latency);

    response
}
