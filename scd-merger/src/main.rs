use std::sync::Arc;

use envconfig::Envconfig;
use eyre::Result;
use scd_core::{run_migrations, PgHistoryStore, PgSnapshotSource, ScdEngine};
use scd_merger::{
    app_context::AppContext,
    config::Config,
    http::{app, listen},
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

fn setup_tracing() {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(EnvFilter::from_default_env());
    tracing_subscriber::registry().with(log_layer).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing();
    info!("Starting up...");

    let config = Config::init_from_env()?;
    let engine_config = config.engine_config()?;

    let pool = config.pool_config().connect().await?;
    run_migrations(&pool).await?;

    info!(
        tracked_attributes = ?engine_config.tracked_attributes.names(),
        "merging into scd_versions"
    );

    let store = Arc::new(PgHistoryStore::new(
        pool.clone(),
        engine_config.tracked_attributes.clone(),
    ));
    let engine = ScdEngine::new(engine_config, store);
    // Fail fast on a tracked attribute mismatch rather than on the first tick
    engine.initialize().await?;

    let source = Box::new(PgSnapshotSource::new(pool));
    let run_interval = config.run_interval();
    let context = Arc::new(
        AppContext::new(
            engine,
            source,
            config.max_batch_size,
            run_interval,
            config.export_prometheus,
        )
        .await,
    );

    let cancel = CancellationToken::new();

    let loop_context = context.clone();
    let loop_cancel = cancel.clone();
    let mut merge_loop =
        tokio::spawn(async move { loop_context.run_loop(run_interval, loop_cancel).await });

    let http_server = tokio::spawn(listen(app(context), config.bind()));

    tokio::select! {
        res = &mut merge_loop => {
            error!("merge loop exited");
            if let Err(e) = res {
                error!("merge loop failed with: {}", e)
            }
        }
        res = http_server => {
            error!("http server exited");
            match res {
                Ok(Err(e)) => error!("server failed with: {}", e),
                Err(e) => error!("server task failed with: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received SIGINT, finishing the current run");
            cancel.cancel();
            if let Err(e) = merge_loop.await {
                error!("merge loop failed with: {}", e)
            }
        }
    }

    info!("exiting");
    Ok(())
}
