use std::sync::Arc;

use axum::Router;
use envconfig::Envconfig;
use eyre::Result;
use futures::future::{select, Either};
use health::{HealthHandle, HealthRegistry};

use taskq_api::config::{Config, StoreBackend};
use taskq_api::router::router;
use taskq_core::engine::EngineConfig;
use taskq_core::store::memory::MemoryStore;
use taskq_core::store::postgres::PgStore;
use taskq_core::store::RecordStore;
use taskq_core::Engine;

async fn listen(app: Router, bind: String) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, app).await?;

    Ok(())
}

/// Single periodic driver for the timeout reaper. The sweep itself logs and
/// swallows per-queue failures; this loop only paces it and reports
/// liveness. Dropped (and thereby cancelled) when the server exits.
async fn reaper_loop<S: RecordStore>(
    engine: Arc<Engine<S>>,
    interval: std::time::Duration,
    liveness: HealthHandle,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        engine.sweep_timeouts().await;
        liveness.report_healthy();
    }
}

async fn serve<S: RecordStore>(store: S, config: Config) {
    let engine = Arc::new(Engine::new(
        Arc::new(store),
        EngineConfig {
            heartbeat_interval_secs: config.heartbeat_interval.0.as_secs_f64(),
            reaper_batch_limit: config.reaper_batch_limit,
        },
    ));

    let liveness = HealthRegistry::new("liveness");
    let reaper_deadline = chrono::Duration::milliseconds(
        (config.periodic_task_interval.0.as_millis() as i64 * 10).max(15_000),
    );
    let reaper_liveness = liveness.register("reaper".to_string(), reaper_deadline);

    let app = router(
        engine.clone(),
        liveness,
        config.allow_unsafe_behavior,
        true,
    );

    let bind = config.bind();
    tracing::info!("listening on {bind}");
    let http_server = Box::pin(listen(app, bind));
    let reaper = Box::pin(reaper_loop(
        engine,
        config.periodic_task_interval.0,
        reaper_liveness,
    ));

    match select(http_server, reaper).await {
        Either::Left((listen_result, _)) => match listen_result {
            Ok(_) => {}
            Err(e) => tracing::error!("failed to start taskq-api http server, {}", e),
        },
        Either::Right((_, _)) => {
            tracing::error!("taskq-api reaper loop exited")
        }
    };
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("failed to load configuration from env");

    match config.store_backend {
        StoreBackend::Postgres => {
            let store = PgStore::new(&config.database_url, config.max_pg_connections)
                .await
                .expect("failed to initialize postgres store");
            serve(store, config).await;
        }
        StoreBackend::Memory => {
            tracing::warn!("running on the in-memory store; state dies with the process");
            serve(MemoryStore::new(), config).await;
        }
    }
}
