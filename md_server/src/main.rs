//! Tournament schedule server.
//!
//! Runs the schedule engine actor over a durable mutation log and serves
//! operator commands over HTTP and the live schedule over WebSocket.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Error;
use log::info;
use matchday::{
    InMemoryRegistry, LogStore, MemoryLogStore, MutationLog, RealtimeHub, Registry,
    ScheduleEngine,
    db::{Database, PgLogStore},
};
use md_server::{
    api,
    config::{CliOverrides, ServerConfig, StorageConfig},
    logging, metrics,
};
use pico_args::Arguments;

const HELP: &str = "\
Run the tournament schedule server

USAGE:
  md_server [OPTIONS]

OPTIONS:
  --bind       IP:PORT     Server socket bind address  [default: env SERVER_BIND or 127.0.0.1:8080]
  --db-url     URL         Database connection string  [default: env DATABASE_URL]
  --registry   PATH        Registry JSON export        [default: env REGISTRY_PATH]

FLAGS:
  --memory                 Keep the mutation log in memory only
  -h, --help               Print help information

ENVIRONMENT:
  SERVER_BIND              Server bind address (e.g., 0.0.0.0:8080)
  METRICS_BIND             Prometheus listener (e.g., 0.0.0.0:9090)
  DATABASE_URL             PostgreSQL connection string
  REGISTRY_PATH            Registry JSON export
  VENUES / VENUE_COUNT     Venue names (comma-separated) or count
  DAY_START                First match time, RFC 3339
  MATCH_DURATION_SECS      Default match length
  MIN_GAP_SECS             Minimum gap between a competitor's matches
  RUST_LOG                 Log filter (e.g., info,matchday=debug)
";

#[tokio::main]
async fn main() -> Result<(), Error> {
    // Load .env file if it exists
    let _ = dotenvy::dotenv();

    let mut pargs = Arguments::from_env();

    // Help has a higher priority and should be handled separately.
    if pargs.contains(["-h", "--help"]) {
        print!("{HELP}");
        std::process::exit(0);
    }

    let overrides = CliOverrides {
        bind: pargs.opt_value_from_str("--bind")?,
        database_url: pargs.opt_value_from_str("--db-url")?,
        registry: pargs.opt_value_from_str("--registry")?,
        memory: pargs.contains("--memory"),
    };

    logging::init();

    let config = ServerConfig::from_env(overrides)?;
    config.validate()?;

    if let Some(addr) = config.metrics_bind {
        metrics::init_metrics(addr).map_err(|e| anyhow::anyhow!(e))?;
        info!("Prometheus metrics at http://{}/metrics", addr);
    }

    info!("Loading registry from {}", config.registry_path.display());
    let registry: Arc<dyn Registry> = Arc::new(
        InMemoryRegistry::from_json_file(&config.registry_path)
            .map_err(|e| anyhow::anyhow!("Failed to load registry: {}", e))?,
    );
    info!("Registry loaded with {} categories", registry.categories().len());

    let mut database: Option<Database> = None;
    let store: Arc<dyn LogStore> = match &config.storage {
        StorageConfig::Memory => {
            log::warn!("Mutation log is in memory; the schedule is lost on restart");
            Arc::new(MemoryLogStore::new())
        }
        StorageConfig::Postgres(db_config) => {
            let db = Database::new(db_config)
                .await
                .map_err(|e| anyhow::anyhow!("Failed to connect to database: {}", e))?;
            info!("Database connected successfully");

            let store = PgLogStore::new(db.pool().clone());
            store.ensure_schema().await?;
            database = Some(db);
            Arc::new(store)
        }
    };

    let (log, writer) = MutationLog::open(store, config.log.clone()).await?;
    metrics::log_head_seq(log.head_seq().await);

    let (engine, engine_task) =
        ScheduleEngine::start(config.scheduler.clone(), registry.clone(), writer).await?;
    let hub = RealtimeHub::new(log.clone(), config.hub.clone())?;

    // Heartbeat timeouts and reconnect grace periods
    let sweep_hub = hub.clone();
    let sweep_interval = config.sweep_interval;
    let sweep_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_interval);
        loop {
            interval.tick().await;
            let report = sweep_hub.sweep(Instant::now()).await;
            for client in &report.timed_out {
                metrics::realtime_disconnects_total("heartbeat_timeout");
                logging::log_client_event(client, "heartbeat_timeout", None);
            }
            if !report.expired.is_empty() || !report.removed.is_empty() {
                log::debug!(
                    "Hub sweep: {} expired, {} removed",
                    report.expired.len(),
                    report.removed.len()
                );
            }
            metrics::realtime_clients_active(sweep_hub.client_count().await);
        }
    });

    let api_state = api::AppState {
        engine,
        log: log.clone(),
        hub: hub.clone(),
        registry,
    };

    // Create router
    let app = api::create_router(api_state);

    info!("Starting HTTP/WebSocket server on {}", config.bind);
    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind to {}: {}", config.bind, e))?;

    info!(
        "Server is running at http://{} at log seq {}. Press Ctrl+C to stop.",
        config.bind,
        log.head_seq().await
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

    info!("Shutting down server...");

    sweep_task.abort();
    hub.shutdown().await;
    // The engine exits once the last handle is dropped
    match tokio::time::timeout(Duration::from_secs(5), engine_task).await {
        Ok(Ok(())) => info!("Schedule engine stopped"),
        Ok(Err(e)) => log::error!("Schedule engine stopped abnormally: {}", e),
        Err(_) => log::warn!("Schedule engine still busy at shutdown"),
    }
    if let Some(db) = database {
        db.close().await;
    }

    Ok(())
}

/// Graceful shutdown signal
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Failed to install CTRL+C signal handler: {}", e);
        std::future::pending::<()>().await;
    }
}
