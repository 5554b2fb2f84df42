//! gleaner server binary.

use anyhow::Context;
use clap::Parser;
use figment::Figment;
use figment::providers::{Format, Toml};
use gleaner_cdc::{CdcIngester, CdcSource, MySqlSource, PostgresSource, SqlVerifier, slot_name};
use gleaner_core::config::{AppConfig, CdcBackend, Schedule};
use gleaner_core::report::CycleStatus;
use gleaner_gc::{GcEngine, next_run_at};
use gleaner_registry::SqliteRegistry;
use gleaner_server::{AppState, create_router};
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Replica server id announced on the MySQL binlog dump connection.
const MYSQL_SERVER_ID: u32 = 100;

/// gleaner - reference-counted garbage collector for S3 buckets
#[derive(Parser, Debug)]
#[command(name = "gleanerd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to an optional TOML configuration file; environment variables
    /// override file values.
    #[arg(short, long, env = "GLEANER_CONFIG", default_value = "config/gleaner.toml")]
    config: String,

    /// Run a single GC cycle and exit instead of serving.
    #[arg(long)]
    once: bool,

    /// Rebuild the reference registry from a full scan of the watched
    /// columns, then exit. Requires a configured CDC database.
    #[arg(long)]
    rebuild: bool,
}

/// Failure classification for process exit codes.
enum AppError {
    /// Exit code 1.
    Config(anyhow::Error),
    /// Exit code 2.
    Runtime(anyhow::Error),
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("gleaner v{}", env!("CARGO_PKG_VERSION"));

    match run(args).await {
        Ok(code) => code,
        Err(AppError::Config(e)) => {
            tracing::error!(error = %format!("{e:#}"), "configuration error");
            ExitCode::from(1)
        }
        Err(AppError::Runtime(e)) => {
            tracing::error!(error = %format!("{e:#}"), "unrecoverable runtime error");
            ExitCode::from(2)
        }
    }
}

async fn run(args: Args) -> Result<ExitCode, AppError> {
    let config = load_config(&args.config).map_err(AppError::Config)?;

    gleaner_server::metrics::register_metrics();

    // Object store, verified reachable before anything else runs.
    let storage = gleaner_storage::from_config(&config)
        .await
        .context("failed to initialize object store")
        .map_err(AppError::Runtime)?;
    storage
        .health_check()
        .await
        .context("object store health check failed")
        .map_err(AppError::Runtime)?;
    tracing::info!(bucket = %config.gc.bucket, "object store initialized");

    // Registry and vault share the vault root on disk.
    let registry = Arc::new(
        SqliteRegistry::open(config.gc.vault_path.join("registry.db"))
            .await
            .context("failed to open reference registry")
            .map_err(AppError::Runtime)?,
    );
    let (vault, blobs) = gleaner_vault::open(&config.gc.vault_path)
        .await
        .context("failed to open vault")
        .map_err(AppError::Runtime)?;
    let vault = Arc::new(vault);
    tracing::info!(vault_path = %config.gc.vault_path.display(), "vault opened");

    // Live verifier and CDC ingester share the DSN when CDC is configured.
    let sql_verifier = match (&config.gc.cdc_backend, &config.gc.cdc_connection_url) {
        (Some(backend), Some(url)) => {
            let verifier = SqlVerifier::connect(*backend, url, config.gc.tables.clone())
                .await
                .context("failed to connect database verifier")
                .map_err(AppError::Config)?;
            Some(Arc::new(verifier))
        }
        _ => None,
    };

    if args.rebuild {
        let Some(verifier) = &sql_verifier else {
            return Err(AppError::Config(anyhow::anyhow!(
                "--rebuild requires a configured CDC database (DATABASE_URL)"
            )));
        };
        let keys = gleaner_cdc::rebuild_from_scan(verifier, &registry)
            .await
            .context("registry rebuild failed")
            .map_err(AppError::Runtime)?;
        tracing::info!(keys = keys, "registry rebuild complete");
        return Ok(ExitCode::SUCCESS);
    }

    let verifier = sql_verifier
        .map(|v| v as Arc<dyn gleaner_cdc::ReferenceVerifier>);

    let cdc_token = CancellationToken::new();
    let cdc_handle = match (&config.gc.cdc_backend, &config.gc.cdc_connection_url) {
        (Some(backend), Some(url)) => {
            let source: Box<dyn CdcSource> = match backend {
                CdcBackend::Postgres => Box::new(
                    PostgresSource::connect_url(
                        url,
                        slot_name(&config.gc.bucket),
                        config.gc.tables.clone(),
                    )
                    .await
                    .context("failed to connect Postgres CDC source")
                    .map_err(AppError::Config)?,
                ),
                CdcBackend::Mysql => Box::new(MySqlSource::new(
                    url.clone(),
                    MYSQL_SERVER_ID,
                    config.gc.tables.clone(),
                )),
            };

            let mut ingester =
                CdcIngester::new(registry.clone(), config.gc.tables.clone(), source);
            // A missing replication slot or bad DSN is fatal here, before the
            // server starts accepting requests.
            ingester
                .connect()
                .await
                .context("failed to open CDC stream")
                .map_err(AppError::Config)?;

            tracing::info!(backend = %backend, "CDC ingester connected");
            Some(tokio::spawn(ingester.run(cdc_token.clone())))
        }
        _ => {
            tracing::info!("no CDC backend configured, running in scan-only mode");
            None
        }
    };

    let engine = Arc::new(GcEngine::new(
        config.gc.clone(),
        storage,
        registry,
        vault,
        blobs,
        verifier,
    ));

    if args.once {
        let code = run_single_cycle(&engine).await?;
        shutdown_cdc(cdc_handle, cdc_token).await;
        return Ok(code);
    }

    // Daily schedule trigger.
    let schedule_token = CancellationToken::new();
    if let Some(schedule) = config.gc.schedule {
        spawn_scheduler(engine.clone(), schedule, schedule_token.clone());
    }

    let state = AppState::new(config.clone(), engine.clone());
    let app = create_router(state);

    let addr: SocketAddr = config
        .server
        .bind
        .parse()
        .context("invalid bind address")
        .map_err(AppError::Config)?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {addr}"))
        .map_err(AppError::Runtime)?;
    tracing::info!("listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")
        .map_err(AppError::Runtime)?;

    // Orderly shutdown: stop the scheduler, cancel any in-flight cycle,
    // drain the ingester's final batch so its checkpoint is flushed.
    tracing::info!("shutting down");
    schedule_token.cancel();
    engine.shutdown();
    shutdown_cdc(cdc_handle, cdc_token).await;

    Ok(ExitCode::SUCCESS)
}

fn load_config(path: &str) -> anyhow::Result<AppConfig> {
    let config_path = std::path::Path::new(path);

    let config = if config_path.exists() {
        tracing::info!(config_path = %path, "loading configuration file");
        let mut config: AppConfig = Figment::new()
            .merge(Toml::file(path))
            .extract()
            .context("failed to parse configuration file")?;
        gleaner_core::env::overlay(&mut config)?;
        config.validate()?;
        config
    } else {
        tracing::info!("no configuration file, using environment variables");
        gleaner_core::env::from_env()?
    };

    Ok(config)
}

async fn run_single_cycle(engine: &GcEngine) -> Result<ExitCode, AppError> {
    let result = engine
        .run_cycle(None)
        .await
        .map_err(|e| AppError::Runtime(anyhow::Error::new(e)))?;
    gleaner_server::metrics::record_cycle_result(&result);

    match serde_json::to_string_pretty(&result) {
        Ok(json) => println!("{json}"),
        Err(e) => tracing::warn!(error = %e, "failed to render cycle result"),
    }

    Ok(match result.status {
        CycleStatus::Completed => ExitCode::SUCCESS,
        CycleStatus::Cancelled => ExitCode::from(3),
    })
}

fn spawn_scheduler(engine: Arc<GcEngine>, schedule: Schedule, token: CancellationToken) {
    tokio::spawn(async move {
        tracing::info!(schedule = %schedule, "daily GC trigger enabled");
        loop {
            let now = time::OffsetDateTime::now_utc();
            let next = next_run_at(now, schedule);
            let wait = std::time::Duration::from_millis(
                (next - now).whole_milliseconds().max(0) as u64,
            );
            tracing::info!(next_run_at = %next, "next scheduled GC cycle");

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }

            match engine.run_cycle(None).await {
                Ok(result) => {
                    gleaner_server::metrics::record_cycle_result(&result);
                    tracing::info!(
                        operation_id = %result.operation_id,
                        deleted = result.deleted_count,
                        "scheduled GC cycle finished"
                    );
                }
                Err(gleaner_gc::GcError::CycleBusy) => {
                    tracing::warn!("scheduled GC cycle skipped: another cycle is running");
                }
                Err(e) => {
                    tracing::error!(error = %e, "scheduled GC cycle failed");
                }
            }
        }
    });
}

async fn shutdown_cdc(
    handle: Option<tokio::task::JoinHandle<()>>,
    token: CancellationToken,
) {
    token.cancel();
    if let Some(handle) = handle {
        if let Err(e) = handle.await {
            tracing::warn!(error = %e, "CDC ingester task did not shut down cleanly");
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => tracing::error!(error = %e, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
