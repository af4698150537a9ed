//! murmur-server – entry point.
//!
//! Startup order:
//! 1. Parse configuration from environment variables.
//! 2. Initialise structured tracing (JSON or human-readable, optional file).
//! 3. Select the speech backend; invalid settings abort startup.
//! 4. Open the SQLite task store and run pending migrations.
//! 5. Start the orchestrator, which re-queues unfinished tasks.
//! 6. Build the Axum router and serve until SIGINT/SIGTERM.
//! 7. Stop the orchestrator, giving running attempts a grace period.

mod config;
mod db;
mod error;
mod middleware;
mod routes;
mod schemas;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use murmur_core::{Orchestrator, WavFileSink, select_backend};
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Layer, fmt};

use crate::config::Config;
use crate::db::sqlite::SqliteTaskStore;
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Configuration ───────────────────────────────────────────────────────
    let cfg = Config::from_env()?;

    // ── 2. Tracing ─────────────────────────────────────────────────────────────
    // Held until exit so buffered file output is flushed.
    let _log_guard = init_tracing(&cfg);

    info!(version = env!("CARGO_PKG_VERSION"), "murmur-server starting");

    // ── 3. Speech backend ──────────────────────────────────────────────────────
    let backend = select_backend(&cfg.backend).inspect_err(|e| {
        error!(error = %e, "invalid speech backend configuration");
    })?;

    // ── 4. Task store and audio sink ───────────────────────────────────────────
    let store = Arc::new(SqliteTaskStore::connect(&cfg.database_url).await?);
    info!(database_url = %cfg.database_url, "database ready");

    let sink = WavFileSink::new(&cfg.audio_dir)?;
    info!(audio_dir = %sink.dir().display(), "audio directory ready");

    // ── 5. Orchestrator ────────────────────────────────────────────────────────
    let orchestrator = Orchestrator::start(
        cfg.orchestrator.clone(),
        backend,
        store.clone(),
        Arc::new(sink),
    )
    .await?;
    info!(
        workers = cfg.orchestrator.workers,
        queue_capacity = cfg.orchestrator.queue_capacity,
        "orchestrator started"
    );

    // ── 6. HTTP server with graceful shutdown ──────────────────────────────────
    let state = Arc::new(AppState {
        config: Arc::new(cfg.clone()),
        orchestrator: orchestrator.clone(),
    });
    let app = routes::build(state);
    let addr: SocketAddr = cfg.bind_address.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // ── 7. Drain ───────────────────────────────────────────────────────────────
    orchestrator.shutdown().await;
    store.close().await;

    info!("murmur-server stopped");
    Ok(())
}

/// Install the global subscriber.
///
/// `RUST_LOG` wins over `MURMUR_LOG`; an unparsable filter falls back to
/// `info` with a warning on stderr.
fn init_tracing(cfg: &Config) -> Option<WorkerGuard> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => match cfg.log_level.parse::<EnvFilter>() {
            Ok(f) => f,
            Err(e) => {
                eprintln!(
                    "WARN: MURMUR_LOG='{}' is not a valid tracing filter ({}); \
                     falling back to 'info'",
                    cfg.log_level, e
                );
                EnvFilter::new("info")
            }
        },
    };

    let stdout_layer = if cfg.log_json {
        fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .boxed()
    } else {
        fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .boxed()
    };

    let (file_layer, guard) = match &cfg.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "murmur-server.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(stdout_layer)
        .with(file_layer)
        .with(env_filter)
        .init();
    guard
}

/// Returns a future that resolves when SIGINT (Ctrl-C) or SIGTERM is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install CTRL+C signal handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => warn!(error = %e, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received; starting graceful shutdown");
}
