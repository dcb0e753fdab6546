//! weft-server – entry point.
//!
//! Startup order:
//! 1. Parse configuration from environment variables.
//! 2. Initialise structured tracing (JSON in production, pretty in dev).
//! 3. Create the in-process message bus and start the controller.
//! 4. Spawn the generation runtime and the embedded worker (unless
//!    disabled for external-bus deployments).
//! 5. Start the QoS monitor with the configured SLOs.
//! 6. Build the Axum router and start the HTTP server with graceful
//!    shutdown; on exit, drain the worker and stop the runtime.

mod config;
mod error;
mod middleware;
mod node;
mod qos;
mod routes;
mod schemas;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{info, warn};

use weft_bus::{InMemoryBus, MessageBus};
use weft_cluster::controller::{Controller, ControllerConfig, RetryPolicyConfig};

use crate::config::Config;
use crate::node::EmbeddedWorker;
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Configuration ───────────────────────────────────────────────────────
    let cfg = Config::from_env();

    // ── 2. Tracing ─────────────────────────────────────────────────────────────
    // Build the log-level filter, warning loudly if the configured value is
    // not a valid tracing filter expression.
    let env_filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => match cfg.log_level.parse::<tracing_subscriber::EnvFilter>() {
            Ok(f) => f,
            Err(e) => {
                eprintln!(
                    "WARN: WEFT_LOG='{}' is not a valid tracing filter ({}); \
                     falling back to 'info'",
                    cfg.log_level, e
                );
                tracing_subscriber::EnvFilter::new("info")
            }
        },
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true);

    if cfg.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!(version = env!("CARGO_PKG_VERSION"), "weft-server starting");

    // ── 3. Bus + controller ────────────────────────────────────────────────────
    let bus: Arc<dyn MessageBus> = Arc::new(InMemoryBus::new());
    let controller = Controller::start(
        Arc::clone(&bus),
        ControllerConfig {
            strategy: cfg.strategy.clone(),
            request_timeout: cfg.request_timeout,
            streaming_timeout: cfg.streaming_timeout,
            retry: RetryPolicyConfig {
                enabled: cfg.retry_enabled,
                max_retries: cfg.max_retries,
                ..RetryPolicyConfig::default()
            },
            ..ControllerConfig::default()
        },
    )
    .await?;
    info!("controller ready");

    // ── 4. Embedded worker + generation runtime ────────────────────────────────
    let worker = if cfg.embed_worker {
        let worker = EmbeddedWorker::start(Arc::clone(&bus), &cfg).await?;
        Some(worker)
    } else {
        info!("embedded worker disabled; expecting workers on an external bus");
        None
    };

    // ── 5. QoS monitor ─────────────────────────────────────────────────────────
    let qos = qos::start(&cfg);

    // ── 6. HTTP server with graceful shutdown ──────────────────────────────────
    let state = AppState {
        config: Arc::new(cfg.clone()),
        controller,
        qos,
    };
    let app = routes::build(state);
    let addr: SocketAddr = cfg.bind_address.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(worker) = worker {
        worker.shutdown().await;
    }
    bus.disconnect().await;

    info!("weft-server stopped");
    Ok(())
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
