//! Tiered Cache - operational server
//!
//! Runs one gateway instance over an in-memory source of truth and exposes
//! the operational HTTP surface.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tiered_cache::api::{create_router, AppState};
use tiered_cache::{change_event_bus, spawn_cleanup_task, spawn_event_consumer, CacheGateway, Config, MemorySource};

/// Main entry point for the tiered cache server.
///
/// # Startup Sequence
/// 1. Initialize tracing subscriber for logging
/// 2. Load configuration from environment variables
/// 3. Create the source of truth, change-event bus and gateway
/// 4. Start the event consumer and expiry sweep tasks
/// 5. Create Axum router with all endpoints
/// 6. Start HTTP server on configured port
/// 7. Handle graceful shutdown on SIGINT/SIGTERM
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Defaults to "info" level, can be overridden with RUST_LOG env var
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tiered_cache=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting tiered cache server");

    let config = Config::from_env();
    info!(
        port = config.server_port,
        local_max_entries = config.local_max_entries,
        tier_timeout_ms = config.tier_timeout_ms,
        workers = config.workers(),
        key_version = %config.key_version,
        "Configuration loaded"
    );

    let (publisher, events) = change_event_bus(config.event_bus_capacity);
    let source = Arc::new(MemorySource::new(config.max_hierarchy_depth).with_publisher(publisher.clone()));
    let gateway = CacheGateway::builder(config.clone()).source(source).build();
    info!(instance = gateway.instance_id(), "Cache gateway initialized");

    let consumer_handle = spawn_event_consumer(events, gateway.clone());
    let cleanup_handle = spawn_cleanup_task(gateway.clone(), config.cleanup_interval);
    info!("Background tasks started");

    let app = create_router(AppState::new(gateway, publisher));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server_port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(vec![cleanup_handle, consumer_handle]))
        .await
        .context("server error")?;

    info!("Server shutdown complete");
    Ok(())
}

/// Waits for shutdown signal (Ctrl+C or SIGTERM), then aborts background tasks.
async fn shutdown_signal(tasks: Vec<JoinHandle<()>>) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }

    for task in tasks {
        task.abort();
    }
    warn!("Background tasks aborted");
}
