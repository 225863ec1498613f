//! Tally
//!
//! HTTP server for live blind-estimation rooms.
//!
//! # Servers
//!
//! A single HTTP listener (default: 0.0.0.0:8090) serves:
//! - Room routes under `/api/v1/rooms` including SSE subscription streams
//! - `/health` and `/ready` probes
//! - `/metrics` in Prometheus text format
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize tracing
//! 3. Initialize Prometheus metrics recorder
//! 4. Create the `RoomRegistry` and spawn the inactive-room sweeper
//! 5. Bind and serve HTTP
//! 6. Wait for shutdown signal, then tear down every room

#![warn(clippy::pedantic)]

use std::sync::Arc;

use axum::Router;
use tally_service::config::Config;
use tally_service::http::{build_routes, AppState};
use tally_service::observability::{health_router, init_metrics_recorder, HealthState};
use tally_service::room::{run_sweeper, RoomRegistry};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Configuration is read first so the log format can follow it.
    let config = Config::from_env();
    let log_json = config.as_ref().is_ok_and(|c| c.log_json);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tally_service=debug,tower_http=debug".into()),
        )
        .with(log_json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!log_json).then(tracing_subscriber::fmt::layer))
        .init();

    info!("Starting Tally");

    let config = config.map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        http_bind_address = %config.http_bind_address,
        max_rooms = config.max_rooms,
        max_participants = config.room.max_participants,
        subscriber_queue_depth = config.room.subscriber_queue_depth,
        broadcaster_mailbox = config.room.broadcaster_mailbox,
        inactive_room_retention_secs = config.inactive_room_retention.as_secs(),
        sweep_interval_secs = config.sweep_interval.as_secs(),
        "Configuration loaded successfully"
    );

    // Must happen before any metrics are recorded
    info!("Initializing Prometheus metrics recorder...");
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;
    info!("Prometheus metrics recorder initialized");

    let shutdown_token = CancellationToken::new();

    let registry = Arc::new(RoomRegistry::new(
        config.room,
        config.max_rooms,
        shutdown_token.child_token(),
    ));
    let health_state = Arc::new(HealthState::new(Arc::clone(&registry)));

    let sweeper_handle = tokio::spawn(run_sweeper(
        Arc::clone(&registry),
        config.sweep_interval,
        config.inactive_room_retention,
        shutdown_token.child_token(),
    ));

    let metrics_router = Router::new().route(
        "/metrics",
        axum::routing::get(move || {
            let handle = prometheus_handle.clone();
            async move { handle.render() }
        }),
    );
    let app = build_routes(Arc::new(AppState {
        registry: Arc::clone(&registry),
    }))
    .merge(health_router(Arc::clone(&health_state)))
    .merge(metrics_router);

    // Bind before spawning so bind errors fail startup
    let listener = tokio::net::TcpListener::bind(&config.http_bind_address)
        .await
        .map_err(|e| {
            error!(
                error = %e,
                addr = %config.http_bind_address,
                "Failed to bind HTTP server"
            );
            e
        })?;
    info!(addr = %config.http_bind_address, "HTTP server listening");

    let http_shutdown = shutdown_token.clone();
    let http_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { http_shutdown.cancelled().await })
            .await
        {
            error!(error = %e, "HTTP server error");
        }
        info!("HTTP server stopped");
    });

    health_state.set_ready();
    info!("Tally ready");

    shutdown_signal().await;
    info!("Shutdown signal received, beginning graceful shutdown...");
    health_state.set_not_ready();

    // Rooms are torn down first so open SSE streams end and the HTTP
    // server's graceful shutdown is not held open by them.
    let stopped_cleanly = registry.shutdown(config.shutdown_timeout).await;
    if !stopped_cleanly {
        warn!(
            timeout_secs = config.shutdown_timeout.as_secs(),
            "Some broadcasters did not stop within the shutdown timeout"
        );
    }

    shutdown_token.cancel();

    if tokio::time::timeout(config.shutdown_timeout, http_handle)
        .await
        .is_err()
    {
        warn!("HTTP server did not stop within the shutdown timeout");
    }
    if let Err(e) = sweeper_handle.await {
        warn!(error = %e, "Room sweeper task panicked");
    }

    info!("Tally shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        () = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
