//! Conclave signaling node
//!
//! Websocket signaling server for room membership and stream negotiation.
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize Prometheus metrics recorder
//! 3. Connect the coordination substrate (Redis, or in-memory without `REDIS_URL`)
//! 4. Register this node (fatal on failure) and start the keepalive
//! 5. Start discovery and the cluster coordinator
//! 6. Start the broadcast consumer and the room reconciler
//! 7. Bind the debug listener (health, readiness, metrics) if configured
//! 8. Bind the websocket signaling listener
//! 9. Wait for shutdown signal

#![warn(clippy::pedantic)]
#![allow(clippy::too_many_lines)] // main.rs orchestrates startup, naturally longer

use std::sync::Arc;
use std::time::Duration;

use biz_service::broadcast::run_broadcast_consumer;
use biz_service::config::Config;
use biz_service::context::BizContext;
use biz_service::observability::{health_router, init_metrics_recorder, HealthState};
use biz_service::signaling::ws::signal_router;
use biz_service::tasks::start_room_reconciler;
use common::bus::{Broadcaster, DELIVERY_BUFFER};
use common::coordinator::ClusterCoordinator;
use common::discovery::{NodeEventHandler, ServiceWatcher};
use common::registry::NodeRegistry;
use common::substrate::Substrate;
use common::types::ServiceNode;
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Time given to background tasks to observe cancellation.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    info!("Starting signaling node");

    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        node_id = %config.cluster.node_id,
        dc = %config.cluster.dc,
        signal_bind_address = %config.signal_bind_address,
        check_room_interval_seconds = config.check_room_interval.as_secs(),
        "Configuration loaded successfully"
    );

    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;

    let health_state = Arc::new(HealthState::new());
    let shutdown_token = CancellationToken::new();

    let substrate = Substrate::connect(&config.cluster).await.map_err(|e| {
        error!(error = %e, "Failed to connect coordination substrate");
        e
    })?;

    let local = ServiceNode::new(
        config.cluster.node_id.clone(),
        config.cluster.dc.clone(),
        config.cluster.service_name.clone(),
    );

    // Registration failure is fatal: an unregistered node is invisible to
    // the cluster
    let registry = Arc::new(NodeRegistry::new(
        Arc::clone(&substrate.store),
        local.clone(),
        config.cluster.node_ttl,
    ));
    registry.register_node().await.map_err(|e| {
        error!(error = %e, "Failed to register node");
        e
    })?;

    let (inbound_tx, inbound_rx) = mpsc::channel(DELIVERY_BUFFER);
    let watcher = Arc::new(ServiceWatcher::new(Arc::clone(&substrate.store)));
    let coordinator = Arc::new(ClusterCoordinator::new(
        local.clone(),
        Arc::clone(&watcher),
        Arc::clone(&substrate.bus),
        config.cluster.rpc_timeout,
        Some(inbound_tx),
    ));

    let broadcaster = Broadcaster::new(Arc::clone(&substrate.bus), local.event_channel());
    let ctx = Arc::new(BizContext::new(Arc::clone(&coordinator), broadcaster));

    // Keepalive, reporting the number of local peers as load
    {
        let registry = Arc::clone(&registry);
        let ctx = Arc::clone(&ctx);
        let interval = config.cluster.report_interval;
        let token = shutdown_token.child_token();
        tokio::spawn(async move {
            registry
                .run_keepalive(interval, move || ctx.rooms().load(), token)
                .await;
        });
    }

    {
        let watcher = Arc::clone(&watcher);
        let handler = Arc::clone(&coordinator) as Arc<dyn NodeEventHandler>;
        let interval = config.cluster.watch_interval;
        let token = shutdown_token.child_token();
        tokio::spawn(async move {
            watcher
                .watch_service_nodes("", interval, handler, token)
                .await;
        });
    }
    info!("Service discovery started");

    tokio::spawn(run_broadcast_consumer(
        Arc::clone(&ctx),
        inbound_rx,
        shutdown_token.child_token(),
    ));
    tokio::spawn(start_room_reconciler(
        Arc::clone(&ctx),
        config.check_room_interval,
        shutdown_token.child_token(),
    ));

    if let Some(debug_addr) = config.debug_bind_address {
        let app = health_router(Arc::clone(&health_state), Some(prometheus_handle));

        // Bind listener BEFORE spawning to fail fast on bind errors
        let listener = tokio::net::TcpListener::bind(debug_addr)
            .await
            .map_err(|e| {
                error!(error = %e, addr = %debug_addr, "Failed to bind debug listener");
                format!("Failed to bind debug listener to {debug_addr}: {e}")
            })?;

        let token = shutdown_token.child_token();
        tokio::spawn(async move {
            info!(addr = %debug_addr, "Debug listener starting");
            let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                token.cancelled().await;
                info!("Debug listener shutting down");
            });
            if let Err(e) = server.await {
                error!(error = %e, "Debug listener failed");
            }
        });
    }

    let signal_addr = config.signal_bind_address;
    let listener = tokio::net::TcpListener::bind(signal_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %signal_addr, "Failed to bind signaling listener");
            format!("Failed to bind signaling listener to {signal_addr}: {e}")
        })?;
    let app = signal_router(Arc::clone(&ctx), shutdown_token.child_token());
    {
        let token = shutdown_token.child_token();
        tokio::spawn(async move {
            info!(addr = %signal_addr, "Signaling server starting");
            let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                token.cancelled().await;
                info!("Signaling server shutting down");
            });
            if let Err(e) = server.await {
                error!(error = %e, "Signaling server failed");
            }
        });
    }

    health_state.set_ready();
    info!(node = %local, "Signaling node running - press Ctrl+C to shutdown");

    shutdown_signal().await;

    info!("Shutdown signal received, initiating graceful shutdown...");
    health_state.set_not_ready();
    shutdown_token.cancel();

    tokio::time::sleep(SHUTDOWN_GRACE).await;

    coordinator.close().await;
    registry.close().await;

    info!("Signaling node shutdown complete");
    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "biz_service=debug,common=info,tower_http=debug".into());

    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed.
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
        () = ctrl_c => {}
        () = terminate => {}
    }
}
