//! Conclave media node
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize Prometheus metrics recorder
//! 3. Connect the coordination substrate
//! 4. Register this node (fatal on failure) and start the keepalive, which
//!    reports the publisher count as load
//! 5. Serve the RPC channel
//! 6. Start stream cleanup broadcasts and the dead publisher reaper
//! 7. Bind the debug listener if configured
//! 8. Wait for shutdown signal

#![warn(clippy::pedantic)]
#![allow(clippy::too_many_lines)]

use std::sync::Arc;
use std::time::Duration;

use common::bus::Broadcaster;
use common::registry::NodeRegistry;
use common::substrate::Substrate;
use common::types::ServiceNode;
use sfu_service::config::Config;
use sfu_service::context::SfuContext;
use sfu_service::observability::{health_router, init_metrics_recorder, HealthState};
use sfu_service::rpc_handler::serve_rpc;
use sfu_service::rtc::{PubRegistry, TransportFactory, WebRtcFactory};
use sfu_service::tasks::{run_stream_cleanup, start_pub_reaper};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Time given to removal broadcasts and background tasks on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    info!("Starting media node");

    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        node_id = %config.cluster.node_id,
        dc = %config.cluster.dc,
        ice_servers = ?config.ice_servers,
        ice_port_range = ?config.ice_port_range,
        rtp_queue_capacity = config.rtp_queue_capacity,
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

    let node_registry = Arc::new(NodeRegistry::new(
        Arc::clone(&substrate.store),
        local.clone(),
        config.cluster.node_ttl,
    ));
    node_registry.register_node().await.map_err(|e| {
        error!(error = %e, "Failed to register node");
        e
    })?;

    let (pubs, removed_rx) = PubRegistry::new();
    let pubs = Arc::new(pubs);
    let factory: Arc<dyn TransportFactory> = Arc::new(WebRtcFactory::new(
        config.ice_servers.clone(),
        config.ice_port_range,
    ));
    let ctx = Arc::new(SfuContext::new(
        local.clone(),
        Arc::clone(&pubs),
        factory,
        config.rtp_queue_capacity,
    ));

    {
        let node_registry = Arc::clone(&node_registry);
        let pubs = Arc::clone(&pubs);
        let interval = config.cluster.report_interval;
        let token = shutdown_token.child_token();
        tokio::spawn(async move {
            node_registry
                .run_keepalive(interval, move || u64::try_from(pubs.len()).unwrap_or(u64::MAX), token)
                .await;
        });
    }

    serve_rpc(
        Arc::clone(&ctx),
        substrate.bus.as_ref(),
        shutdown_token.child_token(),
    )
    .await
    .map_err(|e| {
        error!(error = %e, "Failed to serve RPC channel");
        e
    })?;

    // Cleanup gets its own token so removals queued during shutdown still go out
    let cleanup_token = CancellationToken::new();
    let cleanup_task = tokio::spawn(run_stream_cleanup(
        Broadcaster::new(Arc::clone(&substrate.bus), local.event_channel()),
        removed_rx,
        cleanup_token.clone(),
    ));
    tokio::spawn(start_pub_reaper(
        Arc::clone(&pubs),
        config.reap_interval,
        shutdown_token.child_token(),
    ));

    if let Some(debug_addr) = config.debug_bind_address {
        let app = health_router(Arc::clone(&health_state), Some(prometheus_handle));

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

    health_state.set_ready();
    info!(node = %local, "Media node running - press Ctrl+C to shutdown");

    shutdown_signal().await;

    info!("Shutdown signal received, initiating graceful shutdown...");
    health_state.set_not_ready();
    shutdown_token.cancel();

    pubs.close_all().await;
    cleanup_token.cancel();
    if tokio::time::timeout(SHUTDOWN_GRACE, cleanup_task).await.is_err() {
        error!("Stream cleanup did not finish within the shutdown grace period");
    }

    node_registry.close().await;

    info!("Media node shutdown complete");
    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "sfu_service=debug,common=info,webrtc=warn".into());

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
