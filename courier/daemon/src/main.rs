//! Courier Daemon
//!
//! Standalone IPC server process. Clients connect over WebSocket and invoke
//! the built-in routes; a multicast listener tells prospective clients which
//! port the primary endpoint is bound to.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (localhost:8000, multicast on localhost:20000)
//! courier-daemon
//!
//! # Require a shared secret
//! COURIER_SECRET=swordfish courier-daemon
//!
//! # With verbose logging
//! RUST_LOG=debug courier-daemon
//! ```
//!
//! # Environment Variables
//!
//! - `COURIER_HOST`: Host to bind (default: localhost)
//! - `COURIER_PORT`: Primary endpoint port (default: 8000)
//! - `COURIER_SECRET`: Shared secret for the Authorization header
//! - `COURIER_MULTICAST`: "0" or "false" to disable the discovery listener
//! - `COURIER_MULTICAST_PORT`: Discovery endpoint port (default: 20000)
//! - `RUST_LOG`: Log level (trace, debug, info, warn, error)
//!
//! # Signals
//!
//! - SIGTERM/SIGINT: Graceful shutdown (terminates both listeners)

use anyhow::Context;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{info, warn};

use courier_core::{EndpointKind, IpcEvent, Server, ServerConfig};

mod routes;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("courier_daemon=info".parse()?)
                .add_directive("courier_core=info".parse()?),
        )
        .with_target(true)
        .init();

    info!("Starting Courier Daemon");
    info!("PID: {}", std::process::id());

    let config = ServerConfig::from_env();
    if config.secret_key.is_none() {
        warn!("No COURIER_SECRET configured; clients must send a null Authorization value");
    }

    let (events, mut events_rx) = mpsc::unbounded_channel::<IpcEvent>();
    let mut server = Server::new(config, events);

    routes::register_builtin(&mut server).context("failed to register built-in routes")?;

    server.setup();
    server
        .start()
        .await
        .context("failed to start IPC listeners; check that the ports are free")?;

    if let Some(addr) = server.local_addr(EndpointKind::Primary) {
        info!(addr = %addr, "Primary endpoint ready");
    }
    if let Some(addr) = server.local_addr(EndpointKind::Multicast) {
        info!(addr = %addr, "Multicast endpoint ready");
    }

    // Drain lifecycle notifications into the log.
    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            match event {
                IpcEvent::RawRequest(request) => {
                    info!(endpoint = %request.endpoint(), "Request received");
                }
                IpcEvent::RequestCompletion(request) => {
                    info!(
                        endpoint = %request.endpoint(),
                        responded = request.is_done(),
                        "Request completed"
                    );
                }
            }
        }
    });

    // Wait for a shutdown signal.
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        }
    }

    server.terminate().await.context("shutdown failed")?;

    info!("Courier daemon stopped cleanly");
    Ok(())
}
