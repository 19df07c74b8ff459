//! Precursors Game Server
//!
//! Real-time multiplayer simulation server: browser clients connect over
//! WebSocket, log in, inhabit an entity and receive replicated world state.

use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use precursors_server::config::ServerConfig;
use precursors_server::net::handler::ConnectionHandler;
use precursors_server::state::AppState;
use precursors_server::VERSION;

#[tokio::main]
async fn main() -> Result<()> {
    // Variables from .env are visible to the config overrides below
    dotenv::dotenv().ok();

    // Load configuration
    let config = ServerConfig::load().await?;

    // Initialize logging
    init_logging(&config);

    info!("╔══════════════════════════════════════════════╗");
    info!("║        Precursors Game Server v{}            ║", VERSION);
    info!("╚══════════════════════════════════════════════╝");
    info!(
        "Configuration loaded from: {}",
        config.config_path.display()
    );

    // Create shutdown channel
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let state = Arc::new(AppState::from_config(config.clone(), shutdown_tx.clone()).await?);
    info!("Application state initialized");

    // Start the physics loop
    let physics_handle = state.physics.start(shutdown_tx.subscribe());

    // Start periodic entity saves
    let autosave_handle = if config.autosave_interval_secs > 0 {
        Some(state.entities.start_autosave(
            std::time::Duration::from_secs(config.autosave_interval_secs),
            shutdown_tx.subscribe(),
        ))
    } else {
        warn!("Autosave disabled");
        None
    };

    // Start WebSocket listener for browser clients
    let ws_listener = TcpListener::bind(config.listen_address()).await?;
    info!("WebSocket server listening on: {}", config.listen_address());

    let ws_state = state.clone();
    let mut ws_shutdown_rx = shutdown_tx.subscribe();
    let ws_handle = tokio::spawn(async move {
        accept_websocket_connections(ws_listener, ws_state, &mut ws_shutdown_rx).await;
    });

    info!("Server startup complete!");
    info!("{} is ready for connections", config.server_name);

    // Wait for shutdown signal
    wait_for_shutdown(shutdown_tx.clone()).await;

    info!("Shutting down server...");

    // Wait for tasks to finish
    let _ = ws_handle.await;
    if let Some(handle) = physics_handle {
        let _ = handle.await;
    }
    if let Some(handle) = autosave_handle {
        let _ = handle.await;
    }

    // Cleanup
    let disconnected = ConnectionHandler::new(state.clone()).disconnect_all().await;
    info!(sessions = disconnected, "All sessions disconnected");

    let unloaded = state.entities.unload_all().await;
    info!(entities = unloaded, "All entities unloaded and saved");

    info!("Server shutdown complete. Goodbye!");
    Ok(())
}

/// Initialize the logging/tracing system
fn init_logging(config: &ServerConfig) {
    let default_filter = if config.debug {
        "info,precursors_server=debug"
    } else {
        "info,precursors_server=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let builder = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_level(true);

    if config.json_logs {
        builder.json().init();
    } else {
        builder.with_file(true).with_line_number(true).init();
    }
}

/// Accept incoming WebSocket connections (for browser clients)
async fn accept_websocket_connections(
    listener: TcpListener,
    state: Arc<AppState>,
    shutdown_rx: &mut broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        info!("New WebSocket connection from: {}", addr);
                        let handler = ConnectionHandler::new(state.clone());
                        tokio::spawn(async move {
                            if let Err(e) = handler.handle_websocket(stream, addr).await {
                                warn!("WebSocket connection error from {}: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept WebSocket connection: {}", e);
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                info!("WebSocket connection acceptor shutting down");
                break;
            }
        }
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn wait_for_shutdown(shutdown_tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
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

    // Signal all tasks to shut down
    let _ = shutdown_tx.send(());
}
