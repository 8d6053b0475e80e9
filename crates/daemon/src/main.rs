// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Edge Tunnel Manager Contributors

// Edge Tunnel Manager - Daemon
// Core service supervising edge tunnel processes

mod api;
mod config;
mod gateway;
mod manager;
mod output;
mod permissions;
mod pidfile;
mod scanner;
mod supervisor;
mod watcher;

use std::sync::Arc;

use anyhow::{Context, Result};
use hyper_util::rt::TokioIo;
use tokio::net::UnixListener;
use tower::Service;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use edge_tunnel_common::Settings;

use api::{create_router, AppState};
use config::{DaemonConfig, ListenerMode};
use manager::{ManagerOptions, TunnelManager};

#[tokio::main]
async fn main() -> Result<()> {
    // Set restrictive umask before creating any files
    permissions::set_restrictive_umask();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "edge_tunnel_daemon=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Edge Tunnel Manager Daemon starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    // Create PID file to prevent multiple instances
    let _pid_guard = pidfile::PidFileGuard::create()
        .context("Failed to create PID file - another daemon may already be running")?;

    // Load configuration
    let settings = Settings::load()?;
    let daemon_config = DaemonConfig::load()?;
    info!("Listener mode: {:?}", daemon_config.listener_mode);
    info!("Tunnel directory: {}", settings.tunnel_dir.display());
    info!("Tunnel executable: {}", settings.cloudflared_path.display());
    if !settings.cloudflared_path.exists() {
        warn!(
            "Tunnel executable not found at {}; starts will fail until it is installed",
            settings.cloudflared_path.display()
        );
    }

    // Create the tunnel manager and populate it from the config directory
    let manager = TunnelManager::new(ManagerOptions::from_settings(&settings));
    if let Err(e) = manager.rescan().await {
        warn!("Initial scan failed: {}", e);
    }
    info!("Discovered {} managed tunnel(s)", manager.list_managed().await.len());

    // Watch the config directory for edits
    let watch_manager = manager.clone();
    let tunnel_dir = settings.tunnel_dir.clone();
    tokio::spawn(async move {
        watcher::watch_config_dir(watch_manager, tunnel_dir).await;
    });

    // Periodic status reconciliation
    let check_manager = manager.clone();
    let check_interval = settings.check_interval();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            check_manager.check_status().await;
        }
    });

    // Subscribe to tunnel events for logging
    let mut event_rx = manager.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = event_rx.recv().await {
            info!("Tunnel event: {:?}", event);
        }
    });

    // Create shutdown broadcast channel for graceful SSE stream termination
    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);

    // Create shared state
    let state = Arc::new(AppState {
        manager: manager.clone(),
        shutdown_tx: shutdown_tx.clone(),
    });
    let app = create_router(state);

    // Start listener based on configured mode
    match daemon_config.listener_mode {
        ListenerMode::UnixSocket => {
            serve_unix_socket(app, manager, shutdown_tx).await?;
        }
        ListenerMode::TcpHttp => {
            serve_tcp_http(app, &daemon_config.bind_address, manager, shutdown_tx).await?;
        }
    }

    info!("Daemon shut down");
    Ok(())
}

/// Serve on Unix domain socket (local-only)
async fn serve_unix_socket(
    app: axum::Router,
    manager: TunnelManager,
    shutdown_tx: tokio::sync::broadcast::Sender<()>,
) -> Result<()> {
    let socket_path = config::socket_path()?;

    // Remove existing socket file if it exists
    if socket_path.exists() {
        std::fs::remove_file(&socket_path).context("Failed to remove existing socket file")?;
    }

    if let Some(parent) = socket_path.parent() {
        permissions::ensure_private_directory(parent)?;
    }

    let listener = UnixListener::bind(&socket_path).context(format!(
        "Failed to bind to socket: {}",
        socket_path.display()
    ))?;

    permissions::set_socket_permissions(&socket_path)?;

    info!("Daemon listening on Unix socket: {}", socket_path.display());
    info!("Daemon started successfully");

    // Set up shutdown signal
    let (shutdown_signal_tx, mut shutdown_rx) = tokio::sync::mpsc::channel::<()>(1);
    let shutdown_broadcast = shutdown_tx.clone();
    tokio::spawn(async move {
        wait_for_shutdown(manager).await;
        // Signal SSE streams to close
        let _ = shutdown_broadcast.send(());
        // Signal server to stop accepting connections
        let _ = shutdown_signal_tx.send(()).await;
    });

    // Accept connections
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("Shutting down server...");
                break;
            }

            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, _addr)) => {
                        let app = app.clone();

                        tokio::spawn(async move {
                            let stream = TokioIo::new(stream);

                            let hyper_service = hyper::service::service_fn(move |request: hyper::Request<hyper::body::Incoming>| {
                                let mut app = app.clone();
                                async move {
                                    app.call(request).await
                                }
                            });

                            if let Err(err) = hyper_util::server::conn::auto::Builder::new(hyper_util::rt::TokioExecutor::new())
                                .serve_connection_with_upgrades(stream, hyper_service)
                                .await
                            {
                                // Client disconnects (e.g., Ctrl+C on a watch command) are normal
                                let err_msg = err.to_string();
                                if err_msg.contains("connection closed") || err_msg.contains("Broken pipe") {
                                    debug!("Client disconnected: {}", err);
                                } else {
                                    error!("Error serving connection: {}", err);
                                }
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                }
            }
        }
    }

    // Cleanup socket
    if socket_path.exists() {
        let _ = std::fs::remove_file(&socket_path);
    }

    Ok(())
}

/// Serve on TCP with HTTP (localhost-only, no encryption)
async fn serve_tcp_http(
    app: axum::Router,
    bind_address: &str,
    manager: TunnelManager,
    shutdown_tx: tokio::sync::broadcast::Sender<()>,
) -> Result<()> {
    info!("Daemon listening on TCP (HTTP): {}", bind_address);
    info!("Daemon started successfully");

    let listener = tokio::net::TcpListener::bind(bind_address)
        .await
        .context(format!("Failed to bind to {}", bind_address))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            wait_for_shutdown(manager).await;
            let _ = shutdown_tx.send(());
        })
        .await
        .context("TCP HTTP server error")?;

    Ok(())
}

/// Wait for Ctrl+C or SIGTERM, then stop every tunnel
async fn wait_for_shutdown(manager: TunnelManager) {
    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(e) => {
                    error!("Failed to install SIGTERM handler: {}", e);
                    let _ = tokio::signal::ctrl_c().await;
                    info!("Received Ctrl+C, shutting down");
                    manager.stop_all().await;
                    return;
                }
            };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down");
            }
        };
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, shutting down");
    }

    let stopped = manager.stop_all().await;
    info!("Stopped {} tunnel(s)", stopped);
}
