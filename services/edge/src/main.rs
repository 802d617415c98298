//! strait edge proxy
//!
//! The edge is the traffic-facing half of strait. This service:
//! - Accepts TCP connections and sniffs them for a TLS SNI hostname
//! - Replays sniffed bytes so downstream consumers see an untouched stream
//! - Relays admitted connections to the configured upstream
//! - Relays UDP datagrams through per-peer sessions
//! - Serves an admin API with process status and a config dump

use std::sync::Arc;

use anyhow::Result;
use strait_admission::{BufferPool, Sniffer};
use strait_edge::{
    admin, config, Listener, ListenerConfig, RelayHandler, StreamHandler, UdpRelay, UdpRelayConfig,
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to STRAIT_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting strait edge proxy");
    info!(
        listen_addr = %config.listen_addr,
        upstream_addr = %config.upstream_addr,
        sniff_enabled = config.sniff_enabled,
        udp_enabled = config.udp_listen_addr.is_some(),
        admin_enabled = config.admin_addr.is_some(),
        "Configuration loaded"
    );

    // Shared peek-buffer pool and sniffer
    let pool = Arc::new(BufferPool::new(config.pool_capacity));
    let sniffer = Sniffer::new(Arc::clone(&pool));

    let handler: Arc<dyn StreamHandler> = Arc::new(
        RelayHandler::new(config.upstream_addr).with_idle_timeout(config.idle_timeout()),
    );

    let mut listener_config = ListenerConfig::new(config.listen_addr);
    listener_config.max_connections = config.max_connections;
    listener_config.sniff_enabled = config.sniff_enabled;
    listener_config.sniff_timeout = config.sniff_timeout();

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Bind and start the TCP front end
    let listener = match Listener::bind(listener_config, sniffer, handler).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(bind_addr = %config.listen_addr, error = %e, "Failed to bind listener");
            return Err(e.into());
        }
    };
    let tcp_stats = listener.stats();
    let listener = Arc::new(listener);
    let tcp_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            if let Err(e) = listener.run(shutdown_rx).await {
                error!(error = %e, "Listener error");
            }
        }
    });

    // Start the UDP front end when configured
    let mut udp_stats = None;
    let mut udp_handle = None;
    if let Some(udp_listen_addr) = config.udp_listen_addr {
        let udp_upstream_addr = config.udp_upstream_addr.unwrap_or(config.upstream_addr);
        let mut relay_config = UdpRelayConfig::new(udp_listen_addr, udp_upstream_addr);
        relay_config.session_timeout = config.udp_session_timeout();
        relay_config.max_sessions = config.udp_max_sessions;

        let relay = match UdpRelay::bind(relay_config).await {
            Ok(relay) => relay,
            Err(e) => {
                error!(bind_addr = %udp_listen_addr, error = %e, "Failed to bind UDP relay");
                return Err(e.into());
            }
        };
        udp_stats = Some(relay.stats());
        let relay = Arc::new(relay);
        udp_handle = Some(tokio::spawn({
            let shutdown_rx = shutdown_rx.clone();
            async move {
                if let Err(e) = relay.run(shutdown_rx).await {
                    error!(error = %e, "UDP relay error");
                }
            }
        }));
    }

    // Start the admin API when configured
    let mut admin_handle = None;
    if let Some(admin_addr) = config.admin_addr {
        let state = admin::AdminState::new(config.clone(), Arc::clone(&tcp_stats), udp_stats);
        let app = admin::create_router(state);

        let admin_listener = tokio::net::TcpListener::bind(admin_addr).await?;
        info!(addr = %admin_addr, "Admin API listening");

        let shutdown_rx = shutdown_rx.clone();
        admin_handle = Some(tokio::spawn(async move {
            let serve = axum::serve(admin_listener, app).with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("Admin API shutting down");
            });
            if let Err(e) = serve.await {
                error!(error = %e, "Admin API error");
            }
        }));
    }

    // Wait for shutdown signal (Ctrl+C) or the TCP front end exiting
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = tcp_handle => {
            match result {
                Ok(()) => info!("Listener exited"),
                Err(e) => error!(error = %e, "Listener task panicked"),
            }
        }
    }

    // Signal shutdown to the remaining tasks
    let _ = shutdown_tx.send(true);

    let shutdown_timeout = std::time::Duration::from_secs(10);

    if let Some(handle) = udp_handle {
        if let Err(e) = tokio::time::timeout(shutdown_timeout, handle).await {
            warn!(error = %e, "UDP relay did not shut down in time");
        }
    }

    if let Some(handle) = admin_handle {
        if let Err(e) = tokio::time::timeout(shutdown_timeout, handle).await {
            warn!(error = %e, "Admin API did not shut down in time");
        }
    }

    info!("Edge shutdown complete");
    Ok(())
}
