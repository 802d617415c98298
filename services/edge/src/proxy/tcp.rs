//! TCP listener and connection admission.
//!
//! This module accepts TCP connections, runs SNI sniffing on each one,
//! builds the peer context, and hands the connection to the configured
//! stream handler. It enforces the concurrent-connection cap and keeps
//! the admission counters the admin API reports.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use strait_admission::{Context, SniffedStream, Sniffer};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn, Instrument};

use super::relay::StreamHandler;

/// Default maximum concurrent connections per listener.
pub const DEFAULT_MAX_CONNECTIONS: usize = 4096;

/// Default deadline for the sniff read.
pub const DEFAULT_SNIFF_TIMEOUT: Duration = Duration::from_secs(2);

/// Configuration for a listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Whether accepted connections are sniffed for an SNI hostname.
    pub sniff_enabled: bool,
    /// Deadline for the sniff read.
    pub sniff_timeout: Duration,
}

impl ListenerConfig {
    /// Create a new listener configuration.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            sniff_enabled: true,
            sniff_timeout: DEFAULT_SNIFF_TIMEOUT,
        }
    }
}

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Connections currently active.
    pub connections_active: AtomicU64,
    /// Total connections closed.
    pub connections_closed: AtomicU64,
    /// Connections rejected due to the concurrency cap.
    pub connections_rejected: AtomicU64,
    /// Sniffs that produced a hostname.
    pub sniff_found: AtomicU64,
    /// Sniffs that produced no hostname (timeout, not TLS, no SNI).
    pub sniff_missed: AtomicU64,
    /// Sniffs that failed with a transport error.
    pub sniff_errors: AtomicU64,
    /// Bytes relayed from clients to the upstream.
    pub bytes_to_upstream: AtomicU64,
    /// Bytes relayed from the upstream to clients.
    pub bytes_from_upstream: AtomicU64,
}

impl ListenerStats {
    /// Point-in-time copy of the counters.
    pub fn snapshot(&self) -> ListenerStatsSnapshot {
        ListenerStatsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            connections_rejected: self.connections_rejected.load(Ordering::Relaxed),
            sniff_found: self.sniff_found.load(Ordering::Relaxed),
            sniff_missed: self.sniff_missed.load(Ordering::Relaxed),
            sniff_errors: self.sniff_errors.load(Ordering::Relaxed),
            bytes_to_upstream: self.bytes_to_upstream.load(Ordering::Relaxed),
            bytes_from_upstream: self.bytes_from_upstream.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of listener statistics.
#[derive(Debug, Clone, Default, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ListenerStatsSnapshot {
    pub connections_accepted: u64,
    pub connections_active: u64,
    pub connections_closed: u64,
    pub connections_rejected: u64,
    pub sniff_found: u64,
    pub sniff_missed: u64,
    pub sniff_errors: u64,
    pub bytes_to_upstream: u64,
    pub bytes_from_upstream: u64,
}

/// The TCP front end.
pub struct Listener {
    /// Listener configuration.
    config: ListenerConfig,
    /// The TCP listener.
    listener: TcpListener,
    /// SNI sniffer run against each accepted connection.
    sniffer: Sniffer,
    /// Handler each admitted connection is passed to.
    handler: Arc<dyn StreamHandler>,
    /// Connection semaphore for limiting concurrent connections.
    conn_semaphore: Arc<Semaphore>,
    /// Statistics.
    stats: Arc<ListenerStats>,
}

impl Listener {
    /// Create a new listener.
    pub async fn bind(
        config: ListenerConfig,
        sniffer: Sniffer,
        handler: Arc<dyn StreamHandler>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        info!(
            bind_addr = %local_addr,
            max_connections = config.max_connections,
            sniff_enabled = config.sniff_enabled,
            "Listener bound"
        );

        Ok(Self {
            conn_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            listener,
            config,
            sniffer,
            handler,
            stats: Arc::new(ListenerStats::default()),
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Get listener statistics.
    pub fn stats(&self) -> Arc<ListenerStats> {
        Arc::clone(&self.stats)
    }

    /// Run the listener until shutdown is signalled.
    ///
    /// In-flight connections keep running on their own tasks after the
    /// accept loop stops.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> io::Result<()> {
        let local_addr = self.listener.local_addr()?;
        info!(bind_addr = %local_addr, "Listener started");

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        // Try to acquire a permit
                        let permit = match self.conn_semaphore.clone().try_acquire_owned() {
                            Ok(permit) => permit,
                            Err(_) => {
                                self.stats
                                    .connections_rejected
                                    .fetch_add(1, Ordering::Relaxed);
                                warn!(peer_addr = %peer_addr, "Connection rejected: max connections reached");
                                continue;
                            }
                        };

                        self.stats
                            .connections_accepted
                            .fetch_add(1, Ordering::Relaxed);
                        self.stats
                            .connections_active
                            .fetch_add(1, Ordering::Relaxed);

                        let listener = Arc::clone(&self);
                        let stats = Arc::clone(&self.stats);

                        tokio::spawn(
                            async move {
                                if let Err(e) = listener.handle_connection(stream, peer_addr).await {
                                    debug!(
                                        peer_addr = %peer_addr,
                                        error = %e,
                                        "Connection error"
                                    );
                                }

                                stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                                stats.connections_closed.fetch_add(1, Ordering::Relaxed);
                                drop(permit);
                            }
                            .instrument(tracing::info_span!("connection", peer = %peer_addr)),
                        );
                    }
                    Err(e) => {
                        error!(error = %e, "Accept error");
                        // Brief sleep to avoid tight loop on persistent errors
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(bind_addr = %local_addr, "Listener shutting down");
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Admit a single connection and hand it to the handler.
    async fn handle_connection(&self, stream: TcpStream, peer_addr: SocketAddr) -> io::Result<()> {
        let wrapped = if self.config.sniff_enabled {
            let wrapped = match self.sniffer.sniff(stream, self.config.sniff_timeout).await {
                Ok(wrapped) => wrapped,
                Err(e) => {
                    self.stats.sniff_errors.fetch_add(1, Ordering::Relaxed);
                    return Err(e);
                }
            };

            match wrapped.hostname() {
                Some(hostname) => {
                    self.stats.sniff_found.fetch_add(1, Ordering::Relaxed);
                    debug!(hostname = %hostname, "SNI extracted");
                }
                None => {
                    self.stats.sniff_missed.fetch_add(1, Ordering::Relaxed);
                }
            }
            wrapped
        } else {
            SniffedStream::passthrough(stream)
        };

        {
            let ctx = Context::stream(&wrapped);
            debug!(
                peer = %ctx,
                requested_host = %ctx.requested_host(),
                "Connection admitted"
            );
        }

        let (bytes_to_upstream, bytes_from_upstream) =
            self.handler.handle(wrapped, peer_addr).await?;

        self.stats
            .bytes_to_upstream
            .fetch_add(bytes_to_upstream, Ordering::Relaxed);
        self.stats
            .bytes_from_upstream
            .fetch_add(bytes_from_upstream, Ordering::Relaxed);

        debug!(
            bytes_to_upstream = bytes_to_upstream,
            bytes_from_upstream = bytes_from_upstream,
            "Connection closed"
        );

        Ok(())
    }
}
