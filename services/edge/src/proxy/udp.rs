//! UDP front end: per-peer relay sessions.
//!
//! UDP has no connections to admit, so the relay keys state by source
//! address: the first datagram from a peer opens a session with its own
//! upstream socket, later datagrams reuse it, and sessions that sit idle
//! past the timeout are swept. Replies flow back through the listen
//! socket so the peer always talks to one address.

use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use strait_admission::Context;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Largest datagram the relay moves in one piece.
const MAX_DATAGRAM_SIZE: usize = 65536;

/// Ceiling on the wait between expiry sweeps.
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Configuration for the UDP relay.
#[derive(Debug, Clone)]
pub struct UdpRelayConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Upstream address datagrams are relayed to.
    pub upstream_addr: SocketAddr,
    /// Idle time after which a peer session is dropped.
    pub session_timeout: Duration,
    /// Maximum concurrent peer sessions.
    pub max_sessions: usize,
}

impl UdpRelayConfig {
    /// Create a new relay configuration.
    pub fn new(bind_addr: SocketAddr, upstream_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            upstream_addr,
            session_timeout: Duration::from_secs(30),
            max_sessions: 1024,
        }
    }
}

/// Statistics for the UDP relay.
#[derive(Debug, Default)]
pub struct UdpRelayStats {
    /// Datagrams forwarded to the upstream.
    pub packets_to_upstream: AtomicU64,
    /// Datagrams relayed back to peers.
    pub packets_from_upstream: AtomicU64,
    /// Bytes forwarded to the upstream.
    pub bytes_to_upstream: AtomicU64,
    /// Bytes relayed back to peers.
    pub bytes_from_upstream: AtomicU64,
    /// Sessions opened.
    pub sessions_opened: AtomicU64,
    /// Sessions dropped after sitting idle.
    pub sessions_expired: AtomicU64,
    /// Datagrams dropped because the session table was full.
    pub sessions_rejected: AtomicU64,
    /// Sessions currently live.
    pub sessions_active: AtomicU64,
}

impl UdpRelayStats {
    /// Point-in-time copy of the counters.
    pub fn snapshot(&self) -> UdpRelayStatsSnapshot {
        UdpRelayStatsSnapshot {
            packets_to_upstream: self.packets_to_upstream.load(Ordering::Relaxed),
            packets_from_upstream: self.packets_from_upstream.load(Ordering::Relaxed),
            bytes_to_upstream: self.bytes_to_upstream.load(Ordering::Relaxed),
            bytes_from_upstream: self.bytes_from_upstream.load(Ordering::Relaxed),
            sessions_opened: self.sessions_opened.load(Ordering::Relaxed),
            sessions_expired: self.sessions_expired.load(Ordering::Relaxed),
            sessions_rejected: self.sessions_rejected.load(Ordering::Relaxed),
            sessions_active: self.sessions_active.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of UDP relay statistics.
#[derive(Debug, Clone, Default, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct UdpRelayStatsSnapshot {
    pub packets_to_upstream: u64,
    pub packets_from_upstream: u64,
    pub bytes_to_upstream: u64,
    pub bytes_from_upstream: u64,
    pub sessions_opened: u64,
    pub sessions_expired: u64,
    pub sessions_rejected: u64,
    pub sessions_active: u64,
}

/// One live peer session.
struct UdpSession {
    /// Socket connected to the upstream for this peer.
    upstream: Arc<UdpSocket>,
    /// Milliseconds since relay start at the last datagram, either way.
    last_seen_ms: Arc<AtomicU64>,
    /// Task moving upstream replies back to the peer.
    return_task: JoinHandle<()>,
}

/// The UDP front end.
pub struct UdpRelay {
    /// The socket peers send to.
    socket: Arc<UdpSocket>,
    /// Relay configuration.
    config: UdpRelayConfig,
    /// Statistics.
    stats: Arc<UdpRelayStats>,
    /// Epoch for session activity timestamps.
    started: Instant,
}

impl UdpRelay {
    /// Bind the relay socket.
    pub async fn bind(config: UdpRelayConfig) -> io::Result<Self> {
        let socket = UdpSocket::bind(config.bind_addr).await?;
        let local_addr = socket.local_addr()?;

        info!(
            bind_addr = %local_addr,
            upstream = %config.upstream_addr,
            max_sessions = config.max_sessions,
            "UDP relay bound"
        );

        Ok(Self {
            socket: Arc::new(socket),
            config,
            stats: Arc::new(UdpRelayStats::default()),
            started: Instant::now(),
        })
    }

    /// Get the local address this relay is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Get relay statistics.
    pub fn stats(&self) -> Arc<UdpRelayStats> {
        Arc::clone(&self.stats)
    }

    fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Run the relay until shutdown is signalled.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> io::Result<()> {
        let local_addr = self.socket.local_addr()?;
        info!(bind_addr = %local_addr, "UDP relay started");

        let mut sessions: HashMap<SocketAddr, UdpSession> = HashMap::new();
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        let mut sweep = tokio::time::interval(self.config.session_timeout.min(MAX_SWEEP_INTERVAL));
        // Skip the immediate first tick
        sweep.tick().await;

        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, peer)) => {
                        if let Err(e) = self.forward(&mut sessions, peer, &buf[..len]).await {
                            warn!(peer = %peer, error = %e, "UDP forward failed");
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "UDP receive error");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                _ = sweep.tick() => {
                    self.sweep_expired(&mut sessions);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(
                            bind_addr = %local_addr,
                            sessions = sessions.len(),
                            "UDP relay shutting down"
                        );
                        for (_, session) in sessions.drain() {
                            session.return_task.abort();
                        }
                        self.stats.sessions_active.store(0, Ordering::Relaxed);
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Forward one datagram, opening a session for new peers.
    async fn forward(
        &self,
        sessions: &mut HashMap<SocketAddr, UdpSession>,
        peer: SocketAddr,
        payload: &[u8],
    ) -> io::Result<()> {
        if !sessions.contains_key(&peer) {
            if sessions.len() >= self.config.max_sessions {
                self.sweep_expired(sessions);
            }
            if sessions.len() >= self.config.max_sessions {
                self.stats.sessions_rejected.fetch_add(1, Ordering::Relaxed);
                warn!(
                    peer = %peer,
                    max_sessions = self.config.max_sessions,
                    "Datagram dropped: session table full"
                );
                return Ok(());
            }

            let session = self.open_session(peer).await?;
            sessions.insert(peer, session);
        }

        if let Some(session) = sessions.get(&peer) {
            session.last_seen_ms.store(self.now_ms(), Ordering::Relaxed);
            session.upstream.send(payload).await?;
            self.stats.packets_to_upstream.fetch_add(1, Ordering::Relaxed);
            self.stats
                .bytes_to_upstream
                .fetch_add(payload.len() as u64, Ordering::Relaxed);
        }

        Ok(())
    }

    /// Open a session socket for a new peer and spawn its return path.
    async fn open_session(&self, peer: SocketAddr) -> io::Result<UdpSession> {
        let bind_addr: SocketAddr = if self.config.upstream_addr.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };

        let upstream = UdpSocket::bind(bind_addr).await?;
        upstream.connect(self.config.upstream_addr).await?;
        let upstream = Arc::new(upstream);
        let last_seen_ms = Arc::new(AtomicU64::new(self.now_ms()));

        let ctx = Context::datagram(peer);
        debug!(
            peer = %ctx,
            requested_host = %ctx.requested_host(),
            "UDP session opened"
        );

        let return_task = tokio::spawn(return_path(
            Arc::clone(&upstream),
            Arc::clone(&self.socket),
            peer,
            Arc::clone(&last_seen_ms),
            Arc::clone(&self.stats),
            self.started,
        ));

        self.stats.sessions_opened.fetch_add(1, Ordering::Relaxed);
        self.stats.sessions_active.fetch_add(1, Ordering::Relaxed);

        Ok(UdpSession {
            upstream,
            last_seen_ms,
            return_task,
        })
    }

    /// Drop sessions idle past the timeout.
    fn sweep_expired(&self, sessions: &mut HashMap<SocketAddr, UdpSession>) {
        let timeout_ms = self.config.session_timeout.as_millis() as u64;
        let now = self.now_ms();
        let before = sessions.len();

        sessions.retain(|peer, session| {
            let idle = now.saturating_sub(session.last_seen_ms.load(Ordering::Relaxed));
            if idle >= timeout_ms {
                session.return_task.abort();
                debug!(peer = %peer, idle_ms = idle, "UDP session expired");
                false
            } else {
                true
            }
        });

        let removed = (before - sessions.len()) as u64;
        if removed > 0 {
            self.stats.sessions_expired.fetch_add(removed, Ordering::Relaxed);
            self.stats.sessions_active.fetch_sub(removed, Ordering::Relaxed);
            debug!(removed, remaining = sessions.len(), "Swept expired UDP sessions");
        }
    }
}

/// Move upstream replies back to the peer until the session is torn down.
async fn return_path(
    upstream: Arc<UdpSocket>,
    listen: Arc<UdpSocket>,
    peer: SocketAddr,
    last_seen_ms: Arc<AtomicU64>,
    stats: Arc<UdpRelayStats>,
    started: Instant,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        match upstream.recv(&mut buf).await {
            Ok(len) => {
                last_seen_ms.store(started.elapsed().as_millis() as u64, Ordering::Relaxed);
                if let Err(e) = listen.send_to(&buf[..len], peer).await {
                    debug!(peer = %peer, error = %e, "UDP reply send failed");
                    return;
                }
                stats.packets_from_upstream.fetch_add(1, Ordering::Relaxed);
                stats
                    .bytes_from_upstream
                    .fetch_add(len as u64, Ordering::Relaxed);
            }
            Err(e) => {
                debug!(peer = %peer, error = %e, "UDP upstream receive failed");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_config_defaults() {
        let config = UdpRelayConfig::new(
            "127.0.0.1:0".parse().unwrap(),
            "127.0.0.1:9999".parse().unwrap(),
        );
        assert_eq!(config.session_timeout, Duration::from_secs(30));
        assert_eq!(config.max_sessions, 1024);
    }

    #[test]
    fn relay_stats_snapshot_copies_counters() {
        let stats = UdpRelayStats::default();
        stats.packets_to_upstream.fetch_add(5, Ordering::Relaxed);
        stats.sessions_opened.fetch_add(2, Ordering::Relaxed);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.packets_to_upstream, 5);
        assert_eq!(snapshot.sessions_opened, 2);
        assert_eq!(snapshot.sessions_rejected, 0);
    }

    #[tokio::test]
    async fn bind_assigns_an_ephemeral_port() {
        let relay = UdpRelay::bind(UdpRelayConfig::new(
            "127.0.0.1:0".parse().unwrap(),
            "127.0.0.1:9999".parse().unwrap(),
        ))
        .await
        .unwrap();

        assert_ne!(relay.local_addr().unwrap().port(), 0);
    }
}
