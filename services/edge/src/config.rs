//! Edge proxy configuration.
//!
//! All settings come from `STRAIT_*` environment variables. The loaded
//! config is serializable so the admin API can dump the effective
//! settings of a running process.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;

/// Edge proxy configuration (env-driven).
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// Address the TCP front end listens on.
    pub listen_addr: SocketAddr,

    /// Upstream address TCP connections are relayed to.
    pub upstream_addr: SocketAddr,

    /// Address the UDP front end listens on (unset disables UDP).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub udp_listen_addr: Option<SocketAddr>,

    /// Upstream address for UDP traffic (defaults to `upstream_addr`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub udp_upstream_addr: Option<SocketAddr>,

    /// Address the admin API listens on (unset disables the API).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin_addr: Option<SocketAddr>,

    /// Whether to sniff fresh TCP connections for a TLS SNI hostname.
    pub sniff_enabled: bool,

    /// Deadline for the single sniff read, in milliseconds.
    pub sniff_timeout_ms: u64,

    /// Idle timeout for relayed TCP connections, in milliseconds
    /// (unset means connections stay open until either side closes).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_timeout_ms: Option<u64>,

    /// Number of peek buffers the shared pool retains.
    pub pool_capacity: usize,

    /// Maximum concurrent TCP connections.
    pub max_connections: usize,

    /// Idle timeout for UDP peer sessions, in milliseconds.
    pub udp_session_timeout_ms: u64,

    /// Maximum concurrent UDP peer sessions.
    pub udp_max_sessions: usize,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let listen_addr: SocketAddr = std::env::var("STRAIT_LISTEN_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:8443".to_string())
            .parse()
            .context("STRAIT_LISTEN_ADDR must be a socket address (host:port).")?;

        let upstream_addr: SocketAddr = std::env::var("STRAIT_UPSTREAM_ADDR")
            .context("Missing upstream address. Set STRAIT_UPSTREAM_ADDR (host:port).")?
            .parse()
            .context("STRAIT_UPSTREAM_ADDR must be a socket address (host:port).")?;

        let udp_listen_addr: Option<SocketAddr> = std::env::var("STRAIT_UDP_LISTEN_ADDR")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("STRAIT_UDP_LISTEN_ADDR must be a socket address (host:port).")?;

        let udp_upstream_addr: Option<SocketAddr> = std::env::var("STRAIT_UDP_UPSTREAM_ADDR")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("STRAIT_UDP_UPSTREAM_ADDR must be a socket address (host:port).")?
            // Effective value: UDP falls back to the TCP upstream.
            .or(udp_listen_addr.map(|_| upstream_addr));

        let admin_addr: Option<SocketAddr> = std::env::var("STRAIT_ADMIN_ADDR")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("STRAIT_ADMIN_ADDR must be a socket address (host:port).")?;

        let sniff_enabled = std::env::var("STRAIT_SNIFF_ENABLED")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(true);

        let sniff_timeout_ms: u64 = std::env::var("STRAIT_SNIFF_TIMEOUT_MS")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("STRAIT_SNIFF_TIMEOUT_MS must be an integer (milliseconds).")?
            .unwrap_or(2000)
            .max(10);

        let idle_timeout_ms: Option<u64> = std::env::var("STRAIT_IDLE_TIMEOUT_MS")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("STRAIT_IDLE_TIMEOUT_MS must be an integer (milliseconds).")?
            .filter(|&ms| ms > 0);

        let pool_capacity: usize = std::env::var("STRAIT_POOL_CAPACITY")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("STRAIT_POOL_CAPACITY must be an integer.")?
            .unwrap_or(512)
            .max(1);

        let max_connections: usize = std::env::var("STRAIT_MAX_CONNECTIONS")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("STRAIT_MAX_CONNECTIONS must be an integer.")?
            .unwrap_or(4096)
            .max(1);

        let udp_session_timeout_ms: u64 = std::env::var("STRAIT_UDP_SESSION_TIMEOUT_MS")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("STRAIT_UDP_SESSION_TIMEOUT_MS must be an integer (milliseconds).")?
            .unwrap_or(30_000)
            .max(100);

        let udp_max_sessions: usize = std::env::var("STRAIT_UDP_MAX_SESSIONS")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("STRAIT_UDP_MAX_SESSIONS must be an integer.")?
            .unwrap_or(1024)
            .max(1);

        let log_level = std::env::var("STRAIT_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            listen_addr,
            upstream_addr,
            udp_listen_addr,
            udp_upstream_addr,
            admin_addr,
            sniff_enabled,
            sniff_timeout_ms,
            idle_timeout_ms,
            pool_capacity,
            max_connections,
            udp_session_timeout_ms,
            udp_max_sessions,
            log_level,
        })
    }

    /// Sniff read deadline as a [`Duration`].
    pub fn sniff_timeout(&self) -> Duration {
        Duration::from_millis(self.sniff_timeout_ms)
    }

    /// Relay idle timeout as a [`Duration`], when configured.
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_ms.map(Duration::from_millis)
    }

    /// UDP session idle timeout as a [`Duration`].
    pub fn udp_session_timeout(&self) -> Duration {
        Duration::from_millis(self.udp_session_timeout_ms)
    }
}
