//! TCP and UDP front ends.
//!
//! This module provides:
//! - TCP listener management with connection admission
//! - SNI sniffing on accepted connections (via `strait-admission`)
//! - Connection hand-off to a pluggable stream handler
//! - A built-in handler that relays bytes to a single upstream
//! - A UDP relay with per-peer sessions
//!
//! ## Architecture
//!
//! ```text
//! Client ──TCP──> Listener ──> Sniffer ──> Context ──> StreamHandler ──> Upstream
//!                                  │
//!                           (peeked bytes replayed)
//!
//! Client ──UDP──> UdpRelay ──> per-peer session socket ──> Upstream
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use proxy::{Listener, ListenerConfig, RelayHandler};
//!
//! let sniffer = Sniffer::new(Arc::new(BufferPool::new(512)));
//! let handler = Arc::new(RelayHandler::new(upstream_addr));
//!
//! let config = ListenerConfig::new("[::]:8443".parse()?);
//! let listener = Arc::new(Listener::bind(config, sniffer, handler).await?);
//! listener.run(shutdown_rx).await?;
//! ```

mod relay;
mod tcp;
mod udp;

pub use relay::{relay_streams, RelayHandler, StreamHandler};
pub use tcp::{
    Listener, ListenerConfig, ListenerStats, ListenerStatsSnapshot, DEFAULT_MAX_CONNECTIONS,
};
pub use udp::{UdpRelay, UdpRelayConfig, UdpRelayStats, UdpRelayStatsSnapshot};
