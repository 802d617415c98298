pub mod admin;
pub mod config;
pub mod proxy;

pub use proxy::{
    relay_streams, Listener, ListenerConfig, ListenerStats, ListenerStatsSnapshot, RelayHandler,
    StreamHandler, UdpRelay, UdpRelayConfig, UdpRelayStats, UdpRelayStatsSnapshot,
    DEFAULT_MAX_CONNECTIONS,
};
