//! Per-connection peer descriptors.
//!
//! Routing and logging code downstream of admission only ever needs three
//! facts about a peer: its address, its port, and the hostname it asked
//! for. [`Context`] packages those facts uniformly for stream and datagram
//! transports so consumers never branch on the transport kind themselves.

use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};

use tokio::net::TcpStream;

use crate::stream::SniffedStream;

/// Facts a live stream can report about its peer.
///
/// Implementations must not perform I/O beyond querying connection
/// metadata. `requested_host` defaults to `None`; only streams that went
/// through admission sniffing override it.
pub trait StreamFacts {
    /// Remote address of the peer, read live from the transport.
    fn peer_addr(&self) -> io::Result<SocketAddr>;

    /// Hostname the peer asked for during the handshake, if one was
    /// captured.
    fn requested_host(&self) -> Option<&str> {
        None
    }
}

impl StreamFacts for TcpStream {
    fn peer_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::peer_addr(self)
    }
}

impl<S: StreamFacts> StreamFacts for SniffedStream<S> {
    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.get_ref().peer_addr()
    }

    fn requested_host(&self) -> Option<&str> {
        self.hostname().or_else(|| self.get_ref().requested_host())
    }
}

/// Read-only descriptor of one admitted peer.
///
/// The stream variant borrows the live connection and derives every
/// answer from it at call time; nothing is cached, the transport stays
/// the single source of truth. The datagram variant owns the address
/// captured when the packet arrived, since no connection object exists
/// for UDP peers, and never reports a hostname.
#[derive(Clone, Copy)]
pub enum Context<'a> {
    /// Connection-oriented peer; facts are read live from the stream.
    Stream(&'a dyn StreamFacts),
    /// Datagram peer captured at receive time.
    Datagram(SocketAddr),
}

impl<'a> Context<'a> {
    pub fn stream(stream: &'a dyn StreamFacts) -> Self {
        Context::Stream(stream)
    }

    pub fn datagram(peer: SocketAddr) -> Self {
        Context::Datagram(peer)
    }

    /// Remote address of the peer.
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        match self {
            Context::Stream(stream) => stream.peer_addr(),
            Context::Datagram(addr) => Ok(*addr),
        }
    }

    /// Remote IP of the peer.
    pub fn peer_ip(&self) -> io::Result<IpAddr> {
        self.peer_addr().map(|addr| addr.ip())
    }

    /// Remote port of the peer.
    pub fn peer_port(&self) -> io::Result<u16> {
        self.peer_addr().map(|addr| addr.port())
    }

    /// Hostname the peer asked for, or `""` when none was captured.
    ///
    /// Datagram peers never carry a handshake at this layer, so the
    /// answer for them is always empty.
    pub fn requested_host(&self) -> &str {
        match self {
            Context::Stream(stream) => stream.requested_host().unwrap_or(""),
            Context::Datagram(_) => "",
        }
    }
}

/// Human-readable peer identity, `ip:port` or `-` when the transport can
/// no longer report an address.
impl fmt::Display for Context<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.peer_addr() {
            Ok(addr) => write!(f, "{addr}"),
            Err(_) => f.write_str("-"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use bytes::Bytes;
    use tokio::net::TcpListener;

    struct FakePeer {
        addr: Option<SocketAddr>,
        host: Option<&'static str>,
    }

    impl StreamFacts for FakePeer {
        fn peer_addr(&self) -> io::Result<SocketAddr> {
            self.addr
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "peer gone"))
        }

        fn requested_host(&self) -> Option<&str> {
            self.host
        }
    }

    #[test]
    fn datagram_context_reports_captured_address() {
        let addr: SocketAddr = "203.0.113.9:5353".parse().unwrap();
        let ctx = Context::datagram(addr);

        assert_eq!(ctx.peer_addr().unwrap(), addr);
        assert_eq!(ctx.peer_ip().unwrap(), addr.ip());
        assert_eq!(ctx.peer_port().unwrap(), 5353);
        assert_eq!(ctx.to_string(), "203.0.113.9:5353");
    }

    #[test]
    fn datagram_context_never_has_a_hostname() {
        for addr in ["192.0.2.1:443", "[2001:db8::7]:8443", "127.0.0.1:1"] {
            let ctx = Context::datagram(addr.parse().unwrap());
            assert_eq!(ctx.requested_host(), "");
        }
    }

    #[test]
    fn stream_context_reads_facts_live() {
        let addr: SocketAddr = "198.51.100.4:50211".parse().unwrap();
        let peer = FakePeer {
            addr: Some(addr),
            host: Some("h"),
        };
        let ctx = Context::stream(&peer);

        assert_eq!(ctx.requested_host(), "h");
        assert_eq!(ctx.peer_ip().unwrap(), addr.ip());
        assert_eq!(ctx.peer_port().unwrap(), 50211);
        let identity = ctx.to_string();
        assert!(identity.contains("198.51.100.4"));
        assert!(identity.contains("50211"));
    }

    #[test]
    fn unsniffed_stream_yields_empty_hostname() {
        let peer = FakePeer {
            addr: Some("198.51.100.4:1024".parse().unwrap()),
            host: None,
        };
        assert_eq!(Context::stream(&peer).requested_host(), "");
    }

    #[test]
    fn lost_peer_renders_placeholder_identity() {
        let peer = FakePeer {
            addr: None,
            host: None,
        };
        let ctx = Context::stream(&peer);

        assert!(ctx.peer_addr().is_err());
        assert_eq!(ctx.to_string(), "-");
    }

    #[test]
    fn sniffed_wrapper_surfaces_its_hostname() {
        let inner = FakePeer {
            addr: Some("198.51.100.4:2048".parse().unwrap()),
            host: None,
        };
        let wrapped = SniffedStream::new(inner, Bytes::new(), Some("example.com".into()));
        let ctx = Context::stream(&wrapped);

        assert_eq!(ctx.requested_host(), "example.com");
        assert_eq!(ctx.peer_port().unwrap(), 2048);
    }

    #[test]
    fn passthrough_wrapper_defers_to_inner_facts() {
        let inner = FakePeer {
            addr: Some("198.51.100.4:2049".parse().unwrap()),
            host: Some("inner.test"),
        };
        let wrapped = SniffedStream::passthrough(inner);

        assert_eq!(Context::stream(&wrapped).requested_host(), "inner.test");
    }

    #[tokio::test]
    async fn tcp_stream_reports_live_peer_address() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, peer) = listener.accept().await.unwrap();

        let ctx = Context::stream(&server);
        assert_eq!(ctx.peer_addr().unwrap(), peer);
        assert_eq!(ctx.requested_host(), "");
        assert_eq!(ctx.to_string(), peer.to_string());
        drop(client);
    }

    #[tokio::test]
    async fn wrapped_tcp_stream_keeps_address_and_adds_hostname() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, peer) = listener.accept().await.unwrap();

        let wrapped = SniffedStream::new(server, Bytes::new(), Some("h".into()));
        let ctx = Context::stream(&wrapped);
        assert_eq!(ctx.requested_host(), "h");
        assert_eq!(ctx.peer_addr().unwrap(), peer);
        drop(client);
    }
}
