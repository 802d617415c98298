//! Connection hand-off and byte relaying.
//!
//! After admission, the listener hands each connection to a
//! [`StreamHandler`]. The built-in [`RelayHandler`] forwards the stream
//! to a single upstream; routing layers can plug in richer handlers
//! without touching the accept path.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use strait_admission::SniffedStream;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Handles one admitted TCP connection.
///
/// The listener calls this after sniffing and admission accounting have
/// finished; the stream replays any peeked bytes transparently. Returns
/// the bytes moved in each direction (to upstream, from upstream) so the
/// listener can account for traffic.
#[async_trait]
pub trait StreamHandler: Send + Sync {
    async fn handle(
        &self,
        stream: SniffedStream<TcpStream>,
        peer_addr: SocketAddr,
    ) -> io::Result<(u64, u64)>;
}

/// Relays every admitted connection to a fixed upstream address.
#[derive(Debug, Clone)]
pub struct RelayHandler {
    upstream_addr: SocketAddr,
    idle_timeout: Option<Duration>,
}

impl RelayHandler {
    pub fn new(upstream_addr: SocketAddr) -> Self {
        Self {
            upstream_addr,
            idle_timeout: None,
        }
    }

    /// Close connections once both directions sit idle for `timeout`.
    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }
}

#[async_trait]
impl StreamHandler for RelayHandler {
    async fn handle(
        &self,
        stream: SniffedStream<TcpStream>,
        peer_addr: SocketAddr,
    ) -> io::Result<(u64, u64)> {
        let upstream = match TcpStream::connect(self.upstream_addr).await {
            Ok(upstream) => upstream,
            Err(e) => {
                warn!(
                    peer = %peer_addr,
                    upstream = %self.upstream_addr,
                    error = %e,
                    "Upstream connect failed"
                );
                return Err(e);
            }
        };

        debug!(upstream = %self.upstream_addr, "Upstream connected");
        relay_streams(stream, upstream, self.idle_timeout).await
    }
}

/// Relay data bidirectionally between a client and an upstream stream.
///
/// Returns (bytes_to_upstream, bytes_from_upstream).
pub async fn relay_streams<C, U>(
    client: C,
    upstream: U,
    idle_timeout: Option<Duration>,
) -> io::Result<(u64, u64)>
where
    C: AsyncRead + AsyncWrite,
    U: AsyncRead + AsyncWrite,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    let client_to_upstream = async {
        let mut total = 0u64;
        let mut buf = vec![0u8; 8192];
        loop {
            let read_result = if let Some(timeout) = idle_timeout {
                match tokio::time::timeout(timeout, client_read.read(&mut buf)).await {
                    Ok(result) => result,
                    Err(_) => return Err(io::Error::new(io::ErrorKind::TimedOut, "idle timeout")),
                }
            } else {
                client_read.read(&mut buf).await
            };

            match read_result {
                Ok(0) => break,
                Ok(n) => {
                    upstream_write.write_all(&buf[..n]).await?;
                    total += n as u64;
                }
                Err(e) => return Err(e),
            }
        }
        upstream_write.shutdown().await?;
        Ok(total)
    };

    let upstream_to_client = async {
        let mut total = 0u64;
        let mut buf = vec![0u8; 8192];
        loop {
            let read_result = if let Some(timeout) = idle_timeout {
                match tokio::time::timeout(timeout, upstream_read.read(&mut buf)).await {
                    Ok(result) => result,
                    Err(_) => return Err(io::Error::new(io::ErrorKind::TimedOut, "idle timeout")),
                }
            } else {
                upstream_read.read(&mut buf).await
            };

            match read_result {
                Ok(0) => break,
                Ok(n) => {
                    client_write.write_all(&buf[..n]).await?;
                    total += n as u64;
                }
                Err(e) => return Err(e),
            }
        }
        client_write.shutdown().await?;
        Ok(total)
    };

    let (client_result, upstream_result) = tokio::join!(client_to_upstream, upstream_to_client);

    // Report bytes moved even if one direction errored
    let bytes_to_upstream = client_result.unwrap_or(0);
    let bytes_from_upstream = upstream_result.unwrap_or(0);

    Ok((bytes_to_upstream, bytes_from_upstream))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn relays_bytes_both_ways() {
        let (mut client_far, client_near) = tokio::io::duplex(4096);
        let (upstream_near, mut upstream_far) = tokio::io::duplex(4096);

        let relay = tokio::spawn(relay_streams(client_near, upstream_near, None));

        client_far.write_all(b"hello upstream").await.unwrap();
        client_far.shutdown().await.unwrap();

        let mut forwarded = Vec::new();
        upstream_far.read_to_end(&mut forwarded).await.unwrap();
        assert_eq!(forwarded, b"hello upstream");

        upstream_far.write_all(b"hi client").await.unwrap();
        drop(upstream_far);

        let mut reply = Vec::new();
        client_far.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"hi client");

        let (to_upstream, from_upstream) = relay.await.unwrap().unwrap();
        assert_eq!(to_upstream, 14);
        assert_eq!(from_upstream, 9);
    }

    #[tokio::test]
    async fn chunked_writes_arrive_intact_and_in_order() {
        let (mut client_far, client_near) = tokio::io::duplex(64);
        let (upstream_near, mut upstream_far) = tokio::io::duplex(64);

        let relay = tokio::spawn(relay_streams(client_near, upstream_near, None));

        let payload: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let writer = {
            let payload = payload.clone();
            tokio::spawn(async move {
                for chunk in payload.chunks(7) {
                    client_far.write_all(chunk).await.unwrap();
                }
                client_far.shutdown().await.unwrap();
                client_far
            })
        };

        let mut forwarded = Vec::new();
        upstream_far.read_to_end(&mut forwarded).await.unwrap();
        assert_eq!(forwarded, payload);

        drop(upstream_far);
        let _client_far = writer.await.unwrap();
        let (to_upstream, _) = relay.await.unwrap().unwrap();
        assert_eq!(to_upstream, 1000);
    }

    #[tokio::test]
    async fn idle_timeout_ends_a_silent_relay() {
        let (client_far, client_near) = tokio::io::duplex(64);
        let (upstream_near, upstream_far) = tokio::io::duplex(64);

        let result = tokio::time::timeout(
            Duration::from_secs(2),
            relay_streams(client_near, upstream_near, Some(Duration::from_millis(50))),
        )
        .await
        .expect("relay should end once both directions time out");

        let (to_upstream, from_upstream) = result.unwrap();
        assert_eq!(to_upstream, 0);
        assert_eq!(from_upstream, 0);
        drop(client_far);
        drop(upstream_far);
    }

    #[tokio::test]
    async fn relay_handler_reports_unreachable_upstream() {
        use tokio::net::TcpListener;

        // Bind then drop to obtain an address nothing listens on.
        let vacant = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let vacant_addr = vacant.local_addr().unwrap();
        drop(vacant);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(addr).await.unwrap();
        let (server, peer) = listener.accept().await.unwrap();

        let handler = RelayHandler::new(vacant_addr);
        let result = handler
            .handle(SniffedStream::passthrough(server), peer)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn relay_handler_moves_bytes_through_real_sockets() {
        use tokio::net::TcpListener;

        // Upstream echoes everything it receives.
        let upstream_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream_listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = upstream_listener.accept().await.unwrap();
            let (mut read, mut write) = socket.split();
            tokio::io::copy(&mut read, &mut write).await.unwrap();
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).await.unwrap();
        let (server, peer) = listener.accept().await.unwrap();

        let handler = RelayHandler::new(upstream_addr);
        let relay =
            tokio::spawn(async move { handler.handle(SniffedStream::passthrough(server), peer).await });

        client.write_all(b"echo me").await.unwrap();
        client.shutdown().await.unwrap();
        let mut echoed = Vec::new();
        client.read_to_end(&mut echoed).await.unwrap();
        assert_eq!(echoed, b"echo me");

        let (to_upstream, from_upstream) = relay.await.unwrap().unwrap();
        assert_eq!(to_upstream, 7);
        assert_eq!(from_upstream, 7);
    }
}
