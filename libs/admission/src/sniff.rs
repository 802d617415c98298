//! Passive SNI extraction from the first bytes of a stream.
//!
//! A sniff performs exactly one deadline-bounded read into a pooled buffer,
//! tries to parse the captured window as a TLS ClientHello, and returns a
//! [`SniffedStream`] that replays the window. The TLS session is never
//! terminated and the byte stream is never altered; the only outputs are a
//! hostname and a transparent wrapper.
//!
//! Outcome classification:
//! - deadline passed with no data: success, untouched stream, no hostname
//! - transport error or immediate EOF: the connection is unusable, error
//! - anything readable: success; absent or unparseable SNI is an empty
//!   result, never an error

use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::pool::BufferPool;
use crate::stream::SniffedStream;

const RECORD_TYPE_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_TYPE_CLIENT_HELLO: u8 = 0x01;
const EXTENSION_SERVER_NAME: u16 = 0x0000;
const NAME_TYPE_HOST: u8 = 0x00;

/// Sniffs accepted connections using buffers from an injected pool.
#[derive(Debug)]
pub struct Sniffer {
    pool: Arc<BufferPool>,
}

impl Sniffer {
    pub fn new(pool: Arc<BufferPool>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Peek at the first bytes of `stream` and wrap it for replay.
    ///
    /// Performs a single read bounded by `read_timeout`. On timeout the
    /// stream is handed back untouched with no hostname; only transport
    /// failures (including EOF before any bytes) surface as errors. The
    /// pooled peek buffer is released on every path out of this function.
    pub async fn sniff<S>(&self, mut stream: S, read_timeout: Duration) -> io::Result<SniffedStream<S>>
    where
        S: AsyncRead + Unpin,
    {
        let mut peek = self.pool.acquire();

        let n = match timeout(read_timeout, stream.read(&mut peek[..])).await {
            Err(_) => {
                debug!("peek read timed out, admitting connection unsniffed");
                return Ok(SniffedStream::passthrough(stream));
            }
            Ok(Err(e)) => return Err(e),
            Ok(Ok(0)) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before any bytes arrived",
                ))
            }
            Ok(Ok(n)) => n,
        };

        let hostname = extract_sni(&peek[..n]);
        match &hostname {
            Some(host) => debug!(hostname = %host, peeked = n, "SNI extracted"),
            None => trace!(peeked = n, "no SNI in peeked bytes"),
        }

        // Private copy: the pooled buffer is reused for another connection
        // as soon as the guard drops.
        let prefix = Bytes::copy_from_slice(&peek[..n]);

        Ok(SniffedStream::new(stream, prefix, hostname))
    }
}

/// Extract the SNI hostname from a captured TLS ClientHello window.
///
/// Record layout: content type (1), protocol version (2), length (2),
/// then a handshake message: type (1), length (3), ClientHello body.
/// The body carries version (2), random (32), then length-prefixed
/// session ID, cipher suites, compression methods, and extensions.
///
/// Every declared length is checked against the captured window; a field
/// that would run past it aborts the parse. The window may legitimately
/// end mid-hello when the peer's ClientHello is larger than one read
/// captured, so an overrun means "not sniffable", not "malformed peer".
fn extract_sni(data: &[u8]) -> Option<String> {
    if data.len() < 5 || data[0] != RECORD_TYPE_HANDSHAKE {
        return None;
    }
    // Plausible version tag: major 3, minor within the SSL3..TLS1.3 range.
    if data[1] != 0x03 || data[2] > 0x04 {
        return None;
    }

    let handshake = &data[5..];
    if handshake.len() < 4 || handshake[0] != HANDSHAKE_TYPE_CLIENT_HELLO {
        return None;
    }

    let hello = &handshake[4..];
    // Fixed prefix: version (2) + random (32) + session ID length byte.
    if hello.len() < 35 {
        return None;
    }
    let mut pos = 34;

    let session_id_len = hello[pos] as usize;
    pos += 1 + session_id_len;

    if pos + 2 > hello.len() {
        return None;
    }
    let cipher_suites_len = u16::from_be_bytes([hello[pos], hello[pos + 1]]) as usize;
    pos += 2 + cipher_suites_len;

    if pos + 1 > hello.len() {
        return None;
    }
    let compression_len = hello[pos] as usize;
    pos += 1 + compression_len;

    if pos + 2 > hello.len() {
        return None;
    }
    let extensions_len = u16::from_be_bytes([hello[pos], hello[pos + 1]]) as usize;
    pos += 2;
    let extensions_end = pos + extensions_len;
    if extensions_end > hello.len() {
        return None;
    }

    while pos + 4 <= extensions_end {
        let ext_type = u16::from_be_bytes([hello[pos], hello[pos + 1]]);
        let ext_len = u16::from_be_bytes([hello[pos + 2], hello[pos + 3]]) as usize;
        pos += 4;
        if pos + ext_len > extensions_end {
            return None;
        }
        if ext_type == EXTENSION_SERVER_NAME {
            return parse_server_name(&hello[pos..pos + ext_len]);
        }
        pos += ext_len;
    }

    None
}

/// Walk the server name list and return the first host_name entry.
fn parse_server_name(ext: &[u8]) -> Option<String> {
    if ext.len() < 2 {
        return None;
    }
    let list_len = u16::from_be_bytes([ext[0], ext[1]]) as usize;
    let list_end = 2 + list_len;
    if list_end > ext.len() {
        return None;
    }

    let mut pos = 2;
    while pos + 3 <= list_end {
        let name_type = ext[pos];
        let name_len = u16::from_be_bytes([ext[pos + 1], ext[pos + 2]]) as usize;
        pos += 3;
        if pos + name_len > list_end {
            return None;
        }
        if name_type == NAME_TYPE_HOST {
            let name = std::str::from_utf8(&ext[pos..pos + name_len]).ok()?;
            if name.is_empty() {
                return None;
            }
            return Some(name.to_string());
        }
        pos += name_len;
    }

    None
}
