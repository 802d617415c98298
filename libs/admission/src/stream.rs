//! Replay wrapper returned by a sniff.
//!
//! The sniffer consumes the first bytes of a connection; this wrapper hands
//! them back. Reads drain the captured prefix first, then fall through to
//! the underlying stream, so a consumer observes exactly the byte sequence
//! the peer wrote. Writes and shutdown delegate untouched.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// A stream connection with a sniffed prefix and the hostname it revealed.
#[derive(Debug)]
pub struct SniffedStream<S> {
    inner: S,
    prefix: Bytes,
    hostname: Option<String>,
}

impl<S> SniffedStream<S> {
    /// Wrap `inner` so that `prefix` is replayed before its own bytes.
    pub fn new(inner: S, prefix: Bytes, hostname: Option<String>) -> Self {
        Self {
            inner,
            prefix,
            hostname,
        }
    }

    /// Wrap `inner` without a prefix or hostname. Reads and writes behave
    /// exactly as on the bare stream.
    pub fn passthrough(inner: S) -> Self {
        Self::new(inner, Bytes::new(), None)
    }

    /// Hostname the peer requested via SNI, if the sniff found one.
    pub fn hostname(&self) -> Option<&str> {
        self.hostname.as_deref()
    }

    /// Captured bytes not yet replayed to a reader.
    pub fn pending_prefix(&self) -> &[u8] {
        &self.prefix
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// Unwrap the underlying stream, discarding any unreplayed prefix.
    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for SniffedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if !this.prefix.is_empty() {
            let n = this.prefix.len().min(buf.remaining());
            buf.put_slice(&this.prefix[..n]);
            this.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }

        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for SniffedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
