//! # strait-admission
//!
//! Connection admission for the strait proxy: everything that happens
//! between `accept()` and the first routing decision.
//!
//! ## What lives here
//!
//! - Passive SNI sniffing: a single bounded peek at a fresh TCP stream,
//!   parsed as a TLS ClientHello, yielding the requested hostname when
//!   one is present (`sniff`)
//! - Replay wrappers that hand the peeked bytes back to the next reader
//!   so sniffing is invisible downstream (`stream`)
//! - A shared pool of peek buffers so admission does not allocate per
//!   connection under load (`pool`)
//! - The per-peer [`Context`] descriptor consumed by routing and logging
//!   (`context`)
//!
//! ## Guarantees
//!
//! - Sniffing never alters the byte stream: a consumer of the wrapped
//!   connection observes exactly the bytes the peer sent, in order
//! - Sniffing never fails a connection over parsing: only transport
//!   errors on the initial read propagate
//! - A silent peer costs at most the configured read timeout, then falls
//!   through to ordinary handling

pub mod context;
pub mod pool;
pub mod sniff;
pub mod stream;

pub use context::{Context, StreamFacts};
pub use pool::{BufferPool, PeekBuffer, PoolStats, DEFAULT_POOL_CAPACITY, PEEK_BUFFER_SIZE};
pub use sniff::Sniffer;
pub use stream::SniffedStream;
