//! Reusable peek buffers shared across all admitted connections.
//!
//! Sniffing every accepted connection with a freshly allocated 16 KiB buffer
//! churns the allocator under high accept rates. The pool keeps a bounded
//! free list of fixed-size buffers; acquiring falls back to a fresh
//! allocation when the list is empty, so it never blocks and never fails.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;

/// Size of every pooled peek buffer: TLS record header (5 bytes) plus the
/// largest handshake record payload (16384 bytes) a single sniff can see.
pub const PEEK_BUFFER_SIZE: usize = 16385;

/// Default number of idle buffers the pool retains.
pub const DEFAULT_POOL_CAPACITY: usize = 512;

/// Counters describing pool behavior, shared with the admin API.
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Buffers handed out from the free list.
    pub reused: AtomicU64,
    /// Buffers allocated because the free list was empty.
    pub allocated: AtomicU64,
    /// Buffers accepted back into the free list.
    pub returned: AtomicU64,
    /// Buffers dropped on release because the free list was full.
    pub discarded: AtomicU64,
}

impl PoolStats {
    pub fn reused(&self) -> u64 {
        self.reused.load(Ordering::Relaxed)
    }

    pub fn allocated(&self) -> u64 {
        self.allocated.load(Ordering::Relaxed)
    }

    pub fn returned(&self) -> u64 {
        self.returned.load(Ordering::Relaxed)
    }

    pub fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }
}

/// Lock-free pool of fixed-size peek buffers.
///
/// Buffers are handed out as [`PeekBuffer`] guards and return to the free
/// list when the guard drops, so release happens on every exit path of a
/// sniff. Contents are not cleared between uses; a consumer must only look
/// at the bytes its own read filled in.
#[derive(Debug)]
pub struct BufferPool {
    free: ArrayQueue<Vec<u8>>,
    buffer_size: usize,
    stats: PoolStats,
}

impl BufferPool {
    /// Pool of [`PEEK_BUFFER_SIZE`] buffers with the given free-list capacity.
    pub fn new(capacity: usize) -> Self {
        Self::with_buffer_size(capacity, PEEK_BUFFER_SIZE)
    }

    /// Pool with a custom per-buffer size. Small sizes keep tests cheap.
    pub fn with_buffer_size(capacity: usize, buffer_size: usize) -> Self {
        Self {
            free: ArrayQueue::new(capacity.max(1)),
            buffer_size,
            stats: PoolStats::default(),
        }
    }

    /// Take a buffer from the free list, or allocate one if it is empty.
    pub fn acquire(self: &Arc<Self>) -> PeekBuffer {
        let buf = match self.free.pop() {
            Some(mut buf) => {
                self.stats.reused.fetch_add(1, Ordering::Relaxed);
                if buf.len() != self.buffer_size {
                    buf.resize(self.buffer_size, 0);
                }
                buf
            }
            None => {
                self.stats.allocated.fetch_add(1, Ordering::Relaxed);
                vec![0u8; self.buffer_size]
            }
        };

        PeekBuffer {
            buf: Some(buf),
            pool: Arc::clone(self),
        }
    }

    fn release(&self, buf: Vec<u8>) {
        match self.free.push(buf) {
            Ok(()) => {
                self.stats.returned.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.stats.discarded.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Size of each buffer in bytes.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Buffers currently sitting idle in the free list.
    pub fn idle(&self) -> usize {
        self.free.len()
    }

    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }
}

/// A peek buffer on loan from a [`BufferPool`].
///
/// Dereferences to the full buffer slice. Dropping the guard returns the
/// buffer to its pool.
#[derive(Debug)]
pub struct PeekBuffer {
    buf: Option<Vec<u8>>,
    pool: Arc<BufferPool>,
}

impl Drop for PeekBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.release(buf);
        }
    }
}

impl Deref for PeekBuffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.buf.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for PeekBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.buf.as_deref_mut().unwrap_or(&mut [])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_allocates_when_empty() {
        let pool = Arc::new(BufferPool::with_buffer_size(4, 64));
        let buf = pool.acquire();
        assert_eq!(buf.len(), 64);
        assert_eq!(pool.stats().allocated(), 1);
        assert_eq!(pool.stats().reused(), 0);
    }

    #[test]
    fn drop_returns_buffer_for_reuse() {
        let pool = Arc::new(BufferPool::with_buffer_size(4, 64));
        let buf = pool.acquire();
        drop(buf);
        assert_eq!(pool.idle(), 1);
        assert_eq!(pool.stats().returned(), 1);

        let _again = pool.acquire();
        assert_eq!(pool.idle(), 0);
        assert_eq!(pool.stats().reused(), 1);
        assert_eq!(pool.stats().allocated(), 1);
    }

    #[test]
    fn full_free_list_discards_on_release() {
        let pool = Arc::new(BufferPool::with_buffer_size(1, 64));
        let a = pool.acquire();
        let b = pool.acquire();
        drop(a);
        drop(b);
        assert_eq!(pool.idle(), 1);
        assert_eq!(pool.stats().returned(), 1);
        assert_eq!(pool.stats().discarded(), 1);
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let pool = Arc::new(BufferPool::with_buffer_size(0, 64));
        let buf = pool.acquire();
        drop(buf);
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn concurrent_acquire_release() {
        use std::thread;

        let pool = Arc::new(BufferPool::with_buffer_size(32, 64));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || {
                    for i in 0..200 {
                        let mut buf = pool.acquire();
                        buf[0] = i as u8;
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let stats = pool.stats();
        assert_eq!(stats.allocated() + stats.reused(), 1600);
        assert_eq!(stats.returned() + stats.discarded(), 1600);
    }
}
