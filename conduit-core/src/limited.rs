//! Limited stream adapter: caps how many bytes may be read and/or
//! written, used to frame `Content-Length` bodies.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::stream::{SharedStream, Stream};
use crate::timeout::Timeouts;

/// What `write_eof` should do when the declared write limit was not
/// fully written. The spec leaves this ambiguous on purpose — callers
/// must opt in rather than have one guessed for them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShortWriteEofPolicy {
    /// Zero-pad the remainder so the peer sees exactly the declared
    /// length (satisfies downstream framing expectations that count on a
    /// fixed-length body).
    PadWithZeros,
    /// Surface an error instead of silently padding.
    Error,
}

/// Caps reads to at most `read_limit` bytes and writes to at most
/// `write_limit` bytes over an inner stream.
pub struct LimitedStream {
    inner: SharedStream,
    read_remaining: AtomicI64,
    write_remaining: AtomicI64,
    eof_policy: ShortWriteEofPolicy,
    eof_sent: AtomicBool,
    putback: Mutex<Bytes>,
    was_timeout: AtomicBool,
}

impl LimitedStream {
    #[must_use]
    pub fn new(inner: SharedStream, read_limit: u64, write_limit: u64, eof_policy: ShortWriteEofPolicy) -> Self {
        Self {
            inner,
            read_remaining: AtomicI64::new(read_limit as i64),
            write_remaining: AtomicI64::new(write_limit as i64),
            eof_policy,
            eof_sent: AtomicBool::new(false),
            putback: Mutex::new(Bytes::new()),
            was_timeout: AtomicBool::new(false),
        }
    }

    /// A read-only limited stream (e.g. framing an HTTP request body).
    #[must_use]
    pub fn read_only(inner: SharedStream, read_limit: u64) -> Self {
        Self::new(inner, read_limit, 0, ShortWriteEofPolicy::Error)
    }

    /// A write-only limited stream (e.g. framing an HTTP response body
    /// with a known `Content-Length`).
    #[must_use]
    pub fn write_only(inner: SharedStream, write_limit: u64, eof_policy: ShortWriteEofPolicy) -> Self {
        Self::new(inner, 0, write_limit, eof_policy)
    }

    #[must_use]
    pub fn read_remaining(&self) -> u64 {
        self.read_remaining.load(Ordering::Acquire).max(0) as u64
    }

    #[must_use]
    pub fn write_remaining(&self) -> u64 {
        self.write_remaining.load(Ordering::Acquire).max(0) as u64
    }
}

#[async_trait]
impl Stream for LimitedStream {
    async fn read(&self) -> io::Result<Bytes> {
        {
            let mut pb = self.putback.lock();
            if !pb.is_empty() {
                return Ok(std::mem::take(&mut pb));
            }
        }
        if self.read_remaining() == 0 {
            self.was_timeout.store(false, Ordering::Release);
            return Ok(Bytes::new());
        }
        let chunk = self.inner.read().await?;
        if chunk.is_empty() {
            self.was_timeout.store(self.inner.is_read_timeout(), Ordering::Release);
            return Ok(chunk);
        }
        let remaining = self.read_remaining() as usize;
        let take = chunk.len().min(remaining);
        let out = chunk.slice(0..take);
        if take < chunk.len() {
            self.inner.put_back(chunk.slice(take..));
        }
        self.read_remaining.fetch_sub(take as i64, Ordering::AcqRel);
        self.was_timeout.store(false, Ordering::Release);
        Ok(out)
    }

    async fn read_nb(&self) -> Bytes {
        {
            let mut pb = self.putback.lock();
            if !pb.is_empty() {
                return std::mem::take(&mut pb);
            }
        }
        if self.read_remaining() == 0 {
            return Bytes::new();
        }
        let chunk = self.inner.read_nb().await;
        let remaining = self.read_remaining() as usize;
        let take = chunk.len().min(remaining);
        let out = chunk.slice(0..take);
        if take < chunk.len() {
            self.inner.put_back(chunk.slice(take..));
        }
        self.read_remaining.fetch_sub(take as i64, Ordering::AcqRel);
        out
    }

    fn put_back(&self, bytes: Bytes) {
        *self.putback.lock() = bytes;
    }

    async fn write(&self, buf: &[u8]) -> io::Result<bool> {
        let remaining = self.write_remaining() as usize;
        if buf.len() > remaining {
            return Ok(false);
        }
        if buf.is_empty() {
            return Ok(true);
        }
        let ok = self.inner.write(buf).await?;
        if ok {
            self.write_remaining.fetch_sub(buf.len() as i64, Ordering::AcqRel);
        }
        Ok(ok)
    }

    async fn write_eof(&self) -> bool {
        if self.eof_sent.swap(true, Ordering::AcqRel) {
            return false;
        }
        let remaining = self.write_remaining();
        if remaining > 0 {
            match self.eof_policy {
                ShortWriteEofPolicy::PadWithZeros => {
                    let pad = vec![0u8; remaining as usize];
                    let _ = self.inner.write(&pad).await;
                    self.write_remaining.store(0, Ordering::Release);
                }
                ShortWriteEofPolicy::Error => {
                    self.inner.shutdown();
                    return false;
                }
            }
        }
        true
    }

    fn shutdown(&self) {
        self.inner.shutdown();
    }

    fn is_read_timeout(&self) -> bool {
        self.was_timeout.load(Ordering::Acquire)
    }

    fn get_timeouts(&self) -> Timeouts {
        self.inner.get_timeouts()
    }

    fn set_timeouts(&self, timeouts: Timeouts) {
        self.inner.set_timeouts(timeouts);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    mod mem {
        include!("test_support/memstream.rs");
    }
    use mem::MemStream;

    #[test]
    fn read_yields_at_most_remaining() {
        let inner: SharedStream = Arc::new(MemStream::with_input(b"abcdef".to_vec()));
        let limited = LimitedStream::read_only(inner, 3);
        let out = futures::executor::block_on(limited.read()).unwrap();
        assert_eq!(&out[..], b"abc");
        let out2 = futures::executor::block_on(limited.read()).unwrap();
        assert!(out2.is_empty());
        assert!(!limited.is_read_timeout());
    }

    #[test]
    fn write_beyond_limit_returns_false() {
        let inner: SharedStream = Arc::new(MemStream::new());
        let limited = LimitedStream::write_only(inner, 2, ShortWriteEofPolicy::Error);
        let ok = futures::executor::block_on(limited.write(b"abc")).unwrap();
        assert!(!ok);
    }

    #[test]
    fn write_eof_pads_short_write() {
        let inner = Arc::new(MemStream::new());
        let shared: SharedStream = inner.clone();
        let limited = LimitedStream::write_only(shared, 4, ShortWriteEofPolicy::PadWithZeros);
        futures::executor::block_on(async {
            limited.write(b"ab").await.unwrap();
            limited.write_eof().await;
        });
        assert_eq!(inner.written(), vec![b'a', b'b', 0, 0]);
    }

    #[test]
    fn write_eof_is_idempotent() {
        let inner: SharedStream = Arc::new(MemStream::new());
        let limited = LimitedStream::write_only(inner, 0, ShortWriteEofPolicy::Error);
        futures::executor::block_on(async {
            assert!(limited.write_eof().await);
            assert!(!limited.write_eof().await);
        });
    }
}
