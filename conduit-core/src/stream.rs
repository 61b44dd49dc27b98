//! The stream contract: an abstract bidirectional byte stream with
//! putback, EOF-vs-timeout discrimination, and timeouts.
//!
//! `read()` returns `Bytes` rather than a borrowed slice: this keeps the
//! trait object-safe (needed so adapters can wrap a `Box<dyn Stream>`
//! without knowing the concrete type underneath) while `Bytes` itself is
//! refcounted, so adapters that only need to re-slice what they were
//! handed still avoid copying.

use async_trait::async_trait;
use bytes::Bytes;

use crate::timeout::Timeouts;

/// A bidirectional byte stream over socket, pipe, or a framing adapter.
///
/// At most one reader and one writer operate concurrently; the two
/// directions are otherwise independent (no synchronization needed
/// between a task reading and a task writing the same stream).
#[async_trait]
pub trait Stream: Send + Sync {
    /// Read the next chunk. An empty result means either a recoverable
    /// timeout (`is_read_timeout() == true`, safe to call `read` again) or
    /// a terminal EOF (`false`, no further data will ever arrive).
    async fn read(&self) -> std::io::Result<Bytes>;

    /// Return immediately-available bytes without suspending; empty if
    /// none are buffered. Never fails.
    async fn read_nb(&self) -> Bytes;

    /// Stash `bytes` to be returned by the very next `read`/`read_nb`.
    /// Overwrites any previous putback; single slot. May only be called
    /// by the reader between reads.
    fn put_back(&self, bytes: Bytes);

    /// Write `buf`. Returns `true` if progress was made, `false` if the
    /// peer closed or the write is now terminal (post-`write_eof`).
    async fn write(&self, buf: &[u8]) -> std::io::Result<bool>;

    /// Shut down the write direction. Idempotent: returns `true` the
    /// first time, `false` thereafter. After this, `write` always returns
    /// `false`.
    async fn write_eof(&self) -> bool;

    /// Unblock any pending read/write on this stream so they return
    /// empty/`false`. Idempotent. Never raises.
    fn shutdown(&self);

    /// True if the most recent empty `read()` was a timeout rather than
    /// EOF.
    fn is_read_timeout(&self) -> bool;

    fn get_timeouts(&self) -> Timeouts;

    fn set_timeouts(&self, timeouts: Timeouts);
}

/// A stream shared by value: `Arc<dyn Stream>`. Adapters own their
/// wrapped stream exclusively by holding one of these; cloning shares the
/// underlying object (lifetime = longest holder), never the state.
pub type SharedStream = std::sync::Arc<dyn Stream>;

/// The stream that reads nothing and accepts no writes.
///
/// Useful as a placeholder where the contract requires a stream but the
/// caller has none yet (e.g. an HTTP request with no body).
pub struct NullStream;

#[async_trait]
impl Stream for NullStream {
    async fn read(&self) -> std::io::Result<Bytes> {
        Ok(Bytes::new())
    }

    async fn read_nb(&self) -> Bytes {
        Bytes::new()
    }

    fn put_back(&self, _bytes: Bytes) {}

    async fn write(&self, _buf: &[u8]) -> std::io::Result<bool> {
        Ok(false)
    }

    async fn write_eof(&self) -> bool {
        true
    }

    fn shutdown(&self) {}

    fn is_read_timeout(&self) -> bool {
        false
    }

    fn get_timeouts(&self) -> Timeouts {
        Timeouts::none()
    }

    fn set_timeouts(&self, _timeouts: Timeouts) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_stream_read_is_eof_not_timeout() {
        let s = NullStream;
        let bytes = futures::executor::block_on(s.read()).unwrap();
        assert!(bytes.is_empty());
        assert!(!s.is_read_timeout());
    }

    #[test]
    fn null_stream_write_always_false() {
        let s = NullStream;
        let ok = futures::executor::block_on(s.write(b"x")).unwrap();
        assert!(!ok);
    }
}
