// Shared `Stream` test double: a queue of input fragments returned one
// per `read()` call, plus a growable buffer of whatever was written.
// `include!`-ed into `#[cfg(test)]` modules rather than exported, since
// it has no reason to exist outside unit tests.

use std::io;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::stream::Stream;

struct MemStream {
    input: Mutex<std::collections::VecDeque<Vec<u8>>>,
    written: Mutex<Vec<u8>>,
    eof_sent: std::sync::atomic::AtomicBool,
    shutdown_called: std::sync::atomic::AtomicBool,
}

impl MemStream {
    fn new() -> Self {
        Self {
            input: Mutex::new(std::collections::VecDeque::new()),
            written: Mutex::new(Vec::new()),
            eof_sent: std::sync::atomic::AtomicBool::new(false),
            shutdown_called: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// A single input fragment returned whole by the first `read()`.
    fn with_input(data: Vec<u8>) -> Self {
        let s = Self::new();
        s.input.lock().push_back(data);
        s
    }

    /// Queue another fragment to be returned by a later `read()`, in the
    /// order pushed (first pushed, first returned).
    fn push_front_input(&self, data: &[u8]) {
        self.input.lock().push_front(data.to_vec());
    }

    fn written(&self) -> Vec<u8> {
        self.written.lock().clone()
    }

    fn was_shutdown(&self) -> bool {
        self.shutdown_called.load(std::sync::atomic::Ordering::Acquire)
    }
}

#[async_trait]
impl Stream for MemStream {
    async fn read(&self) -> io::Result<Bytes> {
        let next = self.input.lock().pop_front();
        Ok(next.map(Bytes::from).unwrap_or_default())
    }

    async fn read_nb(&self) -> Bytes {
        self.read().await.unwrap_or_default()
    }

    fn put_back(&self, bytes: Bytes) {
        if !bytes.is_empty() {
            self.input.lock().push_front(bytes.to_vec());
        }
    }

    async fn write(&self, buf: &[u8]) -> io::Result<bool> {
        self.written.lock().extend_from_slice(buf);
        Ok(true)
    }

    async fn write_eof(&self) -> bool {
        !self.eof_sent.swap(true, std::sync::atomic::Ordering::AcqRel)
    }

    fn shutdown(&self) {
        self.shutdown_called.store(true, std::sync::atomic::Ordering::Release);
    }

    fn is_read_timeout(&self) -> bool {
        false
    }

    fn get_timeouts(&self) -> crate::timeout::Timeouts {
        crate::timeout::Timeouts::none()
    }

    fn set_timeouts(&self, _timeouts: crate::timeout::Timeouts) {}
}
