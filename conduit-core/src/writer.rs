//! Multi-producer writer: serialize concurrent writers onto one
//! half-duplex send direction with at-most-one in-flight write.

use std::io;
use std::sync::Arc;

use futures::channel::oneshot;
use parking_lot::Mutex;

use crate::stream::SharedStream;

struct State {
    prepared: Vec<u8>,
    in_flight: bool,
    closed: bool,
    eof_queued: bool,
    eof_sent: bool,
    last_error: Option<io::ErrorKind>,
    flush_waiters: Vec<oneshot::Sender<()>>,
    idle_waiters: Vec<oneshot::Sender<()>>,
}

impl State {
    fn is_idle(&self) -> bool {
        !self.in_flight && self.prepared.is_empty()
    }

    fn has_pending_eof(&self) -> bool {
        self.eof_queued && !self.eof_sent
    }
}

/// Serializes writes from many producers onto one [`SharedStream`],
/// preserving submission order and guaranteeing at most one write is
/// in flight at a time.
pub struct MultiWriter {
    stream: SharedStream,
    executor: Arc<async_executor::Executor<'static>>,
    state: Arc<Mutex<State>>,
}

impl MultiWriter {
    #[must_use]
    pub fn new(stream: SharedStream, executor: Arc<async_executor::Executor<'static>>) -> Self {
        Self {
            stream,
            executor,
            state: Arc::new(Mutex::new(State {
                prepared: Vec::new(),
                in_flight: false,
                closed: false,
                eof_queued: false,
                eof_sent: false,
                last_error: None,
                flush_waiters: Vec::new(),
                idle_waiters: Vec::new(),
            })),
        }
    }

    /// Append `data` for writing. Returns `true` unless the writer is
    /// closed or a prior write already failed (in which case the stored
    /// error is returned again).
    pub fn write(&self, data: &[u8]) -> io::Result<bool> {
        let mut st = self.state.lock();
        if let Some(kind) = st.last_error {
            return Err(io::Error::new(kind, "multi-writer previously failed"));
        }
        if st.closed || st.eof_queued {
            return Ok(false);
        }
        if data.is_empty() {
            return Ok(true);
        }
        st.prepared.extend_from_slice(data);
        self.maybe_launch(&mut st);
        Ok(true)
    }

    /// Queue EOF to be written once the currently in-flight write (and any
    /// already-buffered data) drains. Idempotent.
    pub fn write_eof(&self) {
        let mut st = self.state.lock();
        if st.eof_queued {
            return;
        }
        st.eof_queued = true;
        self.maybe_launch(&mut st);
    }

    /// Mark closing: no further data will be accepted, but whatever is
    /// already buffered still drains.
    pub fn close(&self) {
        let mut st = self.state.lock();
        st.closed = true;
    }

    /// Resolves once the bytes prepared as of this call have entered the
    /// underlying write (not necessarily completed).
    pub async fn wait_for_flush(&self) {
        let rx = {
            let mut st = self.state.lock();
            if st.prepared.is_empty() && !st.in_flight {
                return;
            }
            let (tx, rx) = oneshot::channel();
            st.flush_waiters.push(tx);
            rx
        };
        let _ = rx.await;
    }

    /// Resolves once all buffers are drained and no write is in flight.
    pub async fn wait_for_idle(&self) {
        let rx = {
            let mut st = self.state.lock();
            if st.is_idle() {
                return;
            }
            let (tx, rx) = oneshot::channel();
            st.idle_waiters.push(tx);
            rx
        };
        let _ = rx.await;
    }

    /// Launch the drain loop if nothing is in flight yet and there is
    /// something for it to do. Must be called with `st` locked.
    fn maybe_launch(&self, st: &mut State) {
        if st.in_flight {
            return;
        }
        if st.prepared.is_empty() && !st.has_pending_eof() {
            return;
        }
        st.in_flight = true;

        let stream = Arc::clone(&self.stream);
        let state = Arc::clone(&self.state);
        self.executor.spawn(drain_loop(stream, state)).detach();
    }
}

/// Runs in a spawned task: repeatedly swaps out whatever has accumulated
/// in `prepared` and writes it, until the buffer is truly empty and no
/// EOF is pending. One of these runs at a time per writer (gated by
/// `in_flight`), which is what gives the writer its single-in-flight-write
/// guarantee.
async fn drain_loop(stream: SharedStream, state: Arc<Mutex<State>>) {
    loop {
        let (pending, send_eof) = {
            let mut st = state.lock();
            let pending = std::mem::take(&mut st.prepared);
            let send_eof = st.has_pending_eof();
            for w in st.flush_waiters.drain(..) {
                let _ = w.send(());
            }
            (pending, send_eof)
        };

        if pending.is_empty() && !send_eof {
            break;
        }

        let mut failed = None;
        if !pending.is_empty() {
            match stream.write(&pending).await {
                Ok(true) => {}
                Ok(false) => failed = Some(io::ErrorKind::BrokenPipe),
                Err(e) => failed = Some(e.kind()),
            }
        }

        if failed.is_none() && send_eof {
            let ok = stream.write_eof().await;
            state.lock().eof_sent = ok;
        }

        if let Some(kind) = failed {
            state.lock().last_error = Some(kind);
            break;
        }
    }

    let mut st = state.lock();
    st.in_flight = false;
    if st.is_idle() {
        for w in st.idle_waiters.drain(..) {
            let _ = w.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::Stream;
    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex as PMutex;

    struct RecordingStream {
        received: PMutex<Vec<u8>>,
        eof: PMutex<bool>,
    }

    #[async_trait]
    impl Stream for RecordingStream {
        async fn read(&self) -> io::Result<Bytes> {
            Ok(Bytes::new())
        }
        async fn read_nb(&self) -> Bytes {
            Bytes::new()
        }
        fn put_back(&self, _bytes: Bytes) {}
        async fn write(&self, buf: &[u8]) -> io::Result<bool> {
            self.received.lock().extend_from_slice(buf);
            Ok(true)
        }
        async fn write_eof(&self) -> bool {
            *self.eof.lock() = true;
            true
        }
        fn shutdown(&self) {}
        fn is_read_timeout(&self) -> bool {
            false
        }
        fn get_timeouts(&self) -> crate::timeout::Timeouts {
            crate::timeout::Timeouts::none()
        }
        fn set_timeouts(&self, _timeouts: crate::timeout::Timeouts) {}
    }

    fn run_until_idle(executor: &async_executor::Executor<'static>, writer: &MultiWriter) {
        futures::executor::block_on(async {
            let idle = writer.wait_for_idle();
            futures::pin_mut!(idle);
            loop {
                if executor.try_tick() {
                    continue;
                }
                match futures::future::poll_immediate(&mut idle).await {
                    Some(()) => break,
                    None => std::thread::yield_now(),
                }
            }
        });
    }

    #[test]
    fn preserves_submission_order_and_appends_eof() {
        let executor = Arc::new(async_executor::Executor::new());
        let backing = Arc::new(RecordingStream { received: PMutex::new(Vec::new()), eof: PMutex::new(false) });
        let stream: SharedStream = backing.clone();
        let writer = MultiWriter::new(stream, Arc::clone(&executor));

        writer.write(b"a").unwrap();
        writer.write(b"b").unwrap();
        writer.write(b"c").unwrap();
        writer.write_eof();

        run_until_idle(&executor, &writer);

        assert_eq!(&*backing.received.lock(), b"abc");
        assert!(*backing.eof.lock());
    }

    #[test]
    fn write_after_eof_is_rejected() {
        let executor = Arc::new(async_executor::Executor::new());
        let backing = Arc::new(RecordingStream { received: PMutex::new(Vec::new()), eof: PMutex::new(false) });
        let stream: SharedStream = backing.clone();
        let writer = MultiWriter::new(stream, Arc::clone(&executor));

        writer.write_eof();
        assert!(!writer.write(b"late").unwrap());
        run_until_idle(&executor, &writer);
    }
}
