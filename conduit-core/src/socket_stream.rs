//! Concrete [`Stream`] over a socket or pipe file descriptor: growable
//! read buffer, non-blocking recv/send looped against the reactor.
//!
//! Borrowing a raw fd as a transient `socket2::Socket` requires `unsafe`;
//! encapsulated here (see [`with_borrowed_socket`]).
#![allow(unsafe_code)]

use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

use crate::io_handle::AsyncIoHandle;
use crate::reactor::{WaitOp, WaitOutcome};
use crate::stream::Stream;
use crate::timeout::Timeouts;

const INITIAL_CAPACITY: usize = 4096;
const MAX_CAPACITY: usize = 1 << 20;

struct ReadState {
    next_capacity: usize,
    putback: Bytes,
    was_timeout: bool,
}

/// Runs `f` with a transient [`socket2::Socket`] borrowing `fd`, never
/// letting it close the descriptor on drop — the same borrow-then-forget
/// idiom the reactor's socket helpers use for raw-fd operations.
fn with_borrowed_socket<T>(fd: RawFd, f: impl FnOnce(&socket2::Socket) -> T) -> T {
    let sock = unsafe { socket2::Socket::from_raw_fd(fd) };
    let result = f(&sock);
    std::mem::forget(sock);
    result
}

/// A byte stream over a raw socket or pipe descriptor.
pub struct SocketStream {
    handle: AsyncIoHandle,
    read: Mutex<ReadState>,
    timeouts: Mutex<Timeouts>,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    eof: AtomicBool,
}

impl SocketStream {
    #[must_use]
    pub fn new(handle: AsyncIoHandle) -> Self {
        Self {
            handle,
            read: Mutex::new(ReadState { next_capacity: INITIAL_CAPACITY, putback: Bytes::new(), was_timeout: false }),
            timeouts: Mutex::new(Timeouts::none()),
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            eof: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    fn recv_once(&self, cap: usize) -> io::Result<Bytes> {
        let fd = self.handle.as_raw_fd();
        with_borrowed_socket(fd, |sock| {
            let mut buf = BytesMut::zeroed(cap);
            // SAFETY: `spare` has length `cap` and socket2's recv only ever
            // initializes bytes it reports having read.
            let spare = unsafe {
                &mut *(buf.as_mut() as *mut [u8] as *mut [std::mem::MaybeUninit<u8>])
            };
            match sock.recv(spare) {
                Ok(n) => {
                    buf.truncate(n);
                    Ok(buf.freeze())
                }
                Err(e) => Err(e),
            }
        })
    }

    fn send_once(&self, buf: &[u8]) -> io::Result<usize> {
        let fd = self.handle.as_raw_fd();
        with_borrowed_socket(fd, |sock| sock.send(buf))
    }
}

#[async_trait]
impl Stream for SocketStream {
    async fn read(&self) -> io::Result<Bytes> {
        {
            let mut rs = self.read.lock();
            if !rs.putback.is_empty() {
                rs.was_timeout = false;
                return Ok(std::mem::take(&mut rs.putback));
            }
        }
        if self.eof.load(Ordering::Acquire) {
            return Ok(Bytes::new());
        }

        let cap = self.read.lock().next_capacity;
        loop {
            match self.recv_once(cap) {
                Ok(chunk) if chunk.is_empty() => {
                    self.eof.store(true, Ordering::Release);
                    self.read.lock().was_timeout = false;
                    return Ok(chunk);
                }
                Ok(chunk) => {
                    let mut rs = self.read.lock();
                    rs.was_timeout = false;
                    rs.next_capacity = if chunk.len() >= cap {
                        (cap + cap / 2).min(MAX_CAPACITY)
                    } else {
                        chunk.len().max(INITIAL_CAPACITY / 4)
                    };
                    self.bytes_read.fetch_add(chunk.len() as u64, Ordering::Relaxed);
                    return Ok(chunk);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    let deadline = self.timeouts.lock().read_deadline(Instant::now());
                    match self.handle.wait(WaitOp::Read, deadline).await? {
                        WaitOutcome::Complete => continue,
                        WaitOutcome::Timeout => {
                            self.read.lock().was_timeout = true;
                            return Ok(Bytes::new());
                        }
                        WaitOutcome::Closed => {
                            self.eof.store(true, Ordering::Release);
                            return Ok(Bytes::new());
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    async fn read_nb(&self) -> Bytes {
        {
            let mut rs = self.read.lock();
            if !rs.putback.is_empty() {
                return std::mem::take(&mut rs.putback);
            }
        }
        if self.eof.load(Ordering::Acquire) {
            return Bytes::new();
        }
        let cap = self.read.lock().next_capacity;
        match self.recv_once(cap) {
            Ok(chunk) => {
                if chunk.is_empty() {
                    self.eof.store(true, Ordering::Release);
                } else {
                    self.bytes_read.fetch_add(chunk.len() as u64, Ordering::Relaxed);
                }
                chunk
            }
            Err(_) => Bytes::new(),
        }
    }

    fn put_back(&self, bytes: Bytes) {
        self.read.lock().putback = bytes;
    }

    async fn write(&self, buf: &[u8]) -> io::Result<bool> {
        let mut offset = 0;
        while offset < buf.len() {
            match self.send_once(&buf[offset..]) {
                Ok(n) => {
                    offset += n;
                    self.bytes_written.fetch_add(n as u64, Ordering::Relaxed);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    let deadline = self.timeouts.lock().write_deadline(Instant::now());
                    match self.handle.wait(WaitOp::Write, deadline).await? {
                        WaitOutcome::Complete => continue,
                        WaitOutcome::Timeout => return Ok(false),
                        WaitOutcome::Closed => return Ok(false),
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => return Ok(false),
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    async fn write_eof(&self) -> bool {
        let fd = self.handle.as_raw_fd();
        with_borrowed_socket(fd, |sock| sock.shutdown(std::net::Shutdown::Write).is_ok())
    }

    fn shutdown(&self) {
        self.handle.shutdown();
        self.eof.store(true, Ordering::Release);
    }

    fn is_read_timeout(&self) -> bool {
        self.read.lock().was_timeout
    }

    fn get_timeouts(&self) -> Timeouts {
        *self.timeouts.lock()
    }

    fn set_timeouts(&self, timeouts: Timeouts) {
        *self.timeouts.lock() = timeouts;
    }
}
