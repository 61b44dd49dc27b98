//! Runtime context: binds a [`Reactor`] to a task executor, and is the
//! factory for sockets, pipes, stdio, the signal stream, and the
//! listen/connect helpers built on top of them.
//!
//! Raw-fd socket setup (connect/bind/accept/dup) requires `unsafe`;
//! encapsulated in the free functions at the bottom of this module.
#![allow(unsafe_code)]

use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::error::{ConduitError, Result};
use crate::io_handle::AsyncIoHandle;
use crate::peername::PeerName;
use crate::reactor::{Reactor, WaitOp, WaitOutcome};
use crate::socket_stream::SocketStream;
use crate::stream::SharedStream;

/// Binds one [`Reactor`] to one [`async_executor::Executor`], running the
/// latter on a small worker-thread pool (mirrors a typical multi-threaded
/// executor setup: one thread drives the caller's future, the rest just
/// pull from the same run queue).
pub struct Runtime {
    reactor: Reactor,
    executor: Arc<async_executor::Executor<'static>>,
    pending_tasks: Arc<AtomicUsize>,
    _workers: Vec<std::thread::JoinHandle<()>>,
}

impl Runtime {
    /// Start the reactor and `worker_threads` extra executor workers (in
    /// addition to whichever thread calls [`Runtime::block_on`]).
    /// `worker_threads = None` picks `num_cpus::get().saturating_sub(1)`.
    pub fn new(worker_threads: Option<usize>) -> io::Result<Self> {
        let pending_tasks = Arc::new(AtomicUsize::new(0));
        let reactor = Reactor::start(Arc::clone(&pending_tasks))?;
        let executor = Arc::new(async_executor::Executor::new());

        let threads = worker_threads.unwrap_or_else(|| num_cpus::get().saturating_sub(1).max(1));
        let mut workers = Vec::with_capacity(threads);
        for idx in 0..threads {
            let ex = Arc::clone(&executor);
            workers.push(
                std::thread::Builder::new()
                    .name(format!("conduit-worker-{idx}"))
                    .spawn(move || {
                        futures::executor::block_on(ex.run(futures::future::pending::<()>()));
                    })?,
            );
        }

        Ok(Self { reactor, executor, pending_tasks, _workers: workers })
    }

    #[must_use]
    pub fn reactor(&self) -> &Reactor {
        &self.reactor
    }

    #[must_use]
    pub fn executor(&self) -> &Arc<async_executor::Executor<'static>> {
        &self.executor
    }

    /// Spawn a task onto the shared executor.
    pub fn spawn<T: Send + 'static>(&self, fut: impl std::future::Future<Output = T> + Send + 'static) -> async_executor::Task<T> {
        self.pending_tasks.fetch_add(1, Ordering::Relaxed);
        let pending = Arc::clone(&self.pending_tasks);
        self.executor.spawn(async move {
            let out = fut.await;
            pending.fetch_sub(1, Ordering::Relaxed);
            out
        })
    }

    /// Block the calling thread running the executor until `fut`
    /// completes, also servicing every other spawned task.
    pub fn block_on<T>(&self, fut: impl std::future::Future<Output = T>) -> T {
        futures::executor::block_on(self.executor.run(fut))
    }

    /// Connect to `peer`, suspending until the connection completes or
    /// fails. Applies `TCP_NODELAY` for IP peers (mirrors the teacher's
    /// latency-sensitive default).
    pub async fn connect(&self, peer: &PeerName) -> Result<SharedStream> {
        match peer {
            PeerName::V4 { .. } | PeerName::V6 { .. } => {
                let addr = peer.to_socket_addr().ok_or_else(|| ConduitError::invalid_peer_name("not an IP peer"))?;
                self.connect_tcp(addr).await
            }
            PeerName::Unix { path, .. } => self.connect_unix(path).await,
            PeerName::Error(e) => Err(ConduitError::protocol(e.to_string())),
            PeerName::None => Err(ConduitError::invalid_peer_name("cannot connect to the empty peer")),
        }
    }

    async fn connect_tcp(&self, addr: std::net::SocketAddr) -> Result<SharedStream> {
        let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
        let sock = Socket::new(domain, Type::STREAM, Some(Protocol::TCP)).map_err(ConduitError::System)?;
        sock.set_nonblocking(true).map_err(ConduitError::System)?;
        sock.set_nodelay(true).map_err(ConduitError::System)?;
        match sock.connect(&SockAddr::from(addr)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.raw_os_error() == Some(libc_in_progress()) => {}
            Err(e) => return Err(ConduitError::connect_failed(e)),
        }
        let fd = sock.into_raw_fd();
        let handle = AsyncIoHandle::owning(fd, self.reactor.clone());
        match handle.wait(WaitOp::Connect, None).await.map_err(ConduitError::System)? {
            WaitOutcome::Complete => {}
            WaitOutcome::Timeout => return Err(ConduitError::connect_failed(io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))),
            WaitOutcome::Closed => return Err(ConduitError::connect_failed(io::Error::new(io::ErrorKind::ConnectionAborted, "connect aborted"))),
        }
        if let Some(err) = take_socket_error(fd) {
            return Err(ConduitError::connect_failed(err));
        }
        Ok(Arc::new(SocketStream::new(handle)))
    }

    async fn connect_unix(&self, path: &Path) -> Result<SharedStream> {
        let sock = Socket::new(Domain::UNIX, Type::STREAM, None).map_err(ConduitError::System)?;
        sock.set_nonblocking(true).map_err(ConduitError::System)?;
        let addr = SockAddr::unix(path).map_err(ConduitError::System)?;
        match sock.connect(&addr) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(ConduitError::connect_failed(e)),
        }
        let fd = sock.into_raw_fd();
        let handle = AsyncIoHandle::owning(fd, self.reactor.clone());
        match handle.wait(WaitOp::Connect, None).await.map_err(ConduitError::System)? {
            WaitOutcome::Complete => Ok(Arc::new(SocketStream::new(handle))),
            WaitOutcome::Timeout => Err(ConduitError::connect_failed(io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))),
            WaitOutcome::Closed => Err(ConduitError::connect_failed(io::Error::new(io::ErrorKind::ConnectionAborted, "connect aborted"))),
        }
    }

    /// Bind a listener for every resolved peer in `peers` (typically the
    /// IPv4 and IPv6 wildcard pair from [`PeerName::lookup`]). Each
    /// listener shares this runtime's reactor.
    pub fn listen(&self, peers: &[PeerName]) -> Result<Vec<Listener>> {
        let mut listeners = Vec::with_capacity(peers.len());
        for peer in peers {
            if !peer.is_valid() {
                continue;
            }
            listeners.push(self.bind_one(peer)?);
        }
        if listeners.is_empty() {
            return Err(ConduitError::invalid_peer_name("no valid peer to bind"));
        }
        Ok(listeners)
    }

    fn bind_one(&self, peer: &PeerName) -> Result<Listener> {
        match peer {
            PeerName::V4 { .. } | PeerName::V6 { .. } => {
                let addr = peer.to_socket_addr().expect("validated IP peer");
                let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
                let sock = Socket::new(domain, Type::STREAM, Some(Protocol::TCP)).map_err(ConduitError::System)?;
                sock.set_reuse_address(true).map_err(ConduitError::System)?;
                sock.set_nonblocking(true).map_err(ConduitError::System)?;
                sock.bind(&SockAddr::from(addr)).map_err(ConduitError::System)?;
                sock.listen(1024).map_err(ConduitError::System)?;
                let fd = sock.into_raw_fd();
                Ok(Listener { fd, reactor: self.reactor.clone() })
            }
            PeerName::Unix { path, perms, .. } => {
                let _ = std::fs::remove_file(path);
                let sock = Socket::new(Domain::UNIX, Type::STREAM, None).map_err(ConduitError::System)?;
                sock.set_nonblocking(true).map_err(ConduitError::System)?;
                sock.bind(&SockAddr::unix(path).map_err(ConduitError::System)?).map_err(ConduitError::System)?;
                sock.listen(1024).map_err(ConduitError::System)?;
                if let Some(mode) = perms {
                    use std::os::unix::fs::PermissionsExt;
                    std::fs::set_permissions(path, std::fs::Permissions::from_mode(*mode)).map_err(ConduitError::System)?;
                }
                let fd = sock.into_raw_fd();
                Ok(Listener { fd, reactor: self.reactor.clone() })
            }
            PeerName::Error(e) => Err(ConduitError::protocol(e.to_string())),
            PeerName::None => Err(ConduitError::invalid_peer_name("cannot bind the empty peer")),
        }
    }

    /// Create a connected pair of in-process streams (`AF_UNIX`
    /// socketpair), useful for tests and intra-process plumbing.
    pub fn pipe(&self) -> io::Result<(SharedStream, SharedStream)> {
        let (a, b) = std::os::unix::net::UnixStream::pair()?;
        a.set_nonblocking(true)?;
        b.set_nonblocking(true)?;
        let ha = AsyncIoHandle::owning(a.into_raw_fd(), self.reactor.clone());
        let hb = AsyncIoHandle::owning(b.into_raw_fd(), self.reactor.clone());
        Ok((Arc::new(SocketStream::new(ha)), Arc::new(SocketStream::new(hb))))
    }

    /// A stream reading `stdin` and writing `stdout`. Both fds are
    /// duplicated and set non-blocking; the originals are untouched.
    pub fn stdio(&self) -> io::Result<SharedStream> {
        let stdin_fd = io::stdin().as_raw_fd();
        let stdout_fd = io::stdout().as_raw_fd();
        set_nonblocking_raw(stdin_fd)?;
        set_nonblocking_raw(stdout_fd)?;
        let read_handle = AsyncIoHandle::owning(dup_fd(stdin_fd)?, self.reactor.clone());
        let write_handle = AsyncIoHandle::owning(dup_fd(stdout_fd)?, self.reactor.clone());
        let read_side: SharedStream = Arc::new(SocketStream::new(read_handle));
        let write_side: SharedStream = Arc::new(SocketStream::new(write_handle));
        Ok(Arc::new(SplitStream { read_side, write_side }))
    }

    /// A byte stream that yields one byte (the signal number) each time
    /// any of `signals` is delivered to the process. Bridges
    /// `signal-hook`'s dedicated delivery thread into the stream contract
    /// via a self-pipe, so ordinary `wait(Read)` machinery picks it up.
    pub fn signal_stream(&self, signals: &[i32]) -> Result<SharedStream> {
        let (read_end, write_end) = std::os::unix::net::UnixStream::pair().map_err(ConduitError::System)?;
        read_end.set_nonblocking(true).map_err(ConduitError::System)?;
        let mut signal_iter = signal_hook::iterator::Signals::new(signals).map_err(ConduitError::System)?;
        std::thread::Builder::new()
            .name("conduit-signals".into())
            .spawn(move || {
                use std::io::Write;
                let mut write_end = write_end;
                for signal in signal_iter.forever() {
                    if write_end.write_all(&[signal as u8]).is_err() {
                        break;
                    }
                }
            })
            .map_err(ConduitError::System)?;
        let handle = AsyncIoHandle::owning(read_end.into_raw_fd(), self.reactor.clone());
        Ok(Arc::new(SocketStream::new(handle)))
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.reactor.mark_closing_all();
    }
}

/// A bound, listening socket. Accepts child connections one at a time.
pub struct Listener {
    fd: RawFd,
    reactor: Reactor,
}

impl Listener {
    /// Suspend until a connection arrives, returning the accepted stream
    /// and the peer's address.
    pub async fn accept(&self) -> Result<(SharedStream, PeerName)> {
        loop {
            match accept_raw(self.fd) {
                Ok((fd, addr)) => {
                    let handle = AsyncIoHandle::from_accept(fd, self.reactor.clone());
                    return Ok((Arc::new(SocketStream::new(handle)), addr));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    let handle_wait = self.reactor.wait(self.fd, WaitOp::Accept, None);
                    match handle_wait.await.map_err(ConduitError::System)? {
                        WaitOutcome::Complete => continue,
                        WaitOutcome::Timeout => unreachable!("accept has no deadline"),
                        WaitOutcome::Closed => return Err(ConduitError::connect_failed(io::Error::new(io::ErrorKind::Other, "listener closed"))),
                    }
                }
                Err(e) => return Err(ConduitError::System(e)),
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.reactor.mark_closing(self.fd);
        unsafe {
            drop(Socket::from_raw_fd(self.fd));
        }
        self.reactor.forget(self.fd);
    }
}

fn accept_raw(fd: RawFd) -> io::Result<(RawFd, PeerName)> {
    let sock = unsafe { Socket::from_raw_fd(fd) };
    let result = sock.accept();
    std::mem::forget(sock);
    let (child, addr) = result?;
    child.set_nonblocking(true)?;
    let peer = addr.as_socket().map(PeerName::from).unwrap_or_default();
    Ok((child.into_raw_fd(), peer))
}

fn take_socket_error(fd: RawFd) -> Option<io::Error> {
    let sock = unsafe { Socket::from_raw_fd(fd) };
    let err = sock.take_error().ok().flatten();
    std::mem::forget(sock);
    err
}

fn set_nonblocking_raw(fd: RawFd) -> io::Result<()> {
    let sock = unsafe { Socket::from_raw_fd(fd) };
    let result = sock.set_nonblocking(true);
    std::mem::forget(sock);
    result
}

fn dup_fd(fd: RawFd) -> io::Result<RawFd> {
    let sock = unsafe { Socket::from_raw_fd(fd) };
    let dup = sock.try_clone();
    std::mem::forget(sock);
    dup.map(|s| s.into_raw_fd())
}

const fn libc_in_progress() -> i32 {
    // EINPROGRESS; avoided pulling in `libc` for a single constant.
    115
}

/// A [`Stream`] that reads from one underlying stream and writes to a
/// different one — e.g. stdin/stdout, which don't share a descriptor.
struct SplitStream {
    read_side: SharedStream,
    write_side: SharedStream,
}

#[async_trait::async_trait]
impl crate::stream::Stream for SplitStream {
    async fn read(&self) -> io::Result<bytes::Bytes> {
        self.read_side.read().await
    }

    async fn read_nb(&self) -> bytes::Bytes {
        self.read_side.read_nb().await
    }

    fn put_back(&self, bytes: bytes::Bytes) {
        self.read_side.put_back(bytes);
    }

    async fn write(&self, buf: &[u8]) -> io::Result<bool> {
        self.write_side.write(buf).await
    }

    async fn write_eof(&self) -> bool {
        self.write_side.write_eof().await
    }

    fn shutdown(&self) {
        self.read_side.shutdown();
        self.write_side.shutdown();
    }

    fn is_read_timeout(&self) -> bool {
        self.read_side.is_read_timeout()
    }

    fn get_timeouts(&self) -> crate::timeout::Timeouts {
        self.read_side.get_timeouts()
    }

    fn set_timeouts(&self, timeouts: crate::timeout::Timeouts) {
        self.read_side.set_timeouts(timeouts);
        self.write_side.set_timeouts(timeouts);
    }
}

impl From<std::net::SocketAddr> for PeerName {
    fn from(addr: std::net::SocketAddr) -> Self {
        match addr {
            std::net::SocketAddr::V4(a) => PeerName::V4 { addr: u32::from(*a.ip()), port: a.port(), group: None },
            std::net::SocketAddr::V6(a) => PeerName::V6 {
                addr: a.ip().segments(),
                flow: a.flowinfo(),
                scope: a.scope_id(),
                port: a.port(),
                group: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipe_round_trips_bytes() {
        let rt = Runtime::new(Some(1)).unwrap();
        let (a, b) = rt.pipe().unwrap();
        rt.block_on(async {
            a.write(b"hello").await.unwrap();
            let got = b.read().await.unwrap();
            assert_eq!(&got[..], b"hello");
        });
    }

    #[test]
    fn connect_to_bound_listener_round_trips() {
        let rt = Runtime::new(Some(2)).unwrap();
        let port = portpicker::pick_unused_port().expect("unused port");
        let peers = PeerName::lookup(&format!("127.0.0.1:{port}"), None).unwrap();
        let listeners = rt.listen(&peers).unwrap();
        let listener = listeners.into_iter().next().unwrap();

        rt.block_on(async {
            let accept_fut = listener.accept();
            let connect_fut = rt.connect(&PeerName::lookup(&format!("127.0.0.1:{port}"), None).unwrap()[0]);
            let (accepted, connected) = futures::join!(accept_fut, connect_fut);
            let (server_stream, _peer) = accepted.unwrap();
            let client_stream = connected.unwrap();

            client_stream.write(b"ping").await.unwrap();
            let got = server_stream.read().await.unwrap();
            assert_eq!(&got[..], b"ping");
        });
    }
}
