//! Async I/O handle: owns a file descriptor and a reactor reference,
//! exposes `wait` as a suspending operation.
//!
//! Closing a raw fd on drop requires `unsafe`; encapsulated here.
#![allow(unsafe_code)]

use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::time::Instant;

use crate::reactor::{Reactor, WaitOp, WaitOutcome};

/// Wraps one raw fd plus the reactor it is registered with.
///
/// Move-only. Dropping closes the fd: detaches it from the poller first
/// (so no stale readiness event can reference a reused fd number), then
/// issues the OS `close()`.
pub struct AsyncIoHandle {
    fd: RawFd,
    reactor: Reactor,
    /// Set on handles produced by `accept()`: the child fd is owned the
    /// same way as any other, this only distinguishes construction idiom
    /// for diagnostics.
    from_accept: bool,
}

impl AsyncIoHandle {
    /// Take ownership of `fd`, registering it with `reactor`.
    #[must_use]
    pub fn owning(fd: RawFd, reactor: Reactor) -> Self {
        Self { fd, reactor, from_accept: false }
    }

    /// Wrap a freshly-accepted child fd with the listener's reactor.
    #[must_use]
    pub fn from_accept(fd: RawFd, reactor: Reactor) -> Self {
        Self { fd, reactor, from_accept: true }
    }

    #[must_use]
    pub fn was_accepted(&self) -> bool {
        self.from_accept
    }

    #[must_use]
    pub fn reactor(&self) -> &Reactor {
        &self.reactor
    }

    /// Suspend until `op` is ready on this fd, or `deadline` passes.
    pub async fn wait(&self, op: WaitOp, deadline: Option<Instant>) -> io::Result<WaitOutcome> {
        self.reactor.wait(self.fd, op, deadline).await
    }

    /// Detach from the poller and resolve all pending waiters as `Closed`.
    /// The fd itself stays open until drop; this only unblocks waiters.
    pub fn shutdown(&self) {
        self.reactor.mark_closing(self.fd);
    }
}

impl AsRawFd for AsyncIoHandle {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for AsyncIoHandle {
    fn drop(&mut self) {
        self.reactor.mark_closing(self.fd);
        // SAFETY: `self.fd` is owned exclusively by this handle (move-only,
        // never cloned) and has not been closed elsewhere. Wrapping it in a
        // `socket2::Socket` just to let it drop is the same idiom the
        // reactor's TCP helpers use to reach raw-fd-only operations.
        unsafe {
            drop(socket2::Socket::from_raw_fd(self.fd));
        }
        self.reactor.forget(self.fd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn shutdown_resolves_pending_wait_as_closed() {
        let reactor = Reactor::start(Arc::new(AtomicUsize::new(0))).unwrap();
        let (a, _b) = std::os::unix::net::UnixStream::pair().unwrap();
        use std::os::unix::io::IntoRawFd;
        let handle = AsyncIoHandle::owning(a.into_raw_fd(), reactor);
        let fut = handle.wait(WaitOp::Read, None);
        handle.shutdown();
        let outcome = futures::executor::block_on(fut).unwrap();
        assert_eq!(outcome, WaitOutcome::Closed);
    }
}
