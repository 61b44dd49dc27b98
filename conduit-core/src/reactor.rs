//! Readiness multiplexer: epoll (via `mio`) plus a deadline scheduler,
//! serving `wait` requests from many tasks through one dedicated thread.
//!
//! See the crate-level docs for the registration/cancellation contract.
//! This module only deals in raw fds — it never owns one. Ownership (and
//! the OS `close()`) belongs to [`crate::io_handle::AsyncIoHandle`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::channel::oneshot;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;

/// One of the four operations a descriptor can be waited on for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOp {
    Read,
    Write,
    Accept,
    Connect,
}

impl WaitOp {
    const COUNT: usize = 4;

    fn index(self) -> usize {
        match self {
            WaitOp::Read => 0,
            WaitOp::Write => 1,
            WaitOp::Accept => 2,
            WaitOp::Connect => 3,
        }
    }

    fn wants_readable(self) -> bool {
        matches!(self, WaitOp::Read | WaitOp::Accept)
    }

    fn wants_writable(self) -> bool {
        matches!(self, WaitOp::Write | WaitOp::Connect)
    }
}

/// Resolution of a `wait`/`sleep` future.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The descriptor became ready (or the timer was cancelled).
    Complete,
    /// The deadline passed before readiness.
    Timeout,
    /// The descriptor (or the whole reactor) was closed while waiting.
    Closed,
}

type WaitResult = Result<WaitOutcome, io::Error>;

/// Future returned by [`Reactor::wait`] / [`Reactor::sleep`].
pub struct WaitFuture(oneshot::Receiver<WaitResult>);

impl std::future::Future for WaitFuture {
    type Output = WaitResult;

    fn poll(mut self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> std::task::Poll<Self::Output> {
        use std::pin::Pin;
        match Pin::new(&mut self.0).poll(cx) {
            std::task::Poll::Ready(Ok(r)) => std::task::Poll::Ready(r),
            // The sender side was dropped without resolving: the reactor
            // shut down out from under this waiter.
            std::task::Poll::Ready(Err(_)) => std::task::Poll::Ready(Ok(WaitOutcome::Closed)),
            std::task::Poll::Pending => std::task::Poll::Pending,
        }
    }
}

struct Waiter {
    deadline: Instant,
    tx: oneshot::Sender<WaitResult>,
}

struct FdSlots {
    slots: [Option<Waiter>; WaitOp::COUNT],
    registered: bool,
}

impl FdSlots {
    fn new() -> Self {
        Self { slots: [None, None, None, None], registered: false }
    }

    fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    fn min_deadline(&self) -> Option<Instant> {
        self.slots.iter().flatten().map(|w| w.deadline).min()
    }

    fn interest(&self) -> Option<Interest> {
        let readable = (self.slots[WaitOp::Read.index()].is_some() || self.slots[WaitOp::Accept.index()].is_some())
            .then_some(Interest::READABLE);
        let writable = (self.slots[WaitOp::Write.index()].is_some() || self.slots[WaitOp::Connect.index()].is_some())
            .then_some(Interest::WRITABLE);
        match (readable, writable) {
            (Some(r), Some(w)) => Some(r.add(w)),
            (Some(r), None) => Some(r),
            (None, Some(w)) => Some(w),
            (None, None) => None,
        }
    }
}

struct State {
    fds: HashMap<RawFd, FdSlots>,
    closing: HashSet<RawFd>,
    timers: BTreeMap<(Instant, u64), oneshot::Sender<WaitResult>>,
    timer_deadlines: HashMap<u64, Instant>,
    next_timer_id: u64,
}

const WAKE_TOKEN: Token = Token(usize::MAX);

/// The readiness multiplexer. Cheap to clone (an `Arc` internally);
/// clones share the same worker thread.
#[derive(Clone)]
pub struct Reactor {
    inner: Arc<Inner>,
}

struct Inner {
    registry: mio::Registry,
    waker: Waker,
    state: Mutex<State>,
    pending_tasks: Arc<AtomicUsize>,
}

impl Reactor {
    /// Start the reactor: spins up its dedicated worker thread.
    ///
    /// `pending_tasks` lets the executor report queued work so the worker
    /// can poll with a zero timeout instead of starving it (see §5 of the
    /// design notes).
    pub fn start(pending_tasks: Arc<AtomicUsize>) -> io::Result<Reactor> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;
        let inner = Arc::new(Inner {
            registry,
            waker,
            state: Mutex::new(State {
                fds: HashMap::new(),
                closing: HashSet::new(),
                timers: BTreeMap::new(),
                timer_deadlines: HashMap::new(),
                next_timer_id: 1,
            }),
            pending_tasks,
        });
        let worker_inner = Arc::clone(&inner);
        std::thread::Builder::new()
            .name("conduit-reactor".into())
            .spawn(move || run_worker(worker_inner, poll))?;
        Ok(Reactor { inner })
    }

    /// Register exactly one waiter for `(fd, op)`. Registering over a live
    /// waiter for the same slot is a contract violation (panics, matching
    /// "never hold two waiters on one slot").
    pub fn wait(&self, fd: RawFd, op: WaitOp, deadline: Option<Instant>) -> WaitFuture {
        let (tx, rx) = oneshot::channel();
        let mut st = self.inner.state.lock();
        if st.closing.contains(&fd) {
            let _ = tx.send(Ok(WaitOutcome::Closed));
            return WaitFuture(rx);
        }
        let deadline = deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600 * 24 * 365));
        let slots = st.fds.entry(fd).or_insert_with(FdSlots::new);
        assert!(
            slots.slots[op.index()].is_none(),
            "reactor contract violation: registering over a live waiter for fd={fd} op={op:?}"
        );
        slots.slots[op.index()] = Some(Waiter { deadline, tx });
        if let Err(e) = self.reregister(fd, &mut st) {
            if let Some(w) = st.fds.get_mut(&fd).and_then(|s| s.slots[op.index()].take()) {
                let _ = w.tx.send(Err(e));
            }
            return WaitFuture(rx);
        }
        drop(st);
        let _ = self.inner.waker.wake();
        WaitFuture(rx)
    }

    /// Deadline-only wait, no fd involved. Returns an id usable with
    /// [`Reactor::cancel_sleep`].
    pub fn sleep(&self, deadline: Instant) -> (u64, WaitFuture) {
        let (tx, rx) = oneshot::channel();
        let mut st = self.inner.state.lock();
        let id = st.next_timer_id;
        st.next_timer_id += 1;
        st.timers.insert((deadline, id), tx);
        st.timer_deadlines.insert(id, deadline);
        drop(st);
        let _ = self.inner.waker.wake();
        (id, WaitFuture(rx))
    }

    /// Cancel a pending sleep. Returns `true` if it was still pending (in
    /// which case its future now resolves `Complete`); `false` if it had
    /// already fired or did not exist.
    pub fn cancel_sleep(&self, id: u64) -> bool {
        let mut st = self.inner.state.lock();
        let Some(deadline) = st.timer_deadlines.remove(&id) else {
            return false;
        };
        if let Some(tx) = st.timers.remove(&(deadline, id)) {
            let _ = tx.send(Ok(WaitOutcome::Complete));
            true
        } else {
            false
        }
    }

    /// Detach `fd` from the poller, resolve all its pending waiters as
    /// `Closed`, and mark it closing: future `wait` calls on it resolve
    /// `Closed` immediately without touching the poller.
    pub fn mark_closing(&self, fd: RawFd) {
        let mut st = self.inner.state.lock();
        self.close_fd_locked(&mut st, fd);
    }

    /// Same as [`Reactor::mark_closing`] for every registered fd, and
    /// drains the deadline scheduler too.
    pub fn mark_closing_all(&self) {
        let mut st = self.inner.state.lock();
        let fds: Vec<RawFd> = st.fds.keys().copied().collect();
        for fd in fds {
            self.close_fd_locked(&mut st, fd);
        }
        for (_, tx) in std::mem::take(&mut st.timers) {
            let _ = tx.send(Ok(WaitOutcome::Closed));
        }
        st.timer_deadlines.clear();
    }

    /// Forget a closed fd entirely (called once the owning handle has
    /// actually issued the OS `close()`), so the `closing` set doesn't
    /// grow without bound.
    pub fn forget(&self, fd: RawFd) {
        let mut st = self.inner.state.lock();
        st.closing.remove(&fd);
        st.fds.remove(&fd);
    }

    fn close_fd_locked(&self, st: &mut State, fd: RawFd) {
        st.closing.insert(fd);
        if let Some(mut slots) = st.fds.remove(&fd) {
            if slots.registered {
                let _ = self.inner.registry.deregister(&mut SourceFd(&fd));
            }
            for slot in slots.slots.iter_mut() {
                if let Some(w) = slot.take() {
                    let _ = w.tx.send(Ok(WaitOutcome::Closed));
                }
            }
        }
    }

    fn reregister(&self, fd: RawFd, st: &mut State) -> io::Result<()> {
        let slots = st.fds.get_mut(&fd).expect("fd entry just inserted");
        let Some(interest) = slots.interest() else {
            return Ok(());
        };
        if slots.registered {
            match self.inner.registry.reregister(&mut SourceFd(&fd), Token(fd as usize), interest) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    self.inner.registry.register(&mut SourceFd(&fd), Token(fd as usize), interest)
                }
                Err(e) => Err(e),
            }
        } else {
            match self.inner.registry.register(&mut SourceFd(&fd), Token(fd as usize), interest) {
                Ok(()) => {
                    slots.registered = true;
                    Ok(())
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    self.inner.registry.reregister(&mut SourceFd(&fd), Token(fd as usize), interest)?;
                    slots.registered = true;
                    Ok(())
                }
                Err(e) => Err(e),
            }
        }
    }
}

fn run_worker(inner: Arc<Inner>, mut poll: Poll) {
    let mut events = Events::with_capacity(1024);
    loop {
        let timeout = {
            let st = inner.state.lock();
            if inner.pending_tasks.load(Ordering::Relaxed) > 0 {
                Some(Duration::ZERO)
            } else {
                next_timeout(&st)
            }
        };
        match poll.poll(&mut events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::error!(error = %e, "reactor poll failed, shutting down worker");
                let mut st = inner.state.lock();
                for (_, mut slots) in std::mem::take(&mut st.fds) {
                    for slot in slots.slots.iter_mut() {
                        if let Some(w) = slot.take() {
                            let _ = w.tx.send(Err(io::Error::new(e.kind(), e.to_string())));
                        }
                    }
                }
                return;
            }
        }

        let now = Instant::now();
        let mut st = inner.state.lock();
        for ev in events.iter() {
            if ev.token() == WAKE_TOKEN {
                continue;
            }
            let fd = ev.token().0 as RawFd;
            let Some(slots) = st.fds.get_mut(&fd) else { continue };
            if ev.is_error() || (ev.is_read_closed() && ev.is_write_closed()) {
                let err = io::Error::new(io::ErrorKind::Other, "fd reported error readiness");
                for slot in slots.slots.iter_mut() {
                    if let Some(w) = slot.take() {
                        let _ = w.tx.send(Err(io::Error::new(err.kind(), err.to_string())));
                    }
                }
                st.fds.remove(&fd);
                continue;
            }
            if ev.is_readable() {
                resolve_slot(slots, WaitOp::Accept, WaitOutcome::Complete);
                resolve_slot(slots, WaitOp::Read, WaitOutcome::Complete);
            }
            if ev.is_writable() {
                resolve_slot(slots, WaitOp::Connect, WaitOutcome::Complete);
                resolve_slot(slots, WaitOp::Write, WaitOutcome::Complete);
            }
        }

        // Rearm: recompute each touched fd's mask (or drop it if idle).
        let fds: Vec<RawFd> = st.fds.keys().copied().collect();
        for fd in fds {
            let empty = st.fds.get(&fd).map(FdSlots::is_empty).unwrap_or(true);
            if empty {
                st.fds.remove(&fd);
                continue;
            }
            let registered = st.fds.get(&fd).map(|s| s.registered).unwrap_or(false);
            if registered {
                let reactor_handle = Reactor { inner: Arc::clone(&inner) };
                let _ = reactor_handle.reregister(fd, &mut st);
            }
        }

        // Expire fd deadlines.
        let expired_fds: Vec<RawFd> = st
            .fds
            .iter()
            .filter(|(_, slots)| slots.min_deadline().is_some_and(|d| d <= now))
            .map(|(fd, _)| *fd)
            .collect();
        for fd in expired_fds {
            if let Some(slots) = st.fds.get_mut(&fd) {
                for slot in slots.slots.iter_mut() {
                    let expired = slot.as_ref().is_some_and(|w| w.deadline <= now);
                    if expired {
                        if let Some(w) = slot.take() {
                            let _ = w.tx.send(Ok(WaitOutcome::Timeout));
                        }
                    }
                }
                if slots.is_empty() {
                    st.fds.remove(&fd);
                }
            }
        }

        // Expire timers.
        loop {
            let Some((&(deadline, id), _)) = st.timers.iter().next() else { break };
            if deadline > now {
                break;
            }
            if let Some(tx) = st.timers.remove(&(deadline, id)) {
                st.timer_deadlines.remove(&id);
                let _ = tx.send(Ok(WaitOutcome::Timeout));
            }
        }
    }
}

fn resolve_slot(slots: &mut FdSlots, op: WaitOp, outcome: WaitOutcome) {
    if let Some(w) = slots.slots[op.index()].take() {
        let _ = w.tx.send(Ok(outcome));
    }
}

fn next_timeout(st: &State) -> Option<Duration> {
    let now = Instant::now();
    let fd_min = st.fds.values().filter_map(FdSlots::min_deadline).min();
    let timer_min = st.timers.keys().next().map(|(d, _)| *d);
    let min = match (fd_min, timer_min) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    };
    min.map(|d| d.saturating_duration_since(now))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn reactor() -> Reactor {
        Reactor::start(Arc::new(AtomicUsize::new(0))).unwrap()
    }

    #[test]
    fn sleep_then_timeout() {
        let r = reactor();
        let (_, fut) = r.sleep(Instant::now() + Duration::from_millis(20));
        let outcome = futures::executor::block_on(fut).unwrap();
        assert_eq!(outcome, WaitOutcome::Timeout);
    }

    #[test]
    fn cancel_sleep_resolves_complete() {
        let r = reactor();
        let (id, fut) = r.sleep(Instant::now() + Duration::from_secs(10));
        assert!(r.cancel_sleep(id));
        let outcome = futures::executor::block_on(fut).unwrap();
        assert_eq!(outcome, WaitOutcome::Complete);
    }

    #[test]
    fn mark_closing_resolves_pending_fd_waiters() {
        let r = reactor();
        // Use a pipe so we have a real, valid fd without needing a peer.
        let (read_fd, _write_fd) = make_pipe();
        let fut = r.wait(read_fd, WaitOp::Read, None);
        r.mark_closing(read_fd);
        let outcome = futures::executor::block_on(fut).unwrap();
        assert_eq!(outcome, WaitOutcome::Closed);
    }

    #[test]
    fn wait_on_already_closing_fd_resolves_immediately() {
        let r = reactor();
        let (read_fd, _write_fd) = make_pipe();
        r.mark_closing(read_fd);
        let fut = r.wait(read_fd, WaitOp::Read, None);
        let outcome = futures::executor::block_on(fut).unwrap();
        assert_eq!(outcome, WaitOutcome::Closed);
    }

    fn make_pipe() -> (RawFd, RawFd) {
        use std::os::unix::io::IntoRawFd;
        let (r, w) = std::os::unix::net::UnixStream::pair().unwrap();
        (r.into_raw_fd(), w.into_raw_fd())
    }
}
