// Copyright 2025. The zc-rt authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The run queue: [`EventLoop`], [`WaitScope`] and the [`EventPort`] seam
//! through which the loop blocks for external I/O.

use crate::executor::Executor;
use crate::paf::PendingXThreadPaf;
use crate::promise::Promise;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::{Rc, Weak};
use std::sync::Arc;

/// One entry on the loop's run queue. Armed at most once per firing; an
/// event must not be re-armed while it is already queued (the loop asserts
/// this in debug builds via [`LoopInner::arm`]).
pub(crate) trait Event {
    fn fire(self: Rc<Self>);
}

/// A thread-safe handle that can interrupt a blocked [`EventPort::wait`]
/// from another thread. Edge-preserving: a `wake()` that arrives before the
/// corresponding `wait()` call must not be lost.
pub trait Waker: Send + Sync {
    fn wake(&self);
}

/// How a loop blocks when it has no runnable events: waits for external I/O
/// readiness, polls without blocking, or is told the loop itself has (or no
/// longer has) runnable work of its own.
pub trait EventPort {
    /// Blocks until there is new work to do, returning `true` if the port's
    /// block was interrupted by a waker edge rather than by a spurious
    /// return.
    fn wait(&mut self) -> bool;
    /// Non-blocking check for new work.
    fn poll(&mut self) -> bool;
    /// Called by the loop when its own run queue transitions between empty
    /// and non-empty, so a port that multiplexes other sources (e.g. `mio`)
    /// knows whether it may block.
    fn set_runnable(&mut self, runnable: bool);
    /// A thread-safe handle that can interrupt [`wait`](Self::wait) from
    /// another thread. Used by the cross-thread [`Executor`] to wake a
    /// sleeping target loop after queuing work for it.
    fn waker(&self) -> Arc<dyn Waker>;
}

/// Busy-polling port used by tests and by loops that never block on real
/// I/O. `wait` always returns immediately.
pub struct NullEventPort {
    waker: Arc<NullWaker>,
}

struct NullWaker;
impl Waker for NullWaker {
    fn wake(&self) {}
}

impl Default for NullEventPort {
    fn default() -> Self {
        NullEventPort { waker: Arc::new(NullWaker) }
    }
}

impl EventPort for NullEventPort {
    fn wait(&mut self) -> bool {
        std::thread::yield_now();
        true
    }
    fn poll(&mut self) -> bool {
        true
    }
    fn set_runnable(&mut self, _runnable: bool) {}
    fn waker(&self) -> Arc<dyn Waker> {
        self.waker.clone()
    }
}

/// Default [`EventPort`], backing [`EventLoop::wait`] on real OS I/O via
/// `mio::Poll`. Grounded in `posix4e-gj`'s `io.rs`, which plays the same
/// role (a `mio`-backed port for its own event loop prototype), generalized
/// here to a reusable, standalone `EventPort` implementation.
pub struct MioEventPort {
    poll: mio::Poll,
    events: mio::Events,
    waker: Arc<MioWaker>,
}

struct MioWaker(mio::Waker);
impl Waker for MioWaker {
    fn wake(&self) {
        // A wakeup racing a `poll()` that hasn't started blocking yet is
        // still observed: mio's `Waker` sets a persistent readiness bit on
        // its registered token until the next `poll` call drains it.
        let _ = self.0.wake();
    }
}

const WAKE_TOKEN: mio::Token = mio::Token(usize::MAX);

impl MioEventPort {
    pub fn new() -> std::io::Result<Self> {
        let poll = mio::Poll::new()?;
        let waker = mio::Waker::new(poll.registry(), WAKE_TOKEN)?;
        Ok(MioEventPort {
            poll,
            events: mio::Events::with_capacity(128),
            waker: Arc::new(MioWaker(waker)),
        })
    }

    /// The underlying registry, for callers that want to register their own
    /// I/O sources with this port.
    pub fn registry(&self) -> &mio::Registry {
        self.poll.registry()
    }
}

impl EventPort for MioEventPort {
    fn wait(&mut self) -> bool {
        match self.poll.poll(&mut self.events, None) {
            Ok(()) => !self.events.is_empty(),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => false,
            Err(e) => {
                tracing::error!(error = %e, "mio poll failed");
                false
            }
        }
    }

    fn poll(&mut self) -> bool {
        match self.poll.poll(&mut self.events, Some(std::time::Duration::ZERO)) {
            Ok(()) => !self.events.is_empty(),
            Err(_) => false,
        }
    }

    fn set_runnable(&mut self, _runnable: bool) {}

    fn waker(&self) -> Arc<dyn Waker> {
        self.waker.clone()
    }
}

pub(crate) struct LoopInner {
    /// Continuations armed while the loop was running, whose input had not
    /// yet resolved when `on_ready` registered them — run immediately after
    /// the current turn, ahead of anything in `back_queue` (§5 ordering:
    /// "depth-first scheduling").
    front_queue: RefCell<VecDeque<Rc<dyn Event>>>,
    /// Continuations of an already-resolved input, plus anything armed
    /// breadth-first — run after `front_queue` drains.
    back_queue: RefCell<VecDeque<Rc<dyn Event>>>,
    /// `evalLast` tier: drained only once both other queues are empty.
    last_queue: RefCell<VecDeque<Rc<dyn Event>>>,
    port: RefCell<Box<dyn EventPort>>,
    running: Cell<bool>,
    turns_run: Cell<u64>,
    has_wait_scope: Cell<bool>,
    loop_id: u64,
    executor: Executor,
    /// Fire-and-forget promises from `Promise::detach`; kept alive so the
    /// loop keeps driving them, pruned once resolved.
    detached: RefCell<Vec<Promise<()>>>,
    /// Cross-thread paf promises awaiting their shared result slot, polled
    /// once per turn.
    pending_pafs: RefCell<Vec<Rc<dyn PendingXThreadPaf>>>,
}

/// The cooperative run queue. One `EventLoop` is normally paired with one
/// [`WaitScope`] for its entire lifetime, though the scope may be
/// constructed and dropped repeatedly as long as only one exists at a time.
pub struct EventLoop {
    pub(crate) inner: Rc<LoopInner>,
}

impl EventLoop {
    pub fn new(port: Box<dyn EventPort>) -> Self {
        let waker = port.waker();
        let loop_id = crate::executor::fresh_loop_id();
        EventLoop {
            inner: Rc::new(LoopInner {
                front_queue: RefCell::new(VecDeque::new()),
                back_queue: RefCell::new(VecDeque::new()),
                last_queue: RefCell::new(VecDeque::new()),
                port: RefCell::new(port),
                running: Cell::new(false),
                turns_run: Cell::new(0),
                has_wait_scope: Cell::new(false),
                loop_id,
                executor: Executor::new(loop_id, waker),
                detached: RefCell::new(Vec::new()),
                pending_pafs: RefCell::new(Vec::new()),
            }),
        }
    }

    /// An `Executor` handle for this loop, cloneable and `Send`able to
    /// other threads so they may submit work here. Equivalent to what
    /// `current_thread_executor()` returns from inside a `WaitScope`.
    #[must_use]
    pub fn executor(&self) -> Executor {
        self.inner.executor.clone()
    }

    /// Runs at most one event. Returns `false` if the queue was empty (the
    /// loop had nothing runnable).
    pub fn turn(&self) -> bool {
        self.inner.turn()
    }

    /// Runs up to `max_turns` events, stopping early if the queue empties.
    /// Returns the number of events actually run.
    pub fn poll(&self, max_turns: usize) -> usize {
        let mut n = 0;
        while n < max_turns && self.inner.turn() {
            n += 1;
        }
        n
    }

    pub(crate) fn wait_on_port(&self) {
        self.inner.wait_on_port();
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.inner.executor.disconnect();
    }
}

impl LoopInner {
    pub(crate) fn arm(&self, event: Rc<dyn Event>, depth_first: bool) {
        if depth_first {
            self.front_queue.borrow_mut().push_back(event);
        } else {
            self.back_queue.borrow_mut().push_back(event);
        }
        self.port.borrow_mut().set_runnable(true);
    }

    pub(crate) fn arm_last(&self, event: Rc<dyn Event>) {
        self.last_queue.borrow_mut().push_back(event);
    }

    fn next_event(&self) -> Option<Rc<dyn Event>> {
        if let Some(e) = self.front_queue.borrow_mut().pop_front() {
            return Some(e);
        }
        if let Some(e) = self.back_queue.borrow_mut().pop_front() {
            return Some(e);
        }
        self.last_queue.borrow_mut().pop_front()
    }

    pub(crate) fn turn(&self) -> bool {
        self.executor.drain_into(self);
        self.pending_pafs.borrow_mut().retain(|p| !p.clone().poll());
        self.detached.borrow_mut().retain_mut(|p| !p.poll_detached());

        let Some(event) = self.next_event() else {
            return false;
        };
        self.running.set(true);
        self.turns_run.set(self.turns_run.get() + 1);
        event.fire();
        self.running.set(false);
        let empty = self.front_queue.borrow().is_empty()
            && self.back_queue.borrow().is_empty()
            && self.last_queue.borrow().is_empty();
        if empty {
            self.port.borrow_mut().set_runnable(false);
        }
        true
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.get()
    }

    #[must_use]
    pub(crate) fn loop_id(&self) -> u64 {
        self.loop_id
    }

    pub(crate) fn retain_detached(&self, promise: Promise<()>) {
        self.detached.borrow_mut().push(promise);
    }

    pub(crate) fn register_pending_paf(&self, node: Rc<dyn PendingXThreadPaf>) {
        self.pending_pafs.borrow_mut().push(node);
    }

    pub(crate) fn wait_on_port(&self) {
        self.port.borrow_mut().wait();
    }
}

thread_local! {
    static CURRENT_LOOP: RefCell<Option<Weak<LoopInner>>> = const { RefCell::new(None) };
}

/// A stack-scoped token permitting synchronous `wait`. At most one
/// `WaitScope` may exist per loop (and per thread) at a time; binds the
/// loop to the current OS thread until dropped.
pub struct WaitScope<'a> {
    loop_: &'a EventLoop,
}

impl<'a> WaitScope<'a> {
    /// # Panics
    ///
    /// Panics if a `WaitScope` already exists on this thread, or if this
    /// loop already has a live `WaitScope` elsewhere.
    #[must_use]
    pub fn new(loop_: &'a EventLoop) -> Self {
        assert!(
            !loop_.inner.has_wait_scope.replace(true),
            "a WaitScope already exists for this EventLoop"
        );
        CURRENT_LOOP.with(|c| {
            let mut c = c.borrow_mut();
            assert!(c.is_none(), "nested WaitScope on the same thread");
            *c = Some(Rc::downgrade(&loop_.inner));
        });
        WaitScope { loop_ }
    }

    pub(crate) fn inner(&self) -> &Rc<LoopInner> {
        &self.loop_.inner
    }

    #[must_use]
    pub fn event_loop(&self) -> &EventLoop {
        self.loop_
    }
}

impl Drop for WaitScope<'_> {
    fn drop(&mut self) {
        self.loop_.inner.has_wait_scope.set(false);
        CURRENT_LOOP.with(|c| *c.borrow_mut() = None);
    }
}

/// Returns this thread's currently bound loop's `Executor`.
///
/// # Panics
///
/// Panics if called outside a live `WaitScope`.
#[must_use]
pub fn current_thread_executor() -> Executor {
    CURRENT_LOOP.with(|c| {
        let inner = c
            .borrow()
            .as_ref()
            .and_then(Weak::upgrade)
            .expect("current_thread_executor() called outside a WaitScope");
        inner.executor.clone()
    })
}

pub(crate) fn with_current_loop<R>(f: impl FnOnce(&Rc<LoopInner>) -> R) -> Option<R> {
    CURRENT_LOOP.with(|c| c.borrow().as_ref().and_then(Weak::upgrade).map(|inner| f(&inner)))
}
