// Copyright 2025. The zc-rt authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The cross-thread executor: lets one loop's thread submit work onto
//! another loop, with cancellation that stays responsive even inside a
//! multi-way cancel cycle (§4.5, §9 of the design).

use crate::error::{Exception, Result};
use crate::event_loop::{LoopInner, Waker};
use crate::paf::new_promise_and_cross_thread_fulfiller;
use crate::promise::Promise;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

static NEXT_LOOP_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn fresh_loop_id() -> u64 {
    NEXT_LOOP_ID.fetch_add(1, Ordering::Relaxed)
}

/// Per-job cancel handshake: the submitter's drop sets `canceled` and then
/// blocks on `acked`; the target sets `acked` once the job is either
/// skipped (still queued when cancel arrived) or has finished running.
struct JobCancel {
    canceled: AtomicBool,
    acked: (Mutex<bool>, Condvar),
}

impl JobCancel {
    fn new() -> Arc<Self> {
        Arc::new(JobCancel { canceled: AtomicBool::new(false), acked: (Mutex::new(false), Condvar::new()) })
    }

    fn ack(&self) {
        *self.acked.0.lock().unwrap() = true;
        self.acked.1.notify_all();
    }
}

struct Job {
    run: Box<dyn FnOnce(&LoopInner) + Send>,
    /// Run instead of `run` if the job is still queued when the owning loop
    /// disconnects, so a waiter sees `DISCONNECTED` rather than the generic
    /// `BROKEN_PROMISE` an abandoned fulfiller would otherwise produce.
    on_disconnect: Option<Box<dyn FnOnce(Exception) + Send>>,
    cancel: Arc<JobCancel>,
}

struct ExecutorState {
    owner_loop_id: u64,
    live: AtomicBool,
    waker: Arc<dyn Waker>,
    jobs: Mutex<VecDeque<Job>>,
}

/// A handle to a loop, safe to hold and call from any thread. Obtained via
/// [`EventLoop::executor`](crate::event_loop::EventLoop::executor) or
/// [`current_thread_executor`](crate::event_loop::current_thread_executor).
#[derive(Clone)]
pub struct Executor {
    state: Arc<ExecutorState>,
}

impl Executor {
    pub(crate) fn new(owner_loop_id: u64, waker: Arc<dyn Waker>) -> Self {
        Executor {
            state: Arc::new(ExecutorState {
                owner_loop_id,
                live: AtomicBool::new(true),
                waker,
                jobs: Mutex::new(VecDeque::new()),
            }),
        }
    }

    /// Whether the target loop is still running. Once `false`, further
    /// submissions fail immediately with `DISCONNECTED`.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.state.live.load(Ordering::Acquire)
    }

    fn is_own_thread(&self) -> bool {
        crate::event_loop::with_current_loop(|lp| lp.loop_id() == self.state.owner_loop_id).unwrap_or(false)
    }

    /// Submits `f` to the target loop's thread and blocks until it
    /// completes, returning its result.
    ///
    /// # Errors
    ///
    /// `DISCONNECTED` if the target loop is not live, or becomes
    /// disconnected while this call is blocked.
    #[tracing::instrument(skip_all)]
    pub fn execute_sync<R: Send + 'static>(&self, f: impl FnOnce() -> R + Send + 'static) -> Result<R> {
        if !self.is_live() {
            return Err(Exception::disconnected("executor is disconnected"));
        }
        let outcome: Arc<(Mutex<Option<R>>, Condvar)> = Arc::new((Mutex::new(None), Condvar::new()));
        let outcome2 = outcome.clone();
        let cancel = JobCancel::new();
        self.state.jobs.lock().unwrap().push_back(Job {
            run: Box::new(move |_lp| {
                let value = f();
                *outcome2.0.lock().unwrap() = Some(value);
                outcome2.1.notify_all();
            }),
            on_disconnect: None,
            cancel,
        });
        self.state.waker.wake();

        let (lock, cv) = &*outcome;
        let mut guard = lock.lock().unwrap();
        loop {
            if let Some(value) = guard.take() {
                return Ok(value);
            }
            if !self.is_live() {
                return Err(Exception::disconnected("executor disconnected while waiting"));
            }
            guard = cv.wait_timeout(guard, Duration::from_millis(20)).unwrap().0;
        }
    }

    /// Like [`execute_sync`](Self::execute_sync), but `f` returns a promise
    /// that the *target* loop drives to completion before replying.
    ///
    /// # Panics
    ///
    /// Panics if called on the submitter's own loop — driving a promise to
    /// completion on the loop that is itself blocked waiting for the reply
    /// would deadlock.
    pub fn execute_sync_promise<R: Send + 'static>(
        &self,
        f: impl FnOnce() -> Promise<R> + Send + 'static,
    ) -> Result<R> {
        assert!(
            !self.is_own_thread(),
            "execute_sync_promise on the submitter's own loop would deadlock"
        );
        let outcome: Arc<(Mutex<Option<Result<R>>>, Condvar)> = Arc::new((Mutex::new(None), Condvar::new()));
        let outcome2 = outcome.clone();
        let cancel = JobCancel::new();
        if !self.is_live() {
            return Err(Exception::disconnected("executor is disconnected"));
        }
        self.state.jobs.lock().unwrap().push_back(Job {
            run: Box::new(move |lp| {
                let value = f().drive_to_completion(lp);
                *outcome2.0.lock().unwrap() = Some(value);
                outcome2.1.notify_all();
            }),
            on_disconnect: None,
            cancel,
        });
        self.state.waker.wake();

        let (lock, cv) = &*outcome;
        let mut guard = lock.lock().unwrap();
        loop {
            if let Some(value) = guard.take() {
                return value;
            }
            if !self.is_live() {
                return Err(Exception::disconnected("executor disconnected while waiting"));
            }
            guard = cv.wait_timeout(guard, Duration::from_millis(20)).unwrap().0;
        }
    }

    /// Submits `f` to the target loop and returns a local promise resolved
    /// when it completes there. Dropping the returned promise sends a
    /// cancel request and blocks (while keeping this thread's own loop
    /// responsive, so cancel cycles cannot deadlock) until the target
    /// acknowledges.
    #[tracing::instrument(skip_all)]
    pub fn execute_async<R: Send + 'static>(&self, f: impl FnOnce() -> R + Send + 'static) -> Promise<R> {
        if !self.is_live() {
            return Promise::from_result(Err(Exception::disconnected("executor is disconnected")));
        }
        let (promise, fulfiller) = new_promise_and_cross_thread_fulfiller::<R>();
        let cancel = JobCancel::new();
        // Shared so whichever of `run` / `on_disconnect` actually fires can
        // take the fulfiller; the other sees it already gone and does
        // nothing.
        let fulfiller = Arc::new(Mutex::new(Some(fulfiller)));
        let fulfiller2 = fulfiller.clone();
        self.state.jobs.lock().unwrap().push_back(Job {
            run: Box::new(move |_lp| {
                if let Some(fulfiller) = fulfiller.lock().unwrap().take() {
                    fulfiller.fulfill(f());
                }
            }),
            on_disconnect: Some(Box::new(move |e| {
                if let Some(fulfiller) = fulfiller2.lock().unwrap().take() {
                    fulfiller.reject(e);
                }
            })),
            cancel: cancel.clone(),
        });
        self.state.waker.wake();

        promise.attach(CancelOnDrop { target: self.state.clone(), cancel })
    }

    /// Drains and runs every job currently queued for this loop. Called
    /// once per turn by the owning [`LoopInner`]; cross-thread jobs are
    /// dispatched as a batch rather than one per turn, so a submission that
    /// arrives mid-turn is not delayed an extra full loop cycle.
    pub(crate) fn drain_into(&self, lp: &LoopInner) {
        loop {
            let job = self.state.jobs.lock().unwrap().pop_front();
            let Some(job) = job else { break };
            if job.cancel.canceled.load(Ordering::Acquire) {
                job.cancel.ack();
                continue;
            }
            (job.run)(lp);
            job.cancel.ack();
        }
    }

    pub(crate) fn disconnect(&self) {
        self.state.live.store(false, Ordering::Release);
        let jobs: VecDeque<Job> = std::mem::take(&mut *self.state.jobs.lock().unwrap());
        for job in jobs {
            if let Some(on_disconnect) = job.on_disconnect {
                on_disconnect(Exception::disconnected("executor's loop exited"));
            }
            job.cancel.ack();
        }
    }
}

/// Resource attached to an `execute_async` promise: its `Drop` is the
/// cancel-request + blocking-acknowledge handshake.
struct CancelOnDrop {
    target: Arc<ExecutorState>,
    cancel: Arc<JobCancel>,
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.cancel.canceled.store(true, Ordering::Release);
        self.target.waker.wake();
        loop {
            if *self.cancel.acked.0.lock().unwrap() {
                return;
            }
            if !self.target.live.load(Ordering::Acquire) {
                return;
            }
            // Keep pumping this thread's own loop while we wait, so an
            // inbound cancel from further around a cycle still gets
            // serviced instead of deadlocking against this drop.
            let progressed = crate::event_loop::with_current_loop(|lp| lp.turn()).unwrap_or(false);
            if !progressed {
                let guard = self.cancel.acked.0.lock().unwrap();
                if *guard {
                    return;
                }
                let _ = self.cancel.acked.1.wait_timeout(guard, Duration::from_millis(5));
            }
        }
    }
}
