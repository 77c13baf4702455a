// Copyright 2025. The zc-rt authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The stackless coroutine adapter: bridges a native `Future` (most often
//! an `async fn` body) onto the `PromiseNode` contract (§4.2).
//!
//! Waking a pending future re-arms its node depth-first through the same
//! [`arm_now`] path every other node resolution uses — a coroutine waking
//! itself up reads as "this is a continuation of work already in
//! progress," exactly like [`crate::promise::Fulfiller::fulfill`].

use crate::error::Result;
use crate::event_loop::Event;
use crate::promise::node::{arm_now, PromiseNode, ReadySlot};
use crate::promise::Promise;
use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

struct RawWeakEvent(Weak<dyn Event>);

static VTABLE: RawWakerVTable = RawWakerVTable::new(clone_raw, wake_raw, wake_by_ref_raw, drop_raw);

unsafe fn clone_raw(ptr: *const ()) -> RawWaker {
    let this = &*ptr.cast::<RawWeakEvent>();
    let boxed = Box::new(RawWeakEvent(this.0.clone()));
    RawWaker::new(Box::into_raw(boxed).cast::<()>(), &VTABLE)
}

unsafe fn wake_raw(ptr: *const ()) {
    let boxed = Box::from_raw(ptr.cast::<RawWeakEvent>().cast_mut());
    arm_now(boxed.0, true);
}

unsafe fn wake_by_ref_raw(ptr: *const ()) {
    let this = &*ptr.cast::<RawWeakEvent>();
    arm_now(this.0.clone(), true);
}

unsafe fn drop_raw(ptr: *const ()) {
    drop(Box::from_raw(ptr.cast::<RawWeakEvent>().cast_mut()));
}

/// Builds a `Waker` that, when woken, arms `event`. Not safe to send across
/// threads — this runtime never does, since every `PromiseNode` is
/// thread-confined via `Rc`.
fn waker_for(event: Weak<dyn Event>) -> Waker {
    let boxed = Box::new(RawWeakEvent(event));
    let raw = RawWaker::new(Box::into_raw(boxed).cast::<()>(), &VTABLE);
    unsafe { Waker::from_raw(raw) }
}

struct FutureNode<F: Future> {
    future: RefCell<Pin<Box<F>>>,
    slot: ReadySlot<F::Output>,
}

impl<F: Future + 'static> FutureNode<F> {
    fn poll_once(self: &Rc<Self>) {
        if self.slot.poll_ready() {
            return;
        }
        let weak: Weak<dyn Event> = Rc::downgrade(self);
        let waker = waker_for(weak);
        let mut cx = Context::from_waker(&waker);
        let poll = self.future.borrow_mut().as_mut().poll(&mut cx);
        if let Poll::Ready(value) = poll {
            self.slot.fulfill(Ok(value));
        }
    }
}

impl<F: Future + 'static> Event for FutureNode<F> {
    fn fire(self: Rc<Self>) {
        self.poll_once();
    }
}

impl<F: Future + 'static> PromiseNode<F::Output> for Rc<FutureNode<F>> {
    fn on_ready(&self, event: Weak<dyn Event>) {
        self.slot.on_ready(event);
    }
    fn poll_ready(&self) -> bool {
        self.slot.poll_ready()
    }
    fn get(&self) -> Result<F::Output> {
        self.slot.get()
    }
    fn trace(&self, frames: &mut Vec<&'static str>) {
        frames.push("async_fn");
    }
}

/// Adapts `future` into a `Promise`, driving it with the loop's ordinary
/// run queue instead of a dedicated task executor. `future` is polled
/// eagerly once here, up to its first suspension point, mirroring a
/// coroutine that begins running the instant it is created.
///
/// Dropping the returned promise before it resolves drops `future` in
/// place, running its normal `Drop` glue — there is no separate cancelled
/// state to observe from inside the future.
#[must_use]
pub fn from_future<F: Future + 'static>(future: F) -> Promise<F::Output> {
    let node = Rc::new(FutureNode { future: RefCell::new(Box::pin(future)), slot: ReadySlot::new() });
    node.poll_once();
    Promise::from_node(Box::new(node))
}

// === the other direction: awaiting a `Promise<T>` from inside an `async fn` ===

/// Arms the `Waker` it was built from when fired — the `Event` side of the
/// bridge, the mirror image of `waker_for` arming a `PromiseNode`.
struct WakerEvent(Waker);

impl Event for WakerEvent {
    fn fire(self: Rc<Self>) {
        self.0.wake_by_ref();
    }
}

/// A `Promise<T>` being polled as a `std::future::Future`, produced by
/// [`IntoFuture for Promise<T>`](std::future::IntoFuture). Implements
/// §4.2's three `co_await` fast paths:
///
/// 1. already resolved (either already so at the first poll, or because a
///    previous poll's registered waker fired before this future was polled
///    again) — extracted immediately, no suspension;
/// 2. not yet resolved — registers as the promise's parent and returns
///    `Pending`, to be re-polled once the upstream arms our waker;
/// 3. resolved with a failure — `get()` returns `Err`, surfacing through
///    `Poll::Ready(Err(_))` for the caller to propagate with `?`.
pub struct PromiseFuture<T> {
    promise: Promise<T>,
}

impl<T: 'static> Future for PromiseFuture<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.promise.poll_ready() {
            return Poll::Ready(this.promise.get());
        }
        let event = Rc::new(WakerEvent(cx.waker().clone()));
        this.promise.on_ready(Rc::downgrade(&event) as Weak<dyn Event>);
        Poll::Pending
    }
}

impl<T: 'static> std::future::IntoFuture for Promise<T> {
    type Output = Result<T>;
    type IntoFuture = PromiseFuture<T>;

    fn into_future(self) -> PromiseFuture<T> {
        PromiseFuture { promise: self }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{new_promise_and_fulfiller, EventLoop, NullEventPort, WaitScope};

    fn with_loop<R>(f: impl FnOnce(&WaitScope) -> R) -> R {
        let loop_ = EventLoop::new(Box::new(NullEventPort::default()));
        let scope = WaitScope::new(&loop_);
        f(&scope)
    }

    #[test]
    fn awaiting_an_already_resolved_promise_extracts_immediately() {
        with_loop(|scope| {
            let value = from_future(async { Promise::ready(41).await.unwrap() + 1 });
            assert_eq!(value.wait(scope).unwrap(), 42);
        });
    }

    #[test]
    fn awaiting_an_unresolved_promise_suspends_until_fulfilled() {
        with_loop(|scope| {
            let (promise, fulfiller) = new_promise_and_fulfiller::<i32>();
            let combined = from_future(async move { promise.await.unwrap() + 1 });
            fulfiller.fulfill(9);
            assert_eq!(combined.wait(scope).unwrap(), 10);
        });
    }

    #[test]
    fn awaiting_a_rejected_promise_propagates_the_failure() {
        with_loop(|scope| {
            let (promise, fulfiller) = new_promise_and_fulfiller::<i32>();
            drop(fulfiller);
            let combined: Promise<Result<i32>> = from_future(async move { promise.await });
            let inner = combined.wait(scope).unwrap();
            assert!(inner.is_err());
        });
    }

    #[test]
    fn awaiting_a_promise_twice_in_sequence_runs_both_fast_paths() {
        with_loop(|scope| {
            let (p1, f1) = new_promise_and_fulfiller::<i32>();
            let combined = from_future(async move {
                // first await suspends (p1 resolves later)...
                let a = p1.await.unwrap();
                // ...second await hits the already-resolved fast path.
                let b = Promise::ready(a + 1).await.unwrap();
                b
            });
            f1.fulfill(1);
            assert_eq!(combined.wait(scope).unwrap(), 2);
        });
    }
}
