// Copyright 2025. The zc-rt authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The cross-thread promise/fulfiller split. `XThreadFulfiller<T>` is
//! `Send`, unlike [`crate::promise::Fulfiller`]; the promise side still
//! lives entirely on its owning loop's thread and is driven to readiness by
//! that loop polling a shared, mutex-guarded result slot once per turn
//! (§4.5, "PromiseAndCrossThreadFulfiller").

use crate::error::{Exception, Result};
use crate::event_loop::Event;
use crate::promise::node::{PromiseNode, ReadySlot};
use crate::promise::Promise;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

struct XPafShared<T> {
    result: Mutex<Option<Result<T>>>,
    waiting: AtomicBool,
}

/// The write side, safe to move to another thread and fulfill from there.
pub struct XThreadFulfiller<T> {
    shared: Arc<XPafShared<T>>,
}

impl<T: Send + 'static> XThreadFulfiller<T> {
    /// Fulfills the paired promise. A second call is a silent no-op.
    pub fn fulfill(self, value: T) {
        self.complete(Ok(value));
    }

    /// Rejects the paired promise.
    pub fn reject(self, exception: Exception) {
        self.complete(Err(exception));
    }

    fn complete(self, result: Result<T>) {
        let mut guard = self.shared.result.lock().unwrap();
        if guard.is_none() {
            *guard = Some(result);
        }
    }

    /// Whether the paired promise has not yet been dropped.
    #[must_use]
    pub fn is_waiting(&self) -> bool {
        self.shared.waiting.load(Ordering::Acquire)
    }
}

impl<T: Send + 'static> Drop for XThreadFulfiller<T> {
    fn drop(&mut self) {
        let mut guard = self.shared.result.lock().unwrap();
        if guard.is_none() {
            *guard = Some(Err(Exception::broken_promise()));
        }
    }
}

/// Registered with the owning loop so `poll` runs once per turn; returns
/// `true` once resolved, at which point the registry drops its reference.
pub(crate) trait PendingXThreadPaf {
    fn poll(self: Rc<Self>) -> bool;
}

struct XThreadPafNode<T> {
    shared: Arc<XPafShared<T>>,
    slot: ReadySlot<T>,
}

impl<T: Send + 'static> PendingXThreadPaf for XThreadPafNode<T> {
    fn poll(self: Rc<Self>) -> bool {
        if self.slot.poll_ready() {
            return true;
        }
        let taken = self.shared.result.lock().unwrap().take();
        if let Some(result) = taken {
            self.slot.fulfill(result);
            true
        } else {
            false
        }
    }
}

impl<T: Send + 'static> PromiseNode<T> for Rc<XThreadPafNode<T>> {
    fn on_ready(&self, event: Weak<dyn Event>) {
        self.slot.on_ready(event);
    }
    fn poll_ready(&self) -> bool {
        self.slot.poll_ready()
    }
    fn get(&self) -> Result<T> {
        self.slot.get()
    }
    fn trace(&self, frames: &mut Vec<&'static str>) {
        frames.push("cross_thread_fulfiller");
    }
}

impl<T> Drop for XThreadPafNode<T> {
    fn drop(&mut self) {
        self.shared.waiting.store(false, Ordering::Release);
    }
}

/// Splits a `Promise<T>` bound to the current thread's loop from a
/// [`XThreadFulfiller<T>`] that may be fulfilled from any thread.
///
/// # Panics
///
/// Panics if called outside a live `WaitScope`.
#[must_use]
pub fn new_promise_and_cross_thread_fulfiller<T: Send + 'static>() -> (Promise<T>, XThreadFulfiller<T>) {
    let shared = Arc::new(XPafShared { result: Mutex::new(None), waiting: AtomicBool::new(true) });
    let node = Rc::new(XThreadPafNode { shared: shared.clone(), slot: ReadySlot::new() });
    crate::event_loop::with_current_loop(|lp| lp.register_pending_paf(node.clone()))
        .expect("new_promise_and_cross_thread_fulfiller() called outside a WaitScope");
    let fulfiller = XThreadFulfiller { shared };
    (Promise::from_node(Box::new(node)), fulfiller)
}
