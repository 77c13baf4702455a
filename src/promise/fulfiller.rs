// Copyright 2025. The zc-rt authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The manually-fulfilled promise/fulfiller split, same-thread variant.
//! The cross-thread version lives in [`crate::paf`].

use crate::error::{Exception, Result};
use crate::event_loop::Event;
use crate::promise::node::{PromiseNode, ReadySlot};
use crate::promise::Promise;
use std::cell::Cell;
use std::rc::{Rc, Weak};

struct PafState<T> {
    slot: ReadySlot<T>,
    waiting: Cell<bool>,
}

struct PafNode<T> {
    state: Rc<PafState<T>>,
}

impl<T> PromiseNode<T> for PafNode<T> {
    fn on_ready(&self, event: Weak<dyn Event>) {
        self.state.slot.on_ready(event);
    }
    fn poll_ready(&self) -> bool {
        self.state.slot.poll_ready()
    }
    fn get(&self) -> Result<T> {
        self.state.slot.get()
    }
    fn trace(&self, frames: &mut Vec<&'static str>) {
        frames.push("promise_and_fulfiller");
    }
}

impl<T> Drop for PafNode<T> {
    fn drop(&mut self) {
        self.state.waiting.set(false);
    }
}

/// The write side of [`new_promise_and_fulfiller`]. Thread-confined: use
/// [`crate::paf::new_promise_and_cross_thread_fulfiller`] to fulfill from
/// another thread.
pub struct Fulfiller<T> {
    state: Weak<PafState<T>>,
}

impl<T: 'static> Fulfiller<T> {
    /// Fulfills the paired promise with `value`. A second call (on this or
    /// an already-consumed fulfiller) is a silent no-op — the first call
    /// wins, per spec §8.6.
    pub fn fulfill(self, value: T) {
        self.reject_or_fulfill(Ok(value));
    }

    /// Rejects the paired promise with `exception`.
    pub fn reject(self, exception: Exception) {
        self.reject_or_fulfill(Err(exception));
    }

    fn reject_or_fulfill(self, result: Result<T>) {
        if let Some(state) = self.state.upgrade() {
            if !state.slot.poll_ready() {
                state.slot.fulfill(result);
            }
        }
    }

    /// Whether the paired `Promise` has not yet been dropped or fulfilled.
    #[must_use]
    pub fn is_waiting(&self) -> bool {
        self.state.upgrade().is_some_and(|s| s.waiting.get())
    }
}

/// Splits a fresh `Promise<T>` from a `Fulfiller<T>` that can resolve it
/// exactly once, from the same thread. Dropping the fulfiller without
/// calling it rejects the promise with [`Exception::broken_promise`].
#[must_use]
pub fn new_promise_and_fulfiller<T: 'static>() -> (Promise<T>, Fulfiller<T>) {
    let state = Rc::new(PafState { slot: ReadySlot::new(), waiting: Cell::new(true) });
    let node = PafNode { state: state.clone() };
    let fulfiller = Fulfiller { state: Rc::downgrade(&state) };
    (Promise::from_node(Box::new(node)), fulfiller)
}

impl<T: 'static> Drop for Fulfiller<T> {
    fn drop(&mut self) {
        if let Some(state) = self.state.upgrade() {
            if !state.slot.poll_ready() {
                state.slot.fulfill(Err(Exception::broken_promise()));
            }
        }
    }
}
