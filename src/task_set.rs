// Copyright 2025. The zc-rt authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! `TaskSet` (fire-and-forget tasks with a shared error sink) and
//! `Canceler` (a late-bound cancellation trigger wrappable around any
//! number of promises) — §4.6.

use crate::error::{Exception, Result};
use crate::promise::node::ThenOutcome;
use crate::promise::{new_promise_and_fulfiller, ForkHub, Fulfiller, Promise};
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

struct TaskSetInner {
    tasks: RefCell<Vec<(u64, Promise<()>)>>,
    empty_waiters: RefCell<Vec<Fulfiller<()>>>,
    next_id: Cell<u64>,
    error_handler: Box<dyn Fn(Exception)>,
}

impl TaskSetInner {
    /// Runs once a tracked task resolves: removes it from the set, reports
    /// any failure, and wakes `onEmpty` waiters if the set is now empty.
    /// Called through a `Weak`, not an `Rc`, so the continuation holding it
    /// never keeps the set itself alive (an `Rc` here would be a cycle:
    /// `TaskSetInner` owns the task's `Promise`, whose continuation would
    /// own an `Rc` back to `TaskSetInner`).
    fn finish(weak: &Weak<TaskSetInner>, id: u64, error: Option<Exception>) {
        let Some(inner) = weak.upgrade() else { return };
        inner.tasks.borrow_mut().retain(|(tid, _)| *tid != id);
        if let Some(e) = error {
            (inner.error_handler)(e);
        }
        if inner.tasks.borrow().is_empty() {
            for f in inner.empty_waiters.borrow_mut().drain(..) {
                f.fulfill(());
            }
        }
    }
}

/// A collection of fire-and-forget promises, each driven to completion by
/// the loop whether or not anyone still holds its handle. Failures go to a
/// shared error handler instead of panicking or being silently dropped.
///
/// Dropping the `TaskSet` cancels every task still outstanding.
pub struct TaskSet {
    inner: Rc<TaskSetInner>,
}

impl TaskSet {
    #[must_use]
    pub fn new(error_handler: impl Fn(Exception) + 'static) -> Self {
        TaskSet {
            inner: Rc::new(TaskSetInner {
                tasks: RefCell::new(Vec::new()),
                empty_waiters: RefCell::new(Vec::new()),
                next_id: Cell::new(0),
                error_handler: Box::new(error_handler),
            }),
        }
    }

    /// Adds `task`, eagerly evaluating it. Safe to call from within the
    /// error handler or from a task's own destructor.
    pub fn add(&self, task: Promise<()>) {
        let id = self.inner.next_id.get();
        self.inner.next_id.set(id + 1);
        let weak_ok = Rc::downgrade(&self.inner);
        let weak_err = weak_ok.clone();
        let wrapped = task
            .then_else(
                move |()| {
                    TaskSetInner::finish(&weak_ok, id, None);
                    ThenOutcome::Value(Ok(()))
                },
                move |e| {
                    TaskSetInner::finish(&weak_err, id, Some(e));
                    ThenOutcome::Value(Ok(()))
                },
            )
            .eagerly_evaluate();
        self.inner.tasks.borrow_mut().push((id, wrapped));
    }

    /// Resolves the next time this set has no outstanding tasks (including
    /// immediately, if it is already empty).
    #[must_use]
    pub fn on_empty(&self) -> Promise<()> {
        if self.inner.tasks.borrow().is_empty() {
            return Promise::ready(());
        }
        let (promise, fulfiller) = new_promise_and_fulfiller();
        self.inner.empty_waiters.borrow_mut().push(fulfiller);
        promise
    }

    /// Cancels every outstanding task. Safe to call from within the error
    /// handler or from a task's own destructor.
    pub fn clear(&self) {
        self.inner.tasks.borrow_mut().clear();
        for f in self.inner.empty_waiters.borrow_mut().drain(..) {
            f.fulfill(());
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.tasks.borrow().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.tasks.borrow().is_empty()
    }
}

struct CancelerState {
    fork: RefCell<Option<ForkHub<Exception>>>,
    fulfiller: RefCell<Option<Fulfiller<Exception>>>,
    canceled_with: RefCell<Option<Exception>>,
}

/// A late-bound cancellation trigger: wrap any number of promises with
/// [`wrap`](Self::wrap), then call [`cancel`](Self::cancel) once to reject
/// all of them (and any future `wrap` calls) with the same exception.
pub struct Canceler {
    state: Rc<CancelerState>,
}

impl Default for Canceler {
    fn default() -> Self {
        Self::new()
    }
}

impl Canceler {
    #[must_use]
    pub fn new() -> Self {
        Canceler {
            state: Rc::new(CancelerState {
                fork: RefCell::new(None),
                fulfiller: RefCell::new(None),
                canceled_with: RefCell::new(None),
            }),
        }
    }

    fn ensure_trigger(&self) {
        if self.state.fork.borrow().is_none() {
            let (promise, fulfiller) = new_promise_and_fulfiller::<Exception>();
            *self.state.fork.borrow_mut() = Some(promise.fork());
            *self.state.fulfiller.borrow_mut() = Some(fulfiller);
        }
    }

    /// Wraps `promise` so that a later [`cancel`](Self::cancel) call rejects
    /// it. If this canceler has already been cancelled, `promise` is
    /// dropped immediately and the same exception is returned.
    #[must_use]
    pub fn wrap<T: 'static>(&self, promise: Promise<T>) -> Promise<T> {
        if let Some(e) = self.state.canceled_with.borrow().clone() {
            return Promise::from_result(Err(e));
        }
        self.ensure_trigger();
        let cancel_signal = self.state.fork.borrow().as_ref().unwrap().add_branch();
        let cancel_as_result: Promise<T> =
            cancel_signal.then_else(|e| ThenOutcome::Value(Err(e)), |e| ThenOutcome::Value(Err(e)));
        promise.exclusive_join(cancel_as_result)
    }

    /// Rejects every promise currently wrapped by this canceler, and any
    /// wrapped afterward, with `exception`. A second call safely does
    /// nothing beyond updating the exception used for future `wrap` calls.
    pub fn cancel(&self, exception: Exception) {
        *self.state.canceled_with.borrow_mut() = Some(exception.clone());
        if let Some(f) = self.state.fulfiller.borrow_mut().take() {
            f.fulfill(exception);
        }
    }
}
