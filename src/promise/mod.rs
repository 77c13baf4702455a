// Copyright 2025. The zc-rt authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! `Promise<T>`: a move-only handle owning one node of the promise graph,
//! and the adapter combinators that compose nodes (§4.1 of the design).

pub(crate) mod node;

pub use fulfiller::{new_promise_and_fulfiller, Fulfiller};

mod fulfiller;

use crate::error::{Exception, Result};
use crate::event_loop::WaitScope;
use node::{
    eval_later, eval_last, yield_now, AttachNode, BranchNode, EagerNode, ExclusiveJoinNode,
    ForkHubState, IgnoreResultNode, ImmediateNode, JoinNode, NeverNode, PromiseNode, RaceNode,
    ThenNode, ThenOutcome,
};
use std::rc::Rc;

/// A move-only handle owning one `PromiseNode<T>`. Dropping it cancels the
/// underlying computation (destroys the node, which recursively destroys
/// its children).
pub struct Promise<T> {
    node: Box<dyn PromiseNode<T>>,
}

impl<T: 'static> Promise<T> {
    pub(crate) fn from_node(node: Box<dyn PromiseNode<T>>) -> Self {
        Promise { node }
    }

    pub(crate) fn into_node(self) -> Box<dyn PromiseNode<T>> {
        self.node
    }

    /// Registers `event` to be armed once this promise resolves, without
    /// consuming the promise. Used by the `Future` bridge in
    /// `coroutine.rs` to re-point a waker on every poll.
    pub(crate) fn on_ready(&self, event: std::rc::Weak<dyn crate::event_loop::Event>) {
        self.node.on_ready(event);
    }

    /// Reports readiness without consuming the result; mirrors
    /// `PromiseNode::poll_ready`.
    pub(crate) fn poll_ready(&self) -> bool {
        self.node.poll_ready()
    }

    /// Extracts the result; mirrors `PromiseNode::get` (panics if called
    /// before `poll_ready()`, or a second time).
    pub(crate) fn get(&self) -> Result<T> {
        self.node.get()
    }

    /// An immediately-resolved promise.
    #[must_use]
    pub fn ready(value: T) -> Self {
        Self::from_result(Ok(value))
    }

    /// An immediately-resolved-or-failed promise.
    #[must_use]
    pub fn from_result(result: Result<T>) -> Self {
        Promise::from_node(Box::new(ImmediateNode::new(result)))
    }

    /// A promise that never resolves. Combined with e.g. `exclusive_join`
    /// to express "run until cancelled."
    #[must_use]
    pub fn never_done() -> Self {
        Promise::from_node(Box::new(NeverNode::new()))
    }

    /// Chains a continuation that runs when this promise resolves
    /// successfully; failures propagate unchanged.
    #[must_use]
    pub fn then<U: 'static>(self, f: impl FnOnce(T) -> U + 'static) -> Promise<U> {
        self.then_else(|v| ThenOutcome::Value(Ok(f(v))), |e| ThenOutcome::Value(Err(e)))
    }

    /// Chains a continuation that itself returns another promise, adopting
    /// it directly (chain collapsing, §4.1.2) rather than nesting.
    #[must_use]
    pub fn then_promise<U: 'static>(self, f: impl FnOnce(T) -> Promise<U> + 'static) -> Promise<U> {
        self.then_else(
            |v| ThenOutcome::Chain(f(v).node),
            |e| ThenOutcome::Value(Err(e)),
        )
    }

    /// Full `then`/`catch` pair: `ok` runs on success, `err` runs on
    /// failure; each may itself return a chained promise.
    #[must_use]
    pub fn then_else<U: 'static>(
        self,
        ok: impl FnOnce(T) -> ThenOutcome<U> + 'static,
        err: impl FnOnce(Exception) -> ThenOutcome<U> + 'static,
    ) -> Promise<U> {
        let func: Box<dyn FnOnce(Result<T>) -> ThenOutcome<U>> = Box::new(move |r| match r {
            Ok(v) => ok(v),
            Err(e) => err(e),
        });
        Promise::from_node(Box::new(ThenNode::new(self.node, func)))
    }

    /// Recovers from a failure, producing a value of the same type.
    #[must_use]
    pub fn catch_(self, f: impl FnOnce(Exception) -> T + 'static) -> Promise<T> {
        self.then_else(ThenOutcome::Value, move |e| ThenOutcome::Value(Ok(f(e))))
    }

    /// Discards the success value, keeping only the exception channel.
    #[must_use]
    pub fn ignore_result(self) -> Promise<()> {
        Promise::from_node(Box::new(IgnoreResultNode::new(self.node)))
    }

    /// Binds `resource`'s lifetime to this promise: it is dropped exactly
    /// when the returned promise's node is destroyed.
    #[must_use]
    pub fn attach<D: 'static>(self, resource: D) -> Promise<T> {
        Promise::from_node(Box::new(AttachNode::new(self.node, resource)))
    }

    /// Forces evaluation to proceed even without a waiter. Without this, a
    /// promise nobody `wait`s or `fork`s is never driven to completion.
    #[must_use]
    pub fn eagerly_evaluate(self) -> Promise<T> {
        Promise::from_node(Box::new(EagerNode::new(self.node)))
    }

    /// Resolves with whichever of `self`/`other` completes first,
    /// destroying the other.
    #[must_use]
    pub fn exclusive_join(self, other: Promise<T>) -> Promise<T> {
        Promise::from_node(Box::new(ExclusiveJoinNode::new(self.node, other.node)))
    }

    /// Fans this promise out into a [`ForkHub`], whose branches each
    /// observe a clone of the resolved value. Cancelling all branches
    /// cancels the upstream; cancelling one does not affect the others.
    #[must_use]
    pub fn fork(self) -> ForkHub<T>
    where
        T: Clone,
    {
        ForkHub { hub: ForkHubState::new(self.node) }
    }

    /// Blocks the current thread, pumping `scope`'s loop, until this
    /// promise resolves, then returns (or re-raises) its result.
    ///
    /// # Panics
    ///
    /// Panics if `scope` is not for the loop currently bound to this
    /// thread.
    pub fn wait(mut self, scope: &WaitScope) -> Result<T> {
        struct RootEvent {
            done: std::cell::Cell<bool>,
        }
        impl crate::event_loop::Event for RootEvent {
            fn fire(self: Rc<Self>) {
                self.done.set(true);
            }
        }

        let root = Rc::new(RootEvent { done: std::cell::Cell::new(false) });
        let weak: std::rc::Weak<dyn crate::event_loop::Event> = Rc::downgrade(&root) as _;
        self.node.on_ready(weak);

        loop {
            if self.node.poll_ready() {
                return self.node.get();
            }
            if !scope.event_loop().turn() {
                scope.event_loop().wait_on_port();
            }
        }
    }

    /// Drives this promise to completion using `lp` directly, without a
    /// `WaitScope` — used by the executor to run a promise returned from an
    /// `execute_sync_promise` closure on the target loop's own thread.
    pub(crate) fn drive_to_completion(self, lp: &crate::event_loop::LoopInner) -> Result<T> {
        loop {
            if self.node.poll_ready() {
                return self.node.get();
            }
            if !lp.turn() {
                lp.wait_on_port();
            }
        }
    }

    /// Reports whether this promise has resolved, without consuming its
    /// result. Used by the loop to prune completed `detach`ed promises.
    pub(crate) fn poll_detached(&self) -> bool {
        self.node.poll_ready()
    }

    /// Pumps `scope`'s loop without blocking and reports whether this
    /// promise is now ready, without consuming its result.
    pub fn poll(&mut self, scope: &WaitScope) -> bool {
        if self.node.poll_ready() {
            return true;
        }
        scope.event_loop().poll(1);
        self.node.poll_ready()
    }

    /// Fire-and-forget: the promise is driven to completion by the loop
    /// even though nothing holds its handle; failures go to
    /// `error_handler`.
    ///
    /// If the current thread's loop has already exited, `error_handler` is
    /// invoked immediately with [`crate::error::ErrorKind::Disconnected`].
    pub fn detach(self, error_handler: impl FnOnce(Exception) + 'static) {
        if _current_thread_executor_exists() {
            let wrapped = self
                .ignore_result()
                .then_else(
                    |()| ThenOutcome::Value(Ok(())),
                    move |e| {
                        error_handler(e);
                        ThenOutcome::Value(Ok(()))
                    },
                )
                .eagerly_evaluate();
            crate::event_loop::with_current_loop(|lp| lp.retain_detached(wrapped));
        } else {
            error_handler(Exception::disconnected("detach() called after the event loop exited"));
        }
    }

    /// Appends human-readable frames describing this promise's pending
    /// chain, most recently composed adapter first.
    #[must_use]
    pub fn trace(&self) -> Vec<&'static str> {
        let mut frames = Vec::new();
        self.node.trace(&mut frames);
        frames
    }
}

fn _current_thread_executor_exists() -> bool {
    crate::event_loop::with_current_loop(|_| ()).is_some()
}

/// Schedules `f` to run at the end of the current turn.
pub fn eval_later_promise<T: 'static>(f: impl FnOnce() -> T + 'static) -> Promise<T> {
    Promise::from_node(eval_later(move || Ok(f())))
}

/// Like [`eval_later_promise`], but defers to the "evalLast" tier: it runs
/// only once the ordinary run queue is empty.
pub fn eval_last_promise<T: 'static>(f: impl FnOnce() -> T + 'static) -> Promise<T> {
    Promise::from_node(eval_last(move || Ok(f())))
}

/// Resolves on a later turn without doing any work: a scheduling point
/// that lets other armed events run first.
#[must_use]
pub fn yield_() -> Promise<()> {
    Promise::from_node(yield_now())
}

/// A multi-branch fan-out of one upstream promise. Each
/// [`add_branch`](Self::add_branch) call returns a new `Promise<T>`
/// resolving with a clone of the shared value.
pub struct ForkHub<T: Clone> {
    hub: Rc<ForkHubState<T>>,
}

impl<T: Clone + 'static> ForkHub<T> {
    #[must_use]
    pub fn add_branch(&self) -> Promise<T> {
        Promise::from_node(Box::new(BranchNode::new(self.hub.clone())))
    }
}

/// Resolves when all of `promises` have resolved, in the order given. If
/// any input fails, the joined promise fails only after every input has
/// completed (the first failure's exception wins; later ones are logged).
#[must_use]
pub fn join_promises<T: 'static>(promises: Vec<Promise<T>>) -> Promise<Vec<T>> {
    let children = promises.into_iter().map(|p| p.node).collect();
    Promise::from_node(Box::new(JoinNode::join(children)))
}

/// Like [`join_promises`], but rejects as soon as any input fails,
/// destroying the remaining (not-yet-resolved) inputs.
#[must_use]
pub fn join_promises_fail_fast<T: 'static>(promises: Vec<Promise<T>>) -> Promise<Vec<T>> {
    let children = promises.into_iter().map(|p| p.node).collect();
    Promise::from_node(Box::new(JoinNode::join_fail_fast(children)))
}

/// Resolves with the first input to succeed; fails only if every input
/// fails, carrying the last exception observed.
#[must_use]
pub fn race_successful<T: 'static>(promises: Vec<Promise<T>>) -> Promise<T> {
    let children = promises.into_iter().map(|p| p.node).collect();
    Promise::from_node(Box::new(RaceNode::new(children)))
}
