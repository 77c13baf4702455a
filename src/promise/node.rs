// Copyright 2025. The zc-rt authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The `PromiseNode<T>` graph: leaf and adapter node implementations. Every
//! node that must itself watch a child (and thus be armed when that child
//! resolves) is built as `Rc<NodeImpl>`, with `PromiseNode<T>` implemented
//! on the `Rc` so the same allocation serves as both the outward-facing
//! node and the inward-facing [`Event`].

use crate::error::{Exception, Result};
use crate::event_loop::Event;
use std::cell::{Cell, RefCell};
use std::marker::PhantomData;
use std::rc::{Rc, Weak};

/// One computation step: `on_ready` registers the consumer, `get` moves the
/// result out exactly once, `trace` appends debugging frames.
pub(crate) trait PromiseNode<T> {
    fn on_ready(&self, event: Weak<dyn Event>);
    fn poll_ready(&self) -> bool;
    fn get(&self) -> Result<T>;
    fn trace(&self, frames: &mut Vec<&'static str>);
}

/// Arms `event` now if it is still alive. Used both for the "already
/// resolved at registration time" breadth-first case and, via
/// [`ReadySlot::fulfill`], for the depth-first case of a node resolving
/// while something is already watching it.
pub(crate) fn arm_now(event: Weak<dyn Event>, depth_first: bool) {
    if let Some(ev) = event.upgrade() {
        crate::event_loop::with_current_loop(|lp| lp.arm(ev, depth_first));
    }
}

/// Shared plumbing for every node that produces exactly one `Result<T>`:
/// holds the result once known and the (at most one) consumer watching it.
pub(crate) struct ReadySlot<T> {
    result: RefCell<Option<Result<T>>>,
    parent: RefCell<Option<Weak<dyn Event>>>,
}

impl<T> ReadySlot<T> {
    pub(crate) fn new() -> Self {
        ReadySlot { result: RefCell::new(None), parent: RefCell::new(None) }
    }

    pub(crate) fn pre_filled(result: Result<T>) -> Self {
        ReadySlot { result: RefCell::new(Some(result)), parent: RefCell::new(None) }
    }

    pub(crate) fn on_ready(&self, event: Weak<dyn Event>) {
        if self.result.borrow().is_some() {
            arm_now(event, false);
        } else {
            *self.parent.borrow_mut() = Some(event);
        }
    }

    pub(crate) fn poll_ready(&self) -> bool {
        self.result.borrow().is_some()
    }

    pub(crate) fn get(&self) -> Result<T> {
        self.result.borrow_mut().take().expect("PromiseNode::get called twice")
    }

    /// Sets the result and, if a consumer is already registered, arms it
    /// depth-first (§5 ordering: resolution while something is watching).
    pub(crate) fn fulfill(&self, result: Result<T>) {
        *self.result.borrow_mut() = Some(result);
        if let Some(parent) = self.parent.borrow_mut().take() {
            arm_now(parent, true);
        }
    }
}

// === leaves ===

pub(crate) struct ImmediateNode<T> {
    slot: ReadySlot<T>,
}

impl<T> ImmediateNode<T> {
    pub(crate) fn new(result: Result<T>) -> Self {
        ImmediateNode { slot: ReadySlot::pre_filled(result) }
    }
}

impl<T> PromiseNode<T> for ImmediateNode<T> {
    fn on_ready(&self, event: Weak<dyn Event>) {
        self.slot.on_ready(event);
    }
    fn poll_ready(&self) -> bool {
        self.slot.poll_ready()
    }
    fn get(&self) -> Result<T> {
        self.slot.get()
    }
    fn trace(&self, _frames: &mut Vec<&'static str>) {}
}

pub(crate) struct NeverNode<T>(PhantomData<T>);

impl<T> NeverNode<T> {
    pub(crate) fn new() -> Self {
        NeverNode(PhantomData)
    }
}

impl<T> PromiseNode<T> for NeverNode<T> {
    fn on_ready(&self, _event: Weak<dyn Event>) {}
    fn poll_ready(&self) -> bool {
        false
    }
    fn get(&self) -> Result<T> {
        unreachable!("NeverNode::get: NEVER_DONE never resolves")
    }
    fn trace(&self, frames: &mut Vec<&'static str>) {
        frames.push("<never done>");
    }
}

// === then / catch ===

/// What a `.then()` continuation produced: either the final value, or
/// another promise to chain onto (collapsed into this node rather than
/// nested, per §4.1.2).
pub(crate) enum ThenOutcome<U> {
    Value(Result<U>),
    Chain(Box<dyn PromiseNode<U>>),
}

pub(crate) struct ThenNode<T, U> {
    slot: ReadySlot<U>,
    child: RefCell<Option<Box<dyn PromiseNode<T>>>>,
    func: RefCell<Option<Box<dyn FnOnce(Result<T>) -> ThenOutcome<U>>>>,
    watching: Cell<bool>,
}

impl<T: 'static, U: 'static> ThenNode<T, U> {
    pub(crate) fn new(
        child: Box<dyn PromiseNode<T>>,
        func: Box<dyn FnOnce(Result<T>) -> ThenOutcome<U>>,
    ) -> Rc<Self> {
        Rc::new(ThenNode {
            slot: ReadySlot::new(),
            child: RefCell::new(Some(child)),
            func: RefCell::new(Some(func)),
            watching: Cell::new(false),
        })
    }
}

impl<T: 'static, U: 'static> Event for ThenNode<T, U> {
    fn fire(self: Rc<Self>) {
        let Some(child) = self.child.borrow_mut().take() else {
            return;
        };
        let input = child.get();
        let func = self.func.borrow_mut().take().expect("ThenNode fired twice");
        match func(input) {
            ThenOutcome::Value(result) => self.slot.fulfill(result),
            ThenOutcome::Chain(inner) => {
                if inner.poll_ready() {
                    self.slot.fulfill(inner.get());
                } else {
                    let weak_self: Weak<dyn Event> = Rc::downgrade(&self) as _;
                    inner.on_ready(weak_self);
                    *self.child.borrow_mut() = Some(inner);
                    *self.func.borrow_mut() = Some(Box::new(ThenOutcome::Value));
                }
            }
        }
    }
}

impl<T: 'static, U: 'static> PromiseNode<U> for Rc<ThenNode<T, U>> {
    fn on_ready(&self, event: Weak<dyn Event>) {
        self.slot.on_ready(event);
        if !self.slot.poll_ready() && !self.watching.replace(true) {
            if let Some(child) = self.child.borrow().as_ref() {
                let weak_self: Weak<dyn Event> = Rc::downgrade(self) as _;
                child.on_ready(weak_self);
            }
        }
    }
    fn poll_ready(&self) -> bool {
        self.slot.poll_ready()
    }
    fn get(&self) -> Result<U> {
        self.slot.get()
    }
    fn trace(&self, frames: &mut Vec<&'static str>) {
        frames.push("then");
        if let Some(child) = self.child.borrow().as_ref() {
            child.trace(frames);
        }
    }
}

// === ignore_result ===

pub(crate) struct IgnoreResultNode<T> {
    child: Box<dyn PromiseNode<T>>,
}

impl<T: 'static> IgnoreResultNode<T> {
    pub(crate) fn new(child: Box<dyn PromiseNode<T>>) -> Self {
        IgnoreResultNode { child }
    }
}

impl<T> PromiseNode<()> for IgnoreResultNode<T> {
    fn on_ready(&self, event: Weak<dyn Event>) {
        self.child.on_ready(event);
    }
    fn poll_ready(&self) -> bool {
        self.child.poll_ready()
    }
    fn get(&self) -> Result<()> {
        self.child.get().map(|_| ())
    }
    fn trace(&self, frames: &mut Vec<&'static str>) {
        frames.push("ignore_result");
        self.child.trace(frames);
    }
}

// === attach ===

pub(crate) struct AttachNode<T, D> {
    child: Box<dyn PromiseNode<T>>,
    _resource: D,
}

impl<T: 'static, D> AttachNode<T, D> {
    pub(crate) fn new(child: Box<dyn PromiseNode<T>>, resource: D) -> Self {
        AttachNode { child, _resource: resource }
    }
}

impl<T, D> PromiseNode<T> for AttachNode<T, D> {
    fn on_ready(&self, event: Weak<dyn Event>) {
        self.child.on_ready(event);
    }
    fn poll_ready(&self) -> bool {
        self.child.poll_ready()
    }
    fn get(&self) -> Result<T> {
        self.child.get()
    }
    fn trace(&self, frames: &mut Vec<&'static str>) {
        frames.push("attach");
        self.child.trace(frames);
    }
}

// === exclusive_join ===

struct JoinSide<T> {
    hub: Rc<ExclusiveJoinNode<T>>,
    is_a: bool,
}

impl<T: 'static> Event for JoinSide<T> {
    fn fire(self: Rc<Self>) {
        self.hub.clone().side_resolved(self.is_a);
    }
}

pub(crate) struct ExclusiveJoinNode<T> {
    slot: ReadySlot<T>,
    a: RefCell<Option<Box<dyn PromiseNode<T>>>>,
    b: RefCell<Option<Box<dyn PromiseNode<T>>>>,
    watchers: RefCell<Vec<Rc<JoinSide<T>>>>,
}

impl<T: 'static> ExclusiveJoinNode<T> {
    pub(crate) fn new(a: Box<dyn PromiseNode<T>>, b: Box<dyn PromiseNode<T>>) -> Rc<Self> {
        let hub = Rc::new(ExclusiveJoinNode {
            slot: ReadySlot::new(),
            a: RefCell::new(Some(a)),
            b: RefCell::new(Some(b)),
            watchers: RefCell::new(Vec::new()),
        });
        for is_a in [true, false] {
            let watcher = Rc::new(JoinSide { hub: hub.clone(), is_a });
            let weak: Weak<dyn Event> = Rc::downgrade(&watcher) as _;
            hub.watchers.borrow_mut().push(watcher);
            let side = if is_a { &hub.a } else { &hub.b };
            if let Some(node) = side.borrow().as_ref() {
                node.on_ready(weak);
            }
        }
        hub
    }

    fn side_resolved(self: Rc<Self>, is_a: bool) {
        if self.slot.poll_ready() {
            return;
        }
        let winner = if is_a { self.a.borrow_mut().take() } else { self.b.borrow_mut().take() };
        let Some(winner) = winner else { return };
        self.slot.fulfill(winner.get());
        self.a.borrow_mut().take();
        self.b.borrow_mut().take();
    }
}

impl<T: 'static> PromiseNode<T> for Rc<ExclusiveJoinNode<T>> {
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
        frames.push("exclusive_join");
    }
}

// === join_promises (fail-late) and join_promises_fail_fast ===

struct JoinChildWatcher<T> {
    hub: Rc<JoinNode<T>>,
    index: usize,
    fail_fast: bool,
}

impl<T: 'static> Event for JoinChildWatcher<T> {
    fn fire(self: Rc<Self>) {
        self.hub.clone().child_resolved(self.index, self.fail_fast);
    }
}

pub(crate) struct JoinNode<T> {
    slot: ReadySlot<Vec<T>>,
    children: RefCell<Vec<Option<Box<dyn PromiseNode<T>>>>>,
    results: RefCell<Vec<Option<Result<T>>>>,
    remaining: Cell<usize>,
    first_error: RefCell<Option<Exception>>,
    watchers: RefCell<Vec<Rc<JoinChildWatcher<T>>>>,
}

impl<T: 'static> JoinNode<T> {
    fn new_with(children: Vec<Box<dyn PromiseNode<T>>>, fail_fast: bool) -> Rc<Self> {
        let n = children.len();
        let hub = Rc::new(JoinNode {
            slot: ReadySlot::new(),
            children: RefCell::new(children.into_iter().map(Some).collect()),
            results: RefCell::new((0..n).map(|_| None).collect()),
            remaining: Cell::new(n),
            first_error: RefCell::new(None),
            watchers: RefCell::new(Vec::with_capacity(n)),
        });
        if n == 0 {
            hub.slot.fulfill(Ok(Vec::new()));
            return hub;
        }
        for index in 0..n {
            let watcher = Rc::new(JoinChildWatcher { hub: hub.clone(), index, fail_fast });
            let weak: Weak<dyn Event> = Rc::downgrade(&watcher) as _;
            hub.watchers.borrow_mut().push(watcher);
            if let Some(child) = hub.children.borrow()[index].as_ref() {
                child.on_ready(weak);
            }
        }
        hub
    }

    pub(crate) fn join(children: Vec<Box<dyn PromiseNode<T>>>) -> Rc<Self> {
        Self::new_with(children, false)
    }

    pub(crate) fn join_fail_fast(children: Vec<Box<dyn PromiseNode<T>>>) -> Rc<Self> {
        Self::new_with(children, true)
    }

    fn child_resolved(self: Rc<Self>, index: usize, fail_fast: bool) {
        if self.slot.poll_ready() {
            return;
        }
        let Some(child) = self.children.borrow_mut()[index].take() else { return };
        let result = child.get();
        let failed = result.is_err();
        if let Err(e) = &result {
            let mut first_error = self.first_error.borrow_mut();
            if first_error.is_none() {
                *first_error = Some(e.clone());
            } else {
                tracing::warn!(%e, "additional join failure after the first");
            }
        }
        self.results.borrow_mut()[index] = Some(result);
        self.remaining.set(self.remaining.get() - 1);

        if failed && fail_fast {
            let e = self.first_error.borrow_mut().take().unwrap();
            self.children.borrow_mut().iter_mut().for_each(|c| {
                c.take();
            });
            self.slot.fulfill(Err(e));
            return;
        }

        if self.remaining.get() == 0 {
            if let Some(e) = self.first_error.borrow_mut().take() {
                self.slot.fulfill(Err(e));
            } else {
                let values = self
                    .results
                    .borrow_mut()
                    .drain(..)
                    .map(|r| r.expect("all children resolved").expect("no failure recorded"))
                    .collect();
                self.slot.fulfill(Ok(values));
            }
        }
    }
}

impl<T: 'static> PromiseNode<Vec<T>> for Rc<JoinNode<T>> {
    fn on_ready(&self, event: Weak<dyn Event>) {
        self.slot.on_ready(event);
    }
    fn poll_ready(&self) -> bool {
        self.slot.poll_ready()
    }
    fn get(&self) -> Result<Vec<T>> {
        self.slot.get()
    }
    fn trace(&self, frames: &mut Vec<&'static str>) {
        frames.push("join");
    }
}

// === race_successful ===

struct RaceWatcher<T> {
    hub: Rc<RaceNode<T>>,
    index: usize,
}

impl<T: 'static> Event for RaceWatcher<T> {
    fn fire(self: Rc<Self>) {
        self.hub.clone().child_resolved(self.index);
    }
}

pub(crate) struct RaceNode<T> {
    slot: ReadySlot<T>,
    children: RefCell<Vec<Option<Box<dyn PromiseNode<T>>>>>,
    remaining: Cell<usize>,
    last_error: RefCell<Option<Exception>>,
    watchers: RefCell<Vec<Rc<RaceWatcher<T>>>>,
}

impl<T: 'static> RaceNode<T> {
    pub(crate) fn new(children: Vec<Box<dyn PromiseNode<T>>>) -> Rc<Self> {
        let n = children.len();
        let hub = Rc::new(RaceNode {
            slot: ReadySlot::new(),
            children: RefCell::new(children.into_iter().map(Some).collect()),
            remaining: Cell::new(n),
            last_error: RefCell::new(None),
            watchers: RefCell::new(Vec::with_capacity(n)),
        });
        if n == 0 {
            hub.slot.fulfill(Err(Exception::failed("raceSuccessful called with no inputs")));
            return hub;
        }
        for index in 0..n {
            let watcher = Rc::new(RaceWatcher { hub: hub.clone(), index });
            let weak: Weak<dyn Event> = Rc::downgrade(&watcher) as _;
            hub.watchers.borrow_mut().push(watcher);
            if let Some(child) = hub.children.borrow()[index].as_ref() {
                child.on_ready(weak);
            }
        }
        hub
    }

    fn child_resolved(self: Rc<Self>, index: usize) {
        if self.slot.poll_ready() {
            return;
        }
        let Some(child) = self.children.borrow_mut()[index].take() else { return };
        match child.get() {
            Ok(v) => {
                self.children.borrow_mut().iter_mut().for_each(|c| {
                    c.take();
                });
                self.slot.fulfill(Ok(v));
            }
            Err(e) => {
                self.remaining.set(self.remaining.get() - 1);
                *self.last_error.borrow_mut() = Some(e);
                if self.remaining.get() == 0 {
                    self.slot.fulfill(Err(self.last_error.borrow_mut().take().unwrap()));
                }
            }
        }
    }
}

impl<T: 'static> PromiseNode<T> for Rc<RaceNode<T>> {
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
        frames.push("race_successful");
    }
}

// === fork / ForkHub ===

pub(crate) struct ForkHubState<T> {
    upstream: RefCell<Option<Box<dyn PromiseNode<T>>>>,
    result: RefCell<Option<Result<T>>>,
    branches: RefCell<Vec<Weak<dyn Event>>>,
    watching: Cell<bool>,
}

impl<T: Clone + 'static> ForkHubState<T> {
    pub(crate) fn new(upstream: Box<dyn PromiseNode<T>>) -> Rc<Self> {
        Rc::new(ForkHubState {
            upstream: RefCell::new(Some(upstream)),
            result: RefCell::new(None),
            branches: RefCell::new(Vec::new()),
            watching: Cell::new(false),
        })
    }

    pub(crate) fn watch(self: &Rc<Self>, event: Weak<dyn Event>) {
        if self.result.borrow().is_some() {
            arm_now(event, false);
            return;
        }
        self.branches.borrow_mut().push(event);
        if !self.watching.replace(true) {
            let weak_self: Weak<dyn Event> = Rc::downgrade(self) as _;
            if let Some(up) = self.upstream.borrow().as_ref() {
                up.on_ready(weak_self);
            }
        }
    }

    pub(crate) fn ready(&self) -> bool {
        self.result.borrow().is_some()
    }

    pub(crate) fn value(&self) -> Result<T> {
        self.result.borrow().clone().expect("ForkHub branch polled before ready")
    }
}

impl<T: Clone + 'static> Event for ForkHubState<T> {
    fn fire(self: Rc<Self>) {
        let Some(upstream) = self.upstream.borrow_mut().take() else { return };
        *self.result.borrow_mut() = Some(upstream.get());
        for weak in self.branches.borrow_mut().drain(..) {
            arm_now(weak, true);
        }
    }
}

pub(crate) struct BranchNode<T> {
    hub: Rc<ForkHubState<T>>,
}

impl<T: Clone + 'static> BranchNode<T> {
    pub(crate) fn new(hub: Rc<ForkHubState<T>>) -> Self {
        BranchNode { hub }
    }
}

impl<T: Clone + 'static> PromiseNode<T> for BranchNode<T> {
    fn on_ready(&self, event: Weak<dyn Event>) {
        self.hub.watch(event);
    }
    fn poll_ready(&self) -> bool {
        self.hub.ready()
    }
    fn get(&self) -> Result<T> {
        self.hub.value()
    }
    fn trace(&self, frames: &mut Vec<&'static str>) {
        frames.push("fork branch");
    }
}

// === eagerly_evaluate ===

pub(crate) struct EagerNode<T> {
    child: RefCell<Option<Box<dyn PromiseNode<T>>>>,
    slot: ReadySlot<T>,
}

impl<T: 'static> EagerNode<T> {
    pub(crate) fn new(child: Box<dyn PromiseNode<T>>) -> Rc<Self> {
        let node = Rc::new(EagerNode { child: RefCell::new(Some(child)), slot: ReadySlot::new() });
        let weak_self: Weak<dyn Event> = Rc::downgrade(&node) as _;
        if let Some(c) = node.child.borrow().as_ref() {
            c.on_ready(weak_self);
        }
        node
    }
}

impl<T: 'static> Event for EagerNode<T> {
    fn fire(self: Rc<Self>) {
        if let Some(child) = self.child.borrow_mut().take() {
            self.slot.fulfill(child.get());
        }
    }
}

impl<T: 'static> PromiseNode<T> for Rc<EagerNode<T>> {
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
        frames.push("eagerly_evaluate");
    }
}

// === evalLater / evalLast / yield_ ===

pub(crate) struct ThunkNode<T> {
    slot: ReadySlot<T>,
    thunk: RefCell<Option<Box<dyn FnOnce() -> Result<T>>>>,
}

impl<T: 'static> Event for ThunkNode<T> {
    fn fire(self: Rc<Self>) {
        let thunk = self.thunk.borrow_mut().take().expect("ThunkNode fired twice");
        self.slot.fulfill(thunk());
    }
}

impl<T: 'static> PromiseNode<T> for Rc<ThunkNode<T>> {
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
        frames.push("eval_later");
    }
}

fn new_thunk_node<T: 'static>(thunk: impl FnOnce() -> Result<T> + 'static) -> Rc<ThunkNode<T>> {
    Rc::new(ThunkNode { slot: ReadySlot::new(), thunk: RefCell::new(Some(Box::new(thunk))) })
}

/// Schedules `thunk` to run at the end of the current turn (breadth-first,
/// after whatever is already queued).
pub(crate) fn eval_later<T: 'static>(thunk: impl FnOnce() -> Result<T> + 'static) -> Box<dyn PromiseNode<T>> {
    let node = new_thunk_node(thunk);
    let armed: Rc<dyn Event> = node.clone();
    crate::event_loop::with_current_loop(|lp| lp.arm(armed, false))
        .expect("eval_later() called outside a WaitScope");
    Box::new(node)
}

/// Schedules `thunk` to run only once the ordinary run queue is otherwise
/// empty (the "evalLast tier"); it may itself requeue ordinary events,
/// which then all run before the next `eval_last` thunk.
pub(crate) fn eval_last<T: 'static>(thunk: impl FnOnce() -> Result<T> + 'static) -> Box<dyn PromiseNode<T>> {
    let node = new_thunk_node(thunk);
    let armed: Rc<dyn Event> = node.clone();
    crate::event_loop::with_current_loop(|lp| lp.arm_last(armed))
        .expect("eval_last() called outside a WaitScope");
    Box::new(node)
}

/// A no-op scheduling point: resolves on a later turn, giving other armed
/// events a chance to run first.
pub(crate) fn yield_now() -> Box<dyn PromiseNode<()>> {
    eval_later(|| Ok(()))
}
