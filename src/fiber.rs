// Copyright 2025. The zc-rt authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Stackful fibers: lets code written in ordinary blocking style (a loop
//! calling `scope.wait(promise)`) run cooperatively on the event loop, each
//! `wait` point switching back to the loop's own stack instead of blocking
//! the OS thread (§4.3).
//!
//! Stack switching is `corosensei`, the same crate k23's own `fiber` crate
//! builds on ("heavily based off of corosensei by Amanieu d'Antras") —
//! taken here as a direct dependency rather than re-vendoring per-arch
//! stack-switch assembly.

use crate::error::Result;
use crate::event_loop::Event;
use crate::promise::node::{arm_now, PromiseNode, ReadySlot};
use crate::promise::Promise;
use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::marker::PhantomData;
use std::rc::{Rc, Weak};

/// Stacks released by finished fibers, handed back out by the next
/// `start_fiber` call on the same pool instead of allocating fresh.
type Freelist = Rc<RefCell<Vec<DefaultStack>>>;

type ErasedWait = Box<dyn PromiseNode<Box<dyn Any>>>;
type ErasedResume = Result<Box<dyn Any>>;
type ErasedReturn = Box<dyn Any>;

/// Type-erases a typed `PromiseNode<T>` so it can cross the fiber's
/// suspend/resume boundary, whose `Yield` type is fixed once per
/// `Coroutine`.
struct ErasedNode<T> {
    inner: Box<dyn PromiseNode<T>>,
}

impl<T: 'static> PromiseNode<Box<dyn Any>> for ErasedNode<T> {
    fn on_ready(&self, event: Weak<dyn Event>) {
        self.inner.on_ready(event);
    }
    fn poll_ready(&self) -> bool {
        self.inner.poll_ready()
    }
    fn get(&self) -> Result<Box<dyn Any>> {
        self.inner.get().map(|v| Box::new(v) as Box<dyn Any>)
    }
    fn trace(&self, frames: &mut Vec<&'static str>) {
        self.inner.trace(frames);
    }
}

/// Handle passed into a fiber's body, letting it wait on promises as if
/// blocking, without blocking the underlying OS thread.
pub struct FiberWaitScope<'a> {
    yielder: &'a Yielder<ErasedResume, ErasedWait>,
}

impl FiberWaitScope<'_> {
    /// Suspends the fiber until `promise` resolves, returning (or
    /// re-raising) its result. Only valid from inside the closure passed to
    /// [`FiberPool::start_fiber`].
    pub fn wait<T: 'static>(&self, promise: Promise<T>) -> Result<T> {
        let erased: ErasedWait = Box::new(ErasedNode { inner: promise.into_node() });
        let resumed = self.yielder.suspend(erased);
        resumed.map(|boxed| {
            *boxed
                .downcast::<T>()
                .unwrap_or_else(|_| unreachable!("fiber resume value type mismatch"))
        })
    }
}

struct FiberNode {
    // `Option` so `Drop` can move the finished `Coroutine` out by value and
    // reclaim its stack via `into_stack()` — `RefCell<Coroutine<..>>` alone
    // only ever yields `&mut`, not an owned value to consume.
    coroutine: RefCell<Option<Coroutine<ErasedResume, ErasedWait, ErasedReturn>>>,
    current_wait: RefCell<Option<ErasedWait>>,
    slot: ReadySlot<ErasedReturn>,
    self_weak: RefCell<Weak<FiberNode>>,
    outstanding: Rc<Cell<usize>>,
    freelist: Freelist,
}

impl Drop for FiberNode {
    fn drop(&mut self) {
        self.outstanding.set(self.outstanding.get() - 1);
        if let Some(coroutine) = self.coroutine.borrow_mut().take() {
            if coroutine.done() {
                self.freelist.borrow_mut().push(coroutine.into_stack());
            }
        }
    }
}

impl FiberNode {
    fn drive(self: &Rc<Self>, input: ErasedResume) {
        let result = self.coroutine.borrow_mut().as_mut().expect("fiber driven after completion").resume(input);
        match result {
            CoroutineResult::Yield(wait_node) => {
                let weak = self.self_weak.borrow().clone();
                if wait_node.poll_ready() {
                    *self.current_wait.borrow_mut() = Some(wait_node);
                    arm_now(weak, false);
                } else {
                    wait_node.on_ready(weak);
                    *self.current_wait.borrow_mut() = Some(wait_node);
                }
            }
            CoroutineResult::Return(value) => {
                self.slot.fulfill(Ok(value));
            }
        }
    }
}

impl Event for FiberNode {
    fn fire(self: Rc<Self>) {
        let input = match self.current_wait.borrow_mut().take() {
            Some(wait_node) => wait_node.get(),
            None => Ok(Box::new(()) as Box<dyn Any>),
        };
        self.drive(input);
    }
}

struct FiberPromiseNode<T> {
    inner: Rc<FiberNode>,
    _marker: PhantomData<T>,
}

impl<T: 'static> PromiseNode<T> for FiberPromiseNode<T> {
    fn on_ready(&self, event: Weak<dyn Event>) {
        self.inner.slot.on_ready(event);
    }
    fn poll_ready(&self) -> bool {
        self.inner.slot.poll_ready()
    }
    fn get(&self) -> Result<T> {
        self.inner
            .slot
            .get()
            .map(|boxed| *boxed.downcast::<T>().unwrap_or_else(|_| unreachable!("fiber result type mismatch")))
    }
    fn trace(&self, frames: &mut Vec<&'static str>) {
        frames.push("fiber");
    }
}

/// A configuration for spawning fibers of a given stack size, and a running
/// high-water mark of how many have been live at once.
///
/// Caches released fiber stacks (up to whatever the freelist happens to
/// hold — there is no separate high-water cap on the freelist itself, since
/// it can never exceed the pool's own `high_water_mark`): `start_fiber`
/// reuses a freelisted `corosensei` stack when one is available instead of
/// allocating fresh.
pub struct FiberPool {
    stack_size: usize,
    outstanding: Rc<Cell<usize>>,
    high_water_mark: Cell<usize>,
    freelist: Freelist,
    allocations: Cell<usize>,
}

impl FiberPool {
    #[must_use]
    pub fn new(stack_size: usize) -> Self {
        FiberPool {
            stack_size,
            outstanding: Rc::new(Cell::new(0)),
            high_water_mark: Cell::new(0),
            freelist: Rc::new(RefCell::new(Vec::new())),
            allocations: Cell::new(0),
        }
    }

    /// The largest number of fibers that have been outstanding at once.
    #[must_use]
    pub fn high_water_mark(&self) -> usize {
        self.high_water_mark.get()
    }

    /// How many fresh `corosensei` stacks this pool has ever allocated, as
    /// opposed to handing back out a released one from the freelist.
    /// Test-observable proxy for "did `start_fiber` reuse a stack".
    #[must_use]
    pub fn stack_allocations(&self) -> usize {
        self.allocations.get()
    }

    /// How many released stacks are currently sitting in the freelist,
    /// waiting to be handed back out by a future `start_fiber` call.
    #[must_use]
    pub fn freelisted_stacks(&self) -> usize {
        self.freelist.borrow().len()
    }

    /// Runs `f` on a pooled or freshly allocated stack, returning a promise
    /// resolved with its eventual result. `f` receives a [`FiberWaitScope`]
    /// it can use to wait on other promises without blocking the OS thread.
    ///
    /// # Panics
    ///
    /// Panics if the stack allocation fails (out of memory / address space)
    /// or if `f` panics — the panic propagates out of the *next* call that
    /// drives this fiber, not out of `start_fiber` itself.
    pub fn start_fiber<T: 'static>(&self, f: impl FnOnce(&FiberWaitScope) -> T + 'static) -> Promise<T> {
        let stack = self.freelist.borrow_mut().pop().unwrap_or_else(|| {
            self.allocations.set(self.allocations.get() + 1);
            DefaultStack::new(self.stack_size).expect("failed to allocate fiber stack")
        });
        let coroutine = Coroutine::with_stack(stack, move |yielder, _: ErasedResume| {
            let scope = FiberWaitScope { yielder };
            Box::new(f(&scope)) as ErasedReturn
        });

        self.outstanding.set(self.outstanding.get() + 1);
        self.high_water_mark.set(self.high_water_mark.get().max(self.outstanding.get()));

        let node = Rc::new(FiberNode {
            coroutine: RefCell::new(Some(coroutine)),
            current_wait: RefCell::new(None),
            slot: ReadySlot::new(),
            self_weak: RefCell::new(Weak::new()),
            outstanding: self.outstanding.clone(),
            freelist: self.freelist.clone(),
        });
        *node.self_weak.borrow_mut() = Rc::downgrade(&node);
        node.drive(Ok(Box::new(())));

        Promise::from_node(Box::new(FiberPromiseNode { inner: node, _marker: PhantomData }))
    }
}
