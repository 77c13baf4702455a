// Copyright 2025. The zc-rt authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Stackful fibers: a fiber body blocks on `FiberWaitScope::wait` as if it
//! were a plain synchronous call, without blocking the OS thread running
//! the event loop underneath it.

use zc_rt::{new_promise_and_fulfiller, EventLoop, FiberPool, NullEventPort, WaitScope};

#[test]
fn fiber_round_trip_through_a_waited_promise() {
    let loop_ = EventLoop::new(Box::new(NullEventPort::default()));
    let scope = WaitScope::new(&loop_);

    let pool = FiberPool::new(64 * 1024);
    let (promise, fulfiller) = new_promise_and_fulfiller::<i32>();
    let fiber = pool.start_fiber(move |fiber_scope| fiber_scope.wait(promise).unwrap() + 1);

    fulfiller.fulfill(122);

    assert_eq!(fiber.wait(&scope).unwrap(), 123);
    assert_eq!(pool.high_water_mark(), 1);
}

#[test]
fn fiber_propagates_a_rejected_wait_without_unwinding_the_loop() {
    let loop_ = EventLoop::new(Box::new(NullEventPort::default()));
    let scope = WaitScope::new(&loop_);

    let pool = FiberPool::new(64 * 1024);
    let (promise, fulfiller) = new_promise_and_fulfiller::<i32>();
    let fiber = pool.start_fiber(move |fiber_scope| fiber_scope.wait(promise).map(|v| v + 1));

    drop(fulfiller);

    let err = fiber.wait(&scope).unwrap().unwrap_err();
    assert_eq!(err.kind(), zc_rt::ErrorKind::BrokenPromise);
}

#[test]
fn released_fiber_stack_is_reused() {
    let loop_ = EventLoop::new(Box::new(NullEventPort::default()));
    let scope = WaitScope::new(&loop_);
    let pool = FiberPool::new(64 * 1024);

    let fiber0 = pool.start_fiber(|_scope| 1);
    assert_eq!(fiber0.wait(&scope).unwrap(), 1);
    assert_eq!(pool.stack_allocations(), 1);
    assert_eq!(pool.freelisted_stacks(), 1, "a finished fiber's stack should land in the freelist");

    let fiber1 = pool.start_fiber(|_scope| 2);
    assert_eq!(pool.freelisted_stacks(), 0, "starting a fiber should drain the freelist before allocating");
    assert_eq!(fiber1.wait(&scope).unwrap(), 2);
    assert_eq!(
        pool.stack_allocations(),
        1,
        "second fiber should reuse the freed stack instead of allocating a new one"
    );
}

#[test]
fn reused_stack_gives_a_same_named_local_the_same_address() {
    // Calibration sample for "same-named local variable in two fiber runs
    // shares the same address when reused from the pool" — only meaningful
    // because `start_fiber` above is shown to actually recycle the stack;
    // a sanitizer or a codegen change could perturb this.
    let loop_ = EventLoop::new(Box::new(NullEventPort::default()));
    let scope = WaitScope::new(&loop_);
    let pool = FiberPool::new(64 * 1024);

    let fiber0 = pool.start_fiber(|_scope| {
        let local = 0u8;
        std::ptr::addr_of!(local) as usize
    });
    let addr0 = fiber0.wait(&scope).unwrap();

    let fiber1 = pool.start_fiber(|_scope| {
        let local = 0u8;
        std::ptr::addr_of!(local) as usize
    });
    let addr1 = fiber1.wait(&scope).unwrap();

    assert_eq!(pool.stack_allocations(), 1, "second fiber must reuse the freed stack");
    assert_eq!(addr0, addr1, "a same-named local at the same fiber depth should land at the same stack address when the underlying stack allocation is reused");
}

#[test]
fn high_water_mark_tracks_the_largest_number_of_live_fibers() {
    let loop_ = EventLoop::new(Box::new(NullEventPort::default()));
    let scope = WaitScope::new(&loop_);

    let pool = FiberPool::new(64 * 1024);
    let (p0, f0) = new_promise_and_fulfiller::<i32>();
    let (p1, f1) = new_promise_and_fulfiller::<i32>();

    let fiber0 = pool.start_fiber(move |s| s.wait(p0).unwrap());
    let fiber1 = pool.start_fiber(move |s| s.wait(p1).unwrap());
    assert_eq!(pool.high_water_mark(), 2);

    f0.fulfill(1);
    f1.fulfill(2);
    assert_eq!(fiber0.wait(&scope).unwrap(), 1);
    assert_eq!(fiber1.wait(&scope).unwrap(), 2);
    assert_eq!(pool.high_water_mark(), 2);
}
