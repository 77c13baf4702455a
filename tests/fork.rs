// Copyright 2025. The zc-rt authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! `ForkHub`: each branch observes the same resolved value, and cancelling
//! one branch does not affect its siblings.

use std::cell::Cell;
use std::rc::Rc;
use zc_rt::{new_promise_and_fulfiller, EventLoop, NullEventPort, Promise, WaitScope};

#[test]
fn branches_each_observe_the_resolved_value() {
    let loop_ = EventLoop::new(Box::new(NullEventPort::default()));
    let scope = WaitScope::new(&loop_);

    let hub = Promise::ready(42u32).fork();
    let a = hub.add_branch();
    let b = hub.add_branch();

    assert_eq!(a.wait(&scope).unwrap(), 42);
    assert_eq!(b.wait(&scope).unwrap(), 42);
}

#[test]
fn cancelling_one_branch_does_not_cancel_the_other() {
    let loop_ = EventLoop::new(Box::new(NullEventPort::default()));
    let scope = WaitScope::new(&loop_);

    let upstream_ran = Rc::new(Cell::new(false));
    let upstream_ran2 = upstream_ran.clone();
    let (promise, fulfiller) = new_promise_and_fulfiller::<u32>();
    let hub = promise
        .then(move |v| {
            upstream_ran2.set(true);
            v
        })
        .fork();

    let a = hub.add_branch();
    let b = hub.add_branch();

    drop(a);
    fulfiller.fulfill(7);

    assert_eq!(b.wait(&scope).unwrap(), 7);
    assert!(upstream_ran.get(), "upstream still ran for the surviving branch");
}
