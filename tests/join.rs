// Copyright 2025. The zc-rt authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! `join_promises` (wait-for-all, first failure wins) vs
//! `join_promises_fail_fast` (reject as soon as one input fails, dropping
//! the rest).

use zc_rt::{join_promises, join_promises_fail_fast, new_promise_and_fulfiller, EventLoop, NullEventPort, WaitScope};

#[test]
fn join_waits_for_all_inputs_even_after_a_failure() {
    let loop_ = EventLoop::new(Box::new(NullEventPort::default()));
    let scope = WaitScope::new(&loop_);

    let (p0, f0) = new_promise_and_fulfiller::<u32>();
    let (p1, f1) = new_promise_and_fulfiller::<u32>();
    let (p2, f2) = new_promise_and_fulfiller::<u32>();
    let (p3, f3) = new_promise_and_fulfiller::<u32>();
    let (p4, f4) = new_promise_and_fulfiller::<u32>();

    let mut joined = join_promises(vec![p0, p1, p2, p3, p4]).eagerly_evaluate();

    f0.fulfill(0);
    assert!(!joined.poll(&scope));
    f1.fulfill(1);
    assert!(!joined.poll(&scope));
    f2.reject(zc_rt::Exception::failed("input #2 failed"));
    // Still not resolved: two inputs (#3, #4) haven't completed yet.
    assert!(!joined.poll(&scope));
    f3.fulfill(3);
    assert!(!joined.poll(&scope));
    f4.fulfill(4);

    assert!(joined.poll(&scope));
    let err = joined.wait(&scope).unwrap_err();
    assert_eq!(err.description(), "input #2 failed");
}

#[test]
fn join_fail_fast_drops_remaining_inputs_on_first_failure() {
    let loop_ = EventLoop::new(Box::new(NullEventPort::default()));
    let scope = WaitScope::new(&loop_);

    let (p0, f0) = new_promise_and_fulfiller::<u32>();
    let (p1, f1) = new_promise_and_fulfiller::<u32>();
    let (p2, f2) = new_promise_and_fulfiller::<u32>();

    let mut joined = join_promises_fail_fast(vec![p0, p1, p2]).eagerly_evaluate();

    f0.fulfill(0);
    assert!(!joined.poll(&scope));
    f1.reject(zc_rt::Exception::failed("input #1 failed"));
    assert!(joined.poll(&scope), "fail-fast join resolves as soon as any input fails");

    let err = joined.wait(&scope).unwrap_err();
    assert_eq!(err.description(), "input #1 failed");

    // #2 was dropped along with the join; fulfilling it now is a silent
    // no-op (nothing is listening any more).
    f2.fulfill(2);
}
