// Copyright 2025. The zc-rt authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! `TaskSet`: failures reach the error handler, `clear()` is reentrancy-safe
//! from inside that same handler, and dropping the set cancels everything
//! still outstanding.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use zc_rt::{new_promise_and_fulfiller, EventLoop, Exception, NullEventPort, Promise, TaskSet, WaitScope};

#[test]
fn clear_from_within_the_error_handler_drops_remaining_tasks() {
    let loop_ = EventLoop::new(Box::new(NullEventPort::default()));
    let scope = WaitScope::new(&loop_);

    let second_task_ran = Rc::new(Cell::new(false));
    let second_task_ran2 = second_task_ran.clone();

    let errors: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
    let errors2 = errors.clone();

    // `tasks` is populated after the TaskSet so the error handler can reach
    // back into it via a shared handle.
    let tasks: Rc<RefCell<Option<TaskSet>>> = Rc::new(RefCell::new(None));
    let tasks2 = tasks.clone();

    let set = TaskSet::new(move |e: Exception| {
        errors2.borrow_mut().push(e.description().to_string());
        tasks2.borrow().as_ref().unwrap().clear();
    });
    *tasks.borrow_mut() = Some(set);

    let failing = Promise::from_result(Err(Exception::failed("task #1 failed")));
    let (never, fulfiller) = new_promise_and_fulfiller::<()>();
    let lingering = never.then(move |()| second_task_ran2.set(true));

    {
        let guard = tasks.borrow();
        let set = guard.as_ref().unwrap();
        set.add(failing);
        set.add(lingering);
    }

    // Drive the loop until the failing task's continuation has run and the
    // error handler has had a chance to clear() the set.
    while loop_.turn() {}

    assert_eq!(*errors.borrow(), vec!["task #1 failed".to_string()]);
    assert!(tasks.borrow().as_ref().unwrap().is_empty());

    // The never-resolving task was dropped by clear(); fulfilling it now
    // finds nobody listening.
    fulfiller.fulfill(());
    for _ in 0..4 {
        loop_.turn();
    }
    assert!(!second_task_ran.get());
}

#[test]
fn dropping_the_task_set_cancels_outstanding_tasks() {
    let loop_ = EventLoop::new(Box::new(NullEventPort::default()));
    let _scope = WaitScope::new(&loop_);

    let ran = Rc::new(Cell::new(false));
    let ran2 = ran.clone();
    let (never, fulfiller) = new_promise_and_fulfiller::<()>();

    let set = TaskSet::new(|_e: Exception| {});
    set.add(never.then(move |()| ran2.set(true)));
    drop(set);

    fulfiller.fulfill(());
    for _ in 0..4 {
        loop_.turn();
    }
    assert!(!ran.get(), "task continuation must not fire once its TaskSet is gone");
}
