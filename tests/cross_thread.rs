// Copyright 2025. The zc-rt authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Cross-thread `Executor`: synchronous and async round trips, the
//! disconnect contract, and a three-way cancel cycle that must resolve
//! without deadlocking.

use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use zc_rt::{Executor, EventLoop, NullEventPort, WaitScope};

/// Spawns a thread running its own loop, returns an `Executor` handle for
/// it plus a sender that asks the thread to exit (dropping its `EventLoop`,
/// which disconnects the executor).
fn spawn_target_loop() -> (Executor, mpsc::Sender<()>, thread::JoinHandle<()>) {
    let (exec_tx, exec_rx) = mpsc::channel();
    let (stop_tx, stop_rx) = mpsc::channel::<()>();
    let handle = thread::spawn(move || {
        let loop_ = EventLoop::new(Box::new(NullEventPort::default()));
        let _scope = WaitScope::new(&loop_);
        exec_tx.send(loop_.executor()).unwrap();
        loop {
            loop_.poll(1024);
            if stop_rx.recv_timeout(Duration::from_millis(2)).is_ok() {
                break;
            }
        }
    });
    let executor = exec_rx.recv().unwrap();
    (executor, stop_tx, handle)
}

#[test]
fn execute_sync_round_trips_across_threads() {
    let (executor, stop, handle) = spawn_target_loop();

    let result = executor.execute_sync(|| 2 + 2);
    assert_eq!(result.unwrap(), 4);

    stop.send(()).unwrap();
    handle.join().unwrap();
}

#[test]
fn execute_async_resolves_on_the_submitters_own_loop() {
    let loop_ = EventLoop::new(Box::new(NullEventPort::default()));
    let scope = WaitScope::new(&loop_);
    let (executor, stop, handle) = spawn_target_loop();

    let promise = executor.execute_async(|| 6 * 7);
    assert_eq!(promise.wait(&scope).unwrap(), 42);

    stop.send(()).unwrap();
    handle.join().unwrap();
}

#[test]
fn executor_disconnect_makes_a_pending_wait_fail_with_disconnected() {
    let loop_ = EventLoop::new(Box::new(NullEventPort::default()));
    let scope = WaitScope::new(&loop_);

    let (exec_tx, exec_rx) = mpsc::channel();
    let (go_tx, go_rx) = mpsc::channel::<()>();
    let handle = thread::spawn(move || {
        let loop_b = EventLoop::new(Box::new(NullEventPort::default()));
        let _scope_b = WaitScope::new(&loop_b);
        exec_tx.send(loop_b.executor()).unwrap();
        // Wait until the main thread has queued its never-completing job,
        // then exit without ever draining it.
        go_rx.recv().unwrap();
    });

    let executor_b = exec_rx.recv().unwrap();
    let mut never_done = executor_b.execute_async(|| {
        loop {
            thread::sleep(Duration::from_secs(3600));
        }
    });
    go_tx.send(()).unwrap();
    handle.join().unwrap();

    // `loop_b`'s drop (at the end of the spawned thread) disconnects
    // `executor_b`; the queued job's `on_disconnect` hook rejects the
    // promise with `DISCONNECTED` instead of leaving it to hang.
    while !never_done.poll(&scope) {
        thread::sleep(Duration::from_millis(2));
    }
    let err = never_done.wait(&scope).unwrap_err();
    assert_eq!(err.kind(), zc_rt::ErrorKind::Disconnected);
    assert!(!executor_b.is_live());
}

#[test]
fn three_way_cancel_cycle_resolves_without_deadlock() {
    // driver -> A -> B -> driver: A's job blocks (via `execute_sync`) on B,
    // B's job blocks on driver. Dropping the driver-side promise while A's
    // job is already mid-flight forces driver's `CancelOnDrop::drop` to
    // keep servicing its own loop (otherwise B's nested call into driver
    // would never be answered, A would never finish, and driver's cancel
    // wait would never be acknowledged).
    let loop_driver = EventLoop::new(Box::new(NullEventPort::default()));
    let _scope_driver = WaitScope::new(&loop_driver);
    let executor_driver = loop_driver.executor();

    let (executor_a, stop_a, handle_a) = spawn_target_loop();
    let (executor_b, stop_b, handle_b) = spawn_target_loop();

    let (started_tx, started_rx) = mpsc::channel::<()>();
    let executor_b_for_a = executor_b.clone();
    let executor_driver_for_b = executor_driver.clone();

    let cycle = executor_a.execute_async(move || {
        started_tx.send(()).unwrap();
        executor_b_for_a.execute_sync(move || executor_driver_for_b.execute_sync(|| 42).unwrap())
    });

    // Make sure A's job has actually started (and so will call into B)
    // before we cancel, so the cancel lands on an in-flight job rather
    // than one still sitting in A's queue.
    started_rx.recv().unwrap();
    drop(cycle);

    // Reaching this point at all means the drop above returned rather than
    // deadlocking.
    assert!(!loop_driver.turn());

    stop_a.send(()).unwrap();
    stop_b.send(()).unwrap();
    handle_a.join().unwrap();
    handle_b.join().unwrap();
    assert!(!executor_a.is_live());
    assert!(!executor_b.is_live());
}
