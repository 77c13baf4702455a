// Copyright 2025. The zc-rt authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A one-shot initializer whose failure is sticky: unlike `std::sync::Once`,
//! a failing initializer here is remembered and re-thrown to every later
//! caller until [`Once::reset`] is called.

use crate::error::{Exception, Result};
use std::sync::{Condvar, Mutex};
use std::thread::{self, ThreadId};

enum State {
    Uninit,
    Running(ThreadId),
    Done,
    Failed(Exception),
}

/// Runs an initializer exactly once, caching either its success or its
/// failure. A second caller arriving while the first is still running
/// blocks until it finishes, then observes the same outcome.
pub struct Once {
    state: Mutex<State>,
    condvar: Condvar,
}

impl Once {
    #[must_use]
    pub fn new() -> Self {
        Once {
            state: Mutex::new(State::Uninit),
            condvar: Condvar::new(),
        }
    }

    /// Runs `init` the first time this is called (or the first time after a
    /// [`reset`](Self::reset)); later callers see the cached result without
    /// re-running `init`.
    ///
    /// # Errors
    ///
    /// Returns whatever `init` returned the first time it ran, including a
    /// cached failure on every subsequent call.
    ///
    /// # Panics
    ///
    /// Panics if called reentrantly from within `init` itself, on the same
    /// thread. A *different* thread arriving while `init` is running just
    /// blocks until it finishes, per the struct doc above.
    pub fn call_once(&self, init: impl FnOnce() -> Result<()>) -> Result<()> {
        let mut guard = self.state.lock().unwrap();
        loop {
            match &*guard {
                State::Done => return Ok(()),
                State::Failed(e) => return Err(e.clone()),
                State::Running(owner) => {
                    if *owner == thread::current().id() {
                        panic!("Once::call_once called reentrantly");
                    }
                    guard = self.condvar.wait(guard).unwrap();
                    continue;
                }
                State::Uninit => break,
            }
        }
        *guard = State::Running(thread::current().id());
        drop(guard);

        let result = init();

        let mut guard = self.state.lock().unwrap();
        *guard = match &result {
            Ok(()) => State::Done,
            Err(e) => State::Failed(e.clone()),
        };
        drop(guard);
        self.condvar.notify_all();
        result
    }

    /// Forgets any cached outcome, so the next [`call_once`](Self::call_once)
    /// runs `init` again. Not part of the original zc `Once` — added so
    /// long-lived test fixtures can re-arm a fallible one-time setup without
    /// constructing a new `Once`.
    pub fn reset(&self) {
        *self.state.lock().unwrap() = State::Uninit;
    }
}

impl Default for Once {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn runs_init_exactly_once() {
        let once = Once::new();
        let calls = AtomicUsize::new(0);
        for _ in 0..5 {
            once.call_once(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_caller_blocks_until_first_finishes() {
        use std::sync::Arc;
        use std::thread;
        use std::time::Duration;

        let once = Arc::new(Once::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let once2 = once.clone();
        let calls2 = calls.clone();
        let first = thread::spawn(move || {
            once2
                .call_once(|| {
                    thread::sleep(Duration::from_millis(50));
                    calls2.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .unwrap();
        });

        // give the first caller a head start so it's observed in `Running`
        thread::sleep(Duration::from_millis(10));
        once.call_once(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();

        first.join().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1, "init must run exactly once, not panic on the second caller");
    }

    #[test]
    #[should_panic(expected = "reentrantly")]
    fn same_thread_reentrant_call_still_panics() {
        let once = Once::new();
        once.call_once(|| once.call_once(|| Ok(()))).unwrap();
    }

    #[test]
    fn failure_is_sticky_until_reset() {
        let once = Once::new();
        let calls = AtomicUsize::new(0);
        let run = || {
            once.call_once(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Exception::failed("nope"))
            })
        };
        assert!(run().is_err());
        assert!(run().is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        once.reset();
        assert!(run().is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
