// Copyright 2025. The zc-rt authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A single-threaded cooperative async runtime: a promise graph driven by
//! an event loop, with stackless and stackful adapters for ordinary Rust
//! code, a predicate-aware `Mutex`, and a cross-thread `Executor` for
//! talking to other loops.
//!
//! Each `EventLoop` lives on the thread that calls [`WaitScope::new`] for
//! it; everything reachable from a `Promise<T>` is `!Send` by design (it is
//! built on `Rc`), and the only sanctioned way to cross a thread boundary
//! is through [`Executor`]/[`executor::Executor`] or the cross-thread
//! fulfiller in [`paf`].

pub mod clock;
pub mod coroutine;
pub mod error;
pub mod event_loop;
pub mod executor;
pub mod fiber;
pub mod paf;
pub mod promise;
pub mod rc;
pub mod sync;
pub mod task_set;

pub use error::{Exception, ErrorKind, Result};
pub use event_loop::{current_thread_executor, EventLoop, EventPort, MioEventPort, NullEventPort, WaitScope};
pub use executor::Executor;
pub use fiber::{FiberPool, FiberWaitScope};
pub use promise::{
    eval_last_promise, eval_later_promise, join_promises, join_promises_fail_fast,
    new_promise_and_fulfiller, race_successful, yield_, ForkHub, Fulfiller, Promise,
};
pub use rc::{Arc, Own, Rc};
pub use task_set::{Canceler, TaskSet};
