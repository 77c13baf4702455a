// Copyright 2025. The zc-rt authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The low-level mutex/condition-variable substrate: exclusive and shared
//! locking with timeouts, and predicate-based `wait`/`when`.

mod mutex;
mod once;

pub use mutex::{ContentionWarning, LockMode, Locked, Mutex, MutexGuarded, Timeout};
pub use once::Once;
