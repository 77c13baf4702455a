// Copyright 2025. The zc-rt authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A pluggable monotonic time source, used by [`Mutex::wait`](crate::sync::Mutex::wait)'s
//! timeout and by the fiber/timer adapters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant as StdInstant};

/// A monotonic timestamp. Opaque outside of subtracting two instants.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct Instant(StdInstant);

impl Instant {
    #[must_use]
    pub fn duration_since(self, earlier: Instant) -> Duration {
        self.0.saturating_duration_since(earlier.0)
    }

    #[must_use]
    pub fn checked_add(self, duration: Duration) -> Option<Instant> {
        self.0.checked_add(duration).map(Instant)
    }
}

/// Supplies monotonic time to timed waits. Implementations MAY distinguish a
/// coarse, cheap `now()` from a precise `now_precise()`; the default
/// `SystemClock` uses the same source for both since `std::time::Instant` is
/// already cheap to sample.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    fn now_precise(&self) -> Instant {
        self.now()
    }
}

/// The default clock: `std::time::Instant`, i.e. the OS's monotonic clock.
#[derive(Default, Debug, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant(StdInstant::now())
    }
}

/// A manually-advanced clock for deterministic timeout tests (spec §8.11,
/// §8.12): rather than sleeping wall-clock milliseconds and asserting a
/// fuzzy bound, tests construct a `MockClock`, hand it to the `Mutex`, and
/// call `advance()` from a driver thread to simulate the passage of time.
#[derive(Clone)]
pub struct MockClock {
    epoch: StdInstant,
    offset_nanos: Arc<AtomicU64>,
    // serializes advance() against itself; `now()` only ever reads the atomic
    _guard: Arc<StdMutex<()>>,
}

impl MockClock {
    #[must_use]
    pub fn new() -> Self {
        MockClock {
            epoch: StdInstant::now(),
            offset_nanos: Arc::new(AtomicU64::new(0)),
            _guard: Arc::new(StdMutex::new(())),
        }
    }

    pub fn advance(&self, by: Duration) {
        let _lock = self._guard.lock().unwrap();
        self.offset_nanos
            .fetch_add(u64::try_from(by.as_nanos()).unwrap_or(u64::MAX), Ordering::AcqRel);
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MockClock {
    fn now(&self) -> Instant {
        let offset = Duration::from_nanos(self.offset_nanos.load(Ordering::Acquire));
        Instant(self.epoch + offset)
    }
}
