// Copyright 2025. The zc-rt authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Ownership primitives: unique `Own<T>` and the refcounted `Rc<T>`/`Arc<T>`
//! wrappers the promise graph and the cross-thread executor build on.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Unique, move-only ownership of a heap-allocated `T`.
///
/// This is a thin wrapper over `Box<T>`. It exists as its own type (rather
/// than using `Box` directly everywhere) so that `PromiseNode` trees read as
/// what they are — an ownership tree — and so that `Rc::into_own` has a
/// matching return type distinct from a plain, possibly-still-shared `Box`.
pub struct Own<T: ?Sized>(Box<T>);

impl<T> Own<T> {
    pub fn new(value: T) -> Self {
        Own(Box::new(value))
    }
}

impl<T: ?Sized> Deref for Own<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T: ?Sized> DerefMut for Own<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.0
    }
}

/// A single-threaded, non-atomic reference count.
///
/// `Rc<T>` must never cross a thread boundary — unlike `std::rc::Rc` this is
/// enforced at the type level (`Rc` is `!Send`) so that a stray `move` into
/// a spawned fiber or cross-thread closure is a compile error rather than a
/// racy refcount.
pub struct Rc<T> {
    inner: std::rc::Rc<std::cell::RefCell<T>>,
}

impl<T> Rc<T> {
    pub fn new(value: T) -> Self {
        Rc {
            inner: std::rc::Rc::new(std::cell::RefCell::new(value)),
        }
    }

    #[must_use]
    pub fn strong_count(&self) -> usize {
        std::rc::Rc::strong_count(&self.inner)
    }

    pub fn borrow(&self) -> std::cell::Ref<'_, T> {
        self.inner.borrow()
    }

    pub fn borrow_mut(&self) -> std::cell::RefMut<'_, T> {
        self.inner.borrow_mut()
    }

    /// Converts this handle into unique ownership, succeeding only if it is
    /// the last remaining reference.
    ///
    /// # Errors
    ///
    /// Returns `self` back if other `Rc` handles to the same value exist.
    pub fn into_own(self) -> std::result::Result<Own<T>, Self> {
        if std::rc::Rc::strong_count(&self.inner) == 1 {
            let cell = std::rc::Rc::try_unwrap(self.inner)
                .unwrap_or_else(|_| unreachable!("strong_count just checked to be 1"));
            Ok(Own::new(cell.into_inner()))
        } else {
            Err(self)
        }
    }
}

impl<T> Clone for Rc<T> {
    fn clone(&self) -> Self {
        Rc {
            inner: std::rc::Rc::clone(&self.inner),
        }
    }
}

/// An atomically refcounted handle, for state shared across threads (the
/// cross-thread [`Executor`](crate::executor::Executor) and
/// [`XThreadPaf`](crate::paf::XThreadPaf)).
pub struct Arc<T> {
    inner: std::sync::Arc<T>,
}

impl<T> Arc<T> {
    pub fn new(value: T) -> Self {
        Arc {
            inner: std::sync::Arc::new(value),
        }
    }

    #[must_use]
    pub fn strong_count(this: &Self) -> usize {
        std::sync::Arc::strong_count(&this.inner)
    }
}

impl<T> Clone for Arc<T> {
    fn clone(&self) -> Self {
        Arc {
            inner: std::sync::Arc::clone(&self.inner),
        }
    }
}

impl<T> Deref for Arc<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.inner
    }
}

/// Bare, racy counter used internally by collaborators that want manual
/// control over increment/decrement without the `Rc`/`Arc` cell wrapping
/// (e.g. `ForkHub`'s branch count). Not part of the public ownership model.
pub(crate) struct RawCount(AtomicUsize);

impl RawCount {
    pub(crate) const fn new(n: usize) -> Self {
        RawCount(AtomicUsize::new(n))
    }

    pub(crate) fn increment(&self) -> usize {
        self.0.fetch_add(1, Ordering::AcqRel)
    }

    /// Returns the count *after* decrementing.
    pub(crate) fn decrement(&self) -> usize {
        self.0.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub(crate) fn get(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn into_own_succeeds_only_at_last_ref() {
        let rc = Rc::new(42);
        let rc2 = rc.clone();
        let rc = rc.into_own().unwrap_err();
        drop(rc2);
        let owned = rc.into_own().unwrap();
        assert_eq!(*owned, 42);
    }
}
