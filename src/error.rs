// Copyright 2025. The zc-rt authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The exception channel carried alongside every resolved value.

use std::backtrace::Backtrace;
use std::fmt;

/// Coarse classification of why a computation failed.
///
/// Callers branch on `ErrorKind` rather than matching error messages; the
/// message text is for humans only.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// Generic application/logic error.
    Failed,
    /// Transient resource exhaustion; the caller may retry.
    Overloaded,
    /// The peer, or the loop the caller was waiting on, is gone.
    Disconnected,
    /// The feature is not implemented.
    Unimplemented,
    /// A promise was cancelled: destroyed before it resolved.
    Canceled,
    /// A fulfiller was dropped without ever fulfilling its promise.
    BrokenPromise,
}

impl ErrorKind {
    fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Failed => "failed",
            ErrorKind::Overloaded => "overloaded",
            ErrorKind::Disconnected => "disconnected",
            ErrorKind::Unimplemented => "unimplemented",
            ErrorKind::Canceled => "canceled",
            ErrorKind::BrokenPromise => "broken promise",
        }
    }
}

/// An exception propagated through a promise chain in place of a value.
///
/// Every `Exception` captures a backtrace at the point it was constructed,
/// not at the point it is eventually observed by `wait()` — by the time a
/// deeply chained promise fails, the originating frame is long gone from the
/// call stack.
pub struct Exception {
    kind: ErrorKind,
    description: String,
    backtrace: Backtrace,
}

impl Exception {
    #[track_caller]
    pub fn new(kind: ErrorKind, description: impl Into<String>) -> Self {
        let description = description.into();
        tracing::debug!(?kind, %description, "exception constructed");
        Exception {
            kind,
            description,
            backtrace: Backtrace::capture(),
        }
    }

    pub fn failed(description: impl Into<String>) -> Self {
        Self::new(ErrorKind::Failed, description)
    }

    pub fn disconnected(description: impl Into<String>) -> Self {
        Self::new(ErrorKind::Disconnected, description)
    }

    pub fn canceled() -> Self {
        Self::new(ErrorKind::Canceled, "operation canceled")
    }

    pub fn broken_promise() -> Self {
        Self::new(
            ErrorKind::BrokenPromise,
            "fulfiller was dropped without fulfilling its promise",
        )
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    #[must_use]
    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }
}

impl fmt::Debug for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exception")
            .field("kind", &self.kind)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.description)
    }
}

impl std::error::Error for Exception {}

impl Clone for Exception {
    fn clone(&self) -> Self {
        // Backtraces aren't Clone; a fresh capture at the clone site is the
        // closest approximation (used by joinPromises, which must hand the
        // same logical failure to multiple branches).
        Exception {
            kind: self.kind,
            description: self.description.clone(),
            backtrace: Backtrace::capture(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Exception>;

/// Retries `f` exactly once if its first attempt fails with
/// [`ErrorKind::Disconnected`]; any other failure, or a second failure, is
/// propagated unchanged.
pub fn retry_on_disconnect<T>(mut f: impl FnMut() -> Result<T>) -> Result<T> {
    match f() {
        Err(e) if e.kind() == ErrorKind::Disconnected => f(),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retries_exactly_once_on_disconnect() {
        let mut attempts = 0;
        let result = retry_on_disconnect(|| {
            attempts += 1;
            if attempts < 3 {
                Err(Exception::disconnected("not yet"))
            } else {
                Ok(attempts)
            }
        });
        // second attempt still fails (attempts == 2), so the error propagates
        assert_eq!(attempts, 2);
        assert!(result.is_err());
    }

    #[test]
    fn does_not_retry_other_kinds() {
        let mut attempts = 0;
        let result: Result<()> = retry_on_disconnect(|| {
            attempts += 1;
            Err(Exception::failed("nope"))
        });
        assert_eq!(attempts, 1);
        assert!(result.is_err());
    }
}
