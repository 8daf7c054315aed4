//! Error types for background buffers
//!
//! A single enum covers every way a pull, a construction or a shutdown can
//! fail. End of sequence is deliberately *not* an error: consumers see it as
//! `Ok(None)` from a pull (or `None` from the iterator), so a drained source is
//! never confused with a broken one.
//!
//! # Error Categories
//!
//! - **Source failures**: `Source`, `Panicked` (raised while pulling the
//!   source, delivered to the consumer exactly once)
//! - **Timing**: `Timeout`, `Empty`
//! - **Lifecycle**: `WorkerLost`, `SpawnFailed`, `CloseFailed`
//! - **Configuration**: `InvalidConfig`, `Unsupported`
//!
//! # Example
//!
//! ```rust
//! use bgbuf_core::{BufError, Operation};
//! use std::time::Duration;
//!
//! let err: BufError<std::io::Error> = BufError::Timeout {
//!     operation: Operation::Get,
//!     after: Duration::from_millis(50),
//! };
//! assert!(err.is_timeout());
//! assert_eq!(err.to_string(), "get timed out after 50ms");
//! ```

use core::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::config::Mode;

/// Result alias used throughout bgbuf.
pub type BufResult<T, E> = Result<T, BufError<E>>;

/// Blocking operation that can be bounded by a timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Consumer dequeue.
    Get,
    /// Worker enqueue, including the wait for queue room.
    Put,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Get => "get",
            Operation::Put => "put",
        };
        f.write_str(name)
    }
}

/// Every failure a background buffer can report.
///
/// `E` is the error type of the source sequence. Variants that do not carry a
/// source error are still generic over `E` so that construction, pulls and
/// shutdown share one result type.
#[derive(Debug, Error)]
pub enum BufError<E> {
    /// Pulling from the source returned an error.
    ///
    /// `trace` is the backtrace captured on the worker at the moment of
    /// failure, whatever `RUST_BACKTRACE` says.
    #[error("source failed: {error}")]
    Source {
        #[source]
        error: E,
        trace: String,
    },

    /// Pulling from the source panicked.
    ///
    /// The worker catches the unwind and reports it like any other pull
    /// failure; the buffer then terminates.
    #[error("source panicked: {message}")]
    Panicked { message: String, trace: String },

    /// A blocking operation did not complete within the configured timeout.
    ///
    /// A `Get` timeout is not terminal: the next pull waits again. A `Put`
    /// timeout means the worker gave up waiting for the consumer and ends
    /// the traversal.
    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: Operation, after: Duration },

    /// Non-blocking pull found nothing queued.
    #[error("relay queue is empty")]
    Empty,

    /// The worker went away without publishing a terminal slot.
    ///
    /// # Causes
    /// - The worker process was killed or exited early
    /// - A frame from the worker process could not be decoded
    #[error("worker lost: {reason}")]
    WorkerLost { reason: String },

    /// Rejected configuration value.
    #[error("invalid configuration `{parameter}`: {reason}")]
    InvalidConfig {
        parameter: &'static str,
        reason: String,
    },

    /// The worker thread or process could not be started.
    #[error("failed to spawn worker: {message}")]
    SpawnFailed { message: String },

    /// The requested execution mode is not available on this platform.
    #[error("{mode} mode is not supported on this platform")]
    Unsupported { mode: Mode },

    /// Shutdown did not complete cleanly.
    #[error("failed to close buffer: {message}")]
    CloseFailed { message: String },
}

impl<E> BufError<E> {
    /// Builds a `Source` failure, capturing a backtrace at the call site.
    pub fn source_failure(error: E) -> Self {
        BufError::Source {
            error,
            trace: capture_trace(),
        }
    }

    /// Builds a `Panicked` failure from an unwind payload.
    pub fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        BufError::Panicked {
            message: panic_message(payload),
            trace: capture_trace(),
        }
    }

    /// Returns true if the failure came out of the source sequence.
    pub fn is_source_failure(&self) -> bool {
        matches!(self, BufError::Source { .. } | BufError::Panicked { .. })
    }

    /// Returns true for `Timeout` failures.
    pub fn is_timeout(&self) -> bool {
        matches!(self, BufError::Timeout { .. })
    }

    /// Returns true if observing this failure ends the traversal.
    ///
    /// `Get` timeouts and `Empty` leave the buffer usable; everything else
    /// is terminal.
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            BufError::Timeout {
                operation: Operation::Get,
                ..
            } | BufError::Empty
        )
    }

    /// Diagnostic trace captured by the worker, if any.
    pub fn trace(&self) -> Option<&str> {
        match self {
            BufError::Source { trace, .. } | BufError::Panicked { trace, .. } => {
                Some(trace.as_str())
            }
            _ => None,
        }
    }

    /// Re-types a failure that carries no source error.
    ///
    /// Returns `Err(self)` for `Source` since its payload cannot be converted.
    pub fn retype<F>(self) -> Result<BufError<F>, Self> {
        Ok(match self {
            BufError::Source { .. } => return Err(self),
            BufError::Panicked { message, trace } => BufError::Panicked { message, trace },
            BufError::Timeout { operation, after } => BufError::Timeout { operation, after },
            BufError::Empty => BufError::Empty,
            BufError::WorkerLost { reason } => BufError::WorkerLost { reason },
            BufError::InvalidConfig { parameter, reason } => {
                BufError::InvalidConfig { parameter, reason }
            }
            BufError::SpawnFailed { message } => BufError::SpawnFailed { message },
            BufError::Unsupported { mode } => BufError::Unsupported { mode },
            BufError::CloseFailed { message } => BufError::CloseFailed { message },
        })
    }
}

// Only reached on the failure path, at most once per traversal.
fn capture_trace() -> String {
    let trace = std::backtrace::Backtrace::force_capture();
    match trace.status() {
        std::backtrace::BacktraceStatus::Captured => trace.to_string(),
        _ => String::new(),
    }
}

/// Extracts the human-readable message from a panic payload.
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error, PartialEq)]
    #[error("bad")]
    struct Bad;

    #[test]
    fn test_source_failure_display_and_chain() {
        let err = BufError::source_failure(Bad);
        assert_eq!(err.to_string(), "source failed: bad");
        assert!(err.is_source_failure());
        assert!(err.is_terminal());
        assert!(std::error::Error::source(&err).is_some());
        assert!(!err.trace().unwrap_or_default().is_empty());
    }

    #[test]
    fn test_get_timeout_is_not_terminal() {
        let err: BufError<Bad> = BufError::Timeout {
            operation: Operation::Get,
            after: Duration::from_secs(1),
        };
        assert!(err.is_timeout());
        assert!(!err.is_terminal());
        assert!(err.trace().is_none());
        assert_eq!(err.to_string(), "get timed out after 1s");

        let err: BufError<Bad> = BufError::Timeout {
            operation: Operation::Put,
            after: Duration::from_millis(50),
        };
        assert!(err.is_timeout());
        assert!(err.is_terminal());
        assert_eq!(err.to_string(), "put timed out after 50ms");
    }

    #[test]
    fn test_panic_failure_carries_trace() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        let err: BufError<Bad> = BufError::from_panic(payload.as_ref());
        assert!(!err.trace().unwrap_or_default().is_empty());
    }

    #[test]
    fn test_panic_message_extraction() {
        let boxed: Box<dyn std::any::Any + Send> = Box::new("static message");
        assert_eq!(panic_message(boxed.as_ref()), "static message");

        let boxed: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(boxed.as_ref()), "owned");

        let boxed: Box<dyn std::any::Any + Send> = Box::new(42_u8);
        assert_eq!(panic_message(boxed.as_ref()), "non-string panic payload");
    }

    #[test]
    fn test_retype() {
        let err: BufError<Bad> = BufError::WorkerLost {
            reason: "gone".to_string(),
        };
        let err: BufError<std::io::Error> = err.retype().unwrap();
        assert!(matches!(err, BufError::WorkerLost { .. }));

        let err = BufError::source_failure(Bad);
        assert!(err.retype::<std::io::Error>().is_err());
    }

    #[test]
    fn test_unsupported_display() {
        let err: BufError<Bad> = BufError::Unsupported {
            mode: Mode::Process,
        };
        assert_eq!(err.to_string(), "process mode is not supported on this platform");
    }
}
