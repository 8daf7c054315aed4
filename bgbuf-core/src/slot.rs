//! Relay queue slots.

use crate::error::{BufError, BufResult};

/// One element of the relay queue.
///
/// The worker publishes any number of `Value`s followed by exactly one
/// terminal slot (`End` or `Failure`). After the consumer observes a terminal
/// slot it re-enqueues `End`, so every later pull ends immediately.
#[derive(Debug)]
pub enum Slot<V, E> {
    /// An item produced by the source.
    Value(V),
    /// The source is exhausted.
    End,
    /// Pulling from the source failed, or the worker was lost.
    Failure(BufError<E>),
}

impl<V, E> Slot<V, E> {
    /// Returns true for `End` and `Failure`.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Slot::Value(_))
    }

    /// Returns the carried value, if any.
    pub fn value(&self) -> Option<&V> {
        match self {
            Slot::Value(v) => Some(v),
            _ => None,
        }
    }

    /// Converts the slot into what a consumer pull returns.
    ///
    /// `Value(v)` becomes `Ok(Some(v))`, `End` becomes `Ok(None)` and
    /// `Failure(e)` becomes `Err(e)`.
    pub fn into_pull(self) -> BufResult<Option<V>, E> {
        match self {
            Slot::Value(v) => Ok(Some(v)),
            Slot::End => Ok(None),
            Slot::Failure(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_classification() {
        assert!(!Slot::<u8, std::io::Error>::Value(1).is_terminal());
        assert!(Slot::<u8, std::io::Error>::End.is_terminal());
        assert!(Slot::<u8, std::io::Error>::Failure(BufError::Empty).is_terminal());
    }

    #[test]
    fn test_into_pull() {
        assert_eq!(Slot::<u8, std::io::Error>::Value(7).into_pull().unwrap(), Some(7));
        assert_eq!(Slot::<u8, std::io::Error>::End.into_pull().unwrap(), None);

        let failure = Slot::<u8, std::io::Error>::Failure(BufError::WorkerLost {
            reason: "gone".to_string(),
        });
        assert!(matches!(
            failure.into_pull(),
            Err(BufError::WorkerLost { .. })
        ));
    }
}
