//! The seam between the production loop and the relay queue.
//!
//! The worker never knows where its slots go: a bounded channel in thread
//! mode, a framed socket in process mode, or a plain `Vec` when the loop runs
//! inline. Each of those implements [`SlotSink`].

use std::time::Duration;

use thiserror::Error;

use crate::slot::Slot;

/// Why a slot could not be published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PutError {
    /// The consumer side is gone.
    #[error("consumer disconnected")]
    Disconnected,

    /// A blocking put did not complete in time.
    #[error("put timed out after {0:?}")]
    Timeout(Duration),
}

/// Destination for slots published by a worker.
///
/// Besides bounding queued slots, a sink may hand out credits: the worker
/// calls [`reserve`](SlotSink::reserve) before every pull, and the sink only
/// returns once the consumer has room for one more value. That keeps values
/// produced but not yet consumed within the sink's capacity, counting the one
/// the worker is holding.
///
/// A credited sink keeps room for one terminal slot on top of its credits:
/// a worker that ends, fails or gives up can always say so without waiting
/// on the consumer.
pub trait SlotSink<V, E> {
    /// Wait for permission to pull the next item from the source.
    ///
    /// Sinks without flow control return immediately.
    fn reserve(&mut self) -> Result<(), PutError> {
        Ok(())
    }

    /// Publish a slot, blocking while the sink is full.
    ///
    /// Implementations bound the wait by their configured timeout, if any.
    fn put(&mut self, slot: Slot<V, E>) -> Result<(), PutError>;
}

/// Unbounded in-memory sink, used to run the production loop inline.
impl<V, E> SlotSink<V, E> for Vec<Slot<V, E>> {
    fn put(&mut self, slot: Slot<V, E>) -> Result<(), PutError> {
        self.push(slot);
        Ok(())
    }
}
