//! The production loop.
//!
//! A [`Worker`] owns the source sequence and drains it into a [`SlotSink`]:
//! every produced item becomes a `Value` slot, and the loop ends after
//! publishing exactly one terminal slot. It never retries a failed pull and
//! never publishes anything after its terminal slot.
//!
//! The loop is placement-agnostic. `bgbuf-sync` runs it on a thread or in a
//! forked child; [`run_inline`] runs it in the caller's own context, which is
//! handy for testing a source without any concurrency.

use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::error::{BufError, Operation};
use crate::sink::{PutError, SlotSink};
use crate::slot::Slot;

/// How a worker run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// The source was exhausted and `End` was published.
    Exhausted { produced: u64 },
    /// A pull failed (error or panic) and `Failure` was published.
    Failed { produced: u64 },
    /// Cancellation was observed before the next pull.
    Cancelled { produced: u64 },
    /// The consumer went away; nothing more can be published.
    Disconnected { produced: u64 },
    /// Waiting on the sink exceeded its timeout and the worker gave up.
    /// `reported` tells whether the timeout failure reached the sink.
    TimedOut {
        produced: u64,
        after: Duration,
        reported: bool,
    },
}

impl WorkerExit {
    /// Number of values published before the run ended.
    pub fn produced(&self) -> u64 {
        match *self {
            WorkerExit::Exhausted { produced }
            | WorkerExit::Failed { produced }
            | WorkerExit::Cancelled { produced }
            | WorkerExit::Disconnected { produced }
            | WorkerExit::TimedOut { produced, .. } => produced,
        }
    }

    /// Returns true if the run published its own terminal slot.
    pub fn published_terminal(&self) -> bool {
        matches!(
            self,
            WorkerExit::Exhausted { .. }
                | WorkerExit::Failed { .. }
                | WorkerExit::TimedOut { reported: true, .. }
        )
    }
}

/// Drains a source sequence into a sink.
pub struct Worker<I> {
    source: I,
    cancel: CancelToken,
}

impl<I, V, E> Worker<I>
where
    I: Iterator<Item = Result<V, E>>,
{
    /// Creates a worker that owns `source`.
    pub fn new<S>(source: S, cancel: CancelToken) -> Self
    where
        S: IntoIterator<IntoIter = I>,
    {
        Self {
            source: source.into_iter(),
            cancel,
        }
    }

    /// Runs the production loop to completion.
    ///
    /// Before each pull the worker reserves room with the sink, and after it
    /// publishes the slot with a blocking put. Those two calls are the only
    /// places the loop waits besides the source itself.
    pub fn run<S>(mut self, sink: &mut S) -> WorkerExit
    where
        S: SlotSink<V, E>,
    {
        let mut produced = 0_u64;
        tracing::debug!("worker started");

        loop {
            if self.cancel.is_cancelled() {
                return Self::finish_cancelled(sink, produced);
            }

            if let Err(err) = sink.reserve() {
                return Self::abandon(sink, err, produced);
            }

            // Cancellation may be what woke us up from `reserve`.
            if self.cancel.is_cancelled() {
                return Self::finish_cancelled(sink, produced);
            }

            let slot = match self.pull() {
                Ok(Some(value)) => Slot::Value(value),
                Ok(None) => Slot::End,
                Err(failure) => Slot::Failure(failure),
            };
            let terminal = slot.is_terminal();
            let failed = matches!(slot, Slot::Failure(_));

            if let Slot::Failure(failure) = &slot {
                tracing::warn!(produced, "source failed: {}", failure_summary(failure));
            }

            if let Err(err) = sink.put(slot) {
                return Self::abandon(sink, err, produced);
            }

            if terminal {
                tracing::debug!(produced, failed, "worker finished");
                return if failed {
                    WorkerExit::Failed { produced }
                } else {
                    WorkerExit::Exhausted { produced }
                };
            }

            produced += 1;
            tracing::trace!(produced, "value published");
        }
    }

    /// Publishes the `End` that answers a cancellation.
    ///
    /// Sinks keep room for a terminal slot, so the put does not wait on the
    /// consumer. A sink that does block is released by a disconnect or by
    /// its timeout.
    fn finish_cancelled<S>(sink: &mut S, produced: u64) -> WorkerExit
    where
        S: SlotSink<V, E>,
    {
        if let Err(err) = sink.put(Slot::End) {
            tracing::debug!(produced, %err, "could not publish end after cancellation");
        }
        tracing::debug!(produced, "worker cancelled");
        WorkerExit::Cancelled { produced }
    }

    /// Stops the run after the sink refused to wait any longer.
    ///
    /// A timeout is published as the terminal failure when the sink still
    /// takes it, so the consumer learns why the sequence stopped.
    fn abandon<S>(sink: &mut S, err: PutError, produced: u64) -> WorkerExit
    where
        S: SlotSink<V, E>,
    {
        match err {
            PutError::Timeout(after) => {
                tracing::warn!(produced, ?after, "put timed out, worker giving up");
                let failure = BufError::Timeout {
                    operation: Operation::Put,
                    after,
                };
                let reported = match sink.put(Slot::Failure(failure)) {
                    Ok(()) => true,
                    Err(err) => {
                        tracing::debug!(produced, %err, "could not report put timeout");
                        false
                    }
                };
                WorkerExit::TimedOut {
                    produced,
                    after,
                    reported,
                }
            }
            PutError::Disconnected => {
                tracing::debug!(produced, %err, "consumer unavailable, worker exiting");
                WorkerExit::Disconnected { produced }
            }
        }
    }

    /// Pulls the next item, turning errors and panics into failures.
    fn pull(&mut self) -> Result<Option<V>, BufError<E>> {
        match panic::catch_unwind(AssertUnwindSafe(|| self.source.next())) {
            Ok(Some(Ok(value))) => Ok(Some(value)),
            Ok(Some(Err(error))) => Err(BufError::source_failure(error)),
            Ok(None) => Ok(None),
            Err(payload) => Err(BufError::from_panic(payload.as_ref())),
        }
    }
}

// `E` is not required to implement Display here, so only the kind is logged.
fn failure_summary<E>(failure: &BufError<E>) -> &'static str {
    match failure {
        BufError::Source { .. } => "error",
        BufError::Panicked { .. } => "panic",
        _ => "other",
    }
}

/// Runs the production loop in the caller's context and returns every slot
/// it published, in order.
///
/// No thread, no queue bound, no timeout: the sink is a `Vec`. The last slot
/// is always terminal.
///
/// # Example
///
/// ```rust
/// use bgbuf_core::{run_inline, Slot};
///
/// let slots = run_inline(vec![Ok::<_, std::io::Error>(1), Ok(2)]);
/// assert_eq!(slots.len(), 3);
/// assert!(matches!(slots[2], Slot::End));
/// ```
pub fn run_inline<S, V, E>(source: S) -> Vec<Slot<V, E>>
where
    S: IntoIterator<Item = Result<V, E>>,
{
    let mut slots = Vec::new();
    Worker::new(source, CancelToken::new()).run(&mut slots);
    slots
}
