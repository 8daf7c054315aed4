//! Bounded relay queue between worker and consumer.
//!
//! The queue is a `crossbeam_channel` channel of [`Slot`]s with room for
//! `capacity` values plus one terminal slot. Two extra pieces sit around it:
//!
//! - **Credits**: the worker takes one credit before every pull and the
//!   consumer hands one back per value it dequeues. A fresh queue holds
//!   `capacity` credits, so values produced but not yet consumed never exceed
//!   `capacity`. In thread mode the credits travel over a second channel; in
//!   process mode they are bytes written back to the worker process. Since
//!   values never fill the spare slot, publishing a terminal slot never
//!   waits on the consumer.
//! - **Re-arm**: the consumer keeps a sender of its own. After it dequeues a
//!   terminal slot it enqueues `End`, so every later pull ends immediately
//!   instead of waiting on a worker that is already gone.

use std::time::Duration;

use bgbuf_core::{BufError, BufResult, Operation, PutError, Slot, SlotSink};
use crossbeam_channel::{
    Receiver, RecvTimeoutError, SendTimeoutError, Sender, TryRecvError, TrySendError,
};

#[cfg(unix)]
use std::os::unix::net::UnixStream;

/// Creates a credited relay for a worker thread.
pub(crate) fn relay<V, E>(
    capacity: usize,
    timeout: Option<Duration>,
) -> (RelaySender<V, E>, RelayReceiver<V, E>) {
    let (tx, rx) = crossbeam_channel::bounded(capacity + 1);
    let (credit_tx, credit_rx) = crossbeam_channel::bounded(capacity);
    for _ in 0..capacity {
        // Cannot fail: the channel was just created with room for all of them.
        let _ = credit_tx.try_send(());
    }

    let sender = RelaySender {
        tx: tx.clone(),
        credits: Some(credit_rx),
        timeout,
    };
    let receiver = RelayReceiver::new(rx, tx, Credits::Channel(credit_tx));
    (sender, receiver)
}

/// Creates a relay whose credits are granted to a worker process.
///
/// The sender half has no flow control of its own; it is fed by the pump
/// thread, and the worker process only produces what its credits allow.
#[cfg(unix)]
pub(crate) fn relay_to_process<V, E>(
    capacity: usize,
    credit_stream: UnixStream,
) -> (RelaySender<V, E>, RelayReceiver<V, E>) {
    let (tx, rx) = crossbeam_channel::bounded(capacity + 1);
    let sender = RelaySender {
        tx: tx.clone(),
        credits: None,
        timeout: None,
    };
    let receiver = RelayReceiver::new(rx, tx, Credits::Socket(credit_stream));
    (sender, receiver)
}

// ============================================================================
// Worker side
// ============================================================================

/// Worker half of the relay queue.
pub(crate) struct RelaySender<V, E> {
    tx: Sender<Slot<V, E>>,
    credits: Option<Receiver<()>>,
    timeout: Option<Duration>,
}

impl<V, E> SlotSink<V, E> for RelaySender<V, E> {
    fn reserve(&mut self) -> Result<(), PutError> {
        let Some(credits) = &self.credits else {
            return Ok(());
        };

        match self.timeout {
            Some(after) => credits.recv_timeout(after).map_err(|e| match e {
                RecvTimeoutError::Timeout => PutError::Timeout(after),
                RecvTimeoutError::Disconnected => PutError::Disconnected,
            }),
            None => credits.recv().map_err(|_| PutError::Disconnected),
        }
    }

    fn put(&mut self, slot: Slot<V, E>) -> Result<(), PutError> {
        match self.timeout {
            Some(after) => self.tx.send_timeout(slot, after).map_err(|e| match e {
                SendTimeoutError::Timeout(_) => PutError::Timeout(after),
                SendTimeoutError::Disconnected(_) => PutError::Disconnected,
            }),
            None => self.tx.send(slot).map_err(|_| PutError::Disconnected),
        }
    }
}

// ============================================================================
// Consumer side
// ============================================================================

/// Where the consumer returns credits.
enum Credits {
    Channel(Sender<()>),
    #[cfg(unix)]
    Socket(UnixStream),
}

impl Credits {
    fn grant(&self) {
        match self {
            Credits::Channel(tx) => {
                // Full means the worker already holds every credit it can use.
                let _ = tx.try_send(());
            }
            #[cfg(unix)]
            Credits::Socket(stream) => {
                if let Err(e) = crate::process::grant_credit(stream) {
                    tracing::trace!("worker process no longer accepts credits: {}", e);
                }
            }
        }
    }

    /// Releases a worker waiting for a credit so it can observe cancellation.
    fn release(&self) {
        match self {
            Credits::Channel(tx) => {
                let _ = tx.try_send(());
            }
            #[cfg(unix)]
            Credits::Socket(stream) => crate::process::hang_up(stream),
        }
    }
}

/// Consumer half of the relay queue.
pub(crate) struct RelayReceiver<V, E> {
    rx: Receiver<Slot<V, E>>,
    rearm: Sender<Slot<V, E>>,
    credits: Credits,
    exhausted: bool,
}

impl<V, E> RelayReceiver<V, E> {
    fn new(rx: Receiver<Slot<V, E>>, rearm: Sender<Slot<V, E>>, credits: Credits) -> Self {
        Self {
            rx,
            rearm,
            credits,
            exhausted: false,
        }
    }

    /// Dequeues one slot, blocking while the queue is empty.
    ///
    /// `timeout` bounds the wait; expiry returns `Timeout` and leaves the
    /// queue untouched.
    pub(crate) fn get(&mut self, timeout: Option<Duration>) -> BufResult<Option<V>, E> {
        let slot = match timeout {
            Some(after) => match self.rx.recv_timeout(after) {
                Ok(slot) => slot,
                Err(RecvTimeoutError::Timeout) => {
                    return Err(BufError::Timeout {
                        operation: Operation::Get,
                        after,
                    })
                }
                // We hold `rearm`, so this cannot happen while `self` lives.
                Err(RecvTimeoutError::Disconnected) => Slot::End,
            },
            None => self.rx.recv().unwrap_or(Slot::End),
        };
        self.deliver(slot)
    }

    /// Dequeues one slot if one is ready.
    pub(crate) fn try_get(&mut self) -> BufResult<Option<V>, E> {
        let slot = match self.rx.try_recv() {
            Ok(slot) => slot,
            Err(TryRecvError::Empty) => return Err(BufError::Empty),
            Err(TryRecvError::Disconnected) => Slot::End,
        };
        self.deliver(slot)
    }

    /// Terminates the traversal on behalf of a worker that can no longer
    /// publish, returning the failure to hand to the consumer.
    pub(crate) fn fail(&mut self, failure: BufError<E>) -> BufResult<Option<V>, E> {
        self.deliver(Slot::Failure(failure))
    }

    /// Ends the traversal on behalf of a worker that stopped without
    /// publishing its own `End`.
    pub(crate) fn end(&mut self) -> BufResult<Option<V>, E> {
        self.deliver(Slot::End)
    }

    fn deliver(&mut self, slot: Slot<V, E>) -> BufResult<Option<V>, E> {
        if slot.is_terminal() {
            self.rearm();
        } else {
            self.credits.grant();
        }
        slot.into_pull()
    }

    /// Puts the poison pill back so the next pull ends immediately.
    fn rearm(&mut self) {
        self.exhausted = true;
        // A slot was just freed and the worker no longer publishes.
        if let Err(e) = self.rearm.try_send(Slot::End) {
            let reason = match e {
                TrySendError::Full(_) => "full",
                TrySendError::Disconnected(_) => "disconnected",
            };
            tracing::warn!(reason, "could not re-arm relay queue with end marker");
        }
    }

    /// Lets a worker blocked on credits observe cancellation.
    pub(crate) fn release_worker(&self) {
        self.credits.release();
    }

    /// Number of slots currently queued.
    pub(crate) fn queued(&self) -> usize {
        self.rx.len()
    }

    /// True once a terminal slot has been delivered.
    pub(crate) fn is_exhausted(&self) -> bool {
        self.exhausted
    }
}
