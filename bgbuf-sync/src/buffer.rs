//! The consumer-facing background buffer.

use std::convert::Infallible;
use std::iter::FusedIterator;
use std::thread;
use std::time::Duration;

use bgbuf_core::{BufError, BufResult, BufferConfig, CancelToken, Mode, Operation, Worker};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::handle::WorkerHandle;
use crate::relay::{self, RelayReceiver};

/// Bound on the join performed when a buffer is dropped without `close()`.
const EMERGENCY_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Prefetches a source sequence on a background worker.
///
/// The worker starts pulling as soon as the buffer is built and stays at
/// most `capacity` values ahead of the consumer. The consumer sees exactly
/// the source's items, in order, then one terminal outcome: end of sequence
/// (`Ok(None)`) or the failure that stopped the source (`Err`). Every pull
/// after that is end of sequence again.
///
/// # Example
///
/// ```rust
/// use bgbuf_sync::BackgroundBuffer;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let mut buffer = BackgroundBuffer::from_values(vec![0, 1, 2], Default::default())?;
///
/// assert_eq!(buffer.pull()?, Some(0));
/// let rest: Vec<u32> = buffer.by_ref().collect::<Result<_, _>>()?;
/// assert_eq!(rest, vec![1, 2]);
/// assert_eq!(buffer.pull()?, None);
/// # Ok(())
/// # }
/// ```
///
/// # Shutdown
///
/// Call [`close`](Self::close) to stop the worker and wait for it. Dropping
/// the buffer does the same with a 5 second bound and logs a warning if the
/// worker does not stop in time.
pub struct BackgroundBuffer<V, E> {
    /// `None` once the buffer has been shut down.
    relay: Option<RelayReceiver<V, E>>,
    worker: WorkerHandle,
    cancel: CancelToken,
    config: BufferConfig,
}

impl<V, E> BackgroundBuffer<V, E>
where
    V: Send + 'static,
    E: Send + 'static,
{
    /// Starts a worker thread over `source` with the given queue capacity
    /// and no timeout.
    ///
    /// # Errors
    ///
    /// - `BufError::InvalidConfig` if `capacity` is 0
    /// - `BufError::SpawnFailed` if the worker thread cannot be started
    pub fn new<S>(source: S, capacity: usize) -> BufResult<Self, E>
    where
        S: IntoIterator<Item = Result<V, E>> + Send + 'static,
    {
        Self::with_config(source, BufferConfig::new(capacity))
    }

    /// Starts a worker thread over `source` with a full configuration.
    ///
    /// Process mode needs serializable items; use [`spawn`](Self::spawn)
    /// for it.
    ///
    /// # Errors
    ///
    /// - `BufError::InvalidConfig` for a rejected configuration, including
    ///   `mode: Process`
    /// - `BufError::SpawnFailed` if the worker thread cannot be started
    pub fn with_config<S>(source: S, config: BufferConfig) -> BufResult<Self, E>
    where
        S: IntoIterator<Item = Result<V, E>> + Send + 'static,
    {
        config.validate()?;
        if config.mode == Mode::Process {
            return Err(BufError::InvalidConfig {
                parameter: "mode",
                reason: "process mode needs serializable items, use BackgroundBuffer::spawn"
                    .to_string(),
            });
        }
        Self::spawn_thread(source, config)
    }

    fn spawn_thread<S>(source: S, config: BufferConfig) -> BufResult<Self, E>
    where
        S: IntoIterator<Item = Result<V, E>> + Send + 'static,
    {
        let cancel = CancelToken::new();
        let (mut sender, receiver) = relay::relay(config.capacity, config.timeout);

        let worker_cancel = cancel.clone();
        let name = config.worker_name.clone();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let exit = Worker::new(source, worker_cancel).run(&mut sender);
                tracing::debug!(worker = %name, ?exit, "worker thread exiting");
                exit
            })
            .map_err(|e| BufError::SpawnFailed {
                message: format!("worker thread: {}", e),
            })?;

        tracing::debug!(
            worker = %config.worker_name,
            capacity = config.capacity,
            timeout = ?config.timeout,
            "background buffer started"
        );

        Ok(Self {
            relay: Some(receiver),
            worker: WorkerHandle::Thread(Some(handle)),
            cancel,
            config,
        })
    }
}

impl<V> BackgroundBuffer<V, Infallible>
where
    V: Send + 'static,
{
    /// Starts a worker thread over a source that cannot fail.
    ///
    /// # Errors
    ///
    /// Same as [`with_config`](Self::with_config).
    pub fn from_values<S>(values: S, config: BufferConfig) -> BufResult<Self, Infallible>
    where
        S: IntoIterator<Item = V>,
        S::IntoIter: Send + 'static,
    {
        Self::with_config(values.into_iter().map(Ok::<V, Infallible>), config)
    }
}

impl<V, E> BackgroundBuffer<V, E>
where
    V: Serialize + DeserializeOwned + Send + 'static,
    E: Serialize + DeserializeOwned + Send + 'static,
{
    /// Starts a worker in the mode named by `config.mode`.
    ///
    /// # Errors
    ///
    /// - `BufError::InvalidConfig` for a rejected configuration
    /// - `BufError::Unsupported` for process mode on non-unix targets
    /// - `BufError::SpawnFailed` if the worker cannot be started
    pub fn spawn<S>(source: S, config: BufferConfig) -> BufResult<Self, E>
    where
        S: IntoIterator<Item = Result<V, E>> + Send + 'static,
    {
        config.validate()?;
        match config.mode {
            Mode::Thread => Self::spawn_thread(source, config),
            Mode::Process => Self::spawn_process(source, config),
        }
    }

    /// Starts a worker process over `source`, ignoring `config.mode`.
    ///
    /// The source is inherited by the forked child, so unlike the items it
    /// does not need to be serializable or `Send`. Read the fork-safety
    /// notes on [`Mode::Process`] before using this from a program with
    /// other threads.
    ///
    /// # Errors
    ///
    /// Same as [`spawn`](Self::spawn).
    pub fn spawn_process<S>(source: S, config: BufferConfig) -> BufResult<Self, E>
    where
        S: IntoIterator<Item = Result<V, E>>,
    {
        let config = config.with_mode(Mode::Process);
        config.validate()?;

        let cancel = CancelToken::new();
        let (relay, worker) = launch_process(source, &config, &cancel)?;
        Ok(Self {
            relay: Some(relay),
            worker,
            cancel,
            config,
        })
    }
}

#[cfg(unix)]
fn launch_process<S, V, E>(
    source: S,
    config: &BufferConfig,
    cancel: &CancelToken,
) -> BufResult<(RelayReceiver<V, E>, WorkerHandle), E>
where
    S: IntoIterator<Item = Result<V, E>>,
    V: Serialize + DeserializeOwned + Send + 'static,
    E: Serialize + DeserializeOwned + Send + 'static,
{
    let (relay, child) = crate::process::spawn(source, config, cancel)?;
    Ok((relay, WorkerHandle::Process(child)))
}

#[cfg(not(unix))]
fn launch_process<S, V, E>(
    _source: S,
    _config: &BufferConfig,
    _cancel: &CancelToken,
) -> BufResult<(RelayReceiver<V, E>, WorkerHandle), E>
where
    S: IntoIterator<Item = Result<V, E>>,
{
    Err(BufError::Unsupported {
        mode: Mode::Process,
    })
}

impl<V, E> BackgroundBuffer<V, E> {
    /// Returns the next value, blocking until one is available.
    ///
    /// # Returns
    ///
    /// - `Ok(Some(value))` for the next item of the source
    /// - `Ok(None)` at end of sequence, and on every pull after the
    ///   terminal outcome
    ///
    /// # Errors
    ///
    /// - The source failure (`Source` or `Panicked`), exactly once
    /// - `BufError::Timeout { operation: Get, .. }` if `config.timeout` is
    ///   set and expires; the buffer stays usable
    /// - `BufError::Timeout { operation: Put, .. }` once, if the worker gave
    ///   up waiting for the consumer to make room
    /// - `BufError::WorkerLost` if the worker stopped without a terminal
    ///   outcome, exactly once
    pub fn pull(&mut self) -> BufResult<Option<V>, E> {
        self.pull_within(self.config.timeout)
    }

    /// Like [`pull`](Self::pull), bounded by `timeout` instead of the
    /// configured timeout.
    pub fn pull_timeout(&mut self, timeout: Duration) -> BufResult<Option<V>, E> {
        self.pull_within(Some(timeout))
    }

    /// Returns the next value only if one is already queued.
    ///
    /// # Errors
    ///
    /// - `BufError::Empty` if nothing is queued yet
    /// - Otherwise the same as [`pull`](Self::pull)
    pub fn try_pull(&mut self) -> BufResult<Option<V>, E> {
        let Some(relay) = self.relay.as_mut() else {
            return Ok(None);
        };
        match relay.try_get() {
            Err(BufError::Empty) => self.check_worker(BufError::Empty),
            other => other,
        }
    }

    fn pull_within(&mut self, timeout: Option<Duration>) -> BufResult<Option<V>, E> {
        let Some(relay) = self.relay.as_mut() else {
            return Ok(None);
        };
        match relay.get(timeout) {
            Err(
                err @ BufError::Timeout {
                    operation: Operation::Get,
                    ..
                },
            ) => self.check_worker(err),
            other => other,
        }
    }

    /// Called when a pull came back empty-handed. Turns a worker that is gone
    /// without a terminal slot into the end of the traversal.
    fn check_worker(&mut self, pending: BufError<E>) -> BufResult<Option<V>, E> {
        if !self.worker.is_finished() {
            return Err(pending);
        }
        let Some(relay) = self.relay.as_mut() else {
            return Ok(None);
        };

        // Everything the worker published is queued by now.
        match relay.try_get() {
            Err(BufError::Empty) if self.cancel.is_cancelled() => relay.end(),
            Err(BufError::Empty) => {
                tracing::error!(mode = %self.config.mode, "worker stopped without a terminal slot");
                relay.fail(BufError::WorkerLost {
                    reason: "worker stopped without publishing a terminal slot".to_string(),
                })
            }
            other => other,
        }
    }

    /// Asks the worker to stop pulling from the source.
    ///
    /// Values already queued stay readable; the traversal then ends with
    /// end of sequence. Pulls after a cancel never block indefinitely.
    pub fn cancel(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        tracing::debug!("cancelling background buffer");
        self.cancel.cancel();
        if let Some(relay) = &self.relay {
            relay.release_worker();
        }
    }

    /// Stops the worker and waits for it to exit.
    ///
    /// Queued values are discarded.
    ///
    /// # Errors
    ///
    /// - `BufError::CloseFailed` if the worker panicked outside the source
    ///   or could not be reaped
    pub fn close(mut self) -> BufResult<(), E> {
        self.shutdown(None)
            .map_err(|message| BufError::CloseFailed { message })
    }

    /// Like [`close`](Self::close), giving up after `timeout`.
    ///
    /// A worker thread still running at the deadline is left detached; a
    /// worker process is killed.
    ///
    /// # Errors
    ///
    /// - `BufError::CloseFailed` if the worker did not exit within `timeout`
    pub fn close_timeout(mut self, timeout: Duration) -> BufResult<(), E> {
        self.shutdown(Some(timeout))
            .map_err(|message| BufError::CloseFailed { message })
    }

    fn shutdown(&mut self, timeout: Option<Duration>) -> Result<(), String> {
        self.cancel();
        // Dropping the receiver disconnects a worker blocked on the queue.
        self.relay = None;
        self.worker.join(timeout)
    }

    /// Maximum number of values in flight between worker and consumer.
    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    /// Number of slots currently queued, including a re-armed end marker.
    pub fn queued(&self) -> usize {
        self.relay.as_ref().map_or(0, |relay| relay.queued())
    }

    /// True once the terminal outcome has been delivered.
    pub fn is_exhausted(&self) -> bool {
        self.relay.as_ref().map_or(true, |relay| relay.is_exhausted())
    }

    /// Where the worker runs.
    pub fn mode(&self) -> Mode {
        self.worker.mode()
    }

    /// The configuration the buffer was started with.
    pub fn config(&self) -> &BufferConfig {
        &self.config
    }

    /// True once the worker has stopped producing.
    pub fn worker_finished(&self) -> bool {
        self.worker.is_finished()
    }

    /// Process id of the worker, in process mode.
    pub fn worker_pid(&self) -> Option<u32> {
        self.worker.pid()
    }
}

impl<V, E> Iterator for BackgroundBuffer<V, E> {
    type Item = BufResult<V, E>;

    fn next(&mut self) -> Option<Self::Item> {
        self.pull().transpose()
    }
}

impl<V, E> FusedIterator for BackgroundBuffer<V, E> {}

impl<V, E> Drop for BackgroundBuffer<V, E> {
    /// Stops the worker if `close()` was not called.
    ///
    /// Waits at most 5 seconds. A worker thread that is still busy in the
    /// source after that is left running detached.
    fn drop(&mut self) {
        if self.relay.is_none() {
            return;
        }
        if let Err(e) = self.shutdown(Some(EMERGENCY_SHUTDOWN_TIMEOUT)) {
            tracing::warn!(
                worker = %self.config.worker_name,
                "background buffer dropped without a clean shutdown: {}",
                e
            );
        }
    }
}

impl<V, E> std::fmt::Debug for BackgroundBuffer<V, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundBuffer")
            .field("capacity", &self.config.capacity)
            .field("queued", &self.queued())
            .field("exhausted", &self.is_exhausted())
            .field("worker", &self.worker)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_zero_capacity_is_rejected_before_spawning() {
        let err = BackgroundBuffer::new(Vec::<Result<u8, io::Error>>::new(), 0).unwrap_err();
        assert!(matches!(
            err,
            BufError::InvalidConfig {
                parameter: "capacity",
                ..
            }
        ));
    }

    #[test]
    fn test_with_config_rejects_process_mode() {
        let config = BufferConfig::new(1).with_mode(Mode::Process);
        let err = BackgroundBuffer::with_config(Vec::<Result<u8, io::Error>>::new(), config)
            .unwrap_err();
        assert!(matches!(err, BufError::InvalidConfig { parameter: "mode", .. }));
    }

    #[test]
    fn test_accessors() {
        let config = BufferConfig::new(3).with_worker_name("accessors");
        let mut buffer = BackgroundBuffer::from_values(vec![1_u8], config).unwrap();

        assert_eq!(buffer.capacity(), 3);
        assert_eq!(buffer.mode(), Mode::Thread);
        assert_eq!(buffer.worker_pid(), None);
        assert_eq!(buffer.config().worker_name, "accessors");
        assert!(!buffer.is_exhausted());

        assert_eq!(buffer.pull().unwrap(), Some(1));
        assert_eq!(buffer.pull().unwrap(), None);
        assert!(buffer.is_exhausted());
        assert!(format!("{:?}", buffer).contains("BackgroundBuffer"));
    }

    #[test]
    fn test_close_discards_queue() {
        let buffer = BackgroundBuffer::from_values(0..1_000_000_u64, BufferConfig::new(4)).unwrap();
        buffer.close().unwrap();
    }

    #[test]
    fn test_pulls_after_cancel_end() {
        let mut buffer = BackgroundBuffer::from_values(0.., BufferConfig::new(2)).unwrap();
        assert_eq!(buffer.pull().unwrap(), Some(0));

        buffer.cancel();
        let mut drained = 0;
        while buffer.pull().unwrap().is_some() {
            drained += 1;
            assert!(drained <= 3, "worker kept producing after cancel");
        }
        assert!(buffer.is_exhausted());
        assert_eq!(buffer.pull().unwrap(), None);
    }
}
