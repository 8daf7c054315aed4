//! Ownership of the running worker.

use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bgbuf_core::{Mode, WorkerExit};

#[cfg(unix)]
use crate::process::ChildProcess;

/// Poll interval while waiting for a worker with a deadline.
const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Polls `done` until it returns true or `deadline` passes.
///
/// Returns whether `done` became true. Without a deadline it waits forever.
pub(crate) fn wait_until<F>(mut done: F, deadline: Option<Instant>) -> bool
where
    F: FnMut() -> bool,
{
    loop {
        if done() {
            return true;
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return false;
        }
        thread::sleep(JOIN_POLL_INTERVAL);
    }
}

/// Handle to the worker thread or worker process.
///
/// The buffer keeps it for its whole life so that shutdown can join (or
/// reap) the worker, and so that pulls can tell a slow worker from a dead
/// one.
pub(crate) enum WorkerHandle {
    Thread(Option<JoinHandle<WorkerExit>>),
    #[cfg(unix)]
    Process(ChildProcess),
}

impl WorkerHandle {
    pub(crate) fn mode(&self) -> Mode {
        match self {
            WorkerHandle::Thread(_) => Mode::Thread,
            #[cfg(unix)]
            WorkerHandle::Process(_) => Mode::Process,
        }
    }

    /// True once the worker has stopped publishing.
    pub(crate) fn is_finished(&self) -> bool {
        match self {
            WorkerHandle::Thread(handle) => handle.as_ref().map_or(true, |h| h.is_finished()),
            #[cfg(unix)]
            WorkerHandle::Process(child) => child.is_finished(),
        }
    }

    /// Process id of a worker process.
    pub(crate) fn pid(&self) -> Option<u32> {
        match self {
            WorkerHandle::Thread(_) => None,
            #[cfg(unix)]
            WorkerHandle::Process(child) => Some(child.pid()),
        }
    }

    /// Waits for the worker to stop.
    ///
    /// A thread that outlives `timeout` is left detached; a process that
    /// outlives it is killed. Either way the error describes what happened.
    pub(crate) fn join(&mut self, timeout: Option<Duration>) -> Result<(), String> {
        match self {
            WorkerHandle::Thread(slot) => {
                let Some(handle) = slot.take() else {
                    return Ok(());
                };
                let deadline = timeout.map(|t| Instant::now() + t);
                if !wait_until(|| handle.is_finished(), deadline) {
                    return Err(format!(
                        "worker thread did not stop within {:?}",
                        timeout.unwrap_or_default()
                    ));
                }
                match handle.join() {
                    Ok(exit) => {
                        tracing::debug!(?exit, "worker thread joined");
                        Ok(())
                    }
                    Err(_) => Err("worker thread panicked".to_string()),
                }
            }
            #[cfg(unix)]
            WorkerHandle::Process(child) => child.join(timeout),
        }
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerHandle::Thread(handle) => f
                .debug_struct("Thread")
                .field("joined", &handle.is_none())
                .finish(),
            #[cfg(unix)]
            WorkerHandle::Process(child) => std::fmt::Debug::fmt(child, f),
        }
    }
}
