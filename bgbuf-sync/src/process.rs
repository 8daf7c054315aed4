//! Process-mode workers.
//!
//! The worker runs in a child created with `fork`, so the source only has to
//! exist in the parent before spawning; it is never serialized. Slots travel
//! back over one end of a Unix socket pair, credits travel the other way.
//!
//! ```text
//!  worker process                            consumer process
//!  ┌────────────────┐   frame(WireSlot)   ┌───────────┐  Slot  ┌──────────┐
//!  │ Worker ─► Sink │ ──────────────────► │ pump thd  │ ─────► │  relay   │
//!  │                │ ◄────────────────── │           │        │ receiver │
//!  └────────────────┘    credit byte      └───────────┘        └──────────┘
//!                          (written by the consumer on every dequeued value)
//! ```
//!
//! A frame is a little-endian `u32` length followed by the JSON encoding of a
//! [`WireSlot`]. The child starts with `capacity` credits and spends one per
//! pull, so values in flight never exceed the queue capacity.
//!
//! Only the child's own slots cross the boundary, including the put timeout
//! a child reports when the consumer stops taking values. If the stream ends
//! before a terminal frame arrives, the pump publishes `WorkerLost` (or `End`
//! when the consumer cancelled) on the child's behalf.
//!
//! **Fork safety**: the child inherits a copy of every lock in the parent. A
//! tracing subscriber or allocator lock held by another thread at the moment
//! of the fork stays held forever in the child. Keep process-mode sources
//! self-contained and prefer spawning before other threads start logging.

use std::io::{self, Read, Write};
use std::marker::PhantomData;
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Mutex;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bgbuf_core::{
    BufError, BufResult, BufferConfig, CancelToken, Operation, PutError, Slot, SlotSink, Worker,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::handle::wait_until;
use crate::relay::{self, RelayReceiver, RelaySender};

/// Control byte granting the worker process one more pull.
const CREDIT: u8 = 1;

/// Upper bound on a single frame body.
const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Exit codes of the worker process.
const EXIT_OK: i32 = 0;
const EXIT_NO_TERMINAL: i32 = 2;
const EXIT_PANICKED: i32 = 101;

/// Held from socket creation until the parent has closed the child's end.
///
/// Without it a concurrent spawn could fork while another buffer's worker
/// end is still open in this process, and its child would keep that socket
/// alive: the other pump would never see end-of-stream.
static FORK_LOCK: Mutex<()> = Mutex::new(());

// ============================================================================
// Wire format
// ============================================================================

/// A slot as it crosses the process boundary.
///
/// Backtraces travel as text. Failures other than source errors and panics
/// cannot originate in the worker loop, but are still encoded as `Lost`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum WireSlot<V, E> {
    Value { value: V },
    End,
    Source { error: E, trace: String },
    Panicked { message: String, trace: String },
    TimedOut { after: Duration },
    Lost { reason: String },
}

impl<V, E> WireSlot<V, E> {
    fn from_slot(slot: Slot<V, E>) -> Self {
        match slot {
            Slot::Value(value) => WireSlot::Value { value },
            Slot::End => WireSlot::End,
            Slot::Failure(BufError::Source { error, trace }) => WireSlot::Source { error, trace },
            Slot::Failure(BufError::Panicked { message, trace }) => {
                WireSlot::Panicked { message, trace }
            }
            Slot::Failure(BufError::Timeout {
                operation: Operation::Put,
                after,
            }) => WireSlot::TimedOut { after },
            Slot::Failure(other) => WireSlot::Lost {
                reason: match other.retype::<std::convert::Infallible>() {
                    Ok(failure) => failure.to_string(),
                    Err(_) => "source failure".to_string(),
                },
            },
        }
    }

    fn into_slot(self) -> Slot<V, E> {
        match self {
            WireSlot::Value { value } => Slot::Value(value),
            WireSlot::End => Slot::End,
            WireSlot::Source { error, trace } => Slot::Failure(BufError::Source { error, trace }),
            WireSlot::Panicked { message, trace } => {
                Slot::Failure(BufError::Panicked { message, trace })
            }
            WireSlot::TimedOut { after } => Slot::Failure(BufError::Timeout {
                operation: Operation::Put,
                after,
            }),
            WireSlot::Lost { reason } => Slot::Failure(BufError::WorkerLost { reason }),
        }
    }
}

#[derive(Debug, Error)]
enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame of {0} bytes exceeds the size limit")]
    TooLarge(usize),
}

fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<(), FrameError>
where
    W: Write,
    T: Serialize,
{
    let body = serde_json::to_vec(message)?;
    if body.len() > MAX_FRAME_BYTES {
        return Err(FrameError::TooLarge(body.len()));
    }

    let mut framed = Vec::with_capacity(4 + body.len());
    framed.extend_from_slice(&(body.len() as u32).to_le_bytes());
    framed.extend_from_slice(&body);
    writer.write_all(&framed)?;
    Ok(())
}

/// Reads one frame. `Ok(None)` means the stream ended cleanly between
/// frames.
fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>, FrameError>
where
    R: Read,
    T: DeserializeOwned,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_le_bytes(header) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(FrameError::TooLarge(len));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    Ok(Some(serde_json::from_slice(&body)?))
}

/// Returns one credit to the worker process.
pub(crate) fn grant_credit(stream: &UnixStream) -> io::Result<()> {
    let mut writer = stream;
    writer.write_all(&[CREDIT])
}

/// Closes both directions of the worker connection.
///
/// The worker sees end-of-stream on its next credit wait or a broken pipe on
/// its next put; the pump sees end-of-stream on its next read.
pub(crate) fn hang_up(stream: &UnixStream) {
    if let Err(e) = stream.shutdown(Shutdown::Both) {
        tracing::trace!("worker connection already closed: {}", e);
    }
}

// ============================================================================
// Worker side (child process)
// ============================================================================

/// Sink that publishes framed slots to the consumer process.
struct SocketSink<V, E> {
    stream: UnixStream,
    credits: usize,
    timeout: Option<Duration>,
    _slots: PhantomData<fn(V, E)>,
}

impl<V, E> SocketSink<V, E> {
    fn new(stream: UnixStream, credits: usize, timeout: Option<Duration>) -> io::Result<Self> {
        stream.set_read_timeout(timeout)?;
        stream.set_write_timeout(timeout)?;
        Ok(Self {
            stream,
            credits,
            timeout,
            _slots: PhantomData,
        })
    }

    fn classify(&self, err: &io::Error) -> PutError {
        match (err.kind(), self.timeout) {
            (io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut, Some(after)) => {
                PutError::Timeout(after)
            }
            _ => PutError::Disconnected,
        }
    }
}

impl<V, E> SlotSink<V, E> for SocketSink<V, E>
where
    V: Serialize,
    E: Serialize,
{
    fn reserve(&mut self) -> Result<(), PutError> {
        if self.credits > 0 {
            self.credits -= 1;
            return Ok(());
        }

        let mut byte = [0u8; 1];
        loop {
            match self.stream.read(&mut byte) {
                Ok(1) if byte[0] == CREDIT => return Ok(()),
                // End-of-stream or an unknown control byte.
                Ok(_) => return Err(PutError::Disconnected),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(self.classify(&e)),
            }
        }
    }

    fn put(&mut self, slot: Slot<V, E>) -> Result<(), PutError> {
        match write_frame(&mut self.stream, &WireSlot::from_slot(slot)) {
            Ok(()) => Ok(()),
            Err(FrameError::Io(e)) => Err(self.classify(&e)),
            Err(e) => {
                // The slot cannot be encoded. End the traversal with a
                // failure the consumer can still read.
                let lost: WireSlot<V, E> = WireSlot::Lost {
                    reason: format!("worker could not encode slot: {}", e),
                };
                if let Err(e) = write_frame(&mut self.stream, &lost) {
                    tracing::debug!("could not report encoding failure: {}", e);
                }
                Err(PutError::Disconnected)
            }
        }
    }
}

/// Body of the worker process. Returns its exit code.
fn run_child<S, V, E>(source: S, stream: UnixStream, config: &BufferConfig) -> i32
where
    S: IntoIterator<Item = Result<V, E>>,
    V: Serialize,
    E: Serialize,
{
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        let mut sink = match SocketSink::new(stream, config.capacity, config.timeout) {
            Ok(sink) => sink,
            Err(_) => return EXIT_NO_TERMINAL,
        };
        let exit = Worker::new(source, CancelToken::new()).run(&mut sink);
        if exit.published_terminal() {
            EXIT_OK
        } else {
            EXIT_NO_TERMINAL
        }
    }));
    outcome.unwrap_or(EXIT_PANICKED)
}

// ============================================================================
// Consumer side
// ============================================================================

/// Forks a worker process and starts the pump that feeds the relay queue.
pub(crate) fn spawn<S, V, E>(
    source: S,
    config: &BufferConfig,
    cancel: &CancelToken,
) -> BufResult<(RelayReceiver<V, E>, ChildProcess), E>
where
    S: IntoIterator<Item = Result<V, E>>,
    V: Serialize + DeserializeOwned + Send + 'static,
    E: Serialize + DeserializeOwned + Send + 'static,
{
    let fork_guard = FORK_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    let (parent, child) = UnixStream::pair().map_err(|e| spawn_failed("socket pair", e))?;
    let credit_stream = parent
        .try_clone()
        .map_err(|e| spawn_failed("socket clone", e))?;

    // SAFETY: `fork` has no preconditions. The child only touches its own
    // copy of `source` and its end of the socket pair, and leaves through
    // `_exit` without returning into the caller's frames.
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(spawn_failed("fork", io::Error::last_os_error()));
    }
    if pid == 0 {
        drop(parent);
        drop(credit_stream);
        let code = run_child(source, child, config);
        // SAFETY: terminates the child without running parent-owned
        // destructors or atexit handlers.
        unsafe { libc::_exit(code) }
    }
    drop(child);
    drop(fork_guard);
    tracing::debug!(pid, capacity = config.capacity, "worker process started");

    let (sender, receiver) = relay::relay_to_process(config.capacity, credit_stream);
    let pump_cancel = cancel.clone();
    let pump_thread = thread::Builder::new()
        .name(format!("{}-pump", config.worker_name))
        .spawn(move || pump(parent, sender, pump_cancel));

    let mut process = ChildProcess {
        pid,
        pump: None,
        reaped: false,
    };
    match pump_thread {
        Ok(pump) => {
            process.pump = Some(pump);
            Ok((receiver, process))
        }
        // Dropping `process` kills and reaps the child.
        Err(e) => Err(spawn_failed("pump thread", e)),
    }
}

fn spawn_failed<E>(what: &str, err: io::Error) -> BufError<E> {
    BufError::SpawnFailed {
        message: format!("{} failed: {}", what, err),
    }
}

/// Moves slots from the worker process into the relay queue.
fn pump<V, E>(mut stream: UnixStream, mut relay: RelaySender<V, E>, cancel: CancelToken)
where
    V: DeserializeOwned,
    E: DeserializeOwned,
{
    loop {
        let slot = match read_frame::<_, WireSlot<V, E>>(&mut stream) {
            Ok(Some(frame)) => frame.into_slot(),
            Ok(None) | Err(_) if cancel.is_cancelled() => Slot::End,
            Ok(None) => {
                tracing::error!("worker process exited without a terminal slot");
                Slot::Failure(BufError::WorkerLost {
                    reason: "worker process exited without a terminal slot".to_string(),
                })
            }
            Err(e) => {
                tracing::error!("unreadable frame from worker process: {}", e);
                Slot::Failure(BufError::WorkerLost {
                    reason: format!("unreadable frame from worker process: {}", e),
                })
            }
        };

        let terminal = slot.is_terminal();
        if relay.put(slot).is_err() {
            tracing::debug!("consumer gone, pump exiting");
            return;
        }
        if terminal {
            return;
        }
    }
}

/// A forked worker and the pump thread serving it.
///
/// Dropping an unreaped `ChildProcess` kills the worker so it never outlives
/// the buffer as a zombie.
pub(crate) struct ChildProcess {
    pid: libc::pid_t,
    pump: Option<JoinHandle<()>>,
    reaped: bool,
}

impl ChildProcess {
    pub(crate) fn pid(&self) -> u32 {
        self.pid as u32
    }

    /// True once the pump has delivered its last slot.
    pub(crate) fn is_finished(&self) -> bool {
        self.pump.as_ref().map_or(true, |pump| pump.is_finished())
    }

    /// Joins the pump and reaps the worker process.
    ///
    /// With a timeout, a worker still running at the deadline is killed
    /// and the join reports failure.
    pub(crate) fn join(&mut self, timeout: Option<Duration>) -> Result<(), String> {
        let deadline = timeout.map(|t| Instant::now() + t);

        if let Some(pump) = self.pump.take() {
            if !wait_until(|| pump.is_finished(), deadline) {
                // Killing the worker closes its socket, which ends the pump.
                self.kill();
                if pump.join().is_err() {
                    tracing::error!("pump thread panicked");
                }
                self.reap()?;
                return Err(format!(
                    "worker process {} did not stop within {:?} and was killed",
                    self.pid,
                    timeout.unwrap_or_default()
                ));
            }
            if pump.join().is_err() {
                return Err("pump thread panicked".to_string());
            }
        }

        if !wait_until(|| self.try_reap(), deadline) {
            self.kill();
            self.reap()?;
            return Err(format!(
                "worker process {} did not exit within {:?} and was killed",
                self.pid,
                timeout.unwrap_or_default()
            ));
        }
        Ok(())
    }

    fn kill(&self) {
        if self.reaped {
            return;
        }
        // SAFETY: signals a child we forked and have not reaped, so the pid
        // cannot have been recycled.
        unsafe {
            libc::kill(self.pid, libc::SIGKILL);
        }
    }

    /// Non-blocking reap. Returns true once the process is gone.
    fn try_reap(&mut self) -> bool {
        match self.wait(libc::WNOHANG) {
            Ok(done) => done,
            Err(e) => {
                tracing::warn!(pid = self.pid, "waitpid failed: {}", e);
                self.reaped = true;
                true
            }
        }
    }

    /// Blocking reap.
    fn reap(&mut self) -> Result<(), String> {
        self.wait(0)
            .map(|_| ())
            .map_err(|e| format!("waitpid failed: {}", e))
    }

    fn wait(&mut self, flags: libc::c_int) -> io::Result<bool> {
        if self.reaped {
            return Ok(true);
        }
        loop {
            let mut status: libc::c_int = 0;
            // SAFETY: `status` is a valid out-pointer and `pid` is our child.
            let rc = unsafe { libc::waitpid(self.pid, &mut status, flags) };
            if rc == self.pid {
                self.reaped = true;
                if libc::WIFEXITED(status) {
                    tracing::debug!(
                        pid = self.pid,
                        code = libc::WEXITSTATUS(status),
                        "worker process exited"
                    );
                } else if libc::WIFSIGNALED(status) {
                    tracing::debug!(
                        pid = self.pid,
                        signal = libc::WTERMSIG(status),
                        "worker process killed"
                    );
                }
                return Ok(true);
            }
            if rc == 0 {
                return Ok(false);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                self.reaped = true;
                return Err(err);
            }
        }
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        if !self.reaped {
            self.kill();
            if let Err(e) = self.reap() {
                tracing::warn!(pid = self.pid, "could not reap worker process: {}", e);
            }
        }
    }
}

impl std::fmt::Debug for ChildProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildProcess")
            .field("pid", &self.pid)
            .field("reaped", &self.reaped)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    type TestWire = WireSlot<u32, String>;

    #[test]
    fn test_frame_layout() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &TestWire::End).unwrap();

        let body = br#"{"kind":"end"}"#;
        assert_eq!(&buf[..4], &(body.len() as u32).to_le_bytes());
        assert_eq!(&buf[4..], body);
    }

    #[test]
    fn test_frames_are_read_in_order() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &TestWire::Value { value: 7 }).unwrap();
        write_frame(
            &mut buf,
            &TestWire::Source {
                error: "bad".to_string(),
                trace: String::new(),
            },
        )
        .unwrap();

        let mut reader = Cursor::new(buf);
        let first: TestWire = read_frame(&mut reader).unwrap().unwrap();
        assert!(matches!(first, WireSlot::Value { value: 7 }));

        let second: TestWire = read_frame(&mut reader).unwrap().unwrap();
        match second.into_slot() {
            Slot::Failure(BufError::Source { error, .. }) => assert_eq!(error, "bad"),
            other => panic!("unexpected slot: {:?}", other),
        }

        let end: Option<TestWire> = read_frame(&mut reader).unwrap();
        assert!(end.is_none());
    }

    #[test]
    fn test_truncated_body_is_an_error() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &TestWire::Value { value: 1 }).unwrap();
        buf.truncate(buf.len() - 1);

        let result: Result<Option<TestWire>, _> = read_frame(&mut Cursor::new(buf));
        assert!(matches!(result, Err(FrameError::Io(_))));
    }

    #[test]
    fn test_oversized_header_is_rejected() {
        let buf = u32::MAX.to_le_bytes().to_vec();
        let result: Result<Option<TestWire>, _> = read_frame(&mut Cursor::new(buf));
        assert!(matches!(result, Err(FrameError::TooLarge(_))));
    }

    #[test]
    fn test_non_source_failures_travel_as_lost() {
        let slot: Slot<u32, String> = Slot::Failure(BufError::Timeout {
            operation: Operation::Get,
            after: Duration::from_millis(5),
        });
        let wire = WireSlot::from_slot(slot);
        assert!(matches!(&wire, WireSlot::Lost { reason } if reason.contains("timed out")));
        assert!(matches!(
            wire.into_slot(),
            Slot::Failure(BufError::WorkerLost { .. })
        ));
    }

    #[test]
    fn test_put_timeout_keeps_its_kind_across_frames() {
        let slot: Slot<u32, String> = Slot::Failure(BufError::Timeout {
            operation: Operation::Put,
            after: Duration::from_millis(50),
        });
        let mut buf = Vec::new();
        write_frame(&mut buf, &WireSlot::from_slot(slot)).unwrap();

        let frame: TestWire = read_frame(&mut Cursor::new(buf)).unwrap().unwrap();
        match frame.into_slot() {
            Slot::Failure(BufError::Timeout {
                operation: Operation::Put,
                after,
            }) => assert_eq!(after, Duration::from_millis(50)),
            other => panic!("expected put timeout, got {:?}", other),
        }
    }

    #[test]
    fn test_worker_reports_credit_timeout_to_consumer() {
        let (worker_end, consumer_end) = UnixStream::pair().unwrap();
        let mut sink: SocketSink<u32, String> =
            SocketSink::new(worker_end, 1, Some(Duration::from_millis(20))).unwrap();
        let exit = Worker::new((0..10_u32).map(Ok::<_, String>), CancelToken::new()).run(&mut sink);
        assert!(exit.published_terminal());

        let mut reader = consumer_end;
        let first: TestWire = read_frame(&mut reader).unwrap().unwrap();
        assert!(matches!(first, WireSlot::Value { value: 0 }));
        let second: TestWire = read_frame(&mut reader).unwrap().unwrap();
        assert!(matches!(second, WireSlot::TimedOut { .. }));
    }

    #[test]
    fn test_socket_sink_spends_then_waits_for_credits() {
        let (worker_end, consumer_end) = UnixStream::pair().unwrap();
        let mut sink: SocketSink<u32, String> =
            SocketSink::new(worker_end, 1, Some(Duration::from_millis(20))).unwrap();

        sink.reserve().unwrap();
        sink.put(Slot::Value(5)).unwrap();
        assert_eq!(
            sink.reserve(),
            Err(PutError::Timeout(Duration::from_millis(20)))
        );

        grant_credit(&consumer_end).unwrap();
        sink.reserve().unwrap();

        let mut reader = consumer_end.try_clone().unwrap();
        let frame: TestWire = read_frame(&mut reader).unwrap().unwrap();
        assert!(matches!(frame, WireSlot::Value { value: 5 }));

        hang_up(&consumer_end);
        assert_eq!(sink.reserve(), Err(PutError::Disconnected));
    }
}
