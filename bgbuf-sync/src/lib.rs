//! # bgbuf Sync API
//!
//! Blocking prefetch buffer for any source sequence. A background worker
//! pulls items ahead of the consumer into a bounded queue, so a slow
//! producer (disk reads, decoding, network fetches) overlaps with the work
//! done on each item.
//!
//! ## Overview
//!
//! ```text
//! source ──► worker (thread | process) ──► relay queue (capacity N) ──► consumer
//!                      ▲                                                   │
//!                      └──────────────── one credit per value ◄────────────┘
//! ```
//!
//! The worker starts as soon as the buffer is built. It never has more than
//! `capacity` values produced but not yet consumed, and it stops at the first
//! failure of the source.
//!
//! ## Features
//!
//! ### Consumer Operations
//! - **`pull()`**: Blocking, bounded by the configured timeout if any
//! - **`pull_timeout()`**: Blocking with an explicit timeout
//! - **`try_pull()`**: Non-blocking, `BufError::Empty` when nothing is queued
//! - **`Iterator`**: `for item in buffer { let value = item?; }`
//!
//! ### Lifecycle
//! - **`cancel()`**: Stop pulling from the source, keep what is queued
//! - **`close()`** / **`close_timeout()`**: Stop the worker and wait for it
//! - **Drop**: Same as `close()` with a 5 second bound
//!
//! ## Quick Start
//!
//! ```rust
//! use bgbuf_sync::{BackgroundBuffer, BufError};
//!
//! #[derive(Debug, thiserror::Error)]
//! #[error("record {0} is corrupt")]
//! struct Corrupt(u32);
//!
//! # fn main() {
//! let records = vec![Ok(1), Ok(2), Err(Corrupt(3))];
//! let mut buffer = BackgroundBuffer::new(records, 2).expect("spawn failed");
//!
//! assert_eq!(buffer.pull().unwrap(), Some(1));
//! assert_eq!(buffer.pull().unwrap(), Some(2));
//! assert!(matches!(buffer.pull(), Err(BufError::Source { .. })));
//!
//! // The failure is reported once; afterwards the buffer is exhausted.
//! assert_eq!(buffer.pull().unwrap(), None);
//! assert_eq!(buffer.pull().unwrap(), None);
//! # }
//! ```
//!
//! ## Modes
//!
//! - **Thread** (default): items move to the consumer by ownership.
//! - **Process** (unix only): the worker is a forked child and items cross
//!   the boundary as JSON, so `V` and `E` must be `Serialize +
//!   DeserializeOwned`. Use [`BackgroundBuffer::spawn`] or
//!   [`BackgroundBuffer::spawn_process`].
//!
//! ## Error Handling
//!
//! All operations return `BufResult<T, E>`:
//!
//! - `Source` / `Panicked`: The source failed; reported exactly once
//! - `Timeout`: A `Get` timeout means a pull outlived the timeout and the
//!   buffer stays usable; a `Put` timeout means the worker gave up waiting
//!   for the consumer and is reported once
//! - `Empty`: `try_pull()` found nothing queued
//! - `WorkerLost`: The worker stopped without a terminal outcome
//! - `InvalidConfig`, `SpawnFailed`, `Unsupported`: Construction failed
//! - `CloseFailed`: Shutdown did not complete

mod buffer;
mod handle;
#[cfg(unix)]
mod process;
mod relay;

pub use buffer::BackgroundBuffer;

pub use bgbuf_core::{
    run_inline, BufError, BufResult, BufferConfig, Mode, Operation, Slot, DEFAULT_CAPACITY,
};
