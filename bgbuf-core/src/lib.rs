//! bgbuf core types
//!
//! Runtime-agnostic building blocks for background prefetch buffers: the slot
//! protocol spoken over the relay queue, the error type, configuration, and
//! the production loop that drains a source sequence into any [`SlotSink`].
//!
//! # Slot Protocol
//!
//! ```text
//! worker:    Value(v0) Value(v1) ... Value(vn) {End | Failure(e)}
//! consumer:  v0, v1, ..., vn, {end | error}, end, end, ...
//! ```
//!
//! The worker publishes exactly one terminal slot. The consumer re-arms the
//! queue with `End` after it observes a terminal slot, which keeps an
//! exhausted buffer exhausted without any extra state.
//!
//! The blocking consumer facade lives in `bgbuf-sync`.

pub mod cancel;
pub mod config;
mod error;
pub mod sink;
pub mod slot;
pub mod worker;

pub use cancel::CancelToken;
pub use config::{BufferConfig, Mode, DEFAULT_CAPACITY, DEFAULT_WORKER_NAME};
pub use error::{panic_message, BufError, BufResult, Operation};
pub use sink::{PutError, SlotSink};
pub use slot::Slot;
pub use worker::{run_inline, Worker, WorkerExit};
