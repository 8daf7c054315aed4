//! Buffer configuration.

use core::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BufError, BufResult};

/// Default relay queue capacity.
///
/// Two slots let the worker prefetch the next item while the consumer holds
/// the current one, without buffering far ahead of it.
pub const DEFAULT_CAPACITY: usize = 2;

/// Default name given to worker threads.
pub const DEFAULT_WORKER_NAME: &str = "bgbuf-worker";

/// Where the worker runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// A thread in the caller's process. Items move by ownership, no copies.
    #[default]
    Thread,

    /// A forked child process.
    ///
    /// Items and errors cross the process boundary as JSON, so they must be
    /// serializable. Isolates producer crashes and gives CPU-bound sources a
    /// separate address space.
    ///
    /// **Portability**: only available on unix targets, where the child is
    /// created with `fork`. Other targets reject this mode with
    /// [`BufError::Unsupported`] instead of falling back to a thread.
    Process,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Thread => f.write_str("thread"),
            Mode::Process => f.write_str("process"),
        }
    }
}

/// Configuration for a background buffer.
///
/// # Example
///
/// ```rust
/// use bgbuf_core::{BufferConfig, Mode};
/// use std::time::Duration;
///
/// let config = BufferConfig::new(8)
///     .with_timeout(Duration::from_secs(5))
///     .with_mode(Mode::Thread);
/// assert!(config.validate::<std::io::Error>().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Maximum number of slots in flight between worker and consumer
    /// (default: 2). Must be at least 1.
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// Bound on every blocking get and put (default: none).
    ///
    /// Serialized as whole milliseconds under `timeout_ms`.
    #[serde(
        default,
        rename = "timeout_ms",
        with = "millis_serde",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout: Option<Duration>,

    /// Worker placement (default: thread).
    #[serde(default)]
    pub mode: Mode,

    /// Name of the worker thread (default: `bgbuf-worker`).
    #[serde(default = "default_worker_name")]
    pub worker_name: String,
}

fn default_capacity() -> usize {
    DEFAULT_CAPACITY
}

fn default_worker_name() -> String {
    DEFAULT_WORKER_NAME.to_string()
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            timeout: None,
            mode: Mode::default(),
            worker_name: default_worker_name(),
        }
    }
}

impl BufferConfig {
    /// Thread-mode configuration with the given capacity and no timeout.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            ..Self::default()
        }
    }

    /// Set the relay queue capacity.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Bound every blocking get and put by `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Select where the worker runs.
    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    /// Name the worker thread.
    pub fn with_worker_name(mut self, name: impl Into<String>) -> Self {
        self.worker_name = name.into();
        self
    }

    /// Validate the configuration.
    pub fn validate<E>(&self) -> BufResult<(), E> {
        if self.capacity == 0 {
            return Err(BufError::InvalidConfig {
                parameter: "capacity",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.timeout == Some(Duration::ZERO) {
            return Err(BufError::InvalidConfig {
                parameter: "timeout",
                reason: "must be greater than zero when set".to_string(),
            });
        }
        if self.worker_name.contains('\0') {
            return Err(BufError::InvalidConfig {
                parameter: "worker_name",
                reason: "must not contain NUL bytes".to_string(),
            });
        }
        Ok(())
    }
}

/// Serde helper for optional millisecond durations.
mod millis_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}
