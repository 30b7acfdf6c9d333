//! Log and progress sinks.
//!
//! The engine never talks to a UI directly. Human-readable diagnostics go to
//! an injected [`LogSink`]; [`Logger`] wraps it and mirrors every entry to
//! `tracing`. [`ChannelSink`] forwards both logs and progress over an
//! `async-channel` so a front-end can drain them on its own thread.

use std::fmt;
use std::sync::Arc;

use tracing::{error, info, warn};

// ---------------------------------------------------------------------------
// Levels and the sink trait
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
        })
    }
}

/// Receives `(message, level)` pairs from every engine component.
///
/// Called from whichever task produced the entry, so implementations must be
/// cheap and must not block.
pub trait LogSink: Send + Sync {
    fn log(&self, message: &str, level: LogLevel);
}

impl<F> LogSink for F
where
    F: Fn(&str, LogLevel) + Send + Sync,
{
    fn log(&self, message: &str, level: LogLevel) {
        self(message, level)
    }
}

/// Discards everything. `tracing` output from [`Logger`] still happens.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl LogSink for NullSink {
    fn log(&self, _message: &str, _level: LogLevel) {}
}

/// Progress sink: receives values in `[0.0, 1.0]`.
pub type ProgressCallback = Arc<dyn Fn(f64) + Send + Sync>;

// ---------------------------------------------------------------------------
// Logger
// ---------------------------------------------------------------------------

/// Cheap-to-clone handle over a shared [`LogSink`].
#[derive(Clone)]
pub struct Logger {
    sink: Arc<dyn LogSink>,
}

impl Logger {
    pub fn new(sink: Arc<dyn LogSink>) -> Self {
        Self { sink }
    }

    pub fn info(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        info!("{}", message);
        self.sink.log(message, LogLevel::Info);
    }

    pub fn warn(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        warn!("{}", message);
        self.sink.log(message, LogLevel::Warning);
    }

    pub fn error(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        error!("{}", message);
        self.sink.log(message, LogLevel::Error);
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::new(Arc::new(NullSink))
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Channel-backed sink for front-ends
// ---------------------------------------------------------------------------

/// An event destined for the front-end thread.
#[derive(Debug, Clone, PartialEq)]
pub enum CloneEvent {
    Log { message: String, level: LogLevel },
    Progress(f64),
}

/// Forwards logs and progress into a bounded channel.
///
/// Sends are fire-and-forget: when the channel is full or the receiver is
/// gone the event is dropped rather than stalling the clone.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: async_channel::Sender<CloneEvent>,
}

impl ChannelSink {
    /// Create a sink and the receiver a front-end polls.
    pub fn bounded(capacity: usize) -> (Self, async_channel::Receiver<CloneEvent>) {
        let (tx, rx) = async_channel::bounded(capacity);
        (Self { tx }, rx)
    }

    /// A progress callback that feeds the same channel.
    pub fn progress_callback(&self) -> ProgressCallback {
        let tx = self.tx.clone();
        Arc::new(move |value| {
            let _ = tx.try_send(CloneEvent::Progress(value));
        })
    }
}

impl LogSink for ChannelSink {
    fn log(&self, message: &str, level: LogLevel) {
        let _ = self.tx.try_send(CloneEvent::Log {
            message: message.to_string(),
            level,
        });
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
