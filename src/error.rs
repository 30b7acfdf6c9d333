//! Error types.
//!
//! Per-entity failures (a rejected role, a dropped connection while posting a
//! message) never surface here: they are logged, counted in
//! [`CloneStats::errors`](crate::stats::CloneStats) and skipped. The enums in
//! this module cover what a run cannot recover from, plus transport and
//! configuration errors at the edges.

use thiserror::Error;

/// Errors produced by the HTTP layer before a response can be classified.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HttpError {
    /// Transport / network error (timeout, connection reset, TLS).
    #[error("HTTP transport error: {0}")]
    Transport(String),

    /// A 2xx response whose body did not match the expected shape.
    #[error("unexpected response body on {route}: {message}")]
    Decode { route: String, message: String },

    /// The transport could not be constructed.
    #[error("failed to build HTTP client: {0}")]
    Build(String),
}

/// Fatal errors that abort a clone run.
#[derive(Error, Debug)]
pub enum CloneError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Http(#[from] HttpError),

    /// Neither the role list nor the channel list of the source guild could
    /// be fetched, so there is nothing to clone.
    #[error("could not fetch roles or channels of source guild {0}")]
    SourceUnavailable(String),

    /// The caller cancelled the run.
    #[error("clone cancelled")]
    Cancelled,

    /// A message-copy task panicked or was aborted.
    #[error("message copy task failed: {0}")]
    Task(String),
}

/// Invalid options or environment.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// `messages_limit` must be positive when message copying is enabled.
    #[error("messages_limit must be greater than 0 when clone_messages is enabled")]
    ZeroMessagesLimit,

    /// Required environment variable is not set.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    /// An options file could not be read or parsed.
    #[error("invalid options file {path}: {message}")]
    OptionsFile { path: String, message: String },
}
