//! Clone the structure of one Discord guild into another over the REST API.
//!
//! [`CloneOrchestrator::start_clone`] drives a run: it reads the source
//! guild's roles and channels, wipes the destination, recreates roles,
//! categories, text and voice channels with their permission overwrites
//! translated to the new ids, and optionally replays recent message history.
//!
//! The HTTP backend is injected through [`Transport`]; with the `io` feature
//! [`DiscordHttpClient::connect`] builds one on `reqwest`. Logs go to an
//! injected [`LogSink`] and progress to a callback, so the engine never
//! touches a UI.

pub mod cancel;
pub mod create;
pub mod error;
pub mod fetch;
pub mod http;
pub mod messages;
pub mod model;
pub mod orchestrator;
pub mod progress;
pub mod reset;
pub mod rest;
pub mod sink;
pub mod stats;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use cancel::CancelToken;
pub use error::{CloneError, ConfigError, HttpError};
pub use http::{ApiRequest, ApiResponse, ClientConfig, DiscordHttpClient, Transport};
pub use model::{CloneOptions, GuildSnapshot};
pub use orchestrator::{CloneOrchestrator, CloneState};
pub use rest::RetryPolicy;
pub use sink::{ChannelSink, CloneEvent, LogLevel, LogSink, NullSink};
pub use stats::CloneStats;

#[cfg(feature = "io")]
pub use http::ReqwestTransport;
