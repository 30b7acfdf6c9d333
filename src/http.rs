//! Transport-abstracted HTTP client for the Discord REST API.
//!
//! All outbound calls go through [`DiscordHttpClient::attempt`] so that auth
//! headers, bucket rate limiting and response classification live in one
//! place. The wire transport is the injected [`Transport`] trait; swapping
//! HTTP backends (or stubbing them in tests) only touches that seam.
//!
//! `attempt` performs exactly one request and classifies the outcome as an
//! [`Attempt`]. Retrying on 429 and counting failures is the job of
//! [`crate::rest::Rest`].

use async_lock::Mutex;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::error::{CloneError, HttpError};
use crate::types::RateLimitBody;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

pub const BASE_URL: &str = "https://discord.com/api/v10";
const USER_AGENT: &str = "GuildCloner (https://github.com/guild-cloner/guild-cloner, 0.1)";

/// Longest pre-emptive bucket wait.
const MAX_BUCKET_WAIT: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Requests and responses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request body.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Empty,
    Json(serde_json::Value),
    /// Pre-encoded body (multipart uploads).
    Raw {
        content_type: String,
        bytes: Vec<u8>,
    },
}

impl Body {
    pub fn json<T: serde::Serialize>(value: &T) -> Result<Self, HttpError> {
        serde_json::to_value(value)
            .map(Body::Json)
            .map_err(|e| HttpError::Decode {
                route: "request body".to_string(),
                message: e.to_string(),
            })
    }

    /// A `multipart/form-data` body with a `payload_json` part and one
    /// `files[n]` part per file.
    pub fn multipart(payload_json: &str, files: &[(String, Vec<u8>)]) -> Self {
        let boundary = format!("GuildClonerBoundary{:016x}", rand::random::<u64>());
        let bytes = build_multipart(&boundary, payload_json, files);
        Body::Raw {
            content_type: format!("multipart/form-data; boundary={}", boundary),
            bytes,
        }
    }
}

/// Where a request goes, plus the template key used for bucket tracking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub method: HttpMethod,
    target: Target,
    /// Template like `POST /guilds/{guild_id}/roles`.
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Target {
    /// Path relative to the API base URL.
    Api(String),
    /// Absolute URL (CDN downloads). Sent without credentials.
    Absolute(String),
}

impl Route {
    fn api(method: HttpMethod, path: String, key: String) -> Self {
        Self {
            method,
            target: Target::Api(path),
            key,
        }
    }

    pub fn get_guild(guild_id: &str) -> Self {
        Self::api(
            HttpMethod::Get,
            format!("guilds/{}", guild_id),
            format!("GET /guilds/{}", guild_id),
        )
    }

    pub fn edit_guild(guild_id: &str) -> Self {
        Self::api(
            HttpMethod::Patch,
            format!("guilds/{}", guild_id),
            format!("PATCH /guilds/{}", guild_id),
        )
    }

    pub fn get_roles(guild_id: &str) -> Self {
        Self::api(
            HttpMethod::Get,
            format!("guilds/{}/roles", guild_id),
            format!("GET /guilds/{}/roles", guild_id),
        )
    }

    pub fn create_role(guild_id: &str) -> Self {
        Self::api(
            HttpMethod::Post,
            format!("guilds/{}/roles", guild_id),
            format!("POST /guilds/{}/roles", guild_id),
        )
    }

    pub fn delete_role(guild_id: &str, role_id: &str) -> Self {
        Self::api(
            HttpMethod::Delete,
            format!("guilds/{}/roles/{}", guild_id, role_id),
            format!("DELETE /guilds/{}/roles", guild_id),
        )
    }

    pub fn get_channels(guild_id: &str) -> Self {
        Self::api(
            HttpMethod::Get,
            format!("guilds/{}/channels", guild_id),
            format!("GET /guilds/{}/channels", guild_id),
        )
    }

    pub fn create_channel(guild_id: &str) -> Self {
        Self::api(
            HttpMethod::Post,
            format!("guilds/{}/channels", guild_id),
            format!("POST /guilds/{}/channels", guild_id),
        )
    }

    pub fn delete_channel(channel_id: &str) -> Self {
        Self::api(
            HttpMethod::Delete,
            format!("channels/{}", channel_id),
            format!("DELETE /channels/{}", channel_id),
        )
    }

    /// `query` is appended as a query string (e.g. `limit=100&before=1234`).
    pub fn get_messages(channel_id: &str, query: &str) -> Self {
        Self::api(
            HttpMethod::Get,
            format!("channels/{}/messages?{}", channel_id, query),
            format!("GET /channels/{}/messages", channel_id),
        )
    }

    pub fn create_message(channel_id: &str) -> Self {
        Self::api(
            HttpMethod::Post,
            format!("channels/{}/messages", channel_id),
            format!("POST /channels/{}/messages", channel_id),
        )
    }

    /// Raw bytes of an attachment or icon.
    pub fn download(url: &str) -> Self {
        Self {
            method: HttpMethod::Get,
            target: Target::Absolute(url.to_string()),
            key: "GET cdn".to_string(),
        }
    }

    fn url(&self, base_url: &str) -> String {
        match &self.target {
            Target::Api(path) => format!(
                "{}/{}",
                base_url.trim_end_matches('/'),
                path.trim_start_matches('/')
            ),
            Target::Absolute(url) => url.clone(),
        }
    }

    fn authenticated(&self) -> bool {
        matches!(self.target, Target::Api(_))
    }
}

/// A fully built request handed to the [`Transport`].
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Body,
}

/// A raw response. Header names are lowercase.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl ApiResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// The injected wire capability. Errors are transport-level only: every
/// HTTP status, including 4xx/5xx, is an `Ok` response.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, HttpError>;
}

// ---------------------------------------------------------------------------
// Attempt classification
// ---------------------------------------------------------------------------

/// Outcome of a single request.
#[derive(Debug, Clone, PartialEq)]
pub enum Attempt {
    Success(Vec<u8>),
    RateLimited { retry_after: Duration, global: bool },
    Failed(Failure),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Failure {
    /// Non-2xx, non-429 status.
    Status { status: u16, body: String },
    /// The request never produced a response.
    Transport(String),
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::Status { status, body } => write!(f, "HTTP {}: {}", status, body),
            Failure::Transport(e) => write!(f, "transport error: {}", e),
        }
    }
}

/// Seconds to wait for a 429, from the body, then the `retry-after` header,
/// then a one second default.
fn retry_after(response: &ApiResponse) -> (Duration, bool) {
    if let Ok(body) = serde_json::from_slice::<RateLimitBody>(&response.body) {
        let global = body.global
            || response
                .header("x-ratelimit-global")
                .is_some_and(|v| v == "true");
        return (secs(body.retry_after), global);
    }
    let header = response
        .header("retry-after")
        .and_then(|s| s.parse::<f64>().ok())
        .unwrap_or(1.0);
    (secs(header), false)
}

fn secs(value: f64) -> Duration {
    Duration::from_secs_f64(value.max(0.0))
}

// ---------------------------------------------------------------------------
// Rate-limit tracker (per-bucket)
// ---------------------------------------------------------------------------

/// Rate-limit metadata extracted from response headers.
#[derive(Debug, Clone, Default)]
struct RateLimitInfo {
    remaining: Option<u32>,
    reset_after: Option<f64>,
    bucket: Option<String>,
    is_global: bool,
}

fn parse_rate_limit_headers(response: &ApiResponse) -> RateLimitInfo {
    RateLimitInfo {
        remaining: response
            .header("x-ratelimit-remaining")
            .and_then(|s| s.parse::<u32>().ok()),
        reset_after: response
            .header("x-ratelimit-reset-after")
            .and_then(|s| s.parse::<f64>().ok()),
        bucket: response.header("x-ratelimit-bucket").map(str::to_string),
        is_global: response
            .header("x-ratelimit-global")
            .is_some_and(|s| s == "true"),
    }
}

#[derive(Debug, Clone)]
struct BucketState {
    remaining: u32,
    resets_at: Instant,
}

#[derive(Debug, Clone, Default)]
struct RateLimiter {
    /// Route-key → bucket id mapping.
    route_buckets: HashMap<String, String>,
    /// Bucket id → state.
    buckets: HashMap<String, BucketState>,
    /// Global rate-limit: if set, no requests may be sent until this instant.
    global_until: Option<Instant>,
}

impl RateLimiter {
    /// Returns how long we should wait before sending a request on `route_key`,
    /// or `None` if we can send immediately.
    fn delay_for(&self, route_key: &str) -> Option<Duration> {
        let now = Instant::now();
        if let Some(until) = self.global_until {
            if until > now {
                return Some(until - now);
            }
        }

        let bucket_id = self.route_buckets.get(route_key)?;
        let state = self.buckets.get(bucket_id)?;
        if state.remaining == 0 && state.resets_at > now {
            return Some(state.resets_at - now);
        }
        None
    }

    fn update(&mut self, route_key: &str, info: &RateLimitInfo) {
        let Some(ref bucket) = info.bucket else {
            return;
        };
        self.route_buckets
            .insert(route_key.to_string(), bucket.clone());

        let reset_after = info.reset_after.unwrap_or(1.0);
        self.buckets.insert(
            bucket.clone(),
            BucketState {
                remaining: info.remaining.unwrap_or(1),
                resets_at: Instant::now() + secs(reset_after),
            },
        );
    }

    fn block_globally(&mut self, delay: Duration) {
        self.global_until = Some(Instant::now() + delay);
    }
}

// ---------------------------------------------------------------------------
// DiscordHttpClient
// ---------------------------------------------------------------------------

/// Credentials and endpoint for a [`DiscordHttpClient`].
#[derive(Clone)]
pub struct ClientConfig {
    pub token: String,
    /// Prefix the token with `Bot `. User tokens are passed through as-is.
    pub bot: bool,
    pub base_url: String,
    pub user_agent: String,
}

impl ClientConfig {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            bot: false,
            base_url: BASE_URL.to_string(),
            user_agent: USER_AGENT.to_string(),
        }
    }

    pub fn bot(mut self, bot: bool) -> Self {
        self.bot = bot;
        self
    }

    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn authorization(&self) -> String {
        if self.bot {
            format!("Bot {}", self.token)
        } else {
            self.token.clone()
        }
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("token", &"<redacted>")
            .field("bot", &self.bot)
            .field("base_url", &self.base_url)
            .finish()
    }
}

/// A rate-limit aware client for the Discord REST API.
///
/// Cheap to clone (internals are behind `Arc`). The underlying connection
/// pool is released when the last clone is dropped.
#[derive(Clone)]
pub struct DiscordHttpClient {
    config: Arc<ClientConfig>,
    transport: Arc<dyn Transport>,
    limiter: Arc<Mutex<RateLimiter>>,
}

impl DiscordHttpClient {
    pub fn new(config: ClientConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            config: Arc::new(config),
            transport,
            limiter: Arc::new(Mutex::new(RateLimiter::default())),
        }
    }

    /// A client backed by [`ReqwestTransport`].
    #[cfg(feature = "io")]
    pub fn connect(config: ClientConfig) -> Result<Self, HttpError> {
        let transport = ReqwestTransport::new(&config.user_agent)?;
        Ok(Self::new(config, Arc::new(transport)))
    }

    fn build_request(&self, route: &Route, body: &Body) -> ApiRequest {
        let mut headers = vec![("user-agent".to_string(), self.config.user_agent.clone())];
        if route.authenticated() {
            headers.push(("authorization".to_string(), self.config.authorization()));
        }
        ApiRequest {
            method: route.method,
            url: route.url(&self.config.base_url),
            headers,
            body: body.clone(),
        }
    }

    /// Send one request on `route` and classify the response.
    ///
    /// Waits first if the route's bucket (or the global limit) is exhausted.
    /// That wait ends early with `Err(Cancelled)` when `cancel` fires.
    pub async fn attempt(
        &self,
        route: &Route,
        body: &Body,
        cancel: &CancelToken,
    ) -> Result<Attempt, CloneError> {
        let delay = self.limiter.lock().await.delay_for(&route.key);
        if let Some(delay) = delay {
            let delay = delay.min(MAX_BUCKET_WAIT);
            debug!(
                route = %route.key,
                delay_ms = delay.as_millis() as u64,
                "rate-limit pre-emptive backoff"
            );
            cancel.sleep(delay).await?;
        }

        let request = self.build_request(route, body);
        let response = match self.transport.send(request).await {
            Ok(response) => response,
            Err(e) => return Ok(Attempt::Failed(Failure::Transport(e.to_string()))),
        };

        let info = parse_rate_limit_headers(&response);
        self.limiter.lock().await.update(&route.key, &info);

        if response.status == 429 {
            let (retry_after, global) = retry_after(&response);
            let global = global || info.is_global;
            warn!(
                route = %route.key,
                retry_after_s = retry_after.as_secs_f64(),
                global,
                "rate-limited by Discord"
            );
            if global {
                self.limiter.lock().await.block_globally(retry_after);
            }
            return Ok(Attempt::RateLimited {
                retry_after,
                global,
            });
        }

        if response.is_success() {
            return Ok(Attempt::Success(response.body));
        }

        Ok(Attempt::Failed(Failure::Status {
            status: response.status,
            body: String::from_utf8_lossy(&response.body).to_string(),
        }))
    }
}

impl fmt::Debug for DiscordHttpClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiscordHttpClient")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// reqwest transport
// ---------------------------------------------------------------------------

#[cfg(feature = "io")]
pub use self::reqwest_transport::ReqwestTransport;

#[cfg(feature = "io")]
mod reqwest_transport {
    use super::*;

    /// [`Transport`] over a shared `reqwest::Client`.
    #[derive(Debug, Clone)]
    pub struct ReqwestTransport {
        client: reqwest::Client,
    }

    impl ReqwestTransport {
        pub fn new(user_agent: &str) -> Result<Self, HttpError> {
            let client = reqwest::Client::builder()
                .user_agent(user_agent)
                .timeout(Duration::from_secs(30))
                .build()
                .map_err(|e| HttpError::Build(e.to_string()))?;
            Ok(Self { client })
        }
    }

    fn method(method: HttpMethod) -> reqwest::Method {
        match method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
        }
    }

    #[async_trait]
    impl Transport for ReqwestTransport {
        async fn send(&self, request: ApiRequest) -> Result<ApiResponse, HttpError> {
            let mut builder = self.client.request(method(request.method), &request.url);
            for (name, value) in &request.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            builder = match request.body {
                Body::Empty => builder,
                Body::Json(value) => builder
                    .header("content-type", "application/json")
                    .body(value.to_string()),
                Body::Raw {
                    content_type,
                    bytes,
                } => builder.header("content-type", content_type).body(bytes),
            };

            let response = builder
                .send()
                .await
                .map_err(|e| HttpError::Transport(e.to_string()))?;

            let status = response.status().as_u16();
            let headers = response
                .headers()
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
                })
                .collect();
            let body = response
                .bytes()
                .await
                .map_err(|e| HttpError::Transport(e.to_string()))?
                .to_vec();

            Ok(ApiResponse {
                status,
                headers,
                body,
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Build a multipart/form-data body as raw bytes.
///
/// Produces a `payload_json` text part followed by one `files[n]` part per
/// file, in order.
fn build_multipart(boundary: &str, payload_json: &str, files: &[(String, Vec<u8>)]) -> Vec<u8> {
    let mut buf: Vec<u8> = Vec::new();

    buf.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
    buf.extend_from_slice(b"Content-Disposition: form-data; name=\"payload_json\"\r\n");
    buf.extend_from_slice(b"Content-Type: application/json\r\n\r\n");
    buf.extend_from_slice(payload_json.as_bytes());
    buf.extend_from_slice(b"\r\n");

    for (index, (filename, data)) in files.iter().enumerate() {
        let filename = filename.replace('"', "_");
        buf.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
        buf.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"files[{}]\"; filename=\"{}\"\r\n",
                index, filename
            )
            .as_bytes(),
        );
        buf.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
        buf.extend_from_slice(data);
        buf.extend_from_slice(b"\r\n");
    }

    buf.extend_from_slice(format!("--{}--\r\n", boundary).as_bytes());
    buf
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
