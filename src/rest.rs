//! The rate-limited REST operation every component is built on.
//!
//! [`Rest::call`] runs one logical operation to completion:
//!
//! - **429**: sleep for `retry_after` and resend the same request. Not an
//!   error, no retry cap; only cancellation ends the loop.
//! - **other non-2xx**: count, log with status and entity, return `None`.
//! - **transport failure**: count, log, wait out the sequence backoff
//!   (which grows per consecutive failure and resets on success), return
//!   `None`.
//!
//! A `None` result means "skip this entity"; fatal conditions (cancellation,
//! undecodable success bodies) come back as `Err`.

use std::sync::Arc;
use std::time::Duration;

use async_lock::Mutex;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::cancel::CancelToken;
use crate::error::{CloneError, HttpError};
use crate::http::{Attempt, Body, DiscordHttpClient, Failure, Route};
use crate::sink::Logger;
use crate::stats::StatsTracker;

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Timing knobs for REST calls.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Pause after every write.
    pub write_delay: Duration,
    /// First wait after a transport failure.
    pub transport_backoff_base: Duration,
    /// Growth per consecutive transport failure.
    pub transport_backoff_factor: f64,
    pub transport_backoff_max: Duration,
    /// Ceiling for a single 429 wait.
    pub max_rate_limit_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            write_delay: Duration::from_millis(500),
            transport_backoff_base: Duration::from_secs(1),
            transport_backoff_factor: 2.0,
            transport_backoff_max: Duration::from_secs(30),
            max_rate_limit_wait: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// No write pacing. Backoff still applies.
    pub fn unpaced() -> Self {
        Self {
            write_delay: Duration::ZERO,
            ..Self::default()
        }
    }
}

/// Exponential backoff across one logical sequence of calls.
#[derive(Debug, Clone)]
struct SequenceBackoff {
    base: Duration,
    factor: f64,
    max: Duration,
    current: Option<Duration>,
}

impl SequenceBackoff {
    fn new(policy: &RetryPolicy) -> Self {
        Self {
            base: policy.transport_backoff_base,
            factor: policy.transport_backoff_factor,
            max: policy.transport_backoff_max,
            current: None,
        }
    }

    /// Record a failure and return how long to wait.
    fn fail(&mut self) -> Duration {
        let next = match self.current {
            None => self.base,
            Some(prev) => prev.mul_f64(self.factor),
        }
        .min(self.max);
        self.current = Some(next);
        next
    }

    fn succeed(&mut self) {
        self.current = None;
    }
}

// ---------------------------------------------------------------------------
// Rest
// ---------------------------------------------------------------------------

/// Shared context for one clone run: client, counters, log sink and
/// cancellation. Cheap to clone; clones share the backoff sequence, while
/// [`sequence`](Self::sequence) starts a fresh one.
#[derive(Clone)]
pub struct Rest {
    client: DiscordHttpClient,
    stats: Arc<StatsTracker>,
    log: Logger,
    cancel: CancelToken,
    policy: RetryPolicy,
    backoff: Arc<Mutex<SequenceBackoff>>,
}

impl Rest {
    pub fn new(
        client: DiscordHttpClient,
        stats: Arc<StatsTracker>,
        log: Logger,
        cancel: CancelToken,
        policy: RetryPolicy,
    ) -> Self {
        let backoff = Arc::new(Mutex::new(SequenceBackoff::new(&policy)));
        Self {
            client,
            stats,
            log,
            cancel,
            policy,
            backoff,
        }
    }

    /// Same context, independent backoff sequence.
    pub fn sequence(&self) -> Self {
        Self {
            backoff: Arc::new(Mutex::new(SequenceBackoff::new(&self.policy))),
            ..self.clone()
        }
    }

    pub fn stats(&self) -> &StatsTracker {
        &self.stats
    }

    pub fn log(&self) -> &Logger {
        &self.log
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Run `route` until it succeeds or fails for a reason other than 429.
    ///
    /// `what` describes the entity for log lines, e.g. `"creating role Admin"`.
    pub async fn call(
        &self,
        what: &str,
        route: &Route,
        body: &Body,
    ) -> Result<Option<Vec<u8>>, CloneError> {
        loop {
            self.cancel.check()?;

            match self.client.attempt(route, body, &self.cancel).await? {
                Attempt::Success(bytes) => {
                    self.backoff.lock().await.succeed();
                    return Ok(Some(bytes));
                }
                Attempt::RateLimited {
                    retry_after,
                    global,
                } => {
                    let wait = retry_after.min(self.policy.max_rate_limit_wait);
                    self.log.warn(format!(
                        "Rate limited while {}, retrying in {:.2}s{}",
                        what,
                        wait.as_secs_f64(),
                        if global { " (global)" } else { "" }
                    ));
                    self.cancel.sleep(wait).await?;
                }
                Attempt::Failed(failure @ Failure::Status { .. }) => {
                    self.stats.record_error();
                    self.log.error(format!("Error {}: {}", what, failure));
                    return Ok(None);
                }
                Attempt::Failed(failure @ Failure::Transport(_)) => {
                    self.stats.record_error();
                    let wait = self.backoff.lock().await.fail();
                    self.log.error(format!(
                        "Error {}: {} (backing off {:.1}s)",
                        what,
                        failure,
                        wait.as_secs_f64()
                    ));
                    self.cancel.sleep(wait).await?;
                    return Ok(None);
                }
            }
        }
    }

    /// [`call`](Self::call), decoding a successful body as JSON.
    ///
    /// A 2xx body that does not decode is fatal: the remote contract was
    /// broken and nothing downstream can be trusted.
    pub async fn call_json<T: DeserializeOwned>(
        &self,
        what: &str,
        route: &Route,
        body: &Body,
    ) -> Result<Option<T>, CloneError> {
        let Some(bytes) = self.call(what, route, body).await? else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes).map(Some).map_err(|e| {
            let raw = String::from_utf8_lossy(&bytes);
            CloneError::Http(HttpError::Decode {
                route: route.key.clone(),
                message: format!("{}: {}", e, &raw[..floor_char_boundary(&raw, 200)]),
            })
        })
    }

    /// Wait out the write delay.
    pub async fn pace(&self) -> Result<(), CloneError> {
        self.pause(self.policy.write_delay).await
    }

    /// Cancellable sleep.
    pub async fn pause(&self, duration: Duration) -> Result<(), CloneError> {
        if duration.is_zero() {
            return self.cancel.check();
        }
        debug!(delay_ms = duration.as_millis() as u64, "pausing");
        self.cancel.sleep(duration).await
    }
}

/// Largest index `<= max` that is a char boundary of `s`.
fn floor_char_boundary(s: &str, max: usize) -> usize {
    if max >= s.len() {
        return s.len();
    }
    (0..=max).rev().find(|&i| s.is_char_boundary(i)).unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::LogLevel;
    use crate::testing::{Fault, FakeDiscord};
    use crate::types::Role;

    fn rest(fake: &Arc<FakeDiscord>) -> Rest {
        fake.rest(RetryPolicy::unpaced())
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_is_retried_without_counting() {
        let fake = FakeDiscord::new();
        fake.add_guild("1", "Guild");
        fake.inject(Fault::rate_limit("GET", "/guilds/1/roles", 1, 2.0));
        let rest = rest(&fake);

        let roles: Option<Vec<Role>> = rest
            .call_json("listing roles", &Route::get_roles("1"), &Body::Empty)
            .await
            .unwrap();
        assert!(roles.is_some());
        assert_eq!(rest.stats().snapshot().errors, 0);
        assert_eq!(fake.count_calls("GET", "/guilds/1/roles"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn status_failure_counts_and_skips() {
        let fake = FakeDiscord::new();
        fake.add_guild("1", "Guild");
        fake.inject(Fault::status("GET", "/guilds/1/roles", 1, 500));
        let rest = rest(&fake);

        let out = rest
            .call("listing roles", &Route::get_roles("1"), &Body::Empty)
            .await
            .unwrap();
        assert!(out.is_none());
        assert_eq!(rest.stats().snapshot().errors, 1);
        assert!(fake.has_log(LogLevel::Error, "HTTP 500"));
    }

    #[test]
    fn backoff_grows_caps_and_resets() {
        let policy = RetryPolicy {
            transport_backoff_base: Duration::from_secs(1),
            transport_backoff_factor: 2.0,
            transport_backoff_max: Duration::from_secs(5),
            ..RetryPolicy::default()
        };
        let mut backoff = SequenceBackoff::new(&policy);
        assert_eq!(backoff.fail(), Duration::from_secs(1));
        assert_eq!(backoff.fail(), Duration::from_secs(2));
        assert_eq!(backoff.fail(), Duration::from_secs(4));
        assert_eq!(backoff.fail(), Duration::from_secs(5));
        backoff.succeed();
        assert_eq!(backoff.fail(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn transport_failures_back_off_within_a_sequence() {
        let fake = FakeDiscord::new();
        fake.add_guild("1", "Guild");
        fake.inject(Fault::transport("GET", "/guilds/1", 1));
        fake.inject(Fault::transport("GET", "/guilds/1", 2));
        let rest = rest(&fake);
        let route = Route::get_guild("1");

        let start = tokio::time::Instant::now();
        assert!(rest.call("a", &route, &Body::Empty).await.unwrap().is_none());
        assert!(rest.call("b", &route, &Body::Empty).await.unwrap().is_none());
        // 1s + 2s of backoff
        assert!(start.elapsed() >= Duration::from_secs(3));
        assert!(rest.call("c", &route, &Body::Empty).await.unwrap().is_some());
        assert_eq!(rest.stats().snapshot().errors, 2);

        // A fresh sequence starts at the base delay again.
        let other = rest.sequence();
        assert_eq!(other.backoff.lock().await.fail(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_call_is_fatal() {
        let fake = FakeDiscord::new();
        fake.add_guild("1", "Guild");
        let rest = rest(&fake);
        rest.cancel_token().cancel();
        let result = rest
            .call("listing roles", &Route::get_roles("1"), &Body::Empty)
            .await;
        assert!(matches!(result, Err(CloneError::Cancelled)));
        assert_eq!(fake.count_calls("GET", "/guilds/1/roles"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn undecodable_success_body_is_fatal() {
        let fake = FakeDiscord::new();
        fake.add_guild("1", "Guild");
        fake.inject(Fault::body("GET", "/guilds/1/roles", 1, "{not json"));
        let rest = rest(&fake);
        let result: Result<Option<Vec<Role>>, _> = rest
            .call_json("listing roles", &Route::get_roles("1"), &Body::Empty)
            .await;
        assert!(matches!(
            result,
            Err(CloneError::Http(HttpError::Decode { .. }))
        ));
    }

    #[test]
    fn char_boundary_never_splits_code_points() {
        let s = "aé";
        assert_eq!(floor_char_boundary(s, 2), 1);
        assert_eq!(floor_char_boundary(s, 10), 3);
    }
}
