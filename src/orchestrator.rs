//! The clone state machine.
//!
//! ```text
//! Idle → Fetching → Resetting → CreatingRoles → CreatingChannels
//!      → CopyingMessages → Done
//! ```
//!
//! `Failed` is reachable from every state. Steps run strictly in sequence and
//! disabled steps are passed through without work. One orchestrator can run
//! many clones, one at a time; each run starts from zeroed counters and an
//! empty identity map.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::info;

use crate::cancel::CancelToken;
use crate::create::{create_categories, create_channels, create_roles, edit_guild};
use crate::error::CloneError;
use crate::fetch::{fetch_source, list_channels};
use crate::http::{Body, DiscordHttpClient, Route};
use crate::messages::{copy_messages, plan_jobs};
use crate::model::{CloneOptions, GuildSnapshot, IdentityMap};
use crate::progress::{Milestone, ProgressSchedule, ProgressTracker};
use crate::reset::{reset_channels, reset_roles};
use crate::rest::{Rest, RetryPolicy};
use crate::sink::{LogSink, Logger, ProgressCallback};
use crate::stats::{CloneStats, StatsTracker};
use crate::types::Guild;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CloneState {
    Idle = 0,
    Fetching = 1,
    Resetting = 2,
    CreatingRoles = 3,
    CreatingChannels = 4,
    CopyingMessages = 5,
    Done = 6,
    Failed = 7,
}

impl CloneState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Fetching,
            2 => Self::Resetting,
            3 => Self::CreatingRoles,
            4 => Self::CreatingChannels,
            5 => Self::CopyingMessages,
            6 => Self::Done,
            7 => Self::Failed,
            _ => Self::Idle,
        }
    }
}

impl fmt::Display for CloneState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

pub struct CloneOrchestrator {
    log: Logger,
    stats: Arc<StatsTracker>,
    cancel: CancelToken,
    policy: RetryPolicy,
    progress: Mutex<Option<ProgressCallback>>,
    state: AtomicU8,
    running: AtomicBool,
}

impl CloneOrchestrator {
    pub fn new(sink: Arc<dyn LogSink>) -> Self {
        Self {
            log: Logger::new(sink),
            stats: Arc::new(StatsTracker::new()),
            cancel: CancelToken::new(),
            policy: RetryPolicy::default(),
            progress: Mutex::new(None),
            state: AtomicU8::new(CloneState::Idle as u8),
            running: AtomicBool::new(false),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Register the progress sink used by subsequent runs.
    pub fn set_progress_callback(&self, callback: impl Fn(f64) + Send + Sync + 'static) {
        *self.progress.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(callback));
    }

    /// Safe to call while a run is in progress.
    pub fn get_stats(&self) -> CloneStats {
        self.stats.snapshot()
    }

    pub fn state(&self) -> CloneState {
        CloneState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Handle for cancelling the current run from another task.
    ///
    /// Cancelling while idle makes the next run fail before it touches
    /// either guild.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Read a guild's name and icon.
    pub async fn lookup_guild(
        &self,
        client: &DiscordHttpClient,
        guild_id: &str,
    ) -> Result<Option<GuildSnapshot>, CloneError> {
        let guild: Option<Guild> = self
            .rest(client)
            .call_json(
                &format!("fetching guild {}", guild_id),
                &Route::get_guild(guild_id),
                &Body::Empty,
            )
            .await?;
        Ok(guild.map(GuildSnapshot::from))
    }

    /// Clone `source` into `dest`. Returns `true` iff the run reached
    /// [`CloneState::Done`]; per-entity failures are reported in
    /// [`get_stats`](Self::get_stats) and do not make the run fail.
    pub async fn start_clone(
        &self,
        source: &GuildSnapshot,
        dest: &GuildSnapshot,
        client: &DiscordHttpClient,
        options: &CloneOptions,
    ) -> bool {
        if self.running.swap(true, Ordering::SeqCst) {
            self.log.error("A clone is already in progress");
            return false;
        }

        let result = self.run(source, dest, client, options).await;
        let done = match result {
            Ok(()) => {
                self.enter(CloneState::Done);
                self.log.info(format!(
                    "Cloning completed in {:.2} seconds",
                    self.stats.elapsed().as_secs_f64()
                ));
                true
            }
            Err(e) => {
                self.enter(CloneState::Failed);
                self.log.error(format!("Critical error during cloning: {}", e));
                false
            }
        };

        // Any pending cancel was consumed by this run.
        self.cancel.reset();
        self.running.store(false, Ordering::SeqCst);
        done
    }

    fn rest(&self, client: &DiscordHttpClient) -> Rest {
        Rest::new(
            client.clone(),
            Arc::clone(&self.stats),
            self.log.clone(),
            self.cancel.clone(),
            self.policy.clone(),
        )
    }

    fn enter(&self, state: CloneState) {
        info!(%state, "clone state");
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn progress_callback(&self) -> Option<ProgressCallback> {
        self.progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn run(
        &self,
        source: &GuildSnapshot,
        dest: &GuildSnapshot,
        client: &DiscordHttpClient,
        options: &CloneOptions,
    ) -> Result<(), CloneError> {
        self.stats.reset();
        options.validate()?;

        let rest = self.rest(client);
        let mut progress =
            ProgressTracker::new(ProgressSchedule::new(options), self.progress_callback());
        let mut ids = IdentityMap::new(&source.id, &dest.id);
        self.log.info(format!(
            "Starting clone of {} into {}",
            source.name, dest.name
        ));

        self.enter(CloneState::Fetching);
        let src = fetch_source(&rest, &source.id).await?;
        self.stats
            .set_totals(src.roles.len() as u64, src.total_channels() as u64);

        self.enter(CloneState::Resetting);
        if options.clone_name_icon {
            edit_guild(&rest, source, dest).await?;
            progress.complete(Milestone::GuildEdited);
        }
        if options.clone_roles {
            reset_roles(&rest, &dest.id).await?;
            progress.complete(Milestone::RolesDeleted);
        }
        if options.clones_channels() {
            reset_channels(&rest, &dest.id).await?;
            progress.complete(Milestone::ChannelsDeleted);
        }

        self.enter(CloneState::CreatingRoles);
        if options.clone_roles {
            create_roles(&rest, &dest.id, &src.roles, &mut ids).await?;
            progress.complete(Milestone::RolesCreated);
        }

        self.enter(CloneState::CreatingChannels);
        if options.clones_channels() {
            if options.clone_categories {
                create_categories(&rest, &dest.id, &src.categories, &mut ids).await?;
            }
            if options.clone_text_channels {
                create_channels(&rest, &dest.id, &src.text_channels, &mut ids).await?;
            }
            if options.clone_voice_channels {
                create_channels(&rest, &dest.id, &src.voice_channels, &mut ids).await?;
            }
            progress.complete(Milestone::ChannelsCreated);
        }

        self.enter(CloneState::CopyingMessages);
        if options.clone_messages {
            // Without freshly created text channels, fall back to the
            // destination's existing ones.
            let existing = if options.clone_text_channels {
                None
            } else {
                list_channels(&rest, &dest.id).await?
            };
            let jobs = plan_jobs(&src.text_channels, &ids, existing.as_deref(), rest.log());
            copy_messages(&rest, &jobs, options.messages_limit).await?;
            progress.complete(Milestone::MessagesCopied);
        }

        progress.finish();
        Ok(())
    }
}

impl fmt::Debug for CloneOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloneOrchestrator")
            .field("state", &self.state())
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}
