//! Live clone statistics.
//!
//! [`StatsTracker`] is shared between the orchestrator and the concurrent
//! message-copy tasks; every counter is an atomic so increments never need a
//! lock and [`StatsTracker::snapshot`] can run at any time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CloneStats {
    pub roles_created: u64,
    pub categories_created: u64,
    pub text_channels_created: u64,
    pub voice_channels_created: u64,
    pub messages_copied: u64,
    pub roles_deleted: u64,
    pub channels_deleted: u64,
    pub errors: u64,
    /// Non-everyone roles in the source guild.
    pub total_roles: u64,
    /// Categories, text and voice channels in the source guild.
    pub total_channels: u64,
    pub start_time: Option<DateTime<Utc>>,
    pub elapsed_time: Duration,
}

impl CloneStats {
    pub fn channels_created(&self) -> u64 {
        self.categories_created + self.text_channels_created + self.voice_channels_created
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    RolesCreated,
    CategoriesCreated,
    TextChannelsCreated,
    VoiceChannelsCreated,
    MessagesCopied,
    RolesDeleted,
    ChannelsDeleted,
    Errors,
}

#[derive(Debug, Default)]
pub struct StatsTracker {
    roles_created: AtomicU64,
    categories_created: AtomicU64,
    text_channels_created: AtomicU64,
    voice_channels_created: AtomicU64,
    messages_copied: AtomicU64,
    roles_deleted: AtomicU64,
    channels_deleted: AtomicU64,
    errors: AtomicU64,
    total_roles: AtomicU64,
    total_channels: AtomicU64,
    started: Mutex<Option<(Instant, DateTime<Utc>)>>,
}

impl StatsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn counter(&self, counter: Counter) -> &AtomicU64 {
        match counter {
            Counter::RolesCreated => &self.roles_created,
            Counter::CategoriesCreated => &self.categories_created,
            Counter::TextChannelsCreated => &self.text_channels_created,
            Counter::VoiceChannelsCreated => &self.voice_channels_created,
            Counter::MessagesCopied => &self.messages_copied,
            Counter::RolesDeleted => &self.roles_deleted,
            Counter::ChannelsDeleted => &self.channels_deleted,
            Counter::Errors => &self.errors,
        }
    }

    /// Increment `counter`, returning the new value.
    pub fn bump(&self, counter: Counter) -> u64 {
        self.counter(counter).fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_error(&self) -> u64 {
        self.bump(Counter::Errors)
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.counter(counter).load(Ordering::Relaxed)
    }

    pub fn set_totals(&self, roles: u64, channels: u64) {
        self.total_roles.store(roles, Ordering::Relaxed);
        self.total_channels.store(channels, Ordering::Relaxed);
    }

    pub fn total_roles(&self) -> u64 {
        self.total_roles.load(Ordering::Relaxed)
    }

    pub fn total_channels(&self) -> u64 {
        self.total_channels.load(Ordering::Relaxed)
    }

    /// Zero every counter and restart the clock.
    pub fn reset(&self) {
        for counter in [
            &self.roles_created,
            &self.categories_created,
            &self.text_channels_created,
            &self.voice_channels_created,
            &self.messages_copied,
            &self.roles_deleted,
            &self.channels_deleted,
            &self.errors,
            &self.total_roles,
            &self.total_channels,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        *self.started.lock().unwrap_or_else(PoisonError::into_inner) =
            Some((Instant::now(), Utc::now()));
    }

    /// Seconds since [`reset`](Self::reset), or zero before the first run.
    pub fn elapsed(&self) -> Duration {
        self.started
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .map(|(instant, _)| instant.elapsed())
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> CloneStats {
        let started = *self.started.lock().unwrap_or_else(PoisonError::into_inner);
        CloneStats {
            roles_created: self.get(Counter::RolesCreated),
            categories_created: self.get(Counter::CategoriesCreated),
            text_channels_created: self.get(Counter::TextChannelsCreated),
            voice_channels_created: self.get(Counter::VoiceChannelsCreated),
            messages_copied: self.get(Counter::MessagesCopied),
            roles_deleted: self.get(Counter::RolesDeleted),
            channels_deleted: self.get(Counter::ChannelsDeleted),
            errors: self.get(Counter::Errors),
            total_roles: self.total_roles(),
            total_channels: self.total_channels(),
            start_time: started.map(|(_, wall)| wall),
            elapsed_time: started
                .map(|(instant, _)| instant.elapsed())
                .unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    static_assertions::assert_impl_all!(StatsTracker: Send, Sync);

    #[test]
    fn snapshot_before_first_run_is_zeroed() {
        let stats = StatsTracker::new().snapshot();
        assert_eq!(stats, CloneStats::default());
        assert!(stats.start_time.is_none());
    }

    #[test]
    fn bump_returns_running_count() {
        let tracker = StatsTracker::new();
        assert_eq!(tracker.bump(Counter::RolesCreated), 1);
        assert_eq!(tracker.bump(Counter::RolesCreated), 2);
        assert_eq!(tracker.record_error(), 1);

        let stats = tracker.snapshot();
        assert_eq!(stats.roles_created, 2);
        assert_eq!(stats.errors, 1);
    }

    #[test]
    fn reset_zeroes_counters_and_starts_clock() {
        let tracker = StatsTracker::new();
        tracker.bump(Counter::MessagesCopied);
        tracker.set_totals(3, 4);
        tracker.reset();

        let stats = tracker.snapshot();
        assert_eq!(stats.messages_copied, 0);
        assert_eq!(stats.total_roles, 0);
        assert!(stats.start_time.is_some());
    }

    #[test]
    fn channels_created_sums_kinds() {
        let stats = CloneStats {
            categories_created: 1,
            text_channels_created: 2,
            voice_channels_created: 3,
            ..CloneStats::default()
        };
        assert_eq!(stats.channels_created(), 6);
    }

    #[test]
    fn concurrent_increments_are_not_lost() {
        let tracker = Arc::new(StatsTracker::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let t = Arc::clone(&tracker);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        t.bump(Counter::MessagesCopied);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(tracker.get(Counter::MessagesCopied), 4000);
    }
}
