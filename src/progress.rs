//! Milestone-based progress.
//!
//! Each pipeline milestone carries a fixed base weight. Milestones whose
//! option is off are dropped from the schedule, so the remaining weights add
//! up to the whole bar and the last enabled milestone lands on exactly 1.0.

use crate::model::CloneOptions;
use crate::sink::ProgressCallback;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Milestone {
    GuildEdited,
    RolesDeleted,
    ChannelsDeleted,
    RolesCreated,
    ChannelsCreated,
    MessagesCopied,
}

impl Milestone {
    pub const ALL: [Milestone; 6] = [
        Milestone::GuildEdited,
        Milestone::RolesDeleted,
        Milestone::ChannelsDeleted,
        Milestone::RolesCreated,
        Milestone::ChannelsCreated,
        Milestone::MessagesCopied,
    ];

    fn weight(self) -> u32 {
        match self {
            Milestone::GuildEdited => 1,
            Milestone::RolesDeleted => 1,
            Milestone::ChannelsDeleted => 1,
            Milestone::RolesCreated => 2,
            Milestone::ChannelsCreated => 4,
            Milestone::MessagesCopied => 3,
        }
    }

    fn enabled(self, options: &CloneOptions) -> bool {
        match self {
            Milestone::GuildEdited => options.clone_name_icon,
            Milestone::RolesDeleted | Milestone::RolesCreated => options.clone_roles,
            Milestone::ChannelsDeleted | Milestone::ChannelsCreated => options.clones_channels(),
            Milestone::MessagesCopied => options.clone_messages,
        }
    }
}

/// The milestones enabled for one run.
#[derive(Debug, Clone)]
pub struct ProgressSchedule {
    enabled: Vec<Milestone>,
    total_weight: u32,
}

impl ProgressSchedule {
    pub fn new(options: &CloneOptions) -> Self {
        let enabled: Vec<Milestone> = Milestone::ALL
            .into_iter()
            .filter(|m| m.enabled(options))
            .collect();
        let total_weight = enabled.iter().map(|m| m.weight()).sum();
        Self {
            enabled,
            total_weight,
        }
    }

    pub fn contains(&self, milestone: Milestone) -> bool {
        self.enabled.contains(&milestone)
    }

    pub fn len(&self) -> usize {
        self.enabled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.enabled.is_empty()
    }
}

/// Converts milestone completions into non-decreasing progress values and
/// pushes them to the sink.
pub struct ProgressTracker {
    schedule: ProgressSchedule,
    completed: Vec<Milestone>,
    done_weight: u32,
    last: f64,
    sink: Option<ProgressCallback>,
}

impl ProgressTracker {
    pub fn new(schedule: ProgressSchedule, sink: Option<ProgressCallback>) -> Self {
        Self {
            schedule,
            completed: Vec::new(),
            done_weight: 0,
            last: 0.0,
            sink,
        }
    }

    /// Mark `milestone` done. Milestones outside the schedule, or already
    /// completed, are ignored and produce no callback.
    pub fn complete(&mut self, milestone: Milestone) -> Option<f64> {
        if !self.schedule.contains(milestone) || self.completed.contains(&milestone) {
            return None;
        }
        self.completed.push(milestone);
        self.done_weight += milestone.weight();

        let value = if self.completed.len() == self.schedule.len() {
            1.0
        } else {
            f64::from(self.done_weight) / f64::from(self.schedule.total_weight)
        };
        Some(self.emit(value))
    }

    /// Report 1.0 if it hasn't been reported yet (e.g. nothing was enabled).
    pub fn finish(&mut self) {
        if self.last < 1.0 {
            self.emit(1.0);
        }
    }

    pub fn value(&self) -> f64 {
        self.last
    }

    fn emit(&mut self, value: f64) -> f64 {
        let value = value.clamp(self.last, 1.0);
        self.last = value;
        if let Some(sink) = &self.sink {
            sink(value);
        }
        value
    }
}
