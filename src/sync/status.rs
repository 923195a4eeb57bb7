//! Read-only status snapshot composed from settings, scheduler state and stats.

use crate::config::SyncSettings;
use crate::sync::scheduler::SchedulerState;
use crate::sync::stats::SyncStats;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Point-in-time view of the sync core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    pub auto_sync_enabled: bool,
    pub interval_minutes: u32,
    /// e.g. `"3 minutes ago"` or `"Never"`.
    pub time_since_last_sync: String,
    /// e.g. `"3m ago"`, for the status line.
    pub short_time_since_last_sync: String,
    pub total_syncs: u64,
    /// Script that will run on the next attempt.
    pub configured_command: String,
    pub sync_in_progress: bool,
    pub last_sync_time: Option<DateTime<Utc>>,
    /// Summary of the most recent attempt in this session.
    pub last_outcome: Option<String>,
}

/// Build a snapshot. Pure: no I/O, no locking.
#[must_use]
pub fn report(
    settings: &SyncSettings,
    state: &SchedulerState,
    stats: &SyncStats,
    now: DateTime<Utc>,
) -> SyncStatus {
    SyncStatus {
        auto_sync_enabled: state.enabled(),
        interval_minutes: state.interval_minutes(),
        time_since_last_sync: stats.time_since(now),
        short_time_since_last_sync: stats.short_time_since(now),
        total_syncs: stats.sync_count,
        configured_command: settings.sync_script.clone(),
        sync_in_progress: state.run_in_progress(),
        last_sync_time: stats.last_sync_time,
        last_outcome: state.last_outcome().map(|outcome| outcome.summary()),
    }
}

impl SyncStatus {
    /// Multi-line summary shown by the "view status" command.
    #[must_use]
    pub fn summary(&self) -> String {
        let auto = if self.auto_sync_enabled {
            format!("Enabled (every {} minutes)", self.interval_minutes)
        } else {
            "Disabled".to_owned()
        };
        format!(
            "Auto-sync: {auto}\nLast sync: {}\nTotal syncs: {}",
            self.time_since_last_sync, self.total_syncs
        )
    }

    /// Compact single line for a status bar.
    #[must_use]
    pub fn status_line(&self) -> String {
        let mode = if self.auto_sync_enabled {
            format!("Auto: {}m", self.interval_minutes)
        } else {
            "Manual".to_owned()
        };
        let running = if self.sync_in_progress { " | syncing" } else { "" };
        format!(
            "{mode} | {} | {}{running}",
            self.short_time_since_last_sync, self.total_syncs
        )
    }
}
