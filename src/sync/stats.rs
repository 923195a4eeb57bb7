//! Cumulative sync counters persisted across restarts.

use crate::sync::executor::SyncOutcome;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Persisted counters. Lives in the same document as the settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncStats {
    /// Completion time of the most recent recorded attempt.
    pub last_sync_time: Option<DateTime<Utc>>,
    /// Number of recorded attempts since the last reset.
    pub sync_count: u64,
}

impl SyncStats {
    /// Record one completed attempt.
    ///
    /// The outcome is accepted for the benefit of callers that filter on it;
    /// every call counts.
    pub fn record_attempt(&mut self, _outcome: &SyncOutcome, completed_at: DateTime<Utc>) {
        self.last_sync_time = Some(completed_at);
        self.sync_count = self.sync_count.saturating_add(1);
    }

    /// Zero the counter. The last sync time is kept.
    pub fn reset(&mut self) {
        self.sync_count = 0;
    }

    /// Human-readable age of the last sync, e.g. `"3 minutes ago"`.
    #[must_use]
    pub fn time_since(&self, now: DateTime<Utc>) -> String {
        let Some(minutes) = self.minutes_since(now) else {
            return "Never".to_owned();
        };
        if minutes < 1 {
            return "Just now".to_owned();
        }
        if minutes < 60 {
            return format!("{minutes} minutes ago");
        }
        let hours = minutes / 60;
        if hours < 24 {
            return format!("{hours} hours ago");
        }
        format!("{} days ago", hours / 24)
    }

    /// Compact age used in the status line, e.g. `"3m ago"`.
    #[must_use]
    pub fn short_time_since(&self, now: DateTime<Utc>) -> String {
        match self.minutes_since(now) {
            None => "Never".to_owned(),
            Some(m) if m < 1 => "Just now".to_owned(),
            Some(m) if m < 60 => format!("{m}m ago"),
            Some(m) => format!("{}h ago", m / 60),
        }
    }

    /// Whole minutes since the last sync; a timestamp in the future counts as zero.
    fn minutes_since(&self, now: DateTime<Utc>) -> Option<i64> {
        self.last_sync_time
            .map(|last| now.signed_duration_since(last).num_minutes().max(0))
    }
}
