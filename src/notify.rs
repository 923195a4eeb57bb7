//! User-facing notices and the sink that displays them.
//!
//! The core only formats the text; showing it (toast, status bar, terminal)
//! is up to the [`NotificationSink`] supplied by the host.

use crate::sync::executor::SyncOutcome;
use serde::{Deserialize, Serialize};

/// What a notice is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    Started,
    Completed,
    NoChanges,
    Failed,
    Status,
    AutoEnabled,
    AutoDisabled,
    CounterReset,
}

/// A short-lived, human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub kind: NoticeKind,
    pub message: String,
    /// Suggested display time in milliseconds.
    pub display_ms: u64,
}

impl Notice {
    fn new(kind: NoticeKind, message: impl Into<String>, display_ms: u64) -> Self {
        Self {
            kind,
            message: message.into(),
            display_ms,
        }
    }

    #[must_use]
    pub fn sync_started() -> Self {
        Self::new(NoticeKind::Started, "Starting vault sync...", 2_000)
    }

    /// Completion or failure notice for a finished attempt.
    #[must_use]
    pub fn sync_finished(outcome: &SyncOutcome) -> Self {
        match outcome {
            SyncOutcome::Success {
                duration_secs,
                no_changes: true,
            } => Self::new(
                NoticeKind::NoChanges,
                format!("No changes to sync ({duration_secs:.1}s)"),
                2_000,
            ),
            SyncOutcome::Success { duration_secs, .. } => Self::new(
                NoticeKind::Completed,
                format!("Synced! ({duration_secs:.1}s)"),
                2_000,
            ),
            SyncOutcome::Failure { error_message } => Self::new(
                NoticeKind::Failed,
                format!("Sync failed: {error_message}"),
                3_000,
            ),
        }
    }

    #[must_use]
    pub fn status(summary: impl Into<String>) -> Self {
        Self::new(NoticeKind::Status, summary, 5_000)
    }

    #[must_use]
    pub fn auto_enabled(interval_minutes: u32) -> Self {
        Self::new(
            NoticeKind::AutoEnabled,
            format!("Auto-sync enabled (every {interval_minutes} minutes)"),
            3_000,
        )
    }

    #[must_use]
    pub fn auto_disabled() -> Self {
        Self::new(NoticeKind::AutoDisabled, "Auto-sync disabled", 2_000)
    }

    #[must_use]
    pub fn counter_reset() -> Self {
        Self::new(NoticeKind::CounterReset, "Counter reset", 5_000)
    }

    /// Start/completion/failure notices, which `showNotifications` can silence.
    #[must_use]
    pub fn is_sync_progress(&self) -> bool {
        matches!(
            self.kind,
            NoticeKind::Started | NoticeKind::Completed | NoticeKind::NoChanges | NoticeKind::Failed
        )
    }
}

/// Displays notices. Implementations must not block.
pub trait NotificationSink: Send + Sync + 'static {
    fn notify(&self, notice: &Notice);
}

/// Sink that writes notices to the tracing log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn notify(&self, notice: &Notice) {
        match notice.kind {
            NoticeKind::Failed => tracing::warn!(kind = ?notice.kind, "{}", notice.message),
            _ => tracing::info!(kind = ?notice.kind, "{}", notice.message),
        }
    }
}

/// Fan a notice out to several sinks.
impl NotificationSink for Vec<std::sync::Arc<dyn NotificationSink>> {
    fn notify(&self, notice: &Notice) {
        for sink in self {
            sink.notify(notice);
        }
    }
}
