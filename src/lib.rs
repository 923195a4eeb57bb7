//! vault-sync: scheduled synchronization of a notes vault.
//!
//! The core runs an external sync script against a vault directory, either on
//! demand or on a recurring timer, and keeps cumulative statistics across
//! restarts.
//!
//! # Architecture
//!
//! - **Executor** ([`sync::executor`]): spawns `<interpreter> <script> <message>`
//!   with a timeout and classifies the result
//! - **Scheduler** ([`sync::scheduler`]): a single tokio task owning the timer,
//!   the overlap guard and all mutable state
//! - **Stats / status** ([`sync::stats`], [`sync::status`]): persisted
//!   counters and the read-only snapshot built from them
//! - **Settings** ([`config`]): the persisted JSON document and its store
//! - **Host bridge** ([`host`]): versioned JSON envelopes over stdin/stdout

pub mod app_dirs;
pub mod config;
pub mod error;
pub mod host;
pub mod notify;
pub mod sync;

pub use config::{JsonFileStore, MemoryStore, SettingsPatch, SettingsStore, SyncSettings};
pub use error::{Result, SyncError};
pub use notify::{Notice, NoticeKind, NotificationSink, TracingSink};
pub use sync::{
    SchedulerConfig, SchedulerHandle, StopPolicy, SyncOutcome, SyncScheduler, SyncStats,
    SyncStatus,
};
