//! Sync core: script execution, scheduling, counters and status.

pub mod executor;
pub mod scheduler;
pub mod stats;
pub mod status;

pub use executor::{ScriptExecutor, SyncExecutor, SyncOutcome, SyncRequest};
pub use scheduler::{
    SchedulerConfig, SchedulerHandle, StopPolicy, SyncCompleted, SyncOrigin, SyncScheduler,
};
pub use stats::SyncStats;
pub use status::SyncStatus;
