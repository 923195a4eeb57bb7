//! Error types for vault-sync.

/// Top-level error type for the sync core.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The sync script did not finish within the configured timeout.
    #[error("sync script timeout after {timeout_ms}ms")]
    ScriptTimeout {
        /// Timeout that was exceeded, in milliseconds.
        timeout_ms: u64,
    },

    /// The sync script exited with a non-zero status.
    #[error("sync script exited with code {}: {stderr}", exit_code_label(.exit_code))]
    ScriptNonZeroExit {
        /// Exit code, `None` when the process was killed by a signal.
        exit_code: Option<i32>,
        /// Trimmed standard error output.
        stderr: String,
    },

    /// The sync script could not be started.
    #[error("cannot spawn sync script: {reason}")]
    ScriptSpawn {
        /// Underlying spawn failure.
        reason: String,
    },

    /// A configuration value was rejected.
    #[error("invalid {field}: {message}")]
    ConfigValidation {
        /// Name of the rejected field, as it appears in the settings document.
        field: &'static str,
        /// Why the value was rejected.
        message: String,
    },

    /// Settings document could not be read or written.
    #[error("config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A host command was malformed or missing a required field.
    #[error("invalid command: {0}")]
    Command(String),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),

    /// Scheduler lifecycle error (stopped, join failure).
    #[error("scheduler error: {0}")]
    Scheduler(String),
}

fn exit_code_label(code: &Option<i32>) -> String {
    code.map_or_else(|| "signal".to_owned(), |c| c.to_string())
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, SyncError>;
