//! Runs the external sync script once, with a timeout, and classifies the result.

use crate::config::SyncSettings;
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tracing::{debug, warn};

/// Printed by the sync script when there was nothing to commit.
pub const NO_CHANGES_SENTINEL: &str = "No changes to commit";

/// Maximum number of characters of script output kept in an error message.
const MAX_ERROR_OUTPUT_CHARS: usize = 2_000;

/// Classified result of one sync attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SyncOutcome {
    /// Script exited 0.
    Success {
        /// Wall-clock duration of the attempt.
        duration_secs: f64,
        /// Script reported that there was nothing to sync.
        no_changes: bool,
    },
    /// Script failed, timed out, or could not be started.
    Failure {
        /// Underlying error text.
        error_message: String,
    },
}

impl SyncOutcome {
    /// Classify a finished script run.
    #[must_use]
    pub fn from_result(result: Result<ScriptOutput>, elapsed: Duration) -> Self {
        match result {
            Ok(output) => Self::Success {
                duration_secs: elapsed.as_secs_f64(),
                no_changes: output.stdout.contains(NO_CHANGES_SENTINEL),
            },
            Err(e) => Self::Failure {
                error_message: e.to_string(),
            },
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// One-line description for logs and status snapshots.
    #[must_use]
    pub fn summary(&self) -> String {
        match self {
            Self::Success {
                duration_secs,
                no_changes: true,
            } => format!("no changes ({duration_secs:.1}s)"),
            Self::Success { duration_secs, .. } => format!("synced ({duration_secs:.1}s)"),
            Self::Failure { error_message } => format!("failed: {error_message}"),
        }
    }
}

/// Fully resolved input of one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRequest {
    /// Vault root; the script runs with this as its working directory.
    pub working_dir: PathBuf,
    /// Program that runs the script, e.g. `bash`.
    pub interpreter: String,
    /// Script path, relative to `working_dir` unless absolute.
    pub script: String,
    /// Commit message passed as the script's only argument.
    pub message: String,
    pub timeout: Duration,
}

impl SyncRequest {
    /// Build a request from the current settings.
    pub fn new(working_dir: impl Into<PathBuf>, settings: &SyncSettings, message: String) -> Self {
        Self {
            working_dir: working_dir.into(),
            interpreter: settings.interpreter.clone(),
            script: settings.sync_script.clone(),
            message,
            timeout: settings.sync_timeout(),
        }
    }

    /// Commit message used when the caller does not supply one.
    #[must_use]
    pub fn default_message(started_at: DateTime<Utc>) -> String {
        format!("Vault sync - {}", started_at.format("%Y-%m-%d %H:%M"))
    }
}

/// Captured output of a script that exited successfully.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Performs a single sync attempt.
#[async_trait]
pub trait SyncExecutor: Send + Sync + 'static {
    /// Run the script once. Errors cover timeout, spawn failure and non-zero exit.
    async fn execute(&self, request: &SyncRequest) -> Result<ScriptOutput>;

    /// Run the script once and classify the result. Never retries.
    async fn run(&self, request: &SyncRequest) -> SyncOutcome {
        let started = tokio::time::Instant::now();
        let result = self.execute(request).await;
        SyncOutcome::from_result(result, started.elapsed())
    }
}

/// Production executor: spawns `<interpreter> <script> <message>`.
///
/// The message is passed as a single argument, never through a shell
/// string. On unix the script leads its own process group, and a timeout or
/// an aborted run kills the whole group, so `git` children do not outlive it.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScriptExecutor;

impl ScriptExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SyncExecutor for ScriptExecutor {
    async fn execute(&self, request: &SyncRequest) -> Result<ScriptOutput> {
        let interpreter = resolve_interpreter(&request.interpreter).await?;

        debug!(
            interpreter = %interpreter.display(),
            script = %request.script,
            cwd = %request.working_dir.display(),
            "spawning sync script"
        );

        let mut command = tokio::process::Command::new(&interpreter);
        command
            .arg(&request.script)
            .arg(&request.message)
            .current_dir(&request.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let child = command.spawn().map_err(|e| SyncError::ScriptSpawn {
            reason: format!(
                "{} {} in {}: {e}",
                request.interpreter,
                request.script,
                request.working_dir.display()
            ),
        })?;

        let pid = child.id();
        let wait = child.wait_with_output();
        tokio::pin!(wait);
        // Declared after `wait` so the group is killed before the child is dropped.
        let mut group = ProcessGroupGuard::new(pid);

        let output = match tokio::time::timeout(request.timeout, &mut wait).await {
            Ok(waited) => {
                group.disarm();
                waited.map_err(|e| SyncError::ScriptSpawn {
                    reason: format!("cannot collect sync script output: {e}"),
                })?
            }
            Err(_) => {
                group.kill();
                let timeout_ms = u64::try_from(request.timeout.as_millis()).unwrap_or(u64::MAX);
                warn!(timeout_ms, script = %request.script, "sync script timed out; killed");
                return Err(SyncError::ScriptTimeout { timeout_ms });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !output.status.success() {
            let detail = if stderr.trim().is_empty() {
                &stdout
            } else {
                &stderr
            };
            return Err(SyncError::ScriptNonZeroExit {
                exit_code: output.status.code(),
                stderr: tail_chars(detail.trim(), MAX_ERROR_OUTPUT_CHARS),
            });
        }

        Ok(ScriptOutput { stdout, stderr })
    }
}

/// Look the interpreter up on `PATH` without blocking the runtime.
async fn resolve_interpreter(name: &str) -> Result<PathBuf> {
    let lookup = name.to_owned();
    let found = tokio::task::spawn_blocking(move || which::which(lookup))
        .await
        .map_err(|e| SyncError::ScriptSpawn {
            reason: format!("interpreter lookup for `{name}` failed: {e}"),
        })?;
    found.map_err(|e| SyncError::ScriptSpawn {
        reason: format!("interpreter `{name}` not found: {e}"),
    })
}

/// Kills the script's process group unless disarmed.
///
/// Runs on drop too, which covers a run aborted at shutdown.
struct ProcessGroupGuard {
    pgid: Option<u32>,
}

impl ProcessGroupGuard {
    fn new(pid: Option<u32>) -> Self {
        Self { pgid: pid }
    }

    /// The leader has been reaped; its id may be reused.
    fn disarm(&mut self) {
        self.pgid = None;
    }

    fn kill(&mut self) {
        let Some(pgid) = self.pgid.take() else {
            return;
        };
        #[cfg(unix)]
        {
            let Ok(pgid) = libc::pid_t::try_from(pgid) else {
                return;
            };
            // SAFETY: killpg only sends a signal; the group was created by
            // `process_group(0)` and its leader has not been reaped yet.
            let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
            if rc != 0 {
                debug!(pgid, error = %std::io::Error::last_os_error(), "killpg failed");
            }
        }
        #[cfg(not(unix))]
        let _ = pgid;
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Keep the last `max` characters; script errors are usually at the end.
fn tail_chars(text: &str, max: usize) -> String {
    let count = text.chars().count();
    if count <= max {
        return text.to_owned();
    }
    text.chars().skip(count - max).collect()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use std::path::Path;

    fn write_script(dir: &Path, name: &str, body: &str) {
        std::fs::write(dir.join(name), body).expect("write script");
    }

    fn request(dir: &Path, script: &str, timeout: Duration) -> SyncRequest {
        SyncRequest {
            working_dir: dir.to_path_buf(),
            interpreter: "sh".to_owned(),
            script: script.to_owned(),
            message: "Vault sync - test".to_owned(),
            timeout,
        }
    }

    #[tokio::test]
    async fn sentinel_output_is_no_changes() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "sync.sh", "echo 'Pulling...'\necho 'No changes to commit'\n");

        let outcome = ScriptExecutor
            .run(&request(dir.path(), "sync.sh", Duration::from_secs(10)))
            .await;
        assert!(matches!(
            outcome,
            SyncOutcome::Success {
                no_changes: true,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn plain_success_has_changes() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "sync.sh", "echo '[main 1a2b3c] Vault sync'\n");

        let outcome = ScriptExecutor
            .run(&request(dir.path(), "sync.sh", Duration::from_secs(10)))
            .await;
        assert!(matches!(
            outcome,
            SyncOutcome::Success {
                no_changes: false,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn message_is_passed_verbatim_as_one_argument() {
        let dir = tempfile::tempdir().unwrap();
        write_script(
            dir.path(),
            "sync.sh",
            "printf '%s|%s' \"$#\" \"$1\" > received.txt\n",
        );
        let mut req = request(dir.path(), "sync.sh", Duration::from_secs(10));
        req.message = "notes \"quoted\" $HOME; rm -rf nothing".to_owned();

        let outcome = ScriptExecutor.run(&req).await;
        assert!(outcome.is_success(), "{outcome:?}");
        let received = std::fs::read_to_string(dir.path().join("received.txt")).unwrap();
        assert_eq!(received, "1|notes \"quoted\" $HOME; rm -rf nothing");
    }

    #[tokio::test]
    async fn non_zero_exit_carries_code_and_stderr() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "sync.sh", "echo 'merge conflict in notes.md' >&2\nexit 3\n");

        let err = ScriptExecutor
            .execute(&request(dir.path(), "sync.sh", Duration::from_secs(10)))
            .await
            .unwrap_err();
        match err {
            SyncError::ScriptNonZeroExit { exit_code, stderr } => {
                assert_eq!(exit_code, Some(3));
                assert_eq!(stderr, "merge conflict in notes.md");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn slow_script_times_out() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "sync.sh", "sleep 5\n");

        let started = std::time::Instant::now();
        let outcome = ScriptExecutor
            .run(&request(dir.path(), "sync.sh", Duration::from_millis(200)))
            .await;
        assert!(started.elapsed() < Duration::from_secs(4));
        match outcome {
            SyncOutcome::Failure { error_message } => {
                assert!(error_message.contains("timeout"), "{error_message}");
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_kills_children_of_the_script() {
        let dir = tempfile::tempdir().unwrap();
        write_script(
            dir.path(),
            "sync.sh",
            "sh -c 'sleep 1; echo leaked > leaked.txt'\n",
        );

        let outcome = ScriptExecutor
            .run(&request(dir.path(), "sync.sh", Duration::from_millis(300)))
            .await;
        assert!(!outcome.is_success());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!dir.path().join("leaked.txt").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn dropping_a_run_kills_children_of_the_script() {
        let dir = tempfile::tempdir().unwrap();
        write_script(
            dir.path(),
            "sync.sh",
            "sh -c 'sleep 1; echo leaked > leaked.txt'\n",
        );
        let req = request(dir.path(), "sync.sh", Duration::from_secs(30));

        let run = tokio::spawn(async move { ScriptExecutor.run(&req).await });
        tokio::time::sleep(Duration::from_millis(300)).await;
        run.abort();
        assert!(run.await.unwrap_err().is_cancelled());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!dir.path().join("leaked.txt").exists());
    }

    #[tokio::test]
    async fn missing_interpreter_is_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut req = request(dir.path(), "sync.sh", Duration::from_secs(1));
        req.interpreter = "definitely-not-an-interpreter-7f3a".to_owned();

        let err = ScriptExecutor.execute(&req).await.unwrap_err();
        match err {
            SyncError::ScriptSpawn { reason } => assert!(reason.contains("not found"), "{reason}"),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(resolve_interpreter("sh").await.is_ok());
    }

    #[tokio::test]
    async fn missing_working_dir_is_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let req = request(&dir.path().join("gone"), "sync.sh", Duration::from_secs(1));

        let err = ScriptExecutor.execute(&req).await.unwrap_err();
        assert!(matches!(err, SyncError::ScriptSpawn { .. }));
    }

    #[test]
    fn default_message_uses_minute_precision() {
        use chrono::TimeZone;
        let at = Utc.with_ymd_and_hms(2024, 1, 9, 7, 5, 59).unwrap();
        assert_eq!(SyncRequest::default_message(at), "Vault sync - 2024-01-09 07:05");
    }

    #[test]
    fn summary_formats_one_decimal() {
        let done = SyncOutcome::Success {
            duration_secs: 1.26,
            no_changes: false,
        };
        assert_eq!(done.summary(), "synced (1.3s)");
        let idle = SyncOutcome::Success {
            duration_secs: 0.5,
            no_changes: true,
        };
        assert_eq!(idle.summary(), "no changes (0.5s)");
    }

    #[test]
    fn tail_keeps_end_of_output() {
        assert_eq!(tail_chars("abcdef", 3), "def");
        assert_eq!(tail_chars("abc", 10), "abc");
    }
}
