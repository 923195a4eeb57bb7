//! Sync scheduler background loop.
//!
//! A single tokio task owns every piece of mutable state: settings, stats,
//! the auto-sync timer and the overlap guard. Manual requests, timer ticks
//! and run completions are all handled sequentially by that task, so the
//! guard check-and-set can never race. The sync itself runs on a separate
//! task so status queries are answered while a script is running.

use crate::config::{
    PersistedState, SettingsPatch, SettingsStore, SyncSettings, validate_interval,
};
use crate::error::{Result, SyncError};
use crate::notify::{Notice, NotificationSink, TracingSink};
use crate::sync::executor::{ScriptExecutor, SyncExecutor, SyncOutcome, SyncRequest};
use crate::sync::stats::SyncStats;
use crate::sync::status::{self, SyncStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Capacity of the command queue between handles and the scheduler task.
const COMMAND_CAPACITY: usize = 32;

/// Capacity of the completion broadcast.
const EVENT_CAPACITY: usize = 64;

/// What started a sync attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOrigin {
    Manual,
    Auto,
    Startup,
}

impl SyncOrigin {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Auto => "auto",
            Self::Startup => "startup",
        }
    }
}

/// What to do with an in-flight sync when the scheduler stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StopPolicy {
    /// Wait for the running attempt to finish and record it.
    #[default]
    Drain,
    /// Kill the running attempt without recording it.
    Abandon,
}

/// Broadcast after every finished attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncCompleted {
    pub origin: SyncOrigin,
    pub outcome: SyncOutcome,
    pub completed_at: DateTime<Utc>,
    pub total_syncs: u64,
}

/// In-memory scheduler state. Never persisted.
#[derive(Debug)]
pub struct SchedulerState {
    pub(crate) enabled: bool,
    pub(crate) interval_minutes: u32,
    pub(crate) timer: Option<Interval>,
    pub(crate) run_in_progress: bool,
    pub(crate) last_outcome: Option<SyncOutcome>,
}

impl SchedulerState {
    /// Idle, timer not armed, interval taken from `settings`.
    #[must_use]
    pub fn new(settings: &SyncSettings) -> Self {
        Self {
            enabled: false,
            interval_minutes: settings.auto_sync_interval,
            timer: None,
            run_in_progress: false,
            last_outcome: None,
        }
    }

    #[must_use]
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    #[must_use]
    pub fn interval_minutes(&self) -> u32 {
        self.interval_minutes
    }

    #[must_use]
    pub fn run_in_progress(&self) -> bool {
        self.run_in_progress
    }

    #[must_use]
    pub fn last_outcome(&self) -> Option<&SyncOutcome> {
        self.last_outcome.as_ref()
    }
}

/// Everything the scheduler needs from its host.
pub struct SchedulerConfig {
    /// Vault root the script runs in.
    pub working_dir: PathBuf,
    pub store: Arc<dyn SettingsStore>,
    pub executor: Arc<dyn SyncExecutor>,
    pub sink: Arc<dyn NotificationSink>,
    /// Honour `syncOnStartup`. Off for one-shot front ends that only query or edit.
    pub startup_sync: bool,
}

impl SchedulerConfig {
    /// Production defaults: [`ScriptExecutor`] and [`TracingSink`].
    pub fn new(working_dir: impl Into<PathBuf>, store: Arc<dyn SettingsStore>) -> Self {
        Self {
            working_dir: working_dir.into(),
            store,
            executor: Arc::new(ScriptExecutor::new()),
            sink: Arc::new(TracingSink),
            startup_sync: true,
        }
    }

    #[must_use]
    pub fn with_executor(mut self, executor: Arc<dyn SyncExecutor>) -> Self {
        self.executor = executor;
        self
    }

    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sink = sink;
        self
    }

    #[must_use]
    pub fn without_startup_sync(mut self) -> Self {
        self.startup_sync = false;
        self
    }
}

enum Command {
    ManualSync {
        message: Option<String>,
        reply: oneshot::Sender<SyncOutcome>,
    },
    EnableAuto {
        minutes: u32,
        reply: oneshot::Sender<Result<()>>,
    },
    DisableAuto {
        reply: oneshot::Sender<()>,
    },
    ChangeInterval {
        minutes: u32,
        reply: oneshot::Sender<Result<()>>,
    },
    ToggleAuto {
        reply: oneshot::Sender<bool>,
    },
    Status {
        announce: bool,
        reply: oneshot::Sender<SyncStatus>,
    },
    ResetCounter {
        reply: oneshot::Sender<()>,
    },
    UpdateSettings {
        patch: SettingsPatch,
        reply: oneshot::Sender<Result<SyncSettings>>,
    },
    Settings {
        reply: oneshot::Sender<SyncSettings>,
    },
    Stop {
        policy: StopPolicy,
    },
}

struct QueuedManual {
    message: Option<String>,
    reply: oneshot::Sender<SyncOutcome>,
}

struct InFlight {
    origin: SyncOrigin,
    waiter: Option<oneshot::Sender<SyncOutcome>>,
    task: JoinHandle<SyncOutcome>,
}

/// The scheduler task. Create it with [`SyncScheduler::start`].
pub struct SyncScheduler {
    settings: SyncSettings,
    stats: SyncStats,
    /// Document keys owned by other hosts, written back untouched.
    foreign_keys: serde_json::Map<String, serde_json::Value>,
    state: SchedulerState,
    working_dir: PathBuf,
    store: Arc<dyn SettingsStore>,
    executor: Arc<dyn SyncExecutor>,
    sink: Arc<dyn NotificationSink>,
    events: broadcast::Sender<SyncCompleted>,
    in_flight: Option<InFlight>,
    queued: VecDeque<QueuedManual>,
    startup_sync: bool,
}

impl SyncScheduler {
    /// Load persisted state and spawn the scheduler task.
    ///
    /// Arms the auto-sync timer when `autoSyncEnabled` is set and starts an
    /// immediate attempt when `syncOnStartup` is set. Must be called from
    /// within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the settings document exists but cannot be read.
    pub fn start(config: SchedulerConfig) -> Result<SchedulerHandle> {
        let PersistedState {
            settings,
            stats,
            extra,
        } = config.store.load()?;
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shutdown = CancellationToken::new();

        let scheduler = Self {
            state: SchedulerState::new(&settings),
            settings,
            stats,
            foreign_keys: extra,
            working_dir: config.working_dir,
            store: config.store,
            executor: config.executor,
            sink: config.sink,
            events: events.clone(),
            in_flight: None,
            queued: VecDeque::new(),
            startup_sync: config.startup_sync,
        };

        let task = tokio::spawn(scheduler.run(command_rx, shutdown.clone()));

        Ok(SchedulerHandle {
            commands: command_tx,
            events,
            shutdown,
            task: Arc::new(Mutex::new(Some(task))),
        })
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>, shutdown: CancellationToken) {
        info!(
            vault = %self.working_dir.display(),
            script = %self.settings.sync_script,
            auto_sync = self.settings.auto_sync_enabled,
            interval_minutes = self.settings.auto_sync_interval,
            "sync scheduler started"
        );

        if self.settings.auto_sync_enabled {
            self.state.enabled = true;
            self.arm_timer();
        }
        if self.settings.sync_on_startup && self.startup_sync {
            self.start_run(SyncOrigin::Startup, None, None);
        }

        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => {
                    self.shutdown(StopPolicy::Drain).await;
                    break;
                }
                joined = next_completion(&mut self.in_flight) => {
                    if let Some(run) = self.in_flight.take() {
                        self.complete(run, joined);
                    }
                }
                command = commands.recv() => match command {
                    Some(Command::Stop { policy }) => {
                        self.shutdown(policy).await;
                        break;
                    }
                    Some(command) => self.handle(command),
                    None => {
                        debug!("all scheduler handles dropped");
                        self.shutdown(StopPolicy::Drain).await;
                        break;
                    }
                },
                () = next_tick(&mut self.state.timer) => self.on_tick(),
            }
        }
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::ManualSync { message, reply } => self.on_manual(message, reply),
            Command::EnableAuto { minutes, reply } => {
                let _ = reply.send(self.enable_auto(minutes));
            }
            Command::DisableAuto { reply } => {
                self.disable_auto();
                let _ = reply.send(());
            }
            Command::ChangeInterval { minutes, reply } => {
                let _ = reply.send(self.change_interval(minutes));
            }
            Command::ToggleAuto { reply } => {
                let _ = reply.send(self.toggle_auto());
            }
            Command::Status { announce, reply } => {
                let status = self.status();
                if announce {
                    self.notify(Notice::status(status.summary()));
                }
                let _ = reply.send(status);
            }
            Command::ResetCounter { reply } => {
                self.reset_counter();
                let _ = reply.send(());
            }
            Command::UpdateSettings { patch, reply } => {
                let _ = reply.send(self.update_settings(&patch));
            }
            Command::Settings { reply } => {
                let _ = reply.send(self.settings.clone());
            }
            Command::Stop { .. } => {}
        }
    }

    fn on_tick(&mut self) {
        if self.state.run_in_progress {
            debug!("auto-sync tick skipped; a sync is already running");
            return;
        }
        self.start_run(SyncOrigin::Auto, None, None);
    }

    fn on_manual(&mut self, message: Option<String>, reply: oneshot::Sender<SyncOutcome>) {
        if self.state.run_in_progress {
            debug!(queued = self.queued.len() + 1, "manual sync queued behind running sync");
            self.queued.push_back(QueuedManual { message, reply });
            return;
        }
        self.start_run(SyncOrigin::Manual, message, Some(reply));
    }

    fn start_run(
        &mut self,
        origin: SyncOrigin,
        message: Option<String>,
        waiter: Option<oneshot::Sender<SyncOutcome>>,
    ) {
        let message = message
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| SyncRequest::default_message(Utc::now()));
        let request = SyncRequest::new(&self.working_dir, &self.settings, message);

        self.state.run_in_progress = true;
        info!(origin = origin.as_str(), script = %request.script, "sync started");
        self.notify(Notice::sync_started());

        let executor = Arc::clone(&self.executor);
        let task = tokio::spawn(async move { executor.run(&request).await });
        self.in_flight = Some(InFlight {
            origin,
            waiter,
            task,
        });
    }

    fn complete(
        &mut self,
        run: InFlight,
        joined: std::result::Result<SyncOutcome, JoinError>,
    ) {
        let outcome = joined.unwrap_or_else(|e| SyncOutcome::Failure {
            error_message: format!("sync task failed: {e}"),
        });
        let completed_at = Utc::now();

        match &outcome {
            SyncOutcome::Success {
                duration_secs,
                no_changes,
            } => info!(
                origin = run.origin.as_str(),
                duration_secs, no_changes, "sync finished"
            ),
            SyncOutcome::Failure { error_message } => warn!(
                origin = run.origin.as_str(),
                error = %error_message,
                "sync failed"
            ),
        }

        if outcome.is_success() || self.settings.count_failed_syncs {
            self.stats.record_attempt(&outcome, completed_at);
            self.persist();
        }
        self.state.last_outcome = Some(outcome.clone());
        self.state.run_in_progress = false;
        self.notify(Notice::sync_finished(&outcome));

        let _ = self.events.send(SyncCompleted {
            origin: run.origin,
            outcome: outcome.clone(),
            completed_at,
            total_syncs: self.stats.sync_count,
        });
        if let Some(waiter) = run.waiter {
            let _ = waiter.send(outcome);
        }

        if let Some(next) = self.queued.pop_front() {
            self.start_run(SyncOrigin::Manual, next.message, Some(next.reply));
        }
    }

    fn enable_auto(&mut self, minutes: u32) -> Result<()> {
        let minutes = validate_interval(minutes)?;
        self.settings.auto_sync_interval = minutes;
        self.settings.auto_sync_enabled = true;
        self.state.interval_minutes = minutes;
        self.state.enabled = true;
        self.arm_timer();
        self.persist();
        info!(interval_minutes = minutes, "auto-sync enabled");
        Ok(())
    }

    fn disable_auto(&mut self) {
        if !self.state.enabled && self.state.timer.is_none() {
            return;
        }
        self.state.timer = None;
        self.state.enabled = false;
        self.settings.auto_sync_enabled = false;
        self.persist();
        info!("auto-sync disabled");
    }

    fn change_interval(&mut self, minutes: u32) -> Result<()> {
        let minutes = validate_interval(minutes)?;
        self.settings.auto_sync_interval = minutes;
        self.state.interval_minutes = minutes;
        if self.state.enabled {
            self.arm_timer();
        }
        self.persist();
        info!(interval_minutes = minutes, "auto-sync interval changed");
        Ok(())
    }

    fn toggle_auto(&mut self) -> bool {
        if self.state.enabled {
            self.disable_auto();
            self.notify(Notice::auto_disabled());
        } else {
            let minutes = self.settings.auto_sync_interval;
            if let Err(e) = self.enable_auto(minutes) {
                // Stored intervals are always validated.
                error!("cannot enable auto-sync: {e}");
                return false;
            }
            self.notify(Notice::auto_enabled(minutes));
        }
        self.state.enabled
    }

    fn status(&self) -> SyncStatus {
        status::report(&self.settings, &self.state, &self.stats, Utc::now())
    }

    fn reset_counter(&mut self) {
        self.stats.reset();
        self.persist();
        info!("sync counter reset");
        self.notify(Notice::counter_reset());
    }

    fn update_settings(&mut self, patch: &SettingsPatch) -> Result<SyncSettings> {
        let next = self.settings.patched(patch)?;
        let interval_changed = next.auto_sync_interval != self.settings.auto_sync_interval;
        let enable_changed = next.auto_sync_enabled != self.state.enabled;

        self.settings = next;
        self.state.interval_minutes = self.settings.auto_sync_interval;
        if enable_changed {
            self.state.enabled = self.settings.auto_sync_enabled;
            if self.state.enabled {
                self.arm_timer();
            } else {
                self.state.timer = None;
            }
        } else if interval_changed && self.state.enabled {
            self.arm_timer();
        }
        self.persist();
        debug!(?patch, "settings updated");
        Ok(self.settings.clone())
    }

    /// Replace the timer; the first tick is one full period from now.
    fn arm_timer(&mut self) {
        let period = self.settings.auto_sync_period();
        let mut timer = tokio::time::interval_at(Instant::now() + period, period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.state.timer = Some(timer);
    }

    async fn shutdown(&mut self, policy: StopPolicy) {
        self.state.timer = None;
        for queued in self.queued.drain(..) {
            let _ = queued.reply.send(SyncOutcome::Failure {
                error_message: "scheduler stopped before the sync could start".to_owned(),
            });
        }

        if let Some(mut run) = self.in_flight.take() {
            match policy {
                StopPolicy::Drain => {
                    info!("waiting for in-flight sync before stopping");
                    let joined = (&mut run.task).await;
                    self.complete(run, joined);
                }
                StopPolicy::Abandon => {
                    warn!(origin = run.origin.as_str(), "abandoning in-flight sync");
                    run.task.abort();
                    self.state.run_in_progress = false;
                    if let Some(waiter) = run.waiter {
                        let _ = waiter.send(SyncOutcome::Failure {
                            error_message: "sync abandoned at shutdown".to_owned(),
                        });
                    }
                }
            }
        }
        info!("sync scheduler stopped");
    }

    fn notify(&self, notice: Notice) {
        if notice.is_sync_progress() && !self.settings.show_notifications {
            return;
        }
        self.sink.notify(&notice);
    }

    fn persist(&self) {
        let state = PersistedState {
            settings: self.settings.clone(),
            stats: self.stats.clone(),
            extra: self.foreign_keys.clone(),
        };
        if let Err(e) = self.store.save(&state) {
            error!("cannot persist sync settings: {e}");
        }
    }
}

async fn next_tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn next_completion(
    in_flight: &mut Option<InFlight>,
) -> std::result::Result<SyncOutcome, JoinError> {
    match in_flight {
        Some(run) => (&mut run.task).await,
        None => std::future::pending().await,
    }
}

/// Cloneable client for a running scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<SyncCompleted>,
    shutdown: CancellationToken,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl SchedulerHandle {
    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| SyncError::Scheduler("scheduler is stopped".to_owned()))?;
        response
            .await
            .map_err(|_| SyncError::Channel("scheduler dropped the request".to_owned()))
    }

    /// Run a sync now and wait for its outcome.
    ///
    /// Never dropped: if a sync is already running this one starts right
    /// after it.
    pub async fn manual_sync(&self, message: Option<String>) -> Result<SyncOutcome> {
        self.request(|reply| Command::ManualSync { message, reply })
            .await
    }

    /// Arm the recurring timer with a new interval.
    pub async fn enable_auto(&self, minutes: u32) -> Result<()> {
        self.request(|reply| Command::EnableAuto { minutes, reply })
            .await?
    }

    /// Cancel the recurring timer. Idempotent.
    pub async fn disable_auto(&self) -> Result<()> {
        self.request(|reply| Command::DisableAuto { reply }).await
    }

    /// Change the interval, rescheduling the timer if auto-sync is on.
    pub async fn change_interval(&self, minutes: u32) -> Result<()> {
        self.request(|reply| Command::ChangeInterval { minutes, reply })
            .await?
    }

    /// Flip auto-sync; returns the new state.
    pub async fn toggle_auto(&self) -> Result<bool> {
        self.request(|reply| Command::ToggleAuto { reply }).await
    }

    /// Current status snapshot. Answered even while a sync is running.
    pub async fn status(&self) -> Result<SyncStatus> {
        self.request(|reply| Command::Status {
            announce: false,
            reply,
        })
        .await
    }

    /// Like [`status`](Self::status), and also send the summary to the sink.
    pub async fn show_status(&self) -> Result<SyncStatus> {
        self.request(|reply| Command::Status {
            announce: true,
            reply,
        })
        .await
    }

    /// Zero the sync counter.
    pub async fn reset_counter(&self) -> Result<()> {
        self.request(|reply| Command::ResetCounter { reply }).await
    }

    /// Apply a partial settings change; returns the resulting settings.
    pub async fn update_settings(&self, patch: SettingsPatch) -> Result<SyncSettings> {
        self.request(|reply| Command::UpdateSettings { patch, reply })
            .await?
    }

    pub async fn settings(&self) -> Result<SyncSettings> {
        self.request(|reply| Command::Settings { reply }).await
    }

    /// Receive a [`SyncCompleted`] for every finished attempt.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SyncCompleted> {
        self.events.subscribe()
    }

    /// Token that stops the scheduler (with [`StopPolicy::Drain`]) when cancelled.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop the scheduler and wait for its task to exit.
    ///
    /// Safe to call more than once; later calls return immediately.
    pub async fn stop(&self, policy: StopPolicy) -> Result<()> {
        if self.commands.send(Command::Stop { policy }).await.is_err() {
            debug!("scheduler already stopped");
        }
        let task = self
            .task
            .lock()
            .map_err(|_| SyncError::Scheduler("scheduler handle lock poisoned".to_owned()))?
            .take();
        if let Some(task) = task {
            task.await
                .map_err(|e| SyncError::Scheduler(format!("scheduler task failed: {e}")))?;
        }
        Ok(())
    }
}
