//! In-process command channel between a host transport and the sync core.
//!
//! [`HostCommandClient`] is handed to the transport (stdio, tests); the
//! [`HostCommandServer`] routes each envelope to a [`SyncCommandHandler`] and
//! publishes events on a broadcast channel shared with the notification sink.

use crate::config::{SettingsPatch, SyncSettings};
use crate::error::{Result, SyncError};
use crate::host::contract::{CommandEnvelope, CommandName, EventEnvelope, ResponseEnvelope};
use crate::notify::{Notice, NotificationSink};
use crate::sync::executor::SyncOutcome;
use crate::sync::scheduler::{SchedulerHandle, StopPolicy, SyncCompleted};
use crate::sync::status::SyncStatus;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

/// Operations the host can ask of the sync core.
#[async_trait]
pub trait SyncCommandHandler: Send + Sync + 'static {
    /// Run a sync now and return its outcome.
    async fn trigger_sync(&self, message: Option<String>) -> Result<SyncOutcome>;
    /// Flip auto-sync; returns the new state.
    async fn toggle_auto_sync(&self) -> Result<bool>;
    /// Snapshot the status; `announce` also shows it as a notice.
    async fn query_status(&self, announce: bool) -> Result<SyncStatus>;
    async fn reset_counter(&self) -> Result<()>;
    async fn set_interval(&self, minutes: u32) -> Result<()>;
    async fn query_config(&self) -> Result<SyncSettings>;
    async fn patch_config(&self, patch: SettingsPatch) -> Result<SyncSettings>;
    async fn request_runtime_stop(&self) -> Result<()>;
}

#[async_trait]
impl SyncCommandHandler for SchedulerHandle {
    async fn trigger_sync(&self, message: Option<String>) -> Result<SyncOutcome> {
        self.manual_sync(message).await
    }

    async fn toggle_auto_sync(&self) -> Result<bool> {
        self.toggle_auto().await
    }

    async fn query_status(&self, announce: bool) -> Result<SyncStatus> {
        if announce {
            self.show_status().await
        } else {
            self.status().await
        }
    }

    async fn reset_counter(&self) -> Result<()> {
        SchedulerHandle::reset_counter(self).await
    }

    async fn set_interval(&self, minutes: u32) -> Result<()> {
        self.change_interval(minutes).await
    }

    async fn query_config(&self) -> Result<SyncSettings> {
        self.settings().await
    }

    async fn patch_config(&self, patch: SettingsPatch) -> Result<SyncSettings> {
        self.update_settings(patch).await
    }

    async fn request_runtime_stop(&self) -> Result<()> {
        self.stop(StopPolicy::Drain).await
    }
}

/// Notification sink that republishes every notice as a `sync.notice` event.
#[derive(Clone)]
pub struct EventSink {
    event_tx: broadcast::Sender<EventEnvelope>,
}

impl EventSink {
    #[must_use]
    pub fn new(event_tx: broadcast::Sender<EventEnvelope>) -> Self {
        Self { event_tx }
    }
}

impl NotificationSink for EventSink {
    fn notify(&self, notice: &Notice) {
        match serde_json::to_value(notice) {
            Ok(payload) => emit(&self.event_tx, "sync.notice", payload),
            Err(e) => tracing::error!(error = %e, "cannot serialize notice"),
        }
    }
}

/// Publish a `sync.completed` event for every finished attempt.
///
/// The task ends when the scheduler stops.
pub fn spawn_completion_forwarder(
    mut completions: broadcast::Receiver<SyncCompleted>,
    event_tx: broadcast::Sender<EventEnvelope>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match completions.recv().await {
                Ok(completed) => match serde_json::to_value(&completed) {
                    Ok(payload) => emit(&event_tx, "sync.completed", payload),
                    Err(e) => tracing::error!(error = %e, "cannot serialize sync completion"),
                },
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(lagged = n, "completion forwarder lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

struct HostCommandRequest {
    envelope: CommandEnvelope,
    response_tx: oneshot::Sender<ResponseEnvelope>,
}

#[derive(Clone)]
pub struct HostCommandClient {
    request_tx: mpsc::Sender<HostCommandRequest>,
    event_tx: broadcast::Sender<EventEnvelope>,
}

impl HostCommandClient {
    /// Send one command and wait for its response.
    ///
    /// Handler failures come back as an `ok: false` response; only an
    /// invalid envelope or a closed channel is an `Err`.
    pub async fn send(&self, envelope: CommandEnvelope) -> Result<ResponseEnvelope> {
        envelope.validate().map_err(|e| {
            SyncError::Command(format!(
                "invalid host command envelope {}: {}",
                envelope.request_id, e
            ))
        })?;

        let (response_tx, response_rx) = oneshot::channel();
        self.request_tx
            .send(HostCommandRequest {
                envelope,
                response_tx,
            })
            .await
            .map_err(|e| SyncError::Channel(format!("failed to send host command request: {e}")))?;

        response_rx
            .await
            .map_err(|e| SyncError::Channel(format!("host command response dropped: {e}")))
    }

    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<EventEnvelope> {
        self.event_tx.subscribe()
    }
}

pub struct HostCommandServer<H: SyncCommandHandler> {
    request_rx: mpsc::Receiver<HostCommandRequest>,
    router: CommandRouter<H>,
}

/// Create a command channel using an existing event broadcast sender.
///
/// Share the sender with [`EventSink`] and [`spawn_completion_forwarder`] so
/// scheduler events reach the host through the same stream as command events.
#[must_use]
pub fn command_channel_with_events<H: SyncCommandHandler>(
    request_capacity: usize,
    event_tx: broadcast::Sender<EventEnvelope>,
    handler: H,
) -> (HostCommandClient, HostCommandServer<H>) {
    let (request_tx, request_rx) = mpsc::channel(request_capacity.max(1));

    (
        HostCommandClient {
            request_tx,
            event_tx: event_tx.clone(),
        },
        HostCommandServer {
            request_rx,
            router: CommandRouter {
                handler: Arc::new(handler),
                event_tx,
            },
        },
    )
}

impl<H: SyncCommandHandler> HostCommandServer<H> {
    /// Serve requests until every client is dropped.
    ///
    /// Each request is routed on its own task so a long `sync.trigger` does
    /// not hold up `sync.status`.
    pub async fn run(mut self) {
        while let Some(request) = self.request_rx.recv().await {
            let router = self.router.clone();
            tokio::spawn(async move {
                let response = router.route(&request.envelope).await;
                let _ = request.response_tx.send(response);
            });
        }
    }

    /// Route one envelope on the current task.
    pub async fn route(&self, envelope: &CommandEnvelope) -> ResponseEnvelope {
        self.router.route(envelope).await
    }
}

struct CommandRouter<H> {
    handler: Arc<H>,
    event_tx: broadcast::Sender<EventEnvelope>,
}

impl<H> Clone for CommandRouter<H> {
    fn clone(&self) -> Self {
        Self {
            handler: Arc::clone(&self.handler),
            event_tx: self.event_tx.clone(),
        }
    }
}

impl<H: SyncCommandHandler> CommandRouter<H> {
    async fn route(&self, envelope: &CommandEnvelope) -> ResponseEnvelope {
        let command = envelope.command.as_str();
        match self.dispatch(envelope).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(command, request_id = %envelope.request_id, error = %e, "host command failed");
                ResponseEnvelope::error(envelope.request_id.clone(), e.to_string())
            }
        }
    }

    async fn dispatch(&self, envelope: &CommandEnvelope) -> Result<ResponseEnvelope> {
        match envelope.command {
            CommandName::HostPing => Ok(ResponseEnvelope::ok(
                envelope.request_id.clone(),
                serde_json::json!({"pong": true}),
            )),
            CommandName::HostVersion => Ok(ResponseEnvelope::ok(
                envelope.request_id.clone(),
                serde_json::json!({
                    "contract_version": crate::host::contract::EVENT_VERSION,
                    "crate_version": env!("CARGO_PKG_VERSION"),
                    "channel": "vault_sync_v1"
                }),
            )),
            CommandName::SyncTrigger => self.handle_sync_trigger(envelope).await,
            CommandName::SyncToggleAuto => self.handle_sync_toggle_auto(envelope).await,
            CommandName::SyncStatus => self.handle_sync_status(envelope).await,
            CommandName::SyncResetCounter => self.handle_sync_reset_counter(envelope).await,
            CommandName::SyncSetInterval => self.handle_sync_set_interval(envelope).await,
            CommandName::ConfigGet => self.handle_config_get(envelope).await,
            CommandName::ConfigPatch => self.handle_config_patch(envelope).await,
            CommandName::RuntimeStop => self.handle_runtime_stop(envelope).await,
        }
    }

    async fn handle_sync_trigger(&self, envelope: &CommandEnvelope) -> Result<ResponseEnvelope> {
        let message = parse_optional_message(&envelope.payload)?;
        let outcome = self.handler.trigger_sync(message).await?;
        Ok(ResponseEnvelope::ok(
            envelope.request_id.clone(),
            to_payload(&outcome)?,
        ))
    }

    async fn handle_sync_toggle_auto(
        &self,
        envelope: &CommandEnvelope,
    ) -> Result<ResponseEnvelope> {
        let enabled = self.handler.toggle_auto_sync().await?;
        self.emit_event(
            "sync.auto_toggled",
            serde_json::json!({"request_id": envelope.request_id, "enabled": enabled}),
        );
        Ok(ResponseEnvelope::ok(
            envelope.request_id.clone(),
            serde_json::json!({"enabled": enabled}),
        ))
    }

    async fn handle_sync_status(&self, envelope: &CommandEnvelope) -> Result<ResponseEnvelope> {
        let announce = parse_announce(&envelope.payload)?;
        let status = self.handler.query_status(announce).await?;
        let mut payload = to_payload(&status)?;
        if let Some(map) = payload.as_object_mut() {
            map.insert("summary".to_owned(), status.summary().into());
            map.insert("status_line".to_owned(), status.status_line().into());
        }
        Ok(ResponseEnvelope::ok(envelope.request_id.clone(), payload))
    }

    async fn handle_sync_reset_counter(
        &self,
        envelope: &CommandEnvelope,
    ) -> Result<ResponseEnvelope> {
        self.handler.reset_counter().await?;
        self.emit_event(
            "sync.counter_reset",
            serde_json::json!({"request_id": envelope.request_id}),
        );
        Ok(ResponseEnvelope::ok(
            envelope.request_id.clone(),
            serde_json::json!({"accepted": true}),
        ))
    }

    async fn handle_sync_set_interval(
        &self,
        envelope: &CommandEnvelope,
    ) -> Result<ResponseEnvelope> {
        let minutes = parse_minutes(&envelope.payload)?;
        self.handler.set_interval(minutes).await?;
        Ok(ResponseEnvelope::ok(
            envelope.request_id.clone(),
            serde_json::json!({"accepted": true, "minutes": minutes}),
        ))
    }

    async fn handle_config_get(&self, envelope: &CommandEnvelope) -> Result<ResponseEnvelope> {
        let settings = to_payload(&self.handler.query_config().await?)?;
        let key = envelope
            .payload
            .get("key")
            .and_then(serde_json::Value::as_str);
        let payload = match key {
            None => settings,
            Some(key) => {
                let value = settings.get(key).cloned().ok_or_else(|| {
                    SyncError::Command(format!("config.get: unknown key `{key}`"))
                })?;
                serde_json::json!({"key": key, "value": value})
            }
        };
        Ok(ResponseEnvelope::ok(envelope.request_id.clone(), payload))
    }

    async fn handle_config_patch(&self, envelope: &CommandEnvelope) -> Result<ResponseEnvelope> {
        let patch = parse_settings_patch(&envelope.payload)?;
        let settings = self.handler.patch_config(patch).await?;
        let settings = to_payload(&settings)?;
        self.emit_event(
            "config.patched",
            serde_json::json!({"request_id": envelope.request_id, "settings": settings}),
        );
        Ok(ResponseEnvelope::ok(envelope.request_id.clone(), settings))
    }

    async fn handle_runtime_stop(&self, envelope: &CommandEnvelope) -> Result<ResponseEnvelope> {
        self.handler.request_runtime_stop().await?;
        Ok(ResponseEnvelope::ok(
            envelope.request_id.clone(),
            serde_json::json!({"accepted": true}),
        ))
    }

    fn emit_event(&self, event: &str, payload: serde_json::Value) {
        emit(&self.event_tx, event, payload);
    }
}

fn emit(event_tx: &broadcast::Sender<EventEnvelope>, event: &str, payload: serde_json::Value) {
    let envelope = EventEnvelope::new(uuid::Uuid::new_v4().to_string(), event, payload);
    let _ = event_tx.send(envelope);
}

fn to_payload<T: serde::Serialize>(value: &T) -> Result<serde_json::Value> {
    serde_json::to_value(value)
        .map_err(|e| SyncError::Channel(format!("cannot serialize response payload: {e}")))
}

fn parse_optional_message(payload: &serde_json::Value) -> Result<Option<String>> {
    match payload.get("message") {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(raw)) => {
            let message = raw.trim();
            Ok((!message.is_empty()).then(|| message.to_owned()))
        }
        Some(_) => Err(SyncError::Command(
            "sync.trigger payload.message must be a string when provided".to_owned(),
        )),
    }
}

fn parse_announce(payload: &serde_json::Value) -> Result<bool> {
    match payload.get("announce") {
        None | Some(serde_json::Value::Null) => Ok(false),
        Some(serde_json::Value::Bool(announce)) => Ok(*announce),
        Some(_) => Err(SyncError::Command(
            "sync.status payload.announce must be a boolean when provided".to_owned(),
        )),
    }
}

fn parse_minutes(payload: &serde_json::Value) -> Result<u32> {
    let Some(raw) = payload.get("minutes") else {
        return Err(SyncError::Command(
            "sync.set_interval requires payload.minutes".to_owned(),
        ));
    };
    raw.as_u64()
        .and_then(|minutes| u32::try_from(minutes).ok())
        .ok_or_else(|| {
            SyncError::Command(format!(
                "sync.set_interval payload.minutes must be a positive integer, got {raw}"
            ))
        })
}

fn parse_settings_patch(payload: &serde_json::Value) -> Result<SettingsPatch> {
    let patch: SettingsPatch = serde_json::from_value(payload.clone())
        .map_err(|e| SyncError::Command(format!("config.patch: {e}")))?;
    if patch.is_empty() {
        return Err(SyncError::Command(
            "config.patch requires at least one setting".to_owned(),
        ));
    }
    Ok(patch)
}
