//! Stdin/stdout JSON bridge for the host command channel.
//!
//! Reads newline-delimited JSON `CommandEnvelope` messages, dispatches them
//! through the `HostCommandServer` router, and writes `ResponseEnvelope` and
//! `EventEnvelope` messages as newline-delimited JSON.
//!
//! Stdout is exclusively reserved for the JSON protocol; all diagnostic
//! output (tracing, logs) must be routed to stderr.

use crate::error::{Result, SyncError};
use crate::host::channel::{
    EventSink, HostCommandClient, command_channel_with_events, spawn_completion_forwarder,
};
use crate::host::contract::{CommandEnvelope, CommandName, ResponseEnvelope};
use crate::notify::NotificationSink;
use crate::sync::scheduler::{SchedulerConfig, StopPolicy, SyncScheduler};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinSet;

/// Default request channel capacity for the stdio bridge.
const REQUEST_CAPACITY: usize = 64;

/// Default event broadcast channel capacity for the stdio bridge.
const EVENT_CAPACITY: usize = 128;

/// How long to wait for trailing events after shutdown.
const EVENT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

type SharedWriter<W> = Arc<Mutex<BufWriter<W>>>;

/// Run the bridge on the process's stdin/stdout.
pub async fn run_stdio_bridge(config: SchedulerConfig) -> Result<()> {
    run_bridge(
        config,
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
    )
    .await
}

/// Start a scheduler for `config` and serve it over `input`/`output` until
/// the input closes or a `runtime.stop` command is received.
///
/// Concurrent pieces:
///
/// 1. **Reader** -- reads command lines and spawns one dispatch per command,
///    so a running `sync.trigger` does not block `sync.status`.
/// 2. **Event forwarder** -- writes every broadcast `EventEnvelope`.
/// 3. **Server** -- runs the `HostCommandServer` router loop.
///
/// On exit the scheduler is stopped with [`StopPolicy::Drain`], pending
/// responses are written, and trailing events are flushed.
pub async fn run_bridge<R, W>(config: SchedulerConfig, input: R, output: W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (event_tx, mut event_rx) = broadcast::channel(EVENT_CAPACITY);
    let writer: SharedWriter<W> = Arc::new(Mutex::new(BufWriter::new(output)));

    let host_sink: Arc<dyn NotificationSink> = Arc::new(EventSink::new(event_tx.clone()));
    let sinks: Vec<Arc<dyn NotificationSink>> = vec![Arc::clone(&config.sink), host_sink];
    let scheduler = SyncScheduler::start(config.with_sink(Arc::new(sinks)))?;
    let completions = spawn_completion_forwarder(scheduler.subscribe(), event_tx.clone());

    let (client, server) =
        command_channel_with_events(REQUEST_CAPACITY, event_tx, scheduler.clone());
    let server_handle = tokio::spawn(server.run());

    let event_writer = Arc::clone(&writer);
    let event_handle = tokio::spawn(async move {
        loop {
            match event_rx.recv().await {
                Ok(event_envelope) => match serde_json::to_string(&event_envelope) {
                    Ok(json) => {
                        let mut w = event_writer.lock().await;
                        if let Err(e) = write_line(&mut w, &json).await {
                            tracing::warn!(
                                error = %e,
                                "failed to write event envelope; stopping event forwarder"
                            );
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "failed to serialize event envelope; skipping");
                    }
                },
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(lagged = n, "event forwarder lagged; some events were dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let mut dispatches = JoinSet::new();
    let reader_result = run_reader(&client, input, &writer, &mut dispatches).await;

    if let Err(e) = scheduler.stop(StopPolicy::Drain).await {
        tracing::warn!(error = %e, "scheduler did not stop cleanly");
    }
    while dispatches.join_next().await.is_some() {}

    // Dropping the last client ends the server; dropping the last scheduler
    // handle closes the completion stream and then the event stream.
    drop(client);
    let _ = server_handle.await;
    drop(scheduler);
    let _ = completions.await;

    let abort = event_handle.abort_handle();
    if tokio::time::timeout(EVENT_DRAIN_TIMEOUT, event_handle)
        .await
        .is_err()
    {
        tracing::debug!("event forwarder still open after shutdown; aborting");
        abort.abort();
    }

    reader_result
}

/// Read commands line-by-line until EOF or `runtime.stop`.
async fn run_reader<R, W>(
    client: &HostCommandClient,
    input: R,
    writer: &SharedWriter<W>,
    dispatches: &mut JoinSet<()>,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut lines = input.lines();

    loop {
        let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| SyncError::Channel(format!("failed to read command input: {e}")))?
        else {
            tracing::info!("command input closed (EOF); shutting down bridge");
            break;
        };

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let envelope: CommandEnvelope = match serde_json::from_str(trimmed) {
            Ok(env) => env,
            Err(e) => {
                tracing::warn!(error = %e, raw_line = %trimmed, "failed to parse command envelope");
                let response = ResponseEnvelope::error(
                    "parse-error",
                    format!("failed to parse command envelope: {e}"),
                );
                write_response(writer, &response).await?;
                continue;
            }
        };

        if envelope.command == CommandName::RuntimeStop {
            dispatch(client, envelope, writer).await?;
            tracing::info!("runtime.stop received; shutting down bridge");
            break;
        }

        let client = client.clone();
        let writer = Arc::clone(writer);
        dispatches.spawn(async move {
            if let Err(e) = dispatch(&client, envelope, &writer).await {
                tracing::warn!(error = %e, "failed to write response envelope");
            }
        });
    }

    Ok(())
}

async fn dispatch<W>(
    client: &HostCommandClient,
    envelope: CommandEnvelope,
    writer: &SharedWriter<W>,
) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let request_id = envelope.request_id.clone();
    let response = match client.send(envelope).await {
        Ok(resp) => resp,
        Err(e) => {
            tracing::error!(error = %e, %request_id, "host command dispatch failed");
            ResponseEnvelope::error(request_id, e.to_string())
        }
    };
    write_response(writer, &response).await
}

async fn write_response<W>(writer: &SharedWriter<W>, response: &ResponseEnvelope) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let json = serde_json::to_string(response)
        .map_err(|e| SyncError::Channel(format!("failed to serialize response envelope: {e}")))?;
    let mut w = writer.lock().await;
    write_line(&mut w, &json).await
}

/// Write a single JSON line to the buffered writer and flush.
async fn write_line<W>(writer: &mut BufWriter<W>, json: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(json.as_bytes())
        .await
        .map_err(|e| SyncError::Channel(format!("failed to write output: {e}")))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| SyncError::Channel(format!("failed to write newline: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| SyncError::Channel(format!("failed to flush output: {e}")))?;
    Ok(())
}
