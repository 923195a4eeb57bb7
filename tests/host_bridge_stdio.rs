//! Drives the JSON bridge over in-memory pipes with a real sync script.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines};
use vault_sync::host::contract::{CommandEnvelope, CommandName, ResponseEnvelope};
use vault_sync::host::stdio::run_bridge;
use vault_sync::{MemoryStore, SchedulerConfig};

fn write_sync_script(vault: &Path) {
    std::fs::write(
        vault.join("sync.sh"),
        "printf '%s' \"$1\" > last-message.txt\necho 'No changes to commit'\n",
    )
    .expect("write script");
}

async fn send(input: &mut DuplexStream, envelope: &CommandEnvelope) {
    let mut line = serde_json::to_string(envelope).expect("serialize envelope");
    line.push('\n');
    input.write_all(line.as_bytes()).await.expect("write command");
}

/// Read output lines until the response for `request_id`; returns it and the
/// names of the events seen on the way.
async fn response_for(
    lines: &mut Lines<BufReader<DuplexStream>>,
    request_id: &str,
) -> (ResponseEnvelope, Vec<String>) {
    let mut events = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let line = lines
                .next_line()
                .await
                .expect("read output")
                .expect("output open");
            let value: serde_json::Value = serde_json::from_str(&line).expect("json line");
            if let Some(event) = value.get("event").and_then(serde_json::Value::as_str) {
                events.push(event.to_owned());
                continue;
            }
            let response: ResponseEnvelope = serde_json::from_value(value).expect("response");
            if response.request_id == request_id {
                return response;
            }
        }
    })
    .await
    .map(|response| (response, events))
    .expect("response arrives in time")
}

#[tokio::test]
async fn bridge_runs_sync_and_stops_on_runtime_stop() {
    let vault = tempfile::tempdir().expect("tempdir");
    write_sync_script(vault.path());
    let store = Arc::new(MemoryStore::with_document(serde_json::json!({
        "syncScript": "sync.sh",
        "interpreter": "sh"
    })));

    let (mut host_in, bridge_in) = tokio::io::duplex(16 * 1024);
    let (bridge_out, host_out) = tokio::io::duplex(16 * 1024);
    let config = SchedulerConfig::new(vault.path(), store.clone());
    let bridge = tokio::spawn(run_bridge(config, BufReader::new(bridge_in), bridge_out));
    let mut lines = BufReader::new(host_out).lines();

    send(
        &mut host_in,
        &CommandEnvelope::new(
            "req-sync",
            CommandName::SyncTrigger,
            serde_json::json!({"message": "from the host"}),
        ),
    )
    .await;
    let (synced, events) = response_for(&mut lines, "req-sync").await;
    assert!(synced.ok, "{synced:?}");
    assert_eq!(synced.payload["status"], "success");
    assert_eq!(synced.payload["no_changes"], true);
    assert!(events.iter().any(|e| e == "sync.notice"), "{events:?}");
    assert_eq!(
        std::fs::read_to_string(vault.path().join("last-message.txt")).expect("script ran"),
        "from the host"
    );

    host_in
        .write_all(b"this is not json\n")
        .await
        .expect("write garbage");
    let (parse_error, _) = response_for(&mut lines, "parse-error").await;
    assert!(!parse_error.ok);

    send(
        &mut host_in,
        &CommandEnvelope::new("req-stop", CommandName::RuntimeStop, serde_json::json!({})),
    )
    .await;
    let (stopped, _) = response_for(&mut lines, "req-stop").await;
    assert!(stopped.ok);

    tokio::time::timeout(Duration::from_secs(10), bridge)
        .await
        .expect("bridge exits")
        .expect("bridge task")
        .expect("bridge result");
    assert_eq!(store.document().expect("persisted")["syncCount"], 1);
}

#[tokio::test]
async fn bridge_exits_when_input_closes() {
    let vault = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(MemoryStore::new());

    let (mut host_in, bridge_in) = tokio::io::duplex(4096);
    let (bridge_out, host_out) = tokio::io::duplex(4096);
    let config = SchedulerConfig::new(vault.path(), store);
    let bridge = tokio::spawn(run_bridge(config, BufReader::new(bridge_in), bridge_out));
    let mut lines = BufReader::new(host_out).lines();

    send(
        &mut host_in,
        &CommandEnvelope::new("req-ping", CommandName::HostPing, serde_json::json!({})),
    )
    .await;
    let (pong, _) = response_for(&mut lines, "req-ping").await;
    assert_eq!(pong.payload["pong"], true);

    drop(host_in);
    tokio::time::timeout(Duration::from_secs(10), bridge)
        .await
        .expect("bridge exits")
        .expect("bridge task")
        .expect("bridge result");
}
