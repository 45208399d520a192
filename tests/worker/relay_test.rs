#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tether::config::Settings;
use tether::worker::{
    CommandSpec, FallbackInvoker, ProcessLauncher, Relay, RelayConfig, ShutdownOptions,
    ShutdownTrigger, SupervisorOptions, WorkerError, WorkerState,
};

/// Persistent worker speaking the NDJSON protocol.
///
/// Payload `crash` exits without replying, `fail` answers with an error and
/// anything else is echoed back with some metadata.
const WORKER_SCRIPT: &str = r#"
echo "loading model..." >&2
printf '{"type":"ready"}\n'
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"requestId":"\([^"]*\)".*/\1/p')
  payload=$(printf '%s' "$line" | sed -n 's/.*"payload":"\([^"]*\)".*/\1/p')
  case "$payload" in
    crash) exit 1 ;;
    fail) printf '{"requestId":"%s","error":"cannot answer"}\n' "$id" ;;
    *) printf '{"requestId":"%s","result":"echo: %s","processing_time":0.01}\n' "$id" "$payload" ;;
  esac
done
"#;

/// Worker that never signals readiness.
const SILENT_SCRIPT: &str = "exec sleep 30\n";

const FALLBACK_SCRIPT: &str = "echo \"fallback: $1\"\n";

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    path
}

fn config() -> RelayConfig {
    RelayConfig {
        request_timeout: Duration::from_secs(5),
        fallback_timeout: Duration::from_secs(5),
        supervisor: SupervisorOptions {
            restart_backoff: Duration::from_millis(100),
            ready_sentinel: None,
            grace_period: Duration::from_secs(1),
        },
        shutdown: ShutdownOptions {
            settle_delay: Duration::from_millis(10),
        },
    }
}

fn relay(dir: &TempDir, worker: &str, fallback: bool) -> Relay {
    let worker = write_script(dir.path(), "worker.sh", worker);
    let launcher = ProcessLauncher::new(CommandSpec::new("sh").args([worker.display().to_string()]));
    let fallback = fallback.then(|| {
        let script = write_script(dir.path(), "fallback.sh", FALLBACK_SCRIPT);
        FallbackInvoker::new(CommandSpec::new("sh").args([script.display().to_string()]))
    });
    Relay::new(Arc::new(launcher), fallback, config())
}

async fn wait_for_generation(relay: &Relay, generation: u64) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let health = relay.health().await;
        if health.generation >= generation && health.state == WorkerState::Ready {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "worker generation {generation} never became ready: {health:?}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_persistent_answer_keeps_metadata() {
    let dir = tempfile::tempdir().unwrap();
    let relay = relay(&dir, WORKER_SCRIPT, false);
    assert!(relay.wait_ready(Duration::from_secs(5)).await);

    let answer = relay.ask("hello").await.unwrap();
    assert_eq!(answer.text, "echo: hello");
    assert_eq!(answer.metadata["processing_time"], 0.01);

    relay.shutdown(ShutdownTrigger::Requested).await;
}

#[tokio::test]
async fn test_concurrent_requests_resolve_independently() {
    let dir = tempfile::tempdir().unwrap();
    let relay = Arc::new(relay(&dir, WORKER_SCRIPT, false));
    assert!(relay.wait_ready(Duration::from_secs(5)).await);

    let mut calls = Vec::new();
    for i in 0..16 {
        let relay = relay.clone();
        calls.push(tokio::spawn(async move {
            let payload = format!("q{i}");
            let answer = relay.ask(&payload).await.unwrap();
            (payload, answer.text)
        }));
    }
    for call in calls {
        let (payload, text) = call.await.unwrap();
        assert_eq!(text, format!("echo: {payload}"));
    }
    assert_eq!(relay.health().await.pending, 0);

    relay.shutdown(ShutdownTrigger::Requested).await;
}

#[tokio::test]
async fn test_worker_reported_error() {
    let dir = tempfile::tempdir().unwrap();
    let relay = relay(&dir, WORKER_SCRIPT, true);
    assert!(relay.wait_ready(Duration::from_secs(5)).await);

    match relay.ask_with_id("r-fail", "fail", None).await {
        Err(WorkerError::WorkerReported(message)) => assert_eq!(message, "cannot answer"),
        other => panic!("unexpected outcome: {other:?}"),
    }

    relay.shutdown(ShutdownTrigger::Requested).await;
}

#[tokio::test]
async fn test_crash_fails_request_and_worker_restarts() {
    let dir = tempfile::tempdir().unwrap();
    let relay = relay(&dir, WORKER_SCRIPT, false);
    assert!(relay.wait_ready(Duration::from_secs(5)).await);

    let err = relay.ask("crash").await.unwrap_err();
    assert!(matches!(err, WorkerError::WorkerClosed), "{err:?}");
    assert_eq!(relay.health().await.pending, 0);

    wait_for_generation(&relay, 2).await;
    let answer = relay.ask("again").await.unwrap();
    assert_eq!(answer.text, "echo: again");

    let health = relay.health().await;
    assert_eq!(health.restarts, 1);

    relay.shutdown(ShutdownTrigger::Requested).await;
}

#[tokio::test]
async fn test_fallback_serves_while_worker_not_ready() {
    let dir = tempfile::tempdir().unwrap();
    let relay = relay(&dir, SILENT_SCRIPT, true);

    let answer = relay.ask("hi").await.unwrap();
    assert_eq!(answer.text, "fallback: hi");
    assert_eq!(relay.health().await.state, WorkerState::Starting);

    relay.shutdown(ShutdownTrigger::Requested).await;
}

#[tokio::test]
async fn test_not_ready_without_fallback() {
    let dir = tempfile::tempdir().unwrap();
    let relay = relay(&dir, SILENT_SCRIPT, false);

    let err = relay.ask("hi").await.unwrap_err();
    assert!(matches!(err, WorkerError::NotReady));
    assert_eq!(err.kind(), "not_ready");

    relay.shutdown(ShutdownTrigger::Requested).await;
}

#[tokio::test]
async fn test_shutdown_stops_worker() {
    let dir = tempfile::tempdir().unwrap();
    let relay = relay(&dir, WORKER_SCRIPT, true);
    assert!(relay.wait_ready(Duration::from_secs(5)).await);

    let report = relay.shutdown(ShutdownTrigger::Signal("SIGTERM")).await.unwrap();
    assert!(report.worker_stopped);
    assert_eq!(report.failed_requests, 0);

    let health = relay.health().await;
    assert_eq!(health.state, WorkerState::Closed);
    assert!(health.shutting_down);

    let err = relay.ask("late").await.unwrap_err();
    assert!(matches!(err, WorkerError::ShuttingDown));
}

#[tokio::test]
async fn test_relay_from_settings_file() {
    let dir = tempfile::tempdir().unwrap();
    let worker = write_script(dir.path(), "worker.sh", WORKER_SCRIPT);
    let config_path = dir.path().join("tether.toml");
    std::fs::write(
        &config_path,
        format!(
            r#"
[worker]
command = "sh"
args = ["{}"]
working_dir = "{}"
restart_backoff = "100ms"

[fallback]
enabled = false

[requests]
timeout = "5s"

[shutdown]
grace_period = "1s"
settle_delay = "10ms"
"#,
            worker.display(),
            dir.path().display()
        ),
    )
    .unwrap();

    let settings = Settings::from_file(&config_path).unwrap();
    let relay = Relay::from_settings(&settings).unwrap();
    assert!(relay.wait_ready(Duration::from_secs(5)).await);
    assert!(!relay.health().await.fallback_enabled);

    let answer = relay.ask("configured").await.unwrap();
    assert_eq!(answer.text, "echo: configured");

    relay.shutdown(ShutdownTrigger::Requested).await;
}
