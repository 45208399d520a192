//! One-shot fallback: run the worker program once per request with the
//! payload as its last argument and take stdout as the answer.

use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, warn};

use super::error::{WorkerError, WorkerResult};
use super::process::CommandSpec;
use super::protocol::Answer;

/// Runs one fallback process per request.
#[derive(Debug, Clone)]
pub struct FallbackInvoker {
    spec: CommandSpec,
}

impl FallbackInvoker {
    pub fn new(spec: CommandSpec) -> Self {
        Self { spec }
    }

    pub fn spec(&self) -> &CommandSpec {
        &self.spec
    }

    /// Run the fallback command once for `payload`.
    ///
    /// The process is killed if it has not finished within `timeout`.
    pub async fn invoke_once(&self, payload: &str, timeout: Duration) -> WorkerResult<Answer> {
        let started = Instant::now();
        let mut child = self
            .spec
            .command()
            .arg(payload)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                WorkerError::Fallback(format!(
                    "failed to start {}: {e}",
                    self.spec.program.display()
                ))
            })?;
        let pid = child.id();
        debug!(pid, "fallback process started");

        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();

        let run = async {
            let (out, err) = tokio::join!(
                read_all(stdout.as_mut(), "stdout"),
                read_all(stderr.as_mut(), "stderr")
            );
            let status = child.wait().await;
            (out, err, status)
        };
        let outcome = tokio::time::timeout(timeout, run).await;

        let (out, err, status) = match outcome {
            Ok(finished) => finished,
            Err(_) => {
                warn!(pid, timeout_ms = timeout.as_millis() as u64, "fallback process timed out; killing");
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(WorkerError::Timeout(timeout));
            }
        };

        let status = status.map_err(|e| WorkerError::Fallback(format!("failed to wait: {e}")))?;
        let (out, err) = (out?, err?);
        let stdout = String::from_utf8_lossy(&out);
        let stderr = String::from_utf8_lossy(&err);
        let answer = stdout.trim();
        debug!(
            pid,
            code = status.code(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "fallback process finished"
        );

        if status.success() && !answer.is_empty() {
            return Ok(Answer::text(answer));
        }

        let mut reason = if status.success() {
            "produced no output".to_string()
        } else {
            format!("exited with {status}")
        };
        let stderr = stderr.trim();
        if !stderr.is_empty() {
            reason.push_str(": ");
            reason.push_str(stderr);
        }
        Err(WorkerError::Fallback(reason))
    }
}

async fn read_all<R: AsyncRead + Unpin>(
    stream: Option<&mut R>,
    name: &str,
) -> WorkerResult<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(stream) = stream {
        stream
            .read_to_end(&mut buf)
            .await
            .map_err(|e| WorkerError::Fallback(format!("failed to read {name}: {e}")))?;
    }
    Ok(buf)
}
