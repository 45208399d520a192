//! Persistent worker supervision.
//!
//! ```text
//!            launch                 ready frame / sentinel
//!  Starting ────────▶ (running) ──────────────────────────▶ Ready
//!     ▲                   │                                   │
//!     │ backoff           │ exit / stream closed / shutdown   │
//!     └──────────── Closed ◀──────────────────────────────────┘
//! ```
//!
//! Each launched instance gets a new generation number. On `Closed` the
//! instance is detached from the [`Correlator`] and everything still pending
//! fails with `WorkerClosed` before the next instance is launched.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::correlator::{Correlator, WorkerLink};
use super::decoder::{DecodeEvent, FrameDecoder, MAX_LINE_BYTES};
use super::error::CloseReason;
use super::process::{stop_process, BoxedReader, WorkerIo, WorkerLauncher, WorkerProcess};
use super::protocol::Frame;

/// Default delay before relaunching a worker that exited.
pub const DEFAULT_RESTART_BACKOFF: Duration = Duration::from_secs(2);

/// Default time a worker gets to exit after a terminate request.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Stderr substring the legacy worker prints once initialised.
pub const DEFAULT_READY_SENTINEL: &str = "READY";

/// How long buffered replies are still read after the worker exits.
const DRAIN_WINDOW: Duration = Duration::from_millis(250);

const READ_CHUNK: usize = 8 * 1024;

/// Log target for text the worker writes outside the framed protocol.
const WORKER_OUTPUT: &str = "tether::worker_output";

/// Lifecycle state of the current worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Starting,
    Ready,
    Closed,
}

/// Supervisor tuning.
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub restart_backoff: Duration,
    /// Also accept this stderr substring as the readiness signal.
    pub ready_sentinel: Option<String>,
    pub grace_period: Duration,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            restart_backoff: DEFAULT_RESTART_BACKOFF,
            ready_sentinel: Some(DEFAULT_READY_SENTINEL.to_string()),
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }
}

struct Shared {
    launcher: Arc<dyn WorkerLauncher>,
    correlator: Correlator,
    options: SupervisorOptions,
    state: watch::Sender<WorkerState>,
    stopping: watch::Sender<bool>,
    generation: AtomicU64,
    restarts: AtomicU64,
}

/// Owns the persistent worker: launches it, detects readiness and exit, and
/// relaunches it after a backoff until shutdown.
pub struct Supervisor {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

enum Exit {
    Exited(std::io::Result<Option<i32>>),
    StreamClosed,
    Shutdown,
}

impl Supervisor {
    /// Start supervising. Must be called from within a Tokio runtime.
    pub fn start(
        launcher: Arc<dyn WorkerLauncher>,
        correlator: Correlator,
        options: SupervisorOptions,
    ) -> Self {
        let (state, _) = watch::channel(WorkerState::Starting);
        let (stopping, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            launcher,
            correlator,
            options,
            state,
            stopping,
            generation: AtomicU64::new(0),
            restarts: AtomicU64::new(0),
        });
        let task = tokio::spawn(shared.clone().run());
        Self {
            shared,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn correlator(&self) -> &Correlator {
        &self.shared.correlator
    }

    pub fn options(&self) -> &SupervisorOptions {
        &self.shared.options
    }

    pub fn state(&self) -> WorkerState {
        *self.shared.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.shared.state.subscribe()
    }

    /// Generation of the most recently launched worker (0 before the first launch).
    pub fn generation(&self) -> u64 {
        self.shared.generation.load(Ordering::SeqCst)
    }

    /// How many times a worker has been relaunched.
    pub fn restarts(&self) -> u64 {
        self.shared.restarts.load(Ordering::SeqCst)
    }

    /// Wait until a worker is `Ready`. Returns `false` on timeout.
    pub async fn wait_ready(&self, timeout: Duration) -> bool {
        let mut state = self.subscribe();
        tokio::time::timeout(timeout, state.wait_for(|s| *s == WorkerState::Ready))
            .await
            .is_ok_and(|r| r.is_ok())
    }

    pub fn is_stopping(&self) -> bool {
        *self.shared.stopping.borrow()
    }

    /// Stop relaunching. The current worker, if any, is stopped by the
    /// supervision task with the configured grace period.
    pub fn begin_shutdown(&self) {
        self.shared.stopping.send_replace(true);
    }

    /// Wait for the supervision task to finish, aborting it after `limit`.
    /// Returns `false` if it had to be aborted.
    pub async fn join(&self, limit: Duration) -> bool {
        let Some(mut task) = self.task.lock().await.take() else {
            return true;
        };
        match tokio::time::timeout(limit, &mut task).await {
            Ok(_) => true,
            Err(_) => {
                warn!(limit_ms = limit.as_millis() as u64, "supervisor did not stop in time; aborting");
                task.abort();
                false
            }
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.shared.stopping.send_replace(true);
    }
}

impl Shared {
    async fn run(self: Arc<Self>) {
        let mut stopping = self.stopping.subscribe();

        loop {
            if *stopping.borrow() {
                break;
            }

            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            self.state.send_replace(WorkerState::Starting);
            debug!(generation, "starting worker");

            match self.launcher.launch().await {
                Ok((process, io)) => self.supervise(generation, process, io, &mut stopping).await,
                Err(e) => error!(generation, error = %e, "failed to launch worker"),
            }

            self.correlator.detach(generation).await;
            self.state.send_replace(WorkerState::Closed);
            self.correlator.fail_all(CloseReason::WorkerClosed).await;

            if *stopping.borrow() {
                break;
            }

            let backoff = self.options.restart_backoff;
            info!(
                generation,
                backoff_ms = backoff.as_millis() as u64,
                "worker closed; restarting after backoff"
            );
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {
                    self.restarts.fetch_add(1, Ordering::SeqCst);
                }
                _ = shutdown_requested(&mut stopping) => {}
            }
        }

        info!("worker supervision stopped");
    }

    async fn supervise(
        &self,
        generation: u64,
        mut process: Box<dyn WorkerProcess>,
        io: WorkerIo,
        stopping: &mut watch::Receiver<bool>,
    ) {
        let pid = process.id();
        let link = WorkerLink::new(generation, io.stdin);
        let (ready_tx, mut ready_rx) = mpsc::unbounded_channel();

        let mut stdout_task = tokio::spawn(pump_stdout(
            io.stdout,
            generation,
            self.correlator.clone(),
            ready_tx.clone(),
        ));
        let stderr_task = io.stderr.map(|stderr| {
            tokio::spawn(watch_stderr(
                stderr,
                generation,
                self.options.ready_sentinel.clone(),
                MAX_LINE_BYTES,
                ready_tx,
            ))
        });

        let mut ready = false;
        let exit = loop {
            tokio::select! {
                status = process.wait() => break Exit::Exited(status),
                Some(()) = ready_rx.recv(), if !ready => {
                    ready = true;
                    self.correlator.attach(link.clone()).await;
                    self.state.send_replace(WorkerState::Ready);
                    info!(generation, pid, "worker ready");
                }
                _ = &mut stdout_task => break Exit::StreamClosed,
                _ = shutdown_requested(stopping) => break Exit::Shutdown,
            }
        };

        // Nothing new may reach this instance from here on.
        self.correlator.detach(generation).await;
        self.state.send_replace(WorkerState::Closed);

        let stdout_open = match exit {
            Exit::Exited(status) => {
                match status {
                    Ok(code) if *stopping.borrow() => info!(generation, pid, code, "worker exited"),
                    Ok(code) => warn!(generation, pid, code, "worker exited unexpectedly"),
                    Err(e) => warn!(generation, pid, error = %e, "failed to wait for worker"),
                }
                true
            }
            Exit::StreamClosed => {
                warn!(generation, pid, "worker output stream closed; stopping worker");
                link.close();
                let code = stop_process(process.as_mut(), self.options.grace_period).await;
                debug!(generation, pid, code, "worker stopped");
                false
            }
            Exit::Shutdown => {
                info!(generation, pid, "stopping worker for shutdown");
                link.close();
                let code = stop_process(process.as_mut(), self.options.grace_period).await;
                info!(generation, pid, code, "worker stopped");
                true
            }
        };

        // Replies flushed just before exit still complete their requests.
        if stdout_open && tokio::time::timeout(DRAIN_WINDOW, &mut stdout_task).await.is_err() {
            stdout_task.abort();
        }
        if let Some(task) = stderr_task {
            task.abort();
        }
    }
}

/// Resolves once shutdown has been requested, immediately if it already was.
async fn shutdown_requested(stopping: &mut watch::Receiver<bool>) {
    let _ = stopping.wait_for(|stopping| *stopping).await;
}

async fn pump_stdout(
    mut stdout: BoxedReader,
    generation: u64,
    correlator: Correlator,
    ready: mpsc::UnboundedSender<()>,
) {
    let mut decoder = FrameDecoder::new();
    let mut chunk = vec![0u8; READ_CHUNK];

    loop {
        let n = match stdout.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!(generation, error = %e, "failed to read worker stdout");
                break;
            }
        };
        for event in decoder.push(&chunk[..n]) {
            dispatch(event, generation, &correlator, &ready).await;
        }
    }

    if let Some(event) = decoder.finish() {
        dispatch(event, generation, &correlator, &ready).await;
    }
    debug!(generation, "worker stdout closed");
}

async fn dispatch(
    event: DecodeEvent,
    generation: u64,
    correlator: &Correlator,
    ready: &mpsc::UnboundedSender<()>,
) {
    match event {
        DecodeEvent::Frame(Frame::Reply(reply)) => {
            correlator.on_frame(generation, reply).await;
        }
        DecodeEvent::Frame(Frame::Ready) => {
            let _ = ready.send(());
        }
        DecodeEvent::Frame(Frame::Diagnostic(line)) => {
            debug!(target: WORKER_OUTPUT, generation, stream = "stdout", "{line}");
        }
        DecodeEvent::Warning { line, reason } => {
            warn!(generation, %reason, line = %line, "undecodable worker output");
        }
    }
}

async fn watch_stderr(
    stderr: BoxedReader,
    generation: u64,
    sentinel: Option<String>,
    max_line: usize,
    ready: mpsc::UnboundedSender<()>,
) {
    let mut reader = BufReader::new(stderr);
    let mut raw = Vec::new();
    let mut discarding = false;

    loop {
        raw.clear();
        let limit = max_line as u64 + 1;
        match (&mut reader).take(limit).read_until(b'\n', &mut raw).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(generation, error = %e, "failed to read worker stderr");
                break;
            }
        }

        let terminated = raw.last() == Some(&b'\n');
        if discarding {
            discarding = !terminated;
            continue;
        }
        if raw.len() - usize::from(terminated) > max_line {
            warn!(generation, max_line, "worker stderr line too long; discarded");
            discarding = !terminated;
            continue;
        }

        let text = String::from_utf8_lossy(&raw);
        let line = text.trim_end();
        if line.is_empty() {
            continue;
        }
        if sentinel.as_deref().is_some_and(|s| line.contains(s)) {
            debug!(generation, line, "readiness sentinel seen");
            let _ = ready.send(());
        } else {
            info!(target: WORKER_OUTPUT, generation, stream = "stderr", "{line}");
        }
    }
}
