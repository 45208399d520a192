//! In-memory worker processes for exercising the supervisor without spawning anything.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines};
use tokio::sync::{mpsc, watch};

use super::error::{WorkerError, WorkerResult};
use super::process::{WorkerIo, WorkerLauncher, WorkerProcess};

const PIPE_CAPACITY: usize = 64 * 1024;

/// Test-side end of a launched fake worker.
pub struct FakeWorker {
    requests: Lines<BufReader<DuplexStream>>,
    stdout: DuplexStream,
    stderr: DuplexStream,
    exit: Arc<watch::Sender<bool>>,
}

impl FakeWorker {
    /// Write one line to the worker's stdout.
    pub async fn say(&mut self, line: &str) {
        self.stdout.write_all(line.as_bytes()).await.unwrap();
        self.stdout.write_all(b"\n").await.unwrap();
    }

    /// Write `text` to the worker's stdout without a line terminator.
    pub async fn say_unterminated(&mut self, text: &str) {
        self.stdout.write_all(text.as_bytes()).await.unwrap();
    }

    /// Write one line to the worker's stderr.
    pub async fn log(&mut self, line: &str) {
        self.stderr.write_all(line.as_bytes()).await.unwrap();
        self.stderr.write_all(b"\n").await.unwrap();
    }

    pub async fn ready(&mut self) {
        self.say(r#"{"type":"ready"}"#).await;
    }

    /// Next request envelope written by the correlator.
    pub async fn next_request(&mut self) -> Value {
        let line = self.requests.next_line().await.unwrap().unwrap();
        serde_json::from_str(&line).unwrap()
    }

    /// Answer `request_id` with `result`.
    pub async fn reply(&mut self, request_id: &str, result: &str) {
        let line = serde_json::json!({"requestId": request_id, "result": result}).to_string();
        self.say(&line).await;
    }

    /// Exit abruptly, closing every pipe.
    pub fn crash(self) {
        self.exit.send_replace(true);
    }

    pub fn has_exited(&self) -> bool {
        *self.exit.borrow()
    }
}

/// Counters shared between a launcher and its processes.
#[derive(Default)]
pub struct FakeStats {
    pub launches: AtomicUsize,
    pub terminations: AtomicUsize,
    pub kills: AtomicUsize,
}

impl FakeStats {
    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }
    pub fn terminations(&self) -> usize {
        self.terminations.load(Ordering::SeqCst)
    }
    pub fn kills(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }
}

struct FakeProcess {
    exited: watch::Receiver<bool>,
    exit: Arc<watch::Sender<bool>>,
    honours_terminate: bool,
    stats: Arc<FakeStats>,
}

#[async_trait]
impl WorkerProcess for FakeProcess {
    fn id(&self) -> Option<u32> {
        None
    }

    async fn wait(&mut self) -> io::Result<Option<i32>> {
        let _ = self.exited.wait_for(|exited| *exited).await;
        Ok(Some(0))
    }

    fn terminate(&mut self) -> io::Result<()> {
        self.stats.terminations.fetch_add(1, Ordering::SeqCst);
        if self.honours_terminate {
            self.exit.send_replace(true);
        }
        Ok(())
    }

    fn kill(&mut self) -> io::Result<()> {
        self.stats.kills.fetch_add(1, Ordering::SeqCst);
        self.exit.send_replace(true);
        Ok(())
    }
}

/// Launcher handing the test side of each fake worker through a channel.
pub struct FakeLauncher {
    workers: mpsc::UnboundedSender<FakeWorker>,
    honours_terminate: bool,
    failures_left: AtomicUsize,
    pub stats: Arc<FakeStats>,
}

impl FakeLauncher {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<FakeWorker>) {
        Self::build(true, 0)
    }

    /// Workers that ignore terminate requests and must be killed.
    pub fn stubborn() -> (Arc<Self>, mpsc::UnboundedReceiver<FakeWorker>) {
        Self::build(false, 0)
    }

    /// The first `failures` launches fail to spawn.
    pub fn failing(failures: usize) -> (Arc<Self>, mpsc::UnboundedReceiver<FakeWorker>) {
        Self::build(true, failures)
    }

    fn build(
        honours_terminate: bool,
        failures: usize,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<FakeWorker>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let launcher = Self {
            workers: tx,
            honours_terminate,
            failures_left: AtomicUsize::new(failures),
            stats: Arc::new(FakeStats::default()),
        };
        (Arc::new(launcher), rx)
    }
}

#[async_trait]
impl WorkerLauncher for FakeLauncher {
    async fn launch(&self) -> WorkerResult<(Box<dyn WorkerProcess>, WorkerIo)> {
        self.stats.launches.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(WorkerError::SpawnFailed(io::Error::from(
                io::ErrorKind::NotFound,
            )));
        }

        let (stdin_ours, stdin_theirs) = duplex(PIPE_CAPACITY);
        let (stdout_theirs, stdout_ours) = duplex(PIPE_CAPACITY);
        let (stderr_theirs, stderr_ours) = duplex(PIPE_CAPACITY);
        let (exit, exited) = watch::channel(false);
        let exit = Arc::new(exit);

        let process = FakeProcess {
            exited,
            exit: exit.clone(),
            honours_terminate: self.honours_terminate,
            stats: self.stats.clone(),
        };
        let _ = self.workers.send(FakeWorker {
            requests: BufReader::new(stdin_theirs).lines(),
            stdout: stdout_theirs,
            stderr: stderr_theirs,
            exit,
        });

        let io = WorkerIo {
            stdin: Box::new(stdin_ours),
            stdout: Box::new(stdout_ours),
            stderr: Some(Box::new(stderr_ours)),
        };
        Ok((Box::new(process), io))
    }
}
