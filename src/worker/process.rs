//! Worker process lifecycle primitives.
//!
//! The supervisor only talks to [`WorkerLauncher`] and [`WorkerProcess`], so
//! tests can substitute in-memory pipes for a real child process.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncRead;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use super::correlator::BoxedWriter;
use super::error::{WorkerError, WorkerResult};

/// Type-erased read half of a worker pipe.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Pipes of a freshly launched worker.
pub struct WorkerIo {
    /// Requests are written here.
    pub stdin: BoxedWriter,
    /// Framed replies (and the ready frame) are read from here.
    pub stdout: BoxedReader,
    /// Free-form diagnostics; may carry the legacy readiness sentinel.
    pub stderr: Option<BoxedReader>,
}

/// Lifecycle handle to a running worker.
#[async_trait]
pub trait WorkerProcess: Send {
    /// OS process ID, if there is one and it has not been reaped.
    fn id(&self) -> Option<u32>;

    /// Wait for the process to exit and return its exit code (`None` when
    /// killed by a signal). Must be cancel-safe.
    async fn wait(&mut self) -> io::Result<Option<i32>>;

    /// Ask the process to exit.
    fn terminate(&mut self) -> io::Result<()>;

    /// Force the process to exit.
    fn kill(&mut self) -> io::Result<()>;
}

/// Source of worker processes.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self) -> WorkerResult<(Box<dyn WorkerProcess>, WorkerIo)>;
}

/// Program, arguments and environment for a worker or fallback process.
#[derive(Debug, Clone, Default)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub working_dir: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub(crate) fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args).envs(&self.env);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }
        command
    }
}

/// Launches the persistent worker as a child process with piped stdio.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    spec: CommandSpec,
}

impl ProcessLauncher {
    pub fn new(spec: CommandSpec) -> Self {
        Self { spec }
    }

    pub fn spec(&self) -> &CommandSpec {
        &self.spec
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self) -> WorkerResult<(Box<dyn WorkerProcess>, WorkerIo)> {
        let mut child = self
            .spec
            .command()
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(WorkerError::SpawnFailed)?;

        let stdin = child.stdin.take().ok_or_else(|| pipe_missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| pipe_missing("stdout"))?;
        let stderr = child.stderr.take();

        info!(
            pid = child.id(),
            program = %self.spec.program.display(),
            "worker process spawned"
        );

        let io = WorkerIo {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: stderr.map(|s| Box::new(s) as BoxedReader),
        };
        Ok((Box::new(ChildProcess { child }), io))
    }
}

fn pipe_missing(name: &str) -> WorkerError {
    WorkerError::SpawnFailed(io::Error::new(
        io::ErrorKind::Other,
        format!("{name} not captured"),
    ))
}

/// A real child process.
pub struct ChildProcess {
    child: Child,
}

impl ChildProcess {
    pub fn new(child: Child) -> Self {
        Self { child }
    }
}

#[async_trait]
impl WorkerProcess for ChildProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> io::Result<Option<i32>> {
        Ok(self.child.wait().await?.code())
    }

    fn terminate(&mut self) -> io::Result<()> {
        #[cfg(unix)]
        {
            let Some(pid) = self.child.id() else {
                return Ok(());
            };
            let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
            if rc == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            // Already gone.
            if err.raw_os_error() == Some(libc::ESRCH) {
                return Ok(());
            }
            Err(err)
        }
        #[cfg(not(unix))]
        {
            self.child.start_kill()
        }
    }

    fn kill(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }
}

/// Ask `process` to exit and kill it if it is still running after `grace`.
///
/// Returns the exit code, or `None` if the process died from a signal or
/// could not be waited on.
pub async fn stop_process(process: &mut dyn WorkerProcess, grace: Duration) -> Option<i32> {
    let pid = process.id();
    if let Err(e) = process.terminate() {
        debug!(pid, error = %e, "terminate request failed");
    }

    match tokio::time::timeout(grace, process.wait()).await {
        Ok(Ok(code)) => {
            debug!(pid, code, "worker exited after terminate request");
            return code;
        }
        Ok(Err(e)) => {
            warn!(pid, error = %e, "failed to wait for worker");
            return None;
        }
        Err(_) => {
            warn!(
                pid,
                grace_ms = grace.as_millis() as u64,
                "worker ignored terminate request; killing"
            );
        }
    }

    if let Err(e) = process.kill() {
        warn!(pid, error = %e, "failed to kill worker");
    }
    match process.wait().await {
        Ok(code) => code,
        Err(e) => {
            warn!(pid, error = %e, "failed to reap worker");
            None
        }
    }
}
