//! Orderly teardown of the persistent worker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tracing::{info, warn};

use super::error::CloseReason;
use super::supervisor::Supervisor;

/// Default pause after the worker is gone, before shutdown completes.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(500);

/// Extra time allowed on top of the grace period for the kill to land.
const KILL_WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct ShutdownOptions {
    pub settle_delay: Duration,
}

impl Default for ShutdownOptions {
    fn default() -> Self {
        Self {
            settle_delay: DEFAULT_SETTLE_DELAY,
        }
    }
}

/// What started the shutdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownTrigger {
    Signal(&'static str),
    InputClosed,
    Fatal(String),
    Requested,
}

impl std::fmt::Display for ShutdownTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Signal(name) => write!(f, "signal {name}"),
            Self::InputClosed => f.write_str("input closed"),
            Self::Fatal(reason) => write!(f, "fatal error: {reason}"),
            Self::Requested => f.write_str("requested"),
        }
    }
}

/// Outcome of a completed shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Requests that were still pending and failed with `ShuttingDown`.
    pub failed_requests: usize,
    /// Whether the supervision task finished on its own.
    pub worker_stopped: bool,
}

/// Runs the shutdown sequence at most once.
pub struct ShutdownCoordinator {
    supervisor: Arc<Supervisor>,
    options: ShutdownOptions,
    started: AtomicBool,
}

impl ShutdownCoordinator {
    pub fn new(supervisor: Arc<Supervisor>, options: ShutdownOptions) -> Self {
        Self {
            supervisor,
            options,
            started: AtomicBool::new(false),
        }
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Stop accepting work, fail what is pending, stop the worker and wait
    /// for the settle delay.
    ///
    /// Returns `None` if a shutdown was already started by another caller.
    pub async fn run(&self, trigger: ShutdownTrigger) -> Option<ShutdownReport> {
        if self.started.swap(true, Ordering::SeqCst) {
            return None;
        }
        info!(%trigger, "shutting down");

        let correlator = self.supervisor.correlator();
        correlator.close().await;
        self.supervisor.begin_shutdown();
        let failed_requests = correlator.fail_all(CloseReason::ShuttingDown).await;
        if failed_requests > 0 {
            info!(failed_requests, "failed pending requests");
        }

        let limit = self.supervisor.options().grace_period + KILL_WAIT;
        let worker_stopped = self.supervisor.join(limit).await;
        if !worker_stopped {
            warn!("worker supervision had to be aborted");
        }

        tokio::time::sleep(self.options.settle_delay).await;
        info!("shutdown complete");

        Some(ShutdownReport {
            failed_requests,
            worker_stopped,
        })
    }
}

/// Wait for Ctrl-C, or SIGTERM on unix.
pub async fn wait_for_signal() -> std::io::Result<ShutdownTrigger> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal as unix_signal, SignalKind};

        let mut terminate = unix_signal(SignalKind::terminate())?;
        tokio::select! {
            result = signal::ctrl_c() => {
                result?;
                Ok(ShutdownTrigger::Signal("SIGINT"))
            }
            _ = terminate.recv() => Ok(ShutdownTrigger::Signal("SIGTERM")),
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await?;
        Ok(ShutdownTrigger::Signal("ctrl-c"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::correlator::Correlator;
    use crate::worker::error::WorkerError;
    use crate::worker::fake::FakeLauncher;
    use crate::worker::supervisor::{SupervisorOptions, WorkerState};

    fn options() -> SupervisorOptions {
        SupervisorOptions {
            restart_backoff: Duration::from_millis(50),
            ready_sentinel: None,
            grace_period: Duration::from_millis(200),
        }
    }

    fn quick_settle() -> ShutdownOptions {
        ShutdownOptions {
            settle_delay: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn test_pending_requests_fail_with_shutting_down() {
        let (launcher, mut workers) = FakeLauncher::new();
        let supervisor = Arc::new(Supervisor::start(launcher.clone(), Correlator::new(), options()));
        let mut worker = workers.recv().await.unwrap();
        worker.ready().await;
        assert!(supervisor.wait_ready(Duration::from_secs(2)).await);

        let correlator = supervisor.correlator().clone();
        let call = tokio::spawn(async move {
            correlator.submit("r1", "p", Duration::from_secs(10)).await
        });
        worker.next_request().await;

        let coordinator = ShutdownCoordinator::new(supervisor.clone(), quick_settle());
        let report = coordinator.run(ShutdownTrigger::Requested).await.unwrap();

        assert_eq!(report.failed_requests, 1);
        assert!(report.worker_stopped);
        assert!(matches!(call.await.unwrap(), Err(WorkerError::ShuttingDown)));
        assert_eq!(supervisor.state(), WorkerState::Closed);
        assert!(worker.has_exited());
        assert_eq!(launcher.stats.launches(), 1);

        let err = supervisor
            .correlator()
            .submit("r2", "p", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::ShuttingDown));
    }

    #[tokio::test]
    async fn test_runs_once() {
        let (launcher, _workers) = FakeLauncher::new();
        let supervisor = Arc::new(Supervisor::start(launcher, Correlator::new(), options()));
        let coordinator = ShutdownCoordinator::new(supervisor, quick_settle());

        assert!(coordinator.run(ShutdownTrigger::InputClosed).await.is_some());
        assert!(coordinator.is_started());
        assert!(coordinator.run(ShutdownTrigger::Signal("SIGTERM")).await.is_none());
    }

    #[tokio::test]
    async fn test_completes_when_worker_never_started() {
        let (launcher, _workers) = FakeLauncher::failing(usize::MAX);
        let supervisor = Arc::new(Supervisor::start(launcher, Correlator::new(), options()));
        tokio::time::sleep(Duration::from_millis(20)).await;

        let coordinator = ShutdownCoordinator::new(supervisor.clone(), quick_settle());
        let report = coordinator
            .run(ShutdownTrigger::Fatal("config".into()))
            .await
            .unwrap();
        assert_eq!(report.failed_requests, 0);
        assert!(report.worker_stopped);
        assert_eq!(supervisor.state(), WorkerState::Closed);
    }

    #[tokio::test]
    async fn test_stubborn_worker_is_killed() {
        let (launcher, mut workers) = FakeLauncher::stubborn();
        let supervisor = Arc::new(Supervisor::start(launcher.clone(), Correlator::new(), options()));
        let mut worker = workers.recv().await.unwrap();
        worker.ready().await;
        assert!(supervisor.wait_ready(Duration::from_secs(2)).await);

        let coordinator = ShutdownCoordinator::new(supervisor, quick_settle());
        let report = coordinator.run(ShutdownTrigger::Requested).await.unwrap();
        assert!(report.worker_stopped);
        assert_eq!(launcher.stats.terminations(), 1);
        assert_eq!(launcher.stats.kills(), 1);
    }

    #[test]
    fn test_trigger_display() {
        assert_eq!(ShutdownTrigger::Signal("SIGTERM").to_string(), "signal SIGTERM");
        assert_eq!(ShutdownTrigger::InputClosed.to_string(), "input closed");
    }
}
