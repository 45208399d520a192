//! Front door for callers: one `ask` that uses the persistent worker when it
//! is ready and the one-shot fallback when it is not.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use super::correlator::Correlator;
use super::error::WorkerResult;
use super::fallback::FallbackInvoker;
use super::process::{ProcessLauncher, WorkerLauncher};
use super::protocol::Answer;
use super::shutdown::{ShutdownCoordinator, ShutdownOptions, ShutdownReport, ShutdownTrigger};
use super::supervisor::{Supervisor, SupervisorOptions, WorkerState};
use crate::config::{Settings, SettingsError};

/// Default deadline for a request on the persistent path.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default deadline for a fallback process.
pub const DEFAULT_FALLBACK_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub request_timeout: Duration,
    pub fallback_timeout: Duration,
    pub supervisor: SupervisorOptions,
    pub shutdown: ShutdownOptions,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            fallback_timeout: DEFAULT_FALLBACK_TIMEOUT,
            supervisor: SupervisorOptions::default(),
            shutdown: ShutdownOptions::default(),
        }
    }
}

impl RelayConfig {
    pub fn from_settings(settings: &Settings) -> Result<Self, SettingsError> {
        Ok(Self {
            request_timeout: settings.requests.timeout()?,
            fallback_timeout: settings.requests.fallback_timeout()?,
            supervisor: SupervisorOptions {
                restart_backoff: settings.worker.restart_backoff()?,
                ready_sentinel: settings.worker.ready_sentinel.clone(),
                grace_period: settings.shutdown.grace_period()?,
            },
            shutdown: ShutdownOptions {
                settle_delay: settings.shutdown.settle_delay()?,
            },
        })
    }
}

/// Point-in-time view of the relay.
#[derive(Debug, Clone, Serialize)]
pub struct Health {
    pub state: WorkerState,
    pub generation: u64,
    pub restarts: u64,
    pub pending: usize,
    pub fallback_enabled: bool,
    pub shutting_down: bool,
}

/// Routes requests to the persistent worker or the fallback process.
pub struct Relay {
    supervisor: Arc<Supervisor>,
    fallback: Option<FallbackInvoker>,
    coordinator: ShutdownCoordinator,
    config: RelayConfig,
}

impl Relay {
    /// Start supervising a worker from `launcher`. Must be called from within
    /// a Tokio runtime.
    pub fn new(
        launcher: Arc<dyn WorkerLauncher>,
        fallback: Option<FallbackInvoker>,
        config: RelayConfig,
    ) -> Self {
        let supervisor = Arc::new(Supervisor::start(
            launcher,
            Correlator::new(),
            config.supervisor.clone(),
        ));
        let coordinator = ShutdownCoordinator::new(supervisor.clone(), config.shutdown.clone());
        Self {
            supervisor,
            fallback,
            coordinator,
            config,
        }
    }

    /// Build a relay running real processes as described by `settings`.
    pub fn from_settings(settings: &Settings) -> Result<Self, SettingsError> {
        settings.validate()?;
        let config = RelayConfig::from_settings(settings)?;
        let launcher = ProcessLauncher::new(settings.worker.command_spec()?);
        let fallback = settings
            .fallback
            .command_spec(&settings.worker)?
            .map(FallbackInvoker::new);
        Ok(Self::new(Arc::new(launcher), fallback, config))
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    /// Ask with a generated request id and the configured timeout.
    pub async fn ask(&self, payload: &str) -> WorkerResult<Answer> {
        let request_id = Uuid::new_v4().to_string();
        self.ask_with_id(&request_id, payload, None).await
    }

    /// Ask with a caller-chosen request id.
    ///
    /// Falls back to a one-shot process when the persistent worker is not
    /// ready or cannot be written to. `timeout` defaults to the configured
    /// request timeout on the persistent path and the fallback timeout on
    /// the one-shot path.
    pub async fn ask_with_id(
        &self,
        request_id: &str,
        payload: &str,
        timeout: Option<Duration>,
    ) -> WorkerResult<Answer> {
        let started = Instant::now();
        let persistent_timeout = timeout.unwrap_or(self.config.request_timeout);

        let err = match self
            .supervisor
            .correlator()
            .submit(request_id, payload, persistent_timeout)
            .await
        {
            Ok(answer) => {
                debug!(
                    request_id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "answered by persistent worker"
                );
                return Ok(answer);
            }
            Err(err) => err,
        };

        let Some(fallback) = self.fallback.as_ref().filter(|_| err.is_recoverable_by_fallback())
        else {
            return Err(err);
        };

        info!(request_id, reason = %err, "using fallback process");
        let answer = fallback
            .invoke_once(payload, timeout.unwrap_or(self.config.fallback_timeout))
            .await?;
        debug!(
            request_id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "answered by fallback process"
        );
        Ok(answer)
    }

    /// Wait up to `timeout` for the persistent worker to become ready.
    pub async fn wait_ready(&self, timeout: Duration) -> bool {
        self.supervisor.wait_ready(timeout).await
    }

    pub async fn health(&self) -> Health {
        Health {
            state: self.supervisor.state(),
            generation: self.supervisor.generation(),
            restarts: self.supervisor.restarts(),
            pending: self.supervisor.correlator().pending_count().await,
            fallback_enabled: self.fallback.is_some(),
            shutting_down: self.coordinator.is_started(),
        }
    }

    /// Run the shutdown sequence. Later calls return `None`.
    pub async fn shutdown(&self, trigger: ShutdownTrigger) -> Option<ShutdownReport> {
        self.coordinator.run(trigger).await
    }
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("state", &self.supervisor.state())
            .field("generation", &self.supervisor.generation())
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}
