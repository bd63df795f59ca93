//! The repair pipeline.
//!
//! Recovery is an ordered list of [`Step`]s. Each step records what it did
//! and either lets the pipeline continue or finishes the attempt early.
//! Steps run in order until one finishes; the last step always finishes.
use crate::agent::{AgentControl, AuthRequest, StatusProbe};
use crate::config::{secs, RecoveryConfig, SupervisorConfig};
use crate::config_store::{ConfigError, ConfigStore};
use crate::connectivity::ConnectivityProbe;
use crate::health::Endpoint;
use crate::manual::ManualInterventionDetector;
use crate::model::{
    AgentStatus, BackendState, HealthReport, ProbeErrorKind, ReasonCode, RecoveryAttempt,
    ServiceState, StepOutcome,
};
use crate::service::ServiceController;
use crate::signals::Shutdown;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One stage of the repair pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    ClearManualShutdown,
    RequireNetwork,
    RequireAgentBinary,
    EnsureService,
    EnsureAuthenticated,
    VerifyConnection,
}

pub const PIPELINE: [Step; 6] = [
    Step::ClearManualShutdown,
    Step::RequireNetwork,
    Step::RequireAgentBinary,
    Step::EnsureService,
    Step::EnsureAuthenticated,
    Step::VerifyConnection,
];

/// What the pipeline does after a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Finish { succeeded: bool },
}

/// Unexpected failure inside a step. Recorded as [`StepOutcome::Exception`].
#[derive(Debug)]
pub enum RecoveryError {
    /// A stop was requested mid-attempt.
    Interrupted,
    /// The persisted config could not be read when authentication needed it.
    Config(ConfigError),
}

impl std::fmt::Display for RecoveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecoveryError::Interrupted => write!(f, "recovery interrupted by shutdown"),
            RecoveryError::Config(e) => write!(f, "cannot load config for authentication: {e}"),
        }
    }
}

impl std::error::Error for RecoveryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RecoveryError::Config(e) => Some(e),
            RecoveryError::Interrupted => None,
        }
    }
}

impl From<ConfigError> for RecoveryError {
    fn from(e: ConfigError) -> Self {
        RecoveryError::Config(e)
    }
}

/// Mutable state threaded through one attempt.
struct Attempt {
    /// Shared so steps recorded before a crash survive it.
    steps: Arc<Mutex<Vec<StepOutcome>>>,
    manual: bool,
}

impl Attempt {
    fn record(&self, outcome: StepOutcome) {
        tracing::info!(step = %outcome, "recovery step");
        self.steps
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(outcome);
    }
}

fn take_steps(steps: &Mutex<Vec<StepOutcome>>) -> Vec<StepOutcome> {
    std::mem::take(&mut *steps.lock().unwrap_or_else(|poisoned| poisoned.into_inner()))
}

/// Whether a re-probed status calls for re-authentication.
pub fn needs_authentication(status: &AgentStatus) -> bool {
    matches!(
        status.backend_state,
        BackendState::NeedsLogin | BackendState::NoState | BackendState::Stopped
    ) || matches!(
        status.error_kind(),
        Some(ProbeErrorKind::NotRunning | ProbeErrorKind::PermissionDenied)
    ) || (status.backend_state == BackendState::Running && !status.is_connected())
}

/// Runs the repair pipeline against live components.
#[derive(Clone)]
pub struct RecoveryOrchestrator {
    probe: Arc<dyn StatusProbe>,
    agent: Arc<dyn AgentControl>,
    service: Arc<dyn ServiceController>,
    connectivity: Arc<dyn ConnectivityProbe>,
    detector: Arc<ManualInterventionDetector>,
    store: Arc<dyn ConfigStore>,
    timings: RecoveryConfig,
    status_timeout: Duration,
    endpoint: Endpoint,
    shutdown: Shutdown,
}

/// Collaborators of a [`RecoveryOrchestrator`].
pub struct RecoveryDeps {
    pub probe: Arc<dyn StatusProbe>,
    pub agent: Arc<dyn AgentControl>,
    pub service: Arc<dyn ServiceController>,
    pub connectivity: Arc<dyn ConnectivityProbe>,
    pub detector: Arc<ManualInterventionDetector>,
    pub store: Arc<dyn ConfigStore>,
}

impl RecoveryOrchestrator {
    pub fn new(config: &SupervisorConfig, deps: RecoveryDeps, shutdown: Shutdown) -> Self {
        Self {
            probe: deps.probe,
            agent: deps.agent,
            service: deps.service,
            connectivity: deps.connectivity,
            detector: deps.detector,
            store: deps.store,
            timings: config.recovery.clone(),
            status_timeout: secs(config.agent.status_timeout_secs),
            endpoint: Endpoint::from_config(config),
            shutdown,
        }
    }

    /// Run the pipeline for `report`. Never fails; crashes become an
    /// `Exception` step on a failed attempt.
    pub async fn recover(&self, report: &HealthReport) -> RecoveryAttempt {
        tracing::info!(reasons = %report.reason_summary(), "starting recovery");
        let steps = Arc::new(Mutex::new(Vec::new()));
        let attempt = Attempt {
            steps: Arc::clone(&steps),
            manual: report.has_reason(ReasonCode::ManualShutdownDetected),
        };

        let this = self.clone();
        let result = tokio::spawn(async move { this.run(attempt).await }).await;

        let succeeded = match result {
            Ok(Ok(succeeded)) => succeeded,
            Ok(Err(RecoveryError::Interrupted)) => {
                tracing::info!("recovery interrupted by shutdown");
                false
            }
            Ok(Err(e)) => {
                tracing::error!(error = %e, "recovery step failed");
                push_exception(&steps);
                false
            }
            Err(e) => {
                tracing::error!(error = %e, "recovery crashed");
                push_exception(&steps);
                false
            }
        };

        let attempt = RecoveryAttempt {
            steps: take_steps(&steps),
            succeeded,
        };
        tracing::info!(
            succeeded = attempt.succeeded,
            steps = %attempt.step_summary(),
            "recovery finished"
        );
        attempt
    }

    async fn run(&self, mut attempt: Attempt) -> Result<bool, RecoveryError> {
        for step in PIPELINE {
            tracing::debug!(?step, "running recovery step");
            if let Flow::Finish { succeeded } = self.run_step(step, &mut attempt).await? {
                return Ok(succeeded);
            }
        }
        Ok(false)
    }

    async fn run_step(&self, step: Step, attempt: &mut Attempt) -> Result<Flow, RecoveryError> {
        match step {
            Step::ClearManualShutdown => self.clear_manual_shutdown(attempt).await,
            Step::RequireNetwork => self.require_network(attempt).await,
            Step::RequireAgentBinary => Ok(self.require_agent_binary(attempt)),
            Step::EnsureService => self.ensure_service(attempt).await,
            Step::EnsureAuthenticated => self.ensure_authenticated(attempt).await,
            Step::VerifyConnection => self.verify_connection(attempt).await,
        }
    }

    async fn settle(&self, duration: Duration) -> Result<(), RecoveryError> {
        if self.shutdown.sleep(duration).await {
            Ok(())
        } else {
            Err(RecoveryError::Interrupted)
        }
    }

    async fn clear_manual_shutdown(&self, attempt: &mut Attempt) -> Result<Flow, RecoveryError> {
        if !attempt.manual {
            return Ok(Flow::Continue);
        }
        tracing::warn!("handling manual shutdown");
        attempt.record(StepOutcome::ManualShutdownHandled);
        let cleaned = self.detector.clean_up().await;
        if cleaned > 0 {
            tracing::info!(count = cleaned, "cleaned up lingering agent processes");
            attempt.record(StepOutcome::ProcessesCleaned);
        }
        self.settle(secs(self.timings.manual_settle_secs)).await?;
        Ok(Flow::Continue)
    }

    async fn require_network(&self, attempt: &mut Attempt) -> Result<Flow, RecoveryError> {
        let reachable = self
            .connectivity
            .reachable(&self.endpoint.host, self.endpoint.port, self.endpoint.timeout)
            .await;
        if reachable {
            return Ok(Flow::Continue);
        }
        tracing::warn!(host = %self.endpoint.host, "no network connectivity, waiting");
        attempt.record(StepOutcome::NetworkWait);
        Ok(Flow::Finish { succeeded: false })
    }

    fn require_agent_binary(&self, attempt: &mut Attempt) -> Flow {
        if self.agent.binary_present() {
            return Flow::Continue;
        }
        tracing::error!("agent CLI not installed, reinstall required");
        attempt.record(StepOutcome::ReinstallRequired);
        Flow::Finish { succeeded: false }
    }

    async fn ensure_service(&self, attempt: &mut Attempt) -> Result<Flow, RecoveryError> {
        let state = self.service.query_state().await;
        if state == ServiceState::Running {
            if attempt.manual {
                self.service.restart().await;
                attempt.record(StepOutcome::ServiceRestarted);
            }
            return Ok(Flow::Continue);
        }
        if !matches!(
            state,
            ServiceState::Stopped | ServiceState::NotFound | ServiceState::Error
        ) {
            // Paused or mid-transition: carry on to re-authentication.
            tracing::info!(state = %state, "service in transitional state, not starting it");
            return Ok(Flow::Continue);
        }

        tracing::info!(state = %state, "service not running, starting it");
        if self.service.start().await {
            attempt.record(StepOutcome::ServiceStarted);
            Ok(Flow::Continue)
        } else {
            if self.shutdown.is_triggered() {
                return Err(RecoveryError::Interrupted);
            }
            tracing::error!("failed to start service");
            Ok(Flow::Finish { succeeded: false })
        }
    }

    async fn ensure_authenticated(&self, attempt: &mut Attempt) -> Result<Flow, RecoveryError> {
        self.settle(secs(self.timings.reprobe_settle_secs)).await?;
        let status = self.probe.probe(self.status_timeout).await;
        if !needs_authentication(&status) {
            return Ok(Flow::Continue);
        }

        let config = self.store.load()?;
        let Some(request) = AuthRequest::from_config(&config) else {
            tracing::error!("authentication needed but no auth secret is configured");
            return Ok(Flow::Finish { succeeded: false });
        };

        let outcome = self.agent.authenticate(&request).await;
        if outcome.is_success() {
            attempt.record(StepOutcome::Authenticated);
            Ok(Flow::Continue)
        } else {
            tracing::error!(outcome = ?outcome, "authentication failed");
            Ok(Flow::Finish { succeeded: false })
        }
    }

    async fn verify_connection(&self, attempt: &mut Attempt) -> Result<Flow, RecoveryError> {
        let settle = if attempt.manual {
            self.timings.manual_verify_settle_secs
        } else {
            self.timings.verify_settle_secs
        };
        self.settle(secs(settle)).await?;

        let status = self.probe.probe(self.status_timeout).await;
        let succeeded = status.backend_state == BackendState::Running
            && status.is_connected()
            && status.has_ip();
        if succeeded {
            tracing::info!(ip = status.primary_ip().unwrap_or("-"), "agent reconnected");
            attempt.record(StepOutcome::Success);
        } else {
            tracing::warn!(backend_state = %status.backend_state, "recovery only partially successful");
            attempt.record(StepOutcome::PartialSuccess);
        }
        Ok(Flow::Finish { succeeded })
    }
}

fn push_exception(steps: &Mutex<Vec<StepOutcome>>) {
    steps
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .push(StepOutcome::Exception);
}
