//! Core data model shared by the probes, the evaluator, and the recovery pipeline.
//!
//! Everything here is a plain value: produced fresh by a probe or an evaluation,
//! read, logged, and dropped. Nothing in this module performs I/O.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// The agent's self-reported connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BackendState {
    Running,
    NeedsLogin,
    NoState,
    Stopped,
    Unknown,
}

impl BackendState {
    /// Map the agent's `BackendState` string. Anything unrecognized is `Unknown`.
    pub fn from_agent(raw: &str) -> Self {
        match raw {
            "Running" => BackendState::Running,
            "NeedsLogin" => BackendState::NeedsLogin,
            "NoState" => BackendState::NoState,
            "Stopped" => BackendState::Stopped,
            _ => BackendState::Unknown,
        }
    }
}

impl fmt::Display for BackendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BackendState::Running => "Running",
            BackendState::NeedsLogin => "NeedsLogin",
            BackendState::NoState => "NoState",
            BackendState::Stopped => "Stopped",
            BackendState::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// Why a status probe could not produce a usable answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeErrorKind {
    NotInstalled,
    Timeout,
    MalformedResponse,
    PermissionDenied,
    NotRunning,
    Exception,
}

/// A tagged probe failure. Carried inside [`AgentStatus`], never raised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeError {
    pub kind: ProbeErrorKind,
    pub message: String,
}

impl ProbeError {
    pub fn new(kind: ProbeErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for ProbeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// Immutable snapshot of what the agent reports about itself.
///
/// `is_connected` and `has_ip` are derived once at construction so the
/// serialized form and the accessors can never disagree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentStatus {
    pub backend_state: BackendState,
    pub self_hostname: String,
    pub self_ips: Vec<String>,
    is_connected: bool,
    has_ip: bool,
    pub probe_error: Option<ProbeError>,
}

impl AgentStatus {
    /// A successful probe result.
    pub fn reported(
        backend_state: BackendState,
        self_hostname: impl Into<String>,
        self_ips: Vec<String>,
    ) -> Self {
        let has_ip = !self_ips.is_empty();
        Self {
            backend_state,
            self_hostname: self_hostname.into(),
            self_ips,
            is_connected: backend_state == BackendState::Running && has_ip,
            has_ip,
            probe_error: None,
        }
    }

    /// A failed probe. The backend state is unknown and no addresses are known.
    pub fn failed(error: ProbeError) -> Self {
        Self {
            backend_state: BackendState::Unknown,
            self_hostname: String::new(),
            self_ips: Vec::new(),
            is_connected: false,
            has_ip: false,
            probe_error: Some(error),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.is_connected
    }

    pub fn has_ip(&self) -> bool {
        self.has_ip
    }

    pub fn error_kind(&self) -> Option<ProbeErrorKind> {
        self.probe_error.as_ref().map(|e| e.kind)
    }

    /// First tailnet address, for log lines.
    pub fn primary_ip(&self) -> Option<&str> {
        self.self_ips.first().map(String::as_str)
    }
}

/// State of the OS service hosting the agent daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Running,
    Stopped,
    Starting,
    Stopping,
    Paused,
    NotFound,
    Unknown,
    Error,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServiceState::Running => "running",
            ServiceState::Stopped => "stopped",
            ServiceState::Starting => "starting",
            ServiceState::Stopping => "stopping",
            ServiceState::Paused => "paused",
            ServiceState::NotFound => "not_found",
            ServiceState::Unknown => "unknown",
            ServiceState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Why a health evaluation asked for recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    BackendUnhealthy,
    ServiceUnhealthy,
    NoValidConnection,
    DisconnectedState,
    ManualShutdownDetected,
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReasonCode::BackendUnhealthy => "backend_unhealthy",
            ReasonCode::ServiceUnhealthy => "service_unhealthy",
            ReasonCode::NoValidConnection => "no_valid_connection",
            ReasonCode::DisconnectedState => "disconnected_state",
            ReasonCode::ManualShutdownDetected => "manual_shutdown_detected",
        };
        f.write_str(s)
    }
}

/// Evidence that the agent was stopped out of band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IndicatorCode {
    /// Service manager says stopped, but the daemon process is alive.
    ServiceStoppedDaemonAlive,
    /// Agent reports `Stopped`, but agent processes are alive.
    BackendStoppedProcessAlive,
    /// Agent CLI says the daemon is not running, but agent processes are alive.
    NotRunningProcessAlive,
}

/// One evaluation of the agent's health. Read-only once built.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub timestamp: DateTime<Utc>,
    pub agent_status: AgentStatus,
    pub service_state: ServiceState,
    pub network_reachable: bool,
    pub auth_valid: bool,
    pub reasons: BTreeSet<ReasonCode>,
    pub recovery_needed: bool,
    pub manual_indicators: Vec<IndicatorCode>,
    pub errors: Vec<String>,
}

impl HealthReport {
    /// Assemble a report. `recovery_needed` is derived from `reasons`.
    pub fn new(
        agent_status: AgentStatus,
        service_state: ServiceState,
        network_reachable: bool,
        reasons: BTreeSet<ReasonCode>,
        manual_indicators: Vec<IndicatorCode>,
    ) -> Self {
        let auth_valid = agent_status.backend_state == BackendState::Running
            && agent_status.has_ip();
        let errors = agent_status
            .probe_error
            .iter()
            .map(|e| e.message.clone())
            .collect();
        Self {
            timestamp: Utc::now(),
            recovery_needed: !reasons.is_empty(),
            agent_status,
            service_state,
            network_reachable,
            auth_valid,
            reasons,
            manual_indicators,
            errors,
        }
    }

    /// The report produced when evaluation itself blew up.
    pub fn evaluation_failed(message: impl Into<String>) -> Self {
        let message = message.into();
        let mut report = Self::new(
            AgentStatus::failed(ProbeError::new(ProbeErrorKind::Exception, message.clone())),
            ServiceState::Unknown,
            false,
            BTreeSet::from([ReasonCode::BackendUnhealthy]),
            Vec::new(),
        );
        report.errors = vec![message];
        report
    }

    pub fn has_reason(&self, reason: ReasonCode) -> bool {
        self.reasons.contains(&reason)
    }

    /// Comma-separated reason list for log lines.
    pub fn reason_summary(&self) -> String {
        let parts: Vec<String> = self.reasons.iter().map(ToString::to_string).collect();
        parts.join(", ")
    }
}

/// What a recovery step did (or why the pipeline stopped).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    ManualShutdownHandled,
    ProcessesCleaned,
    NetworkWait,
    ReinstallRequired,
    ServiceStarted,
    ServiceRestarted,
    Authenticated,
    Success,
    PartialSuccess,
    Exception,
}

impl fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepOutcome::ManualShutdownHandled => "manual_shutdown_handled",
            StepOutcome::ProcessesCleaned => "processes_cleaned",
            StepOutcome::NetworkWait => "network_wait",
            StepOutcome::ReinstallRequired => "reinstall_required",
            StepOutcome::ServiceStarted => "service_started",
            StepOutcome::ServiceRestarted => "service_restarted",
            StepOutcome::Authenticated => "authenticated",
            StepOutcome::Success => "success",
            StepOutcome::PartialSuccess => "partial_success",
            StepOutcome::Exception => "exception",
        };
        f.write_str(s)
    }
}

/// Result of one pass through the recovery pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecoveryAttempt {
    pub steps: Vec<StepOutcome>,
    pub succeeded: bool,
}

impl RecoveryAttempt {
    pub fn step_summary(&self) -> String {
        let parts: Vec<String> = self.steps.iter().map(ToString::to_string).collect();
        parts.join(", ")
    }
}
