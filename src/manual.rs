use crate::agent::StatusProbe;
use crate::config::{secs, AgentConfig};
use crate::model::{AgentStatus, BackendState, IndicatorCode, ProbeErrorKind, ServiceState};
use crate::processes::ProcessInspector;
use crate::service::ServiceController;
use std::sync::Arc;
use std::time::Duration;

/// Outcome of a manual-shutdown check.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Detection {
    pub detected: bool,
    pub indicators: Vec<IndicatorCode>,
}

/// Which classes of agent process are alive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessPresence {
    pub daemon_alive: bool,
    pub agent_alive: bool,
}

/// Correlate reported state with live processes.
pub fn assess(
    service_state: ServiceState,
    status: &AgentStatus,
    presence: ProcessPresence,
) -> Detection {
    let mut indicators = Vec::new();
    if service_state == ServiceState::Stopped && presence.daemon_alive {
        indicators.push(IndicatorCode::ServiceStoppedDaemonAlive);
    }
    if status.backend_state == BackendState::Stopped && presence.agent_alive {
        indicators.push(IndicatorCode::BackendStoppedProcessAlive);
    }
    if status.error_kind() == Some(ProbeErrorKind::NotRunning) && presence.agent_alive {
        indicators.push(IndicatorCode::NotRunningProcessAlive);
    }
    Detection {
        detected: !indicators.is_empty(),
        indicators,
    }
}

/// Flags out-of-band shutdowns: reported-stopped while processes are alive.
pub struct ManualInterventionDetector {
    processes: Arc<dyn ProcessInspector>,
    probe: Arc<dyn StatusProbe>,
    service: Arc<dyn ServiceController>,
    status_timeout: Duration,
    agent_names: Vec<String>,
    daemon_names: Vec<String>,
}

impl ManualInterventionDetector {
    pub fn new(
        config: &AgentConfig,
        processes: Arc<dyn ProcessInspector>,
        probe: Arc<dyn StatusProbe>,
        service: Arc<dyn ServiceController>,
    ) -> Self {
        Self {
            processes,
            probe,
            service,
            status_timeout: secs(config.status_timeout_secs),
            agent_names: config.process_names.clone(),
            daemon_names: config.daemon_process_names.clone(),
        }
    }

    /// Gather service and agent state, then check for a manual shutdown.
    pub async fn detect(&self) -> Detection {
        let service_state = self.service.query_state().await;
        let status = self.probe.probe(self.status_timeout).await;
        self.detect_with(service_state, &status).await
    }

    /// Check against already-gathered service and agent state.
    ///
    /// If processes cannot be enumerated at all, nothing is detected.
    pub async fn detect_with(&self, service_state: ServiceState, status: &AgentStatus) -> Detection {
        let listing = match self.processes.list().await {
            Ok(listing) => listing,
            Err(e) => {
                tracing::warn!(error = %e, "cannot enumerate processes, skipping manual shutdown check");
                return Detection::default();
            }
        };
        let presence = ProcessPresence {
            daemon_alive: listing.any_alive(&self.daemon_names),
            agent_alive: listing.any_alive(&self.agent_names),
        };
        let detection = assess(service_state, status, presence);
        if detection.detected {
            tracing::warn!(indicators = ?detection.indicators, "manual shutdown detected");
        }
        detection
    }

    /// Terminate lingering agent processes left behind by a manual shutdown.
    pub async fn clean_up(&self) -> usize {
        match self.processes.terminate(&self.agent_names).await {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!(error = %e, "failed to clean up agent processes");
                0
            }
        }
    }
}
