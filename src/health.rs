use crate::agent::StatusProbe;
use crate::config::{secs, SupervisorConfig};
use crate::connectivity::ConnectivityProbe;
use crate::manual::ManualInterventionDetector;
use crate::model::{
    AgentStatus, BackendState, HealthReport, ProbeErrorKind, ReasonCode, ServiceState,
};
use crate::service::ServiceController;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

/// The control endpoint used for the reachability check.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub timeout: Duration,
}

impl Endpoint {
    pub fn from_config(config: &SupervisorConfig) -> Self {
        Self {
            host: config.connectivity.host.clone(),
            port: config.connectivity.port,
            timeout: secs(config.connectivity.timeout_secs),
        }
    }
}

/// Map probe results to reason codes.
pub fn reasons_for(
    status: &AgentStatus,
    service_state: ServiceState,
    network_reachable: bool,
    manual_shutdown: bool,
) -> BTreeSet<ReasonCode> {
    let auth_valid = status.backend_state == BackendState::Running && status.has_ip();
    let mut reasons = BTreeSet::new();

    if status.probe_error.is_some()
        || matches!(
            status.backend_state,
            BackendState::NeedsLogin | BackendState::NoState | BackendState::Stopped
        )
    {
        reasons.insert(ReasonCode::BackendUnhealthy);
    }
    if matches!(
        service_state,
        ServiceState::Stopped | ServiceState::NotFound | ServiceState::Error
    ) {
        reasons.insert(ReasonCode::ServiceUnhealthy);
    }
    if network_reachable && !auth_valid {
        reasons.insert(ReasonCode::NoValidConnection);
    }
    if service_state == ServiceState::Running
        && status.backend_state == BackendState::Running
        && !auth_valid
    {
        reasons.insert(ReasonCode::DisconnectedState);
    }
    if manual_shutdown {
        reasons.insert(ReasonCode::ManualShutdownDetected);
    }
    reasons
}

/// Composes the probes into one [`HealthReport`].
#[derive(Clone)]
pub struct HealthEvaluator {
    probe: Arc<dyn StatusProbe>,
    service: Arc<dyn ServiceController>,
    connectivity: Arc<dyn ConnectivityProbe>,
    detector: Arc<ManualInterventionDetector>,
    status_timeout: Duration,
    endpoint: Endpoint,
}

impl HealthEvaluator {
    pub fn new(
        config: &SupervisorConfig,
        probe: Arc<dyn StatusProbe>,
        service: Arc<dyn ServiceController>,
        connectivity: Arc<dyn ConnectivityProbe>,
        detector: Arc<ManualInterventionDetector>,
    ) -> Self {
        Self {
            probe,
            service,
            connectivity,
            detector,
            status_timeout: secs(config.agent.status_timeout_secs),
            endpoint: Endpoint::from_config(config),
        }
    }

    /// Evaluate health. Never fails: a crash inside evaluation yields a
    /// report with `BackendUnhealthy`.
    pub async fn evaluate(&self) -> HealthReport {
        let this = self.clone();
        match tokio::spawn(async move { this.evaluate_inner().await }).await {
            Ok(report) => report,
            Err(e) => {
                tracing::error!(error = %e, "health evaluation failed");
                HealthReport::evaluation_failed(format!("health evaluation failed: {e}"))
            }
        }
    }

    async fn evaluate_inner(&self) -> HealthReport {
        let status = self.probe.probe(self.status_timeout).await;
        if status.error_kind() == Some(ProbeErrorKind::PermissionDenied) {
            tracing::error!(
                error = ?status.probe_error,
                "permission denied talking to the agent, cannot self-heal without privileges"
            );
        }

        let service_state = self.service.query_state().await;
        let network_reachable = self
            .connectivity
            .reachable(&self.endpoint.host, self.endpoint.port, self.endpoint.timeout)
            .await;
        let detection = self.detector.detect_with(service_state, &status).await;

        let reasons = reasons_for(&status, service_state, network_reachable, detection.detected);
        let report = HealthReport::new(
            status,
            service_state,
            network_reachable,
            reasons,
            detection.indicators,
        );

        if report.recovery_needed {
            tracing::warn!(
                reasons = %report.reason_summary(),
                backend_state = %report.agent_status.backend_state,
                service_state = %report.service_state,
                network_reachable,
                "agent unhealthy"
            );
        } else {
            tracing::debug!(
                ip = report.agent_status.primary_ip().unwrap_or("-"),
                "agent healthy"
            );
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use crate::model::ProbeError;
    use crate::testing::{connected, FakeConnectivity, FakeProbe, FakeProcesses, FakeService};

    struct Harness {
        probe: Arc<FakeProbe>,
        service: Arc<FakeService>,
        evaluator: HealthEvaluator,
    }

    fn harness(status: AgentStatus, state: ServiceState, reachable: bool, procs: &[&str]) -> Harness {
        harness_with(Arc::new(FakeProbe::always(status)), state, reachable, procs)
    }

    fn harness_with(
        probe: Arc<FakeProbe>,
        state: ServiceState,
        reachable: bool,
        procs: &[&str],
    ) -> Harness {
        let service = Arc::new(FakeService::new(state));
        let detector = Arc::new(ManualInterventionDetector::new(
            &AgentConfig::default(),
            Arc::new(FakeProcesses::with_names(procs)),
            probe.clone(),
            service.clone(),
        ));
        let evaluator = HealthEvaluator::new(
            &SupervisorConfig::default(),
            probe.clone(),
            service.clone(),
            Arc::new(FakeConnectivity::new(reachable)),
            detector,
        );
        Harness {
            probe,
            service,
            evaluator,
        }
    }

    #[tokio::test]
    async fn test_healthy_agent_needs_no_recovery() {
        let h = harness(connected(), ServiceState::Running, true, &["tailscaled"]);
        let report = h.evaluator.evaluate().await;
        assert!(!report.recovery_needed);
        assert!(report.reasons.is_empty());
        assert!(report.auth_valid);
        assert!(report.network_reachable);
    }

    #[tokio::test]
    async fn test_disconnected_while_running() {
        let status = AgentStatus::reported(BackendState::Running, "h", vec![]);
        let h = harness(status, ServiceState::Running, true, &["tailscaled"]);
        let report = h.evaluator.evaluate().await;
        assert!(report.has_reason(ReasonCode::DisconnectedState));
        assert!(report.has_reason(ReasonCode::NoValidConnection));
        assert!(!report.has_reason(ReasonCode::BackendUnhealthy));
        assert!(report.recovery_needed);
    }

    #[tokio::test]
    async fn test_stopped_service_with_live_daemon() {
        let status = AgentStatus::failed(ProbeError::new(ProbeErrorKind::NotRunning, "not running"));
        let h = harness(status, ServiceState::Stopped, true, &["tailscaled"]);
        let report = h.evaluator.evaluate().await;
        assert_eq!(
            report.reasons,
            BTreeSet::from([
                ReasonCode::BackendUnhealthy,
                ReasonCode::ServiceUnhealthy,
                ReasonCode::NoValidConnection,
                ReasonCode::ManualShutdownDetected,
            ])
        );
        assert_eq!(report.manual_indicators.len(), 2);
        assert_eq!(report.errors, vec!["not running".to_string()]);
    }

    #[tokio::test]
    async fn test_unreachable_network_omits_no_valid_connection() {
        let status = AgentStatus::reported(BackendState::NeedsLogin, "h", vec![]);
        let h = harness(status, ServiceState::Running, false, &[]);
        let report = h.evaluator.evaluate().await;
        assert_eq!(report.reasons, BTreeSet::from([ReasonCode::BackendUnhealthy]));
        assert!(!report.network_reachable);
    }

    #[tokio::test]
    async fn test_panicking_probe_yields_backend_unhealthy() {
        let h = harness_with(Arc::new(FakeProbe::panicking()), ServiceState::Running, true, &[]);
        let report = h.evaluator.evaluate().await;
        assert_eq!(report.reasons, BTreeSet::from([ReasonCode::BackendUnhealthy]));
        assert!(report.recovery_needed);
        assert!(!report.errors.is_empty());
    }

    #[tokio::test]
    async fn test_evaluation_is_read_only() {
        let h = harness(connected(), ServiceState::Stopped, true, &[]);
        h.evaluator.evaluate().await;
        h.evaluator.evaluate().await;
        assert_eq!(h.service.starts(), 0);
        assert_eq!(h.service.restarts(), 0);
        assert_eq!(h.probe.calls(), 2);
    }

    #[test]
    fn test_every_probe_error_kind_is_backend_unhealthy() {
        for kind in [
            ProbeErrorKind::NotInstalled,
            ProbeErrorKind::Timeout,
            ProbeErrorKind::MalformedResponse,
            ProbeErrorKind::PermissionDenied,
            ProbeErrorKind::NotRunning,
            ProbeErrorKind::Exception,
        ] {
            let status = AgentStatus::failed(ProbeError::new(kind, "failed"));
            // Network down and service running isolate the agent's own reason.
            let reasons = reasons_for(&status, ServiceState::Running, false, false);
            assert_eq!(reasons, BTreeSet::from([ReasonCode::BackendUnhealthy]), "{kind:?}");
        }
    }

    #[test]
    fn test_reasons_match_recovery_needed_for_all_inputs() {
        let statuses = [
            connected(),
            AgentStatus::reported(BackendState::Running, "h", vec![]),
            AgentStatus::reported(BackendState::NeedsLogin, "h", vec![]),
            AgentStatus::reported(BackendState::NoState, "h", vec![]),
            AgentStatus::reported(BackendState::Stopped, "h", vec![]),
            AgentStatus::reported(BackendState::Unknown, "h", vec![]),
            AgentStatus::failed(ProbeError::new(ProbeErrorKind::Timeout, "t")),
        ];
        let states = [
            ServiceState::Running,
            ServiceState::Stopped,
            ServiceState::Starting,
            ServiceState::Stopping,
            ServiceState::Paused,
            ServiceState::NotFound,
            ServiceState::Unknown,
            ServiceState::Error,
        ];
        for status in &statuses {
            for state in states {
                for reachable in [true, false] {
                    for manual in [true, false] {
                        let reasons = reasons_for(status, state, reachable, manual);
                        let report =
                            HealthReport::new(status.clone(), state, reachable, reasons.clone(), vec![]);
                        assert_eq!(report.recovery_needed, !reasons.is_empty());
                    }
                }
            }
        }
    }

    #[test]
    fn test_only_healthy_combination_has_no_reasons() {
        assert!(reasons_for(&connected(), ServiceState::Running, true, false).is_empty());
        assert!(reasons_for(&connected(), ServiceState::Running, false, false).is_empty());
        assert_eq!(
            reasons_for(&connected(), ServiceState::NotFound, true, false),
            BTreeSet::from([ReasonCode::ServiceUnhealthy])
        );
    }
}
