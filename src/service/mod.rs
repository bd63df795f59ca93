//! OS service control for the agent daemon.
//!
//! [`ServiceController`] is the capability the evaluator and recovery
//! pipeline use. [`ManagedService`] implements it once, on top of a
//! platform [`ServiceBackend`] chosen at composition time.
mod systemd;
mod windows;

pub use systemd::SystemdBackend;
pub use windows::WindowsBackend;

use crate::config::{secs, ServiceConfig, ServiceManagerKind};
use crate::model::ServiceState;
use crate::signals::Shutdown;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Query and drive the service hosting the agent daemon.
#[async_trait]
pub trait ServiceController: Send + Sync {
    async fn query_state(&self) -> ServiceState;

    /// Start the service and wait for it to come up. Idempotent.
    async fn start(&self) -> bool;

    /// Stop, settle, start. Best-effort.
    async fn restart(&self);
}

/// Platform commands behind a [`ManagedService`].
///
/// Each method runs one bounded command and reports what it saw; polling,
/// fallbacks, and settle delays live in [`ManagedService`].
#[async_trait]
pub trait ServiceBackend: Send + Sync {
    /// Short backend name for log lines.
    fn name(&self) -> &'static str;

    async fn query(&self) -> ServiceState;

    /// Issue the primary start command. True if the manager accepted it.
    async fn start_primary(&self) -> bool;

    /// Issue the secondary start mechanism. True if it was accepted.
    async fn start_fallback(&self) -> bool;

    async fn stop(&self) -> bool;
}

/// Start timing for [`ManagedService`].
#[derive(Debug, Clone)]
pub struct StartPolicy {
    pub poll_interval: Duration,
    pub poll_attempts: u32,
    pub fallback_settle: Duration,
    pub restart_settle: Duration,
}

impl StartPolicy {
    pub fn from_config(config: &ServiceConfig) -> Self {
        Self {
            poll_interval: secs(config.start_poll_interval_secs),
            poll_attempts: config.start_poll_attempts,
            fallback_settle: secs(config.fallback_settle_secs),
            restart_settle: secs(config.restart_settle_secs),
        }
    }
}

/// A [`ServiceController`] over any [`ServiceBackend`].
pub struct ManagedService<B> {
    backend: B,
    policy: StartPolicy,
    shutdown: Shutdown,
}

impl<B: ServiceBackend> ManagedService<B> {
    pub fn new(backend: B, policy: StartPolicy, shutdown: Shutdown) -> Self {
        Self {
            backend,
            policy,
            shutdown,
        }
    }

    /// Poll until Running, up to the configured number of attempts.
    async fn wait_until_running(&self) -> bool {
        for attempt in 1..=self.policy.poll_attempts {
            if !self.shutdown.sleep(self.policy.poll_interval).await {
                return false;
            }
            let state = self.backend.query().await;
            tracing::debug!(attempt, state = %state, "waiting for service to start");
            if state == ServiceState::Running {
                return true;
            }
        }
        false
    }
}

#[async_trait]
impl<B: ServiceBackend> ServiceController for ManagedService<B> {
    async fn query_state(&self) -> ServiceState {
        self.backend.query().await
    }

    async fn start(&self) -> bool {
        if self.backend.query().await == ServiceState::Running {
            tracing::debug!("service already running");
            return true;
        }

        tracing::info!(backend = self.backend.name(), "starting service");
        if self.backend.start_primary().await {
            let running = self.wait_until_running().await;
            if running {
                tracing::info!("service started");
            } else if !self.shutdown.is_triggered() {
                tracing::error!("service accepted start but never reached running");
            }
            return running;
        }
        if self.shutdown.is_triggered() {
            return false;
        }

        tracing::warn!(
            backend = self.backend.name(),
            "primary start rejected, trying fallback start"
        );
        if !self.backend.start_fallback().await {
            tracing::error!("fallback service start failed");
            return false;
        }
        if !self.shutdown.sleep(self.policy.fallback_settle).await {
            return false;
        }
        let running = self.backend.query().await == ServiceState::Running;
        if running {
            tracing::info!("service started via fallback");
        } else {
            tracing::error!("service failed to start");
        }
        running
    }

    async fn restart(&self) {
        tracing::info!(backend = self.backend.name(), "restarting service");
        if !self.backend.stop().await {
            tracing::warn!("service stop reported failure, starting anyway");
        }
        if !self.shutdown.sleep(self.policy.restart_settle).await {
            return;
        }
        if !self.start().await {
            tracing::warn!("service restart did not bring the service up");
        }
    }
}

/// Build the controller for the configured (or native) service manager.
pub fn from_config(config: &ServiceConfig, shutdown: Shutdown) -> Arc<dyn ServiceController> {
    let policy = StartPolicy::from_config(config);
    match config.manager.resolve() {
        ServiceManagerKind::Windows => Arc::new(ManagedService::new(
            WindowsBackend::new(config, shutdown.clone()),
            policy,
            shutdown,
        )),
        _ => Arc::new(ManagedService::new(
            SystemdBackend::new(config, shutdown.clone()),
            policy,
            shutdown,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Backend that replays a scripted sequence of query results.
    struct ScriptedBackend {
        states: Mutex<VecDeque<ServiceState>>,
        last: Mutex<ServiceState>,
        primary_accepts: bool,
        fallback_accepts: bool,
        calls: Mutex<Vec<&'static str>>,
    }

    impl ScriptedBackend {
        fn new(states: &[ServiceState]) -> Self {
            Self {
                states: Mutex::new(states.iter().copied().collect()),
                last: Mutex::new(ServiceState::Unknown),
                primary_accepts: true,
                fallback_accepts: true,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ServiceBackend for ScriptedBackend {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn query(&self) -> ServiceState {
            self.calls.lock().unwrap().push("query");
            let mut last = self.last.lock().unwrap();
            if let Some(next) = self.states.lock().unwrap().pop_front() {
                *last = next;
            }
            *last
        }

        async fn start_primary(&self) -> bool {
            self.calls.lock().unwrap().push("start_primary");
            self.primary_accepts
        }

        async fn start_fallback(&self) -> bool {
            self.calls.lock().unwrap().push("start_fallback");
            self.fallback_accepts
        }

        async fn stop(&self) -> bool {
            self.calls.lock().unwrap().push("stop");
            true
        }
    }

    fn policy() -> StartPolicy {
        StartPolicy::from_config(&ServiceConfig::default())
    }

    fn managed(backend: ScriptedBackend) -> ManagedService<ScriptedBackend> {
        ManagedService::new(backend, policy(), Shutdown::never())
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_is_idempotent_when_running() {
        let svc = managed(ScriptedBackend::new(&[ServiceState::Running]));
        assert!(svc.start().await);
        assert_eq!(svc.backend.calls(), vec!["query"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_polls_until_running() {
        let svc = managed(ScriptedBackend::new(&[
            ServiceState::Stopped,
            ServiceState::Starting,
            ServiceState::Starting,
            ServiceState::Running,
        ]));
        let begin = tokio::time::Instant::now();
        assert!(svc.start().await);
        assert_eq!(
            svc.backend.calls(),
            vec!["query", "start_primary", "query", "query", "query"]
        );
        assert_eq!(begin.elapsed(), Duration::from_secs(9));
    }

    #[tokio::test(start_paused = true)]
    async fn test_accepted_start_that_never_runs_skips_fallback() {
        let svc = managed(ScriptedBackend::new(&[ServiceState::Stopped]));
        assert!(!svc.start().await);
        let calls = svc.backend.calls();
        // Initial query plus one per poll attempt.
        assert_eq!(calls.iter().filter(|c| **c == "query").count(), 11);
        assert!(!calls.contains(&"start_fallback"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_falls_back_when_primary_rejected() {
        let mut backend = ScriptedBackend::new(&[ServiceState::Stopped, ServiceState::Running]);
        backend.primary_accepts = false;
        let svc = managed(backend);
        assert!(svc.start().await);
        assert_eq!(
            svc.backend.calls(),
            vec!["query", "start_primary", "start_fallback", "query"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_fails_when_nothing_works() {
        let mut backend = ScriptedBackend::new(&[ServiceState::NotFound]);
        backend.primary_accepts = false;
        backend.fallback_accepts = false;
        let svc = managed(backend);
        assert!(!svc.start().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_stops_then_starts() {
        let svc = managed(ScriptedBackend::new(&[
            ServiceState::Stopped,
            ServiceState::Running,
        ]));
        svc.restart().await;
        let calls = svc.backend.calls();
        assert_eq!(calls[0], "stop");
        assert_eq!(calls[1], "query");
        assert_eq!(calls[2], "start_primary");
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_aborts_on_shutdown() {
        let (trigger, shutdown) = crate::signals::channel();
        trigger.trigger();
        let svc = ManagedService::new(
            ScriptedBackend::new(&[ServiceState::Stopped]),
            policy(),
            shutdown,
        );
        assert!(!svc.start().await);
        assert!(!svc.backend.calls().contains(&"start_fallback"));
    }
}
