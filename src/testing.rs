//! Scriptable fakes for every trait seam.
use crate::agent::{AgentControl, AuthOutcome, AuthRequest, StatusProbe};
use crate::config_store::{ConfigError, ConfigStore, WatchdogConfig};
use crate::connectivity::ConnectivityProbe;
use crate::model::{AgentStatus, BackendState, ServiceState};
use crate::processes::{ProcessEntry, ProcessError, ProcessInspector, ProcessListing};
use crate::service::ServiceController;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub fn connected() -> AgentStatus {
    AgentStatus::reported(
        BackendState::Running,
        "test-host",
        vec!["100.64.0.7".to_string()],
    )
}

/// Replays queued statuses, then repeats the last one forever.
pub struct FakeProbe {
    queue: Mutex<VecDeque<AgentStatus>>,
    last: Mutex<AgentStatus>,
    panics: AtomicBool,
    calls: AtomicUsize,
}

impl FakeProbe {
    pub fn always(status: AgentStatus) -> Self {
        Self::sequence(vec![status])
    }

    pub fn sequence(statuses: Vec<AgentStatus>) -> Self {
        let mut queue: VecDeque<AgentStatus> = statuses.into();
        let last = queue.pop_front().unwrap_or_else(connected);
        queue.push_front(last.clone());
        Self {
            queue: Mutex::new(queue),
            last: Mutex::new(last),
            panics: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn panicking() -> Self {
        let probe = Self::always(connected());
        probe.panics.store(true, Ordering::SeqCst);
        probe
    }

    /// Replace the script: every later probe returns `status`.
    pub fn set(&self, status: AgentStatus) {
        self.queue.lock().unwrap().clear();
        *self.last.lock().unwrap() = status;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StatusProbe for FakeProbe {
    async fn probe(&self, _timeout: Duration) -> AgentStatus {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.panics.load(Ordering::SeqCst) {
            panic!("status probe exploded");
        }
        let mut last = self.last.lock().unwrap();
        if let Some(next) = self.queue.lock().unwrap().pop_front() {
            *last = next;
        }
        last.clone()
    }
}

/// Agent control with a fixed binary-presence answer and auth outcome.
pub struct FakeAgent {
    pub present: bool,
    outcome: Mutex<AuthOutcome>,
    requests: Mutex<Vec<AuthRequest>>,
}

impl FakeAgent {
    pub fn new(outcome: AuthOutcome) -> Self {
        Self {
            present: true,
            outcome: Mutex::new(outcome),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn missing_binary() -> Self {
        Self {
            present: false,
            ..Self::new(AuthOutcome::Authenticated)
        }
    }

    pub fn auth_calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn last_request(&self) -> Option<AuthRequest> {
        self.requests.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl AgentControl for FakeAgent {
    fn binary_present(&self) -> bool {
        self.present
    }

    async fn authenticate(&self, request: &AuthRequest) -> AuthOutcome {
        self.requests.lock().unwrap().push(request.clone());
        self.outcome.lock().unwrap().clone()
    }
}

/// Service whose `start` flips it to Running when allowed to.
pub struct FakeService {
    state: Mutex<ServiceState>,
    start_succeeds: AtomicBool,
    starts: AtomicUsize,
    restarts: AtomicUsize,
}

impl FakeService {
    pub fn new(state: ServiceState) -> Self {
        Self {
            state: Mutex::new(state),
            start_succeeds: AtomicBool::new(true),
            starts: AtomicUsize::new(0),
            restarts: AtomicUsize::new(0),
        }
    }

    pub fn failing_start(state: ServiceState) -> Self {
        let svc = Self::new(state);
        svc.start_succeeds.store(false, Ordering::SeqCst);
        svc
    }

    pub fn set(&self, state: ServiceState) {
        *self.state.lock().unwrap() = state;
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn restarts(&self) -> usize {
        self.restarts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ServiceController for FakeService {
    async fn query_state(&self) -> ServiceState {
        *self.state.lock().unwrap()
    }

    async fn start(&self) -> bool {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if self.start_succeeds.load(Ordering::SeqCst) {
            self.set(ServiceState::Running);
            true
        } else {
            false
        }
    }

    async fn restart(&self) {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        if self.start_succeeds.load(Ordering::SeqCst) {
            self.set(ServiceState::Running);
        }
    }
}

pub struct FakeConnectivity {
    reachable: AtomicBool,
    calls: AtomicUsize,
}

impl FakeConnectivity {
    pub fn new(reachable: bool) -> Self {
        Self {
            reachable: AtomicBool::new(reachable),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectivityProbe for FakeConnectivity {
    async fn reachable(&self, _host: &str, _port: u16, _timeout: Duration) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.reachable.load(Ordering::SeqCst)
    }
}

/// An in-memory process table.
pub struct FakeProcesses {
    names: Mutex<Vec<String>>,
    available: bool,
}

impl FakeProcesses {
    pub fn with_names(names: &[&str]) -> Self {
        Self {
            names: Mutex::new(names.iter().map(|n| n.to_string()).collect()),
            available: true,
        }
    }

    pub fn unavailable() -> Self {
        Self {
            names: Mutex::new(Vec::new()),
            available: false,
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.names.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProcessInspector for FakeProcesses {
    async fn list(&self) -> Result<ProcessListing, ProcessError> {
        if !self.available {
            return Err(ProcessError::Unavailable("fake".to_string()));
        }
        let entries = self
            .names()
            .into_iter()
            .enumerate()
            .map(|(i, name)| ProcessEntry {
                pid: Some(1000 + i as u32),
                name,
            })
            .collect();
        Ok(ProcessListing::native(entries))
    }

    async fn terminate(&self, names: &[String]) -> Result<usize, ProcessError> {
        if !self.available {
            return Err(ProcessError::Unavailable("fake".to_string()));
        }
        let mut table = self.names.lock().unwrap();
        let before = table.len();
        table.retain(|p| !names.iter().any(|n| n == p));
        Ok(before - table.len())
    }
}

/// A [`ConfigStore`] held in memory.
#[derive(Default)]
pub struct MemoryConfigStore {
    config: Mutex<WatchdogConfig>,
    broken: bool,
}

impl MemoryConfigStore {
    pub fn with(config: WatchdogConfig) -> Self {
        Self {
            config: Mutex::new(config),
            broken: false,
        }
    }

    /// A store whose every operation fails.
    pub fn broken() -> Self {
        Self {
            config: Mutex::new(WatchdogConfig::default()),
            broken: true,
        }
    }

    pub fn snapshot(&self) -> WatchdogConfig {
        self.config.lock().unwrap().clone()
    }

    fn check(&self) -> Result<(), ConfigError> {
        if self.broken {
            return Err(ConfigError::Read {
                path: PathBuf::from("memory"),
                source: std::io::Error::other("store unavailable"),
            });
        }
        Ok(())
    }
}

impl ConfigStore for MemoryConfigStore {
    fn load(&self) -> Result<WatchdogConfig, ConfigError> {
        self.check()?;
        Ok(self.snapshot())
    }

    fn save(&self, config: &WatchdogConfig) -> Result<(), ConfigError> {
        self.check()?;
        *self.config.lock().unwrap() = config.clone();
        Ok(())
    }

    fn update(
        &self,
        apply: &mut dyn FnMut(&mut WatchdogConfig),
    ) -> Result<WatchdogConfig, ConfigError> {
        self.check()?;
        let mut config = self.config.lock().unwrap();
        apply(&mut config);
        Ok(config.clone())
    }
}
