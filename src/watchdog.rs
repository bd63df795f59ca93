//! The monitor loop: evaluate, repair with backoff, sleep, repeat.
//!
//! Each iteration runs on its own task so a crash inside one is logged and
//! followed by a short cooldown instead of ending supervision. The loop
//! only ends when the [`Shutdown`] token fires.
use crate::backoff::{FailureCounter, FailureDecision};
use crate::config::{secs, MonitorConfig};
use crate::config_store::{ConfigStore, WatchdogConfig};
use crate::health::HealthEvaluator;
use crate::recovery::RecoveryOrchestrator;
use crate::signals::{Shutdown, ShutdownTrigger};
use crate::status::{LoopState, StatusTracker};
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

/// What one iteration decided: the state to wait in, and for how long.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tick {
    pub state: LoopState,
    pub sleep: Duration,
}

/// Loop-owned state carried from one iteration to the next.
#[derive(Debug, Clone)]
struct LoopMemory {
    counter: FailureCounter,
    last_success: Option<DateTime<Utc>>,
}

/// Shared handle to the optional status file.
#[derive(Clone, Default)]
struct Reporter(Option<Arc<Mutex<StatusTracker>>>);

impl Reporter {
    fn update(&self, state: LoopState, apply: impl FnOnce(&mut StatusTracker)) {
        if let Some(tracker) = &self.0 {
            let mut tracker = tracker.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            apply(&mut tracker);
            tracker.update(state);
        }
    }

    fn remove(&self) {
        if let Some(tracker) = &self.0 {
            tracker
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .remove();
        }
    }
}

/// Everything one iteration needs. Cheap to clone into a task.
#[derive(Clone)]
struct Iteration {
    evaluator: HealthEvaluator,
    orchestrator: RecoveryOrchestrator,
    store: Arc<dyn ConfigStore>,
    monitor: MonitorConfig,
    shutdown: Shutdown,
    reporter: Reporter,
}

impl Iteration {
    fn load_config(&self) -> WatchdogConfig {
        match self.store.load() {
            Ok(config) => config,
            Err(e) => {
                tracing::error!(error = %e, "failed to load config, continuing with no auth configured");
                WatchdogConfig::default()
            }
        }
    }

    async fn run(self, mut memory: LoopMemory) -> (LoopMemory, Tick) {
        let config = self.load_config();
        let interval = secs(config.check_interval_secs.max(1));
        let sleeping = Tick {
            state: LoopState::Sleeping,
            sleep: interval,
        };

        self.reporter.update(LoopState::HealthChecking, |_| {});
        let report = self.evaluator.evaluate().await;
        let reasons: Vec<_> = report.reasons.iter().copied().collect();

        if !report.recovery_needed {
            memory.counter.reset();
            memory.last_success = Some(Utc::now());
            self.reporter.update(LoopState::Sleeping, |t| {
                t.set_consecutive_failures(0);
                t.set_last_success(memory.last_success);
                t.set_last_reasons(Vec::new());
            });
            return (memory, sleeping);
        }

        let backoff = memory.counter.record_failure();
        let failures = memory.counter.count();
        tracing::warn!(
            consecutive_failures = failures,
            reasons = %report.reason_summary(),
            "recovery needed"
        );

        if backoff > 0 {
            tracing::info!(delay_secs = backoff, "backing off before recovery");
            self.reporter.update(LoopState::Backoff, |t| {
                t.set_consecutive_failures(failures);
                t.set_last_reasons(reasons.clone());
            });
            if !self.shutdown.sleep(secs(backoff)).await {
                return (
                    memory,
                    Tick {
                        state: LoopState::ShuttingDown,
                        sleep: Duration::ZERO,
                    },
                );
            }
        }

        self.reporter.update(LoopState::Recovering, |t| {
            t.set_consecutive_failures(failures);
            t.set_last_reasons(reasons.clone());
        });
        let attempt = self.orchestrator.recover(&report).await;

        let tick = if attempt.succeeded {
            memory.counter.reset();
            memory.last_success = Some(Utc::now());
            tracing::info!("recovery successful");
            sleeping
        } else {
            match memory.counter.after_failed_repair() {
                FailureDecision::Cooldown => Tick {
                    state: LoopState::Cooldown,
                    sleep: secs(self.monitor.cooldown_secs),
                },
                FailureDecision::Retry => sleeping,
            }
        };

        self.reporter.update(tick.state, |t| {
            t.set_consecutive_failures(memory.counter.count());
            t.set_last_success(memory.last_success);
            t.set_last_steps(attempt.steps.clone());
        });
        (memory, tick)
    }
}

/// The supervisor's scheduler. Owns the failure counter and success time.
pub struct MonitorLoop {
    iteration: Iteration,
    memory: LoopMemory,
}

impl MonitorLoop {
    pub fn new(
        monitor: &MonitorConfig,
        evaluator: HealthEvaluator,
        orchestrator: RecoveryOrchestrator,
        store: Arc<dyn ConfigStore>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            iteration: Iteration {
                evaluator,
                orchestrator,
                store,
                monitor: monitor.clone(),
                shutdown,
                reporter: Reporter::default(),
            },
            memory: LoopMemory {
                counter: FailureCounter::new(monitor),
                last_success: None,
            },
        }
    }

    /// Write loop state to a status file as it changes.
    pub fn with_status(mut self, tracker: StatusTracker) -> Self {
        self.iteration.reporter = Reporter(Some(Arc::new(Mutex::new(tracker))));
        self
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.memory.counter.count()
    }

    pub fn last_success(&self) -> Option<DateTime<Utc>> {
        self.memory.last_success
    }

    /// Run one iteration in isolation and return what to do next.
    pub async fn tick(&mut self) -> Tick {
        let iteration = self.iteration.clone();
        let memory = self.memory.clone();
        match tokio::spawn(iteration.run(memory)).await {
            Ok((memory, tick)) => {
                self.memory = memory;
                tick
            }
            Err(e) => {
                tracing::error!(error = %e, "monitor iteration crashed");
                Tick {
                    state: LoopState::Cooldown,
                    sleep: secs(self.iteration.monitor.error_cooldown_secs),
                }
            }
        }
    }

    /// Supervise until stopped.
    pub async fn run(mut self) {
        let shutdown = self.iteration.shutdown.clone();
        let reporter = self.iteration.reporter.clone();
        tracing::info!("monitor loop started");
        reporter.update(LoopState::Starting, |_| {});

        while !shutdown.is_triggered() {
            let tick = self.tick().await;
            if tick.state == LoopState::ShuttingDown {
                break;
            }
            tracing::debug!(state = %tick.state, sleep_secs = tick.sleep.as_secs(), "iteration complete");
            if !shutdown.sleep(tick.sleep).await {
                break;
            }
        }

        reporter.update(LoopState::ShuttingDown, |_| {});
        reporter.remove();
        tracing::info!("monitor loop stopped");
    }
}

/// The monitor running on its own task.
pub struct MonitorHandle {
    trigger: ShutdownTrigger,
    task: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    /// Start `monitor` on a background task. `trigger` must be the sending
    /// half of the token the monitor was built with.
    pub fn spawn(monitor: MonitorLoop, trigger: ShutdownTrigger) -> Self {
        Self {
            trigger,
            task: Some(tokio::spawn(monitor.run())),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Resolve when the monitor task ends on its own.
    pub async fn finished(&mut self) {
        if let Some(task) = self.task.as_mut() {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "monitor task failed");
            }
            self.task = None;
        }
    }

    /// Request a stop and wait up to `join_timeout` for the monitor to exit.
    /// Returns false if it did not exit in time.
    pub async fn stop(mut self, join_timeout: Duration) -> bool {
        self.trigger.trigger();
        let Some(task) = self.task.take() else {
            return true;
        };
        match tokio::time::timeout(join_timeout, task).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::error!(error = %e, "monitor task failed");
                true
            }
            Err(_) => {
                tracing::warn!(
                    timeout_secs = join_timeout.as_secs(),
                    "monitor did not stop in time"
                );
                false
            }
        }
    }
}
