use super::ServiceBackend;
use crate::classify;
use crate::command::{self, CommandOutput};
use crate::config::{secs, ServiceConfig};
use crate::model::ServiceState;
use crate::signals::Shutdown;
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;

/// systemd via `systemctl`, with the SysV `service` wrapper as fallback.
pub struct SystemdBackend {
    unit: String,
    systemctl: PathBuf,
    service_cmd: PathBuf,
    command_timeout: Duration,
    start_timeout: Duration,
    shutdown: Shutdown,
}

impl SystemdBackend {
    pub fn new(config: &ServiceConfig, shutdown: Shutdown) -> Self {
        Self {
            unit: config.name.clone(),
            systemctl: PathBuf::from("systemctl"),
            service_cmd: PathBuf::from("service"),
            command_timeout: secs(config.command_timeout_secs),
            start_timeout: secs(config.start_timeout_secs),
            shutdown,
        }
    }

    /// Override the programs invoked, e.g. to point at wrappers.
    pub fn with_programs(mut self, systemctl: impl Into<PathBuf>, service: impl Into<PathBuf>) -> Self {
        self.systemctl = systemctl.into();
        self.service_cmd = service.into();
        self
    }

    async fn systemctl(&self, verb: &str, timeout: Duration) -> Option<CommandOutput> {
        let args = command::args(&[verb, &self.unit]);
        match command::run(&self.systemctl, &args, timeout, &self.shutdown).await {
            Ok(out) => Some(out),
            Err(e) => {
                tracing::warn!(verb, unit = %self.unit, error = %e, "systemctl failed");
                None
            }
        }
    }
}

#[async_trait]
impl ServiceBackend for SystemdBackend {
    fn name(&self) -> &'static str {
        "systemd"
    }

    async fn query(&self) -> ServiceState {
        let args = command::args(&[
            "show",
            &self.unit,
            "--property=LoadState,ActiveState",
        ]);
        match command::run(&self.systemctl, &args, self.command_timeout, &self.shutdown).await {
            Ok(out) if out.success() => classify::parse_systemd_show(&out.stdout),
            Ok(out) => {
                tracing::warn!(
                    unit = %self.unit,
                    exit_code = ?out.exit_code,
                    stderr = %out.stderr.trim(),
                    "systemctl show failed"
                );
                ServiceState::Error
            }
            Err(e) => {
                tracing::warn!(unit = %self.unit, error = %e, "could not query service state");
                ServiceState::Error
            }
        }
    }

    async fn start_primary(&self) -> bool {
        match self.systemctl("start", self.start_timeout).await {
            Some(out) if out.success() => true,
            Some(out) => {
                let text = out.combined();
                if classify::service_already_running(&text) {
                    return true;
                }
                tracing::warn!(unit = %self.unit, output = %text.trim(), "systemctl start failed");
                false
            }
            None => false,
        }
    }

    async fn start_fallback(&self) -> bool {
        let args = command::args(&[&self.unit, "start"]);
        match command::run(&self.service_cmd, &args, self.start_timeout, &self.shutdown).await {
            Ok(out) => out.success() || classify::service_already_running(&out.combined()),
            Err(e) => {
                tracing::warn!(unit = %self.unit, error = %e, "service start fallback failed");
                false
            }
        }
    }

    async fn stop(&self) -> bool {
        self.systemctl("stop", self.start_timeout)
            .await
            .is_some_and(|out| out.success())
    }
}
