use super::ServiceBackend;
use crate::classify;
use crate::command::{self, CommandOutput};
use crate::config::{secs, ServiceConfig};
use crate::model::ServiceState;
use crate::signals::Shutdown;
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;

/// Windows Service Control Manager via `sc`, with PowerShell as fallback.
pub struct WindowsBackend {
    service: String,
    sc: PathBuf,
    powershell: PathBuf,
    command_timeout: Duration,
    start_timeout: Duration,
    shutdown: Shutdown,
}

impl WindowsBackend {
    pub fn new(config: &ServiceConfig, shutdown: Shutdown) -> Self {
        Self {
            service: config.name.clone(),
            sc: PathBuf::from("sc"),
            powershell: PathBuf::from("powershell"),
            command_timeout: secs(config.command_timeout_secs),
            start_timeout: secs(config.start_timeout_secs),
            shutdown,
        }
    }

    pub fn with_programs(mut self, sc: impl Into<PathBuf>, powershell: impl Into<PathBuf>) -> Self {
        self.sc = sc.into();
        self.powershell = powershell.into();
        self
    }

    async fn sc(&self, verb: &str, timeout: Duration) -> Option<CommandOutput> {
        let args = command::args(&[verb, &self.service]);
        match command::run(&self.sc, &args, timeout, &self.shutdown).await {
            Ok(out) => Some(out),
            Err(e) => {
                tracing::warn!(verb, service = %self.service, error = %e, "sc failed");
                None
            }
        }
    }

    async fn powershell(&self, script: String, timeout: Duration) -> Option<CommandOutput> {
        let args = vec!["-NoProfile".to_string(), "-Command".to_string(), script];
        match command::run(&self.powershell, &args, timeout, &self.shutdown).await {
            Ok(out) => Some(out),
            Err(e) => {
                tracing::warn!(service = %self.service, error = %e, "powershell failed");
                None
            }
        }
    }

    async fn query_powershell(&self) -> ServiceState {
        let script = format!(
            "Get-Service -Name '{}' -ErrorAction SilentlyContinue | Select-Object -ExpandProperty Status",
            self.service
        );
        match self.powershell(script, self.command_timeout).await {
            Some(out) if out.success() => classify::parse_powershell_status(&out.stdout),
            _ => ServiceState::Error,
        }
    }
}

#[async_trait]
impl ServiceBackend for WindowsBackend {
    fn name(&self) -> &'static str {
        "windows"
    }

    async fn query(&self) -> ServiceState {
        if let Some(out) = self.sc("query", self.command_timeout).await {
            let text = out.combined();
            if classify::service_does_not_exist(&text) {
                return ServiceState::NotFound;
            }
            if out.success() {
                let state = classify::parse_sc_query(&out.stdout);
                if state != ServiceState::Unknown {
                    return state;
                }
            }
        }
        tracing::debug!(service = %self.service, "sc query inconclusive, asking powershell");
        self.query_powershell().await
    }

    async fn start_primary(&self) -> bool {
        match self.sc("start", self.start_timeout).await {
            Some(out) if out.success() => true,
            Some(out) => {
                let text = out.combined();
                if classify::service_already_running(&text) {
                    return true;
                }
                tracing::warn!(service = %self.service, output = %text.trim(), "sc start failed");
                false
            }
            None => false,
        }
    }

    async fn start_fallback(&self) -> bool {
        let script = format!("Start-Service -Name '{}'", self.service);
        self.powershell(script, self.start_timeout)
            .await
            .is_some_and(|out| out.success() || classify::service_already_running(&out.combined()))
    }

    async fn stop(&self) -> bool {
        self.sc("stop", self.start_timeout)
            .await
            .is_some_and(|out| out.success())
    }
}
