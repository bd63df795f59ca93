//! The agent CLI: status queries and non-interactive authentication.
use crate::classify::{self, AuthFailure};
use crate::command::{self, CommandError};
use crate::config::{secs, AgentConfig};
use crate::config_store::{ConfigStore, Secret, WatchdogConfig};
use crate::model::{AgentStatus, BackendState, ProbeError, ProbeErrorKind};
use crate::signals::Shutdown;
use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Queries the agent for its connection status.
///
/// Implementations never fail: every problem is folded into
/// [`AgentStatus::probe_error`].
#[async_trait]
pub trait StatusProbe: Send + Sync {
    async fn probe(&self, timeout: Duration) -> AgentStatus;
}

/// Repair-side operations on the agent.
#[async_trait]
pub trait AgentControl: Send + Sync {
    /// Whether the agent CLI binary is installed.
    fn binary_present(&self) -> bool;

    async fn authenticate(&self, request: &AuthRequest) -> AuthOutcome;
}

/// Everything the authenticate command needs, resolved from config.
#[derive(Debug, Clone)]
pub struct AuthRequest {
    pub secret: Secret,
    pub hostname: String,
    pub accept_routes: bool,
    pub unattended: bool,
    pub tags: Vec<String>,
}

impl AuthRequest {
    /// Build a request from the persisted config, or `None` without a secret.
    pub fn from_config(config: &WatchdogConfig) -> Option<Self> {
        let secret = config.secret()?.clone();
        let hostname = config
            .hostname_override
            .as_deref()
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(str::to_string)
            .unwrap_or_else(machine_hostname);
        Some(Self {
            secret,
            hostname,
            accept_routes: config.accept_routes,
            unattended: config.unattended_mode,
            tags: config.tags.clone(),
        })
    }

    /// The `up` argument list. Contains the secret: never log it directly.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "up".to_string(),
            "--auth-key".to_string(),
            self.secret.expose().to_string(),
        ];
        if self.unattended {
            args.push("--unattended".to_string());
        }
        if self.accept_routes {
            args.push("--accept-routes".to_string());
        }
        args.push("--hostname".to_string());
        args.push(self.hostname.clone());
        if !self.tags.is_empty() {
            args.push(format!("--advertise-tags={}", self.tags.join(",")));
        }
        args
    }

    /// [`Self::to_args`] with the secret replaced, for logging.
    pub fn redacted_args(&self) -> Vec<String> {
        let mut args = self.to_args();
        if let Some(secret) = args.get_mut(2) {
            *secret = "***".to_string();
        }
        args
    }
}

/// Result of an authenticate attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    Authenticated,
    AlreadyAuthenticated,
    Rejected(AuthFailure),
    Failed(String),
}

impl AuthOutcome {
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            AuthOutcome::Authenticated | AuthOutcome::AlreadyAuthenticated
        )
    }
}

/// The lowercase machine hostname, or `unknown`.
pub fn machine_hostname() -> String {
    #[cfg(unix)]
    {
        if let Ok(name) = nix::unistd::gethostname() {
            let name = name.to_string_lossy().trim().to_lowercase();
            if !name.is_empty() {
                return name;
            }
        }
    }
    std::env::var("COMPUTERNAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .map(|h| h.trim().to_lowercase())
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

#[derive(Debug, Deserialize)]
struct StatusJson {
    #[serde(rename = "BackendState")]
    backend_state: String,
    #[serde(rename = "Self", default)]
    self_node: Option<SelfNode>,
}

#[derive(Debug, Deserialize, Default)]
struct SelfNode {
    #[serde(rename = "HostName", default)]
    host_name: String,
    #[serde(rename = "TailscaleIPs", default)]
    tailscale_ips: Option<Vec<String>>,
}

/// Parse `status --json` output into an [`AgentStatus`].
pub fn parse_status_json(stdout: &str) -> AgentStatus {
    match serde_json::from_str::<StatusJson>(stdout) {
        Ok(parsed) => {
            let node = parsed.self_node.unwrap_or_default();
            AgentStatus::reported(
                BackendState::from_agent(&parsed.backend_state),
                node.host_name,
                node.tailscale_ips.unwrap_or_default(),
            )
        }
        Err(e) => AgentStatus::failed(ProbeError::new(
            ProbeErrorKind::MalformedResponse,
            format!("invalid status JSON: {e}"),
        )),
    }
}

/// The agent CLI binary (`tailscale` / `tailscale.exe`).
pub struct AgentCli {
    cli_path: PathBuf,
    auth_timeout: Duration,
    store: Arc<dyn ConfigStore>,
    shutdown: Shutdown,
}

impl AgentCli {
    pub fn new(config: &AgentConfig, store: Arc<dyn ConfigStore>, shutdown: Shutdown) -> Self {
        Self {
            cli_path: config.cli_path.clone(),
            auth_timeout: secs(config.auth_timeout_secs),
            store,
            shutdown,
        }
    }

    fn record_auth_time(&self) {
        let now = chrono::Utc::now();
        if let Err(e) = self
            .store
            .update(&mut |cfg| cfg.last_auth_timestamp = Some(now))
        {
            tracing::warn!(error = %e, "failed to record last authentication time");
        }
    }
}

#[async_trait]
impl StatusProbe for AgentCli {
    async fn probe(&self, timeout: Duration) -> AgentStatus {
        if !self.cli_path.exists() {
            return AgentStatus::failed(ProbeError::new(
                ProbeErrorKind::NotInstalled,
                format!("agent CLI not found at {}", self.cli_path.display()),
            ));
        }

        let args = command::args(&["status", "--json"]);
        let output = match command::run(&self.cli_path, &args, timeout, &self.shutdown).await {
            Ok(out) => out,
            Err(e) => {
                let kind = match &e {
                    CommandError::NotFound { .. } => ProbeErrorKind::NotInstalled,
                    CommandError::Timeout { .. } | CommandError::Cancelled { .. } => {
                        ProbeErrorKind::Timeout
                    }
                    CommandError::PermissionDenied { .. } => ProbeErrorKind::PermissionDenied,
                    CommandError::Io { .. } => ProbeErrorKind::Exception,
                };
                return AgentStatus::failed(ProbeError::new(kind, e.to_string()));
            }
        };

        if output.success() {
            let status = parse_status_json(&output.stdout);
            tracing::debug!(
                backend_state = %status.backend_state,
                connected = status.is_connected(),
                "agent status retrieved"
            );
            return status;
        }

        let kind = classify::classify_status_failure(&output.combined());
        AgentStatus::failed(ProbeError::new(
            kind,
            format!(
                "status query exited with {:?}: {}",
                output.exit_code,
                output.stderr.trim()
            ),
        ))
    }
}

#[async_trait]
impl AgentControl for AgentCli {
    fn binary_present(&self) -> bool {
        self.cli_path.exists()
    }

    async fn authenticate(&self, request: &AuthRequest) -> AuthOutcome {
        tracing::info!(
            hostname = %request.hostname,
            args = ?request.redacted_args(),
            "authenticating agent"
        );

        let args = request.to_args();
        let output = match command::run(&self.cli_path, &args, self.auth_timeout, &self.shutdown).await
        {
            Ok(out) => out,
            Err(e) => {
                tracing::error!(error = %e, "authentication command failed to run");
                return AuthOutcome::Failed(e.to_string());
            }
        };

        if output.success() {
            tracing::info!("agent authentication successful");
            self.record_auth_time();
            return AuthOutcome::Authenticated;
        }

        let text = output.combined();
        match classify::classify_auth_failure(&text) {
            AuthFailure::AlreadyAuthenticated => {
                tracing::info!("agent already authenticated");
                self.record_auth_time();
                AuthOutcome::AlreadyAuthenticated
            }
            AuthFailure::KeyExpired => {
                tracing::error!("auth key has expired, manual intervention required");
                AuthOutcome::Rejected(AuthFailure::KeyExpired)
            }
            AuthFailure::InvalidKey => {
                tracing::error!("auth key is invalid, check configuration");
                AuthOutcome::Rejected(AuthFailure::InvalidKey)
            }
            AuthFailure::Other => {
                tracing::error!(
                    exit_code = ?output.exit_code,
                    stderr = %output.stderr.trim(),
                    "agent authentication failed"
                );
                AuthOutcome::Rejected(AuthFailure::Other)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryConfigStore;

    fn request() -> AuthRequest {
        AuthRequest {
            secret: Secret::new("tskey-auth-xyz"),
            hostname: "kiosk-7".to_string(),
            accept_routes: true,
            unattended: true,
            tags: vec!["tag:employee".to_string(), "tag:kiosk".to_string()],
        }
    }

    #[test]
    fn test_parse_status_running() {
        let json = r#"{"BackendState":"Running","Self":{"HostName":"laptop","TailscaleIPs":["100.101.102.103","fd7a:115c:a1e0::1"]}}"#;
        let status = parse_status_json(json);
        assert_eq!(status.backend_state, BackendState::Running);
        assert_eq!(status.self_hostname, "laptop");
        assert_eq!(status.self_ips.len(), 2);
        assert!(status.is_connected());
        assert!(status.probe_error.is_none());
    }

    #[test]
    fn test_parse_status_needs_login_without_self() {
        let status = parse_status_json(r#"{"BackendState":"NeedsLogin","Self":null}"#);
        assert_eq!(status.backend_state, BackendState::NeedsLogin);
        assert!(status.self_ips.is_empty());
        assert!(!status.is_connected());
    }

    #[test]
    fn test_parse_status_null_ips() {
        let status = parse_status_json(
            r#"{"BackendState":"Running","Self":{"HostName":"h","TailscaleIPs":null}}"#,
        );
        assert!(!status.has_ip());
        assert!(!status.is_connected());
    }

    #[test]
    fn test_parse_status_malformed() {
        let status = parse_status_json("not json");
        assert_eq!(status.error_kind(), Some(ProbeErrorKind::MalformedResponse));
        assert_eq!(status.backend_state, BackendState::Unknown);
    }

    #[test]
    fn test_auth_args() {
        let args = request().to_args();
        assert_eq!(
            args,
            vec![
                "up",
                "--auth-key",
                "tskey-auth-xyz",
                "--unattended",
                "--accept-routes",
                "--hostname",
                "kiosk-7",
                "--advertise-tags=tag:employee,tag:kiosk",
            ]
        );
    }

    #[test]
    fn test_auth_args_minimal() {
        let req = AuthRequest {
            accept_routes: false,
            unattended: false,
            tags: vec![],
            ..request()
        };
        assert_eq!(
            req.to_args(),
            vec!["up", "--auth-key", "tskey-auth-xyz", "--hostname", "kiosk-7"]
        );
    }

    #[test]
    fn test_redacted_args_hide_secret() {
        let redacted = request().redacted_args();
        assert!(!redacted.iter().any(|a| a.contains("tskey")));
        assert_eq!(redacted[2], "***");
    }

    #[test]
    fn test_auth_request_from_config() {
        let cfg = WatchdogConfig {
            auth_secret: Some(Secret::new("k")),
            hostname_override: Some("  override  ".to_string()),
            ..Default::default()
        };
        let req = AuthRequest::from_config(&cfg).unwrap();
        assert_eq!(req.hostname, "override");
        assert!(req.accept_routes);
        assert!(req.unattended);

        assert!(AuthRequest::from_config(&WatchdogConfig::default()).is_none());
    }

    #[test]
    fn test_hostname_fallback_is_lowercase() {
        let cfg = WatchdogConfig {
            auth_secret: Some(Secret::new("k")),
            ..Default::default()
        };
        let req = AuthRequest::from_config(&cfg).unwrap();
        assert!(!req.hostname.is_empty());
        assert_eq!(req.hostname, req.hostname.to_lowercase());
    }

    #[tokio::test]
    async fn test_probe_missing_binary_is_not_installed() {
        let cfg = AgentConfig {
            cli_path: PathBuf::from("/nonexistent/tailscale"),
            ..Default::default()
        };
        let cli = AgentCli::new(&cfg, Arc::new(MemoryConfigStore::default()), Shutdown::never());
        let status = cli.probe(Duration::from_secs(1)).await;
        assert_eq!(status.error_kind(), Some(ProbeErrorKind::NotInstalled));
        assert!(!cli.binary_present());
    }

    #[cfg(unix)]
    mod with_fake_cli {
        use super::*;
        use std::os::unix::fs::PermissionsExt;

        /// Write an executable shell script standing in for the agent CLI.
        fn fake_cli(dir: &std::path::Path, body: &str) -> PathBuf {
            let path = dir.join("tailscale");
            std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        fn cli_for(path: PathBuf, store: Arc<MemoryConfigStore>) -> AgentCli {
            let cfg = AgentConfig {
                cli_path: path,
                auth_timeout_secs: 5,
                ..Default::default()
            };
            AgentCli::new(&cfg, store, Shutdown::never())
        }

        #[tokio::test]
        async fn test_probe_running() {
            let dir = tempfile::tempdir().unwrap();
            let path = fake_cli(
                dir.path(),
                r#"echo '{"BackendState":"Running","Self":{"HostName":"box","TailscaleIPs":["100.64.0.9"]}}'"#,
            );
            let cli = cli_for(path, Arc::new(MemoryConfigStore::default()));
            let status = cli.probe(Duration::from_secs(5)).await;
            assert!(status.is_connected());
            assert_eq!(status.primary_ip(), Some("100.64.0.9"));
        }

        #[tokio::test]
        async fn test_probe_twice_is_stable() {
            let dir = tempfile::tempdir().unwrap();
            let path = fake_cli(
                dir.path(),
                r#"echo '{"BackendState":"Stopped","Self":{"HostName":"box","TailscaleIPs":[]}}'"#,
            );
            let cli = cli_for(path, Arc::new(MemoryConfigStore::default()));
            let first = cli.probe(Duration::from_secs(5)).await;
            let second = cli.probe(Duration::from_secs(5)).await;
            assert_eq!(first, second);
        }

        #[tokio::test]
        async fn test_probe_not_running_exit() {
            let dir = tempfile::tempdir().unwrap();
            let path = fake_cli(dir.path(), "echo 'Tailscale is not running' >&2; exit 1");
            let cli = cli_for(path, Arc::new(MemoryConfigStore::default()));
            let status = cli.probe(Duration::from_secs(5)).await;
            assert_eq!(status.error_kind(), Some(ProbeErrorKind::NotRunning));
        }

        #[tokio::test]
        async fn test_probe_permission_denied_exit() {
            let dir = tempfile::tempdir().unwrap();
            let path = fake_cli(
                dir.path(),
                "echo 'dial unix /run/tailscale.sock: connect: permission denied' >&2; exit 1",
            );
            let cli = cli_for(path, Arc::new(MemoryConfigStore::default()));
            let status = cli.probe(Duration::from_secs(5)).await;
            assert_eq!(status.error_kind(), Some(ProbeErrorKind::PermissionDenied));
        }

        #[tokio::test]
        async fn test_probe_timeout() {
            let dir = tempfile::tempdir().unwrap();
            let path = fake_cli(dir.path(), "sleep 5");
            let cli = cli_for(path, Arc::new(MemoryConfigStore::default()));
            let status = cli.probe(Duration::from_millis(200)).await;
            assert_eq!(status.error_kind(), Some(ProbeErrorKind::Timeout));
        }

        #[tokio::test]
        async fn test_hung_cli_released_by_stop() {
            let dir = tempfile::tempdir().unwrap();
            let path = fake_cli(dir.path(), "sleep 5");
            let (trigger, shutdown) = crate::signals::channel();
            let cfg = AgentConfig {
                cli_path: path,
                ..Default::default()
            };
            let cli = AgentCli::new(&cfg, Arc::new(MemoryConfigStore::default()), shutdown);

            let start = std::time::Instant::now();
            let probing = cli.probe(Duration::from_secs(30));
            let stopping = async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                trigger.trigger();
            };
            let (status, ()) = tokio::join!(probing, stopping);
            assert!(status.probe_error.is_some());
            assert!(start.elapsed() < Duration::from_secs(4));
        }

        #[tokio::test]
        async fn test_probe_malformed_output() {
            let dir = tempfile::tempdir().unwrap();
            let path = fake_cli(dir.path(), "echo '{truncated'");
            let cli = cli_for(path, Arc::new(MemoryConfigStore::default()));
            let status = cli.probe(Duration::from_secs(5)).await;
            assert_eq!(status.error_kind(), Some(ProbeErrorKind::MalformedResponse));
        }

        #[tokio::test]
        async fn test_authenticate_success_records_time() {
            let dir = tempfile::tempdir().unwrap();
            let path = fake_cli(dir.path(), "exit 0");
            let store = Arc::new(MemoryConfigStore::default());
            let cli = cli_for(path, Arc::clone(&store));
            let outcome = cli.authenticate(&request()).await;
            assert_eq!(outcome, AuthOutcome::Authenticated);
            assert!(store.snapshot().last_auth_timestamp.is_some());
        }

        #[tokio::test]
        async fn test_authenticate_already_authenticated_is_success() {
            let dir = tempfile::tempdir().unwrap();
            let path = fake_cli(dir.path(), "echo 'already authenticated' >&2; exit 1");
            let cli = cli_for(path, Arc::new(MemoryConfigStore::default()));
            let outcome = cli.authenticate(&request()).await;
            assert_eq!(outcome, AuthOutcome::AlreadyAuthenticated);
            assert!(outcome.is_success());
        }

        #[tokio::test]
        async fn test_authenticate_expired_key() {
            let dir = tempfile::tempdir().unwrap();
            let path = fake_cli(dir.path(), "echo 'backend error: key expired' >&2; exit 1");
            let store = Arc::new(MemoryConfigStore::default());
            let cli = cli_for(path, Arc::clone(&store));
            let outcome = cli.authenticate(&request()).await;
            assert_eq!(outcome, AuthOutcome::Rejected(AuthFailure::KeyExpired));
            assert!(!outcome.is_success());
            assert!(store.snapshot().last_auth_timestamp.is_none());
        }

        #[tokio::test]
        async fn test_authenticate_passes_arguments() {
            let dir = tempfile::tempdir().unwrap();
            let log = dir.path().join("args.txt");
            let path = fake_cli(dir.path(), &format!("echo \"$@\" > {}", log.display()));
            let cli = cli_for(path, Arc::new(MemoryConfigStore::default()));
            assert!(cli.authenticate(&request()).await.is_success());
            let recorded = std::fs::read_to_string(&log).unwrap();
            assert!(recorded.contains("up --auth-key tskey-auth-xyz --unattended"));
            assert!(recorded.contains("--hostname kiosk-7"));
        }
    }
}
