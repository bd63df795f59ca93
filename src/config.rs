use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Static supervisor settings loaded from `tailguard.toml`.
///
/// These are read once at startup and passed by reference into every
/// component constructor. The mutable operational config (auth secret,
/// check interval, tags) lives in [`crate::config_store::WatchdogConfig`].
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SupervisorConfig {
    pub storage: StorageConfig,
    pub agent: AgentConfig,
    pub service: ServiceConfig,
    pub connectivity: ConnectivityConfig,
    pub monitor: MonitorConfig,
    pub recovery: RecoveryConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Path to the agent CLI binary.
    pub cli_path: PathBuf,
    pub status_timeout_secs: u64,
    pub auth_timeout_secs: u64,
    /// Every process name belonging to the agent (CLI, daemon, tray app).
    pub process_names: Vec<String>,
    /// The subset of `process_names` that is the service-hosted daemon.
    pub daemon_process_names: Vec<String>,
    pub process_list_timeout_secs: u64,
}

/// Which service manager backend to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceManagerKind {
    /// Pick by target OS at composition time.
    Auto,
    Systemd,
    Windows,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
    pub manager: ServiceManagerKind,
    pub command_timeout_secs: u64,
    pub start_timeout_secs: u64,
    pub start_poll_interval_secs: u64,
    pub start_poll_attempts: u32,
    pub fallback_settle_secs: u64,
    pub restart_settle_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
    pub host: String,
    pub port: u16,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub base_delay_secs: u64,
    pub cap_secs: u64,
    pub max_retries: u32,
    pub cooldown_secs: u64,
    /// Pause after an iteration blew up before trying again.
    pub error_cooldown_secs: u64,
    /// How long `stop` waits for the worker to finish.
    pub join_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub manual_settle_secs: u64,
    pub reprobe_settle_secs: u64,
    pub verify_settle_secs: u64,
    pub manual_verify_settle_secs: u64,
}

/// Log file alongside the console output, for `service` runs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub file: bool,
    /// Defaults to `<data_dir>/logs`.
    pub dir: Option<PathBuf>,
    /// Rotated daily; older files beyond this count are deleted.
    pub max_files: usize,
}

// --- Default implementations ---

impl Default for StorageConfig {
    fn default() -> Self {
        let data_dir = if cfg!(windows) {
            PathBuf::from("C:/ProgramData/Tailguard")
        } else {
            PathBuf::from("/var/lib/tailguard")
        };
        Self { data_dir }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        let cli_path = if cfg!(windows) {
            PathBuf::from(r"C:\Program Files\Tailscale\tailscale.exe")
        } else {
            PathBuf::from("/usr/bin/tailscale")
        };
        Self {
            cli_path,
            status_timeout_secs: 30,
            auth_timeout_secs: 120,
            process_names: vec![
                "tailscale".to_string(),
                "tailscaled".to_string(),
                "tailscale-ipn".to_string(),
            ],
            daemon_process_names: vec!["tailscaled".to_string()],
            process_list_timeout_secs: 15,
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        let name = if cfg!(windows) { "Tailscale" } else { "tailscaled" };
        Self {
            name: name.to_string(),
            manager: ServiceManagerKind::Auto,
            command_timeout_secs: 15,
            start_timeout_secs: 60,
            start_poll_interval_secs: 3,
            start_poll_attempts: 10,
            fallback_settle_secs: 5,
            restart_settle_secs: 3,
        }
    }
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            host: "login.tailscale.com".to_string(),
            port: 443,
            timeout_secs: 10,
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            base_delay_secs: 5,
            cap_secs: 300,
            max_retries: 5,
            cooldown_secs: 300,
            error_cooldown_secs: 60,
            join_timeout_secs: 10,
        }
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            manual_settle_secs: 2,
            reprobe_settle_secs: 2,
            verify_settle_secs: 3,
            manual_verify_settle_secs: 8,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            file: true,
            dir: None,
            max_files: 5,
        }
    }
}

impl ServiceManagerKind {
    /// Resolve `Auto` to the backend for the platform we were built for.
    pub fn resolve(self) -> Self {
        match self {
            ServiceManagerKind::Auto if cfg!(windows) => ServiceManagerKind::Windows,
            ServiceManagerKind::Auto => ServiceManagerKind::Systemd,
            other => other,
        }
    }
}

/// Shorthand used by components that store seconds in config.
pub fn secs(value: u64) -> Duration {
    Duration::from_secs(value)
}

/// Errors from loading the static settings file.
#[derive(Debug)]
pub enum SettingsError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl std::fmt::Display for SettingsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SettingsError::Read { path, source } => {
                write!(f, "failed to read {}: {source}", path.display())
            }
            SettingsError::Parse { path, source } => {
                write!(f, "failed to parse {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for SettingsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SettingsError::Read { source, .. } => Some(source),
            SettingsError::Parse { source, .. } => Some(source),
        }
    }
}

/// Load settings from `path`. A missing file yields the defaults.
pub fn load(path: &Path) -> Result<SupervisorConfig, SettingsError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no settings file, using defaults");
            return Ok(SupervisorConfig::default());
        }
        Err(e) => {
            return Err(SettingsError::Read {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };
    toml::from_str(&contents).map_err(|e| SettingsError::Parse {
        path: path.to_path_buf(),
        source: e,
    })
}
