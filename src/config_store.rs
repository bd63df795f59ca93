//! Persisted operational config and the store that guards it.
//!
//! `setup` writes while the monitor loop may be reading, so every access is
//! serialized: an in-process mutex plus an advisory file lock shared with
//! other processes, and every write lands via temp file + rename.
use crate::data_dir::DataDir;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Opaque auth credential. Never printed.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The raw value, for building the authenticate command only.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl std::fmt::Display for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("***")
    }
}

/// Operational config persisted in `<data_dir>/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub auth_secret: Option<Secret>,
    pub hostname_override: Option<String>,
    pub check_interval_secs: u64,
    pub accept_routes: bool,
    pub tags: Vec<String>,
    pub unattended_mode: bool,
    pub last_auth_timestamp: Option<DateTime<Utc>>,
    pub configured_at: Option<DateTime<Utc>>,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            auth_secret: None,
            hostname_override: None,
            check_interval_secs: 30,
            accept_routes: true,
            tags: vec!["tag:employee".to_string()],
            unattended_mode: true,
            last_auth_timestamp: None,
            configured_at: None,
        }
    }
}

impl WatchdogConfig {
    /// The secret, if one is configured and non-blank.
    pub fn secret(&self) -> Option<&Secret> {
        self.auth_secret.as_ref().filter(|s| !s.is_empty())
    }
}

/// Errors from reading or writing the persisted config.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    Serialize {
        source: toml::ser::Error,
    },
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    Lock {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {source}", path.display())
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {source}", path.display())
            }
            ConfigError::Serialize { source } => write!(f, "failed to serialize config: {source}"),
            ConfigError::Write { path, source } => {
                write!(f, "failed to write config {}: {source}", path.display())
            }
            ConfigError::Lock { path, source } => {
                write!(f, "failed to lock {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Serialize { source } => Some(source),
            ConfigError::Write { source, .. } => Some(source),
            ConfigError::Lock { source, .. } => Some(source),
        }
    }
}

/// Load/save access to [`WatchdogConfig`].
pub trait ConfigStore: Send + Sync {
    fn load(&self) -> Result<WatchdogConfig, ConfigError>;

    fn save(&self, config: &WatchdogConfig) -> Result<(), ConfigError>;

    /// Read-modify-write under a single exclusive hold. Returns the saved config.
    fn update(
        &self,
        apply: &mut dyn FnMut(&mut WatchdogConfig),
    ) -> Result<WatchdogConfig, ConfigError>;
}

/// File-backed store: TOML at `<data_dir>/config.toml`, locked via `config.lock`.
pub struct FileConfigStore {
    path: PathBuf,
    lock_path: PathBuf,
    guard: Mutex<()>,
}

impl FileConfigStore {
    pub fn new(data_dir: &DataDir) -> Self {
        Self {
            path: data_dir.config(),
            lock_path: data_dir.config_lock(),
            guard: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open_lock(&self) -> Result<File, ConfigError> {
        if let Some(dir) = self.lock_path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| ConfigError::Lock {
                path: self.lock_path.clone(),
                source: e,
            })?;
        }
        OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)
            .map_err(|e| ConfigError::Lock {
                path: self.lock_path.clone(),
                source: e,
            })
    }

    fn lock_error(&self, source: std::io::Error) -> ConfigError {
        ConfigError::Lock {
            path: self.lock_path.clone(),
            source,
        }
    }

    fn read_unlocked(&self) -> Result<WatchdogConfig, ConfigError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(WatchdogConfig::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: self.path.clone(),
                    source: e,
                })
            }
        };
        toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: self.path.clone(),
            source: e,
        })
    }

    /// Write to a temp file in the same directory, then rename over the
    /// target so readers never see a partial file.
    fn write_unlocked(&self, config: &WatchdogConfig) -> Result<(), ConfigError> {
        let body =
            toml::to_string_pretty(config).map_err(|e| ConfigError::Serialize { source: e })?;
        let dir = self.path.parent().unwrap_or(Path::new("."));
        let write_err = |e: std::io::Error| ConfigError::Write {
            path: self.path.clone(),
            source: e,
        };

        std::fs::create_dir_all(dir).map_err(write_err)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(write_err)?;
        tmp.write_all(body.as_bytes()).map_err(write_err)?;
        tmp.as_file().sync_all().map_err(write_err)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tmp.as_file()
                .set_permissions(std::fs::Permissions::from_mode(0o600))
                .map_err(write_err)?;
        }

        tmp.persist(&self.path).map_err(|e| write_err(e.error))?;
        Ok(())
    }
}

impl ConfigStore for FileConfigStore {
    fn load(&self) -> Result<WatchdogConfig, ConfigError> {
        let _guard = self.guard.lock().unwrap_or_else(|p| p.into_inner());
        let lock = self.open_lock()?;
        FileExt::lock_shared(&lock).map_err(|e| self.lock_error(e))?;
        let result = self.read_unlocked();
        let _ = FileExt::unlock(&lock);
        if result.is_ok() {
            tracing::debug!(path = %self.path.display(), "configuration loaded");
        }
        result
    }

    fn save(&self, config: &WatchdogConfig) -> Result<(), ConfigError> {
        let _guard = self.guard.lock().unwrap_or_else(|p| p.into_inner());
        let lock = self.open_lock()?;
        FileExt::lock_exclusive(&lock).map_err(|e| self.lock_error(e))?;
        let result = self.write_unlocked(config);
        let _ = FileExt::unlock(&lock);
        if result.is_ok() {
            tracing::debug!(path = %self.path.display(), "configuration saved");
        }
        result
    }

    fn update(
        &self,
        apply: &mut dyn FnMut(&mut WatchdogConfig),
    ) -> Result<WatchdogConfig, ConfigError> {
        let _guard = self.guard.lock().unwrap_or_else(|p| p.into_inner());
        let lock = self.open_lock()?;
        FileExt::lock_exclusive(&lock).map_err(|e| self.lock_error(e))?;
        let result = self.read_unlocked().and_then(|mut config| {
            apply(&mut config);
            self.write_unlocked(&config)?;
            Ok(config)
        });
        let _ = FileExt::unlock(&lock);
        result
    }
}
