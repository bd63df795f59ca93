//! Status file: writes `status.json` on every monitor state transition.
//!
//! Uses atomic write pattern: write to temp file then rename.
use crate::model::{ReasonCode, StepOutcome};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Monitor loop states written to the status file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Starting,
    HealthChecking,
    Recovering,
    Backoff,
    Cooldown,
    Sleeping,
    ShuttingDown,
}

impl std::fmt::Display for LoopState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LoopState::Starting => "starting",
            LoopState::HealthChecking => "health_checking",
            LoopState::Recovering => "recovering",
            LoopState::Backoff => "backoff",
            LoopState::Cooldown => "cooldown",
            LoopState::Sleeping => "sleeping",
            LoopState::ShuttingDown => "shutting_down",
        };
        f.write_str(s)
    }
}

/// The JSON payload written to `status.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusData {
    pub pid: u32,
    pub state: LoopState,
    pub consecutive_failures: u32,
    pub last_success: Option<DateTime<Utc>>,
    pub last_reasons: Vec<ReasonCode>,
    pub last_steps: Vec<StepOutcome>,
    pub last_update: DateTime<Utc>,
}

/// Manages the status file lifecycle.
pub struct StatusFile {
    path: PathBuf,
}

impl StatusFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Atomically write status data to the status file.
    pub fn write(&self, data: &StatusData) -> Result<(), StatusError> {
        let json =
            serde_json::to_string_pretty(data).map_err(|e| StatusError::Serialize { source: e })?;

        let dir = self.path.parent().unwrap_or(Path::new("."));
        let tmp_path = dir.join(format!(".status.json.tmp.{}", std::process::id()));

        std::fs::write(&tmp_path, json.as_bytes()).map_err(|e| StatusError::Write {
            path: tmp_path.clone(),
            source: e,
        })?;

        std::fs::rename(&tmp_path, &self.path).map_err(|e| StatusError::Rename {
            from: tmp_path,
            to: self.path.clone(),
            source: e,
        })?;

        Ok(())
    }

    /// Read the last written status. `Ok(None)` if no supervisor has written one.
    pub fn read(&self) -> Result<Option<StatusData>, StatusError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StatusError::Read {
                    path: self.path.clone(),
                    source: e,
                })
            }
        };
        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|e| StatusError::Parse {
                path: self.path.clone(),
                source: e,
            })
    }

    /// Remove the status file (on clean shutdown).
    pub fn remove(&self) {
        let _ = std::fs::remove_file(&self.path);
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Monitor-owned tracker that builds [`StatusData`] for each update.
pub struct StatusTracker {
    file: StatusFile,
    pid: u32,
    consecutive_failures: u32,
    last_success: Option<DateTime<Utc>>,
    last_reasons: Vec<ReasonCode>,
    last_steps: Vec<StepOutcome>,
}

impl StatusTracker {
    pub fn new(status_path: PathBuf) -> Self {
        Self {
            file: StatusFile::new(status_path),
            pid: std::process::id(),
            consecutive_failures: 0,
            last_success: None,
            last_reasons: Vec::new(),
            last_steps: Vec::new(),
        }
    }

    /// Write the status file with the given state. Failures are logged only.
    pub fn update(&self, state: LoopState) {
        let data = StatusData {
            pid: self.pid,
            state,
            consecutive_failures: self.consecutive_failures,
            last_success: self.last_success,
            last_reasons: self.last_reasons.clone(),
            last_steps: self.last_steps.clone(),
            last_update: Utc::now(),
        };

        if let Err(e) = self.file.write(&data) {
            tracing::warn!(error = %e, "failed to write status file");
        }
    }

    pub fn set_consecutive_failures(&mut self, count: u32) {
        self.consecutive_failures = count;
    }

    pub fn set_last_success(&mut self, at: Option<DateTime<Utc>>) {
        self.last_success = at;
    }

    pub fn set_last_reasons(&mut self, reasons: Vec<ReasonCode>) {
        self.last_reasons = reasons;
    }

    pub fn set_last_steps(&mut self, steps: Vec<StepOutcome>) {
        self.last_steps = steps;
    }

    /// Remove the status file.
    pub fn remove(&self) {
        self.file.remove();
    }
}

/// Errors from status file operations.
#[derive(Debug)]
pub enum StatusError {
    Serialize {
        source: serde_json::Error,
    },
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    Rename {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

impl std::fmt::Display for StatusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusError::Serialize { source } => write!(f, "failed to serialize status: {source}"),
            StatusError::Write { path, source } => {
                write!(
                    f,
                    "failed to write temp status file {}: {source}",
                    path.display()
                )
            }
            StatusError::Rename { from, to, source } => {
                write!(
                    f,
                    "failed to rename {} -> {}: {source}",
                    from.display(),
                    to.display()
                )
            }
            StatusError::Read { path, source } => {
                write!(f, "failed to read status file {}: {source}", path.display())
            }
            StatusError::Parse { path, source } => {
                write!(f, "failed to parse status file {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for StatusError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StatusError::Serialize { source } => Some(source),
            StatusError::Write { source, .. } => Some(source),
            StatusError::Rename { source, .. } => Some(source),
            StatusError::Read { source, .. } => Some(source),
            StatusError::Parse { source, .. } => Some(source),
        }
    }
}
