//! Agent process enumeration and termination.
//!
//! Native enumeration goes through `sysinfo`. Where that is unsupported or
//! fails, a textual listing (`ps` / `tasklist`) is used instead and names are
//! matched by substring, which is coarser but still good enough to tell
//! "some agent process is alive" from "none are".
use crate::classify;
use crate::command::{self, CommandError};
use crate::signals::Shutdown;
use async_trait::async_trait;
use std::time::Duration;

/// One process seen in a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    /// Known only for native listings.
    pub pid: Option<u32>,
    /// Process name (native) or a raw listing line (fallback).
    pub name: String,
}

#[derive(Debug, Clone, Default)]
pub struct ProcessListing {
    pub entries: Vec<ProcessEntry>,
    /// True when names are exact process names rather than raw lines.
    pub exact: bool,
}

impl ProcessListing {
    pub fn native(entries: Vec<ProcessEntry>) -> Self {
        Self {
            entries,
            exact: true,
        }
    }

    pub fn from_lines(text: &str) -> Self {
        let entries = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(|l| ProcessEntry {
                pid: None,
                name: l.to_string(),
            })
            .collect();
        Self {
            entries,
            exact: false,
        }
    }

    /// Whether any process matching one of `names` is in the listing.
    pub fn any_alive(&self, names: &[String]) -> bool {
        self.entries.iter().any(|entry| {
            names.iter().any(|known| {
                if self.exact {
                    classify::process_name_matches(&entry.name, known)
                } else {
                    classify::process_line_mentions(&entry.name, known)
                }
            })
        })
    }
}

#[derive(Debug)]
pub enum ProcessError {
    /// No enumeration mechanism worked.
    Unavailable(String),
    /// The fallback listing command failed to run.
    Command(CommandError),
}

impl std::fmt::Display for ProcessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessError::Unavailable(msg) => write!(f, "process enumeration unavailable: {msg}"),
            ProcessError::Command(e) => write!(f, "process listing failed: {e}"),
        }
    }
}

impl std::error::Error for ProcessError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProcessError::Command(e) => Some(e),
            ProcessError::Unavailable(_) => None,
        }
    }
}

impl From<CommandError> for ProcessError {
    fn from(e: CommandError) -> Self {
        ProcessError::Command(e)
    }
}

/// OS process access used by manual-shutdown detection and cleanup.
#[async_trait]
pub trait ProcessInspector: Send + Sync {
    async fn list(&self) -> Result<ProcessListing, ProcessError>;

    /// Ask every process matching `names` to exit. Returns how many were signalled.
    async fn terminate(&self, names: &[String]) -> Result<usize, ProcessError>;
}

/// The real process table.
pub struct SystemProcesses {
    list_timeout: Duration,
    shutdown: Shutdown,
}

impl SystemProcesses {
    pub fn new(list_timeout: Duration, shutdown: Shutdown) -> Self {
        Self {
            list_timeout,
            shutdown,
        }
    }

    async fn native_list() -> Result<Vec<ProcessEntry>, ProcessError> {
        if !sysinfo::IS_SUPPORTED_SYSTEM {
            return Err(ProcessError::Unavailable(
                "sysinfo does not support this platform".to_string(),
            ));
        }
        tokio::task::spawn_blocking(|| {
            let mut sys = sysinfo::System::new();
            sys.refresh_processes();
            sys.processes()
                .iter()
                .map(|(pid, process)| ProcessEntry {
                    pid: Some(pid.as_u32()),
                    name: process.name().to_string(),
                })
                .collect::<Vec<_>>()
        })
        .await
        .map_err(|e| ProcessError::Unavailable(e.to_string()))
    }

    async fn fallback_list(&self) -> Result<ProcessListing, ProcessError> {
        let (program, args) = if cfg!(windows) {
            ("tasklist", command::args(&["/FO", "CSV", "/NH"]))
        } else {
            ("ps", command::args(&["-A", "-o", "comm="]))
        };
        let out = command::run(program, &args, self.list_timeout, &self.shutdown).await?;
        if !out.success() {
            return Err(ProcessError::Unavailable(format!(
                "{program} exited with {:?}",
                out.exit_code
            )));
        }
        Ok(ProcessListing::from_lines(&out.stdout))
    }
}

#[async_trait]
impl ProcessInspector for SystemProcesses {
    async fn list(&self) -> Result<ProcessListing, ProcessError> {
        match Self::native_list().await {
            Ok(entries) if !entries.is_empty() => return Ok(ProcessListing::native(entries)),
            Ok(_) => tracing::debug!("native process list empty, using fallback listing"),
            Err(e) => tracing::debug!(error = %e, "native process list failed, using fallback listing"),
        }
        self.fallback_list().await
    }

    async fn terminate(&self, names: &[String]) -> Result<usize, ProcessError> {
        let own_pid = std::process::id();
        let targets: Vec<ProcessEntry> = Self::native_list()
            .await?
            .into_iter()
            .filter(|entry| entry.pid != Some(own_pid))
            .filter(|entry| {
                names
                    .iter()
                    .any(|known| classify::process_name_matches(&entry.name, known))
            })
            .collect();

        let mut signalled = 0;
        for entry in targets {
            let Some(pid) = entry.pid else { continue };
            if send_terminate(pid) {
                tracing::info!(pid, name = %entry.name, "terminated agent process");
                signalled += 1;
            } else {
                tracing::warn!(pid, name = %entry.name, "failed to terminate agent process");
            }
        }
        Ok(signalled)
    }
}

#[cfg(unix)]
fn send_terminate(pid: u32) -> bool {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    kill(Pid::from_raw(raw), Signal::SIGTERM).is_ok()
}

#[cfg(not(unix))]
fn send_terminate(pid: u32) -> bool {
    let mut sys = sysinfo::System::new();
    sys.refresh_processes();
    sys.process(sysinfo::Pid::from_u32(pid))
        .is_some_and(|process| process.kill())
}
