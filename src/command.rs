//! Bounded external command execution.
//!
//! Every probe and repair action that shells out goes through [`run`], which
//! captures stdout/stderr, enforces a timeout, and kills the child if the
//! timeout fires or a stop is requested.
use crate::signals::Shutdown;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Captured result of a command that ran to completion.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Process exit code (None if killed by signal).
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// stderr and stdout joined, for classifiers that don't care which
    /// stream a message landed on.
    pub fn combined(&self) -> String {
        if self.stdout.is_empty() {
            self.stderr.clone()
        } else if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stderr, self.stdout)
        }
    }
}

/// Errors that prevent a command from producing any output.
#[derive(Debug)]
pub enum CommandError {
    /// The program does not exist.
    NotFound { program: String },
    /// The program exists but may not be executed by this user.
    PermissionDenied {
        program: String,
        source: std::io::Error,
    },
    /// The program did not finish within the allotted time and was killed.
    Timeout { program: String, timeout: Duration },
    /// A stop was requested before the program finished; it was killed.
    Cancelled { program: String },
    /// Any other spawn or wait failure.
    Io {
        program: String,
        source: std::io::Error,
    },
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandError::NotFound { program } => write!(f, "command not found: {program}"),
            CommandError::PermissionDenied { program, source } => {
                write!(f, "permission denied running {program}: {source}")
            }
            CommandError::Timeout { program, timeout } => {
                write!(f, "{program} timed out after {}s", timeout.as_secs())
            }
            CommandError::Cancelled { program } => write!(f, "{program} cancelled by shutdown"),
            CommandError::Io { program, source } => {
                write!(f, "failed to run {program}: {source}")
            }
        }
    }
}

impl std::error::Error for CommandError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CommandError::PermissionDenied { source, .. } => Some(source),
            CommandError::Io { source, .. } => Some(source),
            CommandError::NotFound { .. }
            | CommandError::Timeout { .. }
            | CommandError::Cancelled { .. } => None,
        }
    }
}

/// Run `program args...` to completion, bounded by `timeout` and by `shutdown`.
///
/// A non-zero exit is not an error here; callers inspect
/// [`CommandOutput::exit_code`] and classify the output themselves.
pub async fn run(
    program: impl AsRef<Path>,
    args: &[String],
    timeout: Duration,
    shutdown: &Shutdown,
) -> Result<CommandOutput, CommandError> {
    let program = program.as_ref();
    let name = program.display().to_string();
    if shutdown.is_triggered() {
        return Err(CommandError::Cancelled { program: name });
    }

    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => CommandError::NotFound {
                program: name.clone(),
            },
            std::io::ErrorKind::PermissionDenied => CommandError::PermissionDenied {
                program: name.clone(),
                source: e,
            },
            _ => CommandError::Io {
                program: name.clone(),
                source: e,
            },
        })?;

    // Dropping the wait future on timeout or stop drops the child, which kills it.
    let waited = tokio::select! {
        waited = tokio::time::timeout(timeout, child.wait_with_output()) => waited,
        _ = shutdown.triggered() => {
            tracing::debug!(program = %name, "command cancelled by shutdown");
            return Err(CommandError::Cancelled { program: name });
        }
    };
    let output = match waited {
        Ok(result) => result.map_err(|e| CommandError::Io {
            program: name.clone(),
            source: e,
        })?,
        Err(_) => {
            tracing::debug!(program = %name, timeout_secs = timeout.as_secs(), "command timed out");
            return Err(CommandError::Timeout {
                program: name,
                timeout,
            });
        }
    };

    Ok(CommandOutput {
        exit_code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Convenience for fixed argument lists.
pub fn args(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}
