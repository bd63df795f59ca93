//! Raw command output → typed values.
//!
//! Every substring or pattern match against text printed by the agent CLI,
//! the service manager, or a process lister lives here. Callers only ever
//! see the enums these functions return.
use crate::model::{ProbeErrorKind, ServiceState};
use regex::Regex;
use std::sync::LazyLock;

static NOT_RUNNING_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"(?i)not running").unwrap(),
        Regex::new(r"(?i)not logged in").unwrap(),
        Regex::new(r"(?i)failed to connect to local tailscaled").unwrap(),
        Regex::new(r"(?i)is tailscaled running").unwrap(),
    ]
});

static PERMISSION_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"(?i)permission denied").unwrap(),
        Regex::new(r"(?i)access is denied").unwrap(),
        Regex::new(r"(?i)operation not permitted").unwrap(),
    ]
});

static ALREADY_AUTHENTICATED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)already (authenticated|logged in)").unwrap());
static KEY_EXPIRED: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)key expired").unwrap());
static INVALID_KEY: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)invalid key").unwrap());
static SERVICE_ALREADY_RUNNING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)already running|instance of the service is already running|\b1056\b").unwrap()
});
/// `sc` error 1060: the named service is not installed.
static SERVICE_DOES_NOT_EXIST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b1060\b|specified service does not exist").unwrap()
});

fn any_match(patterns: &[Regex], text: &str) -> bool {
    patterns.iter().any(|p| {
        let hit = p.is_match(text);
        if hit {
            tracing::debug!(pattern = %p, "output pattern matched");
        }
        hit
    })
}

/// Classify a failed (non-zero exit) status query by its stderr text.
pub fn classify_status_failure(stderr: &str) -> ProbeErrorKind {
    if any_match(&NOT_RUNNING_PATTERNS, stderr) {
        ProbeErrorKind::NotRunning
    } else if any_match(&PERMISSION_PATTERNS, stderr) {
        ProbeErrorKind::PermissionDenied
    } else {
        ProbeErrorKind::Exception
    }
}

/// Hint derived from a rejected authenticate command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    /// The agent is already authenticated; treated as success.
    AlreadyAuthenticated,
    /// The auth secret has expired. Retrying will not help.
    KeyExpired,
    /// The auth secret was rejected. Retrying will not help.
    InvalidKey,
    Other,
}

impl AuthFailure {
    pub fn is_retryable(self) -> bool {
        matches!(self, AuthFailure::Other)
    }
}

pub fn classify_auth_failure(output: &str) -> AuthFailure {
    if ALREADY_AUTHENTICATED.is_match(output) {
        AuthFailure::AlreadyAuthenticated
    } else if KEY_EXPIRED.is_match(output) {
        AuthFailure::KeyExpired
    } else if INVALID_KEY.is_match(output) {
        AuthFailure::InvalidKey
    } else {
        AuthFailure::Other
    }
}

/// True if a failed service start reported that the service was already up.
pub fn service_already_running(output: &str) -> bool {
    SERVICE_ALREADY_RUNNING.is_match(output)
}

/// True if the service manager reported that no such service is installed.
pub fn service_does_not_exist(output: &str) -> bool {
    SERVICE_DOES_NOT_EXIST.is_match(output)
}

/// Parse `systemctl show <unit> --property=LoadState,ActiveState`.
pub fn parse_systemd_show(stdout: &str) -> ServiceState {
    let mut load_state = None;
    let mut active_state = None;
    for line in stdout.lines() {
        if let Some((key, value)) = line.trim().split_once('=') {
            match key {
                "LoadState" => load_state = Some(value.trim()),
                "ActiveState" => active_state = Some(value.trim()),
                _ => {}
            }
        }
    }

    if matches!(load_state, Some("not-found")) {
        return ServiceState::NotFound;
    }

    match active_state {
        Some("active") | Some("reloading") => ServiceState::Running,
        Some("inactive") => ServiceState::Stopped,
        Some("activating") => ServiceState::Starting,
        Some("deactivating") => ServiceState::Stopping,
        Some("failed") => ServiceState::Error,
        _ => ServiceState::Unknown,
    }
}

/// Parse the `STATE` line of `sc query <service>`.
pub fn parse_sc_query(stdout: &str) -> ServiceState {
    let upper = stdout.to_uppercase();
    let upper = upper
        .lines()
        .find(|line| line.trim_start().starts_with("STATE"))
        .unwrap_or(&upper);
    if upper.contains("START_PENDING") {
        ServiceState::Starting
    } else if upper.contains("STOP_PENDING") {
        ServiceState::Stopping
    } else if upper.contains("RUNNING") {
        ServiceState::Running
    } else if upper.contains("STOPPED") {
        ServiceState::Stopped
    } else if upper.contains("PAUSED") {
        ServiceState::Paused
    } else {
        ServiceState::Unknown
    }
}

/// Parse the single-word status printed by PowerShell `Get-Service`.
pub fn parse_powershell_status(stdout: &str) -> ServiceState {
    match stdout.trim().to_uppercase().as_str() {
        "RUNNING" => ServiceState::Running,
        "STOPPED" => ServiceState::Stopped,
        "STARTPENDING" => ServiceState::Starting,
        "STOPPENDING" => ServiceState::Stopping,
        "PAUSED" => ServiceState::Paused,
        "" => ServiceState::NotFound,
        _ => ServiceState::Unknown,
    }
}

/// Normalize a process name for comparison: lowercase, no `.exe` suffix.
pub fn normalize_process_name(name: &str) -> String {
    let lower = name.trim().to_lowercase();
    match lower.strip_suffix(".exe") {
        Some(stripped) => stripped.to_string(),
        None => lower,
    }
}

/// Exact match of a native process name against a known name.
pub fn process_name_matches(process: &str, known: &str) -> bool {
    normalize_process_name(process) == normalize_process_name(known)
}

/// Substring match of a raw process-listing line against a known name.
///
/// Used when only a textual process list is available (`ps`, `tasklist`).
pub fn process_line_mentions(line: &str, known: &str) -> bool {
    line.to_lowercase()
        .contains(&normalize_process_name(known))
}
