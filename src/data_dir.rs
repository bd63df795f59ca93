use std::path::{Path, PathBuf};

/// Manages the supervisor's data directory layout.
///
/// Everything the supervisor persists lives under one root (default
/// `/var/lib/tailguard`): the operational config, its lock file, and the
/// status file written by the monitor loop.
#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    /// Create a new DataDir referencing the given root path.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path to the persisted operational config.
    pub fn config(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    /// Path to the advisory lock serializing config readers and writers.
    pub fn config_lock(&self) -> PathBuf {
        self.root.join("config.lock")
    }

    /// Path to the status file.
    pub fn status(&self) -> PathBuf {
        self.root.join("status.json")
    }

    /// Default directory for rotated log files.
    pub fn logs(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// Create the root directory if needed.
    /// Returns Ok(true) if it was created, Ok(false) if it already existed.
    pub fn init(&self) -> std::io::Result<bool> {
        let created = !self.root.exists();
        std::fs::create_dir_all(&self.root)?;

        #[cfg(unix)]
        if created {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.root, std::fs::Permissions::from_mode(0o700))?;
        }

        Ok(created)
    }
}
