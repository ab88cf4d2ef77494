//! Runner configuration.
//!
//! Loaded from an optional JSON file (`--config`), then overridden by
//! command-line flags. Every field has a default, so an empty object `{}` is a
//! valid configuration.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MigrationError, Result};

/// Default progress record, relative to the working directory.
pub const DEFAULT_PROGRESS_FILE: &str = "migration_save_progress";
/// Default log sink for command output.
pub const DEFAULT_LOG_FILE: &str = "/opt/script_migration/migration_logfile.log";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunnerConfig {
    /// Where the last completed step is recorded
    pub progress_file: PathBuf,
    /// Append-only log receiving the stdout of every successful command
    pub log_file: PathBuf,
    /// Kill commands running longer than this; unbounded when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_timeout_secs: Option<u64>,
    /// Remote host for transfer steps; prompted for when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_host: Option<String>,
    /// Remote user for transfer steps; defaults to the invoking user
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_user: Option<String>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            progress_file: PathBuf::from(DEFAULT_PROGRESS_FILE),
            log_file: PathBuf::from(DEFAULT_LOG_FILE),
            command_timeout_secs: None,
            remote_host: None,
            remote_user: None,
        }
    }
}

/// Values given on the command line; `None` keeps the configured value.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub progress_file: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
    pub command_timeout_secs: Option<u64>,
    pub remote_host: Option<String>,
    pub remote_user: Option<String>,
}

impl RunnerConfig {
    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            MigrationError::config(format!("cannot read {}: {e}", path.display()))
        })?;
        serde_json::from_str(&content)
            .map_err(|e| MigrationError::config(format!("{}: {e}", path.display())))
    }

    /// Load `path` if given, else defaults; apply overrides; validate.
    pub fn resolve(path: Option<&Path>, overrides: ConfigOverrides) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load_from_file(path)?,
            None => Self::default(),
        };
        config.apply(overrides);
        config.validate()?;
        Ok(config)
    }

    pub fn apply(&mut self, overrides: ConfigOverrides) {
        if let Some(path) = overrides.progress_file {
            self.progress_file = path;
        }
        if let Some(path) = overrides.log_file {
            self.log_file = path;
        }
        if overrides.command_timeout_secs.is_some() {
            self.command_timeout_secs = overrides.command_timeout_secs;
        }
        if overrides.remote_host.is_some() {
            self.remote_host = overrides.remote_host;
        }
        if overrides.remote_user.is_some() {
            self.remote_user = overrides.remote_user;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.progress_file.as_os_str().is_empty() {
            return Err(MigrationError::config("progress_file must not be empty"));
        }
        if self.log_file.as_os_str().is_empty() {
            return Err(MigrationError::config("log_file must not be empty"));
        }
        if self.command_timeout_secs == Some(0) {
            return Err(MigrationError::config(
                "command_timeout_secs must be positive (omit it for no timeout)",
            ));
        }
        if let Some(host) = &self.remote_host {
            if host.trim().is_empty() || host.contains(char::is_whitespace) {
                return Err(MigrationError::config(format!("invalid remote_host '{host}'")));
            }
        }
        Ok(())
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout_secs.map(Duration::from_secs)
    }
}
