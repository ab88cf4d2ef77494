//! Error handling module for migrun
//!
//! Every failure the engine can surface is a `MigrationError` variant. Components
//! return these through `Result` and never terminate the process themselves; the
//! binary maps the final error to an exit code via [`MigrationError::exit_code`].

use std::path::PathBuf;

use thiserror::Error;

use crate::catalog::StepId;

/// Exit code for a run that completed every step.
pub const EXIT_SUCCESS: u8 = 0;
/// Exit code for a step whose command failed, timed out or could not be spawned.
pub const EXIT_STEP_FAILED: u8 = 1;
/// Exit code for invalid configuration, catalogs or failed pre-flight checks.
pub const EXIT_INVALID_INPUT: u8 = 2;
/// Exit code for an operator cancellation at a confirmation prompt.
pub const EXIT_CANCELLED: u8 = 3;
/// Exit code for an unreadable progress record.
pub const EXIT_STORE_CORRUPT: u8 = 4;
/// Exit code for a progress record that could not be written after a step succeeded.
pub const EXIT_STORE_UNWRITABLE: u8 = 5;
/// Exit code when another run already holds the progress store.
pub const EXIT_CONCURRENT_RUN: u8 = 6;
/// Exit code for a run aborted by SIGINT (128 + 2).
pub const EXIT_INTERRUPTED: u8 = 130;

/// Main error type for the migration engine
#[derive(Error, Debug)]
pub enum MigrationError {
    /// An external command exited with a non-zero status
    #[error("Command failed (exit code {}): {}\n{}", .exit_code.map_or_else(|| "signal".to_string(), |c| c.to_string()), .argv.join(" "), .stderr.trim())]
    CommandFailed {
        argv: Vec<String>,
        exit_code: Option<i32>,
        stderr: String,
    },

    /// An external command outlived the configured timeout and was killed
    #[error("Command timed out after {secs}s: {}", .argv.join(" "))]
    CommandTimedOut { argv: Vec<String>, secs: u64 },

    /// The run received a signal; `argv` names the command it stopped, if any
    #[error("Interrupted by signal{}", running_suffix(.argv))]
    Interrupted { argv: Vec<String> },

    /// The program could not be started at all (not found, not executable, ...)
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// A step's action failed; wraps the underlying cause with the step context
    #[error("Step {step} ({name}) failed: {source}")]
    StepFailed {
        step: StepId,
        name: String,
        #[source]
        source: Box<MigrationError>,
    },

    /// The progress record exists but cannot be read or parsed
    #[error("Progress record {} is corrupt: {reason} (refusing to guess a resume point)", .path.display())]
    StoreCorrupt { path: PathBuf, reason: String },

    /// The step ran but its completion could not be recorded
    #[error("Step {step} completed but progress could not be written to {}: {reason} (the step WILL re-run on next invocation)", .path.display())]
    StoreUnwritable {
        step: StepId,
        path: PathBuf,
        reason: String,
    },

    /// Another orchestrator holds the run lock for this progress store
    #[error("Another migration run is already in progress (lock {} held{})", .lock_path.display(), .holder.map(|p| format!(" by PID {p}")).unwrap_or_default())]
    ConcurrentRunDetected {
        lock_path: PathBuf,
        holder: Option<u32>,
    },

    /// The lock file itself could not be created or opened
    #[error("Cannot acquire run lock {}: {reason}", .lock_path.display())]
    LockUnavailable { lock_path: PathBuf, reason: String },

    /// The step catalog is malformed
    #[error("Invalid step catalog: {0}")]
    InvalidCatalog(String),

    /// Configuration errors (loading, parsing, validation)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Credentials could not be obtained from the operator
    #[error("Credential error: {0}")]
    Credentials(String),

    /// The confirmation prompt could not be read or written
    #[error("Confirmation prompt failed: {0}")]
    Confirmation(#[source] std::io::Error),

    /// Illegal run-state transition (orchestrator bug)
    #[error("Run state error: {0}")]
    State(String),

    /// IO errors not covered by a more specific variant
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn running_suffix(argv: &[String]) -> String {
    if argv.is_empty() {
        String::new()
    } else {
        format!(" while running: {}", argv.join(" "))
    }
}

/// Result type alias for migration operations
pub type Result<T> = std::result::Result<T, MigrationError>;

impl MigrationError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a catalog validation error
    pub fn invalid_catalog(msg: impl Into<String>) -> Self {
        Self::InvalidCatalog(msg.into())
    }

    /// Create a credential error
    pub fn credentials(msg: impl Into<String>) -> Self {
        Self::Credentials(msg.into())
    }

    /// Create a state error
    pub fn state(msg: impl Into<String>) -> Self {
        Self::State(msg.into())
    }

    /// Wrap an action error with the step it belongs to
    pub fn in_step(self, step: StepId, name: impl Into<String>) -> Self {
        Self::StepFailed {
            step,
            name: name.into(),
            source: Box::new(self),
        }
    }

    /// The step a failure belongs to, if any
    pub fn step(&self) -> Option<StepId> {
        match self {
            Self::StepFailed { step, .. } | Self::StoreUnwritable { step, .. } => Some(*step),
            _ => None,
        }
    }

    /// The innermost error, looking through `StepFailed` wrappers
    pub fn root(&self) -> &MigrationError {
        match self {
            Self::StepFailed { source, .. } => source.root(),
            other => other,
        }
    }

    /// Process exit code for this error.
    ///
    /// Each fault class gets its own code so wrappers and operators can tell a
    /// failed command apart from a corrupt or unwritable progress record.
    pub fn exit_code(&self) -> u8 {
        match self.root() {
            Self::CommandFailed { .. } | Self::CommandTimedOut { .. } | Self::Spawn { .. } => {
                EXIT_STEP_FAILED
            }
            Self::Interrupted { .. } => EXIT_INTERRUPTED,
            Self::StoreCorrupt { .. } => EXIT_STORE_CORRUPT,
            Self::StoreUnwritable { .. } => EXIT_STORE_UNWRITABLE,
            Self::ConcurrentRunDetected { .. } => EXIT_CONCURRENT_RUN,
            Self::InvalidCatalog(_) | Self::Config(_) => EXIT_INVALID_INPUT,
            Self::StepFailed { .. } => EXIT_STEP_FAILED,
            Self::LockUnavailable { .. }
            | Self::Credentials(_)
            | Self::Confirmation(_)
            | Self::State(_)
            | Self::Io(_)
            | Self::Json(_) => EXIT_STEP_FAILED,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command_failed() -> MigrationError {
        MigrationError::CommandFailed {
            argv: vec!["pg_dump".into(), "-Fc".into()],
            exit_code: Some(2),
            stderr: "connection refused\n".into(),
        }
    }

    #[test]
    fn test_command_failed_display_includes_argv_and_stderr() {
        let msg = command_failed().to_string();
        assert!(msg.contains("exit code 2"));
        assert!(msg.contains("pg_dump -Fc"));
        assert!(msg.contains("connection refused"));
    }

    #[test]
    fn test_signal_exit_is_reported() {
        let err = MigrationError::CommandFailed {
            argv: vec!["sleep".into()],
            exit_code: None,
            stderr: String::new(),
        };
        assert!(err.to_string().contains("exit code signal"));
    }

    #[test]
    fn test_step_context_wraps_cause() {
        let err = command_failed().in_step(7, "Create backup");
        assert_eq!(err.step(), Some(7));
        assert!(matches!(err.root(), MigrationError::CommandFailed { .. }));
        let msg = err.to_string();
        assert!(msg.starts_with("Step 7 (Create backup) failed"));
    }

    #[test]
    fn test_exit_codes_are_distinct_per_fault_class() {
        let corrupt = MigrationError::StoreCorrupt {
            path: "p".into(),
            reason: "bad".into(),
        };
        let unwritable = MigrationError::StoreUnwritable {
            step: 1,
            path: "p".into(),
            reason: "ro".into(),
        };
        let concurrent = MigrationError::ConcurrentRunDetected {
            lock_path: "p.lock".into(),
            holder: Some(42),
        };

        assert_eq!(command_failed().in_step(1, "x").exit_code(), EXIT_STEP_FAILED);
        assert_eq!(corrupt.exit_code(), EXIT_STORE_CORRUPT);
        assert_eq!(unwritable.exit_code(), EXIT_STORE_UNWRITABLE);
        assert_eq!(concurrent.exit_code(), EXIT_CONCURRENT_RUN);
        assert_eq!(MigrationError::config("x").exit_code(), EXIT_INVALID_INPUT);
        assert_eq!(
            MigrationError::Interrupted { argv: vec![] }
                .in_step(2, "y")
                .exit_code(),
            EXIT_INTERRUPTED
        );
    }

    #[test]
    fn test_concurrent_run_names_holder() {
        let err = MigrationError::ConcurrentRunDetected {
            lock_path: "/tmp/progress.lock".into(),
            holder: Some(4242),
        };
        assert!(err.to_string().contains("PID 4242"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: MigrationError = io_err.into();
        assert!(matches!(err, MigrationError::Io(_)));
    }
}
