//! Pre-flight sanity checks for the runtime environment
//!
//! Before the first step runs we verify that:
//! - every program the remaining steps invoke is on `PATH`
//! - we are running with root privileges (EUID 0)
//!
//! A missing program is fatal: finding out at step 9 that `sshpass` is absent
//! leaves the source system with its services stopped. Not being root is only
//! a warning, since some catalogs run unprivileged commands.

use tracing::{debug, info, warn};

use crate::catalog::{Catalog, Step};
use crate::error::{MigrationError, Result};

/// Result of environment verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SanityCheckResult {
    pub missing_binaries: Vec<String>,
    pub is_root: bool,
}

impl SanityCheckResult {
    /// True if every required program was found
    pub fn is_ok(&self) -> bool {
        self.missing_binaries.is_empty()
    }
}

/// Check if a binary is available in PATH
fn binary_exists(name: &str) -> bool {
    which::which(name).is_ok()
}

/// Check if running as root (EUID 0)
fn is_running_as_root() -> bool {
    nix::unistd::geteuid().is_root()
}

/// Check the programs invoked by `steps`.
pub fn verify_environment(steps: &[Step]) -> SanityCheckResult {
    let missing_binaries = Catalog::programs(steps)
        .into_iter()
        .filter(|program| {
            let found = binary_exists(program);
            debug!(%program, found, "Pre-flight binary check");
            !found
        })
        .collect();

    SanityCheckResult {
        missing_binaries,
        is_root: is_running_as_root(),
    }
}

/// Verify the environment for `steps`.
///
/// # Errors
///
/// `Config` naming every missing program.
pub fn preflight(steps: &[Step]) -> Result<SanityCheckResult> {
    debug!(steps = steps.len(), "Running pre-flight sanity checks");
    let result = verify_environment(steps);

    if !result.is_root {
        warn!("Not running as root; privileged steps are likely to fail");
    }
    if !result.is_ok() {
        return Err(MigrationError::config(format!(
            "required programs not found on PATH: {} (use --skip-preflight to run anyway)",
            result.missing_binaries.join(", ")
        )));
    }

    info!(root = result.is_root, "Pre-flight checks passed");
    Ok(result)
}
