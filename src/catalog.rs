//! Step catalog: the ordered, immutable list of steps for one migration scenario.
//!
//! A catalog is pure configuration. It is built in Rust (see `scenarios`) or
//! loaded from a JSON file, validated once, and never mutated while a run is
//! in progress.
//!
//! # Catalog Format
//!
//! ```json
//! {
//!   "name": "example",
//!   "steps": [
//!     { "id": 1, "name": "Check version", "actions": [ { "type": "command", "argv": ["psql", "-V"] } ] },
//!     { "id": 3, "name": "Transfer dump", "confirmation": "Transfer the dump? (Y/n/c)",
//!       "actions": [ { "type": "transfer", "source": "/opt/dump.tar", "destination": "/opt/in/dump.tar" } ],
//!       "terminal": true }
//!   ]
//! }
//! ```
//!
//! Step ids must be strictly increasing but need not be contiguous.
//!
//! # Idempotency Contract
//!
//! A step is the unit of progress. If any action of a step fails, the whole
//! step re-runs on resume, including actions that already succeeded. Catalog
//! authors must therefore make every action safe to repeat (overwrite-style
//! transfers, `mkdir -p`, stop/start of already stopped/started services).

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::error::{MigrationError, Result};

/// Identifier of a step; ordinal, unique within a catalog.
pub type StepId = u32;

/// Placeholder replaced with the run's start date (`%Y_%m_%d`).
pub const DATE_PLACEHOLDER: &str = "{date}";

/// Whether a service is being started or stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ServiceOperation {
    Start,
    Stop,
}

/// Tool used to start/stop services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ServiceManager {
    /// `systemctl <op> <service>`
    #[default]
    Systemctl,
    /// `service <service> <op>`
    Service,
}

/// Name of the SecureTrack application service, which has its own control CLI.
const ST_SERVICE: &str = "st";

/// One side effect of a step, described as data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    /// Run one argument vector.
    Command { argv: Vec<String> },

    /// Copy `source` to `destination` on the remote host with rsync over ssh.
    ///
    /// Requires the run's credential context.
    Transfer { source: String, destination: String },

    /// Start or stop each service in order, one invocation per service.
    Services {
        operation: ServiceOperation,
        services: Vec<String>,
        #[serde(default)]
        manager: ServiceManager,
    },

    /// Run `argv`; when its stdout does not match `expect`, ask `prompt` and
    /// run `remedy` if the operator proceeds.
    ///
    /// With `exact`, the trimmed stdout must equal `expect`; otherwise it only
    /// has to contain it.
    Check {
        argv: Vec<String>,
        expect: String,
        #[serde(default)]
        exact: bool,
        prompt: String,
        remedy: Vec<String>,
    },
}

impl Action {
    /// Shorthand for a single command action.
    pub fn command<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Command {
            argv: argv.into_iter().map(Into::into).collect(),
        }
    }

    /// Shorthand for a remote transfer action.
    pub fn transfer(source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self::Transfer {
            source: source.into(),
            destination: destination.into(),
        }
    }

    /// Shorthand for a systemctl-managed service action.
    pub fn services<I, S>(operation: ServiceOperation, services: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Services {
            operation,
            services: services.into_iter().map(Into::into).collect(),
            manager: ServiceManager::Systemctl,
        }
    }

    /// Whether this action needs the remote credential context.
    pub fn needs_credentials(&self) -> bool {
        matches!(self, Self::Transfer { .. })
    }

    /// Programs this action will invoke (used by pre-flight checks).
    pub fn programs(&self) -> Vec<String> {
        match self {
            Self::Command { argv } => argv.first().cloned().into_iter().collect(),
            Self::Transfer { .. } => vec!["rsync".into(), "sshpass".into(), "ssh".into()],
            Self::Services {
                services, manager, ..
            } => {
                let mut programs = Vec::new();
                if services.iter().any(|s| s == ST_SERVICE) {
                    programs.push(ST_SERVICE.to_string());
                }
                if services.iter().any(|s| s != ST_SERVICE) {
                    programs.push(manager.to_string());
                }
                programs
            }
            Self::Check { argv, remedy, .. } => argv
                .first()
                .into_iter()
                .chain(remedy.first())
                .cloned()
                .collect(),
        }
    }

    /// Whether `stdout` satisfies a `Check` action; `true` for other actions.
    pub fn check_passes(&self, stdout: &str) -> bool {
        match self {
            Self::Check {
                expect,
                exact: true,
                ..
            } => stdout.trim() == expect.as_str(),
            Self::Check { expect, .. } => stdout.contains(expect.as_str()),
            _ => true,
        }
    }

    fn validate(&self, step: StepId) -> Result<()> {
        let blank = |argv: &[String]| argv.first().is_none_or(|p| p.trim().is_empty());
        let bad = |what: &str| {
            Err(MigrationError::invalid_catalog(format!(
                "step {step}: {what}"
            )))
        };
        match self {
            Self::Command { argv } if blank(argv) => {
                bad("command action has an empty argv")
            }
            Self::Transfer {
                source,
                destination,
            } if source.trim().is_empty() || destination.trim().is_empty() => {
                bad("transfer action needs both source and destination")
            }
            Self::Services { services, .. } if services.is_empty() => {
                bad("services action lists no services")
            }
            Self::Services { services, .. } if services.iter().any(|s| s.trim().is_empty()) => {
                bad("services action contains an empty service name")
            }
            Self::Check { argv, remedy, .. } if blank(argv) || blank(remedy) => {
                bad("check action needs a program in both argv and remedy")
            }
            _ => Ok(()),
        }
    }
}

/// Argument vector for starting/stopping one service.
pub fn service_argv(manager: ServiceManager, operation: ServiceOperation, service: &str) -> Vec<String> {
    if service == ST_SERVICE {
        let verb = match operation {
            ServiceOperation::Start => "start",
            ServiceOperation::Stop => "shutdown",
        };
        return vec![ST_SERVICE.to_string(), verb.to_string()];
    }
    match manager {
        ServiceManager::Systemctl => vec![
            "systemctl".to_string(),
            operation.to_string(),
            service.to_string(),
        ],
        ServiceManager::Service => vec![
            "service".to_string(),
            service.to_string(),
            operation.to_string(),
        ],
    }
}

/// Replace `{date}` in every argument.
pub fn expand_args(argv: &[String], date: &str) -> Vec<String> {
    argv.iter()
        .map(|arg| arg.replace(DATE_PLACEHOLDER, date))
        .collect()
}

/// The unit of work and of progress tracking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    pub name: String,
    pub actions: Vec<Action>,
    /// Prompt shown before the step runs; `None` means no confirmation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmation: Option<String>,
    /// Completing this step ends the run.
    #[serde(default)]
    pub terminal: bool,
}

impl Step {
    pub fn new(id: StepId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            actions: Vec::new(),
            confirmation: None,
            terminal: false,
        }
    }

    /// Append an action (builder style).
    pub fn action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    /// Require operator confirmation before running.
    pub fn confirm(mut self, prompt: impl Into<String>) -> Self {
        self.confirmation = Some(prompt.into());
        self
    }

    /// Mark as the terminal step.
    pub fn terminal(mut self) -> Self {
        self.terminal = true;
        self
    }

    #[inline]
    pub fn requires_confirmation(&self) -> bool {
        self.confirmation.is_some()
    }

    pub fn needs_credentials(&self) -> bool {
        self.actions.iter().any(Action::needs_credentials)
    }
}

/// A validated, ordered list of steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawCatalog")]
pub struct Catalog {
    name: String,
    steps: Vec<Step>,
}

#[derive(Deserialize)]
struct RawCatalog {
    name: String,
    steps: Vec<Step>,
}

impl TryFrom<RawCatalog> for Catalog {
    type Error = MigrationError;

    fn try_from(raw: RawCatalog) -> Result<Self> {
        Catalog::new(raw.name, raw.steps)
    }
}

impl Catalog {
    /// Build a catalog, rejecting malformed step lists.
    pub fn new(name: impl Into<String>, steps: Vec<Step>) -> Result<Self> {
        let catalog = Self {
            name: name.into(),
            steps,
        };
        catalog.validate()?;
        Ok(catalog)
    }

    /// Load and validate a JSON catalog file.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            MigrationError::invalid_catalog(format!("cannot read {}: {e}", path.display()))
        })?;
        serde_json::from_str(&content)
            .map_err(|e| MigrationError::invalid_catalog(format!("{}: {e}", path.display())))
    }

    /// Parse and validate a JSON catalog.
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| MigrationError::invalid_catalog(e.to_string()))
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(MigrationError::invalid_catalog("catalog name is empty"));
        }
        if self.steps.is_empty() {
            return Err(MigrationError::invalid_catalog(format!(
                "catalog '{}' has no steps",
                self.name
            )));
        }

        for pair in self.steps.windows(2) {
            if pair[1].id <= pair[0].id {
                return Err(MigrationError::invalid_catalog(format!(
                    "step ids must be strictly increasing: {} follows {}",
                    pair[1].id, pair[0].id
                )));
            }
        }

        let last = self.steps.len() - 1;
        for (index, step) in self.steps.iter().enumerate() {
            if step.actions.is_empty() {
                return Err(MigrationError::invalid_catalog(format!(
                    "step {} has no actions",
                    step.id
                )));
            }
            if step.terminal && index != last {
                return Err(MigrationError::invalid_catalog(format!(
                    "step {} is terminal but is not the last step",
                    step.id
                )));
            }
            if matches!(&step.confirmation, Some(p) if p.trim().is_empty()) {
                return Err(MigrationError::invalid_catalog(format!(
                    "step {} has an empty confirmation prompt",
                    step.id
                )));
            }
            for action in &step.actions {
                action.validate(step.id)?;
            }
        }

        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn get(&self, id: StepId) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn first_id(&self) -> StepId {
        self.steps[0].id
    }

    pub fn last_id(&self) -> StepId {
        self.steps[self.steps.len() - 1].id
    }

    /// Steps that still have to run given the last completed step.
    ///
    /// Everything with an id at or below `last_completed` is skipped, even if
    /// the catalog changed since that id was recorded.
    pub fn remaining(&self, last_completed: Option<StepId>) -> &[Step] {
        match last_completed {
            None => &self.steps,
            Some(done) => {
                let start = self.steps.partition_point(|s| s.id <= done);
                &self.steps[start..]
            }
        }
    }

    /// Programs invoked anywhere in the given steps, deduplicated in order.
    pub fn programs(steps: &[Step]) -> Vec<String> {
        let mut programs: Vec<String> = Vec::new();
        for program in steps.iter().flat_map(|s| &s.actions).flat_map(Action::programs) {
            if !programs.contains(&program) {
                programs.push(program);
            }
        }
        programs
    }
}
