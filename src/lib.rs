//! migrun Library
//!
//! A resumable, checkpointed step orchestration engine for privileged
//! migration procedures. A migration is a [`Catalog`] of steps; the
//! [`Orchestrator`] runs them in order, records each completed step in a
//! [`ProgressStore`] and resumes after the last recorded step on the next run.

pub mod catalog;
pub mod cli;
pub mod command_executor;
pub mod config;
pub mod confirmation;
pub mod credentials;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod process_guard;
pub mod progress_store;
pub mod run_lock;
pub mod run_state;
pub mod sanity;
pub mod scenarios;

// Re-export main types for convenience
pub use catalog::{Action, Catalog, ServiceManager, ServiceOperation, Step, StepId};
pub use command_executor::{CommandExecutor, CommandOutput, DryRunExecutor, LogSink, ProcessExecutor};
pub use config::RunnerConfig;
pub use confirmation::{AutoApprove, ConfirmationGate, Decision, PromptGate, ScriptedGate};
pub use credentials::{CredentialSource, Credentials, RemoteSession, Secret, SecretFile};
pub use error::{MigrationError, Result};
pub use orchestrator::{Orchestrator, RunContext, RunOutcome, RunPlan, RunReport};
pub use process_guard::{ChildRegistry, CommandProcessGroup, ProcessGuard};
pub use progress_store::{FileProgressStore, MemoryProgressStore, ProgressStore};
pub use run_lock::RunLock;
pub use run_state::{RunMachine, RunState, RunTransitionError};
pub use scenarios::Scenario;
