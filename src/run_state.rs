//! Run State Machine
//!
//! Authoritative record of where the current run is. The orchestrator drives it;
//! the machine rejects transitions that would let a run skip, repeat or resume
//! past a step out of order.
//!
//! # State Flow
//!
//! ```text
//! NotStarted ──┐
//!              ├──> Running(s) ──> StepSucceeded(s) ──> Running(t > s) ...
//! Resuming(k) ─┘        │                 │
//!                       │                 └──> Completed
//!                       ├──> StepFailed(s)
//!                       └──> Cancelled(s)
//!
//! NotStarted / Resuming(k) ──> Completed   (nothing left to run)
//! ```
//!
//! `Completed`, `StepFailed` and `Cancelled` are terminal.

use std::fmt;

use thiserror::Error;

use crate::catalog::StepId;
use crate::error::MigrationError;

/// Where a run currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunState {
    /// No step has ever completed; the run starts at the first step
    NotStarted,
    /// Progress was found; the run starts after this step id
    Resuming { after: StepId },
    /// Step is executing (confirmation and actions)
    Running { step: StepId },
    /// Step finished and its id has been persisted
    StepSucceeded { step: StepId },
    /// Step failed; the run aborted (terminal)
    StepFailed { step: StepId },
    /// Operator cancelled at this step's confirmation (terminal)
    Cancelled { step: StepId },
    /// Every step is done (terminal)
    Completed,
}

impl RunState {
    #[inline]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::StepFailed { .. } | Self::Cancelled { .. }
        )
    }

    /// The step this state refers to, if any
    pub const fn step(self) -> Option<StepId> {
        match self {
            Self::Running { step }
            | Self::StepSucceeded { step }
            | Self::StepFailed { step }
            | Self::Cancelled { step } => Some(step),
            Self::Resuming { after } => Some(after),
            Self::NotStarted | Self::Completed => None,
        }
    }

    /// Highest step id known to be complete when in this state
    const fn completed_floor(self) -> Option<StepId> {
        match self {
            Self::Resuming { after } => Some(after),
            Self::StepSucceeded { step } => Some(step),
            _ => None,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not started"),
            Self::Resuming { after } => write!(f, "resuming after step {after}"),
            Self::Running { step } => write!(f, "running step {step}"),
            Self::StepSucceeded { step } => write!(f, "step {step} succeeded"),
            Self::StepFailed { step } => write!(f, "step {step} failed"),
            Self::Cancelled { step } => write!(f, "cancelled at step {step}"),
            Self::Completed => write!(f, "completed"),
        }
    }
}

/// Errors that can occur during state transitions
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RunTransitionError {
    /// Attempted to leave a terminal state
    #[error("Cannot transition from terminal state ({from})")]
    FromTerminalState { from: RunState },

    /// Attempted to start a step that is not after the completed ones
    #[error("Cannot run step {step} after {from} (steps only move forward)")]
    BackwardStep { from: RunState, step: StepId },

    /// Transition not allowed from the current state
    #[error("Invalid transition from {from} to {to}")]
    Invalid { from: RunState, to: RunState },
}

impl From<RunTransitionError> for MigrationError {
    fn from(err: RunTransitionError) -> Self {
        MigrationError::state(err.to_string())
    }
}

/// Validated state holder with transition history.
#[derive(Debug, Clone)]
pub struct RunMachine {
    current: RunState,
    /// (state, unix timestamp) for every state entered, starting state included
    history: Vec<(RunState, u64)>,
}

impl RunMachine {
    /// Initial state from the persisted last completed step.
    pub fn start(last_completed: Option<StepId>) -> Self {
        let initial = match last_completed {
            None => RunState::NotStarted,
            Some(after) => RunState::Resuming { after },
        };
        let mut machine = Self {
            current: initial,
            history: Vec::new(),
        };
        machine.record(initial);
        machine
    }

    #[inline]
    pub fn current(&self) -> RunState {
        self.current
    }

    pub fn history(&self) -> &[(RunState, u64)] {
        &self.history
    }

    pub fn is_terminal(&self) -> bool {
        self.current.is_terminal()
    }

    /// Begin running `step`.
    pub fn begin(&mut self, step: StepId) -> Result<RunState, RunTransitionError> {
        let to = RunState::Running { step };
        match self.current {
            s if s.is_terminal() => Err(RunTransitionError::FromTerminalState { from: s }),
            RunState::NotStarted => self.enter(to),
            s @ (RunState::Resuming { .. } | RunState::StepSucceeded { .. }) => {
                match s.completed_floor() {
                    Some(floor) if step <= floor => {
                        Err(RunTransitionError::BackwardStep { from: s, step })
                    }
                    _ => self.enter(to),
                }
            }
            from => Err(RunTransitionError::Invalid { from, to }),
        }
    }

    /// The running step finished and was persisted.
    pub fn succeed(&mut self) -> Result<RunState, RunTransitionError> {
        let step = self.running_step(|step| RunState::StepSucceeded { step })?;
        self.enter(RunState::StepSucceeded { step })
    }

    /// The running step failed.
    pub fn fail(&mut self) -> Result<RunState, RunTransitionError> {
        let step = self.running_step(|step| RunState::StepFailed { step })?;
        self.enter(RunState::StepFailed { step })
    }

    /// The operator cancelled the running step.
    pub fn cancel(&mut self) -> Result<RunState, RunTransitionError> {
        let step = self.running_step(|step| RunState::Cancelled { step })?;
        self.enter(RunState::Cancelled { step })
    }

    /// No more steps to run.
    pub fn complete(&mut self) -> Result<RunState, RunTransitionError> {
        match self.current {
            RunState::NotStarted | RunState::Resuming { .. } | RunState::StepSucceeded { .. } => {
                self.enter(RunState::Completed)
            }
            s if s.is_terminal() => Err(RunTransitionError::FromTerminalState { from: s }),
            from => Err(RunTransitionError::Invalid {
                from,
                to: RunState::Completed,
            }),
        }
    }

    fn running_step(
        &self,
        target: impl Fn(StepId) -> RunState,
    ) -> Result<StepId, RunTransitionError> {
        match self.current {
            RunState::Running { step } => Ok(step),
            s if s.is_terminal() => Err(RunTransitionError::FromTerminalState { from: s }),
            from => Err(RunTransitionError::Invalid {
                from,
                to: target(from.step().unwrap_or_default()),
            }),
        }
    }

    fn enter(&mut self, state: RunState) -> Result<RunState, RunTransitionError> {
        self.current = state;
        self.record(state);
        Ok(state)
    }

    fn record(&mut self, state: RunState) {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        self.history.push((state, timestamp));
    }
}
