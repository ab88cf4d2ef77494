//! Confirmation Gate
//!
//! Blocks the run until the operator explicitly decides whether to continue.
//!
//! | Input (trimmed, case-insensitive) | Decision  |
//! |-----------------------------------|-----------|
//! | `""`, `y`, `yes`                  | Proceed   |
//! | `n`, `no`                         | Cancel    |
//! | `c`, `cancel`                     | Cancel    |
//! | end of input                      | Cancel    |
//! | anything else                     | re-prompt |
//!
//! The gate never defaults on unrecognized input; it asks again in a loop
//! until it gets an answer it understands.

use std::collections::VecDeque;
use std::io::{self, BufRead, BufReader, Write};

use tracing::{info, warn};

use crate::error::{MigrationError, Result};

/// Operator's answer to a confirmation prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Continue with the gated step.
    Proceed,
    /// End the run here without recording the gated step.
    Cancel,
}

/// Hint appended to the re-prompt warning.
pub const RESPONSE_HINT: &str =
    "Please enter 'Y' or press Enter to continue, 'N' or 'C' to cancel.";

/// Map one line of operator input to a decision, `None` if unrecognized.
pub fn parse_response(input: &str) -> Option<Decision> {
    match input.trim().to_lowercase().as_str() {
        "" | "y" | "yes" => Some(Decision::Proceed),
        "n" | "no" | "c" | "cancel" => Some(Decision::Cancel),
        _ => None,
    }
}

/// Synchronous operator approval checkpoint.
pub trait ConfirmationGate {
    fn confirm(&mut self, prompt: &str) -> Result<Decision>;
}

/// Line-oriented gate over any reader/writer pair.
pub struct PromptGate<R, W> {
    input: R,
    output: W,
}

impl PromptGate<BufReader<io::Stdin>, io::Stderr> {
    /// Gate reading stdin and prompting on stderr.
    ///
    /// Stdin is not locked between prompts and never read past the answer's
    /// newline, so credential prompts can share it.
    pub fn stdio() -> Self {
        Self::new(BufReader::with_capacity(1, io::stdin()), io::stderr())
    }
}

impl<R: BufRead, W: Write> PromptGate<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }

    /// Recover the output sink (tests inspect what was printed).
    pub fn into_output(self) -> W {
        self.output
    }
}

impl<R: BufRead, W: Write> ConfirmationGate for PromptGate<R, W> {
    fn confirm(&mut self, prompt: &str) -> Result<Decision> {
        loop {
            write!(self.output, "{prompt} ")
                .and_then(|()| self.output.flush())
                .map_err(MigrationError::Confirmation)?;

            let mut line = String::new();
            let read = self
                .input
                .read_line(&mut line)
                .map_err(MigrationError::Confirmation)?;
            if read == 0 {
                info!("Input closed at confirmation prompt, treating as cancel");
                return Ok(Decision::Cancel);
            }

            match parse_response(&line) {
                Some(decision) => return Ok(decision),
                None => {
                    warn!(response = %line.trim(), "Invalid response");
                    writeln!(self.output, "Invalid response. {RESPONSE_HINT}")
                        .map_err(MigrationError::Confirmation)?;
                }
            }
        }
    }
}

/// Approves every prompt (`--yes`).
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoApprove;

impl ConfirmationGate for AutoApprove {
    fn confirm(&mut self, prompt: &str) -> Result<Decision> {
        info!(prompt, "Auto-approved");
        Ok(Decision::Proceed)
    }
}

/// Replays queued raw responses through [`parse_response`], re-prompting on
/// unrecognized ones exactly like [`PromptGate`]. Runs out → Cancel.
#[derive(Debug, Default, Clone)]
pub struct ScriptedGate {
    responses: VecDeque<String>,
    prompts: Vec<String>,
}

impl ScriptedGate {
    pub fn new<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            responses: responses.into_iter().map(Into::into).collect(),
            prompts: Vec::new(),
        }
    }

    /// Every prompt shown, including re-prompts.
    pub fn prompts(&self) -> &[String] {
        &self.prompts
    }

    pub fn remaining(&self) -> usize {
        self.responses.len()
    }
}

impl ConfirmationGate for ScriptedGate {
    fn confirm(&mut self, prompt: &str) -> Result<Decision> {
        loop {
            self.prompts.push(prompt.to_string());
            let Some(response) = self.responses.pop_front() else {
                return Ok(Decision::Cancel);
            };
            if let Some(decision) = parse_response(&response) {
                return Ok(decision);
            }
        }
    }
}
