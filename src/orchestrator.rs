//! Step Sequencer
//!
//! Drives a [`Catalog`] from the persisted resume point to completion:
//!
//! 1. load the last completed step from the progress store
//! 2. for every later step, ask for confirmation if the step requires it
//! 3. run the step's actions in order through the executor
//! 4. record the step as completed, then move on
//!
//! A failed action aborts the run with the store untouched, so the same step
//! runs again on the next invocation. A cancelled confirmation ends the run the
//! same way, but as a normal outcome rather than an error.

use tracing::{debug, error, info, warn};

use crate::catalog::{self, Action, Catalog, Step, StepId};
use crate::command_executor::{CommandExecutor, CommandOutput};
use crate::confirmation::{ConfirmationGate, Decision};
use crate::credentials::{CredentialSource, RemoteSession};
use crate::error::{MigrationError, Result};
use crate::process_guard;
use crate::progress_store::ProgressStore;
use crate::run_state::{RunMachine, RunState};

/// Everything a run talks to. Owned by the caller, borrowed for one run.
pub struct RunContext<'a> {
    pub executor: &'a mut dyn CommandExecutor,
    pub gate: &'a mut dyn ConfirmationGate,
    pub store: &'a mut dyn ProgressStore,
    pub credentials: &'a mut dyn CredentialSource,
    /// Value substituted for `{date}` (fixed for the whole run)
    pub date: String,
    /// Never prompt inside checks and never write a keyfile
    pub dry_run: bool,
}

impl<'a> RunContext<'a> {
    pub fn new(
        executor: &'a mut dyn CommandExecutor,
        gate: &'a mut dyn ConfirmationGate,
        store: &'a mut dyn ProgressStore,
        credentials: &'a mut dyn CredentialSource,
    ) -> Self {
        Self {
            executor,
            gate,
            store,
            credentials,
            date: run_date(),
            dry_run: false,
        }
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Override the `{date}` value.
    pub fn with_date(mut self, date: impl Into<String>) -> Self {
        self.date = date.into();
        self
    }
}

/// Today's date in the form backup files are named with.
pub fn run_date() -> String {
    chrono::Local::now().format("%Y_%m_%d").to_string()
}

/// How a run ended when no error occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every remaining step ran (or there was nothing left to run).
    Completed,
    /// The operator declined to continue at this step; it was not recorded.
    Cancelled { step: StepId },
}

/// Summary of a finished run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub outcome: RunOutcome,
    /// Last completed step found when the run started
    pub resumed_from: Option<StepId>,
    /// Steps completed during this run, in order
    pub executed: Vec<StepId>,
    pub history: Vec<(RunState, u64)>,
}

/// What a run would do, computed without executing anything.
#[derive(Debug, Clone)]
pub struct RunPlan<'c> {
    pub last_completed: Option<StepId>,
    pub remaining: &'c [Step],
}

impl<'c> RunPlan<'c> {
    /// The step the next run starts with.
    pub fn next(&self) -> Option<&'c Step> {
        self.remaining.first()
    }

    pub fn is_complete(&self) -> bool {
        self.remaining.is_empty()
    }

    /// Whether `step` is recorded as done.
    pub fn is_done(&self, step: StepId) -> bool {
        self.last_completed.is_some_and(|done| step <= done)
    }
}

enum StepFlow {
    Done,
    Cancelled,
}

/// Runs one catalog against one context.
pub struct Orchestrator<'c, 'a> {
    catalog: &'c Catalog,
    ctx: RunContext<'a>,
    session: Option<RemoteSession>,
}

impl<'c, 'a> Orchestrator<'c, 'a> {
    pub fn new(catalog: &'c Catalog, ctx: RunContext<'a>) -> Self {
        Self {
            catalog,
            ctx,
            session: None,
        }
    }

    pub fn catalog(&self) -> &'c Catalog {
        self.catalog
    }

    /// Resume point and remaining steps.
    ///
    /// # Errors
    ///
    /// `StoreCorrupt` if the progress record cannot be read.
    pub fn plan(&self) -> Result<RunPlan<'c>> {
        let last_completed = self.ctx.store.load()?;
        Ok(RunPlan {
            last_completed,
            remaining: self.catalog.remaining(last_completed),
        })
    }

    /// Run every remaining step.
    ///
    /// Returns `Ok` for a completed or cancelled run. A failing step returns
    /// `StepFailed` wrapping the cause; a step that ran but could not be
    /// recorded returns `StoreUnwritable`.
    pub fn run(&mut self) -> Result<RunReport> {
        let plan = self.plan()?;
        let mut machine = RunMachine::start(plan.last_completed);
        let mut executed = Vec::new();

        match plan.last_completed {
            Some(done) => match plan.next() {
                Some(next) => info!(
                    catalog = self.catalog.name(),
                    "Resuming after step {done}, next is step {} ({})", next.id, next.name
                ),
                None => info!(
                    catalog = self.catalog.name(),
                    "Step {done} already recorded, nothing left to run"
                ),
            },
            None => info!(catalog = self.catalog.name(), "Starting from the beginning"),
        }

        for step in plan.remaining {
            if process_guard::interrupt_requested() {
                warn!(step = step.id, "Interrupt pending, not starting step");
                return Err(MigrationError::Interrupted { argv: Vec::new() }
                    .in_step(step.id, step.name.as_str()));
            }

            machine.begin(step.id)?;
            info!(step = step.id, name = %step.name, "Starting step");

            match self.run_step(step) {
                Ok(StepFlow::Done) => {}
                Ok(StepFlow::Cancelled) => {
                    machine.cancel()?;
                    info!(step = step.id, "Process cancelled by user");
                    return Ok(RunReport {
                        outcome: RunOutcome::Cancelled { step: step.id },
                        resumed_from: plan.last_completed,
                        executed,
                        history: machine.history().to_vec(),
                    });
                }
                Err(e) => {
                    machine.fail()?;
                    error!(step = step.id, name = %step.name, "Step failed: {e}");
                    return Err(e.in_step(step.id, step.name.as_str()));
                }
            }

            if let Err(e) = self.ctx.store.save(step.id) {
                machine.fail()?;
                error!(step = step.id, "{e}");
                return Err(e);
            }
            machine.succeed()?;
            executed.push(step.id);
            info!(step = step.id, name = %step.name, "Step completed");

            if step.terminal {
                debug!(step = step.id, "Terminal step reached");
                break;
            }
        }

        machine.complete()?;
        info!(catalog = self.catalog.name(), "Migration completed");
        Ok(RunReport {
            outcome: RunOutcome::Completed,
            resumed_from: plan.last_completed,
            executed,
            history: machine.history().to_vec(),
        })
    }

    fn run_step(&mut self, step: &Step) -> Result<StepFlow> {
        if let Some(prompt) = &step.confirmation {
            if self.ctx.gate.confirm(prompt)? == Decision::Cancel {
                return Ok(StepFlow::Cancelled);
            }
        }

        for action in &step.actions {
            if let StepFlow::Cancelled = self.run_action(action)? {
                return Ok(StepFlow::Cancelled);
            }
        }
        Ok(StepFlow::Done)
    }

    fn run_action(&mut self, action: &Action) -> Result<StepFlow> {
        match action {
            Action::Command { argv } => {
                self.execute(argv)?;
            }
            Action::Services {
                operation,
                services,
                manager,
            } => {
                for service in services {
                    info!(%service, %operation, "Managing service");
                    self.ctx
                        .executor
                        .execute(&catalog::service_argv(*manager, *operation, service))?;
                }
            }
            Action::Transfer {
                source,
                destination,
            } => {
                let source = source.replace(catalog::DATE_PLACEHOLDER, &self.ctx.date);
                let destination = destination.replace(catalog::DATE_PLACEHOLDER, &self.ctx.date);
                let argv = match self.remote_session()? {
                    Some(session) => session.rsync_argv(&source, &destination),
                    None => {
                        warn!("Credential entry aborted");
                        return Ok(StepFlow::Cancelled);
                    }
                };
                info!(%source, %destination, "Transferring");
                self.ctx.executor.execute(&argv)?;
            }
            Action::Check {
                argv,
                expect,
                prompt,
                remedy,
                ..
            } => {
                let output = self.execute(argv)?;
                if action.check_passes(&output.stdout) {
                    debug!(%expect, "Check passed");
                } else if self.ctx.dry_run {
                    info!("[DRY RUN] Would ask: {prompt}");
                    self.execute(remedy)?;
                } else {
                    warn!(%expect, "Check output did not match the expected value");
                    match self.ctx.gate.confirm(prompt)? {
                        Decision::Proceed => {
                            self.execute(remedy)?;
                        }
                        Decision::Cancel => return Ok(StepFlow::Cancelled),
                    }
                }
            }
        }
        Ok(StepFlow::Done)
    }

    fn execute(&mut self, argv: &[String]) -> Result<CommandOutput> {
        let argv = catalog::expand_args(argv, &self.ctx.date);
        self.ctx.executor.execute(&argv)
    }

    /// Credentials are requested once, on first use, and kept for the run.
    fn remote_session(&mut self) -> Result<Option<&RemoteSession>> {
        if self.session.is_none() {
            let Some(credentials) = self.ctx.credentials.acquire()? else {
                return Ok(None);
            };
            info!(host = %credentials.host, user = %credentials.user, "Remote credentials acquired");
            self.session = Some(if self.ctx.dry_run {
                RemoteSession::preview(credentials)
            } else {
                RemoteSession::open(credentials)?
            });
        }
        Ok(self.session.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ServiceOperation;
    use crate::command_executor::DryRunExecutor;
    use crate::confirmation::{AutoApprove, ScriptedGate};
    use crate::credentials::{Credentials, Secret, StaticCredentials};
    use crate::progress_store::MemoryProgressStore;

    /// Records argv; fails any command whose program is `fail`; answers
    /// `count` with a configurable stdout.
    #[derive(Default)]
    struct FakeExecutor {
        calls: Vec<Vec<String>>,
        count_output: String,
    }

    impl CommandExecutor for FakeExecutor {
        fn execute(&mut self, argv: &[String]) -> Result<CommandOutput> {
            self.calls.push(argv.to_vec());
            if argv[0] == "fail" {
                return Err(MigrationError::CommandFailed {
                    argv: argv.to_vec(),
                    exit_code: Some(1),
                    stderr: "boom".into(),
                });
            }
            let stdout = if argv[0] == "count" {
                self.count_output.clone()
            } else {
                String::new()
            };
            Ok(CommandOutput {
                argv: argv.to_vec(),
                stdout,
                stderr: String::new(),
                exit_code: Some(0),
            })
        }
    }

    fn catalog(steps: Vec<Step>) -> Catalog {
        Catalog::new("test", steps).unwrap()
    }

    fn cmd(program: &str) -> Action {
        Action::command([program])
    }

    fn no_credentials() -> StaticCredentials {
        StaticCredentials(None)
    }

    #[test]
    fn test_runs_all_steps_and_records_each() {
        let catalog = catalog(vec![
            Step::new(1, "a").action(cmd("a")),
            Step::new(2, "b").action(cmd("b")),
            Step::new(5, "c").action(cmd("c")),
        ]);
        let mut exec = FakeExecutor::default();
        let mut store = MemoryProgressStore::new();
        let mut creds = no_credentials();

        let report = Orchestrator::new(
            &catalog,
            RunContext::new(&mut exec, &mut AutoApprove, &mut store, &mut creds),
        )
        .run()
        .unwrap();

        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(report.executed, vec![1, 2, 5]);
        assert_eq!(store.saves(), &[1, 2, 5]);
        assert_eq!(exec.calls.len(), 3);
        assert_eq!(report.history.last().map(|(s, _)| *s), Some(RunState::Completed));
    }

    #[test]
    fn test_resumes_after_stored_step() {
        let catalog = catalog(vec![
            Step::new(11, "a").action(cmd("a")),
            Step::new(12, "b").action(cmd("b")),
            Step::new(14, "c").action(cmd("c")),
        ]);
        let mut exec = FakeExecutor::default();
        let mut store = MemoryProgressStore::starting_at(Some(12));
        let mut creds = no_credentials();

        let report = Orchestrator::new(
            &catalog,
            RunContext::new(&mut exec, &mut AutoApprove, &mut store, &mut creds),
        )
        .run()
        .unwrap();

        assert_eq!(report.resumed_from, Some(12));
        assert_eq!(report.executed, vec![14]);
        assert_eq!(exec.calls, vec![vec!["c".to_string()]]);
    }

    #[test]
    fn test_stored_id_beyond_catalog_completes_immediately() {
        let catalog = catalog(vec![Step::new(1, "a").action(cmd("a"))]);
        let mut exec = FakeExecutor::default();
        let mut store = MemoryProgressStore::starting_at(Some(99));
        let mut creds = no_credentials();

        let report = Orchestrator::new(
            &catalog,
            RunContext::new(&mut exec, &mut AutoApprove, &mut store, &mut creds),
        )
        .run()
        .unwrap();

        assert_eq!(report.outcome, RunOutcome::Completed);
        assert!(exec.calls.is_empty());
        assert!(store.saves().is_empty());
    }

    #[test]
    fn test_failure_in_second_action_leaves_step_unrecorded() {
        let catalog = catalog(vec![
            Step::new(1, "a").action(cmd("a")),
            Step::new(2, "b").action(cmd("mkdir")).action(cmd("fail")),
            Step::new(3, "c").action(cmd("c")),
        ]);
        let mut exec = FakeExecutor::default();
        let mut store = MemoryProgressStore::new();
        let mut creds = no_credentials();

        let err = Orchestrator::new(
            &catalog,
            RunContext::new(&mut exec, &mut AutoApprove, &mut store, &mut creds),
        )
        .run()
        .unwrap_err();

        assert_eq!(err.step(), Some(2));
        assert!(err.to_string().contains("Step 2 (b) failed"));
        assert!(matches!(err.root(), MigrationError::CommandFailed { stderr, .. } if stderr == "boom"));
        assert_eq!(store.saves(), &[1]);
        assert!(!exec.calls.iter().any(|c| c[0] == "c"));
    }

    #[test]
    fn test_cancel_at_confirmation_runs_nothing_and_saves_nothing() {
        let catalog = catalog(vec![
            Step::new(1, "a").action(cmd("a")),
            Step::new(2, "b").confirm("Continue?").action(cmd("b")),
        ]);
        let mut exec = FakeExecutor::default();
        let mut store = MemoryProgressStore::new();
        let mut creds = no_credentials();
        let mut gate = ScriptedGate::new(["what", "c"]);

        let report = Orchestrator::new(
            &catalog,
            RunContext::new(&mut exec, &mut gate, &mut store, &mut creds),
        )
        .run()
        .unwrap();

        assert_eq!(report.outcome, RunOutcome::Cancelled { step: 2 });
        assert_eq!(store.saves(), &[1]);
        assert_eq!(exec.calls.len(), 1);
        assert_eq!(gate.prompts().len(), 2);
    }

    #[test]
    fn test_terminal_step_ends_the_run() {
        let catalog = catalog(vec![
            Step::new(1, "a").action(cmd("a")),
            Step::new(2, "b").action(cmd("b")).terminal(),
        ]);
        let mut exec = FakeExecutor::default();
        let mut store = MemoryProgressStore::new();
        let mut creds = no_credentials();

        let report = Orchestrator::new(
            &catalog,
            RunContext::new(&mut exec, &mut AutoApprove, &mut store, &mut creds),
        )
        .run()
        .unwrap();
        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(report.executed, vec![1, 2]);
    }

    #[test]
    fn test_services_expand_to_one_invocation_each() {
        let catalog = catalog(vec![Step::new(9, "stop").action(Action::services(
            ServiceOperation::Stop,
            ["st", "crond", "mongod"],
        ))]);
        let mut exec = FakeExecutor::default();
        let mut store = MemoryProgressStore::new();
        let mut creds = no_credentials();

        Orchestrator::new(
            &catalog,
            RunContext::new(&mut exec, &mut AutoApprove, &mut store, &mut creds),
        )
        .run()
        .unwrap();

        assert_eq!(
            exec.calls,
            vec![
                vec!["st", "shutdown"],
                vec!["systemctl", "stop", "crond"],
                vec!["systemctl", "stop", "mongod"],
            ]
        );
    }

    #[test]
    fn test_date_placeholder_is_expanded() {
        let catalog = catalog(vec![
            Step::new(1, "zip").action(Action::command(["ls", "config_{date}.zip"])),
        ]);
        let mut exec = DryRunExecutor::new();
        let mut store = MemoryProgressStore::new();
        let mut creds = no_credentials();

        Orchestrator::new(
            &catalog,
            RunContext::new(&mut exec, &mut AutoApprove, &mut store, &mut creds)
                .with_date("2026_10_19"),
        )
        .run()
        .unwrap();

        assert_eq!(exec.executed(), &[vec!["ls", "config_2026_10_19.zip"]]);
    }

    #[test]
    fn test_transfer_acquires_credentials_once() {
        struct CountingSource(usize);
        impl CredentialSource for CountingSource {
            fn acquire(&mut self) -> Result<Option<Credentials>> {
                self.0 += 1;
                Ok(Some(Credentials::new("10.1.1.1", "ops", Secret::new("pw"))))
            }
        }

        let catalog = catalog(vec![
            Step::new(1, "t1").action(Action::transfer("/a", "/b")),
            Step::new(2, "t2").action(Action::transfer("/c", "/d")),
        ]);
        let mut exec = DryRunExecutor::new();
        let mut store = MemoryProgressStore::new();
        let mut creds = CountingSource(0);

        Orchestrator::new(
            &catalog,
            RunContext::new(&mut exec, &mut AutoApprove, &mut store, &mut creds),
        )
        .run()
        .unwrap();

        assert_eq!(creds.0, 1);
        assert_eq!(exec.executed().len(), 2);
        assert_eq!(exec.executed()[1][6], "ops@10.1.1.1:/d");
        assert!(exec.executed().iter().flatten().all(|a| !a.contains("pw")));
    }

    #[test]
    fn test_aborted_credential_entry_cancels() {
        let catalog = catalog(vec![Step::new(1, "t").action(Action::transfer("/a", "/b"))]);
        let mut exec = DryRunExecutor::new();
        let mut store = MemoryProgressStore::new();
        let mut creds = no_credentials();

        let report = Orchestrator::new(
            &catalog,
            RunContext::new(&mut exec, &mut AutoApprove, &mut store, &mut creds),
        )
        .run()
        .unwrap();
        assert_eq!(report.outcome, RunOutcome::Cancelled { step: 1 });
        assert!(exec.executed().is_empty());
        assert!(store.saves().is_empty());
    }

    fn license_catalog() -> Catalog {
        catalog(vec![Step::new(2, "license").action(Action::Check {
            argv: vec!["count".into()],
            expect: "1".into(),
            exact: true,
            prompt: "Delete the EVAL license?".into(),
            remedy: vec!["delete".into()],
        })])
    }

    #[test]
    fn test_check_passing_skips_remedy() {
        let catalog = license_catalog();
        let mut exec = FakeExecutor {
            count_output: "1\n".into(),
            ..Default::default()
        };
        let mut store = MemoryProgressStore::new();
        let mut creds = no_credentials();
        let mut gate = ScriptedGate::new(Vec::<String>::new());

        Orchestrator::new(
            &catalog,
            RunContext::new(&mut exec, &mut gate, &mut store, &mut creds),
        )
        .run()
        .unwrap();
        assert_eq!(exec.calls, vec![vec!["count"]]);
        assert!(gate.prompts().is_empty());
    }

    #[test]
    fn test_check_failing_runs_remedy_on_proceed() {
        let catalog = license_catalog();
        let mut exec = FakeExecutor {
            count_output: "     2\n".into(),
            ..Default::default()
        };
        let mut store = MemoryProgressStore::new();
        let mut creds = no_credentials();
        let mut gate = ScriptedGate::new(["y"]);

        Orchestrator::new(
            &catalog,
            RunContext::new(&mut exec, &mut gate, &mut store, &mut creds),
        )
        .run()
        .unwrap();
        assert_eq!(exec.calls, vec![vec!["count"], vec!["delete"]]);
        assert_eq!(store.saves(), &[2]);
    }

    #[test]
    fn test_check_failing_cancel_stops_run() {
        let catalog = license_catalog();
        let mut exec = FakeExecutor {
            count_output: "0".into(),
            ..Default::default()
        };
        let mut store = MemoryProgressStore::new();
        let mut creds = no_credentials();
        let mut gate = ScriptedGate::new(["n"]);

        let report = Orchestrator::new(
            &catalog,
            RunContext::new(&mut exec, &mut gate, &mut store, &mut creds),
        )
        .run()
        .unwrap();
        assert_eq!(report.outcome, RunOutcome::Cancelled { step: 2 });
        assert!(store.saves().is_empty());
    }

    #[test]
    fn test_plan_reports_next_step() {
        let catalog = catalog(vec![
            Step::new(1, "a").action(cmd("a")),
            Step::new(2, "b").action(cmd("b")),
        ]);
        let mut exec = FakeExecutor::default();
        let mut store = MemoryProgressStore::starting_at(Some(1));
        let mut creds = no_credentials();
        let mut approve = AutoApprove;

        let orchestrator = Orchestrator::new(
            &catalog,
            RunContext::new(&mut exec, &mut approve, &mut store, &mut creds),
        );
        let plan = orchestrator.plan().unwrap();
        assert_eq!(plan.next().map(|s| s.id), Some(2));
        assert!(plan.is_done(1));
        assert!(!plan.is_done(2));
        assert!(!plan.is_complete());
    }
    #[test]
    fn test_check_mismatch_in_aligned_output_offers_remedy() {
        let catalog = license_catalog();
        let mut exec = FakeExecutor {
            count_output: " count \n-------\n     2\n(1 row)\n".into(),
            ..Default::default()
        };
        let mut store = MemoryProgressStore::new();
        let mut creds = no_credentials();
        let mut gate = ScriptedGate::new(["n"]);

        let report = Orchestrator::new(
            &catalog,
            RunContext::new(&mut exec, &mut gate, &mut store, &mut creds),
        )
        .run()
        .unwrap();
        assert_eq!(gate.prompts(), &["Delete the EVAL license?"]);
        assert_eq!(report.outcome, RunOutcome::Cancelled { step: 2 });
    }

    #[test]
    fn test_exact_check_rejects_longer_count() {
        let catalog = license_catalog();
        let mut exec = FakeExecutor {
            count_output: "10\n".into(),
            ..Default::default()
        };
        let mut store = MemoryProgressStore::new();
        let mut creds = no_credentials();
        let mut gate = ScriptedGate::new(["y"]);

        Orchestrator::new(
            &catalog,
            RunContext::new(&mut exec, &mut gate, &mut store, &mut creds),
        )
        .run()
        .unwrap();
        assert_eq!(exec.calls, vec![vec!["count"], vec!["delete"]]);
    }

    #[test]
    fn test_dry_run_check_never_prompts() {
        let catalog = license_catalog();
        let mut exec = FakeExecutor {
            count_output: "2\n".into(),
            ..Default::default()
        };
        let mut store = MemoryProgressStore::new();
        let mut creds = no_credentials();
        let mut gate = ScriptedGate::new(Vec::<String>::new());

        let report = Orchestrator::new(
            &catalog,
            RunContext::new(&mut exec, &mut gate, &mut store, &mut creds).dry_run(true),
        )
        .run()
        .unwrap();
        assert_eq!(report.outcome, RunOutcome::Completed);
        assert!(gate.prompts().is_empty());
        assert_eq!(exec.calls, vec![vec!["count"], vec!["delete"]]);
    }

    #[test]
    fn test_dry_run_transfer_writes_no_keyfile() {
        let catalog = catalog(vec![
            Step::new(1, "sync").action(Action::transfer("/var/lib/pgsql/", "/opt/data/")),
        ]);
        let mut exec = DryRunExecutor::new();
        let mut store = MemoryProgressStore::new();
        let mut creds = StaticCredentials(Some(Credentials::new(
            "10.0.0.5",
            "admin",
            Secret::new(""),
        )));
        let mut approve = AutoApprove;

        let mut orchestrator = Orchestrator::new(
            &catalog,
            RunContext::new(&mut exec, &mut approve, &mut store, &mut creds).dry_run(true),
        );
        orchestrator.run().unwrap();
        let session = orchestrator.session.as_ref().unwrap();
        assert!(session.keyfile().is_none());
        drop(orchestrator);
        assert!(exec.executed()[0][4].contains("<keyfile>"));
    }

    /// Fails every save the way an unwritable state directory does.
    struct FailingStore;

    impl ProgressStore for FailingStore {
        fn load(&self) -> Result<Option<StepId>> {
            Ok(None)
        }

        fn save(&mut self, step: StepId) -> Result<()> {
            Err(MigrationError::StoreUnwritable {
                step,
                path: "/var/lib/migrun/progress".into(),
                reason: "Read-only file system".into(),
            })
        }

        fn clear(&mut self) -> Result<()> {
            Ok(())
        }

        fn location(&self) -> String {
            "/var/lib/migrun/progress".into()
        }
    }

    #[test]
    fn test_unrecordable_step_stops_run_as_store_unwritable() {
        let catalog = catalog(vec![
            Step::new(1, "a").action(cmd("a")),
            Step::new(2, "b").action(cmd("b")),
        ]);
        let mut exec = FakeExecutor::default();
        let mut store = FailingStore;
        let mut creds = no_credentials();
        let mut approve = AutoApprove;

        let err = Orchestrator::new(
            &catalog,
            RunContext::new(&mut exec, &mut approve, &mut store, &mut creds),
        )
        .run()
        .unwrap_err();

        assert!(matches!(err, MigrationError::StoreUnwritable { step: 1, .. }));
        assert_eq!(err.exit_code(), crate::error::EXIT_STORE_UNWRITABLE);
        assert_eq!(exec.calls, vec![vec!["a"]]);
    }
}
