//! migrun - Main entry point
//!
//! Parses the command line, wires the engine components together and maps the
//! outcome of a run to the process exit status.

use std::io::{self, Write};
use std::path::Path;
use std::process::ExitCode;

use anyhow::Context;
use strum::IntoEnumIterator;
use tracing::{debug, error, info, warn};

use migrun::cli::{CatalogArgs, Cli, Commands};
use migrun::command_executor::{CommandExecutor, DryRunExecutor, LogSink, ProcessExecutor};
use migrun::config::{ConfigOverrides, RunnerConfig};
use migrun::confirmation::{AutoApprove, ConfirmationGate, Decision, PromptGate};
use migrun::credentials::{
    CredentialSource, Credentials, Secret, StaticCredentials, TerminalCredentials,
};
use migrun::error::{EXIT_CANCELLED, EXIT_STEP_FAILED, EXIT_SUCCESS, MigrationError};
use migrun::orchestrator::{Orchestrator, RunContext, RunOutcome};
use migrun::process_guard::{self, ProcessGuard};
use migrun::progress_store::{FileProgressStore, MemoryProgressStore, ProgressStore};
use migrun::run_lock::RunLock;
use migrun::scenarios::Scenario;
use migrun::{Catalog, logging, sanity};

/// Main application entry point
fn main() -> ExitCode {
    let cli = Cli::parse_args();
    logging::init_logging(cli.verbose);
    debug!("CLI arguments parsed");

    // Children are terminated on SIGINT/SIGTERM/SIGHUP; progress stays intact
    if let Err(e) = process_guard::init_signal_handlers() {
        warn!("Failed to initialize signal handlers: {e}");
    }

    match dispatch(cli) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{e:#}");
            eprintln!("✗ {e:#}");
            ExitCode::from(exit_code_of(&e))
        }
    }
}

/// Exit status for an error, from the innermost engine error in the chain.
fn exit_code_of(err: &anyhow::Error) -> u8 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<MigrationError>())
        .map_or(EXIT_STEP_FAILED, MigrationError::exit_code)
}

fn dispatch(cli: Cli) -> anyhow::Result<u8> {
    let overrides = ConfigOverrides {
        progress_file: cli.progress_file.clone(),
        log_file: cli.log_file.clone(),
        command_timeout_secs: cli.timeout_secs,
        remote_host: cli.host.clone(),
        remote_user: cli.user.clone(),
    };
    let config = RunnerConfig::resolve(cli.config.as_deref(), overrides)
        .context("Failed to load configuration")?;
    debug!(?config, "Configuration resolved");

    match cli.command {
        Commands::Run {
            source,
            yes,
            dry_run,
        } => run(&config, &source, yes, dry_run, cli.skip_preflight),
        Commands::Status { source } => status(&config, &source),
        Commands::List { source } => list(&config, &source),
        Commands::Reset { force } => reset(&config, force),
        Commands::Validate { catalog } => validate(&catalog),
        Commands::Scenarios => {
            for scenario in Scenario::iter() {
                println!("{:<14} {}", scenario.to_string(), scenario.description());
            }
            Ok(EXIT_SUCCESS)
        }
    }
}

fn load_catalog(source: &CatalogArgs) -> anyhow::Result<Catalog> {
    match (&source.scenario, &source.catalog) {
        (Some(scenario), _) => scenario
            .catalog()
            .with_context(|| format!("Built-in scenario '{scenario}' is invalid")),
        (None, Some(path)) => Catalog::from_json_file(path)
            .with_context(|| format!("Failed to load catalog {}", path.display())),
        (None, None) => Err(MigrationError::config("no scenario or catalog given").into()),
    }
}

fn run(
    config: &RunnerConfig,
    source: &CatalogArgs,
    yes: bool,
    dry_run: bool,
    skip_preflight: bool,
) -> anyhow::Result<u8> {
    let catalog = load_catalog(source)?;
    info!(catalog = catalog.name(), steps = catalog.steps().len(), dry_run, "Catalog loaded");

    let file_store = FileProgressStore::new(&config.progress_file);

    // A dry run never writes progress, so it does not need the lock
    let _lock = if dry_run {
        None
    } else {
        Some(RunLock::acquire(&RunLock::path_for(&config.progress_file))?)
    };

    let last_completed = file_store.load()?;
    let remaining = catalog.remaining(last_completed);
    if skip_preflight || dry_run {
        debug!("Pre-flight checks skipped");
    } else {
        sanity::preflight(remaining)?;
    }

    let mut executor: Box<dyn CommandExecutor> = if dry_run {
        Box::new(DryRunExecutor::new())
    } else {
        Box::new(
            ProcessExecutor::new(LogSink::new(&config.log_file))
                .with_timeout(config.command_timeout()),
        )
    };
    let mut store: Box<dyn ProgressStore> = if dry_run {
        Box::new(MemoryProgressStore::starting_at(last_completed))
    } else {
        Box::new(file_store)
    };
    let mut gate: Box<dyn ConfirmationGate> = if yes {
        Box::new(AutoApprove)
    } else {
        Box::new(PromptGate::stdio())
    };
    let mut credentials: Box<dyn CredentialSource> = if dry_run {
        Box::new(StaticCredentials(Some(Credentials::new(
            config.remote_host.as_deref().unwrap_or("<remote-host>"),
            config.remote_user.as_deref().unwrap_or("<remote-user>"),
            Secret::new(""),
        ))))
    } else {
        Box::new(TerminalCredentials::new(
            config.remote_host.clone(),
            config.remote_user.clone(),
        ))
    };

    // Terminates any command still running when the run scope ends
    let _guard = ProcessGuard::new();

    let ctx = RunContext::new(
        executor.as_mut(),
        gate.as_mut(),
        store.as_mut(),
        credentials.as_mut(),
    )
    .dry_run(dry_run);
    let report = Orchestrator::new(&catalog, ctx).run()?;

    match report.outcome {
        RunOutcome::Completed => {
            if report.executed.is_empty() {
                println!("✓ Nothing to do: every step of '{}' is already complete", catalog.name());
            } else if dry_run {
                println!("✓ Dry run finished; {} step(s) would run", report.executed.len());
            } else {
                println!(
                    "✓ Migration '{}' completed ({} step(s) this run)",
                    catalog.name(),
                    report.executed.len()
                );
            }
            Ok(EXIT_SUCCESS)
        }
        RunOutcome::Cancelled { step } => {
            println!("Cancelled at step {step}; run again to resume from it.");
            Ok(EXIT_CANCELLED)
        }
    }
}

fn status(config: &RunnerConfig, source: &CatalogArgs) -> anyhow::Result<u8> {
    let catalog = load_catalog(source)?;
    let store = FileProgressStore::new(&config.progress_file);
    let last_completed = store.load()?;

    match last_completed {
        Some(step) => println!("Last completed step: {step}"),
        None => println!("No step completed yet"),
    }
    match catalog.remaining(last_completed).first() {
        Some(next) => println!("Next step: {} ({})", next.id, next.name),
        None => println!("Migration '{}' is complete", catalog.name()),
    }

    if let Err(MigrationError::ConcurrentRunDetected { holder, .. }) =
        RunLock::acquire(&RunLock::path_for(&config.progress_file))
    {
        match holder {
            Some(pid) => println!("A run is in progress (PID {pid})"),
            None => println!("A run is in progress"),
        }
    }
    Ok(EXIT_SUCCESS)
}

fn list(config: &RunnerConfig, source: &CatalogArgs) -> anyhow::Result<u8> {
    let catalog = load_catalog(source)?;
    let last_completed = FileProgressStore::new(&config.progress_file).load()?;

    println!("{}", catalog.name());
    for step in catalog.steps() {
        let done = last_completed.is_some_and(|done| step.id <= done);
        let marker = if done { "✓" } else { " " };
        let gate = if step.requires_confirmation() { " [confirm]" } else { "" };
        println!("  [{marker}] {:>3}  {}{gate}", step.id, step.name);
    }
    Ok(EXIT_SUCCESS)
}

fn reset(config: &RunnerConfig, force: bool) -> anyhow::Result<u8> {
    let _lock = RunLock::acquire(&RunLock::path_for(&config.progress_file))
        .context("Refusing to reset while a run holds the progress store")?;
    let mut store = FileProgressStore::new(&config.progress_file);

    if !force {
        let current = match store.load() {
            Ok(Some(step)) => format!("last completed step is {step}"),
            Ok(None) => "no progress is recorded".to_string(),
            Err(e) => format!("record is unreadable: {e}"),
        };
        let prompt = format!(
            "Reset progress in {} ({current})? The next run starts from the first step. (Y/n)",
            store.location()
        );
        if PromptGate::stdio().confirm(&prompt)? == Decision::Cancel {
            println!("Reset cancelled");
            return Ok(EXIT_CANCELLED);
        }
    }

    store.clear()?;
    info!(path = %store.location(), "Progress reset");
    println!("✓ Progress reset");
    Ok(EXIT_SUCCESS)
}

fn validate(path: &Path) -> anyhow::Result<u8> {
    info!("Validating catalog file: {}", path.display());
    let catalog = Catalog::from_json_file(path)?;
    let mut stdout = io::stdout().lock();
    writeln!(
        stdout,
        "✓ Catalog '{}' is valid: {} step(s), ids {}..={}",
        catalog.name(),
        catalog.steps().len(),
        catalog.first_id(),
        catalog.last_id()
    )?;
    for program in Catalog::programs(catalog.steps()) {
        writeln!(stdout, "  requires: {program}")?;
    }
    Ok(EXIT_SUCCESS)
}
