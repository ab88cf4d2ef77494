use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::scenarios::Scenario;

/// migrun - resumable, checkpointed migration runner
#[derive(Parser, Debug)]
#[command(name = "migrun")]
#[command(about = "Run a migration step by step, resuming where the last run stopped")]
#[command(version)]
pub struct Cli {
    /// JSON configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Progress record (overrides the configuration file)
    #[arg(long, global = true)]
    pub progress_file: Option<PathBuf>,

    /// Command output log (overrides the configuration file)
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    /// Kill any single command running longer than this many seconds
    #[arg(long, global = true)]
    pub timeout_secs: Option<u64>,

    /// Remote host for transfer steps (prompted for when absent)
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// Remote user for transfer steps (defaults to the invoking user)
    #[arg(long, global = true)]
    pub user: Option<String>,

    /// Do not check for required programs before running
    #[arg(long, global = true)]
    pub skip_preflight: bool,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

/// Which step catalog to use.
#[derive(Args, Debug, Clone)]
#[group(required = true, multiple = false)]
pub struct CatalogArgs {
    /// Built-in scenario (securetrack, securechange)
    #[arg(long)]
    pub scenario: Option<Scenario>,

    /// JSON step catalog file
    #[arg(long)]
    pub catalog: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the migration, resuming after the last completed step
    Run {
        #[command(flatten)]
        source: CatalogArgs,

        /// Answer every confirmation prompt with yes
        #[arg(short, long)]
        yes: bool,

        /// Show what would be executed without running anything or recording progress
        #[arg(long)]
        dry_run: bool,
    },
    /// Show the last completed step and the next step to run
    Status {
        #[command(flatten)]
        source: CatalogArgs,
    },
    /// List the steps of a catalog with completion markers
    List {
        #[command(flatten)]
        source: CatalogArgs,
    },
    /// Forget all progress so the next run starts from the first step
    Reset {
        /// Do not ask for confirmation
        #[arg(long)]
        force: bool,
    },
    /// Validate a JSON step catalog
    Validate {
        /// Path to the catalog file
        catalog: PathBuf,
    },
    /// List the built-in scenarios
    Scenarios,
}

impl Cli {
    pub fn parse_args() -> Self {
        <Self as clap::Parser>::parse()
    }
}
