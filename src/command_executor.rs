//! Command Executor
//!
//! Runs one external program per call and turns its outcome into a
//! `CommandOutput` or a `MigrationError`. Arguments go straight to `execve`;
//! nothing is ever interpreted by a shell.
//!
//! Every command:
//! - runs in its own process group with a parent-death signal
//!   (see `process_guard`)
//! - is registered in the child registry while it runs, so an interrupt can
//!   terminate it
//! - has stdout and stderr drained on helper threads, so a chatty command
//!   cannot block on a full pipe while we wait for it
//!
//! Successful commands have their stdout appended to the log sink. Failures
//! are returned, never retried.

use std::fs::{self, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use nix::sys::signal::Signal;
use tracing::{debug, error, info, warn};

use crate::error::{MigrationError, Result};
use crate::process_guard::{self, ChildRegistry, CommandProcessGroup};

/// Captured result of a successful command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub argv: Vec<String>,
    pub stdout: String,
    pub stderr: String,
    /// Exit code (`None` if terminated by signal).
    pub exit_code: Option<i32>,
}

/// Runs one external operation.
pub trait CommandExecutor {
    /// Run `argv` to completion.
    ///
    /// # Errors
    ///
    /// - `CommandFailed` on a non-zero exit
    /// - `CommandTimedOut` if a configured timeout expired
    /// - `Interrupted` if the run was interrupted while the command ran
    /// - `Spawn` if the program could not be started
    fn execute(&mut self, argv: &[String]) -> Result<CommandOutput>;
}

/// Append-only text log receiving the stdout of every successful command.
#[derive(Debug, Clone)]
pub struct LogSink {
    path: PathBuf,
}

impl LogSink {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record: a header line naming the command, then its stdout.
    ///
    /// Creates the sink's directory if it does not exist yet.
    pub fn append(&self, argv: &[String], stdout: &str) -> io::Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        let mut record = format!(
            "[{}] $ {}\n",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
            argv.join(" ")
        );
        record.push_str(stdout);
        if !record.ends_with('\n') {
            record.push('\n');
        }
        // Single write keeps records from interleaving
        file.write_all(record.as_bytes())
    }
}

/// Executor that spawns real processes.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    sink: LogSink,
    timeout: Option<Duration>,
}

enum Completion {
    Exited(ExitStatus),
    TimedOut,
}

impl ProcessExecutor {
    pub fn new(sink: LogSink) -> Self {
        Self {
            sink,
            timeout: None,
        }
    }

    /// Kill commands that run longer than `timeout` and fail their step.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn sink(&self) -> &LogSink {
        &self.sink
    }

    fn wait(&self, child: &mut Child) -> io::Result<Completion> {
        let Some(timeout) = self.timeout else {
            return child.wait().map(Completion::Exited);
        };

        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(Completion::Exited(status));
            }
            if Instant::now() >= deadline {
                process_guard::signal_group(child.id(), Signal::SIGKILL);
                child.wait()?;
                return Ok(Completion::TimedOut);
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    })
}

fn collect(handle: JoinHandle<Vec<u8>>) -> String {
    let bytes = handle.join().unwrap_or_default();
    String::from_utf8_lossy(&bytes).into_owned()
}

impl CommandExecutor for ProcessExecutor {
    fn execute(&mut self, argv: &[String]) -> Result<CommandOutput> {
        let Some((program, args)) = argv.split_first() else {
            return Err(MigrationError::invalid_catalog("empty command"));
        };

        info!(command = %argv.join(" "), "Executing");

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .in_new_process_group()
            .spawn()
            .map_err(|source| MigrationError::Spawn {
                program: program.clone(),
                source,
            })?;

        let pid = child.id();
        let registry = ChildRegistry::global();
        if let Ok(mut guard) = registry.lock() {
            guard.register(pid);
        }

        let stdout_reader = drain(child.stdout.take());
        let stderr_reader = drain(child.stderr.take());
        let completion = self.wait(&mut child);

        if let Ok(mut guard) = registry.lock() {
            guard.unregister(pid);
        }

        let completion = completion?;
        let stdout = collect(stdout_reader);
        let stderr = collect(stderr_reader);

        let status = match completion {
            Completion::TimedOut => {
                let secs = self.timeout.map_or(0, |t| t.as_secs());
                error!(command = %argv.join(" "), secs, "Command timed out and was killed");
                return Err(MigrationError::CommandTimedOut {
                    argv: argv.to_vec(),
                    secs,
                });
            }
            Completion::Exited(status) => status,
        };

        if status.success() {
            debug!(command = %argv.join(" "), bytes = stdout.len(), "Command succeeded");
            if let Err(e) = self.sink.append(argv, &stdout) {
                warn!(path = %self.sink.path().display(), %e, "Failed to append to log sink");
            }
            return Ok(CommandOutput {
                argv: argv.to_vec(),
                stdout,
                stderr,
                exit_code: status.code(),
            });
        }

        Err(failure(argv, status, stderr, process_guard::interrupt_requested()))
    }
}

/// Error for a command that did not succeed.
///
/// A pending interrupt wins over the exit status: children that catch SIGINT
/// exit normally with their own code (rsync exits 20).
fn failure(argv: &[String], status: ExitStatus, stderr: String, interrupted: bool) -> MigrationError {
    if interrupted {
        error!(command = %argv.join(" "), signal = ?status.signal(), "Command interrupted");
        return MigrationError::Interrupted {
            argv: argv.to_vec(),
        };
    }

    error!(
        command = %argv.join(" "),
        exit_code = ?status.code(),
        signal = ?status.signal(),
        stderr = %stderr.trim(),
        "Command execution failed"
    );
    MigrationError::CommandFailed {
        argv: argv.to_vec(),
        exit_code: status.code(),
        stderr,
    }
}

/// Executor that only logs what would run (`--dry-run`).
#[derive(Debug, Default, Clone)]
pub struct DryRunExecutor {
    executed: Vec<Vec<String>>,
}

impl DryRunExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every argv that would have been executed, in order.
    pub fn executed(&self) -> &[Vec<String>] {
        &self.executed
    }
}

impl CommandExecutor for DryRunExecutor {
    fn execute(&mut self, argv: &[String]) -> Result<CommandOutput> {
        info!("[DRY RUN] Would execute: {}", argv.join(" "));
        self.executed.push(argv.to_vec());
        Ok(CommandOutput {
            argv: argv.to_vec(),
            stdout: String::new(),
            stderr: String::new(),
            exit_code: Some(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_log_sink_creates_directory_and_appends() {
        let dir = TempDir::new().unwrap();
        let sink = LogSink::new(dir.path().join("logs").join("migration.log"));

        sink.append(&argv(&["psql", "-V"]), "psql (PostgreSQL) 11.9\n")
            .unwrap();
        sink.append(&argv(&["tos", "version"]), "no newline").unwrap();

        let content = fs::read_to_string(sink.path()).unwrap();
        assert!(content.contains("$ psql -V\npsql (PostgreSQL) 11.9\n"));
        assert!(content.contains("$ tos version\nno newline\n"));
        assert!(content.find("psql").unwrap() < content.find("tos").unwrap());
    }

    #[test]
    fn test_dry_run_records_without_spawning() {
        let mut exec = DryRunExecutor::new();
        let out = exec
            .execute(&argv(&["definitely-not-a-real-binary", "--flag"]))
            .unwrap();
        assert_eq!(out.exit_code, Some(0));
        assert_eq!(exec.executed().len(), 1);
    }

    #[test]
    fn test_empty_argv_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut exec = ProcessExecutor::new(LogSink::new(dir.path().join("log")));
        assert!(matches!(
            exec.execute(&[]),
            Err(MigrationError::InvalidCatalog(_))
        ));
    }

    #[test]
    fn test_interrupt_wins_over_normal_exit_code() {
        let rsync = argv(&["rsync", "-avzh", "/var/lib/pgsql/11/data/", "remote:/opt/"]);
        // rsync exits 20 after catching SIGINT
        let status = ExitStatus::from_raw(20 << 8);

        let err = failure(&rsync, status, String::new(), true);
        assert!(matches!(err, MigrationError::Interrupted { .. }));
        assert_eq!(err.exit_code(), 130);

        let err = failure(&rsync, status, "error in socket IO".into(), false);
        assert!(matches!(
            err,
            MigrationError::CommandFailed {
                exit_code: Some(20),
                ..
            }
        ));
    }
}
