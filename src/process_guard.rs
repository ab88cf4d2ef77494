//! Child process lifecycle for migration commands
//!
//! A migration command (`pg_dump`, `rsync`, `systemctl stop ...`) must not keep
//! running after the orchestrator that started it is gone: its outcome would
//! never be recorded and the operator would resume into a half-applied step
//! while the old command is still mutating the system.
//!
//! # Mechanism
//! - Every command runs in its own process group with `PR_SET_PDEATHSIG`, so
//!   it receives SIGTERM if the orchestrator dies, even via SIGKILL
//! - Running commands are tracked in a process-wide [`ChildRegistry`]
//! - SIGINT/SIGTERM/SIGHUP are handled on a dedicated thread: running command
//!   groups get SIGTERM, then SIGKILL after a grace period, and the interrupt
//!   flag is raised so the executor reports `Interrupted`
//!
//! The registry is the only process-wide state in the crate; it has to be
//! reachable from the signal thread.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use nix::libc;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tracing::{debug, info, warn};

static CHILD_REGISTRY: OnceLock<Arc<Mutex<ChildRegistry>>> = OnceLock::new();

/// Raised by the signal thread; checked between steps and after each command.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Grace period between SIGTERM and SIGKILL when the run is interrupted.
pub const INTERRUPT_GRACE: Duration = Duration::from_secs(3);

/// Whether an interrupt signal has been received.
pub fn interrupt_requested() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// Process groups of the commands currently running
#[derive(Debug, Default)]
pub struct ChildRegistry {
    pgids: HashSet<u32>,
}

impl ChildRegistry {
    /// Shared registry used by the executor and the signal thread
    pub fn global() -> Arc<Mutex<ChildRegistry>> {
        CHILD_REGISTRY
            .get_or_init(|| Arc::new(Mutex::new(ChildRegistry::default())))
            .clone()
    }

    pub fn register(&mut self, pid: u32) {
        self.pgids.insert(pid);
        debug!(pid, "Registered command process group");
    }

    pub fn unregister(&mut self, pid: u32) {
        self.pgids.remove(&pid);
        debug!(pid, "Unregistered command process group");
    }

    pub fn count(&self) -> usize {
        self.pgids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pgids.is_empty()
    }

    /// SIGTERM every tracked group, wait up to `grace`, then SIGKILL survivors.
    pub fn terminate_all(&mut self, grace: Duration) {
        if self.pgids.is_empty() {
            return;
        }
        info!(count = self.pgids.len(), "Terminating running command(s)");

        let targets: Vec<u32> = self.pgids.iter().copied().collect();
        for &pgid in &targets {
            signal_group(pgid, Signal::SIGTERM);
        }

        let start = Instant::now();
        while start.elapsed() < grace {
            if targets.iter().all(|&pid| !is_process_alive(pid)) {
                info!("All running commands terminated");
                self.pgids.clear();
                return;
            }
            std::thread::sleep(Duration::from_millis(100));
        }

        for &pgid in &targets {
            if is_process_alive(pgid) {
                warn!(pgid, "Command ignored SIGTERM, sending SIGKILL");
                signal_group(pgid, Signal::SIGKILL);
            }
        }
        self.pgids.clear();
    }
}

/// Signal a whole process group, falling back to the leader alone.
///
/// Group signalling also reaches grandchildren (`sshpass` → `ssh`, `rsync`
/// → remote shell).
pub fn signal_group(pgid: u32, sig: Signal) {
    let Ok(raw) = i32::try_from(pgid) else {
        return;
    };
    if let Err(e) = signal::kill(Pid::from_raw(-raw), sig) {
        debug!(pgid, %e, "Group signal failed, signalling leader");
        if let Err(e) = signal::kill(Pid::from_raw(raw), sig) {
            debug!(pgid, %e, "Leader signal failed");
        }
    }
}

/// Alive and not a zombie
pub fn is_process_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if signal::kill(Pid::from_raw(raw), None).is_err() {
        return false;
    }

    // Field 3 of /proc/<pid>/stat is the state; Z and X are not running
    if let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        if let Some(state) = stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.split_whitespace().next())
        {
            return !matches!(state, "Z" | "X");
        }
    }

    true
}

/// RAII guard that terminates leftover commands when the run scope ends.
pub struct ProcessGuard {
    registry: Arc<Mutex<ChildRegistry>>,
}

impl ProcessGuard {
    pub fn new() -> Self {
        Self {
            registry: ChildRegistry::global(),
        }
    }

    pub fn child_count(&self) -> usize {
        self.registry.lock().map(|r| r.count()).unwrap_or(0)
    }
}

impl Default for ProcessGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        if let Ok(mut registry) = self.registry.lock() {
            registry.terminate_all(INTERRUPT_GRACE);
        }
    }
}

/// Install the SIGINT/SIGTERM/SIGHUP handler thread.
///
/// While a command is running, a signal terminates that command and raises the
/// interrupt flag; the orchestrator then fails the step without recording
/// progress and returns normally. When no command is running (the run is at a
/// prompt or between steps) nothing is in flight and the process exits with
/// `128 + signal`. Progress writes are atomic, so exiting here is safe.
///
/// Call once, from the binary.
pub fn init_signal_handlers() -> std::io::Result<()> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;

    std::thread::Builder::new()
        .name("migrun-signals".into())
        .spawn(move || {
            for sig in signals.forever() {
                let name = match sig {
                    SIGINT => "SIGINT",
                    SIGTERM => "SIGTERM",
                    SIGHUP => "SIGHUP",
                    _ => "UNKNOWN",
                };
                INTERRUPTED.store(true, Ordering::SeqCst);

                let had_children = match ChildRegistry::global().lock() {
                    Ok(mut registry) if !registry.is_empty() => {
                        warn!(signal = name, "Interrupt received, stopping running command");
                        registry.terminate_all(INTERRUPT_GRACE);
                        true
                    }
                    _ => false,
                };

                if !had_children {
                    // Restore the terminal in case we were reading a password
                    let _ = crossterm::terminal::disable_raw_mode();
                    eprintln!("\nInterrupted ({name}); no command was running, progress is intact.");
                    std::process::exit(128 + sig);
                }
            }
        })?;

    Ok(())
}

/// Extension trait for `std::process::Command` to isolate migration commands
pub trait CommandProcessGroup {
    /// Run the command as leader of its own process group, with a parent-death
    /// signal so it cannot outlive the orchestrator.
    fn in_new_process_group(&mut self) -> &mut Self;
}

impl CommandProcessGroup for std::process::Command {
    fn in_new_process_group(&mut self) -> &mut Self {
        use std::os::unix::process::CommandExt;

        self.process_group(0);
        // SAFETY: the closure only calls async-signal-safe prctl(2) between
        // fork and exec and does not allocate.
        unsafe {
            self.pre_exec(|| {
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    fn wait_for_death(pid: u32, timeout: Duration) -> bool {
        use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};

        let start = Instant::now();
        let nix_pid = Pid::from_raw(pid as i32);
        while start.elapsed() < timeout {
            match waitpid(nix_pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => return true,
                Err(nix::errno::Errno::ECHILD) if !is_process_alive(pid) => return true,
                _ => {}
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn test_registry_register_unregister() {
        let mut registry = ChildRegistry::default();
        registry.register(1234);
        registry.register(5678);
        assert_eq!(registry.count(), 2);
        registry.unregister(1234);
        assert_eq!(registry.count(), 1);
        registry.unregister(5678);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_terminate_all_kills_process_group() {
        let child = Command::new("sh")
            .args(["-c", "sleep 60"])
            .in_new_process_group()
            .spawn()
            .expect("spawn sh");
        let pid = child.id();

        let mut registry = ChildRegistry::default();
        registry.register(pid);
        assert!(is_process_alive(pid));

        registry.terminate_all(Duration::from_millis(500));
        assert!(wait_for_death(pid, Duration::from_secs(3)));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_terminate_all_on_empty_registry_is_noop() {
        let mut registry = ChildRegistry::default();
        registry.terminate_all(Duration::from_millis(10));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_is_process_alive_nonexistent() {
        assert!(!is_process_alive(999_999));
    }

    #[test]
    fn test_is_process_alive_self() {
        assert!(is_process_alive(std::process::id()));
    }
}
