//! Remote endpoint credentials for transfer steps.
//!
//! # Security Model
//!
//! The SSH password is held only in process memory for the duration of the
//! run. It is never logged, never written to the progress record and never
//! placed in a command line (visible in `ps aux`). Transfer commands receive it
//! through a [`SecretFile`]: a 0600 keyfile handed to `sshpass -f`, overwritten
//! with zeros and unlinked when dropped.
//!
//! Credentials are requested lazily, the first time a step needs them, and
//! reused for the remaining steps of the same run.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, IsTerminal, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::{MigrationError, Result};

/// Environment variable consulted for the SSH password in unattended runs.
pub const PASSWORD_ENV: &str = "MIGRUN_SSH_PASSWORD";

/// String wrapper that never prints its content and is zeroed on drop.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Borrow the secret value. Callers must not log it.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl Drop for Secret {
    fn drop(&mut self) {
        // Best effort: earlier reallocations of the buffer are not reached
        let mut bytes = std::mem::take(&mut self.0).into_bytes();
        bytes.fill(0);
        std::hint::black_box(&bytes);
    }
}

/// Operator-supplied remote endpoint.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub host: String,
    pub user: String,
    pub password: Secret,
}

impl Credentials {
    pub fn new(host: impl Into<String>, user: impl Into<String>, password: Secret) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
            password,
        }
    }

    /// `user@host:path` for rsync.
    pub fn remote_path(&self, path: &str) -> String {
        format!("{}@{}:{}", self.user, self.host, path)
    }

    fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(MigrationError::credentials("remote host must not be empty"));
        }
        if self.host.contains(char::is_whitespace) || self.host.contains('@') {
            return Err(MigrationError::credentials(format!(
                "invalid remote host '{}'",
                self.host
            )));
        }
        if self.user.trim().is_empty() || self.user.contains(char::is_whitespace) {
            return Err(MigrationError::credentials("invalid remote username"));
        }
        Ok(())
    }
}

/// Where credentials come from.
pub trait CredentialSource {
    /// Ask for credentials. `Ok(None)` means the operator aborted entry.
    fn acquire(&mut self) -> Result<Option<Credentials>>;
}

/// Fixed credentials (tests, pre-seeded unattended runs).
#[derive(Debug, Clone)]
pub struct StaticCredentials(pub Option<Credentials>);

impl CredentialSource for StaticCredentials {
    fn acquire(&mut self) -> Result<Option<Credentials>> {
        Ok(self.0.clone())
    }
}

/// Interactive credentials: host and user from flags or prompts, password from
/// [`PASSWORD_ENV`] or a no-echo prompt.
#[derive(Debug, Default, Clone)]
pub struct TerminalCredentials {
    pub host: Option<String>,
    pub user: Option<String>,
}

impl TerminalCredentials {
    pub fn new(host: Option<String>, user: Option<String>) -> Self {
        Self { host, user }
    }

    fn default_user() -> Option<String> {
        std::env::var("SUDO_USER")
            .ok()
            .or_else(|| std::env::var("USER").ok())
            .filter(|u| !u.trim().is_empty())
    }
}

impl CredentialSource for TerminalCredentials {
    fn acquire(&mut self) -> Result<Option<Credentials>> {
        let host = match self.host.clone() {
            Some(host) => host,
            None => match prompt_line("Please enter the remote IP address: ")? {
                Some(host) => host,
                None => return Ok(None),
            },
        };

        let user = match self.user.clone() {
            Some(user) => user,
            None => {
                let fallback = Self::default_user();
                let label = match &fallback {
                    Some(u) => format!("Remote username [{u}]: "),
                    None => "Remote username: ".to_string(),
                };
                match prompt_line(&label)? {
                    Some(u) if !u.is_empty() => u,
                    Some(_) => fallback.unwrap_or_default(),
                    None => return Ok(None),
                }
            }
        };

        let password = match std::env::var(PASSWORD_ENV) {
            Ok(p) if !p.is_empty() => {
                info!("Using SSH password from {}", PASSWORD_ENV);
                Secret::new(p)
            }
            _ => match read_secret("Please enter your SSH password: ")? {
                Some(p) => p,
                None => return Ok(None),
            },
        };

        let creds = Credentials::new(host.trim(), user.trim(), password);
        creds.validate()?;
        // Remember for a re-acquire within the same process
        self.host = Some(creds.host.clone());
        self.user = Some(creds.user.clone());
        Ok(Some(creds))
    }
}

fn prompt_line(label: &str) -> Result<Option<String>> {
    let mut stderr = io::stderr();
    write!(stderr, "{label}").and_then(|()| stderr.flush())?;
    let mut line = String::new();
    if io::stdin().lock().read_line(&mut line)? == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim().to_string()))
}

/// Read a secret without echo. Falls back to a plain line read when stdin is
/// not a terminal (piped input).
fn read_secret(label: &str) -> Result<Option<Secret>> {
    use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
    use crossterm::terminal;

    if !io::stdin().is_terminal() {
        return Ok(prompt_line(label)?.map(Secret::new));
    }

    struct RawModeGuard;
    impl Drop for RawModeGuard {
        fn drop(&mut self) {
            let _ = terminal::disable_raw_mode();
        }
    }

    let mut stderr = io::stderr();
    write!(stderr, "{label}").and_then(|()| stderr.flush())?;

    terminal::enable_raw_mode()?;
    let guard = RawModeGuard;
    let mut buffer = String::new();
    let finished = loop {
        let Event::Key(key) = event::read()? else {
            continue;
        };
        if key.kind != KeyEventKind::Press {
            continue;
        }
        match key.code {
            KeyCode::Enter => break true,
            KeyCode::Esc => break false,
            KeyCode::Char('c') | KeyCode::Char('d')
                if key.modifiers.contains(KeyModifiers::CONTROL) =>
            {
                break false;
            }
            KeyCode::Backspace => {
                buffer.pop();
            }
            KeyCode::Char(c) => buffer.push(c),
            _ => {}
        }
    };
    drop(guard);
    writeln!(stderr)?;

    let secret = Secret::new(std::mem::take(&mut buffer));
    Ok(finished.then_some(secret))
}

/// RAII wrapper for the sshpass keyfile.
///
/// Created with mode 0600 via `create_new`; overwritten with zeros and removed
/// on drop, including on early return and unwinding.
#[derive(Debug)]
pub struct SecretFile {
    path: PathBuf,
    size: usize,
}

impl SecretFile {
    /// Write `secret` to a fresh keyfile under `dir`.
    pub fn create_in(dir: &Path, secret: &Secret) -> io::Result<Self> {
        let suffix = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0)
            ^ (u64::from(std::process::id()) << 32);
        let path = dir.join(format!(".migrun_keyfile_{suffix:016x}"));

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&path)?;
        file.write_all(secret.expose().as_bytes())?;
        file.sync_all()?;

        debug!(path = %path.display(), "Keyfile created");
        Ok(Self {
            path,
            size: secret.expose().len(),
        })
    }

    /// Keyfile in the system temp directory.
    pub fn create(secret: &Secret) -> io::Result<Self> {
        Self::create_in(&std::env::temp_dir(), secret)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SecretFile {
    fn drop(&mut self) {
        if let Ok(mut file) = OpenOptions::new().write(true).open(&self.path) {
            let _ = file.write_all(&vec![0u8; self.size]);
            let _ = file.sync_all();
        }
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Keyfile wiped"),
            Err(e) => warn!(path = %self.path.display(), %e, "Failed to remove keyfile"),
        }
    }
}

/// Shown in place of the keyfile path when no keyfile exists.
const KEYFILE_PLACEHOLDER: &str = "<keyfile>";

/// Credentials plus their keyfile, alive for the rest of the run.
#[derive(Debug)]
pub struct RemoteSession {
    pub credentials: Credentials,
    keyfile: Option<SecretFile>,
}

impl RemoteSession {
    pub fn open(credentials: Credentials) -> Result<Self> {
        let keyfile = SecretFile::create(&credentials.password)
            .map_err(|e| MigrationError::credentials(format!("cannot create keyfile: {e}")))?;
        Ok(Self {
            credentials,
            keyfile: Some(keyfile),
        })
    }

    /// Session for dry runs: builds the same commands but writes no keyfile.
    pub fn preview(credentials: Credentials) -> Self {
        Self {
            credentials,
            keyfile: None,
        }
    }

    pub fn keyfile(&self) -> Option<&Path> {
        self.keyfile.as_ref().map(SecretFile::path)
    }

    /// rsync argv for copying `source` to `destination` on the remote host.
    ///
    /// The password reaches `ssh` through `sshpass -f <keyfile>`; the `-e`
    /// value is split on whitespace by rsync itself, not by a shell.
    pub fn rsync_argv(&self, source: &str, destination: &str) -> Vec<String> {
        vec![
            "rsync".to_string(),
            "-avzh".to_string(),
            "--progress".to_string(),
            "-e".to_string(),
            format!(
                "sshpass -f {} ssh -o StrictHostKeyChecking=no",
                self.keyfile()
                    .map_or_else(|| KEYFILE_PLACEHOLDER.into(), |p| p.display().to_string())
            ),
            source.to_string(),
            self.credentials.remote_path(destination),
            "--rsync-path=sudo rsync".to_string(),
        ]
    }
}
