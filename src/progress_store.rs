//! Progress Store
//!
//! Persists the id of the last successfully completed step so that a run can be
//! resumed after a crash, kill or cancellation.
//!
//! # Record Format
//!
//! ```json
//! {"current_step": 12}
//! ```
//!
//! # Durability
//!
//! `save` writes the record to `<path>.tmp`, fsyncs it, renames it over the
//! real record and fsyncs the directory. A crash at any point leaves either the
//! previous record or the new one; a half-written `.tmp` is never read.
//!
//! A missing record means "start from the beginning". A record that exists but
//! cannot be parsed is a hard error: guessing a resume point could either
//! re-run destructive steps or skip required ones.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::catalog::StepId;
use crate::error::{MigrationError, Result};

/// Durable record of the last completed step.
pub trait ProgressStore {
    /// Last completed step, or `None` if no step has ever completed.
    fn load(&self) -> Result<Option<StepId>>;

    /// Record `step` as the last completed step.
    fn save(&mut self, step: StepId) -> Result<()>;

    /// Forget all progress.
    fn clear(&mut self) -> Result<()>;

    /// Human-readable location of the record, for messages.
    fn location(&self) -> String;
}

#[derive(Debug, Serialize, Deserialize)]
struct ProgressRecord {
    current_step: StepId,
}

/// JSON file backed progress store.
#[derive(Debug, Clone)]
pub struct FileProgressStore {
    path: PathBuf,
}

impl FileProgressStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the scratch file used during `save`.
    pub fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn unwritable(&self, step: StepId, reason: impl std::fmt::Display) -> MigrationError {
        MigrationError::StoreUnwritable {
            step,
            path: self.path.clone(),
            reason: reason.to_string(),
        }
    }

    fn write_atomically(&self, step: StepId, bytes: &[u8]) -> std::io::Result<()> {
        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)?;

        let tmp = self.temp_path();
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;

        // Persist the rename itself
        if let Ok(dir) = File::open(&parent) {
            let _ = dir.sync_all();
        }
        debug!(step, path = %self.path.display(), "Progress record written");
        Ok(())
    }
}

impl ProgressStore for FileProgressStore {
    fn load(&self) -> Result<Option<StepId>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(MigrationError::StoreCorrupt {
                    path: self.path.clone(),
                    reason: format!("unreadable: {e}"),
                });
            }
        };

        let record: ProgressRecord =
            serde_json::from_str(&content).map_err(|e| MigrationError::StoreCorrupt {
                path: self.path.clone(),
                reason: e.to_string(),
            })?;
        Ok(Some(record.current_step))
    }

    fn save(&mut self, step: StepId) -> Result<()> {
        let bytes = serde_json::to_vec(&ProgressRecord { current_step: step })
            .map_err(|e| self.unwritable(step, e))?;
        self.write_atomically(step, &bytes)
            .map_err(|e| self.unwritable(step, e))
    }

    fn clear(&mut self) -> Result<()> {
        for path in [self.path.clone(), self.temp_path()] {
            match fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "Removed progress file"),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}

/// Volatile store used for dry runs and tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryProgressStore {
    current: Option<StepId>,
    saves: Vec<StepId>,
}

impl MemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store that starts as if `step` had already completed.
    pub fn starting_at(step: Option<StepId>) -> Self {
        Self {
            current: step,
            saves: Vec::new(),
        }
    }

    /// Every id passed to `save`, in order.
    pub fn saves(&self) -> &[StepId] {
        &self.saves
    }
}

impl ProgressStore for MemoryProgressStore {
    fn load(&self) -> Result<Option<StepId>> {
        Ok(self.current)
    }

    fn save(&mut self, step: StepId) -> Result<()> {
        self.current = Some(step);
        self.saves.push(step);
        Ok(())
    }

    fn clear(&mut self) -> Result<()> {
        self.current = None;
        Ok(())
    }

    fn location(&self) -> String {
        "<memory>".to_string()
    }
}
