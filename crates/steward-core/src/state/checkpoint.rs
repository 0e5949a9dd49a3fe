//! Durable checkpointing of the state document.
//!
//! A checkpoint serializes the full document to `state.json` only when the
//! dirty counter moved since the last successful write. The write is atomic
//! from the consumer's point of view: the document is written to a temporary
//! file in the same directory, synced, and renamed over the previous copy.
//! A write that fails partway leaves the prior durable copy readable and the
//! in-memory state dirty, so the next attempt retries the same data.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, trace};

use super::{State, StateHandle};

/// File name of the durable state document inside the state directory.
pub const STATE_FILE: &str = "state.json";

/// Errors that can occur while loading or writing checkpoints.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// I/O error reading or writing the document.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The document could not be serialized or deserialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The document decoded but its change/task graph is inconsistent.
    #[error("corrupt state document: {0}")]
    Corrupt(String),
}

/// Writes and loads durable snapshots of the state document.
#[derive(Debug)]
pub struct Checkpointer {
    path: PathBuf,
    last_dirty: u64,
}

impl Checkpointer {
    /// Creates a checkpointer rooted at `state_dir`.
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        Self {
            path: state_dir.as_ref().join(STATE_FILE),
            last_dirty: 0,
        }
    }

    /// Path of the durable document.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the durable document, or returns a fresh state when none
    /// exists yet.
    ///
    /// Crash-interrupted statuses are normalized so work left in flight is
    /// redispatched (`Doing -> Do`, `Undoing -> Undo`), and the graph is
    /// validated: a document with dangling change/task references is
    /// rejected rather than silently repaired.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read, decoded, or
    /// fails integrity validation.
    pub fn load(&mut self) -> Result<State, CheckpointError> {
        let content = match fs::read(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no state document, starting fresh");
                self.last_dirty = 0;
                return Ok(State::new());
            },
            Err(err) => return Err(err.into()),
        };

        let mut state: State = serde_json::from_slice(&content)?;
        state.check_integrity().map_err(CheckpointError::Corrupt)?;
        state.normalize_after_load();
        self.last_dirty = state.dirty();
        debug!(path = %self.path.display(), "loaded state document");
        Ok(state)
    }

    /// Writes a checkpoint if the document changed since the last
    /// successful one. Returns whether a write happened.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the atomic replacement fails;
    /// in that case the previous durable copy remains valid and the next
    /// call retries.
    pub fn checkpoint(&mut self, handle: &StateHandle) -> Result<bool, CheckpointError> {
        let (serialized, dirty) = {
            let state = handle.lock();
            if state.dirty() == self.last_dirty {
                trace!("state unchanged, skipping checkpoint");
                return Ok(false);
            }
            (serde_json::to_vec_pretty(&*state)?, state.dirty())
        };

        self.write_atomic(&serialized)?;
        self.last_dirty = dirty;
        debug!(path = %self.path.display(), bytes = serialized.len(), "checkpointed state");
        Ok(true)
    }

    fn write_atomic(&self, content: &[u8]) -> Result<(), CheckpointError> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        fs::create_dir_all(&dir)?;

        let tmp_path = self.path.with_extension("json.tmp");
        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(content)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;

        // Make the rename itself durable.
        #[cfg(unix)]
        File::open(&dir)?.sync_all()?;

        Ok(())
    }
}
