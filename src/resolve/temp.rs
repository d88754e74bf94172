//! Temporary artifacts for downloaded and generated scripts.
//!
//! Every path handed out by [`TempArtifactManager::allocate`] is registered and
//! deleted by [`TempArtifactManager::finalize`], which also runs on drop.
//! Deletion is best-effort: failures are logged at debug level only.

use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::debug;

use crate::error::{FleetError, Result};

/// Length of the random run identifier embedded in artifact names.
const RUN_ID_LEN: usize = 8;

/// Allocates and cleans up uniquely named scratch files for one invocation.
#[derive(Debug)]
pub struct TempArtifactManager {
    dir: PathBuf,
    run_id: String,
    counter: AtomicU64,
    registry: Mutex<Vec<PathBuf>>,
}

impl TempArtifactManager {
    /// Creates a manager that places artifacts under `dir`.
    ///
    /// The directory is created on first allocation.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let run_id: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(RUN_ID_LEN)
            .map(char::from)
            .collect();

        Self {
            dir: dir.into(),
            run_id,
            counter: AtomicU64::new(0),
            registry: Mutex::new(Vec::new()),
        }
    }

    /// The scratch directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The random identifier shared by all artifacts of this invocation.
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Creates a new empty file named `{prefix}{run_id}-{n}.sql` and registers it.
    pub fn allocate(&self, prefix: &str) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir).map_err(|e| {
            FleetError::internal(format!(
                "Failed to create scratch directory {}: {e}",
                self.dir.display()
            ))
        })?;

        loop {
            let n = self.counter.fetch_add(1, Ordering::SeqCst);
            let path = self.dir.join(format!("{prefix}{}-{n}.sql", self.run_id));

            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => {
                    self.registry_lock().push(path.clone());
                    debug!(path = %path.display(), "Allocated temporary artifact");
                    return Ok(path);
                }
                // A leftover from an earlier run with the same id; take the next number.
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    return Err(FleetError::internal(format!(
                        "Failed to create temporary file {}: {e}",
                        path.display()
                    )))
                }
            }
        }
    }

    /// Allocates an artifact and writes `contents` into it.
    pub fn write_artifact(&self, prefix: &str, contents: &str) -> Result<PathBuf> {
        let path = self.allocate(prefix)?;
        fs::write(&path, contents).map_err(|e| {
            FleetError::internal(format!("Failed to write {}: {e}", path.display()))
        })?;
        Ok(path)
    }

    /// Paths allocated and not yet cleaned up.
    pub fn artifacts(&self) -> Vec<PathBuf> {
        self.registry_lock().clone()
    }

    /// Deletes every registered artifact and returns how many were removed.
    ///
    /// Safe to call more than once.
    pub fn finalize(&self) -> usize {
        let paths: Vec<PathBuf> = self.registry_lock().drain(..).collect();
        let mut removed = 0;
        for path in paths {
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => debug!(
                    path = %path.display(),
                    error = %e,
                    "Could not remove temporary artifact"
                ),
            }
        }
        if removed > 0 {
            debug!(removed, run_id = %self.run_id, "Cleaned up temporary artifacts");
        }
        removed
    }

    fn registry_lock(&self) -> std::sync::MutexGuard<'_, Vec<PathBuf>> {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for TempArtifactManager {
    fn drop(&mut self) {
        self.finalize();
    }
}
