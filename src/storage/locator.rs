//! Storage directory selection with advisory locking.
//!
//! Several processes may point at the same base directory. Each one walks the
//! candidates `data`, `data1`, `data2`, ... and keeps the first directory whose
//! `.lock` file it can lock exclusively without blocking. The lock lives as
//! long as the returned [`StorageLease`].

use std::fs::{self, File, OpenOptions, TryLockError};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Number of candidate directories tried before giving up.
pub const CANDIDATE_LIMIT: usize = 1000;
/// Name of the unsuffixed candidate directory.
pub const DATA_DIR_NAME: &str = "data";
/// Lock file created inside each candidate directory.
pub const LOCK_FILE_NAME: &str = ".lock";

/// Error type for storage location.
#[derive(Debug, Error)]
pub enum LocateError {
    #[error("no lockable storage directory under {} after {attempts} candidates", root.display())]
    Exhausted { root: PathBuf, attempts: usize },
}

/// Names the storage area for one component and caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageScope {
    /// Base writable area (e.g. a per-user data directory)
    pub base: PathBuf,
    /// Component owning the storage
    pub component: String,
    /// Schema/version tag; bumping it moves to a fresh directory
    pub schema_version: String,
    /// Caller-supplied path fragment
    pub caller_id: String,
}

impl StorageScope {
    pub fn new(
        base: impl Into<PathBuf>,
        component: impl Into<String>,
        schema_version: impl Into<String>,
        caller_id: impl Into<String>,
    ) -> Self {
        Self {
            base: base.into(),
            component: component.into(),
            schema_version: schema_version.into(),
            caller_id: caller_id.into(),
        }
    }

    /// Directory that holds the `data[N]` candidates.
    pub fn root(&self) -> PathBuf {
        self.base.join(sanitize(&self.component)).join(format!(
            "{}-{}",
            sanitize(&self.schema_version),
            sanitize(&self.caller_id)
        ))
    }
}

/// Replace anything outside `[A-Za-z0-9._-]` so fragments stay one path component.
fn sanitize(fragment: &str) -> String {
    let cleaned: String = fragment
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => "_".repeat(cleaned.len().max(1)),
        _ => cleaned,
    }
}

/// Walks candidate directories and locks the first free one.
#[derive(Debug, Clone)]
pub struct StorageLocator {
    root: PathBuf,
    max_candidates: usize,
}

impl StorageLocator {
    /// Create a locator for the given scope.
    pub fn new(scope: &StorageScope) -> Self {
        Self {
            root: scope.root(),
            max_candidates: CANDIDATE_LIMIT,
        }
    }

    /// Limit the number of candidates tried.
    #[must_use]
    pub fn with_max_candidates(mut self, max_candidates: usize) -> Self {
        self.max_candidates = max_candidates;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the candidate directory at `index`.
    pub fn candidate(&self, index: usize) -> PathBuf {
        if index == 0 {
            self.root.join(DATA_DIR_NAME)
        } else {
            self.root.join(format!("{DATA_DIR_NAME}{index}"))
        }
    }

    /// Lock the first available candidate directory.
    ///
    /// Candidates that are locked elsewhere, or that fail to initialize, are
    /// skipped.
    ///
    /// # Errors
    ///
    /// Returns [`LocateError::Exhausted`] when no candidate could be locked.
    pub fn acquire(&self) -> Result<StorageLease, LocateError> {
        for index in 0..self.max_candidates {
            let dir = self.candidate(index);
            match try_lock_dir(&dir) {
                Ok(Some(file)) => {
                    tracing::info!(dir = %dir.display(), "Acquired storage directory lock");
                    return Ok(StorageLease {
                        dir,
                        file: Some(file),
                    });
                }
                Ok(None) => {
                    tracing::debug!(dir = %dir.display(), "Storage directory locked by another instance");
                }
                Err(e) => {
                    tracing::warn!(dir = %dir.display(), error = %e, "Failed to lock storage directory, trying next");
                }
            }
        }

        Err(LocateError::Exhausted {
            root: self.root.clone(),
            attempts: self.max_candidates,
        })
    }
}

/// Returns `Ok(None)` when the directory is held by someone else.
fn try_lock_dir(dir: &Path) -> io::Result<Option<File>> {
    fs::create_dir_all(dir)?;
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(dir.join(LOCK_FILE_NAME))?;

    match file.try_lock() {
        Ok(()) => {}
        Err(TryLockError::WouldBlock) => return Ok(None),
        Err(TryLockError::Error(e)) => return Err(e),
    }

    // Owner pid is informational only
    file.set_len(0)?;
    writeln!(file, "{}", std::process::id())?;
    Ok(Some(file))
}

/// Exclusive claim on one storage directory.
#[derive(Debug)]
pub struct StorageLease {
    dir: PathBuf,
    file: Option<File>,
}

impl StorageLease {
    /// The locked directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Release the lock.
    pub fn release(mut self) -> io::Result<()> {
        self.unlock()
    }

    fn unlock(&mut self) -> io::Result<()> {
        match self.file.take() {
            Some(file) => {
                file.unlock()?;
                tracing::info!(dir = %self.dir.display(), "Released storage directory lock");
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl Drop for StorageLease {
    fn drop(&mut self) {
        if let Err(e) = self.unlock() {
            tracing::warn!(dir = %self.dir.display(), error = %e, "Failed to release storage directory lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn scope(temp_dir: &TempDir) -> StorageScope {
        StorageScope::new(temp_dir.path(), "cistern", "v1", "tests")
    }

    #[test]
    fn test_candidate_naming() {
        let temp_dir = TempDir::new().unwrap();
        let locator = StorageLocator::new(&scope(&temp_dir));
        let root = temp_dir.path().join("cistern").join("v1-tests");

        assert_eq!(locator.candidate(0), root.join("data"));
        assert_eq!(locator.candidate(1), root.join("data1"));
        assert_eq!(locator.candidate(999), root.join("data999"));
    }

    #[test]
    fn test_scope_sanitizes_fragments() {
        let scope = StorageScope::new("/base", "my app", "v2", "../escape");
        assert_eq!(scope.root(), PathBuf::from("/base/my_app/v2-.._escape"));

        let scope = StorageScope::new("/base", "app", "v2", "..");
        assert_eq!(scope.root(), PathBuf::from("/base/app/v2-__"));
    }

    #[test]
    fn test_first_candidate_is_used_when_free() {
        let temp_dir = TempDir::new().unwrap();
        let locator = StorageLocator::new(&scope(&temp_dir));

        let lease = locator.acquire().unwrap();
        assert_eq!(lease.dir(), locator.candidate(0));
        assert!(lease.dir().join(LOCK_FILE_NAME).exists());
    }

    #[test]
    fn test_held_candidate_is_skipped() {
        let temp_dir = TempDir::new().unwrap();
        let locator = StorageLocator::new(&scope(&temp_dir));

        let first = locator.acquire().unwrap();
        let second = locator.acquire().unwrap();
        assert_eq!(first.dir(), locator.candidate(0));
        assert_eq!(second.dir(), locator.candidate(1));
    }

    #[test]
    fn test_released_candidate_is_reused() {
        let temp_dir = TempDir::new().unwrap();
        let locator = StorageLocator::new(&scope(&temp_dir));

        let first = locator.acquire().unwrap();
        first.release().unwrap();

        let again = locator.acquire().unwrap();
        assert_eq!(again.dir(), locator.candidate(0));
    }

    #[test]
    fn test_exhausted_candidates_reported() {
        let temp_dir = TempDir::new().unwrap();
        let locator = StorageLocator::new(&scope(&temp_dir)).with_max_candidates(2);

        let _a = locator.acquire().unwrap();
        let _b = locator.acquire().unwrap();
        let err = locator.acquire().unwrap_err();
        assert!(matches!(err, LocateError::Exhausted { attempts: 2, .. }));
    }

    #[test]
    fn test_uncreatable_candidate_is_skipped() {
        let temp_dir = TempDir::new().unwrap();
        let locator = StorageLocator::new(&scope(&temp_dir));

        // A plain file where the first candidate directory should be
        fs::create_dir_all(locator.root()).unwrap();
        fs::write(locator.candidate(0), b"not a directory").unwrap();

        let lease = locator.acquire().unwrap();
        assert_eq!(lease.dir(), locator.candidate(1));
    }
}
