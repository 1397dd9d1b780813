//! Replica data directory.
//!
//! ```text
//! <data_dir>/
//! ├─ LOCK           # Advisory lock, one process per replica
//! └─ commands.log   # Command log
//! ```

use crate::config::StoreConfig;
use crate::error::{CoreError, CoreResult};
use crate::store::CommandStore;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "LOCK";
const COMMANDS_FILE: &str = "commands.log";

/// An exclusively locked replica directory.
///
/// The lock is released when this value is dropped, so keep it alive for as
/// long as any store opened from it.
#[derive(Debug)]
pub struct DataDir {
    path: PathBuf,
    _lock_file: File,
}

impl DataDir {
    /// Opens or creates the directory and takes its lock.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::StoreLocked`] if another process holds the lock,
    /// or an I/O error.
    pub fn open(path: &Path) -> CoreResult<Self> {
        fs::create_dir_all(path)?;
        if !path.is_dir() {
            return Err(CoreError::invalid_operation(format!(
                "not a directory: {}",
                path.display()
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(CoreError::StoreLocked);
        }

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// Root of the directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the command log.
    #[must_use]
    pub fn commands_path(&self) -> PathBuf {
        self.path.join(COMMANDS_FILE)
    }

    /// Opens the command log inside this directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be opened or recovered.
    pub fn open_store(&self, config: StoreConfig) -> CoreResult<CommandStore> {
        CommandStore::open_file(&self.commands_path(), config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn second_open_is_locked_out() {
        let dir = tempdir().unwrap();
        let first = DataDir::open(dir.path()).unwrap();
        assert!(matches!(DataDir::open(dir.path()), Err(CoreError::StoreLocked)));

        drop(first);
        assert!(DataDir::open(dir.path()).is_ok());
    }

    #[test]
    fn store_lives_in_directory() {
        let dir = tempdir().unwrap();
        let data = DataDir::open(&dir.path().join("replica")).unwrap();
        let store = data.open_store(StoreConfig::default()).unwrap();
        assert!(data.commands_path().exists());
        assert_ne!(store.origin_id(), 0);
    }
}
