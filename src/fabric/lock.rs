use std::fs::{File, OpenOptions};
use std::path::Path;

use fs2::FileExt;

use crate::error::{Result, TychoError};

/// Advisory lock guarding a fabric directory for the lifetime of one
/// scheduler epoch. Released when dropped.
#[derive(Debug)]
pub struct EpochLock {
    _file: File,
}

impl EpochLock {
    /// Acquire the epoch lock at `<dir>/epoch.lock`. Fails with `Locked`
    /// if another scheduler already holds it.
    pub fn acquire(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join("epoch.lock");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        file.try_lock_exclusive()
            .map_err(|_| TychoError::Locked(path.display().to_string()))?;

        Ok(Self { _file: file })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn lock_is_exclusive_until_dropped() {
        let dir = tempdir().unwrap();

        let lock = EpochLock::acquire(dir.path()).unwrap();
        let err = EpochLock::acquire(dir.path()).unwrap_err();
        assert_eq!(err.code(), "locked");

        drop(lock);
        let _again = EpochLock::acquire(dir.path()).unwrap();
    }

    #[test]
    fn lock_creates_missing_directory() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("runtime");
        let _lock = EpochLock::acquire(&nested).unwrap();
        assert!(nested.join("epoch.lock").exists());
    }
}
