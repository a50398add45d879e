use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::{Error, Result};

const LOCK_NAME: &str = ".silo-operation.lock";

/// Destination-scoped operation lock.
///
/// Created next to the catalog file; at most one operation may hold it per
/// backup destination. The file is unlinked on drop.
#[derive(Debug)]
pub struct OperationLock {
    path: PathBuf,
}

impl OperationLock {
    pub fn acquire(catalog_dir: &Path) -> Result<Self> {
        let path = catalog_dir.join(LOCK_NAME);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                let _ = writeln!(file, "{}", std::process::id());
                Ok(Self { path })
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let holder = fs::read_to_string(&path).unwrap_or_default();
                Err(Error::user(format!(
                    "another operation (pid {}) holds the lock at {}; \
                     remove the file if that process is gone",
                    holder.trim(),
                    path.display()
                )))
            }
            Err(err) => Err(Error::path(path, err)),
        }
    }
}

impl Drop for OperationLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), %err, "failed to release operation lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_is_exclusive_and_released() {
        let dir = tempfile::tempdir().unwrap();

        let lock = OperationLock::acquire(dir.path()).unwrap();
        let contended = OperationLock::acquire(dir.path());
        assert!(matches!(contended, Err(Error::UserInformation(_))));

        drop(lock);
        let reacquired = OperationLock::acquire(dir.path());
        assert!(reacquired.is_ok());
    }
}
