use std::path::Path;
use std::time::{Duration, SystemTime};

use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::Result;

/// Prefix shared by every scratch file the engine creates.
pub const TEMP_PREFIX: &str = "silo-tmp-";

/// Scratch files older than this are fair game for the startup sweeper.
pub const STALE_AGE: Duration = Duration::from_secs(30 * 24 * 3600);

/// Allocate a staging file in the system temp directory.
///
/// The file is unlinked on drop; files that outlive a crash are collected
/// by [`sweep_stale`] on the next start.
pub fn staging_file() -> Result<NamedTempFile> {
    let file = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .tempfile_in(std::env::temp_dir())?;
    Ok(file)
}

/// Delete leftover scratch files older than [`STALE_AGE`].
///
/// Failures are logged and skipped; a locked or vanished file must not stop
/// the operation that triggered the sweep.
pub fn sweep_stale() -> usize {
    sweep_stale_in(&std::env::temp_dir(), STALE_AGE)
}

pub fn sweep_stale_in(dir: &Path, max_age: Duration) -> usize {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            warn!(dir = %dir.display(), %err, "temp sweep skipped");
            return 0;
        }
    };

    let now = SystemTime::now();
    let mut removed = 0usize;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.starts_with(TEMP_PREFIX) {
            continue;
        }
        let stale = entry
            .metadata()
            .and_then(|meta| meta.modified())
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .map(|age| age > max_age)
            .unwrap_or(false);
        if stale && std::fs::remove_file(entry.path()).is_ok() {
            removed += 1;
        }
    }
    if removed > 0 {
        debug!(removed, "swept stale temp files");
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_sweep_removes_only_stale_prefixed_files() {
        let dir = tempfile::tempdir().unwrap();

        let stale = dir.path().join(format!("{TEMP_PREFIX}old"));
        fs::write(&stale, b"x").unwrap();
        let old = filetime_now_minus(40 * 24 * 3600);
        filetime::set_file_mtime(&stale, old).unwrap();

        let fresh = dir.path().join(format!("{TEMP_PREFIX}new"));
        fs::write(&fresh, b"x").unwrap();

        let unrelated = dir.path().join("keep.dat");
        fs::write(&unrelated, b"x").unwrap();
        filetime::set_file_mtime(&unrelated, old).unwrap();

        let removed = sweep_stale_in(dir.path(), STALE_AGE);
        assert_eq!(removed, 1);
        assert!(!stale.exists());
        assert!(fresh.exists());
        assert!(unrelated.exists());
    }

    fn filetime_now_minus(secs: i64) -> filetime::FileTime {
        let now = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64;
        filetime::FileTime::from_unix_time(now - secs, 0)
    }
}
