use std::path::Path;

use tracing::{instrument, warn};

use catalog::PlanFile;
use common::{EntryKind, FileMetadata, Result};
use volume::BlockConfig;

use crate::plan::kind_of;
use crate::RestoreOutcome;

/// Phase 4: apply metadata blobs to the restored tree and optionally
/// verify restored files end-to-end.
#[instrument(skip_all)]
pub(crate) fn apply_metadata(
    files: &[PlanFile],
    outcome: &mut RestoreOutcome,
    config: BlockConfig,
    verify_files: bool,
) -> Result<(u64, u64)> {
    let mut applied = 0u64;
    let mut verified = 0u64;

    for file in files {
        let Some(target) = &file.target_path else {
            continue;
        };
        if outcome.broken.contains_key(&file.file_id) {
            continue;
        }

        // Zero-length files have no blocks for the patchers to write.
        if kind_of(file) == EntryKind::File && file.length == 0 {
            let path = Path::new(target);
            if !path.exists() {
                if let Err(err) = std::fs::File::create(path) {
                    outcome.warnings.push(format!("{target}: create ({err})"));
                    continue;
                }
            }
        }

        let blob: Vec<u8> = outcome
            .metadata_parts
            .get(&file.file_id)
            .map(|parts| parts.values().flatten().copied().collect())
            .unwrap_or_default();
        let metadata = if blob.is_empty() {
            None
        } else {
            match FileMetadata::from_bytes(&blob) {
                Ok(metadata) => Some(metadata),
                Err(err) => {
                    warn!(path = %target, %err, "unreadable metadata blob");
                    outcome
                        .warnings
                        .push(format!("{target}: unreadable metadata ({err})"));
                    None
                }
            }
        };

        match kind_of(file) {
            EntryKind::Symlink => {
                if let Some(link_target) =
                    metadata.as_ref().and_then(|m| m.symlink_target.clone())
                {
                    if let Err(err) = place_symlink(Path::new(target), &link_target) {
                        warn!(path = %target, %err, "symlink restore failed");
                        outcome.warnings.push(format!("{target}: {err}"));
                        continue;
                    }
                    applied += 1;
                } else {
                    outcome
                        .warnings
                        .push(format!("{target}: symlink without a stored target"));
                }
                continue;
            }
            EntryKind::Folder | EntryKind::File => {}
        }

        if let Some(metadata) = metadata {
            let path = Path::new(target);
            #[cfg(unix)]
            if let Some(mode) = metadata.mode {
                use std::os::unix::fs::PermissionsExt;
                if let Err(err) =
                    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
                {
                    outcome.warnings.push(format!("{target}: permissions ({err})"));
                }
            }
            let mtime = filetime::FileTime::from_unix_time(metadata.mtime, 0);
            if let Err(err) = filetime::set_file_mtime(path, mtime) {
                outcome.warnings.push(format!("{target}: timestamp ({err})"));
            }
            applied += 1;
        }

        if verify_files && kind_of(file) == EntryKind::File {
            match verify_restored(Path::new(target), file, config) {
                Ok(true) => verified += 1,
                Ok(false) => {
                    outcome
                        .broken
                        .insert(file.file_id, "restored bytes fail the file hash".into());
                }
                Err(err) => {
                    outcome.warnings.push(format!("{target}: verification ({err})"));
                }
            }
        }
    }
    Ok((applied, verified))
}

fn place_symlink(target: &Path, link_target: &str) -> std::io::Result<()> {
    if target.symlink_metadata().is_ok() {
        std::fs::remove_file(target)?;
    }
    #[cfg(unix)]
    {
        std::os::unix::fs::symlink(link_target, target)
    }
    #[cfg(not(unix))]
    {
        // Symlink restoration needs platform support; record the target
        // as a plain file containing the link text.
        std::fs::write(target, link_target)
    }
}

/// Full end-to-end hash of a restored file against the catalog record.
pub(crate) fn verify_restored(target: &Path, file: &PlanFile, config: BlockConfig) -> Result<bool> {
    let Some(expected) = &file.full_hash else {
        return Ok(true);
    };
    let (size, actual) = volume::hash_file(config.file_hash, target)?;
    Ok(size == file.length && &actual == expected)
}
