use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use tracing::{debug, instrument};

use catalog::{Catalog, PlanFile, RestorePlan, PLAN_CONTENT};
use common::{hash, CancellationToken, EntryKind, Options, Result};
use volume::BlockConfig;

use crate::plan::kind_of;

/// Phase 2: reuse bytes already on disk before touching the remote.
///
/// Scans existing targets block-by-block; in overwrite mode the target is
/// truncated to its final size first, in rename mode a length mismatch
/// short-circuits to a fresh copy under a conflict name. With
/// `use_local_blocks`, the original source paths are scanned as a second
/// donor.
#[instrument(skip_all)]
pub(crate) fn reuse_local_data(
    catalog: &Catalog,
    plan: &RestorePlan,
    files: &mut [PlanFile],
    config: BlockConfig,
    options: &Options,
    token: &CancellationToken,
) -> Result<u64> {
    let mut reused_blocks = 0u64;

    for file in files.iter_mut() {
        common::check_cancelled(token)?;
        if kind_of(file) != EntryKind::File {
            continue;
        }
        let Some(target) = file.target_path.clone() else {
            continue;
        };
        let target_path = Path::new(&target);

        if target_path.exists() {
            if options.overwrite {
                reused_blocks +=
                    scan_existing_target(catalog, plan, file, target_path, config)?;
            } else {
                // Rename-on-conflict: an exact match needs no work at all;
                // anything else restores beside the original.
                let matches = target_matches_exactly(target_path, file, config)?;
                if matches {
                    for block in catalog.plan_pending_blocks_for_file(plan, file.file_id)? {
                        if block.kind == PLAN_CONTENT {
                            catalog.mark_plan_block_restored(
                                plan,
                                file.file_id,
                                PLAN_CONTENT,
                                block.index,
                            )?;
                            reused_blocks += 1;
                        }
                    }
                } else {
                    let conflict = format!("{target}.restored");
                    catalog.set_plan_target(plan, file.file_id, &conflict)?;
                    file.target_path = Some(conflict);
                }
            }
        }

        if options.use_local_blocks {
            reused_blocks += donate_from_source(catalog, plan, file, config)?;
        }
    }
    debug!(reused_blocks, "local reuse finished");
    Ok(reused_blocks)
}

/// Truncate the target to its final size and keep every block that already
/// hashes correctly.
fn scan_existing_target(
    catalog: &Catalog,
    plan: &RestorePlan,
    file: &PlanFile,
    target: &Path,
    config: BlockConfig,
) -> Result<u64> {
    clear_read_only(target)?;
    let handle = OpenOptions::new()
        .read(true)
        .write(true)
        .open(target)
        .map_err(|e| common::Error::path(target, e))?;
    handle.set_len(file.length as u64)?;

    let mut reused = 0u64;
    let mut reader = handle;
    for block in catalog.plan_pending_blocks_for_file(plan, file.file_id)? {
        if block.kind != PLAN_CONTENT {
            continue;
        }
        let offset = block.index as u64 * config.blocksize as u64;
        if read_block_at(&mut reader, offset, block.size as usize)
            .map(|bytes| hash::to_base64(&config.block_hash.digest(&bytes)) == block.hash)
            .unwrap_or(false)
        {
            catalog.mark_plan_block_restored(plan, file.file_id, PLAN_CONTENT, block.index)?;
            reused += 1;
        }
    }
    Ok(reused)
}

/// Whole-file comparison for rename mode: length plus full hash.
fn target_matches_exactly(target: &Path, file: &PlanFile, config: BlockConfig) -> Result<bool> {
    let meta = std::fs::metadata(target).map_err(|e| common::Error::path(target, e))?;
    if meta.len() != file.length as u64 {
        return Ok(false);
    }
    let Some(expected) = &file.full_hash else {
        return Ok(false);
    };
    let (_, actual) = volume::hash_file(config.file_hash, target)?;
    Ok(&actual == expected)
}

/// Satisfy pending blocks from the file's original source path.
fn donate_from_source(
    catalog: &Catalog,
    plan: &RestorePlan,
    file: &PlanFile,
    config: BlockConfig,
) -> Result<u64> {
    let source = Path::new(&file.path);
    let Some(target) = &file.target_path else {
        return Ok(0);
    };
    if !source.exists() || source == Path::new(target) {
        return Ok(0);
    }
    let Ok(mut donor) = File::open(source) else {
        return Ok(0);
    };

    let pending = catalog.plan_pending_blocks_for_file(plan, file.file_id)?;
    let mut writer: Option<File> = None;
    let mut reused = 0u64;
    for block in pending {
        if block.kind != PLAN_CONTENT {
            continue;
        }
        let offset = block.index as u64 * config.blocksize as u64;
        let Ok(bytes) = read_block_at(&mut donor, offset, block.size as usize) else {
            continue;
        };
        if hash::to_base64(&config.block_hash.digest(&bytes)) != block.hash {
            continue;
        }
        let out = match &mut writer {
            Some(out) => out,
            None => {
                let handle = open_for_patching(Path::new(target), file.length as u64)?;
                writer.insert(handle)
            }
        };
        out.seek(SeekFrom::Start(offset))?;
        out.write_all(&bytes)?;
        catalog.mark_plan_block_restored(plan, file.file_id, PLAN_CONTENT, block.index)?;
        reused += 1;
    }
    Ok(reused)
}

pub(crate) fn open_for_patching(target: &Path, length: u64) -> Result<File> {
    clear_read_only(target)?;
    let handle = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(target)
        .map_err(|e| common::Error::path(target, e))?;
    handle.set_len(length)?;
    Ok(handle)
}

/// Overwrite must succeed even when the previous copy was read-only.
fn clear_read_only(target: &Path) -> Result<()> {
    if let Ok(meta) = std::fs::metadata(target) {
        let mut perms = meta.permissions();
        if perms.readonly() {
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                perms.set_mode(perms.mode() | 0o200);
            }
            #[cfg(not(unix))]
            perms.set_readonly(false);
            std::fs::set_permissions(target, perms)
                .map_err(|e| common::Error::path(target, e))?;
        }
    }
    Ok(())
}

fn read_block_at(file: &mut File, offset: u64, size: usize) -> std::io::Result<Vec<u8>> {
    file.seek(SeekFrom::Start(offset))?;
    let mut bytes = vec![0u8; size];
    file.read_exact(&mut bytes)?;
    Ok(bytes)
}
