use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, instrument, warn};

use catalog::{RestorePlan, PLAN_METADATA};
use common::{check_cancelled, CancellationToken, Error, FileId, Result, VolumeId};
use remote::{RemoteManager, SharedCatalog};
use volume::{BlockConfig, BlockVolumeReader, RemoteName};

use crate::local::open_for_patching;
use crate::RestoreOutcome;

/// Phase 3, legacy flavor: one volume at a time, every waiting file patched
/// in place as the volume's blocks stream by.
#[instrument(skip_all)]
pub(crate) async fn patch_sequentially(
    catalog: &SharedCatalog,
    manager: &Arc<RemoteManager>,
    plan: &RestorePlan,
    config: BlockConfig,
    check_manifests: bool,
    token: &CancellationToken,
    outcome: &mut RestoreOutcome,
) -> Result<()> {
    // target path and final length per file, resolved once.
    let placement: HashMap<FileId, (String, i64)> = {
        let guard = catalog.lock().await;
        guard
            .plan_files(plan)?
            .into_iter()
            .filter_map(|f| f.target_path.clone().map(|t| (f.file_id, (t, f.length))))
            .collect()
    };
    let mut open_files: HashMap<FileId, File> = HashMap::new();

    loop {
        check_cancelled(token)?;
        let volumes = {
            let guard = catalog.lock().await;
            guard.plan_pending_volumes(plan)?
        };
        let Some(volume_id) = volumes.into_iter().next() else {
            break;
        };
        patch_from_volume(
            catalog,
            manager,
            plan,
            config,
            check_manifests,
            token,
            volume_id,
            &placement,
            &mut open_files,
            outcome,
        )
        .await?;
    }
    for (_, file) in open_files {
        file.sync_all()?;
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn patch_from_volume(
    catalog: &SharedCatalog,
    manager: &Arc<RemoteManager>,
    plan: &RestorePlan,
    config: BlockConfig,
    check_manifests: bool,
    token: &CancellationToken,
    volume_id: VolumeId,
    placement: &HashMap<FileId, (String, i64)>,
    open_files: &mut HashMap<FileId, File>,
    outcome: &mut RestoreOutcome,
) -> Result<()> {
    let (name, pending) = {
        let guard = catalog.lock().await;
        let row = guard
            .volume_by_id(volume_id)?
            .ok_or_else(|| Error::consistency(format!("plan names unknown volume {}", volume_id.0)))?;
        (row.name, guard.plan_pending_blocks_in_volume(plan, volume_id)?)
    };
    if pending.is_empty() {
        return Ok(());
    }
    debug!(volume = %name, blocks = pending.len(), "patching from volume");

    let staging = manager.download_volume(catalog, &name).await?;
    let container = RemoteName::parse(&name)?.container;
    let mut reader = BlockVolumeReader::open(staging.path(), container, config, check_manifests)?;

    for block in pending {
        check_cancelled(token)?;
        let payload = match reader.read_block_verified(&block.hash, block.size) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(hash = %block.hash, %err, "block unusable, file will be broken");
                outcome
                    .broken
                    .entry(block.file_id)
                    .or_insert_with(|| err.to_string());
                // Marked restored anyway so the volume loop terminates; the
                // file is already recorded as broken.
                let guard = catalog.lock().await;
                guard.mark_plan_block_restored(plan, block.file_id, block.kind, block.index)?;
                continue;
            }
        };

        if block.kind == PLAN_METADATA {
            outcome
                .metadata_parts
                .entry(block.file_id)
                .or_insert_with(BTreeMap::new)
                .insert(block.index, payload);
        } else if let Some((target, length)) = placement.get(&block.file_id) {
            let handle = match open_files.entry(block.file_id) {
                std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
                std::collections::hash_map::Entry::Vacant(entry) => {
                    entry.insert(open_for_patching(Path::new(target), *length as u64)?)
                }
            };
            handle.seek(SeekFrom::Start(block.index as u64 * config.blocksize as u64))?;
            handle.write_all(&payload)?;
        }

        let guard = catalog.lock().await;
        guard.mark_plan_block_restored(plan, block.file_id, block.kind, block.index)?;
    }
    Ok(())
}
