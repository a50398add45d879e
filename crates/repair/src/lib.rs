//! Repair: rebuild the catalog from the remote volumes, reconcile a
//! diverged catalog against the listing, and handle broken files.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{info, instrument, warn};

use common::{
    check_cancelled, hash, CancellationToken, EntryKind, Error, Options, Result, VolumeState,
    VolumeType,
};
use remote::{commit_point, RemoteManager, SharedCatalog};
use volume::{
    BlockConfig, BlockVolumeReader, FilesetVolumeReader, IndexVolumeReader, RemoteName,
};

mod broken;
mod verify;

pub use broken::{list_affected, list_broken, purge_broken_files, BrokenEntry};
pub use verify::{run_test, TestReport};

/// Outcome of one repair run.
#[derive(Debug, Default)]
pub struct RepairReport {
    pub filesets_rebuilt: usize,
    pub volumes_registered: usize,
    pub blocks_registered: usize,
    pub partial: bool,
    pub warnings: Vec<String>,
}

/// Rebuild an empty catalog from the remote listing, or reconcile an
/// existing one against it.
#[instrument(skip_all)]
pub async fn run_repair(
    options: Arc<Options>,
    catalog: SharedCatalog,
    manager: Arc<RemoteManager>,
    token: CancellationToken,
) -> Result<RepairReport> {
    let has_volumes = {
        let guard = catalog.lock().await;
        !guard.list_volumes()?.is_empty()
    };
    if has_volumes {
        reconcile(&options, &catalog, &manager).await
    } else {
        recreate(&options, &catalog, &manager, &token).await
    }
}

/// Reconcile a diverged catalog: purge records of volumes the remote no
/// longer has and report files that lost data on the way.
async fn reconcile(
    options: &Options,
    catalog: &SharedCatalog,
    manager: &Arc<RemoteManager>,
) -> Result<RepairReport> {
    let mut report = RepairReport::default();
    let delta = manager.verify_remote_listing(catalog, true).await?;

    commit_point(catalog, |cat| {
        for row in &delta.missing {
            match row.kind {
                VolumeType::Blocks => {
                    let purged = cat.purge_blocks_of_volume(row.id)?;
                    warn!(name = %row.name, purged, "blocks volume lost remotely");
                    report
                        .warnings
                        .push(format!("{}: lost, purged {purged} files", row.name));
                }
                VolumeType::Files => {
                    if let Some(fileset) = cat.fileset_for_volume(row.id)? {
                        cat.drop_filesets(&[fileset.id], 0)?;
                        // The row is already gone remotely; finish it off.
                        cat.set_volume_state(row.id, VolumeState::Deleted)?;
                        cat.remove_volume(row.id)?;
                        warn!(name = %row.name, "fileset dropped with its lost dlist");
                    } else {
                        cat.remove_volume(row.id)?;
                    }
                }
                VolumeType::Index => {
                    cat.remove_volume(row.id)?;
                }
            }
        }
        Ok(())
    })
    .await?;

    for extra in &delta.extra {
        if options.auto_cleanup {
            manager.backend().delete(&extra.name).await?;
            info!(name = %extra.name, "deleted unknown remote file");
        } else {
            report
                .warnings
                .push(format!("{}: unknown remote file", extra.name));
        }
    }

    let (blocksize, block_hash, _) = {
        let guard = catalog.lock().await;
        guard.stored_block_config()?
    };
    {
        let guard = catalog.lock().await;
        guard.verify_consistency(blocksize, block_hash.digest_len(), false)?;
    }
    Ok(report)
}

/// Rebuild everything from dlists and dindexes, touching dblocks only when
/// index data is missing.
async fn recreate(
    options: &Options,
    catalog: &SharedCatalog,
    manager: &Arc<RemoteManager>,
    token: &CancellationToken,
) -> Result<RepairReport> {
    let mut report = RepairReport::default();
    let config = {
        let guard = catalog.lock().await;
        let (blocksize, block_hash, file_hash) = guard.stored_block_config()?;
        BlockConfig {
            blocksize,
            block_hash,
            file_hash,
        }
    };

    let listing = {
        let mut named: Vec<(RemoteName, String, i64)> = Vec::new();
        for file in manager.backend().list().await? {
            if let Ok(parsed) = RemoteName::parse(&file.name) {
                if parsed.prefix == options.prefix {
                    named.push((parsed, file.name, file.size));
                }
            }
        }
        named
    };
    if listing.is_empty() {
        return Err(Error::RemoteList(
            "the destination holds no volumes to rebuild from".into(),
        ));
    }

    {
        let mut guard = catalog.lock().await;
        guard.begin()?;
    }
    let rebuilt = rebuild_from_listing(
        options, catalog, manager, config, token, &listing, &mut report,
    )
    .await;
    {
        let mut guard = catalog.lock().await;
        match &rebuilt {
            Ok(()) => guard.commit()?,
            Err(_) => guard.rollback()?,
        }
    }
    rebuilt?;

    {
        let guard = catalog.lock().await;
        if report.partial {
            guard.set_partially_recreated(true)?;
            warn!("rebuild is partial; consistency checks deferred to the next full repair");
        } else {
            guard.verify_consistency(config.blocksize, config.block_hash.digest_len(), true)?;
        }
    }
    info!(
        filesets = report.filesets_rebuilt,
        volumes = report.volumes_registered,
        blocks = report.blocks_registered,
        partial = report.partial,
        "catalog rebuilt"
    );
    Ok(report)
}

async fn rebuild_from_listing(
    options: &Options,
    catalog: &SharedCatalog,
    manager: &Arc<RemoteManager>,
    config: BlockConfig,
    token: &CancellationToken,
    listing: &[(RemoteName, String, i64)],
    report: &mut RepairReport,
) -> Result<()> {
    let mut blocklist_payloads: HashMap<String, Vec<u8>> = HashMap::new();
    let mut indexed_dblocks: HashSet<String> = HashSet::new();

    // Pass 1: dindexes establish volumes, blocks and blocklists.
    for (parsed, name, _) in listing.iter().filter(|(p, _, _)| p.kind == VolumeType::Index) {
        check_cancelled(token)?;
        let staging = match manager.download_raw(name).await {
            Ok(staging) => staging,
            Err(err) => {
                warn!(%name, %err, "dindex unreadable");
                report.warnings.push(format!("{name}: {err}"));
                report.partial = true;
                continue;
            }
        };
        let mut reader = IndexVolumeReader::open(
            staging.path(),
            parsed.container,
            config,
            !options.disable_filelist_consistency_checks,
        )?;

        let guard = catalog.lock().await;
        let index_volume =
            guard.register_volume(name, VolumeType::Index, VolumeState::Verified)?;
        report.volumes_registered += 1;
        for record in reader.volumes()? {
            let block_volume = match guard.volume_by_name(&record.volumename)? {
                Some(existing) => existing.id,
                None => {
                    let id = guard.register_volume(
                        &record.volumename,
                        VolumeType::Blocks,
                        VolumeState::Verified,
                    )?;
                    guard.set_volume_info(id, record.volumesize, &record.volumehash)?;
                    report.volumes_registered += 1;
                    id
                }
            };
            guard.add_index_link(index_volume, block_volume)?;
            for block in &record.blocks {
                let (_, created) = guard.register_block(&block.hash, block.size, block_volume)?;
                if created {
                    report.blocks_registered += 1;
                }
            }
            indexed_dblocks.insert(record.volumename.clone());
        }
        drop(guard);
        for (list_hash, payload) in reader.blocklists()? {
            // Blocklists must hash back to their name before anything
            // trusts them.
            let computed = hash::to_base64(&config.block_hash.digest(&payload));
            if computed != list_hash {
                report
                    .warnings
                    .push(format!("blocklist {list_hash} fails its hash"));
                report.partial = true;
                continue;
            }
            blocklist_payloads.insert(list_hash, payload);
        }
    }

    // Pass 2: dblocks with no index coverage are scanned directly.
    for (parsed, name, _) in listing.iter().filter(|(p, _, _)| p.kind == VolumeType::Blocks) {
        if indexed_dblocks.contains(name) {
            continue;
        }
        check_cancelled(token)?;
        warn!(%name, "no index data; scanning dblock directly");
        let staging = match manager.download_raw(name).await {
            Ok(staging) => staging,
            Err(err) => {
                report.warnings.push(format!("{name}: {err}"));
                report.partial = true;
                continue;
            }
        };
        let mut reader = BlockVolumeReader::open(
            staging.path(),
            parsed.container,
            config,
            !options.disable_filelist_consistency_checks,
        )?;
        let (size, volume_hash) = volume::hash_file(config.file_hash, staging.path())?;

        let guard = catalog.lock().await;
        let block_volume = guard.register_volume(name, VolumeType::Blocks, VolumeState::Verified)?;
        guard.set_volume_info(block_volume, size, &volume_hash)?;
        report.volumes_registered += 1;
        drop(guard);

        for block_hash in reader.block_hashes()? {
            let payload = reader.read_block(&block_hash)?;
            let computed = hash::to_base64(&config.block_hash.digest(&payload));
            if computed != block_hash {
                report
                    .warnings
                    .push(format!("{name}: block {block_hash} fails its hash"));
                report.partial = true;
                continue;
            }
            let guard = catalog.lock().await;
            let (_, created) =
                guard.register_block(&block_hash, payload.len() as i64, block_volume)?;
            if created {
                report.blocks_registered += 1;
            }
            // Recover blocklist payloads for multi-block reconstruction.
            if payload.len() % config.block_hash.digest_len() == 0 && !payload.is_empty() {
                blocklist_payloads.entry(block_hash).or_insert(payload);
            }
        }
    }

    // Pass 3: dlists rebuild filesets, files and blocksets.
    let mut dlists: Vec<&(RemoteName, String, i64)> = listing
        .iter()
        .filter(|(p, _, _)| p.kind == VolumeType::Files)
        .collect();
    dlists.sort_by_key(|(p, _, _)| p.timestamp);
    for (parsed, name, _) in dlists {
        check_cancelled(token)?;
        let staging = match manager.download_raw(name).await {
            Ok(staging) => staging,
            Err(err) => {
                warn!(%name, %err, "dlist unreadable");
                report.warnings.push(format!("{name}: {err}"));
                report.partial = true;
                continue;
            }
        };
        let mut reader = FilesetVolumeReader::open(
            staging.path(),
            parsed.container,
            config,
            !options.disable_filelist_consistency_checks,
        )?;
        let is_full = reader.is_full_backup()?;
        let entries = reader.entries()?;
        let (size, volume_hash) = volume::hash_file(config.file_hash, staging.path())?;

        let guard = catalog.lock().await;
        let volume = guard.register_volume(name, VolumeType::Files, VolumeState::Verified)?;
        guard.set_volume_info(volume, size, &volume_hash)?;
        let (fileset, _) = guard.create_fileset(volume, parsed.timestamp, is_full)?;
        report.volumes_registered += 1;
        report.filesets_rebuilt += 1;

        for entry in &entries {
            match rebuild_entry(&guard, config, &blocklist_payloads, fileset, entry) {
                Ok(()) => {}
                Err(err) => {
                    warn!(path = %entry.path, %err, "file not reconstructible");
                    report
                        .warnings
                        .push(format!("{}: {err}", entry.path));
                    report.partial = true;
                }
            }
        }
    }
    Ok(())
}

/// Rebuild one filelist entry: its content blockset, metadata blockset and
/// file binding.
fn rebuild_entry(
    catalog: &catalog::Catalog,
    config: BlockConfig,
    blocklists: &HashMap<String, Vec<u8>>,
    fileset: common::FilesetId,
    entry: &volume::FilelistEntry,
) -> Result<()> {
    let content = match entry.kind {
        EntryKind::File => {
            let full_hash = entry
                .hash
                .clone()
                .unwrap_or_else(|| hash::to_base64(&config.file_hash.digest(&[])));
            rebuild_blockset(
                catalog,
                config,
                blocklists,
                &full_hash,
                entry.size,
                &entry.blocklists,
            )?
        }
        EntryKind::Folder => common::BlocksetId::FOLDER,
        EntryKind::Symlink => common::BlocksetId::SYMLINK,
    };

    let metadata_blockset = rebuild_blockset(
        catalog,
        config,
        blocklists,
        &entry.metahash,
        entry.metasize,
        entry.metablockhash.as_deref().unwrap_or(&[]),
    )?;
    let metadata = catalog.register_metadataset(metadata_blockset)?;
    catalog.add_file(fileset, &entry.path, content, metadata, entry.time)?;
    Ok(())
}

fn rebuild_blockset(
    catalog: &catalog::Catalog,
    config: BlockConfig,
    blocklists: &HashMap<String, Vec<u8>>,
    full_hash: &str,
    length: i64,
    blocklist_hashes: &[String],
) -> Result<common::BlocksetId> {
    if let Some(existing) = catalog.blockset_id(full_hash, length)? {
        return Ok(existing);
    }

    let blocks: Vec<(String, i64)> = if length == 0 {
        Vec::new()
    } else if blocklist_hashes.is_empty() {
        // Single-block stream: the full hash doubles as the block hash.
        vec![(full_hash.to_string(), length)]
    } else {
        let hash_len = config.block_hash.digest_len();
        let mut raw = Vec::new();
        for list_hash in blocklist_hashes {
            let payload = blocklists.get(list_hash).ok_or_else(|| {
                Error::integrity(format!("blocklist {list_hash} is not present in any index"))
            })?;
            raw.extend_from_slice(payload);
        }
        if raw.len() % hash_len != 0 {
            return Err(Error::integrity(format!(
                "blocklist data for {full_hash} has a ragged length"
            )));
        }
        let count = raw.len() / hash_len;
        let expected = (length as u64).div_ceil(config.blocksize as u64) as usize;
        if count != expected {
            return Err(Error::integrity(format!(
                "blocklists name {count} blocks, the length needs {expected}"
            )));
        }
        (0..count)
            .map(|index| {
                let digest = &raw[index * hash_len..(index + 1) * hash_len];
                let size = if index + 1 == count {
                    length - (count as i64 - 1) * config.blocksize as i64
                } else {
                    config.blocksize as i64
                };
                (hash::to_base64(digest), size)
            })
            .collect()
    };

    for (block_hash, size) in &blocks {
        if !catalog.block_exists(block_hash, *size)? {
            return Err(Error::integrity(format!(
                "block {block_hash} ({size} bytes) is in no remote volume"
            )));
        }
    }
    let (blockset, created) = catalog.register_blockset(full_hash, length, &blocks)?;
    if created {
        for (index, list_hash) in blocklist_hashes.iter().enumerate() {
            catalog.register_blocklist_hash(blockset, index as i64, list_hash)?;
        }
    }
    Ok(blockset)
}
