use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{info, instrument, warn};

use common::{Options, Result, VolumeType};
use remote::{commit_point, RemoteManager, SharedCatalog};

/// One file that cannot be fully restored any more.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokenEntry {
    pub fileset_timestamp: i64,
    pub path: String,
    pub missing_volume: String,
}

/// Files depending on volumes the remote listing no longer offers.
#[instrument(skip_all)]
pub async fn list_broken(
    catalog: &SharedCatalog,
    manager: &Arc<RemoteManager>,
    path_filter: Option<&str>,
) -> Result<Vec<BrokenEntry>> {
    let delta = manager.verify_remote_listing(catalog, false).await?;
    let mut entries = Vec::new();

    let guard = catalog.lock().await;
    let timestamps: BTreeMap<i64, i64> = guard
        .list_filesets()?
        .into_iter()
        .map(|fs| (fs.id.0, fs.timestamp))
        .collect();
    for row in delta.missing.iter().filter(|r| r.kind == VolumeType::Blocks) {
        for (fileset, path) in guard.files_using_volume(row.id)? {
            if let Some(filter) = path_filter {
                if !path.contains(filter) {
                    continue;
                }
            }
            entries.push(BrokenEntry {
                fileset_timestamp: timestamps.get(&fileset.0).copied().unwrap_or(0),
                path,
                missing_volume: row.name.clone(),
            });
        }
    }
    Ok(entries)
}

/// Drop every record that depends on lost volumes so the remaining
/// versions verify and restore cleanly again.
#[instrument(skip_all)]
pub async fn purge_broken_files(
    catalog: &SharedCatalog,
    manager: &Arc<RemoteManager>,
    options: &Options,
) -> Result<usize> {
    {
        let guard = catalog.lock().await;
        guard.require_complete("purge-broken-files")?;
    }
    let delta = manager.verify_remote_listing(catalog, false).await?;
    if delta.missing.is_empty() {
        info!("nothing is broken");
        return Ok(0);
    }

    let purge = |cat: &catalog::Catalog| -> Result<usize> {
        let mut purged = 0usize;
        for row in &delta.missing {
            match row.kind {
                VolumeType::Blocks => {
                    purged += cat.purge_blocks_of_volume(row.id)?;
                }
                VolumeType::Files => {
                    if let Some(fileset) = cat.fileset_for_volume(row.id)? {
                        cat.drop_filesets(&[fileset.id], 0)?;
                    }
                    cat.set_volume_state(row.id, common::VolumeState::Deleted)?;
                    cat.remove_volume(row.id)?;
                }
                VolumeType::Index => {
                    cat.remove_volume(row.id)?;
                }
            }
            warn!(name = %row.name, "purged records of lost volume");
        }
        Ok(purged)
    };

    if options.dryrun {
        let mut guard = catalog.lock().await;
        guard.begin()?;
        let purged = purge(&guard);
        guard.rollback()?;
        return purged;
    }
    commit_point(catalog, purge).await
}

/// Which filesets and files the named remote volumes carry data for.
#[instrument(skip_all)]
pub async fn list_affected(
    catalog: &SharedCatalog,
    targets: &[String],
) -> Result<Vec<BrokenEntry>> {
    let guard = catalog.lock().await;
    let timestamps: BTreeMap<i64, i64> = guard
        .list_filesets()?
        .into_iter()
        .map(|fs| (fs.id.0, fs.timestamp))
        .collect();

    let mut entries = Vec::new();
    for name in targets {
        let Some(row) = guard.volume_by_name(name)? else {
            entries.push(BrokenEntry {
                fileset_timestamp: 0,
                path: String::new(),
                missing_volume: format!("{name} (not in the catalog)"),
            });
            continue;
        };
        match row.kind {
            VolumeType::Blocks => {
                for (fileset, path) in guard.files_using_volume(row.id)? {
                    entries.push(BrokenEntry {
                        fileset_timestamp: timestamps.get(&fileset.0).copied().unwrap_or(0),
                        path,
                        missing_volume: row.name.clone(),
                    });
                }
            }
            VolumeType::Files => {
                if let Some(fileset) = guard.fileset_for_volume(row.id)? {
                    entries.push(BrokenEntry {
                        fileset_timestamp: fileset.timestamp,
                        path: "<entire version>".into(),
                        missing_volume: row.name.clone(),
                    });
                }
            }
            VolumeType::Index => {
                for block_volume in guard.block_volumes_for(row.id)? {
                    if let Some(paired) = guard.volume_by_id(block_volume)? {
                        entries.push(BrokenEntry {
                            fileset_timestamp: 0,
                            path: format!("<index for {}>", paired.name),
                            missing_volume: row.name.clone(),
                        });
                    }
                }
            }
        }
    }
    Ok(entries)
}
