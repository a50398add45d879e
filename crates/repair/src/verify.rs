use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, instrument};

use catalog::VolumeRow;
use common::{check_cancelled, CancellationToken, Options, Result, VolumeType};
use remote::{RemoteManager, SharedCatalog};
use volume::{
    BlockConfig, BlockVolumeReader, FilesetVolumeReader, IndexVolumeReader, RemoteName,
};

/// Outcome of one `test` run.
#[derive(Debug, Default)]
pub struct TestReport {
    pub examined: usize,
    pub issues: Vec<String>,
}

impl TestReport {
    pub fn exit_code(&self) -> i32 {
        if self.issues.is_empty() {
            0
        } else {
            2
        }
    }
}

/// Verify `samples` remote volumes against the catalog: the listing first,
/// then downloaded content, interleaving kinds with the newest dlist always
/// included.
#[instrument(skip_all)]
pub async fn run_test(
    samples: usize,
    options: Arc<Options>,
    catalog: SharedCatalog,
    manager: Arc<RemoteManager>,
    token: CancellationToken,
) -> Result<TestReport> {
    let mut report = TestReport::default();

    let delta = manager.verify_remote_listing(&catalog, true).await?;
    for row in &delta.missing {
        report.issues.push(format!("{}: missing remotely", row.name));
    }
    for (row, actual) in &delta.mismatched {
        report.issues.push(format!(
            "{}: remote size {actual}, catalog says {:?}",
            row.name, row.size
        ));
    }
    for extra in &delta.extra {
        report.issues.push(format!("{}: unknown remote file", extra.name));
    }

    let config = {
        let guard = catalog.lock().await;
        let (blocksize, block_hash, file_hash) = guard.stored_block_config()?;
        BlockConfig {
            blocksize,
            block_hash,
            file_hash,
        }
    };
    let selected = {
        let guard = catalog.lock().await;
        choose_samples(&guard.list_volumes()?, samples)
    };

    for row in selected {
        check_cancelled(&token)?;
        debug!(name = %row.name, "testing volume");
        match test_volume(&catalog, &manager, config, &options, &row).await {
            Ok(issues) => report.issues.extend(issues),
            Err(err) => report.issues.push(format!("{}: {err}", row.name)),
        }
        report.examined += 1;
    }

    info!(
        examined = report.examined,
        issues = report.issues.len(),
        "test finished"
    );
    Ok(report)
}

/// Newest dlist always, then newest-first volumes interleaved by kind.
fn choose_samples(volumes: &[VolumeRow], samples: usize) -> Vec<VolumeRow> {
    let uploaded = |row: &&VolumeRow| {
        matches!(
            row.state,
            common::VolumeState::Uploaded | common::VolumeState::Verified
        )
    };
    let mut chosen: Vec<VolumeRow> = Vec::new();

    if let Some(newest_dlist) = volumes
        .iter()
        .filter(uploaded)
        .filter(|row| row.kind == VolumeType::Files)
        .max_by_key(|row| row.id)
    {
        chosen.push(newest_dlist.clone());
    }

    let mut by_kind: Vec<Vec<&VolumeRow>> = [VolumeType::Blocks, VolumeType::Index, VolumeType::Files]
        .iter()
        .map(|kind| {
            let mut rows: Vec<&VolumeRow> = volumes
                .iter()
                .filter(uploaded)
                .filter(|row| row.kind == *kind)
                .collect();
            rows.sort_by_key(|row| std::cmp::Reverse(row.id));
            rows
        })
        .collect();

    let mut cursor = 0usize;
    while chosen.len() < samples.max(1) {
        let mut advanced = false;
        for rows in &mut by_kind {
            if let Some(row) = rows.get(cursor) {
                if !chosen.iter().any(|c| c.id == row.id) {
                    chosen.push((*row).clone());
                    advanced = true;
                    if chosen.len() >= samples.max(1) {
                        break;
                    }
                }
            }
        }
        if !advanced && cursor >= volumes.len() {
            break;
        }
        cursor += 1;
    }
    chosen
}

async fn test_volume(
    catalog: &SharedCatalog,
    manager: &Arc<RemoteManager>,
    config: BlockConfig,
    options: &Options,
    row: &VolumeRow,
) -> Result<Vec<String>> {
    let mut issues = Vec::new();
    // The download itself re-checks recorded size and hash.
    let staging = manager.download_volume(catalog, &row.name).await?;
    let container = RemoteName::parse(&row.name)?.container;
    let check = !options.disable_filelist_consistency_checks;

    match row.kind {
        VolumeType::Blocks => {
            let mut reader = BlockVolumeReader::open(staging.path(), container, config, check)?;
            let present: HashSet<String> = reader.block_hashes()?.into_iter().collect();
            let expected = {
                let guard = catalog.lock().await;
                guard.blocks_in_volume(row.id)?
            };
            for block in &expected {
                if !present.contains(&block.hash) {
                    issues.push(format!("{}: lacks block {}", row.name, block.hash));
                } else if options.full_block_verification {
                    if let Err(err) = reader.read_block_verified(&block.hash, block.size) {
                        issues.push(format!("{}: {err}", row.name));
                    }
                }
            }
        }
        VolumeType::Index => {
            let mut reader = IndexVolumeReader::open(staging.path(), container, config, check)?;
            let guard = catalog.lock().await;
            for record in reader.volumes()? {
                match guard.volume_by_name(&record.volumename)? {
                    None => issues.push(format!(
                        "{}: describes unknown volume {}",
                        row.name, record.volumename
                    )),
                    Some(paired) => {
                        if let Some(size) = paired.size {
                            if size != record.volumesize {
                                issues.push(format!(
                                    "{}: size disagreement for {}",
                                    row.name, record.volumename
                                ));
                            }
                        }
                    }
                }
            }
        }
        VolumeType::Files => {
            let mut reader = FilesetVolumeReader::open(staging.path(), container, config, check)?;
            if check {
                let guard = catalog.lock().await;
                for entry in reader.entries()? {
                    if entry.kind == common::EntryKind::File {
                        if let Some(hash) = &entry.hash {
                            if guard.blockset_id(hash, entry.size)?.is_none() {
                                issues.push(format!(
                                    "{}: filelist names unknown content {}",
                                    row.name, entry.path
                                ));
                            }
                        }
                    }
                }
            }
        }
    }
    Ok(issues)
}
