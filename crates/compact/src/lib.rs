//! Compaction: reclaim wasted space in remote blocks volumes by rewriting
//! their live blocks into fresh volumes, re-homing catalog references
//! through duplicate-block records, and deleting the husks in dependency
//! order.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, instrument};

use catalog::VolumeReport;
use common::{
    check_cancelled, epoch_now, CancellationToken, Error, Options, Result, VolumeId, VolumeState,
    VolumeType,
};
use remote::{commit_point, RemoteManager, SharedCatalog};
use volume::manifest::{IndexBlockRecord, IndexVolumeRecord};
use volume::{
    BlockConfig, BlockVolumeReader, BlockVolumeWriter, ContainerKind, FinalizedVolume,
    IndexVolumeWriter, RemoteName,
};

mod retention;

pub use retention::{run_delete, run_retention, DeleteSelection};

/// Outcome of one compaction pass.
#[derive(Debug, Default)]
pub struct CompactReport {
    pub triggered: bool,
    pub deleted_volumes: usize,
    pub rewritten_volumes: usize,
    pub reclaimed_bytes: i64,
}

/// Classification of one blocks volume for the compaction planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VolumeClass {
    /// Nothing live inside; delete outright.
    CleanDelete,
    /// Wasted share crossed the threshold; rewrite.
    Wasted,
    /// Too small to be worth its per-file overhead; rewrite.
    Small,
    Healthy,
}

fn classify(report: &VolumeReport, options: &Options) -> VolumeClass {
    if report.data_size == 0 {
        return VolumeClass::CleanDelete;
    }
    let threshold = options.threshold as i64;
    if report.data_size <= report.wasted_size
        || report.wasted_size * 100 >= threshold * report.data_size
        || report.wasted_size * 100 >= threshold * options.volume_size as i64
    {
        return VolumeClass::Wasted;
    }
    if report.compressed_size <= options.small_file_size as i64 {
        return VolumeClass::Small;
    }
    VolumeClass::Healthy
}

/// Decide whether compaction should run at all.
fn triggers_fire(
    classified: &[(VolumeReport, VolumeClass)],
    live_total: i64,
    options: &Options,
) -> bool {
    let clean = classified
        .iter()
        .filter(|(_, class)| *class == VolumeClass::CleanDelete)
        .count();
    if clean > 0 {
        return true;
    }
    let wasted: Vec<_> = classified
        .iter()
        .filter(|(_, class)| *class == VolumeClass::Wasted)
        .collect();
    let wasted_total: i64 = wasted.iter().map(|(r, _)| r.wasted_size).sum();
    if wasted.len() >= 2 && live_total > 0 && wasted_total * 100 >= options.threshold as i64 * live_total
    {
        return true;
    }
    let small: Vec<_> = classified
        .iter()
        .filter(|(_, class)| *class == VolumeClass::Small)
        .collect();
    let small_total: i64 = small.iter().map(|(r, _)| r.compressed_size).sum();
    small_total > options.volume_size as i64 || small.len() > options.max_small_volume_count
}

/// Run one compaction pass; with `force`, skip the trigger evaluation.
///
/// Cancellation mid-pass rolls the whole compaction transaction back.
#[instrument(skip_all)]
pub async fn run_compaction(
    catalog: &SharedCatalog,
    manager: &Arc<RemoteManager>,
    options: &Options,
    token: CancellationToken,
    force: bool,
) -> Result<CompactReport> {
    {
        let guard = catalog.lock().await;
        guard.require_complete("compact")?;
    }
    let config = stored_config(catalog).await?;

    let (classified, live_total) = {
        let guard = catalog.lock().await;
        let reports = guard.wasted_space_report()?;
        let live_total = guard.total_live_size()?;
        let classified: Vec<(VolumeReport, VolumeClass)> = reports
            .into_iter()
            .map(|report| {
                let class = classify(&report, options);
                (report, class)
            })
            .collect();
        (classified, live_total)
    };

    if !force && !triggers_fire(&classified, live_total, options) {
        debug!("compaction not triggered");
        return Ok(CompactReport::default());
    }

    // Selection order: wasted before small, oldest referenced data first.
    let mut selected: Vec<(VolumeReport, VolumeClass)> = classified
        .into_iter()
        .filter(|(_, class)| {
            matches!(
                class,
                VolumeClass::CleanDelete | VolumeClass::Wasted | VolumeClass::Small
            )
        })
        .collect();
    selected.sort_by_key(|(report, class)| {
        let band = match class {
            VolumeClass::CleanDelete | VolumeClass::Wasted => 0,
            VolumeClass::Small => 1,
            VolumeClass::Healthy => 2,
        };
        (band, report.oldest_fileset.unwrap_or(i64::MAX))
    });

    if selected.is_empty() {
        return Ok(CompactReport::default());
    }
    info!(volumes = selected.len(), "compacting");

    {
        let mut guard = catalog.lock().await;
        guard.begin()?;
    }
    let result = compact_selected(catalog, manager, options, config, &token, selected).await;
    {
        let mut guard = catalog.lock().await;
        match &result {
            Ok(_) if !options.dryrun => guard.commit()?,
            Ok(_) => guard.rollback()?,
            Err(_) => guard.rollback()?,
        }
    }
    let mut report = result?;

    if !options.dryrun {
        report.deleted_volumes += manager.execute_deletes(catalog, epoch_now()).await?;
    }
    Ok(report)
}

async fn compact_selected(
    catalog: &SharedCatalog,
    manager: &Arc<RemoteManager>,
    options: &Options,
    config: BlockConfig,
    token: &CancellationToken,
    selected: Vec<(VolumeReport, VolumeClass)>,
) -> Result<CompactReport> {
    let mut report = CompactReport {
        triggered: true,
        ..CompactReport::default()
    };
    let now = epoch_now();
    let mut rewriter = Rewriter::new(catalog, manager, options, config, now);

    for (volume_report, class) in selected {
        check_cancelled(token)?;
        report.reclaimed_bytes += volume_report.wasted_size;

        if class != VolumeClass::CleanDelete {
            rewriter.rewrite_volume(&volume_report, token).await?;
            report.rewritten_volumes += 1;
        }

        // Counts must balance before the old volume may go: every block
        // homed there needs a surviving copy.
        let counts = {
            let guard = catalog.lock().await;
            guard.rehome_blocks(volume_report.volume_id)?
        };
        if counts.targets != counts.updated || counts.updated != counts.duplicates_consumed {
            return Err(Error::consistency(format!(
                "re-homing {} moved {}/{} blocks using {} duplicates",
                volume_report.name, counts.updated, counts.targets, counts.duplicates_consumed
            )));
        }

        manager
            .start_delete(catalog, volume_report.volume_id, now)
            .await?;
        debug!(name = %volume_report.name, "volume queued for deletion");
    }

    rewriter.flush(token).await?;

    // Index volumes whose every paired blocks volume is going away follow
    // them; a blocks volume is always deleted before its index.
    let released = {
        let guard = catalog.lock().await;
        guard.fully_released_index_volumes()?
    };
    for index in released {
        manager.start_delete(catalog, index.id, now).await?;
    }
    Ok(report)
}

/// Streams live blocks out of doomed volumes into fresh ones, recording a
/// duplicate for every copy so re-homing can pick it up.
struct Rewriter<'a> {
    catalog: &'a SharedCatalog,
    manager: &'a Arc<RemoteManager>,
    options: &'a Options,
    config: BlockConfig,
    timestamp: i64,
    open: Option<(VolumeId, BlockVolumeWriter)>,
}

impl<'a> Rewriter<'a> {
    fn new(
        catalog: &'a SharedCatalog,
        manager: &'a Arc<RemoteManager>,
        options: &'a Options,
        config: BlockConfig,
        timestamp: i64,
    ) -> Self {
        Self {
            catalog,
            manager,
            options,
            config,
            timestamp,
            open: None,
        }
    }

    async fn rewrite_volume(
        &mut self,
        volume_report: &VolumeReport,
        token: &CancellationToken,
    ) -> Result<()> {
        let staging = self
            .manager
            .download_volume(self.catalog, &volume_report.name)
            .await?;
        let container = RemoteName::parse(&volume_report.name)?.container;
        let mut reader = BlockVolumeReader::open(
            staging.path(),
            container,
            self.config,
            !self.options.disable_filelist_consistency_checks,
        )?;

        let (live, blocklist_hashes) = {
            let guard = self.catalog.lock().await;
            let live = guard.blocks_in_volume(volume_report.volume_id)?;
            let lists: HashSet<String> = guard
                .blocklist_hashes_in_volume(volume_report.volume_id)?
                .into_iter()
                .map(|(_, hash)| hash)
                .collect();
            (live, lists)
        };

        for block in live {
            check_cancelled(token)?;
            let payload = reader.read_block_verified(&block.hash, block.size)?;
            let target = self.open_target().await?;
            if blocklist_hashes.contains(&block.hash) {
                target.1.add_blocklist_block(&block.hash, &payload)?;
            } else {
                target.1.add_block(&block.hash, &payload)?;
            }
            let target_id = target.0;
            {
                let guard = self.catalog.lock().await;
                guard.add_duplicate_block(block.id, target_id)?;
            }
            if self.open_is_full() {
                self.emit_open(token).await?;
            }
        }
        Ok(())
    }

    async fn open_target(&mut self) -> Result<&mut (VolumeId, BlockVolumeWriter)> {
        if self.open.is_none() {
            let writer = BlockVolumeWriter::create(
                self.config,
                &self.options.prefix,
                ContainerKind::default(),
                self.timestamp,
                self.manager.encryption_extension(),
            )?;
            let volume_id = {
                let guard = self.catalog.lock().await;
                guard.register_volume(
                    writer.remote_name(),
                    VolumeType::Blocks,
                    VolumeState::Temporary,
                )?
            };
            self.open = Some((volume_id, writer));
        }
        Ok(self.open.as_mut().expect("open target exists"))
    }

    fn open_is_full(&self) -> bool {
        self.open
            .as_ref()
            .map(|(_, writer)| writer.payload_size() >= self.options.volume_size)
            .unwrap_or(false)
    }

    async fn emit_open(&mut self, token: &CancellationToken) -> Result<()> {
        let Some((volume_id, writer)) = self.open.take() else {
            return Ok(());
        };
        check_cancelled(token)?;
        let finalized = writer.finalize()?;
        emit_rewritten(
            self.catalog,
            self.manager,
            self.options,
            self.config,
            self.timestamp,
            volume_id,
            finalized,
        )
        .await
    }

    async fn flush(&mut self, token: &CancellationToken) -> Result<()> {
        if let Some((volume_id, writer)) = self.open.take() {
            if writer.block_count() == 0 {
                let guard = self.catalog.lock().await;
                guard.remove_volume(volume_id)?;
                return Ok(());
            }
            check_cancelled(token)?;
            let finalized = writer.finalize()?;
            emit_rewritten(
                self.catalog,
                self.manager,
                self.options,
                self.config,
                self.timestamp,
                volume_id,
                finalized,
            )
            .await?;
        }
        Ok(())
    }
}

/// Record, index and upload one rewritten blocks volume.
async fn emit_rewritten(
    catalog: &SharedCatalog,
    manager: &Arc<RemoteManager>,
    options: &Options,
    config: BlockConfig,
    timestamp: i64,
    block_volume: VolumeId,
    finalized: FinalizedVolume,
) -> Result<()> {
    let mut index_writer = IndexVolumeWriter::create(
        config,
        &options.prefix,
        ContainerKind::default(),
        timestamp,
        manager.encryption_extension(),
    )?;
    index_writer.add_volume(&IndexVolumeRecord {
        volumename: finalized.remote_name.clone(),
        volumehash: finalized.hash.clone(),
        volumesize: finalized.size,
        blocks: finalized
            .blocks
            .iter()
            .map(|(hash, size)| IndexBlockRecord {
                hash: hash.clone(),
                size: *size,
            })
            .collect(),
    })?;
    for (hash, payload) in &finalized.blocklists {
        index_writer.add_blocklist(hash, payload)?;
    }

    let index_volume = commit_point(catalog, |cat| {
        cat.set_volume_info(block_volume, finalized.size, &finalized.hash)?;
        let index_volume = cat.register_volume(
            index_writer.remote_name(),
            VolumeType::Index,
            VolumeState::Temporary,
        )?;
        cat.add_index_link(index_volume, block_volume)?;
        Ok(index_volume)
    })
    .await?;

    let finalized_index = index_writer.finalize()?;
    commit_point(catalog, |cat| {
        cat.set_volume_info(index_volume, finalized_index.size, &finalized_index.hash)
    })
    .await?;

    manager
        .upload_volume(
            catalog,
            block_volume,
            &finalized.remote_name,
            finalized.staging.path(),
        )
        .await?;
    manager
        .upload_volume(
            catalog,
            index_volume,
            &finalized_index.remote_name,
            finalized_index.staging.path(),
        )
        .await?;
    Ok(())
}

pub(crate) async fn stored_config(catalog: &SharedCatalog) -> Result<BlockConfig> {
    let guard = catalog.lock().await;
    let (blocksize, block_hash, file_hash) = guard.stored_block_config()?;
    Ok(BlockConfig {
        blocksize,
        block_hash,
        file_hash,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(data: i64, wasted: i64, compressed: i64) -> VolumeReport {
        VolumeReport {
            volume_id: VolumeId(1),
            name: "v.dblock.zip".into(),
            data_size: data,
            wasted_size: wasted,
            compressed_size: compressed,
            oldest_fileset: Some(0),
        }
    }

    #[test]
    fn test_classification() {
        let options = Options::default(); // threshold 25, small = volume/5
        assert_eq!(classify(&report(0, 10, 5), &options), VolumeClass::CleanDelete);
        assert_eq!(classify(&report(100, 100, 50), &options), VolumeClass::Wasted);
        assert_eq!(classify(&report(100, 30, 50), &options), VolumeClass::Wasted);
        assert_eq!(
            classify(&report(1000, 0, 1000), &options),
            VolumeClass::Small
        );
        assert_eq!(
            classify(
                &report(40 * 1024 * 1024, 0, 40 * 1024 * 1024),
                &options
            ),
            VolumeClass::Healthy
        );
    }

    #[test]
    fn test_triggers() {
        let options = Options::default();

        // A clean-delete volume always fires.
        let classified = vec![(report(0, 10, 5), VolumeClass::CleanDelete)];
        assert!(triggers_fire(&classified, 100, &options));

        // One wasted volume alone does not.
        let classified = vec![(report(100, 50, 80), VolumeClass::Wasted)];
        assert!(!triggers_fire(&classified, 1000, &options));

        // Two wasted volumes above the global threshold do.
        let classified = vec![
            (report(100, 200, 80), VolumeClass::Wasted),
            (report(100, 200, 80), VolumeClass::Wasted),
        ];
        assert!(triggers_fire(&classified, 1000, &options));

        // Too many small volumes fire on count.
        let small: Vec<_> = (0..=options.max_small_volume_count)
            .map(|_| (report(100, 0, 10), VolumeClass::Small))
            .collect();
        assert!(triggers_fire(&small, 10_000_000, &options));
    }
}
