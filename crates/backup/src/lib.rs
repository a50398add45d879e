//! Concurrent backup pipeline: enumerate sources, dedup blocks against the
//! catalog, pack volumes, upload, and commit the fileset — with the dlist
//! uploaded last and cancellation degrading to a partial backup.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, instrument, warn};

use catalog::ChangeStats;
use remote::{commit_point, RemoteManager, SharedCatalog};
use volume::{BlockConfig, ContainerKind, FilesetVolumeWriter, RemoteName};

use common::{
    epoch_now, tempfiles, CancellationToken, Error, FilesetId, Options, Result, VolumeId,
    VolumeState, VolumeType,
};

mod enumerate;
mod filelist;
mod precheck;
mod process;
mod progress;
mod split;

pub use progress::{BackupStats, ProgressEvent};

use process::OpenVolumes;
use remote::util::SharedReceiver;

const CHANNEL_BOUND: usize = 64;
const PROGRESS_BOUND: usize = 1024;

/// Shared state threaded through every pipeline task.
pub(crate) struct PipelineContext {
    pub catalog: SharedCatalog,
    pub manager: Arc<RemoteManager>,
    pub config: BlockConfig,
    pub options: Arc<Options>,
    pub token: CancellationToken,
    pub progress: mpsc::Sender<ProgressEvent>,
    pub open_volumes: OpenVolumes,
    pub fileset: FilesetId,
    pub previous_fileset: Option<FilesetId>,
    pub container: ContainerKind,
    pub encryption_ext: Option<String>,
    pub timestamp: i64,
}

/// Outcome of one backup run.
#[derive(Debug)]
pub struct BackupReport {
    pub fileset: FilesetId,
    pub timestamp: i64,
    pub stats: BackupStats,
    /// Cancellation tripped: the fileset was recorded as a partial backup.
    pub interrupted: bool,
    pub changes: Option<ChangeStats>,
}

impl BackupReport {
    pub fn exit_code(&self) -> i32 {
        if self.interrupted {
            50
        } else if self.stats.warnings.is_empty() {
            0
        } else {
            1
        }
    }
}

/// Run one backup of `sources` against the destination behind `manager`.
#[instrument(skip_all, fields(sources = sources.len()))]
pub async fn run_backup(
    sources: Vec<PathBuf>,
    options: Arc<Options>,
    catalog: SharedCatalog,
    manager: Arc<RemoteManager>,
    token: CancellationToken,
) -> Result<BackupReport> {
    options.validate()?;
    if sources.is_empty() {
        return Err(Error::user("no sources given"));
    }
    tempfiles::sweep_stale();
    {
        let guard = catalog.lock().await;
        guard.require_complete("backup")?;
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
    let container = ContainerKind::default();
    let encryption_ext = manager.encryption_extension().map(String::from);

    if !options.no_backend_verification {
        let delta = manager.verify_remote_listing(&catalog, true).await?;
        if !delta.missing.is_empty() || !delta.mismatched.is_empty() {
            return Err(Error::RemoteList(format!(
                "{}; run repair before backing up",
                delta.describe()
            )));
        }
        for extra in &delta.extra {
            warn!(name = %extra.name, "unknown remote file with our prefix");
        }
    }

    close_out_interrupted(&catalog, &manager, config).await?;
    reclaim_leftovers(&catalog, &options).await?;

    let previous_fileset = {
        let guard = catalog.lock().await;
        guard.list_filesets()?.first().map(|fs| fs.id)
    };

    // Setup phase: the fileset and its dlist volume row exist before any
    // pipeline task runs.
    let timestamp = epoch_now();
    let dlist_name = RemoteName::generate(
        &options.prefix,
        VolumeType::Files,
        container,
        timestamp,
        encryption_ext.as_deref(),
    );
    let (fileset, actual_timestamp, dlist_volume) = {
        let mut guard = catalog.lock().await;
        guard.begin()?;
        let setup = (|| {
            let volume = guard.register_volume(
                &dlist_name.to_string(),
                VolumeType::Files,
                VolumeState::Temporary,
            )?;
            let (fileset, ts) = guard.create_fileset(volume, timestamp, true)?;
            Ok::<_, Error>((fileset, ts, volume))
        })();
        match setup {
            Ok(value) => {
                if !options.dryrun {
                    guard.commit()?;
                }
                value
            }
            Err(err) => {
                guard.rollback()?;
                return Err(err);
            }
        }
    };

    // Pipeline phase.
    {
        let mut guard = catalog.lock().await;
        if !guard.in_transaction() {
            guard.begin()?;
        }
    }
    let blacklist = {
        let guard = catalog.lock().await;
        guard.sidecar_paths()
    };
    let pipeline = run_pipeline(
        sources,
        blacklist,
        PipelineSeed {
            catalog: catalog.clone(),
            manager: manager.clone(),
            config,
            options: options.clone(),
            token: token.clone(),
            fileset,
            previous_fileset,
            container,
            encryption_ext: encryption_ext.clone(),
            timestamp: actual_timestamp,
        },
    )
    .await;
    {
        let mut guard = catalog.lock().await;
        match &pipeline {
            Ok(_) => {
                if !options.dryrun {
                    guard.commit()?;
                }
            }
            Err(_) => {
                guard.rollback()?;
            }
        }
    }
    let stats = pipeline?;

    // Finalization phase: synthetic ordering, dlist strictly last.
    let interrupted = token.is_cancelled();
    let finalize = finalize_fileset(
        &catalog,
        &manager,
        config,
        fileset,
        dlist_volume,
        dlist_name,
        interrupted,
    )
    .await;
    if let Err(err) = finalize {
        let mut guard = catalog.lock().await;
        guard.rollback()?;
        return Err(err);
    }

    let changes = match previous_fileset {
        Some(previous) => {
            let guard = catalog.lock().await;
            Some(guard.change_statistics(fileset, previous)?)
        }
        None => None,
    };
    if let Some(changes) = &changes {
        info!(
            added = changes.added_files + changes.added_folders + changes.added_symlinks,
            modified =
                changes.modified_files + changes.modified_folders + changes.modified_symlinks,
            deleted = changes.deleted_files + changes.deleted_folders + changes.deleted_symlinks,
            "change statistics"
        );
    }

    // Retention and auto-compaction run only after a clean, real backup.
    if !interrupted && !options.dryrun && options.has_retention() {
        compact::run_retention(&catalog, &options).await?;
        compact::run_compaction(&catalog, &manager, &options, token.clone(), false).await?;
    }
    manager.execute_deletes(&catalog, epoch_now()).await?;

    if options.dryrun {
        let mut guard = catalog.lock().await;
        guard.rollback()?;
    }

    Ok(BackupReport {
        fileset,
        timestamp: actual_timestamp,
        stats,
        interrupted,
        changes,
    })
}

/// Close out an interrupted previous run by uploading its synthetic
/// filelist under the recorded remote name.
async fn close_out_interrupted(
    catalog: &SharedCatalog,
    manager: &Arc<RemoteManager>,
    config: BlockConfig,
) -> Result<()> {
    let pending = {
        let guard = catalog.lock().await;
        guard.find_last_incomplete_fileset_volume()?
    };
    let Some(volume) = pending else {
        return Ok(());
    };

    info!(name = %volume.name, "closing out interrupted backup with a synthetic filelist");
    let entries = commit_point(catalog, |cat| {
        let fileset = cat
            .fileset_for_volume(volume.id)?
            .ok_or_else(|| Error::consistency(format!("{} has no fileset", volume.name)))?;
        cat.mark_fileset_partial(fileset.id)?;
        filelist::build_filelist(cat, fileset.id)
    })
    .await?;

    let name = RemoteName::parse(&volume.name)?;
    let mut writer = FilesetVolumeWriter::create_with_name(config, name)?;
    writer.write_filelist(false, &entries)?;
    let finalized = writer.finalize()?;
    commit_point(catalog, |cat| {
        cat.set_volume_info(volume.id, finalized.size, &finalized.hash)
    })
    .await?;
    manager
        .upload_volume(catalog, volume.id, &volume.name, finalized.staging.path())
        .await?;
    Ok(())
}

/// Deal with dblock/dindex volumes stranded by a previous crash: their
/// staging files are gone, so the records they carried are purged (with
/// auto-cleanup) or the operator is sent to repair.
async fn reclaim_leftovers(catalog: &SharedCatalog, options: &Options) -> Result<()> {
    let leftovers: Vec<(VolumeId, String)> = {
        let guard = catalog.lock().await;
        guard
            .list_volumes()?
            .into_iter()
            .filter(|v| {
                v.kind != VolumeType::Files
                    && matches!(v.state, VolumeState::Temporary | VolumeState::Uploading)
            })
            .map(|v| (v.id, v.name))
            .collect()
    };
    if leftovers.is_empty() {
        return Ok(());
    }
    if !options.auto_cleanup {
        return Err(Error::user(format!(
            "{} interrupted volumes in the catalog; run repair or enable auto-cleanup",
            leftovers.len()
        )));
    }
    commit_point(catalog, |cat| {
        for (id, name) in &leftovers {
            let purged = cat.purge_blocks_of_volume(*id)?;
            warn!(%name, purged, "reclaimed interrupted volume");
        }
        Ok(())
    })
    .await
}

struct PipelineSeed {
    catalog: SharedCatalog,
    manager: Arc<RemoteManager>,
    config: BlockConfig,
    options: Arc<Options>,
    token: CancellationToken,
    fileset: FilesetId,
    previous_fileset: Option<FilesetId>,
    container: ContainerKind,
    encryption_ext: Option<String>,
    timestamp: i64,
}

async fn run_pipeline(
    sources: Vec<PathBuf>,
    blacklist: Vec<PathBuf>,
    seed: PipelineSeed,
) -> Result<BackupStats> {
    let splitters = Options::effective_concurrency(seed.options.concurrency_block_hashers);
    let file_processors = Options::effective_concurrency(seed.options.concurrency_file_processors);
    let data_processors = Options::effective_concurrency(seed.options.concurrency_compressors);

    let (enum_tx, enum_rx) = mpsc::channel(CHANNEL_BOUND);
    let (pre_tx, pre_rx) = mpsc::channel(CHANNEL_BOUND);
    let (split_tx, split_rx) = mpsc::channel(CHANNEL_BOUND);
    let (file_tx, file_rx) = mpsc::channel(CHANNEL_BOUND);
    let (store_tx, store_rx) = mpsc::channel(CHANNEL_BOUND);
    let (spill_tx, spill_rx) = mpsc::channel(CHANNEL_BOUND);
    let (upload_tx, upload_rx) = mpsc::channel(CHANNEL_BOUND);
    let (progress_tx, progress_rx) = mpsc::channel(PROGRESS_BOUND);

    let ctx = Arc::new(PipelineContext {
        catalog: seed.catalog,
        manager: seed.manager,
        config: seed.config,
        options: seed.options,
        token: seed.token,
        progress: progress_tx.clone(),
        open_volumes: OpenVolumes::new(data_processors),
        fileset: seed.fileset,
        previous_fileset: seed.previous_fileset,
        container: seed.container,
        encryption_ext: seed.encryption_ext,
        timestamp: seed.timestamp,
    });
    drop(progress_tx);

    // Every open volume exists before the first block registration names
    // one and before any task can fail mid-spawn.
    let mut open_volumes = Vec::new();
    for slot in 0..data_processors {
        open_volumes.push(process::OpenVolume::create(&ctx, slot).await?);
    }

    let mut handles = Vec::new();
    handles.push(tokio::spawn(enumerate::enumerator(
        sources,
        ctx.options.clone(),
        blacklist,
        ctx.token.clone(),
        enum_tx,
        ctx.progress.clone(),
    )));
    handles.push(tokio::spawn(precheck::metadata_precheck(
        ctx.clone(),
        enum_rx,
        pre_tx,
    )));
    handles.push(tokio::spawn(precheck::prefilter(
        ctx.clone(),
        pre_rx,
        split_tx,
    )));

    let shared_entries = SharedReceiver::new(split_rx);
    for _ in 0..splitters {
        handles.push(tokio::spawn(split::stream_splitter(
            ctx.clone(),
            shared_entries.clone(),
            file_tx.clone(),
        )));
    }
    drop(file_tx);

    let shared_files = SharedReceiver::new(file_rx);
    for _ in 0..file_processors {
        handles.push(tokio::spawn(process::file_block_processor(
            ctx.clone(),
            shared_files.clone(),
            store_tx.clone(),
        )));
    }
    drop(store_tx);

    let shared_store = SharedReceiver::new(store_rx);
    for open in open_volumes {
        handles.push(tokio::spawn(process::data_block_processor(
            ctx.clone(),
            open,
            shared_store.clone(),
            spill_tx.clone(),
            upload_tx.clone(),
        )));
    }
    drop(spill_tx);

    handles.push(tokio::spawn(process::spill_collector(
        ctx.clone(),
        spill_rx,
        upload_tx.clone(),
    )));
    drop(upload_tx);

    handles.push(tokio::spawn(process::uploader(ctx.clone(), upload_rx)));
    let progress_handle = tokio::spawn(progress::progress_handler(progress_rx));

    let mut first_error: Option<Error> = None;
    for handle in handles {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(Error::Cancelled)) => {}
            Ok(Err(err)) => {
                ctx.token.cancel();
                first_error.get_or_insert(err);
            }
            Err(join_err) => {
                ctx.token.cancel();
                first_error.get_or_insert(Error::user(format!("pipeline task failed: {join_err}")));
            }
        }
    }
    drop(ctx);
    let stats = progress_handle
        .await
        .map_err(|err| Error::user(format!("progress handler failed: {err}")))?;

    match first_error {
        Some(err) => Err(err),
        None => Ok(stats),
    }
}

#[allow(clippy::too_many_arguments)]
async fn finalize_fileset(
    catalog: &SharedCatalog,
    manager: &Arc<RemoteManager>,
    config: BlockConfig,
    fileset: FilesetId,
    dlist_volume: VolumeId,
    dlist_name: RemoteName,
    interrupted: bool,
) -> Result<()> {
    let entries = commit_point(catalog, |cat| {
        if interrupted {
            cat.mark_fileset_partial(fileset)?;
        }
        filelist::build_filelist(cat, fileset)
    })
    .await?;

    let mut writer = FilesetVolumeWriter::create_with_name(config, dlist_name)?;
    writer.write_filelist(!interrupted, &entries)?;
    let finalized = writer.finalize()?;
    commit_point(catalog, |cat| {
        cat.set_volume_info(dlist_volume, finalized.size, &finalized.hash)
    })
    .await?;
    manager
        .upload_volume(
            catalog,
            dlist_volume,
            &finalized.remote_name,
            finalized.staging.path(),
        )
        .await?;
    Ok(())
}
