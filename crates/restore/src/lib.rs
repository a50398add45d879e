//! Restore pipeline: plan against the catalog, reuse local bytes, patch the
//! rest from remote volumes (sequentially or through the CSP network), then
//! apply metadata and verify.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, instrument};

use catalog::{PlanFile, RestorePlan};
use common::{
    tempfiles, CancellationToken, EntryKind, Error, FileId, Options, Result,
};
use remote::{RemoteManager, SharedCatalog};
use volume::BlockConfig;

mod legacy;
mod local;
mod metadata;
mod pipelined;
mod plan;

/// Which backup version a restore reads from.
#[derive(Debug, Clone, Copy)]
pub enum RestoreSelection {
    Latest,
    /// Counting back from the newest version (0).
    Version(usize),
    /// Newest version at or before this epoch timestamp.
    Time(i64),
}

/// Mutable state the patching phases accumulate.
#[derive(Default)]
pub(crate) struct RestoreOutcome {
    /// Metadata blob pieces per file, keyed by block index.
    pub metadata_parts: HashMap<FileId, BTreeMap<i64, Vec<u8>>>,
    /// Files that could not be completed, with the first reason.
    pub broken: HashMap<FileId, String>,
    pub warnings: Vec<String>,
}

/// Outcome of one restore run.
#[derive(Debug, Default)]
pub struct RestoreReport {
    pub restored_files: u64,
    pub verified_files: u64,
    pub metadata_applied: u64,
    pub reused_blocks: u64,
    pub broken_files: Vec<String>,
    pub warnings: Vec<String>,
}

impl RestoreReport {
    pub fn exit_code(&self) -> i32 {
        if !self.broken_files.is_empty() {
            2
        } else if self.warnings.is_empty() {
            0
        } else {
            1
        }
    }
}

/// Restore the files matching `filters` from the selected version into
/// `target_dir` (or their original locations).
#[instrument(skip_all)]
pub async fn run_restore(
    filters: Vec<String>,
    target_dir: Option<PathBuf>,
    selection: RestoreSelection,
    options: Arc<Options>,
    catalog: SharedCatalog,
    manager: Arc<RemoteManager>,
    token: CancellationToken,
) -> Result<RestoreReport> {
    tempfiles::sweep_stale();
    let config = {
        let guard = catalog.lock().await;
        let (blocksize, block_hash, file_hash) = guard.stored_block_config()?;
        BlockConfig {
            blocksize,
            block_hash,
            file_hash,
        }
    };

    // Phase 1: plan.
    let plan = {
        let guard = catalog.lock().await;
        let fileset = plan::resolve_fileset(&guard, &selection)?;
        let selected = plan::select_files(&guard, fileset, &filters)?;
        if selected.is_empty() {
            return Err(Error::user("no files match the restore request"));
        }
        guard.create_restore_plan(fileset, &selected)?
    };

    // The scratch tables go away on every exit path.
    let result = execute(
        &plan,
        target_dir,
        config,
        &options,
        &catalog,
        &manager,
        &token,
    )
    .await;
    {
        let guard = catalog.lock().await;
        guard.drop_restore_plan(&plan);
    }
    result
}

async fn execute(
    plan: &RestorePlan,
    target_dir: Option<PathBuf>,
    config: BlockConfig,
    options: &Options,
    catalog: &SharedCatalog,
    manager: &Arc<RemoteManager>,
    token: &CancellationToken,
) -> Result<RestoreReport> {
    let mut files: Vec<PlanFile> = {
        let guard = catalog.lock().await;
        plan::map_targets(&guard, plan, target_dir.as_deref())?
    };

    // Phase 2: reuse what the disk already holds.
    let reused_blocks = {
        let guard = catalog.lock().await;
        local::reuse_local_data(&guard, plan, &mut files, config, options, token)?
    };

    // Phase 3: fetch and patch the remainder.
    let mut outcome = RestoreOutcome::default();
    if options.restore_legacy {
        legacy::patch_sequentially(
            catalog,
            manager,
            plan,
            config,
            !options.disable_filelist_consistency_checks,
            token,
            &mut outcome,
        )
        .await?;
    } else {
        pipelined::patch_pipelined(catalog, manager, plan, config, options, token, &mut outcome)
            .await?;
    }

    // Phase 4: metadata and optional end-to-end verification.
    let (metadata_applied, verified_files) = metadata::apply_metadata(
        &files,
        &mut outcome,
        config,
        options.perform_restored_file_verification,
    )?;

    let target_of: HashMap<FileId, &str> = files
        .iter()
        .filter_map(|f| f.target_path.as_deref().map(|t| (f.file_id, t)))
        .collect();
    let broken_files: Vec<String> = outcome
        .broken
        .iter()
        .map(|(file_id, reason)| {
            format!(
                "{}: {reason}",
                target_of.get(file_id).copied().unwrap_or("<unmapped>")
            )
        })
        .collect();

    let restored_files = files
        .iter()
        .filter(|f| {
            plan::kind_of(f) == EntryKind::File && !outcome.broken.contains_key(&f.file_id)
        })
        .count() as u64;

    info!(
        restored_files,
        reused_blocks,
        broken = broken_files.len(),
        "restore finished"
    );
    Ok(RestoreReport {
        restored_files,
        verified_files,
        metadata_applied,
        reused_blocks,
        broken_files,
        warnings: outcome.warnings,
    })
}
