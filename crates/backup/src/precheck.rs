use tokio::sync::mpsc;
use tracing::trace;

use common::{check_cancelled, hash, EntryKind, Result};

use crate::enumerate::SourceEntry;
use crate::progress::ProgressEvent;
use crate::PipelineContext;

/// Metadata pre-processor: inherit files that are same-as-previous by the
/// (size, last_modified, metadata hash) tuple without re-reading them.
pub(crate) async fn metadata_precheck(
    ctx: std::sync::Arc<PipelineContext>,
    mut input: mpsc::Receiver<SourceEntry>,
    out: mpsc::Sender<SourceEntry>,
) -> Result<()> {
    while let Some(entry) = input.recv().await {
        check_cancelled(&ctx.token)?;
        let _ = ctx
            .progress
            .send(ProgressEvent::FileExamined { bytes: entry.size })
            .await;

        if entry.kind == EntryKind::File {
            if let Some(previous_fileset) = ctx.previous_fileset {
                let metadata_blob = entry.metadata.to_bytes()?;
                let metadata_hash =
                    hash::to_base64(&ctx.config.file_hash.digest(&metadata_blob));

                let previous = {
                    let guard = ctx.catalog.lock().await;
                    guard.previous_file_record(previous_fileset, &entry.stored_path)?
                };
                if let Some(prev) = previous {
                    let unchanged = prev.length == entry.size as i64
                        && prev.last_modified == entry.metadata.mtime
                        && prev.metadata_hash == metadata_hash;
                    if unchanged {
                        trace!(path = %entry.stored_path, "inherited from previous fileset");
                        let guard = ctx.catalog.lock().await;
                        guard.bind_file(ctx.fileset, prev.file_id, entry.metadata.mtime)?;
                        drop(guard);
                        let _ = ctx.progress.send(ProgressEvent::FileInherited).await;
                        continue;
                    }
                }
            }
        }

        if out.send(entry).await.is_err() {
            return Ok(());
        }
    }
    Ok(())
}

/// Pre-filter: exclusion rules that need stat information.
pub(crate) async fn prefilter(
    ctx: std::sync::Arc<PipelineContext>,
    mut input: mpsc::Receiver<SourceEntry>,
    out: mpsc::Sender<SourceEntry>,
) -> Result<()> {
    while let Some(entry) = input.recv().await {
        check_cancelled(&ctx.token)?;

        if entry.kind == EntryKind::File {
            if let Some(cap) = ctx.options.skip_files_larger_than {
                if entry.size > cap {
                    let _ = ctx
                        .progress
                        .send(ProgressEvent::Warning(format!(
                            "{} exceeds the {cap}-byte cap, skipped",
                            entry.stored_path
                        )))
                        .await;
                    let _ = ctx.progress.send(ProgressEvent::FileSkipped).await;
                    continue;
                }
            }
        }

        if out.send(entry).await.is_err() {
            return Ok(());
        }
    }
    Ok(())
}
