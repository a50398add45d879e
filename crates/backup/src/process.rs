use std::collections::HashSet;
use std::sync::Arc;

use tempfile::NamedTempFile;
use tokio::sync::mpsc;
use tracing::{debug, instrument, trace};

use common::{check_cancelled, hash, BlockId, BlocksetId, EntryKind, Error, Result, VolumeId};
use volume::manifest::{IndexBlockRecord, IndexVolumeRecord};
use volume::{BlockVolumeReader, BlockVolumeWriter, FinalizedVolume, IndexVolumeWriter, RemoteName};

use crate::progress::ProgressEvent;
use crate::split::{BlockData, FileStream};
use remote::util::SharedReceiver;
use crate::PipelineContext;

/// A block bound for the currently-open blocks volume of some data block
/// processor.
pub(crate) struct StoreBlock {
    pub block_id: BlockId,
    pub hash: String,
    pub payload: Vec<u8>,
    pub is_blocklist: bool,
}

/// A finalized-but-unuploaded volume left over when the input dried up.
pub(crate) struct SpillItem {
    pub volume_id: VolumeId,
    pub finalized: FinalizedVolume,
}

/// One staged file on its way to the backend, in strict FIFO order.
pub(crate) struct UploadItem {
    pub volume_id: VolumeId,
    pub remote_name: String,
    pub staging: NamedTempFile,
    pub bytes: u64,
}

// -- file block processor ----------------------------------------------

/// File block processor: accumulate each file's block hashes into a
/// blockset, emit blocklist blocks at chunk boundaries, and route new
/// blocks to the data block processors. Runs with M copies.
pub(crate) async fn file_block_processor(
    ctx: Arc<PipelineContext>,
    input: SharedReceiver<FileStream>,
    store: mpsc::Sender<StoreBlock>,
) -> Result<()> {
    while let Some(mut stream) = input.recv().await {
        check_cancelled(&ctx.token)?;
        match process_file(&ctx, &mut stream, &store).await {
            Ok(()) => {
                let _ = ctx.progress.send(ProgressEvent::FileAdded).await;
            }
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(err) => {
                let _ = ctx
                    .progress
                    .send(ProgressEvent::Warning(format!(
                        "failed to process {}: {err}",
                        stream.entry.stored_path
                    )))
                    .await;
            }
        }
    }
    Ok(())
}

async fn process_file(
    ctx: &PipelineContext,
    stream: &mut FileStream,
    store: &mpsc::Sender<StoreBlock>,
) -> Result<()> {
    let entry = &stream.entry;

    let content_blockset = if entry.kind == EntryKind::File {
        let mut acc = BlocksetAccumulator::new(ctx, store);
        let blockset = loop {
            check_cancelled(&ctx.token)?;
            match stream.blocks.recv().await {
                Some(BlockData::Chunk { hash, payload, .. }) => {
                    acc.add_block(&hash, payload).await?;
                }
                Some(BlockData::Done { length, full_hash }) => {
                    break acc.finish(length, &full_hash).await?;
                }
                Some(BlockData::Failed { error }) => {
                    return Err(Error::user(format!("source stream failed: {error}")));
                }
                None => {
                    return Err(Error::user("source stream ended without a terminator"));
                }
            }
        };
        Some(blockset)
    } else {
        // Folders and symlinks drain the placeholder terminator.
        while stream.blocks.recv().await.is_some() {}
        None
    };

    let metadata_blob = entry.metadata.to_bytes()?;
    let metadata_blockset = store_buffer(ctx, store, &metadata_blob).await?;
    let (metadata_id, blockset_id) = {
        let guard = ctx.catalog.lock().await;
        let metadata_id = guard.register_metadataset(metadata_blockset)?;
        let blockset_id = match entry.kind {
            EntryKind::File => content_blockset.expect("file carries a content blockset"),
            EntryKind::Folder => BlocksetId::FOLDER,
            EntryKind::Symlink => BlocksetId::SYMLINK,
        };
        guard.add_file(
            ctx.fileset,
            &entry.stored_path,
            blockset_id,
            metadata_id,
            entry.metadata.mtime,
        )?;
        (metadata_id, blockset_id)
    };
    trace!(
        path = %entry.stored_path,
        blockset = blockset_id.0,
        metadata = metadata_id.0,
        "file recorded"
    );
    Ok(())
}

/// Store a small in-memory stream (metadata blobs) through the same block
/// path as file content.
async fn store_buffer(
    ctx: &PipelineContext,
    store: &mpsc::Sender<StoreBlock>,
    data: &[u8],
) -> Result<BlocksetId> {
    let mut acc = BlocksetAccumulator::new(ctx, store);
    for chunk in data.chunks(ctx.config.blocksize) {
        let block_hash = hash::to_base64(&ctx.config.block_hash.digest(chunk));
        acc.add_block(&block_hash, chunk.to_vec()).await?;
    }
    let full_hash = hash::to_base64(&ctx.config.file_hash.digest(data));
    acc.finish(data.len() as i64, &full_hash).await
}

struct BlocksetAccumulator<'a> {
    ctx: &'a PipelineContext,
    store: &'a mpsc::Sender<StoreBlock>,
    blocks: Vec<(String, i64)>,
    raw_hashes: Vec<u8>,
    blocklist_hashes: Vec<String>,
}

impl<'a> BlocksetAccumulator<'a> {
    fn new(ctx: &'a PipelineContext, store: &'a mpsc::Sender<StoreBlock>) -> Self {
        Self {
            ctx,
            store,
            blocks: Vec::new(),
            raw_hashes: Vec::new(),
            blocklist_hashes: Vec::new(),
        }
    }

    /// Register one block; the catalog insert-or-return is the dedup
    /// serialization point shared by all processors.
    async fn add_block(&mut self, block_hash: &str, payload: Vec<u8>) -> Result<()> {
        let size = payload.len() as i64;
        let volume = self.ctx.open_volumes.any();
        let (block_id, is_new) = {
            let guard = self.ctx.catalog.lock().await;
            guard.register_block(block_hash, size, volume)?
        };
        let _ = self
            .ctx
            .progress
            .send(ProgressEvent::BlockProcessed {
                new: is_new,
                bytes: size as u64,
            })
            .await;
        if is_new
            && self
                .store
                .send(StoreBlock {
                    block_id,
                    hash: block_hash.to_string(),
                    payload,
                    is_blocklist: false,
                })
                .await
                .is_err()
        {
            return Err(Error::Cancelled);
        }

        self.blocks.push((block_hash.to_string(), size));
        self.raw_hashes.extend_from_slice(&hash::from_base64(block_hash)?);
        let capacity =
            self.ctx.config.hashes_per_blocklist() * self.ctx.config.block_hash.digest_len();
        if self.raw_hashes.len() >= capacity {
            self.flush_blocklist().await?;
        }
        Ok(())
    }

    async fn flush_blocklist(&mut self) -> Result<()> {
        let payload = std::mem::take(&mut self.raw_hashes);
        let list_hash = hash::to_base64(&self.ctx.config.block_hash.digest(&payload));
        let volume = self.ctx.open_volumes.any();
        let (block_id, is_new) = {
            let guard = self.ctx.catalog.lock().await;
            guard.register_block(&list_hash, payload.len() as i64, volume)?
        };
        if is_new
            && self
                .store
                .send(StoreBlock {
                    block_id,
                    hash: list_hash.clone(),
                    payload,
                    is_blocklist: true,
                })
                .await
                .is_err()
        {
            return Err(Error::Cancelled);
        }
        self.blocklist_hashes.push(list_hash);
        Ok(())
    }

    async fn finish(mut self, length: i64, full_hash: &str) -> Result<BlocksetId> {
        // Single-block streams carry no blocklist; the dlist references
        // them by their full hash alone.
        if self.blocks.len() > 1 && !self.raw_hashes.is_empty() {
            self.flush_blocklist().await?;
        }
        let guard = self.ctx.catalog.lock().await;
        let (blockset, created) = guard.register_blockset(full_hash, length, &self.blocks)?;
        if created {
            for (index, list_hash) in self.blocklist_hashes.iter().enumerate() {
                guard.register_blocklist_hash(blockset, index as i64, list_hash)?;
            }
        }
        Ok(blockset)
    }
}

// -- data block processor ----------------------------------------------

/// Tracks the open blocks volume of each data block processor so block
/// registration can name a live Temporary volume.
#[derive(Clone, Default)]
pub(crate) struct OpenVolumes(Arc<std::sync::Mutex<Vec<VolumeId>>>);

impl OpenVolumes {
    pub fn new(slots: usize) -> Self {
        Self(Arc::new(std::sync::Mutex::new(vec![VolumeId(0); slots])))
    }

    pub fn set(&self, slot: usize, volume: VolumeId) {
        let mut slots = self.0.lock().expect("open-volume set poisoned");
        if slot >= slots.len() {
            slots.resize(slot + 1, VolumeId(0));
        }
        slots[slot] = volume;
    }

    /// Any live open volume; the owning processor re-homes the block when
    /// it lands elsewhere.
    pub fn any(&self) -> VolumeId {
        let slots = self.0.lock().expect("open-volume set poisoned");
        slots.first().copied().unwrap_or(VolumeId(0))
    }
}

pub(crate) struct OpenVolume {
    writer: BlockVolumeWriter,
    volume_id: VolumeId,
    slot: usize,
}

impl OpenVolume {
    pub(crate) async fn create(ctx: &PipelineContext, slot: usize) -> Result<Self> {
        let writer = BlockVolumeWriter::create(
            ctx.config,
            &ctx.options.prefix,
            ctx.container,
            ctx.timestamp,
            ctx.encryption_ext.as_deref(),
        )?;
        let volume_id = {
            let guard = ctx.catalog.lock().await;
            guard.register_volume(
                writer.remote_name(),
                common::VolumeType::Blocks,
                common::VolumeState::Temporary,
            )?
        };
        ctx.open_volumes.set(slot, volume_id);
        debug!(name = writer.remote_name(), "opened blocks volume");
        Ok(Self {
            writer,
            volume_id,
            slot,
        })
    }

    /// Finalize the current writer and open a fresh volume in its place.
    async fn replace(&mut self, ctx: &PipelineContext) -> Result<(VolumeId, FinalizedVolume)> {
        let next = Self::create(ctx, self.slot).await?;
        let old = std::mem::replace(self, next);
        Ok((old.volume_id, old.writer.finalize()?))
    }
}

/// Data block processor: write new blocks into the open volume, rotate at
/// `volume_size`, emit the paired index volume and queue both for upload.
/// Runs with K copies, each owning its volume.
#[instrument(skip_all)]
pub(crate) async fn data_block_processor(
    ctx: Arc<PipelineContext>,
    mut open: OpenVolume,
    input: SharedReceiver<StoreBlock>,
    spill: mpsc::Sender<SpillItem>,
    uploads: mpsc::Sender<UploadItem>,
) -> Result<()> {
    while let Some(block) = input.recv().await {
        if ctx.token.is_cancelled() {
            break;
        }
        let size = block.payload.len() as u64;
        if open.writer.block_count() > 0
            && open.writer.payload_size() + size > ctx.options.volume_size
        {
            let (old_id, finalized) = open.replace(&ctx).await?;
            emit_volume(&ctx, old_id, finalized, &uploads).await?;
        }

        {
            let guard = ctx.catalog.lock().await;
            guard.set_block_volume(block.block_id, open.volume_id)?;
        }
        if block.is_blocklist {
            open.writer.add_blocklist_block(&block.hash, &block.payload)?;
        } else {
            open.writer.add_block(&block.hash, &block.payload)?;
        }
    }

    if open.writer.block_count() > 0 {
        let finalized = open.writer.finalize()?;
        let _ = spill
            .send(SpillItem {
                volume_id: open.volume_id,
                finalized,
            })
            .await;
    } else {
        let guard = ctx.catalog.lock().await;
        guard.remove_volume(open.volume_id)?;
    }
    Ok(())
}

/// Record a finalized blocks volume, build its paired index volume, and
/// queue both for upload: blocks strictly before its index.
pub(crate) async fn emit_volume(
    ctx: &PipelineContext,
    block_volume: VolumeId,
    finalized: FinalizedVolume,
    uploads: &mpsc::Sender<UploadItem>,
) -> Result<()> {
    let mut index_writer = IndexVolumeWriter::create(
        ctx.config,
        &ctx.options.prefix,
        ctx.container,
        ctx.timestamp,
        ctx.encryption_ext.as_deref(),
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
    for (list_hash, payload) in &finalized.blocklists {
        index_writer.add_blocklist(list_hash, payload)?;
    }

    let index_volume = {
        let guard = ctx.catalog.lock().await;
        guard.set_volume_info(block_volume, finalized.size, &finalized.hash)?;
        let index_volume = guard.register_volume(
            index_writer.remote_name(),
            common::VolumeType::Index,
            common::VolumeState::Temporary,
        )?;
        guard.add_index_link(index_volume, block_volume)?;
        index_volume
    };

    let finalized_index = index_writer.finalize()?;
    {
        let guard = ctx.catalog.lock().await;
        guard.set_volume_info(index_volume, finalized_index.size, &finalized_index.hash)?;
    }

    let block_bytes = finalized.size as u64;
    if uploads
        .send(UploadItem {
            volume_id: block_volume,
            remote_name: finalized.remote_name.clone(),
            staging: finalized.staging,
            bytes: block_bytes,
        })
        .await
        .is_err()
    {
        return Err(Error::Cancelled);
    }
    if uploads
        .send(UploadItem {
            volume_id: index_volume,
            remote_name: finalized_index.remote_name.clone(),
            staging: finalized_index.staging,
            bytes: finalized_index.size as u64,
        })
        .await
        .is_err()
    {
        return Err(Error::Cancelled);
    }
    Ok(())
}

// -- spill collector ----------------------------------------------------

/// Merge the partial volumes left open by the data block processors and
/// queue the result; a single leftover uploads as-is.
pub(crate) async fn spill_collector(
    ctx: Arc<PipelineContext>,
    mut spill: mpsc::Receiver<SpillItem>,
    uploads: mpsc::Sender<UploadItem>,
) -> Result<()> {
    let mut items = Vec::new();
    while let Some(item) = spill.recv().await {
        items.push(item);
    }
    if items.is_empty() {
        return Ok(());
    }
    if items.len() == 1 {
        let item = items.pop().expect("one spill item");
        return emit_volume(&ctx, item.volume_id, item.finalized, &uploads).await;
    }

    debug!(count = items.len(), "merging spilled volumes");
    // The data block processors are gone by now; their first slot is free.
    let mut target = OpenVolume::create(&ctx, 0).await?;

    for item in items {
        let container = RemoteName::parse(&item.finalized.remote_name)?.container;
        let mut reader =
            BlockVolumeReader::open(item.finalized.staging.path(), container, ctx.config, false)?;
        let blocklists: HashSet<&str> = item
            .finalized
            .blocklists
            .iter()
            .map(|(hash, _)| hash.as_str())
            .collect();

        for (block_hash, size) in &item.finalized.blocks {
            if target.writer.block_count() > 0
                && target.writer.payload_size() + *size as u64 > ctx.options.volume_size
            {
                let (old_id, finalized) = target.replace(&ctx).await?;
                emit_volume(&ctx, old_id, finalized, &uploads).await?;
            }
            let payload = reader.read_block(block_hash)?;
            {
                let guard = ctx.catalog.lock().await;
                let id = guard.block_id(block_hash, *size)?.ok_or_else(|| {
                    Error::consistency(format!("spilled block {block_hash} is not catalogued"))
                })?;
                guard.set_block_volume(id, target.volume_id)?;
            }
            if blocklists.contains(block_hash.as_str()) {
                target.writer.add_blocklist_block(block_hash, &payload)?;
            } else {
                target.writer.add_block(block_hash, &payload)?;
            }
        }

        let guard = ctx.catalog.lock().await;
        guard.remove_volume(item.volume_id)?;
    }

    if target.writer.block_count() > 0 {
        let volume_id = target.volume_id;
        let finalized = target.writer.finalize()?;
        emit_volume(&ctx, volume_id, finalized, &uploads).await?;
    } else {
        let guard = ctx.catalog.lock().await;
        guard.remove_volume(target.volume_id)?;
    }
    Ok(())
}

// -- uploader -----------------------------------------------------------

/// Single uploader: at most one in-flight put, FIFO, so a blocks volume
/// always lands before its index volume.
pub(crate) async fn uploader(
    ctx: Arc<PipelineContext>,
    mut items: mpsc::Receiver<UploadItem>,
) -> Result<()> {
    let mut failure: Option<Error> = None;
    while let Some(item) = items.recv().await {
        if failure.is_some() || ctx.token.is_cancelled() {
            // Leftover staging files drop here; their rows stay Temporary
            // for the resume path.
            continue;
        }
        match ctx
            .manager
            .upload_volume(&ctx.catalog, item.volume_id, &item.remote_name, item.staging.path())
            .await
        {
            Ok(()) => {
                let _ = ctx
                    .progress
                    .send(ProgressEvent::VolumeUploaded { bytes: item.bytes })
                    .await;
            }
            Err(err) => {
                ctx.token.cancel();
                failure = Some(err);
            }
        }
    }
    match failure {
        None => Ok(()),
        Some(err) => Err(err),
    }
}
