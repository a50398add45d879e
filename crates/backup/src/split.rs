use std::io::Read;

use tokio::sync::mpsc;

use common::{check_cancelled, hash, EntryKind, Result};

use crate::enumerate::SourceEntry;
use crate::progress::ProgressEvent;
use crate::PipelineContext;

/// Per-file bound of in-flight block payloads between one splitter and its
/// file block processor.
const BLOCK_CHANNEL_BOUND: usize = 8;

/// One content block cut from a stream, or the stream terminator.
#[derive(Debug)]
pub(crate) enum BlockData {
    Chunk {
        index: i64,
        hash: String,
        payload: Vec<u8>,
    },
    Done {
        length: i64,
        full_hash: String,
    },
    Failed {
        error: String,
    },
}

/// A file handed from a splitter to a file block processor: the header plus
/// a bounded stream of its content blocks.
pub(crate) struct FileStream {
    pub entry: SourceEntry,
    pub blocks: mpsc::Receiver<BlockData>,
}

/// Stream splitter: read each file, cut fixed-size blocks, hash them and
/// the whole stream. Runs with N copies pulling from a shared receiver.
pub(crate) async fn stream_splitter(
    ctx: std::sync::Arc<PipelineContext>,
    input: remote::util::SharedReceiver<SourceEntry>,
    out: mpsc::Sender<FileStream>,
) -> Result<()> {
    while let Some(entry) = input.recv().await {
        check_cancelled(&ctx.token)?;

        let (block_tx, block_rx) = mpsc::channel(BLOCK_CHANNEL_BOUND);
        let stream = FileStream {
            entry: entry.clone(),
            blocks: block_rx,
        };
        if out.send(stream).await.is_err() {
            return Ok(());
        }

        if entry.kind != EntryKind::File {
            let _ = block_tx
                .send(BlockData::Done {
                    length: 0,
                    full_hash: hash::to_base64(&ctx.config.file_hash.digest(&[])),
                })
                .await;
            continue;
        }

        if let Err(error) = split_file(&ctx, &entry, &block_tx).await {
            let _ = block_tx
                .send(BlockData::Failed {
                    error: error.to_string(),
                })
                .await;
            let _ = ctx
                .progress
                .send(ProgressEvent::Warning(format!(
                    "cannot read {}: {error}",
                    entry.stored_path
                )))
                .await;
        }
    }
    Ok(())
}

async fn split_file(
    ctx: &PipelineContext,
    entry: &SourceEntry,
    blocks: &mpsc::Sender<BlockData>,
) -> Result<()> {
    let mut file = std::fs::File::open(&entry.fs_path)
        .map_err(|e| common::Error::path(&entry.fs_path, e))?;
    let blocksize = ctx.config.blocksize;
    let mut full_hasher = ctx.config.file_hash.hasher();
    let mut index = 0i64;
    let mut length = 0i64;

    loop {
        check_cancelled(&ctx.token)?;
        let mut payload = vec![0u8; blocksize];
        let mut filled = 0usize;
        while filled < blocksize {
            let read = file.read(&mut payload[filled..])?;
            if read == 0 {
                break;
            }
            filled += read;
        }
        if filled == 0 {
            break;
        }
        payload.truncate(filled);
        full_hasher.update(&payload);
        length += filled as i64;

        let block_hash = hash::to_base64(&ctx.config.block_hash.digest(&payload));
        if blocks
            .send(BlockData::Chunk {
                index,
                hash: block_hash,
                payload,
            })
            .await
            .is_err()
        {
            return Ok(());
        }
        index += 1;
        if filled < blocksize {
            break;
        }
    }

    let _ = blocks
        .send(BlockData::Done {
            length,
            full_hash: hash::to_base64(&full_hasher.finalize()),
        })
        .await;
    Ok(())
}
