//! Phase 3, pipelined flavor: a CSP-style network of file processors,
//! a block manager batching requests per volume, a caching volume manager,
//! and a download → decrypt → decompress chain feeding it.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use tempfile::NamedTempFile;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, instrument, warn};

use catalog::{RestorePlan, PLAN_METADATA};
use common::{hash, CancellationToken, Error, FileId, Result, VolumeId};
use remote::util::SharedReceiver;
use remote::{RemoteManager, SharedCatalog};
use volume::{BlockConfig, BlockVolumeReader, RemoteName};

use crate::local::open_for_patching;
use crate::RestoreOutcome;

/// Everything a decompressed volume offers the block manager.
struct DecodedVolume {
    blocks: HashMap<String, Vec<u8>>,
}

enum BlockReply {
    Bytes(Vec<u8>),
    Unavailable(String),
}

struct BlockRequest {
    volume_id: VolumeId,
    hash: String,
    size: i64,
    respond: oneshot::Sender<BlockReply>,
}

enum VolumeMsg {
    Need(VolumeId),
    Evict(VolumeId),
}

struct VolumeReady {
    volume_id: VolumeId,
    decoded: std::result::Result<Arc<DecodedVolume>, String>,
}

/// Stages of the fetch chain hand volumes (or their failure) onward.
enum StagedVolume {
    Fetched {
        volume_id: VolumeId,
        name: String,
        staging: NamedTempFile,
    },
    Failed {
        volume_id: VolumeId,
        error: String,
    },
}

struct FileResult {
    file_id: FileId,
    metadata_parts: BTreeMap<i64, Vec<u8>>,
    broken: Option<String>,
}

/// Run the pipelined patcher over every block the plan still needs.
#[instrument(skip_all)]
pub(crate) async fn patch_pipelined(
    catalog: &SharedCatalog,
    manager: &Arc<RemoteManager>,
    plan: &RestorePlan,
    config: BlockConfig,
    options: &common::Options,
    token: &CancellationToken,
    outcome: &mut RestoreOutcome,
) -> Result<()> {
    let bound = options.restore_channel_buffer_size.max(1);
    let file_processors = common::Options::effective_concurrency(options.concurrency_file_processors);
    let downloaders = common::Options::effective_concurrency(options.concurrency_downloaders);
    let decryptors = options.concurrency_decryptors.max(1);
    let decompressors = options.concurrency_decompressors.max(1);

    // The plan decides the work list and the expected per-volume request
    // counts up front; the block manager evicts a cached volume exactly
    // when its count drains.
    let (work, expected, names, placement) = {
        let guard = catalog.lock().await;
        let volumes = guard.plan_pending_volumes(plan)?;
        let mut expected: HashMap<VolumeId, usize> = HashMap::new();
        let mut names: HashMap<VolumeId, String> = HashMap::new();
        for volume in &volumes {
            expected.insert(*volume, guard.plan_pending_blocks_in_volume(plan, *volume)?.len());
            let row = guard.volume_by_id(*volume)?.ok_or_else(|| {
                Error::consistency(format!("plan names unknown volume {}", volume.0))
            })?;
            names.insert(*volume, row.name);
        }
        let files = guard.plan_files(plan)?;
        let placement: HashMap<FileId, (Option<String>, i64)> = files
            .iter()
            .map(|f| (f.file_id, (f.target_path.clone(), f.length)))
            .collect();
        let work: Vec<FileId> = files
            .iter()
            .filter(|f| !guard.plan_pending_blocks_for_file(plan, f.file_id).map(|v| v.is_empty()).unwrap_or(true))
            .map(|f| f.file_id)
            .collect();
        (work, expected, names, placement)
    };
    if work.is_empty() {
        return Ok(());
    }
    debug!(files = work.len(), volumes = expected.len(), "pipelined restore starting");

    let (file_tx, file_rx) = mpsc::channel::<FileId>(bound);
    let (request_tx, request_rx) = mpsc::channel::<BlockRequest>(bound);
    let (volmsg_tx, volmsg_rx) = mpsc::channel::<VolumeMsg>(bound);
    let (ready_tx, ready_rx) = mpsc::channel::<VolumeReady>(bound);
    let (fetch_tx, fetch_rx) = mpsc::channel::<(VolumeId, String)>(bound);
    let (fetched_tx, fetched_rx) = mpsc::channel::<StagedVolume>(bound);
    let (clear_tx, clear_rx) = mpsc::channel::<StagedVolume>(bound);
    let (decoded_tx, decoded_rx) = mpsc::channel::<VolumeReady>(bound);
    let (result_tx, mut result_rx) = mpsc::channel::<FileResult>(bound);

    let mut handles = Vec::new();

    // FileLister.
    {
        let token = token.clone();
        handles.push(tokio::spawn(async move {
            for file in work {
                if token.is_cancelled() || file_tx.send(file).await.is_err() {
                    break;
                }
            }
            Ok::<(), Error>(())
        }));
    }

    // FileProcessors.
    let shared_files = SharedReceiver::new(file_rx);
    for _ in 0..file_processors {
        let catalog = catalog.clone();
        let plan = plan.clone();
        let shared = shared_files.clone();
        let requests = request_tx.clone();
        let results = result_tx.clone();
        let placement = placement.clone();
        let token = token.clone();
        handles.push(tokio::spawn(async move {
            while let Some(file_id) = shared.recv().await {
                if token.is_cancelled() {
                    break;
                }
                let result = match process_file(&catalog, &plan, config, file_id, &placement, &requests).await {
                    Ok(result) => result,
                    Err(err) => FileResult {
                        file_id,
                        metadata_parts: BTreeMap::new(),
                        broken: Some(err.to_string()),
                    },
                };
                if results.send(result).await.is_err() {
                    break;
                }
            }
            Ok::<(), Error>(())
        }));
    }
    drop(request_tx);
    drop(result_tx);

    // BlockManager.
    {
        let full_verification = options.full_block_verification;
        handles.push(tokio::spawn(block_manager(
            request_rx,
            ready_rx,
            volmsg_tx,
            expected,
            config,
            full_verification,
        )));
    }

    // VolumeManager with its cache.
    handles.push(tokio::spawn(volume_manager(
        volmsg_rx,
        decoded_rx,
        ready_tx,
        fetch_tx,
        names,
    )));

    // VolumeDownloaders.
    let shared_fetches = SharedReceiver::new(fetch_rx);
    for _ in 0..downloaders {
        let manager = manager.clone();
        let shared = shared_fetches.clone();
        let out = fetched_tx.clone();
        handles.push(tokio::spawn(async move {
            while let Some((volume_id, name)) = shared.recv().await {
                let staged = match manager.fetch_file(&name).await {
                    Ok(staging) => StagedVolume::Fetched {
                        volume_id,
                        name,
                        staging,
                    },
                    Err(err) => StagedVolume::Failed {
                        volume_id,
                        error: err.to_string(),
                    },
                };
                if out.send(staged).await.is_err() {
                    break;
                }
            }
            Ok::<(), Error>(())
        }));
    }
    drop(fetched_tx);

    // VolumeDecryptors.
    let shared_fetched = SharedReceiver::new(fetched_rx);
    for _ in 0..decryptors {
        let manager = manager.clone();
        let catalog = catalog.clone();
        let shared = shared_fetched.clone();
        let out = clear_tx.clone();
        handles.push(tokio::spawn(async move {
            while let Some(staged) = shared.recv().await {
                let next = match staged {
                    StagedVolume::Fetched {
                        volume_id,
                        name,
                        staging,
                    } => match manager.decrypt_file(&catalog, &name, staging).await {
                        Ok(clear) => StagedVolume::Fetched {
                            volume_id,
                            name,
                            staging: clear,
                        },
                        Err(err) => StagedVolume::Failed {
                            volume_id,
                            error: err.to_string(),
                        },
                    },
                    failed => failed,
                };
                if out.send(next).await.is_err() {
                    break;
                }
            }
            Ok::<(), Error>(())
        }));
    }
    drop(clear_tx);

    // VolumeDecompressors.
    let shared_clear = SharedReceiver::new(clear_rx);
    let check_manifests = !options.disable_filelist_consistency_checks;
    for _ in 0..decompressors {
        let shared = shared_clear.clone();
        let out = decoded_tx.clone();
        handles.push(tokio::spawn(async move {
            while let Some(staged) = shared.recv().await {
                let ready = match staged {
                    StagedVolume::Fetched {
                        volume_id,
                        name,
                        staging,
                    } => VolumeReady {
                        volume_id,
                        decoded: decode_volume(&name, staging, config, check_manifests)
                            .map(Arc::new)
                            .map_err(|err| err.to_string()),
                    },
                    StagedVolume::Failed { volume_id, error } => VolumeReady {
                        volume_id,
                        decoded: Err(error),
                    },
                };
                if out.send(ready).await.is_err() {
                    break;
                }
            }
            Ok::<(), Error>(())
        }));
    }
    drop(decoded_tx);

    // Gather per-file results while the network runs.
    let mut failures: Vec<String> = Vec::new();
    while let Some(result) = result_rx.recv().await {
        if let Some(reason) = result.broken {
            outcome.broken.insert(result.file_id, reason);
        }
        if !result.metadata_parts.is_empty() {
            outcome.metadata_parts.insert(result.file_id, result.metadata_parts);
        }
        // Blocks served by the network are marked restored here, keeping
        // catalog writes on one task.
        let guard = catalog.lock().await;
        for block in guard.plan_pending_blocks_for_file(plan, result.file_id)? {
            guard.mark_plan_block_restored(plan, block.file_id, block.kind, block.index)?;
        }
    }

    for handle in handles {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => failures.push(err.to_string()),
            Err(join_err) => failures.push(join_err.to_string()),
        }
    }
    if !failures.is_empty() {
        return Err(Error::user(format!(
            "pipelined restore failed: {}",
            failures.join("; ")
        )));
    }
    Ok(())
}

async fn process_file(
    catalog: &SharedCatalog,
    plan: &RestorePlan,
    config: BlockConfig,
    file_id: FileId,
    placement: &HashMap<FileId, (Option<String>, i64)>,
    requests: &mpsc::Sender<BlockRequest>,
) -> Result<FileResult> {
    let pending = {
        let guard = catalog.lock().await;
        guard.plan_pending_blocks_for_file(plan, file_id)?
    };
    let mut result = FileResult {
        file_id,
        metadata_parts: BTreeMap::new(),
        broken: None,
    };
    let (target, length) = placement
        .get(&file_id)
        .cloned()
        .unwrap_or((None, 0));
    let mut writer: Option<std::fs::File> = None;

    for block in pending {
        let (reply_tx, reply_rx) = oneshot::channel();
        if requests
            .send(BlockRequest {
                volume_id: block.volume_id,
                hash: block.hash.clone(),
                size: block.size,
                respond: reply_tx,
            })
            .await
            .is_err()
        {
            result.broken.get_or_insert("restore network closed".into());
            break;
        }
        let reply = reply_rx
            .await
            .unwrap_or(BlockReply::Unavailable("block manager vanished".into()));

        match reply {
            BlockReply::Bytes(payload) => {
                if block.kind == PLAN_METADATA {
                    result.metadata_parts.insert(block.index, payload);
                } else if let Some(target) = &target {
                    let out = match &mut writer {
                        Some(out) => out,
                        None => writer
                            .insert(open_for_patching(Path::new(target), length as u64)?),
                    };
                    out.seek(SeekFrom::Start(
                        block.index as u64 * config.blocksize as u64,
                    ))?;
                    out.write_all(&payload)?;
                }
            }
            BlockReply::Unavailable(reason) => {
                warn!(hash = %block.hash, %reason, "block unavailable");
                result.broken.get_or_insert(reason);
            }
        }
    }
    if let Some(out) = writer {
        out.sync_all()?;
    }
    Ok(result)
}

/// Serve block requests out of decoded volumes, instructing the volume
/// manager what to fetch and when a volume may leave the cache.
async fn block_manager(
    mut requests: mpsc::Receiver<BlockRequest>,
    mut ready: mpsc::Receiver<VolumeReady>,
    volumes: mpsc::Sender<VolumeMsg>,
    expected: HashMap<VolumeId, usize>,
    config: BlockConfig,
    full_verification: bool,
) -> Result<()> {
    let mut available: HashMap<VolumeId, std::result::Result<Arc<DecodedVolume>, String>> =
        HashMap::new();
    let mut waiting: HashMap<VolumeId, Vec<BlockRequest>> = HashMap::new();
    let mut requested: HashSet<VolumeId> = HashSet::new();
    let mut served: HashMap<VolumeId, usize> = HashMap::new();
    let mut inbox_open = true;

    loop {
        tokio::select! {
            request = requests.recv(), if inbox_open => {
                match request {
                    None => {
                        inbox_open = false;
                        if waiting.values().all(Vec::is_empty) {
                            break;
                        }
                    }
                    Some(request) => {
                        let volume_id = request.volume_id;
                        if let Some(decoded) = available.get(&volume_id) {
                            serve(decoded, request, config, full_verification);
                            bump(&mut served, &expected, &volumes, volume_id).await;
                        } else {
                            waiting.entry(volume_id).or_default().push(request);
                            if requested.insert(volume_id) {
                                if volumes.send(VolumeMsg::Need(volume_id)).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                }
            }
            arrived = ready.recv() => {
                let Some(arrived) = arrived else { break };
                let volume_id = arrived.volume_id;
                available.insert(volume_id, arrived.decoded);
                let decoded = available.get(&volume_id).expect("just inserted");
                for request in waiting.remove(&volume_id).unwrap_or_default() {
                    serve(decoded, request, config, full_verification);
                    *served.entry(volume_id).or_default() += 1;
                }
                maybe_evict(&served, &expected, &volumes, volume_id).await;
                if !inbox_open && waiting.values().all(Vec::is_empty) {
                    break;
                }
            }
        }
    }
    Ok(())
}

fn serve(
    decoded: &std::result::Result<Arc<DecodedVolume>, String>,
    request: BlockRequest,
    config: BlockConfig,
    full_verification: bool,
) {
    let reply = match decoded {
        Err(error) => BlockReply::Unavailable(error.clone()),
        Ok(volume) => match volume.blocks.get(&request.hash) {
            None => BlockReply::Unavailable(format!("volume lacks block {}", request.hash)),
            Some(bytes) if bytes.len() as i64 != request.size => BlockReply::Unavailable(
                format!("block {} has the wrong size", request.hash),
            ),
            Some(bytes) => {
                if full_verification
                    && hash::to_base64(&config.block_hash.digest(bytes)) != request.hash
                {
                    BlockReply::Unavailable(format!("block {} fails its hash", request.hash))
                } else {
                    BlockReply::Bytes(bytes.clone())
                }
            }
        },
    };
    let _ = request.respond.send(reply);
}

async fn bump(
    served: &mut HashMap<VolumeId, usize>,
    expected: &HashMap<VolumeId, usize>,
    volumes: &mpsc::Sender<VolumeMsg>,
    volume_id: VolumeId,
) {
    *served.entry(volume_id).or_default() += 1;
    maybe_evict(served, expected, volumes, volume_id).await;
}

async fn maybe_evict(
    served: &HashMap<VolumeId, usize>,
    expected: &HashMap<VolumeId, usize>,
    volumes: &mpsc::Sender<VolumeMsg>,
    volume_id: VolumeId,
) {
    let done = served.get(&volume_id).copied().unwrap_or(0)
        >= expected.get(&volume_id).copied().unwrap_or(usize::MAX);
    if done {
        let _ = volumes.send(VolumeMsg::Evict(volume_id)).await;
    }
}

/// Own the decoded-volume cache and the fetch dispatch.
async fn volume_manager(
    mut messages: mpsc::Receiver<VolumeMsg>,
    mut decoded: mpsc::Receiver<VolumeReady>,
    ready: mpsc::Sender<VolumeReady>,
    fetches: mpsc::Sender<(VolumeId, String)>,
    names: HashMap<VolumeId, String>,
) -> Result<()> {
    let mut cache: HashMap<VolumeId, std::result::Result<Arc<DecodedVolume>, String>> =
        HashMap::new();
    let mut in_flight: HashSet<VolumeId> = HashSet::new();

    loop {
        tokio::select! {
            message = messages.recv() => {
                match message {
                    None => break,
                    Some(VolumeMsg::Evict(volume_id)) => {
                        cache.remove(&volume_id);
                    }
                    Some(VolumeMsg::Need(volume_id)) => {
                        if let Some(hit) = cache.get(&volume_id) {
                            let _ = ready
                                .send(VolumeReady { volume_id, decoded: hit.clone() })
                                .await;
                        } else if in_flight.insert(volume_id) {
                            let name = names.get(&volume_id).cloned().unwrap_or_default();
                            if fetches.send((volume_id, name)).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
            arrived = decoded.recv() => {
                let Some(arrived) = arrived else { break };
                in_flight.remove(&arrived.volume_id);
                cache.insert(arrived.volume_id, arrived.decoded.clone());
                if ready.send(arrived).await.is_err() {
                    break;
                }
            }
        }
    }
    Ok(())
}

/// Inflate a clear volume file into its block map.
fn decode_volume(
    name: &str,
    staging: NamedTempFile,
    config: BlockConfig,
    check_manifests: bool,
) -> Result<DecodedVolume> {
    let container = RemoteName::parse(name)?.container;
    let mut reader = BlockVolumeReader::open(staging.path(), container, config, check_manifests)?;
    let mut blocks = HashMap::new();
    for block_hash in reader.block_hashes()? {
        let bytes = reader.read_block(&block_hash)?;
        blocks.insert(block_hash, bytes);
    }
    Ok(DecodedVolume { blocks })
}
