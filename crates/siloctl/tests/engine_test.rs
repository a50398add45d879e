//! End-to-end scenarios over a local-folder destination: backup, restore,
//! delete, compact and repair against real volume files.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;

use catalog::Catalog;
use common::{CancellationToken, Options, VolumeState, VolumeType};
use remote::{FileBackend, RemoteManager, SharedCatalog};
use volume::{BlockConfig, ContainerKind, PassthroughEncryptor, RemoteName};

const BLOCKSIZE: usize = 1024;

struct Rig {
    _dir: tempfile::TempDir,
    root: PathBuf,
    options: Arc<Options>,
}

impl Rig {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let options = Arc::new(Options {
            blocksize: BLOCKSIZE,
            volume_size: 8 * 1024,
            auto_cleanup: true,
            ..Options::default()
        });
        Self {
            _dir: dir,
            root,
            options,
        }
    }

    fn source(&self) -> PathBuf {
        self.root.join("src")
    }

    fn store(&self) -> PathBuf {
        self.root.join("store")
    }

    fn open_catalog(&self) -> SharedCatalog {
        let catalog =
            Catalog::create_or_open(&self.root.join("catalog.db"), &self.options).unwrap();
        Arc::new(Mutex::new(catalog))
    }

    fn manager(&self) -> Arc<RemoteManager> {
        let config = BlockConfig::from_options(&self.options);
        Arc::new(RemoteManager::new(
            Arc::new(FileBackend::new(self.store())),
            Arc::new(PassthroughEncryptor),
            config,
            &self.options,
        ))
    }

    async fn backup(&self, catalog: &SharedCatalog) -> backup::BackupReport {
        backup::run_backup(
            vec![self.source()],
            self.options.clone(),
            catalog.clone(),
            self.manager(),
            CancellationToken::new(),
        )
        .await
        .unwrap()
    }

    async fn restore_into(
        &self,
        catalog: &SharedCatalog,
        target: &Path,
        selection: restore::RestoreSelection,
        legacy: bool,
    ) -> restore::RestoreReport {
        let options = Arc::new(Options {
            restore_legacy: legacy,
            perform_restored_file_verification: true,
            ..(*self.options).clone()
        });
        restore::run_restore(
            Vec::new(),
            Some(target.to_path_buf()),
            selection,
            options,
            catalog.clone(),
            self.manager(),
            CancellationToken::new(),
        )
        .await
        .unwrap()
    }

    fn remote_names(&self, suffix: &str) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(self.store())
            .map(|entries| {
                entries
                    .flatten()
                    .filter_map(|e| e.file_name().to_str().map(String::from))
                    .filter(|name| name.contains(suffix))
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }
}

/// Relative path -> file content (or symlink target, prefixed).
fn tree_of(root: &Path) -> BTreeMap<String, Vec<u8>> {
    let mut tree = BTreeMap::new();
    for entry in walkdir_simple(root) {
        let relative = entry
            .strip_prefix(root)
            .unwrap()
            .to_string_lossy()
            .into_owned();
        let meta = std::fs::symlink_metadata(&entry).unwrap();
        if meta.file_type().is_symlink() {
            let target = std::fs::read_link(&entry).unwrap();
            tree.insert(
                relative,
                format!("-> {}", target.display()).into_bytes(),
            );
        } else if meta.is_file() {
            tree.insert(relative, std::fs::read(&entry).unwrap());
        }
    }
    tree
}

fn walkdir_simple(root: &Path) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else { continue };
        for entry in entries.flatten() {
            let path = entry.path();
            let meta = std::fs::symlink_metadata(&path).unwrap();
            if meta.is_dir() {
                stack.push(path.clone());
            }
            paths.push(path);
        }
    }
    paths.sort();
    paths
}

fn seed_sources(rig: &Rig) {
    let src = rig.source();
    std::fs::create_dir_all(src.join("nested")).unwrap();
    // Multi-block file with repeating content so blocks dedup.
    std::fs::write(src.join("a.bin"), vec![0u8; 5 * BLOCKSIZE]).unwrap();
    // Exactly one block, no blocklist.
    std::fs::write(src.join("exact.bin"), vec![7u8; BLOCKSIZE]).unwrap();
    // Short tail.
    std::fs::write(src.join("nested/tail.txt"), b"short tail content").unwrap();
    // Empty file: zero-length blockset.
    std::fs::write(src.join("empty"), b"").unwrap();
    #[cfg(unix)]
    std::os::unix::fs::symlink("a.bin", src.join("link")).unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn backup_then_restore_round_trips_the_tree() {
    let rig = Rig::new();
    seed_sources(&rig);
    let catalog = rig.open_catalog();

    let report = rig.backup(&catalog).await;
    assert!(!report.interrupted);
    assert!(report.stats.added_files >= 4);

    // One of each volume kind reached the destination.
    assert_eq!(rig.remote_names(".dlist.").len(), 1);
    assert!(!rig.remote_names(".dblock.").is_empty());
    assert_eq!(
        rig.remote_names(".dblock.").len(),
        rig.remote_names(".dindex.").len()
    );

    // a.bin is five identical blocks: the catalog stores that block once.
    {
        let guard = catalog.lock().await;
        guard.verify_consistency(BLOCKSIZE, 32, true).unwrap();
        let zero_block =
            common::hash::to_base64(&common::HashAlgorithm::Sha256.digest(&vec![0u8; BLOCKSIZE]));
        assert!(guard.block_exists(&zero_block, BLOCKSIZE as i64).unwrap());
    }

    let target = rig.root.join("restored");
    let restored = rig
        .restore_into(&catalog, &target, restore::RestoreSelection::Latest, false)
        .await;
    assert!(restored.broken_files.is_empty(), "{:?}", restored.broken_files);
    assert!(restored.verified_files >= 4);

    assert_eq!(tree_of(&rig.source()), tree_of(&target.join("src")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unchanged_backup_produces_only_a_new_dlist() {
    let rig = Rig::new();
    seed_sources(&rig);
    let catalog = rig.open_catalog();

    rig.backup(&catalog).await;
    let dblocks_before = rig.remote_names(".dblock.");
    let dindexes_before = rig.remote_names(".dindex.");

    // Wait out the one-second fileset granularity.
    tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
    let second = rig.backup(&catalog).await;

    assert_eq!(rig.remote_names(".dblock."), dblocks_before);
    assert_eq!(rig.remote_names(".dindex."), dindexes_before);
    assert_eq!(rig.remote_names(".dlist.").len(), 2);

    let changes = second.changes.expect("second run compares to the first");
    assert_eq!(changes.total_changes(), 0);
    assert!(second.stats.inherited_files >= 4);
    assert_eq!(second.stats.new_blocks, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn added_file_shows_in_change_statistics() {
    let rig = Rig::new();
    seed_sources(&rig);
    let catalog = rig.open_catalog();
    rig.backup(&catalog).await;

    std::fs::write(rig.source().join("b.txt"), b"hello").unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
    let second = rig.backup(&catalog).await;

    let changes = second.changes.unwrap();
    assert_eq!(changes.added_files, 1);
    assert_eq!(changes.deleted_files, 0);
    assert_eq!(changes.modified_files, 0);

    let target = rig.root.join("restored");
    rig.restore_into(&catalog, &target, restore::RestoreSelection::Latest, false)
        .await;
    assert_eq!(
        std::fs::read(target.join("src/b.txt")).unwrap(),
        b"hello"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn legacy_and_pipelined_restores_agree() {
    let rig = Rig::new();
    seed_sources(&rig);
    let catalog = rig.open_catalog();
    rig.backup(&catalog).await;

    let legacy_target = rig.root.join("legacy");
    let pipelined_target = rig.root.join("pipelined");
    rig.restore_into(&catalog, &legacy_target, restore::RestoreSelection::Latest, true)
        .await;
    rig.restore_into(
        &catalog,
        &pipelined_target,
        restore::RestoreSelection::Latest,
        false,
    )
    .await;

    assert_eq!(
        tree_of(&legacy_target.join("src")),
        tree_of(&pipelined_target.join("src"))
    );
    assert_eq!(tree_of(&rig.source()), tree_of(&legacy_target.join("src")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn large_blocksets_carry_multiple_blocklists() {
    let rig = Rig::new();
    let src = rig.source();
    std::fs::create_dir_all(&src).unwrap();
    // 40 distinct blocks; a blocklist holds blocksize/32 = 32 hashes, so
    // this blockset needs two blocklist chunks.
    let mut payload = Vec::new();
    for i in 0..40u32 {
        payload.extend(std::iter::repeat(i as u8).take(BLOCKSIZE));
    }
    std::fs::write(src.join("big.bin"), &payload).unwrap();

    let catalog = rig.open_catalog();
    rig.backup(&catalog).await;
    {
        let guard = catalog.lock().await;
        guard.verify_consistency(BLOCKSIZE, 32, true).unwrap();
        let file_hash =
            common::hash::to_base64(&common::HashAlgorithm::Sha256.digest(&payload));
        let blockset = guard
            .blockset_id(&file_hash, payload.len() as i64)
            .unwrap()
            .expect("blockset recorded");
        assert_eq!(guard.blocklist_hashes(blockset).unwrap().len(), 2);
    }

    let target = rig.root.join("restored");
    rig.restore_into(&catalog, &target, restore::RestoreSelection::Latest, false)
        .await;
    assert_eq!(
        std::fs::read(target.join("src/big.bin")).unwrap(),
        payload
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn delete_and_compact_keep_remaining_versions_restorable() {
    let rig = Rig::new();
    let src = rig.source();
    std::fs::create_dir_all(&src).unwrap();
    // Unique content per file so deleting one strands real waste.
    std::fs::write(src.join("keep.bin"), make_bytes(3 * BLOCKSIZE, 1)).unwrap();
    std::fs::write(src.join("drop.bin"), make_bytes(6 * BLOCKSIZE, 2)).unwrap();

    let catalog = rig.open_catalog();
    rig.backup(&catalog).await;

    std::fs::remove_file(src.join("drop.bin")).unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
    rig.backup(&catalog).await;

    // Drop the older version, then compact away its waste.
    let dropped = compact::run_delete(
        &catalog,
        &rig.manager(),
        &rig.options,
        compact::DeleteSelection::Versions(vec![1]),
    )
    .await
    .unwrap();
    assert_eq!(dropped, 1);

    let report = compact::run_compaction(
        &catalog,
        &rig.manager(),
        &rig.options,
        CancellationToken::new(),
        true,
    )
    .await
    .unwrap();
    assert!(report.triggered);

    {
        let guard = catalog.lock().await;
        guard.verify_consistency(BLOCKSIZE, 32, true).unwrap();
        assert_eq!(guard.list_filesets().unwrap().len(), 1);
    }

    let target = rig.root.join("restored");
    let restored = rig
        .restore_into(&catalog, &target, restore::RestoreSelection::Latest, false)
        .await;
    assert!(restored.broken_files.is_empty(), "{:?}", restored.broken_files);
    assert_eq!(tree_of(&rig.source()), tree_of(&target.join("src")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn repair_rebuilds_a_lost_catalog() {
    let rig = Rig::new();
    seed_sources(&rig);
    let catalog = rig.open_catalog();
    rig.backup(&catalog).await;
    let source_tree = tree_of(&rig.source());
    drop(catalog);

    // The catalog file is gone; only the remote volumes remain.
    std::fs::remove_file(rig.root.join("catalog.db")).unwrap();
    let catalog = rig.open_catalog();
    let report = repair::run_repair(
        rig.options.clone(),
        catalog.clone(),
        rig.manager(),
        CancellationToken::new(),
    )
    .await
    .unwrap();
    assert!(!report.partial, "{:?}", report.warnings);
    assert_eq!(report.filesets_rebuilt, 1);

    {
        let guard = catalog.lock().await;
        guard.verify_consistency(BLOCKSIZE, 32, true).unwrap();
    }

    let target = rig.root.join("restored");
    let restored = rig
        .restore_into(&catalog, &target, restore::RestoreSelection::Latest, false)
        .await;
    assert!(restored.broken_files.is_empty(), "{:?}", restored.broken_files);
    assert_eq!(source_tree, tree_of(&target.join("src")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancellation_records_a_partial_backup() {
    let rig = Rig::new();
    seed_sources(&rig);
    let catalog = rig.open_catalog();

    let token = CancellationToken::new();
    token.cancel();
    let report = backup::run_backup(
        vec![rig.source()],
        rig.options.clone(),
        catalog.clone(),
        rig.manager(),
        token,
    )
    .await
    .unwrap();
    assert!(report.interrupted);
    assert_eq!(report.exit_code(), 50);

    // The dlist still went out, marked partial.
    assert_eq!(rig.remote_names(".dlist.").len(), 1);
    {
        let guard = catalog.lock().await;
        let filesets = guard.list_filesets().unwrap();
        assert_eq!(filesets.len(), 1);
        assert!(!filesets[0].is_full);
    }

    // A later run completes a full fileset alongside it.
    tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
    let second = rig.backup(&catalog).await;
    assert!(!second.interrupted);
    {
        let guard = catalog.lock().await;
        let filesets = guard.list_filesets().unwrap();
        assert_eq!(filesets.len(), 2);
        assert!(filesets[0].is_full);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn interrupted_dlist_is_closed_out_with_a_synthetic_filelist() {
    let rig = Rig::new();
    seed_sources(&rig);
    let catalog = rig.open_catalog();
    rig.backup(&catalog).await;

    // Simulate a crash that left a fileset whose dlist never uploaded.
    let stranded_name = RemoteName::generate(
        &rig.options.prefix,
        VolumeType::Files,
        ContainerKind::Zip,
        common::epoch_now() + 5,
        None,
    )
    .to_string();
    {
        let mut guard = catalog.lock().await;
        guard.begin().unwrap();
        let volume = guard
            .register_volume(&stranded_name, VolumeType::Files, VolumeState::Temporary)
            .unwrap();
        guard
            .create_fileset(volume, common::epoch_now() + 5, true)
            .unwrap();
        guard.commit().unwrap();
    }

    tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
    rig.backup(&catalog).await;

    // The stranded dlist was uploaded under its recorded name and its
    // fileset is marked partial.
    assert!(rig.remote_names(".dlist.").contains(&stranded_name));
    {
        let guard = catalog.lock().await;
        let row = guard.volume_by_name(&stranded_name).unwrap().unwrap();
        assert!(matches!(
            row.state,
            VolumeState::Uploaded | VolumeState::Verified
        ));
        let fileset = guard.fileset_for_volume(row.id).unwrap().unwrap();
        assert!(!fileset.is_full);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn overwrite_restore_reuses_matching_local_blocks() {
    let rig = Rig::new();
    seed_sources(&rig);
    let catalog = rig.open_catalog();
    rig.backup(&catalog).await;

    // Restore once, corrupt one file, then restore again with overwrite.
    let target = rig.root.join("restored");
    rig.restore_into(&catalog, &target, restore::RestoreSelection::Latest, false)
        .await;
    std::fs::write(target.join("src/nested/tail.txt"), b"corrupted!").unwrap();

    let options = Arc::new(Options {
        overwrite: true,
        perform_restored_file_verification: true,
        ..(*rig.options).clone()
    });
    let report = restore::run_restore(
        Vec::new(),
        Some(target.clone()),
        restore::RestoreSelection::Latest,
        options,
        catalog.clone(),
        rig.manager(),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert!(report.reused_blocks > 0);
    assert!(report.broken_files.is_empty());
    assert_eq!(tree_of(&rig.source()), tree_of(&target.join("src")));
}

fn make_bytes(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| seed.wrapping_mul(31).wrapping_add((i % 251) as u8))
        .collect()
}
