use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tokio::sync::mpsc;
use tracing::debug;
use walkdir::WalkDir;

use common::policy::path_is_included;
use common::{
    check_cancelled, CancellationToken, EntryKind, FileMetadata, HardlinkPolicy, Options, Result,
    SymlinkPolicy,
};

use crate::progress::ProgressEvent;

/// One filesystem object bound for the pipeline.
#[derive(Debug, Clone)]
pub struct SourceEntry {
    pub fs_path: PathBuf,
    /// Catalog path: absolute, folders keep a trailing separator.
    pub stored_path: String,
    pub kind: EntryKind,
    pub size: u64,
    pub metadata: FileMetadata,
}

fn capture_metadata(meta: &std::fs::Metadata, symlink_target: Option<String>) -> FileMetadata {
    let mtime = meta
        .modified()
        .ok()
        .and_then(|m| m.duration_since(std::time::SystemTime::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    #[cfg(unix)]
    let mode = {
        use std::os::unix::fs::PermissionsExt;
        Some(meta.permissions().mode())
    };
    #[cfg(not(unix))]
    let mode = None;
    FileMetadata {
        mode,
        mtime,
        symlink_target,
        read_only: meta.permissions().readonly(),
    }
}

#[cfg(unix)]
fn hardlink_key(meta: &std::fs::Metadata) -> Option<(u64, u64, u64)> {
    use std::os::unix::fs::MetadataExt;
    (meta.nlink() > 1).then(|| (meta.dev(), meta.ino(), meta.nlink()))
}

#[cfg(not(unix))]
fn hardlink_key(_meta: &std::fs::Metadata) -> Option<(u64, u64, u64)> {
    None
}

pub(crate) fn stored_path_for(path: &Path, is_dir: bool) -> String {
    let mut stored = path.to_string_lossy().into_owned();
    if is_dir && !stored.ends_with('/') {
        stored.push('/');
    }
    stored
}

/// Walk every source root, honoring filters and policies, and feed the
/// metadata pre-processor. Per-entry failures are warnings; only catalog
/// or channel loss aborts.
pub(crate) async fn enumerator(
    sources: Vec<PathBuf>,
    options: std::sync::Arc<Options>,
    blacklist: Vec<PathBuf>,
    token: CancellationToken,
    out: mpsc::Sender<SourceEntry>,
    progress: mpsc::Sender<ProgressEvent>,
) -> Result<()> {
    let blacklist: HashSet<PathBuf> = blacklist.into_iter().collect();
    let mut seen_inodes: HashSet<(u64, u64)> = HashSet::new();
    let follow = options.symlink_policy == SymlinkPolicy::Follow;

    for source in sources {
        let walker = WalkDir::new(&source).follow_links(follow).sort_by_file_name();
        for entry in walker {
            check_cancelled(&token)?;

            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    let _ = progress
                        .send(ProgressEvent::Warning(format!("enumeration failed: {err}")))
                        .await;
                    continue;
                }
            };
            let path = entry.path();
            if blacklist.contains(path) {
                continue;
            }

            let is_symlink = entry.path_is_symlink() && !follow;
            let meta = match if is_symlink {
                std::fs::symlink_metadata(path)
            } else {
                entry.metadata().map_err(|e| {
                    std::io::Error::other(e.to_string())
                })
            } {
                Ok(meta) => meta,
                Err(err) => {
                    let _ = progress
                        .send(ProgressEvent::Warning(format!(
                            "cannot stat {}: {err}",
                            path.display()
                        )))
                        .await;
                    continue;
                }
            };

            let (kind, symlink_target) = if is_symlink {
                match options.symlink_policy {
                    SymlinkPolicy::Ignore => continue,
                    SymlinkPolicy::Store => {
                        let target = std::fs::read_link(path)
                            .map(|t| t.to_string_lossy().into_owned())
                            .unwrap_or_default();
                        (EntryKind::Symlink, Some(target))
                    }
                    // Unreachable with follow_links(true); kept for walkers
                    // that surface dangling links unresolved.
                    SymlinkPolicy::Follow => continue,
                }
            } else if meta.is_dir() {
                (EntryKind::Folder, None)
            } else {
                (EntryKind::File, None)
            };

            let stored_path = stored_path_for(path, kind == EntryKind::Folder);

            if !path_is_included(&options.filters, &stored_path) {
                debug!(path = %stored_path, "excluded by filter");
                continue;
            }
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                if options.file_attribute_filter.excludes_name(name) {
                    continue;
                }
            }

            if kind == EntryKind::File {
                if let Some((dev, ino, _)) = hardlink_key(&meta) {
                    match options.hardlink_policy {
                        HardlinkPolicy::All => {}
                        HardlinkPolicy::None => continue,
                        HardlinkPolicy::First => {
                            if !seen_inodes.insert((dev, ino)) {
                                continue;
                            }
                        }
                    }
                }
            }

            let size = if kind == EntryKind::File { meta.len() } else { 0 };
            let entry = SourceEntry {
                fs_path: path.to_path_buf(),
                stored_path,
                kind,
                size,
                metadata: capture_metadata(&meta, symlink_target),
            };
            if out.send(entry).await.is_err() {
                // Downstream closed: the pipeline is shutting down.
                return Ok(());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(
        sources: Vec<PathBuf>,
        options: Options,
        blacklist: Vec<PathBuf>,
    ) -> Vec<SourceEntry> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async move {
            let (tx, mut rx) = mpsc::channel(256);
            let (ptx, mut prx) = mpsc::channel(256);
            let token = CancellationToken::new();
            let walker = tokio::spawn(enumerator(
                sources,
                std::sync::Arc::new(options),
                blacklist,
                token,
                tx,
                ptx,
            ));
            let mut entries = Vec::new();
            while let Some(entry) = rx.recv().await {
                entries.push(entry);
            }
            while prx.recv().await.is_some() {}
            walker.await.unwrap().unwrap();
            entries
        })
    }

    #[test]
    fn test_enumerates_files_folders_and_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("src");
        std::fs::create_dir_all(root.join("sub")).unwrap();
        std::fs::write(root.join("a.txt"), b"alpha").unwrap();
        std::fs::write(root.join("sub/b.txt"), b"beta").unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink("a.txt", root.join("ln")).unwrap();

        let entries = collect(vec![root.clone()], Options::default(), Vec::new());
        let paths: Vec<&str> = entries.iter().map(|e| e.stored_path.as_str()).collect();
        assert!(paths.iter().any(|p| p.ends_with("src/")));
        assert!(paths.iter().any(|p| p.ends_with("a.txt")));
        assert!(paths.iter().any(|p| p.ends_with("sub/")));
        assert!(paths.iter().any(|p| p.ends_with("b.txt")));

        #[cfg(unix)]
        {
            let link = entries
                .iter()
                .find(|e| e.kind == EntryKind::Symlink)
                .expect("symlink enumerated");
            assert_eq!(link.metadata.symlink_target.as_deref(), Some("a.txt"));
        }

        let file = entries.iter().find(|e| e.stored_path.ends_with("a.txt")).unwrap();
        assert_eq!(file.size, 5);
        assert!(file.metadata.mtime > 0);
    }

    #[test]
    fn test_blacklist_and_filters() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("src");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("keep.txt"), b"1").unwrap();
        std::fs::write(root.join("skip.tmp"), b"2").unwrap();
        std::fs::write(root.join("catalog.db"), b"3").unwrap();

        let options = Options {
            filters: vec![common::FilterRule::exclude("*.tmp").unwrap()],
            ..Options::default()
        };
        let entries = collect(
            vec![root.clone()],
            options,
            vec![root.join("catalog.db")],
        );
        let paths: Vec<&str> = entries.iter().map(|e| e.stored_path.as_str()).collect();
        assert!(paths.iter().any(|p| p.ends_with("keep.txt")));
        assert!(!paths.iter().any(|p| p.ends_with("skip.tmp")));
        assert!(!paths.iter().any(|p| p.ends_with("catalog.db")));
    }
}
