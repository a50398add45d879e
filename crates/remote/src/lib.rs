//! Remote side of the engine: the storage backend seam, the local-folder
//! backend, and the manager that drives the volume state machine with
//! every backend side-effect bracketed by catalog transitions.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::Mutex;

use common::{Error, Result};

mod manager;
pub mod util;

pub use manager::{commit_point, ListingDelta, RemoteManager};

/// Catalog handle shared across the tasks of one operation.
pub type SharedCatalog = Arc<Mutex<catalog::Catalog>>;

/// One remote file as reported by a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFileInfo {
    pub name: String,
    pub size: i64,
}

/// Transport seam to the untrusted object store.
///
/// Implementations move opaque files by name; retries, state transitions
/// and integrity checks live in [`RemoteManager`].
pub trait Backend: Send + Sync {
    fn put<'a>(&'a self, name: &'a str, source: &'a Path) -> BoxFuture<'a, Result<()>>;

    fn get<'a>(&'a self, name: &'a str, target: &'a Path) -> BoxFuture<'a, Result<()>>;

    fn list(&self) -> BoxFuture<'_, Result<Vec<RemoteFileInfo>>>;

    fn delete<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<()>>;
}

/// Local-directory destination; doubles as the test backend.
#[derive(Debug, Clone)]
pub struct FileBackend {
    root: PathBuf,
}

impl FileBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn target(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

impl Backend for FileBackend {
    fn put<'a>(&'a self, name: &'a str, source: &'a Path) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            tokio::fs::create_dir_all(&self.root)
                .await
                .map_err(|e| Error::path(&self.root, e))?;
            let target = self.target(name);
            let staged = self.target(&format!(".{name}.part"));
            tokio::fs::copy(source, &staged)
                .await
                .map_err(|e| Error::path(source, e))?;
            tokio::fs::rename(&staged, &target)
                .await
                .map_err(|e| Error::path(&target, e))?;
            Ok(())
        })
    }

    fn get<'a>(&'a self, name: &'a str, target: &'a Path) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let source = self.target(name);
            tokio::fs::copy(&source, target)
                .await
                .map_err(|e| Error::path(&source, e))?;
            Ok(())
        })
    }

    fn list(&self) -> BoxFuture<'_, Result<Vec<RemoteFileInfo>>> {
        Box::pin(async move {
            let mut files = Vec::new();
            let mut entries = match tokio::fs::read_dir(&self.root).await {
                Ok(entries) => entries,
                // An absent destination lists as empty; first upload creates it.
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(files),
                Err(err) => return Err(Error::path(&self.root, err)),
            };
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with('.') {
                    continue;
                }
                let meta = entry.metadata().await?;
                if meta.is_file() {
                    files.push(RemoteFileInfo {
                        name,
                        size: meta.len() as i64,
                    });
                }
            }
            files.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(files)
        })
    }

    fn delete<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let target = self.target(name);
            match tokio::fs::remove_file(&target).await {
                Ok(()) => Ok(()),
                // Deleting an already-gone file settles the same state.
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(err) => Err(Error::path(&target, err)),
            }
        })
    }
}
