use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tempfile::NamedTempFile;
use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};

use catalog::{Catalog, VolumeRow};
use common::{tempfiles, Error, Options, Result, VolumeId, VolumeState};
use volume::{BlockConfig, Encryptor, RemoteName};

use crate::{Backend, RemoteFileInfo, SharedCatalog};

/// Outcome of reconciling the remote listing against the catalog.
#[derive(Debug, Default)]
pub struct ListingDelta {
    /// Catalogued as present remotely, absent from the listing.
    pub missing: Vec<VolumeRow>,
    /// Present but with a different size than recorded.
    pub mismatched: Vec<(VolumeRow, i64)>,
    /// Remote files carrying our prefix with no catalog row.
    pub extra: Vec<RemoteFileInfo>,
    /// Uploaded volumes confirmed by the listing this pass.
    pub verified: usize,
}

impl ListingDelta {
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty() && self.mismatched.is_empty() && self.extra.is_empty()
    }

    pub fn describe(&self) -> String {
        format!(
            "{} missing, {} size-mismatched, {} unknown extra",
            self.missing.len(),
            self.mismatched.len(),
            self.extra.len()
        )
    }
}

/// Drives the remote volume state machine.
///
/// Every backend side-effect is bracketed by catalog transitions committed
/// before the effect becomes observable to later stages; transient failures
/// retry with capped backoff inside this type.
pub struct RemoteManager {
    backend: Arc<dyn Backend>,
    encryptor: Arc<dyn Encryptor>,
    config: BlockConfig,
    prefix: String,
    retries: u32,
    delete_grace: Duration,
    dryrun: bool,
}

impl RemoteManager {
    pub fn new(
        backend: Arc<dyn Backend>,
        encryptor: Arc<dyn Encryptor>,
        config: BlockConfig,
        options: &Options,
    ) -> Self {
        Self {
            backend,
            encryptor,
            config,
            prefix: options.prefix.clone(),
            retries: options.retries.max(1),
            delete_grace: options.delete_grace,
            dryrun: options.dryrun,
        }
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn encryption_extension(&self) -> Option<&'static str> {
        let ext = self.encryptor.extension();
        (!ext.is_empty()).then_some(ext)
    }

    /// Upload one finalized staging file as `remote_name`.
    ///
    /// The row moves Temporary -> Uploading before any byte leaves, and to
    /// Uploaded only after the backend acknowledged; a failed upload drops
    /// back to Temporary for reassignment.
    #[instrument(skip_all, fields(name = remote_name))]
    pub async fn upload_volume(
        &self,
        catalog: &SharedCatalog,
        volume: VolumeId,
        remote_name: &str,
        staging: &Path,
    ) -> Result<()> {
        commit_point(catalog, |cat| {
            cat.set_volume_state(volume, VolumeState::Uploading)
        })
        .await?;

        if self.dryrun {
            info!("dryrun: skipping upload");
            commit_point(catalog, |cat| {
                cat.set_volume_state(volume, VolumeState::Uploaded)
            })
            .await?;
            return Ok(());
        }

        let mut encrypted_staging = None;
        if !self.encryptor.is_identity() {
            let staged = tempfiles::staging_file()?;
            self.encryptor.encrypt(staging, staged.path())?;
            encrypted_staging = Some(staged);
        }
        let upload_path: &Path = encrypted_staging
            .as_ref()
            .map(|staged| staged.path())
            .unwrap_or(staging);

        let uploaded = self
            .with_retry("upload", || self.backend.put(remote_name, upload_path))
            .await;
        drop(encrypted_staging);

        match uploaded {
            Ok(()) => {
                commit_point(catalog, |cat| {
                    cat.set_volume_state(volume, VolumeState::Uploaded)
                })
                .await?;
                debug!("upload settled");
                Ok(())
            }
            Err(err) => {
                commit_point(catalog, |cat| {
                    cat.set_volume_state(volume, VolumeState::Temporary)
                })
                .await?;
                Err(err)
            }
        }
    }

    /// Download `remote_name` into a fresh staging file, inverting the
    /// encryption transform and checking recorded size and hash.
    #[instrument(skip_all, fields(name = remote_name))]
    pub async fn download_volume(
        &self,
        catalog: &SharedCatalog,
        remote_name: &str,
    ) -> Result<NamedTempFile> {
        let expected = {
            let guard = catalog.lock().await;
            guard.volume_by_name(remote_name)?
        };
        let staging = self.download_raw(remote_name).await?;
        if let Some(row) = expected {
            self.check_volume_file(&row, staging.path())?;
        }
        Ok(staging)
    }

    /// Fetch the remote bytes only; decryption and verification are the
    /// caller's stages. Used by the pipelined restore network.
    pub async fn fetch_file(&self, remote_name: &str) -> Result<NamedTempFile> {
        let fetched = tempfiles::staging_file()?;
        self.with_retry("download", || self.backend.get(remote_name, fetched.path()))
            .await?;
        Ok(fetched)
    }

    /// Verify a fetched file against its catalog row, then invert the
    /// encryption transform.
    pub async fn decrypt_file(
        &self,
        catalog: &SharedCatalog,
        remote_name: &str,
        fetched: NamedTempFile,
    ) -> Result<NamedTempFile> {
        let expected = {
            let guard = catalog.lock().await;
            guard.volume_by_name(remote_name)?
        };
        if let Some(row) = expected {
            self.check_volume_file(&row, fetched.path())?;
        }
        if RemoteName::parse(remote_name)
            .ok()
            .and_then(|n| n.encryption)
            .is_some()
            && !self.encryptor.is_identity()
        {
            let clear = tempfiles::staging_file()?;
            self.encryptor.decrypt(fetched.path(), clear.path())?;
            return Ok(clear);
        }
        Ok(fetched)
    }

    /// Download without consulting the catalog; repair uses this for
    /// volumes the catalog does not know yet.
    pub async fn download_raw(&self, remote_name: &str) -> Result<NamedTempFile> {
        let fetched = tempfiles::staging_file()?;
        self.with_retry("download", || self.backend.get(remote_name, fetched.path()))
            .await?;

        if RemoteName::parse(remote_name)
            .ok()
            .and_then(|n| n.encryption)
            .is_some()
            && !self.encryptor.is_identity()
        {
            let clear = tempfiles::staging_file()?;
            self.encryptor.decrypt(fetched.path(), clear.path())?;
            return Ok(clear);
        }
        Ok(fetched)
    }

    fn check_volume_file(&self, row: &VolumeRow, path: &Path) -> Result<()> {
        // Size and hash exist only after finalization; both recorded
        // against the uploaded (post-transform) bytes, so only identity
        // transforms can be re-checked here.
        if !self.encryptor.is_identity() {
            return Ok(());
        }
        let (size, hash) = volume::hash_file(self.config.file_hash, path)?;
        if let Some(expected) = row.size {
            if expected != size {
                return Err(Error::integrity(format!(
                    "{} is {size} bytes, catalog says {expected}",
                    row.name
                )));
            }
        }
        if let Some(expected) = &row.hash {
            if expected != &hash {
                return Err(Error::integrity(format!(
                    "{} hashes to {hash}, catalog says {expected}",
                    row.name
                )));
            }
        }
        Ok(())
    }

    /// Compare the remote listing with the catalog.
    ///
    /// With `update_states` set, volumes found intact advance from
    /// Uploaded to Verified.
    pub async fn verify_remote_listing(
        &self,
        catalog: &SharedCatalog,
        update_states: bool,
    ) -> Result<ListingDelta> {
        let listing = self
            .with_retry("list", || self.backend.list())
            .await?;
        let mut delta = ListingDelta::default();

        let volumes = {
            let guard = catalog.lock().await;
            guard.list_volumes()?
        };
        let by_name: std::collections::HashMap<&str, &RemoteFileInfo> =
            listing.iter().map(|f| (f.name.as_str(), f)).collect();

        let mut to_verify = Vec::new();
        for row in &volumes {
            match row.state {
                VolumeState::Uploaded | VolumeState::Verified => match by_name.get(row.name.as_str())
                {
                    None => delta.missing.push(row.clone()),
                    Some(found) => {
                        if let Some(expected) = row.size {
                            if expected != found.size {
                                delta.mismatched.push((row.clone(), found.size));
                                continue;
                            }
                        }
                        if row.state == VolumeState::Uploaded {
                            to_verify.push(row.id);
                        }
                    }
                },
                // Temporary/Uploading/Deleting rows are in flight; resume
                // or deletion logic owns them.
                _ => {}
            }
        }

        let known: std::collections::HashSet<&str> =
            volumes.iter().map(|v| v.name.as_str()).collect();
        for file in &listing {
            if !known.contains(file.name.as_str())
                && RemoteName::matches_prefix(&file.name, &self.prefix)
            {
                delta.extra.push(file.clone());
            }
        }

        if update_states && !to_verify.is_empty() {
            delta.verified = to_verify.len();
            commit_point(catalog, |cat| {
                for id in &to_verify {
                    cat.set_volume_state(*id, VolumeState::Verified)?;
                }
                Ok(())
            })
            .await?;
        }

        if !delta.is_clean() {
            warn!(delta = %delta.describe(), "remote listing disagrees with the catalog");
        }
        Ok(delta)
    }

    /// Move a volume into Deleting with its grace stamp; catalog-only.
    pub async fn start_delete(
        &self,
        catalog: &SharedCatalog,
        volume: VolumeId,
        now: i64,
    ) -> Result<()> {
        let grace_until = now + self.delete_grace.as_secs() as i64;
        commit_point(catalog, |cat| cat.set_volume_deleting(volume, grace_until)).await
    }

    /// Issue physical deletes for every Deleting volume and finish the
    /// transition for those the listing confirms gone or whose grace
    /// window has lapsed.
    pub async fn execute_deletes(&self, catalog: &SharedCatalog, now: i64) -> Result<usize> {
        let deleting: Vec<VolumeRow> = {
            let guard = catalog.lock().await;
            guard
                .list_volumes()?
                .into_iter()
                .filter(|v| v.state == VolumeState::Deleting)
                .collect()
        };
        if deleting.is_empty() {
            return Ok(0);
        }

        for row in &deleting {
            if self.dryrun {
                info!(name = %row.name, "dryrun: skipping delete");
            } else {
                self.with_retry("delete", || self.backend.delete(&row.name))
                    .await?;
            }
        }

        let listing = if self.dryrun {
            Vec::new()
        } else {
            self.with_retry("list", || self.backend.list()).await?
        };
        let present: std::collections::HashSet<&str> =
            listing.iter().map(|f| f.name.as_str()).collect();

        let mut removed = 0usize;
        for row in &deleting {
            let grace_expired = row.delete_grace_until.map(|g| g <= now).unwrap_or(true);
            let confirmed_gone = self.dryrun || !present.contains(row.name.as_str());
            if confirmed_gone || grace_expired {
                commit_point(catalog, |cat| {
                    cat.set_volume_state(row.id, VolumeState::Deleted)?;
                    cat.remove_volume(row.id)
                })
                .await?;
                removed += 1;
            } else {
                debug!(name = %row.name, "delete pending grace window");
            }
        }
        Ok(removed)
    }

    async fn with_retry<'a, T, Fut>(
        &'a self,
        what: &str,
        mut attempt_fn: impl FnMut() -> Fut + 'a,
    ) -> Result<T>
    where
        Fut: std::future::Future<Output = Result<T>> + 'a,
    {
        let mut last: Option<Error> = None;
        for attempt in 0..self.retries {
            if attempt > 0 {
                let delay = Duration::from_millis(500 * (1 << attempt.min(5)));
                sleep(delay.min(Duration::from_secs(10))).await;
            }
            match attempt_fn().await {
                Ok(value) => return Ok(value),
                Err(err @ (Error::Cancelled | Error::Integrity(_))) => return Err(err),
                Err(err) => {
                    warn!(%err, attempt, what, "remote operation failed");
                    last = Some(err);
                }
            }
        }
        Err(Error::Transient {
            attempts: self.retries,
            source: anyhow::Error::new(last.expect("at least one attempt ran")),
        })
    }
}

/// Run catalog mutations at a durable commit point: reuse the caller's
/// open transaction, or wrap the closure in a fresh one.
pub async fn commit_point<T>(
    catalog: &SharedCatalog,
    f: impl FnOnce(&Catalog) -> Result<T>,
) -> Result<T> {
    let mut guard = catalog.lock().await;
    let owns = !guard.in_transaction();
    if owns {
        guard.begin()?;
    }
    let result = f(&guard);
    if owns {
        if result.is_ok() {
            guard.commit()?;
        } else {
            guard.rollback()?;
        }
    }
    result
}
