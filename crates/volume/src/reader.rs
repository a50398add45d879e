use std::path::Path;

use common::{hash, Error, Result};

use crate::container::{ArchiveRead, ContainerKind};
use crate::manifest::{FilelistEntry, FilesetMarker, IndexVolumeRecord, VolumeManifest};
use crate::writer::{
    BLOCKLIST_DIR, CONTROL_DIR, FILELIST_ENTRY, FILESET_ENTRY, MANIFEST_ENTRY, VOLUME_DIR,
};
use crate::BlockConfig;

fn open_checked(
    path: &Path,
    container: ContainerKind,
    config: &BlockConfig,
    check_manifest: bool,
) -> Result<(Box<dyn ArchiveRead>, VolumeManifest)> {
    let mut archive = container.reader(path)?;
    let manifest: VolumeManifest = serde_json::from_slice(&archive.read_entry(MANIFEST_ENTRY)?)?;
    if check_manifest {
        manifest.check_compatible(config)?;
    }
    Ok((archive, manifest))
}

/// Reader over a downloaded dblock volume.
pub struct BlockVolumeReader {
    archive: Box<dyn ArchiveRead>,
    manifest: VolumeManifest,
    config: BlockConfig,
}

impl BlockVolumeReader {
    pub fn open(
        path: &Path,
        container: ContainerKind,
        config: BlockConfig,
        check_manifest: bool,
    ) -> Result<Self> {
        let (archive, manifest) = open_checked(path, container, &config, check_manifest)?;
        Ok(Self {
            archive,
            manifest,
            config,
        })
    }

    pub fn manifest(&self) -> &VolumeManifest {
        &self.manifest
    }

    /// Catalog-form hashes of every block entry in the volume.
    pub fn block_hashes(&self) -> Result<Vec<String>> {
        self.archive
            .entry_names()
            .into_iter()
            .filter(|name| name != MANIFEST_ENTRY)
            .map(|name| hash::url_safe_to_base64(&name))
            .collect()
    }

    pub fn read_block(&mut self, hash_b64: &str) -> Result<Vec<u8>> {
        let entry = hash::base64_to_url_safe(hash_b64)?;
        self.archive.read_entry(&entry)
    }

    /// Read a block and fail with an integrity error unless its bytes hash
    /// back to the requested identity.
    pub fn read_block_verified(&mut self, hash_b64: &str, size: i64) -> Result<Vec<u8>> {
        let data = self.read_block(hash_b64)?;
        if data.len() as i64 != size {
            return Err(Error::integrity(format!(
                "block {hash_b64} is {} bytes, catalog says {size}",
                data.len()
            )));
        }
        let computed = hash::to_base64(&self.config.block_hash.digest(&data));
        if computed != hash_b64 {
            return Err(Error::integrity(format!(
                "block payload hashes to {computed}, expected {hash_b64}"
            )));
        }
        Ok(data)
    }
}

/// One `vol/` record of a dindex volume.
pub type IndexVolumeEntry = IndexVolumeRecord;

/// Reader over a downloaded dindex volume.
pub struct IndexVolumeReader {
    archive: Box<dyn ArchiveRead>,
}

impl IndexVolumeReader {
    pub fn open(
        path: &Path,
        container: ContainerKind,
        config: BlockConfig,
        check_manifest: bool,
    ) -> Result<Self> {
        let (archive, _) = open_checked(path, container, &config, check_manifest)?;
        Ok(Self { archive })
    }

    /// The dblock descriptions this index carries.
    pub fn volumes(&mut self) -> Result<Vec<IndexVolumeEntry>> {
        let names: Vec<String> = self
            .archive
            .entry_names()
            .into_iter()
            .filter(|name| name.starts_with(VOLUME_DIR))
            .collect();
        let mut records = Vec::with_capacity(names.len());
        for name in names {
            let record: IndexVolumeRecord = serde_json::from_slice(&self.archive.read_entry(&name)?)?;
            records.push(record);
        }
        Ok(records)
    }

    /// Blocklist payloads, keyed by their catalog-form hash.
    pub fn blocklists(&mut self) -> Result<Vec<(String, Vec<u8>)>> {
        let names: Vec<String> = self
            .archive
            .entry_names()
            .into_iter()
            .filter(|name| name.starts_with(BLOCKLIST_DIR))
            .collect();
        let mut lists = Vec::with_capacity(names.len());
        for name in names {
            let hash_b64 = hash::url_safe_to_base64(&name[BLOCKLIST_DIR.len()..])?;
            let payload = self.archive.read_entry(&name)?;
            lists.push((hash_b64, payload));
        }
        Ok(lists)
    }
}

/// Reader over a downloaded dlist volume.
pub struct FilesetVolumeReader {
    archive: Box<dyn ArchiveRead>,
    manifest: VolumeManifest,
}

impl FilesetVolumeReader {
    pub fn open(
        path: &Path,
        container: ContainerKind,
        config: BlockConfig,
        check_manifest: bool,
    ) -> Result<Self> {
        let (archive, manifest) = open_checked(path, container, &config, check_manifest)?;
        Ok(Self { archive, manifest })
    }

    pub fn manifest(&self) -> &VolumeManifest {
        &self.manifest
    }

    /// Partial backups record a false marker; a missing marker reads as a
    /// full backup from an older writer.
    pub fn is_full_backup(&mut self) -> Result<bool> {
        if !self.archive.has_entry(FILESET_ENTRY) {
            return Ok(true);
        }
        let marker: FilesetMarker = serde_json::from_slice(&self.archive.read_entry(FILESET_ENTRY)?)?;
        Ok(marker.is_full_backup)
    }

    pub fn entries(&mut self) -> Result<Vec<FilelistEntry>> {
        let data = self.archive.read_entry(FILELIST_ENTRY)?;
        Ok(serde_json::from_slice(&data)?)
    }

    pub fn control_files(&mut self) -> Result<Vec<(String, Vec<u8>)>> {
        let names: Vec<String> = self
            .archive
            .entry_names()
            .into_iter()
            .filter(|name| name.starts_with(CONTROL_DIR))
            .collect();
        let mut files = Vec::with_capacity(names.len());
        for name in names {
            let data = self.archive.read_entry(&name)?;
            files.push((name[CONTROL_DIR.len()..].to_string(), data));
        }
        Ok(files)
    }
}
