use std::io::{Seek, SeekFrom, Write};

use tempfile::NamedTempFile;

use common::{hash, tempfiles, Error, Result, VolumeType};

use crate::container::{ArchiveWrite, ContainerKind};
use crate::manifest::{FilelistEntry, FilesetMarker, IndexVolumeRecord, VolumeManifest};
use crate::naming::RemoteName;
use crate::BlockConfig;

pub const MANIFEST_ENTRY: &str = "manifest";
pub const FILESET_ENTRY: &str = "fileset";
pub const FILELIST_ENTRY: &str = "filelist.json";
pub const BLOCKLIST_DIR: &str = "list/";
pub const VOLUME_DIR: &str = "vol/";
pub const CONTROL_DIR: &str = "control/";

/// A finished staging file ready for upload, with the facts the catalog
/// records about it.
pub struct FinalizedVolume {
    pub remote_name: String,
    pub kind: VolumeType,
    /// Staging file; dropped (and unlinked) once the upload settles.
    pub staging: NamedTempFile,
    pub size: i64,
    pub hash: String,
    pub payload_size: u64,
    /// Blocks written, in write order (dblock only).
    pub blocks: Vec<(String, i64)>,
    /// Blocklist payloads written (dblock only); the paired dindex
    /// republishes them.
    pub blocklists: Vec<(String, Vec<u8>)>,
}

fn new_archive(
    config: &BlockConfig,
    name: &RemoteName,
) -> Result<(NamedTempFile, Box<dyn ArchiveWrite>)> {
    let staging = tempfiles::staging_file()?;
    let file = staging.as_file().try_clone()?;
    let mut archive = name.container.writer(file)?;
    let manifest = VolumeManifest::new(config, name.timestamp);
    archive.add_entry(MANIFEST_ENTRY, &serde_json::to_vec(&manifest)?)?;
    Ok((staging, archive))
}

fn finalize(
    config: &BlockConfig,
    name: &RemoteName,
    staging: NamedTempFile,
    archive: Box<dyn ArchiveWrite>,
    payload_size: u64,
    blocks: Vec<(String, i64)>,
    blocklists: Vec<(String, Vec<u8>)>,
) -> Result<FinalizedVolume> {
    archive.finish()?;
    let (size, file_hash) = crate::hash_file(config.file_hash, staging.path())?;
    Ok(FinalizedVolume {
        remote_name: name.to_string(),
        kind: name.kind,
        staging,
        size,
        hash: file_hash,
        payload_size,
        blocks,
        blocklists,
    })
}

/// Writer for one dblock volume: entries are url-safe block hashes, payloads
/// are the raw block bytes.
pub struct BlockVolumeWriter {
    config: BlockConfig,
    name: RemoteName,
    rendered_name: String,
    staging: NamedTempFile,
    archive: Box<dyn ArchiveWrite>,
    payload_size: u64,
    blocks: Vec<(String, i64)>,
    blocklists: Vec<(String, Vec<u8>)>,
}

impl BlockVolumeWriter {
    pub fn create(
        config: BlockConfig,
        prefix: &str,
        container: ContainerKind,
        timestamp: i64,
        encryption: Option<&str>,
    ) -> Result<Self> {
        let name = RemoteName::generate(prefix, VolumeType::Blocks, container, timestamp, encryption);
        let (staging, archive) = new_archive(&config, &name)?;
        Ok(Self {
            config,
            rendered_name: name.to_string(),
            name,
            staging,
            archive,
            payload_size: 0,
            blocks: Vec::new(),
            blocklists: Vec::new(),
        })
    }

    pub fn remote_name(&self) -> &str {
        &self.rendered_name
    }

    /// Payload bytes written so far; drives the `volume_size` rotation.
    pub fn payload_size(&self) -> u64 {
        self.payload_size
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn add_block(&mut self, hash_b64: &str, data: &[u8]) -> Result<()> {
        let entry = hash::base64_to_url_safe(hash_b64)?;
        self.archive.add_entry(&entry, data)?;
        self.payload_size += data.len() as u64;
        self.blocks.push((hash_b64.to_string(), data.len() as i64));
        Ok(())
    }

    /// A blocklist block is a regular block whose payload the paired index
    /// volume republishes under `list/`.
    pub fn add_blocklist_block(&mut self, hash_b64: &str, payload: &[u8]) -> Result<()> {
        self.add_block(hash_b64, payload)?;
        self.blocklists
            .push((hash_b64.to_string(), payload.to_vec()));
        Ok(())
    }

    pub fn finalize(self) -> Result<FinalizedVolume> {
        finalize(
            &self.config,
            &self.name,
            self.staging,
            self.archive,
            self.payload_size,
            self.blocks,
            self.blocklists,
        )
    }
}

/// Writer for one dindex volume describing its paired dblock volumes.
pub struct IndexVolumeWriter {
    config: BlockConfig,
    name: RemoteName,
    rendered_name: String,
    staging: NamedTempFile,
    archive: Box<dyn ArchiveWrite>,
    payload_size: u64,
}

impl IndexVolumeWriter {
    pub fn create(
        config: BlockConfig,
        prefix: &str,
        container: ContainerKind,
        timestamp: i64,
        encryption: Option<&str>,
    ) -> Result<Self> {
        let name = RemoteName::generate(prefix, VolumeType::Index, container, timestamp, encryption);
        let (staging, archive) = new_archive(&config, &name)?;
        Ok(Self {
            config,
            rendered_name: name.to_string(),
            name,
            staging,
            archive,
            payload_size: 0,
        })
    }

    pub fn remote_name(&self) -> &str {
        &self.rendered_name
    }

    pub fn add_volume(&mut self, record: &IndexVolumeRecord) -> Result<()> {
        let entry = format!("{VOLUME_DIR}{}", record.volumename);
        let data = serde_json::to_vec(record)?;
        self.payload_size += data.len() as u64;
        self.archive.add_entry(&entry, &data)
    }

    pub fn add_blocklist(&mut self, hash_b64: &str, payload: &[u8]) -> Result<()> {
        let entry = format!("{BLOCKLIST_DIR}{}", hash::base64_to_url_safe(hash_b64)?);
        self.payload_size += payload.len() as u64;
        self.archive.add_entry(&entry, payload)
    }

    pub fn finalize(self) -> Result<FinalizedVolume> {
        finalize(
            &self.config,
            &self.name,
            self.staging,
            self.archive,
            self.payload_size,
            Vec::new(),
            Vec::new(),
        )
    }
}

/// Writer for one dlist volume carrying the fileset manifest.
pub struct FilesetVolumeWriter {
    config: BlockConfig,
    name: RemoteName,
    rendered_name: String,
    staging: NamedTempFile,
    archive: Box<dyn ArchiveWrite>,
    payload_size: u64,
    filelist_written: bool,
}

impl FilesetVolumeWriter {
    pub fn create(
        config: BlockConfig,
        prefix: &str,
        container: ContainerKind,
        timestamp: i64,
        encryption: Option<&str>,
    ) -> Result<Self> {
        let name = RemoteName::generate(prefix, VolumeType::Files, container, timestamp, encryption);
        Self::create_with_name(config, name)
    }

    /// Write under a pre-recorded name; used when closing out an
    /// interrupted run whose dlist row already exists.
    pub fn create_with_name(config: BlockConfig, name: RemoteName) -> Result<Self> {
        let (staging, archive) = new_archive(&config, &name)?;
        Ok(Self {
            config,
            rendered_name: name.to_string(),
            name,
            staging,
            archive,
            payload_size: 0,
            filelist_written: false,
        })
    }

    pub fn remote_name(&self) -> &str {
        &self.rendered_name
    }

    /// Write the fileset marker and the filelist, enforcing a single path
    /// convention across all entries.
    pub fn write_filelist(&mut self, is_full_backup: bool, entries: &[FilelistEntry]) -> Result<()> {
        if self.filelist_written {
            return Err(Error::consistency("filelist written twice"));
        }
        check_single_convention(entries)?;

        let marker = FilesetMarker { is_full_backup };
        self.archive
            .add_entry(FILESET_ENTRY, &serde_json::to_vec(&marker)?)?;

        // The filelist can outgrow memory; stage it through a scratch file.
        let mut scratch = tempfiles::staging_file()?;
        serde_json::to_writer(scratch.as_file_mut(), entries)?;
        scratch.as_file_mut().flush()?;
        let len = scratch.as_file().metadata()?.len();
        scratch.as_file_mut().seek(SeekFrom::Start(0))?;
        self.archive
            .add_entry_from_file(FILELIST_ENTRY, scratch.as_file_mut(), len)?;
        self.payload_size += len;
        self.filelist_written = true;
        Ok(())
    }

    /// Optional untouched operator files carried alongside the filelist.
    pub fn add_control_file(&mut self, name: &str, data: &[u8]) -> Result<()> {
        self.payload_size += data.len() as u64;
        self.archive.add_entry(&format!("{CONTROL_DIR}{name}"), data)
    }

    pub fn finalize(self) -> Result<FinalizedVolume> {
        if !self.filelist_written {
            return Err(Error::consistency("dlist finalized without a filelist"));
        }
        finalize(
            &self.config,
            &self.name,
            self.staging,
            self.archive,
            self.payload_size,
            Vec::new(),
            Vec::new(),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PathConvention {
    Unix,
    Windows,
}

fn convention_of(path: &str) -> Result<PathConvention> {
    let has_slash = path.contains('/');
    let has_backslash = path.contains('\\');
    match (has_slash, has_backslash) {
        (true, false) => Ok(PathConvention::Unix),
        (false, true) => Ok(PathConvention::Windows),
        (true, true) => Err(Error::PolicyViolation(format!(
            "path {path:?} mixes separator conventions"
        ))),
        (false, false) => Ok(PathConvention::Unix),
    }
}

fn check_single_convention(entries: &[FilelistEntry]) -> Result<()> {
    let mut seen: Option<PathConvention> = None;
    for entry in entries {
        let convention = convention_of(&entry.path)?;
        match seen {
            None => seen = Some(convention),
            Some(existing) if existing != convention => {
                return Err(Error::PolicyViolation(format!(
                    "filelist mixes {existing:?}- and {convention:?}-style paths at {:?}",
                    entry.path
                )));
            }
            Some(_) => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{EntryKind, Options};

    fn config() -> BlockConfig {
        BlockConfig::from_options(&Options::default())
    }

    fn entry(path: &str) -> FilelistEntry {
        FilelistEntry {
            kind: EntryKind::File,
            path: path.to_string(),
            hash: Some("aGFzaA==".into()),
            size: 4,
            time: 1,
            metahash: "bQ==".into(),
            metasize: 1,
            metablockhash: None,
            blocklists: Vec::new(),
        }
    }

    #[test]
    fn test_mixed_conventions_rejected() {
        let entries = vec![entry("/a/b"), entry("C:\\x\\y")];
        assert!(matches!(
            check_single_convention(&entries),
            Err(Error::PolicyViolation(_))
        ));
        check_single_convention(&[entry("/a/b"), entry("/a/c")]).unwrap();
    }

    #[test]
    fn test_dlist_requires_filelist() {
        let writer = FilesetVolumeWriter::create(
            config(),
            "silo",
            ContainerKind::Zip,
            0,
            None,
        )
        .unwrap();
        assert!(writer.finalize().is_err());
    }

    #[test]
    fn test_block_volume_tracks_payload() {
        let hash_a = common::hash::to_base64(&common::HashAlgorithm::Sha256.digest(b"a"));
        let mut writer =
            BlockVolumeWriter::create(config(), "silo", ContainerKind::Zip, 0, None).unwrap();
        writer.add_block(&hash_a, &[1, 2, 3, 4]).unwrap();
        assert_eq!(writer.payload_size(), 4);
        assert_eq!(writer.block_count(), 1);

        let finalized = writer.finalize().unwrap();
        assert!(finalized.remote_name.ends_with(".dblock.zip"));
        assert_eq!(finalized.blocks, vec![(hash_a, 4)]);
        assert!(finalized.size > 0);
    }
}
