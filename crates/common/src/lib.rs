use serde::{Deserialize, Serialize};

pub mod error;
pub mod hash;
pub mod lock;
pub mod metadata;
pub mod options;
pub mod policy;
pub mod tempfiles;

pub use error::{Error, Result};
pub use hash::{HashAlgorithm, Hasher};
pub use metadata::FileMetadata;
pub use options::Options;
pub use policy::{
    AttributeFilter, FilterRule, HardlinkPolicy, RetentionPolicy, SnapshotPolicy, SymlinkPolicy,
    UsnPolicy,
};
pub use tokio_util::sync::CancellationToken;

/// Default maximum byte length of a content-addressed block.
pub const DEFAULT_BLOCK_SIZE: usize = 100 * 1024; // 100 KiB

/// Default payload budget of a single blocks volume.
pub const DEFAULT_VOLUME_SIZE: u64 = 50 * 1024 * 1024; // 50 MiB

/// Default remote filename prefix.
pub const DEFAULT_PREFIX: &str = "silo";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockId(pub i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlocksetId(pub i64);

impl BlocksetId {
    /// Sentinel blockset recorded for directory entries.
    pub const FOLDER: BlocksetId = BlocksetId(-100);
    /// Sentinel blockset recorded for symlink entries.
    pub const SYMLINK: BlocksetId = BlocksetId(-200);

    pub fn is_sentinel(self) -> bool {
        self == Self::FOLDER || self == Self::SYMLINK
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetadatasetId(pub i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileId(pub i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FilesetId(pub i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VolumeId(pub i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PrefixId(pub i64);

/// The three kinds of remote volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VolumeType {
    /// Fileset manifest (dlist).
    Files,
    /// Packed block payloads (dblock).
    Blocks,
    /// Blocklists and dblock manifests (dindex).
    Index,
}

impl VolumeType {
    /// Segment used in remote filenames and the catalog.
    pub fn suffix(self) -> &'static str {
        match self {
            VolumeType::Files => "dlist",
            VolumeType::Blocks => "dblock",
            VolumeType::Index => "dindex",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "dlist" => Some(VolumeType::Files),
            "dblock" => Some(VolumeType::Blocks),
            "dindex" => Some(VolumeType::Index),
            _ => None,
        }
    }
}

/// Remote volume lifecycle state.
///
/// Transitions move strictly forward: Temporary -> Uploading -> Uploaded ->
/// Verified -> Deleting -> Deleted, with the catalog row updated before any
/// downstream stage may observe the new state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VolumeState {
    Temporary,
    Uploading,
    Uploaded,
    Verified,
    Deleting,
    Deleted,
}

impl VolumeState {
    pub fn as_str(self) -> &'static str {
        match self {
            VolumeState::Temporary => "Temporary",
            VolumeState::Uploading => "Uploading",
            VolumeState::Uploaded => "Uploaded",
            VolumeState::Verified => "Verified",
            VolumeState::Deleting => "Deleting",
            VolumeState::Deleted => "Deleted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Temporary" => Some(VolumeState::Temporary),
            "Uploading" => Some(VolumeState::Uploading),
            "Uploaded" => Some(VolumeState::Uploaded),
            "Verified" => Some(VolumeState::Verified),
            "Deleting" => Some(VolumeState::Deleting),
            "Deleted" => Some(VolumeState::Deleted),
            _ => None,
        }
    }

    /// States in which a volume may still be referenced by live blocks.
    pub fn holds_data(self) -> bool {
        !matches!(self, VolumeState::Deleted)
    }
}

/// Kind of a filelist entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    File,
    Folder,
    Symlink,
}

impl EntryKind {
    pub fn sentinel(self) -> Option<BlocksetId> {
        match self {
            EntryKind::File => None,
            EntryKind::Folder => Some(BlocksetId::FOLDER),
            EntryKind::Symlink => Some(BlocksetId::SYMLINK),
        }
    }

    pub fn from_blockset(id: BlocksetId) -> Self {
        match id {
            BlocksetId::FOLDER => EntryKind::Folder,
            BlocksetId::SYMLINK => EntryKind::Symlink,
            _ => EntryKind::File,
        }
    }
}

/// Seconds since the unix epoch, the catalog's native time unit.
pub fn epoch_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Return Err(Cancelled) once the token has tripped.
pub fn check_cancelled(token: &CancellationToken) -> Result<()> {
    if token.is_cancelled() {
        Err(Error::Cancelled)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volume_state_round_trip() {
        for state in [
            VolumeState::Temporary,
            VolumeState::Uploading,
            VolumeState::Uploaded,
            VolumeState::Verified,
            VolumeState::Deleting,
            VolumeState::Deleted,
        ] {
            assert_eq!(VolumeState::parse(state.as_str()), Some(state));
        }
        assert_eq!(VolumeState::parse("Phantom"), None);
    }

    #[test]
    fn test_sentinel_blocksets() {
        assert!(BlocksetId::FOLDER.is_sentinel());
        assert!(BlocksetId::SYMLINK.is_sentinel());
        assert!(!BlocksetId(1).is_sentinel());
        assert_eq!(EntryKind::from_blockset(BlocksetId::FOLDER), EntryKind::Folder);
        assert_eq!(EntryKind::from_blockset(BlocksetId(7)), EntryKind::File);
    }
}
