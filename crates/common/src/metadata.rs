use serde::{Deserialize, Serialize};

use crate::error::Result;

/// File metadata blob stored as its own blockset and referenced through a
/// metadataset.
///
/// Serialized as JSON so foreign readers can inspect it; the blob may span
/// multiple blocks and then carries blocklists like any other stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    /// Unix permission bits; absent on platforms without them.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub mode: Option<u32>,
    /// Modification time, epoch seconds UTC.
    pub mtime: i64,
    /// Link target for symlink entries.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub symlink_target: Option<String>,
    /// Read-only attribute; restore clears it before overwriting.
    #[serde(default)]
    pub read_only: bool,
}

impl FileMetadata {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let metadata = FileMetadata {
            mode: Some(0o644),
            mtime: 1_650_000_000,
            symlink_target: None,
            read_only: false,
        };
        let bytes = metadata.to_bytes().unwrap();
        assert_eq!(FileMetadata::from_bytes(&bytes).unwrap(), metadata);
    }

    #[test]
    fn test_symlink_blob() {
        let metadata = FileMetadata {
            mode: None,
            mtime: 7,
            symlink_target: Some("../target".into()),
            read_only: false,
        };
        let bytes = metadata.to_bytes().unwrap();
        let back = FileMetadata::from_bytes(&bytes).unwrap();
        assert_eq!(back.symlink_target.as_deref(), Some("../target"));
    }
}
