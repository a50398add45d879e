use serde::{Deserialize, Serialize};

use common::{EntryKind, Error, Result};

use crate::BlockConfig;

/// Format version written into every volume.
pub const MANIFEST_VERSION: u32 = 2;

/// Entry-name encoding for block payloads.
pub const ENCODING_BASE64_URL: &str = "base64url";

/// `manifest` entry present in every remote volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeManifest {
    pub version: u32,
    pub created: i64,
    pub encoding: String,
    pub blocksize: usize,
    #[serde(rename = "block-hash")]
    pub block_hash: String,
    #[serde(rename = "file-hash")]
    pub file_hash: String,
    #[serde(rename = "app-version")]
    pub app_version: String,
}

impl VolumeManifest {
    pub fn new(config: &BlockConfig, created: i64) -> Self {
        Self {
            version: MANIFEST_VERSION,
            created,
            encoding: ENCODING_BASE64_URL.to_string(),
            blocksize: config.blocksize,
            block_hash: config.block_hash.name().to_string(),
            file_hash: config.file_hash.name().to_string(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// A downloaded volume must agree with the pinned configuration before
    /// any of its payload is trusted.
    pub fn check_compatible(&self, config: &BlockConfig) -> Result<()> {
        if self.version > MANIFEST_VERSION {
            return Err(Error::user(format!(
                "volume written by a newer format (version {})",
                self.version
            )));
        }
        if self.blocksize != config.blocksize
            || self.block_hash != config.block_hash.name()
            || self.file_hash != config.file_hash.name()
        {
            return Err(Error::PolicyViolation(format!(
                "volume block configuration ({}, {}, {}) disagrees with the catalog ({}, {}, {})",
                self.blocksize,
                self.block_hash,
                self.file_hash,
                config.blocksize,
                config.block_hash.name(),
                config.file_hash.name(),
            )));
        }
        Ok(())
    }
}

/// `fileset` entry of a dlist volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesetMarker {
    pub is_full_backup: bool,
}

/// One record of a dlist `filelist.json` array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilelistEntry {
    #[serde(rename = "type")]
    pub kind: EntryKind,
    pub path: String,
    /// Content hash; absent for folders and symlinks.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub size: i64,
    pub time: i64,
    pub metahash: String,
    pub metasize: i64,
    /// Blocklist hashes of a multi-block metadata blob.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub metablockhash: Option<Vec<String>>,
    /// Blocklist hashes of multi-block content.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub blocklists: Vec<String>,
}

/// One record of a dindex `vol/<name>` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexBlockRecord {
    pub hash: String,
    pub size: i64,
}

/// Payload of a dindex `vol/<name>` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexVolumeRecord {
    pub volumename: String,
    pub volumehash: String,
    pub volumesize: i64,
    pub blocks: Vec<IndexBlockRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{HashAlgorithm, Options};

    fn config() -> BlockConfig {
        BlockConfig::from_options(&Options::default())
    }

    #[test]
    fn test_manifest_compatibility() {
        let manifest = VolumeManifest::new(&config(), 1_700_000_000);
        manifest.check_compatible(&config()).unwrap();

        let other = BlockConfig {
            blocksize: 1024,
            block_hash: HashAlgorithm::Sha256,
            file_hash: HashAlgorithm::Sha256,
        };
        assert!(matches!(
            manifest.check_compatible(&other),
            Err(Error::PolicyViolation(_))
        ));
    }

    #[test]
    fn test_manifest_json_field_names() {
        let manifest = VolumeManifest::new(&config(), 7);
        let json = serde_json::to_string(&manifest).unwrap();
        assert!(json.contains("\"block-hash\":\"SHA256\""));
        assert!(json.contains("\"app-version\""));

        let back: VolumeManifest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, manifest);
    }

    #[test]
    fn test_filelist_entry_omits_empty_fields() {
        let folder = FilelistEntry {
            kind: EntryKind::Folder,
            path: "/data/".into(),
            hash: None,
            size: 0,
            time: 1,
            metahash: "mh".into(),
            metasize: 2,
            metablockhash: None,
            blocklists: Vec::new(),
        };
        let json = serde_json::to_string(&folder).unwrap();
        assert!(!json.contains("\"hash\""));
        assert!(!json.contains("blocklists"));
        assert!(json.contains("\"type\":\"Folder\""));

        let back: FilelistEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, folder);
    }
}
