//! On-disk model of remote volumes: container formats, entry layouts,
//! manifests and the remote naming scheme shared by dblock, dindex and
//! dlist files.

use common::{HashAlgorithm, Options, Result};

pub mod codec;
pub mod container;
pub mod manifest;
pub mod naming;
pub mod reader;
pub mod writer;

pub use codec::{Encryptor, PassthroughEncryptor};
pub use container::ContainerKind;
pub use manifest::{FilelistEntry, VolumeManifest};
pub use naming::RemoteName;
pub use reader::{BlockVolumeReader, FilesetVolumeReader, IndexVolumeEntry, IndexVolumeReader};
pub use writer::{BlockVolumeWriter, FilesetVolumeWriter, FinalizedVolume, IndexVolumeWriter};

/// Immutable block-store configuration, established once per backup
/// destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockConfig {
    pub blocksize: usize,
    pub block_hash: HashAlgorithm,
    pub file_hash: HashAlgorithm,
}

impl BlockConfig {
    pub fn from_options(options: &Options) -> Self {
        Self {
            blocksize: options.blocksize,
            block_hash: options.block_hash_algorithm,
            file_hash: options.file_hash_algorithm,
        }
    }

    /// Raw hashes that fit one blocklist block.
    pub fn hashes_per_blocklist(&self) -> usize {
        (self.blocksize / self.block_hash.digest_len()).max(1)
    }

    /// Number of blocks a stream of `length` bytes splits into.
    pub fn blocks_for_length(&self, length: u64) -> u64 {
        length.div_ceil(self.blocksize as u64)
    }
}

/// Hash a finished volume file the way the catalog records it.
pub fn hash_file(algorithm: HashAlgorithm, path: &std::path::Path) -> Result<(i64, String)> {
    use std::io::Read;
    let mut file = std::fs::File::open(path).map_err(|e| common::Error::path(path, e))?;
    let mut hasher = algorithm.hasher();
    let mut buffer = vec![0u8; 64 * 1024];
    let mut total = 0i64;
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
        total += read as i64;
    }
    Ok((total, common::hash::to_base64(&hasher.finalize())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocklist_capacity() {
        let config = BlockConfig::from_options(&Options::default());
        assert_eq!(config.hashes_per_blocklist(), (100 * 1024) / 32);
        assert_eq!(config.blocks_for_length(0), 0);
        assert_eq!(config.blocks_for_length(1), 1);
        assert_eq!(config.blocks_for_length(100 * 1024), 1);
        assert_eq!(config.blocks_for_length(100 * 1024 + 1), 2);
    }

    #[test]
    fn test_hash_file_matches_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload.bin");
        std::fs::write(&path, b"volume bytes").unwrap();
        let (size, hash) = hash_file(HashAlgorithm::Sha256, &path).unwrap();
        assert_eq!(size, 12);
        assert_eq!(
            hash,
            common::hash::to_base64(&HashAlgorithm::Sha256.digest(b"volume bytes"))
        );
    }
}
