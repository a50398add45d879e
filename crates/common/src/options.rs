use std::time::Duration;

use crate::hash::HashAlgorithm;
use crate::policy::{
    AttributeFilter, FilterRule, HardlinkPolicy, RetentionPolicy, SnapshotPolicy, SymlinkPolicy,
    UsnPolicy,
};
use crate::{DEFAULT_BLOCK_SIZE, DEFAULT_PREFIX, DEFAULT_VOLUME_SIZE};

/// Complete configuration for one operation.
///
/// `blocksize` and the hash algorithms are established by the first backup
/// against a destination and are immutable thereafter; the catalog refuses
/// to open when they disagree with its recorded values.
#[derive(Debug, Clone)]
pub struct Options {
    /// Maximum bytes per content-addressed block.
    pub blocksize: usize,
    /// Payload budget of a blocks volume before it is finalized.
    pub volume_size: u64,
    pub block_hash_algorithm: HashAlgorithm,
    pub file_hash_algorithm: HashAlgorithm,
    /// Remote filename prefix.
    pub prefix: String,

    /// Drop versions older than this after a successful backup.
    pub keep_time: Option<Duration>,
    /// Keep at most this many versions after a successful backup.
    pub keep_versions: Option<usize>,
    /// Thinning schedule applied after a successful backup.
    pub retention_policy: Option<RetentionPolicy>,

    /// Wasted-space percentage that marks a volume for compaction.
    pub threshold: u32,
    /// Volumes at or below this compressed size count as small.
    pub small_file_size: u64,
    /// Small-volume count that triggers compaction on its own.
    pub max_small_volume_count: usize,

    pub concurrency_block_hashers: usize,
    pub concurrency_compressors: usize,
    pub concurrency_file_processors: usize,
    pub concurrency_downloaders: usize,
    pub concurrency_decryptors: usize,
    pub concurrency_decompressors: usize,
    /// Bound of every channel in the pipelined restore network.
    pub restore_channel_buffer_size: usize,

    pub symlink_policy: SymlinkPolicy,
    pub hardlink_policy: HardlinkPolicy,
    pub snapshot_policy: SnapshotPolicy,
    pub usn_policy: UsnPolicy,
    pub file_attribute_filter: AttributeFilter,
    pub filters: Vec<FilterRule>,
    pub skip_files_larger_than: Option<u64>,

    /// Use the single-threaded restore patcher instead of the pipelined one.
    pub restore_legacy: bool,
    /// Log uploads and deletes instead of issuing them; roll back catalog writes.
    pub dryrun: bool,
    /// Skip the pre-backup remote listing reconciliation.
    pub no_backend_verification: bool,
    /// Reclaim leftovers of interrupted runs without operator action.
    pub auto_cleanup: bool,
    /// Skip structural checks on downloaded filelists.
    pub disable_filelist_consistency_checks: bool,
    /// Re-hash every block payload during `test` instead of container hashes only.
    pub full_block_verification: bool,
    /// During restore, source matching blocks from the original paths on disk.
    pub use_local_blocks: bool,
    /// Overwrite existing restore targets instead of renaming on conflict.
    pub overwrite: bool,
    /// Re-hash restored files end-to-end after patching.
    pub perform_restored_file_verification: bool,

    /// Retry budget for transient remote failures.
    pub retries: u32,
    /// Grace window before a physically-deleted volume leaves the catalog.
    pub delete_grace: Duration,
    pub passphrase: Option<String>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            blocksize: DEFAULT_BLOCK_SIZE,
            volume_size: DEFAULT_VOLUME_SIZE,
            block_hash_algorithm: HashAlgorithm::Sha256,
            file_hash_algorithm: HashAlgorithm::Sha256,
            prefix: DEFAULT_PREFIX.to_string(),
            keep_time: None,
            keep_versions: None,
            retention_policy: None,
            threshold: 25,
            small_file_size: DEFAULT_VOLUME_SIZE / 5,
            max_small_volume_count: 20,
            concurrency_block_hashers: 2,
            concurrency_compressors: 2,
            concurrency_file_processors: 2,
            concurrency_downloaders: 2,
            concurrency_decryptors: 1,
            concurrency_decompressors: 1,
            restore_channel_buffer_size: 64,
            symlink_policy: SymlinkPolicy::default(),
            hardlink_policy: HardlinkPolicy::default(),
            snapshot_policy: SnapshotPolicy::default(),
            usn_policy: UsnPolicy::default(),
            file_attribute_filter: AttributeFilter::default(),
            filters: Vec::new(),
            skip_files_larger_than: None,
            restore_legacy: false,
            dryrun: false,
            no_backend_verification: false,
            auto_cleanup: false,
            disable_filelist_consistency_checks: false,
            full_block_verification: false,
            use_local_blocks: false,
            overwrite: false,
            perform_restored_file_verification: false,
            retries: 5,
            delete_grace: Duration::from_secs(2 * 3600),
            passphrase: None,
        }
    }
}

impl Options {
    /// Fan-out width with a zero meaning "size to the machine".
    pub fn effective_concurrency(requested: usize) -> usize {
        if requested == 0 {
            num_cpus_fallback()
        } else {
            requested
        }
    }

    /// Whether any retention rule is configured.
    pub fn has_retention(&self) -> bool {
        self.keep_time.is_some() || self.keep_versions.is_some() || self.retention_policy.is_some()
    }

    /// Reject configurations the engine cannot honor.
    pub fn validate(&self) -> crate::Result<()> {
        if self.blocksize < 1024 {
            return Err(crate::Error::user(format!(
                "blocksize {} is below the 1 KiB minimum",
                self.blocksize
            )));
        }
        if (self.volume_size as usize) < self.blocksize {
            return Err(crate::Error::user(
                "volume_size must hold at least one block".to_string(),
            ));
        }
        if self.threshold > 100 {
            return Err(crate::Error::user(format!(
                "threshold {}% is not a percentage",
                self.threshold
            )));
        }
        Ok(())
    }
}

fn num_cpus_fallback() -> usize {
    num_cpus::get().max(2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let options = Options::default();
        options.validate().unwrap();
        assert_eq!(options.blocksize, 100 * 1024);
        assert_eq!(options.volume_size, 50 * 1024 * 1024);
        assert!(!options.has_retention());
    }

    #[test]
    fn test_validate_rejects_tiny_volumes() {
        let options = Options {
            volume_size: 512,
            ..Options::default()
        };
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_retention_detection() {
        let options = Options {
            keep_versions: Some(3),
            ..Options::default()
        };
        assert!(options.has_retention());
    }
}
