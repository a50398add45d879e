//! Embedded relational catalog indexing every block, fileset and remote
//! volume of one backup destination.
//!
//! A single process owns the write side at a time; operations run phase-wide
//! write transactions through [`Catalog::begin`] / [`Catalog::commit`] and
//! every mutation below assumes it executes inside one.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::Connection;
use tracing::debug;

use common::{Error, HashAlgorithm, Options, Result};

mod blocks;
mod files;
mod maintenance;
mod plan;
mod stats;
mod verify;
mod volumes;

pub use blocks::BlockRow;
pub use files::{FileRow, FilesetRow, PrevFileRow};
pub use maintenance::{RehomeCounts, VolumeReport};
pub use plan::{PlanBlock, PlanFile, RestorePlan, PLAN_CONTENT, PLAN_METADATA};
pub use stats::ChangeStats;
pub use volumes::VolumeRow;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS blocks (
    id INTEGER PRIMARY KEY,
    hash TEXT NOT NULL,
    size INTEGER NOT NULL,
    volume_id INTEGER NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS blocks_by_hash_size ON blocks (hash, size);
CREATE INDEX IF NOT EXISTS blocks_by_volume ON blocks (volume_id);

CREATE TABLE IF NOT EXISTS blocksets (
    id INTEGER PRIMARY KEY,
    length INTEGER NOT NULL,
    full_hash TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS blocksets_by_hash_length ON blocksets (full_hash, length);

CREATE TABLE IF NOT EXISTS blockset_entries (
    blockset_id INTEGER NOT NULL,
    idx INTEGER NOT NULL,
    block_id INTEGER NOT NULL,
    PRIMARY KEY (blockset_id, idx)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS blockset_entries_by_block ON blockset_entries (block_id);

CREATE TABLE IF NOT EXISTS blocklist_hashes (
    blockset_id INTEGER NOT NULL,
    idx INTEGER NOT NULL,
    hash TEXT NOT NULL,
    PRIMARY KEY (blockset_id, idx)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS blocklist_hashes_by_hash ON blocklist_hashes (hash);

CREATE TABLE IF NOT EXISTS metadatasets (
    id INTEGER PRIMARY KEY,
    blockset_id INTEGER NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS metadatasets_by_blockset ON metadatasets (blockset_id);

CREATE TABLE IF NOT EXISTS path_prefixes (
    id INTEGER PRIMARY KEY,
    prefix TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS file_lookup (
    id INTEGER PRIMARY KEY,
    prefix_id INTEGER NOT NULL,
    path TEXT NOT NULL,
    blockset_id INTEGER NOT NULL,
    metadata_id INTEGER NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS file_lookup_identity
    ON file_lookup (prefix_id, path, blockset_id, metadata_id);

CREATE TABLE IF NOT EXISTS filesets (
    id INTEGER PRIMARY KEY,
    timestamp INTEGER NOT NULL UNIQUE,
    volume_id INTEGER NOT NULL,
    is_full INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS fileset_entries (
    fileset_id INTEGER NOT NULL,
    file_id INTEGER NOT NULL,
    last_modified INTEGER NOT NULL,
    PRIMARY KEY (fileset_id, file_id)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS fileset_entries_by_file ON fileset_entries (file_id);

CREATE TABLE IF NOT EXISTS remote_volumes (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    kind TEXT NOT NULL,
    state TEXT NOT NULL,
    size INTEGER,
    hash TEXT,
    delete_grace_until INTEGER
);

CREATE TABLE IF NOT EXISTS index_block_links (
    index_volume_id INTEGER NOT NULL,
    block_volume_id INTEGER NOT NULL,
    PRIMARY KEY (index_volume_id, block_volume_id)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS duplicate_blocks (
    block_id INTEGER NOT NULL,
    volume_id INTEGER NOT NULL,
    PRIMARY KEY (block_id, volume_id)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS deleted_blocks (
    id INTEGER PRIMARY KEY,
    hash TEXT NOT NULL,
    size INTEGER NOT NULL,
    volume_id INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS deleted_blocks_by_volume ON deleted_blocks (volume_id);

CREATE TABLE IF NOT EXISTS change_journal_data (
    fileset_id INTEGER NOT NULL,
    volume_name TEXT NOT NULL,
    journal_id INTEGER NOT NULL,
    next_usn INTEGER NOT NULL,
    config_hash TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS configuration (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
) WITHOUT ROWID;
"#;

/// Handle to the on-disk catalog file.
pub struct Catalog {
    conn: Connection,
    path: PathBuf,
    in_transaction: bool,
}

impl Catalog {
    /// Open the catalog at `path`, creating the schema when absent, and pin
    /// the immutable block configuration from `options`.
    pub fn create_or_open(path: &Path, options: &Options) -> Result<Self> {
        let mut catalog = Self::open_raw(path)?;
        catalog.begin()?;
        let pinned = catalog.pin_block_config(options);
        match pinned {
            Ok(()) => catalog.commit()?,
            Err(err) => {
                catalog.rollback()?;
                return Err(err);
            }
        }
        Ok(catalog)
    }

    /// Open an existing catalog without reconciling option values; used by
    /// operations that read the pinned configuration instead of setting it.
    pub fn open_existing(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::user(format!(
                "no catalog at {}; run a backup or repair first",
                path.display()
            )));
        }
        Self::open_raw(path)
    }

    fn open_raw(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.busy_timeout(Duration::from_secs(30))?;
        conn.execute_batch(SCHEMA)?;
        debug!(path = %path.display(), "catalog opened");
        Ok(Self {
            conn,
            path: path.to_path_buf(),
            in_transaction: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Files the enumerator must never back up: the catalog and its WAL
    /// sidecars.
    pub fn sidecar_paths(&self) -> Vec<PathBuf> {
        let base = self.path.clone();
        let mut paths = vec![base.clone()];
        if let Some(name) = base.file_name().and_then(|n| n.to_str()) {
            for suffix in ["-wal", "-shm", "-journal"] {
                paths.push(base.with_file_name(format!("{name}{suffix}")));
            }
        }
        paths
    }

    /// Begin the phase-wide write transaction.
    pub fn begin(&mut self) -> Result<()> {
        if self.in_transaction {
            return Err(Error::consistency("nested catalog transaction"));
        }
        self.conn.execute_batch("BEGIN IMMEDIATE;")?;
        self.in_transaction = true;
        Ok(())
    }

    pub fn commit(&mut self) -> Result<()> {
        if !self.in_transaction {
            return Err(Error::consistency("commit outside a catalog transaction"));
        }
        self.conn.execute_batch("COMMIT;")?;
        self.in_transaction = false;
        Ok(())
    }

    pub fn rollback(&mut self) -> Result<()> {
        if !self.in_transaction {
            return Ok(());
        }
        self.conn.execute_batch("ROLLBACK;")?;
        self.in_transaction = false;
        Ok(())
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    // -- configuration keys ------------------------------------------------

    pub fn config_value(&self, key: &str) -> Result<Option<String>> {
        use rusqlite::OptionalExtension;
        let value = self
            .conn
            .prepare_cached("SELECT value FROM configuration WHERE key = ?")?
            .query_row([key], |row| row.get(0))
            .optional()?;
        Ok(value)
    }

    pub fn set_config_value(&self, key: &str, value: &str) -> Result<()> {
        self.conn
            .prepare_cached(
                "INSERT INTO configuration (key, value) VALUES (?, ?)
                 ON CONFLICT (key) DO UPDATE SET value = excluded.value",
            )?
            .execute([key, value])?;
        Ok(())
    }

    fn pin_block_config(&mut self, options: &Options) -> Result<()> {
        let pin = |catalog: &Self, key: &str, value: &str| -> Result<()> {
            match catalog.config_value(key)? {
                None => catalog.set_config_value(key, value),
                Some(existing) if existing == value => Ok(()),
                Some(existing) => Err(Error::user(format!(
                    "{key} is fixed at {existing} for this destination; got {value}"
                ))),
            }
        };
        pin(self, "blocksize", &options.blocksize.to_string())?;
        pin(self, "block-hash", options.block_hash_algorithm.name())?;
        pin(self, "file-hash", options.file_hash_algorithm.name())?;
        Ok(())
    }

    /// The block configuration pinned by the first backup.
    pub fn stored_block_config(&self) -> Result<(usize, HashAlgorithm, HashAlgorithm)> {
        let blocksize = self
            .config_value("blocksize")?
            .ok_or_else(|| Error::consistency("catalog has no pinned blocksize"))?
            .parse::<usize>()
            .map_err(|_| Error::consistency("unparsable pinned blocksize"))?;
        let block_hash = HashAlgorithm::parse(
            &self
                .config_value("block-hash")?
                .ok_or_else(|| Error::consistency("catalog has no pinned block hash"))?,
        )?;
        let file_hash = HashAlgorithm::parse(
            &self
                .config_value("file-hash")?
                .ok_or_else(|| Error::consistency("catalog has no pinned file hash"))?,
        )?;
        Ok((blocksize, block_hash, file_hash))
    }

    // -- partial recreate marker -------------------------------------------

    pub fn is_partially_recreated(&self) -> Result<bool> {
        Ok(self.config_value("partially-recreated")?.as_deref() == Some("1"))
    }

    pub fn set_partially_recreated(&self, value: bool) -> Result<()> {
        self.set_config_value("partially-recreated", if value { "1" } else { "0" })
    }

    /// Operations that mutate history refuse to run on a partial catalog.
    pub fn require_complete(&self, operation: &str) -> Result<()> {
        if self.is_partially_recreated()? {
            return Err(Error::PartialRecreate(format!(
                "{operation} refuses to run until a full repair completes"
            )));
        }
        Ok(())
    }

    // -- USN change-journal cursors ----------------------------------------

    pub fn store_journal_cursor(
        &self,
        fileset: common::FilesetId,
        volume_name: &str,
        journal_id: i64,
        next_usn: i64,
        config_hash: &str,
    ) -> Result<()> {
        self.conn
            .prepare_cached(
                "INSERT INTO change_journal_data
                 (fileset_id, volume_name, journal_id, next_usn, config_hash)
                 VALUES (?, ?, ?, ?, ?)",
            )?
            .execute(rusqlite::params![
                fileset.0,
                volume_name,
                journal_id,
                next_usn,
                config_hash
            ])?;
        Ok(())
    }

    pub fn latest_journal_cursor(&self, volume_name: &str) -> Result<Option<(i64, i64, String)>> {
        use rusqlite::OptionalExtension;
        let row = self
            .conn
            .prepare_cached(
                "SELECT journal_id, next_usn, config_hash FROM change_journal_data
                 WHERE volume_name = ? ORDER BY fileset_id DESC LIMIT 1",
            )?
            .query_row([volume_name], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })
            .optional()?;
        Ok(row)
    }

    /// Random suffix for per-operation scratch tables.
    pub(crate) fn scratch_suffix() -> String {
        uuid::Uuid::new_v4().simple().to_string()
    }
}

impl Drop for Catalog {
    fn drop(&mut self) {
        if self.in_transaction {
            let _ = self.conn.execute_batch("ROLLBACK;");
        }
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    pub fn open_scratch() -> (tempfile::TempDir, Catalog) {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::create_or_open(&dir.path().join("catalog.db"), &Options::default())
            .unwrap();
        (dir, catalog)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_config_is_pinned() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.db");

        let catalog = Catalog::create_or_open(&path, &Options::default()).unwrap();
        drop(catalog);

        let mismatched = Options {
            blocksize: 64 * 1024,
            ..Options::default()
        };
        let reopened = Catalog::create_or_open(&path, &mismatched);
        assert!(matches!(reopened, Err(Error::UserInformation(_))));

        let reopened = Catalog::open_existing(&path).unwrap();
        let (blocksize, block_hash, _) = reopened.stored_block_config().unwrap();
        assert_eq!(blocksize, Options::default().blocksize);
        assert_eq!(block_hash, HashAlgorithm::Sha256);
    }

    #[test]
    fn test_transaction_discipline() {
        let (_dir, mut catalog) = testutil::open_scratch();
        catalog.begin().unwrap();
        assert!(catalog.begin().is_err());
        catalog.commit().unwrap();
        assert!(catalog.commit().is_err());
        catalog.rollback().unwrap(); // idempotent outside a transaction
    }

    #[test]
    fn test_partial_recreate_gate() {
        let (_dir, catalog) = testutil::open_scratch();
        catalog.require_complete("backup").unwrap();
        catalog.set_partially_recreated(true).unwrap();
        assert!(matches!(
            catalog.require_complete("backup"),
            Err(Error::PartialRecreate(_))
        ));
    }

    #[test]
    fn test_journal_cursor_round_trip() {
        let (_dir, mut catalog) = testutil::open_scratch();
        catalog.begin().unwrap();
        assert!(catalog.latest_journal_cursor("C:").unwrap().is_none());
        catalog
            .store_journal_cursor(common::FilesetId(1), "C:", 7, 1000, "cfg-a")
            .unwrap();
        catalog
            .store_journal_cursor(common::FilesetId(2), "C:", 7, 2000, "cfg-a")
            .unwrap();
        let (journal, usn, config) = catalog.latest_journal_cursor("C:").unwrap().unwrap();
        assert_eq!((journal, usn, config.as_str()), (7, 2000, "cfg-a"));
        catalog.commit().unwrap();
    }

    #[test]
    fn test_sidecar_paths_cover_wal() {
        let (_dir, catalog) = testutil::open_scratch();
        let names: Vec<String> = catalog
            .sidecar_paths()
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert!(names.contains(&"catalog.db".to_string()));
        assert!(names.contains(&"catalog.db-wal".to_string()));
    }
}
