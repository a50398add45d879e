use rusqlite::{params, OptionalExtension};

use common::{
    BlocksetId, Error, FileId, FilesetId, MetadatasetId, PrefixId, Result, VolumeId, VolumeState,
};

use crate::volumes::VolumeRow;
use crate::Catalog;

/// Bound on the one-second increments applied to colliding fileset
/// timestamps before the operation fails hard.
const TIMESTAMP_RETRIES: i64 = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilesetRow {
    pub id: FilesetId,
    pub timestamp: i64,
    pub volume_id: VolumeId,
    pub is_full: bool,
}

/// A file bound to a fileset, with the interned prefix re-joined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRow {
    pub file_id: FileId,
    pub path: String,
    pub blockset_id: BlocksetId,
    pub metadata_id: MetadatasetId,
    pub last_modified: i64,
}

/// Previous-fileset record used by the metadata precheck.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrevFileRow {
    pub file_id: FileId,
    pub blockset_id: BlocksetId,
    pub metadata_id: MetadatasetId,
    pub length: i64,
    pub last_modified: i64,
    pub metadata_hash: String,
}

/// Split a full path into its interned prefix (through the final separator)
/// and entry name. Directory paths keep a trailing separator and an empty
/// name slot is avoided by splitting before it.
pub fn split_path(path: &str) -> (&str, &str) {
    let trimmed = path.strip_suffix(['/', '\\']).unwrap_or(path);
    match trimmed.rfind(['/', '\\']) {
        Some(pos) => path.split_at(pos + 1),
        None => ("", path),
    }
}

impl Catalog {
    /// Create a fileset row at `timestamp`, bumping by one second (at most
    /// 100 times) until the second-resolution slot is free.
    pub fn create_fileset(
        &self,
        volume: VolumeId,
        timestamp: i64,
        is_full: bool,
    ) -> Result<(FilesetId, i64)> {
        let mut stmt = self.conn().prepare_cached(
            "INSERT INTO filesets (timestamp, volume_id, is_full) VALUES (?, ?, ?)
             ON CONFLICT (timestamp) DO NOTHING",
        )?;
        for bump in 0..=TIMESTAMP_RETRIES {
            let candidate = timestamp + bump;
            let inserted = stmt.execute(params![candidate, volume.0, is_full as i64])?;
            if inserted > 0 {
                return Ok((FilesetId(self.conn().last_insert_rowid()), candidate));
            }
        }
        Err(Error::consistency(format!(
            "no free fileset timestamp within {TIMESTAMP_RETRIES}s of {timestamp}"
        )))
    }

    pub fn intern_prefix(&self, prefix: &str) -> Result<PrefixId> {
        let existing = self
            .conn()
            .prepare_cached("SELECT id FROM path_prefixes WHERE prefix = ?")?
            .query_row([prefix], |row| row.get(0))
            .optional()?;
        if let Some(id) = existing {
            return Ok(PrefixId(id));
        }
        self.conn()
            .prepare_cached("INSERT INTO path_prefixes (prefix) VALUES (?)")?
            .execute([prefix])?;
        Ok(PrefixId(self.conn().last_insert_rowid()))
    }

    /// Insert-once file record plus the fileset binding.
    pub fn add_file(
        &self,
        fileset: FilesetId,
        path: &str,
        blockset: BlocksetId,
        metadata: MetadatasetId,
        last_modified: i64,
    ) -> Result<FileId> {
        let (prefix, name) = split_path(path);
        let prefix = self.intern_prefix(prefix)?;

        let existing = self
            .conn()
            .prepare_cached(
                "SELECT id FROM file_lookup
                 WHERE prefix_id = ? AND path = ? AND blockset_id = ? AND metadata_id = ?",
            )?
            .query_row(
                params![prefix.0, name, blockset.0, metadata.0],
                |row| row.get(0),
            )
            .optional()?;
        let file = match existing {
            Some(id) => FileId(id),
            None => {
                self.conn()
                    .prepare_cached(
                        "INSERT INTO file_lookup (prefix_id, path, blockset_id, metadata_id)
                         VALUES (?, ?, ?, ?)",
                    )?
                    .execute(params![prefix.0, name, blockset.0, metadata.0])?;
                FileId(self.conn().last_insert_rowid())
            }
        };
        self.bind_file(fileset, file, last_modified)?;
        Ok(file)
    }

    /// Bind an existing file record to a fileset; the inherited-file path of
    /// the metadata precheck.
    pub fn bind_file(&self, fileset: FilesetId, file: FileId, last_modified: i64) -> Result<()> {
        self.conn()
            .prepare_cached(
                "INSERT INTO fileset_entries (fileset_id, file_id, last_modified)
                 VALUES (?, ?, ?)
                 ON CONFLICT (fileset_id, file_id) DO NOTHING",
            )?
            .execute(params![fileset.0, file.0, last_modified])?;
        Ok(())
    }

    /// All filesets, newest first.
    pub fn list_filesets(&self) -> Result<Vec<FilesetRow>> {
        let mut stmt = self.conn().prepare_cached(
            "SELECT id, timestamp, volume_id, is_full FROM filesets ORDER BY timestamp DESC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(FilesetRow {
                    id: FilesetId(row.get(0)?),
                    timestamp: row.get(1)?,
                    volume_id: VolumeId(row.get(2)?),
                    is_full: row.get::<_, i64>(3)? != 0,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Resolve `version` counting back from the newest (version 0).
    pub fn fileset_by_version(&self, version: usize) -> Result<FilesetRow> {
        self.list_filesets()?
            .into_iter()
            .nth(version)
            .ok_or_else(|| Error::user(format!("no version {version} in the catalog")))
    }

    /// Newest fileset at or before `timestamp`; falls back to the oldest
    /// when every fileset is newer.
    pub fn fileset_at_time(&self, timestamp: i64) -> Result<FilesetRow> {
        let filesets = self.list_filesets()?;
        filesets
            .iter()
            .find(|fs| fs.timestamp <= timestamp)
            .or_else(|| filesets.last())
            .cloned()
            .ok_or_else(|| Error::user("the catalog holds no versions".to_string()))
    }

    pub fn mark_fileset_partial(&self, fileset: FilesetId) -> Result<()> {
        self.conn()
            .prepare_cached("UPDATE filesets SET is_full = 0 WHERE id = ?")?
            .execute([fileset.0])?;
        Ok(())
    }

    /// The most recent Files volume still in Temporary or Uploading whose
    /// fileset exists; evidence of an interrupted previous backup.
    pub fn find_last_incomplete_fileset_volume(&self) -> Result<Option<VolumeRow>> {
        let id: Option<i64> = self
            .conn()
            .prepare_cached(
                "SELECT rv.id
                 FROM remote_volumes rv JOIN filesets fs ON fs.volume_id = rv.id
                 WHERE rv.kind = 'dlist' AND rv.state IN ('Temporary', 'Uploading')
                 ORDER BY fs.timestamp DESC LIMIT 1",
            )?
            .query_row([], |row| row.get(0))
            .optional()?;
        match id {
            Some(id) => self.volume_by_id(VolumeId(id)),
            None => Ok(None),
        }
    }

    pub fn fileset_for_volume(&self, volume: VolumeId) -> Result<Option<FilesetRow>> {
        let row = self
            .conn()
            .prepare_cached(
                "SELECT id, timestamp, volume_id, is_full FROM filesets WHERE volume_id = ?",
            )?
            .query_row([volume.0], |row| {
                Ok(FilesetRow {
                    id: FilesetId(row.get(0)?),
                    timestamp: row.get(1)?,
                    volume_id: VolumeId(row.get(2)?),
                    is_full: row.get::<_, i64>(3)? != 0,
                })
            })
            .optional()?;
        Ok(row)
    }

    /// Files of a fileset with joined paths, ordered by path for stable
    /// filelists.
    pub fn files_in_fileset(&self, fileset: FilesetId) -> Result<Vec<FileRow>> {
        let mut stmt = self.conn().prepare_cached(
            "SELECT fl.id, pp.prefix || fl.path, fl.blockset_id, fl.metadata_id, fe.last_modified
             FROM fileset_entries fe
             JOIN file_lookup fl ON fl.id = fe.file_id
             JOIN path_prefixes pp ON pp.id = fl.prefix_id
             WHERE fe.fileset_id = ?
             ORDER BY pp.prefix || fl.path ASC",
        )?;
        let rows = stmt
            .query_map([fileset.0], |row| {
                Ok(FileRow {
                    file_id: FileId(row.get(0)?),
                    path: row.get(1)?,
                    blockset_id: BlocksetId(row.get(2)?),
                    metadata_id: MetadatasetId(row.get(3)?),
                    last_modified: row.get(4)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Look up `path` in a previous fileset for the same-as-before check.
    pub fn previous_file_record(
        &self,
        fileset: FilesetId,
        path: &str,
    ) -> Result<Option<PrevFileRow>> {
        let (prefix, name) = split_path(path);
        let row = self
            .conn()
            .prepare_cached(
                "SELECT fl.id, fl.blockset_id, fl.metadata_id,
                        IFNULL(bs.length, 0), fe.last_modified, mbs.full_hash
                 FROM fileset_entries fe
                 JOIN file_lookup fl ON fl.id = fe.file_id
                 JOIN path_prefixes pp ON pp.id = fl.prefix_id
                 JOIN metadatasets ms ON ms.id = fl.metadata_id
                 JOIN blocksets mbs ON mbs.id = ms.blockset_id
                 LEFT JOIN blocksets bs ON bs.id = fl.blockset_id
                 WHERE fe.fileset_id = ? AND pp.prefix = ? AND fl.path = ?",
            )?
            .query_row(params![fileset.0, prefix, name], |row| {
                Ok(PrevFileRow {
                    file_id: FileId(row.get(0)?),
                    blockset_id: BlocksetId(row.get(1)?),
                    metadata_id: MetadatasetId(row.get(2)?),
                    length: row.get(3)?,
                    last_modified: row.get(4)?,
                    metadata_hash: row.get(5)?,
                })
            })
            .optional()?;
        Ok(row)
    }

    /// Volumes the blocks of a fileset live in; drives restore download sets.
    pub fn volumes_backing_fileset(&self, fileset: FilesetId) -> Result<Vec<VolumeId>> {
        let mut stmt = self.conn().prepare_cached(
            "SELECT DISTINCT b.volume_id
             FROM fileset_entries fe
             JOIN file_lookup fl ON fl.id = fe.file_id
             JOIN blockset_entries be ON be.blockset_id = fl.blockset_id
             JOIN blocks b ON b.id = be.block_id
             WHERE fe.fileset_id = ? AND fl.blockset_id >= 0",
        )?;
        let rows = stmt
            .query_map([fileset.0], |row| row.get(0))?
            .collect::<std::result::Result<Vec<i64>, _>>()?;
        Ok(rows.into_iter().map(VolumeId).collect())
    }

    /// Dlist volumes for filesets, newest first, skipping incomplete ones.
    pub fn uploaded_fileset_volumes(&self) -> Result<Vec<VolumeRow>> {
        let mut filesets = Vec::new();
        for fileset in self.list_filesets()? {
            if let Some(volume) = self.volume_by_id(fileset.volume_id)? {
                if matches!(volume.state, VolumeState::Uploaded | VolumeState::Verified) {
                    filesets.push(volume);
                }
            }
        }
        Ok(filesets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::open_scratch;
    use common::VolumeType;

    #[test]
    fn test_split_path() {
        assert_eq!(split_path("/a/b/c.txt"), ("/a/b/", "c.txt"));
        assert_eq!(split_path("/a/b/"), ("/a/", "b/"));
        assert_eq!(split_path("c.txt"), ("", "c.txt"));
        assert_eq!(split_path("C:\\data\\f.bin"), ("C:\\data\\", "f.bin"));
    }

    #[test]
    fn test_fileset_timestamp_collision_bumps() {
        let (_dir, mut catalog) = open_scratch();
        catalog.begin().unwrap();
        let volume = catalog
            .register_volume("a.dlist.zip", VolumeType::Files, VolumeState::Temporary)
            .unwrap();
        let volume2 = catalog
            .register_volume("b.dlist.zip", VolumeType::Files, VolumeState::Temporary)
            .unwrap();

        let (_, first_ts) = catalog.create_fileset(volume, 1000, true).unwrap();
        let (_, second_ts) = catalog.create_fileset(volume2, 1000, true).unwrap();
        assert_eq!(first_ts, 1000);
        assert_eq!(second_ts, 1001);
        catalog.commit().unwrap();
    }

    #[test]
    fn test_fileset_collision_exhaustion_fails_hard() {
        let (_dir, mut catalog) = open_scratch();
        catalog.begin().unwrap();
        let volume = catalog
            .register_volume("a.dlist.zip", VolumeType::Files, VolumeState::Temporary)
            .unwrap();
        for ts in 0..=100i64 {
            catalog
                .conn()
                .execute(
                    "INSERT INTO filesets (timestamp, volume_id, is_full) VALUES (?, ?, 1)",
                    params![ts, volume.0],
                )
                .unwrap();
        }
        let result = catalog.create_fileset(volume, 0, true);
        assert!(matches!(result, Err(Error::DatabaseConsistency(_))));
        catalog.rollback().unwrap();
    }

    #[test]
    fn test_add_file_interns_prefix_and_joins_back() {
        let (_dir, mut catalog) = open_scratch();
        catalog.begin().unwrap();
        let dlist = catalog
            .register_volume("a.dlist.zip", VolumeType::Files, VolumeState::Temporary)
            .unwrap();
        let dblock = catalog
            .register_volume("a.dblock.zip", VolumeType::Blocks, VolumeState::Temporary)
            .unwrap();
        let (fileset, _) = catalog.create_fileset(dlist, 1000, true).unwrap();

        catalog.register_block("AA==", 5, dblock).unwrap();
        let (content, _) = catalog
            .register_blockset("h", 5, &[("AA==".to_string(), 5)])
            .unwrap();
        catalog.register_block("BB==", 2, dblock).unwrap();
        let (meta_bs, _) = catalog
            .register_blockset("m", 2, &[("BB==".to_string(), 2)])
            .unwrap();
        let metadata = catalog.register_metadataset(meta_bs).unwrap();

        catalog
            .add_file(fileset, "/src/a.txt", content, metadata, 111)
            .unwrap();
        catalog
            .add_file(fileset, "/src/dir/", BlocksetId::FOLDER, metadata, 111)
            .unwrap();

        let files = catalog.files_in_fileset(fileset).unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].path, "/src/a.txt");
        assert_eq!(files[1].path, "/src/dir/");
        assert_eq!(files[1].blockset_id, BlocksetId::FOLDER);

        let prev = catalog
            .previous_file_record(fileset, "/src/a.txt")
            .unwrap()
            .unwrap();
        assert_eq!(prev.length, 5);
        assert_eq!(prev.metadata_hash, "m");
        catalog.commit().unwrap();
    }

    #[test]
    fn test_incomplete_fileset_volume_detection() {
        let (_dir, mut catalog) = open_scratch();
        catalog.begin().unwrap();
        assert!(catalog.find_last_incomplete_fileset_volume().unwrap().is_none());

        let dlist = catalog
            .register_volume("a.dlist.zip", VolumeType::Files, VolumeState::Temporary)
            .unwrap();
        catalog.create_fileset(dlist, 1000, true).unwrap();
        let found = catalog.find_last_incomplete_fileset_volume().unwrap().unwrap();
        assert_eq!(found.id, dlist);

        catalog.set_volume_state(dlist, VolumeState::Uploading).unwrap();
        assert!(catalog.find_last_incomplete_fileset_volume().unwrap().is_some());
        catalog.set_volume_state(dlist, VolumeState::Uploaded).unwrap();
        assert!(catalog.find_last_incomplete_fileset_volume().unwrap().is_none());
        catalog.commit().unwrap();
    }
}
