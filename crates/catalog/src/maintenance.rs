use rusqlite::params;

use common::{Error, FilesetId, Result, VolumeId};

use crate::Catalog;

/// Space accounting for one blocks volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeReport {
    pub volume_id: VolumeId,
    pub name: String,
    /// Sum of live-block sizes homed in the volume.
    pub data_size: i64,
    /// Sum of deleted-block sizes still physically present.
    pub wasted_size: i64,
    /// Finalized byte size of the remote file.
    pub compressed_size: i64,
    /// Minimum timestamp of any fileset referencing the volume's blocks.
    pub oldest_fileset: Option<i64>,
}

/// Counters returned by the re-homing update; compaction aborts unless all
/// three agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RehomeCounts {
    pub targets: usize,
    pub updated: usize,
    pub duplicates_consumed: usize,
}

impl Catalog {
    /// Per-volume space report over every uploaded blocks volume.
    pub fn wasted_space_report(&self) -> Result<Vec<VolumeReport>> {
        let mut stmt = self.conn().prepare_cached(
            "SELECT rv.id, rv.name, IFNULL(rv.size, 0),
                    IFNULL((SELECT SUM(b.size) FROM blocks b WHERE b.volume_id = rv.id), 0),
                    IFNULL((SELECT SUM(db.size) FROM deleted_blocks db WHERE db.volume_id = rv.id), 0),
                    (SELECT MIN(fs.timestamp)
                     FROM filesets fs
                     JOIN fileset_entries fe ON fe.fileset_id = fs.id
                     JOIN file_lookup fl ON fl.id = fe.file_id
                     JOIN blockset_entries be ON be.blockset_id = fl.blockset_id
                     JOIN blocks b ON b.id = be.block_id
                     WHERE b.volume_id = rv.id)
             FROM remote_volumes rv
             WHERE rv.kind = 'dblock' AND rv.state IN ('Uploaded', 'Verified')
             ORDER BY rv.id ASC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(VolumeReport {
                    volume_id: VolumeId(row.get(0)?),
                    name: row.get(1)?,
                    compressed_size: row.get(2)?,
                    data_size: row.get(3)?,
                    wasted_size: row.get(4)?,
                    oldest_fileset: row.get(5)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Drop filesets and cascade-clean every record they alone kept alive.
    ///
    /// Orphaned blocks are first recorded as deleted blocks so volume
    /// accounting stays correct; blocklist blocks survive while any
    /// blockset still names their hash. Returns the number of Files
    /// volumes moved to Deleting, which must equal the fileset count.
    pub fn drop_filesets(&self, doomed: &[FilesetId], grace_until: i64) -> Result<usize> {
        if doomed.is_empty() {
            return Ok(0);
        }
        let conn = self.conn();

        let mut volume_ids = Vec::with_capacity(doomed.len());
        for fileset in doomed {
            let volume: i64 = conn
                .prepare_cached("SELECT volume_id FROM filesets WHERE id = ?")?
                .query_row([fileset.0], |row| row.get(0))?;
            volume_ids.push(volume);
            conn.prepare_cached("DELETE FROM fileset_entries WHERE fileset_id = ?")?
                .execute([fileset.0])?;
            conn.prepare_cached("DELETE FROM change_journal_data WHERE fileset_id = ?")?
                .execute([fileset.0])?;
            conn.prepare_cached("DELETE FROM filesets WHERE id = ?")?
                .execute([fileset.0])?;
        }

        conn.execute_batch(
            "DELETE FROM file_lookup
             WHERE id NOT IN (SELECT file_id FROM fileset_entries);

             DELETE FROM metadatasets
             WHERE id NOT IN (SELECT metadata_id FROM file_lookup);

             DELETE FROM blocksets
             WHERE id NOT IN (SELECT blockset_id FROM file_lookup WHERE blockset_id >= 0)
             AND id NOT IN (SELECT blockset_id FROM metadatasets);

             DELETE FROM blockset_entries
             WHERE blockset_id NOT IN (SELECT id FROM blocksets);

             DELETE FROM blocklist_hashes
             WHERE blockset_id NOT IN (SELECT id FROM blocksets);

             INSERT INTO deleted_blocks (hash, size, volume_id)
             SELECT hash, size, volume_id FROM blocks
             WHERE id NOT IN (SELECT block_id FROM blockset_entries)
             AND hash NOT IN (SELECT hash FROM blocklist_hashes);

             DELETE FROM duplicate_blocks
             WHERE block_id IN (
                 SELECT id FROM blocks
                 WHERE id NOT IN (SELECT block_id FROM blockset_entries)
                 AND hash NOT IN (SELECT hash FROM blocklist_hashes)
             );

             DELETE FROM blocks
             WHERE id NOT IN (SELECT block_id FROM blockset_entries)
             AND hash NOT IN (SELECT hash FROM blocklist_hashes);",
        )?;

        // Files volumes whose fileset is gone leave in one update.
        let placeholders = vec!["?"; volume_ids.len()].join(", ");
        let mut stmt = conn.prepare(&format!(
            "UPDATE remote_volumes SET state = 'Deleting', delete_grace_until = ?
             WHERE id IN ({placeholders}) AND kind = 'dlist'"
        ))?;
        let mut bound = vec![rusqlite::types::Value::Integer(grace_until)];
        bound.extend(volume_ids.iter().map(|id| rusqlite::types::Value::Integer(*id)));
        let updated = stmt.execute(rusqlite::params_from_iter(bound))?;

        if updated != doomed.len() {
            return Err(Error::consistency(format!(
                "dropped {} filesets but transitioned {updated} dlist volumes",
                doomed.len()
            )));
        }
        Ok(updated)
    }

    /// Re-home every block of `old_volume` to its best duplicate copy:
    /// the maximum volume id among candidates not themselves going away.
    ///
    /// The caller aborts the surrounding compaction unless the three
    /// returned counters agree.
    pub fn rehome_blocks(&self, old_volume: VolumeId) -> Result<RehomeCounts> {
        let conn = self.conn();
        let targets: i64 = conn
            .prepare_cached("SELECT COUNT(*) FROM blocks WHERE volume_id = ?")?
            .query_row([old_volume.0], |row| row.get(0))?;

        let updated = conn
            .prepare_cached(
                "UPDATE blocks SET volume_id = (
                     SELECT MAX(dup.volume_id)
                     FROM duplicate_blocks dup
                     JOIN remote_volumes rv ON rv.id = dup.volume_id
                     WHERE dup.block_id = blocks.id
                     AND dup.volume_id != ?1
                     AND rv.state NOT IN ('Deleting', 'Deleted')
                 )
                 WHERE volume_id = ?1
                 AND EXISTS (
                     SELECT 1 FROM duplicate_blocks dup
                     JOIN remote_volumes rv ON rv.id = dup.volume_id
                     WHERE dup.block_id = blocks.id
                     AND dup.volume_id != ?1
                     AND rv.state NOT IN ('Deleting', 'Deleted')
                 )",
            )?
            .execute([old_volume.0])?;

        // Consume exactly the duplicate rows that became the new home.
        let consumed = conn
            .prepare_cached(
                "DELETE FROM duplicate_blocks
                 WHERE EXISTS (
                     SELECT 1 FROM blocks b
                     WHERE b.id = duplicate_blocks.block_id
                     AND b.volume_id = duplicate_blocks.volume_id
                 )",
            )?
            .execute([])?;

        Ok(RehomeCounts {
            targets: targets as usize,
            updated,
            duplicates_consumed: consumed,
        })
    }

    /// Purge every record that depends on block data homed in `volume`,
    /// then drop the volume row itself.
    ///
    /// Used when the volume's payload is unrecoverable: a staging file lost
    /// to an interrupted run, or a remote file that vanished. Files whose
    /// content or metadata referenced the lost blocks leave their filesets;
    /// surviving blocks orphaned by the cascade are booked as deleted
    /// blocks. Returns the number of file records purged.
    pub fn purge_blocks_of_volume(&self, volume: VolumeId) -> Result<usize> {
        let conn = self.conn();

        let purged_files: i64 = conn.query_row(
            "SELECT COUNT(DISTINCT fl.id) FROM file_lookup fl
             WHERE fl.blockset_id IN (
                 SELECT DISTINCT be.blockset_id FROM blockset_entries be
                 JOIN blocks b ON b.id = be.block_id WHERE b.volume_id = ?1
             )
             OR fl.metadata_id IN (
                 SELECT ms.id FROM metadatasets ms
                 WHERE ms.blockset_id IN (
                     SELECT DISTINCT be.blockset_id FROM blockset_entries be
                     JOIN blocks b ON b.id = be.block_id WHERE b.volume_id = ?1
                 )
             )",
            [volume.0],
            |row| row.get(0),
        )?;

        conn.execute_batch(&format!(
            "CREATE TEMPORARY TABLE broken_blocksets AS
             SELECT DISTINCT be.blockset_id AS id FROM blockset_entries be
             JOIN blocks b ON b.id = be.block_id WHERE b.volume_id = {volume};

             DELETE FROM fileset_entries WHERE file_id IN (
                 SELECT fl.id FROM file_lookup fl
                 WHERE fl.blockset_id IN (SELECT id FROM broken_blocksets)
                 OR fl.metadata_id IN (
                     SELECT ms.id FROM metadatasets ms
                     WHERE ms.blockset_id IN (SELECT id FROM broken_blocksets)
                 )
             );
             DELETE FROM file_lookup
             WHERE blockset_id IN (SELECT id FROM broken_blocksets)
             OR metadata_id IN (
                 SELECT ms.id FROM metadatasets ms
                 WHERE ms.blockset_id IN (SELECT id FROM broken_blocksets)
             );
             DELETE FROM metadatasets
             WHERE blockset_id IN (SELECT id FROM broken_blocksets)
             OR id NOT IN (SELECT metadata_id FROM file_lookup);
             DELETE FROM blocksets WHERE id IN (SELECT id FROM broken_blocksets);
             DELETE FROM blockset_entries
             WHERE blockset_id IN (SELECT id FROM broken_blocksets);
             DELETE FROM blocklist_hashes
             WHERE blockset_id IN (SELECT id FROM broken_blocksets);
             DROP TABLE broken_blocksets;

             DELETE FROM duplicate_blocks WHERE block_id IN (
                 SELECT id FROM blocks WHERE volume_id = {volume}
             );
             DELETE FROM deleted_blocks WHERE volume_id = {volume};
             DELETE FROM blocks WHERE volume_id = {volume};

             INSERT INTO deleted_blocks (hash, size, volume_id)
             SELECT hash, size, volume_id FROM blocks
             WHERE id NOT IN (SELECT block_id FROM blockset_entries)
             AND hash NOT IN (SELECT hash FROM blocklist_hashes);
             DELETE FROM duplicate_blocks WHERE block_id IN (
                 SELECT id FROM blocks
                 WHERE id NOT IN (SELECT block_id FROM blockset_entries)
                 AND hash NOT IN (SELECT hash FROM blocklist_hashes)
             );
             DELETE FROM blocks
             WHERE id NOT IN (SELECT block_id FROM blockset_entries)
             AND hash NOT IN (SELECT hash FROM blocklist_hashes);",
            volume = volume.0
        ))?;

        self.remove_volume(volume)?;
        Ok(purged_files as usize)
    }

    /// Files (with their filesets) whose content or metadata depends on
    /// block data homed in `volume`.
    pub fn files_using_volume(&self, volume: VolumeId) -> Result<Vec<(FilesetId, String)>> {
        let mut stmt = self.conn().prepare_cached(
            "SELECT DISTINCT fe.fileset_id, pp.prefix || fl.path
             FROM blocks b
             JOIN blockset_entries be ON be.block_id = b.id
             JOIN file_lookup fl ON fl.blockset_id = be.blockset_id
                 OR fl.metadata_id IN (
                     SELECT ms.id FROM metadatasets ms
                     WHERE ms.blockset_id = be.blockset_id
                 )
             JOIN fileset_entries fe ON fe.file_id = fl.id
             JOIN path_prefixes pp ON pp.id = fl.prefix_id
             WHERE b.volume_id = ?
             ORDER BY fe.fileset_id ASC, pp.prefix || fl.path ASC",
        )?;
        let rows = stmt
            .query_map([volume.0], |row| {
                Ok((FilesetId(row.get(0)?), row.get(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Total live bytes across all uploaded blocks volumes.
    pub fn total_live_size(&self) -> Result<i64> {
        let size: i64 = self.conn().prepare_cached(
            "SELECT IFNULL(SUM(b.size), 0) FROM blocks b
             JOIN remote_volumes rv ON rv.id = b.volume_id
             WHERE rv.kind = 'dblock' AND rv.state IN ('Uploaded', 'Verified')",
        )?
        .query_row([], |row| row.get(0))?;
        Ok(size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::open_scratch;
    use common::{VolumeState, VolumeType};

    fn seed_backup(catalog: &Catalog, tag: &str, ts: i64, paths: &[(&str, &str)]) -> FilesetId {
        let dblock = catalog
            .register_volume(
                &format!("{tag}.dblock.zip"),
                VolumeType::Blocks,
                VolumeState::Temporary,
            )
            .unwrap();
        for state in [VolumeState::Uploading, VolumeState::Uploaded] {
            catalog.set_volume_state(dblock, state).unwrap();
        }
        catalog.set_volume_info(dblock, 1000, "vh").unwrap();
        let dlist = catalog
            .register_volume(
                &format!("{tag}.dlist.zip"),
                VolumeType::Files,
                VolumeState::Temporary,
            )
            .unwrap();
        for state in [VolumeState::Uploading, VolumeState::Uploaded] {
            catalog.set_volume_state(dlist, state).unwrap();
        }
        let (fileset, _) = catalog.create_fileset(dlist, ts, true).unwrap();

        catalog.register_block(&format!("meta-{tag}"), 2, dblock).unwrap();
        let (meta_bs, _) = catalog
            .register_blockset(&format!("mh-{tag}"), 2, &[(format!("meta-{tag}"), 2)])
            .unwrap();
        let metadata = catalog.register_metadataset(meta_bs).unwrap();

        for (path, hash) in paths {
            catalog.register_block(hash, 10, dblock).unwrap();
            let (blockset, _) = catalog
                .register_blockset(&format!("f-{hash}"), 10, &[(hash.to_string(), 10)])
                .unwrap();
            catalog
                .add_file(fileset, path, blockset, metadata, 1)
                .unwrap();
        }
        fileset
    }

    #[test]
    fn test_drop_fileset_cascades_and_accounts_waste() {
        let (_dir, mut catalog) = open_scratch();
        catalog.begin().unwrap();
        let first = seed_backup(&catalog, "a", 1000, &[("/s/x", "h1"), ("/s/y", "h2")]);
        let second = seed_backup(&catalog, "b", 2000, &[("/s/x", "h1")]);

        // Second fileset shares h1; dropping the first orphans only h2 and
        // the first run's metadata block.
        let moved = catalog.drop_filesets(&[first], 0).unwrap();
        assert_eq!(moved, 1);

        let volume = catalog.volume_by_name("a.dblock.zip").unwrap().unwrap();
        let deleted = catalog.deleted_blocks_in_volume(volume.id).unwrap();
        let mut hashes: Vec<&str> = deleted.iter().map(|(h, _)| h.as_str()).collect();
        hashes.sort_unstable();
        assert_eq!(hashes, vec!["h2", "meta-a"]);

        // h1 survives for the second fileset.
        assert!(catalog.block_exists("h1", 10).unwrap());
        assert!(!catalog.block_exists("h2", 10).unwrap());

        let dlist = catalog.volume_by_name("a.dlist.zip").unwrap().unwrap();
        assert_eq!(dlist.state, VolumeState::Deleting);

        assert_eq!(catalog.files_in_fileset(second).unwrap().len(), 1);
        catalog.commit().unwrap();
    }

    #[test]
    fn test_blocklist_blocks_survive_cascade() {
        let (_dir, mut catalog) = open_scratch();
        catalog.begin().unwrap();
        let fileset = seed_backup(&catalog, "a", 1000, &[("/s/x", "h1")]);

        // Register a blocklist hash whose block lives in the same volume and
        // is referenced by no blockset entry.
        let volume = catalog.volume_by_name("a.dblock.zip").unwrap().unwrap();
        catalog.register_block("bl1", 32, volume.id).unwrap();
        let files = catalog.files_in_fileset(fileset).unwrap();
        let blockset = files
            .iter()
            .find(|f| f.blockset_id.0 >= 0 && f.path == "/s/x")
            .unwrap()
            .blockset_id;
        catalog.register_blocklist_hash(blockset, 0, "bl1").unwrap();

        let other = seed_backup(&catalog, "b", 2000, &[("/s/z", "h9")]);
        catalog.drop_filesets(&[other], 0).unwrap();

        // The blocklist block is unreferenced by entries yet must survive.
        assert!(catalog.block_exists("bl1", 32).unwrap());
        catalog.commit().unwrap();
    }

    #[test]
    fn test_rehome_prefers_highest_surviving_volume() {
        let (_dir, mut catalog) = open_scratch();
        catalog.begin().unwrap();
        let old = catalog
            .register_volume("old.dblock.zip", VolumeType::Blocks, VolumeState::Temporary)
            .unwrap();
        let mid = catalog
            .register_volume("mid.dblock.zip", VolumeType::Blocks, VolumeState::Temporary)
            .unwrap();
        let new = catalog
            .register_volume("new.dblock.zip", VolumeType::Blocks, VolumeState::Temporary)
            .unwrap();

        let (block, _) = catalog.register_block("h", 10, old).unwrap();
        catalog.add_duplicate_block(block, mid).unwrap();
        catalog.add_duplicate_block(block, new).unwrap();

        let counts = catalog.rehome_blocks(old).unwrap();
        assert_eq!(counts.targets, 1);
        assert_eq!(counts.updated, 1);
        assert_eq!(counts.duplicates_consumed, 1);

        let rows = catalog.blocks_in_volume(new).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].hash, "h");
        // The losing candidate row remains for later compactions.
        let remaining: i64 = catalog
            .conn()
            .query_row("SELECT COUNT(*) FROM duplicate_blocks", [], |r| r.get(0))
            .unwrap();
        assert_eq!(remaining, 1);
        catalog.commit().unwrap();
    }

    #[test]
    fn test_rehome_counts_reveal_missing_copies() {
        let (_dir, mut catalog) = open_scratch();
        catalog.begin().unwrap();
        let old = catalog
            .register_volume("old.dblock.zip", VolumeType::Blocks, VolumeState::Temporary)
            .unwrap();
        catalog.register_block("h", 10, old).unwrap();

        // No duplicate copy exists: targets != updated signals the caller
        // to abort.
        let counts = catalog.rehome_blocks(old).unwrap();
        assert_eq!(counts.targets, 1);
        assert_eq!(counts.updated, 0);
        catalog.rollback().unwrap();
    }

    #[test]
    fn test_purge_blocks_of_volume_drops_dependents() {
        let (_dir, mut catalog) = open_scratch();
        catalog.begin().unwrap();
        let kept = seed_backup(&catalog, "a", 1000, &[("/s/x", "h1")]);
        let broken = seed_backup(&catalog, "b", 2000, &[("/s/y", "h2")]);
        let lost = catalog.volume_by_name("b.dblock.zip").unwrap().unwrap();

        let purged = catalog.purge_blocks_of_volume(lost.id).unwrap();
        // /s/y and the second run's metadata-sharing rows go away.
        assert!(purged >= 1);
        assert!(catalog.volume_by_id(lost.id).unwrap().is_none());
        assert!(!catalog.block_exists("h2", 10).unwrap());
        assert!(catalog.block_exists("h1", 10).unwrap());
        assert!(catalog.files_in_fileset(broken).unwrap().is_empty());
        assert_eq!(catalog.files_in_fileset(kept).unwrap().len(), 1);
        catalog.verify_consistency(1024, 32, false).unwrap();
        catalog.commit().unwrap();
    }

    #[test]
    fn test_wasted_space_report_shapes() {
        let (_dir, mut catalog) = open_scratch();
        catalog.begin().unwrap();
        seed_backup(&catalog, "a", 1000, &[("/s/x", "h1")]);
        catalog.record_deleted_block("gone", 30, catalog.volume_by_name("a.dblock.zip").unwrap().unwrap().id).unwrap();

        let report = catalog.wasted_space_report().unwrap();
        assert_eq!(report.len(), 1);
        assert_eq!(report[0].data_size, 12); // h1 + metadata block
        assert_eq!(report[0].wasted_size, 30);
        assert_eq!(report[0].compressed_size, 1000);
        assert_eq!(report[0].oldest_fileset, Some(1000));
        catalog.commit().unwrap();
    }
}
