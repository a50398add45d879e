use common::{FilesetId, Result};

use crate::Catalog;

/// Added/deleted/modified counts between two filesets, split by entry kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChangeStats {
    pub added_files: u64,
    pub added_folders: u64,
    pub added_symlinks: u64,
    pub deleted_files: u64,
    pub deleted_folders: u64,
    pub deleted_symlinks: u64,
    pub modified_files: u64,
    pub modified_folders: u64,
    pub modified_symlinks: u64,
}

impl ChangeStats {
    pub fn total_changes(&self) -> u64 {
        self.added_files
            + self.added_folders
            + self.added_symlinks
            + self.deleted_files
            + self.deleted_folders
            + self.deleted_symlinks
            + self.modified_files
            + self.modified_folders
            + self.modified_symlinks
    }
}

impl Catalog {
    /// Compare `current` against `previous` by (prefix, path) identity.
    ///
    /// Files are modified when their content blockset or metadata hash
    /// changed; folders and symlinks carry no content blockset and compare
    /// by metadata hash alone. The scratch tables are dropped on every
    /// exit path.
    pub fn change_statistics(
        &self,
        current: FilesetId,
        previous: FilesetId,
    ) -> Result<ChangeStats> {
        let suffix = Self::scratch_suffix();
        let cur = format!("chg_cur_{suffix}");
        let prev = format!("chg_prev_{suffix}");

        self.create_snapshot_table(&cur, current)?;
        if let Err(err) = self.create_snapshot_table(&prev, previous) {
            self.drop_scratch_tables(&[&cur, &prev]);
            return Err(err);
        }

        let result = self.collect_change_stats(&cur, &prev);
        self.drop_scratch_tables(&[&cur, &prev]);
        result
    }

    fn create_snapshot_table(&self, table: &str, fileset: FilesetId) -> Result<()> {
        self.conn().execute(
            &format!(
                "CREATE TEMPORARY TABLE {table} AS
                 SELECT fl.prefix_id AS prefix_id,
                        fl.path AS path,
                        fl.blockset_id AS blockset_id,
                        mbs.full_hash AS metahash
                 FROM fileset_entries fe
                 JOIN file_lookup fl ON fl.id = fe.file_id
                 JOIN metadatasets ms ON ms.id = fl.metadata_id
                 JOIN blocksets mbs ON mbs.id = ms.blockset_id
                 WHERE fe.fileset_id = ?"
            ),
            [fileset.0],
        )?;
        Ok(())
    }

    fn drop_scratch_tables(&self, tables: &[&str]) {
        for table in tables {
            let _ = self
                .conn()
                .execute_batch(&format!("DROP TABLE IF EXISTS temp.{table};"));
        }
    }

    fn collect_change_stats(&self, cur: &str, prev: &str) -> Result<ChangeStats> {
        let kind_sums = |sql: &str| -> Result<(u64, u64, u64)> {
            self.conn()
                .query_row(sql, [], |row| {
                    Ok((
                        row.get::<_, i64>(0)? as u64,
                        row.get::<_, i64>(1)? as u64,
                        row.get::<_, i64>(2)? as u64,
                    ))
                })
                .map_err(Into::into)
        };

        let kinds = |alias: &str| {
            format!(
                "IFNULL(SUM(CASE WHEN {alias}.blockset_id NOT IN (-100, -200) THEN 1 ELSE 0 END), 0),
                 IFNULL(SUM(CASE WHEN {alias}.blockset_id = -100 THEN 1 ELSE 0 END), 0),
                 IFNULL(SUM(CASE WHEN {alias}.blockset_id = -200 THEN 1 ELSE 0 END), 0)"
            )
        };

        let (added_files, added_folders, added_symlinks) = kind_sums(&format!(
            "SELECT {} FROM {cur} c
             WHERE NOT EXISTS (
                 SELECT 1 FROM {prev} p
                 WHERE p.prefix_id = c.prefix_id AND p.path = c.path
             )",
            kinds("c")
        ))?;

        let (deleted_files, deleted_folders, deleted_symlinks) = kind_sums(&format!(
            "SELECT {} FROM {prev} p
             WHERE NOT EXISTS (
                 SELECT 1 FROM {cur} c
                 WHERE c.prefix_id = p.prefix_id AND c.path = p.path
             )",
            kinds("p")
        ))?;

        let (modified_files, modified_folders, modified_symlinks) = kind_sums(&format!(
            "SELECT {} FROM {cur} c
             JOIN {prev} p ON p.prefix_id = c.prefix_id AND p.path = c.path
             WHERE c.blockset_id != p.blockset_id OR c.metahash != p.metahash",
            kinds("c")
        ))?;

        Ok(ChangeStats {
            added_files,
            added_folders,
            added_symlinks,
            deleted_files,
            deleted_folders,
            deleted_symlinks,
            modified_files,
            modified_folders,
            modified_symlinks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::open_scratch;
    use common::{BlocksetId, VolumeState, VolumeType};

    struct Fixture {
        dblock: common::VolumeId,
        metadata_a: common::MetadatasetId,
        metadata_b: common::MetadatasetId,
    }

    fn fixture(catalog: &Catalog) -> Fixture {
        let dblock = catalog
            .register_volume("x.dblock.zip", VolumeType::Blocks, VolumeState::Temporary)
            .unwrap();
        catalog.register_block("ma", 2, dblock).unwrap();
        let (bs_a, _) = catalog
            .register_blockset("meta-a", 2, &[("ma".to_string(), 2)])
            .unwrap();
        let metadata_a = catalog.register_metadataset(bs_a).unwrap();
        catalog.register_block("mb", 2, dblock).unwrap();
        let (bs_b, _) = catalog
            .register_blockset("meta-b", 2, &[("mb".to_string(), 2)])
            .unwrap();
        let metadata_b = catalog.register_metadataset(bs_b).unwrap();
        Fixture {
            dblock,
            metadata_a,
            metadata_b,
        }
    }

    fn content(catalog: &Catalog, fx: &Fixture, hash: &str) -> BlocksetId {
        catalog.register_block(hash, 10, fx.dblock).unwrap();
        catalog
            .register_blockset(&format!("f-{hash}"), 10, &[(hash.to_string(), 10)])
            .unwrap()
            .0
    }

    fn new_fileset(catalog: &Catalog, tag: &str, ts: i64) -> common::FilesetId {
        let dlist = catalog
            .register_volume(
                &format!("{tag}.dlist.zip"),
                VolumeType::Files,
                VolumeState::Temporary,
            )
            .unwrap();
        catalog.create_fileset(dlist, ts, true).unwrap().0
    }

    #[test]
    fn test_change_statistics_buckets() {
        let (_dir, mut catalog) = open_scratch();
        catalog.begin().unwrap();
        let fx = fixture(&catalog);

        let prev = new_fileset(&catalog, "prev", 1000);
        let cur = new_fileset(&catalog, "cur", 2000);

        let unchanged = content(&catalog, &fx, "same");
        let old_content = content(&catalog, &fx, "old");
        let new_content = content(&catalog, &fx, "new");

        // Previous: unchanged file, modified file, deleted folder, symlink
        // about to change metadata.
        catalog.add_file(prev, "/s/keep", unchanged, fx.metadata_a, 1).unwrap();
        catalog.add_file(prev, "/s/mod", old_content, fx.metadata_a, 1).unwrap();
        catalog.add_file(prev, "/s/gone/", BlocksetId::FOLDER, fx.metadata_a, 1).unwrap();
        catalog.add_file(prev, "/s/ln", BlocksetId::SYMLINK, fx.metadata_a, 1).unwrap();

        // Current: keep, modified content, new file, symlink with new
        // metadata.
        catalog.add_file(cur, "/s/keep", unchanged, fx.metadata_a, 1).unwrap();
        catalog.add_file(cur, "/s/mod", new_content, fx.metadata_a, 1).unwrap();
        catalog.add_file(cur, "/s/new", old_content, fx.metadata_a, 1).unwrap();
        catalog.add_file(cur, "/s/ln", BlocksetId::SYMLINK, fx.metadata_b, 1).unwrap();

        let stats = catalog.change_statistics(cur, prev).unwrap();
        assert_eq!(stats.added_files, 1);
        assert_eq!(stats.deleted_folders, 1);
        assert_eq!(stats.modified_files, 1);
        assert_eq!(stats.modified_symlinks, 1);
        assert_eq!(stats.added_folders + stats.added_symlinks, 0);
        assert_eq!(stats.deleted_files + stats.deleted_symlinks, 0);
        assert_eq!(stats.modified_folders, 0);
        assert_eq!(stats.total_changes(), 4);

        // Scratch tables are gone; a second run works from scratch.
        let again = catalog.change_statistics(cur, prev).unwrap();
        assert_eq!(again, stats);
        catalog.commit().unwrap();
    }

    #[test]
    fn test_identical_filesets_report_no_changes() {
        let (_dir, mut catalog) = open_scratch();
        catalog.begin().unwrap();
        let fx = fixture(&catalog);
        let prev = new_fileset(&catalog, "prev", 1000);
        let cur = new_fileset(&catalog, "cur", 2000);
        let blockset = content(&catalog, &fx, "only");
        catalog.add_file(prev, "/s/a", blockset, fx.metadata_a, 1).unwrap();
        catalog.add_file(cur, "/s/a", blockset, fx.metadata_a, 1).unwrap();

        let stats = catalog.change_statistics(cur, prev).unwrap();
        assert_eq!(stats.total_changes(), 0);
        catalog.commit().unwrap();
    }
}
