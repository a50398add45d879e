use rusqlite::{params, OptionalExtension};

use common::{BlocksetId, FileId, FilesetId, Result, VolumeId};

use crate::Catalog;

/// Block kind inside a restore plan: file content or metadata blob.
pub const PLAN_CONTENT: i64 = 0;
pub const PLAN_METADATA: i64 = 1;

/// Handle to the per-restore scratch tables.
///
/// Tables carry a random suffix and must be dropped through
/// [`Catalog::drop_restore_plan`] on every exit path; the restore operation
/// wraps its phases accordingly.
#[derive(Debug, Clone)]
pub struct RestorePlan {
    files_table: String,
    blocks_table: String,
}

/// One target file in the plan.
#[derive(Debug, Clone)]
pub struct PlanFile {
    pub file_id: FileId,
    pub path: String,
    pub target_path: Option<String>,
    pub blockset_id: BlocksetId,
    pub length: i64,
    pub full_hash: Option<String>,
}

/// One block still to be patched into a target.
#[derive(Debug, Clone)]
pub struct PlanBlock {
    pub file_id: FileId,
    pub kind: i64,
    pub index: i64,
    pub hash: String,
    pub size: i64,
    pub volume_id: VolumeId,
}

impl Catalog {
    /// Materialize the scratch tables for restoring `files` out of `fileset`.
    pub fn create_restore_plan(
        &self,
        fileset: FilesetId,
        files: &[FileId],
    ) -> Result<RestorePlan> {
        let suffix = Self::scratch_suffix();
        let plan = RestorePlan {
            files_table: format!("restore_files_{suffix}"),
            blocks_table: format!("restore_blocks_{suffix}"),
        };
        let conn = self.conn();

        conn.execute_batch(&format!(
            "CREATE TEMPORARY TABLE {files} (
                 file_id INTEGER PRIMARY KEY,
                 path TEXT NOT NULL,
                 target_path TEXT,
                 blockset_id INTEGER NOT NULL,
                 length INTEGER NOT NULL,
                 full_hash TEXT
             );
             CREATE TEMPORARY TABLE {blocks} (
                 file_id INTEGER NOT NULL,
                 kind INTEGER NOT NULL,
                 idx INTEGER NOT NULL,
                 hash TEXT NOT NULL,
                 size INTEGER NOT NULL,
                 volume_id INTEGER NOT NULL,
                 restored INTEGER NOT NULL DEFAULT 0,
                 PRIMARY KEY (file_id, kind, idx)
             );",
            files = plan.files_table,
            blocks = plan.blocks_table,
        ))?;

        let result = self.populate_restore_plan(&plan, fileset, files);
        if result.is_err() {
            self.drop_restore_plan(&plan);
        }
        result.map(|_| plan)
    }

    fn populate_restore_plan(
        &self,
        plan: &RestorePlan,
        fileset: FilesetId,
        files: &[FileId],
    ) -> Result<()> {
        let conn = self.conn();
        let mut insert_file = conn.prepare(&format!(
            "INSERT INTO {} (file_id, path, blockset_id, length, full_hash)
             SELECT fl.id, pp.prefix || fl.path, fl.blockset_id,
                    IFNULL(bs.length, 0), bs.full_hash
             FROM fileset_entries fe
             JOIN file_lookup fl ON fl.id = fe.file_id
             JOIN path_prefixes pp ON pp.id = fl.prefix_id
             LEFT JOIN blocksets bs ON bs.id = fl.blockset_id
             WHERE fe.fileset_id = ? AND fl.id = ?",
            plan.files_table
        ))?;
        let mut insert_content = conn.prepare(&format!(
            "INSERT INTO {} (file_id, kind, idx, hash, size, volume_id)
             SELECT ?, {PLAN_CONTENT}, be.idx, b.hash, b.size, b.volume_id
             FROM blockset_entries be
             JOIN blocks b ON b.id = be.block_id
             WHERE be.blockset_id = ?",
            plan.blocks_table
        ))?;
        let mut insert_metadata = conn.prepare(&format!(
            "INSERT INTO {} (file_id, kind, idx, hash, size, volume_id)
             SELECT ?, {PLAN_METADATA}, be.idx, b.hash, b.size, b.volume_id
             FROM metadatasets ms
             JOIN blockset_entries be ON be.blockset_id = ms.blockset_id
             JOIN blocks b ON b.id = be.block_id
             JOIN file_lookup fl ON fl.metadata_id = ms.id
             WHERE fl.id = ?",
            plan.blocks_table
        ))?;

        for file in files {
            let inserted = insert_file.execute(params![fileset.0, file.0])?;
            if inserted == 0 {
                continue;
            }
            let blockset: i64 = conn
                .prepare_cached("SELECT blockset_id FROM file_lookup WHERE id = ?")?
                .query_row([file.0], |row| row.get(0))?;
            if blockset >= 0 {
                insert_content.execute(params![file.0, blockset])?;
            }
            insert_metadata.execute(params![file.0, file.0])?;
        }
        Ok(())
    }

    /// Drop the scratch tables; safe to call repeatedly.
    pub fn drop_restore_plan(&self, plan: &RestorePlan) {
        let _ = self.conn().execute_batch(&format!(
            "DROP TABLE IF EXISTS temp.{};
             DROP TABLE IF EXISTS temp.{};",
            plan.files_table, plan.blocks_table
        ));
    }

    pub fn plan_files(&self, plan: &RestorePlan) -> Result<Vec<PlanFile>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT file_id, path, target_path, blockset_id, length, full_hash
             FROM {} ORDER BY path ASC",
            plan.files_table
        ))?;
        let rows = stmt
            .query_map([], |row| {
                Ok(PlanFile {
                    file_id: FileId(row.get(0)?),
                    path: row.get(1)?,
                    target_path: row.get(2)?,
                    blockset_id: BlocksetId(row.get(3)?),
                    length: row.get(4)?,
                    full_hash: row.get(5)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn set_plan_target(
        &self,
        plan: &RestorePlan,
        file: FileId,
        target_path: &str,
    ) -> Result<()> {
        self.conn().execute(
            &format!("UPDATE {} SET target_path = ? WHERE file_id = ?", plan.files_table),
            params![target_path, file.0],
        )?;
        Ok(())
    }

    pub fn plan_target(&self, plan: &RestorePlan, file: FileId) -> Result<Option<String>> {
        let target = self
            .conn()
            .query_row(
                &format!("SELECT target_path FROM {} WHERE file_id = ?", plan.files_table),
                [file.0],
                |row| row.get(0),
            )
            .optional()?;
        Ok(target.flatten())
    }

    pub fn mark_plan_block_restored(
        &self,
        plan: &RestorePlan,
        file: FileId,
        kind: i64,
        index: i64,
    ) -> Result<()> {
        self.conn().execute(
            &format!(
                "UPDATE {} SET restored = 1 WHERE file_id = ? AND kind = ? AND idx = ?",
                plan.blocks_table
            ),
            params![file.0, kind, index],
        )?;
        Ok(())
    }

    /// Volumes that still hold unrestored blocks, busiest first.
    pub fn plan_pending_volumes(&self, plan: &RestorePlan) -> Result<Vec<VolumeId>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT volume_id FROM {} WHERE restored = 0
             GROUP BY volume_id ORDER BY COUNT(*) DESC",
            plan.blocks_table
        ))?;
        let rows = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<i64>, _>>()?;
        Ok(rows.into_iter().map(VolumeId).collect())
    }

    pub fn plan_pending_blocks_in_volume(
        &self,
        plan: &RestorePlan,
        volume: VolumeId,
    ) -> Result<Vec<PlanBlock>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT file_id, kind, idx, hash, size, volume_id FROM {}
             WHERE restored = 0 AND volume_id = ?
             ORDER BY file_id ASC, kind ASC, idx ASC",
            plan.blocks_table
        ))?;
        let rows = stmt
            .query_map([volume.0], plan_block_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn plan_pending_blocks_for_file(
        &self,
        plan: &RestorePlan,
        file: FileId,
    ) -> Result<Vec<PlanBlock>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT file_id, kind, idx, hash, size, volume_id FROM {}
             WHERE restored = 0 AND file_id = ?
             ORDER BY kind ASC, idx ASC",
            plan.blocks_table
        ))?;
        let rows = stmt
            .query_map([file.0], plan_block_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// All metadata rows of a file regardless of restored state; phase 4
    /// re-reads them to assemble the blob.
    pub fn plan_metadata_blocks(&self, plan: &RestorePlan, file: FileId) -> Result<Vec<PlanBlock>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT file_id, kind, idx, hash, size, volume_id FROM {}
             WHERE kind = {PLAN_METADATA} AND file_id = ?
             ORDER BY idx ASC",
            plan.blocks_table
        ))?;
        let rows = stmt
            .query_map([file.0], plan_block_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// (total, restored) content-block counters for one file.
    pub fn plan_file_progress(&self, plan: &RestorePlan, file: FileId) -> Result<(i64, i64)> {
        self.conn()
            .query_row(
                &format!(
                    "SELECT COUNT(*), IFNULL(SUM(restored), 0) FROM {}
                     WHERE file_id = ? AND kind = {PLAN_CONTENT}",
                    plan.blocks_table
                ),
                [file.0],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(Into::into)
    }
}

fn plan_block_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PlanBlock> {
    Ok(PlanBlock {
        file_id: FileId(row.get(0)?),
        kind: row.get(1)?,
        index: row.get(2)?,
        hash: row.get(3)?,
        size: row.get(4)?,
        volume_id: VolumeId(row.get(5)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::open_scratch;
    use common::{VolumeState, VolumeType};

    #[test]
    fn test_plan_collects_content_and_metadata() {
        let (_dir, mut catalog) = open_scratch();
        catalog.begin().unwrap();
        let dblock = catalog
            .register_volume("a.dblock.zip", VolumeType::Blocks, VolumeState::Temporary)
            .unwrap();
        let dlist = catalog
            .register_volume("a.dlist.zip", VolumeType::Files, VolumeState::Temporary)
            .unwrap();
        let (fileset, _) = catalog.create_fileset(dlist, 1000, true).unwrap();

        catalog.register_block("c1", 7, dblock).unwrap();
        catalog.register_block("c2", 3, dblock).unwrap();
        let (content, _) = catalog
            .register_blockset("fh", 10, &[("c1".to_string(), 7), ("c2".to_string(), 3)])
            .unwrap();
        catalog.register_block("m1", 2, dblock).unwrap();
        let (meta_bs, _) = catalog
            .register_blockset("mh", 2, &[("m1".to_string(), 2)])
            .unwrap();
        let metadata = catalog.register_metadataset(meta_bs).unwrap();
        let file = catalog
            .add_file(fileset, "/s/a.bin", content, metadata, 1)
            .unwrap();

        let plan = catalog.create_restore_plan(fileset, &[file]).unwrap();
        let files = catalog.plan_files(&plan).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].length, 10);
        assert_eq!(files[0].full_hash.as_deref(), Some("fh"));

        let pending = catalog.plan_pending_blocks_for_file(&plan, file).unwrap();
        assert_eq!(pending.len(), 3); // two content, one metadata
        assert_eq!(
            pending.iter().filter(|b| b.kind == PLAN_METADATA).count(),
            1
        );

        catalog
            .mark_plan_block_restored(&plan, file, PLAN_CONTENT, 0)
            .unwrap();
        let (total, restored) = catalog.plan_file_progress(&plan, file).unwrap();
        assert_eq!((total, restored), (2, 1));

        assert_eq!(catalog.plan_pending_volumes(&plan).unwrap(), vec![dblock]);

        catalog.drop_restore_plan(&plan);
        // Second drop is harmless.
        catalog.drop_restore_plan(&plan);
        catalog.commit().unwrap();
    }

    #[test]
    fn test_plan_handles_sentinel_blocksets() {
        let (_dir, mut catalog) = open_scratch();
        catalog.begin().unwrap();
        let dblock = catalog
            .register_volume("a.dblock.zip", VolumeType::Blocks, VolumeState::Temporary)
            .unwrap();
        let dlist = catalog
            .register_volume("a.dlist.zip", VolumeType::Files, VolumeState::Temporary)
            .unwrap();
        let (fileset, _) = catalog.create_fileset(dlist, 1000, true).unwrap();
        catalog.register_block("m1", 2, dblock).unwrap();
        let (meta_bs, _) = catalog
            .register_blockset("mh", 2, &[("m1".to_string(), 2)])
            .unwrap();
        let metadata = catalog.register_metadataset(meta_bs).unwrap();
        let folder = catalog
            .add_file(fileset, "/s/dir/", common::BlocksetId::FOLDER, metadata, 1)
            .unwrap();

        let plan = catalog.create_restore_plan(fileset, &[folder]).unwrap();
        let files = catalog.plan_files(&plan).unwrap();
        assert_eq!(files[0].blockset_id, common::BlocksetId::FOLDER);
        assert_eq!(files[0].length, 0);

        let pending = catalog.plan_pending_blocks_for_file(&plan, folder).unwrap();
        assert!(pending.iter().all(|b| b.kind == PLAN_METADATA));
        catalog.drop_restore_plan(&plan);
        catalog.commit().unwrap();
    }
}
