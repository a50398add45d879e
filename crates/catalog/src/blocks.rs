use rusqlite::{params, OptionalExtension};

use common::{BlockId, BlocksetId, Error, MetadatasetId, Result, VolumeId};

use crate::Catalog;

/// One catalog block row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRow {
    pub id: BlockId,
    pub hash: String,
    pub size: i64,
    pub volume_id: VolumeId,
}

impl Catalog {
    /// Idempotent block registration; the single serialization point for
    /// concurrent dedup decisions.
    ///
    /// Returns the block id and whether this call created the row. A fresh
    /// row is bound to `volume`, the currently open blocks volume of the
    /// caller.
    pub fn register_block(
        &self,
        hash: &str,
        size: i64,
        volume: VolumeId,
    ) -> Result<(BlockId, bool)> {
        let inserted = self
            .conn()
            .prepare_cached(
                "INSERT INTO blocks (hash, size, volume_id) VALUES (?, ?, ?)
                 ON CONFLICT (hash, size) DO NOTHING",
            )?
            .execute(params![hash, size, volume.0])?;
        if inserted > 0 {
            return Ok((BlockId(self.conn().last_insert_rowid()), true));
        }
        let id = self
            .block_id(hash, size)?
            .ok_or_else(|| Error::consistency(format!("block {hash} vanished mid-registration")))?;
        Ok((id, false))
    }

    pub fn block_id(&self, hash: &str, size: i64) -> Result<Option<BlockId>> {
        let id = self
            .conn()
            .prepare_cached("SELECT id FROM blocks WHERE hash = ? AND size = ?")?
            .query_row(params![hash, size], |row| row.get(0))
            .optional()?;
        Ok(id.map(BlockId))
    }

    /// Whether a block with this identity is already catalogued; blocks in
    /// the deleted list do not count, their data is scheduled to go away.
    pub fn block_exists(&self, hash: &str, size: i64) -> Result<bool> {
        Ok(self.block_id(hash, size)?.is_some())
    }

    /// Move a block to another volume; used when a data processor adopts a
    /// block after rotating its open volume, and by compaction re-homing.
    pub fn set_block_volume(&self, block: BlockId, volume: VolumeId) -> Result<()> {
        let updated = self
            .conn()
            .prepare_cached("UPDATE blocks SET volume_id = ? WHERE id = ?")?
            .execute(params![volume.0, block.0])?;
        if updated != 1 {
            return Err(Error::consistency(format!(
                "block {} missing during volume reassignment",
                block.0
            )));
        }
        Ok(())
    }

    /// Idempotent blockset registration keyed on (full_hash, length).
    ///
    /// `block_hashes` are the (hash, size) identities in stream order; every
    /// referenced block must already be registered.
    pub fn register_blockset(
        &self,
        full_hash: &str,
        length: i64,
        block_hashes: &[(String, i64)],
    ) -> Result<(BlocksetId, bool)> {
        if let Some(existing) = self.blockset_id(full_hash, length)? {
            return Ok((existing, false));
        }

        self.conn()
            .prepare_cached("INSERT INTO blocksets (length, full_hash) VALUES (?, ?)")?
            .execute(params![length, full_hash])?;
        let blockset = BlocksetId(self.conn().last_insert_rowid());

        let mut insert_entry = self.conn().prepare_cached(
            "INSERT INTO blockset_entries (blockset_id, idx, block_id) VALUES (?, ?, ?)",
        )?;
        for (index, (hash, size)) in block_hashes.iter().enumerate() {
            let block = self.block_id(hash, *size)?.ok_or_else(|| {
                Error::consistency(format!("blockset references unregistered block {hash}"))
            })?;
            insert_entry.execute(params![blockset.0, index as i64, block.0])?;
        }
        Ok((blockset, true))
    }

    pub fn blockset_id(&self, full_hash: &str, length: i64) -> Result<Option<BlocksetId>> {
        let id = self
            .conn()
            .prepare_cached("SELECT id FROM blocksets WHERE full_hash = ? AND length = ?")?
            .query_row(params![full_hash, length], |row| row.get(0))
            .optional()?;
        Ok(id.map(BlocksetId))
    }

    pub fn blockset_length(&self, blockset: BlocksetId) -> Result<Option<i64>> {
        let length = self
            .conn()
            .prepare_cached("SELECT length FROM blocksets WHERE id = ?")?
            .query_row([blockset.0], |row| row.get(0))
            .optional()?;
        Ok(length)
    }

    pub fn blockset_full_hash(&self, blockset: BlocksetId) -> Result<Option<String>> {
        let hash = self
            .conn()
            .prepare_cached("SELECT full_hash FROM blocksets WHERE id = ?")?
            .query_row([blockset.0], |row| row.get(0))
            .optional()?;
        Ok(hash)
    }

    /// The blocks of a blockset in stream order.
    pub fn blocks_of_blockset(&self, blockset: BlocksetId) -> Result<Vec<BlockRow>> {
        let mut stmt = self.conn().prepare_cached(
            "SELECT b.id, b.hash, b.size, b.volume_id
             FROM blockset_entries e JOIN blocks b ON b.id = e.block_id
             WHERE e.blockset_id = ? ORDER BY e.idx ASC",
        )?;
        let rows = stmt
            .query_map([blockset.0], |row| {
                Ok(BlockRow {
                    id: BlockId(row.get(0)?),
                    hash: row.get(1)?,
                    size: row.get(2)?,
                    volume_id: VolumeId(row.get(3)?),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Record one blocklist hash of a blockset; the hash is itself a block.
    pub fn register_blocklist_hash(
        &self,
        blockset: BlocksetId,
        index: i64,
        hash: &str,
    ) -> Result<()> {
        self.conn()
            .prepare_cached(
                "INSERT INTO blocklist_hashes (blockset_id, idx, hash) VALUES (?, ?, ?)
                 ON CONFLICT (blockset_id, idx) DO NOTHING",
            )?
            .execute(params![blockset.0, index, hash])?;
        Ok(())
    }

    pub fn blocklist_hashes(&self, blockset: BlocksetId) -> Result<Vec<String>> {
        let mut stmt = self.conn().prepare_cached(
            "SELECT hash FROM blocklist_hashes WHERE blockset_id = ? ORDER BY idx ASC",
        )?;
        let rows = stmt
            .query_map([blockset.0], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Idempotent metadataset registration keyed on the metadata blockset.
    pub fn register_metadataset(&self, blockset: BlocksetId) -> Result<MetadatasetId> {
        let existing = self
            .conn()
            .prepare_cached("SELECT id FROM metadatasets WHERE blockset_id = ?")?
            .query_row([blockset.0], |row| row.get(0))
            .optional()?;
        if let Some(id) = existing {
            return Ok(MetadatasetId(id));
        }
        self.conn()
            .prepare_cached("INSERT INTO metadatasets (blockset_id) VALUES (?)")?
            .execute([blockset.0])?;
        Ok(MetadatasetId(self.conn().last_insert_rowid()))
    }

    pub fn metadataset_blockset(&self, metadataset: MetadatasetId) -> Result<BlocksetId> {
        let id: i64 = self
            .conn()
            .prepare_cached("SELECT blockset_id FROM metadatasets WHERE id = ?")?
            .query_row([metadataset.0], |row| row.get(0))?;
        Ok(BlocksetId(id))
    }

    /// All blocks currently homed in a volume, ordered by id for stable
    /// write-out.
    pub fn blocks_in_volume(&self, volume: VolumeId) -> Result<Vec<BlockRow>> {
        let mut stmt = self.conn().prepare_cached(
            "SELECT id, hash, size, volume_id FROM blocks WHERE volume_id = ? ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map([volume.0], |row| {
                Ok(BlockRow {
                    id: BlockId(row.get(0)?),
                    hash: row.get(1)?,
                    size: row.get(2)?,
                    volume_id: VolumeId(row.get(3)?),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Blocklist hashes whose backing block lives in `volume`, with the raw
    /// payload reconstructed from the member block hashes by the caller.
    pub fn blocklist_hashes_in_volume(&self, volume: VolumeId) -> Result<Vec<(BlocksetId, String)>> {
        let mut stmt = self.conn().prepare_cached(
            "SELECT DISTINCT lh.blockset_id, lh.hash
             FROM blocklist_hashes lh
             JOIN blocks b ON b.hash = lh.hash
             WHERE b.volume_id = ?",
        )?;
        let rows = stmt
            .query_map([volume.0], |row| Ok((BlocksetId(row.get(0)?), row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn add_duplicate_block(&self, block: BlockId, volume: VolumeId) -> Result<()> {
        self.conn()
            .prepare_cached(
                "INSERT INTO duplicate_blocks (block_id, volume_id) VALUES (?, ?)
                 ON CONFLICT (block_id, volume_id) DO NOTHING",
            )?
            .execute(params![block.0, volume.0])?;
        Ok(())
    }

    pub fn record_deleted_block(&self, hash: &str, size: i64, volume: VolumeId) -> Result<()> {
        self.conn()
            .prepare_cached("INSERT INTO deleted_blocks (hash, size, volume_id) VALUES (?, ?, ?)")?
            .execute(params![hash, size, volume.0])?;
        Ok(())
    }

    pub fn deleted_blocks_in_volume(&self, volume: VolumeId) -> Result<Vec<(String, i64)>> {
        let mut stmt = self
            .conn()
            .prepare_cached("SELECT hash, size FROM deleted_blocks WHERE volume_id = ?")?;
        let rows = stmt
            .query_map([volume.0], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::open_scratch;
    use common::{VolumeState, VolumeType};

    #[test]
    fn test_register_block_is_idempotent() {
        let (_dir, mut catalog) = open_scratch();
        catalog.begin().unwrap();
        let volume = catalog
            .register_volume("v1.dblock.zip", VolumeType::Blocks, VolumeState::Temporary)
            .unwrap();

        let (first, created) = catalog.register_block("aGFzaA==", 42, volume).unwrap();
        assert!(created);
        let (second, created) = catalog.register_block("aGFzaA==", 42, volume).unwrap();
        assert!(!created);
        assert_eq!(first, second);

        // Same hash at a different size is a distinct block.
        let (third, created) = catalog.register_block("aGFzaA==", 43, volume).unwrap();
        assert!(created);
        assert_ne!(first, third);
        catalog.commit().unwrap();
    }

    #[test]
    fn test_register_blockset_resolves_entries_in_order() {
        let (_dir, mut catalog) = open_scratch();
        catalog.begin().unwrap();
        let volume = catalog
            .register_volume("v1.dblock.zip", VolumeType::Blocks, VolumeState::Temporary)
            .unwrap();
        catalog.register_block("AA==", 10, volume).unwrap();
        catalog.register_block("BB==", 7, volume).unwrap();

        let blocks = vec![("AA==".to_string(), 10), ("BB==".to_string(), 7)];
        let (blockset, created) = catalog.register_blockset("full", 17, &blocks).unwrap();
        assert!(created);
        let (again, created) = catalog.register_blockset("full", 17, &blocks).unwrap();
        assert!(!created);
        assert_eq!(blockset, again);

        let rows = catalog.blocks_of_blockset(blockset).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].hash, "AA==");
        assert_eq!(rows[1].hash, "BB==");
        assert_eq!(rows.iter().map(|r| r.size).sum::<i64>(), 17);
        catalog.commit().unwrap();
    }

    #[test]
    fn test_blockset_requires_registered_blocks() {
        let (_dir, mut catalog) = open_scratch();
        catalog.begin().unwrap();
        let blocks = vec![("missing".to_string(), 10)];
        let result = catalog.register_blockset("full", 10, &blocks);
        assert!(matches!(result, Err(Error::DatabaseConsistency(_))));
        catalog.rollback().unwrap();
    }

    #[test]
    fn test_metadataset_dedupes_by_blockset() {
        let (_dir, mut catalog) = open_scratch();
        catalog.begin().unwrap();
        let volume = catalog
            .register_volume("v1.dblock.zip", VolumeType::Blocks, VolumeState::Temporary)
            .unwrap();
        catalog.register_block("AA==", 4, volume).unwrap();
        let (blockset, _) = catalog
            .register_blockset("meta", 4, &[("AA==".to_string(), 4)])
            .unwrap();

        let first = catalog.register_metadataset(blockset).unwrap();
        let second = catalog.register_metadataset(blockset).unwrap();
        assert_eq!(first, second);
        assert_eq!(catalog.metadataset_blockset(first).unwrap(), blockset);
        catalog.commit().unwrap();
    }
}
