use common::{hash, Error, Result};

use crate::Catalog;

impl Catalog {
    /// Structural verification of invariants over the whole catalog.
    ///
    /// Non-strict mode runs the set-algebra checks; strict mode additionally
    /// recomputes every blocklist payload hash from the member block hashes.
    /// All findings are collected before failing so the operator sees the
    /// full damage in one pass.
    pub fn verify_consistency(
        &self,
        blocksize: usize,
        hash_len: usize,
        strict: bool,
    ) -> Result<()> {
        let mut findings: Vec<String> = Vec::new();
        let conn = self.conn();

        let count = |sql: &str| -> Result<i64> {
            conn.query_row(sql, [], |row| row.get(0)).map_err(Into::into)
        };

        let orphan_blocks = count(
            "SELECT COUNT(*) FROM blocks b
             LEFT JOIN remote_volumes rv ON rv.id = b.volume_id
             WHERE rv.id IS NULL OR rv.state = 'Deleted'",
        )?;
        if orphan_blocks > 0 {
            findings.push(format!("{orphan_blocks} blocks reference missing or deleted volumes"));
        }

        let dangling_entries = count(
            "SELECT COUNT(*) FROM blockset_entries be
             LEFT JOIN blocks b ON b.id = be.block_id
             WHERE b.id IS NULL",
        )?;
        if dangling_entries > 0 {
            findings.push(format!("{dangling_entries} blockset entries reference missing blocks"));
        }

        let dangling_files = count(
            "SELECT COUNT(*) FROM file_lookup fl
             LEFT JOIN blocksets bs ON bs.id = fl.blockset_id
             WHERE fl.blockset_id >= 0 AND bs.id IS NULL",
        )?;
        if dangling_files > 0 {
            findings.push(format!("{dangling_files} files reference missing blocksets"));
        }

        let dangling_metadata = count(
            "SELECT COUNT(*) FROM file_lookup fl
             LEFT JOIN metadatasets ms ON ms.id = fl.metadata_id
             WHERE ms.id IS NULL",
        )?;
        if dangling_metadata > 0 {
            findings.push(format!("{dangling_metadata} files reference missing metadatasets"));
        }

        let bad_fileset_volumes = count(
            "SELECT COUNT(*) FROM filesets fs
             LEFT JOIN remote_volumes rv ON rv.id = fs.volume_id
             WHERE rv.id IS NULL OR rv.kind != 'dlist'
             OR rv.state IN ('Deleting', 'Deleted')",
        )?;
        if bad_fileset_volumes > 0 {
            findings.push(format!(
                "{bad_fileset_volumes} filesets reference missing, mistyped or deleted dlist volumes"
            ));
        }

        let dangling_duplicates = count(
            "SELECT COUNT(*) FROM duplicate_blocks dup
             LEFT JOIN remote_volumes rv ON rv.id = dup.volume_id
             LEFT JOIN blocks b ON b.id = dup.block_id
             WHERE rv.id IS NULL OR b.id IS NULL",
        )?;
        if dangling_duplicates > 0 {
            findings.push(format!(
                "{dangling_duplicates} duplicate-block records reference missing rows"
            ));
        }

        let length_mismatches = count(
            "SELECT COUNT(*) FROM blocksets bs
             WHERE bs.length != IFNULL((
                 SELECT SUM(b.size) FROM blockset_entries be
                 JOIN blocks b ON b.id = be.block_id
                 WHERE be.blockset_id = bs.id
             ), 0)",
        )?;
        if length_mismatches > 0 {
            findings.push(format!(
                "{length_mismatches} blocksets disagree with the sum of their block sizes"
            ));
        }

        let oversized = conn.query_row(
            "SELECT COUNT(*) FROM blockset_entries be
             JOIN blocks b ON b.id = be.block_id
             WHERE b.size > ?1
             OR (b.size != ?1 AND be.idx != (
                 SELECT MAX(be2.idx) FROM blockset_entries be2
                 WHERE be2.blockset_id = be.blockset_id
             ))",
            [blocksize as i64],
            |row| row.get::<_, i64>(0),
        )?;
        if oversized > 0 {
            findings.push(format!(
                "{oversized} blocks break the fixed-blocksize layout"
            ));
        }

        self.verify_blocklists(blocksize, hash_len, strict, &mut findings)?;

        if findings.is_empty() {
            Ok(())
        } else {
            Err(Error::consistency(findings.join("; ")))
        }
    }

    fn verify_blocklists(
        &self,
        blocksize: usize,
        hash_len: usize,
        strict: bool,
        findings: &mut Vec<String>,
    ) -> Result<()> {
        let hashes_per_block = (blocksize / hash_len).max(1) as i64;
        let conn = self.conn();

        // Count accounting: every multi-block blockset carries
        // ceil(entries / hashes_per_block) blocklist hashes.
        let miscounted = conn.query_row(
            "SELECT COUNT(*) FROM blocksets bs
             WHERE (SELECT COUNT(*) FROM blockset_entries be WHERE be.blockset_id = bs.id) > 1
             AND (SELECT COUNT(*) FROM blocklist_hashes lh WHERE lh.blockset_id = bs.id)
                 != ((SELECT COUNT(*) FROM blockset_entries be WHERE be.blockset_id = bs.id)
                     + ?1 - 1) / ?1",
            [hashes_per_block],
            |row| row.get::<_, i64>(0),
        )?;
        if miscounted > 0 {
            findings.push(format!(
                "{miscounted} blocksets have a wrong number of blocklist hashes"
            ));
        }

        if !strict {
            return Ok(());
        }

        let (_, block_hash, _) = self.stored_block_config()?;

        let blocksets: Vec<i64> = conn
            .prepare("SELECT DISTINCT blockset_id FROM blocklist_hashes")?
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        for blockset in blocksets {
            let stored = self.blocklist_hashes(common::BlocksetId(blockset))?;
            let members = self.blocks_of_blockset(common::BlocksetId(blockset))?;

            for (chunk, expected) in stored.iter().enumerate() {
                let start = chunk * hashes_per_block as usize;
                let end = (start + hashes_per_block as usize).min(members.len());
                if start >= members.len() {
                    findings.push(format!(
                        "blockset {blockset} blocklist {chunk} spans no blocks"
                    ));
                    continue;
                }
                let mut payload = Vec::with_capacity((end - start) * hash_len);
                for member in &members[start..end] {
                    payload.extend_from_slice(&hash::from_base64(&member.hash)?);
                }
                let computed = hash::to_base64(&block_hash.digest(&payload));
                if computed != *expected {
                    findings.push(format!(
                        "blockset {blockset} blocklist {chunk} hashes to {computed}, catalog says {expected}"
                    ));
                }
                if !self.block_exists(expected, payload.len() as i64)? {
                    findings.push(format!(
                        "blocklist block {expected} is not catalogued"
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::open_scratch;
    use common::{hash, HashAlgorithm, VolumeState, VolumeType};

    #[test]
    fn test_empty_catalog_is_consistent() {
        let (_dir, catalog) = open_scratch();
        catalog.verify_consistency(1024, 32, true).unwrap();
    }

    #[test]
    fn test_length_mismatch_is_reported() {
        let (_dir, mut catalog) = open_scratch();
        catalog.begin().unwrap();
        let volume = catalog
            .register_volume("a.dblock.zip", VolumeType::Blocks, VolumeState::Temporary)
            .unwrap();
        catalog.register_block("AA==", 10, volume).unwrap();
        catalog
            .register_blockset("full", 11, &[("AA==".to_string(), 10)])
            .unwrap();
        catalog.commit().unwrap();

        let err = catalog.verify_consistency(1024, 32, false).unwrap_err();
        assert!(err.to_string().contains("sum of their block sizes"));
    }

    #[test]
    fn test_missing_volume_is_reported() {
        let (_dir, mut catalog) = open_scratch();
        catalog.begin().unwrap();
        catalog
            .register_block("AA==", 10, common::VolumeId(999))
            .unwrap();
        catalog.commit().unwrap();

        let err = catalog.verify_consistency(1024, 32, false).unwrap_err();
        assert!(err.to_string().contains("missing or deleted volumes"));
    }

    #[test]
    fn test_strict_blocklist_verification() {
        let (_dir, mut catalog) = open_scratch();
        catalog.begin().unwrap();
        let blocksize = default_blocksize();
        let volume = catalog
            .register_volume("a.dblock.zip", VolumeType::Blocks, VolumeState::Temporary)
            .unwrap();

        // Two full blocks and their blocklist block.
        let algorithm = HashAlgorithm::Sha256;
        let raw_a = algorithm.digest(b"block-a");
        let raw_b = algorithm.digest(b"block-b");
        let hash_a = hash::to_base64(&raw_a);
        let hash_b = hash::to_base64(&raw_b);
        catalog.register_block(&hash_a, blocksize as i64, volume).unwrap();
        catalog.register_block(&hash_b, 5, volume).unwrap();
        let (blockset, _) = catalog
            .register_blockset(
                "full",
                blocksize as i64 + 5,
                &[(hash_a.clone(), blocksize as i64), (hash_b.clone(), 5)],
            )
            .unwrap();

        let mut payload = raw_a.clone();
        payload.extend_from_slice(&raw_b);
        let blocklist_hash = hash::to_base64(&algorithm.digest(&payload));
        catalog
            .register_block(&blocklist_hash, payload.len() as i64, volume)
            .unwrap();
        catalog
            .register_blocklist_hash(blockset, 0, &blocklist_hash)
            .unwrap();
        catalog.commit().unwrap();

        catalog.verify_consistency(blocksize, 32, true).unwrap();

        // Corrupt the stored blocklist hash; strict mode notices.
        catalog.begin().unwrap();
        catalog
            .conn()
            .execute("UPDATE blocklist_hashes SET hash = 'bogus'", [])
            .unwrap();
        catalog.commit().unwrap();
        let err = catalog.verify_consistency(blocksize, 32, true).unwrap_err();
        assert!(err.to_string().contains("blocklist"));
    }

    fn default_blocksize() -> usize {
        common::Options::default().blocksize
    }
}
