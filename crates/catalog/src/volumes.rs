use rusqlite::{params, OptionalExtension, Row};

use common::{Error, Result, VolumeId, VolumeState, VolumeType};

use crate::Catalog;

/// One remote volume row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeRow {
    pub id: VolumeId,
    pub name: String,
    pub kind: VolumeType,
    pub state: VolumeState,
    pub size: Option<i64>,
    pub hash: Option<String>,
    pub delete_grace_until: Option<i64>,
}

fn volume_from_row(row: &Row<'_>) -> rusqlite::Result<VolumeRow> {
    let kind: String = row.get(2)?;
    let state: String = row.get(3)?;
    Ok(VolumeRow {
        id: VolumeId(row.get(0)?),
        name: row.get(1)?,
        kind: VolumeType::parse(&kind).unwrap_or(VolumeType::Blocks),
        state: VolumeState::parse(&state).unwrap_or(VolumeState::Temporary),
        size: row.get(4)?,
        hash: row.get(5)?,
        delete_grace_until: row.get(6)?,
    })
}

const VOLUME_COLUMNS: &str = "id, name, kind, state, size, hash, delete_grace_until";

impl Catalog {
    /// Register a remote volume; names are unique per destination.
    pub fn register_volume(
        &self,
        name: &str,
        kind: VolumeType,
        state: VolumeState,
    ) -> Result<VolumeId> {
        let inserted = self
            .conn()
            .prepare_cached("INSERT INTO remote_volumes (name, kind, state) VALUES (?, ?, ?)")?
            .execute(params![name, kind.suffix(), state.as_str()])?;
        if inserted != 1 {
            return Err(Error::consistency(format!("duplicate remote name {name}")));
        }
        Ok(VolumeId(self.conn().last_insert_rowid()))
    }

    pub fn volume_by_id(&self, volume: VolumeId) -> Result<Option<VolumeRow>> {
        let row = self
            .conn()
            .prepare_cached(&format!(
                "SELECT {VOLUME_COLUMNS} FROM remote_volumes WHERE id = ?"
            ))?
            .query_row([volume.0], volume_from_row)
            .optional()?;
        Ok(row)
    }

    pub fn volume_by_name(&self, name: &str) -> Result<Option<VolumeRow>> {
        let row = self
            .conn()
            .prepare_cached(&format!(
                "SELECT {VOLUME_COLUMNS} FROM remote_volumes WHERE name = ?"
            ))?
            .query_row([name], volume_from_row)
            .optional()?;
        Ok(row)
    }

    pub fn list_volumes(&self) -> Result<Vec<VolumeRow>> {
        let mut stmt = self.conn().prepare_cached(&format!(
            "SELECT {VOLUME_COLUMNS} FROM remote_volumes ORDER BY id ASC"
        ))?;
        let rows = stmt
            .query_map([], volume_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn volumes_in_state(&self, kind: VolumeType, state: VolumeState) -> Result<Vec<VolumeRow>> {
        let mut stmt = self.conn().prepare_cached(&format!(
            "SELECT {VOLUME_COLUMNS} FROM remote_volumes WHERE kind = ? AND state = ? ORDER BY id ASC"
        ))?;
        let rows = stmt
            .query_map(params![kind.suffix(), state.as_str()], volume_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Forward-only state transition; refuses to resurrect a volume.
    pub fn set_volume_state(&self, volume: VolumeId, state: VolumeState) -> Result<()> {
        let current = self
            .volume_by_id(volume)?
            .ok_or_else(|| Error::consistency(format!("volume {} is not catalogued", volume.0)))?;
        if !transition_allowed(current.state, state) {
            return Err(Error::consistency(format!(
                "volume {} cannot move {:?} -> {:?}",
                current.name, current.state, state
            )));
        }
        self.conn()
            .prepare_cached("UPDATE remote_volumes SET state = ? WHERE id = ?")?
            .execute(params![state.as_str(), volume.0])?;
        Ok(())
    }

    /// Mark a volume Deleting and stamp the end of its grace window.
    pub fn set_volume_deleting(&self, volume: VolumeId, grace_until: i64) -> Result<()> {
        self.set_volume_state(volume, VolumeState::Deleting)?;
        self.conn()
            .prepare_cached("UPDATE remote_volumes SET delete_grace_until = ? WHERE id = ?")?
            .execute(params![grace_until, volume.0])?;
        Ok(())
    }

    /// Size and hash recorded once the volume file is finalized.
    pub fn set_volume_info(&self, volume: VolumeId, size: i64, hash: &str) -> Result<()> {
        self.conn()
            .prepare_cached("UPDATE remote_volumes SET size = ?, hash = ? WHERE id = ?")?
            .execute(params![size, hash, volume.0])?;
        Ok(())
    }

    /// Remove a fully deleted volume from the catalog, together with its
    /// duplicate-block records, index links and deleted-block accounting.
    pub fn remove_volume(&self, volume: VolumeId) -> Result<()> {
        let live: i64 = self
            .conn()
            .prepare_cached("SELECT COUNT(*) FROM blocks WHERE volume_id = ?")?
            .query_row([volume.0], |row| row.get(0))?;
        if live > 0 {
            return Err(Error::consistency(format!(
                "volume {} still homes {live} blocks",
                volume.0
            )));
        }
        self.conn()
            .prepare_cached("DELETE FROM duplicate_blocks WHERE volume_id = ?")?
            .execute([volume.0])?;
        self.conn()
            .prepare_cached("DELETE FROM deleted_blocks WHERE volume_id = ?")?
            .execute([volume.0])?;
        self.conn()
            .prepare_cached(
                "DELETE FROM index_block_links WHERE index_volume_id = ? OR block_volume_id = ?",
            )?
            .execute(params![volume.0, volume.0])?;
        self.conn()
            .prepare_cached("DELETE FROM remote_volumes WHERE id = ?")?
            .execute([volume.0])?;
        Ok(())
    }

    pub fn add_index_link(&self, index_volume: VolumeId, block_volume: VolumeId) -> Result<()> {
        self.conn()
            .prepare_cached(
                "INSERT INTO index_block_links (index_volume_id, block_volume_id) VALUES (?, ?)
                 ON CONFLICT (index_volume_id, block_volume_id) DO NOTHING",
            )?
            .execute(params![index_volume.0, block_volume.0])?;
        Ok(())
    }

    pub fn index_volumes_for(&self, block_volume: VolumeId) -> Result<Vec<VolumeId>> {
        let mut stmt = self
            .conn()
            .prepare_cached("SELECT index_volume_id FROM index_block_links WHERE block_volume_id = ?")?;
        let rows = stmt
            .query_map([block_volume.0], |row| row.get(0))?
            .collect::<std::result::Result<Vec<i64>, _>>()?;
        Ok(rows.into_iter().map(VolumeId).collect())
    }

    pub fn block_volumes_for(&self, index_volume: VolumeId) -> Result<Vec<VolumeId>> {
        let mut stmt = self
            .conn()
            .prepare_cached("SELECT block_volume_id FROM index_block_links WHERE index_volume_id = ?")?;
        let rows = stmt
            .query_map([index_volume.0], |row| row.get(0))?
            .collect::<std::result::Result<Vec<i64>, _>>()?;
        Ok(rows.into_iter().map(VolumeId).collect())
    }

    /// Index volumes whose every linked block volume has reached Deleting or
    /// left the catalog; such an index no longer describes live data.
    pub fn fully_released_index_volumes(&self) -> Result<Vec<VolumeRow>> {
        let mut stmt = self.conn().prepare_cached(&format!(
            "SELECT {VOLUME_COLUMNS} FROM remote_volumes iv
             WHERE iv.kind = 'dindex'
             AND iv.state IN ('Uploaded', 'Verified')
             AND NOT EXISTS (
                 SELECT 1 FROM index_block_links l
                 JOIN remote_volumes bv ON bv.id = l.block_volume_id
                 WHERE l.index_volume_id = iv.id
                 AND bv.state NOT IN ('Deleting', 'Deleted')
             )
             AND EXISTS (SELECT 1 FROM index_block_links l WHERE l.index_volume_id = iv.id)"
        ))?;
        let rows = stmt
            .query_map([], volume_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn transition_allowed(from: VolumeState, to: VolumeState) -> bool {
    use VolumeState::*;
    match (from, to) {
        // Upload failures fall back to Temporary for reassignment.
        (Uploading, Temporary) => true,
        (Temporary, Uploading | Deleting) => true,
        (Uploading, Uploaded | Deleting) => true,
        (Uploaded, Verified | Deleting) => true,
        (Verified, Deleting) => true,
        (Deleting, Deleted) => true,
        (a, b) => a == b,
    }
}
