use catalog::Catalog;
use common::{EntryKind, FilesetId, Result};
use volume::FilelistEntry;

/// Assemble the dlist filelist for a fileset from catalog state; shared by
/// the normal finalization path and the synthetic close-out of an
/// interrupted run.
pub(crate) fn build_filelist(catalog: &Catalog, fileset: FilesetId) -> Result<Vec<FilelistEntry>> {
    let files = catalog.files_in_fileset(fileset)?;
    let mut entries = Vec::with_capacity(files.len());

    for file in files {
        let kind = EntryKind::from_blockset(file.blockset_id);
        let (hash, size, blocklists) = if kind == EntryKind::File {
            let full_hash = catalog.blockset_full_hash(file.blockset_id)?;
            let length = catalog.blockset_length(file.blockset_id)?.unwrap_or(0);
            let blocklists = catalog.blocklist_hashes(file.blockset_id)?;
            (full_hash, length, blocklists)
        } else {
            (None, 0, Vec::new())
        };

        let metadata_blockset = catalog.metadataset_blockset(file.metadata_id)?;
        let metahash = catalog
            .blockset_full_hash(metadata_blockset)?
            .unwrap_or_default();
        let metasize = catalog.blockset_length(metadata_blockset)?.unwrap_or(0);
        let metablockhash = {
            let lists = catalog.blocklist_hashes(metadata_blockset)?;
            (!lists.is_empty()).then_some(lists)
        };

        entries.push(FilelistEntry {
            kind,
            path: file.path,
            hash,
            size,
            time: file.last_modified,
            metahash,
            metasize,
            metablockhash,
            blocklists,
        });
    }
    Ok(entries)
}
