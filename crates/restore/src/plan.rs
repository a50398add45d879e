use std::path::{Path, PathBuf};

use tracing::debug;

use catalog::{Catalog, PlanFile, RestorePlan};
use common::{BlocksetId, EntryKind, Error, FileId, FilesetId, Result};

use crate::RestoreSelection;

/// Resolve which fileset a restore targets.
pub(crate) fn resolve_fileset(catalog: &Catalog, selection: &RestoreSelection) -> Result<FilesetId> {
    let row = match selection {
        RestoreSelection::Latest => catalog
            .list_filesets()?
            .into_iter()
            .next()
            .ok_or_else(|| Error::user("the catalog holds no versions"))?,
        RestoreSelection::Version(version) => catalog.fileset_by_version(*version)?,
        RestoreSelection::Time(timestamp) => catalog.fileset_at_time(*timestamp)?,
    };
    Ok(row.id)
}

/// Pick the files matching the path filters; no filters selects all.
pub(crate) fn select_files(
    catalog: &Catalog,
    fileset: FilesetId,
    filters: &[String],
) -> Result<Vec<FileId>> {
    let patterns: Vec<glob::Pattern> = filters
        .iter()
        .map(|raw| {
            glob::Pattern::new(raw)
                .map_err(|err| Error::user(format!("invalid restore filter {raw:?}: {err}")))
        })
        .collect::<Result<_>>()?;

    let files = catalog.files_in_fileset(fileset)?;
    let selected = files
        .into_iter()
        .filter(|file| {
            patterns.is_empty()
                || patterns
                    .iter()
                    .any(|p| p.matches(&file.path) || file.path == p.as_str())
        })
        .map(|file| file.file_id)
        .collect();
    Ok(selected)
}

/// Longest common directory prefix of the planned paths; stripping it maps
/// sources into the restore directory.
pub(crate) fn common_directory_prefix(paths: &[&str]) -> String {
    fn dir_of(path: &str) -> &str {
        let trimmed = path.strip_suffix(['/', '\\']).unwrap_or(path);
        match trimmed.rfind(['/', '\\']) {
            Some(pos) => &path[..pos + 1],
            None => "",
        }
    }
    let mut prefix: Option<String> = None;
    for path in paths {
        let dir = dir_of(path);
        prefix = Some(match prefix {
            None => dir.to_string(),
            Some(existing) => {
                let mut common = String::new();
                let mut candidate = String::new();
                for (a, b) in existing.chars().zip(dir.chars()) {
                    if a != b {
                        break;
                    }
                    candidate.push(a);
                    if a == '/' || a == '\\' {
                        common = candidate.clone();
                    }
                }
                common
            }
        });
    }
    prefix.unwrap_or_default()
}

/// Assign target paths and create the directory tree.
pub(crate) fn map_targets(
    catalog: &Catalog,
    plan: &RestorePlan,
    target_dir: Option<&Path>,
) -> Result<Vec<PlanFile>> {
    let mut files = catalog.plan_files(plan)?;
    let paths: Vec<&str> = files.iter().map(|f| f.path.as_str()).collect();
    let prefix = common_directory_prefix(&paths);
    debug!(%prefix, files = files.len(), "restore target mapping");

    for file in &mut files {
        let target = match target_dir {
            Some(dir) => {
                let relative = file.path.strip_prefix(&prefix).unwrap_or(&file.path);
                let relative = relative.trim_start_matches(['/', '\\']);
                dir.join(relative)
            }
            None => PathBuf::from(&file.path),
        };
        let target_str = target.to_string_lossy().into_owned();
        catalog.set_plan_target(plan, file.file_id, &target_str)?;
        file.target_path = Some(target_str);
    }

    // Folders first, then file parents.
    for file in &files {
        let Some(target) = &file.target_path else { continue };
        if file.blockset_id == BlocksetId::FOLDER {
            std::fs::create_dir_all(target.trim_end_matches(['/', '\\']))
                .map_err(|e| Error::path(target.clone(), e))?;
        } else if let Some(parent) = Path::new(target).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| Error::path(parent, e))?;
            }
        }
    }
    Ok(files)
}

/// Kind of one planned file, judged from its sentinel blockset.
pub(crate) fn kind_of(file: &PlanFile) -> EntryKind {
    EntryKind::from_blockset(file.blockset_id)
}
