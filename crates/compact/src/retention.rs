use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, instrument};

use common::{epoch_now, Error, FilesetId, Options, Result};
use remote::{RemoteManager, SharedCatalog};

/// Which versions an explicit `delete` targets.
#[derive(Debug, Clone)]
pub enum DeleteSelection {
    /// Version numbers counting back from the newest (0).
    Versions(Vec<usize>),
    /// Every version older than this.
    OlderThan(Duration),
    /// Apply the configured retention rules.
    Policy,
}

/// Apply the configured retention rules after a successful backup.
///
/// Returns the number of filesets dropped. The newest version always
/// survives.
#[instrument(skip_all)]
pub async fn run_retention(catalog: &SharedCatalog, options: &Options) -> Result<usize> {
    let now = epoch_now();
    let doomed = {
        let guard = catalog.lock().await;
        let filesets = guard.list_filesets()?;
        select_by_rules(&filesets, options, now)
    };
    drop_filesets(catalog, options, doomed).await
}

/// Explicit `delete` entry point.
#[instrument(skip_all)]
pub async fn run_delete(
    catalog: &SharedCatalog,
    manager: &Arc<RemoteManager>,
    options: &Options,
    selection: DeleteSelection,
) -> Result<usize> {
    {
        let guard = catalog.lock().await;
        guard.require_complete("delete")?;
    }
    let now = epoch_now();
    let doomed = {
        let guard = catalog.lock().await;
        let filesets = guard.list_filesets()?;
        match &selection {
            DeleteSelection::Versions(versions) => {
                let mut doomed = Vec::new();
                for version in versions {
                    let fileset = filesets.get(*version).ok_or_else(|| {
                        Error::user(format!("no version {version} in the catalog"))
                    })?;
                    doomed.push(fileset.id);
                }
                doomed
            }
            DeleteSelection::OlderThan(age) => {
                let cutoff = now - age.as_secs() as i64;
                filesets
                    .iter()
                    .skip(1) // the newest version is never deleted by age
                    .filter(|fs| fs.timestamp < cutoff)
                    .map(|fs| fs.id)
                    .collect()
            }
            DeleteSelection::Policy => select_by_rules(&filesets, options, now),
        }
    };
    let count = drop_filesets(catalog, options, doomed).await?;
    if !options.dryrun {
        manager.execute_deletes(catalog, now).await?;
    }
    Ok(count)
}

fn select_by_rules(
    filesets: &[catalog::FilesetRow],
    options: &Options,
    now: i64,
) -> Vec<FilesetId> {
    let mut doomed: BTreeSet<i64> = BTreeSet::new();

    if let Some(keep) = options.keep_versions {
        for fileset in filesets.iter().skip(keep.max(1)) {
            doomed.insert(fileset.timestamp);
        }
    }
    if let Some(age) = options.keep_time {
        let cutoff = now - age.as_secs() as i64;
        for fileset in filesets.iter().skip(1) {
            if fileset.timestamp < cutoff {
                doomed.insert(fileset.timestamp);
            }
        }
    }
    if let Some(policy) = &options.retention_policy {
        let timestamps: Vec<i64> = filesets.iter().map(|fs| fs.timestamp).collect();
        for timestamp in policy.versions_to_delete(now, &timestamps) {
            doomed.insert(timestamp);
        }
    }

    filesets
        .iter()
        .filter(|fs| doomed.contains(&fs.timestamp))
        .map(|fs| fs.id)
        .collect()
}

async fn drop_filesets(
    catalog: &SharedCatalog,
    options: &Options,
    doomed: Vec<FilesetId>,
) -> Result<usize> {
    if doomed.is_empty() {
        return Ok(0);
    }
    info!(count = doomed.len(), "dropping filesets");

    let grace_until = epoch_now() + options.delete_grace.as_secs() as i64;
    let mut guard = catalog.lock().await;
    let owns = !guard.in_transaction();
    if owns {
        guard.begin()?;
    }
    let result = guard.drop_filesets(&doomed, grace_until);
    if owns {
        match &result {
            Ok(_) if !options.dryrun => guard.commit()?,
            _ => guard.rollback()?,
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use catalog::FilesetRow;
    use common::{RetentionPolicy, VolumeId};

    fn filesets(timestamps: &[i64]) -> Vec<FilesetRow> {
        timestamps
            .iter()
            .enumerate()
            .map(|(index, ts)| FilesetRow {
                id: FilesetId(index as i64 + 1),
                timestamp: *ts,
                volume_id: VolumeId(100 + index as i64),
                is_full: true,
            })
            .collect()
    }

    #[test]
    fn test_keep_versions() {
        let options = Options {
            keep_versions: Some(2),
            ..Options::default()
        };
        let rows = filesets(&[4000, 3000, 2000, 1000]);
        let doomed = select_by_rules(&rows, &options, 5000);
        assert_eq!(doomed, vec![FilesetId(3), FilesetId(4)]);
    }

    #[test]
    fn test_keep_time_spares_newest() {
        let options = Options {
            keep_time: Some(Duration::from_secs(100)),
            ..Options::default()
        };
        let rows = filesets(&[1000, 900, 800]);
        // Everything is out of the window, but version 0 survives.
        let doomed = select_by_rules(&rows, &options, 5000);
        assert_eq!(doomed, vec![FilesetId(2), FilesetId(3)]);
    }

    #[test]
    fn test_policy_rule() {
        let day = 86_400i64;
        let options = Options {
            retention_policy: Some(RetentionPolicy::parse("10D:2D").unwrap()),
            ..Options::default()
        };
        let now = 100 * day;
        let rows = filesets(&[now, now - day, now - 2 * day, now - 3 * day]);
        let doomed = select_by_rules(&rows, &options, now);
        assert_eq!(doomed, vec![FilesetId(2), FilesetId(4)]);
    }
}
