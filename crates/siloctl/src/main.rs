use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Once;

use clap::{Parser, Subcommand};
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use catalog::Catalog;
use common::{
    epoch_now, lock::OperationLock, CancellationToken, Error, HashAlgorithm, Options,
    RetentionPolicy,
};
use remote::{FileBackend, RemoteManager, SharedCatalog};
use volume::{BlockConfig, PassthroughEncryptor};

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let format = std::env::var("SILO_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

        if format.eq_ignore_ascii_case("json") {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(true)
                .json()
                .flatten_event(true)
                .init();
        } else {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(true)
                .compact()
                .init();
        }
    });
}

#[derive(Parser)]
#[command(name = "siloctl")]
#[command(about = "Deduplicating encrypted backup engine", long_about = None)]
struct Cli {
    /// Local catalog file.
    #[arg(long, global = true, default_value = "silo.catalog")]
    db: PathBuf,
    /// Destination folder (the remote).
    #[arg(long, global = true, default_value = "silo-store")]
    destination: PathBuf,
    /// Remote filename prefix.
    #[arg(long, global = true, default_value = common::DEFAULT_PREFIX)]
    prefix: String,
    /// Block size in bytes.
    #[arg(long, global = true)]
    blocksize: Option<usize>,
    /// Volume payload budget in bytes.
    #[arg(long, global = true)]
    volume_size: Option<u64>,
    /// Block hash algorithm (SHA256 or BLAKE3).
    #[arg(long, global = true)]
    block_hash: Option<String>,
    /// Log actions without uploading or deleting.
    #[arg(long, global = true)]
    dry_run: bool,
    /// Skip the pre-operation remote listing check.
    #[arg(long, global = true)]
    no_backend_verification: bool,
    /// Reclaim leftovers of interrupted runs automatically.
    #[arg(long, global = true)]
    auto_cleanup: bool,
    /// Re-hash every block payload when testing or restoring.
    #[arg(long, global = true)]
    full_block_verification: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Back up one or more source paths
    Backup {
        sources: Vec<PathBuf>,
        /// Exclude glob, repeatable
        #[arg(long)]
        exclude: Vec<String>,
        /// Keep at most this many versions afterwards
        #[arg(long)]
        keep_versions: Option<usize>,
        /// Keep versions younger than this (e.g. 30D)
        #[arg(long)]
        keep_time: Option<String>,
        /// Retention frames, e.g. 7D:1D,4W:1W
        #[arg(long)]
        retention_policy: Option<String>,
        /// Skip files larger than this many bytes
        #[arg(long)]
        skip_files_larger_than: Option<u64>,
    },
    /// Restore files from a version
    Restore {
        /// Path globs to restore; empty restores everything
        paths: Vec<String>,
        /// Target directory; omitted restores to original locations
        #[arg(long)]
        target: Option<PathBuf>,
        /// Version number counting back from the newest (0)
        #[arg(long)]
        version: Option<usize>,
        /// Restore the newest version at or before this age (e.g. 7D) or epoch second
        #[arg(long)]
        time: Option<String>,
        /// Overwrite existing files instead of renaming
        #[arg(long)]
        overwrite: bool,
        /// Use the single-threaded patcher
        #[arg(long)]
        legacy: bool,
        /// Source matching blocks from the original paths on disk
        #[arg(long)]
        use_local_blocks: bool,
        /// Re-hash every restored file end-to-end
        #[arg(long)]
        verify: bool,
    },
    /// Delete backup versions
    Delete {
        /// Version numbers counting back from the newest (0)
        #[arg(long)]
        version: Vec<usize>,
        /// Delete versions older than this (e.g. 90D)
        #[arg(long)]
        older_than: Option<String>,
        /// Apply the configured retention rules
        #[arg(long)]
        retention_policy: Option<String>,
    },
    /// Rewrite wasteful remote volumes
    Compact {
        /// Run even when no trigger fires
        #[arg(long)]
        force: bool,
        /// Wasted-space percentage that marks a volume
        #[arg(long)]
        threshold: Option<u32>,
    },
    /// Verify a sample of remote volumes
    Test {
        /// How many volumes to examine
        #[arg(default_value_t = 3)]
        samples: usize,
    },
    /// Rebuild or reconcile the local catalog
    Repair,
    /// List versions, or the files of one version
    List {
        /// Version to list files of
        #[arg(long)]
        version: Option<usize>,
        /// Substring filter on paths
        #[arg(long)]
        filter: Option<String>,
    },
    /// List files depending on remotely-missing volumes
    ListBroken {
        #[arg(long)]
        filter: Option<String>,
    },
    /// Drop catalog records that depend on lost volumes
    PurgeBrokenFiles,
    /// Show what the named remote volumes carry
    ListAffected { targets: Vec<String> },
    /// Show change statistics between two versions
    Compare {
        /// Newer version (default 0)
        #[arg(default_value_t = 0)]
        current: usize,
        /// Older version (default 1)
        #[arg(default_value_t = 1)]
        previous: usize,
    },
}

fn build_options(cli: &Cli) -> Result<Options, Error> {
    let mut options = Options {
        prefix: cli.prefix.clone(),
        dryrun: cli.dry_run,
        no_backend_verification: cli.no_backend_verification,
        auto_cleanup: cli.auto_cleanup,
        full_block_verification: cli.full_block_verification,
        passphrase: std::env::var("SILO_PASSPHRASE").ok(),
        ..Options::default()
    };
    if let Some(blocksize) = cli.blocksize {
        options.blocksize = blocksize;
    }
    if let Some(volume_size) = cli.volume_size {
        options.volume_size = volume_size;
    }
    if let Some(algorithm) = &cli.block_hash {
        options.block_hash_algorithm = HashAlgorithm::parse(algorithm)?;
    }
    options.validate()?;
    Ok(options)
}

/// Epoch seconds from either a raw number or an age like `7D`.
fn parse_point_in_time(raw: &str) -> Result<i64, Error> {
    if let Ok(epoch) = raw.parse::<i64>() {
        return Ok(epoch);
    }
    let age = common::policy::parse_duration(raw)?;
    Ok(epoch_now() - age.as_secs() as i64)
}

struct Session {
    catalog: SharedCatalog,
    manager: Arc<RemoteManager>,
    options: Arc<Options>,
    token: CancellationToken,
    _lock: OperationLock,
}

fn open_session(cli: &Cli, options: Options) -> Result<Session, Error> {
    let catalog_dir = cli
        .db
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| std::path::Path::new("."))
        .to_path_buf();
    std::fs::create_dir_all(&catalog_dir)?;
    let lock = OperationLock::acquire(&catalog_dir)?;

    let catalog = Catalog::create_or_open(&cli.db, &options)?;
    let config = {
        let (blocksize, block_hash, file_hash) = catalog.stored_block_config()?;
        BlockConfig {
            blocksize,
            block_hash,
            file_hash,
        }
    };
    let catalog: SharedCatalog = Arc::new(Mutex::new(catalog));

    let backend = Arc::new(FileBackend::new(cli.destination.clone()));
    let manager = Arc::new(RemoteManager::new(
        backend,
        Arc::new(PassthroughEncryptor),
        config,
        &options,
    ));

    let token = CancellationToken::new();
    let ctrl_c = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("cancellation requested");
            ctrl_c.cancel();
        }
    });

    Ok(Session {
        catalog,
        manager,
        options: Arc::new(options),
        token,
        _lock: lock,
    })
}

async fn dispatch(cli: Cli) -> Result<i32, Error> {
    let mut options = build_options(&cli)?;

    match &cli.command {
        Commands::Backup {
            sources,
            exclude,
            keep_versions,
            keep_time,
            retention_policy,
            skip_files_larger_than,
        } => {
            for pattern in exclude {
                options.filters.push(common::FilterRule::exclude(pattern)?);
            }
            options.keep_versions = *keep_versions;
            options.keep_time = keep_time
                .as_deref()
                .map(common::policy::parse_duration)
                .transpose()?;
            options.retention_policy = retention_policy
                .as_deref()
                .map(RetentionPolicy::parse)
                .transpose()?;
            options.skip_files_larger_than = *skip_files_larger_than;

            let session = open_session(&cli, options)?;
            let report = backup::run_backup(
                sources.clone(),
                session.options.clone(),
                session.catalog.clone(),
                session.manager.clone(),
                session.token.clone(),
            )
            .await?;
            info!(
                fileset = report.fileset.0,
                examined = report.stats.examined_files,
                added = report.stats.added_files,
                inherited = report.stats.inherited_files,
                uploaded_volumes = report.stats.uploaded_volumes,
                uploaded_bytes = report.stats.uploaded_bytes,
                partial = report.interrupted,
                "backup finished"
            );
            for warning in &report.stats.warnings {
                warn!(%warning);
            }
            Ok(report.exit_code())
        }

        Commands::Restore {
            paths,
            target,
            version,
            time,
            overwrite,
            legacy,
            use_local_blocks,
            verify,
        } => {
            options.overwrite = *overwrite;
            options.restore_legacy = *legacy;
            options.use_local_blocks = *use_local_blocks;
            options.perform_restored_file_verification = *verify;

            let selection = match (version, time) {
                (Some(version), _) => restore::RestoreSelection::Version(*version),
                (None, Some(time)) => {
                    restore::RestoreSelection::Time(parse_point_in_time(time)?)
                }
                (None, None) => restore::RestoreSelection::Latest,
            };
            let session = open_session(&cli, options)?;
            let report = restore::run_restore(
                paths.clone(),
                target.clone(),
                selection,
                session.options.clone(),
                session.catalog.clone(),
                session.manager.clone(),
                session.token.clone(),
            )
            .await?;
            info!(
                restored = report.restored_files,
                verified = report.verified_files,
                reused_blocks = report.reused_blocks,
                broken = report.broken_files.len(),
                "restore finished"
            );
            for broken in &report.broken_files {
                error!(%broken, "file could not be fully restored");
            }
            Ok(report.exit_code())
        }

        Commands::Delete {
            version,
            older_than,
            retention_policy,
        } => {
            if let Some(policy) = retention_policy {
                options.retention_policy = Some(RetentionPolicy::parse(policy)?);
            }
            let selection = if !version.is_empty() {
                compact::DeleteSelection::Versions(version.clone())
            } else if let Some(age) = older_than {
                compact::DeleteSelection::OlderThan(common::policy::parse_duration(age)?)
            } else if options.retention_policy.is_some() {
                compact::DeleteSelection::Policy
            } else {
                return Err(Error::user(
                    "delete needs --version, --older-than or --retention-policy",
                ));
            };
            let session = open_session(&cli, options)?;
            let dropped = compact::run_delete(
                &session.catalog,
                &session.manager,
                &session.options,
                selection,
            )
            .await?;
            info!(dropped, "delete finished");
            Ok(0)
        }

        Commands::Compact { force, threshold } => {
            if let Some(threshold) = threshold {
                options.threshold = *threshold;
            }
            let session = open_session(&cli, options)?;
            let report = compact::run_compaction(
                &session.catalog,
                &session.manager,
                &session.options,
                session.token.clone(),
                *force,
            )
            .await?;
            info!(
                triggered = report.triggered,
                rewritten = report.rewritten_volumes,
                deleted = report.deleted_volumes,
                reclaimed_bytes = report.reclaimed_bytes,
                "compact finished"
            );
            Ok(0)
        }

        Commands::Test { samples } => {
            let session = open_session(&cli, options)?;
            let report = repair::run_test(
                *samples,
                session.options.clone(),
                session.catalog.clone(),
                session.manager.clone(),
                session.token.clone(),
            )
            .await?;
            for issue in &report.issues {
                error!(%issue);
            }
            info!(examined = report.examined, "test finished");
            Ok(report.exit_code())
        }

        Commands::Repair => {
            let session = open_session(&cli, options)?;
            let report = repair::run_repair(
                session.options.clone(),
                session.catalog.clone(),
                session.manager.clone(),
                session.token.clone(),
            )
            .await?;
            for warning in &report.warnings {
                warn!(%warning);
            }
            info!(
                filesets = report.filesets_rebuilt,
                volumes = report.volumes_registered,
                partial = report.partial,
                "repair finished"
            );
            Ok(if report.partial { 1 } else { 0 })
        }

        Commands::List { version, filter } => {
            let session = open_session(&cli, options)?;
            let guard = session.catalog.lock().await;
            match version {
                None => {
                    for (index, fileset) in guard.list_filesets()?.iter().enumerate() {
                        println!(
                            "{index:>4}  {}  {}",
                            fileset.timestamp,
                            if fileset.is_full { "full" } else { "partial" }
                        );
                    }
                }
                Some(version) => {
                    let fileset = guard.fileset_by_version(*version)?;
                    for file in guard.files_in_fileset(fileset.id)? {
                        if let Some(filter) = filter {
                            if !file.path.contains(filter.as_str()) {
                                continue;
                            }
                        }
                        println!("{}", file.path);
                    }
                }
            }
            Ok(0)
        }

        Commands::ListBroken { filter } => {
            let session = open_session(&cli, options)?;
            let broken = repair::list_broken(
                &session.catalog,
                &session.manager,
                filter.as_deref(),
            )
            .await?;
            for entry in &broken {
                println!(
                    "{}  {}  (lost: {})",
                    entry.fileset_timestamp, entry.path, entry.missing_volume
                );
            }
            Ok(if broken.is_empty() { 0 } else { 1 })
        }

        Commands::PurgeBrokenFiles => {
            let session = open_session(&cli, options)?;
            let purged = repair::purge_broken_files(
                &session.catalog,
                &session.manager,
                &session.options,
            )
            .await?;
            info!(purged, "purge-broken-files finished");
            Ok(0)
        }

        Commands::ListAffected { targets } => {
            let session = open_session(&cli, options)?;
            let affected = repair::list_affected(&session.catalog, targets).await?;
            for entry in &affected {
                println!("{}  {}  ({})", entry.fileset_timestamp, entry.path, entry.missing_volume);
            }
            Ok(0)
        }

        Commands::Compare { current, previous } => {
            let session = open_session(&cli, options)?;
            let guard = session.catalog.lock().await;
            let current = guard.fileset_by_version(*current)?;
            let previous = guard.fileset_by_version(*previous)?;
            let stats = guard.change_statistics(current.id, previous.id)?;
            println!(
                "added: {} files, {} folders, {} symlinks",
                stats.added_files, stats.added_folders, stats.added_symlinks
            );
            println!(
                "modified: {} files, {} folders, {} symlinks",
                stats.modified_files, stats.modified_folders, stats.modified_symlinks
            );
            println!(
                "deleted: {} files, {} folders, {} symlinks",
                stats.deleted_files, stats.deleted_folders, stats.deleted_symlinks
            );
            Ok(0)
        }
    }
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            error!(%err, "operation failed");
            err.exit_code()
        }
    };
    std::process::exit(code);
}
