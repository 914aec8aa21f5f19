//! Command dispatch.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::cli::{Cli, Commands, EventsArgs, GroupsArgs, KeepArgs, ScanArgs};
use crate::config::Config;
use crate::duplicates::{Comparator, FinderConfig, ScanSummary, ShareScanner};
use crate::error::ExitCode;
use crate::events::{
    CancellationRegistry, ChangeEvent, EventPipeline, EventQueue, OrderingKey, PipelineConfig,
};
use crate::hasher::{hash_to_hex, HashPool};
use crate::logging::init_logging;
use crate::output::export_groups;
use crate::progress::Progress;
use crate::scanner::FileId;
use crate::signal::{install_handler, ShutdownHandler};
use crate::store::{MetadataRepository, SqliteRepository};

/// Run the parsed command line.
///
/// # Errors
///
/// Returns any error that stops the command. An interrupted scan surfaces
/// as [`FinderError::Interrupted`](crate::duplicates::FinderError::Interrupted).
pub fn run_app(cli: Cli) -> Result<ExitCode> {
    if cli.no_color {
        std::env::set_var("NO_COLOR", "1");
    }
    init_logging(cli.verbose, cli.quiet);

    let mut config = Config::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(database) = &cli.database {
        config.database_path = Some(database.clone());
    }
    let db_path = config.database_path()?;
    let repo: Arc<dyn MetadataRepository> = Arc::new(
        SqliteRepository::open(&db_path)
            .with_context(|| format!("opening database {}", db_path.display()))?,
    );
    log::debug!("Using database {}", db_path.display());

    match cli.command {
        Commands::Scan(args) => run_scan(config, args, repo, cli.quiet),
        Commands::Events(args) => run_events(config, &args, repo),
        Commands::Groups(args) => run_groups(repo.as_ref(), &args),
        Commands::Keep(args) => run_keep(repo.as_ref(), &args),
    }
}

fn hash_pool(workers: usize) -> Result<Arc<HashPool>> {
    let size = if workers == 0 {
        HashPool::default_size()
    } else {
        workers
    };
    Ok(Arc::new(HashPool::new(size).context("starting hash workers")?))
}

fn run_scan(
    mut config: Config,
    args: ScanArgs,
    repo: Arc<dyn MetadataRepository>,
    quiet: bool,
) -> Result<ExitCode> {
    config.shares.extend(args.shares);
    if let Some(chunk_size) = args.chunk_size {
        config.chunk_size = chunk_size;
    }
    if let Some(io_threads) = args.io_threads {
        config.io_threads = io_threads;
    }
    if let Some(workers) = args.hash_workers {
        config.hash_workers = workers;
    }
    config.ignore_patterns.extend(args.ignore_patterns);
    config.follow_symlinks |= args.follow_symlinks;
    config.skip_hidden |= args.skip_hidden;

    let shutdown = install_handler()?;
    let comparator = Arc::new(Comparator::new(
        hash_pool(config.hash_workers)?,
        Arc::new(CancellationRegistry::new()),
        config.comparator_config(),
    )?);

    let finder_config = FinderConfig::default()
        .with_walker_config(config.walker_config())
        .with_parallel_groups(config.parallel_groups)
        .with_retry(config.retry_policy())
        .with_shutdown_flag(shutdown.get_flag())
        .with_progress_callback(Arc::new(Progress::new(quiet)));

    let scanner = ShareScanner::new(comparator, repo, config.share_map(), finder_config);
    let summary = scanner.scan()?;
    if !quiet {
        print_summary(&summary);
    }
    Ok(ExitCode::for_scan(&summary))
}

fn print_summary(summary: &ScanSummary) {
    println!(
        "Scanned {} files ({}) in {:.1?}",
        summary.total_files,
        summary.total_size_display(),
        summary.scan_duration
    );
    println!(
        "  {} unique by size, {} empty, {} hardlink names merged",
        summary.eliminated_by_size, summary.empty_files, summary.hardlinks_merged
    );
    println!(
        "  {} groups compared in {} rounds ({} read)",
        summary.compared_groups,
        summary.rounds,
        bytesize::ByteSize::b(summary.bytes_compared)
    );
    println!(
        "  {} duplicate groups, {} redundant copies, {} reclaimable",
        summary.duplicate_groups,
        summary.duplicate_files,
        summary.reclaimable_display()
    );
    if summary.is_partial() {
        println!(
            "  {} walk errors, {} unreadable files, {} unsaved records",
            summary.scan_errors.len(),
            summary.failed_files,
            summary.persist_failures
        );
    }
}

/// One input line: a change event plus an optional inode to order by.
#[derive(Debug, Deserialize)]
struct EventLine {
    #[serde(flatten)]
    event: ChangeEvent,
    #[serde(default)]
    ino: Option<u64>,
}

impl EventLine {
    fn key(&self) -> OrderingKey {
        match self.ino {
            Some(ino) => OrderingKey::File(FileId(ino)),
            None => self.event.ordering_key(),
        }
    }
}

fn run_events(
    mut config: Config,
    args: &EventsArgs,
    repo: Arc<dyn MetadataRepository>,
) -> Result<ExitCode> {
    if let Some(partitions) = args.partitions {
        config.queue_partitions = partitions;
    }
    if let Some(workers) = args.hash_workers {
        config.hash_workers = workers;
    }

    let shutdown = install_handler()?;
    let registry = Arc::new(CancellationRegistry::new());
    let comparator = Arc::new(Comparator::new(
        hash_pool(config.hash_workers)?,
        Arc::clone(&registry),
        config.comparator_config(),
    )?);
    let pipeline = Arc::new(EventPipeline::new(
        repo,
        comparator,
        registry,
        PipelineConfig {
            shares: config.share_map(),
            retry: config.retry_policy(),
        },
    ));
    let queue = EventQueue::start(pipeline, config.queue_config())?;

    let reader: Box<dyn BufRead> = match &args.input {
        Some(path) => Box::new(BufReader::new(
            File::open(path).with_context(|| format!("opening {}", path.display()))?,
        )),
        None => Box::new(BufReader::new(io::stdin())),
    };
    let malformed = feed_events(reader, &queue, &shutdown)?;

    queue.wait_idle();
    let stats = queue.stats();
    log::info!(
        "Events: {} submitted, {} delivered, {} redelivered, {} dropped, {} malformed",
        stats.submitted,
        stats.delivered,
        stats.redelivered,
        stats.abandoned,
        malformed
    );

    if shutdown.is_shutdown_requested() {
        return Ok(ExitCode::Interrupted);
    }
    if stats.abandoned > 0 || malformed > 0 {
        Ok(ExitCode::PartialSuccess)
    } else {
        Ok(ExitCode::Success)
    }
}

/// Push every well-formed line onto the queue; returns the malformed count.
fn feed_events(
    reader: impl BufRead,
    queue: &EventQueue,
    shutdown: &ShutdownHandler,
) -> Result<usize> {
    let mut malformed = 0;
    for (number, line) in reader.lines().enumerate() {
        if shutdown.is_shutdown_requested() {
            log::warn!("Stopping event intake after {} lines", number);
            break;
        }
        let line = line.context("reading events")?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<EventLine>(&line) {
            Ok(parsed) => {
                let key = parsed.key();
                queue.push_keyed(&key, parsed.event)?;
            }
            Err(e) => {
                log::warn!("Line {}: malformed event: {}", number + 1, e);
                malformed += 1;
            }
        }
    }
    Ok(malformed)
}

fn run_groups(repo: &dyn MetadataRepository, args: &GroupsArgs) -> Result<ExitCode> {
    let export = export_groups(repo)?;
    export.write_to(&mut io::stdout().lock(), args.pretty)?;
    if export.total_groups == 0 {
        Ok(ExitCode::NoDuplicates)
    } else {
        Ok(ExitCode::Success)
    }
}

fn run_keep(repo: &dyn MetadataRepository, args: &KeepArgs) -> Result<ExitCode> {
    let path = std::path::absolute(&args.path)
        .with_context(|| format!("resolving {}", args.path.display()))?;
    designate_keep_path(repo, &path)?;
    Ok(ExitCode::Success)
}

fn designate_keep_path(repo: &dyn MetadataRepository, path: &Path) -> Result<()> {
    let Some(record) = repo.find_by_path(path)? else {
        bail!("{} is not tracked", path.display());
    };
    let Some(hash) = record.hash else {
        bail!("{} has no confirmed content hash yet", path.display());
    };
    repo.designate_keep(&hash, record.id)?;
    log::info!("Keeping {} ({}) for {}", path.display(), record.id, hash_to_hex(&hash));
    Ok(())
}
