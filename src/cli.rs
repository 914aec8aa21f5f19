//! Command-line interface.
//!
//! ```bash
//! # Full scan of two shares with small read chunks
//! dupewatch scan --share media=/mnt/user/media --share tv=/mnt/user/tv --chunk-size 256KiB
//!
//! # Feed change events (NDJSON) from a watcher
//! inotify-bridge | dupewatch events
//!
//! # Inspect confirmed duplicate groups
//! dupewatch groups --pretty
//! ```

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Incremental duplicate detection for NAS shares.
///
/// Keeps a database of file identities and content digests up to date from
/// full scans and from a stream of filesystem change events.
#[derive(Debug, Parser)]
#[command(name = "dupewatch")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Increase verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only print errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Disable colored output
    #[arg(long, global = true, env = "NO_COLOR")]
    pub no_color: bool,

    /// Configuration file layered over the platform one
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Database file (overrides `database_path`)
    #[arg(long, global = true, value_name = "FILE")]
    pub database: Option<PathBuf>,

    /// Print errors as JSON on stderr
    #[arg(long, global = true)]
    pub json_errors: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Walk the shares and rebuild duplicate information from scratch
    Scan(ScanArgs),
    /// Apply change events read as NDJSON
    Events(EventsArgs),
    /// Print confirmed duplicate groups as JSON
    Groups(GroupsArgs),
    /// Mark a file as the copy to keep within its duplicate group
    Keep(KeepArgs),
}

/// Arguments for `scan`.
#[derive(Debug, Args)]
pub struct ScanArgs {
    /// Share to scan, in addition to configured ones
    #[arg(long = "share", value_name = "NAME=PATH", value_parser = parse_share)]
    pub shares: Vec<(String, PathBuf)>,

    /// Bytes read per file per comparison round (e.g. 1MiB)
    #[arg(long, value_name = "SIZE", value_parser = parse_size)]
    pub chunk_size: Option<usize>,

    /// Concurrent chunk reads per comparison
    #[arg(long, value_name = "N")]
    pub io_threads: Option<usize>,

    /// Hash worker threads
    #[arg(long, value_name = "N")]
    pub hash_workers: Option<usize>,

    /// Gitignore-style pattern to exclude (repeatable)
    #[arg(short, long = "ignore", value_name = "PATTERN")]
    pub ignore_patterns: Vec<String>,

    /// Follow symbolic links
    #[arg(long)]
    pub follow_symlinks: bool,

    /// Skip hidden files and directories
    #[arg(long)]
    pub skip_hidden: bool,
}

/// Arguments for `events`.
#[derive(Debug, Args)]
pub struct EventsArgs {
    /// NDJSON file to read; stdin when omitted
    #[arg(long, value_name = "FILE")]
    pub input: Option<PathBuf>,

    /// Queue partitions
    #[arg(long, value_name = "N")]
    pub partitions: Option<usize>,

    /// Hash worker threads
    #[arg(long, value_name = "N")]
    pub hash_workers: Option<usize>,
}

/// Arguments for `groups`.
#[derive(Debug, Args)]
pub struct GroupsArgs {
    /// Indent the JSON
    #[arg(long)]
    pub pretty: bool,
}

/// Arguments for `keep`.
#[derive(Debug, Args)]
pub struct KeepArgs {
    /// Path of the copy to keep
    #[arg(value_name = "PATH")]
    pub path: PathBuf,
}

/// Parse `NAME=PATH`.
///
/// ```
/// use dupewatch::cli::parse_share;
///
/// let (name, root) = parse_share("media=/mnt/user/media").unwrap();
/// assert_eq!(name, "media");
/// assert_eq!(root, std::path::PathBuf::from("/mnt/user/media"));
/// assert!(parse_share("media").is_err());
/// ```
///
/// # Errors
///
/// Returns an error if the `=` is missing, the name is empty, or the path is
/// not absolute.
pub fn parse_share(s: &str) -> Result<(String, PathBuf), String> {
    let (name, root) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=PATH, got '{s}'"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err("share name cannot be empty".to_string());
    }
    let root = PathBuf::from(root.trim());
    if !root.is_absolute() {
        return Err(format!("share root must be absolute: '{}'", root.display()));
    }
    Ok((name.to_string(), root))
}

/// Parse a byte count with an optional unit.
///
/// Decimal (`KB`, `MB`, `GB`) and binary (`KiB`, `MiB`, `GiB`) units are
/// accepted, case-insensitively. Zero is rejected.
///
/// ```
/// use dupewatch::cli::parse_size;
///
/// assert_eq!(parse_size("4096").unwrap(), 4096);
/// assert_eq!(parse_size("64KiB").unwrap(), 65_536);
/// assert_eq!(parse_size("1MB").unwrap(), 1_000_000);
/// assert_eq!(parse_size("1.5 MiB").unwrap(), 1_572_864);
/// ```
///
/// # Errors
///
/// Returns an error for an empty or zero size, a malformed number, or an
/// unknown unit.
pub fn parse_size(s: &str) -> Result<usize, String> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(s.len());
    let (number, unit) = s.split_at(split);
    if number.is_empty() {
        return Err(format!("missing number in '{s}'"));
    }

    let multiplier: u64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" => 1_000,
        "kib" => 1 << 10,
        "m" | "mb" => 1_000_000,
        "mib" => 1 << 20,
        "g" | "gb" => 1_000_000_000,
        "gib" => 1 << 30,
        other => return Err(format!("unknown size unit '{other}'")),
    };

    let bytes = if let Ok(whole) = number.parse::<u64>() {
        whole
            .checked_mul(multiplier)
            .ok_or_else(|| format!("size too large: '{s}'"))?
    } else {
        let value: f64 = number
            .parse()
            .map_err(|_| format!("invalid number '{number}'"))?;
        (value * multiplier as f64) as u64
    };

    match usize::try_from(bytes) {
        Ok(0) => Err("size must be greater than zero".to_string()),
        Ok(bytes) => Ok(bytes),
        Err(_) => Err(format!("size too large: '{s}'")),
    }
}
