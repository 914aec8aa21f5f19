//! dupewatch: incremental duplicate detection for NAS shares.
//!
//! Files are tracked by inode identity, so hardlinked names collapse into
//! one record. Candidates are narrowed by size and then compared chunk by
//! chunk through a pool of BLAKE3 hash workers, stopping as soon as the
//! contents diverge. A full scan builds the database; afterwards a stream of
//! change events keeps it current.
//!
//! # Layout
//!
//! - [`scanner`]: share walking and file identity
//! - [`hasher`]: digests and the hash worker pool
//! - [`duplicates`]: size bucketing, chunked comparison, full share scans
//! - [`events`]: change events, the event queue and the update pipeline
//! - [`store`]: the metadata repository
//! - [`output`]: JSON export of duplicate groups

pub mod app;
pub mod cli;
pub mod config;
pub mod duplicates;
pub mod error;
pub mod events;
pub mod hasher;
pub mod logging;
pub mod output;
pub mod progress;
pub mod scanner;
pub mod shares;
pub mod signal;
pub mod store;

pub use app::run_app;
