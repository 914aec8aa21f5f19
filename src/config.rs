//! Layered application configuration.
//!
//! Sources, lowest priority first:
//!
//! 1. [`Config::default`]
//! 2. `config.toml` in the platform config directory
//! 3. the file passed with `--config`
//! 4. `DUPEWATCH_*` environment variables (`__` separates nested keys)
//!
//! CLI flags are applied on top by the caller.
//!
//! ```toml
//! database_path = "/mnt/cache/appdata/dupewatch/files.db"
//! chunk_size = 1048576
//! ignore_patterns = ["*.tmp", ".Recycle.Bin/"]
//!
//! [shares]
//! media = "/mnt/user/media"
//! backups = "/mnt/user/backups"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::duplicates::{ComparatorConfig, DEFAULT_CHUNK_SIZE, DEFAULT_IO_THREADS};
use crate::events::QueueConfig;
use crate::scanner::WalkerConfig;
use crate::shares::{ShareMap, DEFAULT_SHARE_BASE};
use crate::store::RetryPolicy;

/// Prefix of configuration environment variables.
pub const ENV_PREFIX: &str = "DUPEWATCH_";

/// Configuration errors.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// A source could not be read or has the wrong shape.
    #[error("invalid configuration: {0}")]
    Invalid(#[from] Box<figment::Error>),

    /// No config directory and no `--database` given.
    #[error("cannot determine a database location; pass --database or set database_path")]
    NoDatabasePath,

    /// A value is out of range.
    #[error("invalid value for {key}: {reason}")]
    Value {
        /// Offending key
        key: &'static str,
        /// What is wrong with it
        reason: String,
    },
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Invalid(Box::new(err))
    }
}

/// Application configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SQLite database file; defaults to the platform data directory
    pub database_path: Option<PathBuf>,
    /// Configured shares, name to root directory
    pub shares: BTreeMap<String, PathBuf>,
    /// Directory whose children are shares when no root matches
    pub share_base: Option<PathBuf>,
    /// Bytes read per file per comparison round
    pub chunk_size: usize,
    /// Hash workers; 0 picks one less than the CPU count
    pub hash_workers: usize,
    /// Concurrent chunk reads per comparison
    pub io_threads: usize,
    /// Size groups compared side by side during a scan
    pub parallel_groups: usize,
    /// Event queue partitions
    pub queue_partitions: usize,
    /// Deliveries per event before it is dropped
    pub max_delivery_attempts: u32,
    /// Pause before redelivering an event
    pub redelivery_backoff_ms: u64,
    /// Attempts per repository write
    pub store_retry_attempts: u32,
    /// Pause between repository write attempts
    pub store_retry_backoff_ms: u64,
    /// Follow symbolic links while walking
    pub follow_symlinks: bool,
    /// Skip dot-files and dot-directories
    pub skip_hidden: bool,
    /// Gitignore-style patterns excluded from scans
    pub ignore_patterns: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        let queue = QueueConfig::default();
        let retry = RetryPolicy::default();
        Self {
            database_path: None,
            shares: BTreeMap::new(),
            share_base: Some(PathBuf::from(DEFAULT_SHARE_BASE)),
            chunk_size: DEFAULT_CHUNK_SIZE,
            hash_workers: 0,
            io_threads: DEFAULT_IO_THREADS,
            parallel_groups: 2,
            queue_partitions: queue.partitions,
            max_delivery_attempts: queue.max_delivery_attempts,
            redelivery_backoff_ms: millis(queue.redelivery_backoff),
            store_retry_attempts: retry.attempts,
            store_retry_backoff_ms: millis(retry.backoff),
            follow_symlinks: false,
            skip_hidden: false,
            ignore_patterns: Vec::new(),
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl Config {
    /// Load from every source.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a source is malformed or a value is out of
    /// range.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let config: Self = Self::figment(Self::default_path().as_deref(), explicit).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// The provider stack without the platform lookup.
    #[must_use]
    pub fn figment(platform: Option<&Path>, explicit: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(path) = platform {
            figment = figment.merge(Toml::file(path));
        }
        if let Some(path) = explicit {
            log::debug!("Using config file {}", path.display());
            figment = figment.merge(Toml::file_exact(path));
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Platform config file location.
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        project_dirs().map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Where the database lives.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NoDatabasePath`] if neither the config nor the
    /// platform provides a location.
    pub fn database_path(&self) -> Result<PathBuf, ConfigError> {
        if let Some(path) = &self.database_path {
            return Ok(path.clone());
        }
        project_dirs()
            .map(|dirs| dirs.data_dir().join("dupewatch.db"))
            .ok_or(ConfigError::NoDatabasePath)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::Value {
                key: "chunk_size",
                reason: "must be at least 1 byte".to_string(),
            });
        }
        if self.max_delivery_attempts == 0 {
            return Err(ConfigError::Value {
                key: "max_delivery_attempts",
                reason: "must be at least 1".to_string(),
            });
        }
        if let Some((name, root)) = self.shares.iter().find(|(_, root)| !root.is_absolute()) {
            return Err(ConfigError::Value {
                key: "shares",
                reason: format!("root of '{}' is not absolute: {}", name, root.display()),
            });
        }
        Ok(())
    }

    /// Configured shares as a [`ShareMap`].
    #[must_use]
    pub fn share_map(&self) -> ShareMap {
        ShareMap::new(self.shares.clone(), self.share_base.clone())
    }

    /// Walker settings.
    #[must_use]
    pub fn walker_config(&self) -> WalkerConfig {
        WalkerConfig::default()
            .with_follow_symlinks(self.follow_symlinks)
            .with_skip_hidden(self.skip_hidden)
            .with_ignore_patterns(self.ignore_patterns.clone())
    }

    /// Comparator settings.
    #[must_use]
    pub fn comparator_config(&self) -> ComparatorConfig {
        ComparatorConfig::default()
            .with_chunk_size(self.chunk_size)
            .with_io_threads(self.io_threads)
    }

    /// Event queue settings.
    #[must_use]
    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            partitions: self.queue_partitions.max(1),
            max_delivery_attempts: self.max_delivery_attempts,
            redelivery_backoff: Duration::from_millis(self.redelivery_backoff_ms),
        }
    }

    /// Repository write retry policy.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.store_retry_attempts.max(1),
            backoff: Duration::from_millis(self.store_retry_backoff_ms),
        }
    }
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", "dupewatch")
}
