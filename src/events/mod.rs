//! Filesystem change events and their processing.
//!
//! # Overview
//!
//! Changes arrive as discrete [`ChangeEvent`]s. The [`queue`] delivers them
//! with per-key ordering and at-least-once redelivery to an
//! [`EventHandler`]; the [`pipeline`] is the handler that keeps the metadata
//! store consistent with the filesystem. Removals publish signals on the
//! [`cancel`] registry so in-flight comparisons can drop vanished files.
//!
//! Events serialize as tagged JSON, one object per line:
//!
//! ```
//! use dupewatch::events::ChangeEvent;
//!
//! let event: ChangeEvent =
//!     serde_json::from_str(r#"{"kind":"rename","from":"/mnt/user/a/x","to":"/mnt/user/a/y"}"#)
//!         .unwrap();
//! assert!(matches!(event, ChangeEvent::Rename { .. }));
//! ```

pub mod cancel;
pub mod pipeline;
pub mod queue;

use std::hash::{Hash as _, Hasher as _};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub use cancel::{CancelKey, CancellationRegistry, Subscription};
pub use pipeline::{EventOutcome, EventPipeline, PipelineConfig, PipelineError, SkipReason};
pub use queue::{EventQueue, QueueConfig, QueueError, QueueStats};

use crate::scanner::FileId;

/// One observed filesystem change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ChangeEvent {
    /// A file was created or its content changed
    Upsert {
        /// Absolute path of the file
        path: PathBuf,
    },
    /// A file name was removed
    Remove {
        /// Absolute path that no longer exists
        path: PathBuf,
    },
    /// A file name was renamed
    Rename {
        /// Previous absolute path
        from: PathBuf,
        /// New absolute path
        to: PathBuf,
    },
}

impl ChangeEvent {
    /// The path the event is about; for a rename, the old path.
    #[must_use]
    pub fn primary_path(&self) -> &Path {
        match self {
            Self::Upsert { path } | Self::Remove { path } => path,
            Self::Rename { from, .. } => from,
        }
    }

    /// Default ordering key: the primary path.
    #[must_use]
    pub fn ordering_key(&self) -> OrderingKey {
        OrderingKey::Path(self.primary_path().to_path_buf())
    }

    /// Short name of the event kind, for logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Upsert { .. } => "upsert",
            Self::Remove { .. } => "remove",
            Self::Rename { .. } => "rename",
        }
    }
}

impl std::fmt::Display for ChangeEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Upsert { path } => write!(f, "upsert {}", path.display()),
            Self::Remove { path } => write!(f, "remove {}", path.display()),
            Self::Rename { from, to } => write!(f, "rename {} -> {}", from.display(), to.display()),
        }
    }
}

/// Key deciding which consumer handles an event.
///
/// Events sharing a key are handled one at a time in submission order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OrderingKey {
    /// Order by file name
    Path(PathBuf),
    /// Order by identity
    File(FileId),
}

impl OrderingKey {
    /// Partition index in `0..partitions` for this key.
    #[must_use]
    pub fn partition(&self, partitions: usize) -> usize {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.hash(&mut hasher);
        (hasher.finish() % partitions.max(1) as u64) as usize
    }
}

/// Something that processes change events.
pub trait EventHandler: Send + Sync {
    /// Handle one event.
    ///
    /// # Errors
    ///
    /// A [`PipelineError`] for which [`PipelineError::is_retryable`] holds
    /// asks the queue to deliver the event again.
    fn handle(&self, event: &ChangeEvent) -> Result<EventOutcome, PipelineError>;
}
