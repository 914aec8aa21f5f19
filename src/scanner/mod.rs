//! Share traversal and file identity.
//!
//! [`walker`] finds regular files under a share root; [`identity`] turns
//! their metadata into a [`FileStat`] keyed by inode.
//!
//! ```no_run
//! use dupewatch::scanner::{Walker, WalkerConfig};
//! use std::path::Path;
//!
//! let walker = Walker::new(Path::new("/mnt/user/media"), WalkerConfig::default());
//! for entry in walker.walk() {
//!     match entry {
//!         Ok(file) => println!("{}: {} bytes", file.path.display(), file.stat.size),
//!         Err(e) => eprintln!("Warning: {}", e),
//!     }
//! }
//! ```

pub mod identity;
pub mod walker;

use std::path::PathBuf;

pub use identity::{FileId, FileStat};
pub use walker::{ShareWalk, Walker, IGNORE_FILE_NAME};

/// A regular file discovered under a share root.
#[derive(Debug, Clone)]
pub struct ScannedFile {
    /// Absolute path to the file
    pub path: PathBuf,
    /// Attributes captured when the file was visited
    pub stat: FileStat,
}

/// Walk options shared by every share root.
#[derive(Debug, Clone, Default)]
pub struct WalkerConfig {
    /// Report symlinked files under their link path
    pub follow_symlinks: bool,

    /// Skip dot-files and dot-directories
    pub skip_hidden: bool,

    /// Gitignore-style patterns, added to the root's `.dupewatchignore`
    pub ignore_patterns: Vec<String>,
}

impl WalkerConfig {
    /// Set whether symlinks are followed.
    #[must_use]
    pub fn with_follow_symlinks(mut self, follow: bool) -> Self {
        self.follow_symlinks = follow;
        self
    }

    /// Set whether hidden entries are skipped.
    #[must_use]
    pub fn with_skip_hidden(mut self, skip: bool) -> Self {
        self.skip_hidden = skip;
        self
    }

    /// Set the ignore patterns.
    #[must_use]
    pub fn with_ignore_patterns(mut self, patterns: Vec<String>) -> Self {
        self.ignore_patterns = patterns;
        self
    }
}

/// Errors that can occur during directory scanning.
#[derive(thiserror::Error, Debug)]
pub enum ScanError {
    /// Permission was denied when accessing a file or directory.
    #[error("Permission denied: {0}")]
    PermissionDenied(PathBuf),

    /// The specified path was not found.
    #[error("Path not found: {0}")]
    NotFound(PathBuf),

    /// The specified path is not a directory.
    #[error("Not a directory: {0}")]
    NotADirectory(PathBuf),

    /// An I/O error occurred while accessing a file.
    #[error("I/O error for {path}: {source}")]
    Io {
        /// Path where the error occurred
        path: PathBuf,
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
    },
}

impl ScanError {
    /// Classify an I/O error for a path.
    #[must_use]
    pub fn from_io(path: PathBuf, error: std::io::Error) -> Self {
        match error.kind() {
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied(path),
            std::io::ErrorKind::NotFound => Self::NotFound(path),
            _ => Self::Io {
                path,
                source: error,
            },
        }
    }
}
