//! Share-root walker on top of jwalk.
//!
//! Every regular file under the root is reported with a [`FileStat`].
//! Hardlinked names are all reported; the size buckets merge them by
//! identity later.
//!
//! Ignore rules use gitignore syntax and come from the configured patterns
//! plus an optional [`IGNORE_FILE_NAME`] file at the share root. They are
//! applied while each directory is read, so ignored directories are never
//! descended into.
//!
//! ```no_run
//! use dupewatch::scanner::{Walker, WalkerConfig};
//! use std::path::Path;
//!
//! let config = WalkerConfig::default()
//!     .with_skip_hidden(true)
//!     .with_ignore_patterns(vec![".Recycle.Bin/".into()]);
//! let walker = Walker::new(Path::new("/mnt/user/photos"), config);
//! let files = walker.walk().filter_map(Result::ok).count();
//! println!("{files} files");
//! ```

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ignore::gitignore::{Gitignore, GitignoreBuilder};
use jwalk::{DirEntryIter, WalkDir};

use super::{FileStat, ScanError, ScannedFile, WalkerConfig};

/// Per-share ignore file read from the share root.
pub const IGNORE_FILE_NAME: &str = ".dupewatchignore";

/// Walks one share root.
#[derive(Debug)]
pub struct Walker {
    root: PathBuf,
    config: WalkerConfig,
    shutdown_flag: Option<Arc<AtomicBool>>,
}

impl Walker {
    /// Walker for `root`.
    #[must_use]
    pub fn new(root: &Path, config: WalkerConfig) -> Self {
        Self {
            root: root.to_path_buf(),
            config,
            shutdown_flag: None,
        }
    }

    /// Stop yielding entries once `flag` is set.
    #[must_use]
    pub fn with_shutdown_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.shutdown_flag = Some(flag);
        self
    }

    fn matcher(&self) -> Option<Arc<Gitignore>> {
        let mut builder = GitignoreBuilder::new(&self.root);

        let file = self.root.join(IGNORE_FILE_NAME);
        if file.is_file() {
            match builder.add(&file) {
                Some(e) => log::warn!("Ignoring bad {}: {}", file.display(), e),
                None => log::debug!("Loaded ignore rules from {}", file.display()),
            }
        }
        for pattern in &self.config.ignore_patterns {
            if let Err(e) = builder.add_line(None, pattern) {
                log::warn!("Invalid ignore pattern '{}': {}", pattern, e);
            }
        }

        match builder.build() {
            Ok(gitignore) if gitignore.is_empty() => None,
            Ok(gitignore) => Some(Arc::new(gitignore)),
            Err(e) => {
                log::warn!("Cannot build ignore rules for {}: {}", self.root.display(), e);
                None
            }
        }
    }

    /// Iterate over the regular files below the root.
    ///
    /// Errors are yielded in place and do not end the walk. A root that does
    /// not exist, or is not a directory, yields a single error.
    pub fn walk(&self) -> ShareWalk<'_> {
        let root_error = if !self.root.exists() {
            Some(ScanError::NotFound(self.root.clone()))
        } else if !self.root.is_dir() {
            Some(ScanError::NotADirectory(self.root.clone()))
        } else {
            None
        };

        let matcher = self.matcher();
        let root = self.root.clone();

        let entries = WalkDir::new(&self.root)
            .follow_links(self.config.follow_symlinks)
            .skip_hidden(self.config.skip_hidden)
            .sort(true)
            .process_read_dir(move |_depth, _dir, _state, children| {
                let Some(matcher) = &matcher else {
                    return;
                };
                children.retain(|child| match child {
                    Ok(entry) => {
                        let path = entry.path();
                        let relative = path.strip_prefix(&root).unwrap_or(&path);
                        !matcher
                            .matched(relative, entry.file_type().is_dir())
                            .is_ignore()
                    }
                    Err(_) => true,
                });
            })
            .into_iter();

        ShareWalk {
            walker: self,
            entries,
            root_error,
            finished: false,
        }
    }

    fn is_shutdown_requested(&self) -> bool {
        self.shutdown_flag
            .as_ref()
            .is_some_and(|f| f.load(Ordering::SeqCst))
    }

    /// Regular files yield a result; anything else is skipped.
    fn stat(&self, path: PathBuf) -> Option<Result<ScannedFile, ScanError>> {
        let metadata = if self.config.follow_symlinks {
            std::fs::metadata(&path)
        } else {
            std::fs::symlink_metadata(&path)
        };
        match metadata.and_then(|m| FileStat::from_metadata(&m)) {
            Ok(stat) if stat.is_file => Some(Ok(ScannedFile { path, stat })),
            Ok(_) => None,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("{} vanished during the walk", path.display());
                Some(Err(ScanError::from_io(path, e)))
            }
            Err(e) => {
                log::warn!("Cannot stat {}: {}", path.display(), e);
                Some(Err(ScanError::from_io(path, e)))
            }
        }
    }
}

/// Iterator returned by [`Walker::walk`].
pub struct ShareWalk<'a> {
    walker: &'a Walker,
    entries: DirEntryIter<((), ())>,
    root_error: Option<ScanError>,
    finished: bool,
}

impl std::fmt::Debug for ShareWalk<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShareWalk")
            .field("root", &self.walker.root)
            .finish_non_exhaustive()
    }
}

impl Iterator for ShareWalk<'_> {
    type Item = Result<ScannedFile, ScanError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(e) = self.root_error.take() {
            log::warn!("{}", e);
            self.finished = true;
            return Some(Err(e));
        }
        if self.finished {
            return None;
        }
        loop {
            if self.walker.is_shutdown_requested() {
                log::debug!("Walk of {} stopped by shutdown", self.walker.root.display());
                return None;
            }

            match self.entries.next()? {
                Ok(entry) => {
                    let file_type = entry.file_type();
                    if entry.depth == 0 || file_type.is_dir() {
                        continue;
                    }
                    if file_type.is_symlink() && !self.walker.config.follow_symlinks {
                        log::trace!("Skipping symlink {}", entry.path().display());
                        continue;
                    }
                    if let Some(result) = self.walker.stat(entry.path()) {
                        return Some(result);
                    }
                }
                Err(e) => {
                    let path = e
                        .path()
                        .map_or_else(|| self.walker.root.clone(), Path::to_path_buf);
                    log::warn!("Walk error under {}: {}", path.display(), e);
                    let source = e
                        .into_io_error()
                        .unwrap_or_else(|| std::io::Error::other("directory walk failed"));
                    return Some(Err(ScanError::from_io(path, source)));
                }
            }
        }
    }
}
