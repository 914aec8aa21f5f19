//! Machine-readable output.
//!
//! ```no_run
//! use dupewatch::output::export_groups;
//! use dupewatch::store::SqliteRepository;
//! use std::path::Path;
//!
//! let repo = SqliteRepository::open(Path::new("/tmp/dupewatch.db")).unwrap();
//! println!("{}", export_groups(&repo).unwrap().to_json_pretty().unwrap());
//! ```

pub mod json;

pub use json::{export_groups, ExportFile, ExportGroup, GroupExport, JsonOutputError};
