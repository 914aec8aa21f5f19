//! Duplicate detection: size bucketing, chunked comparison and share scans.

pub mod comparator;
pub mod finder;
pub mod groups;

pub use comparator::{
    CompareError, CompareMember, Comparator, ComparatorConfig, ComparisonOutcome, ConfirmedGroup,
    Verdict, DEFAULT_CHUNK_SIZE, DEFAULT_IO_THREADS,
};
pub use finder::{FinderConfig, FinderError, ScanSummary, ShareScanner};
pub use groups::{BucketedScan, GroupingStats, SizeBuckets, SizeGroup};
