//! Exit codes and machine-readable error reports.

use serde::Serialize;

use crate::duplicates::{FinderError, ScanSummary};

/// Process exit codes.
///
/// - 0: scan finished and found duplicates, or a non-scan command succeeded
/// - 1: unexpected failure
/// - 2: scan finished without duplicates
/// - 3: finished, but some files could not be read or persisted
/// - 130: interrupted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExitCode {
    /// Completed normally
    Success = 0,
    /// Unexpected failure
    GeneralError = 1,
    /// Scan completed without duplicates
    NoDuplicates = 2,
    /// Completed with non-fatal errors
    PartialSuccess = 3,
    /// Ctrl+C
    Interrupted = 130,
}

impl ExitCode {
    /// Numeric exit status.
    #[must_use]
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Stable code used in error reports.
    #[must_use]
    pub fn code_prefix(self) -> &'static str {
        match self {
            Self::Success => "DW000",
            Self::GeneralError => "DW001",
            Self::NoDuplicates => "DW002",
            Self::PartialSuccess => "DW003",
            Self::Interrupted => "DW130",
        }
    }

    /// Exit code for a completed scan.
    #[must_use]
    pub fn for_scan(summary: &ScanSummary) -> Self {
        if summary.is_partial() {
            Self::PartialSuccess
        } else if summary.duplicate_groups == 0 {
            Self::NoDuplicates
        } else {
            Self::Success
        }
    }

    /// Exit code for an error that escaped `run_app`.
    #[must_use]
    pub fn for_error(err: &anyhow::Error) -> Self {
        match err.downcast_ref::<FinderError>() {
            Some(FinderError::Interrupted) => Self::Interrupted,
            _ => Self::GeneralError,
        }
    }
}

/// Error report printed with `--json-errors`.
#[derive(Debug, Serialize)]
pub struct StructuredError {
    /// Code such as `DW001`
    pub code: String,
    /// Numeric exit status
    pub exit_code: i32,
    /// Error message including its causes
    pub message: String,
    /// Whether the run was interrupted
    pub interrupted: bool,
}

impl StructuredError {
    /// Build a report for `err`.
    #[must_use]
    pub fn new(err: &anyhow::Error, exit_code: ExitCode) -> Self {
        Self {
            code: exit_code.code_prefix().to_string(),
            exit_code: exit_code.as_i32(),
            message: format!("{err:#}"),
            interrupted: exit_code == ExitCode::Interrupted,
        }
    }
}
