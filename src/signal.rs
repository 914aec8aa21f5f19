//! Ctrl+C handling.
//!
//! The first interrupt sets a shared flag that the walker, the share
//! scanner and the `events` reader poll between units of work, so a scan
//! stops at a consistent point and reports itself as interrupted. A second
//! interrupt exits immediately with [`EXIT_CODE_INTERRUPTED`].
//!
//! ```rust,no_run
//! use dupewatch::duplicates::FinderConfig;
//! use dupewatch::signal::install_handler;
//!
//! let shutdown = install_handler().unwrap();
//! let config = FinderConfig::default().with_shutdown_flag(shutdown.get_flag());
//! ```

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

/// 128 + SIGINT.
pub const EXIT_CODE_INTERRUPTED: i32 = 130;

/// Shared shutdown flag.
#[derive(Debug, Clone, Default)]
pub struct ShutdownHandler {
    flag: Arc<AtomicBool>,
    interrupts: Arc<AtomicU32>,
}

impl ShutdownHandler {
    /// A handler with no shutdown requested.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether shutdown was requested.
    #[must_use]
    pub fn is_shutdown_requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Request shutdown without a signal.
    pub fn request_shutdown(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// The flag to hand to workers.
    #[must_use]
    pub fn get_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.flag)
    }

    /// Interrupts received so far.
    #[must_use]
    pub fn interrupts(&self) -> u32 {
        self.interrupts.load(Ordering::SeqCst)
    }

    /// Clear the flag and the interrupt count.
    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
        self.interrupts.store(0, Ordering::SeqCst);
    }

    /// Record one interrupt; returns the running count.
    fn interrupt(&self) -> u32 {
        self.request_shutdown();
        self.interrupts.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Errors installing the signal handler.
#[derive(Debug, thiserror::Error)]
pub enum SignalError {
    /// `ctrlc` refused the handler.
    #[error("failed to install signal handler: {0}")]
    InstallFailed(#[from] ctrlc::Error),
}

static GLOBAL_HANDLER: OnceLock<ShutdownHandler> = OnceLock::new();

/// Install the process-wide Ctrl+C handler.
///
/// Calling this again returns the installed handler with its state reset.
///
/// # Errors
///
/// Returns [`SignalError::InstallFailed`] if another handler was already
/// registered outside this module.
pub fn install_handler() -> Result<ShutdownHandler, SignalError> {
    if let Some(handler) = GLOBAL_HANDLER.get() {
        handler.reset();
        return Ok(handler.clone());
    }

    let handler = ShutdownHandler::new();
    let on_signal = handler.clone();
    ctrlc::set_handler(move || {
        let mut stderr = std::io::stderr();
        if on_signal.interrupt() > 1 {
            let _ = writeln!(stderr, "\nInterrupted again, exiting.");
            std::process::exit(EXIT_CODE_INTERRUPTED);
        }
        let _ = writeln!(stderr, "\nInterrupted. Finishing current work...");
        let _ = stderr.flush();
        log::info!("Shutdown signal received");
    })?;

    Ok(GLOBAL_HANDLER.get_or_init(|| handler).clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_is_shared_between_clones() {
        let handler = ShutdownHandler::new();
        let flag = handler.get_flag();
        let clone = handler.clone();
        assert!(!handler.is_shutdown_requested());

        clone.request_shutdown();
        assert!(handler.is_shutdown_requested());
        assert!(flag.load(Ordering::SeqCst));
    }

    #[test]
    fn test_interrupt_counts_and_reset() {
        let handler = ShutdownHandler::new();
        assert_eq!(handler.interrupt(), 1);
        assert_eq!(handler.interrupt(), 2);
        assert_eq!(handler.interrupts(), 2);
        assert!(handler.is_shutdown_requested());

        handler.reset();
        assert_eq!(handler.interrupts(), 0);
        assert!(!handler.is_shutdown_requested());
    }
}
