//! Logging setup.
//!
//! All crate code logs through the `log` facade; the binary installs an
//! `env_logger` backend once at startup. `RUST_LOG` wins when set, otherwise
//! the level follows the CLI flags:
//!
//! | flags      | level |
//! |------------|-------|
//! | `-q`       | error |
//! | (none)     | info  |
//! | `-v`       | debug |
//! | `-vv`      | trace |
//!
//! Debug builds prefix each line with a timestamp and, from `-v` up, the
//! module path. Release builds print level and message only.
//!
//! ```rust,no_run
//! dupewatch::logging::init_logging(1, false);
//! log::debug!("visible");
//! ```

use env_logger::Builder;
use log::LevelFilter;
use std::io::Write;

/// Environment variable that overrides the CLI-derived level.
pub const LOG_ENV: &str = "RUST_LOG";

/// Install the global logger.
///
/// Returns `false` if a logger was already installed, in which case the
/// call has no effect.
pub fn init_logging(verbose: u8, quiet: bool) -> bool {
    let from_env = std::env::var_os(LOG_ENV).is_some();

    let mut builder = Builder::new();
    if from_env {
        builder.parse_env(LOG_ENV);
    } else {
        builder.filter_level(level_for(verbose, quiet));
        // jwalk and ignore are chatty at debug level
        if verbose < 2 {
            builder.filter_module("ignore", LevelFilter::Warn);
            builder.filter_module("jwalk", LevelFilter::Warn);
        }
    }
    configure_format(&mut builder, verbose);

    let installed = builder.try_init().is_ok();
    if installed {
        if from_env {
            log::debug!("Log filter taken from {}", LOG_ENV);
        } else {
            log::debug!("Log level {}", level_for(verbose, quiet));
        }
    }
    installed
}

fn level_for(verbose: u8, quiet: bool) -> LevelFilter {
    match (quiet, verbose) {
        (true, _) => LevelFilter::Error,
        (false, 0) => LevelFilter::Info,
        (false, 1) => LevelFilter::Debug,
        (false, _) => LevelFilter::Trace,
    }
}

#[cfg(debug_assertions)]
fn configure_format(builder: &mut Builder, verbose: u8) {
    builder.format(move |buf, record| {
        let style = buf.default_level_style(record.level());
        let timestamp = buf.timestamp_millis();
        if verbose >= 1 {
            writeln!(
                buf,
                "{timestamp} {style}{:<5}{style:#} [{}] {}",
                record.level(),
                record.module_path().unwrap_or("?"),
                record.args()
            )
        } else {
            writeln!(
                buf,
                "{timestamp} {style}{:<5}{style:#} {}",
                record.level(),
                record.args()
            )
        }
    });
}

#[cfg(not(debug_assertions))]
fn configure_format(builder: &mut Builder, _verbose: u8) {
    builder.format(|buf, record| {
        let style = buf.default_level_style(record.level());
        writeln!(buf, "{style}{:<5}{style:#} {}", record.level(), record.args())
    });
}
