//! Tracing initialisation for SPP binaries.
//!
//! Call [`init_from_config`] (or [`init_tracing`] directly) once at program
//! start to configure the global subscriber with an `EnvFilter` and optional
//! JSON formatting. Later calls are ignored; the global subscriber can only
//! be set once per process.
//!
//! `spp run` prints its result table on stdout, so every log line goes to
//! stderr and the table can be piped or redirected on its own.

use tracing::Level;

use crate::config::SppConfig;
use crate::error::Result;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Initialise the global tracing subscriber.
///
/// * `json`: emit newline-delimited JSON log lines.
/// * `level`: default verbosity when `RUST_LOG` is not set.
///
/// Logs go to stderr so rendered tables on stdout stay clean.
pub fn init_tracing(json: bool, level: Level) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr).json())
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init()
            .ok();
    }
}

/// Initialise tracing from a loaded [`SppConfig`].
///
/// `verbose` forces `debug`; otherwise the configured `log_level` applies.
/// JSON output is on when either `json` or the config's `log_json` is set.
/// An unknown `log_level` is reported before any subscriber is installed.
pub fn init_from_config(config: &SppConfig, verbose: bool, json: bool) -> Result<()> {
    let level = if verbose { Level::DEBUG } else { config.level()? };
    init_tracing(json || config.log_json, level);
    Ok(())
}
