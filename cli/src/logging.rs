//! Tracing subscriber setup for the `bagport` binary.
//!
//! Engine events go to stderr through a compact formatter. `RUST_LOG`
//! overrides the level chosen from the command-line flags.

use anyhow::Result;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Level used when `RUST_LOG` is unset.
pub fn default_level(verbose: bool, quiet: bool) -> Level {
    if quiet {
        Level::ERROR
    } else if verbose {
        Level::DEBUG
    } else {
        Level::WARN
    }
}

/// Filter directives for both the engine and the binary.
fn directives(level: Level) -> String {
    format!("bagport_engine={},bagport={}", level, level)
}

/// Initialize structured logging on stderr.
pub fn init_logging(verbose: bool, quiet: bool) -> Result<()> {
    let level = default_level(verbose, quiet);

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(directives(level)))
        .map_err(|e| anyhow::anyhow!("Failed to create log filter: {}", e))?;

    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_span_events(FmtSpan::NONE)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    Ok(())
}
