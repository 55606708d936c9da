//! family-filter: per-user network content filter
//!
//! This is the main entry point for the family-filter binary. It handles CLI
//! argument parsing, configuration loading, logging initialization, and hands
//! off to the subcommand.
//!
//! # Logging
//!
//! - **Audit logging**: security-relevant events go to syslog as JSON lines
//! - **Debug logging**: `tracing` to stderr, so `serve` can keep stdout for
//!   verdict lines

use anyhow::{Context, Result};
use clap::Parser;
use family_filter::{cli::Cli, cli_handler, config::ConfigLoader, telemetry::AuditLogger};
use std::sync::Arc;
use tracing::{debug, warn};

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Config first: its log level (already raised by -v) drives tracing.
    let config = ConfigLoader::new()
        .load(&cli)
        .context("Failed to load configuration")?;

    init_tracing(&config.general.log_level, cli.verbose)?;
    debug!("Parsed CLI arguments: {:?}", cli);
    debug!("Loaded configuration: {:?}", config);

    let audit = match AuditLogger::new() {
        Ok(logger) => Arc::new(logger),
        Err(e) => {
            warn!("Audit logging disabled: {}", e);
            Arc::new(AuditLogger::new_null())
        }
    };

    cli_handler::handle_command(cli.command, &config, audit)
}

/// Initialize the tracing subscriber for debug/development logging.
///
/// This is separate from the audit telemetry which goes to syslog.
///
/// # Verbosity Levels
/// - 0 (default): `RUST_LOG` if set, else the configured `log_level`
/// - 1 (-v): Info level
/// - 2 (-vv): Debug level
/// - 3+ (-vvv): Trace level
fn init_tracing(log_level: &str, verbose: u8) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let configured = if log_level.is_empty() { "warn" } else { log_level };
    let filter = if verbose == 0 {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(configured))
    } else {
        EnvFilter::new(configured)
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init()
        .context("Failed to initialize tracing subscriber")?;

    Ok(())
}
