//! Command-line interface definitions for family-filter.
//!
//! Uses clap's derive API for type-safe argument parsing.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Per-user network content filter.
///
/// family-filter runs as two cooperating processes: a privileged filter
/// (`serve`) that decides every network flow against the current user's
/// rules, and a per-user app (`connect`) that keeps a live connection to the
/// backend and pushes rule changes into the filter over a Unix socket.
#[derive(Parser, Debug)]
#[command(name = "family-filter")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to run.
    #[command(subcommand)]
    pub command: Commands,

    /// Path to additional config file.
    ///
    /// This config file is merged on top of system and user configs,
    /// giving it the highest priority (except for CLI flags).
    #[arg(short = 'c', long = "config", value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Control socket path (overrides `control.socket_path`).
    #[arg(short = 's', long = "socket", value_name = "PATH", global = true)]
    pub socket: Option<PathBuf>,

    /// Exempt a user from filtering (repeatable).
    #[arg(short = 'x', long = "exempt-user", value_name = "UID", global = true)]
    pub exempt_users: Vec<u32>,

    /// Increase log verbosity.
    ///
    /// Can be specified multiple times:
    /// -v    = info level
    /// -vv   = debug level
    /// -vvv  = trace level
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

/// Subcommands for family-filter.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the filter process.
    ///
    /// Listens on the control socket and reads flows as JSON lines from
    /// stdin, writing one JSON verdict line per flow to stdout.
    Serve {
        /// App-id manifest (overrides `apps.manifest_path`).
        #[arg(long = "manifest", value_name = "PATH")]
        manifest: Option<PathBuf>,
    },

    /// Run the per-user app process.
    ///
    /// Connects to the backend with the given token and keeps the filter's
    /// rules current until the token is rejected or the process is stopped.
    Connect {
        /// User token sent in the backend handshake.
        #[arg(long = "token", value_name = "TOKEN")]
        token: String,

        /// Rule set file served as the user's rules.
        #[arg(long = "rules", value_name = "PATH")]
        rules: PathBuf,
    },

    /// Evaluate a single flow against a rule set file and print the verdict.
    Check {
        /// Rule set file.
        #[arg(long = "rules", value_name = "PATH")]
        rules: PathBuf,

        /// Flow hostname.
        #[arg(long = "host", value_name = "HOST")]
        host: Option<String>,

        /// Flow URL.
        #[arg(long = "url", value_name = "URL")]
        url: Option<String>,

        /// Remote IP address.
        #[arg(long = "ip", value_name = "ADDR")]
        ip: Option<String>,

        /// Bundle id of the originating app.
        #[arg(long = "bundle-id", value_name = "ID")]
        bundle_id: Option<String>,

        /// OS user id (defaults to the rule set's user).
        #[arg(long = "user", value_name = "UID")]
        user: Option<u32>,
    },

    /// Health-probe the filter over the control socket.
    Ping,
}

impl Cli {
    /// Log level implied by `-v` flags, if any were given.
    pub fn verbosity_level(&self) -> Option<&'static str> {
        match self.verbose {
            0 => None,
            1 => Some("info"),
            2 => Some("debug"),
            _ => Some("trace"),
        }
    }
}
