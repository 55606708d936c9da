//! Subcommand handling for family-filter.
//!
//! Each subcommand builds its own tokio runtime; `check` doesn't need one.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::cli::Commands;
use crate::config::Config;
use crate::control::{ControlChannel, SocketConnectionFactory};
use crate::filter::{Flow, FlowType};
use crate::orchestrator::{self, SupervisorExit};
use crate::rules::RuleSet;
use crate::telemetry::AuditLogger;

/// Run a subcommand with a loaded configuration.
pub fn handle_command(command: Commands, config: &Config, audit: Arc<AuditLogger>) -> Result<()> {
    match command {
        Commands::Serve { .. } => run_serve(config, audit),
        Commands::Connect { token, rules } => run_connect(config, audit, token, &rules),
        Commands::Check {
            rules,
            host,
            url,
            ip,
            bundle_id,
            user,
        } => {
            let flow = Flow {
                hostname: host,
                url,
                ip_address: ip,
                bundle_id,
                user_id: user,
                ..Default::default()
            };
            run_check(config, &rules, flow)
        }
        Commands::Ping => run_ping(config),
    }
}

fn build_runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")
}

/// Shutdown channel flipped by Ctrl-C.
fn shutdown_on_ctrl_c() -> watch::Receiver<bool> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Interrupt received, shutting down"),
            Err(e) => warn!("Failed to listen for Ctrl-C: {}", e),
        }
        let _ = shutdown_tx.send(true);
    });
    shutdown_rx
}

fn run_serve(config: &Config, audit: Arc<AuditLogger>) -> Result<()> {
    let rt = build_runtime()?;
    rt.block_on(async {
        let shutdown_rx = shutdown_on_ctrl_c();
        orchestrator::run_filter(config, audit, shutdown_rx).await
    })
}

fn run_connect(config: &Config, audit: Arc<AuditLogger>, token: String, rules: &Path) -> Result<()> {
    let rt = build_runtime()?;
    let exit = rt.block_on(async {
        let shutdown_rx = shutdown_on_ctrl_c();
        orchestrator::run_app(config, audit, token, rules.to_path_buf(), shutdown_rx).await
    })?;

    match exit {
        SupervisorExit::Shutdown => Ok(()),
        SupervisorExit::TokenRejected => {
            anyhow::bail!("The backend rejected the user token; sign in again to get a new one")
        }
    }
}

fn run_check(config: &Config, rules_path: &Path, mut flow: Flow) -> Result<()> {
    let rules = RuleSet::load(rules_path).context("Failed to load rule set")?;
    if flow.user_id.is_none() {
        flow.user_id = Some(rules.user_id);
    }
    if flow.url.is_some() {
        flow.flow_type = FlowType::Browser;
    }

    match orchestrator::check_flow(&config.filter, rules, &flow) {
        Some(decision) => {
            let key = decision
                .responsible_key_id
                .map(|id| format!(" (key {})", id))
                .unwrap_or_default();
            println!("{} {:?}{}", decision.verdict, decision.reason, key);
        }
        None => println!("DEFERRED"),
    }
    Ok(())
}

fn run_ping(config: &Config) -> Result<()> {
    let socket_path = config
        .control
        .socket_path
        .clone()
        .context("control.socket_path is not set")?;

    let rt = build_runtime()?;
    rt.block_on(async {
        let channel = ControlChannel::with_timeout(
            Arc::new(SocketConnectionFactory::new(socket_path)),
            config.control.rpc_timeout(),
        );
        let nonce = rand::random::<u64>();
        let started = Instant::now();
        let echoed = channel
            .echo(nonce)
            .await
            .context("Filter did not answer the health probe")?;
        if echoed != nonce {
            anyhow::bail!("Filter echoed {} instead of {}", echoed, nonce);
        }
        println!("filter is up ({:?})", started.elapsed());
        Ok(())
    })
}
