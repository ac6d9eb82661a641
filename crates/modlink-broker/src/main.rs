//! modlink broker: entry point.
//!
//! Serves the receptor on the well-known address, hands every registering
//! module its own registrar, and pairs callers with implementers until a
//! signal or a module's `kill` request stops it.
//!
//! # Usage
//!
//! ```text
//! modlink-broker
//! modlink-broker --config ./broker.toml --log-level debug
//! modlink-broker --init-config ./broker.toml
//!
//! Options:
//!   --config       <PATH>   [env: MODLINK_CONFIG]
//!   --host         <HOST>   Receptor host [env: MODLINK_BROKER_HOST]
//!   --port         <PORT>   Receptor port [env: MODLINK_BROKER_PORT]
//!   --log-level    <LEVEL>  Used when RUST_LOG is unset
//!   --ready-pipe   <PATH>   Write "ready" here once listening
//!   --init-config  <PATH>   Write the effective config and exit
//! ```
//!
//! # Shutdown sequence
//!
//! ```text
//!  signal / kill ─► broker.kill()        release blocked publishers
//!                   broker.kill_modules() ask every module to exit
//!                   rendezvous.stop()     stop receptor and registrars
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use modlink_broker::infrastructure::storage::config::{
    config_file_path, load_config, save_config, BrokerConfig, CONFIG_ENV,
};
use modlink_broker::{Broker, BrokerSnapshot, Rendezvous};
use modlink_runtime::application::connector::{BROKER_HOST_ENV, BROKER_PORT_ENV};
use modlink_runtime::infrastructure::{ready, shutdown};
use modlink_runtime::ShutdownSignal;

// ── CLI argument definitions ──────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(name = "modlink-broker", version, about = "modlink rendezvous broker")]
struct Cli {
    /// Config file; defaults to the platform config directory.
    #[arg(long, env = CONFIG_ENV)]
    config: Option<PathBuf>,

    /// Overrides `rendezvous.host`.
    #[arg(long, env = BROKER_HOST_ENV)]
    host: Option<String>,

    /// Overrides `rendezvous.port`.
    #[arg(long, env = BROKER_PORT_ENV)]
    port: Option<u16>,

    /// Overrides `broker.log_level`.
    #[arg(long)]
    log_level: Option<String>,

    /// File or FIFO that receives one "ready" line once the receptor listens.
    #[arg(long)]
    ready_pipe: Option<PathBuf>,

    /// Writes the effective configuration to this path and exits.
    #[arg(long, value_name = "PATH")]
    init_config: Option<PathBuf>,
}

impl Cli {
    fn apply(&self, config: &mut BrokerConfig) {
        if let Some(host) = &self.host {
            config.rendezvous.host = host.clone();
        }
        if let Some(port) = self.port {
            config.rendezvous.port = port;
        }
        if let Some(level) = &self.log_level {
            config.broker.log_level = level.clone();
        }
    }
}

/// Renders the final table for the shutdown log.  TOML cannot hold every
/// mask value, so Debug output stands in when it fails.
fn render_snapshot(snapshot: &BrokerSnapshot) -> String {
    toml::to_string_pretty(snapshot).unwrap_or_else(|_| format!("{snapshot:#?}"))
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let path = config_file_path(cli.config.as_deref())?;
    let mut config =
        load_config(&path).with_context(|| format!("cannot load {}", path.display()))?;
    cli.apply(&mut config);

    if let Some(target) = &cli.init_config {
        save_config(&config, target)
            .with_context(|| format!("cannot write {}", target.display()))?;
        println!("wrote {}", target.display());
        return Ok(());
    }

    // Level is overridden by `RUST_LOG`.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.broker.log_level)),
        )
        .with_thread_names(true)
        .init();

    info!(config = %path.display(), "modlink broker starting");

    let broker = Arc::new(Broker::new(config.pairing_plan()));
    let signal = ShutdownSignal::new();
    shutdown::install(&signal).context("failed to install the signal handler")?;

    let mut rendezvous = Rendezvous::start(
        Arc::clone(&broker),
        config.rendezvous_settings(),
        Arc::clone(&signal),
    )
    .context("failed to start the rendezvous")?;

    if let Some(path) = &cli.ready_pipe {
        ready::write_ready(path)
            .with_context(|| format!("cannot write ready pipe {}", path.display()))?;
    }

    signal.wait();

    // ── Shutdown ──────────────────────────────────────────────────────────────
    broker.kill();
    let reached = broker.kill_modules();
    info!(reached, "kill sent to registered modules");
    debug!(table = %render_snapshot(&broker.snapshot()), "final registration table");
    rendezvous.stop();
    shutdown::clear();
    info!("modlink broker stopped");
    Ok(())
}
