//! modlink demo module: entry point.
//!
//! A small module that exercises both interface styles end to end:
//!
//! - `echo_service` (call/reply): the **server** role implements it, the
//!   **client** role calls it once per tick.
//! - `heartbeat_events` (fan-out): the **client** role broadcasts a beat per
//!   tick, the **server** role logs every beat it receives.
//!
//! # Usage
//!
//! ```text
//! modlink-module --role server
//! modlink-module --role client --interval-ms 500
//!
//! Options:
//!   --role         <server|client>
//!   --name         <NAME>   Module name in logs [default: demo-<random>]
//!   --id           <ID>     Application id used for matching [default: 1]
//!   --broker-host  <HOST>   [env: MODLINK_BROKER_HOST] [default: 127.0.0.1]
//!   --broker-port  <PORT>   [env: MODLINK_BROKER_PORT] [default: 49900]
//!   --interval-ms  <MS>     Client tick [default: 1000]
//!   --ready-pipe   <PATH>   Write "ready" here once serving
//! ```
//!
//! Ctrl-C, SIGTERM, or a broker `kill` stop the module; it unregisters
//! before exiting.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use modlink_core::{declare_interface, ModuleId, ProtocolDescriptor};
use modlink_runtime::application::connector::{BROKER_HOST_ENV, BROKER_PORT_ENV, DEFAULT_BROKER_PORT};
use modlink_runtime::infrastructure::{ready, shutdown};
use modlink_runtime::{
    CallProxy, EventProxy, InterfaceSpec, ModuleConfig, ModuleConnector, PublishOutcome,
    ServerDispatcher,
};

declare_interface! {
    /// Returns its argument; also reports how long the server has run.
    pub mod echo_service {
        id: 100,
        kind: CallReply,
        sizing: (1024, 1024, 1),
        calls: {
            ECHO => echo(String) -> String;
            UPTIME => uptime() -> u64;
        }
    }
}

declare_interface! {
    /// Liveness beats from the client role.
    pub mod heartbeat_events {
        id: 101,
        kind: FanOut,
        sizing: (64, 0, 8),
        calls: {
            BEAT => beat(u64);
            STATUS => status(String);
        }
    }
}

// ── CLI argument definitions ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum DemoRole {
    /// Implements echo_service and listens to heartbeat_events.
    Server,
    /// Calls echo_service and broadcasts heartbeat_events.
    Client,
}

#[derive(Debug, Parser)]
#[command(
    name = "modlink-module",
    about = "Demo module for the modlink broker",
    version
)]
struct Cli {
    #[arg(long, value_enum)]
    role: DemoRole,

    /// Module name used in logs and at the broker.
    #[arg(long)]
    name: Option<String>,

    /// Application id matched against peer constraints.
    #[arg(long, default_value_t = 1)]
    id: u16,

    #[arg(long, default_value = "127.0.0.1", env = BROKER_HOST_ENV)]
    broker_host: String,

    #[arg(long, default_value_t = DEFAULT_BROKER_PORT, env = BROKER_PORT_ENV)]
    broker_port: u16,

    /// Client tick in milliseconds.
    #[arg(long, default_value_t = 1000)]
    interval_ms: u64,

    /// File or FIFO that receives one "ready" line once the module serves.
    #[arg(long)]
    ready_pipe: Option<PathBuf>,
}

impl Cli {
    fn module_config(&self) -> ModuleConfig {
        ModuleConfig {
            broker: ProtocolDescriptor::datagram(self.broker_host.clone(), self.broker_port),
            ..ModuleConfig::default()
        }
    }

    fn module_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| {
            let id = Uuid::new_v4().simple().to_string();
            format!("demo-{}", &id[..8])
        })
    }
}

// ── Roles ─────────────────────────────────────────────────────────────────────

fn declare_server(connector: &mut ModuleConnector, id: ModuleId) {
    let started = Instant::now();
    let echo = ServerDispatcher::new(echo_service::CATALOG)
        .on(echo_service::ECHO, |req, reply| {
            let text: String = req.read()?;
            reply.write_str(&text)?;
            Ok(())
        })
        .on(echo_service::UPTIME, move |_, reply| {
            let secs = started.elapsed().as_secs();
            reply.write(&secs)?;
            Ok(())
        });
    connector.register_handler(InterfaceSpec::new(echo_service::CATALOG, id), echo);

    let beats = ServerDispatcher::new(heartbeat_events::CATALOG)
        .on(heartbeat_events::BEAT, |event, _| {
            let n: u64 = event.read()?;
            info!(beat = n, "heartbeat received");
            Ok(())
        })
        .on(heartbeat_events::STATUS, |event, _| {
            let status: String = event.read()?;
            info!(%status, "peer status");
            Ok(())
        });
    connector.register_handler(InterfaceSpec::new(heartbeat_events::CATALOG, id), beats);
}

fn run_client(echo: &CallProxy, beats: &EventProxy, tick: u64) {
    let text = format!("ping {tick}");
    match echo.call(
        echo_service::ECHO,
        |b| b.write_str(&text),
        |b| b.read::<String>(),
    ) {
        Ok(answer) => info!(%answer, "echo answered"),
        Err(e) => warn!(error = %e, "echo failed"),
    }
    match beats.broadcast(heartbeat_events::BEAT, |b| b.write(&tick)) {
        Ok(report) => info!(tick, delivered = report.delivered, "beat sent"),
        Err(e) => warn!(error = %e, "beat failed"),
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_thread_names(true)
        .init();

    let cli = Cli::parse();
    let name = cli.module_name();
    let id = ModuleId(cli.id);
    info!(module = %name, role = ?cli.role, broker = %cli.module_config().broker, "modlink module starting");

    let mut connector =
        ModuleConnector::new(&name, cli.module_config()).context("failed to create module")?;
    let signal = connector.shutdown_signal();
    shutdown::install(&signal).context("failed to install the signal handler")?;

    let client = match cli.role {
        DemoRole::Server => {
            declare_server(&mut connector, id);
            None
        }
        DemoRole::Client => {
            let echo = connector.register_proxy(InterfaceSpec::new(echo_service::CATALOG, id))?;
            let beats =
                connector.register_broadcaster(InterfaceSpec::new(heartbeat_events::CATALOG, id))?;
            Some((echo, beats))
        }
    };

    connector.connect().context("failed to register at the broker")?;
    connector.subscribe_all()?;
    if let Some(path) = &cli.ready_pipe {
        ready::write_ready(path)
            .with_context(|| format!("cannot write ready pipe {}", path.display()))?;
    }

    if connector.publish_all()? == PublishOutcome::ShuttingDown {
        connector.shutdown();
        shutdown::clear();
        return Ok(());
    }

    match client {
        Some((echo, beats)) => {
            let interval = Duration::from_millis(cli.interval_ms.max(1));
            let mut tick = 0u64;
            while !signal.wait_timeout(interval) {
                run_client(&echo, &beats, tick);
                tick += 1;
            }
            connector.shutdown();
        }
        None => connector.run_until_shutdown(),
    }

    shutdown::clear();
    info!(module = %name, "modlink module stopped");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_requires_role_and_defaults_broker() {
        // Arrange / Act
        let cli = Cli::parse_from(["modlink-module", "--role", "server"]);

        // Assert
        assert_eq!(cli.role, DemoRole::Server);
        assert_eq!(cli.broker_port, DEFAULT_BROKER_PORT);
        assert_eq!(
            cli.module_config().broker,
            ProtocolDescriptor::datagram("127.0.0.1", DEFAULT_BROKER_PORT)
        );
    }

    #[test]
    fn test_generated_name_has_demo_prefix() {
        let cli = Cli::parse_from(["modlink-module", "--role", "client"]);

        let name = cli.module_name();

        assert!(name.starts_with("demo-"));
        assert_eq!(name.len(), "demo-".len() + 8);
    }

    #[test]
    fn test_demo_catalogs_have_expected_shape() {
        assert_eq!(echo_service::CATALOG.event_count(), 0);
        assert_eq!(heartbeat_events::CATALOG.event_count(), 2);
        assert_eq!(echo_service::UPTIME.0, 1);
    }
}
