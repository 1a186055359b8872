//! # relay
//!
//! Single binary for both roles: `--role server` runs the hub, `--role client`
//! runs a subscriber against `--serverURL`.

#![deny(unsafe_code)]

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use relay_core::{DataSource, PeerId, StaticSource};
use relay_hub::{HubConfig, HubServer, ShutdownCoordinator};
use relay_subscriber::{connect_url, Subscriber, SubscriberConfig};
use relay_telemetry::{init_telemetry, LogFormat, MetricsRecorder, TelemetryConfig};
use tracing::info;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Role {
    /// Accept subscribers and broadcast to them.
    #[value(alias = "hub")]
    Server,
    /// Dial a hub and apply what it sends.
    #[value(alias = "subscriber")]
    Client,
}

/// Hub/subscriber pub-sub relay.
#[derive(Parser, Debug)]
#[command(name = "relay", about = "Hub/subscriber pub-sub relay")]
struct Cli {
    /// Which side to run.
    #[arg(long, value_enum, default_value = "server")]
    role: Role,

    /// Hub port.
    #[arg(long, default_value = "9999")]
    port: u16,

    /// Hub WebSocket URL for the client role.
    #[arg(long = "serverURL", default_value = "ws://localhost:8080/ws")]
    server_url: String,

    /// Seconds between broadcast rounds.
    #[arg(long, default_value = "10")]
    broadcast_interval_secs: u64,

    /// Seconds a subscriber has to ack a round.
    #[arg(long, default_value = "5")]
    ack_timeout_secs: u64,

    /// Log output: `pretty` or `json`.
    #[arg(long, default_value = "pretty")]
    log_format: LogFormat,
}

impl Cli {
    fn hub_config(&self) -> HubConfig {
        HubConfig {
            port: self.port,
            broadcast_interval_secs: self.broadcast_interval_secs,
            ack_timeout_secs: self.ack_timeout_secs,
            ..HubConfig::default()
        }
    }

    fn subscriber_config(&self) -> SubscriberConfig {
        SubscriberConfig::with_server_url(&self.server_url)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let telemetry = init_telemetry(TelemetryConfig {
        format: cli.log_format,
        ..TelemetryConfig::default()
    });

    let shutdown = Arc::new(ShutdownCoordinator::new());
    match cli.role {
        Role::Server => run_hub(&cli, telemetry.metrics(), shutdown).await,
        Role::Client => run_subscriber(&cli, shutdown).await,
    }
}

async fn run_hub(
    cli: &Cli,
    metrics: Option<Arc<MetricsRecorder>>,
    shutdown: Arc<ShutdownCoordinator>,
) -> Result<()> {
    let config = cli.hub_config();
    let server = HubServer::with_shutdown(config, metrics.clone(), Arc::clone(&shutdown));

    let (addr, server_handle) = server
        .listen()
        .await
        .with_context(|| format!("Failed to bind hub on {}", server.config().bind_addr()))?;

    let source: Arc<dyn DataSource> = Arc::new(StaticSource::default());
    let cadence_handle = server.spawn_cadence(source);
    info!(%addr, "hub ready");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    info!("shutting down hub");
    shutdown.drain(vec![cadence_handle, server_handle], None).await;

    if let Some(metrics) = metrics {
        for m in metrics.snapshot() {
            info!(metric = %m.name, value = m.value, "final metric");
        }
    }
    Ok(())
}

async fn run_subscriber(cli: &Cli, shutdown: Arc<ShutdownCoordinator>) -> Result<()> {
    let config = cli.subscriber_config();
    // Reject a bad URL up front instead of retrying it forever.
    let _ = connect_url(&config.server_url, &PeerId::from_raw("url-check"))
        .with_context(|| format!("Invalid --serverURL {}", config.server_url))?;

    let subscriber = Arc::new(Subscriber::new(config));
    let handle = tokio::spawn({
        let subscriber = Arc::clone(&subscriber);
        let cancel = shutdown.child_token();
        async move { subscriber.run(cancel).await }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    info!("shutting down subscriber");
    shutdown.drain(vec![handle], None).await;

    info!(
        updates = subscriber.local_state().updates(),
        keys = subscriber.local_state().get().len(),
        "subscriber stopped"
    );
    Ok(())
}
