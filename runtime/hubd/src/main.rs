//! courier-hubd - standalone courier broker
//!
//! Serves one broker over TCP and/or a Unix socket until interrupted.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use courier_broker::{Broker, BrokerConfig};
use courier_fabric::transport::{TcpTransportListener, UnixTransportListener};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// CLI arguments
#[derive(Parser, Debug)]
#[command(name = "courier-hubd")]
#[command(about = "Message broker for named courier clients", long_about = None)]
struct Args {
    /// TCP address to listen on
    #[arg(long, env = "COURIER_TCP")]
    tcp: Option<SocketAddr>,

    /// Unix socket path to listen on
    #[arg(long, env = "COURIER_UNIX")]
    unix: Option<PathBuf>,

    /// Evict clients silent for this many seconds (0 disables)
    #[arg(long, env = "COURIER_CLIENT_TIMEOUT_SECS", default_value = "15")]
    client_timeout_secs: u64,

    /// Per-write timeout towards a client, in milliseconds (0 disables)
    #[arg(long, env = "COURIER_WRITE_TIMEOUT_MS", default_value = "1000")]
    write_timeout_ms: u64,

    /// Frames queued from all clients before readers wait
    #[arg(long, env = "COURIER_INBOUND_CAPACITY", default_value = "1024")]
    inbound_capacity: usize,

    /// Log broker stats at this interval in seconds (0 disables)
    #[arg(long, env = "COURIER_STATS_INTERVAL_SECS", default_value = "0")]
    stats_interval_secs: u64,
}

impl Args {
    fn broker_config(&self) -> BrokerConfig {
        let non_zero = |d: Duration| (!d.is_zero()).then_some(d);
        BrokerConfig::default()
            .with_client_timeout(non_zero(Duration::from_secs(self.client_timeout_secs)))
            .with_write_timeout(non_zero(Duration::from_millis(self.write_timeout_ms)))
            .with_inbound_capacity(self.inbound_capacity)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,courier_broker=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    if args.tcp.is_none() && args.unix.is_none() {
        bail!("Nothing to serve: pass --tcp and/or --unix");
    }

    let broker = Broker::spawn(args.broker_config());
    let mut servers = Vec::new();

    if let Some(addr) = args.tcp {
        let listener = TcpTransportListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind TCP listener on {}", addr))?;
        info!(addr = %listener.local_addr()?, "Listening on TCP");
        servers.push(broker.serve(listener));
    }

    if let Some(path) = &args.unix {
        let listener = UnixTransportListener::bind(path)
            .await
            .with_context(|| format!("Failed to bind Unix socket at {}", path.display()))?;
        info!(path = %path.display(), "Listening on Unix socket");
        servers.push(broker.serve(listener));
    }

    if args.stats_interval_secs > 0 {
        let handle = broker.clone();
        let period = Duration::from_secs(args.stats_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match handle.stats().await {
                    Ok(stats) => info!(
                        clients = stats.current_clients,
                        total_clients = stats.total_clients,
                        total_messages = stats.total_messages,
                        uptime_ms = stats.uptime,
                        "Broker stats"
                    ),
                    Err(_) => break,
                }
            }
        });
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutting down");

    broker.shutdown();
    for server in servers {
        if let Err(e) = server.await {
            warn!(error = %e, "Listener task failed");
        }
    }

    Ok(())
}
