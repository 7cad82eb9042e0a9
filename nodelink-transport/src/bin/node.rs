//! `nodelink-node`: run one cluster node's transport over a static member list.
//!
//! ```text
//! nodelink-node --node-id a --port 7000 --member b@127.0.0.1:7001
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use nodelink_transport::{
    ConnectionProperties, Member, StaticDiscovery, TokioProviders, TransportConfig,
    TransportManager,
};
use tracing_subscriber::EnvFilter;

/// How often readiness is logged.
const READINESS_LOG_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "nodelink-node", about = "Run a nodelink cluster transport node")]
struct Args {
    /// TOML file with `[server]` and `[client]` sections.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Id of this node.
    #[arg(long)]
    node_id: String,

    /// Host other members reach this node on.
    #[arg(long, default_value = "127.0.0.1")]
    advertise_host: String,

    /// Override the configured listening port.
    #[arg(long)]
    port: Option<u16>,

    /// Peer member as `node_id@host:port`. Repeatable.
    #[arg(long = "member")]
    members: Vec<Member>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let properties = match &args.config {
        Some(path) => ConnectionProperties::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ConnectionProperties::default(),
    };
    let mut config = TransportConfig::try_from(properties).context("invalid configuration")?;
    if let Some(port) = args.port {
        config.port = port;
    }

    let local = Member::new(args.node_id, args.advertise_host, config.port);
    let discovery = Arc::new(StaticDiscovery::with_members(local.clone(), args.members));
    let manager = TransportManager::new(TokioProviders::new(), config, discovery)?;

    let port = manager.start().await.context("starting transport")?;
    if port != local.port {
        tracing::warn!(
            configured = local.port,
            bound = port,
            "listening on a different port than advertised"
        );
    }
    manager.connect_all_known_members();

    let mut readiness = tokio::time::interval(READINESS_LOG_INTERVAL);
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("waiting for ctrl-c")?;
                break;
            }
            _ = readiness.tick() => {
                tracing::info!(
                    connected_to_all = manager.has_connected_to_all_members(),
                    pooled = ?manager.pooled_node_ids(),
                    "readiness"
                );
            }
        }
    }

    manager.stop().await;
    Ok(())
}
