//! `wgmesh join` - run the daemon

use anyhow::Context;
use clap::Args;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, reload, EnvFilter};
use wgmesh_daemon::config::DaemonConfig;
use wgmesh_daemon::Daemon;

#[derive(Args)]
pub struct JoinArgs {
    /// Shared mesh secret
    #[arg(long, env = "WGMESH_SECRET")]
    pub secret: String,

    /// WireGuard interface name (wg0 on Linux, utunNN on macOS)
    #[arg(long)]
    pub interface: Option<String>,

    /// WireGuard listen port
    #[arg(long)]
    pub listen_port: Option<u16>,

    /// CIDRs reachable through this node, comma separated
    #[arg(long, value_delimiter = ',')]
    pub advertise_routes: Vec<String>,

    /// Enable in-mesh gossip
    #[arg(long)]
    pub gossip: bool,

    /// Default log filter
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Relay announcements through the privacy router
    #[arg(long)]
    pub privacy: bool,

    /// Control socket path
    #[arg(long, env = "WGMESH_SOCKET")]
    pub socket_path: Option<PathBuf>,

    /// State directory
    #[arg(long)]
    pub state_dir: Option<PathBuf>,

    /// Rendezvous registry base URL
    #[arg(long)]
    pub registry_url: Option<String>,
}

pub async fn execute(args: JoinArgs) -> anyhow::Result<()> {
    // Reloadable filter so SIGHUP can change the level at runtime.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone()));
    let (filter_layer, reload_handle) = reload::Layer::new(filter);
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt::layer())
        .init();

    info!("wgmesh v{}", wgmesh_common::VERSION);

    let mut config = DaemonConfig {
        secret: args.secret,
        advertise_routes: args.advertise_routes,
        enable_gossip: args.gossip,
        enable_privacy: args.privacy,
        registry_url: args.registry_url,
        socket_path: args.socket_path,
        log_level: args.log_level,
        ..DaemonConfig::default()
    };
    if let Some(interface) = args.interface {
        config.interface = interface;
    }
    if let Some(listen_port) = args.listen_port {
        config.listen_port = listen_port;
    }
    if let Some(state_dir) = args.state_dir {
        config.state_dir = state_dir;
    }

    let mut daemon = Daemon::new(config).context("failed to initialize daemon")?;
    daemon.set_log_reload(Arc::new(move |level: &str| {
        let _ = reload_handle.reload(EnvFilter::new(level));
    }));

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received shutdown signal");
            signal_token.cancel();
        }
    });

    daemon.run(shutdown).await.context("daemon failed")?;
    Ok(())
}
