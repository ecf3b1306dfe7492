//! `wgmesh peers` - query a running daemon

use crate::client::{ConnectError, DaemonClient};
use crate::output::{print_item, print_list, OutputFormat, TableDisplay};
use clap::{Args, Subcommand};
use serde_json::{json, Value};
use std::path::PathBuf;
use wgmesh_common::PeerInfo;

#[derive(Args)]
pub struct CommonArgs {
    /// Control socket path
    #[arg(long, env = "WGMESH_SOCKET", global = true)]
    pub socket_path: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "table", global = true)]
    pub format: OutputFormat,
}

#[derive(Subcommand)]
pub enum PeersCommands {
    /// List all known peers
    List(CommonArgs),

    /// Show one peer
    Get {
        /// WireGuard public key
        pubkey: String,

        #[command(flatten)]
        common: CommonArgs,
    },

    /// Show peer counts
    Count(CommonArgs),
}

/// Exit code 2 means the daemon socket is absent.
pub async fn execute(cmd: PeersCommands) -> anyhow::Result<i32> {
    let (socket_path, format) = match &cmd {
        PeersCommands::List(common) | PeersCommands::Count(common) => {
            (common.socket_path.clone(), common.format)
        }
        PeersCommands::Get { common, .. } => (common.socket_path.clone(), common.format),
    };

    let mut client = match DaemonClient::connect(socket_path).await {
        Ok(client) => client,
        Err(ConnectError::SocketAbsent(path)) => {
            eprintln!(
                "no control socket at {}. Is the daemon running?",
                path.display()
            );
            return Ok(2);
        }
        Err(ConnectError::Other(e)) => return Err(e),
    };

    match cmd {
        PeersCommands::List(_) => {
            let result = client.call("peers.list", json!({})).await?;
            let peers: Vec<PeerInfo> =
                serde_json::from_value(result.get("peers").cloned().unwrap_or(Value::Null))?;
            let rows: Vec<PeerRow> = peers.iter().map(PeerRow::from).collect();
            print_list(&rows, format);
        }
        PeersCommands::Get { pubkey, .. } => {
            let result = client.call("peers.get", json!({ "pubkey": pubkey })).await?;
            if result.is_null() {
                eprintln!("peer not found: {pubkey}");
                return Ok(1);
            }
            let peer: PeerInfo = serde_json::from_value(result)?;
            print_item(&PeerRow::from(&peer), format);
        }
        PeersCommands::Count(_) => {
            let result = client.call("peers.count", json!({})).await?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&result)?),
                _ => println!(
                    "active: {}  total: {}  dead: {}",
                    result.get("active").and_then(Value::as_u64).unwrap_or(0),
                    result.get("total").and_then(Value::as_u64).unwrap_or(0),
                    result.get("dead").and_then(Value::as_u64).unwrap_or(0),
                ),
            }
        }
    }
    Ok(0)
}

#[derive(serde::Serialize)]
struct PeerRow {
    pubkey: String,
    hostname: String,
    mesh_ip: String,
    endpoint: String,
    sources: String,
    latency: String,
}

impl From<&PeerInfo> for PeerRow {
    fn from(peer: &PeerInfo) -> Self {
        Self {
            pubkey: peer.wg_pubkey.clone(),
            hostname: peer.hostname.clone().unwrap_or_else(|| "-".to_string()),
            mesh_ip: peer.mesh_ip.to_string(),
            endpoint: peer.endpoint.clone().unwrap_or_else(|| "-".to_string()),
            sources: peer
                .discovered_via
                .iter()
                .cloned()
                .collect::<Vec<_>>()
                .join(","),
            latency: peer
                .latency_ms
                .map(|ms| format!("{ms}ms"))
                .unwrap_or_else(|| "-".to_string()),
        }
    }
}

impl TableDisplay for PeerRow {
    fn headers() -> Vec<&'static str> {
        vec!["PUBKEY", "HOSTNAME", "MESH IP", "ENDPOINT", "SOURCES", "LATENCY"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.pubkey.clone(),
            self.hostname.clone(),
            self.mesh_ip.clone(),
            self.endpoint.clone(),
            self.sources.clone(),
            self.latency.clone(),
        ]
    }
}
