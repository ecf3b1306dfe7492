//! Control RPC
//!
//! Line-delimited JSON-RPC 2.0 over a local stream socket. One request per
//! line, one response per line, ids echoed back. The socket is owner-only
//! and connections from any other UID are closed before a byte is read.

use crate::state::DaemonState;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wgmesh_common::{restrict_permissions, rpc_code, Error, Result};

/// Environment override for the socket location.
pub const SOCKET_ENV: &str = "WGMESH_SOCKET";

/// Root gets the system path; everyone else falls back through the
/// runtime dir to /tmp.
pub fn default_socket_path() -> PathBuf {
    if nix::unistd::geteuid().is_root() {
        return PathBuf::from("/var/run/wgmesh.sock");
    }
    if let Some(dir) = std::env::var_os("XDG_RUNTIME_DIR") {
        return PathBuf::from(dir).join("wgmesh.sock");
    }
    PathBuf::from("/tmp/wgmesh.sock")
}

/// Resolve the effective socket path: explicit flag, then environment,
/// then the default chain.
pub fn resolve_socket_path(override_path: Option<PathBuf>) -> PathBuf {
    override_path
        .or_else(|| std::env::var_os(SOCKET_ENV).map(PathBuf::from))
        .unwrap_or_else(default_socket_path)
}

#[derive(Debug, Deserialize)]
struct RpcRequest {
    #[allow(dead_code)]
    jsonrpc: Option<String>,
    method: String,
    #[serde(default)]
    params: Value,
    #[serde(default)]
    id: Value,
}

#[derive(Debug, Serialize)]
struct RpcError {
    code: i32,
    message: String,
}

#[derive(Debug, Serialize)]
struct RpcResponse {
    jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
    id: Value,
}

impl RpcResponse {
    fn result(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            result: Some(result),
            error: None,
            id,
        }
    }

    fn error(id: Value, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0",
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
            }),
            id,
        }
    }
}

pub struct RpcServer {
    state: DaemonState,
    path: PathBuf,
}

impl RpcServer {
    pub fn new(state: DaemonState, override_path: Option<PathBuf>) -> Self {
        Self {
            state,
            path: resolve_socket_path(override_path),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.path
    }

    /// Accept connections until cancelled. The listener drops on return;
    /// the daemon removes the socket file afterwards.
    pub async fn serve(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        let _ = std::fs::remove_file(&self.path);
        let listener = UnixListener::bind(&self.path)
            .map_err(|e| Error::Internal(format!("failed to bind control socket: {e}")))?;
        restrict_permissions(&self.path)?;
        info!(path = %self.path.display(), "control socket listening");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => {
                            if !same_uid(&stream) {
                                warn!("rejecting control connection from foreign uid");
                                continue;
                            }
                            let server = self.clone();
                            tokio::spawn(async move {
                                server.handle_connection(stream).await;
                            });
                        }
                        Err(e) => warn!("control accept error: {e}"),
                    }
                }
            }
        }
        info!("control socket closed");
        Ok(())
    }

    async fn handle_connection(&self, stream: UnixStream) {
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            let response = self.dispatch(&line);
            let mut payload = match serde_json::to_vec(&response) {
                Ok(p) => p,
                Err(e) => {
                    warn!("failed to encode RPC response: {e}");
                    break;
                }
            };
            payload.push(b'\n');
            if write.write_all(&payload).await.is_err() {
                break;
            }
        }
    }

    fn dispatch(&self, line: &str) -> RpcResponse {
        let request: RpcRequest = match serde_json::from_str(line) {
            Ok(r) => r,
            Err(e) => {
                debug!("unparseable RPC request: {e}");
                return RpcResponse::error(Value::Null, rpc_code::PARSE_ERROR, "parse error");
            }
        };
        let id = request.id.clone();
        match self.call(&request) {
            Ok(result) => RpcResponse::result(id, result),
            Err(e) => RpcResponse::error(id, e.rpc_error_code(), e.to_string()),
        }
    }

    fn call(&self, request: &RpcRequest) -> Result<Value> {
        match request.method.as_str() {
            "peers.list" => {
                let peers = self.state.store.get_all();
                Ok(json!({ "peers": peers }))
            }
            "peers.get" => {
                let pubkey = request
                    .params
                    .get("pubkey")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        Error::RpcInvalidParams("missing string param: pubkey".to_string())
                    })?;
                Ok(serde_json::to_value(self.state.store.get(pubkey))?)
            }
            "peers.count" => Ok(serde_json::to_value(self.state.store.counts())?),
            "daemon.status" => {
                let local = self.state.local.read();
                let config = self.state.config.read();
                Ok(json!({
                    "mesh_ip": local.mesh_ip,
                    "pubkey": local.wg_pubkey,
                    "iface": config.interface,
                    "uptime_seconds": self.state.uptime_seconds(),
                    "version": wgmesh_common::VERSION,
                }))
            }
            "daemon.ping" => Ok(json!({ "pong": true, "version": wgmesh_common::VERSION })),
            other => Err(Error::RpcUnknownMethod(other.to_string())),
        }
    }
}

fn same_uid(stream: &UnixStream) -> bool {
    match stream.peer_cred() {
        Ok(cred) => cred.uid() == nix::unistd::getuid().as_raw(),
        Err(_) => false,
    }
}
