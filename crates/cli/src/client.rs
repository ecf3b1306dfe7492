//! Control-socket RPC client

use anyhow::{bail, Context};
use serde_json::{json, Value};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use wgmesh_daemon::rpc::resolve_socket_path;

pub struct DaemonClient {
    stream: BufReader<UnixStream>,
    next_id: u64,
}

/// Why a connection could not be made. A missing socket is the common
/// "daemon is not running" case and gets its own exit code.
pub enum ConnectError {
    SocketAbsent(PathBuf),
    Other(anyhow::Error),
}

impl DaemonClient {
    pub async fn connect(override_path: Option<PathBuf>) -> Result<Self, ConnectError> {
        let path = resolve_socket_path(override_path);
        match UnixStream::connect(&path).await {
            Ok(stream) => Ok(Self {
                stream: BufReader::new(stream),
                next_id: 1,
            }),
            Err(e)
                if e.kind() == std::io::ErrorKind::NotFound
                    || e.kind() == std::io::ErrorKind::ConnectionRefused =>
            {
                Err(ConnectError::SocketAbsent(path))
            }
            Err(e) => Err(ConnectError::Other(
                anyhow::Error::new(e).context(format!("connecting to {}", path.display())),
            )),
        }
    }

    /// One request, one response line.
    pub async fn call(&mut self, method: &str, params: Value) -> anyhow::Result<Value> {
        let id = self.next_id;
        self.next_id += 1;

        let request = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": id,
        });
        let mut line = serde_json::to_vec(&request)?;
        line.push(b'\n');
        self.stream
            .get_mut()
            .write_all(&line)
            .await
            .context("writing RPC request")?;

        let mut response_line = String::new();
        let read = self
            .stream
            .read_line(&mut response_line)
            .await
            .context("reading RPC response")?;
        if read == 0 {
            bail!("daemon closed the connection");
        }

        let response: Value =
            serde_json::from_str(&response_line).context("decoding RPC response")?;
        if let Some(error) = response.get("error").filter(|e| !e.is_null()) {
            bail!(
                "RPC error {}: {}",
                error.get("code").and_then(Value::as_i64).unwrap_or(0),
                error.get("message").and_then(Value::as_str).unwrap_or("?")
            );
        }
        Ok(response.get("result").cloned().unwrap_or(Value::Null))
    }
}
