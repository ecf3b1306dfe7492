//! Daemon configuration
//!
//! The static configuration comes from the CLI at startup. A small subset
//! is reloadable at runtime from `<state-dir>/<iface>.conf` (plain
//! `KEY=value` lines, `#` comments) on SIGHUP.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// Daemon configuration
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Shared mesh secret; never serialized.
    pub secret: String,

    /// WireGuard interface name.
    pub interface: String,

    /// WireGuard listen port.
    pub listen_port: u16,

    /// Persisted-state directory.
    pub state_dir: PathBuf,

    /// CIDRs advertised as reachable through this node. Reloadable.
    pub advertise_routes: Vec<String>,

    /// Run the in-mesh gossip layer.
    pub enable_gossip: bool,

    /// Run DHT discovery.
    pub enable_dht: bool,

    /// Relay announcements through the privacy router.
    pub enable_privacy: bool,

    /// Rendezvous registry base URL, when configured.
    pub registry_url: Option<String>,

    /// Control socket override.
    pub socket_path: Option<PathBuf>,

    /// Default log filter. Reloadable.
    pub log_level: String,

    /// Reconcile tick interval.
    pub reconcile_interval: Duration,

    /// Where the persistent wg-quick config lands.
    pub wireguard_config_dir: PathBuf,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            interface: crate::wg::platform::Platform::current()
                .default_interface()
                .to_string(),
            listen_port: 51820,
            state_dir: wgmesh_common::default_state_dir(),
            advertise_routes: Vec::new(),
            enable_gossip: true,
            enable_dht: true,
            enable_privacy: false,
            registry_url: None,
            socket_path: None,
            log_level: "info".to_string(),
            reconcile_interval: Duration::from_secs(5),
            wireguard_config_dir: PathBuf::from("/etc/wireguard"),
        }
    }
}

impl DaemonConfig {
    /// `<state-dir>/<iface>.json` — the local node identity.
    pub fn node_state_path(&self) -> PathBuf {
        self.state_dir.join(format!("{}.json", self.interface))
    }

    /// `<state-dir>/<iface>-peers.json` — the short-lived peer cache.
    pub fn peer_cache_path(&self) -> PathBuf {
        self.state_dir.join(format!("{}-peers.json", self.interface))
    }

    /// `<state-dir>/<iface>-dht.nodes` — DHT bootstrap cache.
    pub fn dht_cache_path(&self) -> PathBuf {
        self.state_dir.join(format!("{}-dht.nodes", self.interface))
    }

    /// `<state-dir>/<iface>.conf` — reloadable runtime options.
    pub fn runtime_conf_path(&self) -> PathBuf {
        self.state_dir.join(format!("{}.conf", self.interface))
    }

    /// Re-read the runtime conf file and apply the reloadable subset.
    /// Returns true when anything changed.
    pub fn apply_runtime_conf(&mut self, entries: &BTreeMap<String, String>) -> bool {
        let mut changed = false;
        for (key, value) in entries {
            match key.as_str() {
                "advertise-routes" => {
                    let routes: Vec<String> = value
                        .split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect();
                    if routes != self.advertise_routes {
                        self.advertise_routes = routes;
                        changed = true;
                    }
                }
                "log-level" => {
                    if *value != self.log_level {
                        self.log_level = value.clone();
                        changed = true;
                    }
                }
                other => {
                    warn!("ignoring non-reloadable config key: {other}");
                }
            }
        }
        changed
    }
}

/// Parse `KEY=value` lines; `#` starts a comment, blank lines are skipped.
pub fn parse_runtime_conf(text: &str) -> BTreeMap<String, String> {
    let mut entries = BTreeMap::new();
    for line in text.lines() {
        let line = match line.find('#') {
            Some(idx) => &line[..idx],
            None => line,
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            entries.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    entries
}
