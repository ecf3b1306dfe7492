//! `wg` configuration driver
//!
//! Reads the live interface state from `wg show <iface> dump`, diffs it
//! against the desired configuration built from the peer store, and applies
//! the minimum set of `wg set` mutations. The preshared key never touches
//! argv; it is always piped through stdin.

use crate::exec::{look_path, CommandRunner};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};
use wgmesh_common::{restrict_permissions, Error, Result};

/// Keepalive applied to every mesh peer.
pub const PERSISTENT_KEEPALIVE_SECS: u16 = 5;

/// Interface-level desired state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WgInterface {
    pub private_key: String,
    pub listen_port: u16,
}

/// One peer as `wg` sees it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WgPeer {
    pub public_key: String,
    pub preshared_key: String,
    pub endpoint: Option<String>,
    pub allowed_ips: Vec<String>,
    pub persistent_keepalive: u16,
}

impl WgPeer {
    /// Configuration equality. AllowedIPs compare as a set; ordering in
    /// the dump is not meaningful.
    pub fn same_config(&self, other: &WgPeer) -> bool {
        self.preshared_key == other.preshared_key
            && self.endpoint == other.endpoint
            && self.persistent_keepalive == other.persistent_keepalive
            && self.allowed_ips.iter().collect::<BTreeSet<_>>()
                == other.allowed_ips.iter().collect::<BTreeSet<_>>()
    }
}

/// Full interface + peer configuration.
#[derive(Debug, Clone, Default)]
pub struct WgConfig {
    pub interface: WgInterface,
    pub peers: Vec<WgPeer>,
}

/// Minimal mutation set between two configurations.
#[derive(Debug, Clone, Default)]
pub struct WgDiff {
    pub interface_changed: bool,
    pub added: Vec<WgPeer>,
    pub removed: Vec<String>,
    pub modified: Vec<WgPeer>,
}

impl WgDiff {
    pub fn is_empty(&self) -> bool {
        !self.interface_changed
            && self.added.is_empty()
            && self.removed.is_empty()
            && self.modified.is_empty()
    }
}

/// Driver bound to one interface.
pub struct WgDriver {
    runner: Arc<dyn CommandRunner>,
    iface: String,
    /// Resolved once at construction.
    wg: String,
}

impl WgDriver {
    pub fn new(runner: Arc<dyn CommandRunner>, iface: impl Into<String>) -> Self {
        let wg = look_path("wg")
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "wg".to_string());
        Self {
            runner,
            iface: iface.into(),
            wg,
        }
    }

    pub fn iface(&self) -> &str {
        &self.iface
    }

    /// Read the live configuration.
    pub async fn current_config(&self) -> Result<WgConfig> {
        let out = self
            .runner
            .output(&self.wg, &["show", &self.iface, "dump"])
            .await
            .map_err(|e| Error::WireGuardApplyFailed(format!("wg show: {e}")))?;
        if !out.success {
            return Err(Error::WireGuardApplyFailed(format!(
                "wg show {} dump: {}",
                self.iface,
                out.stderr.trim()
            )));
        }
        parse_dump(&out.stdout)
    }

    /// Apply a diff with per-peer `wg set` invocations.
    pub async fn apply_diff(&self, diff: &WgDiff) -> Result<()> {
        for peer in diff.added.iter().chain(diff.modified.iter()) {
            self.set_peer(peer).await?;
        }
        for pubkey in &diff.removed {
            let out = self
                .runner
                .output(&self.wg, &["set", &self.iface, "peer", pubkey, "remove"])
                .await
                .map_err(|e| Error::WireGuardApplyFailed(format!("wg set remove: {e}")))?;
            if !out.success {
                return Err(Error::WireGuardApplyFailed(format!(
                    "wg set peer remove {pubkey}: {}",
                    out.stderr.trim()
                )));
            }
            info!(pubkey, "removed wireguard peer");
        }
        Ok(())
    }

    async fn set_peer(&self, peer: &WgPeer) -> Result<()> {
        let keepalive = peer.persistent_keepalive.to_string();
        let allowed = peer.allowed_ips.join(",");

        let mut args: Vec<&str> = vec!["set", &self.iface, "peer", &peer.public_key];
        if !peer.preshared_key.is_empty() {
            args.extend(["preshared-key", "/dev/stdin"]);
        }
        if let Some(endpoint) = &peer.endpoint {
            args.extend(["endpoint", endpoint]);
        }
        if peer.persistent_keepalive > 0 {
            args.extend(["persistent-keepalive", &keepalive]);
        }
        args.extend(["allowed-ips", &allowed]);

        let stdin = (!peer.preshared_key.is_empty()).then_some(peer.preshared_key.as_str());
        let out = self
            .runner
            .run(&self.wg, &args, stdin)
            .await
            .map_err(|e| Error::WireGuardApplyFailed(format!("wg set: {e}")))?;
        if !out.success {
            return Err(Error::WireGuardApplyFailed(format!(
                "wg set peer {}: {}",
                peer.public_key,
                out.stderr.trim()
            )));
        }
        debug!(pubkey = %peer.public_key, allowed_ips = %allowed, "configured wireguard peer");
        Ok(())
    }

    /// Point the interface at our private key and listen port.
    pub async fn set_interface(&self, private_key: &str, listen_port: u16) -> Result<()> {
        let port = listen_port.to_string();
        let out = self
            .runner
            .run(
                &self.wg,
                &[
                    "set",
                    &self.iface,
                    "private-key",
                    "/dev/stdin",
                    "listen-port",
                    &port,
                ],
                Some(private_key),
            )
            .await
            .map_err(|e| Error::WireGuardApplyFailed(format!("wg set interface: {e}")))?;
        if !out.success {
            return Err(Error::WireGuardApplyFailed(format!(
                "wg set {} private-key: {}",
                self.iface,
                out.stderr.trim()
            )));
        }
        Ok(())
    }

    /// Render a `wg-quick` compatible config. `PostUp`/`PreDown` carry the
    /// route commands for every peer network.
    pub fn render_quick_config(
        &self,
        config: &WgConfig,
        address: &str,
        peer_networks: &[String],
    ) -> String {
        let mut out = String::new();
        out.push_str("[Interface]\n");
        out.push_str(&format!("PrivateKey = {}\n", config.interface.private_key));
        out.push_str(&format!("Address = {address}\n"));
        out.push_str(&format!("ListenPort = {}\n", config.interface.listen_port));
        for net in peer_networks {
            out.push_str(&format!(
                "PostUp = ip route add {net} dev {} || true\n",
                self.iface
            ));
        }
        for net in peer_networks {
            out.push_str(&format!(
                "PreDown = ip route del {net} dev {} || true\n",
                self.iface
            ));
        }
        for peer in &config.peers {
            out.push('\n');
            out.push_str("[Peer]\n");
            out.push_str(&format!("PublicKey = {}\n", peer.public_key));
            if !peer.preshared_key.is_empty() {
                out.push_str(&format!("PresharedKey = {}\n", peer.preshared_key));
            }
            out.push_str(&format!("AllowedIPs = {}\n", peer.allowed_ips.join(", ")));
            if let Some(endpoint) = &peer.endpoint {
                out.push_str(&format!("Endpoint = {endpoint}\n"));
            }
            if peer.persistent_keepalive > 0 {
                out.push_str(&format!(
                    "PersistentKeepalive = {}\n",
                    peer.persistent_keepalive
                ));
            }
        }
        out
    }

    /// Write the persistent config with owner-only permissions.
    pub fn write_quick_config(
        &self,
        path: &Path,
        config: &WgConfig,
        address: &str,
        peer_networks: &[String],
    ) -> Result<()> {
        let rendered = self.render_quick_config(config, address, peer_networks);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, rendered)?;
        restrict_permissions(path)?;
        Ok(())
    }
}

/// Parse `wg show <iface> dump` output.
///
/// The first line is the interface: `private-key \t public-key \t
/// listen-port \t fwmark`. Each peer line is `pubkey \t psk \t endpoint \t
/// allowed-ips \t latest-handshake \t rx \t tx \t keepalive`. The psk
/// column must be kept, not skipped.
pub fn parse_dump(text: &str) -> Result<WgConfig> {
    let mut lines = text.lines().filter(|l| !l.trim().is_empty());

    let mut config = WgConfig::default();
    if let Some(header) = lines.next() {
        let fields: Vec<&str> = header.split('\t').collect();
        if fields.len() < 3 {
            return Err(Error::WireGuardApplyFailed(format!(
                "malformed dump header: {header:?}"
            )));
        }
        config.interface.private_key = none_to_empty(fields[0]).to_string();
        config.interface.listen_port = fields[2].parse().unwrap_or(0);
    }

    for line in lines {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 8 {
            return Err(Error::WireGuardApplyFailed(format!(
                "malformed dump peer line: {line:?}"
            )));
        }
        let allowed_ips = if fields[3] == "(none)" || fields[3].is_empty() {
            Vec::new()
        } else {
            fields[3].split(',').map(|s| s.trim().to_string()).collect()
        };
        config.peers.push(WgPeer {
            public_key: fields[0].to_string(),
            preshared_key: none_to_empty(fields[1]).to_string(),
            endpoint: match fields[2] {
                "(none)" | "" => None,
                ep => Some(ep.to_string()),
            },
            allowed_ips,
            persistent_keepalive: match fields[7] {
                "off" | "" => 0,
                n => n.parse().unwrap_or(0),
            },
        });
    }
    Ok(config)
}

fn none_to_empty(field: &str) -> &str {
    if field == "(none)" {
        ""
    } else {
        field
    }
}

/// Compute the mutation set from `current` to `desired`.
pub fn calculate_diff(current: &WgConfig, desired: &WgConfig) -> WgDiff {
    let current_by_key: HashMap<&str, &WgPeer> = current
        .peers
        .iter()
        .map(|p| (p.public_key.as_str(), p))
        .collect();
    let desired_by_key: HashMap<&str, &WgPeer> = desired
        .peers
        .iter()
        .map(|p| (p.public_key.as_str(), p))
        .collect();

    let mut diff = WgDiff {
        interface_changed: current.interface != desired.interface,
        ..Default::default()
    };

    for peer in &desired.peers {
        match current_by_key.get(peer.public_key.as_str()) {
            None => diff.added.push(peer.clone()),
            Some(have) if !have.same_config(peer) => diff.modified.push(peer.clone()),
            Some(_) => {}
        }
    }
    for peer in &current.peers {
        if !desired_by_key.contains_key(peer.public_key.as_str()) {
            diff.removed.push(peer.public_key.clone());
        }
    }
    diff
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::mock::MockRunner;
    use crate::exec::CommandOutput;

    const DUMP: &str = "cHJpdmtleQ==\tcHVia2V5\t51820\toff\n\
        peerA\tpskA\t203.0.113.1:51820\t10.42.0.1/32,192.168.1.0/24\t1700000000\t100\t200\t5\n\
        peerB\t(none)\t(none)\t10.42.0.2/32\t0\t0\t0\toff\n";

    #[test]
    fn test_parse_dump_keeps_psk_column() {
        let config = parse_dump(DUMP).unwrap();
        assert_eq!(config.interface.listen_port, 51820);
        assert_eq!(config.peers.len(), 2);

        let a = &config.peers[0];
        assert_eq!(a.public_key, "peerA");
        assert_eq!(a.preshared_key, "pskA");
        assert_eq!(a.endpoint.as_deref(), Some("203.0.113.1:51820"));
        assert_eq!(a.allowed_ips, vec!["10.42.0.1/32", "192.168.1.0/24"]);
        assert_eq!(a.persistent_keepalive, 5);

        let b = &config.peers[1];
        assert_eq!(b.preshared_key, "");
        assert!(b.endpoint.is_none());
        assert_eq!(b.persistent_keepalive, 0);
    }

    #[test]
    fn test_parse_dump_rejects_short_peer_line() {
        assert!(parse_dump("priv\tpub\t51820\toff\npeerA\tpsk\n").is_err());
    }

    fn peer(key: &str, allowed: &[&str]) -> WgPeer {
        WgPeer {
            public_key: key.to_string(),
            preshared_key: "psk".to_string(),
            endpoint: Some("203.0.113.1:51820".to_string()),
            allowed_ips: allowed.iter().map(|s| s.to_string()).collect(),
            persistent_keepalive: 5,
        }
    }

    #[test]
    fn test_allowed_ips_order_does_not_matter() {
        let a = peer("k", &["10.42.0.1/32", "192.168.1.0/24"]);
        let b = peer("k", &["192.168.1.0/24", "10.42.0.1/32"]);
        assert!(a.same_config(&b));

        let current = WgConfig {
            peers: vec![a],
            ..Default::default()
        };
        let desired = WgConfig {
            peers: vec![b],
            ..Default::default()
        };
        let diff = calculate_diff(&current, &desired);
        assert!(diff.added.is_empty());
        assert!(diff.modified.is_empty());
        assert!(diff.removed.is_empty());
    }

    #[test]
    fn test_diff_detects_add_remove_modify() {
        let current = WgConfig {
            peers: vec![peer("keep", &["10.42.0.1/32"]), peer("gone", &["10.42.0.2/32"])],
            ..Default::default()
        };
        let mut changed = peer("keep", &["10.42.0.1/32", "172.16.0.0/24"]);
        changed.endpoint = Some("198.51.100.9:51820".to_string());
        let desired = WgConfig {
            peers: vec![changed, peer("new", &["10.42.0.3/32"])],
            ..Default::default()
        };

        let diff = calculate_diff(&current, &desired);
        assert_eq!(diff.added.len(), 1);
        assert_eq!(diff.added[0].public_key, "new");
        assert_eq!(diff.modified.len(), 1);
        assert_eq!(diff.modified[0].public_key, "keep");
        assert_eq!(diff.removed, vec!["gone"]);
    }

    #[tokio::test]
    async fn test_apply_pipes_psk_via_stdin() {
        let runner = Arc::new(MockRunner::new());
        let driver = WgDriver::new(runner.clone(), "wg0");
        let diff = WgDiff {
            added: vec![peer("newpeer", &["10.42.0.9/32"])],
            ..Default::default()
        };
        driver.apply_diff(&diff).await.unwrap();

        let calls = runner.calls_matching("peer newpeer");
        assert_eq!(calls.len(), 1);
        let call = &calls[0];
        assert!(call.args.iter().any(|a| a == "preshared-key"));
        assert!(call.args.iter().any(|a| a == "/dev/stdin"));
        assert_eq!(call.stdin.as_deref(), Some("psk"));
        // The key itself never appears in argv.
        assert!(!call.args.iter().any(|a| a == "psk"));
    }

    #[tokio::test]
    async fn test_apply_removes_peers() {
        let runner = Arc::new(MockRunner::new());
        let driver = WgDriver::new(runner.clone(), "wg0");
        let diff = WgDiff {
            removed: vec!["oldpeer".to_string()],
            ..Default::default()
        };
        driver.apply_diff(&diff).await.unwrap();
        let calls = runner.calls_matching("peer oldpeer remove");
        assert_eq!(calls.len(), 1);
    }

    #[tokio::test]
    async fn test_apply_surfaces_failures() {
        let runner = Arc::new(MockRunner::new());
        runner.on("wg set", CommandOutput::fail("Unable to modify interface"));
        let driver = WgDriver::new(runner, "wg0");
        let diff = WgDiff {
            added: vec![peer("p", &["10.42.0.1/32"])],
            ..Default::default()
        };
        assert!(matches!(
            driver.apply_diff(&diff).await,
            Err(Error::WireGuardApplyFailed(_))
        ));
    }

    #[test]
    fn test_quick_config_render() {
        let runner = Arc::new(MockRunner::new());
        let driver = WgDriver::new(runner, "wg0");
        let config = WgConfig {
            interface: WgInterface {
                private_key: "PRIV".to_string(),
                listen_port: 51820,
            },
            peers: vec![peer("PUB", &["10.42.0.1/32", "192.168.1.0/24"])],
        };
        let rendered =
            driver.render_quick_config(&config, "10.42.0.7/16", &["192.168.1.0/24".to_string()]);
        assert!(rendered.contains("[Interface]"));
        assert!(rendered.contains("PrivateKey = PRIV"));
        assert!(rendered.contains("PostUp = ip route add 192.168.1.0/24 dev wg0"));
        assert!(rendered.contains("PreDown = ip route del 192.168.1.0/24 dev wg0"));
        assert!(rendered.contains("PresharedKey = psk"));
        assert!(rendered.contains("PersistentKeepalive = 5"));
    }
}
