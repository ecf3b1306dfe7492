//! Shared data model for wgmesh
//!
//! `LocalNode` lives here as a dependency-free leaf so the daemon, the
//! centralized tooling, and the CLI all share one definition.

use crate::{Error, Result};
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// The single protocol version checked on every inbound message.
pub const PROTOCOL_VERSION: u32 = 1;

/// Upper bound on advertised routable networks per announcement.
pub const MAX_ROUTABLE_NETWORKS: usize = 64;

/// Upper bound on known peers piggybacked on a REPLY.
pub const MAX_KNOWN_PEERS: usize = 16;

/// RFC 1035 hostname length cap.
pub const MAX_HOSTNAME_LEN: usize = 253;

/// This node's mesh identity, persisted to `<state-dir>/<iface>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalNode {
    pub wg_pubkey: String,
    pub wg_privkey: String,
    pub mesh_ip: IpAddr,
    #[serde(default)]
    pub wg_endpoint: Option<String>,
    pub hostname: String,
    #[serde(default)]
    pub routable_networks: Vec<String>,
}

impl LocalNode {
    /// Load the node identity from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Persist the node identity with owner-only permissions.
    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, data)?;
        restrict_permissions(path)?;
        Ok(())
    }
}

/// Tighten a state file to mode 0600.
pub fn restrict_permissions(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

/// A remote peer as tracked by the peer store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    pub wg_pubkey: String,
    #[serde(default)]
    pub hostname: Option<String>,
    pub mesh_ip: IpAddr,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub routable_networks: Vec<String>,
    /// Unix seconds of the most recent observation from any source.
    pub last_seen: i64,
    /// Union of every source tag that has ever reported this peer.
    #[serde(default)]
    pub discovered_via: BTreeSet<String>,
    /// Exchange-measured round-trip time, when known.
    #[serde(default)]
    pub latency_ms: Option<u64>,
    /// Unix seconds of the first observation; store metadata, drives the
    /// mesh-IP collision policy.
    #[serde(default)]
    pub first_seen: i64,
}

impl PeerInfo {
    /// Build store-ready peer state from a validated announcement.
    pub fn from_announcement(ann: &PeerAnnouncement) -> Self {
        Self {
            wg_pubkey: ann.wg_pubkey.clone(),
            hostname: if ann.hostname.is_empty() {
                None
            } else {
                Some(ann.hostname.clone())
            },
            mesh_ip: ann.mesh_ip,
            endpoint: ann.wg_endpoint.clone(),
            routable_networks: ann.routable_networks.clone(),
            last_seen: ann.timestamp,
            discovered_via: BTreeSet::new(),
            latency_ms: None,
            first_seen: ann.timestamp,
        }
    }
}

/// A peer referenced from inside another peer's announcement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnownPeer {
    pub wg_pubkey: String,
    pub mesh_ip: IpAddr,
    #[serde(default)]
    pub endpoint: Option<String>,
}

impl KnownPeer {
    pub fn validate(&self) -> Result<()> {
        validate_pubkey(&self.wg_pubkey)?;
        if let Some(ep) = &self.endpoint {
            validate_endpoint(ep)?;
        }
        Ok(())
    }
}

/// The announcement every discovery layer seals and sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerAnnouncement {
    pub protocol: u32,
    pub wg_pubkey: String,
    pub mesh_ip: IpAddr,
    #[serde(default)]
    pub wg_endpoint: Option<String>,
    #[serde(default)]
    pub routable_networks: Vec<String>,
    #[serde(default)]
    pub known_peers: Vec<KnownPeer>,
    #[serde(default)]
    pub hostname: String,
    /// Unix seconds, stamped at seal time.
    pub timestamp: i64,
}

impl PeerAnnouncement {
    /// Structural validation applied to every announcement before it can
    /// reach the peer store.
    pub fn validate(&self) -> Result<()> {
        validate_pubkey(&self.wg_pubkey)?;
        if let Some(ep) = &self.wg_endpoint {
            validate_endpoint(ep)?;
        }
        if self.routable_networks.len() > MAX_ROUTABLE_NETWORKS {
            return Err(Error::InvalidAnnouncement(format!(
                "too many routable networks: {}",
                self.routable_networks.len()
            )));
        }
        for net in &self.routable_networks {
            validate_cidr(net)?;
        }
        validate_hostname(&self.hostname)?;
        if self.known_peers.len() > MAX_KNOWN_PEERS {
            return Err(Error::InvalidAnnouncement(format!(
                "too many known peers: {}",
                self.known_peers.len()
            )));
        }
        for kp in &self.known_peers {
            kp.validate()?;
        }
        Ok(())
    }
}

/// Sent when a node leaves the mesh; gated by a tighter freshness window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoodbyeMessage {
    pub protocol: u32,
    pub wg_pubkey: String,
    /// Unix seconds, stamped at seal time.
    pub timestamp: i64,
}

impl GoodbyeMessage {
    pub fn validate(&self) -> Result<()> {
        validate_pubkey(&self.wg_pubkey)
    }
}

/// WireGuard public keys are 32 bytes, always 44 characters in base64.
pub fn validate_pubkey(key: &str) -> Result<()> {
    if key.len() != 44 {
        return Err(Error::InvalidAnnouncement(format!(
            "pubkey must be 44 base64 characters, got {}",
            key.len()
        )));
    }
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(key)
        .map_err(|e| Error::InvalidAnnouncement(format!("pubkey is not base64: {e}")))?;
    if decoded.len() != 32 {
        return Err(Error::InvalidAnnouncement(format!(
            "pubkey decodes to {} bytes, want 32",
            decoded.len()
        )));
    }
    Ok(())
}

/// Endpoints are `host:port` with a non-zero port. The host may be a DNS
/// name, an IPv4 address, or a bracketed IPv6 address.
pub fn validate_endpoint(endpoint: &str) -> Result<()> {
    let (host, port) = endpoint
        .rsplit_once(':')
        .ok_or_else(|| Error::InvalidAnnouncement(format!("endpoint missing port: {endpoint}")))?;
    if host.is_empty() {
        return Err(Error::InvalidAnnouncement(format!(
            "endpoint missing host: {endpoint}"
        )));
    }
    let port: u16 = port
        .parse()
        .map_err(|_| Error::InvalidAnnouncement(format!("invalid endpoint port: {endpoint}")))?;
    if port == 0 {
        return Err(Error::InvalidAnnouncement(format!(
            "endpoint port must be non-zero: {endpoint}"
        )));
    }
    Ok(())
}

pub fn validate_cidr(net: &str) -> Result<()> {
    ipnetwork::IpNetwork::from_str(net)
        .map_err(|e| Error::InvalidAnnouncement(format!("invalid CIDR {net}: {e}")))?;
    Ok(())
}

pub fn validate_hostname(hostname: &str) -> Result<()> {
    if hostname.len() > MAX_HOSTNAME_LEN {
        return Err(Error::InvalidAnnouncement(format!(
            "hostname too long: {} bytes",
            hostname.len()
        )));
    }
    if let Some(b) = hostname.bytes().find(|b| !(0x20..=0x7e).contains(b)) {
        return Err(Error::InvalidAnnouncement(format!(
            "hostname contains non-printable byte 0x{b:02x}"
        )));
    }
    Ok(())
}

/// Secret rotation progress, persisted by the operator tooling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RotationState {
    pub old_secret: String,
    pub new_secret: String,
    #[serde(with = "human_duration")]
    pub grace_period: Duration,
    pub started_at: i64,
    pub completed: bool,
}

impl RotationState {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)?;
        Ok(serde_json::from_slice(&data)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, data)?;
        restrict_permissions(path)?;
        Ok(())
    }
}

/// Serialize durations the way operators write them: "24h", "90m", "30s".
/// The deserializer accepts the same forms plus bare seconds.
pub mod human_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format(d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    pub fn format(d: &Duration) -> String {
        let secs = d.as_secs();
        if secs > 0 && secs % 3600 == 0 {
            format!("{}h", secs / 3600)
        } else if secs > 0 && secs % 60 == 0 {
            format!("{}m", secs / 60)
        } else {
            format!("{secs}s")
        }
    }

    pub fn parse(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        let (digits, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
            Some(idx) => s.split_at(idx),
            None => (s, "s"),
        };
        let n: u64 = digits
            .parse()
            .map_err(|_| format!("invalid duration: {s}"))?;
        let secs = match unit {
            "s" | "" => n,
            "m" => n * 60,
            "h" => n * 3600,
            _ => return Err(format!("invalid duration unit: {s}")),
        };
        Ok(Duration::from_secs(secs))
    }
}
