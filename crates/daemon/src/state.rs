//! Shared daemon state
//!
//! One cloneable handle bundling everything the background tasks need:
//! derived keys, the local node identity, the peer store, the rate
//! limiter, and the command runner. The peer store carries its own lock;
//! the config and local node sit behind a read-write lock for SIGHUP
//! reloads.

use crate::config::DaemonConfig;
use crate::exec::CommandRunner;
use crate::ratelimit::{RateLimiter, RateLimiterConfig};
use crate::store::{PeerStore, StoreConfig};
use base64::Engine;
use parking_lot::RwLock;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;
use wgmesh_common::{DerivedKeys, KnownPeer, LocalNode, PeerAnnouncement, Result, PROTOCOL_VERSION};
use x25519_dalek::{PublicKey, StaticSecret};

#[derive(Clone)]
pub struct DaemonState {
    pub config: Arc<RwLock<DaemonConfig>>,
    pub keys: Arc<DerivedKeys>,
    pub local: Arc<RwLock<LocalNode>>,
    pub store: Arc<PeerStore>,
    pub limiter: Arc<RateLimiter>,
    pub runner: Arc<dyn CommandRunner>,
    pub started_at: Instant,
}

impl DaemonState {
    /// Derive keys, load or create the node identity, and build the
    /// shared stores.
    pub fn new(config: DaemonConfig, runner: Arc<dyn CommandRunner>) -> Result<Self> {
        let keys = Arc::new(wgmesh_common::derive(&config.secret)?);
        std::fs::create_dir_all(&config.state_dir)?;

        let node_path = config.node_state_path();
        let local = if node_path.exists() {
            let mut node = LocalNode::load(&node_path)?;
            info!(pubkey = %node.wg_pubkey, mesh_ip = %node.mesh_ip, "loaded node identity");
            // The endpoint and advertised routes follow the current run.
            node.wg_endpoint = local_endpoint(config.listen_port);
            node.routable_networks = config.advertise_routes.clone();
            node
        } else {
            let (privkey, pubkey) = generate_keypair();
            let node = LocalNode {
                mesh_ip: IpAddr::V4(keys.mesh_ip_for(&pubkey)),
                wg_pubkey: pubkey,
                wg_privkey: privkey,
                wg_endpoint: local_endpoint(config.listen_port),
                hostname: local_hostname(),
                routable_networks: config.advertise_routes.clone(),
            };
            node.save(&node_path)?;
            info!(pubkey = %node.wg_pubkey, mesh_ip = %node.mesh_ip, "generated node identity");
            node
        };

        let store = PeerStore::new(StoreConfig {
            dead_timeout: config.reconcile_interval * 2,
            ..Default::default()
        });

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            keys,
            local: Arc::new(RwLock::new(local)),
            store: Arc::new(store),
            limiter: Arc::new(RateLimiter::new(RateLimiterConfig::default())),
            runner,
            started_at: Instant::now(),
        })
    }

    /// Snapshot this node's announcement.
    pub fn local_announcement(&self, known_peers: Vec<KnownPeer>) -> PeerAnnouncement {
        let local = self.local.read();
        let config = self.config.read();
        PeerAnnouncement {
            protocol: PROTOCOL_VERSION,
            wg_pubkey: local.wg_pubkey.clone(),
            mesh_ip: local.mesh_ip,
            wg_endpoint: local.wg_endpoint.clone(),
            routable_networks: config.advertise_routes.clone(),
            known_peers,
            hostname: local.hostname.clone(),
            timestamp: chrono::Utc::now().timestamp(),
        }
    }

    pub fn local_pubkey(&self) -> String {
        self.local.read().wg_pubkey.clone()
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

/// Fresh Curve25519 keypair in WireGuard's base64 form.
pub fn generate_keypair() -> (String, String) {
    let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
    let public = PublicKey::from(&secret);
    let b64 = base64::engine::general_purpose::STANDARD;
    (b64.encode(secret.to_bytes()), b64.encode(public.to_bytes()))
}

fn local_hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "wgmesh-node".to_string())
}

/// Best local address for the announced WireGuard endpoint, found by the
/// routing table (no packets are sent).
fn local_endpoint(listen_port: u16) -> Option<String> {
    let sock = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    sock.connect("8.8.8.8:53").ok()?;
    let ip = sock.local_addr().ok()?.ip();
    Some(format!("{ip}:{listen_port}"))
}
