//! Reconciliation loop
//!
//! The daemon's heartbeat. Each tick: snapshot the active peer set, build
//! the desired WireGuard configuration, apply the diff, converge the
//! routing table, sweep stale peers, and broadcast a fresh announcement.
//! WireGuard reconciliation runs before routes; routes depend on the
//! interface being configured. The loop's only exit is cancellation.

use crate::announce::Announcer;
use crate::state::DaemonState;
use crate::wg::driver::{self, WgConfig, WgInterface, WgPeer, PERSISTENT_KEEPALIVE_SECS};
use crate::wg::{RouteReconciler, WgDriver};
use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use wgmesh_common::routes::{normalize_network, RouteEntry};
use wgmesh_common::{PeerInfo, Result};

pub struct Reconciler {
    state: DaemonState,
    driver: WgDriver,
    routes: RouteReconciler,
    announcer: Option<Arc<Announcer>>,
    /// Poked by the SIGHUP handler for an immediate tick.
    nudge: Arc<Notify>,
}

impl Reconciler {
    pub fn new(state: DaemonState) -> Self {
        let iface = state.config.read().interface.clone();
        let runner = state.runner.clone();
        Self {
            driver: WgDriver::new(runner.clone(), iface.clone()),
            routes: RouteReconciler::new(runner, iface),
            announcer: None,
            nudge: Arc::new(Notify::new()),
            state,
        }
    }

    pub fn with_announcer(mut self, announcer: Arc<Announcer>) -> Self {
        self.announcer = Some(announcer);
        self
    }

    /// Handle for requesting an out-of-band reconcile.
    pub fn nudge_handle(&self) -> Arc<Notify> {
        self.nudge.clone()
    }

    /// Run until cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        info!("reconciler started");
        let interval = self.state.config.read().reconcile_interval;
        loop {
            if let Err(e) = self.tick().await {
                error!("reconciliation error: {e}");
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
                _ = self.nudge.notified() => {}
            }
        }
        info!("reconciler stopped");
    }

    /// One reconcile pass.
    pub async fn tick(&self) -> Result<()> {
        let active = self.state.store.get_active();
        let desired = self.desired_config(&active);
        let current = self.driver.current_config().await?;
        let diff = driver::calculate_diff(&current, &desired);

        if diff.interface_changed {
            self.driver
                .set_interface(&desired.interface.private_key, desired.interface.listen_port)
                .await?;
        }
        if !diff.is_empty() {
            self.driver.apply_diff(&diff).await?;
            info!(
                added = diff.added.len(),
                removed = diff.removed.len(),
                modified = diff.modified.len(),
                "applied wireguard changes"
            );
        }

        self.routes.reconcile(&desired_routes(&active)).await;

        let removed = self.state.store.cleanup_stale();
        for peer in &removed {
            // Gone from the desired set; the next tick's diff drops it
            // from the interface and the routing table.
            debug!(pubkey = %peer.wg_pubkey, "stale peer scheduled for removal");
        }

        if let Some(announcer) = &self.announcer {
            announcer.broadcast().await;
        }
        Ok(())
    }

    /// Desired WireGuard state for the active peer set.
    ///
    /// Mesh-IP collisions are resolved here: when two public keys claim
    /// one address, the longest-known claim wins and the newer one is not
    /// configured until staleness evicts the older.
    pub fn desired_config(&self, active: &[PeerInfo]) -> WgConfig {
        let local = self.state.local.read();
        let config = self.state.config.read();
        let psk = self.state.keys.psk_base64();

        let mut ordered: Vec<&PeerInfo> = active.iter().collect();
        ordered.sort_by(|a, b| {
            a.first_seen
                .cmp(&b.first_seen)
                .then_with(|| a.wg_pubkey.cmp(&b.wg_pubkey))
        });

        let mut claimed: HashMap<IpAddr, &str> = HashMap::new();
        let mut peers = Vec::new();
        for peer in ordered {
            if let Some(holder) = claimed.get(&peer.mesh_ip) {
                warn!(
                    mesh_ip = %peer.mesh_ip,
                    holder,
                    claimant = %peer.wg_pubkey,
                    "mesh IP collision, refusing to configure newer claimant"
                );
                continue;
            }
            claimed.insert(peer.mesh_ip, peer.wg_pubkey.as_str());

            let mut allowed_ips = vec![host_route(peer.mesh_ip)];
            allowed_ips.extend(peer.routable_networks.iter().map(|n| normalize_network(n)));
            peers.push(WgPeer {
                public_key: peer.wg_pubkey.clone(),
                preshared_key: psk.clone(),
                endpoint: peer.endpoint.clone(),
                allowed_ips,
                persistent_keepalive: PERSISTENT_KEEPALIVE_SECS,
            });
        }

        WgConfig {
            interface: WgInterface {
                private_key: local.wg_privkey.clone(),
                listen_port: config.listen_port,
            },
            peers,
        }
    }
}

/// Routing entries implied by the active peers' routable networks.
pub fn desired_routes(active: &[PeerInfo]) -> Vec<RouteEntry> {
    let mut seen = BTreeSet::new();
    let mut routes = Vec::new();
    for peer in active {
        for network in &peer.routable_networks {
            let normalized = normalize_network(network);
            if seen.insert(normalized.clone()) {
                routes.push(RouteEntry::direct(normalized));
            }
        }
    }
    routes
}

fn host_route(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => format!("{v4}/32"),
        IpAddr::V6(v6) => format!("{v6}/128"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DaemonConfig;
    use crate::exec::mock::MockRunner;
    use crate::exec::CommandOutput;
    use base64::Engine;

    const EMPTY_DUMP: &str = "cHJpdg==\tcHVi\t51820\toff\n";

    fn pubkey(n: u8) -> String {
        base64::engine::general_purpose::STANDARD.encode([n; 32])
    }

    fn peer(n: u8, networks: &[&str]) -> PeerInfo {
        PeerInfo {
            wg_pubkey: pubkey(n),
            hostname: None,
            mesh_ip: format!("10.42.0.{n}").parse().unwrap(),
            endpoint: Some(format!("203.0.113.{n}:51820")),
            routable_networks: networks.iter().map(|s| s.to_string()).collect(),
            last_seen: 0,
            discovered_via: Default::default(),
            latency_ms: None,
            first_seen: n as i64,
        }
    }

    fn reconciler_with(runner: Arc<MockRunner>, dir: &std::path::Path) -> Reconciler {
        let state = DaemonState::new(
            DaemonConfig {
                secret: "reconcile-test-secret".to_string(),
                interface: "wg0".to_string(),
                state_dir: dir.to_path_buf(),
                ..Default::default()
            },
            runner,
        )
        .unwrap();
        Reconciler::new(state)
    }

    #[tokio::test]
    async fn test_tick_converges_empty_interface() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(MockRunner::new());
        runner.on("show wg0 dump", CommandOutput::ok(EMPTY_DUMP));
        let reconciler = reconciler_with(runner.clone(), dir.path());

        for n in 1..=3 {
            reconciler
                .state
                .store
                .update(peer(n, &["192.168.1.0/24"]), "lan");
        }
        reconciler.tick().await.unwrap();

        // One wg set per peer, with mesh /32 plus the routable network.
        for n in 1..=3u8 {
            let calls = runner.calls_matching(&format!("peer {}", pubkey(n)));
            assert_eq!(calls.len(), 1, "peer {n} must be configured exactly once");
            let allowed = calls[0].args.last().unwrap().clone();
            assert!(allowed.contains(&format!("10.42.0.{n}/32")));
            assert!(allowed.contains("192.168.1.0/24"));
            // PSK piped, never on argv.
            assert!(calls[0].stdin.is_some());
        }

        // Route for the advertised network was installed.
        assert!(!runner.calls_matching("route add 192.168.1.0/24").is_empty());
    }

    #[tokio::test]
    async fn test_tick_removes_departed_peer() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(MockRunner::new());
        let gone = pubkey(9);
        let dump = format!(
            "cHJpdg==\tcHVi\t51820\toff\n{gone}\tpsk\t(none)\t10.42.0.9/32\t0\t0\t0\t5\n"
        );
        runner.on("show wg0 dump", CommandOutput::ok(dump));
        let reconciler = reconciler_with(runner.clone(), dir.path());

        // Store no longer tracks the peer.
        reconciler.tick().await.unwrap();
        assert_eq!(
            runner.calls_matching(&format!("peer {gone} remove")).len(),
            1
        );
    }

    #[tokio::test]
    async fn test_mesh_ip_collision_keeps_older_claim() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(MockRunner::new());
        let reconciler = reconciler_with(runner, dir.path());

        let older = peer(1, &[]);
        let mut newer = peer(2, &[]);
        newer.mesh_ip = older.mesh_ip;
        newer.first_seen = older.first_seen + 100;

        let desired = reconciler.desired_config(&[newer.clone(), older.clone()]);
        assert_eq!(desired.peers.len(), 1);
        assert_eq!(desired.peers[0].public_key, older.wg_pubkey);
    }

    #[tokio::test]
    async fn test_desired_config_always_includes_psk() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(MockRunner::new());
        let reconciler = reconciler_with(runner, dir.path());
        let desired = reconciler.desired_config(&[peer(1, &[])]);
        assert_eq!(
            desired.peers[0].preshared_key,
            reconciler.state.keys.psk_base64()
        );
        assert_eq!(desired.peers[0].persistent_keepalive, 5);
    }

    #[test]
    fn test_desired_routes_dedupes_networks() {
        let peers = vec![
            peer(1, &["192.168.1.0/24", "10.8.0.0/16"]),
            peer(2, &["192.168.1.0/24"]),
        ];
        let routes = desired_routes(&peers);
        assert_eq!(
            routes,
            vec![
                RouteEntry::direct("192.168.1.0/24"),
                RouteEntry::direct("10.8.0.0/16"),
            ]
        );
    }
}
