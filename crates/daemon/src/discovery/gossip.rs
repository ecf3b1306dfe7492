//! In-mesh gossip
//!
//! Runs over the WireGuard overlay itself: a listener bound to the mesh
//! address on the gossip port, and unicast announcements to every active
//! peer's mesh IP. Gossip is an addition to the DHT, never a replacement;
//! it keeps the mesh converging when external discovery is unreachable.
//! In privacy mode received announcements continue along the
//! stem-or-fluff path.

use super::{ingest_announcement, DiscoveryLayer, MAX_DATAGRAM, READ_TIMEOUT};
use crate::privacy::PrivacyRouter;
use crate::state::DaemonState;
use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const SOURCE: &str = "gossip";

/// Backoff while the mesh interface is not yet addressable.
const BIND_RETRY: Duration = Duration::from_secs(5);

pub struct GossipLayer {
    state: DaemonState,
    privacy: Option<Arc<PrivacyRouter>>,
}

impl GossipLayer {
    pub fn new(state: DaemonState, privacy: Option<Arc<PrivacyRouter>>) -> Self {
        Self { state, privacy }
    }

    async fn bind(&self, shutdown: &CancellationToken) -> Option<UdpSocket> {
        let addr = SocketAddr::new(self.state.local.read().mesh_ip, self.state.keys.gossip_port);
        loop {
            match UdpSocket::bind(addr).await {
                Ok(socket) => {
                    info!(%addr, "gossip listener bound");
                    return Some(socket);
                }
                Err(e) => {
                    debug!(%addr, "gossip bind failed (interface not up yet?): {e}");
                }
            }
            tokio::select! {
                _ = shutdown.cancelled() => return None,
                _ = tokio::time::sleep(BIND_RETRY) => {}
            }
        }
    }

    /// Continue a received announcement along the dandelion path.
    async fn dandelion_forward(&self, sealed: &[u8]) {
        let Some(privacy) = &self.privacy else { return };
        if !privacy.should_forward(sealed) {
            return;
        }
        match privacy.current_relay() {
            Some(relay) if !privacy.should_fluff() => {
                send_to_peer(&self.state, sealed, relay.mesh_ip).await;
            }
            // Fluff phase, or no relay known: broadcast normally.
            _ => broadcast_to_active(&self.state, sealed).await,
        }
    }
}

/// Unicast a sealed message to one peer's mesh address.
pub async fn send_to_peer(state: &DaemonState, sealed: &[u8], mesh_ip: IpAddr) {
    let target = SocketAddr::new(mesh_ip, state.keys.gossip_port);
    match UdpSocket::bind("0.0.0.0:0").await {
        Ok(sock) => {
            if let Err(e) = sock.send_to(sealed, target).await {
                debug!(%target, "gossip send failed: {e}");
            }
        }
        Err(e) => debug!("gossip send socket: {e}"),
    }
}

/// Unicast a sealed message to every currently active peer.
pub async fn broadcast_to_active(state: &DaemonState, sealed: &[u8]) {
    for peer in state.store.get_active() {
        send_to_peer(state, sealed, peer.mesh_ip).await;
    }
}

#[async_trait]
impl DiscoveryLayer for GossipLayer {
    fn name(&self) -> &'static str {
        SOURCE
    }

    async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let Some(socket) = self.bind(&shutdown).await else {
            return;
        };
        info!("gossip discovery started");
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                recv = tokio::time::timeout(READ_TIMEOUT, socket.recv_from(&mut buf)) => {
                    match recv {
                        Ok(Ok((len, src))) => {
                            let data = &buf[..len];
                            if ingest_announcement(&self.state, src, data, SOURCE).is_some() {
                                self.dandelion_forward(data).await;
                            }
                        }
                        Ok(Err(e)) => {
                            warn!("gossip recv error: {e}");
                            tokio::time::sleep(READ_TIMEOUT).await;
                        }
                        Err(_) => {}
                    }
                }
            }
        }
        info!("gossip discovery stopped");
    }
}
