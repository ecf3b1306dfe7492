//! Direct peer exchange
//!
//! A UDP handshake on the gossip port: HELLO carries the sender's
//! announcement, REPLY carries ours plus a bounded list of known peers,
//! and GOODBYE (a bare goodbye payload under the same envelope, gated by
//! the tight freshness window) evicts a departing peer. The DHT feeds
//! endpoints here for authentication; probing also measures round-trip
//! time, which becomes the peer's recorded latency.
//!
//! The listener spawns one task per datagram, bounded by the handler pool.

use super::{DiscoveryLayer, MAX_DATAGRAM, READ_TIMEOUT};
use crate::ratelimit::HandlerPool;
use crate::state::DaemonState;
use async_trait::async_trait;
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wgmesh_common::{
    envelope, Error, GoodbyeMessage, KnownPeer, PeerAnnouncement, PeerInfo, Result,
    MAX_KNOWN_PEERS, PROTOCOL_VERSION,
};

pub const SOURCE: &str = "exchange";

/// How long a probe waits for the REPLY.
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// HELLO and REPLY are both announcements; GOODBYE is structurally
/// distinct (no mesh address), so the payload shape disambiguates.
#[derive(Deserialize)]
#[serde(untagged)]
enum InboundMessage {
    Announcement(PeerAnnouncement),
    Goodbye(GoodbyeMessage),
}

pub struct ExchangeLayer {
    state: DaemonState,
    pool: HandlerPool,
    socket: Arc<UdpSocket>,
}

impl ExchangeLayer {
    pub async fn new(state: DaemonState, pool: HandlerPool) -> Result<Self> {
        let port = state.keys.gossip_port;
        let socket = UdpSocket::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port))
            .await
            .map_err(|e| Error::Internal(format!("failed to bind exchange listener: {e}")))?;
        info!(port, "exchange listener bound");
        Ok(Self {
            state,
            pool,
            socket: Arc::new(socket),
        })
    }

    /// Authenticated handshake with a raw endpoint. On success the remote
    /// announcement and its piggybacked known peers are in the store, and
    /// the remote's public key is returned so callers can attribute the
    /// contact to their own discovery source.
    pub async fn probe(&self, target: SocketAddr) -> Result<Option<String>> {
        let hello = self.state.local_announcement(Vec::new());
        let sealed = envelope::seal_announcement(&hello, &self.state.keys.gossip_key)?;

        let sock = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| Error::Internal(format!("probe socket: {e}")))?;
        let started = Instant::now();
        sock.send_to(&sealed, target)
            .await
            .map_err(|e| Error::Internal(format!("probe send to {target}: {e}")))?;

        let mut buf = vec![0u8; MAX_DATAGRAM];
        let (len, src) = tokio::time::timeout(PROBE_TIMEOUT, sock.recv_from(&mut buf))
            .await
            .map_err(|_| Error::Internal(format!("probe to {target} timed out")))?
            .map_err(|e| Error::Internal(format!("probe recv: {e}")))?;
        let rtt_ms = started.elapsed().as_millis() as u64;

        let reply = envelope::open_announcement(&buf[..len], &self.state.keys.gossip_key)?;
        if reply.wg_pubkey == self.state.local.read().wg_pubkey {
            return Ok(None);
        }
        debug!(%src, pubkey = %reply.wg_pubkey, rtt_ms, "probe replied");

        self.ingest_reply(&reply, target);
        self.state.store.set_latency(&reply.wg_pubkey, rtt_ms);
        Ok(Some(reply.wg_pubkey))
    }

    fn ingest_reply(&self, reply: &PeerAnnouncement, target: SocketAddr) {
        let mut peer = PeerInfo::from_announcement(reply);
        // A peer that does not know its own public address is still
        // reachable at the address we just probed.
        if peer.endpoint.is_none() {
            peer.endpoint = Some(target.to_string());
        }
        self.state.store.update(peer, SOURCE);

        let local_pubkey = self.state.local.read().wg_pubkey.clone();
        for known in reply.known_peers.iter().take(MAX_KNOWN_PEERS) {
            if known.wg_pubkey == local_pubkey {
                continue;
            }
            let peer = PeerInfo {
                wg_pubkey: known.wg_pubkey.clone(),
                hostname: None,
                mesh_ip: known.mesh_ip,
                endpoint: known.endpoint.clone(),
                routable_networks: Vec::new(),
                last_seen: 0,
                discovered_via: Default::default(),
                latency_ms: None,
                first_seen: 0,
            };
            self.state.store.update(peer, SOURCE);
        }
    }

    /// Build the REPLY announcement with a sample of known peers.
    fn reply_announcement(&self) -> PeerAnnouncement {
        let known: Vec<KnownPeer> = self
            .state
            .store
            .get_active()
            .into_iter()
            .take(MAX_KNOWN_PEERS)
            .map(|p| KnownPeer {
                wg_pubkey: p.wg_pubkey,
                mesh_ip: p.mesh_ip,
                endpoint: p.endpoint,
            })
            .collect();
        self.state.local_announcement(known)
    }

    /// Handle one inbound datagram; runs on a pooled task.
    async fn handle_datagram(self: Arc<Self>, src: SocketAddr, data: Vec<u8>) {
        let plaintext = match envelope::open_bytes(&data, &self.state.keys.gossip_key) {
            Ok(p) => p,
            Err(e) => {
                debug!(%src, "dropping exchange datagram: {e}");
                return;
            }
        };
        let message: InboundMessage = match serde_json::from_slice(&plaintext) {
            Ok(m) => m,
            Err(e) => {
                debug!(%src, "malformed exchange payload: {e}");
                return;
            }
        };

        let now = chrono::Utc::now().timestamp();
        match message {
            InboundMessage::Announcement(hello) => {
                if let Err(e) = envelope::check_announcement_at(&hello, now) {
                    debug!(%src, "rejecting HELLO: {e}");
                    return;
                }
                if hello.wg_pubkey == self.state.local.read().wg_pubkey {
                    return;
                }
                let mut peer = PeerInfo::from_announcement(&hello);
                if peer.endpoint.is_none() {
                    peer.endpoint = Some(src.to_string());
                }
                self.state.store.update(peer, SOURCE);

                let reply = self.reply_announcement();
                match envelope::seal_announcement(&reply, &self.state.keys.gossip_key) {
                    Ok(sealed) => {
                        if let Err(e) = self.socket.send_to(&sealed, src).await {
                            debug!(%src, "REPLY send failed: {e}");
                        }
                    }
                    Err(e) => warn!("failed to seal REPLY: {e}"),
                }
            }
            InboundMessage::Goodbye(goodbye) => {
                if let Err(e) = envelope::check_goodbye_at(&goodbye, now) {
                    debug!(%src, "rejecting GOODBYE: {e}");
                    return;
                }
                if self.state.store.remove(&goodbye.wg_pubkey).is_some() {
                    info!(pubkey = %goodbye.wg_pubkey, "peer said goodbye");
                }
            }
        }
    }

    /// Tell reachable peers we are leaving. Best-effort, used at shutdown.
    pub async fn send_goodbye(&self) {
        let goodbye = GoodbyeMessage {
            protocol: PROTOCOL_VERSION,
            wg_pubkey: self.state.local.read().wg_pubkey.clone(),
            timestamp: 0,
        };
        let sealed = match envelope::seal_goodbye(&goodbye, &self.state.keys.gossip_key) {
            Ok(s) => s,
            Err(e) => {
                warn!("failed to seal GOODBYE: {e}");
                return;
            }
        };
        let port = self.state.keys.gossip_port;
        for peer in self.state.store.get_active() {
            // Exchange listeners all sit on the derived port; aim at the
            // peer's known public address.
            let Some(endpoint) = &peer.endpoint else {
                continue;
            };
            let Some(ip) = endpoint
                .rsplit_once(':')
                .and_then(|(host, _)| host.parse::<IpAddr>().ok())
            else {
                continue;
            };
            let _ = self.socket.send_to(&sealed, SocketAddr::new(ip, port)).await;
        }
    }
}

#[async_trait]
impl DiscoveryLayer for ExchangeLayer {
    fn name(&self) -> &'static str {
        SOURCE
    }

    async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!("peer exchange started");
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                recv = tokio::time::timeout(READ_TIMEOUT, self.socket.recv_from(&mut buf)) => {
                    match recv {
                        Ok(Ok((len, src))) => {
                            // Gate before decrypting, then bound concurrency.
                            if !self.state.limiter.allow(src.ip()) {
                                continue;
                            }
                            let Some(permit) = self.pool.try_acquire() else {
                                continue;
                            };
                            let layer = self.clone();
                            let data = buf[..len].to_vec();
                            tokio::spawn(async move {
                                let _permit = permit;
                                layer.handle_datagram(src, data).await;
                            });
                        }
                        Ok(Err(e)) => {
                            warn!("exchange recv error: {e}");
                            tokio::time::sleep(READ_TIMEOUT).await;
                        }
                        Err(_) => {}
                    }
                }
            }
        }
        info!("peer exchange stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DaemonConfig;
    use crate::exec::mock::MockRunner;

    fn state_with_secret(dir: &std::path::Path, secret: &str, iface: &str) -> DaemonState {
        DaemonState::new(
            DaemonConfig {
                secret: secret.to_string(),
                interface: iface.to_string(),
                state_dir: dir.to_path_buf(),
                ..Default::default()
            },
            Arc::new(MockRunner::new()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_hello_reply_handshake() {
        let dir = tempfile::tempdir().unwrap();
        // Two identities in one mesh; both states share the derived keys.
        let responder_state = state_with_secret(dir.path(), "exchange-test-secret", "wg0");
        let prober_state = state_with_secret(dir.path(), "exchange-test-secret", "wg1");

        let responder = Arc::new(
            ExchangeLayer::new(responder_state.clone(), HandlerPool::new(4))
                .await
                .unwrap(),
        );
        let listen_addr: SocketAddr = format!(
            "127.0.0.1:{}",
            responder.socket.local_addr().unwrap().port()
        )
        .parse()
        .unwrap();

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(responder.clone().run(shutdown.clone()));

        // The prober cannot reuse the derived port; probe uses its own
        // ephemeral socket so only the listener address matters.
        let prober = ExchangeLayer {
            state: prober_state.clone(),
            pool: HandlerPool::new(4),
            socket: Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap()),
        };
        prober.probe(listen_addr).await.unwrap();

        // Prober learned the responder, with measured latency.
        let learned = prober_state.store.get(&responder_state.local_pubkey()).unwrap();
        assert!(learned.discovered_via.contains(SOURCE));
        assert!(learned.latency_ms.is_some());

        // Responder learned the prober from the HELLO.
        let back = responder_state.store.get(&prober_state.local_pubkey()).unwrap();
        assert!(back.discovered_via.contains(SOURCE));

        shutdown.cancel();
        let _ = task.await;
    }

    #[tokio::test]
    async fn test_goodbye_removes_peer() {
        let dir = tempfile::tempdir().unwrap();
        let responder_state = state_with_secret(dir.path(), "goodbye-test-secret", "wg0");
        let leaver_state = state_with_secret(dir.path(), "goodbye-test-secret", "wg1");

        let responder = Arc::new(
            ExchangeLayer::new(responder_state.clone(), HandlerPool::new(4))
                .await
                .unwrap(),
        );

        // Responder currently tracks the leaver.
        let ann = leaver_state.local_announcement(Vec::new());
        responder_state
            .store
            .update(PeerInfo::from_announcement(&ann), SOURCE);
        assert!(responder_state.store.get(&leaver_state.local_pubkey()).is_some());

        let goodbye = GoodbyeMessage {
            protocol: PROTOCOL_VERSION,
            wg_pubkey: leaver_state.local_pubkey(),
            timestamp: 0,
        };
        let sealed =
            envelope::seal_goodbye(&goodbye, &responder_state.keys.gossip_key).unwrap();
        let src: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        responder.clone().handle_datagram(src, sealed).await;

        assert!(responder_state.store.get(&leaver_state.local_pubkey()).is_none());
    }

    #[tokio::test]
    async fn test_reply_carries_known_peers() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with_secret(dir.path(), "known-peers-secret", "wg0");
        let layer = Arc::new(
            ExchangeLayer::new(state.clone(), HandlerPool::new(4))
                .await
                .unwrap(),
        );

        let other = state_with_secret(dir.path(), "known-peers-secret", "wg1");
        let ann = other.local_announcement(Vec::new());
        state.store.update(PeerInfo::from_announcement(&ann), "lan");

        let reply = layer.reply_announcement();
        assert_eq!(reply.known_peers.len(), 1);
        assert_eq!(reply.known_peers[0].wg_pubkey, other.local_pubkey());
        reply.validate().unwrap();
    }
}
