//! LAN multicast discovery
//!
//! Zero-config peering on the local segment: listen on the derived
//! multicast group and port, and let the reconcile loop's broadcast send
//! our sealed announcement to the same group. Binding to the group address
//! keeps unicast traffic out of this socket; the peer exchange owns the
//! wildcard bind on the same port.

use super::{ingest_announcement, DiscoveryLayer, MAX_DATAGRAM, READ_TIMEOUT};
use crate::state::DaemonState;
use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wgmesh_common::Result;

pub const SOURCE: &str = "lan";

pub struct LanLayer {
    state: DaemonState,
    socket: Arc<UdpSocket>,
    group: Ipv4Addr,
    port: u16,
}

impl LanLayer {
    pub fn new(state: DaemonState) -> Result<Self> {
        let group = state.keys.multicast_group();
        let port = state.keys.gossip_port;
        let socket = join_group(group, port)?;
        info!(%group, port, "joined multicast group");
        Ok(Self {
            state,
            socket: Arc::new(socket),
            group,
            port,
        })
    }

    /// Destination for outbound multicast announcements.
    pub fn group_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.group, self.port))
    }

    /// Send one sealed announcement to the group from an ephemeral socket.
    pub async fn send_announcement(&self, sealed: &[u8]) {
        match UdpSocket::bind("0.0.0.0:0").await {
            Ok(sock) => {
                if let Err(e) = sock.send_to(sealed, self.group_addr()).await {
                    debug!("multicast send failed: {e}");
                }
            }
            Err(e) => debug!("multicast send socket: {e}"),
        }
    }
}

fn join_group(group: Ipv4Addr, port: u16) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    // Bind to the group itself so this socket only ever sees multicast.
    let bind_addr = if cfg!(target_os = "linux") {
        SocketAddrV4::new(group, port)
    } else {
        SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)
    };
    socket.bind(&SocketAddr::V4(bind_addr).into())?;
    socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
    socket.set_multicast_loop_v4(false)?;
    Ok(UdpSocket::from_std(socket.into())?)
}

#[async_trait]
impl DiscoveryLayer for LanLayer {
    fn name(&self) -> &'static str {
        SOURCE
    }

    async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!("lan discovery started");
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                recv = tokio::time::timeout(READ_TIMEOUT, self.socket.recv_from(&mut buf)) => {
                    match recv {
                        Ok(Ok((len, src))) => {
                            ingest_announcement(&self.state, src, &buf[..len], SOURCE);
                        }
                        Ok(Err(e)) => {
                            warn!("multicast recv error: {e}");
                            tokio::time::sleep(READ_TIMEOUT).await;
                        }
                        // Read deadline; loop back to observe cancellation.
                        Err(_) => {}
                    }
                }
            }
        }
        info!("lan discovery stopped");
    }
}
