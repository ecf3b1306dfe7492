//! Peer discovery layers
//!
//! Five independently scheduled producers share one contract: every
//! outbound message is sealed with the gossip key, and every inbound
//! message that opens successfully lands in the peer store tagged with the
//! layer's source name. Layers never talk to each other except through the
//! store, with one exception: the DHT hands raw endpoints to the peer
//! exchange for authentication.

pub mod dht;
pub mod exchange;
pub mod gossip;
pub mod lan;
pub mod registry;

use crate::state::DaemonState;
use async_trait::async_trait;
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use wgmesh_common::{envelope, PeerAnnouncement, PeerInfo};

/// Per-listener read deadline so cancellation is observed promptly.
pub const READ_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(1);

/// Maximum UDP datagram the listeners accept.
pub const MAX_DATAGRAM: usize = 65536;

/// One discovery producer.
#[async_trait]
pub trait DiscoveryLayer: Send + Sync {
    /// Source tag recorded in `discovered_via`.
    fn name(&self) -> &'static str;

    /// Run until the token is cancelled. Errors are handled internally;
    /// a layer failing must not take the daemon down.
    async fn run(self: std::sync::Arc<Self>, shutdown: CancellationToken);
}

/// The shared inbound path: rate-limit gate, envelope open, self filter,
/// store update. Returns the announcement when it was accepted.
pub(crate) fn ingest_announcement(
    state: &DaemonState,
    src: SocketAddr,
    data: &[u8],
    source: &'static str,
) -> Option<PeerAnnouncement> {
    if !state.limiter.allow(src.ip()) {
        return None;
    }
    match envelope::open_announcement(data, &state.keys.gossip_key) {
        Ok(announcement) => {
            if announcement.wg_pubkey == state.local.read().wg_pubkey {
                return None;
            }
            let peer = PeerInfo::from_announcement(&announcement);
            state.store.update(peer, source);
            Some(announcement)
        }
        Err(e) => {
            debug!(%src, source, "dropping datagram: {e}");
            None
        }
    }
}
