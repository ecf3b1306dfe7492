//! Mainline DHT discovery
//!
//! The 20-byte network ID doubles as a BitTorrent infohash. Each cycle the
//! daemon announces itself under that infohash with the gossip port, then
//! queries for other announcers. Raw endpoints found this way prove
//! nothing; they are handed to the peer exchange, whose authenticated
//! handshake is what actually populates the store. The DHT client is
//! synchronous and runs on the blocking pool.

use super::{exchange::ExchangeLayer, DiscoveryLayer};
use crate::state::DaemonState;
use async_trait::async_trait;
use mainline::{Dht, Id};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use wgmesh_common::{restrict_permissions, Error};

pub const SOURCE: &str = "dht";

/// Same endpoint is contacted at most once per this interval.
pub const CONTACT_INTERVAL: Duration = Duration::from_secs(60);

/// Announce/query cycle cadence; deliberately slower than gossip.
const CYCLE_INTERVAL: Duration = Duration::from_secs(60);

/// Cap on endpoints taken from one query.
const MAX_ENDPOINTS_PER_CYCLE: usize = 64;

pub struct DhtLayer {
    state: DaemonState,
    exchange: Arc<ExchangeLayer>,
    cache_path: PathBuf,
    contacted: Mutex<HashMap<SocketAddr, Instant>>,
}

impl DhtLayer {
    pub fn new(state: DaemonState, exchange: Arc<ExchangeLayer>, cache_path: PathBuf) -> Self {
        Self {
            state,
            exchange,
            cache_path,
            contacted: Mutex::new(HashMap::new()),
        }
    }

    /// Outbound contact throttle.
    fn should_contact(&self, addr: SocketAddr) -> bool {
        let now = Instant::now();
        let mut contacted = self.contacted.lock();
        contacted.retain(|_, t| now.saturating_duration_since(*t) < CONTACT_INTERVAL);
        match contacted.get(&addr) {
            Some(_) => false,
            None => {
                contacted.insert(addr, now);
                true
            }
        }
    }

    fn load_bootstrap(&self) -> Vec<String> {
        match std::fs::read_to_string(&self.cache_path) {
            Ok(text) => text
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    fn save_bootstrap(&self, nodes: &[String]) {
        if nodes.is_empty() {
            return;
        }
        if let Err(e) = std::fs::write(&self.cache_path, nodes.join("\n")) {
            debug!("failed to save DHT bootstrap cache: {e}");
            return;
        }
        let _ = restrict_permissions(&self.cache_path);
    }

    async fn cycle(&self, dht: &Dht, info_hash: Id, shutdown: &CancellationToken) {
        let port = self.state.keys.gossip_port;

        // Announce our endpoint under the network ID.
        let announce_dht = dht.clone();
        let announce = tokio::task::spawn_blocking(move || {
            announce_dht
                .announce_peer(info_hash, Some(port))
                .map_err(|e| Error::DhtAnnounceFailed(e.to_string()))
        });
        tokio::select! {
            _ = shutdown.cancelled() => return,
            result = announce => match result {
                Ok(Ok(_)) => debug!("announced to DHT"),
                Ok(Err(e)) => warn!("{e}"),
                Err(e) => warn!("DHT announce task failed: {e}"),
            }
        }

        // Query for other announcers.
        let query_dht = dht.clone();
        let query = tokio::task::spawn_blocking(move || {
            let mut found = Vec::new();
            for peers in query_dht.get_peers(info_hash) {
                found.extend(peers);
                if found.len() >= MAX_ENDPOINTS_PER_CYCLE {
                    break;
                }
            }
            found
        });
        let found = tokio::select! {
            _ = shutdown.cancelled() => return,
            result = query => result.unwrap_or_default(),
        };

        debug!(count = found.len(), "DHT query finished");
        for addr in found {
            let addr = SocketAddr::V4(addr);
            if !self.should_contact(addr) {
                continue;
            }
            // The exchange handshake authenticates and stores the peer;
            // the DHT adds its own provenance tag on top.
            match self.exchange.probe(addr).await {
                Ok(Some(pubkey)) => {
                    if let Some(peer) = self.state.store.get(&pubkey) {
                        self.state.store.update(peer, SOURCE);
                    }
                }
                Ok(None) => {}
                Err(e) => debug!(%addr, "DHT endpoint probe failed: {e}"),
            }
        }

        // Persist the routing table for the next start.
        let cache_dht = dht.clone();
        if let Ok(nodes) = tokio::task::spawn_blocking(move || cache_dht.to_bootstrap()).await {
            self.save_bootstrap(&nodes);
        }
    }
}

#[async_trait]
impl DiscoveryLayer for DhtLayer {
    fn name(&self) -> &'static str {
        SOURCE
    }

    async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let bootstrap = self.load_bootstrap();
        let dht_result = tokio::task::spawn_blocking(move || {
            if bootstrap.is_empty() {
                Dht::client()
            } else {
                Dht::builder().bootstrap(&bootstrap).build()
            }
        })
        .await;

        let dht = match dht_result {
            Ok(Ok(dht)) => dht,
            Ok(Err(e)) => {
                error!("failed to start DHT client: {e}");
                return;
            }
            Err(e) => {
                error!("DHT startup task failed: {e}");
                return;
            }
        };

        let info_hash = match Id::from_bytes(self.state.keys.network_id) {
            Ok(id) => id,
            Err(e) => {
                error!("invalid DHT infohash: {e}");
                return;
            }
        };

        info!(infohash = %hex::encode(self.state.keys.network_id), "DHT discovery started");
        loop {
            self.cycle(&dht, info_hash, &shutdown).await;
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(CYCLE_INTERVAL) => {}
            }
        }
        info!("DHT discovery stopped");
    }
}
