//! Peer store
//!
//! The process-wide authoritative mapping of WireGuard public key to peer
//! metadata. Every discovery layer writes through [`PeerStore::update`];
//! the reconcile loop reads snapshots and drives eviction. The store is the
//! sole linearization point for peer state.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};
use wgmesh_common::{restrict_permissions, PeerInfo, Result};

/// Default capacity bound.
pub const DEFAULT_MAX_PEERS: usize = 1000;

/// Source tag for cache-preloaded peers.
pub const SOURCE_CACHE: &str = "cache";

/// Peer-store tuning.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Hard cap on tracked peers.
    pub max_peers: usize,
    /// A peer unseen for longer than this is excluded from `get_active`.
    /// Defaults to twice the reconcile interval.
    pub dead_timeout: Duration,
    /// A peer unseen for longer than this is removed by the staleness sweep.
    pub remove_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_peers: DEFAULT_MAX_PEERS,
            dead_timeout: Duration::from_secs(10),
            remove_timeout: Duration::from_secs(600),
        }
    }
}

/// Active/total/dead summary for `peers.count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct PeerCounts {
    pub active: usize,
    pub total: usize,
    pub dead: usize,
}

/// Mutex-guarded map keyed by WireGuard public key.
pub struct PeerStore {
    peers: RwLock<HashMap<String, PeerInfo>>,
    config: StoreConfig,
}

impl PeerStore {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Merge an observation from a discovery layer.
    ///
    /// Existing peers always merge: the endpoint and routable networks come
    /// from the incoming record, the source tag joins `discovered_via`, and
    /// `last_seen` advances. New peers insert only under the capacity
    /// bound. Returns false when the observation was dropped.
    pub fn update(&self, peer: PeerInfo, source: &str) -> bool {
        let now = chrono::Utc::now().timestamp();
        let mut peers = self.peers.write();

        if let Some(existing) = peers.get_mut(&peer.wg_pubkey) {
            if peer.endpoint.is_some() {
                existing.endpoint = peer.endpoint;
            }
            existing.routable_networks = peer.routable_networks;
            existing.mesh_ip = peer.mesh_ip;
            if peer.hostname.is_some() {
                existing.hostname = peer.hostname;
            }
            if let Some(latency) = peer.latency_ms {
                existing.latency_ms = Some(latency);
            }
            existing.discovered_via.insert(source.to_string());
            existing.last_seen = existing.last_seen.max(now);
            return true;
        }

        if peers.len() >= self.config.max_peers {
            warn!(
                source,
                pubkey = %peer.wg_pubkey,
                "peer store full at {} peers, dropping",
                self.config.max_peers
            );
            return false;
        }

        let mut peer = peer;
        peer.discovered_via.insert(source.to_string());
        peer.last_seen = now;
        if peer.first_seen == 0 {
            peer.first_seen = now;
        }
        debug!(source, pubkey = %peer.wg_pubkey, mesh_ip = %peer.mesh_ip, "new peer");
        peers.insert(peer.wg_pubkey.clone(), peer);
        true
    }

    /// Record an exchange-measured round-trip time.
    pub fn set_latency(&self, pubkey: &str, latency_ms: u64) {
        if let Some(peer) = self.peers.write().get_mut(pubkey) {
            peer.latency_ms = Some(latency_ms);
        }
    }

    /// Best-effort removal; no error if absent.
    pub fn remove(&self, pubkey: &str) -> Option<PeerInfo> {
        self.peers.write().remove(pubkey)
    }

    pub fn get(&self, pubkey: &str) -> Option<PeerInfo> {
        self.peers.read().get(pubkey).cloned()
    }

    /// Snapshot of every tracked peer.
    pub fn get_all(&self) -> Vec<PeerInfo> {
        self.peers.read().values().cloned().collect()
    }

    /// Snapshot of peers seen within the dead timeout.
    pub fn get_active(&self) -> Vec<PeerInfo> {
        self.get_active_at(chrono::Utc::now().timestamp())
    }

    pub fn get_active_at(&self, now: i64) -> Vec<PeerInfo> {
        let cutoff = now - self.config.dead_timeout.as_secs() as i64;
        self.peers
            .read()
            .values()
            .filter(|p| p.last_seen >= cutoff)
            .cloned()
            .collect()
    }

    /// Remove every peer unseen past the remove timeout; returns the
    /// removed set so the reconcile loop can drive WireGuard removal.
    pub fn cleanup_stale(&self) -> Vec<PeerInfo> {
        self.cleanup_stale_at(chrono::Utc::now().timestamp())
    }

    pub fn cleanup_stale_at(&self, now: i64) -> Vec<PeerInfo> {
        let cutoff = now - self.config.remove_timeout.as_secs() as i64;
        let mut peers = self.peers.write();
        let stale: Vec<String> = peers
            .values()
            .filter(|p| p.last_seen < cutoff)
            .map(|p| p.wg_pubkey.clone())
            .collect();
        stale
            .iter()
            .filter_map(|pk| {
                let removed = peers.remove(pk);
                if let Some(p) = &removed {
                    info!(pubkey = %p.wg_pubkey, mesh_ip = %p.mesh_ip, "removing stale peer");
                }
                removed
            })
            .collect()
    }

    pub fn counts(&self) -> PeerCounts {
        self.counts_at(chrono::Utc::now().timestamp())
    }

    pub fn counts_at(&self, now: i64) -> PeerCounts {
        let cutoff = now - self.config.dead_timeout.as_secs() as i64;
        let peers = self.peers.read();
        let total = peers.len();
        let active = peers.values().filter(|p| p.last_seen >= cutoff).count();
        PeerCounts {
            active,
            total,
            dead: total - active,
        }
    }

    /// Shutdown snapshot of the peer set.
    pub fn save_cache(&self, path: &Path) -> Result<()> {
        let peers = self.get_all();
        let data = serde_json::to_vec_pretty(&peers)?;
        std::fs::write(path, data)?;
        restrict_permissions(path)?;
        debug!(count = peers.len(), path = %path.display(), "saved peer cache");
        Ok(())
    }

    /// Preload peers from a cache file no older than `max_age`. Preloaded
    /// peers carry the `cache` source tag and a fresh `last_seen` so the
    /// discovery layers get one timeout window to re-confirm them.
    pub fn load_cache(&self, path: &Path, max_age: Duration) -> Result<usize> {
        let metadata = match std::fs::metadata(path) {
            Ok(m) => m,
            Err(_) => return Ok(0),
        };
        if let Ok(modified) = metadata.modified() {
            if modified.elapsed().unwrap_or(Duration::MAX) > max_age {
                debug!(path = %path.display(), "ignoring stale peer cache");
                return Ok(0);
            }
        }

        let data = std::fs::read(path)?;
        let cached: Vec<PeerInfo> = serde_json::from_slice(&data)?;
        let mut loaded = 0;
        for mut peer in cached {
            peer.discovered_via.clear();
            if self.update(peer, SOURCE_CACHE) {
                loaded += 1;
            }
        }
        info!(count = loaded, "preloaded peers from cache");
        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;

    fn pubkey(n: u8) -> String {
        base64::engine::general_purpose::STANDARD.encode([n; 32])
    }

    fn peer(n: u8) -> PeerInfo {
        PeerInfo {
            wg_pubkey: pubkey(n),
            hostname: None,
            mesh_ip: format!("10.42.0.{n}").parse().unwrap(),
            endpoint: Some(format!("203.0.113.{n}:51820")),
            routable_networks: Vec::new(),
            last_seen: 0,
            discovered_via: Default::default(),
            latency_ms: None,
            first_seen: 0,
        }
    }

    fn small_store(max_peers: usize) -> PeerStore {
        PeerStore::new(StoreConfig {
            max_peers,
            ..Default::default()
        })
    }

    #[test]
    fn test_capacity_bound() {
        let store = small_store(3);
        for n in 1..=3 {
            assert!(store.update(peer(n), "lan"));
        }
        // Fourth distinct pubkey is dropped and the store does not grow.
        assert!(!store.update(peer(4), "lan"));
        assert_eq!(store.get_all().len(), 3);

        // Updates to existing pubkeys still succeed at capacity.
        assert!(store.update(peer(2), "dht"));
        assert_eq!(store.get_all().len(), 3);
    }

    #[test]
    fn test_update_merges_sources_and_endpoint() {
        let store = small_store(10);
        store.update(peer(1), "lan");

        let mut seen_again = peer(1);
        seen_again.endpoint = Some("198.51.100.1:51820".to_string());
        seen_again.hostname = Some("node-1".to_string());
        store.update(seen_again, "gossip");

        let merged = store.get(&pubkey(1)).unwrap();
        assert_eq!(merged.endpoint.as_deref(), Some("198.51.100.1:51820"));
        assert_eq!(merged.hostname.as_deref(), Some("node-1"));
        let tags: Vec<_> = merged.discovered_via.iter().cloned().collect();
        assert_eq!(tags, vec!["gossip", "lan"]);
    }

    #[test]
    fn test_merge_without_endpoint_keeps_known_endpoint() {
        let store = small_store(10);
        store.update(peer(1), "exchange");
        let mut no_endpoint = peer(1);
        no_endpoint.endpoint = None;
        store.update(no_endpoint, "gossip");
        assert!(store.get(&pubkey(1)).unwrap().endpoint.is_some());
    }

    #[test]
    fn test_stale_eviction() {
        let store = small_store(10);
        store.update(peer(1), "lan");
        store.update(peer(2), "lan");
        let now = chrono::Utc::now().timestamp();

        // Inside the window: nothing removed.
        assert!(store.cleanup_stale_at(now).is_empty());

        // Past the remove timeout both are returned and gone.
        let removed = store.cleanup_stale_at(now + 601);
        assert_eq!(removed.len(), 2);
        assert!(store.get_all().is_empty());
    }

    #[test]
    fn test_active_and_counts() {
        let store = small_store(10);
        store.update(peer(1), "lan");
        let now = chrono::Utc::now().timestamp();

        assert_eq!(store.get_active_at(now).len(), 1);
        assert!(store.get_active_at(now + 60).is_empty());

        let counts = store.counts_at(now + 60);
        assert_eq!(
            counts,
            PeerCounts {
                active: 0,
                total: 1,
                dead: 1
            }
        );
    }

    #[test]
    fn test_remove_absent_is_noop() {
        let store = small_store(10);
        assert!(store.remove(&pubkey(9)).is_none());
    }

    #[test]
    fn test_cache_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wg0-peers.json");

        let store = small_store(10);
        store.update(peer(1), "dht");
        store.update(peer(2), "lan");
        store.save_cache(&path).unwrap();

        let restored = small_store(10);
        assert_eq!(
            restored.load_cache(&path, Duration::from_secs(86400)).unwrap(),
            2
        );
        let loaded = restored.get(&pubkey(1)).unwrap();
        assert!(loaded.discovered_via.contains(SOURCE_CACHE));
        assert!(!loaded.discovered_via.contains("dht"));
    }

    #[test]
    fn test_cache_too_old_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wg0-peers.json");
        let store = small_store(10);
        store.update(peer(1), "dht");
        store.save_cache(&path).unwrap();

        let restored = small_store(10);
        assert_eq!(restored.load_cache(&path, Duration::ZERO).unwrap(), 0);
        assert!(restored.get_all().is_empty());
    }

    #[test]
    fn test_missing_cache_is_ignored() {
        let store = small_store(10);
        let missing = Path::new("/nonexistent/wg0-peers.json");
        assert_eq!(
            store.load_cache(missing, Duration::from_secs(1)).unwrap(),
            0
        );
    }
}
