//! Dandelion-style privacy relay
//!
//! In privacy mode announcements are not broadcast. Each epoch, every node
//! deterministically picks one stem relay from the peer set; announcements
//! go to the relay, which either forwards to its own stem or, with bounded
//! probability, "fluffs" (broadcasts normally). Best-effort only: no
//! delivery guarantee is made.

use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use wgmesh_common::PeerInfo;

use crate::store::PeerStore;

/// Stem-relay rotation interval.
pub const DEFAULT_EPOCH_DURATION: Duration = Duration::from_secs(10 * 60);

/// Probability that a relayed announcement is fluffed instead of stemmed.
pub const DEFAULT_FLUFF_PROBABILITY: f64 = 0.1;

/// How long a forwarded message digest is remembered.
const SEEN_TTL: Duration = Duration::from_secs(120);

pub struct PrivacyRouter {
    epoch_seed: [u8; 32],
    local_pubkey: String,
    fluff_probability: f64,
    current_relay: RwLock<Option<PeerInfo>>,
    seen: Mutex<HashMap<[u8; 32], Instant>>,
}

impl PrivacyRouter {
    pub fn new(epoch_seed: [u8; 32], local_pubkey: String) -> Self {
        Self {
            epoch_seed,
            local_pubkey,
            fluff_probability: DEFAULT_FLUFF_PROBABILITY,
            current_relay: RwLock::new(None),
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Wall-clock epoch index.
    pub fn epoch_index(now: i64) -> u64 {
        (now.max(0) as u64) / DEFAULT_EPOCH_DURATION.as_secs()
    }

    /// Deterministic stem-relay choice for an epoch.
    ///
    /// Scoring each candidate by `SHA-256(seed ‖ epoch ‖ local ‖ peer)`
    /// yields a per-node permutation of the peer set that every epoch
    /// reshuffles; the minimum is the relay.
    pub fn select_relay(&self, peers: &[PeerInfo], epoch: u64) -> Option<PeerInfo> {
        peers
            .iter()
            .filter(|p| p.wg_pubkey != self.local_pubkey)
            .min_by_key(|p| {
                let mut hasher = Sha256::new();
                hasher.update(self.epoch_seed);
                hasher.update(epoch.to_be_bytes());
                hasher.update(self.local_pubkey.as_bytes());
                hasher.update(p.wg_pubkey.as_bytes());
                hasher.finalize()
            })
            .cloned()
    }

    /// Recompute the relay for the given epoch.
    pub fn rotate(&self, peers: &[PeerInfo], epoch: u64) {
        let relay = self.select_relay(peers, epoch);
        if let Some(r) = &relay {
            debug!(epoch, relay = %r.wg_pubkey, "rotated stem relay");
        }
        *self.current_relay.write() = relay;
    }

    pub fn current_relay(&self) -> Option<PeerInfo> {
        self.current_relay.read().clone()
    }

    /// Coin flip deciding stem vs fluff for one message.
    pub fn should_fluff(&self) -> bool {
        rand::random::<f64>() < self.fluff_probability
    }

    /// Forwarding dedupe: true the first time a sealed payload is seen
    /// within the TTL. Stops stem cycles between mutually-selected relays.
    pub fn should_forward(&self, payload: &[u8]) -> bool {
        let digest: [u8; 32] = Sha256::digest(payload).into();
        let now = Instant::now();
        let mut seen = self.seen.lock();
        seen.retain(|_, t| now.saturating_duration_since(*t) < SEEN_TTL);
        match seen.get(&digest) {
            Some(_) => false,
            None => {
                seen.insert(digest, now);
                true
            }
        }
    }

    /// Rotate the stem relay every epoch until cancelled.
    pub async fn rotation_loop(
        self: Arc<Self>,
        store: Arc<PeerStore>,
        shutdown: CancellationToken,
    ) {
        info!("epoch rotation started");
        loop {
            let now = chrono::Utc::now().timestamp();
            self.rotate(&store.get_active(), Self::epoch_index(now));

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(DEFAULT_EPOCH_DURATION) => {}
            }
        }
        info!("epoch rotation stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn peer(n: u8) -> PeerInfo {
        PeerInfo {
            wg_pubkey: format!("peer-{n}"),
            hostname: None,
            mesh_ip: format!("10.42.0.{n}").parse().unwrap(),
            endpoint: None,
            routable_networks: Vec::new(),
            last_seen: 0,
            discovered_via: Default::default(),
            latency_ms: None,
            first_seen: 0,
        }
    }

    #[test]
    fn test_relay_selection_is_deterministic() {
        let peers: Vec<_> = (1..=5).map(peer).collect();
        let a = PrivacyRouter::new([7u8; 32], "me".to_string());
        let b = PrivacyRouter::new([7u8; 32], "me".to_string());
        for epoch in 0..10 {
            assert_eq!(
                a.select_relay(&peers, epoch).map(|p| p.wg_pubkey),
                b.select_relay(&peers, epoch).map(|p| p.wg_pubkey),
            );
        }
    }

    #[test]
    fn test_relay_rotates_across_epochs() {
        let peers: Vec<_> = (1..=8).map(peer).collect();
        let router = PrivacyRouter::new([7u8; 32], "me".to_string());
        let selected: BTreeSet<_> = (0..32)
            .filter_map(|epoch| router.select_relay(&peers, epoch))
            .map(|p| p.wg_pubkey)
            .collect();
        // Thirty-two epochs over eight peers must not pin a single relay.
        assert!(selected.len() > 1);
    }

    #[test]
    fn test_relay_never_selects_self() {
        let mut peers: Vec<_> = (1..=3).map(peer).collect();
        peers.push(PeerInfo {
            wg_pubkey: "me".to_string(),
            ..peer(9)
        });
        let router = PrivacyRouter::new([1u8; 32], "me".to_string());
        for epoch in 0..16 {
            let relay = router.select_relay(&peers, epoch).unwrap();
            assert_ne!(relay.wg_pubkey, "me");
        }
    }

    #[test]
    fn test_no_peers_no_relay() {
        let router = PrivacyRouter::new([1u8; 32], "me".to_string());
        assert!(router.select_relay(&[], 0).is_none());
    }

    #[test]
    fn test_forward_dedupe() {
        let router = PrivacyRouter::new([1u8; 32], "me".to_string());
        assert!(router.should_forward(b"payload-1"));
        assert!(!router.should_forward(b"payload-1"));
        assert!(router.should_forward(b"payload-2"));
    }

    #[test]
    fn test_epoch_index_granularity() {
        assert_eq!(PrivacyRouter::epoch_index(0), 0);
        assert_eq!(PrivacyRouter::epoch_index(599), 0);
        assert_eq!(PrivacyRouter::epoch_index(600), 1);
    }
}
