//! Rendezvous registry
//!
//! Discovery of last resort: a JSON blob of announcements parked in a
//! well-known issue comment, keyed by the hex rendezvous ID. Useful when
//! the DHT is unreachable and no peer shares a LAN. The registry operator
//! learns endpoints but nothing else; announcements stay structurally
//! validated like any other source.

use super::DiscoveryLayer;
use crate::state::DaemonState;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wgmesh_common::{Error, PeerAnnouncement, PeerInfo, Result, PROTOCOL_VERSION};

pub const SOURCE: &str = "registry";

const SYNC_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// The stored peer list.
#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryBlob {
    peers: Vec<PeerAnnouncement>,
}

pub struct RegistryLayer {
    state: DaemonState,
    client: reqwest::Client,
    base_url: String,
}

impl RegistryLayer {
    pub fn new(state: DaemonState, base_url: String) -> Self {
        Self {
            state,
            client: reqwest::Client::new(),
            base_url,
        }
    }

    fn url(&self) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            self.state.keys.rendezvous_hex()
        )
    }

    async fn sync(&self) -> Result<()> {
        self.fetch().await?;
        self.publish().await
    }

    /// Pull the current blob and merge its peers.
    async fn fetch(&self) -> Result<()> {
        let response = self
            .client
            .get(self.url())
            .send()
            .await
            .map_err(|e| Error::RegistryRequestFailed(format!("fetch request failed: {e}")))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        if !response.status().is_success() {
            return Err(Error::RegistryRequestFailed(format!(
                "fetch request failed: status {}",
                response.status()
            )));
        }

        let blob: RegistryBlob = response
            .json()
            .await
            .map_err(|e| Error::RegistryRequestFailed(format!("failed to decode blob: {e}")))?;

        let local_pubkey = self.state.local.read().wg_pubkey.clone();
        let mut merged = 0;
        for announcement in blob.peers {
            if announcement.wg_pubkey == local_pubkey {
                continue;
            }
            // Registry entries can be arbitrarily old; only the protocol
            // and structure are checked here.
            if announcement.protocol != PROTOCOL_VERSION {
                continue;
            }
            if let Err(e) = announcement.validate() {
                debug!("skipping invalid registry entry: {e}");
                continue;
            }
            if self
                .state
                .store
                .update(PeerInfo::from_announcement(&announcement), SOURCE)
            {
                merged += 1;
            }
        }
        if merged > 0 {
            debug!(merged, "merged registry peers");
        }
        Ok(())
    }

    /// Push our view: our announcement plus every active peer.
    async fn publish(&self) -> Result<()> {
        let mut blob = RegistryBlob {
            peers: vec![self.state.local_announcement(Vec::new())],
        };
        for peer in self.state.store.get_active() {
            blob.peers.push(PeerAnnouncement {
                protocol: PROTOCOL_VERSION,
                wg_pubkey: peer.wg_pubkey,
                mesh_ip: peer.mesh_ip,
                wg_endpoint: peer.endpoint,
                routable_networks: peer.routable_networks,
                known_peers: Vec::new(),
                hostname: peer.hostname.unwrap_or_default(),
                timestamp: peer.last_seen,
            });
        }

        let body = serde_json::to_vec(&blob)
            .map_err(|e| Error::RegistryRequestFailed(format!("failed to marshal update: {e}")))?;

        let request = self
            .client
            .patch(self.url())
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .build()
            .map_err(|e| {
                Error::RegistryRequestFailed(format!("failed to create PATCH request: {e}"))
            })?;

        let response = self
            .client
            .execute(request)
            .await
            .map_err(|e| Error::RegistryRequestFailed(format!("update request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::RegistryRequestFailed(format!(
                "update request failed: status {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl DiscoveryLayer for RegistryLayer {
    fn name(&self) -> &'static str {
        SOURCE
    }

    async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(url = %self.url(), "registry discovery started");
        loop {
            if let Err(e) = self.sync().await {
                warn!("registry sync failed: {e}");
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(SYNC_INTERVAL) => {}
            }
        }
        info!("registry discovery stopped");
    }
}
