//! Outbound announcement fan-out
//!
//! The reconcile loop calls [`Announcer::broadcast`] once per tick. One
//! fresh announcement is sealed and delivered to every relevant layer:
//! LAN multicast and in-mesh gossip here, the DHT on its own slower
//! cadence. With privacy enabled the announcement is stemmed to the
//! current relay instead, except when the fluff coin says otherwise.

use crate::discovery::{gossip, lan::LanLayer};
use crate::privacy::PrivacyRouter;
use crate::state::DaemonState;
use std::sync::Arc;
use tracing::warn;
use wgmesh_common::envelope;

pub struct Announcer {
    state: DaemonState,
    lan: Option<Arc<LanLayer>>,
    privacy: Option<Arc<PrivacyRouter>>,
}

impl Announcer {
    pub fn new(state: DaemonState) -> Self {
        Self {
            state,
            lan: None,
            privacy: None,
        }
    }

    pub fn with_lan(mut self, lan: Option<Arc<LanLayer>>) -> Self {
        self.lan = lan;
        self
    }

    pub fn with_privacy(mut self, privacy: Option<Arc<PrivacyRouter>>) -> Self {
        self.privacy = privacy;
        self
    }

    pub async fn broadcast(&self) {
        let announcement = self.state.local_announcement(Vec::new());
        let sealed = match envelope::seal_announcement(&announcement, &self.state.keys.gossip_key)
        {
            Ok(sealed) => sealed,
            Err(e) => {
                warn!("failed to seal announcement: {e}");
                return;
            }
        };

        if let Some(privacy) = &self.privacy {
            if !privacy.should_fluff() {
                if let Some(relay) = privacy.current_relay() {
                    // Mark our own message seen so the gossip listener
                    // never re-forwards it if it loops back.
                    privacy.should_forward(&sealed);
                    gossip::send_to_peer(&self.state, &sealed, relay.mesh_ip).await;
                    return;
                }
            }
        }

        if let Some(lan) = &self.lan {
            lan.send_announcement(&sealed).await;
        }
        gossip::broadcast_to_active(&self.state, &sealed).await;
    }
}
