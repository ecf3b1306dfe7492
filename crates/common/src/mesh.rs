//! Declared mesh state for centralized operation
//!
//! The operator-driven deploy path reconciles target nodes against this
//! model. The core only computes views over it: the node listing, each
//! node's peer set, and the directional AllowedIPs for a peer pair.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

/// One declared node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDecl {
    pub hostname: String,
    pub mesh_ip: IpAddr,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub wg_pubkey: Option<String>,
    #[serde(default)]
    pub routable_networks: Vec<String>,
}

/// A directional access policy between two groups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    pub from: String,
    pub to: String,
}

/// The full declared mesh: nodes, group membership, and policies.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MeshState {
    pub nodes: BTreeMap<String, NodeDecl>,
    #[serde(default)]
    pub groups: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub policies: Vec<Policy>,
}

impl MeshState {
    /// One `"<hostname> <mesh_ip>"` line per node.
    pub fn simple_list(&self) -> Vec<String> {
        self.nodes
            .values()
            .map(|n| format!("{} {}", n.hostname, n.mesh_ip))
            .collect()
    }

    fn group_members(&self, group: &str) -> &[String] {
        self.groups.get(group).map(Vec::as_slice).unwrap_or(&[])
    }

    fn node_groups(&self, node: &str) -> Vec<&str> {
        self.groups
            .iter()
            .filter(|(_, members)| members.iter().any(|m| m == node))
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// The peers a node must be configured with.
    ///
    /// Policies are directional for traffic but bidirectional for
    /// configuration: both endpoints of a policy edge need each other as
    /// WireGuard peers or the tunnel never establishes.
    pub fn peers_for(&self, node: &str) -> BTreeSet<String> {
        let mut peers = BTreeSet::new();
        for policy in &self.policies {
            let from = self.group_members(&policy.from);
            let to = self.group_members(&policy.to);
            if from.iter().any(|m| m == node) {
                peers.extend(to.iter().cloned());
            }
            if to.iter().any(|m| m == node) {
                peers.extend(from.iter().cloned());
            }
        }
        peers.remove(node);
        peers
    }

    /// True when some policy allows traffic from `node` toward `peer`.
    fn policy_allows(&self, node: &str, peer: &str) -> bool {
        self.policies.iter().any(|p| {
            self.group_members(&p.from).iter().any(|m| m == node)
                && self.group_members(&p.to).iter().any(|m| m == peer)
        })
    }

    /// AllowedIPs for `peer` in `node`'s configuration.
    ///
    /// The peer's mesh IP is always present. Its routable networks are
    /// included only when a policy permits traffic in the node→peer
    /// direction; reachability of a peer's networks is directional even
    /// though the tunnel itself is not.
    pub fn allowed_ips_for(&self, node: &str, peer: &str) -> Vec<String> {
        let Some(decl) = self.nodes.get(peer) else {
            return Vec::new();
        };
        let mut allowed = vec![host_cidr(decl.mesh_ip)];
        if self.policy_allows(node, peer) {
            allowed.extend(decl.routable_networks.iter().cloned());
        }
        allowed
    }
}

fn host_cidr(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => format!("{v4}/32"),
        IpAddr::V6(v6) => format!("{v6}/128"),
    }
}
