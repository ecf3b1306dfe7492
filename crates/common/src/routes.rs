//! Shared route model and diff logic
//!
//! Both the daemon's route reconciler and the centralized deploy path work
//! in terms of these entries, so the normalize/diff rules live in one place.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;

/// One OS routing-table entry. An empty gateway means a direct-interface
/// route.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RouteEntry {
    pub network: String,
    #[serde(default)]
    pub gateway: String,
}

impl RouteEntry {
    pub fn direct(network: impl Into<String>) -> Self {
        Self {
            network: network.into(),
            gateway: String::new(),
        }
    }

    pub fn via(network: impl Into<String>, gateway: impl Into<String>) -> Self {
        Self {
            network: network.into(),
            gateway: gateway.into(),
        }
    }
}

/// Add the host prefix to bare addresses: `/32` for IPv4, `/128` for IPv6.
/// Already-CIDR and unparseable inputs pass through unchanged.
pub fn normalize_network(network: &str) -> String {
    if network.contains('/') {
        return network.to_string();
    }
    match network.parse::<IpAddr>() {
        Ok(IpAddr::V4(_)) => format!("{network}/32"),
        Ok(IpAddr::V6(_)) => format!("{network}/128"),
        Err(_) => network.to_string(),
    }
}

/// Compute `(to_add, to_remove)` between the live table and the desired set.
///
/// Entries are keyed by normalized network. A gateway change schedules a
/// remove of the current entry and an add of the desired one. Desired
/// entries with an empty gateway are valid and compared like any other.
pub fn calculate_diff(
    current: &[RouteEntry],
    desired: &[RouteEntry],
) -> (Vec<RouteEntry>, Vec<RouteEntry>) {
    let current_by_net: HashMap<String, &RouteEntry> = current
        .iter()
        .map(|e| (normalize_network(&e.network), e))
        .collect();
    let desired_by_net: HashMap<String, &RouteEntry> = desired
        .iter()
        .map(|e| (normalize_network(&e.network), e))
        .collect();

    let mut to_add = Vec::new();
    let mut to_remove = Vec::new();

    for (net, want) in &desired_by_net {
        match current_by_net.get(net) {
            Some(have) if have.gateway == want.gateway => {}
            Some(have) => {
                to_remove.push((*have).clone());
                to_add.push((*want).clone());
            }
            None => to_add.push((*want).clone()),
        }
    }

    for (net, have) in &current_by_net {
        if !desired_by_net.contains_key(net) {
            to_remove.push((*have).clone());
        }
    }

    (to_add, to_remove)
}
