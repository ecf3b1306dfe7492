//! Route reconciliation against the live table
//!
//! The diff logic lives in `wgmesh_common::routes`; this module reads the
//! kernel table for the mesh interface and applies the computed changes.
//! Route failures never abort a reconcile tick.

use crate::exec::CommandRunner;
use std::sync::Arc;
use tracing::{debug, warn};
use wgmesh_common::routes::{calculate_diff, normalize_network, RouteEntry};
use wgmesh_common::{Error, Result};

pub struct RouteReconciler {
    runner: Arc<dyn CommandRunner>,
    iface: String,
}

impl RouteReconciler {
    pub fn new(runner: Arc<dyn CommandRunner>, iface: impl Into<String>) -> Self {
        Self {
            runner,
            iface: iface.into(),
        }
    }

    /// Read the routes currently attached to the mesh interface.
    pub async fn current_routes(&self) -> Result<Vec<RouteEntry>> {
        let out = self
            .runner
            .output("ip", &["route", "show", "dev", &self.iface])
            .await
            .map_err(|e| Error::RouteSyncFailed(format!("ip route show: {e}")))?;
        if !out.success {
            return Err(Error::RouteSyncFailed(format!(
                "ip route show dev {}: {}",
                self.iface,
                out.stderr.trim()
            )));
        }
        Ok(parse_route_table(&out.stdout))
    }

    /// Converge the live table toward `desired`.
    ///
    /// When the current table cannot be read, fall back to an idempotent
    /// `add || replace` of every desired entry.
    pub async fn reconcile(&self, desired: &[RouteEntry]) {
        match self.current_routes().await {
            Ok(current) => {
                let (to_add, to_remove) = calculate_diff(&current, desired);
                for entry in &to_remove {
                    if let Err(e) = self.route_cmd("del", entry).await {
                        warn!(network = %entry.network, "failed to remove route: {e}");
                    }
                }
                for entry in &to_add {
                    if let Err(e) = self.add_or_replace(entry).await {
                        warn!(network = %entry.network, "failed to add route: {e}");
                    }
                }
            }
            Err(e) => {
                warn!("failed to read routing table, forcing desired routes: {e}");
                for entry in desired {
                    if let Err(e) = self.add_or_replace(entry).await {
                        warn!(network = %entry.network, "failed to force route: {e}");
                    }
                }
            }
        }
    }

    async fn add_or_replace(&self, entry: &RouteEntry) -> Result<()> {
        if self.route_cmd("add", entry).await.is_ok() {
            return Ok(());
        }
        self.route_cmd("replace", entry).await
    }

    async fn route_cmd(&self, verb: &str, entry: &RouteEntry) -> Result<()> {
        let network = normalize_network(&entry.network);
        let mut args: Vec<&str> = vec!["route", verb, &network];
        if !entry.gateway.is_empty() {
            args.extend(["via", &entry.gateway]);
        }
        args.extend(["dev", &self.iface]);

        let out = self
            .runner
            .output("ip", &args)
            .await
            .map_err(|e| Error::RouteSyncFailed(format!("ip route {verb}: {e}")))?;
        if !out.success {
            return Err(Error::RouteSyncFailed(format!(
                "ip route {verb} {network}: {}",
                out.stderr.trim()
            )));
        }
        debug!(verb, network, gateway = %entry.gateway, "route applied");
        Ok(())
    }
}

/// Parse `ip route show dev <iface>` lines into entries.
fn parse_route_table(text: &str) -> Vec<RouteEntry> {
    text.lines()
        .filter_map(|line| {
            let mut tokens = line.split_whitespace();
            let network = tokens.next()?;
            if network == "default" {
                return None;
            }
            let mut gateway = String::new();
            let mut rest = tokens;
            while let Some(token) = rest.next() {
                if token == "via" {
                    gateway = rest.next().unwrap_or("").to_string();
                    break;
                }
            }
            Some(RouteEntry {
                network: normalize_network(network),
                gateway,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::mock::MockRunner;
    use crate::exec::CommandOutput;

    #[test]
    fn test_parse_route_table() {
        let table = "10.42.0.0/16 proto kernel scope link src 10.42.0.1\n\
                     192.168.7.0/24 via 10.42.0.3\n\
                     10.9.9.9 scope link\n\
                     default via 192.168.0.1\n";
        let routes = parse_route_table(table);
        assert_eq!(
            routes,
            vec![
                RouteEntry::direct("10.42.0.0/16"),
                RouteEntry::via("192.168.7.0/24", "10.42.0.3"),
                RouteEntry::direct("10.9.9.9/32"),
            ]
        );
    }

    #[tokio::test]
    async fn test_reconcile_gateway_change() {
        let runner = Arc::new(MockRunner::new());
        runner.on(
            "route show",
            CommandOutput::ok("10.1.0.0/24 via 10.42.0.3\n"),
        );
        let reconciler = RouteReconciler::new(runner.clone(), "wg0");
        reconciler
            .reconcile(&[RouteEntry::via("10.1.0.0/24", "10.42.0.5")])
            .await;

        let del = runner.calls_matching("route del 10.1.0.0/24");
        assert_eq!(del.len(), 1);
        assert!(del[0].args.contains(&"10.42.0.3".to_string()));
        let add = runner.calls_matching("route add 10.1.0.0/24");
        assert_eq!(add.len(), 1);
        assert!(add[0].args.contains(&"10.42.0.5".to_string()));
    }

    #[tokio::test]
    async fn test_reconcile_noop_when_converged() {
        let runner = Arc::new(MockRunner::new());
        runner.on(
            "route show",
            CommandOutput::ok("10.1.0.0/24 via 10.42.0.3\n"),
        );
        let reconciler = RouteReconciler::new(runner.clone(), "wg0");
        reconciler
            .reconcile(&[RouteEntry::via("10.1.0.0/24", "10.42.0.3")])
            .await;
        assert!(runner.calls_matching("route add").is_empty());
        assert!(runner.calls_matching("route del").is_empty());
    }

    #[tokio::test]
    async fn test_unreadable_table_forces_add_or_replace() {
        let runner = Arc::new(MockRunner::new());
        runner.on("route show", CommandOutput::fail("no such device"));
        runner.on("route add", CommandOutput::fail("File exists"));
        let reconciler = RouteReconciler::new(runner.clone(), "wg0");
        reconciler
            .reconcile(&[RouteEntry::direct("10.5.0.0/24")])
            .await;
        assert_eq!(runner.calls_matching("route add 10.5.0.0/24").len(), 1);
        assert_eq!(runner.calls_matching("route replace 10.5.0.0/24").len(), 1);
    }
}
