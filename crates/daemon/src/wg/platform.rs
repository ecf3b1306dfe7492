//! Platform-specific interface setup
//!
//! Linux gets a kernel WireGuard link via `ip`; macOS spawns
//! `wireguard-go` on a `utunN` device and addresses it with `ifconfig`.
//! The platform is a runtime value rather than a compile-time branch so
//! both paths stay testable everywhere.

use crate::exec::{look_path, CommandRunner};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{debug, info};
use wgmesh_common::{Error, Result};

/// Supported host platforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Linux,
    MacOs,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(target_os = "macos") {
            Platform::MacOs
        } else {
            Platform::Linux
        }
    }

    pub fn default_interface(&self) -> &'static str {
        match self {
            Platform::Linux => "wg0",
            Platform::MacOs => "utun20",
        }
    }

    /// Interface names are constrained per-OS; macOS tunnel devices must
    /// be `utun` followed by digits.
    pub fn validate_interface_name(&self, name: &str) -> Result<()> {
        match self {
            Platform::Linux => {
                if name.is_empty() || name.len() > 15 {
                    return Err(Error::InterfaceSetupFailed(format!(
                        "invalid interface name: {name:?}"
                    )));
                }
                Ok(())
            }
            Platform::MacOs => {
                let digits = name.strip_prefix("utun").unwrap_or("");
                if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(Error::InterfaceSetupFailed(format!(
                        "macOS interface must match utun<N>, got {name:?}"
                    )));
                }
                Ok(())
            }
        }
    }
}

/// Creates and addresses the WireGuard interface.
pub struct InterfaceManager {
    runner: Arc<dyn CommandRunner>,
    platform: Platform,
    /// Resolved once at construction; overridable for tests.
    wireguard_go: String,
}

impl InterfaceManager {
    pub fn new(runner: Arc<dyn CommandRunner>, platform: Platform) -> Self {
        let wireguard_go = look_path("wireguard-go")
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "wireguard-go".to_string());
        Self {
            runner,
            platform,
            wireguard_go,
        }
    }

    pub fn with_wireguard_go(mut self, path: impl Into<String>) -> Self {
        self.wireguard_go = path.into();
        self
    }

    /// Create the interface if it does not exist yet.
    pub async fn ensure_interface(&self, iface: &str) -> Result<()> {
        self.platform.validate_interface_name(iface)?;
        match self.platform {
            Platform::Linux => {
                let probe = self
                    .runner
                    .output("ip", &["link", "show", iface])
                    .await
                    .map_err(|e| Error::InterfaceSetupFailed(format!("ip link show: {e}")))?;
                if probe.success {
                    debug!(iface, "interface already exists");
                    return Ok(());
                }
                let created = self
                    .runner
                    .output("ip", &["link", "add", iface, "type", "wireguard"])
                    .await
                    .map_err(|e| Error::InterfaceSetupFailed(format!("ip link add: {e}")))?;
                if !created.success {
                    return Err(Error::InterfaceSetupFailed(format!(
                        "ip link add {iface}: {}",
                        created.stderr.trim()
                    )));
                }
                info!(iface, "created wireguard interface");
                Ok(())
            }
            Platform::MacOs => {
                let probe = self
                    .runner
                    .output("ifconfig", &[iface])
                    .await
                    .map_err(|e| Error::InterfaceSetupFailed(format!("ifconfig: {e}")))?;
                if probe.success {
                    debug!(iface, "tunnel device already exists");
                    return Ok(());
                }
                let spawned = self
                    .runner
                    .output(&self.wireguard_go, &[iface])
                    .await
                    .map_err(|e| Error::InterfaceSetupFailed(format!("wireguard-go: {e}")))?;
                if !spawned.success {
                    return Err(Error::InterfaceSetupFailed(format!(
                        "wireguard-go {iface}: {}",
                        spawned.stderr.trim()
                    )));
                }
                info!(iface, "spawned wireguard-go");
                Ok(())
            }
        }
    }

    /// Assign the mesh address and bring the interface up.
    ///
    /// `mesh_cidr` is the full derived subnet, e.g. `10.42.7.0/16`.
    pub async fn assign_address(&self, iface: &str, ip: Ipv4Addr, mesh_cidr: &str) -> Result<()> {
        let prefix = mesh_cidr.rsplit_once('/').map(|(_, p)| p).unwrap_or("16");
        match self.platform {
            Platform::Linux => {
                let addr = format!("{ip}/{prefix}");
                let added = self
                    .runner
                    .output("ip", &["addr", "add", &addr, "dev", iface])
                    .await
                    .map_err(|e| Error::InterfaceSetupFailed(format!("ip addr add: {e}")))?;
                if !added.success && !added.stderr.contains("File exists") {
                    return Err(Error::InterfaceSetupFailed(format!(
                        "ip addr add {addr}: {}",
                        added.stderr.trim()
                    )));
                }
                let up = self
                    .runner
                    .output("ip", &["link", "set", iface, "up"])
                    .await
                    .map_err(|e| Error::InterfaceSetupFailed(format!("ip link set up: {e}")))?;
                if !up.success {
                    return Err(Error::InterfaceSetupFailed(format!(
                        "ip link set {iface} up: {}",
                        up.stderr.trim()
                    )));
                }
                Ok(())
            }
            Platform::MacOs => {
                let probe = self
                    .runner
                    .output("ifconfig", &[iface])
                    .await
                    .map_err(|e| Error::InterfaceSetupFailed(format!("ifconfig: {e}")))?;
                let already_addressed = probe.success && probe.stdout.contains(&ip.to_string());

                let addr = format!("{ip}/{prefix}");
                let ip_str = ip.to_string();
                let aliased = self
                    .runner
                    .output("ifconfig", &[iface, "inet", &addr, &ip_str, "alias"])
                    .await
                    .map_err(|e| Error::InterfaceSetupFailed(format!("ifconfig alias: {e}")))?;
                if !aliased.success {
                    return Err(Error::InterfaceSetupFailed(format!(
                        "ifconfig {iface} alias: {}",
                        aliased.stderr.trim()
                    )));
                }

                // Re-running `route add` over an existing route fails; the
                // verb has to flip to `change`.
                let verb = if already_addressed { "change" } else { "add" };
                let routed = self
                    .runner
                    .output("route", &[verb, "-net", mesh_cidr, "-interface", iface])
                    .await
                    .map_err(|e| Error::InterfaceSetupFailed(format!("route {verb}: {e}")))?;
                if !routed.success {
                    return Err(Error::InterfaceSetupFailed(format!(
                        "route {verb} {mesh_cidr}: {}",
                        routed.stderr.trim()
                    )));
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::mock::MockRunner;
    use crate::exec::CommandOutput;

    #[test]
    fn test_interface_name_validation() {
        assert!(Platform::Linux.validate_interface_name("wg0").is_ok());
        assert!(Platform::Linux
            .validate_interface_name("averylonginterfacename")
            .is_err());
        assert!(Platform::MacOs.validate_interface_name("utun20").is_ok());
        assert!(Platform::MacOs.validate_interface_name("utun").is_err());
        assert!(Platform::MacOs.validate_interface_name("utun2a").is_err());
        assert!(Platform::MacOs.validate_interface_name("wg0").is_err());
    }

    #[test]
    fn test_default_interfaces() {
        assert_eq!(Platform::Linux.default_interface(), "wg0");
        assert_eq!(Platform::MacOs.default_interface(), "utun20");
    }

    #[tokio::test]
    async fn test_linux_creates_missing_interface() {
        let runner = Arc::new(MockRunner::new());
        runner.on("link show wg0", CommandOutput::fail("does not exist"));
        let mgr = InterfaceManager::new(runner.clone(), Platform::Linux);
        mgr.ensure_interface("wg0").await.unwrap();
        assert_eq!(runner.calls_matching("link add wg0 type wireguard").len(), 1);
    }

    #[tokio::test]
    async fn test_linux_skips_existing_interface() {
        let runner = Arc::new(MockRunner::new());
        let mgr = InterfaceManager::new(runner.clone(), Platform::Linux);
        mgr.ensure_interface("wg0").await.unwrap();
        assert!(runner.calls_matching("link add").is_empty());
    }

    #[tokio::test]
    async fn test_macos_route_verb_flips_to_change() {
        let runner = Arc::new(MockRunner::new());
        // Device already carries the address: verb must be `change`.
        runner.on(
            "ifconfig utun20",
            CommandOutput::ok("inet 10.42.1.2 netmask 0xffff0000"),
        );
        let mgr = InterfaceManager::new(runner.clone(), Platform::MacOs)
            .with_wireguard_go("/opt/bin/wireguard-go");
        mgr.assign_address("utun20", "10.42.1.2".parse().unwrap(), "10.42.0.0/16")
            .await
            .unwrap();

        let route_calls = runner.calls_matching("route ");
        assert_eq!(route_calls.len(), 1);
        // The verb is the second positional argument.
        assert_eq!(route_calls[0].args[0], "change");
    }

    #[tokio::test]
    async fn test_macos_fresh_address_uses_add() {
        let runner = Arc::new(MockRunner::new());
        // The alias call succeeds; the bare probe reports no such device.
        runner.on("alias", CommandOutput::ok(""));
        runner.on("ifconfig utun20", CommandOutput::fail("no such interface"));
        let mgr = InterfaceManager::new(runner.clone(), Platform::MacOs);
        mgr.assign_address("utun20", "10.42.1.2".parse().unwrap(), "10.42.0.0/16")
            .await
            .unwrap();
        let route_calls = runner.calls_matching("route ");
        assert_eq!(route_calls[0].args[0], "add");
    }
}
