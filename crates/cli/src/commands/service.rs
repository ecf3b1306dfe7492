//! `wgmesh install-service` / `uninstall-service`
//!
//! Writes a systemd unit that runs `join` at boot. Lives outside the
//! daemon core; kept here so a mesh survives reboots without extra
//! tooling.

use anyhow::Context;
use clap::Args;
use std::path::PathBuf;
use wgmesh_daemon::exec::{CommandRunner, SystemRunner};

#[derive(Args)]
pub struct InstallArgs {
    /// Shared mesh secret
    #[arg(long, env = "WGMESH_SECRET")]
    pub secret: String,

    /// WireGuard interface name
    #[arg(long, default_value = "wg0")]
    pub interface: String,

    /// CIDRs reachable through this node, comma separated
    #[arg(long, value_delimiter = ',')]
    pub advertise_routes: Vec<String>,

    /// Enable in-mesh gossip
    #[arg(long)]
    pub gossip: bool,
}

#[derive(Args)]
pub struct UninstallArgs {
    /// WireGuard interface name
    #[arg(long, default_value = "wg0")]
    pub interface: String,
}

fn unit_path(interface: &str) -> PathBuf {
    PathBuf::from(format!("/etc/systemd/system/wgmesh-{interface}.service"))
}

fn render_unit(binary: &str, args: &InstallArgs) -> String {
    let mut exec = format!(
        "{binary} join --secret {} --interface {}",
        args.secret, args.interface
    );
    if !args.advertise_routes.is_empty() {
        exec.push_str(&format!(
            " --advertise-routes {}",
            args.advertise_routes.join(",")
        ));
    }
    if args.gossip {
        exec.push_str(" --gossip");
    }

    format!(
        "[Unit]\n\
         Description=wgmesh mesh daemon ({iface})\n\
         After=network-online.target\n\
         Wants=network-online.target\n\
         \n\
         [Service]\n\
         Type=simple\n\
         ExecStart={exec}\n\
         Restart=on-failure\n\
         RestartSec=5\n\
         \n\
         [Install]\n\
         WantedBy=multi-user.target\n",
        iface = args.interface,
    )
}

pub async fn install(args: InstallArgs) -> anyhow::Result<()> {
    let binary = std::env::current_exe()
        .context("resolving wgmesh binary path")?
        .display()
        .to_string();
    let path = unit_path(&args.interface);
    std::fs::write(&path, render_unit(&binary, &args))
        .with_context(|| format!("writing {}", path.display()))?;

    let runner = SystemRunner;
    let unit = format!("wgmesh-{}.service", args.interface);
    runner
        .output("systemctl", &["daemon-reload"])
        .await
        .context("systemctl daemon-reload")?;
    runner
        .output("systemctl", &["enable", "--now", &unit])
        .await
        .context("systemctl enable")?;
    println!("installed {}", path.display());
    Ok(())
}

pub async fn uninstall(args: UninstallArgs) -> anyhow::Result<()> {
    let runner = SystemRunner;
    let unit = format!("wgmesh-{}.service", args.interface);
    let _ = runner
        .output("systemctl", &["disable", "--now", &unit])
        .await;
    let path = unit_path(&args.interface);
    if path.exists() {
        std::fs::remove_file(&path).with_context(|| format!("removing {}", path.display()))?;
    }
    let _ = runner.output("systemctl", &["daemon-reload"]).await;
    println!("removed {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_render() {
        let args = InstallArgs {
            secret: "s3cret".to_string(),
            interface: "wg0".to_string(),
            advertise_routes: vec!["192.168.1.0/24".to_string()],
            gossip: true,
        };
        let unit = render_unit("/usr/bin/wgmesh", &args);
        assert!(unit.contains(
            "ExecStart=/usr/bin/wgmesh join --secret s3cret --interface wg0 \
             --advertise-routes 192.168.1.0/24 --gossip"
        ));
        assert!(unit.contains("WantedBy=multi-user.target"));
        assert!(unit.contains("Restart=on-failure"));
    }
}
