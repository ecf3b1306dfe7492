//! wgmesh CLI - Main Entry Point
//!
//! One binary for both operating styles: `join` runs the decentralized
//! daemon in-process; `peers` talks to a running daemon over the control
//! socket; `status` and `init` are offline helpers.

use clap::{Parser, Subcommand};

mod client;
mod commands;
mod output;

use commands::{init, join, peers, service, status};

/// wgmesh - WireGuard overlay mesh builder
#[derive(Parser)]
#[command(name = "wgmesh")]
#[command(about = "Build and operate WireGuard overlay meshes")]
#[command(disable_version_flag = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join a mesh and run the daemon
    Join(join::JoinArgs),

    /// Print derived mesh parameters without running the daemon
    Status(status::StatusArgs),

    /// Query a running daemon
    #[command(subcommand)]
    Peers(peers::PeersCommands),

    /// Generate a fresh mesh secret
    Init(init::InitArgs),

    /// Install a systemd unit running `join`
    InstallService(service::InstallArgs),

    /// Remove the systemd unit
    UninstallService(service::UninstallArgs),

    /// Show version information
    Version,
}

/// Version flags outrank every subcommand.
fn version_requested(args: &[String]) -> bool {
    args.iter()
        .skip(1)
        .any(|a| a == "--version" || a == "-v")
        || args.get(1).map(|a| a == "version").unwrap_or(false)
}

fn print_version() {
    println!("wgmesh {}", wgmesh_common::VERSION);
}

#[tokio::main]
async fn main() {
    let raw_args: Vec<String> = std::env::args().collect();
    if version_requested(&raw_args) {
        print_version();
        std::process::exit(0);
    }

    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    match cli.command {
        Commands::Join(args) => {
            join::execute(args).await?;
            Ok(0)
        }
        Commands::Status(args) => {
            status::execute(args)?;
            Ok(0)
        }
        Commands::Peers(cmd) => peers::execute(cmd).await,
        Commands::Init(args) => {
            init::execute(args);
            Ok(0)
        }
        Commands::InstallService(args) => {
            service::install(args).await?;
            Ok(0)
        }
        Commands::UninstallService(args) => {
            service::uninstall(args).await?;
            Ok(0)
        }
        Commands::Version => {
            print_version();
            Ok(0)
        }
    }
}
