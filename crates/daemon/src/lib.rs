//! wgmesh daemon
//!
//! Joins a mesh identified by a shared secret, discovers peers through
//! overlapping discovery layers, and continuously reconciles the local
//! WireGuard interface to track the peer store. One root cancellation
//! token owns every background task; shutdown cancels the root, joins the
//! task tracker, closes the control socket, and snapshots the peer cache.

pub mod announce;
pub mod config;
pub mod discovery;
pub mod exec;
pub mod privacy;
pub mod ratelimit;
pub mod reconciler;
pub mod rpc;
pub mod state;
pub mod store;
pub mod wg;

use crate::announce::Announcer;
use crate::config::DaemonConfig;
use crate::discovery::{
    dht::DhtLayer, exchange::ExchangeLayer, gossip::GossipLayer, lan::LanLayer,
    registry::RegistryLayer, DiscoveryLayer,
};
use crate::exec::{CommandRunner, SystemRunner};
use crate::privacy::PrivacyRouter;
use crate::ratelimit::HandlerPool;
use crate::rpc::RpcServer;
use crate::state::DaemonState;
use crate::wg::{InterfaceManager, Platform, WgDriver};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};
use wgmesh_common::{Error, Result};

/// Peer caches older than this are ignored on startup.
const PEER_CACHE_MAX_AGE: Duration = Duration::from_secs(24 * 3600);

/// Status printer cadence.
const STATUS_INTERVAL: Duration = Duration::from_secs(60);

/// Callback installed by the binary to swap the log filter on reload.
pub type LogReloadFn = Arc<dyn Fn(&str) + Send + Sync>;

pub struct Daemon {
    state: DaemonState,
    log_reload: Option<LogReloadFn>,
}

impl Daemon {
    pub fn new(config: DaemonConfig) -> Result<Self> {
        Self::with_runner(config, Arc::new(SystemRunner))
    }

    pub fn with_runner(config: DaemonConfig, runner: Arc<dyn CommandRunner>) -> Result<Self> {
        Ok(Self {
            state: DaemonState::new(config, runner)?,
            log_reload: None,
        })
    }

    /// Install the binary's log-filter reload hook.
    pub fn set_log_reload(&mut self, reload: LogReloadFn) {
        self.log_reload = Some(reload);
    }

    pub fn state(&self) -> &DaemonState {
        &self.state
    }

    /// Run until the token is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let state = self.state.clone();
        let config = state.config.read().clone();
        info!(
            iface = %config.interface,
            mesh_subnet = %state.keys.mesh_subnet_cidr(),
            gossip_port = state.keys.gossip_port,
            "joining mesh"
        );

        self.setup_interface(&config).await?;

        if let Err(e) = state
            .store
            .load_cache(&config.peer_cache_path(), PEER_CACHE_MAX_AGE)
        {
            warn!("peer cache load failed: {e}");
        }

        let tracker = TaskTracker::new();

        // Privacy router and its epoch rotation.
        let privacy = config.enable_privacy.then(|| {
            Arc::new(PrivacyRouter::new(
                state.keys.epoch_seed,
                state.local_pubkey(),
            ))
        });
        if let Some(router) = &privacy {
            tracker.spawn(
                router
                    .clone()
                    .rotation_loop(state.store.clone(), shutdown.clone()),
            );
        }

        // Discovery layers. The exchange listener must exist before the
        // DHT can hand it endpoints.
        let exchange = Arc::new(ExchangeLayer::new(state.clone(), HandlerPool::default()).await?);
        tracker.spawn(exchange.clone().run(shutdown.clone()));

        let lan = match LanLayer::new(state.clone()) {
            Ok(layer) => {
                let layer = Arc::new(layer);
                tracker.spawn(layer.clone().run(shutdown.clone()));
                Some(layer)
            }
            Err(e) => {
                warn!("lan discovery unavailable: {e}");
                None
            }
        };

        if config.enable_gossip {
            let layer = Arc::new(GossipLayer::new(state.clone(), privacy.clone()));
            tracker.spawn(layer.run(shutdown.clone()));
        }

        if config.enable_dht {
            let dht = Arc::new(DhtLayer::new(
                state.clone(),
                exchange.clone(),
                config.dht_cache_path(),
            ));
            tracker.spawn(dht.run(shutdown.clone()));
        }

        if let Some(url) = &config.registry_url {
            let layer = Arc::new(RegistryLayer::new(state.clone(), url.clone()));
            tracker.spawn(layer.run(shutdown.clone()));
        }

        // Reconciler, with its broadcast fan-out.
        let announcer = Arc::new(
            Announcer::new(state.clone())
                .with_lan(lan)
                .with_privacy(privacy.clone()),
        );
        let reconciler = reconciler::Reconciler::new(state.clone()).with_announcer(announcer);
        let nudge = reconciler.nudge_handle();
        tracker.spawn(reconciler.run(shutdown.clone()));

        // Housekeeping tasks.
        tracker.spawn(status_printer(state.clone(), shutdown.clone()));
        tracker.spawn(limiter_maintenance(state.clone(), shutdown.clone()));
        tracker.spawn(cache_saver(
            state.clone(),
            config.peer_cache_path(),
            shutdown.clone(),
        ));
        tracker.spawn(reload_on_sighup(
            state.clone(),
            self.log_reload.clone(),
            nudge,
            shutdown.clone(),
        ));

        // Control socket.
        let rpc = Arc::new(RpcServer::new(state.clone(), config.socket_path.clone()));
        let rpc_path = rpc.socket_path().to_path_buf();
        let rpc_shutdown = shutdown.clone();
        tracker.spawn(async move {
            if let Err(e) = rpc.serve(rpc_shutdown).await {
                warn!("control socket failed: {e}");
            }
        });

        info!("daemon running");
        shutdown.cancelled().await;
        info!("shutdown requested");

        // Everything observes the root token before we touch state.
        tracker.close();
        tracker.wait().await;

        exchange.send_goodbye().await;
        let _ = std::fs::remove_file(&rpc_path);
        if let Err(e) = state.store.save_cache(&config.peer_cache_path()) {
            warn!("peer cache save failed: {e}");
        }
        info!("daemon stopped");
        Ok(())
    }

    /// Bring up the interface, key it, address it, and persist the
    /// wg-quick config.
    async fn setup_interface(&self, config: &DaemonConfig) -> Result<()> {
        let state = &self.state;
        let platform = Platform::current();
        let manager = InterfaceManager::new(state.runner.clone(), platform);
        manager.ensure_interface(&config.interface).await?;

        let driver = WgDriver::new(state.runner.clone(), config.interface.clone());
        let local = state.local.read().clone();
        driver
            .set_interface(&local.wg_privkey, config.listen_port)
            .await?;

        let IpAddr::V4(mesh_v4) = local.mesh_ip else {
            return Err(Error::InterfaceSetupFailed(
                "mesh address must be IPv4".to_string(),
            ));
        };
        manager
            .assign_address(&config.interface, mesh_v4, &state.keys.mesh_subnet_cidr())
            .await?;

        // Best-effort persistent config for wg-quick interop.
        let desired = reconciler::Reconciler::new(state.clone())
            .desired_config(&state.store.get_active());
        let conf_path = config
            .wireguard_config_dir
            .join(format!("{}.conf", config.interface));
        let address = format!(
            "{}/{}",
            local.mesh_ip,
            state
                .keys
                .mesh_subnet_cidr()
                .rsplit_once('/')
                .map(|(_, p)| p.to_string())
                .unwrap_or_else(|| "16".to_string())
        );
        if let Err(e) =
            driver.write_quick_config(&conf_path, &desired, &address, &config.advertise_routes)
        {
            warn!("could not write {}: {e}", conf_path.display());
        }
        Ok(())
    }
}

/// Periodic INFO line with the peer counts.
async fn status_printer(state: DaemonState, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(STATUS_INTERVAL) => {
                let counts = state.store.counts();
                info!(
                    active = counts.active,
                    total = counts.total,
                    dead = counts.dead,
                    "mesh status"
                );
            }
        }
    }
}

/// Periodic rate-limiter bucket cleanup.
async fn limiter_maintenance(state: DaemonState, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(ratelimit::CLEANUP_INTERVAL) => {
                state.limiter.cleanup();
            }
        }
    }
}

/// Holds the final peer snapshot until shutdown.
async fn cache_saver(state: DaemonState, path: PathBuf, shutdown: CancellationToken) {
    shutdown.cancelled().await;
    if let Err(e) = state.store.save_cache(&path) {
        warn!("peer cache save failed: {e}");
    }
}

/// Re-read the runtime conf on SIGHUP and apply the reloadable subset.
/// On non-Unix targets the channel is simply never signaled.
async fn reload_on_sighup(
    state: DaemonState,
    log_reload: Option<LogReloadFn>,
    nudge: Arc<tokio::sync::Notify>,
    shutdown: CancellationToken,
) {
    #[cfg(unix)]
    {
        let mut hangup = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
        {
            Ok(signal) => signal,
            Err(e) => {
                warn!("SIGHUP handler unavailable: {e}");
                return;
            }
        };
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = hangup.recv() => {
                    let path = state.config.read().runtime_conf_path();
                    let text = match std::fs::read_to_string(&path) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("cannot read {}: {e}", path.display());
                            continue;
                        }
                    };
                    let entries = config::parse_runtime_conf(&text);
                    let (changed, routes, level) = {
                        let mut config = state.config.write();
                        let changed = config.apply_runtime_conf(&entries);
                        (changed, config.advertise_routes.clone(), config.log_level.clone())
                    };
                    if changed {
                        state.local.write().routable_networks = routes;
                        if let Some(reload) = &log_reload {
                            reload(&level);
                        }
                        info!("runtime config reloaded");
                        nudge.notify_one();
                    }
                }
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (state, log_reload, nudge);
        shutdown.cancelled().await;
    }
}
