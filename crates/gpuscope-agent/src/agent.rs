//! Agent wiring
//!
//! Builds the device inventory, watch-lists, collectors, and registry;
//! starts the scrape server and the watchers; and runs the signal loop until
//! shutdown.

use crate::cli::Cli;
use crate::reload::ReloadCoordinator;
use crate::server::MetricsServer;
use crate::watchers::{FileWatcher, GpuBindUnbindWatcher, TopologyWatcher};
use crate::Result;
use gpuscope_collector::{DeviceCollector, ProcessMapper, Registry, Transform, WeightedUtil};
use gpuscope_core::config::AppConfig;
use gpuscope_core::{counters, EntityGroup};
use gpuscope_device::watchlist::{WatchListManager, DEVICE_TYPES_TO_WATCH};
use gpuscope_device::{facade, process};
use gpuscope_kube::{DraMapper, PodIdentityResolver, PodMapper};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const TOPOLOGY_WATCH_INTERVAL: Duration = Duration::from_secs(60);

/// Reload triggers produced by the watchers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReloadEvent {
    ConfigChanged,
    TopologyChanged,
}

/// The hostname attached to emitted samples.
pub fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|s| !s.is_empty())
        .or_else(|| {
            std::fs::read_to_string("/proc/sys/kernel/hostname")
                .ok()
                .map(|s| s.trim().to_string())
        })
        .unwrap_or_else(|| "localhost".to_string())
}

/// Query the profiling metric groups the device library supports. The
/// profiling API can fault during GPU state transitions; a panic disables
/// profiling collection instead of crashing the exporter.
pub fn query_metric_groups(config: &mut AppConfig) {
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        facade::client().and_then(|client| client.supported_metric_groups(0))
    }));

    match result {
        Ok(Ok(groups)) => {
            info!(count = groups.len(), "successfully queried profiling metric groups");
            config.metric_groups = groups;
            config.collect_dcp = true;
        }
        Ok(Err(e)) => {
            info!("not collecting profiling metrics: {}", e);
            config.collect_dcp = false;
            config.metric_groups.clear();
        }
        Err(_) => {
            warn!("profiling API panic - profiling metrics disabled");
            config.collect_dcp = false;
            config.metric_groups.clear();
        }
    }
}

/// Build a registry for the current topology: counters, per-entity-type
/// watch-lists, and one collector per populated watch-list.
pub async fn build_registry(config: &AppConfig) -> Result<(Registry, WatchListManager)> {
    info!("building registry for current topology");

    let counter_set = counters::load_counter_set(&config.collectors_file)?;
    let hostname = if config.no_hostname { String::new() } else { hostname() };

    let mut manager = WatchListManager::new(counter_set.counters.clone(), config);
    let update_freq_us = (config.collect_interval_ms as i64).saturating_mul(1000);
    for &entity_type in DEVICE_TYPES_TO_WATCH {
        if let Err(e) = manager.create_entity_watch_list(entity_type, update_freq_us) {
            info!("not collecting {} metrics: {}", entity_type, e);
        }
    }

    let registry = Registry::new();
    let mut collector_count = 0usize;
    for (&entity_type, _) in manager.watch_lists() {
        let Some(watch_list) = manager.entity_watch_list(entity_type) else {
            continue;
        };
        match DeviceCollector::new(
            counter_set.counters.clone(),
            hostname.clone(),
            config,
            watch_list,
        ) {
            Ok(collector) => {
                registry.register(entity_type, Arc::new(collector)).await;
                collector_count += 1;
            }
            Err(e) => warn!(entity_type = %entity_type, error = %e, "cannot create collector"),
        }
    }

    info!(collector_count, "registry built successfully");
    Ok((registry, manager))
}

/// The running exporter.
pub struct Agent {
    cli: Cli,
}

impl Agent {
    pub fn new(cli: Cli) -> Self {
        Self { cli }
    }

    /// Run until SIGINT, SIGTERM, or SIGQUIT.
    pub async fn run(&self) -> Result<()> {
        let mut config = self.cli.to_config()?;
        info!(version = env!("CARGO_PKG_VERSION"), "starting gpuscope");

        facade::initialize(&config);
        process::initialize();
        query_metric_groups(&mut config);

        let watcher_cancel = CancellationToken::new();

        // Transformation pipeline, in fixed stage order.
        let mut pipeline: Vec<Arc<dyn Transform>> = Vec::new();
        let mut resolver = None;
        if config.kubernetes {
            let mut r = PodIdentityResolver::new(config.clone());
            r.connect_cluster().await;
            let r = Arc::new(r);
            r.clone().spawn_refresh(watcher_cancel.clone());
            pipeline.push(Arc::new(PodMapper::new(r.clone())));
            if config.kubernetes_enable_dra {
                pipeline.push(Arc::new(DraMapper::new(r.clone())));
            }
            resolver = Some(r);
        }
        pipeline.push(Arc::new(WeightedUtil::new()));
        pipeline.push(Arc::new(ProcessMapper::new()));

        let server = MetricsServer::new(pipeline, config.dump.clone());

        // Initial registry.
        let (registry, manager) = build_registry(&config).await?;
        if let Some(resolver) = &resolver {
            if let Some(watch_list) = manager.entity_watch_list(EntityGroup::Gpu) {
                resolver.set_inventory(watch_list.inventory().clone());
            }
        }
        server.set_registry(registry);

        let coordinator = Arc::new(ReloadCoordinator::new(
            server.clone(),
            self.cli.clone(),
            resolver.clone(),
            config.min_reload_interval,
        ));
        coordinator.set_dcp(config.collect_dcp, config.metric_groups.clone());

        // Scrape server.
        let server_cancel = CancellationToken::new();
        let server_task = {
            let server = server.clone();
            let cancel = server_cancel.clone();
            let address = config.address.clone();
            tokio::spawn(async move { server.run(&address, cancel).await })
        };

        // Watchers feed reload events into one queue.
        let (event_tx, mut event_rx) = tokio::sync::mpsc::unbounded_channel::<ReloadEvent>();

        let file_task = {
            let tx = event_tx.clone();
            let cancel = watcher_cancel.clone();
            let collectors_file = config.collectors_file.clone();
            tokio::spawn(async move {
                let watcher = FileWatcher::new(collectors_file);
                let result = watcher
                    .watch(cancel, move || {
                        info!("config file changed - triggering hot reload");
                        let _ = tx.send(ReloadEvent::ConfigChanged);
                    })
                    .await;
                if let Err(e) = result {
                    error!(error = %e, "file watcher failed");
                }
            })
        };

        // Bind/unbind watching handles topology changes gracefully when
        // enabled; the self-heal watcher runs alongside it either way.
        let bind_unbind_task = if config.enable_gpu_bind_unbind_watch {
            let tx = event_tx.clone();
            let cancel = watcher_cancel.clone();
            let poll_interval = config.gpu_bind_unbind_poll_interval;
            Some(tokio::spawn(async move {
                let watcher = GpuBindUnbindWatcher::new(poll_interval);
                let result = watcher
                    .watch(cancel, move || {
                        let _ = tx.send(ReloadEvent::TopologyChanged);
                    })
                    .await;
                if let Err(e) = result {
                    error!(error = %e, "GPU bind/unbind watcher failed");
                }
            }))
        } else {
            None
        };

        let topology_task = {
            let cancel = watcher_cancel.clone();
            tokio::spawn(async move {
                let watcher = TopologyWatcher::new(TOPOLOGY_WATCH_INTERVAL);
                if let Err(e) = watcher.watch(cancel).await {
                    error!(error = %e, "topology watcher failed");
                }
            })
        };

        let mut sighup = signal(SignalKind::hangup())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigquit = signal(SignalKind::quit())?;

        loop {
            tokio::select! {
                Some(event) = event_rx.recv() => {
                    let result = match event {
                        ReloadEvent::ConfigChanged => coordinator.hot_reload().await,
                        ReloadEvent::TopologyChanged => coordinator.topology_reload().await,
                    };
                    if let Err(e) = result {
                        error!(error = %e, "reload failed");
                    }
                }
                _ = sighup.recv() => {
                    info!("SIGHUP received - triggering hot reload");
                    if let Err(e) = coordinator.hot_reload().await {
                        error!(error = %e, "hot reload failed");
                    }
                }
                _ = sigint.recv() => { info!("SIGINT received"); break; }
                _ = sigterm.recv() => { info!("SIGTERM received"); break; }
                _ = sigquit.recv() => { info!("SIGQUIT received"); break; }
            }
        }

        info!("shutting down gracefully");

        // Watchers first so nothing re-triggers a reload mid-teardown.
        watcher_cancel.cancel();
        let _ = file_task.await;
        if let Some(task) = bind_unbind_task {
            let _ = task.await;
        }
        let _ = topology_task.await;

        server_cancel.cancel();
        let _ = server_task.await;

        if let Some(registry) = server.clear_registry() {
            registry.cleanup().await;
        }
        facade::reset();
        process::reset();

        info!("shutdown complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpuscope_core::fields;
    use gpuscope_core::{Entity, FieldSample};
    use gpuscope_device::facade::set_client;
    use gpuscope_device::SimulatedFabric;
    use std::sync::{Mutex, MutexGuard};

    static SIM_LOCK: Mutex<()> = Mutex::new(());

    fn lock() -> MutexGuard<'static, ()> {
        SIM_LOCK.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[tokio::test]
    async fn test_build_registry_with_fake_fabric() {
        let _guard = lock();
        let fabric = Arc::new(SimulatedFabric::default_fabric());
        fabric.set_value(
            Entity::new(EntityGroup::Gpu, 0),
            FieldSample::int64(fields::DCGM_FI_DEV_GPU_UTIL, 55),
        );
        set_client(fabric);

        let dir = tempfile::tempdir().unwrap();
        let counters_file = dir.path().join("counters.csv");
        std::fs::write(&counters_file, "DCGM_FI_DEV_GPU_UTIL,gauge,GPU utilization\n").unwrap();

        let mut config = AppConfig::default();
        config.collectors_file = counters_file;
        config.use_fake_gpus = true;

        let (registry, manager) = build_registry(&config).await.unwrap();
        assert!(manager.entity_watch_list(EntityGroup::Gpu).is_some());

        let gather = registry.gather().await.unwrap();
        let gpu_metrics = &gather[&EntityGroup::Gpu];
        let samples = gpu_metrics.values().next().unwrap();
        assert_eq!(samples[0].value, "55");

        registry.cleanup().await;
    }

    #[tokio::test]
    async fn test_build_registry_fails_without_counters_file() {
        let _guard = lock();
        set_client(Arc::new(SimulatedFabric::default_fabric()));

        let mut config = AppConfig::default();
        config.collectors_file = "/nonexistent/counters.csv".into();
        assert!(build_registry(&config).await.is_err());
    }

    #[test]
    fn test_query_metric_groups_disables_dcp_on_error() {
        let _guard = lock();
        let fabric = Arc::new(SimulatedFabric::default_fabric());
        fabric.break_connection();
        set_client(fabric);

        let mut config = AppConfig::default();
        config.collect_dcp = true;
        query_metric_groups(&mut config);
        assert!(!config.collect_dcp);
        assert!(config.metric_groups.is_empty());
    }
}
