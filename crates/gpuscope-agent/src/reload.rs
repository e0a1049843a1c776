//! Reload coordinator
//!
//! Owns the registry lifecycle: single-flight, rate-limited reloads that
//! clear, drain, rebuild, and publish without ever exposing a half-swapped
//! registry. A topology reload additionally tears the device library down
//! and re-initializes it. Topology events arriving mid-reload are queued and
//! executed exactly once afterwards. A reload must never kill the process:
//! panics are recovered and converted to errors.

use crate::cli::Cli;
use crate::server::MetricsServer;
use crate::{agent, AgentError, Result};
use futures::FutureExt;
use gpuscope_core::config::MetricGroup;
use gpuscope_core::EntityGroup;
use gpuscope_device::facade;
use gpuscope_kube::PodIdentityResolver;
use once_cell::sync::Lazy;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

static PROCESS_START: Lazy<Instant> = Lazy::new(Instant::now);

fn monotonic_ms() -> i64 {
    PROCESS_START.elapsed().as_millis() as i64
}

/// The two reload flavors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadKind {
    /// Config change: rebuild the registry, keep the device library.
    Hot,
    /// GPU bind/unbind: full device-library cleanup and re-init first.
    Topology,
}

/// Coordinates registry hot-swaps.
pub struct ReloadCoordinator {
    server: Arc<MetricsServer>,
    cli: Cli,
    resolver: Option<Arc<PodIdentityResolver>>,

    reload_counter: AtomicU64,
    last_reload_ms: AtomicI64,
    pending_topology: AtomicBool,
    min_interval: Duration,

    /// Profiling-group state carried across hot reloads; only a topology
    /// reload re-queries the profiling API.
    dcp: Mutex<(bool, Vec<MetricGroup>)>,
}

impl ReloadCoordinator {
    pub fn new(
        server: Arc<MetricsServer>,
        cli: Cli,
        resolver: Option<Arc<PodIdentityResolver>>,
        min_interval: Duration,
    ) -> Self {
        Self {
            server,
            cli,
            resolver,
            reload_counter: AtomicU64::new(0),
            last_reload_ms: AtomicI64::new(-(min_interval.as_millis() as i64)),
            pending_topology: AtomicBool::new(false),
            min_interval,
            dcp: Mutex::new((false, Vec::new())),
        }
    }

    /// Record the profiling-group state captured at startup.
    pub fn set_dcp(&self, collect: bool, groups: Vec<MetricGroup>) {
        *self.dcp.lock().unwrap_or_else(|e| e.into_inner()) = (collect, groups);
    }

    pub fn reload_count(&self) -> u64 {
        self.reload_counter.load(Ordering::SeqCst)
    }

    /// Whether a topology event is queued behind an in-flight reload.
    pub fn has_pending_topology_event(&self) -> bool {
        self.pending_topology.load(Ordering::SeqCst)
    }

    /// Hot reload: rebuild the registry from current config. Recovers any
    /// panic and converts it to an error.
    pub async fn hot_reload(&self) -> Result<()> {
        match AssertUnwindSafe(self.hot_reload_inner()).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => {
                let value = panic_message(payload.as_ref());
                error!(
                    panic_value = %value,
                    reload_id = self.reload_counter.load(Ordering::SeqCst),
                    stack = %std::backtrace::Backtrace::force_capture(),
                    "panic recovered in hot reload"
                );
                self.server.set_reload_in_progress(false);
                Err(AgentError::Other(anyhow::anyhow!("hot reload panic: {}", value)))
            }
        }
    }

    async fn hot_reload_inner(&self) -> Result<()> {
        if self.server.is_reload_in_progress() {
            warn!("hot reload already in progress - ignoring duplicate request");
            return Ok(());
        }

        let since_last = monotonic_ms() - self.last_reload_ms.load(Ordering::SeqCst);
        if since_last < self.min_interval.as_millis() as i64 {
            warn!(
                ms_since_last = since_last,
                min_interval_ms = self.min_interval.as_millis() as u64,
                "hot reload rate limited - too soon after previous reload"
            );
            return Ok(());
        }

        let reload_id = self.reload_counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.last_reload_ms.store(monotonic_ms(), Ordering::SeqCst);
        let started = Instant::now();
        info!(reload_id, "hot reload triggered - building new registry");

        self.server.set_reload_in_progress(true);
        let result = self.swap_registry(reload_id, ReloadKind::Hot).await;
        self.server.set_reload_in_progress(false);

        if result.is_ok() {
            info!(reload_id, duration_ms = started.elapsed().as_millis() as u64,
                "hot reload complete");
        }

        // Execute a topology event that was queued while this reload ran.
        if self.pending_topology.swap(false, Ordering::SeqCst) {
            info!("processing queued GPU topology change event");
            self.topology_reload_impl(true).await?;
        }

        result
    }

    /// Topology reload: full device-library reset plus registry rebuild.
    /// Coalesces with an in-flight reload instead of stacking.
    pub async fn topology_reload(&self) -> Result<()> {
        self.topology_reload_impl(false).await
    }

    async fn topology_reload_impl(&self, queued: bool) -> Result<()> {
        if !queued {
            let since_last = monotonic_ms() - self.last_reload_ms.load(Ordering::SeqCst);
            if since_last < self.min_interval.as_millis() as i64 {
                warn!(ms_since_last = since_last,
                    "ignoring topology change - too soon after last reload");
                return Ok(());
            }
            if self.server.is_reload_in_progress() {
                warn!("reload in progress - queuing topology change event");
                self.pending_topology.store(true, Ordering::SeqCst);
                return Ok(());
            }
        }

        let reload_id = self.reload_counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.last_reload_ms.store(monotonic_ms(), Ordering::SeqCst);
        info!(reload_id, "GPU topology change detected - full reset");

        self.server.set_reload_in_progress(true);
        let result = self.swap_registry(reload_id, ReloadKind::Topology).await;
        self.server.set_reload_in_progress(false);
        result
    }

    /// The swap state machine: clear, drain, (reset device library,)
    /// rebuild, publish.
    async fn swap_registry(&self, reload_id: u64, kind: ReloadKind) -> Result<()> {
        info!(reload_id, phase = "clearing",
            "clearing registry - /metrics will return empty until rebuild completes");
        let old_registry = self.server.clear_registry();

        if let Some(old_registry) = old_registry {
            info!(reload_id, phase = "draining", "waiting for in-flight scrapes to complete");
            old_registry.cleanup().await;
        }

        if kind == ReloadKind::Topology {
            info!(reload_id, "cleaning up device library resources");
            facade::reset();
            let config = self.cli.to_config()?;
            info!(reload_id, "reinitializing device library");
            facade::initialize(&config);
        }

        info!(reload_id, phase = "rebuilding", "building new registry for current topology");
        let mut config = self.cli.to_config()?;
        match kind {
            ReloadKind::Hot => {
                // Re-querying the profiling API during arbitrary GPU state is
                // unsafe; hot reloads reuse the startup answer.
                let (collect, groups) = self.dcp.lock().unwrap_or_else(|e| e.into_inner()).clone();
                config.collect_dcp = collect;
                config.metric_groups = groups;
            }
            ReloadKind::Topology => {
                agent::query_metric_groups(&mut config);
                self.set_dcp(config.collect_dcp, config.metric_groups.clone());
            }
        }

        let (registry, manager) = agent::build_registry(&config).await?;
        if let Some(resolver) = &self.resolver {
            if let Some(watch_list) = manager.entity_watch_list(EntityGroup::Gpu) {
                resolver.set_inventory(watch_list.inventory().clone());
            }
        }

        info!(reload_id, phase = "publishing",
            "activating new registry - /metrics now serves updated metrics");
        self.server.set_registry(registry);
        Ok(())
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
