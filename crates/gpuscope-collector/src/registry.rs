//! Registry and concurrent gather
//!
//! The registry groups collectors by entity type and runs a scrape as a
//! concurrent fan-out. It is immutable once published: a reload replaces the
//! whole registry, never mutates one. In-flight gathers are tracked so that
//! teardown can drain them before device-library resources are released.

use crate::Collector;
use gpuscope_core::{EntityGroup, Error, MetricsByCounterGroup, Result};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, warn};

const CLEANUP_MAX_WAIT: Duration = Duration::from_secs(2);
const CLEANUP_BACKOFF_START: Duration = Duration::from_millis(1);
const CLEANUP_BACKOFF_CAP: Duration = Duration::from_millis(100);

/// Collector registry with in-flight gather tracking.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    collectors: RwLock<HashMap<EntityGroup, Vec<Arc<dyn Collector>>>>,
    seen: std::sync::Mutex<HashSet<(EntityGroup, String)>>,
    active_gathers: AtomicI32,
    shutting_down: AtomicBool,
}

/// Decrements the in-flight counter on every exit path of a gather.
struct GatherGuard<'a>(&'a AtomicI32);

impl Drop for GatherGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                collectors: RwLock::new(HashMap::new()),
                seen: std::sync::Mutex::new(HashSet::new()),
                active_gathers: AtomicI32::new(0),
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    /// Register a collector for an entity group. Idempotent on
    /// `(entity group, collector name)`.
    pub async fn register(&self, group: EntityGroup, collector: Arc<dyn Collector>) {
        {
            let mut seen = self.inner.seen.lock().unwrap_or_else(|e| e.into_inner());
            if !seen.insert((group, collector.name().to_string())) {
                return;
            }
        }
        self.inner.collectors.write().await.entry(group).or_default().push(collector);
    }

    /// Number of gathers currently in flight.
    pub fn active_gathers(&self) -> i32 {
        self.inner.active_gathers.load(Ordering::SeqCst)
    }

    /// Gather metrics from all registered collectors concurrently.
    ///
    /// Returns [`Error::RegistryShuttingDown`] once cleanup has begun. Any
    /// collector error fails the whole gather.
    pub async fn gather(&self) -> Result<MetricsByCounterGroup> {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(Error::RegistryShuttingDown);
        }

        self.inner.active_gathers.fetch_add(1, Ordering::SeqCst);
        let _guard = GatherGuard(&self.inner.active_gathers);

        // Shared lock: concurrent gathers are fine, cleanup takes the
        // exclusive lock only after the drain.
        let collectors = self.inner.collectors.read().await;

        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(Error::RegistryShuttingDown);
        }

        let mut tasks = Vec::new();
        for (&group, group_collectors) in collectors.iter() {
            for collector in group_collectors {
                let collector = Arc::clone(collector);
                tasks.push(tokio::spawn(async move {
                    (group, collector.metrics().await)
                }));
            }
        }

        let mut output = MetricsByCounterGroup::new();
        for task in tasks {
            let (group, result) =
                task.await.map_err(|e| Error::internal(format!("gather task failed: {}", e)))?;
            let metrics = result?;

            let by_counter = output.entry(group).or_default();
            for (counter, mut samples) in metrics {
                by_counter.entry(counter).or_default().append(&mut samples);
            }
        }

        Ok(output)
    }

    /// Tear the registry down: block new gathers, drain in-flight ones with
    /// exponential backoff, then clean up every collector under the
    /// exclusive lock.
    pub async fn cleanup(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);

        let start = Instant::now();
        let mut backoff = CLEANUP_BACKOFF_START;
        loop {
            let active = self.inner.active_gathers.load(Ordering::SeqCst);
            if active == 0 {
                break;
            }
            if start.elapsed() >= CLEANUP_MAX_WAIT {
                warn!(
                    active_gathers = active,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "registry cleanup timed out waiting for active gathers"
                );
                break;
            }
            debug!(active_gathers = active, "waiting for active gathers before cleanup");
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(CLEANUP_BACKOFF_CAP);
        }

        // Exclusive lock: no gather can observe half-torn-down collectors.
        let collectors = self.inner.collectors.write().await;
        for group_collectors in collectors.values() {
            for collector in group_collectors {
                collector.cleanup();
            }
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
