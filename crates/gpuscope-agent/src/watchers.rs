//! Watchers feeding the reload coordinator
//!
//! Three watchers, all with the same contract: block until the cancellation
//! token fires, invoke `on_change` for every observed change, and return
//! cleanly on shutdown.
//!
//! - file watcher: counters-file changes (debounced, mtime-compared)
//! - GPU bind/unbind watcher: the global driver attach/detach event field
//! - topology watcher: self-heal on GPU UUID set changes

use gpuscope_core::fields::{
    BIND_UNBIND_SYSTEM_REINITIALIZATION_COMPLETED, BIND_UNBIND_SYSTEM_REINITIALIZING,
    DCGM_FI_BIND_UNBIND_EVENT,
};
use gpuscope_core::{Entity, EntityGroup, Error, Result};
use gpuscope_device::{facade, process};
use notify::{EventKind, RecursiveMode, Watcher as _};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(200);
const MAX_CONSECUTIVE_TOPOLOGY_FAILURES: u32 = 3;

/// Watches one file for content changes through filesystem notifications.
///
/// The containing directory is watched (editors replace files), events are
/// filtered to the file, debounced, and only a changed mtime emits a change.
/// The initial mtime is captured at start so boot does not look like a
/// change.
pub struct FileWatcher {
    file_path: PathBuf,
    debounce: Duration,
}

impl FileWatcher {
    pub fn new(file_path: impl Into<PathBuf>) -> Self {
        Self { file_path: file_path.into(), debounce: DEFAULT_DEBOUNCE }
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub async fn watch(
        &self,
        cancel: CancellationToken,
        on_change: impl Fn() + Send,
    ) -> Result<()> {
        info!(file = %self.file_path.display(), debounce_ms = self.debounce.as_millis() as u64,
            "watching for changes in file");

        let dir = self
            .file_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let file_name = self
            .file_path
            .file_name()
            .ok_or_else(|| Error::config("file watcher needs a file path, not a directory"))?
            .to_owned();

        let (tx, mut rx) = tokio::sync::mpsc::channel::<notify::Result<notify::Event>>(64);
        let mut watcher = notify::recommended_watcher(move |event| {
            let _ = tx.blocking_send(event);
        })
        .map_err(|e| Error::internal(format!("failed to create file watcher: {}", e)))?;
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| Error::internal(format!("failed to watch directory {}: {}", dir.display(), e)))?;

        let mut last_mtime = std::fs::metadata(&self.file_path)
            .and_then(|m| m.modified())
            .ok();
        let mut deadline: Option<tokio::time::Instant> = None;

        loop {
            let debounce_expired = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(file = %self.file_path.display(), "file watcher stopping");
                    return Ok(());
                }

                _ = debounce_expired => {
                    deadline = None;
                    let mtime = std::fs::metadata(&self.file_path)
                        .and_then(|m| m.modified())
                        .ok();
                    if mtime.is_some() && mtime != last_mtime {
                        last_mtime = mtime;
                        on_change();
                    }
                }

                event = rx.recv() => {
                    let Some(event) = event else {
                        return Err(Error::internal("file watcher events channel closed"));
                    };
                    match event {
                        Ok(event) => {
                            let relevant = matches!(
                                event.kind,
                                EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                            ) && event
                                .paths
                                .iter()
                                .any(|p| p.file_name() == Some(file_name.as_os_str()));
                            if relevant {
                                deadline =
                                    Some(tokio::time::Instant::now() + self.debounce);
                            }
                        }
                        Err(e) => {
                            warn!(file = %self.file_path.display(), error = %e,
                                "file watcher error");
                        }
                    }
                }
            }
        }
    }
}

/// Watches the global GPU bind/unbind event field for driver attach/detach.
pub struct GpuBindUnbindWatcher {
    poll_interval: Duration,
}

impl GpuBindUnbindWatcher {
    pub fn new(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }

    pub async fn watch(
        &self,
        cancel: CancellationToken,
        on_change: impl Fn() + Send,
    ) -> Result<()> {
        info!(poll_interval_ms = self.poll_interval.as_millis() as u64,
            "watching for GPU bind/unbind events");

        let client = facade::client()?;
        let field_group = match client
            .create_field_group("gpuscope-bind-unbind-watch", &[DCGM_FI_BIND_UNBIND_EVENT])
        {
            Ok(field_group) => field_group,
            Err(Error::NvmlMissing(_)) => {
                warn!("GPU bind/unbind watcher disabled - NVML not available on this system");
                return Ok(());
            }
            Err(e) => {
                return Err(Error::device(format!(
                    "failed to create bind/unbind field group: {}",
                    e
                )));
            }
        };

        let group = client.group_all_gpus();
        if let Err(e) = client.watch_fields(
            field_group,
            group,
            self.poll_interval.as_micros() as i64,
            0.0,
            0,
        ) {
            Self::release(field_group, group);
            return Err(Error::device(format!("failed to watch bind/unbind events: {}", e)));
        }

        let result = self.poll_loop(cancel, on_change).await;
        Self::release(field_group, group);
        result
    }

    fn release(field_group: gpuscope_device::FieldGroupHandle, group: gpuscope_device::GroupHandle) {
        // The facade may already be torn down by a topology reload.
        let Some(client) = facade::try_client() else {
            return;
        };
        if let Err(e) = client.unwatch_fields(field_group, group) {
            if !e.is_benign_cleanup() {
                warn!(error = %e, "failed to unwatch bind/unbind events");
            }
        }
        if let Err(e) = client.destroy_field_group(field_group) {
            if !e.is_benign_cleanup() {
                warn!(error = %e, "failed to destroy bind/unbind field group");
            }
        }
    }

    async fn poll_loop(&self, cancel: CancellationToken, on_change: impl Fn() + Send) -> Result<()> {
        // Start from the current state: topology CHANGES are interesting,
        // not whatever the field already reads at boot.
        let mut last_event_ts = self.read_event().map(|(_, ts)| ts).unwrap_or(0);
        info!("successfully started watching GPU bind/unbind events");

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("GPU bind/unbind watcher stopping");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    let Some((value, ts)) = self.read_event() else {
                        continue;
                    };
                    if ts > last_event_ts && value != 0 {
                        last_event_ts = ts;
                        match value {
                            BIND_UNBIND_SYSTEM_REINITIALIZING => {
                                info!(event_state = value, timestamp = ts,
                                    "GPU unbind event detected (system reinitializing)");
                                on_change();
                            }
                            BIND_UNBIND_SYSTEM_REINITIALIZATION_COMPLETED => {
                                info!(event_state = value, timestamp = ts,
                                    "GPU bind event detected (reinitialization completed)");
                                on_change();
                            }
                            _ => {}
                        }
                    }
                }
            }
        }
    }

    fn read_event(&self) -> Option<(i64, i64)> {
        let client = facade::try_client()?;
        if let Err(e) = client.update_all_fields() {
            warn!(error = %e, "failed to update fields for bind/unbind check");
            return None;
        }
        // The field is global; entity id 0 is only an addressing formality.
        let samples = client
            .entity_latest(Entity::new(EntityGroup::Gpu, 0), &[DCGM_FI_BIND_UNBIND_EVENT])
            .ok()?;
        let sample = samples.first()?;
        if sample.sentinel {
            return None;
        }
        Some((sample.as_i64()?, sample.timestamp_us))
    }
}

/// True iff the two UUID multisets differ, regardless of order.
pub fn topology_changed(old_uuids: &[String], new_uuids: &[String]) -> bool {
    if old_uuids.len() != new_uuids.len() {
        return true;
    }
    let mut old_sorted = old_uuids.to_vec();
    let mut new_sorted = new_uuids.to_vec();
    old_sorted.sort();
    new_sorted.sort();
    old_sorted != new_sorted
}

/// Self-heal watcher: exits the process when the GPU UUID set changes or the
/// driver stops answering, so the orchestrator restarts the exporter into a
/// clean state.
pub struct TopologyWatcher {
    interval: Duration,
}

impl TopologyWatcher {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    pub async fn watch(&self, cancel: CancellationToken) -> Result<()> {
        info!(interval_secs = self.interval.as_secs(), "starting GPU topology watcher");

        let initial = match self.snapshot_with_retry(3).await {
            Ok(uuids) => uuids,
            Err(e) => {
                error!(error = %e,
                    "failed to get initial GPU UUIDs, self-healing might not work correctly");
                return Ok(());
            }
        };
        info!(uuids = ?initial, "initial GPU topology captured");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut consecutive_failures = 0u32;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {
                    let current = process::client().and_then(|c| c.gpu_uuids());
                    match current {
                        Err(e) => {
                            consecutive_failures += 1;
                            warn!(failure_count = consecutive_failures, error = %e,
                                "failed to get current GPU UUIDs");
                            if consecutive_failures >= MAX_CONSECUTIVE_TOPOLOGY_FAILURES {
                                error!("too many consecutive failures getting GPU UUIDs, \
                                    initiating self-healing restart");
                                std::process::exit(1);
                            }
                        }
                        Ok(current) => {
                            consecutive_failures = 0;
                            if topology_changed(&initial, &current) {
                                info!(old_uuids = ?initial, new_uuids = ?current,
                                    "GPU topology change detected, initiating self-restart");
                                std::process::exit(1);
                            }
                        }
                    }
                }
            }
        }
    }

    async fn snapshot_with_retry(&self, retries: u32) -> Result<Vec<String>> {
        let mut last_err = Error::device("no attempts made");
        for _ in 0..retries {
            match process::client().and_then(|c| c.gpu_uuids()) {
                Ok(uuids) => return Ok(uuids),
                Err(e) => last_err = e,
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        Err(last_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_topology_changed_is_order_insensitive() {
        let a = vec!["GPU-1".to_string(), "GPU-2".to_string()];
        let b = vec!["GPU-2".to_string(), "GPU-1".to_string()];
        assert!(!topology_changed(&a, &b));
        assert!(!topology_changed(&b, &a));
    }

    #[test]
    fn test_topology_changed_detects_multiset_differences() {
        let a = vec!["GPU-1".to_string(), "GPU-2".to_string()];
        let b = vec!["GPU-1".to_string()];
        let c = vec!["GPU-1".to_string(), "GPU-3".to_string()];
        // Symmetric in both directions.
        assert!(topology_changed(&a, &b));
        assert!(topology_changed(&b, &a));
        assert!(topology_changed(&a, &c));
        assert!(topology_changed(&c, &a));
        assert!(!topology_changed(&a, &a));

        // Duplicated UUIDs count as a multiset difference.
        let dup = vec!["GPU-1".to_string(), "GPU-1".to_string()];
        assert!(topology_changed(&a, &dup));
    }

    #[tokio::test]
    async fn test_file_watcher_fires_on_content_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("counters.csv");
        std::fs::write(&path, "DCGM_FI_DEV_GPU_UTIL,gauge,util\n").unwrap();

        let changes = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();

        let watcher_changes = changes.clone();
        let watcher_cancel = cancel.clone();
        let watcher_path = path.clone();
        let handle = tokio::spawn(async move {
            FileWatcher::new(watcher_path)
                .with_debounce(Duration::from_millis(20))
                .watch(watcher_cancel, move || {
                    watcher_changes.fetch_add(1, Ordering::SeqCst);
                })
                .await
        });

        // Give the watcher time to install, then modify the file. The mtime
        // comparison needs a tick of wall-clock separation.
        tokio::time::sleep(Duration::from_millis(150)).await;
        std::fs::write(&path, "DCGM_FI_DEV_GPU_UTIL,gauge,changed\n").unwrap();

        let mut fired = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if changes.load(Ordering::SeqCst) > 0 {
                fired = true;
                break;
            }
        }
        cancel.cancel();
        handle.await.unwrap().unwrap();
        assert!(fired, "expected a change notification after modifying the file");
    }

    #[tokio::test]
    async fn test_file_watcher_ignores_sibling_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("counters.csv");
        std::fs::write(&path, "a\n").unwrap();

        let changes = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();

        let watcher_changes = changes.clone();
        let watcher_cancel = cancel.clone();
        let watcher_path = path.clone();
        let handle = tokio::spawn(async move {
            FileWatcher::new(watcher_path)
                .with_debounce(Duration::from_millis(20))
                .watch(watcher_cancel, move || {
                    watcher_changes.fetch_add(1, Ordering::SeqCst);
                })
                .await
        });

        tokio::time::sleep(Duration::from_millis(150)).await;
        std::fs::write(dir.path().join("other.txt"), "noise\n").unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        cancel.cancel();
        handle.await.unwrap().unwrap();
        assert_eq!(changes.load(Ordering::SeqCst), 0);
    }
}
