//! GPU process source
//!
//! Resolves MIG device UUIDs to their parent GPU and instance ids, and
//! enumerates the processes currently running on every GPU. Backed by the
//! driver-level management library in production; the in-memory source here
//! serves fake-GPU mode and tests through the same singleton seam.

use gpuscope_core::{Error, Result};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

/// Identity of a MIG device resolved from its UUID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigDeviceInfo {
    pub parent_uuid: String,
    pub gpu_instance_id: i32,
    pub compute_instance_id: i32,
}

/// One process observed on a GPU or MIG instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuProcessInfo {
    pub device_index: u32,
    pub pid: u32,
    /// `"C"` for compute, `"G"` for graphics
    pub kind: String,
    /// Full command path as read from `/proc/<pid>/cmdline`
    pub command: String,
    pub memory_mb: u64,
    /// UUID of the GPU or MIG instance the process runs on
    pub uuid: String,
    /// Physical GPU UUID; equals `uuid` for non-MIG processes
    pub parent_uuid: String,
}

/// Capability surface of the process source.
pub trait ProcessLib: Send + Sync {
    /// Resolve a `MIG-...` device UUID to its parent and instance ids.
    fn mig_device_info(&self, uuid: &str) -> Result<MigDeviceInfo>;

    /// All processes currently running on any GPU.
    fn gpu_processes(&self) -> Result<Vec<GpuProcessInfo>>;

    /// UUIDs of the physical GPUs currently visible to the driver.
    fn gpu_uuids(&self) -> Result<Vec<String>>;

    fn cleanup(&self);
}

static CLIENT: Lazy<RwLock<Option<Arc<dyn ProcessLib>>>> = Lazy::new(|| RwLock::new(None));

/// Install the process-wide process source.
pub fn initialize() {
    set_client(Arc::new(SimProcessSource::new()));
}

pub fn set_client(client: Arc<dyn ProcessLib>) {
    *CLIENT.write().expect("process client lock poisoned") = Some(client);
}

pub fn client() -> Result<Arc<dyn ProcessLib>> {
    CLIENT
        .read()
        .expect("process client lock poisoned")
        .clone()
        .ok_or_else(|| Error::device("process source not initialized"))
}

pub fn reset() {
    let client = CLIENT.write().expect("process client lock poisoned").take();
    if let Some(client) = client {
        client.cleanup();
    }
}

/// Parse the pre-R470 MIG UUID convention `MIG-<GPU-UUID>/<gi>/<ci>`.
pub fn parse_mig_uuid(uuid: &str) -> Result<MigDeviceInfo> {
    let rest = uuid
        .strip_prefix("MIG-")
        .ok_or_else(|| Error::device(format!("unable to parse '{}' as MIG device UUID", uuid)))?;

    let tokens: Vec<&str> = rest.splitn(3, '/').collect();
    if tokens.len() != 3 || !tokens[0].starts_with("GPU-") {
        return Err(Error::device(format!("invalid MIG device UUID '{}'", uuid)));
    }

    let gpu_instance_id: i32 = tokens[1]
        .parse()
        .map_err(|_| Error::device(format!("invalid GPU instance ID '{}' for '{}'", tokens[1], uuid)))?;
    let compute_instance_id: i32 = tokens[2]
        .parse()
        .map_err(|_| Error::device(format!("invalid compute instance ID '{}' for '{}'", tokens[2], uuid)))?;

    Ok(MigDeviceInfo {
        parent_uuid: tokens[0].to_string(),
        gpu_instance_id,
        compute_instance_id,
    })
}

/// Full command path for a PID, from `/proc/<pid>/cmdline` with a
/// `/proc/<pid>/comm` fallback.
pub fn process_command(pid: u32) -> String {
    if let Ok(data) = std::fs::read(format!("/proc/{}/cmdline", pid)) {
        let first = data.split(|&b| b == 0).next().unwrap_or(&[]);
        if !first.is_empty() {
            if let Ok(s) = String::from_utf8(first.to_vec()) {
                return s;
            }
        }
    }
    if let Ok(comm) = std::fs::read_to_string(format!("/proc/{}/comm", pid)) {
        let comm = comm.trim();
        if !comm.is_empty() {
            return comm.to_string();
        }
    }
    "unknown".to_string()
}

/// In-memory process source for fake-GPU mode and tests.
#[derive(Default)]
pub struct SimProcessSource {
    state: Mutex<SimProcessState>,
}

#[derive(Default)]
struct SimProcessState {
    mig_devices: HashMap<String, MigDeviceInfo>,
    processes: Vec<GpuProcessInfo>,
    gpu_uuids: Vec<String>,
}

impl SimProcessSource {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimProcessState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_mig_device(&self, uuid: impl Into<String>, info: MigDeviceInfo) {
        self.lock().mig_devices.insert(uuid.into(), info);
    }

    pub fn set_processes(&self, processes: Vec<GpuProcessInfo>) {
        self.lock().processes = processes;
    }

    pub fn set_gpu_uuids(&self, uuids: Vec<String>) {
        self.lock().gpu_uuids = uuids;
    }
}

impl ProcessLib for SimProcessSource {
    fn mig_device_info(&self, uuid: &str) -> Result<MigDeviceInfo> {
        if let Some(info) = self.lock().mig_devices.get(uuid) {
            return Ok(info.clone());
        }
        // Old-driver UUIDs encode the identity directly.
        parse_mig_uuid(uuid)
    }

    fn gpu_processes(&self) -> Result<Vec<GpuProcessInfo>> {
        Ok(self.lock().processes.clone())
    }

    fn gpu_uuids(&self) -> Result<Vec<String>> {
        Ok(self.lock().gpu_uuids.clone())
    }

    fn cleanup(&self) {
        let mut st = self.lock();
        st.mig_devices.clear();
        st.processes.clear();
        st.gpu_uuids.clear();
    }
}
