//! Uniform capability surface over the GPU management library
//!
//! The [`DeviceLib`] trait mirrors the library's group/field-group lifecycle,
//! entity value reads, and topology enumeration. Exactly one client is
//! installed process-wide at a time; a registry is only valid against the
//! client that was current when it was built.

use gpuscope_core::config::AppConfig;
use gpuscope_core::fields::FieldMeta;
use gpuscope_core::{Entity, Error, FieldSample, MetricGroup, Result};
use once_cell::sync::Lazy;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

/// Handle to an entity group owned by the device library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupHandle(pub u64);

/// Handle to a field group owned by the device library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldGroupHandle(pub u64);

/// A MIG instance of a physical GPU.
#[derive(Debug, Clone, PartialEq)]
pub struct GpuInstanceInfo {
    /// Entity id of the GPU instance in the device library
    pub entity_id: u32,
    pub parent_uuid: String,
    /// NVML GPU instance id (the id kubelet device ids carry)
    pub gpu_instance_id: u32,
    pub compute_instance_id: u32,
    /// Profile string, e.g. `1g.5gb`
    pub profile: String,
}

/// One NvLink endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkInfo {
    pub index: u32,
    /// Entity id of the parent GPU or NvSwitch
    pub parent_id: u32,
    pub up: bool,
}

/// A physical GPU with its MIG hierarchy and links.
#[derive(Debug, Clone, PartialEq)]
pub struct GpuDeviceInfo {
    pub index: u32,
    pub uuid: String,
    pub model: String,
    pub pci_bus_id: String,
    pub mig_enabled: bool,
    pub instances: Vec<GpuInstanceInfo>,
    pub nvlinks: Vec<LinkInfo>,
}

/// An NvSwitch with its links.
#[derive(Debug, Clone, PartialEq)]
pub struct SwitchInfo {
    pub entity_id: u32,
    pub links: Vec<LinkInfo>,
}

/// A CPU socket with its cores.
#[derive(Debug, Clone, PartialEq)]
pub struct CpuInfo {
    pub entity_id: u32,
    pub cores: Vec<u32>,
}

/// Capability surface of the GPU management library.
pub trait DeviceLib: Send + Sync {
    /// Field metadata for a field id.
    fn field_meta(&self, field_id: u16) -> Option<&'static FieldMeta> {
        gpuscope_core::fields::by_id(field_id)
    }

    /// Profiling metric groups supported by the given GPU.
    fn supported_metric_groups(&self, gpu_index: u32) -> Result<Vec<MetricGroup>>;

    fn create_group(&self, name: &str) -> Result<GroupHandle>;
    fn add_entity_to_group(&self, group: GroupHandle, entity: Entity) -> Result<()>;
    fn add_link_to_group(&self, group: GroupHandle, link_index: u32, parent: Entity) -> Result<()>;
    fn destroy_group(&self, group: GroupHandle) -> Result<()>;

    fn create_field_group(&self, name: &str, fields: &[u16]) -> Result<FieldGroupHandle>;
    fn destroy_field_group(&self, field_group: FieldGroupHandle) -> Result<()>;

    fn watch_fields(
        &self,
        field_group: FieldGroupHandle,
        group: GroupHandle,
        update_freq_us: i64,
        max_keep_age_secs: f64,
        max_keep_samples: i32,
    ) -> Result<()>;
    fn unwatch_fields(&self, field_group: FieldGroupHandle, group: GroupHandle) -> Result<()>;

    /// Force a field-value refresh cycle.
    fn update_all_fields(&self) -> Result<()>;

    /// Latest values of the given fields for one entity.
    fn entity_latest(&self, entity: Entity, fields: &[u16]) -> Result<Vec<FieldSample>>;

    /// Latest values of the given fields for one NvLink.
    fn link_latest(&self, link_index: u32, parent: Entity, fields: &[u16])
        -> Result<Vec<FieldSample>>;

    fn all_gpus(&self) -> Result<Vec<GpuDeviceInfo>>;
    fn all_switches(&self) -> Result<Vec<SwitchInfo>>;
    fn all_cpus(&self) -> Result<Vec<CpuInfo>>;

    /// The library's built-in all-GPUs group.
    fn group_all_gpus(&self) -> GroupHandle;

    fn device_info(&self, gpu_index: u32) -> Result<GpuDeviceInfo>;

    /// Release every library resource. Idempotent.
    fn cleanup(&self);
}

static CLIENT: Lazy<RwLock<Option<Arc<dyn DeviceLib>>>> = Lazy::new(|| RwLock::new(None));

/// Install the process-wide device library client.
///
/// The host-engine integration is an external collaborator; when it is not
/// compiled in (or fake GPUs are requested) the simulated fabric backs the
/// facade.
pub fn initialize(config: &AppConfig) {
    if !config.use_fake_gpus {
        warn!("host engine integration not available in this build, using simulated fabric");
    } else {
        info!("initializing simulated GPU fabric (fake GPUs enabled)");
    }
    set_client(Arc::new(crate::sim::SimulatedFabric::default_fabric()));
}

/// Replace the current client. Used by `initialize` and by tests.
pub fn set_client(client: Arc<dyn DeviceLib>) {
    *CLIENT.write().expect("device client lock poisoned") = Some(client);
}

/// Retrieve the current client.
pub fn client() -> Result<Arc<dyn DeviceLib>> {
    try_client().ok_or_else(|| Error::device("device library client not initialized"))
}

/// Retrieve the current client if one is installed. Cleanup paths use this
/// so they become no-ops after the facade is torn down.
pub fn try_client() -> Option<Arc<dyn DeviceLib>> {
    CLIENT.read().expect("device client lock poisoned").clone()
}

/// Tear down the current client and clear the singleton.
pub fn reset() {
    let client = CLIENT.write().expect("device client lock poisoned").take();
    if let Some(client) = client {
        client.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedFabric;

    #[test]
    fn test_client_lifecycle() {
        let _guard = crate::testlock::lock();
        set_client(Arc::new(SimulatedFabric::default_fabric()));
        assert!(try_client().is_some());
        assert!(client().is_ok());

        reset();
        assert!(try_client().is_none());
        assert!(client().is_err());

        // Restore a client so tests sharing the process-wide singleton are
        // not left without one.
        set_client(Arc::new(SimulatedFabric::default_fabric()));
    }
}
