//! In-memory simulated GPU fabric
//!
//! Backs the facade in fake-GPU mode and in tests. The simulation keeps the
//! same group/field-group/watch bookkeeping the real library has, so
//! lifecycle bugs (double destroy, unwatch after teardown) surface as the
//! same benign errors.

use crate::facade::{
    CpuInfo, DeviceLib, FieldGroupHandle, GpuDeviceInfo, GpuInstanceInfo, GroupHandle, LinkInfo,
    SwitchInfo,
};
use gpuscope_core::fields::{self, FieldKind};
use gpuscope_core::{Entity, EntityGroup, Error, FieldSample, FieldValue, MetricGroup, Result};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use tracing::debug;

/// Reserved handle for the library's built-in all-GPUs group.
const GROUP_ALL_GPUS: u64 = 0;

#[derive(Debug, Default)]
struct FabricState {
    gpus: Vec<GpuDeviceInfo>,
    switches: Vec<SwitchInfo>,
    cpus: Vec<CpuInfo>,
    metric_groups: Vec<MetricGroup>,

    values: HashMap<(Entity, u16), FieldSample>,
    link_values: HashMap<(u32, Entity, u16), FieldSample>,

    groups: HashSet<u64>,
    field_groups: HashMap<u64, Vec<u16>>,
    watches: HashSet<(u64, u64)>,
    next_handle: u64,

    connection_valid: bool,
    nvml_present: bool,
}

/// Simulated GPU fabric implementing [`DeviceLib`].
pub struct SimulatedFabric {
    state: Mutex<FabricState>,
}

impl SimulatedFabric {
    /// An empty fabric with no devices.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FabricState {
                next_handle: 1,
                connection_valid: true,
                nvml_present: true,
                ..Default::default()
            }),
        }
    }

    /// A single-GPU fabric with deterministic identity values, enough to
    /// serve as a scrape target out of the box.
    pub fn default_fabric() -> Self {
        let fabric = Self::new();
        let gpu = GpuDeviceInfo {
            index: 0,
            uuid: "GPU-00000000-0000-0000-0000-000000000000".to_string(),
            model: "NVIDIA A100-SXM4-80GB".to_string(),
            pci_bus_id: "00000000:07:00.0".to_string(),
            mig_enabled: false,
            instances: Vec::new(),
            nvlinks: Vec::new(),
        };
        fabric.add_gpu(gpu);
        fabric
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FabricState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add a GPU and seed its identity fields.
    pub fn add_gpu(&self, gpu: GpuDeviceInfo) {
        let mut st = self.lock();
        let entity = Entity::new(EntityGroup::Gpu, gpu.index);
        st.values.insert(
            (entity, fields::DCGM_FI_DEV_NAME),
            FieldSample::text(fields::DCGM_FI_DEV_NAME, gpu.model.clone()),
        );
        st.values.insert(
            (entity, fields::DCGM_FI_DEV_UUID),
            FieldSample::text(fields::DCGM_FI_DEV_UUID, gpu.uuid.clone()),
        );
        st.values.insert(
            (entity, fields::DCGM_FI_DEV_MIG_MODE),
            FieldSample::int64(fields::DCGM_FI_DEV_MIG_MODE, i64::from(gpu.mig_enabled)),
        );
        st.gpus.push(gpu);
    }

    /// Replace the whole GPU topology.
    pub fn set_gpus(&self, gpus: Vec<GpuDeviceInfo>) {
        let mut st = self.lock();
        st.gpus.clear();
        drop(st);
        for gpu in gpus {
            self.add_gpu(gpu);
        }
    }

    pub fn set_switches(&self, switches: Vec<SwitchInfo>) {
        self.lock().switches = switches;
    }

    pub fn set_cpus(&self, cpus: Vec<CpuInfo>) {
        self.lock().cpus = cpus;
    }

    pub fn set_metric_groups(&self, groups: Vec<MetricGroup>) {
        self.lock().metric_groups = groups;
    }

    /// Seed one field value for one entity.
    pub fn set_value(&self, entity: Entity, sample: FieldSample) {
        self.lock().values.insert((entity, sample.field_id), sample);
    }

    /// Seed one field value for one link.
    pub fn set_link_value(&self, link_index: u32, parent: Entity, sample: FieldSample) {
        self.lock().link_values.insert((link_index, parent, sample.field_id), sample);
    }

    /// Seed the global bind/unbind event field.
    pub fn set_bind_unbind_event(&self, value: i64, timestamp_us: i64) {
        let mut sample = FieldSample::int64(fields::DCGM_FI_BIND_UNBIND_EVENT, value);
        sample.timestamp_us = timestamp_us;
        self.set_value(Entity::new(EntityGroup::Gpu, 0), sample);
    }

    /// Make every read fail with `ConnectionNotValid`.
    pub fn break_connection(&self) {
        self.lock().connection_valid = false;
    }

    /// Make field-group creation fail as on hosts without the driver library.
    pub fn set_nvml_present(&self, present: bool) {
        self.lock().nvml_present = present;
    }

    /// Number of live groups, field groups, and watches; tests assert that
    /// cleanup returns all three to zero.
    pub fn live_resources(&self) -> (usize, usize, usize) {
        let st = self.lock();
        (st.groups.len(), st.field_groups.len(), st.watches.len())
    }

    fn check_connection(st: &FabricState) -> Result<()> {
        if !st.connection_valid {
            return Err(Error::ConnectionNotValid("host engine connection lost".to_string()));
        }
        Ok(())
    }

    fn sample_for(st: &FabricState, entity: Entity, field_id: u16) -> FieldSample {
        if let Some(sample) = st.values.get(&(entity, field_id)) {
            return sample.clone();
        }
        // Unseeded fields read as blank, typed per field metadata.
        match fields::by_id(field_id).map(|m| m.kind) {
            Some(FieldKind::Double) => FieldSample {
                field_id,
                value: FieldValue::Double(0.0),
                sentinel: true,
                timestamp_us: 0,
            },
            Some(FieldKind::Text) => FieldSample {
                field_id,
                value: FieldValue::Text(String::new()),
                sentinel: true,
                timestamp_us: 0,
            },
            _ => FieldSample::blank(field_id),
        }
    }
}

impl Default for SimulatedFabric {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceLib for SimulatedFabric {
    fn supported_metric_groups(&self, gpu_index: u32) -> Result<Vec<MetricGroup>> {
        let st = self.lock();
        Self::check_connection(&st)?;
        if st.gpus.iter().any(|g| g.index == gpu_index) {
            Ok(st.metric_groups.clone())
        } else {
            Err(Error::not_found(format!("GPU index {}", gpu_index)))
        }
    }

    fn create_group(&self, name: &str) -> Result<GroupHandle> {
        let mut st = self.lock();
        Self::check_connection(&st)?;
        let handle = st.next_handle;
        st.next_handle += 1;
        st.groups.insert(handle);
        debug!(group = handle, name, "created entity group");
        Ok(GroupHandle(handle))
    }

    fn add_entity_to_group(&self, group: GroupHandle, _entity: Entity) -> Result<()> {
        let st = self.lock();
        Self::check_connection(&st)?;
        if !st.groups.contains(&group.0) {
            return Err(Error::not_found(format!("group {}", group.0)));
        }
        Ok(())
    }

    fn add_link_to_group(
        &self,
        group: GroupHandle,
        _link_index: u32,
        _parent: Entity,
    ) -> Result<()> {
        let st = self.lock();
        Self::check_connection(&st)?;
        if !st.groups.contains(&group.0) {
            return Err(Error::not_found(format!("group {}", group.0)));
        }
        Ok(())
    }

    fn destroy_group(&self, group: GroupHandle) -> Result<()> {
        let mut st = self.lock();
        if !st.groups.remove(&group.0) {
            return Err(Error::NotConfigured(format!("group {}", group.0)));
        }
        st.watches.retain(|(_, g)| *g != group.0);
        Ok(())
    }

    fn create_field_group(&self, name: &str, field_ids: &[u16]) -> Result<FieldGroupHandle> {
        let mut st = self.lock();
        Self::check_connection(&st)?;
        if !st.nvml_present {
            return Err(Error::NvmlMissing(format!("cannot create field group '{}'", name)));
        }
        let handle = st.next_handle;
        st.next_handle += 1;
        st.field_groups.insert(handle, field_ids.to_vec());
        Ok(FieldGroupHandle(handle))
    }

    fn destroy_field_group(&self, field_group: FieldGroupHandle) -> Result<()> {
        let mut st = self.lock();
        if st.field_groups.remove(&field_group.0).is_none() {
            return Err(Error::NotConfigured(format!("field group {}", field_group.0)));
        }
        st.watches.retain(|(fg, _)| *fg != field_group.0);
        Ok(())
    }

    fn watch_fields(
        &self,
        field_group: FieldGroupHandle,
        group: GroupHandle,
        _update_freq_us: i64,
        _max_keep_age_secs: f64,
        _max_keep_samples: i32,
    ) -> Result<()> {
        let mut st = self.lock();
        Self::check_connection(&st)?;
        if !st.field_groups.contains_key(&field_group.0) {
            return Err(Error::not_found(format!("field group {}", field_group.0)));
        }
        if group.0 != GROUP_ALL_GPUS && !st.groups.contains(&group.0) {
            return Err(Error::not_found(format!("group {}", group.0)));
        }
        st.watches.insert((field_group.0, group.0));
        Ok(())
    }

    fn unwatch_fields(&self, field_group: FieldGroupHandle, group: GroupHandle) -> Result<()> {
        let mut st = self.lock();
        if !st.watches.remove(&(field_group.0, group.0)) {
            return Err(Error::FieldNotWatched(format!(
                "field group {} on group {}",
                field_group.0, group.0
            )));
        }
        Ok(())
    }

    fn update_all_fields(&self) -> Result<()> {
        let st = self.lock();
        Self::check_connection(&st)
    }

    fn entity_latest(&self, entity: Entity, field_ids: &[u16]) -> Result<Vec<FieldSample>> {
        let st = self.lock();
        Self::check_connection(&st)?;
        Ok(field_ids.iter().map(|&id| Self::sample_for(&st, entity, id)).collect())
    }

    fn link_latest(
        &self,
        link_index: u32,
        parent: Entity,
        field_ids: &[u16],
    ) -> Result<Vec<FieldSample>> {
        let st = self.lock();
        Self::check_connection(&st)?;
        Ok(field_ids
            .iter()
            .map(|&id| {
                st.link_values
                    .get(&(link_index, parent, id))
                    .cloned()
                    .unwrap_or_else(|| FieldSample::blank(id))
            })
            .collect())
    }

    fn all_gpus(&self) -> Result<Vec<GpuDeviceInfo>> {
        let st = self.lock();
        Self::check_connection(&st)?;
        Ok(st.gpus.clone())
    }

    fn all_switches(&self) -> Result<Vec<SwitchInfo>> {
        let st = self.lock();
        Self::check_connection(&st)?;
        Ok(st.switches.clone())
    }

    fn all_cpus(&self) -> Result<Vec<CpuInfo>> {
        let st = self.lock();
        Self::check_connection(&st)?;
        Ok(st.cpus.clone())
    }

    fn group_all_gpus(&self) -> GroupHandle {
        GroupHandle(GROUP_ALL_GPUS)
    }

    fn device_info(&self, gpu_index: u32) -> Result<GpuDeviceInfo> {
        let st = self.lock();
        Self::check_connection(&st)?;
        st.gpus
            .iter()
            .find(|g| g.index == gpu_index)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("GPU index {}", gpu_index)))
    }

    fn cleanup(&self) {
        let mut st = self.lock();
        st.groups.clear();
        st.field_groups.clear();
        st.watches.clear();
    }
}

/// Convenience constructor for a MIG-partitioned test GPU.
pub fn mig_gpu(index: u32, uuid: &str, model: &str, profiles: &[(u32, &str)]) -> GpuDeviceInfo {
    let instances = profiles
        .iter()
        .enumerate()
        .map(|(i, (gi_id, profile))| GpuInstanceInfo {
            entity_id: index * 100 + i as u32,
            parent_uuid: uuid.to_string(),
            gpu_instance_id: *gi_id,
            compute_instance_id: 0,
            profile: (*profile).to_string(),
        })
        .collect();
    GpuDeviceInfo {
        index,
        uuid: uuid.to_string(),
        model: model.to_string(),
        pci_bus_id: format!("00000000:{:02x}:00.0", index + 7),
        mig_enabled: true,
        instances,
        nvlinks: Vec::new(),
    }
}
