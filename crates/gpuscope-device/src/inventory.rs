//! Device inventory: entity enumeration with selector application
//!
//! The inventory is built once per watch-list and is only valid between two
//! reload-coordinator actions. Any explicit id in a selector list must
//! resolve to an existing entity at initialization time.

use crate::facade::{self, CpuInfo, GpuDeviceInfo, SwitchInfo};
use gpuscope_core::config::DeviceOptions;
use gpuscope_core::{EntityGroup, Error, Result};
use std::sync::Arc;

/// Enumerated entities for one entity kind, with the selectors that scope
/// what is monitored.
#[derive(Debug, Clone)]
pub struct DeviceInventory {
    info_type: EntityGroup,
    gpus: Vec<GpuDeviceInfo>,
    switches: Vec<SwitchInfo>,
    cpus: Vec<CpuInfo>,
    gpu_opts: DeviceOptions,
    switch_opts: DeviceOptions,
    cpu_opts: DeviceOptions,
}

fn selects(range: &[i32], id: u32) -> bool {
    range.iter().any(|&v| v == -1 || v == id as i32)
}

impl DeviceInventory {
    /// Enumerate entities through the device library facade and validate the
    /// selector options for the given entity kind.
    pub fn initialize(
        gpu_opts: DeviceOptions,
        switch_opts: DeviceOptions,
        cpu_opts: DeviceOptions,
        info_type: EntityGroup,
    ) -> Result<Arc<Self>> {
        let client = facade::client()?;
        let inventory = Self {
            info_type,
            gpus: client.all_gpus()?,
            switches: client.all_switches()?,
            cpus: client.all_cpus()?,
            gpu_opts,
            switch_opts,
            cpu_opts,
        };
        inventory.verify_devices_present()?;
        Ok(Arc::new(inventory))
    }

    /// Build an inventory from already-enumerated devices. Test seam.
    pub fn from_parts(
        info_type: EntityGroup,
        gpus: Vec<GpuDeviceInfo>,
        switches: Vec<SwitchInfo>,
        cpus: Vec<CpuInfo>,
        gpu_opts: DeviceOptions,
        switch_opts: DeviceOptions,
        cpu_opts: DeviceOptions,
    ) -> Result<Arc<Self>> {
        let inventory =
            Self { info_type, gpus, switches, cpus, gpu_opts, switch_opts, cpu_opts };
        inventory.verify_devices_present()?;
        Ok(Arc::new(inventory))
    }

    fn verify_devices_present(&self) -> Result<()> {
        match self.info_type {
            EntityGroup::Gpu | EntityGroup::GpuInstance => self.verify_gpu_options(),
            EntityGroup::Switch | EntityGroup::Link => {
                verify_range(&self.switch_opts.major_range, "NvSwitch", |id| {
                    self.switches.iter().any(|s| s.entity_id == id)
                })?;
                verify_range(&self.switch_opts.minor_range, "NvLink", |id| {
                    self.switches.iter().any(|s| s.links.iter().any(|l| l.index == id))
                })
            }
            EntityGroup::Cpu | EntityGroup::CpuCore => {
                verify_range(&self.cpu_opts.major_range, "CPU", |id| {
                    self.cpus.iter().any(|c| c.entity_id == id)
                })?;
                verify_range(&self.cpu_opts.minor_range, "CPU core", |id| {
                    self.cpus.iter().any(|c| c.cores.contains(&id))
                })
            }
            _ => Ok(()),
        }
    }

    fn verify_gpu_options(&self) -> Result<()> {
        verify_range(&self.gpu_opts.major_range, "GPU", |id| {
            self.gpus.iter().any(|g| g.index == id)
        })?;

        if !self.gpu_opts.minor_range.is_empty() && !self.gpus.iter().any(|g| g.mig_enabled) {
            return Err(Error::config(
                "GPU instances cannot be monitored ('-i') when MIG mode is not enabled",
            ));
        }
        verify_range(&self.gpu_opts.minor_range, "GPU instance", |id| {
            self.gpus.iter().any(|g| g.instances.iter().any(|i| i.gpu_instance_id == id))
        })
    }

    pub fn info_type(&self) -> EntityGroup {
        self.info_type
    }

    pub fn gpus(&self) -> &[GpuDeviceInfo] {
        &self.gpus
    }

    pub fn switches(&self) -> &[SwitchInfo] {
        &self.switches
    }

    pub fn cpus(&self) -> &[CpuInfo] {
        &self.cpus
    }

    pub fn gpu_count(&self) -> usize {
        self.gpus.len()
    }

    pub fn gpu_opts(&self) -> &DeviceOptions {
        &self.gpu_opts
    }

    pub fn is_gpu_watched(&self, index: u32) -> bool {
        self.gpu_opts.flex || selects(&self.gpu_opts.major_range, index)
    }

    pub fn is_gpu_instance_watched(&self, gpu_instance_id: u32) -> bool {
        selects(&self.gpu_opts.minor_range, gpu_instance_id)
    }

    pub fn is_switch_watched(&self, entity_id: u32) -> bool {
        self.switch_opts.flex || selects(&self.switch_opts.major_range, entity_id)
    }

    pub fn is_link_watched(&self, link_index: u32, switch_id: u32) -> bool {
        self.is_switch_watched(switch_id)
            && (self.switch_opts.flex || selects(&self.switch_opts.minor_range, link_index))
    }

    pub fn is_cpu_watched(&self, entity_id: u32) -> bool {
        self.cpu_opts.flex || selects(&self.cpu_opts.major_range, entity_id)
    }

    pub fn is_core_watched(&self, core: u32, cpu_id: u32) -> bool {
        self.is_cpu_watched(cpu_id)
            && (self.cpu_opts.flex || selects(&self.cpu_opts.minor_range, core))
    }

    /// UUIDs of all enumerated physical GPUs.
    pub fn gpu_uuids(&self) -> Vec<String> {
        self.gpus.iter().map(|g| g.uuid.clone()).collect()
    }

    /// The `<gpuIndex>-<gpuInstanceId>` identifier kubelet-style MIG device
    /// references resolve to.
    pub fn gpu_instance_identifier(&self, parent_uuid: &str, gpu_instance_id: u32) -> String {
        match self.gpus.iter().find(|g| g.uuid == parent_uuid) {
            Some(gpu) => format!("{}-{}", gpu.index, gpu_instance_id),
            None => format!("{}-{}", parent_uuid, gpu_instance_id),
        }
    }
}

fn verify_range(range: &[i32], kind: &str, exists: impl Fn(u32) -> bool) -> Result<()> {
    for &id in range {
        if id == -1 {
            continue;
        }
        if id < 0 || !exists(id as u32) {
            return Err(Error::config(format!("no {} with id '{}' present on this system", kind, id)));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim;
    use gpuscope_core::config::parse_device_options;

    fn plain_gpu(index: u32) -> GpuDeviceInfo {
        GpuDeviceInfo {
            index,
            uuid: format!("GPU-{:08}", index),
            model: "NVIDIA A100-SXM4-80GB".to_string(),
            pci_bus_id: format!("00000000:{:02x}:00.0", index + 7),
            mig_enabled: false,
            instances: Vec::new(),
            nvlinks: Vec::new(),
        }
    }

    fn inventory_with(
        gpus: Vec<GpuDeviceInfo>,
        gpu_opts: DeviceOptions,
    ) -> Result<Arc<DeviceInventory>> {
        DeviceInventory::from_parts(
            EntityGroup::Gpu,
            gpus,
            Vec::new(),
            Vec::new(),
            gpu_opts,
            DeviceOptions::flex(),
            DeviceOptions::flex(),
        )
    }

    #[test]
    fn test_explicit_gpu_id_must_exist() {
        let opts = parse_device_options("g:0,3").unwrap();
        let err = inventory_with(vec![plain_gpu(0), plain_gpu(1)], opts).unwrap_err();
        assert!(err.to_string().contains("no GPU with id '3'"));
    }

    #[test]
    fn test_minor_range_requires_mig() {
        let opts = parse_device_options("i:0").unwrap();
        let err = inventory_with(vec![plain_gpu(0)], opts).unwrap_err();
        assert!(err.to_string().contains("MIG mode is not enabled"));
    }

    #[test]
    fn test_minor_range_with_mig_gpu() {
        let gpu = sim::mig_gpu(0, "GPU-mig-0", "NVIDIA A100-SXM4-80GB", &[(3, "1g.5gb")]);
        let opts = parse_device_options("i:3").unwrap();
        let inventory = inventory_with(vec![gpu], opts).unwrap();
        assert!(inventory.is_gpu_instance_watched(3));
        assert!(!inventory.is_gpu_instance_watched(4));
    }

    #[test]
    fn test_flex_watches_all_gpus() {
        let inventory =
            inventory_with(vec![plain_gpu(0), plain_gpu(1)], DeviceOptions::flex()).unwrap();
        assert!(inventory.is_gpu_watched(0));
        assert!(inventory.is_gpu_watched(1));
    }

    #[test]
    fn test_major_range_scopes_gpus() {
        let opts = parse_device_options("g:1").unwrap();
        let inventory = inventory_with(vec![plain_gpu(0), plain_gpu(1)], opts).unwrap();
        assert!(!inventory.is_gpu_watched(0));
        assert!(inventory.is_gpu_watched(1));
    }

    #[test]
    fn test_gpu_instance_identifier() {
        let gpu = sim::mig_gpu(2, "GPU-mig-2", "NVIDIA A100-SXM4-80GB", &[(3, "1g.5gb")]);
        let inventory = inventory_with(vec![gpu], DeviceOptions::flex()).unwrap();
        assert_eq!(inventory.gpu_instance_identifier("GPU-mig-2", 3), "2-3");
        // Unknown parent falls back to the raw UUID form.
        assert_eq!(inventory.gpu_instance_identifier("GPU-unknown", 3), "GPU-unknown-3");
    }
}
