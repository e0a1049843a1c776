//! Monitored-entity expansion
//!
//! Applies the flex/major/minor selectors to the inventory and produces the
//! concrete entity list a scrape iterates over. Used by both watch-list
//! construction and the collectors.

use crate::facade::{GpuDeviceInfo, GpuInstanceInfo};
use crate::inventory::DeviceInventory;
use gpuscope_core::{Entity, EntityGroup};

/// One entity to query during a scrape.
#[derive(Debug, Clone)]
pub struct MonitoringInfo {
    pub entity: Entity,
    /// Parent entity id for links and CPU cores
    pub parent_id: Option<u32>,
    /// Physical GPU metadata for GPU-kind entities
    pub device: Option<GpuDeviceInfo>,
    /// MIG instance metadata when monitoring at instance granularity
    pub instance: Option<GpuInstanceInfo>,
}

/// Expand the inventory into the entities monitored for its entity kind.
pub fn get_monitored_entities(inventory: &DeviceInventory) -> Vec<MonitoringInfo> {
    match inventory.info_type() {
        EntityGroup::Gpu => monitored_gpus(inventory),
        EntityGroup::Switch => monitored_switches(inventory),
        EntityGroup::Link => monitored_links(inventory),
        EntityGroup::Cpu => monitored_cpus(inventory),
        EntityGroup::CpuCore => monitored_cores(inventory),
        _ => Vec::new(),
    }
}

fn instance_info(inventory: &DeviceInventory, gpu: &GpuDeviceInfo) -> Vec<MonitoringInfo> {
    gpu.instances
        .iter()
        .map(|inst| MonitoringInfo {
            entity: Entity::new(EntityGroup::GpuInstance, inst.entity_id),
            parent_id: Some(gpu.index),
            device: Some(gpu.clone()),
            instance: Some(inst.clone()),
        })
        .collect()
}

fn monitored_gpus(inventory: &DeviceInventory) -> Vec<MonitoringInfo> {
    let mut out = Vec::new();
    let opts = inventory.gpu_opts();

    for gpu in inventory.gpus() {
        if opts.flex {
            // Flex: instance granularity when this GPU has MIG enabled,
            // GPU granularity otherwise.
            if gpu.mig_enabled {
                out.extend(instance_info(inventory, gpu));
            } else {
                out.push(gpu_entity(gpu));
            }
            continue;
        }

        if !opts.major_range.is_empty() && inventory.is_gpu_watched(gpu.index) {
            out.push(gpu_entity(gpu));
        }

        if !opts.minor_range.is_empty() {
            out.extend(
                instance_info(inventory, gpu)
                    .into_iter()
                    .filter(|mi| {
                        mi.instance
                            .as_ref()
                            .is_some_and(|i| inventory.is_gpu_instance_watched(i.gpu_instance_id))
                    }),
            );
        }
    }

    out
}

fn gpu_entity(gpu: &GpuDeviceInfo) -> MonitoringInfo {
    MonitoringInfo {
        entity: Entity::new(EntityGroup::Gpu, gpu.index),
        parent_id: None,
        device: Some(gpu.clone()),
        instance: None,
    }
}

fn monitored_switches(inventory: &DeviceInventory) -> Vec<MonitoringInfo> {
    inventory
        .switches()
        .iter()
        .filter(|sw| inventory.is_switch_watched(sw.entity_id))
        .map(|sw| MonitoringInfo {
            entity: Entity::new(EntityGroup::Switch, sw.entity_id),
            parent_id: None,
            device: None,
            instance: None,
        })
        .collect()
}

fn monitored_links(inventory: &DeviceInventory) -> Vec<MonitoringInfo> {
    let mut out = Vec::new();

    // GPU-owned links are monitored unconditionally; only switch-owned
    // links are filtered on state and selectors.
    for gpu in inventory.gpus() {
        for link in &gpu.nvlinks {
            out.push(MonitoringInfo {
                entity: Entity::new(EntityGroup::Link, link.index),
                parent_id: Some(gpu.index),
                device: Some(gpu.clone()),
                instance: None,
            });
        }
    }

    for sw in inventory.switches() {
        for link in &sw.links {
            if !link.up || !inventory.is_link_watched(link.index, sw.entity_id) {
                continue;
            }
            out.push(MonitoringInfo {
                entity: Entity::new(EntityGroup::Link, link.index),
                parent_id: Some(sw.entity_id),
                device: None,
                instance: None,
            });
        }
    }

    out
}

fn monitored_cpus(inventory: &DeviceInventory) -> Vec<MonitoringInfo> {
    inventory
        .cpus()
        .iter()
        .filter(|cpu| inventory.is_cpu_watched(cpu.entity_id))
        .map(|cpu| MonitoringInfo {
            entity: Entity::new(EntityGroup::Cpu, cpu.entity_id),
            parent_id: None,
            device: None,
            instance: None,
        })
        .collect()
}

fn monitored_cores(inventory: &DeviceInventory) -> Vec<MonitoringInfo> {
    let mut out = Vec::new();
    for cpu in inventory.cpus() {
        for &core in &cpu.cores {
            if !inventory.is_core_watched(core, cpu.entity_id) {
                continue;
            }
            out.push(MonitoringInfo {
                entity: Entity::new(EntityGroup::CpuCore, core),
                parent_id: Some(cpu.entity_id),
                device: None,
                instance: None,
            });
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facade::{CpuInfo, LinkInfo, SwitchInfo};
    use crate::sim;
    use gpuscope_core::config::{parse_device_options, DeviceOptions};
    use std::sync::Arc;

    fn plain_gpu(index: u32) -> GpuDeviceInfo {
        GpuDeviceInfo {
            index,
            uuid: format!("GPU-{:08}", index),
            model: "NVIDIA A100-SXM4-80GB".to_string(),
            pci_bus_id: String::new(),
            mig_enabled: false,
            instances: Vec::new(),
            nvlinks: Vec::new(),
        }
    }

    fn inventory(
        info_type: EntityGroup,
        gpus: Vec<GpuDeviceInfo>,
        switches: Vec<SwitchInfo>,
        cpus: Vec<CpuInfo>,
        gpu_opts: DeviceOptions,
    ) -> Arc<DeviceInventory> {
        DeviceInventory::from_parts(
            info_type,
            gpus,
            switches,
            cpus,
            gpu_opts,
            DeviceOptions::flex(),
            DeviceOptions::flex(),
        )
        .unwrap()
    }

    #[test]
    fn test_flex_mixed_mig_strategy() {
        let mig = sim::mig_gpu(0, "GPU-mig", "NVIDIA A100-SXM4-80GB", &[(1, "3g.40gb"), (2, "1g.5gb")]);
        let inv = inventory(
            EntityGroup::Gpu,
            vec![mig, plain_gpu(1)],
            Vec::new(),
            Vec::new(),
            DeviceOptions::flex(),
        );

        let entities = get_monitored_entities(&inv);
        // Two MIG instances plus one whole GPU.
        assert_eq!(entities.len(), 3);
        let instance_count =
            entities.iter().filter(|e| e.entity.group == EntityGroup::GpuInstance).count();
        assert_eq!(instance_count, 2);
        let gpu_count = entities.iter().filter(|e| e.entity.group == EntityGroup::Gpu).count();
        assert_eq!(gpu_count, 1);
    }

    #[test]
    fn test_major_range_selects_gpu_entities() {
        let inv = inventory(
            EntityGroup::Gpu,
            vec![plain_gpu(0), plain_gpu(1)],
            Vec::new(),
            Vec::new(),
            parse_device_options("g:1").unwrap(),
        );
        let entities = get_monitored_entities(&inv);
        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0].entity, Entity::new(EntityGroup::Gpu, 1));
    }

    #[test]
    fn test_gpu_links_are_monitored_regardless_of_state() {
        let mut gpu = plain_gpu(0);
        gpu.nvlinks = vec![
            LinkInfo { index: 0, parent_id: 0, up: true },
            LinkInfo { index: 1, parent_id: 0, up: false },
        ];
        let inv = inventory(
            EntityGroup::Link,
            vec![gpu],
            Vec::new(),
            Vec::new(),
            DeviceOptions::flex(),
        );
        let entities = get_monitored_entities(&inv);
        assert_eq!(entities.len(), 2);
        assert!(entities.iter().all(|e| e.parent_id == Some(0)));
        assert!(entities.iter().all(|e| e.device.is_some()));
    }

    #[test]
    fn test_switch_links_skip_down_state() {
        let switches = vec![SwitchInfo {
            entity_id: 0,
            links: vec![
                LinkInfo { index: 0, parent_id: 0, up: true },
                LinkInfo { index: 1, parent_id: 0, up: false },
            ],
        }];
        let inv = inventory(
            EntityGroup::Link,
            Vec::new(),
            switches,
            Vec::new(),
            DeviceOptions::flex(),
        );
        let entities = get_monitored_entities(&inv);
        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0].entity.id, 0);
        assert_eq!(entities[0].parent_id, Some(0));
    }

    #[test]
    fn test_cpu_cores_carry_parent() {
        let cpus = vec![CpuInfo { entity_id: 0, cores: vec![0, 1, 2] }];
        let inv = inventory(
            EntityGroup::CpuCore,
            Vec::new(),
            Vec::new(),
            cpus,
            DeviceOptions::flex(),
        );
        let entities = get_monitored_entities(&inv);
        assert_eq!(entities.len(), 3);
        assert!(entities.iter().all(|e| e.parent_id == Some(0)));
    }
}
