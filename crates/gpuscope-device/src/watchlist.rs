//! Watch-list construction and lifecycle
//!
//! For each entity kind the manager builds entity groups, one field group
//! with every field any registered counter requires, and the field watches.
//! Cleanup strictly reverses creation: unwatch, destroy field group, destroy
//! groups. Benign teardown errors are swallowed; if the facade is already
//! torn down, cleanup is a no-op.

use crate::facade::{self, FieldGroupHandle, GroupHandle};
use crate::inventory::DeviceInventory;
use crate::monitoring::get_monitored_entities;
use gpuscope_core::config::AppConfig;
use gpuscope_core::fields::GROUP_MAX_ENTITIES;
use gpuscope_core::{Counter, Entity, EntityGroup, Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// Entity kinds for which watch-lists are constructed, in creation order.
pub const DEVICE_TYPES_TO_WATCH: &[EntityGroup] = &[
    EntityGroup::Gpu,
    EntityGroup::Switch,
    EntityGroup::Link,
    EntityGroup::Cpu,
    EntityGroup::CpuCore,
];

/// Device-library resources owned by one watch-list instantiation.
#[derive(Debug, Default)]
pub struct WatchResources {
    groups: Vec<GroupHandle>,
    field_group: Option<FieldGroupHandle>,
    has_watch: bool,
}

impl WatchResources {
    /// Release everything in reverse creation order. Idempotent; a no-op
    /// once the facade has been torn down.
    pub fn cleanup(&mut self) {
        let Some(client) = facade::try_client() else {
            return;
        };

        if self.has_watch {
            if let Some(field_group) = self.field_group {
                for group in &self.groups {
                    if let Err(e) = client.unwatch_fields(field_group, *group) {
                        if !e.is_benign_cleanup() {
                            warn!(error = %e, "failed to unwatch fields");
                        }
                    }
                }
            }
            self.has_watch = false;
        }

        if let Some(field_group) = self.field_group.take() {
            if let Err(e) = client.destroy_field_group(field_group) {
                if !e.is_benign_cleanup() {
                    warn!(error = %e, "cannot destroy field group");
                }
            }
        }

        for group in self.groups.drain(..) {
            if let Err(e) = client.destroy_group(group) {
                if !e.is_benign_cleanup() {
                    warn!(group = group.0, error = %e, "cannot destroy group");
                }
            }
        }
    }
}

impl Drop for WatchResources {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// A `(entity-group, field-set, update-interval)` triple for one entity kind.
#[derive(Debug, Clone)]
pub struct DeviceWatchList {
    inventory: Arc<DeviceInventory>,
    fields: Vec<u16>,
    update_freq_us: i64,
}

impl DeviceWatchList {
    pub fn new(inventory: Arc<DeviceInventory>, fields: Vec<u16>, update_freq_us: i64) -> Self {
        Self { inventory, fields, update_freq_us }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() || get_monitored_entities(&self.inventory).is_empty()
    }

    pub fn device_fields(&self) -> &[u16] {
        &self.fields
    }

    pub fn inventory(&self) -> &Arc<DeviceInventory> {
        &self.inventory
    }

    /// Acquire device-library groups and start the watches. On partial
    /// failure, everything already built is released in reverse order.
    pub fn watch(&self) -> Result<WatchResources> {
        let client = facade::client()?;
        let mut resources = WatchResources::default();

        // Groups are recorded as they are created: a failure anywhere in
        // construction releases whatever was already built.
        match self.inventory.info_type() {
            EntityGroup::Link => self.create_link_groups(&mut resources.groups)?,
            EntityGroup::CpuCore => self.create_core_groups(&mut resources.groups)?,
            _ => self.create_generic_group(&mut resources.groups)?,
        }
        if resources.groups.is_empty() {
            return Ok(resources);
        }

        let name = format!("gpuscope-fieldgroup-{}", rand::random::<u64>());
        let field_group = client.create_field_group(&name, &self.fields)?;
        resources.field_group = Some(field_group);

        // Marked before the loop: if a watch fails partway, cleanup still
        // unwatches the pairs that were established.
        resources.has_watch = true;
        for group in resources.groups.clone() {
            client.watch_fields(field_group, group, self.update_freq_us, 0.0, 1)?;
        }

        Ok(resources)
    }

    fn new_group(&self) -> Result<GroupHandle> {
        facade::client()?.create_group(&format!("gpuscope-group-{}", rand::random::<u64>()))
    }

    fn create_generic_group(&self, groups: &mut Vec<GroupHandle>) -> Result<()> {
        let entities = get_monitored_entities(&self.inventory);
        if entities.is_empty() {
            return Ok(());
        }

        let client = facade::client()?;
        let group = self.new_group()?;
        groups.push(group);
        for mi in entities {
            client.add_entity_to_group(group, mi.entity)?;
        }
        Ok(())
    }

    fn create_link_groups(&self, groups: &mut Vec<GroupHandle>) -> Result<()> {
        let client = facade::client()?;

        // Per-GPU link groups: every GPU-owned link joins its group; only
        // switch-owned links are filtered on state and selectors.
        for gpu in self.inventory.gpus() {
            let mut group = None;
            for link in &gpu.nvlinks {
                let handle = match group {
                    Some(h) => h,
                    None => {
                        let h = self.new_group()?;
                        groups.push(h);
                        group = Some(h);
                        h
                    }
                };
                if let Err(e) = client.add_link_to_group(
                    handle,
                    link.index,
                    Entity::new(EntityGroup::Gpu, gpu.index),
                ) {
                    warn!(link = link.index, gpu = gpu.index, error = %e,
                        "could not add link to group");
                }
            }
        }

        // Per-switch link groups
        for sw in self.inventory.switches() {
            if !self.inventory.is_switch_watched(sw.entity_id) {
                continue;
            }
            let mut group = None;
            for link in &sw.links {
                if !link.up || !self.inventory.is_link_watched(link.index, sw.entity_id) {
                    continue;
                }
                let handle = match group {
                    Some(h) => h,
                    None => {
                        let h = self.new_group()?;
                        groups.push(h);
                        group = Some(h);
                        h
                    }
                };
                if let Err(e) = client.add_link_to_group(
                    handle,
                    link.index,
                    Entity::new(EntityGroup::Switch, sw.entity_id),
                ) {
                    warn!(link = link.index, switch = sw.entity_id, error = %e,
                        "could not add link to group");
                }
            }
        }

        Ok(())
    }

    fn create_core_groups(&self, groups: &mut Vec<GroupHandle>) -> Result<()> {
        let client = facade::client()?;

        for cpu in self.inventory.cpus() {
            if !self.inventory.is_cpu_watched(cpu.entity_id) {
                continue;
            }

            let mut group_core_count = 0usize;
            let mut group: Option<GroupHandle> = None;
            for &core in &cpu.cores {
                if !self.inventory.is_core_watched(core, cpu.entity_id) {
                    continue;
                }

                // Split into groups of at most the library's maximum size.
                let handle = match group {
                    Some(h) if group_core_count % GROUP_MAX_ENTITIES != 0 => h,
                    _ => {
                        let h = self.new_group()?;
                        groups.push(h);
                        group = Some(h);
                        h
                    }
                };
                group_core_count += 1;

                client.add_entity_to_group(handle, Entity::new(EntityGroup::CpuCore, core))?;
            }
        }

        Ok(())
    }
}

/// Whether a field with the given native entity level belongs to the
/// watch-list of the given entity kind.
fn should_include_field(entity_type: EntityGroup, field_level: EntityGroup) -> bool {
    if field_level == entity_type || field_level == EntityGroup::None {
        return true;
    }
    match entity_type {
        EntityGroup::Gpu => matches!(
            field_level,
            EntityGroup::GpuInstance | EntityGroup::ComputeInstance | EntityGroup::Vgpu
        ),
        EntityGroup::Cpu => field_level == EntityGroup::CpuCore,
        EntityGroup::Switch => field_level == EntityGroup::Link,
        _ => false,
    }
}

/// The fields of the registered counters that apply to one entity kind.
pub fn device_fields(counters: &[Counter], entity_type: EntityGroup) -> Vec<u16> {
    let Ok(client) = facade::client() else {
        return Vec::new();
    };
    counters
        .iter()
        .filter_map(|c| client.field_meta(c.field_id))
        .filter(|meta| should_include_field(entity_type, meta.entity_level))
        .map(|meta| meta.id)
        .collect()
}

/// Per-entity-type watch-list owner.
#[derive(Debug, Default)]
pub struct WatchListManager {
    counters: Vec<Counter>,
    gpu_opts: gpuscope_core::DeviceOptions,
    switch_opts: gpuscope_core::DeviceOptions,
    cpu_opts: gpuscope_core::DeviceOptions,
    watch_lists: HashMap<EntityGroup, DeviceWatchList>,
}

impl WatchListManager {
    pub fn new(counters: Vec<Counter>, config: &AppConfig) -> Self {
        Self {
            counters,
            gpu_opts: config.gpu_devices.clone(),
            switch_opts: config.switch_devices.clone(),
            cpu_opts: config.cpu_devices.clone(),
            watch_lists: HashMap::new(),
        }
    }

    /// Build the inventory and field set for one entity kind and record the
    /// watch-list. Fails when no registered counter applies to the kind or
    /// no matching entity exists.
    pub fn create_entity_watch_list(
        &mut self,
        entity_type: EntityGroup,
        update_freq_us: i64,
    ) -> Result<()> {
        let fields = device_fields(&self.counters, entity_type);
        if fields.is_empty() {
            return Err(Error::not_found(format!(
                "no registered counter applies to {}",
                entity_type
            )));
        }

        let inventory = DeviceInventory::initialize(
            self.gpu_opts.clone(),
            self.switch_opts.clone(),
            self.cpu_opts.clone(),
            entity_type,
        )?;

        let watch_list = DeviceWatchList::new(inventory, fields, update_freq_us);
        if watch_list.is_empty() {
            return Err(Error::not_found(format!("no {} entities to monitor", entity_type)));
        }

        self.watch_lists.insert(entity_type, watch_list);
        Ok(())
    }

    pub fn entity_watch_list(&self, entity_type: EntityGroup) -> Option<DeviceWatchList> {
        self.watch_lists.get(&entity_type).cloned()
    }

    pub fn watch_lists(&self) -> &HashMap<EntityGroup, DeviceWatchList> {
        &self.watch_lists
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facade::set_client;
    use crate::sim::SimulatedFabric;
    use gpuscope_core::counters::PromType;
    use gpuscope_core::fields;
    use gpuscope_core::DeviceOptions;
    use std::sync::Arc;

    fn counter(field_id: u16, name: &str) -> Counter {
        Counter {
            field_id,
            field_name: name.to_string(),
            prom_type: PromType::Gauge,
            help: String::new(),
        }
    }

    #[test]
    fn test_should_include_field_subordination() {
        assert!(should_include_field(EntityGroup::Gpu, EntityGroup::Gpu));
        assert!(should_include_field(EntityGroup::Gpu, EntityGroup::None));
        assert!(should_include_field(EntityGroup::Gpu, EntityGroup::GpuInstance));
        assert!(should_include_field(EntityGroup::Gpu, EntityGroup::Vgpu));
        assert!(should_include_field(EntityGroup::Cpu, EntityGroup::CpuCore));
        assert!(should_include_field(EntityGroup::Switch, EntityGroup::Link));

        assert!(!should_include_field(EntityGroup::Gpu, EntityGroup::Cpu));
        assert!(!should_include_field(EntityGroup::Switch, EntityGroup::Gpu));
        assert!(!should_include_field(EntityGroup::CpuCore, EntityGroup::Cpu));
    }

    #[test]
    fn test_watch_then_cleanup_releases_everything() {
        let _guard = crate::testlock::lock();
        let fabric = Arc::new(SimulatedFabric::default_fabric());
        set_client(fabric.clone());

        let inventory = DeviceInventory::initialize(
            DeviceOptions::flex(),
            DeviceOptions::flex(),
            DeviceOptions::flex(),
            EntityGroup::Gpu,
        )
        .unwrap();

        let watch_list = DeviceWatchList::new(
            inventory,
            vec![fields::DCGM_FI_DEV_GPU_UTIL, fields::DCGM_FI_DEV_GPU_TEMP],
            30_000_000,
        );

        let mut resources = watch_list.watch().unwrap();
        let (groups, field_groups, watches) = fabric.live_resources();
        assert_eq!((groups, field_groups, watches), (1, 1, 1));

        resources.cleanup();
        assert_eq!(fabric.live_resources(), (0, 0, 0));

        // Cleanup is idempotent.
        resources.cleanup();
        assert_eq!(fabric.live_resources(), (0, 0, 0));
    }

    #[test]
    fn test_manager_skips_kinds_without_fields() {
        let _guard = crate::testlock::lock();
        set_client(Arc::new(SimulatedFabric::default_fabric()));

        let counters = vec![counter(fields::DCGM_FI_DEV_GPU_UTIL, "DCGM_FI_DEV_GPU_UTIL")];
        let mut manager = WatchListManager::new(counters, &AppConfig::default());

        manager.create_entity_watch_list(EntityGroup::Gpu, 30_000_000).unwrap();
        // No switch-level counter registered.
        assert!(manager.create_entity_watch_list(EntityGroup::Switch, 30_000_000).is_err());

        assert!(manager.entity_watch_list(EntityGroup::Gpu).is_some());
        assert!(manager.entity_watch_list(EntityGroup::Switch).is_none());
    }

    #[test]
    fn test_core_groups_split_at_max_group_size() {
        let _guard = crate::testlock::lock();
        let fabric = Arc::new(SimulatedFabric::default_fabric());
        // 150 cores across one CPU: expect ceil(150/64) = 3 groups.
        fabric.set_cpus(vec![crate::facade::CpuInfo {
            entity_id: 0,
            cores: (0..150).collect(),
        }]);
        set_client(fabric.clone());

        let inventory = DeviceInventory::initialize(
            DeviceOptions::flex(),
            DeviceOptions::flex(),
            DeviceOptions::flex(),
            EntityGroup::CpuCore,
        )
        .unwrap();

        let watch_list =
            DeviceWatchList::new(inventory, vec![fields::DCGM_FI_DEV_CPU_UTIL_USER], 30_000_000);
        let mut resources = watch_list.watch().unwrap();

        let (groups, field_groups, watches) = fabric.live_resources();
        assert_eq!(groups, 3);
        assert_eq!(field_groups, 1);
        assert_eq!(watches, 3);

        resources.cleanup();
        assert_eq!(fabric.live_resources(), (0, 0, 0));
    }
}
