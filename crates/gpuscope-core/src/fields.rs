//! Field metadata for the device management library
//!
//! Every field identifier used anywhere in gpuscope comes from the named
//! constants below; counters resolve field names through the same table.

use crate::metrics::EntityGroup;

/// Value encoding of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Int64,
    Double,
    Text,
}

/// Static metadata for one field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldMeta {
    pub id: u16,
    pub name: &'static str,
    pub entity_level: EntityGroup,
    pub kind: FieldKind,
}

pub const DCGM_FI_DRIVER_VERSION: u16 = 1;
pub const DCGM_FI_NVML_VERSION: u16 = 2;
pub const DCGM_FI_DEV_NAME: u16 = 50;
pub const DCGM_FI_DEV_BRAND: u16 = 51;
pub const DCGM_FI_DEV_SERIAL: u16 = 53;
pub const DCGM_FI_DEV_PCI_BUSID: u16 = 57;
pub const DCGM_FI_DEV_UUID: u16 = 59;
pub const DCGM_FI_DEV_MINOR_NUMBER: u16 = 60;
pub const DCGM_FI_DEV_MIG_MODE: u16 = 66;
pub const DCGM_FI_DEV_MIG_MAX_SLICES: u16 = 67;
pub const DCGM_FI_DEV_SM_CLOCK: u16 = 100;
pub const DCGM_FI_DEV_MEM_CLOCK: u16 = 101;
pub const DCGM_FI_DEV_MEMORY_TEMP: u16 = 140;
pub const DCGM_FI_DEV_GPU_TEMP: u16 = 150;
pub const DCGM_FI_DEV_POWER_USAGE: u16 = 155;
pub const DCGM_FI_DEV_TOTAL_ENERGY_CONSUMPTION: u16 = 156;
pub const DCGM_FI_DEV_PSTATE: u16 = 190;
pub const DCGM_FI_DEV_PCIE_TX_THROUGHPUT: u16 = 200;
pub const DCGM_FI_DEV_PCIE_RX_THROUGHPUT: u16 = 201;
pub const DCGM_FI_DEV_GPU_UTIL: u16 = 203;
pub const DCGM_FI_DEV_MEM_COPY_UTIL: u16 = 204;
pub const DCGM_FI_DEV_ENC_UTIL: u16 = 206;
pub const DCGM_FI_DEV_DEC_UTIL: u16 = 207;
pub const DCGM_FI_DEV_XID_ERRORS: u16 = 230;
pub const DCGM_FI_DEV_FB_TOTAL: u16 = 250;
pub const DCGM_FI_DEV_FB_FREE: u16 = 251;
pub const DCGM_FI_DEV_FB_USED: u16 = 252;
pub const DCGM_FI_DEV_FB_RESERVED: u16 = 253;
pub const DCGM_FI_DEV_ECC_SBE_VOL_TOTAL: u16 = 310;
pub const DCGM_FI_DEV_ECC_DBE_VOL_TOTAL: u16 = 311;
pub const DCGM_FI_DEV_VGPU_LICENSE_STATUS: u16 = 383;
pub const DCGM_FI_DEV_NVLINK_BANDWIDTH_TOTAL: u16 = 449;
pub const DCGM_FI_DEV_NVSWITCH_TEMPERATURE_CURRENT: u16 = 701;
pub const DCGM_FI_DEV_NVSWITCH_LINK_THROUGHPUT_TX: u16 = 780;
pub const DCGM_FI_DEV_NVSWITCH_LINK_THROUGHPUT_RX: u16 = 781;
pub const DCGM_FI_BIND_UNBIND_EVENT: u16 = 860;
pub const DCGM_FI_PROF_GR_ENGINE_ACTIVE: u16 = 1001;
pub const DCGM_FI_PROF_SM_ACTIVE: u16 = 1002;
pub const DCGM_FI_PROF_SM_OCCUPANCY: u16 = 1003;
pub const DCGM_FI_PROF_PIPE_TENSOR_ACTIVE: u16 = 1004;
pub const DCGM_FI_PROF_DRAM_ACTIVE: u16 = 1005;
pub const DCGM_FI_PROF_PCIE_TX_BYTES: u16 = 1009;
pub const DCGM_FI_PROF_PCIE_RX_BYTES: u16 = 1010;
pub const DCGM_FI_DEV_CPU_UTIL_TOTAL: u16 = 1100;
pub const DCGM_FI_DEV_CPU_UTIL_USER: u16 = 1101;
pub const DCGM_FI_DEV_CPU_TEMP_CURRENT: u16 = 1110;
pub const DCGM_FI_DEV_CPU_POWER_UTIL_CURRENT: u16 = 1130;

/// Synthesized by the weighted-utilization stage; never watched.
pub const DCGM_EXP_WEIGHTED_GPU_UTIL: u16 = 9004;

/// Field name of the synthesized weighted-utilization counter.
pub const WEIGHTED_GPU_UTIL_NAME: &str = "DCGM_FI_DEV_WEIGHTED_GPU_UTIL";

/// Values of [`DCGM_FI_BIND_UNBIND_EVENT`] that signal a topology change.
pub const BIND_UNBIND_SYSTEM_REINITIALIZING: i64 = 1;
pub const BIND_UNBIND_SYSTEM_REINITIALIZATION_COMPLETED: i64 = 2;

/// Maximum number of entities the device library accepts in one group.
pub const GROUP_MAX_ENTITIES: usize = 64;

static FIELDS: &[FieldMeta] = &[
    FieldMeta { id: DCGM_FI_DRIVER_VERSION, name: "DCGM_FI_DRIVER_VERSION", entity_level: EntityGroup::None, kind: FieldKind::Text },
    FieldMeta { id: DCGM_FI_NVML_VERSION, name: "DCGM_FI_NVML_VERSION", entity_level: EntityGroup::None, kind: FieldKind::Text },
    FieldMeta { id: DCGM_FI_DEV_NAME, name: "DCGM_FI_DEV_NAME", entity_level: EntityGroup::Gpu, kind: FieldKind::Text },
    FieldMeta { id: DCGM_FI_DEV_BRAND, name: "DCGM_FI_DEV_BRAND", entity_level: EntityGroup::Gpu, kind: FieldKind::Text },
    FieldMeta { id: DCGM_FI_DEV_SERIAL, name: "DCGM_FI_DEV_SERIAL", entity_level: EntityGroup::Gpu, kind: FieldKind::Text },
    FieldMeta { id: DCGM_FI_DEV_PCI_BUSID, name: "DCGM_FI_DEV_PCI_BUSID", entity_level: EntityGroup::Gpu, kind: FieldKind::Text },
    FieldMeta { id: DCGM_FI_DEV_UUID, name: "DCGM_FI_DEV_UUID", entity_level: EntityGroup::Gpu, kind: FieldKind::Text },
    FieldMeta { id: DCGM_FI_DEV_MINOR_NUMBER, name: "DCGM_FI_DEV_MINOR_NUMBER", entity_level: EntityGroup::Gpu, kind: FieldKind::Int64 },
    FieldMeta { id: DCGM_FI_DEV_MIG_MODE, name: "DCGM_FI_DEV_MIG_MODE", entity_level: EntityGroup::Gpu, kind: FieldKind::Int64 },
    FieldMeta { id: DCGM_FI_DEV_MIG_MAX_SLICES, name: "DCGM_FI_DEV_MIG_MAX_SLICES", entity_level: EntityGroup::Gpu, kind: FieldKind::Int64 },
    FieldMeta { id: DCGM_FI_DEV_SM_CLOCK, name: "DCGM_FI_DEV_SM_CLOCK", entity_level: EntityGroup::Gpu, kind: FieldKind::Int64 },
    FieldMeta { id: DCGM_FI_DEV_MEM_CLOCK, name: "DCGM_FI_DEV_MEM_CLOCK", entity_level: EntityGroup::Gpu, kind: FieldKind::Int64 },
    FieldMeta { id: DCGM_FI_DEV_MEMORY_TEMP, name: "DCGM_FI_DEV_MEMORY_TEMP", entity_level: EntityGroup::Gpu, kind: FieldKind::Int64 },
    FieldMeta { id: DCGM_FI_DEV_GPU_TEMP, name: "DCGM_FI_DEV_GPU_TEMP", entity_level: EntityGroup::Gpu, kind: FieldKind::Int64 },
    FieldMeta { id: DCGM_FI_DEV_POWER_USAGE, name: "DCGM_FI_DEV_POWER_USAGE", entity_level: EntityGroup::Gpu, kind: FieldKind::Double },
    FieldMeta { id: DCGM_FI_DEV_TOTAL_ENERGY_CONSUMPTION, name: "DCGM_FI_DEV_TOTAL_ENERGY_CONSUMPTION", entity_level: EntityGroup::Gpu, kind: FieldKind::Int64 },
    FieldMeta { id: DCGM_FI_DEV_PSTATE, name: "DCGM_FI_DEV_PSTATE", entity_level: EntityGroup::Gpu, kind: FieldKind::Int64 },
    FieldMeta { id: DCGM_FI_DEV_PCIE_TX_THROUGHPUT, name: "DCGM_FI_DEV_PCIE_TX_THROUGHPUT", entity_level: EntityGroup::Gpu, kind: FieldKind::Int64 },
    FieldMeta { id: DCGM_FI_DEV_PCIE_RX_THROUGHPUT, name: "DCGM_FI_DEV_PCIE_RX_THROUGHPUT", entity_level: EntityGroup::Gpu, kind: FieldKind::Int64 },
    FieldMeta { id: DCGM_FI_DEV_GPU_UTIL, name: "DCGM_FI_DEV_GPU_UTIL", entity_level: EntityGroup::Gpu, kind: FieldKind::Int64 },
    FieldMeta { id: DCGM_FI_DEV_MEM_COPY_UTIL, name: "DCGM_FI_DEV_MEM_COPY_UTIL", entity_level: EntityGroup::Gpu, kind: FieldKind::Int64 },
    FieldMeta { id: DCGM_FI_DEV_ENC_UTIL, name: "DCGM_FI_DEV_ENC_UTIL", entity_level: EntityGroup::Gpu, kind: FieldKind::Int64 },
    FieldMeta { id: DCGM_FI_DEV_DEC_UTIL, name: "DCGM_FI_DEV_DEC_UTIL", entity_level: EntityGroup::Gpu, kind: FieldKind::Int64 },
    FieldMeta { id: DCGM_FI_DEV_XID_ERRORS, name: "DCGM_FI_DEV_XID_ERRORS", entity_level: EntityGroup::Gpu, kind: FieldKind::Int64 },
    FieldMeta { id: DCGM_FI_DEV_FB_TOTAL, name: "DCGM_FI_DEV_FB_TOTAL", entity_level: EntityGroup::Gpu, kind: FieldKind::Int64 },
    FieldMeta { id: DCGM_FI_DEV_FB_FREE, name: "DCGM_FI_DEV_FB_FREE", entity_level: EntityGroup::Gpu, kind: FieldKind::Int64 },
    FieldMeta { id: DCGM_FI_DEV_FB_USED, name: "DCGM_FI_DEV_FB_USED", entity_level: EntityGroup::Gpu, kind: FieldKind::Int64 },
    FieldMeta { id: DCGM_FI_DEV_FB_RESERVED, name: "DCGM_FI_DEV_FB_RESERVED", entity_level: EntityGroup::Gpu, kind: FieldKind::Int64 },
    FieldMeta { id: DCGM_FI_DEV_ECC_SBE_VOL_TOTAL, name: "DCGM_FI_DEV_ECC_SBE_VOL_TOTAL", entity_level: EntityGroup::Gpu, kind: FieldKind::Int64 },
    FieldMeta { id: DCGM_FI_DEV_ECC_DBE_VOL_TOTAL, name: "DCGM_FI_DEV_ECC_DBE_VOL_TOTAL", entity_level: EntityGroup::Gpu, kind: FieldKind::Int64 },
    FieldMeta { id: DCGM_FI_DEV_VGPU_LICENSE_STATUS, name: "DCGM_FI_DEV_VGPU_LICENSE_STATUS", entity_level: EntityGroup::Vgpu, kind: FieldKind::Int64 },
    FieldMeta { id: DCGM_FI_DEV_NVLINK_BANDWIDTH_TOTAL, name: "DCGM_FI_DEV_NVLINK_BANDWIDTH_TOTAL", entity_level: EntityGroup::Gpu, kind: FieldKind::Int64 },
    FieldMeta { id: DCGM_FI_DEV_NVSWITCH_TEMPERATURE_CURRENT, name: "DCGM_FI_DEV_NVSWITCH_TEMPERATURE_CURRENT", entity_level: EntityGroup::Switch, kind: FieldKind::Int64 },
    FieldMeta { id: DCGM_FI_DEV_NVSWITCH_LINK_THROUGHPUT_TX, name: "DCGM_FI_DEV_NVSWITCH_LINK_THROUGHPUT_TX", entity_level: EntityGroup::Link, kind: FieldKind::Int64 },
    FieldMeta { id: DCGM_FI_DEV_NVSWITCH_LINK_THROUGHPUT_RX, name: "DCGM_FI_DEV_NVSWITCH_LINK_THROUGHPUT_RX", entity_level: EntityGroup::Link, kind: FieldKind::Int64 },
    FieldMeta { id: DCGM_FI_BIND_UNBIND_EVENT, name: "DCGM_FI_BIND_UNBIND_EVENT", entity_level: EntityGroup::None, kind: FieldKind::Int64 },
    FieldMeta { id: DCGM_FI_PROF_GR_ENGINE_ACTIVE, name: "DCGM_FI_PROF_GR_ENGINE_ACTIVE", entity_level: EntityGroup::Gpu, kind: FieldKind::Double },
    FieldMeta { id: DCGM_FI_PROF_SM_ACTIVE, name: "DCGM_FI_PROF_SM_ACTIVE", entity_level: EntityGroup::Gpu, kind: FieldKind::Double },
    FieldMeta { id: DCGM_FI_PROF_SM_OCCUPANCY, name: "DCGM_FI_PROF_SM_OCCUPANCY", entity_level: EntityGroup::Gpu, kind: FieldKind::Double },
    FieldMeta { id: DCGM_FI_PROF_PIPE_TENSOR_ACTIVE, name: "DCGM_FI_PROF_PIPE_TENSOR_ACTIVE", entity_level: EntityGroup::Gpu, kind: FieldKind::Double },
    FieldMeta { id: DCGM_FI_PROF_DRAM_ACTIVE, name: "DCGM_FI_PROF_DRAM_ACTIVE", entity_level: EntityGroup::Gpu, kind: FieldKind::Double },
    FieldMeta { id: DCGM_FI_PROF_PCIE_TX_BYTES, name: "DCGM_FI_PROF_PCIE_TX_BYTES", entity_level: EntityGroup::Gpu, kind: FieldKind::Int64 },
    FieldMeta { id: DCGM_FI_PROF_PCIE_RX_BYTES, name: "DCGM_FI_PROF_PCIE_RX_BYTES", entity_level: EntityGroup::Gpu, kind: FieldKind::Int64 },
    FieldMeta { id: DCGM_FI_DEV_CPU_UTIL_TOTAL, name: "DCGM_FI_DEV_CPU_UTIL_TOTAL", entity_level: EntityGroup::Cpu, kind: FieldKind::Double },
    FieldMeta { id: DCGM_FI_DEV_CPU_UTIL_USER, name: "DCGM_FI_DEV_CPU_UTIL_USER", entity_level: EntityGroup::CpuCore, kind: FieldKind::Double },
    FieldMeta { id: DCGM_FI_DEV_CPU_TEMP_CURRENT, name: "DCGM_FI_DEV_CPU_TEMP_CURRENT", entity_level: EntityGroup::Cpu, kind: FieldKind::Double },
    FieldMeta { id: DCGM_FI_DEV_CPU_POWER_UTIL_CURRENT, name: "DCGM_FI_DEV_CPU_POWER_UTIL_CURRENT", entity_level: EntityGroup::Cpu, kind: FieldKind::Double },
];

/// Look up field metadata by numeric id.
pub fn by_id(id: u16) -> Option<&'static FieldMeta> {
    FIELDS.iter().find(|f| f.id == id)
}

/// Look up field metadata by exposition name.
pub fn by_name(name: &str) -> Option<&'static FieldMeta> {
    FIELDS.iter().find(|f| f.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_by_id_and_name() {
        let meta = by_id(DCGM_FI_DEV_GPU_UTIL).unwrap();
        assert_eq!(meta.name, "DCGM_FI_DEV_GPU_UTIL");
        assert_eq!(meta.entity_level, EntityGroup::Gpu);
        assert_eq!(meta.kind, FieldKind::Int64);

        let meta = by_name("DCGM_FI_PROF_GR_ENGINE_ACTIVE").unwrap();
        assert_eq!(meta.id, DCGM_FI_PROF_GR_ENGINE_ACTIVE);
        assert_eq!(meta.kind, FieldKind::Double);

        assert!(by_id(0xFFFF).is_none());
        assert!(by_name("DCGM_FI_DOES_NOT_EXIST").is_none());
    }

    #[test]
    fn test_table_has_unique_ids_and_names() {
        let mut ids: Vec<u16> = FIELDS.iter().map(|f| f.id).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), FIELDS.len());

        let mut names: Vec<&str> = FIELDS.iter().map(|f| f.name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), FIELDS.len());
    }
}
