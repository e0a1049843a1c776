//! Metric, value, and entity data structures
//!
//! A [`Metric`] lives for exactly one gather; entities are owned by the device
//! inventory and are only valid between two reload-coordinator actions.

use crate::counters::Counter;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Entity groups recognized by the device management library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityGroup {
    /// Global scope (no entity)
    None,
    /// Physical GPU
    Gpu,
    /// Virtual GPU
    Vgpu,
    /// NvSwitch
    Switch,
    /// MIG GPU instance
    GpuInstance,
    /// MIG compute instance
    ComputeInstance,
    /// NvLink
    Link,
    /// CPU socket
    Cpu,
    /// CPU core
    CpuCore,
}

impl EntityGroup {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityGroup::None => "NONE",
            EntityGroup::Gpu => "GPU",
            EntityGroup::Vgpu => "VGPU",
            EntityGroup::Switch => "SWITCH",
            EntityGroup::GpuInstance => "GPU_I",
            EntityGroup::ComputeInstance => "GPU_CI",
            EntityGroup::Link => "LINK",
            EntityGroup::Cpu => "CPU",
            EntityGroup::CpuCore => "CPU_CORE",
        }
    }
}

impl std::fmt::Display for EntityGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A monitored entity, addressed by `(group, id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Entity {
    pub group: EntityGroup,
    pub id: u32,
}

impl Entity {
    pub fn new(group: EntityGroup, id: u32) -> Self {
        Self { group, id }
    }
}

/// A single field value as returned by the device library.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Int64(i64),
    Double(f64),
    Text(String),
    Blob(Vec<u8>),
}

/// One sample of one field for one entity.
///
/// `sentinel` covers the library's BLANK / NOT_FOUND / NOT_SUPPORTED /
/// NOT_PERMISSIONED constants; a sentinel sample must be skipped, never
/// treated as zero.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSample {
    pub field_id: u16,
    pub value: FieldValue,
    pub sentinel: bool,
    pub timestamp_us: i64,
}

impl FieldSample {
    pub fn int64(field_id: u16, v: i64) -> Self {
        Self { field_id, value: FieldValue::Int64(v), sentinel: false, timestamp_us: 0 }
    }

    pub fn double(field_id: u16, v: f64) -> Self {
        Self { field_id, value: FieldValue::Double(v), sentinel: false, timestamp_us: 0 }
    }

    pub fn text(field_id: u16, v: impl Into<String>) -> Self {
        Self { field_id, value: FieldValue::Text(v.into()), sentinel: false, timestamp_us: 0 }
    }

    pub fn blank(field_id: u16) -> Self {
        Self { field_id, value: FieldValue::Int64(0), sentinel: true, timestamp_us: 0 }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self.value {
            FieldValue::Int64(v) => Some(v),
            _ => None,
        }
    }

    /// Render the value for exposition. Returns `None` for sentinel samples
    /// and for blob values, which have no text representation.
    pub fn display_value(&self) -> Option<String> {
        if self.sentinel {
            return None;
        }
        match &self.value {
            FieldValue::Int64(v) => Some(v.to_string()),
            FieldValue::Double(v) => Some(format!("{:.6}", v)),
            FieldValue::Text(v) => Some(v.clone()),
            FieldValue::Blob(_) => None,
        }
    }
}

/// Which GPU identifier is used to join metrics to Kubernetes pods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GpuIdKind {
    Uid,
    DeviceName,
}

/// A single emitted sample.
#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    pub counter: Counter,
    pub value: String,

    /// Entity index rendered as a string (`"0"`, `"1"`, ...)
    pub gpu: String,
    /// Physical GPU UUID
    pub gpu_uuid: String,
    /// Device node name (`nvidia0`, `nvswitch3`)
    pub gpu_device: String,
    pub gpu_model: String,
    pub gpu_pci_bus_id: String,
    pub hostname: String,

    /// MIG profile string (`1g.5gb`); empty for non-MIG entities
    pub mig_profile: String,
    /// MIG GPU instance id; empty for non-MIG entities
    pub gpu_instance_id: String,

    /// Per-entity labels harvested from `label`-type counters
    pub labels: HashMap<String, String>,
    /// Enrichment added by the transformation pipeline
    pub attributes: HashMap<String, String>,
}

impl Metric {
    /// The identifier used to join this sample to kubelet device assignments.
    ///
    /// MIG entities join at GPU-instance granularity (`<gpuIdx>-<giId>`),
    /// everything else at the physical identifier.
    pub fn id_of_type(&self, kind: GpuIdKind) -> String {
        match kind {
            GpuIdKind::Uid => {
                if !self.gpu_instance_id.is_empty() {
                    format!("{}-{}", self.gpu, self.gpu_instance_id)
                } else {
                    self.gpu_uuid.clone()
                }
            }
            GpuIdKind::DeviceName => {
                if !self.gpu_instance_id.is_empty() {
                    format!("{}-{}", self.gpu_device, self.gpu_instance_id)
                } else {
                    self.gpu_device.clone()
                }
            }
        }
    }
}

/// One gather's worth of samples for one entity group.
pub type MetricsByCounter = HashMap<Counter, Vec<Metric>>;

/// The merged result of one gather across all entity groups.
pub type MetricsByCounterGroup = HashMap<EntityGroup, MetricsByCounter>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counters::PromType;

    fn counter() -> Counter {
        Counter {
            field_id: 203,
            field_name: "DCGM_FI_DEV_GPU_UTIL".to_string(),
            prom_type: PromType::Gauge,
            help: "GPU utilization".to_string(),
        }
    }

    fn metric() -> Metric {
        Metric {
            counter: counter(),
            value: "42".to_string(),
            gpu: "1".to_string(),
            gpu_uuid: "GPU-aaaa".to_string(),
            gpu_device: "nvidia1".to_string(),
            gpu_model: "NVIDIA A100".to_string(),
            gpu_pci_bus_id: "00000000:17:00.0".to_string(),
            hostname: "node-1".to_string(),
            mig_profile: String::new(),
            gpu_instance_id: String::new(),
            labels: HashMap::new(),
            attributes: HashMap::new(),
        }
    }

    #[test]
    fn test_id_of_type_physical() {
        let m = metric();
        assert_eq!(m.id_of_type(GpuIdKind::Uid), "GPU-aaaa");
        assert_eq!(m.id_of_type(GpuIdKind::DeviceName), "nvidia1");
    }

    #[test]
    fn test_id_of_type_mig_instance() {
        let mut m = metric();
        m.gpu_instance_id = "3".to_string();
        assert_eq!(m.id_of_type(GpuIdKind::Uid), "1-3");
        assert_eq!(m.id_of_type(GpuIdKind::DeviceName), "nvidia1-3");
    }

    #[test]
    fn test_sentinel_has_no_display_value() {
        let s = FieldSample::blank(203);
        assert!(s.display_value().is_none());

        let s = FieldSample::int64(203, 77);
        assert_eq!(s.display_value().as_deref(), Some("77"));

        let s = FieldSample::double(1001, 0.58);
        assert_eq!(s.display_value().as_deref(), Some("0.580000"));
    }
}
