//! Application configuration and the device selector DSL

use crate::error::{Error, Result};
use crate::metrics::GpuIdKind;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Kubernetes resource name advertised by the NVIDIA device plugin.
pub const NVIDIA_RESOURCE_NAME: &str = "nvidia.com/gpu";
/// Prefix of MIG-partitioned Kubernetes resource names.
pub const NVIDIA_MIG_RESOURCE_PREFIX: &str = "nvidia.com/mig-";
/// Prefix of MIG device UUIDs reported by kubelet.
pub const MIG_UUID_PREFIX: &str = "MIG-";
/// Driver name of the GPU DRA driver.
pub const DRA_GPU_DRIVER_NAME: &str = "gpu.nvidia.com";

/// Selector for which devices of one entity kind are monitored.
///
/// Parsed from the `f` / `g[:range]` / `i[:range]` DSL. An index of `-1`
/// means "all present devices of the kind".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceOptions {
    /// Monitor per-GPU at MIG-instance granularity when MIG is enabled,
    /// at GPU granularity otherwise.
    pub flex: bool,
    /// Top-level entity ids to monitor (empty means none requested).
    pub major_range: Vec<i32>,
    /// Sub-entity ids to monitor (empty means none requested).
    pub minor_range: Vec<i32>,
}

impl DeviceOptions {
    pub fn flex() -> Self {
        Self { flex: true, ..Default::default() }
    }
}

const FLEX_KEY: &str = "f";
const MAJOR_KEY: &str = "g";
const MINOR_KEY: &str = "i";

/// Parse the device selector DSL.
///
/// Grammar: `f` | `g[:<range>]` | `i[:<range>]` where
/// `<range> = <item>(','<item>)*` and `<item> = N | N-M`.
pub fn parse_device_options(devices: &str) -> Result<DeviceOptions> {
    let mut opts = DeviceOptions::default();

    let parts: Vec<&str> = devices.split(':').collect();
    if parts.len() > 2 {
        return Err(Error::config(format!(
            "invalid ranged device option '{}': there can only be one specified range",
            devices
        )));
    }

    let letter = parts[0];
    if letter == FLEX_KEY {
        if parts.len() > 1 {
            return Err(Error::config("no range can be specified with the flex option 'f'"));
        }
        opts.flex = true;
        return Ok(opts);
    }

    if letter != MAJOR_KEY && letter != MINOR_KEY {
        return Err(Error::config(format!(
            "the only valid options preceding ':<range>' are 'g' or 'i', but found '{}'",
            letter
        )));
    }

    let mut indices = Vec::new();
    if parts.len() == 1 {
        // No range means all present devices of the kind
        indices.push(-1);
    } else {
        for item in parts[1].split(',') {
            let range: Vec<&str> = item.split('-').collect();
            match range.len() {
                1 => {
                    let n: i32 = range[0]
                        .parse()
                        .map_err(|_| Error::config(format!("invalid device index '{}'", item)))?;
                    indices.push(n);
                }
                2 => {
                    let start: i32 = range[0]
                        .parse()
                        .map_err(|_| Error::config(format!("invalid device range '{}'", item)))?;
                    let end: i32 = range[1]
                        .parse()
                        .map_err(|_| Error::config(format!("invalid device range '{}'", item)))?;
                    for i in start..=end {
                        indices.push(i);
                    }
                }
                _ => {
                    return Err(Error::config(format!(
                        "range can only be '<number>-<number>', but found '{}'",
                        item
                    )));
                }
            }
        }
    }

    if letter == MAJOR_KEY {
        opts.major_range = indices;
    } else {
        opts.minor_range = indices;
    }
    Ok(opts)
}

/// Debug dump configuration (observational only).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DumpConfig {
    pub enabled: bool,
    pub directory: PathBuf,
    /// Retention period in hours; 0 disables the sweep.
    pub retention_hours: u32,
    pub compression: bool,
}

impl Default for DumpConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            directory: PathBuf::from("/tmp/gpuscope-debug"),
            retention_hours: 24,
            compression: true,
        }
    }
}

/// One supported profiling metric group as reported by the device library.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricGroup {
    pub major_id: u16,
    pub minor_id: u16,
    pub field_ids: Vec<u16>,
}

/// Exporter-wide configuration, derived once from the CLI/environment and
/// re-read on every reload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub collectors_file: PathBuf,
    pub address: String,
    /// Metric collection interval in milliseconds; also the device-library
    /// watch frequency.
    pub collect_interval_ms: u64,

    pub kubernetes: bool,
    pub kubernetes_enable_pod_labels: bool,
    pub kubernetes_enable_pod_uid: bool,
    pub kubernetes_gpu_id_type: GpuIdKind,
    pub kubernetes_pod_label_allowlist: Vec<String>,
    pub kubernetes_pod_label_cache_size: usize,
    pub kubernetes_virtual_gpus: bool,
    pub kubernetes_enable_dra: bool,
    pub nvidia_resource_names: Vec<String>,
    pub pod_resources_kubelet_socket: PathBuf,

    pub gpu_devices: DeviceOptions,
    pub switch_devices: DeviceOptions,
    pub cpu_devices: DeviceOptions,

    pub no_hostname: bool,
    pub use_fake_gpus: bool,
    pub replace_blanks_in_model_name: bool,
    pub debug: bool,
    pub web_config_file: Option<PathBuf>,

    /// Whether profiling (DCP) counters are collected; cleared when the
    /// profiling query fails or panics.
    pub collect_dcp: bool,
    pub metric_groups: Vec<MetricGroup>,

    pub enable_gpu_bind_unbind_watch: bool,
    pub gpu_bind_unbind_poll_interval: Duration,
    pub min_reload_interval: Duration,

    pub dump: DumpConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            collectors_file: PathBuf::from("/etc/gpuscope/default-counters.csv"),
            address: ":9400".to_string(),
            collect_interval_ms: 30_000,
            kubernetes: false,
            kubernetes_enable_pod_labels: false,
            kubernetes_enable_pod_uid: false,
            kubernetes_gpu_id_type: GpuIdKind::Uid,
            kubernetes_pod_label_allowlist: Vec::new(),
            kubernetes_pod_label_cache_size: 150_000,
            kubernetes_virtual_gpus: false,
            kubernetes_enable_dra: false,
            nvidia_resource_names: Vec::new(),
            pod_resources_kubelet_socket: PathBuf::from(
                "/var/lib/kubelet/pod-resources/kubelet.sock",
            ),
            gpu_devices: DeviceOptions::flex(),
            switch_devices: DeviceOptions::flex(),
            cpu_devices: DeviceOptions::flex(),
            no_hostname: false,
            use_fake_gpus: false,
            replace_blanks_in_model_name: false,
            debug: false,
            web_config_file: None,
            collect_dcp: true,
            metric_groups: Vec::new(),
            enable_gpu_bind_unbind_watch: false,
            gpu_bind_unbind_poll_interval: Duration::from_secs(1),
            min_reload_interval: Duration::from_secs(2),
            dump: DumpConfig::default(),
        }
    }
}

impl AppConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.address.is_empty() {
            return Err(Error::config("listen address must not be empty"));
        }
        if self.collect_interval_ms == 0 {
            return Err(Error::config("collect interval must be greater than zero"));
        }
        if self.kubernetes_pod_label_cache_size == 0 {
            return Err(Error::config("pod label cache size must be greater than zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flex() {
        let opts = parse_device_options("f").unwrap();
        assert!(opts.flex);
        assert!(opts.major_range.is_empty());
        assert!(opts.minor_range.is_empty());
    }

    #[test]
    fn test_parse_major_all() {
        let opts = parse_device_options("g").unwrap();
        assert!(!opts.flex);
        assert_eq!(opts.major_range, vec![-1]);
    }

    #[test]
    fn test_parse_minor_list_with_range() {
        let opts = parse_device_options("i:0,2-4").unwrap();
        assert_eq!(opts.minor_range, vec![0, 2, 3, 4]);
    }

    #[test]
    fn test_parse_major_list() {
        let opts = parse_device_options("g:0,1").unwrap();
        assert_eq!(opts.major_range, vec![0, 1]);
    }

    #[test]
    fn test_parse_errors() {
        // multiple ':'
        assert!(parse_device_options("g:0:1").is_err());
        // range with flex
        assert!(parse_device_options("f:0").is_err());
        // letter not in {f,g,i}
        assert!(parse_device_options("x:1").is_err());
        // malformed range
        assert!(parse_device_options("g:1-2-3").is_err());
        assert!(parse_device_options("g:a").is_err());
    }

    #[test]
    fn test_default_config_validates() {
        AppConfig::default().validate().unwrap();
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = AppConfig::default();
        config.collect_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.address = String::new();
        assert!(config.validate().is_err());
    }
}
