//! CLI front-end
//!
//! Every flag is mirrored by a `DCGM_EXPORTER_*` environment variable with
//! the same semantics; the flag wins when both are present.

use crate::{AgentError, Result};
use clap::Parser;
use gpuscope_core::config::{parse_device_options, AppConfig, DumpConfig};
use gpuscope_core::GpuIdKind;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

const DEVICE_USAGE: &str = "Specify which devices gpuscope monitors. \
Possible values: 'f' (all GPU instances in MIG mode, all GPUs otherwise), \
'g[:id1[,id2-id3...]]' (top-level entities), or \
'i[:id1[,id2-id3...]]' (sub-level entities; requires MIG mode for GPUs). \
Any listed id must exist on the system.";

#[derive(Debug, Clone, Parser)]
#[command(name = "gpuscoped", about = "Generates GPU metrics in the prometheus format")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Path to the file that contains the fields to collect
    #[arg(short = 'f', long = "collectors", env = "DCGM_EXPORTER_COLLECTORS",
        default_value = "/etc/gpuscope/default-counters.csv")]
    pub collectors_file: PathBuf,

    /// Listen address
    #[arg(short = 'a', long = "address", env = "DCGM_EXPORTER_LISTEN", default_value = ":9400")]
    pub address: String,

    /// Interval of time at which point metrics are collected, in milliseconds
    #[arg(short = 'c', long = "collect-interval", env = "DCGM_EXPORTER_INTERVAL",
        default_value_t = 30000)]
    pub collect_interval: u64,

    /// Enable mapping metrics to kubernetes pods
    #[arg(short = 'k', long = "kubernetes", env = "DCGM_EXPORTER_KUBERNETES")]
    pub kubernetes: bool,

    /// Enable kubernetes pod labels in metrics (effective with --kubernetes)
    #[arg(long = "kubernetes-enable-pod-labels",
        env = "DCGM_EXPORTER_KUBERNETES_ENABLE_POD_LABELS")]
    pub kubernetes_enable_pod_labels: bool,

    /// Enable kubernetes pod UID in metrics (effective with --kubernetes)
    #[arg(long = "kubernetes-enable-pod-uid", env = "DCGM_EXPORTER_KUBERNETES_ENABLE_POD_UID")]
    pub kubernetes_enable_pod_uid: bool,

    /// Type of GPU ID used to map kubernetes resources to pods ('uid' or 'device-name')
    #[arg(long = "kubernetes-gpu-id-type", env = "DCGM_EXPORTER_KUBERNETES_GPU_ID_TYPE",
        default_value = "uid")]
    pub kubernetes_gpu_id_type: String,

    /// Regex patterns for filtering pod labels to include in metrics
    /// (comma-separated). Empty means include all labels.
    #[arg(long = "kubernetes-pod-label-allowlist-regex",
        env = "DCGM_EXPORTER_KUBERNETES_POD_LABEL_ALLOWLIST_REGEX", value_delimiter = ',')]
    pub kubernetes_pod_label_allowlist: Vec<String>,

    /// Capture metrics associated with virtual GPUs exposed by device
    /// plugins when using GPU sharing strategies
    #[arg(long = "kubernetes-virtual-gpus", env = "KUBERNETES_VIRTUAL_GPUS")]
    pub kubernetes_virtual_gpus: bool,

    /// Capture metrics associated with GPUs managed through Dynamic Resource
    /// Allocation
    #[arg(long = "kubernetes-enable-dra", env = "KUBERNETES_ENABLE_DRA")]
    pub kubernetes_enable_dra: bool,

    /// Additional resource names for specific GPU types,
    /// like nvidia.com/a100
    #[arg(long = "nvidia-resource-names", env = "NVIDIA_RESOURCE_NAMES", value_delimiter = ',')]
    pub nvidia_resource_names: Vec<String>,

    /// Path to the kubelet pod-resources socket file
    #[arg(long = "pod-resources-kubelet-socket", env = "DCGM_POD_RESOURCES_KUBELET_SOCKET",
        default_value = "/var/lib/kubelet/pod-resources/kubelet.sock")]
    pub pod_resources_kubelet_socket: PathBuf,

    /// GPU device selector
    #[arg(short = 'd', long = "devices", env = "DCGM_EXPORTER_DEVICES_STR",
        default_value = "f", help = DEVICE_USAGE)]
    pub gpu_devices: String,

    /// NvSwitch device selector
    #[arg(short = 's', long = "switch-devices", env = "DCGM_EXPORTER_OTHER_DEVICES_STR",
        default_value = "f", help = DEVICE_USAGE)]
    pub switch_devices: String,

    /// CPU device selector
    #[arg(short = 'p', long = "cpu-devices", env = "DCGM_EXPORTER_CPU_DEVICES_STR",
        default_value = "f", help = DEVICE_USAGE)]
    pub cpu_devices: String,

    /// Omit the hostname information from the output
    #[arg(short = 'n', long = "no-hostname", env = "DCGM_EXPORTER_NO_HOSTNAME")]
    pub no_hostname: bool,

    /// Accept GPUs that are fake, for testing purposes only
    #[arg(long = "fake-gpus", env = "DCGM_EXPORTER_USE_FAKE_GPUS")]
    pub use_fake_gpus: bool,

    /// Replace every blank space in the GPU model name with a dash
    #[arg(long = "replace-blanks-in-model-name",
        env = "DCGM_EXPORTER_REPLACE_BLANKS_IN_MODEL_NAME")]
    pub replace_blanks_in_model_name: bool,

    /// Web configuration file following the exporter-toolkit webConfig spec
    #[arg(long = "web-config-file", env = "DCGM_EXPORTER_WEB_CONFIG_FILE")]
    pub web_config_file: Option<PathBuf>,

    /// Enable debug output
    #[arg(long = "debug", env = "DCGM_EXPORTER_DEBUG")]
    pub debug: bool,

    /// Log output format ('text' or 'json')
    #[arg(long = "log-format", env = "DCGM_EXPORTER_LOG_FORMAT", default_value = "text")]
    pub log_format: String,

    /// Watch for GPU bind/unbind events to trigger automatic reloads
    #[arg(long = "enable-gpu-bind-unbind-watch",
        env = "DCGM_EXPORTER_ENABLE_GPU_BIND_UNBIND_WATCH")]
    pub enable_gpu_bind_unbind_watch: bool,

    /// Interval for polling GPU bind/unbind events
    #[arg(long = "gpu-bind-unbind-poll-interval",
        env = "DCGM_EXPORTER_GPU_BIND_UNBIND_POLL_INTERVAL", default_value = "1s")]
    pub gpu_bind_unbind_poll_interval: String,

    /// Enable file-based debugging dumps for troubleshooting
    #[arg(long = "dump-enabled", env = "DCGM_EXPORTER_DUMP_ENABLED")]
    pub dump_enabled: bool,

    /// Directory to store debug dump files
    #[arg(long = "dump-directory", env = "DCGM_EXPORTER_DUMP_DIRECTORY",
        default_value = "/tmp/gpuscope-debug")]
    pub dump_directory: PathBuf,

    /// Retention period for debug dump files in hours (0 = no cleanup)
    #[arg(long = "dump-retention", env = "DCGM_EXPORTER_DUMP_RETENTION", default_value_t = 24)]
    pub dump_retention: u32,

    /// Use gzip compression for debug dump files
    #[arg(long = "dump-compression", env = "DCGM_EXPORTER_DUMP_COMPRESSION",
        default_value_t = true, action = clap::ArgAction::Set)]
    pub dump_compression: bool,
}

/// Parse a duration like `500ms`, `1s`, or `2m`. Falls back to the default
/// with a warning on malformed input.
pub fn parse_duration(input: &str, default: Duration) -> Duration {
    let input = input.trim();
    if input.is_empty() {
        return default;
    }

    let parsed = if let Some(n) = input.strip_suffix("ms") {
        n.parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(n) = input.strip_suffix('s') {
        n.parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(n) = input.strip_suffix('m') {
        n.parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else {
        input.parse::<u64>().ok().map(Duration::from_secs)
    };

    match parsed {
        Some(d) => d,
        None => {
            warn!(input, default_secs = default.as_secs(), "failed to parse duration, using default");
            default
        }
    }
}

impl Cli {
    /// Derive the application configuration. Re-evaluated on every reload so
    /// environment-driven settings are re-read.
    pub fn to_config(&self) -> Result<AppConfig> {
        let gpu_devices = parse_device_options(&self.gpu_devices)?;
        let switch_devices = parse_device_options(&self.switch_devices)?;
        let cpu_devices = parse_device_options(&self.cpu_devices)?;

        let kubernetes_gpu_id_type = match self.kubernetes_gpu_id_type.as_str() {
            "uid" => GpuIdKind::Uid,
            "device-name" => GpuIdKind::DeviceName,
            other => {
                return Err(AgentError::Config(format!(
                    "invalid kubernetes-gpu-id-type value: '{}' (expected 'uid' or 'device-name')",
                    other
                )));
            }
        };

        let config = AppConfig {
            collectors_file: self.collectors_file.clone(),
            address: self.address.clone(),
            collect_interval_ms: self.collect_interval,
            kubernetes: self.kubernetes,
            kubernetes_enable_pod_labels: self.kubernetes_enable_pod_labels,
            kubernetes_enable_pod_uid: self.kubernetes_enable_pod_uid,
            kubernetes_gpu_id_type,
            kubernetes_pod_label_allowlist: self
                .kubernetes_pod_label_allowlist
                .iter()
                .filter(|s| !s.is_empty())
                .cloned()
                .collect(),
            kubernetes_virtual_gpus: self.kubernetes_virtual_gpus,
            kubernetes_enable_dra: self.kubernetes_enable_dra,
            nvidia_resource_names: self
                .nvidia_resource_names
                .iter()
                .filter(|s| !s.is_empty())
                .cloned()
                .collect(),
            pod_resources_kubelet_socket: self.pod_resources_kubelet_socket.clone(),
            gpu_devices,
            switch_devices,
            cpu_devices,
            no_hostname: self.no_hostname,
            use_fake_gpus: self.use_fake_gpus,
            replace_blanks_in_model_name: self.replace_blanks_in_model_name,
            debug: self.debug,
            web_config_file: self.web_config_file.clone(),
            enable_gpu_bind_unbind_watch: self.enable_gpu_bind_unbind_watch,
            gpu_bind_unbind_poll_interval: parse_duration(
                &self.gpu_bind_unbind_poll_interval,
                Duration::from_secs(1),
            ),
            dump: DumpConfig {
                enabled: self.dump_enabled,
                directory: self.dump_directory.clone(),
                retention_hours: self.dump_retention,
                compression: self.dump_compression,
            },
            ..AppConfig::default()
        };

        config.validate()?;
        Ok(config)
    }

    /// A CLI instance with every flag at its default. Test seam.
    pub fn defaults() -> Self {
        Self::parse_from(["gpuscoped"])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_produce_valid_config() {
        let cli = Cli::defaults();
        let config = cli.to_config().unwrap();
        assert_eq!(config.address, ":9400");
        assert_eq!(config.collect_interval_ms, 30000);
        assert!(config.gpu_devices.flex);
        assert!(!config.kubernetes);
        assert_eq!(config.kubernetes_gpu_id_type, GpuIdKind::Uid);
    }

    #[test]
    fn test_flags_override_defaults() {
        let cli = Cli::parse_from([
            "gpuscoped",
            "-a",
            ":9500",
            "-d",
            "g:0,1",
            "--kubernetes",
            "--kubernetes-gpu-id-type",
            "device-name",
        ]);
        let config = cli.to_config().unwrap();
        assert_eq!(config.address, ":9500");
        assert_eq!(config.gpu_devices.major_range, vec![0, 1]);
        assert!(config.kubernetes);
        assert_eq!(config.kubernetes_gpu_id_type, GpuIdKind::DeviceName);
    }

    #[test]
    fn test_invalid_selector_is_rejected() {
        let cli = Cli::parse_from(["gpuscoped", "-d", "x:1"]);
        assert!(cli.to_config().is_err());
    }

    #[test]
    fn test_invalid_gpu_id_type_is_rejected() {
        let cli = Cli::parse_from(["gpuscoped", "--kubernetes-gpu-id-type", "bogus"]);
        assert!(cli.to_config().is_err());
    }

    #[test]
    fn test_parse_duration_forms() {
        let default = Duration::from_secs(1);
        assert_eq!(parse_duration("500ms", default), Duration::from_millis(500));
        assert_eq!(parse_duration("2s", default), Duration::from_secs(2));
        assert_eq!(parse_duration("3m", default), Duration::from_secs(180));
        assert_eq!(parse_duration("5", default), Duration::from_secs(5));
        assert_eq!(parse_duration("garbage", default), default);
        assert_eq!(parse_duration("", default), default);
    }
}
