//! Process mapper stage
//!
//! Duplicates process-meaningful samples once per process running on the
//! sample's GPU, attaching pid, command, and process type. Device-level
//! metrics (temperature, power, clocks) are left alone to avoid metric
//! explosion.

use crate::Transform;
use gpuscope_core::fields::WEIGHTED_GPU_UTIL_NAME;
use gpuscope_core::{Metric, MetricsByCounter, Result};
use gpuscope_device::process::{self, GpuProcessInfo};
use std::collections::HashMap;
use std::path::Path;

/// Field-name prefixes whose samples are meaningful per process.
const PROCESS_RELEVANT_PREFIXES: &[&str] = &[
    "DCGM_FI_DEV_GPU_UTIL",
    "DCGM_FI_DEV_MEM_COPY_UTIL",
    "DCGM_FI_DEV_ENC_UTIL",
    "DCGM_FI_DEV_DEC_UTIL",
    "DCGM_FI_DEV_FB_FREE",
    "DCGM_FI_DEV_FB_USED",
    "DCGM_FI_DEV_FB_RESERVED",
    "DCGM_FI_PROF_GR_ENGINE_ACTIVE",
    "DCGM_FI_PROF_SM_ACTIVE",
    "DCGM_FI_PROF_SM_OCCUPANCY",
    "DCGM_FI_PROF_PIPE_TENSOR_ACTIVE",
    "DCGM_FI_PROF_DRAM_ACTIVE",
];

fn is_process_relevant(field_name: &str) -> bool {
    PROCESS_RELEVANT_PREFIXES.iter().any(|p| field_name.starts_with(p))
}

fn basename(command: &str) -> String {
    Path::new(command)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| command.to_string())
}

/// Process-mapper transformation stage.
#[derive(Debug, Default)]
pub struct ProcessMapper;

impl ProcessMapper {
    pub fn new() -> Self {
        Self
    }

    /// The UUID used to look up processes for a sample: an explicit
    /// `DCGM_FI_DEV_UUID` label or attribute wins over the entity's
    /// physical UUID.
    fn search_uuid(metric: &Metric) -> &str {
        if let Some(v) = metric.labels.get("DCGM_FI_DEV_UUID") {
            if !v.is_empty() {
                return v;
            }
        }
        if let Some(v) = metric.attributes.get("DCGM_FI_DEV_UUID") {
            if !v.is_empty() {
                return v;
            }
        }
        &metric.gpu_uuid
    }

    fn with_process(metric: &Metric, proc_info: &GpuProcessInfo) -> Metric {
        let mut copy = metric.clone();
        copy.attributes.insert("pid".to_string(), proc_info.pid.to_string());
        copy.attributes.insert("command".to_string(), proc_info.command.clone());
        copy.attributes.insert("process_name".to_string(), basename(&proc_info.command));
        copy.attributes.insert("type".to_string(), proc_info.kind.clone());
        copy
    }
}

impl Transform for ProcessMapper {
    fn name(&self) -> &str {
        "process-mapper"
    }

    fn process(&self, metrics: &mut MetricsByCounter) -> Result<()> {
        let Ok(source) = process::client() else {
            return Ok(());
        };
        let Ok(processes) = source.gpu_processes() else {
            return Ok(());
        };
        if processes.is_empty() {
            return Ok(());
        }

        // Index processes by instance UUID and by parent UUID, so physical
        // metrics also match processes on MIG instances.
        let mut by_uuid: HashMap<&str, Vec<&GpuProcessInfo>> = HashMap::new();
        for p in &processes {
            if !p.uuid.is_empty() {
                by_uuid.entry(p.uuid.as_str()).or_default().push(p);
            }
            if !p.parent_uuid.is_empty() && p.parent_uuid != p.uuid {
                by_uuid.entry(p.parent_uuid.as_str()).or_default().push(p);
            }
        }

        for (counter, samples) in metrics.iter_mut() {
            if counter.field_name == WEIGHTED_GPU_UTIL_NAME {
                continue;
            }
            if !is_process_relevant(&counter.field_name) {
                continue;
            }

            let mut expanded = Vec::with_capacity(samples.len());
            for metric in samples.iter() {
                match by_uuid.get(Self::search_uuid(metric)) {
                    Some(procs) if !procs.is_empty() => {
                        for p in procs {
                            expanded.push(Self::with_process(metric, p));
                        }
                    }
                    _ => expanded.push(metric.clone()),
                }
            }
            *samples = expanded;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpuscope_core::counters::PromType;
    use gpuscope_core::Counter;
    use gpuscope_device::process::{set_client, SimProcessSource};
    use std::sync::{Arc, Mutex, MutexGuard};

    static SIM_LOCK: Mutex<()> = Mutex::new(());

    fn lock() -> MutexGuard<'static, ()> {
        SIM_LOCK.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn counter(name: &str) -> Counter {
        Counter {
            field_id: 203,
            field_name: name.to_string(),
            prom_type: PromType::Gauge,
            help: String::new(),
        }
    }

    fn metric(c: &Counter, uuid: &str) -> Metric {
        Metric {
            counter: c.clone(),
            value: "42".to_string(),
            gpu: "0".to_string(),
            gpu_uuid: uuid.to_string(),
            gpu_device: "nvidia0".to_string(),
            gpu_model: String::new(),
            gpu_pci_bus_id: String::new(),
            hostname: String::new(),
            mig_profile: String::new(),
            gpu_instance_id: String::new(),
            labels: HashMap::new(),
            attributes: HashMap::new(),
        }
    }

    fn proc_info(pid: u32, uuid: &str, command: &str) -> GpuProcessInfo {
        GpuProcessInfo {
            device_index: 0,
            pid,
            kind: "C".to_string(),
            command: command.to_string(),
            memory_mb: 512,
            uuid: uuid.to_string(),
            parent_uuid: uuid.to_string(),
        }
    }

    #[test]
    fn test_duplicates_samples_per_process() {
        let _guard = lock();
        let source = Arc::new(SimProcessSource::new());
        source.set_processes(vec![
            proc_info(100, "GPU-a", "/usr/bin/python3"),
            proc_info(200, "GPU-a", "/opt/train/run"),
        ]);
        set_client(source);

        let c = counter("DCGM_FI_DEV_GPU_UTIL");
        let mut metrics = MetricsByCounter::new();
        metrics.insert(c.clone(), vec![metric(&c, "GPU-a")]);

        ProcessMapper::new().process(&mut metrics).unwrap();

        let samples = &metrics[&c];
        assert_eq!(samples.len(), 2);
        let pids: Vec<&str> =
            samples.iter().map(|m| m.attributes["pid"].as_str()).collect();
        assert!(pids.contains(&"100"));
        assert!(pids.contains(&"200"));
        assert_eq!(samples[0].attributes["process_name"], "python3");
        assert_eq!(samples[0].attributes["command"], "/usr/bin/python3");
        assert_eq!(samples[0].attributes["type"], "C");
    }

    #[test]
    fn test_keeps_sample_when_no_process_found() {
        let _guard = lock();
        let source = Arc::new(SimProcessSource::new());
        source.set_processes(vec![proc_info(100, "GPU-other", "/bin/x")]);
        set_client(source);

        let c = counter("DCGM_FI_DEV_GPU_UTIL");
        let mut metrics = MetricsByCounter::new();
        metrics.insert(c.clone(), vec![metric(&c, "GPU-a")]);

        ProcessMapper::new().process(&mut metrics).unwrap();
        let samples = &metrics[&c];
        assert_eq!(samples.len(), 1);
        assert!(!samples[0].attributes.contains_key("pid"));
    }

    #[test]
    fn test_skips_irrelevant_and_synthetic_counters() {
        let _guard = lock();
        let source = Arc::new(SimProcessSource::new());
        source.set_processes(vec![proc_info(100, "GPU-a", "/bin/x")]);
        set_client(source);

        let temp = counter("DCGM_FI_DEV_GPU_TEMP");
        let weighted = counter(WEIGHTED_GPU_UTIL_NAME);
        let mut metrics = MetricsByCounter::new();
        metrics.insert(temp.clone(), vec![metric(&temp, "GPU-a")]);
        metrics.insert(weighted.clone(), vec![metric(&weighted, "GPU-a")]);

        ProcessMapper::new().process(&mut metrics).unwrap();
        assert!(!metrics[&temp][0].attributes.contains_key("pid"));
        assert!(!metrics[&weighted][0].attributes.contains_key("pid"));
    }

    #[test]
    fn test_prefers_explicit_uuid_label() {
        let _guard = lock();
        let source = Arc::new(SimProcessSource::new());
        source.set_processes(vec![proc_info(100, "MIG-instance-uuid", "/bin/x")]);
        set_client(source);

        let c = counter("DCGM_FI_PROF_SM_ACTIVE");
        let mut m = metric(&c, "GPU-physical");
        m.labels.insert("DCGM_FI_DEV_UUID".to_string(), "MIG-instance-uuid".to_string());
        let mut metrics = MetricsByCounter::new();
        metrics.insert(c.clone(), vec![m]);

        ProcessMapper::new().process(&mut metrics).unwrap();
        assert_eq!(metrics[&c][0].attributes["pid"], "100");
    }
}
