//! Text exposition rendering
//!
//! Serializes one gather into the Prometheus text format. For every counter
//! the label set is the union of the keys present on any of its samples, so
//! all samples of one counter expose an identical label set.

use gpuscope_core::{Metric, MetricsByCounter, MetricsByCounterGroup};
use std::collections::BTreeSet;
use std::fmt::Write;

/// Render a full gather, groups merged, counters sorted by name.
pub fn render(gather: &MetricsByCounterGroup) -> String {
    let mut merged = MetricsByCounter::new();
    for by_counter in gather.values() {
        for (counter, samples) in by_counter {
            merged.entry(counter.clone()).or_default().extend(samples.iter().cloned());
        }
    }
    render_counters(&merged)
}

/// Render one entity group's counters.
pub fn render_counters(metrics: &MetricsByCounter) -> String {
    let mut counters: Vec<_> = metrics.keys().collect();
    counters.sort_by(|a, b| a.field_name.cmp(&b.field_name));

    let mut out = String::new();
    for counter in counters {
        let samples = &metrics[counter];
        if samples.is_empty() {
            continue;
        }

        let _ = writeln!(out, "# HELP {} {}", counter.field_name, counter.help);
        let _ = writeln!(out, "# TYPE {} {}", counter.field_name, counter.prom_type);

        // Exposition requires a constant label set per counter.
        let extra_keys = union_keys(samples);
        let has_mig = samples.iter().any(|m| !m.mig_profile.is_empty());

        for metric in samples {
            let mut labels = Vec::new();
            labels.push(("gpu", metric.gpu.clone()));
            labels.push(("UUID", metric.gpu_uuid.clone()));
            labels.push(("pci_bus_id", metric.gpu_pci_bus_id.clone()));
            labels.push(("device", metric.gpu_device.clone()));
            labels.push(("modelName", metric.gpu_model.clone()));
            if has_mig {
                labels.push(("GPU_I_PROFILE", metric.mig_profile.clone()));
                labels.push(("GPU_I_ID", metric.gpu_instance_id.clone()));
            }
            if !metric.hostname.is_empty() {
                labels.push(("Hostname", metric.hostname.clone()));
            }
            for key in &extra_keys {
                let value = metric
                    .labels
                    .get(key.as_str())
                    .or_else(|| metric.attributes.get(key.as_str()))
                    .cloned()
                    .unwrap_or_default();
                labels.push((key.as_str(), value));
            }

            let rendered: Vec<String> = labels
                .iter()
                .map(|(k, v)| format!("{}=\"{}\"", k, escape_label_value(v)))
                .collect();
            let _ = writeln!(
                out,
                "{}{{{}}} {}",
                counter.field_name,
                rendered.join(","),
                metric.value
            );
        }
    }
    out
}

fn union_keys(samples: &[Metric]) -> BTreeSet<String> {
    let mut keys = BTreeSet::new();
    for metric in samples {
        keys.extend(metric.labels.keys().cloned());
        keys.extend(metric.attributes.keys().cloned());
    }
    keys
}

fn escape_label_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', "\\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpuscope_core::counters::PromType;
    use gpuscope_core::Counter;
    use std::collections::HashMap;

    fn counter(name: &str, prom_type: PromType) -> Counter {
        Counter {
            field_id: 203,
            field_name: name.to_string(),
            prom_type,
            help: "help text".to_string(),
        }
    }

    fn metric(c: &Counter, gpu: &str, value: &str) -> Metric {
        Metric {
            counter: c.clone(),
            value: value.to_string(),
            gpu: gpu.to_string(),
            gpu_uuid: format!("GPU-{}", gpu),
            gpu_device: format!("nvidia{}", gpu),
            gpu_model: "NVIDIA A100".to_string(),
            gpu_pci_bus_id: "00000000:07:00.0".to_string(),
            hostname: "node-1".to_string(),
            mig_profile: String::new(),
            gpu_instance_id: String::new(),
            labels: HashMap::new(),
            attributes: HashMap::new(),
        }
    }

    #[test]
    fn test_renders_help_type_and_samples() {
        let c = counter("DCGM_FI_DEV_GPU_UTIL", PromType::Gauge);
        let mut metrics = MetricsByCounter::new();
        metrics.insert(c.clone(), vec![metric(&c, "0", "93")]);

        let text = render_counters(&metrics);
        assert!(text.contains("# HELP DCGM_FI_DEV_GPU_UTIL help text"));
        assert!(text.contains("# TYPE DCGM_FI_DEV_GPU_UTIL gauge"));
        assert!(text.contains("gpu=\"0\""));
        assert!(text.contains("UUID=\"GPU-0\""));
        assert!(text.contains("Hostname=\"node-1\""));
        assert!(text.trim_end().ends_with("} 93"));
    }

    #[test]
    fn test_label_set_is_constant_per_counter() {
        let c = counter("DCGM_FI_DEV_GPU_UTIL", PromType::Gauge);
        let mut first = metric(&c, "0", "1");
        first.attributes.insert("pod".to_string(), "gpu-pod-0".to_string());
        let second = metric(&c, "1", "2");

        let mut metrics = MetricsByCounter::new();
        metrics.insert(c.clone(), vec![first, second]);

        let text = render_counters(&metrics);
        // Both samples carry the pod key; the second as an empty value.
        assert_eq!(text.matches("pod=").count(), 2);
        assert!(text.contains("pod=\"gpu-pod-0\""));
        assert!(text.contains("pod=\"\""));
    }

    #[test]
    fn test_escapes_label_values() {
        let c = counter("DCGM_FI_DEV_GPU_UTIL", PromType::Gauge);
        let mut m = metric(&c, "0", "1");
        m.labels.insert("note".to_string(), "say \"hi\"\nback\\slash".to_string());

        let mut metrics = MetricsByCounter::new();
        metrics.insert(c.clone(), vec![m]);

        let text = render_counters(&metrics);
        assert!(text.contains("note=\"say \\\"hi\\\"\\nback\\\\slash\""));
    }

    #[test]
    fn test_counters_sorted_by_name() {
        let a = counter("DCGM_FI_DEV_GPU_TEMP", PromType::Gauge);
        let b = counter("DCGM_FI_DEV_GPU_UTIL", PromType::Gauge);
        let mut metrics = MetricsByCounter::new();
        metrics.insert(b.clone(), vec![metric(&b, "0", "1")]);
        metrics.insert(a.clone(), vec![metric(&a, "0", "2")]);

        let text = render_counters(&metrics);
        let temp_at = text.find("DCGM_FI_DEV_GPU_TEMP").unwrap();
        let util_at = text.find("DCGM_FI_DEV_GPU_UTIL").unwrap();
        assert!(temp_at < util_at);
    }
}
