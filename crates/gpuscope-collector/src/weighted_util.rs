//! Weighted GPU utilization stage
//!
//! Synthesizes a derived gauge in `[0, 1]` from the raw utilization counter
//! (non-MIG GPUs) and from per-instance profiling activity (MIG GPUs). MIG
//! contributions are weighted by the instance's share of the GPU's compute
//! slices.

use crate::Transform;
use gpuscope_core::counters::PromType;
use gpuscope_core::fields::{
    DCGM_EXP_WEIGHTED_GPU_UTIL, DCGM_FI_DEV_GPU_UTIL, DCGM_FI_DEV_MIG_MAX_SLICES,
    DCGM_FI_PROF_GR_ENGINE_ACTIVE, WEIGHTED_GPU_UTIL_NAME,
};
use gpuscope_core::{Counter, Metric, MetricsByCounter, Result};
use std::collections::HashMap;
use tracing::debug;

const DEFAULT_MAX_SLICES: f64 = 7.0;
const H_SERIES_MODELS: &[&str] = &["H100", "H200", "H800", "H20"];

/// The synthesized counter identity.
pub fn weighted_counter() -> Counter {
    Counter {
        field_id: DCGM_EXP_WEIGHTED_GPU_UTIL,
        field_name: WEIGHTED_GPU_UTIL_NAME.to_string(),
        prom_type: PromType::Gauge,
        help: "Weighted GPU utilization".to_string(),
    }
}

fn is_h_series(model: &str) -> bool {
    H_SERIES_MODELS.iter().any(|m| model.contains(m))
}

/// Weighted-utilization transformation stage.
#[derive(Debug, Default)]
pub struct WeightedUtil;

impl WeightedUtil {
    pub fn new() -> Self {
        Self
    }

    fn find_metrics<'a>(metrics: &'a MetricsByCounter, field_id: u16) -> Option<&'a [Metric]> {
        metrics
            .iter()
            .find(|(c, _)| c.field_id == field_id)
            .map(|(_, m)| m.as_slice())
    }

    fn emit(&self, template: &Metric, value: String, method: &str) -> Metric {
        let mut metric = template.clone();
        metric.counter = weighted_counter();
        metric.value = value;
        metric.labels.insert("calculation_method".to_string(), method.to_string());
        // The derived metric always identifies the physical GPU.
        metric
            .labels
            .insert("DCGM_FI_DEV_UUID".to_string(), metric.gpu_uuid.clone());
        metric
    }

    fn compute_non_mig(&self, metrics: &MetricsByCounter) -> Vec<Metric> {
        let Some(src) = Self::find_metrics(metrics, DCGM_FI_DEV_GPU_UTIL) else {
            return Vec::new();
        };

        // Graphics-engine activity for whole GPUs, keyed by GPU index. Used
        // for the H-series pass-through.
        let mut engine_active: HashMap<&str, f64> = HashMap::new();
        if let Some(prof) = Self::find_metrics(metrics, DCGM_FI_PROF_GR_ENGINE_ACTIVE) {
            for m in prof.iter().filter(|m| m.gpu_instance_id.is_empty()) {
                if let Ok(v) = m.value.parse::<f64>() {
                    engine_active.insert(m.gpu.as_str(), v);
                }
            }
        }

        let mut out = Vec::with_capacity(src.len());
        for m in src {
            let Ok(raw) = m.value.parse::<f64>() else {
                continue;
            };

            if is_h_series(&m.gpu_model) {
                if let Some(&active) = engine_active.get(m.gpu.as_str()) {
                    out.push(self.emit(m, format!("{}", active), "prof_gr_engine_active"));
                    continue;
                }
            }

            let weighted = raw.min(100.0) / 100.0;
            out.push(self.emit(m, format!("{}", weighted), "direct"));
        }
        out
    }

    fn compute_mig(&self, metrics: &MetricsByCounter) -> Vec<Metric> {
        let Some(prof) = Self::find_metrics(metrics, DCGM_FI_PROF_GR_ENGINE_ACTIVE) else {
            return Vec::new();
        };
        let src: Vec<&Metric> = prof.iter().filter(|m| !m.gpu_instance_id.is_empty()).collect();
        if src.is_empty() {
            return Vec::new();
        }

        // Max slice count and a physical-label template per GPU index.
        let mut max_slices: HashMap<String, f64> = HashMap::new();
        let mut templates: HashMap<String, &Metric> = HashMap::new();
        if let Some(slice_metrics) = Self::find_metrics(metrics, DCGM_FI_DEV_MIG_MAX_SLICES) {
            for m in slice_metrics {
                if let Ok(v) = m.value.parse::<f64>() {
                    max_slices.insert(m.gpu.clone(), v);
                    templates.insert(m.gpu.clone(), m);
                }
            }
        }

        let mut weighted_sum: HashMap<String, f64> = HashMap::new();
        for m in &src {
            let Ok(active) = m.value.parse::<f64>() else {
                continue;
            };
            let slices = slices_from_profile(&m.mig_profile);
            if slices == 0.0 {
                continue;
            }

            let max = match max_slices.get(&m.gpu) {
                Some(&v) => v,
                None => {
                    debug!(gpu = %m.gpu, default = DEFAULT_MAX_SLICES,
                        "MIG max slices not reported, using default");
                    DEFAULT_MAX_SLICES
                }
            };
            if max == 0.0 {
                continue;
            }

            *weighted_sum.entry(m.gpu.clone()).or_insert(0.0) += active * (slices / max);
        }

        let mut out = Vec::with_capacity(weighted_sum.len());
        for (gpu, sum) in weighted_sum {
            let template = templates.get(&gpu).copied().or_else(|| {
                src.iter().find(|m| m.gpu == gpu).copied()
            });
            let Some(template) = template else {
                continue;
            };

            let mut metric = self.emit(template, format!("{}", sum), "weighted_sum");
            // One sample per physical GPU: clear instance identity.
            metric.mig_profile.clear();
            metric.gpu_instance_id.clear();
            out.push(metric);
        }
        out
    }
}

/// Leading compute-slice count of a MIG profile string (`"2g.10gb"` -> 2).
fn slices_from_profile(profile: &str) -> f64 {
    for (prefix, slices) in
        [("1g.", 1.0), ("2g.", 2.0), ("3g.", 3.0), ("4g.", 4.0), ("7g.", 7.0)]
    {
        if profile.starts_with(prefix) {
            return slices;
        }
    }
    // Generic parse: "Ng.Mgb"
    if let Some((head, _)) = profile.split_once("g.") {
        if let Ok(v) = head.parse::<f64>() {
            return v;
        }
    }
    0.0
}

impl Transform for WeightedUtil {
    fn name(&self) -> &str {
        "weighted-util"
    }

    fn process(&self, metrics: &mut MetricsByCounter) -> Result<()> {
        let mut derived = self.compute_non_mig(metrics);
        derived.extend(self.compute_mig(metrics));

        if !derived.is_empty() {
            metrics.insert(weighted_counter(), derived);
        }
        Ok(())
    }
}
