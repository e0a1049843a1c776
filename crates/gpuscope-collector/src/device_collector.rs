//! Per-entity-type device collector
//!
//! One collector per entity kind. A scrape reads the latest value of every
//! watched field for every monitored entity, translates sentinel values to
//! skipped samples, harvests `label`-type counters into the per-entity label
//! snapshot, and applies field-specific attribute rules.

use crate::Collector;
use async_trait::async_trait;
use gpuscope_core::config::AppConfig;
use gpuscope_core::fields::DCGM_FI_DEV_XID_ERRORS;
use gpuscope_core::xid::xid_error_text;
use gpuscope_core::{Counter, EntityGroup, Error, FieldSample, Metric, MetricsByCounter, Result};
use gpuscope_device::facade;
use gpuscope_device::monitoring::{get_monitored_entities, MonitoringInfo};
use gpuscope_device::watchlist::{DeviceWatchList, WatchResources};
use std::collections::HashMap;
use std::sync::Mutex;

/// Collector over one entity kind's watch-list.
pub struct DeviceCollector {
    name: String,
    counters: Vec<Counter>,
    watch_list: DeviceWatchList,
    hostname: String,
    replace_blanks_in_model_name: bool,
    resources: Mutex<WatchResources>,
}

impl DeviceCollector {
    /// Create the collector and start the device-library watches for its
    /// watch-list.
    pub fn new(
        counters: Vec<Counter>,
        hostname: String,
        config: &AppConfig,
        watch_list: DeviceWatchList,
    ) -> Result<Self> {
        if watch_list.is_empty() {
            return Err(Error::config("device watch list is empty"));
        }

        let resources = watch_list.watch()?;
        let name = format!("{}-collector", watch_list.inventory().info_type()).to_lowercase();

        Ok(Self {
            name,
            counters,
            watch_list,
            hostname,
            replace_blanks_in_model_name: config.replace_blanks_in_model_name,
            resources: Mutex::new(resources),
        })
    }

    fn collect(&self) -> Result<MetricsByCounter> {
        let client = facade::client()?;
        let inventory = self.watch_list.inventory();
        let mut metrics = MetricsByCounter::new();

        for mi in get_monitored_entities(inventory) {
            let samples = if mi.entity.group == EntityGroup::Link {
                let parent_group = if mi.device.is_some() {
                    EntityGroup::Gpu
                } else {
                    EntityGroup::Switch
                };
                client.link_latest(
                    mi.entity.id,
                    gpuscope_core::Entity::new(parent_group, mi.parent_id.unwrap_or(0)),
                    self.watch_list.device_fields(),
                )?
            } else {
                client.entity_latest(mi.entity, self.watch_list.device_fields())?
            };

            match inventory.info_type() {
                EntityGroup::Switch | EntityGroup::Link => {
                    self.to_switch_metrics(&mut metrics, &samples, &mi);
                }
                EntityGroup::Cpu | EntityGroup::CpuCore => {
                    self.to_cpu_metrics(&mut metrics, &samples, &mi);
                }
                _ => self.to_gpu_metrics(&mut metrics, &samples, &mi),
            }
        }

        Ok(metrics)
    }

    /// Split samples into the label snapshot and the value samples.
    fn split_labels(&self, samples: &[FieldSample]) -> (HashMap<String, String>, Vec<(Counter, String)>) {
        let mut labels = HashMap::new();
        let mut values = Vec::new();

        for sample in samples {
            // Sentinel values are skipped, never emitted as zero.
            let Some(value) = sample.display_value() else {
                continue;
            };
            let Some(counter) = self.find_counter(sample.field_id) else {
                continue;
            };
            if counter.is_label() {
                labels.insert(counter.field_name.clone(), value);
            } else {
                values.push((counter.clone(), value));
            }
        }

        (labels, values)
    }

    fn to_gpu_metrics(
        &self,
        metrics: &mut MetricsByCounter,
        samples: &[FieldSample],
        mi: &MonitoringInfo,
    ) {
        let Some(device) = &mi.device else {
            return;
        };
        let (labels, values) = self.split_labels(samples);
        let model = self.gpu_model(&device.model);

        for (counter, value) in values {
            let mut attributes = HashMap::new();
            if counter.field_id == DCGM_FI_DEV_XID_ERRORS {
                if let Ok(code) = value.parse::<i64>() {
                    attributes.insert("err_code".to_string(), code.to_string());
                    attributes.insert("err_msg".to_string(), xid_error_text(code).to_string());
                }
            }

            let mut metric = Metric {
                counter,
                value,
                gpu: device.index.to_string(),
                gpu_uuid: device.uuid.clone(),
                gpu_device: format!("nvidia{}", device.index),
                gpu_model: model.clone(),
                gpu_pci_bus_id: device.pci_bus_id.clone(),
                hostname: self.hostname.clone(),
                mig_profile: String::new(),
                gpu_instance_id: String::new(),
                labels: labels.clone(),
                attributes,
            };
            if let Some(instance) = &mi.instance {
                metric.mig_profile = instance.profile.clone();
                metric.gpu_instance_id = instance.gpu_instance_id.to_string();
            }

            metrics.entry(metric.counter.clone()).or_default().push(metric);
        }
    }

    fn to_switch_metrics(
        &self,
        metrics: &mut MetricsByCounter,
        samples: &[FieldSample],
        mi: &MonitoringInfo,
    ) {
        let (labels, values) = self.split_labels(samples);
        let device = match mi.parent_id {
            Some(parent) => format!("nvswitch{}", parent),
            None => format!("nvswitch{}", mi.entity.id),
        };

        for (counter, value) in values {
            let metric = Metric {
                counter,
                value,
                gpu: mi.entity.id.to_string(),
                gpu_uuid: String::new(),
                gpu_device: device.clone(),
                gpu_model: String::new(),
                gpu_pci_bus_id: String::new(),
                hostname: self.hostname.clone(),
                mig_profile: String::new(),
                gpu_instance_id: String::new(),
                labels: labels.clone(),
                attributes: HashMap::new(),
            };
            metrics.entry(metric.counter.clone()).or_default().push(metric);
        }
    }

    fn to_cpu_metrics(
        &self,
        metrics: &mut MetricsByCounter,
        samples: &[FieldSample],
        mi: &MonitoringInfo,
    ) {
        let (labels, values) = self.split_labels(samples);
        let device = match mi.parent_id {
            Some(parent) => parent.to_string(),
            None => mi.entity.id.to_string(),
        };

        for (counter, value) in values {
            let metric = Metric {
                counter,
                value,
                gpu: mi.entity.id.to_string(),
                gpu_uuid: String::new(),
                gpu_device: device.clone(),
                gpu_model: String::new(),
                gpu_pci_bus_id: String::new(),
                hostname: self.hostname.clone(),
                mig_profile: String::new(),
                gpu_instance_id: String::new(),
                labels: labels.clone(),
                attributes: HashMap::new(),
            };
            metrics.entry(metric.counter.clone()).or_default().push(metric);
        }
    }

    fn gpu_model(&self, model: &str) -> String {
        if !self.replace_blanks_in_model_name {
            return model.to_string();
        }
        // Collapse whitespace runs, then make the identifier space-free.
        let parts: Vec<&str> = model.split_whitespace().collect();
        parts.join(" ").replace(' ', "-")
    }

    fn find_counter(&self, field_id: u16) -> Option<&Counter> {
        self.counters.iter().find(|c| c.field_id == field_id)
    }
}

#[async_trait]
impl Collector for DeviceCollector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn metrics(&self) -> Result<MetricsByCounter> {
        self.collect()
    }

    fn cleanup(&self) {
        self.resources.lock().unwrap_or_else(|e| e.into_inner()).cleanup();
    }
}
