//! # gpuscope-collector
//!
//! Collectors, registry, and metric transformation stages for gpuscope.
//!
//! This crate provides:
//! - The collector capability set (`Name`, `GetMetrics`, `Cleanup`)
//! - The per-entity-type device collector
//! - The registry with concurrent gather and drain-aware teardown
//! - The text exposition renderer
//! - The weighted-utilization and process-mapper transformation stages

use async_trait::async_trait;
use gpuscope_core::{MetricsByCounter, Result};

pub mod device_collector;
pub mod exposition;
pub mod process_mapper;
pub mod registry;
pub mod weighted_util;

pub use device_collector::DeviceCollector;
pub use process_mapper::ProcessMapper;
pub use registry::Registry;
pub use weighted_util::WeightedUtil;

/// Explicit capability set of a collector.
///
/// Collectors are registered per entity group; one scrape calls every
/// registered collector concurrently.
#[async_trait]
pub trait Collector: Send + Sync {
    fn name(&self) -> &str;

    /// Produce the current metrics. May suspend on the device library's
    /// internal RPC.
    async fn metrics(&self) -> Result<MetricsByCounter>;

    /// Release collector-owned device-library resources.
    fn cleanup(&self);
}

/// One stage of the transformation pipeline.
///
/// Stages run in fixed order; each reads and rewrites the scrape result in
/// place.
pub trait Transform: Send + Sync {
    fn name(&self) -> &str;
    fn process(&self, metrics: &mut MetricsByCounter) -> Result<()>;
}
