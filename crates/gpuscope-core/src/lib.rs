//! # gpuscope-core
//!
//! Core types and utilities for gpuscope - a node-local GPU telemetry exporter.
//!
//! This crate provides the foundational data structures and interfaces that are
//! shared across all other gpuscope components. It includes:
//!
//! - The counter model and the counters-file parser
//! - Field metadata for the device management library
//! - Metric, value, and entity data structures
//! - Application configuration and the device selector DSL
//! - Error handling types and utilities
//! - The XID error text table

pub mod config;
pub mod counters;
pub mod error;
pub mod fields;
pub mod metrics;
pub mod xid;

// Re-export commonly used types at the crate root
pub use config::{AppConfig, DeviceOptions, DumpConfig, MetricGroup};
pub use counters::{Counter, CounterSet, PromType};
pub use error::{Error, Result};
pub use metrics::{
    Entity, EntityGroup, FieldSample, FieldValue, GpuIdKind, Metric, MetricsByCounter,
    MetricsByCounterGroup,
};
