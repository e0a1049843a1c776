//! # gpuscope-device
//!
//! Device library facade, inventory, and watch-list management for gpuscope.
//!
//! This crate provides:
//! - A uniform capability surface over the GPU management library
//! - An in-memory simulated fabric for fake-GPU mode and tests
//! - Entity enumeration with selector application (device inventory)
//! - Watch-list construction and strictly ordered resource cleanup
//! - A GPU process source for process-to-pod correlation
//!
//! The device library client and the process source are process-wide
//! singletons with a published lifecycle (`initialize` -> `cleanup`); tests
//! substitute in-memory fakes through the same initializer.

pub mod facade;
pub mod inventory;
pub mod monitoring;
pub mod process;
pub mod sim;
pub mod watchlist;

pub use facade::{
    CpuInfo, DeviceLib, FieldGroupHandle, GpuDeviceInfo, GpuInstanceInfo, GroupHandle, LinkInfo,
    SwitchInfo,
};
pub use inventory::DeviceInventory;
pub use monitoring::{get_monitored_entities, MonitoringInfo};
pub use process::{GpuProcessInfo, MigDeviceInfo, ProcessLib};
pub use sim::SimulatedFabric;
pub use watchlist::{DeviceWatchList, WatchListManager, WatchResources};
