//! # gpuscope-kube
//!
//! Kubernetes workload identity resolution for gpuscope.
//!
//! This crate joins GPU samples to the pods, containers, and processes that
//! own them. It provides:
//! - A kubelet pod-resources gRPC client over the unix socket
//! - A node-scoped pod metadata cache (informer)
//! - A label allow-list with an LRU decision cache
//! - `/proc/<pid>/cgroup` pod-UID extraction
//! - A DRA resource-slice manager
//! - The pod-mapper and DRA-mapper transformation stages

pub mod cgroup;
pub mod dra;
pub mod informer;
pub mod labels;
pub mod pod_mapper;
pub mod podresources;

pub use dra::{MigInfo, ResourceSliceManager};
pub use informer::PodStore;
pub use labels::{sanitize_label_name, LabelFilter};
pub use pod_mapper::{DraMapper, PodIdentityResolver, PodInfo, PodMapper};
pub use podresources::PodResourcesClient;
