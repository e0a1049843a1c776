//! Pod identity resolution and the pod-mapper / DRA-mapper stages
//!
//! The resolver joins kubelet device assignments to pod identity through two
//! independent pipelines: the pod-resources API (refreshed every 30 seconds)
//! and the per-process cgroup tables, which correct stale kubelet
//! assignments. Device references arrive in four shapes and are tried in a
//! fixed order: MIG UUID prefix, GKE MIG pattern, virtual-GPU separator
//! split, raw device id. Every matched granularity is inserted so later
//! stages can join at either level.

use crate::cgroup;
use crate::dra::ResourceSliceManager;
use crate::informer::PodStore;
use crate::labels::{sanitize_label_name, LabelFilter};
use crate::podresources::{ListPodResourcesResponse, PodResourcesClient};
use gpuscope_collector::Transform;
use gpuscope_core::config::{
    AppConfig, DRA_GPU_DRIVER_NAME, MIG_UUID_PREFIX, NVIDIA_MIG_RESOURCE_PREFIX,
    NVIDIA_RESOURCE_NAME,
};
use gpuscope_core::{MetricsByCounter, Result};
use gpuscope_device::inventory::DeviceInventory;
use gpuscope_device::process;
use kube::Client;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const POD_ATTRIBUTE: &str = "pod";
pub const NAMESPACE_ATTRIBUTE: &str = "namespace";
pub const CONTAINER_ATTRIBUTE: &str = "container";
pub const UID_ATTRIBUTE: &str = "uid";
pub const VGPU_ATTRIBUTE: &str = "vgpu";

const REFRESH_INTERVAL: Duration = Duration::from_secs(30);
const INFORMER_SYNC_TIMEOUT: Duration = Duration::from_secs(30);

/// Allow for MIG devices with or without GPU sharing, as reported by the
/// GKE device plugin.
static GKE_MIG_DEVICE_ID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^nvidia([0-9]+)/gi([0-9]+)(/vgpu[0-9]+)?$").expect("GKE MIG pattern is valid")
});

const GKE_VGPU_SEPARATOR: &str = "/vgpu";

/// DRA identity attached to a pod mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DynamicResourceInfo {
    pub claim_name: String,
    pub claim_namespace: String,
    pub driver_name: String,
    pub pool_name: String,
    pub device_name: String,
    pub mig_profile: String,
    pub mig_device_uuid: String,
}

/// Pod identity a device maps to.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PodInfo {
    pub name: String,
    pub namespace: String,
    pub container: String,
    pub uid: String,
    pub labels: HashMap<String, String>,
    pub vgpu: String,
    pub dynamic: Option<DynamicResourceInfo>,
}

#[derive(Debug, Default)]
struct ResolverMaps {
    device_to_pod: HashMap<String, PodInfo>,
    device_to_pods: HashMap<String, Vec<PodInfo>>,
    device_to_pods_dra: HashMap<String, Vec<PodInfo>>,
}

/// Resolves kubelet device assignments to pod identity.
pub struct PodIdentityResolver {
    config: AppConfig,
    label_filter: LabelFilter,
    pod_store: Option<PodStore>,
    slice_manager: Option<ResourceSliceManager>,
    kube_client: Option<Client>,
    inventory: RwLock<Option<Arc<DeviceInventory>>>,
    maps: RwLock<ResolverMaps>,
}

impl PodIdentityResolver {
    /// Build the resolver without cluster wiring. `connect_cluster` attaches
    /// the informer and the DRA slice manager.
    pub fn new(config: AppConfig) -> Self {
        info!("Kubernetes metrics collection enabled");
        let label_filter = LabelFilter::new(
            &config.kubernetes_pod_label_allowlist,
            config.kubernetes_pod_label_cache_size,
        );
        let slice_manager =
            config.kubernetes_enable_dra.then(ResourceSliceManager::new);

        Self {
            config,
            label_filter,
            pod_store: None,
            slice_manager,
            kube_client: None,
            inventory: RwLock::new(None),
            maps: RwLock::new(ResolverMaps::default()),
        }
    }

    /// Attach the Kubernetes API client and start the pod informer. Failures
    /// degrade gracefully: metrics still flow, pod labels and UIDs are just
    /// absent.
    pub async fn connect_cluster(&mut self) {
        let client = match Client::try_default().await {
            Ok(client) => client,
            Err(e) => {
                warn!(error = %e,
                    "failed to get in-cluster config, pod labels will not be available");
                return;
            }
        };

        let node_name = std::env::var("NODE_NAME").ok().filter(|s| !s.is_empty());
        match tokio::time::timeout(INFORMER_SYNC_TIMEOUT, PodStore::spawn(client.clone(), node_name))
            .await
        {
            Ok(Ok(store)) => self.pod_store = Some(store),
            Ok(Err(e)) => warn!(error = %e, "failed to start pod informer"),
            Err(_) => warn!("pod informer cache did not sync in time"),
        }

        self.kube_client = Some(client);
    }

    /// The inventory used to resolve MIG parents to GPU indexes. Replaced on
    /// every reload.
    pub fn set_inventory(&self, inventory: Arc<DeviceInventory>) {
        *self.inventory.write().unwrap_or_else(|e| e.into_inner()) = Some(inventory);
    }

    /// Start the refresh loop: one immediate update, then every 30 seconds
    /// until cancelled.
    pub fn spawn_refresh(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let resolver = self;
        tokio::spawn(async move {
            if let Err(e) = resolver.update_cache().await {
                warn!(error = %e, "failed to update pod mapper cache");
            }
            let mut ticker = tokio::time::interval(REFRESH_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        if let Err(e) = resolver.update_cache().await {
                            warn!(error = %e, "failed to update pod mapper cache");
                        }
                    }
                }
            }
        })
    }

    /// Refresh the device-to-pod maps from the pod-resources API. A missing
    /// kubelet socket is not an error; the node simply has no mappings.
    pub async fn update_cache(&self) -> Result<()> {
        let socket = &self.config.pod_resources_kubelet_socket;
        match std::fs::metadata(socket) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
            Ok(_) => {}
        }

        let mut client = PodResourcesClient::connect(socket.clone()).await?;
        let pods = client.list().await?;

        if let (Some(manager), Some(kube_client)) = (&self.slice_manager, &self.kube_client) {
            if let Err(e) = manager.refresh(kube_client).await {
                warn!(error = %e, "failed to refresh DRA resource slices");
            }
        }

        let mut maps = ResolverMaps::default();
        if self.config.kubernetes_virtual_gpus {
            maps.device_to_pods = self.to_device_to_sharing_pods(&pods);
        } else {
            maps.device_to_pod = self.to_device_to_pod(&pods);
        }
        if self.config.kubernetes_enable_dra {
            maps.device_to_pods_dra = self.to_device_to_pods_dra(&pods);
        }

        // Write lock held only for the swap; readers use the shared lock.
        *self.maps.write().unwrap_or_else(|e| e.into_inner()) = maps;
        Ok(())
    }

    fn is_gpu_resource(&self, resource_name: &str) -> bool {
        resource_name == NVIDIA_RESOURCE_NAME
            || self.config.nvidia_resource_names.iter().any(|n| n == resource_name)
            || resource_name.starts_with(NVIDIA_MIG_RESOURCE_PREFIX)
    }

    fn create_pod_info(
        &self,
        pod: &crate::podresources::PodResources,
        container: &crate::podresources::ContainerResources,
    ) -> PodInfo {
        let mut labels = HashMap::new();
        let mut uid = String::new();

        if let Some(store) = &self.pod_store {
            if let Some(meta) = store.get(&pod.namespace, &pod.name) {
                uid = meta.uid;
                if self.config.kubernetes_enable_pod_labels {
                    for (key, value) in meta.labels {
                        if !self.label_filter.should_include(&key) {
                            continue;
                        }
                        labels.insert(sanitize_label_name(&key), value);
                    }
                }
            }
        }

        PodInfo {
            name: pod.name.clone(),
            namespace: pod.namespace.clone(),
            container: container.name.clone(),
            uid,
            labels,
            vgpu: String::new(),
            dynamic: None,
        }
    }

    fn gpu_instance_identifier(&self, parent_uuid: &str, gpu_instance_id: u32) -> String {
        let inventory = self.inventory.read().unwrap_or_else(|e| e.into_inner());
        match inventory.as_ref() {
            Some(inv) => inv.gpu_instance_identifier(parent_uuid, gpu_instance_id),
            None => format!("{}-{}", parent_uuid, gpu_instance_id),
        }
    }

    /// The device-id keys one kubelet device reference maps to, most
    /// specific first. The raw id is always included last.
    fn device_keys(&self, device_id: &str) -> Vec<String> {
        let mut keys = Vec::new();

        if let Some(raw_uuid) = device_id.strip_prefix(MIG_UUID_PREFIX) {
            if let Ok(client) = process::client() {
                if let Ok(mig) = client.mig_device_info(device_id) {
                    if mig.gpu_instance_id >= 0 {
                        keys.push(self.gpu_instance_identifier(
                            &mig.parent_uuid,
                            mig.gpu_instance_id as u32,
                        ));
                    }
                }
            }
            keys.push(raw_uuid.to_string());
        } else if let Some(captures) = GKE_MIG_DEVICE_ID_RE.captures(device_id) {
            keys.push(format!("{}-{}", &captures[1], &captures[2]));
        } else if let Some((physical, _)) = device_id.split_once(GKE_VGPU_SEPARATOR) {
            keys.push(physical.to_string());
        } else if let Some((physical, _)) = device_id.split_once("::") {
            keys.push(physical.to_string());
        }

        keys.push(device_id.to_string());
        keys
    }

    /// The virtual-GPU fragment of a shared device id, if any.
    fn shared_gpu(device_id: &str) -> Option<String> {
        if let Some((_, fragment)) = device_id.split_once(GKE_VGPU_SEPARATOR) {
            return Some(fragment.to_string());
        }
        device_id.split_once("::").map(|(_, fragment)| fragment.to_string())
    }

    /// One pod per device: the plain mapping used when virtual GPUs are off.
    pub fn to_device_to_pod(&self, pods: &ListPodResourcesResponse) -> HashMap<String, PodInfo> {
        let mut map = HashMap::new();
        let mut uid_to_pod = HashMap::new();

        for pod in &pods.pod_resources {
            for container in &pod.containers {
                let pod_info = self.create_pod_info(pod, container);
                if !pod_info.uid.is_empty() {
                    uid_to_pod.insert(pod_info.uid.clone(), pod_info.clone());
                }

                for device in &container.devices {
                    if !self.is_gpu_resource(&device.resource_name) {
                        debug!(
                            resource = %device.resource_name,
                            pod = %pod.name,
                            "skipping non-NVIDIA resource"
                        );
                        continue;
                    }
                    for device_id in &device.device_ids {
                        for key in self.device_keys(device_id) {
                            map.insert(key, pod_info.clone());
                        }
                    }
                }
            }
        }

        self.apply_process_correction(&mut map, &uid_to_pod, &|pid| {
            cgroup::pod_uid_from_pid(pid).ok()
        });
        map
    }

    /// Re-assert device-to-pod edges from the processes actually running on
    /// each GPU. Fixes stale kubelet assignments; disagreements are logged.
    pub fn apply_process_correction(
        &self,
        map: &mut HashMap<String, PodInfo>,
        uid_to_pod: &HashMap<String, PodInfo>,
        pod_uid_of_pid: &dyn Fn(u64) -> Option<String>,
    ) {
        if uid_to_pod.is_empty() {
            return;
        }
        let Ok(client) = process::client() else {
            return;
        };
        let processes = match client.gpu_processes() {
            Ok(processes) => processes,
            Err(e) => {
                debug!(error = %e, "failed to get process info for mapping correction");
                return;
            }
        };

        for proc_info in processes {
            if proc_info.pid == 0 {
                continue;
            }
            let Some(pod_uid) = pod_uid_of_pid(u64::from(proc_info.pid)) else {
                continue;
            };
            let Some(pod_info) = uid_to_pod.get(&pod_uid) else {
                continue;
            };
            let device_id = &proc_info.uuid;

            if let Some(raw_uuid) = device_id.strip_prefix(MIG_UUID_PREFIX) {
                map.insert(device_id.clone(), pod_info.clone());

                if let Ok(mig) = client.mig_device_info(device_id) {
                    if mig.gpu_instance_id >= 0 {
                        let gi_identifier = self
                            .gpu_instance_identifier(&mig.parent_uuid, mig.gpu_instance_id as u32);
                        let stale = map.get(&gi_identifier).map_or(true, |e| e.uid != pod_info.uid);
                        if stale {
                            info!(
                                device_id = %device_id,
                                gi_identifier = %gi_identifier,
                                pod = %pod_info.name,
                                pid = proc_info.pid,
                                old_pod = map.get(&gi_identifier).map(|e| e.name.as_str()).unwrap_or(""),
                                "correcting MIG device mapping based on process"
                            );
                            map.insert(gi_identifier, pod_info.clone());
                        }
                    }
                }

                map.insert(raw_uuid.to_string(), pod_info.clone());
            } else {
                let stale = map.get(device_id).map_or(true, |e| e.uid != pod_info.uid);
                if stale {
                    info!(
                        device_id = %device_id,
                        pod = %pod_info.name,
                        pid = proc_info.pid,
                        old_pod = map.get(device_id).map(|e| e.name.as_str()).unwrap_or(""),
                        "correcting device mapping based on process"
                    );
                    map.insert(device_id.clone(), pod_info.clone());
                }
            }
        }
    }

    /// Many pods per device: the fan-out mapping for GPU sharing
    /// strategies (time-sharing, MPS).
    pub fn to_device_to_sharing_pods(
        &self,
        pods: &ListPodResourcesResponse,
    ) -> HashMap<String, Vec<PodInfo>> {
        let mut map: HashMap<String, Vec<PodInfo>> = HashMap::new();

        for pod in &pods.pod_resources {
            for container in &pod.containers {
                for device in &container.devices {
                    if !self.is_gpu_resource(&device.resource_name) {
                        continue;
                    }
                    for device_id in &device.device_ids {
                        let mut pod_info = self.create_pod_info(pod, container);
                        if let Some(vgpu) = Self::shared_gpu(device_id) {
                            pod_info.vgpu = vgpu;
                        }
                        for key in self.device_keys(device_id) {
                            map.entry(key).or_default().push(pod_info.clone());
                        }
                    }
                }
            }
        }

        map
    }

    /// DRA mapping: walk dynamic resources and resolve `(pool, device)`
    /// through the resource-slice manager. Deduplicated per
    /// `(device, pod/namespace/container)`.
    pub fn to_device_to_pods_dra(
        &self,
        pods: &ListPodResourcesResponse,
    ) -> HashMap<String, Vec<PodInfo>> {
        let mut map: HashMap<String, Vec<PodInfo>> = HashMap::new();
        let Some(manager) = &self.slice_manager else {
            return map;
        };
        let mut processed: HashSet<(String, String)> = HashSet::new();

        for pod in &pods.pod_resources {
            for container in &pod.containers {
                for dynamic in &container.dynamic_resources {
                    for claim in &dynamic.claim_resources {
                        if claim.driver_name != DRA_GPU_DRIVER_NAME {
                            continue;
                        }
                        let Some((uuid, mig)) =
                            manager.device_info(&claim.pool_name, &claim.device_name)
                        else {
                            continue;
                        };

                        let pod_key =
                            format!("{}/{}/{}", pod.name, pod.namespace, container.name);
                        if !processed.insert((uuid.clone(), pod_key)) {
                            continue;
                        }

                        let mut pod_info = self.create_pod_info(pod, container);
                        let mut dynamic_info = DynamicResourceInfo {
                            claim_name: dynamic.claim_name.clone(),
                            claim_namespace: dynamic.claim_namespace.clone(),
                            driver_name: claim.driver_name.clone(),
                            pool_name: claim.pool_name.clone(),
                            device_name: claim.device_name.clone(),
                            ..Default::default()
                        };
                        if let Some(mig) = mig {
                            dynamic_info.mig_profile = mig.profile;
                            dynamic_info.mig_device_uuid = mig.mig_device_uuid;
                        }
                        pod_info.dynamic = Some(dynamic_info);
                        map.entry(uuid).or_default().push(pod_info);
                    }
                }
            }
        }

        map
    }

    fn set_identity_attributes(&self, metric: &mut gpuscope_core::Metric, pod_info: &PodInfo) {
        metric.attributes.insert(POD_ATTRIBUTE.to_string(), pod_info.name.clone());
        metric.attributes.insert(NAMESPACE_ATTRIBUTE.to_string(), pod_info.namespace.clone());
        metric.attributes.insert(CONTAINER_ATTRIBUTE.to_string(), pod_info.container.clone());
        if self.config.kubernetes_enable_pod_uid {
            metric.attributes.insert(UID_ATTRIBUTE.to_string(), pod_info.uid.clone());
        }
    }
}

/// Pod-mapper transformation stage.
pub struct PodMapper {
    resolver: Arc<PodIdentityResolver>,
}

impl PodMapper {
    pub fn new(resolver: Arc<PodIdentityResolver>) -> Self {
        Self { resolver }
    }
}

impl Transform for PodMapper {
    fn name(&self) -> &str {
        "pod-mapper"
    }

    fn process(&self, metrics: &mut MetricsByCounter) -> Result<()> {
        let config = &self.resolver.config;
        let maps = self.resolver.maps.read().unwrap_or_else(|e| e.into_inner());

        if config.kubernetes_virtual_gpus {
            if maps.device_to_pods.is_empty() {
                return Ok(());
            }
            for samples in metrics.values_mut() {
                let mut expanded = Vec::new();
                for metric in samples.iter() {
                    let device_id = metric.id_of_type(config.kubernetes_gpu_id_type);
                    let Some(pod_infos) = maps.device_to_pods.get(&device_id) else {
                        continue;
                    };
                    for pod_info in pod_infos {
                        let mut clone = metric.clone();
                        self.resolver.set_identity_attributes(&mut clone, pod_info);
                        if !pod_info.vgpu.is_empty() {
                            clone
                                .attributes
                                .insert(VGPU_ATTRIBUTE.to_string(), pod_info.vgpu.clone());
                        }
                        expanded.push(clone);
                    }
                }
                if !expanded.is_empty() {
                    *samples = expanded;
                }
            }
            return Ok(());
        }

        if maps.device_to_pod.is_empty() {
            return Ok(());
        }
        for samples in metrics.values_mut() {
            for metric in samples.iter_mut() {
                let device_id = metric.id_of_type(config.kubernetes_gpu_id_type);
                if let Some(pod_info) = maps.device_to_pod.get(&device_id) {
                    self.resolver.set_identity_attributes(metric, pod_info);
                    metric.labels.extend(
                        pod_info.labels.iter().map(|(k, v)| (k.clone(), v.clone())),
                    );
                }
            }
        }
        Ok(())
    }
}

/// DRA-mapper transformation stage. Runs after the pod mapper.
pub struct DraMapper {
    resolver: Arc<PodIdentityResolver>,
}

impl DraMapper {
    pub fn new(resolver: Arc<PodIdentityResolver>) -> Self {
        Self { resolver }
    }
}

impl Transform for DraMapper {
    fn name(&self) -> &str {
        "dra-mapper"
    }

    fn process(&self, metrics: &mut MetricsByCounter) -> Result<()> {
        let config = &self.resolver.config;
        if !config.kubernetes_enable_dra {
            return Ok(());
        }
        let maps = self.resolver.maps.read().unwrap_or_else(|e| e.into_inner());
        if maps.device_to_pods_dra.is_empty() {
            return Ok(());
        }

        for samples in metrics.values_mut() {
            let mut expanded = Vec::new();
            for metric in samples.iter() {
                let device_id = metric.id_of_type(config.kubernetes_gpu_id_type);
                match maps.device_to_pods_dra.get(&device_id) {
                    Some(pod_infos) => {
                        for pod_info in pod_infos {
                            let mut clone = metric.clone();
                            self.resolver.set_identity_attributes(&mut clone, pod_info);
                            if let Some(dynamic) = &pod_info.dynamic {
                                let attrs = &mut clone.attributes;
                                attrs.insert("dra_claim_name".into(), dynamic.claim_name.clone());
                                attrs.insert(
                                    "dra_claim_namespace".into(),
                                    dynamic.claim_namespace.clone(),
                                );
                                attrs.insert("dra_driver_name".into(), dynamic.driver_name.clone());
                                attrs.insert("dra_pool_name".into(), dynamic.pool_name.clone());
                                attrs.insert("dra_device_name".into(), dynamic.device_name.clone());
                                if !dynamic.mig_device_uuid.is_empty() {
                                    attrs.insert(
                                        "dra_mig_profile".into(),
                                        dynamic.mig_profile.clone(),
                                    );
                                    attrs.insert(
                                        "dra_mig_device_uuid".into(),
                                        dynamic.mig_device_uuid.clone(),
                                    );
                                }
                            }
                            expanded.push(clone);
                        }
                    }
                    None => expanded.push(metric.clone()),
                }
            }
            if !expanded.is_empty() {
                *samples = expanded;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::podresources::{ContainerDevices, ContainerResources, PodResources};
    use gpuscope_core::counters::PromType;
    use gpuscope_core::{Counter, Metric};
    use gpuscope_device::process::{set_client, MigDeviceInfo, SimProcessSource};
    use std::sync::{Mutex, MutexGuard};

    static SIM_LOCK: Mutex<()> = Mutex::new(());

    fn lock() -> MutexGuard<'static, ()> {
        SIM_LOCK.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn response(device_ids: Vec<&str>) -> ListPodResourcesResponse {
        ListPodResourcesResponse {
            pod_resources: vec![PodResources {
                name: "gpu-pod-0".to_string(),
                namespace: "ns-a".to_string(),
                containers: vec![ContainerResources {
                    name: "c-a".to_string(),
                    devices: vec![ContainerDevices {
                        resource_name: NVIDIA_RESOURCE_NAME.to_string(),
                        device_ids: device_ids.into_iter().map(str::to_string).collect(),
                    }],
                    dynamic_resources: Vec::new(),
                }],
            }],
        }
    }

    fn resolver() -> PodIdentityResolver {
        let mut config = AppConfig::default();
        config.kubernetes = true;
        PodIdentityResolver::new(config)
    }

    fn empty_process_source() -> Arc<SimProcessSource> {
        let source = Arc::new(SimProcessSource::new());
        set_client(source.clone());
        source
    }

    fn metric_for(uuid: &str) -> Metric {
        Metric {
            counter: Counter {
                field_id: 203,
                field_name: "DCGM_FI_DEV_GPU_UTIL".to_string(),
                prom_type: PromType::Gauge,
                help: String::new(),
            },
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

    #[test]
    fn test_raw_device_id_maps_to_pod() {
        let _guard = lock();
        empty_process_source();
        let resolver = resolver();

        let map = resolver.to_device_to_pod(&response(vec!["GPU-abc"]));
        let pod = &map["GPU-abc"];
        assert_eq!(pod.name, "gpu-pod-0");
        assert_eq!(pod.namespace, "ns-a");
        assert_eq!(pod.container, "c-a");
    }

    #[test]
    fn test_mig_uuid_maps_at_both_granularities() {
        let _guard = lock();
        let source = empty_process_source();
        source.set_mig_device(
            "MIG-GPU-abc",
            MigDeviceInfo {
                parent_uuid: "GPU-abc".to_string(),
                gpu_instance_id: 3,
                compute_instance_id: 0,
            },
        );
        let resolver = resolver();

        let map = resolver.to_device_to_pod(&response(vec!["MIG-GPU-abc"]));
        // Raw UUID without the prefix, the GPU-instance identifier, and the
        // pod are all reachable.
        assert!(map.contains_key("GPU-abc"));
        assert!(map.contains_key("GPU-abc-3"));
        assert!(map.contains_key("MIG-GPU-abc"));
        assert_eq!(map["GPU-abc-3"].name, "gpu-pod-0");
    }

    #[test]
    fn test_gke_mig_pattern() {
        let _guard = lock();
        empty_process_source();
        let resolver = resolver();

        let map = resolver.to_device_to_pod(&response(vec!["nvidia0/gi3"]));
        assert!(map.contains_key("0-3"));
        assert!(map.contains_key("nvidia0/gi3"));

        let map = resolver.to_device_to_pod(&response(vec!["nvidia1/gi2/vgpu0"]));
        assert!(map.contains_key("1-2"));
    }

    #[test]
    fn test_separator_split_maps_physical_side() {
        let _guard = lock();
        empty_process_source();
        let resolver = resolver();

        let map = resolver.to_device_to_pod(&response(vec!["GPU-abc/vgpu7"]));
        assert!(map.contains_key("GPU-abc"));
        assert!(map.contains_key("GPU-abc/vgpu7"));

        let map = resolver.to_device_to_pod(&response(vec!["GPU-def::1"]));
        assert!(map.contains_key("GPU-def"));
        assert!(map.contains_key("GPU-def::1"));
    }

    #[test]
    fn test_non_gpu_resources_are_skipped() {
        let _guard = lock();
        empty_process_source();
        let resolver = resolver();

        let mut pods = response(vec!["some-device"]);
        pods.pod_resources[0].containers[0].devices[0].resource_name =
            "example.com/widget".to_string();
        let map = resolver.to_device_to_pod(&pods);
        assert!(map.is_empty());
    }

    #[test]
    fn test_sharing_pods_fan_out_with_vgpu() {
        let _guard = lock();
        empty_process_source();
        let resolver = resolver();

        let mut pods = response(vec!["GPU-abc::0"]);
        pods.pod_resources.push(PodResources {
            name: "gpu-pod-1".to_string(),
            namespace: "ns-a".to_string(),
            containers: vec![ContainerResources {
                name: "c-b".to_string(),
                devices: vec![ContainerDevices {
                    resource_name: NVIDIA_RESOURCE_NAME.to_string(),
                    device_ids: vec!["GPU-abc::1".to_string()],
                }],
                dynamic_resources: Vec::new(),
            }],
        });

        let map = resolver.to_device_to_sharing_pods(&pods);
        let sharers = &map["GPU-abc"];
        assert_eq!(sharers.len(), 2);
        let vgpus: Vec<&str> = sharers.iter().map(|p| p.vgpu.as_str()).collect();
        assert!(vgpus.contains(&"0"));
        assert!(vgpus.contains(&"1"));
    }

    #[test]
    fn test_process_correction_overrides_stale_kubelet_view() {
        let _guard = lock();
        let source = empty_process_source();
        source.set_processes(vec![gpuscope_device::process::GpuProcessInfo {
            device_index: 0,
            pid: 4242,
            kind: "C".to_string(),
            command: "/usr/bin/python3".to_string(),
            memory_mb: 1024,
            uuid: "GPU-x".to_string(),
            parent_uuid: "GPU-x".to_string(),
        }]);
        let resolver = resolver();

        let pod_a = PodInfo {
            name: "pod-a".to_string(),
            uid: "uid-a".to_string(),
            ..Default::default()
        };
        let pod_b = PodInfo {
            name: "pod-b".to_string(),
            uid: "uid-b".to_string(),
            ..Default::default()
        };

        // Kubelet claims GPU-x belongs to pod A.
        let mut map = HashMap::from([("GPU-x".to_string(), pod_a)]);
        let uid_to_pod = HashMap::from([("uid-b".to_string(), pod_b)]);

        // The live process on GPU-x resolves to pod B's UID.
        resolver.apply_process_correction(&mut map, &uid_to_pod, &|pid| {
            assert_eq!(pid, 4242);
            Some("uid-b".to_string())
        });

        assert_eq!(map["GPU-x"].name, "pod-b");
    }

    #[test]
    fn test_pod_mapper_sets_all_three_identity_attributes() {
        let _guard = lock();
        empty_process_source();
        let resolver = Arc::new(resolver());
        {
            let mut maps = resolver.maps.write().unwrap();
            maps.device_to_pod.insert(
                "GPU-abc".to_string(),
                PodInfo {
                    name: "gpu-pod-0".to_string(),
                    namespace: "ns-a".to_string(),
                    container: "c-a".to_string(),
                    ..Default::default()
                },
            );
        }

        let mapper = PodMapper::new(resolver);
        let metric = metric_for("GPU-abc");
        let counter = metric.counter.clone();
        let mut metrics = MetricsByCounter::new();
        metrics.insert(counter.clone(), vec![metric, metric_for("GPU-unmapped")]);

        mapper.process(&mut metrics).unwrap();

        let samples = &metrics[&counter];
        assert_eq!(samples[0].attributes[POD_ATTRIBUTE], "gpu-pod-0");
        assert_eq!(samples[0].attributes[NAMESPACE_ATTRIBUTE], "ns-a");
        assert_eq!(samples[0].attributes[CONTAINER_ATTRIBUTE], "c-a");
        // Unmapped samples carry none of the identity attributes.
        assert!(!samples[1].attributes.contains_key(POD_ATTRIBUTE));
        assert!(!samples[1].attributes.contains_key(NAMESPACE_ATTRIBUTE));
        assert!(!samples[1].attributes.contains_key(CONTAINER_ATTRIBUTE));
    }

    #[test]
    fn test_dra_mapping_dedups_per_pod_container() {
        let _guard = lock();
        empty_process_source();
        let mut config = AppConfig::default();
        config.kubernetes = true;
        config.kubernetes_enable_dra = true;
        let resolver = PodIdentityResolver::new(config);
        resolver.slice_manager.as_ref().unwrap().set_device("pool-0", "gpu-0", "GPU-abc", None);

        let mut pods = response(vec![]);
        let dynamic = crate::podresources::DynamicResource {
            claim_name: "claim-1".to_string(),
            claim_namespace: "ns-a".to_string(),
            claim_resources: vec![
                crate::podresources::ClaimResource {
                    driver_name: DRA_GPU_DRIVER_NAME.to_string(),
                    pool_name: "pool-0".to_string(),
                    device_name: "gpu-0".to_string(),
                },
                // Duplicate entry for the same device and container.
                crate::podresources::ClaimResource {
                    driver_name: DRA_GPU_DRIVER_NAME.to_string(),
                    pool_name: "pool-0".to_string(),
                    device_name: "gpu-0".to_string(),
                },
            ],
        };
        pods.pod_resources[0].containers[0].dynamic_resources = vec![dynamic];

        let map = resolver.to_device_to_pods_dra(&pods);
        assert_eq!(map["GPU-abc"].len(), 1);
        let dynamic = map["GPU-abc"][0].dynamic.as_ref().unwrap();
        assert_eq!(dynamic.pool_name, "pool-0");
        assert_eq!(dynamic.driver_name, DRA_GPU_DRIVER_NAME);
    }
}
