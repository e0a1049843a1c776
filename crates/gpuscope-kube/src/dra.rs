//! DRA resource-slice manager
//!
//! Resolves `(pool, device)` references from pod dynamic resources to the
//! GPU UUID they name, carrying MIG identity when the slice describes a MIG
//! partition. Slices are read through the dynamic API so no pinned
//! `resource.k8s.io` feature version is required.

use gpuscope_core::{Error, Result};
use kube::api::{Api, DynamicObject, ListParams};
use kube::core::{ApiResource, GroupVersionKind};
use kube::Client;
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::{debug, warn};

/// MIG identity carried by a DRA device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigInfo {
    pub profile: String,
    pub mig_device_uuid: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SliceDevice {
    uuid: String,
    mig: Option<MigInfo>,
}

/// Lookup table from `(pool, device)` to GPU identity.
#[derive(Default)]
pub struct ResourceSliceManager {
    devices: RwLock<HashMap<(String, String), SliceDevice>>,
}

impl ResourceSliceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-list resource slices and rebuild the lookup table.
    pub async fn refresh(&self, client: &Client) -> Result<()> {
        let gvk = GroupVersionKind::gvk("resource.k8s.io", "v1beta1", "ResourceSlice");
        let api_resource = ApiResource::from_gvk(&gvk);
        let api: Api<DynamicObject> = Api::all_with(client.clone(), &api_resource);

        let slices = api
            .list(&ListParams::default())
            .await
            .map_err(|e| Error::kubernetes(format!("listing resource slices: {}", e)))?;

        let mut devices = HashMap::new();
        for slice in slices {
            let Some(spec) = slice.data.get("spec") else {
                continue;
            };
            let Some(pool) = spec.pointer("/pool/name").and_then(|v| v.as_str()) else {
                continue;
            };
            let Some(slice_devices) = spec.get("devices").and_then(|v| v.as_array()) else {
                continue;
            };

            for device in slice_devices {
                let Some(name) = device.get("name").and_then(|v| v.as_str()) else {
                    continue;
                };
                let attributes = device.pointer("/basic/attributes");
                let attr = |key: &str| {
                    attributes
                        .and_then(|a| a.pointer(&format!("/{}/string", key)))
                        .and_then(|v| v.as_str())
                        .map(str::to_string)
                };

                let Some(uuid) = attr("uuid") else {
                    debug!(pool, device = name, "resource slice device has no uuid attribute");
                    continue;
                };

                // MIG partitions resolve to their parent UUID plus identity.
                let (uuid, mig) = match attr("parentUuid") {
                    Some(parent) => {
                        let profile = attr("profile").unwrap_or_default();
                        (parent, Some(MigInfo { profile, mig_device_uuid: uuid }))
                    }
                    None => (uuid, None),
                };

                devices.insert((pool.to_string(), name.to_string()), SliceDevice { uuid, mig });
            }
        }

        debug!(devices = devices.len(), "resource slice table rebuilt");
        *self.devices.write().unwrap_or_else(|e| e.into_inner()) = devices;
        Ok(())
    }

    /// Resolve `(pool, device)` to a UUID and optional MIG identity.
    pub fn device_info(&self, pool: &str, device: &str) -> Option<(String, Option<MigInfo>)> {
        let devices = self.devices.read().unwrap_or_else(|e| e.into_inner());
        match devices.get(&(pool.to_string(), device.to_string())) {
            Some(d) => Some((d.uuid.clone(), d.mig.clone())),
            None => {
                warn!(pool, device, "no UUID known for resource slice device");
                None
            }
        }
    }

    /// Insert one device mapping directly. Test seam.
    pub fn set_device(
        &self,
        pool: impl Into<String>,
        device: impl Into<String>,
        uuid: impl Into<String>,
        mig: Option<MigInfo>,
    ) {
        self.devices
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert((pool.into(), device.into()), SliceDevice { uuid: uuid.into(), mig });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_plain_gpu() {
        let manager = ResourceSliceManager::new();
        manager.set_device("pool-0", "gpu-0", "GPU-aaaa", None);

        let (uuid, mig) = manager.device_info("pool-0", "gpu-0").unwrap();
        assert_eq!(uuid, "GPU-aaaa");
        assert!(mig.is_none());
        assert!(manager.device_info("pool-0", "gpu-1").is_none());
    }

    #[test]
    fn test_lookup_mig_device_resolves_to_parent() {
        let manager = ResourceSliceManager::new();
        manager.set_device(
            "pool-0",
            "mig-1g-5gb-3",
            "GPU-parent",
            Some(MigInfo {
                profile: "1g.5gb".to_string(),
                mig_device_uuid: "MIG-abcd".to_string(),
            }),
        );

        let (uuid, mig) = manager.device_info("pool-0", "mig-1g-5gb-3").unwrap();
        assert_eq!(uuid, "GPU-parent");
        let mig = mig.unwrap();
        assert_eq!(mig.profile, "1g.5gb");
        assert_eq!(mig.mig_device_uuid, "MIG-abcd");
    }
}
