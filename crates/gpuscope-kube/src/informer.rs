//! Node-scoped pod metadata cache
//!
//! A reflector over the pod API, field-selected to the local node when
//! `NODE_NAME` is set. Pod UIDs and labels come from cache hits only; a miss
//! simply yields no metadata.

use futures::StreamExt;
use gpuscope_core::{Error, Result};
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::{reflector, watcher, WatchStreamExt};
use kube::{Api, Client};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Pod metadata served from the informer cache.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodMeta {
    pub uid: String,
    pub labels: BTreeMap<String, String>,
}

/// Cache of pod metadata kept in sync by a background watch.
pub struct PodStore {
    reader: reflector::Store<Pod>,
    handle: tokio::task::JoinHandle<()>,
}

impl PodStore {
    /// Start the reflector. Scopes the watch to `node_name` when given;
    /// otherwise watches the whole cluster with a warning.
    pub async fn spawn(client: Client, node_name: Option<String>) -> Result<Self> {
        let api: Api<Pod> = Api::all(client);
        let config = match &node_name {
            Some(node) => {
                info!(node = %node, "initializing pod informer");
                watcher::Config::default().fields(&format!("spec.nodeName={}", node))
            }
            None => {
                warn!("NODE_NAME not set, watching all pods in cluster for metadata");
                watcher::Config::default()
            }
        };

        let (reader, writer) = reflector::store();
        let stream = reflector(writer, watcher(api, config)).default_backoff().applied_objects();

        let handle = tokio::spawn(async move {
            futures::pin_mut!(stream);
            while let Some(event) = stream.next().await {
                if let Err(e) = event {
                    warn!(error = %e, "pod informer watch error");
                }
            }
        });

        let store = Self { reader, handle };
        store
            .reader
            .wait_until_ready()
            .await
            .map_err(|e| Error::kubernetes(format!("pod informer cache never synced: {}", e)))?;
        info!("pod informer cache synced");

        Ok(store)
    }

    /// Metadata of a pod, if present in the cache.
    pub fn get(&self, namespace: &str, name: &str) -> Option<PodMeta> {
        let obj = self.reader.get(&ObjectRef::new(name).within(namespace));
        match obj {
            Some(pod) => Some(PodMeta {
                uid: pod.metadata.uid.clone().unwrap_or_default(),
                labels: pod.metadata.labels.clone().unwrap_or_default(),
            }),
            None => {
                debug!(pod = name, namespace, "pod not found in informer cache");
                None
            }
        }
    }

    /// Stop the background watch.
    pub fn stop(&self) {
        self.handle.abort();
    }
}

impl Drop for PodStore {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
