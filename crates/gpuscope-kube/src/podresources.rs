//! Kubelet pod-resources API client
//!
//! Message types for the `v1.PodResourcesLister` service and a minimal unary
//! client dialling the kubelet's unix-domain socket. The messages are
//! hand-derived prost types, so no protoc is needed at build time.

use gpuscope_core::{Error, Result};
use hyper_util::rt::TokioIo;
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::UnixStream;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;

/// Per-List deadline.
pub const LIST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListPodResourcesRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListPodResourcesResponse {
    #[prost(message, repeated, tag = "1")]
    pub pod_resources: ::prost::alloc::vec::Vec<PodResources>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PodResources {
    #[prost(string, tag = "1")]
    pub name: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub namespace: ::prost::alloc::string::String,
    #[prost(message, repeated, tag = "3")]
    pub containers: ::prost::alloc::vec::Vec<ContainerResources>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ContainerResources {
    #[prost(string, tag = "1")]
    pub name: ::prost::alloc::string::String,
    #[prost(message, repeated, tag = "2")]
    pub devices: ::prost::alloc::vec::Vec<ContainerDevices>,
    #[prost(message, repeated, tag = "5")]
    pub dynamic_resources: ::prost::alloc::vec::Vec<DynamicResource>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ContainerDevices {
    #[prost(string, tag = "1")]
    pub resource_name: ::prost::alloc::string::String,
    #[prost(string, repeated, tag = "2")]
    pub device_ids: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DynamicResource {
    #[prost(string, tag = "2")]
    pub claim_name: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub claim_namespace: ::prost::alloc::string::String,
    #[prost(message, repeated, tag = "4")]
    pub claim_resources: ::prost::alloc::vec::Vec<ClaimResource>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClaimResource {
    #[prost(string, tag = "2")]
    pub driver_name: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub pool_name: ::prost::alloc::string::String,
    #[prost(string, tag = "4")]
    pub device_name: ::prost::alloc::string::String,
}

/// Unary client for `PodResourcesLister.List` over a unix socket.
#[derive(Debug)]
pub struct PodResourcesClient {
    inner: tonic::client::Grpc<Channel>,
}

impl PodResourcesClient {
    /// Dial the kubelet socket with plaintext credentials.
    pub async fn connect(socket_path: impl Into<PathBuf>) -> Result<Self> {
        let socket_path = socket_path.into();

        // The endpoint URI is never resolved; the connector dials the socket.
        let channel = Endpoint::try_from("http://[::1]:50051")
            .map_err(|e| Error::transport(e.to_string()))?
            .connect_with_connector(service_fn(move |_: Uri| {
                let socket_path = socket_path.clone();
                async move {
                    Ok::<_, std::io::Error>(TokioIo::new(UnixStream::connect(socket_path).await?))
                }
            }))
            .await
            .map_err(|e| {
                Error::transport(format!("failure connecting to pod-resources socket: {}", e))
            })?;

        Ok(Self { inner: tonic::client::Grpc::new(channel) })
    }

    /// List the device and dynamic-resource assignments of every pod on the
    /// node. Applies [`LIST_TIMEOUT`].
    pub async fn list(&mut self) -> Result<ListPodResourcesResponse> {
        let call = async {
            self.inner
                .ready()
                .await
                .map_err(|e| Error::transport(format!("pod-resources channel not ready: {}", e)))?;

            let codec: tonic::codec::ProstCodec<ListPodResourcesRequest, ListPodResourcesResponse> =
                tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static("/v1.PodResourcesLister/List");

            self.inner
                .unary(tonic::Request::new(ListPodResourcesRequest {}), path, codec)
                .await
                .map(tonic::Response::into_inner)
                .map_err(|status| {
                    Error::kubernetes(format!("failure getting pod resources: {}", status))
                })
        };

        tokio::time::timeout(LIST_TIMEOUT, call)
            .await
            .map_err(|_| Error::timeout("pod-resources List"))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn test_response_round_trips_through_wire_encoding() {
        let response = ListPodResourcesResponse {
            pod_resources: vec![PodResources {
                name: "gpu-pod-0".to_string(),
                namespace: "ns-a".to_string(),
                containers: vec![ContainerResources {
                    name: "c-a".to_string(),
                    devices: vec![ContainerDevices {
                        resource_name: "nvidia.com/gpu".to_string(),
                        device_ids: vec!["GPU-abc".to_string()],
                    }],
                    dynamic_resources: vec![DynamicResource {
                        claim_name: "claim-1".to_string(),
                        claim_namespace: "ns-a".to_string(),
                        claim_resources: vec![ClaimResource {
                            driver_name: "gpu.nvidia.com".to_string(),
                            pool_name: "pool-0".to_string(),
                            device_name: "gpu-0".to_string(),
                        }],
                    }],
                }],
            }],
        };

        let bytes = response.encode_to_vec();
        let decoded = ListPodResourcesResponse::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded, response);
        assert_eq!(decoded.pod_resources[0].containers[0].devices[0].device_ids[0], "GPU-abc");
    }

    #[tokio::test]
    async fn test_connect_fails_fast_without_socket() {
        let err = PodResourcesClient::connect("/nonexistent/kubelet.sock").await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }
}
