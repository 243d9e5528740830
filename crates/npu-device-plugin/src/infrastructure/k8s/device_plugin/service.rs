use std::pin::Pin;
use std::sync::Arc;

use error_stack::Report;
use error_stack::ResultExt;
use futures::Stream;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tonic::Request;
use tonic::Response;
use tonic::Result as TonicResult;
use tonic::Status;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::api::device_plugin_server::DevicePlugin;
use super::api::AllocateRequest;
use super::api::AllocateResponse;
use super::api::ContainerAllocateResponse;
use super::api::Device;
use super::api::DevicePluginOptions;
use super::api::Empty;
use super::api::ListAndWatchResponse;
use super::api::NumaNode;
use super::api::PreStartContainerRequest;
use super::api::PreStartContainerResponse;
use super::api::PreferredAllocationRequest;
use super::api::PreferredAllocationResponse;
use super::api::TopologyInfo;
use crate::domain::allocation;
use crate::domain::allocation::AllocationError;
use crate::domain::inventory::Inventory;
use crate::infrastructure::k8s::annotations;
use crate::infrastructure::k8s::annotations::BindPhase;
use crate::infrastructure::k8s::ClusterClient;
use crate::infrastructure::k8s::PendingPod;

pub const HEALTHY: &str = "Healthy";
pub const UNHEALTHY: &str = "Unhealthy";

/// Options advertised at registration and from `GetDevicePluginOptions`.
pub const PLUGIN_OPTIONS: DevicePluginOptions = DevicePluginOptions {
    pre_start_required: false,
    get_preferred_allocation_available: false,
};

/// gRPC side of the device plugin, one instance per serving period.
#[derive(Clone)]
pub struct DevicePluginService {
    inventory: Arc<Inventory>,
    cluster: Arc<dyn ClusterClient>,
    node_name: Arc<str>,
    health: Arc<watch::Sender<u64>>,
    /// fires when the plugin is stopped
    stop: CancellationToken,
}

impl DevicePluginService {
    pub fn new(
        inventory: Arc<Inventory>,
        cluster: Arc<dyn ClusterClient>,
        node_name: &str,
        health: Arc<watch::Sender<u64>>,
        stop: CancellationToken,
    ) -> Self {
        Self {
            inventory,
            cluster,
            node_name: Arc::from(node_name),
            health,
            stop,
        }
    }

    /// Expand the current snapshot into one kubelet device per virtual slot.
    pub fn device_list(inventory: &Inventory) -> Vec<Device> {
        let slots = inventory.virtual_slots_per_device();
        inventory
            .snapshot()
            .iter()
            .flat_map(|device| {
                let health = if device.healthy { HEALTHY } else { UNHEALTHY };
                let topology = (device.numa >= 0).then(|| TopologyInfo {
                    nodes: vec![NumaNode {
                        id: i64::from(device.numa),
                    }],
                });
                device.virtual_ids(slots).map(move |id| Device {
                    id,
                    health: health.to_string(),
                    topology: topology.clone(),
                })
            })
            .collect()
    }

    /// Resolve the pending pod and turn its allocation annotation into envs.
    async fn allocate_pending(
        &self,
        request: &AllocateRequest,
    ) -> Result<AllocateResponse, Report<AllocationError>> {
        let pod = self
            .cluster
            .pending_pod(&self.node_name)
            .await
            .change_context(AllocationError::Lookup {
                message: format!("node {}", self.node_name),
            })?
            .ok_or_else(|| {
                Report::new(AllocationError::PendingPodNotFound {
                    node: self.node_name.to_string(),
                })
            })?;

        info!(namespace = %pod.namespace, pod = %pod.name, "allocating devices for pending pod");

        let result = self.bind_pod(&pod, request);
        let phase = if result.is_ok() {
            BindPhase::Success
        } else {
            BindPhase::Failed
        };
        if let Err(e) = self.cluster.set_bind_phase(&pod, phase).await {
            warn!(namespace = %pod.namespace, pod = %pod.name, "failed to record bind phase {phase}: {e:?}");
        }
        result
    }

    fn bind_pod(
        &self,
        pod: &PendingPod,
        request: &AllocateRequest,
    ) -> Result<AllocateResponse, Report<AllocationError>> {
        let key = annotations::devices_allocated(&self.inventory.family().common_word);
        let requests = allocation::decode(&key, pod.annotations.get(&key).map(String::as_str))?;
        let envs = allocation::container_envs(&requests, &self.inventory.snapshot())?;

        let container_responses = request
            .container_requests
            .iter()
            .map(|container| {
                debug!(device_ids = ?container.devices_ids, ?envs, "container allocation");
                ContainerAllocateResponse {
                    envs: envs.clone(),
                    ..Default::default()
                }
            })
            .collect();

        Ok(AllocateResponse {
            container_responses,
        })
    }
}

fn allocation_status(report: &Report<AllocationError>) -> Status {
    let message = report.current_context().to_string();
    match report.current_context() {
        AllocationError::MissingAnnotation { .. } | AllocationError::Malformed { .. } => {
            Status::invalid_argument(message)
        }
        AllocationError::NoDevices | AllocationError::PendingPodNotFound { .. } => {
            Status::not_found(message)
        }
        AllocationError::Lookup { .. } => Status::unavailable(message),
    }
}

#[tonic::async_trait]
impl DevicePlugin for DevicePluginService {
    async fn get_device_plugin_options(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<DevicePluginOptions>> {
        debug!("getting device plugin options");
        Ok(Response::new(PLUGIN_OPTIONS))
    }

    type ListAndWatchStream =
        Pin<Box<dyn Stream<Item = Result<ListAndWatchResponse, Status>> + Send>>;

    /// Push the full device list now and again after every health change.
    async fn list_and_watch(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<Self::ListAndWatchStream>> {
        info!("starting to watch device list");

        let (tx, rx) = mpsc::channel(4);
        let stop = self.stop.clone();
        let inventory = self.inventory.clone();
        let mut health = self.health.subscribe();

        tokio::spawn(async move {
            let devices = Self::device_list(&inventory);
            info!(devices = devices.len(), "sending initial device list");
            if tx.send(Ok(ListAndWatchResponse { devices })).await.is_err() {
                return;
            }

            loop {
                tokio::select! {
                    _ = stop.cancelled() => {
                        info!("device watch stopped");
                        break;
                    }
                    _ = tx.closed() => {
                        info!("device watch subscriber went away");
                        break;
                    }
                    changed = health.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let devices = Self::device_list(&inventory);
                        info!(devices = devices.len(), "device health changed, resending device list");
                        if tx.send(Ok(ListAndWatchResponse { devices })).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let stream = tokio_stream::wrappers::ReceiverStream::new(rx);
        Ok(Response::new(Box::pin(stream)))
    }

    async fn get_preferred_allocation(
        &self,
        _request: Request<PreferredAllocationRequest>,
    ) -> TonicResult<Response<PreferredAllocationResponse>> {
        Err(Status::unimplemented("preferred allocation is not supported"))
    }

    /// Allocate the devices the scheduler granted to the pending pod.
    ///
    /// The node lock is released exactly once per call, whatever the outcome.
    async fn allocate(
        &self,
        request: Request<AllocateRequest>,
    ) -> TonicResult<Response<AllocateResponse>> {
        let request = request.into_inner();
        info!(containers = request.container_requests.len(), "allocate request");

        let outcome = self.allocate_pending(&request).await;

        if let Err(e) = self.cluster.release_node_lock(&self.node_name).await {
            error!(node = %self.node_name, "failed to release node lock: {e:?}");
        }

        match outcome {
            Ok(response) => {
                info!("device allocation completed");
                Ok(Response::new(response))
            }
            Err(report) => {
                warn!("device allocation denied: {report:?}");
                Err(allocation_status(&report))
            }
        }
    }

    async fn pre_start_container(
        &self,
        request: Request<PreStartContainerRequest>,
    ) -> TonicResult<Response<PreStartContainerResponse>> {
        debug!("pre-start container: {:?}", request.into_inner());
        Ok(Response::new(PreStartContainerResponse {}))
    }
}
