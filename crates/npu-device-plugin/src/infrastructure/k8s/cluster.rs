//! Cluster-side collaborators of the device plugin.
//!
//! Allocation needs to find the pod kubelet is admitting, release the node
//! lock the scheduler took for it, and the reporter needs to publish node
//! annotations. [`ClusterClient`] is the seam; [`KubeClusterClient`] talks to
//! the API server.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::api::core::v1::Pod;
use kube::api::ListParams;
use kube::api::Patch;
use kube::api::PatchParams;
use kube::config::KubeConfigOptions;
use kube::config::Kubeconfig;
use kube::Api;
use kube::Client;
use kube::Config;
use serde_json::json;
use tracing::debug;

use super::annotations::BindPhase;
use super::annotations::ASSIGNED_NODE_ANNOTATION;
use super::annotations::BIND_PHASE_ANNOTATION;
use super::annotations::BIND_TIME_ANNOTATION;
use super::annotations::NODE_LOCK_ANNOTATION;
use super::KubernetesError;

/// Pod waiting for its devices on this node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingPod {
    pub namespace: String,
    pub name: String,
    pub annotations: BTreeMap<String, String>,
}

#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Oldest pod on `node` that the scheduler left in the allocating phase.
    async fn pending_pod(&self, node: &str) -> Result<Option<PendingPod>, Report<KubernetesError>>;

    async fn set_bind_phase(
        &self,
        pod: &PendingPod,
        phase: BindPhase,
    ) -> Result<(), Report<KubernetesError>>;

    /// Drop the allocation lock the scheduler holds on `node`.
    async fn release_node_lock(&self, node: &str) -> Result<(), Report<KubernetesError>>;

    async fn patch_node_annotations(
        &self,
        node: &str,
        annotations: BTreeMap<String, String>,
    ) -> Result<(), Report<KubernetesError>>;
}

/// Pick the pod kubelet is currently admitting among the pods bound to `node`.
///
/// Candidates are in the allocating phase and assigned to `node`; the earliest
/// bind time wins, pods without a parsable bind time sort last.
pub fn select_pending_pod(pods: impl IntoIterator<Item = Pod>, node: &str) -> Option<PendingPod> {
    pods.into_iter()
        .filter_map(|pod| {
            let annotations = pod.metadata.annotations.unwrap_or_default();
            let allocating = annotations
                .get(BIND_PHASE_ANNOTATION)
                .is_some_and(|p| p == &BindPhase::Allocating.to_string());
            let assigned_here = annotations
                .get(ASSIGNED_NODE_ANNOTATION)
                .is_some_and(|n| n == node);
            if !allocating || !assigned_here {
                return None;
            }

            let bind_time = annotations
                .get(BIND_TIME_ANNOTATION)
                .and_then(|t| t.parse::<u64>().ok())
                .unwrap_or(u64::MAX);
            Some((
                bind_time,
                PendingPod {
                    namespace: pod.metadata.namespace.unwrap_or_default(),
                    name: pod.metadata.name.unwrap_or_default(),
                    annotations,
                },
            ))
        })
        .min_by_key(|(bind_time, _)| *bind_time)
        .map(|(_, pod)| pod)
}

/// [`ClusterClient`] backed by the Kubernetes API server.
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connect with `kubeconfig`, or with the in-cluster service account (then
    /// `~/.kube/config`) when none is given.
    pub async fn connect(kubeconfig: Option<&Path>) -> Result<Self, Report<KubernetesError>> {
        let client = match kubeconfig {
            Some(path) => {
                let failed = || KubernetesError::ConnectionFailed {
                    message: format!("kubeconfig {}", path.display()),
                };
                let kubeconfig = Kubeconfig::read_from(path).change_context_lazy(failed)?;
                let config =
                    Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                        .await
                        .change_context_lazy(failed)?;
                Client::try_from(config).change_context_lazy(failed)?
            }
            None => Client::try_default()
                .await
                .change_context(KubernetesError::ConnectionFailed {
                    message: "in-cluster or default kubeconfig".to_string(),
                })?,
        };
        debug!(namespace = client.default_namespace(), "connected to the API server");
        Ok(Self::new(client))
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    #[tracing::instrument(skip(self))]
    async fn pending_pod(&self, node: &str) -> Result<Option<PendingPod>, Report<KubernetesError>> {
        let pods: Api<Pod> = Api::all(self.client.clone());
        let params = ListParams::default().fields(&format!("spec.nodeName={node}"));
        let list = pods
            .list(&params)
            .await
            .change_context(KubernetesError::ListFailed {
                message: format!("pods on node {node}"),
            })?;

        debug!(pods = list.items.len(), "listed pods bound to node");
        Ok(select_pending_pod(list.items, node))
    }

    async fn set_bind_phase(
        &self,
        pod: &PendingPod,
        phase: BindPhase,
    ) -> Result<(), Report<KubernetesError>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &pod.namespace);
        let patch = json!({
            "metadata": { "annotations": { BIND_PHASE_ANNOTATION: phase.to_string() } }
        });
        pods.patch(&pod.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .change_context(KubernetesError::PatchFailed {
                kind: "pod",
                name: format!("{}/{}", pod.namespace, pod.name),
                message: format!("set {BIND_PHASE_ANNOTATION}={phase}"),
            })?;
        Ok(())
    }

    async fn release_node_lock(&self, node: &str) -> Result<(), Report<KubernetesError>> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let patch = json!({
            "metadata": { "annotations": { NODE_LOCK_ANNOTATION: null } }
        });
        nodes
            .patch(node, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .change_context(KubernetesError::PatchFailed {
                kind: "node",
                name: node.to_string(),
                message: format!("remove {NODE_LOCK_ANNOTATION}"),
            })?;
        Ok(())
    }

    async fn patch_node_annotations(
        &self,
        node: &str,
        annotations: BTreeMap<String, String>,
    ) -> Result<(), Report<KubernetesError>> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let keys: Vec<String> = annotations.keys().cloned().collect();
        let patch = json!({ "metadata": { "annotations": annotations } });
        nodes
            .patch(node, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .change_context(KubernetesError::PatchFailed {
                kind: "node",
                name: node.to_string(),
                message: format!("set {keys:?}"),
            })?;
        Ok(())
    }
}
