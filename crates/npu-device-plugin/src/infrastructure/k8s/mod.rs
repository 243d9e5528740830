//! Kubernetes integration module.
//!
//! The main components are:
//! - [`ClusterClient`]: pending pod lookup, bind phase, node lock and node annotations
//! - [`annotations`]: annotation keys shared with the scheduler
//! - [`device_plugin`]: the kubelet device plugin server
//! - [`reporter`]: periodic device registration on the node object

pub mod annotations;
pub mod cluster;
pub mod device_plugin;
pub mod reporter;
pub mod types;

pub use cluster::ClusterClient;
pub use cluster::KubeClusterClient;
pub use cluster::PendingPod;
pub use types::KubernetesError;
