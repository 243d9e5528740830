//! Annotation keys shared with the scheduler extender.

/// Domain prefix of every annotation this plugin reads or writes.
pub const VNPU_DOMAIN: &str = "vnpu.io";

/// Node annotation holding the cluster-wide allocation lock.
pub const NODE_LOCK_ANNOTATION: &str = "vnpu.io/mutex.lock";
/// Pod annotation tracking where the pod is in the bind handshake.
pub const BIND_PHASE_ANNOTATION: &str = "vnpu.io/bind-phase";
/// Pod annotation naming the node the scheduler picked.
pub const ASSIGNED_NODE_ANNOTATION: &str = "vnpu.io/assigned-node";
/// Pod annotation with the unix time the scheduler bound the pod.
pub const BIND_TIME_ANNOTATION: &str = "vnpu.io/bind-time";

/// Pod annotation carrying the granted devices for a chip family.
pub fn devices_allocated(common_word: &str) -> String {
    format!("{VNPU_DOMAIN}/{common_word}-devices-allocated")
}

/// Node annotation carrying the published device list.
pub fn node_register(common_word: &str) -> String {
    format!("{VNPU_DOMAIN}/node-register-{common_word}")
}

/// Node annotation carrying the liveness timestamp.
pub fn node_handshake(common_word: &str) -> String {
    format!("{VNPU_DOMAIN}/node-handshake-{common_word}")
}

/// Phase of the scheduler/plugin bind handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum BindPhase {
    #[display("allocating")]
    Allocating,
    #[display("success")]
    Success,
    #[display("failed")]
    Failed,
}
