use core::error::Error;

/// Errors that can occur during Kubernetes operations.
#[derive(Debug, derive_more::Display)]
pub enum KubernetesError {
    #[display("Failed to connect to Kubernetes API: {message}")]
    ConnectionFailed { message: String },
    #[display("Failed to list pods: {message}")]
    ListFailed { message: String },
    #[display("Failed to patch {kind} {name}: {message}")]
    PatchFailed {
        kind: &'static str,
        name: String,
        message: String,
    },
}

impl Error for KubernetesError {}
