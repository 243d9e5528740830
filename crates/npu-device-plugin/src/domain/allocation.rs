//! Allocation metadata carried on pending pods and the container environment
//! it turns into.

use std::collections::HashMap;

use error_stack::Report;
use error_stack::ResultExt;
use serde::Deserialize;
use serde::Serialize;
use tracing::warn;

use crate::domain::inventory::PhysicalDevice;

/// Comma separated physical indices visible to the container.
pub const VISIBLE_DEVICES_ENV: &str = "VISIBLE_DEVICES";
/// Capacity template the container runtime carves the virtual device with.
pub const VNPU_SPECS_ENV: &str = "VNPU_SPECS";

/// Errors that deny an allocation.
#[derive(Debug, derive_more::Display)]
pub enum AllocationError {
    #[display("Allocation annotation {key} is missing or empty")]
    MissingAnnotation { key: String },
    #[display("Allocation annotation is malformed: {message}")]
    Malformed { message: String },
    #[display("None of the requested devices are known on this node")]
    NoDevices,
    #[display("No pod is pending allocation on node {node}")]
    PendingPodNotFound { node: String },
    #[display("Failed to look up pending pod: {message}")]
    Lookup { message: String },
}

impl core::error::Error for AllocationError {}

/// One entry of the allocation annotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRequest {
    pub uuid: String,
    /// Capacity template name, empty when the whole device is granted
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub temp: String,
}

/// Decode the allocation annotation of a pending pod.
///
/// # Errors
///
/// - [`AllocationError::MissingAnnotation`] if the value is absent or blank
/// - [`AllocationError::Malformed`] if the value is not a JSON array of requests
pub fn decode(key: &str, value: Option<&str>) -> Result<Vec<DeviceRequest>, Report<AllocationError>> {
    let value = value.map(str::trim).filter(|v| !v.is_empty()).ok_or_else(|| {
        Report::new(AllocationError::MissingAnnotation {
            key: key.to_string(),
        })
    })?;

    serde_json::from_str(value).change_context(AllocationError::Malformed {
        message: format!("{key}={value}"),
    })
}

pub fn encode(requests: &[DeviceRequest]) -> Result<String, Report<AllocationError>> {
    serde_json::to_string(requests).change_context(AllocationError::Malformed {
        message: "cannot serialize device requests".to_string(),
    })
}

/// Resolve requests against the device snapshot and build container envs.
///
/// Unknown UUIDs are skipped; the allocation fails only when none resolve.
/// Only the first non-empty template across all entries is forwarded.
pub fn container_envs(
    requests: &[DeviceRequest],
    devices: &[PhysicalDevice],
) -> Result<HashMap<String, String>, Report<AllocationError>> {
    let mut visible = Vec::with_capacity(requests.len());
    for request in requests {
        match devices.iter().find(|d| d.uuid == request.uuid) {
            Some(device) => visible.push(device.physical_index.to_string()),
            None => warn!(uuid = %request.uuid, "requested device is not in the inventory"),
        }
    }

    if visible.is_empty() {
        return Err(Report::new(AllocationError::NoDevices)
            .attach_printable(format!("requested: {requests:?}")));
    }

    let mut envs = HashMap::new();
    envs.insert(VISIBLE_DEVICES_ENV.to_string(), visible.join(","));
    // TODO: confirm whether multi-device requests may carry different templates
    if let Some(spec) = requests.iter().map(|r| r.temp.as_str()).find(|t| !t.is_empty()) {
        envs.insert(VNPU_SPECS_ENV.to_string(), spec.to_string());
    }
    Ok(envs)
}
