//! Access to the vendor device inventory.
//!
//! The plugin never talks to the driver directly; everything it learns about
//! physical chips comes through [`DeviceProvider`].

use std::path::PathBuf;

use error_stack::Report;
use error_stack::ResultExt;
use serde::Deserialize;
use serde::Serialize;

/// Errors raised while querying the device inventory.
#[derive(Debug, derive_more::Display)]
pub enum InventoryError {
    #[display("Failed to enumerate devices: {message}")]
    Enumerate { message: String },
    #[display("Failed to query device {logic_id}: {message}")]
    Query { logic_id: u32, message: String },
    #[display("Failed to clean up idle devices: {message}")]
    Cleanup { message: String },
}

impl core::error::Error for InventoryError {}

/// Per-device answer of the inventory provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawDevice {
    pub uuid: String,
    pub physical_id: u32,
    pub card_id: u32,
    pub device_id: u32,
    /// NUMA node of the chip, negative when unknown
    #[serde(default = "unknown_numa")]
    pub numa: i32,
    #[serde(default = "healthy_by_default")]
    pub healthy: bool,
}

const fn unknown_numa() -> i32 {
    -1
}

const fn healthy_by_default() -> bool {
    true
}

/// Source of physical device facts (driver SDK, or a static listing).
pub trait DeviceProvider: Send + Sync {
    /// Chip family name used to pick the config entry.
    fn chip_name(&self) -> Result<String, Report<InventoryError>>;

    /// Logical indices of all visible devices.
    fn logic_ids(&self) -> Result<Vec<u32>, Report<InventoryError>>;

    /// Identity and health of one device.
    fn query(&self, logic_id: u32) -> Result<RawDevice, Report<InventoryError>>;

    /// Every visible device with its logical index.
    ///
    /// Fails as a whole when any single device cannot be queried.
    fn devices(&self) -> Result<Vec<(u32, RawDevice)>, Report<InventoryError>> {
        self.logic_ids()?
            .into_iter()
            .map(|logic_id| {
                self.query(logic_id)
                    .attach_printable_lazy(|| format!("listing aborted at device {logic_id}"))
                    .map(|device| (logic_id, device))
            })
            .collect()
    }

    /// Tear down virtual devices no container is using anymore.
    fn cleanup_idle(&self) -> Result<(), Report<InventoryError>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InventoryListing {
    chip_name: String,
    #[serde(default)]
    devices: Vec<ListedDevice>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListedDevice {
    logic_id: u32,
    #[serde(flatten)]
    device: RawDevice,
}

/// Provider backed by a YAML listing of the node's chips.
///
/// The file is re-read on every call so health flips made by an external agent
/// are picked up on the next poll.
#[derive(Debug, Clone)]
pub struct FileDeviceProvider {
    path: PathBuf,
}

impl FileDeviceProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn read_listing(&self) -> Result<InventoryListing, Report<InventoryError>> {
        let content =
            std::fs::read_to_string(&self.path).change_context(InventoryError::Enumerate {
                message: format!("cannot read {}", self.path.display()),
            })?;
        serde_yaml::from_str(&content).change_context(InventoryError::Enumerate {
            message: format!("cannot parse {}", self.path.display()),
        })
    }
}

impl DeviceProvider for FileDeviceProvider {
    fn chip_name(&self) -> Result<String, Report<InventoryError>> {
        Ok(self.read_listing()?.chip_name)
    }

    fn logic_ids(&self) -> Result<Vec<u32>, Report<InventoryError>> {
        Ok(self
            .read_listing()?
            .devices
            .iter()
            .map(|d| d.logic_id)
            .collect())
    }

    fn query(&self, logic_id: u32) -> Result<RawDevice, Report<InventoryError>> {
        let listing = self
            .read_listing()
            .change_context(InventoryError::Query {
                logic_id,
                message: "inventory listing unavailable".to_string(),
            })?;

        listing
            .devices
            .into_iter()
            .find(|d| d.logic_id == logic_id)
            .map(|d| d.device)
            .ok_or_else(|| {
                Report::new(InventoryError::Query {
                    logic_id,
                    message: "device no longer listed".to_string(),
                })
            })
    }

    fn devices(&self) -> Result<Vec<(u32, RawDevice)>, Report<InventoryError>> {
        Ok(self
            .read_listing()?
            .devices
            .into_iter()
            .map(|d| (d.logic_id, d.device))
            .collect())
    }

    fn cleanup_idle(&self) -> Result<(), Report<InventoryError>> {
        // a static listing has no virtual devices to tear down
        Ok(())
    }
}
