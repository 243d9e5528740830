use std::sync::Arc;
use std::sync::PoisonError;
use std::sync::RwLock;

use error_stack::Report;
use tracing::debug;
use tracing::info;

use super::capacity;
use super::provider::DeviceProvider;
use super::provider::InventoryError;
use crate::config::ChipFamilyConfig;

/// One physical accelerator as last reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalDevice {
    pub uuid: String,
    pub logic_index: u32,
    pub physical_index: u32,
    pub card_index: u32,
    pub device_index: u32,
    /// Allocatable memory in MiB
    pub memory: u64,
    pub cores: u32,
    pub numa: i32,
    pub healthy: bool,
}

impl PhysicalDevice {
    /// Identities published to kubelet for each virtual slot of this device.
    pub fn virtual_ids(&self, slots: u32) -> impl Iterator<Item = String> + '_ {
        (0..slots).map(move |i| format!("{}-{i}", self.uuid))
    }
}

/// Immutable list of devices; replaced wholesale on refresh.
pub type DeviceSnapshot = Arc<[PhysicalDevice]>;

/// Last known device inventory of this node.
///
/// Readers clone the current [`DeviceSnapshot`] and work on it without holding
/// any lock, so they see either the previous or the new list, never a mix.
pub struct Inventory {
    provider: Arc<dyn DeviceProvider>,
    family: ChipFamilyConfig,
    snapshot: RwLock<DeviceSnapshot>,
}

impl std::fmt::Debug for Inventory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inventory")
            .field("chip", &self.family.chip_name)
            .field("devices", &self.snapshot().len())
            .finish()
    }
}

impl Inventory {
    pub fn new(provider: Arc<dyn DeviceProvider>, family: ChipFamilyConfig) -> Self {
        Self {
            provider,
            family,
            snapshot: RwLock::new(Arc::from(Vec::new())),
        }
    }

    pub fn family(&self) -> &ChipFamilyConfig {
        &self.family
    }

    /// Query every device and swap in the new list.
    ///
    /// Any per-device failure aborts the refresh and keeps the previous list.
    #[tracing::instrument(skip(self), fields(chip = %self.family.chip_name))]
    pub fn refresh(&self) -> Result<(), Report<InventoryError>> {
        let devices: Vec<PhysicalDevice> = self
            .provider
            .devices()?
            .into_iter()
            .map(|(logic_id, raw)| PhysicalDevice {
                uuid: raw.uuid,
                logic_index: logic_id,
                physical_index: raw.physical_id,
                card_index: raw.card_id,
                device_index: raw.device_id,
                memory: self.family.memory_allocatable,
                cores: self.family.ai_core,
                numa: raw.numa,
                healthy: raw.healthy,
            })
            .collect();

        info!(devices = devices.len(), "device inventory refreshed");
        let fresh: DeviceSnapshot = Arc::from(devices);
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = fresh;
        Ok(())
    }

    /// Current complete device list.
    pub fn snapshot(&self) -> DeviceSnapshot {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn lookup(&self, uuid: &str) -> Option<PhysicalDevice> {
        self.snapshot().iter().find(|d| d.uuid == uuid).cloned()
    }

    /// Logical indices of devices currently flagged unhealthy.
    pub fn unhealthy(&self) -> Vec<u32> {
        let unhealthy: Vec<u32> = self
            .snapshot()
            .iter()
            .filter(|d| !d.healthy)
            .map(|d| d.logic_index)
            .collect();
        if !unhealthy.is_empty() {
            debug!(?unhealthy, "unhealthy devices in snapshot");
        }
        unhealthy
    }

    /// Logical indices the provider reports unhealthy right now.
    ///
    /// Unlike [`unhealthy`](Self::unhealthy) this asks the provider and leaves
    /// the snapshot untouched.
    pub fn poll_unhealthy(&self) -> Result<Vec<u32>, Report<InventoryError>> {
        Ok(self
            .provider
            .devices()?
            .into_iter()
            .filter(|(_, raw)| !raw.healthy)
            .map(|(logic_id, _)| logic_id)
            .collect())
    }

    pub fn virtual_slots_per_device(&self) -> u32 {
        capacity::virtual_slots_for(&self.family)
    }

    pub fn cleanup_idle(&self) -> Result<(), Report<InventoryError>> {
        self.provider.cleanup_idle()
    }
}
