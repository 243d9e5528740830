//! Device inventory of this node and the virtual capacity it offers.

pub mod capacity;
pub mod provider;
pub mod snapshot;

pub use capacity::virtual_slots;
pub use provider::DeviceProvider;
pub use provider::FileDeviceProvider;
pub use provider::InventoryError;
pub use provider::RawDevice;
pub use snapshot::DeviceSnapshot;
pub use snapshot::Inventory;
pub use snapshot::PhysicalDevice;
