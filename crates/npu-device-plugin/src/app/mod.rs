//! Application module
//!
//! Wires the inventory, the cluster client and the device plugin together and
//! hands them to the [`Supervisor`](supervisor::Supervisor).

pub mod core;
pub mod events;
pub mod supervisor;

pub use core::run_daemon;
pub use events::SupervisorEvent;
pub use supervisor::PluginLifecycle;
pub use supervisor::Supervisor;
