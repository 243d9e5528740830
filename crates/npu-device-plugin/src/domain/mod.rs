//! Device inventory and allocation logic, free of any transport.

pub mod allocation;
pub mod inventory;
