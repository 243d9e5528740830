pub mod cli;
pub mod daemon;
pub mod device;

pub use cli::*;
pub use daemon::*;
pub use device::*;
