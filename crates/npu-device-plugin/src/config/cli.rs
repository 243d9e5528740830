use clap::{Parser, Subcommand};
use utils::version;

use crate::config::daemon::{DaemonArgs, ShowConfigArgs};

#[derive(Parser)]
#[command(about, long_about, version = &**version::VERSION)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the device plugin daemon
    Daemon(Box<DaemonArgs>),
    /// Validate a device config file and print the resolved chip families
    #[command(name = "show-config")]
    ShowConfig(ShowConfigArgs),
}
