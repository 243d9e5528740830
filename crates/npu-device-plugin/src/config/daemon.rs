use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

const DEFAULT_CONFIG_FILE: &str = "/etc/npu-device-plugin/device-config.yaml";

#[derive(Parser, Clone, Debug)]
pub struct DaemonArgs {
    #[arg(
        long,
        env = "NPU_DEVICE_CONFIG",
        default_value = DEFAULT_CONFIG_FILE,
        value_hint = clap::ValueHint::FilePath,
        help = "Path of the chip-family device config"
    )]
    pub config_file: PathBuf,

    #[arg(
        long,
        env = "NODE_NAME",
        help = "Name of the node served by this plugin"
    )]
    pub node_name: String,

    #[arg(
        long,
        env = "NPU_CHIP_NAME",
        help = "Override the chip name reported by the device inventory"
    )]
    pub chip_name: Option<String>,

    #[arg(
        long,
        env = "NPU_INVENTORY_FILE",
        default_value = "/etc/npu-device-plugin/inventory.yaml",
        value_hint = clap::ValueHint::FilePath,
        help = "Device listing read by the file-backed inventory provider"
    )]
    pub inventory_file: PathBuf,

    #[arg(
        long,
        default_value = "/var/lib/kubelet/device-plugins",
        value_hint = clap::ValueHint::DirPath,
        help = "Directory holding kubelet and device plugin sockets"
    )]
    pub device_plugin_dir: PathBuf,

    #[arg(
        long,
        default_value = "kubelet.sock",
        help = "File name of the kubelet registration socket inside the device plugin directory"
    )]
    pub kubelet_socket: String,

    #[arg(
        long,
        env = "KUBECONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "Path to kubeconfig file (defaults to cluster config or ~/.kube/config)"
    )]
    pub kubeconfig: Option<PathBuf>,

    #[arg(
        long,
        env = "NPU_HANDSHAKE_OFFSET_SECS",
        default_value = "0",
        help = "Seconds added to the handshake timestamp reported to the scheduler"
    )]
    pub handshake_offset_secs: i64,

    #[arg(
        long,
        env = utils::logging::LOG_PATH_ENV_VAR,
        value_hint = clap::ValueHint::FilePath,
        help = "Write logs to a daily rolling file instead of stderr"
    )]
    pub log_path: Option<PathBuf>,
}

impl DaemonArgs {
    pub fn kubelet_socket_path(&self) -> PathBuf {
        self.device_plugin_dir.join(&self.kubelet_socket)
    }

    pub fn handshake_offset(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.handshake_offset_secs)
    }
}

#[derive(Parser, Clone, Debug)]
pub struct ShowConfigArgs {
    #[arg(
        long,
        env = "NPU_DEVICE_CONFIG",
        default_value = DEFAULT_CONFIG_FILE,
        value_hint = clap::ValueHint::FilePath,
        help = "Path of the chip-family device config"
    )]
    pub config_file: PathBuf,
}

/// Delays of the self-registration loop.
#[derive(Debug, Clone, Copy)]
pub struct ReportIntervals {
    pub initial: Duration,
    pub steady: Duration,
    pub on_error: Duration,
}

impl Default for ReportIntervals {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            steady: Duration::from_secs(30),
            on_error: Duration::from_secs(5),
        }
    }
}
