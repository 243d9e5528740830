use std::sync::Arc;

use anyhow::anyhow;
use anyhow::Result;
use tokio::sync::mpsc;

use crate::app::events;
use crate::app::supervisor::Supervisor;
use crate::config::DaemonArgs;
use crate::config::DeviceConfig;
use crate::config::ReportIntervals;
use crate::domain::inventory::DeviceProvider;
use crate::domain::inventory::FileDeviceProvider;
use crate::domain::inventory::Inventory;
use crate::infrastructure::k8s::device_plugin::NpuDevicePlugin;
use crate::infrastructure::k8s::device_plugin::PluginSettings;
use crate::infrastructure::k8s::KubeClusterClient;

const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Run the device plugin until a termination signal or a fatal error.
pub async fn run_daemon(args: DaemonArgs) -> Result<()> {
    let config = DeviceConfig::load(&args.config_file)
        .map_err(|e| anyhow!("failed to load device config: {e:?}"))?;

    let provider = Arc::new(FileDeviceProvider::new(&args.inventory_file));
    let chip_name = match &args.chip_name {
        Some(chip_name) => chip_name.clone(),
        None => provider
            .chip_name()
            .map_err(|e| anyhow!("failed to detect chip name: {e:?}"))?,
    };
    let family = config
        .family(&chip_name)
        .map_err(|e| anyhow!("no configuration for this node's chips: {e:?}"))?
        .clone();
    tracing::info!(
        chip = %family.chip_name,
        resource = %family.resource_name,
        templates = family.templates.len(),
        "selected chip family"
    );

    let cluster = KubeClusterClient::connect(args.kubeconfig.as_deref())
        .await
        .map(Arc::new)
        .map_err(|e| anyhow!("failed to create Kubernetes client: {e:?}"))?;

    let inventory = Arc::new(Inventory::new(provider, family));
    let settings = PluginSettings {
        node_name: args.node_name.clone(),
        plugin_dir: args.device_plugin_dir.clone(),
        kubelet_socket: args.kubelet_socket_path(),
        report_intervals: ReportIntervals::default(),
        handshake_offset: args.handshake_offset(),
    };
    let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
    let plugin = Arc::new(NpuDevicePlugin::new(inventory, cluster, settings, fatal_tx));

    let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let _watcher = events::watch_plugin_dir(
        &args.device_plugin_dir,
        &args.kubelet_socket_path(),
        event_tx.clone(),
    )?;
    let _signals = events::spawn_signal_listener(event_tx)?;

    Supervisor::new(plugin).run(event_rx, fatal_rx).await
}
