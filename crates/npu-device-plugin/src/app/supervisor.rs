//! Process-wide restart policy of the device plugin.

use std::sync::Arc;

use anyhow::anyhow;
use anyhow::Result;
use async_trait::async_trait;
use error_stack::Report;
use tokio::sync::mpsc;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::events::SupervisorEvent;
use crate::domain::inventory::InventoryError;
use crate::infrastructure::k8s::device_plugin::NpuDevicePlugin;
use crate::infrastructure::k8s::device_plugin::PluginError;

/// What the supervisor needs from the plugin it drives.
#[async_trait]
pub trait PluginLifecycle: Send + Sync {
    async fn start(&self) -> Result<(), Report<PluginError>>;

    fn stop(&self) -> Result<(), Report<PluginError>>;

    /// Release devices left over by workloads that are gone.
    fn cleanup_idle(&self) -> Result<(), Report<InventoryError>>;
}

#[async_trait]
impl PluginLifecycle for NpuDevicePlugin {
    async fn start(&self) -> Result<(), Report<PluginError>> {
        NpuDevicePlugin::start(self).await
    }

    fn stop(&self) -> Result<(), Report<PluginError>> {
        NpuDevicePlugin::stop(self)
    }

    fn cleanup_idle(&self) -> Result<(), Report<InventoryError>> {
        self.inventory().cleanup_idle()
    }
}

pub struct Supervisor<P> {
    plugin: Arc<P>,
}

impl<P: PluginLifecycle> Supervisor<P> {
    pub fn new(plugin: Arc<P>) -> Self {
        Self { plugin }
    }

    /// Start the plugin and react to events until termination.
    ///
    /// Returns `Ok` on a termination signal, an error when a start fails or the
    /// plugin reports a fatal condition.
    pub async fn run(
        &self,
        mut events: mpsc::Receiver<SupervisorEvent>,
        mut fatal: mpsc::UnboundedReceiver<Report<PluginError>>,
    ) -> Result<()> {
        self.plugin
            .start()
            .await
            .map_err(|e| anyhow!("failed to start device plugin: {e:?}"))?;

        let mut fatal_open = true;
        loop {
            tokio::select! {
                report = fatal.recv(), if fatal_open => {
                    let Some(report) = report else {
                        fatal_open = false;
                        continue;
                    };
                    error!("device plugin failed: {report:?}");
                    self.stop_logged();
                    return Err(anyhow!("device plugin failed: {report:?}"));
                }
                event = events.recv() => {
                    let Some(event) = event else {
                        info!("event sources closed, shutting down");
                        self.stop_logged();
                        return Ok(());
                    };
                    match event {
                        SupervisorEvent::SocketRecreated => {
                            self.restart("kubelet socket recreated").await?;
                        }
                        SupervisorEvent::RestartSignal => {
                            self.restart("restart signal").await?;
                        }
                        SupervisorEvent::Terminate(signal) => {
                            info!("received {signal}, shutting down");
                            self.stop_logged();
                            return Ok(());
                        }
                        SupervisorEvent::WatchError(message) => {
                            warn!("filesystem watch error: {message}");
                        }
                    }
                }
            }
        }
    }

    async fn restart(&self, reason: &str) -> Result<()> {
        info!("restarting device plugin: {reason}");
        if let Err(e) = self.plugin.cleanup_idle() {
            warn!("idle device cleanup failed: {e:?}");
        }
        self.stop_logged();
        self.plugin
            .start()
            .await
            .map_err(|e| anyhow!("failed to restart device plugin: {e:?}"))
    }

    fn stop_logged(&self) {
        if let Err(e) = self.plugin.stop() {
            warn!("failed to stop device plugin: {e:?}");
        }
    }
}
