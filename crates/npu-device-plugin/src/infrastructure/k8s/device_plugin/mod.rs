#![allow(clippy::doc_markdown)]
pub mod api {
    #![allow(clippy::doc_overindented_list_items)]
    tonic::include_proto!("v1beta1");
}

pub mod crash_budget;
pub mod service;

use std::path::Path;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;
use std::time::Instant;

use api::device_plugin_client::DevicePluginClient;
use api::device_plugin_server::DevicePluginServer;
use api::registration_client::RegistrationClient;
use api::Empty;
use api::RegisterRequest;
use error_stack::Report;
use error_stack::ResultExt;
use futures::Stream;
use hyper_util::rt::TokioIo;
use tokio::net::UnixListener;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tonic::transport::Endpoint;
use tonic::transport::Uri;
use tower::service_fn;
use tracing::error;
use tracing::info;
use tracing::warn;

pub use crash_budget::CrashBudget;
pub use service::DevicePluginService;
pub use service::HEALTHY;
pub use service::PLUGIN_OPTIONS;
pub use service::UNHEALTHY;

use super::reporter::Reporter;
use super::ClusterClient;
use crate::config::ReportIntervals;
use crate::domain::inventory::Inventory;

pub const API_VERSION: &str = "v1beta1";

const LIVENESS_TIMEOUT: Duration = Duration::from_secs(5);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);
const REBIND_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, derive_more::Display)]
pub enum PluginError {
    #[display("Failed to refresh the device inventory")]
    Inventory,
    #[display("Failed to prepare plugin socket {path}")]
    Socket { path: String },
    #[display("Plugin socket {path} is not answering")]
    Liveness { path: String },
    #[display("Failed to register with kubelet at {socket}")]
    Registration { socket: String },
    #[display("Device plugin server crashed {restarts} times within {window:?}")]
    CrashBudgetExhausted { restarts: u32, window: Duration },
}

impl core::error::Error for PluginError {}

/// Node and kubelet coordinates of one plugin instance.
#[derive(Debug, Clone)]
pub struct PluginSettings {
    pub node_name: String,
    pub plugin_dir: PathBuf,
    pub kubelet_socket: PathBuf,
    pub report_intervals: ReportIntervals,
    pub handshake_offset: chrono::Duration,
}

/// Kubelet device plugin for one NPU chip family.
///
/// Each successful [`start`](Self::start) opens a serving period that ends at
/// the next [`stop`](Self::stop). A server that keeps crashing within its
/// [`CrashBudget`] reports on the fatal channel handed to [`new`](Self::new).
pub struct NpuDevicePlugin {
    inventory: Arc<Inventory>,
    cluster: Arc<dyn ClusterClient>,
    settings: PluginSettings,
    health: Arc<watch::Sender<u64>>,
    fatal: mpsc::UnboundedSender<Report<PluginError>>,
    running: Mutex<Option<CancellationToken>>,
}

impl NpuDevicePlugin {
    pub fn new(
        inventory: Arc<Inventory>,
        cluster: Arc<dyn ClusterClient>,
        settings: PluginSettings,
        fatal: mpsc::UnboundedSender<Report<PluginError>>,
    ) -> Self {
        let (health, _) = watch::channel(0);
        Self {
            inventory,
            cluster,
            settings,
            health: Arc::new(health),
            fatal,
            running: Mutex::new(None),
        }
    }

    pub fn inventory(&self) -> &Arc<Inventory> {
        &self.inventory
    }

    /// `{plugin_dir}/{commonWord}.sock`
    pub fn socket_path(&self) -> PathBuf {
        self.settings.plugin_dir.join(self.endpoint())
    }

    fn endpoint(&self) -> String {
        format!("{}.sock", self.inventory.family().common_word)
    }

    pub fn is_serving(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Refresh the inventory, serve, verify the socket, register with kubelet
    /// and launch the reporter. Nothing keeps serving if any step fails.
    pub async fn start(&self) -> Result<(), Report<PluginError>> {
        let stop = CancellationToken::new();
        if let Some(previous) = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(stop.clone())
        {
            previous.cancel();
        }

        match self.try_start(&stop).await {
            Ok(()) => Ok(()),
            Err(report) => {
                if let Err(e) = self.stop() {
                    warn!("cleanup after failed start: {e:?}");
                }
                Err(report)
            }
        }
    }

    async fn try_start(&self, stop: &CancellationToken) -> Result<(), Report<PluginError>> {
        self.inventory
            .refresh()
            .change_context(PluginError::Inventory)?;

        let socket = self.socket_path();
        let incoming = listen_on(&socket)?;
        info!("gRPC server is bound to: {}", socket.display());

        let service = DevicePluginService::new(
            self.inventory.clone(),
            self.cluster.clone(),
            &self.settings.node_name,
            self.health.clone(),
            stop.clone(),
        );
        let rebind_socket = socket.clone();
        tokio::spawn(serve_supervised(
            incoming,
            move || listen_on(&rebind_socket),
            service,
            stop.clone(),
            self.fatal.clone(),
            CrashBudget::default(),
        ));

        probe_liveness(&socket).await?;
        self.register_with_kubelet().await?;

        let reporter = Reporter::new(
            self.inventory.clone(),
            self.cluster.clone(),
            self.settings.node_name.clone(),
            self.health.clone(),
            self.settings.report_intervals,
            self.settings.handshake_offset,
        );
        tokio::spawn(reporter.run(stop.clone()));

        info!(
            resource = %self.inventory.family().resource_name,
            "device plugin is serving"
        );
        Ok(())
    }

    /// End the current serving period. Calling it again is a no-op.
    pub fn stop(&self) -> Result<(), Report<PluginError>> {
        let Some(stop) = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return Ok(());
        };

        info!("stopping device plugin");
        stop.cancel();
        remove_socket(&self.socket_path())
    }

    async fn register_with_kubelet(&self) -> Result<(), Report<PluginError>> {
        let kubelet_socket = &self.settings.kubelet_socket;
        info!("registering device plugin with kubelet: {}", kubelet_socket.display());
        let context = || PluginError::Registration {
            socket: kubelet_socket.display().to_string(),
        };

        let channel = uds_channel(kubelet_socket)
            .await
            .change_context_lazy(context)?;
        let request = RegisterRequest {
            version: API_VERSION.to_string(),
            endpoint: self.endpoint(),
            resource_name: self.inventory.family().resource_name.clone(),
            options: Some(PLUGIN_OPTIONS),
        };
        RegistrationClient::new(channel)
            .register(request)
            .await
            .change_context_lazy(context)?;

        info!("successfully registered device plugin with kubelet");
        Ok(())
    }
}

fn remove_socket(path: &Path) -> Result<(), Report<PluginError>> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
            Err(Report::new(e).change_context(PluginError::Socket {
                path: path.display().to_string(),
            }))
        }
        _ => Ok(()),
    }
}

fn bind_listener(path: &Path) -> Result<UnixListener, Report<PluginError>> {
    remove_socket(path)?;
    UnixListener::bind(path).change_context_lazy(|| PluginError::Socket {
        path: path.display().to_string(),
    })
}

/// Connections accepted on the plugin socket.
type Incoming = Pin<Box<dyn Stream<Item = std::io::Result<UnixStream>> + Send>>;

fn listen_on(path: &Path) -> Result<Incoming, Report<PluginError>> {
    let listener = bind_listener(path)?;
    Ok(Box::pin(UnixListenerStream::new(listener)))
}

async fn probe_liveness(socket: &Path) -> Result<(), Report<PluginError>> {
    let context = || PluginError::Liveness {
        path: socket.display().to_string(),
    };
    let attempt = async {
        let channel = uds_channel(socket).await.change_context_lazy(context)?;
        DevicePluginClient::new(channel)
            .get_device_plugin_options(Empty {})
            .await
            .change_context_lazy(context)?;
        Ok::<(), Report<PluginError>>(())
    };

    tokio::time::timeout(LIVENESS_TIMEOUT, attempt)
        .await
        .map_err(|_| {
            Report::new(context()).attach_printable(format!("no answer within {LIVENESS_TIMEOUT:?}"))
        })?
}

/// Run the gRPC server until `stop`, serving again on a fresh `listen()`
/// after every unexpected exit while `budget` allows.
async fn serve_supervised<L>(
    mut incoming: Incoming,
    mut listen: L,
    service: DevicePluginService,
    stop: CancellationToken,
    fatal: mpsc::UnboundedSender<Report<PluginError>>,
    mut budget: CrashBudget,
) where
    L: FnMut() -> Result<Incoming, Report<PluginError>>,
{
    loop {
        let server = tonic::transport::Server::builder()
            .add_service(DevicePluginServer::new(service.clone()))
            .serve_with_incoming_shutdown(incoming, stop.clone().cancelled_owned());
        let mut handle = tokio::spawn(server);

        let outcome = tokio::select! {
            _ = stop.cancelled() => {
                info!("shutting down gRPC server");
                if tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await.is_err() {
                    warn!("gRPC server did not drain within {SHUTDOWN_GRACE:?}, aborting");
                    handle.abort();
                }
                return;
            }
            outcome = &mut handle => outcome,
        };
        if stop.is_cancelled() {
            return;
        }

        match outcome {
            Ok(Ok(())) => warn!("gRPC server exited unexpectedly"),
            Ok(Err(e)) => error!("gRPC server failed: {e}"),
            Err(e) => error!("gRPC server task panicked: {e}"),
        }

        incoming = loop {
            if let Err(report) = budget.record_crash(Instant::now()) {
                error!("giving up on device plugin server: {report:?}");
                if fatal.send(report).is_err() {
                    warn!("nobody is listening for fatal plugin errors");
                }
                return;
            }
            // a later serving period may own the socket by now
            if stop.is_cancelled() {
                return;
            }
            match listen() {
                Ok(incoming) => break incoming,
                Err(report) => error!("failed to rebind plugin socket: {report:?}"),
            }
            tokio::select! {
                _ = stop.cancelled() => return,
                _ = tokio::time::sleep(REBIND_DELAY) => {}
            }
        };
        info!("restarted gRPC server");
    }
}

/// Client channel over a Unix domain socket.
pub async fn uds_channel(socket_path: &Path) -> Result<Channel, tonic::transport::Error> {
    let socket_path = socket_path.to_path_buf();

    // the URL is a placeholder, the connector dials the socket
    Endpoint::from_static("http://tonic")
        .connect_with_connector(service_fn(move |_: Uri| {
            let socket_path = socket_path.clone();
            async move {
                match UnixStream::connect(socket_path).await {
                    Ok(stream) => Ok(TokioIo::new(stream)),
                    Err(e) => Err(Box::new(e) as Box<dyn std::error::Error + Send + Sync>),
                }
            }
        }))
        .await
}
