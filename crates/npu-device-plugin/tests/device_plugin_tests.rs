//! Drives a real plugin over Unix sockets against a fake kubelet.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use error_stack::Report;
use futures::StreamExt;
use npu_device_plugin::config::CapacityTemplate;
use npu_device_plugin::config::ChipFamilyConfig;
use npu_device_plugin::config::ReportIntervals;
use npu_device_plugin::domain::inventory::FileDeviceProvider;
use npu_device_plugin::domain::inventory::Inventory;
use npu_device_plugin::k8s::annotations::BindPhase;
use npu_device_plugin::k8s::device_plugin::api::device_plugin_client::DevicePluginClient;
use npu_device_plugin::k8s::device_plugin::api::registration_server::Registration;
use npu_device_plugin::k8s::device_plugin::api::registration_server::RegistrationServer;
use npu_device_plugin::k8s::device_plugin::api::AllocateRequest;
use npu_device_plugin::k8s::device_plugin::api::ContainerAllocateRequest;
use npu_device_plugin::k8s::device_plugin::api::Empty;
use npu_device_plugin::k8s::device_plugin::api::RegisterRequest;
use npu_device_plugin::k8s::device_plugin::uds_channel;
use npu_device_plugin::k8s::device_plugin::NpuDevicePlugin;
use npu_device_plugin::k8s::device_plugin::PluginSettings;
use npu_device_plugin::k8s::ClusterClient;
use npu_device_plugin::k8s::KubernetesError;
use npu_device_plugin::k8s::PendingPod;
use similar_asserts::assert_eq;
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tonic::Request;
use tonic::Response;
use tonic::Status;

const ALLOCATED_KEY: &str = "vnpu.io/Ascend910B3-devices-allocated";

const LISTING: &str = r#"
chipName: 910B3
devices:
  - logicId: 0
    uuid: A
    physicalId: 2
    cardId: 1
    deviceId: 0
    numa: 0
  - logicId: 1
    uuid: B
    physicalId: 5
    cardId: 2
    deviceId: 1
"#;

/// Kubelet registration endpoint that remembers every request.
#[derive(Default, Clone)]
struct FakeKubelet {
    requests: Arc<Mutex<Vec<RegisterRequest>>>,
}

#[tonic::async_trait]
impl Registration for FakeKubelet {
    async fn register(
        &self,
        request: Request<RegisterRequest>,
    ) -> Result<Response<Empty>, Status> {
        self.requests.lock().unwrap().push(request.into_inner());
        Ok(Response::new(Empty {}))
    }
}

fn serve_kubelet(socket: &Path) -> FakeKubelet {
    let kubelet = FakeKubelet::default();
    let listener = UnixListener::bind(socket).unwrap();
    let server = RegistrationServer::new(kubelet.clone());
    tokio::spawn(async move {
        tonic::transport::Server::builder()
            .add_service(server)
            .serve_with_incoming(tokio_stream::wrappers::UnixListenerStream::new(listener))
            .await
    });
    kubelet
}

#[derive(Default)]
struct RecordingCluster {
    pending: Mutex<Option<PendingPod>>,
    lock_releases: Mutex<usize>,
    bind_phases: Mutex<Vec<BindPhase>>,
    node_patches: Mutex<Vec<BTreeMap<String, String>>>,
}

impl RecordingCluster {
    fn set_pending(&self, allocation: &str) {
        *self.pending.lock().unwrap() = Some(PendingPod {
            namespace: "default".to_string(),
            name: "npu-pod".to_string(),
            annotations: BTreeMap::from([(ALLOCATED_KEY.to_string(), allocation.to_string())]),
        });
    }

    fn lock_releases(&self) -> usize {
        *self.lock_releases.lock().unwrap()
    }
}

#[async_trait]
impl ClusterClient for RecordingCluster {
    async fn pending_pod(&self, _node: &str) -> Result<Option<PendingPod>, Report<KubernetesError>> {
        Ok(self.pending.lock().unwrap().clone())
    }

    async fn set_bind_phase(
        &self,
        _pod: &PendingPod,
        phase: BindPhase,
    ) -> Result<(), Report<KubernetesError>> {
        self.bind_phases.lock().unwrap().push(phase);
        Ok(())
    }

    async fn release_node_lock(&self, _node: &str) -> Result<(), Report<KubernetesError>> {
        *self.lock_releases.lock().unwrap() += 1;
        Ok(())
    }

    async fn patch_node_annotations(
        &self,
        _node: &str,
        annotations: BTreeMap<String, String>,
    ) -> Result<(), Report<KubernetesError>> {
        self.node_patches.lock().unwrap().push(annotations);
        Ok(())
    }
}

fn family() -> ChipFamilyConfig {
    ChipFamilyConfig {
        chip_name: "910B3".to_string(),
        common_word: "Ascend910B3".to_string(),
        resource_name: "huawei.com/Ascend910B3".to_string(),
        memory_allocatable: 32768,
        memory_capacity: 32768,
        ai_core: 20,
        max_virtual_devices: None,
        templates: vec![
            CapacityTemplate {
                name: "vir08".to_string(),
                memory: 8192,
                ai_core: 5,
            },
            CapacityTemplate {
                name: "vir16".to_string(),
                memory: 16384,
                ai_core: 10,
            },
        ],
    }
}

struct Harness {
    dir: tempfile::TempDir,
    kubelet: FakeKubelet,
    cluster: Arc<RecordingCluster>,
    plugin: NpuDevicePlugin,
    _fatal: mpsc::UnboundedReceiver<Report<npu_device_plugin::k8s::device_plugin::PluginError>>,
}

fn harness(listing: &str, intervals: ReportIntervals) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let inventory_file = dir.path().join("inventory.yaml");
    std::fs::write(&inventory_file, listing).unwrap();
    let kubelet_socket = dir.path().join("kubelet.sock");
    let kubelet = serve_kubelet(&kubelet_socket);

    let inventory = Arc::new(Inventory::new(
        Arc::new(FileDeviceProvider::new(inventory_file)),
        family(),
    ));
    let cluster = Arc::new(RecordingCluster::default());
    let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
    let plugin = NpuDevicePlugin::new(
        inventory,
        cluster.clone(),
        PluginSettings {
            node_name: "node-a".to_string(),
            plugin_dir: dir.path().to_path_buf(),
            kubelet_socket,
            report_intervals: intervals,
            handshake_offset: chrono::Duration::zero(),
        },
        fatal_tx,
    );

    Harness {
        dir,
        kubelet,
        cluster,
        plugin,
        _fatal: fatal_rx,
    }
}

fn slow_reports() -> ReportIntervals {
    ReportIntervals {
        initial: Duration::from_secs(60),
        steady: Duration::from_secs(60),
        on_error: Duration::from_secs(60),
    }
}

async fn plugin_client(h: &Harness) -> DevicePluginClient<tonic::transport::Channel> {
    let channel = uds_channel(&h.plugin.socket_path()).await.unwrap();
    DevicePluginClient::new(channel)
}

fn allocate_request() -> AllocateRequest {
    AllocateRequest {
        container_requests: vec![ContainerAllocateRequest {
            devices_ids: vec!["A-0".to_string()],
        }],
    }
}

#[test_log::test(tokio::test)]
async fn start_registers_with_kubelet() {
    let h = harness(LISTING, slow_reports());

    h.plugin.start().await.unwrap();

    let requests = h.kubelet.requests.lock().unwrap().clone();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].version, "v1beta1");
    assert_eq!(requests[0].endpoint, "Ascend910B3.sock");
    assert_eq!(requests[0].resource_name, "huawei.com/Ascend910B3");
    let options = requests[0].options.expect("options are sent");
    assert!(!options.get_preferred_allocation_available);
    assert!(h.dir.path().join("Ascend910B3.sock").exists());

    h.plugin.stop().unwrap();
}

#[test_log::test(tokio::test)]
async fn allocate_over_the_socket() {
    let h = harness(LISTING, slow_reports());
    h.plugin.start().await.unwrap();
    h.cluster.set_pending(r#"[{"uuid":"A","temp":"vir08"}]"#);

    let response = plugin_client(&h)
        .await
        .allocate(allocate_request())
        .await
        .unwrap()
        .into_inner();

    let envs = &response.container_responses[0].envs;
    assert_eq!(envs.get("VISIBLE_DEVICES").map(String::as_str), Some("2"));
    assert_eq!(envs.get("VNPU_SPECS").map(String::as_str), Some("vir08"));
    assert_eq!(h.cluster.lock_releases(), 1);
    assert_eq!(*h.cluster.bind_phases.lock().unwrap(), vec![BindPhase::Success]);

    h.plugin.stop().unwrap();
}

#[test_log::test(tokio::test)]
async fn ghost_device_is_denied_and_lock_released() {
    let h = harness(LISTING, slow_reports());
    h.plugin.start().await.unwrap();
    h.cluster.set_pending(r#"[{"uuid":"ghost"}]"#);

    let status = plugin_client(&h)
        .await
        .allocate(allocate_request())
        .await
        .unwrap_err();

    assert_eq!(status.code(), tonic::Code::NotFound);
    assert_eq!(h.cluster.lock_releases(), 1);
    assert_eq!(*h.cluster.bind_phases.lock().unwrap(), vec![BindPhase::Failed]);

    h.plugin.stop().unwrap();
}

#[test_log::test(tokio::test)]
async fn watch_stream_follows_reporter_refresh() {
    let unhealthy = LISTING.replace("    deviceId: 1\n", "    deviceId: 1\n    healthy: false\n");
    let h = harness(
        &unhealthy,
        ReportIntervals {
            initial: Duration::from_secs(1),
            steady: Duration::from_secs(60),
            on_error: Duration::from_secs(60),
        },
    );
    h.plugin.start().await.unwrap();

    let mut stream = plugin_client(&h)
        .await
        .list_and_watch(Empty {})
        .await
        .unwrap()
        .into_inner();

    let initial = stream.next().await.unwrap().unwrap();
    let ids: Vec<&str> = initial.devices.iter().map(|d| d.id.as_str()).collect();
    assert_eq!(ids, vec!["A-0", "A-1", "A-2", "A-3", "B-0", "B-1", "B-2", "B-3"]);
    assert_eq!(initial.devices[4].health, "Unhealthy");
    assert_eq!(initial.devices[4].topology, None);
    assert!(initial.devices[0].topology.is_some());

    // device B recovers before the reporter's first tick
    std::fs::write(h.dir.path().join("inventory.yaml"), LISTING).unwrap();

    let update = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("reporter refresh should push a new list")
        .unwrap()
        .unwrap();
    assert!(update.devices.iter().all(|d| d.health == "Healthy"));

    let extra = tokio::time::timeout(Duration::from_millis(500), stream.next()).await;
    assert!(extra.is_err(), "one notification yields one emission");
    assert!(!h.cluster.node_patches.lock().unwrap().is_empty());

    h.plugin.stop().unwrap();
}

#[test_log::test(tokio::test)]
async fn device_failing_after_start_reaches_watchers_and_node() {
    let h = harness(
        LISTING,
        ReportIntervals {
            initial: Duration::from_secs(1),
            steady: Duration::from_secs(60),
            on_error: Duration::from_secs(60),
        },
    );
    h.plugin.start().await.unwrap();

    let mut stream = plugin_client(&h)
        .await
        .list_and_watch(Empty {})
        .await
        .unwrap()
        .into_inner();
    let initial = stream.next().await.unwrap().unwrap();
    assert!(initial.devices.iter().all(|d| d.health == "Healthy"));

    let failing = LISTING.replace("    deviceId: 1\n", "    deviceId: 1\n    healthy: false\n");
    std::fs::write(h.dir.path().join("inventory.yaml"), failing).unwrap();

    let update = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("polled failure should push a new list")
        .unwrap()
        .unwrap();
    let unhealthy: Vec<&str> = update
        .devices
        .iter()
        .filter(|d| d.health == "Unhealthy")
        .map(|d| d.id.as_str())
        .collect();
    assert_eq!(unhealthy, vec!["B-0", "B-1", "B-2", "B-3"]);

    // the notification goes out before the node patch
    let register = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let last = h.cluster.node_patches.lock().unwrap().last().cloned();
            if let Some(patch) = last {
                break patch["vnpu.io/node-register-Ascend910B3"].clone();
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("node registration should be published");
    assert!(register.contains(r#""id":"B""#));
    assert!(register.contains(r#""health":false"#));

    h.plugin.stop().unwrap();
}

#[test_log::test(tokio::test)]
async fn stop_twice_and_restart() {
    let h = harness(LISTING, slow_reports());
    h.plugin.start().await.unwrap();

    h.plugin.stop().unwrap();
    h.plugin.stop().unwrap();
    assert!(!h.plugin.socket_path().exists());
    assert!(!h.plugin.is_serving());

    h.plugin.start().await.unwrap();
    assert!(h.plugin.is_serving());
    assert_eq!(h.kubelet.requests.lock().unwrap().len(), 2);
    h.plugin.stop().unwrap();
}

#[test_log::test(tokio::test)]
async fn start_fails_when_inventory_is_unreadable() {
    let h = harness("chipName: [unclosed", slow_reports());

    assert!(h.plugin.start().await.is_err());
    assert!(!h.plugin.is_serving());
    assert!(h.kubelet.requests.lock().unwrap().is_empty());
}
