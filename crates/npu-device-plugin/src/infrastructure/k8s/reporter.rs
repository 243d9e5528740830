//! Periodic self-registration of the node's devices.
//!
//! Every tick polls device health, refreshes the inventory while any device is
//! unhealthy (or was in the last snapshot), then republishes the device list
//! and a handshake timestamp as node annotations for the scheduler.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::DateTime;
use chrono::TimeZone;
use error_stack::Report;
use error_stack::ResultExt;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::annotations;
use super::ClusterClient;
use crate::config::ReportIntervals;
use crate::domain::inventory::Inventory;
use crate::domain::inventory::PhysicalDevice;

#[derive(Debug, derive_more::Display)]
pub enum ReportError {
    #[display("Failed to poll device health")]
    Poll,
    #[display("Failed to refresh unhealthy devices")]
    Refresh,
    #[display("Failed to encode the device list")]
    Encode,
    #[display("Failed to publish node annotations")]
    Publish,
}

impl core::error::Error for ReportError {}

/// Entry of the registration annotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDeviceInfo {
    pub index: u32,
    pub id: String,
    /// virtual slots offered by the device
    pub count: u32,
    pub memory: u64,
    pub cores: u32,
    #[serde(rename = "type")]
    pub device_type: String,
    pub numa: i32,
    pub health: bool,
}

impl NodeDeviceInfo {
    fn new(device: &PhysicalDevice, count: u32, device_type: &str) -> Self {
        Self {
            index: device.physical_index,
            id: device.uuid.clone(),
            count,
            memory: device.memory,
            cores: device.cores,
            device_type: device_type.to_string(),
            numa: device.numa,
            health: device.healthy,
        }
    }
}

/// `Reported <local time + offset>`
pub fn handshake_value<Tz>(now: DateTime<Tz>, offset: chrono::Duration) -> String
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    format!("Reported {}", (now + offset).format("%Y-%m-%d %H:%M:%S"))
}

pub struct Reporter {
    inventory: Arc<Inventory>,
    cluster: Arc<dyn ClusterClient>,
    node_name: String,
    health: Arc<watch::Sender<u64>>,
    intervals: ReportIntervals,
    handshake_offset: chrono::Duration,
}

impl Reporter {
    pub fn new(
        inventory: Arc<Inventory>,
        cluster: Arc<dyn ClusterClient>,
        node_name: String,
        health: Arc<watch::Sender<u64>>,
        intervals: ReportIntervals,
        handshake_offset: chrono::Duration,
    ) -> Self {
        Self {
            inventory,
            cluster,
            node_name,
            health,
            intervals,
            handshake_offset,
        }
    }

    /// Tick until `stop` fires. Failed ticks are logged and retried sooner.
    pub async fn run(self, stop: CancellationToken) {
        info!(node = %self.node_name, "starting device reporter");
        let mut delay = self.intervals.initial;

        loop {
            tokio::select! {
                _ = stop.cancelled() => {
                    info!("device reporter stopped");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            delay = match self.tick().await {
                Ok(()) => self.intervals.steady,
                Err(e) => {
                    warn!("device report failed, retrying in {:?}: {e:?}", self.intervals.on_error);
                    self.intervals.on_error
                }
            };
        }
    }

    pub(crate) async fn tick(&self) -> Result<(), Report<ReportError>> {
        let polled = self
            .inventory
            .poll_unhealthy()
            .change_context(ReportError::Poll)?;
        let cached = self.inventory.unhealthy();
        if let Some(first) = polled.first().or(cached.first()) {
            info!(logic_index = first, "unhealthy device seen, refreshing inventory");
            self.inventory
                .refresh()
                .change_context(ReportError::Refresh)?;
            self.health.send_modify(|v| *v = v.wrapping_add(1));
        }

        let annotations = self.annotations(chrono::Local::now())?;
        self.cluster
            .patch_node_annotations(&self.node_name, annotations)
            .await
            .change_context(ReportError::Publish)?;
        debug!(node = %self.node_name, "published device registration");
        Ok(())
    }

    fn annotations<Tz>(&self, now: DateTime<Tz>) -> Result<BTreeMap<String, String>, Report<ReportError>>
    where
        Tz: TimeZone,
        Tz::Offset: std::fmt::Display,
    {
        let family = self.inventory.family();
        let slots = self.inventory.virtual_slots_per_device();
        let devices: Vec<NodeDeviceInfo> = self
            .inventory
            .snapshot()
            .iter()
            .map(|d| NodeDeviceInfo::new(d, slots, &family.common_word))
            .collect();
        let register = serde_json::to_string(&devices).change_context(ReportError::Encode)?;

        Ok(BTreeMap::from([
            (annotations::node_register(&family.common_word), register),
            (
                annotations::node_handshake(&family.common_word),
                handshake_value(now, self.handshake_offset),
            ),
        ]))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use similar_asserts::assert_eq;

    use super::*;
    use crate::domain::inventory::snapshot::tests::raw_device;
    use crate::domain::inventory::snapshot::tests::test_family;
    use crate::domain::inventory::snapshot::tests::MockDeviceProvider;
    use crate::infrastructure::k8s::device_plugin::service::tests::MockClusterClient;

    fn fast_intervals() -> ReportIntervals {
        ReportIntervals {
            initial: Duration::from_millis(10),
            steady: Duration::from_millis(50),
            on_error: Duration::from_millis(20),
        }
    }

    struct Fixture {
        provider: Arc<MockDeviceProvider>,
        cluster: Arc<MockClusterClient>,
        health: Arc<watch::Sender<u64>>,
        reporter: Reporter,
    }

    fn fixture(offset: chrono::Duration) -> Fixture {
        let provider = Arc::new(MockDeviceProvider::with_devices(vec![
            (0, raw_device("A", 2)),
            (1, raw_device("B", 5)),
        ]));
        let inventory = Arc::new(Inventory::new(
            provider.clone(),
            test_family(&[4096, 8192]),
        ));
        inventory.refresh().unwrap();
        let cluster = Arc::new(MockClusterClient::default());
        let (health, _) = watch::channel(0u64);
        let health = Arc::new(health);
        let reporter = Reporter::new(
            inventory,
            cluster.clone(),
            "node-a".to_string(),
            health.clone(),
            fast_intervals(),
            offset,
        );
        Fixture {
            provider,
            cluster,
            health,
            reporter,
        }
    }

    #[test]
    fn handshake_applies_offset() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 23, 59, 30).unwrap();
        assert_eq!(
            handshake_value(now, chrono::Duration::seconds(45)),
            "Reported 2024-03-02 00:00:15"
        );
    }

    #[test]
    fn registration_lists_every_device() {
        let f = fixture(chrono::Duration::zero());
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();

        let annotations = f.reporter.annotations(now).unwrap();

        assert_eq!(
            annotations.get("vnpu.io/node-handshake-Ascend910B3").map(String::as_str),
            Some("Reported 2024-03-01 12:00:00")
        );
        let register = annotations
            .get("vnpu.io/node-register-Ascend910B3")
            .expect("registration annotation");
        let devices: Vec<NodeDeviceInfo> = serde_json::from_str(register).unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(
            devices[0],
            NodeDeviceInfo {
                index: 2,
                id: "A".to_string(),
                count: 8,
                memory: 32768,
                cores: 20,
                device_type: "Ascend910B3".to_string(),
                numa: 0,
                health: true,
            }
        );
        assert!(register.contains(r#""type":"Ascend910B3""#));
    }

    #[tokio::test]
    async fn healthy_tick_publishes_without_notification() {
        let f = fixture(chrono::Duration::zero());
        let health = f.health.subscribe();

        f.reporter.tick().await.unwrap();

        assert_eq!(f.cluster.node_patches.lock().unwrap().len(), 1);
        assert!(!health.has_changed().unwrap());
    }

    #[tokio::test]
    async fn unhealthy_device_triggers_refresh_and_one_notification() {
        let f = fixture(chrono::Duration::zero());
        let mut health = f.health.subscribe();

        f.provider.set_health(1, false);
        f.reporter.inventory.refresh().unwrap();
        f.provider.set_health(1, true);

        f.reporter.tick().await.unwrap();

        assert!(health.has_changed().unwrap());
        health.borrow_and_update();
        assert!(f.reporter.inventory.unhealthy().is_empty());
        assert!(!health.has_changed().unwrap());
    }

    #[tokio::test]
    async fn device_failing_after_start_is_detected() {
        let f = fixture(chrono::Duration::zero());
        let mut health = f.health.subscribe();

        f.provider.set_health(1, false);
        f.reporter.tick().await.unwrap();

        assert!(health.has_changed().unwrap());
        health.borrow_and_update();
        assert_eq!(f.reporter.inventory.unhealthy(), vec![1]);

        let patches = f.cluster.node_patches.lock().unwrap();
        let register = &patches[0]["vnpu.io/node-register-Ascend910B3"];
        let devices: Vec<NodeDeviceInfo> = serde_json::from_str(register).unwrap();
        assert!(devices[0].health);
        assert!(!devices[1].health);
    }

    #[tokio::test]
    async fn failed_poll_skips_publication() {
        let f = fixture(chrono::Duration::zero());
        f.provider.fail_on_query(0);

        let err = f.reporter.tick().await.unwrap_err();
        assert!(matches!(err.current_context(), ReportError::Poll));
        assert!(f.cluster.node_patches.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn publish_failure_is_reported() {
        let f = fixture(chrono::Duration::zero());
        *f.cluster.fail_publish.lock().unwrap() = true;

        let err = f.reporter.tick().await.unwrap_err();
        assert!(matches!(err.current_context(), ReportError::Publish));
    }

    #[test_log::test(tokio::test)]
    async fn run_keeps_publishing_until_stopped() {
        let f = fixture(chrono::Duration::zero());
        let cluster = f.cluster.clone();
        let stop = CancellationToken::new();
        let task = tokio::spawn(f.reporter.run(stop.clone()));

        tokio::time::sleep(Duration::from_millis(200)).await;
        stop.cancel();
        task.await.unwrap();

        let published = cluster.node_patches.lock().unwrap().len();
        assert!(published >= 2, "expected repeated reports, got {published}");
    }

    #[test_log::test(tokio::test)]
    async fn run_survives_publish_failures() {
        let f = fixture(chrono::Duration::zero());
        let cluster = f.cluster.clone();
        *cluster.fail_publish.lock().unwrap() = true;
        let stop = CancellationToken::new();
        let task = tokio::spawn(f.reporter.run(stop.clone()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        *cluster.fail_publish.lock().unwrap() = false;
        tokio::time::sleep(Duration::from_millis(150)).await;
        stop.cancel();
        task.await.unwrap();

        assert!(!cluster.node_patches.lock().unwrap().is_empty());
    }
}
