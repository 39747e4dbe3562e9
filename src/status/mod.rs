pub mod firmware;
pub mod software;

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, error};

use crate::{
    config::Config,
    data_model::{
        BoardConfigStatus, ComponentStatus, DesiredComponent, DesiredLayer, DesiredService,
        DesiredStatus, LayerStatus, ServiceStatus, StatusItem, UnitStatus,
    },
    downloads::Downloader,
    status::{firmware::FirmwareManager, software::SoftwareManager},
    storage::Storage,
    update_machine::UpdateState,
};

/// Sends unit status reports to the cloud. Fire-and-forget: failures are
/// logged, never retried here.
#[async_trait]
pub trait StatusSender: Send + Sync {
    async fn send_unit_status(&self, unit_status: UnitStatus) -> Result<()>;
}

/// Service and layer lifecycle operations provided by the service manager.
#[async_trait]
pub trait SoftwareUpdater: Send + Sync {
    async fn get_users_status(
        &self,
        users: &[String],
    ) -> Result<(Vec<ServiceStatus>, Vec<LayerStatus>)>;
    async fn get_all_status(&self) -> Result<(Vec<ServiceStatus>, Vec<LayerStatus>)>;
    async fn install_service(
        &self,
        users: &[String],
        service: &DesiredService,
    ) -> Result<String>;
    async fn remove_service(&self, users: &[String], service: &ServiceStatus) -> Result<()>;
    async fn install_layer(&self, layer: &DesiredLayer) -> Result<()>;
}

/// Result of a component update round: the accumulated component statuses
/// plus the update error, when any.
#[derive(Debug, Clone, Default)]
pub struct ComponentsUpdateResult {
    pub components: Vec<ComponentStatus>,
    pub error: Option<String>,
}

/// System component update operations, satisfied by the UM controller.
#[async_trait]
pub trait FirmwareUpdater: Send + Sync {
    async fn get_status(&self) -> Result<Vec<ComponentStatus>>;
    async fn update_components(
        &self,
        components: Vec<DesiredComponent>,
    ) -> Result<ComponentsUpdateResult>;
}

/// Board configuration operations.
#[async_trait]
pub trait BoardConfigUpdater: Send + Sync {
    async fn get_status(&self) -> Result<BoardConfigStatus>;
    async fn get_board_config_version(&self, config: &serde_json::Value) -> Result<String>;
    async fn check_board_config(&self, config: &serde_json::Value) -> Result<String>;
    async fn update_board_config(&self, config: &serde_json::Value) -> Result<()>;
}

/// SOTA status broadcast on every software manager transition.
#[derive(Debug, Clone, Serialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SoftwareUpdateStatus {
    pub state: UpdateState,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    pub install_services: Vec<ServiceStatus>,
    pub remove_services: Vec<ServiceStatus>,
    pub install_layers: Vec<LayerStatus>,
    pub remove_layers: Vec<LayerStatus>,
}

/// FOTA status broadcast on every firmware manager transition.
#[derive(Debug, Clone, Serialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct FirmwareUpdateStatus {
    pub state: UpdateState,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    pub components: Vec<ComponentStatus>,
}

/// In-memory model of every item's lifecycle, batched into unit status
/// reports.
///
/// Each item holds an ordered collection of status descriptors: an
/// `installed` descriptor collapses the collection to itself, otherwise
/// descriptors are keyed by version and re-reports update in place, so
/// several failed versions of one item stay visible together.
pub(crate) struct StatusTables {
    sender: Arc<dyn StatusSender>,
    send_period: Duration,
    state: Mutex<TablesState>,
}

#[derive(Default)]
struct TablesState {
    board_config: Vec<StatusItem>,
    components: HashMap<String, Vec<StatusItem>>,
    layers: HashMap<String, Vec<StatusItem>>,
    services: HashMap<String, Vec<StatusItem>>,
    send_timer: Option<JoinHandle<()>>,
}

impl StatusTables {
    pub(crate) fn new(sender: Arc<dyn StatusSender>, send_period: Duration) -> Self {
        Self {
            sender,
            send_period,
            state: Mutex::new(TablesState::default()),
        }
    }

    pub(crate) fn update_board_config_status(self: &Arc<Self>, info: BoardConfigStatus) {
        debug!(
            status = %info.status,
            vendor_version = %info.vendor_version,
            error = %info.error,
            "Update board config status"
        );

        let mut state = self.state.lock().unwrap();
        apply_descriptor(&mut state.board_config, StatusItem::BoardConfig(info));
        self.status_changed(&mut state);
    }

    pub(crate) fn update_component_status(self: &Arc<Self>, info: ComponentStatus) {
        debug!(
            id = %info.id,
            status = %info.status,
            vendor_version = %info.vendor_version,
            error = %info.error,
            "Update component status"
        );

        let mut state = self.state.lock().unwrap();
        let collection = state.components.entry(info.id.clone()).or_default();
        apply_descriptor(collection, StatusItem::Component(info));
        self.status_changed(&mut state);
    }

    pub(crate) fn update_layer_status(self: &Arc<Self>, info: LayerStatus) {
        debug!(
            id = %info.id,
            digest = %info.digest,
            status = %info.status,
            version = info.aos_version,
            error = %info.error,
            "Update layer status"
        );

        let mut state = self.state.lock().unwrap();
        let collection = state.layers.entry(info.digest.clone()).or_default();
        apply_descriptor(collection, StatusItem::Layer(info));
        self.status_changed(&mut state);
    }

    pub(crate) fn update_service_status(self: &Arc<Self>, info: ServiceStatus) {
        debug!(
            id = %info.id,
            status = %info.status,
            version = info.aos_version,
            error = %info.error,
            "Update service status"
        );

        let mut state = self.state.lock().unwrap();
        let collection = state.services.entry(info.id.clone()).or_default();
        apply_descriptor(collection, StatusItem::Service(info));
        self.status_changed(&mut state);
    }

    /// Applies a descriptor without arming the send timer; used while
    /// seeding a forced snapshot that is transmitted immediately after.
    fn process_status(&self, item: StatusItem) {
        let mut state = self.state.lock().unwrap();

        match item {
            StatusItem::BoardConfig(_) => apply_descriptor(&mut state.board_config, item),
            StatusItem::Component(ref info) => {
                let key = info.id.clone();
                apply_descriptor(state.components.entry(key).or_default(), item);
            }
            StatusItem::Layer(ref info) => {
                let key = info.digest.clone();
                apply_descriptor(state.layers.entry(key).or_default(), item);
            }
            StatusItem::Service(ref info) => {
                let key = info.id.clone();
                apply_descriptor(state.services.entry(key).or_default(), item);
            }
        }
    }

    fn clear(&self) {
        let mut state = self.state.lock().unwrap();
        state.board_config.clear();
        state.components.clear();
        state.layers.clear();
        state.services.clear();
    }

    /// Arms the batch timer; a timer armed earlier keeps its cycle and
    /// picks up this edit with it.
    fn status_changed(self: &Arc<Self>, state: &mut TablesState) {
        if state.send_timer.is_some() {
            return;
        }

        let tables = self.clone();

        state.send_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(tables.send_period).await;

            let snapshot = {
                let mut state = tables.state.lock().unwrap();
                state.send_timer = None;
                snapshot(&state)
            };

            tables.transmit(snapshot).await;
        }));
    }

    /// Builds and transmits a snapshot immediately, cancelling any pending
    /// timer cycle.
    async fn send_now(&self) {
        let snapshot = {
            let mut state = self.state.lock().unwrap();

            if let Some(timer) = state.send_timer.take() {
                timer.abort();
            }

            snapshot(&state)
        };

        self.transmit(snapshot).await;
    }

    async fn transmit(&self, unit_status: UnitStatus) {
        if let Err(err) = self.sender.send_unit_status(unit_status).await {
            error!("Can't send unit status: {err}");
        }
    }

    fn stop(&self) {
        if let Some(timer) = self.state.lock().unwrap().send_timer.take() {
            timer.abort();
        }
    }
}

fn apply_descriptor(collection: &mut Vec<StatusItem>, descriptor: StatusItem) {
    if descriptor.status() == crate::data_model::ItemState::Installed {
        *collection = vec![descriptor];
        return;
    }

    for existing in collection.iter_mut() {
        if existing.version() == descriptor.version() {
            *existing = descriptor;
            return;
        }
    }

    collection.push(descriptor);
}

fn snapshot(state: &TablesState) -> UnitStatus {
    let mut unit_status = UnitStatus::default();

    for item in &state.board_config {
        if let StatusItem::BoardConfig(info) = item {
            unit_status.board_config.push(info.clone());
        }
    }

    for collection in state.components.values() {
        for item in collection {
            if let StatusItem::Component(info) = item {
                unit_status.components.push(info.clone());
            }
        }
    }

    for collection in state.layers.values() {
        for item in collection {
            if let StatusItem::Layer(info) = item {
                unit_status.layers.push(info.clone());
            }
        }
    }

    for collection in state.services.values() {
        for item in collection {
            if let StatusItem::Service(info) = item {
                unit_status.services.push(info.clone());
            }
        }
    }

    unit_status
}

/// Unit status handler: fans desired-state documents out to the firmware
/// and software managers and aggregates their item statuses into batched
/// unit status reports.
pub struct UnitStatusHandler {
    lock: tokio::sync::Mutex<()>,
    tables: Arc<StatusTables>,
    firmware: Arc<FirmwareManager>,
    software: Arc<SoftwareManager>,
    decrypt_dir: String,
}

impl UnitStatusHandler {
    #[allow(clippy::too_many_arguments)]
    pub async fn new(
        config: &Config,
        board_config_updater: Arc<dyn BoardConfigUpdater>,
        firmware_updater: Arc<dyn FirmwareUpdater>,
        software_updater: Arc<dyn SoftwareUpdater>,
        downloader: Arc<dyn Downloader>,
        storage: Arc<dyn Storage>,
        status_sender: Arc<dyn StatusSender>,
    ) -> Result<Arc<Self>> {
        debug!("Create unit status handler");

        let tables = Arc::new(StatusTables::new(
            status_sender,
            Duration::from_secs(config.unit_status_send_period),
        ));

        let firmware = FirmwareManager::new(
            tables.clone(),
            firmware_updater,
            board_config_updater,
            downloader.clone(),
            storage.clone(),
            Duration::from_secs(config.um_controller.update_ttl),
        )
        .await?;

        let software = SoftwareManager::new(
            tables.clone(),
            software_updater,
            downloader,
            storage,
            Duration::from_secs(config.sm_controller.update_ttl),
        )
        .await?;

        Ok(Arc::new(Self {
            lock: tokio::sync::Mutex::new(()),
            tables,
            firmware,
            software,
            decrypt_dir: config.decrypt_dir.clone(),
        }))
    }

    /// Processes a desired-state document: purges stale decrypt artifacts
    /// when no update is running, then lets both managers diff and act.
    pub async fn process_desired_status(&self, desired: &DesiredStatus) {
        let _guard = self.lock.lock().await;

        if self.firmware.current_update_state() == UpdateState::NoUpdate
            && self.software.current_update_state() == UpdateState::NoUpdate
            && !self.decrypt_dir.is_empty()
        {
            if let Err(err) = clear_dir(&self.decrypt_dir) {
                error!("Error clearing decrypt dir: {err}");
            }
        }

        if let Err(err) = self.firmware.process_desired_status(desired).await {
            error!("Error processing firmware desired status: {err}");
        }

        if let Err(err) = self.software.process_desired_status(desired).await {
            error!("Error processing software desired status: {err}");
        }
    }

    /// Rebuilds the full snapshot from fresh manager queries and transmits
    /// it immediately.
    pub async fn send_unit_status(&self) -> Result<()> {
        let _guard = self.lock.lock().await;

        debug!("Send initial firmware and software statuses");

        self.tables.clear();

        for info in self.firmware.get_board_config_statuses().await? {
            self.tables.process_status(StatusItem::BoardConfig(info));
        }

        for info in self.firmware.get_component_statuses().await? {
            self.tables.process_status(StatusItem::Component(info));
        }

        let (services, layers) = self.software.get_item_statuses().await?;

        for info in services {
            self.tables.process_status(StatusItem::Service(info));
        }

        for info in layers {
            self.tables.process_status(StatusItem::Layer(info));
        }

        self.tables.send_now().await;

        Ok(())
    }

    pub async fn set_users(&self, users: Vec<String>) -> Result<()> {
        let _guard = self.lock.lock().await;

        self.software.set_users(users).await
    }

    pub async fn start_fota_update(&self) -> Result<()> {
        let _guard = self.lock.lock().await;

        self.firmware.start_update().await
    }

    pub async fn start_sota_update(&self) -> Result<()> {
        let _guard = self.lock.lock().await;

        self.software.start_update().await
    }

    pub fn fota_status_channel(&self) -> watch::Receiver<FirmwareUpdateStatus> {
        self.firmware.status_channel()
    }

    pub fn sota_status_channel(&self) -> watch::Receiver<SoftwareUpdateStatus> {
        self.software.status_channel()
    }

    pub async fn get_fota_status(&self) -> FirmwareUpdateStatus {
        self.firmware.get_current_status().await
    }

    pub async fn get_sota_status(&self) -> SoftwareUpdateStatus {
        self.software.get_current_status().await
    }

    pub async fn close(&self) {
        let _guard = self.lock.lock().await;

        debug!("Close unit status handler");

        self.tables.stop();
        self.firmware.close().await;
        self.software.close().await;
    }
}

fn clear_dir(dir: &str) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();

        debug!(file = %path.display(), "Remove outdated decrypt file");

        if path.is_dir() {
            std::fs::remove_dir_all(&path)?;
        } else {
            std::fs::remove_file(&path)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::data_model::ItemState;

    struct RecordingSender {
        sent: mpsc::UnboundedSender<UnitStatus>,
    }

    #[async_trait]
    impl StatusSender for RecordingSender {
        async fn send_unit_status(&self, unit_status: UnitStatus) -> Result<()> {
            let _ = self.sent.send(unit_status);
            Ok(())
        }
    }

    fn new_tables(period: Duration) -> (Arc<StatusTables>, mpsc::UnboundedReceiver<UnitStatus>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let tables = Arc::new(StatusTables::new(
            Arc::new(RecordingSender { sent: tx }),
            period,
        ));

        (tables, rx)
    }

    fn service(id: &str, version: u64, status: ItemState, error: &str) -> ServiceStatus {
        ServiceStatus {
            id: id.to_string(),
            aos_version: version,
            status,
            error: error.to_string(),
            state_checksum: String::new(),
        }
    }

    #[tokio::test]
    async fn test_installed_collapses_item_statuses() {
        let (tables, _rx) = new_tables(Duration::from_secs(600));

        tables.update_service_status(service("svc1", 1, ItemState::Error, "boom"));
        tables.update_service_status(service("svc1", 2, ItemState::Error, "boom again"));
        tables.update_service_status(service("svc1", 3, ItemState::Installed, ""));

        let state = tables.state.lock().unwrap();
        let collection = &state.services["svc1"];
        assert_eq!(collection.len(), 1);
        assert_eq!(collection[0].status(), ItemState::Installed);
        assert_eq!(collection[0].version(), "3");
    }

    #[tokio::test]
    async fn test_same_version_re_report_updates_in_place() {
        let (tables, _rx) = new_tables(Duration::from_secs(600));

        tables.update_service_status(service("svc1", 1, ItemState::Downloading, ""));
        tables.update_service_status(service("svc1", 2, ItemState::Downloading, ""));
        tables.update_service_status(service("svc1", 1, ItemState::Error, "gone"));

        let state = tables.state.lock().unwrap();
        let collection = &state.services["svc1"];
        assert_eq!(collection.len(), 2);
        assert_eq!(collection[0].status(), ItemState::Error);
        assert_eq!(collection[0].error(), "gone");
        assert_eq!(collection[1].status(), ItemState::Downloading);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_edits_are_batched() {
        let (tables, mut rx) = new_tables(Duration::from_secs(30));

        tables.update_service_status(service("svc1", 1, ItemState::Downloading, ""));
        tables.update_service_status(service("svc2", 1, ItemState::Downloading, ""));

        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(31)).await;

        let sent = rx.recv().await.unwrap();
        assert_eq!(sent.services.len(), 2);

        // The cycle is over; a new edit arms a new timer.
        tables.update_service_status(service("svc1", 1, ItemState::Installed, ""));
        tokio::time::sleep(Duration::from_secs(31)).await;

        let sent = rx.recv().await.unwrap();
        assert_eq!(sent.services.len(), 2);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_now_cancels_pending_timer() {
        let (tables, mut rx) = new_tables(Duration::from_secs(30));

        tables.update_service_status(service("svc1", 1, ItemState::Downloading, ""));
        tables.send_now().await;

        let sent = rx.recv().await.unwrap();
        assert_eq!(sent.services.len(), 1);

        // The aborted timer never produces a second report.
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(rx.try_recv().is_err());
    }
}
