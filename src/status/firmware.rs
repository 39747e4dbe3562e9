use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, Weak},
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{
    actions::ActionQueue,
    data_model::{
        BoardConfigStatus, Certificate, CertificateChain, ComponentStatus, DecryptData,
        DesiredComponent, DesiredStatus, DownloadResult, ItemState,
    },
    downloads::{self, Downloader},
    schedule::{ScheduleRule, ScheduleType},
    status::{BoardConfigUpdater, FirmwareUpdateStatus, FirmwareUpdater, StatusTables},
    storage::Storage,
    update_machine::{
        is_cancel_error, UpdateEvent, UpdateHandler, UpdateState, UpdateStateMachine,
        CANCELED_ERROR,
    },
};

const MAX_CONCURRENT_ACTIONS: usize = 10;

/// Immutable plan of one firmware update round: system components to
/// download and apply, plus an optional board configuration document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct FirmwareUpdate {
    #[serde(default)]
    pub schedule: ScheduleRule,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub board_config: Option<serde_json::Value>,
    #[serde(default)]
    pub components: Vec<DesiredComponent>,
    #[serde(default)]
    pub cert_chains: Vec<CertificateChain>,
    #[serde(default)]
    pub certs: Vec<Certificate>,
}

impl FirmwareUpdate {
    fn is_empty(&self) -> bool {
        self.components.is_empty() && self.board_config.is_none()
    }

    fn same_items(&self, other: &FirmwareUpdate) -> bool {
        fn components(update: &FirmwareUpdate) -> HashSet<(String, String)> {
            update
                .components
                .iter()
                .map(|component| (component.id.clone(), component.vendor_version.clone()))
                .collect()
        }

        components(self) == components(other) && self.board_config == other.board_config
    }
}

/// Persisted firmware manager record; round-trips through the firmware
/// update state slot.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct FirmwareState {
    #[serde(default)]
    current_state: UpdateState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    current_update: Option<FirmwareUpdate>,
    #[serde(default)]
    download_result: HashMap<String, DownloadResult>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    update_err: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ttl_date: Option<DateTime<Utc>>,
    #[serde(default)]
    component_statuses: HashMap<String, ComponentStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    board_config_status: Option<BoardConfigStatus>,
}

struct FirmwareInner {
    current_update: Option<FirmwareUpdate>,
    pending_update: Option<FirmwareUpdate>,
    download_result: HashMap<String, DownloadResult>,
    current_state: UpdateState,
    update_err: String,
    ttl_date: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct FirmwareStatuses {
    components: HashMap<String, ComponentStatus>,
    board_config: Option<BoardConfigStatus>,
}

enum Followup {
    None,
    Start { ttl: u64 },
    Reschedule(ScheduleRule),
    Cancel,
}

/// Reconciles desired system components and board configuration with the
/// installed state, driving downloads and the component updater.
pub(crate) struct FirmwareManager {
    this: Weak<FirmwareManager>,
    machine: Arc<UpdateStateMachine<FirmwareManager>>,
    tables: Arc<StatusTables>,
    updater: Arc<dyn FirmwareUpdater>,
    board_config_updater: Arc<dyn BoardConfigUpdater>,
    downloader: Arc<dyn Downloader>,
    storage: Arc<dyn Storage>,
    actions: ActionQueue,
    inner: tokio::sync::Mutex<FirmwareInner>,
    statuses: Mutex<FirmwareStatuses>,
    status_tx: watch::Sender<FirmwareUpdateStatus>,
}

impl FirmwareManager {
    pub(crate) async fn new(
        tables: Arc<StatusTables>,
        updater: Arc<dyn FirmwareUpdater>,
        board_config_updater: Arc<dyn BoardConfigUpdater>,
        downloader: Arc<dyn Downloader>,
        storage: Arc<dyn Storage>,
        default_ttl: Duration,
    ) -> Result<Arc<Self>> {
        let persisted = {
            let blob = storage.firmware_update_state()?;
            if blob.is_empty() {
                FirmwareState::default()
            } else {
                serde_json::from_slice::<FirmwareState>(&blob)?
            }
        };

        debug!(
            state = %persisted.current_state,
            error = %persisted.update_err,
            "New firmware manager"
        );

        let ttl_date = persisted.ttl_date;
        let (status_tx, _) = watch::channel(FirmwareUpdateStatus::default());

        let manager = Arc::new_cyclic(|weak: &Weak<FirmwareManager>| FirmwareManager {
            this: weak.clone(),
            machine: Arc::new(UpdateStateMachine::new(
                weak.clone(),
                persisted.current_state,
                default_ttl,
            )),
            tables,
            updater,
            board_config_updater,
            downloader,
            storage,
            actions: ActionQueue::new(MAX_CONCURRENT_ACTIONS),
            inner: tokio::sync::Mutex::new(FirmwareInner {
                current_update: persisted.current_update,
                pending_update: None,
                download_result: persisted.download_result,
                current_state: persisted.current_state,
                update_err: persisted.update_err,
                ttl_date,
            }),
            statuses: Mutex::new(FirmwareStatuses {
                components: persisted.component_statuses,
                board_config: persisted.board_config_status,
            }),
            status_tx,
        });

        manager.machine.init(ttl_date).await?;

        Ok(manager)
    }

    pub(crate) async fn close(&self) {
        debug!("Close firmware manager");

        self.machine.close().await;
    }

    pub(crate) fn current_update_state(&self) -> UpdateState {
        self.machine.current_state()
    }

    pub(crate) fn status_channel(&self) -> watch::Receiver<FirmwareUpdateStatus> {
        self.status_tx.subscribe()
    }

    pub(crate) async fn get_current_status(&self) -> FirmwareUpdateStatus {
        let inner = self.inner.lock().await;

        current_status(&inner)
    }

    /// Diffs the desired components and board configuration against the
    /// installed state and feeds the result into the update policy.
    pub(crate) async fn process_desired_status(&self, desired: &DesiredStatus) -> Result<()> {
        let followup = {
            let mut inner = self.inner.lock().await;

            let mut update = FirmwareUpdate {
                schedule: desired.fota_schedule.clone(),
                cert_chains: desired.cert_chains.clone(),
                certs: desired.certs.clone(),
                ..Default::default()
            };

            if let Some(board_config) = &desired.board_config {
                let desired_version = self
                    .board_config_updater
                    .get_board_config_version(board_config)
                    .await?;
                let current = self.board_config_updater.get_status().await?;

                if desired_version != current.vendor_version {
                    update.board_config = Some(board_config.clone());
                }
            }

            let current_components = self.updater.get_status().await?;

            'desired_components: for desired_component in &desired.components {
                for component in &current_components {
                    if desired_component.id == component.id
                        && desired_component.vendor_version == component.vendor_version
                        && component.status == ItemState::Installed
                    {
                        continue 'desired_components;
                    }
                }

                update.components.push(desired_component.clone());
            }

            if update.is_empty() {
                return Ok(());
            }

            self.new_update(&mut inner, update)?
        };

        self.run_followup(followup).await
    }

    /// Releases an update waiting on a trigger schedule.
    pub(crate) async fn start_update(&self) -> Result<()> {
        debug!("Start firmware update");

        self.machine.send_event(UpdateEvent::StartUpdate, "").await
    }

    /// Installed component view merged with the in-flight statuses of an
    /// active update.
    pub(crate) async fn get_component_statuses(&self) -> Result<Vec<ComponentStatus>> {
        let _inner = self.inner.lock().await;

        let mut component_statuses = self.updater.get_status().await?;

        if self.machine.current_state() != UpdateState::NoUpdate {
            let statuses = self.statuses.lock().unwrap();
            component_statuses.extend(statuses.components.values().cloned());
        }

        Ok(component_statuses)
    }

    pub(crate) async fn get_board_config_statuses(&self) -> Result<Vec<BoardConfigStatus>> {
        let _inner = self.inner.lock().await;

        let mut board_config_statuses = vec![self.board_config_updater.get_status().await?];

        if self.machine.current_state() != UpdateState::NoUpdate {
            let statuses = self.statuses.lock().unwrap();

            if let Some(info) = &statuses.board_config {
                board_config_statuses.push(info.clone());
            }
        }

        Ok(board_config_statuses)
    }

    fn new_update(&self, inner: &mut FirmwareInner, update: FirmwareUpdate) -> Result<Followup> {
        debug!("New firmware update");

        update.schedule.validate()?;

        let state = self.machine.current_state();

        if state == UpdateState::NoUpdate {
            let ttl = update.schedule.ttl;
            inner.current_update = Some(update);

            return Ok(Followup::Start { ttl });
        }

        let same_items = inner
            .current_update
            .as_ref()
            .map(|current| update.same_items(current))
            .unwrap_or(false);

        if same_items {
            let current_schedule = inner.current_update.as_ref().unwrap().schedule.clone();

            if update.schedule == current_schedule {
                return Ok(Followup::None);
            }

            if state == UpdateState::ReadyToUpdate
                && current_schedule.schedule_type != ScheduleType::Force
            {
                let schedule = update.schedule.clone();
                inner.current_update.as_mut().unwrap().schedule = schedule.clone();

                return Ok(Followup::Reschedule(schedule));
            }
        }

        inner.pending_update = Some(update);

        if self.machine.can_transition(UpdateEvent::Cancel) {
            Ok(Followup::Cancel)
        } else {
            Ok(Followup::None)
        }
    }

    async fn run_followup(&self, followup: Followup) -> Result<()> {
        match followup {
            Followup::None => Ok(()),

            Followup::Start { ttl } => {
                let deadline = self.machine.start_new_update(ttl).await?;
                self.inner.lock().await.ttl_date = Some(deadline);

                Ok(())
            }

            Followup::Reschedule(schedule) => {
                self.machine.schedule_update(&schedule);

                Ok(())
            }

            Followup::Cancel => {
                if let Err(err) = self.machine.send_event(UpdateEvent::Cancel, "").await {
                    debug!("Cancel event dropped: {err}");
                }

                Ok(())
            }
        }
    }

    async fn download_phase(&self, token: CancellationToken) {
        let mut finish_event = UpdateEvent::FinishDownload;

        let update = {
            let mut inner = self.inner.lock().await;
            inner.download_result = HashMap::new();
            inner.current_update.clone()
        };

        let Some(update) = update else {
            self.machine.finish_operation(&token, finish_event, "").await;
            return;
        };

        {
            let mut statuses = self.statuses.lock().unwrap();
            statuses.components.clear();
            statuses.board_config = None;
        }

        let mut request: HashMap<String, DecryptData> = HashMap::new();

        for component in &update.components {
            debug!(
                id = %component.id,
                vendor_version = %component.vendor_version,
                "Download component"
            );

            request.insert(component.id.clone(), component.decrypt.clone());
            self.set_component_status(ComponentStatus {
                id: component.id.clone(),
                vendor_version: component.vendor_version.clone(),
                aos_version: component.aos_version,
                status: ItemState::Downloading,
                ..Default::default()
            });
        }

        if request.is_empty() {
            self.machine.finish_operation(&token, finish_event, "").await;
            return;
        }

        // A partial component set is never applied, so the first failure
        // aborts the remaining downloads.
        let result = downloads::download_packages(
            self.downloader.clone(),
            &self.actions,
            &token,
            request,
            false,
            update.cert_chains.clone(),
            update.certs.clone(),
        )
        .await;

        for (id, item) in &result {
            if item.error.is_empty() {
                self.update_component_status_by_id(id, ItemState::Pending, "");
            } else {
                error!(id = %id, "Error downloading component: {}", item.error);
                self.update_component_status_by_id(id, ItemState::Error, &item.error);
            }
        }

        let download_err = downloads::download_error(&result);

        if !download_err.is_empty() {
            finish_event = UpdateEvent::Cancel;
        }

        self.inner.lock().await.download_result = result;

        self.machine
            .finish_operation(&token, finish_event, &download_err)
            .await;
    }

    async fn update_phase(&self, token: CancellationToken) {
        let mut update_err = String::new();

        let (update, download_result) = {
            let inner = self.inner.lock().await;
            (inner.current_update.clone(), inner.download_result.clone())
        };

        let Some(update) = update else {
            self.machine
                .finish_operation(&token, UpdateEvent::FinishUpdate, "")
                .await;
            return;
        };

        if let Some(board_config) = &update.board_config {
            if let Err(err) = self.update_board_config(board_config).await {
                let message = err.to_string();

                if !is_cancel_error(&message) && update_err.is_empty() {
                    update_err = message;
                }
            }
        }

        if update_err.is_empty() {
            if let Some(message) = self
                .update_components(&update, &download_result, &token)
                .await
            {
                if update_err.is_empty() {
                    update_err = message;
                }
            }
        }

        self.machine
            .finish_operation(&token, UpdateEvent::FinishUpdate, &update_err)
            .await;
    }

    async fn update_board_config(&self, board_config: &serde_json::Value) -> Result<()> {
        let vendor_version = self
            .board_config_updater
            .check_board_config(board_config)
            .await?;

        debug!(vendor_version = %vendor_version, "Update board config");

        self.set_board_config_status(BoardConfigStatus {
            vendor_version: vendor_version.clone(),
            status: ItemState::Installing,
            ..Default::default()
        });

        if let Err(err) = self
            .board_config_updater
            .update_board_config(board_config)
            .await
        {
            let message = err.to_string();

            error!("Can't update board config: {message}");

            if !is_cancel_error(&message) {
                self.set_board_config_status(BoardConfigStatus {
                    vendor_version,
                    status: ItemState::Error,
                    error: message.clone(),
                });
            }

            return Err(anyhow!(message));
        }

        info!(vendor_version = %vendor_version, "Board config successfully updated");

        self.set_board_config_status(BoardConfigStatus {
            vendor_version,
            status: ItemState::Installed,
            ..Default::default()
        });

        Ok(())
    }

    /// Hands the downloaded components to the component updater and routes
    /// the statuses it accumulated. Returns the update error, when any.
    async fn update_components(
        &self,
        update: &FirmwareUpdate,
        download_result: &HashMap<String, DownloadResult>,
        token: &CancellationToken,
    ) -> Option<String> {
        let mut components = Vec::new();
        let mut first_err: Option<String> = None;

        for component in &update.components {
            let Some(download_info) = download_result.get(&component.id) else {
                self.update_component_status_by_id(
                    &component.id,
                    ItemState::Error,
                    "can't get download result",
                );

                if first_err.is_none() {
                    first_err = Some("can't get download result".to_string());
                }

                continue;
            };

            if !download_info.error.is_empty() {
                continue;
            }

            let mut component = component.clone();
            component.decrypt = DecryptData {
                urls: vec![format!("file://{}", download_info.file_name)],
                size: download_info.file_info.size,
                sha256: download_info.file_info.sha256.clone(),
                sha512: download_info.file_info.sha512.clone(),
                decryption_info: None,
            };

            components.push(component);
        }

        if components.is_empty() {
            return first_err;
        }

        for component in &components {
            debug!(
                id = %component.id,
                vendor_version = %component.vendor_version,
                "Update component"
            );

            self.update_component_status_by_id(&component.id, ItemState::Installing, "");
        }

        let result = tokio::select! {
            result = self.updater.update_components(components) => result,
            _ = token.cancelled() => Err(anyhow!(CANCELED_ERROR)),
        };

        match result {
            Ok(result) => {
                let known: HashSet<String> = {
                    let statuses = self.statuses.lock().unwrap();
                    statuses.components.keys().cloned().collect()
                };

                for status in result.components {
                    if known.contains(&status.id) {
                        self.set_component_status(status);
                    }
                }

                first_err.or(result.error)
            }

            Err(err) => {
                let message = err.to_string();

                error!("Can't update components: {message}");

                if is_cancel_error(&message) {
                    first_err
                } else {
                    first_err.or(Some(message))
                }
            }
        }
    }

    fn update_component_status_by_id(&self, id: &str, status: ItemState, component_err: &str) {
        let info = {
            let mut statuses = self.statuses.lock().unwrap();

            let Some(info) = statuses.components.get_mut(id) else {
                error!("Can't update firmware component status: id {id} not found");
                return;
            };

            info.status = status;
            info.error = component_err.to_string();
            info.clone()
        };

        self.tables.update_component_status(info);
    }

    fn set_component_status(&self, info: ComponentStatus) {
        self.statuses
            .lock()
            .unwrap()
            .components
            .insert(info.id.clone(), info.clone());

        self.tables.update_component_status(info);
    }

    fn set_board_config_status(&self, info: BoardConfigStatus) {
        self.statuses.lock().unwrap().board_config = Some(info.clone());

        self.tables.update_board_config_status(info);
    }

    fn send_current_status(&self, inner: &FirmwareInner) {
        self.status_tx.send_replace(current_status(inner));
    }

    fn save_state(&self, inner: &FirmwareInner) -> Result<()> {
        let state = {
            let statuses = self.statuses.lock().unwrap();

            FirmwareState {
                current_state: inner.current_state,
                current_update: inner.current_update.clone(),
                download_result: inner.download_result.clone(),
                update_err: inner.update_err.clone(),
                ttl_date: inner.ttl_date,
                component_statuses: statuses.components.clone(),
                board_config_status: statuses.board_config.clone(),
            }
        };

        self.storage
            .set_firmware_update_state(serde_json::to_vec(&state)?)
    }
}

#[async_trait]
impl UpdateHandler for FirmwareManager {
    async fn state_changed(&self, event: UpdateEvent, state: UpdateState, update_err: &str) {
        if event == UpdateEvent::Cancel {
            let (component_ids, board_config) = {
                let statuses = self.statuses.lock().unwrap();

                (
                    statuses
                        .components
                        .iter()
                        .filter(|(_, info)| info.status != ItemState::Error)
                        .map(|(id, _)| id.clone())
                        .collect::<Vec<_>>(),
                    statuses
                        .board_config
                        .clone()
                        .filter(|info| info.status != ItemState::Error),
                )
            };

            for id in component_ids {
                self.update_component_status_by_id(&id, ItemState::Error, update_err);
            }

            if let Some(mut info) = board_config {
                info.status = ItemState::Error;
                info.error = update_err.to_string();
                self.set_board_config_status(info);
            }
        }

        let mut inner = self.inner.lock().await;

        inner.current_state = state;
        inner.update_err = update_err.to_string();

        debug!(state = %state, event = %event, "Firmware manager state changed");

        if !update_err.is_empty() {
            error!("Firmware update error: {update_err}");
        }

        if let Err(err) = self.save_state(&inner) {
            error!("Can't save current firmware manager state: {err}");
        }

        self.send_current_status(&inner);
    }

    async fn no_update(&self) {
        let pending_ttl = {
            let mut inner = self.inner.lock().await;

            for result in inner.download_result.values() {
                if result.file_name.is_empty() {
                    continue;
                }

                debug!(file = %result.file_name, "Remove firmware update file");

                if let Err(err) = std::fs::remove_file(&result.file_name) {
                    error!(file = %result.file_name, "Can't remove update file: {err}");
                }
            }

            let Some(pending) = inner.pending_update.take() else {
                return;
            };

            debug!("Schedule pending firmware update");

            let ttl = pending.schedule.ttl;
            inner.current_update = Some(pending);

            ttl
        };

        let this = self.this.clone();

        tokio::spawn(async move {
            let Some(manager) = this.upgrade() else {
                return;
            };

            match manager.machine.start_new_update(pending_ttl).await {
                Ok(deadline) => manager.inner.lock().await.ttl_date = Some(deadline),
                Err(err) => error!("Can't start new firmware update: {err}"),
            }
        });
    }

    async fn download(&self, token: CancellationToken) {
        self.download_phase(token).await;
    }

    async fn ready_to_update(&self) {
        let schedule = {
            let inner = self.inner.lock().await;
            inner
                .current_update
                .as_ref()
                .map(|update| update.schedule.clone())
        };

        if let Some(schedule) = schedule {
            self.machine.schedule_update(&schedule);
        }
    }

    async fn update(&self, token: CancellationToken) {
        self.update_phase(token).await;
    }
}

fn current_status(inner: &FirmwareInner) -> FirmwareUpdateStatus {
    let mut status = FirmwareUpdateStatus {
        state: inner.current_state,
        error: inner.update_err.clone(),
        ..Default::default()
    };

    if inner.current_state == UpdateState::NoUpdate {
        return status;
    }

    let Some(update) = &inner.current_update else {
        return status;
    };

    for component in &update.components {
        status.components.push(ComponentStatus {
            id: component.id.clone(),
            vendor_version: component.vendor_version.clone(),
            aos_version: component.aos_version,
            ..Default::default()
        });
    }

    status
}
