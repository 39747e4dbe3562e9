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
        Certificate, CertificateChain, DecryptData, DesiredLayer, DesiredService, DesiredStatus,
        DownloadResult, ItemState, LayerStatus, ServiceStatus,
    },
    downloads::{self, Downloader},
    schedule::{ScheduleRule, ScheduleType},
    status::{SoftwareUpdateStatus, SoftwareUpdater, StatusTables},
    storage::Storage,
    update_machine::{
        is_cancel_error, UpdateEvent, UpdateHandler, UpdateState, UpdateStateMachine,
        CANCELED_ERROR,
    },
};

const MAX_CONCURRENT_ACTIONS: usize = 10;

/// Immutable plan of one software update round.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SoftwareUpdate {
    #[serde(default)]
    pub schedule: ScheduleRule,
    #[serde(default)]
    pub download_services: Vec<DesiredService>,
    #[serde(default)]
    pub install_services: Vec<DesiredService>,
    #[serde(default)]
    pub remove_services: Vec<ServiceStatus>,
    #[serde(default)]
    pub download_layers: Vec<DesiredLayer>,
    #[serde(default)]
    pub install_layers: Vec<DesiredLayer>,
    #[serde(default)]
    pub remove_layers: Vec<LayerStatus>,
    #[serde(default)]
    pub cert_chains: Vec<CertificateChain>,
    #[serde(default)]
    pub certs: Vec<Certificate>,
}

impl SoftwareUpdate {
    fn is_empty(&self) -> bool {
        self.download_services.is_empty()
            && self.install_services.is_empty()
            && self.remove_services.is_empty()
            && self.download_layers.is_empty()
            && self.install_layers.is_empty()
            && self.remove_layers.is_empty()
    }

    /// Compares the work of two updates by set semantics: desired-state
    /// diffing may produce the same items in another order or split them
    /// differently between the download and install lists.
    fn same_items(&self, other: &SoftwareUpdate) -> bool {
        fn install_services(update: &SoftwareUpdate) -> HashSet<(String, u64)> {
            update
                .download_services
                .iter()
                .chain(&update.install_services)
                .map(|service| (service.id.clone(), service.aos_version))
                .collect()
        }

        fn remove_services(update: &SoftwareUpdate) -> HashSet<(String, u64)> {
            update
                .remove_services
                .iter()
                .map(|service| (service.id.clone(), service.aos_version))
                .collect()
        }

        fn install_layers(update: &SoftwareUpdate) -> HashSet<String> {
            update
                .download_layers
                .iter()
                .chain(&update.install_layers)
                .map(|layer| layer.digest.clone())
                .collect()
        }

        fn remove_layers(update: &SoftwareUpdate) -> HashSet<String> {
            update
                .remove_layers
                .iter()
                .map(|layer| layer.digest.clone())
                .collect()
        }

        install_services(self) == install_services(other)
            && remove_services(self) == remove_services(other)
            && install_layers(self) == install_layers(other)
            && remove_layers(self) == remove_layers(other)
    }
}

/// Persisted software manager record; round-trips through the software
/// update state slot.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct SoftwareState {
    #[serde(default)]
    current_state: UpdateState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    current_update: Option<SoftwareUpdate>,
    #[serde(default)]
    download_result: HashMap<String, DownloadResult>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    update_err: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ttl_date: Option<DateTime<Utc>>,
    #[serde(default)]
    layer_statuses: HashMap<String, LayerStatus>,
    #[serde(default)]
    service_statuses: HashMap<String, ServiceStatus>,
}

struct SoftwareInner {
    current_update: Option<SoftwareUpdate>,
    pending_update: Option<SoftwareUpdate>,
    download_result: HashMap<String, DownloadResult>,
    current_users: Vec<String>,
    current_state: UpdateState,
    update_err: String,
    ttl_date: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct SoftwareStatuses {
    layers: HashMap<String, LayerStatus>,
    services: HashMap<String, ServiceStatus>,
}

enum Followup {
    None,
    Start { ttl: u64 },
    Reschedule(ScheduleRule),
    Cancel,
}

/// Reconciles desired services and layers with the installed state:
/// downloads, installs and removes them, surviving process restarts
/// through the persisted record.
pub(crate) struct SoftwareManager {
    this: Weak<SoftwareManager>,
    machine: Arc<UpdateStateMachine<SoftwareManager>>,
    tables: Arc<StatusTables>,
    updater: Arc<dyn SoftwareUpdater>,
    downloader: Arc<dyn Downloader>,
    storage: Arc<dyn Storage>,
    actions: ActionQueue,
    inner: tokio::sync::Mutex<SoftwareInner>,
    statuses: Mutex<SoftwareStatuses>,
    status_tx: watch::Sender<SoftwareUpdateStatus>,
}

impl SoftwareManager {
    pub(crate) async fn new(
        tables: Arc<StatusTables>,
        updater: Arc<dyn SoftwareUpdater>,
        downloader: Arc<dyn Downloader>,
        storage: Arc<dyn Storage>,
        default_ttl: Duration,
    ) -> Result<Arc<Self>> {
        let persisted = {
            let blob = storage.software_update_state()?;
            if blob.is_empty() {
                SoftwareState::default()
            } else {
                serde_json::from_slice::<SoftwareState>(&blob)?
            }
        };

        debug!(
            state = %persisted.current_state,
            error = %persisted.update_err,
            "New software manager"
        );

        let ttl_date = persisted.ttl_date;
        let (status_tx, _) = watch::channel(SoftwareUpdateStatus::default());

        let manager = Arc::new_cyclic(|weak: &Weak<SoftwareManager>| SoftwareManager {
            this: weak.clone(),
            machine: Arc::new(UpdateStateMachine::new(
                weak.clone(),
                persisted.current_state,
                default_ttl,
            )),
            tables,
            updater,
            downloader,
            storage,
            actions: ActionQueue::new(MAX_CONCURRENT_ACTIONS),
            inner: tokio::sync::Mutex::new(SoftwareInner {
                current_update: persisted.current_update,
                pending_update: None,
                download_result: persisted.download_result,
                current_users: Vec::new(),
                current_state: persisted.current_state,
                update_err: persisted.update_err,
                ttl_date,
            }),
            statuses: Mutex::new(SoftwareStatuses {
                layers: persisted.layer_statuses,
                services: persisted.service_statuses,
            }),
            status_tx,
        });

        manager.machine.init(ttl_date).await?;

        Ok(manager)
    }

    pub(crate) async fn close(&self) {
        debug!("Close software manager");

        self.machine.close().await;
    }

    pub(crate) fn current_update_state(&self) -> UpdateState {
        self.machine.current_state()
    }

    pub(crate) fn status_channel(&self) -> watch::Receiver<SoftwareUpdateStatus> {
        self.status_tx.subscribe()
    }

    pub(crate) async fn get_current_status(&self) -> SoftwareUpdateStatus {
        let inner = self.inner.lock().await;

        current_status(&inner)
    }

    /// Diffs the desired services and layers against the installed state
    /// and feeds the resulting work lists into the update policy.
    pub(crate) async fn process_desired_status(&self, desired: &DesiredStatus) -> Result<()> {
        let followup = {
            let mut inner = self.inner.lock().await;

            let mut update = SoftwareUpdate {
                schedule: desired.sota_schedule.clone(),
                cert_chains: desired.cert_chains.clone(),
                certs: desired.certs.clone(),
                ..Default::default()
            };

            let (users_services, users_layers) =
                self.updater.get_users_status(&inner.current_users).await?;
            let (all_services, all_layers) = self.updater.get_all_status().await?;

            'desired_services: for desired_service in &desired.services {
                for users_service in &users_services {
                    if desired_service.id == users_service.id
                        && desired_service.aos_version == users_service.aos_version
                        && users_service.status == ItemState::Installed
                    {
                        continue 'desired_services;
                    }
                }

                for service in &all_services {
                    if desired_service.id == service.id
                        && desired_service.aos_version == service.aos_version
                        && service.status == ItemState::Installed
                    {
                        update.install_services.push(desired_service.clone());
                        continue 'desired_services;
                    }
                }

                update.download_services.push(desired_service.clone());
            }

            'users_services: for users_service in &users_services {
                if users_service.status != ItemState::Installed {
                    continue;
                }

                for desired_service in &desired.services {
                    if users_service.id == desired_service.id {
                        continue 'users_services;
                    }
                }

                update.remove_services.push(users_service.clone());
            }

            'desired_layers: for desired_layer in &desired.layers {
                for users_layer in &users_layers {
                    if desired_layer.digest == users_layer.digest
                        && users_layer.status == ItemState::Installed
                    {
                        continue 'desired_layers;
                    }
                }

                for layer in &all_layers {
                    if desired_layer.digest == layer.digest
                        && layer.status == ItemState::Installed
                    {
                        update.install_layers.push(desired_layer.clone());
                        continue 'desired_layers;
                    }
                }

                update.download_layers.push(desired_layer.clone());
            }

            'users_layers: for users_layer in &users_layers {
                if users_layer.status != ItemState::Installed {
                    continue;
                }

                for desired_layer in &desired.layers {
                    if users_layer.digest == desired_layer.digest {
                        continue 'users_layers;
                    }
                }

                update.remove_layers.push(users_layer.clone());
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
        debug!("Start software update");

        self.machine.send_event(UpdateEvent::StartUpdate, "").await
    }

    /// Installed items from the current users' view merged with the
    /// in-flight per-item statuses of an active update.
    pub(crate) async fn get_item_statuses(
        &self,
    ) -> Result<(Vec<ServiceStatus>, Vec<LayerStatus>)> {
        let inner = self.inner.lock().await;

        let (services, layers) = self.updater.get_users_status(&inner.current_users).await?;

        let mut service_statuses: Vec<ServiceStatus> = services
            .into_iter()
            .filter(|service| service.status == ItemState::Installed)
            .collect();
        let mut layer_statuses: Vec<LayerStatus> = layers
            .into_iter()
            .filter(|layer| layer.status == ItemState::Installed)
            .collect();

        if self.machine.current_state() != UpdateState::NoUpdate {
            let statuses = self.statuses.lock().unwrap();
            service_statuses.extend(statuses.services.values().cloned());
            layer_statuses.extend(statuses.layers.values().cloned());
        }

        Ok((service_statuses, layer_statuses))
    }

    /// Records a users change; an in-flight update built for the previous
    /// users is cancelled first.
    pub(crate) async fn set_users(&self, users: Vec<String>) -> Result<()> {
        {
            let inner = self.inner.lock().await;

            if inner.current_users == users {
                return Ok(());
            }
        }

        if self.machine.can_transition(UpdateEvent::Cancel) {
            self.machine.send_event(UpdateEvent::Cancel, "").await?;
        }

        self.inner.lock().await.current_users = users;

        Ok(())
    }

    fn new_update(&self, inner: &mut SoftwareInner, update: SoftwareUpdate) -> Result<Followup> {
        debug!("New software update");

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

            // A changed schedule can be swapped in place while waiting to
            // update, except when the running schedule is forced: the
            // forced start is already on its way.
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
        let mut download_err = String::new();

        let update = {
            let mut inner = self.inner.lock().await;
            inner.download_result = HashMap::new();
            inner.current_update.clone()
        };

        let Some(update) = update else {
            self.machine
                .finish_operation(&token, finish_event, &download_err)
                .await;
            return;
        };

        {
            let mut statuses = self.statuses.lock().unwrap();
            statuses.layers.clear();
            statuses.services.clear();
        }

        let mut request: HashMap<String, DecryptData> = HashMap::new();

        for service in &update.download_services {
            debug!(id = %service.id, version = service.aos_version, "Download service");

            request.insert(service.id.clone(), service.decrypt.clone());
            self.set_service_status(ServiceStatus {
                id: service.id.clone(),
                aos_version: service.aos_version,
                status: ItemState::Downloading,
                ..Default::default()
            });
        }

        for layer in &update.download_layers {
            debug!(
                id = %layer.id,
                digest = %layer.digest,
                version = layer.aos_version,
                "Download layer"
            );

            request.insert(layer.digest.clone(), layer.decrypt.clone());
            self.set_layer_status(LayerStatus {
                id: layer.id.clone(),
                digest: layer.digest.clone(),
                aos_version: layer.aos_version,
                status: ItemState::Downloading,
                ..Default::default()
            });
        }

        // Items installed from existing local content skip the download.

        for service in &update.install_services {
            self.set_service_status(ServiceStatus {
                id: service.id.clone(),
                aos_version: service.aos_version,
                status: ItemState::Pending,
                ..Default::default()
            });
        }

        for layer in &update.install_layers {
            self.set_layer_status(LayerStatus {
                id: layer.id.clone(),
                digest: layer.digest.clone(),
                aos_version: layer.aos_version,
                status: ItemState::Pending,
                ..Default::default()
            });
        }

        if request.is_empty() {
            self.machine
                .finish_operation(&token, finish_event, &download_err)
                .await;
            return;
        }

        let result = downloads::download_packages(
            self.downloader.clone(),
            &self.actions,
            &token,
            request,
            true,
            update.cert_chains.clone(),
            update.certs.clone(),
        )
        .await;

        for (id, item) in &result {
            if item.error.is_empty() {
                self.update_status_by_id(id, ItemState::Pending, "");
            } else {
                error!(id = %id, "Error downloading item: {}", item.error);
                self.update_status_by_id(id, ItemState::Error, &item.error);
            }
        }

        download_err = downloads::download_error(&result);

        let num_errors = result
            .values()
            .filter(|item| !item.error.is_empty())
            .count();

        // All downloads failed and only removes could still make progress:
        // without queued removes there is nothing left to do.
        if num_errors == result.len() && update.remove_services.is_empty() {
            finish_event = UpdateEvent::Cancel;
        }

        self.inner.lock().await.download_result = result;

        self.machine
            .finish_operation(&token, finish_event, &download_err)
            .await;
    }

    async fn update_phase(&self, token: CancellationToken) {
        let mut update_err = String::new();

        for phase_err in [
            self.install_layers(&token).await,
            self.install_services(&token).await,
            self.remove_services(&token).await,
            self.remove_layers().await,
        ] {
            if update_err.is_empty() && !phase_err.is_empty() {
                update_err = phase_err;
            }
        }

        self.machine
            .finish_operation(&token, UpdateEvent::FinishUpdate, &update_err)
            .await;
    }

    async fn install_layers(&self, token: &CancellationToken) -> String {
        let (update, download_result) = {
            let inner = self.inner.lock().await;
            (inner.current_update.clone(), inner.download_result.clone())
        };

        let Some(update) = update else {
            return String::new();
        };

        let install_err: Arc<Mutex<String>> = Arc::new(Mutex::new(String::new()));
        let mut install_layers = Vec::new();

        for layer in &update.download_layers {
            let Some(download_info) = download_result.get(&layer.digest) else {
                self.layer_error(layer, "can't get download result", &install_err);
                continue;
            };

            // Skip layers that never made it to disk.
            if !download_info.error.is_empty() {
                continue;
            }

            let mut layer = layer.clone();
            layer.decrypt = DecryptData {
                urls: vec![format!("file://{}", download_info.file_name)],
                size: download_info.file_info.size,
                sha256: download_info.file_info.sha256.clone(),
                sha512: download_info.file_info.sha512.clone(),
                decryption_info: None,
            };

            install_layers.push(layer);
        }

        install_layers.extend(update.install_layers.iter().cloned());

        for layer in install_layers {
            debug!(
                id = %layer.id,
                version = layer.aos_version,
                digest = %layer.digest,
                "Install layer"
            );

            self.update_layer_status_by_id(&layer.digest, ItemState::Installing, "");

            let this = self.this.clone();
            let token = token.clone();
            let install_err = install_err.clone();

            self.actions.execute(layer.digest.clone(), async move {
                let Some(manager) = this.upgrade() else {
                    return;
                };

                let result = tokio::select! {
                    result = manager.updater.install_layer(&layer) => result,
                    _ = token.cancelled() => Err(anyhow!(CANCELED_ERROR)),
                };

                match result {
                    Ok(()) => {
                        info!(
                            id = %layer.id,
                            version = layer.aos_version,
                            digest = %layer.digest,
                            "Layer successfully installed"
                        );

                        manager.update_layer_status_by_id(
                            &layer.digest,
                            ItemState::Installed,
                            "",
                        );
                    }
                    Err(err) => manager.layer_error(&layer, &err.to_string(), &install_err),
                }
            });
        }

        self.actions.wait().await;

        let message = install_err.lock().unwrap().clone();
        message
    }

    async fn install_services(&self, token: &CancellationToken) -> String {
        let (update, download_result, users) = {
            let inner = self.inner.lock().await;
            (
                inner.current_update.clone(),
                inner.download_result.clone(),
                inner.current_users.clone(),
            )
        };

        let Some(update) = update else {
            return String::new();
        };

        let install_err: Arc<Mutex<String>> = Arc::new(Mutex::new(String::new()));
        let mut install_services = Vec::new();

        for service in &update.download_services {
            let Some(download_info) = download_result.get(&service.id) else {
                self.service_error(service, "can't get download result", &install_err);
                continue;
            };

            if !download_info.error.is_empty() {
                continue;
            }

            let mut service = service.clone();
            service.decrypt = DecryptData {
                urls: vec![format!("file://{}", download_info.file_name)],
                size: download_info.file_info.size,
                sha256: download_info.file_info.sha256.clone(),
                sha512: download_info.file_info.sha512.clone(),
                decryption_info: None,
            };

            install_services.push(service);
        }

        install_services.extend(update.install_services.iter().cloned());

        for service in install_services {
            debug!(id = %service.id, version = service.aos_version, "Install service");

            self.update_service_status_by_id(&service.id, ItemState::Installing, "", "");

            let this = self.this.clone();
            let token = token.clone();
            let install_err = install_err.clone();
            let users = users.clone();

            self.actions.execute(service.id.clone(), async move {
                let Some(manager) = this.upgrade() else {
                    return;
                };

                let result = tokio::select! {
                    result = manager.updater.install_service(&users, &service) => result,
                    _ = token.cancelled() => Err(anyhow!(CANCELED_ERROR)),
                };

                match result {
                    Ok(state_checksum) => {
                        info!(
                            id = %service.id,
                            version = service.aos_version,
                            state_checksum = %state_checksum,
                            "Service successfully installed"
                        );

                        manager.update_service_status_by_id(
                            &service.id,
                            ItemState::Installed,
                            "",
                            &state_checksum,
                        );
                    }
                    Err(err) => manager.service_error(&service, &err.to_string(), &install_err),
                }
            });
        }

        self.actions.wait().await;

        let message = install_err.lock().unwrap().clone();
        message
    }

    async fn remove_services(&self, token: &CancellationToken) -> String {
        let (update, users) = {
            let inner = self.inner.lock().await;
            (inner.current_update.clone(), inner.current_users.clone())
        };

        let Some(update) = update else {
            return String::new();
        };

        let remove_err: Arc<Mutex<String>> = Arc::new(Mutex::new(String::new()));

        for service in &update.remove_services {
            debug!(id = %service.id, version = service.aos_version, "Remove service");

            self.set_service_status(ServiceStatus {
                id: service.id.clone(),
                aos_version: service.aos_version,
                status: ItemState::Removing,
                ..Default::default()
            });

            let this = self.this.clone();
            let token = token.clone();
            let remove_err = remove_err.clone();
            let users = users.clone();
            let service = service.clone();

            self.actions.execute(service.id.clone(), async move {
                let Some(manager) = this.upgrade() else {
                    return;
                };

                let result = tokio::select! {
                    result = manager.updater.remove_service(&users, &service) => result,
                    _ = token.cancelled() => Err(anyhow!(CANCELED_ERROR)),
                };

                match result {
                    Ok(()) => {
                        info!(
                            id = %service.id,
                            version = service.aos_version,
                            "Service successfully removed"
                        );

                        manager.update_service_status_by_id(
                            &service.id,
                            ItemState::Removed,
                            "",
                            "",
                        );
                    }
                    Err(err) => {
                        let message = err.to_string();

                        error!(
                            id = %service.id,
                            version = service.aos_version,
                            "Can't remove service: {message}"
                        );

                        if !is_cancel_error(&message) {
                            manager.update_status_by_id(
                                &service.id,
                                ItemState::Error,
                                &message,
                            );

                            let mut first = remove_err.lock().unwrap();
                            if first.is_empty() {
                                *first = message;
                            }
                        }
                    }
                }
            });
        }

        self.actions.wait().await;

        let message = remove_err.lock().unwrap().clone();
        message
    }

    /// Layer removal performs no backend call: layer files are garbage
    /// collected by the service manager, this side only reports the state.
    async fn remove_layers(&self) -> String {
        let update = self.inner.lock().await.current_update.clone();

        let Some(update) = update else {
            return String::new();
        };

        for layer in &update.remove_layers {
            debug!(
                id = %layer.id,
                version = layer.aos_version,
                digest = %layer.digest,
                "Remove layer"
            );

            self.set_layer_status(LayerStatus {
                id: layer.id.clone(),
                digest: layer.digest.clone(),
                aos_version: layer.aos_version,
                status: ItemState::Removed,
                ..Default::default()
            });

            info!(
                id = %layer.id,
                version = layer.aos_version,
                digest = %layer.digest,
                "Layer successfully removed"
            );
        }

        String::new()
    }

    fn layer_error(&self, layer: &DesiredLayer, message: &str, install_err: &Arc<Mutex<String>>) {
        error!(
            digest = %layer.digest,
            id = %layer.id,
            version = layer.aos_version,
            "Can't install layer: {message}"
        );

        if is_cancel_error(message) {
            return;
        }

        self.update_layer_status_by_id(&layer.digest, ItemState::Error, message);

        let mut first = install_err.lock().unwrap();
        if first.is_empty() {
            *first = message.to_string();
        }
    }

    fn service_error(
        &self,
        service: &DesiredService,
        message: &str,
        install_err: &Arc<Mutex<String>>,
    ) {
        error!(
            id = %service.id,
            version = service.aos_version,
            "Can't install service: {message}"
        );

        if is_cancel_error(message) {
            return;
        }

        self.update_status_by_id(&service.id, ItemState::Error, message);

        let mut first = install_err.lock().unwrap();
        if first.is_empty() {
            *first = message.to_string();
        }
    }

    fn update_status_by_id(&self, id: &str, status: ItemState, message: &str) {
        let kind = {
            let statuses = self.statuses.lock().unwrap();

            if statuses.layers.contains_key(id) {
                Some(true)
            } else if statuses.services.contains_key(id) {
                Some(false)
            } else {
                None
            }
        };

        match kind {
            Some(true) => self.update_layer_status_by_id(id, status, message),
            Some(false) => self.update_service_status_by_id(id, status, message, ""),
            None => error!("Software update id not found: {id}"),
        }
    }

    fn update_layer_status_by_id(&self, id: &str, status: ItemState, layer_err: &str) {
        let info = {
            let mut statuses = self.statuses.lock().unwrap();

            let Some(info) = statuses.layers.get_mut(id) else {
                error!("Can't update software layer status: id {id} not found");
                return;
            };

            info.status = status;
            info.error = layer_err.to_string();
            info.clone()
        };

        self.tables.update_layer_status(info);
    }

    fn update_service_status_by_id(
        &self,
        id: &str,
        status: ItemState,
        service_err: &str,
        state_checksum: &str,
    ) {
        let info = {
            let mut statuses = self.statuses.lock().unwrap();

            let Some(info) = statuses.services.get_mut(id) else {
                error!("Can't update software service status: id {id} not found");
                return;
            };

            info.status = status;
            info.error = service_err.to_string();
            info.state_checksum = state_checksum.to_string();
            info.clone()
        };

        self.tables.update_service_status(info);
    }

    fn set_layer_status(&self, info: LayerStatus) {
        self.statuses
            .lock()
            .unwrap()
            .layers
            .insert(info.digest.clone(), info.clone());

        self.tables.update_layer_status(info);
    }

    fn set_service_status(&self, info: ServiceStatus) {
        self.statuses
            .lock()
            .unwrap()
            .services
            .insert(info.id.clone(), info.clone());

        self.tables.update_service_status(info);
    }

    fn send_current_status(&self, inner: &SoftwareInner) {
        self.status_tx.send_replace(current_status(inner));
    }

    fn save_state(&self, inner: &SoftwareInner) -> Result<()> {
        let state = {
            let statuses = self.statuses.lock().unwrap();

            SoftwareState {
                current_state: inner.current_state,
                current_update: inner.current_update.clone(),
                download_result: inner.download_result.clone(),
                update_err: inner.update_err.clone(),
                ttl_date: inner.ttl_date,
                layer_statuses: statuses.layers.clone(),
                service_statuses: statuses.services.clone(),
            }
        };

        self.storage
            .set_software_update_state(serde_json::to_vec(&state)?)
    }
}

#[async_trait]
impl UpdateHandler for SoftwareManager {
    async fn state_changed(&self, event: UpdateEvent, state: UpdateState, update_err: &str) {
        if event == UpdateEvent::Cancel {
            let (layer_ids, service_ids) = {
                let statuses = self.statuses.lock().unwrap();

                (
                    statuses
                        .layers
                        .iter()
                        .filter(|(_, info)| info.status != ItemState::Error)
                        .map(|(id, _)| id.clone())
                        .collect::<Vec<_>>(),
                    statuses
                        .services
                        .iter()
                        .filter(|(_, info)| info.status != ItemState::Error)
                        .map(|(id, _)| id.clone())
                        .collect::<Vec<_>>(),
                )
            };

            for id in layer_ids {
                self.update_layer_status_by_id(&id, ItemState::Error, update_err);
            }

            for id in service_ids {
                self.update_service_status_by_id(&id, ItemState::Error, update_err, "");
            }
        }

        let mut inner = self.inner.lock().await;

        inner.current_state = state;
        inner.update_err = update_err.to_string();

        debug!(state = %state, event = %event, "Software manager state changed");

        if !update_err.is_empty() {
            error!("Software update error: {update_err}");
        }

        if let Err(err) = self.save_state(&inner) {
            error!("Can't save current software manager state: {err}");
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

                debug!(file = %result.file_name, "Remove software update file");

                if let Err(err) = std::fs::remove_file(&result.file_name) {
                    error!(file = %result.file_name, "Can't remove update file: {err}");
                }
            }

            let Some(pending) = inner.pending_update.take() else {
                return;
            };

            debug!("Schedule pending software update");

            let ttl = pending.schedule.ttl;
            inner.current_update = Some(pending);

            ttl
        };

        // Started from a fresh task: the machine is mid-transition here.
        let this = self.this.clone();

        tokio::spawn(async move {
            let Some(manager) = this.upgrade() else {
                return;
            };

            match manager.machine.start_new_update(pending_ttl).await {
                Ok(deadline) => manager.inner.lock().await.ttl_date = Some(deadline),
                Err(err) => error!("Can't start new software update: {err}"),
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

fn current_status(inner: &SoftwareInner) -> SoftwareUpdateStatus {
    let mut status = SoftwareUpdateStatus {
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

    for layer in update.download_layers.iter().chain(&update.install_layers) {
        status.install_layers.push(LayerStatus {
            id: layer.id.clone(),
            digest: layer.digest.clone(),
            aos_version: layer.aos_version,
            ..Default::default()
        });
    }

    for layer in &update.remove_layers {
        status.remove_layers.push(LayerStatus {
            id: layer.id.clone(),
            digest: layer.digest.clone(),
            aos_version: layer.aos_version,
            ..Default::default()
        });
    }

    for service in update
        .download_services
        .iter()
        .chain(&update.install_services)
    {
        status.install_services.push(ServiceStatus {
            id: service.id.clone(),
            aos_version: service.aos_version,
            ..Default::default()
        });
    }

    for service in &update.remove_services {
        status.remove_services.push(ServiceStatus {
            id: service.id.clone(),
            aos_version: service.aos_version,
            ..Default::default()
        });
    }

    status
}
