use std::{
    collections::HashSet,
    path::PathBuf,
    sync::{Arc, Mutex},
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::subscriber;
use tracing_subscriber::{layer::SubscriberExt, Layer};

use crate::{
    config::Config,
    data_model::{
        BoardConfigStatus, Certificate, CertificateChain, ComponentStatus, DecryptData,
        DesiredComponent, DesiredLayer, DesiredService, DownloadResult, FileInfo, ItemState,
        LayerStatus, ServiceStatus, SystemComponent, UnitStatus,
    },
    downloads::Downloader,
    status::{
        BoardConfigUpdater, ComponentsUpdateResult, FirmwareUpdater, SoftwareUpdater,
        StatusSender, UnitStatusHandler,
    },
    storage::Storage,
    um_controller::UrlTranslator,
    update_machine::CANCELED_ERROR,
};

pub fn init_logging() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug"));

    let _ = subscriber::set_global_default(
        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().with_filter(env_filter)),
    );
}

#[derive(Default)]
pub struct MemoryStorage {
    firmware: Mutex<Vec<u8>>,
    software: Mutex<Vec<u8>>,
    components: Mutex<Vec<SystemComponent>>,
}

impl Storage for MemoryStorage {
    fn set_firmware_update_state(&self, state: Vec<u8>) -> Result<()> {
        *self.firmware.lock().unwrap() = state;
        Ok(())
    }

    fn firmware_update_state(&self) -> Result<Vec<u8>> {
        Ok(self.firmware.lock().unwrap().clone())
    }

    fn set_software_update_state(&self, state: Vec<u8>) -> Result<()> {
        *self.software.lock().unwrap() = state;
        Ok(())
    }

    fn software_update_state(&self) -> Result<Vec<u8>> {
        Ok(self.software.lock().unwrap().clone())
    }

    fn set_components_update_info(&self, info: Vec<SystemComponent>) -> Result<()> {
        *self.components.lock().unwrap() = info;
        Ok(())
    }

    fn components_update_info(&self) -> Result<Vec<SystemComponent>> {
        Ok(self.components.lock().unwrap().clone())
    }
}

pub struct TestStatusSender {
    sent: mpsc::UnboundedSender<UnitStatus>,
}

impl TestStatusSender {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<UnitStatus>) {
        let (tx, rx) = mpsc::unbounded_channel();

        (Arc::new(Self { sent: tx }), rx)
    }
}

#[async_trait]
impl StatusSender for TestStatusSender {
    async fn send_unit_status(&self, unit_status: UnitStatus) -> Result<()> {
        let _ = self.sent.send(unit_status);
        Ok(())
    }
}

/// Scripted downloader writing artifacts into a scratch directory. URLs
/// listed in `fail` error out; a gate installed with `hold()` blocks every
/// download until released, so tests can park an update in the downloading
/// state.
pub struct TestDownloader {
    dir: PathBuf,
    fail: Mutex<HashSet<String>>,
    gate: Mutex<Option<watch::Receiver<bool>>>,
    events: mpsc::UnboundedSender<String>,
}

impl TestDownloader {
    pub fn new(dir: PathBuf) -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();

        (
            Arc::new(Self {
                dir,
                fail: Mutex::new(HashSet::new()),
                gate: Mutex::new(None),
                events: tx,
            }),
            rx,
        )
    }

    pub fn fail_url(&self, url: &str) {
        self.fail.lock().unwrap().insert(url.to_string());
    }

    pub fn hold(&self) -> watch::Sender<bool> {
        let (tx, rx) = watch::channel(false);
        *self.gate.lock().unwrap() = Some(rx);

        tx
    }
}

#[async_trait]
impl Downloader for TestDownloader {
    async fn download_and_decrypt(
        &self,
        token: CancellationToken,
        package: DecryptData,
        _chains: &[CertificateChain],
        _certs: &[Certificate],
    ) -> Result<DownloadResult> {
        let url = package.urls.first().cloned().unwrap_or_default();

        let _ = self.events.send(format!("download {url}"));

        let gate = self.gate.lock().unwrap().clone();

        if let Some(mut gate) = gate {
            while !*gate.borrow_and_update() {
                tokio::select! {
                    changed = gate.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = token.cancelled() => return Err(anyhow!(CANCELED_ERROR)),
                }
            }
        }

        if self.fail.lock().unwrap().contains(&url) {
            return Err(anyhow!("download error: {url}"));
        }

        let file_name = self.dir.join(url.replace('/', "_"));
        std::fs::write(&file_name, b"package data")?;

        Ok(DownloadResult {
            file_name: file_name.to_string_lossy().into_owned(),
            file_info: FileInfo {
                size: package.size,
                sha256: package.sha256.clone(),
                sha512: package.sha512.clone(),
            },
            error: String::new(),
        })
    }
}

pub struct TestSoftwareUpdater {
    pub users_services: Mutex<Vec<ServiceStatus>>,
    pub users_layers: Mutex<Vec<LayerStatus>>,
    pub all_services: Mutex<Vec<ServiceStatus>>,
    pub all_layers: Mutex<Vec<LayerStatus>>,
    fail_install: Mutex<HashSet<String>>,
    events: mpsc::UnboundedSender<String>,
}

impl TestSoftwareUpdater {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();

        (
            Arc::new(Self {
                users_services: Mutex::new(Vec::new()),
                users_layers: Mutex::new(Vec::new()),
                all_services: Mutex::new(Vec::new()),
                all_layers: Mutex::new(Vec::new()),
                fail_install: Mutex::new(HashSet::new()),
                events: tx,
            }),
            rx,
        )
    }

    pub fn fail_install(&self, id: &str) {
        self.fail_install.lock().unwrap().insert(id.to_string());
    }
}

#[async_trait]
impl SoftwareUpdater for TestSoftwareUpdater {
    async fn get_users_status(
        &self,
        _users: &[String],
    ) -> Result<(Vec<ServiceStatus>, Vec<LayerStatus>)> {
        Ok((
            self.users_services.lock().unwrap().clone(),
            self.users_layers.lock().unwrap().clone(),
        ))
    }

    async fn get_all_status(&self) -> Result<(Vec<ServiceStatus>, Vec<LayerStatus>)> {
        Ok((
            self.all_services.lock().unwrap().clone(),
            self.all_layers.lock().unwrap().clone(),
        ))
    }

    async fn install_service(
        &self,
        _users: &[String],
        service: &DesiredService,
    ) -> Result<String> {
        if self.fail_install.lock().unwrap().contains(&service.id) {
            return Err(anyhow!("can't install service {}", service.id));
        }

        let _ = self.events.send(format!("install_service {}", service.id));

        Ok(format!("checksum-{}", service.id))
    }

    async fn remove_service(&self, _users: &[String], service: &ServiceStatus) -> Result<()> {
        let _ = self.events.send(format!("remove_service {}", service.id));

        Ok(())
    }

    async fn install_layer(&self, layer: &DesiredLayer) -> Result<()> {
        if self.fail_install.lock().unwrap().contains(&layer.digest) {
            return Err(anyhow!("can't install layer {}", layer.digest));
        }

        let _ = self.events.send(format!("install_layer {}", layer.digest));

        Ok(())
    }
}

pub struct TestFirmwareUpdater {
    pub components: Mutex<Vec<ComponentStatus>>,
    pub calls: Mutex<Vec<Vec<DesiredComponent>>>,
}

impl TestFirmwareUpdater {
    pub fn new(components: Vec<ComponentStatus>) -> Arc<Self> {
        Arc::new(Self {
            components: Mutex::new(components),
            calls: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl FirmwareUpdater for TestFirmwareUpdater {
    async fn get_status(&self) -> Result<Vec<ComponentStatus>> {
        Ok(self.components.lock().unwrap().clone())
    }

    async fn update_components(
        &self,
        components: Vec<DesiredComponent>,
    ) -> Result<ComponentsUpdateResult> {
        self.calls.lock().unwrap().push(components.clone());

        let mut result = Vec::new();
        let mut current = self.components.lock().unwrap();

        for component in &components {
            current.retain(|existing| existing.id != component.id);

            let status = ComponentStatus {
                id: component.id.clone(),
                vendor_version: component.vendor_version.clone(),
                aos_version: component.aos_version,
                status: ItemState::Installed,
                error: String::new(),
            };

            current.push(status.clone());
            result.push(status);
        }

        Ok(ComponentsUpdateResult {
            components: result,
            error: None,
        })
    }
}

pub struct TestBoardConfigUpdater {
    pub status: Mutex<BoardConfigStatus>,
}

impl TestBoardConfigUpdater {
    pub fn new(vendor_version: &str) -> Arc<Self> {
        Arc::new(Self {
            status: Mutex::new(BoardConfigStatus {
                vendor_version: vendor_version.to_string(),
                status: ItemState::Installed,
                error: String::new(),
            }),
        })
    }
}

fn board_config_version(config: &serde_json::Value) -> Result<String> {
    config["vendorVersion"]
        .as_str()
        .map(|version| version.to_string())
        .ok_or_else(|| anyhow!("board config version not found"))
}

#[async_trait]
impl BoardConfigUpdater for TestBoardConfigUpdater {
    async fn get_status(&self) -> Result<BoardConfigStatus> {
        Ok(self.status.lock().unwrap().clone())
    }

    async fn get_board_config_version(&self, config: &serde_json::Value) -> Result<String> {
        board_config_version(config)
    }

    async fn check_board_config(&self, config: &serde_json::Value) -> Result<String> {
        board_config_version(config)
    }

    async fn update_board_config(&self, config: &serde_json::Value) -> Result<()> {
        *self.status.lock().unwrap() = BoardConfigStatus {
            vendor_version: board_config_version(config)?,
            status: ItemState::Installed,
            error: String::new(),
        };

        Ok(())
    }
}

pub struct TestUrlTranslator;

impl UrlTranslator for TestUrlTranslator {
    fn translate_url(&self, _is_local: bool, url: &str) -> Result<String> {
        Ok(format!("file://{url}"))
    }
}

/// Full aggregator environment over mock collaborators.
pub struct TestEnv {
    pub handler: Arc<UnitStatusHandler>,
    pub storage: Arc<MemoryStorage>,
    pub downloader: Arc<TestDownloader>,
    pub download_events: mpsc::UnboundedReceiver<String>,
    pub software_updater: Arc<TestSoftwareUpdater>,
    pub software_events: mpsc::UnboundedReceiver<String>,
    pub firmware_updater: Arc<TestFirmwareUpdater>,
    pub board_updater: Arc<TestBoardConfigUpdater>,
    pub sent_statuses: mpsc::UnboundedReceiver<UnitStatus>,
    pub temp_dir: tempfile::TempDir,
}

impl TestEnv {
    pub async fn new() -> Result<TestEnv> {
        Self::with_storage(Arc::new(MemoryStorage::default())).await
    }

    pub async fn with_storage(storage: Arc<MemoryStorage>) -> Result<TestEnv> {
        init_logging();

        let temp_dir = tempfile::tempdir()?;
        let decrypt_dir = temp_dir.path().join("decrypt");
        std::fs::create_dir_all(&decrypt_dir)?;

        let config = Config {
            unit_status_send_period: 1,
            decrypt_dir: decrypt_dir.to_string_lossy().into_owned(),
            ..Default::default()
        };

        let (sender, sent_statuses) = TestStatusSender::new();
        let (downloader, download_events) = TestDownloader::new(decrypt_dir);
        let (software_updater, software_events) = TestSoftwareUpdater::new();
        let firmware_updater = TestFirmwareUpdater::new(Vec::new());
        let board_updater = TestBoardConfigUpdater::new("1.0");

        let handler = UnitStatusHandler::new(
            &config,
            board_updater.clone(),
            firmware_updater.clone(),
            software_updater.clone(),
            downloader.clone(),
            storage.clone(),
            sender,
        )
        .await?;

        Ok(TestEnv {
            handler,
            storage,
            downloader,
            download_events,
            software_updater,
            software_events,
            firmware_updater,
            board_updater,
            sent_statuses,
            temp_dir,
        })
    }
}

pub async fn recv_event(rx: &mut mpsc::UnboundedReceiver<String>) -> String {
    tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
        .await
        .expect("no event received")
        .expect("event channel closed")
}

pub fn desired_service(id: &str, version: u64, url: &str) -> DesiredService {
    DesiredService {
        id: id.to_string(),
        aos_version: version,
        decrypt: DecryptData {
            urls: vec![url.to_string()],
            size: 64,
            ..Default::default()
        },
    }
}

pub fn desired_layer(id: &str, digest: &str, version: u64, url: &str) -> DesiredLayer {
    DesiredLayer {
        id: id.to_string(),
        digest: digest.to_string(),
        aos_version: version,
        decrypt: DecryptData {
            urls: vec![url.to_string()],
            size: 64,
            ..Default::default()
        },
    }
}

pub fn desired_component(id: &str, vendor_version: &str, url: &str) -> DesiredComponent {
    DesiredComponent {
        id: id.to_string(),
        vendor_version: vendor_version.to_string(),
        aos_version: 0,
        annotations: None,
        decrypt: DecryptData {
            urls: vec![url.to_string()],
            size: 64,
            ..Default::default()
        },
    }
}

pub fn component_status(id: &str, vendor_version: &str, status: ItemState) -> ComponentStatus {
    ComponentStatus {
        id: id.to_string(),
        vendor_version: vendor_version.to_string(),
        aos_version: 0,
        status,
        error: String::new(),
    }
}
