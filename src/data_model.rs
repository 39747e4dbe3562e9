use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

use crate::schedule::ScheduleRule;

/// Identifier of an update manager client, assigned in configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub struct UmId(String);

impl Display for UmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl UmId {
    pub fn new(id: String) -> Self {
        Self(id)
    }

    pub fn get(&self) -> &str {
        &self.0
    }
}

impl From<&str> for UmId {
    fn from(value: &str) -> Self {
        Self::new(value.to_string())
    }
}

/// Lifecycle state of a single firmware/software item as reported to the
/// cloud.
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Default,
    strum::Display,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ItemState {
    Downloading,
    Pending,
    Installing,
    Installed,
    Removing,
    Removed,
    Error,
    #[default]
    Unknown,
}

/// State of a remote update manager within the two-phase update protocol.
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Default,
    strum::Display,
    strum::AsRefStr,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum UmState {
    #[default]
    Idle,
    Prepared,
    Updated,
    Failed,
}

/// Status report received from an update manager client: its protocol state
/// plus the statuses of every component it owns.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct UmStatus {
    pub um_state: UmState,
    #[serde(default)]
    pub components: Vec<ComponentStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ComponentStatus {
    pub id: String,
    pub vendor_version: String,
    #[serde(default)]
    pub aos_version: u64,
    pub status: ItemState,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    pub id: String,
    #[serde(default)]
    pub aos_version: u64,
    pub status: ItemState,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub state_checksum: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct LayerStatus {
    pub id: String,
    pub digest: String,
    #[serde(default)]
    pub aos_version: u64,
    pub status: ItemState,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct BoardConfigStatus {
    pub vendor_version: String,
    pub status: ItemState,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

/// One status descriptor held by the unit status aggregator. The four status
/// kinds share a `status` and `version` projection used for keying inside an
/// item's descriptor collection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum StatusItem {
    BoardConfig(BoardConfigStatus),
    Component(ComponentStatus),
    Layer(LayerStatus),
    Service(ServiceStatus),
}

impl StatusItem {
    pub fn status(&self) -> ItemState {
        match self {
            StatusItem::BoardConfig(info) => info.status,
            StatusItem::Component(info) => info.status,
            StatusItem::Layer(info) => info.status,
            StatusItem::Service(info) => info.status,
        }
    }

    pub fn version(&self) -> String {
        match self {
            StatusItem::BoardConfig(info) => info.vendor_version.clone(),
            StatusItem::Component(info) => info.vendor_version.clone(),
            StatusItem::Layer(info) => info.aos_version.to_string(),
            StatusItem::Service(info) => info.aos_version.to_string(),
        }
    }

    pub fn error(&self) -> &str {
        match self {
            StatusItem::BoardConfig(info) => &info.error,
            StatusItem::Component(info) => &info.error,
            StatusItem::Layer(info) => &info.error,
            StatusItem::Service(info) => &info.error,
        }
    }
}

/// Full unit status snapshot transmitted to the cloud.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct UnitStatus {
    pub board_config: Vec<BoardConfigStatus>,
    pub components: Vec<ComponentStatus>,
    pub layers: Vec<LayerStatus>,
    pub services: Vec<ServiceStatus>,
}

/// Size and digests of a downloaded artifact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    pub size: u64,
    #[serde(default)]
    pub sha256: Vec<u8>,
    #[serde(default)]
    pub sha512: Vec<u8>,
}

/// Transport and decryption descriptor for one downloadable package.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct DecryptData {
    #[serde(default)]
    pub urls: Vec<String>,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub sha256: Vec<u8>,
    #[serde(default)]
    pub sha512: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decryption_info: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct CertificateChain {
    pub name: String,
    #[serde(default)]
    pub fingerprints: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Certificate {
    pub fingerprint: String,
    #[serde(default)]
    pub certificate: Vec<u8>,
}

/// Service entry of the cloud desired-state document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct DesiredService {
    pub id: String,
    #[serde(default)]
    pub aos_version: u64,
    #[serde(flatten)]
    pub decrypt: DecryptData,
}

/// Layer entry of the cloud desired-state document. Layers are
/// content-addressed: the digest is the identity, the version is advisory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct DesiredLayer {
    pub id: String,
    pub digest: String,
    #[serde(default)]
    pub aos_version: u64,
    #[serde(flatten)]
    pub decrypt: DecryptData,
}

/// System component entry of the cloud desired-state document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct DesiredComponent {
    pub id: String,
    pub vendor_version: String,
    #[serde(default)]
    pub aos_version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<serde_json::Value>,
    #[serde(flatten)]
    pub decrypt: DecryptData,
}

/// Decoded desired-state document pushed by the cloud.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct DesiredStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub board_config: Option<serde_json::Value>,
    #[serde(default)]
    pub components: Vec<DesiredComponent>,
    #[serde(default)]
    pub layers: Vec<DesiredLayer>,
    #[serde(default)]
    pub services: Vec<DesiredService>,
    #[serde(default)]
    pub fota_schedule: ScheduleRule,
    #[serde(default)]
    pub sota_schedule: ScheduleRule,
    #[serde(default)]
    pub cert_chains: Vec<CertificateChain>,
    #[serde(default)]
    pub certs: Vec<Certificate>,
}

/// Outcome of downloading and decrypting one package. A non-empty file name
/// references an artifact in the decrypt directory whose lifetime is bound
/// to the update that requested it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct DownloadResult {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub file_name: String,
    #[serde(default)]
    pub file_info: FileInfo,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

/// Firmware package accepted for update, persisted until the update
/// terminates so that a restarted controller can resume the plan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SystemComponent {
    pub id: String,
    pub vendor_version: String,
    #[serde(default)]
    pub aos_version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<serde_json::Value>,
    pub url: String,
    #[serde(default)]
    pub sha256: Vec<u8>,
    #[serde(default)]
    pub sha512: Vec<u8>,
    #[serde(default)]
    pub size: u64,
}
