use anyhow::Result;

use crate::data_model::SystemComponent;

/// Persistence adapter consumed by the update managers.
///
/// Two opaque JSON slots hold the firmware and software manager records;
/// a typed slot holds the component plan of an in-flight firmware update.
/// An empty blob means no prior state. Implementations must round-trip
/// bytes unchanged.
pub trait Storage: Send + Sync {
    fn set_firmware_update_state(&self, state: Vec<u8>) -> Result<()>;
    fn firmware_update_state(&self) -> Result<Vec<u8>>;

    fn set_software_update_state(&self, state: Vec<u8>) -> Result<()>;
    fn software_update_state(&self) -> Result<Vec<u8>>;

    fn set_components_update_info(&self, info: Vec<SystemComponent>) -> Result<()>;
    fn components_update_info(&self) -> Result<Vec<SystemComponent>>;
}
