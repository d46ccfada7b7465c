use bscomp_device::{ConfigBlob, ConfigError};

/// Slot count used when the configuration blob is empty.
pub const DEFAULT_MAX_DEVICES: usize = 16;

/// Motherboard settings decoded from its configuration blob.
///
/// The primary field is the number of device slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MotherboardConfig {
    pub max_devices: usize,
}

impl Default for MotherboardConfig {
    fn default() -> Self {
        Self {
            max_devices: DEFAULT_MAX_DEVICES,
        }
    }
}

impl MotherboardConfig {
    pub fn from_blob(blob: &ConfigBlob) -> Result<Self, ConfigError> {
        let record = blob.decode()?;
        Ok(match record.primary() {
            Some(max_devices) => Self {
                max_devices: max_devices as usize,
            },
            None => Self::default(),
        })
    }

    pub fn to_blob(self) -> ConfigBlob {
        ConfigBlob::from_u32(u32::try_from(self.max_devices).unwrap_or(u32::MAX))
    }
}
