use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::firmware::{DEFAULT_MAX_FIRMWARE_IMAGE_BYTES, MAX_FIRMWARE_SLOTS};
use crate::namespace::{Namespace, RamDisk, BROADCAST_NSID, LBA_FORMATS};

/// Controller construction parameters.
///
/// Every field has a default so a config file only needs to name what it changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ControllerConfig {
    /// PCI vendor id, also reported as VID/SSVID in Identify Controller.
    pub vendor_id: u16,
    pub device_id: u16,
    /// Identify Controller SN, at most 20 ASCII characters.
    pub serial_number: String,
    /// Identify Controller MN, at most 40 ASCII characters.
    pub model_number: String,
    /// Revision of the image preloaded into firmware slot 1, at most 8 ASCII characters.
    pub firmware_revision: String,
    /// Number of firmware slots (1-7).
    pub firmware_slots: u8,
    /// Upper bound on an image assembled from Firmware Image Download fragments.
    pub max_firmware_image_bytes: usize,
    /// Largest I/O queue depth accepted by create-queue (CAP.MQES + 1).
    pub max_queue_entries: u16,
    /// Highest I/O queue id accepted by create-queue.
    pub max_queue_id: u16,
    /// MDTS: maximum transfer is `2 ^ mdts` pages; 0 means unlimited.
    pub mdts: u8,
    /// How long the doorbell watch loop sleeps between iterations when nothing wakes it.
    pub poll_interval_ms: u64,
    pub namespaces: Vec<NamespaceConfig>,
    /// Rule file consulted for every command before the built-in handlers run.
    pub command_response_file: Option<PathBuf>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            vendor_id: 0x1d1d,
            device_id: 0x0001,
            serial_number: "NVMESIM0000000000001".to_string(),
            model_number: "nvme-sim Controller".to_string(),
            firmware_revision: "1.0".to_string(),
            firmware_slots: 3,
            max_firmware_image_bytes: DEFAULT_MAX_FIRMWARE_IMAGE_BYTES,
            max_queue_entries: 1024,
            max_queue_id: 64,
            mdts: 5,
            poll_interval_ms: 1,
            namespaces: vec![NamespaceConfig::default()],
            command_response_file: None,
        }
    }
}

/// One namespace provisioned at construction and on every reset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NamespaceConfig {
    pub nsid: u32,
    /// Capacity in logical blocks of the configured LBA format.
    pub blocks: u64,
    /// Index into the supported LBA formats (0 = 512 B, 1 = 4 KiB).
    pub lba_format: u8,
    /// Inactive namespaces are allocated but not attached.
    pub active: bool,
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        NamespaceConfig {
            nsid: 1,
            blocks: 2048,
            lba_format: 0,
            active: true,
        }
    }
}

impl NamespaceConfig {
    /// Builds a zero-filled RAM-backed namespace.
    pub fn build(&self) -> Result<Namespace, ConfigError> {
        let block_size = self.block_size()?;
        let capacity = self
            .blocks
            .checked_mul(block_size as u64)
            .and_then(|bytes| usize::try_from(bytes).ok())
            .ok_or_else(|| invalid("namespaces.blocks", "capacity overflows host memory"))?;
        let disk = RamDisk::new(capacity, block_size)
            .map_err(|err| invalid("namespaces.lba_format", err.to_string()))?;
        Ok(Namespace::new(self.nsid, Box::new(disk)))
    }

    fn block_size(&self) -> Result<u32, ConfigError> {
        LBA_FORMATS
            .get(self.lba_format as usize)
            .copied()
            .ok_or_else(|| {
                invalid(
                    "namespaces.lba_format",
                    format!("format {} is not supported", self.lba_format),
                )
            })
    }
}

impl ControllerConfig {
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Reads and validates a JSON config file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: ControllerConfig =
            serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Largest data transfer in bytes allowed by MDTS, `None` when unlimited.
    pub fn max_transfer_bytes(&self) -> Option<usize> {
        (self.mdts != 0).then(|| crate::PAGE_SIZE << self.mdts)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_ascii("serial_number", &self.serial_number, 20)?;
        check_ascii("model_number", &self.model_number, 40)?;
        check_ascii("firmware_revision", &self.firmware_revision, 8)?;

        if !(1..=MAX_FIRMWARE_SLOTS).contains(&self.firmware_slots) {
            return Err(invalid(
                "firmware_slots",
                format!("must be between 1 and {MAX_FIRMWARE_SLOTS}"),
            ));
        }
        if self.max_firmware_image_bytes == 0 {
            return Err(invalid("max_firmware_image_bytes", "must be non-zero"));
        }
        if self.max_queue_entries < 2 {
            return Err(invalid("max_queue_entries", "must be at least 2"));
        }
        if self.mdts > 16 {
            return Err(invalid("mdts", "must be at most 16"));
        }
        if self.poll_interval_ms == 0 {
            return Err(invalid("poll_interval_ms", "must be non-zero"));
        }

        let mut seen = std::collections::BTreeSet::new();
        for ns in &self.namespaces {
            if ns.nsid == 0 || ns.nsid == BROADCAST_NSID {
                return Err(ConfigError::ReservedNamespaceId(ns.nsid));
            }
            if !seen.insert(ns.nsid) {
                return Err(ConfigError::DuplicateNamespace(ns.nsid));
            }
            if ns.blocks == 0 {
                return Err(invalid("namespaces.blocks", "must be non-zero"));
            }
            ns.block_size()?;
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field,
        reason: reason.into(),
    }
}

fn check_ascii(field: &'static str, value: &str, max_len: usize) -> Result<(), ConfigError> {
    if !value.is_ascii() {
        return Err(invalid(field, "must be ASCII"));
    }
    if value.len() > max_len {
        return Err(invalid(field, format!("longer than {max_len} characters")));
    }
    Ok(())
}
