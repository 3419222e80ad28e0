//! Identify Controller data structure (CNS 0x01).

use crate::config::ControllerConfig;
use crate::namespace::IDENTIFY_DATA_SIZE;
use crate::registers::NVME_VERSION;

/// OACS: Format NVM supported.
const OACS_FORMAT_NVM: u16 = 1 << 1;
/// OACS: Firmware Commit and Firmware Image Download supported.
const OACS_FIRMWARE: u16 = 1 << 2;
/// OACS: Namespace Management and Attachment supported.
const OACS_NAMESPACE_MANAGEMENT: u16 = 1 << 3;

/// Identify Controller fields the controller reports. Rebuilt from the configuration on
/// construction and on every controller reset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentifyController {
    pub vendor_id: u16,
    pub serial_number: String,
    pub model_number: String,
    pub mdts: u8,
    pub controller_id: u16,
    pub oacs: u16,
    pub firmware_slots: u8,
    /// Keep Alive granularity in 100 ms units.
    pub kas: u16,
    pub max_outstanding_commands: u16,
}

impl IdentifyController {
    pub fn from_config(config: &ControllerConfig) -> Self {
        IdentifyController {
            vendor_id: config.vendor_id,
            serial_number: config.serial_number.clone(),
            model_number: config.model_number.clone(),
            mdts: config.mdts,
            controller_id: 0,
            oacs: OACS_FORMAT_NVM | OACS_FIRMWARE | OACS_NAMESPACE_MANAGEMENT,
            firmware_slots: config.firmware_slots,
            kas: 1,
            max_outstanding_commands: config.max_queue_entries,
        }
    }

    /// Serializes the structure. FR and NN are live values owned by the firmware slots and the
    /// namespace registry, so the caller passes them in.
    pub fn to_bytes(&self, firmware_revision: &[u8; 8], namespace_count: u32) -> Vec<u8> {
        let mut data = vec![0u8; IDENTIFY_DATA_SIZE];

        data[0..2].copy_from_slice(&self.vendor_id.to_le_bytes()); // VID
        data[2..4].copy_from_slice(&self.vendor_id.to_le_bytes()); // SSVID
        write_ascii_padded(&mut data[4..24], &self.serial_number);
        write_ascii_padded(&mut data[24..64], &self.model_number);
        data[64..72].copy_from_slice(firmware_revision);

        data[77] = self.mdts;
        data[78..80].copy_from_slice(&self.controller_id.to_le_bytes()); // CNTLID
        data[80..84].copy_from_slice(&NVME_VERSION.to_le_bytes()); // VER

        data[256..258].copy_from_slice(&self.oacs.to_le_bytes());
        data[258] = 3; // ACL, 0's based
        // FRMW: slot count in bits 3:1, activation without reset in bit 4. Slot 1 is writable.
        data[260] = (self.firmware_slots & 0x7) << 1 | 1 << 4;
        data[261] = 0; // LPA
        data[320..322].copy_from_slice(&self.kas.to_le_bytes());

        data[512] = 0x66; // SQES: 64-byte entries
        data[513] = 0x44; // CQES: 16-byte entries
        data[514..516].copy_from_slice(&self.max_outstanding_commands.to_le_bytes());
        data[516..520].copy_from_slice(&namespace_count.to_le_bytes());

        data
    }
}

pub(crate) fn write_ascii_padded(dst: &mut [u8], s: &str) {
    dst.fill(b' ');
    let bytes = s.as_bytes();
    let len = bytes.len().min(dst.len());
    dst[..len].copy_from_slice(&bytes[..len]);
}
