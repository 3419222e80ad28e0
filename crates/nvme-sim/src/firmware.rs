//! Firmware image staging and slot bookkeeping.

use std::collections::BTreeMap;

use crate::command::NvmeStatus;

/// Firmware slots are numbered 1..=7 in the slot information log.
pub const MAX_FIRMWARE_SLOTS: u8 = 7;
pub const FIRMWARE_SLOT_LOG_SIZE: usize = 512;

/// Commit Action field of Firmware Commit (CDW10 bits 5:3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitAction {
    /// Store the downloaded image in the slot without activating it.
    Replace,
    /// Store the downloaded image and activate it at the next controller reset.
    ReplaceAndActivateOnReset,
    /// Activate the image already in the slot at the next controller reset.
    ActivateOnReset,
    /// Store the downloaded image and activate it immediately.
    ReplaceAndActivateNow,
}

impl TryFrom<u8> for CommitAction {
    type Error = NvmeStatus;

    fn try_from(ca: u8) -> Result<Self, Self::Error> {
        match ca {
            0 => Ok(CommitAction::Replace),
            1 => Ok(CommitAction::ReplaceAndActivateOnReset),
            2 => Ok(CommitAction::ActivateOnReset),
            3 => Ok(CommitAction::ReplaceAndActivateNow),
            _ => Err(NvmeStatus::INVALID_FIELD),
        }
    }
}

/// Default bound on an assembled firmware image.
pub const DEFAULT_MAX_FIRMWARE_IMAGE_BYTES: usize = 16 * 1024 * 1024;

/// Byte range `[start, end)` covered by a fragment at dword offset `offset`.
fn fragment_range(offset: u32, len: usize) -> Option<(usize, usize)> {
    let start = (offset as usize).checked_mul(4)?;
    Some((start, start.checked_add(len)?))
}

/// Image fragments received through Firmware Image Download, keyed by dword offset.
#[derive(Debug)]
pub struct FirmwareStore {
    fragments: BTreeMap<u32, Vec<u8>>,
    max_image_bytes: usize,
}

impl Default for FirmwareStore {
    fn default() -> Self {
        FirmwareStore::new(DEFAULT_MAX_FIRMWARE_IMAGE_BYTES)
    }
}

impl FirmwareStore {
    pub fn new(max_image_bytes: usize) -> Self {
        FirmwareStore {
            fragments: BTreeMap::new(),
            max_image_bytes,
        }
    }

    pub fn max_image_bytes(&self) -> usize {
        self.max_image_bytes
    }

    /// Checks that a fragment of `len` bytes at dword offset `offset` ends inside the image
    /// bound.
    pub fn check_fragment(&self, offset: u32, len: usize) -> Result<(), NvmeStatus> {
        match fragment_range(offset, len) {
            Some((_, end)) if end <= self.max_image_bytes => Ok(()),
            _ => Err(NvmeStatus::INVALID_FIELD),
        }
    }

    /// Buffers `data` at dword offset `offset`; a fragment at the same offset is replaced.
    /// Fragments reaching past the image bound are refused and leave the store untouched.
    pub fn download(&mut self, offset: u32, data: Vec<u8>) -> Result<(), NvmeStatus> {
        self.check_fragment(offset, data.len())?;
        self.fragments.insert(offset, data);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    pub fn clear(&mut self) {
        self.fragments.clear();
    }

    /// Assembles the buffered fragments in offset order and empties the store. Gaps read as
    /// zeroes; where fragments overlap the one at the higher offset wins.
    pub fn take_image(&mut self) -> Vec<u8> {
        let mut image = Vec::new();
        for (offset, data) in std::mem::take(&mut self.fragments) {
            let Some((start, end)) = fragment_range(offset, data.len()) else {
                continue;
            };
            if end > self.max_image_bytes {
                continue;
            }
            if image.len() < end {
                image.resize(end, 0);
            }
            image[start..end].copy_from_slice(&data);
        }
        image
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    pub revision: [u8; 8],
    pub data: Vec<u8>,
}

impl FirmwareImage {
    /// The revision is taken from the first eight bytes of the image, space padded.
    pub fn from_bytes(data: Vec<u8>) -> Self {
        let mut revision = [b' '; 8];
        for (dst, &src) in revision.iter_mut().zip(data.iter()) {
            *dst = if src == 0 { b' ' } else { src };
        }
        FirmwareImage { revision, data }
    }

    pub fn with_revision(revision: &str) -> Self {
        let mut rev = [b' '; 8];
        for (dst, &src) in rev.iter_mut().zip(revision.as_bytes()) {
            *dst = src;
        }
        FirmwareImage {
            revision: rev,
            data: Vec::new(),
        }
    }
}

/// Slot contents plus the active / next-reset selection reported by log page 0x03.
#[derive(Debug, Clone)]
pub struct FirmwareSlots {
    slots: Vec<Option<FirmwareImage>>,
    active: u8,
    next_reset: Option<u8>,
}

impl FirmwareSlots {
    /// Creates `count` slots with `initial` loaded and running from slot 1.
    pub fn new(count: u8, initial: FirmwareImage) -> Self {
        let count = count.clamp(1, MAX_FIRMWARE_SLOTS);
        let mut slots = vec![None; count as usize];
        slots[0] = Some(initial);
        FirmwareSlots {
            slots,
            active: 1,
            next_reset: None,
        }
    }

    pub fn slot_count(&self) -> u8 {
        self.slots.len() as u8
    }

    pub fn active_slot(&self) -> u8 {
        self.active
    }

    pub fn pending_slot(&self) -> Option<u8> {
        self.next_reset
    }

    pub fn image(&self, slot: u8) -> Option<&FirmwareImage> {
        self.slots.get(slot.checked_sub(1)? as usize)?.as_ref()
    }

    pub fn running_revision(&self) -> [u8; 8] {
        self.image(self.active)
            .map(|img| img.revision)
            .unwrap_or([b' '; 8])
    }

    /// Executes a Firmware Commit. Slot 0 selects the running slot.
    pub fn commit(
        &mut self,
        slot: u8,
        action: CommitAction,
        store: &mut FirmwareStore,
    ) -> Result<(), NvmeStatus> {
        let slot = if slot == 0 { self.active } else { slot };
        if slot > self.slot_count() {
            return Err(NvmeStatus::INVALID_FIRMWARE_SLOT);
        }

        match action {
            CommitAction::ActivateOnReset => {
                if self.image(slot).is_none() {
                    return Err(NvmeStatus::INVALID_FIRMWARE_IMAGE);
                }
                self.next_reset = Some(slot);
            }
            CommitAction::Replace
            | CommitAction::ReplaceAndActivateOnReset
            | CommitAction::ReplaceAndActivateNow => {
                if store.is_empty() {
                    return Err(NvmeStatus::INVALID_FIRMWARE_IMAGE);
                }
                let image = FirmwareImage::from_bytes(store.take_image());
                self.slots[slot as usize - 1] = Some(image);
                match action {
                    CommitAction::ReplaceAndActivateOnReset => self.next_reset = Some(slot),
                    CommitAction::ReplaceAndActivateNow => {
                        self.active = slot;
                        self.next_reset = None;
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    /// Switches to the slot selected for activation at reset, if any.
    pub fn apply_pending_activation(&mut self) -> Option<u8> {
        let slot = self.next_reset.take()?;
        self.active = slot;
        Some(slot)
    }

    /// Firmware Slot Information log page (LID 0x03).
    pub fn log_page(&self) -> [u8; FIRMWARE_SLOT_LOG_SIZE] {
        let mut page = [0u8; FIRMWARE_SLOT_LOG_SIZE];
        // AFI: active slot in bits 2:0, next-reset slot in bits 6:4.
        page[0] = (self.active & 0x7) | (self.next_reset.unwrap_or(0) & 0x7) << 4;
        for (idx, slot) in self.slots.iter().enumerate() {
            if let Some(img) = slot {
                let off = 8 + idx * 8;
                page[off..off + 8].copy_from_slice(&img.revision);
            }
        }
        page
    }
}
