//! Namespaces and their block storage.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::command::NvmeStatus;
use crate::error::ConfigError;

/// The "all namespaces" broadcast id.
pub const BROADCAST_NSID: u32 = 0xffff_ffff;

/// Supported LBA formats, indexed by the LBAF field of Format NVM.
pub const LBA_FORMATS: [u32; 2] = [512, 4096];

/// Size of an Identify data page and therefore the capacity of a namespace id list.
pub const IDENTIFY_DATA_SIZE: usize = 4096;
pub const NAMESPACE_LIST_CAPACITY: usize = IDENTIFY_DATA_SIZE / 4;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiskError {
    #[error("lba range {lba}+{blocks} exceeds capacity of {capacity} blocks")]
    OutOfRange { lba: u64, blocks: u64, capacity: u64 },

    #[error("buffer length {len} is not a multiple of the {block_size}-byte block size")]
    UnalignedBuffer { len: usize, block_size: u32 },

    #[error("unsupported block size {0}")]
    UnsupportedBlockSize(u32),

    #[error("backend i/o error: {0}")]
    Io(String),
}

pub type DiskResult<T> = Result<T, DiskError>;

/// Block storage behind a namespace.
pub trait DiskBackend: Send {
    fn block_size(&self) -> u32;
    fn total_blocks(&self) -> u64;
    fn read_blocks(&mut self, lba: u64, buffer: &mut [u8]) -> DiskResult<()>;
    fn write_blocks(&mut self, lba: u64, buffer: &[u8]) -> DiskResult<()>;
    fn flush(&mut self) -> DiskResult<()>;
    /// Discards all contents and switches to `block_size`.
    fn format(&mut self, block_size: u32) -> DiskResult<()>;

    /// Whether [`DiskBackend::format`] would accept `block_size`. Must not change any state.
    fn supports_block_size(&self, block_size: u32) -> bool {
        let capacity = self.total_blocks() * self.block_size() as u64;
        block_size != 0 && capacity % block_size as u64 == 0
    }
}

/// Volatile in-memory disk.
#[derive(Debug, Clone)]
pub struct RamDisk {
    data: Vec<u8>,
    block_size: u32,
}

impl RamDisk {
    pub fn new(capacity_bytes: usize, block_size: u32) -> DiskResult<Self> {
        if block_size == 0 || capacity_bytes % block_size as usize != 0 {
            return Err(DiskError::UnsupportedBlockSize(block_size));
        }
        Ok(RamDisk {
            data: vec![0u8; capacity_bytes],
            block_size,
        })
    }

    fn byte_range(&self, lba: u64, len: usize) -> DiskResult<std::ops::Range<usize>> {
        let bs = self.block_size as usize;
        if len % bs != 0 {
            return Err(DiskError::UnalignedBuffer {
                len,
                block_size: self.block_size,
            });
        }
        let blocks = (len / bs) as u64;
        let out_of_range = DiskError::OutOfRange {
            lba,
            blocks,
            capacity: self.total_blocks(),
        };
        let end_lba = lba.checked_add(blocks).ok_or_else(|| out_of_range.clone())?;
        if end_lba > self.total_blocks() {
            return Err(out_of_range);
        }
        let start = lba as usize * bs;
        Ok(start..start + len)
    }
}

impl DiskBackend for RamDisk {
    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn total_blocks(&self) -> u64 {
        (self.data.len() / self.block_size as usize) as u64
    }

    fn read_blocks(&mut self, lba: u64, buffer: &mut [u8]) -> DiskResult<()> {
        let range = self.byte_range(lba, buffer.len())?;
        buffer.copy_from_slice(&self.data[range]);
        Ok(())
    }

    fn write_blocks(&mut self, lba: u64, buffer: &[u8]) -> DiskResult<()> {
        let range = self.byte_range(lba, buffer.len())?;
        self.data[range].copy_from_slice(buffer);
        Ok(())
    }

    fn flush(&mut self) -> DiskResult<()> {
        Ok(())
    }

    fn format(&mut self, block_size: u32) -> DiskResult<()> {
        if block_size == 0 || self.data.len() % block_size as usize != 0 {
            return Err(DiskError::UnsupportedBlockSize(block_size));
        }
        self.data.fill(0);
        self.block_size = block_size;
        Ok(())
    }
}

pub struct Namespace {
    nsid: u32,
    disk: Box<dyn DiskBackend>,
}

impl std::fmt::Debug for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Namespace")
            .field("nsid", &self.nsid)
            .field("block_size", &self.disk.block_size())
            .field("total_blocks", &self.disk.total_blocks())
            .finish()
    }
}

impl Namespace {
    pub fn new(nsid: u32, disk: Box<dyn DiskBackend>) -> Self {
        Namespace { nsid, disk }
    }

    pub fn nsid(&self) -> u32 {
        self.nsid
    }

    pub fn block_size(&self) -> u32 {
        self.disk.block_size()
    }

    pub fn total_blocks(&self) -> u64 {
        self.disk.total_blocks()
    }

    pub fn lba_format(&self) -> Option<u8> {
        LBA_FORMATS
            .iter()
            .position(|&bs| bs == self.disk.block_size())
            .map(|idx| idx as u8)
    }

    pub fn disk_mut(&mut self) -> &mut dyn DiskBackend {
        self.disk.as_mut()
    }

    /// Checks that `blocks` starting at `slba` fit inside the namespace.
    pub fn check_range(&self, slba: u64, blocks: u64) -> Result<(), NvmeStatus> {
        match slba.checked_add(blocks) {
            Some(end) if end <= self.total_blocks() => Ok(()),
            _ => Err(NvmeStatus::LBA_OUT_OF_RANGE),
        }
    }

    /// Checks that LBA format `lbaf` exists and fits this namespace's capacity, returning its
    /// block size. Nothing is modified.
    pub fn check_format(&self, lbaf: u8) -> Result<u32, NvmeStatus> {
        let block_size = *LBA_FORMATS
            .get(lbaf as usize)
            .ok_or(NvmeStatus::INVALID_FORMAT)?;
        if !self.disk.supports_block_size(block_size) {
            return Err(NvmeStatus::INVALID_FORMAT);
        }
        Ok(block_size)
    }

    /// Discards the namespace contents and switches it to LBA format `lbaf`.
    pub fn format(&mut self, lbaf: u8) -> Result<(), NvmeStatus> {
        let block_size = self.check_format(lbaf)?;
        self.disk.format(block_size).map_err(|err| {
            tracing::warn!(nsid = self.nsid, %err, "namespace format failed");
            NvmeStatus::INTERNAL_ERROR
        })
    }

    /// Identify Namespace data structure (CNS 0x00).
    pub fn identify(&self) -> Vec<u8> {
        let mut data = vec![0u8; IDENTIFY_DATA_SIZE];
        let nsze = self.total_blocks();
        data[0..8].copy_from_slice(&nsze.to_le_bytes()); // NSZE
        data[8..16].copy_from_slice(&nsze.to_le_bytes()); // NCAP
        data[16..24].copy_from_slice(&nsze.to_le_bytes()); // NUSE
        data[25] = (LBA_FORMATS.len() - 1) as u8; // NLBAF, 0's based
        data[26] = self.lba_format().unwrap_or(0); // FLBAS
        for (idx, bs) in LBA_FORMATS.iter().enumerate() {
            // LBAFn: MS (15:0) = 0, LBADS (23:16), RP (25:24) = 0.
            data[128 + idx * 4 + 2] = bs.trailing_zeros() as u8;
        }
        data
    }
}

/// Active and inactive namespaces, keyed by nsid. A namespace is in exactly one of the two maps.
#[derive(Debug, Default)]
pub struct NamespaceRegistry {
    active: BTreeMap<u32, Namespace>,
    inactive: BTreeMap<u32, Namespace>,
}

impl NamespaceRegistry {
    pub fn insert(&mut self, ns: Namespace, active: bool) -> Result<(), ConfigError> {
        let nsid = ns.nsid();
        if nsid == 0 || nsid == BROADCAST_NSID {
            return Err(ConfigError::ReservedNamespaceId(nsid));
        }
        if self.is_allocated(nsid) {
            return Err(ConfigError::DuplicateNamespace(nsid));
        }
        if active {
            self.active.insert(nsid, ns);
        } else {
            self.inactive.insert(nsid, ns);
        }
        Ok(())
    }

    pub fn clear(&mut self) {
        self.active.clear();
        self.inactive.clear();
    }

    pub fn is_active(&self, nsid: u32) -> bool {
        self.active.contains_key(&nsid)
    }

    pub fn is_allocated(&self, nsid: u32) -> bool {
        self.active.contains_key(&nsid) || self.inactive.contains_key(&nsid)
    }

    pub fn active(&self, nsid: u32) -> Option<&Namespace> {
        self.active.get(&nsid)
    }

    /// Looks up an allocated namespace, attached or not.
    pub fn allocated(&self, nsid: u32) -> Option<&Namespace> {
        self.active.get(&nsid).or_else(|| self.inactive.get(&nsid))
    }

    pub fn active_mut(&mut self, nsid: u32) -> Option<&mut Namespace> {
        self.active.get_mut(&nsid)
    }

    pub fn active_iter(&self) -> impl Iterator<Item = &Namespace> {
        self.active.values()
    }

    pub fn active_iter_mut(&mut self) -> impl Iterator<Item = &mut Namespace> {
        self.active.values_mut()
    }

    pub fn active_ids(&self) -> Vec<u32> {
        self.active.keys().copied().collect()
    }

    pub fn inactive_ids(&self) -> Vec<u32> {
        self.inactive.keys().copied().collect()
    }

    /// Highest allocated nsid, reported as Identify Controller NN.
    pub fn max_nsid(&self) -> u32 {
        let active = self.active.keys().next_back().copied().unwrap_or(0);
        let inactive = self.inactive.keys().next_back().copied().unwrap_or(0);
        active.max(inactive)
    }

    pub fn attach(&mut self, nsid: u32) -> Result<(), NvmeStatus> {
        if self.active.contains_key(&nsid) {
            return Err(NvmeStatus::NAMESPACE_ALREADY_ATTACHED);
        }
        let ns = self.inactive.remove(&nsid).ok_or(NvmeStatus::INVALID_NS)?;
        self.active.insert(nsid, ns);
        Ok(())
    }

    pub fn detach(&mut self, nsid: u32) -> Result<(), NvmeStatus> {
        if self.inactive.contains_key(&nsid) {
            return Err(NvmeStatus::NAMESPACE_NOT_ATTACHED);
        }
        let ns = self.active.remove(&nsid).ok_or(NvmeStatus::INVALID_NS)?;
        self.inactive.insert(nsid, ns);
        Ok(())
    }

    /// Active namespace id list page (CNS 0x02).
    pub fn active_list(&self, start: u32) -> Vec<u8> {
        namespace_list(self.active.keys().copied(), start)
    }

    /// Allocated namespace id list page (CNS 0x10), active and inactive ids merged.
    pub fn allocated_list(&self, start: u32) -> Vec<u8> {
        let mut ids: Vec<u32> = self
            .active
            .keys()
            .chain(self.inactive.keys())
            .copied()
            .collect();
        ids.sort_unstable();
        namespace_list(ids.into_iter(), start)
    }

    /// Identify Namespace data for an allocated namespace; inactive ones read as zeroes.
    pub fn identify(&self, nsid: u32) -> Option<Vec<u8>> {
        if let Some(ns) = self.active.get(&nsid) {
            return Some(ns.identify());
        }
        self.inactive
            .contains_key(&nsid)
            .then(|| vec![0u8; IDENTIFY_DATA_SIZE])
    }
}

/// Builds a namespace list page of ids strictly greater than `start`, zero-padded.
fn namespace_list(ids: impl Iterator<Item = u32>, start: u32) -> Vec<u8> {
    let mut data = vec![0u8; IDENTIFY_DATA_SIZE];
    for (slot, nsid) in data
        .chunks_exact_mut(4)
        .zip(ids.filter(|&nsid| nsid > start))
    {
        slot.copy_from_slice(&nsid.to_le_bytes());
    }
    data
}
