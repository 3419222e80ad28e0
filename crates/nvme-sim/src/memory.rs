use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use thiserror::Error;

use crate::PAGE_SIZE;

/// Errors returned when the controller cannot access host memory.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoryError {
    #[error("host memory access out of bounds: addr={addr:#x} len={len}")]
    OutOfBounds { addr: u64, len: usize },

    #[error("host memory exhausted: requested {requested} bytes")]
    Exhausted { requested: usize },
}

/// Host physical memory as seen by the controller for queue and data transfers.
///
/// Both the host thread and the controller's watcher thread access memory concurrently, so all
/// accessors take `&self`; implementations provide their own synchronisation.
pub trait MemoryBus: Send + Sync {
    fn read_physical(&self, paddr: u64, buf: &mut [u8]) -> Result<(), MemoryError>;
    fn write_physical(&self, paddr: u64, buf: &[u8]) -> Result<(), MemoryError>;

    fn read_u16(&self, paddr: u64) -> Result<u16, MemoryError> {
        let mut buf = [0u8; 2];
        self.read_physical(paddr, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn read_u32(&self, paddr: u64) -> Result<u32, MemoryError> {
        let mut buf = [0u8; 4];
        self.read_physical(paddr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_u64(&self, paddr: u64) -> Result<u64, MemoryError> {
        let mut buf = [0u8; 8];
        self.read_physical(paddr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn write_u16(&self, paddr: u64, val: u16) -> Result<(), MemoryError> {
        self.write_physical(paddr, &val.to_le_bytes())
    }

    fn write_u32(&self, paddr: u64, val: u32) -> Result<(), MemoryError> {
        self.write_physical(paddr, &val.to_le_bytes())
    }

    fn write_u64(&self, paddr: u64, val: u64) -> Result<(), MemoryError> {
        self.write_physical(paddr, &val.to_le_bytes())
    }
}

/// Flat, zero-initialised host RAM starting at physical address 0.
///
/// Page 0 is never handed out by [`HostMemory::alloc_pages`] so that a zero address can keep its
/// "not set" meaning in PRP and queue base fields.
#[derive(Debug)]
pub struct HostMemory {
    bytes: Mutex<Vec<u8>>,
    next_page: AtomicU64,
    size: u64,
}

impl HostMemory {
    pub fn new(size: usize) -> Self {
        Self {
            bytes: Mutex::new(vec![0u8; size]),
            next_page: AtomicU64::new(PAGE_SIZE as u64),
            size: size as u64,
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Reserves `count` contiguous, page-aligned pages and returns the physical address of the
    /// first one. Allocations are never freed.
    pub fn alloc_pages(&self, count: usize) -> Result<u64, MemoryError> {
        let len = (count.max(1) * PAGE_SIZE) as u64;
        let addr = self.next_page.fetch_add(len, Ordering::SeqCst);
        if addr.checked_add(len).map_or(true, |end| end > self.size) {
            return Err(MemoryError::Exhausted {
                requested: len as usize,
            });
        }
        Ok(addr)
    }

    fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        match self.bytes.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn range(&self, paddr: u64, len: usize) -> Result<std::ops::Range<usize>, MemoryError> {
        let err = MemoryError::OutOfBounds { addr: paddr, len };
        let start = usize::try_from(paddr).map_err(|_| err.clone())?;
        let end = start.checked_add(len).ok_or_else(|| err.clone())?;
        if end as u64 > self.size {
            return Err(err);
        }
        Ok(start..end)
    }
}

impl MemoryBus for HostMemory {
    fn read_physical(&self, paddr: u64, buf: &mut [u8]) -> Result<(), MemoryError> {
        let range = self.range(paddr, buf.len())?;
        buf.copy_from_slice(&self.lock()[range]);
        Ok(())
    }

    fn write_physical(&self, paddr: u64, buf: &[u8]) -> Result<(), MemoryError> {
        let range = self.range(paddr, buf.len())?;
        self.lock()[range].copy_from_slice(buf);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_bounds_access_is_rejected() {
        let mem = HostMemory::new(PAGE_SIZE);
        let mut buf = [0u8; 8];
        assert_eq!(
            mem.read_physical(PAGE_SIZE as u64 - 4, &mut buf),
            Err(MemoryError::OutOfBounds {
                addr: PAGE_SIZE as u64 - 4,
                len: 8
            })
        );
        assert!(mem.write_u64(u64::MAX - 2, 1).is_err());
    }

    #[test]
    fn alloc_pages_skips_page_zero_and_stays_aligned() {
        let mem = HostMemory::new(4 * PAGE_SIZE);
        let a = mem.alloc_pages(1).unwrap();
        let b = mem.alloc_pages(2).unwrap();
        assert_eq!(a, PAGE_SIZE as u64);
        assert_eq!(b, 2 * PAGE_SIZE as u64);
        assert!(matches!(
            mem.alloc_pages(1),
            Err(MemoryError::Exhausted { .. })
        ));
    }

    #[test]
    fn little_endian_helpers() {
        let mem = HostMemory::new(PAGE_SIZE);
        mem.write_u32(0x10, 0xdead_beef).unwrap();
        assert_eq!(mem.read_u16(0x10).unwrap(), 0xbeef);
        assert_eq!(mem.read_u32(0x10).unwrap(), 0xdead_beef);
    }
}
