//! Physical Region Pointer walking and DMA helpers.
//!
//! Only PRP1/PRP2 and (chained) PRP lists are supported. SGL data pointers are rejected by the
//! dispatcher before a handler ever sees them.

use crate::command::NvmeStatus;
use crate::memory::MemoryBus;
use crate::PAGE_SIZE;

/// Resolves a PRP pair into `(address, length)` segments covering `len` bytes.
pub fn prp_segments(
    memory: &dyn MemoryBus,
    prp1: u64,
    prp2: u64,
    len: usize,
) -> Result<Vec<(u64, usize)>, NvmeStatus> {
    if len == 0 {
        return Ok(Vec::new());
    }

    if prp1 == 0 {
        return Err(NvmeStatus::INVALID_FIELD);
    }

    let page_mask = PAGE_SIZE as u64 - 1;
    let first_offset = (prp1 & page_mask) as usize;
    let first_len = (PAGE_SIZE - first_offset).min(len);

    let mut segs = vec![(prp1, first_len)];
    let mut remaining = len - first_len;
    if remaining == 0 {
        return Ok(segs);
    }

    if prp2 == 0 || prp2 & page_mask != 0 {
        return Err(NvmeStatus::INVALID_FIELD);
    }

    if remaining <= PAGE_SIZE {
        segs.push((prp2, remaining));
        return Ok(segs);
    }

    let entries_per_list = PAGE_SIZE / 8;
    let mut list_addr = prp2;
    while remaining > 0 {
        let pages_needed = remaining.div_ceil(PAGE_SIZE);
        // Chained list: the last entry points at the next list page.
        let pages_this_list = if pages_needed > entries_per_list {
            entries_per_list - 1
        } else {
            pages_needed
        };

        for entry_index in 0..pages_this_list {
            let entry_addr = list_addr + entry_index as u64 * 8;
            let page = memory
                .read_u64(entry_addr)
                .map_err(|_| NvmeStatus::DATA_TRANSFER_ERROR)?;
            if page == 0 || page & page_mask != 0 {
                return Err(NvmeStatus::INVALID_FIELD);
            }

            let chunk = remaining.min(PAGE_SIZE);
            segs.push((page, chunk));
            remaining -= chunk;
        }

        if remaining == 0 {
            break;
        }

        let chain_ptr_addr = list_addr + (entries_per_list as u64 - 1) * 8;
        list_addr = match memory.read_u64(chain_ptr_addr) {
            Ok(next) if next != 0 && next & page_mask == 0 => next,
            Ok(_) => return Err(NvmeStatus::INVALID_FIELD),
            Err(_) => return Err(NvmeStatus::DATA_TRANSFER_ERROR),
        };
    }

    Ok(segs)
}

/// Copies `data` into the host buffer described by the PRP pair.
pub fn dma_write(
    memory: &dyn MemoryBus,
    prp1: u64,
    prp2: u64,
    data: &[u8],
) -> Result<(), NvmeStatus> {
    let mut offset = 0usize;
    for (addr, len) in prp_segments(memory, prp1, prp2, data.len())? {
        memory
            .write_physical(addr, &data[offset..offset + len])
            .map_err(|err| {
                tracing::debug!(%err, "prp write failed");
                NvmeStatus::DATA_TRANSFER_ERROR
            })?;
        offset += len;
    }
    Ok(())
}

/// Fills `data` from the host buffer described by the PRP pair.
pub fn dma_read(
    memory: &dyn MemoryBus,
    prp1: u64,
    prp2: u64,
    data: &mut [u8],
) -> Result<(), NvmeStatus> {
    let mut offset = 0usize;
    for (addr, len) in prp_segments(memory, prp1, prp2, data.len())? {
        memory
            .read_physical(addr, &mut data[offset..offset + len])
            .map_err(|err| {
                tracing::debug!(%err, "prp read failed");
                NvmeStatus::DATA_TRANSFER_ERROR
            })?;
        offset += len;
    }
    Ok(())
}
