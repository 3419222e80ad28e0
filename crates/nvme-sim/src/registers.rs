//! BAR0 controller register file and doorbells.
//!
//! Registers are shared between the host thread and the doorbell-watch thread through an
//! `Arc<ControllerRegisters>`. Every register is an atomic; the host only ever writes CC, AQA,
//! ASQ, ACQ, INTMS/INTMC and doorbells, while CSTS is written by the controller alone.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use bitflags::bitflags;

pub const REG_CAP: u64 = 0x0000;
pub const REG_VS: u64 = 0x0008;
pub const REG_INTMS: u64 = 0x000c;
pub const REG_INTMC: u64 = 0x0010;
pub const REG_CC: u64 = 0x0014;
pub const REG_CSTS: u64 = 0x001c;
pub const REG_AQA: u64 = 0x0024;
pub const REG_ASQ: u64 = 0x0028;
pub const REG_ACQ: u64 = 0x0030;
pub const DOORBELL_BASE: u64 = 0x1000;

/// Doorbell stride in bytes (CAP.DSTRD = 0).
pub const DOORBELL_STRIDE: u64 = 4;

/// Controller-reported NVMe version (1.4.0).
pub const NVME_VERSION: u32 = 0x0001_0400;

/// Largest admin queue depth encodable in AQA (12-bit, 0's based).
pub const MAX_ADMIN_QUEUE_DEPTH: u16 = 4096;

bitflags! {
    /// Controller Configuration (CC) single-bit fields.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ControllerConfiguration: u32 {
        const ENABLE = 1 << 0;
        const SHUTDOWN_NORMAL = 1 << 14;
        const SHUTDOWN_ABRUPT = 1 << 15;
    }
}

bitflags! {
    /// Controller Status (CSTS).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ControllerStatus: u32 {
        const READY = 1 << 0;
        const FATAL = 1 << 1;
        const SHUTDOWN_OCCURRING = 1 << 2;
        const SHUTDOWN_COMPLETE = 1 << 3;
    }
}

impl ControllerConfiguration {
    /// Memory Page Size field (CC.MPS), page size is `2 ^ (12 + mps)`.
    pub fn memory_page_size(self) -> u32 {
        (self.bits() >> 7) & 0xf
    }

    pub fn shutdown_requested(self) -> bool {
        self.intersects(Self::SHUTDOWN_NORMAL | Self::SHUTDOWN_ABRUPT)
    }
}

/// Byte offset of the submission queue tail doorbell for `qid`.
pub const fn sq_tail_doorbell(qid: u16) -> u64 {
    DOORBELL_BASE + (2 * qid as u64) * DOORBELL_STRIDE
}

/// Byte offset of the completion queue head doorbell for `qid`.
pub const fn cq_head_doorbell(qid: u16) -> u64 {
    DOORBELL_BASE + (2 * qid as u64 + 1) * DOORBELL_STRIDE
}

#[derive(Debug, Default)]
struct DoorbellPair {
    sq_tail: AtomicU32,
    cq_head: AtomicU32,
}

/// Decoded Admin Queue Attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdminQueueAttributes {
    pub submission_depth: u16,
    pub completion_depth: u16,
}

impl AdminQueueAttributes {
    pub fn decode(aqa: u32) -> Self {
        AdminQueueAttributes {
            submission_depth: ((aqa >> 16) & 0x0fff) as u16 + 1,
            completion_depth: (aqa & 0x0fff) as u16 + 1,
        }
    }

    pub fn encode(self) -> u32 {
        let sq = self.submission_depth.saturating_sub(1) as u32 & 0x0fff;
        let cq = self.completion_depth.saturating_sub(1) as u32 & 0x0fff;
        sq << 16 | cq
    }
}

#[derive(Debug)]
pub struct ControllerRegisters {
    cap: u64,
    vs: u32,
    intms: AtomicU32,
    cc: AtomicU32,
    csts: AtomicU32,
    aqa: AtomicU32,
    asq: AtomicU64,
    acq: AtomicU64,
    doorbells: Box<[DoorbellPair]>,
}

impl ControllerRegisters {
    /// `max_queue_entries` is the largest I/O queue depth (CAP.MQES + 1); `max_queue_id` sizes the
    /// doorbell array.
    pub fn new(max_queue_entries: u16, max_queue_id: u16) -> Self {
        let mqes = max_queue_entries.saturating_sub(1) as u64;
        let cqr: u64 = 1; // Queues must be physically contiguous.
        let timeout: u64 = 1; // 500ms units.
        let dstrd: u64 = 0;
        let css_nvm: u64 = 1;
        let mpsmin: u64 = 0; // 4KiB
        let mpsmax: u64 = 0;
        let cap = mqes
            | (cqr << 16)
            | (timeout << 24)
            | (dstrd << 32)
            | (css_nvm << 37)
            | (mpsmin << 48)
            | (mpsmax << 52);

        let doorbells = (0..=max_queue_id as usize)
            .map(|_| DoorbellPair::default())
            .collect();

        ControllerRegisters {
            cap,
            vs: NVME_VERSION,
            intms: AtomicU32::new(0),
            cc: AtomicU32::new(0),
            csts: AtomicU32::new(0),
            aqa: AtomicU32::new(0),
            asq: AtomicU64::new(0),
            acq: AtomicU64::new(0),
            doorbells,
        }
    }

    /// Size of the BAR0 window: register page plus the doorbell array.
    pub fn bar0_len(&self) -> u64 {
        let end = DOORBELL_BASE + self.doorbells.len() as u64 * 2 * DOORBELL_STRIDE;
        end.next_power_of_two()
    }

    pub fn mmio_read(&self, offset: u64, size: usize) -> u64 {
        match (offset, size) {
            (REG_CAP, 8) => self.cap,
            (REG_CAP, 4) => self.cap & 0xffff_ffff,
            (0x0004, 4) => self.cap >> 32,
            (REG_VS, 4) => self.vs as u64,
            (REG_INTMS, 4) => self.intms.load(Ordering::SeqCst) as u64,
            (REG_INTMC, 4) => 0,
            (REG_CC, 4) => self.cc.load(Ordering::SeqCst) as u64,
            (REG_CSTS, 4) => self.csts.load(Ordering::SeqCst) as u64,
            (REG_AQA, 4) => self.aqa.load(Ordering::SeqCst) as u64,
            (REG_ASQ, 8) => self.asq.load(Ordering::SeqCst),
            (REG_ACQ, 8) => self.acq.load(Ordering::SeqCst),
            _ if offset >= DOORBELL_BASE && size == 4 => match self.doorbell_slot(offset) {
                Some((db, false)) => db.sq_tail.load(Ordering::SeqCst) as u64,
                Some((db, true)) => db.cq_head.load(Ordering::SeqCst) as u64,
                None => 0,
            },
            _ => 0,
        }
    }

    pub fn mmio_write(&self, offset: u64, size: usize, value: u64) {
        let enabled = self.cc().contains(ControllerConfiguration::ENABLE);
        match (offset, size) {
            (REG_INTMS, 4) => {
                self.intms.fetch_or(value as u32, Ordering::SeqCst);
            }
            (REG_INTMC, 4) => {
                self.intms.fetch_and(!(value as u32), Ordering::SeqCst);
            }
            (REG_CC, 4) => self.cc.store(value as u32, Ordering::SeqCst),
            // Admin queue registers are only writable while the controller is disabled.
            (REG_AQA, 4) if !enabled => self.aqa.store(value as u32, Ordering::SeqCst),
            (REG_ASQ, 8) if !enabled => self.asq.store(value, Ordering::SeqCst),
            (REG_ACQ, 8) if !enabled => self.acq.store(value, Ordering::SeqCst),
            _ if offset >= DOORBELL_BASE && size == 4 => {
                if !self.csts().contains(ControllerStatus::READY) {
                    return;
                }
                match self.doorbell_slot(offset) {
                    Some((db, false)) => db.sq_tail.store(value as u32, Ordering::SeqCst),
                    Some((db, true)) => db.cq_head.store(value as u32, Ordering::SeqCst),
                    None => {
                        tracing::warn!(offset, "doorbell write beyond supported queue range");
                    }
                }
            }
            _ => {}
        }
    }

    fn doorbell_slot(&self, offset: u64) -> Option<(&DoorbellPair, bool)> {
        let idx = (offset - DOORBELL_BASE) / DOORBELL_STRIDE;
        let pair = self.doorbells.get((idx / 2) as usize)?;
        Some((pair, idx % 2 == 1))
    }

    pub fn cap(&self) -> u64 {
        self.cap
    }

    /// Largest supported queue depth (CAP.MQES + 1).
    pub fn max_queue_entries(&self) -> u32 {
        (self.cap & 0xffff) as u32 + 1
    }

    /// Highest queue id that has a doorbell pair.
    pub fn max_queue_id(&self) -> u16 {
        (self.doorbells.len() - 1) as u16
    }

    pub fn cc(&self) -> ControllerConfiguration {
        ControllerConfiguration::from_bits_retain(self.cc.load(Ordering::SeqCst))
    }

    pub fn csts(&self) -> ControllerStatus {
        ControllerStatus::from_bits_retain(self.csts.load(Ordering::SeqCst))
    }

    pub fn aqa(&self) -> AdminQueueAttributes {
        AdminQueueAttributes::decode(self.aqa.load(Ordering::SeqCst))
    }

    pub fn asq(&self) -> u64 {
        self.asq.load(Ordering::SeqCst)
    }

    pub fn acq(&self) -> u64 {
        self.acq.load(Ordering::SeqCst)
    }

    pub fn set_admin_queue_depths(&self, submission_depth: u16, completion_depth: u16) {
        let aqa = AdminQueueAttributes {
            submission_depth,
            completion_depth,
        };
        self.mmio_write(REG_AQA, 4, aqa.encode() as u64);
    }

    pub fn set_admin_submission_queue(&self, base: u64) {
        self.mmio_write(REG_ASQ, 8, base);
    }

    pub fn set_admin_completion_queue(&self, base: u64) {
        self.mmio_write(REG_ACQ, 8, base);
    }

    /// Sets or clears CC.EN, leaving the other CC fields untouched.
    pub fn set_enable(&self, enable: bool) {
        let mut cc = self.cc();
        cc.set(ControllerConfiguration::ENABLE, enable);
        self.mmio_write(REG_CC, 4, cc.bits() as u64);
    }

    pub fn ring_submission_doorbell(&self, qid: u16, tail: u16) {
        self.mmio_write(sq_tail_doorbell(qid), 4, tail as u64);
    }

    pub fn ring_completion_doorbell(&self, qid: u16, head: u16) {
        self.mmio_write(cq_head_doorbell(qid), 4, head as u64);
    }

    pub fn submission_doorbell(&self, qid: u16) -> Option<u32> {
        self.doorbells
            .get(qid as usize)
            .map(|db| db.sq_tail.load(Ordering::SeqCst))
    }

    pub fn completion_doorbell(&self, qid: u16) -> Option<u32> {
        self.doorbells
            .get(qid as usize)
            .map(|db| db.cq_head.load(Ordering::SeqCst))
    }

    pub(crate) fn set_csts(&self, csts: ControllerStatus) {
        self.csts.store(csts.bits(), Ordering::SeqCst);
    }

    pub(crate) fn update_csts(&self, f: impl FnOnce(&mut ControllerStatus)) {
        let mut csts = self.csts();
        f(&mut csts);
        self.set_csts(csts);
    }

    /// Publishes the controller's completion queue tail through the completion doorbell.
    pub(crate) fn publish_completion_tail(&self, qid: u16, tail: u16) {
        if let Some(db) = self.doorbells.get(qid as usize) {
            db.cq_head.store(tail as u32, Ordering::SeqCst);
        }
    }

    pub(crate) fn clear_submission_doorbell(&self, qid: u16) {
        if let Some(db) = self.doorbells.get(qid as usize) {
            db.sq_tail.store(0, Ordering::SeqCst);
        }
    }

    pub(crate) fn clear_completion_doorbell(&self, qid: u16) {
        if let Some(db) = self.doorbells.get(qid as usize) {
            db.cq_head.store(0, Ordering::SeqCst);
        }
    }

    pub(crate) fn clear_all_doorbells(&self) {
        for db in self.doorbells.iter() {
            db.sq_tail.store(0, Ordering::SeqCst);
            db.cq_head.store(0, Ordering::SeqCst);
        }
    }
}
