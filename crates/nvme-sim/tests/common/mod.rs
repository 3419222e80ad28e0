#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use nvme_sim::command::{COMMAND_SIZE, COMPLETION_SIZE};
use nvme_sim::{
    CompletionEntry, Controller, ControllerConfig, ControllerStatus, HostMemory, MemoryBus,
    NvmeCommand, PAGE_SIZE,
};

pub const HOST_MEMORY_SIZE: usize = 8 * 1024 * 1024;

pub const OPC_DELETE_IO_SQ: u8 = 0x00;
pub const OPC_CREATE_IO_SQ: u8 = 0x01;
pub const OPC_GET_LOG_PAGE: u8 = 0x02;
pub const OPC_DELETE_IO_CQ: u8 = 0x04;
pub const OPC_CREATE_IO_CQ: u8 = 0x05;
pub const OPC_IDENTIFY: u8 = 0x06;
pub const OPC_FIRMWARE_COMMIT: u8 = 0x10;
pub const OPC_FIRMWARE_DOWNLOAD: u8 = 0x11;
pub const OPC_NS_ATTACHMENT: u8 = 0x15;
pub const OPC_KEEP_ALIVE: u8 = 0x18;
pub const OPC_FORMAT_NVM: u8 = 0x80;

pub const OPC_FLUSH: u8 = 0x00;
pub const OPC_WRITE: u8 = 0x01;
pub const OPC_READ: u8 = 0x02;

#[derive(Debug, Clone, Copy)]
struct HostSq {
    base: u64,
    depth: u16,
    tail: u16,
}

#[derive(Debug, Clone, Copy)]
struct HostCq {
    base: u64,
    depth: u16,
    head: u16,
}

/// Drives a [`Controller`] the way a host driver would.
pub struct Harness {
    pub controller: Controller,
    pub mem: Arc<HostMemory>,
    sqs: HashMap<u16, HostSq>,
    cqs: HashMap<u16, HostCq>,
}

impl Harness {
    /// A controller with the default config, not yet enabled.
    pub fn new() -> Self {
        Self::with_config(ControllerConfig::default())
    }

    pub fn with_config(config: ControllerConfig) -> Self {
        let mem = Arc::new(HostMemory::new(HOST_MEMORY_SIZE));
        let controller = Controller::new(config, mem.clone()).unwrap();
        Harness {
            controller,
            mem,
            sqs: HashMap::new(),
            cqs: HashMap::new(),
        }
    }

    /// A controller enabled with an admin queue pair of depth 2/2.
    pub fn enabled() -> Self {
        let mut h = Self::new();
        h.enable(2, 2);
        h
    }

    pub fn alloc_queue(&self, depth: u16, entry_size: usize) -> u64 {
        let pages = (depth as usize * entry_size).div_ceil(PAGE_SIZE);
        self.mem.alloc_pages(pages).unwrap()
    }

    pub fn alloc_buffer(&self, len: usize) -> u64 {
        self.mem.alloc_pages(len.div_ceil(PAGE_SIZE)).unwrap()
    }

    /// Programs the admin queues, sets CC.EN and waits for CSTS.RDY.
    pub fn enable(&mut self, sq_depth: u16, cq_depth: u16) {
        let asq = self.alloc_queue(sq_depth, COMMAND_SIZE);
        let acq = self.alloc_queue(cq_depth, COMPLETION_SIZE);
        let regs = self.controller.registers();
        regs.set_admin_queue_depths(sq_depth, cq_depth);
        regs.set_admin_submission_queue(asq);
        regs.set_admin_completion_queue(acq);
        regs.set_enable(true);

        self.wait_for_status(|csts| csts.contains(ControllerStatus::READY));
        self.sqs.clear();
        self.cqs.clear();
        self.sqs.insert(
            0,
            HostSq {
                base: asq,
                depth: sq_depth,
                tail: 0,
            },
        );
        self.cqs.insert(
            0,
            HostCq {
                base: acq,
                depth: cq_depth,
                head: 0,
            },
        );
    }

    /// Runs loop iterations until `pred` holds for CSTS. Panics after a bounded number of tries.
    pub fn wait_for_status(&self, pred: impl Fn(ControllerStatus) -> bool) {
        for _ in 0..1000 {
            if pred(self.controller.csts()) {
                return;
            }
            self.controller.wait_for_change_loop();
        }
        panic!("controller status never matched: {:?}", self.controller.csts());
    }

    /// Forgets host-side queue state after a controller reset; the admin pair restarts at slot 0.
    pub fn host_reset(&mut self) {
        self.sqs.retain(|&id, _| id == 0);
        self.cqs.retain(|&id, _| id == 0);
        for sq in self.sqs.values_mut() {
            sq.tail = 0;
        }
        for cq in self.cqs.values_mut() {
            cq.head = 0;
        }
    }

    /// Writes `cmd` into the next slot of `sqid` without ringing the doorbell.
    pub fn write_command(&mut self, sqid: u16, cmd: NvmeCommand) {
        let sq = self.sqs.get_mut(&sqid).expect("unknown host sq");
        let addr = sq.base + sq.tail as u64 * COMMAND_SIZE as u64;
        self.mem.write_physical(addr, &cmd.to_bytes()).unwrap();
        sq.tail = (sq.tail + 1) % sq.depth;
    }

    pub fn ring(&self, sqid: u16) {
        let tail = self.sqs[&sqid].tail;
        self.controller
            .registers()
            .ring_submission_doorbell(sqid, tail);
    }

    pub fn submit(&mut self, sqid: u16, cmd: NvmeCommand) {
        self.write_command(sqid, cmd);
        self.ring(sqid);
    }

    /// Reads every completion posted to `cqid` since the last call, in posting order.
    pub fn completions(&mut self, cqid: u16) -> Vec<CompletionEntry> {
        let published = self
            .controller
            .registers()
            .completion_doorbell(cqid)
            .unwrap() as u16;
        let cq = self.cqs.get_mut(&cqid).expect("unknown host cq");
        let mut out = Vec::new();
        while cq.head != published {
            out.push(read_completion(&self.mem, cq.base, cq.head));
            cq.head = (cq.head + 1) % cq.depth;
        }
        out
    }

    /// Submits one command, runs a loop iteration and returns its single completion.
    pub fn execute(&mut self, sqid: u16, cqid: u16, cmd: NvmeCommand) -> CompletionEntry {
        self.submit(sqid, cmd);
        self.controller.wait_for_change_loop();
        let mut cqes = self.completions(cqid);
        assert_eq!(cqes.len(), 1, "expected exactly one completion: {cqes:?}");
        cqes.remove(0)
    }

    pub fn admin(&mut self, cmd: NvmeCommand) -> CompletionEntry {
        self.execute(0, 0, cmd)
    }

    /// Creates I/O CQ `qid` followed by I/O SQ `qid` paired with it.
    pub fn create_io_pair(&mut self, qid: u16, depth: u16) {
        let cqe = self.create_io_cq(qid, depth);
        assert!(cqe.succeeded(), "create cq {qid}: {:?}", cqe.nvme_status());
        let cqe = self.create_io_sq(qid, depth, qid);
        assert!(cqe.succeeded(), "create sq {qid}: {:?}", cqe.nvme_status());
    }

    pub fn create_io_cq(&mut self, qid: u16, depth: u16) -> CompletionEntry {
        let base = self.alloc_queue(depth, COMPLETION_SIZE);
        let cqe = self.admin(create_cq_command(next_cid(), qid, depth, base));
        if cqe.succeeded() {
            self.cqs.insert(qid, HostCq { base, depth, head: 0 });
        }
        cqe
    }

    pub fn create_io_sq(&mut self, qid: u16, depth: u16, cqid: u16) -> CompletionEntry {
        let base = self.alloc_queue(depth, COMMAND_SIZE);
        let cqe = self.admin(create_sq_command(next_cid(), qid, depth, base, cqid));
        if cqe.succeeded() {
            self.sqs.insert(qid, HostSq { base, depth, tail: 0 });
        }
        cqe
    }

    pub fn delete_io_sq(&mut self, qid: u16) -> CompletionEntry {
        let cqe = self.admin(NvmeCommand::new(OPC_DELETE_IO_SQ, next_cid()).with_cdw10(qid as u32));
        if cqe.succeeded() {
            self.sqs.remove(&qid);
        }
        cqe
    }

    pub fn delete_io_cq(&mut self, qid: u16) -> CompletionEntry {
        let cqe = self.admin(NvmeCommand::new(OPC_DELETE_IO_CQ, next_cid()).with_cdw10(qid as u32));
        if cqe.succeeded() {
            self.cqs.remove(&qid);
        }
        cqe
    }

    /// Identify with `cns`/`nsid` into a freshly allocated page; returns the completion and data.
    pub fn identify(&mut self, cns: u8, nsid: u32) -> (CompletionEntry, Vec<u8>) {
        let buf = self.alloc_buffer(PAGE_SIZE);
        let cmd = NvmeCommand::new(OPC_IDENTIFY, next_cid())
            .with_nsid(nsid)
            .with_prp(buf, 0)
            .with_cdw10(cns as u32);
        let cqe = self.admin(cmd);
        (cqe, self.read_bytes(buf, PAGE_SIZE))
    }

    pub fn write_bytes(&self, addr: u64, data: &[u8]) {
        self.mem.write_physical(addr, data).unwrap();
    }

    pub fn read_bytes(&self, addr: u64, len: usize) -> Vec<u8> {
        let mut data = vec![0u8; len];
        self.mem.read_physical(addr, &mut data).unwrap();
        data
    }
}

pub fn read_completion(mem: &HostMemory, base: u64, slot: u16) -> CompletionEntry {
    let mut bytes = [0u8; COMPLETION_SIZE];
    mem.read_physical(base + slot as u64 * COMPLETION_SIZE as u64, &mut bytes)
        .unwrap();
    CompletionEntry::from_bytes(&bytes)
}

/// Command ids for setup commands, kept away from the small ids tests use explicitly.
pub fn next_cid() -> u16 {
    use std::sync::atomic::{AtomicU16, Ordering};
    static NEXT: AtomicU16 = AtomicU16::new(0x8000);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

pub fn create_cq_command(cid: u16, qid: u16, depth: u16, base: u64) -> NvmeCommand {
    NvmeCommand::new(OPC_CREATE_IO_CQ, cid)
        .with_prp(base, 0)
        .with_cdw10((depth as u32 - 1) << 16 | qid as u32)
        .with_cdw11(1) // PC
}

pub fn create_sq_command(cid: u16, qid: u16, depth: u16, base: u64, cqid: u16) -> NvmeCommand {
    NvmeCommand::new(OPC_CREATE_IO_SQ, cid)
        .with_prp(base, 0)
        .with_cdw10((depth as u32 - 1) << 16 | qid as u32)
        .with_cdw11((cqid as u32) << 16 | 1)
}

pub fn list_ids(page: &[u8]) -> Vec<u32> {
    page.chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .take_while(|&id| id != 0)
        .collect()
}
