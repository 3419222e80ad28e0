use std::collections::HashMap;
use std::sync::Arc;

use crate::cid::CommandIdTracker;
use crate::command::{
    AdminOpcode, CompletionEntry, NvmOpcode, NvmeCommand, NvmeStatus, COMMAND_SIZE,
    COMPLETION_SIZE,
};
use crate::config::ControllerConfig;
use crate::error::{ConfigError, ControllerFault};
use crate::firmware::{FirmwareImage, FirmwareSlots, FirmwareStore};
use crate::identify::IdentifyController;
use crate::memory::MemoryBus;
use crate::namespace::NamespaceRegistry;
use crate::prp;
use crate::queue::{Queue, QueueArena, ADMIN_QUEUE_ID};
use crate::registers::{ControllerConfiguration, ControllerRegisters, ControllerStatus};
use crate::responder::CommandResponder;
use crate::PAGE_SIZE;

const UNLIMITED_TRANSFER_CAP: usize = PAGE_SIZE << 12;

/// Handler outcome: `Ok(dw0)` completes successfully with that command specific result.
pub(super) type HandlerResult = Result<u32, NvmeStatus>;

/// Everything the doorbell watch loop mutates. Lives behind the controller's state mutex.
pub(crate) struct ControllerState {
    pub(super) config: ControllerConfig,
    pub(super) registers: Arc<ControllerRegisters>,
    pub(super) memory: Arc<dyn MemoryBus>,
    pub(super) queues: QueueArena,
    pub(super) command_ids: CommandIdTracker,
    pub(super) namespaces: NamespaceRegistry,
    pub(super) firmware: FirmwareSlots,
    pub(super) firmware_store: FirmwareStore,
    pub(super) identify: IdentifyController,
    pub(super) responder: Box<dyn CommandResponder>,
    /// CC.EN as of the previous iteration.
    enabled: bool,
    /// Last out-of-range tail doorbell value reported per queue, so it is logged once.
    rejected_doorbells: HashMap<u16, u32>,
    pub(super) last_fault: Option<ControllerFault>,
}

impl ControllerState {
    pub(super) fn new(
        config: ControllerConfig,
        registers: Arc<ControllerRegisters>,
        memory: Arc<dyn MemoryBus>,
        responder: Box<dyn CommandResponder>,
    ) -> Result<Self, ConfigError> {
        let firmware = FirmwareSlots::new(
            config.firmware_slots,
            FirmwareImage::with_revision(&config.firmware_revision),
        );
        let identify = IdentifyController::from_config(&config);
        let firmware_store = FirmwareStore::new(config.max_firmware_image_bytes);
        let mut state = ControllerState {
            config,
            registers,
            memory,
            queues: QueueArena::default(),
            command_ids: CommandIdTracker::default(),
            namespaces: NamespaceRegistry::default(),
            firmware,
            firmware_store,
            identify,
            responder,
            enabled: false,
            rejected_doorbells: HashMap::new(),
            last_fault: None,
        };

        let (admin_sq, admin_cq) = (state.admin_submission_queue(), state.admin_completion_queue());
        state.queues.insert(admin_sq);
        state.queues.insert(admin_cq);
        state.provision_namespaces()?;
        state.firmware_store.clear();
        Ok(state)
    }

    fn provision_namespaces(&mut self) -> Result<(), ConfigError> {
        self.namespaces.clear();
        for ns_config in &self.config.namespaces {
            let ns = ns_config.build()?;
            self.namespaces.insert(ns, ns_config.active)?;
        }
        Ok(())
    }

    fn admin_submission_queue(&self) -> Queue {
        let aqa = self.registers.aqa();
        Queue::submission(
            ADMIN_QUEUE_ID,
            aqa.submission_depth,
            self.registers.asq(),
            ADMIN_QUEUE_ID,
        )
    }

    fn admin_completion_queue(&self) -> Queue {
        let aqa = self.registers.aqa();
        Queue::completion(ADMIN_QUEUE_ID, aqa.completion_depth, self.registers.acq())
    }

    /// Controller level reset. Namespaces and firmware slot contents survive; everything tied to
    /// the host's queue setup does not.
    pub(super) fn reset(&mut self) {
        self.queues.clear_io_queues();
        self.command_ids.clear();
        self.identify = IdentifyController::from_config(&self.config);
        if let Some(slot) = self.firmware.apply_pending_activation() {
            tracing::info!(slot, "activated firmware slot on reset");
        }
        let (admin_sq, admin_cq) = (self.admin_submission_queue(), self.admin_completion_queue());
        self.queues.insert(admin_sq);
        self.queues.insert(admin_cq);
        self.registers.clear_all_doorbells();
        self.rejected_doorbells.clear();
        self.last_fault = None;
        self.registers
            .update_csts(|csts| csts.remove(ControllerStatus::FATAL));
    }

    fn enable(&mut self) -> Result<(), ControllerFault> {
        let aqa = self.registers.aqa();
        let asq = self.registers.asq();
        let acq = self.registers.acq();
        let page_mask = PAGE_SIZE as u64 - 1;

        if asq == 0 || acq == 0 {
            return Err(ControllerFault::InvalidEnable("admin queue base address not set"));
        }
        if asq & page_mask != 0 || acq & page_mask != 0 {
            return Err(ControllerFault::InvalidEnable(
                "admin queue base address not page aligned",
            ));
        }
        if aqa.submission_depth < 2 || aqa.completion_depth < 2 {
            return Err(ControllerFault::InvalidEnable("admin queue depth below 2"));
        }
        let max_depth = self.registers.max_queue_entries();
        if aqa.submission_depth as u32 > max_depth || aqa.completion_depth as u32 > max_depth {
            return Err(ControllerFault::InvalidEnable("admin queue depth exceeds CAP.MQES"));
        }
        if self.registers.cc().memory_page_size() != 0 {
            return Err(ControllerFault::InvalidEnable("unsupported memory page size"));
        }

        self.reset();
        self.registers.set_csts(ControllerStatus::READY);
        tracing::info!(
            asq = format_args!("{asq:#x}"),
            acq = format_args!("{acq:#x}"),
            sq_depth = aqa.submission_depth,
            cq_depth = aqa.completion_depth,
            "controller enabled"
        );
        Ok(())
    }

    fn fatal(&mut self, fault: ControllerFault) {
        tracing::error!(%fault, "controller fatal status");
        self.registers
            .update_csts(|csts| csts.insert(ControllerStatus::FATAL));
        self.last_fault = Some(fault);
    }

    /// One iteration of the doorbell watch loop.
    pub(super) fn check_for_changes(&mut self) {
        let cc = self.registers.cc();
        let enable = cc.contains(ControllerConfiguration::ENABLE);
        if enable != self.enabled {
            self.enabled = enable;
            if enable {
                if let Err(fault) = self.enable() {
                    self.fatal(fault);
                }
            } else {
                self.reset();
                self.registers.set_csts(ControllerStatus::empty());
                tracing::info!("controller disabled");
            }
        }

        let csts = self.registers.csts();
        if cc.shutdown_requested() && !csts.contains(ControllerStatus::SHUTDOWN_COMPLETE) {
            self.registers.update_csts(|csts| {
                csts.remove(ControllerStatus::SHUTDOWN_OCCURRING);
                csts.insert(ControllerStatus::SHUTDOWN_COMPLETE);
            });
            tracing::info!("shutdown complete");
        }

        let csts = self.registers.csts();
        if !csts.contains(ControllerStatus::READY) || csts.contains(ControllerStatus::FATAL) {
            return;
        }

        for sqid in self.queues.submission_ids() {
            if let Err(fault) = self.process_submission_queue(sqid) {
                self.fatal(fault);
                return;
            }
        }
    }

    fn process_submission_queue(&mut self, sqid: u16) -> Result<(), ControllerFault> {
        let Some(doorbell) = self.registers.submission_doorbell(sqid) else {
            return Ok(());
        };
        let Some(sq) = self.queues.submission(sqid) else {
            return Ok(());
        };
        if doorbell == sq.tail as u32 {
            return Ok(());
        }
        if doorbell >= sq.depth as u32 {
            if self.rejected_doorbells.insert(sqid, doorbell) != Some(doorbell) {
                tracing::warn!(sqid, doorbell, depth = sq.depth, "ignoring invalid tail doorbell");
            }
            return Ok(());
        }

        let new_tail = doorbell as u16;
        let cqid = sq.paired_completion_queue().unwrap_or(ADMIN_QUEUE_ID);

        // Fetch the whole batch before executing anything so that duplicate ids inside one
        // doorbell write are caught.
        let mut batch = Vec::new();
        let mut head = sq.head;
        while head != new_tail {
            let mut bytes = [0u8; COMMAND_SIZE];
            self.memory
                .read_physical(sq.slot_address(head), &mut bytes)
                .map_err(|source| ControllerFault::SubmissionQueueRead { sqid, source })?;
            let cmd = NvmeCommand::parse(&bytes);
            let admitted = self.command_ids.admit(sqid, cmd.cid);
            batch.push((cmd, admitted));
            head = sq.next_index(head);
        }

        if let Some(sq) = self.queues.submission_mut(sqid) {
            sq.head = head;
            sq.tail = new_tail;
        }
        self.rejected_doorbells.remove(&sqid);

        if let Some(cq) = self.queues.completion(cqid) {
            if batch.len() > cq.capacity() {
                tracing::warn!(
                    sqid,
                    cqid,
                    batch = batch.len(),
                    cq_depth = cq.depth,
                    "batch overruns completion queue; unread entries will be overwritten"
                );
            }
        }

        for (cmd, admitted) in batch {
            let cqe = if admitted {
                self.execute(sqid, &cmd)
            } else {
                tracing::debug!(sqid, cid = cmd.cid, "command id conflict");
                CompletionEntry::new(NvmeStatus::COMMAND_ID_CONFLICT)
            };
            self.post_completion(sqid, head, cqid, cqe, cmd.cid, admitted)?;
        }
        Ok(())
    }

    fn execute(&mut self, sqid: u16, cmd: &NvmeCommand) -> CompletionEntry {
        match self.responder.respond(sqid, cmd) {
            Ok(Some(cqe)) => {
                tracing::debug!(sqid, cid = cmd.cid, opc = cmd.opc, "completed by command responder");
                return cqe;
            }
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(%err, "command responder failed; using built-in handler");
            }
        }

        let result = if cmd.psdt != 0 {
            Err(NvmeStatus::INVALID_FIELD)
        } else if sqid == ADMIN_QUEUE_ID {
            match AdminOpcode::try_from(cmd.opc) {
                Ok(op) => self.dispatch_admin(op, cmd),
                Err(_) => Err(NvmeStatus::INVALID_OPCODE),
            }
        } else {
            match NvmOpcode::try_from(cmd.opc) {
                Ok(op) => self.dispatch_nvm(op, cmd),
                Err(_) => Err(NvmeStatus::INVALID_OPCODE),
            }
        };

        tracing::debug!(
            sqid,
            cid = cmd.cid,
            opc = format_args!("{:#04x}", cmd.opc),
            status = ?result.err(),
            "command executed"
        );
        match result {
            Ok(dw0) => CompletionEntry::new(NvmeStatus::SUCCESS).with_result(dw0),
            Err(status) => CompletionEntry::new(status),
        }
    }

    fn post_completion(
        &mut self,
        sqid: u16,
        sqhd: u16,
        cqid: u16,
        mut cqe: CompletionEntry,
        cid: u16,
        admitted: bool,
    ) -> Result<(), ControllerFault> {
        let cq = self
            .queues
            .completion_mut(cqid)
            .ok_or(ControllerFault::MissingCompletionQueue { sqid, cqid })?;

        cqe.sqid = sqid;
        cqe.sqhd = sqhd;
        cqe.cid = cid;
        let slot = cq.advance_completion_tail();
        cqe.set_phase(cq.phase);
        let addr = cq.slot_address(slot);
        let tail = cq.tail;

        // The dword holding the phase bit goes last.
        let bytes = cqe.to_bytes();
        let write = |addr: u64, buf: &[u8]| {
            self.memory
                .write_physical(addr, buf)
                .map_err(|source| ControllerFault::CompletionQueueWrite { cqid, source })
        };
        write(addr, &bytes[..COMPLETION_SIZE - 4])?;
        write(addr + (COMPLETION_SIZE - 4) as u64, &bytes[COMPLETION_SIZE - 4..])?;

        self.registers.publish_completion_tail(cqid, tail);
        if admitted {
            self.command_ids.retire(sqid, cid);
        }
        Ok(())
    }

    /// Copies controller generated data into the command's PRP buffer.
    pub(super) fn transfer_to_host(&self, cmd: &NvmeCommand, data: &[u8]) -> HandlerResult {
        prp::dma_write(&*self.memory, cmd.prp1, cmd.prp2, data)
            .map_err(|_| NvmeStatus::DATA_TRANSFER_ERROR)?;
        Ok(0)
    }

    pub(super) fn transfer_from_host(&self, cmd: &NvmeCommand, data: &mut [u8]) -> HandlerResult {
        prp::dma_read(&*self.memory, cmd.prp1, cmd.prp2, data)
            .map_err(|_| NvmeStatus::DATA_TRANSFER_ERROR)?;
        Ok(0)
    }

    /// Identify Controller data as currently reported.
    pub(super) fn identify_controller_data(&self) -> Vec<u8> {
        self.identify
            .to_bytes(&self.firmware.running_revision(), self.namespaces.max_nsid())
    }

    /// Largest allowed data transfer, in bytes. An unlimited MDTS is still bounded here so a
    /// single command can never make the controller allocate gigabytes.
    pub(super) fn max_transfer_bytes(&self) -> usize {
        self.config
            .max_transfer_bytes()
            .unwrap_or(UNLIMITED_TRANSFER_CAP)
    }
}
