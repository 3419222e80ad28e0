//! Admin command set handlers.

use crate::command::{AdminOpcode, NvmeCommand, NvmeStatus};
use crate::firmware::{CommitAction, FIRMWARE_SLOT_LOG_SIZE};
use crate::namespace::{BROADCAST_NSID, LBA_FORMATS};
use crate::queue::{Queue, ADMIN_QUEUE_ID};
use crate::PAGE_SIZE;

use super::engine::{ControllerState, HandlerResult};

const CNS_NAMESPACE: u8 = 0x00;
const CNS_CONTROLLER: u8 = 0x01;
const CNS_ACTIVE_NAMESPACE_LIST: u8 = 0x02;
const CNS_ALLOCATED_NAMESPACE_LIST: u8 = 0x10;
const CNS_ALLOCATED_NAMESPACE: u8 = 0x11;

const LID_FIRMWARE_SLOT_INFO: u8 = 0x03;

const NS_ATTACH: u32 = 0;
const NS_DETACH: u32 = 1;

impl ControllerState {
    pub(super) fn dispatch_admin(&mut self, op: AdminOpcode, cmd: &NvmeCommand) -> HandlerResult {
        match op {
            AdminOpcode::DeleteIoSubmissionQueue => self.delete_io_submission_queue(cmd),
            AdminOpcode::CreateIoSubmissionQueue => self.create_io_submission_queue(cmd),
            AdminOpcode::GetLogPage => self.get_log_page(cmd),
            AdminOpcode::DeleteIoCompletionQueue => self.delete_io_completion_queue(cmd),
            AdminOpcode::CreateIoCompletionQueue => self.create_io_completion_queue(cmd),
            AdminOpcode::Identify => self.identify(cmd),
            AdminOpcode::FirmwareCommit => self.firmware_commit(cmd),
            AdminOpcode::FirmwareImageDownload => self.firmware_image_download(cmd),
            AdminOpcode::NamespaceAttachment => self.namespace_attachment(cmd),
            AdminOpcode::KeepAlive => Ok(0),
            AdminOpcode::FormatNvm => self.format_nvm(cmd),
        }
    }

    fn identify(&mut self, cmd: &NvmeCommand) -> HandlerResult {
        let cns = (cmd.cdw10 & 0xff) as u8;
        let data = match cns {
            CNS_NAMESPACE => self
                .namespaces
                .identify(cmd.nsid)
                .ok_or(NvmeStatus::INVALID_NS)?,
            CNS_CONTROLLER => self.identify_controller_data(),
            CNS_ACTIVE_NAMESPACE_LIST | CNS_ALLOCATED_NAMESPACE_LIST => {
                if cmd.nsid >= BROADCAST_NSID - 1 {
                    return Err(NvmeStatus::INVALID_NS);
                }
                if cns == CNS_ACTIVE_NAMESPACE_LIST {
                    self.namespaces.active_list(cmd.nsid)
                } else {
                    self.namespaces.allocated_list(cmd.nsid)
                }
            }
            CNS_ALLOCATED_NAMESPACE => self
                .namespaces
                .allocated(cmd.nsid)
                .map(|ns| ns.identify())
                .ok_or(NvmeStatus::INVALID_NS)?,
            _ => return Err(NvmeStatus::INVALID_FIELD),
        };
        self.transfer_to_host(cmd, &data)
    }

    /// Checks the fields shared by both create-queue commands and returns `(qid, depth)`.
    fn validate_queue_creation(
        &self,
        cmd: &NvmeCommand,
        exists: bool,
    ) -> Result<(u16, u16), NvmeStatus> {
        let qid = (cmd.cdw10 & 0xffff) as u16;
        let depth = (cmd.cdw10 >> 16) + 1;
        let physically_contiguous = cmd.cdw11 & 1 != 0;

        if qid == ADMIN_QUEUE_ID || qid > self.config.max_queue_id || exists {
            return Err(NvmeStatus::INVALID_QID);
        }
        if depth < 2 || depth > self.registers.max_queue_entries() {
            return Err(NvmeStatus::INVALID_QUEUE_SIZE);
        }
        if !physically_contiguous || cmd.prp1 == 0 || cmd.prp1 & (PAGE_SIZE as u64 - 1) != 0 {
            return Err(NvmeStatus::INVALID_FIELD);
        }
        Ok((qid, depth as u16))
    }

    fn create_io_completion_queue(&mut self, cmd: &NvmeCommand) -> HandlerResult {
        let qid = (cmd.cdw10 & 0xffff) as u16;
        let exists = self.queues.completion(qid).is_some();
        let (qid, depth) = self.validate_queue_creation(cmd, exists)?;

        self.queues.insert(Queue::completion(qid, depth, cmd.prp1));
        self.registers.clear_completion_doorbell(qid);
        tracing::debug!(
            qid,
            depth,
            base = format_args!("{:#x}", cmd.prp1),
            "created I/O CQ"
        );
        Ok(0)
    }

    fn create_io_submission_queue(&mut self, cmd: &NvmeCommand) -> HandlerResult {
        let qid = (cmd.cdw10 & 0xffff) as u16;
        let exists = self.queues.submission(qid).is_some();
        let (qid, depth) = self.validate_queue_creation(cmd, exists)?;

        let cqid = (cmd.cdw11 >> 16) as u16;
        if cqid == ADMIN_QUEUE_ID || self.queues.completion(cqid).is_none() {
            return Err(NvmeStatus::COMPLETION_QUEUE_INVALID);
        }

        self.queues.insert(Queue::submission(qid, depth, cmd.prp1, cqid));
        self.registers.clear_submission_doorbell(qid);
        self.command_ids.clear_queue(qid);
        tracing::debug!(
            qid,
            depth,
            cqid,
            base = format_args!("{:#x}", cmd.prp1),
            "created I/O SQ"
        );
        Ok(0)
    }

    fn delete_io_submission_queue(&mut self, cmd: &NvmeCommand) -> HandlerResult {
        let qid = (cmd.cdw10 & 0xffff) as u16;
        if qid == ADMIN_QUEUE_ID || self.queues.remove_submission(qid).is_none() {
            return Err(NvmeStatus::INVALID_QID);
        }
        self.command_ids.clear_queue(qid);
        self.registers.clear_submission_doorbell(qid);
        tracing::debug!(qid, "deleted I/O SQ");
        Ok(0)
    }

    fn delete_io_completion_queue(&mut self, cmd: &NvmeCommand) -> HandlerResult {
        let qid = (cmd.cdw10 & 0xffff) as u16;
        if qid == ADMIN_QUEUE_ID || self.queues.completion(qid).is_none() {
            return Err(NvmeStatus::INVALID_QID);
        }
        if self.queues.completion_queue_in_use(qid) {
            return Err(NvmeStatus::INVALID_QUEUE_DELETION);
        }
        self.queues.remove_completion(qid);
        self.registers.clear_completion_doorbell(qid);
        tracing::debug!(qid, "deleted I/O CQ");
        Ok(0)
    }

    fn get_log_page(&mut self, cmd: &NvmeCommand) -> HandlerResult {
        let lid = (cmd.cdw10 & 0xff) as u8;
        let numd = ((cmd.cdw11 & 0xffff) as u64) << 16 | (cmd.cdw10 >> 16) as u64;
        let len = (numd + 1) * 4;
        let offset = (cmd.cdw13 as u64) << 32 | cmd.cdw12 as u64;

        let page = match lid {
            LID_FIRMWARE_SLOT_INFO => self.firmware.log_page(),
            _ => return Err(NvmeStatus::INVALID_LOG_PAGE),
        };
        if offset % 4 != 0 || offset >= FIRMWARE_SLOT_LOG_SIZE as u64 {
            return Err(NvmeStatus::INVALID_FIELD);
        }
        if len > self.max_transfer_bytes() as u64 {
            return Err(NvmeStatus::INVALID_FIELD);
        }

        // Bytes past the end of the log read as zero.
        let mut data = vec![0u8; len as usize];
        let available = &page[offset as usize..];
        let n = available.len().min(data.len());
        data[..n].copy_from_slice(&available[..n]);
        self.transfer_to_host(cmd, &data)
    }

    fn firmware_image_download(&mut self, cmd: &NvmeCommand) -> HandlerResult {
        let len = (cmd.cdw10 as u64 + 1) * 4;
        if len > self.max_transfer_bytes() as u64 {
            return Err(NvmeStatus::INVALID_FIELD);
        }
        self.firmware_store.check_fragment(cmd.cdw11, len as usize)?;
        let mut data = vec![0u8; len as usize];
        self.transfer_from_host(cmd, &mut data)?;
        self.firmware_store.download(cmd.cdw11, data)?;
        tracing::debug!(offset = cmd.cdw11, len, "buffered firmware fragment");
        Ok(0)
    }

    fn firmware_commit(&mut self, cmd: &NvmeCommand) -> HandlerResult {
        let slot = (cmd.cdw10 & 0x7) as u8;
        let action = CommitAction::try_from(((cmd.cdw10 >> 3) & 0x7) as u8)?;
        self.firmware
            .commit(slot, action, &mut self.firmware_store)?;
        tracing::info!(
            slot,
            ?action,
            active = self.firmware.active_slot(),
            "firmware commit"
        );
        Ok(0)
    }

    fn namespace_attachment(&mut self, cmd: &NvmeCommand) -> HandlerResult {
        match cmd.cdw10 & 0xf {
            NS_ATTACH => self.namespaces.attach(cmd.nsid)?,
            NS_DETACH => self.namespaces.detach(cmd.nsid)?,
            _ => return Err(NvmeStatus::INVALID_FIELD),
        }
        tracing::info!(
            nsid = cmd.nsid,
            attached = self.namespaces.is_active(cmd.nsid),
            "namespace attachment"
        );
        Ok(0)
    }

    fn format_nvm(&mut self, cmd: &NvmeCommand) -> HandlerResult {
        let lbaf = (cmd.cdw10 & 0xf) as u8;
        if cmd.nsid != BROADCAST_NSID && !self.namespaces.is_active(cmd.nsid) {
            return Err(NvmeStatus::INVALID_NS);
        }
        if lbaf as usize >= LBA_FORMATS.len() {
            return Err(NvmeStatus::INVALID_FORMAT);
        }

        // Every target must accept the format before any of them is wiped.
        let broadcast = cmd.nsid == BROADCAST_NSID;
        for ns in self.namespaces.active_iter() {
            if broadcast || ns.nsid() == cmd.nsid {
                ns.check_format(lbaf)?;
            }
        }
        for ns in self.namespaces.active_iter_mut() {
            if broadcast || ns.nsid() == cmd.nsid {
                ns.format(lbaf)?;
            }
        }
        tracing::info!(nsid = cmd.nsid, lbaf, "formatted namespace");
        Ok(0)
    }
}
