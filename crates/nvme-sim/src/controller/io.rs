//! NVM command set handlers.

use crate::command::{NvmOpcode, NvmeCommand, NvmeStatus};
use crate::namespace::{Namespace, BROADCAST_NSID};

use super::engine::{ControllerState, HandlerResult};

impl ControllerState {
    pub(super) fn dispatch_nvm(&mut self, op: NvmOpcode, cmd: &NvmeCommand) -> HandlerResult {
        match op {
            NvmOpcode::Flush => self.flush(cmd),
            NvmOpcode::Write => self.write(cmd),
            NvmOpcode::Read => self.read(cmd),
        }
    }

    fn flush(&mut self, cmd: &NvmeCommand) -> HandlerResult {
        let nsid = cmd.nsid;
        let flush_one = |ns: &mut Namespace| {
            ns.disk_mut().flush().map_err(|err| {
                tracing::warn!(nsid = ns.nsid(), %err, "flush failed");
                NvmeStatus::INTERNAL_ERROR
            })
        };
        if nsid == BROADCAST_NSID {
            for ns in self.namespaces.active_iter_mut() {
                flush_one(ns)?;
            }
        } else if let Some(ns) = self.namespaces.active_mut(nsid) {
            flush_one(ns)?;
        }
        Ok(0)
    }

    /// Resolves the target namespace and byte length of a read/write.
    fn io_transfer_len(&self, cmd: &NvmeCommand) -> Result<usize, NvmeStatus> {
        let ns = self
            .namespaces
            .active(cmd.nsid)
            .ok_or(NvmeStatus::INVALID_NS)?;
        let blocks = cmd.block_count() as u64;
        ns.check_range(cmd.slba(), blocks)?;

        let len = blocks * ns.block_size() as u64;
        if len > self.max_transfer_bytes() as u64 {
            return Err(NvmeStatus::INVALID_FIELD);
        }
        Ok(len as usize)
    }

    fn read(&mut self, cmd: &NvmeCommand) -> HandlerResult {
        let len = self.io_transfer_len(cmd)?;
        let mut data = vec![0u8; len];
        let Some(ns) = self.namespaces.active_mut(cmd.nsid) else {
            return Err(NvmeStatus::INVALID_NS);
        };
        ns.disk_mut()
            .read_blocks(cmd.slba(), &mut data)
            .map_err(|err| {
                tracing::warn!(nsid = cmd.nsid, %err, "disk read failed");
                NvmeStatus::INTERNAL_ERROR
            })?;
        self.transfer_to_host(cmd, &data)
    }

    fn write(&mut self, cmd: &NvmeCommand) -> HandlerResult {
        let len = self.io_transfer_len(cmd)?;
        let mut data = vec![0u8; len];
        self.transfer_from_host(cmd, &mut data)?;
        let Some(ns) = self.namespaces.active_mut(cmd.nsid) else {
            return Err(NvmeStatus::INVALID_NS);
        };
        ns.disk_mut()
            .write_blocks(cmd.slba(), &data)
            .map_err(|err| {
                tracing::warn!(nsid = cmd.nsid, %err, "disk write failed");
                NvmeStatus::INTERNAL_ERROR
            })?;
        Ok(0)
    }
}
