//! Submission/completion entry formats, status codes and opcode sets.

/// Size of a submission queue entry in bytes.
pub const COMMAND_SIZE: usize = 64;
/// Size of a completion queue entry in bytes.
pub const COMPLETION_SIZE: usize = 16;

/// Status Code Type + Status Code pair carried in a completion entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NvmeStatus {
    pub sct: u8,
    pub sc: u8,
    pub dnr: bool,
}

impl NvmeStatus {
    pub const SUCCESS: NvmeStatus = NvmeStatus::generic(0x00, false);
    pub const INVALID_OPCODE: NvmeStatus = NvmeStatus::generic(0x01, true);
    pub const INVALID_FIELD: NvmeStatus = NvmeStatus::generic(0x02, true);
    pub const COMMAND_ID_CONFLICT: NvmeStatus = NvmeStatus::generic(0x03, true);
    pub const DATA_TRANSFER_ERROR: NvmeStatus = NvmeStatus::generic(0x04, false);
    pub const INTERNAL_ERROR: NvmeStatus = NvmeStatus::generic(0x06, false);
    pub const INVALID_NS: NvmeStatus = NvmeStatus::generic(0x0b, true);
    pub const LBA_OUT_OF_RANGE: NvmeStatus = NvmeStatus::generic(0x80, true);

    pub const COMPLETION_QUEUE_INVALID: NvmeStatus = NvmeStatus::command_specific(0x00);
    pub const INVALID_QID: NvmeStatus = NvmeStatus::command_specific(0x01);
    pub const INVALID_QUEUE_SIZE: NvmeStatus = NvmeStatus::command_specific(0x02);
    pub const INVALID_FIRMWARE_SLOT: NvmeStatus = NvmeStatus::command_specific(0x06);
    pub const INVALID_FIRMWARE_IMAGE: NvmeStatus = NvmeStatus::command_specific(0x07);
    pub const INVALID_LOG_PAGE: NvmeStatus = NvmeStatus::command_specific(0x09);
    pub const INVALID_FORMAT: NvmeStatus = NvmeStatus::command_specific(0x0a);
    pub const INVALID_QUEUE_DELETION: NvmeStatus = NvmeStatus::command_specific(0x0c);
    pub const NAMESPACE_ALREADY_ATTACHED: NvmeStatus = NvmeStatus::command_specific(0x18);
    pub const NAMESPACE_NOT_ATTACHED: NvmeStatus = NvmeStatus::command_specific(0x1a);

    const fn generic(sc: u8, dnr: bool) -> Self {
        NvmeStatus { sct: 0, sc, dnr }
    }

    const fn command_specific(sc: u8) -> Self {
        NvmeStatus { sct: 1, sc, dnr: true }
    }

    pub fn is_success(self) -> bool {
        self.sct == 0 && self.sc == 0
    }

    /// Status half-word of DW3 with the phase bit left clear.
    pub fn encode_without_phase(self) -> u16 {
        let mut val: u16 = 0;
        val |= (self.sc as u16) << 1;
        val |= ((self.sct & 0x7) as u16) << 9;
        if self.dnr {
            val |= 1 << 15;
        }
        val
    }

    pub fn decode(status: u16) -> Self {
        NvmeStatus {
            sc: ((status >> 1) & 0xff) as u8,
            sct: ((status >> 9) & 0x7) as u8,
            dnr: status & (1 << 15) != 0,
        }
    }
}

/// Admin command set handled on submission queue 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminOpcode {
    DeleteIoSubmissionQueue,
    CreateIoSubmissionQueue,
    GetLogPage,
    DeleteIoCompletionQueue,
    CreateIoCompletionQueue,
    Identify,
    FirmwareCommit,
    FirmwareImageDownload,
    NamespaceAttachment,
    KeepAlive,
    FormatNvm,
}

impl AdminOpcode {
    pub const ALL: [AdminOpcode; 11] = [
        AdminOpcode::DeleteIoSubmissionQueue,
        AdminOpcode::CreateIoSubmissionQueue,
        AdminOpcode::GetLogPage,
        AdminOpcode::DeleteIoCompletionQueue,
        AdminOpcode::CreateIoCompletionQueue,
        AdminOpcode::Identify,
        AdminOpcode::FirmwareCommit,
        AdminOpcode::FirmwareImageDownload,
        AdminOpcode::NamespaceAttachment,
        AdminOpcode::KeepAlive,
        AdminOpcode::FormatNvm,
    ];

    pub const fn opcode(self) -> u8 {
        match self {
            AdminOpcode::DeleteIoSubmissionQueue => 0x00,
            AdminOpcode::CreateIoSubmissionQueue => 0x01,
            AdminOpcode::GetLogPage => 0x02,
            AdminOpcode::DeleteIoCompletionQueue => 0x04,
            AdminOpcode::CreateIoCompletionQueue => 0x05,
            AdminOpcode::Identify => 0x06,
            AdminOpcode::FirmwareCommit => 0x10,
            AdminOpcode::FirmwareImageDownload => 0x11,
            AdminOpcode::NamespaceAttachment => 0x15,
            AdminOpcode::KeepAlive => 0x18,
            AdminOpcode::FormatNvm => 0x80,
        }
    }
}

impl TryFrom<u8> for AdminOpcode {
    type Error = u8;

    fn try_from(opc: u8) -> Result<Self, Self::Error> {
        AdminOpcode::ALL
            .into_iter()
            .find(|op| op.opcode() == opc)
            .ok_or(opc)
    }
}

/// NVM command set handled on I/O submission queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NvmOpcode {
    Flush,
    Write,
    Read,
}

impl NvmOpcode {
    pub const ALL: [NvmOpcode; 3] = [NvmOpcode::Flush, NvmOpcode::Write, NvmOpcode::Read];

    pub const fn opcode(self) -> u8 {
        match self {
            NvmOpcode::Flush => 0x00,
            NvmOpcode::Write => 0x01,
            NvmOpcode::Read => 0x02,
        }
    }
}

impl TryFrom<u8> for NvmOpcode {
    type Error = u8;

    fn try_from(opc: u8) -> Result<Self, Self::Error> {
        NvmOpcode::ALL
            .into_iter()
            .find(|op| op.opcode() == opc)
            .ok_or(opc)
    }
}

/// A decoded 64-byte submission queue entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NvmeCommand {
    pub opc: u8,
    pub fuse: u8,
    pub psdt: u8,
    pub cid: u16,
    pub nsid: u32,
    pub mptr: u64,
    pub prp1: u64,
    pub prp2: u64,
    pub cdw10: u32,
    pub cdw11: u32,
    pub cdw12: u32,
    pub cdw13: u32,
    pub cdw14: u32,
    pub cdw15: u32,
}

impl NvmeCommand {
    pub fn new(opc: u8, cid: u16) -> Self {
        NvmeCommand {
            opc,
            cid,
            ..Default::default()
        }
    }

    pub fn with_nsid(mut self, nsid: u32) -> Self {
        self.nsid = nsid;
        self
    }

    pub fn with_prp(mut self, prp1: u64, prp2: u64) -> Self {
        self.prp1 = prp1;
        self.prp2 = prp2;
        self
    }

    pub fn with_cdw10(mut self, val: u32) -> Self {
        self.cdw10 = val;
        self
    }

    pub fn with_cdw11(mut self, val: u32) -> Self {
        self.cdw11 = val;
        self
    }

    pub fn with_cdw12(mut self, val: u32) -> Self {
        self.cdw12 = val;
        self
    }

    pub fn parse(bytes: &[u8; COMMAND_SIZE]) -> NvmeCommand {
        let dw0 = le_u32(bytes, 0);
        NvmeCommand {
            opc: (dw0 & 0xff) as u8,
            fuse: ((dw0 >> 8) & 0x3) as u8,
            psdt: ((dw0 >> 14) & 0x3) as u8,
            cid: (dw0 >> 16) as u16,
            nsid: le_u32(bytes, 4),
            mptr: le_u64(bytes, 16),
            prp1: le_u64(bytes, 24),
            prp2: le_u64(bytes, 32),
            cdw10: le_u32(bytes, 40),
            cdw11: le_u32(bytes, 44),
            cdw12: le_u32(bytes, 48),
            cdw13: le_u32(bytes, 52),
            cdw14: le_u32(bytes, 56),
            cdw15: le_u32(bytes, 60),
        }
    }

    pub fn to_bytes(&self) -> [u8; COMMAND_SIZE] {
        let mut out = [0u8; COMMAND_SIZE];
        let dw0 = self.opc as u32
            | ((self.fuse as u32 & 0x3) << 8)
            | ((self.psdt as u32 & 0x3) << 14)
            | ((self.cid as u32) << 16);
        out[0..4].copy_from_slice(&dw0.to_le_bytes());
        out[4..8].copy_from_slice(&self.nsid.to_le_bytes());
        out[16..24].copy_from_slice(&self.mptr.to_le_bytes());
        out[24..32].copy_from_slice(&self.prp1.to_le_bytes());
        out[32..40].copy_from_slice(&self.prp2.to_le_bytes());
        for (i, dw) in [
            self.cdw10, self.cdw11, self.cdw12, self.cdw13, self.cdw14, self.cdw15,
        ]
        .into_iter()
        .enumerate()
        {
            let off = 40 + i * 4;
            out[off..off + 4].copy_from_slice(&dw.to_le_bytes());
        }
        out
    }

    /// Starting LBA for NVM read/write commands (CDW11:CDW10).
    pub fn slba(&self) -> u64 {
        (self.cdw11 as u64) << 32 | self.cdw10 as u64
    }

    /// Number of logical blocks for NVM read/write commands, converted from 0's based.
    pub fn block_count(&self) -> u32 {
        (self.cdw12 & 0xffff) + 1
    }
}

/// A 16-byte completion queue entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompletionEntry {
    pub dw0: u32,
    pub dw1: u32,
    pub sqhd: u16,
    pub sqid: u16,
    pub cid: u16,
    /// Status half-word including the phase tag in bit 0.
    pub status: u16,
}

impl CompletionEntry {
    pub fn new(status: NvmeStatus) -> Self {
        CompletionEntry {
            status: status.encode_without_phase(),
            ..Default::default()
        }
    }

    pub fn with_result(mut self, dw0: u32) -> Self {
        self.dw0 = dw0;
        self
    }

    pub fn set_status(&mut self, status: NvmeStatus) {
        self.status = status.encode_without_phase() | (self.status & 1);
    }

    pub fn nvme_status(&self) -> NvmeStatus {
        NvmeStatus::decode(self.status)
    }

    pub fn succeeded(&self) -> bool {
        self.nvme_status().is_success()
    }

    pub fn phase(&self) -> bool {
        self.status & 1 != 0
    }

    pub fn set_phase(&mut self, phase: bool) {
        self.status = (self.status & !1) | phase as u16;
    }

    pub fn to_bytes(self) -> [u8; COMPLETION_SIZE] {
        let mut out = [0u8; COMPLETION_SIZE];
        out[0..4].copy_from_slice(&self.dw0.to_le_bytes());
        out[4..8].copy_from_slice(&self.dw1.to_le_bytes());
        let dw2 = (self.sqid as u32) << 16 | self.sqhd as u32;
        out[8..12].copy_from_slice(&dw2.to_le_bytes());
        let dw3 = (self.status as u32) << 16 | self.cid as u32;
        out[12..16].copy_from_slice(&dw3.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8; COMPLETION_SIZE]) -> Self {
        let dw2 = le_u32(bytes, 8);
        let dw3 = le_u32(bytes, 12);
        CompletionEntry {
            dw0: le_u32(bytes, 0),
            dw1: le_u32(bytes, 4),
            sqhd: (dw2 & 0xffff) as u16,
            sqid: (dw2 >> 16) as u16,
            cid: (dw3 & 0xffff) as u16,
            status: (dw3 >> 16) as u16,
        }
    }
}

fn le_u32(bytes: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([bytes[off], bytes[off + 1], bytes[off + 2], bytes[off + 3]])
}

fn le_u64(bytes: &[u8], off: usize) -> u64 {
    (le_u32(bytes, off + 4) as u64) << 32 | le_u32(bytes, off) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_dword0_layout() {
        let mut bytes = [0u8; COMMAND_SIZE];
        bytes[0] = 0x06;
        bytes[1] = 0x40; // PSDT=1
        bytes[2..4].copy_from_slice(&0x1234u16.to_le_bytes());
        bytes[4..8].copy_from_slice(&7u32.to_le_bytes());
        bytes[40..44].copy_from_slice(&0x01u32.to_le_bytes());

        let cmd = NvmeCommand::parse(&bytes);
        assert_eq!(cmd.opc, 0x06);
        assert_eq!(cmd.psdt, 1);
        assert_eq!(cmd.cid, 0x1234);
        assert_eq!(cmd.nsid, 7);
        assert_eq!(cmd.cdw10, 1);
        assert_eq!(cmd.to_bytes(), bytes);
    }

    #[test]
    fn status_field_bit_positions() {
        let mut cqe = CompletionEntry::new(NvmeStatus::INVALID_QID);
        cqe.set_phase(true);
        // P=1, SC=0x01 at bits 8:1, SCT=1 at bits 11:9, DNR at bit 15.
        assert_eq!(cqe.status, 0x8000 | (1 << 9) | (0x01 << 1) | 1);
        assert_eq!(cqe.nvme_status(), NvmeStatus::INVALID_QID);
        assert!(!cqe.succeeded());

        cqe.set_status(NvmeStatus::SUCCESS);
        assert!(cqe.phase());
        assert!(cqe.succeeded());
    }

    #[test]
    fn opcode_tables_are_disjoint_per_set() {
        assert_eq!(AdminOpcode::try_from(0x18), Ok(AdminOpcode::KeepAlive));
        assert_eq!(AdminOpcode::try_from(0x80), Ok(AdminOpcode::FormatNvm));
        assert_eq!(AdminOpcode::try_from(0x03), Err(0x03));
        assert_eq!(NvmOpcode::try_from(0x02), Ok(NvmOpcode::Read));
        assert_eq!(NvmOpcode::try_from(0x06), Err(0x06));
        for op in AdminOpcode::ALL {
            assert_eq!(AdminOpcode::try_from(op.opcode()), Ok(op));
        }
    }

    #[test]
    fn completion_dwords_pack_sqid_and_cid() {
        let cqe = CompletionEntry {
            dw0: 1,
            dw1: 2,
            sqhd: 3,
            sqid: 4,
            cid: 5,
            status: 6,
        };
        let bytes = cqe.to_bytes();
        assert_eq!(u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]), 4 << 16 | 3);
        assert_eq!(CompletionEntry::from_bytes(&bytes), cqe);
    }
}
