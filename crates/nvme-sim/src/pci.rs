//! PCI function wrapper: a type-0 configuration space and BAR0 MMIO decoding.
//!
//! A full PCI bus is out of scope, but enough of the config space is provided for a host driver
//! to enumerate the function, size BAR0 and turn on memory decoding.

use std::sync::Arc;

use crate::registers::ControllerRegisters;

pub const PCI_COMMAND: u16 = 0x04;
pub const PCI_BAR0: u16 = 0x10;

/// Command register: Memory Space Enable.
pub const PCI_COMMAND_MEMORY: u16 = 1 << 1;
/// Command register: Bus Master Enable.
pub const PCI_COMMAND_BUS_MASTER: u16 = 1 << 2;

/// Class code: Mass Storage (0x01), Non-Volatile Memory (0x08), NVM Express (0x02).
const CLASS_CODE: [u8; 3] = [0x02, 0x08, 0x01];

/// BAR0 type bits: 64-bit, non-prefetchable memory.
const BAR0_MEM64: u32 = 0b100;

#[derive(Debug)]
pub struct NvmePciFunction {
    config_space: [u8; 256],
    registers: Arc<ControllerRegisters>,
    bar0_len: u64,
}

impl NvmePciFunction {
    pub fn new(vendor_id: u16, device_id: u16, registers: Arc<ControllerRegisters>) -> Self {
        let mut config_space = [0u8; 256];
        config_space[0x00..0x02].copy_from_slice(&vendor_id.to_le_bytes());
        config_space[0x02..0x04].copy_from_slice(&device_id.to_le_bytes());
        config_space[0x09..0x0c].copy_from_slice(&CLASS_CODE);
        config_space[0x10..0x14].copy_from_slice(&BAR0_MEM64.to_le_bytes());
        config_space[0x3d] = 1; // INTA#

        let bar0_len = registers.bar0_len();
        NvmePciFunction {
            config_space,
            registers,
            bar0_len,
        }
    }

    pub fn registers(&self) -> &Arc<ControllerRegisters> {
        &self.registers
    }

    pub fn bar0_len(&self) -> u64 {
        self.bar0_len
    }

    pub fn command(&self) -> u16 {
        self.config_read_u16(PCI_COMMAND)
    }

    pub fn set_command(&mut self, command: u16) {
        self.config_write_u32(PCI_COMMAND, command as u32);
    }

    pub fn memory_space_enabled(&self) -> bool {
        self.command() & PCI_COMMAND_MEMORY != 0
    }

    /// Guest-programmed BAR0 base address.
    pub fn bar0_base(&self) -> u64 {
        let lo = self.config_read_u32(PCI_BAR0) as u64 & !0xf;
        let hi = self.config_read_u32(PCI_BAR0 + 4) as u64;
        hi << 32 | lo
    }

    pub fn config_read_u16(&self, offset: u16) -> u16 {
        let off = offset as usize;
        match self.config_space.get(off..off + 2) {
            Some(bytes) => u16::from_le_bytes([bytes[0], bytes[1]]),
            None => 0xffff,
        }
    }

    pub fn config_read_u32(&self, offset: u16) -> u32 {
        let off = offset as usize;
        match self.config_space.get(off..off + 4) {
            Some(bytes) => u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            None => 0xffff_ffff,
        }
    }

    /// Writes a config dword. Only the command register and BAR0 are writable; BAR0 reports its
    /// size mask after an all-ones write.
    pub fn config_write_u32(&mut self, offset: u16, value: u32) {
        let off = offset as usize;
        match offset {
            PCI_COMMAND => {
                let cmd = value as u16 & (PCI_COMMAND_MEMORY | PCI_COMMAND_BUS_MASTER | 1 << 10);
                self.config_space[off..off + 2].copy_from_slice(&cmd.to_le_bytes());
            }
            PCI_BAR0 => {
                let mask = !(self.bar0_len - 1) as u32;
                let val = (value & mask & !0xf) | BAR0_MEM64;
                self.config_space[off..off + 4].copy_from_slice(&val.to_le_bytes());
            }
            o if o == PCI_BAR0 + 4 => {
                let mask = (!(self.bar0_len - 1) >> 32) as u32;
                self.config_space[off..off + 4].copy_from_slice(&(value & mask).to_le_bytes());
            }
            _ => {}
        }
    }

    /// BAR0 read at `offset` within the BAR. Reads float high while memory decoding is off;
    /// zero-sized accesses return 0.
    pub fn mmio_read(&self, offset: u64, size: usize) -> u64 {
        if size == 0 {
            return 0;
        }
        if !self.memory_space_enabled() || offset >= self.bar0_len {
            return all_ones(size);
        }
        self.registers.mmio_read(offset, size)
    }

    /// BAR0 write at `offset`. Dropped while memory decoding is off.
    pub fn mmio_write(&self, offset: u64, size: usize, value: u64) {
        if size == 0 || !self.memory_space_enabled() || offset >= self.bar0_len {
            return;
        }
        self.registers.mmio_write(offset, size, value);
    }
}

fn all_ones(size: usize) -> u64 {
    if size >= 8 {
        u64::MAX
    } else {
        (1u64 << (size * 8)) - 1
    }
}
