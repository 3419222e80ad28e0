//! A software NVMe (NVM Express) controller.
//!
//! Host-side driver and application logic can be exercised against it without hardware: the
//! caller maps the BAR0 register file, writes submission queue entries into host memory, rings a
//! doorbell and observes completion queue entries appear.
//!
//! Supported:
//! - BAR0 register set (CAP/VS/INTMS/INTMC/CC/CSTS/AQA/ASQ/ACQ + doorbells) and a PCI function
//!   wrapper with Memory Space Enable gating
//! - Admin queue pair plus I/O queues created and deleted by admin commands
//! - Admin commands: IDENTIFY (CNS 0x00/0x01/0x02/0x10/0x11), CREATE/DELETE IO SQ/CQ,
//!   GET LOG PAGE (firmware slot information), FIRMWARE IMAGE DOWNLOAD/COMMIT, NAMESPACE
//!   ATTACHMENT, KEEP ALIVE, FORMAT NVM
//! - NVM commands: READ, WRITE, FLUSH
//! - PRP (PRP1/PRP2 + PRP lists). SGL is not supported.
//! - Command id conflict detection per submission queue
//! - A [`CommandResponder`] hook that can override the completion of any command
//!
//! Commands are processed by a background thread that polls the doorbells; see [`Controller`].
//! Interrupts are not modelled: the host learns about new completions from the completion
//! doorbell register, which holds the controller's tail.

pub mod cid;
pub mod command;
pub mod config;
mod controller;
pub mod error;
pub mod firmware;
pub mod identify;
pub mod memory;
pub mod namespace;
pub mod pci;
pub mod prp;
pub mod queue;
pub mod registers;
pub mod responder;

/// Host memory page size (CC.MPS = 0).
pub const PAGE_SIZE: usize = 4096;

pub use command::{AdminOpcode, CompletionEntry, NvmOpcode, NvmeCommand, NvmeStatus};
pub use config::{ControllerConfig, NamespaceConfig};
pub use controller::Controller;
pub use error::{ConfigError, ControllerError, ControllerFault};
pub use memory::{HostMemory, MemoryBus, MemoryError};
pub use namespace::{DiskBackend, DiskError, RamDisk};
pub use pci::NvmePciFunction;
pub use registers::{ControllerConfiguration, ControllerRegisters, ControllerStatus};
pub use responder::{CommandResponder, FileResponder, NoResponder, ResponderError};
