//! The controller front end: owns the register file, the doorbell watch thread and the state it
//! mutates.
//!
//! The watch thread runs [`ControllerState::check_for_changes`] once per iteration with the state
//! mutex held. Everything else that touches the state (inspection, [`Controller::reset`]) takes
//! the same mutex, so it only ever observes the controller between iterations.

mod admin;
mod engine;
mod io;

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::config::ControllerConfig;
use crate::error::{ControllerError, ControllerFault};
use crate::firmware::FirmwareSlots;
use crate::memory::MemoryBus;
use crate::pci::NvmePciFunction;
use crate::queue::Queue;
use crate::registers::{ControllerRegisters, ControllerStatus};
use crate::responder::{CommandResponder, FileResponder, NoResponder};

use engine::ControllerState;

const WATCH_THREAD_NAME: &str = "nvme-doorbell-watch";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Iteration bookkeeping shared by the watch thread and callers of
/// [`Controller::wait_for_change_loop`].
#[derive(Debug, Default)]
struct LoopProgress {
    started: u64,
    completed: u64,
    running: bool,
    /// Set by waiters so the loop skips its idle sleep.
    kick: bool,
    shutdown: bool,
}

struct Shared {
    state: Mutex<ControllerState>,
    progress: Mutex<LoopProgress>,
    iteration_done: Condvar,
    wake: Condvar,
    poll_interval: Duration,
}

/// Marks the loop as stopped when the watch thread exits, including by panic, so waiters never
/// block on a dead loop.
struct RunningGuard(Arc<Shared>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        lock(&self.0.progress).running = false;
        self.0.iteration_done.notify_all();
    }
}

fn watch_loop(shared: Arc<Shared>) {
    let _guard = RunningGuard(shared.clone());
    loop {
        {
            let mut progress = lock(&shared.progress);
            if progress.shutdown {
                break;
            }
            progress.started += 1;
        }

        lock(&shared.state).check_for_changes();

        let mut progress = lock(&shared.progress);
        progress.completed += 1;
        shared.iteration_done.notify_all();
        if !progress.kick && !progress.shutdown {
            progress = match shared.wake.wait_timeout(progress, shared.poll_interval) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        progress.kick = false;
    }
    tracing::debug!("doorbell watch loop stopped");
}

/// A software NVMe controller.
///
/// The host side drives it exactly like hardware: program AQA/ASQ/ACQ, set CC.EN, wait for
/// CSTS.RDY, write commands into submission queue memory and ring doorbells. Completions appear
/// in completion queue memory and the completion doorbell register holds the controller's tail.
pub struct Controller {
    shared: Arc<Shared>,
    registers: Arc<ControllerRegisters>,
    memory: Arc<dyn MemoryBus>,
    vendor_id: u16,
    device_id: u16,
    worker: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("csts", &self.registers.csts())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl Controller {
    /// Builds a controller from `config` and starts its doorbell watch thread. The command
    /// responder is a [`FileResponder`] when the config names a rule file.
    pub fn new(
        config: ControllerConfig,
        memory: Arc<dyn MemoryBus>,
    ) -> Result<Self, ControllerError> {
        let responder: Box<dyn CommandResponder> = match &config.command_response_file {
            Some(path) => Box::new(FileResponder::new(path)),
            None => Box::new(NoResponder),
        };
        Self::with_responder(config, memory, responder)
    }

    pub fn with_responder(
        config: ControllerConfig,
        memory: Arc<dyn MemoryBus>,
        responder: Box<dyn CommandResponder>,
    ) -> Result<Self, ControllerError> {
        config.validate()?;

        let registers = Arc::new(ControllerRegisters::new(
            config.max_queue_entries,
            config.max_queue_id,
        ));
        let vendor_id = config.vendor_id;
        let device_id = config.device_id;
        let poll_interval = config.poll_interval();
        let state = ControllerState::new(config, registers.clone(), memory.clone(), responder)?;

        let shared = Arc::new(Shared {
            state: Mutex::new(state),
            progress: Mutex::new(LoopProgress {
                running: true,
                ..Default::default()
            }),
            iteration_done: Condvar::new(),
            wake: Condvar::new(),
            poll_interval,
        });

        let worker = {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name(WATCH_THREAD_NAME.to_string())
                .spawn(move || watch_loop(shared))
                .map_err(ControllerError::Spawn)?
        };
        tracing::debug!("doorbell watch loop started");

        Ok(Controller {
            shared,
            registers,
            memory,
            vendor_id,
            device_id,
            worker: Some(worker),
        })
    }

    pub fn registers(&self) -> &Arc<ControllerRegisters> {
        &self.registers
    }

    pub fn memory(&self) -> &Arc<dyn MemoryBus> {
        &self.memory
    }

    /// A PCI function view of this controller whose BAR0 decodes to the register file.
    pub fn pci_function(&self) -> NvmePciFunction {
        NvmePciFunction::new(self.vendor_id, self.device_id, self.registers.clone())
    }

    /// Replaces the command responder consulted before the built-in handlers.
    pub fn set_command_responder(&self, responder: Box<dyn CommandResponder>) {
        lock(&self.shared.state).responder = responder;
    }

    /// Controller level reset, performed between two loop iterations. Tears down the I/O queues,
    /// forgets in-flight command ids, reloads Identify defaults, activates pending firmware,
    /// rebuilds the admin queues from AQA/ASQ/ACQ and clears the doorbells.
    pub fn reset(&self) {
        lock(&self.shared.state).reset();
        tracing::info!("controller reset");
    }

    pub fn is_running(&self) -> bool {
        lock(&self.shared.progress).running
    }

    /// Blocks until a full loop iteration that started after this call has completed. Returns
    /// immediately if the loop is not running.
    pub fn wait_for_change_loop(&self) {
        let mut progress = lock(&self.shared.progress);
        if !progress.running {
            return;
        }
        let target = progress.started + 1;
        progress.kick = true;
        self.shared.wake.notify_all();
        while progress.running && progress.completed < target {
            progress = match self.shared.iteration_done.wait(progress) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }

    pub fn csts(&self) -> ControllerStatus {
        self.registers.csts()
    }

    /// The fault behind CSTS.CFS, if the controller is in fatal status.
    pub fn fatal_fault(&self) -> Option<ControllerFault> {
        lock(&self.shared.state).last_fault.clone()
    }

    pub fn submission_queue_ids(&self) -> Vec<u16> {
        lock(&self.shared.state).queues.submission_ids()
    }

    pub fn completion_queue_ids(&self) -> Vec<u16> {
        lock(&self.shared.state).queues.completion_ids()
    }

    pub fn submission_queue(&self, qid: u16) -> Option<Queue> {
        lock(&self.shared.state).queues.submission(qid).cloned()
    }

    pub fn completion_queue(&self, qid: u16) -> Option<Queue> {
        lock(&self.shared.state).queues.completion(qid).cloned()
    }

    /// Command ids currently in flight on `sqid`, ascending.
    pub fn outstanding_command_ids(&self, sqid: u16) -> Vec<u16> {
        lock(&self.shared.state).command_ids.outstanding(sqid)
    }

    pub fn active_namespace_ids(&self) -> Vec<u32> {
        lock(&self.shared.state).namespaces.active_ids()
    }

    pub fn inactive_namespace_ids(&self) -> Vec<u32> {
        lock(&self.shared.state).namespaces.inactive_ids()
    }

    pub fn firmware_slots(&self) -> FirmwareSlots {
        lock(&self.shared.state).firmware.clone()
    }

    /// Whether Firmware Image Download data is waiting for a commit.
    pub fn firmware_download_pending(&self) -> bool {
        !lock(&self.shared.state).firmware_store.is_empty()
    }

    /// The Identify Controller page as an Identify (CNS 0x01) command would return it.
    pub fn identify_controller_data(&self) -> Vec<u8> {
        lock(&self.shared.state).identify_controller_data()
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        lock(&self.shared.progress).shutdown = true;
        self.shared.wake.notify_all();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("doorbell watch thread panicked");
            }
        }
    }
}
