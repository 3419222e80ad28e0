use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, ensure, Context};
use clap::Parser;
use nvme_sim::command::{COMMAND_SIZE, COMPLETION_SIZE};
use nvme_sim::{
    CompletionEntry, Controller, ControllerConfig, ControllerStatus, HostMemory, MemoryBus,
    NvmeCommand, PAGE_SIZE,
};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

const OPC_IDENTIFY: u8 = 0x06;
const OPC_KEEP_ALIVE: u8 = 0x18;
const CNS_CONTROLLER: u32 = 0x01;
const ADMIN_QUEUE_DEPTH: u16 = 4;
const READY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Parser)]
#[command(name = "nvme-sim", version, about = "Bring up a simulated NVMe controller")]
struct Args {
    /// Controller config (JSON). Defaults are used when absent.
    ///
    /// Environment variable: `NVME_SIM_CONFIG`.
    #[arg(long, env = "NVME_SIM_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter (tracing-subscriber EnvFilter syntax).
    ///
    /// Environment variable: `NVME_SIM_LOG`.
    #[arg(long, env = "NVME_SIM_LOG", default_value = "info")]
    log_level: String,

    /// Simulated host memory, in MiB.
    #[arg(long, default_value_t = 16)]
    memory_mib: usize,

    /// Print the report as JSON instead of text.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Serialize)]
struct CommandReport {
    command: &'static str,
    cid: u16,
    sqhd: u16,
    phase: bool,
    status_code_type: u8,
    status_code: u8,
}

impl CommandReport {
    fn new(command: &'static str, cqe: &CompletionEntry) -> Self {
        let status = cqe.nvme_status();
        CommandReport {
            command,
            cid: cqe.cid,
            sqhd: cqe.sqhd,
            phase: cqe.phase(),
            status_code_type: status.sct,
            status_code: status.sc,
        }
    }
}

#[derive(Debug, Serialize)]
struct Report {
    csts: u32,
    commands: Vec<CommandReport>,
    vendor_id: u16,
    serial_number: String,
    model_number: String,
    firmware_revision: String,
    namespaces: u32,
}

/// Host side of the admin queue pair.
struct AdminQueues {
    asq: u64,
    acq: u64,
    sq_tail: u16,
    cq_head: u16,
}

impl AdminQueues {
    fn submit(
        &mut self,
        controller: &Controller,
        mem: &HostMemory,
        cmd: NvmeCommand,
    ) -> anyhow::Result<CompletionEntry> {
        let slot = self.asq + self.sq_tail as u64 * COMMAND_SIZE as u64;
        mem.write_physical(slot, &cmd.to_bytes())
            .context("writing admin submission entry")?;
        self.sq_tail = (self.sq_tail + 1) % ADMIN_QUEUE_DEPTH;
        controller
            .registers()
            .ring_submission_doorbell(0, self.sq_tail);
        controller.wait_for_change_loop();

        // The controller publishes its completion tail through the CQ 0 head doorbell.
        let published = controller.registers().completion_doorbell(0).unwrap_or(0) as u16;
        ensure!(
            published != self.cq_head,
            "no completion posted for cid {} (csts {:?})",
            cmd.cid,
            controller.csts()
        );

        let mut bytes = [0u8; COMPLETION_SIZE];
        mem.read_physical(
            self.acq + self.cq_head as u64 * COMPLETION_SIZE as u64,
            &mut bytes,
        )
        .context("reading admin completion entry")?;
        self.cq_head = (self.cq_head + 1) % ADMIN_QUEUE_DEPTH;
        Ok(CompletionEntry::from_bytes(&bytes))
    }
}

fn ascii_field(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).trim_end().to_string()
}

fn run(args: &Args) -> anyhow::Result<Report> {
    let config = match &args.config {
        Some(path) => ControllerConfig::from_json_file(path)
            .with_context(|| format!("loading controller config {}", path.display()))?,
        None => ControllerConfig::default(),
    };

    let mem = Arc::new(HostMemory::new(args.memory_mib << 20));
    let controller = Controller::new(config, mem.clone()).context("starting controller")?;

    let asq = mem.alloc_pages(1).context("allocating admin SQ")?;
    let acq = mem.alloc_pages(1).context("allocating admin CQ")?;
    let regs = controller.registers();
    regs.set_admin_queue_depths(ADMIN_QUEUE_DEPTH, ADMIN_QUEUE_DEPTH);
    regs.set_admin_submission_queue(asq);
    regs.set_admin_completion_queue(acq);
    regs.set_enable(true);

    let deadline = Instant::now() + READY_TIMEOUT;
    loop {
        let csts = controller.csts();
        if csts.contains(ControllerStatus::FATAL) {
            bail!(
                "controller reported fatal status on enable: {}",
                controller
                    .fatal_fault()
                    .map(|fault| fault.to_string())
                    .unwrap_or_default()
            );
        }
        if csts.contains(ControllerStatus::READY) {
            break;
        }
        ensure!(Instant::now() < deadline, "timed out waiting for CSTS.RDY");
        controller.wait_for_change_loop();
    }
    tracing::info!("controller ready");

    let mut admin = AdminQueues {
        asq,
        acq,
        sq_tail: 0,
        cq_head: 0,
    };
    let mut commands = Vec::new();

    let cqe = admin.submit(&controller, &mem, NvmeCommand::new(OPC_KEEP_ALIVE, 1))?;
    commands.push(CommandReport::new("keep-alive", &cqe));

    let buf = mem.alloc_pages(1).context("allocating identify buffer")?;
    let identify = NvmeCommand::new(OPC_IDENTIFY, 2)
        .with_prp(buf, 0)
        .with_cdw10(CNS_CONTROLLER);
    let cqe = admin.submit(&controller, &mem, identify)?;
    commands.push(CommandReport::new("identify-controller", &cqe));
    ensure!(
        cqe.succeeded(),
        "identify controller failed: {:?}",
        cqe.nvme_status()
    );

    let mut data = vec![0u8; PAGE_SIZE];
    mem.read_physical(buf, &mut data)
        .context("reading identify data")?;

    Ok(Report {
        csts: controller.csts().bits(),
        commands,
        vendor_id: u16::from_le_bytes([data[0], data[1]]),
        serial_number: ascii_field(&data[4..24]),
        model_number: ascii_field(&data[24..64]),
        firmware_revision: ascii_field(&data[64..72]),
        namespaces: u32::from_le_bytes([data[516], data[517], data[518], data[519]]),
    })
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level)
        .with_context(|| format!("invalid log filter {:?}", args.log_level))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let report = run(&args)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("CSTS: {:#x}", report.csts);
    for cmd in &report.commands {
        println!(
            "{:<20} cid={} sqhd={} phase={} sct={:#x} sc={:#x}",
            cmd.command,
            cmd.cid,
            cmd.sqhd,
            cmd.phase as u8,
            cmd.status_code_type,
            cmd.status_code
        );
    }
    println!("VID: {:#06x}", report.vendor_id);
    println!("SN:  {}", report.serial_number);
    println!("MN:  {}", report.model_number);
    println!("FR:  {}", report.firmware_revision);
    println!("NN:  {}", report.namespaces);
    Ok(())
}
