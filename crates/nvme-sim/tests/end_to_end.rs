mod common;

use common::*;
use nvme_sim::identify::IdentifyController;
use nvme_sim::{ControllerConfig, NvmeCommand, NvmeStatus};

#[test]
fn admin_bring_up_and_queue_lifecycle() {
    let mut h = Harness::enabled();

    let cqe = h.admin(NvmeCommand::new(OPC_KEEP_ALIVE, 0));
    assert!(cqe.succeeded());
    assert_eq!(cqe.cid, 0);
    assert_eq!(cqe.sqid, 0);

    let buf = h.alloc_buffer(4096);
    let cqe = h.admin(
        NvmeCommand::new(OPC_IDENTIFY, 1)
            .with_prp(buf, 0)
            .with_cdw10(0x01),
    );
    assert!(cqe.succeeded());
    assert_eq!(cqe.cid, 1);
    let expected = IdentifyController::from_config(&ControllerConfig::default())
        .to_bytes(b"1.0     ", 1);
    assert_eq!(h.read_bytes(buf, 4096), expected);
    assert_eq!(h.controller.identify_controller_data(), expected);

    assert!(h.create_io_cq(1, 16).succeeded());
    assert!(h.create_io_sq(1, 16, 1).succeeded());
    assert_eq!(h.controller.submission_queue_ids(), vec![0, 1]);
    assert_eq!(h.controller.completion_queue_ids(), vec![0, 1]);

    let cqe = h.delete_io_cq(1);
    assert_eq!(cqe.nvme_status(), NvmeStatus::INVALID_QUEUE_DELETION);
    assert_eq!(h.controller.completion_queue_ids(), vec![0, 1]);

    assert!(h.delete_io_sq(1).succeeded());
    assert!(h.delete_io_cq(1).succeeded());
    assert_eq!(h.controller.submission_queue_ids(), vec![0]);
    assert_eq!(h.controller.completion_queue_ids(), vec![0]);
}

#[test]
fn completions_report_sq_head_after_batch() {
    let mut h = Harness::new();
    h.enable(8, 8);

    for cid in 10..13 {
        h.write_command(0, NvmeCommand::new(OPC_KEEP_ALIVE, cid));
    }
    h.ring(0);
    h.controller.wait_for_change_loop();

    let cqes = h.completions(0);
    assert_eq!(cqes.iter().map(|c| c.cid).collect::<Vec<_>>(), vec![10, 11, 12]);
    for cqe in &cqes {
        assert!(cqe.succeeded());
        assert_eq!(cqe.sqhd, 3);
    }
    assert_eq!(h.controller.submission_queue(0).unwrap().head, 3);
    assert!(h.controller.outstanding_command_ids(0).is_empty());
}

#[test]
fn io_commands_complete_on_paired_completion_queue() {
    let mut h = Harness::enabled();
    h.create_io_pair(1, 8);
    h.create_io_pair(2, 8);

    let cqe = h.execute(2, 2, NvmeCommand::new(OPC_FLUSH, 42).with_nsid(1));
    assert!(cqe.succeeded());
    assert_eq!((cqe.sqid, cqe.cid), (2, 42));
    assert!(h.completions(1).is_empty());
    assert!(h.completions(0).is_empty());
}

#[test]
fn wait_for_change_loop_returns_promptly_while_idle() {
    let h = Harness::new();
    for _ in 0..100 {
        h.controller.wait_for_change_loop();
    }
    assert!(h.controller.is_running());
}
