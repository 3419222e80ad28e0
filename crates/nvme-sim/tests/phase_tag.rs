mod common;

use common::*;
use nvme_sim::queue::Queue;
use nvme_sim::NvmeCommand;
use proptest::prelude::*;

fn expected_phase(k: u32, depth: u16) -> bool {
    (k / depth as u32) % 2 == 1
}

proptest! {
    #[test]
    fn completion_queue_phase_follows_wrap_count(depth in 2u16..64, posts in 1u32..512) {
        let mut cq = Queue::completion(1, depth, 0x10000);
        for k in 1..=posts {
            let slot = cq.advance_completion_tail();
            prop_assert_eq!(slot as u32, (k - 1) % depth as u32);
            prop_assert_eq!(cq.phase, expected_phase(k, depth));
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn posted_entries_carry_wrap_phase(depth in 2u16..6, posts in 1u32..20) {
        let mut h = Harness::enabled();
        h.create_io_pair(1, depth);

        for k in 1..=posts {
            let cqe = h.execute(1, 1, NvmeCommand::new(OPC_FLUSH, k as u16).with_nsid(1));
            prop_assert!(cqe.succeeded());
            prop_assert_eq!(cqe.cid, k as u16);
            prop_assert_eq!(cqe.phase(), expected_phase(k, depth));
        }
        let cq = h.controller.completion_queue(1).unwrap();
        prop_assert_eq!(cq.tail as u32, posts % depth as u32);
    }
}

#[test]
fn admin_queue_phase_flips_after_last_slot() {
    let mut h = Harness::new();
    h.enable(4, 3);

    let phases: Vec<bool> = (0..7)
        .map(|cid| h.admin(NvmeCommand::new(OPC_KEEP_ALIVE, cid)).phase())
        .collect();
    assert_eq!(phases, vec![false, false, true, true, true, false, false]);
}

#[test]
fn batch_longer_than_completion_queue_keeps_posting() {
    let mut h = Harness::new();
    h.enable(4, 2);
    for cid in 1..=3 {
        h.write_command(0, NvmeCommand::new(OPC_KEEP_ALIVE, cid));
    }
    h.ring(0);
    h.controller.wait_for_change_loop();

    // Three posts on a two-entry ring: slot 0 was reused by the third completion.
    let cq = h.controller.completion_queue(0).unwrap();
    assert_eq!(cq.tail, 1);
    let last = read_completion(&h.mem, cq.base, 0);
    assert_eq!(last.cid, 3);
    assert_eq!(last.phase(), expected_phase(3, 2));
    assert!(last.succeeded());

    assert!(h.controller.fatal_fault().is_none());
    assert!(h.controller.outstanding_command_ids(0).is_empty());
}
