mod common;

use std::sync::{Arc, Mutex};

use common::*;
use nvme_sim::{
    CommandResponder, CompletionEntry, ControllerConfig, NvmeCommand, NvmeStatus, ResponderError,
};

fn file_harness() -> (tempfile::TempDir, std::path::PathBuf, Harness) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("responses.json");
    let mut h = Harness::with_config(ControllerConfig {
        command_response_file: Some(path.clone()),
        ..Default::default()
    });
    h.enable(4, 4);
    (dir, path, h)
}

#[test]
fn rule_file_overrides_matching_commands() {
    let (_dir, path, mut h) = file_harness();

    // No file yet: the built-in handler answers.
    assert!(h.admin(NvmeCommand::new(OPC_KEEP_ALIVE, 1)).succeeded());

    std::fs::write(
        &path,
        r#"{ "rules": [ { "opcode": 24, "sct": 0, "sc": 6, "dnr": true, "result": 3 } ] }"#,
    )
    .unwrap();
    let cqe = h.admin(NvmeCommand::new(OPC_KEEP_ALIVE, 2));
    assert_eq!(cqe.nvme_status(), NvmeStatus { sct: 0, sc: 6, dnr: true });
    assert_eq!(cqe.dw0, 3);
    assert_eq!(cqe.cid, 2);
    assert_eq!(cqe.sqid, 0);

    // Other opcodes still reach their handlers.
    let (cqe, _) = h.identify(0x01, 0);
    assert!(cqe.succeeded());

    std::fs::write(&path, "").unwrap();
    assert!(h.admin(NvmeCommand::new(OPC_KEEP_ALIVE, 3)).succeeded());
}

#[test]
fn overridden_commands_release_their_command_id() {
    let (_dir, path, mut h) = file_harness();
    std::fs::write(&path, r#"{ "rules": [ { "opcode": 24, "sc": 6 } ] }"#).unwrap();

    assert!(!h.admin(NvmeCommand::new(OPC_KEEP_ALIVE, 9)).succeeded());
    assert!(h.controller.outstanding_command_ids(0).is_empty());
    assert!(!h.admin(NvmeCommand::new(OPC_KEEP_ALIVE, 9)).succeeded());
}

#[test]
fn unreadable_rules_fall_back_to_built_in_handler() {
    let (_dir, path, mut h) = file_harness();
    std::fs::write(&path, "{ not json").unwrap();
    assert!(h.admin(NvmeCommand::new(OPC_KEEP_ALIVE, 1)).succeeded());
}

#[test]
fn responder_runs_after_command_id_check() {
    let (_dir, path, mut h) = file_harness();
    std::fs::write(&path, r#"{ "rules": [ { "opcode": 24, "sc": 6 } ] }"#).unwrap();

    h.write_command(0, NvmeCommand::new(OPC_KEEP_ALIVE, 5));
    h.write_command(0, NvmeCommand::new(OPC_KEEP_ALIVE, 5));
    h.ring(0);
    h.controller.wait_for_change_loop();
    let cqes = h.completions(0);
    assert_eq!(cqes.len(), 2);
    assert_eq!(cqes[1].nvme_status(), NvmeStatus::COMMAND_ID_CONFLICT);
}

/// Records what it was offered and answers I/O reads with a fixed status.
#[derive(Clone, Default)]
struct Recording {
    seen: Arc<Mutex<Vec<(u16, u8)>>>,
}

impl CommandResponder for Recording {
    fn respond(
        &mut self,
        sqid: u16,
        command: &NvmeCommand,
    ) -> Result<Option<CompletionEntry>, ResponderError> {
        self.seen.lock().unwrap().push((sqid, command.opc));
        if sqid != 0 && command.opc == OPC_READ {
            return Ok(Some(CompletionEntry::new(NvmeStatus::LBA_OUT_OF_RANGE)));
        }
        Ok(None)
    }
}

#[test]
fn custom_responder_sees_every_command() {
    let mut h = Harness::new();
    let recording = Recording::default();
    h.controller
        .set_command_responder(Box::new(recording.clone()));
    h.enable(4, 4);
    h.create_io_pair(1, 8);

    let cqe = h.execute(1, 1, NvmeCommand::new(OPC_READ, 1).with_nsid(1));
    assert_eq!(cqe.nvme_status(), NvmeStatus::LBA_OUT_OF_RANGE);
    assert_eq!(cqe.sqid, 1);

    let seen = recording.seen.lock().unwrap().clone();
    assert_eq!(
        seen,
        vec![(0, OPC_CREATE_IO_CQ), (0, OPC_CREATE_IO_SQ), (1, OPC_READ)]
    );
}
