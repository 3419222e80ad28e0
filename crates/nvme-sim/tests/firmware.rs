mod common;

use common::*;
use nvme_sim::{NvmeCommand, NvmeStatus};

/// Downloads `image` in `chunk`-byte fragments.
fn download(h: &mut Harness, image: &[u8], chunk: usize) {
    for (idx, fragment) in image.chunks(chunk).enumerate() {
        let buf = h.alloc_buffer(fragment.len());
        h.write_bytes(buf, fragment);
        let dwords = fragment.len().div_ceil(4) as u32;
        let offset = (idx * chunk / 4) as u32;
        let cqe = h.admin(
            NvmeCommand::new(OPC_FIRMWARE_DOWNLOAD, next_cid())
                .with_prp(buf, 0)
                .with_cdw10(dwords - 1)
                .with_cdw11(offset),
        );
        assert!(cqe.succeeded(), "download: {:?}", cqe.nvme_status());
    }
}

fn commit(h: &mut Harness, slot: u8, action: u8) -> NvmeStatus {
    h.admin(
        NvmeCommand::new(OPC_FIRMWARE_COMMIT, next_cid())
            .with_cdw10((action as u32) << 3 | slot as u32),
    )
    .nvme_status()
}

fn firmware_log(h: &mut Harness) -> Vec<u8> {
    let buf = h.alloc_buffer(512);
    let numd = 512 / 4 - 1;
    let cqe = h.admin(
        NvmeCommand::new(OPC_GET_LOG_PAGE, next_cid())
            .with_prp(buf, 0)
            .with_cdw10(numd << 16 | 0x03),
    );
    assert!(cqe.succeeded());
    h.read_bytes(buf, 512)
}

#[test]
fn download_and_activate_now_updates_identify_revision() {
    let mut h = Harness::enabled();
    let mut image = b"2.1.0-rc".to_vec();
    image.extend(std::iter::repeat(0x5a).take(8184));
    download(&mut h, &image, 4096);
    assert!(h.controller.firmware_download_pending());

    assert_eq!(commit(&mut h, 2, 3), NvmeStatus::SUCCESS);
    assert!(!h.controller.firmware_download_pending());

    let slots = h.controller.firmware_slots();
    assert_eq!(slots.active_slot(), 2);
    assert_eq!(slots.image(2).unwrap().data, image);

    let (_, data) = h.identify(0x01, 0);
    assert_eq!(&data[64..72], b"2.1.0-rc");

    let log = firmware_log(&mut h);
    assert_eq!(log[0], 2);
    assert_eq!(&log[8..16], b"1.0     ");
    assert_eq!(&log[16..24], b"2.1.0-rc");
}

#[test]
fn activation_on_reset_waits_for_controller_reset() {
    let mut h = Harness::enabled();
    download(&mut h, b"3.0", 4096);
    assert_eq!(commit(&mut h, 3, 1), NvmeStatus::SUCCESS);

    let (_, data) = h.identify(0x01, 0);
    assert_eq!(&data[64..72], b"1.0     ");
    assert_eq!(firmware_log(&mut h)[0], 1 | 3 << 4);

    h.controller.reset();
    h.host_reset();
    let (_, data) = h.identify(0x01, 0);
    assert_eq!(&data[64..72], b"3.0     ");
    assert_eq!(firmware_log(&mut h)[0], 3);
}

#[test]
fn commit_failures() {
    let mut h = Harness::enabled();
    assert_eq!(commit(&mut h, 0, 0), NvmeStatus::INVALID_FIRMWARE_IMAGE);
    assert_eq!(commit(&mut h, 2, 2), NvmeStatus::INVALID_FIRMWARE_IMAGE);
    assert_eq!(commit(&mut h, 4, 0), NvmeStatus::INVALID_FIRMWARE_SLOT);
    assert_eq!(commit(&mut h, 1, 5), NvmeStatus::INVALID_FIELD);

    // Slot 0 selects the running slot.
    download(&mut h, b"1.1", 4096);
    assert_eq!(commit(&mut h, 0, 0), NvmeStatus::SUCCESS);
    assert_eq!(h.controller.firmware_slots().image(1).unwrap().data, b"1.1\0");
}

#[test]
fn unsupported_log_page_is_rejected() {
    let mut h = Harness::enabled();
    let buf = h.alloc_buffer(512);
    let cqe = h.admin(
        NvmeCommand::new(OPC_GET_LOG_PAGE, 1)
            .with_prp(buf, 0)
            .with_cdw10(127 << 16 | 0x01),
    );
    assert_eq!(cqe.nvme_status(), NvmeStatus::INVALID_LOG_PAGE);
}

#[test]
fn download_past_image_bound_is_rejected_without_buffering() {
    let mut h = Harness::with_config(nvme_sim::ControllerConfig {
        max_firmware_image_bytes: 8192,
        ..Default::default()
    });
    h.enable(2, 2);
    let buf = h.alloc_buffer(4096);
    h.write_bytes(buf, b"9.9");

    for offset in [0xffff_fff0u32, 8192 / 4, 8192 / 4 - 1] {
        let cqe = h.admin(
            NvmeCommand::new(OPC_FIRMWARE_DOWNLOAD, next_cid())
                .with_prp(buf, 0)
                .with_cdw10(1)
                .with_cdw11(offset),
        );
        assert_eq!(cqe.nvme_status(), NvmeStatus::INVALID_FIELD, "ofst {offset:#x}");
    }
    assert!(!h.controller.firmware_download_pending());
    assert_eq!(commit(&mut h, 2, 3), NvmeStatus::INVALID_FIRMWARE_IMAGE);

    // The controller keeps serving commands.
    assert!(h.admin(NvmeCommand::new(OPC_KEEP_ALIVE, next_cid())).succeeded());
    download(&mut h, b"9.9", 4096);
    assert_eq!(commit(&mut h, 2, 3), NvmeStatus::SUCCESS);
}
