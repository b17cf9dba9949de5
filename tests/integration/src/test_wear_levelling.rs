// Licensed under the Apache-2.0 license

use crate::harness::{init_logging, test_map};
use boot_testing_common::RamFlash;
use flash_hil::FlashPartition;
use flash_log::{LogStore, MAX_RECORD_LEN};
use mbr::{AppKind, MasterBootRecord, StartupMode};

#[test]
fn test_record_survives_many_commits() {
    init_logging();
    // The params region lives in a window of the internal device, like on
    // the real part.
    let device = RamFlash::new(0x10000, 0x1000);
    let map = test_map();

    // Enough commits to wrap the 8 KiB params region several times.
    {
        let params = FlashPartition::new(&device, "mbr-params", 0x8000, 0x2000).unwrap();
        let mut mbr = MasterBootRecord::new(&params, map);
        mbr.begin().unwrap();
        for _ in 0..100 {
            mbr.increment_dfu_count(AppKind::Main);
            mbr.commit().unwrap();
        }
    }

    let params = FlashPartition::new(&device, "mbr-params", 0x8000, 0x2000).unwrap();
    let mut reopened = MasterBootRecord::new(&params, map);
    reopened.begin().unwrap();
    assert_eq!(reopened.dfu_count(AppKind::Main), 100);
}

#[test]
fn test_torn_commit_keeps_previous_record() {
    init_logging();
    let flash = RamFlash::new(0x2000, 0x1000);
    let map = test_map();

    let mut mbr = MasterBootRecord::new(&flash, map);
    mbr.begin().unwrap();
    mbr.set_startup_mode(StartupMode::BootRun);
    mbr.commit().unwrap();

    // Power dies while the next record's header is being programmed.
    mbr.set_startup_mode(StartupMode::Upgrade);
    flash.fail_program_in(1);
    assert!(mbr.commit().is_err());

    let mut reopened = MasterBootRecord::new(&flash, map);
    reopened.begin().unwrap();
    assert_eq!(reopened.startup_mode(), StartupMode::BootRun);
}

#[test]
fn test_raw_store_interleaves_with_reopen() {
    init_logging();
    let flash = RamFlash::new(0x2000, 0x1000);
    let mut payload = [0u8; MAX_RECORD_LEN];

    let mut store = LogStore::new(&flash, 0, 0x2000, 0x1000, 64);
    store.begin(true).unwrap();
    for round in 0u8..50 {
        payload[..64].fill(round);
        store.write(&payload[..64]).unwrap();
    }

    let mut reopened = LogStore::new(&flash, 0, 0x2000, 0x1000, 64);
    reopened.begin(false).unwrap();
    let len = reopened.read(&mut payload).unwrap();
    assert_eq!(len, 64);
    assert!(payload[..64].iter().all(|&b| b == 49));
}
