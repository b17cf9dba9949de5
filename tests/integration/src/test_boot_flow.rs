// Licensed under the Apache-2.0 license

use crate::harness::{init_logging, pattern, stage_download, stage_main, Rig};
use mbr::{AppKind, DfuMode, FwVersion, SlotId, StartupMode};

#[test]
fn test_factory_device_boots_main() {
    init_logging();
    let rig = Rig::new();
    let mut pm = rig.manager();

    let selection = pm.resolve_boot().unwrap();
    assert_eq!(selection.mode, StartupMode::MainRun);
    assert_eq!(selection.address, pm.app_address());
}

#[test]
fn test_full_upgrade_cycle_persists_across_reboot() {
    init_logging();
    let rig = Rig::new();
    let plain = pattern(1000);
    {
        let mut pm = rig.manager();
        stage_download(&mut pm, &rig, &plain, FwVersion::new(2, 1, 0), AppKind::Main);
        pm.set_startup_mode(StartupMode::Upgrade).unwrap();

        let selection = pm.resolve_boot().unwrap();
        assert_eq!(selection.mode, StartupMode::MainRun);
        assert_eq!(
            rig.internal.snapshot(pm.app_address() as usize, plain.len()),
            plain
        );
        assert_eq!(pm.mbr().dfu_count(AppKind::Main), 1);
    }

    // Reboot: a fresh manager over the same devices sees the committed
    // state and boots the new image without re-running the upgrade.
    let mut pm = rig.manager();
    assert_eq!(pm.startup_mode(), StartupMode::MainRun);
    assert_eq!(
        pm.mbr().slot(SlotId::Main).fw_header.version(),
        FwVersion::new(2, 1, 0)
    );
    let selection = pm.resolve_boot().unwrap();
    assert_eq!(selection.mode, StartupMode::MainRun);
    assert_eq!(pm.mbr().dfu_count(AppKind::Main), 1);
}

#[test]
fn test_corrupted_download_is_refused() {
    init_logging();
    let rig = Rig::new();
    let mut pm = rig.manager();
    let plain = pattern(600);
    stage_main(&mut pm, &rig, &plain, FwVersion::new(1, 0, 0));
    stage_download(&mut pm, &rig, &pattern(800), FwVersion::new(2, 0, 0), AppKind::Main);

    let download_addr = pm.mbr().slot(SlotId::ImageDownload).startup_addr;
    rig.external.flip_bits(download_addr as usize + 100, 0x10);

    pm.set_startup_mode(StartupMode::Upgrade).unwrap();
    let selection = pm.resolve_boot().unwrap();

    // The upgrade is refused and the old main still runs.
    assert_eq!(selection.mode, StartupMode::MainRun);
    assert_eq!(pm.mbr().dfu_count(AppKind::Main), 0);
    assert_eq!(
        pm.mbr().slot(SlotId::Main).fw_header.version(),
        FwVersion::new(1, 0, 0)
    );
    assert_eq!(
        rig.internal.snapshot(pm.app_address() as usize, plain.len()),
        plain
    );
}

#[test]
fn test_version_gate_blocks_downgrade_at_boot() {
    init_logging();
    let rig = Rig::new();
    let mut pm = rig.manager();
    let plain = pattern(600);
    stage_main(&mut pm, &rig, &plain, FwVersion::new(3, 0, 0));
    pm.mbr_mut().set_dfu_mode(DfuMode::UpgradeUp);
    stage_download(&mut pm, &rig, &pattern(600), FwVersion::new(2, 9, 9), AppKind::Main);

    pm.set_startup_mode(StartupMode::Upgrade).unwrap();
    let selection = pm.resolve_boot().unwrap();

    assert_eq!(selection.mode, StartupMode::MainRun);
    assert_eq!(
        pm.mbr().slot(SlotId::Main).fw_header.version(),
        FwVersion::new(3, 0, 0)
    );
    assert_eq!(pm.mbr().dfu_count(AppKind::Main), 0);
}

#[test]
fn test_power_loss_during_upgrade_recovers_via_rollback() {
    init_logging();
    let rig = Rig::new();
    let mut pm = rig.manager();
    let plain = pattern(0x2000);
    stage_main(&mut pm, &rig, &plain, FwVersion::new(1, 0, 0));
    pm.backup_main().unwrap();
    stage_download(&mut pm, &rig, &pattern(0x2000), FwVersion::new(2, 0, 0), AppKind::Main);
    pm.set_startup_mode(StartupMode::Upgrade).unwrap();

    // The write that dies mid-image leaves the main slot half programmed.
    rig.internal.fail_program_in(2);
    let selection = pm.resolve_boot().unwrap();

    // Main no longer verifies, so the resolver restores the rollback copy
    // and boots it.
    assert_eq!(selection.mode, StartupMode::MainRun);
    assert_eq!(selection.address, pm.app_address());
    assert_eq!(
        rig.internal.snapshot(pm.app_address() as usize, plain.len()),
        plain
    );
    assert_eq!(
        pm.mbr().slot(SlotId::Main).fw_header.version(),
        FwVersion::new(1, 0, 0)
    );
}

#[test]
fn test_boot_fallback_when_main_unrecoverable() {
    init_logging();
    let rig = Rig::new();
    let mut pm = rig.manager();
    let plain = pattern(600);
    stage_main(&mut pm, &rig, &plain, FwVersion::new(1, 0, 0));

    // Destroy main with no rollback copy available.
    rig.internal.flip_bits(pm.app_address() as usize + 1, 0xff);
    let selection = pm.resolve_boot().unwrap();

    assert_eq!(selection.mode, StartupMode::BootRun);
    assert_eq!(selection.address, pm.boot_address());
    assert_eq!(pm.startup_mode(), StartupMode::BootRun);
}
