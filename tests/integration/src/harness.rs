// Licensed under the Apache-2.0 license

//! Shared fixtures: simulated flash devices, a scaled memory map, and image
//! staging helpers that mirror what the image build tooling produces.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncryptMut, KeyIvInit};
use boot_testing_common::RamFlash;
use crc32fast::Hasher;
use mbr::{
    Aes128Params, AppKind, AppStatus, BootMemoryMap, EncKind, FirmwareHeader, FwVersion,
    ImageType, MemKind, SlotId, CHECKSUM_NO_VERIFY,
};
use partition_manager::PartitionManager;
use zerocopy::IntoBytes;

pub fn init_logging() {
    let _ = simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Debug)
        .init();
}

pub struct Rig {
    pub internal: RamFlash,
    pub external: RamFlash,
    pub params: RamFlash,
}

impl Rig {
    pub fn new() -> Self {
        Rig {
            internal: RamFlash::new(0x10000, 0x1000),
            external: RamFlash::new(0x10000, 0x1000),
            params: RamFlash::new(0x2000, 0x1000),
        }
    }

    pub fn manager(&self) -> PartitionManager<'_> {
        let mut pm =
            PartitionManager::new(&self.internal, &self.external, &self.params, test_map());
        pm.begin().unwrap();
        pm
    }
}

pub fn test_map() -> BootMemoryMap {
    BootMemoryMap {
        page_size: 0x1000,
        mbr_params_addr: 0,
        mbr_params_size: 0x2000,
        boot_addr: 0x1000,
        boot_size: 0x2000,
        main_addr: 0x3000,
        main_size: 0x4000,
        boot_rollback_addr: 0,
        boot_rollback_size: 0x2000,
        main_rollback_addr: 0x2000,
        main_rollback_size: 0x4000,
        image_download_addr: 0x6000,
        image_download_size: 0x8000,
        ..BootMemoryMap::default()
    }
}

pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 13 + 5) as u8).collect()
}

fn encrypt_cbc(params: &Aes128Params, data: &mut [u8]) {
    let mut enc = cbc::Encryptor::<aes::Aes128>::new(&params.key.into(), &params.iv.into());
    for block in data.chunks_exact_mut(16) {
        enc.encrypt_block_mut(GenericArray::from_mut_slice(block));
    }
}

/// Place an upgrade image in the download slot the way the release tooling
/// lays it out: a plaintext firmware header followed by the AES-CBC payload,
/// with the slot record's checksum covering both as stored.
pub fn stage_download(
    pm: &mut PartitionManager<'_>,
    rig: &Rig,
    plain: &[u8],
    version: FwVersion,
    kind: AppKind,
) {
    let embedded = FirmwareHeader {
        checksum: CHECKSUM_NO_VERIFY,
        size: plain.len() as u32,
        type_word: ImageType::new(MemKind::Internal, EncKind::Raw, kind).raw(),
        version_word: version.raw(),
    };
    let mut padded = plain.to_vec();
    while padded.len() % 16 != 0 {
        padded.push(0);
    }
    encrypt_cbc(&pm.mbr().aes(), &mut padded);

    let mut slot = *pm.mbr().slot(SlotId::ImageDownload);
    rig.external
        .install(slot.startup_addr as usize, embedded.as_bytes());
    rig.external
        .install(slot.startup_addr as usize + 16, &padded);

    slot.fw_header.size = plain.len() as u32;
    slot.fw_header.version_word = version.raw();
    let mut hasher = Hasher::new();
    hasher.update(slot.fw_header.checked_prefix());
    hasher.update(embedded.as_bytes());
    hasher.update(&padded);
    slot.fw_header.checksum = hasher.finalize();
    slot.set_app_status(AppStatus::Ok);
    pm.mbr_mut().set_slot(SlotId::ImageDownload, slot);
    pm.mbr_mut().commit().unwrap();
}

/// Place a raw image in the main slot with a real checksum, as a completed
/// upgrade would leave it.
pub fn stage_main(pm: &mut PartitionManager<'_>, rig: &Rig, plain: &[u8], version: FwVersion) {
    let mut slot = *pm.mbr().slot(SlotId::Main);
    rig.internal.install(slot.startup_addr as usize, plain);
    slot.fw_header.size = plain.len() as u32;
    slot.fw_header.version_word = version.raw();
    let mut hasher = Hasher::new();
    hasher.update(slot.fw_header.checked_prefix());
    hasher.update(plain);
    slot.fw_header.checksum = hasher.finalize();
    slot.set_app_status(AppStatus::Ok);
    pm.mbr_mut().set_slot(SlotId::Main, slot);
    pm.mbr_mut().commit().unwrap();
}
