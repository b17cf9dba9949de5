// Licensed under the Apache-2.0 license

//! Device memory map and the factory master boot record derived from it.

use crate::record::{
    Aes128Params, AppInfo, AppKind, AppStatus, DfuMode, EncKind, FirmwareHeader, FwVersion,
    ImageType, MbrRecord, MemKind, StartupMode, CHECKSUM_NONE, CHECKSUM_NO_VERIFY, HW_VERSION_LEN,
};

/// Addresses and sizes of every region the boot core touches.
///
/// Internal addresses are absolute flash addresses inside the MCU; external
/// addresses are offsets into the companion SPI flash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootMemoryMap {
    pub page_size: u32,

    pub mbr_params_addr: u32,
    pub mbr_params_size: u32,

    pub boot_addr: u32,
    pub boot_size: u32,
    pub main_addr: u32,
    pub main_size: u32,

    pub boot_rollback_addr: u32,
    pub boot_rollback_size: u32,
    pub main_rollback_addr: u32,
    pub main_rollback_size: u32,
    pub image_download_addr: u32,
    pub image_download_size: u32,

    pub hw_version: &'static str,
    pub aes: Aes128Params,
}

impl Default for BootMemoryMap {
    fn default() -> Self {
        BootMemoryMap {
            page_size: 4096,

            mbr_params_addr: 0x0001_0000,
            mbr_params_size: 0x2000,

            boot_addr: 0x0001_2000,
            boot_size: 0x0004_B000,
            main_addr: 0x0005_D000,
            main_size: 0x000A_3000,

            boot_rollback_addr: 0x0000_0000,
            boot_rollback_size: 0x0004_B000,
            main_rollback_addr: 0x0004_B000,
            main_rollback_size: 0x000A_3000,
            image_download_addr: 0x000E_E000,
            image_download_size: 0x0010_0000,

            hw_version: "wearboot-dev1",
            aes: Aes128Params {
                key: [
                    0x9a, 0x95, 0x0f, 0x6c, 0x4f, 0xa0, 0xf9, 0x19, 0xcb, 0x1e, 0x05, 0x39, 0x56,
                    0x47, 0x23, 0xe2,
                ],
                iv: [
                    0x45, 0xc4, 0x25, 0x0f, 0x8d, 0x78, 0x85, 0xa1, 0xe7, 0x46, 0x94, 0xc7, 0xdd,
                    0x24, 0x79, 0x83,
                ],
            },
        }
    }
}

impl BootMemoryMap {
    /// Factory record: resident main and boot images are trusted as-is,
    /// rollback and download slots start empty.
    pub fn default_record(&self) -> MbrRecord {
        let main_header = FirmwareHeader {
            checksum: CHECKSUM_NO_VERIFY,
            size: 0,
            type_word: ImageType::new(MemKind::Internal, EncKind::Raw, AppKind::Main).raw(),
            version_word: FwVersion::new(0, 1, 1).raw(),
        };
        let boot_header = FirmwareHeader {
            checksum: CHECKSUM_NO_VERIFY,
            size: 0,
            type_word: ImageType::new(MemKind::Internal, EncKind::Raw, AppKind::Boot).raw(),
            version_word: FwVersion::new(1, 0, 0).raw(),
        };
        let main_rollback_header = FirmwareHeader {
            checksum: CHECKSUM_NONE,
            size: 0,
            type_word: ImageType::new(MemKind::External, EncKind::Encrypted, AppKind::Main).raw(),
            version_word: 0,
        };
        let boot_rollback_header = FirmwareHeader {
            checksum: CHECKSUM_NONE,
            size: 0,
            type_word: ImageType::new(MemKind::External, EncKind::Encrypted, AppKind::Boot).raw(),
            version_word: 0,
        };
        let download_header = FirmwareHeader {
            checksum: CHECKSUM_NONE,
            size: 0,
            type_word: ImageType::new(MemKind::External, EncKind::HeaderEncrypted, AppKind::Main).raw(),
            version_word: 0,
        };

        let mut hw_version = [0u8; HW_VERSION_LEN];
        let tag = self.hw_version.as_bytes();
        let len = tag.len().min(HW_VERSION_LEN - 1);
        hw_version[..len].copy_from_slice(&tag[..len]);

        let mut record = MbrRecord {
            main_app: AppInfo::new(self.main_addr, self.main_size, main_header, AppStatus::Ok),
            main_rollback: AppInfo::new(
                self.main_rollback_addr,
                self.main_rollback_size,
                main_rollback_header,
                AppStatus::None,
            ),
            boot_app: AppInfo::new(self.boot_addr, self.boot_size, boot_header, AppStatus::Ok),
            boot_rollback: AppInfo::new(
                self.boot_rollback_addr,
                self.boot_rollback_size,
                boot_rollback_header,
                AppStatus::None,
            ),
            image_download: AppInfo::new(
                self.image_download_addr,
                self.image_download_size,
                download_header,
                AppStatus::None,
            ),
            dfu_num_main: 0,
            dfu_num_boot: 0,
            hw_version,
            aes_key: self.aes.key,
            aes_iv: self.aes.iv,
            common: 0,
        };
        record.set_startup_mode(StartupMode::MainRun);
        record.set_dfu_mode(DfuMode::UpgradeAny);
        record
    }
}
