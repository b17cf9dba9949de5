// Licensed under the Apache-2.0 license

//! Slot operations and the boot-time startup-mode state machine.

use crate::cipher::{CipherStream, AES_BLOCK_LEN};
use crate::PartitionError;
use core::cmp::min;
use crc32fast::Hasher;
use flash_hil::FlashStorage;
use log::{debug, error, info, warn};
use mbr::{
    AppInfo, AppKind, AppStatus, BootMemoryMap, DfuMode, FirmwareHeader, MasterBootRecord,
    MemKind, SlotId, StartupMode, CHECKSUM_NONE, CHECKSUM_NO_VERIFY, FW_SIGNAL_MAGIC,
};
use zerocopy::FromBytes;

/// Chunk size for transfers and checksum streaming. Devices with a larger
/// erase block are rejected at [`PartitionManager::begin`].
pub const MAX_ERASE_BLOCK: usize = 4096;

const FW_HEADER_LEN: u32 = core::mem::size_of::<FirmwareHeader>() as u32;

/// Outcome of [`PartitionManager::resolve_boot`]: the persisted mode after
/// fallback and the address to hand to the jump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootSelection {
    pub mode: StartupMode,
    pub address: u32,
}

/// Moves firmware images between the internal and external flash devices
/// according to the master boot record, and picks the image to run.
///
/// All slot addresses in the record are interpreted against the device named
/// by the slot's memory kind. Bulk work goes through a fixed scratch buffer,
/// so nothing here allocates.
pub struct PartitionManager<'a> {
    internal: &'a dyn FlashStorage,
    external: &'a dyn FlashStorage,
    mbr: MasterBootRecord<'a>,
    scratch: [u8; MAX_ERASE_BLOCK],
}

impl<'a> PartitionManager<'a> {
    pub fn new(
        internal: &'a dyn FlashStorage,
        external: &'a dyn FlashStorage,
        params: &'a dyn FlashStorage,
        map: BootMemoryMap,
    ) -> Self {
        PartitionManager {
            internal,
            external,
            mbr: MasterBootRecord::new(params, map),
            scratch: [0; MAX_ERASE_BLOCK],
        }
    }

    /// Check device geometry and load the master boot record.
    pub fn begin(&mut self) -> Result<(), PartitionError> {
        for dev in [self.internal, self.external] {
            let erase_size = dev.erase_size();
            if erase_size == 0 || erase_size > MAX_ERASE_BLOCK {
                return Err(PartitionError::Geometry);
            }
            debug!(
                "partition: device size=0x{:x} read={} program={} erase={}",
                dev.capacity(),
                dev.read_size(),
                dev.program_size(),
                erase_size
            );
        }
        self.mbr.begin()?;
        self.mbr.log_info();
        Ok(())
    }

    pub fn mbr(&self) -> &MasterBootRecord<'a> {
        &self.mbr
    }

    pub fn mbr_mut(&mut self) -> &mut MasterBootRecord<'a> {
        &mut self.mbr
    }

    /// Jump target of the main application slot.
    pub fn app_address(&self) -> u32 {
        self.mbr.slot(SlotId::Main).startup_addr
    }

    /// Jump target of the factory bootloader slot.
    pub fn boot_address(&self) -> u32 {
        self.mbr.slot(SlotId::Boot).startup_addr
    }

    pub fn startup_mode(&self) -> StartupMode {
        self.mbr.startup_mode()
    }

    /// Persist a new startup mode immediately.
    pub fn set_startup_mode(&mut self, mode: StartupMode) -> Result<(), PartitionError> {
        self.mbr.set_startup_mode(mode);
        self.mbr.commit()?;
        Ok(())
    }

    pub fn verify_main(&mut self) -> bool {
        self.verify_slot(SlotId::Main)
    }

    pub fn verify_boot(&mut self) -> bool {
        self.verify_slot(SlotId::Boot)
    }

    pub fn verify_main_rollback(&mut self) -> bool {
        self.verify_slot(SlotId::MainRollback)
    }

    pub fn verify_boot_rollback(&mut self) -> bool {
        self.verify_slot(SlotId::BootRollback)
    }

    pub fn verify_image_download(&mut self) -> bool {
        self.verify_slot(SlotId::ImageDownload)
    }

    pub fn verify_slot(&mut self, id: SlotId) -> bool {
        let info = *self.mbr.slot(id);
        let ok = self.verify(&info);
        debug!("partition: verify {:?}: {}", id, ok);
        ok
    }

    /// Install the downloaded image into the slot its header names.
    ///
    /// The version gate runs before anything is touched, so a refused
    /// candidate leaves flash and the record as they were. When the current
    /// target still verifies it is backed up to its rollback slot first; a
    /// failed backup aborts the upgrade rather than overwrite the only good
    /// copy.
    pub fn app_upgrade(&mut self) -> Result<AppKind, PartitionError> {
        let download = *self.mbr.slot(SlotId::ImageDownload);
        if !self.verify(&download) {
            return Err(PartitionError::SourceInvalid);
        }
        let image = self.image_header(&download)?;
        let kind = image.app_kind().map_err(|_| PartitionError::BadHeader)?;
        let target = match kind {
            AppKind::Main => SlotId::Main,
            AppKind::Boot => SlotId::Boot,
        };
        if self.mbr.dfu_mode() == DfuMode::UpgradeUp
            && image.version_word <= self.mbr.slot(target).fw_header.version_word
        {
            info!(
                "partition: refusing downgrade of {:?} to 0x{:08x}",
                target, image.version_word
            );
            return Err(PartitionError::VersionTooOld);
        }
        if self.verify_slot(target) {
            match kind {
                AppKind::Main => self.backup_main()?,
                AppKind::Boot => self.backup_boot()?,
            }
        }
        match kind {
            AppKind::Main => self.upgrade_main()?,
            AppKind::Boot => self.upgrade_boot()?,
        }
        Ok(kind)
    }

    pub fn upgrade_main(&mut self) -> Result<(), PartitionError> {
        self.program_app(SlotId::Main, SlotId::ImageDownload, true, Some(AppKind::Main))
    }

    pub fn upgrade_boot(&mut self) -> Result<(), PartitionError> {
        self.program_app(SlotId::Boot, SlotId::ImageDownload, true, Some(AppKind::Boot))
    }

    pub fn restore_main(&mut self) -> Result<(), PartitionError> {
        self.require_slot_ok(SlotId::MainRollback)?;
        self.program_app(SlotId::Main, SlotId::MainRollback, false, None)
    }

    pub fn restore_boot(&mut self) -> Result<(), PartitionError> {
        self.require_slot_ok(SlotId::BootRollback)?;
        self.program_app(SlotId::Boot, SlotId::BootRollback, false, None)
    }

    /// Copy one external slot to another without transforming the stored
    /// bytes; both slots must share the storage representation.
    pub fn clone_app(&mut self, des_id: SlotId, src_id: SlotId) -> Result<(), PartitionError> {
        let src = *self.mbr.slot(src_id);
        let des = *self.mbr.slot(des_id);
        let src_mem = src
            .fw_header
            .mem_kind()
            .map_err(|_| PartitionError::BadHeader)?;
        let des_mem = des
            .fw_header
            .mem_kind()
            .map_err(|_| PartitionError::BadHeader)?;
        let src_enc = src
            .fw_header
            .enc_kind()
            .map_err(|_| PartitionError::BadHeader)?;
        let des_enc = des
            .fw_header
            .enc_kind()
            .map_err(|_| PartitionError::BadHeader)?;
        if src_mem != MemKind::External || des_mem != MemKind::External || src_enc != des_enc {
            return Err(PartitionError::Direction);
        }
        if !self.verify(&src) {
            return Err(PartitionError::SourceInvalid);
        }
        let stored = Self::stored_len(&src)?;
        if stored > des.max_size {
            return Err(PartitionError::TooLarge);
        }
        self.transfer(
            MemKind::External,
            src.startup_addr,
            MemKind::External,
            des.startup_addr,
            stored,
            CipherStream::plain(),
        )?;

        let mut slot = des;
        slot.fw_header.size = src.fw_header.size;
        slot.fw_header.version_word = src.fw_header.version_word;
        slot.fw_header.checksum = self.checksum(&slot)?;
        slot.set_app_status(AppStatus::Ok);
        self.mbr.set_slot(des_id, slot);
        self.mbr.commit()?;
        info!("partition: cloned {:?} to {:?}", src_id, des_id);
        Ok(())
    }

    /// Rollback restores only run from a slot marked healthy.
    fn require_slot_ok(&self, id: SlotId) -> Result<(), PartitionError> {
        if self.mbr.slot(id).app_status() == Ok(AppStatus::Ok) {
            Ok(())
        } else {
            Err(PartitionError::SourceInvalid)
        }
    }

    pub fn backup_main(&mut self) -> Result<(), PartitionError> {
        self.backup_app(SlotId::MainRollback, SlotId::Main)
    }

    pub fn backup_boot(&mut self) -> Result<(), PartitionError> {
        self.backup_app(SlotId::BootRollback, SlotId::Boot)
    }

    /// Walk the startup-mode fallback chain and pick the image to run.
    ///
    /// Each stage is attempted at most once per call; a stage that fails
    /// hands over to the next. The resulting mode is persisted only when it
    /// differs from the mode the record held on entry.
    pub fn resolve_boot(&mut self) -> Result<BootSelection, PartitionError> {
        let entry = self.mbr.startup_mode();
        let mut mode = entry;
        info!("partition: startup mode {:?}", entry);

        if mode == StartupMode::Upgrade {
            mode = match self.app_upgrade() {
                Ok(kind) => {
                    info!("partition: upgrade of {:?} applied", kind);
                    match kind {
                        AppKind::Main => StartupMode::MainRun,
                        AppKind::Boot => StartupMode::BootRun,
                    }
                }
                Err(e) => {
                    warn!("partition: upgrade not applied: {:?}", e);
                    StartupMode::MainRun
                }
            };
        }
        if mode == StartupMode::MainRun {
            if self.verify_slot(SlotId::Main) {
                return self.finish_boot(entry, StartupMode::MainRun, self.app_address());
            }
            warn!("partition: main image invalid, trying rollback");
            mode = StartupMode::MainRollback;
        }
        if mode == StartupMode::MainRollback {
            match self.restore_main() {
                Ok(()) => {
                    return self.finish_boot(entry, StartupMode::MainRun, self.app_address())
                }
                Err(e) => {
                    warn!("partition: main restore failed: {:?}", e);
                    mode = StartupMode::BootRun;
                }
            }
        }
        if mode == StartupMode::BootRun {
            if self.verify_slot(SlotId::Boot) {
                return self.finish_boot(entry, StartupMode::BootRun, self.boot_address());
            }
            warn!("partition: boot image invalid, trying rollback");
            mode = StartupMode::BootRollback;
        }
        if mode == StartupMode::BootRollback {
            match self.restore_boot() {
                Ok(()) => {
                    return self.finish_boot(entry, StartupMode::BootRun, self.boot_address())
                }
                Err(e) => warn!("partition: boot restore failed: {:?}", e),
            }
        }

        // Address zero tells the caller to halt instead of jumping.
        error!("partition: no bootable image left");
        self.finish_boot(entry, StartupMode::None, 0)
    }

    fn finish_boot(
        &mut self,
        entry: StartupMode,
        mode: StartupMode,
        address: u32,
    ) -> Result<BootSelection, PartitionError> {
        if mode != entry {
            self.mbr.set_startup_mode(mode);
            self.mbr.commit()?;
        }
        info!("partition: booting {:?} at 0x{:x}", mode, address);
        Ok(BootSelection { mode, address })
    }

    fn device(&self, kind: MemKind) -> &'a dyn FlashStorage {
        match kind {
            MemKind::Internal => self.internal,
            MemKind::External => self.external,
        }
    }

    /// Number of bytes the slot occupies on its device: the image rounded up
    /// to whole AES blocks when encrypted, plus the image header prefix when
    /// the slot stores one.
    fn stored_len(info: &AppInfo) -> Result<u32, PartitionError> {
        let enc = info
            .fw_header
            .enc_kind()
            .map_err(|_| PartitionError::BadHeader)?;
        let mut len = info.fw_header.size;
        if enc.is_encrypted() {
            len = round_up(len, AES_BLOCK_LEN as u32);
        }
        if enc.has_header() {
            len += FW_HEADER_LEN;
        }
        Ok(len)
    }

    /// CRC32 over the 12 checksummed header bytes followed by the slot's
    /// stored payload.
    fn checksum(&mut self, info: &AppInfo) -> Result<u32, PartitionError> {
        let mem = info
            .fw_header
            .mem_kind()
            .map_err(|_| PartitionError::BadHeader)?;
        let dev = self.device(mem);
        let mut total = Self::stored_len(info)?;
        if total > info.max_size {
            match mem {
                MemKind::Internal => {
                    warn!(
                        "partition: image length 0x{:x} exceeds slot 0x{:x}",
                        total, info.max_size
                    );
                    return Ok(CHECKSUM_NONE);
                }
                MemKind::External => {
                    warn!(
                        "partition: clamping image length 0x{:x} to slot 0x{:x}",
                        total, info.max_size
                    );
                    total = info.max_size;
                }
            }
        }

        let mut hasher = Hasher::new();
        hasher.update(info.fw_header.checked_prefix());
        let mut offset = 0u32;
        while offset < total {
            let take = min(MAX_ERASE_BLOCK, (total - offset) as usize);
            let chunk = &mut self.scratch[..take];
            dev.read(chunk, (info.startup_addr + offset) as usize)
                .map_err(|_| PartitionError::Read)?;
            hasher.update(chunk);
            offset += take as u32;
        }
        Ok(hasher.finalize())
    }

    fn verify(&mut self, info: &AppInfo) -> bool {
        if info.fw_header.image_type().signal() != FW_SIGNAL_MAGIC {
            debug!("partition: bad signal byte");
            return false;
        }
        match info.fw_header.checksum {
            CHECKSUM_NONE => false,
            CHECKSUM_NO_VERIFY => true,
            expected => match self.checksum(info) {
                Ok(actual) => {
                    if actual != expected {
                        warn!(
                            "partition: checksum mismatch: 0x{:08x} != 0x{:08x}",
                            actual, expected
                        );
                    }
                    actual == expected
                }
                Err(e) => {
                    warn!("partition: checksum failed: {:?}", e);
                    false
                }
            },
        }
    }

    /// The header describing the payload image: the embedded prefix for
    /// header-carrying slots, the slot's own record otherwise.
    fn image_header(&mut self, info: &AppInfo) -> Result<FirmwareHeader, PartitionError> {
        let enc = info
            .fw_header
            .enc_kind()
            .map_err(|_| PartitionError::BadHeader)?;
        if !enc.has_header() {
            return Ok(info.fw_header);
        }
        let mem = info
            .fw_header
            .mem_kind()
            .map_err(|_| PartitionError::BadHeader)?;
        let mut raw = [0u8; FW_HEADER_LEN as usize];
        self.device(mem)
            .read(&mut raw, info.startup_addr as usize)
            .map_err(|_| PartitionError::Read)?;
        let header =
            FirmwareHeader::read_from_bytes(&raw).map_err(|_| PartitionError::BadHeader)?;
        if header.image_type().signal() != FW_SIGNAL_MAGIC {
            return Err(PartitionError::BadHeader);
        }
        Ok(header)
    }

    /// Program an external image into an internal slot, decrypting on the
    /// way when the source is encrypted. On success the destination slot
    /// record is refreshed and committed; on failure the record is left
    /// untouched.
    fn program_app(
        &mut self,
        des_id: SlotId,
        src_id: SlotId,
        gate_version: bool,
        bump: Option<AppKind>,
    ) -> Result<(), PartitionError> {
        let src = *self.mbr.slot(src_id);
        let des = *self.mbr.slot(des_id);
        let src_enc = src
            .fw_header
            .enc_kind()
            .map_err(|_| PartitionError::BadHeader)?;
        let src_mem = src
            .fw_header
            .mem_kind()
            .map_err(|_| PartitionError::BadHeader)?;
        let des_mem = des
            .fw_header
            .mem_kind()
            .map_err(|_| PartitionError::BadHeader)?;
        if src_mem != MemKind::External || des_mem != MemKind::Internal {
            return Err(PartitionError::Direction);
        }
        if !self.verify(&src) {
            return Err(PartitionError::SourceInvalid);
        }

        let image = self.image_header(&src)?;
        if gate_version
            && self.mbr.dfu_mode() == DfuMode::UpgradeUp
            && image.version_word <= des.fw_header.version_word
        {
            info!(
                "partition: refusing downgrade 0x{:08x} -> 0x{:08x}",
                des.fw_header.version_word, image.version_word
            );
            return Err(PartitionError::VersionTooOld);
        }

        let len = image.size;
        if len == 0 {
            return Err(PartitionError::BadHeader);
        }
        let padded = if src_enc.is_encrypted() {
            round_up(len, AES_BLOCK_LEN as u32)
        } else {
            len
        };
        if padded > des.max_size {
            return Err(PartitionError::TooLarge);
        }
        let skip = if src_enc.has_header() { FW_HEADER_LEN } else { 0 };
        let cipher = if src_enc.is_encrypted() {
            CipherStream::decrypt(&self.mbr.aes())
        } else {
            CipherStream::plain()
        };
        self.transfer(
            MemKind::External,
            src.startup_addr + skip,
            MemKind::Internal,
            des.startup_addr,
            padded,
            cipher,
        )?;

        let mut slot = des;
        slot.fw_header.size = len;
        slot.fw_header.version_word = image.version_word;
        slot.fw_header.checksum = self.checksum(&slot)?;
        slot.set_app_status(AppStatus::Ok);
        self.mbr.set_slot(des_id, slot);
        if let Some(kind) = bump {
            self.mbr.increment_dfu_count(kind);
        }
        self.mbr.commit()?;
        info!(
            "partition: programmed {:?} from {:?}, {} bytes",
            des_id, src_id, len
        );
        Ok(())
    }

    /// Copy an internal image out to an external slot, encrypting when the
    /// destination stores ciphertext.
    fn backup_app(&mut self, des_id: SlotId, src_id: SlotId) -> Result<(), PartitionError> {
        let src = *self.mbr.slot(src_id);
        let des = *self.mbr.slot(des_id);
        let src_mem = src
            .fw_header
            .mem_kind()
            .map_err(|_| PartitionError::BadHeader)?;
        let des_mem = des
            .fw_header
            .mem_kind()
            .map_err(|_| PartitionError::BadHeader)?;
        let des_enc = des
            .fw_header
            .enc_kind()
            .map_err(|_| PartitionError::BadHeader)?;
        if src_mem != MemKind::Internal || des_mem != MemKind::External {
            return Err(PartitionError::Direction);
        }
        if !self.verify(&src) {
            return Err(PartitionError::SourceInvalid);
        }

        // Factory images carry no length; fall back to the whole region.
        let mut len = src.fw_header.size;
        if len == 0 {
            info!("partition: unknown image length, backing up whole slot");
            len = src.max_size;
        }
        let padded = if des_enc.is_encrypted() {
            round_up(len, AES_BLOCK_LEN as u32)
        } else {
            len
        };
        if padded > des.max_size {
            return Err(PartitionError::TooLarge);
        }
        let cipher = if des_enc.is_encrypted() {
            CipherStream::encrypt(&self.mbr.aes())
        } else {
            CipherStream::plain()
        };
        self.transfer(
            MemKind::Internal,
            src.startup_addr,
            MemKind::External,
            des.startup_addr,
            padded,
            cipher,
        )?;

        let mut slot = des;
        slot.fw_header.size = len;
        slot.fw_header.version_word = src.fw_header.version_word;
        slot.fw_header.checksum = self.checksum(&slot)?;
        slot.set_app_status(AppStatus::Ok);
        self.mbr.set_slot(des_id, slot);
        self.mbr.commit()?;
        info!(
            "partition: backed up {:?} to {:?}, {} bytes",
            src_id, des_id, len
        );
        Ok(())
    }

    /// Erase the destination range, stream the image through the cipher in
    /// scratch-sized chunks, then read the destination back and compare its
    /// CRC32 against the CRC32 of the bytes that were written.
    fn transfer(
        &mut self,
        src_mem: MemKind,
        src_addr: u32,
        des_mem: MemKind,
        des_addr: u32,
        len: u32,
        mut cipher: CipherStream,
    ) -> Result<(), PartitionError> {
        let src_dev = self.device(src_mem);
        let des_dev = self.device(des_mem);
        let erase_size = des_dev.erase_size() as u32;
        if des_addr % erase_size != 0 {
            return Err(PartitionError::Geometry);
        }
        debug!(
            "partition: transfer 0x{:x} -> 0x{:x}, 0x{:x} bytes",
            src_addr, des_addr, len
        );
        des_dev
            .erase(des_addr as usize, round_up(len, erase_size) as usize)
            .map_err(|_| PartitionError::Erase)?;

        let mut written = Hasher::new();
        let mut offset = 0u32;
        while offset < len {
            let take = min(MAX_ERASE_BLOCK, (len - offset) as usize);
            let chunk = &mut self.scratch[..take];
            src_dev
                .read(chunk, (src_addr + offset) as usize)
                .map_err(|_| PartitionError::Read)?;
            cipher.apply(chunk);
            written.update(chunk);
            des_dev
                .write(chunk, (des_addr + offset) as usize)
                .map_err(|_| PartitionError::Program)?;
            offset += take as u32;
        }

        let expected = written.finalize();
        let mut read_back = Hasher::new();
        offset = 0;
        while offset < len {
            let take = min(MAX_ERASE_BLOCK, (len - offset) as usize);
            let chunk = &mut self.scratch[..take];
            des_dev
                .read(chunk, (des_addr + offset) as usize)
                .map_err(|_| PartitionError::Read)?;
            read_back.update(chunk);
            offset += take as u32;
        }
        if read_back.finalize() != expected {
            warn!("partition: read back mismatch at 0x{:x}", des_addr);
            return Err(PartitionError::WriteVerify);
        }
        Ok(())
    }
}

fn round_up(value: u32, align: u32) -> u32 {
    value.div_ceil(align) * align
}
