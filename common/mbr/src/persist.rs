// Licensed under the Apache-2.0 license

//! Master boot record persistence on top of the wear-levelled log store.

use crate::layout::BootMemoryMap;
use crate::record::{
    Aes128Params, AppInfo, AppKind, DfuMode, MbrRecord, SlotId, StartupMode, HW_VERSION_LEN,
};
use crate::MbrError;
use flash_hil::FlashStorage;
use flash_log::LogStore;
use log::{info, warn};

/// The in-RAM master boot record plus its backing log store.
///
/// Every mutation goes through the cached [`MbrRecord`]; nothing reaches
/// flash until [`commit`](Self::commit) appends a fresh record. The store
/// spans the whole flash handle it is given, so callers hand in the params
/// region as a [`flash_hil::FlashPartition`].
pub struct MasterBootRecord<'a> {
    store: LogStore<'a>,
    map: BootMemoryMap,
    record: MbrRecord,
}

impl<'a> MasterBootRecord<'a> {
    pub fn new(flash: &'a dyn FlashStorage, map: BootMemoryMap) -> Self {
        let store = LogStore::new(
            flash,
            0,
            flash.capacity() as u32,
            flash.erase_size() as u32,
            core::mem::size_of::<MbrRecord>() as u16,
        );
        MasterBootRecord {
            store,
            map,
            record: map.default_record(),
        }
    }

    /// Open the store and load the latest record. A blank or unreadable
    /// params region is repaired by committing the factory record.
    pub fn begin(&mut self) -> Result<(), MbrError> {
        self.store.begin(true)?;
        match self.store.read_record::<MbrRecord>() {
            Ok(record) => {
                self.record = record;
                Ok(())
            }
            Err(e) => {
                warn!("mbr: no usable record ({:?}), writing defaults", e);
                self.set_default()
            }
        }
    }

    /// Reload the cached record from flash, discarding local edits.
    pub fn load(&mut self) -> Result<(), MbrError> {
        self.record = self.store.read_record()?;
        Ok(())
    }

    /// Append the cached record to the log store.
    pub fn commit(&mut self) -> Result<(), MbrError> {
        self.store.write_record(&self.record)?;
        Ok(())
    }

    /// Replace the cached record with the factory record and commit it.
    pub fn set_default(&mut self) -> Result<(), MbrError> {
        self.record = self.map.default_record();
        self.commit()
    }

    pub fn map(&self) -> &BootMemoryMap {
        &self.map
    }

    pub fn record(&self) -> &MbrRecord {
        &self.record
    }

    pub fn record_mut(&mut self) -> &mut MbrRecord {
        &mut self.record
    }

    pub fn slot(&self, id: SlotId) -> &AppInfo {
        self.record.slot(id)
    }

    pub fn set_slot(&mut self, id: SlotId, info: AppInfo) {
        *self.record.slot_mut(id) = info;
    }

    pub fn aes(&self) -> Aes128Params {
        Aes128Params {
            key: self.record.aes_key,
            iv: self.record.aes_iv,
        }
    }

    pub fn set_aes(&mut self, params: Aes128Params) {
        self.record.aes_key = params.key;
        self.record.aes_iv = params.iv;
    }

    /// Unrecognized stored values fall back to [`StartupMode::None`], which
    /// the boot flow treats as "nothing left to try".
    pub fn startup_mode(&self) -> StartupMode {
        self.record.startup_mode().unwrap_or(StartupMode::None)
    }

    pub fn set_startup_mode(&mut self, mode: StartupMode) {
        self.record.set_startup_mode(mode);
    }

    pub fn dfu_mode(&self) -> DfuMode {
        self.record.dfu_mode().unwrap_or(DfuMode::UpgradeAny)
    }

    pub fn set_dfu_mode(&mut self, mode: DfuMode) {
        self.record.set_dfu_mode(mode);
    }

    /// Number of completed upgrades for the given program kind.
    pub fn dfu_count(&self, kind: AppKind) -> u16 {
        match kind {
            AppKind::Main => self.record.dfu_num_main,
            AppKind::Boot => self.record.dfu_num_boot,
        }
    }

    pub fn increment_dfu_count(&mut self, kind: AppKind) {
        match kind {
            AppKind::Main => self.record.dfu_num_main = self.record.dfu_num_main.wrapping_add(1),
            AppKind::Boot => self.record.dfu_num_boot = self.record.dfu_num_boot.wrapping_add(1),
        }
    }

    /// The hardware version tag, trimmed at the first NUL.
    pub fn hw_version(&self) -> &str {
        let bytes = &self.record.hw_version;
        let end = bytes
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(HW_VERSION_LEN);
        core::str::from_utf8(&bytes[..end]).unwrap_or("")
    }

    /// Replace the hardware version tag, truncating to the field size and
    /// NUL-padding the remainder.
    pub fn set_hw_version(&mut self, tag: &str) {
        let bytes = tag.as_bytes();
        let len = bytes.len().min(HW_VERSION_LEN - 1);
        self.record.hw_version = [0; HW_VERSION_LEN];
        self.record.hw_version[..len].copy_from_slice(&bytes[..len]);
    }

    /// Dump the cached record at info level.
    pub fn log_info(&self) {
        info!(
            "mbr: hw={} mode={:?} dfu={:?} upgrades main={} boot={}",
            self.hw_version(),
            self.startup_mode(),
            self.dfu_mode(),
            self.record.dfu_num_main,
            self.record.dfu_num_boot
        );
        for id in [
            SlotId::Main,
            SlotId::MainRollback,
            SlotId::Boot,
            SlotId::BootRollback,
            SlotId::ImageDownload,
        ] {
            let slot = self.record.slot(id);
            info!(
                "mbr: {:?} addr=0x{:x} max=0x{:x} size=0x{:x} crc=0x{:08x} ver=0x{:08x} status={}",
                id,
                slot.startup_addr,
                slot.max_size,
                slot.fw_header.size,
                slot.fw_header.checksum,
                slot.fw_header.version_word,
                slot.status
            );
        }
    }
}
