// Licensed under the Apache-2.0 license

//! Master boot record: the boot/partition configuration record and its
//! persistence through the wear-leveling log store.
//!
//! The record describes five firmware slots (main, main-rollback, boot,
//! boot-rollback, image-download), the AES-128 key material used for
//! encrypted transfers, per-kind upgrade counters, and the boot-mode state
//! the partition manager drives. All field access is in-memory; durability
//! requires an explicit [`MasterBootRecord::commit`].

#![cfg_attr(not(test), no_std)]

mod layout;
mod persist;
mod record;

pub use layout::BootMemoryMap;
pub use persist::MasterBootRecord;
pub use record::{
    Aes128Params, AppInfo, AppKind, AppStatus, DfuMode, EncKind, FirmwareHeader, FwVersion,
    ImageType, MbrRecord, MemKind, SlotId, StartupMode, CHECKSUM_NONE, CHECKSUM_NO_VERIFY,
    FW_SIGNAL_MAGIC, HW_VERSION_LEN,
};

use flash_log::LogStoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MbrError {
    /// The underlying log store refused the operation.
    Store(LogStoreError),
}

impl From<LogStoreError> for MbrError {
    fn from(e: LogStoreError) -> Self {
        MbrError::Store(e)
    }
}
