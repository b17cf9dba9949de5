// Licensed under the Apache-2.0 license

//! Firmware partition management for the boot core.
//!
//! Owns the slot layout described by the master boot record: verifying slot
//! contents, moving images between internal and external flash (upgrade,
//! backup, restore) with AES-128-CBC transform on the way, and resolving
//! which image to run at boot via the persisted startup-mode state machine.

#![cfg_attr(not(test), no_std)]

mod cipher;
mod manager;

pub use manager::{BootSelection, PartitionManager};

use mbr::MbrError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionError {
    /// Source and destination memory kinds do not match the operation.
    Direction,
    /// The source slot failed verification.
    SourceInvalid,
    /// The image header is malformed (bad signal byte or unknown fields).
    BadHeader,
    /// Upgrade policy requires a strictly newer version.
    VersionTooOld,
    /// The image does not fit the destination slot.
    TooLarge,
    /// Destination address or length not compatible with its erase geometry.
    Geometry,
    Erase,
    Program,
    Read,
    /// Data read back from the destination does not match what was written.
    WriteVerify,
    Mbr(MbrError),
}

impl From<MbrError> for PartitionError {
    fn from(err: MbrError) -> Self {
        PartitionError::Mbr(err)
    }
}
