// Licensed under the Apache-2.0 license

//! Wear-leveling log store.
//!
//! Turns one erasable flash region into a durable, crash-recoverable slot for
//! a single fixed-size record. Every write appends a CRC-protected
//! header+payload entry after the previous one instead of rewriting in place;
//! recovery scans the chain from the region start and adopts the last entry
//! that validates in full. When the region fills up the chain wraps back to
//! the start after erasing its first page.

#![cfg_attr(not(test), no_std)]

mod entry;
mod store;

pub use entry::{
    entry_crc32, EntryInfo, LogEntryHeader, ENTRY_ADDR_END, ENTRY_TYPE_MAGIC, ERASED_CRC,
    HEADER_LEN, MAX_RECORD_LEN,
};
pub use store::LogStore;

/// Reasons a log store operation can fail. Header/data validation errors are
/// recoverable by reformatting (`begin(format_on_fail = true)`); geometry
/// errors are configuration bugs and fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStoreError {
    /// Region start/size not compatible with the erase-page size.
    Geometry,
    /// Header CRC field holds the erased marker or failed validation.
    HeaderCrc,
    /// Header type tag is not the expected magic.
    HeaderType,
    /// Header data length is zero or exceeds the record maximum.
    HeaderLength,
    /// Header next-address points outside the region.
    HeaderBounds,
    /// Payload bytes do not match the entry CRC.
    DataCrc,
    /// Payload length is zero or exceeds the record maximum.
    DataLength,
    /// Caller buffer is smaller than the stored record.
    BufferTooSmall,
    /// Underlying flash read failed.
    Read,
    /// Underlying flash program failed.
    Write,
    /// Underlying flash erase failed.
    Erase,
}
