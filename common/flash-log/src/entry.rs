// Licensed under the Apache-2.0 license

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Fixed tag every valid entry header carries.
pub const ENTRY_TYPE_MAGIC: u16 = 0xAA55;

/// Largest payload one entry can hold.
pub const MAX_RECORD_LEN: usize = 256;

/// Sentinel next-address marking the end of a chain.
pub const ENTRY_ADDR_END: u32 = 0xFFFF_FFFF;

/// CRC field value of an erased/unwritten header. Never a valid entry CRC.
pub const ERASED_CRC: u32 = 0xFFFF_FFFF;

/// On-flash size of [`LogEntryHeader`].
pub const HEADER_LEN: usize = core::mem::size_of::<LogEntryHeader>();

/// On-flash log entry header, 16 bytes, little-endian, 4-byte aligned.
///
/// The entry CRC covers the 12 header bytes following `crc32` concatenated
/// with the payload. The payload is stored contiguously `HEADER_LEN` bytes
/// after the header address.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct LogEntryHeader {
    pub crc32: u32,
    pub next_addr: u32,
    pub prev_addr: u32,
    pub data_length: u16,
    pub entry_type: u16,
}

/// Where an entry lives: the header flash address plus the decoded header.
/// The header address is not stored on flash; it is where the header was
/// read from or written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryInfo {
    pub addr: u32,
    pub data_addr: u32,
    pub header: LogEntryHeader,
}

impl EntryInfo {
    /// Empty-chain state for a region starting at `start_addr`.
    pub fn empty(start_addr: u32) -> Self {
        EntryInfo {
            addr: start_addr,
            data_addr: start_addr + HEADER_LEN as u32,
            header: LogEntryHeader {
                crc32: ERASED_CRC,
                next_addr: start_addr,
                prev_addr: start_addr,
                data_length: 0,
                entry_type: ENTRY_TYPE_MAGIC,
            },
        }
    }
}

/// CRC32 over the 12 checked header bytes followed by the payload.
pub fn entry_crc32(header: &LogEntryHeader, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&header.as_bytes()[4..]);
    hasher.update(payload);
    hasher.finalize()
}
