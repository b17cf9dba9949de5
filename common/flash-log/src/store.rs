// Licensed under the Apache-2.0 license

use crate::entry::{
    entry_crc32, EntryInfo, LogEntryHeader, ENTRY_ADDR_END, ENTRY_TYPE_MAGIC, ERASED_CRC,
    HEADER_LEN, MAX_RECORD_LEN,
};
use crate::LogStoreError;
use flash_hil::FlashStorage;
use log::{debug, warn};
use zerocopy::{FromBytes, Immutable, IntoBytes};

/// Append-only record store over one flash region.
///
/// The region must start and end on erase-page boundaries. The store owns the
/// region's bytes exclusively; a single instance per region, single-threaded.
/// A write that fails part-way leaves the previously committed entry current,
/// because the new entry is always built at a not-yet-current location and
/// only adopted after header and payload are fully programmed.
pub struct LogStore<'a> {
    flash: &'a dyn FlashStorage,
    start_addr: u32,
    region_size: u32,
    page_erase_size: u32,
    record_len: u16,
    current: EntryInfo,
}

impl<'a> LogStore<'a> {
    /// `record_len` is the fixed size of the record this store instance
    /// holds; geometry validation requires the region to fit at least one
    /// header plus record.
    pub fn new(
        flash: &'a dyn FlashStorage,
        start_addr: u32,
        region_size: u32,
        page_erase_size: u32,
        record_len: u16,
    ) -> Self {
        LogStore {
            flash,
            start_addr,
            region_size,
            page_erase_size,
            record_len,
            current: EntryInfo::empty(start_addr),
        }
    }

    /// Validate the region geometry and recover the latest valid entry.
    ///
    /// An empty or unreadable chain is a scan failure; with `format_on_fail`
    /// the first page is erased (if needed) and the store resets to the
    /// empty state, otherwise the failure propagates.
    pub fn begin(&mut self, format_on_fail: bool) -> Result<(), LogStoreError> {
        debug!(
            "log-store: begin start=0x{:x} size=0x{:x} page=0x{:x}",
            self.start_addr, self.region_size, self.page_erase_size
        );
        self.verify_geometry()?;

        match self.find_last_header() {
            Ok(()) => Ok(()),
            Err(e) if format_on_fail => {
                debug!("log-store: scan failed ({:?}), formatting", e);
                self.format()?;
                self.current = EntryInfo::empty(self.start_addr);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Append `buf` as the new current record.
    pub fn write(&mut self, buf: &[u8]) -> Result<(), LogStoreError> {
        self.verify_geometry()?;
        if buf.is_empty() || buf.len() > MAX_RECORD_LEN {
            return Err(LogStoreError::DataLength);
        }

        let mut entry = self.place_entry(buf.len() as u16)?;
        entry.header.crc32 = entry_crc32(&entry.header, buf);
        self.submit(entry.addr, entry.header.as_bytes())?;
        self.submit(entry.data_addr, buf)?;

        // Only now does the new entry become the readable state.
        self.current = entry;
        Ok(())
    }

    /// Copy the current record payload into `buf`, returning its length.
    /// Fails if the store holds no record or the stored bytes no longer
    /// match the entry CRC.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, LogStoreError> {
        self.verify_geometry()?;
        let len = self.current.header.data_length as usize;
        if buf.len() < len {
            return Err(LogStoreError::BufferTooSmall);
        }
        self.load_data(&self.current, &mut buf[..len])?;
        Ok(len)
    }

    /// Erase the first page of the region, skipping the erase when sampling
    /// shows the page is already in the fully-erased state.
    pub fn format(&mut self) -> Result<(), LogStoreError> {
        if self.first_page_is_erased() {
            debug!("log-store: format skipped, first page already erased");
            return Ok(());
        }
        debug!("log-store: erasing first page");
        self.flash
            .erase(self.start_addr as usize, self.page_erase_size as usize)
            .map_err(|_| LogStoreError::Erase)
    }

    /// Snapshot of the current entry.
    pub fn info(&self) -> EntryInfo {
        self.current
    }

    /// Append a typed record.
    pub fn write_record<T: IntoBytes + Immutable>(&mut self, record: &T) -> Result<(), LogStoreError> {
        self.write(record.as_bytes())
    }

    /// Read the current record as `T`. Fails with `DataLength` if the stored
    /// record is not exactly `size_of::<T>()` bytes.
    pub fn read_record<T: FromBytes + IntoBytes>(&self) -> Result<T, LogStoreError> {
        let mut record = T::new_zeroed();
        let len = self.read(record.as_mut_bytes())?;
        if len != core::mem::size_of::<T>() {
            return Err(LogStoreError::DataLength);
        }
        Ok(record)
    }

    fn verify_geometry(&self) -> Result<(), LogStoreError> {
        if self.start_addr % self.page_erase_size != 0 {
            warn!("log-store: start address not page-aligned");
            return Err(LogStoreError::Geometry);
        }
        if self.region_size == 0 || self.region_size % self.page_erase_size != 0 {
            warn!("log-store: region size not a page multiple");
            return Err(LogStoreError::Geometry);
        }
        if self.record_len as u32 + HEADER_LEN as u32 > self.region_size {
            warn!("log-store: region too small for one record");
            return Err(LogStoreError::Geometry);
        }
        Ok(())
    }

    /// Scan from the region start and adopt the last entry whose header and
    /// payload both validate. Zero valid entries resets the in-memory state
    /// and reports why the first header was rejected.
    fn find_last_header(&mut self) -> Result<(), LogStoreError> {
        let mut scratch = [0u8; MAX_RECORD_LEN];
        let mut addr = self.start_addr;
        let mut found: u32 = 0;

        let failure = loop {
            let entry = match self.load_entry(addr, &mut scratch) {
                Ok(entry) => entry,
                Err(e) => break e,
            };
            found += 1;
            self.current = entry;

            if entry.header.next_addr == ENTRY_ADDR_END {
                debug!("log-store: chain end sentinel");
                break LogStoreError::HeaderCrc;
            }
            addr = entry.header.next_addr;
        };

        if found > 0 {
            debug!(
                "log-store: recovered entry #{} at 0x{:x} len={}",
                found, self.current.addr, self.current.header.data_length
            );
            Ok(())
        } else {
            debug!("log-store: no valid entry ({:?})", failure);
            self.current = EntryInfo::empty(self.start_addr);
            Err(failure)
        }
    }

    /// Load and fully validate the entry whose header is at `addr`.
    fn load_entry(&self, addr: u32, scratch: &mut [u8]) -> Result<EntryInfo, LogStoreError> {
        let header = self.load_header(addr)?;
        let entry = EntryInfo {
            addr,
            data_addr: addr + HEADER_LEN as u32,
            header,
        };
        self.load_data(&entry, &mut scratch[..header.data_length as usize])?;
        Ok(entry)
    }

    fn load_header(&self, addr: u32) -> Result<LogEntryHeader, LogStoreError> {
        let mut bytes = [0u8; HEADER_LEN];
        self.flash
            .read(&mut bytes, addr as usize)
            .map_err(|_| LogStoreError::Read)?;
        let header = LogEntryHeader::read_from_bytes(&bytes[..]).map_err(|_| LogStoreError::Read)?;
        self.verify_header(&header)?;
        Ok(header)
    }

    fn verify_header(&self, header: &LogEntryHeader) -> Result<(), LogStoreError> {
        if header.crc32 == ERASED_CRC {
            return Err(LogStoreError::HeaderCrc);
        }
        if header.entry_type != ENTRY_TYPE_MAGIC {
            return Err(LogStoreError::HeaderType);
        }
        if header.data_length == 0 || header.data_length as usize > MAX_RECORD_LEN {
            return Err(LogStoreError::HeaderLength);
        }
        if header.next_addr != ENTRY_ADDR_END
            && header.next_addr > self.start_addr + self.region_size
        {
            return Err(LogStoreError::HeaderBounds);
        }
        Ok(())
    }

    /// Read the payload of `entry` into `buf` and check it against the
    /// entry CRC.
    fn load_data(&self, entry: &EntryInfo, buf: &mut [u8]) -> Result<(), LogStoreError> {
        self.verify_header(&entry.header)?;
        if buf.len() != entry.header.data_length as usize {
            return Err(LogStoreError::DataLength);
        }
        self.flash
            .read(buf, entry.data_addr as usize)
            .map_err(|_| LogStoreError::Read)?;
        if entry_crc32(&entry.header, buf) != entry.header.crc32 {
            warn!("log-store: payload CRC mismatch at 0x{:x}", entry.addr);
            return Err(LogStoreError::DataCrc);
        }
        Ok(())
    }

    /// Chain a new entry after the current one, wrapping to the region start
    /// (and erasing its first page) when the entry would not fit.
    fn place_entry(&mut self, data_len: u16) -> Result<EntryInfo, LogStoreError> {
        let prev_addr = self.current.addr;
        let needed = HEADER_LEN as u32 + data_len as u32;
        let mut addr = self.current.header.next_addr;

        // A recovered entry may carry the end-of-chain sentinel instead of a
        // real next address; treat it like a chain that ran out of room.
        if addr == ENTRY_ADDR_END || addr + needed > self.start_addr + self.region_size {
            debug!("log-store: region exhausted, wrapping to 0x{:x}", self.start_addr);
            addr = self.start_addr;
            self.flash
                .erase(self.start_addr as usize, self.page_erase_size as usize)
                .map_err(|_| LogStoreError::Erase)?;
        }

        Ok(EntryInfo {
            addr,
            data_addr: addr + HEADER_LEN as u32,
            header: LogEntryHeader {
                crc32: 0,
                next_addr: addr + needed,
                prev_addr,
                data_length: data_len,
                entry_type: ENTRY_TYPE_MAGIC,
            },
        })
    }

    /// Erase whatever pages `[addr, addr+len)` still needs, then program.
    fn submit(&self, addr: u32, bytes: &[u8]) -> Result<(), LogStoreError> {
        self.erase_span(addr, bytes.len() as u32)?;
        self.flash
            .write(bytes, addr as usize)
            .map_err(|_| LogStoreError::Write)
    }

    /// Erase each page boundary a write of `length` bytes at `addr` crosses.
    ///
    /// The page containing `addr` itself is never erased here: appends always
    /// land in space that is still erased (the wrap path erases the first
    /// page explicitly). A write that ends flush with the region end needs no
    /// erase past the last page.
    fn erase_span(&self, addr: u32, length: u32) -> Result<(), LogStoreError> {
        let region_end = self.start_addr + self.region_size;
        let mut remain = self.page_erase_size - (addr % self.page_erase_size);
        let mut erase_addr = addr + remain;
        let mut length = length;

        while length >= remain {
            if erase_addr == region_end && length == remain {
                // Last page of the region, exactly filled.
                break;
            }
            if erase_addr + self.page_erase_size > region_end {
                warn!("log-store: erase 0x{:x} beyond region end", erase_addr);
                return Err(LogStoreError::Erase);
            }
            self.flash
                .erase(erase_addr as usize, self.page_erase_size as usize)
                .map_err(|_| LogStoreError::Erase)?;
            length -= remain;
            remain = self.page_erase_size;
            erase_addr += self.page_erase_size;
        }
        Ok(())
    }

    /// Sample the first page in bounded chunks; true when every byte reads
    /// back erased. A failed read counts as not-erased so `format` proceeds
    /// to the erase.
    fn first_page_is_erased(&self) -> bool {
        let mut chunk = [0u8; MAX_RECORD_LEN];
        let mut offset = 0u32;
        while offset < self.page_erase_size {
            let n = core::cmp::min(chunk.len() as u32, self.page_erase_size - offset) as usize;
            if self
                .flash
                .read(&mut chunk[..n], (self.start_addr + offset) as usize)
                .is_err()
            {
                return false;
            }
            if chunk[..n].iter().any(|b| *b != 0xff) {
                return false;
            }
            offset += n as u32;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use boot_testing_common::RamFlash;

    const PAGE: u32 = 4096;

    fn store(flash: &RamFlash, region_size: u32) -> LogStore<'_> {
        LogStore::new(flash, 0, region_size, PAGE, 196)
    }

    #[test]
    fn test_begin_on_blank_flash_requires_format() {
        let flash = RamFlash::new(2 * PAGE as usize, PAGE as usize);
        let mut log = store(&flash, 2 * PAGE);
        assert_eq!(log.begin(false), Err(LogStoreError::HeaderCrc));
        assert_eq!(log.begin(true), Ok(()));
        // Blank region: format has nothing to erase, store is empty.
        let mut buf = [0u8; MAX_RECORD_LEN];
        assert_eq!(log.read(&mut buf), Err(LogStoreError::HeaderCrc));
    }

    #[test]
    fn test_write_read_round_trip() {
        let flash = RamFlash::new(2 * PAGE as usize, PAGE as usize);
        let mut log = store(&flash, 2 * PAGE);
        log.begin(true).unwrap();

        let payload = [0x5a; 196];
        log.write(&payload).unwrap();
        let mut buf = [0u8; MAX_RECORD_LEN];
        assert_eq!(log.read(&mut buf), Ok(196));
        assert_eq!(&buf[..196], &payload[..]);
    }

    #[test]
    fn test_recovery_finds_latest_entry() {
        let flash = RamFlash::new(4 * PAGE as usize, PAGE as usize);
        let mut log = store(&flash, 4 * PAGE);
        log.begin(true).unwrap();
        for i in 0..5u8 {
            let payload = [i; 196];
            log.write(&payload).unwrap();
        }

        // Fresh instance over the same bytes lands on the newest record.
        let mut reopened = store(&flash, 4 * PAGE);
        reopened.begin(false).unwrap();
        let mut buf = [0u8; MAX_RECORD_LEN];
        assert_eq!(reopened.read(&mut buf), Ok(196));
        assert_eq!(&buf[..196], &[4u8; 196][..]);
        assert_eq!(reopened.info(), log.info());
    }

    #[test]
    fn test_write_after_end_sentinel_wraps() {
        let flash = RamFlash::new(2 * PAGE as usize, PAGE as usize);

        // A chain head whose next pointer is the end-of-chain sentinel is a
        // valid on-flash entry; recovery adopts it.
        let payload = [0x21u8; 196];
        let mut header = LogEntryHeader {
            crc32: 0,
            next_addr: ENTRY_ADDR_END,
            prev_addr: 0,
            data_length: 196,
            entry_type: ENTRY_TYPE_MAGIC,
        };
        header.crc32 = entry_crc32(&header, &payload);
        flash.install(0, header.as_bytes());
        flash.install(HEADER_LEN, &payload);

        let mut log = store(&flash, 2 * PAGE);
        log.begin(false).unwrap();
        let mut buf = [0u8; MAX_RECORD_LEN];
        assert_eq!(log.read(&mut buf), Ok(196));
        assert_eq!(&buf[..196], &payload[..]);

        // Appending cannot chain past the sentinel; the store wraps to the
        // region start instead of computing an address from it.
        log.write(&[0x42u8; 196]).unwrap();
        assert_eq!(log.read(&mut buf), Ok(196));
        assert_eq!(&buf[..196], &[0x42u8; 196][..]);

        let reopened_payload = buf;
        let mut reopened = store(&flash, 2 * PAGE);
        reopened.begin(false).unwrap();
        assert_eq!(reopened.read(&mut buf), Ok(196));
        assert_eq!(buf, reopened_payload);
    }

    #[test]
    fn test_begin_is_idempotent() {
        let flash = RamFlash::new(2 * PAGE as usize, PAGE as usize);
        let mut log = store(&flash, 2 * PAGE);
        log.begin(true).unwrap();
        log.write(&[7u8; 100]).unwrap();

        log.begin(false).unwrap();
        let first = log.info();
        log.begin(false).unwrap();
        assert_eq!(log.info(), first);
    }

    #[test]
    fn test_wraparound_restarts_chain() {
        let region = 2 * PAGE;
        let flash = RamFlash::new(region as usize, PAGE as usize);
        let mut log = store(&flash, region);
        log.begin(true).unwrap();

        // Entries are 16 + 196 = 212 bytes; 38 fit in 8 KiB.
        let per_entry = (HEADER_LEN + 196) as u32;
        let fit = region / per_entry;
        for i in 0..fit {
            log.write(&[i as u8; 196]).unwrap();
            assert!(log.info().header.next_addr <= region);
        }
        let before_wrap = log.info();
        assert!(before_wrap.addr > 0);

        // The next write no longer fits and must restart at the region start.
        log.write(&[0xee; 196]).unwrap();
        assert_eq!(log.info().addr, 0);
        let mut buf = [0u8; MAX_RECORD_LEN];
        assert_eq!(log.read(&mut buf), Ok(196));
        assert_eq!(&buf[..196], &[0xee; 196][..]);
    }

    #[test]
    fn test_entry_flush_with_region_end() {
        // 16 + 240 = 256 bytes per entry packs 8 KiB exactly.
        let region = 2 * PAGE;
        let flash = RamFlash::new(region as usize, PAGE as usize);
        let mut log = store(&flash, region);
        log.begin(true).unwrap();

        let fit = region / 256;
        for i in 0..fit {
            log.write(&[i as u8; 240]).unwrap();
        }
        // Final entry ends exactly at the region end; no erase past the end
        // was attempted (RamFlash would have rejected it).
        assert_eq!(log.info().header.next_addr, region);

        // And the following write wraps cleanly.
        log.write(&[0xcc; 240]).unwrap();
        assert_eq!(log.info().addr, 0);
    }

    #[test]
    fn test_corrupt_header_crc_detected() {
        let flash = RamFlash::new(2 * PAGE as usize, PAGE as usize);
        let mut log = store(&flash, 2 * PAGE);
        log.begin(true).unwrap();
        log.write(&[3u8; 196]).unwrap();

        flash.flip_bits(0, 0x01); // first entry's CRC field

        let mut reopened = store(&flash, 2 * PAGE);
        assert_eq!(reopened.begin(false), Err(LogStoreError::DataCrc));
        assert_eq!(reopened.begin(true), Ok(()));
        let mut buf = [0u8; MAX_RECORD_LEN];
        assert!(reopened.read(&mut buf).is_err());
    }

    #[test]
    fn test_corrupt_payload_detected() {
        let flash = RamFlash::new(2 * PAGE as usize, PAGE as usize);
        let mut log = store(&flash, 2 * PAGE);
        log.begin(true).unwrap();
        log.write(&[3u8; 196]).unwrap();

        flash.flip_bits(HEADER_LEN + 10, 0x80);

        let mut reopened = store(&flash, 2 * PAGE);
        assert_eq!(reopened.begin(false), Err(LogStoreError::DataCrc));
    }

    #[test]
    fn test_failed_write_keeps_previous_record() {
        let flash = RamFlash::new(4 * PAGE as usize, PAGE as usize);
        let mut log = store(&flash, 4 * PAGE);
        log.begin(true).unwrap();
        log.write(&[1u8; 196]).unwrap();

        flash.fail_program_in(1);
        assert_eq!(log.write(&[2u8; 196]), Err(LogStoreError::Write));

        let mut buf = [0u8; MAX_RECORD_LEN];
        assert_eq!(log.read(&mut buf), Ok(196));
        assert_eq!(&buf[..196], &[1u8; 196][..]);
    }

    #[test]
    fn test_buffer_too_small() {
        let flash = RamFlash::new(2 * PAGE as usize, PAGE as usize);
        let mut log = store(&flash, 2 * PAGE);
        log.begin(true).unwrap();
        log.write(&[9u8; 196]).unwrap();

        let mut buf = [0u8; 100];
        assert_eq!(log.read(&mut buf), Err(LogStoreError::BufferTooSmall));
    }

    #[test]
    fn test_geometry_rejected() {
        let flash = RamFlash::new(4 * PAGE as usize, PAGE as usize);
        // Start address off a page boundary.
        let mut log = LogStore::new(&flash, 0x100, PAGE, PAGE, 196);
        assert_eq!(log.begin(true), Err(LogStoreError::Geometry));
        // Region smaller than one header+record.
        let mut log = LogStore::new(&flash, 0, 0, PAGE, 196);
        assert_eq!(log.begin(true), Err(LogStoreError::Geometry));
    }

    #[test]
    fn test_typed_record_round_trip() {
        use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

        #[repr(C)]
        #[derive(Debug, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout)]
        struct Config {
            a: u32,
            b: u32,
        }

        let flash = RamFlash::new(2 * PAGE as usize, PAGE as usize);
        let mut log = LogStore::new(&flash, 0, 2 * PAGE, PAGE, 8);
        log.begin(true).unwrap();
        log.write_record(&Config { a: 7, b: 11 }).unwrap();
        assert_eq!(log.read_record::<Config>().unwrap(), Config { a: 7, b: 11 });
    }
}
