// Licensed under the Apache-2.0 license

//! Generic interface for flash storage access.

#![cfg_attr(not(test), no_std)]

mod partition;

pub use partition::FlashPartition;

/// Interface for reading, programming and erasing arbitrary lengths of data
/// on flash storage, plus the geometry the storage reports. Drivers for the
/// concrete devices (internal memory-mapped flash, external SPI flash) are
/// expected to implement this trait; the log store and the partition manager
/// only ever talk to it.
///
/// All addresses are relative to whatever region the implementor exposes:
/// a raw driver exposes the whole device, a [`FlashPartition`] exposes a
/// bounded window of one.
pub trait FlashStorage {
    /// Read from the flash storage, filling the provided buffer with data.
    fn read(&self, buffer: &mut [u8], address: usize) -> Result<(), FlashDrvError>;

    /// Program the full contents of the buffer, starting at the specified
    /// address. The target range must have been erased beforehand.
    fn write(&self, buffer: &[u8], address: usize) -> Result<(), FlashDrvError>;

    /// Erase `length` bytes starting at address `address`. Both must be
    /// aligned to [`erase_size`](Self::erase_size).
    fn erase(&self, address: usize, length: usize) -> Result<(), FlashDrvError>;

    /// Returns the size of the flash storage in bytes.
    fn capacity(&self) -> usize;

    /// Smallest readable unit in bytes.
    fn read_size(&self) -> usize;

    /// Smallest programmable unit in bytes.
    fn program_size(&self) -> usize;

    /// Smallest erasable unit in bytes.
    fn erase_size(&self) -> usize;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum FlashDrvError {
    // Reserved value, for when "no error" / "success" should be
    // encoded in the same numeric representation as FlashDrvError
    //
    // Ok(()) = 0,
    /// Generic failure condition
    FAIL = 1,
    /// Underlying system is busy; retry
    BUSY = 2,
    /// An invalid parameter was passed
    INVAL = 3,
    /// Parameter passed was too large
    SIZE = 4,
    /// Memory required not available
    NOMEM = 5,
    /// Device is not available
    NODEVICE = 6,
}

impl From<FlashDrvError> for usize {
    fn from(err: FlashDrvError) -> usize {
        err as usize
    }
}

/// A [`FlashStorage`] that accepts every operation and does nothing.
///
/// Stands in wherever a device handle is required but none is wired up yet;
/// reads report erased flash.
pub struct NullFlash {
    capacity: usize,
    erase_size: usize,
}

impl NullFlash {
    pub const fn new(capacity: usize, erase_size: usize) -> Self {
        NullFlash {
            capacity,
            erase_size,
        }
    }
}

impl FlashStorage for NullFlash {
    fn read(&self, buffer: &mut [u8], _address: usize) -> Result<(), FlashDrvError> {
        buffer.fill(0xff);
        Ok(())
    }

    fn write(&self, _buffer: &[u8], _address: usize) -> Result<(), FlashDrvError> {
        Ok(())
    }

    fn erase(&self, _address: usize, _length: usize) -> Result<(), FlashDrvError> {
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn read_size(&self) -> usize {
        1
    }

    fn program_size(&self) -> usize {
        1
    }

    fn erase_size(&self) -> usize {
        self.erase_size
    }
}
