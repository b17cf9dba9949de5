// Licensed under the Apache-2.0 license

use crate::{FlashDrvError, FlashStorage};

/// A bounded window into a contiguous region of an underlying flash device.
///
/// A `FlashPartition` adds a fixed base offset to every access and rejects
/// any access that would exceed the partition's declared length, so the code
/// above it can work entirely in region-relative addresses. Each partition is
/// associated with a name for identification in logs.
///
/// The partition itself implements [`FlashStorage`], reporting the underlying
/// device's granularities and its own length as the capacity, which lets the
/// log store and the transfer engine treat "a device" and "a slice of a
/// device" uniformly.
pub struct FlashPartition<'a> {
    driver: &'a dyn FlashStorage,
    name: &'static str,
    base_offset: usize,
    length: usize,
}

impl<'a> FlashPartition<'a> {
    /// Creates a new `FlashPartition` over `driver`.
    ///
    /// Returns `Err(FlashDrvError::SIZE)` if the window does not fit within
    /// the device capacity.
    pub fn new(
        driver: &'a dyn FlashStorage,
        name: &'static str,
        base_offset: usize,
        length: usize,
    ) -> Result<Self, FlashDrvError> {
        let capacity = driver.capacity();
        if base_offset + length > capacity {
            return Err(FlashDrvError::SIZE);
        }
        Ok(FlashPartition {
            driver,
            name,
            base_offset,
            length,
        })
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl FlashStorage for FlashPartition<'_> {
    fn read(&self, buffer: &mut [u8], address: usize) -> Result<(), FlashDrvError> {
        if address + buffer.len() > self.length {
            return Err(FlashDrvError::SIZE);
        }
        self.driver.read(buffer, self.base_offset + address)
    }

    fn write(&self, buffer: &[u8], address: usize) -> Result<(), FlashDrvError> {
        if address + buffer.len() > self.length {
            return Err(FlashDrvError::SIZE);
        }
        self.driver.write(buffer, self.base_offset + address)
    }

    fn erase(&self, address: usize, length: usize) -> Result<(), FlashDrvError> {
        if address + length > self.length {
            return Err(FlashDrvError::SIZE);
        }
        self.driver.erase(self.base_offset + address, length)
    }

    fn capacity(&self) -> usize {
        self.length
    }

    fn read_size(&self) -> usize {
        self.driver.read_size()
    }

    fn program_size(&self) -> usize {
        self.driver.program_size()
    }

    fn erase_size(&self) -> usize {
        self.driver.erase_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NullFlash;

    #[test]
    fn test_partition_bounds() {
        let dev = NullFlash::new(0x10000, 0x1000);
        let part = FlashPartition::new(&dev, "mbr", 0x2000, 0x2000).unwrap();
        assert_eq!(part.capacity(), 0x2000);
        assert_eq!(part.erase_size(), 0x1000);

        let mut buf = [0u8; 16];
        assert!(part.read(&mut buf, 0x1ff0).is_ok());
        assert_eq!(buf, [0xff; 16]);
        assert_eq!(part.read(&mut buf, 0x1ff1), Err(FlashDrvError::SIZE));
        assert_eq!(part.erase(0x1000, 0x2000), Err(FlashDrvError::SIZE));
    }

    #[test]
    fn test_partition_must_fit_device() {
        let dev = NullFlash::new(0x4000, 0x1000);
        assert!(FlashPartition::new(&dev, "too-big", 0x2000, 0x4000).is_err());
    }
}
