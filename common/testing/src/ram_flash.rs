// Licensed under the Apache-2.0 license

use flash_hil::{FlashDrvError, FlashStorage};
use std::cell::{Cell, RefCell};

/// RAM-backed NOR flash model.
///
/// Behaves like the emulated flash devices the firmware runs against:
/// the array comes up fully erased (0xFF), erase works on whole aligned
/// pages, and programming can only clear bits (`dst &= src`). A write into
/// a page that was never erased therefore corrupts the data instead of
/// silently succeeding, which is exactly what the read-back verification
/// paths under test need to observe.
///
/// Interior mutability keeps the [`FlashStorage`] methods `&self`, matching
/// the driver-side trait.
pub struct RamFlash {
    cells: RefCell<Vec<u8>>,
    read_size: usize,
    program_size: usize,
    erase_size: usize,
    fail_program_in: Cell<Option<usize>>,
    fail_erase_in: Cell<Option<usize>>,
}

impl RamFlash {
    pub fn new(capacity: usize, erase_size: usize) -> Self {
        RamFlash {
            cells: RefCell::new(vec![0xff; capacity]),
            read_size: 1,
            program_size: 1,
            erase_size,
            fail_program_in: Cell::new(None),
            fail_erase_in: Cell::new(None),
        }
    }

    /// Arrange for the `n`-th upcoming program call to fail (1 = the next).
    pub fn fail_program_in(&self, n: usize) {
        self.fail_program_in.set(Some(n));
    }

    /// Arrange for the `n`-th upcoming erase call to fail (1 = the next).
    pub fn fail_erase_in(&self, n: usize) {
        self.fail_erase_in.set(Some(n));
    }

    /// Flip the bits selected by `mask` at `address`, bypassing NOR
    /// semantics. Corruption helper for recovery tests.
    pub fn flip_bits(&self, address: usize, mask: u8) {
        self.cells.borrow_mut()[address] ^= mask;
    }

    /// Overwrite raw content at `address`, bypassing NOR semantics.
    /// Test-setup backdoor for preloading images.
    pub fn install(&self, address: usize, data: &[u8]) {
        self.cells.borrow_mut()[address..address + data.len()].copy_from_slice(data);
    }

    /// Raw copy of `len` bytes at `address`.
    pub fn snapshot(&self, address: usize, len: usize) -> Vec<u8> {
        self.cells.borrow()[address..address + len].to_vec()
    }

    fn take_fault(counter: &Cell<Option<usize>>) -> bool {
        match counter.get() {
            Some(n) if n <= 1 => {
                counter.set(None);
                true
            }
            Some(n) => {
                counter.set(Some(n - 1));
                false
            }
            None => false,
        }
    }
}

impl FlashStorage for RamFlash {
    fn read(&self, buffer: &mut [u8], address: usize) -> Result<(), FlashDrvError> {
        let cells = self.cells.borrow();
        if address + buffer.len() > cells.len() {
            return Err(FlashDrvError::SIZE);
        }
        buffer.copy_from_slice(&cells[address..address + buffer.len()]);
        Ok(())
    }

    fn write(&self, buffer: &[u8], address: usize) -> Result<(), FlashDrvError> {
        if Self::take_fault(&self.fail_program_in) {
            return Err(FlashDrvError::FAIL);
        }
        let mut cells = self.cells.borrow_mut();
        if address + buffer.len() > cells.len() {
            return Err(FlashDrvError::SIZE);
        }
        for (dst, src) in cells[address..address + buffer.len()].iter_mut().zip(buffer) {
            *dst &= *src;
        }
        Ok(())
    }

    fn erase(&self, address: usize, length: usize) -> Result<(), FlashDrvError> {
        if Self::take_fault(&self.fail_erase_in) {
            return Err(FlashDrvError::FAIL);
        }
        if address % self.erase_size != 0 || length % self.erase_size != 0 {
            return Err(FlashDrvError::INVAL);
        }
        let mut cells = self.cells.borrow_mut();
        if address + length > cells.len() {
            return Err(FlashDrvError::SIZE);
        }
        cells[address..address + length].fill(0xff);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.cells.borrow().len()
    }

    fn read_size(&self) -> usize {
        self.read_size
    }

    fn program_size(&self) -> usize {
        self.program_size
    }

    fn erase_size(&self) -> usize {
        self.erase_size
    }
}
