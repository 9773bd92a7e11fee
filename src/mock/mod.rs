pub mod hold;
pub mod image;

use core::{cell::Cell, ops::Deref};
use std::vec::Vec;

use embedded_storage_async::nor_flash::{
    ErrorType, NorFlash, NorFlashError, NorFlashErrorKind, ReadNorFlash,
};

use crate::{Error, Flash, FlashRegion};

pub const SECTOR: usize = 0x1000;

#[derive(Debug)]
pub struct MockNorError(NorFlashErrorKind);

impl NorFlashError for MockNorError {
    fn kind(&self) -> NorFlashErrorKind {
        self.0
    }
}

/// RAM backed NOR flash with 4 byte reads and 4K sectors.
pub struct MockNor {
    pub data: Vec<u8>,
    pub erases: Vec<FlashRegion>,
    /// Erases starting at this offset fail.
    pub fail_erase_at: Option<u32>,
}

impl MockNor {
    pub fn new(size: usize) -> Self {
        Self {
            data: std::vec![0xff; size],
            erases: Vec::new(),
            fail_erase_at: None,
        }
    }

    pub fn program(&mut self, offset: u32, bytes: &[u8]) {
        let offset = offset as usize;
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    pub fn is_erased(&self, region: FlashRegion) -> bool {
        let start = region.offset as usize;
        self.data[start..start + region.size as usize]
            .iter()
            .all(|b| *b == 0xff)
    }
}

impl ErrorType for MockNor {
    type Error = MockNorError;
}

impl ReadNorFlash for MockNor {
    const READ_SIZE: usize = 4;

    async fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        let offset = offset as usize;
        if offset % Self::READ_SIZE != 0 || bytes.len() % Self::READ_SIZE != 0 {
            return Err(MockNorError(NorFlashErrorKind::NotAligned));
        }
        let source = self
            .data
            .get(offset..offset + bytes.len())
            .ok_or(MockNorError(NorFlashErrorKind::OutOfBounds))?;
        bytes.copy_from_slice(source);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.data.len()
    }
}

impl NorFlash for MockNor {
    const WRITE_SIZE: usize = 4;
    const ERASE_SIZE: usize = SECTOR;

    async fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        if self.fail_erase_at == Some(from) {
            return Err(MockNorError(NorFlashErrorKind::Other));
        }
        if to as usize > self.data.len() || from > to {
            return Err(MockNorError(NorFlashErrorKind::OutOfBounds));
        }
        self.data[from as usize..to as usize].fill(0xff);
        self.erases.push(FlashRegion::new(from, to - from));
        Ok(())
    }

    async fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        self.program(offset, bytes);
        Ok(())
    }
}

/// Wraps a [`Flash`] and keeps count of mapped and still open windows.
pub struct Tracked<F> {
    inner: F,
    maps: usize,
    open: Cell<usize>,
}

impl<F: Flash> Tracked<F> {
    pub fn new(inner: F) -> Self {
        Self {
            inner,
            maps: 0,
            open: Cell::new(0),
        }
    }

    pub fn maps(&self) -> usize {
        self.maps
    }

    pub fn open(&self) -> usize {
        self.open.get()
    }

    pub fn inner(&mut self) -> &mut F {
        &mut self.inner
    }
}

pub struct TrackedWindow<'a, F: Flash + 'a> {
    window: F::Window<'a>,
    open: &'a Cell<usize>,
}

impl<'a, F: Flash + 'a> Deref for TrackedWindow<'a, F> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.window
    }
}

impl<'a, F: Flash + 'a> Drop for TrackedWindow<'a, F> {
    fn drop(&mut self) {
        self.open.set(self.open.get() - 1);
    }
}

impl<F: Flash> Flash for Tracked<F> {
    type Window<'a>
        = TrackedWindow<'a, F>
    where
        Self: 'a;

    fn max_window(&self) -> usize {
        self.inner.max_window()
    }

    async fn map(&mut self, offset: u32, len: u32) -> Result<TrackedWindow<'_, F>, Error> {
        let window = self.inner.map(offset, len).await?;
        self.maps += 1;
        self.open.set(self.open.get() + 1);
        Ok(TrackedWindow {
            window,
            open: &self.open,
        })
    }

    async fn erase(&mut self, region: FlashRegion) -> Result<(), Error> {
        assert_eq!(self.open.get(), 0, "erase while a window is mapped");
        self.inner.erase(region).await
    }
}

/// Raw partition table entry, see [`crate::partition::PartitionEntry`].
pub fn table_entry(ty: u8, subtype: u8, offset: u32, size: u32, label: &str) -> [u8; 32] {
    let mut entry = [0u8; 32];
    entry[0..2].copy_from_slice(&[0xaa, 0x50]);
    entry[2] = ty;
    entry[3] = subtype;
    entry[4..8].copy_from_slice(&offset.to_le_bytes());
    entry[8..12].copy_from_slice(&size.to_le_bytes());
    entry[12..12 + label.len()].copy_from_slice(label.as_bytes());
    entry
}

/// Program a partition table at `offset`, terminated by erased flash.
pub fn program_table(nor: &mut MockNor, offset: u32, entries: &[[u8; 32]]) {
    for (i, entry) in entries.iter().enumerate() {
        nor.program(offset + (i * 32) as u32, entry);
    }
}
