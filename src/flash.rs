//! [`Flash`] on top of any `embedded-storage-async` NOR flash.
//!
//! NOR flash behind SPI or QSPI can usually not be memory mapped by the bootloader,
//! so a window is read into a fixed buffer instead. The buffer size bounds the window size,
//! and reads are widened to the `READ_SIZE` alignment of the underlying device.

use embedded_storage_async::nor_flash::{NorFlash, NorFlashError, NorFlashErrorKind};

use crate::{Error, Flash, FlashRegion, error};

pub struct BufferedFlash<F, const N: usize> {
    flash: F,
    buffer: [u8; N],
}

impl<F: NorFlash, const N: usize> BufferedFlash<F, N> {
    pub const fn new(flash: F) -> Self {
        Self {
            flash,
            buffer: [0xff; N],
        }
    }

    pub fn inner(&mut self) -> &mut F {
        &mut self.flash
    }

    pub fn into_inner(self) -> F {
        self.flash
    }
}

fn erase_error<E: NorFlashError>(e: E) -> Error {
    match e.kind() {
        NorFlashErrorKind::NotAligned | NorFlashErrorKind::OutOfBounds => Error::InvalidArgument,
        _ => Error::Io,
    }
}

impl<F: NorFlash, const N: usize> Flash for BufferedFlash<F, N> {
    type Window<'a>
        = &'a [u8]
    where
        Self: 'a;

    fn max_window(&self) -> usize {
        // Worst case both ends get widened by almost a full read unit.
        N.saturating_sub(2 * (F::READ_SIZE - 1))
    }

    async fn map(&mut self, offset: u32, len: u32) -> Result<&[u8], Error> {
        let read_size = F::READ_SIZE as u32;

        let Some(end) = offset.checked_add(len) else {
            error!("map({:#x}, {:#x}) wraps the address space", offset, len);
            return Err(Error::Io);
        };
        if end as usize > self.flash.capacity() {
            error!("map({:#x}, {:#x}) exceeds flash capacity", offset, len);
            return Err(Error::Io);
        }

        let start = offset - offset % read_size;
        let aligned_end = end.div_ceil(read_size) * read_size;
        let aligned_len = (aligned_end - start) as usize;
        if aligned_len > N {
            error!("map({:#x}, {:#x}) exceeds window of {} bytes", offset, len, N);
            return Err(Error::Io);
        }

        self.flash
            .read(start, &mut self.buffer[..aligned_len])
            .await
            .map_err(|_| Error::Io)?;

        let skip = (offset - start) as usize;
        Ok(&self.buffer[skip..skip + len as usize])
    }

    async fn erase(&mut self, region: FlashRegion) -> Result<(), Error> {
        let end = region.end().ok_or(Error::InvalidArgument)?;
        let erase_size = F::ERASE_SIZE as u32;

        if region.offset % erase_size != 0 || end % erase_size != 0 {
            return Err(Error::InvalidArgument);
        }

        self.flash.erase(region.offset, end).await.map_err(erase_error)
    }
}
