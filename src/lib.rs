//! Redundant-slot OTA selection and partition integrity for second-stage bootloaders.
//!
//! The crate decides which of two OTA selector records is authoritative, erases data
//! partitions by label, computes digests over partition contents and detects a held
//! factory-reset button. Everything hardware specific is a collaborator trait:
//! flash access ([`Flash`]), image verification ([`image::ImageVerifier`]),
//! hashing ([`digest::DigestEngine`]) and the reset-hold GPIO ([`hold::HoldPin`]).
#![no_std]

use core::ops::Deref;

use serde::{Deserialize, Serialize};

mod fmt;

pub mod boot;
pub mod digest;
pub mod flash;
pub mod hold;
pub mod image;
pub mod ota;
pub mod partition;

#[cfg(test)]
extern crate std;

#[cfg(test)]
mod mock;

/// Failure taxonomy shared by every operation of the crate.
///
/// Nothing in this crate retries; the caller decides what to do next,
/// typically by falling back to the factory image.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// Zero-length or otherwise unusable input.
    InvalidArgument,
    /// Flash could not be mapped, read or erased.
    Io,
    /// An expected structure or magic word is absent.
    NotFound,
    /// The image verifier rejected the image.
    ImageInvalid,
    /// No digest context could be obtained.
    NoResources,
    /// The partition table failed table-level verification.
    InvalidTable,
    /// Secure boot rejected the partition table signature.
    SignatureInvalid,
}

/// Byte range in flash.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FlashRegion {
    pub offset: u32,
    pub size: u32,
}

impl FlashRegion {
    pub const fn new(offset: u32, size: u32) -> Self {
        Self { offset, size }
    }

    /// Exclusive end of the region, or `None` if it would not fit the address space.
    pub const fn end(&self) -> Option<u32> {
        self.offset.checked_add(self.size)
    }
}

/// Flash as seen by the bootloader: mapped read windows and erasure.
///
/// A window borrows the flash mutably, hence at most one window exists at any time
/// and no erase can happen while it is held. Dropping the window unmaps it.
#[allow(async_fn_in_trait)]
pub trait Flash {
    type Window<'a>: Deref<Target = [u8]>
    where
        Self: 'a;

    /// Largest number of bytes a single window can cover.
    fn max_window(&self) -> usize;

    /// Map `len` bytes starting at `offset` for reading.
    async fn map(&mut self, offset: u32, len: u32) -> Result<Self::Window<'_>, Error>;

    /// Erase the region, leaving all bytes `0xFF`.
    ///
    /// Only valid on erase block boundaries. If power is lost the region is left in an
    /// indeterminate state which readers must treat as invalid.
    async fn erase(&mut self, region: FlashRegion) -> Result<(), Error>;
}
