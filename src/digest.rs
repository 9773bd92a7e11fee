//! Content digests over partitions.
//!
//! For application partitions only the bytes actually occupied by the image are covered,
//! and if the image format already appends a digest that one is returned as is. Data
//! partitions have no such convention, so the whole requested range is hashed.

use crate::{
    Error, Flash, FlashRegion, debug, error,
    image::{ImageVerifier, VerifyMode},
    partition::PartitionType,
};

pub const DIGEST_LEN: usize = 32;

pub type Digest = [u8; DIGEST_LEN];

/// Hashing collaborator, typically a hardware SHA-256 peripheral.
pub trait DigestEngine {
    type Context;

    /// Obtain a fresh context, `None` if none is available.
    fn begin(&mut self) -> Option<Self::Context>;

    fn update(&mut self, context: &mut Self::Context, data: &[u8]);

    fn finish(&mut self, context: Self::Context) -> Digest;
}

/// Software SHA-256.
#[cfg(feature = "sha2")]
pub struct Sha256Engine;

#[cfg(feature = "sha2")]
impl DigestEngine for Sha256Engine {
    type Context = sha2::Sha256;

    fn begin(&mut self) -> Option<sha2::Sha256> {
        use sha2::Digest as _;
        Some(sha2::Sha256::new())
    }

    fn update(&mut self, context: &mut sha2::Sha256, data: &[u8]) {
        use sha2::Digest as _;
        context.update(data);
    }

    fn finish(&mut self, context: sha2::Sha256) -> Digest {
        use sha2::Digest as _;
        context.finalize().into()
    }
}

/// Digest over the logical content of a partition of type `ty` at `region`.
pub async fn partition_digest<F: Flash>(
    flash: &mut F,
    verifier: &mut impl ImageVerifier,
    engine: &mut impl DigestEngine,
    region: FlashRegion,
    ty: PartitionType,
) -> Result<Digest, Error> {
    if region.size == 0 {
        return Err(Error::InvalidArgument);
    }

    let mut size = region.size;
    if ty == PartitionType::App {
        let Ok(image) = verifier.verify(region, VerifyMode::VerifySilent).await else {
            return Err(Error::ImageInvalid);
        };

        if let Some(digest) = image.digest {
            debug!("using appended digest of image at {:#x}", region.offset);
            return Ok(digest);
        }
        if image.image_len == 0 || image.image_len > region.size {
            error!(
                "image length {:#x} does not fit partition of {:#x}",
                image.image_len, region.size
            );
            return Err(Error::ImageInvalid);
        }
        size = image.image_len;
    }

    flash_digest(flash, engine, FlashRegion::new(region.offset, size)).await
}

/// Digest over the raw flash contents of `region`.
///
/// The region is mapped one window at a time, each window is released before the next.
pub async fn flash_digest<F: Flash>(
    flash: &mut F,
    engine: &mut impl DigestEngine,
    region: FlashRegion,
) -> Result<Digest, Error> {
    if region.size == 0 {
        return Err(Error::InvalidArgument);
    }
    let end = region.end().ok_or(Error::InvalidArgument)?;

    let chunk = u32::try_from(flash.max_window()).unwrap_or(u32::MAX);
    if chunk == 0 {
        return Err(Error::Io);
    }

    let mut context = engine.begin().ok_or(Error::NoResources)?;

    let mut offset = region.offset;
    while offset < end {
        let len = chunk.min(end - offset);
        let window = flash.map(offset, len).await?;
        engine.update(&mut context, &window);
        offset += len;
    }

    Ok(engine.finish(context))
}
