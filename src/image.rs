//! Application images: the verifier collaborator and the embedded application descriptor.

use heapless::String;

use crate::{Error, Flash, FlashRegion, digest::Digest, partition::bounded_str};

/// Image header preceding the first segment.
pub const IMAGE_HEADER_LEN: u32 = 24;
/// Header of each segment.
pub const SEGMENT_HEADER_LEN: u32 = 8;
/// The descriptor is the start of the first segment.
pub const APP_DESC_OFFSET: u32 = IMAGE_HEADER_LEN + SEGMENT_HEADER_LEN;
pub const APP_DESC_LEN: usize = 256;
pub const APP_DESC_MAGIC: u32 = 0xabcd_5432;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum VerifyMode {
    /// Verify and log the outcome.
    Verify,
    /// Verify without logging.
    VerifySilent,
    /// Verify and load the segments into RAM.
    Load,
}

/// What the verifier learned about a valid image.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ImageMetadata {
    /// Bytes occupied by the image, which may be less than the partition.
    pub image_len: u32,
    /// Digest over `image_len` bytes, if the image format appends one.
    pub digest: Option<Digest>,
}

/// Parses and checks the image container in a partition.
#[allow(async_fn_in_trait)]
pub trait ImageVerifier {
    async fn verify(&mut self, part: FlashRegion, mode: VerifyMode)
    -> Result<ImageMetadata, Error>;
}

/// Application descriptor embedded at the start of the first segment of an image.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct AppDescriptor {
    pub secure_version: u32,
    pub version: String<32>,
    pub project_name: String<32>,
    pub time: String<16>,
    pub date: String<16>,
    pub idf_ver: String<32>,
    pub app_elf_sha256: [u8; 32],
}

impl AppDescriptor {
    /// Parse a descriptor, `None` if the magic word does not match.
    pub fn from_bytes(bytes: &[u8; APP_DESC_LEN]) -> Option<Self> {
        let word = |at: usize| {
            u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
        };

        if word(0) != APP_DESC_MAGIC {
            return None;
        }

        let mut app_elf_sha256 = [0u8; 32];
        app_elf_sha256.copy_from_slice(&bytes[144..176]);

        Some(Self {
            secure_version: word(4),
            version: bounded_str(&bytes[16..48]),
            project_name: bounded_str(&bytes[48..80]),
            time: bounded_str(&bytes[80..96]),
            date: bounded_str(&bytes[96..112]),
            idf_ver: bounded_str(&bytes[112..144]),
            app_elf_sha256,
        })
    }
}

/// Read the application descriptor of the image at `offset`.
pub async fn read_app_descriptor<F: Flash>(
    flash: &mut F,
    offset: u32,
) -> Result<AppDescriptor, Error> {
    let start = offset.checked_add(APP_DESC_OFFSET).ok_or(Error::InvalidArgument)?;
    let window = flash.map(start, APP_DESC_LEN as u32).await?;
    let bytes = <&[u8; APP_DESC_LEN]>::try_from(&window[..]).map_err(|_| Error::Io)?;

    AppDescriptor::from_bytes(bytes).ok_or(Error::NotFound)
}
