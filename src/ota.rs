//! OTA selector records and the choice of the authoritative slot.
//!
//! The otadata partition holds two redundant selector records, one per flash sector.
//! When committing an update the application rewrites the sector that does not hold the
//! newest record, so an interrupted write leaves the other one intact. The bootloader only
//! reads them: a record is trusted if its sequence was ever written, its state does not
//! mark the image as rejected and its checksum matches. Of two trusted records the one with
//! the greater sequence wins.
//!
//! The sequence is a free running counter. Wraparound is deliberately not handled:
//! after `0xFFFF_FFFE` updates the comparison is simply wrong.

use crc::{Algorithm, Crc};
use serde::{Deserialize, Serialize};

use crate::{Error, Flash, FlashRegion};

/// Size of one selector record in flash.
pub const SELECT_ENTRY_LEN: usize = 32;

/// Distance between the two records in the otadata partition.
pub const OTADATA_SECTOR: u32 = 0x1000;

/// Sequence value of a record that was never written (erased flash).
pub const SEQ_ERASED: u32 = u32::MAX;

const SEQ_LABEL_LEN: usize = 20;

/// CRC-32 as computed by the ROM `crc32_le` routine when seeded with all ones.
///
/// The seed is inverted on entry, leaving a zero register.
const CRC32_LE_SEEDED: Algorithm<u32> = Algorithm {
    width: 32,
    poly: 0x04c1_1db7,
    init: 0x0000_0000,
    refin: true,
    refout: true,
    xorout: 0xffff_ffff,
    check: 0xd202_d277,
    residue: 0xdebb_20e3,
};

const SELECT_CRC: Crc<u32> = Crc::<u32>::new(&CRC32_LE_SEEDED);

/// Checksum of a selector record, covering only the 4 little-endian sequence bytes.
pub fn select_crc(seq: u32) -> u32 {
    SELECT_CRC.checksum(&seq.to_le_bytes())
}

/// Trial status of the image a selector record points at.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum OtaImgState {
    /// Freshly written, not booted yet.
    New,
    /// Booted once, waiting for the application to confirm it.
    PendingVerify,
    /// Confirmed by the application.
    Valid,
    /// Rejected by the application.
    Invalid,
    /// Rolled back by the bootloader.
    Aborted,
    /// Never set; the normal state when rollback is not used.
    Undefined,
    Unknown(u32),
}

impl OtaImgState {
    pub const fn from_raw(raw: u32) -> Self {
        match raw {
            0x0 => Self::New,
            0x1 => Self::PendingVerify,
            0x2 => Self::Valid,
            0x3 => Self::Invalid,
            0x4 => Self::Aborted,
            0xffff_ffff => Self::Undefined,
            other => Self::Unknown(other),
        }
    }

    pub const fn raw(self) -> u32 {
        match self {
            Self::New => 0x0,
            Self::PendingVerify => 0x1,
            Self::Valid => 0x2,
            Self::Invalid => 0x3,
            Self::Aborted => 0x4,
            Self::Undefined => 0xffff_ffff,
            Self::Unknown(other) => other,
        }
    }

    /// The image was rejected, the record must not select it.
    pub const fn is_rejected(self) -> bool {
        matches!(self, Self::Invalid | Self::Aborted)
    }
}

/// One of the two redundant selector records.
///
/// Layout: `seq: u32` at 0, `seq_label: [u8; 20]` at 4, `state: u32` at 24, `crc: u32` at 28,
/// all little endian.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct OtaSelectEntry {
    pub seq: u32,
    pub seq_label: [u8; SEQ_LABEL_LEN],
    pub state: OtaImgState,
    pub crc: u32,
}

impl OtaSelectEntry {
    /// Record as written by the application when committing sequence `seq`.
    pub fn new(seq: u32, state: OtaImgState) -> Self {
        Self {
            seq,
            seq_label: [0xff; SEQ_LABEL_LEN],
            state,
            crc: select_crc(seq),
        }
    }

    /// Record as read from an erased sector.
    pub const fn erased() -> Self {
        Self {
            seq: SEQ_ERASED,
            seq_label: [0xff; SEQ_LABEL_LEN],
            state: OtaImgState::Undefined,
            crc: 0xffff_ffff,
        }
    }

    pub fn from_bytes(bytes: &[u8; SELECT_ENTRY_LEN]) -> Self {
        let word = |at: usize| {
            u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
        };

        let mut seq_label = [0u8; SEQ_LABEL_LEN];
        seq_label.copy_from_slice(&bytes[4..4 + SEQ_LABEL_LEN]);

        Self {
            seq: word(0),
            seq_label,
            state: OtaImgState::from_raw(word(24)),
            crc: word(28),
        }
    }

    pub fn to_bytes(&self) -> [u8; SELECT_ENTRY_LEN] {
        let mut bytes = [0u8; SELECT_ENTRY_LEN];
        bytes[0..4].copy_from_slice(&self.seq.to_le_bytes());
        bytes[4..24].copy_from_slice(&self.seq_label);
        bytes[24..28].copy_from_slice(&self.state.raw().to_le_bytes());
        bytes[28..32].copy_from_slice(&self.crc.to_le_bytes());
        bytes
    }

    /// Written at some point, checksum intact and not rejected.
    pub fn is_valid(&self) -> bool {
        self.seq != SEQ_ERASED && !self.state.is_rejected() && self.crc == select_crc(self.seq)
    }
}

/// Outcome of comparing both selector records.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ActiveSlot {
    /// Index (0 or 1) of the authoritative record.
    Active(usize),
    /// Neither record is valid.
    None,
    /// Both records are valid and carry the same sequence.
    ///
    /// This cannot be produced by a well behaved application, and no slot is preferred.
    Ambiguous,
}

impl ActiveSlot {
    pub const fn index(self) -> Option<usize> {
        match self {
            Self::Active(index) => Some(index),
            Self::None | Self::Ambiguous => None,
        }
    }
}

/// Decide which of the two records is authoritative.
pub fn active_otadata(entries: &[OtaSelectEntry; 2]) -> ActiveSlot {
    let [a, b] = entries;

    match (a.is_valid(), b.is_valid()) {
        (true, true) if a.seq > b.seq => ActiveSlot::Active(0),
        (true, true) if b.seq > a.seq => ActiveSlot::Active(1),
        (true, true) => ActiveSlot::Ambiguous,
        (true, false) => ActiveSlot::Active(0),
        (false, true) => ActiveSlot::Active(1),
        (false, false) => ActiveSlot::None,
    }
}

/// Read both records from the otadata partition.
///
/// Each record is mapped on its own and the window is released before the next is mapped.
pub async fn read_otadata<F: Flash>(
    flash: &mut F,
    otadata: FlashRegion,
) -> Result<[OtaSelectEntry; 2], Error> {
    if otadata.size < 2 * OTADATA_SECTOR {
        return Err(Error::InvalidArgument);
    }

    let mut entries = [OtaSelectEntry::erased(); 2];
    for (i, entry) in entries.iter_mut().enumerate() {
        let offset = otadata.offset + i as u32 * OTADATA_SECTOR;
        let window = flash.map(offset, SELECT_ENTRY_LEN as u32).await?;
        let bytes = <&[u8; SELECT_ENTRY_LEN]>::try_from(&window[..]).map_err(|_| Error::Io)?;
        *entry = OtaSelectEntry::from_bytes(bytes);
    }

    Ok(entries)
}

/// Index of the OTA application partition selected by sequence `seq`.
///
/// The sequence counts commits starting at 1 and cycles through the OTA slots.
/// Returns `None` without OTA slots or for sequence 0, which no commit produces.
pub const fn ota_app_index(seq: u32, ota_app_count: usize) -> Option<usize> {
    if ota_app_count == 0 || seq == 0 {
        return None;
    }

    Some((seq - 1) as usize % ota_app_count)
}
