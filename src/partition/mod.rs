//! Partition table access.
//!
//! The table is a flat array of 32 byte entries at a fixed flash offset. It is only ever
//! trusted after an optional secure boot signature check and a table level verification,
//! both of which fail closed: an unverified table yields no entries at all.
//!
//! Entries are copied out of the mapped window, so the window is released before anyone
//! acts on the table (for example by erasing partitions).

use heapless::{String, Vec};
use serde::{Deserialize, Serialize};

use crate::{
    Error, Flash, FlashRegion, debug, error, info,
};

pub mod erase;

/// Size of one table entry.
pub const ENTRY_LEN: usize = 32;
/// Size of the fixed width label field.
pub const LABEL_LEN: usize = 16;
/// The table spans at most `0xC00` bytes, of which one entry is reserved for the MD5 record.
pub const MAX_PARTITIONS: usize = 95;

pub const ENTRY_MAGIC: u16 = 0x50aa;
pub const MD5_MAGIC: u16 = 0xebeb;

/// Subtypes as used by the bootloader.
pub mod subtype {
    pub const APP_FACTORY: u8 = 0x00;
    pub const APP_OTA_0: u8 = 0x10;
    pub const APP_OTA_MAX: u8 = 0x1f;
    pub const APP_TEST: u8 = 0x20;

    pub const DATA_OTA: u8 = 0x00;
    pub const DATA_PHY: u8 = 0x01;
    pub const DATA_NVS: u8 = 0x02;
}

/// Partition label, without the padding of the fixed width flash field.
pub type Label = String<LABEL_LEN>;

/// Copy a fixed width label field, which is not NUL terminated when all 16 bytes are used.
///
/// `None` unless every byte up to the terminator is valid UTF-8. Such a label is never
/// shortened, it matches no label at all.
pub fn extract_label(raw: &[u8; LABEL_LEN]) -> Option<Label> {
    let len = raw.iter().position(|b| *b == 0).unwrap_or(LABEL_LEN);
    let text = core::str::from_utf8(&raw[..len]).ok()?;

    let mut label = Label::new();
    label.push_str(text).ok()?;
    Some(label)
}

/// Copy display text out of a fixed width field of at most `N` bytes.
///
/// The copy stops at the first NUL, and before the first byte that is not valid UTF-8.
/// Not for anything that is matched against, see [`extract_label`].
pub(crate) fn bounded_str<const N: usize>(raw: &[u8]) -> String<N> {
    let raw = &raw[..raw.len().min(N)];
    let len = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
    let text = match core::str::from_utf8(&raw[..len]) {
        Ok(text) => text,
        // Cannot fail, the prefix up to `valid_up_to` is valid UTF-8.
        Err(e) => core::str::from_utf8(&raw[..e.valid_up_to()]).unwrap_or_default(),
    };

    let mut copy = String::new();
    // Cannot overflow, `text` is at most `N` bytes.
    let _ = copy.push_str(text);
    copy
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PartitionType {
    App,
    Data,
    Other(u8),
}

impl PartitionType {
    pub const fn from_raw(raw: u8) -> Self {
        match raw {
            0x00 => Self::App,
            0x01 => Self::Data,
            other => Self::Other(other),
        }
    }

    pub const fn raw(self) -> u8 {
        match self {
            Self::App => 0x00,
            Self::Data => 0x01,
            Self::Other(other) => other,
        }
    }
}

/// A partition table entry.
///
/// Layout: `magic: u16` at 0, `type: u8` at 2, `subtype: u8` at 3, `offset: u32` at 4,
/// `size: u32` at 8, `label: [u8; 16]` at 12, `flags: u32` at 28, all little endian.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct PartitionEntry {
    pub ty: PartitionType,
    pub subtype: u8,
    pub region: FlashRegion,
    /// `None` if the stored label is not valid UTF-8.
    pub label: Option<Label>,
    pub flags: u32,
}

impl PartitionEntry {
    pub fn from_bytes(bytes: &[u8; ENTRY_LEN]) -> Self {
        let word = |at: usize| {
            u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
        };

        let mut label = [0u8; LABEL_LEN];
        label.copy_from_slice(&bytes[12..12 + LABEL_LEN]);

        Self {
            ty: PartitionType::from_raw(bytes[2]),
            subtype: bytes[3],
            region: FlashRegion::new(word(4), word(8)),
            label: extract_label(&label),
            flags: word(28),
        }
    }

    pub fn is_ota_app(&self) -> bool {
        self.ty == PartitionType::App
            && (subtype::APP_OTA_0..=subtype::APP_OTA_MAX).contains(&self.subtype)
    }
}

fn entry_magic(entry: &[u8]) -> u16 {
    u16::from_le_bytes([entry[0], entry[1]])
}

/// Table level verification, run on the mapped table before any entry is trusted.
pub trait TableVerifier {
    /// Number of partition entries in `table`.
    fn verify(&self, table: &[u8]) -> Result<usize, Error>;
}

/// Structural verification: every entry carries the entry magic until the MD5 record or
/// erased flash, and no entry reaches past the end of the address space.
///
/// The MD5 digest itself is not checked.
pub struct BasicTableVerifier;

impl TableVerifier for BasicTableVerifier {
    fn verify(&self, table: &[u8]) -> Result<usize, Error> {
        for (i, entry) in table.chunks_exact(ENTRY_LEN).enumerate() {
            match entry_magic(entry) {
                ENTRY_MAGIC => {
                    // Cannot fail, `chunks_exact` yields `ENTRY_LEN` bytes.
                    let Ok(raw) = <&[u8; ENTRY_LEN]>::try_from(entry) else {
                        return Err(Error::InvalidTable);
                    };
                    let partition = PartitionEntry::from_bytes(raw);
                    if partition.region.end().is_none() {
                        error!("partition {} reaches past the address space", i);
                        return Err(Error::InvalidTable);
                    }
                    if i >= MAX_PARTITIONS {
                        error!("partition table holds more than {} entries", MAX_PARTITIONS);
                        return Err(Error::InvalidTable);
                    }
                }
                MD5_MAGIC | 0xffff => return Ok(i),
                magic => {
                    error!("partition {} has bad magic {:#x}", i, magic);
                    return Err(Error::InvalidTable);
                }
            }
        }

        error!("partition table is not terminated");
        Err(Error::InvalidTable)
    }
}

/// Secure boot collaborator verifying the signature appended to the partition table.
#[allow(async_fn_in_trait)]
pub trait SecureBoot {
    fn enabled(&self) -> bool;

    async fn verify_signature(&mut self, region: FlashRegion) -> Result<(), Error>;
}

/// Secure boot is not in use.
pub struct NoSecureBoot;

impl SecureBoot for NoSecureBoot {
    fn enabled(&self) -> bool {
        false
    }

    async fn verify_signature(&mut self, _region: FlashRegion) -> Result<(), Error> {
        Ok(())
    }
}

/// Where the partition table lives.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TableLocation {
    pub offset: u32,
    pub max_len: u32,
}

impl Default for TableLocation {
    fn default() -> Self {
        Self {
            offset: 0x8000,
            max_len: 0xc00,
        }
    }
}

impl TableLocation {
    pub const fn region(&self) -> FlashRegion {
        FlashRegion::new(self.offset, self.max_len)
    }
}

/// Verified copy of the partition table.
#[derive(Clone, Debug)]
pub struct PartitionTable {
    entries: Vec<PartitionEntry, MAX_PARTITIONS>,
}

impl PartitionTable {
    /// Verify, map and copy the partition table.
    ///
    /// Any failure aborts the whole load; no partial table is ever returned.
    pub async fn load<F: Flash>(
        flash: &mut F,
        secure_boot: &mut impl SecureBoot,
        verifier: &impl TableVerifier,
        location: TableLocation,
    ) -> Result<Self, Error> {
        if secure_boot.enabled() {
            info!("Verifying partition table signature...");
            if secure_boot.verify_signature(location.region()).await.is_err() {
                error!("Failed to verify partition table signature.");
                return Err(Error::SignatureInvalid);
            }
            debug!("Partition table signature verified");
        }

        let window = match flash.map(location.offset, location.max_len).await {
            Ok(window) => window,
            Err(e) => {
                error!("map({:#x}, {:#x}) failed", location.offset, location.max_len);
                return Err(e);
            }
        };
        debug!("mapped partition table {:#x}", location.offset);

        let Ok(count) = verifier.verify(&window) else {
            error!("Failed to verify partition table");
            return Err(Error::InvalidTable);
        };

        let mut entries = Vec::new();
        for raw in window.chunks_exact(ENTRY_LEN).take(count) {
            let raw = <&[u8; ENTRY_LEN]>::try_from(raw).map_err(|_| Error::InvalidTable)?;
            entries
                .push(PartitionEntry::from_bytes(raw))
                .map_err(|_| Error::InvalidTable)?;
        }

        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[PartitionEntry] {
        &self.entries
    }

    pub fn find(&self, ty: PartitionType, subtype: u8) -> Option<&PartitionEntry> {
        self.entries
            .iter()
            .find(|entry| entry.ty == ty && entry.subtype == subtype)
    }

    pub fn find_by_label(&self, label: &str) -> Option<&PartitionEntry> {
        self.entries
            .iter()
            .find(|entry| entry.label.as_deref() == Some(label))
    }

    /// Number of OTA application slots, which are expected to be numbered without gaps.
    pub fn ota_app_count(&self) -> usize {
        (subtype::APP_OTA_0..=subtype::APP_OTA_MAX)
            .take_while(|subtype| self.find(PartitionType::App, *subtype).is_some())
            .count()
    }

    /// OTA application slot `index`.
    pub fn ota_app(&self, index: usize) -> Option<&PartitionEntry> {
        let subtype = subtype::APP_OTA_0.checked_add(u8::try_from(index).ok()?)?;
        if subtype > subtype::APP_OTA_MAX {
            return None;
        }
        self.find(PartitionType::App, subtype)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::flash::BufferedFlash;
    use crate::mock::{MockNor, SECTOR, Tracked, program_table, table_entry};

    pub const TABLE: TableLocation = TableLocation {
        offset: 0x8000,
        max_len: 0xc00,
    };

    /// Flash with a typical two slot layout.
    pub fn sample_nor() -> MockNor {
        let mut nor = MockNor::new(0x40000);
        program_table(
            &mut nor,
            TABLE.offset,
            &[
                table_entry(0x01, subtype::DATA_NVS, 0x9000, 0x4000, "nvs"),
                table_entry(0x01, subtype::DATA_OTA, 0xd000, 0x2000, "otadata"),
                table_entry(0x01, subtype::DATA_PHY, 0xf000, 0x1000, "phy_init"),
                table_entry(0x00, subtype::APP_FACTORY, 0x10000, 0x10000, "factory"),
                table_entry(0x00, subtype::APP_OTA_0, 0x20000, 0x10000, "ota_0"),
                table_entry(0x00, subtype::APP_OTA_0 + 1, 0x30000, 0x10000, "ota_1"),
            ],
        );
        nor
    }

    fn load(flash: &mut impl Flash) -> Result<PartitionTable, Error> {
        embassy_futures::block_on(PartitionTable::load(
            flash,
            &mut NoSecureBoot,
            &BasicTableVerifier,
            TABLE,
        ))
    }

    /// Enabled secure boot with a fixed verdict, counting verifications.
    struct ScriptedSecureBoot {
        accept: bool,
        calls: usize,
    }

    impl SecureBoot for ScriptedSecureBoot {
        fn enabled(&self) -> bool {
            true
        }

        async fn verify_signature(&mut self, region: FlashRegion) -> Result<(), Error> {
            assert_eq!(region, TABLE.region());
            self.calls += 1;
            if self.accept {
                Ok(())
            } else {
                Err(Error::SignatureInvalid)
            }
        }
    }

    #[test]
    fn label_extraction() {
        let label = |raw: &[u8; LABEL_LEN]| extract_label(raw);

        assert_eq!(label(b"nvs\0\0\0\0\0\0\0\0\0\0\0\0\0").as_deref(), Some("nvs"));
        // All 16 bytes in use, no terminator.
        assert_eq!(
            label(b"abcdefghijklmnop").as_deref(),
            Some("abcdefghijklmnop")
        );
        assert_eq!(label(&[0u8; LABEL_LEN]).as_deref(), Some(""));

        // Invalid bytes before the terminator reject the whole label.
        let mut raw = *b"ok\xffxx\0\0\0\0\0\0\0\0\0\0\0";
        assert_eq!(label(&raw), None);
        assert_eq!(label(b"nvs\xff\xff\xff\xff\xff\xff\xff\xff\xff\xff\xff\xff\xff"), None);
        // Past the terminator they do not matter.
        raw[2] = 0;
        assert_eq!(label(&raw).as_deref(), Some("ok"));
    }

    #[test]
    fn entry_layout() {
        let entry = PartitionEntry::from_bytes(&table_entry(0x01, 0x02, 0x9000, 0x6000, "nvs"));

        assert_eq!(entry.ty, PartitionType::Data);
        assert_eq!(entry.subtype, subtype::DATA_NVS);
        assert_eq!(entry.region, FlashRegion::new(0x9000, 0x6000));
        assert_eq!(entry.label.as_deref(), Some("nvs"));
        assert_eq!(entry.flags, 0);
    }

    #[test]
    fn load_table() {
        let mut flash = Tracked::new(BufferedFlash::<_, SECTOR>::new(sample_nor()));
        let table = load(&mut flash).unwrap();

        assert_eq!(table.entries().len(), 6);
        assert_eq!(table.find_by_label("otadata").unwrap().region.offset, 0xd000);
        assert_eq!(
            table.find(PartitionType::App, subtype::APP_FACTORY).unwrap().label.as_deref(),
            Some("factory")
        );
        assert_eq!(table.ota_app_count(), 2);
        assert_eq!(table.ota_app(1).unwrap().label.as_deref(), Some("ota_1"));
        assert!(table.ota_app(2).is_none());
        assert!(table.ota_app(300).is_none());
        assert!(table.entries()[4].is_ota_app());
        assert_eq!(flash.open(), 0);
    }

    #[test]
    fn md5_record_terminates() {
        let mut nor = sample_nor();
        let mut md5 = [0u8; ENTRY_LEN];
        md5[0..2].copy_from_slice(&MD5_MAGIC.to_le_bytes());
        nor.program(TABLE.offset + 2 * ENTRY_LEN as u32, &md5);
        let mut flash = BufferedFlash::<_, SECTOR>::new(nor);

        assert_eq!(load(&mut flash).unwrap().entries().len(), 2);
    }

    #[test]
    fn bad_magic_fails_closed() {
        let mut nor = sample_nor();
        nor.program(TABLE.offset + ENTRY_LEN as u32, &[0x12, 0x34]);
        let mut flash = Tracked::new(BufferedFlash::<_, SECTOR>::new(nor));

        assert_eq!(load(&mut flash).unwrap_err(), Error::InvalidTable);
        assert_eq!(flash.open(), 0);
    }

    #[test]
    fn overflowing_entry_fails_closed() {
        let mut nor = MockNor::new(0x10000);
        program_table(
            &mut nor,
            TABLE.offset,
            &[table_entry(0x01, 0x02, 0xffff_f000, 0x2000, "nvs")],
        );
        let mut flash = BufferedFlash::<_, SECTOR>::new(nor);

        assert_eq!(load(&mut flash).unwrap_err(), Error::InvalidTable);
    }

    #[test]
    fn unmappable_table() {
        // Flash smaller than the table location.
        let mut flash = BufferedFlash::<_, SECTOR>::new(MockNor::new(0x8000));

        assert_eq!(load(&mut flash).unwrap_err(), Error::Io);
    }

    #[test]
    fn rejected_signature_maps_nothing() {
        let mut flash = Tracked::new(BufferedFlash::<_, SECTOR>::new(sample_nor()));
        let mut secure_boot = ScriptedSecureBoot {
            accept: false,
            calls: 0,
        };

        let result = embassy_futures::block_on(PartitionTable::load(
            &mut flash,
            &mut secure_boot,
            &BasicTableVerifier,
            TABLE,
        ));

        assert_eq!(result.unwrap_err(), Error::SignatureInvalid);
        assert_eq!(secure_boot.calls, 1);
        assert_eq!(flash.maps(), 0);
    }

    #[test]
    fn accepted_signature_loads_table() {
        let mut flash = Tracked::new(BufferedFlash::<_, SECTOR>::new(sample_nor()));
        let mut secure_boot = ScriptedSecureBoot {
            accept: true,
            calls: 0,
        };

        let table = embassy_futures::block_on(PartitionTable::load(
            &mut flash,
            &mut secure_boot,
            &BasicTableVerifier,
            TABLE,
        ))
        .unwrap();

        assert_eq!(secure_boot.calls, 1);
        assert_eq!(table.entries().len(), 6);
        assert_eq!(table.ota_app_count(), 2);
        assert_eq!(flash.maps(), 1);
        assert_eq!(flash.open(), 0);
    }
}
