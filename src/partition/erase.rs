//! Erasure of data partitions selected by label.
//!
//! Table level problems abort before anything is erased. Once the table is trusted every
//! data partition is visited: a failing erase is recorded and the scan continues, but the
//! report as a whole then counts as failed.

use heapless::Vec;

use crate::{
    Error, Flash, FlashRegion, info,
    partition::{
        Label, MAX_PARTITIONS, PartitionTable, PartitionType, SecureBoot, TableLocation,
        TableVerifier, subtype,
    },
};

/// Whether `label` occurs in `list` as a whole token.
///
/// Tokens are separated by `,` or ` `, so `"nvs"` is found in `"nvs1, nvs2, otadata, nvs"`
/// but not in `"nvs123, otadata"`. An empty label or a missing list never match.
pub fn label_search(list: Option<&str>, label: &str) -> bool {
    let Some(list) = list else {
        return false;
    };
    if label.is_empty() {
        return false;
    }

    let is_delimiter = |c: Option<char>| matches!(c, None | Some(',') | Some(' '));

    let mut from = 0;
    while let Some(found) = list[from..].find(label) {
        let start = from + found;
        let end = start + label.len();

        if is_delimiter(list[..start].chars().next_back())
            && is_delimiter(list[end..].chars().next())
        {
            return true;
        }

        // Retry one character further, occurrences may overlap.
        from = start + list[start..].chars().next().map_or(1, char::len_utf8);
    }

    false
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EraseOutcome {
    Erased,
    NotMatched,
    Failed,
}

impl EraseOutcome {
    /// Marker as printed in the erase report.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Erased => "yes",
            Self::NotMatched => "no",
            Self::Failed => "err",
        }
    }
}

/// One line of the erase report, one per data partition.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct EraseLine {
    /// Position of the partition in the table.
    pub index: usize,
    /// `None` if the stored label is not valid UTF-8.
    pub label: Option<Label>,
    pub region: FlashRegion,
    pub outcome: EraseOutcome,
}

#[derive(Clone, Debug, Default)]
pub struct EraseReport {
    lines: Vec<EraseLine, MAX_PARTITIONS>,
}

impl EraseReport {
    pub fn lines(&self) -> &[EraseLine] {
        &self.lines
    }

    pub fn succeeded(&self) -> bool {
        self.lines
            .iter()
            .all(|line| line.outcome != EraseOutcome::Failed)
    }

    /// `Err(Error::Io)` if any erase failed.
    pub fn result(&self) -> Result<(), Error> {
        if self.succeeded() {
            Ok(())
        } else {
            Err(Error::Io)
        }
    }
}

/// Erase every data partition whose label is in `list_erase`, and also the otadata
/// partition if `erase_ota_data` is set.
///
/// Offsets and sizes come from the verified table only.
pub async fn erase_data_partitions<F: Flash>(
    flash: &mut F,
    table: &PartitionTable,
    list_erase: Option<&str>,
    erase_ota_data: bool,
) -> EraseReport {
    let mut report = EraseReport::default();

    info!("## Label            Usage Offset   Length   Cleaned");
    for (index, partition) in table.entries().iter().enumerate() {
        if partition.ty != PartitionType::Data {
            continue;
        }

        let ota_data = erase_ota_data && partition.subtype == subtype::DATA_OTA;
        let listed = partition
            .label
            .as_deref()
            .is_some_and(|label| label_search(list_erase, label));
        let outcome = if ota_data || listed {
            match flash.erase(partition.region).await {
                Ok(()) => EraseOutcome::Erased,
                Err(_) => EraseOutcome::Failed,
            }
        } else {
            EraseOutcome::NotMatched
        };

        info!(
            "{} {} data {:#x} {:#x} [{}]",
            index,
            partition.label.as_deref().unwrap_or("?"),
            partition.region.offset,
            partition.region.size,
            outcome.as_str()
        );

        // Cannot overflow, the table holds at most `MAX_PARTITIONS` entries.
        let _ = report.lines.push(EraseLine {
            index,
            label: partition.label.clone(),
            region: partition.region,
            outcome,
        });
    }

    report
}

/// Load the partition table and erase the selected data partitions.
///
/// Signature, mapping and verification failures of the table are returned as errors and
/// nothing is erased. If an individual erase fails the remaining partitions are still
/// visited, then `Error::Io` is returned. The logged report shows which ones failed.
pub async fn erase_part_type_data<F: Flash>(
    flash: &mut F,
    secure_boot: &mut impl SecureBoot,
    verifier: &impl TableVerifier,
    location: TableLocation,
    list_erase: Option<&str>,
    erase_ota_data: bool,
) -> Result<EraseReport, Error> {
    let table = PartitionTable::load(flash, secure_boot, verifier, location).await?;
    let report = erase_data_partitions(flash, &table, list_erase, erase_ota_data).await;
    report.result()?;
    Ok(report)
}
