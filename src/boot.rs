//! The boot decision, tying the pieces of this crate together.
//!
//! The hold detector runs first, its outcome is passed in here. A long hold with factory
//! reset configured erases the selected data partitions and boots the factory image.
//! Otherwise the otadata records pick the OTA slot, falling back to the factory image when
//! they do not name one unambiguously.

use serde::{Deserialize, Serialize};

use crate::{
    Error, Flash, FlashRegion,
    hold::Hold,
    info,
    ota::{ActiveSlot, active_otadata, ota_app_index, read_otadata},
    partition::{
        PartitionTable, PartitionType, SecureBoot, TableLocation, TableVerifier,
        erase::erase_data_partitions, subtype,
    },
    warn,
};

/// What to wipe when the factory-reset button is held long enough.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct FactoryReset {
    /// Labels of data partitions to erase, separated by `,` or ` `.
    pub erase_list: &'static str,
    /// Also erase the otadata partition, forgetting all OTA updates.
    pub erase_ota_data: bool,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct BootConfig {
    pub table: TableLocation,
    /// Factory reset on a long hold, disabled if `None`.
    pub factory_reset: Option<FactoryReset>,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BootTarget {
    Factory,
    /// OTA application slot, counted from `ota_0`.
    Ota(usize),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BootDecision {
    pub target: BootTarget,
    /// Partition holding the image to load.
    pub partition: FlashRegion,
}

/// Decide which application partition to boot.
///
/// Partition table failures abort. A factory reset whose erases partially fail still boots
/// the factory image.
pub async fn select_boot_partition<F: Flash>(
    flash: &mut F,
    secure_boot: &mut impl SecureBoot,
    verifier: &impl TableVerifier,
    config: &BootConfig,
    hold: Hold,
) -> Result<BootDecision, Error> {
    let table = PartitionTable::load(flash, secure_boot, verifier, config.table).await?;

    let target = match (hold, config.factory_reset) {
        (Hold::LongHold, Some(reset)) => {
            info!("Factory reset: erasing \"{}\"", reset.erase_list);
            let report =
                erase_data_partitions(flash, &table, Some(reset.erase_list), reset.erase_ota_data)
                    .await;
            if !report.succeeded() {
                warn!("Factory reset left partitions unerased");
            }
            BootTarget::Factory
        }
        _ => select_ota(flash, &table).await?,
    };

    resolve(&table, target)
}

async fn select_ota<F: Flash>(flash: &mut F, table: &PartitionTable) -> Result<BootTarget, Error> {
    let Some(otadata) = table.find(PartitionType::Data, subtype::DATA_OTA) else {
        info!("No otadata partition");
        return Ok(BootTarget::Factory);
    };

    let entries = read_otadata(flash, otadata.region).await?;

    match active_otadata(&entries) {
        ActiveSlot::Active(index) => {
            let seq = entries[index].seq;
            match ota_app_index(seq, table.ota_app_count()) {
                Some(slot) => {
                    info!("Active otadata record {}, sequence {}, slot {}", index, seq, slot);
                    Ok(BootTarget::Ota(slot))
                }
                None => {
                    warn!("Sequence {} does not select an OTA slot", seq);
                    Ok(BootTarget::Factory)
                }
            }
        }
        ActiveSlot::None => {
            info!("No valid otadata record");
            Ok(BootTarget::Factory)
        }
        ActiveSlot::Ambiguous => {
            warn!("Both otadata records carry sequence {}", entries[0].seq);
            Ok(BootTarget::Factory)
        }
    }
}

/// Find the partition for `target`; without a factory partition the first OTA slot is used.
fn resolve(table: &PartitionTable, target: BootTarget) -> Result<BootDecision, Error> {
    let found = match target {
        BootTarget::Factory => table
            .find(PartitionType::App, subtype::APP_FACTORY)
            .map(|entry| (target, entry))
            .or_else(|| table.ota_app(0).map(|entry| (BootTarget::Ota(0), entry))),
        BootTarget::Ota(index) => table.ota_app(index).map(|entry| (target, entry)),
    };

    let (target, entry) = found.ok_or(Error::NotFound)?;
    Ok(BootDecision {
        target,
        partition: entry.region,
    })
}
