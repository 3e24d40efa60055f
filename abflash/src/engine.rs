// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{fmt, io, str::FromStr};

use thiserror::Error;
use tracing::{debug, info};

use crate::{
    config::Config,
    device::{BlockDevice, Platform, Storage},
    flash::{self, ImageKind},
    format::meta::MetaImage,
    partition::{self, PartitionTable},
    slot::{self, BOOT_BASE, SlotInfo, SlotManager},
};

/// Target name that refers to a LUN's partition table instead of a partition.
pub const PARTITION_TABLE_TARGET: &str = "partition";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid partition target: {0:?}")]
    InvalidTarget(String),
    #[error("Slot change is not supported")]
    SlotChangeUnsupported,
    #[error("Failed to erase {name:?}")]
    Erase {
        name: String,
        #[source]
        source: io::Error,
    },
    #[error("Failed to flash meta image entry {name:?}")]
    MetaEntry {
        name: String,
        #[source]
        source: Box<Error>,
    },
    #[error(transparent)]
    Partition(#[from] partition::Error),
    #[error(transparent)]
    Slot(#[from] slot::Error),
    #[error(transparent)]
    Flash(#[from] flash::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// A partition name with an optional LUN, written as `<name>[:<lun>]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionTarget {
    pub name: String,
    pub lun: Option<u8>,
}

impl FromStr for PartitionTarget {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (name, lun) = match s.split_once(':') {
            Some((name, lun)) => {
                let lun = lun
                    .parse::<u8>()
                    .map_err(|_| Error::InvalidTarget(s.to_owned()))?;
                (name, Some(lun))
            }
            None => (s, None),
        };

        if name.is_empty() {
            return Err(Error::InvalidTarget(s.to_owned()));
        }

        Ok(Self {
            name: name.to_owned(),
            lun,
        })
    }
}

impl fmt::Display for PartitionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        if let Some(lun) = self.lun {
            write!(f, ":{lun}")?;
        }
        Ok(())
    }
}

/// Owns the partition table, the slot state, and the collaborators for the
/// lifetime of one fastboot session.
pub struct FlashingEngine<S, P> {
    config: Config,
    storage: S,
    platform: P,
    table: PartitionTable,
    slots: SlotManager,
}

impl<S, P> fmt::Debug for FlashingEngine<S, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlashingEngine")
            .field("config", &self.config)
            .field("table", &self.table)
            .field("slots", &self.slots)
            .finish_non_exhaustive()
    }
}

impl<S: Storage, P: Platform> FlashingEngine<S, P> {
    /// Enumerate the partitions, discover the slots, and settle on an active
    /// slot.
    pub fn new(config: Config, mut storage: S, mut platform: P) -> Result<Self> {
        let mut table = PartitionTable::new(&config);
        table.enumerate(&mut storage)?;

        let mut slots = SlotManager::discover(&table, config.retry_count);
        slots.find_active_slot(&mut table, &mut storage, &mut platform)?;

        Ok(Self {
            config,
            storage,
            platform,
            table,
            slots,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn table(&self) -> &PartitionTable {
        &self.table
    }

    pub fn slots(&self) -> &SlotManager {
        &self.slots
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn into_parts(self) -> (S, P) {
        (self.storage, self.platform)
    }

    /// Apply slot suffix substitution unless a LUN was given explicitly.
    fn resolve(&self, target: &PartitionTarget) -> String {
        if target.lun.is_some() {
            target.name.clone()
        } else {
            self.slots.resolve_partition_name(&target.name)
        }
    }

    /// Flash `data` to `target`. The image may be sparse, a meta image, or
    /// raw. The special target `partition` replaces a LUN's partition table.
    pub fn flash(&mut self, target: &str, data: &[u8]) -> Result<()> {
        let target = target.parse::<PartitionTarget>()?;

        if target.name == PARTITION_TABLE_TARGET {
            return self.update_partition_table(target.lun.unwrap_or(0), data);
        }

        let name = self.resolve(&target);
        let kind = ImageKind::detect(data);
        info!("Flashing {kind:?} image to {name:?}");

        if kind == ImageKind::Meta {
            self.flash_meta(data)?;
        } else {
            let (mut device, _) = self.table.open(&mut self.storage, &name, target.lun)?;
            flash::flash_image(&mut device, data)?;
        }

        if let Some(suffix) = name.strip_prefix(BOOT_BASE)
            && self.slots.suffixes().iter().any(|s| s == suffix)
        {
            self.slots
                .mark_freshly_flashed(&mut self.table, &mut self.storage, suffix)?;
        }

        Ok(())
    }

    /// Write each entry of a meta image verbatim to the partition it names.
    fn flash_meta(&mut self, data: &[u8]) -> Result<()> {
        let meta = MetaImage::parse(data).map_err(flash::Error::from)?;
        debug!(
            "Meta image version {:?} has {} entries",
            meta.version,
            meta.images.len(),
        );

        for image in &meta.images {
            let name = self.slots.resolve_partition_name(&image.name);
            let wrap = |e: Error| Error::MetaEntry {
                name: name.clone(),
                source: Box::new(e),
            };

            let (mut device, _) = self
                .table
                .open(&mut self.storage, &name, None)
                .map_err(|e| wrap(e.into()))?;
            flash::flash_raw(&mut device, image.data).map_err(|e| wrap(e.into()))?;
        }

        Ok(())
    }

    /// Erase every block of `target`.
    pub fn erase(&mut self, target: &str) -> Result<()> {
        let target = target.parse::<PartitionTarget>()?;
        let name = self.resolve(&target);

        let (mut device, _) = self.table.open(&mut self.storage, &name, target.lun)?;
        let count = device.block_count();

        device
            .erase_blocks(0, count)
            .map_err(|source| Error::Erase {
                name: name.clone(),
                source,
            })?;

        info!("Erased {count} blocks of {name:?}");

        Ok(())
    }

    /// Replace a LUN's partition table and rebuild everything derived from
    /// it.
    pub fn update_partition_table(&mut self, lun: u8, image: &[u8]) -> Result<()> {
        info!("Updating partition table of LUN {lun}");

        self.table.write_table(&mut self.storage, lun, image)?;

        self.slots = SlotManager::discover(&self.table, self.config.retry_count);
        self.slots
            .find_active_slot(&mut self.table, &mut self.storage, &mut self.platform)?;

        Ok(())
    }

    pub fn set_active(&mut self, suffix: &str) -> Result<()> {
        if !self.slots.is_multi_slot() {
            return Err(Error::SlotChangeUnsupported);
        }

        self.slots.set_active(
            &mut self.table,
            &mut self.storage,
            &mut self.platform,
            suffix,
        )?;

        Ok(())
    }

    pub fn find_bootable_slot(&mut self) -> Result<Option<String>> {
        Ok(self.slots.find_bootable_slot(
            &mut self.table,
            &mut self.storage,
            &mut self.platform,
        )?)
    }

    pub fn mark_unbootable_and_switch(&mut self) -> Result<Option<String>> {
        Ok(self.slots.mark_unbootable_and_switch(
            &mut self.table,
            &mut self.storage,
            &mut self.platform,
        )?)
    }

    pub fn mark_boot_successful(&mut self, suffix: Option<&str>) -> Result<()> {
        self.slots
            .mark_boot_successful(&mut self.table, &mut self.storage, suffix)?;

        Ok(())
    }

    pub fn current_slot(&self) -> Option<&str> {
        self.slots.current_slot()
    }

    pub fn slot_info(&self, suffix: &str) -> Result<SlotInfo> {
        Ok(self.slots.slot_info(&self.table, suffix)?)
    }

    /// Size in bytes of the partition `target` resolves to.
    pub fn partition_size(&self, target: &str) -> Result<u64> {
        let target = target.parse::<PartitionTarget>()?;
        let name = self.resolve(&target);

        let index = self
            .table
            .find_on_lun(&name, target.lun)
            .ok_or(partition::Error::NotFound {
                name,
                lun: target.lun,
            })?;

        Ok(self.table.partition_size(index)?)
    }
}
