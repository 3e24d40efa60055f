// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{fmt, io};

use bitflags::bitflags;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::{
    config::Config,
    device::{PartitionIo, Storage},
    format::gpt::{self, GptCodec, Guid, Table},
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("No LUNs responded")]
    NoLuns,
    #[error("Too many partitions: limit is {max}")]
    TooManyPartitions { max: usize },
    #[error("Partition not found: {name:?}")]
    NotFound { name: String, lun: Option<u8> },
    #[error("LUN not found: {0}")]
    LunNotFound(u8),
    #[error("Partition index out of range: {index} >= {count}")]
    IndexOutOfRange { index: usize, count: usize },
    #[error("Partition {name:?}: Size of {first_lba}..={last_lba} overflows")]
    SizeOverflow {
        name: String,
        first_lba: u64,
        last_lba: u64,
    },
    #[error("Priority must be at most {max}: {0}", max = PartitionAttributes::MAX_PRIORITY)]
    InvalidPriority(u8),
    #[error("Retry count must be at most {max}: {0}", max = PartitionAttributes::MAX_RETRY_COUNT)]
    InvalidRetryCount(u8),
    #[error("LUN {lun}: GPT error")]
    Gpt {
        lun: u8,
        #[source]
        source: gpt::Error,
    },
    #[error("Failed to access partition: {0}")]
    Io(&'static str, #[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

bitflags! {
    /// The GPT attribute word. Bits 48-55 hold the A/B slot state. The layout
    /// is shared with the Android boot control HAL and must not change. Bits
    /// without a name are preserved.
    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct PartitionAttributes: u64 {
        /// 2-bit slot priority.
        const PRIORITY = 0b11 << 48;
        /// The slot is marked active.
        const ACTIVE = 1 << 50;
        /// 3-bit count of remaining boot attempts.
        const RETRY_COUNT = 0b111 << 51;
        /// The slot has booted successfully at least once.
        const SUCCESSFUL = 1 << 54;
        /// The slot must not be booted.
        const UNBOOTABLE = 1 << 55;

        const _ = !0;
    }
}

impl PartitionAttributes {
    pub const MAX_PRIORITY: u8 = 3;
    pub const MIN_PRIORITY: u8 = 0;
    pub const MAX_RETRY_COUNT: u8 = 7;

    const PRIORITY_SHIFT: u32 = 48;
    const RETRY_COUNT_SHIFT: u32 = 51;

    fn get_field(self, mask: Self, shift: u32) -> u8 {
        ((self.bits() & mask.bits()) >> shift) as u8
    }

    fn set_field(&mut self, mask: Self, shift: u32, value: u8) {
        let bits = (self.bits() & !mask.bits()) | ((u64::from(value) << shift) & mask.bits());
        *self = Self::from_bits_retain(bits);
    }

    pub fn priority(self) -> u8 {
        self.get_field(Self::PRIORITY, Self::PRIORITY_SHIFT)
    }

    pub fn set_priority(&mut self, priority: u8) -> Result<()> {
        if priority > Self::MAX_PRIORITY {
            return Err(Error::InvalidPriority(priority));
        }

        self.set_field(Self::PRIORITY, Self::PRIORITY_SHIFT, priority);
        Ok(())
    }

    pub fn retry_count(self) -> u8 {
        self.get_field(Self::RETRY_COUNT, Self::RETRY_COUNT_SHIFT)
    }

    pub fn set_retry_count(&mut self, count: u8) -> Result<()> {
        if count > Self::MAX_RETRY_COUNT {
            return Err(Error::InvalidRetryCount(count));
        }

        self.set_field(Self::RETRY_COUNT, Self::RETRY_COUNT_SHIFT, count);
        Ok(())
    }

    pub fn is_active(self) -> bool {
        self.contains(Self::ACTIVE)
    }

    pub fn is_successful(self) -> bool {
        self.contains(Self::SUCCESSFUL)
    }

    pub fn is_unbootable(self) -> bool {
        self.contains(Self::UNBOOTABLE)
    }
}

/// A partition as seen by the flashing engine.
#[derive(Clone, PartialEq, Eq)]
pub struct PartitionEntry {
    pub type_guid: Guid,
    pub unique_guid: Guid,
    pub name: String,
    pub first_lba: u64,
    /// Inclusive.
    pub last_lba: u64,
    pub attributes: PartitionAttributes,
    pub lun: u8,
    /// Position in the LUN's partition entry array. [`None`] for the
    /// placeholder that represents a LUN without a partition table.
    pub gpt_index: Option<u32>,
}

impl fmt::Debug for PartitionEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionEntry")
            .field("type_guid", &self.type_guid)
            .field("unique_guid", &self.unique_guid)
            .field("name", &self.name)
            .field("first_lba", &self.first_lba)
            .field("last_lba", &self.last_lba)
            .field("attributes", &format_args!("{:#018x}", self.attributes.bits()))
            .field("lun", &self.lun)
            .field("gpt_index", &self.gpt_index)
            .finish()
    }
}

impl PartitionEntry {
    fn from_gpt(lun: u8, entry: gpt::Entry) -> Self {
        Self {
            type_guid: entry.type_guid,
            unique_guid: entry.unique_guid,
            name: entry.name,
            first_lba: entry.first_lba,
            last_lba: entry.last_lba,
            attributes: PartitionAttributes::from_bits_retain(entry.attributes),
            lun,
            gpt_index: Some(entry.index),
        }
    }

    fn placeholder(lun: u8, block_count: u64) -> Self {
        Self {
            type_guid: Guid::ZERO,
            unique_guid: Guid::ZERO,
            name: String::new(),
            first_lba: 0,
            last_lba: block_count.saturating_sub(1),
            attributes: PartitionAttributes::empty(),
            lun,
            gpt_index: None,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.gpt_index.is_none()
    }

    /// [`None`] if the count does not fit in a [`u64`].
    pub fn num_blocks(&self) -> Option<u64> {
        if self.last_lba < self.first_lba {
            return Some(0);
        }

        (self.last_lba - self.first_lba).checked_add(1)
    }
}

/// A LUN that responded during enumeration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LunInfo {
    pub lun: u8,
    pub block_size: u32,
    pub block_count: u64,
    /// Whether a valid GPT was found.
    pub has_gpt: bool,
}

/// Directory of partitions across all LUNs. Entries for a LUN are contiguous
/// and in the LUN's partition entry array order.
#[derive(Clone, Debug)]
pub struct PartitionTable {
    codec: GptCodec,
    max_entries: usize,
    lun_limit: u8,
    luns: Vec<LunInfo>,
    entries: Vec<PartitionEntry>,
}

impl PartitionTable {
    pub fn new(config: &Config) -> Self {
        Self {
            codec: GptCodec::new(config.max_partition_array_size),
            max_entries: config.max_partitions,
            lun_limit: config.lun_limit(),
            luns: vec![],
            entries: vec![],
        }
    }

    /// Probe every LUN and rebuild the partition list. Fails only if no LUN
    /// responds or if a LUN's partition table is present but invalid.
    pub fn enumerate(&mut self, storage: &mut dyn Storage) -> Result<()> {
        self.luns.clear();

        for lun in 0..self.lun_limit {
            let Some(device) = storage.lun(lun) else {
                trace!("LUN {lun} did not respond");
                continue;
            };

            self.luns.push(LunInfo {
                lun,
                block_size: device.block_size(),
                block_count: device.block_count(),
                has_gpt: false,
            });
        }

        if self.luns.is_empty() {
            return Err(Error::NoLuns);
        }

        debug!("Found {} {} LUNs", self.luns.len(), storage.kind());

        self.update_entries(storage)
    }

    /// Discard all entries and read them back from the partition tables of
    /// the enumerated LUNs.
    pub fn update_entries(&mut self, storage: &mut dyn Storage) -> Result<()> {
        self.entries.clear();

        let mut entries = vec![];

        for info in &mut self.luns {
            let device = storage
                .lun(info.lun)
                .ok_or(Error::LunNotFound(info.lun))?;

            match self.codec.read_primary(device) {
                Ok(table) => {
                    info.has_gpt = true;

                    entries.extend(
                        table
                            .entries()
                            .into_iter()
                            .map(|e| PartitionEntry::from_gpt(info.lun, e)),
                    );
                }
                Err(gpt::Error::InvalidMagic(_)) => {
                    debug!("LUN {} has no partition table", info.lun);
                    info.has_gpt = false;

                    entries.push(PartitionEntry::placeholder(info.lun, info.block_count));
                }
                Err(e) => {
                    return Err(Error::Gpt {
                        lun: info.lun,
                        source: e,
                    });
                }
            }

            if entries.len() > self.max_entries {
                return Err(Error::TooManyPartitions {
                    max: self.max_entries,
                });
            }
        }

        debug!("Enumerated {} partitions", entries.len());
        self.entries = entries;

        Ok(())
    }

    /// Find a partition by exact name on any LUN.
    pub fn find(&self, name: &str) -> Option<usize> {
        self.find_on_lun(name, None)
    }

    /// Find a partition by exact name, optionally restricted to one LUN.
    pub fn find_on_lun(&self, name: &str, lun: Option<u8>) -> Option<usize> {
        self.entries.iter().position(|e| {
            !e.is_placeholder() && e.name == name && lun.is_none_or(|l| l == e.lun)
        })
    }

    /// Get a windowed block device for the named partition.
    pub fn open<'s>(
        &self,
        storage: &'s mut dyn Storage,
        name: &str,
        lun: Option<u8>,
    ) -> Result<(PartitionIo<'s>, usize)> {
        if let Some(l) = lun
            && !self.luns.iter().any(|i| i.lun == l)
        {
            return Err(Error::LunNotFound(l));
        }

        let index = self.find_on_lun(name, lun).ok_or_else(|| Error::NotFound {
            name: name.to_owned(),
            lun,
        })?;
        let entry = &self.entries[index];

        let device = storage
            .lun(entry.lun)
            .ok_or(Error::LunNotFound(entry.lun))?;
        let io = PartitionIo::new(device, entry.first_lba, entry.last_lba)
            .map_err(|e| Error::Io("open", e))?;

        Ok((io, index))
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn partition_count_for_lun(&self, lun: u8) -> usize {
        self.entries.iter().filter(|e| e.lun == lun).count()
    }

    pub fn entries(&self) -> &[PartitionEntry] {
        &self.entries
    }

    pub fn get(&self, index: usize) -> Result<&PartitionEntry> {
        self.entries.get(index).ok_or(Error::IndexOutOfRange {
            index,
            count: self.entries.len(),
        })
    }

    fn get_mut(&mut self, index: usize) -> Result<&mut PartitionEntry> {
        let count = self.entries.len();
        self.entries
            .get_mut(index)
            .ok_or(Error::IndexOutOfRange { index, count })
    }

    pub fn luns(&self) -> &[LunInfo] {
        &self.luns
    }

    pub fn lun_info(&self, lun: u8) -> Option<&LunInfo> {
        self.luns.iter().find(|i| i.lun == lun)
    }

    /// Size of a partition in bytes.
    pub fn partition_size(&self, index: usize) -> Result<u64> {
        let entry = self.get(index)?;
        let info = self
            .lun_info(entry.lun)
            .ok_or(Error::LunNotFound(entry.lun))?;

        entry
            .num_blocks()
            .and_then(|n| n.checked_mul(u64::from(info.block_size)))
            .ok_or_else(|| Error::SizeOverflow {
                name: entry.name.clone(),
                first_lba: entry.first_lba,
                last_lba: entry.last_lba,
            })
    }

    pub fn attributes(&self, index: usize) -> Result<PartitionAttributes> {
        Ok(self.get(index)?.attributes)
    }

    /// Update attributes in memory. Call [`Self::persist_attributes`] to write
    /// them to storage.
    pub fn set_attributes(&mut self, index: usize, attributes: PartitionAttributes) -> Result<()> {
        self.get_mut(index)?.attributes = attributes;
        Ok(())
    }

    pub fn set_type_guid(&mut self, index: usize, guid: Guid) -> Result<()> {
        self.get_mut(index)?.type_guid = guid;
        Ok(())
    }

    /// Exchange the partition type GUIDs of two entries in memory.
    pub fn swap_type_guids(&mut self, a: usize, b: usize) -> Result<()> {
        let guid_a = self.get(a)?.type_guid;
        let guid_b = self.get(b)?.type_guid;

        self.set_type_guid(a, guid_b)?;
        self.set_type_guid(b, guid_a)?;

        Ok(())
    }

    /// Copy the in-memory type GUIDs and attributes of one LUN's entries into
    /// a partition table read from that LUN.
    fn apply_to_table(&self, lun: u8, table: &mut Table) -> Result<()> {
        for entry in self.entries.iter().filter(|e| e.lun == lun) {
            let Some(index) = entry.gpt_index else {
                continue;
            };

            let wrap = |source| Error::Gpt { lun, source };
            table.set_type_guid(index, entry.type_guid).map_err(wrap)?;
            table
                .set_attributes(index, entry.attributes.bits())
                .map_err(wrap)?;
        }

        Ok(())
    }

    /// Write the in-memory type GUIDs and attributes to both the primary and
    /// backup partition tables of every LUN that has one.
    pub fn persist_attributes(&self, storage: &mut dyn Storage) -> Result<()> {
        for info in self.luns.iter().filter(|i| i.has_gpt) {
            let lun = info.lun;
            let wrap = |source| Error::Gpt { lun, source };
            let device = storage.lun(lun).ok_or(Error::LunNotFound(lun))?;

            let mut primary = self.codec.read_primary(device).map_err(wrap)?;
            self.apply_to_table(lun, &mut primary)?;
            primary.write(device).map_err(wrap)?;

            let mut backup = self
                .codec
                .read_backup(device, primary.header())
                .map_err(wrap)?;
            self.apply_to_table(lun, &mut backup)?;
            backup.write(device).map_err(wrap)?;

            trace!("Persisted attributes for LUN {lun}");
        }

        Ok(())
    }

    /// Replace a LUN's partition table with `image` and re-enumerate.
    pub fn write_table(&mut self, storage: &mut dyn Storage, lun: u8, image: &[u8]) -> Result<()> {
        let device = storage.lun(lun).ok_or(Error::LunNotFound(lun))?;

        self.codec
            .write_table(device, image)
            .map_err(|source| Error::Gpt { lun, source })?;

        self.enumerate(storage).inspect_err(|e| {
            warn!("Failed to re-enumerate after writing partition table: {e}");
        })
    }
}
