// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! A/B slot state machine. There is no stored state besides the attribute
//! words of the `boot<suffix>` partitions. Everything here is derived from
//! those and written back through [`PartitionTable::persist_attributes`].

use std::io;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    device::{Platform, Storage, StorageKind},
    partition::{self, PartitionAttributes, PartitionTable},
};

/// Base name of the partitions whose attributes hold the slot state.
pub const BOOT_BASE: &str = "boot";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unknown slot: {0:?}")]
    UnknownSlot(String),
    #[error("Failed to access boot LUN register")]
    BootLun(#[source] io::Error),
    #[error("Slot index {0} has no boot LUN")]
    BootLunOutOfRange(usize),
    #[error(transparent)]
    Partition(#[from] partition::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Slot state formatted for `getvar`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlotInfo {
    pub suffix: String,
    pub successful: String,
    pub unbootable: String,
    pub retry_count: String,
}

fn yes_no(value: bool) -> String {
    if value { "yes" } else { "no" }.to_owned()
}

/// Accept both `b` and `_b`.
pub fn normalize_suffix(suffix: &str) -> String {
    if suffix.starts_with('_') {
        suffix.to_owned()
    } else {
        format!("_{suffix}")
    }
}

/// UFS boot LUN for the slot at `index` in sorted suffix order.
fn boot_lun_for(index: usize) -> Result<u8> {
    index
        .checked_add(1)
        .and_then(|lun| u8::try_from(lun).ok())
        .ok_or(Error::BootLunOutOfRange(index))
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SlotManager {
    /// Sorted slot suffixes. Empty if there are fewer than two slots.
    suffixes: Vec<String>,
    /// Base names of partitions that exist for every slot, in table order.
    multi_slot_bases: Vec<String>,
    /// Index into `suffixes` of the slot chosen by the last selection.
    current: Option<usize>,
    /// Index into `suffixes` of the slot whose partitions carry the primary
    /// type GUIDs. Inferred from the attributes when unknown.
    primary: Option<usize>,
    /// Retry count for newly activated or reflashed slots.
    retry_count: u8,
}

impl SlotManager {
    /// Find the slot suffixes from the `boot<suffix>` partitions. At least two
    /// are required for A/B support. Otherwise, every slot operation is a
    /// no-op.
    pub fn discover(table: &PartitionTable, retry_count: u8) -> Self {
        let mut suffixes = table
            .entries()
            .iter()
            .filter(|e| !e.is_placeholder())
            .filter_map(|e| e.name.strip_prefix(BOOT_BASE))
            .filter(|s| s.len() > 1 && s.starts_with('_'))
            .map(|s| s.to_owned())
            .collect::<Vec<_>>();
        suffixes.sort();
        suffixes.dedup();

        if suffixes.len() < 2 {
            debug!("Multi-slot boot disabled: found slots {suffixes:?}");

            return Self {
                retry_count,
                ..Default::default()
            };
        }

        let mut multi_slot_bases = Vec::<String>::new();

        for entry in table.entries() {
            let Some(base) = suffixes
                .iter()
                .find_map(|s| entry.name.strip_suffix(s.as_str()))
            else {
                continue;
            };

            if multi_slot_bases.iter().any(|b| b == base) {
                continue;
            }

            if suffixes
                .iter()
                .all(|s| table.find(&format!("{base}{s}")).is_some())
            {
                multi_slot_bases.push(base.to_owned());
            }
        }

        info!("Discovered slots {suffixes:?} with partitions {multi_slot_bases:?}");

        Self {
            suffixes,
            multi_slot_bases,
            current: None,
            primary: None,
            retry_count,
        }
    }

    pub fn is_multi_slot(&self) -> bool {
        !self.suffixes.is_empty()
    }

    pub fn suffixes(&self) -> &[String] {
        &self.suffixes
    }

    pub fn multi_slot_bases(&self) -> &[String] {
        &self.multi_slot_bases
    }

    /// Suffix of the slot chosen by the last selection.
    pub fn current_slot(&self) -> Option<&str> {
        self.current.map(|i| self.suffixes[i].as_str())
    }

    fn slot_index(&self, suffix: &str) -> Result<usize> {
        let suffix = normalize_suffix(suffix);

        self.suffixes
            .iter()
            .position(|s| *s == suffix)
            .ok_or(Error::UnknownSlot(suffix))
    }

    fn boot_index(&self, table: &PartitionTable, slot: usize) -> Result<usize> {
        let name = format!("{BOOT_BASE}{}", self.suffixes[slot]);

        table
            .find(&name)
            .ok_or_else(|| partition::Error::NotFound { name, lun: None }.into())
    }

    fn attributes(&self, table: &PartitionTable, slot: usize) -> Result<PartitionAttributes> {
        let index = self.boot_index(table, slot)?;
        Ok(table.attributes(index)?)
    }

    fn update_attributes(
        &self,
        table: &mut PartitionTable,
        slot: usize,
        f: impl FnOnce(&mut PartitionAttributes) -> std::result::Result<(), partition::Error>,
    ) -> Result<bool> {
        let index = self.boot_index(table, slot)?;
        let old = table.attributes(index)?;
        let mut new = old;
        f(&mut new)?;

        table.set_attributes(index, new)?;

        Ok(old != new)
    }

    /// Activate a slot: maximum priority and, if `fresh`, a full retry budget
    /// with the success and unbootable markers cleared.
    fn activate(&self, table: &mut PartitionTable, slot: usize, fresh: bool) -> Result<bool> {
        let retry_count = self.retry_count;

        self.update_attributes(table, slot, |a| {
            a.set_priority(PartitionAttributes::MAX_PRIORITY)?;
            a.insert(PartitionAttributes::ACTIVE);

            if fresh {
                a.set_retry_count(retry_count)?;
                a.remove(PartitionAttributes::SUCCESSFUL | PartitionAttributes::UNBOOTABLE);
            }

            Ok(())
        })
    }

    /// Demote every slot except `keep`.
    fn demote_others(&self, table: &mut PartitionTable, keep: usize) -> Result<bool> {
        let mut changed = false;

        for slot in (0..self.suffixes.len()).filter(|s| *s != keep) {
            changed |= self.update_attributes(table, slot, |a| {
                a.remove(PartitionAttributes::ACTIVE);
                a.set_priority(PartitionAttributes::MIN_PRIORITY)
            })?;
        }

        Ok(changed)
    }

    fn bootable_slots(&self, table: &PartitionTable) -> Result<Vec<usize>> {
        let mut slots = vec![];

        for slot in 0..self.suffixes.len() {
            if !self.attributes(table, slot)?.is_unbootable() {
                slots.push(slot);
            }
        }

        Ok(slots)
    }

    /// Pick the slot with the highest priority among the active slots that are
    /// not unbootable. Ties go to the first slot in suffix order.
    pub fn select_slot(&self, table: &PartitionTable) -> Result<Option<usize>> {
        self.highest_active(table, false)
    }

    fn highest_active(
        &self,
        table: &PartitionTable,
        include_unbootable: bool,
    ) -> Result<Option<usize>> {
        let mut selected: Option<(usize, u8)> = None;

        for slot in 0..self.suffixes.len() {
            let attrs = self.attributes(table, slot)?;

            if !attrs.is_active() || (attrs.is_unbootable() && !include_unbootable) {
                continue;
            }

            if selected.is_none_or(|(_, p)| attrs.priority() > p) {
                selected = Some((slot, attrs.priority()));
            }
        }

        Ok(selected.map(|(slot, _)| slot))
    }

    /// The current slot, or the one [`Self::select_slot`] picks.
    fn current_or_selected(&self, table: &PartitionTable) -> Result<Option<usize>> {
        match self.current {
            Some(slot) => Ok(Some(slot)),
            None => self.select_slot(table),
        }
    }

    /// Record the slot whose partitions carry the primary type GUIDs if it
    /// is not known yet. Without a record of the last switch, this is the
    /// highest priority active slot, even if it is unbootable, or else the
    /// first slot. Must run before any attributes are changed.
    fn pin_primary(&mut self, table: &PartitionTable) -> Result<usize> {
        let slot = match self.primary {
            Some(slot) => slot,
            None => self.highest_active(table, true)?.unwrap_or(0),
        };

        self.primary = Some(slot);

        Ok(slot)
    }

    /// Move the primary type GUIDs to `to` if they are elsewhere. Returns
    /// whether the table changed.
    fn move_primary(
        &mut self,
        table: &mut PartitionTable,
        storage: &dyn Storage,
        platform: &mut dyn Platform,
        to: usize,
    ) -> Result<bool> {
        let from = self.pin_primary(table)?;
        let switched = from != to;

        if switched {
            self.switch_slots(table, storage, platform, from, to)?;
        }

        self.primary = Some(to);

        Ok(switched)
    }

    /// Point the UFS boot LUN register at a slot's boot LUN.
    fn sync_boot_lun(
        &self,
        storage: &dyn Storage,
        platform: &mut dyn Platform,
        slot: usize,
    ) -> Result<()> {
        if storage.kind() != StorageKind::Ufs {
            return Ok(());
        }

        let target = boot_lun_for(slot)?;

        match platform.boot_lun().map_err(Error::BootLun)? {
            Some(lun) if lun != target => {
                info!("Switching boot LUN from {lun} to {target}");
                platform.set_boot_lun(target).map_err(Error::BootLun)?;
            }
            _ => {}
        }

        Ok(())
    }

    /// Exchange the type GUIDs of every multi-slot partition between two
    /// slots and point the boot LUN at the new slot. This only updates memory.
    /// The caller must persist the table.
    fn switch_slots(
        &self,
        table: &mut PartitionTable,
        storage: &dyn Storage,
        platform: &mut dyn Platform,
        from: usize,
        to: usize,
    ) -> Result<()> {
        info!(
            "Switching slots from {} to {}",
            self.suffixes[from], self.suffixes[to],
        );

        for base in &self.multi_slot_bases {
            let a = table.find(&format!("{base}{}", self.suffixes[from]));
            let b = table.find(&format!("{base}{}", self.suffixes[to]));

            if let (Some(a), Some(b)) = (a, b) {
                table.swap_type_guids(a, b)?;
            }
        }

        self.sync_boot_lun(storage, platform, to)
    }

    /// Determine the active slot. If exactly one slot is bootable, it is
    /// forced active. If no slot is active, the first slot is activated with
    /// a fresh retry budget.
    pub fn find_active_slot(
        &mut self,
        table: &mut PartitionTable,
        storage: &mut dyn Storage,
        platform: &mut dyn Platform,
    ) -> Result<Option<String>> {
        if !self.is_multi_slot() {
            return Ok(None);
        }

        self.pin_primary(table)?;

        let bootable = self.bootable_slots(table)?;
        let mut changed = false;

        let selected = if let &[slot] = bootable.as_slice() {
            changed |= self.activate(table, slot, false)?;
            changed |= self.demote_others(table, slot)?;

            if changed {
                info!("Forcing lone bootable slot {} active", self.suffixes[slot]);
            }

            Some(slot)
        } else {
            self.select_slot(table)?
        };

        let slot = match selected {
            Some(s) => s,
            None => {
                info!("No active slot, defaulting to {}", self.suffixes[0]);

                changed |= self.activate(table, 0, true)?;
                changed |= self.demote_others(table, 0)?;

                0
            }
        };

        changed |= self.move_primary(table, storage, platform, slot)?;
        self.current = Some(slot);

        if changed {
            self.sync_boot_lun(storage, platform, slot)?;
            table.persist_attributes(storage)?;
        }

        debug!("Active slot: {}", self.suffixes[slot]);

        Ok(Some(self.suffixes[slot].clone()))
    }

    /// Determine the slot to boot. A slot that has run out of retries without
    /// a successful boot is marked unbootable and the next bootable slot is
    /// promoted. Returns [`None`] if multi-slot boot is disabled, if the UFS
    /// boot LUN disagrees with the active slot, or if every slot is
    /// exhausted.
    pub fn find_bootable_slot(
        &mut self,
        table: &mut PartitionTable,
        storage: &mut dyn Storage,
        platform: &mut dyn Platform,
    ) -> Result<Option<String>> {
        if !self.is_multi_slot() {
            return Ok(None);
        }

        for _ in 0..self.suffixes.len() {
            let Some(suffix) = self.find_active_slot(table, storage, platform)? else {
                return Ok(None);
            };
            let slot = self.slot_index(&suffix)?;

            if storage.kind() == StorageKind::Ufs
                && let Some(lun) = platform.boot_lun().map_err(Error::BootLun)?
                && lun != boot_lun_for(slot)?
            {
                warn!("Boot LUN {lun} does not match active slot {suffix}");
                return Ok(None);
            }

            let attrs = self.attributes(table, slot)?;

            if attrs.is_successful() {
                debug!("Slot {suffix} has booted successfully before");
                return Ok(Some(suffix));
            } else if attrs.retry_count() > 0 {
                debug!("Slot {suffix} has {} retries left", attrs.retry_count());
                return Ok(Some(suffix));
            }

            let bootable = self.bootable_slots(table)?;
            let Some(&next) = bootable.iter().find(|s| **s != slot) else {
                // The last bootable slot is always booted.
                return Ok(Some(suffix));
            };

            warn!("Slot {suffix} has no retries left, marking unbootable");

            self.update_attributes(table, slot, |a| {
                a.insert(PartitionAttributes::UNBOOTABLE);
                a.remove(PartitionAttributes::ACTIVE);
                a.set_priority(PartitionAttributes::MIN_PRIORITY)
            })?;
            self.activate(table, next, false)?;
            self.move_primary(table, storage, platform, next)?;
            table.persist_attributes(storage)?;

            self.current = Some(next);
        }

        warn!("No bootable slot remains");

        Ok(None)
    }

    /// Make a slot the active one. The target gets the maximum priority and a
    /// fresh retry budget. All other slots are demoted. If the active slot
    /// changes, the multi-slot partitions' type GUIDs are swapped.
    pub fn set_active(
        &mut self,
        table: &mut PartitionTable,
        storage: &mut dyn Storage,
        platform: &mut dyn Platform,
        suffix: &str,
    ) -> Result<()> {
        if !self.is_multi_slot() {
            debug!("Ignoring slot change on single-slot device");
            return Ok(());
        }

        let target = self.slot_index(suffix)?;
        self.pin_primary(table)?;

        self.activate(table, target, true)?;
        self.demote_others(table, target)?;

        if !self.move_primary(table, storage, platform, target)? {
            self.sync_boot_lun(storage, platform, target)?;
        }

        self.current = Some(target);
        table.persist_attributes(storage)?;

        info!("Active slot set to {}", self.suffixes[target]);

        Ok(())
    }

    /// Failure path for a bad boot: mark the current slot unbootable, promote
    /// another bootable slot, persist, and request a cold reset. Returns the
    /// promoted slot, if any.
    pub fn mark_unbootable_and_switch(
        &mut self,
        table: &mut PartitionTable,
        storage: &mut dyn Storage,
        platform: &mut dyn Platform,
    ) -> Result<Option<String>> {
        if !self.is_multi_slot() {
            return Ok(None);
        }

        let current = match self.current_or_selected(table)? {
            Some(s) => s,
            None => {
                let suffix = self.find_active_slot(table, storage, platform)?;
                self.slot_index(suffix.as_deref().unwrap_or_default())?
            }
        };

        warn!("Marking slot {} unbootable", self.suffixes[current]);

        self.pin_primary(table)?;

        self.update_attributes(table, current, |a| {
            a.insert(PartitionAttributes::UNBOOTABLE);
            a.remove(PartitionAttributes::ACTIVE);
            a.set_priority(PartitionAttributes::MIN_PRIORITY)
        })?;

        let count = self.suffixes.len();
        let bootable = self.bootable_slots(table)?;
        let next = (1..count)
            .map(|n| (current + n) % count)
            .find(|s| bootable.contains(s));

        if let Some(next) = next {
            self.activate(table, next, false)?;
            self.move_primary(table, storage, platform, next)?;
            self.current = Some(next);
        } else {
            warn!("No other bootable slot");
            self.current = None;
        }

        table.persist_attributes(storage)?;
        platform.cold_reset();

        Ok(next.map(|s| self.suffixes[s].clone()))
    }

    /// Give a slot whose boot image was just flashed a fresh retry budget.
    pub fn mark_freshly_flashed(
        &mut self,
        table: &mut PartitionTable,
        storage: &mut dyn Storage,
        suffix: &str,
    ) -> Result<()> {
        if !self.is_multi_slot() {
            return Ok(());
        }

        let slot = self.slot_index(suffix)?;
        let retry_count = self.retry_count;

        let changed = self.update_attributes(table, slot, |a| {
            a.remove(PartitionAttributes::SUCCESSFUL | PartitionAttributes::UNBOOTABLE);
            a.set_retry_count(retry_count)
        })?;

        if changed {
            debug!("Reset boot attempt state of slot {}", self.suffixes[slot]);
            table.persist_attributes(storage)?;
        }

        Ok(())
    }

    /// Record that a slot booted successfully. Defaults to the current slot.
    pub fn mark_boot_successful(
        &mut self,
        table: &mut PartitionTable,
        storage: &mut dyn Storage,
        suffix: Option<&str>,
    ) -> Result<()> {
        if !self.is_multi_slot() {
            return Ok(());
        }

        let slot = match suffix {
            Some(s) => self.slot_index(s)?,
            None => self
                .current_or_selected(table)?
                .ok_or_else(|| Error::UnknownSlot(String::new()))?,
        };

        let changed = self.update_attributes(table, slot, |a| {
            a.insert(PartitionAttributes::SUCCESSFUL);
            a.remove(PartitionAttributes::UNBOOTABLE);
            Ok(())
        })?;

        if changed {
            info!("Slot {} marked successful", self.suffixes[slot]);
            table.persist_attributes(storage)?;
        }

        Ok(())
    }

    /// Append the current slot's suffix to the name of a multi-slot partition.
    /// Names that already carry a slot suffix and names of single-slot
    /// partitions are returned unchanged.
    pub fn resolve_partition_name(&self, name: &str) -> String {
        let Some(current) = self.current_slot() else {
            return name.to_owned();
        };

        if self.suffixes.iter().any(|s| name.ends_with(s.as_str()))
            || !self.multi_slot_bases.iter().any(|b| b == name)
        {
            return name.to_owned();
        }

        format!("{name}{current}")
    }

    /// Whether a partition with the given base name exists for every slot.
    pub fn has_slot(&self, base: &str) -> bool {
        self.multi_slot_bases.iter().any(|b| b == base)
    }

    pub fn slot_info(&self, table: &PartitionTable, suffix: &str) -> Result<SlotInfo> {
        let slot = self.slot_index(suffix)?;
        let attrs = self.attributes(table, slot)?;

        Ok(SlotInfo {
            suffix: self.suffixes[slot].clone(),
            successful: yes_no(attrs.is_successful()),
            unbootable: yes_no(attrs.is_unbootable()),
            retry_count: attrs.retry_count().to_string(),
        })
    }
}
