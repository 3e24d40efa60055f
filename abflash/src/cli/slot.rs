// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use anyhow::{Context, Result};
use clap::Parser;

use crate::cli::{
    device::{self, DeviceArgs},
    status, warning,
};

pub fn boot_slot_main(cli: &BootSlotCli) -> Result<()> {
    let mut engine = device::open_engine(&cli.device)?;

    let slot = engine
        .find_bootable_slot()
        .context("Failed to determine bootable slot")?;

    match slot {
        Some(s) => status!("Bootable slot: {s}"),
        None => warning!("No bootable slot"),
    }

    device::report_platform(&cli.device, &engine);

    Ok(())
}

pub fn mark_unbootable_main(cli: &MarkUnbootableCli) -> Result<()> {
    let mut engine = device::open_engine(&cli.device)?;

    let slot = engine
        .mark_unbootable_and_switch()
        .context("Failed to mark current slot unbootable")?;

    match slot {
        Some(s) => status!("Switched to slot {s}"),
        None => warning!("No other bootable slot"),
    }

    device::report_platform(&cli.device, &engine);

    Ok(())
}

pub fn mark_successful_main(cli: &MarkSuccessfulCli) -> Result<()> {
    let mut engine = device::open_engine(&cli.device)?;

    engine
        .mark_boot_successful(cli.slot.as_deref())
        .context("Failed to mark slot successful")?;

    status!(
        "Marked slot {} successful",
        cli.slot
            .as_deref()
            .or(engine.current_slot())
            .unwrap_or("none"),
    );

    Ok(())
}

/// Determine the slot a bootloader would boot.
///
/// Slots that have run out of boot attempts are marked unbootable and the
/// next bootable slot is promoted.
#[derive(Debug, Parser)]
pub struct BootSlotCli {
    #[command(flatten)]
    device: DeviceArgs,
}

/// Mark the current slot unbootable and switch to another slot.
#[derive(Debug, Parser)]
pub struct MarkUnbootableCli {
    #[command(flatten)]
    device: DeviceArgs,
}

/// Record a successful boot.
#[derive(Debug, Parser)]
pub struct MarkSuccessfulCli {
    #[command(flatten)]
    device: DeviceArgs,

    /// Slot suffix. Defaults to the current slot.
    #[arg(value_name = "SLOT")]
    slot: Option<String>,
}
