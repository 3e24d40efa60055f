// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use anyhow::Result;
use clap::Parser;

use crate::{
    cli::device::{self, DeviceArgs},
    util::NumBytes,
};

pub fn partitions_main(cli: &PartitionsCli) -> Result<()> {
    let engine = device::open_engine(&cli.device)?;
    let table = engine.table();

    println!("{} partitions on {} LUNs", table.count(), table.luns().len());

    for info in table.luns() {
        if info.has_gpt {
            println!(
                "LUN {}: {} x {} byte blocks, {} partitions",
                info.lun,
                info.block_count,
                info.block_size,
                table.partition_count_for_lun(info.lun),
            );
        } else {
            println!(
                "LUN {}: {} x {} byte blocks, no partition table",
                info.lun, info.block_count, info.block_size,
            );
        }

        for (index, entry) in table.entries().iter().enumerate() {
            if entry.lun != info.lun || entry.is_placeholder() {
                continue;
            }

            let size = table.partition_size(index)?;

            println!(
                "  {:<36} {:>10}..={:<10} {:?}",
                entry.name,
                entry.first_lba,
                entry.last_lba,
                NumBytes(size),
            );

            if cli.verbose {
                println!("    type:       {}", entry.type_guid);
                println!("    unique:     {}", entry.unique_guid);
                println!("    attributes: {:#018x}", entry.attributes.bits());
            }
        }
    }

    let slots = engine.slots();

    if slots.is_multi_slot() {
        println!("Slots: {}", slots.suffixes().join(", "));
        println!("Current slot: {}", engine.current_slot().unwrap_or("none"));

        for suffix in slots.suffixes() {
            let info = engine.slot_info(suffix)?;

            println!(
                "  {}: successful={} unbootable={} retry-count={}",
                info.suffix, info.successful, info.unbootable, info.retry_count,
            );
        }
    } else {
        println!("Slots: none");
    }

    device::report_platform(&cli.device, &engine);

    Ok(())
}

/// List partitions and slot state.
///
/// If the table had no active slot, the first slot is activated before it is
/// listed, just like a bootloader would do when starting up.
#[derive(Debug, Parser)]
pub struct PartitionsCli {
    #[command(flatten)]
    device: DeviceArgs,

    /// Show GUIDs and raw attribute words.
    #[arg(short, long)]
    verbose: bool,
}
