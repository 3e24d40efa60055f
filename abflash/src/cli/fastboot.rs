// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{fs, path::PathBuf};

use anyhow::{Context, Result, bail};
use clap::Parser;

use crate::{
    cli::{
        device::{self, DeviceArgs},
        status,
    },
    fastboot::{Reply, Session},
};

/// Run one fastboot command against the disk images and report the reply.
fn run(args: &DeviceArgs, data: Option<Vec<u8>>, command: &str) -> Result<Reply> {
    let engine = device::open_engine(args)?;
    let mut session = Session::new(engine);

    if let Some(data) = data {
        session.download(data);
    }

    let reply = session.handle(command);
    device::report_platform(args, session.engine());

    if let Reply::Fail(message) = &reply {
        bail!("{command}: {message}");
    }

    Ok(reply)
}

pub fn flash_main(cli: &FlashCli) -> Result<()> {
    let data = fs::read(&cli.image)
        .with_context(|| format!("Failed to read image: {:?}", cli.image))?;

    run(&cli.device, Some(data), &format!("flash:{}", cli.partition))?;
    status!("Flashed {:?} to {}", cli.image, cli.partition);

    Ok(())
}

pub fn erase_main(cli: &EraseCli) -> Result<()> {
    run(&cli.device, None, &format!("erase:{}", cli.partition))?;
    status!("Erased {}", cli.partition);

    Ok(())
}

pub fn set_active_main(cli: &SetActiveCli) -> Result<()> {
    run(&cli.device, None, &format!("set_active:{}", cli.slot))?;
    status!("Active slot set to {}", cli.slot);

    Ok(())
}

pub fn getvar_main(cli: &GetvarCli) -> Result<()> {
    let reply = run(&cli.device, None, &format!("getvar:{}", cli.name))?;
    println!("{}: {}", cli.name, reply.message());

    Ok(())
}

/// Flash an image to a partition.
///
/// The image may be a sparse image, a meta image, or a raw image. For a
/// multi-slot partition without an explicit slot suffix, the current slot is
/// used. Use the partition name `partition` to replace a LUN's partition
/// table.
#[derive(Debug, Parser)]
pub struct FlashCli {
    #[command(flatten)]
    device: DeviceArgs,

    /// Partition name with an optional LUN (`<name>[:<lun>]`).
    #[arg(value_name = "PARTITION")]
    partition: String,

    /// Path to image to flash.
    #[arg(value_name = "FILE", value_parser)]
    image: PathBuf,
}

/// Erase a partition.
#[derive(Debug, Parser)]
pub struct EraseCli {
    #[command(flatten)]
    device: DeviceArgs,

    /// Partition name with an optional LUN (`<name>[:<lun>]`).
    #[arg(value_name = "PARTITION")]
    partition: String,
}

/// Make a slot the active slot.
#[derive(Debug, Parser)]
pub struct SetActiveCli {
    #[command(flatten)]
    device: DeviceArgs,

    /// Slot suffix, with or without the leading underscore.
    #[arg(value_name = "SLOT")]
    slot: String,
}

/// Query a fastboot variable.
#[derive(Debug, Parser)]
pub struct GetvarCli {
    #[command(flatten)]
    device: DeviceArgs,

    /// Variable name (eg. `current-slot` or `slot-retry-count:a`).
    #[arg(value_name = "NAME")]
    name: String,
}
