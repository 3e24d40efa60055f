// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use clap::Args;

use crate::{
    cli::{status, warning},
    config::Config,
    device::{Luns, SimulatedPlatform, StorageKind, StreamDevice},
    engine::FlashingEngine,
};

pub type HostEngine = FlashingEngine<Luns<StreamDevice<File>>, SimulatedPlatform>;

/// Options describing the disk images that stand in for the device storage.
#[derive(Debug, Args)]
pub struct DeviceArgs {
    /// Disk image backing a LUN.
    ///
    /// Repeat for each LUN in order. The first image is LUN 0. For eMMC, only
    /// the first image is used.
    #[arg(short, long = "lun", value_name = "FILE", value_parser, required = true)]
    pub luns: Vec<PathBuf>,

    /// Logical block size of every LUN.
    #[arg(long, value_name = "BYTES", default_value_t = 4096)]
    pub block_size: u32,

    /// Storage type. Overrides the value from the config file.
    #[arg(long, value_name = "TYPE")]
    pub storage: Option<StorageKind>,

    /// Path to platform config TOML.
    #[arg(long, value_name = "FILE", value_parser)]
    pub config: Option<PathBuf>,

    /// Initial value of the UFS boot LUN register.
    ///
    /// If unset, the simulated platform has no boot LUN register.
    #[arg(long, value_name = "LUN")]
    pub boot_lun: Option<u8>,
}

fn open_lun(path: &Path, block_size: u32) -> Result<StreamDevice<File>> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .with_context(|| format!("Failed to open LUN image: {path:?}"))?;

    StreamDevice::new(file, block_size)
        .with_context(|| format!("Invalid LUN image: {path:?}"))
}

pub fn open_engine(args: &DeviceArgs) -> Result<HostEngine> {
    let mut config = match &args.config {
        Some(path) => {
            Config::load(path).with_context(|| format!("Failed to load config: {path:?}"))?
        }
        None => Config::default(),
    };
    if let Some(storage) = args.storage {
        config.storage = storage;
    }

    if args.luns.len() > usize::from(config.lun_limit()) {
        warning!(
            "Only the first {} LUN images are used for {} storage",
            config.lun_limit(),
            config.storage,
        );
    }

    let devices = args
        .luns
        .iter()
        .map(|p| open_lun(p, args.block_size))
        .collect::<Result<Vec<_>>>()?;

    let storage = Luns::new(config.storage, devices);
    let platform = SimulatedPlatform {
        boot_lun: args.boot_lun,
        resets: 0,
    };

    FlashingEngine::new(config, storage, platform).context("Failed to initialize flashing engine")
}

/// Print platform register changes that a real device would act on.
pub fn report_platform(args: &DeviceArgs, engine: &HostEngine) {
    let platform = engine.platform();

    if platform.boot_lun != args.boot_lun
        && let Some(lun) = platform.boot_lun
    {
        status!("Boot LUN changed to {lun}");
    }

    if platform.resets > 0 {
        status!("Cold reset requested");
    }
}
