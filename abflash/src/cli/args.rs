// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    io,
    sync::atomic::{AtomicBool, Ordering},
};

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::Level;

use crate::cli::{fastboot, partitions, slot};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Self::TRACE,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

pub fn init_logging(level: LogLevel) {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_max_level(Level::from(level))
        .init();
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Flash(fastboot::FlashCli),
    Erase(fastboot::EraseCli),
    SetActive(fastboot::SetActiveCli),
    Getvar(fastboot::GetvarCli),
    Partitions(partitions::PartitionsCli),
    BootSlot(slot::BootSlotCli),
    MarkUnbootable(slot::MarkUnbootableCli),
    MarkSuccessful(slot::MarkSuccessfulCli),
}

#[derive(Debug, Parser)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Lowest log message severity to output.
    #[arg(long, global = true, value_name = "LEVEL", default_value = "info")]
    pub log_level: LogLevel,
}

pub fn main(logging_initialized: &AtomicBool) -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.log_level);
    logging_initialized.store(true, Ordering::SeqCst);

    match cli.command {
        Command::Flash(c) => fastboot::flash_main(&c),
        Command::Erase(c) => fastboot::erase_main(&c),
        Command::SetActive(c) => fastboot::set_active_main(&c),
        Command::Getvar(c) => fastboot::getvar_main(&c),
        Command::Partitions(c) => partitions::partitions_main(&c),
        Command::BootSlot(c) => slot::boot_slot_main(&c),
        Command::MarkUnbootable(c) => slot::mark_unbootable_main(&c),
        Command::MarkSuccessful(c) => slot::mark_successful_main(&c),
    }
}
