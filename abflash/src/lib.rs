// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! A/B slot-aware GPT partition manager and sparse image flashing engine.
//!
//! The engine only talks to storage through the traits in [`device`], so the
//! same code can run inside a bootloader's fastboot handler or, through the
//! CLI, against disk image files on a host.

pub mod cli;
pub mod config;
pub mod device;
pub mod engine;
pub mod fastboot;
pub mod flash;
pub mod format;
pub mod partition;
pub mod slot;
pub mod util;
