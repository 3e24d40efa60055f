// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

pub mod gpt;
pub mod meta;
pub mod padding;
pub mod sparse;
