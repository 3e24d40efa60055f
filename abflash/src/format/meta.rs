// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Parser for "meta" images, which bundle several partition images into one
//! payload. The layout is a fixed header, a table of `(name, offset, size)`
//! entries, and then the images themselves. Offsets are relative to the start
//! of the payload.

use std::{fmt, mem, str};

use thiserror::Error;
use zerocopy::{FromBytes, byteorder::little_endian};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::util;

/// Magic value for [`RawHeader::magic`].
const HEADER_MAGIC: u32 = 0xce1ad63c;

/// Size of [`RawHeader`].
pub const HEADER_SIZE: usize = mem::size_of::<RawHeader>();
/// Size of [`RawEntry`].
pub const ENTRY_SIZE: usize = mem::size_of::<RawEntry>();

const VERSION_LEN: usize = 64;
const NAME_LEN: usize = 72;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid magic: {0:#010x}")]
    InvalidMagic(u32),
    #[error("Entry table size is not a multiple of {size}: {0}", size = ENTRY_SIZE)]
    InvalidEntryTableSize(u16),
    #[error("Entry #{index}: Offset overflow: {offset} + {size}")]
    OffsetOverflow { index: usize, offset: u32, size: u32 },
    #[error("Reading {size} bytes of {what} at offset {offset} overruns input of {available} bytes")]
    Overread {
        what: &'static str,
        offset: usize,
        size: usize,
        available: usize,
    },
    #[error("Entry #{index}: Name is not valid UTF-8: {name:?}")]
    InvalidName { index: usize, name: Vec<u8> },
}

type Result<T> = std::result::Result<T, Error>;

/// Raw on-disk layout for the header.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawHeader {
    /// Magic value. This should be equal to [`HEADER_MAGIC`].
    magic: little_endian::U32,
    major_version: little_endian::U16,
    minor_version: little_endian::U16,
    /// NUL-padded version string.
    img_version: [u8; VERSION_LEN],
    /// Size of this header. Informational only.
    meta_hdr_sz: little_endian::U16,
    /// Size of the entry table that immediately follows this header.
    img_hdr_sz: little_endian::U16,
}

impl fmt::Debug for RawHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawHeader")
            .field("magic", &format_args!("{:#010x}", self.magic.get()))
            .field("major_version", &self.major_version.get())
            .field("minor_version", &self.minor_version.get())
            .field(
                "img_version",
                &String::from_utf8_lossy(util::trim_nul(&self.img_version)),
            )
            .field("meta_hdr_sz", &self.meta_hdr_sz.get())
            .field("img_hdr_sz", &self.img_hdr_sz.get())
            .finish()
    }
}

/// Raw on-disk layout for an entry table record.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawEntry {
    /// NUL-padded partition name. Entries with an empty name are ignored.
    ptn_name: [u8; NAME_LEN],
    start_offset: little_endian::U32,
    size: little_endian::U32,
}

/// Check if a buffer starts with the meta image magic.
pub fn is_meta(data: &[u8]) -> bool {
    data.get(..4)
        .is_some_and(|m| m == HEADER_MAGIC.to_le_bytes())
}

/// One partition image inside a meta image.
#[derive(Clone, PartialEq, Eq)]
pub struct SubImage<'a> {
    pub name: String,
    pub data: &'a [u8],
}

impl fmt::Debug for SubImage<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubImage")
            .field("name", &self.name)
            .field("data", &util::NumBytes(self.data.len()))
            .finish()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetaImage<'a> {
    pub major_version: u16,
    pub minor_version: u16,
    pub version: String,
    pub images: Vec<SubImage<'a>>,
}

impl<'a> MetaImage<'a> {
    /// Parse the header and entry table. Every sub-image's range is checked
    /// against the bounds of `data`.
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        let (header, _) = RawHeader::read_from_prefix(data).map_err(|_| Error::Overread {
            what: "header",
            offset: 0,
            size: HEADER_SIZE,
            available: data.len(),
        })?;

        if header.magic.get() != HEADER_MAGIC {
            return Err(Error::InvalidMagic(header.magic.get()));
        }

        let table_size = header.img_hdr_sz.get();
        if usize::from(table_size) % ENTRY_SIZE != 0 {
            return Err(Error::InvalidEntryTableSize(table_size));
        }

        let table = data
            .get(HEADER_SIZE..HEADER_SIZE + usize::from(table_size))
            .ok_or(Error::Overread {
                what: "entry table",
                offset: HEADER_SIZE,
                size: table_size.into(),
                available: data.len(),
            })?;

        // The table size was checked to be a multiple of the entry size.
        let entries = <[RawEntry]>::ref_from_bytes(table).unwrap_or(&[]);
        let mut images = Vec::with_capacity(entries.len());

        for (index, entry) in entries.iter().enumerate() {
            let name = util::trim_nul(&entry.ptn_name);
            if name.is_empty() {
                continue;
            }

            let name = str::from_utf8(name).map_err(|_| Error::InvalidName {
                index,
                name: name.to_vec(),
            })?;

            let offset = entry.start_offset.get();
            let size = entry.size.get();
            let end = offset
                .checked_add(size)
                .ok_or(Error::OffsetOverflow {
                    index,
                    offset,
                    size,
                })?;

            let image = data
                .get(offset as usize..end as usize)
                .ok_or(Error::Overread {
                    what: "sub-image",
                    offset: offset as usize,
                    size: size as usize,
                    available: data.len(),
                })?;

            images.push(SubImage {
                name: name.to_owned(),
                data: image,
            });
        }

        Ok(Self {
            major_version: header.major_version.get(),
            minor_version: header.minor_version.get(),
            version: String::from_utf8_lossy(util::trim_nul(&header.img_version)).into_owned(),
            images,
        })
    }
}
