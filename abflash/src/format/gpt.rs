// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{fmt, io, mem, ops::Range};

use crc32fast::Hasher;
use thiserror::Error;
use tracing::{debug, trace};
use zerocopy::{FromBytes, FromZeros, IntoBytes, byteorder::little_endian};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::{
    device::{self, BlockDevice},
    format::padding,
    util,
};

/// Magic value for [`RawHeader::signature`]. This is `EFI PART` read as a
/// little endian integer.
const HEADER_SIGNATURE: u64 = 0x5452_4150_2049_4645;

/// Header revision 1.0.
const HEADER_REVISION: u32 = 0x0001_0000;

/// Minimum (and canonical) size of [`RawHeader`].
pub const MIN_HEADER_SIZE: u32 = mem::size_of::<RawHeader>() as u32;

/// Offset of [`RawHeader::header_crc32`].
const HEADER_CRC32_OFFSET: usize = 16;

/// The only supported partition entry size.
pub const ENTRY_SIZE: u32 = mem::size_of::<RawEntry>() as u32;

/// Number of UTF-16 code units in a partition name.
pub const NAME_LEN: usize = 36;

/// Minimum amount of space reserved for each partition entry array.
pub const MIN_ENTRY_ARRAY_SIZE: u32 = 16384;

/// Default limit for `num_partition_entries * partition_entry_size`.
pub const DEFAULT_MAX_ARRAY_SIZE: u32 = 16384;

/// Partition type for a protective MBR partition.
const MBR_PROTECTIVE_TYPE: u8 = 0xee;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid header signature: {0:#018x}")]
    InvalidMagic(u64),
    #[error("Header size too small: {0} < {min}", min = MIN_HEADER_SIZE)]
    HeaderSizeTooSmall(u32),
    #[error("Header size {header_size} exceeds block size {block_size}")]
    HeaderSizeTooLarge { header_size: u32, block_size: u32 },
    #[error("Expected header CRC32 {expected:08x}, but have {actual:08x}")]
    CrcMismatch { expected: u32, actual: u32 },
    #[error("Primary header current LBA is not 1: {0}")]
    InvalidCurrentLba(u64),
    #[error("Backup header current LBA {actual} does not match its location {expected}")]
    MismatchedBackupLba { expected: u64, actual: u64 },
    #[error("First usable LBA {lba} exceeds device block count {block_count}")]
    FirstUsableLbaOutOfRange { lba: u64, block_count: u64 },
    #[error("Last usable LBA {lba} exceeds device block count {block_count}")]
    LastUsableLbaOutOfRange { lba: u64, block_count: u64 },
    #[error("Invalid partition entry size: {0} != {size}", size = ENTRY_SIZE)]
    InvalidEntrySize(u32),
    #[error("Partition entry array too large: {count} * {entry_size} > {max_size}")]
    EntryArrayTooLarge {
        count: u32,
        entry_size: u32,
        max_size: u32,
    },
    #[error("Expected partition entry array CRC32 {expected:08x}, but have {actual:08x}")]
    EntryArrayCrcMismatch { expected: u32, actual: u32 },
    #[error("Partition entry array at LBA {lba} ({blocks} blocks) is outside the device")]
    EntryArrayOutOfRange { lba: u64, blocks: u64 },
    #[error(
        "Partition entry array at LBA {lba} ({blocks} blocks) must start at LBA 2 \
        and end before first usable LBA {first_usable_lba}"
    )]
    MisplacedEntryArray {
        lba: u64,
        blocks: u64,
        first_usable_lba: u64,
    },
    #[error("Primary and backup headers disagree on {0}")]
    MismatchedHeaders(&'static str),
    #[error("Partition entry index out of range: {index} >= {count}")]
    EntryIndexOutOfRange { index: u32, count: u32 },
    #[error("Partition #{index}: Ends past new last usable LBA {last_usable_lba}")]
    EntryOutOfRange { index: u32, last_usable_lba: u64 },
    #[error("Partition name is longer than {len} UTF-16 code units: {0:?}", len = NAME_LEN)]
    NameTooLong(String),
    #[error("Too many partition entries: {count} > {max}")]
    TooManyEntries { count: usize, max: u32 },
    #[error("Unsupported block size: {0}")]
    UnsupportedBlockSize(u32),
    #[error("Buffer too small for {what}: {size} < {required}")]
    BufferTooSmall {
        what: &'static str,
        size: usize,
        required: usize,
    },
    #[error("Device with {block_count} blocks is too small for the partition table")]
    DeviceTooSmall { block_count: u64 },
    #[error("Failed to read GPT data: {0}")]
    DataRead(&'static str, #[source] io::Error),
    #[error("Failed to write GPT data: {0}")]
    DataWrite(&'static str, #[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// A GUID as stored on disk. The first three fields are little endian.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Guid(pub [u8; 16]);

impl Guid {
    pub const ZERO: Self = Self([0u8; 16]);

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;

        write!(
            f,
            "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{}-{}",
            b[3],
            b[2],
            b[1],
            b[0],
            b[5],
            b[4],
            b[7],
            b[6],
            hex::encode(&b[8..10]),
            hex::encode(&b[10..16]),
        )
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Raw on-disk layout for the GPT header.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawHeader {
    /// Magic value. This should be equal to [`HEADER_SIGNATURE`].
    signature: little_endian::U64,
    revision: little_endian::U32,
    /// Number of bytes covered by [`Self::header_crc32`].
    header_size: little_endian::U32,
    /// CRC32 of the first [`Self::header_size`] bytes with this field set to
    /// zero.
    header_crc32: little_endian::U32,
    reserved: little_endian::U32,
    /// LBA of this header.
    current_lba: little_endian::U64,
    /// LBA of the other copy of the header.
    backup_lba: little_endian::U64,
    first_usable_lba: little_endian::U64,
    last_usable_lba: little_endian::U64,
    disk_guid: [u8; 16],
    partition_entries_lba: little_endian::U64,
    num_partition_entries: little_endian::U32,
    /// Size of a [`RawEntry`].
    partition_entry_size: little_endian::U32,
    /// CRC32 of `num_partition_entries * partition_entry_size` bytes.
    partition_entries_crc32: little_endian::U32,
}

impl fmt::Debug for RawHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawHeader")
            .field("signature", &format_args!("{:#018x}", self.signature.get()))
            .field("revision", &format_args!("{:#010x}", self.revision.get()))
            .field("header_size", &self.header_size.get())
            .field("header_crc32", &format_args!("{:08x}", self.header_crc32.get()))
            .field("reserved", &self.reserved.get())
            .field("current_lba", &self.current_lba.get())
            .field("backup_lba", &self.backup_lba.get())
            .field("first_usable_lba", &self.first_usable_lba.get())
            .field("last_usable_lba", &self.last_usable_lba.get())
            .field("disk_guid", &Guid(self.disk_guid))
            .field("partition_entries_lba", &self.partition_entries_lba.get())
            .field("num_partition_entries", &self.num_partition_entries.get())
            .field("partition_entry_size", &self.partition_entry_size.get())
            .field(
                "partition_entries_crc32",
                &format_args!("{:08x}", self.partition_entries_crc32.get()),
            )
            .finish()
    }
}

/// Raw on-disk layout for a partition entry.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawEntry {
    /// All zeros for unused entries.
    type_guid: [u8; 16],
    unique_guid: [u8; 16],
    first_lba: little_endian::U64,
    /// Inclusive.
    last_lba: little_endian::U64,
    attributes: little_endian::U64,
    /// UTF-16LE, NUL padded.
    name: [little_endian::U16; NAME_LEN],
}

impl fmt::Debug for RawEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawEntry")
            .field("type_guid", &Guid(self.type_guid))
            .field("unique_guid", &Guid(self.unique_guid))
            .field("first_lba", &self.first_lba.get())
            .field("last_lba", &self.last_lba.get())
            .field("attributes", &format_args!("{:#018x}", self.attributes.get()))
            .field("name", &self.name())
            .finish()
    }
}

impl RawEntry {
    fn is_used(&self) -> bool {
        self.type_guid != [0u8; 16]
    }

    fn name(&self) -> String {
        let units = self
            .name
            .iter()
            .map(|c| c.get())
            .take_while(|c| *c != 0)
            .collect::<Vec<_>>();

        String::from_utf16_lossy(&units)
    }

    fn set_name(&mut self, name: &str) -> Result<()> {
        let mut units = [little_endian::U16::ZERO; NAME_LEN];
        let mut n = 0;

        for c in name.encode_utf16() {
            if n == NAME_LEN {
                return Err(Error::NameTooLong(name.to_owned()));
            }

            units[n] = c.into();
            n += 1;
        }

        self.name = units;

        Ok(())
    }
}

/// Compute a CRC32 over a buffer.
pub fn crc32(buf: &[u8]) -> u32 {
    crc32fast::hash(buf)
}

/// Compute the CRC32 of a header buffer with the stored CRC field treated as
/// zero. `buf` must contain at least [`MIN_HEADER_SIZE`] bytes.
fn header_crc32(buf: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(&buf[..HEADER_CRC32_OFFSET]);
    hasher.update(&[0u8; 4]);
    hasher.update(&buf[HEADER_CRC32_OFFSET + 4..]);
    hasher.finalize()
}

/// Whether a header is the primary copy at LBA 1 or the backup copy at the end
/// of the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeaderKind {
    Primary,
    Backup,
}

/// Validated GPT header fields.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeaderData {
    pub header_size: u32,
    pub current_lba: u64,
    pub backup_lba: u64,
    pub first_usable_lba: u64,
    pub last_usable_lba: u64,
    pub disk_guid: Guid,
    pub partition_entries_lba: u64,
    pub max_partition_count: u32,
    pub partition_entry_size: u32,
    pub partition_entries_crc32: u32,
}

impl HeaderData {
    /// Number of bytes in the partition entry array that are covered by the
    /// entry array CRC32.
    pub fn entry_bytes(&self) -> usize {
        self.max_partition_count as usize * self.partition_entry_size as usize
    }

    fn from_raw(raw: &RawHeader) -> Self {
        Self {
            header_size: raw.header_size.get(),
            current_lba: raw.current_lba.get(),
            backup_lba: raw.backup_lba.get(),
            first_usable_lba: raw.first_usable_lba.get(),
            last_usable_lba: raw.last_usable_lba.get(),
            disk_guid: Guid(raw.disk_guid),
            partition_entries_lba: raw.partition_entries_lba.get(),
            max_partition_count: raw.num_partition_entries.get(),
            partition_entry_size: raw.partition_entry_size.get(),
            partition_entries_crc32: raw.partition_entries_crc32.get(),
        }
    }
}

/// A partition entry decoded from a partition entry array.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    /// Position in the partition entry array.
    pub index: u32,
    pub type_guid: Guid,
    pub unique_guid: Guid,
    pub first_lba: u64,
    /// Inclusive.
    pub last_lba: u64,
    pub attributes: u64,
    pub name: String,
}

impl Entry {
    fn from_raw(index: u32, raw: &RawEntry) -> Self {
        Self {
            index,
            type_guid: Guid(raw.type_guid),
            unique_guid: Guid(raw.unique_guid),
            first_lba: raw.first_lba.get(),
            last_lba: raw.last_lba.get(),
            attributes: raw.attributes.get(),
            name: raw.name(),
        }
    }

    fn to_raw(&self) -> Result<RawEntry> {
        let mut raw = RawEntry::new_zeroed();
        raw.type_guid = self.type_guid.0;
        raw.unique_guid = self.unique_guid.0;
        raw.first_lba = self.first_lba.into();
        raw.last_lba = self.last_lba.into();
        raw.attributes = self.attributes.into();
        raw.set_name(&self.name)?;

        Ok(raw)
    }
}

/// Byte ranges of the pieces of a partition table image.
///
/// ```text
/// [MBR][primary header][primary entries][backup entries][backup header]
/// ```
#[derive(Clone, Debug)]
struct ImageLayout {
    primary_header: Range<usize>,
    primary_entries: Range<usize>,
    backup_entries: Range<usize>,
    backup_header: Range<usize>,
}

impl ImageLayout {
    fn new(block_size: u32, array_size: u32) -> Self {
        let bs = block_size as usize;
        let array = array_size as usize;

        Self {
            primary_header: bs..2 * bs,
            primary_entries: 2 * bs..2 * bs + array,
            backup_entries: 2 * bs + array..2 * bs + 2 * array,
            backup_header: 2 * bs + 2 * array..3 * bs + 2 * array,
        }
    }

    fn size(&self) -> usize {
        self.backup_header.end
    }
}

/// Read, validate, patch, and write GUID partition tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GptCodec {
    /// Upper bound for the size of a partition entry array.
    max_array_size: u32,
}

impl Default for GptCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ARRAY_SIZE)
    }
}

impl GptCodec {
    pub fn new(max_array_size: u32) -> Self {
        Self { max_array_size }
    }

    /// Parse and validate a GPT header at the start of `buf`. The CRC32 is
    /// verified before any field other than the signature and size is
    /// trusted.
    pub fn parse_header(
        &self,
        buf: &[u8],
        device_block_count: u64,
        block_size: u32,
        kind: HeaderKind,
    ) -> Result<HeaderData> {
        let (raw, _) = RawHeader::read_from_prefix(buf).map_err(|_| Error::BufferTooSmall {
            what: "header",
            size: buf.len(),
            required: MIN_HEADER_SIZE as usize,
        })?;

        if raw.signature.get() != HEADER_SIGNATURE {
            return Err(Error::InvalidMagic(raw.signature.get()));
        }

        let header_size = raw.header_size.get();
        if header_size < MIN_HEADER_SIZE {
            return Err(Error::HeaderSizeTooSmall(header_size));
        } else if header_size > block_size {
            return Err(Error::HeaderSizeTooLarge {
                header_size,
                block_size,
            });
        } else if header_size as usize > buf.len() {
            return Err(Error::BufferTooSmall {
                what: "header",
                size: buf.len(),
                required: header_size as usize,
            });
        }

        #[cfg(not(fuzzing))]
        {
            let actual = header_crc32(&buf[..header_size as usize]);
            if actual != raw.header_crc32.get() {
                return Err(Error::CrcMismatch {
                    expected: raw.header_crc32.get(),
                    actual,
                });
            }
        }

        // The backup header's current LBA refers to itself at the end of the
        // device.
        if kind == HeaderKind::Primary && raw.current_lba.get() != 1 {
            return Err(Error::InvalidCurrentLba(raw.current_lba.get()));
        }

        if raw.first_usable_lba.get() > device_block_count {
            return Err(Error::FirstUsableLbaOutOfRange {
                lba: raw.first_usable_lba.get(),
                block_count: device_block_count,
            });
        } else if raw.last_usable_lba.get() > device_block_count {
            return Err(Error::LastUsableLbaOutOfRange {
                lba: raw.last_usable_lba.get(),
                block_count: device_block_count,
            });
        }

        let count = raw.num_partition_entries.get();
        let entry_size = raw.partition_entry_size.get();

        if entry_size != ENTRY_SIZE {
            return Err(Error::InvalidEntrySize(entry_size));
        }

        if u64::from(count) * u64::from(entry_size) > u64::from(self.max_array_size) {
            return Err(Error::EntryArrayTooLarge {
                count,
                entry_size,
                max_size: self.max_array_size,
            });
        }

        let header = HeaderData::from_raw(&raw);
        trace!("Parsed {kind:?} GPT header: {raw:?}");

        Ok(header)
    }

    /// Size of the space reserved for each partition entry array in a
    /// partition table image. This is at least [`MIN_ENTRY_ARRAY_SIZE`] and
    /// is always a multiple of the block size.
    pub fn entry_array_size(&self, header: &HeaderData, block_size: u32) -> Result<u32> {
        let too_large = Error::EntryArrayTooLarge {
            count: header.max_partition_count,
            entry_size: header.partition_entry_size,
            max_size: self.max_array_size,
        };

        let Some(size) = header
            .max_partition_count
            .checked_mul(header.partition_entry_size)
        else {
            return Err(too_large);
        };

        padding::round(size.max(MIN_ENTRY_ARRAY_SIZE), block_size).ok_or(too_large)
    }

    /// Rewrite the geometry of a partition table image built for a different
    /// device size so that it matches a device with `device_block_count`
    /// blocks. `array_size` is the value from [`Self::entry_array_size`].
    /// `primary` and `backup` are the parsed headers of the image. Each
    /// header's CRC covers its own `header_size` bytes.
    ///
    /// The primary and backup headers get new backup, last usable, and backup
    /// entry array LBAs. The last partition in both entry arrays is extended
    /// or shrunk to end at the new last usable LBA. All CRCs are recomputed.
    pub fn patch_header_pair(
        &self,
        image: &mut [u8],
        device_block_count: u64,
        array_size: u32,
        primary: &HeaderData,
        backup: &HeaderData,
        block_size: u32,
    ) -> Result<()> {
        if block_size == 0 || array_size % block_size != 0 {
            return Err(Error::UnsupportedBlockSize(block_size));
        }

        let layout = ImageLayout::new(block_size, array_size);
        if image.len() < layout.size() {
            return Err(Error::BufferTooSmall {
                what: "partition table image",
                size: image.len(),
                required: layout.size(),
            });
        }

        if primary.entry_bytes() != backup.entry_bytes() {
            return Err(Error::MismatchedHeaders("partition entry array size"));
        }

        let entry_bytes = primary.entry_bytes();
        if entry_bytes > array_size as usize {
            return Err(Error::BufferTooSmall {
                what: "partition entry array",
                size: array_size as usize,
                required: entry_bytes,
            });
        }

        let entry_blocks = u64::from(array_size / block_size);
        let last_lba = device_block_count
            .checked_sub(1)
            .ok_or(Error::DeviceTooSmall {
                block_count: device_block_count,
            })?;
        let last_usable_lba = device_block_count
            .checked_sub(2 + entry_blocks)
            .filter(|lba| *lba >= primary.first_usable_lba)
            .ok_or(Error::DeviceTooSmall {
                block_count: device_block_count,
            })?;
        let backup_entries_lba = last_lba - entry_blocks;

        debug!(
            "Patching GPT geometry for {device_block_count} blocks: \
            last_usable={last_usable_lba}, backup_entries={backup_entries_lba}"
        );

        for range in [layout.primary_entries.clone(), layout.backup_entries.clone()] {
            patch_last_entry(&mut image[range][..entry_bytes], last_usable_lba)?;
        }

        let primary_crc = crc32(&image[layout.primary_entries.clone()][..entry_bytes]);
        let backup_crc = crc32(&image[layout.backup_entries.clone()][..entry_bytes]);

        {
            let buf = &mut image[layout.primary_header.clone()];
            let (raw, _) = RawHeader::mut_from_prefix(buf).map_err(|_| Error::BufferTooSmall {
                what: "primary header",
                size: block_size as usize,
                required: MIN_HEADER_SIZE as usize,
            })?;
            raw.backup_lba = last_lba.into();
            raw.last_usable_lba = last_usable_lba.into();
            raw.partition_entries_crc32 = primary_crc.into();

            let crc = header_crc32(&buf[..primary.header_size as usize]);
            buf[HEADER_CRC32_OFFSET..HEADER_CRC32_OFFSET + 4].copy_from_slice(&crc.to_le_bytes());
        }

        {
            let buf = &mut image[layout.backup_header.clone()];
            let (raw, _) = RawHeader::mut_from_prefix(buf).map_err(|_| Error::BufferTooSmall {
                what: "backup header",
                size: block_size as usize,
                required: MIN_HEADER_SIZE as usize,
            })?;
            raw.current_lba = last_lba.into();
            raw.last_usable_lba = last_usable_lba.into();
            raw.partition_entries_lba = backup_entries_lba.into();
            raw.partition_entries_crc32 = backup_crc.into();

            let crc = header_crc32(&buf[..backup.header_size as usize]);
            buf[HEADER_CRC32_OFFSET..HEADER_CRC32_OFFSET + 4].copy_from_slice(&crc.to_le_bytes());
        }

        Ok(())
    }

    /// Replace the partition table on a device with the one in `image`. Both
    /// headers in the image must be valid. Nothing is written to the device if
    /// validation fails. Otherwise, the entire device is erased before the new
    /// table is written, so an I/O failure part way through leaves the device
    /// without a valid table instead of a stale one.
    pub fn write_table(&self, device: &mut dyn BlockDevice, image: &[u8]) -> Result<()> {
        let block_size = device.block_size();
        let block_count = device.block_count();
        let bs = block_size as usize;

        if block_size < 512 {
            return Err(Error::UnsupportedBlockSize(block_size));
        } else if image.len() < 2 * bs {
            return Err(Error::BufferTooSmall {
                what: "partition table image",
                size: image.len(),
                required: 2 * bs,
            });
        }

        let primary = self.parse_header(&image[bs..2 * bs], block_count, block_size, HeaderKind::Primary)?;
        let array_size = self.entry_array_size(&primary, block_size)?;
        let layout = ImageLayout::new(block_size, array_size);

        if image.len() < layout.size() {
            return Err(Error::BufferTooSmall {
                what: "partition table image",
                size: image.len(),
                required: layout.size(),
            });
        }

        let backup = self.parse_header(
            &image[layout.backup_header.clone()],
            block_count,
            block_size,
            HeaderKind::Backup,
        )?;

        // The image layout places the primary array right after the primary
        // header.
        let entry_blocks = u64::from(array_size / block_size);
        if primary.partition_entries_lba != 2 || 2 + entry_blocks > primary.first_usable_lba {
            return Err(Error::MisplacedEntryArray {
                lba: primary.partition_entries_lba,
                blocks: entry_blocks,
                first_usable_lba: primary.first_usable_lba,
            });
        }

        let mut buf = image[..layout.size()].to_vec();
        self.patch_header_pair(
            &mut buf,
            block_count,
            array_size,
            &primary,
            &backup,
            block_size,
        )?;

        let backup_header_lba = block_count - 1;
        let backup_entries_lba = backup_header_lba - entry_blocks;

        debug!("Erasing {block_count} blocks before writing partition table");
        device
            .erase_blocks(0, block_count)
            .map_err(|e| Error::DataWrite("erase", e))?;

        device
            .write_blocks(0, &buf[..bs])
            .map_err(|e| Error::DataWrite("protective_mbr", e))?;
        trace!("Wrote protective MBR");

        device
            .write_blocks(1, &buf[layout.primary_header.clone()])
            .map_err(|e| Error::DataWrite("primary_header", e))?;
        trace!("Wrote primary header at LBA 1");

        device
            .write_blocks(backup_header_lba, &buf[layout.backup_header.clone()])
            .map_err(|e| Error::DataWrite("backup_header", e))?;
        trace!("Wrote backup header at LBA {backup_header_lba}");

        device
            .write_blocks(primary.partition_entries_lba, &buf[layout.primary_entries.clone()])
            .map_err(|e| Error::DataWrite("primary_entries", e))?;
        trace!(
            "Wrote primary partition entries at LBA {}",
            primary.partition_entries_lba,
        );

        device
            .write_blocks(backup_entries_lba, &buf[layout.backup_entries.clone()])
            .map_err(|e| Error::DataWrite("backup_entries", e))?;
        trace!("Wrote backup partition entries at LBA {backup_entries_lba}");

        debug!(
            "Wrote partition table with {} entry slots",
            primary.max_partition_count,
        );

        Ok(())
    }

    /// Read and validate the primary table at LBA 1.
    pub fn read_primary(&self, device: &mut dyn BlockDevice) -> Result<Table> {
        self.read_table(device, 1, HeaderKind::Primary)
    }

    /// Read and validate the backup table referenced by a primary header.
    pub fn read_backup(&self, device: &mut dyn BlockDevice, primary: &HeaderData) -> Result<Table> {
        self.read_table(device, primary.backup_lba, HeaderKind::Backup)
    }

    /// Read and validate the header at `lba` and its partition entry array.
    pub fn read_table(
        &self,
        device: &mut dyn BlockDevice,
        lba: u64,
        kind: HeaderKind,
    ) -> Result<Table> {
        let block_size = device.block_size();
        let block_count = device.block_count();

        if (block_size as usize) < MIN_HEADER_SIZE as usize {
            return Err(Error::UnsupportedBlockSize(block_size));
        }

        let mut header_block = vec![0u8; block_size as usize];
        device
            .read_blocks(lba, &mut header_block)
            .map_err(|e| Error::DataRead("header", e))?;

        let header = self.parse_header(&header_block, block_count, block_size, kind)?;

        if kind == HeaderKind::Backup && header.current_lba != lba {
            return Err(Error::MismatchedBackupLba {
                expected: lba,
                actual: header.current_lba,
            });
        }

        let entry_bytes = header.entry_bytes();
        // Bounded by max_array_size.
        let array_len = padding::round(entry_bytes, block_size as usize).unwrap_or(entry_bytes);
        let array_blocks = (array_len / block_size as usize) as u64;

        if device::check_range(device, header.partition_entries_lba, array_blocks).is_err() {
            return Err(Error::EntryArrayOutOfRange {
                lba: header.partition_entries_lba,
                blocks: array_blocks,
            });
        }

        let mut entries = vec![0u8; array_len];
        device
            .read_blocks(header.partition_entries_lba, &mut entries)
            .map_err(|e| Error::DataRead("partition_entries", e))?;

        #[cfg(not(fuzzing))]
        {
            let actual = crc32(&entries[..entry_bytes]);
            if actual != header.partition_entries_crc32 {
                return Err(Error::EntryArrayCrcMismatch {
                    expected: header.partition_entries_crc32,
                    actual,
                });
            }
        }

        debug!(
            "Read {kind:?} GPT at LBA {lba}: {} entry slots at LBA {}",
            header.max_partition_count, header.partition_entries_lba,
        );

        Ok(Table {
            kind,
            header,
            header_block,
            entries,
        })
    }

    /// Build a complete partition table image for a device with the given
    /// geometry. Entry `i` of `entries` is stored in slot `i` of the partition
    /// entry array, and [`Entry::index`] is ignored.
    pub fn build_image(
        &self,
        block_size: u32,
        device_block_count: u64,
        disk_guid: Guid,
        entries: &[Entry],
    ) -> Result<Vec<u8>> {
        if block_size < 512 || block_size % 512 != 0 {
            return Err(Error::UnsupportedBlockSize(block_size));
        }

        let count = self.max_array_size / ENTRY_SIZE;
        if entries.len() > count as usize {
            return Err(Error::TooManyEntries {
                count: entries.len(),
                max: count,
            });
        }

        let header_data = HeaderData {
            header_size: MIN_HEADER_SIZE,
            current_lba: 1,
            backup_lba: 0,
            first_usable_lba: 0,
            last_usable_lba: 0,
            disk_guid,
            partition_entries_lba: 2,
            max_partition_count: count,
            partition_entry_size: ENTRY_SIZE,
            partition_entries_crc32: 0,
        };
        let array_size = self.entry_array_size(&header_data, block_size)?;
        let layout = ImageLayout::new(block_size, array_size);
        let entry_blocks = u64::from(array_size / block_size);

        let last_lba = device_block_count
            .checked_sub(1)
            .ok_or(Error::DeviceTooSmall {
                block_count: device_block_count,
            })?;
        let first_usable_lba = 2 + entry_blocks;
        let last_usable_lba = device_block_count
            .checked_sub(2 + entry_blocks)
            .filter(|lba| *lba >= first_usable_lba)
            .ok_or(Error::DeviceTooSmall {
                block_count: device_block_count,
            })?;

        let mut image = vec![0u8; layout.size()];

        write_protective_mbr(&mut image[..block_size as usize], device_block_count);

        let mut array = vec![0u8; header_data.entry_bytes()];
        for (i, entry) in entries.iter().enumerate() {
            let raw = entry.to_raw()?;
            let offset = i * ENTRY_SIZE as usize;
            array[offset..offset + ENTRY_SIZE as usize].copy_from_slice(raw.as_bytes());
        }
        let array_crc = crc32(&array);

        image[layout.primary_entries.clone()][..array.len()].copy_from_slice(&array);
        image[layout.backup_entries.clone()][..array.len()].copy_from_slice(&array);

        let mut raw = RawHeader::new_zeroed();
        raw.signature = HEADER_SIGNATURE.into();
        raw.revision = HEADER_REVISION.into();
        raw.header_size = MIN_HEADER_SIZE.into();
        raw.current_lba = 1u64.into();
        raw.backup_lba = last_lba.into();
        raw.first_usable_lba = first_usable_lba.into();
        raw.last_usable_lba = last_usable_lba.into();
        raw.disk_guid = disk_guid.0;
        raw.partition_entries_lba = 2u64.into();
        raw.num_partition_entries = count.into();
        raw.partition_entry_size = ENTRY_SIZE.into();
        raw.partition_entries_crc32 = array_crc.into();
        raw.header_crc32 = header_crc32(raw.as_bytes()).into();

        image[layout.primary_header.clone()][..MIN_HEADER_SIZE as usize]
            .copy_from_slice(raw.as_bytes());

        raw.current_lba = last_lba.into();
        raw.backup_lba = 1u64.into();
        raw.partition_entries_lba = (last_lba - entry_blocks).into();
        raw.header_crc32 = header_crc32(raw.as_bytes()).into();

        image[layout.backup_header.clone()][..MIN_HEADER_SIZE as usize]
            .copy_from_slice(raw.as_bytes());

        Ok(image)
    }
}

/// Move the end of the last used entry in a partition entry array to
/// `last_usable_lba`.
fn patch_last_entry(array: &mut [u8], last_usable_lba: u64) -> Result<()> {
    let Ok(entries) = <[RawEntry]>::mut_from_bytes(array) else {
        return Err(Error::BufferTooSmall {
            what: "partition entry array",
            size: array.len(),
            required: padding::round(array.len(), ENTRY_SIZE as usize).unwrap_or(usize::MAX),
        });
    };

    let Some((index, entry)) = entries.iter_mut().enumerate().rfind(|(_, e)| e.is_used()) else {
        return Ok(());
    };

    if entry.first_lba.get() > last_usable_lba {
        return Err(Error::EntryOutOfRange {
            index: index as u32,
            last_usable_lba,
        });
    }

    trace!(
        "Moving end of partition #{index} ({:?}) from LBA {} to {last_usable_lba}",
        entry.name(),
        entry.last_lba.get(),
    );
    entry.last_lba = last_usable_lba.into();

    Ok(())
}

fn write_protective_mbr(block: &mut [u8], device_block_count: u64) {
    let size = device_block_count.saturating_sub(1).min(u64::from(u32::MAX)) as u32;
    let record = &mut block[446..462];

    record[1..4].copy_from_slice(&[0x00, 0x02, 0x00]);
    record[4] = MBR_PROTECTIVE_TYPE;
    record[5..8].copy_from_slice(&[0xff, 0xff, 0xff]);
    record[8..12].copy_from_slice(&1u32.to_le_bytes());
    record[12..16].copy_from_slice(&size.to_le_bytes());

    block[510] = 0x55;
    block[511] = 0xaa;
}

/// One copy (primary or backup) of an on-device GPT, as read by
/// [`GptCodec::read_table`]. The raw header block is kept so that fields this
/// type does not interpret survive a rewrite.
#[derive(Clone)]
pub struct Table {
    kind: HeaderKind,
    header: HeaderData,
    header_block: Vec<u8>,
    entries: Vec<u8>,
}

impl fmt::Debug for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Table")
            .field("kind", &self.kind)
            .field("header", &self.header)
            .field("header_block", &util::NumBytes(self.header_block.len()))
            .field("entries", &util::NumBytes(self.entries.len()))
            .finish()
    }
}

impl Table {
    pub fn kind(&self) -> HeaderKind {
        self.kind
    }

    pub fn header(&self) -> &HeaderData {
        &self.header
    }

    fn raw_entries(&self) -> &[RawEntry] {
        // The array length is a multiple of the block size and the entry size
        // was validated to be 128.
        let len = self.header.entry_bytes();
        <[RawEntry]>::ref_from_bytes(&self.entries[..len]).unwrap_or(&[])
    }

    fn raw_entry_mut(&mut self, index: u32) -> Result<&mut RawEntry> {
        let count = self.header.max_partition_count;
        let len = self.header.entry_bytes();

        <[RawEntry]>::mut_from_bytes(&mut self.entries[..len])
            .ok()
            .and_then(|e| e.get_mut(index as usize))
            .ok_or(Error::EntryIndexOutOfRange { index, count })
    }

    /// All used partition entries, in array order.
    pub fn entries(&self) -> Vec<Entry> {
        self.raw_entries()
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_used())
            .map(|(i, e)| Entry::from_raw(i as u32, e))
            .collect()
    }

    pub fn set_type_guid(&mut self, index: u32, guid: Guid) -> Result<()> {
        self.raw_entry_mut(index)?.type_guid = guid.0;
        Ok(())
    }

    pub fn set_attributes(&mut self, index: u32, attributes: u64) -> Result<()> {
        self.raw_entry_mut(index)?.attributes = attributes.into();
        Ok(())
    }

    /// Recompute the CRCs and write the partition entry array followed by the
    /// header back to where they were read from.
    pub fn write(&mut self, device: &mut dyn BlockDevice) -> Result<()> {
        let entries_crc = crc32(&self.entries[..self.header.entry_bytes()]);
        self.header.partition_entries_crc32 = entries_crc;

        let header_size = self.header.header_size as usize;
        {
            let (raw, _) =
                RawHeader::mut_from_prefix(&mut self.header_block).map_err(|_| {
                    Error::BufferTooSmall {
                        what: "header",
                        size: header_size,
                        required: MIN_HEADER_SIZE as usize,
                    }
                })?;
            raw.partition_entries_crc32 = entries_crc.into();
        }

        let crc = header_crc32(&self.header_block[..header_size]);
        self.header_block[HEADER_CRC32_OFFSET..HEADER_CRC32_OFFSET + 4]
            .copy_from_slice(&crc.to_le_bytes());

        device
            .write_blocks(self.header.partition_entries_lba, &self.entries)
            .map_err(|e| Error::DataWrite("partition_entries", e))?;
        device
            .write_blocks(self.header.current_lba, &self.header_block)
            .map_err(|e| Error::DataWrite("header", e))?;

        debug!(
            "Wrote {:?} GPT at LBA {}",
            self.kind, self.header.current_lba,
        );

        Ok(())
    }
}
