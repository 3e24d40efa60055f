// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Decoder for Android sparse images. The input is untrusted, so every field
//! is range checked against the input buffer before it is used and all sizes
//! derived from it are computed with checked arithmetic.

use std::{fmt, mem};

use thiserror::Error;
use zerocopy::{FromBytes, byteorder::little_endian};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Magic value for [`RawHeader::magic`].
const HEADER_MAGIC: u32 = 0xed26ff3a;

/// Raw chunk type for [`RawChunk::chunk_type`].
pub const CHUNK_TYPE_RAW: u16 = 0xcac1;
/// Fill chunk type for [`RawChunk::chunk_type`].
pub const CHUNK_TYPE_FILL: u16 = 0xcac2;
/// Hole chunk type for [`RawChunk::chunk_type`].
pub const CHUNK_TYPE_DONT_CARE: u16 = 0xcac3;
/// CRC32 chunk type for [`RawChunk::chunk_type`].
pub const CHUNK_TYPE_CRC32: u16 = 0xcac4;

/// Supported major version.
pub const MAJOR_VERSION: u16 = 1;

/// Size of [`RawHeader`].
pub const FILE_HEADER_SIZE: u16 = mem::size_of::<RawHeader>() as u16;
/// Size of [`RawChunk`].
pub const CHUNK_HEADER_SIZE: u16 = mem::size_of::<RawChunk>() as u16;

#[derive(Debug, Error)]
pub enum Error {
    // Header errors.
    #[error("Invalid magic: {0:#010x}")]
    InvalidMagic(u32),
    #[error("Unsupported major version: {0}")]
    UnsupportedMajorVersion(u16),
    #[error("Invalid file header size: {0} != {size}", size = FILE_HEADER_SIZE)]
    InvalidFileHeaderSize(u16),
    #[error("Invalid chunk header size: {0} != {size}", size = CHUNK_HEADER_SIZE)]
    InvalidChunkHeaderSize(u16),
    #[error("Invalid block size (must be a non-zero multiple of 4): {0}")]
    InvalidBlockSize(u32),
    // Chunk errors.
    #[error("Chunk #{index}: Expected total size {expected}, but have {total_size}")]
    InvalidChunkSize {
        index: u32,
        expected: u64,
        total_size: u32,
    },
    #[error("Chunk #{index}: Unsupported type: {chunk_type:#06x}")]
    UnsupportedChunkType { index: u32, chunk_type: u16 },
    // Reader errors.
    #[error("Reading {size} bytes of {what} at offset {offset} overruns input of {available} bytes")]
    Overread {
        what: &'static str,
        offset: usize,
        size: u64,
        available: usize,
    },
    #[error("All {0} chunks have already been read")]
    NoMoreChunks(u32),
}

type Result<T> = std::result::Result<T, Error>;

/// Raw on-disk layout for the header.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawHeader {
    /// Magic value. This should be equal to [`HEADER_MAGIC`].
    magic: little_endian::U32,
    /// Major version. Only [`MAJOR_VERSION`] is supported.
    major_version: little_endian::U16,
    /// Minor version. Ignored.
    minor_version: little_endian::U16,
    /// Size of this [`RawHeader`]. Must be exactly [`FILE_HEADER_SIZE`].
    file_hdr_sz: little_endian::U16,
    /// Size of a [`RawChunk`]. Must be exactly [`CHUNK_HEADER_SIZE`].
    chunk_hdr_sz: little_endian::U16,
    /// Block size in bytes. Must be a multiple of 4.
    blk_sz: little_endian::U32,
    /// Number of blocks when unsparsed.
    total_blks: little_endian::U32,
    /// Number of chunks.
    total_chunks: little_endian::U32,
    /// CRC32 checksum of the original data. Not verified.
    image_checksum: little_endian::U32,
}

impl fmt::Debug for RawHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawHeader")
            .field("magic", &format_args!("{:#010x}", self.magic.get()))
            .field("major_version", &self.major_version.get())
            .field("minor_version", &self.minor_version.get())
            .field("file_hdr_sz", &self.file_hdr_sz.get())
            .field("chunk_hdr_sz", &self.chunk_hdr_sz.get())
            .field("blk_sz", &self.blk_sz.get())
            .field("total_blks", &self.total_blks.get())
            .field("total_chunks", &self.total_chunks.get())
            .field(
                "image_checksum",
                &format_args!("{:#010x}", self.image_checksum.get()),
            )
            .finish()
    }
}

impl RawHeader {
    fn validate(&self) -> Result<()> {
        if self.magic.get() != HEADER_MAGIC {
            return Err(Error::InvalidMagic(self.magic.get()));
        }

        if self.major_version.get() != MAJOR_VERSION {
            return Err(Error::UnsupportedMajorVersion(self.major_version.get()));
        }

        if self.file_hdr_sz.get() != FILE_HEADER_SIZE {
            return Err(Error::InvalidFileHeaderSize(self.file_hdr_sz.get()));
        } else if self.chunk_hdr_sz.get() != CHUNK_HEADER_SIZE {
            return Err(Error::InvalidChunkHeaderSize(self.chunk_hdr_sz.get()));
        }

        if self.blk_sz.get() == 0 || self.blk_sz.get() % 4 != 0 {
            return Err(Error::InvalidBlockSize(self.blk_sz.get()));
        }

        Ok(())
    }
}

/// Raw on-disk layout for the chunk header.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawChunk {
    /// Chunk type. Must be [`CHUNK_TYPE_RAW`], [`CHUNK_TYPE_FILL`],
    /// [`CHUNK_TYPE_DONT_CARE`], or [`CHUNK_TYPE_CRC32`].
    chunk_type: little_endian::U16,
    /// Unused.
    reserved1: little_endian::U16,
    /// Number of unsparsed blocks this chunk represents.
    chunk_sz: little_endian::U32,
    /// The size in bytes of this chunk, including this [`RawChunk`].
    total_sz: little_endian::U32,
}

impl fmt::Debug for RawChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawChunk")
            .field("chunk_type", &format_args!("{:#06x}", self.chunk_type.get()))
            .field("reserved1", &format_args!("{:#06x}", self.reserved1.get()))
            .field("chunk_sz", &self.chunk_sz.get())
            .field("total_sz", &self.total_sz.get())
            .finish()
    }
}

/// Sparse file header.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub major_version: u16,
    pub minor_version: u16,
    /// Block size in bytes. Always a non-zero multiple of 4.
    pub block_size: u32,
    /// Number of blocks when unsparsed.
    pub num_blocks: u32,
    /// Number of chunks.
    pub num_chunks: u32,
    /// CRC32 checksum of the original data.
    pub crc32: u32,
}

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Header")
            .field("major_version", &self.major_version)
            .field("minor_version", &self.minor_version)
            .field("block_size", &self.block_size)
            .field("num_blocks", &self.num_blocks)
            .field("num_chunks", &self.num_chunks)
            .field("crc32", &format_args!("{:#010x}", self.crc32))
            .finish()
    }
}

impl Header {
    /// Unsparsed size in bytes.
    pub fn expanded_size(&self) -> u64 {
        u64::from(self.num_blocks) * u64::from(self.block_size)
    }
}

/// A chunk header that has been read, but whose size fields have not been
/// validated yet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkHeader {
    /// Position of the chunk in the image.
    pub index: u32,
    pub chunk_type: u16,
    /// Number of unsparsed blocks this chunk represents.
    pub num_blocks: u32,
    /// Size of the chunk in the image, including the chunk header.
    pub total_size: u32,
}

impl ChunkHeader {
    /// Number of unsparsed bytes this chunk represents.
    pub fn data_size(&self, block_size: u32) -> u64 {
        u64::from(self.num_blocks) * u64::from(block_size)
    }
}

/// A chunk's payload, borrowed from the input.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum ChunkData<'a> {
    /// Data to write verbatim. The length is `num_blocks * block_size`.
    Raw(&'a [u8]),
    /// A 4-byte pattern to repeat across every block.
    Fill(u32),
    /// A hole. Nothing should be written.
    DontCare,
    /// A checksum chunk. The payload is skipped.
    Crc32,
}

impl fmt::Debug for ChunkData<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Raw(data) => f.debug_tuple("Raw").field(&data.len()).finish(),
            Self::Fill(value) => f
                .debug_tuple("Fill")
                .field(&format_args!("{value:#010x}"))
                .finish(),
            Self::DontCare => f.write_str("DontCare"),
            Self::Crc32 => f.write_str("Crc32"),
        }
    }
}

/// Check if a buffer starts with the sparse image magic.
pub fn is_sparse(data: &[u8]) -> bool {
    data.get(..4)
        .is_some_and(|m| m == HEADER_MAGIC.to_le_bytes())
}

/// A single pass, forward only reader for a sparse image held in memory.
pub struct SparseReader<'a> {
    data: &'a [u8],
    offset: usize,
    header: RawHeader,
    chunk: u32,
}

impl fmt::Debug for SparseReader<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SparseReader")
            .field("data", &self.data.len())
            .field("offset", &self.offset)
            .field("header", &self.header)
            .field("chunk", &self.chunk)
            .finish()
    }
}

impl<'a> SparseReader<'a> {
    /// Parse and validate the sparse header at the start of `data`.
    pub fn new(data: &'a [u8]) -> Result<Self> {
        let (header, _) = RawHeader::read_from_prefix(data).map_err(|_| Error::Overread {
            what: "header",
            offset: 0,
            size: FILE_HEADER_SIZE.into(),
            available: data.len(),
        })?;

        header.validate()?;

        Ok(Self {
            data,
            offset: FILE_HEADER_SIZE.into(),
            header,
            chunk: 0,
        })
    }

    pub fn header(&self) -> Header {
        Header {
            major_version: self.header.major_version.get(),
            minor_version: self.header.minor_version.get(),
            block_size: self.header.blk_sz.get(),
            num_blocks: self.header.total_blks.get(),
            num_chunks: self.header.total_chunks.get(),
            crc32: self.header.image_checksum.get(),
        }
    }

    /// Current offset into the input.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Number of chunk headers that have not been read yet.
    pub fn remaining_chunks(&self) -> u32 {
        self.header.total_chunks.get() - self.chunk
    }

    /// Consume `size` bytes from the input, failing if that would go past the
    /// end of the buffer.
    fn take(&mut self, what: &'static str, size: u64) -> Result<&'a [u8]> {
        let overread = Error::Overread {
            what,
            offset: self.offset,
            size,
            available: self.data.len(),
        };

        let Some(end) = usize::try_from(size)
            .ok()
            .and_then(|s| self.offset.checked_add(s))
            .filter(|end| *end <= self.data.len())
        else {
            return Err(overread);
        };

        let buf = &self.data[self.offset..end];
        self.offset = end;

        Ok(buf)
    }

    /// Read the next chunk header. The chunk's payload must be consumed with
    /// [`Self::read_payload`] before reading the next header.
    pub fn next_header(&mut self) -> Result<ChunkHeader> {
        if self.chunk == self.header.total_chunks.get() {
            return Err(Error::NoMoreChunks(self.chunk));
        }

        let (raw, _) = RawChunk::read_from_prefix(&self.data[self.offset..]).map_err(|_| {
            Error::Overread {
                what: "chunk header",
                offset: self.offset,
                size: CHUNK_HEADER_SIZE.into(),
                available: self.data.len(),
            }
        })?;
        self.offset += usize::from(CHUNK_HEADER_SIZE);

        let header = ChunkHeader {
            index: self.chunk,
            chunk_type: raw.chunk_type.get(),
            num_blocks: raw.chunk_sz.get(),
            total_size: raw.total_sz.get(),
        };
        self.chunk += 1;

        Ok(header)
    }

    /// Validate the chunk's declared total size against its type and consume
    /// its payload.
    pub fn read_payload(&mut self, chunk: &ChunkHeader) -> Result<ChunkData<'a>> {
        let index = chunk.index;
        let hdr_sz = u64::from(CHUNK_HEADER_SIZE);
        let data_size = chunk.data_size(self.header.blk_sz.get());

        let expected = match chunk.chunk_type {
            CHUNK_TYPE_RAW => hdr_sz + data_size,
            CHUNK_TYPE_FILL => hdr_sz + 4,
            CHUNK_TYPE_DONT_CARE | CHUNK_TYPE_CRC32 => hdr_sz,
            t => {
                return Err(Error::UnsupportedChunkType {
                    index,
                    chunk_type: t,
                });
            }
        };

        if u64::from(chunk.total_size) != expected {
            return Err(Error::InvalidChunkSize {
                index,
                expected,
                total_size: chunk.total_size,
            });
        }

        match chunk.chunk_type {
            CHUNK_TYPE_RAW => {
                let data = self.take("raw chunk data", data_size)?;
                Ok(ChunkData::Raw(data))
            }
            CHUNK_TYPE_FILL => {
                let buf = self.take("fill value", 4)?;
                let value = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
                Ok(ChunkData::Fill(value))
            }
            CHUNK_TYPE_DONT_CARE => Ok(ChunkData::DontCare),
            _ => {
                // The checksum payload is skipped, not verified.
                self.take("crc32 chunk data", data_size)?;
                Ok(ChunkData::Crc32)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn header(blk_sz: u32, total_blks: u32, total_chunks: u32) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&HEADER_MAGIC.to_le_bytes());
        buf.extend_from_slice(&1u16.to_le_bytes());
        buf.extend_from_slice(&0u16.to_le_bytes());
        buf.extend_from_slice(&FILE_HEADER_SIZE.to_le_bytes());
        buf.extend_from_slice(&CHUNK_HEADER_SIZE.to_le_bytes());
        buf.extend_from_slice(&blk_sz.to_le_bytes());
        buf.extend_from_slice(&total_blks.to_le_bytes());
        buf.extend_from_slice(&total_chunks.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf
    }

    fn chunk(buf: &mut Vec<u8>, chunk_type: u16, chunk_sz: u32, total_sz: u32) {
        buf.extend_from_slice(&chunk_type.to_le_bytes());
        buf.extend_from_slice(&0u16.to_le_bytes());
        buf.extend_from_slice(&chunk_sz.to_le_bytes());
        buf.extend_from_slice(&total_sz.to_le_bytes());
    }

    #[test]
    fn detect_magic() {
        assert!(is_sparse(&header(4096, 0, 0)));
        assert!(!is_sparse(b"\x3a\xff\x26"));
        assert!(!is_sparse(b"ANDROID!"));
    }

    #[test]
    fn header_validation() {
        let good = header(4096, 1, 1);
        let reader = SparseReader::new(&good).unwrap();
        assert_eq!(reader.header().block_size, 4096);
        assert_eq!(reader.header().expanded_size(), 4096);

        assert_matches!(
            SparseReader::new(&good[..27]),
            Err(Error::Overread { what: "header", .. })
        );

        let mut bad = good.clone();
        bad[4] = 2;
        assert_matches!(
            SparseReader::new(&bad),
            Err(Error::UnsupportedMajorVersion(2))
        );

        let mut bad = good.clone();
        bad[8] = 32;
        assert_matches!(
            SparseReader::new(&bad),
            Err(Error::InvalidFileHeaderSize(32))
        );

        let mut bad = good.clone();
        bad[10] = 16;
        assert_matches!(
            SparseReader::new(&bad),
            Err(Error::InvalidChunkHeaderSize(16))
        );

        assert_matches!(
            SparseReader::new(&header(4098, 1, 1)),
            Err(Error::InvalidBlockSize(4098))
        );
        assert_matches!(
            SparseReader::new(&header(0, 1, 1)),
            Err(Error::InvalidBlockSize(0))
        );
    }

    #[test]
    fn chunk_total_size_rules() {
        let cases = [
            (CHUNK_TYPE_RAW, 1, 12 + 4095),
            (CHUNK_TYPE_FILL, 1, 12),
            (CHUNK_TYPE_DONT_CARE, 1, 16),
            (CHUNK_TYPE_CRC32, 0, 16),
        ];

        for (chunk_type, chunk_sz, total_sz) in cases {
            let mut data = header(4096, 1, 1);
            chunk(&mut data, chunk_type, chunk_sz, total_sz);
            data.resize(data.len() + 8192, 0);

            let mut reader = SparseReader::new(&data).unwrap();
            let chunk = reader.next_header().unwrap();
            assert_matches!(
                reader.read_payload(&chunk),
                Err(Error::InvalidChunkSize { index: 0, .. }),
                "type {chunk_type:#x}",
            );
        }
    }

    #[test]
    fn payloads() {
        let mut data = header(8, 6, 4);
        chunk(&mut data, CHUNK_TYPE_RAW, 1, 20);
        data.extend_from_slice(b"abcdefgh");
        chunk(&mut data, CHUNK_TYPE_FILL, 2, 16);
        data.extend_from_slice(&0xdeadbeefu32.to_le_bytes());
        chunk(&mut data, CHUNK_TYPE_DONT_CARE, 2, 12);
        chunk(&mut data, CHUNK_TYPE_CRC32, 1, 12);
        data.extend_from_slice(&[0xff; 8]);

        let mut reader = SparseReader::new(&data).unwrap();
        let mut payloads = vec![];

        while reader.remaining_chunks() > 0 {
            let chunk = reader.next_header().unwrap();
            payloads.push(reader.read_payload(&chunk).unwrap());
        }

        assert_eq!(
            payloads,
            [
                ChunkData::Raw(b"abcdefgh"),
                ChunkData::Fill(0xdeadbeef),
                ChunkData::DontCare,
                ChunkData::Crc32,
            ]
        );
        assert_eq!(reader.offset(), data.len());
        assert_matches!(reader.next_header(), Err(Error::NoMoreChunks(4)));
    }

    #[test]
    fn unsupported_chunk_type() {
        let mut data = header(4096, 1, 1);
        chunk(&mut data, 0xcac5, 1, 12);

        let mut reader = SparseReader::new(&data).unwrap();
        let chunk = reader.next_header().unwrap();
        assert_matches!(
            reader.read_payload(&chunk),
            Err(Error::UnsupportedChunkType {
                index: 0,
                chunk_type: 0xcac5,
            })
        );
    }

    #[test]
    fn truncated_input() {
        let mut data = header(8, 1, 1);
        chunk(&mut data, CHUNK_TYPE_RAW, 1, 20);
        data.extend_from_slice(b"abcdefg");

        let mut reader = SparseReader::new(&data).unwrap();
        let chunk = reader.next_header().unwrap();
        assert_matches!(
            reader.read_payload(&chunk),
            Err(Error::Overread {
                what: "raw chunk data",
                offset: 40,
                size: 8,
                available: 47,
            })
        );

        let data = header(8, 1, 1);
        let mut reader = SparseReader::new(&data).unwrap();
        assert_matches!(
            reader.next_header(),
            Err(Error::Overread {
                what: "chunk header",
                ..
            })
        );
    }
}
