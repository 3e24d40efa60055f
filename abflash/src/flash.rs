// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Writing images to a partition. Sparse images are expanded chunk by chunk
//! with every bound checked before the corresponding write. Anything that is
//! neither a sparse image nor a meta image is written verbatim.
//!
//! CRC32 chunks in sparse images are accepted and their payload is skipped,
//! but the checksum is never compared against the written data. The same
//! applies to the image checksum in the sparse header.
//!
//! Nothing is rolled back on failure. Chunks that were written before the
//! failing chunk stay on the device.

use std::io;

use thiserror::Error;
use tracing::{debug, info, trace};

use crate::{
    device::BlockDevice,
    format::{
        meta,
        sparse::{self, ChunkData, SparseReader},
    },
    util,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Sparse image expands to {size} bytes, but partition is {partition_size} bytes")]
    SparseImageTooLarge { size: u64, partition_size: u64 },
    #[error("Sparse block size {sparse} is not a multiple of device block size {device}")]
    BlockSizeMismatch { sparse: u32, device: u32 },
    #[error("Chunk #{index}: Volume full: {offset} + {size} > {partition_size}")]
    VolumeFull {
        index: u32,
        offset: u64,
        size: u64,
        partition_size: u64,
    },
    #[error("Chunk #{index}: Block count overflow: {written} + {blocks}")]
    BlockCountOverflow { index: u32, written: u32, blocks: u32 },
    #[error("Image corrupt: chunks cover {written} blocks, but header declares {total}")]
    ImageCorrupt { written: u32, total: u32 },
    #[error("Image size {size} exceeds partition size {partition_size}")]
    ImageTooLarge { size: u64, partition_size: u64 },
    #[error("Sparse image error")]
    Sparse(#[from] sparse::Error),
    #[error("Meta image error")]
    Meta(#[from] meta::Error),
    #[error("Failed to write {0}")]
    DataWrite(&'static str, #[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Container format of a downloaded image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageKind {
    Sparse,
    Meta,
    Raw,
}

impl ImageKind {
    pub fn detect(data: &[u8]) -> Self {
        if sparse::is_sparse(data) {
            Self::Sparse
        } else if meta::is_meta(data) {
            Self::Meta
        } else {
            Self::Raw
        }
    }
}

/// Summary of a sparse flash.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SparseStats {
    pub chunks: u32,
    /// Number of sparse blocks covered, including holes.
    pub blocks: u32,
    /// Number of bytes actually written to the device.
    pub bytes_written: u64,
}

/// Expand a sparse image onto `device`. Every device write is preceded by a
/// check that it fits within the device.
pub fn flash_sparse(device: &mut dyn BlockDevice, data: &[u8]) -> Result<SparseStats> {
    let mut reader = SparseReader::new(data)?;
    let header = reader.header();
    let partition_size = device.size();
    let device_block_size = device.block_size();

    if header.expanded_size() > partition_size {
        return Err(Error::SparseImageTooLarge {
            size: header.expanded_size(),
            partition_size,
        });
    }

    if header.block_size % device_block_size != 0 {
        return Err(Error::BlockSizeMismatch {
            sparse: header.block_size,
            device: device_block_size,
        });
    }

    let block_size = u64::from(header.block_size);
    let block_count_factor = u64::from(header.block_size / device_block_size);
    let mut stats = SparseStats::default();
    let mut written: u32 = 0;
    let mut fill_block = Vec::new();

    debug!("Flashing sparse image: {header:?}");

    for _ in 0..header.num_chunks {
        let offset = u64::from(written) * block_size;

        if offset >= partition_size {
            return Err(Error::VolumeFull {
                index: stats.chunks,
                offset,
                size: 0,
                partition_size,
            });
        }

        let chunk = reader.next_header()?;
        let data_size = chunk.data_size(header.block_size);

        if offset + data_size > partition_size {
            return Err(Error::VolumeFull {
                index: chunk.index,
                offset,
                size: data_size,
                partition_size,
            });
        }

        let end = written
            .checked_add(chunk.num_blocks)
            .ok_or(Error::BlockCountOverflow {
                index: chunk.index,
                written,
                blocks: chunk.num_blocks,
            })?;

        let payload = reader.read_payload(&chunk)?;
        trace!(
            "Chunk #{}: {payload:?} at block {written}, {} blocks",
            chunk.index, chunk.num_blocks,
        );

        match payload {
            ChunkData::Raw(buf) => {
                if !buf.is_empty() {
                    device
                        .write_blocks(u64::from(written) * block_count_factor, buf)
                        .map_err(|e| Error::DataWrite("raw chunk", e))?;
                    stats.bytes_written += buf.len() as u64;
                }
            }
            ChunkData::Fill(value) => {
                if fill_block.len() != block_size as usize {
                    fill_block.resize(block_size as usize, 0);
                }
                for word in fill_block.chunks_exact_mut(4) {
                    word.copy_from_slice(&value.to_le_bytes());
                }

                for block in written..end {
                    let block_offset = u64::from(block) * block_size;

                    if block_offset + block_size > partition_size {
                        return Err(Error::VolumeFull {
                            index: chunk.index,
                            offset: block_offset,
                            size: block_size,
                            partition_size,
                        });
                    }

                    device
                        .write_blocks(u64::from(block) * block_count_factor, &fill_block)
                        .map_err(|e| Error::DataWrite("fill chunk", e))?;
                    stats.bytes_written += block_size;
                }
            }
            ChunkData::DontCare | ChunkData::Crc32 => {}
        }

        written = end;
        stats.chunks += 1;
    }

    if written != header.num_blocks {
        return Err(Error::ImageCorrupt {
            written,
            total: header.num_blocks,
        });
    }

    stats.blocks = written;

    info!(
        "Flashed {} sparse chunks covering {} blocks ({:?} written)",
        stats.chunks,
        stats.blocks,
        util::NumBytes(stats.bytes_written),
    );

    Ok(stats)
}

/// Write `data` verbatim starting at block 0. A partial final block is padded
/// with zeros.
pub fn flash_raw(device: &mut dyn BlockDevice, data: &[u8]) -> Result<()> {
    let partition_size = device.size();

    if data.len() as u64 > partition_size {
        return Err(Error::ImageTooLarge {
            size: data.len() as u64,
            partition_size,
        });
    }

    let block_size = device.block_size() as usize;
    let aligned = data.len() / block_size * block_size;

    if aligned > 0 {
        device
            .write_blocks(0, &data[..aligned])
            .map_err(|e| Error::DataWrite("raw image", e))?;
    }

    if aligned < data.len() {
        let mut tail = vec![0u8; block_size];
        tail[..data.len() - aligned].copy_from_slice(&data[aligned..]);

        device
            .write_blocks((aligned / block_size) as u64, &tail)
            .map_err(|e| Error::DataWrite("raw image tail", e))?;
    }

    info!("Flashed raw image ({:?})", util::NumBytes(data.len()));

    Ok(())
}

/// Write a sparse or raw image. Meta images must be split up by the caller
/// because each sub-image targets a different partition.
pub fn flash_image(device: &mut dyn BlockDevice, data: &[u8]) -> Result<()> {
    match ImageKind::detect(data) {
        ImageKind::Sparse => flash_sparse(device, data).map(|_| ()),
        ImageKind::Meta | ImageKind::Raw => flash_raw(device, data),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use assert_matches::assert_matches;

    use super::*;
    use crate::device::StreamDevice;

    #[test]
    fn detect_kind() {
        assert_eq!(
            ImageKind::detect(&0xed26ff3au32.to_le_bytes()),
            ImageKind::Sparse
        );
        assert_eq!(
            ImageKind::detect(&0xce1ad63cu32.to_le_bytes()),
            ImageKind::Meta
        );
        assert_eq!(ImageKind::detect(b"ANDROID!"), ImageKind::Raw);
        assert_eq!(ImageKind::detect(b""), ImageKind::Raw);
    }

    #[test]
    fn raw_tail_is_zero_padded() {
        let mut device = StreamDevice::new(Cursor::new(vec![0xffu8; 2048]), 512).unwrap();

        flash_raw(&mut device, &[0xaa; 700]).unwrap();

        let data = device.into_inner().into_inner();
        assert!(data[..700].iter().all(|b| *b == 0xaa));
        assert!(util::is_zero(&data[700..1024]));
        assert!(data[1024..].iter().all(|b| *b == 0xff));
    }

    #[test]
    fn raw_too_large() {
        let mut device = StreamDevice::new(Cursor::new(vec![0u8; 1024]), 512).unwrap();

        assert_matches!(
            flash_raw(&mut device, &[0u8; 1025]),
            Err(Error::ImageTooLarge {
                size: 1025,
                partition_size: 1024,
            })
        );
    }
}
