// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Block storage collaborators. The flashing engine never touches storage
//! except through these traits, so a bootloader can back them with firmware
//! block I/O and the host tools can back them with disk image files.

use std::{
    fmt,
    io::{self, Read, Seek, SeekFrom, Write},
};

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::util;

/// The type of storage that holds the partition tables.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// A single user area, exposed as LUN 0.
    Emmc,
    /// Multiple independently addressable LUNs, one GPT per LUN.
    #[default]
    Ufs,
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Emmc => f.write_str("emmc"),
            Self::Ufs => f.write_str("ufs"),
        }
    }
}

/// Fixed-size block I/O. All buffers must be a multiple of
/// [`Self::block_size`] and all accesses must fall within
/// [`Self::block_count`] blocks. Every call is synchronous.
pub trait BlockDevice {
    fn block_size(&self) -> u32;

    fn block_count(&self) -> u64;

    fn read_blocks(&mut self, lba: u64, buf: &mut [u8]) -> io::Result<()>;

    fn write_blocks(&mut self, lba: u64, buf: &[u8]) -> io::Result<()>;

    /// Erase `count` blocks starting at `lba`. Erased blocks read back as
    /// zeros.
    fn erase_blocks(&mut self, lba: u64, count: u64) -> io::Result<()>;

    /// Total size in bytes.
    fn size(&self) -> u64 {
        self.block_count()
            .saturating_mul(u64::from(self.block_size()))
    }
}

/// Ensure that a `len`-byte access at `lba` is block-aligned and in bounds.
/// Returns the number of blocks covered.
pub fn check_access(device: &dyn BlockDevice, lba: u64, len: usize) -> io::Result<u64> {
    let block_size = u64::from(device.block_size());

    if len as u64 % block_size != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("Buffer size {len} is not a multiple of block size {block_size}"),
        ));
    }

    let count = len as u64 / block_size;
    check_range(device, lba, count)?;

    Ok(count)
}

/// Ensure that the block range `lba..lba + count` is in bounds.
pub fn check_range(device: &dyn BlockDevice, lba: u64, count: u64) -> io::Result<()> {
    let end = lba.checked_add(count).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("Block range overflow: {lba} + {count}"),
        )
    })?;

    if end > device.block_count() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "Block range {lba}..{end} exceeds device size of {} blocks",
                device.block_count(),
            ),
        ));
    }

    Ok(())
}

/// A block device backed by a seekable stream, such as a disk image file or an
/// in-memory [`io::Cursor`].
pub struct StreamDevice<F> {
    inner: F,
    block_size: u32,
    block_count: u64,
}

impl<F> fmt::Debug for StreamDevice<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamDevice")
            .field("block_size", &self.block_size)
            .field("block_count", &self.block_count)
            .finish_non_exhaustive()
    }
}

impl<F: Seek> StreamDevice<F> {
    /// Wrap a stream whose length is a multiple of `block_size`.
    pub fn new(mut inner: F, block_size: u32) -> io::Result<Self> {
        if block_size == 0 || block_size % 512 != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Block size is not a non-zero multiple of 512: {block_size}"),
            ));
        }

        let len = inner.seek(SeekFrom::End(0))?;
        if len % u64::from(block_size) != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Stream size {len} is not a multiple of block size {block_size}"),
            ));
        }

        Ok(Self {
            inner,
            block_size,
            block_count: len / u64::from(block_size),
        })
    }

    pub fn into_inner(self) -> F {
        self.inner
    }

    pub fn get_ref(&self) -> &F {
        &self.inner
    }

    fn seek_to(&mut self, lba: u64) -> io::Result<()> {
        self.inner
            .seek(SeekFrom::Start(lba * u64::from(self.block_size)))?;
        Ok(())
    }
}

impl<F: Read + Write + Seek> BlockDevice for StreamDevice<F> {
    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn read_blocks(&mut self, lba: u64, buf: &mut [u8]) -> io::Result<()> {
        check_access(self, lba, buf.len())?;
        self.seek_to(lba)?;
        self.inner.read_exact(buf)
    }

    fn write_blocks(&mut self, lba: u64, buf: &[u8]) -> io::Result<()> {
        check_access(self, lba, buf.len())?;
        self.seek_to(lba)?;
        self.inner.write_all(buf)
    }

    fn erase_blocks(&mut self, lba: u64, count: u64) -> io::Result<()> {
        check_range(self, lba, count)?;
        self.seek_to(lba)?;

        let mut remain = count * u64::from(self.block_size);

        while remain > 0 {
            let n = remain.min(util::ZEROS.len() as u64) as usize;
            self.inner.write_all(&util::ZEROS[..n])?;
            remain -= n as u64;
        }

        self.inner.flush()
    }
}

/// A window onto the blocks of a single partition. LBA 0 of the window is the
/// partition's first LBA on the owning device.
pub struct PartitionIo<'a> {
    inner: &'a mut dyn BlockDevice,
    start: u64,
    count: u64,
}

impl fmt::Debug for PartitionIo<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionIo")
            .field("start", &self.start)
            .field("count", &self.count)
            .finish_non_exhaustive()
    }
}

impl<'a> PartitionIo<'a> {
    /// Create a window covering the inclusive range `first_lba..=last_lba`.
    pub fn new(inner: &'a mut dyn BlockDevice, first_lba: u64, last_lba: u64) -> io::Result<Self> {
        let count = last_lba
            .checked_add(1)
            .and_then(|end| end.checked_sub(first_lba))
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("Invalid partition range: {first_lba}..={last_lba}"),
                )
            })?;

        check_range(inner, first_lba, count)?;

        Ok(Self {
            inner,
            start: first_lba,
            count,
        })
    }
}

impl BlockDevice for PartitionIo<'_> {
    fn block_size(&self) -> u32 {
        self.inner.block_size()
    }

    fn block_count(&self) -> u64 {
        self.count
    }

    fn read_blocks(&mut self, lba: u64, buf: &mut [u8]) -> io::Result<()> {
        check_access(self, lba, buf.len())?;
        self.inner.read_blocks(self.start + lba, buf)
    }

    fn write_blocks(&mut self, lba: u64, buf: &[u8]) -> io::Result<()> {
        check_access(self, lba, buf.len())?;
        self.inner.write_blocks(self.start + lba, buf)
    }

    fn erase_blocks(&mut self, lba: u64, count: u64) -> io::Result<()> {
        check_range(self, lba, count)?;
        self.inner.erase_blocks(self.start + lba, count)
    }
}

/// Enumerates the logical units that make up the device's storage.
pub trait Storage {
    fn kind(&self) -> StorageKind;

    /// Get the whole-LUN block device for `lun` or [`None`] if the LUN does
    /// not respond.
    fn lun(&mut self, lun: u8) -> Option<&mut dyn BlockDevice>;
}

/// A fixed list of block devices, where LUN `n` is the `n`th device.
#[derive(Debug)]
pub struct Luns<D> {
    kind: StorageKind,
    devices: Vec<D>,
}

impl<D: BlockDevice> Luns<D> {
    pub fn new(kind: StorageKind, devices: Vec<D>) -> Self {
        Self { kind, devices }
    }

    pub fn devices(&self) -> &[D] {
        &self.devices
    }
}

impl<D: BlockDevice> Storage for Luns<D> {
    fn kind(&self) -> StorageKind {
        self.kind
    }

    fn lun(&mut self, lun: u8) -> Option<&mut dyn BlockDevice> {
        self.devices
            .get_mut(usize::from(lun))
            .map(|d| d as &mut dyn BlockDevice)
    }
}

/// Platform services consumed by slot switching.
pub trait Platform {
    /// Read the UFS boot LUN register. Returns [`None`] if the platform has no
    /// such register.
    fn boot_lun(&mut self) -> io::Result<Option<u8>>;

    fn set_boot_lun(&mut self, lun: u8) -> io::Result<()>;

    /// Request a cold reset. Real firmware does not return from this.
    fn cold_reset(&mut self);
}

/// A platform whose boot LUN register and reset line are plain fields. This
/// is what the host tools drive the engine with.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SimulatedPlatform {
    /// [`None`] means that there is no boot LUN register.
    pub boot_lun: Option<u8>,
    /// Number of cold resets requested so far.
    pub resets: u32,
}

impl Platform for SimulatedPlatform {
    fn boot_lun(&mut self) -> io::Result<Option<u8>> {
        Ok(self.boot_lun)
    }

    fn set_boot_lun(&mut self, lun: u8) -> io::Result<()> {
        if self.boot_lun.is_none() {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "Platform has no boot LUN register",
            ));
        }

        self.boot_lun = Some(lun);
        Ok(())
    }

    fn cold_reset(&mut self) {
        self.resets += 1;
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn memory_device(blocks: usize) -> StreamDevice<Cursor<Vec<u8>>> {
        StreamDevice::new(Cursor::new(vec![0u8; blocks * 512]), 512).unwrap()
    }

    #[test]
    fn stream_device_bounds() {
        let mut device = memory_device(4);
        assert_eq!(device.block_count(), 4);
        assert_eq!(device.size(), 2048);

        device.write_blocks(3, &[0xaa; 512]).unwrap();
        assert!(device.write_blocks(4, &[0xaa; 512]).is_err());
        assert!(device.write_blocks(3, &[0xaa; 1024]).is_err());
        assert!(device.write_blocks(0, &[0xaa; 100]).is_err());

        device.erase_blocks(3, 1).unwrap();
        let mut buf = [0xffu8; 512];
        device.read_blocks(3, &mut buf).unwrap();
        assert!(util::is_zero(&buf));
    }

    #[test]
    fn stream_device_rejects_partial_blocks() {
        assert!(StreamDevice::new(Cursor::new(vec![0u8; 1000]), 512).is_err());
        assert!(StreamDevice::new(Cursor::new(vec![0u8; 1024]), 100).is_err());
    }

    #[test]
    fn partition_window() {
        let mut device = memory_device(8);

        {
            let mut window = PartitionIo::new(&mut device, 2, 5).unwrap();
            assert_eq!(window.block_count(), 4);

            window.write_blocks(0, &[1u8; 512]).unwrap();
            window.write_blocks(3, &[2u8; 512]).unwrap();
            assert!(window.write_blocks(4, &[3u8; 512]).is_err());
            assert!(window.erase_blocks(1, 4).is_err());
        }

        let data = device.into_inner().into_inner();
        assert!(data[2 * 512..3 * 512].iter().all(|b| *b == 1));
        assert!(data[5 * 512..6 * 512].iter().all(|b| *b == 2));
        assert!(util::is_zero(&data[6 * 512..]));
    }

    #[test]
    fn partition_window_out_of_range() {
        let mut device = memory_device(8);

        assert!(PartitionIo::new(&mut device, 4, 8).is_err());
        assert!(PartitionIo::new(&mut device, 5, 3).is_err());
        // Empty partition.
        assert_eq!(
            PartitionIo::new(&mut device, 4, 3).unwrap().block_count(),
            0
        );
    }

    #[test]
    fn simulated_boot_lun() {
        let mut platform = SimulatedPlatform::default();
        assert!(platform.set_boot_lun(1).is_err());

        platform.boot_lun = Some(1);
        platform.set_boot_lun(2).unwrap();
        assert_eq!(platform.boot_lun().unwrap(), Some(2));
    }
}
