// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

#![allow(dead_code)]

use std::io::{self, Cursor};

use abflash::{
    config::Config,
    device::{BlockDevice, Luns, SimulatedPlatform, StorageKind, StreamDevice},
    engine::FlashingEngine,
    format::gpt::{Entry, GptCodec, Guid},
    partition::PartitionAttributes,
};

pub const BLOCK_SIZE: u32 = 512;
pub const BLOCK_COUNT: u64 = 4096;
pub const FIRST_LBA: u64 = 34;
pub const PARTITION_BLOCKS: u64 = 64;

/// Partitions of the A/B fixture, in entry array order. `userdata` is last
/// and gets extended to the end of the usable area.
pub const PARTITIONS: &[&str] = &[
    "boot_a", "boot_b", "system_a", "system_b", "vendor_a", "vendor_b", "misc", "userdata",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
    Read { lba: u64, len: usize },
    Write { lba: u64, len: usize },
    Erase { lba: u64, count: u64 },
}

/// An in-memory block device that logs every access.
pub struct RecordingDevice {
    inner: StreamDevice<Cursor<Vec<u8>>>,
    pub ops: Vec<Op>,
}

impl RecordingDevice {
    pub fn new(block_size: u32, block_count: u64) -> Self {
        let data = vec![0u8; block_size as usize * block_count as usize];

        Self {
            inner: StreamDevice::new(Cursor::new(data), block_size).unwrap(),
            ops: vec![],
        }
    }

    pub fn data(&self) -> &[u8] {
        self.inner.get_ref().get_ref()
    }

    pub fn block(&self, lba: u64) -> &[u8] {
        let bs = self.inner.block_size() as usize;
        let start = lba as usize * bs;
        &self.data()[start..start + bs]
    }

    pub fn writes(&self) -> Vec<Op> {
        self.ops
            .iter()
            .filter(|op| !matches!(op, Op::Read { .. }))
            .copied()
            .collect()
    }
}

impl BlockDevice for RecordingDevice {
    fn block_size(&self) -> u32 {
        self.inner.block_size()
    }

    fn block_count(&self) -> u64 {
        self.inner.block_count()
    }

    fn read_blocks(&mut self, lba: u64, buf: &mut [u8]) -> io::Result<()> {
        self.ops.push(Op::Read {
            lba,
            len: buf.len(),
        });
        self.inner.read_blocks(lba, buf)
    }

    fn write_blocks(&mut self, lba: u64, buf: &[u8]) -> io::Result<()> {
        self.ops.push(Op::Write {
            lba,
            len: buf.len(),
        });
        self.inner.write_blocks(lba, buf)
    }

    fn erase_blocks(&mut self, lba: u64, count: u64) -> io::Result<()> {
        self.ops.push(Op::Erase { lba, count });
        self.inner.erase_blocks(lba, count)
    }
}

pub type TestEngine = FlashingEngine<Luns<RecordingDevice>, SimulatedPlatform>;

/// Distinct type GUID for each fixture partition.
pub fn type_guid(index: usize) -> Guid {
    Guid([index as u8 + 1; 16])
}

pub fn fixture_entries() -> Vec<Entry> {
    PARTITIONS
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let first_lba = FIRST_LBA + i as u64 * PARTITION_BLOCKS;
            let blocks = if *name == "userdata" {
                2048
            } else {
                PARTITION_BLOCKS
            };

            Entry {
                index: i as u32,
                type_guid: type_guid(i),
                unique_guid: Guid([0x80 | i as u8; 16]),
                first_lba,
                last_lba: first_lba + blocks - 1,
                attributes: 0,
                name: (*name).to_owned(),
            }
        })
        .collect()
}

/// Partition table image for the fixture, sized for `block_count` blocks.
pub fn fixture_image(block_count: u64) -> Vec<u8> {
    GptCodec::default()
        .build_image(BLOCK_SIZE, block_count, Guid([0x5a; 16]), &fixture_entries())
        .unwrap()
}

/// A single LUN containing a partition table with `entries`.
pub fn device_with_entries(entries: &[Entry]) -> RecordingDevice {
    let image = GptCodec::default()
        .build_image(BLOCK_SIZE, BLOCK_COUNT, Guid([0x5a; 16]), entries)
        .unwrap();

    let mut device = RecordingDevice::new(BLOCK_SIZE, BLOCK_COUNT);
    GptCodec::default().write_table(&mut device, &image).unwrap();
    device.ops.clear();

    device
}

/// A single LUN containing the A/B fixture table with the given `boot_a` and
/// `boot_b` attributes.
pub fn ab_device(boot_a: PartitionAttributes, boot_b: PartitionAttributes) -> RecordingDevice {
    let mut entries = fixture_entries();
    entries[0].attributes = boot_a.bits();
    entries[1].attributes = boot_b.bits();

    device_with_entries(&entries)
}

pub fn attrs(active: bool, priority: u8, retry_count: u8) -> PartitionAttributes {
    let mut a = PartitionAttributes::empty();
    a.set(PartitionAttributes::ACTIVE, active);
    a.set_priority(priority).unwrap();
    a.set_retry_count(retry_count).unwrap();
    a
}

pub fn engine_with(
    kind: StorageKind,
    devices: Vec<RecordingDevice>,
    boot_lun: Option<u8>,
) -> TestEngine {
    let config = Config {
        storage: kind,
        ..Default::default()
    };
    let platform = SimulatedPlatform {
        boot_lun,
        resets: 0,
    };

    FlashingEngine::new(config, Luns::new(kind, devices), platform).unwrap()
}

/// An eMMC engine over a fresh A/B fixture with no slot state.
pub fn fresh_engine() -> TestEngine {
    let device = ab_device(PartitionAttributes::empty(), PartitionAttributes::empty());
    engine_with(StorageKind::Emmc, vec![device], None)
}

/// Read the on-disk primary table of LUN 0 and return the entry named `name`.
pub fn on_disk_entry(engine: &TestEngine, name: &str) -> Entry {
    on_disk_entries(engine)
        .into_iter()
        .find(|e| e.name == name)
        .unwrap()
}

pub fn on_disk_entries(engine: &TestEngine) -> Vec<Entry> {
    let mut copy = lun_copy(engine, 0);
    GptCodec::default().read_primary(&mut copy).unwrap().entries()
}

pub fn on_disk_backup_entries(engine: &TestEngine) -> Vec<Entry> {
    let codec = GptCodec::default();
    let mut copy = lun_copy(engine, 0);
    let primary = codec.read_primary(&mut copy).unwrap();

    codec
        .read_backup(&mut copy, primary.header())
        .unwrap()
        .entries()
}

/// Copy a LUN so that it can be inspected without recording accesses.
fn lun_copy(engine: &TestEngine, lun: usize) -> RecordingDevice {
    let device = &engine.storage().devices()[lun];
    let mut copy = RecordingDevice::new(device.block_size(), device.block_count());
    copy.write_blocks(0, device.data()).unwrap();
    copy
}

pub enum TestChunk {
    Raw(Vec<u8>),
    Fill(u32, u32),
    DontCare(u32),
    /// Checksum chunk covering the given number of blocks. The skipped
    /// payload is zero filled.
    Crc32(u32),
}

/// Build a sparse image. `total_blocks` is written to the header verbatim so
/// that inconsistent images can be built.
pub fn sparse_image(block_size: u32, total_blocks: u32, chunks: &[TestChunk]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&0xed26ff3au32.to_le_bytes());
    buf.extend_from_slice(&1u16.to_le_bytes());
    buf.extend_from_slice(&0u16.to_le_bytes());
    buf.extend_from_slice(&28u16.to_le_bytes());
    buf.extend_from_slice(&12u16.to_le_bytes());
    buf.extend_from_slice(&block_size.to_le_bytes());
    buf.extend_from_slice(&total_blocks.to_le_bytes());
    buf.extend_from_slice(&(chunks.len() as u32).to_le_bytes());
    buf.extend_from_slice(&0u32.to_le_bytes());

    for chunk in chunks {
        if let TestChunk::Crc32(blocks) = chunk {
            buf.extend_from_slice(&0xcac4u16.to_le_bytes());
            buf.extend_from_slice(&0u16.to_le_bytes());
            buf.extend_from_slice(&blocks.to_le_bytes());
            buf.extend_from_slice(&12u32.to_le_bytes());
            buf.resize(buf.len() + (*blocks * block_size) as usize, 0);
            continue;
        }

        let (chunk_type, chunk_sz, payload): (u16, u32, Vec<u8>) = match chunk {
            TestChunk::Raw(data) => (0xcac1, data.len() as u32 / block_size, data.clone()),
            TestChunk::Fill(value, blocks) => (0xcac2, *blocks, value.to_le_bytes().to_vec()),
            TestChunk::DontCare(blocks) => (0xcac3, *blocks, vec![]),
            TestChunk::Crc32(_) => unreachable!(),
        };

        buf.extend_from_slice(&chunk_type.to_le_bytes());
        buf.extend_from_slice(&0u16.to_le_bytes());
        buf.extend_from_slice(&chunk_sz.to_le_bytes());
        buf.extend_from_slice(&(12 + payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&payload);
    }

    buf
}

/// Build a meta image containing the given `(name, data)` pairs.
pub fn meta_image(images: &[(&str, &[u8])]) -> Vec<u8> {
    const HEADER_SIZE: usize = 76;
    const ENTRY_SIZE: usize = 80;

    let mut buf = Vec::new();
    buf.extend_from_slice(&0xce1ad63cu32.to_le_bytes());
    buf.extend_from_slice(&1u16.to_le_bytes());
    buf.extend_from_slice(&0u16.to_le_bytes());
    buf.extend_from_slice(&[0u8; 64]);
    buf.extend_from_slice(&(HEADER_SIZE as u16).to_le_bytes());
    buf.extend_from_slice(&((images.len() * ENTRY_SIZE) as u16).to_le_bytes());

    let mut offset = HEADER_SIZE + images.len() * ENTRY_SIZE;

    for (name, data) in images {
        let mut raw_name = [0u8; 72];
        raw_name[..name.len()].copy_from_slice(name.as_bytes());
        buf.extend_from_slice(&raw_name);
        buf.extend_from_slice(&(offset as u32).to_le_bytes());
        buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
        offset += data.len();
    }

    for (_, data) in images {
        buf.extend_from_slice(data);
    }

    buf
}
