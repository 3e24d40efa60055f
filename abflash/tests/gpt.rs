// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

mod common;

use assert_matches::assert_matches;

use abflash::{
    device::BlockDevice,
    format::gpt::{self, GptCodec, Guid, HeaderKind},
};

use common::{BLOCK_COUNT, BLOCK_SIZE, Op, RecordingDevice};

const BS: usize = BLOCK_SIZE as usize;
/// 16 KiB partition entry array in 512-byte blocks.
const ENTRY_BLOCKS: u64 = 32;

#[test]
fn parse_built_image() {
    let codec = GptCodec::default();
    let image = common::fixture_image(BLOCK_COUNT);

    let primary = codec
        .parse_header(&image[BS..2 * BS], BLOCK_COUNT, BLOCK_SIZE, HeaderKind::Primary)
        .unwrap();
    assert_eq!(primary.header_size, gpt::MIN_HEADER_SIZE);
    assert_eq!(primary.current_lba, 1);
    assert_eq!(primary.backup_lba, BLOCK_COUNT - 1);
    assert_eq!(primary.first_usable_lba, 2 + ENTRY_BLOCKS);
    assert_eq!(primary.last_usable_lba, BLOCK_COUNT - 2 - ENTRY_BLOCKS);
    assert_eq!(primary.partition_entries_lba, 2);
    assert_eq!(primary.partition_entry_size, gpt::ENTRY_SIZE);
    assert_eq!(primary.max_partition_count, 128);
    assert_eq!(primary.disk_guid, Guid([0x5a; 16]));

    let array_size = codec.entry_array_size(&primary, BLOCK_SIZE).unwrap();
    assert_eq!(array_size, 16384);

    let backup_offset = 2 * BS + 2 * array_size as usize;
    let backup = codec
        .parse_header(
            &image[backup_offset..backup_offset + BS],
            BLOCK_COUNT,
            BLOCK_SIZE,
            HeaderKind::Backup,
        )
        .unwrap();
    assert_eq!(backup.current_lba, BLOCK_COUNT - 1);
    assert_eq!(backup.backup_lba, 1);
    assert_eq!(backup.partition_entries_lba, BLOCK_COUNT - 1 - ENTRY_BLOCKS);
    assert_eq!(backup.partition_entries_crc32, primary.partition_entries_crc32);

    // The backup header's current LBA points at itself, which is only valid
    // for a backup header.
    assert_matches!(
        codec.parse_header(
            &image[backup_offset..backup_offset + BS],
            BLOCK_COUNT,
            BLOCK_SIZE,
            HeaderKind::Primary,
        ),
        Err(gpt::Error::InvalidCurrentLba(lba)) if lba == BLOCK_COUNT - 1
    );
}

#[test]
fn write_table_order_and_geometry() {
    let codec = GptCodec::default();
    // Built for a smaller device. The geometry must be moved to the end of
    // the real device.
    let image = common::fixture_image(2048);
    let mut device = RecordingDevice::new(BLOCK_SIZE, BLOCK_COUNT);

    codec.write_table(&mut device, &image).unwrap();

    let backup_lba = BLOCK_COUNT - 1;
    assert_eq!(
        device.ops,
        [
            Op::Erase {
                lba: 0,
                count: BLOCK_COUNT,
            },
            Op::Write { lba: 0, len: BS },
            Op::Write { lba: 1, len: BS },
            Op::Write {
                lba: backup_lba,
                len: BS,
            },
            Op::Write { lba: 2, len: 16384 },
            Op::Write {
                lba: backup_lba - ENTRY_BLOCKS,
                len: 16384,
            },
        ],
    );

    // Protective MBR.
    assert_eq!(&device.block(0)[510..], &[0x55, 0xaa]);

    let primary = codec.read_primary(&mut device).unwrap();
    assert_eq!(primary.header().backup_lba, backup_lba);
    assert_eq!(primary.header().last_usable_lba, BLOCK_COUNT - 2 - ENTRY_BLOCKS);

    let backup = codec.read_backup(&mut device, primary.header()).unwrap();
    assert_eq!(backup.header().current_lba, backup_lba);
    assert_eq!(backup.header().partition_entries_lba, backup_lba - ENTRY_BLOCKS);

    let entries = primary.entries();
    assert_eq!(entries, backup.entries());
    assert_eq!(entries.len(), common::PARTITIONS.len());

    let expected = common::fixture_entries();
    for (entry, expected) in entries.iter().zip(&expected).take(expected.len() - 1) {
        assert_eq!(entry, expected);
    }

    let userdata = entries.last().unwrap();
    assert_eq!(userdata.name, "userdata");
    assert_eq!(userdata.first_lba, expected.last().unwrap().first_lba);
    assert_eq!(userdata.last_lba, BLOCK_COUNT - 2 - ENTRY_BLOCKS);
}

#[test]
fn corrupt_header_writes_nothing() {
    let codec = GptCodec::default();
    let mut image = common::fixture_image(BLOCK_COUNT);
    let mut device = RecordingDevice::new(BLOCK_SIZE, BLOCK_COUNT);

    // Flip one bit of the primary header's CRC.
    image[BS + 16] ^= 1;
    assert_matches!(
        codec.write_table(&mut device, &image),
        Err(gpt::Error::CrcMismatch { .. })
    );
    assert!(device.writes().is_empty());

    // A corrupt backup header is just as fatal.
    let mut image = common::fixture_image(BLOCK_COUNT);
    let backup_offset = image.len() - BS;
    image[backup_offset + 40] ^= 0x80;
    assert_matches!(
        codec.write_table(&mut device, &image),
        Err(gpt::Error::CrcMismatch { .. })
    );
    assert!(device.writes().is_empty());

    // Truncated image.
    let image = common::fixture_image(BLOCK_COUNT);
    assert_matches!(
        codec.write_table(&mut device, &image[..image.len() - 1]),
        Err(gpt::Error::BufferTooSmall { .. })
    );
    assert!(device.writes().is_empty());
}

#[test]
fn entry_array_crc_is_enforced() {
    let codec = GptCodec::default();
    let image = common::fixture_image(BLOCK_COUNT);
    let mut device = RecordingDevice::new(BLOCK_SIZE, BLOCK_COUNT);
    codec.write_table(&mut device, &image).unwrap();

    let mut table = codec.read_primary(&mut device).unwrap();
    let crc = table.header().partition_entries_crc32;

    // Changing an entry without recomputing the CRC must be detected.
    let mut block = device.block(2).to_vec();
    block[56] ^= 0xff;
    device.write_blocks(2, &block).unwrap();
    assert_matches!(
        codec.read_primary(&mut device),
        Err(gpt::Error::EntryArrayCrcMismatch { expected, .. }) if expected == crc
    );

    // Writing through the table recomputes both CRCs.
    table.set_attributes(0, 1 << 50).unwrap();
    table.write(&mut device).unwrap();

    let table = codec.read_primary(&mut device).unwrap();
    assert_ne!(table.header().partition_entries_crc32, crc);
    assert_eq!(table.entries()[0].attributes, 1 << 50);
    assert_eq!(
        table.header().partition_entries_crc32,
        gpt::crc32(&device.data()[2 * BS..2 * BS + 16384]),
    );
}

#[test]
fn missing_table_is_invalid_magic() {
    let codec = GptCodec::default();
    let mut device = RecordingDevice::new(BLOCK_SIZE, BLOCK_COUNT);

    assert_matches!(
        codec.read_primary(&mut device),
        Err(gpt::Error::InvalidMagic(0))
    );
}

#[test]
fn device_too_small() {
    let codec = GptCodec::default();
    let image = common::fixture_image(BLOCK_COUNT);
    // The primary header claims usable LBAs beyond the end of this device.
    let mut device = RecordingDevice::new(BLOCK_SIZE, 64);

    assert_matches!(
        codec.write_table(&mut device, &image),
        Err(gpt::Error::LastUsableLbaOutOfRange { .. })
    );
    assert!(device.writes().is_empty());
}

/// Recompute the CRC32 of a header block covering `header_size` bytes.
fn fix_header_crc(block: &mut [u8], header_size: usize) {
    block[12..16].copy_from_slice(&(header_size as u32).to_le_bytes());
    block[16..20].fill(0);
    let crc = gpt::crc32(&block[..header_size]);
    block[16..20].copy_from_slice(&crc.to_le_bytes());
}

#[test]
fn headers_keep_their_own_size() {
    let codec = GptCodec::default();
    let mut image = common::fixture_image(2048);
    let backup_offset = image.len() - BS;
    fix_header_crc(&mut image[backup_offset..], 96);

    let mut device = RecordingDevice::new(BLOCK_SIZE, BLOCK_COUNT);
    codec.write_table(&mut device, &image).unwrap();

    let primary = codec.read_primary(&mut device).unwrap();
    assert_eq!(primary.header().header_size, gpt::MIN_HEADER_SIZE);

    let mut backup = codec.read_backup(&mut device, primary.header()).unwrap();
    assert_eq!(backup.header().header_size, 96);

    // Later attribute updates still produce a valid backup.
    backup.set_attributes(0, 1 << 54).unwrap();
    backup.write(&mut device).unwrap();
    let backup = codec.read_backup(&mut device, primary.header()).unwrap();
    assert_eq!(backup.entries()[0].attributes, 1 << 54);
}

#[test]
fn mismatched_entry_arrays_write_nothing() {
    let codec = GptCodec::default();
    let mut image = common::fixture_image(BLOCK_COUNT);
    let backup_offset = image.len() - BS;
    let backup = &mut image[backup_offset..];
    backup[80..84].copy_from_slice(&64u32.to_le_bytes());
    fix_header_crc(backup, gpt::MIN_HEADER_SIZE as usize);

    let mut device = RecordingDevice::new(BLOCK_SIZE, BLOCK_COUNT);
    assert_matches!(
        codec.write_table(&mut device, &image),
        Err(gpt::Error::MismatchedHeaders(_))
    );
    assert!(device.writes().is_empty());
}

#[test]
fn misplaced_entry_array_writes_nothing() {
    let codec = GptCodec::default();
    let mut device = RecordingDevice::new(BLOCK_SIZE, BLOCK_COUNT);

    // The array would overwrite the primary header.
    let mut image = common::fixture_image(BLOCK_COUNT);
    let primary = &mut image[BS..2 * BS];
    primary[72..80].copy_from_slice(&1u64.to_le_bytes());
    fix_header_crc(primary, gpt::MIN_HEADER_SIZE as usize);
    assert_matches!(
        codec.write_table(&mut device, &image),
        Err(gpt::Error::MisplacedEntryArray { lba: 1, blocks: ENTRY_BLOCKS, .. })
    );
    assert!(device.writes().is_empty());

    // The array would overlap the first partition.
    let mut image = common::fixture_image(BLOCK_COUNT);
    let primary = &mut image[BS..2 * BS];
    primary[40..48].copy_from_slice(&20u64.to_le_bytes());
    fix_header_crc(primary, gpt::MIN_HEADER_SIZE as usize);
    assert_matches!(
        codec.write_table(&mut device, &image),
        Err(gpt::Error::MisplacedEntryArray {
            lba: 2,
            first_usable_lba: 20,
            ..
        })
    );
    assert!(device.writes().is_empty());
}
