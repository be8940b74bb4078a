use std::io::{Read, Write};

use super::*;
use crate::index_layout::{LayoutError, LayoutErrorKind, SaveType};
use crate::layout::save_data::{SAVE_DATA_SIZE, decode_save_data};
use crate::layout::{RegionKind, SOLE_INSTANCE, TableType};

/// Set up, fill in and commit a save, returning its slot.
fn commit_save(layout: &mut IndexLayout, save_type: SaveType, state: &[u8]) -> usize {
    let slot = layout.setup_save_slot(2, save_type).unwrap();
    layout.set_state_buffer(slot, state.to_vec()).unwrap();
    layout.commit_save(slot).unwrap();
    slot
}

#[test]
fn test_first_setup_uses_slot_zero() {
    let (_, _, mut layout) = create_layout();
    let slot = layout.setup_save_slot(2, SaveType::Save).unwrap();
    assert_eq!(slot, 0);

    let save = layout.save_layout(slot).unwrap();
    assert_eq!(save.save_type(), SaveType::Save);
    assert!(save.save_data().timestamp > 0);
    assert!(save.is_valid(layout.volume_nonce()));
    assert!(!save.is_written());
}

#[test]
fn test_slots_rotate_oldest_first() {
    let (_, _, mut layout) = create_layout();
    let slots: Vec<_> = (0..5)
        .map(|n| commit_save(&mut layout, SaveType::Checkpoint, &[n]))
        .collect();
    assert_eq!(slots, vec![0, 1, 2, 0, 1]);
    assert_eq!(layout.select_latest_save().unwrap(), 1);
}

#[test]
fn test_timestamps_increase() {
    let (_, _, mut layout) = create_layout();
    let first = commit_save(&mut layout, SaveType::Save, b"a");
    let second = commit_save(&mut layout, SaveType::Save, b"b");

    let first = layout.save_layout(first).unwrap().save_data().timestamp;
    let second = layout.save_layout(second).unwrap().save_data().timestamp;
    assert!(second > first);
}

#[rstest::rstest]
#[case::save(SaveType::Save)]
#[case::checkpoint(SaveType::Checkpoint)]
fn test_committed_save_reloads(#[case] save_type: SaveType) {
    let (_, io, mut layout) = create_layout();
    let slot = commit_save(&mut layout, save_type, b"index state");
    let written = layout.save_layout(slot).unwrap().clone();
    assert!(written.is_written());

    let loaded = IndexLayout::load(io, 0).unwrap();
    assert_eq!(loaded.find_latest_save_slot().unwrap(), slot);

    let save = loaded.save_layout(slot).unwrap();
    assert!(save.is_read());
    assert_eq!(save.save_type(), save_type);
    assert_eq!(save.num_zones(), 2);
    assert_eq!(save.state_buffer(), Some(&b"index state"[..]));
    assert_eq!(save.save_data(), written.save_data());
    assert_eq!(save.regions(), written.regions());
    assert_eq!(save.open_chapter().is_some(), save_type == SaveType::Save);
}

#[test]
fn test_save_invalid_under_other_nonce() {
    let (_, _, mut layout) = create_layout();
    let slot = commit_save(&mut layout, SaveType::Save, b"state");
    let save = layout.save_layout(slot).unwrap();
    assert!(save.is_valid(layout.volume_nonce()));
    assert!(!save.is_valid(layout.volume_nonce() ^ 1));
}

#[rstest::rstest]
#[case::timestamp_low(0)]
#[case::timestamp_high(7)]
#[case::nonce_low(8)]
#[case::nonce_high(15)]
#[case::version_low(16)]
#[case::version_high(19)]
fn test_tampered_save_data_fails_validation(#[case] byte: usize) {
    let (_, io, mut layout) = create_layout();
    let slot = commit_save(&mut layout, SaveType::Save, b"state");
    let block = layout.save_layout(slot).unwrap().container().start_block;

    let mut expected = None;
    rewrite_table(&io, block, |_, payload| {
        payload[byte] ^= 0x01;
        expected = Some(decode_save_data(&payload[..SAVE_DATA_SIZE]).unwrap());
    });

    let loaded = IndexLayout::load(io, 0).unwrap();
    let save = loaded.save_layout(slot).unwrap();
    assert_eq!(Some(*save.save_data()), expected);
    assert!(!save.is_valid(loaded.volume_nonce()));
    let err = loaded.find_latest_save_slot().unwrap_err();
    assert_eq!(err.kind(), LayoutErrorKind::NotSaved);
}

#[test]
fn test_save_data_padding_is_corruption() {
    let (_, io, mut layout) = create_layout();
    let slot = commit_save(&mut layout, SaveType::Save, b"state");
    let block = layout.save_layout(slot).unwrap().container().start_block;

    rewrite_table(&io, block, |_, payload| payload[SAVE_DATA_SIZE - 1] ^= 0x01);

    let err = IndexLayout::load(io, 0).unwrap_err();
    assert_eq!(err.kind(), LayoutErrorKind::Corrupt);
}

#[test]
fn test_corrupt_state_leaves_slot_empty() {
    let (device, io, mut layout) = create_layout();
    let slot = commit_save(&mut layout, SaveType::Save, b"state");
    let block = layout.save_layout(slot).unwrap().container().start_block;

    // The state is the last byte of the header payload.
    let buffer = io.read_blocks(block, 1).unwrap();
    let (table, payload) = read_region_table(&buffer).unwrap();
    let last = block as usize * 4096 + table.encoded_len() + payload.len() - 1;
    device.with_contents(|data| data[last] ^= 0xFF);

    let loaded = IndexLayout::load(io, 0).unwrap();
    assert_eq!(loaded.save_layout(slot).unwrap().save_type(), SaveType::None);
    assert!(matches!(
        loaded.find_latest_save_slot(),
        Err(LayoutError::IndexNotSavedCleanly),
    ));
}

#[test]
fn test_implicit_free_space() {
    let (_, io, mut layout) = create_layout();
    let slot = commit_save(&mut layout, SaveType::Checkpoint, b"state");
    let written = layout.save_layout(slot).unwrap().clone();

    rewrite_table(&io, written.container().start_block, |table, _| {
        let free_space = table.regions.pop().unwrap();
        assert_eq!(free_space.kind, RegionKind::Scratch);
    });

    let loaded = IndexLayout::load(io, 0).unwrap();
    let save = loaded.save_layout(slot).unwrap();
    assert!(save.is_valid(loaded.volume_nonce()));
    assert_eq!(save.free_space(), written.free_space());
}

#[test]
fn test_open_chapter_must_match_save_type() {
    let (_, io, mut layout) = create_layout();
    let slot = commit_save(&mut layout, SaveType::Save, b"state");
    let block = layout.save_layout(slot).unwrap().container().start_block;

    rewrite_table(&io, block, |table, _| {
        table.header.table_type = TableType::Checkpoint;
    });

    let err = IndexLayout::load(io, 0).unwrap_err();
    assert!(matches!(err, LayoutError::BadLayout { context: "save slot", .. }));
}

#[test]
fn test_commit_without_state() {
    let (_, _, mut layout) = create_layout();
    let slot = layout.setup_save_slot(1, SaveType::Save).unwrap();
    let err = layout.commit_save(slot).unwrap_err();
    assert!(matches!(err, LayoutError::MissingStateBuffer(s) if s == slot));
}

#[test]
fn test_commit_unset_slot() {
    let (_, _, mut layout) = create_layout();
    layout.set_state_buffer(0, vec![1]).unwrap();
    let err = layout.commit_save(0).unwrap_err();
    assert_eq!(err.kind(), LayoutErrorKind::InvalidArgument);
}

#[test]
fn test_state_too_large_for_header() {
    let (_, _, mut layout) = create_layout();
    let slot = layout.setup_save_slot(1, SaveType::Save).unwrap();
    layout.set_state_buffer(slot, vec![7; 4096]).unwrap();
    let err = layout.commit_save(slot).unwrap_err();
    assert!(matches!(err, LayoutError::InvalidArgument(_)));
}

#[rstest::rstest]
#[case::no_zones(0, SaveType::Save)]
#[case::too_many_zones(17, SaveType::Save)]
#[case::zones_exceed_blocks(16, SaveType::Checkpoint)]
#[case::no_save_type(1, SaveType::None)]
fn test_setup_invalid_arguments(#[case] num_zones: u32, #[case] save_type: SaveType) {
    let (_, _, mut layout) = create_layout();
    let err = layout.setup_save_slot(num_zones, save_type).unwrap_err();
    assert_eq!(err.kind(), LayoutErrorKind::InvalidArgument);
}

#[test]
fn test_cancel_save() {
    let (_, io, mut layout) = create_layout();
    let slot = layout.setup_save_slot(2, SaveType::Save).unwrap();
    layout.cancel_save(slot).unwrap();
    assert_eq!(layout.save_layout(slot).unwrap().save_type(), SaveType::None);

    let loaded = IndexLayout::load(io, 0).unwrap();
    assert!(loaded.find_latest_save_slot().is_err());
}

#[test]
fn test_setup_invalidates_reused_slot() {
    let (_, io, mut layout) = create_layout();
    for n in 0..3 {
        commit_save(&mut layout, SaveType::Save, &[n]);
    }

    // Slot 0 is reused and persisted empty before the new save is written.
    let slot = layout.setup_save_slot(2, SaveType::Save).unwrap();
    assert_eq!(slot, 0);

    let loaded = IndexLayout::load(io, 0).unwrap();
    assert_eq!(loaded.save_layout(0).unwrap().save_type(), SaveType::None);
    assert_eq!(loaded.find_latest_save_slot().unwrap(), 2);
}

#[test]
fn test_discard_latest_save() {
    let (_, io, mut layout) = create_layout();
    commit_save(&mut layout, SaveType::Checkpoint, b"first");
    commit_save(&mut layout, SaveType::Checkpoint, b"second");

    layout.discard_saves(false).unwrap();
    assert_eq!(layout.select_latest_save().unwrap(), 0);

    let loaded = IndexLayout::load(io, 0).unwrap();
    assert_eq!(loaded.find_latest_save_slot().unwrap(), 0);
    assert_eq!(loaded.state_buffer(0).unwrap(), Some(&b"first"[..]));
}

#[test]
fn test_discard_all_saves() {
    let (_, io, mut layout) = create_layout();
    commit_save(&mut layout, SaveType::Checkpoint, b"first");
    commit_save(&mut layout, SaveType::Save, b"second");

    layout.discard_saves(true).unwrap();

    let mut loaded = IndexLayout::load(io, 0).unwrap();
    for slot in 0..loaded.num_saves() {
        assert_eq!(loaded.save_layout(slot).unwrap().save_type(), SaveType::None);
    }
    let err = loaded.discard_saves(false).unwrap_err();
    assert!(matches!(err, LayoutError::IndexNotSavedCleanly));
}

#[test]
fn test_save_region_io() {
    let (_, io, mut layout) = create_layout();
    let slot = layout.setup_save_slot(2, SaveType::Save).unwrap();

    let mut writer = layout
        .open_save_region_writer(slot, RegionKind::MasterIndex, 1)
        .unwrap();
    writer.write_all(b"zone one").unwrap();
    writer.flush().unwrap();
    layout.set_state_buffer(slot, vec![1]).unwrap();
    layout.commit_save(slot).unwrap();

    let loaded = IndexLayout::load(io, 0).unwrap();
    let mut reader = loaded
        .open_save_region_reader(slot, RegionKind::MasterIndex, 1)
        .unwrap();
    let mut buffer = [0; 8];
    reader.read_exact(&mut buffer).unwrap();
    assert_eq!(&buffer, b"zone one");

    let err = loaded
        .open_save_region_reader(slot, RegionKind::MasterIndex, 2)
        .err()
        .unwrap();
    assert_eq!(err.kind(), LayoutErrorKind::InvalidArgument);
}

#[test]
fn test_save_region_requires_save() {
    let (_, _, layout) = create_layout();
    let err = layout
        .save_region(0, RegionKind::IndexPageMap, SOLE_INSTANCE)
        .unwrap_err();
    assert_eq!(err.kind(), LayoutErrorKind::InvalidArgument);
}

#[test]
fn test_write_failure_propagates() {
    let _ = tracing_subscriber::fmt::try_init();

    let config = config();
    let size = compute_index_size(&config, 4096).unwrap();
    let device = Arc::new(MemoryDevice::with_fail_points(size as usize));
    let mut layout = IndexLayout::create(IoFactory::new(device), 0, size, &config).unwrap();

    let scenario = fail::FailScenario::setup();
    fail::cfg("storage::write_at", "return").unwrap();
    let err = layout.setup_save_slot(2, SaveType::Save).unwrap_err();
    assert_eq!(err.kind(), LayoutErrorKind::Io);
    scenario.teardown();
}

#[test]
fn test_read_failure_propagates() {
    let config = config();
    let size = compute_index_size(&config, 4096).unwrap();
    let device = Arc::new(MemoryDevice::with_fail_points(size as usize));
    let io = IoFactory::new(device);
    IndexLayout::create(io.clone(), 0, size, &config).unwrap();

    // The super block reads fine, the first save slot does not.
    let scenario = fail::FailScenario::setup();
    fail::cfg("storage::read_at", "1*off->return").unwrap();
    let err = IndexLayout::load(io, 0).unwrap_err();
    assert_eq!(err.kind(), LayoutErrorKind::Io);
    scenario.teardown();
}
