use super::*;
use crate::index_layout::LayoutErrorKind;

fn index_with_chapters(chapters: u32, committed: u64) -> (Index, IoFactory, IndexConfig) {
    let config = config(chapters);
    let (io, size) = memory_io(&config);
    let mut index = Index::create(io.clone(), 0, size, &config).unwrap();
    commit_chapters(&mut index, committed);
    (index, io, config)
}

fn fail_point_index(chapters: u32, committed: u64) -> (Index, IoFactory, IndexConfig) {
    let config = config(chapters);
    let (io, size) = fail_point_io(&config);
    let mut index = Index::create(io.clone(), 0, size, &config).unwrap();
    commit_chapters(&mut index, committed);
    (index, io, config)
}

/// Every page of a committed virtual chapter.
fn chapter_pages(index: &Index, virtual_chapter: u64) -> Vec<Vec<u8>> {
    let mut page = index.volume().initialize_page();
    (0..index.config().geometry.pages_per_chapter())
        .map(|page_number| {
            index
                .volume()
                .read_chapter_page(virtual_chapter, page_number, &mut page)
                .unwrap();
            page.data().to_vec()
        })
        .collect()
}

fn assert_geometry_unchanged(index: &Index, chapters: u32) {
    let geometry = index.config().geometry;
    assert_eq!(geometry.chapters_per_volume, chapters);
    assert!(!geometry.is_reduced());
    assert_eq!(index.volume().geometry(), &geometry);
    assert_eq!(index.page_map().geometry(), &geometry);
    assert_eq!(
        index.page_map().entries().len(),
        chapters as usize * index.page_map().entries_per_chapter(),
    );
}

/// Keep using an index after a failed shrink, then shrink it for real.
fn assert_usable_after_failed_shrink(mut index: Index, io: IoFactory, config: &IndexConfig) {
    commit_chapters(&mut index, 3);
    assert_live_chapters_intact(&index);

    let reclaimed = index.shrink_by_one_chapter().unwrap();
    assert_eq!(index.config().geometry.chapters_per_volume, 4);
    assert_live_chapters_intact(&index);
    commit_chapters(&mut index, 2);
    assert_live_chapters_intact(&index);
    index.save(SaveType::Save).unwrap();

    let loaded = Index::load(io, reclaimed, config).unwrap();
    assert_eq!(loaded.newest_virtual_chapter(), index.newest_virtual_chapter());
    assert_live_chapters_intact(&loaded);
}

#[rstest::rstest]
#[case::first_read_fails("storage::read_at", "return")]
#[case::second_read_fails("storage::read_at", "1*off->return")]
#[case::first_write_fails("storage::write_at", "return")]
#[case::second_write_fails("storage::write_at", "1*off->return")]
fn test_failed_chapter_copy_keeps_index(#[case] fail_point: &str, #[case] actions: &str) {
    let _ = tracing_subscriber::fmt::try_init();

    let (mut index, io, config) = fail_point_index(5, 2);
    let layout_offset = index.layout().lock().offset();

    let scenario = fail::FailScenario::setup();
    fail::cfg(fail_point, actions).unwrap();
    let err = index.shrink_by_one_chapter().unwrap_err();
    assert!(matches!(err, IndexError::Volume(_)), "unexpected error: {err}");
    fail::cfg(fail_point, "off").unwrap();

    assert_geometry_unchanged(&index, 5);
    assert_eq!(index.layout().lock().offset(), layout_offset);
    assert_eq!(index.oldest_virtual_chapter(), 0);
    assert_eq!(index.newest_virtual_chapter(), 2);
    assert_live_chapters_intact(&index);

    assert_usable_after_failed_shrink(index, io, &config);
    scenario.teardown();
}

#[rstest::rstest]
#[case::first_save_header_without_copy(4, 0)]
#[case::config_without_copy(4, 3)]
#[case::super_table_without_copy(4, 4)]
#[case::first_save_header_after_copy(2, 3)]
#[case::config_after_copy(2, 6)]
#[case::super_table_after_copy(2, 7)]
fn test_failed_layout_update_keeps_index(
    #[case] committed: u64,
    #[case] writes_before_failure: usize,
) {
    let _ = tracing_subscriber::fmt::try_init();

    let (mut index, io, config) = fail_point_index(5, committed);
    let oldest_chapter = chapter_pages(&index, 0);

    let scenario = fail::FailScenario::setup();
    let actions = if writes_before_failure == 0 {
        "1*return->off".to_string()
    } else {
        format!("{writes_before_failure}*off->1*return->off")
    };
    fail::cfg("storage::write_at", &actions).unwrap();
    let err = index.shrink_by_one_chapter().unwrap_err();
    match err {
        IndexError::Layout(err) => assert_eq!(err.kind(), LayoutErrorKind::Io),
        other => panic!("unexpected error: {other}"),
    }

    assert_geometry_unchanged(&index, 5);
    assert_eq!(index.layout().lock().offset(), 0);
    assert!(index.need_to_save());
    assert_eq!(index.newest_virtual_chapter(), committed);
    assert_live_chapters_intact(&index);
    if index.oldest_virtual_chapter() == 0 {
        assert_eq!(chapter_pages(&index, 0), oldest_chapter);
    }

    // The old layout is still the one on disk.
    index.save(SaveType::Save).unwrap();
    let loaded = Index::load(io.clone(), 0, &config).unwrap();
    assert_eq!(loaded.config(), index.config());
    assert_eq!(loaded.oldest_virtual_chapter(), index.oldest_virtual_chapter());
    assert_live_chapters_intact(&loaded);

    assert_usable_after_failed_shrink(index, io, &config);
    scenario.teardown();
}

#[rstest::rstest]
fn test_shrink_geometry(#[values(0, 1, 3, 4, 5, 7, 9, 12)] committed: u64) {
    let (mut index, _, _) = index_with_chapters(5, committed);
    let newest = index.newest_virtual_chapter();

    let reclaimed = index.shrink_by_one_chapter().unwrap();
    // One record page and two index pages.
    assert_eq!(reclaimed, 3 * 4096);

    let geometry = index.config().geometry;
    assert_eq!(geometry.chapters_per_volume, 4);
    assert_eq!(index.volume().geometry(), &geometry);
    assert_eq!(index.page_map().geometry(), &geometry);
    assert!(index.need_to_save());

    let next_physical = (newest + 1) % 5;
    if next_physical == 0 {
        assert_eq!(geometry.remapped_virtual, newest - newest % 5 + 5);
        assert_eq!(geometry.remapped_physical, 0);
    } else {
        assert_eq!(geometry.remapped_virtual, newest - newest % 5);
        assert_eq!(geometry.remapped_physical, next_physical - 1);
    }
}

#[test]
fn test_shrink_full_index_expires_oldest() {
    let (mut index, _, _) = index_with_chapters(5, 4);
    assert_eq!(index.oldest_virtual_chapter(), 0);
    assert_eq!(index.newest_virtual_chapter(), 4);

    index.shrink_by_one_chapter().unwrap();
    assert_eq!(index.oldest_virtual_chapter(), 1);
    assert_eq!(index.newest_virtual_chapter(), 4);
}

#[test]
fn test_shrink_keeps_partial_index() {
    let (mut index, _, _) = index_with_chapters(5, 2);
    index.shrink_by_one_chapter().unwrap();
    assert_eq!(index.oldest_virtual_chapter(), 0);
    assert_eq!(index.newest_virtual_chapter(), 2);
}

#[rstest::rstest]
fn test_shrink_preserves_live_chapters(#[values(1, 3, 4, 5, 7, 9, 12)] committed: u64) {
    let _ = tracing_subscriber::fmt::try_init();

    let (mut index, _, _) = index_with_chapters(5, committed);
    assert_live_chapters_intact(&index);

    index.shrink_by_one_chapter().unwrap();
    assert_live_chapters_intact(&index);

    // New chapters only ever overwrite the chapter they expire.
    for _ in 0..9 {
        commit_chapters(&mut index, 1);
        assert_live_chapters_intact(&index);
    }
}

#[test]
fn test_shrink_moves_layout() {
    let (mut index, _, _) = index_with_chapters(4, 2);
    let layout = index.layout();
    let (offset, volume, saves) = {
        let layout = layout.lock();
        let saves: Vec<_> = (0..layout.num_saves())
            .map(|slot| layout.save_layout(slot).unwrap().container())
            .collect();
        (layout.offset(), layout.volume_region(), saves)
    };

    let reclaimed = index.shrink_by_one_chapter().unwrap();

    let layout = layout.lock();
    assert_eq!(layout.offset(), offset + reclaimed);
    let reduced_volume = layout.volume_region();
    assert_eq!(reduced_volume.start_block, volume.start_block + 3);
    assert_eq!(reduced_volume.end_block(), volume.end_block());
    for (slot, container) in saves.into_iter().enumerate() {
        assert_eq!(layout.save_layout(slot).unwrap().container(), container);
    }
}

#[test]
fn test_shrink_invalidates_saves() {
    let (mut index, io, config) = index_with_chapters(4, 2);
    index.save(SaveType::Save).unwrap();

    let reclaimed = index.shrink_by_one_chapter().unwrap();

    let err = Index::load(io.clone(), reclaimed, &config).err().unwrap();
    assert!(matches!(
        err,
        IndexError::Layout(LayoutError::IndexNotSavedCleanly),
    ));
    // The old super block is left behind but its saves no longer validate.
    let err = Index::load(io, 0, &config).err().unwrap();
    assert!(matches!(
        err,
        IndexError::Layout(LayoutError::IndexNotSavedCleanly),
    ));
}

#[rstest::rstest]
fn test_reload_after_shrink(#[values(2, 5, 7)] committed: u64) {
    let _ = tracing_subscriber::fmt::try_init();

    let (mut index, io, config) = index_with_chapters(4, committed);
    index.add_record(record(committed, 9)).unwrap();

    let reclaimed = index.shrink_by_one_chapter().unwrap();
    index.save(SaveType::Save).unwrap();

    let loaded = Index::load(io, reclaimed, &config).unwrap();
    assert_eq!(loaded.config(), index.config());
    assert!(loaded.config().geometry.is_reduced());
    assert_eq!(loaded.oldest_virtual_chapter(), index.oldest_virtual_chapter());
    assert_eq!(loaded.newest_virtual_chapter(), index.newest_virtual_chapter());
    assert_eq!(loaded.open_chapter(), index.open_chapter());
    assert_eq!(loaded.page_map(), index.page_map());
    assert_live_chapters_intact(&loaded);
}

#[rstest::rstest]
fn test_shrink_twice_rejected(#[values(0, 3)] committed: u64) {
    let (mut index, _, _) = index_with_chapters(5, committed);
    index.shrink_by_one_chapter().unwrap();

    let err = index.shrink_by_one_chapter().unwrap_err();
    assert!(matches!(err, IndexError::AlreadyReduced));
    assert_eq!(index.config().geometry.chapters_per_volume, 4);
}

#[test]
fn test_shrink_after_reload_rejected() {
    let (mut index, io, config) = index_with_chapters(4, 3);
    let reclaimed = index.shrink_by_one_chapter().unwrap();
    index.save(SaveType::Checkpoint).unwrap();

    let mut loaded = Index::load(io, reclaimed, &config).unwrap();
    let err = loaded.shrink_by_one_chapter().unwrap_err();
    assert!(matches!(err, IndexError::AlreadyReduced));
}

#[test]
fn test_shrink_volume_too_small() {
    let (mut index, _, _) = index_with_chapters(2, 1);
    let err = index.shrink_by_one_chapter().unwrap_err();
    assert!(matches!(err, IndexError::VolumeTooSmall(2)));
    assert_eq!(index.config().geometry.chapters_per_volume, 2);
}
