use std::sync::Arc;

use crate::geometry::{BYTES_PER_RECORD, Geometry, IndexConfig};
use crate::index::{Index, IndexError, Record};
use crate::index_layout::{LayoutError, SaveType, compute_index_size};
use crate::storage::{IoFactory, MemoryDevice};

mod shrink;

/// The page number of a chapter's first record page.
const FIRST_RECORD_PAGE: u32 = 2;

fn config(chapters: u32) -> IndexConfig {
    let geometry = Geometry::new(4096, 1, 2, chapters, 0, 0).unwrap();
    IndexConfig::new(geometry, 2, 1, 16).unwrap()
}

fn memory_io(config: &IndexConfig) -> (IoFactory, u64) {
    let size = compute_index_size(config, 4096).unwrap();
    let device = Arc::new(MemoryDevice::new(size as usize));
    (IoFactory::new(device), size)
}

/// Like [memory_io], with the device reads and writes passing through the
/// storage fail points.
fn fail_point_io(config: &IndexConfig) -> (IoFactory, u64) {
    let size = compute_index_size(config, 4096).unwrap();
    let device = Arc::new(MemoryDevice::with_fail_points(size as usize));
    (IoFactory::new(device), size)
}

/// A record tagged with the virtual chapter it is added to.
fn record(chapter: u64, n: u8) -> Record {
    let mut record = [n; BYTES_PER_RECORD];
    record[0] = chapter as u8 + 1;
    record
}

/// Add a few tagged records and commit the open chapter, `count` times.
fn commit_chapters(index: &mut Index, count: u64) {
    for _ in 0..count {
        let chapter = index.newest_virtual_chapter();
        for n in 0..3 {
            index.add_record(record(chapter, n)).unwrap();
        }
        index.commit_chapter().unwrap();
    }
}

/// Read back the tag of a committed virtual chapter.
fn chapter_tag(index: &Index, virtual_chapter: u64) -> u8 {
    let mut page = index.volume().initialize_page();
    index
        .volume()
        .read_chapter_page(virtual_chapter, FIRST_RECORD_PAGE, &mut page)
        .unwrap();
    page.data()[0]
}

fn assert_live_chapters_intact(index: &Index) {
    for chapter in index.oldest_virtual_chapter()..index.newest_virtual_chapter() {
        assert_eq!(
            chapter_tag(index, chapter),
            chapter as u8 + 1,
            "chapter {chapter} lost",
        );
    }
}
