use std::sync::Arc;

use crate::geometry::{Geometry, IndexConfig};
use crate::index_layout::{IndexLayout, compute_index_size};
use crate::layout::RegionTable;
use crate::layout::region::{read_region_table, write_region_table};
use crate::storage::{IoFactory, MemoryDevice};

mod save_slot;

fn config() -> IndexConfig {
    let geometry = Geometry::new(4096, 2, 2, 4, 0, 0).unwrap();
    IndexConfig::new(geometry, 2, 1, 32).unwrap()
}

/// A device sized for `config` with `extra` bytes of headroom.
fn memory_io(config: &IndexConfig, extra: u64) -> (Arc<MemoryDevice>, IoFactory, u64) {
    let size = compute_index_size(config, 4096).unwrap();
    let device = Arc::new(MemoryDevice::new((size + extra) as usize));
    let io = IoFactory::new(device.clone());
    (device, io, size)
}

fn create_layout() -> (Arc<MemoryDevice>, IoFactory, IndexLayout) {
    let config = config();
    let (device, io, size) = memory_io(&config, 0);
    let layout = IndexLayout::create(io.clone(), 0, size, &config).unwrap();
    layout.write_config(&config).unwrap();
    (device, io, layout)
}

/// Decode the region table at `block`, let `mutate` change it, and write it
/// back along with its payload.
fn rewrite_table(
    io: &IoFactory,
    block: u64,
    mutate: impl FnOnce(&mut RegionTable, &mut Vec<u8>),
) {
    let buffer = io.read_blocks(block, 1).unwrap();
    let (mut table, payload) = read_region_table(&buffer).unwrap();
    let mut payload = payload.to_vec();
    mutate(&mut table, &mut payload);

    let table = RegionTable::new(
        table.header.table_type,
        table.header.region_blocks,
        table.regions,
        payload.len() as u16,
    );
    let mut encoded = Vec::new();
    write_region_table(&table, &payload, &mut encoded).unwrap();
    io.write_blocks(block, &encoded).unwrap();
}
