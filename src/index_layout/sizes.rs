use super::LayoutError;
use crate::geometry::{BYTES_PER_RECORD, IndexConfig, MAX_ZONES};
use crate::page_map::IndexPageMap;
use crate::utils::blocks_for;

/// The fixed bytes at the start of a saved open chapter.
pub const OPEN_CHAPTER_HEADER_SIZE: u64 = 12;
/// The fixed bytes each master index zone reserves for its own header.
pub const MASTER_INDEX_ZONE_OVERHEAD: u64 = 64;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
/// The block counts of every region in a layout.
pub struct SaveLayoutSizes {
    /// The number of save slots.
    pub num_saves: u32,
    pub block_size: usize,
    pub volume_blocks: u64,
    /// The blocks shared by all master index zones of a save.
    pub master_index_blocks: u64,
    pub page_map_blocks: u64,
    pub open_chapter_blocks: u64,
    /// The blocks of a single save slot.
    pub save_blocks: u64,
    /// The blocks of the sub-index: the volume and every save slot.
    pub sub_index_blocks: u64,
    /// The blocks of the whole layout.
    pub total_blocks: u64,
}

impl SaveLayoutSizes {
    /// Compute the sizes required to store an index with the given config.
    pub fn compute(config: &IndexConfig, block_size: usize) -> Result<Self, LayoutError> {
        config.validate()?;

        let geometry = &config.geometry;
        if geometry.bytes_per_page % block_size != 0 {
            return Err(LayoutError::InvalidArgument(format!(
                "page size {} is not a multiple of the block size {block_size}",
                geometry.bytes_per_page,
            )));
        }

        let volume_blocks = geometry.bytes_per_volume() / block_size as u64;
        let page_map_blocks =
            blocks_for(IndexPageMap::saved_size(geometry) as u64, block_size);
        let open_chapter_blocks = blocks_for(
            OPEN_CHAPTER_HEADER_SIZE + geometry.records_per_chapter() * BYTES_PER_RECORD as u64,
            block_size,
        );

        let bits_per_record = ceil_log2(config.master_index_mean_delta) as u64 + 3;
        let master_index_bytes = (geometry.records_per_volume() * bits_per_record).div_ceil(8)
            + MASTER_INDEX_ZONE_OVERHEAD * MAX_ZONES as u64;
        // Every zone needs at least a block of its own.
        let master_index_blocks =
            blocks_for(master_index_bytes, block_size).max(config.zone_count as u64);

        Ok(Self::from_parts(
            config.num_saves(),
            block_size,
            volume_blocks,
            master_index_blocks,
            page_map_blocks,
            open_chapter_blocks,
        ))
    }

    /// Derive the sizes from the block counts of each component.
    pub fn from_parts(
        num_saves: u32,
        block_size: usize,
        volume_blocks: u64,
        master_index_blocks: u64,
        page_map_blocks: u64,
        open_chapter_blocks: u64,
    ) -> Self {
        let save_blocks = 1 + master_index_blocks + page_map_blocks + open_chapter_blocks;
        let sub_index_blocks = volume_blocks + num_saves as u64 * save_blocks;
        // Header, config and seal.
        let total_blocks = 3 + sub_index_blocks;

        Self {
            num_saves,
            block_size,
            volume_blocks,
            master_index_blocks,
            page_map_blocks,
            open_chapter_blocks,
            save_blocks,
            sub_index_blocks,
            total_blocks,
        }
    }

    /// The same sizes with the volume reduced by `blocks`.
    pub(crate) fn shrink_volume(&self, blocks: u64) -> Self {
        Self::from_parts(
            self.num_saves,
            self.block_size,
            self.volume_blocks - blocks,
            self.master_index_blocks,
            self.page_map_blocks,
            self.open_chapter_blocks,
        )
    }

    #[inline]
    /// The size of the whole layout in bytes.
    pub fn total_bytes(&self) -> u64 {
        self.total_blocks * self.block_size as u64
    }
}

/// Compute the number of bytes required to store an index with the given config.
pub fn compute_index_size(config: &IndexConfig, block_size: usize) -> Result<u64, LayoutError> {
    SaveLayoutSizes::compute(config, block_size).map(|sizes| sizes.total_bytes())
}

fn ceil_log2(value: u32) -> u32 {
    u32::BITS - value.saturating_sub(1).leading_zeros()
}
