use super::{IndexLayout, IndexSaveLayout, LayoutError, SaveLayoutSizes, SubIndexLayout};
use crate::geometry::IndexConfig;
use crate::layout::region::{REGION_HEADER_SIZE, REGION_SIZE, write_region_table};
use crate::layout::super_block::{
    MAGIC_LABEL, SUPER_BLOCK_DATA_SIZE, SUPER_VERSION_CURRENT, encode_super_block,
};
use crate::layout::{Region, RegionKind, RegionTable, SOLE_INSTANCE, SuperBlockData, TableType};
use crate::nonce;
use crate::storage::IoFactory;

/// The regions of the super block table besides the save slots.
const FIXED_SUPER_REGIONS: usize = 5;

impl IndexLayout {
    #[tracing::instrument("layout::create", skip_all, fields(offset = offset, size = size))]
    /// Create a new layout for `config` at the byte `offset`, using at most
    /// `size` bytes.
    ///
    /// Every save slot is written empty and the super block is written last.
    /// The config record is not written, see [IndexLayout::write_config].
    pub fn create(
        io: IoFactory,
        offset: u64,
        size: u64,
        config: &IndexConfig,
    ) -> Result<Self, LayoutError> {
        let sizes = SaveLayoutSizes::compute(config, io.block_size())?;
        let layout = Self::init_layout(io, offset, size, sizes)?;

        for slot in 0..layout.num_saves() {
            layout.write_save_header(slot)?;
        }
        layout.write_super_table()?;

        tracing::info!(
            total_blocks = layout.total_blocks(),
            num_saves = layout.num_saves(),
            "created index layout",
        );

        Ok(layout)
    }

    /// Lay out a new index from the computed sizes without writing anything.
    pub(crate) fn init_layout(
        io: IoFactory,
        offset: u64,
        size: u64,
        sizes: SaveLayoutSizes,
    ) -> Result<Self, LayoutError> {
        let block_size = io.block_size();
        if sizes.block_size != block_size {
            return Err(LayoutError::InvalidArgument(format!(
                "sizes computed for block size {} but storage uses {block_size}",
                sizes.block_size,
            )));
        }
        if offset % block_size as u64 != 0 {
            return Err(LayoutError::InvalidArgument(format!(
                "offset {offset} is not aligned to the block size {block_size}",
            )));
        }

        let table_len = REGION_HEADER_SIZE
            + (FIXED_SUPER_REGIONS + sizes.num_saves as usize) * REGION_SIZE
            + SUPER_BLOCK_DATA_SIZE;
        if table_len > block_size || sizes.num_saves > u16::MAX as u32 {
            return Err(LayoutError::InvalidArgument(format!(
                "{} save slots do not fit in the super block",
                sizes.num_saves,
            )));
        }

        let required = sizes.total_bytes();
        if required > size {
            return Err(LayoutError::InsufficientIndexSpace {
                required,
                available: size,
            });
        }
        let available = io.device_size()?.saturating_sub(offset);
        if required > available {
            return Err(LayoutError::InsufficientIndexSpace {
                required,
                available,
            });
        }

        let nonce_info = nonce::create_nonce_info();
        let super_block = SuperBlockData {
            magic_label: *MAGIC_LABEL,
            nonce_info,
            nonce: nonce::master_nonce(&nonce_info),
            version: SUPER_VERSION_CURRENT,
            block_size: block_size as u32,
            num_indexes: 1,
            max_saves: sizes.num_saves as u16,
            open_chapter_blocks: sizes.open_chapter_blocks,
            page_map_blocks: sizes.page_map_blocks,
        };

        Ok(Self::build(io, offset, sizes, super_block))
    }

    /// Lay the regions out contiguously from `offset`.
    ///
    /// Every save slot starts empty.
    pub(super) fn build(
        io: IoFactory,
        offset: u64,
        sizes: SaveLayoutSizes,
        super_block: SuperBlockData,
    ) -> Self {
        let mut next_block = offset / io.block_size() as u64;

        let header = Region::new(next_block, 1, RegionKind::Header, SOLE_INSTANCE);
        next_block += 1;
        let config = Region::new(next_block, 1, RegionKind::Config, SOLE_INSTANCE);
        next_block += 1;

        let container =
            Region::new(next_block, sizes.sub_index_blocks, RegionKind::Index, 0);
        let volume = Region::new(next_block, sizes.volume_blocks, RegionKind::Volume, 0);
        next_block += sizes.volume_blocks;

        let mut saves = Vec::with_capacity(sizes.num_saves as usize);
        for slot in 0..sizes.num_saves as u16 {
            let save_container =
                Region::new(next_block, sizes.save_blocks, RegionKind::Save, slot);
            saves.push(IndexSaveLayout::new_empty(slot, save_container, &sizes));
            next_block += sizes.save_blocks;
        }
        debug_assert_eq!(next_block, container.end_block());

        let seal = Region::new(next_block, 1, RegionKind::Seal, SOLE_INSTANCE);
        let nonce = nonce::sub_index_nonce(super_block.nonce, container.start_block, 0);

        Self {
            io,
            offset,
            sizes,
            super_block,
            header,
            config,
            index: SubIndexLayout {
                container,
                nonce,
                volume,
                saves,
            },
            seal,
        }
    }

    /// Write the super block region table to the header block.
    pub(super) fn write_super_table(&self) -> Result<(), LayoutError> {
        let table = RegionTable::new(
            TableType::Super,
            self.total_blocks(),
            self.regions(),
            SUPER_BLOCK_DATA_SIZE as u16,
        );

        let mut payload = Vec::with_capacity(SUPER_BLOCK_DATA_SIZE);
        encode_super_block(&self.super_block, &mut payload)?;

        let mut buffer = Vec::with_capacity(self.block_size());
        write_region_table(&table, &payload, &mut buffer)?;
        self.io.write_blocks(self.header.start_block, &buffer)?;

        tracing::debug!(block = self.header.start_block, "wrote super block");
        Ok(())
    }

    #[tracing::instrument("layout::update", skip_all, fields(reclaimed_bytes = reclaimed_bytes))]
    /// Rebuild the layout with `reclaimed_bytes` removed from the front of
    /// the volume and persist it.
    ///
    /// The layout moves forward by `reclaimed_bytes`, the save slots keep
    /// their position on the device. The sub-index nonce changes with the
    /// container position so every slot is rewritten empty. The updated
    /// `config` is written before the super block, which is written last.
    /// The in-memory layout is only replaced once every write succeeded.
    pub(crate) fn update_layout(
        &mut self,
        config: &IndexConfig,
        reclaimed_bytes: u64,
    ) -> Result<(), LayoutError> {
        let block_size = self.block_size() as u64;
        if reclaimed_bytes == 0 || reclaimed_bytes % block_size != 0 {
            return Err(LayoutError::InvalidArgument(format!(
                "cannot reclaim {reclaimed_bytes} bytes in blocks of {block_size}",
            )));
        }
        let reclaimed_blocks = reclaimed_bytes / block_size;
        if reclaimed_blocks >= self.sizes.volume_blocks {
            return Err(LayoutError::InvalidArgument(format!(
                "cannot reclaim {reclaimed_blocks} blocks from a volume of {}",
                self.sizes.volume_blocks,
            )));
        }

        let sizes = self.sizes.shrink_volume(reclaimed_blocks);
        let updated = Self::build(
            self.io.clone(),
            self.offset + reclaimed_bytes,
            sizes,
            self.super_block,
        );
        debug_assert!(
            updated
                .index
                .saves
                .iter()
                .zip(self.index.saves.iter())
                .all(|(new, old)| new.container() == old.container())
        );

        for slot in 0..updated.num_saves() {
            updated.write_save_header(slot)?;
        }
        updated.write_config(config)?;
        updated.write_super_table()?;
        *self = updated;

        tracing::info!(
            offset = self.offset,
            volume_blocks = self.sizes.volume_blocks,
            "updated index layout",
        );

        Ok(())
    }
}
