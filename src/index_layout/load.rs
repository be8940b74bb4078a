use super::iterator::RegionIterator;
use super::{IndexLayout, LayoutError, SaveLayoutSizes};
use crate::layout::codec::DecodeError;
use crate::layout::region::read_region_table;
use crate::layout::super_block::{
    MAGIC_LABEL, SUPER_BLOCK_DATA_SIZE, SUPER_VERSION_MAXIMUM, SUPER_VERSION_MINIMUM,
    decode_super_block,
};
use crate::layout::{RegionKind, SOLE_INSTANCE, SuperBlockData, TableType};
use crate::nonce;
use crate::storage::IoFactory;

impl IndexLayout {
    #[tracing::instrument("layout::load", skip_all, fields(offset = offset))]
    /// Reconstruct the layout stored at the byte `offset`.
    ///
    /// The super block table must describe exactly the layout this system
    /// would have created for the stored sizes, and every save slot must be
    /// readable. Slots whose save fails verification are loaded empty.
    pub fn load(io: IoFactory, offset: u64) -> Result<Self, LayoutError> {
        let block_size = io.block_size();
        if offset % block_size as u64 != 0 {
            return Err(LayoutError::InvalidArgument(format!(
                "offset {offset} is not aligned to the block size {block_size}",
            )));
        }

        let start_block = offset / block_size as u64;
        let block = io.read_blocks(start_block, 1)?;
        let (table, payload) = match read_region_table(&block) {
            Ok(result) => result,
            Err(DecodeError::BadMagic(_)) => {
                tracing::info!("no index layout found");
                return Err(LayoutError::NoIndex { offset });
            },
            Err(source) => {
                return Err(LayoutError::Decode {
                    what: "super block table",
                    source,
                });
            },
        };

        if table.header.table_type != TableType::Super {
            return Err(LayoutError::Corrupt(format!(
                "expected super block table but found {:?}",
                table.header.table_type,
            )));
        }
        if payload.len() != SUPER_BLOCK_DATA_SIZE {
            return Err(LayoutError::Corrupt(format!(
                "super block payload is {} bytes",
                payload.len(),
            )));
        }

        let super_block =
            decode_super_block(payload).map_err(|source| LayoutError::Decode {
                what: "super block",
                source,
            })?;
        verify_super_block(&super_block, block_size)?;

        let sizes = reconstruct_sizes(&table.regions, start_block, &super_block, block_size)?;
        if sizes.total_blocks != table.header.region_blocks {
            return Err(LayoutError::BadLayout {
                context: "super block",
                reason: format!(
                    "table covers {} blocks but its regions cover {}",
                    table.header.region_blocks, sizes.total_blocks,
                ),
            });
        }

        let mut layout = Self::build(io, offset, sizes, super_block);
        if layout.regions() != table.regions {
            tracing::error!("super block regions do not match the stored sizes");
            return Err(LayoutError::BadLayout {
                context: "super block",
                reason: "regions do not match the stored sizes".to_string(),
            });
        }

        for slot in 0..layout.num_saves() {
            let start_block = layout.index.saves[slot].container().start_block;
            let block = layout.io.read_blocks(start_block, 1)?;
            layout.index.saves[slot].load_header(&block, &sizes)?;
        }

        tracing::info!(
            total_blocks = layout.total_blocks(),
            num_saves = layout.num_saves(),
            "loaded index layout",
        );

        Ok(layout)
    }
}

fn verify_super_block(super_block: &SuperBlockData, block_size: usize) -> Result<(), LayoutError> {
    if super_block.block_size as usize != block_size {
        return Err(LayoutError::WrongIndexConfig(format!(
            "layout uses block size {} but storage uses {block_size}",
            super_block.block_size,
        )));
    }

    if super_block.magic_label != *MAGIC_LABEL {
        tracing::error!("super block magic label mismatch");
        return Err(LayoutError::Corrupt("super block magic label mismatch".to_string()));
    }
    if super_block.nonce != nonce::master_nonce(&super_block.nonce_info) {
        tracing::error!("super block nonce mismatch");
        return Err(LayoutError::Corrupt("super block nonce mismatch".to_string()));
    }

    if !(SUPER_VERSION_MINIMUM..=SUPER_VERSION_MAXIMUM).contains(&super_block.version) {
        return Err(LayoutError::UnsupportedVersion(super_block.version));
    }
    if super_block.num_indexes != 1 {
        return Err(LayoutError::Corrupt(format!(
            "super block lists {} sub-indexes",
            super_block.num_indexes,
        )));
    }
    if super_block.max_saves < 2 {
        return Err(LayoutError::Corrupt(format!(
            "super block lists {} save slots",
            super_block.max_saves,
        )));
    }

    Ok(())
}

/// Walk the super block regions and recover the sizes they were laid out with.
fn reconstruct_sizes(
    regions: &[crate::layout::Region],
    start_block: u64,
    super_block: &SuperBlockData,
    block_size: usize,
) -> Result<SaveLayoutSizes, LayoutError> {
    let mut iter = RegionIterator::new(regions, start_block, "super block");

    iter.expect_region(RegionKind::Header, SOLE_INSTANCE, Some(1))?;
    iter.expect_region(RegionKind::Config, SOLE_INSTANCE, Some(1))?;

    let container = iter.expect_container(RegionKind::Index, 0)?;
    let volume = iter.expect_region(RegionKind::Volume, 0, None)?;

    let first_save = iter.expect_region(RegionKind::Save, 0, None)?;
    let save_blocks = first_save.num_blocks;
    for slot in 1..super_block.max_saves {
        iter.expect_region(RegionKind::Save, slot, Some(save_blocks))?;
    }
    iter.finish_container(&container)?;

    let seal = iter.expect_region(RegionKind::Seal, SOLE_INSTANCE, Some(1))?;
    iter.finish(seal.end_block())?;

    let master_index_blocks = save_blocks
        .checked_sub(1 + super_block.page_map_blocks + super_block.open_chapter_blocks)
        .filter(|blocks| *blocks > 0)
        .ok_or_else(|| LayoutError::BadLayout {
            context: "super block",
            reason: format!("save slots of {save_blocks} blocks are too small"),
        })?;

    Ok(SaveLayoutSizes::from_parts(
        super_block.max_saves as u32,
        block_size,
        volume.num_blocks,
        master_index_blocks,
        super_block.page_map_blocks,
        super_block.open_chapter_blocks,
    ))
}
