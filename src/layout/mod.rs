//! On-disk records making up the index layout.
//!
//! The layout is a contiguous, block aligned run of regions starting at the
//! index offset:
//!
//! - Header
//!     * 1 block holding the super block region table followed by the
//!       [super_block::SuperBlockData] payload.
//! - Config
//!     * 1 block holding the stored configuration record.
//! - Sub-index
//!     * A container spanning the chapter volume and every save slot.
//!     * Volume
//!         - The chapter pages, prefixed by a single volume header page.
//!     * Save slots
//!         - Each slot starts with a header block holding its own region table,
//!           the [save_data::IndexSaveData] and the saved index state.
//!         - The rest of the slot holds the saved page map, one region per
//!           master index zone, an optional open chapter and free space.
//! - Seal
//!     * 1 trailing block.
//!
//! Every multi-byte integer is little-endian.

pub mod codec;
pub mod config_record;
pub mod integrity;
pub mod region;
pub mod save_data;
pub mod super_block;
#[cfg(test)]
mod tests;

pub use self::region::{Region, RegionKind, RegionTable, SOLE_INSTANCE, TableType};
pub use self::save_data::IndexSaveData;
pub use self::super_block::SuperBlockData;
