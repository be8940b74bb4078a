//! Persistent layout management for a deduplication index.
//!
//! An index lives in a contiguous, block aligned span of a device or file.
//! [IndexLayout] describes and persists every region of that span and
//! rotates the save slots index state is written to, while [Index] drives
//! the layout: committing chapters to the volume, saving and reloading
//! its state and giving up a chapter of the volume when space is needed.

pub mod geometry;
pub mod index;
pub mod index_layout;
pub mod layout;
pub mod nonce;
pub mod page_map;
pub mod storage;
mod utils;
pub mod volume;

pub use self::geometry::{Geometry, IndexConfig};
pub use self::index::{Index, IndexError};
pub use self::index_layout::{
    IndexLayout, LayoutError, LayoutErrorKind, SaveType, SharedIndexLayout, compute_index_size,
};
pub use self::storage::{BlockDevice, FileDevice, IoFactory, MemoryDevice};
