//! The persistent layout of a dedupe index on a block device.
//!
//! An [IndexLayout] describes every region of the index, it is created
//! fresh for a new index or reconstructed from the super block region table
//! of an existing one. It owns the rotating save slots and is shared with
//! the volume through a [SharedIndexLayout].

use std::io;
use std::sync::Arc;

use crate::geometry::{GeometryError, IndexConfig};
use crate::layout::codec::{DecodeError, EncodeError};
use crate::layout::{Region, SuperBlockData, config_record};
use crate::storage::{IoFactory, RegionReader, RegionWriter};

mod create;
mod iterator;
mod load;
mod save_slot;
mod sizes;
#[cfg(test)]
mod tests;

pub use self::save_slot::{IndexSaveLayout, SaveType};
pub use self::sizes::{
    MASTER_INDEX_ZONE_OVERHEAD, OPEN_CHAPTER_HEADER_SIZE, SaveLayoutSizes, compute_index_size,
};

/// A layout shared between the index and the components reading its regions.
///
/// The storage handle and every region are released with the last reference.
pub type SharedIndexLayout = Arc<parking_lot::Mutex<IndexLayout>>;

#[derive(Debug, thiserror::Error)]
/// An error preventing the layout from being created, loaded or updated.
pub enum LayoutError {
    #[error(transparent)]
    /// An IO error occurred.
    Io(#[from] io::Error),
    #[error("no index layout found at offset {offset}")]
    /// The super block region table is missing its magic value.
    NoIndex {
        /// The byte offset the layout was expected at.
        offset: u64,
    },
    #[error("index layout corrupt: {0}")]
    /// A persisted record failed verification.
    Corrupt(String),
    #[error("failed to decode {what}: {source}")]
    /// A fixed-width record could not be decoded.
    Decode {
        /// The record being decoded.
        what: &'static str,
        #[source]
        source: DecodeError,
    },
    #[error("bad {context} layout: {reason}")]
    /// A region table does not have the expected shape.
    BadLayout {
        /// The table being walked.
        context: &'static str,
        /// The first mismatch found.
        reason: String,
    },
    #[error("wrong index config: {0}")]
    /// The stored layout or config does not match what the caller expects.
    WrongIndexConfig(String),
    #[error("unsupported super block version {0}")]
    /// The super block version is outside the supported range.
    UnsupportedVersion(u32),
    #[error("index requires {required} bytes but only {available} are available")]
    /// The layout does not fit in the space it was given.
    InsufficientIndexSpace {
        /// The number of bytes the layout requires.
        required: u64,
        /// The number of bytes available.
        available: u64,
    },
    #[error("index was not saved cleanly, no valid save slot found")]
    /// No save slot holds a valid save.
    IndexNotSavedCleanly,
    #[error("save slot {0} has no index state to commit")]
    /// A save slot was committed before its state was set.
    MissingStateBuffer(usize),
    #[error("invalid argument: {0}")]
    /// The caller passed a value outside its valid range.
    InvalidArgument(String),
    #[error(transparent)]
    /// A fixed-width record could not be encoded.
    Encode(#[from] EncodeError),
    #[error(transparent)]
    /// The config record could not be encoded.
    ConfigEncode(#[from] config_record::EncodeError),
    #[error(transparent)]
    /// The config record could not be decoded.
    ConfigDecode(#[from] config_record::DecodeError),
    #[error(transparent)]
    /// The config is invalid.
    Geometry(#[from] GeometryError),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
/// The category of a [LayoutError], as reported to operators.
pub enum LayoutErrorKind {
    /// There is no index at the location, a new one can be formatted.
    NoIndex,
    /// The index exists but is damaged.
    Corrupt,
    /// The index does not match the requested configuration or device.
    WrongConfig,
    /// The index was not saved before it was last closed.
    NotSaved,
    /// The storage failed.
    Io,
    /// The caller passed an invalid argument.
    InvalidArgument,
}

impl LayoutError {
    /// Classify the error.
    pub fn kind(&self) -> LayoutErrorKind {
        match self {
            LayoutError::Io(_) => LayoutErrorKind::Io,
            LayoutError::NoIndex { .. } => LayoutErrorKind::NoIndex,
            LayoutError::Corrupt(_)
            | LayoutError::Decode { .. }
            | LayoutError::BadLayout { .. }
            | LayoutError::ConfigDecode(_) => LayoutErrorKind::Corrupt,
            LayoutError::WrongIndexConfig(_)
            | LayoutError::UnsupportedVersion(_)
            | LayoutError::InsufficientIndexSpace { .. } => LayoutErrorKind::WrongConfig,
            LayoutError::IndexNotSavedCleanly => LayoutErrorKind::NotSaved,
            LayoutError::MissingStateBuffer(_)
            | LayoutError::InvalidArgument(_)
            | LayoutError::Encode(_)
            | LayoutError::ConfigEncode(_)
            | LayoutError::Geometry(_) => LayoutErrorKind::InvalidArgument,
        }
    }
}

#[derive(Debug)]
/// The sub-index: the chapter volume and its save slots.
pub struct SubIndexLayout {
    container: Region,
    nonce: u64,
    volume: Region,
    saves: Vec<IndexSaveLayout>,
}

impl SubIndexLayout {
    #[inline]
    /// The region spanning the volume and every save slot.
    pub fn container(&self) -> Region {
        self.container
    }

    #[inline]
    /// The nonce every save of this sub-index is derived from.
    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    #[inline]
    pub fn volume(&self) -> Region {
        self.volume
    }

    #[inline]
    pub fn saves(&self) -> &[IndexSaveLayout] {
        &self.saves
    }
}

#[derive(Debug)]
/// The in-memory description of every region of an index.
pub struct IndexLayout {
    io: IoFactory,
    offset: u64,
    sizes: SaveLayoutSizes,
    super_block: SuperBlockData,
    header: Region,
    config: Region,
    index: SubIndexLayout,
    seal: Region,
}

impl IndexLayout {
    /// Wrap the layout so it can be shared with the volume.
    pub fn into_shared(self) -> SharedIndexLayout {
        Arc::new(parking_lot::Mutex::new(self))
    }

    #[inline]
    /// The storage the layout lives on.
    pub fn io(&self) -> &IoFactory {
        &self.io
    }

    #[inline]
    /// The byte offset of the first block of the layout.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    #[inline]
    pub fn block_size(&self) -> usize {
        self.io.block_size()
    }

    #[inline]
    pub fn sizes(&self) -> &SaveLayoutSizes {
        &self.sizes
    }

    #[inline]
    pub fn total_blocks(&self) -> u64 {
        self.sizes.total_blocks
    }

    #[inline]
    pub fn super_block(&self) -> &SuperBlockData {
        &self.super_block
    }

    #[inline]
    pub fn header(&self) -> Region {
        self.header
    }

    #[inline]
    pub fn config_region(&self) -> Region {
        self.config
    }

    #[inline]
    pub fn seal(&self) -> Region {
        self.seal
    }

    #[inline]
    pub fn sub_index(&self) -> &SubIndexLayout {
        &self.index
    }

    #[inline]
    /// The region holding the chapter volume.
    pub fn volume_region(&self) -> Region {
        self.index.volume
    }

    #[inline]
    /// The nonce of the sub-index, used to authenticate every save.
    pub fn volume_nonce(&self) -> u64 {
        self.index.nonce
    }

    #[inline]
    pub fn num_saves(&self) -> usize {
        self.index.saves.len()
    }

    /// The layout of the given save slot.
    pub fn save_layout(&self, slot: usize) -> Result<&IndexSaveLayout, LayoutError> {
        self.index.saves.get(slot).ok_or_else(|| {
            LayoutError::InvalidArgument(format!("save slot {slot} does not exist"))
        })
    }

    pub(crate) fn save_layout_mut(
        &mut self,
        slot: usize,
    ) -> Result<&mut IndexSaveLayout, LayoutError> {
        self.index.saves.get_mut(slot).ok_or_else(|| {
            LayoutError::InvalidArgument(format!("save slot {slot} does not exist"))
        })
    }

    /// Every region of the super block table in the order they are stored.
    pub fn regions(&self) -> Vec<Region> {
        let mut regions = Vec::with_capacity(5 + self.index.saves.len());
        regions.push(self.header);
        regions.push(self.config);
        regions.push(self.index.container);
        regions.push(self.index.volume);
        regions.extend(self.index.saves.iter().map(|save| save.container()));
        regions.push(self.seal);
        regions
    }

    /// Write the configuration record to the config region.
    pub fn write_config(&self, config: &IndexConfig) -> Result<(), LayoutError> {
        let mut buffer = vec![0; self.block_size()];
        config_record::encode_config_record(
            &self.config_associated_data(),
            config,
            &mut buffer,
        )?;
        self.io.write_blocks(self.config.start_block, &buffer)?;
        Ok(())
    }

    /// Read the configuration record from the config region.
    pub fn read_config(&self) -> Result<IndexConfig, LayoutError> {
        let buffer = self.io.read_blocks(self.config.start_block, 1)?;
        let config: IndexConfig =
            config_record::decode_config_record(&self.config_associated_data(), &buffer)?;
        config.validate().map_err(|err| {
            LayoutError::Corrupt(format!("stored config is invalid: {err}"))
        })?;
        Ok(config)
    }

    /// Read the stored configuration and check it matches `expected`.
    ///
    /// The stored config is accepted if it equals `expected` or is `expected`
    /// after one chapter relocation. Returns the stored config.
    pub fn verify_config(&self, expected: &IndexConfig) -> Result<IndexConfig, LayoutError> {
        let stored = self.read_config()?;
        if !expected.accepts_stored(&stored) {
            tracing::error!(expected = ?expected, stored = ?stored, "stored config mismatch");
            return Err(LayoutError::WrongIndexConfig(
                "stored config does not match the expected config".to_string(),
            ));
        }

        let expected_sizes = SaveLayoutSizes::compute(expected, self.block_size())?;
        if expected_sizes.num_saves as usize != self.num_saves()
            || expected_sizes.save_blocks != self.sizes.save_blocks
            || expected_sizes.page_map_blocks != self.sizes.page_map_blocks
            || expected_sizes.open_chapter_blocks != self.sizes.open_chapter_blocks
        {
            return Err(LayoutError::WrongIndexConfig(
                "save slots do not match the expected config".to_string(),
            ));
        }

        let volume_blocks = stored.geometry.bytes_per_volume() / self.block_size() as u64;
        if volume_blocks != self.sizes.volume_blocks {
            return Err(LayoutError::WrongIndexConfig(format!(
                "volume has {} blocks but the config requires {volume_blocks}",
                self.sizes.volume_blocks,
            )));
        }

        Ok(stored)
    }

    fn config_associated_data(&self) -> [u8; 16] {
        let mut buffer = [0; 16];
        buffer[..8].copy_from_slice(&self.config.start_block.to_le_bytes());
        buffer[8..].copy_from_slice(&self.super_block.nonce.to_le_bytes());
        buffer
    }

    /// Open a reader over the volume, starting at `byte_offset` within it.
    pub fn open_volume_reader(
        &self,
        byte_offset: u64,
        len: usize,
    ) -> Result<RegionReader, LayoutError> {
        let (offset, len) = self.bounded_span(self.index.volume, byte_offset, len)?;
        Ok(self.io.open_reader(offset, len))
    }

    /// Open a writer over the volume, starting at `byte_offset` within it.
    pub fn open_volume_writer(
        &self,
        byte_offset: u64,
        len: usize,
    ) -> Result<RegionWriter, LayoutError> {
        let (offset, len) = self.bounded_span(self.index.volume, byte_offset, len)?;
        Ok(self.io.open_writer(offset, len))
    }

    fn bounded_span(
        &self,
        region: Region,
        byte_offset: u64,
        len: usize,
    ) -> Result<(u64, usize), LayoutError> {
        let block_size = self.block_size() as u64;
        let region_len = region.num_blocks * block_size;
        if byte_offset + len as u64 > region_len {
            return Err(LayoutError::InvalidArgument(format!(
                "{len} bytes at {byte_offset} exceeds {:?} region of {region_len} bytes",
                region.kind,
            )));
        }
        Ok((region.start_block * block_size + byte_offset, len))
    }
}
