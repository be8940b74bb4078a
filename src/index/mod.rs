//! The index session.
//!
//! The session owns the shared layout, the chapter volume and the page map,
//! and tracks the window of live virtual chapters. It commits chapters to
//! the volume, writes saves through the layout's save slots and performs
//! the chapter relocation used to shrink the index.

use std::io;
use std::io::{Read, Write};

use crate::geometry::{BYTES_PER_RECORD, GeometryError, IndexConfig};
use crate::index_layout::{IndexLayout, LayoutError, SaveType, SharedIndexLayout};
use crate::layout::codec::{DecodeError, EncodeError};
use crate::layout::{RegionKind, SOLE_INSTANCE};
use crate::page_map::{IndexPageMap, PageMapError};
use crate::storage::IoFactory;
use crate::volume::{Page, Volume, VolumeError};

mod shrink;
mod state;
#[cfg(test)]
mod tests;

pub use self::state::{IndexState, Record, ZoneHeader};
use self::state::{ZONE_HEADER_SIZE, decode_open_chapter, encode_open_chapter};

#[derive(Debug, thiserror::Error)]
/// An error preventing an index operation from completing.
pub enum IndexError {
    #[error(transparent)]
    /// The layout could not be created, loaded or updated.
    Layout(#[from] LayoutError),
    #[error(transparent)]
    /// A volume page could not be read or written.
    Volume(#[from] VolumeError),
    #[error(transparent)]
    /// The page map could not be updated, saved or loaded.
    PageMap(#[from] PageMapError),
    #[error(transparent)]
    /// An IO error occurred.
    Io(#[from] io::Error),
    #[error("failed to decode {what}: {source}")]
    /// A saved record could not be decoded.
    Decode {
        /// The record being decoded.
        what: &'static str,
        #[source]
        source: DecodeError,
    },
    #[error(transparent)]
    /// A saved record could not be encoded.
    Encode(#[from] EncodeError),
    #[error(transparent)]
    /// The reduced geometry is invalid.
    Geometry(#[from] GeometryError),
    #[error("saved index state does not match: {0}")]
    /// The saved regions disagree with the saved index state.
    StateMismatch(String),
    #[error("the open chapter is full")]
    /// A record was added to a full open chapter.
    ChapterFull,
    #[error("index has already been reduced by a chapter")]
    /// The geometry has already been reduced once.
    AlreadyReduced,
    #[error("volume of {0} chapters is too small to reduce")]
    /// The volume does not have enough chapters to give one up.
    VolumeTooSmall(u32),
}

/// An open dedupe index.
pub struct Index {
    layout: SharedIndexLayout,
    config: IndexConfig,
    /// The chapter count the index was created with.
    created_chapters: u32,
    volume: Volume,
    page_map: IndexPageMap,
    open_chapter: Vec<Record>,
    oldest_virtual_chapter: u64,
    newest_virtual_chapter: u64,
    need_to_save: bool,
}

impl Index {
    #[tracing::instrument("index::create", skip_all, fields(offset = offset))]
    /// Create a new, empty index at the byte `offset`.
    pub fn create(
        io: IoFactory,
        offset: u64,
        size: u64,
        config: &IndexConfig,
    ) -> Result<Self, IndexError> {
        let layout = IndexLayout::create(io, offset, size, config)?;
        layout.write_config(config)?;

        let layout = layout.into_shared();
        let volume = Volume::new(layout.clone(), config.geometry);

        Ok(Self {
            layout,
            config: config.clone(),
            created_chapters: config.geometry.chapters_per_volume,
            volume,
            page_map: IndexPageMap::new(config.geometry),
            open_chapter: Vec::new(),
            oldest_virtual_chapter: 0,
            newest_virtual_chapter: 0,
            need_to_save: true,
        })
    }

    #[tracing::instrument("index::load", skip_all, fields(offset = offset))]
    /// Load the index at the byte `offset` from its latest valid save.
    ///
    /// `expected` is the config the index was created with, an index reduced
    /// by a chapter relocation is still accepted.
    pub fn load(io: IoFactory, offset: u64, expected: &IndexConfig) -> Result<Self, IndexError> {
        let layout = IndexLayout::load(io, offset)?;
        let config = layout.verify_config(expected)?;
        let slot = layout.find_latest_save_slot()?;
        let save = layout.save_layout(slot)?;

        let state_buffer = save
            .state_buffer()
            .ok_or(LayoutError::MissingStateBuffer(slot))?;
        let state = IndexState::decode(state_buffer).map_err(|source| IndexError::Decode {
            what: "index state",
            source,
        })?;
        if state.zone_count != save.num_zones() {
            return Err(IndexError::StateMismatch(format!(
                "state lists {} zones but the save has {}",
                state.zone_count,
                save.num_zones(),
            )));
        }

        let reader = layout.open_save_region_reader(slot, RegionKind::IndexPageMap, SOLE_INSTANCE)?;
        let page_map = IndexPageMap::load(config.geometry, reader)?;

        for zone in 0..state.zone_count {
            let mut reader = layout.open_save_region_reader(slot, RegionKind::MasterIndex, zone as u16)?;
            let mut buffer = [0; ZONE_HEADER_SIZE];
            reader.read_exact(&mut buffer)?;
            let header = ZoneHeader::decode(&buffer).map_err(|source| IndexError::Decode {
                what: "master index zone",
                source,
            })?;
            let expected_header = ZoneHeader {
                zone,
                num_zones: state.zone_count,
                oldest_virtual_chapter: state.oldest_virtual_chapter,
                newest_virtual_chapter: state.newest_virtual_chapter,
            };
            if header != expected_header {
                return Err(IndexError::StateMismatch(format!("zone {zone} header mismatch")));
            }
        }

        let mut open_chapter = Vec::new();
        if save.save_type() == SaveType::Save {
            let mut reader = layout.open_save_region_reader(slot, RegionKind::OpenChapter, SOLE_INSTANCE)?;
            let mut buffer = Vec::new();
            reader.read_to_end(&mut buffer)?;
            open_chapter =
                decode_open_chapter(&buffer, config.geometry.records_per_chapter()).map_err(
                    |source| IndexError::Decode {
                        what: "open chapter",
                        source,
                    },
                )?;
        }

        tracing::info!(
            slot = slot,
            oldest_virtual_chapter = state.oldest_virtual_chapter,
            newest_virtual_chapter = state.newest_virtual_chapter,
            open_records = open_chapter.len(),
            "loaded index",
        );

        let layout = layout.into_shared();
        let volume = Volume::new(layout.clone(), config.geometry);

        Ok(Self {
            layout,
            config,
            created_chapters: expected.geometry.chapters_per_volume,
            volume,
            page_map,
            open_chapter,
            oldest_virtual_chapter: state.oldest_virtual_chapter,
            newest_virtual_chapter: state.newest_virtual_chapter,
            need_to_save: false,
        })
    }

    #[inline]
    /// A shared reference to the index layout.
    pub fn layout(&self) -> SharedIndexLayout {
        self.layout.clone()
    }

    #[inline]
    /// The current config, reflecting any chapter relocation.
    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    #[inline]
    pub fn volume(&self) -> &Volume {
        &self.volume
    }

    #[inline]
    pub fn page_map(&self) -> &IndexPageMap {
        &self.page_map
    }

    #[inline]
    pub fn open_chapter(&self) -> &[Record] {
        &self.open_chapter
    }

    #[inline]
    /// The oldest chapter still held by the volume.
    pub fn oldest_virtual_chapter(&self) -> u64 {
        self.oldest_virtual_chapter
    }

    #[inline]
    /// The chapter currently open for new records.
    pub fn newest_virtual_chapter(&self) -> u64 {
        self.newest_virtual_chapter
    }

    #[inline]
    /// Returns if the index has changed since it was last saved.
    pub fn need_to_save(&self) -> bool {
        self.need_to_save
    }

    /// Add a record to the open chapter, committing the chapter once full.
    pub fn add_record(&mut self, record: Record) -> Result<(), IndexError> {
        let records_per_chapter = self.volume.geometry().records_per_chapter() as usize;
        if self.open_chapter.len() >= records_per_chapter {
            return Err(IndexError::ChapterFull);
        }

        self.open_chapter.push(record);
        self.need_to_save = true;
        if self.open_chapter.len() == records_per_chapter {
            self.commit_chapter()?;
        }
        Ok(())
    }

    #[tracing::instrument("index::commit_chapter", skip_all)]
    /// Write the open chapter to the volume and open the next chapter.
    ///
    /// Once the volume is full the oldest chapter is expired.
    pub fn commit_chapter(&mut self) -> Result<(), IndexError> {
        let geometry = *self.volume.geometry();
        let (pages, last_lists) = self.build_chapter_pages();

        let physical_chapter = geometry.map_to_physical_chapter(self.newest_virtual_chapter);
        self.volume.write_chapter(physical_chapter, &pages)?;
        self.page_map.update(self.newest_virtual_chapter, &last_lists)?;

        tracing::debug!(
            virtual_chapter = self.newest_virtual_chapter,
            physical_chapter = physical_chapter,
            records = self.open_chapter.len(),
            "committed chapter",
        );

        self.open_chapter.clear();
        self.newest_virtual_chapter += 1;
        let max_live = geometry.chapters_per_volume as u64 - 1;
        if self.newest_virtual_chapter - self.oldest_virtual_chapter > max_live {
            self.oldest_virtual_chapter = self.newest_virtual_chapter - max_live;
        }
        self.need_to_save = true;

        Ok(())
    }

    /// Lay the open chapter out as index pages followed by record pages.
    ///
    /// Returns the pages and the last delta list of every index page but the
    /// final one.
    fn build_chapter_pages(&self) -> (Vec<Page>, Vec<u16>) {
        let geometry = self.volume.geometry();
        let index_pages = geometry.index_pages_per_chapter as usize;
        let mut pages = Vec::with_capacity(geometry.pages_per_chapter() as usize);

        let mut delta_lists: Vec<u16> = self.open_chapter.iter().map(delta_list).collect();
        delta_lists.sort_unstable();
        let lists_per_page = delta_lists.len().div_ceil(index_pages).max(1);

        let mut last_lists = Vec::with_capacity(index_pages - 1);
        let mut last_list = 0;
        for (page_number, lists) in (0..index_pages).zip(
            delta_lists
                .chunks(lists_per_page)
                .chain(std::iter::repeat(&[][..])),
        ) {
            let first_list = lists.first().copied().unwrap_or(last_list);
            last_list = lists.last().copied().unwrap_or(last_list);
            if page_number + 1 < index_pages {
                last_lists.push(last_list);
            }

            let mut page = self.volume.initialize_page();
            let data = page.data_mut();
            data[..8].copy_from_slice(&self.newest_virtual_chapter.to_le_bytes());
            data[8..10].copy_from_slice(&first_list.to_le_bytes());
            data[10..12].copy_from_slice(&last_list.to_le_bytes());
            data[12..16].copy_from_slice(&(lists.len() as u32).to_le_bytes());
            pages.push(page);
        }

        let records_per_page = geometry.records_per_page() as usize;
        let mut records = self.open_chapter.chunks(records_per_page);
        for _ in 0..geometry.record_pages_per_chapter {
            let mut page = self.volume.initialize_page();
            if let Some(records) = records.next() {
                let slots = page.data_mut().chunks_exact_mut(BYTES_PER_RECORD);
                for (slot, record) in slots.zip(records) {
                    slot.copy_from_slice(record);
                }
            }
            pages.push(page);
        }

        (pages, last_lists)
    }

    #[tracing::instrument("index::save", skip(self))]
    /// Save the index state to the oldest save slot, returning the slot.
    ///
    /// A failed save is cancelled and leaves the slot empty.
    pub fn save(&mut self, save_type: SaveType) -> Result<usize, IndexError> {
        let mut layout = self.layout.lock();
        let slot = layout.setup_save_slot(self.config.zone_count, save_type)?;

        let result = self
            .write_save_regions(&layout, slot, save_type)
            .and_then(|state| {
                layout.set_state_buffer(slot, state)?;
                layout.commit_save(slot)?;
                Ok(())
            });
        if let Err(err) = result {
            tracing::error!(slot = slot, error = %err, "failed to write save, cancelling");
            layout.cancel_save(slot)?;
            return Err(err);
        }
        drop(layout);

        self.need_to_save = false;
        tracing::info!(
            slot = slot,
            newest_virtual_chapter = self.newest_virtual_chapter,
            "saved index",
        );
        Ok(slot)
    }

    /// Write every region of the save but its header, returning the state.
    fn write_save_regions(
        &self,
        layout: &IndexLayout,
        slot: usize,
        save_type: SaveType,
    ) -> Result<Vec<u8>, IndexError> {
        let state = IndexState {
            oldest_virtual_chapter: self.oldest_virtual_chapter,
            newest_virtual_chapter: self.newest_virtual_chapter,
            zone_count: self.config.zone_count,
        };

        let writer = layout.open_save_region_writer(slot, RegionKind::IndexPageMap, SOLE_INSTANCE)?;
        self.page_map.save(writer)?;

        for zone in 0..state.zone_count {
            let header = ZoneHeader {
                zone,
                num_zones: state.zone_count,
                oldest_virtual_chapter: state.oldest_virtual_chapter,
                newest_virtual_chapter: state.newest_virtual_chapter,
            };
            let mut writer =
                layout.open_save_region_writer(slot, RegionKind::MasterIndex, zone as u16)?;
            writer.write_all(&header.encode()?)?;
            writer.flush()?;
        }

        if save_type == SaveType::Save {
            let mut writer =
                layout.open_save_region_writer(slot, RegionKind::OpenChapter, SOLE_INSTANCE)?;
            writer.write_all(&encode_open_chapter(&self.open_chapter)?)?;
            writer.flush()?;
        }

        Ok(state.encode()?)
    }

    #[tracing::instrument("index::close", skip_all)]
    /// Close the index, saving it first if it has changed.
    pub fn close(mut self) -> Result<(), IndexError> {
        if self.need_to_save {
            self.save(SaveType::Save)?;
        }
        tracing::info!("closed index");
        Ok(())
    }
}

/// The delta list a record belongs to.
fn delta_list(record: &Record) -> u16 {
    u16::from_le_bytes([record[0], record[1]])
}
