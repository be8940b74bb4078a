//! The rotating save slots of a sub-index.
//!
//! A slot cycles through being empty, instantiated for a new save or
//! checkpoint, and written. Reusing a slot first persists it empty, so a
//! crash part way through a save can never resurrect the slot's old data.

use smallvec::SmallVec;

use super::iterator::RegionIterator;
use super::{IndexLayout, LayoutError, SaveLayoutSizes};
use crate::geometry::MAX_ZONES;
use crate::layout::region::{read_region_table, write_region_table};
use crate::layout::save_data::{
    SAVE_DATA_SIZE, SAVE_DATA_VERSION, decode_save_data, encode_save_data,
};
use crate::layout::{
    IndexSaveData, Region, RegionKind, RegionTable, SOLE_INSTANCE, TableType, integrity,
};
use crate::nonce;
use crate::storage::{RegionReader, RegionWriter};

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
/// The kind of state held by a save slot.
pub enum SaveType {
    #[default]
    /// The slot holds nothing.
    None,
    /// A full save, including the open chapter.
    Save,
    /// A checkpoint, without the open chapter.
    Checkpoint,
}

impl SaveType {
    fn table_type(self) -> TableType {
        match self {
            SaveType::None => TableType::Unsaved,
            SaveType::Save => TableType::Save,
            SaveType::Checkpoint => TableType::Checkpoint,
        }
    }
}

#[derive(Debug, Clone)]
/// The layout of a single save slot.
pub struct IndexSaveLayout {
    slot: u16,
    container: Region,
    header: Region,
    index_page_map: Region,
    master_index_zones: SmallVec<[Region; 4]>,
    open_chapter: Option<Region>,
    free_space: Region,
    save_type: SaveType,
    save_data: IndexSaveData,
    state_buffer: Option<Vec<u8>>,
    read: bool,
    written: bool,
}

impl IndexSaveLayout {
    pub(super) fn new_empty(slot: u16, container: Region, sizes: &SaveLayoutSizes) -> Self {
        let placeholder = Region::new(container.start_block, 0, RegionKind::Scratch, SOLE_INSTANCE);
        let mut save = Self {
            slot,
            container,
            header: placeholder,
            index_page_map: placeholder,
            master_index_zones: SmallVec::new(),
            open_chapter: None,
            free_space: placeholder,
            save_type: SaveType::None,
            save_data: IndexSaveData::default(),
            state_buffer: None,
            read: false,
            written: false,
        };
        save.reset(sizes);
        save
    }

    #[inline]
    /// The number of the slot within the sub-index.
    pub fn slot(&self) -> usize {
        self.slot as usize
    }

    #[inline]
    /// The region spanning the whole slot.
    pub fn container(&self) -> Region {
        self.container
    }

    #[inline]
    /// The block holding the slot's region table and state.
    pub fn header(&self) -> Region {
        self.header
    }

    #[inline]
    pub fn num_zones(&self) -> u32 {
        self.master_index_zones.len() as u32
    }

    #[inline]
    pub fn index_page_map(&self) -> Region {
        self.index_page_map
    }

    #[inline]
    pub fn master_index_zones(&self) -> &[Region] {
        &self.master_index_zones
    }

    #[inline]
    /// The open chapter region, only present for a [SaveType::Save].
    pub fn open_chapter(&self) -> Option<Region> {
        self.open_chapter
    }

    #[inline]
    pub fn free_space(&self) -> Region {
        self.free_space
    }

    #[inline]
    pub fn save_type(&self) -> SaveType {
        self.save_type
    }

    #[inline]
    pub fn save_data(&self) -> &IndexSaveData {
        &self.save_data
    }

    #[inline]
    /// The index state stored with the save.
    pub fn state_buffer(&self) -> Option<&[u8]> {
        self.state_buffer.as_deref()
    }

    #[inline]
    /// Returns if the slot was loaded from storage.
    pub fn is_read(&self) -> bool {
        self.read
    }

    #[inline]
    /// Returns if the slot has been committed to storage.
    pub fn is_written(&self) -> bool {
        self.written
    }

    /// Every region inside the slot, in the order they are stored.
    pub fn regions(&self) -> Vec<Region> {
        let mut regions = Vec::with_capacity(4 + self.master_index_zones.len());
        regions.push(self.header);
        regions.push(self.index_page_map);
        regions.extend_from_slice(&self.master_index_zones);
        regions.extend(self.open_chapter);
        regions.push(self.free_space);
        regions
    }

    /// Check the slot holds a save belonging to this slot and sub-index.
    pub fn is_valid(&self, volume_nonce: u64) -> bool {
        if self.save_type == SaveType::None
            || self.master_index_zones.is_empty()
            || self.save_data.timestamp == 0
        {
            return false;
        }
        let expected = nonce::save_nonce(
            volume_nonce,
            &self.save_data.without_nonce(),
            self.container.start_block,
        );
        self.save_data.nonce == expected
    }

    /// Clear the slot back to its empty shape, dropping any state.
    ///
    /// Nothing is written to storage.
    pub(super) fn reset(&mut self, sizes: &SaveLayoutSizes) {
        self.save_type = SaveType::None;
        self.save_data = IndexSaveData::default();
        self.state_buffer = None;
        self.read = false;
        self.written = false;
        self.define_regions(sizes, 0, SaveType::None);
    }

    fn instantiate(
        &mut self,
        sizes: &SaveLayoutSizes,
        num_zones: u32,
        save_type: SaveType,
        save_data: IndexSaveData,
    ) {
        self.save_type = save_type;
        self.save_data = save_data;
        self.state_buffer = None;
        self.read = false;
        self.written = false;
        self.define_regions(sizes, num_zones, save_type);
    }

    fn define_regions(&mut self, sizes: &SaveLayoutSizes, num_zones: u32, save_type: SaveType) {
        let mut next_block = self.container.start_block;

        self.header = Region::new(next_block, 1, RegionKind::Header, self.slot);
        next_block += 1;

        self.index_page_map = Region::new(
            next_block,
            sizes.page_map_blocks,
            RegionKind::IndexPageMap,
            SOLE_INSTANCE,
        );
        next_block += sizes.page_map_blocks;

        self.master_index_zones.clear();
        if num_zones > 0 {
            let zone_blocks = sizes.master_index_blocks / num_zones as u64;
            for zone in 0..num_zones as u16 {
                self.master_index_zones.push(Region::new(
                    next_block,
                    zone_blocks,
                    RegionKind::MasterIndex,
                    zone,
                ));
                next_block += zone_blocks;
            }
        }

        self.open_chapter = None;
        if save_type == SaveType::Save {
            let open_chapter = Region::new(
                next_block,
                sizes.open_chapter_blocks,
                RegionKind::OpenChapter,
                SOLE_INSTANCE,
            );
            next_block += open_chapter.num_blocks;
            self.open_chapter = Some(open_chapter);
        }

        self.free_space = Region::new(
            next_block,
            self.container.end_block() - next_block,
            RegionKind::Scratch,
            SOLE_INSTANCE,
        );
    }

    /// Encode the slot header block: its region table, save data and state.
    ///
    /// An empty slot is encoded as a single scratch region spanning the slot.
    pub(super) fn encode_header(&self, block_size: usize) -> Result<Vec<u8>, LayoutError> {
        let mut buffer = Vec::with_capacity(block_size);

        if self.save_type == SaveType::None {
            let scratch = Region::new(
                self.container.start_block,
                self.container.num_blocks,
                RegionKind::Scratch,
                SOLE_INSTANCE,
            );
            let table =
                RegionTable::new(TableType::Unsaved, self.container.num_blocks, vec![scratch], 0);
            write_region_table(&table, &[], &mut buffer)?;
            return Ok(buffer);
        }

        let state = self.state_buffer.as_deref().unwrap_or_default();
        let mut payload = Vec::with_capacity(SAVE_DATA_SIZE + state.len());
        encode_save_data(&self.save_data, &mut payload)?;
        payload.extend_from_slice(state);

        let mut regions = self.regions();
        regions[0].checksum = integrity::checksum(state);
        let table = RegionTable::new(
            self.save_type.table_type(),
            self.container.num_blocks,
            regions,
            payload.len().min(u16::MAX as usize) as u16,
        );

        if payload.len() > u16::MAX as usize || table.encoded_len() + payload.len() > block_size {
            return Err(LayoutError::InvalidArgument(format!(
                "index state of {} bytes does not fit in the save header",
                state.len(),
            )));
        }

        write_region_table(&table, &payload, &mut buffer)?;
        Ok(buffer)
    }

    /// Reconstruct the slot from its header block.
    ///
    /// A table holding no save leaves the slot empty. A save whose state
    /// fails its checksum is logged and the slot left empty, any other
    /// mismatch is an error.
    pub(super) fn load_header(
        &mut self,
        block: &[u8],
        sizes: &SaveLayoutSizes,
    ) -> Result<(), LayoutError> {
        self.reset(sizes);

        let (table, payload) =
            read_region_table(block).map_err(|source| LayoutError::Decode {
                what: "save slot table",
                source,
            })?;

        let save_type = match table.header.table_type {
            TableType::Save => SaveType::Save,
            TableType::Checkpoint => SaveType::Checkpoint,
            TableType::Unsaved | TableType::Free if is_unused_table(&table.regions) => {
                return Ok(());
            },
            other => {
                return Err(self.bad_layout(format!("unexpected {other:?} table")));
            },
        };

        if table.header.region_blocks != self.container.num_blocks {
            return Err(self.bad_layout(format!(
                "table covers {} blocks but slot has {}",
                table.header.region_blocks, self.container.num_blocks,
            )));
        }

        let mut iter = RegionIterator::new(&table.regions, self.container.start_block, "save slot");
        let header = iter.expect_region(RegionKind::Header, self.slot, Some(1))?;
        let index_page_map = iter.expect_region(
            RegionKind::IndexPageMap,
            SOLE_INSTANCE,
            Some(sizes.page_map_blocks),
        )?;

        let mut zones = SmallVec::<[Region; 4]>::new();
        while iter.peek().is_some_and(|region| region.kind == RegionKind::MasterIndex) {
            if zones.len() == MAX_ZONES as usize {
                return Err(self.bad_layout(format!("more than {MAX_ZONES} zones")));
            }
            zones.push(iter.expect_region(RegionKind::MasterIndex, zones.len() as u16, None)?);
        }

        let mut open_chapter = None;
        if iter.peek().is_some_and(|region| region.kind == RegionKind::OpenChapter) {
            open_chapter = Some(iter.expect_region(
                RegionKind::OpenChapter,
                SOLE_INSTANCE,
                Some(sizes.open_chapter_blocks),
            )?);
        }
        if open_chapter.is_some() != (save_type == SaveType::Save) {
            return Err(self.bad_layout(format!(
                "{save_type:?} table has an open chapter: {}",
                open_chapter.is_some(),
            )));
        }

        let free_space = if iter.peek().is_some() {
            let free_space = iter.expect_region(RegionKind::Scratch, SOLE_INSTANCE, None)?;
            iter.finish(self.container.end_block())?;
            free_space
        } else {
            // The free space may be left implicit.
            let next_block = iter.next_block();
            iter.finish(next_block)?;
            let Some(remaining) = self.container.end_block().checked_sub(next_block) else {
                return Err(self.bad_layout("regions overrun the slot".to_string()));
            };
            Region::new(next_block, remaining, RegionKind::Scratch, SOLE_INSTANCE)
        };

        if payload.len() < SAVE_DATA_SIZE {
            return Err(LayoutError::Corrupt(format!(
                "save slot {} payload is {} bytes",
                self.slot,
                payload.len(),
            )));
        }
        let save_data =
            decode_save_data(&payload[..SAVE_DATA_SIZE]).map_err(|source| LayoutError::Decode {
                what: "save data",
                source,
            })?;
        let state = &payload[SAVE_DATA_SIZE..];

        if integrity::checksum(state) != header.checksum {
            tracing::warn!(slot = self.slot, "save slot state checksum mismatch, ignoring save");
            return Ok(());
        }

        self.header = Region {
            checksum: 0,
            ..header
        };
        self.index_page_map = index_page_map;
        self.master_index_zones = zones;
        self.open_chapter = open_chapter;
        self.free_space = free_space;
        self.save_type = save_type;
        self.save_data = save_data;
        self.state_buffer = Some(state.to_vec());
        self.read = true;

        Ok(())
    }

    fn bad_layout(&self, reason: String) -> LayoutError {
        tracing::error!(slot = self.slot, reason = %reason, "save slot table mismatch");
        LayoutError::BadLayout {
            context: "save slot",
            reason,
        }
    }
}

fn is_unused_table(regions: &[Region]) -> bool {
    match regions {
        [] => true,
        [region] => region.kind == RegionKind::Scratch,
        _ => false,
    }
}

impl IndexLayout {
    /// The slot to reuse for the next save.
    ///
    /// Slots failing validation count as never saved, ties go to the
    /// first slot.
    pub fn select_oldest_save(&self) -> usize {
        let volume_nonce = self.volume_nonce();
        let mut oldest = 0;
        let mut oldest_timestamp = u64::MAX;
        for save in self.index.saves.iter() {
            let timestamp = if save.is_valid(volume_nonce) {
                save.save_data.timestamp
            } else {
                0
            };
            if timestamp < oldest_timestamp {
                oldest = save.slot();
                oldest_timestamp = timestamp;
            }
        }
        tracing::debug!(slot = oldest, timestamp = oldest_timestamp, "selected oldest save");
        oldest
    }

    /// The slot holding the most recent valid save.
    pub fn select_latest_save(&self) -> Result<usize, LayoutError> {
        let volume_nonce = self.volume_nonce();
        let mut latest = None;
        let mut latest_timestamp = 0;
        for save in self.index.saves.iter() {
            if !save.is_valid(volume_nonce) {
                if save.read {
                    tracing::warn!(slot = save.slot(), "save slot failed validation");
                }
                continue;
            }
            if latest.is_none() || save.save_data.timestamp > latest_timestamp {
                latest = Some(save.slot());
                latest_timestamp = save.save_data.timestamp;
            }
        }

        let Some(latest) = latest else {
            tracing::error!("no valid save slot found");
            return Err(LayoutError::IndexNotSavedCleanly);
        };
        tracing::debug!(slot = latest, timestamp = latest_timestamp, "selected latest save");
        Ok(latest)
    }

    /// Find the most recent valid save, returning its slot.
    ///
    /// The slot's zone count and state are available through
    /// [IndexLayout::save_layout].
    pub fn find_latest_save_slot(&self) -> Result<usize, LayoutError> {
        self.select_latest_save()
    }

    #[tracing::instrument("layout::setup_save_slot", skip(self))]
    /// Prepare the oldest slot for a new save, returning its slot.
    ///
    /// The slot is persisted empty before it is reshaped for the save.
    pub fn setup_save_slot(
        &mut self,
        num_zones: u32,
        save_type: SaveType,
    ) -> Result<usize, LayoutError> {
        if num_zones == 0 || num_zones > MAX_ZONES {
            return Err(LayoutError::InvalidArgument(format!(
                "zone count {num_zones} must be between 1 and {MAX_ZONES}",
            )));
        }
        if save_type == SaveType::None {
            return Err(LayoutError::InvalidArgument(
                "save type must be a save or checkpoint".to_string(),
            ));
        }
        if num_zones as u64 > self.sizes.master_index_blocks {
            return Err(LayoutError::InvalidArgument(format!(
                "{num_zones} zones do not fit in {} master index blocks",
                self.sizes.master_index_blocks,
            )));
        }

        let slot = self.select_oldest_save();
        self.invalidate_save(slot)?;

        let newest_timestamp = self
            .index
            .saves
            .iter()
            .map(|save| save.save_data.timestamp)
            .max()
            .unwrap_or(0);
        let timestamp = nonce::current_time_ms().max(newest_timestamp + 1);

        let mut save_data = IndexSaveData {
            timestamp,
            nonce: 0,
            version: SAVE_DATA_VERSION,
        };
        let start_block = self.index.saves[slot].container.start_block;
        save_data.nonce = nonce::save_nonce(self.volume_nonce(), &save_data, start_block);

        let sizes = self.sizes;
        self.index.saves[slot].instantiate(&sizes, num_zones, save_type, save_data);

        tracing::debug!(slot = slot, timestamp = timestamp, "instantiated save slot");
        Ok(slot)
    }

    /// Set the index state committed with the save.
    pub fn set_state_buffer(&mut self, slot: usize, state: Vec<u8>) -> Result<(), LayoutError> {
        self.save_layout_mut(slot)?.state_buffer = Some(state);
        Ok(())
    }

    /// The index state of the slot, if it has been loaded or set.
    pub fn state_buffer(&self, slot: usize) -> Result<Option<&[u8]>, LayoutError> {
        Ok(self.save_layout(slot)?.state_buffer())
    }

    #[tracing::instrument("layout::commit_save", skip(self))]
    /// Write the slot header, making the save visible.
    ///
    /// Every other region of the save must already have been written.
    pub fn commit_save(&mut self, slot: usize) -> Result<(), LayoutError> {
        let save = self.save_layout(slot)?;
        if save.state_buffer.is_none() {
            return Err(LayoutError::MissingStateBuffer(slot));
        }
        if save.save_type == SaveType::None {
            return Err(LayoutError::InvalidArgument(format!(
                "save slot {slot} has not been set up",
            )));
        }

        self.write_save_header(slot)?;
        self.index.saves[slot].written = true;

        tracing::debug!(slot = slot, "committed save");
        Ok(())
    }

    /// Abandon a save set up in the slot.
    ///
    /// The slot is only cleared in memory, it was persisted empty when it
    /// was set up.
    pub fn cancel_save(&mut self, slot: usize) -> Result<(), LayoutError> {
        let sizes = self.sizes;
        self.save_layout_mut(slot)?.reset(&sizes);
        tracing::debug!(slot = slot, "cancelled save");
        Ok(())
    }

    #[tracing::instrument("layout::discard_saves", skip(self))]
    /// Invalidate every slot, or only the latest valid save.
    pub fn discard_saves(&mut self, all: bool) -> Result<(), LayoutError> {
        if all {
            for slot in 0..self.num_saves() {
                self.invalidate_save(slot)?;
            }
            return Ok(());
        }

        let slot = self.select_latest_save()?;
        self.invalidate_save(slot)
    }

    /// Clear the slot and persist it empty.
    fn invalidate_save(&mut self, slot: usize) -> Result<(), LayoutError> {
        let sizes = self.sizes;
        self.save_layout_mut(slot)?.reset(&sizes);
        self.write_save_header(slot)?;
        tracing::debug!(slot = slot, "invalidated save slot");
        Ok(())
    }

    pub(super) fn write_save_header(&self, slot: usize) -> Result<(), LayoutError> {
        let save = self.save_layout(slot)?;
        let buffer = save.encode_header(self.block_size())?;
        self.io.write_blocks(save.container.start_block, &buffer)?;
        Ok(())
    }

    /// The region of a set up save slot.
    ///
    /// `instance` selects the zone of a [RegionKind::MasterIndex] region and
    /// is ignored for other kinds.
    pub fn save_region(
        &self,
        slot: usize,
        kind: RegionKind,
        instance: u16,
    ) -> Result<Region, LayoutError> {
        let save = self.save_layout(slot)?;
        if save.save_type == SaveType::None {
            return Err(LayoutError::InvalidArgument(format!(
                "save slot {slot} holds no save",
            )));
        }

        let region = match kind {
            RegionKind::IndexPageMap => Some(save.index_page_map),
            RegionKind::MasterIndex => save.master_index_zones.get(instance as usize).copied(),
            RegionKind::OpenChapter => save.open_chapter,
            _ => None,
        };
        region.ok_or_else(|| {
            LayoutError::InvalidArgument(format!(
                "save slot {slot} has no {kind:?} region (instance {instance})",
            ))
        })
    }

    /// Open a reader over a region of a save slot.
    pub fn open_save_region_reader(
        &self,
        slot: usize,
        kind: RegionKind,
        instance: u16,
    ) -> Result<RegionReader, LayoutError> {
        let region = self.save_region(slot, kind, instance)?;
        let block_size = self.block_size();
        Ok(self.io.open_reader(
            region.start_block * block_size as u64,
            region.num_blocks as usize * block_size,
        ))
    }

    /// Open a writer over a region of a save slot.
    pub fn open_save_region_writer(
        &self,
        slot: usize,
        kind: RegionKind,
        instance: u16,
    ) -> Result<RegionWriter, LayoutError> {
        let region = self.save_region(slot, kind, instance)?;
        let block_size = self.block_size();
        Ok(self.io.open_writer(
            region.start_block * block_size as u64,
            region.num_blocks as usize * block_size,
        ))
    }
}
