//! The index page map.
//!
//! Each chapter's delta lists are spread across its index pages. The map
//! keeps, per physical chapter, the last delta list held by every index
//! page but the final one, so a lookup only needs to read a single page.

use std::io;

use crate::geometry::Geometry;
use crate::layout::codec::{DecodeError, Decoder, EncodeError, Encoder};

/// The magic bytes at the start of a saved page map.
static PAGE_MAP_MAGIC: &[u8; 8] = b"LNXPMAP1";
/// The bytes preceding the entries of a saved page map.
const PAGE_MAP_HEADER_SIZE: usize = 16;

#[derive(Debug, thiserror::Error)]
/// An error preventing the page map from being updated, saved or loaded.
pub enum PageMapError {
    #[error(transparent)]
    /// An IO error occurred.
    Io(#[from] io::Error),
    #[error("failed to decode page map: {0}")]
    /// The saved page map could not be decoded.
    Decode(#[from] DecodeError),
    #[error(transparent)]
    /// The page map could not be encoded.
    Encode(#[from] EncodeError),
    #[error("physical chapter {0} is outside the page map")]
    /// The chapter does not exist in the volume.
    InvalidChapter(u64),
    #[error("expected {expected} entries but got {actual}")]
    /// The number of entries does not match the geometry.
    WrongEntryCount {
        /// The entries per chapter of the geometry.
        expected: usize,
        /// The number of entries provided.
        actual: usize,
    },
}

#[derive(Debug, Clone, Eq, PartialEq)]
/// The last delta list of every index page, by physical chapter.
pub struct IndexPageMap {
    geometry: Geometry,
    last_update: u64,
    entries: Vec<u16>,
}

impl IndexPageMap {
    /// Creates a new empty page map for the geometry.
    pub fn new(geometry: Geometry) -> Self {
        let len = geometry.chapters_per_volume as usize * geometry.page_map_entries_per_chapter();
        Self {
            geometry,
            last_update: 0,
            entries: vec![0; len],
        }
    }

    /// The number of bytes a saved page map for the geometry occupies.
    pub fn saved_size(geometry: &Geometry) -> usize {
        PAGE_MAP_HEADER_SIZE
            + size_of::<u16>()
                * geometry.chapters_per_volume as usize
                * geometry.page_map_entries_per_chapter()
    }

    #[inline]
    pub fn entries_per_chapter(&self) -> usize {
        self.geometry.page_map_entries_per_chapter()
    }

    #[inline]
    /// The newest virtual chapter recorded in the map.
    pub fn last_update(&self) -> u64 {
        self.last_update
    }

    #[inline]
    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    #[inline]
    pub fn entries(&self) -> &[u16] {
        &self.entries
    }

    /// The entries of a physical chapter.
    pub fn chapter_entries(&self, physical_chapter: u32) -> Result<&[u16], PageMapError> {
        let per_chapter = self.entries_per_chapter();
        let start = physical_chapter as usize * per_chapter;
        self.entries
            .get(start..start + per_chapter)
            .ok_or(PageMapError::InvalidChapter(physical_chapter as u64))
    }

    /// Record the last delta list of every index page of a virtual chapter.
    pub fn update(&mut self, virtual_chapter: u64, last_lists: &[u16]) -> Result<(), PageMapError> {
        let per_chapter = self.entries_per_chapter();
        if last_lists.len() != per_chapter {
            return Err(PageMapError::WrongEntryCount {
                expected: per_chapter,
                actual: last_lists.len(),
            });
        }

        let physical = self.geometry.map_to_physical_chapter(virtual_chapter) as usize;
        let start = physical * per_chapter;
        let Some(entries) = self.entries.get_mut(start..start + per_chapter) else {
            return Err(PageMapError::InvalidChapter(virtual_chapter));
        };
        entries.copy_from_slice(last_lists);
        self.last_update = virtual_chapter;
        Ok(())
    }

    /// The index page of a virtual chapter which holds `delta_list`.
    pub fn find_index_page(&self, virtual_chapter: u64, delta_list: u16) -> u32 {
        let physical = self.geometry.map_to_physical_chapter(virtual_chapter) as usize;
        let per_chapter = self.entries_per_chapter();
        let entries = &self.entries[physical * per_chapter..][..per_chapter];
        entries
            .iter()
            .position(|last_list| delta_list <= *last_list)
            .unwrap_or(per_chapter) as u32
    }

    /// Remove physical chapter 0 from the map.
    ///
    /// When `new_physical` is not zero, chapter 0's entries are first copied
    /// over those of `new_physical`. Every remaining chapter then moves down
    /// by one. The caller must follow up with [IndexPageMap::replace_geometry].
    pub fn reduce(&mut self, new_physical: u32) -> Result<(), PageMapError> {
        let chapters = self.geometry.chapters_per_volume;
        if new_physical >= chapters {
            return Err(PageMapError::InvalidChapter(new_physical as u64));
        }

        let per_chapter = self.entries_per_chapter();
        if new_physical != 0 {
            self.entries
                .copy_within(0..per_chapter, new_physical as usize * per_chapter);
        }
        self.entries.drain(0..per_chapter);
        Ok(())
    }

    /// Swap in the geometry the map's entries now describe.
    pub fn replace_geometry(&mut self, geometry: Geometry) {
        debug_assert_eq!(
            self.entries.len(),
            geometry.chapters_per_volume as usize * geometry.page_map_entries_per_chapter(),
        );
        self.geometry = geometry;
    }

    /// Write the map to `writer`.
    pub fn save(&self, mut writer: impl io::Write) -> Result<(), PageMapError> {
        let mut buffer = Vec::with_capacity(PAGE_MAP_HEADER_SIZE + self.entries.len() * 2);
        let mut encoder = Encoder::new(&mut buffer);
        encoder.bytes(PAGE_MAP_MAGIC);
        encoder.u64(self.last_update);
        for entry in self.entries.iter() {
            encoder.u16(*entry);
        }
        encoder.finish(Self::saved_size(&self.geometry))?;

        writer.write_all(&buffer)?;
        writer.flush()?;
        Ok(())
    }

    /// Read a map for the geometry from `reader`.
    pub fn load(geometry: Geometry, mut reader: impl io::Read) -> Result<Self, PageMapError> {
        let mut buffer = vec![0; Self::saved_size(&geometry)];
        reader.read_exact(&mut buffer)?;

        let mut decoder = Decoder::new(&buffer);
        if decoder.array::<8>()? != *PAGE_MAP_MAGIC {
            return Err(PageMapError::Decode(DecodeError::BadMagic("page map")));
        }
        let last_update = decoder.u64()?;

        let mut map = Self::new(geometry);
        map.last_update = last_update;
        for entry in map.entries.iter_mut() {
            *entry = decoder.u16()?;
        }
        decoder.finish()?;

        Ok(map)
    }
}
