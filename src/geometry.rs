//! Volume geometry and index configuration.

/// The size of a single record (name and metadata) in bytes.
pub const BYTES_PER_RECORD: usize = 32;
/// The number of pages at the start of the volume before chapter 0.
pub const HEADER_PAGES_PER_VOLUME: u64 = 1;
/// The maximum number of master index zones in a save.
pub const MAX_ZONES: u32 = 16;
/// The smallest number of chapters a volume can have.
pub const MIN_CHAPTERS_PER_VOLUME: u32 = 2;

#[derive(Debug, thiserror::Error)]
/// An error caused by invalid geometry or configuration parameters.
pub enum GeometryError {
    #[error("bytes per page ({0}) must be a non-zero multiple of {BYTES_PER_RECORD}")]
    /// Pages cannot hold a whole number of records.
    InvalidPageSize(usize),
    #[error("chapters need at least one record page and two index pages")]
    /// A chapter has too few pages.
    InvalidChapterPages,
    #[error("chapters per volume ({0}) must be at least {MIN_CHAPTERS_PER_VOLUME}")]
    /// The volume has too few chapters.
    TooFewChapters(u32),
    #[error("remapped physical chapter {0} is outside the volume")]
    /// The remapped physical chapter is not a valid chapter number.
    InvalidRemap(u64),
    #[error("zone count ({0}) must be between 1 and {MAX_ZONES}")]
    /// The zone count is out of range.
    InvalidZoneCount(u32),
    #[error("mean delta must be non-zero")]
    /// The master index mean delta is zero.
    InvalidMeanDelta,
}

#[derive(
    Debug, Copy, Clone, Eq, PartialEq, serde_derive::Serialize, serde_derive::Deserialize,
)]
/// The shape of the chapter volume.
pub struct Geometry {
    /// The size of a page in bytes.
    pub bytes_per_page: usize,
    /// The number of record pages in each chapter.
    pub record_pages_per_chapter: u32,
    /// The number of chapter index pages in each chapter.
    pub index_pages_per_chapter: u32,
    /// The number of chapters in the volume.
    pub chapters_per_volume: u32,
    /// The virtual chapter which was moved by a chapter relocation.
    pub remapped_virtual: u64,
    /// The physical chapter the remapped virtual chapter lives in.
    pub remapped_physical: u64,
}

impl Geometry {
    /// Creates a new geometry, validating its parameters.
    pub fn new(
        bytes_per_page: usize,
        record_pages_per_chapter: u32,
        index_pages_per_chapter: u32,
        chapters_per_volume: u32,
        remapped_virtual: u64,
        remapped_physical: u64,
    ) -> Result<Self, GeometryError> {
        if bytes_per_page == 0 || bytes_per_page % BYTES_PER_RECORD != 0 {
            return Err(GeometryError::InvalidPageSize(bytes_per_page));
        }
        if record_pages_per_chapter == 0 || index_pages_per_chapter < 2 {
            return Err(GeometryError::InvalidChapterPages);
        }
        if chapters_per_volume < MIN_CHAPTERS_PER_VOLUME {
            return Err(GeometryError::TooFewChapters(chapters_per_volume));
        }
        if remapped_physical >= chapters_per_volume as u64 {
            return Err(GeometryError::InvalidRemap(remapped_physical));
        }

        Ok(Self {
            bytes_per_page,
            record_pages_per_chapter,
            index_pages_per_chapter,
            chapters_per_volume,
            remapped_virtual,
            remapped_physical,
        })
    }

    #[inline]
    pub fn pages_per_chapter(&self) -> u32 {
        self.record_pages_per_chapter + self.index_pages_per_chapter
    }

    #[inline]
    pub fn bytes_per_chapter(&self) -> u64 {
        self.pages_per_chapter() as u64 * self.bytes_per_page as u64
    }

    #[inline]
    pub fn pages_per_volume(&self) -> u64 {
        self.pages_per_chapter() as u64 * self.chapters_per_volume as u64
    }

    /// The size of the volume in bytes, including its header page.
    pub fn bytes_per_volume(&self) -> u64 {
        (HEADER_PAGES_PER_VOLUME + self.pages_per_volume()) * self.bytes_per_page as u64
    }

    #[inline]
    pub fn records_per_page(&self) -> u64 {
        (self.bytes_per_page / BYTES_PER_RECORD) as u64
    }

    #[inline]
    pub fn records_per_chapter(&self) -> u64 {
        self.records_per_page() * self.record_pages_per_chapter as u64
    }

    #[inline]
    pub fn records_per_volume(&self) -> u64 {
        self.records_per_chapter() * self.chapters_per_volume as u64
    }

    #[inline]
    /// The number of index page map entries kept for each chapter.
    ///
    /// The last index page of a chapter always covers the remaining delta
    /// lists, so it has no entry.
    pub fn page_map_entries_per_chapter(&self) -> usize {
        self.index_pages_per_chapter as usize - 1
    }

    #[inline]
    /// Returns if the geometry has been reduced by a chapter relocation.
    pub fn is_reduced(&self) -> bool {
        self.remapped_virtual != 0 || self.remapped_physical != 0
    }

    /// Map a virtual chapter number to the physical chapter holding it.
    pub fn map_to_physical_chapter(&self, virtual_chapter: u64) -> u32 {
        let chapters = self.chapters_per_volume as u64;
        if !self.is_reduced() {
            return (virtual_chapter % chapters) as u32;
        }

        let remapped_virtual = self.remapped_virtual;
        let remapped_physical = self.remapped_physical;

        if virtual_chapter == remapped_virtual {
            return remapped_physical as u32;
        }

        if virtual_chapter > remapped_virtual {
            let delta = virtual_chapter - remapped_virtual;
            let physical = if delta > remapped_physical {
                delta % chapters
            } else {
                delta - 1
            };
            return physical as u32;
        }

        let delta = remapped_virtual - virtual_chapter;
        if delta < chapters {
            (chapters - delta) as u32
        } else {
            // Chapters this old have been overwritten, any slot will do.
            0
        }
    }

    #[inline]
    /// Map a page within a physical chapter to its page number in the volume.
    pub fn map_to_physical_page(&self, physical_chapter: u32, page: u32) -> u64 {
        HEADER_PAGES_PER_VOLUME
            + physical_chapter as u64 * self.pages_per_chapter() as u64
            + page as u64
    }
}

#[derive(
    Debug, Clone, Eq, PartialEq, serde_derive::Serialize, serde_derive::Deserialize,
)]
/// The configuration an index is created with.
pub struct IndexConfig {
    /// The shape of the chapter volume.
    pub geometry: Geometry,
    /// The number of master index zones written by each save.
    pub zone_count: u32,
    /// The number of extra save slots reserved for checkpoints.
    pub checkpoint_count: u32,
    /// The mean delta between record addresses in the master index.
    pub master_index_mean_delta: u32,
}

impl IndexConfig {
    /// Creates a new config, validating its parameters.
    pub fn new(
        geometry: Geometry,
        zone_count: u32,
        checkpoint_count: u32,
        master_index_mean_delta: u32,
    ) -> Result<Self, GeometryError> {
        let config = Self {
            geometry,
            zone_count,
            checkpoint_count,
            master_index_mean_delta,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check the parameters are within their valid ranges.
    pub fn validate(&self) -> Result<(), GeometryError> {
        if self.zone_count == 0 || self.zone_count > MAX_ZONES {
            return Err(GeometryError::InvalidZoneCount(self.zone_count));
        }
        if self.master_index_mean_delta == 0 {
            return Err(GeometryError::InvalidMeanDelta);
        }
        Geometry::new(
            self.geometry.bytes_per_page,
            self.geometry.record_pages_per_chapter,
            self.geometry.index_pages_per_chapter,
            self.geometry.chapters_per_volume,
            self.geometry.remapped_virtual,
            self.geometry.remapped_physical,
        )?;
        Ok(())
    }

    #[inline]
    /// The number of save slots in the layout, never fewer than 2.
    pub fn num_saves(&self) -> u32 {
        2 + self.checkpoint_count
    }

    /// Returns if `stored` is this config, or this config after exactly one
    /// chapter relocation.
    pub fn accepts_stored(&self, stored: &IndexConfig) -> bool {
        if self == stored {
            return true;
        }

        let ours = &self.geometry;
        let theirs = &stored.geometry;
        self.zone_count == stored.zone_count
            && self.checkpoint_count == stored.checkpoint_count
            && self.master_index_mean_delta == stored.master_index_mean_delta
            && !ours.is_reduced()
            && ours.bytes_per_page == theirs.bytes_per_page
            && ours.record_pages_per_chapter == theirs.record_pages_per_chapter
            && ours.index_pages_per_chapter == theirs.index_pages_per_chapter
            && ours.chapters_per_volume == theirs.chapters_per_volume + 1
    }
}
