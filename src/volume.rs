//! Page access to the chapter volume.
//!
//! The volume region is looked up from the shared layout on every access,
//! so page I/O follows the layout when a chapter relocation moves it.

use std::io;
use std::io::{Read, Write};

use crate::geometry::Geometry;
use crate::index_layout::{LayoutError, SharedIndexLayout};

#[derive(Debug, thiserror::Error)]
/// An error preventing a volume page from being read or written.
pub enum VolumeError {
    #[error(transparent)]
    /// An IO error occurred.
    Io(#[from] io::Error),
    #[error(transparent)]
    /// The page lies outside the volume region.
    Layout(#[from] LayoutError),
    #[error("page {page} is outside the volume of {pages_per_volume} pages")]
    /// The physical page does not exist in the volume geometry.
    PageOutOfRange {
        /// The physical page requested.
        page: u64,
        /// The number of chapter pages in the volume.
        pages_per_volume: u64,
    },
    #[error("chapter has {actual} pages but the geometry requires {expected}")]
    /// The number of pages passed does not match the chapter size.
    WrongChapterLength {
        /// The pages per chapter of the geometry.
        expected: usize,
        /// The number of pages provided.
        actual: usize,
    },
    #[error("page buffer is {actual} bytes but pages are {expected} bytes")]
    /// The page buffer does not match the geometry.
    WrongPageSize {
        /// The page size of the geometry.
        expected: usize,
        /// The size of the buffer provided.
        actual: usize,
    },
}

#[derive(Debug, Clone, Eq, PartialEq)]
/// A single page of volume data.
pub struct Page {
    data: Vec<u8>,
}

impl Page {
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// The chapter volume of an index.
pub struct Volume {
    layout: SharedIndexLayout,
    geometry: Geometry,
}

impl Volume {
    /// Creates a new volume over the layout's volume region.
    pub fn new(layout: SharedIndexLayout, geometry: Geometry) -> Self {
        Self { layout, geometry }
    }

    #[inline]
    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// Swap in a new geometry after a chapter relocation.
    pub fn replace_geometry(&mut self, geometry: Geometry) {
        tracing::debug!(
            chapters_per_volume = geometry.chapters_per_volume,
            remapped_virtual = geometry.remapped_virtual,
            remapped_physical = geometry.remapped_physical,
            "replacing volume geometry",
        );
        self.geometry = geometry;
    }

    /// Allocate a zeroed page sized for the volume geometry.
    pub fn initialize_page(&self) -> Page {
        Page {
            data: vec![0; self.geometry.bytes_per_page],
        }
    }

    /// Read the physical page into `page`.
    ///
    /// Physical page 0 is the volume header, chapter pages start at 1.
    pub fn read_page(&self, physical_page: u64, page: &mut Page) -> Result<(), VolumeError> {
        let offset = self.page_offset(physical_page, page)?;
        let mut reader = self
            .layout
            .lock()
            .open_volume_reader(offset, self.geometry.bytes_per_page)?;
        reader.read_exact(&mut page.data)?;
        Ok(())
    }

    /// Write `page` to the physical page and sync it.
    pub fn write_page(&self, physical_page: u64, page: &Page) -> Result<(), VolumeError> {
        let offset = self.page_offset(physical_page, page)?;
        let mut writer = self
            .layout
            .lock()
            .open_volume_writer(offset, self.geometry.bytes_per_page)?;
        writer.write_all(&page.data)?;
        writer.flush()?;
        Ok(())
    }

    /// Write every page of a chapter to the physical chapter slot.
    pub fn write_chapter(&self, physical_chapter: u32, pages: &[Page]) -> Result<(), VolumeError> {
        let pages_per_chapter = self.geometry.pages_per_chapter() as usize;
        if pages.len() != pages_per_chapter {
            return Err(VolumeError::WrongChapterLength {
                expected: pages_per_chapter,
                actual: pages.len(),
            });
        }

        for (page_number, page) in pages.iter().enumerate() {
            let physical_page = self
                .geometry
                .map_to_physical_page(physical_chapter, page_number as u32);
            self.write_page(physical_page, page)?;
        }
        Ok(())
    }

    /// Read a page of a virtual chapter.
    pub fn read_chapter_page(
        &self,
        virtual_chapter: u64,
        page_number: u32,
        page: &mut Page,
    ) -> Result<(), VolumeError> {
        let physical_chapter = self.geometry.map_to_physical_chapter(virtual_chapter);
        let physical_page = self
            .geometry
            .map_to_physical_page(physical_chapter, page_number);
        self.read_page(physical_page, page)
    }

    fn page_offset(&self, physical_page: u64, page: &Page) -> Result<u64, VolumeError> {
        if page.data.len() != self.geometry.bytes_per_page {
            return Err(VolumeError::WrongPageSize {
                expected: self.geometry.bytes_per_page,
                actual: page.data.len(),
            });
        }

        // Includes the header page.
        let pages_per_volume = self.geometry.pages_per_volume() + 1;
        if physical_page >= pages_per_volume {
            return Err(VolumeError::PageOutOfRange {
                page: physical_page,
                pages_per_volume,
            });
        }
        Ok(physical_page * self.geometry.bytes_per_page as u64)
    }
}
