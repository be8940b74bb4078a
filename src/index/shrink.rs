use super::{Index, IndexError};
use crate::geometry::{Geometry, MIN_CHAPTERS_PER_VOLUME};

impl Index {
    #[tracing::instrument("index::shrink_by_one_chapter", skip_all)]
    /// Give up one chapter of the volume, returning the bytes reclaimed.
    ///
    /// The chapter held in physical chapter 0 is relocated over the slot the
    /// next chapter would have been written to, and the layout moves forward
    /// by one chapter so the space before it can be handed back. The oldest
    /// chapter is expired first when the volume is full. Any save made
    /// before the shrink is invalidated, the index must be saved again.
    pub fn shrink_by_one_chapter(&mut self) -> Result<u64, IndexError> {
        let geometry = *self.volume.geometry();
        let chapters = geometry.chapters_per_volume;
        if geometry.is_reduced() || chapters < self.created_chapters {
            return Err(IndexError::AlreadyReduced);
        }
        if chapters <= MIN_CHAPTERS_PER_VOLUME {
            return Err(IndexError::VolumeTooSmall(chapters));
        }

        let chapters_u64 = chapters as u64;
        if self.newest_virtual_chapter - self.oldest_virtual_chapter > chapters_u64 - 2 {
            self.oldest_virtual_chapter += 1;
            self.need_to_save = true;
            tracing::debug!(
                oldest_virtual_chapter = self.oldest_virtual_chapter,
                "expired oldest chapter",
            );
        }

        let mut remapped_virtual =
            self.newest_virtual_chapter - self.newest_virtual_chapter % chapters_u64;
        let new_physical = ((self.newest_virtual_chapter + 1) % chapters_u64) as u32;
        let relocate = new_physical != 0;
        if !relocate {
            // Chapter 0 is the next to be overwritten, nothing to keep.
            remapped_virtual += chapters_u64;
        }

        let reduced = Geometry::new(
            geometry.bytes_per_page,
            geometry.record_pages_per_chapter,
            geometry.index_pages_per_chapter,
            chapters - 1,
            remapped_virtual,
            new_physical.saturating_sub(1) as u64,
        )?;
        let mut page_map = self.page_map.clone();
        page_map.reduce(new_physical)?;
        page_map.replace_geometry(reduced);
        let mut config = self.config.clone();
        config.geometry = reduced;

        // Until the layout is updated the index keeps its old geometry and
        // page map, the copy only overwrites a chapter that is no longer live.
        if relocate {
            self.copy_chapter(0, new_physical)?;
        }

        let reclaimed = geometry.bytes_per_chapter();
        let result = self.layout.lock().update_layout(&config, reclaimed);
        if let Err(err) = result {
            // The save slots may already have been emptied on disk.
            self.need_to_save = true;
            // The new header and config blocks fall inside physical chapter 0.
            if relocate {
                if let Err(restore_err) = self.copy_chapter(new_physical, 0) {
                    tracing::error!(error = %restore_err, "failed to restore physical chapter 0");
                }
            }
            return Err(err.into());
        }

        self.page_map = page_map;
        self.volume.replace_geometry(reduced);
        self.config = config;
        self.need_to_save = true;

        tracing::info!(
            chapters_per_volume = reduced.chapters_per_volume,
            remapped_virtual = reduced.remapped_virtual,
            remapped_physical = reduced.remapped_physical,
            reclaimed_bytes = reclaimed,
            "reduced index by one chapter",
        );

        Ok(reclaimed)
    }

    /// Copy every page of physical chapter `source` over physical chapter `target`.
    fn copy_chapter(&self, source: u32, target: u32) -> Result<(), IndexError> {
        let geometry = self.volume.geometry();
        let mut page = self.volume.initialize_page();
        for page_number in 0..geometry.pages_per_chapter() {
            let from = geometry.map_to_physical_page(source, page_number);
            let to = geometry.map_to_physical_page(target, page_number);
            self.volume.read_page(from, &mut page)?;
            self.volume.write_page(to, &page)?;
        }
        tracing::debug!(source = source, target = target, "copied physical chapter");
        Ok(())
    }
}
