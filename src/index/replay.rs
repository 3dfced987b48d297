//! Volume traversal that repopulates the master index and index-page map.
//!
//! Replay walks every record slot of every chapter in `[from, newest)`,
//! feeding each chunk name back into the master index, and rebuilds the
//! index-page map from the chapters' index pages. It never writes to the
//! open chapter or to the volume.

use crate::error::{IndexError, Result};
use crate::record::ChunkName;
use crate::volume::{begin_rebuild_lookup, Volume};

use super::DedupIndex;

impl<V: Volume> DedupIndex<V> {
    /// Replay chapters `[from_vcn, newest)` into the master index.
    ///
    /// The caller must already have made `newest` and `oldest`
    /// authoritative on the chapter ring.
    pub(crate) fn replay_volume(&self, from_vcn: u64) -> Result<()> {
        let upto_vcn = self.ring().newest();
        tracing::info!(from = from_vcn, through = upto_vcn, "replaying volume");

        // Moving the open chapter marker up and back down drains stale
        // per-zone chapter state before the replay begins.
        self.master_index().set_open_chapter(upto_vcn);
        self.master_index().set_open_chapter(from_vcn);

        let mode_guard = begin_rebuild_lookup(self.volume().as_ref());
        let geometry = self.geometry().clone();
        let old_map_update = self.volume().page_map().last_update();

        for vcn in from_vcn..upto_vcn {
            if self.check_for_suspend() {
                tracing::info!(vcn, "replay interrupted by index shutdown");
                return Err(IndexError::ShuttingDown);
            }

            let will_be_sparse_chapter = geometry.is_chapter_sparse(from_vcn, upto_vcn, vcn);
            let physical = geometry.map_to_physical_chapter(vcn);
            self.volume()
                .prefetch_pages(physical, 0, geometry.pages_per_chapter());
            self.master_index().set_open_chapter(vcn);

            self.rebuild_index_page_map(vcn).map_err(|error| {
                tracing::error!(
                    chapter = physical,
                    error = %error,
                    "could not rebuild index page map"
                );
                error
            })?;

            for offset in 0..geometry.record_pages_per_chapter {
                let page = geometry.index_pages_per_chapter + offset;
                let records = self.volume().get_record_page(physical, page).map_err(|error| {
                    tracing::error!(page, error = %error, "could not get record page");
                    error
                })?;
                for record in records {
                    self.replay_record(&record.name, vcn, will_be_sparse_chapter)
                        .map_err(|error| {
                            tracing::error!(
                                name = %record.name,
                                error = %error,
                                "could not replay block during rebuild"
                            );
                            error
                        })?;
                }
            }
        }
        drop(mode_guard);

        // Also reap the chapter being replaced by the open chapter.
        self.master_index().set_open_chapter(upto_vcn);

        let new_map_update = self.volume().page_map().last_update();
        if new_map_update != old_map_update {
            tracing::info!(
                old = old_map_update,
                new = new_map_update,
                "replay changed the index page map"
            );
        }
        Ok(())
    }

    fn check_for_suspend(&self) -> bool {
        self.load_context()
            .is_some_and(|context| context.check_for_suspend())
    }

    /// Rebuild the index-page map from one chapter's index pages.
    ///
    /// The pages must cover the chapter's delta lists contiguously from list
    /// zero; any gap or overlap is corruption.
    fn rebuild_index_page_map(&self, vcn: u64) -> Result<()> {
        let geometry = self.geometry();
        let chapter = geometry.map_to_physical_chapter(vcn);
        let mut expected_list_number = 0;
        for index_page_number in 0..geometry.index_pages_per_chapter {
            let bounds = self.volume().get_index_page(chapter, index_page_number)?;
            if bounds.lowest_list != expected_list_number {
                return Err(IndexError::CorruptData(format!(
                    "chapter {chapter} index page {index_page_number} is corrupt"
                )));
            }
            self.volume().page_map().update(
                vcn,
                chapter,
                index_page_number,
                bounds.highest_list,
            )?;
            expected_list_number = bounds.highest_list + 1;
        }
        Ok(())
    }

    /// Feed one replayed record back into the master index.
    fn replay_record(
        &self,
        name: &ChunkName,
        virtual_chapter: u64,
        will_be_sparse_chapter: bool,
    ) -> Result<()> {
        if will_be_sparse_chapter && !self.master_index().is_sample(name) {
            // This record will land in a sparse chapter and is not a sample,
            // so it is not indexed.
            return Ok(());
        }

        let mut record = self.master_index().get_record(name)?;
        let update_record = if record.is_found {
            if record.is_collision {
                if record.virtual_chapter == virtual_chapter {
                    // Already correct.
                    return Ok(());
                }
                true
            } else if record.virtual_chapter == virtual_chapter {
                // An entry already points at this chapter, but it may be for
                // a different name. Assume it is; the worst case is one
                // redundant collision record for a deleted record.
                false
            } else {
                // The entry names another chapter. Search that chapter to
                // learn whether it really holds this name.
                self.volume()
                    .search_record_pages(name, record.virtual_chapter)?
                    .is_some()
            }
        } else {
            false
        };

        let result = if update_record {
            self.master_index()
                .set_record_chapter(&mut record, virtual_chapter)
        } else {
            // New entries are added regardless of sparseness; a record that
            // also lives on disk in a sparse chapter gets re-densified here.
            self.master_index().put_record(&record, virtual_chapter)
        };

        match result {
            Err(IndexError::DuplicateName) | Err(IndexError::Overflow) => Ok(()),
            other => other,
        }
    }
}
