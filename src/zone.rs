//! Per-zone request handling.
//!
//! Each zone owns an open chapter and a private window onto the chapter
//! sequence. The zone handler is only correct for LRU use: a hit on an older
//! chapter re-homes the record into the open chapter so recently seen chunks
//! stay indexed the longest.

use std::sync::Arc;

use crate::chapter::writer::ChapterWriter;
use crate::chapter::OpenChapter;
use crate::error::{IndexError, Result};
use crate::geometry::Geometry;
use crate::master_index::MasterIndex;
use crate::record::{ChunkData, ChunkRecord};
use crate::request::{Location, Request, RequestAction};
use crate::sparse::{BarrierMessage, SparseCache, SEARCH_ALL_CHAPTERS};
use crate::volume::Volume;

/// One zone of the index.
pub struct IndexZone<V: Volume> {
    zone_number: u32,
    zone_count: u32,
    geometry: Arc<Geometry>,
    volume: Arc<V>,
    master_index: Arc<MasterIndex>,
    sparse_cache: Arc<SparseCache>,
    writer: ChapterWriter,
    open_chapter: OpenChapter,
    newest_virtual_chapter: u64,
    oldest_virtual_chapter: u64,
}

impl<V: Volume> IndexZone<V> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        zone_number: u32,
        zone_count: u32,
        geometry: Arc<Geometry>,
        volume: Arc<V>,
        master_index: Arc<MasterIndex>,
        sparse_cache: Arc<SparseCache>,
        writer: ChapterWriter,
    ) -> Self {
        let capacity = geometry.records_per_chapter() as usize;
        Self {
            zone_number,
            zone_count,
            geometry,
            volume,
            master_index,
            sparse_cache,
            writer,
            open_chapter: OpenChapter::new(capacity),
            newest_virtual_chapter: 0,
            oldest_virtual_chapter: 0,
        }
    }

    /// The zone's view of the open chapter number.
    pub fn newest_virtual_chapter(&self) -> u64 {
        self.newest_virtual_chapter
    }

    /// The zone's view of the oldest live chapter.
    pub fn oldest_virtual_chapter(&self) -> u64 {
        self.oldest_virtual_chapter
    }

    /// Records currently held in the zone's open chapter.
    pub fn open_chapter_size(&self) -> usize {
        self.open_chapter.size()
    }

    /// Align the zone's chapter window after a load or rebuild.
    pub(crate) fn set_active_chapters(&mut self, newest: u64, oldest: u64) {
        self.newest_virtual_chapter = newest;
        self.oldest_virtual_chapter = oldest;
        self.open_chapter.reset();
    }

    /// Refill the open chapter from a clean save.
    pub(crate) fn restore_open_chapter(&mut self, records: Vec<ChunkRecord>) -> Result<()> {
        self.open_chapter.reset();
        for ChunkRecord { name, data } in records {
            self.open_chapter.put(name, data)?;
        }
        Ok(())
    }

    /// Snapshot the open chapter for a save.
    pub(crate) fn open_chapter_records(&self) -> Vec<ChunkRecord> {
        self.open_chapter.live_records()
    }

    /// Handle one request routed to this zone.
    pub(crate) fn dispatch(&mut self, request: &mut Request) -> Result<()> {
        if !request.requeued {
            // Single-zone sparse indexes have no triage stage to emit cache
            // barrier messages, so synthesize one here.
            self.simulate_barrier_message(request)?;
        }

        // Default location; overwritten if the chunk turns up.
        request.location = Location::Unavailable;

        match request.action {
            RequestAction::Index | RequestAction::Update | RequestAction::Query => {
                self.search(request)
            }
            RequestAction::Delete => self.remove(request),
        }
    }

    /// Search for the request's chunk and apply any required mutation.
    fn search(&mut self, request: &mut Request) -> Result<()> {
        let mut record = self.master_index.get_record(&request.chunk_name)?;

        let mut found = false;
        if record.is_found {
            found = self.get_record_for_request(request, record.virtual_chapter)?;
            if found {
                request.location = self.compute_index_region(record.virtual_chapter);
            }
        }

        // A record that overflowed a chapter index in more than one chapter
        // (or overflowed once and collided) exists as a collision record in
        // the master index but is not in the volume.
        let overflow_record = record.is_found && record.is_collision && !found;
        let chapter = self.newest_virtual_chapter;
        if found || overflow_record {
            if request.action == RequestAction::Query && (!request.update || overflow_record) {
                // A query without update, or with nothing to update.
                return Ok(());
            }

            if record.virtual_chapter != chapter {
                // Re-home the record in the open chapter. If the entry had
                // been deleted or dropped from the chapter index, it will be
                // back.
                match self.master_index.set_record_chapter(&mut record, chapter) {
                    Err(IndexError::Overflow) => return Ok(()),
                    other => other?,
                }
            } else if request.action != RequestAction::Update {
                // Already in the open chapter.
                return Ok(());
            }
        } else {
            // Not in the master index; a cached sparse chapter may still
            // hold the name.
            if !self.master_index.is_sample(&request.chunk_name) && self.geometry.is_sparse() {
                if let Some(data) = self
                    .sparse_cache
                    .search(&request.chunk_name, SEARCH_ALL_CHAPTERS)
                {
                    found = true;
                    request.old_metadata = data;
                    request.location = Location::InSparse;
                }
            }

            if request.action == RequestAction::Query && (!found || !request.update) {
                // A query without update or for a new record.
                return Ok(());
            }

            // New entry referencing the open chapter. Done for new records
            // and for records rescued from cached sparse chapters alike.
            match self.master_index.put_record(&record, chapter) {
                Err(IndexError::Overflow) => {
                    // Delta list overflow was already counted; go on without
                    // adding the chunk to the open chapter.
                    tracing::debug!(name = %request.chunk_name, "dropping record on overflow");
                    return Ok(());
                }
                other => other?,
            }
        }

        let metadata = if !found || request.action == RequestAction::Update {
            request.new_metadata
        } else {
            // Duplicate chunk: move the existing record to the open chapter.
            request.old_metadata
        };
        self.put_record_in_zone(request, metadata)
    }

    /// Remove the request's chunk from the index.
    fn remove(&mut self, request: &mut Request) -> Result<()> {
        let record = self.master_index.get_record(&request.chunk_name)?;
        if !record.is_found {
            return Ok(());
        }

        if !record.is_collision {
            // Non-collision records are hints; resolve the name in the
            // chapter before believing it.
            let found = self.get_record_for_request(request, record.virtual_chapter)?;
            if !found {
                return Ok(());
            }
        }

        request.location = self.compute_index_region(record.virtual_chapter);

        // Delete the entry for the named record only. A colliding name in
        // the same chapter can leave a stale hint behind, about 1 in 2^21.
        self.master_index.remove_record(&record)?;

        if request.location == Location::InOpenChapter {
            let existed = self.open_chapter.remove(&request.chunk_name);
            if !existed {
                return Err(IndexError::BadState(
                    "removing record not found in open chapter".into(),
                ));
            }
        }
        Ok(())
    }

    /// Resolve a chapter hit: open chapter, sparse cache, or volume.
    fn get_record_for_request(&mut self, request: &mut Request, vcn: u64) -> Result<bool> {
        if vcn == self.newest_virtual_chapter {
            if let Some(data) = self.open_chapter.find(&request.chunk_name) {
                request.old_metadata = *data;
                return Ok(true);
            }
            return Ok(false);
        }
        if self.is_zone_chapter_sparse(vcn) {
            match self.sparse_cache.search(&request.chunk_name, vcn) {
                Some(data) => {
                    request.old_metadata = data;
                    Ok(true)
                }
                None => Ok(false),
            }
        } else {
            match self.volume.search_record_pages(&request.chunk_name, vcn)? {
                Some(data) => {
                    request.old_metadata = data;
                    Ok(true)
                }
                None => Ok(false),
            }
        }
    }

    /// Add a record to the open chapter, closing it if that fills it.
    fn put_record_in_zone(&mut self, request: &mut Request, metadata: ChunkData) -> Result<()> {
        self.open_chapter.put(request.chunk_name, metadata)?;
        if self.open_chapter.is_full() {
            self.open_next_chapter()?;
        }
        Ok(())
    }

    /// Close the open chapter and start the next one.
    fn open_next_chapter(&mut self) -> Result<()> {
        let closed = self.newest_virtual_chapter;
        tracing::debug!(
            zone = self.zone_number,
            vcn = closed,
            records = self.open_chapter.size(),
            "closing chapter"
        );
        self.writer
            .start_closing_chapter(self.zone_number, closed, self.open_chapter.live_records())?;

        self.newest_virtual_chapter += 1;
        if self.newest_virtual_chapter - self.oldest_virtual_chapter
            > u64::from(self.geometry.chapters_per_volume)
        {
            let victim = self.oldest_virtual_chapter;
            self.oldest_virtual_chapter += 1;
            if self.geometry.is_sparse() {
                self.sparse_cache.forget_chapter(victim);
            }
        }
        self.master_index
            .set_zone_open_chapter(self.zone_number, self.newest_virtual_chapter);
        self.open_chapter.reset();
        Ok(())
    }

    /// Simulate the triage stage's sparse-cache barrier message.
    ///
    /// A multi-zone index orders sparse-cache mutations through a dedicated
    /// triage stage; a single-zone sparse index executes the equivalent
    /// barrier inline. Multi-zone or dense indexes do nothing here.
    fn simulate_barrier_message(&mut self, request: &Request) -> Result<()> {
        if self.zone_count > 1 || !self.geometry.is_sparse() {
            return Ok(());
        }

        let sparse_vcn = self.triage(request);
        if sparse_vcn == SEARCH_ALL_CHAPTERS {
            // Not indexed, not a sample, or in a chapter outside the sparse
            // window: the cache needs no change.
            return Ok(());
        }

        self.sparse_cache.execute_barrier(
            self.volume.as_ref(),
            &self.geometry,
            BarrierMessage {
                virtual_chapter: sparse_vcn,
            },
        )
    }

    /// The sparse chapter a request would need a barrier for, or
    /// [`SEARCH_ALL_CHAPTERS`] when none applies.
    pub(crate) fn triage(&self, request: &Request) -> u64 {
        let triage = self.master_index.lookup_name(&request.chunk_name);
        if !triage.in_sampled_chapter {
            return SEARCH_ALL_CHAPTERS;
        }
        if !self.is_zone_chapter_sparse(triage.virtual_chapter) {
            return SEARCH_ALL_CHAPTERS;
        }
        triage.virtual_chapter
    }

    /// Classify a chapter for the request's result location.
    pub(crate) fn compute_index_region(&self, vcn: u64) -> Location {
        if vcn == self.newest_virtual_chapter {
            Location::InOpenChapter
        } else if self.is_zone_chapter_sparse(vcn) {
            Location::InSparse
        } else {
            Location::InDense
        }
    }

    /// Whether the zone's window classifies `vcn` as sparse.
    pub(crate) fn is_zone_chapter_sparse(&self, vcn: u64) -> bool {
        self.geometry.is_chapter_sparse(
            self.oldest_virtual_chapter,
            self.newest_virtual_chapter,
            vcn,
        )
    }
}
