//! Storage abstraction for the chapter volume.
//!
//! The index core reads and writes chapters through the [`Volume`] trait so
//! tests can substitute in-memory doubles. [`RamVolume`] is the bundled
//! implementation.
//!
//! A volume carries a lookup mode: during replay and rebuild the mode is
//! switched to [`LookupMode::ForRebuild`] so the page cache bypasses its
//! usual admission heuristics. The switch is scoped through
//! [`begin_rebuild_lookup`], which restores the prior mode on every exit
//! path.

mod page_map;
mod ram;

pub use page_map::{IndexPageMap, PageMapEntry};
pub use ram::RamVolume;

use crate::error::Result;
use crate::record::{ChunkData, ChunkName, ChunkRecord};

/// How volume lookups should treat the page cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LookupMode {
    /// Normal request-path lookups.
    #[default]
    Normal,
    /// Replay/rebuild traversal.
    ForRebuild,
}

/// The chapter span found on a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChapterBoundaries {
    /// The lowest virtual chapter present.
    pub lowest: u64,
    /// The highest virtual chapter present.
    pub highest: u64,
    /// True when no chapters have ever been written.
    pub is_empty: bool,
}

/// The delta-list coverage declared by one on-disk index page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexPageBounds {
    /// First delta list summarized by the page.
    pub lowest_list: u32,
    /// Last delta list summarized by the page.
    pub highest_list: u32,
}

/// Page I/O and chapter persistence for the index core.
pub trait Volume: Send + Sync + 'static {
    /// Discover the span of chapters present on the volume.
    fn find_chapter_boundaries(&self) -> Result<ChapterBoundaries>;

    /// Read the declared bounds of one index page. `index_page` is in
    /// `[0, index_pages_per_chapter)`.
    fn get_index_page(&self, physical_chapter: u32, index_page: u32) -> Result<IndexPageBounds>;

    /// Read the records of one record page. `page` is the absolute page
    /// number within the chapter, so in
    /// `[index_pages_per_chapter, pages_per_chapter)`.
    fn get_record_page(&self, physical_chapter: u32, page: u32) -> Result<Vec<ChunkRecord>>;

    /// Hint that `count` pages starting at `first_page` are about to be read.
    fn prefetch_pages(&self, physical_chapter: u32, first_page: u32, count: u32) {
        let _ = (physical_chapter, first_page, count);
    }

    /// Confirm through the page cache whether the chapter currently holding
    /// `vcn` contains `name`, returning its stored metadata if so.
    fn search_record_pages(&self, name: &ChunkName, vcn: u64) -> Result<Option<ChunkData>>;

    /// Persist a closed chapter into its physical slot.
    fn write_chapter(
        &self,
        vcn: u64,
        physical_chapter: u32,
        index_pages: Vec<IndexPageBounds>,
        record_pages: Vec<Vec<ChunkRecord>>,
    ) -> Result<()>;

    /// Switch the lookup mode, returning the prior mode.
    fn set_lookup_mode(&self, mode: LookupMode) -> LookupMode;

    /// The current lookup mode.
    fn lookup_mode(&self) -> LookupMode;

    /// The index-page map owned by this volume.
    fn page_map(&self) -> &IndexPageMap;

    /// Bytes held by the volume's page cache.
    fn cache_size(&self) -> u64;
}

/// Scoped switch of a volume into rebuild lookup mode.
///
/// Dropping the guard restores whatever mode was active before, including on
/// error paths that unwind out of a replay.
pub struct RebuildLookupGuard<'a, V: Volume + ?Sized> {
    volume: &'a V,
    prior: LookupMode,
}

/// Put `volume` into [`LookupMode::ForRebuild`] until the guard drops.
pub fn begin_rebuild_lookup<V: Volume + ?Sized>(volume: &V) -> RebuildLookupGuard<'_, V> {
    let prior = volume.set_lookup_mode(LookupMode::ForRebuild);
    RebuildLookupGuard { volume, prior }
}

impl<V: Volume + ?Sized> Drop for RebuildLookupGuard<'_, V> {
    fn drop(&mut self) {
        self.volume.set_lookup_mode(self.prior);
    }
}
