//! The index: zones, chapter ring, and lifecycle.
//!
//! [`make_index`] builds the whole engine and runs the load state machine:
//! CREATE discards saved state, LOAD restores it (replaying the tail if the
//! open chapter is missing), and REBUILD falls back to reconstructing
//! everything from the volume when a load fails. Once built, requests are
//! dispatched to the zone named by their `zone_number`; each zone serializes
//! its own work behind its lock.

mod load_context;
mod replay;

pub use load_context::{IndexStatus, LoadContext};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::chapter::writer::ChapterWriter;
use crate::config::IndexConfiguration;
use crate::error::{IndexError, Result};
use crate::geometry::Geometry;
use crate::layout::IndexLayout;
use crate::master_index::MasterIndex;
use crate::record::{ChunkName, ChunkRecord};
use crate::request::Request;
use crate::sparse::SparseCache;
use crate::state::{
    self, IndexState, MasterIndexComponent, PageMapComponent, SavedIndexMeta,
};
use crate::stats::IndexStats;
use crate::volume::{begin_rebuild_lookup, Volume};
use crate::zone::IndexZone;

/// How [`make_index`] should treat any saved state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadType {
    /// Discard saved state and start empty.
    Create,
    /// Require saved state and load it; fail if it was not saved cleanly.
    Load,
    /// As [`LoadType::Load`], but fall back to rebuilding from the volume.
    Rebuild,
}

/// How the index actually came up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadedType {
    /// Fresh index with discarded state.
    Create,
    /// Clean load of saved state.
    Load,
    /// Loaded from a checkpoint with a replay of the tail.
    Replay,
    /// Fully rebuilt from the volume.
    Rebuild,
    /// Rebuild found an empty volume.
    Empty,
}

/// The index-level pair of active chapter counters.
///
/// `newest` names the open chapter; `oldest` the oldest chapter still in the
/// ring. An advance that would let the window exceed the ring size bumps
/// `oldest` so physical slots never alias.
pub struct ChapterRing {
    chapters_per_volume: u64,
    window: Mutex<(u64, u64)>,
}

impl ChapterRing {
    /// Create a ring positioned at chapter zero.
    pub fn new(chapters_per_volume: u32) -> Self {
        Self {
            chapters_per_volume: u64::from(chapters_per_volume),
            window: Mutex::new((0, 0)),
        }
    }

    /// The open chapter number.
    pub fn newest(&self) -> u64 {
        self.window.lock().0
    }

    /// The oldest chapter still in the ring.
    pub fn oldest(&self) -> u64 {
        self.window.lock().1
    }

    /// Reposition both counters (load and rebuild paths).
    pub fn set(&self, newest: u64, oldest: u64) {
        *self.window.lock() = (newest, oldest);
    }

    /// Open the next chapter, reclaiming the oldest slot if needed.
    pub fn advance(&self) {
        let mut window = self.window.lock();
        window.0 += 1;
        if window.0 - window.1 > self.chapters_per_volume {
            window.1 += 1;
        }
    }
}

#[derive(Debug, Default)]
struct CheckpointWindow {
    last: Option<u64>,
    prev: Option<u64>,
}

/// The deduplication index engine.
pub struct DedupIndex<V: Volume> {
    geometry: Arc<Geometry>,
    volume: Arc<V>,
    master_index: Arc<MasterIndex>,
    sparse_cache: Arc<SparseCache>,
    writer: ChapterWriter,
    zones: Vec<Mutex<IndexZone<V>>>,
    zone_count: u32,
    ring: Arc<ChapterRing>,
    checkpoints: Mutex<CheckpointWindow>,
    state: IndexState,
    layout: IndexLayout,
    load_context: Option<Arc<LoadContext>>,
    loaded_type: LoadedType,
    has_saved_open_chapter: AtomicBool,
    unrecoverable: AtomicBool,
    checkpoint_count: AtomicU64,
}

/// Build an index over `volume`, honoring `load_type`.
///
/// The construction either yields a ready index or frees everything and
/// returns the error; in both cases a terminal status is broadcast on
/// `load_context` so a suspender blocked on it never hangs.
pub fn make_index<V: Volume>(
    layout: IndexLayout,
    config: &IndexConfiguration,
    volume: Arc<V>,
    zone_count: u32,
    load_type: LoadType,
    load_context: Option<Arc<LoadContext>>,
) -> Result<DedupIndex<V>> {
    if zone_count == 0 {
        return Err(IndexError::InvalidArgument(
            "zone count must be at least one".into(),
        ));
    }
    let geometry = Arc::new(config.geometry()?);
    let nonce = layout.volume_nonce();
    let master_index = Arc::new(MasterIndex::new(
        &geometry,
        zone_count,
        nonce,
        config.sparse_sample_rate,
    )?);

    let mut index_state = IndexState::new();
    index_state.register(Box::new(MasterIndexComponent(master_index.clone())));
    index_state.register(Box::new(PageMapComponent(volume.clone())));

    let sparse_cache = Arc::new(SparseCache::new(config.sparse_cache_capacity));
    let ring = Arc::new(ChapterRing::new(geometry.chapters_per_volume));
    let writer = ChapterWriter::new((*geometry).clone(), zone_count, volume.clone(), ring.clone());

    let zones = (0..zone_count)
        .map(|zone_number| {
            Mutex::new(IndexZone::new(
                zone_number,
                zone_count,
                geometry.clone(),
                volume.clone(),
                master_index.clone(),
                sparse_cache.clone(),
                writer.clone(),
            ))
        })
        .collect();

    let mut index = DedupIndex {
        geometry,
        volume,
        master_index,
        sparse_cache,
        writer,
        zones,
        zone_count,
        ring,
        checkpoints: Mutex::new(CheckpointWindow::default()),
        state: index_state,
        layout,
        load_context,
        loaded_type: LoadedType::Create,
        has_saved_open_chapter: AtomicBool::new(false),
        unrecoverable: AtomicBool::new(false),
        checkpoint_count: AtomicU64::new(0),
    };

    let result = match load_type {
        LoadType::Create => index.create(),
        LoadType::Load | LoadType::Rebuild => {
            if !index.layout.index_exists() {
                Err(IndexError::NoIndex)
            } else {
                match index.load(load_type == LoadType::Rebuild) {
                    Ok(()) => Ok(()),
                    Err(error @ IndexError::OutOfMemory) => {
                        // A rebuild cannot help an allocation failure.
                        tracing::error!(error = %error, "index could not be loaded");
                        Err(error)
                    }
                    Err(error @ IndexError::ShuttingDown) => {
                        // A clean abort, not a load failure to recover from.
                        tracing::info!("index load interrupted by shutdown");
                        Err(error)
                    }
                    Err(error) => {
                        tracing::error!(error = %error, "index could not be loaded");
                        if load_type == LoadType::Rebuild {
                            index.rebuild().map_err(|rebuild_error| {
                                tracing::error!(
                                    error = %rebuild_error,
                                    "index could not be rebuilt"
                                );
                                rebuild_error
                            })
                        } else {
                            Err(error)
                        }
                    }
                }
            }
        }
    };

    // Wake any thread trying to suspend us, whether or not we made it.
    if let Some(context) = &index.load_context {
        context.publish(if result.is_ok() {
            IndexStatus::Ready
        } else {
            IndexStatus::Failed
        });
    }

    match result {
        Ok(()) => {
            index
                .has_saved_open_chapter
                .store(index.loaded_type == LoadedType::Load, Ordering::Relaxed);
            Ok(index)
        }
        Err(error) => {
            tracing::error!(error = %error, "fatal error in make_index");
            Err(error)
        }
    }
}

impl<V: Volume> DedupIndex<V> {
    fn create(&mut self) -> Result<()> {
        self.layout.discard_state()?;
        self.write_index_meta()?;
        self.loaded_type = LoadedType::Create;
        Ok(())
    }

    fn load(&mut self, allow_replay: bool) -> Result<()> {
        let meta = state::read_index_meta(&self.layout.meta_path())?;
        if meta.zone_count != self.zone_count {
            return Err(IndexError::CorruptComponent(format!(
                "index was saved with {} zones, loading with {}",
                meta.zone_count, self.zone_count
            )));
        }
        self.state.load_components(&self.layout)?;
        let open_records = state::read_open_chapters(&self.layout.open_chapter_path())?;
        let replay_required = open_records.is_none();

        self.ring.set(meta.open_chapter, meta.oldest_chapter);
        let last_checkpoint_chapter = {
            let mut checkpoints = self.checkpoints.lock();
            checkpoints.last = meta.open_chapter.checked_sub(1);
            checkpoints.prev = checkpoints.last;
            checkpoints.last.unwrap_or(0)
        };

        if replay_required && !allow_replay {
            tracing::error!("index not saved cleanly: open chapter missing");
            return Err(IndexError::NotSavedCleanly);
        }

        tracing::info!(
            oldest = self.ring.oldest(),
            through = last_checkpoint_chapter,
            "loaded index"
        );

        if replay_required {
            self.replay_index_from_checkpoint(last_checkpoint_chapter)?;
        } else if self.ring.newest() > 0 {
            self.master_index.set_open_chapter(self.ring.newest());
        }

        let newest = self.ring.newest();
        let oldest = self.ring.oldest();
        for (zone_number, zone) in self.zones.iter().enumerate() {
            let mut zone = zone.lock();
            zone.set_active_chapters(newest, oldest);
            if let Some(zones) = &open_records {
                if let Some(records) = zones.get(zone_number) {
                    zone.restore_open_chapter(records.clone())?;
                }
            }
        }

        self.loaded_type = if replay_required {
            LoadedType::Replay
        } else {
            LoadedType::Load
        };
        Ok(())
    }

    /// Replay the chapters past the last checkpoint after a dirty shutdown.
    fn replay_index_from_checkpoint(&self, last_checkpoint_chapter: u64) -> Result<()> {
        let boundaries = {
            let _mode = begin_rebuild_lookup(self.volume.as_ref());
            self.volume.find_chapter_boundaries()
        }
        .map_err(|error| {
            tracing::error!(error = %error, "cannot replay index: unknown volume chapter boundaries");
            error
        })?;
        if boundaries.lowest > boundaries.highest {
            tracing::error!("cannot replay index: no valid chapters exist");
            return Err(IndexError::CorruptComponent(
                "no valid chapters exist".into(),
            ));
        }
        if boundaries.is_empty {
            // The volume is empty, so the index should also be empty.
            if self.ring.newest() != 0 {
                tracing::error!("cannot replay index from empty volume");
                return Err(IndexError::CorruptComponent(
                    "cannot replay index from empty volume".into(),
                ));
            }
            return Ok(());
        }

        let chapters = u64::from(self.geometry.chapters_per_volume);
        let newest = boundaries.highest + 1;
        let mut oldest = boundaries.lowest;
        if newest == oldest + chapters {
            // Skip the chapter shadowed by the open chapter.
            oldest += 1;
        }
        self.ring.set(newest, oldest);

        let first_replay = last_checkpoint_chapter.max(oldest);
        self.replay_volume(first_replay)
    }

    fn rebuild(&mut self) -> Result<()> {
        let mode_guard = begin_rebuild_lookup(self.volume.as_ref());
        let boundaries = self.volume.find_chapter_boundaries().map_err(|error| {
            tracing::error!(error = %error, "cannot rebuild index: unknown volume chapter boundaries");
            error
        })?;
        if boundaries.lowest > boundaries.highest {
            tracing::error!("cannot rebuild index: no valid chapters exist");
            return Err(IndexError::CorruptComponent(
                "no valid chapters exist".into(),
            ));
        }

        let chapters = u64::from(self.geometry.chapters_per_volume);
        if boundaries.is_empty {
            self.ring.set(0, 0);
        } else {
            let newest = boundaries.highest + 1;
            let mut oldest = boundaries.lowest;
            if newest == oldest + chapters {
                // Skip the chapter shadowed by the open chapter.
                oldest += 1;
            }
            self.ring.set(newest, oldest);
        }
        if self.ring.newest() - self.ring.oldest() > chapters {
            return Err(IndexError::CorruptComponent(
                "cannot rebuild index: volume chapter boundaries too large".into(),
            ));
        }

        self.master_index.set_open_chapter(0);
        if boundaries.is_empty {
            self.loaded_type = LoadedType::Empty;
            return Ok(());
        }

        self.replay_volume(self.ring.oldest())?;
        drop(mode_guard);

        let newest = self.ring.newest();
        let oldest = self.ring.oldest();
        for zone in &self.zones {
            zone.lock().set_active_chapters(newest, oldest);
        }
        self.loaded_type = LoadedType::Rebuild;
        Ok(())
    }

    /// Route a request to its zone and run it.
    ///
    /// Any error escaping the zone handler marks the index unrecoverable;
    /// every request after that fails with [`IndexError::BadState`].
    pub fn dispatch_request(&self, request: &mut Request) -> Result<()> {
        if self.unrecoverable.load(Ordering::Acquire) {
            return Err(IndexError::BadState("index is unrecoverable".into()));
        }
        let zone = self
            .zones
            .get(request.zone_number as usize)
            .ok_or_else(|| {
                IndexError::InvalidArgument(format!(
                    "zone {} out of range for {} zones",
                    request.zone_number, self.zone_count
                ))
            })?;
        let result = zone.lock().dispatch(request);
        if let Err(error) = &result {
            self.unrecoverable.store(true, Ordering::Release);
            tracing::error!(
                error = %error,
                name = %request.chunk_name,
                "request failed, index is now unrecoverable"
            );
        }
        result
    }

    /// The zone that must service requests for `name`.
    pub fn zone_for_name(&self, name: &ChunkName) -> u32 {
        self.master_index.zone_for(name)
    }

    /// The sparse chapter a request would need a barrier message for, or
    /// `u64::MAX` when none applies.
    pub fn triage_index_request(&self, request: &Request) -> u64 {
        match self.zones.get(request.zone_number as usize) {
            Some(zone) => zone.lock().triage(request),
            None => u64::MAX,
        }
    }

    /// Persist the whole index state.
    ///
    /// The caller must have quiesced the zones; save is not safe against a
    /// concurrent chapter close.
    pub fn save(&self) -> Result<()> {
        self.writer.wait_for_idle()?;
        self.finish_checkpointing()?;
        self.begin_save(false, self.ring.newest());

        match self.save_index_state() {
            Err(error) => {
                tracing::info!("save index failed");
                let mut checkpoints = self.checkpoints.lock();
                checkpoints.last = checkpoints.prev;
                Err(error)
            }
            Ok(()) => {
                self.has_saved_open_chapter.store(true, Ordering::Relaxed);
                self.checkpoint_count.fetch_add(1, Ordering::Relaxed);
                tracing::info!(vcn = ?self.checkpoints.lock().last, "finished save");
                Ok(())
            }
        }
    }

    /// Verify no chapter close is still in flight across zones.
    fn finish_checkpointing(&self) -> Result<()> {
        if self.writer.memory_allocated() != 0 {
            return Err(IndexError::BadState(
                "a chapter close is still awaiting zone contributions".into(),
            ));
        }
        Ok(())
    }

    fn begin_save(&self, checkpoint: bool, open_chapter: u64) {
        let mut checkpoints = self.checkpoints.lock();
        checkpoints.prev = checkpoints.last;
        checkpoints.last = open_chapter.checked_sub(1);
        tracing::info!(
            what = if checkpoint { "checkpoint" } else { "save" },
            vcn = ?checkpoints.last,
            "beginning save"
        );
    }

    fn save_index_state(&self) -> Result<()> {
        self.write_index_meta()?;
        self.state.save_components(&self.layout)?;
        let zones: Vec<Vec<ChunkRecord>> = self
            .zones
            .iter()
            .map(|zone| zone.lock().open_chapter_records())
            .collect();
        state::write_open_chapters(&self.layout.open_chapter_path(), &zones)
    }

    fn write_index_meta(&self) -> Result<()> {
        state::write_index_meta(
            &self.layout.meta_path(),
            &SavedIndexMeta {
                identity: self.layout.identity(),
                nonce: self.layout.volume_nonce(),
                open_chapter: self.ring.newest(),
                oldest_chapter: self.ring.oldest(),
                zone_count: self.zone_count,
            },
        )
    }

    /// Advance the open chapter, reclaiming the oldest ring slot if needed.
    pub fn advance_active_chapters(&self) {
        self.ring.advance();
    }

    /// Block until all queued chapter writes have landed on the volume.
    pub fn wait_for_idle(&self) -> Result<()> {
        self.writer.wait_for_idle()
    }

    /// Aggregate statistics across the collaborators. Safe on any thread.
    pub fn get_stats(&self) -> IndexStats {
        let master = self.master_index.stats();
        IndexStats {
            entries_indexed: master.record_count,
            memory_used: self.master_index.memory_allocated()
                + self.sparse_cache.memory_allocated()
                + self.volume.cache_size()
                + self.writer.memory_allocated(),
            collisions: master.collision_count,
            entries_discarded: master.discard_count,
            checkpoints: self.checkpoint_count.load(Ordering::Relaxed),
        }
    }

    /// How this index instance came up.
    pub fn loaded_type(&self) -> LoadedType {
        self.loaded_type
    }

    /// Whether the most recent state on disk includes the open chapter.
    pub fn has_saved_open_chapter(&self) -> bool {
        self.has_saved_open_chapter.load(Ordering::Relaxed)
    }

    /// The open chapter number.
    pub fn newest_virtual_chapter(&self) -> u64 {
        self.ring.newest()
    }

    /// The oldest chapter still in the ring.
    pub fn oldest_virtual_chapter(&self) -> u64 {
        self.ring.oldest()
    }

    /// The most recent durably saved closed chapter, if any.
    pub fn last_checkpoint(&self) -> Option<u64> {
        self.checkpoints.lock().last
    }

    /// The geometry the index was built with.
    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// The layout holding this index's saved state.
    pub fn layout(&self) -> &IndexLayout {
        &self.layout
    }

    /// Whether the index is a single-zone sparse configuration. Only such
    /// indexes synthesize their own sparse-cache barriers.
    pub fn simulates_barriers(&self) -> bool {
        self.zone_count == 1 && self.geometry.is_sparse()
    }

    pub(crate) fn master_index(&self) -> &Arc<MasterIndex> {
        &self.master_index
    }

    pub(crate) fn volume(&self) -> &Arc<V> {
        &self.volume
    }

    pub(crate) fn ring(&self) -> &Arc<ChapterRing> {
        &self.ring
    }

    pub(crate) fn load_context(&self) -> Option<&Arc<LoadContext>> {
        self.load_context.as_ref()
    }
}

impl<V: Volume> Drop for DedupIndex<V> {
    fn drop(&mut self) {
        // Let in-flight chapter writes land before the collaborators go.
        if let Err(error) = self.writer.wait_for_idle() {
            tracing::warn!(error = %error, "chapter writer failed during teardown");
        }
    }
}
