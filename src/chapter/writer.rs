//! Asynchronous persistence of closed chapters.
//!
//! Zones hand their closed chapters to a single writer thread over a
//! channel. A chapter is written once every zone has contributed its share
//! of records for that virtual chapter; the write lays out record pages and
//! index pages, updates the index-page map, and advances the index-level
//! chapter ring.

use std::collections::HashMap;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};

use crate::error::{IndexError, Result};
use crate::geometry::Geometry;
use crate::index::ChapterRing;
use crate::record::ChunkRecord;
use crate::volume::{IndexPageBounds, Volume};

enum Message {
    Contribute {
        zone: u32,
        vcn: u64,
        records: Vec<ChunkRecord>,
    },
    Shutdown,
}

struct WriterShared {
    pending: Mutex<u64>,
    idle: Condvar,
    failure: Mutex<Option<IndexError>>,
    memory: AtomicU64,
}

struct WriterInner {
    tx: Sender<Message>,
    handle: Mutex<Option<JoinHandle<()>>>,
    shared: Arc<WriterShared>,
}

/// Handle to the chapter-writer thread. Clones share the one thread, which
/// stops when the last handle drops.
#[derive(Clone)]
pub struct ChapterWriter {
    inner: Arc<WriterInner>,
}

impl ChapterWriter {
    /// Spawn the writer thread over `volume`.
    pub fn new<V: Volume>(
        geometry: Geometry,
        zone_count: u32,
        volume: Arc<V>,
        ring: Arc<ChapterRing>,
    ) -> Self {
        let (tx, rx) = unbounded();
        let shared = Arc::new(WriterShared {
            pending: Mutex::new(0),
            idle: Condvar::new(),
            failure: Mutex::new(None),
            memory: AtomicU64::new(0),
        });
        let worker = Worker {
            geometry,
            zone_count,
            volume,
            ring,
            shared: shared.clone(),
            buffered: HashMap::new(),
        };
        let handle = thread::spawn(move || worker.run(rx));
        Self {
            inner: Arc::new(WriterInner {
                tx,
                handle: Mutex::new(Some(handle)),
                shared,
            }),
        }
    }

    /// Contribute one zone's share of a closing chapter.
    pub fn start_closing_chapter(
        &self,
        zone: u32,
        vcn: u64,
        records: Vec<ChunkRecord>,
    ) -> Result<()> {
        let shared = &self.inner.shared;
        shared.memory.fetch_add(
            (records.len() * mem::size_of::<ChunkRecord>()) as u64,
            Ordering::Relaxed,
        );
        *shared.pending.lock() += 1;
        if self
            .inner
            .tx
            .send(Message::Contribute { zone, vcn, records })
            .is_err()
        {
            let mut pending = shared.pending.lock();
            *pending -= 1;
            shared.idle.notify_all();
            return Err(IndexError::BadState("chapter writer has stopped".into()));
        }
        Ok(())
    }

    /// Block until the writer has drained its queue, then surface any write
    /// failure it hit.
    pub fn wait_for_idle(&self) -> Result<()> {
        let shared = &self.inner.shared;
        let mut pending = shared.pending.lock();
        while *pending > 0 {
            shared.idle.wait(&mut pending);
        }
        drop(pending);
        match shared.failure.lock().take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Bytes currently buffered for chapters awaiting their write.
    pub fn memory_allocated(&self) -> u64 {
        self.inner.shared.memory.load(Ordering::Relaxed)
    }
}

impl Drop for WriterInner {
    fn drop(&mut self) {
        let _ = self.tx.send(Message::Shutdown);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

struct Worker<V: Volume> {
    geometry: Geometry,
    zone_count: u32,
    volume: Arc<V>,
    ring: Arc<ChapterRing>,
    shared: Arc<WriterShared>,
    buffered: HashMap<u64, Vec<Option<Vec<ChunkRecord>>>>,
}

impl<V: Volume> Worker<V> {
    fn run(mut self, rx: Receiver<Message>) {
        while let Ok(message) = rx.recv() {
            match message {
                Message::Contribute { zone, vcn, records } => {
                    self.contribute(zone, vcn, records);
                    let mut pending = self.shared.pending.lock();
                    *pending -= 1;
                    if *pending == 0 {
                        self.shared.idle.notify_all();
                    }
                }
                Message::Shutdown => break,
            }
        }
    }

    fn contribute(&mut self, zone: u32, vcn: u64, records: Vec<ChunkRecord>) {
        let zone_count = self.zone_count as usize;
        let slots = self
            .buffered
            .entry(vcn)
            .or_insert_with(|| vec![None; zone_count]);
        slots[zone as usize] = Some(records);
        if slots.iter().all(Option::is_some) {
            let slots = self.buffered.remove(&vcn).unwrap();
            let records: Vec<ChunkRecord> = slots.into_iter().flatten().flatten().collect();
            self.shared.memory.fetch_sub(
                (records.len() * mem::size_of::<ChunkRecord>()) as u64,
                Ordering::Relaxed,
            );
            if let Err(error) = self.write_chapter(vcn, records) {
                tracing::warn!(vcn, error = %error, "chapter write failed");
                self.shared.failure.lock().get_or_insert(error);
            }
        }
    }

    fn write_chapter(&self, vcn: u64, mut records: Vec<ChunkRecord>) -> Result<()> {
        records.sort_by(|a, b| a.name.cmp(&b.name));
        let physical = self.geometry.map_to_physical_chapter(vcn);

        let record_pages: Vec<Vec<ChunkRecord>> = records
            .chunks(self.geometry.records_per_page as usize)
            .map(<[ChunkRecord]>::to_vec)
            .collect();

        let lists_per_page = self.geometry.delta_lists_per_index_page();
        let index_pages: Vec<IndexPageBounds> = (0..self.geometry.index_pages_per_chapter)
            .map(|page| IndexPageBounds {
                lowest_list: page * lists_per_page,
                highest_list: (page + 1) * lists_per_page - 1,
            })
            .collect();

        self.volume
            .write_chapter(vcn, physical, index_pages.clone(), record_pages)?;
        for (page, bounds) in index_pages.iter().enumerate() {
            self.volume
                .page_map()
                .update(vcn, physical, page as u32, bounds.highest_list)?;
        }
        self.ring.advance();
        tracing::debug!(vcn, physical, records = records.len(), "chapter written");
        Ok(())
    }
}
