//! The open chapter.
//!
//! Each zone accumulates freshly indexed records in a bounded in-memory
//! chapter. When it fills, the zone hands the live records to the
//! [`writer::ChapterWriter`] and starts a new chapter.

pub mod writer;

use std::collections::HashMap;

use crate::error::{IndexError, Result};
use crate::record::{ChunkData, ChunkName, ChunkRecord};

/// A bounded set of (name, metadata) records awaiting chapter close.
///
/// Removal marks the slot deleted rather than compacting, so record order is
/// stable; deleted slots are skipped when the chapter closes.
#[derive(Debug)]
pub struct OpenChapter {
    capacity: usize,
    slots: Vec<Slot>,
    by_name: HashMap<ChunkName, usize>,
    deleted: usize,
}

#[derive(Debug)]
struct Slot {
    record: ChunkRecord,
    deleted: bool,
}

impl OpenChapter {
    /// Create an open chapter holding at most `capacity` records.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            slots: Vec::with_capacity(capacity),
            by_name: HashMap::new(),
            deleted: 0,
        }
    }

    /// Look up a record by name.
    pub fn find(&self, name: &ChunkName) -> Option<&ChunkData> {
        self.by_name
            .get(name)
            .map(|&slot| &self.slots[slot].record.data)
    }

    /// Insert a record, overwriting the metadata if the name is present.
    pub fn put(&mut self, name: ChunkName, data: ChunkData) -> Result<()> {
        if let Some(&slot) = self.by_name.get(&name) {
            self.slots[slot].record.data = data;
            return Ok(());
        }
        if self.is_full() {
            return Err(IndexError::BadState(
                "put into a full open chapter".into(),
            ));
        }
        self.by_name.insert(name, self.slots.len());
        self.slots.push(Slot {
            record: ChunkRecord { name, data },
            deleted: false,
        });
        Ok(())
    }

    /// Remove a record by name, reporting whether it existed.
    pub fn remove(&mut self, name: &ChunkName) -> bool {
        match self.by_name.remove(name) {
            Some(slot) => {
                self.slots[slot].deleted = true;
                self.deleted += 1;
                true
            }
            None => false,
        }
    }

    /// Number of live records.
    pub fn size(&self) -> usize {
        self.slots.len() - self.deleted
    }

    /// Whether the chapter has reached capacity.
    ///
    /// Deleted slots still occupy space until the chapter closes, matching
    /// the on-disk layout they would have been written to.
    pub fn is_full(&self) -> bool {
        self.slots.len() >= self.capacity
    }

    /// Clear all records for a fresh chapter.
    pub fn reset(&mut self) {
        self.slots.clear();
        self.by_name.clear();
        self.deleted = 0;
    }

    /// The live records, in insertion order.
    pub fn live_records(&self) -> Vec<ChunkRecord> {
        self.slots
            .iter()
            .filter(|slot| !slot.deleted)
            .map(|slot| slot.record)
            .collect()
    }
}
