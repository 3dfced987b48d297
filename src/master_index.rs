//! The master fingerprint index.
//!
//! Maps chunk names to the virtual chapter currently holding their record.
//! Entries live on delta lists: a name's address bits select a list, and a
//! short fragment of the name distinguishes entries sharing an address. The
//! first entry for an (address, fragment) pair is a *hint* that stores no
//! name at all; later entries for the same pair are *collision records* that
//! carry the full name. A hint may therefore answer for a different name
//! than the one being looked up, which is why callers confirm hits against
//! the volume before trusting them.
//!
//! Lists are partitioned across zones by address so that each zone thread
//! touches only its own lists. The record handles returned by
//! [`MasterIndex::get_record`] must stay on the zone that fetched them.

use std::collections::HashMap;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::{IndexError, Result};
use crate::geometry::Geometry;
use crate::record::ChunkName;

/// Most entries one delta list will hold before inserts overflow.
const DELTA_LIST_CAPACITY: usize = 64;

/// Pick the zone that owns a name's delta list.
pub fn zone_for_name(name: &ChunkName, nonce: u64, zone_count: u32) -> u32 {
    let address = name.address_bits() ^ nonce;
    ((address >> 32) as u32 ^ address as u32) % zone_count
}

/// A positioned view of one name's master-index entry.
///
/// Obtained from [`MasterIndex::get_record`]; the mutating calls
/// ([`MasterIndex::put_record`], [`MasterIndex::set_record_chapter`],
/// [`MasterIndex::remove_record`]) act through it.
#[derive(Debug, Clone)]
pub struct MasterIndexRecord {
    /// Whether an entry answering for this name exists.
    pub is_found: bool,
    /// Whether the entry is a collision record carrying the full name.
    pub is_collision: bool,
    /// The chapter the entry points at; meaningful only when found.
    pub virtual_chapter: u64,
    name: ChunkName,
    zone: u32,
    address: u64,
    fragment: u16,
}

/// Result of a non-positioning name lookup, used for request triage.
#[derive(Debug, Clone, Copy)]
pub struct MasterIndexTriage {
    /// True when the name is a sample and currently indexed.
    pub in_sampled_chapter: bool,
    /// The chapter of the sampled entry; meaningful only when
    /// `in_sampled_chapter` is set.
    pub virtual_chapter: u64,
}

/// Counters aggregated by [`crate::stats::IndexStats`].
#[derive(Debug, Clone, Copy, Default)]
pub struct MasterIndexStats {
    /// Entries currently held.
    pub record_count: u64,
    /// Collision records currently held.
    pub collision_count: u64,
    /// Entries expired out of the chapter ring.
    pub discard_count: u64,
    /// Inserts dropped because a delta list was full.
    pub overflow_count: u64,
}

#[derive(Debug, Clone)]
struct Entry {
    fragment: u16,
    /// Full name for collision records; hints store none.
    full_name: Option<ChunkName>,
    chapter: u64,
    sampled: bool,
}

#[derive(Default)]
struct ZoneLists {
    lists: HashMap<u64, Vec<Entry>>,
    open_chapter: u64,
}

/// The shared fingerprint-to-chapter store.
pub struct MasterIndex {
    zones: Vec<Mutex<ZoneLists>>,
    zone_count: u32,
    nonce: u64,
    chapters_per_volume: u64,
    sparse: bool,
    sparse_sample_rate: u32,
    record_count: AtomicU64,
    collision_count: AtomicU64,
    discard_count: AtomicU64,
    overflow_count: AtomicU64,
}

impl MasterIndex {
    /// Build a master index for `zone_count` zones, keyed by `nonce`.
    pub fn new(
        geometry: &Geometry,
        zone_count: u32,
        nonce: u64,
        sparse_sample_rate: u32,
    ) -> Result<Self> {
        if zone_count == 0 {
            return Err(IndexError::InvalidArgument(
                "zone count must be at least one".into(),
            ));
        }
        Ok(Self {
            zones: (0..zone_count).map(|_| Mutex::new(ZoneLists::default())).collect(),
            zone_count,
            nonce,
            chapters_per_volume: u64::from(geometry.chapters_per_volume),
            sparse: geometry.is_sparse(),
            sparse_sample_rate,
            record_count: AtomicU64::new(0),
            collision_count: AtomicU64::new(0),
            discard_count: AtomicU64::new(0),
            overflow_count: AtomicU64::new(0),
        })
    }

    fn address_for(&self, name: &ChunkName) -> u64 {
        name.address_bits() ^ self.nonce
    }

    /// The zone that owns `name`'s delta list.
    pub fn zone_for(&self, name: &ChunkName) -> u32 {
        zone_for_name(name, self.nonce, self.zone_count)
    }

    /// Whether `name` is selected by the sampling function. Every name is a
    /// sample in a dense index.
    pub fn is_sample(&self, name: &ChunkName) -> bool {
        if !self.sparse || self.sparse_sample_rate <= 1 {
            return true;
        }
        name.sample_bits() % self.sparse_sample_rate == 0
    }

    /// Position a record view for `name`.
    pub fn get_record(&self, name: &ChunkName) -> Result<MasterIndexRecord> {
        let zone = self.zone_for(name);
        let address = self.address_for(name);
        let fragment = name.fragment_bits();
        let lists = self.zones[zone as usize].lock();

        let mut record = MasterIndexRecord {
            is_found: false,
            is_collision: false,
            virtual_chapter: 0,
            name: *name,
            zone,
            address,
            fragment,
        };

        if let Some(entries) = lists.lists.get(&address) {
            // An exact collision record wins over a fragment hint.
            if let Some(entry) = entries.iter().find(|e| e.full_name == Some(*name)) {
                record.is_found = true;
                record.is_collision = true;
                record.virtual_chapter = entry.chapter;
            } else if let Some(entry) = entries
                .iter()
                .find(|e| e.full_name.is_none() && e.fragment == fragment)
            {
                record.is_found = true;
                record.virtual_chapter = entry.chapter;
            }
        }
        Ok(record)
    }

    /// Insert a new entry for the record's name pointing at `vcn`.
    ///
    /// Returns [`IndexError::DuplicateName`] if a collision record for the
    /// exact name already exists, and [`IndexError::Overflow`] if the delta
    /// list is full. Both are treated as soft outcomes by the callers.
    pub fn put_record(&self, record: &MasterIndexRecord, vcn: u64) -> Result<()> {
        let sampled = self.is_sample(&record.name);
        let mut lists = self.zones[record.zone as usize].lock();
        let entries = lists.lists.entry(record.address).or_default();

        if entries.iter().any(|e| e.full_name == Some(record.name)) {
            return Err(IndexError::DuplicateName);
        }
        if entries.len() >= DELTA_LIST_CAPACITY {
            self.overflow_count.fetch_add(1, Ordering::Relaxed);
            return Err(IndexError::Overflow);
        }

        let collides = entries.iter().any(|e| e.fragment == record.fragment);
        entries.push(Entry {
            fragment: record.fragment,
            full_name: collides.then_some(record.name),
            chapter: vcn,
            sampled,
        });
        self.record_count.fetch_add(1, Ordering::Relaxed);
        if collides {
            self.collision_count.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Re-home the record's entry to `vcn`. If the entry vanished (reaped or
    /// deleted since the record was positioned), it is put back.
    pub fn set_record_chapter(&self, record: &mut MasterIndexRecord, vcn: u64) -> Result<()> {
        let sampled = self.is_sample(&record.name);
        {
            let mut lists = self.zones[record.zone as usize].lock();
            if let Some(entries) = lists.lists.get_mut(&record.address) {
                let slot = if record.is_collision {
                    entries.iter_mut().find(|e| e.full_name == Some(record.name))
                } else {
                    entries
                        .iter_mut()
                        .find(|e| e.full_name.is_none() && e.fragment == record.fragment)
                };
                if let Some(entry) = slot {
                    entry.chapter = vcn;
                    entry.sampled = sampled;
                    record.virtual_chapter = vcn;
                    return Ok(());
                }
            }
        }
        self.put_record(record, vcn)?;
        record.is_found = true;
        record.virtual_chapter = vcn;
        Ok(())
    }

    /// Delete the record's entry. Missing entries are not an error.
    pub fn remove_record(&self, record: &MasterIndexRecord) -> Result<()> {
        let mut lists = self.zones[record.zone as usize].lock();
        let Some(entries) = lists.lists.get_mut(&record.address) else {
            return Ok(());
        };
        let position = if record.is_collision {
            entries.iter().position(|e| e.full_name == Some(record.name))
        } else {
            entries
                .iter()
                .position(|e| e.full_name.is_none() && e.fragment == record.fragment)
        };
        if let Some(position) = position {
            let entry = entries.remove(position);
            self.record_count.fetch_sub(1, Ordering::Relaxed);
            if entry.full_name.is_some() {
                self.collision_count.fetch_sub(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    /// Triage lookup: is this name a sample with a live entry, and where?
    pub fn lookup_name(&self, name: &ChunkName) -> MasterIndexTriage {
        if !self.is_sample(name) {
            return MasterIndexTriage {
                in_sampled_chapter: false,
                virtual_chapter: 0,
            };
        }
        match self.get_record(name) {
            Ok(record) if record.is_found => MasterIndexTriage {
                in_sampled_chapter: true,
                virtual_chapter: record.virtual_chapter,
            },
            _ => MasterIndexTriage {
                in_sampled_chapter: false,
                virtual_chapter: 0,
            },
        }
    }

    /// Move every zone's open-chapter marker to `vcn`.
    pub fn set_open_chapter(&self, vcn: u64) {
        for zone in 0..self.zone_count {
            self.set_zone_open_chapter(zone, vcn);
        }
    }

    /// Move one zone's open-chapter marker to `vcn`, expiring entries that
    /// the move invalidates.
    ///
    /// Moving backward drops entries at or above the new marker (the replay
    /// flush sequence relies on this), and moving to chapter zero resets the
    /// zone outright. Moving forward expires entries that fell out of the
    /// chapter ring, and, in a sparse geometry, non-sample entries for
    /// chapters that have closed.
    pub fn set_zone_open_chapter(&self, zone: u32, vcn: u64) {
        let mut lists = self.zones[zone as usize].lock();
        let backward = vcn < lists.open_chapter || vcn == 0;
        let floor = vcn.saturating_sub(self.chapters_per_volume);
        let sparse = self.sparse;

        let mut removed = 0u64;
        let mut removed_collisions = 0u64;
        let mut discarded = 0u64;
        for entries in lists.lists.values_mut() {
            entries.retain(|entry| {
                let keep = if backward && entry.chapter >= vcn {
                    false
                } else if entry.chapter < floor {
                    discarded += 1;
                    false
                } else if sparse && !entry.sampled && entry.chapter < vcn {
                    discarded += 1;
                    false
                } else {
                    true
                };
                if !keep {
                    removed += 1;
                    if entry.full_name.is_some() {
                        removed_collisions += 1;
                    }
                }
                keep
            });
        }
        lists.lists.retain(|_, entries| !entries.is_empty());
        lists.open_chapter = vcn;

        self.record_count.fetch_sub(removed, Ordering::Relaxed);
        self.collision_count
            .fetch_sub(removed_collisions, Ordering::Relaxed);
        self.discard_count.fetch_add(discarded, Ordering::Relaxed);
    }

    /// Current counters.
    pub fn stats(&self) -> MasterIndexStats {
        MasterIndexStats {
            record_count: self.record_count.load(Ordering::Relaxed),
            collision_count: self.collision_count.load(Ordering::Relaxed),
            discard_count: self.discard_count.load(Ordering::Relaxed),
            overflow_count: self.overflow_count.load(Ordering::Relaxed),
        }
    }

    /// Rough bytes held by the in-memory lists.
    pub fn memory_allocated(&self) -> u64 {
        self.record_count.load(Ordering::Relaxed) * (mem::size_of::<Entry>() as u64 + 16)
    }

    /// Snapshot every entry for the state store.
    pub(crate) fn export_entries(&self) -> Vec<ExportedEntry> {
        let mut out = Vec::new();
        for (zone, lists) in self.zones.iter().enumerate() {
            let lists = lists.lock();
            for (&address, entries) in &lists.lists {
                for entry in entries {
                    out.push(ExportedEntry {
                        zone: zone as u32,
                        address,
                        fragment: entry.fragment,
                        full_name: entry.full_name,
                        chapter: entry.chapter,
                        sampled: entry.sampled,
                    });
                }
            }
        }
        out
    }

    /// Replace the in-memory lists with entries from the state store.
    pub(crate) fn import_entries(&self, entries: Vec<ExportedEntry>) -> Result<()> {
        for zone in &self.zones {
            let mut lists = zone.lock();
            lists.lists.clear();
            lists.open_chapter = 0;
        }
        self.record_count.store(0, Ordering::Relaxed);
        self.collision_count.store(0, Ordering::Relaxed);

        let mut count = 0u64;
        let mut collisions = 0u64;
        for entry in entries {
            if entry.zone >= self.zone_count {
                return Err(IndexError::CorruptComponent(format!(
                    "master index entry names zone {} of {}",
                    entry.zone, self.zone_count
                )));
            }
            let mut lists = self.zones[entry.zone as usize].lock();
            lists.lists.entry(entry.address).or_default().push(Entry {
                fragment: entry.fragment,
                full_name: entry.full_name,
                chapter: entry.chapter,
                sampled: entry.sampled,
            });
            count += 1;
            if entry.full_name.is_some() {
                collisions += 1;
            }
        }
        self.record_count.store(count, Ordering::Relaxed);
        self.collision_count.store(collisions, Ordering::Relaxed);
        Ok(())
    }
}

/// One master-index entry as persisted by the state store.
#[derive(Debug, Clone)]
pub(crate) struct ExportedEntry {
    pub zone: u32,
    pub address: u64,
    pub fragment: u16,
    pub full_name: Option<ChunkName>,
    pub chapter: u64,
    pub sampled: bool,
}
