//! In-memory volume.
//!
//! Holds written chapters in a map keyed by physical slot, remembering the
//! virtual chapter each slot was last written for. Used by the integration
//! tests and by embeddings that keep the whole volume resident.

use std::collections::HashMap;
use std::mem;

use parking_lot::{Mutex, RwLock};

use crate::error::{IndexError, Result};
use crate::geometry::Geometry;
use crate::record::{ChunkData, ChunkName, ChunkRecord};
use crate::volume::{
    ChapterBoundaries, IndexPageBounds, IndexPageMap, LookupMode, Volume,
};

#[derive(Debug, Clone)]
struct StoredChapter {
    vcn: u64,
    index_pages: Vec<IndexPageBounds>,
    record_pages: Vec<Vec<ChunkRecord>>,
}

/// A volume backed entirely by memory.
pub struct RamVolume {
    geometry: Geometry,
    chapters: RwLock<HashMap<u32, StoredChapter>>,
    lookup_mode: Mutex<LookupMode>,
    page_map: IndexPageMap,
}

impl RamVolume {
    /// Create an empty volume for `geometry`.
    pub fn new(geometry: Geometry) -> Self {
        Self {
            geometry,
            chapters: RwLock::new(HashMap::new()),
            lookup_mode: Mutex::new(LookupMode::Normal),
            page_map: IndexPageMap::new(),
        }
    }

    /// The geometry this volume was built for.
    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// Number of chapters currently stored.
    pub fn chapter_count(&self) -> usize {
        self.chapters.read().len()
    }

    /// Drop one stored chapter, as a crash-damage stand-in for tests.
    pub fn corrupt_chapter(&self, physical_chapter: u32) {
        self.chapters.write().remove(&physical_chapter);
    }
}

impl Volume for RamVolume {
    fn find_chapter_boundaries(&self) -> Result<ChapterBoundaries> {
        let chapters = self.chapters.read();
        let mut lowest = u64::MAX;
        let mut highest = 0u64;
        for stored in chapters.values() {
            lowest = lowest.min(stored.vcn);
            highest = highest.max(stored.vcn);
        }
        if chapters.is_empty() {
            return Ok(ChapterBoundaries {
                lowest: 0,
                highest: 0,
                is_empty: true,
            });
        }
        Ok(ChapterBoundaries {
            lowest,
            highest,
            is_empty: false,
        })
    }

    fn get_index_page(&self, physical_chapter: u32, index_page: u32) -> Result<IndexPageBounds> {
        if index_page >= self.geometry.index_pages_per_chapter {
            return Err(IndexError::InvalidArgument(format!(
                "index page {index_page} out of range"
            )));
        }
        let chapters = self.chapters.read();
        let stored = chapters.get(&physical_chapter).ok_or_else(|| {
            IndexError::CorruptData(format!("physical chapter {physical_chapter} has no pages"))
        })?;
        stored
            .index_pages
            .get(index_page as usize)
            .copied()
            .ok_or_else(|| {
                IndexError::CorruptData(format!(
                    "chapter {physical_chapter} is missing index page {index_page}"
                ))
            })
    }

    fn get_record_page(&self, physical_chapter: u32, page: u32) -> Result<Vec<ChunkRecord>> {
        let first_record_page = self.geometry.index_pages_per_chapter;
        if page < first_record_page || page >= self.geometry.pages_per_chapter() {
            return Err(IndexError::InvalidArgument(format!(
                "record page {page} out of range"
            )));
        }
        let chapters = self.chapters.read();
        let stored = chapters.get(&physical_chapter).ok_or_else(|| {
            IndexError::CorruptData(format!("physical chapter {physical_chapter} has no pages"))
        })?;
        Ok(stored
            .record_pages
            .get((page - first_record_page) as usize)
            .cloned()
            .unwrap_or_default())
    }

    fn search_record_pages(&self, name: &ChunkName, vcn: u64) -> Result<Option<ChunkData>> {
        let physical = self.geometry.map_to_physical_chapter(vcn);
        let chapters = self.chapters.read();
        let Some(stored) = chapters.get(&physical) else {
            return Ok(None);
        };
        // A slot overwritten by a newer chapter no longer answers for vcn.
        if stored.vcn != vcn {
            return Ok(None);
        }
        for page in &stored.record_pages {
            if let Some(record) = page.iter().find(|record| record.name == *name) {
                return Ok(Some(record.data));
            }
        }
        Ok(None)
    }

    fn write_chapter(
        &self,
        vcn: u64,
        physical_chapter: u32,
        index_pages: Vec<IndexPageBounds>,
        record_pages: Vec<Vec<ChunkRecord>>,
    ) -> Result<()> {
        if index_pages.len() != self.geometry.index_pages_per_chapter as usize {
            return Err(IndexError::InvalidArgument(format!(
                "expected {} index pages, got {}",
                self.geometry.index_pages_per_chapter,
                index_pages.len()
            )));
        }
        if record_pages.len() > self.geometry.record_pages_per_chapter as usize {
            return Err(IndexError::InvalidArgument(format!(
                "expected at most {} record pages, got {}",
                self.geometry.record_pages_per_chapter,
                record_pages.len()
            )));
        }
        self.chapters.write().insert(
            physical_chapter,
            StoredChapter {
                vcn,
                index_pages,
                record_pages,
            },
        );
        Ok(())
    }

    fn set_lookup_mode(&self, mode: LookupMode) -> LookupMode {
        mem::replace(&mut *self.lookup_mode.lock(), mode)
    }

    fn lookup_mode(&self) -> LookupMode {
        *self.lookup_mode.lock()
    }

    fn page_map(&self) -> &IndexPageMap {
        &self.page_map
    }

    fn cache_size(&self) -> u64 {
        let chapters = self.chapters.read();
        let records: usize = chapters
            .values()
            .flat_map(|stored| stored.record_pages.iter())
            .map(Vec::len)
            .sum();
        (records * mem::size_of::<ChunkRecord>()) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry() -> Geometry {
        Geometry::new(4, 1, 2, 2, 0, 2).unwrap()
    }

    fn record(seed: u8) -> ChunkRecord {
        ChunkRecord {
            name: ChunkName::new([seed; 16]),
            data: ChunkData::new([seed ^ 0xff; 16]),
        }
    }

    fn write_one(volume: &RamVolume, vcn: u64, seeds: &[u8]) {
        let physical = volume.geometry().map_to_physical_chapter(vcn);
        let records: Vec<_> = seeds.iter().map(|&s| record(s)).collect();
        let pages: Vec<Vec<ChunkRecord>> = records.chunks(2).map(|c| c.to_vec()).collect();
        volume
            .write_chapter(
                vcn,
                physical,
                vec![IndexPageBounds {
                    lowest_list: 0,
                    highest_list: 1,
                }],
                pages,
            )
            .unwrap();
    }

    #[test]
    fn test_boundaries_empty() {
        let volume = RamVolume::new(geometry());
        let bounds = volume.find_chapter_boundaries().unwrap();
        assert!(bounds.is_empty);
    }

    #[test]
    fn test_boundaries_after_writes() {
        let volume = RamVolume::new(geometry());
        write_one(&volume, 0, &[1, 2]);
        write_one(&volume, 1, &[3, 4]);
        write_one(&volume, 2, &[5]);
        let bounds = volume.find_chapter_boundaries().unwrap();
        assert!(!bounds.is_empty);
        assert_eq!(bounds.lowest, 0);
        assert_eq!(bounds.highest, 2);
    }

    #[test]
    fn test_boundaries_after_wrap() {
        let volume = RamVolume::new(geometry());
        for vcn in 0..6 {
            write_one(&volume, vcn, &[vcn as u8]);
        }
        // Ring of 4: slots now hold chapters 2..=5.
        let bounds = volume.find_chapter_boundaries().unwrap();
        assert_eq!(bounds.lowest, 2);
        assert_eq!(bounds.highest, 5);
    }

    #[test]
    fn test_search_respects_vcn() {
        let volume = RamVolume::new(geometry());
        write_one(&volume, 1, &[7, 8]);
        let name = ChunkName::new([7; 16]);
        assert!(volume.search_record_pages(&name, 1).unwrap().is_some());
        // Same physical slot, different virtual chapter: no answer.
        assert!(volume.search_record_pages(&name, 5).unwrap().is_none());
    }

    #[test]
    fn test_record_page_numbering_is_absolute() {
        let volume = RamVolume::new(geometry());
        write_one(&volume, 0, &[1, 2, 3]);
        // Page 0 is the index page; records start at page 1.
        assert!(volume.get_record_page(0, 0).is_err());
        let first = volume.get_record_page(0, 1).unwrap();
        assert_eq!(first.len(), 2);
        let second = volume.get_record_page(0, 2).unwrap();
        assert_eq!(second.len(), 1);
    }
}
