//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use oxidedup::{
    ChunkData, ChunkName, DedupIndex, IndexConfiguration, IndexLayout, Location, RamVolume,
    Request,
};

/// Small dense geometry: ring of 8 chapters, 4 records per chapter.
pub fn dense_config() -> IndexConfiguration {
    IndexConfiguration {
        chapters_per_volume: 8,
        index_pages_per_chapter: 1,
        record_pages_per_chapter: 2,
        records_per_page: 2,
        sparse_chapters_per_volume: 0,
        delta_lists_per_chapter: 4,
        sparse_sample_rate: 32,
        sparse_cache_capacity: 4,
    }
}

/// Sparse geometry matching the rotation scenario: ring of 10 chapters with
/// a trailing sparse window of 4, 2 records per chapter, every other name a
/// sample.
pub fn sparse_config() -> IndexConfiguration {
    IndexConfiguration {
        chapters_per_volume: 10,
        index_pages_per_chapter: 1,
        record_pages_per_chapter: 1,
        records_per_page: 2,
        sparse_chapters_per_volume: 4,
        delta_lists_per_chapter: 2,
        sparse_sample_rate: 2,
        sparse_cache_capacity: 8,
    }
}

/// Deterministic chunk name. The low eight bytes (the delta-list address)
/// come from the seed, so distinct seeds never share a list; the sampling
/// bytes equal the seed, so with `sparse_sample_rate = 2` the even seeds are
/// exactly the samples.
pub fn test_name(seed: u64) -> ChunkName {
    let mut bytes = [0u8; 16];
    bytes[0..8].copy_from_slice(&seed.to_le_bytes());
    bytes[8..10].copy_from_slice(&(seed as u16).wrapping_mul(0x9e37).to_le_bytes());
    bytes[10..14].copy_from_slice(&(seed as u32).to_le_bytes());
    ChunkName::new(bytes)
}

/// Deterministic metadata blob.
pub fn metadata(seed: u64) -> ChunkData {
    let mut bytes = [0u8; 16];
    bytes[0..8].copy_from_slice(&seed.to_le_bytes());
    bytes[8] = 0xd5;
    ChunkData::new(bytes)
}

/// A volume sized for `config`.
pub fn new_volume(config: &IndexConfiguration) -> Arc<RamVolume> {
    Arc::new(RamVolume::new(config.geometry().unwrap()))
}

/// A layout under `dir/state`.
pub fn open_layout(dir: &Path) -> IndexLayout {
    IndexLayout::open(dir.join("state")).unwrap()
}

/// Register a chunk and return the completed request.
pub fn index_one(index: &DedupIndex<RamVolume>, seed: u64) -> Request {
    let name = test_name(seed);
    let mut request = Request::index(name, index.zone_for_name(&name), metadata(seed));
    index.dispatch_request(&mut request).unwrap();
    request
}

/// Query a chunk and return the completed request.
pub fn query_one(index: &DedupIndex<RamVolume>, seed: u64, update: bool) -> Request {
    let name = test_name(seed);
    let mut request = Request::query(name, index.zone_for_name(&name), update);
    index.dispatch_request(&mut request).unwrap();
    request
}

/// Whether a completed query found its chunk anywhere.
pub fn found(request: &Request) -> bool {
    request.location != Location::Unavailable
}
