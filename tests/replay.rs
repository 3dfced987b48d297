//! Replay and rebuild tests.

mod common;

use std::sync::Arc;

use common::{
    dense_config, found, index_one, metadata, new_volume, open_layout, query_one, sparse_config,
};
use oxidedup::volume::IndexPageBounds;
use oxidedup::{
    make_index, ChunkName, ChunkRecord, IndexError, LoadType, LoadedType, Location, RamVolume,
    Request, Volume,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[test]
fn test_rebuild_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let config = dense_config();
    let volume = new_volume(&config);
    let layout = open_layout(dir.path());

    {
        let index = make_index(
            layout.clone(),
            &config,
            volume.clone(),
            1,
            LoadType::Create,
            None,
        )
        .unwrap();
        // Six chapters; the ring of eight is not yet full.
        for seed in 0..24 {
            index_one(&index, seed);
        }
        index.wait_for_idle().unwrap();
    }

    let index = make_index(layout, &config, volume, 1, LoadType::Rebuild, None).unwrap();
    assert_eq!(index.loaded_type(), LoadedType::Replay);
    assert_eq!(index.newest_virtual_chapter(), 6);
    assert_eq!(index.oldest_virtual_chapter(), 0);

    // Every record of every replayed chapter answers with its metadata.
    for seed in 0..24 {
        let request = query_one(&index, seed, false);
        assert_eq!(request.location, Location::InDense, "seed {seed}");
        assert_eq!(request.old_metadata, metadata(seed));
    }
}

#[test]
fn test_rebuild_of_full_ring_skips_shadowed_chapter() {
    let dir = tempfile::tempdir().unwrap();
    let config = dense_config();
    let volume = new_volume(&config);
    let layout = open_layout(dir.path());

    {
        let index = make_index(
            layout.clone(),
            &config,
            volume.clone(),
            1,
            LoadType::Create,
            None,
        )
        .unwrap();
        // Twelve chapters over a ring of eight: slots hold chapters 4..=11.
        for seed in 0..48 {
            index_one(&index, seed);
        }
        index.wait_for_idle().unwrap();
        assert_eq!(index.oldest_virtual_chapter(), 4);
    }

    let index = make_index(layout, &config, volume, 1, LoadType::Rebuild, None).unwrap();
    assert_eq!(index.newest_virtual_chapter(), 12);
    // Chapter 4 shares its slot with the open chapter and is skipped.
    assert_eq!(index.oldest_virtual_chapter(), 5);

    for seed in 20..48 {
        assert!(found(&query_one(&index, seed, false)), "seed {seed}");
    }
    for seed in 16..20 {
        assert!(!found(&query_one(&index, seed, false)), "seed {seed}");
    }
}

#[test]
fn test_replay_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let config = dense_config();
    let volume = new_volume(&config);
    let layout = open_layout(dir.path());

    {
        let index = make_index(
            layout.clone(),
            &config,
            volume.clone(),
            1,
            LoadType::Create,
            None,
        )
        .unwrap();
        for seed in 0..24 {
            index_one(&index, seed);
        }
        index.wait_for_idle().unwrap();
    }

    let first_entries;
    {
        let index = make_index(
            layout.clone(),
            &config,
            volume.clone(),
            1,
            LoadType::Rebuild,
            None,
        )
        .unwrap();
        first_entries = index.get_stats().entries_indexed;
        // Dropped without a save; the next load replays the same range.
    }

    let index = make_index(layout, &config, volume, 1, LoadType::Rebuild, None).unwrap();
    assert_eq!(index.get_stats().entries_indexed, first_entries);
    for seed in 0..24 {
        let request = query_one(&index, seed, false);
        assert_eq!(request.location, Location::InDense, "seed {seed}");
        assert_eq!(request.old_metadata, metadata(seed));
    }
}

#[test]
fn test_sparse_rebuild_skips_non_samples() {
    let dir = tempfile::tempdir().unwrap();
    let config = sparse_config();
    let volume = new_volume(&config);
    let layout = open_layout(dir.path());

    {
        let index = make_index(
            layout.clone(),
            &config,
            volume.clone(),
            1,
            LoadType::Create,
            None,
        )
        .unwrap();
        // Chapter c holds seeds 2c (sample) and 2c + 1 (non-sample).
        for seed in 0..24 {
            index_one(&index, seed);
        }
        index.wait_for_idle().unwrap();
    }

    let index = make_index(layout, &config, volume, 1, LoadType::Rebuild, None).unwrap();
    assert_eq!(index.newest_virtual_chapter(), 12);
    // Full ring: chapter 2 is shadowed by the open chapter.
    assert_eq!(index.oldest_virtual_chapter(), 3);

    // Sparse-window non-samples were skipped and the cache is cold.
    for chapter in 8..12u64 {
        assert!(
            !found(&query_one(&index, 2 * chapter + 1, false)),
            "chapter {chapter}"
        );
    }

    // Samples answer across the whole window: dense ones from the volume,
    // sparse ones through a synthesized barrier plus the cache.
    for chapter in 3..8u64 {
        let request = query_one(&index, 2 * chapter, false);
        assert_eq!(request.location, Location::InDense, "chapter {chapter}");
    }
    for chapter in 8..12u64 {
        let request = query_one(&index, 2 * chapter, false);
        assert_eq!(request.location, Location::InSparse, "chapter {chapter}");
    }

    // With the cache warmed by the sample queries, the sparse non-samples
    // are reachable again.
    for chapter in 8..12u64 {
        let request = query_one(&index, 2 * chapter + 1, false);
        assert_eq!(request.location, Location::InSparse, "chapter {chapter}");
    }
}

#[test]
fn test_corrupt_index_page_fails_recovery() {
    let dir = tempfile::tempdir().unwrap();
    let config = dense_config();
    let volume = new_volume(&config);
    let layout = open_layout(dir.path());

    {
        let index = make_index(
            layout.clone(),
            &config,
            volume.clone(),
            1,
            LoadType::Create,
            None,
        )
        .unwrap();
        for seed in 0..16 {
            index_one(&index, seed);
        }
        index.wait_for_idle().unwrap();
    }

    // Clobber chapter 2 with an index page whose delta-list coverage does
    // not start at list zero.
    volume
        .write_chapter(
            2,
            2,
            vec![IndexPageBounds {
                lowest_list: 5,
                highest_list: 6,
            }],
            vec![],
        )
        .unwrap();

    let result = make_index(layout, &config, volume, 1, LoadType::Rebuild, None);
    assert!(matches!(result, Err(IndexError::CorruptData(_))));
}

#[test]
fn test_rebuild_with_random_names() {
    let dir = tempfile::tempdir().unwrap();
    let config = dense_config();
    let volume = new_volume(&config);
    let layout = open_layout(dir.path());

    let mut rng = StdRng::seed_from_u64(0x0dd5_eed);
    let names: Vec<ChunkName> = (0..24).map(|_| ChunkName::new(rng.gen())).collect();

    {
        let index = make_index(
            layout.clone(),
            &config,
            volume.clone(),
            1,
            LoadType::Create,
            None,
        )
        .unwrap();
        for name in &names {
            let mut request = Request::index(*name, index.zone_for_name(name), metadata(1));
            index.dispatch_request(&mut request).unwrap();
        }
        index.wait_for_idle().unwrap();
    }

    let index = make_index(layout, &config, volume, 1, LoadType::Rebuild, None).unwrap();
    for name in &names {
        let mut request = Request::query(*name, index.zone_for_name(name), false);
        index.dispatch_request(&mut request).unwrap();
        assert_eq!(request.location, Location::InDense, "name {name}");
    }
}

#[test]
fn test_replay_rebuilds_the_index_page_map() {
    let dir = tempfile::tempdir().unwrap();
    let config = dense_config();
    let volume = new_volume(&config);
    let layout = open_layout(dir.path());

    {
        let index = make_index(
            layout.clone(),
            &config,
            volume.clone(),
            1,
            LoadType::Create,
            None,
        )
        .unwrap();
        for seed in 0..16 {
            index_one(&index, seed);
        }
        index.wait_for_idle().unwrap();
    }

    // Recovery runs against a process that lost the in-memory page map.
    let recovery_volume = Arc::new(RamVolume::new(config.geometry().unwrap()));
    for vcn in 0..4u64 {
        let physical = config.geometry().unwrap().map_to_physical_chapter(vcn);
        let mut pages = Vec::new();
        for page in 1..3 {
            pages.push(volume.get_record_page(physical, page).unwrap());
        }
        recovery_volume
            .write_chapter(
                vcn,
                physical,
                vec![IndexPageBounds {
                    lowest_list: 0,
                    highest_list: 3,
                }],
                pages,
            )
            .unwrap();
    }
    assert!(recovery_volume.page_map().is_empty());

    let index = make_index(
        layout,
        &config,
        recovery_volume.clone(),
        1,
        LoadType::Rebuild,
        None,
    )
    .unwrap();
    assert_eq!(index.newest_virtual_chapter(), 4);
    for vcn in 0..4u32 {
        let entry = recovery_volume.page_map().get(vcn, 0).unwrap();
        assert_eq!(entry.virtual_chapter, u64::from(vcn));
        assert_eq!(entry.highest_list, 3);
    }
}

#[test]
fn test_replayed_records_round_trip_their_metadata() {
    let dir = tempfile::tempdir().unwrap();
    let config = dense_config();
    let volume = new_volume(&config);
    let layout = open_layout(dir.path());

    {
        let index = make_index(
            layout.clone(),
            &config,
            volume.clone(),
            1,
            LoadType::Create,
            None,
        )
        .unwrap();
        for seed in 0..8 {
            index_one(&index, seed);
        }
        index.wait_for_idle().unwrap();
    }

    // The record pages hold (name, metadata) pairs exactly as indexed.
    let records: Vec<ChunkRecord> = (1..3)
        .flat_map(|page| volume.get_record_page(0, page).unwrap())
        .collect();
    assert_eq!(records.len(), 4);
    for record in records {
        let seed = u64::from_le_bytes(record.name.as_bytes()[0..8].try_into().unwrap());
        assert_eq!(record.data, metadata(seed));
    }
}
