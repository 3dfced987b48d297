//! Request-path tests: search, promotion, update, and delete semantics.

mod common;

use common::{dense_config, found, index_one, metadata, new_volume, open_layout, query_one, test_name};
use oxidedup::{make_index, LoadType, Location, RamVolume, Request};

fn fresh_index(dir: &std::path::Path) -> oxidedup::DedupIndex<RamVolume> {
    let config = dense_config();
    make_index(
        open_layout(dir),
        &config,
        new_volume(&config),
        1,
        LoadType::Create,
        None,
    )
    .unwrap()
}

/// Fill whole chapters so `newest` advances.
fn fill_chapters(index: &oxidedup::DedupIndex<RamVolume>, first_seed: u64, chapters: u64) {
    let per_chapter = u64::from(index.geometry().records_per_chapter());
    for seed in first_seed..first_seed + chapters * per_chapter {
        index_one(index, seed);
    }
    index.wait_for_idle().unwrap();
}

#[test]
fn test_miss_then_hit_in_open_chapter() {
    let dir = tempfile::tempdir().unwrap();
    let index = fresh_index(dir.path());

    let request = query_one(&index, 7, false);
    assert!(!found(&request));

    let request = index_one(&index, 7);
    assert_eq!(request.location, Location::Unavailable);

    let request = query_one(&index, 7, false);
    assert_eq!(request.location, Location::InOpenChapter);
    assert_eq!(request.old_metadata, metadata(7));
}

#[test]
fn test_query_without_update_does_not_mutate() {
    let dir = tempfile::tempdir().unwrap();
    let index = fresh_index(dir.path());

    // Land seed 0 in chapter 1 = newest - 3.
    fill_chapters(&index, 0, 4);
    assert_eq!(index.newest_virtual_chapter(), 4);

    let before = index.get_stats().entries_indexed;
    let request = query_one(&index, 4, false);
    assert_eq!(request.location, Location::InDense);
    assert_eq!(request.old_metadata, metadata(4));

    // No mutation: the entry count is unchanged and the record was not
    // promoted into the open chapter.
    assert_eq!(index.get_stats().entries_indexed, before);
    let request = query_one(&index, 4, false);
    assert_eq!(request.location, Location::InDense);

    // Unknown names are not registered either.
    let request = query_one(&index, 999, false);
    assert!(!found(&request));
    assert_eq!(index.get_stats().entries_indexed, before);
}

#[test]
fn test_query_with_update_promotes_to_open_chapter() {
    let dir = tempfile::tempdir().unwrap();
    let index = fresh_index(dir.path());

    fill_chapters(&index, 0, 4);
    let request = query_one(&index, 4, true);
    assert_eq!(request.location, Location::InDense);

    // The hit re-homed the record; it now answers from the open chapter
    // with its original metadata (LRU promotion, not an update).
    let request = query_one(&index, 4, false);
    assert_eq!(request.location, Location::InOpenChapter);
    assert_eq!(request.old_metadata, metadata(4));
}

#[test]
fn test_update_rewrites_metadata_and_promotes() {
    let dir = tempfile::tempdir().unwrap();
    let index = fresh_index(dir.path());

    fill_chapters(&index, 0, 4);
    let name = test_name(4);

    let mut request = Request::update(name, index.zone_for_name(&name), metadata(1000));
    index.dispatch_request(&mut request).unwrap();
    assert_eq!(request.location, Location::InDense);

    let request = query_one(&index, 4, false);
    assert_eq!(request.location, Location::InOpenChapter);
    assert_eq!(request.old_metadata, metadata(1000));
}

#[test]
fn test_update_in_open_chapter_refreshes_metadata_only() {
    let dir = tempfile::tempdir().unwrap();
    let index = fresh_index(dir.path());

    index_one(&index, 3);
    let before = index.get_stats().entries_indexed;
    let name = test_name(3);

    let mut request = Request::update(name, index.zone_for_name(&name), metadata(2000));
    index.dispatch_request(&mut request).unwrap();
    assert_eq!(request.location, Location::InOpenChapter);

    // Same master-index entry, same open chapter slot, fresh metadata.
    assert_eq!(index.get_stats().entries_indexed, before);
    let request = query_one(&index, 3, false);
    assert_eq!(request.location, Location::InOpenChapter);
    assert_eq!(request.old_metadata, metadata(2000));
}

#[test]
fn test_reindex_of_duplicate_keeps_old_metadata() {
    let dir = tempfile::tempdir().unwrap();
    let index = fresh_index(dir.path());

    fill_chapters(&index, 0, 4);
    let name = test_name(4);

    // INDEX of an already-known chunk is an LRU move, not an update.
    let mut request = Request::index(name, index.zone_for_name(&name), metadata(3000));
    index.dispatch_request(&mut request).unwrap();
    assert_eq!(request.location, Location::InDense);

    let request = query_one(&index, 4, false);
    assert_eq!(request.location, Location::InOpenChapter);
    assert_eq!(request.old_metadata, metadata(4));
}

#[test]
fn test_delete_from_open_chapter() {
    let dir = tempfile::tempdir().unwrap();
    let index = fresh_index(dir.path());

    index_one(&index, 5);
    let name = test_name(5);
    let mut request = Request::delete(name, index.zone_for_name(&name));
    index.dispatch_request(&mut request).unwrap();
    assert_eq!(request.location, Location::InOpenChapter);

    assert!(!found(&query_one(&index, 5, false)));
}

#[test]
fn test_delete_from_closed_chapter() {
    let dir = tempfile::tempdir().unwrap();
    let index = fresh_index(dir.path());

    fill_chapters(&index, 0, 2);
    let name = test_name(1);
    let mut request = Request::delete(name, index.zone_for_name(&name));
    index.dispatch_request(&mut request).unwrap();
    assert_eq!(request.location, Location::InDense);

    assert!(!found(&query_one(&index, 1, false)));
}

#[test]
fn test_delete_of_unknown_name_is_ok() {
    let dir = tempfile::tempdir().unwrap();
    let index = fresh_index(dir.path());

    let name = test_name(42);
    let mut request = Request::delete(name, index.zone_for_name(&name));
    index.dispatch_request(&mut request).unwrap();
    assert_eq!(request.location, Location::Unavailable);
}

#[test]
fn test_records_age_off_the_ring() {
    let dir = tempfile::tempdir().unwrap();
    let index = fresh_index(dir.path());
    let per_chapter = u64::from(index.geometry().records_per_chapter());

    // Fill past the ring so the earliest chapters expire.
    fill_chapters(&index, 0, 12);
    assert_eq!(index.newest_virtual_chapter(), 12);
    assert_eq!(index.oldest_virtual_chapter(), 4);
    assert!(index.get_stats().entries_discarded > 0);

    // Chapter 0 records are gone; recent ones still answer.
    assert!(!found(&query_one(&index, 0, false)));
    let recent = 11 * per_chapter;
    assert_eq!(query_one(&index, recent, false).location, Location::InDense);
}

#[test]
fn test_zone_observes_its_own_prior_mutations() {
    let dir = tempfile::tempdir().unwrap();
    let index = fresh_index(dir.path());

    index_one(&index, 8);
    assert_eq!(query_one(&index, 8, false).location, Location::InOpenChapter);

    let name = test_name(8);
    let mut request = Request::delete(name, index.zone_for_name(&name));
    index.dispatch_request(&mut request).unwrap();
    assert!(!found(&query_one(&index, 8, false)));

    index_one(&index, 8);
    assert_eq!(query_one(&index, 8, false).location, Location::InOpenChapter);
}

#[test]
fn test_two_zones_route_and_answer() {
    let dir = tempfile::tempdir().unwrap();
    let config = dense_config();
    let index = make_index(
        open_layout(dir.path()),
        &config,
        new_volume(&config),
        2,
        LoadType::Create,
        None,
    )
    .unwrap();

    // Stay below one chapter of records: zones close their chapters
    // independently, and a half-contributed chapter is not yet readable.
    for seed in 0..3 {
        index_one(&index, seed);
    }
    for seed in 0..3 {
        let request = query_one(&index, seed, false);
        assert_eq!(request.location, Location::InOpenChapter, "seed {seed}");
        assert_eq!(request.old_metadata, metadata(seed));
    }
}

#[test]
fn test_stats_track_activity() {
    let dir = tempfile::tempdir().unwrap();
    let index = fresh_index(dir.path());

    for seed in 0..6 {
        index_one(&index, seed);
    }
    index.wait_for_idle().unwrap();

    let stats = index.get_stats();
    assert_eq!(stats.entries_indexed, 6);
    assert!(stats.memory_used > 0);
    assert_eq!(stats.checkpoints, 0);
}
