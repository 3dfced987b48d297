//! Index requests and their results.

use crate::record::{ChunkData, ChunkName};

/// What a request asks the index to do with a chunk name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestAction {
    /// Look the name up; mutate only if `update` is set and the name exists.
    Query,
    /// Re-home the name in the open chapter with fresh metadata.
    Update,
    /// Register a new chunk (or promote an existing one).
    Index,
    /// Remove the name from the index.
    Delete,
}

/// Where a request found (or left) its chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Location {
    /// The chunk is not in the index.
    #[default]
    Unavailable,
    /// The chunk's record is in the open chapter.
    InOpenChapter,
    /// The chunk's record is in a dense closed chapter.
    InDense,
    /// The chunk's record was served from the sparse chapter cache.
    InSparse,
}

/// One unit of work for an index zone.
///
/// The caller routes the request to a zone (see
/// [`crate::master_index::zone_for_name`]) and reads back `location` and
/// `old_metadata` after dispatch.
#[derive(Debug, Clone)]
pub struct Request {
    /// The chunk fingerprint being queried or registered.
    pub chunk_name: ChunkName,
    /// The zone that must service this request.
    pub zone_number: u32,
    /// The operation to perform.
    pub action: RequestAction,
    /// For [`RequestAction::Query`]: whether a hit may mutate the index.
    pub update: bool,
    /// Metadata to store for a new or updated record.
    pub new_metadata: ChunkData,
    /// Metadata found for an existing record; filled by the zone on a hit.
    pub old_metadata: ChunkData,
    /// Where the chunk was found; set by dispatch.
    pub location: Location,
    /// Whether this request has already been through a zone once. A requeued
    /// request skips the sparse-cache barrier simulation.
    pub requeued: bool,
}

impl Request {
    /// Build a request with default metadata and flags.
    pub fn new(chunk_name: ChunkName, action: RequestAction, zone_number: u32) -> Self {
        Self {
            chunk_name,
            zone_number,
            action,
            update: false,
            new_metadata: ChunkData::default(),
            old_metadata: ChunkData::default(),
            location: Location::Unavailable,
            requeued: false,
        }
    }

    /// Build a query, optionally allowing the hit path to mutate.
    pub fn query(chunk_name: ChunkName, zone_number: u32, update: bool) -> Self {
        let mut request = Self::new(chunk_name, RequestAction::Query, zone_number);
        request.update = update;
        request
    }

    /// Build an index (register) request carrying new metadata.
    pub fn index(chunk_name: ChunkName, zone_number: u32, new_metadata: ChunkData) -> Self {
        let mut request = Self::new(chunk_name, RequestAction::Index, zone_number);
        request.new_metadata = new_metadata;
        request
    }

    /// Build an update request carrying new metadata.
    pub fn update(chunk_name: ChunkName, zone_number: u32, new_metadata: ChunkData) -> Self {
        let mut request = Self::new(chunk_name, RequestAction::Update, zone_number);
        request.new_metadata = new_metadata;
        request
    }

    /// Build a delete request.
    pub fn delete(chunk_name: ChunkName, zone_number: u32) -> Self {
        Self::new(chunk_name, RequestAction::Delete, zone_number)
    }
}
