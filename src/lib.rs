//! oxidedup - a deduplication index engine
//!
//! Maps chunk fingerprints to the virtual chapter holding each chunk's
//! record, over a rotating on-disk volume of chapters:
//!
//! - **Request path**: query / update / index / delete against per-zone
//!   handlers, each serializing its own work.
//! - **Chapter lifecycle**: records age from the open chapter through dense
//!   chapters into the sparse window and eventually off the end of the ring.
//! - **Recovery**: the load state machine restores a clean save, replays the
//!   tail of the volume past the last checkpoint, or rebuilds the whole
//!   master index from chapter data.
//!
//! The engine is embedded: it owns no network or device endpoints, and the
//! volume is reached through the [`volume::Volume`] trait so hosts and tests
//! supply their own storage.
//!
//! # Quick start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use oxidedup::{make_index, IndexConfiguration, IndexLayout, LoadType, RamVolume, Request};
//!
//! let config = IndexConfiguration::default();
//! let volume = Arc::new(RamVolume::new(config.geometry()?));
//! let layout = IndexLayout::open("/var/lib/oxidedup")?;
//! let index = make_index(layout, &config, volume, 1, LoadType::Create, None)?;
//!
//! let mut request = Request::index(name, index.zone_for_name(&name), metadata);
//! index.dispatch_request(&mut request)?;
//! ```

#![warn(missing_docs)]

pub mod chapter;
pub mod config;
pub mod error;
pub mod geometry;
pub mod index;
pub mod layout;
pub mod master_index;
pub mod record;
pub mod request;
pub mod sparse;
mod state;
pub mod stats;
pub mod volume;
pub mod zone;

// Re-exports for convenience
pub use config::{IndexConfiguration, OxidedupConfig};
pub use error::{IndexError, Result};
pub use geometry::Geometry;
pub use index::{make_index, DedupIndex, IndexStatus, LoadContext, LoadType, LoadedType};
pub use layout::IndexLayout;
pub use record::{ChunkData, ChunkName, ChunkRecord};
pub use request::{Location, Request, RequestAction};
pub use stats::IndexStats;
pub use volume::{RamVolume, Volume};
