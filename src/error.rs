//! Error codes surfaced by the index engine.

/// Errors returned by index operations.
///
/// A few of these are not failures in the usual sense: [`IndexError::Overflow`]
/// and [`IndexError::DuplicateName`] are returned by master-index inserts and
/// are absorbed by the request and replay paths, and
/// [`IndexError::ShuttingDown`] reports a clean abort of a replay rather than
/// a broken index.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    /// The saved open chapter is missing and replay was not permitted.
    #[error("index not saved cleanly: open chapter missing")]
    NotSavedCleanly,
    /// No index exists in the layout.
    #[error("no index exists in the layout")]
    NoIndex,
    /// A persisted component is unusable.
    #[error("corrupt component: {0}")]
    CorruptComponent(String),
    /// On-disk chapter data failed validation.
    #[error("corrupt data: {0}")]
    CorruptData(String),
    /// An allocation failed.
    #[error("out of memory")]
    OutOfMemory,
    /// A master-index delta list is at capacity.
    #[error("master index delta list overflow")]
    Overflow,
    /// The master index already holds a record for this exact name.
    #[error("duplicate chunk name in master index")]
    DuplicateName,
    /// An operation was attempted in a state that cannot service it.
    #[error("bad state: {0}")]
    BadState(String),
    /// A caller-supplied value is out of range or inconsistent.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// A replay was interrupted by index shutdown.
    #[error("index shutting down")]
    ShuttingDown,
    /// An I/O error from the state store.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, IndexError>;
