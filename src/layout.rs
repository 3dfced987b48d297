//! On-disk layout of an index's saved state.
//!
//! An [`IndexLayout`] names the directory the state store writes into and
//! carries the index identity. The identity is minted when a layout is first
//! opened over an empty directory and survives across save/load cycles; the
//! master-index nonce is derived from it.

use std::fs;
use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::error::Result;
use crate::state;

const META_FILE: &str = "index.meta";
const OPEN_CHAPTER_FILE: &str = "open.dat";

/// The state directory and identity of one index.
#[derive(Debug, Clone)]
pub struct IndexLayout {
    directory: PathBuf,
    identity: Uuid,
}

impl IndexLayout {
    /// Open a layout over `directory`, creating the directory if needed.
    ///
    /// If a saved index exists there, its identity is adopted; otherwise a
    /// fresh identity is minted (and persisted by the first save).
    pub fn open(directory: impl Into<PathBuf>) -> Result<Self> {
        let directory = directory.into();
        fs::create_dir_all(&directory)?;
        let meta_path = directory.join(META_FILE);
        let identity = if meta_path.exists() {
            state::read_index_meta(&meta_path)?.identity
        } else {
            Uuid::new_v4()
        };
        Ok(Self {
            directory,
            identity,
        })
    }

    /// The state directory.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// The index identity token.
    pub fn identity(&self) -> Uuid {
        self.identity
    }

    /// The nonce that keys the master index, derived from the identity.
    pub fn volume_nonce(&self) -> u64 {
        u64::from_le_bytes(self.identity.as_bytes()[0..8].try_into().unwrap())
    }

    /// Whether an index has ever been created in this layout.
    pub fn index_exists(&self) -> bool {
        self.meta_path().exists()
    }

    pub(crate) fn meta_path(&self) -> PathBuf {
        self.directory.join(META_FILE)
    }

    pub(crate) fn open_chapter_path(&self) -> PathBuf {
        self.directory.join(OPEN_CHAPTER_FILE)
    }

    pub(crate) fn component_path(&self, file_name: &str) -> PathBuf {
        self.directory.join(file_name)
    }

    /// Remove every saved state file, keeping the directory.
    pub fn discard_state(&self) -> Result<()> {
        for entry in fs::read_dir(&self.directory)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }

    /// Remove only the saved open chapter, forcing the next load to replay.
    ///
    /// This is what a dirty shutdown looks like to the loader.
    pub fn discard_saved_open_chapter(&self) -> Result<()> {
        let path = self.open_chapter_path();
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }
}
