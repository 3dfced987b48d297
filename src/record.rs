//! Chunk names and chunk metadata.
//!
//! A [`ChunkName`] is the fixed-size fingerprint a block-layer deduplicator
//! computes for a chunk of data; it is opaque to the index and compared
//! byte-wise. A [`ChunkData`] is the caller's metadata blob stored alongside
//! the name in a chapter.

use std::fmt;

/// Size of a chunk fingerprint in bytes.
pub const CHUNK_NAME_BYTES: usize = 16;

/// Size of the per-chunk metadata blob in bytes.
pub const CHUNK_DATA_BYTES: usize = 16;

/// A fixed-size opaque chunk fingerprint.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkName([u8; CHUNK_NAME_BYTES]);

impl ChunkName {
    /// Wrap raw fingerprint bytes.
    pub const fn new(bytes: [u8; CHUNK_NAME_BYTES]) -> Self {
        Self(bytes)
    }

    /// The raw fingerprint bytes.
    pub const fn as_bytes(&self) -> &[u8; CHUNK_NAME_BYTES] {
        &self.0
    }

    /// Bits of the name used to select a master-index delta list.
    pub(crate) fn address_bits(&self) -> u64 {
        u64::from_le_bytes(self.0[0..8].try_into().unwrap())
    }

    /// Bits of the name stored in a delta-list entry to distinguish names
    /// sharing an address.
    pub(crate) fn fragment_bits(&self) -> u16 {
        u16::from_le_bytes(self.0[8..10].try_into().unwrap())
    }

    /// Bits of the name consulted by the sampling predicate.
    pub(crate) fn sample_bits(&self) -> u32 {
        u32::from_le_bytes(self.0[10..14].try_into().unwrap())
    }

    /// Render the fingerprint as lowercase hex.
    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(CHUNK_NAME_BYTES * 2);
        for byte in &self.0 {
            out.push_str(&format!("{byte:02x}"));
        }
        out
    }
}

impl fmt::Debug for ChunkName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkName({})", self.to_hex())
    }
}

impl fmt::Display for ChunkName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// The caller-supplied metadata stored with a chunk record.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct ChunkData([u8; CHUNK_DATA_BYTES]);

impl ChunkData {
    /// Wrap raw metadata bytes.
    pub const fn new(bytes: [u8; CHUNK_DATA_BYTES]) -> Self {
        Self(bytes)
    }

    /// The raw metadata bytes.
    pub const fn as_bytes(&self) -> &[u8; CHUNK_DATA_BYTES] {
        &self.0
    }
}

impl fmt::Debug for ChunkData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkData(")?;
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        write!(f, ")")
    }
}

/// One (name, metadata) pair as laid out in a chapter record page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRecord {
    /// The chunk fingerprint.
    pub name: ChunkName,
    /// The metadata stored with it.
    pub data: ChunkData,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name_from(seed: u8) -> ChunkName {
        let mut bytes = [0u8; CHUNK_NAME_BYTES];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = seed.wrapping_add(i as u8);
        }
        ChunkName::new(bytes)
    }

    #[test]
    fn test_equality_is_bytewise() {
        assert_eq!(name_from(7), name_from(7));
        assert_ne!(name_from(7), name_from(8));
    }

    #[test]
    fn test_hex_rendering() {
        let name = ChunkName::new([0xab; CHUNK_NAME_BYTES]);
        assert_eq!(name.to_hex(), "ab".repeat(CHUNK_NAME_BYTES));
        assert_eq!(format!("{name}"), name.to_hex());
    }

    #[test]
    fn test_bit_extraction_regions_are_disjoint() {
        let mut bytes = [0u8; CHUNK_NAME_BYTES];
        bytes[0..8].copy_from_slice(&0x0102_0304_0506_0708u64.to_le_bytes());
        bytes[8..10].copy_from_slice(&0xbeefu16.to_le_bytes());
        bytes[10..14].copy_from_slice(&0xcafe_f00du32.to_le_bytes());
        let name = ChunkName::new(bytes);
        assert_eq!(name.address_bits(), 0x0102_0304_0506_0708);
        assert_eq!(name.fragment_bits(), 0xbeef);
        assert_eq!(name.sample_bits(), 0xcafe_f00d);
    }
}
