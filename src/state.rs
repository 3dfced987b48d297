//! Saved index state.
//!
//! The state store persists the index's registered components into the
//! layout directory as fixed little-endian binary files, each with a magic
//! and format version. The open chapter file is written last and read back
//! only on a clean load; its absence is what makes a load require replay.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use uuid::Uuid;

use crate::error::{IndexError, Result};
use crate::layout::IndexLayout;
use crate::master_index::{ExportedEntry, MasterIndex};
use crate::record::{ChunkData, ChunkName, ChunkRecord, CHUNK_DATA_BYTES, CHUNK_NAME_BYTES};
use crate::volume::{PageMapEntry, Volume};

const META_MAGIC: &[u8; 8] = b"OXDIMETA";
const MASTER_MAGIC: &[u8; 8] = b"OXDIMAST";
const PAGE_MAP_MAGIC: &[u8; 8] = b"OXDIPMAP";
const OPEN_MAGIC: &[u8; 8] = b"OXDIOPEN";
const FORMAT_VERSION: u32 = 1;

const FLAG_COLLISION: u8 = 1 << 0;
const FLAG_SAMPLED: u8 = 1 << 1;

/// The index-level header persisted in `index.meta`.
///
/// `open_chapter` is the newest virtual chapter at save time; the loader
/// derives `last_checkpoint` from it (`open_chapter == 0` maps to no
/// checkpoint at all).
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SavedIndexMeta {
    pub identity: Uuid,
    pub nonce: u64,
    pub open_chapter: u64,
    pub oldest_chapter: u64,
    pub zone_count: u32,
}

struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    fn new(magic: &[u8; 8]) -> Self {
        let mut buf = Vec::new();
        buf.extend_from_slice(magic);
        buf.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        Self { buf }
    }

    fn u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    fn u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn bytes(&mut self, value: &[u8]) {
        self.buf.extend_from_slice(value);
    }

    fn write_to(self, path: &Path) -> Result<()> {
        fs::write(path, self.buf)?;
        Ok(())
    }
}

struct ByteReader {
    buf: Vec<u8>,
    pos: usize,
    file: &'static str,
}

impl ByteReader {
    fn open(path: &Path, magic: &[u8; 8], file: &'static str) -> Result<Self> {
        let buf = fs::read(path)?;
        let mut reader = Self { buf, pos: 0, file };
        let found = reader.take(8)?;
        if found != &magic[..] {
            return Err(IndexError::CorruptComponent(format!(
                "{file} has a bad magic"
            )));
        }
        let version = reader.u32()?;
        if version != FORMAT_VERSION {
            return Err(IndexError::CorruptComponent(format!(
                "{file} has unsupported format version {version}"
            )));
        }
        Ok(reader)
    }

    fn take(&mut self, len: usize) -> Result<&[u8]> {
        if self.pos + len > self.buf.len() {
            return Err(IndexError::CorruptComponent(format!(
                "{} is truncated",
                self.file
            )));
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }
}

/// Write `index.meta`.
pub(crate) fn write_index_meta(path: &Path, meta: &SavedIndexMeta) -> Result<()> {
    let mut writer = ByteWriter::new(META_MAGIC);
    writer.bytes(meta.identity.as_bytes());
    writer.u64(meta.nonce);
    writer.u64(meta.open_chapter);
    writer.u64(meta.oldest_chapter);
    writer.u32(meta.zone_count);
    writer.write_to(path)
}

/// Read `index.meta`.
pub(crate) fn read_index_meta(path: &Path) -> Result<SavedIndexMeta> {
    let mut reader = ByteReader::open(path, META_MAGIC, "index.meta")?;
    let identity = Uuid::from_bytes(reader.take(16)?.try_into().unwrap());
    Ok(SavedIndexMeta {
        identity,
        nonce: reader.u64()?,
        open_chapter: reader.u64()?,
        oldest_chapter: reader.u64()?,
        zone_count: reader.u32()?,
    })
}

/// Write the per-zone open chapter records.
pub(crate) fn write_open_chapters(path: &Path, zones: &[Vec<ChunkRecord>]) -> Result<()> {
    let mut writer = ByteWriter::new(OPEN_MAGIC);
    writer.u32(zones.len() as u32);
    for records in zones {
        writer.u32(records.len() as u32);
        for record in records {
            writer.bytes(record.name.as_bytes());
            writer.bytes(record.data.as_bytes());
        }
    }
    writer.write_to(path)
}

/// Read the per-zone open chapter records; `None` when no clean save exists.
pub(crate) fn read_open_chapters(path: &Path) -> Result<Option<Vec<Vec<ChunkRecord>>>> {
    if !path.exists() {
        return Ok(None);
    }
    let mut reader = ByteReader::open(path, OPEN_MAGIC, "open chapter file")?;
    let zone_count = reader.u32()?;
    let mut zones = Vec::with_capacity(zone_count as usize);
    for _ in 0..zone_count {
        let count = reader.u32()?;
        let mut records = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let name = ChunkName::new(reader.take(CHUNK_NAME_BYTES)?.try_into().unwrap());
            let data = ChunkData::new(reader.take(CHUNK_DATA_BYTES)?.try_into().unwrap());
            records.push(ChunkRecord { name, data });
        }
        zones.push(records);
    }
    Ok(Some(zones))
}

/// A sub-component whose state the store persists and restores.
pub(crate) trait StateComponent: Send + Sync {
    /// The component's file within the layout directory.
    fn file_name(&self) -> &'static str;
    /// Persist the component into `path`.
    fn save(&self, path: &Path) -> Result<()>;
    /// Restore the component from `path`; a missing file restores empty.
    fn load(&self, path: &Path) -> Result<()>;
}

/// The registered set of persistable components.
pub(crate) struct IndexState {
    components: Vec<Box<dyn StateComponent>>,
}

impl IndexState {
    pub(crate) fn new() -> Self {
        Self {
            components: Vec::new(),
        }
    }

    pub(crate) fn register(&mut self, component: Box<dyn StateComponent>) {
        self.components.push(component);
    }

    pub(crate) fn save_components(&self, layout: &IndexLayout) -> Result<()> {
        for component in &self.components {
            component.save(&layout.component_path(component.file_name()))?;
        }
        Ok(())
    }

    pub(crate) fn load_components(&self, layout: &IndexLayout) -> Result<()> {
        for component in &self.components {
            component.load(&layout.component_path(component.file_name()))?;
        }
        Ok(())
    }

    pub(crate) fn discard_components(&self, layout: &IndexLayout) -> Result<()> {
        for component in &self.components {
            let path = layout.component_path(component.file_name());
            if path.exists() {
                fs::remove_file(path)?;
            }
        }
        Ok(())
    }
}

/// Persists the master-index entry lists.
pub(crate) struct MasterIndexComponent(pub Arc<MasterIndex>);

impl StateComponent for MasterIndexComponent {
    fn file_name(&self) -> &'static str {
        "master.dat"
    }

    fn save(&self, path: &Path) -> Result<()> {
        let entries = self.0.export_entries();
        let mut writer = ByteWriter::new(MASTER_MAGIC);
        writer.u64(entries.len() as u64);
        for entry in entries {
            writer.u32(entry.zone);
            writer.u64(entry.address);
            writer.u16(entry.fragment);
            let mut flags = 0u8;
            if entry.full_name.is_some() {
                flags |= FLAG_COLLISION;
            }
            if entry.sampled {
                flags |= FLAG_SAMPLED;
            }
            writer.u8(flags);
            writer.u64(entry.chapter);
            if let Some(name) = entry.full_name {
                writer.bytes(name.as_bytes());
            }
        }
        writer.write_to(path)
    }

    fn load(&self, path: &Path) -> Result<()> {
        if !path.exists() {
            self.0.import_entries(Vec::new())?;
            return Ok(());
        }
        let mut reader = ByteReader::open(path, MASTER_MAGIC, "master.dat")?;
        let count = reader.u64()?;
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let zone = reader.u32()?;
            let address = reader.u64()?;
            let fragment = reader.u16()?;
            let flags = reader.u8()?;
            let chapter = reader.u64()?;
            let full_name = if flags & FLAG_COLLISION != 0 {
                Some(ChunkName::new(
                    reader.take(CHUNK_NAME_BYTES)?.try_into().unwrap(),
                ))
            } else {
                None
            };
            entries.push(ExportedEntry {
                zone,
                address,
                fragment,
                full_name,
                chapter,
                sampled: flags & FLAG_SAMPLED != 0,
            });
        }
        self.0.import_entries(entries)
    }
}

/// Persists the volume's index-page map.
pub(crate) struct PageMapComponent<V: Volume>(pub Arc<V>);

impl<V: Volume> StateComponent for PageMapComponent<V> {
    fn file_name(&self) -> &'static str {
        "pagemap.dat"
    }

    fn save(&self, path: &Path) -> Result<()> {
        let (last_update, entries) = self.0.page_map().export_entries();
        let mut writer = ByteWriter::new(PAGE_MAP_MAGIC);
        writer.u64(last_update);
        writer.u64(entries.len() as u64);
        for (chapter, page, entry) in entries {
            writer.u32(chapter);
            writer.u32(page);
            writer.u64(entry.virtual_chapter);
            writer.u32(entry.highest_list);
        }
        writer.write_to(path)
    }

    fn load(&self, path: &Path) -> Result<()> {
        if !path.exists() {
            self.0.page_map().import_entries(0, Vec::new());
            return Ok(());
        }
        let mut reader = ByteReader::open(path, PAGE_MAP_MAGIC, "pagemap.dat")?;
        let last_update = reader.u64()?;
        let count = reader.u64()?;
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let chapter = reader.u32()?;
            let page = reader.u32()?;
            let virtual_chapter = reader.u64()?;
            let highest_list = reader.u32()?;
            entries.push((
                chapter,
                page,
                PageMapEntry {
                    virtual_chapter,
                    highest_list,
                },
            ));
        }
        self.0.page_map().import_entries(last_update, entries);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Geometry;
    use crate::volume::RamVolume;

    #[test]
    fn test_meta_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.meta");
        let meta = SavedIndexMeta {
            identity: Uuid::new_v4(),
            nonce: 0xdead_beef,
            open_chapter: 7,
            oldest_chapter: 2,
            zone_count: 3,
        };
        write_index_meta(&path, &meta).unwrap();
        assert_eq!(read_index_meta(&path).unwrap(), meta);
    }

    #[test]
    fn test_meta_rejects_bad_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.meta");
        fs::write(&path, b"NOTMETA!....").unwrap();
        assert!(matches!(
            read_index_meta(&path),
            Err(IndexError::CorruptComponent(_))
        ));
    }

    #[test]
    fn test_open_chapter_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("open.dat");
        assert!(read_open_chapters(&path).unwrap().is_none());

        let zones = vec![
            vec![ChunkRecord {
                name: ChunkName::new([1; 16]),
                data: ChunkData::new([2; 16]),
            }],
            Vec::new(),
        ];
        write_open_chapters(&path, &zones).unwrap();
        let restored = read_open_chapters(&path).unwrap().unwrap();
        assert_eq!(restored, zones);
    }

    #[test]
    fn test_master_component_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let geometry = Geometry::new(8, 1, 1, 4, 0, 2).unwrap();
        let mi = Arc::new(MasterIndex::new(&geometry, 1, 42, 32).unwrap());
        let name = ChunkName::new([5; 16]);
        let record = mi.get_record(&name).unwrap();
        mi.put_record(&record, 3).unwrap();

        let component = MasterIndexComponent(mi);
        let path = dir.path().join(component.file_name());
        component.save(&path).unwrap();

        let restored = Arc::new(MasterIndex::new(&geometry, 1, 42, 32).unwrap());
        MasterIndexComponent(restored.clone()).load(&path).unwrap();
        let record = restored.get_record(&name).unwrap();
        assert!(record.is_found);
        assert_eq!(record.virtual_chapter, 3);
    }

    #[test]
    fn test_page_map_component_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let geometry = Geometry::new(8, 1, 1, 4, 0, 2).unwrap();
        let volume = Arc::new(RamVolume::new(geometry.clone()));
        volume.page_map().update(4, 4, 0, 1).unwrap();

        let component = PageMapComponent(volume.clone());
        let path = dir.path().join(component.file_name());
        component.save(&path).unwrap();

        let restored = Arc::new(RamVolume::new(geometry));
        PageMapComponent(restored.clone()).load(&path).unwrap();
        assert_eq!(restored.page_map().get(4, 0).unwrap().virtual_chapter, 4);
        assert_eq!(restored.page_map().last_update(), volume.page_map().last_update());
    }
}
