//! Storage backends for tile-partitioned feature stores.
//!
//! The query engine only needs three things from storage: the grid zoom
//! level, a way to resolve a [`TileId`] to a tile locator, and a way to
//! fetch a tile's page as a read-only byte view. Everything else (file
//! formats, caching, eviction) stays behind the [`TileStorage`] trait.

use crate::error::{Result, StoreError};
use crate::format;
use crate::types::{MAX_ZOOM, TileId, Tip};
use bytes::Bytes;
use memmap2::Mmap;
use rustc_hash::FxHashMap;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

/// Magic word at the start of a store file.
pub const STORE_MAGIC: u32 = u32::from_le_bytes(*b"TQS1");
/// Current store file format version.
pub const STORE_VERSION: u16 = 1;
/// Store file header: magic, version, zoom, tile count.
pub const STORE_HEADER_LEN: usize = 12;
/// Directory entry: raw tile id, offset, length.
pub const DIR_ENTRY_LEN: usize = 12;

/// A read-only view of one resident tile page.
///
/// Cloning is cheap: the page shares a reference-counted owner (a mapped
/// file region or an in-memory blob), so a lazily materialized feature can
/// keep its page alive past the task that fetched it.
#[derive(Clone)]
pub struct TilePage {
    owner: Arc<dyn AsRef<[u8]> + Send + Sync>,
    start: usize,
    len: usize,
}

impl TilePage {
    pub fn new(owner: Arc<dyn AsRef<[u8]> + Send + Sync>, start: usize, len: usize) -> Self {
        Self { owner, start, len }
    }

    /// The tile image bytes.
    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.owner.as_ref().as_ref()[self.start..self.start + self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl std::fmt::Debug for TilePage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TilePage")
            .field("start", &self.start)
            .field("len", &self.len)
            .finish()
    }
}

/// Storage backend abstraction.
///
/// Implementations must be shareable between worker threads; pages they
/// return are read concurrently and never mutated.
pub trait TileStorage: Send + Sync {
    /// Zoom level of the tile grid this store is partitioned at.
    fn zoom(&self) -> u8;

    /// Resolves a tile id to its locator, or `None` if the store holds no
    /// such tile (sparse grids are the norm).
    fn tip_of(&self, tile: TileId) -> Option<Tip>;

    /// Fetches the tile page for a locator. May block on a page fault.
    fn fetch_tile(&self, tip: Tip) -> Result<TilePage>;

    /// Fetches a tile by id, failing with [`StoreError::TileNotFound`]
    /// when the store holds no such tile.
    fn fetch(&self, tile: TileId) -> Result<TilePage> {
        let tip = self.tip_of(tile).ok_or(StoreError::TileNotFound(tile))?;
        self.fetch_tile(tip)
    }

    /// Number of tiles in the store.
    fn tile_count(&self) -> usize;

    /// Storage statistics.
    fn stats(&self) -> StorageStats {
        StorageStats {
            tile_count: self.tile_count(),
            data_bytes: 0,
        }
    }
}

/// Storage backend statistics.
#[derive(Debug, Clone, Default)]
pub struct StorageStats {
    /// Number of tiles in the store.
    pub tile_count: usize,
    /// Total tile data size in bytes.
    pub data_bytes: usize,
}

fn check_tile_image(page: &TilePage) -> Result<()> {
    // The size limit keeps every record offset inside the packed result
    // pointer range.
    if page.len() > format::MAX_TILE_LEN {
        return Err(StoreError::Corrupt(format!(
            "tile image of {} bytes exceeds the {} byte limit",
            page.len(),
            format::MAX_TILE_LEN
        )));
    }
    let magic = format::read_u32(page.bytes(), 0)?;
    if magic != format::TILE_MAGIC {
        return Err(StoreError::Corrupt(format!(
            "bad tile magic {magic:#x}"
        )));
    }
    Ok(())
}

/// In-memory store, used by embedders and as the fixture substrate for
/// tests. Tiles are held as immutable blobs.
pub struct MemoryStore {
    zoom: u8,
    tiles: Vec<(TileId, Arc<Bytes>)>,
    index: FxHashMap<TileId, u32>,
}

impl MemoryStore {
    pub fn new(zoom: u8) -> Result<Self> {
        if zoom > MAX_ZOOM {
            return Err(StoreError::InvalidInput(format!(
                "zoom {zoom} exceeds maximum {MAX_ZOOM}"
            )));
        }
        Ok(Self {
            zoom,
            tiles: Vec::new(),
            index: FxHashMap::default(),
        })
    }

    /// Adds (or replaces) a tile image.
    pub fn insert_tile(&mut self, tile: TileId, data: Bytes) {
        if let Some(&slot) = self.index.get(&tile) {
            self.tiles[slot as usize] = (tile, Arc::new(data));
        } else {
            let slot = self.tiles.len() as u32;
            self.tiles.push((tile, Arc::new(data)));
            self.index.insert(tile, slot);
        }
    }

    /// Iterates over the stored tiles in insertion order.
    pub fn tiles(&self) -> impl Iterator<Item = (TileId, &Bytes)> {
        self.tiles.iter().map(|(id, data)| (*id, data.as_ref()))
    }
}

impl TileStorage for MemoryStore {
    fn zoom(&self) -> u8 {
        self.zoom
    }

    fn tip_of(&self, tile: TileId) -> Option<Tip> {
        self.index.get(&tile).map(|&slot| Tip(slot))
    }

    fn fetch_tile(&self, tip: Tip) -> Result<TilePage> {
        let (_, data) = self
            .tiles
            .get(tip.0 as usize)
            .ok_or_else(|| StoreError::Other(format!("dangling tile locator {}", tip.0)))?;
        let page = TilePage::new(data.clone(), 0, data.len());
        check_tile_image(&page)?;
        Ok(page)
    }

    fn tile_count(&self) -> usize {
        self.tiles.len()
    }

    fn stats(&self) -> StorageStats {
        StorageStats {
            tile_count: self.tiles.len(),
            data_bytes: self.tiles.iter().map(|(_, d)| d.len()).sum(),
        }
    }
}

struct DirEntry {
    tile: TileId,
    offset: u32,
    len: u32,
}

/// Memory-mapped file store.
///
/// File layout: header (magic, version, zoom, tile count), a directory of
/// (tile id, offset, length) entries, then the tile images. The whole file
/// is mapped once; tile pages are views into the shared map.
pub struct FileStore {
    mmap: Arc<Mmap>,
    zoom: u8,
    directory: Vec<DirEntry>,
    index: FxHashMap<TileId, u32>,
}

impl FileStore {
    /// Opens and maps a store file, validating the header and directory.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        // Safety: the store file is opened read-only and never truncated or
        // rewritten while mapped.
        let mmap = unsafe { Mmap::map(&file)? };
        let buf: &[u8] = &mmap;

        let magic = format::read_u32(buf, 0)
            .map_err(|_| StoreError::Format("file too small for header".into()))?;
        if magic != STORE_MAGIC {
            return Err(StoreError::Format(format!("bad magic {magic:#x}")));
        }
        let version = format::read_u16(buf, 4)?;
        if version != STORE_VERSION {
            return Err(StoreError::Format(format!(
                "unsupported version {version}"
            )));
        }
        let zoom = format::read_u16(buf, 6)?;
        if zoom > MAX_ZOOM as u16 {
            return Err(StoreError::Format(format!("invalid zoom {zoom}")));
        }
        let count = format::read_u32(buf, 8)? as usize;

        let mut directory = Vec::with_capacity(count);
        let mut index = FxHashMap::default();
        let mut pos = STORE_HEADER_LEN;
        for slot in 0..count {
            let tile = TileId::from_raw(format::read_u32(buf, pos)?);
            let offset = format::read_u32(buf, pos + 4)?;
            let len = format::read_u32(buf, pos + 8)?;
            let end = offset as usize + len as usize;
            if end > buf.len() {
                return Err(StoreError::Corrupt(format!(
                    "tile {tile:?} extends past end of file"
                )));
            }
            index.insert(tile, slot as u32);
            directory.push(DirEntry { tile, offset, len });
            pos += DIR_ENTRY_LEN;
        }

        Ok(Self {
            mmap: Arc::new(mmap),
            zoom: zoom as u8,
            directory,
            index,
        })
    }
}

impl TileStorage for FileStore {
    fn zoom(&self) -> u8 {
        self.zoom
    }

    fn tip_of(&self, tile: TileId) -> Option<Tip> {
        self.index.get(&tile).map(|&slot| Tip(slot))
    }

    fn fetch_tile(&self, tip: Tip) -> Result<TilePage> {
        let entry = self
            .directory
            .get(tip.0 as usize)
            .ok_or_else(|| StoreError::Other(format!("dangling tile locator {}", tip.0)))?;
        let page = TilePage::new(
            self.mmap.clone(),
            entry.offset as usize,
            entry.len as usize,
        );
        check_tile_image(&page).map_err(|err| match err {
            StoreError::Corrupt(msg) => {
                StoreError::Corrupt(format!("tile {:?}: {msg}", entry.tile))
            }
            other => other,
        })?;
        Ok(page)
    }

    fn tile_count(&self) -> usize {
        self.directory.len()
    }

    fn stats(&self) -> StorageStats {
        StorageStats {
            tile_count: self.directory.len(),
            data_bytes: self.directory.iter().map(|e| e.len as usize).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn minimal_tile() -> Bytes {
        let mut buf = BytesMut::zeroed(format::TILE_HEADER_LEN);
        buf[0..4].copy_from_slice(&format::TILE_MAGIC.to_le_bytes());
        buf.freeze()
    }

    #[test]
    fn test_memory_store_round_trip() {
        let mut store = MemoryStore::new(4).unwrap();
        let tile = TileId::new(4, 3, 5);
        store.insert_tile(tile, minimal_tile());

        assert_eq!(store.tile_count(), 1);
        let tip = store.tip_of(tile).unwrap();
        let page = store.fetch_tile(tip).unwrap();
        assert_eq!(page.len(), format::TILE_HEADER_LEN);
        assert!(store.tip_of(TileId::new(4, 0, 0)).is_none());
    }

    #[test]
    fn test_memory_store_rejects_bad_zoom() {
        assert!(matches!(
            MemoryStore::new(13),
            Err(StoreError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_memory_store_rejects_bad_magic() {
        let mut store = MemoryStore::new(2).unwrap();
        let tile = TileId::new(2, 1, 1);
        store.insert_tile(tile, Bytes::from_static(&[0u8; 20]));
        let tip = store.tip_of(tile).unwrap();
        assert!(matches!(
            store.fetch_tile(tip),
            Err(StoreError::Corrupt(_))
        ));
    }

    #[test]
    fn test_fetch_by_id_reports_missing_tile() {
        let mut store = MemoryStore::new(4).unwrap();
        let tile = TileId::new(4, 3, 5);
        store.insert_tile(tile, minimal_tile());

        assert!(store.fetch(tile).is_ok());
        assert!(matches!(
            store.fetch(TileId::new(4, 0, 0)),
            Err(StoreError::TileNotFound(_))
        ));
    }

    #[test]
    fn test_rejects_oversized_tile_image() {
        // The size check fires before any byte of the page is touched, so
        // a fabricated length is enough to exercise it.
        let owner: Arc<Bytes> = Arc::new(minimal_tile());
        let page = TilePage::new(owner, 0, format::MAX_TILE_LEN + 1);
        assert!(matches!(
            check_tile_image(&page),
            Err(StoreError::Corrupt(_))
        ));
    }

    #[test]
    fn test_page_clone_shares_owner() {
        let mut store = MemoryStore::new(1).unwrap();
        let tile = TileId::new(1, 0, 0);
        store.insert_tile(tile, minimal_tile());
        let page = store.fetch_tile(store.tip_of(tile).unwrap()).unwrap();
        let clone = page.clone();
        assert_eq!(page.bytes().as_ptr(), clone.bytes().as_ptr());
    }
}
