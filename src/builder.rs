//! Construction of tile images and store files.
//!
//! [`TileBuilder`] packs a set of described features into the binary tile
//! layout: string pool and tag tables first, then the leaf nodes of every
//! kind tree, relation member tables, trunk levels bottom-up, and finally
//! the header root slots. [`StoreBuilder`] collects built tiles into an
//! in-memory store or writes them out as a mappable store file.
//!
//! The builder favors simplicity over packing quality: features are
//! bulk-loaded into leaves in coordinate order rather than through a
//! balancing split. Query behavior does not depend on tree shape.

use crate::error::{Result, StoreError};
use crate::feature::FeatureKind;
use crate::format;
use crate::storage::{
    DIR_ENTRY_LEN, MemoryStore, STORE_HEADER_LEN, STORE_MAGIC, STORE_VERSION,
};
use crate::types::{BoundingBox, MAX_ZOOM, TileId};
use bytes::{BufMut, Bytes, BytesMut};
use rustc_hash::{FxHashMap, FxHashSet};
use std::io::Write;
use std::path::Path;

/// Largest feature id the record layout can hold (56 bits).
pub const MAX_FEATURE_ID: u64 = (1 << 56) - 1;

const DEFAULT_LEAF_CAPACITY: usize = 8;

/// Description of one feature to be packed into a tile.
#[derive(Debug, Clone)]
pub struct TileFeature {
    kind: FeatureKind,
    id: u64,
    bounds: BoundingBox,
    extra_flags: u8,
    tags: Vec<(String, String)>,
    category: u32,
    members: Vec<(FeatureKind, u64, String)>,
}

impl TileFeature {
    fn new(kind: FeatureKind, id: u64, bounds: BoundingBox, extra_flags: u8) -> Self {
        Self {
            kind,
            id,
            bounds,
            extra_flags,
            tags: Vec::new(),
            category: 0,
            members: Vec::new(),
        }
    }

    /// A point feature at (`x`, `y`).
    pub fn node(id: u64, x: i32, y: i32) -> Self {
        Self::new(FeatureKind::Node, id, BoundingBox::point(x, y), 0)
    }

    /// A linear way covering `bounds`.
    pub fn way(id: u64, bounds: BoundingBox) -> Self {
        Self::new(FeatureKind::Way, id, bounds, 0)
    }

    /// A closed way forming an area.
    pub fn area_way(id: u64, bounds: BoundingBox) -> Self {
        Self::new(FeatureKind::Way, id, bounds, format::FLAG_AREA)
    }

    /// A non-area relation.
    pub fn relation(id: u64, bounds: BoundingBox) -> Self {
        Self::new(FeatureKind::Relation, id, bounds, 0)
    }

    /// A multipolygon relation forming an area.
    pub fn area_relation(id: u64, bounds: BoundingBox) -> Self {
        Self::new(FeatureKind::Relation, id, bounds, format::FLAG_AREA)
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.push((key.into(), value.into()));
        self
    }

    /// Index category bits; a kind with any categorized feature is stored
    /// behind a bucket list partitioned by these bits.
    pub fn with_category(mut self, bits: u32) -> Self {
        self.category = bits;
        self
    }

    /// Marks this copy as replicated into the tile to the west.
    pub fn multi_west(mut self) -> Self {
        self.extra_flags |= format::FLAG_MULTI_WEST;
        self
    }

    /// Marks this copy as replicated into the tile to the north.
    pub fn multi_north(mut self) -> Self {
        self.extra_flags |= format::FLAG_MULTI_NORTH;
        self
    }

    /// Marks a node that also appears as a way vertex.
    pub fn way_node(mut self) -> Self {
        debug_assert_eq!(self.kind, FeatureKind::Node);
        self.extra_flags |= format::FLAG_WAY_NODE;
        self
    }

    /// Adds a relation member by kind and id. Members not present in the
    /// same tile are stored as foreign references.
    pub fn with_member(mut self, kind: FeatureKind, id: u64, role: impl Into<String>) -> Self {
        self.members.push((kind, id, role.into()));
        self
    }

    fn kind_bits(&self) -> u8 {
        match self.kind {
            FeatureKind::Node => format::KIND_NODE,
            FeatureKind::Way => format::KIND_WAY,
            FeatureKind::Relation => format::KIND_RELATION,
        }
    }
}

/// Builds one tile image.
pub struct TileBuilder {
    features: Vec<TileFeature>,
    leaf_capacity: usize,
}

impl Default for TileBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// One leaf or trunk node awaiting linkage into the level above.
struct TreeNode {
    ofs: u32,
    bounds: BoundingBox,
    is_leaf: bool,
}

impl TileBuilder {
    pub fn new() -> Self {
        Self {
            features: Vec::new(),
            leaf_capacity: DEFAULT_LEAF_CAPACITY,
        }
    }

    /// Entries per leaf and per trunk node.
    pub fn with_leaf_capacity(mut self, capacity: usize) -> Self {
        assert!(capacity >= 2, "Leaf capacity must be at least 2");
        self.leaf_capacity = capacity;
        self
    }

    pub fn add(&mut self, feature: TileFeature) -> &mut Self {
        self.features.push(feature);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Packs the described features into a tile image.
    pub fn build(&self) -> Result<Bytes> {
        for f in &self.features {
            if f.id > MAX_FEATURE_ID {
                return Err(StoreError::InvalidInput(format!(
                    "feature id {} exceeds 56 bits",
                    f.id
                )));
            }
            if !f.bounds.is_valid() {
                return Err(StoreError::InvalidInput(format!(
                    "feature {} has an inverted bounding box",
                    f.id
                )));
            }
        }

        let mut buf = BytesMut::zeroed(format::TILE_HEADER_LEN);
        buf[0..4].copy_from_slice(&format::TILE_MAGIC.to_le_bytes());

        let mut strings = StringPool::default();
        // Tag tables and role strings go in front of the trees so leaf
        // offsets stay stable once written.
        let mut tags_ofs = vec![0u32; self.features.len()];
        for (i, f) in self.features.iter().enumerate() {
            tags_ofs[i] = Self::write_tag_table(&mut buf, &mut strings, &f.tags)?;
            for (_, _, role) in &f.members {
                strings.intern(&mut buf, role);
            }
        }

        // Group features into the four kind trees.
        let groups: [(usize, bool, Vec<usize>); 4] = [
            (format::ROOT_NODES, true, self.group(Kind::Nodes)),
            (format::ROOT_WAYS, false, self.group(Kind::Ways)),
            (format::ROOT_AREAS, false, self.group(Kind::Areas)),
            (format::ROOT_RELATIONS, false, self.group(Kind::Relations)),
        ];

        // Features referenced from any member list carry the membership
        // flag, which widens their node-leaf entries.
        let member_refs: FxHashSet<(u8, u64)> = self
            .features
            .iter()
            .flat_map(|f| f.members.iter())
            .map(|(kind, id, _)| {
                let bits = match kind {
                    FeatureKind::Node => format::KIND_NODE,
                    FeatureKind::Way => format::KIND_WAY,
                    FeatureKind::Relation => format::KIND_RELATION,
                };
                (bits, *id)
            })
            .collect();

        let mut rec_ofs: FxHashMap<(u8, u64), u32> = FxHashMap::default();
        let mut body_slots: Vec<(usize, usize)> = Vec::new(); // (feature, slot ofs)
        let mut bucket_leaves: Vec<Vec<(u32, Vec<TreeNode>)>> = Vec::new();

        for (_, node_format, indices) in &groups {
            let mut buckets = Vec::new();
            for (bits, members) in partition(&self.features, indices) {
                let mut leaves = Vec::new();
                for chunk in members.chunks(self.leaf_capacity) {
                    leaves.push(self.write_leaf(
                        &mut buf,
                        chunk,
                        *node_format,
                        &tags_ofs,
                        &member_refs,
                        &mut rec_ofs,
                        &mut body_slots,
                    ));
                }
                buckets.push((bits, leaves));
            }
            bucket_leaves.push(buckets);
        }

        // Member tables refer to records by offset, so they come after all
        // leaves are placed; each relation's body slot is patched to point
        // at its table.
        for (i, slot) in body_slots {
            let f = &self.features[i];
            if f.members.is_empty() {
                continue;
            }
            align4(&mut buf);
            let table_ofs = buf.len() as u32;
            buf.put_u16_le(f.members.len() as u16);
            buf.put_u16_le(0);
            for (kind, id, role) in &f.members {
                let kind_bits = match kind {
                    FeatureKind::Node => format::KIND_NODE,
                    FeatureKind::Way => format::KIND_WAY,
                    FeatureKind::Relation => format::KIND_RELATION,
                };
                let member_ofs = rec_ofs.get(&(kind_bits, *id)).copied().unwrap_or(0);
                let role_ofs = strings.intern(&mut buf, role);
                buf.put_u32_le(member_ofs);
                buf.put_u32_le(role_ofs);
            }
            buf[slot..slot + 4].copy_from_slice(&table_ofs.to_le_bytes());
        }

        // Trunk levels and root slots.
        for ((slot, _, _), buckets) in groups.iter().zip(bucket_leaves) {
            let mut roots = Vec::new();
            for (bits, leaves) in buckets {
                if let Some(root) = self.build_trunks(&mut buf, leaves) {
                    roots.push((bits, root));
                }
            }
            let word = match roots.len() {
                0 => 0,
                1 if !self.partitioned(*slot) => {
                    let (_, root) = &roots[0];
                    root.ofs | if root.is_leaf { format::ROOT_IS_LEAF } else { 0 }
                }
                _ => {
                    align4(&mut buf);
                    let list_ofs = buf.len() as u32;
                    let last = roots.len() - 1;
                    for (i, (bits, root)) in roots.iter().enumerate() {
                        let mut tagged = root.ofs;
                        if root.is_leaf {
                            tagged |= format::BUCKET_IS_LEAF;
                        }
                        if i == last {
                            tagged |= format::BUCKET_LAST;
                        }
                        buf.put_u32_le(*bits);
                        buf.put_u32_le(tagged);
                    }
                    list_ofs | format::ROOT_IS_BUCKETS
                }
            };
            buf[*slot..*slot + 4].copy_from_slice(&word.to_le_bytes());
        }

        if buf.len() > format::MAX_TILE_LEN {
            return Err(StoreError::InvalidInput(format!(
                "tile image of {} bytes exceeds the {} byte limit",
                buf.len(),
                format::MAX_TILE_LEN
            )));
        }
        Ok(buf.freeze())
    }

    fn group(&self, kind: Kind) -> Vec<usize> {
        let mut indices: Vec<usize> = (0..self.features.len())
            .filter(|&i| {
                let f = &self.features[i];
                let area = f.extra_flags & format::FLAG_AREA != 0;
                match kind {
                    Kind::Nodes => f.kind == FeatureKind::Node,
                    Kind::Ways => f.kind == FeatureKind::Way && !area,
                    Kind::Areas => area,
                    Kind::Relations => f.kind == FeatureKind::Relation && !area,
                }
            })
            .collect();
        indices.sort_by_key(|&i| {
            let f = &self.features[i];
            (f.bounds.min_x, f.bounds.min_y, f.id)
        });
        indices
    }

    fn partitioned(&self, slot: usize) -> bool {
        let kind = match slot {
            format::ROOT_NODES => Kind::Nodes,
            format::ROOT_WAYS => Kind::Ways,
            format::ROOT_AREAS => Kind::Areas,
            _ => Kind::Relations,
        };
        self.group(kind)
            .iter()
            .any(|&i| self.features[i].category != 0)
    }

    /// Writes a feature's tag table (strings first, then the offset
    /// pairs). Returns 0 for a tagless feature.
    fn write_tag_table(
        buf: &mut BytesMut,
        strings: &mut StringPool,
        tags: &[(String, String)],
    ) -> Result<u32> {
        if tags.is_empty() {
            return Ok(0);
        }
        let mut pairs = Vec::with_capacity(tags.len());
        for (key, value) in tags {
            if key.len() > u16::MAX as usize || value.len() > u16::MAX as usize {
                return Err(StoreError::InvalidInput(format!(
                    "tag string longer than {} bytes",
                    u16::MAX
                )));
            }
            let key_ofs = strings.intern(buf, key);
            let value_ofs = strings.intern(buf, value);
            pairs.push((key_ofs, value_ofs));
        }
        align4(buf);
        let table_ofs = buf.len() as u32;
        buf.put_u16_le(tags.len() as u16);
        buf.put_u16_le(0);
        for (key_ofs, value_ofs) in pairs {
            buf.put_u32_le(key_ofs);
            buf.put_u32_le(value_ofs);
        }
        Ok(table_ofs)
    }

    #[allow(clippy::too_many_arguments)]
    fn write_leaf(
        &self,
        buf: &mut BytesMut,
        chunk: &[usize],
        node_format: bool,
        tags_ofs: &[u32],
        member_refs: &FxHashSet<(u8, u64)>,
        rec_ofs: &mut FxHashMap<(u8, u64), u32>,
        body_slots: &mut Vec<(usize, usize)>,
    ) -> TreeNode {
        align4(buf);
        let leaf_ofs = buf.len() as u32;
        let mut bounds = self.features[chunk[0]].bounds;
        let last = chunk.len() - 1;
        for (n, &i) in chunk.iter().enumerate() {
            let f = &self.features[i];
            bounds = bounds.union(&f.bounds);
            if node_format {
                buf.put_i32_le(f.bounds.min_x);
                buf.put_i32_le(f.bounds.min_y);
            } else {
                buf.put_i32_le(f.bounds.min_x);
                buf.put_i32_le(f.bounds.min_y);
                buf.put_i32_le(f.bounds.max_x);
                buf.put_i32_le(f.bounds.max_y);
            }
            let record = buf.len() as u32;
            rec_ofs.insert((f.kind_bits(), f.id), record);
            let mut flags = f.kind_bits() | f.extra_flags;
            if member_refs.contains(&(f.kind_bits(), f.id)) {
                flags |= format::FLAG_RELATION_MEMBER;
            }
            if n == last {
                flags |= format::FLAG_LAST_ENTRY;
            }
            buf.put_u64_le((f.id << 8) | flags as u64);
            buf.put_u32_le(tags_ofs[i]);
            if !node_format {
                body_slots.push((i, buf.len()));
                buf.put_u32_le(0);
            } else if flags & format::FLAG_RELATION_MEMBER != 0 {
                // Parent-relation list slot; unused by the read path.
                buf.put_u32_le(0);
            }
        }
        TreeNode {
            ofs: leaf_ofs,
            bounds,
            is_leaf: true,
        }
    }

    /// Collapses a level of nodes into trunk levels until one root remains.
    fn build_trunks(&self, buf: &mut BytesMut, mut level: Vec<TreeNode>) -> Option<TreeNode> {
        if level.is_empty() {
            return None;
        }
        while level.len() > 1 {
            let mut next = Vec::new();
            for chunk in level.chunks(self.leaf_capacity) {
                align4(buf);
                let trunk_ofs = buf.len() as u32;
                let mut bounds = chunk[0].bounds;
                let last = chunk.len() - 1;
                for (n, child) in chunk.iter().enumerate() {
                    bounds = bounds.union(&child.bounds);
                    let mut tagged = child.ofs;
                    if child.is_leaf {
                        tagged |= format::CHILD_IS_LEAF;
                    }
                    if n == last {
                        tagged |= format::CHILD_LAST;
                    }
                    buf.put_u32_le(tagged);
                    buf.put_i32_le(child.bounds.min_x);
                    buf.put_i32_le(child.bounds.min_y);
                    buf.put_i32_le(child.bounds.max_x);
                    buf.put_i32_le(child.bounds.max_y);
                }
                next.push(TreeNode {
                    ofs: trunk_ofs,
                    bounds,
                    is_leaf: false,
                });
            }
            level = next;
        }
        level.pop()
    }
}

enum Kind {
    Nodes,
    Ways,
    Areas,
    Relations,
}

/// Groups feature indices by category bits, in first-seen order. An
/// unpartitioned kind collapses into one group.
fn partition(features: &[TileFeature], indices: &[usize]) -> Vec<(u32, Vec<usize>)> {
    let mut groups: Vec<(u32, Vec<usize>)> = Vec::new();
    for &i in indices {
        let bits = features[i].category;
        match groups.iter_mut().find(|(b, _)| *b == bits) {
            Some((_, members)) => members.push(i),
            None => groups.push((bits, vec![i])),
        }
    }
    groups
}

fn align4(buf: &mut BytesMut) {
    while buf.len() % 4 != 0 {
        buf.put_u8(0);
    }
}

/// Deduplicating pool of length-prefixed strings.
#[derive(Default)]
struct StringPool {
    offsets: FxHashMap<String, u32>,
}

impl StringPool {
    fn intern(&mut self, buf: &mut BytesMut, s: &str) -> u32 {
        if let Some(&ofs) = self.offsets.get(s) {
            return ofs;
        }
        let ofs = buf.len() as u32;
        buf.put_u16_le(s.len() as u16);
        buf.put_slice(s.as_bytes());
        self.offsets.insert(s.to_string(), ofs);
        ofs
    }
}

/// Collects built tiles into a store.
pub struct StoreBuilder {
    zoom: u8,
    tiles: Vec<(TileId, Bytes)>,
}

impl StoreBuilder {
    pub fn new(zoom: u8) -> Result<Self> {
        if zoom > MAX_ZOOM {
            return Err(StoreError::InvalidInput(format!(
                "zoom {zoom} exceeds maximum {MAX_ZOOM}"
            )));
        }
        Ok(Self {
            zoom,
            tiles: Vec::new(),
        })
    }

    /// Builds and adds one tile.
    pub fn add_tile(&mut self, tile: TileId, builder: &TileBuilder) -> Result<&mut Self> {
        if tile.zoom() != self.zoom {
            return Err(StoreError::InvalidInput(format!(
                "tile zoom {} does not match store zoom {}",
                tile.zoom(),
                self.zoom
            )));
        }
        let image = builder.build()?;
        self.tiles.push((tile, image));
        Ok(self)
    }

    /// Finishes into an in-memory store.
    pub fn into_memory(self) -> Result<MemoryStore> {
        let mut store = MemoryStore::new(self.zoom)?;
        for (tile, image) in self.tiles {
            store.insert_tile(tile, image);
        }
        Ok(store)
    }

    /// Writes the store out as a mappable file.
    pub fn write_to<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut out = std::io::BufWriter::new(std::fs::File::create(path)?);
        out.write_all(&STORE_MAGIC.to_le_bytes())?;
        out.write_all(&STORE_VERSION.to_le_bytes())?;
        out.write_all(&(self.zoom as u16).to_le_bytes())?;
        out.write_all(&(self.tiles.len() as u32).to_le_bytes())?;

        let mut offset = (STORE_HEADER_LEN + self.tiles.len() * DIR_ENTRY_LEN) as u32;
        for (tile, image) in &self.tiles {
            out.write_all(&tile.raw().to_le_bytes())?;
            out.write_all(&offset.to_le_bytes())?;
            out.write_all(&(image.len() as u32).to_le_bytes())?;
            offset += image.len() as u32;
        }
        for (_, image) in &self.tiles {
            out.write_all(image)?;
        }
        out.flush()?;
        Ok(())
    }
}
