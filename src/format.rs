//! Binary layout of a tile image.
//!
//! A tile is a flat byte buffer shared read-only between query tasks. All
//! multi-byte values are little-endian and every pointer is a byte offset
//! from the start of the tile. Offsets that carry tag bits in their low two
//! bits (root slots, trunk children, bucket subtrees) are 4-byte aligned.
//!
//! Layout summary:
//!
//! - Tile header (20 bytes): magic, then one root slot per feature kind
//!   (nodes, ways, areas, relations). A slot of 0 means the tile holds no
//!   features of that kind.
//! - Trunk node: fixed-width entries of a tagged child pointer followed by
//!   the child's bounding box. The entry sequence is self-terminating via
//!   [`CHILD_LAST`]; there is no entry count.
//! - Leaf node: fixed-width feature entries, each a bounding box (or a bare
//!   x/y pair for node features) immediately followed by the feature
//!   record. The last entry carries [`FLAG_LAST_ENTRY`] in its flags byte.
//! - Index bucket list: (category bits, tagged subtree pointer) pairs, used
//!   only for kinds partitioned by tag category.
//!
//! A feature record starts with an `idflags` word: the low byte holds the
//! flags, the remaining 56 bits hold the feature id. The tag table pointer
//! follows at +8.

use crate::error::{Result, StoreError};

/// Magic word at offset 0 of every tile image.
pub const TILE_MAGIC: u32 = u32::from_le_bytes(*b"TQT1");

/// Header offsets of the per-kind R-tree root slots.
pub const ROOT_NODES: usize = 4;
pub const ROOT_WAYS: usize = 8;
pub const ROOT_AREAS: usize = 12;
pub const ROOT_RELATIONS: usize = 16;
/// Total header length; tree nodes start at or after this offset.
pub const TILE_HEADER_LEN: usize = 20;

/// Largest tile image the engine addresses; record offsets must fit the
/// 29 offset bits of a tagged result pointer.
pub const MAX_TILE_LEN: usize = 1 << 29;

/// Root slot tag: the slot points at an index bucket list.
pub const ROOT_IS_BUCKETS: u32 = 1;
/// Root slot tag: the tree root is a leaf node (single-level tree).
pub const ROOT_IS_LEAF: u32 = 2;

/// Trunk child tag: the child is a leaf node.
pub const CHILD_IS_LEAF: u32 = 1;
/// Trunk child tag: this entry is the last in the trunk sequence.
pub const CHILD_LAST: u32 = 2;

/// Bucket tag: the bucket subtree root is a leaf node.
pub const BUCKET_IS_LEAF: u32 = 1;
/// Bucket tag: this is the last bucket in the list.
pub const BUCKET_LAST: u32 = 2;

/// Mask clearing the low tag bits of a tagged pointer.
pub const PTR_MASK: u32 = !3;

/// Trunk entry: tagged child pointer + 4 bbox coordinates.
pub const TRUNK_ENTRY_LEN: usize = 20;
/// Leaf entry for ways, areas, and relations: bbox + 16-byte record.
pub const LEAF_ENTRY_LEN: usize = 32;
/// Leaf entry for nodes: x, y + 12-byte record.
pub const NODE_ENTRY_LEN: usize = 20;
/// Extra field width for node entries flagged as relation members.
pub const NODE_MEMBER_EXTRA: usize = 4;
/// Bucket list entry: category bits + tagged subtree pointer.
pub const BUCKET_ENTRY_LEN: usize = 8;

// Feature flags byte (low byte of the idflags word).
pub const KIND_MASK: u8 = 0x03;
pub const KIND_NODE: u8 = 0;
pub const KIND_WAY: u8 = 1;
pub const KIND_RELATION: u8 = 2;
pub const FLAG_AREA: u8 = 1 << 2;
pub const FLAG_RELATION_MEMBER: u8 = 1 << 3;
pub const FLAG_WAY_NODE: u8 = 1 << 4;
/// Feature is replicated into the tile immediately to the west.
pub const FLAG_MULTI_WEST: u8 = 1 << 5;
/// Feature is replicated into the tile immediately to the north.
pub const FLAG_MULTI_NORTH: u8 = 1 << 6;
/// Leaf terminator: this entry is the last one in its leaf.
pub const FLAG_LAST_ENTRY: u8 = 1 << 7;

fn truncated(what: &str, ofs: usize) -> StoreError {
    StoreError::Corrupt(format!("truncated read of {what} at offset {ofs}"))
}

#[inline]
pub fn read_u16(buf: &[u8], ofs: usize) -> Result<u16> {
    let bytes = buf.get(ofs..ofs + 2).ok_or_else(|| truncated("u16", ofs))?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_u32(buf: &[u8], ofs: usize) -> Result<u32> {
    let bytes = buf.get(ofs..ofs + 4).ok_or_else(|| truncated("u32", ofs))?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_i32(buf: &[u8], ofs: usize) -> Result<i32> {
    Ok(read_u32(buf, ofs)? as i32)
}

#[inline]
pub fn read_u64(buf: &[u8], ofs: usize) -> Result<u64> {
    let bytes = buf.get(ofs..ofs + 8).ok_or_else(|| truncated("u64", ofs))?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(bytes);
    Ok(u64::from_le_bytes(raw))
}

/// Reads a length-prefixed UTF-8 string (u16 length + bytes).
pub fn read_str(buf: &[u8], ofs: usize) -> Result<&str> {
    let len = read_u16(buf, ofs)? as usize;
    let start = ofs + 2;
    let bytes = buf
        .get(start..start + len)
        .ok_or_else(|| truncated("string", ofs))?;
    std::str::from_utf8(bytes)
        .map_err(|_| StoreError::Corrupt(format!("invalid UTF-8 string at offset {ofs}")))
}

/// Identity key used for cross-tile deduplication.
///
/// Derived from the raw `idflags` word as an opaque mask: the feature id
/// shifted over the two kind bits. Area/membership/way-node flags never
/// participate, so both physical copies of a replicated feature map to the
/// same key.
#[inline]
pub fn identity_key(idflags: u64) -> u64 {
    ((idflags >> 8) << 2) | (idflags & KIND_MASK as u64)
}

/// Iterator over the raw tag table of a feature record.
///
/// The table is `count` (u16), 2 bytes padding, then `count` pairs of
/// absolute string offsets. Yields borrowed key/value string slices.
pub struct RawTags<'a> {
    buf: &'a [u8],
    pos: usize,
    remaining: usize,
}

impl<'a> RawTags<'a> {
    /// Opens the tag table at `tags_ofs`. An offset of 0 means "no tags".
    pub fn new(buf: &'a [u8], tags_ofs: u32) -> Result<Self> {
        if tags_ofs == 0 {
            return Ok(Self {
                buf,
                pos: 0,
                remaining: 0,
            });
        }
        let ofs = tags_ofs as usize;
        let count = read_u16(buf, ofs)? as usize;
        Ok(Self {
            buf,
            pos: ofs + 4,
            remaining: count,
        })
    }
}

impl<'a> Iterator for RawTags<'a> {
    type Item = Result<(&'a str, &'a str)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let entry = (|| {
            let key_ofs = read_u32(self.buf, self.pos)?;
            let val_ofs = read_u32(self.buf, self.pos + 4)?;
            self.pos += 8;
            let key = read_str(self.buf, key_ofs as usize)?;
            let value = read_str(self.buf, val_ofs as usize)?;
            Ok((key, value))
        })();
        if entry.is_err() {
            self.remaining = 0;
        }
        Some(entry)
    }
}

/// Looks up a single tag value on the record at `rec_ofs`.
pub fn tag_value<'a>(buf: &'a [u8], rec_ofs: usize, key: &str) -> Result<Option<&'a str>> {
    let tags_ofs = read_u32(buf, rec_ofs + 8)?;
    for tag in RawTags::new(buf, tags_ofs)? {
        let (k, v) = tag?;
        if k == key {
            return Ok(Some(v));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_primitives() {
        let buf = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
        assert_eq!(read_u16(&buf, 0).unwrap(), 0x0201);
        assert_eq!(read_u32(&buf, 0).unwrap(), 0x04030201);
        assert_eq!(read_u64(&buf, 0).unwrap(), 0x0807060504030201);
        assert!(read_u32(&buf, 6).is_err());
    }

    #[test]
    fn test_read_str() {
        let mut buf = vec![3u8, 0];
        buf.extend_from_slice(b"abc");
        assert_eq!(read_str(&buf, 0).unwrap(), "abc");

        // Length running past the end must be a corrupt-data error.
        let short = [5u8, 0, b'a'];
        assert!(matches!(read_str(&short, 0), Err(StoreError::Corrupt(_))));
    }

    #[test]
    fn test_identity_key_ignores_auxiliary_flags() {
        let id = 12_345u64;
        let plain = (id << 8) | KIND_WAY as u64;
        let flagged = (id << 8)
            | (KIND_WAY | FLAG_AREA | FLAG_RELATION_MEMBER | FLAG_MULTI_WEST | FLAG_MULTI_NORTH)
                as u64;
        assert_eq!(identity_key(plain), identity_key(flagged));

        let other_kind = (id << 8) | KIND_RELATION as u64;
        assert_ne!(identity_key(plain), identity_key(other_kind));
    }

    #[test]
    fn test_raw_tags_empty() {
        let buf = [0u8; 4];
        let mut tags = RawTags::new(&buf, 0).unwrap();
        assert!(tags.next().is_none());
    }
}
