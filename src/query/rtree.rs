//! Recursive scan of one packed R-tree against a query bounding box.
//!
//! Trunk nodes are pruned with closed-interval overlap tests; leaf entries
//! go through the full acceptance chain: kind bit, directional multi-tile
//! rule, bounding box, matcher, optional filter. Accepted features are
//! appended to a private [`QueryResults`] chain.

use crate::error::{Result, StoreError};
use crate::feature::{Feature, FeatureFilter};
use crate::format::{
    BUCKET_ENTRY_LEN, BUCKET_IS_LEAF, BUCKET_LAST, CHILD_IS_LEAF, CHILD_LAST, FLAG_LAST_ENTRY,
    FLAG_MULTI_NORTH, FLAG_MULTI_WEST, FLAG_RELATION_MEMBER, LEAF_ENTRY_LEN, NODE_ENTRY_LEN,
    NODE_MEMBER_EXTRA, PTR_MASK, TRUNK_ENTRY_LEN, read_i32, read_u32, read_u64,
};
use crate::matcher::Matcher;
use crate::query::results::{QueryResults, pack_ptr};
use crate::storage::TilePage;
use crate::types::{BoundingBox, Kinds};
use smallvec::SmallVec;
use std::sync::atomic::{AtomicBool, Ordering};

/// Trunk recursion bound; a deeper tree means a pointer cycle or garbage.
const MAX_TREE_DEPTH: usize = 32;

/// Shared inputs of one R-tree scan, borrowed from the owning tile task.
pub(crate) struct ScanParams<'a> {
    pub page: &'a TilePage,
    pub bbox: &'a BoundingBox,
    pub kinds: Kinds,
    /// Query bbox extends west of this tile; skip west-replicated features.
    pub skip_west: bool,
    /// Query bbox extends north of this tile; skip north-replicated ones.
    pub skip_north: bool,
    pub matcher: &'a dyn Matcher,
    pub filter: Option<&'a dyn FeatureFilter>,
    pub cancel: &'a AtomicBool,
}

/// A subtree root extracted from a root slot or an index bucket list.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SubtreeRoot {
    pub ofs: u32,
    pub is_leaf: bool,
    /// Entries use the compact node (point) layout.
    pub node_format: bool,
}

/// Walks an index bucket list, returning the subtree roots whose category
/// bits pass the matcher's index test. Rejected buckets are never read
/// past their list entry.
pub(crate) fn accepted_buckets(
    buf: &[u8],
    list_ofs: u32,
    node_format: bool,
    matcher: &dyn Matcher,
) -> Result<SmallVec<[SubtreeRoot; 4]>> {
    let mut roots = SmallVec::new();
    let mut pos = list_ofs as usize;
    loop {
        let bits = read_u32(buf, pos)?;
        let tagged = read_u32(buf, pos + 4)?;
        if matcher.accept_index(bits) {
            roots.push(SubtreeRoot {
                ofs: tagged & PTR_MASK,
                is_leaf: tagged & BUCKET_IS_LEAF != 0,
                node_format,
            });
        }
        if tagged & BUCKET_LAST != 0 {
            return Ok(roots);
        }
        pos += BUCKET_ENTRY_LEN;
    }
}

/// One recursive R-tree scan producing a private result chain.
pub(crate) struct RTreeScan<'a> {
    params: &'a ScanParams<'a>,
    results: QueryResults,
}

impl<'a> RTreeScan<'a> {
    pub fn run(params: &'a ScanParams<'a>, root: SubtreeRoot) -> Result<QueryResults> {
        let mut scan = RTreeScan {
            params,
            results: QueryResults::new(params.page.clone()),
        };
        if root.is_leaf {
            scan.scan_leaf(root.ofs as usize, root.node_format)?;
        } else {
            scan.scan_trunk(root.ofs as usize, root.node_format, 0)?;
        }
        Ok(scan.results)
    }

    fn scan_trunk(&mut self, ofs: usize, node_format: bool, depth: usize) -> Result<()> {
        if depth >= MAX_TREE_DEPTH {
            return Err(StoreError::Corrupt(format!(
                "R-tree deeper than {MAX_TREE_DEPTH} levels at offset {ofs}"
            )));
        }
        // Cancellation is checked once per trunk node so an abandoned
        // query stops without finishing every scheduled subtree.
        if self.params.cancel.load(Ordering::Relaxed) {
            return Ok(());
        }
        let buf = self.params.page.bytes();
        let bbox = self.params.bbox;
        let mut pos = ofs;
        loop {
            let tagged = read_u32(buf, pos)?;
            let min_x = read_i32(buf, pos + 4)?;
            let min_y = read_i32(buf, pos + 8)?;
            let max_x = read_i32(buf, pos + 12)?;
            let max_y = read_i32(buf, pos + 16)?;

            let overlaps = !(min_x > bbox.max_x
                || min_y > bbox.max_y
                || max_x < bbox.min_x
                || max_y < bbox.min_y);
            if overlaps {
                let child = (tagged & PTR_MASK) as usize;
                if tagged & CHILD_IS_LEAF != 0 {
                    self.scan_leaf(child, node_format)?;
                } else {
                    self.scan_trunk(child, node_format, depth + 1)?;
                }
            }
            if tagged & CHILD_LAST != 0 {
                return Ok(());
            }
            pos += TRUNK_ENTRY_LEN;
        }
    }

    fn scan_leaf(&mut self, ofs: usize, node_format: bool) -> Result<()> {
        if node_format {
            self.scan_node_leaf(ofs)
        } else {
            self.scan_boxed_leaf(ofs)
        }
    }

    /// Leaf scan for ways, areas, and relations: bbox-rect entries.
    fn scan_boxed_leaf(&mut self, ofs: usize) -> Result<()> {
        let buf = self.params.page.bytes();
        let bbox = self.params.bbox;
        let mut pos = ofs;
        loop {
            let rec_ofs = pos + 16;
            let idflags = read_u64(buf, rec_ofs)?;
            let flags = idflags as u8;

            'entry: {
                if !self.params.kinds.accepts_flags(flags & !FLAG_LAST_ENTRY) {
                    break 'entry;
                }
                let Some(dup) = self.multi_tile_verdict(flags) else {
                    break 'entry;
                };
                let min_x = read_i32(buf, pos)?;
                let min_y = read_i32(buf, pos + 4)?;
                let max_x = read_i32(buf, pos + 8)?;
                let max_y = read_i32(buf, pos + 12)?;
                if min_x > bbox.max_x
                    || min_y > bbox.max_y
                    || max_x < bbox.min_x
                    || max_y < bbox.min_y
                {
                    break 'entry;
                }
                self.test_and_collect(rec_ofs, flags, dup)?;
            }

            if flags & FLAG_LAST_ENTRY != 0 {
                return Ok(());
            }
            pos += LEAF_ENTRY_LEN;
        }
    }

    /// Leaf scan for nodes: bare x/y entries, with an extra field when the
    /// node is a relation member.
    fn scan_node_leaf(&mut self, ofs: usize) -> Result<()> {
        let buf = self.params.page.bytes();
        let bbox = self.params.bbox;
        let mut pos = ofs;
        loop {
            let rec_ofs = pos + 8;
            let idflags = read_u64(buf, rec_ofs)?;
            let flags = idflags as u8;

            'entry: {
                if !self.params.kinds.accepts_flags(flags & !FLAG_LAST_ENTRY) {
                    break 'entry;
                }
                let Some(dup) = self.multi_tile_verdict(flags) else {
                    break 'entry;
                };
                let x = read_i32(buf, pos)?;
                let y = read_i32(buf, pos + 4)?;
                if !bbox.contains_point(x, y) {
                    break 'entry;
                }
                self.test_and_collect(rec_ofs, flags, dup)?;
            }

            if flags & FLAG_LAST_ENTRY != 0 {
                return Ok(());
            }
            pos += NODE_ENTRY_LEN;
            if flags & FLAG_RELATION_MEMBER != 0 {
                pos += NODE_MEMBER_EXTRA;
            }
        }
    }

    /// Applies the directional multi-tile rule. `None` means "skip this
    /// copy"; `Some(dup)` carries whether the driver must deduplicate.
    ///
    /// A copy replicated in one direction is skipped when the query bbox
    /// also covers the neighbor in that direction (the neighbor's scan
    /// reports it). With both bits set, no single tile can claim ownership
    /// locally, so the copy is kept and flagged for identity
    /// reconciliation.
    #[inline]
    fn multi_tile_verdict(&self, flags: u8) -> Option<bool> {
        let west = flags & FLAG_MULTI_WEST != 0;
        let north = flags & FLAG_MULTI_NORTH != 0;
        if west && north {
            return Some(true);
        }
        if (west && self.params.skip_west) || (north && self.params.skip_north) {
            return None;
        }
        Some(false)
    }

    fn test_and_collect(&mut self, rec_ofs: usize, flags: u8, dup: bool) -> Result<()> {
        let buf = self.params.page.bytes();
        if !self.params.matcher.accept(buf, rec_ofs)? {
            return Ok(());
        }
        if let Some(filter) = self.params.filter {
            let feature = Feature::new(self.params.page.clone(), rec_ofs as u32);
            if !filter.test(&feature)? {
                return Ok(());
            }
        }
        self.results.add(pack_ptr(rec_ofs as u32, flags, dup));
        Ok(())
    }
}
