//! Batched accumulation of matched feature references.
//!
//! Every R-tree scan appends into its own [`QueryResults`] chain; a tile
//! task splices its children's chains together in O(1) and hands the
//! merged chain to the driver, which drains it exactly once.

use crate::storage::TilePage;
use std::collections::LinkedList;

/// Entries per bucket before the chain rolls over to a fresh one.
pub(crate) const BUCKET_CAPACITY: usize = 256;

// Tagged feature pointer: record offset << 3, one potential-duplicate bit,
// two kind bits.
const PTR_DUP: u32 = 1 << 2;
const PTR_KIND_MASK: u32 = 0x3;

/// Packs a feature reference into a tagged pointer.
#[inline]
pub(crate) fn pack_ptr(rec_ofs: u32, flags: u8, potential_dup: bool) -> u32 {
    debug_assert!(rec_ofs < (1 << 29));
    (rec_ofs << 3)
        | (if potential_dup { PTR_DUP } else { 0 })
        | (flags as u32 & PTR_KIND_MASK)
}

/// Record offset of a tagged pointer.
#[inline]
pub(crate) fn ptr_offset(ptr: u32) -> u32 {
    ptr >> 3
}

/// Whether the pointer needs identity reconciliation at the driver.
#[inline]
pub(crate) fn ptr_is_dup(ptr: u32) -> bool {
    ptr & PTR_DUP != 0
}

/// Append-only chain of fixed-capacity pointer buckets, bound to the tile
/// page the pointers refer into.
///
/// `add` is O(1); `merge` splices the second chain's bucket list onto the
/// first's tail without copying. The chain is consumed once via
/// [`QueryResults::drain`].
pub struct QueryResults {
    page: Option<TilePage>,
    buckets: LinkedList<Vec<u32>>,
    len: usize,
}

impl QueryResults {
    /// An empty chain bound to a tile page.
    pub fn new(page: TilePage) -> Self {
        Self {
            page: Some(page),
            buckets: LinkedList::new(),
            len: 0,
        }
    }

    /// An empty chain with no page; placeholder reported by failed tasks.
    pub fn empty() -> Self {
        Self {
            page: None,
            buckets: LinkedList::new(),
            len: 0,
        }
    }

    /// Appends a tagged pointer, rolling over to a new bucket when the
    /// current one is full.
    pub fn add(&mut self, ptr: u32) {
        match self.buckets.back_mut() {
            Some(bucket) if bucket.len() < BUCKET_CAPACITY => bucket.push(ptr),
            _ => {
                let mut bucket = Vec::with_capacity(BUCKET_CAPACITY);
                bucket.push(ptr);
                self.buckets.push_back(bucket);
            }
        }
        self.len += 1;
    }

    /// Splices `other` onto the tail of `self`. If either operand is
    /// empty, the other is returned unchanged.
    pub fn merge(mut self, mut other: QueryResults) -> QueryResults {
        if other.len == 0 {
            return self;
        }
        if self.len == 0 {
            return other;
        }
        self.buckets.append(&mut other.buckets);
        self.len += other.len;
        self
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Consumes the chain into a flat pointer iterator plus its page.
    pub(crate) fn drain(self) -> Drain {
        Drain {
            page: self.page,
            buckets: self.buckets.into_iter(),
            current: Vec::new().into_iter(),
        }
    }
}

/// Draining iterator over a consumed chain.
pub(crate) struct Drain {
    page: Option<TilePage>,
    buckets: std::collections::linked_list::IntoIter<Vec<u32>>,
    current: std::vec::IntoIter<u32>,
}

impl Drain {
    /// The page every pointer in this chain refers into. `None` only for
    /// chains that never held an entry.
    pub fn page(&self) -> Option<&TilePage> {
        self.page.as_ref()
    }
}

impl Iterator for Drain {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        loop {
            if let Some(ptr) = self.current.next() {
                return Some(ptr);
            }
            self.current = self.buckets.next()?.into_iter();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::TILE_MAGIC;
    use bytes::{Bytes, BytesMut};
    use std::sync::Arc;

    fn dummy_page() -> TilePage {
        let mut buf = BytesMut::zeroed(20);
        buf[0..4].copy_from_slice(&TILE_MAGIC.to_le_bytes());
        let data: Arc<Bytes> = Arc::new(buf.freeze());
        TilePage::new(data, 0, 20)
    }

    fn chain_of(values: impl IntoIterator<Item = u32>) -> QueryResults {
        let mut chain = QueryResults::new(dummy_page());
        for v in values {
            chain.add(v);
        }
        chain
    }

    #[test]
    fn test_pack_unpack() {
        let ptr = pack_ptr(1234, 0b10, true);
        assert_eq!(ptr_offset(ptr), 1234);
        assert!(ptr_is_dup(ptr));
        assert_eq!(ptr & PTR_KIND_MASK, 0b10);

        let ptr = pack_ptr(0, 0b01, false);
        assert!(!ptr_is_dup(ptr));
    }

    #[test]
    fn test_add_rolls_over_buckets() {
        let n = BUCKET_CAPACITY * 2 + 10;
        let chain = chain_of(0..n as u32);
        assert_eq!(chain.len(), n);
        assert_eq!(chain.buckets.len(), 3);
        let drained: Vec<_> = chain.drain().collect();
        assert_eq!(drained, (0..n as u32).collect::<Vec<_>>());
    }

    #[test]
    fn test_merge_preserves_order_and_is_associative() {
        let a: Vec<u32> = (0..300).collect();
        let b: Vec<u32> = (300..350).collect();
        let c: Vec<u32> = (350..700).collect();
        let expected: Vec<u32> = (0..700).collect();

        let left = chain_of(a.clone())
            .merge(chain_of(b.clone()))
            .merge(chain_of(c.clone()));
        assert_eq!(left.drain().collect::<Vec<_>>(), expected);

        let right = chain_of(a).merge(chain_of(b).merge(chain_of(c)));
        assert_eq!(right.drain().collect::<Vec<_>>(), expected);
    }

    #[test]
    fn test_merge_with_empty_operands() {
        let chain = chain_of([1, 2, 3]);
        let merged = chain.merge(QueryResults::empty());
        assert_eq!(merged.len(), 3);

        let merged = QueryResults::empty().merge(chain_of([4, 5]));
        assert_eq!(merged.len(), 2);
        assert!(merged.page.is_some());

        let empty = QueryResults::empty().merge(QueryResults::empty());
        assert!(empty.is_empty());
    }

    #[test]
    fn test_appends_after_merge_land_at_tail() {
        let mut merged = chain_of([1, 2]).merge(chain_of([3]));
        merged.add(4);
        assert_eq!(merged.drain().collect::<Vec<_>>(), vec![1, 2, 3, 4]);
    }
}
