//! The query driver.
//!
//! A [`Query`] walks the tile grid covered by its bounding box, keeps a
//! bounded window of tile tasks in flight on the worker pool, and streams
//! matched features back through an iterator. Result order follows tile
//! completion order and is not deterministic across runs.
//!
//! Failures inside tasks are recorded in a shared slot (first one wins) and
//! surfaced as a single `Err` item on the next iterator call; after that
//! the query is dead. Dropping a query mid-stream flips a cancel flag that
//! running scans poll cooperatively.

pub(crate) mod results;
mod rtree;
mod tile;

pub use results::QueryResults;

use crate::error::{Result, StoreError};
use crate::feature::{Feature, FeatureFilter};
use crate::matcher::MatcherSet;
use crate::query::results::{Drain, ptr_is_dup, ptr_offset};
use crate::query::tile::{QueryCtx, TileTask};
use crate::storage::TileStorage;
use crate::tile::TileWalker;
use crate::types::{BoundingBox, Config};
use crossbeam_channel::{Receiver, Sender};
use rustc_hash::FxHashSet;
use std::sync::Arc;
use std::sync::atomic::Ordering;

#[derive(Debug, PartialEq, Eq)]
enum State {
    Running,
    Exhausted,
    Failed,
}

/// A streaming spatial query over one feature store.
///
/// Obtained from [`crate::FeatureStore::find`]; iterate it to receive
/// matched [`Feature`]s.
pub struct Query {
    ctx: Arc<QueryCtx>,
    storage: Arc<dyn TileStorage>,
    pool: Arc<rayon::ThreadPool>,
    walker: TileWalker,
    max_pending: usize,
    pending: usize,
    tx: Sender<QueryResults>,
    rx: Receiver<QueryResults>,
    current: Option<Drain>,
    /// Identity keys of already-yielded potential duplicates. Allocated
    /// only once the first flagged feature shows up.
    seen: Option<FxHashSet<u64>>,
    state: State,
}

impl Query {
    pub(crate) fn new(
        storage: Arc<dyn TileStorage>,
        pool: Arc<rayon::ThreadPool>,
        config: &Config,
        bbox: BoundingBox,
        matchers: MatcherSet,
        filter: Option<Arc<dyn FeatureFilter>>,
    ) -> Query {
        let state = if matchers.kinds().is_empty() || !bbox.is_valid() {
            State::Exhausted
        } else {
            State::Running
        };
        let walker = TileWalker::new(&bbox, storage.zoom());
        let max_pending = config.max_pending_tiles.max(1);
        // Sized to the pipeline window so completion reports never block.
        let (tx, rx) = crossbeam_channel::bounded(max_pending);
        Query {
            ctx: Arc::new(QueryCtx::new(bbox, matchers, filter)),
            storage,
            pool,
            walker,
            max_pending,
            pending: 0,
            tx,
            rx,
            current: None,
            seen: None,
            state,
        }
    }

    /// The bounding box this query was issued with.
    pub fn bounds(&self) -> BoundingBox {
        self.ctx.bbox
    }

    /// Submits the next stored tile from the walker, skipping grid cells
    /// the store holds no tile for. Returns false once the walk is done.
    fn submit_next_tile(&mut self) -> bool {
        for tile in self.walker.by_ref() {
            let Some(tip) = self.storage.tip_of(tile) else {
                continue;
            };
            log::debug!("scheduling tile {tile:?}");
            let task = TileTask::new(
                self.ctx.clone(),
                self.storage.clone(),
                tile,
                tip,
                self.tx.clone(),
            );
            self.pool.spawn(move || task.run());
            self.pending += 1;
            return true;
        }
        false
    }

    fn fail(&mut self, err: StoreError) -> Option<Result<Feature>> {
        self.state = State::Failed;
        self.ctx.cancel.store(true, Ordering::Relaxed);
        Some(Err(err))
    }

    /// Whether a flagged feature pointer has been yielded before.
    fn already_seen(&mut self, feature: &Feature) -> bool {
        !self
            .seen
            .get_or_insert_with(FxHashSet::default)
            .insert(feature.identity_key())
    }
}

impl Iterator for Query {
    type Item = Result<Feature>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.state != State::Running {
                return None;
            }
            // The guard must drop before fail() borrows self mutably.
            let err = self.ctx.error.lock().take();
            if let Some(err) = err {
                return self.fail(err);
            }

            if let Some(drain) = &mut self.current {
                if let Some(ptr) = drain.next() {
                    // A drained chain always carries its page.
                    let Some(page) = drain.page().cloned() else {
                        return self.fail(StoreError::Other(
                            "result chain lost its tile page".into(),
                        ));
                    };
                    let feature = Feature::new(page, ptr_offset(ptr));
                    if ptr_is_dup(ptr) && self.already_seen(&feature) {
                        continue;
                    }
                    return Some(Ok(feature));
                }
                self.current = None;
            }

            while self.pending < self.max_pending && self.submit_next_tile() {}
            if self.pending == 0 {
                self.state = State::Exhausted;
                return None;
            }

            match self.rx.recv() {
                Ok(chain) => {
                    self.pending -= 1;
                    if !chain.is_empty() {
                        self.current = Some(chain.drain());
                    }
                }
                // Unreachable while we hold our own sender; treated as an
                // internal invariant break rather than a panic.
                Err(_) => {
                    return self.fail(StoreError::Other(
                        "tile task channel disconnected".into(),
                    ));
                }
            }
        }
    }
}

impl Drop for Query {
    fn drop(&mut self) {
        // In-flight scans poll this at trunk boundaries and bail out.
        self.ctx.cancel.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format;
    use crate::storage::MemoryStore;
    use crate::types::{Kinds, TileId};
    use bytes::{BufMut, BytesMut};

    fn test_pool() -> Arc<rayon::ThreadPool> {
        Arc::new(
            rayon::ThreadPoolBuilder::new()
                .num_threads(2)
                .build()
                .unwrap(),
        )
    }

    fn one_way_tile(id: u64) -> bytes::Bytes {
        let mut buf = BytesMut::zeroed(format::TILE_HEADER_LEN);
        buf[0..4].copy_from_slice(&format::TILE_MAGIC.to_le_bytes());
        let leaf_ofs = buf.len() as u32;
        buf.put_i32_le(100);
        buf.put_i32_le(100);
        buf.put_i32_le(200);
        buf.put_i32_le(200);
        buf.put_u64_le((id << 8) | (format::KIND_WAY | format::FLAG_LAST_ENTRY) as u64);
        buf.put_u32_le(0);
        buf.put_u32_le(0);
        buf[format::ROOT_WAYS..format::ROOT_WAYS + 4]
            .copy_from_slice(&(leaf_ofs | format::ROOT_IS_LEAF).to_le_bytes());
        buf.freeze()
    }

    fn single_tile_query(matchers: MatcherSet) -> Query {
        let mut store = MemoryStore::new(0).unwrap();
        store.insert_tile(TileId::new(0, 0, 0), one_way_tile(7));
        Query::new(
            Arc::new(store),
            test_pool(),
            &Config::default(),
            BoundingBox::new(0, 0, 300, 300),
            matchers,
            None,
        )
    }

    #[test]
    fn test_streams_matches() {
        let features: Vec<_> = single_tile_query(MatcherSet::any(Kinds::ALL))
            .map(|f| f.unwrap())
            .collect();
        assert_eq!(features.len(), 1);
        assert_eq!(features[0].id(), 7);
    }

    #[test]
    fn test_empty_matcher_set_yields_nothing() {
        assert_eq!(single_tile_query(MatcherSet::default()).count(), 0);
    }

    #[test]
    fn test_invalid_bbox_yields_nothing() {
        let mut store = MemoryStore::new(0).unwrap();
        store.insert_tile(TileId::new(0, 0, 0), one_way_tile(7));
        let query = Query::new(
            Arc::new(store),
            test_pool(),
            &Config::default(),
            BoundingBox::new(10, 0, -10, 0),
            MatcherSet::any(Kinds::ALL),
            None,
        );
        assert_eq!(query.count(), 0);
    }

    #[test]
    fn test_failure_surfaces_once_then_ends() {
        // Root slot pointing past the end of the tile image.
        let mut buf = BytesMut::zeroed(format::TILE_HEADER_LEN);
        buf[0..4].copy_from_slice(&format::TILE_MAGIC.to_le_bytes());
        buf[format::ROOT_WAYS..format::ROOT_WAYS + 4]
            .copy_from_slice(&(4096u32 | format::ROOT_IS_LEAF).to_le_bytes());

        let mut store = MemoryStore::new(0).unwrap();
        store.insert_tile(TileId::new(0, 0, 0), buf.freeze());
        let mut query = Query::new(
            Arc::new(store),
            test_pool(),
            &Config::default(),
            BoundingBox::new(0, 0, 300, 300),
            MatcherSet::any(Kinds::ALL),
            None,
        );

        assert!(matches!(query.next(), Some(Err(StoreError::Corrupt(_)))));
        assert!(query.next().is_none());
    }

    #[test]
    fn test_feature_outlives_query() {
        let feature = single_tile_query(MatcherSet::any(Kinds::ALL))
            .next()
            .unwrap()
            .unwrap();
        // The query is gone; the feature still reads its page.
        assert_eq!(feature.id(), 7);
        assert_eq!(feature.bounds().unwrap(), BoundingBox::new(100, 100, 200, 200));
    }
}
