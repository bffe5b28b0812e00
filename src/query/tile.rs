//! Per-tile unit of work.
//!
//! A [`TileTask`] owns everything needed to evaluate the query against one
//! tile: it fetches the page, derives the directional skip flags, forks one
//! R-tree scan per surviving subtree root, and reports the merged result
//! chain back to the driver. A task reports exactly once, on success or
//! failure, so the driver's in-flight accounting never stalls.

use crate::error::{Result, StoreError};
use crate::feature::FeatureFilter;
use crate::format::{
    PTR_MASK, ROOT_AREAS, ROOT_IS_BUCKETS, ROOT_IS_LEAF, ROOT_NODES, ROOT_RELATIONS, ROOT_WAYS,
    read_u32,
};
use crate::matcher::{Matcher, MatcherSet, MemberMatcher};
use crate::query::results::QueryResults;
use crate::query::rtree::{RTreeScan, ScanParams, SubtreeRoot, accepted_buckets};
use crate::storage::TileStorage;
use crate::types::{BoundingBox, Kinds, TileId, Tip};
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// State shared between the driver and every task of one query.
pub(crate) struct QueryCtx {
    pub bbox: BoundingBox,
    pub matchers: MatcherSet,
    pub filter: Option<Arc<dyn FeatureFilter>>,
    /// Cooperative stop flag; set when the query is dropped.
    pub cancel: AtomicBool,
    /// First failure wins; later ones are dropped.
    pub error: Mutex<Option<StoreError>>,
}

impl QueryCtx {
    pub fn new(
        bbox: BoundingBox,
        matchers: MatcherSet,
        filter: Option<Arc<dyn FeatureFilter>>,
    ) -> Self {
        Self {
            bbox,
            matchers,
            filter,
            cancel: AtomicBool::new(false),
            error: Mutex::new(None),
        }
    }

    pub fn record_error(&self, err: StoreError) {
        let mut slot = self.error.lock();
        if slot.is_none() {
            *slot = Some(err);
        }
    }
}

/// The per-kind root slots of the tile header. Node trees use the compact
/// point entry layout; every other kind uses boxed entries.
const KIND_SLOTS: [(Kinds, usize, bool); 4] = [
    (Kinds::NODES, ROOT_NODES, true),
    (Kinds::WAYS, ROOT_WAYS, false),
    (Kinds::AREAS, ROOT_AREAS, false),
    (Kinds::RELATIONS, ROOT_RELATIONS, false),
];

pub(crate) struct TileTask {
    ctx: Arc<QueryCtx>,
    storage: Arc<dyn TileStorage>,
    tile: TileId,
    tip: Tip,
    tx: Sender<QueryResults>,
}

impl TileTask {
    pub fn new(
        ctx: Arc<QueryCtx>,
        storage: Arc<dyn TileStorage>,
        tile: TileId,
        tip: Tip,
        tx: Sender<QueryResults>,
    ) -> Self {
        Self {
            ctx,
            storage,
            tile,
            tip,
            tx,
        }
    }

    /// Runs the task to completion on the current worker thread.
    pub fn run(self) {
        let results = match self.scan() {
            Ok(results) => results,
            Err(err) => {
                log::warn!("tile {:?} failed: {err}", self.tile);
                self.ctx.record_error(err);
                QueryResults::empty()
            }
        };
        // The driver may already be gone; a dead channel is not an error.
        let _ = self.tx.send(results);
    }

    fn scan(&self) -> Result<QueryResults> {
        // Abandoned queries stop scheduled tiles before the page fetch.
        if self.ctx.cancel.load(Ordering::Relaxed) {
            return Ok(QueryResults::empty());
        }
        let page = self.storage.fetch_tile(self.tip)?;
        let tile_bounds = self.tile.bounds();
        // A copy replicated westward/northward is owned by the neighbor
        // whenever the query bbox reaches into that neighbor.
        let skip_west = self.ctx.bbox.min_x < tile_bounds.min_x;
        let skip_north = self.ctx.bbox.max_y > tile_bounds.max_y;

        let buf = page.bytes();
        let mut scans: SmallVec<[(Kinds, Arc<dyn Matcher>, SubtreeRoot); 8]> = SmallVec::new();
        for (kind, slot, node_format) in KIND_SLOTS {
            let Some(matcher) = self.ctx.matchers.matcher_for(kind) else {
                continue;
            };
            // A member constraint narrows the relations matcher only.
            let matcher: Arc<dyn Matcher> = match self.ctx.matchers.members() {
                Some(members) if kind == Kinds::RELATIONS => {
                    Arc::new(MemberMatcher::new(matcher.clone(), members.clone()))
                }
                _ => matcher.clone(),
            };
            let word = read_u32(buf, slot)?;
            if word == 0 {
                continue;
            }
            if word & ROOT_IS_BUCKETS != 0 {
                for root in accepted_buckets(buf, word & PTR_MASK, node_format, matcher.as_ref())? {
                    scans.push((kind, matcher.clone(), root));
                }
            } else {
                scans.push((
                    kind,
                    matcher,
                    SubtreeRoot {
                        ofs: word & PTR_MASK,
                        is_leaf: word & ROOT_IS_LEAF != 0,
                        node_format,
                    },
                ));
            }
        }

        match scans.len() {
            0 => Ok(QueryResults::empty()),
            1 => {
                let (kind, matcher, root) = &scans[0];
                let params = ScanParams {
                    page: &page,
                    bbox: &self.ctx.bbox,
                    kinds: *kind,
                    skip_west,
                    skip_north,
                    matcher: matcher.as_ref(),
                    filter: self.ctx.filter.as_deref(),
                    cancel: &self.ctx.cancel,
                };
                RTreeScan::run(&params, *root)
            }
            _ => {
                // Fork the subtree scans onto the surrounding pool; the
                // scope's work-stealing join keeps this thread busy too.
                let outputs: Mutex<SmallVec<[Result<QueryResults>; 8]>> =
                    Mutex::new(SmallVec::new());
                rayon::scope(|s| {
                    for (kind, matcher, root) in &scans {
                        let outputs = &outputs;
                        let page = &page;
                        let ctx = &self.ctx;
                        s.spawn(move |_| {
                            let params = ScanParams {
                                page,
                                bbox: &ctx.bbox,
                                kinds: *kind,
                                skip_west,
                                skip_north,
                                matcher: matcher.as_ref(),
                                filter: ctx.filter.as_deref(),
                                cancel: &ctx.cancel,
                            };
                            outputs.lock().push(RTreeScan::run(&params, *root));
                        });
                    }
                });
                let mut merged = QueryResults::empty();
                for out in outputs.into_inner() {
                    merged = merged.merge(out?);
                }
                Ok(merged)
            }
        }
    }
}
