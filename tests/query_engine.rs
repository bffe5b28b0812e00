//! End-to-end query engine tests over builder-produced stores.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tilequery::{
    BoundingBox, Config, ExprMatcher, FeatureKind, FeatureStore, Kinds, Matcher, MatcherSet,
    MemoryStore, Result, StoreBuilder, StoreError, TagExpr, TileBuilder, TileFeature, TileId,
    TilePage, TileStorage, Tip,
};

fn store_of(zoom: u8, tiles: Vec<(TileId, TileBuilder)>) -> FeatureStore {
    let mut builder = StoreBuilder::new(zoom).unwrap();
    for (tile, tb) in &tiles {
        builder.add_tile(*tile, tb).unwrap();
    }
    FeatureStore::memory(builder.into_memory().unwrap()).unwrap()
}

fn ids(store: &FeatureStore, bbox: BoundingBox, matchers: MatcherSet) -> Vec<u64> {
    let mut ids: Vec<u64> = store.find(bbox, matchers).map(|f| f.unwrap().id()).collect();
    ids.sort_unstable();
    ids
}

#[test]
fn test_trunk_and_two_leaves_with_failing_matcher() {
    // Five ways at leaf capacity 3: two leaves under one trunk. One way
    // fails the predicate, so exactly four come back, no duplicates.
    let mut tile = TileBuilder::new().with_leaf_capacity(3);
    for i in 1..=5u64 {
        let x = i as i32 * 100;
        let mut f = TileFeature::way(i, BoundingBox::new(x, 0, x + 50, 50));
        if i != 3 {
            f = f.with_tag("name", format!("way-{i}"));
        }
        tile.add(f);
    }
    let store = store_of(0, vec![(TileId::new(0, 0, 0), tile)]);

    let matchers = MatcherSet::with_matcher(
        Kinds::ALL,
        Arc::new(ExprMatcher::new(TagExpr::has("name"))),
    );
    let found = ids(&store, BoundingBox::world(), matchers);
    assert_eq!(found, vec![1, 2, 4, 5]);
}

#[test]
fn test_multi_west_duplicate_yields_once() {
    // One way straddling the zoom-1 column boundary: the eastern tile's
    // copy carries the west flag, the western tile's copy is plain.
    let bounds = BoundingBox::new(-50, -100, 50, -10);
    let mut east = TileBuilder::new();
    east.add(TileFeature::way(42, bounds).multi_west());
    let mut west = TileBuilder::new();
    west.add(TileFeature::way(42, bounds));
    let store = store_of(
        1,
        vec![(TileId::new(1, 1, 0), east), (TileId::new(1, 0, 0), west)],
    );

    // Spanning both tiles: the flagged eastern copy is skipped.
    let both = BoundingBox::new(-100, -100, 100, -10);
    assert_eq!(ids(&store, both, MatcherSet::any(Kinds::ALL)), vec![42]);

    // Each tile alone still reports the feature.
    let east_only = BoundingBox::new(0, -100, 100, -10);
    assert_eq!(ids(&store, east_only, MatcherSet::any(Kinds::ALL)), vec![42]);
    let west_only = BoundingBox::new(-100, -100, -1, -10);
    assert_eq!(ids(&store, west_only, MatcherSet::any(Kinds::ALL)), vec![42]);
}

#[test]
fn test_both_direction_flags_reconciled_by_identity() {
    // A way spanning a 2x2 tile block; every copy carries both flags, so
    // no copy can be skipped directionally and the driver's identity set
    // collapses them.
    let bounds = BoundingBox::new(-50, -50, 50, 50);
    let mut tiles = Vec::new();
    for col in 0..2 {
        for row in 0..2 {
            let mut tb = TileBuilder::new();
            tb.add(TileFeature::way(7, bounds).multi_west().multi_north());
            tiles.push((TileId::new(1, col, row), tb));
        }
    }
    let store = store_of(1, tiles);

    // All four tiles scanned: still exactly one yield.
    let all = BoundingBox::new(-200, -200, 200, 200);
    assert_eq!(ids(&store, all, MatcherSet::any(Kinds::ALL)), vec![7]);

    // A single tile containing one copy also yields exactly once.
    let one = BoundingBox::new(10, 10, 40, 40);
    assert_eq!(ids(&store, one, MatcherSet::any(Kinds::ALL)), vec![7]);
}

#[test]
fn test_kind_mask_excludes_matching_features() {
    let mut tile = TileBuilder::new();
    tile.add(TileFeature::node(1, 5, 5))
        .add(TileFeature::way(2, BoundingBox::new(0, 0, 10, 10)))
        .add(TileFeature::area_way(3, BoundingBox::new(0, 0, 10, 10)))
        .add(TileFeature::relation(4, BoundingBox::new(0, 0, 10, 10)));
    let store = store_of(0, vec![(TileId::new(0, 0, 0), tile)]);
    let bbox = BoundingBox::new(0, 0, 20, 20);

    assert_eq!(ids(&store, bbox, MatcherSet::any(Kinds::WAYS)), vec![2]);
    assert_eq!(ids(&store, bbox, MatcherSet::any(Kinds::AREAS)), vec![3]);
    assert_eq!(
        ids(&store, bbox, MatcherSet::any(Kinds::NODES | Kinds::RELATIONS)),
        vec![1, 4]
    );
    assert_eq!(ids(&store, bbox, MatcherSet::any(Kinds::ALL)), vec![1, 2, 3, 4]);
}

#[derive(Default)]
struct CountingMatcher {
    accepts: AtomicUsize,
}

impl Matcher for CountingMatcher {
    fn accept(&self, _buf: &[u8], _rec_ofs: usize) -> Result<bool> {
        self.accepts.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    fn accept_index(&self, category_bits: u32) -> bool {
        category_bits & 0b01 != 0
    }
}

#[test]
fn test_rejected_bucket_contributes_no_leaf_reads() {
    let mut tile = TileBuilder::new();
    tile.add(
        TileFeature::way(1, BoundingBox::new(0, 0, 10, 10)).with_category(0b01),
    )
    .add(
        TileFeature::way(2, BoundingBox::new(20, 0, 30, 10)).with_category(0b10),
    );
    let store = store_of(0, vec![(TileId::new(0, 0, 0), tile)]);

    let matcher = Arc::new(CountingMatcher::default());
    let matchers = MatcherSet::with_matcher(Kinds::WAYS, matcher.clone());
    let found = ids(&store, BoundingBox::world(), matchers);

    assert_eq!(found, vec![1]);
    // The pruned bucket's leaf is never consulted at all.
    assert_eq!(matcher.accepts.load(Ordering::SeqCst), 1);
}

#[test]
fn test_touching_boundary_is_included() {
    let mut tile = TileBuilder::new();
    tile.add(TileFeature::way(1, BoundingBox::new(0, 0, 10, 10)))
        .add(TileFeature::node(2, 10, 10));
    let store = store_of(0, vec![(TileId::new(0, 0, 0), tile)]);

    // The query corner exactly touches the way's corner and the node.
    let touching = BoundingBox::new(10, 10, 20, 20);
    assert_eq!(ids(&store, touching, MatcherSet::any(Kinds::ALL)), vec![1, 2]);

    let disjoint = BoundingBox::new(11, 11, 20, 20);
    assert!(ids(&store, disjoint, MatcherSet::any(Kinds::ALL)).is_empty());
}

struct FailingStorage {
    inner: MemoryStore,
}

impl TileStorage for FailingStorage {
    fn zoom(&self) -> u8 {
        self.inner.zoom()
    }

    fn tip_of(&self, tile: TileId) -> Option<Tip> {
        self.inner.tip_of(tile)
    }

    fn fetch_tile(&self, _tip: Tip) -> Result<TilePage> {
        Err(StoreError::Other("tile fetch failed".into()))
    }

    fn tile_count(&self) -> usize {
        self.inner.tile_count()
    }
}

#[test]
fn test_storage_failure_surfaces_once() {
    let mut builder = StoreBuilder::new(0).unwrap();
    let mut tile = TileBuilder::new();
    tile.add(TileFeature::node(1, 5, 5));
    builder.add_tile(TileId::new(0, 0, 0), &tile).unwrap();
    let storage = FailingStorage {
        inner: builder.into_memory().unwrap(),
    };
    let store = FeatureStore::from_storage(Arc::new(storage), Config::default()).unwrap();

    let mut query = store.find_all(BoundingBox::world(), Kinds::ALL);
    assert!(matches!(query.next(), Some(Err(StoreError::Other(_)))));
    assert!(query.next().is_none());
}

#[test]
fn test_relation_members_and_node_entry_stride() {
    let mut tile = TileBuilder::new();
    tile.add(TileFeature::node(10, 5, 5).with_tag("name", "stop A"))
        .add(TileFeature::node(11, 6, 6))
        .add(TileFeature::way(20, BoundingBox::new(0, 0, 10, 10)))
        .add(
            TileFeature::relation(30, BoundingBox::new(0, 0, 10, 10))
                .with_member(FeatureKind::Node, 10, "stop")
                .with_member(FeatureKind::Way, 20, "route")
                .with_member(FeatureKind::Way, 999, "elsewhere"),
        );
    let store = store_of(0, vec![(TileId::new(0, 0, 0), tile)]);
    let bbox = BoundingBox::new(0, 0, 20, 20);

    // Node leaf mixes a member-flagged (wider) entry with a plain one.
    let nodes: Vec<_> = store
        .find_all(bbox, Kinds::NODES)
        .map(|f| f.unwrap())
        .collect();
    assert_eq!(nodes.len(), 2);
    let member_node = nodes.iter().find(|f| f.id() == 10).unwrap();
    assert!(member_node.is_relation_member());
    assert!(!nodes.iter().find(|f| f.id() == 11).unwrap().is_relation_member());

    let relation = store
        .find_all(bbox, Kinds::RELATIONS)
        .next()
        .unwrap()
        .unwrap();
    assert_eq!(relation.id(), 30);
    let members: Vec<_> = relation
        .members()
        .unwrap()
        .map(|m| m.unwrap())
        .collect();
    // The foreign member (not stored in this tile) is silently dropped.
    assert_eq!(members.len(), 2);

    let stop = members.iter().find(|m| m.role == "stop").unwrap();
    assert_eq!(stop.feature.kind(), FeatureKind::Node);
    assert_eq!(stop.feature.id(), 10);
    assert_eq!(stop.feature.tag("name").unwrap(), Some("stop A"));

    let route = members.iter().find(|m| m.role == "route").unwrap();
    assert_eq!(route.feature.kind(), FeatureKind::Way);
    assert_eq!(route.feature.id(), 20);
}

#[test]
fn test_member_matcher_constrains_relations() {
    let mut tile = TileBuilder::new();
    tile.add(TileFeature::node(1, 5, 5).with_tag("railway", "station"))
        .add(TileFeature::node(2, 15, 15))
        .add(
            TileFeature::relation(10, BoundingBox::new(0, 0, 10, 10))
                .with_member(FeatureKind::Node, 1, "stop"),
        )
        .add(
            TileFeature::relation(11, BoundingBox::new(10, 10, 20, 20))
                .with_member(FeatureKind::Node, 2, "stop"),
        )
        .add(TileFeature::relation(12, BoundingBox::new(0, 0, 20, 20)));
    let store = store_of(0, vec![(TileId::new(0, 0, 0), tile)]);

    // Only the relation with a member passing the member matcher survives;
    // a relation without members can never satisfy the constraint.
    let matchers = MatcherSet::any(Kinds::RELATIONS)
        .with_members(Arc::new(ExprMatcher::new(TagExpr::eq("railway", "station"))));
    assert_eq!(ids(&store, BoundingBox::world(), matchers), vec![10]);

    // Without the constraint every relation matches.
    assert_eq!(
        ids(&store, BoundingBox::world(), MatcherSet::any(Kinds::RELATIONS)),
        vec![10, 11, 12]
    );
}

#[test]
fn test_pipeline_covers_many_tiles() {
    // 16 tiles at zoom 2, one node each, with a pipeline narrower than the
    // tile count so replenishment is exercised.
    let mut builder = StoreBuilder::new(2).unwrap();
    for col in 0..4 {
        for row in 0..4 {
            let tile = TileId::new(2, col, row);
            let bounds = tile.bounds();
            let mut tb = TileBuilder::new();
            tb.add(TileFeature::node(
                (col * 4 + row + 1) as u64,
                bounds.min_x.wrapping_add(1),
                bounds.min_y.wrapping_add(1),
            ));
            builder.add_tile(tile, &tb).unwrap();
        }
    }
    let store = FeatureStore::from_storage(
        Arc::new(builder.into_memory().unwrap()),
        Config::default().with_max_pending_tiles(2),
    )
    .unwrap();

    let found = ids(&store, BoundingBox::world(), MatcherSet::any(Kinds::ALL));
    assert_eq!(found, (1..=16).collect::<Vec<u64>>());
}

#[test]
fn test_file_store_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fixtures.store");

    let mut builder = StoreBuilder::new(0).unwrap();
    let mut tile = TileBuilder::new();
    tile.add(TileFeature::way(1, BoundingBox::new(0, 0, 100, 100)).with_tag("highway", "primary"))
        .add(TileFeature::node(2, 50, 50).with_tag("amenity", "cafe"));
    builder.add_tile(TileId::new(0, 0, 0), &tile).unwrap();
    builder.write_to(&path).unwrap();

    let store = FeatureStore::open(&path).unwrap();
    assert_eq!(store.zoom(), 0);
    assert_eq!(store.tile_count(), 1);
    assert!(store.stats().data_bytes > 0);

    let features: Vec<_> = store
        .find_all(BoundingBox::world(), Kinds::ALL)
        .map(|f| f.unwrap())
        .collect();
    assert_eq!(features.len(), 2);
    let way = features.iter().find(|f| f.id() == 1).unwrap();
    assert_eq!(way.tag("highway").unwrap(), Some("primary"));
    assert_eq!(way.bounds().unwrap(), BoundingBox::new(0, 0, 100, 100));

    // Features keep the mapped page alive after the store is gone.
    drop(store);
    assert_eq!(features[0].tags().unwrap().count(), 1);
}
