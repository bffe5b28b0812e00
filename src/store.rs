//! The feature store facade.
//!
//! [`FeatureStore`] ties a storage backend to a worker pool and hands out
//! [`Query`] streams. Stores are cheap to share: queries borrow nothing
//! from the store beyond reference-counted handles, so one store can serve
//! many concurrent queries.

use crate::builder::StoreBuilder;
use crate::error::{Result, StoreError};
use crate::feature::FeatureFilter;
use crate::matcher::{MatcherCache, MatcherSet};
use crate::query::Query;
use crate::storage::{FileStore, MemoryStore, StorageStats, TileStorage};
use crate::types::{BoundingBox, Config, Kinds};
use once_cell::sync::Lazy;
use std::path::Path;
use std::sync::Arc;

/// Process-wide worker pool shared by stores without a dedicated pool.
static SHARED_POOL: Lazy<Arc<rayon::ThreadPool>> = Lazy::new(|| {
    Arc::new(
        rayon::ThreadPoolBuilder::new()
            .thread_name(|i| format!("tilequery-{i}"))
            .build()
            .expect("shared worker pool"),
    )
});

/// A read-only spatial feature store.
///
/// # Example
///
/// ```rust
/// use tilequery::{
///     BoundingBox, FeatureStore, Kinds, StoreBuilder, TileBuilder, TileFeature, TileId,
/// };
///
/// let mut tiles = StoreBuilder::new(0).unwrap();
/// let mut tile = TileBuilder::new();
/// tile.add(TileFeature::way(1, BoundingBox::new(0, 0, 100, 100)).with_tag("highway", "primary"));
/// tiles.add_tile(TileId::new(0, 0, 0), &tile).unwrap();
///
/// let store = FeatureStore::memory(tiles.into_memory().unwrap()).unwrap();
/// let found = store
///     .find_all(BoundingBox::new(0, 0, 500, 500), Kinds::ALL)
///     .count();
/// assert_eq!(found, 1);
/// ```
pub struct FeatureStore {
    storage: Arc<dyn TileStorage>,
    pool: Arc<rayon::ThreadPool>,
    config: Config,
    matcher_cache: Option<MatcherCache>,
}

impl FeatureStore {
    /// Starts a [`StoreBuilder`] for fabricating a store tile by tile.
    pub fn builder(zoom: u8) -> Result<StoreBuilder> {
        StoreBuilder::new(zoom)
    }

    /// Opens a store file with default configuration.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_config(path, Config::default())
    }

    /// Opens and maps a store file.
    pub fn open_with_config<P: AsRef<Path>>(path: P, config: Config) -> Result<Self> {
        let storage = FileStore::open(path)?;
        log::info!(
            "opened store: zoom {}, {} tiles",
            storage.zoom(),
            storage.tile_count()
        );
        Self::from_storage(Arc::new(storage), config)
    }

    /// Wraps an in-memory store.
    pub fn memory(store: MemoryStore) -> Result<Self> {
        Self::from_storage(Arc::new(store), Config::default())
    }

    /// Wraps any storage backend.
    pub fn from_storage(storage: Arc<dyn TileStorage>, config: Config) -> Result<Self> {
        config.validate().map_err(StoreError::InvalidInput)?;
        let pool = match config.worker_threads {
            Some(threads) => Arc::new(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(threads)
                    .thread_name(|i| format!("tilequery-{i}"))
                    .build()?,
            ),
            None => SHARED_POOL.clone(),
        };
        Ok(Self {
            storage,
            pool,
            config,
            matcher_cache: None,
        })
    }

    /// Installs the compiler turning textual queries into matcher sets;
    /// compiled sets are cached by exact query string.
    pub fn with_matcher_compiler(
        mut self,
        compile: impl Fn(&str) -> Result<MatcherSet> + Send + Sync + 'static,
    ) -> Self {
        self.matcher_cache = Some(MatcherCache::new(compile));
        self
    }

    /// Streams every feature of the requested kinds intersecting `bbox`.
    pub fn find_all(&self, bbox: BoundingBox, kinds: Kinds) -> Query {
        self.find(bbox, MatcherSet::any(kinds))
    }

    /// Streams features intersecting `bbox` that pass the matcher set.
    pub fn find(&self, bbox: BoundingBox, matchers: MatcherSet) -> Query {
        Query::new(
            self.storage.clone(),
            self.pool.clone(),
            &self.config,
            bbox,
            matchers,
            None,
        )
    }

    /// Like [`FeatureStore::find`], with a typed filter applied to each
    /// candidate before it is yielded.
    pub fn find_filtered(
        &self,
        bbox: BoundingBox,
        matchers: MatcherSet,
        filter: Arc<dyn FeatureFilter>,
    ) -> Query {
        Query::new(
            self.storage.clone(),
            self.pool.clone(),
            &self.config,
            bbox,
            matchers,
            Some(filter),
        )
    }

    /// Compiles (or fetches from cache) a textual query and runs it.
    pub fn query(&self, bbox: BoundingBox, text: &str) -> Result<Query> {
        let cache = self.matcher_cache.as_ref().ok_or_else(|| {
            StoreError::InvalidInput("no matcher compiler configured".into())
        })?;
        let matchers = cache.get(text)?;
        Ok(self.find(bbox, matchers))
    }

    /// The grid zoom level of the underlying storage.
    pub fn zoom(&self) -> u8 {
        self.storage.zoom()
    }

    pub fn tile_count(&self) -> usize {
        self.storage.tile_count()
    }

    pub fn stats(&self) -> StorageStats {
        self.storage.stats()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{StoreBuilder, TileBuilder, TileFeature};
    use crate::matcher::{ExprMatcher, TagExpr};
    use crate::types::TileId;

    fn sample_store(config: Config) -> FeatureStore {
        let mut tiles = StoreBuilder::new(0).unwrap();
        let mut tile = TileBuilder::new();
        tile.add(TileFeature::node(1, 10, 10).with_tag("amenity", "cafe"))
            .add(TileFeature::way(2, BoundingBox::new(0, 0, 50, 50)).with_tag("highway", "primary"))
            .add(TileFeature::way(3, BoundingBox::new(60, 0, 90, 50)));
        tiles.add_tile(TileId::new(0, 0, 0), &tile).unwrap();
        FeatureStore::from_storage(Arc::new(tiles.into_memory().unwrap()), config).unwrap()
    }

    #[test]
    fn test_find_all_and_kind_restriction() {
        let store = sample_store(Config::default());
        let bbox = BoundingBox::new(0, 0, 100, 100);
        assert_eq!(store.find_all(bbox, Kinds::ALL).count(), 3);
        assert_eq!(store.find_all(bbox, Kinds::NODES).count(), 1);
        assert_eq!(store.find_all(bbox, Kinds::WAYS).count(), 2);
        assert_eq!(store.find_all(bbox, Kinds::RELATIONS).count(), 0);
    }

    #[test]
    fn test_textual_query_requires_compiler() {
        let store = sample_store(Config::default());
        let bbox = BoundingBox::new(0, 0, 100, 100);
        assert!(matches!(
            store.query(bbox, "highway=primary"),
            Err(StoreError::InvalidInput(_))
        ));

        let store = store.with_matcher_compiler(|_text| {
            Ok(MatcherSet::with_matcher(
                Kinds::WAYS,
                Arc::new(ExprMatcher::new(TagExpr::eq("highway", "primary"))),
            ))
        });
        let found: Vec<_> = store
            .query(bbox, "highway=primary")
            .unwrap()
            .map(|f| f.unwrap())
            .collect();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id(), 2);
    }

    #[test]
    fn test_dedicated_pool() {
        let store = sample_store(Config::default().with_worker_threads(2));
        let bbox = BoundingBox::new(0, 0, 100, 100);
        assert_eq!(store.find_all(bbox, Kinds::ALL).count(), 3);
    }

    #[test]
    fn test_filtered_query() {
        let store = sample_store(Config::default());
        let bbox = BoundingBox::new(0, 0, 100, 100);
        let filter: Arc<dyn FeatureFilter> =
            Arc::new(|f: &crate::Feature| -> Result<bool> { Ok(f.bounds()?.max_x > 80) });
        let wide = store.find_filtered(bbox, MatcherSet::any(Kinds::WAYS), filter);
        let found: Vec<_> = wide.map(|f| f.unwrap()).collect();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id(), 3);
    }
}
