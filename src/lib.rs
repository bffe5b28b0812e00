//! Concurrent spatial queries over tile-partitioned feature stores.
//!
//! ```rust
//! use tilequery::{BoundingBox, FeatureStore, Kinds, StoreBuilder, TileBuilder, TileFeature, TileId};
//!
//! let mut tiles = StoreBuilder::new(0)?;
//! let mut tile = TileBuilder::new();
//! tile.add(TileFeature::way(1, BoundingBox::new(0, 0, 100, 100)).with_tag("highway", "primary"));
//! tiles.add_tile(TileId::new(0, 0, 0), &tile)?;
//!
//! let store = FeatureStore::memory(tiles.into_memory()?)?;
//! for feature in store.find_all(BoundingBox::new(-50, -50, 500, 500), Kinds::ALL) {
//!     let feature = feature?;
//!     println!("way/{}: {:?}", feature.id(), feature.tag("highway")?);
//! }
//! # Ok::<(), tilequery::StoreError>(())
//! ```

pub mod builder;
pub mod error;
pub mod feature;
pub mod format;
pub mod matcher;
pub mod query;
pub mod storage;
pub mod store;
pub mod tile;
pub mod types;

pub use builder::{StoreBuilder, TileBuilder, TileFeature};
pub use error::{Result, StoreError};
pub use feature::{Feature, FeatureFilter, FeatureKind, Member, Members};
pub use matcher::{
    AllMatcher, AndMatcher, Categories, ExprMatcher, Matcher, MatcherCache, MatcherSet,
    MemberMatcher, RoleMatcher, TagExpr,
};
pub use query::{Query, QueryResults};
pub use storage::{FileStore, MemoryStore, StorageStats, TilePage, TileStorage};
pub use store::FeatureStore;
pub use types::{BoundingBox, Config, Kinds, MAX_ZOOM, TileId, Tip};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Common imports
pub mod prelude {

    pub use crate::{BoundingBox, Config, Kinds, Result, StoreError, TileId};

    pub use crate::{Feature, FeatureKind, FeatureStore, Query};

    pub use crate::{ExprMatcher, Matcher, MatcherSet, TagExpr};

    pub use crate::{MemoryStore, StoreBuilder, TileBuilder, TileFeature, TileStorage};
}
