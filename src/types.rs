//! Core value types: tile identifiers, bounding boxes, kind masks, and the
//! engine configuration.

use crate::format;
use serde::de::Error;
use serde::{Deserialize, Serialize};

/// Highest zoom level the tile identifier packing supports.
pub const MAX_ZOOM: u8 = 12;

const SIGN_FLIP: u32 = 0x8000_0000;

/// Identifier of one spatial tile: zoom level plus column/row in the grid.
///
/// Packed into a single `u32` (zoom in the high byte, 12 bits each for
/// column and row) so it can serve directly as a directory key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileId(u32);

impl TileId {
    pub fn new(zoom: u8, col: u32, row: u32) -> Self {
        debug_assert!(zoom <= MAX_ZOOM);
        debug_assert!(zoom == 0 || (col < (1 << zoom) && row < (1 << zoom)));
        TileId(((zoom as u32) << 24) | (col << 12) | row)
    }

    pub(crate) fn from_raw(raw: u32) -> Self {
        TileId(raw)
    }

    pub(crate) fn raw(self) -> u32 {
        self.0
    }

    pub fn zoom(self) -> u8 {
        (self.0 >> 24) as u8
    }

    pub fn col(self) -> u32 {
        (self.0 >> 12) & 0xfff
    }

    pub fn row(self) -> u32 {
        self.0 & 0xfff
    }

    /// The coordinate-space rectangle this tile covers. Columns grow
    /// eastward, rows grow northward.
    pub fn bounds(self) -> BoundingBox {
        let zoom = self.zoom();
        if zoom == 0 {
            return BoundingBox::world();
        }
        let span_bits = 32 - zoom as u32;
        let left = self.col() << span_bits;
        let bottom = self.row() << span_bits;
        let width = u32::MAX >> zoom;
        BoundingBox {
            min_x: (left ^ SIGN_FLIP) as i32,
            min_y: (bottom ^ SIGN_FLIP) as i32,
            max_x: ((left | width) ^ SIGN_FLIP) as i32,
            max_y: ((bottom | width) ^ SIGN_FLIP) as i32,
        }
    }
}

/// Tile locator used to fetch a tile's page from storage.
///
/// Opaque to the query engine; storage backends interpret it as an index
/// into their tile directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tip(pub u32);

/// An axis-aligned rectangle in the store's integer coordinate plane.
///
/// All comparisons are closed-interval: a box that merely touches another
/// box still overlaps it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_x: i32,
    pub min_y: i32,
    pub max_x: i32,
    pub max_y: i32,
}

impl BoundingBox {
    pub fn new(min_x: i32, min_y: i32, max_x: i32, max_y: i32) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    /// A single-point box.
    pub fn point(x: i32, y: i32) -> Self {
        Self::new(x, y, x, y)
    }

    /// The whole coordinate plane.
    pub fn world() -> Self {
        Self::new(i32::MIN, i32::MIN, i32::MAX, i32::MAX)
    }

    pub fn is_valid(&self) -> bool {
        self.min_x <= self.max_x && self.min_y <= self.max_y
    }

    /// Closed-interval overlap test.
    #[inline]
    pub fn intersects(&self, other: &BoundingBox) -> bool {
        !(other.min_x > self.max_x
            || other.min_y > self.max_y
            || other.max_x < self.min_x
            || other.max_y < self.min_y)
    }

    /// Closed-interval point containment.
    #[inline]
    pub fn contains_point(&self, x: i32, y: i32) -> bool {
        x >= self.min_x && x <= self.max_x && y >= self.min_y && y <= self.max_y
    }

    /// Smallest box covering both operands.
    pub fn union(&self, other: &BoundingBox) -> BoundingBox {
        BoundingBox {
            min_x: self.min_x.min(other.min_x),
            min_y: self.min_y.min(other.min_y),
            max_x: self.max_x.max(other.max_x),
            max_y: self.max_y.max(other.max_y),
        }
    }
}

/// Bitmask of requested feature kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Kinds(u8);

impl Kinds {
    pub const NONE: Kinds = Kinds(0);
    /// Point features.
    pub const NODES: Kinds = Kinds(1);
    /// Linear (non-area) ways.
    pub const WAYS: Kinds = Kinds(2);
    /// Area features, whether backed by a way or a relation.
    pub const AREAS: Kinds = Kinds(4);
    /// Non-area relations.
    pub const RELATIONS: Kinds = Kinds(8);
    pub const ALL: Kinds = Kinds(15);

    pub fn contains(self, other: Kinds) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersect(self, other: Kinds) -> Kinds {
        Kinds(self.0 & other.0)
    }

    pub fn union(self, other: Kinds) -> Kinds {
        Kinds(self.0 | other.0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Whether a feature with the given record flags byte belongs to one of
    /// the requested kinds. Area features match [`Kinds::AREAS`] regardless
    /// of whether a way or a relation backs them.
    #[inline]
    pub fn accepts_flags(self, flags: u8) -> bool {
        let kind = if flags & format::FLAG_AREA != 0 {
            Kinds::AREAS
        } else {
            match flags & format::KIND_MASK {
                format::KIND_NODE => Kinds::NODES,
                format::KIND_WAY => Kinds::WAYS,
                format::KIND_RELATION => Kinds::RELATIONS,
                _ => return false,
            }
        };
        self.contains(kind)
    }
}

impl std::ops::BitOr for Kinds {
    type Output = Kinds;

    fn bitor(self, rhs: Kinds) -> Kinds {
        self.union(rhs)
    }
}

/// Query engine configuration.
///
/// Serializable so deployments can load it from JSON alongside other
/// service settings.
///
/// # Example
///
/// ```rust
/// use tilequery::Config;
///
/// let config = Config::default().with_max_pending_tiles(4);
/// assert_eq!(config.max_pending_tiles, 4);
///
/// let config = Config::from_json(r#"{ "max_pending_tiles": 16 }"#).unwrap();
/// assert_eq!(config.max_pending_tiles, 16);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Maximum number of tile tasks in flight at once. Bounds the peak
    /// memory held by unconsumed result chains.
    #[serde(default = "Config::default_max_pending_tiles")]
    pub max_pending_tiles: usize,

    /// Worker threads for the query pool. `None` uses the process-wide
    /// shared pool sized to available parallelism.
    #[serde(default)]
    pub worker_threads: Option<usize>,
}

impl Config {
    const fn default_max_pending_tiles() -> usize {
        8
    }

    pub fn with_max_pending_tiles(mut self, n: usize) -> Self {
        assert!(n > 0, "Pipeline depth must be greater than zero");
        self.max_pending_tiles = n;
        self
    }

    pub fn with_worker_threads(mut self, n: usize) -> Self {
        assert!(n > 0, "Worker thread count must be greater than zero");
        self.worker_threads = Some(n);
        self
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_pending_tiles == 0 {
            return Err("max_pending_tiles must be greater than zero".to_string());
        }
        if let Some(threads) = self.worker_threads
            && threads == 0
        {
            return Err("worker_threads must be greater than zero".to_string());
        }
        Ok(())
    }

    /// Load configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let config: Config = serde_json::from_str(json)?;
        if let Err(e) = config.validate() {
            return Err(Error::custom(e));
        }
        Ok(config)
    }

    /// Save configuration as a JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_pending_tiles: Self::default_max_pending_tiles(),
            worker_threads: None,
        }
    }
}
