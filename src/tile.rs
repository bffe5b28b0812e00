//! Tile grid math and the tile index walker.
//!
//! The coordinate plane is the full `i32` range on both axes. At zoom `z`
//! the plane is cut into `2^z × 2^z` tiles; columns grow eastward and rows
//! grow northward, so "the tile to the west" is `col - 1` and "the tile to
//! the north" is `row + 1`.

use crate::types::{BoundingBox, MAX_ZOOM, TileId};

const SIGN_FLIP: u32 = 0x8000_0000;

/// Grid column containing coordinate `x` at zoom `zoom`.
#[inline]
pub fn col_of(x: i32, zoom: u8) -> u32 {
    debug_assert!(zoom <= MAX_ZOOM);
    if zoom == 0 {
        return 0;
    }
    ((x as u32) ^ SIGN_FLIP) >> (32 - zoom as u32)
}

/// Grid row containing coordinate `y` at zoom `zoom`.
#[inline]
pub fn row_of(y: i32, zoom: u8) -> u32 {
    col_of(y, zoom)
}

/// The tile containing point (`x`, `y`) at zoom `zoom`.
pub fn tile_of(x: i32, y: i32, zoom: u8) -> TileId {
    TileId::new(zoom, col_of(x, zoom), row_of(y, zoom))
}

/// Enumerates the tiles of one zoom level intersecting a bounding box, in
/// row-major order.
///
/// The walker yields every *candidate* tile of the grid; the caller is
/// responsible for skipping tiles the store does not hold.
pub struct TileWalker {
    zoom: u8,
    col_end: u32,
    row_start: u32,
    row_end: u32,
    col: u32,
    row: u32,
    done: bool,
}

impl TileWalker {
    pub fn new(bbox: &BoundingBox, zoom: u8) -> Self {
        let done = !bbox.is_valid();
        let col_start = col_of(bbox.min_x, zoom);
        let col_end = col_of(bbox.max_x, zoom);
        let row_start = row_of(bbox.min_y, zoom);
        let row_end = row_of(bbox.max_y, zoom);
        Self {
            zoom,
            col_end,
            row_start,
            row_end,
            col: col_start,
            row: row_start,
            done,
        }
    }

    /// Total number of candidate tiles this walker covers.
    pub fn tile_span(&self) -> usize {
        if self.done {
            return 0;
        }
        let cols = (self.col_end - self.col + 1) as usize;
        let rows = (self.row_end - self.row_start + 1) as usize;
        cols * rows
    }
}

impl Iterator for TileWalker {
    type Item = TileId;

    fn next(&mut self) -> Option<TileId> {
        if self.done {
            return None;
        }
        let tile = TileId::new(self.zoom, self.col, self.row);
        if self.row < self.row_end {
            self.row += 1;
        } else if self.col < self.col_end {
            self.row = self.row_start;
            self.col += 1;
        } else {
            self.done = true;
        }
        Some(tile)
    }
}
