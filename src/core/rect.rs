//! Axis-Aligned Rectangle
//!
//! Half-open region `[min, max)` on the tile grid.

use serde::{Serialize, Deserialize};

use super::point::Point;

/// Axis-aligned rectangle, inclusive `min`, exclusive `max`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Rect {
    /// Top-left corner (inclusive).
    pub min: Point,
    /// Bottom-right corner (exclusive).
    pub max: Point,
}

impl Rect {
    /// Create from two corners. Corners are normalized.
    pub fn new(a: Point, b: Point) -> Self {
        Self {
            min: Point::new(a.x.min(b.x), a.y.min(b.y)),
            max: Point::new(a.x.max(b.x), a.y.max(b.y)),
        }
    }

    /// Create from an origin and a size.
    pub fn from_size(origin: Point, width: i32, height: i32) -> Self {
        Self::new(origin, origin + Point::new(width, height))
    }

    /// Width in tiles.
    #[inline]
    pub fn width(&self) -> i32 {
        self.max.x - self.min.x
    }

    /// Height in tiles.
    #[inline]
    pub fn height(&self) -> i32 {
        self.max.y - self.min.y
    }

    /// True if the rectangle covers no tile.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.width() <= 0 || self.height() <= 0
    }

    /// Check if a point lies inside.
    #[inline]
    pub fn contains(&self, p: Point) -> bool {
        p.x >= self.min.x && p.x < self.max.x && p.y >= self.min.y && p.y < self.max.y
    }

    /// Check if two rectangles share at least one tile.
    pub fn intersects(&self, other: &Rect) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && self.min.x < other.max.x
            && other.min.x < self.max.x
            && self.min.y < other.max.y
            && other.min.y < self.max.y
    }

    /// Iterate all points, row by row.
    pub fn points(&self) -> impl Iterator<Item = Point> {
        let (min, max) = (self.min, self.max);
        (min.y..max.y).flat_map(move |y| (min.x..max.x).map(move |x| Point::new(x, y)))
    }
}
