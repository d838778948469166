//! Integer Grid Point
//!
//! Position and offset type for the tile grid.
//! Pure value type: no state, no allocation.

use std::fmt;
use std::ops::{Add, AddAssign, Mul, Neg, Sub, SubAssign};
use serde::{Serialize, Deserialize};

/// A position (or offset) on the tile grid.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Point {
    /// Column.
    pub x: i32,
    /// Row.
    pub y: i32,
}

impl Point {
    /// Origin / zero offset
    pub const ZERO: Self = Self { x: 0, y: 0 };

    /// Unit offset pointing up (-Y, screen coordinates)
    pub const UP: Self = Self { x: 0, y: -1 };

    /// Unit offset pointing down (+Y)
    pub const DOWN: Self = Self { x: 0, y: 1 };

    /// Unit offset pointing left (-X)
    pub const LEFT: Self = Self { x: -1, y: 0 };

    /// Unit offset pointing right (+X)
    pub const RIGHT: Self = Self { x: 1, y: 0 };

    /// All four unit directions, clockwise from up.
    pub const DIRECTIONS: [Self; 4] = [Self::UP, Self::RIGHT, Self::DOWN, Self::LEFT];

    /// Create a new point.
    #[inline]
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// True for the four unit axis-aligned vectors.
    #[inline]
    pub const fn is_direction(self) -> bool {
        (self.x.abs() == 1 && self.y == 0) || (self.x == 0 && self.y.abs() == 1)
    }

    /// Manhattan length.
    #[inline]
    pub const fn manhattan(self) -> i32 {
        self.x.abs() + self.y.abs()
    }

    /// Floor division of both components.
    ///
    /// Rounds toward negative infinity so that `(-1) / 8 == -1`.
    #[inline]
    pub const fn div_floor(self, divisor: i32) -> Self {
        Self {
            x: self.x.div_euclid(divisor),
            y: self.y.div_euclid(divisor),
        }
    }

    /// Non-negative remainder of both components.
    #[inline]
    pub const fn rem_floor(self, divisor: i32) -> Self {
        Self {
            x: self.x.rem_euclid(divisor),
            y: self.y.rem_euclid(divisor),
        }
    }
}

impl Add for Point {
    type Output = Self;

    #[inline]
    fn add(self, other: Self) -> Self {
        Self::new(self.x + other.x, self.y + other.y)
    }
}

impl AddAssign for Point {
    #[inline]
    fn add_assign(&mut self, other: Self) {
        *self = *self + other;
    }
}

impl Sub for Point {
    type Output = Self;

    #[inline]
    fn sub(self, other: Self) -> Self {
        Self::new(self.x - other.x, self.y - other.y)
    }
}

impl SubAssign for Point {
    #[inline]
    fn sub_assign(&mut self, other: Self) {
        *self = *self - other;
    }
}

impl Neg for Point {
    type Output = Self;

    #[inline]
    fn neg(self) -> Self {
        Self::new(-self.x, -self.y)
    }
}

impl Mul<i32> for Point {
    type Output = Self;

    #[inline]
    fn mul(self, scalar: i32) -> Self {
        Self::new(self.x * scalar, self.y * scalar)
    }
}

impl fmt::Debug for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}
