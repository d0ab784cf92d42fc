//! Integer pixel geometry: 2D vectors, half-open boxes and tile indexing.
//!
//! All pixel regions are half-open: `min` is inclusive, `max` is exclusive.
//! Tile origins may be negative, so every mapping from pixel coordinates to
//! tile or batch indices uses floor division (rounding toward negative
//! infinity) rather than truncation.

use std::fmt;
use std::ops::{Add, Mul, Sub};

use serde::{Deserialize, Serialize};

/// Side length of a tile in pixels.
pub const TILE_SIZE: i32 = 64;

/// Number of samples in one tile.
pub const TILE_PIXELS: usize = (TILE_SIZE * TILE_SIZE) as usize;

// =============================================================================
// V2i
// =============================================================================

/// A 2D integer vector, used for pixel coordinates and tile indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct V2i {
    pub x: i32,
    pub y: i32,
}

impl V2i {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

impl Add for V2i {
    type Output = V2i;

    fn add(self, rhs: V2i) -> V2i {
        V2i::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl Sub for V2i {
    type Output = V2i;

    fn sub(self, rhs: V2i) -> V2i {
        V2i::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl Mul<i32> for V2i {
    type Output = V2i;

    fn mul(self, rhs: i32) -> V2i {
        V2i::new(self.x * rhs, self.y * rhs)
    }
}

impl Mul<V2i> for V2i {
    type Output = V2i;

    fn mul(self, rhs: V2i) -> V2i {
        V2i::new(self.x * rhs.x, self.y * rhs.y)
    }
}

impl fmt::Display for V2i {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.x, self.y)
    }
}

// =============================================================================
// Box2i
// =============================================================================

/// An axis-aligned integer box with inclusive `min` and exclusive `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Box2i {
    pub min: V2i,
    pub max: V2i,
}

impl Box2i {
    pub const fn new(min: V2i, max: V2i) -> Self {
        Self { min, max }
    }

    /// The box covering `origin .. origin + size` on both axes.
    pub fn with_size(origin: V2i, size: V2i) -> Self {
        Self::new(origin, origin + size)
    }

    pub fn size(&self) -> V2i {
        self.max - self.min
    }

    pub fn is_empty(&self) -> bool {
        self.max.x <= self.min.x || self.max.y <= self.min.y
    }

    pub fn contains(&self, p: V2i) -> bool {
        p.x >= self.min.x && p.x < self.max.x && p.y >= self.min.y && p.y < self.max.y
    }

    pub fn contains_box(&self, other: Box2i) -> bool {
        other.is_empty()
            || (self.min.x <= other.min.x
                && self.min.y <= other.min.y
                && self.max.x >= other.max.x
                && self.max.y >= other.max.y)
    }

    pub fn intersects(&self, other: &Box2i) -> bool {
        !self.intersection(other).is_empty()
    }

    /// The overlapping region of two boxes; empty if they do not overlap.
    pub fn intersection(&self, other: &Box2i) -> Box2i {
        Box2i::new(
            V2i::new(self.min.x.max(other.min.x), self.min.y.max(other.min.y)),
            V2i::new(self.max.x.min(other.max.x), self.max.y.min(other.max.y)),
        )
    }

    /// The smallest box containing both boxes. An empty box is the identity.
    pub fn union(&self, other: &Box2i) -> Box2i {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        Box2i::new(
            V2i::new(self.min.x.min(other.min.x), self.min.y.min(other.min.y)),
            V2i::new(self.max.x.max(other.max.x), self.max.y.max(other.max.y)),
        )
    }

    /// Translates the box by `-offset`.
    pub fn shifted_by(&self, offset: V2i) -> Box2i {
        Box2i::new(self.min - offset, self.max - offset)
    }
}

impl fmt::Display for Box2i {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.min, self.max)
    }
}

// =============================================================================
// Tile indexing
// =============================================================================

/// Division that always rounds down, instead of toward zero.
///
/// `b` is assumed positive. Required because tile origins may be negative:
/// `-1 / 64` must map to tile index -1, not 0.
pub fn floor_div(a: i32, b: i32) -> i32 {
    let result = a / b;
    let remainder = a - result * b;
    result - (remainder < 0) as i32
}

/// Component-wise [`floor_div`].
pub fn floor_div_v2(a: V2i, b: V2i) -> V2i {
    V2i::new(floor_div(a.x, b.x), floor_div(a.y, b.y))
}

/// The index of the tile containing pixel `p`.
pub fn tile_index(p: V2i) -> V2i {
    floor_div_v2(p, V2i::new(TILE_SIZE, TILE_SIZE))
}

/// The origin (lowest pixel coordinate) of the tile with index `index`.
pub fn tile_origin(index: V2i) -> V2i {
    index * TILE_SIZE
}

/// The pixel region covered by the tile with origin `origin`.
pub fn tile_bound(origin: V2i) -> Box2i {
    Box2i::with_size(origin, V2i::new(TILE_SIZE, TILE_SIZE))
}
