//! Image value types shared across the engine.
//!
//! Tiles are the unit of pixel computation: fixed-size square blocks of f32
//! samples behind an [`Arc`], so forwarding a tile between nodes or holding
//! it in a cache never copies pixel data.

use std::ops::Deref;
use std::sync::{Arc, OnceLock};

use crate::error::ConsistencyError;
use crate::geometry::{Box2i, V2i, TILE_PIXELS};

// =============================================================================
// Tile
// =============================================================================

/// A tile of pixel samples.
///
/// Storage is row-major with row 0 at the bottom of the tile, matching the
/// engine's y-up display space.
#[derive(Debug, Clone)]
pub struct Tile(Arc<Vec<f32>>);

impl Tile {
    /// Wraps a sample buffer of exactly [`TILE_PIXELS`] values.
    pub fn from_samples(samples: Vec<f32>) -> Self {
        assert_eq!(samples.len(), TILE_PIXELS, "tile sample count");
        Self(Arc::new(samples))
    }

    /// The shared all-zero tile.
    ///
    /// Every caller receives the same allocation, so producing black regions
    /// outside a data window costs one clone of an `Arc`.
    pub fn black() -> Self {
        static BLACK: OnceLock<Arc<Vec<f32>>> = OnceLock::new();
        Self(BLACK.get_or_init(|| Arc::new(vec![0.0; TILE_PIXELS])).clone())
    }

    /// Whether this tile is the shared black tile (by identity, not value).
    pub fn is_shared_black(&self) -> bool {
        static PROBE: OnceLock<Tile> = OnceLock::new();
        Arc::ptr_eq(&self.0, &PROBE.get_or_init(Tile::black).0)
    }

    pub fn samples(&self) -> &[f32] {
        &self.0
    }
}

impl Deref for Tile {
    type Target = [f32];

    fn deref(&self) -> &[f32] {
        &self.0
    }
}

impl PartialEq for Tile {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0) || self.0 == other.0
    }
}

// =============================================================================
// Sample offsets
// =============================================================================

/// Per-pixel cumulative sample counts for one tile of a deep image.
pub type SampleOffsets = Arc<Vec<i32>>;

/// The sample offsets of a flat tile: exactly one sample per pixel.
pub fn flat_sample_offsets() -> SampleOffsets {
    static FLAT: OnceLock<SampleOffsets> = OnceLock::new();
    FLAT.get_or_init(|| Arc::new((1..=TILE_PIXELS as i32).collect()))
        .clone()
}

/// Checks that two inputs agree on the sample structure of one tile.
pub fn check_sample_offsets_match(
    expected: &SampleOffsets,
    actual: &SampleOffsets,
    tile_origin: V2i,
) -> Result<(), ConsistencyError> {
    if Arc::ptr_eq(expected, actual) || expected == actual {
        Ok(())
    } else {
        Err(ConsistencyError::SampleOffsetsMismatch { tile_origin })
    }
}

// =============================================================================
// Format and metadata
// =============================================================================

/// The display geometry of an image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Format {
    pub display_window: Box2i,
    pub pixel_aspect: f32,
}

impl Format {
    pub fn new(display_window: Box2i) -> Self {
        Self { display_window, pixel_aspect: 1.0 }
    }
}

impl Default for Format {
    fn default() -> Self {
        Self::new(Box2i::default())
    }
}

/// Arbitrary key/value image metadata.
pub type Metadata = Arc<serde_json::Map<String, serde_json::Value>>;

/// The shared empty metadata map.
pub fn empty_metadata() -> Metadata {
    static EMPTY: OnceLock<Metadata> = OnceLock::new();
    EMPTY.get_or_init(|| Arc::new(serde_json::Map::new())).clone()
}

// =============================================================================
// Region copies
// =============================================================================

/// Index of pixel `p` within a row-major, bottom-up buffer spanning `window`.
pub fn buffer_index(p: V2i, window: Box2i) -> usize {
    let size = window.size();
    let rel = p - window.min;
    (rel.y * size.x + rel.x) as usize
}

/// Copies the samples of `region` from one tile-sized buffer into another.
///
/// `from_window` and `to_window` are the full extents covered by the two
/// buffers; `region` must lie within both. `to_origin` is `to_window.min`.
pub fn copy_region(
    from: &[f32],
    from_window: Box2i,
    region: Box2i,
    to: &mut [f32],
    to_window: Box2i,
) {
    debug_assert!(from_window.contains_box(region));
    debug_assert!(to_window.contains_box(region));

    let width = region.size().x as usize;
    for y in region.min.y..region.max.y {
        let src = buffer_index(V2i::new(region.min.x, y), from_window);
        let dst = buffer_index(V2i::new(region.min.x, y), to_window);
        to[dst..dst + width].copy_from_slice(&from[src..src + width]);
    }
}
