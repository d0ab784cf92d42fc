//! Re-batching of scanline reads into tiles.
//!
//! Scanline decoders are fastest when asked for long runs of consecutive
//! rows, while the engine computes in 64×64 tiles. The compromise is the
//! tile batch: one decode covers a band the full width of the image and one
//! tile-row high, for every channel of one sub-image, and is then sliced
//! into tiles. Requests for any tile in the band share the one decode
//! through the batch cache.
//!
//! File rows run top-down; tile rows run bottom-up in display space. The
//! slicing step flips row order within the decoded band.

use std::collections::HashMap;

use tokio::sync::Mutex;

use crate::error::{ChannelError, OpenError};
use crate::geometry::{floor_div_v2, tile_index, Box2i, V2i, TILE_PIXELS, TILE_SIZE};
use crate::image::Tile;
use crate::source::{ImageShape, ScanlineImage};

// =============================================================================
// Keys and batches
// =============================================================================

/// Identifies one tile batch within a file: a tile-row band of one
/// sub-image. The column coordinate is structurally absent because scanline
/// batches always span the full image width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BatchKey {
    /// Tile-row index of the band.
    pub row: i32,
    pub sub_image: usize,
}

/// The tiles of one decoded band, all channels concatenated.
#[derive(Debug, Clone)]
pub struct TileBatch {
    tiles: Vec<Tile>,
}

impl TileBatch {
    pub fn tile(&self, slot: usize) -> &Tile {
        &self.tiles[slot]
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }
}

/// Where a named channel lives within a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSlot {
    pub sub_image: usize,
    pub channel: usize,
}

// =============================================================================
// ImageFile
// =============================================================================

/// An opened image plus the derived batch geometry and channel map.
///
/// The decoder itself sits behind a mutex: one band decode at a time per
/// file, while separate files decode in parallel.
pub struct ImageFile<H> {
    image: Mutex<H>,
    shape: ImageShape,
    channel_names: std::sync::Arc<Vec<String>>,
    channel_map: HashMap<String, ChannelSlot>,
    /// Batch extent in tiles: full image width by one tile-row.
    batch_size: V2i,
}

impl<H: ScanlineImage> ImageFile<H> {
    pub fn new(image: H) -> Self {
        let shape = image.shape();

        let mut channel_names = Vec::new();
        let mut channel_map = HashMap::new();
        match shape.channel_count {
            1 => {
                channel_names.push("Y".to_string());
                channel_map.insert("Y".to_string(), ChannelSlot { sub_image: 0, channel: 0 });
            }
            3 => {
                for (i, name) in ["R", "G", "B"].into_iter().enumerate() {
                    channel_names.push(name.to_string());
                    channel_map.insert(name.to_string(), ChannelSlot { sub_image: 0, channel: i });
                }
            }
            // Other channel counts expose no named channels.
            _ => {}
        }

        let batch_size = V2i::new(
            tile_index(V2i::new(shape.width + TILE_SIZE - 1, 0)).x - tile_index(V2i::new(0, 0)).x,
            1,
        );

        Self {
            image: Mutex::new(image),
            shape,
            channel_names: std::sync::Arc::new(channel_names),
            channel_map,
            batch_size,
        }
    }

    pub fn shape(&self) -> ImageShape {
        self.shape
    }

    pub fn channel_names(&self) -> std::sync::Arc<Vec<String>> {
        self.channel_names.clone()
    }

    /// The batch holding the tile at `tile_origin` of `sub_image`.
    pub fn batch_key(&self, sub_image: usize, tile_origin: V2i) -> BatchKey {
        let batch_origin = floor_div_v2(tile_index(tile_origin), self.batch_size);
        BatchKey { row: batch_origin.y, sub_image }
    }

    /// Index of the tile at `tile_origin` within its batch, for channel
    /// index `channel`.
    pub fn tile_slot(&self, channel: usize, tile_origin: V2i) -> usize {
        let plane = (self.batch_size.x * self.batch_size.y) as usize;
        let index = tile_index(tile_origin);
        let sub = index - floor_div_v2(index, self.batch_size) * self.batch_size;
        // Horizontal position is relative to the data window's left edge.
        let sub_x = index.x - tile_index(V2i::new(0, 0)).x;
        channel * plane + (sub.y * self.batch_size.x + sub_x) as usize
    }

    /// Resolves a channel name to the batch and slot holding its tile at
    /// `tile_origin`. The empty name addresses slot 0 of sub-image 0, which
    /// is how per-tile structure queries that need no particular channel are
    /// served.
    pub fn locate(&self, channel_name: &str, tile_origin: V2i) -> Result<(BatchKey, usize), ChannelError> {
        let slot = if channel_name.is_empty() {
            ChannelSlot { sub_image: 0, channel: 0 }
        } else {
            *self
                .channel_map
                .get(channel_name)
                .ok_or_else(|| ChannelError::UnknownChannel { channel: channel_name.to_string() })?
        };
        Ok((
            self.batch_key(slot.sub_image, tile_origin),
            self.tile_slot(slot.channel, tile_origin),
        ))
    }

    /// Decodes the band identified by `key` and slices it into tiles.
    ///
    /// Tiles whose extent falls outside the data window come back as the
    /// shared black tile; a band entirely outside issues no read at all.
    pub async fn read_batch(&self, key: BatchKey) -> Result<TileBatch, OpenError> {
        let target = Box2i::new(
            V2i::new(0, key.row * TILE_SIZE),
            V2i::new(self.shape.width, (key.row + 1) * TILE_SIZE),
        );
        let region = target.intersection(&self.shape.data_window());

        let slots = self.shape.channel_count * (self.batch_size.x * self.batch_size.y) as usize;
        if region.is_empty() {
            return Ok(TileBatch { tiles: vec![Tile::black(); slots] });
        }

        let region_size = region.size();
        let mut planes = Vec::with_capacity(self.shape.channel_count);
        {
            let mut image = self.image.lock().await;
            for channel in 0..self.shape.channel_count {
                planes.push(
                    image
                        .read_scanline_range(key.sub_image, region.min.y, region_size.y, channel)
                        .await?,
                );
            }
        }

        let mut tiles = vec![Tile::black(); slots];
        for (channel, data) in planes.iter().enumerate() {
            for tx in 0..self.batch_size.x {
                let tile_offset = V2i::new(tx, key.row) * TILE_SIZE;
                let slot = self.tile_slot(channel, tile_offset);

                let relative = region.shifted_by(tile_offset);
                let tile_region =
                    Box2i::new(V2i::new(0, 0), V2i::new(TILE_SIZE, TILE_SIZE)).intersection(&relative);
                if tile_region.is_empty() {
                    continue;
                }

                let mut samples = vec![0.0f32; TILE_PIXELS];
                let width = (tile_region.max.x - tile_region.min.x) as usize;
                for y in tile_region.min.y..tile_region.max.y {
                    // Flip scanlines in y: file order is top-down, display
                    // space has its origin at the bottom.
                    let scanline = region_size.y - 1 - (y - relative.min.y);
                    let src = (scanline * region_size.x + tile_region.min.x - relative.min.x) as usize;
                    let dst = (y * TILE_SIZE + tile_region.min.x) as usize;
                    samples[dst..dst + width].copy_from_slice(&data[src..src + width]);
                }
                tiles[slot] = Tile::from_samples(samples);
            }
        }

        Ok(TileBatch { tiles })
    }
}
