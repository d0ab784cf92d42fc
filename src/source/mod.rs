//! Scanline image sources.
//!
//! Decoders for astronomical formats hand out pixel data one scanline run at
//! a time, in file order: row 0 at the top of the image, rows increasing
//! downward. The engine re-batches those runs into tiles in
//! [`crate::batch`]; everything format-specific stays behind the two traits
//! here.

pub mod cache;
pub mod memory;

use async_trait::async_trait;

use crate::error::OpenError;
use crate::geometry::{Box2i, V2i};

/// The dimensions of one image file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageShape {
    pub width: i32,
    pub height: i32,
    /// Channels per sub-image.
    pub channel_count: usize,
    /// Independent images stored in the same file.
    pub sub_image_count: usize,
}

impl ImageShape {
    /// The pixel region covered by the image, with the origin at the
    /// bottom-left in display space.
    pub fn data_window(&self) -> Box2i {
        Box2i::new(V2i::new(0, 0), V2i::new(self.width, self.height))
    }
}

/// An open image file that yields pixel data by scanline run.
///
/// `read_scanline_range` takes `&mut self` because decoders are stateful
/// seek-and-read machines; callers serialize access per handle.
#[async_trait]
pub trait ScanlineImage: Send + Sync {
    fn shape(&self) -> ImageShape;

    /// Reads `row_count` consecutive scanlines of one channel, starting at
    /// `first_row` counted from the top of the file.
    ///
    /// Returns `row_count * width` samples in file order.
    async fn read_scanline_range(
        &mut self,
        sub_image: usize,
        first_row: i32,
        row_count: i32,
        channel: usize,
    ) -> Result<Vec<f32>, OpenError>;
}

/// Opens image files by resolved path.
#[async_trait]
pub trait ImageOpener: Send + Sync {
    type Image: ScanlineImage + 'static;

    async fn open(&self, path: &str) -> Result<Self::Image, OpenError>;
}
