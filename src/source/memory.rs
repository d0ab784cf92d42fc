//! An in-memory [`ImageOpener`] backed by preloaded pixel planes.
//!
//! Used throughout the test suites in place of on-disk files; the open and
//! read counters make cache behavior observable.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use super::{ImageOpener, ImageShape, ScanlineImage};
use crate::error::OpenError;

/// The pixel content of one stored image: a plane per sub-image and channel,
/// each row-major with row 0 at the top.
#[derive(Debug, Clone)]
pub struct MemoryImageData {
    pub shape: ImageShape,
    pub planes: Vec<Vec<f32>>,
}

impl MemoryImageData {
    /// An image whose sample at file row `r`, column `x` of plane `p` is
    /// `p * 1_000_000 + r * width + x`. Every sample value is distinct, so a
    /// test can assert exactly which source pixel landed where.
    pub fn ramp(shape: ImageShape) -> Self {
        let plane_count = shape.sub_image_count * shape.channel_count;
        let planes = (0..plane_count)
            .map(|p| {
                (0..shape.height * shape.width)
                    .map(|i| (p * 1_000_000) as f32 + i as f32)
                    .collect()
            })
            .collect();
        Self { shape, planes }
    }

    fn plane(&self, sub_image: usize, channel: usize) -> &[f32] {
        &self.planes[sub_image * self.shape.channel_count + channel]
    }
}

struct Stored {
    data: Arc<MemoryImageData>,
    fail_reason: Option<String>,
}

/// Registry of in-memory images, opened by path.
#[derive(Default)]
pub struct MemorySource {
    images: HashMap<String, Stored>,
    attempts: Arc<AtomicUsize>,
    opens: Arc<AtomicUsize>,
    reads: Arc<AtomicUsize>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<String>, data: MemoryImageData) {
        assert_eq!(
            data.planes.len(),
            data.shape.sub_image_count * data.shape.channel_count,
            "plane count"
        );
        self.images.insert(
            path.into(),
            Stored { data: Arc::new(data), fail_reason: None },
        );
    }

    /// Registers a path whose open always fails with `reason`.
    pub fn insert_failing(&mut self, path: impl Into<String>, reason: impl Into<String>) {
        self.images.insert(
            path.into(),
            Stored {
                data: Arc::new(MemoryImageData {
                    shape: ImageShape {
                        width: 0,
                        height: 0,
                        channel_count: 0,
                        sub_image_count: 0,
                    },
                    planes: Vec::new(),
                }),
                fail_reason: Some(reason.into()),
            },
        );
    }

    /// How many opens have been attempted, successful or not.
    pub fn attempt_count(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// How many successful opens have been served.
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// How many scanline-range reads have been served across all handles.
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImageOpener for MemorySource {
    type Image = MemoryImage;

    async fn open(&self, path: &str) -> Result<MemoryImage, OpenError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let stored = self.images.get(path).ok_or_else(|| OpenError::Open {
            path: path.to_string(),
            reason: "No such file".to_string(),
        })?;
        if let Some(reason) = &stored.fail_reason {
            return Err(OpenError::Open {
                path: path.to_string(),
                reason: reason.clone(),
            });
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(MemoryImage {
            path: path.to_string(),
            data: stored.data.clone(),
            reads: self.reads.clone(),
        })
    }
}

/// An opened in-memory image.
#[derive(Debug)]
pub struct MemoryImage {
    path: String,
    data: Arc<MemoryImageData>,
    reads: Arc<AtomicUsize>,
}

#[async_trait]
impl ScanlineImage for MemoryImage {
    fn shape(&self) -> ImageShape {
        self.data.shape
    }

    async fn read_scanline_range(
        &mut self,
        sub_image: usize,
        first_row: i32,
        row_count: i32,
        channel: usize,
    ) -> Result<Vec<f32>, OpenError> {
        let shape = self.data.shape;
        if sub_image >= shape.sub_image_count
            || channel >= shape.channel_count
            || first_row < 0
            || first_row + row_count > shape.height
        {
            return Err(OpenError::Read {
                path: self.path.clone(),
                reason: format!(
                    "Scanline range {}..{} of sub-image {} channel {} out of bounds",
                    first_row,
                    first_row + row_count,
                    sub_image,
                    channel
                ),
            });
        }

        self.reads.fetch_add(1, Ordering::SeqCst);
        let plane = self.data.plane(sub_image, channel);
        let start = (first_row * shape.width) as usize;
        let end = ((first_row + row_count) * shape.width) as usize;
        Ok(plane[start..end].to_vec())
    }
}
