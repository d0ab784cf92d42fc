//! The file-backed image source node.
//!
//! Resolves its configured file name against the context (variable and
//! frame substitutions), pulls the handle from the [`FileHandleCache`], and
//! serves tiles out of cached tile batches. A missing or unreadable file is
//! handled per the configured [`MissingMode`].

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::warn;

use super::ImageNode;
use crate::context::{has_frame_token, Context};
use crate::error::{ConfigError, EvalError, RegionError};
use crate::geometry::{tile_bound, Box2i, V2i, TILE_SIZE};
use crate::hash::{DependencyHash, Digest};
use crate::image::{empty_metadata, flat_sample_offsets, Format, Metadata, SampleOffsets, Tile};
use crate::memo::{CachePolicy, EvalCache};
use crate::source::cache::FileHandleCache;
use crate::source::ImageOpener;

// =============================================================================
// Configuration
// =============================================================================

/// What to do when the resolved file cannot be opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissingMode {
    /// Fail the evaluation with the open error.
    #[default]
    Error = 0,
    /// Produce a default (black, channel-less) image.
    Black = 1,
    /// Substitute the nearest earlier frame from `available_frames`.
    Hold = 2,
}

impl std::str::FromStr for MissingMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, ConfigError> {
        match s {
            "error" => Ok(MissingMode::Error),
            "black" => Ok(MissingMode::Black),
            "hold" => Ok(MissingMode::Hold),
            _ => Err(ConfigError::InvalidMissingMode { value: s.to_string() }),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReaderConfig {
    /// File name pattern; `${var}` and `#` substitutions apply. Empty means
    /// no input, which yields default outputs rather than an error.
    pub file_name: String,
    /// Bumped by the user to force a re-read of files that changed on disk.
    pub refresh_count: i32,
    pub missing_mode: MissingMode,
    /// Sorted frame numbers that exist on disk, consulted by
    /// [`MissingMode::Hold`].
    pub available_frames: Vec<i32>,
}

// =============================================================================
// ScanlineReader
// =============================================================================

pub struct ScanlineReader<O: ImageOpener> {
    config: RwLock<ReaderConfig>,
    file_cache: Arc<FileHandleCache<O>>,
    cache: Arc<EvalCache>,
}

type Retrieved<O> = Option<(Arc<crate::batch::ImageFile<<O as ImageOpener>::Image>>, String)>;

impl<O: ImageOpener> ScanlineReader<O> {
    pub fn new(config: ReaderConfig, file_cache: Arc<FileHandleCache<O>>, cache: Arc<EvalCache>) -> Self {
        Self { config: RwLock::new(config), file_cache, cache }
    }

    pub async fn config(&self) -> ReaderConfig {
        self.config.read().await.clone()
    }

    pub async fn set_file_name(&self, file_name: impl Into<String>) {
        self.config.write().await.file_name = file_name.into();
    }

    pub async fn set_missing_mode(&self, mode: MissingMode) {
        self.config.write().await.missing_mode = mode;
    }

    pub async fn set_available_frames(&self, frames: Vec<i32>) {
        self.config.write().await.available_frames = frames;
    }

    /// Advances the refresh count, discarding cached file handles so the
    /// next evaluation re-reads from disk. The new count feeds every hash,
    /// so stale memoized values miss as well.
    pub async fn set_refresh_count(&self, count: i32) {
        let mut config = self.config.write().await;
        if config.refresh_count != count {
            config.refresh_count = count;
            self.file_cache.clear().await;
        }
    }

    pub async fn open_files_limit(&self) -> usize {
        self.file_cache.capacity().await
    }

    pub async fn set_open_files_limit(&self, limit: usize) {
        self.file_cache.set_capacity(limit).await;
    }

    /// Resolves and opens the file for the current context, applying `mode`
    /// on failure. `None` means "produce defaults": either the file name is
    /// empty, or the mode is [`MissingMode::Black`].
    async fn retrieve_file(&self, ctx: &Context, mode: MissingMode) -> Result<Retrieved<O>, EvalError> {
        let (file_name, frames) = {
            let config = self.config.read().await;
            (config.file_name.clone(), config.available_frames.clone())
        };
        if file_name.is_empty() {
            return Ok(None);
        }

        let resolved = ctx.substitute(&file_name);
        let err = match self.file_cache.get(&resolved).await {
            Ok(file) => return Ok(Some((file, resolved))),
            Err(err) => err,
        };

        match mode {
            MissingMode::Black => Ok(None),
            MissingMode::Hold if !frames.is_empty() => {
                let frame = ctx.frame().unwrap_or(1);
                // The nearest earlier available frame; the start of the
                // sequence if there is none.
                let idx = frames.partition_point(|f| *f < frame);
                let held = if idx > 0 { frames[idx - 1] } else { frames[0] };

                let mut scope = ctx.scope();
                scope.set_frame(held);
                let held_resolved = scope.substitute(&file_name);
                warn!(file = %resolved, held = %held_resolved, "holding to earlier frame");
                let file = self.file_cache.get(&held_resolved).await?;
                Ok(Some((file, held_resolved)))
            }
            _ => Err(err.into()),
        }
    }

    /// Folds the reader's input dependencies into `h`: the raw pattern, the
    /// context-resolved path, the frame when the pattern is animated, and the
    /// plain configuration values. The frame list only feeds the hash when
    /// the mode can consult it.
    async fn append_source(&self, ctx: &Context, h: &mut DependencyHash) {
        let config = self.config.read().await;
        h.append_str(&config.file_name);
        h.append_str(&ctx.substitute(&config.file_name));
        if has_frame_token(&config.file_name) {
            h.append_i32(ctx.frame().unwrap_or(1));
        }
        h.append_i32(config.refresh_count);
        h.append_i32(config.missing_mode as i32);
        if config.missing_mode != MissingMode::Error {
            h.append_usize(config.available_frames.len());
            for frame in &config.available_frames {
                h.append_i32(*frame);
            }
        }
    }

    async fn op_hash(&self, ctx: &Context, tag: &str) -> Digest {
        let mut h = DependencyHash::new();
        h.append_str(tag);
        self.append_source(ctx, &mut h).await;
        h.digest()
    }
}

#[async_trait]
impl<O: ImageOpener> ImageNode for ScanlineReader<O> {
    async fn format_hash(&self, ctx: &Context) -> Result<Digest, EvalError> {
        Ok(self.op_hash(ctx, "reader:format").await)
    }

    async fn format(&self, ctx: &Context) -> Result<Format, EvalError> {
        let hash = self.format_hash(ctx).await?;
        self.cache
            .formats
            .evaluate(hash, CachePolicy::Cached, || async move {
                // Black still matches the geometry of the held frame, so a
                // missing frame mid-sequence keeps a stable format.
                let mut mode = self.config.read().await.missing_mode;
                if mode == MissingMode::Black {
                    mode = MissingMode::Hold;
                }
                match self.retrieve_file(ctx, mode).await? {
                    Some((file, _)) => Ok(Format::new(file.shape().data_window())),
                    None => Ok(Format::default()),
                }
            })
            .await
    }

    async fn data_window_hash(&self, ctx: &Context) -> Result<Digest, EvalError> {
        Ok(self.op_hash(ctx, "reader:dataWindow").await)
    }

    async fn data_window(&self, ctx: &Context) -> Result<Box2i, EvalError> {
        let hash = self.data_window_hash(ctx).await?;
        self.cache
            .windows
            .evaluate(hash, CachePolicy::Cached, || async move {
                let mode = self.config.read().await.missing_mode;
                match self.retrieve_file(ctx, mode).await? {
                    Some((file, _)) => Ok(file.shape().data_window()),
                    None => Ok(Box2i::default()),
                }
            })
            .await
    }

    async fn deep_hash(&self, _ctx: &Context) -> Result<Digest, EvalError> {
        let mut h = DependencyHash::new();
        h.append_str("reader:deep");
        Ok(h.digest())
    }

    async fn deep(&self, _ctx: &Context) -> Result<bool, EvalError> {
        // Scanline sources are always flat.
        Ok(false)
    }

    async fn metadata_hash(&self, ctx: &Context) -> Result<Digest, EvalError> {
        Ok(self.op_hash(ctx, "reader:metadata").await)
    }

    async fn metadata(&self, _ctx: &Context) -> Result<Metadata, EvalError> {
        Ok(empty_metadata())
    }

    async fn channel_names_hash(&self, ctx: &Context) -> Result<Digest, EvalError> {
        Ok(self.op_hash(ctx, "reader:channelNames").await)
    }

    async fn channel_names(&self, ctx: &Context) -> Result<Arc<Vec<String>>, EvalError> {
        let hash = self.channel_names_hash(ctx).await?;
        self.cache
            .channel_names
            .evaluate(hash, CachePolicy::Cached, || async move {
                let mode = self.config.read().await.missing_mode;
                match self.retrieve_file(ctx, mode).await? {
                    Some((file, _)) => Ok(file.channel_names()),
                    None => Ok(Arc::new(Vec::new())),
                }
            })
            .await
    }

    async fn sample_offsets_hash(&self, _ctx: &Context, _tile_origin: V2i) -> Result<Digest, EvalError> {
        let mut h = DependencyHash::new();
        h.append_str("reader:sampleOffsets");
        Ok(h.digest())
    }

    async fn sample_offsets(&self, _ctx: &Context, _tile_origin: V2i) -> Result<SampleOffsets, EvalError> {
        Ok(flat_sample_offsets())
    }

    async fn channel_data_hash(
        &self,
        ctx: &Context,
        channel: &str,
        tile_origin: V2i,
    ) -> Result<Digest, EvalError> {
        let mut h = DependencyHash::new();
        h.append_str("reader:channelData");
        h.append_v2i(tile_origin);
        h.append_str(channel);
        self.append_source(ctx, &mut h).await;
        Ok(h.digest())
    }

    async fn channel_data(
        &self,
        ctx: &Context,
        channel: &str,
        tile_origin: V2i,
    ) -> Result<Tile, EvalError> {
        let hash = self.channel_data_hash(ctx, channel, tile_origin).await?;
        // The tile itself is not retained: it is a cheap view into the
        // batch, which carries the cache weight.
        self.cache
            .tiles
            .evaluate(hash, CachePolicy::Uncached, || async move {
                let mode = self.config.read().await.missing_mode;
                let Some((file, path)) = self.retrieve_file(ctx, mode).await? else {
                    return Ok(Tile::black());
                };

                let shape = file.shape();
                // Scanline space has row 0 at the top; display space at the
                // bottom.
                let flipped = V2i::new(tile_origin.x, shape.height - tile_origin.y - TILE_SIZE);
                let bound = tile_bound(flipped);
                let data_window = shape.data_window();
                if !data_window.intersects(&bound) {
                    return Err(RegionError::TileOutsideDataWindow {
                        tile_bound: bound,
                        data_window,
                    }
                    .into());
                }

                let (key, slot) = file.locate(channel, flipped)?;

                let mut h = DependencyHash::new();
                h.append_str("reader:batch");
                h.append_str(&path);
                h.append_i32(self.config.read().await.refresh_count);
                h.append_i32(key.row);
                h.append_usize(key.sub_image);
                let batch = self
                    .cache
                    .batches
                    .evaluate(h.digest(), CachePolicy::Cached, || async {
                        file.read_batch(key).await.map_err(EvalError::from)
                    })
                    .await?;

                Ok(batch.tile(slot).clone())
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::source::memory::{MemoryImageData, MemorySource};
    use crate::source::ImageShape;

    fn shape() -> ImageShape {
        ImageShape { width: 150, height: 128, channel_count: 1, sub_image_count: 1 }
    }

    fn reader_for(source: MemorySource, config: ReaderConfig) -> ScanlineReader<MemorySource> {
        ScanlineReader::new(
            config,
            Arc::new(FileHandleCache::new(source)),
            Arc::new(EvalCache::new()),
        )
    }

    fn single_image_reader() -> ScanlineReader<MemorySource> {
        let mut source = MemorySource::new();
        source.insert("img.mem", MemoryImageData::ramp(shape()));
        reader_for(
            source,
            ReaderConfig { file_name: "img.mem".to_string(), ..Default::default() },
        )
    }

    #[test]
    fn test_missing_mode_parsing() {
        assert_eq!("error".parse::<MissingMode>().unwrap(), MissingMode::Error);
        assert_eq!("black".parse::<MissingMode>().unwrap(), MissingMode::Black);
        assert_eq!("hold".parse::<MissingMode>().unwrap(), MissingMode::Hold);
        assert!(matches!(
            "missing".parse::<MissingMode>(),
            Err(ConfigError::InvalidMissingMode { .. })
        ));
    }

    #[tokio::test]
    async fn test_empty_file_name_yields_defaults() {
        let reader = reader_for(MemorySource::new(), ReaderConfig::default());
        let ctx = Context::new();

        assert_eq!(reader.format(&ctx).await.unwrap(), Format::default());
        assert_eq!(reader.data_window(&ctx).await.unwrap(), Box2i::default());
        assert!(reader.channel_names(&ctx).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_geometry_and_channels() {
        let reader = single_image_reader();
        let ctx = Context::new();

        let window = reader.data_window(&ctx).await.unwrap();
        assert_eq!(window, Box2i::new(V2i::new(0, 0), V2i::new(150, 128)));
        assert_eq!(reader.format(&ctx).await.unwrap().display_window, window);
        assert_eq!(*reader.channel_names(&ctx).await.unwrap(), vec!["Y".to_string()]);
        assert!(!reader.deep(&ctx).await.unwrap());
    }

    #[tokio::test]
    async fn test_channel_data_round_trip() {
        let reader = single_image_reader();
        let ctx = Context::new();

        // Tile (0, 0) in display space covers the bottom-left of the image;
        // its display row 0 is the last file row, 127.
        let tile = reader.channel_data(&ctx, "Y", V2i::new(0, 0)).await.unwrap();
        assert_eq!(tile[0], (127 * 150) as f32);
        assert_eq!(tile[1], (127 * 150 + 1) as f32);

        // One display row up is one file row earlier.
        assert_eq!(tile[64], (126 * 150) as f32);
    }

    #[tokio::test]
    async fn test_out_of_window_tile_is_an_error() {
        let reader = single_image_reader();
        let ctx = Context::new();

        let err = reader
            .channel_data(&ctx, "Y", V2i::new(256, 0))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EvalError::Region(RegionError::TileOutsideDataWindow { .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_file_error_mode() {
        let reader = reader_for(
            MemorySource::new(),
            ReaderConfig { file_name: "absent.mem".to_string(), ..Default::default() },
        );
        assert!(reader.data_window(&Context::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_missing_file_black_mode() {
        let reader = reader_for(
            MemorySource::new(),
            ReaderConfig {
                file_name: "absent.mem".to_string(),
                missing_mode: MissingMode::Black,
                ..Default::default()
            },
        );
        let ctx = Context::new();
        assert_eq!(reader.data_window(&ctx).await.unwrap(), Box2i::default());
        assert!(reader.channel_names(&ctx).await.unwrap().is_empty());
        assert!(reader
            .channel_data(&ctx, "Y", V2i::new(0, 0))
            .await
            .unwrap()
            .is_shared_black());
    }

    #[tokio::test]
    async fn test_hold_mode_falls_back_to_earlier_frame() {
        let mut source = MemorySource::new();
        source.insert("seq.1.mem", MemoryImageData::ramp(shape()));
        source.insert("seq.3.mem", MemoryImageData::ramp(shape()));
        let reader = reader_for(
            source,
            ReaderConfig {
                file_name: "seq.#.mem".to_string(),
                missing_mode: MissingMode::Hold,
                available_frames: vec![1, 3],
                ..Default::default()
            },
        );

        // Frame 5 is missing; the nearest earlier available frame is 3.
        let mut ctx = Context::new();
        ctx.set_frame(5);
        let window = reader.data_window(&ctx).await.unwrap();
        assert_eq!(window.size(), V2i::new(150, 128));

        // Before the sequence starts, hold to its first frame.
        let mut ctx = Context::new();
        ctx.set_frame(0);
        assert!(reader.data_window(&ctx).await.is_ok());
    }

    #[tokio::test]
    async fn test_new_available_frames_refresh_held_outputs() {
        let mut source = MemorySource::new();
        source.insert("seq.1.mem", MemoryImageData::ramp(shape()));
        source.insert(
            "seq.3.mem",
            MemoryImageData::ramp(ImageShape {
                width: 80,
                height: 128,
                channel_count: 1,
                sub_image_count: 1,
            }),
        );
        let reader = reader_for(
            source,
            ReaderConfig {
                file_name: "seq.#.mem".to_string(),
                missing_mode: MissingMode::Hold,
                available_frames: vec![1],
                ..Default::default()
            },
        );

        let mut ctx = Context::new();
        ctx.set_frame(5);
        assert_eq!(reader.data_window(&ctx).await.unwrap().size(), V2i::new(150, 128));

        // Registering a nearer frame moves the held file; the memoized
        // window for the same context must miss, not keep serving frame 1.
        reader.set_available_frames(vec![1, 3]).await;
        assert_eq!(reader.data_window(&ctx).await.unwrap().size(), V2i::new(80, 128));
    }

    #[tokio::test]
    async fn test_hold_mode_without_frames_propagates() {
        let reader = reader_for(
            MemorySource::new(),
            ReaderConfig {
                file_name: "seq.#.mem".to_string(),
                missing_mode: MissingMode::Hold,
                ..Default::default()
            },
        );
        let mut ctx = Context::new();
        ctx.set_frame(2);
        assert!(reader.data_window(&ctx).await.is_err());
    }

    #[tokio::test]
    async fn test_black_mode_format_matches_held_frame() {
        let mut source = MemorySource::new();
        source.insert("seq.1.mem", MemoryImageData::ramp(shape()));
        let reader = reader_for(
            source,
            ReaderConfig {
                file_name: "seq.#.mem".to_string(),
                missing_mode: MissingMode::Black,
                available_frames: vec![1],
                ..Default::default()
            },
        );

        let mut ctx = Context::new();
        ctx.set_frame(4);
        // The data window collapses for the missing frame...
        assert_eq!(reader.data_window(&ctx).await.unwrap(), Box2i::default());
        // ... but the format resolves like Hold, staying stable across the
        // sequence.
        assert_eq!(
            reader.format(&ctx).await.unwrap().display_window.size(),
            V2i::new(150, 128)
        );
    }

    #[tokio::test]
    async fn test_batches_are_shared_across_tiles() {
        let reader = single_image_reader();
        let ctx = Context::new();

        reader.channel_data(&ctx, "Y", V2i::new(0, 64)).await.unwrap();
        reader.channel_data(&ctx, "Y", V2i::new(64, 64)).await.unwrap();
        reader.channel_data(&ctx, "Y", V2i::new(128, 64)).await.unwrap();

        // One decode serves the whole band: one read per channel.
        assert_eq!(reader.file_cache.opener().read_count(), 1);
    }

    #[tokio::test]
    async fn test_refresh_count_reopens_files() {
        let reader = single_image_reader();
        let ctx = Context::new();

        reader.data_window(&ctx).await.unwrap();
        reader.set_refresh_count(1).await;
        reader.data_window(&ctx).await.unwrap();

        assert_eq!(reader.file_cache.opener().open_count(), 2);
    }

    #[tokio::test]
    async fn test_frame_token_changes_hash() {
        let reader = reader_for(
            MemorySource::new(),
            ReaderConfig { file_name: "seq.#.mem".to_string(), ..Default::default() },
        );

        let mut a = Context::new();
        a.set_frame(1);
        let mut b = Context::new();
        b.set_frame(2);

        assert_ne!(
            reader.data_window_hash(&a).await.unwrap(),
            reader.data_window_hash(&b).await.unwrap()
        );
    }
}
