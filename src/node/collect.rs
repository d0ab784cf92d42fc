//! Collects one input image into many channels by context variable.
//!
//! For each configured destination channel, the input is evaluated with the
//! channel variable bound to that destination; a graph upstream of the input
//! switches on the variable, so each destination can come from a different
//! file or processing branch. The inputs collected together must agree on
//! their deep flag and, when deep, on data windows and sample offsets.

use std::sync::Arc;

use async_trait::async_trait;

use super::ImageNode;
use crate::context::{Context, Value};
use crate::error::{ChannelError, ConsistencyError, EvalError};
use crate::geometry::{tile_bound, Box2i, V2i, TILE_PIXELS};
use crate::hash::{DependencyHash, Digest};
use crate::image::{
    check_sample_offsets_match, copy_region, empty_metadata, Format, Metadata, SampleOffsets, Tile,
};
use crate::memo::{CachePolicy, EvalCache};

/// Picks the source channel to read for one destination: the configured
/// name if the input has it, the input's first channel if no name is
/// configured, or nothing.
fn source_channel<'a>(requested: &'a str, channels: &'a [String]) -> Option<&'a str> {
    if requested.is_empty() {
        channels.first().map(|s| s.as_str())
    } else if channels.iter().any(|c| c == requested) {
        Some(requested)
    } else {
        None
    }
}

#[derive(Debug, Clone)]
pub struct CollectConfig {
    /// Destination channel names, in output order.
    pub channels: Vec<String>,
    /// Context variable the destination name is published under.
    pub channel_variable: String,
    /// Channel to read from the input; `${var}` substitutions apply, and
    /// empty means the input's first channel.
    pub source_channel: String,
}

impl Default for CollectConfig {
    fn default() -> Self {
        Self {
            channels: Vec::new(),
            channel_variable: "collect:channelName".to_string(),
            source_channel: String::new(),
        }
    }
}

pub struct CollectChannels {
    config: CollectConfig,
    input: Arc<dyn ImageNode>,
    cache: Arc<EvalCache>,
}

impl CollectChannels {
    pub fn new(config: CollectConfig, input: Arc<dyn ImageNode>, cache: Arc<EvalCache>) -> Self {
        Self { config, input, cache }
    }

    fn scoped(&self, ctx: &Context, destination: &str) -> Context {
        let mut scope = ctx.scope();
        scope.set(
            self.config.channel_variable.clone(),
            Value::String(destination.to_string()),
        );
        scope.context().clone()
    }

    /// The source channel resolved for one destination, per the input's
    /// channel names in that destination's scope.
    async fn resolved_source(&self, scoped: &Context) -> Result<Option<String>, EvalError> {
        let names = self.input.channel_names(scoped).await?;
        let requested = scoped.substitute(&self.config.source_channel);
        Ok(source_channel(&requested, &names).map(|s| s.to_string()))
    }
}

#[async_trait]
impl ImageNode for CollectChannels {
    async fn format_hash(&self, ctx: &Context) -> Result<Digest, EvalError> {
        match self.config.channels.first() {
            // Pass the first destination's hash through unchanged, so the
            // cache entry is shared with the input.
            Some(first) => self.input.format_hash(&self.scoped(ctx, first)).await,
            None => {
                let mut h = DependencyHash::new();
                h.append_str("collect:format");
                Ok(h.digest())
            }
        }
    }

    async fn format(&self, ctx: &Context) -> Result<Format, EvalError> {
        match self.config.channels.first() {
            Some(first) => self.input.format(&self.scoped(ctx, first)).await,
            None => Ok(Format::default()),
        }
    }

    async fn data_window_hash(&self, ctx: &Context) -> Result<Digest, EvalError> {
        let mut h = DependencyHash::new();
        h.append_str("collect:dataWindow");
        if let Some(first) = self.config.channels.first() {
            h.append_digest(&self.input.deep_hash(&self.scoped(ctx, first)).await?);
            for channel in &self.config.channels {
                let scoped = self.scoped(ctx, channel);
                h.append_str(&scoped.substitute(&self.config.source_channel));
                h.append_digest(&self.input.data_window_hash(&scoped).await?);
            }
        }
        Ok(h.digest())
    }

    async fn data_window(&self, ctx: &Context) -> Result<Box2i, EvalError> {
        let hash = self.data_window_hash(ctx).await?;
        self.cache
            .windows
            .evaluate(hash, CachePolicy::Cached, || async move {
                let Some(first) = self.config.channels.first() else {
                    return Ok(Box2i::default());
                };
                let deep = self.input.deep(&self.scoped(ctx, first)).await?;

                let mut window = Box2i::default();
                for (i, channel) in self.config.channels.iter().enumerate() {
                    let current = self.input.data_window(&self.scoped(ctx, channel)).await?;
                    if i == 0 || !deep {
                        window = window.union(&current);
                    } else if current != window {
                        return Err(ConsistencyError::DataWindowMismatch {
                            expected: window,
                            actual: current,
                        }
                        .into());
                    }
                }
                Ok(window)
            })
            .await
    }

    async fn deep_hash(&self, ctx: &Context) -> Result<Digest, EvalError> {
        let mut h = DependencyHash::new();
        h.append_str("collect:deep");
        for channel in &self.config.channels {
            let scoped = self.scoped(ctx, channel);
            h.append_str(&scoped.substitute(&self.config.source_channel));
            h.append_digest(&self.input.deep_hash(&scoped).await?);
        }
        Ok(h.digest())
    }

    async fn deep(&self, ctx: &Context) -> Result<bool, EvalError> {
        let hash = self.deep_hash(ctx).await?;
        self.cache
            .deep
            .evaluate(hash, CachePolicy::Cached, || async move {
                let mut out: Option<bool> = None;
                for channel in &self.config.channels {
                    let current = self.input.deep(&self.scoped(ctx, channel)).await?;
                    match out {
                        None => out = Some(current),
                        Some(deep) if deep != current => {
                            return Err(ConsistencyError::DeepMismatch.into());
                        }
                        Some(_) => {}
                    }
                }
                Ok(out.unwrap_or(false))
            })
            .await
    }

    async fn metadata_hash(&self, ctx: &Context) -> Result<Digest, EvalError> {
        match self.config.channels.first() {
            Some(first) => self.input.metadata_hash(&self.scoped(ctx, first)).await,
            None => {
                let mut h = DependencyHash::new();
                h.append_str("collect:metadata");
                Ok(h.digest())
            }
        }
    }

    async fn metadata(&self, ctx: &Context) -> Result<Metadata, EvalError> {
        match self.config.channels.first() {
            Some(first) => self.input.metadata(&self.scoped(ctx, first)).await,
            None => Ok(empty_metadata()),
        }
    }

    async fn channel_names_hash(&self, ctx: &Context) -> Result<Digest, EvalError> {
        let mut h = DependencyHash::new();
        h.append_str("collect:channelNames");
        for channel in &self.config.channels {
            let scoped = self.scoped(ctx, channel);
            h.append_str(channel);
            h.append_str(&scoped.substitute(&self.config.source_channel));
            h.append_digest(&self.input.channel_names_hash(&scoped).await?);
        }
        Ok(h.digest())
    }

    async fn channel_names(&self, ctx: &Context) -> Result<Arc<Vec<String>>, EvalError> {
        let hash = self.channel_names_hash(ctx).await?;
        self.cache
            .channel_names
            .evaluate(hash, CachePolicy::Cached, || async move {
                let mut names = Vec::with_capacity(self.config.channels.len());
                for channel in &self.config.channels {
                    let scoped = self.scoped(ctx, channel);
                    let source_names = self.input.channel_names(&scoped).await?;
                    if source_names.is_empty() {
                        return Err(ChannelError::NoSourceChannels {
                            destination: channel.clone(),
                        }
                        .into());
                    }
                    let requested = scoped.substitute(&self.config.source_channel);
                    if source_channel(&requested, &source_names).is_none() {
                        return Err(ChannelError::MissingChannel {
                            channel: requested,
                            destination: channel.clone(),
                        }
                        .into());
                    }
                    names.push(channel.clone());
                }
                Ok(Arc::new(names))
            })
            .await
    }

    async fn sample_offsets_hash(&self, ctx: &Context, tile_origin: V2i) -> Result<Digest, EvalError> {
        let mut h = DependencyHash::new();
        h.append_str("collect:sampleOffsets");
        h.append_v2i(tile_origin);
        for channel in &self.config.channels {
            let scoped = self.scoped(ctx, channel);
            h.append_str(&scoped.substitute(&self.config.source_channel));
            h.append_digest(&self.input.sample_offsets_hash(&scoped, tile_origin).await?);
        }
        Ok(h.digest())
    }

    async fn sample_offsets(&self, ctx: &Context, tile_origin: V2i) -> Result<SampleOffsets, EvalError> {
        let hash = self.sample_offsets_hash(ctx, tile_origin).await?;
        self.cache
            .sample_offsets
            .evaluate(hash, CachePolicy::Cached, || async move {
                let mut out: Option<SampleOffsets> = None;
                for channel in &self.config.channels {
                    let current = self
                        .input
                        .sample_offsets(&self.scoped(ctx, channel), tile_origin)
                        .await?;
                    match &out {
                        None => out = Some(current),
                        Some(expected) => {
                            check_sample_offsets_match(expected, &current, tile_origin)?;
                        }
                    }
                }
                Ok(out.unwrap_or_else(crate::image::flat_sample_offsets))
            })
            .await
    }

    async fn channel_data_hash(
        &self,
        ctx: &Context,
        channel: &str,
        tile_origin: V2i,
    ) -> Result<Digest, EvalError> {
        let scoped = self.scoped(ctx, channel);
        let source = self.resolved_source(&scoped).await?.unwrap_or_default();

        let deep = self.input.deep(&scoped).await?;
        let window = self.input.data_window(&scoped).await?;
        let bound = tile_bound(tile_origin);
        let valid = bound.intersection(&window);

        let input_hash = self.input.channel_data_hash(&scoped, &source, tile_origin).await?;
        if valid == bound || deep {
            // Whole-tile passthrough shares the input's cache entry.
            return Ok(input_hash);
        }

        let mut h = DependencyHash::new();
        h.append_str("collect:channelData");
        if !valid.is_empty() {
            h.append_digest(&input_hash);
            h.append_box(&valid);
        }
        Ok(h.digest())
    }

    async fn channel_data(
        &self,
        ctx: &Context,
        channel: &str,
        tile_origin: V2i,
    ) -> Result<Tile, EvalError> {
        let scoped = self.scoped(ctx, channel);
        let source = self.resolved_source(&scoped).await?.unwrap_or_default();

        let deep = self.input.deep(&scoped).await?;
        let window = self.input.data_window(&scoped).await?;
        let bound = tile_bound(tile_origin);
        let valid = bound.intersection(&window);

        // Whole-tile passthrough shares the input's hash, so it must not
        // enter the tile memoizer: with a shared cache the input evaluates
        // under the same key, and a second flight on a key joins the first.
        if valid == bound || deep {
            return self.input.channel_data(&scoped, &source, tile_origin).await;
        }
        if valid.is_empty() {
            return Ok(Tile::black());
        }

        let hash = self.channel_data_hash(ctx, channel, tile_origin).await?;
        self.cache
            .tiles
            .evaluate(hash, CachePolicy::Cached, || async move {
                let tile = self.input.channel_data(&scoped, &source, tile_origin).await?;

                // Partial overlap: zero outside the input's data window.
                let mut samples = vec![0.0f32; TILE_PIXELS];
                copy_region(&tile, bound, valid, &mut samples, bound);
                Ok(Tile::from_samples(samples))
            })
            .await
    }
}
