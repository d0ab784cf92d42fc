//! Assembles one image from many inputs via `"dest:source"` naming.
//!
//! Each input carries an enabled flag and a name of the form
//! `"dest:source"`: the destination channel it provides and the source
//! channel to read from it. Disabled inputs and names without a separator
//! are skipped. Unlike [`super::collect::CollectChannels`], assembly is
//! forgiving: a destination whose source channel does not exist yields the
//! black tile rather than an error, and no cross-input consistency checks
//! are made. Format, data window, metadata, deep flag and sample offsets
//! all forward from the first input.

use std::sync::Arc;

use async_trait::async_trait;

use super::ImageNode;
use crate::context::Context;
use crate::error::EvalError;
use crate::geometry::{Box2i, V2i};
use crate::hash::{DependencyHash, Digest};
use crate::image::{empty_metadata, flat_sample_offsets, Format, Metadata, SampleOffsets, Tile};
use crate::memo::{CachePolicy, EvalCache};

// =============================================================================
// ChannelMap
// =============================================================================

/// Where one destination channel comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMapEntry {
    pub source_index: usize,
    pub source_channel: String,
}

/// The resolved destination/source mapping, as parallel lists preserving
/// input order. Duplicate destinations are kept; lookup takes the last one,
/// so later inputs override earlier ones.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelMap {
    pub channel_names: Vec<String>,
    pub source_channels: Vec<String>,
    pub source_inputs: Vec<usize>,
}

impl ChannelMap {
    /// Resolves `(enabled, name)` pairs in order. Names split at the first
    /// `:`; the remainder is the source channel even if it contains further
    /// separators.
    pub fn resolve<'a>(entries: impl IntoIterator<Item = (bool, &'a str)>) -> Self {
        let mut map = ChannelMap::default();
        for (index, (enabled, name)) in entries.into_iter().enumerate() {
            if !enabled {
                continue;
            }
            let Some(split) = name.find(':') else {
                continue;
            };
            map.channel_names.push(name[..split].to_string());
            map.source_channels.push(name[split + 1..].to_string());
            map.source_inputs.push(index);
        }
        map
    }

    pub fn entry_for(&self, destination: &str) -> Option<ChannelMapEntry> {
        self.channel_names
            .iter()
            .rposition(|name| name == destination)
            .map(|i| ChannelMapEntry {
                source_index: self.source_inputs[i],
                source_channel: self.source_channels[i].clone(),
            })
    }
}

// =============================================================================
// AssembleChannels
// =============================================================================

pub struct AssembleInput {
    pub enabled: bool,
    /// `"dest:source"` mapping for this input.
    pub name: String,
    pub source: Arc<dyn ImageNode>,
}

pub struct AssembleChannels {
    inputs: Vec<AssembleInput>,
    cache: Arc<EvalCache>,
}

impl AssembleChannels {
    pub fn new(inputs: Vec<AssembleInput>, cache: Arc<EvalCache>) -> Self {
        Self { inputs, cache }
    }

    fn map_hash(&self) -> Digest {
        let mut h = DependencyHash::new();
        h.append_str("assemble:channelMap");
        for input in &self.inputs {
            h.append_bool(input.enabled);
            h.append_str(&input.name);
        }
        h.digest()
    }

    async fn channel_map(&self) -> Result<Arc<ChannelMap>, EvalError> {
        self.cache
            .channel_maps
            .evaluate(self.map_hash(), CachePolicy::Cached, || async {
                Ok(Arc::new(ChannelMap::resolve(
                    self.inputs.iter().map(|i| (i.enabled, i.name.as_str())),
                )))
            })
            .await
    }

    fn first_input(&self) -> Option<&Arc<dyn ImageNode>> {
        self.inputs.first().map(|i| &i.source)
    }

    fn default_hash(tag: &str) -> Digest {
        let mut h = DependencyHash::new();
        h.append_str(tag);
        h.digest()
    }
}

#[async_trait]
impl ImageNode for AssembleChannels {
    async fn format_hash(&self, ctx: &Context) -> Result<Digest, EvalError> {
        match self.first_input() {
            Some(input) => input.format_hash(ctx).await,
            None => Ok(Self::default_hash("assemble:format")),
        }
    }

    async fn format(&self, ctx: &Context) -> Result<Format, EvalError> {
        match self.first_input() {
            Some(input) => input.format(ctx).await,
            None => Ok(Format::default()),
        }
    }

    async fn data_window_hash(&self, ctx: &Context) -> Result<Digest, EvalError> {
        match self.first_input() {
            Some(input) => input.data_window_hash(ctx).await,
            None => Ok(Self::default_hash("assemble:dataWindow")),
        }
    }

    async fn data_window(&self, ctx: &Context) -> Result<Box2i, EvalError> {
        match self.first_input() {
            Some(input) => input.data_window(ctx).await,
            None => Ok(Box2i::default()),
        }
    }

    async fn deep_hash(&self, ctx: &Context) -> Result<Digest, EvalError> {
        match self.first_input() {
            Some(input) => input.deep_hash(ctx).await,
            None => Ok(Self::default_hash("assemble:deep")),
        }
    }

    async fn deep(&self, ctx: &Context) -> Result<bool, EvalError> {
        match self.first_input() {
            Some(input) => input.deep(ctx).await,
            None => Ok(false),
        }
    }

    async fn metadata_hash(&self, ctx: &Context) -> Result<Digest, EvalError> {
        match self.first_input() {
            Some(input) => input.metadata_hash(ctx).await,
            None => Ok(Self::default_hash("assemble:metadata")),
        }
    }

    async fn metadata(&self, ctx: &Context) -> Result<Metadata, EvalError> {
        match self.first_input() {
            Some(input) => input.metadata(ctx).await,
            None => Ok(empty_metadata()),
        }
    }

    async fn channel_names_hash(&self, _ctx: &Context) -> Result<Digest, EvalError> {
        let mut h = DependencyHash::new();
        h.append_str("assemble:channelNames");
        h.append_digest(&self.map_hash());
        Ok(h.digest())
    }

    async fn channel_names(&self, _ctx: &Context) -> Result<Arc<Vec<String>>, EvalError> {
        let map = self.channel_map().await?;
        Ok(Arc::new(map.channel_names.clone()))
    }

    async fn sample_offsets_hash(&self, ctx: &Context, tile_origin: V2i) -> Result<Digest, EvalError> {
        match self.first_input() {
            Some(input) => input.sample_offsets_hash(ctx, tile_origin).await,
            None => Ok(Self::default_hash("assemble:sampleOffsets")),
        }
    }

    async fn sample_offsets(&self, ctx: &Context, tile_origin: V2i) -> Result<SampleOffsets, EvalError> {
        match self.first_input() {
            Some(input) => input.sample_offsets(ctx, tile_origin).await,
            None => Ok(flat_sample_offsets()),
        }
    }

    async fn channel_data_hash(
        &self,
        ctx: &Context,
        channel: &str,
        tile_origin: V2i,
    ) -> Result<Digest, EvalError> {
        let mut h = DependencyHash::new();
        h.append_str("assemble:channelData");
        h.append_digest(&self.map_hash());
        h.append_str(channel);

        if let Some(entry) = self.channel_map().await?.entry_for(channel) {
            let input = &self.inputs[entry.source_index].source;
            let names = input.channel_names(ctx).await?;
            h.append_digest(&input.channel_names_hash(ctx).await?);
            if names.contains(&entry.source_channel) {
                h.append_digest(
                    &input
                        .channel_data_hash(ctx, &entry.source_channel, tile_origin)
                        .await?,
                );
            }
        }
        Ok(h.digest())
    }

    async fn channel_data(
        &self,
        ctx: &Context,
        channel: &str,
        tile_origin: V2i,
    ) -> Result<Tile, EvalError> {
        let Some(entry) = self.channel_map().await?.entry_for(channel) else {
            return Ok(Tile::black());
        };

        let input = &self.inputs[entry.source_index].source;
        let names = input.channel_names(ctx).await?;
        if !names.contains(&entry.source_channel) {
            // Assembly tolerates gaps; the destination just reads black.
            return Ok(Tile::black());
        }

        input.channel_data(ctx, &entry.source_channel, tile_origin).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::geometry::TILE_PIXELS;

    struct ConstNode {
        names: Vec<String>,
        window: Box2i,
        fill: f32,
    }

    impl ConstNode {
        fn new(names: &[&str], fill: f32) -> Arc<dyn ImageNode> {
            Arc::new(Self {
                names: names.iter().map(|n| n.to_string()).collect(),
                window: Box2i::new(V2i::new(0, 0), V2i::new(64, 64)),
                fill,
            })
        }

        fn hash(&self, tag: &str) -> Digest {
            let mut h = DependencyHash::new();
            h.append_str(tag);
            h.append_f32(self.fill);
            h.digest()
        }
    }

    #[async_trait]
    impl ImageNode for ConstNode {
        async fn format_hash(&self, _ctx: &Context) -> Result<Digest, EvalError> {
            Ok(self.hash("const:format"))
        }

        async fn format(&self, _ctx: &Context) -> Result<Format, EvalError> {
            Ok(Format::new(self.window))
        }

        async fn data_window_hash(&self, _ctx: &Context) -> Result<Digest, EvalError> {
            Ok(self.hash("const:dataWindow"))
        }

        async fn data_window(&self, _ctx: &Context) -> Result<Box2i, EvalError> {
            Ok(self.window)
        }

        async fn deep_hash(&self, _ctx: &Context) -> Result<Digest, EvalError> {
            Ok(self.hash("const:deep"))
        }

        async fn deep(&self, _ctx: &Context) -> Result<bool, EvalError> {
            Ok(false)
        }

        async fn metadata_hash(&self, _ctx: &Context) -> Result<Digest, EvalError> {
            Ok(self.hash("const:metadata"))
        }

        async fn metadata(&self, _ctx: &Context) -> Result<Metadata, EvalError> {
            Ok(empty_metadata())
        }

        async fn channel_names_hash(&self, _ctx: &Context) -> Result<Digest, EvalError> {
            Ok(self.hash("const:channelNames"))
        }

        async fn channel_names(&self, _ctx: &Context) -> Result<Arc<Vec<String>>, EvalError> {
            Ok(Arc::new(self.names.clone()))
        }

        async fn sample_offsets_hash(&self, _ctx: &Context, _tile_origin: V2i) -> Result<Digest, EvalError> {
            Ok(self.hash("const:sampleOffsets"))
        }

        async fn sample_offsets(&self, _ctx: &Context, _tile_origin: V2i) -> Result<SampleOffsets, EvalError> {
            Ok(flat_sample_offsets())
        }

        async fn channel_data_hash(
            &self,
            _ctx: &Context,
            channel: &str,
            tile_origin: V2i,
        ) -> Result<Digest, EvalError> {
            let mut h = DependencyHash::new();
            h.append_digest(&self.hash("const:channelData"));
            h.append_str(channel);
            h.append_v2i(tile_origin);
            Ok(h.digest())
        }

        async fn channel_data(
            &self,
            _ctx: &Context,
            _channel: &str,
            _tile_origin: V2i,
        ) -> Result<Tile, EvalError> {
            Ok(Tile::from_samples(vec![self.fill; TILE_PIXELS]))
        }
    }

    fn input(enabled: bool, name: &str, fill: f32) -> AssembleInput {
        AssembleInput {
            enabled,
            name: name.to_string(),
            source: ConstNode::new(&["Y"], fill),
        }
    }

    #[test]
    fn test_resolve_skips_disabled_and_unseparated() {
        let map = ChannelMap::resolve([
            (true, "R:Y"),
            (true, "G:Y"),
            (false, "B:Y"),
            (true, "plainName"),
        ]);
        assert_eq!(map.channel_names, vec!["R", "G"]);
        assert_eq!(map.source_channels, vec!["Y", "Y"]);
        assert_eq!(map.source_inputs, vec![0, 1]);
    }

    #[test]
    fn test_resolve_splits_at_first_separator() {
        let map = ChannelMap::resolve([(true, "deep:Z:alt")]);
        assert_eq!(map.channel_names, vec!["deep"]);
        assert_eq!(map.source_channels, vec!["Z:alt"]);
    }

    #[test]
    fn test_duplicate_destination_takes_the_last() {
        let map = ChannelMap::resolve([(true, "R:Y"), (true, "R:Z")]);
        assert_eq!(map.channel_names, vec!["R", "R"]);
        let entry = map.entry_for("R").unwrap();
        assert_eq!(entry.source_index, 1);
        assert_eq!(entry.source_channel, "Z");
    }

    #[tokio::test]
    async fn test_assembled_channel_names() {
        let node = AssembleChannels::new(
            vec![
                input(true, "R:Y", 0.1),
                input(true, "G:Y", 0.2),
                input(false, "B:Y", 0.3),
            ],
            Arc::new(EvalCache::new()),
        );
        let names = node.channel_names(&Context::new()).await.unwrap();
        assert_eq!(*names, vec!["R".to_string(), "G".to_string()]);
    }

    #[tokio::test]
    async fn test_channel_data_routes_by_map() {
        let node = AssembleChannels::new(
            vec![input(true, "R:Y", 0.25), input(true, "G:Y", 0.75)],
            Arc::new(EvalCache::new()),
        );
        let ctx = Context::new();

        let r = node.channel_data(&ctx, "R", V2i::new(0, 0)).await.unwrap();
        assert!(r.iter().all(|&s| s == 0.25));
        let g = node.channel_data(&ctx, "G", V2i::new(0, 0)).await.unwrap();
        assert!(g.iter().all(|&s| s == 0.75));
    }

    #[tokio::test]
    async fn test_unmapped_destination_is_black() {
        let node = AssembleChannels::new(vec![input(true, "R:Y", 1.0)], Arc::new(EvalCache::new()));
        let tile = node
            .channel_data(&Context::new(), "A", V2i::new(0, 0))
            .await
            .unwrap();
        assert!(tile.is_shared_black());
    }

    #[tokio::test]
    async fn test_missing_source_channel_is_black_not_an_error() {
        let node = AssembleChannels::new(
            vec![input(true, "R:A", 1.0)], // source only has "Y"
            Arc::new(EvalCache::new()),
        );
        let ctx = Context::new();

        // The destination is still advertised...
        let names = node.channel_names(&ctx).await.unwrap();
        assert_eq!(*names, vec!["R".to_string()]);
        // ... but reads as black.
        let tile = node.channel_data(&ctx, "R", V2i::new(0, 0)).await.unwrap();
        assert!(tile.is_shared_black());
    }

    #[tokio::test]
    async fn test_geometry_forwards_from_first_input() {
        let node = AssembleChannels::new(
            vec![input(true, "R:Y", 1.0), input(true, "G:Y", 2.0)],
            Arc::new(EvalCache::new()),
        );
        let ctx = Context::new();
        assert_eq!(
            node.data_window(&ctx).await.unwrap(),
            Box2i::new(V2i::new(0, 0), V2i::new(64, 64))
        );
        assert!(!node.deep(&ctx).await.unwrap());
    }

    #[tokio::test]
    async fn test_no_inputs_yield_defaults() {
        let node = AssembleChannels::new(Vec::new(), Arc::new(EvalCache::new()));
        let ctx = Context::new();
        assert_eq!(node.data_window(&ctx).await.unwrap(), Box2i::default());
        assert!(node.channel_names(&ctx).await.unwrap().is_empty());
    }
}
