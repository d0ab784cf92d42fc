//! Image nodes: the units of the evaluation graph.
//!
//! A node exposes one pair of operations per output kind: a cheap
//! dependency hash and the computation itself. Callers hash first and
//! consult the [`crate::memo::EvalCache`] before computing; two nodes whose
//! hashes agree produce the same value, so equal configurations share cache
//! entries no matter where they sit in the graph.
//!
//! Per-tile operations take the channel name and tile origin as explicit
//! arguments; nodes that delegate upstream under varied bindings push them
//! through an [`crate::context::EditableScope`].

pub mod assemble;
pub mod collect;
pub mod reader;

use std::sync::Arc;

use async_trait::async_trait;

use crate::context::Context;
use crate::error::EvalError;
use crate::geometry::{Box2i, V2i};
use crate::hash::Digest;
use crate::image::{Format, Metadata, SampleOffsets, Tile};

/// One image in the graph, evaluated lazily per output kind.
#[async_trait]
pub trait ImageNode: Send + Sync {
    async fn format_hash(&self, ctx: &Context) -> Result<Digest, EvalError>;
    async fn format(&self, ctx: &Context) -> Result<Format, EvalError>;

    async fn data_window_hash(&self, ctx: &Context) -> Result<Digest, EvalError>;
    async fn data_window(&self, ctx: &Context) -> Result<Box2i, EvalError>;

    async fn deep_hash(&self, ctx: &Context) -> Result<Digest, EvalError>;
    async fn deep(&self, ctx: &Context) -> Result<bool, EvalError>;

    async fn metadata_hash(&self, ctx: &Context) -> Result<Digest, EvalError>;
    async fn metadata(&self, ctx: &Context) -> Result<Metadata, EvalError>;

    async fn channel_names_hash(&self, ctx: &Context) -> Result<Digest, EvalError>;
    async fn channel_names(&self, ctx: &Context) -> Result<Arc<Vec<String>>, EvalError>;

    async fn sample_offsets_hash(&self, ctx: &Context, tile_origin: V2i) -> Result<Digest, EvalError>;
    async fn sample_offsets(&self, ctx: &Context, tile_origin: V2i) -> Result<SampleOffsets, EvalError>;

    async fn channel_data_hash(
        &self,
        ctx: &Context,
        channel: &str,
        tile_origin: V2i,
    ) -> Result<Digest, EvalError>;
    async fn channel_data(
        &self,
        ctx: &Context,
        channel: &str,
        tile_origin: V2i,
    ) -> Result<Tile, EvalError>;
}
