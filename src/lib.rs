//! Tiled, memoized evaluation engine for astronomical image graphs.
//!
//! Images are computed lazily as 64×64 tiles by a graph of [`node::ImageNode`]s,
//! with every result guarded by a content hash of its inputs: callers hash
//! first, and the [`memo::EvalCache`] returns a previously computed value
//! whenever the hashes agree. Scanline files are decoded in full-width bands
//! and re-batched into tiles ([`batch`]), with open file handles kept in an
//! LRU cache ([`source::cache`]).
//!
//! Three node kinds cover the ingest pipeline:
//! - [`node::reader::ScanlineReader`] serves tiles from files resolved per
//!   context, with configurable missing-frame handling;
//! - [`node::collect::CollectChannels`] fans one input out into many
//!   channels via a context variable, enforcing deep/window/sample-offset
//!   consistency;
//! - [`node::assemble::AssembleChannels`] merges many inputs under a
//!   `"dest:source"` naming convention, forgivingly.

pub mod batch;
pub mod context;
pub mod error;
pub mod geometry;
pub mod hash;
pub mod image;
pub mod memo;
pub mod node;
pub mod source;

pub use context::{Context, EditableScope, Value};
pub use error::EvalError;
pub use geometry::{Box2i, V2i, TILE_SIZE};
pub use hash::{DependencyHash, Digest};
pub use image::{Format, Tile};
pub use memo::{CachePolicy, EvalCache};
pub use node::ImageNode;
