use thiserror::Error;

use crate::geometry::{Box2i, V2i};

/// Errors raised while opening an image resource.
///
/// Open failures are recorded in the [`FileHandleCache`](crate::source::cache::FileHandleCache)
/// so that repeated requests for a broken path do not retry the open until
/// the cache is cleared.
#[derive(Debug, Clone, Error)]
pub enum OpenError {
    /// The resource could not be opened (missing, unreadable or corrupt).
    #[error("Could not open {path}: {reason}")]
    Open { path: String, reason: String },

    /// A scanline read against an already-open resource failed.
    #[error("Read error in {path}: {reason}")]
    Read { path: String, reason: String },
}

/// Errors related to channel identity and lookup.
#[derive(Debug, Clone, Error)]
pub enum ChannelError {
    /// A requested or configured channel is absent from a source.
    #[error("No channel '{channel}' in input for output channel '{destination}'")]
    MissingChannel {
        channel: String,
        destination: String,
    },

    /// A source contributed no channels at all.
    #[error("No source channels for output channel '{destination}'")]
    NoSourceChannels { destination: String },

    /// A channel name was requested that the file does not contain.
    #[error("File has no channel '{channel}'")]
    UnknownChannel { channel: String },
}

/// Cross-source validation failures when multiple sources are merged
/// pixel-for-pixel.
///
/// These indicate a structural mismatch that will not resolve on retry, so
/// they are fatal to the requesting evaluation.
#[derive(Debug, Clone, Error)]
pub enum ConsistencyError {
    /// Contributing sources disagree on flat/deep-ness.
    #[error("Input must be consistent, but it is sometimes deep")]
    DeepMismatch,

    /// Deep composition requires identical data windows.
    #[error("DataWindows on deep input must match. Received both {expected} and {actual}")]
    DataWindowMismatch { expected: Box2i, actual: Box2i },

    /// Per-tile deep sample counts disagree across sources.
    #[error("SampleOffsets on input must match at tile {tile_origin}")]
    SampleOffsetsMismatch { tile_origin: V2i },
}

/// A tile request landed outside the advertised data window.
#[derive(Debug, Clone, Error)]
pub enum RegionError {
    #[error("Invalid tile {tile_bound} not within data window {data_window}")]
    TileOutsideDataWindow {
        tile_bound: Box2i,
        data_window: Box2i,
    },
}

/// Configuration errors: unparseable entries and invalid enumerated options.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("Invalid missing-resource mode '{value}' (expected error, black or hold)")]
    InvalidMissingMode { value: String },

    #[error("Invalid channel entry '{entry}': {reason}")]
    InvalidChannelEntry { entry: String, reason: String },
}

/// Umbrella error for node evaluation.
///
/// All variants are `Clone` because a result computed once under the
/// single-flight discipline is broadcast to every concurrent waiter.
#[derive(Debug, Clone, Error)]
pub enum EvalError {
    #[error(transparent)]
    Open(#[from] OpenError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Consistency(#[from] ConsistencyError),

    #[error(transparent)]
    Region(#[from] RegionError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_error_carries_both_bounds() {
        let err = RegionError::TileOutsideDataWindow {
            tile_bound: Box2i::new(V2i::new(64, 64), V2i::new(128, 128)),
            data_window: Box2i::new(V2i::new(0, 0), V2i::new(50, 50)),
        };
        let msg = err.to_string();
        assert!(msg.contains("(64,64) -> (128,128)"));
        assert!(msg.contains("(0,0) -> (50,50)"));
    }

    #[test]
    fn test_eval_error_from_conversions() {
        let err: EvalError = ConsistencyError::DeepMismatch.into();
        assert!(matches!(err, EvalError::Consistency(_)));

        let err: EvalError = OpenError::Open {
            path: "m31.xisf".to_string(),
            reason: "no such file".to_string(),
        }
        .into();
        assert!(err.to_string().contains("m31.xisf"));
    }
}
