//! Dependency hashing for cache invalidation.
//!
//! Every computed quantity in the engine is guarded by a [`Digest`] built
//! from its dependencies before the expensive computation runs. Two
//! computations with equal digests are assumed to produce identical results,
//! so the invariant is strict: all and only the actual inputs of a
//! computation must be appended. An omission causes stale-cache bugs; an
//! extra input causes needless cache misses.
//!
//! The accumulator is order-sensitive, and each append frames its value with
//! a type tag and (for variable-length data) a length, so
//! `append_str("ab"); append_str("c")` and `append_str("a"); append_str("bc")`
//! produce different digests.

use std::fmt;

use sha2::{Digest as _, Sha256};

use crate::geometry::{Box2i, V2i};

// =============================================================================
// Digest
// =============================================================================

/// The finished value of a [`DependencyHash`].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Digest([u8; 32]);

impl Digest {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The first eight hex digits are enough to tell digests apart in logs.
        write!(f, "Digest({})", &hex::encode(self.0)[..8])
    }
}

// =============================================================================
// DependencyHash
// =============================================================================

/// Order-sensitive, append-only accumulator over primitive values and nested
/// digests.
#[derive(Clone)]
pub struct DependencyHash {
    hasher: Sha256,
}

// Type tags keep adjacent appends of different kinds from colliding.
const TAG_STR: u8 = 1;
const TAG_I32: u8 = 2;
const TAG_F32: u8 = 3;
const TAG_BOOL: u8 = 4;
const TAG_V2I: u8 = 5;
const TAG_BOX: u8 = 6;
const TAG_USIZE: u8 = 7;
const TAG_DIGEST: u8 = 8;

impl DependencyHash {
    pub fn new() -> Self {
        Self {
            hasher: Sha256::new(),
        }
    }

    pub fn append_str(&mut self, value: &str) -> &mut Self {
        self.hasher.update([TAG_STR]);
        self.hasher.update((value.len() as u64).to_le_bytes());
        self.hasher.update(value.as_bytes());
        self
    }

    pub fn append_i32(&mut self, value: i32) -> &mut Self {
        self.hasher.update([TAG_I32]);
        self.hasher.update(value.to_le_bytes());
        self
    }

    pub fn append_f32(&mut self, value: f32) -> &mut Self {
        self.hasher.update([TAG_F32]);
        self.hasher.update(value.to_le_bytes());
        self
    }

    pub fn append_bool(&mut self, value: bool) -> &mut Self {
        self.hasher.update([TAG_BOOL, value as u8]);
        self
    }

    pub fn append_usize(&mut self, value: usize) -> &mut Self {
        self.hasher.update([TAG_USIZE]);
        self.hasher.update((value as u64).to_le_bytes());
        self
    }

    pub fn append_v2i(&mut self, value: V2i) -> &mut Self {
        self.hasher.update([TAG_V2I]);
        self.hasher.update(value.x.to_le_bytes());
        self.hasher.update(value.y.to_le_bytes());
        self
    }

    pub fn append_box(&mut self, value: &Box2i) -> &mut Self {
        self.hasher.update([TAG_BOX]);
        self.append_v2i(value.min);
        self.append_v2i(value.max);
        self
    }

    /// Folds another computation's finished digest into this one.
    pub fn append_digest(&mut self, value: &Digest) -> &mut Self {
        self.hasher.update([TAG_DIGEST]);
        self.hasher.update(value.as_bytes());
        self
    }

    pub fn digest(self) -> Digest {
        Digest(self.hasher.finalize().into())
    }
}

impl Default for DependencyHash {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest_of(build: impl FnOnce(&mut DependencyHash)) -> Digest {
        let mut h = DependencyHash::new();
        build(&mut h);
        h.digest()
    }

    #[test]
    fn test_equal_inputs_equal_digests() {
        let a = digest_of(|h| {
            h.append_str("m31.xisf").append_i32(7);
        });
        let b = digest_of(|h| {
            h.append_str("m31.xisf").append_i32(7);
        });
        assert_eq!(a, b);
    }

    #[test]
    fn test_order_sensitive() {
        let a = digest_of(|h| {
            h.append_i32(1).append_i32(2);
        });
        let b = digest_of(|h| {
            h.append_i32(2).append_i32(1);
        });
        assert_ne!(a, b);
    }

    #[test]
    fn test_string_boundaries_framed() {
        let a = digest_of(|h| {
            h.append_str("ab").append_str("c");
        });
        let b = digest_of(|h| {
            h.append_str("a").append_str("bc");
        });
        assert_ne!(a, b);
    }

    #[test]
    fn test_type_tags_distinguish_kinds() {
        let a = digest_of(|h| {
            h.append_i32(1);
        });
        let b = digest_of(|h| {
            h.append_bool(true);
        });
        assert_ne!(a, b);
    }

    #[test]
    fn test_nested_digest_changes_result() {
        let inner = digest_of(|h| {
            h.append_str("upstream");
        });
        let other = digest_of(|h| {
            h.append_str("different upstream");
        });
        let a = digest_of(|h| {
            h.append_digest(&inner);
        });
        let b = digest_of(|h| {
            h.append_digest(&other);
        });
        assert_ne!(a, b);
    }

    #[test]
    fn test_display_is_hex() {
        let d = digest_of(|h| {
            h.append_i32(0);
        });
        let s = d.to_string();
        assert_eq!(s.len(), 64);
        assert!(s.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
