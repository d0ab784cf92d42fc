//! Hash-keyed memoization with single-flight computation.
//!
//! Every value the engine produces is addressed by the [`Digest`] of its
//! inputs. A [`Memoizer`] holds recently computed values in an LRU cache and
//! collapses concurrent requests for the same digest into one computation:
//! the first caller becomes the leader and runs the work, later callers park
//! on a [`Notify`] and receive a clone of the leader's result, Ok or Err.
//! Failed computations are broadcast to waiters but never enter the cache,
//! so a transient failure is retried on the next request.

use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::trace;

use crate::error::EvalError;
use crate::geometry::Box2i;
use crate::hash::Digest;
use crate::image::{Format, Metadata, SampleOffsets, Tile};

/// How a computed value interacts with the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    /// Store the value under its digest; later requests hit the cache.
    Cached,
    /// Compute every time. Used by operations that immediately redirect
    /// into another cached computation and would only duplicate its
    /// storage.
    Uncached,
}

// =============================================================================
// In-flight computations
// =============================================================================

struct Flight<V, E> {
    notify: Notify,
    result: Mutex<Option<Result<V, E>>>,
}

impl<V, E> Flight<V, E> {
    fn new() -> Self {
        Self { notify: Notify::new(), result: Mutex::new(None) }
    }
}

// =============================================================================
// Memoizer
// =============================================================================

/// A digest-keyed cache of computed values.
pub struct Memoizer<V, E = EvalError> {
    cache: RwLock<LruCache<Digest, V>>,
    in_flight: Mutex<HashMap<Digest, Arc<Flight<V, E>>>>,
}

impl<V: Clone, E: Clone> Memoizer<V, E> {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: RwLock::new(LruCache::new(capacity)),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the value for `key`, computing it with `compute` on a miss.
    ///
    /// Concurrent calls with the same key share one computation regardless
    /// of policy; with [`CachePolicy::Uncached`] the result is simply not
    /// retained afterwards.
    pub async fn evaluate<F, Fut>(&self, key: Digest, policy: CachePolicy, compute: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if policy == CachePolicy::Cached {
            if let Some(value) = self.cache.write().await.get(&key) {
                trace!(%key, "cache hit");
                return Ok(value.clone());
            }
        }

        let flight = {
            let mut in_flight = self.in_flight.lock().await;
            if let Some(flight) = in_flight.get(&key) {
                Some(flight.clone())
            } else {
                // Recheck under the flight lock: the previous leader may
                // have finished between our cache probe and here.
                if policy == CachePolicy::Cached {
                    if let Some(value) = self.cache.write().await.get(&key) {
                        return Ok(value.clone());
                    }
                }
                in_flight.insert(key, Arc::new(Flight::new()));
                None
            }
        };

        match flight {
            Some(flight) => self.wait(&flight).await,
            None => self.lead(key, policy, compute).await,
        }
    }

    async fn wait(&self, flight: &Flight<V, E>) -> Result<V, E> {
        // Register interest before checking the result so a notification
        // issued in between is not lost.
        let notified = flight.notify.notified();
        if let Some(result) = flight.result.lock().await.clone() {
            return result;
        }
        notified.await;
        flight
            .result
            .lock()
            .await
            .clone()
            .unwrap_or_else(|| unreachable!("notified before result was stored"))
    }

    async fn lead<F, Fut>(&self, key: Digest, policy: CachePolicy, compute: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        trace!(%key, "computing");
        let result = compute().await;

        if policy == CachePolicy::Cached {
            if let Ok(value) = &result {
                self.cache.write().await.put(key, value.clone());
            }
        }

        let flight = self.in_flight.lock().await.remove(&key);
        if let Some(flight) = flight {
            *flight.result.lock().await = Some(result.clone());
            flight.notify.notify_waiters();
        }

        result
    }

    /// Drops every cached value. In-flight computations are unaffected.
    pub async fn clear(&self) {
        self.cache.write().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.cache.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.cache.read().await.is_empty()
    }
}

// =============================================================================
// Engine-wide caches
// =============================================================================

const VALUE_CACHE_CAPACITY: usize = 8192;
const BATCH_CACHE_CAPACITY: usize = 256;

/// One memoizer per result type produced by the node graph.
pub struct EvalCache {
    pub formats: Memoizer<Format>,
    pub windows: Memoizer<Box2i>,
    pub deep: Memoizer<bool>,
    pub metadata: Memoizer<Metadata>,
    pub channel_names: Memoizer<Arc<Vec<String>>>,
    pub channel_maps: Memoizer<Arc<crate::node::assemble::ChannelMap>>,
    pub sample_offsets: Memoizer<SampleOffsets>,
    pub tiles: Memoizer<Tile>,
    pub batches: Memoizer<crate::batch::TileBatch>,
}

impl EvalCache {
    pub fn new() -> Self {
        Self {
            formats: Memoizer::new(VALUE_CACHE_CAPACITY),
            windows: Memoizer::new(VALUE_CACHE_CAPACITY),
            deep: Memoizer::new(VALUE_CACHE_CAPACITY),
            metadata: Memoizer::new(VALUE_CACHE_CAPACITY),
            channel_names: Memoizer::new(VALUE_CACHE_CAPACITY),
            channel_maps: Memoizer::new(VALUE_CACHE_CAPACITY),
            sample_offsets: Memoizer::new(VALUE_CACHE_CAPACITY),
            tiles: Memoizer::new(VALUE_CACHE_CAPACITY),
            batches: Memoizer::new(BATCH_CACHE_CAPACITY),
        }
    }

    /// Drops every cached value across all result types.
    pub async fn clear(&self) {
        self.formats.clear().await;
        self.windows.clear().await;
        self.deep.clear().await;
        self.metadata.clear().await;
        self.channel_names.clear().await;
        self.channel_maps.clear().await;
        self.sample_offsets.clear().await;
        self.tiles.clear().await;
        self.batches.clear().await;
    }
}

impl Default for EvalCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::hash::DependencyHash;

    fn key(label: &str) -> Digest {
        let mut h = DependencyHash::new();
        h.append_str(label);
        h.digest()
    }

    #[tokio::test]
    async fn test_cached_value_computed_once() {
        let memo: Memoizer<i32, EvalError> = Memoizer::new(16);
        let calls = AtomicUsize::new(0);
        let calls = &calls;

        for _ in 0..3 {
            let value = memo
                .evaluate(key("a"), CachePolicy::Cached, || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(42)
                })
                .await
                .unwrap();
            assert_eq!(value, 42);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(memo.len().await, 1);
    }

    #[tokio::test]
    async fn test_uncached_recomputes() {
        let memo: Memoizer<i32, EvalError> = Memoizer::new(16);
        let calls = AtomicUsize::new(0);
        let calls = &calls;

        for _ in 0..3 {
            memo.evaluate(key("a"), CachePolicy::Uncached, || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(1)
            })
            .await
            .unwrap();
        }

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(memo.is_empty().await);
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let memo: Memoizer<i32, String> = Memoizer::new(16);
        let calls = AtomicUsize::new(0);
        let calls = &calls;

        let err = memo
            .evaluate(key("a"), CachePolicy::Cached, || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("boom".to_string())
            })
            .await
            .unwrap_err();
        assert_eq!(err, "boom");

        let value = memo
            .evaluate(key("a"), CachePolicy::Cached, || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(7)
            })
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_computation() {
        let memo: Arc<Memoizer<i32, String>> = Arc::new(Memoizer::new(16));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let memo = memo.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                memo.evaluate(key("shared"), CachePolicy::Cached, || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                    Ok(99)
                })
                .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 99);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_clear_forces_recompute() {
        let memo: Memoizer<i32, EvalError> = Memoizer::new(16);
        let calls = AtomicUsize::new(0);
        let calls = &calls;

        let compute = || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(5)
        };
        memo.evaluate(key("a"), CachePolicy::Cached, compute).await.unwrap();
        memo.clear().await;
        memo.evaluate(key("a"), CachePolicy::Cached, compute).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_lru_evicts_oldest() {
        let memo: Memoizer<i32, EvalError> = Memoizer::new(2);
        let calls = AtomicUsize::new(0);
        let calls = &calls;

        let eval = |label: &'static str| {
            memo.evaluate(key(label), CachePolicy::Cached, || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(0)
            })
        };

        eval("a").await.unwrap();
        eval("b").await.unwrap();
        eval("c").await.unwrap(); // evicts "a"
        eval("a").await.unwrap(); // miss

        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_touched_entries_survive_eviction() {
        let memo: Memoizer<i32, EvalError> = Memoizer::new(2);
        let calls = AtomicUsize::new(0);
        let calls = &calls;

        let eval = |label: &'static str| {
            memo.evaluate(key(label), CachePolicy::Cached, || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(0)
            })
        };

        eval("a").await.unwrap();
        eval("b").await.unwrap();
        eval("a").await.unwrap(); // hit, now the most recent
        eval("c").await.unwrap(); // evicts "b"

        eval("a").await.unwrap(); // hit
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        eval("b").await.unwrap(); // miss
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }
}
