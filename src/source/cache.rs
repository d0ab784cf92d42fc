//! LRU cache of opened image files.
//!
//! Opening an astronomical image means parsing headers and building the
//! batch geometry, so handles are kept and reused across evaluations. Open
//! *failures* are cached too: a path that failed once keeps failing without
//! touching the filesystem again, until the cache is cleared. Concurrent
//! requests for one path share a single open attempt.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::{debug, warn};

use super::ImageOpener;
use crate::batch::ImageFile;
use crate::error::OpenError;

/// Default number of open handles kept.
pub const DEFAULT_OPEN_FILES_CAPACITY: usize = 200;

/// A cache entry: an opened file, or the error that opening produced.
pub type FileCacheEntry<H> = Result<Arc<ImageFile<H>>, OpenError>;

struct OpenFlight<H> {
    notify: Notify,
    result: Mutex<Option<FileCacheEntry<H>>>,
}

/// Keyed by resolved path; callers substitute context variables and frame
/// tokens before looking up.
pub struct FileHandleCache<O: ImageOpener> {
    opener: O,
    cache: RwLock<LruCache<String, FileCacheEntry<O::Image>>>,
    in_flight: Mutex<HashMap<String, Arc<OpenFlight<O::Image>>>>,
}

impl<O: ImageOpener> FileHandleCache<O> {
    pub fn new(opener: O) -> Self {
        Self::with_capacity(opener, DEFAULT_OPEN_FILES_CAPACITY)
    }

    pub fn with_capacity(opener: O, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            opener,
            cache: RwLock::new(LruCache::new(capacity)),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the cached open result for `path`, opening on a miss.
    pub async fn get(&self, path: &str) -> FileCacheEntry<O::Image> {
        if let Some(entry) = self.cache.write().await.get(path) {
            return entry.clone();
        }

        let flight = {
            let mut in_flight = self.in_flight.lock().await;
            if let Some(flight) = in_flight.get(path) {
                Some(flight.clone())
            } else {
                if let Some(entry) = self.cache.write().await.get(path) {
                    return entry.clone();
                }
                in_flight.insert(
                    path.to_string(),
                    Arc::new(OpenFlight { notify: Notify::new(), result: Mutex::new(None) }),
                );
                None
            }
        };

        if let Some(flight) = flight {
            let notified = flight.notify.notified();
            if let Some(entry) = flight.result.lock().await.clone() {
                return entry;
            }
            notified.await;
            return flight
                .result
                .lock()
                .await
                .clone()
                .unwrap_or_else(|| unreachable!("notified before open result was stored"));
        }

        debug!(path, "opening image file");
        let entry = match self.opener.open(path).await {
            Ok(image) => Ok(Arc::new(ImageFile::new(image))),
            Err(err) => {
                warn!(path, error = %err, "open failed");
                Err(err)
            }
        };
        self.cache.write().await.put(path.to_string(), entry.clone());

        let flight = self.in_flight.lock().await.remove(path);
        if let Some(flight) = flight {
            *flight.result.lock().await = Some(entry.clone());
            flight.notify.notify_waiters();
        }

        entry
    }

    pub fn opener(&self) -> &O {
        &self.opener
    }

    /// Drops every cached handle and recorded failure.
    pub async fn clear(&self) {
        self.cache.write().await.clear();
    }

    pub async fn capacity(&self) -> usize {
        self.cache.read().await.cap().get()
    }

    /// Resizes the cache, evicting least-recently-used handles as needed.
    pub async fn set_capacity(&self, capacity: usize) {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        self.cache.write().await.resize(capacity);
    }
}
