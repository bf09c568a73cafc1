//! LRU cache of compiled filters, keyed by raw expression.
//!
//! Compilation is cheap but not free, and subscription tails evaluate the
//! same expression per changelog entry; caching keeps hot expressions
//! resident. Filters with custom operators bypass the shared cache, since
//! registry identity is per-resource.

use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use super::{CompiledFilter, FilterError};

pub const DEFAULT_CACHE_CAPACITY: usize = 512;

pub struct FilterCache {
    inner: Mutex<LruCache<String, Arc<CompiledFilter>>>,
}

impl Default for FilterCache {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CACHE_CAPACITY)
    }
}

impl FilterCache {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("nonzero capacity");
        Self { inner: Mutex::new(LruCache::new(capacity)) }
    }

    pub fn get_or_compile(&self, raw: &str) -> Result<Arc<CompiledFilter>, FilterError> {
        {
            let mut cache = self.inner.lock().expect("filter cache poisoned");
            if let Some(hit) = cache.get(raw) {
                return Ok(hit.clone());
            }
        }
        // Compile outside the lock; a racing duplicate compile is harmless.
        let compiled = Arc::new(CompiledFilter::compile(raw)?);
        let mut cache = self.inner.lock().expect("filter cache poisoned");
        cache.put(raw.to_owned(), compiled.clone());
        Ok(compiled)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("filter cache poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
