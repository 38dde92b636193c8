//! Loader configuration.
//!
//! Named-constructor plus builder style: `no_batching()`/`no_caching()`
//! constructors alongside `Default` and file loading.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::LoaderError;

/// A key-normalization function applied before any cache or buffer
/// operation. Identity is used if none is configured.
pub type CacheKeyResolver<K> = Arc<dyn Fn(&K) -> K + Send + Sync>;

/// Configuration for a [`crate::loader::LoaderCore`].
///
/// Construction ergonomics only (`Default`, named constructors, a builder,
/// and file loading) — none of these change a field's runtime meaning.
#[derive(Clone)]
pub struct LoaderOptions<K> {
    /// Maximum cache entries. `<= 0` disables caching entirely.
    pub cache_size: i64,
    /// Per-entry idle-eviction window. Zero disables expiration.
    pub sliding_expiration: Duration,
    /// Key normalization applied before cache/buffer lookups.
    pub cache_key_resolver: Option<CacheKeyResolver<K>>,
    /// Skip all cache interactions.
    pub disable_caching: bool,
    /// Dispatch every `load` as its own one-key fetch.
    pub disable_batching: bool,
    /// Max keys per `fetch` call. `0` means one call per dispatch
    /// (unbounded).
    pub max_batch_size: usize,
    /// Inter-dispatch sleep in the background loop.
    pub batch_request_delay: Duration,
}

impl<K> fmt::Debug for LoaderOptions<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoaderOptions")
            .field("cache_size", &self.cache_size)
            .field("sliding_expiration", &self.sliding_expiration)
            .field("cache_key_resolver", &self.cache_key_resolver.is_some())
            .field("disable_caching", &self.disable_caching)
            .field("disable_batching", &self.disable_batching)
            .field("max_batch_size", &self.max_batch_size)
            .field("batch_request_delay", &self.batch_request_delay)
            .finish()
    }
}

/// Default cache capacity when none is configured: small and positive.
const DEFAULT_CACHE_SIZE: i64 = 1_000;

impl<K> Default for LoaderOptions<K> {
    fn default() -> Self {
        Self {
            cache_size: DEFAULT_CACHE_SIZE,
            sliding_expiration: Duration::ZERO,
            cache_key_resolver: None,
            disable_caching: false,
            disable_batching: false,
            max_batch_size: 0,
            batch_request_delay: Duration::ZERO,
        }
    }
}

impl<K> LoaderOptions<K> {
    /// Options with batching disabled: every `load` dispatches its own
    /// single-key fetch.
    pub fn no_batching() -> Self {
        Self {
            disable_batching: true,
            ..Default::default()
        }
    }

    /// Options with caching disabled: no memoization across loads.
    pub fn no_caching() -> Self {
        Self {
            disable_caching: true,
            ..Default::default()
        }
    }

    /// Start building options from the in-code defaults.
    pub fn builder() -> LoaderOptionsBuilder<K> {
        LoaderOptionsBuilder::default()
    }

    /// Load the simple (non-function) fields from a JSON file, falling
    /// back to `Default` for any field the file omits. `cache_key_resolver`
    /// is never file-configurable and stays `None`.
    pub fn from_file(path: &str) -> Result<Self, LoaderError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| LoaderError::InvalidArgument(format!("reading {path}: {e}")))?;
        let file: LoaderOptionsFile = serde_json::from_str(&contents)
            .map_err(|e| LoaderError::InvalidArgument(format!("parsing {path}: {e}")))?;
        Ok(file.into_options())
    }
}

/// The JSON-serializable subset of [`LoaderOptions`] (everything but the
/// key-resolver closure, which is code-only).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct LoaderOptionsFile {
    cache_size: i64,
    sliding_expiration_ms: u64,
    disable_caching: bool,
    disable_batching: bool,
    max_batch_size: usize,
    batch_request_delay_ms: u64,
}

impl Default for LoaderOptionsFile {
    fn default() -> Self {
        let defaults: LoaderOptions<()> = LoaderOptions::default();
        Self {
            cache_size: defaults.cache_size,
            sliding_expiration_ms: defaults.sliding_expiration.as_millis() as u64,
            disable_caching: defaults.disable_caching,
            disable_batching: defaults.disable_batching,
            max_batch_size: defaults.max_batch_size,
            batch_request_delay_ms: defaults.batch_request_delay.as_millis() as u64,
        }
    }
}

impl LoaderOptionsFile {
    fn into_options<K>(self) -> LoaderOptions<K> {
        LoaderOptions {
            cache_size: self.cache_size,
            sliding_expiration: Duration::from_millis(self.sliding_expiration_ms),
            cache_key_resolver: None,
            disable_caching: self.disable_caching,
            disable_batching: self.disable_batching,
            max_batch_size: self.max_batch_size,
            batch_request_delay: Duration::from_millis(self.batch_request_delay_ms),
        }
    }
}

/// Builder for [`LoaderOptions`].
#[derive(Clone)]
pub struct LoaderOptionsBuilder<K> {
    options: LoaderOptions<K>,
}

impl<K> Default for LoaderOptionsBuilder<K> {
    fn default() -> Self {
        Self {
            options: LoaderOptions::default(),
        }
    }
}

impl<K> LoaderOptionsBuilder<K> {
    /// Set the maximum cache entries.
    pub fn cache_size(mut self, cache_size: i64) -> Self {
        self.options.cache_size = cache_size;
        self
    }

    /// Set the idle-eviction window.
    pub fn sliding_expiration(mut self, sliding_expiration: Duration) -> Self {
        self.options.sliding_expiration = sliding_expiration;
        self
    }

    /// Set the key-normalization function.
    pub fn cache_key_resolver<F>(mut self, resolver: F) -> Self
    where
        F: Fn(&K) -> K + Send + Sync + 'static,
    {
        self.options.cache_key_resolver = Some(Arc::new(resolver));
        self
    }

    /// Disable caching.
    pub fn disable_caching(mut self, disable: bool) -> Self {
        self.options.disable_caching = disable;
        self
    }

    /// Disable batching.
    pub fn disable_batching(mut self, disable: bool) -> Self {
        self.options.disable_batching = disable;
        self
    }

    /// Set the maximum keys per `fetch` call.
    pub fn max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.options.max_batch_size = max_batch_size;
        self
    }

    /// Set the inter-dispatch sleep in the background loop.
    pub fn batch_request_delay(mut self, delay: Duration) -> Self {
        self.options.batch_request_delay = delay;
        self
    }

    /// Build the final [`LoaderOptions`].
    pub fn build(self) -> LoaderOptions<K> {
        self.options
    }
}
