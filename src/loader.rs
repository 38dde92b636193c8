//! The request-coalescing loader core.
//!
//! Orchestrates [`crate::cache::TaskCache`] and [`crate::pending::PendingBuffer`]
//! around a user-supplied batch fetch function, exposing `load`/`load_many`/
//! `set`/`remove`/`clear`/`dispatch_batch` plus an optional background
//! dispatch loop.

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::cache::TaskCache;
use crate::error::{LoadResult, LoaderError};
use crate::options::LoaderOptions;
use crate::pending::PendingBuffer;
use crate::promise::Promise;

/// The error type a [`BatchFetcher`] may report, either for the whole batch
/// call or for an individual key's position.
pub type FetchError = Box<dyn std::error::Error + Send + Sync>;

/// The user-supplied batch fetch function, generalized as a trait so it can
/// be held behind `Arc<dyn BatchFetcher<K, V>>`.
///
/// Returning `Err` from `fetch` fails every key in `keys` with
/// [`LoaderError::FetchFailure`]. Returning `Ok(results)` settles each key
/// positionally with `results[i]`; a `results` shorter than `keys` settles
/// the remaining positions with [`LoaderError::BatchShapeMismatch`], and a
/// longer `results` has its extra entries ignored.
#[async_trait]
pub trait BatchFetcher<K, V>: Send + Sync
where
    K: Send + Sync,
    V: Send + Sync,
{
    /// Fetch values for `keys`, returning one `Result` per key in the same
    /// order.
    async fn fetch(&self, keys: &[K]) -> Result<Vec<Result<V, FetchError>>, FetchError>;
}

/// Adapts an `async` closure `Fn(Vec<K>) -> Result<Vec<Result<V, FetchError>>, FetchError>`
/// into a [`BatchFetcher`].
pub struct FnFetcher<K, V, F, Fut>
where
    F: Fn(Vec<K>) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Vec<Result<V, FetchError>>, FetchError>> + Send,
{
    func: F,
    _marker: std::marker::PhantomData<fn(K) -> (V, Fut)>,
}

impl<K, V, F, Fut> FnFetcher<K, V, F, Fut>
where
    F: Fn(Vec<K>) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Vec<Result<V, FetchError>>, FetchError>> + Send,
{
    /// Wrap `func` as a [`BatchFetcher`].
    pub fn new(func: F) -> Self {
        Self {
            func,
            _marker: std::marker::PhantomData,
        }
    }
}

#[async_trait]
impl<K, V, F, Fut> BatchFetcher<K, V> for FnFetcher<K, V, F, Fut>
where
    K: Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
    F: Fn(Vec<K>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Vec<Result<V, FetchError>>, FetchError>> + Send + 'static,
{
    async fn fetch(&self, keys: &[K]) -> Result<Vec<Result<V, FetchError>>, FetchError> {
        (self.func)(keys.to_vec()).await
    }
}

/// Point-in-time cache statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    /// Current number of cached entries.
    pub size: u64,
    /// Configured cache capacity (`0` when caching is disabled).
    pub capacity: u64,
    /// Whether caching is enabled at all.
    pub enabled: bool,
}

/// The request-coalescing loader.
///
/// Construct with [`LoaderCore::new`], optionally [`LoaderCore::start`] the
/// background dispatch loop, and call [`LoaderCore::load`] /
/// [`LoaderCore::load_many`] from any number of concurrent tasks.
pub struct LoaderCore<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + Debug + 'static,
    V: Clone + Send + Sync + 'static,
{
    fetcher: Arc<dyn BatchFetcher<K, V>>,
    cache: TaskCache<K, Promise<LoadResult<V>>>,
    pending: SyncMutex<PendingBuffer<K, Promise<LoadResult<V>>>>,
    options: LoaderOptions<K>,
    disposed: AtomicBool,
    stop_flag: AtomicBool,
    stop_notify: Notify,
    dispatcher_handle: SyncMutex<Option<JoinHandle<()>>>,
}

impl<K, V> LoaderCore<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + Debug + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Construct a new loader around `fetcher`, ready to `load` immediately.
    /// The background dispatch loop is not started automatically; call
    /// [`LoaderCore::start`] to enable time-based coalescing, or rely on
    /// explicit [`LoaderCore::dispatch_batch`] calls.
    pub fn new(fetcher: Arc<dyn BatchFetcher<K, V>>, options: LoaderOptions<K>) -> Arc<Self> {
        let capacity = if options.disable_caching {
            0
        } else {
            options.cache_size
        };
        let cache = TaskCache::new(capacity, options.sliding_expiration);

        Arc::new(Self {
            fetcher,
            cache,
            pending: SyncMutex::new(PendingBuffer::new()),
            options,
            disposed: AtomicBool::new(false),
            stop_flag: AtomicBool::new(false),
            stop_notify: Notify::new(),
            dispatcher_handle: SyncMutex::new(None),
        })
    }

    fn ensure_not_disposed(&self) -> Result<(), LoaderError> {
        if self.disposed.load(Ordering::Acquire) {
            Err(LoaderError::InvalidState(
                "operation attempted on a disposed loader".to_string(),
            ))
        } else {
            Ok(())
        }
    }

    fn resolve_key(&self, key: &K) -> K {
        match &self.options.cache_key_resolver {
            Some(resolver) => resolver(key),
            None => key.clone(),
        }
    }

    /// Load a single value by key.
    ///
    /// Resolves the key, returns a cached future on hit, otherwise creates
    /// a promise, enqueues it (or dispatches it immediately when batching
    /// is disabled), caches it, and awaits its settlement.
    pub async fn load(&self, key: K) -> LoadResult<V> {
        if let Err(e) = self.ensure_not_disposed() {
            return Err(e);
        }

        let resolved = self.resolve_key(&key);

        if let Some(promise) = self.cache.get(&resolved).await {
            return promise.future().await;
        }

        let promise: Promise<LoadResult<V>> = Promise::new();

        let promise = if self.options.disable_batching {
            self.dispatch_single(resolved.clone(), promise.clone());
            promise
        } else {
            let mut pending = self.pending.lock();
            if pending.try_add(resolved.clone(), promise.clone()) {
                log::debug!("enqueued {resolved:?} for next dispatch");
                promise
            } else {
                pending
                    .get(&resolved)
                    .cloned()
                    .expect("try_add just reported this key present")
            }
        };

        self.cache.set(resolved, promise.clone()).await;

        promise.future().await
    }

    /// Load multiple values by key, invoking [`LoaderCore::load`] on each in
    /// input order and returning once all have settled, in input order.
    ///
    /// Requires a non-empty `keys`; an empty sequence is an
    /// [`LoaderError::InvalidArgument`].
    pub async fn load_many(&self, keys: Vec<K>) -> Result<Vec<LoadResult<V>>, LoaderError> {
        self.ensure_not_disposed()?;
        if keys.is_empty() {
            return Err(LoaderError::InvalidArgument(
                "load_many requires at least one key".to_string(),
            ));
        }

        // Driving every `load` future concurrently (rather than awaiting
        // them one at a time) is what lets keys issued "in quick
        // succession" land in the same dispatch: each future runs up to
        // its first await point — the pending-buffer enqueue — before any
        // of them block on settlement.
        let results = futures::future::join_all(keys.into_iter().map(|k| self.load(k))).await;
        Ok(results)
    }

    /// Cache `promise` under `key` only if `key` is not already cached;
    /// otherwise a no-op. Atomic with respect to concurrent `set`/`load`
    /// calls racing the same key.
    pub async fn set(&self, key: K, promise: Promise<LoadResult<V>>) -> Result<(), LoaderError> {
        self.ensure_not_disposed()?;
        let resolved = self.resolve_key(&key);
        self.cache
            .get_or_insert_with(resolved, async move { promise })
            .await;
        Ok(())
    }

    /// Seed the cache with an already-known value, as if it had been
    /// fetched. A convenience built on [`LoaderCore::set`] with a
    /// pre-settled promise — a no-op if `key` is already cached.
    pub async fn prime(&self, key: K, value: LoadResult<V>) -> Result<(), LoaderError> {
        let promise = Promise::new();
        let _ = promise.set(value);
        self.set(key, promise).await
    }

    /// Remove `key` from the cache if present. The next `load` for this key
    /// triggers a fresh fetch.
    pub async fn remove(&self, key: &K) -> Result<(), LoaderError> {
        self.ensure_not_disposed()?;
        let resolved = self.resolve_key(key);
        self.cache.remove(&resolved).await;
        Ok(())
    }

    /// Drop every cached entry.
    pub async fn clear(&self) -> Result<(), LoaderError> {
        self.ensure_not_disposed()?;
        self.cache.clear().await;
        Ok(())
    }

    /// Current cache statistics.
    pub async fn cache_stats(&self) -> CacheStats {
        CacheStats {
            size: self.cache.len().await,
            capacity: if self.options.disable_caching {
                0
            } else {
                self.options.cache_size.max(0) as u64
            },
            enabled: self.cache.is_enabled(),
        }
    }

    /// If the pending buffer is non-empty, atomically swap it out and issue
    /// one or more `fetch` calls (chunked by `MaxBatchSize`), settling every
    /// promise in the swapped-out buffer.
    ///
    /// The core mutex guards only the emptiness check and the swap; `fetch`
    /// runs after the guard is released, so concurrent `load` calls are
    /// never blocked behind an in-flight fetch.
    pub async fn dispatch_batch(&self) -> Result<(), LoaderError> {
        self.ensure_not_disposed()?;

        let drained = {
            let mut pending = self.pending.lock();
            if pending.is_empty() {
                return Ok(());
            }
            pending.drain()
        };

        log::debug!("dispatching {} pending key(s)", drained.len());

        let chunk_size = if self.options.max_batch_size == 0 {
            drained.len()
        } else {
            self.options.max_batch_size
        };

        for chunk in drained.chunks(chunk_size) {
            let keys: Vec<K> = chunk.iter().map(|(k, _)| k.clone()).collect();
            self.fetch_and_settle(&keys, chunk).await;
        }

        Ok(())
    }

    async fn fetch_and_settle(&self, keys: &[K], chunk: &[(K, Promise<LoadResult<V>>)]) {
        match self.fetcher.fetch(keys).await {
            Ok(results) => {
                let expected = keys.len();
                let actual = results.len();
                if actual != expected {
                    log::warn!(
                        "fetch returned {actual} result(s) for {expected} key(s); \
                         missing positions settle as BatchShapeMismatch"
                    );
                }
                let mut results = results.into_iter();
                for (_, promise) in chunk {
                    let outcome = match results.next() {
                        Some(Ok(value)) => Ok(value),
                        Some(Err(e)) => Err(LoaderError::FetchFailure(e.to_string())),
                        None => Err(LoaderError::BatchShapeMismatch { expected, actual }),
                    };
                    // A settled promise here means `Set`/`prime` raced the
                    // fetch for this key; per spec, settling twice is
                    // swallowed as far as the dispatcher is concerned.
                    let _ = promise.set(outcome);
                }
            }
            Err(e) => {
                log::warn!("fetch failed for {} key(s): {e}", keys.len());
                let message = e.to_string();
                for (_, promise) in chunk {
                    let _ = promise.set(Err(LoaderError::FetchFailure(message.clone())));
                }
            }
        }
    }

    /// Used for the batching-disabled path: dispatches a one-key fetch in
    /// its own task so `load` never blocks the caller synchronously.
    fn dispatch_single(&self, key: K, promise: Promise<LoadResult<V>>) {
        let fetcher = Arc::clone(&self.fetcher);
        tokio::spawn(async move {
            let keys = vec![key];
            let outcome = match fetcher.fetch(&keys).await {
                Ok(mut results) if !results.is_empty() => match results.remove(0) {
                    Ok(value) => Ok(value),
                    Err(e) => Err(LoaderError::FetchFailure(e.to_string())),
                },
                Ok(results) => Err(LoaderError::BatchShapeMismatch {
                    expected: 1,
                    actual: results.len(),
                }),
                Err(e) => Err(LoaderError::FetchFailure(e.to_string())),
            };
            let _ = promise.set(outcome);
        });
    }

    /// Start the background dispatch loop if it is not already running, and
    /// return the same handle back to the caller. Idempotent.
    pub fn start(self: Arc<Self>) -> Arc<Self> {
        {
            let mut handle_guard = self.dispatcher_handle.lock();
            if handle_guard.is_none() {
                let this = Arc::clone(&self);
                *handle_guard = Some(tokio::spawn(async move {
                    this.dispatch_loop().await;
                }));
                log::info!("background dispatch loop started");
            }
        }
        self
    }

    async fn dispatch_loop(self: Arc<Self>) {
        loop {
            if self.stop_flag.load(Ordering::Acquire) {
                break;
            }

            let delay = self.options.batch_request_delay;

            if delay.is_zero() {
                if self.pending.lock().is_empty() {
                    // Nothing queued and no configured pacing: a minimal
                    // cooperative yield, never a true spin loop.
                    tokio::task::yield_now().await;
                    continue;
                }
            } else {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = self.stop_notify.notified() => break,
                }
                if self.stop_flag.load(Ordering::Acquire) {
                    break;
                }
                if self.pending.lock().is_empty() {
                    continue;
                }
            }

            if let Err(e) = self.dispatch_batch().await {
                log::error!("dispatch_batch failed: {e}");
            }
        }
        log::info!("background dispatch loop stopped");
    }

    /// Stop the background dispatch loop. The loop exits at its next
    /// sleep/await boundary; in-flight `fetch` calls are not cancelled.
    /// Idempotent.
    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::Release);
        self.stop_notify.notify_waiters();
        // Drop (detach) the handle rather than aborting it, so a fetch in
        // flight is allowed to finish settling its promises.
        self.dispatcher_handle.lock().take();
    }

    /// Stop the dispatcher, clear the cache, and mark the loader disposed
    /// so subsequent operations fail with [`LoaderError::InvalidState`].
    /// Idempotent: a second `dispose` is a no-op.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop();
        self.cache.clear().await;
        log::info!("loader disposed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Mutex as AsyncMutex;

    struct RecordingFetcher {
        calls: AsyncMutex<Vec<Vec<i32>>>,
        fail_next: AtomicBool,
        call_count: AtomicUsize,
    }

    impl RecordingFetcher {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AsyncMutex::new(Vec::new()),
                fail_next: AtomicBool::new(false),
                call_count: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl BatchFetcher<i32, String> for RecordingFetcher {
        async fn fetch(&self, keys: &[i32]) -> Result<Vec<Result<String, FetchError>>, FetchError> {
            self.call_count.fetch_add(1, Ordering::SeqCst);
            self.calls.lock().await.push(keys.to_vec());
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err("boom".into());
            }
            Ok(keys.iter().map(|k| Ok(format!("value-{k}"))).collect())
        }
    }

    #[tokio::test]
    async fn basic_batch_dispatches_once() {
        let fetcher = RecordingFetcher::new();
        let loader = LoaderCore::new(fetcher.clone(), LoaderOptions::default());

        let loaded = tokio::spawn({
            let loader = Arc::clone(&loader);
            async move { loader.load_many(vec![1, 2, 3]).await.unwrap() }
        });

        // Give the three `load` calls inside `load_many` a chance to enqueue
        // before the single explicit dispatch below.
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
        loader.dispatch_batch().await.unwrap();

        let results = loaded.await.unwrap();
        assert_eq!(
            results,
            vec![
                Ok("value-1".to_string()),
                Ok("value-2".to_string()),
                Ok("value-3".to_string()),
            ]
        );
        assert_eq!(fetcher.call_count.load(Ordering::SeqCst), 1);
        assert_eq!(fetcher.calls.lock().await[0], vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn cache_dedupes_repeat_loads_without_a_second_fetch() {
        let fetcher = RecordingFetcher::new();
        let loader = LoaderCore::new(fetcher.clone(), LoaderOptions::default());

        let first = tokio::spawn({
            let loader = Arc::clone(&loader);
            async move { loader.load(1).await }
        });
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
        loader.dispatch_batch().await.unwrap();
        assert_eq!(first.await.unwrap(), Ok("value-1".to_string()));

        // Second load hits the cache; no further fetch call needed.
        assert_eq!(loader.load(1).await, Ok("value-1".to_string()));
        assert_eq!(fetcher.call_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn max_batch_size_splits_into_chunks() {
        let fetcher = RecordingFetcher::new();
        let options = LoaderOptions::builder().max_batch_size(2).build();
        let loader = LoaderCore::new(fetcher.clone(), options);

        let loaded = tokio::spawn({
            let loader = Arc::clone(&loader);
            async move { loader.load_many(vec![1, 2, 3]).await.unwrap() }
        });
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
        loader.dispatch_batch().await.unwrap();

        let results = loaded.await.unwrap();
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.is_ok()));

        let calls = fetcher.calls.lock().await;
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], vec![1, 2]);
        assert_eq!(calls[1], vec![3]);
    }

    #[tokio::test]
    async fn disable_batching_dispatches_each_load_independently() {
        let fetcher = RecordingFetcher::new();
        let options = LoaderOptions::no_batching();
        let loader = LoaderCore::new(fetcher.clone(), options);

        let result = loader.load(7).await;
        assert_eq!(result, Ok("value-7".to_string()));
        assert_eq!(fetcher.call_count.load(Ordering::SeqCst), 1);
        assert_eq!(fetcher.calls.lock().await[0], vec![7]);
    }

    #[tokio::test]
    async fn set_takes_precedence_over_a_pending_fetch() {
        let fetcher = RecordingFetcher::new();
        let loader = LoaderCore::new(fetcher.clone(), LoaderOptions::default());

        loader.prime(5, Ok("primed".to_string())).await.unwrap();
        let result = loader.load(5).await;
        assert_eq!(result, Ok("primed".to_string()));
        assert_eq!(fetcher.call_count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn fetch_failure_rejects_every_key_in_the_chunk() {
        let fetcher = RecordingFetcher::new();
        fetcher.fail_next.store(true, Ordering::SeqCst);
        let loader = LoaderCore::new(fetcher.clone(), LoaderOptions::default());

        let loaded = tokio::spawn({
            let loader = Arc::clone(&loader);
            async move { loader.load_many(vec![1, 2]).await.unwrap() }
        });
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
        loader.dispatch_batch().await.unwrap();

        let results = loaded.await.unwrap();
        assert!(results
            .iter()
            .all(|r| matches!(r, Err(LoaderError::FetchFailure(_)))));
    }

    #[tokio::test]
    async fn load_many_rejects_empty_input() {
        let fetcher = RecordingFetcher::new();
        let loader = LoaderCore::new(fetcher, LoaderOptions::default());
        let err = loader.load_many(Vec::new()).await.unwrap_err();
        assert!(matches!(err, LoaderError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn operations_fail_after_dispose() {
        let fetcher = RecordingFetcher::new();
        let loader = LoaderCore::new(fetcher, LoaderOptions::default());
        loader.dispose().await;
        loader.dispose().await; // idempotent

        let err = loader.load(1).await.unwrap_err();
        assert!(matches!(err, LoaderError::InvalidState(_)));
    }

    #[tokio::test]
    async fn background_loop_dispatches_without_an_explicit_call() {
        let fetcher = RecordingFetcher::new();
        let options = LoaderOptions::builder()
            .batch_request_delay(Duration::from_millis(5))
            .build();
        let loader = LoaderCore::new(fetcher.clone(), options).start();

        let result = loader.load(9).await;
        assert_eq!(result, Ok("value-9".to_string()));
        loader.stop();
    }
}
