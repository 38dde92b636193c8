//! A one-shot, multi-observer completion cell.
//!
//! The base loader's reference implementation relies on a runtime where a
//! single "task" object is both the awaitable and the completion handle.
//! This splits that into a future handle and a write-once setter, built on
//! [`tokio::sync::watch`] so that every clone of a [`Promise`] — whether
//! held by the cache, the pending buffer, or a caller that already
//! returned from `load` — observes the identical settled value, regardless
//! of whether it started awaiting before or after `set` was called.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;

use crate::error::LoaderError;

/// A write-once completion cell whose result can be awaited by any number
/// of clones.
///
/// Cloning a `Promise` is cheap (an `Arc` bump plus a channel-receiver
/// clone) and all clones settle together: calling `set` on any clone
/// resolves `future()` on every other clone.
pub struct Promise<T: Clone + Send + Sync + 'static> {
    tx: Arc<watch::Sender<Option<T>>>,
    rx: watch::Receiver<Option<T>>,
    settled: Arc<AtomicBool>,
}

impl<T: Clone + Send + Sync + 'static> Promise<T> {
    /// Create a new, pending promise.
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(None);
        Self {
            tx: Arc::new(tx),
            rx,
            settled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Settle the promise with `value`. Every outstanding and future
    /// `future()` call on any clone resolves to this value.
    ///
    /// Returns [`LoaderError::InvalidState`] if the promise was already
    /// settled. Dispatcher-driven settlement treats this as a harmless
    /// no-op, but the error is still surfaced here so callers that care
    /// (e.g. `Set` racing a fetch) can detect it.
    pub fn set(&self, value: T) -> Result<(), LoaderError> {
        if self.settled.swap(true, Ordering::AcqRel) {
            return Err(LoaderError::InvalidState(
                "promise already settled".to_string(),
            ));
        }
        // The receiver side is always kept alive by `self.rx`, so send
        // cannot fail.
        let _ = self.tx.send(Some(value));
        Ok(())
    }

    /// Whether `set` has already been called on this promise (or any of
    /// its clones).
    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::Acquire)
    }

    /// Await the settled value. Resolves immediately if already settled.
    pub async fn future(&self) -> T {
        let mut rx = self.rx.clone();
        loop {
            if let Some(value) = rx.borrow().clone() {
                return value;
            }
            // `changed` resolves as soon as a value has been sent since
            // this receiver's last observed version, even if that send
            // happened before this call — so there is no missed-wakeup
            // window between the check above and this await.
            if rx.changed().await.is_err() {
                // Sender dropped without ever settling; re-check once more
                // in case a value landed in the same instant, otherwise
                // loop (will observe the same `None` and spin only if the
                // Promise itself is leaked without its owning LoaderCore).
                if let Some(value) = rx.borrow().clone() {
                    return value;
                }
            }
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            tx: Arc::clone(&self.tx),
            rx: self.rx.clone(),
            settled: Arc::clone(&self.settled),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}
