//! Error types for the request-coalescing loader.
//!
//! A small `thiserror` enum, cloneable so a settled
//! [`crate::promise::Promise`] can hand the same error to every observer.

use thiserror::Error;

/// Errors produced by a [`crate::loader::LoaderCore`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoaderError {
    /// A required argument was null/empty where the contract disallows it.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation was attempted on a disposed loader, or a promise was
    /// settled more than once.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The user `fetch` function returned a result sequence whose length
    /// did not match the chunk it was given.
    #[error("batch shape mismatch: fetch returned {actual} result(s) for {expected} key(s)")]
    BatchShapeMismatch {
        /// Number of keys in the dispatched chunk.
        expected: usize,
        /// Number of results the fetch function returned.
        actual: usize,
    },

    /// The user `fetch` function returned an error or panicked for a key's
    /// chunk. The message is the rendered `Display` of the original error,
    /// captured at wrap time since the caller's error type is not required
    /// to be `Clone`.
    #[error("fetch failed: {0}")]
    FetchFailure(String),
}

/// The value or error produced for a single key: one payload, immutable
/// once constructed.
pub type LoadResult<V> = Result<V, LoaderError>;
