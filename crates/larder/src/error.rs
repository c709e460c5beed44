use thiserror::Error;

/// The central error type of the cache.
///
/// The enum is `Clone + Eq` on purpose: a single failure of a collapsed
/// producer call is handed to every joiner, and the bulk wrapper positions
/// failures per-element in its output array.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// An operation was called after [`Cache::close`](crate::Cache::close).
    ///
    /// Only raised when the cache was configured with
    /// [`AfterClose::Error`](crate::AfterClose::Error) for the operation.
    #[error("cache is closed")]
    Closed,
    /// Reading from the backing store failed.
    ///
    /// The wrappers absorb this when configured with
    /// [`CacheReadFailure::CallProducer`](crate::CacheReadFailure::CallProducer).
    #[error("store read failed: {0}")]
    StoreRead(String),
    /// Writing to the backing store failed.
    ///
    /// Never surfaced by the wrappers; their stores are fire-and-forget
    /// and failures are logged as warnings. [`Cache::store`](crate::Cache::store)
    /// itself does propagate it.
    #[error("store write failed: {0}")]
    StoreWrite(String),
    /// A producer call failed, indicating origin unavailability.
    #[error("producer failed: {0}")]
    Producer(String),
    /// An unexpected error inside the cache itself.
    #[error("internal error")]
    Internal,
}

impl CacheError {
    pub fn store_read(err: impl std::fmt::Display) -> Self {
        Self::StoreRead(err.to_string())
    }

    pub fn store_write(err: impl std::fmt::Display) -> Self {
        Self::StoreWrite(err.to_string())
    }

    pub fn producer(err: impl std::fmt::Display) -> Self {
        Self::Producer(err.to_string())
    }

    /// Logs an unexpected error and turns it into [`Internal`](Self::Internal).
    #[track_caller]
    pub fn internal<E: std::error::Error + 'static>(err: E) -> Self {
        let dynerr: &dyn std::error::Error = &err;
        tracing::error!(error = dynerr);
        Self::Internal
    }
}

/// Result alias used throughout the crate.
pub type CacheResult<T> = Result<T, CacheError>;
