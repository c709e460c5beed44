//! The backing-store seam.
//!
//! The cache consumes, and does not implement, keyed entry storage. A
//! store's only non-trivial obligation is the vary-compatibility lookup:
//! `get` must return every entry for an id whose vary mapping is satisfied
//! by the request's (normalized) params; see
//! [`vary_matches`](crate::vary_matches).
//!
//! Everything time-related is advisory: the `max_store_for` passed to
//! [`store`](EntryStore::store) is an upper bound the store may undercut
//! at will (eviction policy is the store's business).

use std::time::Duration;

use futures::future::BoxFuture;
use futures::{StreamExt, TryStreamExt};

use crate::entry::Entry;
use crate::error::CacheResult;
use crate::params::Params;

mod memory;

pub use memory::InMemoryStore;

/// How many `get` calls the default [`EntryStore::get_many`] keeps in
/// flight at once.
const GET_MANY_CONCURRENCY: usize = 8;

/// A keyed store of cache entries.
///
/// The primary key is `(id, vary)`: a store holds at most one entry per
/// such pair, and an id may accumulate any number of vary variants.
pub trait EntryStore<C>: Send + Sync
where
    C: Clone + Send + Sync + 'static,
{
    /// Returns every entry stored under `id` whose vary mapping is
    /// compatible with `params`.
    fn get<'a>(&'a self, id: &'a str, params: &'a Params) -> BoxFuture<'a, CacheResult<Vec<Entry<C>>>>;

    /// Batched [`get`](Self::get); the i-th result corresponds to the i-th
    /// request.
    ///
    /// The default implementation runs `get` with bounded concurrency,
    /// preserving order.
    fn get_many<'a>(
        &'a self,
        requests: &'a [(String, Params)],
    ) -> BoxFuture<'a, CacheResult<Vec<Vec<Entry<C>>>>> {
        Box::pin(
            futures::stream::iter(requests.iter().map(|(id, params)| self.get(id, params)))
                .buffered(GET_MANY_CONCURRENCY)
                .try_collect(),
        )
    }

    /// Upserts each entry under its `(id, vary)` key.
    ///
    /// When several inputs in one batch share a key, the one with the
    /// latest birth date wins. `max_store_for` is the advisory lifetime
    /// bound computed by the cache; `None` means unbounded.
    fn store<'a>(
        &'a self,
        batch: Vec<(Entry<C>, Option<Duration>)>,
    ) -> BoxFuture<'a, CacheResult<()>>;

    /// Removes every entry stored under `id`, across all vary variants.
    fn delete<'a>(&'a self, id: &'a str) -> BoxFuture<'a, CacheResult<()>>;

    /// Releases resources. `timeout` bounds how long the store may spend
    /// flushing pending work; how to honor it is the store's choice.
    fn close<'a>(&'a self, timeout: Option<Duration>) -> BoxFuture<'a, CacheResult<()>>;
}
