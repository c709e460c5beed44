//! Producer-wrapping orchestrators.
//!
//! A wrapper composes a [`Cache`](crate::Cache) with an origin producer:
//! it serves usable entries directly, collapses concurrent producer calls,
//! refreshes stale-while-revalidate entries in the background, falls back
//! to stale entries when the origin errors, and stores producer results,
//! including supplemental resources, without adding store latency to the
//! response path.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;

use crate::cache::{Cache, CacheRequest};
use crate::entry::{Entry, NewEntry, ProducedResource};
use crate::error::{CacheError, CacheResult};
use crate::params::Params;

mod bulk;
mod single;

pub use bulk::CachedBulkProducer;
pub use single::CachedProducer;

/// What a producer hands back: the primary resource for the requested id,
/// plus any supplemental resources worth caching alongside it.
///
/// Supplementals are stored but never returned to the caller of a wrapper;
/// a subsequent request is needed to benefit from them.
#[derive(Debug, Clone)]
pub struct ProducerResult<C> {
    pub resource: ProducedResource<C>,
    pub supplemental_resources: Vec<NewEntry<C>>,
}

impl<C> ProducerResult<C> {
    pub fn new(resource: ProducedResource<C>) -> Self {
        Self {
            resource,
            supplemental_resources: Vec::new(),
        }
    }

    pub fn with_supplemental(mut self, supplemental: NewEntry<C>) -> Self {
        self.supplemental_resources.push(supplemental);
        self
    }
}

impl<C> From<ProducedResource<C>> for ProducerResult<C> {
    fn from(resource: ProducedResource<C>) -> Self {
        Self::new(resource)
    }
}

/// An origin that produces one resource per request.
///
/// A failed future means the origin is unavailable; a successful value
/// whose content happens to *represent* an error is still a success as far
/// as caching is concerned.
pub trait Producer<C>: Send + Sync + 'static {
    fn produce(&self, request: CacheRequest) -> BoxFuture<'_, CacheResult<ProducerResult<C>>>;
}

impl<C, F, Fut> Producer<C> for F
where
    F: Fn(CacheRequest) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = CacheResult<ProducerResult<C>>> + Send + 'static,
{
    fn produce(&self, request: CacheRequest) -> BoxFuture<'_, CacheResult<ProducerResult<C>>> {
        self(request).boxed()
    }
}

/// An origin that produces many resources per call.
///
/// The outer future never fails; unavailability is reported per element.
pub trait BulkProducer<C>: Send + Sync + 'static {
    fn produce(&self, requests: Vec<CacheRequest>) -> BoxFuture<'_, Vec<CacheResult<ProducerResult<C>>>>;
}

impl<C, F, Fut> BulkProducer<C> for F
where
    F: Fn(Vec<CacheRequest>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Vec<CacheResult<ProducerResult<C>>>> + Send + 'static,
{
    fn produce(&self, requests: Vec<CacheRequest>) -> BoxFuture<'_, Vec<CacheResult<ProducerResult<C>>>> {
        self(requests).boxed()
    }
}

/// What a wrapper does when the cache read itself fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CacheReadFailure {
    /// Log a warning and carry on as if the cache were empty.
    #[default]
    CallProducer,
    /// Propagate the failure to the caller.
    Surface,
}

type CacheablePredicate = Arc<dyn Fn(&str, &Params) -> bool + Send + Sync>;

/// Configuration shared by both wrappers.
#[derive(Clone)]
pub struct WrapperConfig {
    /// Reported in diagnostics messages.
    pub cache_name: Option<String>,
    /// Producer calls for identical requests started within this window
    /// share one invocation.
    pub collapse_window: Duration,
    pub on_cache_read_failure: CacheReadFailure,
    /// Requests for which this returns `false` go straight to the
    /// producer: no cache read, no collapsing, no supplemental caching.
    pub is_cacheable: CacheablePredicate,
}

impl WrapperConfig {
    pub fn named(cache_name: impl Into<String>) -> Self {
        Self {
            cache_name: Some(cache_name.into()),
            ..Default::default()
        }
    }

    pub fn with_collapse_window(mut self, window: Duration) -> Self {
        self.collapse_window = window;
        self
    }

    pub fn with_cache_read_failure(mut self, policy: CacheReadFailure) -> Self {
        self.on_cache_read_failure = policy;
        self
    }

    pub fn with_cacheable(
        mut self,
        is_cacheable: impl Fn(&str, &Params) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.is_cacheable = Arc::new(is_cacheable);
        self
    }
}

impl Default for WrapperConfig {
    fn default() -> Self {
        Self {
            cache_name: None,
            collapse_window: Duration::from_secs(3),
            on_cache_read_failure: CacheReadFailure::default(),
            is_cacheable: Arc::new(|_, _| true),
        }
    }
}

impl std::fmt::Debug for WrapperConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WrapperConfig")
            .field("cache_name", &self.cache_name)
            .field("collapse_window", &self.collapse_window)
            .field("on_cache_read_failure", &self.on_cache_read_failure)
            .finish_non_exhaustive()
    }
}

/// Spawns a fire-and-forget store of producer output. Failures are
/// warnings; they never reach the consumer.
fn store_in_background<C>(cache: Cache<C>, batch: Vec<NewEntry<C>>)
where
    C: Clone + Send + Sync + 'static,
{
    tokio::spawn(async move {
        if let Err(err) = cache.store(batch).await {
            tracing::warn!(error = %err, "failed to store producer result");
        }
    });
}

/// The collapsed unit of work for a single request: call the producer,
/// kick off the store of everything it returned, hand back the normalized
/// primary resource.
pub(crate) async fn produce_and_store<C, P>(
    cache: Cache<C>,
    producer: Arc<P>,
    request: CacheRequest,
) -> CacheResult<Entry<C>>
where
    C: Clone + Send + Sync + 'static,
    P: Producer<C>,
{
    let id = request.id.clone();
    let result = producer.produce(request).await?;

    let now = Utc::now();
    let primary_raw = result.resource.into_new_entry(id);
    let primary = cache.normalize_entry(primary_raw.clone(), now);

    let mut batch = Vec::with_capacity(1 + result.supplemental_resources.len());
    batch.push(primary_raw);
    batch.extend(result.supplemental_resources);
    store_in_background(cache, batch);

    Ok(primary)
}

/// Bulk counterpart of [`produce_and_store`]: per-element results, one
/// batched background store for all successes.
pub(crate) async fn produce_and_store_bulk<C, P>(
    cache: Cache<C>,
    producer: Arc<P>,
    requests: Vec<CacheRequest>,
) -> CacheResult<Vec<CacheResult<Entry<C>>>>
where
    C: Clone + Send + Sync + 'static,
    P: BulkProducer<C>,
{
    let results = producer.produce(requests.clone()).await;
    if results.len() != requests.len() {
        tracing::error!(
            expected = requests.len(),
            got = results.len(),
            "bulk producer returned a result list of the wrong length",
        );
        return Err(CacheError::Producer(format!(
            "bulk producer returned {} results for {} requests",
            results.len(),
            requests.len(),
        )));
    }

    let now = Utc::now();
    let mut out = Vec::with_capacity(results.len());
    let mut batch = Vec::new();
    for (request, result) in requests.into_iter().zip(results) {
        match result {
            Ok(produced) => {
                let primary_raw = produced.resource.into_new_entry(request.id);
                out.push(Ok(cache.normalize_entry(primary_raw.clone(), now)));
                batch.push(primary_raw);
                batch.extend(produced.supplemental_resources);
            }
            Err(err) => out.push(Err(err)),
        }
    }

    if !batch.is_empty() {
        store_in_background(cache, batch);
    }

    Ok(out)
}
