use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;

use crate::cache::{Cache, CacheRequest, Lookup};
use crate::collapse::Collapser;
use crate::diagnostics::{publish, Outcome};
use crate::entry::Entry;
use crate::error::{CacheError, CacheResult};
use crate::key::canonical_json;

use super::{produce_and_store_bulk, BulkProducer, CacheReadFailure, WrapperConfig};

/// A bulk producer wrapped with a cache: many requests in, many
/// per-element results out, in input order.
///
/// Cacheable and uncacheable requests are separated up front; the
/// uncacheable subset goes to the producer directly (no collapsing) while
/// the cacheable subset is looked up in one batch. Whatever the lookup
/// cannot satisfy is produced through the collapser; stale-while-revalidate
/// entries additionally trigger a background refresh of just their subset.
pub struct CachedBulkProducer<C, P>
where
    C: Clone + Send + Sync + 'static,
    P: BulkProducer<C>,
{
    cache: Cache<C>,
    producer: Arc<P>,
    config: WrapperConfig,
    collapser: Collapser<Vec<CacheRequest>, Vec<CacheResult<Entry<C>>>>,
}

impl<C, P> CachedBulkProducer<C, P>
where
    C: Clone + Send + Sync + 'static,
    P: BulkProducer<C>,
{
    pub fn new(cache: Cache<C>, producer: Arc<P>, config: WrapperConfig) -> Self {
        let collapser = Collapser::new(
            config.collapse_window,
            canonical_json::<Vec<CacheRequest>>,
            {
                let cache = cache.clone();
                let producer = Arc::clone(&producer);
                move |requests: Vec<CacheRequest>| {
                    produce_and_store_bulk(cache.clone(), Arc::clone(&producer), requests).boxed()
                }
            },
        );

        Self {
            cache,
            producer,
            config,
            collapser,
        }
    }

    fn publish(&self, outcome: Outcome, cache_key: &str) {
        publish(self.config.cache_name.as_deref(), outcome, cache_key);
    }

    /// Serves a batch of requests. `output[i]` always corresponds to
    /// `requests[i]`, regardless of how the internal sub-batches complete.
    pub async fn get_many(
        &self,
        requests: Vec<CacheRequest>,
    ) -> CacheResult<Vec<CacheResult<Entry<C>>>> {
        let mut results: Vec<Option<CacheResult<Entry<C>>>> =
            requests.iter().map(|_| None).collect();

        let (cacheable, uncacheable): (Vec<usize>, Vec<usize>) = (0..requests.len())
            .partition(|&idx| (self.config.is_cacheable)(&requests[idx].id, &requests[idx].params));

        let uncacheable_requests: Vec<CacheRequest> =
            uncacheable.iter().map(|&idx| requests[idx].clone()).collect();
        let cacheable_requests: Vec<CacheRequest> =
            cacheable.iter().map(|&idx| requests[idx].clone()).collect();

        let uncacheable_results = async {
            if uncacheable_requests.is_empty() {
                Vec::new()
            } else {
                self.producer.produce(uncacheable_requests.clone()).await
            }
        };
        let lookups = async {
            if cacheable_requests.is_empty() {
                Ok(Vec::new())
            } else {
                self.cache.get_many(&cacheable_requests).await
            }
        };
        let (uncacheable_results, lookups) = futures::join!(uncacheable_results, lookups);

        let lookups: Vec<Lookup<C>> = match lookups {
            Ok(lookups) => lookups,
            Err(err) => match self.config.on_cache_read_failure {
                CacheReadFailure::Surface => return Err(err),
                CacheReadFailure::CallProducer => {
                    tracing::warn!(error = %err, "bulk cache read failed, treating as empty");
                    cacheable_requests.iter().map(|_| Lookup::default()).collect()
                }
            },
        };

        // Bucket each cacheable request; `needs` keeps the stale-if-error
        // fallback of its lookup around for the error-substitution step.
        let mut needs: Vec<(usize, Option<Entry<C>>)> = Vec::new();
        let mut revalidate: Vec<usize> = Vec::new();
        for (&idx, lookup) in cacheable.iter().zip(lookups) {
            let request = &requests[idx];
            if let Some(entry) = lookup.usable {
                self.publish(Outcome::Hit, &request.id);
                results[idx] = Some(Ok(entry));
            } else if let Some(entry) = lookup.usable_while_revalidate {
                self.publish(Outcome::StaleWhileRevalidate, &request.id);
                results[idx] = Some(Ok(entry));
                revalidate.push(idx);
            } else {
                let outcome = if request.directives.max_age == Some(Duration::ZERO) {
                    Outcome::Bypass
                } else {
                    Outcome::Miss
                };
                self.publish(outcome, &request.id);
                needs.push((idx, lookup.usable_if_error));
            }
        }

        // Start the producer call for the missing subset before scheduling
        // the background refresh, but only await it afterwards.
        let produced = (!needs.is_empty()).then(|| {
            let subset: Vec<CacheRequest> =
                needs.iter().map(|&(idx, _)| requests[idx].clone()).collect();
            self.collapser.collapse(subset)
        });

        if !revalidate.is_empty() {
            let subset: Vec<CacheRequest> =
                revalidate.iter().map(|&idx| requests[idx].clone()).collect();
            let refresh = self.collapser.collapse(subset);
            tokio::spawn(async move {
                if let Err(err) = refresh.await {
                    tracing::warn!(error = %err, "background bulk revalidation failed");
                }
            });
        }

        if let Some(produced) = produced {
            match produced.await {
                Ok(produced) if produced.len() == needs.len() => {
                    for ((idx, fallback), result) in needs.into_iter().zip(produced) {
                        results[idx] = Some(recover_if_error(result, fallback, &requests[idx].id));
                    }
                }
                Ok(produced) => {
                    // can only happen if a collapsed slot was poisoned by a
                    // differently-sized subset, which the canonical key rules out
                    tracing::error!(
                        expected = needs.len(),
                        got = produced.len(),
                        "collapsed bulk result has the wrong length",
                    );
                    for (idx, fallback) in needs {
                        results[idx] =
                            Some(recover_if_error(Err(CacheError::Internal), fallback, &requests[idx].id));
                    }
                }
                Err(err) => {
                    for (idx, fallback) in needs {
                        results[idx] =
                            Some(recover_if_error(Err(err.clone()), fallback, &requests[idx].id));
                    }
                }
            }
        }

        if !uncacheable.is_empty() {
            if uncacheable_results.len() != uncacheable.len() {
                tracing::error!(
                    expected = uncacheable.len(),
                    got = uncacheable_results.len(),
                    "bulk producer returned a result list of the wrong length",
                );
                for &idx in &uncacheable {
                    results[idx] = Some(Err(CacheError::Producer(
                        "bulk producer returned a result list of the wrong length".into(),
                    )));
                }
            } else {
                let now = Utc::now();
                for (&idx, result) in uncacheable.iter().zip(uncacheable_results) {
                    let request = &requests[idx];
                    self.publish(Outcome::Uncacheable, &request.id);
                    // supplementals are not cached on this path
                    results[idx] = Some(result.map(|produced| {
                        self.cache
                            .normalize_entry(produced.resource.into_new_entry(request.id.clone()), now)
                    }));
                }
            }
        }

        Ok(results
            .into_iter()
            .map(|slot| slot.unwrap_or(Err(CacheError::Internal)))
            .collect())
    }
}

/// Substitutes the stale-if-error entry for a failed production, when one
/// exists.
fn recover_if_error<C>(
    result: CacheResult<Entry<C>>,
    fallback: Option<Entry<C>>,
    id: &str,
) -> CacheResult<Entry<C>> {
    match (result, fallback) {
        (Ok(entry), _) => Ok(entry),
        (Err(err), Some(entry)) => {
            tracing::warn!(error = %err, id = %id, "producer failed, serving stale entry");
            Ok(entry)
        }
        (Err(err), None) => Err(err),
    }
}

impl<C, P> std::fmt::Debug for CachedBulkProducer<C, P>
where
    C: Clone + Send + Sync + 'static,
    P: BulkProducer<C>,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedBulkProducer")
            .field("cache", &self.cache)
            .field("config", &self.config)
            .field("collapser", &self.collapser)
            .finish_non_exhaustive()
    }
}
