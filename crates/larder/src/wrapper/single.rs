use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;

use crate::cache::{Cache, CacheRequest, Lookup};
use crate::collapse::Collapser;
use crate::diagnostics::{publish, Outcome};
use crate::entry::Entry;
use crate::error::CacheResult;
use crate::key::canonical_json;

use super::{produce_and_store, CacheReadFailure, Producer, WrapperConfig};

/// A producer wrapped with a cache: one request in, one resource out.
///
/// See the module docs for the full behavior; the short version is that a
/// [`get`](Self::get) never waits on the store, revalidates stale entries
/// in the background where the directives permit it, and falls back to a
/// stale entry when the producer errors and the directives permit that.
pub struct CachedProducer<C, P>
where
    C: Clone + Send + Sync + 'static,
    P: Producer<C>,
{
    cache: Cache<C>,
    producer: Arc<P>,
    config: WrapperConfig,
    collapser: Collapser<CacheRequest, Entry<C>>,
}

impl<C, P> CachedProducer<C, P>
where
    C: Clone + Send + Sync + 'static,
    P: Producer<C>,
{
    pub fn new(cache: Cache<C>, producer: Arc<P>, config: WrapperConfig) -> Self {
        let collapser = Collapser::new(config.collapse_window, canonical_json::<CacheRequest>, {
            let cache = cache.clone();
            let producer = Arc::clone(&producer);
            move |request: CacheRequest| {
                produce_and_store(cache.clone(), Arc::clone(&producer), request).boxed()
            }
        });

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

    /// Serves a request from cache or producer, whichever the directives
    /// allow.
    pub async fn get(&self, request: CacheRequest) -> CacheResult<Entry<C>> {
        if !(self.config.is_cacheable)(&request.id, &request.params) {
            self.publish(Outcome::Uncacheable, &request.id);
            let id = request.id.clone();
            let result = self.producer.produce(request).await?;
            // supplementals are not cached on this path
            return Ok(self
                .cache
                .normalize_entry(result.resource.into_new_entry(id), Utc::now()));
        }

        let lookup = match self.cache.get(&request).await {
            Ok(lookup) => lookup,
            Err(err) => match self.config.on_cache_read_failure {
                CacheReadFailure::Surface => return Err(err),
                CacheReadFailure::CallProducer => {
                    tracing::warn!(
                        error = %err,
                        id = %request.id,
                        "cache read failed, treating as empty",
                    );
                    Lookup::default()
                }
            },
        };

        if let Some(entry) = lookup.usable {
            self.publish(Outcome::Hit, &request.id);
            return Ok(entry);
        }

        let cache_key = request.id.clone();
        let bypassed = request.directives.max_age == Some(Duration::ZERO);
        let refresh = self.collapser.collapse(request);

        if let Some(entry) = lookup.usable_while_revalidate {
            self.publish(Outcome::StaleWhileRevalidate, &cache_key);
            tokio::spawn(async move {
                if let Err(err) = refresh.await {
                    tracing::warn!(error = %err, id = %cache_key, "background revalidation failed");
                }
            });
            return Ok(entry);
        }

        let outcome = if bypassed { Outcome::Bypass } else { Outcome::Miss };
        self.publish(outcome, &cache_key);

        if let Some(entry) = lookup.usable_if_error {
            return match refresh.await {
                Ok(fresh) => Ok(fresh),
                Err(err) => {
                    tracing::warn!(
                        error = %err,
                        id = %cache_key,
                        "producer failed, serving stale entry",
                    );
                    Ok(entry)
                }
            };
        }

        refresh.await
    }
}

impl<C, P> std::fmt::Debug for CachedProducer<C, P>
where
    C: Clone + Send + Sync + 'static,
    P: Producer<C>,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedProducer")
            .field("cache", &self.cache)
            .field("config", &self.config)
            .field("collapser", &self.collapser)
            .finish_non_exhaustive()
    }
}
