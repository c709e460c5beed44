//! The cache façade.
//!
//! A [`Cache`] ties a backing [`EntryStore`] to the classifier: it
//! normalizes request params, fetches candidate entries, groups them by
//! [`Usability`](crate::Usability) and selects the best of each group. It
//! also owns the write path: defaulting and normalizing raw resources,
//! computing their store lifetime, and notifying `store` listeners before
//! the write goes out.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::classify::{classify, Usability};
use crate::directives::{secs, ConsumerDirectives, ProducerDirectives};
use crate::entry::{Entry, NewEntry};
use crate::error::{CacheError, CacheResult};
use crate::params::{normalize_params, normalize_vary, ParamNormalizers, Params};
use crate::store::EntryStore;

/// What an operation does when called after [`Cache::close`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AfterClose {
    /// Fail with [`CacheError::Closed`].
    #[default]
    Error,
    /// Pretend the cache is empty: reads return an empty [`Lookup`],
    /// writes and deletes succeed without doing anything.
    Empty,
}

/// Construction-time configuration of a [`Cache`].
#[derive(Debug, Clone, Default)]
pub struct CacheConfig {
    pub on_get_after_close: AfterClose,
    pub on_store_after_close: AfterClose,
    /// Applied to request params and entry vary mappings alike, so both
    /// sides of the vary-compatibility predicate see the same shapes.
    pub normalizers: ParamNormalizers,
}

/// A consumer request: what to get, under which params, with which
/// tolerance.
///
/// Params and directives default to empty, which is the strictest
/// tolerance (no staleness accepted).
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct CacheRequest {
    pub id: String,
    #[serde(skip_serializing_if = "Params::is_empty")]
    pub params: Params,
    pub directives: ConsumerDirectives,
}

impl CacheRequest {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            params: Params::new(),
            directives: ConsumerDirectives::default(),
        }
    }

    pub fn with_params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }

    pub fn with_directives(mut self, directives: ConsumerDirectives) -> Self {
        self.directives = directives;
        self
    }
}

/// The result of a cache lookup, grouped by usability.
///
/// At most one of the three entry slots is populated:
/// - a [`usable`](Self::usable) entry suppresses everything else
///   (including `validatable`, which is left empty);
/// - otherwise [`usable_while_revalidate`](Self::usable_while_revalidate)
///   beats [`usable_if_error`](Self::usable_if_error);
/// - `validatable` lists every returned entry carrying validators, as
///   revalidation candidates.
#[derive(Debug, Clone, PartialEq)]
pub struct Lookup<C> {
    pub usable: Option<Entry<C>>,
    pub usable_while_revalidate: Option<Entry<C>>,
    pub usable_if_error: Option<Entry<C>>,
    pub validatable: Vec<Entry<C>>,
}

impl<C> Default for Lookup<C> {
    fn default() -> Self {
        Self {
            usable: None,
            usable_while_revalidate: None,
            usable_if_error: None,
            validatable: Vec::new(),
        }
    }
}

impl<C> Lookup<C> {
    /// Whether the lookup produced nothing servable at all.
    pub fn is_empty(&self) -> bool {
        self.usable.is_none()
            && self.usable_while_revalidate.is_none()
            && self.usable_if_error.is_none()
            && self.validatable.is_empty()
    }
}

type StoreListener<C> = Box<dyn Fn(&Entry<C>, Option<Duration>) + Send + Sync>;

/// The cache façade over a backing store.
pub struct Cache<C>
where
    C: Clone + Send + Sync + 'static,
{
    store: Arc<dyn EntryStore<C>>,
    config: CacheConfig,
    closed: Arc<AtomicBool>,
    listeners: Arc<Mutex<Vec<StoreListener<C>>>>,
}

impl<C> Clone for Cache<C>
where
    C: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Cache {
            store: Arc::clone(&self.store),
            config: self.config.clone(),
            closed: Arc::clone(&self.closed),
            listeners: Arc::clone(&self.listeners),
        }
    }
}

impl<C> std::fmt::Debug for Cache<C>
where
    C: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let listeners = self
            .listeners
            .try_lock()
            .map(|listeners| listeners.len())
            .unwrap_or_default();
        f.debug_struct("Cache")
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .field("listeners", &listeners)
            .finish_non_exhaustive()
    }
}

impl<C> Cache<C>
where
    C: Clone + Send + Sync + 'static,
{
    pub fn new(store: Arc<dyn EntryStore<C>>) -> Self {
        Self::with_config(store, CacheConfig::default())
    }

    pub fn with_config(store: Arc<dyn EntryStore<C>>, config: CacheConfig) -> Self {
        Self {
            store,
            config,
            closed: Arc::new(AtomicBool::new(false)),
            listeners: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Registers a listener invoked for every entry offered to
    /// [`store`](Self::store), synchronously and before the backing write
    /// begins. Listeners fire regardless of whether that write later
    /// succeeds.
    pub fn on_store(&self, listener: impl Fn(&Entry<C>, Option<Duration>) + Send + Sync + 'static) {
        self.listeners
            .lock()
            .expect("cache listener registry poisoned")
            .push(Box::new(listener));
    }

    /// Looks up the best stored entries for a request.
    pub async fn get(&self, request: &CacheRequest) -> CacheResult<Lookup<C>> {
        if self.closed.load(Ordering::Acquire) {
            return match self.config.on_get_after_close {
                AfterClose::Error => Err(CacheError::Closed),
                AfterClose::Empty => Ok(Lookup::default()),
            };
        }

        let params = normalize_params(&request.params, &self.config.normalizers);
        let now = Utc::now();
        let entries = self.store.get(&request.id, &params).await?;
        Ok(process_entries(entries, &request.directives, now))
    }

    /// Batched [`get`](Self::get). Result order matches input order, and
    /// one instant is used for the whole batch so classifications are
    /// consistent across it.
    pub async fn get_many(&self, requests: &[CacheRequest]) -> CacheResult<Vec<Lookup<C>>> {
        if self.closed.load(Ordering::Acquire) {
            return match self.config.on_get_after_close {
                AfterClose::Error => Err(CacheError::Closed),
                AfterClose::Empty => Ok(requests.iter().map(|_| Lookup::default()).collect()),
            };
        }

        let keyed: Vec<(String, Params)> = requests
            .iter()
            .map(|request| {
                (
                    request.id.clone(),
                    normalize_params(&request.params, &self.config.normalizers),
                )
            })
            .collect();

        let now = Utc::now();
        let results = self.store.get_many(&keyed).await?;

        Ok(results
            .into_iter()
            .zip(requests)
            .map(|(entries, request)| process_entries(entries, &request.directives, now))
            .collect())
    }

    /// Fills in a raw resource's defaults and normalizes it into an
    /// [`Entry`] as of `now`.
    pub fn normalize_entry(&self, raw: NewEntry<C>, now: DateTime<Utc>) -> Entry<C> {
        Entry {
            id: raw.id,
            vary: normalize_vary(&raw.vary, &self.config.normalizers),
            content: raw.content,
            initial_age: raw.initial_age.map(secs).unwrap_or(Duration::ZERO),
            date: raw.date.unwrap_or(now),
            directives: ProducerDirectives::normalize(&raw.directives),
            validators: raw.validators,
        }
    }

    /// Normalizes and stores a batch of resources.
    ///
    /// For every resource, listeners registered via
    /// [`on_store`](Self::on_store) fire in input order before the store
    /// write starts.
    pub async fn store(&self, resources: Vec<NewEntry<C>>) -> CacheResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return match self.config.on_store_after_close {
                AfterClose::Error => Err(CacheError::Closed),
                AfterClose::Empty => Ok(()),
            };
        }

        let now = Utc::now();
        let mut batch = Vec::with_capacity(resources.len());
        {
            let listeners = self
                .listeners
                .lock()
                .expect("cache listener registry poisoned");
            for raw in resources {
                let entry = self.normalize_entry(raw, now);
                let max_store_for = entry.max_store_for(now);
                for listener in listeners.iter() {
                    listener(&entry, max_store_for);
                }
                batch.push((entry, max_store_for));
            }
        }

        self.store.store(batch).await
    }

    /// Removes every entry stored under `id`. Follows the same
    /// after-close policy as [`store`](Self::store).
    pub async fn delete(&self, id: &str) -> CacheResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return match self.config.on_store_after_close {
                AfterClose::Error => Err(CacheError::Closed),
                AfterClose::Empty => Ok(()),
            };
        }
        self.store.delete(id).await
    }

    /// Marks the cache closed and releases the backing store. Idempotent;
    /// only the first call reaches the store.
    pub async fn close(&self, timeout: Option<Duration>) -> CacheResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.store.close(timeout).await
    }
}

/// Groups entries by classification and picks the best candidate per
/// group; "best" is the greatest birth date, ties going to the entry
/// later in input order.
pub(crate) fn process_entries<C>(
    entries: Vec<Entry<C>>,
    directives: &ConsumerDirectives,
    now: DateTime<Utc>,
) -> Lookup<C>
where
    C: Clone,
{
    let mut best_usable: Option<usize> = None;
    let mut best_while_revalidate: Option<usize> = None;
    let mut best_if_error: Option<usize> = None;

    for (idx, entry) in entries.iter().enumerate() {
        let slot = match classify(entry, directives, now) {
            Usability::Usable => &mut best_usable,
            Usability::UsableWhileRevalidate => &mut best_while_revalidate,
            Usability::UsableIfError => &mut best_if_error,
            Usability::Unusable => continue,
        };
        let replaces = slot
            .map(|best| entry.birth_date() >= entries[best].birth_date())
            .unwrap_or(true);
        if replaces {
            *slot = Some(idx);
        }
    }

    if let Some(idx) = best_usable {
        return Lookup {
            usable: Some(entries[idx].clone()),
            ..Lookup::default()
        };
    }

    let validatable: Vec<Entry<C>> = entries
        .iter()
        .filter(|entry| entry.is_validatable())
        .cloned()
        .collect();

    if let Some(idx) = best_while_revalidate {
        return Lookup {
            usable_while_revalidate: Some(entries[idx].clone()),
            validatable,
            ..Lookup::default()
        };
    }

    Lookup {
        usable_if_error: best_if_error.map(|idx| entries[idx].clone()),
        validatable,
        ..Lookup::default()
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;

    use crate::directives::MaxStale;
    use crate::entry::Validators;
    use crate::params::Vary;
    use crate::store::InMemoryStore;

    use super::*;

    fn entry_aged(id: &str, content: &'static str, age: Duration, fresh: Duration) -> Entry<&'static str> {
        let now = Utc::now();
        Entry {
            id: id.into(),
            vary: Vary::new(),
            content,
            initial_age: Duration::ZERO,
            date: now - crate::entry::delta(age),
            directives: ProducerDirectives::fresh_for(fresh),
            validators: Validators::new(),
        }
    }

    fn cache() -> Cache<&'static str> {
        Cache::new(Arc::new(InMemoryStore::new()))
    }

    #[tokio::test]
    async fn unused_id_yields_empty_lookup() {
        let cache = cache();
        let lookup = cache.get(&CacheRequest::new("nothing")).await.unwrap();

        assert!(lookup.is_empty());
        assert_eq!(lookup, Lookup::default());
    }

    #[tokio::test]
    async fn usable_entry_suppresses_validatable() {
        let now = Utc::now();
        let mut stale = entry_aged("post", "stale", Duration::from_secs(30), Duration::from_secs(1));
        stale.validators.insert("etag".into(), serde_json::json!("v0"));
        let fresh = entry_aged("post", "fresh", Duration::ZERO, Duration::from_secs(60));

        let lookup = process_entries(vec![stale, fresh], &ConsumerDirectives::default(), now);
        assert_eq!(lookup.usable.as_ref().unwrap().content, "fresh");
        assert!(lookup.validatable.is_empty());
        assert!(lookup.usable_while_revalidate.is_none());
        assert!(lookup.usable_if_error.is_none());
    }

    #[tokio::test]
    async fn best_entry_has_greatest_birth_date() {
        let now = Utc::now();
        let older = entry_aged("post", "older", Duration::from_secs(20), Duration::from_secs(60));
        let newer = entry_aged("post", "newer", Duration::from_secs(5), Duration::from_secs(60));

        let lookup = process_entries(
            vec![newer.clone(), older.clone()],
            &ConsumerDirectives::default(),
            now,
        );
        assert_eq!(lookup.usable.unwrap().content, "newer");

        // tie on birth date: last in input order wins
        let lookup = process_entries(
            vec![older.clone(), older.clone()],
            &ConsumerDirectives::default(),
            now,
        );
        assert_eq!(lookup.usable.unwrap().content, "older");
    }

    #[tokio::test]
    async fn swr_entry_comes_with_validatable_list() {
        let now = Utc::now();
        let mut entry = entry_aged("post", "stale", Duration::from_secs(5), Duration::from_secs(1));
        entry.directives.max_stale = Some(MaxStale::new(
            Duration::ZERO,
            Duration::from_secs(10),
            Duration::from_secs(10),
        ));
        entry.validators.insert("etag".into(), serde_json::json!("w/1"));

        let lookup = process_entries(vec![entry.clone()], &ConsumerDirectives::default(), now);
        let swr = lookup.usable_while_revalidate.unwrap();
        assert_eq!(swr.content, "stale");
        assert_eq!(lookup.validatable, vec![entry]);
    }

    #[tokio::test]
    async fn get_many_matches_get_per_request() {
        let cache = cache();
        cache
            .store(vec![
                NewEntry {
                    directives: crate::directives::RawProducerDirectives {
                        fresh_until_age: 60.0,
                        ..Default::default()
                    },
                    ..NewEntry::new("a", "value-a")
                },
                NewEntry {
                    directives: crate::directives::RawProducerDirectives {
                        fresh_until_age: 60.0,
                        ..Default::default()
                    },
                    ..NewEntry::new("b", "value-b")
                },
            ])
            .await
            .unwrap();

        let requests = vec![
            CacheRequest::new("a"),
            CacheRequest::new("missing"),
            CacheRequest::new("b"),
        ];
        let lookups = cache.get_many(&requests).await.unwrap();
        assert_eq!(lookups.len(), 3);
        assert_eq!(lookups[0].usable.as_ref().unwrap().content, "value-a");
        assert!(lookups[1].is_empty());
        assert_eq!(lookups[2].usable.as_ref().unwrap().content, "value-b");

        for (request, bulk) in requests.iter().zip(&lookups) {
            let single = cache.get(request).await.unwrap();
            assert_eq!(single.usable.is_some(), bulk.usable.is_some());
        }
    }

    #[tokio::test]
    async fn store_listeners_fire_before_write_in_input_order() {
        use std::sync::Mutex as StdMutex;

        let cache = cache();
        let seen: Arc<StdMutex<Vec<(String, Option<Duration>)>>> = Arc::default();
        cache.on_store({
            let seen = Arc::clone(&seen);
            move |entry, max_store_for| {
                seen.lock().unwrap().push((entry.id.clone(), max_store_for));
            }
        });

        cache
            .store(vec![
                NewEntry::new("first", "1"),
                NewEntry {
                    directives: crate::directives::RawProducerDirectives {
                        fresh_until_age: 1.0,
                        store_for: Some(30.0),
                        ..Default::default()
                    },
                    ..NewEntry::new("second", "2")
                },
            ])
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], ("first".to_string(), None));
        assert_eq!(seen[1], ("second".to_string(), Some(Duration::from_secs(30))));
    }

    #[tokio::test]
    async fn closed_cache_policies() {
        let strict = cache();
        strict.close(None).await.unwrap();
        assert_eq!(
            strict.get(&CacheRequest::new("x")).await,
            Err(CacheError::Closed)
        );
        assert_eq!(strict.store(vec![NewEntry::new("x", "v")]).await, Err(CacheError::Closed));
        // close is idempotent
        strict.close(None).await.unwrap();

        let lenient: Cache<&'static str> = Cache::with_config(
            Arc::new(InMemoryStore::new()),
            CacheConfig {
                on_get_after_close: AfterClose::Empty,
                on_store_after_close: AfterClose::Empty,
                normalizers: ParamNormalizers::default(),
            },
        );
        lenient.close(None).await.unwrap();
        assert!(lenient.get(&CacheRequest::new("x")).await.unwrap().is_empty());
        lenient.store(vec![NewEntry::new("x", "v")]).await.unwrap();
    }

    #[tokio::test]
    async fn store_defaults_date_and_initial_age() {
        let cache = cache();
        let before = Utc::now();
        let entry = cache.normalize_entry(NewEntry::new("x", "v"), before);
        assert_eq!(entry.date, before);
        assert_eq!(entry.initial_age, Duration::ZERO);
        assert_eq!(entry.birth_date(), before);

        // negative raw initial age clamps to zero
        let raw = NewEntry {
            initial_age: Some(-3.0),
            ..NewEntry::new("x", "v")
        };
        let entry = cache.normalize_entry(raw, before);
        assert_eq!(entry.initial_age, Duration::ZERO);

        let raw = NewEntry {
            date: Some(before - TimeDelta::seconds(5)),
            initial_age: Some(2.0),
            ..NewEntry::new("x", "v")
        };
        let entry = cache.normalize_entry(raw, Utc::now());
        assert_eq!(entry.birth_date(), before - TimeDelta::seconds(7));
    }
}
