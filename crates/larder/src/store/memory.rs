use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;

use crate::entry::{delta, Entry};
use crate::error::CacheResult;
use crate::key::EntryKey;
use crate::params::{vary_matches, Params};

use super::EntryStore;

/// An entry together with the wall-clock instant it stops being worth
/// keeping.
#[derive(Debug, Clone)]
struct StoredEntry<C> {
    entry: Entry<C>,
    evict_at: Option<DateTime<Utc>>,
}

impl<C> StoredEntry<C> {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.evict_at.is_some_and(|evict_at| evict_at <= now)
    }
}

/// An in-memory store keeping all vary variants of an id together.
///
/// Expired entries are dropped lazily, on the read path and whenever the
/// id's variant set is rewritten. Total size is bounded by a weigher that
/// counts variants, so ids with many variants cost proportionally more of
/// the capacity.
pub struct InMemoryStore<C>
where
    C: Clone + Send + Sync + 'static,
{
    entries: moka::future::Cache<String, Arc<Vec<StoredEntry<C>>>>,
}

impl<C> InMemoryStore<C>
where
    C: Clone + Send + Sync + 'static,
{
    /// Default capacity, in entries (not ids).
    const DEFAULT_CAPACITY: u64 = 100 * 1024;

    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    pub fn with_capacity(max_entries: u64) -> Self {
        let entries = moka::future::Cache::builder()
            .name("larder-memory-store")
            .max_capacity(max_entries)
            .weigher(|_id, variants: &Arc<Vec<StoredEntry<C>>>| variants.len().max(1) as u32)
            .build();
        Self { entries }
    }

    /// The number of ids currently held (variants not counted).
    pub fn id_count(&self) -> u64 {
        self.entries.entry_count()
    }
}

impl<C> Default for InMemoryStore<C>
where
    C: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<C> std::fmt::Debug for InMemoryStore<C>
where
    C: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStore")
            .field("ids", &self.entries.entry_count())
            .finish()
    }
}

impl<C> EntryStore<C> for InMemoryStore<C>
where
    C: Clone + Send + Sync + 'static,
{
    fn get<'a>(&'a self, id: &'a str, params: &'a Params) -> BoxFuture<'a, CacheResult<Vec<Entry<C>>>> {
        Box::pin(async move {
            let now = Utc::now();
            let Some(variants) = self.entries.get(id).await else {
                return Ok(Vec::new());
            };

            Ok(variants
                .iter()
                .filter(|stored| !stored.is_expired(now))
                .filter(|stored| vary_matches(&stored.entry.vary, params))
                .map(|stored| stored.entry.clone())
                .collect())
        })
    }

    fn store<'a>(
        &'a self,
        batch: Vec<(Entry<C>, Option<Duration>)>,
    ) -> BoxFuture<'a, CacheResult<()>> {
        Box::pin(async move {
            let now = Utc::now();

            // Resolve same-key collisions within the batch first: the
            // entry with the latest birth date wins, later input wins a
            // tie. Grouped per id so each id needs a single upsert.
            let mut per_id: HashMap<String, HashMap<EntryKey, StoredEntry<C>>> = HashMap::new();
            for (entry, max_store_for) in batch {
                let stored = StoredEntry {
                    // a bound too far in the future to represent is no bound
                    evict_at: max_store_for.and_then(|d| now.checked_add_signed(delta(d))),
                    entry,
                };
                let variants = per_id.entry(stored.entry.id.clone()).or_default();
                match variants.entry(stored.entry.key()) {
                    std::collections::hash_map::Entry::Occupied(mut slot) => {
                        if stored.entry.birth_date() >= slot.get().entry.birth_date() {
                            slot.insert(stored);
                        }
                    }
                    std::collections::hash_map::Entry::Vacant(slot) => {
                        slot.insert(stored);
                    }
                }
            }

            for (id, incoming) in per_id {
                self.entries
                    .entry(id)
                    .and_upsert_with(|existing| {
                        // keep surviving variants the batch does not replace
                        let mut merged: Vec<StoredEntry<C>> = existing
                            .map(|e| e.into_value())
                            .map(|variants| {
                                variants
                                    .iter()
                                    .filter(|stored| !stored.is_expired(now))
                                    .filter(|stored| !incoming.contains_key(&stored.entry.key()))
                                    .cloned()
                                    .collect()
                            })
                            .unwrap_or_default();
                        merged.extend(incoming.into_values());
                        std::future::ready(Arc::new(merged))
                    })
                    .await;
            }

            Ok(())
        })
    }

    fn delete<'a>(&'a self, id: &'a str) -> BoxFuture<'a, CacheResult<()>> {
        Box::pin(async move {
            self.entries.invalidate(id).await;
            Ok(())
        })
    }

    fn close<'a>(&'a self, _timeout: Option<Duration>) -> BoxFuture<'a, CacheResult<()>> {
        Box::pin(async move {
            self.entries.run_pending_tasks().await;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;
    use serde_json::json;

    use crate::directives::ProducerDirectives;
    use crate::entry::Validators;
    use crate::params::{Vary, VaryValue};

    use super::*;

    fn entry(id: &str, vary: Vary, content: &'static str, date: DateTime<Utc>) -> Entry<&'static str> {
        Entry {
            id: id.into(),
            vary,
            content,
            initial_age: Duration::ZERO,
            date,
            directives: ProducerDirectives::fresh_for(Duration::from_secs(60)),
            validators: Validators::new(),
        }
    }

    fn user_vary(user: &str) -> Vary {
        Vary::from([("user".to_string(), VaryValue::Value(json!(user)))])
    }

    #[tokio::test]
    async fn get_filters_by_vary_compatibility() {
        let store = InMemoryStore::new();
        let now = Utc::now();

        store
            .store(vec![
                (entry("post", user_vary("u1"), "for u1", now), None),
                (entry("post", user_vary("u2"), "for u2", now), None),
                (entry("post", Vary::new(), "for all", now), None),
            ])
            .await
            .unwrap();

        let params = Params::from([("user".to_string(), json!("u1"))]);
        let mut contents: Vec<_> = store
            .get("post", &params)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.content)
            .collect();
        contents.sort();
        assert_eq!(contents, vec!["for all", "for u1"]);

        let found = store.get("post", &Params::new()).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].content, "for all");
    }

    #[tokio::test]
    async fn upsert_replaces_same_key() {
        let store = InMemoryStore::new();
        let now = Utc::now();

        store
            .store(vec![(entry("post", Vary::new(), "v1", now), None)])
            .await
            .unwrap();
        store
            .store(vec![(
                entry("post", Vary::new(), "v2", now + TimeDelta::seconds(1)),
                None,
            )])
            .await
            .unwrap();

        let found = store.get("post", &Params::new()).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].content, "v2");
    }

    #[tokio::test]
    async fn batch_collision_keeps_latest_birth_date() {
        let store = InMemoryStore::new();
        let now = Utc::now();

        store
            .store(vec![
                (entry("post", Vary::new(), "newer", now + TimeDelta::seconds(5)), None),
                (entry("post", Vary::new(), "older", now), None),
            ])
            .await
            .unwrap();

        let found = store.get("post", &Params::new()).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].content, "newer");
    }

    #[tokio::test]
    async fn expired_entries_are_not_returned() {
        let store = InMemoryStore::new();
        let now = Utc::now();

        store
            .store(vec![(
                entry("post", Vary::new(), "short-lived", now),
                Some(Duration::ZERO),
            )])
            .await
            .unwrap();

        assert!(store.get("post", &Params::new()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_removes_all_variants() {
        let store = InMemoryStore::new();
        let now = Utc::now();

        store
            .store(vec![
                (entry("post", user_vary("u1"), "a", now), None),
                (entry("post", user_vary("u2"), "b", now), None),
            ])
            .await
            .unwrap();

        store.delete("post").await.unwrap();

        let params = Params::from([("user".to_string(), json!("u1"))]);
        assert!(store.get("post", &params).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn get_many_preserves_order() {
        let store = InMemoryStore::new();
        let now = Utc::now();

        store
            .store(vec![
                (entry("a", Vary::new(), "a", now), None),
                (entry("b", Vary::new(), "b", now), None),
            ])
            .await
            .unwrap();

        let requests = vec![
            ("b".to_string(), Params::new()),
            ("missing".to_string(), Params::new()),
            ("a".to_string(), Params::new()),
        ];
        let results = store.get_many(&requests).await.unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0][0].content, "b");
        assert!(results[1].is_empty());
        assert_eq!(results[2][0].content, "a");
    }
}
