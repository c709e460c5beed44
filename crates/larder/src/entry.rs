//! The stored unit of the cache and its age arithmetic.
//!
//! An [`Entry`] is a normalized producer result, keyed by `(id, vary)`.
//! All derived time quantities hang off of it: the birth date (when the
//! *origin* generated the content, as opposed to when this cache received
//! it), the signed age relative to an instant, freshness, and the two
//! store-lifetime bounds.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::directives::{ProducerDirectives, RawProducerDirectives};
use crate::key::EntryKey;
use crate::params::Vary;

/// Opaque validation data (etags, versions, ...) attached to an entry.
///
/// A non-empty mapping means the entry can be cheaply revalidated against
/// the origin instead of being recomputed.
pub type Validators = BTreeMap<String, serde_json::Value>;

/// Saturating conversion from an unsigned span to a signed one.
pub(crate) fn delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}

/// A stored, normalized producer result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry<C> {
    /// Opaque identifier; the primary part of the store key.
    pub id: String,
    /// The params this response depended on; the secondary part of the key.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub vary: Vary,
    /// The payload.
    pub content: C,
    /// Age the content already had at the moment of `date`.
    ///
    /// Non-zero when the entry travelled through another cache before
    /// reaching this one.
    #[serde(with = "humantime_serde")]
    pub initial_age: Duration,
    /// Wall-clock instant this cache received the entry.
    pub date: DateTime<Utc>,
    /// The producer's freshness rules.
    pub directives: ProducerDirectives,
    /// Validation data; empty when the entry cannot be revalidated.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub validators: Validators,
}

impl<C> Entry<C> {
    /// The store key of this entry.
    pub fn key(&self) -> EntryKey {
        EntryKey::new(&self.id, &self.vary)
    }

    /// When the origin produced the content: `date − initial_age`.
    pub fn birth_date(&self) -> DateTime<Utc> {
        self.date
            .checked_sub_signed(delta(self.initial_age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Signed age at `at`; negative when `at` precedes the birth date.
    pub fn age(&self, at: DateTime<Utc>) -> TimeDelta {
        at.signed_duration_since(self.birth_date())
    }

    /// Whether the entry is within its producer-declared freshness
    /// lifetime at `at`. A negative age is not fresh.
    pub fn is_fresh(&self, at: DateTime<Utc>) -> bool {
        let age = self.age(at);
        age >= TimeDelta::zero() && age <= delta(self.directives.fresh_until_age)
    }

    /// Whether the entry carries validation information.
    pub fn is_validatable(&self) -> bool {
        !self.validators.is_empty()
    }

    /// How much longer this entry could possibly be served under any
    /// combination of directives, or `None` when there is no such bound.
    ///
    /// An entry with a staleness budget and no validators is dead once it
    /// outlives `fresh_until_age + max_stale.if_error`; everything else
    /// may still be useful indefinitely (validatable entries can be
    /// revalidated, budget-less entries depend on future consumer
    /// tolerance).
    pub fn potentially_useful_for(&self, now: DateTime<Utc>) -> Option<Duration> {
        let max_stale = self.directives.max_stale?;
        if self.is_validatable() {
            return None;
        }

        let lifetime = delta(self.directives.fresh_until_age.saturating_add(max_stale.if_error()));
        let remaining = lifetime
            .checked_sub(&self.age(now))
            .unwrap_or(TimeDelta::MAX);
        Some(remaining.to_std().unwrap_or(Duration::ZERO))
    }

    /// The maximum time this entry may remain in a store, from `now`.
    ///
    /// Combines the producer's `store_for` (which counts from content
    /// *generation*, hence the `initial_age` correction) with
    /// [`potentially_useful_for`](Self::potentially_useful_for), clamped
    /// to non-negative. `None` means unbounded.
    pub fn max_store_for(&self, now: DateTime<Utc>) -> Option<Duration> {
        let requested = self.directives.store_for.map(|store_for| {
            delta(store_for)
                .checked_sub(&delta(self.initial_age))
                .unwrap_or(TimeDelta::MIN)
        });
        let useful = self.potentially_useful_for(now).map(delta);

        let bound = match (requested, useful) {
            (Some(requested), Some(useful)) => requested.min(useful),
            (Some(requested), None) => requested,
            (None, Some(useful)) => useful,
            (None, None) => return None,
        };
        Some(bound.max(TimeDelta::zero()).to_std().unwrap_or(Duration::ZERO))
    }
}

/// A resource as a producer hands it over, before the id of the
/// requesting call is attached.
#[derive(Debug, Clone, Default)]
pub struct ProducedResource<C> {
    pub content: C,
    pub vary: Vary,
    /// Raw seconds of age the content already had; clamped on store.
    pub initial_age: Option<f64>,
    /// When this cache received the resource; defaults to the store time.
    pub date: Option<DateTime<Utc>>,
    pub directives: RawProducerDirectives,
    pub validators: Validators,
}

impl<C> ProducedResource<C> {
    pub fn new(content: C) -> Self {
        Self {
            content,
            vary: Vary::new(),
            initial_age: None,
            date: None,
            directives: RawProducerDirectives::default(),
            validators: Validators::new(),
        }
    }

    /// Attaches the id of the requesting call.
    pub fn into_new_entry(self, id: impl Into<String>) -> NewEntry<C> {
        NewEntry {
            id: id.into(),
            content: self.content,
            vary: self.vary,
            initial_age: self.initial_age,
            date: self.date,
            directives: self.directives,
            validators: self.validators,
        }
    }
}

/// Input to [`Cache::store`](crate::Cache::store): a resource plus the id
/// it should be stored under. Optional fields are defaulted during
/// normalization.
#[derive(Debug, Clone)]
pub struct NewEntry<C> {
    pub id: String,
    pub content: C,
    pub vary: Vary,
    pub initial_age: Option<f64>,
    pub date: Option<DateTime<Utc>>,
    pub directives: RawProducerDirectives,
    pub validators: Validators,
}

impl<C> NewEntry<C> {
    pub fn new(id: impl Into<String>, content: C) -> Self {
        ProducedResource::new(content).into_new_entry(id)
    }
}

#[cfg(test)]
mod tests {
    use crate::directives::{MaxStale, RawMaxStale};

    use super::*;

    fn entry(initial_age: Duration, date: DateTime<Utc>) -> Entry<&'static str> {
        Entry {
            id: "item".into(),
            vary: Vary::new(),
            content: "payload",
            initial_age,
            date,
            directives: ProducerDirectives::fresh_for(Duration::from_secs(10)),
            validators: Validators::new(),
        }
    }

    #[test]
    fn birth_date_subtracts_initial_age() {
        let date = Utc::now();
        let e = entry(Duration::from_secs(7), date);
        assert_eq!(e.birth_date(), date - TimeDelta::seconds(7));

        let e = entry(Duration::ZERO, date);
        assert_eq!(e.birth_date(), date);
    }

    #[test]
    fn age_is_signed() {
        let date = Utc::now();
        let e = entry(Duration::ZERO, date);

        assert_eq!(e.age(date + TimeDelta::seconds(5)), TimeDelta::seconds(5));
        assert_eq!(e.age(date - TimeDelta::seconds(5)), TimeDelta::seconds(-5));
    }

    #[test]
    fn freshness_window() {
        let date = Utc::now();
        let e = entry(Duration::ZERO, date);

        assert!(e.is_fresh(date));
        assert!(e.is_fresh(date + TimeDelta::seconds(10)));
        assert!(!e.is_fresh(date + TimeDelta::seconds(11)));
        // an entry "from the future" is not fresh
        assert!(!e.is_fresh(date - TimeDelta::seconds(1)));
    }

    #[test]
    fn useful_lifetime_requires_budget_and_no_validators() {
        let now = Utc::now();

        // no budget at all: unbounded
        let e = entry(Duration::ZERO, now);
        assert_eq!(e.potentially_useful_for(now), None);

        // budget, no validators: fresh lifetime + if_error budget
        let mut e = entry(Duration::ZERO, now);
        e.directives.max_stale = Some(MaxStale::from_raw(&RawMaxStale {
            without_revalidation: 0.0,
            while_revalidate: 5.0,
            if_error: 20.0,
        }));
        assert_eq!(e.potentially_useful_for(now), Some(Duration::from_secs(30)));
        assert_eq!(
            e.potentially_useful_for(now + TimeDelta::seconds(25)),
            Some(Duration::from_secs(5))
        );
        assert_eq!(
            e.potentially_useful_for(now + TimeDelta::seconds(31)),
            Some(Duration::ZERO)
        );

        // validators make it revalidatable forever
        e.validators.insert("etag".into(), serde_json::json!("w/1"));
        assert_eq!(e.potentially_useful_for(now), None);
    }

    #[test]
    fn store_lifetime_counts_from_generation() {
        let now = Utc::now();
        let mut e = entry(Duration::from_secs(40), now);
        e.directives.store_for = Some(Duration::from_secs(60));

        // 60s from generation, 40s already elapsed elsewhere
        assert_eq!(e.max_store_for(now), Some(Duration::from_secs(20)));

        // store_for smaller than initial_age clamps to zero
        e.directives.store_for = Some(Duration::from_secs(30));
        assert_eq!(e.max_store_for(now), Some(Duration::ZERO));

        // no bound at all
        e.directives.store_for = None;
        assert_eq!(e.max_store_for(now), None);
    }

    #[test]
    fn store_lifetime_capped_by_usefulness() {
        let now = Utc::now();
        let mut e = entry(Duration::ZERO, now);
        e.directives.store_for = Some(Duration::from_secs(3600));
        e.directives.max_stale = Some(MaxStale::new(
            Duration::ZERO,
            Duration::ZERO,
            Duration::from_secs(5),
        ));

        // useful for fresh(10) + if_error(5) only
        assert_eq!(e.max_store_for(now), Some(Duration::from_secs(15)));
    }

    #[test]
    fn entry_serializes_date_as_iso8601() {
        let e = entry(Duration::ZERO, "2026-08-02T12:00:00Z".parse().unwrap());
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["date"], serde_json::json!("2026-08-02T12:00:00Z"));
    }
}
