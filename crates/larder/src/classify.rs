//! The freshness/staleness decision engine.
//!
//! [`classify`] is the single place where producer rules and consumer
//! tolerance meet. It is pure: given an entry, the consumer's directives
//! and an instant, it decides which of four usability categories the entry
//! falls into. Everything else in the crate (the façade's grouping, the
//! wrappers' stale-while-revalidate and stale-if-error behavior) is built
//! on top of this verdict.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use crate::directives::{ConsumerDirectives, ConsumerMaxStale, MaxStale};
use crate::entry::{delta, Entry};

/// How usable a stored entry is for a particular request at a particular
/// instant.
///
/// Ordered from best to worst, and an entry only ever moves down this
/// ladder as time passes (for fixed directives).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Usability {
    /// Fresh enough to serve as-is.
    Usable,
    /// Stale, but may be served while a background revalidation runs.
    UsableWhileRevalidate,
    /// Stale, but may be served if the producer turns out to be
    /// unavailable.
    UsableIfError,
    /// May not be served under any of the supplied directives.
    Unusable,
}

fn saturating_add(a: TimeDelta, b: TimeDelta) -> TimeDelta {
    a.checked_add(&b).unwrap_or(TimeDelta::MAX)
}

/// Classifies `entry` for a consumer at the instant `now`.
///
/// Every directive from both sides is satisfied independently; no
/// directive can loosen another. All boundary comparisons are non-strict,
/// so an age exactly on a threshold classifies into the tighter bucket.
///
/// The decision procedure:
///
/// 1. The consumer's `max_age` is a hard ceiling: an entry older than
///    that is [`Unusable`](Usability::Unusable) no matter what.
/// 2. The effective freshness lifetime is the producer's
///    `fresh_until_age`, tightened by the consumer's optional one. Within
///    it the entry is [`Usable`](Usability::Usable).
/// 3. Past it, the per-field minimum of the producer's and consumer's
///    staleness budgets decides; a side that supplied no budget gets the
///    defaults mirroring HTTP's omitted `max-stale` semantics.
pub fn classify<C>(entry: &Entry<C>, consumer: &ConsumerDirectives, now: DateTime<Utc>) -> Usability {
    let age = entry.age(now);

    if let Some(max_age) = consumer.max_age {
        if age > delta(max_age) {
            return Usability::Unusable;
        }
    }

    let fresh_lifetime = consumer
        .max_stale
        .and_then(|ms| ms.fresh_until_age())
        .unwrap_or(Duration::MAX)
        .min(entry.directives.fresh_until_age);
    if age <= delta(fresh_lifetime) {
        return Usability::Usable;
    }

    let producer_stale = entry.directives.max_stale;
    let consumer_stale = consumer.max_stale;
    if producer_stale.is_none() && consumer_stale.is_none() {
        return Usability::Unusable;
    }

    let producer_stale = producer_stale.unwrap_or(MaxStale::UNBOUNDED);
    let consumer_stale = consumer_stale.unwrap_or_else(|| match entry.directives.max_stale {
        Some(ref producer) => ConsumerMaxStale::defaulted_from_producer(producer),
        None => ConsumerMaxStale::zero(),
    });

    let threshold = |producer_budget: Duration, consumer_budget: Duration| {
        saturating_add(
            delta(fresh_lifetime),
            delta(producer_budget.min(consumer_budget)),
        )
    };

    if age
        <= threshold(
            producer_stale.without_revalidation(),
            consumer_stale.without_revalidation(),
        )
    {
        Usability::Usable
    } else if age
        <= threshold(
            producer_stale.while_revalidate(),
            consumer_stale.while_revalidate(),
        )
    {
        Usability::UsableWhileRevalidate
    } else if age <= threshold(producer_stale.if_error(), consumer_stale.if_error()) {
        Usability::UsableIfError
    } else {
        Usability::Unusable
    }
}
