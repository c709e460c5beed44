//! Producer- and consumer-side cache directives.
//!
//! Directives arrive in *raw* form, fractional seconds as they come out of
//! configuration files or foreign callers, possibly negative, possibly with
//! staleness budgets out of order. Normalization turns them into the typed
//! form the rest of the crate works with: non-negative [`Duration`]s with
//! the monotonic invariant
//! `without_revalidation ≤ while_revalidate ≤ if_error`
//! enforced by raising each violating field up to its predecessor.
//!
//! The normalized types keep their budget fields private so the invariant
//! cannot be broken after construction; deserialization funnels through the
//! same clamping.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Converts raw seconds into a non-negative [`Duration`].
///
/// Negative and NaN inputs clamp to zero, `+∞` and out-of-range inputs to
/// [`Duration::MAX`].
pub(crate) fn secs(raw: f64) -> Duration {
    if !(raw > 0.0) {
        // catches negatives, zero and NaN
        return Duration::ZERO;
    }
    if raw >= Duration::MAX.as_secs_f64() {
        return Duration::MAX;
    }
    Duration::from_secs_f64(raw)
}

/// Unnormalized staleness budgets, in seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawMaxStale {
    pub without_revalidation: f64,
    pub while_revalidate: f64,
    pub if_error: f64,
}

/// Unnormalized producer directives, in seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawProducerDirectives {
    pub fresh_until_age: f64,
    pub max_stale: Option<RawMaxStale>,
    pub store_for: Option<f64>,
}

/// Unnormalized consumer staleness budgets, in seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawConsumerMaxStale {
    pub fresh_until_age: Option<f64>,
    pub without_revalidation: f64,
    pub while_revalidate: f64,
    pub if_error: f64,
}

/// Unnormalized consumer directives, in seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawConsumerDirectives {
    pub max_age: Option<f64>,
    pub max_stale: Option<RawConsumerMaxStale>,
}

/// Normalized producer staleness budgets.
///
/// Always satisfies `without_revalidation ≤ while_revalidate ≤ if_error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "MaxStaleWire", into = "MaxStaleWire")]
pub struct MaxStale {
    without_revalidation: Duration,
    while_revalidate: Duration,
    if_error: Duration,
}

#[derive(Clone, Copy, Serialize, Deserialize)]
struct MaxStaleWire {
    #[serde(with = "humantime_serde")]
    without_revalidation: Duration,
    #[serde(with = "humantime_serde")]
    while_revalidate: Duration,
    #[serde(with = "humantime_serde")]
    if_error: Duration,
}

impl From<MaxStaleWire> for MaxStale {
    fn from(wire: MaxStaleWire) -> Self {
        Self::new(
            wire.without_revalidation,
            wire.while_revalidate,
            wire.if_error,
        )
    }
}

impl From<MaxStale> for MaxStaleWire {
    fn from(ms: MaxStale) -> Self {
        Self {
            without_revalidation: ms.without_revalidation,
            while_revalidate: ms.while_revalidate,
            if_error: ms.if_error,
        }
    }
}

impl MaxStale {
    /// Producer default when the consumer supplied a budget but the
    /// producer did not: no producer-side restriction.
    pub(crate) const UNBOUNDED: MaxStale = MaxStale {
        without_revalidation: Duration::MAX,
        while_revalidate: Duration::MAX,
        if_error: Duration::MAX,
    };

    /// Builds a budget, clamping each field up to its predecessor.
    pub fn new(without_revalidation: Duration, while_revalidate: Duration, if_error: Duration) -> Self {
        let while_revalidate = while_revalidate.max(without_revalidation);
        let if_error = if_error.max(while_revalidate);
        Self {
            without_revalidation,
            while_revalidate,
            if_error,
        }
    }

    pub fn from_raw(raw: &RawMaxStale) -> Self {
        Self::new(
            secs(raw.without_revalidation),
            secs(raw.while_revalidate),
            secs(raw.if_error),
        )
    }

    /// How long past freshness the entry may be used without any
    /// revalidation at all.
    pub fn without_revalidation(&self) -> Duration {
        self.without_revalidation
    }

    /// How long past freshness the entry may be served while a background
    /// revalidation runs.
    pub fn while_revalidate(&self) -> Duration {
        self.while_revalidate
    }

    /// How long past freshness the entry may be served when the origin is
    /// unreachable.
    pub fn if_error(&self) -> Duration {
        self.if_error
    }
}

impl From<RawMaxStale> for MaxStale {
    fn from(raw: RawMaxStale) -> Self {
        Self::from_raw(&raw)
    }
}

impl From<MaxStale> for RawMaxStale {
    fn from(ms: MaxStale) -> Self {
        Self {
            without_revalidation: ms.without_revalidation.as_secs_f64(),
            while_revalidate: ms.while_revalidate.as_secs_f64(),
            if_error: ms.if_error.as_secs_f64(),
        }
    }
}

/// Normalized producer directives attached to an entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducerDirectives {
    /// Seconds from birth during which the entry is fresh.
    #[serde(with = "humantime_serde")]
    pub fresh_until_age: Duration,
    /// Staleness budgets, if the producer granted any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_stale: Option<MaxStale>,
    /// Maximum time the entry may remain in a store, measured from the
    /// moment the content was *generated*, not received.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "humantime_serde")]
    pub store_for: Option<Duration>,
}

impl ProducerDirectives {
    /// Directives for an entry that is fresh for the given duration and
    /// grants no staleness budget.
    pub fn fresh_for(fresh_until_age: Duration) -> Self {
        Self {
            fresh_until_age,
            ..Default::default()
        }
    }

    pub fn with_max_stale(mut self, max_stale: MaxStale) -> Self {
        self.max_stale = Some(max_stale);
        self
    }

    pub fn with_store_for(mut self, store_for: Duration) -> Self {
        self.store_for = Some(store_for);
        self
    }

    /// Normalizes raw directives: clamps `fresh_until_age` to non-negative
    /// and the staleness budgets to monotonic; `store_for` passes through.
    pub fn normalize(raw: &RawProducerDirectives) -> Self {
        Self {
            fresh_until_age: secs(raw.fresh_until_age),
            max_stale: raw.max_stale.as_ref().map(MaxStale::from_raw),
            store_for: raw.store_for.map(secs),
        }
    }
}

impl From<RawProducerDirectives> for ProducerDirectives {
    fn from(raw: RawProducerDirectives) -> Self {
        Self::normalize(&raw)
    }
}

impl From<ProducerDirectives> for RawProducerDirectives {
    fn from(directives: ProducerDirectives) -> Self {
        Self {
            fresh_until_age: directives.fresh_until_age.as_secs_f64(),
            max_stale: directives.max_stale.map(RawMaxStale::from),
            store_for: directives.store_for.map(|d| d.as_secs_f64()),
        }
    }
}

/// Normalized consumer staleness budgets.
///
/// Same monotonic invariant as [`MaxStale`]; the optional
/// `fresh_until_age` lets the consumer *tighten* (never loosen) the
/// effective freshness lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "ConsumerMaxStaleWire", into = "ConsumerMaxStaleWire")]
pub struct ConsumerMaxStale {
    fresh_until_age: Option<Duration>,
    without_revalidation: Duration,
    while_revalidate: Duration,
    if_error: Duration,
}

#[derive(Clone, Copy, Serialize, Deserialize)]
struct ConsumerMaxStaleWire {
    #[serde(default, skip_serializing_if = "Option::is_none", with = "humantime_serde")]
    fresh_until_age: Option<Duration>,
    #[serde(with = "humantime_serde")]
    without_revalidation: Duration,
    #[serde(with = "humantime_serde")]
    while_revalidate: Duration,
    #[serde(with = "humantime_serde")]
    if_error: Duration,
}

impl From<ConsumerMaxStaleWire> for ConsumerMaxStale {
    fn from(wire: ConsumerMaxStaleWire) -> Self {
        Self::new(
            wire.fresh_until_age,
            wire.without_revalidation,
            wire.while_revalidate,
            wire.if_error,
        )
    }
}

impl From<ConsumerMaxStale> for ConsumerMaxStaleWire {
    fn from(ms: ConsumerMaxStale) -> Self {
        Self {
            fresh_until_age: ms.fresh_until_age,
            without_revalidation: ms.without_revalidation,
            while_revalidate: ms.while_revalidate,
            if_error: ms.if_error,
        }
    }
}

impl ConsumerMaxStale {
    pub fn new(
        fresh_until_age: Option<Duration>,
        without_revalidation: Duration,
        while_revalidate: Duration,
        if_error: Duration,
    ) -> Self {
        let while_revalidate = while_revalidate.max(without_revalidation);
        let if_error = if_error.max(while_revalidate);
        Self {
            fresh_until_age,
            without_revalidation,
            while_revalidate,
            if_error,
        }
    }

    pub fn from_raw(raw: &RawConsumerMaxStale) -> Self {
        Self::new(
            raw.fresh_until_age.map(secs),
            secs(raw.without_revalidation),
            secs(raw.while_revalidate),
            secs(raw.if_error),
        )
    }

    /// The consumer-side default when the *producer* supplied a budget but
    /// the consumer did not: the consumer accepts revalidation-gated
    /// staleness up to the producer's limits, but no unrevalidated
    /// staleness. This mirrors HTTP's behavior when `max-stale` is omitted.
    pub(crate) fn defaulted_from_producer(producer: &MaxStale) -> Self {
        Self::new(
            None,
            Duration::ZERO,
            producer.while_revalidate(),
            producer.if_error(),
        )
    }

    /// The consumer-side default when neither party supplied a budget.
    pub(crate) fn zero() -> Self {
        Self::new(None, Duration::ZERO, Duration::ZERO, Duration::ZERO)
    }

    /// A consumer-imposed ceiling on the freshness lifetime, if any.
    pub fn fresh_until_age(&self) -> Option<Duration> {
        self.fresh_until_age
    }

    pub fn without_revalidation(&self) -> Duration {
        self.without_revalidation
    }

    pub fn while_revalidate(&self) -> Duration {
        self.while_revalidate
    }

    pub fn if_error(&self) -> Duration {
        self.if_error
    }
}

impl From<RawConsumerMaxStale> for ConsumerMaxStale {
    fn from(raw: RawConsumerMaxStale) -> Self {
        Self::from_raw(&raw)
    }
}

impl From<ConsumerMaxStale> for RawConsumerMaxStale {
    fn from(ms: ConsumerMaxStale) -> Self {
        Self {
            fresh_until_age: ms.fresh_until_age.map(|d| d.as_secs_f64()),
            without_revalidation: ms.without_revalidation.as_secs_f64(),
            while_revalidate: ms.while_revalidate.as_secs_f64(),
            if_error: ms.if_error.as_secs_f64(),
        }
    }
}

/// Normalized consumer directives attached to a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerDirectives {
    /// Hard ceiling on entry age, regardless of freshness.
    ///
    /// `Some(ZERO)` effectively bypasses the cache.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "humantime_serde")]
    pub max_age: Option<Duration>,
    /// The consumer's staleness tolerance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_stale: Option<ConsumerMaxStale>,
}

impl ConsumerDirectives {
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    pub fn with_max_stale(mut self, max_stale: ConsumerMaxStale) -> Self {
        self.max_stale = Some(max_stale);
        self
    }

    pub fn normalize(raw: &RawConsumerDirectives) -> Self {
        Self {
            max_age: raw.max_age.map(secs),
            max_stale: raw.max_stale.as_ref().map(ConsumerMaxStale::from_raw),
        }
    }
}

impl From<RawConsumerDirectives> for ConsumerDirectives {
    fn from(raw: RawConsumerDirectives) -> Self {
        Self::normalize(&raw)
    }
}

impl From<ConsumerDirectives> for RawConsumerDirectives {
    fn from(directives: ConsumerDirectives) -> Self {
        Self {
            max_age: directives.max_age.map(|d| d.as_secs_f64()),
            max_stale: directives.max_stale.map(RawConsumerMaxStale::from),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_inputs_clamp_to_zero() {
        let directives = ProducerDirectives::normalize(&RawProducerDirectives {
            fresh_until_age: -5.0,
            max_stale: Some(RawMaxStale {
                without_revalidation: -1.0,
                while_revalidate: -2.0,
                if_error: -3.0,
            }),
            store_for: Some(-10.0),
        });

        assert_eq!(directives.fresh_until_age, Duration::ZERO);
        let ms = directives.max_stale.unwrap();
        assert_eq!(ms.without_revalidation(), Duration::ZERO);
        assert_eq!(ms.while_revalidate(), Duration::ZERO);
        assert_eq!(ms.if_error(), Duration::ZERO);
        assert_eq!(directives.store_for, Some(Duration::ZERO));
    }

    #[test]
    fn violators_are_raised_to_their_predecessor() {
        let ms = MaxStale::from_raw(&RawMaxStale {
            without_revalidation: 10.0,
            while_revalidate: 4.0,
            if_error: 6.0,
        });

        assert_eq!(ms.without_revalidation(), Duration::from_secs(10));
        assert_eq!(ms.while_revalidate(), Duration::from_secs(10));
        assert_eq!(ms.if_error(), Duration::from_secs(10));

        let ms = MaxStale::from_raw(&RawMaxStale {
            without_revalidation: 1.0,
            while_revalidate: 5.0,
            if_error: 2.0,
        });
        assert_eq!(ms.if_error(), Duration::from_secs(5));
    }

    #[test]
    fn normalization_is_idempotent() {
        let shapes = [
            RawProducerDirectives::default(),
            RawProducerDirectives {
                fresh_until_age: 0.25,
                max_stale: Some(RawMaxStale {
                    without_revalidation: 3.0,
                    while_revalidate: 1.0,
                    if_error: 0.5,
                }),
                store_for: Some(60.0),
            },
            RawProducerDirectives {
                fresh_until_age: -1.0,
                max_stale: Some(RawMaxStale {
                    without_revalidation: -0.5,
                    while_revalidate: 2.0,
                    if_error: 1.0,
                }),
                store_for: None,
            },
        ];

        for raw in shapes {
            let once = ProducerDirectives::normalize(&raw);
            let twice = ProducerDirectives::normalize(&RawProducerDirectives::from(once));
            assert_eq!(once, twice, "normalize must be idempotent for {raw:?}");
        }

        let consumer_shapes = [
            RawConsumerDirectives::default(),
            RawConsumerDirectives {
                max_age: Some(-2.0),
                max_stale: Some(RawConsumerMaxStale {
                    fresh_until_age: Some(0.1),
                    without_revalidation: 5.0,
                    while_revalidate: 1.0,
                    if_error: 10.0,
                }),
            },
        ];
        for raw in consumer_shapes {
            let once = ConsumerDirectives::normalize(&raw);
            let twice = ConsumerDirectives::normalize(&RawConsumerDirectives::from(once));
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn monotonic_invariant_survives_deserialization() {
        let ms: MaxStale = serde_json::from_str(
            r#"{"without_revalidation": "10s", "while_revalidate": "2s", "if_error": "1s"}"#,
        )
        .unwrap();

        assert!(ms.without_revalidation() <= ms.while_revalidate());
        assert!(ms.while_revalidate() <= ms.if_error());
    }

    #[test]
    fn infinite_and_nan_seconds_are_tamed() {
        assert_eq!(secs(f64::NEG_INFINITY), Duration::ZERO);
        assert_eq!(secs(f64::NAN), Duration::ZERO);
        assert_eq!(secs(f64::INFINITY), Duration::MAX);
    }
}
