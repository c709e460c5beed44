//! Process-wide cache outcome diagnostics.
//!
//! The wrappers publish one message per request they handle, stating how
//! the request was satisfied. Fan-out is synchronous: subscribers run on
//! the publisher's task and must be cheap; hand the message off to a
//! channel if you need to do real work with it.
//!
//! This registry is the only process-wide state in the crate; everything
//! else is instance-scoped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::Serialize;

/// How a wrapper satisfied a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Served from cache, fresh.
    Hit,
    /// Served from cache while a background revalidation runs.
    StaleWhileRevalidate,
    /// The consumer asked for `max_age` zero, skipping the cache.
    Bypass,
    /// Nothing usable cached; the producer was called.
    Miss,
    /// The request was not cacheable at all.
    Uncacheable,
}

impl AsRef<str> for Outcome {
    fn as_ref(&self) -> &str {
        match self {
            Self::Hit => "hit",
            Self::StaleWhileRevalidate => "stale_while_revalidate",
            Self::Bypass => "bypass",
            Self::Miss => "miss",
            Self::Uncacheable => "uncacheable",
        }
    }
}

/// A single diagnostics message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    /// The wrapper's configured cache name, if any.
    pub cache_name: Option<String>,
    pub outcome: Outcome,
    /// The id of the request.
    pub cache_key: String,
}

type Subscriber = Arc<dyn Fn(&Diagnostic) + Send + Sync>;

static SUBSCRIBERS: Lazy<RwLock<Vec<(u64, Subscriber)>>> = Lazy::new(Default::default);
static NEXT_SUBSCRIBER_ID: AtomicU64 = AtomicU64::new(0);

/// A live diagnostics subscription; dropping it unsubscribes.
#[must_use = "dropping the subscription immediately unsubscribes"]
pub struct Subscription {
    id: u64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        SUBSCRIBERS.write().retain(|(id, _)| *id != self.id);
    }
}

/// Registers a subscriber for every diagnostics message published in this
/// process.
pub fn subscribe(subscriber: impl Fn(&Diagnostic) + Send + Sync + 'static) -> Subscription {
    let id = NEXT_SUBSCRIBER_ID.fetch_add(1, Ordering::Relaxed);
    SUBSCRIBERS.write().push((id, Arc::new(subscriber)));
    Subscription { id }
}

pub(crate) fn publish(cache_name: Option<&str>, outcome: Outcome, cache_key: &str) {
    let subscribers = SUBSCRIBERS.read();
    if subscribers.is_empty() {
        return;
    }
    let diagnostic = Diagnostic {
        cache_name: cache_name.map(str::to_owned),
        outcome,
        cache_key: cache_key.to_owned(),
    };
    for (_, subscriber) in subscribers.iter() {
        subscriber(&diagnostic);
    }
}
