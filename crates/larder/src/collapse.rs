//! Request collapsing.
//!
//! A [`Collapser`] wraps an async function so that calls with the same
//! canonical key *started within a sliding time window* share a single
//! underlying invocation. The invocation runs on its own spawned task, so
//! a joiner going away never cancels work that other joiners (or the
//! original caller) still want.
//!
//! A pending slot is evicted when its window closes, not when the call
//! resolves: the window is a guarantee about "started within", so a late
//! joiner inside the window shares an already-resolved result.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;

use crate::error::{CacheError, CacheResult};

type SharedResult<U> = Shared<BoxFuture<'static, CacheResult<U>>>;

struct Pending<U> {
    started: Instant,
    shared: SharedResult<U>,
}

/// Coalesces concurrent or near-concurrent identical calls.
pub struct Collapser<T, U> {
    f: Arc<dyn Fn(T) -> BoxFuture<'static, CacheResult<U>> + Send + Sync>,
    key_of: Arc<dyn Fn(&T) -> String + Send + Sync>,
    window: Duration,
    pending: Arc<Mutex<HashMap<String, Pending<U>>>>,
}

impl<T, U> Collapser<T, U>
where
    T: Send + 'static,
    U: Clone + Send + Sync + 'static,
{
    /// Wraps `f`.
    ///
    /// `key_of` must be canonical: two arguments that should share a call
    /// must map to the same string regardless of irrelevant differences
    /// such as map-key ordering (see [`canonical_json`](crate::canonical_json)).
    pub fn new(
        window: Duration,
        key_of: impl Fn(&T) -> String + Send + Sync + 'static,
        f: impl Fn(T) -> BoxFuture<'static, CacheResult<U>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            f: Arc::new(f),
            key_of: Arc::new(key_of),
            window,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Joins the in-flight call for this argument's key, or starts a new
    /// one. The returned future is already running; awaiting it is
    /// optional, and dropping it does not cancel the underlying call.
    pub fn collapse(&self, arg: T) -> SharedResult<U> {
        let key = (self.key_of)(&arg);

        let mut pending = self.pending.lock().expect("collapser mutex poisoned");
        if let Some(slot) = pending.get(&key) {
            if slot.started.elapsed() <= self.window {
                return slot.shared.clone();
            }
        }

        let handle = tokio::spawn((self.f)(arg));
        let shared = async move {
            match handle.await {
                Ok(result) => result,
                Err(err) => {
                    tracing::error!(error = %err, "collapsed call task failed");
                    Err(CacheError::Internal)
                }
            }
        }
        .boxed()
        .shared();

        let started = Instant::now();
        pending.insert(
            key.clone(),
            Pending {
                started,
                shared: shared.clone(),
            },
        );
        drop(pending);

        // evict the slot once its window closes, unless a newer call
        // already replaced it
        let window = self.window;
        let pending = Arc::clone(&self.pending);
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let mut pending = pending.lock().expect("collapser mutex poisoned");
            if let Some(slot) = pending.get(&key) {
                if slot.started == started {
                    pending.remove(&key);
                }
            }
        });

        shared
    }

    /// Convenience wrapper around [`collapse`](Self::collapse) for callers
    /// that just want the result.
    pub async fn call(&self, arg: T) -> CacheResult<U> {
        self.collapse(arg).await
    }
}

impl<T, U> std::fmt::Debug for Collapser<T, U> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pending = self
            .pending
            .try_lock()
            .map(|pending| pending.len())
            .unwrap_or_default();
        f.debug_struct("Collapser")
            .field("window", &self.window)
            .field("pending", &pending)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn counting(calls: Arc<AtomicUsize>) -> Collapser<String, usize> {
        Collapser::new(
            Duration::from_millis(50),
            |arg: &String| arg.clone(),
            move |_arg| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Ok(n)
                }
                .boxed()
            },
        )
    }

    #[tokio::test]
    async fn concurrent_identical_calls_share_one_invocation() {
        let calls = Arc::new(AtomicUsize::new(0));
        let collapser = counting(Arc::clone(&calls));

        let results = futures::join!(
            collapser.call("a".into()),
            collapser.call("a".into()),
            collapser.call("a".into()),
        );
        assert_eq!(results, (Ok(0), Ok(0), Ok(0)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_keys_do_not_collapse() {
        let calls = Arc::new(AtomicUsize::new(0));
        let collapser = counting(Arc::clone(&calls));

        let _ = futures::join!(collapser.call("a".into()), collapser.call("b".into()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn late_joiner_within_window_shares_resolved_result() {
        let calls = Arc::new(AtomicUsize::new(0));
        let collapser = counting(Arc::clone(&calls));

        assert_eq!(collapser.call("a".into()).await, Ok(0));
        // the first call resolved (10ms), the window (50ms) has not closed
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(collapser.call("a".into()).await, Ok(0));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn call_after_window_invokes_again() {
        let calls = Arc::new(AtomicUsize::new(0));
        let collapser = counting(Arc::clone(&calls));

        assert_eq!(collapser.call("a".into()).await, Ok(0));
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(collapser.call("a".into()).await, Ok(1));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failures_propagate_to_every_joiner() {
        let calls = Arc::new(AtomicUsize::new(0));
        let collapser: Collapser<String, usize> = Collapser::new(
            Duration::from_millis(50),
            |arg: &String| arg.clone(),
            {
                let calls = Arc::clone(&calls);
                move |_arg| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async move { Err(CacheError::producer("origin down")) }.boxed()
                }
            },
        );

        let (a, b) = futures::join!(collapser.call("a".into()), collapser.call("a".into()));
        assert_eq!(a, Err(CacheError::Producer("origin down".into())));
        assert_eq!(a, b);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dropping_a_joiner_does_not_cancel_the_call() {
        let calls = Arc::new(AtomicUsize::new(0));
        let collapser = counting(Arc::clone(&calls));

        let first = collapser.collapse("a".into());
        let second = collapser.collapse("a".into());
        drop(first);

        assert_eq!(second.await, Ok(0));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
