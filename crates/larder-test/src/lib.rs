//! Helpers for testing larder and code built on top of it.
//!
//! When writing tests, keep the following points in mind:
//!
//! - Call [`setup`] first in every test so console output is captured by
//!   the test runner.
//! - A [`ScriptedProducer`] fails once its script runs dry; give it as
//!   many results as the test will consume, including the background
//!   revalidations the directives under test will trigger.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

use larder::{
    BulkProducer, CacheError, CacheRequest, CacheResult, Entry, EntryStore, Params, Producer,
    ProducerResult,
};

/// Sets up the test environment.
///
/// Initializes a logger that only captures logs from `larder` itself and
/// mutes everything else. Safe to call repeatedly.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("larder=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// A producer that plays back a queue of canned results and counts its
/// invocations.
pub struct ScriptedProducer<C> {
    script: Mutex<VecDeque<CacheResult<ProducerResult<C>>>>,
    calls: AtomicUsize,
}

impl<C> ScriptedProducer<C> {
    pub fn new(script: impl IntoIterator<Item = CacheResult<ProducerResult<C>>>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            calls: AtomicUsize::new(0),
        }
    }

    /// How many times the producer was invoked so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl<C> Producer<C> for ScriptedProducer<C>
where
    C: Clone + Send + Sync + 'static,
{
    fn produce(&self, _request: CacheRequest) -> BoxFuture<'_, CacheResult<ProducerResult<C>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(CacheError::producer("producer script exhausted")));
        Box::pin(async move { next })
    }
}

type BulkResponder<C> =
    Box<dyn Fn(&[CacheRequest]) -> Vec<CacheResult<ProducerResult<C>>> + Send + Sync>;

/// A bulk producer driven by a responder closure, recording the ids of
/// every sub-batch it is asked for.
pub struct ScriptedBulkProducer<C> {
    responder: BulkResponder<C>,
    batches: Mutex<Vec<Vec<String>>>,
}

impl<C> ScriptedBulkProducer<C> {
    pub fn new(
        responder: impl Fn(&[CacheRequest]) -> Vec<CacheResult<ProducerResult<C>>>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            responder: Box::new(responder),
            batches: Mutex::new(Vec::new()),
        }
    }

    /// The ids of each batch the producer has been called with, in call
    /// order.
    pub fn batches(&self) -> Vec<Vec<String>> {
        self.batches.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.batches.lock().unwrap().len()
    }
}

impl<C> BulkProducer<C> for ScriptedBulkProducer<C>
where
    C: Clone + Send + Sync + 'static,
{
    fn produce(
        &self,
        requests: Vec<CacheRequest>,
    ) -> BoxFuture<'_, Vec<CacheResult<ProducerResult<C>>>> {
        self.batches
            .lock()
            .unwrap()
            .push(requests.iter().map(|request| request.id.clone()).collect());
        let results = (self.responder)(&requests);
        Box::pin(async move { results })
    }
}

/// A store decorator that fails reads and/or writes on demand.
pub struct FaultyStore<C>
where
    C: Clone + Send + Sync + 'static,
{
    inner: Arc<dyn EntryStore<C>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl<C> FaultyStore<C>
where
    C: Clone + Send + Sync + 'static,
{
    pub fn new(inner: Arc<dyn EntryStore<C>>) -> Self {
        Self {
            inner,
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
        }
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

impl<C> EntryStore<C> for FaultyStore<C>
where
    C: Clone + Send + Sync + 'static,
{
    fn get<'a>(&'a self, id: &'a str, params: &'a Params) -> BoxFuture<'a, CacheResult<Vec<Entry<C>>>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Box::pin(async { Err(CacheError::store_read("injected read failure")) });
        }
        self.inner.get(id, params)
    }

    fn get_many<'a>(
        &'a self,
        requests: &'a [(String, Params)],
    ) -> BoxFuture<'a, CacheResult<Vec<Vec<Entry<C>>>>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Box::pin(async { Err(CacheError::store_read("injected read failure")) });
        }
        self.inner.get_many(requests)
    }

    fn store<'a>(
        &'a self,
        batch: Vec<(Entry<C>, Option<Duration>)>,
    ) -> BoxFuture<'a, CacheResult<()>> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Box::pin(async { Err(CacheError::store_write("injected write failure")) });
        }
        self.inner.store(batch)
    }

    fn delete<'a>(&'a self, id: &'a str) -> BoxFuture<'a, CacheResult<()>> {
        self.inner.delete(id)
    }

    fn close<'a>(&'a self, timeout: Option<Duration>) -> BoxFuture<'a, CacheResult<()>> {
        self.inner.close(timeout)
    }
}
