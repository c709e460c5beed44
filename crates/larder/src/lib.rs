//! # larder
//!
//! A generalized content cache: the freshness model of HTTP caching
//! (RFC 9111), rationalized into a protocol-agnostic library. It answers
//! one question (*may this previously produced result be returned to this
//! consumer right now?*) and builds the machinery around the answer:
//! producer wrapping, request collapsing, background revalidation and
//! stale-if-error fallback.
//!
//! ## The layers
//!
//! - The [`classify`] function is the decision engine. Given a stored
//!   [`Entry`], the consumer's [`ConsumerDirectives`] and an instant, it
//!   returns one of four [`Usability`] categories. It is pure and holds
//!   every rule about ages, freshness lifetimes and staleness budgets.
//! - The [`Cache`] façade sits on a backing [`EntryStore`]. On reads it
//!   normalizes params, fetches all vary-compatible entries, classifies
//!   them and selects the best candidates into a [`Lookup`]. On writes it
//!   fills defaults, computes how long the entry is worth keeping, and
//!   tells its `store` listeners before the write goes out.
//! - The wrappers, [`CachedProducer`] and [`CachedBulkProducer`],
//!   compose a [`Cache`] with an origin producer. They serve usable
//!   entries immediately, deduplicate concurrent producer calls through
//!   the [`Collapser`], refresh stale-while-revalidate entries on a
//!   detached task, substitute stale entries when the origin errors, and
//!   store results (with their supplemental resources) without ever
//!   putting a store write on the response path.
//!
//! Stores are deliberately external: anything that can upsert by
//! `(id, vary)` and answer the vary-compatibility query can back a
//! [`Cache`]. An [`InMemoryStore`] ships with the crate.
//!
//! ## Ages, not TTLs
//!
//! Entries carry their *age*, not a deadline, so caches can be chained:
//! an entry that spent 40 seconds in an upstream cache arrives here with
//! `initial_age` 40, and every freshness decision is made relative to the
//! moment the origin produced the content (the entry's
//! [`birth date`](Entry::birth_date)), no matter how many hops it took.
//!
//! ## Diagnostics
//!
//! The wrappers publish one [`Diagnostic`] per handled request on a
//! process-wide channel; see [`diagnostics::subscribe`]. Fan-out is
//! synchronous and subscribers are expected to be cheap.

mod cache;
mod classify;
mod collapse;
pub mod diagnostics;
mod directives;
mod entry;
mod error;
mod key;
mod params;
mod store;
mod wrapper;

pub use cache::{AfterClose, Cache, CacheConfig, CacheRequest, Lookup};
pub use classify::{classify, Usability};
pub use collapse::Collapser;
pub use diagnostics::{Diagnostic, Outcome};
pub use directives::{
    ConsumerDirectives, ConsumerMaxStale, MaxStale, ProducerDirectives, RawConsumerDirectives,
    RawConsumerMaxStale, RawMaxStale, RawProducerDirectives,
};
pub use entry::{Entry, NewEntry, ProducedResource, Validators};
pub use error::{CacheError, CacheResult};
pub use key::{canonical_digest, canonical_json, EntryKey};
pub use params::{
    is_scalar, normalize_params, normalize_vary, vary_matches, ParamNormalizers, Params, Vary,
    VaryValue,
};
pub use store::{EntryStore, InMemoryStore};
pub use wrapper::{
    BulkProducer, CacheReadFailure, CachedBulkProducer, CachedProducer, Producer, ProducerResult,
    WrapperConfig,
};
