//! Thread-based building blocks for keeping expensive work bounded and deduplicated.
//!
//! (if you want to run a fixed batch of homogeneous work in parallel, check out [`rayon`]
//! instead; this library is for long-lived components that receive work item by item, from many
//! threads, for as long as the program runs)
//!
//! # Overview
//!
//! This library features two main types: [`Reactor`] and [`DemuxProducer`].
//!
//! ## Reactors
//!
//! A [`Reactor`] receives items via [`Reactor::push`] and runs a user-supplied *reaction* on each
//! of them, in parallel up to a configured degree. Background workers are run on an [`Executor`]
//! (by default, a process-wide [`ThreadPool`]), and are only scheduled while there is queued work
//! and parallelism budget left.
//!
//! When the queue backs up, the reactor applies backpressure by *borrowing* the pushing thread:
//! instead of enqueueing, [`Reactor::push`] processes the item (and a bounded number of queued
//! ones) right there. A thread is borrowed at most once at a time, so a reaction that pushes more
//! work simply enqueues it.
//!
//! Reaction failures, both returned errors and panics, are handed to an [`ExceptionPolicy`] that
//! decides whether the worker keeps going or escalates.
//!
//! ## Demultiplexing producers
//!
//! A [`DemuxProducer`] collapses concurrent requests for the same key into a single invocation of
//! an expensive production function. The first caller runs the production on its own thread;
//! callers arriving while it runs attach a callback and return immediately. When the production
//! finishes, every callback receives the same outcome, tagged with whether that caller
//! [originated][DemuxKind::Originated] or merely [observed][DemuxKind::Observed] it.
//!
//! # Usage
//!
//! A [`Reactor`] whose reaction looks values up through a [`DemuxProducer`], so that duplicate
//! items pushed close together only cost one lookup:
//!
//! ```
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//! use reactor_demux::{DemuxProducer, Reactor};
//!
//! let lookups = Arc::new(AtomicUsize::new(0));
//! let producer = Arc::new(DemuxProducer::new({
//!     let lookups = lookups.clone();
//!     move |id: &u32| -> Result<String, std::io::Error> {
//!         lookups.fetch_add(1, Ordering::Relaxed);
//!         Ok(format!("user #{id}"))
//!     }
//! }));
//!
//! let reactor = Reactor::builder()
//!     .max_degree_of_parallelism(4)
//!     .build({
//!         let producer = producer.clone();
//!         move |_, id: u32| {
//!             let user = producer.consume(id)?;
//!             assert_eq!(*user.value, format!("user #{id}"));
//!             Ok(())
//!         }
//!     });
//!
//! for id in [1, 2, 1, 3, 2, 1] {
//!     reactor.push(id).unwrap();
//! }
//! while !(reactor.is_empty() && reactor.is_idle()) {
//!     std::thread::yield_now();
//! }
//! reactor.cancel();
//!
//! // Never more lookups than items, and at least one per distinct id.
//! let lookups = lookups.load(Ordering::Relaxed);
//! assert!((3..=6).contains(&lookups));
//! ```
//!
//! [`rayon`]: https://crates.io/crates/rayon

#[macro_use]
mod sink;

mod demux;
mod guard;
mod ledger;
mod policy;
mod pool;
mod reactor;
pub mod sync;

pub use demux::{DemuxKind, DemuxProducer, Demuxed, Outcome, ProductionError};
pub use policy::{BoxError, ExceptionPolicy, ReactionError};
pub use pool::{Executor, Job, PoolHandle, ThreadPool, ThreadPoolBuilder};
pub use reactor::{
    PushError, Reaction, Reactor, ReactorBuilder, ReactorOptions, ReactorState,
    DEFAULT_DISPATCHES_PER_BORROWED_THREAD, DEFAULT_MAX_PARALLEL_DEPTH,
};
pub use sink::{Level, LogFacade, LogSink};

/// Whether the current thread is borrowed by a [`Reactor`]'s foreground path.
///
/// Reactions can use this to tell whether they are running on a thread that called
/// [`Reactor::push`], rather than on a background worker.
pub fn is_borrowed_thread() -> bool {
    guard::ForegroundBorrow::is_held()
}
