//! Request coalescing.
//!
//! A [`DemuxProducer`] collapses concurrent requests for the same key into a single invocation of
//! an expensive production function, then fans the outcome out to every caller that asked for
//! that key while the production was in flight.
//!
//! An in-flight production and the callers attached to it form an *episode*. The episode ends
//! when the production returns: its entry is removed, and the next request for the same key
//! starts a new episode. Nothing is cached between episodes.
//!
//! # Examples
//!
//! ```
//! use reactor_demux::{DemuxKind, DemuxProducer};
//!
//! let producer = DemuxProducer::new(|key: &u32| -> Result<String, std::io::Error> {
//!     // Something slow, like a database lookup.
//!     Ok(format!("value for {key}"))
//! });
//!
//! let kind = producer.try_consume(7, |outcome| {
//!     let demuxed = outcome.unwrap();
//!     assert_eq!(*demuxed.value, "value for 7");
//! });
//! // Nobody else was producing key 7, so this call ran the production itself.
//! assert_eq!(kind, DemuxKind::Originated);
//!
//! let demuxed = producer.consume(8).unwrap();
//! assert_eq!(demuxed.kind, DemuxKind::Originated);
//! ```

use std::{
    collections::HashMap,
    error::Error,
    fmt,
    hash::Hash,
    panic::{self, resume_unwind, AssertUnwindSafe},
    sync::Arc,
};

use log::Level;

use crate::{
    policy::panic_message,
    sink::{LogFacade, LogSink},
    sync::Mutex,
};

/// How a caller took part in a production episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DemuxKind {
    /// This call started the production and ran it on its own thread.
    Originated,
    /// This call joined a production that was already in flight.
    Observed,
}

/// A successfully produced value, as delivered to one caller.
///
/// Every caller of an episode receives the same [`Arc`].
#[derive(Debug)]
pub struct Demuxed<V> {
    /// Whether this caller ran the production or joined it.
    pub kind: DemuxKind,
    /// The produced value, shared by every caller of the episode.
    pub value: Arc<V>,
}

impl<V> Clone for Demuxed<V> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            value: self.value.clone(),
        }
    }
}

/// Why an episode produced no value.
#[derive(Debug)]
pub enum ProductionError<E> {
    /// The production function returned an error.
    Failed(E),
    /// The production function panicked. Holds the panic message, if there was one.
    Panicked(Option<String>),
    /// The outcome was never delivered. Only returned by [`DemuxProducer::consume`].
    Abandoned,
}

impl<E: fmt::Display> fmt::Display for ProductionError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProductionError::Failed(err) => write!(f, "production failed: {err}"),
            ProductionError::Panicked(Some(msg)) => write!(f, "production panicked: {msg}"),
            ProductionError::Panicked(None) => f.write_str("production panicked"),
            ProductionError::Abandoned => f.write_str("production outcome was never delivered"),
        }
    }
}

impl<E: Error + 'static> Error for ProductionError<E> {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ProductionError::Failed(err) => Some(err),
            ProductionError::Panicked(_) | ProductionError::Abandoned => None,
        }
    }
}

/// What each caller of an episode receives.
///
/// On failure, every caller of the episode receives the same [`Arc`].
pub type Outcome<V, E> = Result<Demuxed<V>, Arc<ProductionError<E>>>;

type Callback<V, E> = Box<dyn FnOnce(Outcome<V, E>) + Send + 'static>;
type Produce<K, V, E> = dyn Fn(&K) -> Result<V, E> + Send + Sync;

/// Callers that joined an in-flight episode.
struct Episode<V, E> {
    waiters: Vec<Callback<V, E>>,
}

/// Coalesces concurrent productions for equal keys.
///
/// At most one production runs per key at any instant. While it runs, further requests for the
/// same key are attached to it instead of producing again, and all of them receive its outcome.
pub struct DemuxProducer<K, V, E> {
    produce: Box<Produce<K, V, E>>,
    in_flight: Mutex<HashMap<K, Episode<V, E>>>,
    sink: Option<Arc<dyn LogSink>>,
}

impl<K, V, E> fmt::Debug for DemuxProducer<K, V, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let in_flight = self.in_flight.try_lock().map(|map| map.len());
        f.debug_struct("DemuxProducer")
            .field("in_flight", &in_flight)
            .finish_non_exhaustive()
    }
}

impl<K, V, E> DemuxProducer<K, V, E>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    /// Creates a producer that runs `produce` to create the value for a key.
    ///
    /// Diagnostics go to the [`LogFacade`].
    pub fn new<F>(produce: F) -> Self
    where
        F: Fn(&K) -> Result<V, E> + Send + Sync + 'static,
    {
        Self {
            produce: Box::new(produce),
            in_flight: Mutex::new(HashMap::new()),
            sink: Some(Arc::new(LogFacade)),
        }
    }

    /// Replaces the diagnostic sink. [`None`] disables diagnostics.
    pub fn with_log_sink(self, sink: Option<Arc<dyn LogSink>>) -> Self {
        Self { sink, ..self }
    }

    /// Returns the number of keys with a production in flight.
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Whether a production for `key` is in flight.
    pub fn is_in_flight(&self, key: &K) -> bool {
        self.in_flight.lock().contains_key(key)
    }

    /// Requests the value for `key`, delivering the outcome to `callback`.
    ///
    /// If no production for `key` is in flight, this call starts one and runs it on the calling
    /// thread. Once it returns, `callback` and every callback that joined in the meantime are
    /// invoked on this thread, before `try_consume` returns. This call's callback receives
    /// [`DemuxKind::Originated`], the others [`DemuxKind::Observed`].
    ///
    /// If a production for `key` is already in flight, `callback` is attached to it and this
    /// returns immediately. The callback will be invoked later, on the producing thread.
    ///
    /// Returns the role this call plays in the episode. Production errors and panics are never
    /// propagated to the caller; they are delivered to every callback of the episode instead.
    ///
    /// If a callback panics, the remaining callbacks are still invoked, and the first callback
    /// panic is resumed afterwards.
    pub fn try_consume<C>(&self, key: K, callback: C) -> DemuxKind
    where
        C: FnOnce(Outcome<V, E>) + Send + 'static,
    {
        let mut in_flight = self.in_flight.lock();
        if let Some(episode) = in_flight.get_mut(&key) {
            episode.waiters.push(Box::new(callback));
            let waiters = episode.waiters.len();
            drop(in_flight);
            sink_log!(
                self.sink.as_deref(),
                Level::Trace,
                "joined in-flight production ({waiters} waiters)"
            );
            return DemuxKind::Observed;
        }
        // Published only once fully constructed; joiners never see a half-built episode.
        in_flight.insert(key.clone(), Episode { waiters: Vec::new() });
        drop(in_flight);

        let produced = panic::catch_unwind(AssertUnwindSafe(|| (self.produce)(&key)));
        let waiters = self
            .in_flight
            .lock()
            .remove(&key)
            .map(|episode| episode.waiters)
            .unwrap_or_default();

        let outcome = match produced {
            Ok(Ok(value)) => Ok(Arc::new(value)),
            Ok(Err(err)) => Err(Arc::new(ProductionError::Failed(err))),
            Err(payload) => Err(Arc::new(ProductionError::Panicked(
                panic_message(&*payload).map(str::to_owned),
            ))),
        };
        sink_log!(
            self.sink.as_deref(),
            if outcome.is_ok() { Level::Trace } else { Level::Debug },
            "production {} for {} callers",
            if outcome.is_ok() { "succeeded" } else { "failed" },
            waiters.len() + 1
        );

        let tagged = |kind| {
            outcome
                .clone()
                .map(|value| Demuxed { kind, value })
        };
        let mut callback_panic = None;
        let originator: Callback<V, E> = Box::new(callback);
        let deliveries = std::iter::once((originator, DemuxKind::Originated))
            .chain(waiters.into_iter().map(|cb| (cb, DemuxKind::Observed)));
        for (callback, kind) in deliveries {
            let outcome = tagged(kind);
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| callback(outcome))) {
                if callback_panic.is_none() {
                    callback_panic = Some(payload);
                }
            }
        }
        if let Some(payload) = callback_panic {
            resume_unwind(payload);
        }

        DemuxKind::Originated
    }

    /// Requests the value for `key` and blocks until the outcome is available.
    ///
    /// Unlike [`DemuxProducer::try_consume`], a call that joins an in-flight production blocks
    /// the calling thread until the producing thread delivers the outcome. Calling this from
    /// inside the production of the same key deadlocks.
    pub fn consume(&self, key: K) -> Outcome<V, E> {
        let (sender, recv) = crossbeam_channel::bounded(1);
        self.try_consume(key, move |outcome| {
            // Capacity 1 and a single send, so this can only fail if `recv` is gone.
            sender.send(outcome).ok();
        });
        recv.recv()
            .unwrap_or_else(|_| Err(Arc::new(ProductionError::Abandoned)))
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        io,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Barrier,
        },
        thread,
        time::Duration,
    };

    use crossbeam_channel::Receiver;

    use super::*;
    use crate::test::{silent_panic, wait_until, CaptureSink};

    fn assert_send_sync<T: Send + Sync>() {}

    type Gate = Receiver<()>;

    /// A producer whose productions block until the returned sender is dropped.
    fn gated<V, E>(
        result: impl Fn(&u32) -> Result<V, E> + Send + Sync + 'static,
    ) -> (DemuxProducer<u32, V, E>, crossbeam_channel::Sender<()>, Arc<AtomicUsize>)
    where
        V: Send + Sync + 'static,
        E: Send + Sync + 'static,
    {
        let (open, gate): (_, Gate) = crossbeam_channel::bounded(0);
        let calls = Arc::new(AtomicUsize::new(0));
        let producer = DemuxProducer::new({
            let calls = calls.clone();
            move |key: &u32| {
                calls.fetch_add(1, Ordering::SeqCst);
                gate.recv().ok();
                result(key)
            }
        })
        .with_log_sink(None);
        (producer, open, calls)
    }

    #[test]
    fn producer_is_send_sync() {
        assert_send_sync::<DemuxProducer<String, Vec<u8>, io::Error>>();
    }

    #[test]
    fn one_production_per_episode() {
        const JOINERS: usize = 15;
        let (producer, open, calls) = gated(|key| Ok::<_, io::Error>(key * 2));
        let (sender, outcomes) = crossbeam_channel::unbounded();

        thread::scope(|s| {
            let originator = s.spawn(|| {
                let sender = sender.clone();
                producer.try_consume(21, move |outcome| sender.send(outcome).unwrap())
            });
            assert!(wait_until(|| producer.is_in_flight(&21)));

            for _ in 0..JOINERS {
                let sender = sender.clone();
                let kind = producer.try_consume(21, move |outcome| sender.send(outcome).unwrap());
                assert_eq!(kind, DemuxKind::Observed);
            }
            // Nothing is delivered until the production finishes.
            assert!(outcomes.is_empty());

            drop(open);
            assert_eq!(originator.join().unwrap(), DemuxKind::Originated);
        });

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let delivered: Vec<Demuxed<u32>> = outcomes.try_iter().map(Result::unwrap).collect();
        assert_eq!(delivered.len(), JOINERS + 1);
        let originated: Vec<_> = delivered
            .iter()
            .filter(|d| d.kind == DemuxKind::Originated)
            .collect();
        assert_eq!(originated.len(), 1);
        for d in &delivered {
            assert_eq!(*d.value, 42);
            assert!(Arc::ptr_eq(&d.value, &originated[0].value));
        }
        assert_eq!(producer.in_flight(), 0);
    }

    #[test]
    fn errors_fan_out_to_every_waiter() {
        const JOINERS: usize = 5;
        let (producer, open, calls) =
            gated(|_| Err::<(), _>(io::Error::new(io::ErrorKind::Other, "Yo, this be da bomb!")));
        let (sender, outcomes) = crossbeam_channel::unbounded();

        thread::scope(|s| {
            s.spawn(|| {
                let sender = sender.clone();
                producer.try_consume(1, move |outcome| sender.send(outcome).unwrap());
            });
            assert!(wait_until(|| producer.is_in_flight(&1)));
            for _ in 0..JOINERS {
                let sender = sender.clone();
                producer.try_consume(1, move |outcome| sender.send(outcome).unwrap());
            }
            drop(open);
        });

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let errors: Vec<_> = outcomes.try_iter().map(Result::unwrap_err).collect();
        assert_eq!(errors.len(), JOINERS + 1);
        for err in &errors {
            assert!(Arc::ptr_eq(err, &errors[0]));
            assert_eq!(err.to_string(), "production failed: Yo, this be da bomb!");
        }
    }

    #[test]
    fn distinct_keys_do_not_coalesce() {
        let calls = Arc::new(AtomicUsize::new(0));
        let producer = DemuxProducer::new({
            let calls = calls.clone();
            move |_: &usize| -> Result<(), io::Error> {
                calls.fetch_add(1, Ordering::Relaxed);
                thread::sleep(Duration::from_millis(15));
                Err(io::Error::new(io::ErrorKind::InvalidInput, "Yo, this be da bomb!"))
            }
        })
        .with_log_sink(None);
        let (sender, errors) = crossbeam_channel::unbounded();

        thread::scope(|s| {
            for key in 0..10 {
                let producer = &producer;
                let sender = sender.clone();
                s.spawn(move || {
                    let outcome = producer.consume(key);
                    sender.send((key, outcome.unwrap_err())).unwrap();
                });
            }
        });

        let errors: HashMap<usize, _> = errors.try_iter().collect();
        assert_eq!(errors.len(), 10);
        assert_eq!(calls.load(Ordering::Relaxed), 10);
        for err in errors.values() {
            assert!(matches!(**err, ProductionError::Failed(_)));
        }
        // With distinct keys, no two callers share an outcome.
        let first = &errors[&0];
        assert!(errors.iter().filter(|(_, e)| Arc::ptr_eq(e, first)).count() == 1);
    }

    #[test]
    fn no_lost_callbacks_under_contention() {
        const THREADS: usize = 12;
        const ITERATIONS: usize = 200;
        const KEYS: u64 = 20;

        let productions = Arc::new(AtomicUsize::new(0));
        let producer = DemuxProducer::new({
            let productions = productions.clone();
            move |key: &u64| -> Result<u64, io::Error> {
                productions.fetch_add(1, Ordering::Relaxed);
                thread::sleep(Duration::from_micros(200 + key * 10));
                Ok(*key)
            }
        })
        .with_log_sink(None);
        let originated = AtomicUsize::new(0);
        let observed = AtomicUsize::new(0);
        let barrier = Barrier::new(THREADS);

        thread::scope(|s| {
            for t in 0..THREADS {
                let (producer, originated, observed, barrier) =
                    (&producer, &originated, &observed, &barrier);
                s.spawn(move || {
                    barrier.wait();
                    // Cheap per-thread LCG; avoids pulling in a randomness crate.
                    let mut state = t as u64 * 0x9E37_79B9 + 1;
                    for _ in 0..ITERATIONS {
                        state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                        let key = (state >> 33) % KEYS;
                        let demuxed = producer.consume(key).unwrap();
                        assert_eq!(*demuxed.value, key);
                        match demuxed.kind {
                            DemuxKind::Originated => originated.fetch_add(1, Ordering::Relaxed),
                            DemuxKind::Observed => observed.fetch_add(1, Ordering::Relaxed),
                        };
                    }
                });
            }
        });

        let originated = originated.load(Ordering::Relaxed);
        let observed = observed.load(Ordering::Relaxed);
        assert_eq!(originated + observed, THREADS * ITERATIONS);
        assert_eq!(originated, productions.load(Ordering::Relaxed));
        assert_eq!(producer.in_flight(), 0);
    }

    #[test]
    fn completed_episode_is_not_cached() {
        let calls = Arc::new(AtomicUsize::new(0));
        let producer = DemuxProducer::new({
            let calls = calls.clone();
            move |_: &&str| Ok::<_, io::Error>(calls.fetch_add(1, Ordering::SeqCst))
        });

        let first = producer.consume("k").unwrap();
        assert_eq!(producer.in_flight(), 0);
        let second = producer.consume("k").unwrap();
        assert_eq!(first.kind, DemuxKind::Originated);
        assert_eq!(second.kind, DemuxKind::Originated);
        assert_eq!((*first.value, *second.value), (0, 1));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn production_panic_is_delivered() {
        let producer = DemuxProducer::new(|key: &u8| -> Result<u8, io::Error> {
            if *key == 0 {
                silent_panic("zero is not allowed");
            }
            Ok(*key)
        });

        let err = producer.consume(0).unwrap_err();
        assert!(matches!(&*err, ProductionError::Panicked(Some(msg)) if msg == "zero is not allowed"));
        assert_eq!(producer.in_flight(), 0);
        assert_eq!(*producer.consume(1).unwrap().value, 1);
    }

    #[test]
    fn callback_panic_does_not_starve_other_waiters() {
        let (producer, open, _calls) = gated(|key| Ok::<_, io::Error>(*key));
        let delivered = Arc::new(AtomicUsize::new(0));

        thread::scope(|s| {
            let originator = s.spawn(|| {
                catch_unwind_silently(|| {
                    producer.try_consume(5, |_| {
                        silent_panic("originator callback");
                    });
                })
            });
            assert!(wait_until(|| producer.is_in_flight(&5)));
            for _ in 0..3 {
                let delivered = delivered.clone();
                producer.try_consume(5, move |outcome| {
                    outcome.unwrap();
                    delivered.fetch_add(1, Ordering::SeqCst);
                });
            }
            drop(open);
            // The originator's callback panic resurfaces on the producing thread.
            assert!(originator.join().unwrap().is_err());
        });

        assert_eq!(delivered.load(Ordering::SeqCst), 3);
        assert_eq!(producer.in_flight(), 0);
    }

    fn catch_unwind_silently(f: impl FnOnce()) -> Result<(), ()> {
        panic::catch_unwind(AssertUnwindSafe(f)).map_err(drop)
    }

    #[test]
    fn outcomes_are_traced() {
        let sink = Arc::new(CaptureSink::default());
        let producer = DemuxProducer::new(|_: &u8| Err::<(), _>("nope"))
            .with_log_sink(Some(sink.clone()));
        producer.consume(1).unwrap_err();

        let records = sink.records();
        assert_eq!(
            records,
            [(Level::Debug, "production failed for 1 callers".to_string())]
        );
    }
}
