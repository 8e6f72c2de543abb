//! Bounded-parallelism work reactors.
//!
//! A [`Reactor`] turns a stream of pushed items into parallel invocations of a *reaction*. Items
//! are queued in FIFO order and drained by up to `max_degree_of_parallelism` background workers
//! running on an [`Executor`]. When the queue backs up past the configured depth, pushing threads
//! are drafted into draining it themselves (the *foreground* path), which bounds queue growth
//! without unbounded thread creation.
//!
//! # Examples
//!
//! ```
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//! use reactor_demux::Reactor;
//!
//! let sum = Arc::new(AtomicUsize::new(0));
//! let reactor = Reactor::builder()
//!     .max_degree_of_parallelism(4)
//!     .max_parallel_depth(16)
//!     .build({
//!         let sum = sum.clone();
//!         move |_, item: usize| {
//!             sum.fetch_add(item, Ordering::Relaxed);
//!             Ok(())
//!         }
//!     });
//!
//! for i in 1..=100 {
//!     reactor.push(i).unwrap();
//! }
//!
//! while !(reactor.is_empty() && reactor.is_idle()) {
//!     std::thread::yield_now();
//! }
//! assert_eq!(sum.load(Ordering::Relaxed), 5050);
//!
//! reactor.cancel();
//! assert!(reactor.push(101).is_err());
//! ```

use std::{
    cell::Cell,
    error::Error,
    fmt,
    num::NonZeroUsize,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    thread,
};

use crossbeam_channel::{Receiver, Sender};
use log::Level;

use crate::{
    guard::{defer, ForegroundBorrow},
    ledger::WorkerLedger,
    policy::{BoxError, ExceptionPolicy, ReactionError},
    pool::{Executor, ThreadPool},
    sink::{LogFacade, LogSink},
};

/// The default queue depth above which pushing threads are borrowed.
pub const DEFAULT_MAX_PARALLEL_DEPTH: usize = 64;

/// The default number of items a borrowed thread processes before returning to its caller.
pub const DEFAULT_DISPATCHES_PER_BORROWED_THREAD: usize = 5;

/// The function a [`Reactor`] invokes once per item.
///
/// It receives the reactor itself, so that it can push follow-up work.
pub type Reaction<T> = dyn Fn(&Reactor<T>, T) -> Result<(), BoxError> + Send + Sync;

/// Tuning knobs of a [`Reactor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReactorOptions {
    /// Maximum number of background workers (scheduled or running) at any time. At least 1.
    ///
    /// Threads borrowed by the foreground path count against this budget when deciding whether to
    /// schedule another background worker.
    pub max_degree_of_parallelism: usize,
    /// Queue depth above which a push borrows the calling thread.
    pub max_parallel_depth: usize,
    /// Optional tighter borrowing threshold. `0` defers to `max_parallel_depth`; otherwise the
    /// smaller of the two is used.
    pub max_queue_depth: usize,
    /// How many *additional* queued items a borrowed thread processes after the one it pushed.
    pub dispatches_per_borrowed_thread: usize,
}

impl Default for ReactorOptions {
    fn default() -> Self {
        Self {
            max_degree_of_parallelism: thread::available_parallelism().map_or(1, NonZeroUsize::get),
            max_parallel_depth: DEFAULT_MAX_PARALLEL_DEPTH,
            max_queue_depth: 0,
            dispatches_per_borrowed_thread: DEFAULT_DISPATCHES_PER_BORROWED_THREAD,
        }
    }
}

impl ReactorOptions {
    /// The queue depth a push must exceed to borrow the calling thread.
    pub fn borrow_threshold(&self) -> usize {
        match self.max_queue_depth {
            0 => self.max_parallel_depth,
            depth => depth.min(self.max_parallel_depth),
        }
    }
}

/// Lifecycle of a [`Reactor`].
///
/// There is no transition back to [`ReactorState::Running`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactorState {
    /// Accepting and processing items.
    Running,
    /// [`Reactor::cancel`] was called, but workers are still finishing their current item.
    Canceling,
    /// Canceled, and no worker is scheduled or running.
    Stopped,
}

/// An error returned by [`Reactor::push`].
pub enum PushError<T> {
    /// The reactor was canceled. The pushed item is handed back.
    Canceled(T),
    /// The pushing thread was borrowed to process items, a reaction failed, and the reactor's
    /// [`ExceptionPolicy`] asked for the error to be rethrown.
    ///
    /// The pushed item has been consumed by the reaction in this case.
    Escalated(ReactionError),
}

impl<T> fmt::Debug for PushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PushError::Canceled(_) => f.write_str("Canceled(..)"),
            PushError::Escalated(err) => f.debug_tuple("Escalated").field(err).finish(),
        }
    }
}

impl<T> fmt::Display for PushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PushError::Canceled(_) => f.write_str("pushed to a canceled reactor"),
            PushError::Escalated(err) => write!(f, "escalated on borrowed thread: {err}"),
        }
    }
}

impl<T> Error for PushError<T> {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            PushError::Canceled(_) => None,
            PushError::Escalated(err) => Some(err),
        }
    }
}

/// A builder object that can be used to configure and build a [`Reactor`].
#[derive(Clone)]
pub struct ReactorBuilder {
    options: ReactorOptions,
    executor: Option<Arc<dyn Executor>>,
    policy: Option<Arc<dyn ExceptionPolicy>>,
    sink: Option<Arc<dyn LogSink>>,
}

impl ReactorBuilder {
    /// Replaces all tuning knobs at once.
    pub fn options(self, options: ReactorOptions) -> Self {
        Self { options, ..self }
    }

    /// Sets the maximum number of concurrent background workers.
    pub fn max_degree_of_parallelism(mut self, max: usize) -> Self {
        self.options.max_degree_of_parallelism = max;
        self
    }

    /// Sets the queue depth above which pushing threads are borrowed.
    pub fn max_parallel_depth(mut self, depth: usize) -> Self {
        self.options.max_parallel_depth = depth;
        self
    }

    /// Sets a tighter borrowing threshold. See [`ReactorOptions::max_queue_depth`].
    pub fn max_queue_depth(mut self, depth: usize) -> Self {
        self.options.max_queue_depth = depth;
        self
    }

    /// Sets how many additional queued items a borrowed thread processes.
    pub fn dispatches_per_borrowed_thread(mut self, dispatches: usize) -> Self {
        self.options.dispatches_per_borrowed_thread = dispatches;
        self
    }

    /// Sets the [`Executor`] that runs background workers.
    ///
    /// By default, the [global thread pool][ThreadPool::global] is used.
    pub fn executor<E: Executor + 'static>(self, executor: E) -> Self {
        Self {
            executor: Some(Arc::new(executor)),
            ..self
        }
    }

    /// Installs the hook consulted whenever the reaction fails.
    ///
    /// Without a policy, reaction errors are logged and swallowed.
    pub fn on_uncaught_exception<P: ExceptionPolicy + 'static>(self, policy: P) -> Self {
        Self {
            policy: Some(Arc::new(policy)),
            ..self
        }
    }

    /// Sets the sink that receives diagnostic messages. Defaults to [`LogFacade`].
    pub fn log_sink(self, sink: Arc<dyn LogSink>) -> Self {
        Self {
            sink: Some(sink),
            ..self
        }
    }

    /// Disables diagnostic messages entirely.
    pub fn no_log_sink(self) -> Self {
        Self { sink: None, ..self }
    }

    /// Builds a [`Reactor`] that invokes `reaction` for each pushed item.
    ///
    /// # Panics
    ///
    /// Panics if `max_degree_of_parallelism` is 0.
    pub fn build<T, F>(self, reaction: F) -> Reactor<T>
    where
        T: Send + 'static,
        F: Fn(&Reactor<T>, T) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        assert_ne!(
            self.options.max_degree_of_parallelism, 0,
            "max_degree_of_parallelism must be at least 1"
        );

        let executor: Arc<dyn Executor> = match self.executor {
            Some(executor) => executor,
            None => Arc::new(ThreadPool::global().handle()),
        };
        let (sender, queue) = crossbeam_channel::unbounded();
        Reactor {
            shared: Arc::new(Shared {
                reaction: Box::new(reaction),
                options: self.options,
                sender,
                queue,
                ledger: WorkerLedger::default(),
                executor,
                policy: self.policy,
                sink: self.sink,
            }),
        }
    }
}

struct Shared<T> {
    reaction: Box<Reaction<T>>,
    options: ReactorOptions,
    // Both ends of an unbounded channel form the FIFO queue. Holding the receiver keeps the
    // channel connected for as long as the reactor exists.
    sender: Sender<T>,
    queue: Receiver<T>,
    ledger: WorkerLedger,
    executor: Arc<dyn Executor>,
    policy: Option<Arc<dyn ExceptionPolicy>>,
    sink: Option<Arc<dyn LogSink>>,
}

/// A handle to a parallel reactor processing items of type `T`.
///
/// Cloning a [`Reactor`] yields another handle to the same reactor. Background workers hold a
/// handle while they run.
pub struct Reactor<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Send + 'static> Clone for Reactor<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Send + 'static> fmt::Debug for Reactor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reactor")
            .field("state", &self.state())
            .field("queue_depth", &self.queue_depth())
            .field("active", &self.active_workers())
            .field("scheduled", &self.scheduled_workers())
            .field("options", &self.shared.options)
            .finish_non_exhaustive()
    }
}

impl Reactor<()> {
    /// Returns a builder that can be used to configure and build a [`Reactor`].
    #[inline]
    pub fn builder() -> ReactorBuilder {
        ReactorBuilder {
            options: ReactorOptions::default(),
            executor: None,
            policy: None,
            sink: Some(Arc::new(LogFacade)),
        }
    }
}

impl<T: Send + 'static> Reactor<T> {
    /// Creates a reactor with default options running on the global thread pool.
    pub fn new<F>(reaction: F) -> Self
    where
        F: Fn(&Reactor<T>, T) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        Reactor::builder().build(reaction)
    }

    /// Returns the reactor's options.
    pub fn options(&self) -> &ReactorOptions {
        &self.shared.options
    }

    /// Whether every pushed item has been dequeued.
    pub fn is_empty(&self) -> bool {
        self.shared.queue.is_empty()
    }

    /// Returns the number of queued items that no worker has picked up yet.
    pub fn queue_depth(&self) -> usize {
        self.shared.queue.len()
    }

    /// Whether no worker is scheduled or running.
    pub fn is_idle(&self) -> bool {
        self.shared.ledger.is_idle()
    }

    /// Whether any worker, background or borrowed, is currently running.
    pub fn is_active(&self) -> bool {
        self.shared.ledger.total() > 0
    }

    /// Whether [`Reactor::cancel`] has been called.
    pub fn is_canceled(&self) -> bool {
        self.shared.ledger.is_canceled()
    }

    /// Whether the reactor is canceled and all of its workers have exited.
    pub fn is_stopped(&self) -> bool {
        self.is_canceled() && self.is_idle()
    }

    /// Returns where the reactor is in its [lifecycle][ReactorState].
    pub fn state(&self) -> ReactorState {
        if !self.is_canceled() {
            ReactorState::Running
        } else if self.is_idle() {
            ReactorState::Stopped
        } else {
            ReactorState::Canceling
        }
    }

    /// Returns the number of background workers currently draining the queue.
    pub fn active_workers(&self) -> usize {
        self.shared.ledger.active()
    }

    /// Returns the number of background workers handed to the executor that haven't started yet.
    pub fn scheduled_workers(&self) -> usize {
        self.shared.ledger.scheduled()
    }

    /// Cancels the reactor. Once canceled, a reactor cannot be restarted.
    ///
    /// Workers finish the item they are processing and then stop dequeuing. Items still in the
    /// queue are never processed. Calling this more than once has no further effect.
    ///
    /// Once [`Reactor::is_stopped`] has returned `true`, no reaction runs on this reactor again.
    pub fn cancel(&self) {
        if self.shared.ledger.cancel() {
            sink_log!(
                self.sink(),
                Level::Debug,
                "reactor canceled with {} queued items",
                self.queue_depth()
            );
        }
    }

    /// Pushes an item to the reactor.
    ///
    /// If the queue is deeper than the borrow threshold and the calling thread isn't already
    /// borrowed by a reactor, the calling thread processes `item` itself, followed by up to
    /// `dispatches_per_borrowed_thread` queued items, before returning. Callers must therefore
    /// tolerate the reaction running on their own stack.
    ///
    /// # Errors
    ///
    /// - [`PushError::Canceled`] if the reactor was canceled, including when the cancel lands
    ///   while this call is about to borrow the calling thread.
    /// - [`PushError::Escalated`] if the calling thread was borrowed and the
    ///   [`ExceptionPolicy`] asked to rethrow a reaction error.
    pub fn push(&self, item: T) -> Result<(), PushError<T>> {
        if self.is_canceled() {
            return Err(PushError::Canceled(item));
        }

        let shared = &*self.shared;
        if shared.queue.len() > shared.options.borrow_threshold() {
            if let Some(borrow) = ForegroundBorrow::acquire() {
                let result = self.run_foreground(item);
                drop(borrow);
                self.schedule();
                return result;
            }
        }

        // The reactor owns the receiving end, so the channel can't be disconnected.
        if let Err(err) = shared.sender.send(item) {
            return Err(PushError::Canceled(err.into_inner()));
        }
        self.schedule();
        Ok(())
    }

    fn sink(&self) -> Option<&dyn LogSink> {
        self.shared.sink.as_deref()
    }

    /// Schedules one more background worker if there's work and budget for it.
    ///
    /// The reservation is refused once the reactor is canceled.
    fn schedule(&self) {
        let shared = &*self.shared;
        if shared.queue.is_empty() {
            return;
        }
        if !shared
            .ledger
            .try_reserve(shared.options.max_degree_of_parallelism)
        {
            return;
        }

        let worker = self.clone();
        if shared
            .executor
            .execute(Box::new(move || worker.run_background()))
            .is_err()
        {
            shared.ledger.release_reservation();
            sink_log!(
                self.sink(),
                Level::Warn,
                "executor rejected a background worker; {} items queued",
                self.queue_depth()
            );
        }
    }

    /// Runs the reaction for one item, applying the exception policy to any failure.
    ///
    /// Returns an error only if the policy asks to rethrow it.
    fn dispatch(&self, item: T) -> Result<(), ReactionError> {
        let reaction = &self.shared.reaction;
        let err = match panic::catch_unwind(AssertUnwindSafe(|| reaction(self, item))) {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(err)) => ReactionError::Failed(err),
            Err(payload) => ReactionError::Panicked(payload),
        };

        sink_log!(
            self.sink(),
            Level::Error,
            "reactor threw an uncaught exception: {err}"
        );
        match &self.shared.policy {
            Some(policy) if policy.should_rethrow(&err) => Err(err),
            _ => Ok(()),
        }
    }

    fn run_background(self) {
        let entered = self.shared.ledger.enter_background();
        sink_log!(
            self.sink(),
            Level::Trace,
            "entering background reactor logic: {} of {}",
            entered.active,
            entered.total
        );

        let handled = Cell::new(0usize);
        let _exit = defer(|| {
            let remaining = self.shared.ledger.exit_background();
            self.after_exit("background", handled.get(), remaining);
        });

        while !self.is_canceled() {
            let Ok(item) = self.shared.queue.try_recv() else {
                break;
            };
            handled.set(handled.get() + 1);
            if let Err(err) = self.dispatch(item) {
                err.rethrow();
            }
        }
    }

    fn run_foreground(&self, item: T) -> Result<(), PushError<T>> {
        let Some(entered) = self.shared.ledger.enter_foreground() else {
            return Err(PushError::Canceled(item));
        };
        sink_log!(
            self.sink(),
            Level::Trace,
            "entering foreground reactor logic: {} of {}",
            entered.active,
            entered.total
        );

        let handled = Cell::new(0usize);
        let _exit = defer(|| {
            let remaining = self.shared.ledger.exit_foreground();
            self.after_exit("foreground", handled.get(), remaining);
        });

        let limit = self.shared.options.dispatches_per_borrowed_thread;
        let mut next = Some(item);
        while let Some(item) = next.take() {
            handled.set(handled.get() + 1);
            self.dispatch(item).map_err(PushError::Escalated)?;
            if self.is_canceled() || handled.get() > limit {
                break;
            }
            next = self.shared.queue.try_recv().ok();
        }
        Ok(())
    }

    fn after_exit(&self, path: &str, handled: usize, remaining: usize) {
        // The last worker out must not strand items that arrived while it was exiting.
        if remaining == 0 && !self.is_canceled() && !self.is_empty() {
            self.schedule();
        }
        sink_log!(
            self.sink(),
            Level::Trace,
            "exiting {path} reactor; handled {handled} items, {remaining} remaining workers"
        );
    }
}
