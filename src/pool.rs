//! Executors that host a reactor's background workers.
//!
//! A [`Reactor`][crate::Reactor] never creates threads itself. It decides *when* a background
//! worker is needed and hands a [`Job`] to an [`Executor`]. This module provides the
//! [`ThreadPool`], an owned, fixed-size set of threads that is used by default.

use std::{
    any::Any,
    io,
    num::NonZeroUsize,
    panic::{self, resume_unwind, AssertUnwindSafe},
    sync::{Arc, OnceLock},
    thread::{self, JoinHandle},
};

use crossbeam_channel::{SendError, Sender};

use crate::{guard::defer, policy::panic_message, sync::Mutex};

/// A unit of work handed to an [`Executor`].
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Something that can run [`Job`]s in the background.
///
/// `execute` must not run the job on the calling thread, and must not block waiting for it. If
/// the executor can't accept the job, it hands it back in the `Err` variant.
///
/// Any `Fn(Job) -> Result<(), Job>` closure is an executor:
///
/// ```
/// use reactor_demux::{Executor, Job};
///
/// let spawner = |job: Job| -> Result<(), Job> {
///     std::thread::spawn(job);
///     Ok(())
/// };
/// fn assert_executor<E: Executor>(_: &E) {}
/// assert_executor(&spawner);
/// ```
pub trait Executor: Send + Sync {
    /// Starts running `job` in the background, or hands it back if that isn't possible.
    fn execute(&self, job: Job) -> Result<(), Job>;
}

impl<F> Executor for F
where
    F: Fn(Job) -> Result<(), Job> + Send + Sync,
{
    fn execute(&self, job: Job) -> Result<(), Job> {
        self(job)
    }
}

/// A builder object that can be used to configure and spawn a [`ThreadPool`].
#[derive(Clone, Default)]
pub struct ThreadPoolBuilder {
    name: Option<String>,
    threads: Option<usize>,
}

impl ThreadPoolBuilder {
    /// Sets the base name of the pool's threads.
    ///
    /// Each thread spawned will be named according to this base name and its index.
    pub fn name<N: Into<String>>(self, name: N) -> Self {
        Self {
            name: Some(name.into()),
            ..self
        }
    }

    /// Sets the number of threads in the pool.
    ///
    /// By default, the pool spawns one thread per unit of available parallelism.
    #[inline]
    pub fn threads(self, threads: usize) -> Self {
        Self {
            threads: Some(threads),
            ..self
        }
    }

    /// Spawns the pool's threads.
    pub fn spawn(self) -> io::Result<ThreadPool> {
        let count = self.threads.unwrap_or_else(available_parallelism);
        assert_ne!(count, 0, "thread count must be at least 1");

        let panic = Arc::new(Mutex::new(None));
        let (sender, recv) = crossbeam_channel::unbounded::<Job>();
        let mut handles = Vec::with_capacity(count);
        for i in 0..count {
            let mut builder = thread::Builder::new();
            let name = self.name.as_ref().map(|name| format!("{name}-{i}"));
            if let Some(name) = name.clone() {
                builder = builder.name(name);
            }
            let recv = recv.clone();
            let panic = panic.clone();
            let handle = builder.spawn(move || {
                let _guard;
                if let Some(name) = name {
                    log::trace!("pool thread '{name}' starting");
                    _guard = defer(move || log::trace!("pool thread '{name}' exiting"));
                }
                for job in recv {
                    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
                        record_panic(&panic, payload);
                    }
                }
            })?;
            handles.push(handle);
        }

        Ok(ThreadPool {
            handle: Some(PoolHandle { sender }),
            threads: handles,
            panic,
        })
    }
}

type Payload = Box<dyn Any + Send + 'static>;

fn record_panic(slot: &Mutex<Option<Payload>>, payload: Payload) {
    log::error!(
        "job panicked on pool thread '{}': {}",
        thread::current().name().unwrap_or("<unnamed>"),
        panic_message(&*payload).unwrap_or("<non-string payload>"),
    );
    let mut slot = slot.lock();
    if slot.is_none() {
        *slot = Some(payload);
    }
}

fn available_parallelism() -> usize {
    thread::available_parallelism().map_or(1, NonZeroUsize::get)
}

/// An owned, fixed-size set of threads running [`Job`]s in submission order.
///
/// A job that panics doesn't take its thread down; the first panic payload is kept and forwarded
/// to the owner when the pool is joined or dropped.
///
/// Dropping or [joining][ThreadPool::join] the pool closes it and waits for its threads. The
/// threads exit once every [`PoolHandle`] is gone and all queued jobs have run, so reactors using
/// the pool should be dropped first.
pub struct ThreadPool {
    handle: Option<PoolHandle>,
    threads: Vec<JoinHandle<()>>,
    panic: Arc<Mutex<Option<Payload>>>,
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.wait_for_exit();
    }
}

impl ThreadPool {
    /// Returns a builder that can be used to configure and spawn a [`ThreadPool`].
    #[inline]
    pub fn builder() -> ThreadPoolBuilder {
        ThreadPoolBuilder::default()
    }

    /// Returns the process-wide pool, spawning it on first use.
    ///
    /// The global pool has one thread per unit of available parallelism and lives until the
    /// process exits. Job panics on it are logged and otherwise discarded.
    ///
    /// # Panics
    ///
    /// Panics if the operating system refuses to spawn the pool's threads.
    pub fn global() -> &'static ThreadPool {
        static GLOBAL: OnceLock<ThreadPool> = OnceLock::new();
        GLOBAL.get_or_init(|| {
            ThreadPool::builder()
                .name("reactor-demux")
                .spawn()
                .expect("failed to spawn the global thread pool")
        })
    }

    /// Returns a cloneable handle that submits jobs to this pool.
    pub fn handle(&self) -> PoolHandle {
        match &self.handle {
            Some(handle) => handle.clone(),
            None => unreachable!("pool handle is only taken on exit"),
        }
    }

    /// Returns the number of threads in the pool.
    pub fn threads(&self) -> usize {
        self.threads.len()
    }

    /// Closes the pool and blocks until all of its threads have exited.
    ///
    /// If any job panicked, the first panic is propagated to the caller.
    pub fn join(mut self) {
        self.wait_for_exit();
    }

    fn wait_for_exit(&mut self) {
        drop(self.handle.take());

        for handle in self.threads.drain(..) {
            // Jobs are run under `catch_unwind`, so the threads themselves don't panic.
            handle.join().ok();
        }
        let payload = self.panic.lock().take();
        if let Some(payload) = payload {
            if !thread::panicking() {
                resume_unwind(payload);
            }
        }
    }
}

/// A handle that submits [`Job`]s to a [`ThreadPool`].
#[derive(Clone)]
pub struct PoolHandle {
    sender: Sender<Job>,
}

impl PoolHandle {
    /// Returns the number of jobs waiting for a pool thread.
    pub fn pending(&self) -> usize {
        self.sender.len()
    }
}

impl Executor for PoolHandle {
    fn execute(&self, job: Job) -> Result<(), Job> {
        self.sender.send(job).map_err(|SendError(job)| job)
    }
}
