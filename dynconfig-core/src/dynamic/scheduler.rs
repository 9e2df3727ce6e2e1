//! Flush Scheduler
//!
//! Writes outside of an explicit `notify()` do not run listeners inline.
//! The first write that dirties a listener schedules one flush task; every
//! further write before that task runs joins the same batch.
//!
//! A [`Scheduler`] decides when "the next turn" is:
//!
//! - [`TokioScheduler`] spawns the flush onto a tokio runtime.
//! - [`ThreadScheduler`] hands it to a dedicated notifier thread.
//! - [`ManualScheduler`] queues it until the embedding loop calls
//!   [`ManualScheduler::run_pending`].

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};
use std::thread;

use parking_lot::Mutex;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::mpsc;

/// A deferred flush.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs deferred flushes on a later turn of the event loop.
pub trait Scheduler: Send + Sync {
    /// Run `task` after the current turn completes.
    fn schedule(&self, task: Task);
}

/// Scheduler driven by the caller.
///
/// Clones share the same queue.
#[derive(Clone, Default)]
pub struct ManualScheduler {
    queue: Arc<Mutex<VecDeque<Task>>>,
}

impl ManualScheduler {
    /// Create an empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of queued tasks.
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Run one turn: every task queued before this call. Tasks scheduled
    /// while the turn runs wait for the next call.
    pub fn run_pending(&self) -> usize {
        let batch: Vec<Task> = self.queue.lock().drain(..).collect();
        let ran = batch.len();
        for task in batch {
            task();
        }
        ran
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, task: Task) {
        self.queue.lock().push_back(task);
    }
}

impl fmt::Debug for ManualScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualScheduler")
            .field("pending", &self.pending())
            .finish()
    }
}

/// Scheduler that spawns flushes onto a tokio runtime.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    handle: Handle,
}

impl TokioScheduler {
    /// Use the given runtime.
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Use the runtime of the calling context, if there is one.
    pub fn current() -> Option<Self> {
        Handle::try_current().ok().map(Self::new)
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, task: Task) {
        drop(self.handle.spawn(async move { task() }));
    }
}

/// Scheduler that runs flushes on a dedicated notifier thread.
///
/// Used where the writing thread has no event loop of its own. The flush
/// runs after writes already made, but may run between two writes of a
/// long synchronous burst; wrap such a burst in
/// [`ConfigHandler::batch`](crate::ConfigHandler::batch) to flush once after
/// all of it.
#[derive(Debug, Clone)]
pub struct ThreadScheduler {
    tx: mpsc::UnboundedSender<Task>,
}

impl ThreadScheduler {
    /// Start a notifier thread.
    pub fn spawn() -> io::Result<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Task>();
        thread::Builder::new()
            .name("dynconfig-notify".to_string())
            .spawn(move || {
                while let Some(task) = rx.blocking_recv() {
                    if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                        tracing::error!("deferred flush panicked");
                    }
                }
            })?;
        Ok(Self { tx })
    }

    /// The notifier thread shared by every handler without a scheduler of
    /// its own, started on first use.
    pub fn shared() -> Option<Self> {
        static SHARED: OnceLock<Option<ThreadScheduler>> = OnceLock::new();
        SHARED
            .get_or_init(|| match Self::spawn() {
                Ok(scheduler) => Some(scheduler),
                Err(err) => {
                    tracing::warn!(error = %err, "cannot start notifier thread");
                    None
                }
            })
            .clone()
    }
}

impl Scheduler for ThreadScheduler {
    fn schedule(&self, task: Task) {
        // The notifier thread is gone; run the flush here rather than drop it.
        if let Err(mpsc::error::SendError(task)) = self.tx.send(task) {
            task();
        }
    }
}

/// Runs every flush immediately on the writing thread.
#[derive(Debug, Clone, Copy, Default)]
struct ImmediateScheduler;

impl Scheduler for ImmediateScheduler {
    fn schedule(&self, task: Task) {
        task();
    }
}

/// The scheduler used when none is configured.
///
/// A current-thread tokio runtime runs the flush on the writing thread once
/// the running task yields. A multi-thread runtime would run it on any
/// worker, concurrently with the writer, so it is not used; those writers and
/// writers without a runtime get the shared [`ThreadScheduler`].
pub fn default_scheduler() -> Arc<dyn Scheduler> {
    if let Ok(handle) = Handle::try_current() {
        if handle.runtime_flavor() == RuntimeFlavor::CurrentThread {
            return Arc::new(TokioScheduler::new(handle));
        }
    }
    match ThreadScheduler::shared() {
        Some(notifier) => Arc::new(notifier),
        None => {
            tracing::warn!("no notifier thread; deferred notifications run inline");
            Arc::new(ImmediateScheduler)
        }
    }
}
