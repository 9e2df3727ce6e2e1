//! Listeners
//!
//! A listener is a registered callback plus the set of `(node, field)` pairs
//! it read during its most recent run.
//!
//! # How Listeners Work
//!
//! 1. When registered, the listener runs immediately to establish its
//!    initial dependencies.
//!
//! 2. When a field it read is written, the listener is marked dirty and its
//!    handler schedules a flush.
//!
//! 3. Before re-running, the listener detaches itself from every node it
//!    read last time and records a fresh set during the run, so stale
//!    dependencies drop out automatically.
//!
//! Removing a listener through [`WatcherHandle::rm`] disposes it; a disposed
//! listener never runs again, even if a flush was already scheduled.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::Result;

use super::handler::{ConfigDetails, HandlerCore};
use super::tracking::{AccessSet, TrackingContext};

/// Unique identifier for a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl ListenerId {
    /// Generate a new unique listener ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ListenerId {
    fn default() -> Self {
        Self::new()
    }
}

/// Callback type stored by a listener.
pub(crate) type Callback = Box<dyn Fn(&ConfigDetails) -> Result<()> + Send + Sync>;

/// A registered change callback.
pub(crate) struct Listener {
    id: ListenerId,
    handler: Weak<HandlerCore>,
    callback: Callback,
    accessed: Mutex<AccessSet>,
    dirty: AtomicBool,
    removed: AtomicBool,
    run_count: AtomicUsize,
}

impl Listener {
    pub(crate) fn new(handler: Weak<HandlerCore>, callback: Callback) -> Arc<Self> {
        Arc::new(Self {
            id: ListenerId::new(),
            handler,
            callback,
            accessed: Mutex::new(AccessSet::new()),
            dirty: AtomicBool::new(false),
            removed: AtomicBool::new(false),
            run_count: AtomicUsize::new(0),
        })
    }

    pub(crate) fn id(&self) -> ListenerId {
        self.id
    }

    pub(crate) fn watcher(self: &Arc<Self>) -> Watcher {
        Watcher {
            id: self.id,
            listener: Arc::downgrade(self),
        }
    }

    pub(crate) fn is_removed(&self) -> bool {
        self.removed.load(Ordering::SeqCst)
    }

    /// Mark the listener dirty and ask its handler for a flush.
    pub(crate) fn mark_dirty(&self) {
        if self.is_removed() {
            return;
        }
        self.dirty.store(true, Ordering::SeqCst);
        if let Some(core) = self.handler.upgrade() {
            core.schedule_flush();
        }
    }

    /// Clear the dirty flag, returning whether it was set.
    pub(crate) fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::SeqCst)
    }

    /// Run the callback, replacing the recorded dependencies.
    pub(crate) fn run(self: &Arc<Self>, details: &ConfigDetails) -> Result<()> {
        if self.is_removed() {
            return Ok(());
        }

        self.clear_dependencies();

        let ctx = TrackingContext::enter(self.watcher());
        let result = (self.callback)(details);
        let accessed = ctx.take_accessed();
        drop(ctx);

        *self.accessed.lock() = accessed;
        self.run_count.fetch_add(1, Ordering::SeqCst);

        // Removed from inside its own callback.
        if self.is_removed() {
            self.clear_dependencies();
        }
        result
    }

    /// Detach from every node read during the last run.
    fn clear_dependencies(&self) {
        let previous = std::mem::take(&mut *self.accessed.lock());
        for ((_, key), node) in previous {
            if let Some(node) = node.upgrade() {
                node.unwatch(&key, self.id);
            }
        }
    }

    /// Stop the listener for good.
    pub(crate) fn dispose(&self) {
        self.removed.store(true, Ordering::SeqCst);
        self.dirty.store(false, Ordering::SeqCst);
        self.clear_dependencies();
    }

    pub(crate) fn run_count(&self) -> usize {
        self.run_count.load(Ordering::SeqCst)
    }

    pub(crate) fn dependency_count(&self) -> usize {
        self.accessed.lock().len()
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("id", &self.id)
            .field("run_count", &self.run_count())
            .field("dirty", &self.dirty.load(Ordering::SeqCst))
            .field("removed", &self.is_removed())
            .finish()
    }
}

/// Registration of a listener on one node field.
#[derive(Clone)]
pub(crate) struct Watcher {
    id: ListenerId,
    listener: Weak<Listener>,
}

impl Watcher {
    pub(crate) fn id(&self) -> ListenerId {
        self.id
    }

    /// The watched field changed.
    pub(crate) fn notify(&self) {
        if let Some(listener) = self.listener.upgrade() {
            listener.mark_dirty();
        }
    }

    #[cfg(test)]
    pub(crate) fn detached(id: ListenerId) -> Self {
        Self {
            id,
            listener: Weak::new(),
        }
    }
}

/// Handle returned when a listener is registered.
///
/// Dropping the handle does not remove the listener; call [`rm`](Self::rm).
#[derive(Clone)]
pub struct WatcherHandle {
    listener: Weak<Listener>,
    handler: Weak<HandlerCore>,
}

impl WatcherHandle {
    pub(crate) fn new(listener: &Arc<Listener>, handler: &Arc<HandlerCore>) -> Self {
        Self {
            listener: Arc::downgrade(listener),
            handler: Arc::downgrade(handler),
        }
    }

    /// Remove the listener. It is never invoked again, including for a
    /// flush that is already scheduled.
    pub fn rm(&self) {
        if let Some(listener) = self.listener.upgrade() {
            if let Some(core) = self.handler.upgrade() {
                core.remove_listener(listener.id());
            }
            listener.dispose();
        }
    }

    /// `true` until the listener is removed or its handler is gone.
    pub fn is_active(&self) -> bool {
        self.listener
            .upgrade()
            .is_some_and(|listener| !listener.is_removed())
    }

    /// Number of times the callback has run.
    pub fn run_count(&self) -> usize {
        self.listener.upgrade().map_or(0, |listener| listener.run_count())
    }

    /// Number of `(node, field)` pairs read during the last run.
    pub fn dependency_count(&self) -> usize {
        self.listener
            .upgrade()
            .map_or(0, |listener| listener.dependency_count())
    }
}

impl fmt::Debug for WatcherHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatcherHandle")
            .field("active", &self.is_active())
            .field("run_count", &self.run_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listener_ids_are_unique() {
        let id1 = ListenerId::new();
        let id2 = ListenerId::new();
        let id3 = ListenerId::new();

        assert_ne!(id1, id2);
        assert_ne!(id2, id3);
        assert_ne!(id1, id3);
    }

    #[test]
    fn detached_watcher_notify_is_noop() {
        let watcher = Watcher::detached(ListenerId::new());
        watcher.notify();
    }

    #[test]
    fn dispose_stops_dirty_marking() {
        let listener = Listener::new(Weak::new(), Box::new(|_| Ok(())));
        listener.mark_dirty();
        assert!(listener.take_dirty());

        listener.dispose();
        listener.mark_dirty();
        assert!(!listener.take_dirty());
        assert!(listener.is_removed());
    }
}
