//! Tracking Context
//!
//! The tracking context records which listener is currently running, so
//! that container reads can be attributed to it.
//!
//! # Implementation
//!
//! We use a thread-local stack. Running a listener pushes an entry that
//! collects every `(node, field)` pair read; finishing the run pops it.
//! [`ConfigHandler::untracked`](crate::ConfigHandler::untracked) pushes a
//! suspended entry so that nothing read inside it is recorded, even when
//! called from within a listener.
//!
//! Nested listener runs (a listener calling `notify()`) each get their own
//! entry, so dependencies never leak between listeners.

use std::cell::RefCell;

use indexmap::IndexMap;

use crate::tree::{Node, NodeId, WeakNode};

use super::listener::{ListenerId, Watcher};

/// The `(node, field)` pairs read during one listener run.
pub(crate) type AccessSet = IndexMap<(NodeId, String), WeakNode>;

thread_local! {
    static CONTEXT_STACK: RefCell<Vec<ContextEntry>> = const { RefCell::new(Vec::new()) };
}

/// An entry in the tracking stack.
struct ContextEntry {
    /// The running listener, or `None` while recording is suspended.
    watcher: Option<Watcher>,
    /// Reads collected during this run.
    accessed: AccessSet,
}

/// Guard that pops its context entry when dropped.
///
/// This keeps the stack balanced even if a listener panics.
pub struct TrackingContext {
    listener: Option<ListenerId>,
}

impl TrackingContext {
    /// Start recording reads on behalf of `watcher`'s listener.
    pub(crate) fn enter(watcher: Watcher) -> Self {
        let listener = Some(watcher.id());
        Self::push(Some(watcher));
        Self { listener }
    }

    /// Stop recording until the guard is dropped.
    pub fn suspend() -> Self {
        Self::push(None);
        Self { listener: None }
    }

    fn push(watcher: Option<Watcher>) {
        CONTEXT_STACK.with(|stack| {
            stack.borrow_mut().push(ContextEntry {
                watcher,
                accessed: AccessSet::new(),
            });
        });
    }

    /// `true` when reads are currently being recorded.
    pub fn is_active() -> bool {
        Self::current_listener().is_some()
    }

    /// The listener reads are attributed to, if any.
    pub fn current_listener() -> Option<ListenerId> {
        CONTEXT_STACK.with(|stack| {
            stack
                .borrow()
                .last()
                .and_then(|entry| entry.watcher.as_ref().map(Watcher::id))
        })
    }

    /// Record a read of `key` on `node`, returning the watcher to register
    /// on the node.
    pub(crate) fn record(node: &Node, key: &str) -> Option<Watcher> {
        CONTEXT_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            let entry = stack.last_mut()?;
            let watcher = entry.watcher.clone()?;
            entry
                .accessed
                .entry((node.id(), key.to_string()))
                .or_insert_with(|| node.downgrade());
            Some(watcher)
        })
    }

    /// Take the reads collected so far by this context.
    pub(crate) fn take_accessed(&self) -> AccessSet {
        CONTEXT_STACK.with(|stack| {
            stack
                .borrow_mut()
                .last_mut()
                .map(|entry| std::mem::take(&mut entry.accessed))
                .unwrap_or_default()
        })
    }
}

impl Drop for TrackingContext {
    fn drop(&mut self) {
        CONTEXT_STACK.with(|stack| {
            let popped = stack.borrow_mut().pop();

            // Catches guards dropped out of order.
            if let Some(entry) = popped {
                debug_assert_eq!(
                    entry.watcher.as_ref().map(Watcher::id),
                    self.listener,
                    "TrackingContext mismatch"
                );
            }
        });
    }
}
