//! Config Handler
//!
//! The handler is the central coordinator. It owns the listener registry,
//! the pending-flush state and the diagnostics channel, and exposes the
//! imperative operations plugins use on a live configuration.
//!
//! # How It Works
//!
//! 1. [`create_dynamic_config`] links the root node to a new handler and
//!    applies the defaults tree.
//!
//! 2. Listeners registered through [`on_config_change`] or
//!    [`ConfigHandler::watch`] run once immediately and record what they read.
//!
//! 3. A write to a recorded field marks its listeners dirty. The first dirty
//!    mark schedules a flush; [`ConfigHandler::notify`] flushes right away
//!    and cancels the scheduled one.
//!
//! 4. A flush runs every dirty listener once, in registration order.
//!
//! # Ownership
//!
//! The root node owns its handler and the handler only holds the root
//! weakly, so a configuration lives exactly as long as something references
//! its root.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, ReentrantMutex};

use crate::diagnostics::{self, Diagnostic, DiagnosticLogger, MessageId, Severity};
use crate::error::{Error, Result};
use crate::tree::{open_copy_node, Node, Value, WeakNode};

use super::defaults::{apply_defaults, Defaults};
use super::listener::{Callback, Listener, ListenerId, WatcherHandle};
use super::scheduler::{default_scheduler, Scheduler};
use super::tracking::TrackingContext;

/// Unique identifier for a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

impl HandlerId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cfg-{}", self.0)
    }
}

/// Argument passed to every listener.
#[derive(Clone, Debug)]
pub struct ConfigDetails {
    /// Root of the configuration.
    pub cfg: Node,
    /// Handler that owns the configuration.
    pub handler: ConfigHandler,
}

/// Shared state behind a [`ConfigHandler`].
pub(crate) struct HandlerCore {
    id: HandlerId,
    root: WeakNode,
    listeners: Mutex<Vec<Arc<Listener>>>,
    /// Cancellation flag of the scheduled flush, if one is pending.
    pending: Mutex<Option<Arc<AtomicBool>>>,
    /// Held by every flush and by [`ConfigHandler::batch`].
    turn: ReentrantMutex<()>,
    scheduler: Arc<dyn Scheduler>,
    logger: Option<Arc<dyn DiagnosticLogger>>,
}

impl HandlerCore {
    fn details(self: &Arc<Self>) -> Option<ConfigDetails> {
        let cfg = self.root.upgrade()?;
        Some(ConfigDetails {
            handler: ConfigHandler {
                core: Arc::clone(self),
                root: cfg.clone(),
            },
            cfg,
        })
    }

    pub(crate) fn report_conversion_failure(&self, key: &str, err: &Error) {
        diagnostics::report(
            self.logger.as_ref(),
            Diagnostic::new(
                Severity::Debug,
                MessageId::DYNAMIC_CONFIG_EXCEPTION,
                format!("Unable to make \"{key}\" dynamic: {err}"),
            ),
        );
    }

    /// Schedule a deferred flush unless one is already pending.
    pub(crate) fn schedule_flush(self: &Arc<Self>) {
        let cancelled = {
            let mut pending = self.pending.lock();
            if pending.is_some() {
                return;
            }
            let cancelled = Arc::new(AtomicBool::new(false));
            *pending = Some(Arc::clone(&cancelled));
            cancelled
        };

        let weak = Arc::downgrade(self);
        self.scheduler.schedule(Box::new(move || {
            if cancelled.load(Ordering::SeqCst) {
                return;
            }
            if let Some(core) = weak.upgrade() {
                core.run_scheduled_flush(&cancelled);
            }
        }));
    }

    /// Flush now, cancelling the scheduled flush.
    fn flush(self: &Arc<Self>) -> Result<()> {
        let _turn = self.turn.lock();
        if let Some(cancelled) = self.pending.lock().take() {
            cancelled.store(true, Ordering::SeqCst);
        }
        self.run_dirty()
    }

    fn run_scheduled_flush(self: &Arc<Self>, cancelled: &Arc<AtomicBool>) {
        let _turn = self.turn.lock();
        // A `notify()` may have run while this task waited for the turn.
        if cancelled.load(Ordering::SeqCst) {
            return;
        }
        {
            let mut pending = self.pending.lock();
            if pending.as_ref().is_some_and(|flag| Arc::ptr_eq(flag, cancelled)) {
                pending.take();
            }
        }
        if let Err(err) = self.run_dirty() {
            tracing::warn!(handler = %self.id, error = %err, "deferred flush failed");
            diagnostics::report(
                self.logger.as_ref(),
                Diagnostic::new(
                    Severity::Warning,
                    MessageId::LISTENER_FAILURE,
                    format!("Watcher error(s): {err}"),
                ),
            );
        }
    }

    fn run_dirty(self: &Arc<Self>) -> Result<()> {
        let Some(details) = self.details() else {
            return Ok(());
        };
        let listeners = self.listeners.lock().clone();

        let mut ran = 0;
        let mut errors = Vec::new();
        for listener in &listeners {
            if listener.take_dirty() && !listener.is_removed() {
                ran += 1;
                if let Err(err) = listener.run(&details) {
                    errors.push(err);
                }
            }
        }
        tracing::debug!(handler = %self.id, ran, "flushed listeners");

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Listeners(errors))
        }
    }

    fn add_listener(self: &Arc<Self>, callback: Callback) -> Result<WatcherHandle> {
        let listener = Listener::new(Arc::downgrade(self), callback);
        self.listeners.lock().push(Arc::clone(&listener));

        if let Some(details) = self.details() {
            if let Err(err) = listener.run(&details) {
                self.remove_listener(listener.id());
                listener.dispose();
                return Err(err);
            }
        }
        Ok(WatcherHandle::new(&listener, self))
    }

    pub(crate) fn remove_listener(&self, id: ListenerId) {
        self.listeners.lock().retain(|listener| listener.id() != id);
    }
}

/// Handle to a dynamic configuration.
///
/// Cheap to clone; all clones share the same listeners and root.
#[derive(Clone)]
pub struct ConfigHandler {
    core: Arc<HandlerCore>,
    root: Node,
}

impl ConfigHandler {
    fn from_core(core: Arc<HandlerCore>) -> Option<Self> {
        let root = core.root.upgrade()?;
        Some(Self { core, root })
    }

    /// Unique id of this handler.
    pub fn uid(&self) -> HandlerId {
        self.core.id
    }

    /// The root configuration object.
    pub fn cfg(&self) -> Value {
        Value::Node(self.root.clone())
    }

    /// The root configuration node.
    pub fn root(&self) -> &Node {
        &self.root
    }

    /// The injected logger, if any.
    pub fn logger(&self) -> Option<&Arc<dyn DiagnosticLogger>> {
        self.core.logger.as_ref()
    }

    /// Run every dirty listener now and cancel the scheduled flush.
    pub fn notify(&self) -> Result<()> {
        self.core.flush()
    }

    /// Pin the container identity of `target[field]` and return its value.
    pub fn reference(&self, target: &Node, field: &str) -> Result<Value> {
        self.adopt(target)?;
        target.update_policy(field, |policy| policy.referenced = true);
        Ok(target.get(field))
    }

    /// Make `target[field]` read-only and return its value.
    pub fn read_only(&self, target: &Node, field: &str) -> Result<Value> {
        self.adopt(target)?;
        target.update_policy(field, |policy| policy.read_only = true);
        Ok(target.get(field))
    }

    /// Stop `target[field]` from being converted and return its value.
    pub fn block_value(&self, target: &Node, field: &str) -> Result<Value> {
        self.adopt(target)?;
        target.update_policy(field, |policy| policy.blocked = true);
        Ok(target.get(field))
    }

    /// Layer more defaults onto `target`.
    pub fn set_df(&self, target: &Node, defaults: &Defaults) -> Result<Value> {
        self.adopt(target)?;
        apply_defaults(target, defaults)?;
        Ok(Value::Node(target.clone()))
    }

    /// Run `f` as one turn: no deferred flush starts until it returns.
    ///
    /// Writes made inside `f` are delivered together by the next flush.
    /// Without this, a scheduler that runs flushes on another thread may
    /// deliver a long burst of writes in more than one batch.
    pub fn batch<R>(&self, f: impl FnOnce() -> R) -> R {
        let _turn = self.core.turn.lock();
        f()
    }

    /// Register a listener on this configuration. It runs once immediately.
    ///
    /// The handler keeps `callback` alive until the listener is removed or
    /// the configuration is dropped. A callback that captures this handler
    /// or its root keeps the whole configuration alive; use the
    /// [`ConfigDetails`] it is given instead.
    pub fn watch<F>(&self, callback: F) -> Result<WatcherHandle>
    where
        F: Fn(&ConfigDetails) -> Result<()> + Send + Sync + 'static,
    {
        self.core.add_listener(Box::new(callback))
    }

    /// Run `f` without recording any dependency.
    pub fn untracked<R>(&self, f: impl FnOnce() -> R) -> R {
        let _ctx = TrackingContext::suspend();
        f()
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.core.listeners.lock().len()
    }

    fn adopt(&self, target: &Node) -> Result<()> {
        if target.is_dynamic() {
            Ok(())
        } else {
            target.attach(&self.core)
        }
    }
}

impl fmt::Debug for ConfigHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigHandler")
            .field("uid", &self.core.id)
            .field("listeners", &self.listener_count())
            .finish()
    }
}

/// Options for creating a dynamic configuration.
pub struct ConfigBuilder {
    raw: Value,
    defaults: Option<Defaults>,
    logger: Option<Arc<dyn DiagnosticLogger>>,
    scheduler: Option<Arc<dyn Scheduler>>,
    in_place: bool,
}

impl ConfigBuilder {
    /// Start from a raw configuration object.
    pub fn new(raw: impl Into<Value>) -> Self {
        Self {
            raw: raw.into(),
            defaults: None,
            logger: None,
            scheduler: None,
            in_place: true,
        }
    }

    /// Defaults applied after conversion.
    pub fn defaults(mut self, defaults: Defaults) -> Self {
        self.defaults = Some(defaults);
        self
    }

    /// Logger receiving diagnostics.
    pub fn logger(mut self, logger: Arc<dyn DiagnosticLogger>) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Scheduler running deferred flushes.
    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Convert the raw object itself (`true`, the default) or a deep copy.
    pub fn in_place(mut self, in_place: bool) -> Self {
        self.in_place = in_place;
        self
    }

    /// Create the handler.
    pub fn build(self) -> Result<ConfigHandler> {
        let in_place = self.in_place;
        let node = match self.raw {
            Value::Node(node) => node,
            Value::Null | Value::Undefined => Node::object(),
            other => {
                return Err(Error::InvalidConfig(format!(
                    "expected an object, got {other:?}"
                )))
            }
        };

        if in_place {
            if let Some(handler) = node.handler().and_then(ConfigHandler::from_core) {
                tracing::debug!(handler = %handler.uid(), "reusing dynamic config");
                if let Some(defaults) = &self.defaults {
                    handler.set_df(&node, defaults)?;
                }
                return Ok(handler);
            }
        }
        let root = if in_place {
            node
        } else {
            open_copy_node(&node)
        };

        let core = Arc::new(HandlerCore {
            id: HandlerId::next(),
            root: root.downgrade(),
            listeners: Mutex::new(Vec::new()),
            pending: Mutex::new(None),
            turn: ReentrantMutex::new(()),
            scheduler: self.scheduler.unwrap_or_else(default_scheduler),
            logger: self.logger,
        });
        root.attach_owner(&core).map_err(|err| match err {
            Error::Conversion(message) if in_place => Error::SealedRoot(message),
            other => other,
        })?;

        let handler = ConfigHandler { core, root };
        if let Some(defaults) = &self.defaults {
            apply_defaults(&handler.root, defaults)?;
        }
        tracing::debug!(handler = %handler.uid(), in_place, "created dynamic config");
        Ok(handler)
    }
}

/// Create a dynamic configuration over `raw`, applying `defaults`.
///
/// With `in_place` the caller's object tree itself becomes tracked;
/// otherwise a deep copy is converted and the original is left untouched.
pub fn create_dynamic_config(
    raw: impl Into<Value>,
    defaults: Option<&Defaults>,
    logger: Option<Arc<dyn DiagnosticLogger>>,
    in_place: bool,
) -> Result<ConfigHandler> {
    let mut builder = ConfigBuilder::new(raw).in_place(in_place);
    if let Some(defaults) = defaults {
        builder = builder.defaults(defaults.clone());
    }
    if let Some(logger) = logger {
        builder = builder.logger(logger);
    }
    builder.build()
}

/// The handler tracking `value`, from the root or any nested container.
pub fn get_dynamic_config_handler(value: &Value) -> Option<ConfigHandler> {
    value
        .as_node()
        .and_then(Node::handler)
        .and_then(ConfigHandler::from_core)
}

/// Register `callback` on the configuration `cfg` belongs to.
///
/// A plain object that is not tracked yet is converted in place first.
pub fn on_config_change<F>(cfg: &Value, callback: F) -> Result<WatcherHandle>
where
    F: Fn(&ConfigDetails) -> Result<()> + Send + Sync + 'static,
{
    let handler = match get_dynamic_config_handler(cfg) {
        Some(handler) => handler,
        None => {
            let node = cfg.as_node().ok_or(Error::NotDynamic)?;
            create_dynamic_config(node, None, None, true)?
        }
    };
    handler.watch(callback)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dynamic::scheduler::ManualScheduler;
    use std::sync::atomic::AtomicUsize;

    fn manual(raw: serde_json::Value) -> (ConfigHandler, ManualScheduler) {
        let scheduler = ManualScheduler::new();
        let handler = ConfigBuilder::new(raw)
            .scheduler(Arc::new(scheduler.clone()))
            .build()
            .unwrap();
        (handler, scheduler)
    }

    #[test]
    fn root_is_dynamic() {
        let (handler, _) = manual(serde_json::json!({"a": 1}));
        assert!(handler.root().is_dynamic());
        let found = get_dynamic_config_handler(&handler.cfg()).unwrap();
        assert_eq!(found.uid(), handler.uid());
    }

    #[test]
    fn non_object_raw_is_rejected() {
        assert!(matches!(
            create_dynamic_config("text", None, None, true),
            Err(Error::InvalidConfig(_))
        ));
        let empty = create_dynamic_config(Value::Null, None, None, true).unwrap();
        assert!(empty.root().is_empty());
    }

    #[test]
    fn scheduled_flush_is_cancelled_by_notify() {
        let (handler, scheduler) = manual(serde_json::json!({"a": 1}));
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_clone = runs.clone();
        handler
            .watch(move |details| {
                details.cfg.get("a");
                runs_clone.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        handler.root().set("a", 2).unwrap();
        assert_eq!(scheduler.pending(), 1);

        handler.notify().unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        // The queued task finds itself cancelled.
        scheduler.run_pending();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn failing_first_run_is_not_registered() {
        let (handler, _) = manual(serde_json::json!({}));
        let result = handler.watch(|_| Err(Error::NotDynamic));
        assert!(matches!(result, Err(Error::NotDynamic)));
        assert_eq!(handler.listener_count(), 0);
    }

    #[test]
    fn untracked_reads_are_not_dependencies() {
        let (handler, scheduler) = manual(serde_json::json!({"a": 1, "b": 1}));
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_clone = runs.clone();
        let watched = handler
            .watch(move |details| {
                details.cfg.get("a");
                details.handler.untracked(|| details.cfg.get("b"));
                runs_clone.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        assert_eq!(watched.dependency_count(), 1);

        handler.root().set("b", 2).unwrap();
        scheduler.run_pending();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn referenced_field_merges_before_first_read() {
        let (handler, _) = manual(serde_json::json!({"ctx": {"a": 1}}));
        let root = handler.root();
        let ctx = root.get_untracked("ctx");
        root.update_policy("ctx", |policy| policy.referenced = true);

        root.set("ctx", serde_json::json!({"b": 2})).unwrap();
        assert!(root.get_untracked("ctx").same(&ctx));
        assert!(ctx.as_node().unwrap().is_dynamic());
        assert_eq!(root.get_path("ctx.a"), Value::Undefined);
        assert_eq!(root.get_path("ctx.b"), Value::from(2));
    }

    #[test]
    fn rejected_merge_writes_nothing() {
        let (handler, _) = manual(serde_json::json!({"ctx": {"a": 1, "b": 1}}));
        let ctx = handler.root().get("ctx").as_node().cloned().unwrap();
        handler.read_only(&ctx, "b").unwrap();

        let result = handler.root().set("ctx", serde_json::json!({"a": 2, "b": 3}));
        assert!(matches!(result, Err(Error::InvalidAccess { .. })));
        assert!(handler.root().get("ctx").as_node().unwrap().ptr_eq(&ctx));
        assert_eq!(ctx.get("a"), Value::from(1));
        assert_eq!(ctx.get("b"), Value::from(1));
    }

    #[test]
    fn dropping_the_config_releases_callbacks() {
        let (handler, _) = manual(serde_json::json!({"a": 1}));
        let token = Arc::new(());
        let held = Arc::clone(&token);
        let watched = handler
            .watch(move |details| {
                let _held = &held;
                details.cfg.get("a");
                Ok(())
            })
            .unwrap();
        assert_eq!(Arc::strong_count(&token), 2);

        drop(handler);
        assert_eq!(Arc::strong_count(&token), 1);
        assert_eq!(watched.dependency_count(), 0);
    }
}
