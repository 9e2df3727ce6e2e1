//! Tracked Containers
//!
//! A [`Node`] is a shared object, array or instance. On its own it behaves
//! like a plain mutable map. Once it is linked to a handler it becomes a
//! *tracked container*: every read made while a listener runs is recorded,
//! and every write marks the listeners that read the written field as dirty.
//!
//! # How Tracking Works
//!
//! 1. `get(field)` asks the thread-local [`TrackingContext`] whether a
//!    listener is running. If so, the listener is stored as a watcher of
//!    `field` on this node and `(node, field)` is added to the listener's
//!    accessed set.
//!
//! 2. `set(field, value)` applies the field policy (read-only, referenced,
//!    blocked), stores the value and hands every watcher of `field` to the
//!    notifier.
//!
//! 3. Plain children are converted lazily, the first time they are read
//!    through a tracked parent, or eagerly when they are assigned.
//!
//! # Identity
//!
//! Once a field holds a container of the same handler, assigning another
//! plain object or array to it merges into the existing container instead of
//! replacing it. Only `remove` resets the association.
//!
//! # Locking
//!
//! Each node has its own `RwLock`. No lock is held while another node's lock
//! is taken or while listeners are notified.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::RwLock;
use smallvec::SmallVec;

use crate::dynamic::{HandlerCore, ListenerId, TrackingContext, Watcher};
use crate::error::{Error, Result};

use super::convert;
use super::value::Value;

/// Pseudo-field recorded when an array's length is read.
const LENGTH: &str = "length";

/// Unique identifier for a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Shape of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    /// Plain key/value object.
    Object,
    /// Plain array with decimal index keys.
    Array,
    /// Class-shaped object, such as a channel or extension. Only converted
    /// when tagged with [`force_dynamic_conversion`](crate::force_dynamic_conversion).
    Instance,
}

impl NodeKind {
    /// Objects and arrays are plain; instances are not.
    pub fn is_plain(self) -> bool {
        matches!(self, Self::Object | Self::Array)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Integrity {
    #[default]
    Open,
    Sealed,
    Frozen,
}

/// Per-field policy of a tracked container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FieldPolicy {
    /// Writes of a different value fail once the field holds a value.
    pub read_only: bool,
    /// Container identity is pinned; assigned objects are adopted in place.
    pub referenced: bool,
    /// The value is never converted or tracked.
    pub blocked: bool,
    /// Conversion of the current value failed; it is kept static.
    pub(crate) stat: bool,
}

/// Link from a node to the handler that tracks it. The root owns its
/// handler; every other node only points at it.
enum Link {
    Owner(Arc<HandlerCore>),
    Member(Weak<HandlerCore>),
}

impl Link {
    fn core(&self) -> Option<Arc<HandlerCore>> {
        match self {
            Self::Owner(core) => Some(Arc::clone(core)),
            Self::Member(weak) => weak.upgrade(),
        }
    }
}

struct NodeState {
    kind: NodeKind,
    class: Option<String>,
    fields: IndexMap<String, Value>,
    policies: HashMap<String, FieldPolicy>,
    watchers: HashMap<String, SmallVec<[Watcher; 2]>>,
    integrity: Integrity,
    link: Option<Link>,
}

impl NodeState {
    fn new(kind: NodeKind, class: Option<String>) -> Self {
        Self {
            kind,
            class,
            fields: IndexMap::new(),
            policies: HashMap::new(),
            watchers: HashMap::new(),
            integrity: Integrity::Open,
            link: None,
        }
    }

    fn core(&self) -> Option<Arc<HandlerCore>> {
        self.link.as_ref().and_then(Link::core)
    }

    fn policy(&self, key: &str) -> FieldPolicy {
        self.policies.get(key).copied().unwrap_or_default()
    }

    /// Validate `key` against the node shape, returning the array index.
    fn check_key(&self, key: &str) -> Result<Option<usize>> {
        if self.kind != NodeKind::Array {
            return Ok(None);
        }
        match key.parse::<usize>() {
            Ok(index) if index.to_string() == key => Ok(Some(index)),
            _ => Err(Error::InvalidKey {
                key: key.to_string(),
            }),
        }
    }

    fn watchers_of(&self, key: &str) -> Vec<Watcher> {
        self.watchers
            .get(key)
            .map(|list| list.to_vec())
            .unwrap_or_default()
    }

    /// Store `value` and return the watchers to notify.
    fn store(&mut self, key: &str, value: Value) -> Result<Vec<Watcher>> {
        let index = self.check_key(key)?;
        let exists = self.fields.contains_key(key);
        if self.integrity == Integrity::Frozen || (!exists && self.integrity == Integrity::Sealed) {
            return Err(Error::Frozen {
                field: key.to_string(),
            });
        }

        let mut notify = self.watchers_of(key);
        if let Some(index) = index {
            let len = self.fields.len();
            if index >= len {
                for pad in len..index {
                    self.fields.insert(pad.to_string(), Value::Undefined);
                }
                notify.extend(self.watchers_of(LENGTH));
            }
        }
        self.fields.insert(key.to_string(), value);
        Ok(notify)
    }
}

struct NodeInner {
    id: NodeId,
    state: RwLock<NodeState>,
}

impl Drop for NodeInner {
    fn drop(&mut self) {
        convert::forget(self.id);
    }
}

/// Shared handle to an object, array or instance of the configuration tree.
///
/// Cloning a `Node` clones the handle, not the contents.
#[derive(Clone)]
pub struct Node(Arc<NodeInner>);

/// Non-owning handle used by accessed sets.
#[derive(Clone)]
pub(crate) struct WeakNode(Weak<NodeInner>);

impl WeakNode {
    pub(crate) fn upgrade(&self) -> Option<Node> {
        self.0.upgrade().map(Node)
    }
}

impl Node {
    fn with_kind(kind: NodeKind, class: Option<String>) -> Self {
        Self(Arc::new(NodeInner {
            id: NodeId::next(),
            state: RwLock::new(NodeState::new(kind, class)),
        }))
    }

    /// Create an empty plain object.
    pub fn object() -> Self {
        Self::with_kind(NodeKind::Object, None)
    }

    /// Create an empty plain array.
    pub fn array() -> Self {
        Self::with_kind(NodeKind::Array, None)
    }

    /// Create an empty class-shaped object.
    pub fn instance(class: impl Into<String>) -> Self {
        Self::with_kind(NodeKind::Instance, Some(class.into()))
    }

    /// Create an empty node of the same shape as `kind`.
    pub(crate) fn empty_like(kind: NodeKind) -> Self {
        Self::with_kind(kind, None)
    }

    /// Build a plain object from key/value pairs.
    pub fn object_from<K, V>(entries: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
    {
        let node = Self::object();
        {
            let mut state = node.0.state.write();
            for (key, value) in entries {
                state.fields.insert(key.into(), value.into());
            }
        }
        node
    }

    /// Build a plain array from values.
    pub fn array_from<V: Into<Value>>(items: impl IntoIterator<Item = V>) -> Self {
        let node = Self::array();
        {
            let mut state = node.0.state.write();
            for (index, value) in items.into_iter().enumerate() {
                state.fields.insert(index.to_string(), value.into());
            }
        }
        node
    }

    /// Insert without policy, integrity or tracking checks. Only used while
    /// building fresh, unshared nodes.
    pub(crate) fn insert_raw(&self, key: String, value: Value) {
        self.0.state.write().fields.insert(key, value);
    }

    /// Unique identifier of this node.
    pub fn id(&self) -> NodeId {
        self.0.id
    }

    /// Shape of this node.
    pub fn kind(&self) -> NodeKind {
        self.0.state.read().kind
    }

    /// Class name of an instance node.
    pub fn class_name(&self) -> Option<String> {
        self.0.state.read().class.clone()
    }

    /// Pointer identity.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn downgrade(&self) -> WeakNode {
        WeakNode(Arc::downgrade(&self.0))
    }

    /// `true` while the node is tracked by a live handler.
    pub fn is_dynamic(&self) -> bool {
        self.handler().is_some()
    }

    pub(crate) fn handler(&self) -> Option<Arc<HandlerCore>> {
        self.0.state.read().core()
    }

    /// Prevent keys from being added or removed.
    pub fn seal(&self) {
        let mut state = self.0.state.write();
        if state.integrity == Integrity::Open {
            state.integrity = Integrity::Sealed;
        }
    }

    /// Prevent any modification.
    pub fn freeze(&self) {
        self.0.state.write().integrity = Integrity::Frozen;
    }

    /// `true` once sealed or frozen.
    pub fn is_sealed(&self) -> bool {
        self.0.state.read().integrity != Integrity::Open
    }

    /// `true` once frozen.
    pub fn is_frozen(&self) -> bool {
        self.0.state.read().integrity == Integrity::Frozen
    }

    /// Read a field.
    ///
    /// Inside a listener, the read is recorded as a dependency. Plain
    /// children of a tracked node are converted on first read.
    pub fn get(&self, key: &str) -> Value {
        let Some(core) = self.handler() else {
            return self.get_untracked(key);
        };
        self.track(key);
        self.resolve(key, &core)
    }

    /// Read a field without recording a dependency or converting it.
    pub fn get_untracked(&self, key: &str) -> Value {
        self.0
            .state
            .read()
            .fields
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    /// Read an array slot.
    pub fn get_index(&self, index: usize) -> Value {
        self.get(&index.to_string())
    }

    /// Read a dotted path such as `"extensionConfig.channel.endpoint"`.
    pub fn get_path(&self, path: &str) -> Value {
        let mut current = Value::Node(self.clone());
        for segment in path.split('.') {
            current = match &current {
                Value::Node(node) => node.get(segment),
                _ => return Value::Undefined,
            };
        }
        current
    }

    /// `true` if the node has an own field named `key`.
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.state.read().fields.contains_key(key)
    }

    /// Own field names, in insertion order.
    pub fn keys(&self) -> Vec<String> {
        self.0.state.read().fields.keys().cloned().collect()
    }

    /// Own fields, in insertion order, without tracking.
    pub fn entries_untracked(&self) -> Vec<(String, Value)> {
        self.0
            .state
            .read()
            .fields
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Number of own fields. For tracked arrays the read is recorded.
    pub fn len(&self) -> usize {
        if self.kind() == NodeKind::Array && self.is_dynamic() {
            self.track(LENGTH);
        }
        self.0.state.read().fields.len()
    }

    /// `true` if the node has no own fields.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current policy of a field.
    pub fn policy(&self, key: &str) -> FieldPolicy {
        self.0.state.read().policy(key)
    }

    pub(crate) fn update_policy(&self, key: &str, update: impl FnOnce(&mut FieldPolicy)) {
        let mut state = self.0.state.write();
        update(state.policies.entry(key.to_string()).or_default());
    }

    /// Write a field.
    ///
    /// On a tracked node this enforces the field policy, converts plain
    /// values and notifies the listeners that read the field.
    pub fn set(&self, key: &str, value: impl Into<Value>) -> Result<()> {
        self.set_value(key, value.into())
    }

    /// Append to an array.
    pub fn push(&self, value: impl Into<Value>) -> Result<()> {
        let next = {
            let state = self.0.state.read();
            if state.kind != NodeKind::Array {
                return Err(Error::InvalidKey {
                    key: LENGTH.to_string(),
                });
            }
            state.fields.len()
        };
        self.set_value(&next.to_string(), value.into())
    }

    /// Delete a field and forget its container.
    ///
    /// Array slots become `Undefined`; the length is unchanged.
    pub fn remove(&self, key: &str) -> Result<Value> {
        let (watchers, previous) = {
            let mut state = self.0.state.write();
            let index = state.check_key(key)?;
            let previous = state.fields.get(key).cloned().unwrap_or_default();
            if state.core().is_some() && state.policy(key).read_only && !previous.is_undefined() {
                return Err(Error::read_only(key));
            }
            if state.integrity != Integrity::Open && state.fields.contains_key(key) {
                return Err(Error::Frozen {
                    field: key.to_string(),
                });
            }
            if index.is_some() {
                if let Some(slot) = state.fields.get_mut(key) {
                    *slot = Value::Undefined;
                }
            } else {
                state.fields.shift_remove(key);
            }
            if let Some(policy) = state.policies.get_mut(key) {
                policy.stat = false;
            }
            (state.watchers_of(key), previous)
        };
        fire(watchers);
        Ok(previous)
    }

    fn set_value(&self, key: &str, value: Value) -> Result<()> {
        let (core, current, policy) = {
            let state = self.0.state.read();
            state.check_key(key)?;
            (
                state.core(),
                state.fields.get(key).cloned().unwrap_or_default(),
                state.policy(key),
            )
        };

        let Some(core) = core else {
            let watchers = self.0.state.write().store(key, value)?;
            fire(watchers);
            return Ok(());
        };

        let current = if policy.referenced {
            self.resolve(key, &core)
        } else {
            current
        };
        if current.same(&value) {
            return Ok(());
        }
        if policy.read_only && !current.is_undefined() {
            return Err(Error::read_only(key));
        }

        if let Value::Node(existing) = &current {
            if existing.is_tracked_by(&core) && should_merge(existing, &value, policy) {
                existing.merge_from(value.as_node())?;
                let watchers = self.0.state.read().watchers_of(key);
                fire(watchers);
                return Ok(());
            }
        }

        let (stored, stat) = prepare(&core, key, value, policy);
        let watchers = {
            let mut state = self.0.state.write();
            let watchers = state.store(key, stored)?;
            if stat || state.policies.contains_key(key) {
                state.policies.entry(key.to_string()).or_default().stat = stat;
            }
            watchers
        };
        fire(watchers);
        Ok(())
    }

    /// Copy the fields of `source` into this container, keeping its identity.
    ///
    /// Object fields missing from `source` become `Undefined`; arrays are
    /// truncated to the length of `source`. `None` clears every field.
    /// Nothing is written when any field of the merge would be rejected.
    pub(crate) fn merge_from(&self, source: Option<&Node>) -> Result<()> {
        if let Some(core) = self.handler() {
            self.check_merge(source, &core)?;
        }
        let entries = source.map(Node::entries_untracked).unwrap_or_default();
        if self.kind() == NodeKind::Array {
            for (index, (_, value)) in entries.iter().enumerate() {
                self.set_value(&index.to_string(), value.clone())?;
            }
            return self.truncate(entries.len());
        }

        let incoming: HashSet<&str> = entries.iter().map(|(k, _)| k.as_str()).collect();
        for key in self.keys() {
            if !incoming.contains(key.as_str()) {
                self.set_value(&key, Value::Undefined)?;
            }
        }
        for (key, value) in entries {
            self.set_value(&key, value)?;
        }
        Ok(())
    }

    fn check_merge(&self, source: Option<&Node>, core: &Arc<HandlerCore>) -> Result<()> {
        let entries = source.map(Node::entries_untracked).unwrap_or_default();
        if self.kind() == NodeKind::Array {
            for (index, (_, value)) in entries.iter().enumerate() {
                self.check_write(&index.to_string(), value, core)?;
            }
            let (len, open) = {
                let state = self.0.state.read();
                (state.fields.len(), state.integrity == Integrity::Open)
            };
            if len > entries.len() && !open {
                return Err(Error::Frozen {
                    field: entries.len().to_string(),
                });
            }
            return Ok(());
        }

        let incoming: HashSet<&str> = entries.iter().map(|(k, _)| k.as_str()).collect();
        for key in self.keys() {
            if !incoming.contains(key.as_str()) {
                self.check_write(&key, &Value::Undefined, core)?;
            }
        }
        for (key, value) in &entries {
            self.check_write(key, value, core)?;
        }
        Ok(())
    }

    /// The error `set_value(key, value)` would return, without writing.
    fn check_write(&self, key: &str, value: &Value, core: &Arc<HandlerCore>) -> Result<()> {
        let (current, policy, integrity, exists) = {
            let state = self.0.state.read();
            state.check_key(key)?;
            (
                state.fields.get(key).cloned().unwrap_or_default(),
                state.policy(key),
                state.integrity,
                state.fields.contains_key(key),
            )
        };
        if current.same(value) {
            return Ok(());
        }
        if policy.read_only && !current.is_undefined() {
            return Err(Error::read_only(key));
        }
        if let Value::Node(existing) = &current {
            if existing.is_tracked_by(core) && should_merge(existing, value, policy) {
                return existing.check_merge(value.as_node(), core);
            }
        }
        if integrity == Integrity::Frozen || (!exists && integrity == Integrity::Sealed) {
            return Err(Error::Frozen {
                field: key.to_string(),
            });
        }
        Ok(())
    }

    fn truncate(&self, len: usize) -> Result<()> {
        let watchers = {
            let mut state = self.0.state.write();
            if state.fields.len() <= len {
                return Ok(());
            }
            if state.integrity != Integrity::Open {
                return Err(Error::Frozen {
                    field: len.to_string(),
                });
            }
            let removed: Vec<String> = state.fields.keys().skip(len).cloned().collect();
            let mut watchers: Vec<Watcher> =
                removed.iter().flat_map(|key| state.watchers_of(key)).collect();
            watchers.extend(state.watchers_of(LENGTH));
            state.fields.truncate(len);
            watchers
        };
        fire(watchers);
        Ok(())
    }

    fn is_tracked_by(&self, core: &Arc<HandlerCore>) -> bool {
        self.handler().is_some_and(|own| Arc::ptr_eq(&own, core))
    }

    fn track(&self, key: &str) {
        if let Some(watcher) = TrackingContext::record(self, key) {
            let mut state = self.0.state.write();
            let list = state.watchers.entry(key.to_string()).or_default();
            if !list.iter().any(|w| w.id() == watcher.id()) {
                list.push(watcher);
            }
        }
    }

    pub(crate) fn unwatch(&self, key: &str, listener: ListenerId) {
        let mut state = self.0.state.write();
        if let Some(list) = state.watchers.get_mut(key) {
            list.retain(|w| w.id() != listener);
            if list.is_empty() {
                state.watchers.remove(key);
            }
        }
    }

    /// Fetch a field of a tracked node, converting a plain child in place.
    fn resolve(&self, key: &str, core: &Arc<HandlerCore>) -> Value {
        let (value, policy) = {
            let state = self.0.state.read();
            (
                state.fields.get(key).cloned().unwrap_or_default(),
                state.policy(key),
            )
        };
        if let Value::Node(child) = &value {
            if !policy.stat && !child.is_dynamic() && convert::can_convert(&value, policy) {
                if let Err(err) = child.attach(core) {
                    core.report_conversion_failure(key, &err);
                    self.update_policy(key, |p| p.stat = true);
                }
            }
        }
        value
    }

    /// The tracked container stored in `key`, converting it if needed.
    /// On an untracked node this is simply the child node.
    pub(crate) fn tracked_child(&self, key: &str) -> Option<Node> {
        match self.handler() {
            Some(core) => self
                .resolve(key, &core)
                .as_node()
                .filter(|child| child.is_dynamic())
                .cloned(),
            None => self.get_untracked(key).as_node().cloned(),
        }
    }

    /// Install tracking for `core` on this node.
    pub(crate) fn attach(&self, core: &Arc<HandlerCore>) -> Result<()> {
        self.install(Link::Member(Arc::downgrade(core)))
    }

    /// Install tracking and make this node keep `core` alive.
    pub(crate) fn attach_owner(&self, core: &Arc<HandlerCore>) -> Result<()> {
        self.install(Link::Owner(Arc::clone(core)))
    }

    fn install(&self, link: Link) -> Result<()> {
        let mut state = self.0.state.write();
        if state.core().is_some() {
            return Ok(());
        }
        if state.integrity != Integrity::Open {
            let property = state
                .fields
                .keys()
                .next()
                .cloned()
                .unwrap_or_else(|| "[[dynamicHandler]]".to_string());
            return Err(Error::Conversion(format!(
                "Cannot redefine property: {property}"
            )));
        }
        state.link = Some(link);
        Ok(())
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.0.state.read();
        f.debug_struct("Node")
            .field("id", &self.0.id.raw())
            .field("kind", &state.kind)
            .field("len", &state.fields.len())
            .field("dynamic", &state.core().is_some())
            .finish()
    }
}

fn should_merge(existing: &Node, value: &Value, policy: FieldPolicy) -> bool {
    match value {
        Value::Node(incoming) => {
            !incoming.ptr_eq(existing)
                && incoming.kind() == existing.kind()
                && convert::can_convert(value, policy)
        }
        Value::Null | Value::Undefined => policy.referenced,
        _ => false,
    }
}

/// Turn an assigned value into what gets stored, returning whether the
/// stored value must be kept static.
fn prepare(core: &Arc<HandlerCore>, key: &str, value: Value, policy: FieldPolicy) -> (Value, bool) {
    if !convert::can_convert(&value, policy) {
        return (value, false);
    }
    let node = match value {
        Value::Node(node) => node,
        other => return (other, false),
    };
    if node.is_dynamic() {
        return (Value::Node(node), false);
    }
    let node = if policy.referenced {
        node
    } else {
        convert::deep_copy_node(&node)
    };
    match node.attach(core) {
        Ok(()) => (Value::Node(node), false),
        Err(err) => {
            core.report_conversion_failure(key, &err);
            (Value::Node(node), true)
        }
    }
}

fn fire(watchers: Vec<Watcher>) {
    for watcher in watchers {
        watcher.notify();
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
