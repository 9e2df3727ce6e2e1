//! Conversion Guard
//!
//! Decides which values may become tracked containers and produces the deep
//! copies stored for non-referenced assignments.
//!
//! Opt-in and opt-out tags live in an identity-keyed side table rather than
//! on the value itself, so any node can be tagged without changing its
//! shape. Entries are removed when the node is dropped.

use std::collections::HashMap;
use std::sync::OnceLock;

use dashmap::DashMap;

use super::node::{FieldPolicy, Node, NodeId, NodeKind};
use super::value::Value;

const BLOCK: u8 = 0b01;
const FORCE: u8 = 0b10;

static TAGS: OnceLock<DashMap<NodeId, u8>> = OnceLock::new();

fn tags() -> &'static DashMap<NodeId, u8> {
    TAGS.get_or_init(DashMap::new)
}

fn has_tag(id: NodeId, tag: u8) -> bool {
    tags().get(&id).is_some_and(|bits| *bits & tag != 0)
}

fn add_tag(value: &Value, tag: u8) {
    if let Value::Node(node) = value {
        *tags().entry(node.id()).or_default() |= tag;
    }
}

/// Drop the tags of a node that no longer exists.
pub(crate) fn forget(id: NodeId) {
    if let Some(map) = TAGS.get() {
        map.remove(&id);
    }
}

/// Tag a value so that it is never converted into a tracked container.
///
/// Blocking always wins over [`force_dynamic_conversion`].
pub fn block_dynamic_conversion(value: impl Into<Value>) -> Value {
    let value = value.into();
    add_tag(&value, BLOCK);
    value
}

/// Tag a value so that it is converted even when it is not a plain object
/// or array, for example a channel or extension instance.
pub fn force_dynamic_conversion(value: impl Into<Value>) -> Value {
    let value = value.into();
    add_tag(&value, FORCE);
    value
}

/// Whether `value` may be converted into a tracked container when stored in
/// a field with `policy`.
pub fn can_convert(value: &Value, policy: FieldPolicy) -> bool {
    if policy.blocked {
        return false;
    }
    let Value::Node(node) = value else {
        return false;
    };
    if has_tag(node.id(), BLOCK) {
        return false;
    }
    has_tag(node.id(), FORCE) || node.kind().is_plain()
}

/// Deep copy plain objects and arrays. Instances, blocked, sealed and
/// frozen nodes and opaque payloads are carried over by reference. Shared
/// and cyclic structure is preserved within the copy.
pub fn deep_copy(value: &Value) -> Value {
    copy_value(value, &mut HashMap::new())
}

pub(crate) fn deep_copy_node(node: &Node) -> Node {
    copy_node(node, &mut HashMap::new())
}

/// Like [`deep_copy_node`], but a sealed or frozen plain node is itself
/// copied into an open one. Used for the root of a configuration.
pub(crate) fn open_copy_node(node: &Node) -> Node {
    if !keep_by_reference(node) && node.is_sealed() {
        copy_contents(node, &mut HashMap::new())
    } else {
        deep_copy_node(node)
    }
}

fn keep_by_reference(node: &Node) -> bool {
    node.kind() == NodeKind::Instance || has_tag(node.id(), BLOCK)
}

fn copy_value(value: &Value, visited: &mut HashMap<NodeId, Node>) -> Value {
    match value {
        Value::Node(node) => Value::Node(copy_node(node, visited)),
        other => other.clone(),
    }
}

fn copy_node(node: &Node, visited: &mut HashMap<NodeId, Node>) -> Node {
    if keep_by_reference(node) || node.is_sealed() {
        return node.clone();
    }
    copy_contents(node, visited)
}

fn copy_contents(node: &Node, visited: &mut HashMap<NodeId, Node>) -> Node {
    if let Some(copy) = visited.get(&node.id()) {
        return copy.clone();
    }
    let copy = Node::empty_like(node.kind());
    visited.insert(node.id(), copy.clone());
    for (key, value) in node.entries_untracked() {
        let child = copy_value(&value, visited);
        copy.insert_raw(key, child);
    }
    copy
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn only_plain_nodes_convert() {
        let policy = FieldPolicy::default();
        assert!(can_convert(&Value::from(json!({})), policy));
        assert!(can_convert(&Value::from(json!([])), policy));
        assert!(!can_convert(&Value::from(Node::instance("Channel")), policy));
        assert!(!can_convert(&Value::from("text"), policy));
        assert!(!can_convert(&Value::Null, policy));
        assert!(!can_convert(&Value::from(0), policy));
    }

    #[test]
    fn force_converts_instances() {
        let value = force_dynamic_conversion(Node::instance("Channel"));
        assert!(can_convert(&value, FieldPolicy::default()));
    }

    #[test]
    fn block_wins_over_force() {
        let value = force_dynamic_conversion(Node::object());
        let value = block_dynamic_conversion(value);
        assert!(!can_convert(&value, FieldPolicy::default()));

        let other = block_dynamic_conversion(Node::instance("Channel"));
        let other = force_dynamic_conversion(other);
        assert!(!can_convert(&other, FieldPolicy::default()));
    }

    #[test]
    fn blocked_policy_rejects() {
        let policy = FieldPolicy {
            blocked: true,
            ..FieldPolicy::default()
        };
        assert!(!can_convert(&Value::from(json!({"a": 1})), policy));
    }

    #[test]
    fn deep_copy_is_independent() {
        let source = Value::from(json!({"a": {"b": 1}, "list": [1, 2]}));
        let copy = deep_copy(&source);

        let src = source.as_node().unwrap();
        let dst = copy.as_node().unwrap();
        assert!(!src.ptr_eq(dst));

        src.get("a").as_node().unwrap().set("b", 2).unwrap();
        assert_eq!(dst.get_path("a.b"), Value::from(1));
        assert_eq!(dst.get("list").as_node().unwrap().len(), 2);
    }

    #[test]
    fn deep_copy_keeps_instances_and_blocked_by_reference() {
        let channel = Node::instance("Channel");
        let blocked = block_dynamic_conversion(Node::object());
        let source = Node::object_from([
            ("channel", Value::from(&channel)),
            ("blocked", blocked.clone()),
        ]);

        let copy = deep_copy_node(&source);
        assert_eq!(copy.get("channel"), Value::from(&channel));
        assert_eq!(copy.get("blocked"), blocked);
    }

    #[test]
    fn sealed_nodes_are_shared_except_as_root() {
        let plugin = Node::object_from([("id", "p1")]);
        plugin.seal();
        let source = Node::object_from([("plugin", &plugin)]);

        let copy = deep_copy_node(&source);
        assert_eq!(copy.get("plugin"), Value::from(&plugin));

        let root = open_copy_node(&plugin);
        assert!(!root.ptr_eq(&plugin));
        assert!(!root.is_sealed());
        assert_eq!(root.get("id"), Value::from("p1"));
    }

    #[test]
    fn deep_copy_handles_cycles() {
        let node = Node::object();
        node.set("self", &node).unwrap();

        let copy = deep_copy_node(&node);
        let inner = copy.get("self");
        assert!(inner.as_node().unwrap().ptr_eq(&copy));
    }
}
