//! Configuration Tree
//!
//! The value model shared by the whole engine: [`Value`] slots, [`Node`]
//! containers that become tracked once linked to a handler, and the
//! conversion guard that decides what may be tracked.
//!
//! Nodes are reference counted. The root node of a dynamic configuration
//! keeps its handler alive; nested nodes only hold a weak link, so a cycle
//! between the tree and the handler never forms.

mod convert;
mod node;
mod value;

pub use convert::{block_dynamic_conversion, can_convert, deep_copy, force_dynamic_conversion};
pub use node::{FieldPolicy, Node, NodeId, NodeKind};
pub use value::{Opaque, Value};

pub(crate) use convert::open_copy_node;
pub(crate) use node::WeakNode;
