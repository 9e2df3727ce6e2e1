//! Defaults Trees
//!
//! A [`Defaults`] tree describes the fallback value and policy of every
//! field a plugin reads. Applying it fills in what the user left unset and
//! stamps field policies onto the live configuration.
//!
//! # How Defaults Are Applied
//!
//! For each field, in declaration order:
//!
//! 1. The current value is kept if it is set and passes the field's
//!    validator.
//! 2. Otherwise the first valid fallback field wins, or else the default
//!    itself. Scalar and node defaults are deep copied; nested `Defaults`
//!    start from an empty object that the subtree is applied to.
//! 3. The optional transform maps the chosen value.
//! 4. `referenced` and `blocked` are applied before the write, `read_only`
//!    after it.
//! 5. A kept object value of a `merge` field receives the field's children
//!    as defaults of its own.
//!
//! The tree itself is never written to or tracked.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::error::Result;
use crate::tree::{deep_copy, Node, Value};

/// Decides whether a configured value is usable.
pub type Validator = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Maps the chosen value before it is stored.
pub type Transform = Arc<dyn Fn(&Value, &DefaultValue) -> Value + Send + Sync>;

/// An ordered set of field defaults.
#[derive(Clone, Default)]
pub struct Defaults {
    fields: IndexMap<String, DefaultField>,
}

impl Defaults {
    /// Create an empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a field, builder style.
    pub fn with(mut self, key: impl Into<String>, field: impl Into<DefaultField>) -> Self {
        self.insert(key, field);
        self
    }

    /// Add or replace a field.
    pub fn insert(&mut self, key: impl Into<String>, field: impl Into<DefaultField>) {
        self.fields.insert(key.into(), field.into());
    }

    /// Look up a field.
    pub fn get(&self, key: &str) -> Option<&DefaultField> {
        self.fields.get(key)
    }

    /// Fields in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &DefaultField)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// `true` if there are no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Treat every field of `node` as a plain default.
    pub fn from_node(node: &Node) -> Self {
        let mut defaults = Self::new();
        for (key, value) in node.entries_untracked() {
            defaults.insert(key, value);
        }
        defaults
    }

    /// Build plain defaults from a JSON object. Non-objects give an empty
    /// tree.
    pub fn from_json(json: serde_json::Value) -> Self {
        match Value::from(json) {
            Value::Node(node) => Self::from_node(&node),
            _ => Self::new(),
        }
    }
}

impl fmt::Debug for Defaults {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.fields.iter()).finish()
    }
}

/// The fallback value of a field.
#[derive(Clone, Debug)]
pub enum DefaultValue {
    /// A value, deep copied on use.
    Value(Value),
    /// A nested tree, materialized as a fresh object.
    Tree(Defaults),
}

/// Default and policy of one field.
#[derive(Clone)]
pub struct DefaultField {
    value: DefaultValue,
    merge: bool,
    referenced: bool,
    read_only: bool,
    blocked: bool,
    validator: Option<Validator>,
    fallbacks: Vec<String>,
    transform: Option<Transform>,
}

impl DefaultField {
    /// A field with the given default and no policy.
    pub fn new(value: impl Into<DefaultValue>) -> Self {
        Self {
            value: value.into(),
            merge: false,
            referenced: false,
            read_only: false,
            blocked: false,
            validator: None,
            fallbacks: Vec::new(),
            transform: None,
        }
    }

    /// Recurse into an existing value instead of skipping it.
    pub fn merge(mut self) -> Self {
        self.merge = true;
        self
    }

    /// Pin the container identity of the field.
    pub fn referenced(mut self) -> Self {
        self.referenced = true;
        self
    }

    /// Reject later writes of different values.
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Never convert the field's value.
    pub fn blocked(mut self) -> Self {
        self.blocked = true;
        self
    }

    /// Only accept configured values that pass `validator`.
    pub fn validate(mut self, validator: impl Fn(&Value) -> bool + Send + Sync + 'static) -> Self {
        self.validator = Some(Arc::new(validator));
        self
    }

    /// Try another field of the same object before using the default.
    pub fn fallback(mut self, key: impl Into<String>) -> Self {
        self.fallbacks.push(key.into());
        self
    }

    /// Map the chosen value before it is stored.
    pub fn transform(
        mut self,
        transform: impl Fn(&Value, &DefaultValue) -> Value + Send + Sync + 'static,
    ) -> Self {
        self.transform = Some(Arc::new(transform));
        self
    }

    /// The configured default.
    pub fn value(&self) -> &DefaultValue {
        &self.value
    }

    fn is_valid(&self, value: &Value) -> bool {
        !value.is_undefined() && self.validator.as_ref().map_or(true, |valid| valid(value))
    }
}

impl fmt::Debug for DefaultField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DefaultField")
            .field("value", &self.value)
            .field("merge", &self.merge)
            .field("referenced", &self.referenced)
            .field("read_only", &self.read_only)
            .field("blocked", &self.blocked)
            .field("fallbacks", &self.fallbacks)
            .finish_non_exhaustive()
    }
}

macro_rules! default_from {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for DefaultValue {
                fn from(value: $ty) -> Self {
                    Self::Value(Value::from(value))
                }
            }

            impl From<$ty> for DefaultField {
                fn from(value: $ty) -> Self {
                    Self::new(value)
                }
            }
        )*
    };
}

default_from!(Value, Node, bool, f64, i32, i64, &str, String, serde_json::Value);

impl From<Defaults> for DefaultValue {
    fn from(tree: Defaults) -> Self {
        Self::Tree(tree)
    }
}

impl From<Defaults> for DefaultField {
    fn from(tree: Defaults) -> Self {
        Self::new(tree)
    }
}

impl From<DefaultValue> for DefaultField {
    fn from(value: DefaultValue) -> Self {
        Self::new(value)
    }
}

/// Nested defaults that are also applied to a user-supplied object.
pub fn df_merge(tree: Defaults) -> DefaultField {
    DefaultField::new(tree).merge()
}

/// A default that replaces configured values failing `validator`.
pub fn df_validate(
    validator: impl Fn(&Value) -> bool + Send + Sync + 'static,
    default: impl Into<DefaultValue>,
) -> DefaultField {
    DefaultField::new(default).validate(validator)
}

/// A boolean field. `"true"`/`"false"` strings are accepted and converted.
pub fn df_boolean(default: bool) -> DefaultField {
    DefaultField::new(default)
        .validate(|v| v.as_bool().is_some() || matches!(v.as_str(), Some("true" | "false")))
        .transform(|v, _| match v.as_str() {
            Some(text) => Value::Bool(text == "true"),
            None => v.clone(),
        })
}

/// A text field.
pub fn df_string(default: &str) -> DefaultField {
    DefaultField::new(default).validate(|v| v.as_str().is_some())
}

/// A numeric field.
pub fn df_number(default: f64) -> DefaultField {
    DefaultField::new(default).validate(|v| v.as_f64().is_some())
}

/// A default with a transform applied to the chosen value.
pub fn df_set(
    transform: impl Fn(&Value, &DefaultValue) -> Value + Send + Sync + 'static,
    default: impl Into<DefaultValue>,
) -> DefaultField {
    DefaultField::new(default).transform(transform)
}

/// A field whose value is never converted.
pub fn df_blk_val(default: impl Into<DefaultValue>) -> DefaultField {
    DefaultField::new(default).blocked()
}

/// A read-only field.
pub fn df_read_only(default: impl Into<DefaultValue>) -> DefaultField {
    DefaultField::new(default).read_only()
}

/// A referenced field.
pub fn df_ref(default: impl Into<DefaultValue>) -> DefaultField {
    DefaultField::new(default).referenced()
}

/// Apply `defaults` onto `target`.
pub(crate) fn apply_defaults(target: &Node, defaults: &Defaults) -> Result<()> {
    for (key, field) in defaults.iter() {
        apply_field(target, key, field)?;
    }
    Ok(())
}

fn apply_field(target: &Node, key: &str, field: &DefaultField) -> Result<()> {
    let current = target.get_untracked(key);
    let mut subtree: Option<&Defaults> = None;

    let resolved = if field.is_valid(&current) {
        None
    } else {
        let fallback = field
            .fallbacks
            .iter()
            .map(|name| target.get_untracked(name))
            .find(|candidate| field.is_valid(candidate));
        Some(match (fallback, &field.value) {
            (Some(value), _) => deep_copy(&value),
            (None, DefaultValue::Value(value)) => deep_copy(value),
            (None, DefaultValue::Tree(tree)) => {
                subtree = Some(tree);
                Value::Node(Node::object())
            }
        })
    };
    let kept = resolved.is_none();

    let mut next = resolved.unwrap_or_else(|| current.clone());
    if let Some(transform) = &field.transform {
        next = transform(&next, &field.value);
    }

    if field.referenced || field.blocked {
        target.update_policy(key, |policy| {
            policy.referenced |= field.referenced;
            policy.blocked |= field.blocked;
        });
    }
    if !next.same(&current) {
        target.set(key, next)?;
    }
    if field.read_only {
        target.update_policy(key, |policy| policy.read_only = true);
    }
    if field.referenced {
        // Pin the container now so the first assignment merges into it.
        target.tracked_child(key);
    }

    if kept && field.merge {
        match &field.value {
            DefaultValue::Tree(tree) => subtree = Some(tree),
            DefaultValue::Value(Value::Node(node)) => {
                if let Some(child) = target.tracked_child(key) {
                    return apply_defaults(&child, &Defaults::from_node(node));
                }
            }
            DefaultValue::Value(_) => {}
        }
    }

    if let Some(tree) = subtree {
        if let Some(child) = target.tracked_child(key) {
            apply_defaults(&child, tree)?;
        }
    }
    Ok(())
}
