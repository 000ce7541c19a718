//! The node value model: scalars, chains, branches and callables.

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::error::BraidError;
use crate::namestack::NameStack;

/// Opaque data produced by handlers and threaded through the name stack.
///
/// Any JSON-shaped value is representable: the result table and name-stack
/// frames never need anything richer than this, and `serde_json` is already
/// the data-interchange type the rest of this crate's ambient stack reaches
/// for.
pub type Value = serde_json::Value;

/// A host-language function invoked by `$run` (directly, or as the
/// replacement target of a bare callable node). Boxed and `Send + Sync` so it
/// can be stored in the task graph and called from any worker task; returns a
/// boxed future so the callable may itself await (an LLM call, an I/O
/// operation, ...).
pub type CallableFn =
    dyn Fn(Node, NameStack) -> BoxFuture<'static, Result<Value, BraidError>> + Send + Sync;

/// A cloneable handle to a [`CallableFn`].
#[derive(Clone)]
pub struct Callable(pub Arc<CallableFn>);

impl Callable {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Node, NameStack) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, BraidError>> + Send + 'static,
    {
        Self(Arc::new(move |node, stack| Box::pin(f(node, stack))))
    }

    pub async fn call(&self, node: Node, stack: NameStack) -> Result<Value, BraidError> {
        (self.0)(node, stack).await
    }
}

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Callable(..)")
    }
}

/// A node of the task graph.
///
/// Mirrors the source's untagged dict/list/callable/scalar soup as an
/// explicit tagged variant. Directives (`$wait`, `$run`, `$foreach`, `$param`,
/// `$sub`, `$async`, `$throttle`, `$replace`, `$result`) are reserved keys
/// inside [`Branch`], not separate variants.
#[derive(Clone)]
pub enum Node {
    /// Any JSON-shaped scalar value, including plain (non-`@`) strings.
    Scalar(Value),
    /// Ordered sequence, executed left to right, threading `$result`.
    Chain(Vec<Node>),
    /// Ordered mapping; non-`$` keys spawn in parallel, `$` keys are directives.
    Branch(Branch),
    /// A host-language function; the literal handler rewrites a bare
    /// callable into `{$run: node}` before dispatch.
    Callable(Callable),
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Node::Scalar(v) => f.debug_tuple("Scalar").field(v).finish(),
            Node::Chain(items) => f.debug_tuple("Chain").field(items).finish(),
            Node::Branch(b) => f.debug_tuple("Branch").field(b).finish(),
            Node::Callable(_) => f.write_str("Callable(..)"),
        }
    }
}

impl Node {
    pub fn scalar(v: impl Into<Value>) -> Self {
        Node::Scalar(v.into())
    }

    pub fn str(s: impl Into<String>) -> Self {
        Node::Scalar(Value::String(s.into()))
    }

    pub fn chain(items: Vec<Node>) -> Self {
        Node::Chain(items)
    }

    pub fn branch(entries: Vec<(impl Into<String>, Node)>) -> Self {
        Node::Branch(Branch::new(entries))
    }

    pub fn callable<F, Fut>(f: F) -> Self
    where
        F: Fn(Node, NameStack) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, BraidError>> + Send + 'static,
    {
        Node::Callable(Callable::new(f))
    }

    /// Best-effort conversion to a plain [`Value`], used by the `ignore`
    /// fallback handler. `Branch`/`Chain` convert structurally; `Callable`
    /// has no JSON representation and becomes `null` (unreachable in
    /// practice: the object/list/literal handlers always outrank `ignore`
    /// for those shapes).
    pub fn to_value(&self) -> Value {
        match self {
            Node::Scalar(v) => v.clone(),
            Node::Chain(items) => Value::Array(items.iter().map(Node::to_value).collect()),
            Node::Branch(b) => {
                let map = b
                    .entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_value()))
                    .collect();
                Value::Object(map)
            }
            Node::Callable(_) => Value::Null,
        }
    }

    /// Parse a plain JSON value into a [`Node]` tree. Objects become
    /// [`Branch`]es in the key order `serde_json` hands back (alphabetical,
    /// since this crate does not enable `serde_json`'s `preserve_order`
    /// feature); arrays become [`Node::Chain`]. Graphs built directly with
    /// the [`Node`] constructors keep whatever order the caller wrote.
    pub fn from_json(value: Value) -> Node {
        match value {
            Value::Array(items) => Node::Chain(items.into_iter().map(Node::from_json).collect()),
            Value::Object(map) => Node::Branch(Branch::new(
                map.into_iter()
                    .map(|(k, v)| (k, Node::from_json(v)))
                    .collect::<Vec<_>>(),
            )),
            scalar => Node::Scalar(scalar),
        }
    }
}

/// An ordered string-keyed mapping of [`Node`]s.
///
/// Order is insertion order, not sorted: `$foreach` index assignment and
/// `$sub` prefixing both depend on iterating non-directive keys in a stable,
/// caller-meaningful order.
#[derive(Clone, Debug, Default)]
pub struct Branch {
    entries: Vec<(String, Node)>,
}

impl Branch {
    pub fn new(entries: Vec<(impl Into<String>, Node)>) -> Self {
        Self {
            entries: entries.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    pub fn is_directive_key(key: &str) -> bool {
        key.starts_with('$')
    }

    pub fn get(&self, key: &str) -> Option<&Node> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    pub fn insert(&mut self, key: impl Into<String>, node: Node) {
        let key = key.into();
        if let Some(slot) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = node;
        } else {
            self.entries.push((key, node));
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<Node> {
        let idx = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(idx).1)
    }

    /// Non-directive entries, in insertion order — the set `run` spawns.
    pub fn spawnable(&self) -> impl Iterator<Item = (&str, &Node)> {
        self.entries
            .iter()
            .filter(|(k, _)| !Self::is_directive_key(k))
            .map(|(k, v)| (k.as_str(), v))
    }

    pub fn spawnable_keys(&self) -> Vec<String> {
        self.spawnable().map(|(k, _)| k.to_string()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Node)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Truthiness of a directive value, following the source's convention
    /// that presence of a non-`false`/non-`0`/non-`null` value counts as set.
    pub fn truthy(&self, key: &str) -> bool {
        match self.get(key) {
            None => false,
            Some(Node::Scalar(Value::Bool(b))) => *b,
            Some(Node::Scalar(Value::Null)) => false,
            Some(Node::Scalar(Value::Number(n))) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
            Some(Node::Scalar(Value::String(s))) => !s.is_empty(),
            Some(_) => true,
        }
    }

    /// Clone of this branch with every non-directive key renamed to
    /// `"{prefix}:{key}"`. Used by the `$sub` pre-transform and by
    /// `$foreach`'s fan-out wrapping.
    pub fn prefixed(&self, prefix: &str) -> Branch {
        let entries = self
            .entries
            .iter()
            .map(|(k, v)| {
                if Self::is_directive_key(k) {
                    (k.clone(), v.clone())
                } else {
                    (format!("{prefix}:{k}"), v.clone())
                }
            })
            .collect();
        Branch { entries }
    }
}

impl FromIterator<(String, Node)> for Branch {
    fn from_iter<I: IntoIterator<Item = (String, Node)>>(iter: I) -> Self {
        Branch {
            entries: iter.into_iter().collect(),
        }
    }
}
