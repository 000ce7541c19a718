//! Built-in handlers: `ignore`, `literal`, `object`, `list`, `wait`, `run`, `foreach`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::braid::Braid;
use crate::error::BraidError;
use crate::namestack::NameStack;
use crate::registry::{Handler, MatcherRegistry, StepOutcome};
use crate::value::{Branch, Node, Value};

/// Register the built-ins in the priority order the distilled spec
/// specifies: identity fallback first, literal rewriter, mapping, chain,
/// then the specific directive matchers. Dispatch scans last-to-first, so a
/// Branch carrying `$foreach` is caught by [`ForeachHandler`] ahead of the
/// broader [`ObjectHandler`] even though both predicates match it.
pub fn register_builtins(registry: &MatcherRegistry) {
    registry.register(Arc::new(|_: &Node| true), Arc::new(IgnoreHandler));
    registry.register(Arc::new(is_literal), Arc::new(LiteralHandler));
    registry.register(
        Arc::new(|n: &Node| matches!(n, Node::Branch(_))),
        Arc::new(ObjectHandler),
    );
    registry.register(
        Arc::new(|n: &Node| matches!(n, Node::Chain(_))),
        Arc::new(ListHandler),
    );
    registry.register(Arc::new(has_wait), Arc::new(WaitHandler));
    registry.register(Arc::new(has_run), Arc::new(RunHandler));
    registry.register(Arc::new(has_foreach), Arc::new(ForeachHandler));
}

fn is_literal(node: &Node) -> bool {
    match node {
        Node::Scalar(Value::String(s)) => s.starts_with('@'),
        Node::Callable(_) => true,
        _ => false,
    }
}

fn has_wait(node: &Node) -> bool {
    matches!(node, Node::Branch(b) if b.contains_key("$wait"))
}

fn has_run(node: &Node) -> bool {
    matches!(node, Node::Branch(b) if b.contains_key("$run"))
}

fn has_foreach(node: &Node) -> bool {
    matches!(node, Node::Branch(b) if b.contains_key("$foreach"))
}

/// Floor fallback: return the node verbatim. Unreachable in practice for
/// `Chain`/`Branch`/`Callable` since higher-priority handlers always claim
/// those shapes first.
struct IgnoreHandler;

#[async_trait]
impl Handler for IgnoreHandler {
    async fn handle(
        &self,
        _braid: &Braid,
        node: &Node,
        _stack: &NameStack,
        _key: Option<&str>,
    ) -> Result<StepOutcome, BraidError> {
        Ok(StepOutcome::Done(node.to_value()))
    }
}

/// `@k1,k2,...` strings rewrite to `{$wait: [k1, k2, ...]}`; bare callables
/// rewrite to `{$run: node}`.
struct LiteralHandler;

#[async_trait]
impl Handler for LiteralHandler {
    async fn handle(
        &self,
        _braid: &Braid,
        node: &Node,
        _stack: &NameStack,
        _key: Option<&str>,
    ) -> Result<StepOutcome, BraidError> {
        match node {
            Node::Scalar(Value::String(s)) if s.starts_with('@') => {
                let tokens: Vec<Value> = s[1..]
                    .split(',')
                    .map(|tok| Value::String(tok.trim().to_string()))
                    .collect();
                let wait = Branch::new(vec![("$wait", Node::Scalar(Value::Array(tokens)))]);
                Ok(StepOutcome::Replace(Node::Branch(wait)))
            }
            Node::Callable(_) => {
                let run = Branch::new(vec![("$run", node.clone())]);
                Ok(StepOutcome::Replace(Node::Branch(run)))
            }
            other => Ok(StepOutcome::Done(other.to_value())),
        }
    }
}

/// A Branch spawns its non-directive keys in parallel and, unless `$async`,
/// barriers on them before returning the chain-style `$result` threaded
/// through a fresh name-stack frame.
struct ObjectHandler;

#[async_trait]
impl Handler for ObjectHandler {
    async fn handle(
        &self,
        braid: &Braid,
        node: &Node,
        stack: &NameStack,
        _key: Option<&str>,
    ) -> Result<StepOutcome, BraidError> {
        let Node::Branch(branch) = node else {
            unreachable!("ObjectHandler only matches Node::Branch");
        };
        let mut cloned = stack.clone();
        cloned.add(HashMap::new());

        braid.run_with_stack(node.clone(), cloned.clone())?;

        if !branch.truthy("$async") {
            let keys = branch.spawnable_keys();
            braid.wait_keys(&keys).await?;
        }

        let result = cloned.get("$result")?.unwrap_or(Value::Null);
        Ok(StepOutcome::Done(result))
    }
}

/// A Chain executes its items strictly in order, threading `$result` through
/// a frame pushed just for this chain.
struct ListHandler;

#[async_trait]
impl Handler for ListHandler {
    async fn handle(
        &self,
        braid: &Braid,
        node: &Node,
        stack: &NameStack,
        key: Option<&str>,
    ) -> Result<StepOutcome, BraidError> {
        let Node::Chain(items) = node else {
            unreachable!("ListHandler only matches Node::Chain");
        };
        let mut cloned = stack.clone();
        let mut frame = HashMap::new();
        frame.insert("$result".to_string(), Value::Null);
        cloned.add(frame);

        let mut result = Value::Null;
        for item in items {
            result = braid.step(item.clone(), cloned.clone(), key).await?;
            cloned.set("$result", result.clone());
        }
        Ok(StepOutcome::Done(result))
    }
}

/// Barriers on the listed keys. When exactly one key is given (the `'@k'`
/// sugar's expansion target), also threads that key's value into `$result`
/// so a chain can consume it on the next step; for any other key count,
/// leaves `$result` untouched and returns its current value (see
/// DESIGN.md for why the single-key case is special-cased).
struct WaitHandler;

#[async_trait]
impl Handler for WaitHandler {
    async fn handle(
        &self,
        braid: &Braid,
        node: &Node,
        stack: &NameStack,
        _key: Option<&str>,
    ) -> Result<StepOutcome, BraidError> {
        let Node::Branch(branch) = node else {
            unreachable!("WaitHandler only matches Branch with $wait");
        };
        let wait_node = branch.get("$wait").expect("predicate guarantees $wait");
        let keys = keys_from_node(wait_node, "$wait")?;

        braid.wait_keys(&keys).await?;

        if keys.len() == 1 {
            let value = braid.get(&keys[0])?;
            stack.set("$result", value.clone());
            Ok(StepOutcome::Done(value))
        } else {
            let value = stack.get("$result")?.unwrap_or(Value::Null);
            Ok(StepOutcome::Done(value))
        }
    }
}

/// Invokes the `$run` callable with `(node, namestack)` and returns its
/// value. (A source variant registers a duplicate `$run` matcher pointing at
/// the wait handler — an apparent bug, not reproduced here; `$run` always
/// invokes its function.)
struct RunHandler;

#[async_trait]
impl Handler for RunHandler {
    async fn handle(
        &self,
        _braid: &Braid,
        node: &Node,
        stack: &NameStack,
        _key: Option<&str>,
    ) -> Result<StepOutcome, BraidError> {
        let Node::Branch(branch) = node else {
            unreachable!("RunHandler only matches Branch with $run");
        };
        match branch.get("$run") {
            Some(Node::Callable(f)) => {
                let value = f.call(node.clone(), stack.clone()).await?;
                Ok(StepOutcome::Done(value))
            }
            _ => Err(BraidError::InvalidDirectivePayload {
                directive: "$run",
                reason: "expected a callable".to_string(),
            }),
        }
    }
}

/// Materializes `$foreach`'s iterable, clones the parent branch once per
/// item with `$param` bound to that item, and replaces itself with a
/// `{$throttle: ..., <fan-out keys>: <clones>}` mapping, which the object
/// handler then spawns as a parallel fan-out. Each clone's own non-directive
/// keys are prefixed eagerly, here, with that clone's fan-out key — not via
/// a wrapper-level `$sub`, which would prefix with the wrapper's own parent
/// key and collide every item's `body` onto the same result-table entry.
struct ForeachHandler;

#[async_trait]
impl Handler for ForeachHandler {
    async fn handle(
        &self,
        braid: &Braid,
        node: &Node,
        stack: &NameStack,
        _key: Option<&str>,
    ) -> Result<StepOutcome, BraidError> {
        let Node::Branch(branch) = node else {
            unreachable!("ForeachHandler only matches Branch with $foreach");
        };
        let iterable = branch
            .get("$foreach")
            .expect("predicate guarantees $foreach");
        let items = materialize(iterable)?;

        let width = digit_width(items.len());
        let id = braid.next_foreach_id();
        let prefix = format!("foreach:{id}");

        let throttle = stack
            .get_in_top_frame("$throttle")
            .unwrap_or_else(|| Value::from(braid.default_throttle() as u64));

        let mut wrapper = Branch::default();
        wrapper.insert("$throttle", Node::Scalar(throttle));

        for (i, item) in items.into_iter().enumerate() {
            let mut template = branch.clone();
            template.remove("$foreach");
            template.remove("$sub");
            template.insert("$param", Node::Scalar(item));
            let child_key = format!("{prefix}:{i:0width$}");
            let child = template.prefixed(&child_key);
            wrapper.insert(child_key, Node::Branch(child));
        }

        Ok(StepOutcome::Replace(Node::Branch(wrapper)))
    }
}

fn digit_width(n: usize) -> usize {
    if n <= 1 {
        1
    } else {
        ((n - 1) as f64).log10().floor() as usize + 1
    }
}

fn materialize(node: &Node) -> Result<Vec<Value>, BraidError> {
    match node {
        Node::Scalar(Value::Array(items)) => Ok(items.clone()),
        Node::Chain(items) => Ok(items.iter().map(Node::to_value).collect()),
        _ => Err(BraidError::InvalidDirectivePayload {
            directive: "$foreach",
            reason: "expected an array or chain of items".to_string(),
        }),
    }
}

fn keys_from_node(node: &Node, directive: &'static str) -> Result<Vec<String>, BraidError> {
    let invalid = || BraidError::InvalidDirectivePayload {
        directive,
        reason: "expected an array of key strings".to_string(),
    };
    match node {
        Node::Scalar(Value::Array(items)) => items
            .iter()
            .map(|v| v.as_str().map(str::to_string).ok_or_else(invalid))
            .collect(),
        Node::Chain(items) => items
            .iter()
            .map(|n| match n {
                Node::Scalar(Value::String(s)) => Ok(s.clone()),
                _ => Err(invalid()),
            })
            .collect(),
        Node::Scalar(Value::String(s)) => Ok(vec![s.clone()]),
        _ => Err(invalid()),
    }
}
