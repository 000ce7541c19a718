//! Matcher registry and the handler contract.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::braid::Braid;
use crate::error::BraidError;
use crate::namestack::NameStack;
use crate::value::{Node, Value};

/// A node predicate, checked during dispatch.
pub type Predicate = Arc<dyn Fn(&Node) -> bool + Send + Sync>;

/// What a handler produces: either a terminal value, or a replacement node
/// to re-dispatch (the `$replace` rewrite protocol, rendered as a tagged
/// variant instead of the source's `{$replace: node}` convention).
#[derive(Debug)]
pub enum StepOutcome {
    Done(Value),
    Replace(Node),
}

impl StepOutcome {
    pub fn done(value: impl Into<Value>) -> Self {
        StepOutcome::Done(value.into())
    }
}

/// A dispatch target. Implemented by every built-in (`ignore`, `literal`,
/// `object`, `list`, `wait`, `run`, `foreach`) and by any externally
/// registered collaborator (e.g. an LLM adapter intercepting `$llm`).
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(
        &self,
        braid: &Braid,
        node: &Node,
        stack: &NameStack,
        key: Option<&str>,
    ) -> Result<StepOutcome, BraidError>;
}

/// Adapts a plain async closure into a [`Handler`], so collaborators can
/// `register` without writing a struct + impl block.
pub struct FnHandler<F>(F);

impl<F, Fut> FnHandler<F>
where
    F: Fn(&Braid, &Node, &NameStack, Option<&str>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<StepOutcome, BraidError>> + Send,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(&Braid, &Node, &NameStack, Option<&str>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<StepOutcome, BraidError>> + Send,
{
    async fn handle(
        &self,
        braid: &Braid,
        node: &Node,
        stack: &NameStack,
        key: Option<&str>,
    ) -> Result<StepOutcome, BraidError> {
        (self.0)(braid, node, stack, key).await
    }
}

/// Ordered `(predicate, handler)` pairs. Dispatch scans from last-registered
/// to first; the first truthy predicate supplies the handler. Registration
/// order therefore encodes priority: built-ins are registered low to high,
/// and anything registered afterwards (an external collaborator) outranks
/// every built-in.
#[derive(Default)]
pub struct MatcherRegistry {
    matches: parking_lot::RwLock<Vec<(Predicate, Arc<dyn Handler>)>>,
}

impl MatcherRegistry {
    pub fn new() -> Self {
        Self {
            matches: parking_lot::RwLock::new(Vec::new()),
        }
    }

    pub fn register(&self, predicate: Predicate, handler: Arc<dyn Handler>) {
        self.matches.write().push((predicate, handler));
    }

    pub fn find_match(&self, node: &Node) -> Result<Arc<dyn Handler>, BraidError> {
        let matches = self.matches.read();
        for (predicate, handler) in matches.iter().rev() {
            if predicate(node) {
                return Ok(Arc::clone(handler));
            }
        }
        Err(BraidError::NoMatchedFunction(node.clone()))
    }
}
