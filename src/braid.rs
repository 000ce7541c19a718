//! The braid executor: configuration, the result-table-backed run/wait/get
//! surface, and the step processor that drives dispatch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::Semaphore;
use tokio::time::Instant;

use crate::error::BraidError;
use crate::handlers::register_builtins;
use crate::namestack::NameStack;
use crate::registry::{Handler, MatcherRegistry, Predicate, StepOutcome};
use crate::table::{ResultTable, State};
use crate::value::{Branch, Node, Value};

/// A `$replace` rewrite loop that never converges is a bug in a handler, not
/// a legitimate long chain of rewrites; bound it rather than spin forever.
const MAX_REPLACEMENTS: usize = 32;

/// The synthetic key a bare (non-`Branch`) root node is run under, so it
/// still gets a result-table entry to wait on.
const ROOT_KEY: &str = "[:root:]";

/// Tunables for a [`Braid`]. Mirrors the teacher's listener-level polling
/// constants (`POLL_INTERVAL_MS`, retry/backoff windows), generalized into a
/// per-braid config instead of module-level constants since a process may
/// run more than one braid with different latency budgets.
#[derive(Debug, Clone)]
pub struct BraidConfig {
    /// Polling interval used by `wait` while a barrier is still pending.
    pub interval: Duration,
    /// How long `wait` tolerates a pending barrier before raising `WaitTimeout`.
    pub timeout: Duration,
    /// Default semaphore capacity for a `run` invocation's spawned keys,
    /// overridden per-branch by a `$throttle` directive.
    pub throttle: usize,
}

impl Default for BraidConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(100),
            timeout: Duration::from_secs(300),
            throttle: 30,
        }
    }
}

/// The concurrent task-graph executor.
///
/// Holds exactly one result table per braid: nested mapping/foreach
/// fan-outs spawn into the *same* table as the root invocation (grounded in
/// the source, where `_handle_base_object` calls `self.run`, the very same
/// braid), which is why `$sub` key-prefixing exists at all — it is how
/// nested spawns avoid colliding in that one shared namespace.
pub struct Braid {
    self_ref: Weak<Braid>,
    config: BraidConfig,
    ttable: RwLock<Arc<ResultTable>>,
    stack: RwLock<NameStack>,
    registry: MatcherRegistry,
    foreach_counter: AtomicU64,
}

impl Braid {
    /// Construct a braid with the built-in handlers registered in priority
    /// order (see [`register_builtins`]).
    pub fn new(config: BraidConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak| {
            let table = Arc::new(ResultTable::new());
            let stack = NameStack::rooted(Arc::clone(&table));
            let braid = Braid {
                self_ref: weak.clone(),
                config,
                ttable: RwLock::new(table),
                stack: RwLock::new(stack),
                registry: MatcherRegistry::new(),
                foreach_counter: AtomicU64::new(0),
            };
            register_builtins(&braid.registry);
            braid
        })
    }

    /// A braid built with [`BraidConfig::default`].
    pub fn default() -> Arc<Self> {
        Self::new(BraidConfig::default())
    }

    fn arc(&self) -> Arc<Braid> {
        self.self_ref
            .upgrade()
            .expect("braid accessed after its owning Arc was dropped")
    }

    fn table(&self) -> Arc<ResultTable> {
        Arc::clone(&self.ttable.read())
    }

    fn root_stack(&self) -> NameStack {
        self.stack.read().clone()
    }

    pub fn default_throttle(&self) -> usize {
        self.config.throttle
    }

    pub fn next_foreach_id(&self) -> u64 {
        self.foreach_counter.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a collaborator `(predicate, handler)` pair. Registered after
    /// every built-in, so a matching predicate here outranks all of them.
    pub fn register(&self, predicate: Predicate, handler: Arc<dyn Handler>) -> Arc<Self> {
        self.registry.register(predicate, handler);
        self.arc()
    }

    /// Spawn `node`'s non-directive keys as concurrent workers against the
    /// braid's own root name stack. A bare (non-`Branch`) node is wrapped
    /// under a single synthetic root key so it still gets a result-table
    /// entry. Returns immediately; does not wait for the spawned work.
    pub fn run(&self, node: Node) -> Result<Arc<Self>, BraidError> {
        self.spawn(node, self.root_stack())?;
        Ok(self.arc())
    }

    /// As `run`, but against an explicit (already-framed) name stack. Used
    /// by the mapping handler to bind a nested fan-out to the frame it just
    /// pushed, rather than the braid's own root stack.
    pub(crate) fn run_with_stack(&self, node: Node, stack: NameStack) -> Result<(), BraidError> {
        self.spawn(node, stack)
    }

    fn spawn(&self, node: Node, stack: NameStack) -> Result<(), BraidError> {
        let branch = match node {
            Node::Branch(b) => b,
            other => Branch::new(vec![(ROOT_KEY, other)]),
        };

        let throttle = branch
            .get("$throttle")
            .and_then(|n| n.to_value().as_u64())
            .map(|n| n as usize)
            .unwrap_or(self.config.throttle);
        let semaphore = Arc::new(Semaphore::new(throttle.max(1)));

        let table = self.table();
        for (key, child) in branch.spawnable() {
            table.insert_not_started(key)?;

            let braid = self.arc();
            let child = child.clone();
            let key = key.to_string();
            let stack = stack.clone();
            let semaphore = Arc::clone(&semaphore);

            tokio::spawn(async move {
                let _permit = semaphore
                    .acquire()
                    .await
                    .expect("semaphore is never closed");
                tracing::debug!(key = %key, "worker starting");
                match braid.step(child, stack, Some(key.as_str())).await {
                    Ok(value) => {
                        braid.table().mark_done(&key, value);
                        tracing::debug!(key = %key, "worker finished");
                    }
                    Err(err) => {
                        braid.table().mark_error(&key);
                        tracing::warn!(key = %key, error = %err, "worker failed");
                    }
                }
            });
        }
        Ok(())
    }

    /// Drive `node` to a terminal [`Value`], applying the `$param`/`$sub`
    /// pre-transforms and looping on [`StepOutcome::Replace`] up to
    /// [`MAX_REPLACEMENTS`] times before dispatching to a matched handler.
    pub async fn step(
        &self,
        mut node: Node,
        mut stack: NameStack,
        key: Option<&str>,
    ) -> Result<Value, BraidError> {
        let mut replacements = 0usize;
        loop {
            if let Node::Branch(branch) = &node {
                if let Some(param) = branch.get("$param") {
                    let mut frame = HashMap::new();
                    match param.to_value() {
                        Value::Object(map) => frame.extend(map),
                        scalar => {
                            frame.insert("$param".to_string(), scalar);
                        }
                    }
                    let mut next_stack = stack.clone();
                    next_stack.add(frame);
                    stack = next_stack;
                }

                // $foreach does its own per-item prefixing (each clone gets the
                // clone's own fan-out key, not the wrapper's parent key), so
                // defer to it rather than prefixing the wrapper here.
                if branch.truthy("$sub") && !branch.contains_key("$foreach") {
                    let prefix = key.ok_or_else(|| BraidError::InvalidDirectivePayload {
                        directive: "$sub",
                        reason: "no parent key available to prefix with".to_string(),
                    })?;
                    node = Node::Branch(branch.prefixed(prefix));
                }
            }

            let handler = self.registry.find_match(&node)?;
            match handler.handle(self, &node, &stack, key).await? {
                StepOutcome::Done(value) => return Ok(value),
                StepOutcome::Replace(next) => {
                    replacements += 1;
                    if replacements > MAX_REPLACEMENTS {
                        return Err(BraidError::ReplaceLimitExceeded(MAX_REPLACEMENTS));
                    }
                    node = next;
                }
            }
        }
    }

    /// Barrier on the given keys, polling at `config.interval` until every
    /// one reaches a terminal state or `config.timeout` elapses.
    pub async fn wait(&self, keys: &[&str]) -> Result<(), BraidError> {
        let owned: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
        self.wait_keys(&owned).await
    }

    pub(crate) async fn wait_keys(&self, keys: &[String]) -> Result<(), BraidError> {
        let table = self.table();
        let target: Vec<String> = if keys.is_empty() {
            table.keys_snapshot()
        } else {
            keys.to_vec()
        };

        let deadline = Instant::now() + self.config.timeout;
        loop {
            let all_terminal = target
                .iter()
                .all(|k| table.state_of(k).map(State::is_terminal).unwrap_or(false));
            if all_terminal {
                return Ok(());
            }
            if Instant::now() >= deadline {
                tracing::warn!(keys = ?target, timeout = ?self.config.timeout, "wait timed out");
                return Err(BraidError::WaitTimeout {
                    keys: target,
                    timeout: self.config.timeout,
                });
            }
            tokio::time::sleep(self.config.interval).await;
        }
    }

    /// Read a finished value by key.
    pub fn get(&self, key: &str) -> Result<Value, BraidError> {
        self.table().get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.table().contains(key)
    }

    /// Snapshot of every key currently in the result table.
    pub fn keys(&self) -> Vec<String> {
        self.table().keys_snapshot()
    }

    /// Stash a metadata field against `key`'s result-table entry — the side
    /// channel a collaborator handler (e.g. an LLM adapter) uses to record
    /// extra detail about a running node, without the core's `{state,
    /// value}` entry needing to know what that detail is.
    pub fn stash_meta(&self, key: &str, field: &str, value: Value) {
        self.table().set_meta(key, field, value);
    }

    /// Read back whatever metadata has been stashed against `key`. Empty if
    /// none, or if no entry exists for `key`.
    pub fn meta(&self, key: &str) -> HashMap<String, Value> {
        self.table().meta(key)
    }

    /// Discard the result table and root name stack, starting fresh.
    /// Workers already spawned keep running against the table they were
    /// handed at spawn time (each captures its own `Arc<ResultTable>`); only
    /// braid-level operations issued after `reset` observe the new one.
    pub fn reset(&self) -> Arc<Self> {
        let table = Arc::new(ResultTable::new());
        *self.stack.write() = NameStack::rooted(Arc::clone(&table));
        *self.ttable.write() = table;
        self.arc()
    }
}
