//! Error taxonomy for the braid executor.

use std::time::Duration;

use crate::value::Node;

/// Errors raised by the braid executor.
///
/// Workers never let these escape to sibling workers: a handler error caught
/// at the worker boundary is logged and folded into the result-table entry's
/// `error` state instead. Only direct callers of `run`/`wait`/`get` see these.
#[derive(Debug, thiserror::Error)]
pub enum BraidError {
    /// Reading a result-table entry that hasn't reached `done` yet.
    #[error("key '{0}' has not finished running")]
    UnfinishedThread(String),

    /// `run` was asked to insert a key already present in the result table.
    #[error("key '{0}' already has a result-table entry")]
    KeyOverrideAttempt(String),

    /// No registered predicate matched the node.
    #[error("no handler matched node: {0:?}")]
    NoMatchedFunction(Node),

    /// A barrier wait exceeded the configured timeout.
    #[error("wait on {keys:?} timed out after {timeout:?}")]
    WaitTimeout { keys: Vec<String>, timeout: Duration },

    /// The `$replace` loop exceeded the bounded retry count without converging.
    #[error("node replaced more than {0} times without converging to a terminal value")]
    ReplaceLimitExceeded(usize),

    /// A directive's payload had the wrong shape (`$foreach` not iterable,
    /// `$wait` not a list of strings, `$param` not representable as a frame, ...).
    #[error("directive '{directive}' has an invalid payload: {reason}")]
    InvalidDirectivePayload {
        directive: &'static str,
        reason: String,
    },

    /// A callable handler (`$run` target, or an externally registered handler)
    /// failed. Wraps whatever the callable returned.
    #[error("handler failed: {0}")]
    Handler(#[from] anyhow::Error),
}
