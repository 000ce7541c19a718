//! A concurrent braid executor: data-directed dispatch over parallel
//! branches and sequential chains.
//!
//! A task graph is built from [`Node`]s — [`Node::Branch`] for a mapping
//! whose non-directive keys run concurrently, [`Node::Chain`] for a list
//! that runs strictly in order threading `$result`, [`Node::Scalar`] for
//! plain data (including the `@key1,key2` wait sugar), and [`Node::Callable`]
//! for a host function invoked via the `$run` directive. [`Braid::run`]
//! spawns a graph's top-level keys as concurrent workers against a shared
//! [`table::ResultTable`]; [`Braid::wait`] barriers on a subset of them.

mod braid;
mod error;
mod handlers;
mod namestack;
mod registry;
mod table;
mod value;

pub use braid::{Braid, BraidConfig};
pub use error::BraidError;
pub use namestack::NameStack;
pub use registry::{FnHandler, Handler, MatcherRegistry, Predicate, StepOutcome};
pub use table::{Entry, ResultTable, State};
pub use value::{Branch, Callable, CallableFn, Node, Value};

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn test_braid() -> Arc<Braid> {
        Braid::new(BraidConfig {
            interval: Duration::from_millis(5),
            timeout: Duration::from_millis(500),
            throttle: 8,
        })
    }

    #[tokio::test]
    async fn parallel_scalars_all_resolve() {
        let braid = test_braid();
        braid
            .run(Node::branch(vec![
                ("a", Node::scalar(1)),
                ("b", Node::scalar(2)),
                ("c", Node::scalar(3)),
            ]))
            .unwrap();
        braid.wait(&[]).await.unwrap();
        assert_eq!(braid.get("a").unwrap(), Value::from(1));
        assert_eq!(braid.get("b").unwrap(), Value::from(2));
        assert_eq!(braid.get("c").unwrap(), Value::from(3));
    }

    #[tokio::test]
    async fn chain_threads_result() {
        let braid = test_braid();
        braid
            .run(Node::branch(vec![(
                "total",
                Node::chain(vec![
                    Node::scalar(10),
                    Node::callable(|_node, stack| async move {
                        let prev = stack.get("$result").unwrap().unwrap_or(Value::from(0));
                        Ok(Value::from(prev.as_i64().unwrap() + 5))
                    }),
                ]),
            )]))
            .unwrap();
        braid.wait(&["total"]).await.unwrap();
        assert_eq!(braid.get("total").unwrap(), Value::from(15));
    }

    #[tokio::test]
    async fn cross_branch_dependency_via_wait_sugar() {
        let braid = test_braid();
        braid
            .run(Node::branch(vec![
                ("a", Node::scalar(7)),
                (
                    "b",
                    Node::chain(vec![
                        Node::str("@a"),
                        Node::callable(|_node, stack| async move {
                            let a = stack.get("$result").unwrap().unwrap();
                            Ok(Value::from(a.as_i64().unwrap() * 2))
                        }),
                    ]),
                ),
            ]))
            .unwrap();
        braid.wait(&["a", "b"]).await.unwrap();
        assert_eq!(braid.get("b").unwrap(), Value::from(14));
    }

    #[tokio::test]
    async fn duplicate_key_is_rejected() {
        let braid = test_braid();
        braid.run(Node::branch(vec![("x", Node::scalar(1))])).unwrap();
        let err = braid
            .run(Node::branch(vec![("x", Node::scalar(2))]))
            .unwrap_err();
        assert!(matches!(err, BraidError::KeyOverrideAttempt(k) if k == "x"));
    }

    #[tokio::test]
    async fn wait_times_out_on_a_key_that_never_resolves() {
        let braid = Braid::new(BraidConfig {
            interval: Duration::from_millis(5),
            timeout: Duration::from_millis(30),
            throttle: 8,
        });
        braid
            .run(Node::branch(vec![(
                "stuck",
                Node::callable(|_node, _stack| async move {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(Value::Null)
                }),
            )]))
            .unwrap();
        let err = braid.wait(&["stuck"]).await.unwrap_err();
        assert!(matches!(err, BraidError::WaitTimeout { .. }));
    }

    #[tokio::test]
    async fn foreach_fans_out_one_worker_per_item() {
        let braid = test_braid();
        braid
            .run(Node::branch(vec![(
                "all",
                Node::branch(vec![
                    (
                        "$foreach",
                        Node::scalar(serde_json::json!(["a", "b", "c"])),
                    ),
                    ("$sub", Node::scalar(true)),
                    (
                        "body",
                        Node::callable(|_node, stack| async move {
                            Ok(stack.get("$param").unwrap().unwrap_or(Value::Null))
                        }),
                    ),
                ]),
            )]))
            .unwrap();
        braid.wait(&["all"]).await.unwrap();

        let mut fanout_keys: Vec<String> = braid
            .keys()
            .into_iter()
            .filter(|k| k.starts_with("foreach:") && k.ends_with(":body"))
            .collect();
        fanout_keys.sort();
        assert_eq!(fanout_keys.len(), 3);
        assert_eq!(
            fanout_keys,
            vec!["foreach:0:0:body", "foreach:0:1:body", "foreach:0:2:body"]
        );
    }

    #[tokio::test]
    async fn collaborator_can_stash_and_read_back_meta() {
        let braid = test_braid();
        braid.register(
            Arc::new(|n: &Node| matches!(n, Node::Branch(b) if b.contains_key("$probe"))),
            Arc::new(FnHandler::new(|braid, _node, _stack, key| async move {
                if let Some(k) = key {
                    braid.stash_meta(k, "model", Value::from("test-model"));
                }
                Ok(StepOutcome::Done(Value::from("intercepted")))
            })),
        );
        braid
            .run(Node::branch(vec![(
                "p",
                Node::branch(vec![("$probe", Node::scalar(true))]),
            )]))
            .unwrap();
        braid.wait(&["p"]).await.unwrap();
        let meta = braid.meta("p");
        assert_eq!(meta.get("model"), Some(&Value::from("test-model")));
    }

    #[tokio::test]
    async fn collaborator_handler_outranks_built_ins() {
        let braid = test_braid();
        braid.register(
            Arc::new(|n: &Node| matches!(n, Node::Branch(b) if b.contains_key("$probe"))),
            Arc::new(FnHandler::new(|_braid, _node, _stack, _key| async move {
                Ok(StepOutcome::Done(Value::from("intercepted")))
            })),
        );
        braid
            .run(Node::branch(vec![(
                "p",
                Node::branch(vec![("$probe", Node::scalar(true))]),
            )]))
            .unwrap();
        braid.wait(&["p"]).await.unwrap();
        assert_eq!(braid.get("p").unwrap(), Value::from("intercepted"));
    }
}
