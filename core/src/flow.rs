//! Ordered, mutable interceptor pipelines.
//!
//! A [Flow] executes its nodes in registration order, threading the payload
//! through each one. Any node may short-circuit the surrounding operation by
//! returning [FlowControl::Abort]; downstream nodes and the operation itself
//! then do not run.

use futures::future::BoxFuture;
use std::future::Future;
use std::sync::{Arc, RwLock};

/// Two-branch result of a flow node.
pub enum FlowControl<T> {
    Continue(T),
    Abort,
}

/// Sentinel yielded by an operation whose flow pipeline aborted.
///
/// Neither success nor error: the operation simply did not run. Callers that
/// registered no aborting flow nodes will never observe it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Aborted;

impl std::fmt::Display for Aborted {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "PROMISE_ABORTED")
    }
}

/// Result of an operation that may be short-circuited by a flow node.
pub type OpResult<T> = Result<T, Aborted>;

type FlowNode<T> = Arc<dyn Fn(T) -> BoxFuture<'static, FlowControl<T>> + Send + Sync>;

pub struct Flow<T> {
    name: &'static str,
    nodes: RwLock<Vec<FlowNode<T>>>,
}

impl<T: Send + 'static> Flow<T> {
    pub fn new(name: &'static str) -> Self {
        Self { name, nodes: RwLock::new(Vec::new()) }
    }

    /// Append a node; nodes run in the order they were pushed.
    pub fn push<F, Fut>(&self, node: F)
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = FlowControl<T>> + Send + 'static,
    {
        let boxed: FlowNode<T> = Arc::new(move |t| Box::pin(node(t)));
        self.nodes.write().unwrap().push(boxed);
    }

    pub fn len(&self) -> usize {
        self.nodes.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every node over `input`. Stops at the first [FlowControl::Abort].
    pub async fn exec(&self, input: T) -> FlowControl<T> {
        // snapshot so no lock is held across await points
        let nodes: Vec<FlowNode<T>> = self.nodes.read().unwrap().clone();
        let mut current = input;
        for (i, node) in nodes.iter().enumerate() {
            match node(current).await {
                FlowControl::Continue(next) => current = next,
                FlowControl::Abort => {
                    log::debug!("flow {} aborted at node {}", self.name, i);
                    return FlowControl::Abort;
                }
            }
        }
        FlowControl::Continue(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use futures::executor::block_on;

    #[derive(Debug, PartialEq)]
    struct Payload(Vec<&'static str>);

    #[test]
    fn test_nodes_run_in_registration_order() {
        let flow: Flow<Payload> = Flow::new("test");
        flow.push(|mut p: Payload| async move {
            p.0.push("a");
            FlowControl::Continue(p)
        });
        flow.push(|mut p: Payload| async move {
            p.0.push("b");
            FlowControl::Continue(p)
        });
        let out = block_on(flow.exec(Payload(vec![])));
        match out {
            FlowControl::Continue(p) => assert_eq!(p.0, vec!["a", "b"]),
            FlowControl::Abort => panic!("unexpected abort"),
        }
    }

    #[test]
    fn test_abort_short_circuits() {
        let flow: Flow<Payload> = Flow::new("test");
        flow.push(|_| async move { FlowControl::Abort });
        flow.push(|mut p: Payload| async move {
            p.0.push("never");
            FlowControl::Continue(p)
        });
        assert!(matches!(block_on(flow.exec(Payload(vec![]))), FlowControl::Abort));
        assert_eq!(flow.len(), 2);
    }

    #[test]
    fn test_empty_flow_passes_through() {
        let flow: Flow<u32> = Flow::new("empty");
        assert!(flow.is_empty());
        match block_on(flow.exec(7)) {
            FlowControl::Continue(v) => assert_eq!(v, 7),
            FlowControl::Abort => panic!("unexpected abort"),
        }
    }
}
