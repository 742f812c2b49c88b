use super::executor::NodeExecutor;
use crate::node::NodeSpec;
use crate::state::WorkflowState;
use crate::store::ResultStore;
use crate::types::{ErrorKind, NodeError, NodeId, NodeResult};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;

/// Results of one fan-out, in the order the nodes were given
#[derive(Debug, Clone)]
pub struct FanoutReport {
    pub results: Vec<NodeResult>,
    pub peak_in_flight: usize,
}

/// Runs independent nodes concurrently with at most `limit` in flight
pub struct BoundedFanoutCoordinator {
    executor: Arc<NodeExecutor>,
}

impl BoundedFanoutCoordinator {
    pub fn new(executor: Arc<NodeExecutor>) -> Self {
        Self { executor }
    }

    pub fn executor(&self) -> &Arc<NodeExecutor> {
        &self.executor
    }

    pub async fn run(
        &self,
        nodes: Vec<NodeSpec>,
        state: Arc<WorkflowState>,
        store: Arc<dyn ResultStore>,
        limit: usize,
        node_timeout: Duration,
        cancel: &CancellationToken,
    ) -> FanoutReport {
        let semaphore = Arc::new(Semaphore::new(limit.max(1)));
        let counters = Arc::new(InFlightCounters::default());
        let node_ids: Vec<NodeId> = nodes.iter().map(|node| node.id.clone()).collect();

        let mut join_set = JoinSet::new();
        for (index, node) in nodes.into_iter().enumerate() {
            join_set.spawn(
                NodeTask {
                    index,
                    node,
                    executor: self.executor.clone(),
                    state: state.clone(),
                    store: store.clone(),
                    semaphore: semaphore.clone(),
                    counters: counters.clone(),
                    cancel: cancel.clone(),
                    node_timeout,
                }
                .run(),
            );
        }

        let mut slots: Vec<Option<NodeResult>> = vec![None; node_ids.len()];
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, result)) => slots[index] = Some(result),
                Err(join_err) => {
                    tracing::error!(?join_err, "Fan-out task failed");
                }
            }
        }

        let results = slots
            .into_iter()
            .zip(node_ids)
            .map(|(slot, node_id)| {
                slot.unwrap_or_else(|| {
                    NodeResult::failed(
                        node_id,
                        NodeError::new(ErrorKind::Panicked, "node task did not report a result"),
                    )
                })
            })
            .collect();

        FanoutReport {
            results,
            peak_in_flight: counters.peak.load(Ordering::SeqCst),
        }
    }
}

#[derive(Default)]
struct InFlightCounters {
    current: AtomicUsize,
    peak: AtomicUsize,
}

/// Holds a permit for the lifetime of one node execution.
///
/// The count is decremented in `drop` before the permit field is released,
/// so the observed count never exceeds the limit.
struct InFlightGuard {
    _permit: OwnedSemaphorePermit,
    counters: Arc<InFlightCounters>,
}

impl InFlightGuard {
    fn enter(permit: OwnedSemaphorePermit, counters: Arc<InFlightCounters>) -> Self {
        let now = counters.current.fetch_add(1, Ordering::SeqCst) + 1;
        counters.peak.fetch_max(now, Ordering::SeqCst);
        Self {
            _permit: permit,
            counters,
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.counters.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Everything one spawned node needs
struct NodeTask {
    index: usize,
    node: NodeSpec,
    executor: Arc<NodeExecutor>,
    state: Arc<WorkflowState>,
    store: Arc<dyn ResultStore>,
    semaphore: Arc<Semaphore>,
    counters: Arc<InFlightCounters>,
    cancel: CancellationToken,
    node_timeout: Duration,
}

impl NodeTask {
    async fn run(self) -> (usize, NodeResult) {
        let index = self.index;
        let node_id = self.node.id.clone();
        let cancel = self.cancel.clone();

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!(node_id = %node_id, "Node cancelled");
                NodeResult::failed(
                    node_id,
                    NodeError::new(ErrorKind::Cancelled, "run cancelled before the node finished"),
                )
            }
            result = self.execute() => result,
        };

        (index, result)
    }

    async fn execute(self) -> NodeResult {
        let node_id = self.node.id.clone();
        let permit = match self.semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                return NodeResult::failed(
                    node_id,
                    NodeError::new(ErrorKind::Cancelled, "fan-out closed"),
                )
            }
        };
        let _guard = InFlightGuard::enter(permit, self.counters.clone());

        // Inner task: a panic in the node body stays contained here, and
        // dropping this future (cancellation) aborts it.
        let NodeTask {
            node,
            executor,
            state,
            store,
            node_timeout,
            ..
        } = self;
        let body = AbortOnDropHandle::new(tokio::spawn(async move {
            executor
                .execute(&node, &state, store.as_ref(), node_timeout)
                .await
        }));

        match body.await {
            Ok(result) => result,
            Err(join_err) if join_err.is_panic() => {
                let message = panic_message(join_err.into_panic());
                tracing::error!(node_id = %node_id, "Node panicked: {}", message);
                NodeResult::failed(node_id, NodeError::new(ErrorKind::Panicked, message))
            }
            Err(_) => NodeResult::failed(
                node_id,
                NodeError::new(ErrorKind::Cancelled, "node task was aborted"),
            ),
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "node panicked".to_string()
    }
}
