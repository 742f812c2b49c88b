use crate::backend::{BackendChain, BackendError, InputComposer, RawResult, UpstreamComposer};
use crate::node::{NodeSpec, QualityPolicy};
use crate::progress::{NoopNotifier, ProgressNotifier};
use crate::state::WorkflowState;
use crate::store::ResultStore;
use crate::types::{ErrorKind, NodeError, NodeFingerprint, NodeOutcome, NodeResult};
use crate::validation;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{timeout, Instant};

/// Runs a single analysis node: cache short-circuit, backend chain,
/// structural validation and quality gate.
pub struct NodeExecutor {
    backends: Arc<BackendChain>,
    composer: Arc<dyn InputComposer>,
    notifier: Arc<dyn ProgressNotifier>,
    // one gate per node fingerprint currently executing
    in_flight: Mutex<HashMap<NodeFingerprint, Arc<tokio::sync::Mutex<()>>>>,
}

impl NodeExecutor {
    pub fn new(backends: BackendChain) -> Self {
        Self {
            backends: Arc::new(backends),
            composer: Arc::new(UpstreamComposer),
            notifier: Arc::new(NoopNotifier),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_composer(mut self, composer: Arc<dyn InputComposer>) -> Self {
        self.composer = composer;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn ProgressNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Execute a node against a state snapshot.
    ///
    /// Never returns an error: every failure is encoded in the result. At most
    /// one execution per node fingerprint is in flight; concurrent callers
    /// wait and are then served from the store.
    pub async fn execute(
        &self,
        node: &NodeSpec,
        state: &WorkflowState,
        store: &dyn ResultStore,
        default_timeout: Duration,
    ) -> NodeResult {
        let fingerprint = state.fingerprint.for_node(&node.id);
        let gate = GateRelease {
            executor: self,
            gate: self.gate_for(&fingerprint),
            fingerprint: fingerprint.clone(),
        };

        let _flight = gate.gate.lock().await;
        self.execute_exclusive(node, state, store, &fingerprint, default_timeout)
            .await
    }

    async fn execute_exclusive(
        &self,
        node: &NodeSpec,
        state: &WorkflowState,
        store: &dyn ResultStore,
        fingerprint: &NodeFingerprint,
        default_timeout: Duration,
    ) -> NodeResult {
        self.notifier.notify(&node.id, 0, "started");

        if let Some(cached) = self.lookup_cached(node, store, fingerprint).await {
            self.notifier.notify(&node.id, 100, "served from cache");
            return cached;
        }

        let budget = node.timeout.unwrap_or(default_timeout);
        let input = self.composer.compose(node, state);

        let result = match timeout(budget, self.invoke_chain(node, &input, budget)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(node_id = %node.id, "Node timed out after {:?}", budget);
                NodeResult::failed(
                    node.id.clone(),
                    NodeError::new(ErrorKind::Timeout, format!("timed out after {:?}", budget)),
                )
            }
        };

        let result = apply_quality_gate(node, result);

        if result.success && !result.quality_flagged {
            if let Err(e) = store.persist(fingerprint, &result).await {
                tracing::warn!(node_id = %node.id, error = %e, "Failed to persist node result");
            }
        }

        let summary = if result.success { "completed" } else { "failed" };
        self.notifier.notify(&node.id, 100, summary);
        result
    }

    async fn lookup_cached(
        &self,
        node: &NodeSpec,
        store: &dyn ResultStore,
        fingerprint: &NodeFingerprint,
    ) -> Option<NodeResult> {
        match store.lookup(fingerprint).await {
            Ok(Some(mut cached)) if node.accepts_cached(&cached) => {
                tracing::debug!(node_id = %node.id, "Short-circuit from stored result");
                cached.outcome = NodeOutcome::Cached;
                // reaching this run is what counts when merging against older failures
                cached.completed_at = Utc::now();
                Some(cached)
            }
            Ok(Some(_)) => {
                tracing::debug!(node_id = %node.id, "Stored result rejected, executing");
                None
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(node_id = %node.id, error = %e, "Result lookup failed, executing");
                None
            }
        }
    }

    /// Try each backend in order within one shared budget
    async fn invoke_chain(
        &self,
        node: &NodeSpec,
        input: &serde_json::Value,
        budget: Duration,
    ) -> NodeResult {
        let routes = self.backends.routes_for(node);
        if routes.is_empty() {
            return NodeResult::failed(
                node.id.clone(),
                NodeError::new(ErrorKind::BackendUnavailable, "no backend can serve this node"),
            );
        }

        let started = Instant::now();
        let mut failures: Vec<NodeError> = Vec::new();
        let mut calls = 0;

        for route in routes {
            let remaining = budget.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                break;
            }
            calls += 1;

            let outcome = match route.backend.invoke(&node.id, input, remaining).await {
                Ok(raw) => interpret(node, &raw),
                Err(e) => Err(backend_failure(e)),
            };

            match outcome {
                Ok(payload) => {
                    let confidence = node.confidence_of(&payload);
                    let mut result = NodeResult::succeeded(node.id.clone(), payload, confidence);
                    result.backend = Some(route.id.clone());
                    result.attempts = calls;
                    return result;
                }
                Err(error) => {
                    tracing::warn!(
                        node_id = %node.id,
                        backend = %route.id,
                        error = %error,
                        "Backend attempt failed, trying next"
                    );
                    failures.push(NodeError::new(
                        error.kind,
                        format!("{}: {}", route.id, error.message),
                    ));
                }
            }
        }

        let kind = failures
            .last()
            .map_or(ErrorKind::Timeout, |error| error.kind);
        let message = failures
            .iter()
            .map(|error| error.message.as_str())
            .collect::<Vec<_>>()
            .join("; ");
        let mut result = NodeResult::failed(node.id.clone(), NodeError::new(kind, message));
        result.attempts = calls;
        result
    }

    fn gate_for(&self, fingerprint: &NodeFingerprint) -> Arc<tokio::sync::Mutex<()>> {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(fingerprint.clone())
            .or_default()
            .clone()
    }

    fn release_gate(&self, fingerprint: &NodeFingerprint, gate: &Arc<tokio::sync::Mutex<()>>) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        // the map and this caller hold the only references: nobody is waiting
        if Arc::strong_count(gate) == 2 {
            in_flight.remove(fingerprint);
        }
    }
}

/// Gives a fingerprint's gate back when an execution ends, aborted or not
struct GateRelease<'a> {
    executor: &'a NodeExecutor,
    gate: Arc<tokio::sync::Mutex<()>>,
    fingerprint: NodeFingerprint,
}

impl Drop for GateRelease<'_> {
    fn drop(&mut self) {
        self.executor.release_gate(&self.fingerprint, &self.gate);
    }
}

/// Parse, repair once, validate and coerce a raw backend body
fn interpret(node: &NodeSpec, raw: &RawResult) -> Result<serde_json::Value, NodeError> {
    let payload = match validation::parse_structured(&raw.body) {
        Ok(payload) => payload,
        Err(parse_error) => match validation::repair(&raw.body) {
            Some(repaired) => validation::parse_structured(&repaired)?,
            None => return Err(parse_error),
        },
    };

    match node.validator.validate(&payload) {
        Ok(()) => Ok(payload),
        Err(error) => match validation::coerce(&payload) {
            Some(coerced) if node.validator.validate(&coerced).is_ok() => Ok(coerced),
            _ => Err(error),
        },
    }
}

fn backend_failure(error: BackendError) -> NodeError {
    let kind = match error {
        BackendError::Timeout => ErrorKind::Timeout,
        BackendError::Unavailable(_) | BackendError::Rejected(_) => ErrorKind::BackendUnavailable,
    };
    NodeError::new(kind, error.to_string())
}

fn apply_quality_gate(node: &NodeSpec, mut result: NodeResult) -> NodeResult {
    if !result.success {
        return result;
    }

    let Some(reason) = node.quality.evaluate(&result.payload, result.confidence) else {
        return result;
    };

    match node.quality.policy {
        QualityPolicy::Advisory => {
            tracing::info!(node_id = %node.id, "Result flagged by quality gate: {}", reason);
            result.quality_flagged = true;
            result
        }
        QualityPolicy::Blocking => {
            tracing::warn!(node_id = %node.id, "Result rejected by quality gate: {}", reason);
            let mut failed =
                NodeResult::failed(node.id.clone(), NodeError::new(ErrorKind::QualityGate, reason));
            failed.backend = result.backend;
            failed.attempts = result.attempts;
            failed
        }
    }
}
