use super::fanout::BoundedFanoutCoordinator;
use super::plan::PhaseDefinition;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::node::NodeSpec;
use crate::state::{StateUpdate, WorkflowState};
use crate::store::ResultStore;
use crate::types::{NodeId, NodeOutcome, NodeResult, PhaseId};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Per-run execution limits
#[derive(Debug, Clone, Copy)]
pub struct ExecutionSettings {
    pub concurrency_limit: usize,
    pub node_timeout: Duration,
}

/// What happened to each node during one phase pass
#[derive(Debug, Clone, Default)]
pub struct PhaseReport {
    pub phase_id: Option<PhaseId>,
    pub executed: Vec<NodeId>,
    pub cached: Vec<NodeId>,
    /// Already successful in the state; not run again
    pub reused: Vec<NodeId>,
    /// Not eligible because prerequisites were missing
    pub skipped: Vec<NodeId>,
    pub failed: Vec<NodeId>,
    pub peak_in_flight: usize,
    pub complete: bool,
}

/// Runs phases one at a time and is the only writer of phase flags
pub struct PhaseScheduler {
    coordinator: BoundedFanoutCoordinator,
}

impl PhaseScheduler {
    pub fn new(coordinator: BoundedFanoutCoordinator) -> Self {
        Self { coordinator }
    }

    /// Run every node of a phase that does not already have a usable result
    pub async fn run_phase(
        &self,
        phase: &PhaseDefinition,
        state: &mut WorkflowState,
        settings: ExecutionSettings,
        store: Arc<dyn ResultStore>,
        cancel: &CancellationToken,
    ) -> OrchestratorResult<PhaseReport> {
        if let Some(predecessor) = &phase.predecessor {
            if !state.is_phase_complete(predecessor) {
                return Err(OrchestratorError::PhaseOrder {
                    phase: phase.id.clone(),
                    predecessor: predecessor.clone(),
                });
            }
        }

        tracing::info!("Starting phase {} ({} nodes)", phase.id, phase.nodes.len());
        let selected: Vec<&NodeSpec> = phase.nodes.iter().collect();
        self.execute_nodes(phase, selected, state, settings, store, cancel)
            .await
    }

    /// Re-execute selected nodes of a phase, e.g. a failed blocking node
    pub async fn rerun_nodes(
        &self,
        phase: &PhaseDefinition,
        node_ids: &[NodeId],
        state: &mut WorkflowState,
        settings: ExecutionSettings,
        store: Arc<dyn ResultStore>,
        cancel: &CancellationToken,
    ) -> OrchestratorResult<PhaseReport> {
        let selected = node_ids
            .iter()
            .map(|node_id| {
                phase.find_node(node_id).ok_or_else(|| {
                    OrchestratorError::InvalidPlan(format!(
                        "node {} is not part of phase {}",
                        node_id, phase.id
                    ))
                })
            })
            .collect::<OrchestratorResult<Vec<_>>>()?;

        tracing::info!("Re-running {} node(s) of phase {}", selected.len(), phase.id);
        self.execute_nodes(phase, selected, state, settings, store, cancel)
            .await
    }

    /// Give up on a node: record it as skipped so it no longer holds the phase back
    pub fn waive_node(
        &self,
        phase: &PhaseDefinition,
        node_id: &NodeId,
        reason: &str,
        state: &mut WorkflowState,
    ) -> OrchestratorResult<()> {
        let mut update = StateUpdate::new();
        update.skip(node_id.clone());
        update.note_error(format!("{}: waived: {}", node_id, reason));
        state.merge(update)?;

        let complete = is_phase_satisfied(phase, state);
        state.set_phase_complete(phase.id.clone(), complete);
        tracing::warn!("Waived node {} in phase {}: {}", node_id, phase.id, reason);
        Ok(())
    }

    async fn execute_nodes(
        &self,
        phase: &PhaseDefinition,
        selected: Vec<&NodeSpec>,
        state: &mut WorkflowState,
        settings: ExecutionSettings,
        store: Arc<dyn ResultStore>,
        cancel: &CancellationToken,
    ) -> OrchestratorResult<PhaseReport> {
        let mut report = PhaseReport {
            phase_id: Some(phase.id.clone()),
            ..Default::default()
        };
        let mut update = StateUpdate::new();
        let mut runnable = Vec::new();

        for node in selected {
            if state
                .result(&node.id)
                .is_some_and(|existing| node.accepts_cached(existing))
            {
                report.reused.push(node.id.clone());
                continue;
            }

            match phase.check_artifacts(state, node) {
                Ok(()) => runnable.push(node.clone()),
                Err(reason) => {
                    tracing::info!("Skipping node {}: {}", node.id, reason);
                    report.skipped.push(node.id.clone());
                    let attempt = state.attempts(&node.id) + 1;
                    update.record(NodeResult::skipped(node.id.clone(), reason), node.blocking, attempt);
                }
            }
        }

        if !runnable.is_empty() {
            let snapshot = Arc::new(state.clone());
            let fanout = self
                .coordinator
                .run(
                    runnable,
                    snapshot,
                    store,
                    settings.concurrency_limit,
                    settings.node_timeout,
                    cancel,
                )
                .await;
            report.peak_in_flight = fanout.peak_in_flight;

            for result in fanout.results {
                let Some(node) = phase.find_node(&result.node_id) else {
                    continue;
                };

                match (result.success, result.outcome) {
                    (true, NodeOutcome::Cached) => report.cached.push(node.id.clone()),
                    (true, _) => report.executed.push(node.id.clone()),
                    (false, _) => {
                        tracing::warn!(
                            "Node {} failed: {}",
                            node.id,
                            result
                                .error
                                .as_ref()
                                .map(|e| e.to_string())
                                .unwrap_or_default()
                        );
                        report.failed.push(node.id.clone());
                    }
                }

                let attempt = state.attempts(&node.id) + 1;
                update.record(result, node.blocking, attempt);
            }
        }

        state.merge(update)?;

        report.complete = is_phase_satisfied(phase, state);
        state.set_phase_complete(phase.id.clone(), report.complete);

        tracing::info!(
            "Phase {} finished: complete={}, executed={}, cached={}, reused={}, skipped={}, failed={}",
            phase.id,
            report.complete,
            report.executed.len(),
            report.cached.len(),
            report.reused.len(),
            report.skipped.len(),
            report.failed.len()
        );

        Ok(report)
    }
}

/// Every blocking node succeeded or was explicitly waived
fn is_phase_satisfied(phase: &PhaseDefinition, state: &WorkflowState) -> bool {
    phase.nodes.iter().filter(|node| node.blocking).all(|node| {
        state.result(&node.id).is_some_and(|result| result.success)
            || state.skipped_analyzers.contains(&node.id)
    })
}
