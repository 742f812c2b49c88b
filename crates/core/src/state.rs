//! Workflow state and its per-field merge table.
//!
//! Nodes never touch [`WorkflowState`] directly. They hand back results, the
//! scheduler folds those into a [`StateUpdate`], and the update is merged by
//! the single owner of the state. Every merge rule below is associative and
//! commutative, so the completion order of concurrent nodes is irrelevant.

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::types::{DocumentFingerprint, NodeId, NodeResult, PhaseId, RunStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Shared state of one pipeline invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub fingerprint: DocumentFingerprint,
    pub results: BTreeMap<NodeId, NodeResult>,
    phase_complete: BTreeMap<PhaseId, bool>,
    pub processing_errors: Vec<String>,
    pub skipped_analyzers: Vec<NodeId>,
    pub risk_flags: Vec<String>,
    pub degraded_analyzers: Vec<NodeId>,
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub attempts: BTreeMap<NodeId, u32>,
    status: RunStatus,
    frozen: bool,
    pub created_at: DateTime<Utc>,
}

/// Additive delta produced from a batch of node results
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateUpdate {
    pub results: BTreeMap<NodeId, NodeResult>,
    pub processing_errors: Vec<String>,
    pub skipped_analyzers: Vec<NodeId>,
    pub risk_flags: Vec<String>,
    pub degraded_analyzers: Vec<NodeId>,
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub attempts: BTreeMap<NodeId, u32>,
}

impl StateUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one node result, deriving the accumulator entries it implies.
    ///
    /// `attempt` is the node's cumulative attempt number for this document.
    pub fn record(&mut self, result: NodeResult, blocking: bool, attempt: u32) {
        let node_id = result.node_id.clone();

        if !result.success {
            let message = result
                .error
                .as_ref()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown error".to_string());
            union_into(
                &mut self.processing_errors,
                vec![format!("{}: {}", node_id, message)],
            );
            if !blocking {
                union_into(&mut self.skipped_analyzers, vec![node_id.clone()]);
            }
        }

        if result.quality_flagged {
            union_into(&mut self.degraded_analyzers, vec![node_id.clone()]);
            union_into(
                &mut self.risk_flags,
                vec![format!("low_quality:{}", node_id)],
            );
        }

        merge_attempts(&mut self.attempts, BTreeMap::from([(node_id, attempt)]));

        merge_result(&mut self.results, result);
    }

    pub fn flag_risk(&mut self, flag: impl Into<String>) {
        union_into(&mut self.risk_flags, vec![flag.into()]);
    }

    pub fn note_error(&mut self, message: impl Into<String>) {
        union_into(&mut self.processing_errors, vec![message.into()]);
    }

    pub fn skip(&mut self, node_id: NodeId) {
        union_into(&mut self.skipped_analyzers, vec![node_id]);
    }

    pub fn set_metadata(&mut self, key: impl Into<String>, value: serde_json::Value) {
        merge_metadata(&mut self.metadata, BTreeMap::from([(key.into(), value)]));
    }

    /// Fold another update into this one using the same rules as [`WorkflowState::merge`]
    pub fn combine(mut self, other: StateUpdate) -> StateUpdate {
        for result in other.results.into_values() {
            merge_result(&mut self.results, result);
        }
        union_into(&mut self.processing_errors, other.processing_errors);
        union_into(&mut self.skipped_analyzers, other.skipped_analyzers);
        union_into(&mut self.risk_flags, other.risk_flags);
        union_into(&mut self.degraded_analyzers, other.degraded_analyzers);
        merge_metadata(&mut self.metadata, other.metadata);
        merge_attempts(&mut self.attempts, other.attempts);
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl WorkflowState {
    pub fn new(fingerprint: DocumentFingerprint) -> Self {
        Self {
            fingerprint,
            results: BTreeMap::new(),
            phase_complete: BTreeMap::new(),
            processing_errors: Vec::new(),
            skipped_analyzers: Vec::new(),
            risk_flags: Vec::new(),
            degraded_analyzers: Vec::new(),
            metadata: BTreeMap::new(),
            attempts: BTreeMap::new(),
            status: RunStatus::Running,
            frozen: false,
            created_at: Utc::now(),
        }
    }

    /// Start a new invocation from previously persisted state.
    ///
    /// The prior state is copied, never mutated, and must belong to the same document.
    pub fn seeded_from(
        fingerprint: DocumentFingerprint,
        prior: &WorkflowState,
    ) -> OrchestratorResult<Self> {
        if prior.fingerprint != fingerprint {
            return Err(OrchestratorError::InconsistentState(format!(
                "seed state belongs to document {}, not {}",
                prior.fingerprint, fingerprint
            )));
        }

        let mut state = prior.clone();
        state.status = RunStatus::Running;
        state.frozen = false;
        state.created_at = Utc::now();
        Ok(state)
    }

    /// Apply an update. Lists are unioned, maps merged key-wise.
    pub fn merge(&mut self, update: StateUpdate) -> OrchestratorResult<()> {
        if self.frozen {
            return Err(OrchestratorError::StateFrozen);
        }

        for result in update.results.into_values() {
            merge_result(&mut self.results, result);
        }
        union_into(&mut self.processing_errors, update.processing_errors);
        union_into(&mut self.skipped_analyzers, update.skipped_analyzers);
        union_into(&mut self.risk_flags, update.risk_flags);
        union_into(&mut self.degraded_analyzers, update.degraded_analyzers);
        merge_metadata(&mut self.metadata, update.metadata);
        merge_attempts(&mut self.attempts, update.attempts);
        Ok(())
    }

    pub fn result(&self, node_id: &NodeId) -> Option<&NodeResult> {
        self.results.get(node_id)
    }

    pub fn attempts(&self, node_id: &NodeId) -> u32 {
        self.attempts.get(node_id).copied().unwrap_or(0)
    }

    pub fn is_phase_complete(&self, phase_id: &PhaseId) -> bool {
        self.phase_complete.get(phase_id).copied().unwrap_or(false)
    }

    pub fn phase_flags(&self) -> &BTreeMap<PhaseId, bool> {
        &self.phase_complete
    }

    /// Scalar flag, written only by the phase scheduler
    pub(crate) fn set_phase_complete(&mut self, phase_id: PhaseId, complete: bool) {
        if !self.frozen {
            self.phase_complete.insert(phase_id, complete);
        }
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Close the state at a terminal phase or abort
    pub(crate) fn freeze(&mut self, status: RunStatus) {
        self.status = status;
        self.frozen = true;
    }

    /// Skipped analyzers that were not later recovered by a successful retry
    pub fn outstanding_skipped(&self) -> Vec<NodeId> {
        self.skipped_analyzers
            .iter()
            .filter(|id| !self.results.get(*id).is_some_and(|r| r.success))
            .cloned()
            .collect()
    }
}

fn union_into<T: Ord>(target: &mut Vec<T>, incoming: Vec<T>) {
    target.extend(incoming);
    target.sort();
    target.dedup();
}

fn merge_result(results: &mut BTreeMap<NodeId, NodeResult>, incoming: NodeResult) {
    match results.get(&incoming.node_id) {
        Some(existing) if !supersedes(&incoming, existing) => {}
        _ => {
            results.insert(incoming.node_id.clone(), incoming);
        }
    }
}

/// Total order over competing results for the same node: newer, then
/// successful, then by payload text, then by the whole serialized result.
/// Results that compare equal are identical, so merges stay order-independent.
fn supersedes(candidate: &NodeResult, existing: &NodeResult) -> bool {
    candidate
        .completed_at
        .cmp(&existing.completed_at)
        .then(candidate.success.cmp(&existing.success))
        .then_with(|| candidate.payload.to_string().cmp(&existing.payload.to_string()))
        .then_with(|| canonical(candidate).cmp(&canonical(existing)))
        .is_gt()
}

fn canonical(result: &NodeResult) -> String {
    serde_json::to_string(result).unwrap_or_default()
}

fn merge_metadata(
    target: &mut BTreeMap<String, serde_json::Value>,
    incoming: BTreeMap<String, serde_json::Value>,
) {
    for (key, value) in incoming {
        match target.get(&key) {
            Some(existing) if existing.to_string() >= value.to_string() => {}
            _ => {
                target.insert(key, value);
            }
        }
    }
}

fn merge_attempts(target: &mut BTreeMap<NodeId, u32>, incoming: BTreeMap<NodeId, u32>) {
    for (node_id, count) in incoming {
        let entry = target.entry(node_id).or_insert(0);
        *entry = (*entry).max(count);
    }
}
