use super::plan::PhasePlan;
use crate::state::WorkflowState;
use crate::types::RetryDecision;

/// Chooses the next recovery action from an observed state
#[derive(Debug, Clone)]
pub struct RetryResumeStrategy {
    max_node_retries: u32,
}

impl RetryResumeStrategy {
    pub fn new(max_node_retries: u32) -> Self {
        Self { max_node_retries }
    }

    pub fn max_node_retries(&self) -> u32 {
        self.max_node_retries
    }

    /// Decide what to do next.
    ///
    /// A completion flag without its artifacts means the state cannot be
    /// trusted and the pipeline restarts. Otherwise the first incomplete
    /// phase is retried node by node while retries remain, and resumed
    /// when nothing in it has failed.
    pub fn decide(&self, plan: &PhasePlan, state: &WorkflowState) -> RetryDecision {
        let mut inconsistent = Vec::new();
        for phase in plan.phases() {
            if !state.is_phase_complete(&phase.id) {
                continue;
            }
            for missing in phase.missing_artifacts(state) {
                inconsistent.push(format!("phase {} marked complete but {}", phase.id, missing));
            }
        }
        if !inconsistent.is_empty() {
            return RetryDecision::RestartPipeline {
                reason: "completed phases are missing their artifacts".to_string(),
                evidence: inconsistent,
            };
        }

        let Some(phase) = plan
            .phases()
            .iter()
            .find(|phase| !state.is_phase_complete(&phase.id))
        else {
            return RetryDecision::Complete {
                evidence: plan
                    .phases()
                    .iter()
                    .map(|phase| format!("phase {} complete", phase.id))
                    .collect(),
            };
        };

        let failed_blocking = phase.nodes.iter().filter(|node| node.blocking).find_map(|node| {
            let result = state.result(&node.id)?;
            let waived = state.skipped_analyzers.contains(&node.id);
            (!result.success && !waived).then_some((node, result))
        });

        if let Some((node, result)) = failed_blocking {
            let attempts = state.attempts(&node.id);
            let error = result
                .error
                .as_ref()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown error".to_string());
            let evidence = vec![
                format!("{} failed: {}", node.id, error),
                format!("{} attempt(s) so far, {} retries allowed", attempts, self.max_node_retries),
            ];

            // the first attempt is not a retry
            if attempts <= self.max_node_retries {
                return RetryDecision::RetryNode {
                    node_id: node.id.clone(),
                    phase_id: phase.id.clone(),
                    reason: format!("blocking node {} failed", node.id),
                    evidence,
                };
            }
            return RetryDecision::SkipNode {
                node_id: node.id.clone(),
                phase_id: phase.id.clone(),
                reason: format!("blocking node {} exhausted its retries", node.id),
                evidence,
            };
        }

        let evidence = plan
            .phases()
            .iter()
            .take_while(|earlier| earlier.id != phase.id)
            .map(|earlier| format!("phase {} complete", earlier.id))
            .collect();
        RetryDecision::ResumeFromPhase {
            phase_id: phase.id.clone(),
            reason: format!("phase {} has not completed", phase.id),
            evidence,
        }
    }
}
