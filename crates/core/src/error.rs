//! Error types for the orchestration engine.

use crate::types::{NodeId, PhaseId};

/// Result type for orchestrator operations.
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Errors surfaced by the orchestrator and its isolation layer.
///
/// Node-level failures (parse, validation, backend, timeout) never show up
/// here; they become failed [`NodeResult`](crate::types::NodeResult)s.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// The phase plan is malformed.
    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    /// A phase was started before its predecessor completed.
    #[error("Phase {phase} cannot start: predecessor {predecessor} is not complete")]
    PhaseOrder { phase: PhaseId, predecessor: PhaseId },

    /// A merge was attempted on a frozen state.
    #[error("Workflow state is frozen")]
    StateFrozen,

    /// A completion marker exists without the artifact it vouches for.
    #[error("Inconsistent state: {0}")]
    InconsistentState(String),

    /// A pooled resource kept failing on the current runtime.
    #[error("Resource {resource} is bound to the wrong runtime: {message}")]
    ResourceAffinity { resource: String, message: String },

    /// The requested isolation strategy cannot run here.
    #[error("Incompatible execution substrate: {0}")]
    IncompatibleSubstrate(String),

    /// The isolated worker (thread or process) failed.
    #[error("Isolation failure: {0}")]
    Isolation(String),

    /// A blocking node failed and recovery could not make progress.
    #[error("Blocking node {node_id} failed: {message}")]
    BlockingNodeFailed { node_id: NodeId, message: String },

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl OrchestratorError {
    /// Stable machine-readable name of the variant.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidPlan(_) => "invalid_plan",
            Self::PhaseOrder { .. } => "phase_order",
            Self::StateFrozen => "state_frozen",
            Self::InconsistentState(_) => "inconsistent_state",
            Self::ResourceAffinity { .. } => "resource_affinity",
            Self::IncompatibleSubstrate(_) => "incompatible_substrate",
            Self::Isolation(_) => "isolation",
            Self::BlockingNodeFailed { .. } => "blocking_node_failed",
            Self::Config(_) => "config",
            Self::Json(_) => "json",
        }
    }

    /// Whether the run must stop instead of attempting recovery.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::InconsistentState(_) | Self::BlockingNodeFailed { .. }
        )
    }
}
