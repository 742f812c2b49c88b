//! Phase planning, node execution and the orchestrator that drives them.

pub mod executor;
pub mod fanout;
pub mod orchestrator;
pub mod plan;
pub mod recovery;
pub mod scheduler;

pub use executor::NodeExecutor;
pub use fanout::{BoundedFanoutCoordinator, FanoutReport};
pub use orchestrator::{
    serve_process_job, OrchestratorBuilder, ProcessJob, RunOutcome, RunRequest, TerminalFailure,
    WorkflowOrchestrator,
};
pub use plan::{
    ArtifactPredicate, ArtifactRequirement, PhaseConfig, PhaseDefinition, PhasePlan, PlanConfig,
};
pub use recovery::RetryResumeStrategy;
pub use scheduler::{ExecutionSettings, PhaseReport, PhaseScheduler};
