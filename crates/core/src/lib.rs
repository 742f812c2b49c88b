// Core of tessera: a phased, concurrent analysis orchestration engine

pub mod backend;
pub mod config;
pub mod context;
pub mod error;
pub mod node;
pub mod process;
pub mod progress;
pub mod state;
pub mod store;
pub mod telemetry;
pub mod types;
pub mod validation;
pub mod workflow;

pub use backend::{
    AnalysisBackend, BackendChain, BackendError, BackendRoute, InputComposer, RawResult,
};
pub use config::OrchestratorConfig;
pub use context::{ExecutionContext, IsolationManager, IsolationStrategy, RuntimeIdentity};
pub use error::{OrchestratorError, OrchestratorResult};
pub use node::{NodeSpec, QualityPolicy};
pub use state::{StateUpdate, WorkflowState};
pub use store::{AffinityFault, InMemoryResultStore, RedbResultStore, ResultStore};
pub use types::*;
pub use workflow::{PhaseDefinition, PhasePlan, RunOutcome, RunRequest, WorkflowOrchestrator};
