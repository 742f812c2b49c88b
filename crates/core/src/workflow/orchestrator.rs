use super::executor::NodeExecutor;
use super::fanout::BoundedFanoutCoordinator;
use super::plan::{PhasePlan, PlanConfig};
use super::recovery::RetryResumeStrategy;
use super::scheduler::{ExecutionSettings, PhaseScheduler};
use crate::backend::{BackendChain, InputComposer};
use crate::config::{OrchestratorConfig, StoreBackend, StoreConfig};
use crate::context::{
    ExecutionContext, IsolationManager, IsolationStrategy, ResourceFactory, ResourceSlot,
};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::process;
use crate::progress::ProgressNotifier;
use crate::state::{StateUpdate, WorkflowState};
use crate::store::{
    InMemoryResultStore, RebindingStore, RedbStoreFactory, ResultStore, SharedStoreFactory,
};
use crate::types::{DocumentFingerprint, NodeId, PhaseId, RetryDecision, RunStatus};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;

type StoreFactory = Arc<dyn ResourceFactory<Resource = Arc<dyn ResultStore>>>;

/// One pipeline invocation
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub fingerprint: DocumentFingerprint,
    /// Persisted state of an earlier invocation; copied, never mutated
    pub prior_state: Option<WorkflowState>,
    pub plan: Arc<PhasePlan>,
    pub concurrency_limit: Option<usize>,
    pub node_timeout: Option<Duration>,
    pub deadline: Option<Duration>,
}

impl RunRequest {
    pub fn new(fingerprint: DocumentFingerprint, plan: Arc<PhasePlan>) -> Self {
        Self {
            fingerprint,
            prior_state: None,
            plan,
            concurrency_limit: None,
            node_timeout: None,
            deadline: None,
        }
    }

    pub fn with_prior_state(mut self, state: WorkflowState) -> Self {
        self.prior_state = Some(state);
        self
    }

    pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = Some(limit);
        self
    }

    pub fn with_node_timeout(mut self, timeout: Duration) -> Self {
        self.node_timeout = Some(timeout);
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Why a run could not finish
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalFailure {
    pub kind: String,
    pub message: String,
    pub phase: Option<PhaseId>,
}

/// Final result of a run; errors are folded in rather than raised
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded {
        state: WorkflowState,
    },
    Partial {
        state: WorkflowState,
        skipped: Vec<NodeId>,
        degraded: Vec<NodeId>,
        timed_out: bool,
    },
    Failed {
        failure: TerminalFailure,
        state: Option<WorkflowState>,
    },
}

impl RunOutcome {
    fn failed(error: OrchestratorError, phase: Option<PhaseId>, state: Option<WorkflowState>) -> Self {
        let state = state.map(|mut state| {
            state.freeze(RunStatus::Failed);
            state
        });
        RunOutcome::Failed {
            failure: TerminalFailure {
                kind: error.kind().to_string(),
                message: error.to_string(),
                phase,
            },
            state,
        }
    }

    pub fn state(&self) -> Option<&WorkflowState> {
        match self {
            Self::Succeeded { state } | Self::Partial { state, .. } => Some(state),
            Self::Failed { state, .. } => state.as_ref(),
        }
    }

    pub fn is_succeeded(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }
}

/// Serialized run handed to a dedicated worker process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessJob {
    pub fingerprint: DocumentFingerprint,
    pub prior_state: Option<WorkflowState>,
    pub plan: PlanConfig,
    pub concurrency_limit: Option<usize>,
    pub node_timeout_ms: Option<u64>,
    pub deadline_ms: Option<u64>,
}

impl ProcessJob {
    pub fn from_request(request: &RunRequest) -> OrchestratorResult<Self> {
        Ok(Self {
            fingerprint: request.fingerprint.clone(),
            prior_state: request.prior_state.clone(),
            plan: request.plan.to_config()?,
            concurrency_limit: request.concurrency_limit,
            node_timeout_ms: request.node_timeout.map(duration_ms),
            deadline_ms: request.deadline.map(duration_ms),
        })
    }

    pub fn into_request(self) -> OrchestratorResult<RunRequest> {
        Ok(RunRequest {
            fingerprint: self.fingerprint,
            prior_state: self.prior_state,
            plan: Arc::new(self.plan.build()?),
            concurrency_limit: self.concurrency_limit,
            node_timeout: self.node_timeout_ms.map(Duration::from_millis),
            deadline: self.deadline_ms.map(Duration::from_millis),
        })
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// How the phase/recovery loop ended
enum Drive {
    Complete,
    TimedOut,
    Exhausted(RetryDecision),
}

/// Drives a phase plan to completion with recovery and isolation
pub struct WorkflowOrchestrator {
    scheduler: PhaseScheduler,
    recovery: RetryResumeStrategy,
    isolation: Arc<IsolationManager>,
    store: Arc<ResourceSlot<Arc<dyn ResultStore>>>,
    config: OrchestratorConfig,
}

impl WorkflowOrchestrator {
    pub fn builder(backends: BackendChain) -> OrchestratorBuilder {
        OrchestratorBuilder {
            backends,
            composer: None,
            notifier: None,
            store_factory: None,
            config: OrchestratorConfig::default(),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn isolation(&self) -> &Arc<IsolationManager> {
        &self.isolation
    }

    /// Plan declared in the configuration file
    pub fn configured_plan(&self) -> OrchestratorResult<Arc<PhasePlan>> {
        let plan = self
            .config
            .plan
            .as_ref()
            .ok_or_else(|| OrchestratorError::Config("no plan configured".to_string()))?;
        Ok(Arc::new(plan.build()?))
    }

    /// Run a plan inside the given execution context
    #[tracing::instrument(
        skip(self, request, ctx),
        fields(fingerprint = %request.fingerprint, context_id = %ctx.context_id())
    )]
    pub async fn run(&self, request: RunRequest, ctx: &ExecutionContext) -> RunOutcome {
        let plan = request.plan.clone();
        let settings = self.settings_for(&request);

        let mut state = match self.seed(&request) {
            Ok(state) => state,
            Err(e) => return RunOutcome::failed(e, None, None),
        };

        let cancel = CancellationToken::new();
        let store = match RebindingStore::bind(self.store.clone(), ctx, cancel.clone()).await {
            Ok(store) => Arc::new(store),
            Err(e) => return RunOutcome::failed(e, None, Some(state)),
        };
        let _deadline = request
            .deadline
            .or_else(|| self.config.execution.deadline())
            .map(|deadline| deadline_timer(deadline, cancel.clone()));

        tracing::info!(
            "Starting run: {} phases, {} nodes, identity {}",
            plan.phases().len(),
            plan.node_count(),
            ctx.identity()
        );

        let driven = self
            .drive(&plan, &mut state, settings, store.clone(), &cancel)
            .await;
        self.store.end_context(ctx);

        if let Some(fatal) = store.take_fatal() {
            tracing::error!("Run stopped by resource fault: {}", fatal);
            let phase = first_incomplete(&plan, &state);
            return RunOutcome::failed(fatal, phase, Some(state));
        }

        match driven {
            Ok(Drive::Complete) => finish(state),
            Ok(Drive::TimedOut) => {
                let mut update = StateUpdate::new();
                update.note_error("run deadline exceeded");
                update.flag_risk("timed_out");
                if let Err(e) = state.merge(update) {
                    tracing::warn!("Failed to record deadline expiry: {}", e);
                }
                state.freeze(RunStatus::TimedOut);
                tracing::warn!("Run timed out");
                RunOutcome::Partial {
                    skipped: state.outstanding_skipped(),
                    degraded: state.degraded_analyzers.clone(),
                    timed_out: true,
                    state,
                }
            }
            Ok(Drive::Exhausted(decision)) => {
                tracing::error!("Recovery did not converge: {:?}", decision);
                let (error, phase) = exhausted(decision, &state);
                RunOutcome::failed(error, phase, Some(state))
            }
            Err(e) => {
                tracing::error!("Run failed: {}", e);
                let phase = first_incomplete(&plan, &state);
                RunOutcome::failed(e, phase, Some(state))
            }
        }
    }

    /// Run under an explicit isolation strategy
    pub async fn run_isolated(
        self: &Arc<Self>,
        strategy: IsolationStrategy,
        request: RunRequest,
    ) -> RunOutcome {
        if strategy == IsolationStrategy::DedicatedProcess {
            return self.run_in_process(request).await;
        }

        let orchestrator = self.clone();
        self.isolation
            .with_isolated_context(strategy, move |ctx| async move {
                Ok(orchestrator.run(request, &ctx).await)
            })
            .await
            .unwrap_or_else(|e| RunOutcome::failed(e, None, None))
    }

    /// Run under the configured isolation strategy
    pub async fn submit(self: &Arc<Self>, request: RunRequest) -> RunOutcome {
        self.run_isolated(self.config.isolation.strategy, request)
            .await
    }

    /// Entry point for synchronous workers that own no runtime
    pub fn run_blocking(self: &Arc<Self>, request: RunRequest) -> RunOutcome {
        let strategy = match self.config.isolation.strategy {
            IsolationStrategy::DedicatedProcess => IsolationStrategy::DedicatedProcess,
            _ => IsolationStrategy::DedicatedThread,
        };
        if strategy == IsolationStrategy::DedicatedProcess {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    return RunOutcome::failed(
                        OrchestratorError::Isolation(format!("failed to build runtime: {}", e)),
                        None,
                        None,
                    )
                }
            };
            return runtime.block_on(self.run_in_process(request));
        }

        let orchestrator = self.clone();
        self.isolation
            .run_blocking(strategy, move |ctx| async move {
                Ok(orchestrator.run(request, &ctx).await)
            })
            .unwrap_or_else(|e| RunOutcome::failed(e, None, None))
    }

    /// Hand the run to a fresh worker process
    pub async fn run_in_process(&self, request: RunRequest) -> RunOutcome {
        let result = async {
            let runner = self.isolation.process_runner()?;
            let job = ProcessJob::from_request(&request)?;
            runner.run::<ProcessJob, RunOutcome>(&job).await
        }
        .await;

        result.unwrap_or_else(|e| {
            tracing::error!("Worker process run failed: {}", e);
            RunOutcome::failed(e, None, request.prior_state)
        })
    }

    fn settings_for(&self, request: &RunRequest) -> ExecutionSettings {
        ExecutionSettings {
            concurrency_limit: request
                .concurrency_limit
                .unwrap_or(self.config.execution.concurrency_limit)
                .max(1),
            node_timeout: request
                .node_timeout
                .unwrap_or_else(|| self.config.execution.node_timeout()),
        }
    }

    fn seed(&self, request: &RunRequest) -> OrchestratorResult<WorkflowState> {
        let Some(prior) = &request.prior_state else {
            return Ok(WorkflowState::new(request.fingerprint.clone()));
        };

        match WorkflowState::seeded_from(request.fingerprint.clone(), prior) {
            Ok(state) => Ok(state),
            Err(e) if !e.is_fatal() => {
                tracing::warn!("Discarding prior state: {}", e);
                Ok(WorkflowState::new(request.fingerprint.clone()))
            }
            Err(e) => Err(e),
        }
    }

    async fn drive(
        &self,
        plan: &PhasePlan,
        state: &mut WorkflowState,
        settings: ExecutionSettings,
        store: Arc<dyn ResultStore>,
        cancel: &CancellationToken,
    ) -> OrchestratorResult<Drive> {
        // a seeded state may already be untrustworthy
        if let RetryDecision::RestartPipeline { reason, evidence } =
            self.recovery.decide(plan, state)
        {
            restart(state, &reason, &evidence)?;
        }

        // phases entered by a pass; a stalled phase is only re-entered through recovery
        let mut attempted = HashSet::new();
        let mut rounds = 0;
        loop {
            self.run_pass(plan, state, settings, &store, cancel, &mut attempted)
                .await?;
            if cancel.is_cancelled() {
                return Ok(Drive::TimedOut);
            }

            let decision = self.recovery.decide(plan, state);
            if let RetryDecision::Complete { .. } = decision {
                return Ok(Drive::Complete);
            }
            if rounds >= self.config.execution.max_recovery_rounds {
                return Ok(Drive::Exhausted(decision));
            }
            rounds += 1;

            tracing::info!("Recovery round {}: {:?}", rounds, decision);
            self.apply(plan, decision, state, settings, &store, cancel, &mut attempted)
                .await?;
            if cancel.is_cancelled() {
                return Ok(Drive::TimedOut);
            }
        }
    }

    /// Run phases in order, skipping complete ones, up to the first that does not complete
    async fn run_pass(
        &self,
        plan: &PhasePlan,
        state: &mut WorkflowState,
        settings: ExecutionSettings,
        store: &Arc<dyn ResultStore>,
        cancel: &CancellationToken,
        attempted: &mut HashSet<PhaseId>,
    ) -> OrchestratorResult<()> {
        for phase in plan.phases() {
            if state.is_phase_complete(&phase.id) {
                continue;
            }
            if cancel.is_cancelled() || !attempted.insert(phase.id.clone()) {
                break;
            }

            let report = self
                .scheduler
                .run_phase(phase, state, settings, store.clone(), cancel)
                .await?;
            if !report.complete {
                tracing::warn!("Phase {} did not complete, stopping pass", phase.id);
                break;
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn apply(
        &self,
        plan: &PhasePlan,
        decision: RetryDecision,
        state: &mut WorkflowState,
        settings: ExecutionSettings,
        store: &Arc<dyn ResultStore>,
        cancel: &CancellationToken,
        attempted: &mut HashSet<PhaseId>,
    ) -> OrchestratorResult<()> {
        match decision {
            RetryDecision::RetryNode {
                node_id, phase_id, ..
            } => {
                let phase = plan.phase(&phase_id).ok_or_else(|| {
                    OrchestratorError::InvalidPlan(format!("unknown phase {}", phase_id))
                })?;
                self.scheduler
                    .rerun_nodes(phase, &[node_id], state, settings, store.clone(), cancel)
                    .await?;
            }
            RetryDecision::SkipNode {
                node_id,
                phase_id,
                reason,
                ..
            } => {
                let phase = plan.phase(&phase_id).ok_or_else(|| {
                    OrchestratorError::InvalidPlan(format!("unknown phase {}", phase_id))
                })?;
                self.scheduler.waive_node(phase, &node_id, &reason, state)?;
            }
            RetryDecision::RestartPipeline { reason, evidence } => {
                restart(state, &reason, &evidence)?;
                attempted.clear();
            }
            RetryDecision::ResumeFromPhase { phase_id, .. } => {
                attempted.remove(&phase_id);
            }
            RetryDecision::Complete { .. } => {}
        }
        Ok(())
    }
}

/// Replace the state with a fresh one, keeping attempt counts so retries stay bounded
fn restart(state: &mut WorkflowState, reason: &str, evidence: &[String]) -> OrchestratorResult<()> {
    tracing::warn!("Restarting pipeline: {} ({})", reason, evidence.join("; "));

    let mut fresh = WorkflowState::new(state.fingerprint.clone());
    let mut update = StateUpdate::new();
    update.attempts = state.attempts.clone();
    update.note_error(format!("pipeline restarted: {}", reason));
    fresh.merge(update)?;

    *state = fresh;
    Ok(())
}

fn finish(mut state: WorkflowState) -> RunOutcome {
    let skipped = state.outstanding_skipped();
    let degraded = state.degraded_analyzers.clone();

    if skipped.is_empty() && degraded.is_empty() {
        state.freeze(RunStatus::Completed);
        tracing::info!("Run completed");
        RunOutcome::Succeeded { state }
    } else {
        state.freeze(RunStatus::Partial);
        tracing::info!(
            "Run completed partially: {} skipped, {} degraded",
            skipped.len(),
            degraded.len()
        );
        RunOutcome::Partial {
            state,
            skipped,
            degraded,
            timed_out: false,
        }
    }
}

fn exhausted(decision: RetryDecision, state: &WorkflowState) -> (OrchestratorError, Option<PhaseId>) {
    match decision {
        RetryDecision::RetryNode {
            node_id, phase_id, ..
        }
        | RetryDecision::SkipNode {
            node_id, phase_id, ..
        } => {
            let message = state
                .result(&node_id)
                .and_then(|result| result.error.as_ref())
                .map(|error| error.to_string())
                .unwrap_or_else(|| "no result".to_string());
            (
                OrchestratorError::BlockingNodeFailed { node_id, message },
                Some(phase_id),
            )
        }
        RetryDecision::ResumeFromPhase {
            phase_id, reason, ..
        } => (
            OrchestratorError::InconsistentState(format!("recovery rounds exhausted: {}", reason)),
            Some(phase_id),
        ),
        RetryDecision::RestartPipeline { reason, evidence } => (
            OrchestratorError::InconsistentState(format!(
                "recovery rounds exhausted: {} ({})",
                reason,
                evidence.join("; ")
            )),
            None,
        ),
        RetryDecision::Complete { .. } => (
            OrchestratorError::InconsistentState("recovery ended on completion".to_string()),
            None,
        ),
    }
}

fn first_incomplete(plan: &PhasePlan, state: &WorkflowState) -> Option<PhaseId> {
    plan.phases()
        .iter()
        .find(|phase| !state.is_phase_complete(&phase.id))
        .map(|phase| phase.id.clone())
}

fn deadline_timer(deadline: Duration, cancel: CancellationToken) -> AbortOnDropHandle<()> {
    AbortOnDropHandle::new(tokio::spawn(async move {
        tokio::time::sleep(deadline).await;
        tracing::warn!("Run deadline of {:?} exceeded, cancelling in-flight nodes", deadline);
        cancel.cancel();
    }))
}

/// Worker-process side: read a [`ProcessJob`] from stdin, run it, reply on stdout
pub fn serve_process_job(orchestrator: Arc<WorkflowOrchestrator>) -> anyhow::Result<()> {
    process::serve_stdio(move |job: ProcessJob| async move {
        let ctx = ExecutionContext::current();
        match job.into_request() {
            Ok(request) => orchestrator.run(request, &ctx).await,
            Err(e) => RunOutcome::failed(e, None, None),
        }
    })
}

/// Builder for [`WorkflowOrchestrator`]
pub struct OrchestratorBuilder {
    backends: BackendChain,
    composer: Option<Arc<dyn InputComposer>>,
    notifier: Option<Arc<dyn ProgressNotifier>>,
    store_factory: Option<StoreFactory>,
    config: OrchestratorConfig,
}

impl OrchestratorBuilder {
    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn composer(mut self, composer: Arc<dyn InputComposer>) -> Self {
        self.composer = Some(composer);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn ProgressNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Use one shared store on every runtime
    pub fn store(mut self, store: Arc<dyn ResultStore>) -> Self {
        self.store_factory = Some(Arc::new(SharedStoreFactory::new(store)));
        self
    }

    /// Create the store per runtime identity
    pub fn store_factory(mut self, factory: StoreFactory) -> Self {
        self.store_factory = Some(factory);
        self
    }

    pub fn build(self) -> WorkflowOrchestrator {
        let mut executor = NodeExecutor::new(self.backends);
        if let Some(composer) = self.composer {
            executor = executor.with_composer(composer);
        }
        if let Some(notifier) = self.notifier {
            executor = executor.with_notifier(notifier);
        }

        let factory = self
            .store_factory
            .unwrap_or_else(|| default_store_factory(&self.config.store));
        let store = Arc::new(ResourceSlot::new(
            factory,
            self.config.isolation.max_affinity_faults,
        ));
        let isolation = Arc::new(IsolationManager::new(self.config.isolation.clone()));
        isolation.register(store.clone());

        WorkflowOrchestrator {
            scheduler: PhaseScheduler::new(BoundedFanoutCoordinator::new(Arc::new(executor))),
            recovery: RetryResumeStrategy::new(self.config.execution.max_node_retries),
            isolation,
            store,
            config: self.config,
        }
    }
}

fn default_store_factory(config: &StoreConfig) -> StoreFactory {
    match config.backend {
        StoreBackend::Memory => Arc::new(SharedStoreFactory::new(Arc::new(
            InMemoryResultStore::new(),
        ))),
        StoreBackend::Redb => Arc::new(RedbStoreFactory::new(config.path.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendRoute;
    use crate::config::ProcessConfig;
    use crate::node::NodeSpec;
    use crate::store::AffinityFault;
    use crate::types::{NodeOutcome, NodeResult};
    use crate::workflow::executor::tests::ScriptedBackend;
    use crate::workflow::plan::{ArtifactRequirement, PhaseDefinition};
    use serde_json::json;
    use std::sync::atomic::Ordering;

    fn fingerprint() -> DocumentFingerprint {
        DocumentFingerprint::from_bytes(b"supply agreement v3")
    }

    fn orchestrator(backend: Arc<ScriptedBackend>, config: OrchestratorConfig) -> WorkflowOrchestrator {
        WorkflowOrchestrator::builder(
            BackendChain::new().with_route(BackendRoute::new("primary", backend)),
        )
        .config(config)
        .build()
    }

    fn three_phase_plan() -> Arc<PhasePlan> {
        Arc::new(
            PhasePlan::new(vec![
                PhaseDefinition::new("extract")
                    .node(NodeSpec::new("a").blocking(true))
                    .node(NodeSpec::new("b"))
                    .node(NodeSpec::new("c").blocking(true))
                    .produces(ArtifactRequirement::node("a")),
                PhaseDefinition::new("analyse")
                    .after("extract")
                    .requires(ArtifactRequirement::field("a", "value"))
                    .node(NodeSpec::new("d").blocking(true))
                    .produces(ArtifactRequirement::node("d")),
                PhaseDefinition::new("report")
                    .after("analyse")
                    .node(NodeSpec::new("e").blocking(true)),
            ])
            .unwrap(),
        )
    }

    fn two_phase_plan() -> Arc<PhasePlan> {
        Arc::new(
            PhasePlan::new(vec![
                PhaseDefinition::new("extract")
                    .node(NodeSpec::new("a").blocking(true))
                    .produces(ArtifactRequirement::node("a")),
                PhaseDefinition::new("analyse")
                    .after("extract")
                    .node(NodeSpec::new("d").blocking(true)),
            ])
            .unwrap(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_phases_with_timed_out_analyzer() {
        let backend = Arc::new(ScriptedBackend::new().delay("b", Duration::from_secs(3600)));
        let orchestrator = orchestrator(backend.clone(), OrchestratorConfig::default());
        let request = RunRequest::new(fingerprint(), three_phase_plan())
            .with_concurrency_limit(2)
            .with_node_timeout(Duration::from_secs(5));

        let outcome = orchestrator
            .run(request, &ExecutionContext::current())
            .await;

        let RunOutcome::Partial {
            state,
            skipped,
            degraded,
            timed_out,
        } = outcome
        else {
            panic!("expected a partial outcome, got {:?}", outcome);
        };

        assert_eq!(skipped, vec![NodeId::new("b")]);
        assert!(degraded.is_empty());
        assert!(!timed_out);
        for phase in ["extract", "analyse", "report"] {
            assert!(state.is_phase_complete(&PhaseId::new(phase)), "{} incomplete", phase);
        }
        for node in ["a", "c", "d", "e"] {
            assert!(state.result(&NodeId::new(node)).unwrap().success);
        }
        let b = state.result(&NodeId::new("b")).unwrap();
        assert_eq!(b.error_kind(), Some(crate::types::ErrorKind::Timeout));
        assert!(state.processing_errors.iter().any(|e| e.starts_with("b: timeout")));
        assert!(backend.peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(state.status(), RunStatus::Partial);
        assert!(state.is_frozen());
    }

    #[tokio::test]
    async fn test_second_run_is_served_from_store() {
        let store: Arc<dyn ResultStore> = Arc::new(InMemoryResultStore::new());

        let first_backend = Arc::new(ScriptedBackend::new());
        let first = WorkflowOrchestrator::builder(
            BackendChain::new().with_route(BackendRoute::new("primary", first_backend.clone())),
        )
        .store(store.clone())
        .build();
        let outcome = first
            .run(RunRequest::new(fingerprint(), two_phase_plan()), &ExecutionContext::current())
            .await;
        assert!(outcome.is_succeeded());
        assert_eq!(first_backend.calls(), 2);

        let second_backend = Arc::new(ScriptedBackend::new());
        let second = WorkflowOrchestrator::builder(
            BackendChain::new().with_route(BackendRoute::new("primary", second_backend.clone())),
        )
        .store(store)
        .build();
        let outcome = second
            .run(RunRequest::new(fingerprint(), two_phase_plan()), &ExecutionContext::current())
            .await;

        assert!(outcome.is_succeeded());
        assert_eq!(second_backend.calls(), 0);
        let state = outcome.state().unwrap();
        assert!(state
            .results
            .values()
            .all(|result| result.outcome == NodeOutcome::Cached));
    }

    #[tokio::test]
    async fn test_valid_prior_state_resumes() {
        let backend = Arc::new(ScriptedBackend::new());
        let orchestrator = orchestrator(backend.clone(), OrchestratorConfig::default());

        let mut prior = WorkflowState::new(fingerprint());
        let mut update = StateUpdate::new();
        update.record(
            NodeResult::succeeded(NodeId::new("a"), json!({"value": "parties"}), 1.0),
            true,
            1,
        );
        prior.merge(update).unwrap();
        prior.set_phase_complete(PhaseId::new("extract"), true);

        let outcome = orchestrator
            .run(
                RunRequest::new(fingerprint(), two_phase_plan()).with_prior_state(prior.clone()),
                &ExecutionContext::current(),
            )
            .await;

        assert!(outcome.is_succeeded());
        // only the second phase ran
        assert_eq!(backend.calls(), 1);
        assert!(!prior.is_frozen());
    }

    #[tokio::test]
    async fn test_inconsistent_prior_state_restarts() {
        let backend = Arc::new(ScriptedBackend::new());
        let orchestrator = orchestrator(backend.clone(), OrchestratorConfig::default());

        let mut prior = WorkflowState::new(fingerprint());
        prior.set_phase_complete(PhaseId::new("extract"), true);

        let outcome = orchestrator
            .run(
                RunRequest::new(fingerprint(), two_phase_plan()).with_prior_state(prior),
                &ExecutionContext::current(),
            )
            .await;

        assert!(outcome.is_succeeded());
        assert_eq!(backend.calls(), 2);
        let state = outcome.state().unwrap();
        assert!(state
            .processing_errors
            .iter()
            .any(|e| e.starts_with("pipeline restarted")));
    }

    #[tokio::test]
    async fn test_blocking_failure_is_retried_then_waived() {
        let backend = Arc::new(ScriptedBackend::new().fail("a", "backend down"));
        let mut config = OrchestratorConfig::default();
        config.execution.max_node_retries = 1;
        let orchestrator = orchestrator(backend.clone(), config);

        let outcome = orchestrator
            .run(
                RunRequest::new(fingerprint(), two_phase_plan()),
                &ExecutionContext::current(),
            )
            .await;

        let RunOutcome::Partial { skipped, state, .. } = outcome else {
            panic!("expected a partial outcome");
        };
        assert_eq!(skipped, vec![NodeId::new("a")]);
        assert_eq!(state.attempts(&NodeId::new("a")), 2);
        // a twice, d once
        assert_eq!(backend.calls(), 3);
    }

    #[tokio::test]
    async fn test_recovery_budget_exhausted() {
        let backend = Arc::new(ScriptedBackend::new().fail("a", "backend down"));
        let mut config = OrchestratorConfig::default();
        config.execution.max_node_retries = 5;
        config.execution.max_recovery_rounds = 1;
        let orchestrator = orchestrator(backend, config);

        let outcome = orchestrator
            .run(
                RunRequest::new(fingerprint(), two_phase_plan()),
                &ExecutionContext::current(),
            )
            .await;

        let RunOutcome::Failed { failure, state } = outcome else {
            panic!("expected a failed outcome");
        };
        assert_eq!(failure.kind, "blocking_node_failed");
        assert_eq!(failure.phase, Some(PhaseId::new("extract")));
        assert_eq!(state.unwrap().status(), RunStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_marks_state_timed_out() {
        let backend = Arc::new(ScriptedBackend::new().delay("a", Duration::from_secs(3600)));
        let orchestrator = orchestrator(backend, OrchestratorConfig::default());
        let request = RunRequest::new(fingerprint(), two_phase_plan())
            .with_node_timeout(Duration::from_secs(7200))
            .with_deadline(Duration::from_secs(10));

        let outcome = orchestrator
            .run(request, &ExecutionContext::current())
            .await;

        let RunOutcome::Partial {
            state, timed_out, ..
        } = outcome
        else {
            panic!("expected a partial outcome");
        };
        assert!(timed_out);
        assert_eq!(state.status(), RunStatus::TimedOut);
        assert_eq!(
            state.result(&NodeId::new("a")).unwrap().error_kind(),
            Some(crate::types::ErrorKind::Cancelled)
        );
        assert!(!state.is_phase_complete(&PhaseId::new("analyse")));
    }

    #[tokio::test]
    async fn test_mismatched_prior_state_is_discarded() {
        let backend = Arc::new(ScriptedBackend::new());
        let orchestrator = orchestrator(backend.clone(), OrchestratorConfig::default());
        let foreign = WorkflowState::new(DocumentFingerprint::from_bytes(b"another document"));

        let outcome = orchestrator
            .run(
                RunRequest::new(fingerprint(), two_phase_plan()).with_prior_state(foreign),
                &ExecutionContext::current(),
            )
            .await;

        assert!(outcome.is_succeeded());
        assert_eq!(outcome.state().unwrap().fingerprint, fingerprint());
    }

    #[tokio::test]
    async fn test_run_isolated_on_dedicated_thread() {
        let backend = Arc::new(ScriptedBackend::new());
        let orchestrator = Arc::new(orchestrator(backend.clone(), OrchestratorConfig::default()));

        let outcome = orchestrator
            .run_isolated(
                IsolationStrategy::DedicatedThread,
                RunRequest::new(fingerprint(), two_phase_plan()),
            )
            .await;
        assert!(outcome.is_succeeded());

        let outcome = orchestrator
            .run_isolated(
                IsolationStrategy::SameContext,
                RunRequest::new(fingerprint(), two_phase_plan()),
            )
            .await;
        assert!(outcome.is_succeeded());
        // the in-memory store is shared across runtimes
        assert_eq!(backend.calls(), 2);
    }

    #[test]
    fn test_run_blocking_from_sync_worker() {
        let backend = Arc::new(ScriptedBackend::new());
        let orchestrator = Arc::new(orchestrator(backend, OrchestratorConfig::default()));

        let outcome = orchestrator.run_blocking(RunRequest::new(fingerprint(), two_phase_plan()));
        assert!(outcome.is_succeeded());
    }

    #[tokio::test]
    async fn test_process_isolation_requires_worker() {
        let orchestrator = Arc::new(orchestrator(
            Arc::new(ScriptedBackend::new()),
            OrchestratorConfig::default(),
        ));

        let outcome = orchestrator
            .run_isolated(
                IsolationStrategy::DedicatedProcess,
                RunRequest::new(fingerprint(), two_phase_plan()),
            )
            .await;

        let RunOutcome::Failed { failure, .. } = outcome else {
            panic!("expected a failed outcome");
        };
        assert_eq!(failure.kind, "incompatible_substrate");
    }

    #[tokio::test]
    async fn test_process_isolation_decodes_worker_reply() {
        let mut state = WorkflowState::new(fingerprint());
        state.freeze(RunStatus::Completed);
        let reply = serde_json::to_string(&RunOutcome::Succeeded { state }).unwrap();

        let mut config = OrchestratorConfig::default();
        config.isolation.process = Some(ProcessConfig {
            program: "sh".to_string(),
            args: vec![
                "-c".to_string(),
                "cat >/dev/null; printf '%s' \"$0\"".to_string(),
                reply,
            ],
            timeout_secs: 10,
        });
        let orchestrator = Arc::new(orchestrator(Arc::new(ScriptedBackend::new()), config));

        let outcome = orchestrator
            .run_isolated(
                IsolationStrategy::DedicatedProcess,
                RunRequest::new(fingerprint(), two_phase_plan()),
            )
            .await;

        assert!(outcome.is_succeeded());
        assert_eq!(outcome.state().unwrap().status(), RunStatus::Completed);
    }

    #[test]
    fn test_process_job_round_trip() {
        let request = RunRequest::new(fingerprint(), three_phase_plan())
            .with_concurrency_limit(3)
            .with_node_timeout(Duration::from_millis(1500));

        let job = ProcessJob::from_request(&request).unwrap();
        let encoded = serde_json::to_string(&job).unwrap();
        let decoded: ProcessJob = serde_json::from_str(&encoded).unwrap();
        let restored = decoded.into_request().unwrap();

        assert_eq!(restored.fingerprint, request.fingerprint);
        assert_eq!(restored.concurrency_limit, Some(3));
        assert_eq!(restored.node_timeout, Some(Duration::from_millis(1500)));
        assert_eq!(restored.plan.node_count(), 5);
    }

    #[test]
    fn test_configured_plan() {
        let mut config = OrchestratorConfig::default();
        config.plan = Some(three_phase_plan().to_config().unwrap());
        let orchestrator = orchestrator(Arc::new(ScriptedBackend::new()), config);

        let plan = orchestrator.configured_plan().unwrap();
        assert_eq!(plan.phases().len(), 3);

        let bare = super::WorkflowOrchestrator::builder(BackendChain::new()).build();
        assert!(matches!(
            bare.configured_plan(),
            Err(OrchestratorError::Config(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_overlapping_dedicated_runs_share_redb_store() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let mut config = OrchestratorConfig::default();
        config.store.backend = StoreBackend::Redb;
        config.store.path = temp_dir.path().join("results.redb");
        let backend = Arc::new(ScriptedBackend::new().delay("a", Duration::from_millis(300)));
        let orchestrator = Arc::new(orchestrator(backend.clone(), config));

        let first = RunRequest::new(DocumentFingerprint::from_bytes(b"lease one"), two_phase_plan());
        let second = RunRequest::new(DocumentFingerprint::from_bytes(b"lease two"), two_phase_plan());
        let (first, second) = tokio::join!(
            orchestrator.run_isolated(IsolationStrategy::DedicatedThread, first),
            orchestrator.run_isolated(IsolationStrategy::DedicatedThread, second),
        );

        assert!(first.is_succeeded(), "first run: {:?}", first);
        assert!(second.is_succeeded(), "second run: {:?}", second);
        assert_eq!(backend.calls(), 4);
    }

    struct FaultyStore {
        inner: InMemoryResultStore,
        faults_left: std::sync::atomic::AtomicUsize,
    }

    impl FaultyStore {
        fn new(faults: usize) -> Self {
            Self {
                inner: InMemoryResultStore::new(),
                faults_left: std::sync::atomic::AtomicUsize::new(faults),
            }
        }
    }

    #[async_trait::async_trait]
    impl ResultStore for FaultyStore {
        async fn lookup(
            &self,
            fingerprint: &crate::types::NodeFingerprint,
        ) -> anyhow::Result<Option<NodeResult>> {
            let faulted = self
                .faults_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if faulted {
                return Err(AffinityFault("connection pool attached to another loop".into()).into());
            }
            self.inner.lookup(fingerprint).await
        }

        async fn persist(
            &self,
            fingerprint: &crate::types::NodeFingerprint,
            result: &NodeResult,
        ) -> anyhow::Result<()> {
            self.inner.persist(fingerprint, result).await
        }
    }

    fn faulty_orchestrator(backend: Arc<ScriptedBackend>, store: Arc<FaultyStore>) -> WorkflowOrchestrator {
        WorkflowOrchestrator::builder(
            BackendChain::new().with_route(BackendRoute::new("primary", backend)),
        )
        .store(store)
        .build()
    }

    #[tokio::test]
    async fn test_single_store_fault_is_rebound() {
        let backend = Arc::new(ScriptedBackend::new());
        let store = Arc::new(FaultyStore::new(1));
        let orchestrator = faulty_orchestrator(backend.clone(), store.clone());

        let outcome = orchestrator
            .run(RunRequest::new(fingerprint(), two_phase_plan()), &ExecutionContext::current())
            .await;

        assert!(outcome.is_succeeded(), "{:?}", outcome);
        assert_eq!(store.faults_left.load(Ordering::SeqCst), 0);
        assert_eq!(backend.calls(), 2);
        // both lookups were answered by the store after the rebind
        assert_eq!(store.inner.lookups(), 2);
    }

    #[tokio::test]
    async fn test_recurring_store_fault_fails_run() {
        let backend = Arc::new(ScriptedBackend::new());
        let store = Arc::new(FaultyStore::new(usize::MAX));
        let orchestrator = faulty_orchestrator(backend, store);

        let outcome = orchestrator
            .run(RunRequest::new(fingerprint(), two_phase_plan()), &ExecutionContext::current())
            .await;

        let RunOutcome::Failed { failure, state } = outcome else {
            panic!("expected a failed outcome");
        };
        assert_eq!(failure.kind, "resource_affinity");
        assert_eq!(state.unwrap().status(), RunStatus::Failed);
    }
}
