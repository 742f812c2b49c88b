//! Execution contexts and runtime isolation.
//!
//! Pooled resources (database handles, HTTP pools) are only valid on the
//! runtime that created them. When the orchestrator is driven from a foreign
//! synchronous worker, every call may land on a different runtime. An
//! [`ExecutionContext`] names the runtime a run is executing on, and a
//! [`ResourceSlot`] closes and lazily recreates its resource whenever the
//! context's identity differs from the one the resource was created under.

use crate::config::IsolationConfig;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::process::ProcessRunner;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

thread_local! {
    static DEDICATED_RUNTIME: Cell<Option<Uuid>> = const { Cell::new(None) };
}

fn mark_thread(identity: Option<Uuid>) {
    DEDICATED_RUNTIME.with(|cell| cell.set(identity));
}

/// Identity of the concurrency substrate a piece of code runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeIdentity {
    /// A runtime built by the isolation manager
    Dedicated(Uuid),
    /// A caller-owned tokio runtime, observed from this thread
    Foreign(std::thread::ThreadId),
    /// No async runtime is available on this thread
    Detached(std::thread::ThreadId),
}

impl RuntimeIdentity {
    /// Detect the identity of the calling thread
    pub fn detect() -> Self {
        if let Some(id) = DEDICATED_RUNTIME.with(|cell| cell.get()) {
            return Self::Dedicated(id);
        }

        let thread = std::thread::current().id();
        match tokio::runtime::Handle::try_current() {
            Ok(_) => Self::Foreign(thread),
            Err(_) => Self::Detached(thread),
        }
    }

    pub fn has_runtime(&self) -> bool {
        !matches!(self, Self::Detached(_))
    }
}

impl std::fmt::Display for RuntimeIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dedicated(id) => write!(f, "dedicated:{}", id),
            Self::Foreign(thread) => write!(f, "foreign:{:?}", thread),
            Self::Detached(thread) => write!(f, "detached:{:?}", thread),
        }
    }
}

/// How strongly a run is isolated from its caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationStrategy {
    /// Same context when a runtime is current, dedicated thread otherwise
    #[default]
    Auto,
    SameContext,
    DedicatedThread,
    DedicatedProcess,
}

/// The substrate one pipeline run executes on.
///
/// Immutable once created; it is passed by reference into every call that
/// touches pooled resources.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    context_id: Uuid,
    identity: RuntimeIdentity,
    created_new_runtime: bool,
    strategy: IsolationStrategy,
    created_at: DateTime<Utc>,
}

impl ExecutionContext {
    /// Context for the calling thread's own runtime
    pub fn current() -> Self {
        Self {
            context_id: Uuid::new_v4(),
            identity: RuntimeIdentity::detect(),
            created_new_runtime: false,
            strategy: IsolationStrategy::SameContext,
            created_at: Utc::now(),
        }
    }

    fn dedicated(runtime_id: Uuid) -> Self {
        Self {
            context_id: Uuid::new_v4(),
            identity: RuntimeIdentity::Dedicated(runtime_id),
            created_new_runtime: true,
            strategy: IsolationStrategy::DedicatedThread,
            created_at: Utc::now(),
        }
    }

    pub fn context_id(&self) -> Uuid {
        self.context_id
    }

    pub fn identity(&self) -> RuntimeIdentity {
        self.identity
    }

    pub fn created_new_runtime(&self) -> bool {
        self.created_new_runtime
    }

    pub fn strategy(&self) -> IsolationStrategy {
        self.strategy
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// Creates and closes one kind of pooled resource
#[async_trait::async_trait]
pub trait ResourceFactory: Send + Sync {
    type Resource: Clone + Send + Sync + 'static;

    /// Name used in logs and errors
    fn name(&self) -> &str;

    /// Create a resource bound to the given context's runtime
    async fn create(&self, ctx: &ExecutionContext) -> anyhow::Result<Self::Resource>;

    /// Close a resource that is being rebound or torn down
    async fn close(&self, _resource: Self::Resource) -> anyhow::Result<()> {
        Ok(())
    }
}

/// A resource handed out by a [`ResourceSlot`]
#[derive(Debug, Clone)]
pub struct BoundResource<R> {
    pub resource: R,
    pub identity: RuntimeIdentity,
    /// Increments every time the resource is recreated
    pub generation: u64,
}

struct Binding<R> {
    resource: R,
    generation: u64,
    /// Contexts currently using this binding
    leases: HashSet<Uuid>,
}

/// Lazily created resource that follows the runtime identity of its users.
///
/// Each live identity gets its own binding. A binding is closed once no
/// context holds it any more, so a resource is never shared across runtimes
/// and never closed under a context that is still using it.
pub struct ResourceSlot<R: Clone + Send + Sync + 'static> {
    factory: Arc<dyn ResourceFactory<Resource = R>>,
    bindings: Mutex<HashMap<RuntimeIdentity, Binding<R>>>,
    // serializes resource creation
    creating: tokio::sync::Mutex<()>,
    generation: AtomicU64,
    faults: Mutex<HashMap<Uuid, u32>>,
    max_faults: u32,
}

impl<R: Clone + Send + Sync + 'static> ResourceSlot<R> {
    pub fn new(factory: Arc<dyn ResourceFactory<Resource = R>>, max_faults: u32) -> Self {
        Self {
            factory,
            bindings: Mutex::new(HashMap::new()),
            creating: tokio::sync::Mutex::new(()),
            generation: AtomicU64::new(0),
            faults: Mutex::new(HashMap::new()),
            max_faults,
        }
    }

    pub fn name(&self) -> &str {
        self.factory.name()
    }

    /// Get the resource for this context's runtime, creating it if needed
    pub async fn acquire(&self, ctx: &ExecutionContext) -> OrchestratorResult<BoundResource<R>> {
        let identity = ctx.identity();
        let _creating = self.creating.lock().await;

        let stale = {
            let mut bindings = self.lock_bindings();
            if let Some(current) = bindings.get_mut(&identity) {
                current.leases.insert(ctx.context_id());
                return Ok(BoundResource {
                    resource: current.resource.clone(),
                    identity,
                    generation: current.generation,
                });
            }

            // idle bindings of other runtimes are stale
            let idle: Vec<RuntimeIdentity> = bindings
                .iter()
                .filter(|(_, binding)| binding.leases.is_empty())
                .map(|(identity, _)| *identity)
                .collect();
            idle.into_iter()
                .filter_map(|previous| bindings.remove(&previous).map(|b| (previous, b)))
                .collect::<Vec<_>>()
        };

        for (previous, binding) in stale {
            tracing::info!(
                resource = self.name(),
                bound_to = %previous,
                current = %identity,
                "Runtime identity changed, closing idle pooled resource"
            );
            self.close_quietly(binding.resource).await;
        }

        let resource = self.factory.create(ctx).await.map_err(|e| {
            OrchestratorError::ResourceAffinity {
                resource: self.name().to_string(),
                message: format!("failed to create resource: {:#}", e),
            }
        })?;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        self.lock_bindings().insert(
            identity,
            Binding {
                resource: resource.clone(),
                generation,
                leases: HashSet::from([ctx.context_id()]),
            },
        );

        Ok(BoundResource {
            resource,
            identity,
            generation,
        })
    }

    /// Report that the resource failed because it is tied to another runtime.
    ///
    /// The binding of this context's runtime is dropped so the next acquire
    /// recreates it. More faults than `max_faults` within one context are fatal.
    pub async fn report_fault(
        &self,
        ctx: &ExecutionContext,
        message: impl Into<String>,
    ) -> OrchestratorResult<()> {
        let message = message.into();
        let count = {
            let mut faults = self.faults.lock().unwrap_or_else(|e| e.into_inner());
            let count = faults.entry(ctx.context_id()).or_insert(0);
            *count += 1;
            *count
        };

        if count > self.max_faults {
            tracing::error!(
                resource = self.name(),
                context_id = %ctx.context_id(),
                faults = count,
                "Resource affinity fault is recurring"
            );
            return Err(OrchestratorError::ResourceAffinity {
                resource: self.name().to_string(),
                message,
            });
        }

        tracing::warn!(
            resource = self.name(),
            context_id = %ctx.context_id(),
            error = %message,
            "Resource affinity fault, forcing rebind"
        );
        let stale = self.lock_bindings().remove(&ctx.identity());
        if let Some(stale) = stale {
            self.close_quietly(stale.resource).await;
        }
        Ok(())
    }

    /// Drop the context's lease and fault bookkeeping; the resource stays pooled
    pub fn end_context(&self, ctx: &ExecutionContext) {
        self.faults
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&ctx.context_id());

        if let Some(binding) = self.lock_bindings().get_mut(&ctx.identity()) {
            binding.leases.remove(&ctx.context_id());
        }
    }

    /// Drop the context's lease and close the binding if nobody else holds it
    pub async fn release(&self, ctx: &ExecutionContext) {
        self.faults
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&ctx.context_id());

        let identity = ctx.identity();
        let closed = {
            let mut bindings = self.lock_bindings();
            let idle = match bindings.get_mut(&identity) {
                Some(binding) => {
                    binding.leases.remove(&ctx.context_id());
                    binding.leases.is_empty()
                }
                None => false,
            };
            if idle {
                bindings.remove(&identity)
            } else {
                None
            }
        };

        if let Some(binding) = closed {
            self.close_quietly(binding.resource).await;
        }
    }

    /// Number of runtimes that currently have a live binding
    pub fn live_bindings(&self) -> usize {
        self.lock_bindings().len()
    }

    fn lock_bindings(&self) -> std::sync::MutexGuard<'_, HashMap<RuntimeIdentity, Binding<R>>> {
        self.bindings.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    async fn close_quietly(&self, resource: R) {
        if let Err(e) = self.factory.close(resource).await {
            tracing::warn!(resource = self.name(), error = %e, "Failed to close pooled resource");
        }
    }
}

/// Anything that holds resources bound to a context
#[async_trait::async_trait]
pub trait ContextBound: Send + Sync {
    /// The context is finished but its runtime lives on
    fn end_context(&self, ctx: &ExecutionContext);

    /// The context's runtime is about to be shut down
    async fn release(&self, ctx: &ExecutionContext);
}

#[async_trait::async_trait]
impl<R: Clone + Send + Sync + 'static> ContextBound for ResourceSlot<R> {
    fn end_context(&self, ctx: &ExecutionContext) {
        ResourceSlot::end_context(self, ctx)
    }

    async fn release(&self, ctx: &ExecutionContext) {
        ResourceSlot::release(self, ctx).await
    }
}

/// Owns pooled resources and runs work under a chosen isolation strategy
pub struct IsolationManager {
    config: IsolationConfig,
    bound: Mutex<Vec<Arc<dyn ContextBound>>>,
}

impl IsolationManager {
    pub fn new(config: IsolationConfig) -> Self {
        Self {
            config,
            bound: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &IsolationConfig {
        &self.config
    }

    /// Register a resource holder so dedicated contexts can tear it down
    pub fn register(&self, holder: Arc<dyn ContextBound>) {
        self.bound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(holder);
    }

    /// Worker for dedicated-process isolation, if one is configured
    pub fn process_runner(&self) -> OrchestratorResult<ProcessRunner> {
        self.config
            .process
            .as_ref()
            .map(ProcessRunner::from_config)
            .ok_or_else(|| {
                OrchestratorError::IncompatibleSubstrate(
                    "no worker process configured for dedicated-process isolation".to_string(),
                )
            })
    }

    fn holders(&self) -> Vec<Arc<dyn ContextBound>> {
        self.bound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Run `f` inside an execution context chosen by `strategy`
    pub async fn with_isolated_context<F, Fut, T>(
        &self,
        strategy: IsolationStrategy,
        f: F,
    ) -> OrchestratorResult<T>
    where
        F: FnOnce(ExecutionContext) -> Fut + Send + 'static,
        Fut: Future<Output = OrchestratorResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let identity = RuntimeIdentity::detect();
        match resolve_strategy(strategy, identity)? {
            IsolationStrategy::SameContext => {
                let ctx = ExecutionContext::current();
                tracing::debug!(context_id = %ctx.context_id(), identity = %ctx.identity(), "Running in caller context");
                let result = f(ctx.clone()).await;
                for holder in self.holders() {
                    holder.end_context(&ctx);
                }
                result
            }
            IsolationStrategy::DedicatedThread => {
                let handle = self.spawn_dedicated(f)?;
                tokio::task::spawn_blocking(move || join_dedicated(handle))
                    .await
                    .map_err(|e| {
                        OrchestratorError::Isolation(format!("failed to await dedicated worker: {}", e))
                    })?
            }
            _ => Err(process_strategy_error()),
        }
    }

    /// Synchronous entry point for task-queue workers that own no runtime
    pub fn run_blocking<F, Fut, T>(&self, strategy: IsolationStrategy, f: F) -> OrchestratorResult<T>
    where
        F: FnOnce(ExecutionContext) -> Fut + Send + 'static,
        Fut: Future<Output = OrchestratorResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let identity = RuntimeIdentity::detect();
        if identity.has_runtime() {
            return Err(OrchestratorError::IncompatibleSubstrate(
                "run_blocking called from inside an async runtime".to_string(),
            ));
        }

        match resolve_strategy(strategy, identity)? {
            IsolationStrategy::DedicatedThread => join_dedicated(self.spawn_dedicated(f)?),
            _ => Err(process_strategy_error()),
        }
    }

    fn spawn_dedicated<F, Fut, T>(
        &self,
        f: F,
    ) -> OrchestratorResult<std::thread::JoinHandle<OrchestratorResult<T>>>
    where
        F: FnOnce(ExecutionContext) -> Fut + Send + 'static,
        Fut: Future<Output = OrchestratorResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let runtime_id = Uuid::new_v4();
        let holders = self.holders();
        let worker_threads = self.config.worker_threads.max(1);
        let shutdown_timeout = Duration::from_secs(self.config.shutdown_timeout_secs);

        std::thread::Builder::new()
            .name(format!("tessera-isolated-{}", &runtime_id.simple().to_string()[..8]))
            .spawn(move || {
                mark_thread(Some(runtime_id));

                let runtime = tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(worker_threads)
                    .thread_name("tessera-worker")
                    .on_thread_start(move || mark_thread(Some(runtime_id)))
                    .enable_all()
                    .build()
                    .map_err(|e| {
                        OrchestratorError::Isolation(format!("failed to build runtime: {}", e))
                    })?;

                let ctx = ExecutionContext::dedicated(runtime_id);
                tracing::debug!(context_id = %ctx.context_id(), identity = %ctx.identity(), "Dedicated runtime started");

                let result = runtime.block_on(async move {
                    let result = f(ctx.clone()).await;
                    for holder in &holders {
                        holder.release(&ctx).await;
                    }
                    result
                });

                runtime.shutdown_timeout(shutdown_timeout);
                mark_thread(None);
                result
            })
            .map_err(|e| OrchestratorError::Isolation(format!("failed to spawn worker thread: {}", e)))
    }
}

fn resolve_strategy(
    strategy: IsolationStrategy,
    identity: RuntimeIdentity,
) -> OrchestratorResult<IsolationStrategy> {
    match strategy {
        IsolationStrategy::Auto if identity.has_runtime() => Ok(IsolationStrategy::SameContext),
        IsolationStrategy::Auto => Ok(IsolationStrategy::DedicatedThread),
        IsolationStrategy::SameContext if !identity.has_runtime() => {
            Err(OrchestratorError::IncompatibleSubstrate(
                "same-context isolation requires a current tokio runtime".to_string(),
            ))
        }
        other => Ok(other),
    }
}

fn process_strategy_error() -> OrchestratorError {
    OrchestratorError::IncompatibleSubstrate(
        "closures cannot cross a process boundary; submit a serialized job instead".to_string(),
    )
}

fn join_dedicated<T>(
    handle: std::thread::JoinHandle<OrchestratorResult<T>>,
) -> OrchestratorResult<T> {
    handle
        .join()
        .map_err(|_| OrchestratorError::Isolation("dedicated worker panicked".to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingFactory {
        created: AtomicUsize,
        closed: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl ResourceFactory for CountingFactory {
        type Resource = Arc<RuntimeIdentity>;

        fn name(&self) -> &str {
            "counting"
        }

        async fn create(&self, ctx: &ExecutionContext) -> anyhow::Result<Self::Resource> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(ctx.identity()))
        }

        async fn close(&self, _resource: Self::Resource) -> anyhow::Result<()> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn manager() -> IsolationManager {
        IsolationManager::new(IsolationConfig {
            worker_threads: 1,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_same_identity_reuses_resource() {
        let factory = Arc::new(CountingFactory::default());
        let slot = ResourceSlot::new(factory.clone(), 1);
        let ctx = ExecutionContext::current();

        let first = slot.acquire(&ctx).await.unwrap();
        let second = slot.acquire(&ctx).await.unwrap();

        assert_eq!(first.generation, second.generation);
        assert!(Arc::ptr_eq(&first.resource, &second.resource));
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_identity_change_recreates_resource() {
        let factory = Arc::new(CountingFactory::default());
        let slot = Arc::new(ResourceSlot::new(factory.clone(), 1));
        let manager = manager();
        manager.register(slot.clone());

        let caller = ExecutionContext::current();
        let before = slot.acquire(&caller).await.unwrap();

        let isolated_slot = slot.clone();
        let (inside, identity) = manager
            .with_isolated_context(IsolationStrategy::DedicatedThread, move |ctx| async move {
                let bound = isolated_slot.acquire(&ctx).await?;
                Ok((bound, ctx.identity()))
            })
            .await
            .unwrap();

        assert!(matches!(identity, RuntimeIdentity::Dedicated(_)));
        assert_eq!(*inside.resource, identity);
        assert_ne!(inside.generation, before.generation);

        // the dedicated binding is torn down with its runtime; the caller's lease kept its own
        let after = slot.acquire(&caller).await.unwrap();
        assert_eq!(after.generation, before.generation);
        assert!(Arc::ptr_eq(&after.resource, &before.resource));
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
        assert_eq!(factory.closed.load(Ordering::SeqCst), 1);
        assert_eq!(slot.live_bindings(), 1);
    }

    #[tokio::test]
    async fn test_idle_binding_closed_on_identity_change() {
        let factory = Arc::new(CountingFactory::default());
        let slot = ResourceSlot::new(factory.clone(), 1);
        let first = ExecutionContext::dedicated(Uuid::new_v4());
        let second = ExecutionContext::dedicated(Uuid::new_v4());

        slot.acquire(&first).await.unwrap();
        slot.end_context(&first);

        let bound = slot.acquire(&second).await.unwrap();
        assert_eq!(*bound.resource, second.identity());
        assert_eq!(slot.live_bindings(), 1);
        assert_eq!(factory.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_leased_bindings_coexist() {
        let factory = Arc::new(CountingFactory::default());
        let slot = ResourceSlot::new(factory.clone(), 1);
        let first = ExecutionContext::dedicated(Uuid::new_v4());
        let second = ExecutionContext::dedicated(Uuid::new_v4());

        let a = slot.acquire(&first).await.unwrap();
        let b = slot.acquire(&second).await.unwrap();
        assert_ne!(a.generation, b.generation);
        assert_eq!(slot.live_bindings(), 2);
        assert_eq!(factory.closed.load(Ordering::SeqCst), 0);

        // a shared lease keeps the binding open until its last holder leaves
        let sibling = ExecutionContext {
            context_id: Uuid::new_v4(),
            ..first.clone()
        };
        slot.acquire(&sibling).await.unwrap();
        slot.release(&first).await;
        assert_eq!(slot.live_bindings(), 2);
        slot.release(&sibling).await;
        assert_eq!(slot.live_bindings(), 1);
        assert_eq!(factory.closed.load(Ordering::SeqCst), 1);
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_recurring_fault_is_fatal() {
        let factory = Arc::new(CountingFactory::default());
        let slot = ResourceSlot::new(factory.clone(), 1);
        let ctx = ExecutionContext::current();

        slot.acquire(&ctx).await.unwrap();
        slot.report_fault(&ctx, "connection attached to another loop")
            .await
            .unwrap();
        let rebound = slot.acquire(&ctx).await.unwrap();
        assert_eq!(rebound.generation, 2);

        let err = slot
            .report_fault(&ctx, "connection attached to another loop")
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::ResourceAffinity { .. }));
    }

    #[tokio::test]
    async fn test_spawned_tasks_share_dedicated_identity() {
        let manager = manager();
        let (outer, inner, created_new) = manager
            .with_isolated_context(IsolationStrategy::DedicatedThread, |ctx| async move {
                let inner = tokio::spawn(async { RuntimeIdentity::detect() })
                    .await
                    .map_err(|e| OrchestratorError::Isolation(e.to_string()))?;
                Ok((ctx.identity(), inner, ctx.created_new_runtime()))
            })
            .await
            .unwrap();

        assert_eq!(outer, inner);
        assert!(created_new);
    }

    #[tokio::test]
    async fn test_auto_uses_caller_runtime() {
        let manager = manager();
        let caller = RuntimeIdentity::detect();
        let identity = manager
            .with_isolated_context(IsolationStrategy::Auto, |ctx| async move { Ok(ctx.identity()) })
            .await
            .unwrap();

        assert!(matches!(caller, RuntimeIdentity::Foreign(_)));
        assert_eq!(identity, caller);
    }

    #[test]
    fn test_run_blocking_from_sync_worker() {
        let manager = manager();

        let err = manager
            .run_blocking(IsolationStrategy::SameContext, |_ctx| async { Ok(()) })
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::IncompatibleSubstrate(_)));

        let created_new = manager
            .run_blocking(IsolationStrategy::Auto, |ctx| async move {
                Ok(ctx.created_new_runtime())
            })
            .unwrap();
        assert!(created_new);
    }

    #[test]
    fn test_panicking_worker_is_reported() {
        let manager = manager();
        let result: OrchestratorResult<()> = manager
            .run_blocking(IsolationStrategy::DedicatedThread, |_ctx| async {
                if true {
                    panic!("worker blew up");
                }
                Ok(())
            });

        assert!(matches!(result, Err(OrchestratorError::Isolation(_))));
    }

    #[tokio::test]
    async fn test_process_strategy_rejects_closures() {
        let manager = manager();
        let result = manager
            .with_isolated_context(IsolationStrategy::DedicatedProcess, |_ctx| async { Ok(()) })
            .await;

        assert!(matches!(result, Err(OrchestratorError::IncompatibleSubstrate(_))));
        assert!(manager.process_runner().is_err());
    }
}
