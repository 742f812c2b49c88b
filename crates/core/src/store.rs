use crate::context::{ExecutionContext, ResourceFactory, ResourceSlot};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::types::{NodeFingerprint, NodeResult};
use anyhow::{Context, Result};
use redb::{Database, ReadableTable, TableDefinition};
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

const RESULTS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("node_results");

/// A store handle was used from a runtime it is not bound to.
///
/// Stores return this (wrapped in `anyhow::Error`) so callers can rebind
/// instead of treating the failure as a miss.
#[derive(Debug, thiserror::Error)]
#[error("resource bound to another runtime: {0}")]
pub struct AffinityFault(pub String);

/// Whether a store error is an [`AffinityFault`]
pub fn is_affinity_fault(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.is::<AffinityFault>())
}

/// Cache/repository of node results keyed by fingerprint
#[async_trait::async_trait]
pub trait ResultStore: Send + Sync {
    /// Look up a previously persisted result
    async fn lookup(&self, fingerprint: &NodeFingerprint) -> Result<Option<NodeResult>>;

    /// Persist a result
    async fn persist(&self, fingerprint: &NodeFingerprint, result: &NodeResult) -> Result<()>;
}

/// In-process result store
#[derive(Default)]
pub struct InMemoryResultStore {
    results: RwLock<HashMap<NodeFingerprint, NodeResult>>,
    lookups: AtomicUsize,
}

impl InMemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.results.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.results.read().await.is_empty()
    }

    /// Number of lookups served so far
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ResultStore for InMemoryResultStore {
    async fn lookup(&self, fingerprint: &NodeFingerprint) -> Result<Option<NodeResult>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.results.read().await.get(fingerprint).cloned())
    }

    async fn persist(&self, fingerprint: &NodeFingerprint, result: &NodeResult) -> Result<()> {
        self.results
            .write()
            .await
            .insert(fingerprint.clone(), result.clone());
        Ok(())
    }
}

/// Result store backed by redb
#[derive(Clone)]
pub struct RedbResultStore {
    db: Arc<Database>,
}

impl RedbResultStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        // Create parent directory if needed
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create result store directory")?;
        }

        let db = Database::create(&path).context("Failed to create redb database")?;

        let write_txn = db.begin_write().context("Failed to begin write transaction")?;
        {
            let _results_table = write_txn
                .open_table(RESULTS_TABLE)
                .context("Failed to open results table")?;
        }
        write_txn.commit().context("Failed to commit transaction")?;

        Ok(Self { db: Arc::new(db) })
    }

    fn from_database(db: Arc<Database>) -> Self {
        Self { db }
    }
}

#[async_trait::async_trait]
impl ResultStore for RedbResultStore {
    async fn lookup(&self, fingerprint: &NodeFingerprint) -> Result<Option<NodeResult>> {
        let db = self.db.clone();
        let key = fingerprint.0.clone();

        tokio::task::spawn_blocking(move || -> Result<Option<NodeResult>> {
            let read_txn = db.begin_read().context("Failed to begin read")?;
            let table = read_txn
                .open_table(RESULTS_TABLE)
                .context("Failed to open table")?;

            let value = table.get(key.as_str()).context("Failed to get result")?;

            match value {
                Some(guard) => {
                    let result: NodeResult = serde_json::from_slice(guard.value())
                        .context("Failed to deserialize result")?;
                    Ok(Some(result))
                }
                None => Ok(None),
            }
        })
        .await
        .context("Result lookup task failed")?
    }

    async fn persist(&self, fingerprint: &NodeFingerprint, result: &NodeResult) -> Result<()> {
        let value = serde_json::to_vec(result).context("Failed to serialize result")?;
        let db = self.db.clone();
        let key = fingerprint.0.clone();

        tokio::task::spawn_blocking(move || -> Result<()> {
            let write_txn = db.begin_write().context("Failed to begin write")?;
            {
                let mut table = write_txn
                    .open_table(RESULTS_TABLE)
                    .context("Failed to open table")?;
                table
                    .insert(key.as_str(), value.as_slice())
                    .context("Failed to insert result")?;
            }
            write_txn.commit().context("Failed to commit")?;
            Ok(())
        })
        .await
        .context("Result persist task failed")?
    }
}

/// Hands out one shared store regardless of runtime
pub struct SharedStoreFactory {
    store: Arc<dyn ResultStore>,
}

impl SharedStoreFactory {
    pub fn new(store: Arc<dyn ResultStore>) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl ResourceFactory for SharedStoreFactory {
    type Resource = Arc<dyn ResultStore>;

    fn name(&self) -> &str {
        "shared-result-store"
    }

    async fn create(&self, _ctx: &ExecutionContext) -> Result<Self::Resource> {
        Ok(self.store.clone())
    }
}

/// Opens the redb store on the runtime of the context that needs it.
///
/// redb allows one open handle per file and process, so bindings that are
/// alive at the same time share the database.
pub struct RedbStoreFactory {
    path: PathBuf,
    open: Mutex<Weak<Database>>,
}

impl RedbStoreFactory {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            open: Mutex::new(Weak::new()),
        }
    }
}

#[async_trait::async_trait]
impl ResourceFactory for RedbStoreFactory {
    type Resource = Arc<dyn ResultStore>;

    fn name(&self) -> &str {
        "redb-result-store"
    }

    async fn create(&self, ctx: &ExecutionContext) -> Result<Self::Resource> {
        let mut open = self.open.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(db) = open.upgrade() {
            tracing::debug!(path = %self.path.display(), identity = %ctx.identity(), "Sharing open result store");
            return Ok(Arc::new(RedbResultStore::from_database(db)));
        }

        tracing::debug!(path = %self.path.display(), identity = %ctx.identity(), "Opening result store");
        let store = RedbResultStore::new(self.path.clone())?;
        *open = Arc::downgrade(&store.db);
        Ok(Arc::new(store))
    }
}

/// Store handle of one run that rebinds on affinity faults.
///
/// A fault reported by the underlying store drops the runtime's binding and
/// retries on a fresh one. When the slot declares the fault recurring, the
/// error is kept for the run and the run is cancelled.
pub(crate) struct RebindingStore {
    slot: Arc<ResourceSlot<Arc<dyn ResultStore>>>,
    ctx: ExecutionContext,
    /// Current binding and its generation
    current: RwLock<(u64, Arc<dyn ResultStore>)>,
    fatal: Mutex<Option<OrchestratorError>>,
    cancel: CancellationToken,
}

impl RebindingStore {
    pub(crate) async fn bind(
        slot: Arc<ResourceSlot<Arc<dyn ResultStore>>>,
        ctx: &ExecutionContext,
        cancel: CancellationToken,
    ) -> OrchestratorResult<Self> {
        let bound = slot.acquire(ctx).await?;
        Ok(Self {
            slot,
            ctx: ctx.clone(),
            current: RwLock::new((bound.generation, bound.resource)),
            fatal: Mutex::new(None),
            cancel,
        })
    }

    /// The fatal affinity error that stopped the run, if any
    pub(crate) fn take_fatal(&self) -> Option<OrchestratorError> {
        self.fatal.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    async fn with_rebind<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn(Arc<dyn ResultStore>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        loop {
            let (generation, store) = self.current.read().await.clone();
            match op(store).await {
                Err(e) if is_affinity_fault(&e) && !self.cancel.is_cancelled() => {
                    if let Err(fatal) = self.rebind(generation, &e).await {
                        self.fatal
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .get_or_insert(fatal);
                        self.cancel.cancel();
                        return Err(e);
                    }
                }
                other => return other,
            }
        }
    }

    async fn rebind(&self, failed: u64, err: &anyhow::Error) -> OrchestratorResult<()> {
        let mut current = self.current.write().await;
        // another node already rebound after the same fault
        if current.0 != failed {
            return Ok(());
        }

        self.slot.report_fault(&self.ctx, format!("{:#}", err)).await?;
        let bound = self.slot.acquire(&self.ctx).await?;
        *current = (bound.generation, bound.resource);
        Ok(())
    }
}

#[async_trait::async_trait]
impl ResultStore for RebindingStore {
    async fn lookup(&self, fingerprint: &NodeFingerprint) -> Result<Option<NodeResult>> {
        self.with_rebind(|store| async move { store.lookup(fingerprint).await })
            .await
    }

    async fn persist(&self, fingerprint: &NodeFingerprint, result: &NodeResult) -> Result<()> {
        self.with_rebind(|store| async move { store.persist(fingerprint, result).await })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DocumentFingerprint, NodeId};
    use tempfile::TempDir;

    fn sample() -> (NodeFingerprint, NodeResult) {
        let node_id = NodeId::new("parties");
        let fingerprint = DocumentFingerprint::from_bytes(b"doc").for_node(&node_id);
        let result = NodeResult::succeeded(node_id, serde_json::json!({"parties": ["A", "B"]}), 0.8);
        (fingerprint, result)
    }

    #[tokio::test]
    async fn test_in_memory_store() {
        let store = InMemoryResultStore::new();
        let (fingerprint, result) = sample();

        assert!(store.lookup(&fingerprint).await.unwrap().is_none());
        store.persist(&fingerprint, &result).await.unwrap();

        assert_eq!(store.lookup(&fingerprint).await.unwrap(), Some(result));
        assert_eq!(store.lookups(), 2);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_redb_store_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("store").join("results.redb");
        let (fingerprint, result) = sample();

        {
            let store = RedbResultStore::new(path.clone()).unwrap();
            store.persist(&fingerprint, &result).await.unwrap();
        }

        let reopened = RedbResultStore::new(path).unwrap();
        let loaded = reopened.lookup(&fingerprint).await.unwrap().unwrap();
        assert_eq!(loaded, result);
    }

    #[tokio::test]
    async fn test_redb_factory_opens_store() {
        let temp_dir = TempDir::new().unwrap();
        let factory = RedbStoreFactory::new(temp_dir.path().join("results.redb"));
        let ctx = ExecutionContext::current();

        let store = factory.create(&ctx).await.unwrap();
        let (fingerprint, result) = sample();
        store.persist(&fingerprint, &result).await.unwrap();
        assert!(store.lookup(&fingerprint).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_redb_factory_shares_open_database() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("results.redb");
        let factory = RedbStoreFactory::new(path.clone());
        let (fingerprint, result) = sample();

        let first = factory.create(&ExecutionContext::current()).await.unwrap();
        let second = factory.create(&ExecutionContext::current()).await.unwrap();
        first.persist(&fingerprint, &result).await.unwrap();
        assert_eq!(second.lookup(&fingerprint).await.unwrap(), Some(result.clone()));

        // once every handle is gone the file can be opened again
        drop(first);
        drop(second);
        let reopened = factory.create(&ExecutionContext::current()).await.unwrap();
        assert_eq!(reopened.lookup(&fingerprint).await.unwrap(), Some(result));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_redb_store_concurrent_writes() {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(RedbResultStore::new(temp_dir.path().join("results.redb")).unwrap());

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let node_id = NodeId::new(format!("node-{}", i));
                let fingerprint = DocumentFingerprint::from_bytes(b"doc").for_node(&node_id);
                let result = NodeResult::succeeded(node_id, serde_json::json!({"i": i}), 0.5);
                store.persist(&fingerprint, &result).await.unwrap();
                fingerprint
            }));
        }

        for handle in handles {
            let fingerprint = handle.await.unwrap();
            assert!(store.lookup(&fingerprint).await.unwrap().is_some());
        }
    }

    #[test]
    fn test_affinity_fault_is_recognised_through_context() {
        let err = anyhow::Error::new(AffinityFault("pool attached to another loop".into()))
            .context("Failed to get result");
        assert!(is_affinity_fault(&err));
        assert!(!is_affinity_fault(&anyhow::anyhow!("disk full")));
    }
}
