use crate::node::NodeSpec;
use crate::state::WorkflowState;
use crate::types::{BackendId, NodeId};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

/// Raw text returned by an analysis backend
#[derive(Debug, Clone, PartialEq)]
pub struct RawResult {
    pub body: String,
}

impl RawResult {
    pub fn new(body: impl Into<String>) -> Self {
        Self { body: body.into() }
    }
}

/// Failure of a single backend call
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The backend could not be reached or is overloaded.
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    /// The backend refused this request.
    #[error("Request rejected: {0}")]
    Rejected(String),

    /// The backend's own deadline expired.
    #[error("Backend timed out")]
    Timeout,
}

/// An analysis service that turns composed input into a raw result
#[async_trait::async_trait]
pub trait AnalysisBackend: Send + Sync {
    async fn invoke(
        &self,
        node_id: &NodeId,
        input: &serde_json::Value,
        timeout: Duration,
    ) -> Result<RawResult, BackendError>;
}

/// A backend together with what it can do
#[derive(Clone)]
pub struct BackendRoute {
    pub id: BackendId,
    pub capabilities: BTreeSet<String>,
    pub backend: Arc<dyn AnalysisBackend>,
}

impl BackendRoute {
    pub fn new(id: impl Into<String>, backend: Arc<dyn AnalysisBackend>) -> Self {
        Self {
            id: BackendId::new(id),
            capabilities: BTreeSet::new(),
            backend,
        }
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }

    pub fn supports(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }
}

impl std::fmt::Debug for BackendRoute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRoute")
            .field("id", &self.id)
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

/// Ordered fallback list of backends
#[derive(Debug, Clone, Default)]
pub struct BackendChain {
    routes: Vec<BackendRoute>,
}

impl BackendChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_route(mut self, route: BackendRoute) -> Self {
        self.routes.push(route);
        self
    }

    pub fn routes(&self) -> &[BackendRoute] {
        &self.routes
    }

    /// Routes to try for a node, in order.
    ///
    /// A node's explicit backend preference wins; otherwise every route with
    /// the node's required capability is used in registration order.
    pub fn routes_for(&self, node: &NodeSpec) -> Vec<&BackendRoute> {
        if !node.backends.is_empty() {
            return node
                .backends
                .iter()
                .filter_map(|id| self.routes.iter().find(|route| &route.id == id))
                .collect();
        }

        self.routes
            .iter()
            .filter(|route| {
                node.capability
                    .as_deref()
                    .map_or(true, |capability| route.supports(capability))
            })
            .collect()
    }
}

/// Builds the backend input for a node from the current state snapshot
pub trait InputComposer: Send + Sync {
    fn compose(&self, node: &NodeSpec, state: &WorkflowState) -> serde_json::Value;
}

/// Passes the document fingerprint and every successful upstream payload
#[derive(Debug, Default)]
pub struct UpstreamComposer;

impl InputComposer for UpstreamComposer {
    fn compose(&self, node: &NodeSpec, state: &WorkflowState) -> serde_json::Value {
        let upstream: serde_json::Map<String, serde_json::Value> = state
            .results
            .values()
            .filter(|result| result.success)
            .map(|result| (result.node_id.to_string(), result.payload.clone()))
            .collect();

        serde_json::json!({
            "fingerprint": state.fingerprint,
            "node_id": node.id,
            "upstream": upstream,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DocumentFingerprint, NodeResult};

    struct Silent;

    #[async_trait::async_trait]
    impl AnalysisBackend for Silent {
        async fn invoke(
            &self,
            _node_id: &NodeId,
            _input: &serde_json::Value,
            _timeout: Duration,
        ) -> Result<RawResult, BackendError> {
            Err(BackendError::Unavailable("silent".to_string()))
        }
    }

    fn chain() -> BackendChain {
        BackendChain::new()
            .with_route(BackendRoute::new("primary", Arc::new(Silent)).with_capability("text"))
            .with_route(BackendRoute::new("vision", Arc::new(Silent)).with_capability("image"))
            .with_route(BackendRoute::new("fallback", Arc::new(Silent)).with_capability("text"))
    }

    fn ids(routes: Vec<&BackendRoute>) -> Vec<String> {
        routes.iter().map(|r| r.id.to_string()).collect()
    }

    #[test]
    fn test_routes_filtered_by_capability() {
        let node = NodeSpec::new("clauses").capability("text");
        assert_eq!(ids(chain().routes_for(&node)), vec!["primary", "fallback"]);

        let any = NodeSpec::new("summary");
        assert_eq!(ids(chain().routes_for(&any)).len(), 3);
    }

    #[test]
    fn test_explicit_preference_wins() {
        let node = NodeSpec::new("signatures")
            .prefer_backend("vision")
            .prefer_backend("missing")
            .prefer_backend("primary");

        assert_eq!(ids(chain().routes_for(&node)), vec!["vision", "primary"]);
    }

    #[test]
    fn test_upstream_composer_includes_successes_only() {
        let mut state = WorkflowState::new(DocumentFingerprint::from_bytes(b"doc"));
        let mut update = crate::state::StateUpdate::new();
        update.record(
            NodeResult::succeeded(NodeId::new("a"), serde_json::json!({"k": 1}), 1.0),
            false,
            1,
        );
        update.record(
            NodeResult::failed(
                NodeId::new("b"),
                crate::types::NodeError::new(crate::types::ErrorKind::Timeout, "slow"),
            ),
            false,
            1,
        );
        state.merge(update).unwrap();

        let input = UpstreamComposer.compose(&NodeSpec::new("c"), &state);
        assert_eq!(input["node_id"], "c");
        assert_eq!(input["upstream"]["a"]["k"], 1);
        assert!(input["upstream"].get("b").is_none());
    }
}
