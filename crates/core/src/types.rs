use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of an analysis node
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Identifier of a pipeline phase
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PhaseId(pub String);

impl PhaseId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for PhaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PhaseId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Identifier of an analysis backend
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BackendId(pub String);

impl BackendId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for BackendId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Content fingerprint of the analysed document (SHA-256, hex)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DocumentFingerprint(pub String);

impl DocumentFingerprint {
    pub fn from_bytes(data: &[u8]) -> Self {
        use sha2::{Digest, Sha256};
        let hash = Sha256::digest(data);
        Self(hex::encode(hash))
    }

    /// Cache key for one node's result on this document
    pub fn for_node(&self, node_id: &NodeId) -> NodeFingerprint {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(self.0.as_bytes());
        hasher.update(b":");
        hasher.update(node_id.0.as_bytes());
        NodeFingerprint(hex::encode(hasher.finalize()))
    }
}

impl std::fmt::Display for DocumentFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Fingerprint of a (document, node) pair
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeFingerprint(pub String);

impl std::fmt::Display for NodeFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Classification of a node-level failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    StructuralParse,
    Validation,
    QualityGate,
    BackendUnavailable,
    Timeout,
    Cancelled,
    Panicked,
    PrerequisiteMissing,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::StructuralParse => "structural_parse",
            Self::Validation => "validation",
            Self::QualityGate => "quality_gate",
            Self::BackendUnavailable => "backend_unavailable",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::Panicked => "panicked",
            Self::PrerequisiteMissing => "prerequisite_missing",
        };
        f.write_str(s)
    }
}

/// Error attached to a failed node result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeError {
    pub kind: ErrorKind,
    pub message: String,
}

impl NodeError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for NodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// How a node result came to be
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeOutcome {
    /// A backend produced it during this run
    Executed,
    /// Served from the result store without calling a backend
    Cached,
    /// Not executed at all (missing prerequisites or recovery skip)
    Skipped,
}

/// Output of a single node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeResult {
    pub node_id: NodeId,
    pub success: bool,
    pub payload: serde_json::Value,
    pub confidence: f64,
    pub error: Option<NodeError>,
    pub completed_at: DateTime<Utc>,
    pub outcome: NodeOutcome,
    #[serde(default)]
    pub quality_flagged: bool,
    #[serde(default)]
    pub backend: Option<BackendId>,
    #[serde(default)]
    pub attempts: u32,
}

impl NodeResult {
    pub fn succeeded(node_id: NodeId, payload: serde_json::Value, confidence: f64) -> Self {
        Self {
            node_id,
            success: true,
            payload,
            confidence: clamp_confidence(confidence),
            error: None,
            completed_at: Utc::now(),
            outcome: NodeOutcome::Executed,
            quality_flagged: false,
            backend: None,
            attempts: 0,
        }
    }

    pub fn failed(node_id: NodeId, error: NodeError) -> Self {
        Self {
            node_id,
            success: false,
            payload: serde_json::Value::Null,
            confidence: 0.0,
            error: Some(error),
            completed_at: Utc::now(),
            outcome: NodeOutcome::Executed,
            quality_flagged: false,
            backend: None,
            attempts: 0,
        }
    }

    pub fn skipped(node_id: NodeId, reason: impl Into<String>) -> Self {
        let mut result = Self::failed(
            node_id,
            NodeError::new(ErrorKind::PrerequisiteMissing, reason),
        );
        result.outcome = NodeOutcome::Skipped;
        result
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

/// Confidence values are always kept inside [0, 1]; NaN counts as no confidence.
pub fn clamp_confidence(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Overall status of a pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Partial,
    TimedOut,
    Failed,
}

/// Recovery action chosen after inspecting a run's state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RetryDecision {
    RetryNode {
        node_id: NodeId,
        phase_id: PhaseId,
        reason: String,
        evidence: Vec<String>,
    },
    SkipNode {
        node_id: NodeId,
        phase_id: PhaseId,
        reason: String,
        evidence: Vec<String>,
    },
    ResumeFromPhase {
        phase_id: PhaseId,
        reason: String,
        evidence: Vec<String>,
    },
    RestartPipeline {
        reason: String,
        evidence: Vec<String>,
    },
    /// Every phase is complete and its artifacts are present
    Complete { evidence: Vec<String> },
}

impl RetryDecision {
    pub fn evidence(&self) -> &[String] {
        match self {
            Self::RetryNode { evidence, .. }
            | Self::SkipNode { evidence, .. }
            | Self::ResumeFromPhase { evidence, .. }
            | Self::RestartPipeline { evidence, .. }
            | Self::Complete { evidence } => evidence,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_fingerprint_depends_on_node() {
        let doc = DocumentFingerprint::from_bytes(b"contract text");
        let a = doc.for_node(&NodeId::new("a"));
        let b = doc.for_node(&NodeId::new("b"));

        assert_ne!(a, b);
        assert_eq!(a, doc.for_node(&NodeId::new("a")));
        assert_eq!(a.0.len(), 64);
    }

    #[test]
    fn test_confidence_is_clamped() {
        assert_eq!(clamp_confidence(1.7), 1.0);
        assert_eq!(clamp_confidence(-0.2), 0.0);
        assert_eq!(clamp_confidence(f64::NAN), 0.0);

        let result = NodeResult::succeeded(NodeId::new("a"), serde_json::json!({}), 4.0);
        assert_eq!(result.confidence, 1.0);
    }

    #[test]
    fn test_skipped_result_is_marked() {
        let result = NodeResult::skipped(NodeId::new("a"), "missing input");
        assert!(!result.success);
        assert_eq!(result.outcome, NodeOutcome::Skipped);
        assert_eq!(result.error_kind(), Some(ErrorKind::PrerequisiteMissing));
    }
}
