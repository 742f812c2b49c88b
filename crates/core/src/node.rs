use crate::types::{BackendId, NodeId, NodeResult};
use crate::validation;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What a failed quality gate does to a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityPolicy {
    /// Keep the result, flag it as degraded
    #[default]
    Advisory,
    /// Fail the node
    Blocking,
}

/// Structural requirements a payload must meet to count as a result
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Validator {
    pub required_fields: Vec<String>,
}

impl Validator {
    pub fn validate(&self, payload: &serde_json::Value) -> Result<(), crate::types::NodeError> {
        validation::check_required(payload, &self.required_fields)
    }
}

/// Semantic bar a structurally valid payload should clear
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QualityGate {
    pub min_confidence: f64,
    /// Fields that must be present and non-trivial
    pub required_fields: Vec<String>,
    pub policy: QualityPolicy,
}

impl QualityGate {
    /// Reason the payload falls short, if it does
    pub fn evaluate(&self, payload: &serde_json::Value, confidence: f64) -> Option<String> {
        if confidence < self.min_confidence {
            return Some(format!(
                "confidence {:.2} below threshold {:.2}",
                confidence, self.min_confidence
            ));
        }

        let trivial: Vec<&str> = self
            .required_fields
            .iter()
            .filter(|field| {
                validation::lookup(payload, field.as_str()).map_or(true, validation::is_trivial)
            })
            .map(String::as_str)
            .collect();

        if trivial.is_empty() {
            None
        } else {
            Some(format!("empty quality fields: {}", trivial.join(", ")))
        }
    }
}

/// Declaration of one analysis node
#[derive(Debug, Clone)]
pub struct NodeSpec {
    pub id: NodeId,
    /// A blocking node's failure prevents its phase from completing
    pub blocking: bool,
    /// Overrides the run's default node timeout
    pub timeout: Option<Duration>,
    pub validator: Validator,
    pub quality: QualityGate,
    /// Preferred backends in order; empty means any capable backend
    pub backends: Vec<BackendId>,
    pub capability: Option<String>,
    /// Payload field holding the backend's self-reported confidence
    pub confidence_field: String,
}

impl NodeSpec {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: NodeId::new(id),
            blocking: false,
            timeout: None,
            validator: Validator::default(),
            quality: QualityGate::default(),
            backends: Vec::new(),
            capability: None,
            confidence_field: "confidence".to_string(),
        }
    }

    pub fn blocking(mut self, blocking: bool) -> Self {
        self.blocking = blocking;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn require(mut self, field: impl Into<String>) -> Self {
        self.validator.required_fields.push(field.into());
        self
    }

    pub fn min_confidence(mut self, threshold: f64) -> Self {
        self.quality.min_confidence = threshold;
        self
    }

    pub fn quality_field(mut self, field: impl Into<String>) -> Self {
        self.quality.required_fields.push(field.into());
        self
    }

    pub fn quality_policy(mut self, policy: QualityPolicy) -> Self {
        self.quality.policy = policy;
        self
    }

    pub fn prefer_backend(mut self, backend: impl Into<String>) -> Self {
        self.backends.push(BackendId::new(backend));
        self
    }

    pub fn capability(mut self, capability: impl Into<String>) -> Self {
        self.capability = Some(capability.into());
        self
    }

    pub fn confidence_field(mut self, field: impl Into<String>) -> Self {
        self.confidence_field = field.into();
        self
    }

    /// Confidence reported in the payload; absent or non-numeric counts as zero
    pub fn confidence_of(&self, payload: &serde_json::Value) -> f64 {
        validation::lookup(payload, &self.confidence_field)
            .and_then(serde_json::Value::as_f64)
            .map(crate::types::clamp_confidence)
            .unwrap_or(0.0)
    }

    /// Whether an existing result can stand in for running this node
    pub fn accepts_cached(&self, result: &NodeResult) -> bool {
        result.success
            && result.node_id == self.id
            && self.validator.validate(&result.payload).is_ok()
    }

    pub fn from_config(config: &NodeConfig) -> Self {
        Self {
            id: NodeId::new(config.id.clone()),
            blocking: config.blocking,
            timeout: config
                .timeout_ms
                .map(Duration::from_millis)
                .or(config.timeout_secs.map(Duration::from_secs)),
            validator: Validator {
                required_fields: config.required_fields.clone(),
            },
            quality: QualityGate {
                min_confidence: config.min_confidence,
                required_fields: config.quality_fields.clone(),
                policy: config.quality_policy,
            },
            backends: config.backends.iter().map(BackendId::new).collect(),
            capability: config.capability.clone(),
            confidence_field: config
                .confidence_field
                .clone()
                .unwrap_or_else(|| "confidence".to_string()),
        }
    }
}

/// Serialized form of [`NodeSpec`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub id: String,

    #[serde(default)]
    pub blocking: bool,

    /// Whole-second timeout for hand-written plans
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Millisecond timeout; wins over `timeout_secs`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    #[serde(default)]
    pub required_fields: Vec<String>,

    #[serde(default)]
    pub min_confidence: f64,

    #[serde(default)]
    pub quality_fields: Vec<String>,

    #[serde(default)]
    pub quality_policy: QualityPolicy,

    #[serde(default)]
    pub backends: Vec<String>,

    #[serde(default)]
    pub capability: Option<String>,

    #[serde(default)]
    pub confidence_field: Option<String>,
}

impl From<&NodeSpec> for NodeConfig {
    fn from(node: &NodeSpec) -> Self {
        Self {
            id: node.id.to_string(),
            blocking: node.blocking,
            timeout_secs: None,
            timeout_ms: node
                .timeout
                .map(|t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX)),
            required_fields: node.validator.required_fields.clone(),
            min_confidence: node.quality.min_confidence,
            quality_fields: node.quality.required_fields.clone(),
            quality_policy: node.quality.policy,
            backends: node.backends.iter().map(|b| b.to_string()).collect(),
            capability: node.capability.clone(),
            confidence_field: Some(node.confidence_field.clone()),
        }
    }
}
