use crate::error::{OrchestratorError, OrchestratorResult};
use crate::node::{NodeConfig, NodeSpec};
use crate::state::WorkflowState;
use crate::types::{NodeId, PhaseId};
use crate::validation;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// An artifact a node result must provide
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRequirement {
    pub node: NodeId,
    /// Field or JSON pointer inside the payload; `None` means the whole payload
    #[serde(default)]
    pub field: Option<String>,
}

impl ArtifactRequirement {
    pub fn node(node: impl Into<String>) -> Self {
        Self {
            node: NodeId::new(node),
            field: None,
        }
    }

    pub fn field(node: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            node: NodeId::new(node),
            field: Some(field.into()),
        }
    }

    /// Satisfied by a successful result whose payload (or field) is non-trivial
    pub fn check(&self, state: &WorkflowState) -> Result<(), String> {
        let result = state
            .result(&self.node)
            .ok_or_else(|| format!("no result for {}", self.node))?;

        if !result.success {
            return Err(format!("{} did not succeed", self.node));
        }

        let value = match &self.field {
            Some(field) => validation::lookup(&result.payload, field),
            None => Some(&result.payload),
        };

        match value {
            Some(value) if !validation::is_trivial(value) => Ok(()),
            _ => Err(format!("{} is empty", self)),
        }
    }
}

impl std::fmt::Display for ArtifactRequirement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.field {
            Some(field) => write!(f, "{}.{}", self.node, field.trim_start_matches('/')),
            None => write!(f, "{}", self.node),
        }
    }
}

/// Custom eligibility predicate for a node
pub type ArtifactPredicate = Arc<dyn Fn(&WorkflowState, &NodeSpec) -> bool + Send + Sync>;

/// One phase of the pipeline: independent nodes that may run concurrently
#[derive(Clone)]
pub struct PhaseDefinition {
    pub id: PhaseId,
    pub nodes: Vec<NodeSpec>,
    pub predecessor: Option<PhaseId>,
    /// Needed by every node of the phase
    pub required_artifacts: Vec<ArtifactRequirement>,
    /// Needed by individual nodes only
    pub node_artifacts: BTreeMap<NodeId, Vec<ArtifactRequirement>>,
    pub custom_check: Option<ArtifactPredicate>,
    /// What the state must hold once this phase is complete
    pub produces: Vec<ArtifactRequirement>,
}

impl PhaseDefinition {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: PhaseId::new(id),
            nodes: Vec::new(),
            predecessor: None,
            required_artifacts: Vec::new(),
            node_artifacts: BTreeMap::new(),
            custom_check: None,
            produces: Vec::new(),
        }
    }

    pub fn node(mut self, node: NodeSpec) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn after(mut self, predecessor: impl Into<String>) -> Self {
        self.predecessor = Some(PhaseId::new(predecessor));
        self
    }

    pub fn requires(mut self, requirement: ArtifactRequirement) -> Self {
        self.required_artifacts.push(requirement);
        self
    }

    pub fn node_requires(mut self, node: impl Into<String>, requirement: ArtifactRequirement) -> Self {
        self.node_artifacts
            .entry(NodeId::new(node))
            .or_default()
            .push(requirement);
        self
    }

    pub fn check_with(mut self, predicate: ArtifactPredicate) -> Self {
        self.custom_check = Some(predicate);
        self
    }

    pub fn produces(mut self, requirement: ArtifactRequirement) -> Self {
        self.produces.push(requirement);
        self
    }

    pub fn find_node(&self, node_id: &NodeId) -> Option<&NodeSpec> {
        self.nodes.iter().find(|node| &node.id == node_id)
    }

    /// Whether `node` may run against `state`; the error names what is missing
    pub fn check_artifacts(&self, state: &WorkflowState, node: &NodeSpec) -> Result<(), String> {
        let per_node = self.node_artifacts.get(&node.id).into_iter().flatten();
        for requirement in self.required_artifacts.iter().chain(per_node) {
            requirement
                .check(state)
                .map_err(|reason| format!("prerequisite missing: {}", reason))?;
        }

        if let Some(predicate) = &self.custom_check {
            if !predicate(state, node) {
                return Err("prerequisite missing: custom artifact check failed".to_string());
            }
        }

        Ok(())
    }

    /// Missing `produces` artifacts. Artifacts of skipped nodes are excused.
    pub fn missing_artifacts(&self, state: &WorkflowState) -> Vec<String> {
        self.produces
            .iter()
            .filter(|requirement| !state.skipped_analyzers.contains(&requirement.node))
            .filter_map(|requirement| requirement.check(state).err())
            .collect()
    }

    fn all_requirements(&self) -> impl Iterator<Item = &ArtifactRequirement> {
        self.required_artifacts
            .iter()
            .chain(self.node_artifacts.values().flatten())
    }
}

impl std::fmt::Debug for PhaseDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhaseDefinition")
            .field("id", &self.id)
            .field("nodes", &self.nodes)
            .field("predecessor", &self.predecessor)
            .field("required_artifacts", &self.required_artifacts)
            .field("node_artifacts", &self.node_artifacts)
            .field("custom_check", &self.custom_check.is_some())
            .field("produces", &self.produces)
            .finish()
    }
}

/// A validated, ordered list of phases
#[derive(Debug, Clone)]
pub struct PhasePlan {
    phases: Vec<PhaseDefinition>,
}

impl PhasePlan {
    /// Validate and build a plan.
    ///
    /// Phase and node ids must be unique, predecessors and artifact sources
    /// must exist in an earlier phase, and the declared order must be a
    /// topological order of those dependencies.
    pub fn new(phases: Vec<PhaseDefinition>) -> OrchestratorResult<Self> {
        if phases.is_empty() {
            return Err(OrchestratorError::InvalidPlan("plan has no phases".to_string()));
        }

        let mut graph: DiGraph<PhaseId, ()> = DiGraph::new();
        let mut phase_indices: HashMap<PhaseId, NodeIndex> = HashMap::new();
        let mut node_phase: HashMap<NodeId, PhaseId> = HashMap::new();

        for phase in &phases {
            if phase.nodes.is_empty() {
                return Err(OrchestratorError::InvalidPlan(format!(
                    "phase {} has no nodes",
                    phase.id
                )));
            }

            let index = graph.add_node(phase.id.clone());
            if phase_indices.insert(phase.id.clone(), index).is_some() {
                return Err(OrchestratorError::InvalidPlan(format!(
                    "duplicate phase id {}",
                    phase.id
                )));
            }

            for node in &phase.nodes {
                if node_phase.insert(node.id.clone(), phase.id.clone()).is_some() {
                    return Err(OrchestratorError::InvalidPlan(format!(
                        "duplicate node id {}",
                        node.id
                    )));
                }
            }
        }

        for phase in &phases {
            let target = phase_indices[&phase.id];

            if let Some(predecessor) = &phase.predecessor {
                let source = phase_indices.get(predecessor).ok_or_else(|| {
                    OrchestratorError::InvalidPlan(format!(
                        "phase {} depends on unknown phase {}",
                        phase.id, predecessor
                    ))
                })?;
                graph.add_edge(*source, target, ());
            }

            for node_id in phase.node_artifacts.keys() {
                if phase.find_node(node_id).is_none() {
                    return Err(OrchestratorError::InvalidPlan(format!(
                        "phase {} declares requirements for foreign node {}",
                        phase.id, node_id
                    )));
                }
            }

            for requirement in phase.all_requirements() {
                let source = node_phase.get(&requirement.node).ok_or_else(|| {
                    OrchestratorError::InvalidPlan(format!(
                        "phase {} requires output of unknown node {}",
                        phase.id, requirement.node
                    ))
                })?;
                if source == &phase.id {
                    return Err(OrchestratorError::InvalidPlan(format!(
                        "phase {} requires output of its own node {}",
                        phase.id, requirement.node
                    )));
                }
                graph.add_edge(phase_indices[source], target, ());
            }

            for requirement in &phase.produces {
                if !node_phase.contains_key(&requirement.node) {
                    return Err(OrchestratorError::InvalidPlan(format!(
                        "phase {} produces output of unknown node {}",
                        phase.id, requirement.node
                    )));
                }
            }
        }

        if petgraph::algo::toposort(&graph, None).is_err() {
            return Err(OrchestratorError::InvalidPlan(
                "phase dependencies contain a cycle".to_string(),
            ));
        }

        // declared order must already respect every dependency
        for edge in graph.raw_edges() {
            if edge.source().index() >= edge.target().index() {
                return Err(OrchestratorError::InvalidPlan(format!(
                    "phase {} is declared before its dependency {}",
                    graph[edge.target()],
                    graph[edge.source()]
                )));
            }
        }

        Ok(Self { phases })
    }

    pub fn phases(&self) -> &[PhaseDefinition] {
        &self.phases
    }

    pub fn phase(&self, phase_id: &PhaseId) -> Option<&PhaseDefinition> {
        self.phases.iter().find(|phase| &phase.id == phase_id)
    }

    pub fn index_of(&self, phase_id: &PhaseId) -> Option<usize> {
        self.phases.iter().position(|phase| &phase.id == phase_id)
    }

    /// Phase owning a node, and the node itself
    pub fn locate(&self, node_id: &NodeId) -> Option<(&PhaseDefinition, &NodeSpec)> {
        self.phases
            .iter()
            .find_map(|phase| phase.find_node(node_id).map(|node| (phase, node)))
    }

    pub fn node_count(&self) -> usize {
        self.phases.iter().map(|phase| phase.nodes.len()).sum()
    }

    /// Serializable form; plans with custom predicates cannot be expressed
    pub fn to_config(&self) -> OrchestratorResult<PlanConfig> {
        let phases = self
            .phases
            .iter()
            .map(|phase| {
                if phase.custom_check.is_some() {
                    return Err(OrchestratorError::InvalidPlan(format!(
                        "phase {} uses a custom artifact check that cannot be serialized",
                        phase.id
                    )));
                }
                Ok(PhaseConfig {
                    id: phase.id.to_string(),
                    predecessor: phase.predecessor.as_ref().map(|p| p.to_string()),
                    nodes: phase.nodes.iter().map(NodeConfig::from).collect(),
                    requires: phase.required_artifacts.clone(),
                    node_requires: phase
                        .node_artifacts
                        .iter()
                        .map(|(node, reqs)| (node.to_string(), reqs.clone()))
                        .collect(),
                    produces: phase.produces.clone(),
                })
            })
            .collect::<OrchestratorResult<Vec<_>>>()?;

        Ok(PlanConfig { phases })
    }
}

/// Declarative plan, as found under `[plan]` in the configuration file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanConfig {
    #[serde(default)]
    pub phases: Vec<PhaseConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseConfig {
    pub id: String,

    #[serde(default)]
    pub predecessor: Option<String>,

    #[serde(default)]
    pub nodes: Vec<NodeConfig>,

    #[serde(default)]
    pub requires: Vec<ArtifactRequirement>,

    #[serde(default)]
    pub node_requires: BTreeMap<String, Vec<ArtifactRequirement>>,

    #[serde(default)]
    pub produces: Vec<ArtifactRequirement>,
}

impl PlanConfig {
    pub fn build(&self) -> OrchestratorResult<PhasePlan> {
        let phases = self
            .phases
            .iter()
            .map(|config| PhaseDefinition {
                id: PhaseId::new(config.id.clone()),
                nodes: config.nodes.iter().map(NodeSpec::from_config).collect(),
                predecessor: config.predecessor.clone().map(PhaseId::new),
                required_artifacts: config.requires.clone(),
                node_artifacts: config
                    .node_requires
                    .iter()
                    .map(|(node, reqs)| (NodeId::new(node.clone()), reqs.clone()))
                    .collect(),
                custom_check: None,
                produces: config.produces.clone(),
            })
            .collect();

        tracing::debug!("Building plan with {} phases", self.phases.len());
        PhasePlan::new(phases)
    }
}
