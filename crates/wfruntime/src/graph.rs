use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::HashMap;
use wfcore::{CapabilityType, OutputRef, StepDefinition, Template, WorkflowError, WorkflowSpec};

/// A step with its inputs and config parsed into templates
#[derive(Debug, Clone)]
pub struct GraphStep {
    pub definition: StepDefinition,
    pub inputs: Template,
    pub config: Template,
}

impl GraphStep {
    fn new(definition: StepDefinition) -> Self {
        Self {
            inputs: definition.inputs.template(),
            config: Template::compile_map(&definition.config),
            definition,
        }
    }

    pub fn step_ref(&self) -> &str {
        &self.definition.step_ref
    }

    /// Every reference in inputs and (legacy form) config
    pub fn references(&self) -> Vec<&OutputRef> {
        let mut references = self.inputs.references();
        references.extend(self.config.references());
        references
    }
}

/// Execution order derived from the references between steps.
///
/// Edges run from the referenced step to the referencing one. Steps without any
/// reference depend on the trigger, so every step is reachable from it.
#[derive(Debug)]
pub struct DependencyGraph {
    graph: DiGraph<GraphStep, ()>,
    trigger: NodeIndex,
}

impl DependencyGraph {
    pub fn build(spec: &WorkflowSpec) -> Result<Self, WorkflowError> {
        if spec.triggers.len() != 1 {
            return Err(WorkflowError::TriggerCount(spec.triggers.len()));
        }

        let mut graph = DiGraph::new();
        let mut ref_to_index = HashMap::new();

        // Add all steps; targets are terminal and cannot be referenced
        for definition in spec.steps() {
            let referenceable = definition.capability_type != CapabilityType::Target;
            let step_ref = definition.step_ref.clone();
            let idx = graph.add_node(GraphStep::new(definition.clone()));
            if referenceable {
                ref_to_index.insert(step_ref, idx);
            }
        }

        let trigger = ref_to_index
            .get(&spec.triggers[0].step_ref)
            .copied()
            .ok_or(WorkflowError::TriggerCount(0))?;

        let mut edges = Vec::new();
        for idx in graph.node_indices() {
            let step = &graph[idx];
            check_malformed(step)?;

            let references = step.references();
            if references.is_empty() && idx != trigger {
                edges.push((trigger, idx));
            }
            for reference in references {
                let dependency = ref_to_index.get(&reference.step_ref).ok_or_else(|| {
                    WorkflowError::UnknownReference {
                        step_ref: step.step_ref().to_string(),
                        referenced: reference.step_ref.clone(),
                    }
                })?;
                edges.push((*dependency, idx));
            }
        }
        for (from, to) in edges {
            graph.update_edge(from, to, ());
        }

        if toposort(&graph, None).is_err() {
            return Err(WorkflowError::CyclicDependency);
        }

        Ok(Self { graph, trigger })
    }

    pub fn trigger(&self) -> &GraphStep {
        &self.graph[self.trigger]
    }

    pub(crate) fn trigger_index(&self) -> NodeIndex {
        self.trigger
    }

    pub(crate) fn step(&self, idx: NodeIndex) -> &GraphStep {
        &self.graph[idx]
    }

    pub(crate) fn indices(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph.node_indices()
    }

    pub(crate) fn dependencies_of(&self, idx: NodeIndex) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph.neighbors_directed(idx, Direction::Incoming)
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Refs of the steps `step_ref` waits for
    pub fn dependencies(&self, step_ref: &str) -> Vec<&str> {
        self.neighbors(step_ref, Direction::Incoming)
    }

    /// Refs of the steps waiting for `step_ref`
    pub fn dependents(&self, step_ref: &str) -> Vec<&str> {
        self.neighbors(step_ref, Direction::Outgoing)
    }

    fn neighbors(&self, step_ref: &str, direction: Direction) -> Vec<&str> {
        let mut refs: Vec<&str> = self
            .graph
            .node_indices()
            .filter(|idx| self.graph[*idx].step_ref() == step_ref)
            .flat_map(|idx| self.graph.neighbors_directed(idx, direction))
            .map(|idx| self.graph[idx].step_ref())
            .collect();
        refs.sort_unstable();
        refs.dedup();
        refs
    }

    /// One valid execution order, trigger first
    pub fn execution_order(&self) -> Vec<&str> {
        toposort(&self.graph, None)
            .map(|order| order.into_iter().map(|idx| self.graph[idx].step_ref()).collect())
            .unwrap_or_default()
    }
}

fn check_malformed(step: &GraphStep) -> Result<(), WorkflowError> {
    let mut malformed = wfcore::reference::malformed_references(&step.definition.inputs.to_value());
    malformed.extend(wfcore::reference::malformed_references(
        &wfcore::Value::Object(step.definition.config.clone()),
    ));
    match malformed.into_iter().next() {
        Some(reference) => Err(WorkflowError::MalformedReference {
            step_ref: step.step_ref().to_string(),
            reference,
        }),
        None => Ok(()),
    }
}
