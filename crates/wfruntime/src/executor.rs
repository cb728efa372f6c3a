use crate::consensus::ConsensusPolicy;
use crate::graph::{DependencyGraph, GraphStep};
use crate::registry::CapabilityRegistry;
use crate::runtime::{DonRuntime, NodeRuntime, RuntimeConfig};
use chrono::Utc;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use petgraph::graph::NodeIndex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use wfcore::{
    Capability, CapabilityRequest, EventBus, ExecutableCapability, ExecutionError,
    ExecutionEvent, ExecutionId, FlowError, OutputRef, RequestMetadata, ResolutionError,
    TriggerRegistrationRequest, Value, ValueMap, WorkflowSpec,
};

/// Inputs a step ran with and the outputs it produced
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionResult {
    pub inputs: ValueMap,
    pub outputs: ValueMap,
}

/// Append-only record of executed steps, keyed by step ref.
///
/// Target refs may repeat, so every ref maps to the results in completion order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ResultsTable {
    entries: HashMap<String, Vec<ExecutionResult>>,
}

impl ResultsTable {
    /// First result recorded under `step_ref`
    pub fn get(&self, step_ref: &str) -> Option<&ExecutionResult> {
        self.entries.get(step_ref).and_then(|r| r.first())
    }

    pub fn get_all(&self, step_ref: &str) -> &[ExecutionResult] {
        self.entries.get(step_ref).map_or(&[], Vec::as_slice)
    }

    pub fn contains(&self, step_ref: &str) -> bool {
        self.entries.contains_key(step_ref)
    }

    /// Number of recorded results
    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn refs(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    fn append(&mut self, step_ref: &str, result: ExecutionResult) {
        self.entries
            .entry(step_ref.to_string())
            .or_default()
            .push(result);
    }

    /// Value at `reference`, looked up in the outputs of its step
    fn resolve(&self, reference: &OutputRef) -> Option<Value> {
        let outputs = &self.get(&reference.step_ref)?.outputs;
        match reference.path.split_first() {
            None => Some(Value::Object(outputs.clone())),
            Some((field, rest)) => outputs.get(field)?.get_path(rest).cloned(),
        }
    }
}

/// Outcome of a successful run
#[derive(Debug, Clone)]
pub struct RunReport {
    pub execution_id: ExecutionId,
    pub results: ResultsTable,
    pub completed_steps: usize,
    pub total_steps: usize,
}

/// First fatal error of a run, with the results produced before it
#[derive(Debug, thiserror::Error)]
#[error("workflow run failed: {error}")]
pub struct RunFailure {
    #[source]
    pub error: FlowError,
    pub results: ResultsTable,
}

type NodeCompute =
    Arc<dyn Fn(NodeRuntime, ValueMap) -> BoxFuture<'static, Result<Value, ExecutionError>> + Send + Sync>;

/// Per-participant computation standing in for a step's capability
#[derive(Clone)]
pub struct NodeStep {
    policy: ConsensusPolicy,
    compute: NodeCompute,
}

impl NodeStep {
    /// `compute` receives the participant's runtime and the step's interpolated inputs
    pub fn new<F, Fut>(policy: ConsensusPolicy, compute: F) -> Self
    where
        F: Fn(NodeRuntime, ValueMap) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ExecutionError>> + Send + 'static,
    {
        Self {
            policy,
            compute: Arc::new(move |node, inputs| Box::pin(compute(node, inputs))),
        }
    }

    pub fn policy(&self) -> &ConsensusPolicy {
        &self.policy
    }

    async fn run(
        &self,
        runtime: &DonRuntime,
        inputs: ValueMap,
        failures: Arc<AtomicUsize>,
    ) -> Result<ValueMap, ExecutionError> {
        let compute = self.compute.clone();
        let consensus = runtime.run_in_node_mode(
            move |node| {
                let observation = compute(node, inputs.clone());
                let failures = failures.clone();
                async move {
                    let observation = observation.await;
                    if observation.is_err() {
                        failures.fetch_add(1, Ordering::SeqCst);
                    }
                    observation
                }
            },
            self.policy.clone(),
        );

        match consensus.wait().await? {
            Value::Object(outputs) => Ok(outputs),
            other => {
                let mut outputs = ValueMap::new();
                outputs.insert("value".to_string(), other);
                Ok(outputs)
            }
        }
    }
}

/// Executes a workflow spec against a capability registry
pub struct Runner {
    registry: Arc<CapabilityRegistry>,
    config: RuntimeConfig,
    event_bus: Arc<EventBus>,
    overrides: HashMap<String, Capability>,
    node_steps: HashMap<String, NodeStep>,
}

struct StepOutcome {
    idx: NodeIndex,
    inputs: ValueMap,
    result: Result<ValueMap, ExecutionError>,
    duration_ms: u64,
}

impl Runner {
    pub fn new(registry: Arc<CapabilityRegistry>) -> Self {
        Self::with_config(registry, RuntimeConfig::default())
    }

    pub fn with_config(registry: Arc<CapabilityRegistry>, mut config: RuntimeConfig) -> Self {
        // A zero bound would schedule nothing and still report success
        config.max_parallel_steps = config.max_parallel_steps.max(1);
        let event_bus = Arc::new(EventBus::new(config.event_buffer_size));
        Self {
            registry,
            config,
            event_bus,
            overrides: HashMap::new(),
            node_steps: HashMap::new(),
        }
    }

    /// Use `capability` for the step `step_ref` instead of resolving its id
    pub fn override_step(&mut self, step_ref: impl Into<String>, capability: Capability) -> &mut Self {
        self.overrides.insert(step_ref.into(), capability);
        self
    }

    /// Compute the step `step_ref` per participant and fold the results with consensus
    pub fn node_step(&mut self, step_ref: impl Into<String>, step: NodeStep) -> &mut Self {
        self.node_steps.insert(step_ref.into(), step);
        self
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<ExecutionEvent> {
        self.event_bus.subscribe()
    }

    /// Run `spec` once: fire its trigger, then walk the dependency graph
    pub async fn run(&self, spec: &WorkflowSpec) -> Result<RunReport, RunFailure> {
        let execution_id = ExecutionId::new_v4();
        let start_time = Instant::now();

        self.event_bus.emit(ExecutionEvent::WorkflowStarted {
            execution_id,
            workflow_owner: spec.owner.clone(),
            workflow_name: spec.name.clone(),
            timestamp: Utc::now(),
        });
        tracing::info!("Starting workflow {} ({})", spec.name, execution_id);

        let mut results = ResultsTable::default();
        let outcome = self.walk(spec, execution_id, &mut results).await;

        let duration_ms = start_time.elapsed().as_millis() as u64;
        self.event_bus.emit(ExecutionEvent::WorkflowCompleted {
            execution_id,
            success: outcome.is_ok(),
            duration_ms,
            timestamp: Utc::now(),
        });

        match outcome {
            Ok(()) => {
                tracing::info!("Workflow {} completed in {}ms", spec.name, duration_ms);
                Ok(RunReport {
                    execution_id,
                    completed_steps: results.len(),
                    total_steps: spec.step_count(),
                    results,
                })
            }
            Err(error) => {
                tracing::error!("Workflow {} failed: {}", spec.name, error);
                Err(RunFailure { error, results })
            }
        }
    }

    async fn walk(
        &self,
        spec: &WorkflowSpec,
        execution_id: ExecutionId,
        results: &mut ResultsTable,
    ) -> Result<(), FlowError> {
        let graph = DependencyGraph::build(spec)?;

        let trigger = graph.trigger();
        let trigger_outputs = self
            .fire_trigger(trigger, self.metadata(spec, execution_id, trigger.step_ref()))
            .await?;
        results.append(
            trigger.step_ref(),
            ExecutionResult {
                inputs: ValueMap::new(),
                outputs: trigger_outputs,
            },
        );

        let mut completed: HashSet<NodeIndex> = HashSet::from([graph.trigger_index()]);
        let mut scheduled = completed.clone();
        let mut running = FuturesUnordered::new();
        let mut first_error: Option<FlowError> = None;

        loop {
            // After the first failure, only drain what is already running
            if first_error.is_none() {
                for idx in self.find_ready_steps(&graph, &completed, &scheduled) {
                    if running.len() >= self.config.max_parallel_steps {
                        break;
                    }
                    scheduled.insert(idx);

                    let step = graph.step(idx);
                    let (inputs, config) = match interpolate(step, results) {
                        Ok(rendered) => rendered,
                        Err(e) => {
                            self.step_failed(execution_id, step.step_ref(), &e);
                            first_error = Some(e.into());
                            break;
                        }
                    };

                    self.event_bus.emit(ExecutionEvent::StepStarted {
                        execution_id,
                        step_ref: step.step_ref().to_string(),
                        capability_id: step.definition.id.clone(),
                        timestamp: Utc::now(),
                    });

                    let metadata = self.metadata(spec, execution_id, step.step_ref());
                    running.push(tokio::spawn(
                        self.step_task(execution_id, idx, step, metadata, config, inputs),
                    ));
                }
            }

            // If nothing is running, nothing more can become ready
            if running.is_empty() {
                break;
            }

            if let Some(joined) = running.next().await {
                let outcome = joined.map_err(|e| FlowError::TaskJoin(e.to_string()))?;
                let step_ref = graph.step(outcome.idx).step_ref();

                match outcome.result {
                    Ok(outputs) => {
                        tracing::info!("Step {} completed in {}ms", step_ref, outcome.duration_ms);
                        self.event_bus.emit(ExecutionEvent::StepCompleted {
                            execution_id,
                            step_ref: step_ref.to_string(),
                            duration_ms: outcome.duration_ms,
                            timestamp: Utc::now(),
                        });
                        results.append(
                            step_ref,
                            ExecutionResult {
                                inputs: outcome.inputs,
                                outputs,
                            },
                        );
                        completed.insert(outcome.idx);
                    }
                    Err(e) => {
                        self.step_failed(execution_id, step_ref, &e);
                        if first_error.is_none() {
                            first_error = Some(e.into());
                        }
                    }
                }
            }
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Steps not yet scheduled whose dependencies have all completed
    fn find_ready_steps(
        &self,
        graph: &DependencyGraph,
        completed: &HashSet<NodeIndex>,
        scheduled: &HashSet<NodeIndex>,
    ) -> Vec<NodeIndex> {
        graph
            .indices()
            .filter(|idx| !scheduled.contains(idx))
            .filter(|idx| graph.dependencies_of(*idx).all(|dep| completed.contains(&dep)))
            .collect()
    }

    fn step_task(
        &self,
        execution_id: ExecutionId,
        idx: NodeIndex,
        step: &GraphStep,
        metadata: RequestMetadata,
        config: ValueMap,
        inputs: ValueMap,
    ) -> impl Future<Output = StepOutcome> + Send + 'static {
        let registry = self.registry.clone();
        let event_bus = self.event_bus.clone();
        let participants = self.config.participants;
        let step_ref = step.step_ref().to_string();
        let capability_id = step.definition.id.clone();
        let node_step = self.node_steps.get(&step_ref).cloned();
        let override_capability = self.overrides.get(&step_ref).cloned();

        async move {
            let start = Instant::now();
            let runtime = DonRuntime::new(registry.clone(), metadata.clone(), participants);

            let result = match node_step {
                Some(node_step) => {
                    let failures = Arc::new(AtomicUsize::new(0));
                    let result = node_step.run(&runtime, inputs.clone(), failures.clone()).await;
                    event_bus.emit(ExecutionEvent::ConsensusCompleted {
                        execution_id,
                        step_ref: step_ref.clone(),
                        policy: node_step.policy().aggregation().as_str().to_string(),
                        participants,
                        failed_participants: failures.load(Ordering::SeqCst),
                        reached: result.is_ok(),
                        timestamp: Utc::now(),
                    });
                    result
                }
                None => {
                    match resolve_executable(&registry, override_capability, &step_ref, &capability_id).await {
                        Ok(capability) => {
                            let request = CapabilityRequest {
                                metadata,
                                config,
                                inputs: inputs.clone(),
                            };
                            runtime.invoke(capability, request).wait().await
                        }
                        Err(e) => Err(e),
                    }
                }
            };

            StepOutcome {
                idx,
                inputs,
                result,
                duration_ms: start.elapsed().as_millis() as u64,
            }
        }
    }

    /// Register with the trigger, take its first event as the trigger's outputs, then unregister
    async fn fire_trigger(
        &self,
        step: &GraphStep,
        metadata: RequestMetadata,
    ) -> Result<ValueMap, ExecutionError> {
        let step_ref = step.step_ref();
        let capability_id = &step.definition.id;
        let (_, config) = interpolate(step, &ResultsTable::default())?;
        let request = TriggerRegistrationRequest {
            trigger_id: format!("{}:{}", metadata.workflow_execution_id, step_ref),
            metadata,
            config,
        };

        let event = match self.overrides.get(step_ref) {
            Some(capability) => {
                let trigger = capability.as_trigger().ok_or_else(|| ResolutionError::KindMismatch {
                    id: capability_id.clone(),
                    expected: "trigger",
                })?;
                let mut events = trigger
                    .register_trigger(request.clone())
                    .await
                    .map_err(|e| ExecutionError::capability(capability_id.clone(), e))?;
                let event = events.recv().await;
                if let Err(e) = trigger.unregister_trigger(request.clone()).await {
                    tracing::warn!("Failed to unregister trigger {}: {}", step_ref, e);
                }
                event
            }
            None => {
                let mut events = self
                    .registry
                    .register_trigger(capability_id, request.clone())
                    .await
                    .map_err(|e| no_mock(e, step_ref, capability_id))?;
                let event = events.recv().await;
                if let Err(e) = self.registry.unregister_trigger(capability_id, request.clone()).await {
                    tracing::warn!("Failed to unregister trigger {}: {}", step_ref, e);
                }
                event
            }
        };

        event.map(|e| e.outputs).ok_or(ExecutionError::TriggerClosed {
            trigger_id: request.trigger_id,
        })
    }

    fn metadata(&self, spec: &WorkflowSpec, execution_id: ExecutionId, step_ref: &str) -> RequestMetadata {
        RequestMetadata {
            workflow_owner: spec.owner.clone(),
            workflow_name: spec.name.clone(),
            workflow_execution_id: execution_id.to_string(),
            reference_id: step_ref.to_string(),
        }
    }

    fn step_failed(&self, execution_id: ExecutionId, step_ref: &str, error: &ExecutionError) {
        tracing::error!("Step {} failed: {}", step_ref, error);
        self.event_bus.emit(ExecutionEvent::StepFailed {
            execution_id,
            step_ref: step_ref.to_string(),
            error: error.to_string(),
            timestamp: Utc::now(),
        });
    }
}

/// Per-step override first, then the registry
async fn resolve_executable(
    registry: &CapabilityRegistry,
    override_capability: Option<Capability>,
    step_ref: &str,
    capability_id: &str,
) -> Result<Arc<dyn ExecutableCapability>, ExecutionError> {
    match override_capability {
        Some(capability) => capability.as_executable().ok_or_else(|| {
            ResolutionError::KindMismatch {
                id: capability_id.to_string(),
                expected: "executable",
            }
            .into()
        }),
        None => registry
            .get_executable(capability_id)
            .await
            .map_err(|e| no_mock(e.into(), step_ref, capability_id)),
    }
}

fn no_mock(error: ExecutionError, step_ref: &str, capability_id: &str) -> ExecutionError {
    match error {
        ExecutionError::Resolution(ResolutionError::NotFound(_)) => ExecutionError::NoMock {
            step_ref: step_ref.to_string(),
            capability_id: capability_id.to_string(),
        },
        other => other,
    }
}

/// Render a step's inputs and config against the results recorded so far
fn interpolate(step: &GraphStep, results: &ResultsTable) -> Result<(ValueMap, ValueMap), ExecutionError> {
    let step_ref = step.step_ref();
    let resolve = |reference: &OutputRef| {
        results
            .resolve(reference)
            .ok_or_else(|| ExecutionError::UnresolvedReference {
                step_ref: step_ref.to_string(),
                reference: reference.to_string(),
            })
    };

    let inputs = into_map(step.inputs.render(&resolve)?, step_ref)?;
    let config = into_map(step.config.render(&resolve)?, step_ref)?;
    Ok((inputs, config))
}

fn into_map(value: Value, step_ref: &str) -> Result<ValueMap, ExecutionError> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(ExecutionError::InvalidInputs {
            step_ref: step_ref.to_string(),
            reason: format!("expected an object, got {}", other.kind()),
        }),
    }
}
