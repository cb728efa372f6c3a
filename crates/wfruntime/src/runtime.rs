//! DON-mode and node-mode execution.
//!
//! A [`DonRuntime`] starts in DON mode, where every capability call stands for
//! one logical invocation by the whole network. Node mode is entered only
//! through [`DonRuntime::run_in_node_mode`]: the supplied computation runs once
//! per participant with a [`NodeRuntime`], and the observations are folded by a
//! [`ConsensusPolicy`] back into a single DON-wide value.

use crate::consensus::{ConsensusPolicy, Observation};
use crate::promise::Promise;
use crate::registry::CapabilityRegistry;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use wfcore::{
    CapabilityRequest, ExecutableCapability, ExecutionError, ModeError, RequestMetadata, Value,
    ValueMap,
};

/// Configuration for the runtime
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Participants simulated by node-mode computations
    pub participants: usize,
    /// Upper bound on steps executing at once in one run
    pub max_parallel_steps: usize,
    pub event_buffer_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            participants: 4,
            max_parallel_steps: 10,
            event_buffer_size: 1000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Don,
    Node,
}

/// Current mode of one runtime, shared by every handle derived from it
#[derive(Debug, Default)]
struct ModeCell {
    in_node_mode: AtomicBool,
}

impl ModeCell {
    fn get(&self) -> Mode {
        if self.in_node_mode.load(Ordering::SeqCst) {
            Mode::Node
        } else {
            Mode::Don
        }
    }

    fn enter_node(self: &Arc<Self>) -> Result<NodeModeGuard, ModeError> {
        self.in_node_mode
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| ModeError::DonModeCallInNodeMode)?;
        Ok(NodeModeGuard { cell: self.clone() })
    }
}

/// Returns the runtime to DON mode when dropped
struct NodeModeGuard {
    cell: Arc<ModeCell>,
}

impl Drop for NodeModeGuard {
    fn drop(&mut self) {
        self.cell.in_node_mode.store(false, Ordering::SeqCst);
    }
}

struct RuntimeInner {
    registry: Arc<CapabilityRegistry>,
    metadata: RequestMetadata,
    participants: usize,
    mode: Arc<ModeCell>,
}

impl RuntimeInner {
    fn request(&self, config: ValueMap, inputs: ValueMap) -> CapabilityRequest {
        CapabilityRequest {
            metadata: self.metadata.clone(),
            config,
            inputs,
        }
    }
}

/// Handle for DON-wide capability calls
#[derive(Clone)]
pub struct DonRuntime {
    inner: Arc<RuntimeInner>,
}

impl DonRuntime {
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        metadata: RequestMetadata,
        participants: usize,
    ) -> Self {
        Self {
            inner: Arc::new(RuntimeInner {
                registry,
                metadata,
                participants: participants.max(1),
                mode: Arc::new(ModeCell::default()),
            }),
        }
    }

    pub fn mode(&self) -> Mode {
        self.inner.mode.get()
    }

    pub fn participants(&self) -> usize {
        self.inner.participants
    }

    pub fn metadata(&self) -> &RequestMetadata {
        &self.inner.metadata
    }

    /// Resolve `id` from the registry and invoke it once for the whole DON
    pub fn call_capability(&self, id: &str, config: ValueMap, inputs: ValueMap) -> Promise<ValueMap> {
        if let Err(e) = self.ensure_don_mode() {
            return Promise::rejected(e);
        }

        let inner = self.inner.clone();
        let id = id.to_string();
        Promise::lazy(async move {
            let capability = inner.registry.get_executable(&id).await?;
            let request = inner.request(config, inputs);
            execute(capability, request).await
        })
    }

    /// Invoke an already resolved capability once for the whole DON
    pub fn invoke(
        &self,
        capability: Arc<dyn ExecutableCapability>,
        request: CapabilityRequest,
    ) -> Promise<ValueMap> {
        if let Err(e) = self.ensure_don_mode() {
            return Promise::rejected(e);
        }
        Promise::lazy(execute(capability, request))
    }

    /// Run `compute` once per participant and fold the observations with `policy`.
    ///
    /// A participant whose computation fails contributes an error observation;
    /// the others are still collected. Mode errors are programmer errors and
    /// abort the whole computation.
    pub fn run_in_node_mode<F, Fut>(&self, compute: F, policy: ConsensusPolicy) -> Promise<Value>
    where
        F: Fn(NodeRuntime) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ExecutionError>> + Send + 'static,
    {
        if let Err(e) = self.ensure_don_mode() {
            return Promise::rejected(e);
        }

        let inner = self.inner.clone();
        Promise::lazy(async move {
            let observations = {
                let _node_mode = inner.mode.enter_node()?;
                tracing::debug!(
                    "Entering node mode for {} participant(s) in {}",
                    inner.participants,
                    inner.metadata.reference_id
                );

                let mut observations = Vec::with_capacity(inner.participants);
                for participant in 0..inner.participants {
                    let node = NodeRuntime {
                        participant,
                        inner: inner.clone(),
                    };
                    match compute(node).await {
                        Ok(value) => observations.push(Observation::Value(value)),
                        Err(e) if e.is_mode_error() => return Err(e),
                        Err(e) => {
                            tracing::debug!("Participant {} failed: {}", participant, e);
                            observations.push(Observation::Error(e.to_string()));
                        }
                    }
                }
                observations
            };

            let folded = policy.fold(&observations);
            match &folded {
                Ok(_) => tracing::debug!(
                    "Reached {} consensus in {}",
                    policy.aggregation().as_str(),
                    inner.metadata.reference_id
                ),
                Err(e) => tracing::warn!("{} in {}", e, inner.metadata.reference_id),
            }
            folded
        })
    }

    fn ensure_don_mode(&self) -> Result<(), ModeError> {
        match self.mode() {
            Mode::Don => Ok(()),
            Mode::Node => Err(ModeError::DonModeCallInNodeMode),
        }
    }
}

/// Handle given to a node-mode computation for one participant
#[derive(Clone)]
pub struct NodeRuntime {
    participant: usize,
    inner: Arc<RuntimeInner>,
}

impl NodeRuntime {
    /// Index of the participant this computation runs as
    pub fn participant(&self) -> usize {
        self.participant
    }

    pub fn metadata(&self) -> &RequestMetadata {
        &self.inner.metadata
    }

    /// Invoke a capability locally, as this participant only
    pub fn call_capability(&self, id: &str, config: ValueMap, inputs: ValueMap) -> Promise<ValueMap> {
        if self.inner.mode.get() != Mode::Node {
            return Promise::rejected(ModeError::NodeModeCallInDonMode);
        }

        let inner = self.inner.clone();
        let id = id.to_string();
        Promise::lazy(async move {
            let capability = inner.registry.get_executable(&id).await?;
            let request = inner.request(config, inputs);
            execute(capability, request).await
        })
    }
}

async fn execute(
    capability: Arc<dyn ExecutableCapability>,
    request: CapabilityRequest,
) -> Result<ValueMap, ExecutionError> {
    let id = capability.info().id;
    capability
        .execute(request)
        .await
        .map_err(|e| ExecutionError::capability(id.to_string(), e))
}
