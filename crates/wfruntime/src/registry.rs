use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use wfcore::{
    Capability, CapabilityError, CapabilityId, CapabilityInfo, ExecutableCapability,
    ExecutionError, RegistryError, ResolutionError, TriggerCapability, TriggerEvent,
    TriggerRegistrationRequest,
};

/// Default buffer of the channel handed to each trigger subscriber
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// A subscriber's registration, remembered so it survives a hot-swap of the trigger
struct TriggerRegistration {
    request: TriggerRegistrationRequest,
    sink: mpsc::Sender<TriggerEvent>,
    forwarder: Option<JoinHandle<()>>,
}

impl TriggerRegistration {
    fn stop_forwarding(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
    }
}

/// Versioned store of capability instances.
///
/// Lookups resolve a requested id against every registered version of the same
/// name (see [`CapabilityId::satisfies`]). Triggers registered through the registry
/// are brokered: subscribers receive a registry-owned channel, and their
/// registrations are replayed onto a new instance when the trigger is replaced.
pub struct CapabilityRegistry {
    capabilities: RwLock<HashMap<CapabilityId, Capability>>,
    registrations: RwLock<HashMap<CapabilityId, HashMap<String, TriggerRegistration>>>,
    channel_capacity: usize,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::with_channel_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_channel_capacity(channel_capacity: usize) -> Self {
        Self {
            capabilities: RwLock::new(HashMap::new()),
            registrations: RwLock::new(HashMap::new()),
            channel_capacity: channel_capacity.max(1),
        }
    }

    /// Register a capability.
    ///
    /// Outstanding trigger registrations remembered for this id are replayed onto
    /// the new instance. Registrations that fail to replay are dropped one by one
    /// and reported through [`RegistryError::PartialReplayFailure`]; the capability
    /// itself stays registered in that case.
    pub async fn add(&self, capability: Capability) -> Result<(), RegistryError> {
        let info = check_declared_type(&capability)?;

        {
            let mut capabilities = self.capabilities.write().await;
            if capabilities.contains_key(&info.id) {
                return Err(RegistryError::AlreadyExists(info.id.to_string()));
            }
            capabilities.insert(info.id.clone(), capability.clone());
        }
        tracing::info!("Registered capability {} ({})", info.id, info.capability_type);

        self.replay_registrations(&info.id, &capability).await
    }

    /// Swap in a new instance under an existing (or new) id, then replay its trigger registrations
    pub async fn replace(&self, capability: Capability) -> Result<(), RegistryError> {
        let info = check_declared_type(&capability)?;

        let previous = {
            let mut capabilities = self.capabilities.write().await;
            capabilities.insert(info.id.clone(), capability.clone())
        };
        if previous.is_some() {
            tracing::info!("Replaced capability {}", info.id);
        } else {
            tracing::info!("Registered capability {} ({})", info.id, info.capability_type);
        }

        self.replay_registrations(&info.id, &capability).await
    }

    /// Remove the capability registered under exactly `id`.
    ///
    /// Events from the removed instance stop flowing, but its subscribers'
    /// registrations are kept for replay onto a successor.
    pub async fn remove(&self, id: &str) -> Result<(), RegistryError> {
        let id = CapabilityId::parse(id)?;

        if self.capabilities.write().await.remove(&id).is_none() {
            return Err(RegistryError::NotFound(id.to_string()));
        }

        if let Some(registrations) = self.registrations.write().await.get_mut(&id) {
            registrations
                .values_mut()
                .for_each(TriggerRegistration::stop_forwarding);
        }
        tracing::info!("Removed capability {}", id);
        Ok(())
    }

    /// Resolve `id` to the best compatible registered capability.
    ///
    /// An exact match wins; otherwise the highest registered version that
    /// satisfies the request is returned.
    pub async fn get(&self, id: &str) -> Result<Capability, ResolutionError> {
        let requested = CapabilityId::parse(id)?;
        self.resolve(&requested)
            .await
            .map(|(_, capability)| capability)
    }

    async fn resolve(
        &self,
        requested: &CapabilityId,
    ) -> Result<(CapabilityId, Capability), ResolutionError> {
        let capabilities = self.capabilities.read().await;

        if let Some(capability) = capabilities.get(requested) {
            return Ok((requested.clone(), capability.clone()));
        }

        capabilities
            .iter()
            .filter(|(registered, _)| registered.satisfies(requested))
            .max_by(|(a, _), (b, _)| a.version().cmp(b.version()))
            .map(|(registered, capability)| (registered.clone(), capability.clone()))
            .ok_or_else(|| ResolutionError::NotFound(requested.to_string()))
    }

    pub async fn get_trigger(&self, id: &str) -> Result<Arc<dyn TriggerCapability>, ResolutionError> {
        self.get(id).await?.as_trigger().ok_or_else(|| ResolutionError::KindMismatch {
            id: id.to_string(),
            expected: "trigger",
        })
    }

    pub async fn get_executable(
        &self,
        id: &str,
    ) -> Result<Arc<dyn ExecutableCapability>, ResolutionError> {
        self.get(id).await?.as_executable().ok_or_else(|| ResolutionError::KindMismatch {
            id: id.to_string(),
            expected: "executable",
        })
    }

    /// Snapshot of registered capabilities, in no particular order
    pub async fn list(&self) -> Vec<CapabilityInfo> {
        self.capabilities
            .read()
            .await
            .values()
            .map(Capability::info)
            .collect()
    }

    /// Register with the trigger resolved from `id` and receive its events.
    ///
    /// The returned channel belongs to the registry and keeps delivering events
    /// across hot-swaps of the trigger instance.
    pub async fn register_trigger(
        &self,
        id: &str,
        request: TriggerRegistrationRequest,
    ) -> Result<mpsc::Receiver<TriggerEvent>, ExecutionError> {
        let requested = CapabilityId::parse(id).map_err(ResolutionError::from)?;
        let (resolved, capability) = self.resolve(&requested).await?;
        let trigger = capability.as_trigger().ok_or_else(|| ResolutionError::KindMismatch {
            id: id.to_string(),
            expected: "trigger",
        })?;

        let upstream = trigger
            .register_trigger(request.clone())
            .await
            .map_err(|e| ExecutionError::capability(resolved.to_string(), e))?;

        let (sink, events) = mpsc::channel(self.channel_capacity);
        let forwarder = spawn_forwarder(upstream, sink.clone());

        let mut registrations = self.registrations.write().await;
        let previous = registrations.entry(resolved.clone()).or_default().insert(
            request.trigger_id.clone(),
            TriggerRegistration {
                request,
                sink,
                forwarder: Some(forwarder),
            },
        );
        if let Some(mut previous) = previous {
            previous.stop_forwarding();
        }
        tracing::debug!("Trigger {} has a new subscriber", resolved);

        Ok(events)
    }

    /// Release a registration made through [`CapabilityRegistry::register_trigger`]
    pub async fn unregister_trigger(
        &self,
        id: &str,
        request: TriggerRegistrationRequest,
    ) -> Result<(), ExecutionError> {
        let requested = CapabilityId::parse(id).map_err(ResolutionError::from)?;
        let (resolved, capability) = self.resolve(&requested).await?;
        let trigger = capability.as_trigger().ok_or_else(|| ResolutionError::KindMismatch {
            id: id.to_string(),
            expected: "trigger",
        })?;

        let removed = self
            .registrations
            .write()
            .await
            .get_mut(&resolved)
            .and_then(|registrations| registrations.remove(&request.trigger_id));
        match removed {
            Some(mut registration) => registration.stop_forwarding(),
            None => {
                return Err(ExecutionError::capability(
                    resolved.to_string(),
                    CapabilityError::UnknownRegistration(request.trigger_id),
                ))
            }
        }

        trigger
            .unregister_trigger(request)
            .await
            .map_err(|e| ExecutionError::capability(resolved.to_string(), e))
    }

    /// Number of registrations remembered for `id`
    pub async fn registration_count(&self, id: &str) -> usize {
        match CapabilityId::parse(id) {
            Ok(id) => self
                .registrations
                .read()
                .await
                .get(&id)
                .map_or(0, HashMap::len),
            Err(_) => 0,
        }
    }

    async fn replay_registrations(
        &self,
        id: &CapabilityId,
        capability: &Capability,
    ) -> Result<(), RegistryError> {
        let Some(trigger) = capability.as_trigger() else {
            return Ok(());
        };

        // Snapshot outside the lock; replays call into the capability.
        let pending: Vec<(String, TriggerRegistrationRequest, mpsc::Sender<TriggerEvent>)> = {
            let mut registrations = self.registrations.write().await;
            let Some(remembered) = registrations.get_mut(id) else {
                return Ok(());
            };
            remembered.retain(|_, r| !r.sink.is_closed());
            remembered
                .iter_mut()
                .map(|(trigger_id, r)| {
                    r.stop_forwarding();
                    (trigger_id.clone(), r.request.clone(), r.sink.clone())
                })
                .collect()
        };

        let mut replayed = Vec::new();
        let mut failed = Vec::new();
        for (trigger_id, request, sink) in pending {
            match trigger.register_trigger(request).await {
                Ok(upstream) => replayed.push((trigger_id, spawn_forwarder(upstream, sink))),
                Err(e) => {
                    tracing::warn!("Dropping registration {} on {}: {}", trigger_id, id, e);
                    failed.push(trigger_id);
                }
            }
        }

        let succeeded = replayed.len();
        let mut registrations = self.registrations.write().await;
        let remembered = registrations.entry(id.clone()).or_default();
        for trigger_id in &failed {
            remembered.remove(trigger_id);
        }
        for (trigger_id, forwarder) in replayed {
            match remembered.get_mut(&trigger_id) {
                Some(registration) => {
                    registration.stop_forwarding();
                    registration.forwarder = Some(forwarder);
                }
                // Unregistered while the replay was in flight
                None => forwarder.abort(),
            }
        }
        tracing::info!(
            "Replayed {} registration(s) onto {}, {} failed",
            succeeded,
            id,
            failed.len()
        );

        if failed.is_empty() {
            Ok(())
        } else {
            Err(RegistryError::PartialReplayFailure {
                id: id.to_string(),
                failed,
            })
        }
    }
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn check_declared_type(capability: &Capability) -> Result<CapabilityInfo, RegistryError> {
    let info = capability.info();
    if !capability.matches_declared_type() {
        return Err(RegistryError::TypeMismatch {
            id: info.id.to_string(),
            declared: info.capability_type,
            implemented: capability.implemented(),
        });
    }
    Ok(info)
}

fn spawn_forwarder(
    mut upstream: mpsc::Receiver<TriggerEvent>,
    sink: mpsc::Sender<TriggerEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = upstream.recv().await {
            if sink.send(event).await.is_err() {
                break;
            }
        }
    })
}
