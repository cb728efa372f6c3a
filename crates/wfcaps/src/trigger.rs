use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use tokio::sync::mpsc;
use uuid::Uuid;
use wfcore::{
    BaseCapability, CapabilityError, CapabilityId, CapabilityInfo, CapabilityType,
    TriggerCapability, TriggerEvent, TriggerRegistrationRequest, Value, ValueMap,
};

const EVENT_BUFFER: usize = 16;

fn event(id: &CapabilityId, outputs: ValueMap) -> TriggerEvent {
    TriggerEvent {
        trigger_type: id.to_string(),
        id: Uuid::new_v4().to_string(),
        outputs,
    }
}

/// Emits one fixed payload to every registration, then closes the channel.
///
/// A `payload` object in the registration config takes precedence over the
/// payload the trigger was built with.
pub struct StaticTrigger {
    id: CapabilityId,
    payload: ValueMap,
}

impl StaticTrigger {
    pub fn new(payload: ValueMap) -> Self {
        Self {
            id: CapabilityId::new("static-trigger", 1, 0, 0),
            payload,
        }
    }
}

impl Default for StaticTrigger {
    fn default() -> Self {
        Self::new(ValueMap::new())
    }
}

impl BaseCapability for StaticTrigger {
    fn info(&self) -> CapabilityInfo {
        CapabilityInfo::new(
            self.id.clone(),
            CapabilityType::Trigger,
            "Fires once with a fixed payload",
        )
    }
}

#[async_trait]
impl TriggerCapability for StaticTrigger {
    async fn register_trigger(
        &self,
        request: TriggerRegistrationRequest,
    ) -> Result<mpsc::Receiver<TriggerEvent>, CapabilityError> {
        let payload = match request.config.get("payload") {
            Some(Value::Object(payload)) => payload.clone(),
            Some(other) => {
                return Err(CapabilityError::InvalidInputType {
                    field: "payload".to_string(),
                    expected: "object".to_string(),
                    actual: other.kind().to_string(),
                })
            }
            None => self.payload.clone(),
        };

        let (tx, rx) = mpsc::channel(1);
        tx.try_send(event(&self.id, payload))
            .map_err(|e| CapabilityError::RegistrationFailed(e.to_string()))?;
        tracing::debug!("Static trigger fired for {}", request.trigger_id);
        Ok(rx)
    }

    async fn unregister_trigger(
        &self,
        _request: TriggerRegistrationRequest,
    ) -> Result<(), CapabilityError> {
        Ok(())
    }
}

/// Trigger fired by hand, one channel per registration.
///
/// Registrations whose trigger id was passed to [`ManualTrigger::rejecting`]
/// fail, which lets tests exercise partial replay failures.
pub struct ManualTrigger {
    id: CapabilityId,
    subscribers: Mutex<HashMap<String, mpsc::Sender<TriggerEvent>>>,
    rejected: HashSet<String>,
}

impl ManualTrigger {
    pub fn new(id: CapabilityId) -> Self {
        Self {
            id,
            subscribers: Mutex::new(HashMap::new()),
            rejected: HashSet::new(),
        }
    }

    /// Refuse registrations made under `trigger_id`
    pub fn rejecting(mut self, trigger_id: impl Into<String>) -> Self {
        self.rejected.insert(trigger_id.into());
        self
    }

    pub fn id(&self) -> &CapabilityId {
        &self.id
    }

    /// Send `outputs` to every live registration, returning how many received it
    pub fn fire(&self, outputs: ValueMap) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|_, tx| !tx.is_closed());
        subscribers
            .values()
            .filter(|tx| tx.try_send(event(&self.id, outputs.clone())).is_ok())
            .count()
    }

    /// Send `outputs` to one registration
    pub fn fire_to(&self, trigger_id: &str, outputs: ValueMap) -> bool {
        match self.subscribers.lock().get(trigger_id) {
            Some(tx) => tx.try_send(event(&self.id, outputs)).is_ok(),
            None => false,
        }
    }

    /// Registrations whose receiver is still open
    pub fn registration_count(&self) -> usize {
        self.subscribers
            .lock()
            .values()
            .filter(|tx| !tx.is_closed())
            .count()
    }
}

impl Default for ManualTrigger {
    fn default() -> Self {
        Self::new(CapabilityId::new("manual-trigger", 1, 0, 0))
    }
}

impl BaseCapability for ManualTrigger {
    fn info(&self) -> CapabilityInfo {
        CapabilityInfo::new(
            self.id.clone(),
            CapabilityType::Trigger,
            "Fires when told to",
        )
    }
}

#[async_trait]
impl TriggerCapability for ManualTrigger {
    async fn register_trigger(
        &self,
        request: TriggerRegistrationRequest,
    ) -> Result<mpsc::Receiver<TriggerEvent>, CapabilityError> {
        if self.rejected.contains(&request.trigger_id) {
            return Err(CapabilityError::RegistrationFailed(format!(
                "{} refuses registration {}",
                self.id, request.trigger_id
            )));
        }

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        self.subscribers.lock().insert(request.trigger_id, tx);
        Ok(rx)
    }

    async fn unregister_trigger(
        &self,
        request: TriggerRegistrationRequest,
    ) -> Result<(), CapabilityError> {
        match self.subscribers.lock().remove(&request.trigger_id) {
            Some(_) => Ok(()),
            None => Err(CapabilityError::UnknownRegistration(request.trigger_id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registration(trigger_id: &str) -> TriggerRegistrationRequest {
        TriggerRegistrationRequest {
            trigger_id: trigger_id.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_static_trigger_emits_payload_once() {
        let mut payload = ValueMap::new();
        payload.insert("cool_output".to_string(), Value::from("cool"));
        let trigger = StaticTrigger::new(payload.clone());

        let mut events = trigger.register_trigger(registration("r")).await.unwrap();
        let fired = events.recv().await.unwrap();
        assert_eq!(fired.outputs, payload);
        assert_eq!(fired.trigger_type, "static-trigger@1.0.0");
        assert!(events.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_static_trigger_rejects_non_object_payload() {
        let trigger = StaticTrigger::default();
        let mut request = registration("r");
        request.config.insert("payload".to_string(), Value::from(3));

        let err = trigger.register_trigger(request).await.unwrap_err();
        assert!(matches!(err, CapabilityError::InvalidInputType { .. }));
    }

    #[tokio::test]
    async fn test_manual_trigger_fire_and_unregister() {
        let trigger = ManualTrigger::default().rejecting("bad");
        let mut a = trigger.register_trigger(registration("a")).await.unwrap();
        let _b = trigger.register_trigger(registration("b")).await.unwrap();
        assert!(trigger.register_trigger(registration("bad")).await.is_err());
        assert_eq!(trigger.registration_count(), 2);

        assert_eq!(trigger.fire(ValueMap::new()), 2);
        assert!(a.recv().await.is_some());

        trigger.unregister_trigger(registration("a")).await.unwrap();
        assert!(!trigger.fire_to("a", ValueMap::new()));
        assert!(matches!(
            trigger.unregister_trigger(registration("a")).await,
            Err(CapabilityError::UnknownRegistration(_))
        ));
    }
}
