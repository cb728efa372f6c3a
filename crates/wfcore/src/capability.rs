use crate::{CapabilityError, IdError, ValueMap};
use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Kind of work a capability performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityType {
    Trigger,
    Action,
    Consensus,
    Target,
    Combined,
}

impl CapabilityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CapabilityType::Trigger => "trigger",
            CapabilityType::Action => "action",
            CapabilityType::Consensus => "consensus",
            CapabilityType::Target => "target",
            CapabilityType::Combined => "combined",
        }
    }

    /// Action, consensus and target capabilities are invoked through `execute`
    pub fn is_executable(&self) -> bool {
        matches!(
            self,
            CapabilityType::Action | CapabilityType::Consensus | CapabilityType::Target
        )
    }
}

impl fmt::Display for CapabilityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Versioned capability identity, written `name@MAJOR.MINOR.PATCH[-prerelease]`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CapabilityId {
    name: String,
    version: semver::Version,
}

impl CapabilityId {
    pub fn new(name: impl Into<String>, major: u64, minor: u64, patch: u64) -> Self {
        Self {
            name: name.into(),
            version: semver::Version::new(major, minor, patch),
        }
    }

    pub fn with_prerelease(mut self, tag: &str) -> Result<Self, IdError> {
        self.version.pre = semver::Prerelease::new(tag).map_err(|e| IdError::InvalidVersion {
            id: format!("{}@{}-{}", self.name, self.version, tag),
            reason: e.to_string(),
        })?;
        Ok(self)
    }

    pub fn parse(id: &str) -> Result<Self, IdError> {
        let (name, version) = id
            .split_once('@')
            .ok_or_else(|| IdError::MissingVersion(id.to_string()))?;

        if name.is_empty() {
            return Err(IdError::EmptyName(id.to_string()));
        }

        let mut version = semver::Version::parse(version).map_err(|e| IdError::InvalidVersion {
            id: id.to_string(),
            reason: e.to_string(),
        })?;
        version.build = semver::BuildMetadata::EMPTY;

        Ok(Self {
            name: name.to_string(),
            version,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn major(&self) -> u64 {
        self.version.major
    }

    pub fn minor(&self) -> u64 {
        self.version.minor
    }

    pub fn patch(&self) -> u64 {
        self.version.patch
    }

    pub fn prerelease(&self) -> Option<&str> {
        if self.version.pre.is_empty() {
            None
        } else {
            Some(self.version.pre.as_str())
        }
    }

    pub fn version(&self) -> &semver::Version {
        &self.version
    }

    /// Whether a capability registered under `self` can serve a request for `requested`.
    ///
    /// Same name, same major, (minor, patch) at least the requested pair, and a
    /// pre-release registration only serves a request carrying the identical tag.
    pub fn satisfies(&self, requested: &CapabilityId) -> bool {
        if self.name != requested.name || self.major() != requested.major() {
            return false;
        }
        if (self.minor(), self.patch()) < (requested.minor(), requested.patch()) {
            return false;
        }
        match self.prerelease() {
            Some(tag) => requested.prerelease() == Some(tag),
            None => true,
        }
    }
}

impl fmt::Display for CapabilityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

impl FromStr for CapabilityId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CapabilityId::parse(s)
    }
}

impl Serialize for CapabilityId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for CapabilityId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        CapabilityId::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Static description of a capability
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityInfo {
    pub id: CapabilityId,
    pub capability_type: CapabilityType,
    pub description: String,
}

impl CapabilityInfo {
    pub fn new(
        id: CapabilityId,
        capability_type: CapabilityType,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id,
            capability_type,
            description: description.into(),
        }
    }
}

/// Who is calling a capability, and from which step
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestMetadata {
    pub workflow_owner: String,
    pub workflow_name: String,
    pub workflow_execution_id: String,
    pub reference_id: String,
}

/// Arguments to [`ExecutableCapability::execute`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapabilityRequest {
    pub metadata: RequestMetadata,
    pub config: ValueMap,
    pub inputs: ValueMap,
}

/// Arguments to [`TriggerCapability::register_trigger`] and its unregister counterpart
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriggerRegistrationRequest {
    pub trigger_id: String,
    pub metadata: RequestMetadata,
    pub config: ValueMap,
}

/// One event produced by a trigger registration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub trigger_type: String,
    pub id: String,
    pub outputs: ValueMap,
}

pub trait BaseCapability: Send + Sync {
    fn info(&self) -> CapabilityInfo;
}

#[async_trait]
pub trait TriggerCapability: BaseCapability {
    /// Start delivering events for `request` on the returned channel
    async fn register_trigger(
        &self,
        request: TriggerRegistrationRequest,
    ) -> Result<mpsc::Receiver<TriggerEvent>, CapabilityError>;

    async fn unregister_trigger(
        &self,
        request: TriggerRegistrationRequest,
    ) -> Result<(), CapabilityError>;
}

#[async_trait]
pub trait ExecutableCapability: BaseCapability {
    async fn execute(&self, request: CapabilityRequest) -> Result<ValueMap, CapabilityError>;
}

/// A capability instance tagged with the capability set it implements
#[derive(Clone)]
pub enum Capability {
    Trigger(Arc<dyn TriggerCapability>),
    Executable(Arc<dyn ExecutableCapability>),
    Combined {
        trigger: Arc<dyn TriggerCapability>,
        executable: Arc<dyn ExecutableCapability>,
    },
}

impl Capability {
    pub fn trigger<T: TriggerCapability + 'static>(capability: Arc<T>) -> Self {
        Capability::Trigger(capability)
    }

    pub fn executable<E: ExecutableCapability + 'static>(capability: Arc<E>) -> Self {
        Capability::Executable(capability)
    }

    pub fn combined<C>(capability: Arc<C>) -> Self
    where
        C: TriggerCapability + ExecutableCapability + 'static,
    {
        Capability::Combined {
            trigger: capability.clone(),
            executable: capability,
        }
    }

    pub fn info(&self) -> CapabilityInfo {
        match self {
            Capability::Trigger(t) => t.info(),
            Capability::Executable(e) => e.info(),
            Capability::Combined { trigger, .. } => trigger.info(),
        }
    }

    /// Name of the implemented capability set, for diagnostics
    pub fn implemented(&self) -> &'static str {
        match self {
            Capability::Trigger(_) => "trigger",
            Capability::Executable(_) => "executable",
            Capability::Combined { .. } => "executable and trigger",
        }
    }

    /// Whether the declared capability type is served by the implemented set
    pub fn matches_declared_type(&self) -> bool {
        let declared = self.info().capability_type;
        match self {
            Capability::Trigger(_) => declared == CapabilityType::Trigger,
            Capability::Executable(_) => declared.is_executable(),
            Capability::Combined { .. } => declared == CapabilityType::Combined,
        }
    }

    pub fn as_trigger(&self) -> Option<Arc<dyn TriggerCapability>> {
        match self {
            Capability::Trigger(t) => Some(t.clone()),
            Capability::Combined { trigger, .. } => Some(trigger.clone()),
            Capability::Executable(_) => None,
        }
    }

    pub fn as_executable(&self) -> Option<Arc<dyn ExecutableCapability>> {
        match self {
            Capability::Executable(e) => Some(e.clone()),
            Capability::Combined { executable, .. } => Some(executable.clone()),
            Capability::Trigger(_) => None,
        }
    }

    /// Whether both handles point at the same capability instance
    pub fn same_instance(&self, other: &Capability) -> bool {
        self.data_ptr() == other.data_ptr()
    }

    fn data_ptr(&self) -> *const () {
        match self {
            Capability::Trigger(t) => Arc::as_ptr(t) as *const (),
            Capability::Executable(e) => Arc::as_ptr(e) as *const (),
            Capability::Combined { trigger, .. } => Arc::as_ptr(trigger) as *const (),
        }
    }
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capability")
            .field("id", &self.info().id.to_string())
            .field("implemented", &self.implemented())
            .finish()
    }
}
