use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::capability::Capability;

/// Opaque handle a capability exposes for cross-capability calls. The core
/// stores and returns these without ever looking inside.
pub type ServiceHandle = Arc<dyn Any + Send + Sync>;

/// Identity, dependencies, and entry points of one analysis capability, as
/// handed to the registry by the capability's startup routine.
#[derive(Clone)]
pub struct CapabilityDescriptor {
    pub name: String,
    pub version: String,
    pub dependencies: BTreeSet<String>,
    pub entry_point: Option<Arc<dyn Capability>>,
    pub declared_services: HashMap<String, ServiceHandle>,
}

impl CapabilityDescriptor {
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        entry_point: Arc<dyn Capability>,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            dependencies: BTreeSet::new(),
            entry_point: Some(entry_point),
            declared_services: HashMap::new(),
        }
    }

    pub fn with_dependencies<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies
            .extend(dependencies.into_iter().map(Into::into));
        self
    }

    pub fn with_service(mut self, name: impl Into<String>, handle: ServiceHandle) -> Self {
        self.declared_services.insert(name.into(), handle);
        self
    }
}

impl fmt::Debug for CapabilityDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityDescriptor")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("dependencies", &self.dependencies)
            .field("services", &self.declared_services.keys())
            .finish()
    }
}

/// Serializable view of a registered capability for directory queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilitySummary {
    pub name: String,
    pub version: String,
    pub dependencies: Vec<String>,
    pub enabled: bool,
    pub broken_reason: Option<String>,
}
