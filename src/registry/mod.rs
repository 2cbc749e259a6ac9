pub mod validator;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use log::warn;
use semver::Version;

use crate::capability::Capability;
use crate::error::{RegistrationError, SchedulingError};
use crate::types::{CapabilityDescriptor, CapabilitySummary, ServiceHandle};

struct RegistryEntry {
    descriptor: CapabilityDescriptor,
    version: Version,
    enabled: bool,
    broken_reason: Option<String>,
}

impl RegistryEntry {
    fn summary(&self) -> CapabilitySummary {
        CapabilitySummary {
            name: self.descriptor.name.clone(),
            version: self.descriptor.version.clone(),
            dependencies: self.descriptor.dependencies.iter().cloned().collect(),
            enabled: self.enabled,
            broken_reason: self.broken_reason.clone(),
        }
    }
}

struct RegistryInner {
    entries: HashMap<String, RegistryEntry>,
    order: Vec<String>,
}

/// In-memory capability directory. Constructed once at process start and
/// handed by reference to every component that needs it; there is no global
/// instance.
pub struct Registry {
    inner: RwLock<RegistryInner>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RegistryInner {
                entries: HashMap::new(),
                order: Vec::new(),
            }),
        }
    }

    /// Admits a descriptor into the directory, disabled. Dependency
    /// satisfaction is checked by `validate`/`activate`, not here, so
    /// capabilities may register in any order at startup.
    pub fn register(&self, descriptor: CapabilityDescriptor) -> Result<(), RegistrationError> {
        let version = check_descriptor(&descriptor)?;
        let mut inner = self.inner.write().unwrap();
        if inner.entries.contains_key(&descriptor.name) {
            return Err(RegistrationError::DuplicateCapability(descriptor.name));
        }
        inner.order.push(descriptor.name.clone());
        inner.entries.insert(
            descriptor.name.clone(),
            RegistryEntry {
                descriptor,
                version,
                enabled: false,
                broken_reason: None,
            },
        );
        Ok(())
    }

    /// Checks dependency satisfaction and acyclicity of the graph formed by
    /// all registered descriptors plus the candidate. Reports every missing
    /// dependency at once so the caller can fix them in one pass.
    pub fn validate(&self, descriptor: &CapabilityDescriptor) -> Result<(), RegistrationError> {
        let inner = self.inner.read().unwrap();
        validator::validate(descriptor, &dependency_graph(&inner))
    }

    /// Re-validates and enables a registered capability, making it visible
    /// to the scheduler's lookup.
    pub fn activate(&self, name: &str) -> Result<(), RegistrationError> {
        let mut inner = self.inner.write().unwrap();
        let graph = dependency_graph(&inner);
        let entry = inner.entries.get_mut(name).ok_or_else(|| {
            RegistrationError::InvalidDescriptor(format!("capability `{name}` is not registered"))
        })?;
        validator::validate(&entry.descriptor, &graph)?;
        entry.enabled = true;
        entry.broken_reason = None;
        Ok(())
    }

    /// Replaces a registered descriptor with a strictly newer version. The
    /// replacement comes back disabled and must be re-activated; in-flight
    /// job gating and cache invalidation are the engine's responsibility.
    pub fn upgrade(&self, descriptor: CapabilityDescriptor) -> Result<(), RegistrationError> {
        let version = check_descriptor(&descriptor)?;
        let mut inner = self.inner.write().unwrap();
        let entry = inner.entries.get_mut(&descriptor.name).ok_or_else(|| {
            RegistrationError::InvalidDescriptor(format!(
                "capability `{}` is not registered",
                descriptor.name
            ))
        })?;
        if version <= entry.version {
            return Err(RegistrationError::UpgradeBlocked {
                name: descriptor.name,
                reason: format!(
                    "version {version} does not supersede registered {}",
                    entry.version
                ),
            });
        }
        entry.descriptor = descriptor;
        entry.version = version;
        entry.enabled = false;
        entry.broken_reason = None;
        Ok(())
    }

    /// Removes a capability, then lazily re-validates the rest: anything
    /// left with a missing or disabled dependency is disabled in place with
    /// a `broken_reason`, cascading to a fixpoint.
    pub fn deregister(&self, name: &str) -> bool {
        let mut inner = self.inner.write().unwrap();
        if inner.entries.remove(name).is_none() {
            return false;
        }
        inner.order.retain(|n| n != name);

        loop {
            let mut newly_broken: Vec<(String, String)> = Vec::new();
            for (entry_name, entry) in &inner.entries {
                if !entry.enabled {
                    continue;
                }
                for dep in &entry.descriptor.dependencies {
                    let reason = match inner.entries.get(dep) {
                        None => Some(format!("unresolved dependency: {dep}")),
                        Some(d) if !d.enabled => Some(format!("dependency `{dep}` is disabled")),
                        Some(_) => None,
                    };
                    if let Some(reason) = reason {
                        newly_broken.push((entry_name.clone(), reason));
                        break;
                    }
                }
            }
            if newly_broken.is_empty() {
                break;
            }
            for (entry_name, reason) in newly_broken {
                warn!("disabling capability `{entry_name}`: {reason}");
                if let Some(entry) = inner.entries.get_mut(&entry_name) {
                    entry.enabled = false;
                    entry.broken_reason = Some(reason);
                }
            }
        }
        true
    }

    pub fn describe(&self, name: &str) -> Option<CapabilitySummary> {
        let inner = self.inner.read().unwrap();
        inner.entries.get(name).map(RegistryEntry::summary)
    }

    /// Registration-order listing, deterministic across calls.
    pub fn list(&self) -> Vec<CapabilitySummary> {
        let inner = self.inner.read().unwrap();
        inner
            .order
            .iter()
            .filter_map(|name| inner.entries.get(name))
            .map(RegistryEntry::summary)
            .collect()
    }

    /// Scheduler-facing lookup: only enabled, unbroken capabilities resolve.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Capability>, SchedulingError> {
        let inner = self.inner.read().unwrap();
        inner
            .entries
            .get(name)
            .filter(|entry| entry.enabled && entry.broken_reason.is_none())
            .and_then(|entry| entry.descriptor.entry_point.clone())
            .ok_or_else(|| SchedulingError::UnknownCapability(name.to_string()))
    }

    /// Opaque sub-service lookup for cross-capability calls.
    pub fn service(&self, capability: &str, service: &str) -> Option<ServiceHandle> {
        let inner = self.inner.read().unwrap();
        inner
            .entries
            .get(capability)
            .and_then(|entry| entry.descriptor.declared_services.get(service).cloned())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.read().unwrap().entries.contains_key(name)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

fn check_descriptor(descriptor: &CapabilityDescriptor) -> Result<Version, RegistrationError> {
    if descriptor.name.trim().is_empty() {
        return Err(RegistrationError::InvalidDescriptor(
            "name must not be empty".to_string(),
        ));
    }
    if descriptor.entry_point.is_none() {
        return Err(RegistrationError::InvalidDescriptor(format!(
            "capability `{}` declares no entry point",
            descriptor.name
        )));
    }
    Version::parse(&descriptor.version).map_err(|e| {
        RegistrationError::InvalidDescriptor(format!(
            "capability `{}` has invalid version `{}`: {e}",
            descriptor.name, descriptor.version
        ))
    })
}

fn dependency_graph(inner: &RegistryInner) -> validator::DependencyGraph {
    inner
        .entries
        .values()
        .map(|entry| {
            (
                entry.descriptor.name.clone(),
                entry.descriptor.dependencies.clone(),
            )
        })
        .collect()
}
