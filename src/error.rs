use thiserror::Error;

use crate::types::JobId;

/// Failures raised while registering, validating, or upgrading capabilities.
/// These are fatal for the offending capability only and are never retried
/// automatically.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistrationError {
    #[error("capability `{0}` is already registered")]
    DuplicateCapability(String),
    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(String),
    #[error("unresolved dependencies: {}", missing.join(", "))]
    UnresolvedDependency { missing: Vec<String> },
    #[error("cyclic dependency: {}", cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },
    #[error("capability `{name}` cannot be upgraded: {reason}")]
    UpgradeBlocked { name: String, reason: String },
}

impl RegistrationError {
    pub fn kind(&self) -> &'static str {
        match self {
            RegistrationError::DuplicateCapability(_) => "duplicate_capability",
            RegistrationError::InvalidDescriptor(_) => "invalid_descriptor",
            RegistrationError::UnresolvedDependency { .. } => "unresolved_dependency",
            RegistrationError::CyclicDependency { .. } => "cyclic_dependency",
            RegistrationError::UpgradeBlocked { .. } => "upgrade_blocked",
        }
    }
}

/// Failures returned synchronously from submit/cancel/status calls. Never
/// delivered as a streamed frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulingError {
    #[error("unknown capability `{0}`")]
    UnknownCapability(String),
    #[error("scheduler saturated: backlog limit of {0} jobs reached")]
    SchedulerSaturated(usize),
    #[error("unknown job {0}")]
    UnknownJob(JobId),
}

impl SchedulingError {
    pub fn kind(&self) -> &'static str {
        match self {
            SchedulingError::UnknownCapability(_) => "unknown_capability",
            SchedulingError::SchedulerSaturated(_) => "scheduler_saturated",
            SchedulingError::UnknownJob(_) => "unknown_job",
        }
    }
}

/// Failures local to one streaming subscription. Tearing one down never
/// affects the job or other subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("resync required: earliest buffered sequence is {earliest}")]
    ResyncRequired { earliest: u64 },
    #[error("subscriber exceeded the backpressure timeout")]
    BackpressureTimeout,
}

impl ChannelError {
    pub fn kind(&self) -> &'static str {
        match self {
            ChannelError::ResyncRequired { .. } => "resync_required",
            ChannelError::BackpressureTimeout => "backpressure_timeout",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unresolved_dependency_lists_all_names() {
        let err = RegistrationError::UnresolvedDependency {
            missing: vec!["pca".to_string(), "doe".to_string()],
        };
        assert_eq!(err.to_string(), "unresolved dependencies: pca, doe");
        assert_eq!(err.kind(), "unresolved_dependency");
    }

    #[test]
    fn test_cycle_message_names_the_path() {
        let err = RegistrationError::CyclicDependency {
            cycle: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "cyclic dependency: a -> b -> a");
    }

    #[test]
    fn test_scheduling_kinds_are_stable() {
        assert_eq!(
            SchedulingError::UnknownCapability("x".into()).kind(),
            "unknown_capability"
        );
        assert_eq!(SchedulingError::SchedulerSaturated(8).kind(), "scheduler_saturated");
    }
}
