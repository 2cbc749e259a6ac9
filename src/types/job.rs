use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::JobId;

/// Lifecycle of one tracked execution. Terminal states are sinks: no
/// transition ever leaves them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum JobState {
    Queued = 0,
    Running = 1,
    Succeeded = 2,
    Failed = 3,
    Cancelled = 4,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled
        )
    }

    pub fn as_str(&self) -> &str {
        match self {
            JobState::Queued => "Queued",
            JobState::Running => "Running",
            JobState::Succeeded => "Succeeded",
            JobState::Failed => "Failed",
            JobState::Cancelled => "Cancelled",
        }
    }

    pub(crate) fn from_u8(raw: u8) -> JobState {
        match raw {
            0 => JobState::Queued,
            1 => JobState::Running,
            2 => JobState::Succeeded,
            3 => JobState::Failed,
            4 => JobState::Cancelled,
            other => unreachable!("invalid job state discriminant {other}"),
        }
    }
}

/// Capability-internal failures are carried verbatim: the core attaches a
/// stable kind but never interprets the message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: String,
    pub message: String,
}

impl JobError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::new("execution_failed", message)
    }

    pub fn cancelled() -> Self {
        Self::new("cancelled", "cancelled by caller request")
    }

    pub fn deadline_exceeded() -> Self {
        Self::new("deadline_exceeded", "job deadline expired before completion")
    }

    pub fn server_restarted() -> Self {
        Self::new(
            "server_restarted",
            "job was in flight when the server restarted",
        )
    }
}

/// Terminal outcome of an execution. Result and error are mutually
/// exclusive by construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum JobOutcome {
    Succeeded { result: Value },
    Failed { error: JobError },
    Cancelled { error: JobError },
}

impl JobOutcome {
    pub fn state(&self) -> JobState {
        match self {
            JobOutcome::Succeeded { .. } => JobState::Succeeded,
            JobOutcome::Failed { .. } => JobState::Failed,
            JobOutcome::Cancelled { .. } => JobState::Cancelled,
        }
    }

    pub fn result(&self) -> Option<&Value> {
        match self {
            JobOutcome::Succeeded { result } => Some(result),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&JobError> {
        match self {
            JobOutcome::Succeeded { .. } => None,
            JobOutcome::Failed { error } | JobOutcome::Cancelled { error } => Some(error),
        }
    }
}

/// Reference to an already-validated dataset. Upload and validation happen
/// upstream; the engine only needs a stable content hash for fingerprinting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetRef {
    pub uri: String,
    pub content_hash: String,
}

impl DatasetRef {
    pub fn new(uri: impl Into<String>, content_hash: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            content_hash: content_hash.into(),
        }
    }
}

/// Everything a capability entry point receives about one invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisInput {
    pub parameters: Value,
    pub dataset: DatasetRef,
}

/// Point-in-time view of a job, safe to hand to callers and to persist for
/// terminal records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub job_id: JobId,
    pub capability: String,
    pub fingerprint: String,
    pub state: JobState,
    pub progress_percent: u8,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub error: Option<JobError>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_terminal_states_are_sinks() {
        assert!(!JobState::Queued.is_terminal());
        assert!(!JobState::Running.is_terminal());
        assert!(JobState::Succeeded.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::Cancelled.is_terminal());
    }

    #[test]
    fn test_state_roundtrips_through_discriminant() {
        for state in [
            JobState::Queued,
            JobState::Running,
            JobState::Succeeded,
            JobState::Failed,
            JobState::Cancelled,
        ] {
            assert_eq!(JobState::from_u8(state as u8), state);
        }
    }

    #[test]
    fn test_outcome_is_result_xor_error() {
        let ok = JobOutcome::Succeeded {
            result: json!({"mean": 4.2}),
        };
        assert!(ok.result().is_some());
        assert!(ok.error().is_none());

        let failed = JobOutcome::Failed {
            error: JobError::execution("singular matrix"),
        };
        assert!(failed.result().is_none());
        assert_eq!(failed.error().unwrap().kind, "execution_failed");
        assert_eq!(failed.state(), JobState::Failed);
    }
}
