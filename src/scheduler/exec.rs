use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::types::{ExecutionId, JobError, JobOutcome, JobState};

/// Shared state of one execution. Several job records may point at the same
/// execution when identical fingerprints attach; all of them observe the
/// same state, progress, and outcome.
///
/// The state lives in an atomic and only ever advances through
/// compare-and-swap on the expected value, so a cancellation can never race
/// a completion into a double transition.
pub struct ExecutionState {
    pub execution_id: ExecutionId,
    state: AtomicU8,
    percent: AtomicU8,
    attached: AtomicUsize,
    started_at: Mutex<Option<DateTime<Utc>>>,
    finished_at: Mutex<Option<DateTime<Utc>>>,
    outcome: Mutex<Option<JobOutcome>>,
    cancel_error: Mutex<Option<JobError>>,
    cancel: CancellationToken,
}

impl ExecutionState {
    pub fn queued() -> Self {
        Self::with_state(JobState::Queued, 0)
    }

    /// A pre-completed execution, used for cache hits and restored terminal
    /// records: no worker ever runs it.
    pub fn completed(outcome: JobOutcome, percent: u8) -> Self {
        let exec = Self::with_state(outcome.state(), percent);
        *exec.outcome.lock().unwrap() = Some(outcome);
        *exec.finished_at.lock().unwrap() = Some(Utc::now());
        exec
    }

    fn with_state(state: JobState, percent: u8) -> Self {
        Self {
            execution_id: Uuid::new_v4(),
            state: AtomicU8::new(state as u8),
            percent: AtomicU8::new(percent),
            attached: AtomicUsize::new(1),
            started_at: Mutex::new(None),
            finished_at: Mutex::new(None),
            outcome: Mutex::new(None),
            cancel_error: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> JobState {
        JobState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Atomically advances `from -> to`. Returns false when the state had
    /// already moved, in which case the caller must not act on the old one.
    pub fn transition(&self, from: JobState, to: JobState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn percent(&self) -> u8 {
        self.percent.load(Ordering::Acquire)
    }

    /// Monotone progress: rejects duplicate or decreasing values.
    pub fn advance_percent(&self, to: u8) -> bool {
        let to = to.min(100);
        let mut current = self.percent.load(Ordering::Acquire);
        loop {
            if to <= current {
                return false;
            }
            match self.percent.compare_exchange(
                current,
                to,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn force_percent_complete(&self) {
        self.percent.store(100, Ordering::Release);
    }

    /// One more job record attached to this execution.
    pub fn attach(&self) -> usize {
        self.attached.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn attached_count(&self) -> usize {
        self.attached.load(Ordering::Acquire)
    }

    pub fn mark_started(&self) {
        *self.started_at.lock().unwrap() = Some(Utc::now());
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        *self.started_at.lock().unwrap()
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        *self.finished_at.lock().unwrap()
    }

    /// Records the terminal outcome. Callers must have won the CAS into the
    /// matching terminal state first.
    pub fn set_outcome(&self, outcome: JobOutcome) {
        *self.finished_at.lock().unwrap() = Some(Utc::now());
        let mut slot = self.outcome.lock().unwrap();
        if slot.is_none() {
            *slot = Some(outcome);
        }
    }

    pub fn outcome(&self) -> Option<JobOutcome> {
        self.outcome.lock().unwrap().clone()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Remembers why cancellation was requested (caller request vs deadline)
    /// so the worker and the grace watchdog report the same reason.
    pub fn request_cancel(&self, error: JobError) {
        let mut slot = self.cancel_error.lock().unwrap();
        if slot.is_none() {
            *slot = Some(error);
        }
        drop(slot);
        self.cancel.cancel();
    }

    pub fn cancel_reason(&self) -> JobError {
        self.cancel_error
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(JobError::cancelled)
    }
}
