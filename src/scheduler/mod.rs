pub mod exec;

pub use exec::ExecutionState;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{info, warn};
use serde_json::Value;
use tokio::sync::{mpsc, Semaphore};
use uuid::Uuid;

use crate::cache::ResultCache;
use crate::capability::{Capability, ExecutionContext, ProgressSink};
use crate::channel::{EventStream, ProgressHub};
use crate::config::SchedulerConfig;
use crate::error::SchedulingError;
use crate::fingerprint::Fingerprint;
use crate::registry::Registry;
use crate::types::{
    AnalysisInput, DatasetRef, ExecutionId, JobError, JobId, JobOutcome, JobSnapshot, JobState,
};

struct JobRecord {
    capability: String,
    fingerprint: Fingerprint,
    submitted_at: DateTime<Utc>,
    exec: Arc<ExecutionState>,
}

struct QueueItem {
    job_id: JobId,
    capability: String,
    entry: Arc<dyn Capability>,
    input: AnalysisInput,
    exec: Arc<ExecutionState>,
    stream: Arc<EventStream>,
}

/// Accepts work, deduplicates it by fingerprint, and runs it on a bounded
/// worker pool. Job records stay queryable until the retention sweep retires
/// them; results outlive records in the cache.
pub struct Scheduler {
    registry: Arc<Registry>,
    cache: Arc<ResultCache>,
    hub: Arc<ProgressHub>,
    jobs: RwLock<HashMap<JobId, JobRecord>>,
    /// Fingerprint -> the execution new submissions attach to. Entries are
    /// removed when the execution finishes.
    inflight: Mutex<HashMap<Fingerprint, Arc<ExecutionState>>>,
    queue_tx: mpsc::Sender<QueueItem>,
    config: SchedulerConfig,
}

/// Progress reports flow through the shared execution state (for status
/// polls) and the event stream (for subscribers). Rejections never reach
/// the buffer.
struct HubProgress {
    exec: Arc<ExecutionState>,
    stream: Arc<EventStream>,
}

impl ProgressSink for HubProgress {
    fn report(&self, percent: u8, message: &str) -> bool {
        if self.exec.state() != JobState::Running {
            return false;
        }
        let clamped = percent.min(100);
        if !self.exec.advance_percent(clamped) {
            return false;
        }
        self.stream.emit_progress(clamped, message).is_some()
    }
}

impl Scheduler {
    /// Spawns the dispatcher; must be called from within a tokio runtime.
    pub fn new(
        registry: Arc<Registry>,
        cache: Arc<ResultCache>,
        hub: Arc<ProgressHub>,
        config: SchedulerConfig,
    ) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_depth);
        let scheduler = Arc::new(Self {
            registry,
            cache,
            hub,
            jobs: RwLock::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
            queue_tx,
            config,
        });
        let dispatcher = scheduler.clone();
        tokio::spawn(async move { dispatcher.dispatch(queue_rx).await });
        scheduler
    }

    /// FIFO dispatch: a queued item is only taken off the queue once a
    /// worker slot is free, so the admission bound stays accurate.
    async fn dispatch(self: Arc<Self>, mut queue_rx: mpsc::Receiver<QueueItem>) {
        let workers = Arc::new(Semaphore::new(self.config.worker_count));
        loop {
            let permit = match workers.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let Some(item) = queue_rx.recv().await else {
                break;
            };
            if !item.exec.transition(JobState::Queued, JobState::Running) {
                // Cancelled while queued; the slot goes straight back.
                continue;
            }
            let runner = self.clone();
            tokio::spawn(async move {
                runner.run_job(item).await;
                drop(permit);
            });
        }
    }

    /// Accepts one work request. Never blocks beyond queue admission: a full
    /// backlog fails fast instead of growing unbounded.
    pub fn submit(
        self: &Arc<Self>,
        capability: &str,
        parameters: Value,
        dataset: DatasetRef,
        deadline: Option<Duration>,
    ) -> Result<JobId, SchedulingError> {
        let entry = self.registry.resolve(capability)?;
        let fingerprint = Fingerprint::compute(capability, &parameters, &dataset);
        let job_id = Uuid::new_v4();
        let submitted_at = Utc::now();

        // Fresh cached result: the job is born terminal and no worker runs.
        if let Some(result) = self.cache.get(&fingerprint) {
            let exec = Arc::new(ExecutionState::completed(
                JobOutcome::Succeeded {
                    result: result.clone(),
                },
                100,
            ));
            let stream = self.hub.open(exec.execution_id);
            stream.emit_terminal(JobState::Succeeded, Some(result), None);
            self.cache.pin(&fingerprint);
            self.insert_record(job_id, capability, fingerprint, exec, submitted_at);
            info!("job {job_id} served from cache for `{capability}`");
            return Ok(job_id);
        }

        // Same fingerprint already executing: attach rather than duplicate.
        let attached = {
            let inflight = self.inflight.lock().unwrap();
            inflight.get(&fingerprint).cloned()
        };
        if let Some(exec) = attached {
            exec.attach();
            self.insert_record(job_id, capability, fingerprint, exec.clone(), submitted_at);
            info!("job {job_id} attached to execution {}", exec.execution_id);
            return Ok(job_id);
        }

        let permit = self
            .queue_tx
            .try_reserve()
            .map_err(|_| SchedulingError::SchedulerSaturated(self.config.queue_depth))?;

        let exec = Arc::new(ExecutionState::queued());
        let stream = self.hub.open(exec.execution_id);
        self.inflight
            .lock()
            .unwrap()
            .insert(fingerprint.clone(), exec.clone());
        self.insert_record(job_id, capability, fingerprint, exec.clone(), submitted_at);

        if let Some(deadline) = deadline {
            let watchdog = self.clone();
            let deadline_exec = exec.clone();
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                if !deadline_exec.state().is_terminal() {
                    watchdog.cancel_execution(&deadline_exec, JobError::deadline_exceeded());
                }
            });
        }

        permit.send(QueueItem {
            job_id,
            capability: capability.to_string(),
            entry,
            input: AnalysisInput {
                parameters,
                dataset,
            },
            exec,
            stream,
        });
        Ok(job_id)
    }

    /// Requests cancellation. Queued jobs cancel immediately; running jobs
    /// are asked cooperatively and force-marked after the grace timeout.
    /// Safe to call repeatedly; the terminal outcome never changes.
    pub fn cancel(self: &Arc<Self>, job_id: JobId) -> Result<(), SchedulingError> {
        let exec = {
            let jobs = self.jobs.read().unwrap();
            jobs.get(&job_id).map(|record| record.exec.clone())
        }
        .ok_or(SchedulingError::UnknownJob(job_id))?;
        self.cancel_execution(&exec, JobError::cancelled());
        Ok(())
    }

    fn cancel_execution(self: &Arc<Self>, exec: &Arc<ExecutionState>, error: JobError) {
        if exec.transition(JobState::Queued, JobState::Cancelled) {
            self.finalize(exec, JobOutcome::Cancelled { error });
            return;
        }
        if exec.state() == JobState::Running {
            exec.request_cancel(error);
            let watchdog = self.clone();
            let exec = exec.clone();
            let grace = self.config.cancel_grace;
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                if exec.transition(JobState::Running, JobState::Cancelled) {
                    warn!(
                        "execution {} force-cancelled after {grace:?} grace",
                        exec.execution_id
                    );
                    watchdog.finalize(
                        &exec,
                        JobOutcome::Cancelled {
                            error: exec.cancel_reason(),
                        },
                    );
                }
            });
        }
    }

    pub fn get_status(&self, job_id: JobId) -> Result<JobSnapshot, SchedulingError> {
        let jobs = self.jobs.read().unwrap();
        let record = jobs
            .get(&job_id)
            .ok_or(SchedulingError::UnknownJob(job_id))?;
        Ok(snapshot(job_id, record))
    }

    /// The event stream a subscriber for this job should follow. Attached
    /// jobs resolve to their shared execution's stream.
    pub fn stream_for(&self, job_id: JobId) -> Result<Arc<EventStream>, SchedulingError> {
        let execution_id = {
            let jobs = self.jobs.read().unwrap();
            jobs.get(&job_id)
                .map(|record| record.exec.execution_id)
                .ok_or(SchedulingError::UnknownJob(job_id))?
        };
        self.hub
            .stream(&execution_id)
            .ok_or(SchedulingError::UnknownJob(job_id))
    }

    pub fn has_active_jobs(&self, capability: &str) -> bool {
        let jobs = self.jobs.read().unwrap();
        jobs.values()
            .any(|record| record.capability == capability && !record.exec.state().is_terminal())
    }

    pub fn active_count(&self) -> usize {
        let jobs = self.jobs.read().unwrap();
        jobs.values()
            .filter(|record| !record.exec.state().is_terminal())
            .count()
    }

    /// Retires terminal records past the retention window, releasing their
    /// cache references and event streams.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let mut released: Vec<(Fingerprint, ExecutionId)> = Vec::new();
        let live: HashSet<ExecutionId>;
        {
            let mut jobs = self.jobs.write().unwrap();
            let expired: Vec<JobId> = jobs
                .iter()
                .filter(|(_, record)| {
                    record.exec.state().is_terminal()
                        && record
                            .exec
                            .finished_at()
                            .map(|t| (now - t).to_std().unwrap_or_default() > self.config.retention)
                            .unwrap_or(false)
                })
                .map(|(id, _)| *id)
                .collect();
            for id in expired {
                if let Some(record) = jobs.remove(&id) {
                    released.push((record.fingerprint, record.exec.execution_id));
                }
            }
            live = jobs.values().map(|record| record.exec.execution_id).collect();
        }
        let count = released.len();
        for (fingerprint, execution_id) in released {
            self.cache.release(&fingerprint);
            if !live.contains(&execution_id) {
                self.hub.retire(&execution_id);
            }
        }
        count
    }

    /// Every tracked record as a snapshot, for persistence.
    pub fn export_jobs(&self) -> Vec<JobSnapshot> {
        let jobs = self.jobs.read().unwrap();
        jobs.iter()
            .map(|(id, record)| snapshot(*id, record))
            .collect()
    }

    /// Rehydrates a persisted record. Only terminal outcomes survive a
    /// restart; anything that was still in flight resurfaces as `Failed`
    /// with a `server_restarted` error.
    pub fn restore_job(&self, persisted: JobSnapshot) {
        let outcome = if persisted.state.is_terminal() {
            match persisted.state {
                JobState::Succeeded => JobOutcome::Succeeded {
                    result: persisted.result.unwrap_or(Value::Null),
                },
                JobState::Cancelled => JobOutcome::Cancelled {
                    error: persisted.error.unwrap_or_else(JobError::cancelled),
                },
                _ => JobOutcome::Failed {
                    error: persisted
                        .error
                        .unwrap_or_else(|| JobError::execution("unrecorded failure")),
                },
            }
        } else {
            JobOutcome::Failed {
                error: JobError::server_restarted(),
            }
        };

        let percent = match outcome {
            JobOutcome::Succeeded { .. } => 100,
            _ => persisted.progress_percent,
        };
        let exec = Arc::new(ExecutionState::completed(outcome.clone(), percent));
        let stream = self.hub.open(exec.execution_id);
        stream.emit_terminal(
            outcome.state(),
            outcome.result().cloned(),
            outcome.error().cloned(),
        );

        let fingerprint = Fingerprint::from_raw(persisted.fingerprint);
        self.cache.pin(&fingerprint);
        let mut jobs = self.jobs.write().unwrap();
        jobs.insert(
            persisted.job_id,
            JobRecord {
                capability: persisted.capability,
                fingerprint,
                submitted_at: persisted.submitted_at,
                exec,
            },
        );
    }

    async fn run_job(self: &Arc<Self>, item: QueueItem) {
        let QueueItem {
            job_id,
            capability,
            entry,
            input,
            exec,
            stream,
        } = item;
        exec.mark_started();
        info!("job {job_id} running `{capability}`");

        let sink = Arc::new(HubProgress {
            exec: exec.clone(),
            stream,
        });
        let ctx = ExecutionContext::new(job_id, sink, exec.cancel_token());
        let outcome = entry.execute(&input, &ctx).await;

        // A cancellation acknowledged by the worker wins over whatever the
        // entry point returned on its way out.
        if exec.cancel_token().is_cancelled() {
            if exec.transition(JobState::Running, JobState::Cancelled) {
                self.finalize(
                    &exec,
                    JobOutcome::Cancelled {
                        error: exec.cancel_reason(),
                    },
                );
            }
            return;
        }

        match outcome {
            Ok(result) => {
                if exec.transition(JobState::Running, JobState::Succeeded) {
                    self.finalize(&exec, JobOutcome::Succeeded { result });
                }
            }
            Err(e) => {
                if exec.transition(JobState::Running, JobState::Failed) {
                    warn!("job {job_id} failed: {e:#}");
                    self.finalize(
                        &exec,
                        JobOutcome::Failed {
                            error: JobError::execution(format!("{e:#}")),
                        },
                    );
                }
            }
        }
    }

    /// Terminal bookkeeping, called exactly once per execution by whichever
    /// path won the CAS: outcome recording, the terminal frame, the cache
    /// write, and the in-flight release.
    fn finalize(&self, exec: &Arc<ExecutionState>, outcome: JobOutcome) {
        if let JobOutcome::Succeeded { .. } = outcome {
            exec.force_percent_complete();
        }
        exec.set_outcome(outcome.clone());

        if let Some(stream) = self.hub.stream(&exec.execution_id) {
            stream.emit_terminal(
                outcome.state(),
                outcome.result().cloned(),
                outcome.error().cloned(),
            );
        }

        let meta = {
            let jobs = self.jobs.read().unwrap();
            jobs.values()
                .find(|record| record.exec.execution_id == exec.execution_id)
                .map(|record| (record.capability.clone(), record.fingerprint.clone()))
        };
        if let Some((capability, fingerprint)) = meta {
            if let JobOutcome::Succeeded { result } = &outcome {
                self.cache.put(
                    fingerprint.clone(),
                    &capability,
                    result.clone(),
                    exec.attached_count(),
                );
            }
            self.inflight.lock().unwrap().remove(&fingerprint);
        }
    }

    fn insert_record(
        &self,
        job_id: JobId,
        capability: &str,
        fingerprint: Fingerprint,
        exec: Arc<ExecutionState>,
        submitted_at: DateTime<Utc>,
    ) {
        self.jobs.write().unwrap().insert(
            job_id,
            JobRecord {
                capability: capability.to_string(),
                fingerprint,
                submitted_at,
                exec,
            },
        );
    }
}

fn snapshot(job_id: JobId, record: &JobRecord) -> JobSnapshot {
    let outcome = record.exec.outcome();
    JobSnapshot {
        job_id,
        capability: record.capability.clone(),
        fingerprint: record.fingerprint.as_str().to_string(),
        state: record.exec.state(),
        progress_percent: record.exec.percent(),
        submitted_at: record.submitted_at,
        started_at: record.exec.started_at(),
        finished_at: record.exec.finished_at(),
        result: outcome.as_ref().and_then(|o| o.result().cloned()),
        error: outcome.as_ref().and_then(|o| o.error().cloned()),
    }
}
