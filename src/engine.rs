use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use log::{info, warn};
use serde_json::Value;

use crate::cache::ResultCache;
use crate::channel::{ChannelManager, ProgressHub, Subscription};
use crate::config::Config;
use crate::error::{RegistrationError, SchedulingError};
use crate::registry::Registry;
use crate::scheduler::Scheduler;
use crate::storage::{Snapshot, SnapshotStore};
use crate::types::{
    CapabilityDescriptor, CapabilitySummary, DatasetRef, JobId, JobSnapshot, ServiceHandle,
};

/// Composition root for the analysis core. Everything is wired explicitly at
/// construction and handed down by reference; no component reaches for a
/// global.
pub struct AnalysisEngine {
    registry: Arc<Registry>,
    cache: Arc<ResultCache>,
    channels: Arc<ChannelManager>,
    scheduler: Arc<Scheduler>,
    store: Option<Arc<dyn SnapshotStore>>,
    config: Config,
}

impl AnalysisEngine {
    /// Must be called from within a tokio runtime; spawns the dispatcher and
    /// the retention sweeper.
    pub fn new(config: Config) -> Arc<Self> {
        Self::build(config, None)
    }

    pub fn with_store(config: Config, store: Arc<dyn SnapshotStore>) -> Arc<Self> {
        Self::build(config, Some(store))
    }

    fn build(config: Config, store: Option<Arc<dyn SnapshotStore>>) -> Arc<Self> {
        let registry = Arc::new(Registry::new());
        let cache = Arc::new(ResultCache::new(config.cache.clone()));
        let hub = Arc::new(ProgressHub::new(config.channel.clone()));
        let channels = Arc::new(ChannelManager::new(config.channel.clone()));
        let scheduler = Scheduler::new(
            registry.clone(),
            cache.clone(),
            hub,
            config.scheduler.clone(),
        );
        let engine = Arc::new(Self {
            registry,
            cache,
            channels,
            scheduler,
            store,
            config,
        });
        let sweeper = engine.clone();
        tokio::spawn(async move { sweeper.sweep_loop().await });
        engine
    }

    async fn sweep_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.scheduler.sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // First tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let now = Utc::now();
            self.scheduler.sweep(now);
            self.channels.reap_idle(now);
            if let Err(e) = self.save_snapshot().await {
                warn!("periodic snapshot failed: {e:#}");
            }
        }
    }

    // Registration surface, invoked by each capability's startup routine.

    pub fn register(&self, descriptor: CapabilityDescriptor) -> Result<(), RegistrationError> {
        self.registry.register(descriptor)
    }

    pub fn validate(&self, descriptor: &CapabilityDescriptor) -> Result<(), RegistrationError> {
        self.registry.validate(descriptor)
    }

    pub fn activate(&self, name: &str) -> Result<(), RegistrationError> {
        self.registry.activate(name)
    }

    /// Register-and-activate in one call, for capabilities with no deferred
    /// dependency ordering concerns.
    pub fn install(&self, descriptor: CapabilityDescriptor) -> Result<(), RegistrationError> {
        let name = descriptor.name.clone();
        self.registry.register(descriptor)?;
        self.registry.activate(&name)
    }

    pub fn deregister(&self, name: &str) -> bool {
        self.registry.deregister(name)
    }

    /// Versioned replacement. Refused while any job still references the
    /// current version; on success every cached result for the capability is
    /// invalidated before the new version goes live.
    pub fn upgrade_capability(
        &self,
        descriptor: CapabilityDescriptor,
    ) -> Result<(), RegistrationError> {
        if self.scheduler.has_active_jobs(&descriptor.name) {
            return Err(RegistrationError::UpgradeBlocked {
                name: descriptor.name,
                reason: "in-flight jobs still reference the current version".to_string(),
            });
        }
        let name = descriptor.name.clone();
        self.registry.upgrade(descriptor)?;
        self.cache.invalidate_all(&name);
        self.registry.activate(&name)
    }

    pub fn list_capabilities(&self) -> Vec<CapabilitySummary> {
        self.registry.list()
    }

    pub fn describe_capability(&self, name: &str) -> Option<CapabilitySummary> {
        self.registry.describe(name)
    }

    pub fn service(&self, capability: &str, service: &str) -> Option<ServiceHandle> {
        self.registry.service(capability, service)
    }

    // Job surface, invoked by upstream request handlers.

    pub fn submit(
        &self,
        capability: &str,
        parameters: Value,
        dataset: DatasetRef,
        deadline: Option<Duration>,
    ) -> Result<JobId, SchedulingError> {
        self.scheduler.submit(capability, parameters, dataset, deadline)
    }

    pub fn get_status(&self, job_id: JobId) -> Result<JobSnapshot, SchedulingError> {
        self.scheduler.get_status(job_id)
    }

    pub fn cancel(&self, job_id: JobId) -> Result<(), SchedulingError> {
        self.scheduler.cancel(job_id)
    }

    /// Opens a progress subscription for a job, optionally resuming past an
    /// already-delivered sequence.
    pub fn subscribe(
        &self,
        job_id: JobId,
        last_delivered: Option<u64>,
    ) -> Result<Subscription, SchedulingError> {
        let stream = self.scheduler.stream_for(job_id)?;
        Ok(self.channels.subscribe(job_id, stream, last_delivered))
    }

    pub fn channels(&self) -> &ChannelManager {
        &self.channels
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // Durability.

    /// Rehydrates cache entries and terminal job records from the snapshot
    /// store. Jobs persisted mid-flight resurface as failed with a
    /// `server_restarted` error.
    pub async fn recover(&self) -> Result<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let Some(snapshot) = store.load().await? else {
            return Ok(0);
        };
        self.cache.restore(snapshot.cache);
        let count = snapshot.jobs.len();
        for job in snapshot.jobs {
            self.scheduler.restore_job(job);
        }
        info!("recovered {count} job records from snapshot");
        Ok(count)
    }

    pub async fn save_snapshot(&self) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        store
            .save(&Snapshot {
                jobs: self.scheduler.export_jobs(),
                cache: self.cache.export(),
            })
            .await
    }

    /// Teardown: waits for in-flight jobs to drain, then persists a final
    /// snapshot. Returns false when jobs were still running at the timeout.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.scheduler.active_count() > 0 {
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    "shutdown timed out with {} jobs in flight",
                    self.scheduler.active_count()
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let drained = self.scheduler.active_count() == 0;
        if let Err(e) = self.save_snapshot().await {
            warn!("final snapshot failed: {e:#}");
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::json;

    use crate::capability::{Capability, ExecutionContext};
    use crate::storage::JsonFileStore;
    use crate::types::{AnalysisInput, JobState};

    struct Counting {
        executions: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Capability for Counting {
        async fn execute(
            &self,
            input: &AnalysisInput,
            ctx: &ExecutionContext,
        ) -> anyhow::Result<Value> {
            self.executions.fetch_add(1, Ordering::SeqCst);
            ctx.report_progress(60, "crunching");
            Ok(json!({ "echo": input.parameters }))
        }
    }

    fn counting(executions: &Arc<AtomicUsize>) -> CapabilityDescriptor {
        CapabilityDescriptor::new(
            "qc",
            "1.0.0",
            Arc::new(Counting {
                executions: executions.clone(),
            }),
        )
    }

    fn dataset() -> DatasetRef {
        DatasetRef::new("datasets/run.csv", "sha-2222")
    }

    async fn wait_terminal(engine: &AnalysisEngine, job_id: JobId) -> JobSnapshot {
        for _ in 0..500 {
            let status = engine.get_status(job_id).unwrap();
            if status.state.is_terminal() {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job never reached a terminal state");
    }

    #[tokio::test]
    async fn test_submit_subscribe_and_replay() {
        let executions = Arc::new(AtomicUsize::new(0));
        let engine = AnalysisEngine::new(Config::default());
        engine.install(counting(&executions)).unwrap();

        let job_id = engine
            .submit("qc", json!({"chart": "p"}), dataset(), None)
            .unwrap();
        wait_terminal(&engine, job_id).await;

        // A late subscriber replays the full history.
        let mut sub = engine.subscribe(job_id, None).unwrap();
        let mut frames = Vec::new();
        while let Some(batch) = sub.next_frames().await.unwrap() {
            frames.extend(batch);
        }
        assert!(frames.len() >= 2);
        assert!(frames.last().unwrap().is_terminal());

        // Resuming past the progress frame yields only the terminal frame.
        let first_seq = frames[0].sequence();
        let mut resumed = engine.subscribe(job_id, Some(first_seq)).unwrap();
        let mut replayed = Vec::new();
        while let Some(batch) = resumed.next_frames().await.unwrap() {
            replayed.extend(batch);
        }
        assert!(replayed.iter().all(|f| f.sequence() > first_seq));
        assert!(replayed.last().unwrap().is_terminal());
    }

    #[tokio::test]
    async fn test_subscribe_unknown_job_fails() {
        let engine = AnalysisEngine::new(Config::default());
        let missing = uuid::Uuid::new_v4();
        assert_eq!(
            engine.subscribe(missing, None).err().map(|e| e.kind()),
            Some("unknown_job"),
        );
    }

    #[tokio::test]
    async fn test_upgrade_invalidates_cached_results() {
        let executions = Arc::new(AtomicUsize::new(0));
        let engine = AnalysisEngine::new(Config::default());
        engine.install(counting(&executions)).unwrap();

        let params = json!({"chart": "c"});
        let first = engine.submit("qc", params.clone(), dataset(), None).unwrap();
        wait_terminal(&engine, first).await;

        let upgraded = CapabilityDescriptor::new(
            "qc",
            "1.1.0",
            Arc::new(Counting {
                executions: executions.clone(),
            }),
        );
        engine.upgrade_capability(upgraded).unwrap();

        // The old cached result is gone: the same submission recomputes.
        let second = engine.submit("qc", params, dataset(), None).unwrap();
        wait_terminal(&engine, second).await;
        assert_eq!(executions.load(Ordering::SeqCst), 2);
        assert_eq!(engine.describe_capability("qc").unwrap().version, "1.1.0");
    }

    #[tokio::test]
    async fn test_recovery_restores_terminal_jobs_and_cache() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.json");
        let executions = Arc::new(AtomicUsize::new(0));

        let job_id;
        {
            let store = Arc::new(JsonFileStore::new(path.clone()));
            let engine = AnalysisEngine::with_store(Config::default(), store);
            engine.install(counting(&executions)).unwrap();
            job_id = engine
                .submit("qc", json!({"chart": "u"}), dataset(), None)
                .unwrap();
            wait_terminal(&engine, job_id).await;
            assert!(engine.shutdown(Duration::from_secs(2)).await);
        }

        let store = Arc::new(JsonFileStore::new(path));
        let engine = AnalysisEngine::with_store(Config::default(), store);
        engine.install(counting(&executions)).unwrap();
        assert_eq!(engine.recover().await.unwrap(), 1);

        let restored = engine.get_status(job_id).unwrap();
        assert_eq!(restored.state, JobState::Succeeded);
        assert_eq!(restored.progress_percent, 100);

        // The restored cache still short-circuits identical submissions.
        let again = engine
            .submit("qc", json!({"chart": "u"}), dataset(), None)
            .unwrap();
        let status = engine.get_status(again).unwrap();
        assert_eq!(status.state, JobState::Succeeded);
        assert_eq!(executions.load(Ordering::SeqCst), 1);
    }
}
