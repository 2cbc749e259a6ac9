pub mod file;

pub use file::JsonFileStore;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::cache::CacheEntry;
use crate::fingerprint::Fingerprint;
use crate::types::JobSnapshot;

/// Everything that must survive a restart: cached results and job records.
/// Jobs persisted while still in flight come back as failures; the engine
/// handles that translation on recovery.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub jobs: Vec<JobSnapshot>,
    pub cache: Vec<(Fingerprint, CacheEntry)>,
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Returns the last persisted snapshot, or None on first start.
    async fn load(&self) -> Result<Option<Snapshot>>;
    async fn save(&self, snapshot: &Snapshot) -> Result<()>;
}
