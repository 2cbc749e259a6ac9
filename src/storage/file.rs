use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;

use super::{Snapshot, SnapshotStore};

/// Single-file JSON persistence. Writes go through a sibling temp file and a
/// rename so a crash mid-save never corrupts the last good snapshot.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SnapshotStore for JsonFileStore {
    async fn load(&self) -> Result<Option<Snapshot>> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("reading snapshot {:?}", self.path))
            }
        };
        let snapshot = serde_json::from_slice(&raw)
            .with_context(|| format!("parsing snapshot {:?}", self.path))?;
        Ok(Some(snapshot))
    }

    async fn save(&self, snapshot: &Snapshot) -> Result<()> {
        let raw = serde_json::to_vec_pretty(snapshot)?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, &raw)
            .await
            .with_context(|| format!("writing snapshot {tmp:?}"))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("replacing snapshot {:?}", self.path))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    use crate::cache::CacheEntry;
    use crate::fingerprint::Fingerprint;
    use crate::types::{JobSnapshot, JobState};

    fn sample() -> Snapshot {
        Snapshot {
            jobs: vec![JobSnapshot {
                job_id: uuid::Uuid::new_v4(),
                capability: "qc".to_string(),
                fingerprint: "feed".to_string(),
                state: JobState::Succeeded,
                progress_percent: 100,
                submitted_at: Utc::now(),
                started_at: Some(Utc::now()),
                finished_at: Some(Utc::now()),
                result: Some(json!({"limits": [2.7, 9.1]})),
                error: None,
            }],
            cache: vec![(
                Fingerprint::from_raw("feed"),
                CacheEntry {
                    capability: "qc".to_string(),
                    result: json!({"limits": [2.7, 9.1]}),
                    computed_at: Utc::now(),
                    size_bytes: 24,
                    refcount: 2,
                },
            )],
        }
    }

    #[tokio::test]
    async fn test_missing_file_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("absent.json"));
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_load_roundtrip_drops_refcounts() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("snapshot.json"));

        store.save(&sample()).await.unwrap();
        let loaded = store.load().await.unwrap().unwrap();

        assert_eq!(loaded.jobs.len(), 1);
        assert_eq!(loaded.jobs[0].capability, "qc");
        assert_eq!(loaded.cache.len(), 1);
        // Refcounts are runtime state and never persist.
        assert_eq!(loaded.cache[0].1.refcount, 0);
    }

    #[tokio::test]
    async fn test_save_overwrites_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("snapshot.json"));

        store.save(&sample()).await.unwrap();
        store.save(&Snapshot::default()).await.unwrap();

        let loaded = store.load().await.unwrap().unwrap();
        assert!(loaded.jobs.is_empty());
        assert!(loaded.cache.is_empty());
    }
}
