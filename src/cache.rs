use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::CacheConfig;
use crate::fingerprint::Fingerprint;

/// One cached computation result. `refcount` counts live job records whose
/// fingerprint points here; it is never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub capability: String,
    pub result: Value,
    pub computed_at: DateTime<Utc>,
    pub size_bytes: usize,
    #[serde(skip)]
    pub refcount: usize,
}

struct CacheInner {
    entries: HashMap<Fingerprint, CacheEntry>,
    /// Least-recently-used first.
    recency: Vec<Fingerprint>,
    total_bytes: usize,
}

/// Fingerprint-keyed result cache. Entries never expire by age: they leave
/// only through explicit invalidation or LRU pressure, and never while a
/// live job record still references them.
pub struct ResultCache {
    inner: RwLock<CacheInner>,
    config: CacheConfig,
}

impl ResultCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            inner: RwLock::new(CacheInner {
                entries: HashMap::new(),
                recency: Vec::new(),
                total_bytes: 0,
            }),
            config,
        }
    }

    pub fn get(&self, fingerprint: &Fingerprint) -> Option<Value> {
        let mut inner = self.inner.write().unwrap();
        if !inner.entries.contains_key(fingerprint) {
            return None;
        }
        touch(&mut inner.recency, fingerprint);
        inner.entries.get(fingerprint).map(|e| e.result.clone())
    }

    pub fn put(
        &self,
        fingerprint: Fingerprint,
        capability: &str,
        result: Value,
        initial_refs: usize,
    ) {
        let size_bytes = serde_json::to_vec(&result).map(|v| v.len()).unwrap_or(0);
        let entry = CacheEntry {
            capability: capability.to_string(),
            result,
            computed_at: Utc::now(),
            size_bytes,
            refcount: initial_refs,
        };

        let mut inner = self.inner.write().unwrap();
        if let Some(old) = inner.entries.insert(fingerprint.clone(), entry) {
            inner.total_bytes -= old.size_bytes;
        }
        inner.total_bytes += size_bytes;
        touch(&mut inner.recency, &fingerprint);
        self.evict_over_budget(&mut inner);
    }

    /// Marks one more job record as pointing at this entry.
    pub fn pin(&self, fingerprint: &Fingerprint) -> bool {
        let mut inner = self.inner.write().unwrap();
        match inner.entries.get_mut(fingerprint) {
            Some(entry) => {
                entry.refcount += 1;
                true
            }
            None => false,
        }
    }

    /// Releases one job record's reference. Saturating: releasing an absent
    /// or unreferenced entry is a no-op.
    pub fn release(&self, fingerprint: &Fingerprint) {
        let mut inner = self.inner.write().unwrap();
        if let Some(entry) = inner.entries.get_mut(fingerprint) {
            entry.refcount = entry.refcount.saturating_sub(1);
        }
    }

    pub fn invalidate(&self, fingerprint: &Fingerprint) -> bool {
        let mut inner = self.inner.write().unwrap();
        match inner.entries.remove(fingerprint) {
            Some(entry) => {
                inner.total_bytes -= entry.size_bytes;
                inner.recency.retain(|f| f != fingerprint);
                true
            }
            None => false,
        }
    }

    /// Drops every cached result for one capability; used on upgrade, when
    /// all of its results become stale at once.
    pub fn invalidate_all(&self, capability: &str) -> usize {
        let mut inner = self.inner.write().unwrap();
        let stale: Vec<Fingerprint> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.capability == capability)
            .map(|(f, _)| f.clone())
            .collect();
        for fingerprint in &stale {
            if let Some(entry) = inner.entries.remove(fingerprint) {
                inner.total_bytes -= entry.size_bytes;
            }
        }
        inner.recency.retain(|f| !stale.contains(f));
        debug!("invalidated {} cached results for `{capability}`", stale.len());
        stale.len()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_bytes(&self) -> usize {
        self.inner.read().unwrap().total_bytes
    }

    /// LRU-ordered export for snapshot persistence.
    pub fn export(&self) -> Vec<(Fingerprint, CacheEntry)> {
        let inner = self.inner.read().unwrap();
        inner
            .recency
            .iter()
            .filter_map(|f| inner.entries.get(f).map(|e| (f.clone(), e.clone())))
            .collect()
    }

    /// Restores a persisted export. Refcounts restart at zero; the engine
    /// re-pins entries for the job records it restores.
    pub fn restore(&self, exported: Vec<(Fingerprint, CacheEntry)>) {
        let mut inner = self.inner.write().unwrap();
        for (fingerprint, mut entry) in exported {
            entry.refcount = 0;
            inner.total_bytes += entry.size_bytes;
            if let Some(old) = inner.entries.insert(fingerprint.clone(), entry) {
                inner.total_bytes -= old.size_bytes;
            }
            touch(&mut inner.recency, &fingerprint);
        }
        self.evict_over_budget(&mut inner);
    }

    fn evict_over_budget(&self, inner: &mut CacheInner) {
        let over = |inner: &CacheInner| {
            inner.entries.len() > self.config.max_entries
                || inner.total_bytes > self.config.max_total_bytes
        };
        while over(inner) {
            let victim = inner
                .recency
                .iter()
                .find(|f| inner.entries.get(*f).map(|e| e.refcount) == Some(0))
                .cloned();
            match victim {
                Some(fingerprint) => {
                    if let Some(entry) = inner.entries.remove(&fingerprint) {
                        inner.total_bytes -= entry.size_bytes;
                    }
                    inner.recency.retain(|f| f != &fingerprint);
                }
                // Everything left is referenced by a live job; the budget
                // recovers once those records retire.
                None => break,
            }
        }
    }
}

fn touch(recency: &mut Vec<Fingerprint>, fingerprint: &Fingerprint) {
    recency.retain(|f| f != fingerprint);
    recency.push(fingerprint.clone());
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fp(tag: &str) -> Fingerprint {
        Fingerprint::compute(
            "qc",
            &json!({ "tag": tag }),
            &crate::types::DatasetRef::new("d", "h"),
        )
    }

    fn cache(max_entries: usize) -> ResultCache {
        ResultCache::new(CacheConfig {
            max_entries,
            max_total_bytes: 1024 * 1024,
        })
    }

    #[test]
    fn test_put_get_roundtrip() {
        let cache = cache(4);
        cache.put(fp("a"), "qc", json!({"limits": [1, 2]}), 1);
        assert_eq!(cache.get(&fp("a")).unwrap()["limits"][0], 1);
        assert!(cache.get(&fp("b")).is_none());
    }

    #[test]
    fn test_lru_evicts_least_recent_first() {
        let cache = cache(2);
        cache.put(fp("a"), "qc", json!(1), 0);
        cache.put(fp("b"), "qc", json!(2), 0);
        // Touch `a` so `b` becomes the LRU victim.
        cache.get(&fp("a"));
        cache.put(fp("c"), "qc", json!(3), 0);

        assert!(cache.get(&fp("a")).is_some());
        assert!(cache.get(&fp("b")).is_none());
        assert!(cache.get(&fp("c")).is_some());
    }

    #[test]
    fn test_referenced_entries_survive_eviction() {
        let cache = cache(1);
        cache.put(fp("pinned"), "qc", json!(1), 1);
        cache.put(fp("next"), "qc", json!(2), 0);

        assert!(cache.get(&fp("pinned")).is_some());
        cache.release(&fp("pinned"));
        cache.put(fp("third"), "qc", json!(3), 0);
        assert!(cache.get(&fp("pinned")).is_none());
    }

    #[test]
    fn test_byte_budget_evicts() {
        let cache = ResultCache::new(CacheConfig {
            max_entries: 100,
            max_total_bytes: 64,
        });
        cache.put(fp("a"), "qc", json!("x".repeat(40)), 0);
        cache.put(fp("b"), "qc", json!("y".repeat(40)), 0);
        assert_eq!(cache.len(), 1);
        assert!(cache.total_bytes() <= 64);
    }

    #[test]
    fn test_invalidate_all_by_capability() {
        let cache = cache(8);
        cache.put(fp("a"), "qc", json!(1), 0);
        cache.put(fp("b"), "qc", json!(2), 0);
        cache.put(fp("c"), "pca", json!(3), 0);

        assert_eq!(cache.invalidate_all("qc"), 2);
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&fp("c")).is_some());
    }

    #[test]
    fn test_export_restore_resets_refcounts() {
        let cache = cache(8);
        cache.put(fp("a"), "qc", json!({"big": true}), 3);

        let restored = ResultCache::new(CacheConfig {
            max_entries: 8,
            max_total_bytes: 1024 * 1024,
        });
        restored.restore(cache.export());
        assert_eq!(restored.len(), 1);
        // Unreferenced after restore: capacity pressure may now evict it.
        restored.put(fp("b"), "qc", json!(2), 0);
        assert_eq!(restored.len(), 2);
    }
}
