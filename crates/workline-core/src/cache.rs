use crate::error::Result;
use crate::io;
use crate::item::ComplianceSnapshot;
use crate::paths;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Cache entry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct CacheEntry {
    content_hash: String,
    snapshot: ComplianceSnapshot,
    cached_at: DateTime<Utc>,
    ttl_secs: u64,
}

impl CacheEntry {
    fn is_valid_for(&self, content_hash: &str, now: DateTime<Utc>) -> bool {
        if self.content_hash != content_hash {
            return false;
        }
        let age = now.signed_duration_since(self.cached_at);
        age.num_seconds() >= 0 && (age.num_seconds() as u64) < self.ttl_secs
    }
}

// ---------------------------------------------------------------------------
// ComplianceCache
// ---------------------------------------------------------------------------

/// Additive cache of compliance results, keyed `{entityId}:{ruleSetVersion}`.
/// A hit requires the stored content hash to match the entity's current hash
/// and the entry to be younger than its TTL; anything else is a miss. The
/// cache is never the sole holder of a value, so a miss is always safe.
#[derive(Debug, Clone)]
pub struct ComplianceCache {
    path: PathBuf,
}

impl ComplianceCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            path: paths::cache_path(&root.into()),
        }
    }

    fn load(&self) -> Result<BTreeMap<String, CacheEntry>> {
        let data = match std::fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&data)?)
    }

    fn save(&self, entries: &BTreeMap<String, CacheEntry>) -> Result<()> {
        let mut data = serde_json::to_vec_pretty(entries)?;
        data.push(b'\n');
        io::atomic_write(&self.path, &data)
    }

    fn key(entity_id: &str, rule_set_version: u32) -> String {
        format!("{entity_id}:{rule_set_version}")
    }

    pub fn get(
        &self,
        entity_id: &str,
        content_hash: &str,
        rule_set_version: u32,
    ) -> Result<Option<ComplianceSnapshot>> {
        let entries = self.load()?;
        Ok(entries
            .get(&Self::key(entity_id, rule_set_version))
            .filter(|e| e.is_valid_for(content_hash, Utc::now()))
            .map(|e| e.snapshot.clone()))
    }

    pub fn put(
        &self,
        entity_id: &str,
        content_hash: &str,
        rule_set_version: u32,
        snapshot: ComplianceSnapshot,
        ttl: Duration,
    ) -> Result<()> {
        let mut entries = self.load()?;
        entries.insert(
            Self::key(entity_id, rule_set_version),
            CacheEntry {
                content_hash: content_hash.to_string(),
                snapshot,
                cached_at: Utc::now(),
                ttl_secs: ttl.as_secs(),
            },
        );
        self.save(&entries)
    }

    /// Drop every entry for `entity_id`, across all rule-set versions. Used
    /// when the entity changed outside the normal write path.
    pub fn invalidate(&self, entity_id: &str) -> Result<()> {
        let mut entries = self.load()?;
        let prefix = format!("{entity_id}:");
        let before = entries.len();
        entries.retain(|k, _| !k.starts_with(&prefix));
        if entries.len() != before {
            self.save(&entries)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn snapshot(score: u32) -> ComplianceSnapshot {
        ComplianceSnapshot {
            score,
            rule_set_version: 3,
            evaluated_at: Utc::now(),
        }
    }

    #[test]
    fn put_then_get_hits() {
        let dir = TempDir::new().unwrap();
        let cache = ComplianceCache::new(dir.path());
        cache
            .put("FEA-001", "abc123", 3, snapshot(85), Duration::from_secs(60))
            .unwrap();
        let hit = cache.get("FEA-001", "abc123", 3).unwrap().unwrap();
        assert_eq!(hit.score, 85);
    }

    #[test]
    fn hash_mismatch_is_a_miss() {
        let dir = TempDir::new().unwrap();
        let cache = ComplianceCache::new(dir.path());
        cache
            .put("FEA-001", "abc123", 3, snapshot(85), Duration::from_secs(60))
            .unwrap();
        assert!(cache.get("FEA-001", "other", 3).unwrap().is_none());
    }

    #[test]
    fn rule_set_version_is_part_of_the_key() {
        let dir = TempDir::new().unwrap();
        let cache = ComplianceCache::new(dir.path());
        cache
            .put("FEA-001", "abc123", 3, snapshot(85), Duration::from_secs(60))
            .unwrap();
        assert!(cache.get("FEA-001", "abc123", 4).unwrap().is_none());
    }

    #[test]
    fn expired_entry_is_a_miss() {
        let dir = TempDir::new().unwrap();
        let cache = ComplianceCache::new(dir.path());
        cache
            .put("FEA-001", "abc123", 3, snapshot(85), Duration::from_secs(0))
            .unwrap();
        assert!(cache.get("FEA-001", "abc123", 3).unwrap().is_none());
    }

    #[test]
    fn invalidate_removes_all_versions_for_entity() {
        let dir = TempDir::new().unwrap();
        let cache = ComplianceCache::new(dir.path());
        cache
            .put("FEA-001", "h1", 3, snapshot(85), Duration::from_secs(60))
            .unwrap();
        cache
            .put("FEA-001", "h1", 4, snapshot(90), Duration::from_secs(60))
            .unwrap();
        cache
            .put("FEA-002", "h2", 3, snapshot(70), Duration::from_secs(60))
            .unwrap();

        cache.invalidate("FEA-001").unwrap();
        assert!(cache.get("FEA-001", "h1", 3).unwrap().is_none());
        assert!(cache.get("FEA-001", "h1", 4).unwrap().is_none());
        assert!(cache.get("FEA-002", "h2", 3).unwrap().is_some());
    }

    #[test]
    fn missing_file_is_empty_cache() {
        let dir = TempDir::new().unwrap();
        let cache = ComplianceCache::new(dir.path());
        assert!(cache.get("FEA-001", "h", 1).unwrap().is_none());
        cache.invalidate("FEA-001").unwrap();
    }
}
