//! Image cache index entries
//!
//! The index is one small JSON document, rewritten on every change.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Index format version written to disk
pub const INDEX_VERSION: u32 = 1;

/// A pre-built image recorded for a (region, fingerprint) pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageCacheEntry {
    /// Region the image lives in
    pub region: String,
    /// Full fingerprint hash
    pub hash: String,
    /// Provider image reference
    pub image_id: String,
    /// Template that produced the image
    pub template: String,
    /// When the entry was first recorded
    pub created_at: DateTime<Utc>,
    /// Last time a lookup returned this entry
    pub last_used: DateTime<Utc>,
}

impl ImageCacheEntry {
    /// Create a fresh entry
    pub fn new(region: &str, hash: &str, image_id: &str, template: &str) -> Self {
        let now = Utc::now();
        Self {
            region: region.to_string(),
            hash: hash.to_string(),
            image_id: image_id.to_string(),
            template: template.to_string(),
            created_at: now,
            last_used: now,
        }
    }

    /// Whether this entry is keyed by (region, hash)
    pub fn matches(&self, region: &str, hash: &str) -> bool {
        self.region == region && self.hash == hash
    }

    /// Whether the entry was last used before `now - max_age`
    pub fn unused_for(&self, max_age: Duration, now: DateTime<Utc>) -> bool {
        self.last_used < now - max_age
    }

    /// First 8 hex characters of the fingerprint
    pub fn short_hash(&self) -> &str {
        &self.hash[..8.min(self.hash.len())]
    }
}

/// On-disk index document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheIndex {
    pub version: u32,
    #[serde(default)]
    pub entries: Vec<ImageCacheEntry>,
}

impl Default for CacheIndex {
    fn default() -> Self {
        Self {
            version: INDEX_VERSION,
            entries: Vec::new(),
        }
    }
}

impl CacheIndex {
    /// Find the entry for (region, hash)
    pub fn get(&self, region: &str, hash: &str) -> Option<&ImageCacheEntry> {
        self.entries.iter().find(|e| e.matches(region, hash))
    }

    /// Insert or replace the entry for (region, hash).
    ///
    /// Re-recording the same image keeps its original creation time.
    pub fn upsert(&mut self, mut entry: ImageCacheEntry) {
        match self
            .entries
            .iter_mut()
            .find(|e| e.matches(&entry.region, &entry.hash))
        {
            Some(existing) => {
                if existing.image_id == entry.image_id {
                    entry.created_at = existing.created_at;
                }
                *existing = entry;
            }
            None => self.entries.push(entry),
        }
    }

    /// Remove the entry for (region, hash), returning it
    pub fn remove(&mut self, region: &str, hash: &str) -> Option<ImageCacheEntry> {
        let pos = self.entries.iter().position(|e| e.matches(region, hash))?;
        Some(self.entries.remove(pos))
    }

    /// Update the last-used time of (region, hash)
    pub fn touch(&mut self, region: &str, hash: &str, now: DateTime<Utc>) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.matches(region, hash)) {
            entry.last_used = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_is_idempotent() {
        let mut index = CacheIndex::default();
        index.upsert(ImageCacheEntry::new("us-east-1", "abc", "img-1", "hpc"));
        index.upsert(ImageCacheEntry::new("us-east-1", "abc", "img-1", "hpc"));
        assert_eq!(index.entries.len(), 1);
    }

    #[test]
    fn upsert_replaces_image_for_same_key() {
        let mut index = CacheIndex::default();
        index.upsert(ImageCacheEntry::new("us-east-1", "abc", "img-1", "hpc"));
        index.upsert(ImageCacheEntry::new("us-east-1", "abc", "img-2", "hpc"));
        index.upsert(ImageCacheEntry::new("us-west-2", "abc", "img-3", "hpc"));

        assert_eq!(index.entries.len(), 2);
        assert_eq!(index.get("us-east-1", "abc").unwrap().image_id, "img-2");
        assert_eq!(index.get("us-west-2", "abc").unwrap().image_id, "img-3");
    }

    #[test]
    fn upsert_keeps_creation_time_of_same_image() {
        let mut index = CacheIndex::default();
        let mut first = ImageCacheEntry::new("us-east-1", "abc", "img-1", "hpc");
        first.created_at = Utc::now() - Duration::days(3);
        let created = first.created_at;
        index.upsert(first);
        index.upsert(ImageCacheEntry::new("us-east-1", "abc", "img-1", "hpc"));

        assert_eq!(index.get("us-east-1", "abc").unwrap().created_at, created);
    }

    #[test]
    fn unused_for_compares_last_used() {
        let now = Utc::now();
        let mut entry = ImageCacheEntry::new("r", "h", "i", "t");
        entry.last_used = now - Duration::days(10);
        assert!(entry.unused_for(Duration::days(7), now));
        assert!(!entry.unused_for(Duration::days(30), now));
    }

    #[test]
    fn index_deserializes_without_entries() {
        let index: CacheIndex = serde_json::from_str(r#"{"version":1}"#).unwrap();
        assert!(index.entries.is_empty());
    }
}
