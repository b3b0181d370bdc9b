//! Two-tier image cache
//!
//! The local index is fast but advisory: a hit is only trusted after the
//! provider confirms the image still exists. On a local miss the provider is
//! queried for images tagged with the fingerprint, which makes images built
//! by other processes or machines discoverable.

use crate::cache::entry::{CacheIndex, ImageCacheEntry};
use crate::error::{ForgeError, ForgeResult};
use crate::fingerprint::{tags, Fingerprint};
use crate::provider::{ComputeProvider, ImageState};
use chrono::{Duration, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Where a cache hit came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitSource {
    /// Local index, confirmed upstream
    Local,
    /// Provider tag query
    Provider,
}

/// Result of a successful lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheHit {
    pub image_id: String,
    pub source: HitSource,
}

/// Image cache keyed by (region, fingerprint hash)
pub struct ImageCache {
    path: PathBuf,
    compute: Arc<dyn ComputeProvider>,
    // Serialises read-modify-write of the index document
    write_lock: Mutex<()>,
}

impl ImageCache {
    /// Open the cache index at `path`
    pub fn new(path: impl Into<PathBuf>, compute: Arc<dyn ComputeProvider>) -> Self {
        Self {
            path: path.into(),
            compute,
            write_lock: Mutex::new(()),
        }
    }

    /// Index document path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Look up a pre-built image for `fp` in `region`.
    ///
    /// Provider failures are returned as errors, never as a miss.
    pub async fn lookup(&self, region: &str, fp: &Fingerprint) -> ForgeResult<Option<CacheHit>> {
        let local = self.get(region, &fp.hash).await?;

        if let Some(entry) = local {
            let upstream = self.compute.describe_image(region, &entry.image_id).await?;
            let state = upstream.map(|image| image.state);
            if state == Some(ImageState::Available) {
                self.touch(region, &fp.hash).await?;
                info!(
                    "Cache hit for {} in {}: {}",
                    fp.short_hash(),
                    region,
                    entry.image_id
                );
                return Ok(Some(CacheHit {
                    image_id: entry.image_id,
                    source: HitSource::Local,
                }));
            }
            if state.is_some_and(|state| state.is_usable()) {
                debug!(
                    "Cached image {} for {} is not available yet",
                    entry.image_id,
                    fp.short_hash()
                );
                return Ok(None);
            }

            warn!(
                "Cached image {} for {} is gone or unusable in {}, evicting",
                entry.image_id,
                fp.short_hash(),
                region
            );
            self.remove(region, &fp.hash).await?;
            return Ok(None);
        }

        let mut candidates = self
            .compute
            .find_images_by_tag(region, tags::FINGERPRINT, &fp.hash)
            .await?;
        candidates.retain(|image| image.state == ImageState::Available);
        candidates.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let Some(newest) = candidates.into_iter().next() else {
            debug!("Cache miss for {} in {}", fp.short_hash(), region);
            return Ok(None);
        };

        let template = newest
            .tags
            .get(tags::TEMPLATE)
            .cloned()
            .unwrap_or_else(|| "unknown".to_string());
        self.record(region, &newest.id, fp, &template).await?;
        info!(
            "Found tagged image {} for {} in {}",
            newest.id,
            fp.short_hash(),
            region
        );

        Ok(Some(CacheHit {
            image_id: newest.id,
            source: HitSource::Provider,
        }))
    }

    /// Record an image for (region, fingerprint); repeated calls are idempotent
    pub async fn record(
        &self,
        region: &str,
        image_id: &str,
        fp: &Fingerprint,
        template: &str,
    ) -> ForgeResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut index = self.read_index().await?;
        index.upsert(ImageCacheEntry::new(region, &fp.hash, image_id, template));
        self.write_index(&index).await?;
        debug!("Recorded {} for {} in {}", image_id, fp.short_hash(), region);
        Ok(())
    }

    /// Entry for (region, hash), without consulting the provider
    pub async fn get(&self, region: &str, hash: &str) -> ForgeResult<Option<ImageCacheEntry>> {
        Ok(self.read_index().await?.get(region, hash).cloned())
    }

    /// Remove the entry for (region, hash); the image itself is untouched
    pub async fn remove(&self, region: &str, hash: &str) -> ForgeResult<bool> {
        let _guard = self.write_lock.lock().await;
        let mut index = self.read_index().await?;
        let removed = index.remove(region, hash).is_some();
        if removed {
            self.write_index(&index).await?;
        }
        Ok(removed)
    }

    /// Remove the entry, failing with NotFound if it does not exist
    pub async fn remove_existing(&self, region: &str, hash: &str) -> ForgeResult<()> {
        if self.remove(region, hash).await? {
            Ok(())
        } else {
            Err(ForgeError::CacheEntryNotFound {
                region: region.to_string(),
                hash: hash.to_string(),
            })
        }
    }

    /// All entries, optionally limited to one region, most recently used first
    pub async fn list(&self, region: Option<&str>) -> ForgeResult<Vec<ImageCacheEntry>> {
        let mut entries: Vec<_> = self
            .read_index()
            .await?
            .entries
            .into_iter()
            .filter(|e| region.is_none_or(|r| e.region == r))
            .collect();
        entries.sort_by(|a, b| b.last_used.cmp(&a.last_used));
        Ok(entries)
    }

    /// Drop index entries unused for longer than `max_age`.
    ///
    /// Only the index is touched; the underlying images are never deleted.
    pub async fn evict_older_than(&self, max_age: Duration) -> ForgeResult<Vec<ImageCacheEntry>> {
        let _guard = self.write_lock.lock().await;
        let mut index = self.read_index().await?;
        let now = Utc::now();

        let (evicted, kept): (Vec<_>, Vec<_>) = index
            .entries
            .into_iter()
            .partition(|e| e.unused_for(max_age, now));
        index.entries = kept;

        if !evicted.is_empty() {
            self.write_index(&index).await?;
            info!("Evicted {} cache entr(ies)", evicted.len());
        }
        Ok(evicted)
    }

    async fn touch(&self, region: &str, hash: &str) -> ForgeResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut index = self.read_index().await?;
        index.touch(region, hash, Utc::now());
        self.write_index(&index).await
    }

    async fn read_index(&self) -> ForgeResult<CacheIndex> {
        if !self.path.exists() {
            return Ok(CacheIndex::default());
        }

        let content = fs::read_to_string(&self.path).await.map_err(|e| {
            ForgeError::io(format!("reading image cache {}", self.path.display()), e)
        })?;
        if content.trim().is_empty() {
            return Ok(CacheIndex::default());
        }
        Ok(serde_json::from_str(&content)?)
    }

    async fn write_index(&self, index: &CacheIndex) -> ForgeResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| ForgeError::io("creating state directory", e))?;
        }

        // Write-then-rename so readers never see a half-written index
        let tmp = self.path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(index)?;
        fs::write(&tmp, content)
            .await
            .map_err(|e| ForgeError::io(format!("writing {}", tmp.display()), e))?;
        fs::rename(&tmp, &self.path).await.map_err(|e| {
            ForgeError::io(format!("replacing image cache {}", self.path.display()), e)
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::SoftwareSpec;
    use crate::provider::MemoryCloud;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn fingerprint() -> Fingerprint {
        Fingerprint::compute(&SoftwareSpec::new(
            ["gcc@11.3.0", "openmpi@4.1.4"],
            "rocky9",
            "0.21.0",
            "5.3.1",
        ))
        .unwrap()
    }

    fn setup() -> (TempDir, Arc<MemoryCloud>, ImageCache) {
        let dir = TempDir::new().unwrap();
        let cloud = Arc::new(MemoryCloud::new());
        let cache = ImageCache::new(dir.path().join("image-cache.json"), cloud.clone());
        (dir, cloud, cache)
    }

    #[tokio::test]
    async fn record_then_lookup_is_region_scoped() {
        let (_dir, cloud, cache) = setup();
        let fp = fingerprint();
        cloud.insert_image("us-east-1", "img-1", BTreeMap::new());

        cache.record("us-east-1", "img-1", &fp, "hpc").await.unwrap();

        let hit = cache.lookup("us-east-1", &fp).await.unwrap().unwrap();
        assert_eq!(hit.image_id, "img-1");
        assert_eq!(hit.source, HitSource::Local);

        assert!(cache.lookup("us-west-2", &fp).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stale_hit_is_evicted() {
        let (_dir, _cloud, cache) = setup();
        let fp = fingerprint();

        // Recorded, but the image does not exist upstream
        cache.record("us-east-1", "img-gone", &fp, "hpc").await.unwrap();

        assert!(cache.lookup("us-east-1", &fp).await.unwrap().is_none());
        assert!(cache.list(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn pending_image_is_not_a_hit() {
        let (_dir, cloud, cache) = setup();
        let fp = fingerprint();
        cloud.insert_image("us-east-1", "img-1", BTreeMap::new());
        cloud.set_image_state("img-1", ImageState::Pending);
        cache.record("us-east-1", "img-1", &fp, "hpc").await.unwrap();

        assert!(cache.lookup("us-east-1", &fp).await.unwrap().is_none());
        assert!(cache.get("us-east-1", &fp.hash).await.unwrap().is_some());

        // The image finished creating after the first describe
        let hit = cache.lookup("us-east-1", &fp).await.unwrap().unwrap();
        assert_eq!(hit.image_id, "img-1");
        assert_eq!(hit.source, HitSource::Local);
    }

    #[tokio::test]
    async fn failed_image_is_evicted() {
        let (_dir, cloud, cache) = setup();
        let fp = fingerprint();
        cloud.insert_image("us-east-1", "img-1", BTreeMap::new());
        cloud.set_image_state("img-1", ImageState::Failed);
        cache.record("us-east-1", "img-1", &fp, "hpc").await.unwrap();

        assert!(cache.lookup("us-east-1", &fp).await.unwrap().is_none());
        assert!(cache.list(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn local_miss_falls_back_to_newest_tagged_image() {
        let (_dir, cloud, cache) = setup();
        let fp = fingerprint();
        let mut tags = fp.tags();
        tags.insert(tags::TEMPLATE.to_string(), "hpc".to_string());

        cloud.insert_image_at("us-east-1", "img-old", tags.clone(), Utc::now() - Duration::days(2));
        cloud.insert_image_at("us-east-1", "img-new", tags.clone(), Utc::now());
        cloud.insert_image_at("eu-west-1", "img-eu", tags, Utc::now());

        let hit = cache.lookup("us-east-1", &fp).await.unwrap().unwrap();
        assert_eq!(hit.image_id, "img-new");
        assert_eq!(hit.source, HitSource::Provider);

        // Recorded locally for next time
        let entry = cache.get("us-east-1", &fp.hash).await.unwrap().unwrap();
        assert_eq!(entry.image_id, "img-new");
        assert_eq!(entry.template, "hpc");
    }

    #[tokio::test]
    async fn provider_failure_is_not_a_miss() {
        let (_dir, cloud, cache) = setup();
        cloud.fail_always("find_images_by_tag");

        let err = cache.lookup("us-east-1", &fingerprint()).await.unwrap_err();
        assert!(matches!(err, ForgeError::Provider { .. }));
    }

    #[tokio::test]
    async fn evict_only_touches_index() {
        let (_dir, cloud, cache) = setup();
        let fp = fingerprint();
        cloud.insert_image("us-east-1", "img-1", BTreeMap::new());
        cache.record("us-east-1", "img-1", &fp, "hpc").await.unwrap();

        let evicted = cache.evict_older_than(Duration::zero() - Duration::seconds(1)).await.unwrap();
        assert_eq!(evicted.len(), 1);
        assert!(cache.list(None).await.unwrap().is_empty());
        assert!(cloud.image("img-1").is_some());
    }

    #[tokio::test]
    async fn evict_keeps_recent_entries() {
        let (_dir, _cloud, cache) = setup();
        cache.record("us-east-1", "img-1", &fingerprint(), "hpc").await.unwrap();

        let evicted = cache.evict_older_than(Duration::days(30)).await.unwrap();
        assert!(evicted.is_empty());
        assert_eq!(cache.list(Some("us-east-1")).await.unwrap().len(), 1);
        assert!(cache.list(Some("us-west-2")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn remove_existing_reports_not_found() {
        let (_dir, _cloud, cache) = setup();
        let err = cache.remove_existing("us-east-1", "nope").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn index_is_human_readable_json() {
        let (_dir, _cloud, cache) = setup();
        cache.record("us-east-1", "img-1", &fingerprint(), "hpc").await.unwrap();

        let text = std::fs::read_to_string(cache.path()).unwrap();
        assert!(text.contains("\"image_id\": \"img-1\""));
        assert!(text.contains("\"version\": 1"));
    }
}
