//! Local picture of the account: the container set plus, per container, a
//! lazily fetched blob listing.
//!
//! The cache never expires entries on its own. A populated listing stays
//! authoritative until the driver invalidates it, so changes made by other
//! clients are not seen until then.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, info};

use super::path::{ROOT_KEY, container_key};
use crate::cadapter::client::{BlobBackend, StorageError, StorageResult};
use crate::cadapter::listing::BlobPager;

pub const FILE_PERM: u32 = 0o644;
pub const DIR_PERM: u32 = 0o755;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobStat {
    pub size: u64,
    pub mtime: SystemTime,
    pub mode: u32,
}

impl BlobStat {
    pub fn new(size: u64, mtime: SystemTime) -> Self {
        Self {
            size,
            mtime,
            mode: libc::S_IFREG as u32 | FILE_PERM,
        }
    }
}

pub type BlobMap = BTreeMap<String, BlobStat>;

/// Blob listing state of one container.
#[derive(Debug, Clone, Default)]
pub enum BlobListing {
    /// Never listed, or invalidated.
    #[default]
    Unfetched,
    /// Listed and known to hold nothing.
    Empty,
    Populated(Arc<BlobMap>),
}

#[derive(Debug, Clone)]
pub struct Container {
    pub name: String,
    pub last_modified: SystemTime,
    pub blobs: BlobListing,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("no such container: {0}")]
    NoSuchContainer(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub struct MetadataCache<B: ?Sized> {
    backend: Arc<B>,
    containers: RwLock<BTreeMap<String, Container>>,
}

impl<B: BlobBackend + ?Sized> MetadataCache<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self {
            backend,
            containers: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Replace the whole container set. Every blob listing is dropped.
    pub async fn refresh_containers(&self) -> StorageResult<()> {
        let listed = self.backend.list_containers().await?;
        let mut map = BTreeMap::new();
        let mut newest: Option<SystemTime> = None;
        for entry in listed {
            newest = Some(newest.map_or(entry.last_modified, |t| t.max(entry.last_modified)));
            map.insert(
                container_key(&entry.name),
                Container {
                    name: entry.name,
                    last_modified: entry.last_modified,
                    blobs: BlobListing::Unfetched,
                },
            );
        }
        map.insert(
            ROOT_KEY.to_string(),
            Container {
                name: String::new(),
                last_modified: newest.unwrap_or_else(SystemTime::now),
                blobs: BlobListing::Empty,
            },
        );
        info!(containers = map.len() - 1, "container set refreshed");
        *self.containers.write() = map;
        Ok(())
    }

    pub fn containers(&self) -> Vec<Container> {
        self.containers.read().values().cloned().collect()
    }

    pub fn container(&self, key: &str) -> Option<Container> {
        self.containers.read().get(key).cloned()
    }

    /// Names of all real containers, root excluded.
    pub fn container_names(&self) -> Vec<String> {
        self.containers
            .read()
            .iter()
            .filter(|(key, _)| key.as_str() != ROOT_KEY)
            .map(|(_, c)| c.name.clone())
            .collect()
    }

    /// Blob listing of the container at `key`, fetched on first use.
    ///
    /// The lock is released while pages are fetched; the finished map is
    /// swapped in afterwards, so concurrent populations race benignly.
    pub async fn blobs_of(&self, key: &str) -> Result<Arc<BlobMap>, CacheError> {
        let name = {
            let guard = self.containers.read();
            let container = guard
                .get(key)
                .ok_or_else(|| CacheError::NoSuchContainer(key.to_string()))?;
            match &container.blobs {
                BlobListing::Populated(map) => return Ok(map.clone()),
                BlobListing::Empty => return Ok(Arc::default()),
                BlobListing::Unfetched => container.name.clone(),
            }
        };

        let entries = BlobPager::new(self.backend.clone(), name.as_str(), None)
            .collect_all()
            .await?;
        let map: BlobMap = entries
            .into_iter()
            .filter(|entry| !entry.name.contains('/'))
            .map(|entry| (entry.name, BlobStat::new(entry.size, entry.last_modified)))
            .collect();
        debug!(container = %name, blobs = map.len(), "populated blob listing");

        let map = Arc::new(map);
        let mut guard = self.containers.write();
        let container = guard
            .get_mut(key)
            .ok_or_else(|| CacheError::NoSuchContainer(key.to_string()))?;
        container.blobs = if map.is_empty() {
            BlobListing::Empty
        } else {
            BlobListing::Populated(map.clone())
        };
        Ok(map)
    }

    pub async fn blob(&self, key: &str, name: &str) -> Result<Option<BlobStat>, CacheError> {
        Ok(self.blobs_of(key).await?.get(name).copied())
    }

    /// Drop one blob entry, or with `name == None` forget the whole listing.
    pub fn invalidate(&self, key: &str, name: Option<&str>) {
        let mut guard = self.containers.write();
        let Some(container) = guard.get_mut(key) else {
            return;
        };
        match name {
            Some(name) => {
                if let BlobListing::Populated(map) = &mut container.blobs {
                    Arc::make_mut(map).remove(name);
                    if map.is_empty() {
                        container.blobs = BlobListing::Empty;
                    }
                }
            }
            None if key != ROOT_KEY => container.blobs = BlobListing::Unfetched,
            None => {}
        }
    }

    /// Record a blob after a create or a successful upload. Unfetched listings
    /// are left alone; the next population picks the blob up remotely.
    pub fn upsert_blob(&self, key: &str, name: &str, stat: BlobStat) {
        if key == ROOT_KEY {
            return;
        }
        let mut guard = self.containers.write();
        let Some(container) = guard.get_mut(key) else {
            return;
        };
        match &mut container.blobs {
            BlobListing::Unfetched => {}
            BlobListing::Empty => {
                let mut map = BlobMap::new();
                map.insert(name.to_string(), stat);
                container.blobs = BlobListing::Populated(Arc::new(map));
            }
            BlobListing::Populated(map) => {
                Arc::make_mut(map).insert(name.to_string(), stat);
            }
        }
    }

    pub fn remove_container(&self, key: &str) {
        if key != ROOT_KEY {
            self.containers.write().remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cadapter::memory::{MemoryBackend, Op};
    use bytes::Bytes;

    fn cache_with(blobs: &[(&str, &str)]) -> (Arc<MemoryBackend>, MetadataCache<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new().with_page_size(2));
        for (container, blob) in blobs {
            backend.insert_blob(container, blob, Bytes::from_static(b"data"));
        }
        let cache = MetadataCache::new(backend.clone());
        (backend, cache)
    }

    #[tokio::test]
    async fn refresh_builds_root_and_containers() {
        let (backend, cache) = cache_with(&[("alpha", "a"), ("beta", "b")]);
        backend.insert_container("gamma");
        cache.refresh_containers().await.unwrap();

        assert_eq!(cache.container_names(), vec!["alpha", "beta", "gamma"]);
        let root = cache.container(ROOT_KEY).unwrap();
        assert!(matches!(root.blobs, BlobListing::Empty));
        let newest = cache
            .containers()
            .iter()
            .filter(|c| !c.name.is_empty())
            .map(|c| c.last_modified)
            .max()
            .unwrap();
        assert_eq!(root.last_modified, newest);
        assert!(matches!(
            cache.container("/alpha").unwrap().blobs,
            BlobListing::Unfetched
        ));
    }

    #[tokio::test]
    async fn listing_is_fetched_once_and_skips_nested_names() {
        let (backend, cache) = cache_with(&[("c", "a"), ("c", "b"), ("c", "dir/x"), ("c", "d")]);
        cache.refresh_containers().await.unwrap();

        let blobs = cache.blobs_of("/c").await.unwrap();
        assert_eq!(blobs.keys().collect::<Vec<_>>(), vec!["a", "b", "d"]);
        let calls = backend.calls(Op::ListBlobs);
        assert_eq!(calls, 2);

        assert_eq!(cache.blob("/c", "a").await.unwrap().unwrap().size, 4);
        assert_eq!(cache.blob("/c", "zz").await.unwrap(), None);
        assert_eq!(backend.calls(Op::ListBlobs), calls);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_populations_agree() {
        let names: Vec<String> = (0..9).map(|i| format!("blob-{i}")).collect();
        let pairs: Vec<(&str, &str)> = names.iter().map(|n| ("c", n.as_str())).collect();
        let (backend, cache) = cache_with(&pairs);
        cache.refresh_containers().await.unwrap();
        let cache = Arc::new(cache);

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.blobs_of("/c").await })
            })
            .collect();
        for task in tasks {
            let map = task.await.unwrap().unwrap();
            assert_eq!(map.keys().cloned().collect::<Vec<_>>(), names);
        }

        let BlobListing::Populated(stored) = cache.container("/c").unwrap().blobs else {
            panic!("listing not populated");
        };
        assert_eq!(stored.len(), names.len());
        let calls = backend.calls(Op::ListBlobs);
        let again = cache.blobs_of("/c").await.unwrap();
        assert!(Arc::ptr_eq(&stored, &again));
        assert_eq!(backend.calls(Op::ListBlobs), calls);
    }

    #[tokio::test]
    async fn invalidate_whole_listing_forces_refetch() {
        let (backend, cache) = cache_with(&[("c", "a")]);
        cache.refresh_containers().await.unwrap();
        cache.blobs_of("/c").await.unwrap();

        backend.insert_blob("c", "late", Bytes::new());
        assert!(cache.blob("/c", "late").await.unwrap().is_none());

        cache.invalidate("/c", None);
        assert!(cache.blob("/c", "late").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn invalidate_and_upsert_single_entries() {
        let (_backend, cache) = cache_with(&[("c", "a")]);
        cache.refresh_containers().await.unwrap();
        cache.blobs_of("/c").await.unwrap();

        cache.invalidate("/c", Some("a"));
        assert!(matches!(
            cache.container("/c").unwrap().blobs,
            BlobListing::Empty
        ));

        let stat = BlobStat::new(7, SystemTime::now());
        cache.upsert_blob("/c", "new", stat);
        assert_eq!(cache.blob("/c", "new").await.unwrap(), Some(stat));
        assert_eq!(stat.mode & libc::S_IFMT as u32, libc::S_IFREG as u32);
    }

    #[tokio::test]
    async fn unknown_container_and_removal() {
        let (_backend, cache) = cache_with(&[("c", "a")]);
        cache.refresh_containers().await.unwrap();
        assert_eq!(
            cache.blobs_of("/nope").await.unwrap_err(),
            CacheError::NoSuchContainer("/nope".into())
        );
        cache.remove_container("/c");
        assert!(cache.container("/c").is_none());
        assert!(cache.container(ROOT_KEY).is_some());
    }

    #[tokio::test]
    async fn refresh_discards_blob_listings() {
        let (backend, cache) = cache_with(&[("c", "a")]);
        cache.refresh_containers().await.unwrap();
        cache.blobs_of("/c").await.unwrap();
        cache.refresh_containers().await.unwrap();
        assert!(matches!(
            cache.container("/c").unwrap().blobs,
            BlobListing::Unfetched
        ));
        cache.blobs_of("/c").await.unwrap();
        assert_eq!(backend.calls(Op::ListBlobs), 2);
    }

    #[tokio::test]
    async fn listing_failure_leaves_state_unfetched() {
        let (backend, cache) = cache_with(&[("c", "a")]);
        cache.refresh_containers().await.unwrap();
        backend.fail_next(Op::ListBlobs, StorageError::transient("timeout"));
        assert!(matches!(
            cache.blobs_of("/c").await,
            Err(CacheError::Storage(StorageError::Transient(_)))
        ));
        assert!(matches!(
            cache.container("/c").unwrap().blobs,
            BlobListing::Unfetched
        ));
        assert_eq!(cache.blobs_of("/c").await.unwrap().len(), 1);
    }
}
